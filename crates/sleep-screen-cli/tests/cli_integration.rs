use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::{json, Value};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_sscreen<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_sscreen"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute sscreen binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_sscreen(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "sscreen command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }
    parse_stdout(&output)
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("invalid JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn write_input(dir: &Path, name: &str, value: &Value) -> PathBuf {
    let path = dir.join(name);
    let body = serde_json::to_string_pretty(value)
        .unwrap_or_else(|err| panic!("failed to serialize fixture {name}: {err}"));
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
    path
}

fn short_sleep_profile() -> Value {
    json!({
        "sleepDuration": 4,
        "sleepQuality": 3,
        "stressLevel": 5,
        "bmiCategory": "Normal",
        "bloodPressure": "120/80",
        "age": 30,
        "physicalActivity": 40
    })
}

fn apnea_profile() -> Value {
    json!({
        "Sleep Duration": 8,
        "Quality of Sleep": 8,
        "Stress Level": 3,
        "BMI Category": "Obese",
        "Blood Pressure": "150/95",
        "Age": 45,
        "Physical Activity Level": 10
    })
}

fn strings(values: &[Value]) -> Vec<&str> {
    values.iter().filter_map(Value::as_str).collect()
}

#[test]
fn db_schema_version_and_migrate_flow() {
    let sandbox = unique_temp_dir("sscreen-db-flow");
    let db_path = sandbox.join("graph.sqlite3");

    let before = run_json(["--db", path_str(&db_path), "db", "schema-version"]);
    assert_eq!(as_i64(&before, "current_version"), 0);
    assert_eq!(as_str(&before, "contract_version"), "cli.v1");
    assert_eq!(before.get("up_to_date"), Some(&Value::Bool(false)));

    let dry_run = run_json(["--db", path_str(&db_path), "db", "migrate", "--dry-run"]);
    assert_eq!(dry_run.get("would_apply_versions"), Some(&json!([1, 2])));
    let still_empty = run_json(["--db", path_str(&db_path), "db", "schema-version"]);
    assert_eq!(as_i64(&still_empty, "current_version"), 0);

    let migrated = run_json(["--db", path_str(&db_path), "db", "migrate"]);
    assert_eq!(as_i64(&migrated, "after_version"), 2);
    assert_eq!(migrated.get("up_to_date"), Some(&Value::Bool(true)));

    let integrity = run_json(["--db", path_str(&db_path), "db", "integrity-check"]);
    assert_eq!(integrity.get("healthy"), Some(&Value::Bool(true)));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn screen_persists_and_case_can_be_shown() {
    let sandbox = unique_temp_dir("sscreen-screen-flow");
    let db_path = sandbox.join("graph.sqlite3");
    let input = write_input(&sandbox, "short-sleep.json", &short_sleep_profile());

    let report = run_json([
        "--db",
        path_str(&db_path),
        "screen",
        "--input",
        path_str(&input),
        "--subject",
        "patient-7",
    ]);
    validate_schema("screen.response.schema.json", &report);
    assert_eq!(as_str(&report, "diagnosis"), "Insomnia");
    assert_eq!(as_str(&report, "insomniaRisk"), "high");
    assert_eq!(as_str(&report, "apneaRisk"), "low");
    assert_eq!(strings(as_array(&report, "firedRules")), vec!["R1", "R8", "R11", "R13", "R17"]);
    assert!(strings(as_array(&report, "recommendations")).contains(&"sleep-hygiene"));

    let case_ref = as_str(&report, "caseRef").to_string();
    let shown = run_json(["--db", path_str(&db_path), "case", "show", "--case-ref", &case_ref]);
    assert_eq!(as_str(&shown, "caseId"), case_ref);
    assert_eq!(as_str(&shown, "personId"), "patient-7");
    assert_eq!(as_array(&shown, "firedRules"), as_array(&report, "firedRules"));

    let person =
        run_json(["--db", path_str(&db_path), "person", "show", "--person-id", "patient-7"]);
    assert_eq!(person["person"]["totalCases"], json!(1));
    assert_eq!(person["cases"][0]["caseId"], json!(case_ref));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn screen_without_persistence_has_no_case_ref() {
    let sandbox = unique_temp_dir("sscreen-no-persist");
    let db_path = sandbox.join("graph.sqlite3");
    let input = write_input(&sandbox, "apnea.json", &apnea_profile());

    let report = run_json([
        "--db",
        path_str(&db_path),
        "screen",
        "--input",
        path_str(&input),
        "--no-persist",
    ]);
    validate_schema("screen.response.schema.json", &report);
    assert_eq!(as_str(&report, "diagnosis"), "SleepApnea");
    assert!(report.get("caseRef").is_none());
    assert_eq!(
        strings(as_array(&report, "recommendations")),
        vec!["physical-activity", "weight-management", "apnea-evaluation"]
    );

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn unreachable_store_still_returns_a_diagnosis() {
    let sandbox = unique_temp_dir("sscreen-unreachable");
    let db_path = sandbox.join("missing-dir").join("nested").join("graph.sqlite3");
    let input = write_input(&sandbox, "apnea.json", &apnea_profile());

    let report =
        run_json(["--db", path_str(&db_path), "screen", "--input", path_str(&input)]);
    assert_eq!(as_str(&report, "diagnosis"), "SleepApnea");
    assert!(report.get("caseRef").is_none());

    let analytics =
        run_json(["--db", path_str(&db_path), "analytics", "rule-frequency"]);
    assert!(as_array(&analytics, "items").is_empty());

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn invalid_input_lists_every_missing_field() {
    let sandbox = unique_temp_dir("sscreen-invalid");
    let db_path = sandbox.join("graph.sqlite3");
    let input = write_input(&sandbox, "partial.json", &json!({ "sleepDuration": 7, "age": null }));

    let output =
        run_sscreen(["--db", path_str(&db_path), "screen", "--input", path_str(&input)]);
    assert_eq!(output.status.code(), Some(2));
    let body = parse_stdout(&output);
    assert_eq!(as_str(&body, "status"), "invalid_input");
    let fields = as_array(&body, "errors")
        .iter()
        .filter_map(|error| error.get("field").and_then(Value::as_str))
        .collect::<Vec<_>>();
    assert_eq!(fields, vec!["age", "sleepQuality", "stressLevel", "bmiCategory", "bloodPressure"]);

    let not_object = write_input(&sandbox, "array.json", &json!([1, 2, 3]));
    let output =
        run_sscreen(["--db", path_str(&db_path), "screen", "--input", path_str(&not_object)]);
    assert_eq!(output.status.code(), Some(2));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn analytics_reflect_logged_sessions() {
    let sandbox = unique_temp_dir("sscreen-analytics");
    let db_path = sandbox.join("graph.sqlite3");
    let insomnia = write_input(&sandbox, "short-sleep.json", &short_sleep_profile());
    let apnea = write_input(&sandbox, "apnea.json", &apnea_profile());

    for (input, subject) in [(&insomnia, "alice"), (&insomnia, "alice"), (&apnea, "bob")] {
        run_json([
            "--db",
            path_str(&db_path),
            "screen",
            "--input",
            path_str(input),
            "--subject",
            subject,
        ]);
    }

    let frequency =
        run_json(["--db", path_str(&db_path), "analytics", "rule-frequency", "--limit", "1"]);
    validate_schema("analytics.response.schema.json", &frequency);
    let items = as_array(&frequency, "items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["ruleId"], json!("R1"));
    assert_eq!(items[0]["count"], json!(2));

    let sequences = run_json(["--db", path_str(&db_path), "analytics", "sequences"]);
    validate_schema("analytics.response.schema.json", &sequences);
    let groups = as_array(&sequences, "items");
    assert_eq!(groups[0]["diagnosis"], json!("Insomnia"));
    assert_eq!(groups[0]["patterns"][0]["count"], json!(2));

    let bob_sequences =
        run_json(["--db", path_str(&db_path), "analytics", "sequences", "--person", "bob"]);
    validate_schema("analytics.response.schema.json", &bob_sequences);
    let bob_groups = as_array(&bob_sequences, "items");
    assert_eq!(bob_groups.len(), 1);
    assert_eq!(bob_groups[0]["diagnosis"], json!("SleepApnea"));
    assert_eq!(bob_groups[0]["totalCases"], json!(1));

    let network = run_json([
        "--db",
        path_str(&db_path),
        "analytics",
        "network",
        "--person",
        "bob",
        "--limit",
        "50",
    ]);
    validate_schema("analytics.response.schema.json", &network);
    assert_eq!(as_array(&network, "items").len(), 7);
    assert_eq!(as_str(&network, "person"), "bob");

    let pairs = run_json([
        "--db",
        path_str(&db_path),
        "analytics",
        "co-occurrence",
        "--person",
        "alice",
        "--limit",
        "50",
    ]);
    validate_schema("analytics.response.schema.json", &pairs);
    assert_eq!(as_array(&pairs, "items").len(), 10);

    let diagnoses = run_json(["--db", path_str(&db_path), "analytics", "diagnoses"]);
    validate_schema("analytics.response.schema.json", &diagnoses);
    assert_eq!(
        as_array(&diagnoses, "items"),
        &vec![
            json!({ "diagnosis": "Insomnia", "count": 2 }),
            json!({ "diagnosis": "SleepApnea", "count": 1 }),
        ]
    );

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn rules_list_reports_the_knowledge_base() {
    let rules = run_json(["rules", "list"]);
    assert_eq!(as_str(&rules, "knowledge_base_version"), "sleep-kb.v1");
    let entries = as_array(&rules, "rules");
    assert_eq!(entries.len(), 20);
    assert_eq!(entries[0]["id"], json!("R1"));
    assert_eq!(entries[0]["category"], json!("insomnia"));
    assert_eq!(entries[19]["category"], json!("recommendation"));
}

#[test]
fn config_file_supplies_database_and_limit() {
    let sandbox = unique_temp_dir("sscreen-config");
    let db_path = sandbox.join("configured.sqlite3");
    let config_path = sandbox.join("sscreen.yaml");
    fs::write(
        &config_path,
        format!("db_path: {}\ndefault_limit: 3\nlog_filter: error\n", path_str(&db_path)),
    )
    .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    let input = write_input(&sandbox, "short-sleep.json", &short_sleep_profile());

    run_json(["--config", path_str(&config_path), "screen", "--input", path_str(&input)]);
    assert!(db_path.exists(), "configured database should have been created");

    let frequency =
        run_json(["--config", path_str(&config_path), "analytics", "rule-frequency"]);
    assert_eq!(as_i64(&frequency, "limit"), 3);
    assert_eq!(as_array(&frequency, "items").len(), 3);

    let bad_config = sandbox.join("bad.yaml");
    fs::write(&bad_config, "unknown_key: true\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    let output = run_sscreen(["--config", path_str(&bad_config), "rules", "list"]);
    assert!(!output.status.success());

    let _ = fs::remove_dir_all(&sandbox);
}
