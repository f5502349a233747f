use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use sleep_screen_api::{AnalyticsQuery, ScreeningApi, ScreeningConfig, ScreeningRequest};
use sleep_screen_core::{raw_input, ScreeningError, KNOWLEDGE_BASE_VERSION};
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const EXIT_INVALID_INPUT: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "sscreen")]
#[command(about = "Sleep-disorder screening CLI")]
struct Cli {
    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Provenance database path; overrides the configured one.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Screen(ScreenArgs),
    Analytics {
        #[command(subcommand)]
        command: AnalyticsCommand,
    },
    Case {
        #[command(subcommand)]
        command: CaseCommand,
    },
    Person {
        #[command(subcommand)]
        command: PersonCommand,
    },
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct ScreenArgs {
    /// JSON object of patient attributes; `-` or absent reads stdin.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    subject: Option<String>,
    /// Skip the provenance graph write.
    #[arg(long, default_value_t = false)]
    no_persist: bool,
}

#[derive(Debug, Args)]
struct ScopeArgs {
    #[arg(long)]
    person: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

impl ScopeArgs {
    fn query(&self) -> AnalyticsQuery {
        AnalyticsQuery {
            person: self.person.clone(),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Args)]
struct PersonScopeArgs {
    #[arg(long)]
    person: Option<String>,
}

#[derive(Debug, Subcommand)]
enum AnalyticsCommand {
    RuleFrequency(ScopeArgs),
    Sequences(ScopeArgs),
    CoOccurrence(ScopeArgs),
    Network(ScopeArgs),
    Diagnoses(PersonScopeArgs),
}

#[derive(Debug, Subcommand)]
enum CaseCommand {
    Show {
        #[arg(long)]
        case_ref: String,
    },
}

#[derive(Debug, Subcommand)]
enum PersonCommand {
    Show {
        #[arg(long)]
        person_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum RulesCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn to_json(value: &impl Serialize) -> Result<Value> {
    serde_json::to_value(value).context("failed to serialize command output")
}

fn load_config(cli: &Cli) -> Result<ScreeningConfig> {
    let config = match &cli.config {
        Some(path) => ScreeningConfig::load(path)?,
        None => ScreeningConfig::default(),
    };
    Ok(match &cli.db {
        Some(db) => config.with_db_path(db.clone()),
        None => config,
    })
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.log_filter);
    let api = ScreeningApi::new(config);

    match cli.command {
        Command::Screen(args) => run_screen(&api, &args),
        Command::Analytics { command } => run_analytics(&api, command),
        Command::Case { command } => run_case(&api, command),
        Command::Person { command } => run_person(&api, command),
        Command::Rules { command } => run_rules(&api, &command),
        Command::Db { command } => run_db(&api, &command),
    }
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) if path != Path::new("-") => fs::read_to_string(path)
            .with_context(|| format!("failed to read screening input {}", path.display())),
        _ => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read screening input from stdin")?;
            Ok(raw)
        }
    }
}

fn run_screen(api: &ScreeningApi, args: &ScreenArgs) -> Result<ExitCode> {
    let raw = read_input(args.input.as_deref())?;
    let value: Value = serde_json::from_str(&raw).context("screening input is not valid JSON")?;

    let request = match raw_input(value) {
        Ok(attributes) => ScreeningRequest {
            attributes,
            persist: !args.no_persist,
            subject_id: args.subject.clone(),
        },
        Err(err) => return emit_invalid_input(&err),
    };

    match api.screen(&request) {
        Ok(report) => {
            emit_json(to_json(&report)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => emit_invalid_input(&err),
    }
}

fn emit_invalid_input(err: &ScreeningError) -> Result<ExitCode> {
    let errors = match err {
        ScreeningError::Validation(validation) => to_json(&validation.errors)?,
        ScreeningError::NotAnObject(_) => serde_json::json!([{
            "field": "$",
            "message": err.to_string(),
        }]),
    };
    emit_json(serde_json::json!({
        "status": "invalid_input",
        "message": err.to_string(),
        "errors": errors,
    }))?;
    Ok(ExitCode::from(EXIT_INVALID_INPUT))
}

fn run_analytics(api: &ScreeningApi, command: AnalyticsCommand) -> Result<ExitCode> {
    let (aggregate, query, items) = match command {
        AnalyticsCommand::RuleFrequency(scope) => {
            let query = scope.query();
            ("rule_frequency", query.clone(), to_json(&api.rule_frequency(&query))?)
        }
        AnalyticsCommand::Sequences(scope) => {
            let query = scope.query();
            ("sequences", query.clone(), to_json(&api.sequence_patterns(&query))?)
        }
        AnalyticsCommand::CoOccurrence(scope) => {
            let query = scope.query();
            ("co_occurrence", query.clone(), to_json(&api.co_occurrence(&query))?)
        }
        AnalyticsCommand::Network(scope) => {
            let query = scope.query();
            ("network", query.clone(), to_json(&api.rule_network(&query))?)
        }
        AnalyticsCommand::Diagnoses(scope) => {
            let query = AnalyticsQuery {
                person: scope.person,
                limit: None,
            };
            ("diagnoses", query.clone(), to_json(&api.diagnosis_distribution(&query))?)
        }
    };

    emit_json(serde_json::json!({
        "aggregate": aggregate,
        "person": query.person,
        "limit": query.limit.unwrap_or(api.config().default_limit),
        "items": items,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn run_case(api: &ScreeningApi, command: CaseCommand) -> Result<ExitCode> {
    match command {
        CaseCommand::Show { case_ref } => {
            let stored = api.case_show(&case_ref)?;
            emit_json(to_json(&stored)?)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_person(api: &ScreeningApi, command: PersonCommand) -> Result<ExitCode> {
    match command {
        PersonCommand::Show { person_id } => {
            let report = api.person_show(&person_id)?;
            emit_json(to_json(&report)?)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_rules(api: &ScreeningApi, command: &RulesCommand) -> Result<ExitCode> {
    match command {
        RulesCommand::List => {
            emit_json(serde_json::json!({
                "knowledge_base_version": KNOWLEDGE_BASE_VERSION,
                "rules": to_json(&api.rules_list())?,
            }))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_db(api: &ScreeningApi, command: &DbCommand) -> Result<ExitCode> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
            }))?;
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(to_json(&result)?)?;
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let mut value = to_json(&report)?;
            if let Value::Object(object) = &mut value {
                object.insert("healthy".to_string(), Value::Bool(report.is_healthy()));
            }
            emit_json(value)?;
        }
    }
    Ok(ExitCode::SUCCESS)
}
