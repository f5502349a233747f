use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sleep_screen_core::{
    find_rule, Diagnosis, FactSet, RawInput, RiskLevel, RuleCategory, ScreeningOutcome,
    KNOWLEDGE_BASE_VERSION,
};
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

/// Person node shared by every session submitted without a subject id.
pub const GUEST_PERSON_ID: &str = "guest";

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS persons (
  person_id TEXT PRIMARY KEY,
  total_cases INTEGER NOT NULL CHECK (total_cases >= 1),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS rules (
  rule_id TEXT PRIMARY KEY,
  category TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 1)
);

CREATE TABLE IF NOT EXISTS diagnoses (
  label TEXT PRIMARY KEY CHECK (
    label IN ('Insomnia', 'SleepApnea', 'MixedSleepDisorder', 'NoSleepDisorder', 'Inconclusive')
  )
);

CREATE TABLE IF NOT EXISTS cases (
  case_id TEXT PRIMARY KEY,
  person_id TEXT NOT NULL REFERENCES persons(person_id),
  insomnia_risk TEXT NOT NULL CHECK (insomnia_risk IN ('unknown', 'low', 'moderate', 'high')),
  apnea_risk TEXT NOT NULL CHECK (apnea_risk IN ('unknown', 'low', 'moderate', 'high')),
  facts_json TEXT NOT NULL,
  input_digest TEXT NOT NULL,
  knowledge_base_version TEXT NOT NULL,
  passes INTEGER NOT NULL CHECK (passes >= 1),
  capped INTEGER NOT NULL CHECK (capped IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS case_diagnosis (
  case_id TEXT PRIMARY KEY REFERENCES cases(case_id),
  label TEXT NOT NULL REFERENCES diagnoses(label)
);

CREATE TABLE IF NOT EXISTS fired_rules (
  case_id TEXT NOT NULL REFERENCES cases(case_id),
  ord INTEGER NOT NULL CHECK (ord >= 1),
  rule_id TEXT NOT NULL REFERENCES rules(rule_id),
  PRIMARY KEY (case_id, ord),
  UNIQUE (case_id, rule_id)
);

CREATE TABLE IF NOT EXISTS rule_next (
  from_rule TEXT NOT NULL REFERENCES rules(rule_id),
  to_rule TEXT NOT NULL REFERENCES rules(rule_id),
  weight INTEGER NOT NULL CHECK (weight >= 1),
  PRIMARY KEY (from_rule, to_rule)
);
";

const MIGRATION_002_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_cases_person ON cases(person_id, created_at);
CREATE INDEX IF NOT EXISTS idx_fired_rules_rule ON fired_rules(rule_id);
CREATE INDEX IF NOT EXISTS idx_case_diagnosis_label ON case_diagnosis(label);
CREATE INDEX IF NOT EXISTS idx_rule_next_weight ON rule_next(weight DESC);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// One screening session as it is written to the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseRecord {
    pub person_id: String,
    pub diagnosis: Diagnosis,
    pub insomnia_risk: RiskLevel,
    pub apnea_risk: RiskLevel,
    pub fired_rules: Vec<String>,
    pub facts: FactSet,
    pub input_digest: String,
    pub knowledge_base_version: String,
    pub passes: u32,
    pub capped: bool,
}

impl CaseRecord {
    /// Capture a finished session. A missing or blank subject maps to the
    /// shared guest person.
    ///
    /// # Errors
    /// Returns an error when the raw input cannot be serialized for hashing.
    pub fn from_outcome(
        subject: Option<&str>,
        input: &RawInput,
        outcome: &ScreeningOutcome,
    ) -> Result<Self> {
        Ok(Self {
            person_id: person_id_for(subject),
            diagnosis: outcome.resolution.diagnosis,
            insomnia_risk: outcome.resolution.insomnia_risk,
            apnea_risk: outcome.resolution.apnea_risk,
            fired_rules: outcome.trace().to_vec(),
            facts: outcome.facts().clone(),
            input_digest: input_digest(input)?,
            knowledge_base_version: KNOWLEDGE_BASE_VERSION.to_string(),
            passes: outcome.run.passes,
            capped: outcome.run.capped,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCase {
    pub case_id: String,
    pub person_id: String,
    pub diagnosis: Diagnosis,
    pub insomnia_risk: RiskLevel,
    pub apnea_risk: RiskLevel,
    pub fired_rules: Vec<String>,
    pub facts: FactSet,
    pub input_digest: String,
    pub knowledge_base_version: String,
    pub passes: u32,
    pub capped: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersonSummary {
    pub person_id: String,
    pub total_cases: u64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CaseSummary {
    pub case_id: String,
    pub diagnosis: Diagnosis,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuleFrequency {
    pub rule_id: String,
    pub category: RuleCategory,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SequencePattern {
    pub sequence: Vec<String>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisSequences {
    pub diagnosis: Diagnosis,
    pub total_cases: u64,
    pub patterns: Vec<SequencePattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RulePair {
    pub rule_a: String,
    pub rule_b: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuleEdge {
    pub from_rule: String,
    pub to_rule: String,
    pub weight: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisCount {
    pub diagnosis: Diagnosis,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphIntegrity {
    pub cases_without_diagnosis: Vec<String>,
    pub cases_with_order_gaps: Vec<String>,
    pub non_positive_next_weights: u64,
    pub person_count_mismatches: Vec<String>,
}

impl GraphIntegrity {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.cases_without_diagnosis.is_empty()
            && self.cases_with_order_gaps.is_empty()
            && self.non_positive_next_weights == 0
            && self.person_count_mismatches.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub graph: GraphIntegrity,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok && self.foreign_key_violations.is_empty() && self.graph.is_clean()
    }
}

impl SqliteStore {
    /// Open the provenance store with the default busy timeout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open the provenance store. `busy_timeout` bounds how long a write
    /// waits on another writer before failing.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        let timeout_ms = u64::try_from(busy_timeout.as_millis()).unwrap_or(u64::MAX);
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {timeout_ms};"
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer
    /// than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        info!(version, "applied provenance schema migration");
        Ok(())
    }

    /// Write one session as a graph fragment and return its case reference.
    ///
    /// Person, rule and diagnosis nodes are upserted, counters are
    /// incremented in place, and every `NEXT` edge between adjacent fired
    /// rules gains one unit of weight. All of it commits or none of it does.
    ///
    /// # Errors
    /// Returns an error when a trace id is not in the knowledge base, the
    /// write lock cannot be acquired within the busy timeout, or any statement
    /// in the transaction fails.
    pub fn record_session(&mut self, record: &CaseRecord) -> Result<String> {
        let case_id = Ulid::new().to_string();
        let now = now_rfc3339()?;
        let facts_json =
            serde_json::to_string(&record.facts).context("failed to serialize fact snapshot")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start session write transaction")?;

        tx.execute(
            "INSERT INTO persons(person_id, total_cases, created_at, updated_at)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(person_id) DO UPDATE SET
               total_cases = total_cases + 1,
               updated_at = excluded.updated_at",
            params![record.person_id, now],
        )
        .context("failed to upsert person node")?;

        tx.execute(
            "INSERT INTO cases(
                case_id, person_id, insomnia_risk, apnea_risk, facts_json,
                input_digest, knowledge_base_version, passes, capped, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                case_id,
                record.person_id,
                record.insomnia_risk.as_str(),
                record.apnea_risk.as_str(),
                facts_json,
                record.input_digest,
                record.knowledge_base_version,
                i64::from(record.passes),
                record.capped,
                now,
            ],
        )
        .context("failed to insert case node")?;

        tx.execute(
            "INSERT INTO diagnoses(label) VALUES (?1) ON CONFLICT(label) DO NOTHING",
            params![record.diagnosis.as_str()],
        )
        .context("failed to upsert diagnosis node")?;
        tx.execute(
            "INSERT INTO case_diagnosis(case_id, label) VALUES (?1, ?2)",
            params![case_id, record.diagnosis.as_str()],
        )
        .context("failed to link case to diagnosis")?;

        for (index, rule_id) in record.fired_rules.iter().enumerate() {
            let Some((position, rule)) = find_rule(rule_id) else {
                return Err(anyhow!("fired rule {rule_id} is not in the knowledge base"));
            };
            tx.execute(
                "INSERT INTO rules(rule_id, category, position) VALUES (?1, ?2, ?3)
                 ON CONFLICT(rule_id) DO NOTHING",
                params![rule.id, rule.category.as_str(), to_i64(position)],
            )
            .with_context(|| format!("failed to upsert rule node {rule_id}"))?;
            tx.execute(
                "INSERT INTO fired_rules(case_id, ord, rule_id) VALUES (?1, ?2, ?3)",
                params![case_id, to_i64(index + 1), rule_id],
            )
            .with_context(|| format!("failed to link case to fired rule {rule_id}"))?;
        }

        for pair in record.fired_rules.windows(2) {
            tx.execute(
                "INSERT INTO rule_next(from_rule, to_rule, weight) VALUES (?1, ?2, 1)
                 ON CONFLICT(from_rule, to_rule) DO UPDATE SET weight = weight + 1",
                params![pair[0], pair[1]],
            )
            .with_context(|| format!("failed to bump NEXT edge {} -> {}", pair[0], pair[1]))?;
        }

        tx.commit().context("failed to commit session write transaction")?;
        debug!(
            case_id = %case_id,
            person_id = %record.person_id,
            diagnosis = record.diagnosis.as_str(),
            fired = record.fired_rules.len(),
            "recorded screening session"
        );
        Ok(case_id)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_case(&self, case_id: &str) -> Result<Option<StoredCase>> {
        let row = self
            .conn
            .query_row(
                "SELECT c.case_id, c.person_id, d.label, c.insomnia_risk, c.apnea_risk,
                        c.facts_json, c.input_digest, c.knowledge_base_version, c.passes,
                        c.capped, c.created_at
                 FROM cases c
                 JOIN case_diagnosis d ON d.case_id = c.case_id
                 WHERE c.case_id = ?1",
                params![case_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, bool>(9)?,
                        row.get::<_, String>(10)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load case {case_id}"))?;

        let Some((
            case_id,
            person_id,
            diagnosis,
            insomnia_risk,
            apnea_risk,
            facts_json,
            input_digest,
            knowledge_base_version,
            passes,
            capped,
            created_at,
        )) = row
        else {
            return Ok(None);
        };

        let fired_rules = self.case_trace(&case_id)?;
        let facts = serde_json::from_str::<FactSet>(&facts_json)
            .with_context(|| format!("failed to decode fact snapshot for case {case_id}"))?;

        Ok(Some(StoredCase {
            fired_rules,
            facts,
            diagnosis: parse_diagnosis(&diagnosis)?,
            insomnia_risk: parse_risk(&insomnia_risk)?,
            apnea_risk: parse_risk(&apnea_risk)?,
            passes: u32::try_from(passes).context("stored pass count out of range")?,
            case_id,
            person_id,
            input_digest,
            knowledge_base_version,
            capped,
            created_at,
        }))
    }

    fn case_trace(&self, case_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT rule_id FROM fired_rules WHERE case_id = ?1 ORDER BY ord")
            .context("failed to prepare fired rule query")?;
        let rows = stmt.query_map(params![case_id], |row| row.get::<_, String>(0))?;

        let mut trace = Vec::new();
        for row in rows {
            trace.push(row?);
        }
        Ok(trace)
    }

    /// # Errors
    /// Returns an error when the person row cannot be read.
    pub fn get_person(&self, person_id: &str) -> Result<Option<PersonSummary>> {
        self.conn
            .query_row(
                "SELECT person_id, total_cases, created_at, updated_at
                 FROM persons WHERE person_id = ?1",
                params![person_id],
                |row| {
                    Ok(PersonSummary {
                        person_id: row.get(0)?,
                        total_cases: to_u64(row.get(1)?),
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load person {person_id}"))
    }

    /// Cases of one person, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn person_cases(&self, person_id: &str) -> Result<Vec<CaseSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.case_id, d.label, c.created_at
                 FROM cases c
                 JOIN case_diagnosis d ON d.case_id = c.case_id
                 WHERE c.person_id = ?1
                 ORDER BY c.created_at ASC, c.case_id ASC",
            )
            .context("failed to prepare person case query")?;
        let rows = stmt.query_map(params![person_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut cases = Vec::new();
        for row in rows {
            let (case_id, label, created_at) = row?;
            cases.push(CaseSummary {
                case_id,
                diagnosis: parse_diagnosis(&label)?,
                created_at,
            });
        }
        Ok(cases)
    }

    /// How often each rule fired, most frequent first.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn rule_frequency(&self, person: Option<&str>, limit: usize) -> Result<Vec<RuleFrequency>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT f.rule_id, r.category, COUNT(*) AS fired
                 FROM fired_rules f
                 JOIN rules r ON r.rule_id = f.rule_id
                 JOIN cases c ON c.case_id = f.case_id
                 WHERE (?1 IS NULL OR c.person_id = ?1)
                 GROUP BY f.rule_id, r.category, r.position
                 ORDER BY fired DESC, r.position ASC
                 LIMIT ?2",
            )
            .context("failed to prepare rule frequency query")?;
        let rows = stmt.query_map(params![person, to_i64(limit)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (rule_id, category, fired) = row?;
            out.push(RuleFrequency {
                rule_id,
                category: parse_category(&category)?,
                count: to_u64(fired),
            });
        }
        Ok(out)
    }

    /// Most common firing traces per diagnosis. `limit` bounds the patterns
    /// kept for each diagnosis.
    ///
    /// # Errors
    /// Returns an error when stored traces cannot be read.
    pub fn sequence_patterns(
        &self,
        person: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DiagnosisSequences>> {
        let mut grouped: BTreeMap<Diagnosis, BTreeMap<Vec<String>, u64>> = BTreeMap::new();
        for (diagnosis, trace) in self.stored_traces(person)? {
            *grouped.entry(diagnosis).or_default().entry(trace).or_insert(0) += 1;
        }

        let mut out = grouped
            .into_iter()
            .map(|(diagnosis, traces)| {
                let total_cases = traces.values().sum();
                let mut patterns = traces
                    .into_iter()
                    .map(|(sequence, count)| SequencePattern { sequence, count })
                    .collect::<Vec<_>>();
                patterns.sort_by(|a, b| {
                    b.count.cmp(&a.count).then_with(|| a.sequence.cmp(&b.sequence))
                });
                patterns.truncate(limit);
                DiagnosisSequences {
                    diagnosis,
                    total_cases,
                    patterns,
                }
            })
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            b.total_cases.cmp(&a.total_cases).then_with(|| a.diagnosis.cmp(&b.diagnosis))
        });
        Ok(out)
    }

    /// Unordered rule pairs appearing in the same trace, weighted by how many
    /// cases produced that trace.
    ///
    /// # Errors
    /// Returns an error when stored traces cannot be read.
    pub fn co_occurrence(&self, person: Option<&str>, limit: usize) -> Result<Vec<RulePair>> {
        let mut trace_counts: BTreeMap<Vec<String>, u64> = BTreeMap::new();
        for (_, trace) in self.stored_traces(person)? {
            *trace_counts.entry(trace).or_insert(0) += 1;
        }

        let mut pairs: BTreeMap<(usize, usize, String, String), u64> = BTreeMap::new();
        for (trace, count) in &trace_counts {
            for (i, first) in trace.iter().enumerate() {
                for second in &trace[i + 1..] {
                    let (a, b) = if rule_rank(first) <= rule_rank(second) {
                        (first, second)
                    } else {
                        (second, first)
                    };
                    *pairs
                        .entry((rule_rank(a), rule_rank(b), a.clone(), b.clone()))
                        .or_insert(0) += count;
                }
            }
        }

        let mut out = pairs
            .into_iter()
            .map(|((_, _, rule_a, rule_b), count)| RulePair {
                rule_a,
                rule_b,
                count,
            })
            .collect::<Vec<_>>();
        // Stable sort keeps catalog order among equal counts.
        out.sort_by(|a, b| b.count.cmp(&a.count));
        out.truncate(limit);
        Ok(out)
    }

    /// `NEXT` adjacency edges, heaviest first. For a person the edges are
    /// derived from that person's own traces.
    ///
    /// # Errors
    /// Returns an error when the adjacency query fails.
    pub fn rule_network(&self, person: Option<&str>, limit: usize) -> Result<Vec<RuleEdge>> {
        let map_edge = |row: &rusqlite::Row<'_>| {
            Ok(RuleEdge {
                from_rule: row.get(0)?,
                to_rule: row.get(1)?,
                weight: to_u64(row.get(2)?),
            })
        };

        let mut out = Vec::new();
        if let Some(person) = person {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT a.rule_id, b.rule_id, COUNT(*) AS weight
                     FROM fired_rules a
                     JOIN fired_rules b ON b.case_id = a.case_id AND b.ord = a.ord + 1
                     JOIN cases c ON c.case_id = a.case_id
                     JOIN rules ra ON ra.rule_id = a.rule_id
                     JOIN rules rb ON rb.rule_id = b.rule_id
                     WHERE c.person_id = ?1
                     GROUP BY a.rule_id, b.rule_id, ra.position, rb.position
                     ORDER BY weight DESC, ra.position ASC, rb.position ASC
                     LIMIT ?2",
                )
                .context("failed to prepare per-person rule network query")?;
            for row in stmt.query_map(params![person, to_i64(limit)], map_edge)? {
                out.push(row?);
            }
        } else {
            let mut stmt = self
                .conn
                .prepare(
                    "SELECT n.from_rule, n.to_rule, n.weight
                     FROM rule_next n
                     JOIN rules ra ON ra.rule_id = n.from_rule
                     JOIN rules rb ON rb.rule_id = n.to_rule
                     WHERE n.weight > 0
                     ORDER BY n.weight DESC, ra.position ASC, rb.position ASC
                     LIMIT ?1",
                )
                .context("failed to prepare rule network query")?;
            for row in stmt.query_map(params![to_i64(limit)], map_edge)? {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// Case count per diagnosis label, largest first.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails or a label is unknown.
    pub fn diagnosis_distribution(&self, person: Option<&str>) -> Result<Vec<DiagnosisCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT d.label, COUNT(*) AS cases
                 FROM case_diagnosis d
                 JOIN cases c ON c.case_id = d.case_id
                 WHERE (?1 IS NULL OR c.person_id = ?1)
                 GROUP BY d.label
                 ORDER BY cases DESC, d.label ASC",
            )
            .context("failed to prepare diagnosis distribution query")?;
        let rows = stmt.query_map(params![person], |row| {
            Ok((row.get::<_, String>(0)?, to_u64(row.get(1)?)))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (label, count) = row?;
            out.push(DiagnosisCount {
                diagnosis: parse_diagnosis(&label)?,
                count,
            });
        }
        Ok(out)
    }

    fn stored_traces(&self, person: Option<&str>) -> Result<Vec<(Diagnosis, Vec<String>)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.case_id, d.label, f.rule_id
                 FROM cases c
                 JOIN case_diagnosis d ON d.case_id = c.case_id
                 LEFT JOIN fired_rules f ON f.case_id = c.case_id
                 WHERE (?1 IS NULL OR c.person_id = ?1)
                 ORDER BY c.case_id ASC, f.ord ASC",
            )
            .context("failed to prepare stored trace query")?;
        let rows = stmt.query_map(params![person], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut traces: Vec<(String, Diagnosis, Vec<String>)> = Vec::new();
        for row in rows {
            let (case_id, label, rule_id) = row?;
            let same_case = traces.last().is_some_and(|(last, _, _)| *last == case_id);
            if !same_case {
                traces.push((case_id, parse_diagnosis(&label)?, Vec::new()));
            }
            if let (Some(rule_id), Some((_, _, trace))) = (rule_id, traces.last_mut()) {
                trace.push(rule_id);
            }
        }

        Ok(traces.into_iter().map(|(_, diagnosis, trace)| (diagnosis, trace)).collect())
    }

    /// Run quick-check, foreign-key-check, graph invariant and schema probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let graph = if schema_status.current_version >= 1 {
            self.graph_integrity()?
        } else {
            GraphIntegrity::default()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            graph,
            schema_status,
        })
    }

    fn graph_integrity(&self) -> Result<GraphIntegrity> {
        let cases_without_diagnosis = self.string_column(
            "SELECT c.case_id FROM cases c
             WHERE NOT EXISTS (SELECT 1 FROM case_diagnosis d WHERE d.case_id = c.case_id)
             ORDER BY c.case_id",
        )?;
        let cases_with_order_gaps = self.string_column(
            "SELECT case_id FROM fired_rules
             GROUP BY case_id
             HAVING MIN(ord) != 1 OR MAX(ord) != COUNT(*)
             ORDER BY case_id",
        )?;
        let non_positive_next_weights = self
            .conn
            .query_row("SELECT COUNT(*) FROM rule_next WHERE weight < 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(to_u64)
            .context("failed to count non-positive NEXT weights")?;
        let person_count_mismatches = self.string_column(
            "SELECT p.person_id FROM persons p
             WHERE p.total_cases != (SELECT COUNT(*) FROM cases c WHERE c.person_id = p.person_id)
             ORDER BY p.person_id",
        )?;

        Ok(GraphIntegrity {
            cases_without_diagnosis,
            cases_with_order_gaps,
            non_positive_next_weights,
            person_count_mismatches,
        })
    }

    fn string_column(&self, sql: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare integrity probe")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// `sha256:<hex>` digest of the raw input as submitted.
///
/// # Errors
/// Returns an error when the input cannot be serialized.
pub fn input_digest(input: &RawInput) -> Result<String> {
    let bytes = serde_json::to_vec(input).context("failed to serialize raw input")?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

#[must_use]
pub fn person_id_for(subject: Option<&str>) -> String {
    match subject.map(str::trim) {
        Some(subject) if !subject.is_empty() => subject.to_string(),
        _ => GUEST_PERSON_ID.to_string(),
    }
}

fn rule_rank(rule_id: &str) -> usize {
    find_rule(rule_id).map_or(usize::MAX, |(position, _)| position)
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_diagnosis(raw: &str) -> Result<Diagnosis> {
    Diagnosis::parse(raw).ok_or_else(|| anyhow!("unknown diagnosis label in store: {raw}"))
}

fn parse_category(raw: &str) -> Result<RuleCategory> {
    RuleCategory::parse(raw).ok_or_else(|| anyhow!("unknown rule category in store: {raw}"))
}

fn parse_risk(raw: &str) -> Result<RiskLevel> {
    RiskLevel::parse(raw).ok_or_else(|| anyhow!("unknown risk level in store: {raw}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
