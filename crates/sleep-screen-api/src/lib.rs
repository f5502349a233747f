mod config;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sleep_screen_core::{catalog, RawInput, RuleCatalogEntry, ScreeningError, ScreeningReport};
use sleep_screen_store_sqlite::{
    CaseRecord, CaseSummary, DiagnosisCount, DiagnosisSequences, IntegrityReport, PersonSummary,
    RuleEdge, RuleFrequency, RulePair, SchemaStatus, SqliteStore, StoredCase,
};
use tracing::warn;

pub use config::{
    ScreeningConfig, DEFAULT_DB_PATH, DEFAULT_LIMIT, DEFAULT_LOG_FILTER, DEFAULT_STORE_TIMEOUT_MS,
};

/// One screening call: the raw attribute map plus logging options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningRequest {
    pub attributes: RawInput,
    #[serde(default = "default_persist")]
    pub persist: bool,
    #[serde(default)]
    pub subject_id: Option<String>,
}

fn default_persist() -> bool {
    true
}

/// Scope and size of an aggregate read. `None` person means all cases,
/// `None` limit means the configured default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsQuery {
    pub person: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersonReport {
    pub person: PersonSummary,
    pub cases: Vec<CaseSummary>,
}

#[derive(Debug, Clone)]
pub struct ScreeningApi {
    config: ScreeningConfig,
}

impl ScreeningApi {
    #[must_use]
    pub fn new(config: ScreeningConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ScreeningConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with_timeout(&self.config.db_path, self.config.store_timeout())
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    fn limit(&self, query: &AnalyticsQuery) -> usize {
        query.limit.unwrap_or(self.config.default_limit)
    }

    /// Screen one session and, when asked, log it to the provenance graph.
    ///
    /// The diagnosis never depends on the graph write. A failed write is
    /// logged and leaves `caseRef` unset.
    ///
    /// # Errors
    /// Returns [`ScreeningError`] when the input is invalid. Nothing is
    /// persisted in that case.
    pub fn screen(&self, request: &ScreeningRequest) -> Result<ScreeningReport, ScreeningError> {
        let outcome = sleep_screen_core::screen(&request.attributes)?;

        let case_ref = if request.persist {
            let write = CaseRecord::from_outcome(
                request.subject_id.as_deref(),
                &request.attributes,
                &outcome,
            )
            .and_then(|record| self.open_migrated_store()?.record_session(&record));
            match write {
                Ok(case_id) => Some(case_id),
                Err(err) => {
                    warn!(
                        error = %format!("{err:#}"),
                        db_path = %self.config.db_path.display(),
                        "provenance write failed; returning diagnosis without case reference"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(outcome.report(case_ref))
    }

    fn degrade<T: Default>(
        &self,
        aggregate: &'static str,
        read: impl FnOnce(&SqliteStore) -> Result<T>,
    ) -> T {
        match self.open_migrated_store().and_then(|store| read(&store)) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    aggregate,
                    error = %format!("{err:#}"),
                    "analytics read failed; returning empty result"
                );
                T::default()
            }
        }
    }

    #[must_use]
    pub fn rule_frequency(&self, query: &AnalyticsQuery) -> Vec<RuleFrequency> {
        let limit = self.limit(query);
        self.degrade("rule_frequency", |store| store.rule_frequency(query.person.as_deref(), limit))
    }

    #[must_use]
    pub fn sequence_patterns(&self, query: &AnalyticsQuery) -> Vec<DiagnosisSequences> {
        let limit = self.limit(query);
        self.degrade("sequence_patterns", |store| {
            store.sequence_patterns(query.person.as_deref(), limit)
        })
    }

    #[must_use]
    pub fn co_occurrence(&self, query: &AnalyticsQuery) -> Vec<RulePair> {
        let limit = self.limit(query);
        self.degrade("co_occurrence", |store| store.co_occurrence(query.person.as_deref(), limit))
    }

    #[must_use]
    pub fn rule_network(&self, query: &AnalyticsQuery) -> Vec<RuleEdge> {
        let limit = self.limit(query);
        self.degrade("rule_network", |store| store.rule_network(query.person.as_deref(), limit))
    }

    #[must_use]
    pub fn diagnosis_distribution(&self, query: &AnalyticsQuery) -> Vec<DiagnosisCount> {
        self.degrade("diagnosis_distribution", |store| {
            store.diagnosis_distribution(query.person.as_deref())
        })
    }

    /// # Errors
    /// Returns an error when the store cannot be read or the case does not exist.
    pub fn case_show(&self, case_id: &str) -> Result<StoredCase> {
        let store = self.open_migrated_store()?;
        store.get_case(case_id)?.ok_or_else(|| anyhow!("case not found: {case_id}"))
    }

    /// # Errors
    /// Returns an error when the store cannot be read or the person does not exist.
    pub fn person_show(&self, person_id: &str) -> Result<PersonReport> {
        let store = self.open_migrated_store()?;
        let person =
            store.get_person(person_id)?.ok_or_else(|| anyhow!("person not found: {person_id}"))?;
        let cases = store.person_cases(person_id)?;
        Ok(PersonReport { person, cases })
    }

    #[must_use]
    pub fn rules_list(&self) -> Vec<RuleCatalogEntry> {
        catalog()
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }
}
