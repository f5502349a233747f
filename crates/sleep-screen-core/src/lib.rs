//! Rule-based sleep-disorder screening.
//!
//! A session validates a flat attribute map, normalizes it into a
//! [`FactSet`], forward-chains the knowledge base to a fixpoint and resolves
//! one [`Diagnosis`]. Everything here is synchronous and free of I/O.

mod diagnosis;
mod engine;
mod facts;
mod normalize;
mod rules;
mod screening;
mod validate;

pub use diagnosis::{resolve, Diagnosis, LifestyleIssues, Resolution};
pub use engine::{InferenceEngine, InferenceRun, RuleFailure, MAX_PASSES};
pub use facts::{
    keys, BloodPressureStatus, BmiCategory, FactSet, FactValue, Recommendation, RiskLevel,
};
pub use normalize::{classify_blood_pressure, classify_bmi, compute_bmi, normalize, RawInput};
pub use rules::{
    catalog, find_rule, knowledge_base, Action, Predicate, Rule, RuleCatalogEntry, RuleCategory,
    KNOWLEDGE_BASE_VERSION,
};
pub use screening::{
    evaluate, raw_input, screen, ScreeningMetadata, ScreeningOutcome, ScreeningReport,
};
pub use validate::{validate_required, FieldError, ValidationErrors};

/// Failure raised by a rule predicate or action while reading the fact set.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RuleError {
    #[error("missing fact: {0}")]
    MissingFact(String),
    #[error("fact {key} has type {found}, expected {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("fact {key} has unrecognised value {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ScreeningError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationErrors),
    #[error("screening input must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}
