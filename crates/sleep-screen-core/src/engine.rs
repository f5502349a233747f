use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::facts::FactSet;
use crate::rules::Rule;

/// Hard ceiling on evaluation passes.
pub const MAX_PASSES: u32 = 50;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleFailure {
    pub rule_id: String,
    pub pass: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRun {
    pub facts: FactSet,
    pub passes: u32,
    pub capped: bool,
    pub failures: Vec<RuleFailure>,
}

impl InferenceRun {
    /// Fired rule ids in causal firing order.
    #[must_use]
    pub fn trace(&self) -> &[String] {
        self.facts.fired_rules()
    }
}

/// Forward-chaining evaluator over an ordered rule slice.
#[derive(Debug, Clone, Copy)]
pub struct InferenceEngine<'a> {
    rules: &'a [Rule],
    max_passes: u32,
}

impl<'a> InferenceEngine<'a> {
    #[must_use]
    pub fn new(rules: &'a [Rule]) -> Self {
        Self {
            rules,
            max_passes: MAX_PASSES,
        }
    }

    /// Lower the pass ceiling. Values above [`MAX_PASSES`] are clamped and
    /// zero is raised to one.
    #[must_use]
    pub fn with_max_passes(mut self, max_passes: u32) -> Self {
        self.max_passes = max_passes.clamp(1, MAX_PASSES);
        self
    }

    #[must_use]
    pub fn max_passes(&self) -> u32 {
        self.max_passes
    }

    /// Run the rules to a fixpoint.
    ///
    /// Each rule fires at most once. A predicate or action error skips the
    /// rule for that pass and is reported in [`InferenceRun::failures`]; an
    /// action that fails leaves the fact set untouched because it runs on a
    /// scratch copy. Reaching the pass ceiling is not an error and sets
    /// [`InferenceRun::capped`].
    #[must_use]
    pub fn run(&self, mut facts: FactSet) -> InferenceRun {
        let mut failures = Vec::new();
        let mut passes = 0;
        let mut capped = false;

        for pass in 1..=self.max_passes {
            passes = pass;
            let mut changed = false;

            for rule in self.rules {
                if facts.fired_rules().iter().any(|fired| fired == rule.id) {
                    continue;
                }

                match (rule.predicate)(&facts) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        warn!(
                            rule_id = rule.id,
                            pass,
                            error = %err,
                            "rule predicate failed; skipping"
                        );
                        failures.push(RuleFailure {
                            rule_id: rule.id.to_string(),
                            pass,
                            message: err.to_string(),
                        });
                        continue;
                    }
                }

                let mut scratch = facts.clone();
                if let Err(err) = (rule.action)(&mut scratch) {
                    warn!(rule_id = rule.id, pass, error = %err, "rule action failed; skipping");
                    failures.push(RuleFailure {
                        rule_id: rule.id.to_string(),
                        pass,
                        message: err.to_string(),
                    });
                    continue;
                }

                scratch.record_firing(rule.id);
                facts = scratch;
                changed = true;
                debug!(rule_id = rule.id, pass, "rule fired");
            }

            if !changed {
                break;
            }
            if pass == self.max_passes {
                capped = true;
                warn!(
                    max_passes = self.max_passes,
                    fired = facts.fired_rules().len(),
                    "inference hit the pass ceiling before reaching a fixpoint"
                );
            }
        }

        InferenceRun {
            facts,
            passes,
            capped,
            failures,
        }
    }
}
