use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::facts::keys;
use crate::normalize::{
    is_present, RawInput, AGE_KEYS, BLOOD_PRESSURE_KEYS, BMI_CATEGORY_KEYS, HEIGHT_KEYS,
    SLEEP_DURATION_KEYS, SLEEP_QUALITY_KEYS, STRESS_LEVEL_KEYS, WEIGHT_KEYS,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Every missing required field, reported together.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let messages = self.errors.iter().map(|error| error.message.as_str()).collect::<Vec<_>>();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

const REQUIRED_FIELDS: &[(&str, &[&str], &str)] = &[
    (keys::AGE, AGE_KEYS, "age is required"),
    (keys::SLEEP_DURATION, SLEEP_DURATION_KEYS, "sleep duration is required"),
    (keys::SLEEP_QUALITY, SLEEP_QUALITY_KEYS, "sleep quality is required"),
    (keys::STRESS_LEVEL, STRESS_LEVEL_KEYS, "stress level is required"),
];

/// Check that every required field is present before any inference runs.
///
/// A field counts as absent when none of its aliases is present, or the value
/// is JSON null or blank text. The BMI category is also satisfied by a weight
/// and height pair.
///
/// # Errors
/// Returns [`ValidationErrors`] listing every missing field.
pub fn validate_required(input: &RawInput) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();

    for (field, aliases, message) in REQUIRED_FIELDS {
        if !is_present(input, aliases) {
            errors.push(FieldError {
                field: (*field).to_string(),
                message: (*message).to_string(),
            });
        }
    }

    let has_measurements = is_present(input, WEIGHT_KEYS) && is_present(input, HEIGHT_KEYS);
    if !is_present(input, BMI_CATEGORY_KEYS) && !has_measurements {
        errors.push(FieldError {
            field: keys::BMI_CATEGORY.to_string(),
            message: "BMI category (or weight and height) is required".to_string(),
        });
    }

    if !is_present(input, BLOOD_PRESSURE_KEYS) {
        errors.push(FieldError {
            field: keys::BLOOD_PRESSURE.to_string(),
            message: "blood pressure is required".to_string(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationErrors { errors })
    }
}
