use serde_json::Value;

use crate::facts::{keys, BloodPressureStatus, BmiCategory, FactSet};

/// Flat attribute map supplied by the caller. Keys may repeat a field under
/// several aliases.
pub type RawInput = serde_json::Map<String, Value>;

pub(crate) const AGE_KEYS: &[&str] = &["age", "Age"];
pub(crate) const SLEEP_DURATION_KEYS: &[&str] =
    &["sleepDuration", "sleep_duration", "Sleep Duration"];
pub(crate) const SLEEP_QUALITY_KEYS: &[&str] =
    &["sleepQuality", "sleep_quality", "qualityOfSleep", "Quality of Sleep"];
pub(crate) const STRESS_LEVEL_KEYS: &[&str] = &["stressLevel", "stress_level", "Stress Level"];
pub(crate) const HEART_RATE_KEYS: &[&str] = &["heartRate", "heart_rate", "Heart Rate"];
pub(crate) const DAILY_STEPS_KEYS: &[&str] = &["dailySteps", "daily_steps", "Daily Steps"];
pub(crate) const PHYSICAL_ACTIVITY_KEYS: &[&str] = &[
    "physicalActivity",
    "physical_activity",
    "physicalActivityLevel",
    "Physical Activity Level",
];
pub(crate) const BMI_CATEGORY_KEYS: &[&str] = &["bmiCategory", "bmi_category", "BMI Category"];
pub(crate) const BLOOD_PRESSURE_KEYS: &[&str] =
    &["bloodPressure", "blood_pressure", "Blood Pressure"];
pub(crate) const WEIGHT_KEYS: &[&str] = &["weight", "Weight"];
pub(crate) const WEIGHT_UNIT_KEYS: &[&str] = &["weightUnit", "weight_unit"];
pub(crate) const HEIGHT_KEYS: &[&str] = &["height", "Height"];
pub(crate) const HEIGHT_UNIT_KEYS: &[&str] = &["heightUnit", "height_unit"];
const GENDER_KEYS: &[&str] = &["gender", "Gender"];
const OCCUPATION_KEYS: &[&str] = &["occupation", "Occupation"];

const LBS_TO_KG: f64 = 0.453_592;
const IN_TO_CM: f64 = 2.54;

/// Build the canonical fact set for one session.
///
/// Missing or non-numeric required numerics become `0`. BMI and blood
/// pressure are classified here so rules only ever see category labels.
#[must_use]
pub fn normalize(input: &RawInput) -> FactSet {
    let mut facts = FactSet::new();

    for (key, aliases) in [
        (keys::AGE, AGE_KEYS),
        (keys::SLEEP_DURATION, SLEEP_DURATION_KEYS),
        (keys::SLEEP_QUALITY, SLEEP_QUALITY_KEYS),
        (keys::STRESS_LEVEL, STRESS_LEVEL_KEYS),
        (keys::HEART_RATE, HEART_RATE_KEYS),
        (keys::DAILY_STEPS, DAILY_STEPS_KEYS),
        (keys::PHYSICAL_ACTIVITY, PHYSICAL_ACTIVITY_KEYS),
    ] {
        facts.set(key, numeric_or_zero(input, aliases));
    }

    let explicit_category = lookup_text(input, BMI_CATEGORY_KEYS).and_then(BmiCategory::parse);
    let category = match explicit_category {
        Some(category) => category,
        None => match bmi_from_measurements(input) {
            Some(bmi) => {
                facts.set(keys::BMI, bmi);
                classify_bmi(bmi)
            }
            None => BmiCategory::Unknown,
        },
    };
    facts.set(keys::BMI_CATEGORY, category.as_str());

    let blood_pressure = lookup_text(input, BLOOD_PRESSURE_KEYS);
    let status = blood_pressure.map_or(BloodPressureStatus::Unknown, classify_blood_pressure);
    if let Some(raw) = blood_pressure {
        facts.set(keys::BLOOD_PRESSURE, raw);
    }
    facts.set(keys::BLOOD_PRESSURE_STATUS, status.as_str());

    for (key, aliases) in [(keys::GENDER, GENDER_KEYS), (keys::OCCUPATION, OCCUPATION_KEYS)] {
        if let Some(value) = lookup_text(input, aliases) {
            facts.set(key, value.trim());
        }
    }

    for key in [
        keys::LIFESTYLE_ISSUE_ACTIVITY,
        keys::LIFESTYLE_ISSUE_STRESS,
        keys::LIFESTYLE_ISSUE_SLEEP,
        keys::LIFESTYLE_ISSUE_WEIGHT,
    ] {
        facts.set(key, false);
    }

    facts
}

#[must_use]
pub fn classify_bmi(bmi: f64) -> BmiCategory {
    if bmi < 18.5 {
        BmiCategory::Underweight
    } else if bmi < 25.0 {
        BmiCategory::Normal
    } else if bmi < 30.0 {
        BmiCategory::Overweight
    } else {
        BmiCategory::Obese
    }
}

/// Compute BMI from weight and height, converting `lbs` and `in` first.
/// Returns `None` for non-positive measurements.
#[must_use]
pub fn compute_bmi(weight: f64, weight_unit: &str, height: f64, height_unit: &str) -> Option<f64> {
    let weight_kg = if weight_unit.trim().eq_ignore_ascii_case("lbs") {
        weight * LBS_TO_KG
    } else {
        weight
    };
    let height_cm = if height_unit.trim().eq_ignore_ascii_case("in") {
        height * IN_TO_CM
    } else {
        height
    };

    if weight_kg <= 0.0 || height_cm <= 0.0 {
        return None;
    }

    let height_m = height_cm / 100.0;
    Some(weight_kg / (height_m * height_m))
}

/// Classify a `"systolic/diastolic"` reading.
#[must_use]
pub fn classify_blood_pressure(raw: &str) -> BloodPressureStatus {
    let Some((systolic, diastolic)) = raw.split_once('/') else {
        return BloodPressureStatus::Unknown;
    };
    let (Ok(systolic), Ok(diastolic)) =
        (systolic.trim().parse::<f64>(), diastolic.trim().parse::<f64>())
    else {
        return BloodPressureStatus::Unknown;
    };

    if systolic >= 140.0 || diastolic >= 90.0 {
        BloodPressureStatus::Hypertension
    } else {
        BloodPressureStatus::Normal
    }
}

/// First alias whose value is neither JSON null nor blank text.
fn lookup<'a>(input: &'a RawInput, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|alias| input.get(*alias))
        .find(|value| !is_blank(value))
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

pub(crate) fn is_present(input: &RawInput, aliases: &[&str]) -> bool {
    lookup(input, aliases).is_some()
}

fn lookup_text<'a>(input: &'a RawInput, aliases: &[&str]) -> Option<&'a str> {
    aliases
        .iter()
        .filter_map(|alias| input.get(*alias))
        .find_map(|value| match value {
            Value::String(text) if !text.trim().is_empty() => Some(text.as_str()),
            _ => None,
        })
}

fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

/// First alias whose value coerces to a finite number.
fn lookup_number(input: &RawInput, aliases: &[&str]) -> Option<f64> {
    aliases
        .iter()
        .filter_map(|alias| input.get(*alias))
        .find_map(coerce_number)
}

fn numeric_or_zero(input: &RawInput, aliases: &[&str]) -> f64 {
    lookup_number(input, aliases).unwrap_or(0.0)
}

fn bmi_from_measurements(input: &RawInput) -> Option<f64> {
    let weight = lookup_number(input, WEIGHT_KEYS)?;
    let height = lookup_number(input, HEIGHT_KEYS)?;
    let weight_unit = lookup_text(input, WEIGHT_UNIT_KEYS).unwrap_or("kg");
    let height_unit = lookup_text(input, HEIGHT_UNIT_KEYS).unwrap_or("cm");
    compute_bmi(weight, weight_unit, height, height_unit)
}
