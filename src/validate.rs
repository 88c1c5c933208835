use serde_json::{Map, Number, Value};

use crate::models::{display_value, FeatureRecord, FeatureValue};
use crate::schema::{self, FeatureKind, FeatureSpec};

/// Why a scoring request was turned away, with the identifier to echo back.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub observation_id: Option<Value>,
    pub reason: String,
}

impl Rejection {
    fn new(observation_id: Option<&Value>, reason: impl Into<String>) -> Self {
        Self {
            observation_id: observation_id.cloned(),
            reason: reason.into(),
        }
    }
}

/// A request that passed validation: the caller's identifier plus typed features.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidRequest {
    pub observation_id: Value,
    pub record: FeatureRecord,
}

/// Runs the request-shape checks, then the per-feature value checks. The first
/// failing check decides the rejection.
pub fn validate(request: &Value) -> Result<ValidRequest, Rejection> {
    let Some(observation_id) = request.get("observation_id") else {
        return Err(Rejection::new(None, "observation_id not found in request"));
    };
    let id = Some(observation_id);
    if !(observation_id.is_string() || observation_id.is_number()) {
        return Err(Rejection::new(id, "observation_id must be a string or number"));
    }

    let data = match request.get("data") {
        None => return Err(Rejection::new(id, "`data` not found in request")),
        Some(Value::Object(data)) => data,
        Some(_) => return Err(Rejection::new(id, "`data` must be a JSON object")),
    };

    if let Some(unknown) = data.keys().find(|key| !schema::is_feature(key)) {
        return Err(Rejection::new(id, format!("{unknown} not a valid feature")));
    }

    if let Some(missing) = schema::FEATURES
        .iter()
        .find(|spec| !data.contains_key(spec.name))
    {
        return Err(Rejection::new(
            id,
            format!("{} is missing and is required", missing.name),
        ));
    }

    let record = check_values(data).map_err(|reason| Rejection::new(id, reason))?;

    Ok(ValidRequest {
        observation_id: observation_id.clone(),
        record,
    })
}

fn check_values(data: &Map<String, Value>) -> Result<FeatureRecord, String> {
    let mut values = Vec::with_capacity(schema::FEATURES.len());

    for spec in schema::FEATURES {
        let raw = &data[spec.name];
        let value = check_value(spec, raw).ok_or_else(|| {
            format!(
                "{}: {} is not a valid value for this feature",
                spec.name,
                display_value(raw)
            )
        })?;
        values.push((spec.name, value));
    }

    Ok(FeatureRecord::new(values))
}

fn check_value(spec: &FeatureSpec, raw: &Value) -> Option<FeatureValue> {
    match spec.kind {
        FeatureKind::Categorical(domain) => {
            let text = raw.as_str()?;
            domain
                .contains(&text)
                .then(|| FeatureValue::Category(text.to_string()))
        }
        FeatureKind::Integer { min, max } => {
            let value = raw.as_i64()?;
            (min..=max)
                .contains(&value)
                .then_some(FeatureValue::Integer(value))
        }
        FeatureKind::Numeric { min, max } => {
            let value = numeric(raw.as_number()?)?;
            let magnitude = value.as_f64()?;
            // The ceiling bounds the whole part, so 168.5 hours still fits under 168.
            let in_range = magnitude >= min && max.map_or(true, |max| magnitude.trunc() <= max);
            in_range.then_some(value)
        }
    }
}

// Keeps the caller's representation: integral JSON numbers stay integers.
fn numeric(number: &Number) -> Option<FeatureValue> {
    match number.as_i64() {
        Some(value) => Some(FeatureValue::Integer(value)),
        None => number.as_f64().map(FeatureValue::Real),
    }
}
