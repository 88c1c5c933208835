use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureValue {
    Category(String),
    Integer(i64),
    Real(f64),
}

impl FeatureValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Integer(value) => Some(*value as f64),
            FeatureValue::Real(value) => Some(*value),
            FeatureValue::Category(_) => None,
        }
    }
}

/// A request's `data` payload after every schema check has passed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    values: Vec<(&'static str, FeatureValue)>,
}

impl FeatureRecord {
    pub(crate) fn new(values: Vec<(&'static str, FeatureValue)>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.values
            .iter()
            .find(|(feature, _)| *feature == name)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: bool,
    pub probability: f64,
}

/// One persisted row of the predictions table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredObservation {
    pub observation_id: String,
    /// The scoring request kept for audit, re-serialized from the parsed JSON.
    /// Key order is preserved; number spellings are normalized (`1e2` becomes
    /// `100.0`).
    pub observation: String,
    pub proba: f64,
    pub true_class: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScoreResponse {
    Scored {
        observation_id: Value,
        prediction: bool,
        probability: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Rejected {
        observation_id: Value,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CorrectResponse {
    Updated(ScoredObservation),
    Failed { error: String },
}

/// Store key for a wire identifier: strings verbatim, anything else as compact JSON.
pub fn observation_key(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Renders a JSON value for an error message the way a caller typed it.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
