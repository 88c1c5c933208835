use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::{bail, Context};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{FeatureRecord, FeatureValue, Prediction};

/// Faults raised after validation passed. These point at a mismatch between the
/// feature schema and the model artifacts, never at bad input.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("column `{0}` is not part of the feature record")]
    MissingColumn(String),
    #[error("column `{column}` cannot be coerced to {dtype}")]
    Coercion { column: String, dtype: Dtype },
    #[error("model feature `{0}` expects a numeric column")]
    NonNumeric(String),
    #[error("model feature `{0}` is missing from the scoring row")]
    MissingFeature(String),
    #[error("model produced an invalid probability {0}")]
    InvalidProbability(f64),
}

/// Column types the model was fit on, named after their pandas spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Int64,
    Float64,
    Category,
    Object,
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dtype::Int64 => "int64",
            Dtype::Float64 => "float64",
            Dtype::Category => "category",
            Dtype::Object => "object",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int(i64),
    Float(f64),
    Text(String),
}

/// One observation laid out in the model's column order.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRow {
    columns: Vec<(String, ColumnValue)>,
}

impl ModelRow {
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }
}

/// The trained model, opaque to everything but this module.
pub trait Classifier: Send + Sync {
    fn predict(&self, row: &ModelRow) -> Result<Prediction, ScoringError>;

    /// Probability at or above which the positive label is predicted.
    fn threshold(&self) -> f64;
}

#[derive(Debug, Clone, Deserialize)]
pub struct NumericTerm {
    pub coef: f64,
    #[serde(default)]
    pub mean: f64,
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.0
}

fn default_threshold() -> f64 {
    0.5
}

/// Logistic regression over standardized numeric columns and one-hot encoded
/// categorical columns. Unseen categorical levels contribute nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct LogisticModel {
    pub intercept: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub numeric: BTreeMap<String, NumericTerm>,
    #[serde(default)]
    pub categorical: BTreeMap<String, BTreeMap<String, f64>>,
}

impl LogisticModel {
    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.numeric
            .keys()
            .chain(self.categorical.keys())
            .map(String::as_str)
    }

    fn check(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            bail!("threshold {} is outside [0, 1]", self.threshold);
        }
        for (feature, term) in &self.numeric {
            if term.scale == 0.0 || !term.scale.is_finite() {
                bail!("numeric feature `{feature}` has an unusable scale {}", term.scale);
            }
        }
        Ok(())
    }
}

impl Classifier for LogisticModel {
    fn predict(&self, row: &ModelRow) -> Result<Prediction, ScoringError> {
        let mut logit = self.intercept;

        for (feature, term) in &self.numeric {
            let value = match row.get(feature) {
                Some(ColumnValue::Int(value)) => *value as f64,
                Some(ColumnValue::Float(value)) => *value,
                Some(ColumnValue::Text(_)) => {
                    return Err(ScoringError::NonNumeric(feature.clone()))
                }
                None => return Err(ScoringError::MissingFeature(feature.clone())),
            };
            logit += term.coef * (value - term.mean) / term.scale;
        }

        for (feature, levels) in &self.categorical {
            let level = match row.get(feature) {
                Some(ColumnValue::Text(level)) => level,
                Some(_) => return Err(ScoringError::NonNumeric(feature.clone())),
                None => return Err(ScoringError::MissingFeature(feature.clone())),
            };
            logit += levels.get(level).copied().unwrap_or(0.0);
        }

        let probability = 1.0 / (1.0 + (-logit).exp());
        if !probability.is_finite() {
            return Err(ScoringError::InvalidProbability(probability));
        }

        Ok(Prediction {
            label: probability >= self.threshold,
            probability,
        })
    }

    fn threshold(&self) -> f64 {
        self.threshold
    }
}

/// Everything loaded from the artifact directory at startup. Read-only once built.
pub struct ModelBundle {
    columns: Vec<String>,
    dtypes: BTreeMap<String, Dtype>,
    classifier: Box<dyn Classifier>,
}

impl fmt::Debug for ModelBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBundle")
            .field("columns", &self.columns)
            .field("dtypes", &self.dtypes)
            .field("threshold", &self.classifier.threshold())
            .finish()
    }
}

impl ModelBundle {
    pub fn new(
        columns: Vec<String>,
        dtypes: BTreeMap<String, Dtype>,
        classifier: Box<dyn Classifier>,
    ) -> anyhow::Result<Self> {
        if columns.is_empty() {
            bail!("column list is empty");
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                bail!("column `{column}` is listed twice");
            }
            if !dtypes.contains_key(column) {
                bail!("column `{column}` has no dtype");
            }
        }

        Ok(Self {
            columns,
            dtypes,
            classifier,
        })
    }

    /// Loads `columns.json`, `dtypes.json` and `model.json` from `dir`.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let columns: Vec<String> = read_json(&dir.join("columns.json"))?;
        let dtypes: BTreeMap<String, Dtype> = read_json(&dir.join("dtypes.json"))?;
        let model: LogisticModel = read_json(&dir.join("model.json"))?;

        model.check().context("model.json is not usable")?;
        if let Some(unknown) = model
            .features()
            .find(|feature| !columns.iter().any(|column| column.as_str() == *feature))
        {
            bail!("model feature `{unknown}` is not in columns.json");
        }

        let bundle = Self::new(columns, dtypes, Box::new(model))
            .with_context(|| format!("inconsistent artifacts in {}", dir.display()))?;
        log::info!(
            "loaded model artifacts from {} ({} columns)",
            dir.display(),
            bundle.columns().len()
        );
        Ok(bundle)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn threshold(&self) -> f64 {
        self.classifier.threshold()
    }

    /// Lays the record out in column order, casting each value to its column dtype.
    pub fn coerce(&self, record: &FeatureRecord) -> Result<ModelRow, ScoringError> {
        let mut columns = Vec::with_capacity(self.columns.len());

        for column in &self.columns {
            let value = record
                .get(column)
                .ok_or_else(|| ScoringError::MissingColumn(column.clone()))?;
            let dtype = self.dtypes[column];
            let typed = cast(value, dtype).ok_or_else(|| ScoringError::Coercion {
                column: column.clone(),
                dtype,
            })?;
            columns.push((column.clone(), typed));
        }

        Ok(ModelRow { columns })
    }

    /// Scores one validated record. The classifier runs exactly once.
    pub fn score(&self, record: &FeatureRecord) -> Result<Prediction, ScoringError> {
        let row = self.coerce(record)?;
        log::debug!(
            "scoring row [{}]",
            row.column_names().collect::<Vec<_>>().join(", ")
        );
        let prediction = self.classifier.predict(&row)?;
        if !(0.0..=1.0).contains(&prediction.probability) {
            return Err(ScoringError::InvalidProbability(prediction.probability));
        }
        Ok(prediction)
    }
}

fn cast(value: &FeatureValue, dtype: Dtype) -> Option<ColumnValue> {
    match (dtype, value) {
        (Dtype::Int64, FeatureValue::Integer(value)) => Some(ColumnValue::Int(*value)),
        (Dtype::Int64, FeatureValue::Real(value)) => Some(ColumnValue::Int(value.trunc() as i64)),
        (Dtype::Float64, FeatureValue::Integer(value)) => Some(ColumnValue::Float(*value as f64)),
        (Dtype::Float64, FeatureValue::Real(value)) => Some(ColumnValue::Float(*value)),
        (Dtype::Int64 | Dtype::Float64, FeatureValue::Category(_)) => None,
        (Dtype::Category | Dtype::Object, FeatureValue::Category(text)) => {
            Some(ColumnValue::Text(text.clone()))
        }
        (Dtype::Category | Dtype::Object, FeatureValue::Integer(value)) => {
            Some(ColumnValue::Text(value.to_string()))
        }
        (Dtype::Category | Dtype::Object, FeatureValue::Real(value)) => {
            Some(ColumnValue::Text(value.to_string()))
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}
