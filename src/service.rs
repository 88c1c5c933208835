use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;

use crate::db::{PredictionStore, StoreError};
use crate::models::{observation_key, CorrectResponse, ScoreResponse, ScoredObservation};
use crate::scorer::ModelBundle;
use crate::validate::validate;

/// The `score` operation over a shared model bundle and a store.
///
/// Client mistakes come back as `Ok` responses carrying an `error` field. An
/// `Err` means an internal fault: the model rejected a validated record or the
/// store is unreachable. The same split holds for [`correct`] and [`lookup`].
pub struct ScoringService<S> {
    bundle: Arc<ModelBundle>,
    store: S,
}

impl<S: PredictionStore> ScoringService<S> {
    pub fn new(bundle: Arc<ModelBundle>, store: S) -> Self {
        Self { bundle, store }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn score(&self, request: &Value) -> anyhow::Result<ScoreResponse> {
        let valid = match validate(request) {
            Ok(valid) => valid,
            Err(rejection) => {
                log::debug!("rejected scoring request: {}", rejection.reason);
                return Ok(ScoreResponse::Rejected {
                    observation_id: rejection.observation_id.unwrap_or(Value::Null),
                    error: rejection.reason,
                });
            }
        };

        let key = observation_key(&valid.observation_id);
        let prediction = self
            .bundle
            .score(&valid.record)
            .with_context(|| format!("model failed to score observation '{key}'"))?;

        let observation = ScoredObservation {
            observation_id: key.clone(),
            observation: serde_json::to_string(request)?,
            proba: prediction.probability,
            true_class: None,
        };

        // A repeated id still gets its prediction back, flagged with an error.
        let error = match self.store.insert(&observation).await {
            Ok(()) => {
                log::info!(
                    "scored observation '{key}' probability {:.4}",
                    prediction.probability
                );
                None
            }
            Err(StoreError::DuplicateId(_)) => {
                let message = format!("ERROR: Observation ID: '{key}' already exists");
                log::warn!("{message}");
                Some(message)
            }
            Err(err) => {
                return Err(anyhow::Error::new(err).context("failed to persist prediction"))
            }
        };

        Ok(ScoreResponse::Scored {
            observation_id: valid.observation_id,
            prediction: prediction.label,
            probability: prediction.probability,
            error,
        })
    }
}

/// Records the true class for a scored observation. Needs only the store, so
/// corrections keep working without the model artifacts.
pub async fn correct<S>(store: &S, request: &Value) -> anyhow::Result<CorrectResponse>
where
    S: PredictionStore + ?Sized,
{
    let Some(id) = request.get("id") else {
        return Ok(failed("`id` not found in request"));
    };
    let Some(true_class) = request.get("true_class") else {
        return Ok(failed("`true_class` not found in request"));
    };
    let Some(true_class) = true_class.as_i64() else {
        return Ok(failed("true_class must be an integer"));
    };

    let key = observation_key(id);
    match store.update_true_class(&key, true_class).await {
        Ok(row) => {
            log::info!("recorded true_class {true_class} for observation '{key}'");
            Ok(CorrectResponse::Updated(row))
        }
        Err(StoreError::NotFound(_)) => {
            log::warn!("correction for unknown observation '{key}'");
            Ok(failed(format!("Observation ID '{key}' does not exist")))
        }
        Err(err) => Err(anyhow::Error::new(err).context("failed to record correction")),
    }
}

pub async fn lookup<S>(store: &S, id: &Value) -> anyhow::Result<Option<ScoredObservation>>
where
    S: PredictionStore + ?Sized,
{
    let key = observation_key(id);
    store
        .lookup(&key)
        .await
        .with_context(|| format!("failed to look up observation '{key}'"))
}

fn failed(error: impl Into<String>) -> CorrectResponse {
    CorrectResponse::Failed {
        error: error.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryPredictionStore;
    use crate::models::Prediction;
    use crate::schema::{self, FeatureKind};
    use crate::scorer::tests::sample_bundle;
    use crate::scorer::{Classifier, Dtype, ModelRow, ScoringError};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> ScoringService<MemoryPredictionStore> {
        ScoringService::new(Arc::new(sample_bundle()), MemoryPredictionStore::new())
    }

    fn request(id: Value) -> Value {
        json!({
            "observation_id": id,
            "data": {
                "age": 45,
                "sex": "Male",
                "race": "Black",
                "workclass": "Federal-gov",
                "education": "Bachelors",
                "marital-status": "Married-civ-spouse",
                "capital-gain": 0,
                "capital-loss": 0,
                "hours-per-week": 45.5
            }
        })
    }

    struct CountingClassifier {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Classifier for CountingClassifier {
        fn predict(&self, _row: &ModelRow) -> Result<Prediction, ScoringError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ScoringError::InvalidProbability(f64::NAN));
            }
            Ok(Prediction {
                label: false,
                probability: 0.25,
            })
        }

        fn threshold(&self) -> f64 {
            0.5
        }
    }

    fn counting_service(fail: bool) -> (ScoringService<MemoryPredictionStore>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dtypes = BTreeMap::new();
        for spec in schema::FEATURES {
            let dtype = match spec.kind {
                FeatureKind::Categorical(_) => Dtype::Category,
                FeatureKind::Integer { .. } => Dtype::Int64,
                FeatureKind::Numeric { .. } => Dtype::Float64,
            };
            dtypes.insert(spec.name.to_string(), dtype);
        }
        let columns = schema::FEATURES.iter().map(|spec| spec.name.to_string()).collect();
        let classifier = CountingClassifier {
            calls: Arc::clone(&calls),
            fail,
        };
        let bundle = ModelBundle::new(columns, dtypes, Box::new(classifier)).unwrap();
        (
            ScoringService::new(Arc::new(bundle), MemoryPredictionStore::new()),
            calls,
        )
    }

    #[tokio::test]
    async fn score_then_correct_end_to_end() {
        let service = service();

        let response = service.score(&request(json!("A1"))).await.unwrap();
        let ScoreResponse::Scored {
            observation_id,
            probability,
            error,
            ..
        } = response
        else {
            panic!("expected a scored response");
        };
        assert_eq!(observation_id, json!("A1"));
        assert_eq!(error, None);

        let rows = service.store().list().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].observation_id, "A1");
        assert_eq!(rows[0].true_class, None);
        assert_eq!(rows[0].proba, probability);

        let corrected = correct(service.store(), &json!({"id": "A1", "true_class": 1}))
            .await
            .unwrap();
        let CorrectResponse::Updated(row) = corrected else {
            panic!("expected the updated row");
        };
        assert_eq!(row.true_class, Some(1));
        assert_eq!(row.proba, probability);

        let stored = lookup(service.store(), &json!("A1")).await.unwrap().unwrap();
        assert_eq!(stored.true_class, Some(1));
        assert_eq!(stored.proba, probability);
    }

    #[tokio::test]
    async fn stored_observation_is_the_raw_request() {
        let service = service();
        let request = request(json!("A1"));
        service.score(&request).await.unwrap();

        let stored = lookup(service.store(), &json!("A1")).await.unwrap().unwrap();
        let raw: Value = serde_json::from_str(&stored.observation).unwrap();
        assert_eq!(raw, request);
    }

    #[tokio::test]
    async fn duplicate_id_keeps_prediction_and_adds_error() {
        let service = service();
        let first = service.score(&request(json!("A1"))).await.unwrap();
        let second = service.score(&request(json!("A1"))).await.unwrap();

        let (
            ScoreResponse::Scored {
                prediction: first_label,
                probability: first_probability,
                ..
            },
            ScoreResponse::Scored {
                prediction,
                probability,
                error,
                ..
            },
        ) = (&first, &second)
        else {
            panic!("both requests should be scored");
        };
        assert_eq!(prediction, first_label);
        assert_eq!(probability, first_probability);
        assert_eq!(
            error.as_deref(),
            Some("ERROR: Observation ID: 'A1' already exists")
        );
        assert_eq!(service.store().list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejection_without_identifier_reports_null() {
        let service = service();
        let mut request = request(json!("A1"));
        request.as_object_mut().unwrap().remove("observation_id");

        let response = service.score(&request).await.unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"observation_id": null, "error": "observation_id not found in request"})
        );
        assert!(service.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejection_echoes_identifier_and_stores_nothing() {
        let service = service();
        let mut request = request(json!(77));
        request["data"]["age"] = json!(201);

        let response = service.score(&request).await.unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"observation_id": 77, "error": "age: 201 is not a valid value for this feature"})
        );
        assert!(service.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn numeric_identifiers_are_stored_as_text() {
        let service = service();
        let response = service.score(&request(json!(42))).await.unwrap();
        assert_eq!(serde_json::to_value(&response).unwrap()["observation_id"], json!(42));

        let corrected = correct(service.store(), &json!({"id": 42, "true_class": 0}))
            .await
            .unwrap();
        assert!(matches!(corrected, CorrectResponse::Updated(row) if row.observation_id == "42"));
    }

    #[tokio::test]
    async fn correcting_unknown_id_leaves_store_untouched() {
        let service = service();
        service.score(&request(json!("A1"))).await.unwrap();
        let before = service.store().list().await.unwrap();

        let response = correct(service.store(), &json!({"id": "B7", "true_class": 1}))
            .await
            .unwrap();
        assert_eq!(
            response,
            CorrectResponse::Failed {
                error: "Observation ID 'B7' does not exist".to_string()
            }
        );
        assert_eq!(service.store().list().await.unwrap(), before);
    }

    #[tokio::test]
    async fn repeated_corrections_overwrite() {
        let service = service();
        service.score(&request(json!("A1"))).await.unwrap();

        for true_class in [1, 0, 1] {
            let response = correct(service.store(), &json!({"id": "A1", "true_class": true_class}))
                .await
                .unwrap();
            assert!(matches!(response, CorrectResponse::Updated(row) if row.true_class == Some(true_class)));
        }
    }

    #[tokio::test]
    async fn correction_requires_both_fields() {
        let service = service();
        assert_eq!(
            correct(service.store(), &json!({"true_class": 1})).await.unwrap(),
            failed("`id` not found in request")
        );
        assert_eq!(
            correct(service.store(), &json!({"id": "A1"})).await.unwrap(),
            failed("`true_class` not found in request")
        );
        assert_eq!(
            correct(service.store(), &json!({"id": "A1", "true_class": "yes"}))
                .await
                .unwrap(),
            failed("true_class must be an integer")
        );
    }

    #[tokio::test]
    async fn classifier_runs_once_per_valid_request() {
        let (service, calls) = counting_service(false);
        service.score(&request(json!("A1"))).await.unwrap();
        let mut invalid = request(json!("A2"));
        invalid["data"]["sex"] = json!("Unknown");
        service.score(&invalid).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scoring_failure_is_an_internal_error() {
        let (service, calls) = counting_service(true);
        let err = service.score(&request(json!("A1"))).await.unwrap_err();

        assert!(err.to_string().contains("A1"));
        assert!(err.downcast_ref::<ScoringError>().is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(service.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn null_identifier_is_rejected_and_never_stored() {
        let service = service();
        for _ in 0..2 {
            let response = service.score(&request(json!(null))).await.unwrap();
            assert_eq!(
                serde_json::to_value(&response).unwrap(),
                json!({"observation_id": null, "error": "observation_id must be a string or number"})
            );
        }

        let response = service.score(&request(json!({"nested": 1}))).await.unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap()["observation_id"],
            json!({"nested": 1})
        );
        assert!(service.store().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrections_and_lookups_need_only_the_store() {
        let store = MemoryPredictionStore::new();
        store
            .insert(&ScoredObservation {
                observation_id: "A1".to_string(),
                observation: "{}".to_string(),
                proba: 0.4,
                true_class: None,
            })
            .await
            .unwrap();

        let response = correct(&store, &json!({"id": "A1", "true_class": 1}))
            .await
            .unwrap();
        assert!(matches!(response, CorrectResponse::Updated(row) if row.true_class == Some(1)));
        let stored = lookup(&store, &json!("A1")).await.unwrap().unwrap();
        assert_eq!(stored.true_class, Some(1));
        assert_eq!(lookup(&store, &json!("B2")).await.unwrap(), None);
    }
}
