use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::models::ScoredObservation;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("observation `{0}` already exists")]
    DuplicateId(String),
    #[error("observation `{0}` does not exist")]
    NotFound(String),
    #[error("prediction store failure: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable mapping from observation id to its scored row. At most one row per id.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateId`] when the id is already stored.
    async fn insert(&self, observation: &ScoredObservation) -> Result<(), StoreError>;

    async fn lookup(&self, observation_id: &str) -> Result<Option<ScoredObservation>, StoreError>;

    /// Sets `true_class` in one atomic step and returns the updated row.
    async fn update_true_class(
        &self,
        observation_id: &str,
        true_class: i64,
    ) -> Result<ScoredObservation, StoreError>;

    /// Every stored row, ordered by the bytes of the observation id.
    async fn list(&self) -> Result<Vec<ScoredObservation>, StoreError>;
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgPredictionStore {
    pool: PgPool,
}

impl PgPredictionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn observation_from_row(row: &PgRow) -> ScoredObservation {
    ScoredObservation {
        observation_id: row.get("observation_id"),
        observation: row.get("observation"),
        proba: row.get("proba"),
        true_class: row.get("true_class"),
    }
}

#[async_trait]
impl PredictionStore for PgPredictionStore {
    async fn insert(&self, observation: &ScoredObservation) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO income_scoring.predictions
            (observation_id, observation, proba, true_class)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (observation_id) DO NOTHING
            "#,
        )
        .bind(&observation.observation_id)
        .bind(&observation.observation)
        .bind(observation.proba)
        .bind(observation.true_class)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateId(observation.observation_id.clone()));
        }

        Ok(())
    }

    async fn lookup(&self, observation_id: &str) -> Result<Option<ScoredObservation>, StoreError> {
        let row = sqlx::query(
            "SELECT observation_id, observation, proba, true_class \
             FROM income_scoring.predictions WHERE observation_id = $1",
        )
        .bind(observation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(observation_from_row))
    }

    async fn update_true_class(
        &self,
        observation_id: &str,
        true_class: i64,
    ) -> Result<ScoredObservation, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE income_scoring.predictions
            SET true_class = $2
            WHERE observation_id = $1
            RETURNING observation_id, observation, proba, true_class
            "#,
        )
        .bind(observation_id)
        .bind(true_class)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(observation_from_row)
            .ok_or_else(|| StoreError::NotFound(observation_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<ScoredObservation>, StoreError> {
        let rows = sqlx::query(
            "SELECT observation_id, observation, proba, true_class \
             FROM income_scoring.predictions ORDER BY observation_id COLLATE \"C\"",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(observation_from_row).collect())
    }
}

/// Process-local store for dry runs and tests. Nothing survives the process.
#[derive(Default)]
pub struct MemoryPredictionStore {
    rows: Mutex<BTreeMap<String, ScoredObservation>>,
}

impl MemoryPredictionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PredictionStore for MemoryPredictionStore {
    async fn insert(&self, observation: &ScoredObservation) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&observation.observation_id) {
            return Err(StoreError::DuplicateId(observation.observation_id.clone()));
        }
        rows.insert(observation.observation_id.clone(), observation.clone());
        Ok(())
    }

    async fn lookup(&self, observation_id: &str) -> Result<Option<ScoredObservation>, StoreError> {
        Ok(self.rows.lock().await.get(observation_id).cloned())
    }

    async fn update_true_class(
        &self,
        observation_id: &str,
        true_class: i64,
    ) -> Result<ScoredObservation, StoreError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .get_mut(observation_id)
            .ok_or_else(|| StoreError::NotFound(observation_id.to_string()))?;
        row.true_class = Some(true_class);
        Ok(row.clone())
    }

    async fn list(&self) -> Result<Vec<ScoredObservation>, StoreError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }
}
