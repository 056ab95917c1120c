use crate::config::DatabaseConfig;
use crate::error::{ProblemError, Result};
use crate::models::Problem;
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Insert and select-all over problem records
#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn insert(&self, problem: &Problem) -> Result<()>;

    /// Every stored record, in the backend's natural order
    async fn select_all(&self) -> Result<Vec<Problem>>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;
}

/// Row shape of the `problems` table
#[derive(Debug, Clone, FromRow)]
struct ProblemRow {
    id: Uuid,
    title: String,
    description: String,
}

impl From<ProblemRow> for Problem {
    fn from(row: ProblemRow) -> Self {
        // Attachment keys are not persisted in the table
        Self {
            id: row.id,
            title: row.title,
            description: row.description,
            files: Vec::new(),
        }
    }
}

/// PostgreSQL-backed record store
pub struct PgProblemStore {
    pool: PgPool,
}

impl PgProblemStore {
    /// Create a new store with its own connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .as_deref()
            .context("No database URL configured")?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}

#[async_trait]
impl ProblemStore for PgProblemStore {
    #[instrument(skip(self, problem), fields(problem_id = %problem.id))]
    async fn insert(&self, problem: &Problem) -> Result<()> {
        sqlx::query("INSERT INTO problems (id, title, description) VALUES ($1, $2, $3)")
            .bind(problem.id)
            .bind(&problem.title)
            .bind(&problem.description)
            .execute(&self.pool)
            .await
            .context("Failed to insert problem")
            .map_err(|e| ProblemError::storage("save problem", e))?;

        debug!(problem_id = %problem.id, "Problem inserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn select_all(&self) -> Result<Vec<Problem>> {
        let rows = sqlx::query_as::<_, ProblemRow>("SELECT id, title, description FROM problems")
            .fetch_all(&self.pool)
            .await
            .context("Failed to query problems")
            .map_err(|e| ProblemError::storage("load problems", e))?;

        Ok(rows.into_iter().map(Problem::from).collect())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")
            .map_err(|e| ProblemError::storage("reach database", e))?;

        Ok(())
    }
}

/// Record store held in process memory.
///
/// Appends take the write lock, so concurrent creations are serialized and
/// listing always returns insertion order.
#[derive(Default)]
pub struct MemoryProblemStore {
    problems: RwLock<Vec<Problem>>,
}

impl MemoryProblemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.problems.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.read().is_empty()
    }
}

#[async_trait]
impl ProblemStore for MemoryProblemStore {
    async fn insert(&self, problem: &Problem) -> Result<()> {
        let mut problems = self.problems.write();

        if problems.iter().any(|p| p.id == problem.id) {
            return Err(ProblemError::storage(
                "save problem",
                anyhow::anyhow!("duplicate problem id {}", problem.id),
            ));
        }

        problems.push(problem.clone());
        Ok(())
    }

    async fn select_all(&self) -> Result<Vec<Problem>> {
        Ok(self.problems.read().clone())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_row_maps_to_problem_without_files() {
        let row = ProblemRow {
            id: Uuid::new_v4(),
            title: "Leak in roof".to_string(),
            description: "Water damage".to_string(),
        };
        let id = row.id;

        let problem: Problem = row.into();
        assert_eq!(problem.id, id);
        assert_eq!(problem.title, "Leak in roof");
        assert!(problem.files.is_empty());
    }

    #[tokio::test]
    async fn test_memory_insert_preserves_order() {
        let store = MemoryProblemStore::new();
        let first = Problem::new("first", "one", vec![]);
        let second = Problem::new("second", "two", vec!["a.txt".to_string()]);

        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();

        assert_eq!(store.select_all().await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_memory_rejects_duplicate_id() {
        let store = MemoryProblemStore::new();
        let problem = Problem::new("t", "d", vec![]);

        store.insert(&problem).await.unwrap();
        let err = store.insert(&problem).await.unwrap_err();

        assert!(matches!(err, ProblemError::Storage { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_memory_concurrent_inserts_are_not_lost() {
        let store = Arc::new(MemoryProblemStore::new());

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert(&Problem::new(format!("title {i}"), "desc", vec![]))
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.len(), 64);
    }
}
