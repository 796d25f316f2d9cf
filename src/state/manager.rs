//! PostgreSQL state manager

use super::{
    clamp_score, Claim, ExecutionRecord, ExecutionStatus, ScannerState, StateStore, SwapRecord,
};
use crate::config::{DatabaseConfig, SelectorConfig};
use crate::error::{SolverError, SolverResult};
use crate::tx::{ExecutionContext, Receipt, TransactionIntent};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> SolverResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> SolverResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scanner_checkpoints (
                network VARCHAR(64) PRIMARY KEY,
                last_processed_block BIGINT,
                processed_transaction_hashes JSONB NOT NULL DEFAULT '[]',
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_scores (
                network VARCHAR(64) NOT NULL,
                node_url TEXT NOT NULL,
                score INTEGER NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (network, node_url)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nonce_reservations (
                network VARCHAR(64) NOT NULL,
                address VARCHAR(128) NOT NULL,
                uniqueness_token TEXT NOT NULL,
                nonce BIGINT NOT NULL,
                reserved_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (network, address, uniqueness_token)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_nonce_reservations_address
            ON nonce_reservations (network, address, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                build_id VARCHAR(66) PRIMARY KEY,
                owner VARCHAR(128) NOT NULL,
                intent JSONB NOT NULL,
                context JSONB NOT NULL,
                status VARCHAR(20) NOT NULL,
                receipt JSONB,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_executions_owner_status
            ON executions (owner, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS live_swaps (
                swap_id VARCHAR(66) PRIMARY KEY,
                commit_event JSONB NOT NULL,
                lock_event JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> SolverResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for StateManager {
    async fn load_checkpoint(&self, network: &str) -> SolverResult<Option<ScannerState>> {
        let row = sqlx::query(
            r#"
            SELECT last_processed_block, processed_transaction_hashes
            FROM scanner_checkpoints WHERE network = $1
            "#,
        )
        .bind(network)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let last: Option<i64> = r.get("last_processed_block");
            let hashes: serde_json::Value = r.get("processed_transaction_hashes");
            Ok(ScannerState {
                last_processed_block: last.map(|b| b as u64),
                processed_transaction_hashes: serde_json::from_value(hashes)?,
            })
        })
        .transpose()
    }

    async fn save_checkpoint(&self, network: &str, state: &ScannerState) -> SolverResult<()> {
        let hashes = serde_json::to_value(&state.processed_transaction_hashes)?;

        sqlx::query(
            r#"
            INSERT INTO scanner_checkpoints
                (network, last_processed_block, processed_transaction_hashes, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (network)
            DO UPDATE SET last_processed_block = $2, processed_transaction_hashes = $3, updated_at = NOW()
            "#,
        )
        .bind(network)
        .bind(state.last_processed_block.map(|b| b as i64))
        .bind(hashes)
        .execute(&self.pool)
        .await?;

        debug!(
            "Saved checkpoint for {}: block {:?}",
            network, state.last_processed_block
        );
        Ok(())
    }

    async fn node_score(&self, network: &str, node: &str) -> SolverResult<Option<i32>> {
        let row = sqlx::query("SELECT score FROM node_scores WHERE network = $1 AND node_url = $2")
            .bind(network)
            .bind(node)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i32, _>("score")))
    }

    async fn adjust_node_score(
        &self,
        network: &str,
        node: &str,
        delta: i32,
        bounds: &SelectorConfig,
    ) -> SolverResult<i32> {
        let row = sqlx::query(
            r#"
            INSERT INTO node_scores (network, node_url, score, updated_at)
            VALUES ($1, $2, LEAST($5, GREATEST($4, $3 + $6)), NOW())
            ON CONFLICT (network, node_url)
            DO UPDATE SET
                score = LEAST($5, GREATEST($4, node_scores.score + $6)),
                updated_at = NOW()
            RETURNING score
            "#,
        )
        .bind(network)
        .bind(node)
        .bind(bounds.initial_score)
        .bind(bounds.min_score)
        .bind(bounds.max_score)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;

        Ok(clamp_score(row.get::<i32, _>("score"), bounds))
    }

    async fn node_scores(&self, network: &str) -> SolverResult<Vec<(String, i32)>> {
        let rows = sqlx::query(
            "SELECT node_url, score FROM node_scores WHERE network = $1 ORDER BY node_url",
        )
        .bind(network)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("node_url"), r.get::<i32, _>("score")))
            .collect())
    }

    async fn reserve_nonce(
        &self,
        network: &str,
        address: &str,
        uniqueness_token: &str,
        floor: u64,
    ) -> SolverResult<u64> {
        let address = address.to_lowercase();
        let mut tx = self.pool.begin().await?;

        // Serialize allocations per (network, address) across solver instances
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || $2))")
            .bind(network)
            .bind(&address)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(
            r#"
            SELECT nonce FROM nonce_reservations
            WHERE network = $1 AND address = $2 AND uniqueness_token = $3
            "#,
        )
        .bind(network)
        .bind(&address)
        .bind(uniqueness_token)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.commit().await?;
            return Ok(row.get::<i64, _>("nonce") as u64);
        }

        let row = sqlx::query(
            r#"
            INSERT INTO nonce_reservations (network, address, uniqueness_token, nonce)
            SELECT $1, $2, $3, GREATEST($4, COALESCE(MAX(nonce) + 1, $4))
            FROM nonce_reservations
            WHERE network = $1 AND address = $2
            RETURNING nonce
            "#,
        )
        .bind(network)
        .bind(&address)
        .bind(uniqueness_token)
        .bind(floor as i64)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let nonce = row.get::<i64, _>("nonce") as u64;
        debug!(
            "Reserved nonce {} for {} on {} ({})",
            nonce, address, network, uniqueness_token
        );
        Ok(nonce)
    }

    async fn claim_execution(
        &self,
        build_id: &str,
        owner: &str,
        intent: &TransactionIntent,
        context: &ExecutionContext,
    ) -> SolverResult<Claim> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO executions (build_id, owner, intent, context, status)
            VALUES ($1, $2, $3, $4, 'running')
            ON CONFLICT (build_id) DO NOTHING
            "#,
        )
        .bind(build_id)
        .bind(owner)
        .bind(serde_json::to_value(intent)?)
        .bind(serde_json::to_value(context)?)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            return Ok(Claim::Fresh);
        }

        // Take over only when nobody else is running it
        let row = sqlx::query(
            r#"
            UPDATE executions
            SET owner = $2, status = 'running', updated_at = NOW()
            WHERE build_id = $1 AND (status = 'failed' OR owner = $2)
              AND status <> 'completed'
            RETURNING context
            "#,
        )
        .bind(build_id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let context: serde_json::Value = row.get("context");
            return Ok(Claim::Resumed(serde_json::from_value(context)?));
        }

        let row = sqlx::query("SELECT owner, status, context, receipt FROM executions WHERE build_id = $1")
            .bind(build_id)
            .fetch_one(&self.pool)
            .await?;

        let status = ExecutionStatus::parse(row.get::<String, _>("status").as_str());
        match status {
            ExecutionStatus::Completed => {
                let receipt: Option<serde_json::Value> = row.get("receipt");
                match receipt {
                    Some(receipt) => Ok(Claim::Completed(serde_json::from_value(receipt)?)),
                    None => {
                        let context: serde_json::Value = row.get("context");
                        Ok(Claim::Resumed(serde_json::from_value(context)?))
                    }
                }
            }
            _ => Ok(Claim::HeldBy(row.get::<String, _>("owner"))),
        }
    }

    async fn save_execution(&self, build_id: &str, context: &ExecutionContext) -> SolverResult<()> {
        let updated = sqlx::query(
            "UPDATE executions SET context = $2, updated_at = NOW() WHERE build_id = $1",
        )
        .bind(build_id)
        .bind(serde_json::to_value(context)?)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(SolverError::Internal(format!("unknown execution {}", build_id)));
        }
        Ok(())
    }

    async fn finish_execution(
        &self,
        build_id: &str,
        status: ExecutionStatus,
        context: &ExecutionContext,
        receipt: Option<&Receipt>,
        error: Option<&str>,
    ) -> SolverResult<()> {
        let receipt = receipt.map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            UPDATE executions
            SET status = $2, context = $3, receipt = $4, last_error = $5, updated_at = NOW()
            WHERE build_id = $1
            "#,
        )
        .bind(build_id)
        .bind(status.as_str())
        .bind(serde_json::to_value(context)?)
        .bind(receipt)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn running_executions(&self, owner: &str) -> SolverResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT build_id, owner, intent, context, status, receipt, last_error
            FROM executions
            WHERE owner = $1 AND status = 'running'
            ORDER BY created_at
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let receipt: Option<serde_json::Value> = row.get("receipt");
                Ok(ExecutionRecord {
                    build_id: row.get("build_id"),
                    owner: row.get("owner"),
                    intent: serde_json::from_value(row.get("intent"))?,
                    context: serde_json::from_value(row.get("context"))?,
                    status: ExecutionStatus::parse(row.get::<String, _>("status").as_str()),
                    receipt: receipt.map(serde_json::from_value).transpose()?,
                    last_error: row.get("last_error"),
                })
            })
            .collect()
    }

    async fn save_swap(&self, swap: &SwapRecord) -> SolverResult<()> {
        let lock = swap.lock.as_ref().map(serde_json::to_value).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO live_swaps (swap_id, commit_event, lock_event, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (swap_id)
            DO UPDATE SET commit_event = $2, lock_event = $3, updated_at = NOW()
            "#,
        )
        .bind(&swap.commit.swap_id)
        .bind(serde_json::to_value(&swap.commit)?)
        .bind(lock)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_swap(&self, swap_id: &str) -> SolverResult<()> {
        sqlx::query("DELETE FROM live_swaps WHERE swap_id = $1")
            .bind(swap_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn live_swaps(&self) -> SolverResult<Vec<SwapRecord>> {
        let rows = sqlx::query(
            "SELECT commit_event, lock_event FROM live_swaps ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let lock: Option<serde_json::Value> = row.get("lock_event");
                Ok(SwapRecord {
                    commit: serde_json::from_value(row.get("commit_event"))?,
                    lock: lock.map(serde_json::from_value).transpose()?,
                })
            })
            .collect()
    }
}
