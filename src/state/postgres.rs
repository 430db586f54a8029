//! PostgreSQL loan store

use super::{LoanStats, LoanStore};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::relay::MessageId;
use crate::types::{AssetId, Domain, Loan, LoanId, LoanRecord, LoanState};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Loan store backed by PostgreSQL
pub struct PgLoanStore {
    pool: PgPool,
}

impl PgLoanStore {
    /// Connect to the configured database
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Create tables if they do not exist
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS loan_records (
                loan_id VARCHAR(66) PRIMARY KEY,
                source_domain BIGINT NOT NULL,
                destination_domain BIGINT NOT NULL,
                asset_id BIGINT NOT NULL,
                borrower VARCHAR(42) NOT NULL,
                principal TEXT NOT NULL,
                interest_rate_bps INTEGER NOT NULL,
                duration_secs BIGINT NOT NULL,
                issued_at TIMESTAMPTZ,
                due_at TIMESTAMPTZ,
                state VARCHAR(32) NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_attempt_at TIMESTAMPTZ,
                issue_expires_at TIMESTAMPTZ,
                last_observed_event_id TEXT,
                last_error TEXT,
                halted BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Tables created before issue deadlines were tracked
        sqlx::query(
            r#"
            ALTER TABLE loan_records
            ADD COLUMN IF NOT EXISTS issue_expires_at TIMESTAMPTZ
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_loan_records_state
            ON loan_records (state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_loan_records_borrower
            ON loan_records (borrower)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_messages (
                message_id VARCHAR(66) PRIMARY KEY,
                domain BIGINT NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_checkpoints (
                domain BIGINT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl LoanStore for PgLoanStore {
    async fn upsert_loan(&self, record: &LoanRecord) -> RelayerResult<()> {
        let loan = &record.loan;
        sqlx::query(
            r#"
            INSERT INTO loan_records
                (loan_id, source_domain, destination_domain, asset_id, borrower, principal,
                 interest_rate_bps, duration_secs, issued_at, due_at, state, attempt_count,
                 last_attempt_at, last_observed_event_id, last_error, halted, created_at, updated_at,
                 issue_expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (loan_id)
            DO UPDATE SET
                issued_at = $9,
                due_at = $10,
                state = $11,
                attempt_count = $12,
                last_attempt_at = $13,
                last_observed_event_id = $14,
                last_error = $15,
                halted = $16,
                updated_at = $18,
                issue_expires_at = $19
            "#,
        )
        .bind(loan.loan_id.to_hex())
        .bind(loan.source_domain as i64)
        .bind(loan.destination_domain as i64)
        .bind(loan.asset_id.0 as i64)
        .bind(format!("{:?}", loan.borrower))
        .bind(loan.principal.to_string())
        .bind(loan.interest_rate_bps as i32)
        .bind(loan.duration_secs as i64)
        .bind(loan.issued_at)
        .bind(loan.due_at)
        .bind(loan.state.as_str())
        .bind(record.attempt_count as i32)
        .bind(record.last_attempt_at)
        .bind(&record.last_observed_event_id)
        .bind(&record.last_error)
        .bind(record.halted)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.issue_expires_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved loan {} in state {}", loan.loan_id, loan.state);
        Ok(())
    }

    async fn get_loan(&self, loan_id: &LoanId) -> RelayerResult<Option<LoanRecord>> {
        let row = sqlx::query("SELECT * FROM loan_records WHERE loan_id = $1")
            .bind(loan_id.to_hex())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    async fn loans_in_flight(&self) -> RelayerResult<Vec<LoanRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM loan_records
            WHERE state NOT IN ('collateral_released', 'defaulted', 'failed')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn loans_by_borrower(&self, borrower: Address) -> RelayerResult<Vec<LoanRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM loan_records
            WHERE borrower = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(format!("{:?}", borrower))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn is_message_processed(&self, message_id: &MessageId) -> RelayerResult<bool> {
        let row = sqlx::query("SELECT 1 AS found FROM processed_messages WHERE message_id = $1")
            .bind(message_id.to_hex())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn record_message(&self, message_id: &MessageId, domain: Domain) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_messages (message_id, domain)
            VALUES ($1, $2)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(message_id.to_hex())
        .bind(domain as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_checkpoint(&self, domain: Domain) -> RelayerResult<u64> {
        let row = sqlx::query("SELECT block_number FROM chain_checkpoints WHERE domain = $1")
            .bind(domain as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row
            .map(|r| r.get::<i64, _>("block_number") as u64)
            .unwrap_or(0))
    }

    async fn save_checkpoint(&self, domain: Domain, block_number: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_checkpoints (domain, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (domain)
            DO UPDATE SET block_number = $2, updated_at = NOW()
            "#,
        )
        .bind(domain as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for domain {}: block {}", domain, block_number);
        Ok(())
    }

    async fn stats(&self) -> RelayerResult<LoanStats> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS count, COUNT(*) FILTER (WHERE halted) AS halted
            FROM loan_records
            GROUP BY state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_state = BTreeMap::new();
        let mut total = 0;
        let mut halted = 0;
        for row in rows {
            let count = row.get::<i64, _>("count") as u64;
            total += count;
            halted += row.get::<i64, _>("halted") as u64;
            by_state.insert(row.get::<String, _>("state"), count);
        }

        Ok(LoanStats {
            total,
            halted,
            by_state,
        })
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> RelayerResult<LoanRecord> {
    let corrupt = |field: &str, e: String| {
        RelayerError::Internal(format!("corrupt loan record field {}: {}", field, e))
    };

    let loan_id: LoanId = row
        .get::<String, _>("loan_id")
        .parse()
        .map_err(|e: String| corrupt("loan_id", e))?;
    let borrower: Address = row
        .get::<String, _>("borrower")
        .parse()
        .map_err(|e: <Address as std::str::FromStr>::Err| corrupt("borrower", e.to_string()))?;
    let principal = U256::from_dec_str(&row.get::<String, _>("principal"))
        .map_err(|e| corrupt("principal", e.to_string()))?;
    let state: LoanState = row
        .get::<String, _>("state")
        .parse()
        .map_err(|e: String| corrupt("state", e))?;

    let loan = Loan {
        loan_id,
        source_domain: row.get::<i64, _>("source_domain") as Domain,
        destination_domain: row.get::<i64, _>("destination_domain") as Domain,
        asset_id: AssetId(row.get::<i64, _>("asset_id") as u64),
        borrower,
        principal,
        interest_rate_bps: row.get::<i32, _>("interest_rate_bps") as u32,
        duration_secs: row.get::<i64, _>("duration_secs") as u64,
        issued_at: row.get::<Option<DateTime<Utc>>, _>("issued_at"),
        due_at: row.get::<Option<DateTime<Utc>>, _>("due_at"),
        state,
    };

    Ok(LoanRecord {
        loan,
        attempt_count: row.get::<i32, _>("attempt_count") as u32,
        last_attempt_at: row.get::<Option<DateTime<Utc>>, _>("last_attempt_at"),
        issue_expires_at: row.get::<Option<DateTime<Utc>>, _>("issue_expires_at"),
        last_observed_event_id: row.get::<Option<String>, _>("last_observed_event_id"),
        last_error: row.get::<Option<String>, _>("last_error"),
        halted: row.get::<bool, _>("halted"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}
