//! PostgreSQL store implementation.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, instrument};

use crate::domain::{
    AppError, BroadcastGate, CANCELLED_REASON, CancelOutcome, CustomConfig, DatabaseError,
    Direction, EphemeralWallet, HistoricalTransaction, HopFailure, HopOutcome, HopPlan, HopStatus,
    HopStep, HopWalletRecord, HopWalletStore, KnownEntity, Lease, PrivacyLevel,
    PrivacyPreferences, SignedTransaction, StatusTransition, TransactionHistoryStore,
    TransferHistoryFilter, TransferRecord, TransferRequest, TransferStatus, TransferStore,
    WalletInfo, WalletStore,
};

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl PostgresConfig {
    /// Load pool sizing from `DATABASE_MAX_CONNECTIONS` / `DATABASE_MIN_CONNECTIONS`
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();
        Self {
            max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            min_connections: env::var("DATABASE_MIN_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_connections),
            ..defaults
        }
    }
}

/// PostgreSQL client backing every persistence trait
pub struct PostgresClient {
    pool: PgPool,
}

impl PostgresClient {
    /// Create a new PostgreSQL client with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new PostgreSQL client with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn hydrate(&self, row: &PgRow) -> Result<TransferRecord, AppError> {
        let id: String = row.try_get("id")?;

        let step_rows = sqlx::query(
            r#"
            SELECT hop_index, source_address, destination_address, signer_ref, amount, fee,
                   delay_secs, status, signer_address, signed_payload, signature, tx_id,
                   attempts, last_error, updated_at
            FROM hop_steps
            WHERE transfer_id = $1
            ORDER BY hop_index
            "#,
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        let outcome_rows = sqlx::query(
            r#"
            SELECT hop_index, status, tx_id, error, attempt, recorded_at
            FROM hop_outcomes
            WHERE transfer_id = $1
            ORDER BY id
            "#,
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        let transition_rows = sqlx::query(
            r#"
            SELECT from_status, to_status, changed_at
            FROM transfer_status_history
            WHERE transfer_id = $1
            ORDER BY id
            "#,
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        let chain: String = row.try_get("chain")?;
        let steps = step_rows
            .iter()
            .map(|r| row_to_step(r, &chain))
            .collect::<Result<Vec<_>, _>>()?;
        let outcomes = outcome_rows
            .iter()
            .map(row_to_outcome)
            .collect::<Result<Vec<_>, _>>()?;
        let transitions = transition_rows
            .iter()
            .map(row_to_transition)
            .collect::<Result<Vec<_>, _>>()?;

        let Json(request): Json<TransferRequest> = row.try_get("request")?;
        let failure = match row.try_get::<Option<i32>, _>("failure_hop")? {
            Some(hop) => Some(HopFailure {
                hop_index: from_i32(hop, "failure_hop")?,
                reason: row
                    .try_get::<Option<String>, _>("failure_reason")?
                    .unwrap_or_default(),
                holding_address: row
                    .try_get::<Option<String>, _>("failure_holding_address")?
                    .unwrap_or_default(),
            }),
            None => None,
        };
        let lease = match (
            row.try_get::<Option<String>, _>("lease_owner")?,
            row.try_get::<Option<DateTime<Utc>>, _>("lease_expires_at")?,
        ) {
            (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
            _ => None,
        };

        let plan = HopPlan {
            transfer_id: id.clone(),
            chain,
            token: row.try_get("token")?,
            privacy_level: parse(&row.try_get::<String, _>("privacy_level")?)?,
            steps,
            total_fee: row.try_get("total_fee")?,
            estimated_latency_secs: from_i64(row.try_get("estimated_latency_secs")?)?,
            simulated_risk_score: from_i16(row.try_get("simulated_risk_score")?)?,
            privacy_score: from_i16(row.try_get("privacy_score")?)?,
            created_at: row.try_get("planned_at")?,
        };

        Ok(TransferRecord {
            id,
            request,
            source_address: row.try_get("source_address")?,
            amount: row.try_get("amount")?,
            plan,
            status: parse(&row.try_get::<String, _>("status")?)?,
            execution_requested: row.try_get("execution_requested")?,
            cancel_requested: row.try_get("cancel_requested")?,
            failure,
            outcomes,
            transitions,
            lease,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    async fn record_transition(
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
        from: Option<TransferStatus>,
        to: TransferStatus,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO transfer_status_history (transfer_id, from_status, to_status, changed_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(from.map(|s| s.as_str()))
        .bind(to.as_str())
        .bind(at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

const RECORD_COLUMNS: &str = r#"
    id, source_wallet_id, source_address, request, amount, chain, token, privacy_level,
    total_fee, estimated_latency_secs, simulated_risk_score, privacy_score, planned_at,
    status, execution_requested, cancel_requested, failure_hop, failure_reason,
    failure_holding_address, lease_owner, lease_expires_at, created_at, updated_at,
    started_at, completed_at
"#;

// ============================================================================
// ROW MAPPING
// ============================================================================

fn parse<T: FromStr<Err = String>>(value: &str) -> Result<T, AppError> {
    value
        .parse()
        .map_err(|e: String| AppError::Database(DatabaseError::Corrupt(e)))
}

fn corrupt(field: &str) -> AppError {
    AppError::Database(DatabaseError::Corrupt(format!("{} out of range", field)))
}

fn from_i32(value: i32, field: &str) -> Result<usize, AppError> {
    usize::try_from(value).map_err(|_| corrupt(field))
}

fn from_i64(value: i64) -> Result<u64, AppError> {
    u64::try_from(value).map_err(|_| corrupt("duration"))
}

fn from_i16(value: i16) -> Result<u8, AppError> {
    u8::try_from(value).map_err(|_| corrupt("score"))
}

fn to_i32(value: usize) -> Result<i32, AppError> {
    i32::try_from(value).map_err(|_| corrupt("index"))
}

fn to_i64(value: u64) -> Result<i64, AppError> {
    i64::try_from(value).map_err(|_| corrupt("duration"))
}

fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, AppError> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|_| corrupt("lease ttl"))?;
    Ok(now + ttl)
}

fn row_to_step(row: &PgRow, chain: &str) -> Result<HopStep, AppError> {
    let signed_tx = match (
        row.try_get::<Option<String>, _>("signer_address")?,
        row.try_get::<Option<Vec<u8>>, _>("signed_payload")?,
        row.try_get::<Option<String>, _>("signature")?,
    ) {
        (Some(signer_address), Some(payload), Some(signature)) => Some(SignedTransaction {
            chain: chain.to_string(),
            signer_address,
            payload,
            signature,
        }),
        _ => None,
    };

    Ok(HopStep {
        index: from_i32(row.try_get("hop_index")?, "hop_index")?,
        source_address: row.try_get("source_address")?,
        destination_address: row.try_get("destination_address")?,
        signer_ref: row.try_get("signer_ref")?,
        amount: row.try_get("amount")?,
        fee: row.try_get("fee")?,
        delay_secs: from_i64(row.try_get("delay_secs")?)?,
        status: parse(&row.try_get::<String, _>("status")?)?,
        signed_tx,
        tx_id: row.try_get("tx_id")?,
        attempts: u32::try_from(row.try_get::<i32, _>("attempts")?)
            .map_err(|_| corrupt("attempts"))?,
        last_error: row.try_get("last_error")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_outcome(row: &PgRow) -> Result<HopOutcome, AppError> {
    Ok(HopOutcome {
        hop_index: from_i32(row.try_get("hop_index")?, "hop_index")?,
        status: parse(&row.try_get::<String, _>("status")?)?,
        tx_id: row.try_get("tx_id")?,
        error: row.try_get("error")?,
        attempt: u32::try_from(row.try_get::<i32, _>("attempt")?)
            .map_err(|_| corrupt("attempt"))?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn row_to_transition(row: &PgRow) -> Result<StatusTransition, AppError> {
    let from = match row.try_get::<Option<String>, _>("from_status")? {
        Some(s) => Some(parse(&s)?),
        None => None,
    };
    Ok(StatusTransition {
        from,
        to: parse(&row.try_get::<String, _>("to_status")?)?,
        at: row.try_get("changed_at")?,
    })
}

fn row_to_hop_wallet(row: &PgRow) -> Result<HopWalletRecord, AppError> {
    Ok(HopWalletRecord {
        wallet: EphemeralWallet {
            address: row.try_get("address")?,
            chain: row.try_get("chain")?,
            plan_id: row.try_get("plan_id")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            retired_at: row.try_get("retired_at")?,
        },
        encrypted_key: row.try_get("encrypted_key")?,
        key_fingerprint: row.try_get("key_fingerprint")?,
    })
}

// ============================================================================
// TRANSFER STORE
// ============================================================================

#[async_trait]
impl TransferStore for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(transfer_id = %record.id, steps = record.plan.steps.len()))]
    async fn insert_transfer(&self, record: &TransferRecord) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        let plan = &record.plan;

        sqlx::query(
            r#"
            INSERT INTO transfer_records (
                id, source_wallet_id, source_address, request, amount, chain, token,
                privacy_level, total_fee, estimated_latency_secs, simulated_risk_score,
                privacy_score, planned_at, status, execution_requested, cancel_requested,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(&record.id)
        .bind(&record.request.source_wallet_id)
        .bind(&record.source_address)
        .bind(Json(&record.request))
        .bind(record.amount)
        .bind(&plan.chain)
        .bind(&plan.token)
        .bind(plan.privacy_level.as_str())
        .bind(plan.total_fee)
        .bind(to_i64(plan.estimated_latency_secs)?)
        .bind(i16::from(plan.simulated_risk_score))
        .bind(i16::from(plan.privacy_score))
        .bind(plan.created_at)
        .bind(record.status.as_str())
        .bind(record.execution_requested)
        .bind(record.cancel_requested)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        for step in &plan.steps {
            sqlx::query(
                r#"
                INSERT INTO hop_steps (
                    transfer_id, hop_index, source_address, destination_address, signer_ref,
                    amount, fee, delay_secs, status, attempts, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(&record.id)
            .bind(to_i32(step.index)?)
            .bind(&step.source_address)
            .bind(&step.destination_address)
            .bind(&step.signer_ref)
            .bind(step.amount)
            .bind(step.fee)
            .bind(to_i64(step.delay_secs)?)
            .bind(step.status.as_str())
            .bind(i32::try_from(step.attempts).map_err(|_| corrupt("attempts"))?)
            .bind(step.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for transition in &record.transitions {
            Self::record_transition(&mut tx, &record.id, transition.from, transition.to, transition.at)
                .await?;
        }

        tx.commit().await?;
        debug!("Transfer record inserted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_transfer(&self, id: &str) -> Result<Option<TransferRecord>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM transfer_records WHERE id = $1",
            RECORD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, filter))]
    async fn list_transfers(
        &self,
        wallet_id: &str,
        filter: &TransferHistoryFilter,
    ) -> Result<Vec<TransferRecord>, AppError> {
        let limit = filter.limit.clamp(1, 100);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM transfer_records
            WHERE source_wallet_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
            RECORD_COLUMNS
        ))
        .bind(wallet_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(self.hydrate(row).await?);
        }
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn mark_execution_requested(&self, id: &str) -> Result<bool, AppError> {
        let updated = sqlx::query(
            r#"
            UPDATE transfer_records
            SET execution_requested = TRUE, updated_at = NOW()
            WHERE id = $1 AND status = 'planned' AND NOT cancel_requested
            RETURNING id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(updated.is_some())
    }

    #[instrument(skip(self))]
    async fn list_resumable(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM transfer_records
            WHERE execution_requested
              AND status IN ('planned', 'in_progress')
              AND (lease_expires_at IS NULL OR lease_expires_at < $1)
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("id").map_err(AppError::from))
            .collect()
    }

    #[instrument(skip(self))]
    async fn acquire_lease(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool, AppError> {
        let now = Utc::now();
        let acquired = sqlx::query(
            r#"
            UPDATE transfer_records
            SET lease_owner = $2, lease_expires_at = $3
            WHERE id = $1
              AND (lease_owner IS NULL OR lease_expires_at < $4 OR lease_owner = $2)
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(lease_expiry(now, ttl)?)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    #[instrument(skip(self))]
    async fn renew_lease(&self, id: &str, owner: &str, ttl: Duration) -> Result<bool, AppError> {
        let renewed = sqlx::query(
            r#"
            UPDATE transfer_records
            SET lease_expires_at = $3
            WHERE id = $1 AND lease_owner = $2
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(lease_expiry(Utc::now(), ttl)?)
        .fetch_optional(&self.pool)
        .await?;
        Ok(renewed.is_some())
    }

    #[instrument(skip(self))]
    async fn release_lease(&self, id: &str, owner: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE transfer_records
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, failure), fields(from = %from, to = %to))]
    async fn transition_status(
        &self,
        id: &str,
        from: TransferStatus,
        to: TransferStatus,
        failure: Option<&HopFailure>,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let failure_hop = failure.map(|f| to_i32(f.hop_index)).transpose()?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE transfer_records
            SET status = $3,
                updated_at = $4,
                started_at = CASE WHEN $3 = 'in_progress' THEN COALESCE(started_at, $4) ELSE started_at END,
                completed_at = CASE WHEN $5 THEN $4 ELSE completed_at END,
                failure_hop = COALESCE($6, failure_hop),
                failure_reason = COALESCE($7, failure_reason),
                failure_holding_address = COALESCE($8, failure_holding_address)
            WHERE id = $1 AND status = $2
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .bind(to.is_terminal())
        .bind(failure_hop)
        .bind(failure.map(|f| f.reason.as_str()))
        .bind(failure.map(|f| f.holding_address.as_str()))
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }
        Self::record_transition(&mut tx, id, Some(from), to, now).await?;
        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn begin_hop_broadcast(&self, id: &str, hop_index: usize) -> Result<BroadcastGate, AppError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT cancel_requested FROM transfer_records WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("transfer {}", id)))?;
        if row.try_get::<bool, _>("cancel_requested")? {
            tx.rollback().await?;
            return Ok(BroadcastGate::Cancelled);
        }

        let opened = sqlx::query(
            r#"
            UPDATE hop_steps
            SET status = 'broadcasting', updated_at = NOW()
            WHERE transfer_id = $1 AND hop_index = $2 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(to_i32(hop_index)?)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        tx.commit().await?;
        Ok(if opened {
            BroadcastGate::Open
        } else {
            BroadcastGate::Superseded
        })
    }

    #[instrument(skip(self, step), fields(hop = step.index, status = %step.status))]
    async fn update_hop(&self, id: &str, step: &HopStep) -> Result<(), AppError> {
        let signed = step.signed_tx.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE hop_steps
            SET status = $3, signer_address = $4, signed_payload = $5, signature = $6,
                tx_id = $7, attempts = $8, last_error = $9, updated_at = $10
            WHERE transfer_id = $1 AND hop_index = $2
            "#,
        )
        .bind(id)
        .bind(to_i32(step.index)?)
        .bind(step.status.as_str())
        .bind(signed.map(|s| s.signer_address.as_str()))
        .bind(signed.map(|s| s.payload.as_slice()))
        .bind(signed.map(|s| s.signature.as_str()))
        .bind(step.tx_id.as_deref())
        .bind(i32::try_from(step.attempts).map_err(|_| corrupt("attempts"))?)
        .bind(step.last_error.as_deref())
        .bind(step.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("hop {} of {}", step.index, id)).into());
        }
        Ok(())
    }

    #[instrument(skip(self, outcome), fields(hop = outcome.hop_index, status = %outcome.status))]
    async fn append_outcome(&self, id: &str, outcome: &HopOutcome) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO hop_outcomes (transfer_id, hop_index, status, tx_id, error, attempt, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(to_i32(outcome.hop_index)?)
        .bind(outcome.status.as_str())
        .bind(outcome.tx_id.as_deref())
        .bind(outcome.error.as_deref())
        .bind(i32::try_from(outcome.attempt).map_err(|_| corrupt("attempt"))?)
        .bind(outcome.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn request_cancellation(&self, id: &str) -> Result<CancelOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        let Some(row) = sqlx::query(
            "SELECT status, source_address FROM transfer_records WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(CancelOutcome::NotFound);
        };
        let status: TransferStatus = parse(&row.try_get::<String, _>("status")?)?;

        if status.is_terminal() {
            tx.rollback().await?;
            return Ok(CancelOutcome::AlreadyTerminal(status));
        }

        if status == TransferStatus::Planned {
            let now = Utc::now();
            let source: String = row.try_get("source_address")?;
            sqlx::query(
                r#"
                UPDATE transfer_records
                SET status = 'failed', cancel_requested = TRUE, updated_at = $2, completed_at = $2,
                    failure_hop = 0, failure_reason = $3, failure_holding_address = $4
                WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(now)
            .bind(CANCELLED_REASON)
            .bind(source)
            .execute(&mut *tx)
            .await?;
            Self::record_transition(&mut tx, id, Some(status), TransferStatus::Failed, now).await?;
            tx.commit().await?;
            return Ok(CancelOutcome::CancelledBeforeStart);
        }

        let current = sqlx::query(
            r#"
            SELECT hop_index, status FROM hop_steps
            WHERE transfer_id = $1 AND status <> 'confirmed'
            ORDER BY hop_index
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(step) = current {
            let hop_status: HopStatus = parse(&step.try_get::<String, _>("status")?)?;
            if hop_status == HopStatus::Broadcasting {
                let hop = from_i32(step.try_get("hop_index")?, "hop_index")?;
                tx.rollback().await?;
                return Ok(CancelOutcome::TooLate { hop });
            }
        }

        sqlx::query("UPDATE transfer_records SET cancel_requested = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(CancelOutcome::Requested)
    }
}

// ============================================================================
// HOP WALLET STORE
// ============================================================================

#[async_trait]
impl HopWalletStore for PostgresClient {
    #[instrument(skip(self, wallet), fields(plan_id = %wallet.wallet.plan_id))]
    async fn insert_hop_wallet(&self, wallet: &HopWalletRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO hop_wallets
                (address, chain, plan_id, encrypted_key, key_fingerprint, created_at, expires_at, retired_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&wallet.wallet.address)
        .bind(&wallet.wallet.chain)
        .bind(&wallet.wallet.plan_id)
        .bind(wallet.encrypted_key.as_deref())
        .bind(&wallet.key_fingerprint)
        .bind(wallet.wallet.created_at)
        .bind(wallet.wallet.expires_at)
        .bind(wallet.wallet.retired_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_hop_wallet(&self, address: &str) -> Result<Option<HopWalletRecord>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT address, chain, plan_id, encrypted_key, key_fingerprint, created_at, expires_at, retired_at
            FROM hop_wallets WHERE address = $1
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_hop_wallet).transpose()
    }

    #[instrument(skip(self))]
    async fn list_hop_wallets_for_plan(&self, plan_id: &str) -> Result<Vec<HopWalletRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT address, chain, plan_id, encrypted_key, key_fingerprint, created_at, expires_at, retired_at
            FROM hop_wallets WHERE plan_id = $1
            ORDER BY created_at, address
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_hop_wallet).collect()
    }

    async fn count_active_hop_wallets(&self) -> Result<i64, AppError> {
        let row = sqlx::query("SELECT COUNT(*) AS active FROM hop_wallets WHERE retired_at IS NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("active")?)
    }

    #[instrument(skip(self))]
    async fn list_expired_hop_wallet_plans(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT plan_id, MIN(expires_at) AS first_expiry
            FROM hop_wallets
            WHERE retired_at IS NULL AND expires_at <= $1
            GROUP BY plan_id
            ORDER BY first_expiry, plan_id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("plan_id").map_err(AppError::from))
            .collect()
    }

    #[instrument(skip(self))]
    async fn retire_hop_wallet(
        &self,
        address: &str,
        discard_key: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let retired = sqlx::query(
            r#"
            UPDATE hop_wallets
            SET retired_at = $3,
                encrypted_key = CASE WHEN $2 THEN NULL ELSE encrypted_key END
            WHERE address = $1 AND retired_at IS NULL
            RETURNING address
            "#,
        )
        .bind(address)
        .bind(discard_key)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(retired.is_some())
    }
}

// ============================================================================
// READ CONTRACTS
// ============================================================================

#[async_trait]
impl TransactionHistoryStore for PostgresClient {
    #[instrument(skip(self))]
    async fn get_transactions_for_address(
        &self,
        address: &str,
        chain: &str,
    ) -> Result<Vec<HistoricalTransaction>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT counterparty, amount, occurred_at, direction, chain
            FROM address_transactions
            WHERE address = $1 AND chain = $2
            ORDER BY occurred_at, id
            "#,
        )
        .bind(address)
        .bind(chain)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<HistoricalTransaction, AppError> {
                let direction: Direction = parse(&row.try_get::<String, _>("direction")?)?;
                Ok(HistoricalTransaction::new(
                    row.try_get::<String, _>("counterparty")?,
                    row.try_get::<Decimal, _>("amount")?,
                    row.try_get("occurred_at")?,
                    direction,
                    row.try_get::<String, _>("chain")?,
                ))
            })
            .collect()
    }

    async fn get_known_entities(&self) -> Result<Vec<KnownEntity>, AppError> {
        let rows = sqlx::query("SELECT address, label FROM known_entities ORDER BY address")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<KnownEntity, AppError> {
                Ok(KnownEntity {
                    address: row.try_get("address")?,
                    label: row.try_get("label")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl WalletStore for PostgresClient {
    #[instrument(skip(self))]
    async fn resolve_wallet(&self, wallet_id: &str) -> Result<Option<WalletInfo>, AppError> {
        let row = sqlx::query("SELECT wallet_id, address, chain FROM wallets WHERE wallet_id = $1")
            .bind(wallet_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<WalletInfo, AppError> {
            Ok(WalletInfo {
                wallet_id: row.try_get("wallet_id")?,
                address: row.try_get("address")?,
                chain: row.try_get("chain")?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn get_privacy_preferences(
        &self,
        wallet_id: &str,
    ) -> Result<Option<PrivacyPreferences>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT privacy_level, max_hops, max_fee_budget, max_total_latency_secs, min_hop_delay_secs
            FROM privacy_configs WHERE wallet_id = $1
            "#,
        )
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let privacy_level: PrivacyLevel = parse(&row.try_get::<String, _>("privacy_level")?)?;
        let custom = CustomConfig {
            max_hops: row
                .try_get::<Option<i32>, _>("max_hops")?
                .map(|v| from_i32(v, "max_hops"))
                .transpose()?,
            max_fee_budget: row.try_get("max_fee_budget")?,
            max_total_latency_secs: row
                .try_get::<Option<i64>, _>("max_total_latency_secs")?
                .map(from_i64)
                .transpose()?,
            min_hop_delay_secs: row
                .try_get::<Option<i64>, _>("min_hop_delay_secs")?
                .map(from_i64)
                .transpose()?,
        };

        Ok(Some(PrivacyPreferences {
            wallet_id: wallet_id.to_string(),
            privacy_level,
            custom,
        }))
    }
}
