//! Database access for ledger-service.
//!
//! Mutating queries take a `&mut PgConnection` so callers compose them inside one
//! transaction. Wallet rows are locked with `FOR UPDATE` for every read-modify-write.

use crate::models::{
    CreateRecurringRule, CreateWallet, NewWalletTransaction, RecurringTransactionRule,
    RuleStatus, RuleTrigger, TransactionStatus, Wallet, WalletStatus, WalletTransaction,
    WalletTransactionConsumption,
};
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::PgConnection;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const WALLET_COLUMNS: &str = "id, organization_id, customer_id, name, status, currency, rate_amount, \
     balance_cents, credits_balance, consumed_credits, consumed_amount_cents, \
     ongoing_balance_cents, credits_ongoing_balance, ongoing_usage_balance_cents, \
     credits_ongoing_usage_balance, depleted_ongoing_balance, paid_top_up_min_amount_cents, \
     paid_top_up_max_amount_cents, ready_to_be_refreshed, last_balance_sync_at, \
     last_consumed_credit_at, terminated_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, organization_id, wallet_id, transaction_type, status, \
     transaction_status, source, amount_cents, credit_amount, remaining_amount_cents, priority, \
     invoice_id, name, metadata, settled_at, failed_at, created_at, updated_at";

const RULE_COLUMNS: &str = "id, organization_id, wallet_id, trigger_type, method, interval_unit, \
     status, paid_credits, granted_credits, threshold_credits, target_ongoing_balance, started_at, \
     expiration_at, ignore_paid_top_up_limits, transaction_name, created_at, updated_at";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "ledger-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run the wallet ledger migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running ledger migrations");
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Ledger migrations completed");
        Ok(())
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(|e| AppError::from_db("Failed to begin transaction", e))
    }

    // -------------------------------------------------------------------------
    // Wallet reads
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(wallet_id = %wallet_id))]
    pub async fn get_wallet(&self, wallet_id: Uuid) -> Result<Option<Wallet>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_wallet"])
            .start_timer();

        let wallet = sqlx::query_as::<_, Wallet>(&format!(
            "SELECT {} FROM wallets WHERE id = $1",
            WALLET_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to get wallet", e))?;

        timer.observe_duration();
        Ok(wallet)
    }

    /// Active wallets of a customer, oldest first.
    #[instrument(skip(self), fields(customer_id = %customer_id))]
    pub async fn active_wallets_for_customer(
        &self,
        organization_id: Uuid,
        customer_id: Uuid,
    ) -> Result<Vec<Wallet>, AppError> {
        sqlx::query_as::<_, Wallet>(&format!(
            r#"
            SELECT {} FROM wallets
            WHERE organization_id = $1 AND customer_id = $2 AND status = 'active'
            ORDER BY created_at, id
            "#,
            WALLET_COLUMNS
        ))
        .bind(organization_id)
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list customer wallets", e))
    }

    #[instrument(skip(self), fields(wallet_id = %wallet_id))]
    pub async fn list_transactions(
        &self,
        wallet_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, AppError> {
        sqlx::query_as::<_, WalletTransaction>(&format!(
            "SELECT {} FROM wallet_transactions WHERE wallet_id = $1 ORDER BY created_at, id",
            TRANSACTION_COLUMNS
        ))
        .bind(wallet_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list wallet transactions", e))
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<WalletTransaction>, AppError> {
        sqlx::query_as::<_, WalletTransaction>(&format!(
            "SELECT {} FROM wallet_transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to get wallet transaction", e))
    }

    #[instrument(skip(self), fields(outbound_id = %outbound_id))]
    pub async fn consumptions_for_outbound(
        &self,
        outbound_id: Uuid,
    ) -> Result<Vec<WalletTransactionConsumption>, AppError> {
        sqlx::query_as::<_, WalletTransactionConsumption>(
            r#"
            SELECT c.id, c.organization_id, c.inbound_wallet_transaction_id,
                   c.outbound_wallet_transaction_id, c.consumed_amount_cents, c.created_at
            FROM wallet_transaction_consumptions c
            JOIN wallet_transactions t ON t.id = c.inbound_wallet_transaction_id
            WHERE c.outbound_wallet_transaction_id = $1
            ORDER BY t.priority, t.created_at, t.id
            "#,
        )
        .bind(outbound_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list consumptions", e))
    }

    /// Active interval rules on active wallets.
    #[instrument(skip(self))]
    pub async fn active_interval_rules(
        &self,
        at: DateTime<Utc>,
    ) -> Result<Vec<RecurringTransactionRule>, AppError> {
        sqlx::query_as::<_, RecurringTransactionRule>(&format!(
            r#"
            SELECT {} FROM recurring_transaction_rules r
            WHERE r.trigger_type = 'interval'
              AND r.status = 'active'
              AND (r.expiration_at IS NULL OR r.expiration_at > $1)
              AND EXISTS (SELECT 1 FROM wallets w WHERE w.id = r.wallet_id AND w.status = 'active')
            ORDER BY r.created_at, r.id
            "#,
            prefixed(RULE_COLUMNS, "r")
        ))
        .bind(at)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list interval rules", e))
    }

    /// Wallets flagged for an ongoing balance refresh.
    pub async fn wallets_ready_to_refresh(&self, limit: i64) -> Result<Vec<Wallet>, AppError> {
        sqlx::query_as::<_, Wallet>(&format!(
            r#"
            SELECT {} FROM wallets
            WHERE ready_to_be_refreshed AND status = 'active'
            ORDER BY updated_at
            LIMIT $1
            "#,
            WALLET_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::from_db("Failed to list wallets to refresh", e))
    }
}

fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

// -----------------------------------------------------------------------------
// Wallet writes
// -----------------------------------------------------------------------------

#[instrument(skip(conn, input), fields(customer_id = %input.customer_id))]
pub async fn insert_wallet(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreateWallet,
) -> Result<Wallet, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_wallet"])
        .start_timer();

    let wallet = sqlx::query_as::<_, Wallet>(&format!(
        r#"
        INSERT INTO wallets (id, organization_id, customer_id, name, currency, rate_amount,
                             paid_top_up_min_amount_cents, paid_top_up_max_amount_cents)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        WALLET_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(input.customer_id)
    .bind(&input.name)
    .bind(&input.currency)
    .bind(input.rate_amount)
    .bind(input.paid_top_up_min_amount_cents)
    .bind(input.paid_top_up_max_amount_cents)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to create wallet", e))?;

    timer.observe_duration();
    Ok(wallet)
}

/// Load and row-lock a wallet for the rest of the transaction.
#[instrument(skip(conn), fields(wallet_id = %wallet_id))]
pub async fn lock_wallet(conn: &mut PgConnection, wallet_id: Uuid) -> Result<Wallet, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_wallet"])
        .start_timer();

    let wallet = sqlx::query_as::<_, Wallet>(&format!(
        "SELECT {} FROM wallets WHERE id = $1 FOR UPDATE",
        WALLET_COLUMNS
    ))
    .bind(wallet_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to lock wallet", e))?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Wallet {} not found", wallet_id)))?;

    timer.observe_duration();
    Ok(wallet)
}

/// Persist every balance and projection column of a locked wallet.
#[instrument(skip(conn, wallet), fields(wallet_id = %wallet.id))]
pub async fn update_wallet_balances(
    conn: &mut PgConnection,
    wallet: &Wallet,
) -> Result<Wallet, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["update_wallet_balances"])
        .start_timer();

    let updated = sqlx::query_as::<_, Wallet>(&format!(
        r#"
        UPDATE wallets
        SET balance_cents = $2,
            credits_balance = $3,
            consumed_credits = $4,
            consumed_amount_cents = $5,
            ongoing_balance_cents = $6,
            credits_ongoing_balance = $7,
            ongoing_usage_balance_cents = $8,
            credits_ongoing_usage_balance = $9,
            depleted_ongoing_balance = $10,
            ready_to_be_refreshed = $11,
            last_balance_sync_at = $12,
            last_consumed_credit_at = $13,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        WALLET_COLUMNS
    ))
    .bind(wallet.id)
    .bind(wallet.balance_cents)
    .bind(wallet.credits_balance)
    .bind(wallet.consumed_credits)
    .bind(wallet.consumed_amount_cents)
    .bind(wallet.ongoing_balance_cents)
    .bind(wallet.credits_ongoing_balance)
    .bind(wallet.ongoing_usage_balance_cents)
    .bind(wallet.credits_ongoing_usage_balance)
    .bind(wallet.depleted_ongoing_balance)
    .bind(wallet.ready_to_be_refreshed)
    .bind(wallet.last_balance_sync_at)
    .bind(wallet.last_consumed_credit_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to update wallet balances", e))?;

    timer.observe_duration();
    Ok(updated)
}

#[instrument(skip(conn), fields(wallet_id = %wallet_id))]
pub async fn mark_wallet_terminated(
    conn: &mut PgConnection,
    wallet_id: Uuid,
) -> Result<Wallet, AppError> {
    let wallet = sqlx::query_as::<_, Wallet>(&format!(
        r#"
        UPDATE wallets
        SET status = $2, terminated_at = COALESCE(terminated_at, NOW()), updated_at = NOW()
        WHERE id = $1
        RETURNING {}
        "#,
        WALLET_COLUMNS
    ))
    .bind(wallet_id)
    .bind(WalletStatus::Terminated.as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to terminate wallet", e))?;

    sqlx::query(
        "UPDATE recurring_transaction_rules SET status = $2, updated_at = NOW() WHERE wallet_id = $1",
    )
    .bind(wallet_id)
    .bind(RuleStatus::Terminated.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to terminate recurring rules", e))?;

    Ok(wallet)
}

/// Flag active wallets of a customer so the next refresh pass recomputes them.
pub async fn flag_customer_wallets_for_refresh(
    conn: &mut PgConnection,
    organization_id: Uuid,
    customer_id: Uuid,
) -> Result<u64, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE wallets SET ready_to_be_refreshed = TRUE, updated_at = NOW()
        WHERE organization_id = $1 AND customer_id = $2 AND status = 'active'
        "#,
    )
    .bind(organization_id)
    .bind(customer_id)
    .execute(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to flag wallets for refresh", e))?;
    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------------
// Transactions
// -----------------------------------------------------------------------------

#[instrument(skip(conn, input), fields(wallet_id = %input.wallet_id, kind = input.kind.as_str()))]
pub async fn insert_transaction(
    conn: &mut PgConnection,
    input: &NewWalletTransaction,
) -> Result<WalletTransaction, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_transaction"])
        .start_timer();

    let settled_at = (input.status == TransactionStatus::Settled).then(Utc::now);

    let transaction = sqlx::query_as::<_, WalletTransaction>(&format!(
        r#"
        INSERT INTO wallet_transactions (id, organization_id, wallet_id, transaction_type, status,
                                         transaction_status, source, amount_cents, credit_amount,
                                         remaining_amount_cents, priority, invoice_id, name,
                                         metadata, settled_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(input.organization_id)
    .bind(input.wallet_id)
    .bind(input.kind.transaction_type().as_str())
    .bind(input.status.as_str())
    .bind(input.kind.as_str())
    .bind(input.source.as_str())
    .bind(input.amount_cents)
    .bind(input.credit_amount)
    .bind(input.remaining_amount_cents())
    .bind(input.priority)
    .bind(input.invoice_id)
    .bind(&input.name)
    .bind(&input.metadata)
    .bind(settled_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert wallet transaction", e))?;

    timer.observe_duration();
    Ok(transaction)
}

#[instrument(skip(conn), fields(transaction_id = %transaction_id))]
pub async fn lock_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
) -> Result<WalletTransaction, AppError> {
    sqlx::query_as::<_, WalletTransaction>(&format!(
        "SELECT {} FROM wallet_transactions WHERE id = $1 FOR UPDATE",
        TRANSACTION_COLUMNS
    ))
    .bind(transaction_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to lock wallet transaction", e))?
    .ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!(
            "Wallet transaction {} not found",
            transaction_id
        ))
    })
}

/// Move a pending transaction to `settled` or `failed`.
#[instrument(skip(conn), fields(transaction_id = %transaction_id, status = status.as_str()))]
pub async fn finalize_transaction(
    conn: &mut PgConnection,
    transaction_id: Uuid,
    status: TransactionStatus,
) -> Result<WalletTransaction, AppError> {
    sqlx::query_as::<_, WalletTransaction>(&format!(
        r#"
        UPDATE wallet_transactions
        SET status = $2,
            settled_at = CASE WHEN $2 = 'settled' THEN NOW() ELSE settled_at END,
            failed_at = CASE WHEN $2 = 'failed' THEN NOW() ELSE failed_at END,
            remaining_amount_cents = CASE
                WHEN $2 = 'settled' AND transaction_type = 'inbound' THEN amount_cents
                ELSE remaining_amount_cents
            END,
            updated_at = NOW()
        WHERE id = $1 AND status = 'pending'
        RETURNING {}
        "#,
        TRANSACTION_COLUMNS
    ))
    .bind(transaction_id)
    .bind(status.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to finalize wallet transaction", e))?
    .ok_or_else(|| {
        AppError::validation(
            "transaction_not_pending",
            format!("wallet transaction {} is not pending", transaction_id),
        )
    })
}

/// Settled inbound transactions with credit left, in consumption order, row-locked.
#[instrument(skip(conn), fields(wallet_id = %wallet_id))]
pub async fn lock_available_inbound(
    conn: &mut PgConnection,
    wallet_id: Uuid,
) -> Result<Vec<WalletTransaction>, AppError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_available_inbound"])
        .start_timer();

    let rows = sqlx::query_as::<_, WalletTransaction>(&format!(
        r#"
        SELECT {} FROM wallet_transactions
        WHERE wallet_id = $1
          AND transaction_type = 'inbound'
          AND status = 'settled'
          AND remaining_amount_cents > 0
        ORDER BY priority, created_at, id
        FOR UPDATE
        "#,
        TRANSACTION_COLUMNS
    ))
    .bind(wallet_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to load available credits", e))?;

    timer.observe_duration();
    Ok(rows)
}

/// Decrement an inbound remainder. The storage check constraint rejects negatives.
pub async fn decrement_remaining(
    conn: &mut PgConnection,
    inbound_id: Uuid,
    amount_cents: i64,
) -> Result<i64, AppError> {
    sqlx::query_scalar::<_, Option<i64>>(
        r#"
        UPDATE wallet_transactions
        SET remaining_amount_cents = remaining_amount_cents - $2, updated_at = NOW()
        WHERE id = $1
        RETURNING remaining_amount_cents
        "#,
    )
    .bind(inbound_id)
    .bind(amount_cents)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to decrement remaining amount", e))?
    .ok_or_else(|| {
        AppError::InvariantViolation(anyhow::anyhow!(
            "inbound transaction {} has no remaining amount",
            inbound_id
        ))
    })
}

pub async fn insert_consumption(
    conn: &mut PgConnection,
    organization_id: Uuid,
    inbound_id: Uuid,
    outbound_id: Uuid,
    consumed_amount_cents: i64,
) -> Result<WalletTransactionConsumption, AppError> {
    sqlx::query_as::<_, WalletTransactionConsumption>(
        r#"
        INSERT INTO wallet_transaction_consumptions
            (id, organization_id, inbound_wallet_transaction_id, outbound_wallet_transaction_id, consumed_amount_cents)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, organization_id, inbound_wallet_transaction_id, outbound_wallet_transaction_id,
                  consumed_amount_cents, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(inbound_id)
    .bind(outbound_id)
    .bind(consumed_amount_cents)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to insert consumption", e))
}

/// Whether a pending inbound top-up from `source` is still awaiting payment.
pub async fn has_pending_top_up(
    conn: &mut PgConnection,
    wallet_id: Uuid,
    source: &str,
) -> Result<bool, AppError> {
    sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM wallet_transactions
            WHERE wallet_id = $1 AND transaction_type = 'inbound' AND status = 'pending' AND source = $2
        )
        "#,
    )
    .bind(wallet_id)
    .bind(source)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to check pending top-ups", e))
}

// -----------------------------------------------------------------------------
// Recurring rules
// -----------------------------------------------------------------------------

#[instrument(skip(conn, input), fields(wallet_id = %input.wallet_id))]
pub async fn insert_rule(
    conn: &mut PgConnection,
    organization_id: Uuid,
    input: &CreateRecurringRule,
) -> Result<RecurringTransactionRule, AppError> {
    sqlx::query_as::<_, RecurringTransactionRule>(&format!(
        r#"
        INSERT INTO recurring_transaction_rules
            (id, organization_id, wallet_id, trigger_type, method, interval_unit, paid_credits,
             granted_credits, threshold_credits, target_ongoing_balance, started_at, expiration_at,
             ignore_paid_top_up_limits, transaction_name)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        RETURNING {}
        "#,
        RULE_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(organization_id)
    .bind(input.wallet_id)
    .bind(input.trigger.as_str())
    .bind(input.method.as_str())
    .bind(input.interval.map(|i| i.as_str()))
    .bind(input.paid_credits)
    .bind(input.granted_credits)
    .bind(input.threshold_credits)
    .bind(input.target_ongoing_balance)
    .bind(input.started_at)
    .bind(input.expiration_at)
    .bind(input.ignore_paid_top_up_limits)
    .bind(&input.transaction_name)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to create recurring rule", e))
}

pub async fn active_rule_for_wallet(
    conn: &mut PgConnection,
    wallet_id: Uuid,
    trigger: RuleTrigger,
) -> Result<Option<RecurringTransactionRule>, AppError> {
    sqlx::query_as::<_, RecurringTransactionRule>(&format!(
        r#"
        SELECT {} FROM recurring_transaction_rules
        WHERE wallet_id = $1 AND trigger_type = $2 AND status = 'active'
          AND (expiration_at IS NULL OR expiration_at > NOW())
        ORDER BY created_at, id
        LIMIT 1
        "#,
        RULE_COLUMNS
    ))
    .bind(wallet_id)
    .bind(trigger.as_str())
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to load recurring rule", e))
}

pub async fn get_rule(
    conn: &mut PgConnection,
    rule_id: Uuid,
) -> Result<Option<RecurringTransactionRule>, AppError> {
    sqlx::query_as::<_, RecurringTransactionRule>(&format!(
        "SELECT {} FROM recurring_transaction_rules WHERE id = $1",
        RULE_COLUMNS
    ))
    .bind(rule_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| AppError::from_db("Failed to load recurring rule", e))
}
