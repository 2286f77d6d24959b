//! Wallet balance state machine.
//!
//! Every mutation runs in one database transaction holding the wallet row lock.
//! Balances are recomputed from the locked row immediately before the update, and
//! webhooks and follow-up jobs are written to their outbox tables in the same
//! transaction.

use super::allocator;
use super::database::{self, Database};
use super::metrics::{record_credits, record_error, record_transaction, DEPLETION_TRANSITIONS_TOTAL};
use super::top_up;
use crate::models::{
    subunit_to_unit, CreateRecurringRule, CreateWallet, NewWalletTransaction, OngoingUsage,
    RecurringTransactionRule, RuleMethod, RuleTrigger, TransactionKind, TransactionSource,
    TransactionStatus, Wallet, WalletTransaction, WalletTransactionConsumption,
};
use crate::models::transaction::DEFAULT_PRIORITY;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::context::RequestContext;
use service_core::error::AppError;
use service_core::webhooks::{record_webhook, WebhookEvent, WebhookEventType};
use sqlx::PgConnection;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Delay before a threshold top-up runs, collapsing bursts of refreshes.
    pub top_up_debounce: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            top_up_debounce: Duration::from_secs(2),
        }
    }
}

/// Credits to add to a wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditRequest {
    pub wallet_id: Uuid,
    pub paid_credits: Decimal,
    pub granted_credits: Decimal,
    pub source: TransactionSource,
    pub priority: Option<i32>,
    pub name: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub ignore_paid_top_up_limits: bool,
    /// Lower consumed counters when granting credits back to a wallet.
    pub reset_consumed_credits: bool,
}

impl CreditRequest {
    pub fn manual(wallet_id: Uuid, paid_credits: Decimal, granted_credits: Decimal) -> Self {
        Self {
            wallet_id,
            paid_credits,
            granted_credits,
            source: TransactionSource::Manual,
            priority: None,
            name: None,
            metadata: None,
            ignore_paid_top_up_limits: false,
            reset_consumed_credits: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedTransactions {
    pub paid: Option<WalletTransaction>,
    pub granted: Option<WalletTransaction>,
    pub wallet: Wallet,
}

/// Credits to remove from a wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebitRequest {
    pub wallet_id: Uuid,
    pub credits: Decimal,
    /// Debit one specific inbound transaction instead of following priority order.
    pub inbound_transaction_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Debit {
    pub outbound: WalletTransaction,
    pub consumptions: Vec<WalletTransactionConsumption>,
    pub wallet: Wallet,
}

/// Direction in which the ongoing balance crossed zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepletionEdge {
    Depleted,
    Replenished,
}

impl DepletionEdge {
    fn as_str(&self) -> &'static str {
        match self {
            DepletionEdge::Depleted => "depleted",
            DepletionEdge::Replenished => "replenished",
        }
    }
}

/// Recompute the ongoing projection of `wallet` from `usage_cents` of unbilled usage.
///
/// Returns the edge crossed, if the depleted flag flipped.
pub fn project_ongoing_balance(
    wallet: &mut Wallet,
    usage_cents: i64,
) -> Result<Option<DepletionEdge>, AppError> {
    let usage_cents = usage_cents.max(0);
    wallet.ongoing_usage_balance_cents = usage_cents;
    wallet.credits_ongoing_usage_balance = wallet.cents_to_credits(usage_cents)?;
    wallet.ongoing_balance_cents = wallet.balance_cents - usage_cents;
    wallet.credits_ongoing_balance = wallet.credits_balance - wallet.credits_ongoing_usage_balance;

    let edge = match (wallet.depleted_ongoing_balance, wallet.ongoing_balance_cents <= 0) {
        (false, true) => Some(DepletionEdge::Depleted),
        (true, false) => Some(DepletionEdge::Replenished),
        _ => None,
    };
    if edge.is_some() {
        wallet.depleted_ongoing_balance = !wallet.depleted_ongoing_balance;
    }
    Ok(edge)
}

/// Add to the settled balance of a locked wallet.
pub fn increase_balance(
    wallet: &mut Wallet,
    amount_cents: i64,
    credits: Decimal,
    reset_consumed: bool,
) {
    wallet.balance_cents += amount_cents;
    wallet.credits_balance += credits;
    if reset_consumed {
        wallet.consumed_credits = (wallet.consumed_credits - credits).max(Decimal::ZERO);
        wallet.consumed_amount_cents = (wallet.consumed_amount_cents - amount_cents).max(0);
    }
}

/// Remove from the settled balance of a locked wallet; returns the cents removed.
///
/// Cents are floored so a debit never removes a fractional minor unit.
pub fn decrease_balance(
    wallet: &mut Wallet,
    credits: Decimal,
    count_as_consumed: bool,
) -> Result<i64, AppError> {
    let amount_cents = wallet.credits_to_cents(credits)?;
    wallet.balance_cents -= amount_cents;
    wallet.credits_balance -= credits;
    if count_as_consumed {
        wallet.consumed_credits += credits;
        wallet.consumed_amount_cents += amount_cents;
        wallet.last_consumed_credit_at = Some(Utc::now());
    }
    Ok(amount_cents)
}

fn validate_credits(credits: Decimal) -> Result<(), AppError> {
    if credits < Decimal::ZERO {
        return Err(AppError::validation(
            "invalid_credit_amount",
            format!("credit amount {} must not be negative", credits),
        ));
    }
    Ok(())
}

fn tracked<T>(operation: &str, result: Result<T, AppError>) -> Result<T, AppError> {
    if let Err(ref e) = result {
        record_error(operation, e.error_code());
    }
    result
}

#[derive(Clone)]
pub struct WalletLedger {
    db: Database,
    settings: LedgerSettings,
}

impl WalletLedger {
    pub fn new(db: Database, settings: LedgerSettings) -> Self {
        Self { db, settings }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    async fn lock_owned_wallet(
        conn: &mut PgConnection,
        ctx: &RequestContext,
        wallet_id: Uuid,
    ) -> Result<Wallet, AppError> {
        let wallet = database::lock_wallet(conn, wallet_id).await?;
        if wallet.organization_id != ctx.organization_id {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Wallet {} not found",
                wallet_id
            )));
        }
        Ok(wallet)
    }

    #[instrument(skip(self, ctx, input), fields(org = %ctx.organization_id, customer_id = %input.customer_id))]
    pub async fn create_wallet(
        &self,
        ctx: &RequestContext,
        input: CreateWallet,
    ) -> Result<Wallet, AppError> {
        let result = async {
            if subunit_to_unit(&input.currency).is_none() {
                return Err(AppError::validation(
                    "invalid_currency",
                    format!("unsupported currency {}", input.currency),
                ));
            }
            if input.rate_amount <= Decimal::ZERO {
                return Err(AppError::validation(
                    "invalid_rate_amount",
                    "rate_amount must be positive",
                ));
            }
            if let (Some(min), Some(max)) = (
                input.paid_top_up_min_amount_cents,
                input.paid_top_up_max_amount_cents,
            ) {
                if min > max {
                    return Err(AppError::validation(
                        "invalid_paid_top_up_limits",
                        "minimum top-up exceeds maximum",
                    ));
                }
            }

            let mut tx = self.db.begin().await?;
            let wallet = database::insert_wallet(&mut tx, ctx.organization_id, &input).await?;
            tx.commit()
                .await
                .map_err(|e| AppError::from_db("Failed to commit wallet", e))?;

            info!(wallet_id = %wallet.id, currency = %wallet.currency, "Wallet created");
            Ok(wallet)
        }
        .await;
        tracked("create_wallet", result)
    }

    #[instrument(skip(self, ctx, input), fields(org = %ctx.organization_id, wallet_id = %input.wallet_id))]
    pub async fn create_recurring_rule(
        &self,
        ctx: &RequestContext,
        input: CreateRecurringRule,
    ) -> Result<RecurringTransactionRule, AppError> {
        let result = async {
            match input.trigger {
                RuleTrigger::Interval if input.interval.is_none() => {
                    return Err(AppError::validation(
                        "invalid_recurring_rule",
                        "interval rules require an interval",
                    ));
                }
                RuleTrigger::Threshold if input.threshold_credits.is_none() => {
                    return Err(AppError::validation(
                        "invalid_recurring_rule",
                        "threshold rules require threshold_credits",
                    ));
                }
                _ => {}
            }
            if input.method == RuleMethod::Target && input.target_ongoing_balance.is_none() {
                return Err(AppError::validation(
                    "invalid_recurring_rule",
                    "target rules require target_ongoing_balance",
                ));
            }
            validate_credits(input.paid_credits)?;
            validate_credits(input.granted_credits)?;

            let mut tx = self.db.begin().await?;
            let wallet = Self::lock_owned_wallet(&mut tx, ctx, input.wallet_id).await?;
            wallet.ensure_active()?;
            let rule = database::insert_rule(&mut tx, ctx.organization_id, &input).await?;
            tx.commit()
                .await
                .map_err(|e| AppError::from_db("Failed to commit recurring rule", e))?;
            Ok(rule)
        }
        .await;
        tracked("create_recurring_rule", result)
    }

    /// Create the paid (pending) and granted (settled) inbound transactions of a top-up.
    #[instrument(skip(self, ctx, request), fields(org = %ctx.organization_id, wallet_id = %request.wallet_id, source = request.source.as_str()))]
    pub async fn create_transactions(
        &self,
        ctx: &RequestContext,
        request: CreditRequest,
    ) -> Result<CreatedTransactions, AppError> {
        let result = async {
            validate_credits(request.paid_credits)?;
            validate_credits(request.granted_credits)?;
            if request.paid_credits.is_zero() && request.granted_credits.is_zero() {
                return Err(AppError::validation(
                    "invalid_credit_amount",
                    "paid or granted credits must be positive",
                ));
            }
            let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);
            if !(1..=DEFAULT_PRIORITY).contains(&priority) {
                return Err(AppError::validation(
                    "invalid_priority",
                    format!("priority must be between 1 and {}", DEFAULT_PRIORITY),
                ));
            }

            let mut tx = self.db.begin().await?;
            let mut wallet = Self::lock_owned_wallet(&mut tx, ctx, request.wallet_id).await?;
            wallet.ensure_active()?;

            if request.paid_credits > Decimal::ZERO {
                top_up::validate_paid_credits(
                    &wallet,
                    request.paid_credits,
                    request.ignore_paid_top_up_limits,
                )?;
            }

            let metadata = request
                .metadata
                .clone()
                .unwrap_or_else(|| serde_json::json!({}));

            let mut paid = None;
            if request.paid_credits > Decimal::ZERO {
                let created = database::insert_transaction(
                    &mut tx,
                    &NewWalletTransaction {
                        organization_id: wallet.organization_id,
                        wallet_id: wallet.id,
                        kind: TransactionKind::Purchased,
                        status: TransactionStatus::Pending,
                        source: request.source,
                        amount_cents: wallet.credits_to_cents(request.paid_credits)?,
                        credit_amount: request.paid_credits,
                        priority,
                        invoice_id: None,
                        name: request.name.clone(),
                        metadata: metadata.clone(),
                    },
                )
                .await?;
                emit_transaction(&mut tx, &created, WebhookEventType::WalletTransactionCreated)
                    .await?;
                record_transaction(TransactionKind::Purchased.as_str(), "pending");
                paid = Some(created);
            }

            let mut granted = None;
            if request.granted_credits > Decimal::ZERO {
                let amount_cents = wallet.credits_to_cents(request.granted_credits)?;
                let created = database::insert_transaction(
                    &mut tx,
                    &NewWalletTransaction {
                        organization_id: wallet.organization_id,
                        wallet_id: wallet.id,
                        kind: TransactionKind::Granted,
                        status: TransactionStatus::Settled,
                        source: request.source,
                        amount_cents,
                        credit_amount: request.granted_credits,
                        priority,
                        invoice_id: None,
                        name: request.name.clone(),
                        metadata,
                    },
                )
                .await?;
                emit_transaction(&mut tx, &created, WebhookEventType::WalletTransactionCreated)
                    .await?;
                record_transaction(TransactionKind::Granted.as_str(), "settled");
                record_credits("inbound", request.granted_credits.to_f64().unwrap_or(0.0));

                increase_balance(
                    &mut wallet,
                    amount_cents,
                    request.granted_credits,
                    request.reset_consumed_credits,
                );
                wallet = self.persist_balance_change(&mut tx, wallet).await?;
                granted = Some(created);
            }

            tx.commit()
                .await
                .map_err(|e| AppError::from_db("Failed to commit wallet transactions", e))?;

            info!(
                paid = paid.as_ref().map(|t| t.amount_cents).unwrap_or(0),
                granted = granted.as_ref().map(|t| t.amount_cents).unwrap_or(0),
                "Wallet credits created"
            );
            Ok(CreatedTransactions {
                paid,
                granted,
                wallet,
            })
        }
        .await;
        tracked("create_transactions", result)
    }

    /// Payment captured: settle a pending inbound transaction and credit the wallet.
    ///
    /// Settling an already settled transaction returns it unchanged.
    #[instrument(skip(self, ctx), fields(org = %ctx.organization_id, transaction_id = %transaction_id))]
    pub async fn settle_transaction(
        &self,
        ctx: &RequestContext,
        transaction_id: Uuid,
    ) -> Result<WalletTransaction, AppError> {
        let result = async {
            let mut tx = self.db.begin().await?;
            let current = database::lock_transaction(&mut tx, transaction_id).await?;
            if current.organization_id != ctx.organization_id {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Wallet transaction {} not found",
                    transaction_id
                )));
            }
            if current.parsed_status() == Some(TransactionStatus::Settled) {
                return Ok(current);
            }

            let mut wallet = database::lock_wallet(&mut tx, current.wallet_id).await?;
            let settled =
                database::finalize_transaction(&mut tx, transaction_id, TransactionStatus::Settled)
                    .await?;

            increase_balance(&mut wallet, settled.amount_cents, settled.credit_amount, false);
            self.persist_balance_change(&mut tx, wallet).await?;
            emit_transaction(&mut tx, &settled, WebhookEventType::WalletTransactionUpdated).await?;

            tx.commit()
                .await
                .map_err(|e| AppError::from_db("Failed to commit settlement", e))?;

            record_transaction(&settled.transaction_status, "settled");
            record_credits("inbound", settled.credit_amount.to_f64().unwrap_or(0.0));
            info!(amount_cents = settled.amount_cents, "Wallet transaction settled");
            Ok(settled)
        }
        .await;
        tracked("settle_transaction", result)
    }

    /// Payment failed: the pending transaction becomes terminal without touching the balance.
    #[instrument(skip(self, ctx), fields(org = %ctx.organization_id, transaction_id = %transaction_id))]
    pub async fn fail_transaction(
        &self,
        ctx: &RequestContext,
        transaction_id: Uuid,
    ) -> Result<WalletTransaction, AppError> {
        let result = async {
            let mut tx = self.db.begin().await?;
            let current = database::lock_transaction(&mut tx, transaction_id).await?;
            if current.organization_id != ctx.organization_id {
                return Err(AppError::NotFound(anyhow::anyhow!(
                    "Wallet transaction {} not found",
                    transaction_id
                )));
            }
            database::lock_wallet(&mut tx, current.wallet_id).await?;
            let failed =
                database::finalize_transaction(&mut tx, transaction_id, TransactionStatus::Failed)
                    .await?;
            emit_transaction(&mut tx, &failed, WebhookEventType::WalletTransactionUpdated).await?;

            tx.commit()
                .await
                .map_err(|e| AppError::from_db("Failed to commit failure", e))?;

            record_transaction(&failed.transaction_status, "failed");
            warn!("Wallet transaction failed");
            Ok(failed)
        }
        .await;
        tracked("fail_transaction", result)
    }

    /// Debit credits for usage, consuming inbound credits in priority order.
    #[instrument(skip(self, ctx, request), fields(org = %ctx.organization_id, wallet_id = %request.wallet_id))]
    pub async fn consume(
        &self,
        ctx: &RequestContext,
        request: DebitRequest,
    ) -> Result<Debit, AppError> {
        tracked(
            "consume",
            self.debit(ctx, request, TransactionKind::Invoiced).await,
        )
    }

    /// Remove credits without billing them.
    #[instrument(skip(self, ctx, request), fields(org = %ctx.organization_id, wallet_id = %request.wallet_id))]
    pub async fn void_credits(
        &self,
        ctx: &RequestContext,
        request: DebitRequest,
    ) -> Result<Debit, AppError> {
        tracked(
            "void_credits",
            self.debit(ctx, request, TransactionKind::Voided).await,
        )
    }

    async fn debit(
        &self,
        ctx: &RequestContext,
        request: DebitRequest,
        kind: TransactionKind,
    ) -> Result<Debit, AppError> {
        if request.credits <= Decimal::ZERO {
            return Err(AppError::validation(
                "invalid_credit_amount",
                "debit must be positive",
            ));
        }

        let mut tx = self.db.begin().await?;
        let mut wallet = Self::lock_owned_wallet(&mut tx, ctx, request.wallet_id).await?;
        wallet.ensure_active()?;

        let amount_cents = wallet.credits_to_cents(request.credits)?;
        if amount_cents == 0 {
            return Err(AppError::validation(
                "invalid_credit_amount",
                format!("{} credits is below one minor unit", request.credits),
            ));
        }

        let plan = allocator::plan_for_wallet(
            &mut tx,
            wallet.id,
            amount_cents,
            request.inbound_transaction_id,
        )
        .await?;

        let outbound = database::insert_transaction(
            &mut tx,
            &NewWalletTransaction {
                organization_id: wallet.organization_id,
                wallet_id: wallet.id,
                kind,
                status: TransactionStatus::Settled,
                source: TransactionSource::Manual,
                amount_cents,
                credit_amount: request.credits,
                priority: DEFAULT_PRIORITY,
                invoice_id: request.invoice_id,
                name: request.name.clone(),
                metadata: serde_json::json!({}),
            },
        )
        .await?;

        let mode = if request.inbound_transaction_id.is_some() {
            "targeted"
        } else {
            "priority"
        };
        let consumptions = allocator::apply_consumptions(
            &mut tx,
            wallet.organization_id,
            outbound.id,
            &plan,
            mode,
        )
        .await?;

        decrease_balance(&mut wallet, request.credits, kind == TransactionKind::Invoiced)?;
        let wallet = self.persist_balance_change(&mut tx, wallet).await?;
        emit_transaction(&mut tx, &outbound, WebhookEventType::WalletTransactionCreated).await?;

        tx.commit()
            .await
            .map_err(|e| AppError::from_db("Failed to commit debit", e))?;

        record_transaction(kind.as_str(), "settled");
        record_credits("outbound", request.credits.to_f64().unwrap_or(0.0));
        info!(
            amount_cents = amount_cents,
            consumptions = consumptions.len(),
            kind = kind.as_str(),
            "Wallet debited"
        );

        Ok(Debit {
            outbound,
            consumptions,
            wallet,
        })
    }

    /// Reproject the ongoing balance from fresh unbilled usage.
    ///
    /// The settled ledger is untouched. Webhooks fire only when the depleted flag flips.
    #[instrument(skip(self, ctx), fields(org = %ctx.organization_id, wallet_id = %wallet_id))]
    pub async fn refresh_ongoing_balance(
        &self,
        ctx: &RequestContext,
        wallet_id: Uuid,
        usage: OngoingUsage,
    ) -> Result<Wallet, AppError> {
        let result = async {
            let mut tx = self.db.begin().await?;
            let mut wallet = Self::lock_owned_wallet(&mut tx, ctx, wallet_id).await?;
            if !wallet.is_active() {
                return Ok(wallet);
            }

            let edge = project_ongoing_balance(&mut wallet, usage.total_cents())?;
            wallet.ready_to_be_refreshed = false;
            wallet.last_balance_sync_at = Some(Utc::now());
            let wallet = database::update_wallet_balances(&mut tx, &wallet).await?;

            match edge {
                Some(DepletionEdge::Depleted) => {
                    emit_wallet(&mut tx, &wallet, WebhookEventType::WalletDepletedOngoingBalance)
                        .await?
                }
                Some(DepletionEdge::Replenished) => {
                    emit_wallet(&mut tx, &wallet, WebhookEventType::WalletUpdated).await?
                }
                None => {}
            }
            if let Some(edge) = edge {
                DEPLETION_TRANSITIONS_TOTAL
                    .with_label_values(&[edge.as_str()])
                    .inc();
                info!(edge = edge.as_str(), "Wallet ongoing balance crossed zero");
            }

            top_up::threshold_top_up(&mut tx, &wallet, self.settings.top_up_debounce).await?;

            tx.commit()
                .await
                .map_err(|e| AppError::from_db("Failed to commit balance refresh", e))?;
            Ok(wallet)
        }
        .await;
        tracked("refresh_ongoing_balance", result)
    }

    /// Terminated wallets reject new transactions.
    #[instrument(skip(self, ctx), fields(org = %ctx.organization_id, wallet_id = %wallet_id))]
    pub async fn terminate_wallet(
        &self,
        ctx: &RequestContext,
        wallet_id: Uuid,
    ) -> Result<Wallet, AppError> {
        let result = async {
            let mut tx = self.db.begin().await?;
            let current = Self::lock_owned_wallet(&mut tx, ctx, wallet_id).await?;
            if !current.is_active() {
                return Ok(current);
            }
            let wallet = database::mark_wallet_terminated(&mut tx, wallet_id).await?;
            emit_wallet(&mut tx, &wallet, WebhookEventType::WalletUpdated).await?;
            tx.commit()
                .await
                .map_err(|e| AppError::from_db("Failed to commit termination", e))?;
            info!("Wallet terminated");
            Ok(wallet)
        }
        .await;
        tracked("terminate_wallet", result)
    }

    /// Write the balance of a locked wallet, reprojecting with its last known usage.
    async fn persist_balance_change(
        &self,
        conn: &mut PgConnection,
        mut wallet: Wallet,
    ) -> Result<Wallet, AppError> {
        let usage_cents = wallet.ongoing_usage_balance_cents;
        let edge = project_ongoing_balance(&mut wallet, usage_cents)?;
        let wallet = database::update_wallet_balances(conn, &wallet).await?;

        emit_wallet(conn, &wallet, WebhookEventType::WalletUpdated).await?;
        if edge == Some(DepletionEdge::Depleted) {
            emit_wallet(conn, &wallet, WebhookEventType::WalletDepletedOngoingBalance).await?;
        }
        if let Some(edge) = edge {
            DEPLETION_TRANSITIONS_TOTAL
                .with_label_values(&[edge.as_str()])
                .inc();
        }

        top_up::threshold_top_up(conn, &wallet, self.settings.top_up_debounce).await?;
        Ok(wallet)
    }
}

async fn emit_wallet(
    conn: &mut PgConnection,
    wallet: &Wallet,
    event_type: WebhookEventType,
) -> Result<(), AppError> {
    let event = WebhookEvent::new(wallet.organization_id, event_type, "wallet", wallet.id, wallet)?;
    record_webhook(conn, &event).await?;
    Ok(())
}

async fn emit_transaction(
    conn: &mut PgConnection,
    transaction: &WalletTransaction,
    event_type: WebhookEventType,
) -> Result<(), AppError> {
    let event = WebhookEvent::new(
        transaction.organization_id,
        event_type,
        "wallet_transaction",
        transaction.id,
        transaction,
    )?;
    record_webhook(conn, &event).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::wallet::fixtures::wallet;
    use rust_decimal_macros::dec;

    #[test]
    fn grant_then_consume_moves_balance_and_consumed() {
        let mut w = wallet("USD", dec!(1));
        increase_balance(&mut w, 5000, dec!(50), false);
        assert_eq!(w.balance_cents, 5000);
        assert_eq!(w.credits_balance, dec!(50));

        let cents = decrease_balance(&mut w, dec!(20), true).unwrap();
        assert_eq!(cents, 2000);
        assert_eq!(w.balance_cents, 3000);
        assert_eq!(w.credits_balance, dec!(30));
        assert_eq!(w.consumed_credits, dec!(20));
        assert_eq!(w.consumed_amount_cents, 2000);
    }

    #[test]
    fn reset_consumed_is_floored_at_zero() {
        let mut w = wallet("USD", dec!(1));
        w.consumed_credits = dec!(5);
        w.consumed_amount_cents = 500;
        increase_balance(&mut w, 1000, dec!(10), true);
        assert_eq!(w.consumed_credits, Decimal::ZERO);
        assert_eq!(w.consumed_amount_cents, 0);
    }

    #[test]
    fn void_does_not_count_as_consumption() {
        let mut w = wallet("USD", dec!(1));
        increase_balance(&mut w, 1000, dec!(10), false);
        decrease_balance(&mut w, dec!(4), false).unwrap();
        assert_eq!(w.balance_cents, 600);
        assert_eq!(w.consumed_credits, Decimal::ZERO);
    }

    #[test]
    fn depletion_flag_flips_only_on_edges() {
        let mut w = wallet("USD", dec!(1));
        increase_balance(&mut w, 1000, dec!(10), false);

        assert_eq!(project_ongoing_balance(&mut w, 400).unwrap(), None);
        assert_eq!(w.ongoing_balance_cents, 600);
        assert_eq!(w.credits_ongoing_balance, dec!(6));

        assert_eq!(
            project_ongoing_balance(&mut w, 1000).unwrap(),
            Some(DepletionEdge::Depleted)
        );
        assert!(w.depleted_ongoing_balance);
        assert_eq!(project_ongoing_balance(&mut w, 1200).unwrap(), None);

        assert_eq!(
            project_ongoing_balance(&mut w, 100).unwrap(),
            Some(DepletionEdge::Replenished)
        );
        assert!(!w.depleted_ongoing_balance);
    }

    #[test]
    fn ongoing_usage_total_nets_billed_usage() {
        let usage = OngoingUsage {
            current_usage_cents: 700,
            draft_invoices_cents: 300,
            billed_usage_cents: 200,
        };
        assert_eq!(usage.total_cents(), 800);
        let over_billed = OngoingUsage {
            current_usage_cents: 0,
            draft_invoices_cents: 0,
            billed_usage_cents: 50,
        };
        assert_eq!(over_billed.total_cents(), 0);
    }
}
