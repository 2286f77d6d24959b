//! Subscription activity: dirty flags set by ingestion, drained by a job.
//!
//! The job refreshes lifetime usage, the ongoing balance of the customer's wallets and
//! evaluates every alert of the subscription and those wallets.

use super::current_usage::{CurrentUsageService, SubscriptionUsage};
use super::database::{self, Database};
use super::usage_alerts::{AlertInputs, AlertMonitor};
use crate::models::Subscription;
use async_trait::async_trait;
use chrono::Utc;
use ledger_service::models::OngoingUsage;
use ledger_service::services::WalletLedger;
use serde::{Deserialize, Serialize};
use service_core::context::RequestContext;
use service_core::error::AppError;
use service_core::jobs::{Job, JobHandler, JobSpec, PgJobQueue};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

pub const ACTIVITY_QUEUE: &str = "billing";
pub const ACTIVITY_JOB: &str = "process_subscription_activity";

/// In-flight claim of one subscription's activity job.
const ACTIVITY_CLAIM_TTL: Duration = Duration::from_secs(3 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityPayload {
    pub organization_id: Uuid,
    pub subscription_id: Uuid,
}

/// Flag a subscription as needing reprocessing. `false` when already flagged.
#[instrument(skip(db))]
pub async fn track(
    db: &Database,
    organization_id: Uuid,
    subscription_id: Uuid,
) -> Result<bool, AppError> {
    let mut conn = db
        .pool()
        .acquire()
        .await
        .map_err(|e| AppError::from_db("Failed to acquire connection", e))?;
    database::track_subscription_activity(&mut conn, organization_id, subscription_id).await
}

/// Enqueue one job per pending activity, marking them enqueued. Returns the number claimed.
#[instrument(skip(db))]
pub async fn enqueue_pending(db: &Database, limit: i64) -> Result<usize, AppError> {
    let mut tx = db.begin().await?;
    let activities = database::claim_pending_activities(&mut tx, limit).await?;

    for activity in &activities {
        let spec = JobSpec::new(
            ACTIVITY_QUEUE,
            ACTIVITY_JOB,
            &ActivityPayload {
                organization_id: activity.organization_id,
                subscription_id: activity.subscription_id,
            },
        )?
        .unique(format!("subscription_activity:{}", activity.subscription_id))
        .claim_ttl(ACTIVITY_CLAIM_TTL);
        PgJobQueue::enqueue_in(&mut tx, &spec).await?;
    }

    tx.commit()
        .await
        .map_err(|e| AppError::from_db("Failed to commit activity enqueue", e))?;

    if !activities.is_empty() {
        info!(count = activities.len(), "Subscription activities enqueued");
    }
    Ok(activities.len())
}

/// Runs [`ACTIVITY_JOB`] jobs.
#[derive(Clone)]
pub struct ActivityHandler {
    db: Database,
    usage: CurrentUsageService,
    ledger: WalletLedger,
    alerts: AlertMonitor,
}

impl ActivityHandler {
    pub fn new(
        db: Database,
        usage: CurrentUsageService,
        ledger: WalletLedger,
        alerts: AlertMonitor,
    ) -> Self {
        Self {
            db,
            usage,
            ledger,
            alerts,
        }
    }

    /// Reprocess one subscription.
    #[instrument(skip(self), fields(subscription_id = %subscription_id))]
    pub async fn process(
        &self,
        organization_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<(), AppError> {
        let Some(subscription) = self
            .db
            .get_subscription(organization_id, subscription_id)
            .await?
        else {
            info!("Subscription gone, dropping activity");
            return self.clear(subscription_id).await;
        };
        let now = Utc::now();
        let usage = self.usage.compute(&subscription, now).await?;

        let invoiced = self.db.invoiced_usage_cents(subscription.id).await?;
        let lifetime = {
            let mut conn = self
                .db
                .pool()
                .acquire()
                .await
                .map_err(|e| AppError::from_db("Failed to acquire connection", e))?;
            database::upsert_lifetime_usage(
                &mut conn,
                organization_id,
                subscription.id,
                usage.amount_cents,
                invoiced,
            )
            .await?
        };

        self.refresh_wallets(&subscription, &usage).await?;

        let alerts: Vec<_> = self
            .db
            .alerts_for_subscription(organization_id, &subscription.external_id)
            .await?
            .into_iter()
            .filter(|a| a.parsed_type().is_some_and(|t| !t.is_wallet_alert()))
            .collect();
        let (period, _) = self.usage.period_for(&subscription, now).await?;
        let inputs = AlertInputs {
            usage: Some(&usage),
            lifetime_usage: Some(&lifetime),
            wallet: None,
        };
        self.alerts
            .process_all(&alerts, &inputs, Some(subscription.id), Some(period.from), now)
            .await?;

        self.clear(subscription.id).await?;
        debug!(
            amount_cents = usage.amount_cents,
            alerts = alerts.len(),
            "Subscription activity processed"
        );
        Ok(())
    }

    /// Reproject every active wallet of the customer and evaluate its alerts.
    async fn refresh_wallets(
        &self,
        subscription: &Subscription,
        usage: &SubscriptionUsage,
    ) -> Result<(), AppError> {
        let wallets = self
            .ledger
            .db()
            .active_wallets_for_customer(subscription.organization_id, subscription.customer_id)
            .await?;
        if wallets.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let mut usages = Vec::new();
        for other in self
            .db
            .active_subscriptions_for_customer(subscription.customer_id)
            .await?
        {
            let other_usage = if other.id == subscription.id {
                usage.clone()
            } else {
                self.usage.compute(&other, now).await?
            };
            let (period, _) = self.usage.period_for(&other, now).await?;
            let billed = self
                .db
                .pay_in_advance_fees_cents(other.id, period.from, period.to)
                .await?;
            usages.push((other_usage, billed));
        }

        let ctx = RequestContext::system(subscription.organization_id);
        for wallet in wallets {
            let in_currency = usages.iter().filter(|(u, _)| u.currency == wallet.currency);
            let ongoing = OngoingUsage {
                current_usage_cents: in_currency.clone().map(|(u, _)| u.amount_cents).sum(),
                draft_invoices_cents: self
                    .db
                    .draft_invoices_cents(subscription.customer_id, &wallet.currency)
                    .await?,
                billed_usage_cents: in_currency.map(|(_, billed)| *billed).sum(),
            };
            let wallet = self
                .ledger
                .refresh_ongoing_balance(&ctx, wallet.id, ongoing)
                .await?;

            let alerts = self.db.alerts_for_wallet(wallet.id).await?;
            let inputs = AlertInputs {
                wallet: Some(&wallet),
                ..Default::default()
            };
            self.alerts
                .process_all(&alerts, &inputs, Some(subscription.id), None, now)
                .await?;
        }
        Ok(())
    }

    async fn clear(&self, subscription_id: Uuid) -> Result<(), AppError> {
        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(|e| AppError::from_db("Failed to acquire connection", e))?;
        database::delete_subscription_activity(&mut conn, subscription_id).await
    }
}

#[async_trait]
impl JobHandler for ActivityHandler {
    fn name(&self) -> &'static str {
        ACTIVITY_JOB
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn handle(&self, job: &Job) -> Result<(), AppError> {
        let payload: ActivityPayload = job.payload_as()?;
        self.process(payload.organization_id, payload.subscription_id)
            .await
    }
}
