//! Allocation of outbound debits against inbound credits.
//!
//! Planning is pure; [`apply_consumptions`] writes the plan. Inbound rows are
//! row-locked by the caller and their remainders are guarded by a check constraint,
//! so concurrent debits cannot drive a remainder below zero.

use super::database;
use super::metrics::CONSUMPTIONS_TOTAL;
use crate::models::{TransactionType, WalletTransaction, WalletTransactionConsumption};
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Credit left on one inbound transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableCredit {
    pub transaction_id: Uuid,
    pub remaining_amount_cents: i64,
}

impl AvailableCredit {
    pub fn from_transaction(tx: &WalletTransaction) -> Self {
        Self {
            transaction_id: tx.id,
            remaining_amount_cents: tx.remaining_amount_cents.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedConsumption {
    pub inbound_transaction_id: Uuid,
    pub consumed_amount_cents: i64,
}

/// Debit a single chosen inbound transaction.
pub fn plan_targeted(
    debit_cents: i64,
    target: &AvailableCredit,
) -> Result<Vec<PlannedConsumption>, AppError> {
    if debit_cents <= 0 {
        return Ok(Vec::new());
    }
    if debit_cents > target.remaining_amount_cents {
        return Err(AppError::validation(
            "exceeds_remaining_transaction_amount",
            format!(
                "debit of {} exceeds remaining {} on transaction {}",
                debit_cents, target.remaining_amount_cents, target.transaction_id
            ),
        ));
    }
    Ok(vec![PlannedConsumption {
        inbound_transaction_id: target.transaction_id,
        consumed_amount_cents: debit_cents,
    }])
}

/// The targeted credit among `available`.
///
/// `owned` says whether the wallet holds an inbound transaction with that id at all;
/// an owned transaction with nothing left resolves to a zero remainder.
pub fn resolve_target(
    available: &[AvailableCredit],
    target_id: Uuid,
    owned: bool,
) -> Result<AvailableCredit, AppError> {
    if let Some(credit) = available.iter().find(|c| c.transaction_id == target_id) {
        return Ok(*credit);
    }
    if !owned {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Inbound transaction {} not found in wallet",
            target_id
        )));
    }
    Ok(AvailableCredit {
        transaction_id: target_id,
        remaining_amount_cents: 0,
    })
}

/// Greedy allocation over `available`, which must already be in consumption order.
pub fn plan_by_priority(
    debit_cents: i64,
    available: &[AvailableCredit],
) -> Result<Vec<PlannedConsumption>, AppError> {
    if debit_cents <= 0 {
        return Ok(Vec::new());
    }

    let total: i64 = available
        .iter()
        .map(|a| a.remaining_amount_cents.max(0))
        .sum();
    if debit_cents > total {
        return Err(AppError::validation(
            "exceeds_available_amount",
            format!("debit of {} exceeds available {}", debit_cents, total),
        ));
    }

    let mut left = debit_cents;
    let mut plan = Vec::new();
    for credit in available {
        if left == 0 {
            break;
        }
        let take = left.min(credit.remaining_amount_cents);
        if take <= 0 {
            continue;
        }
        plan.push(PlannedConsumption {
            inbound_transaction_id: credit.transaction_id,
            consumed_amount_cents: take,
        });
        left -= take;
    }

    Ok(plan)
}

/// Plan a debit of `debit_cents` against the wallet's inbound credits, row-locking them.
#[instrument(skip(conn), fields(wallet_id = %wallet_id))]
pub async fn plan_for_wallet(
    conn: &mut PgConnection,
    wallet_id: Uuid,
    debit_cents: i64,
    inbound_transaction_id: Option<Uuid>,
) -> Result<Vec<PlannedConsumption>, AppError> {
    let available = database::lock_available_inbound(conn, wallet_id).await?;
    let credits: Vec<AvailableCredit> = available
        .iter()
        .map(AvailableCredit::from_transaction)
        .collect();

    match inbound_transaction_id {
        Some(target_id) => {
            let owned = if credits.iter().any(|c| c.transaction_id == target_id) {
                true
            } else {
                match database::lock_transaction(conn, target_id).await {
                    Ok(tx) => {
                        tx.wallet_id == wallet_id
                            && tx.parsed_type() == Some(TransactionType::Inbound)
                    }
                    Err(AppError::NotFound(_)) => false,
                    Err(e) => return Err(e),
                }
            };
            let target = resolve_target(&credits, target_id, owned)?;
            plan_targeted(debit_cents, &target)
        }
        None => plan_by_priority(debit_cents, &credits),
    }
}

/// Write one consumption row per planned debit and decrement each inbound remainder.
#[instrument(skip(conn, plan), fields(outbound_id = %outbound_id, rows = plan.len()))]
pub async fn apply_consumptions(
    conn: &mut PgConnection,
    organization_id: Uuid,
    outbound_id: Uuid,
    plan: &[PlannedConsumption],
    mode: &str,
) -> Result<Vec<WalletTransactionConsumption>, AppError> {
    let mut consumptions = Vec::with_capacity(plan.len());

    for step in plan {
        let remaining = database::decrement_remaining(
            conn,
            step.inbound_transaction_id,
            step.consumed_amount_cents,
        )
        .await?;

        let consumption = database::insert_consumption(
            conn,
            organization_id,
            step.inbound_transaction_id,
            outbound_id,
            step.consumed_amount_cents,
        )
        .await?;

        debug!(
            inbound_id = %step.inbound_transaction_id,
            consumed = step.consumed_amount_cents,
            remaining = remaining,
            "Inbound credit consumed"
        );
        CONSUMPTIONS_TOTAL.with_label_values(&[mode]).inc();
        consumptions.push(consumption);
    }

    Ok(consumptions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credit(remaining: i64) -> AvailableCredit {
        AvailableCredit {
            transaction_id: Uuid::new_v4(),
            remaining_amount_cents: remaining,
        }
    }

    #[test]
    fn priority_allocation_spans_inbound_transactions_in_order() {
        let available = [credit(8), credit(10)];
        let plan = plan_by_priority(12, &available).unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].inbound_transaction_id, available[0].transaction_id);
        assert_eq!(plan[0].consumed_amount_cents, 8);
        assert_eq!(plan[1].inbound_transaction_id, available[1].transaction_id);
        assert_eq!(plan[1].consumed_amount_cents, 4);
    }

    #[test]
    fn allocation_conserves_the_debit() {
        let available = [credit(3), credit(0), credit(7), credit(100)];
        for debit in [1, 3, 4, 10, 57, 110] {
            let plan = plan_by_priority(debit, &available).unwrap();
            let total: i64 = plan.iter().map(|p| p.consumed_amount_cents).sum();
            assert_eq!(total, debit);
            for step in &plan {
                let source = available
                    .iter()
                    .find(|a| a.transaction_id == step.inbound_transaction_id)
                    .unwrap();
                assert!(step.consumed_amount_cents <= source.remaining_amount_cents);
                assert!(step.consumed_amount_cents > 0);
            }
        }
    }

    #[test]
    fn debit_above_total_is_rejected() {
        let err = plan_by_priority(19, &[credit(8), credit(10)]).unwrap_err();
        assert_eq!(err.error_code(), "exceeds_available_amount");
    }

    #[test]
    fn targeted_debit_cannot_exceed_remaining() {
        let target = credit(500);
        assert_eq!(plan_targeted(500, &target).unwrap()[0].consumed_amount_cents, 500);

        let err = plan_targeted(501, &target).unwrap_err();
        assert_eq!(err.error_code(), "exceeds_remaining_transaction_amount");
    }

    #[test]
    fn targeted_transaction_outside_the_wallet_is_not_found() {
        let available = [credit(8), credit(10)];
        let found = resolve_target(&available, available[1].transaction_id, true).unwrap();
        assert_eq!(found, available[1]);

        let err = resolve_target(&available, Uuid::new_v4(), false).unwrap_err();
        assert_eq!(err.error_code(), "not_found");

        let exhausted = resolve_target(&available, Uuid::new_v4(), true).unwrap();
        assert_eq!(exhausted.remaining_amount_cents, 0);
        let err = plan_targeted(1, &exhausted).unwrap_err();
        assert_eq!(err.error_code(), "exceeds_remaining_transaction_amount");
    }

    #[test]
    fn zero_debit_plans_nothing() {
        assert!(plan_by_priority(0, &[]).unwrap().is_empty());
    }
}
