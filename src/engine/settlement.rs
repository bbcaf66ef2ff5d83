//! Payer ledger mutations. Pure: the caller holds the payer lock and persists.
//!
//! Every amount passed in here comes from a booking's recorded charge, never from
//! the resource's current rate, so a refund always mirrors its charge.

use tracing::warn;

use crate::model::*;

use super::EngineError;

/// Deduct `amount` from the wallet. Balance may go negative down to `-credit_limit`.
pub fn charge_balance(payer: &mut User, amount: Money) -> Result<(), EngineError> {
    let available = payer.available_funds();
    if available < amount {
        return Err(EngineError::InsufficientFunds {
            available,
            required: amount,
        });
    }
    payer.balance = payer.balance - amount;
    Ok(())
}

pub fn charge_subscription_hours(payer: &mut User, hours: Hours) -> Result<(), EngineError> {
    match payer.subscription.as_mut() {
        Some(sub) if sub.remaining >= hours => {
            sub.remaining = Hours(sub.remaining.0 - hours.0);
            Ok(())
        }
        Some(sub) => Err(EngineError::InsufficientHours {
            remaining: Some(sub.remaining),
            required: hours,
        }),
        None => Err(EngineError::InsufficientHours {
            remaining: None,
            required: hours,
        }),
    }
}

/// Unconditional: a refund never checks an upper bound.
pub fn refund_balance(payer: &mut User, amount: Money) {
    payer.balance = payer.balance + amount;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoursRefund {
    Credited,
    /// The subscription was gone; a fresh one now holds the refunded hours.
    Recreated,
}

pub fn refund_subscription_hours(payer: &mut User, hours: Hours) -> HoursRefund {
    match payer.subscription.as_mut() {
        Some(sub) => {
            sub.remaining = Hours(sub.remaining.0 + hours.0);
            HoursRefund::Credited
        }
        None => {
            warn!(
                user = %payer.id,
                hours = %hours,
                "subscription removed before refund; recreating it with the refunded hours"
            );
            payer.subscription = Some(Subscription::new(hours, None));
            HoursRefund::Recreated
        }
    }
}

/// Validate and apply a charge in one step.
pub fn settle(payer: &mut User, charge: Charge) -> Result<(), EngineError> {
    match charge {
        Charge::Balance(amount) => charge_balance(payer, amount),
        Charge::Hours(hours) => charge_subscription_hours(payer, hours),
    }
}

/// Check a charge without mutating the payer.
pub fn ensure_covered(payer: &User, charge: Charge) -> Result<(), EngineError> {
    let mut trial = payer.clone();
    settle(&mut trial, charge)
}

pub fn refund(payer: &mut User, charge: Charge) {
    match charge {
        Charge::Balance(amount) => refund_balance(payer, amount),
        Charge::Hours(hours) => {
            refund_subscription_hours(payer, hours);
        }
    }
}
