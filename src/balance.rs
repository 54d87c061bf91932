//! Balance guard
//!
//! Preflight check that a payer's wallet covers the transfer amount plus the
//! fee reserve before any debit-triggering transition. Pure query, no
//! mutation. Fails closed: an unreadable balance is treated as insufficient.

use crate::chain::NetworkRpc;
use crate::error::EscrowError;
use crate::EscrowResult;
use tracing::warn;

/// Fixed reserve covering transaction fees, smallest currency unit
pub const FEE_RESERVE: u64 = 5_000;

/// Check that `wallet` can cover `amount` plus the fee reserve.
///
/// Returns the typed [`EscrowError::InsufficientBalance`] with the observed
/// balance, or `available: None` when the query itself failed.
pub async fn preflight(rpc: &dyn NetworkRpc, wallet: &str, amount: u64) -> EscrowResult<()> {
    let required = amount.saturating_add(FEE_RESERVE);
    let available = match rpc.get_balance(wallet).await {
        Ok(balance) => Some(balance),
        Err(err) => {
            warn!("Balance query failed for {}: {}", wallet, err);
            None
        }
    };

    match available {
        Some(balance) if balance >= required => Ok(()),
        _ => Err(EscrowError::InsufficientBalance {
            wallet: wallet.to_string(),
            required,
            available,
        }),
    }
}

/// Boolean form of the preflight check
pub async fn has_sufficient_balance(rpc: &dyn NetworkRpc, wallet: &str, amount: u64) -> bool {
    preflight(rpc, wallet, amount).await.is_ok()
}
