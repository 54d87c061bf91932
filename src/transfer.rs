//! Transfer orchestrator
//!
//! Owns the build → sign → submit → confirm pipeline for native-asset
//! transfers, with bounded exponential-backoff confirmation polling and an
//! idempotency registry keyed by (escrow id, transition). Exactly one
//! confirmed transfer exists per funding or release event: replaying a key
//! returns the recorded receipt instead of submitting again, and a timed-out
//! wait keeps polling in the background until the chain reports a terminal
//! outcome.

use crate::chain::{ConfirmationStatus, NetworkRpc, TransactionDraft, TransactionSigner};
use crate::error::TransferFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Configuration for the transfer orchestrator
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Confirmation polls before surfacing a timeout
    pub max_confirmation_attempts: u32,
    /// Base delay between confirmation polls
    pub poll_interval: Duration,
    /// Cap applied to the exponential backoff
    pub max_poll_interval: Duration,
    /// How long confirmed registry entries are kept for replay before they
    /// are dropped; in-flight entries are never dropped
    pub registry_retention: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_confirmation_attempts: 8,
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(8),
            registry_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Escrow transition a transfer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transition {
    Fund,
    Release,
    Refund,
    /// Stream withdrawal; the sequence is the withdrawn amount before this
    /// withdrawal, so a committed withdrawal advances the key
    Withdraw { sequence: u64 },
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fund => f.write_str("fund"),
            Self::Release => f.write_str("release"),
            Self::Refund => f.write_str("refund"),
            Self::Withdraw { sequence } => write!(f, "withdraw-{sequence}"),
        }
    }
}

/// Caller-supplied idempotency token preventing duplicate side effects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub escrow_id: Uuid,
    pub transition: Transition,
}

impl IdempotencyKey {
    pub fn new(escrow_id: Uuid, transition: Transition) -> Self {
        Self {
            escrow_id,
            transition,
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.escrow_id, self.transition)
    }
}

/// Confirmed transfer returned to the state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub reference: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub confirmed_at: DateTime<Utc>,
}

/// Registry view of a keyed transfer, for re-querying after a timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Submitted, terminal outcome not yet observed
    InFlight { reference: String },
    Confirmed(TransferReceipt),
}

enum SlotState {
    InFlight { reference: String },
    Confirmed(TransferReceipt),
}

type Registry = Arc<RwLock<HashMap<IdempotencyKey, SlotState>>>;

/// Builds, signs, submits, and confirms transfers between wallet addresses
pub struct TransferOrchestrator {
    config: TransferConfig,
    rpc: Arc<dyn NetworkRpc>,
    registry: Registry,
}

impl TransferOrchestrator {
    /// Create a new orchestrator over the given network handle
    pub fn new(rpc: Arc<dyn NetworkRpc>, config: TransferConfig) -> Self {
        Self {
            config,
            rpc,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Move `amount` from the signer's wallet to `to`, at most once per key.
    ///
    /// On `ConfirmationTimeout` the submission keeps being polled in the
    /// background; a later call with the same key observes its outcome
    /// instead of submitting a second transfer.
    pub async fn transfer(
        &self,
        signer: &dyn TransactionSigner,
        to: &str,
        amount: u64,
        key: IdempotencyKey,
    ) -> Result<TransferReceipt, TransferFailure> {
        self.prune_registry().await;

        // Idempotency replay check
        match self.registry.read().await.get(&key) {
            Some(SlotState::Confirmed(receipt)) => {
                info!("Replay of {} returns confirmed transfer {}", key, receipt.reference);
                return Ok(receipt.clone());
            }
            Some(SlotState::InFlight { reference }) => {
                warn!("Replay of {} while transfer {} is unconfirmed", key, reference);
                return Err(TransferFailure::ConfirmationTimeout {
                    reference: reference.clone(),
                });
            }
            None => {}
        }

        let from = signer.address().to_string();
        info!("Transfer {}: {} -> {} ({} units)", key, from, to, amount);

        let mut draft = TransactionDraft::transfer(from.clone(), to, amount);
        draft.memo = Some(key.to_string());

        let reference = self.sign_and_submit(signer, draft).await?;
        self.registry.write().await.insert(
            key,
            SlotState::InFlight {
                reference: reference.clone(),
            },
        );

        self.await_confirmation(key, reference, from, to.to_string(), amount)
            .await
    }

    /// Observed outcome for a key, if any transfer was ever submitted for it
    pub async fn check_outcome(&self, key: &IdempotencyKey) -> Option<TransferOutcome> {
        match self.registry.read().await.get(key) {
            Some(SlotState::Confirmed(receipt)) => {
                Some(TransferOutcome::Confirmed(receipt.clone()))
            }
            Some(SlotState::InFlight { reference }) => Some(TransferOutcome::InFlight {
                reference: reference.clone(),
            }),
            None => None,
        }
    }

    /// Drop confirmed entries older than the retention window. Replays only
    /// arrive while the owning record is still uncommitted, so long-confirmed
    /// entries are dead weight.
    async fn prune_registry(&self) {
        let retention = match chrono::Duration::from_std(self.config.registry_retention) {
            Ok(d) => d,
            // Out-of-range retention keeps everything
            Err(_) => return,
        };
        let now = Utc::now();
        self.registry.write().await.retain(|_, slot| match slot {
            SlotState::InFlight { .. } => true,
            SlotState::Confirmed(receipt) => receipt
                .confirmed_at
                .checked_add_signed(retention)
                .map_or(true, |expiry| expiry > now),
        });
    }

    /// Attach the latest fee basis, sign, and submit. A rejected submission
    /// is retried exactly once with a refreshed fee basis.
    async fn sign_and_submit(
        &self,
        signer: &dyn TransactionSigner,
        draft: TransactionDraft,
    ) -> Result<String, TransferFailure> {
        let mut attempt = draft;
        attempt.fee_basis = Some(self.fetch_fee_basis().await?);

        let signed = signer
            .sign(attempt.clone())
            .await
            .map_err(|e| TransferFailure::SignatureDenied(e.to_string()))?;

        match self.rpc.submit(&signed).await {
            Ok(reference) => Ok(reference),
            Err(first) => {
                warn!("Submission rejected ({}), retrying with refreshed fee basis", first);
                attempt.fee_basis = Some(self.fetch_fee_basis().await?);
                let signed = signer
                    .sign(attempt)
                    .await
                    .map_err(|e| TransferFailure::SignatureDenied(e.to_string()))?;
                self.rpc
                    .submit(&signed)
                    .await
                    .map_err(|e| TransferFailure::SubmissionFailed(e.to_string()))
            }
        }
    }

    async fn fetch_fee_basis(&self) -> Result<String, TransferFailure> {
        self.rpc
            .latest_fee_basis()
            .await
            .map_err(|e| TransferFailure::SubmissionFailed(format!("fee basis unavailable: {e}")))
    }

    /// Poll for confirmation with exponential backoff. On timeout the
    /// registry entry stays in flight and polling continues in the
    /// background, since on-chain effects cannot be cancelled.
    async fn await_confirmation(
        &self,
        key: IdempotencyKey,
        reference: String,
        from: String,
        to: String,
        amount: u64,
    ) -> Result<TransferReceipt, TransferFailure> {
        for attempt in 0..self.config.max_confirmation_attempts {
            match self.rpc.get_confirmation(&reference).await {
                Ok(ConfirmationStatus::Confirmed) => {
                    let receipt = TransferReceipt {
                        reference: reference.clone(),
                        from,
                        to,
                        amount,
                        confirmed_at: Utc::now(),
                    };
                    self.registry
                        .write()
                        .await
                        .insert(key, SlotState::Confirmed(receipt.clone()));
                    info!("Transfer {} confirmed as {}", key, reference);
                    return Ok(receipt);
                }
                Ok(ConfirmationStatus::Failed(reason)) => {
                    error!("Transfer {} failed on chain: {}", reference, reason);
                    self.registry.write().await.remove(&key);
                    return Err(TransferFailure::ExecutionError(reason));
                }
                Ok(ConfirmationStatus::Pending) => {}
                Err(err) => {
                    warn!("Confirmation query for {} failed: {}", reference, err);
                }
            }
            tokio::time::sleep(self.backoff_delay(attempt)).await;
        }

        warn!(
            "Transfer {} unconfirmed after {} attempts, polling continues in background",
            reference, self.config.max_confirmation_attempts
        );
        self.spawn_background_poll(key, reference.clone(), from, to, amount);
        Err(TransferFailure::ConfirmationTimeout { reference })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.config
            .poll_interval
            .saturating_mul(factor)
            .min(self.config.max_poll_interval)
    }

    fn spawn_background_poll(
        &self,
        key: IdempotencyKey,
        reference: String,
        from: String,
        to: String,
        amount: u64,
    ) {
        let rpc = Arc::clone(&self.rpc);
        let registry = Arc::clone(&self.registry);
        let interval = self.config.max_poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match rpc.get_confirmation(&reference).await {
                    Ok(ConfirmationStatus::Confirmed) => {
                        let receipt = TransferReceipt {
                            reference: reference.clone(),
                            from,
                            to,
                            amount,
                            confirmed_at: Utc::now(),
                        };
                        registry.write().await.insert(key, SlotState::Confirmed(receipt));
                        info!("Background poll confirmed transfer {}", reference);
                        return;
                    }
                    Ok(ConfirmationStatus::Failed(reason)) => {
                        error!("Background poll: transfer {} failed: {}", reference, reason);
                        registry.write().await.remove(&key);
                        return;
                    }
                    Ok(ConfirmationStatus::Pending) => {}
                    Err(err) => {
                        warn!("Background poll for {} failed: {}", reference, err);
                    }
                }
            }
        });
    }
}
