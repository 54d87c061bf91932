//! Escrow state machine
//!
//! The only component permitted to mutate escrow and stream records. Every
//! transition validates the (status, event) pair, runs its side effects
//! through the balance guard and transfer orchestrator, and persists the
//! fully-committed post-state; on any failure the stored record is left
//! untouched. Transitions on the same escrow id are serialized by a
//! per-record lock; unrelated escrows proceed concurrently.

use crate::balance;
use crate::chain::{NetworkRpc, TransactionSigner};
use crate::error::{EscrowError, TransferFailure};
use crate::models::{Escrow, EscrowStatus, ResolutionOutcome, Stream, StreamStatus, WorkProof};
use crate::store::{EscrowFilter, LedgerStore, StreamFilter};
use crate::transfer::{
    IdempotencyKey, TransferConfig, TransferOrchestrator, TransferOutcome, TransferReceipt,
    Transition,
};
use crate::vesting;
use crate::EscrowResult;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Escrow lifecycle service over an injected ledger store and chain handle
pub struct EscrowService<S: LedgerStore> {
    store: Arc<S>,
    rpc: Arc<dyn NetworkRpc>,
    orchestrator: TransferOrchestrator,
    custody: Arc<dyn TransactionSigner>,
    /// Per-record exclusive sections; a record's transitions are serialized,
    /// everything else proceeds concurrently
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl<S: LedgerStore> EscrowService<S> {
    /// Create the service. The store and custody signer are constructed by
    /// the process entry point and injected here.
    pub fn new(
        store: Arc<S>,
        rpc: Arc<dyn NetworkRpc>,
        custody: Arc<dyn TransactionSigner>,
        transfer_config: TransferConfig,
    ) -> Self {
        Self {
            orchestrator: TransferOrchestrator::new(Arc::clone(&rpc), transfer_config),
            store,
            rpc,
            custody,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a pending escrow for a hired application
    pub async fn create_escrow(
        &self,
        job_id: &str,
        application_id: &str,
        payer: &str,
        payee: &str,
        amount: u64,
    ) -> EscrowResult<Escrow> {
        if job_id.trim().is_empty() || application_id.trim().is_empty() {
            return Err(EscrowError::validation(
                "job and application references are required",
            ));
        }
        if payer.trim().is_empty() || payee.trim().is_empty() {
            return Err(EscrowError::validation("payer and payee are required"));
        }
        if payer == payee {
            return Err(EscrowError::validation("payer and payee must differ"));
        }
        if amount == 0 {
            return Err(EscrowError::validation("amount must be greater than 0"));
        }

        let escrow = Escrow::new(
            job_id.to_string(),
            application_id.to_string(),
            payer.to_string(),
            payee.to_string(),
            amount,
        );
        self.store.put_escrow(&escrow).await?;
        info!("Created escrow {} for job {}", escrow.id, escrow.job_id);
        Ok(escrow)
    }

    /// Deposit the escrow amount from the payer into custody.
    ///
    /// Commits `funded` only after the deposit transfer is confirmed on
    /// chain; a timed-out confirmation leaves the record pending and the
    /// same call can be retried without double-funding.
    pub async fn fund_escrow(
        &self,
        escrow_id: Uuid,
        payer_signer: &dyn TransactionSigner,
    ) -> EscrowResult<Escrow> {
        let lock = self.lock_for(escrow_id).await;
        let _guard = lock.lock().await;

        let mut escrow = self.load_escrow(escrow_id).await?;
        if !escrow.status.can_fund() {
            if escrow.funded_at.is_some() {
                return Err(EscrowError::AlreadyFunded(escrow_id));
            }
            return Err(EscrowError::invalid_transition(
                escrow.status.to_string(),
                "fund".to_string(),
            ));
        }
        if payer_signer.address() != escrow.payer {
            return Err(EscrowError::validation(
                "only the escrow payer can fund the deposit",
            ));
        }

        let fund_key = IdempotencyKey::new(escrow_id, Transition::Fund);
        // A prior attempt may already have submitted the deposit; its balance
        // was checked then, and the payer's balance now reflects the debit.
        // Preflight only guards the first submission.
        if self.orchestrator.check_outcome(&fund_key).await.is_none() {
            balance::preflight(self.rpc.as_ref(), &escrow.payer, escrow.amount).await?;
        }

        let receipt = self
            .settle_transfer(payer_signer, self.custody.address(), escrow.amount, fund_key)
            .await?;

        escrow.status = EscrowStatus::Funded;
        escrow.transfer_reference = Some(receipt.reference.clone());
        escrow.funded_at = Some(receipt.confirmed_at);
        escrow.updated_at = Utc::now();
        self.store.put_escrow(&escrow).await?;

        info!("Funded escrow {} with transfer {}", escrow_id, receipt.reference);
        Ok(escrow)
    }

    /// Record the freelancer's proof of work
    pub async fn submit_work(
        &self,
        escrow_id: Uuid,
        link: &str,
        attachment: &str,
    ) -> EscrowResult<Escrow> {
        let lock = self.lock_for(escrow_id).await;
        let _guard = lock.lock().await;

        let mut escrow = self.load_escrow(escrow_id).await?;
        if !escrow.status.can_submit_work() {
            return Err(EscrowError::invalid_transition(
                escrow.status.to_string(),
                "submit_work".to_string(),
            ));
        }
        if link.trim().is_empty() || attachment.trim().is_empty() {
            return Err(EscrowError::validation(
                "work submission link and proof are required",
            ));
        }

        escrow.proof = Some(WorkProof {
            link: link.to_string(),
            attachment: attachment.to_string(),
        });
        escrow.status = EscrowStatus::WorkSubmitted;
        escrow.updated_at = Utc::now();
        self.store.put_escrow(&escrow).await?;

        info!("Work submitted for escrow {}", escrow_id);
        Ok(escrow)
    }

    /// Approve the submitted work and release custody funds to the payee.
    /// At most one release occurs; a repeat approval is rejected.
    pub async fn approve_release(&self, escrow_id: Uuid, caller: &str) -> EscrowResult<Escrow> {
        let lock = self.lock_for(escrow_id).await;
        let _guard = lock.lock().await;

        let mut escrow = self.load_escrow(escrow_id).await?;
        if escrow.released_at.is_some() {
            return Err(EscrowError::AlreadyReleased(escrow_id));
        }
        if !escrow.status.can_approve() {
            return Err(EscrowError::invalid_transition(
                escrow.status.to_string(),
                "approve".to_string(),
            ));
        }
        if caller != escrow.payer {
            return Err(EscrowError::validation(
                "only the escrow payer can approve release",
            ));
        }

        let receipt = self
            .release_from_custody(
                &escrow.payee,
                escrow.amount,
                IdempotencyKey::new(escrow_id, Transition::Release),
            )
            .await?;

        escrow.status = EscrowStatus::Released;
        escrow.released_at = Some(receipt.confirmed_at);
        escrow.updated_at = Utc::now();
        self.store.put_escrow(&escrow).await?;

        info!("Released escrow {} to {}", escrow_id, escrow.payee);
        Ok(escrow)
    }

    /// Freeze the escrow for external arbitration
    pub async fn raise_dispute(&self, escrow_id: Uuid, caller: &str) -> EscrowResult<Escrow> {
        let lock = self.lock_for(escrow_id).await;
        let _guard = lock.lock().await;

        let mut escrow = self.load_escrow(escrow_id).await?;
        if caller != escrow.payer && caller != escrow.payee {
            return Err(EscrowError::validation(
                "only the payer or payee can raise a dispute",
            ));
        }
        self.reconcile_pending_release(&mut escrow).await?;
        if !escrow.status.can_dispute() {
            return Err(EscrowError::invalid_transition(
                escrow.status.to_string(),
                "dispute".to_string(),
            ));
        }

        escrow.status = EscrowStatus::Disputed;
        escrow.updated_at = Utc::now();
        self.store.put_escrow(&escrow).await?;

        warn!("Escrow {} disputed by {}", escrow_id, caller);
        Ok(escrow)
    }

    /// Apply an external arbitration decision to a disputed escrow
    pub async fn resolve_dispute(
        &self,
        escrow_id: Uuid,
        outcome: ResolutionOutcome,
    ) -> EscrowResult<Escrow> {
        let lock = self.lock_for(escrow_id).await;
        let _guard = lock.lock().await;

        let mut escrow = self.load_escrow(escrow_id).await?;
        if !escrow.status.can_resolve() {
            return Err(EscrowError::invalid_transition(
                escrow.status.to_string(),
                "resolve".to_string(),
            ));
        }
        self.reconcile_pending_release(&mut escrow).await?;

        match outcome {
            ResolutionOutcome::ReleaseToPayee => {
                let receipt = self
                    .release_from_custody(
                        &escrow.payee,
                        escrow.amount,
                        IdempotencyKey::new(escrow_id, Transition::Release),
                    )
                    .await?;
                escrow.status = EscrowStatus::Released;
                escrow.released_at = Some(receipt.confirmed_at);
            }
            ResolutionOutcome::RefundToPayer => {
                self.release_from_custody(
                    &escrow.payer,
                    escrow.amount,
                    IdempotencyKey::new(escrow_id, Transition::Refund),
                )
                .await?;
                escrow.status = EscrowStatus::Refunded;
            }
        }
        escrow.updated_at = Utc::now();
        self.store.put_escrow(&escrow).await?;

        info!("Resolved dispute on escrow {} as {:?}", escrow_id, outcome);
        Ok(escrow)
    }

    pub async fn get_escrow(&self, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.load_escrow(escrow_id).await
    }

    pub async fn list_escrows(&self, filter: &EscrowFilter) -> EscrowResult<Vec<Escrow>> {
        self.store.list_escrows(filter).await
    }

    /// Open a vesting stream against an already-funded escrow. Funds stay in
    /// custody; withdrawals move them as they vest.
    pub async fn create_stream(
        &self,
        escrow_id: Uuid,
        sender: &str,
        recipient: &str,
        total_amount: u64,
        start_time: i64,
        end_time: i64,
    ) -> EscrowResult<Stream> {
        let lock = self.lock_for(escrow_id).await;
        let _guard = lock.lock().await;

        let escrow = self.load_escrow(escrow_id).await?;
        if escrow.status != EscrowStatus::Funded {
            return Err(EscrowError::validation(
                "a stream requires a funded escrow",
            ));
        }
        if sender.trim().is_empty() || recipient.trim().is_empty() {
            return Err(EscrowError::validation("sender and recipient are required"));
        }
        vesting::validate_schedule(total_amount, start_time, end_time)?;
        if total_amount > escrow.amount {
            return Err(EscrowError::validation(
                "stream amount cannot exceed the escrowed amount",
            ));
        }
        if self.store.find_stream_by_escrow(escrow_id).await?.is_some() {
            return Err(EscrowError::validation("escrow already has a stream"));
        }

        let stream = Stream::new(
            escrow_id,
            sender.to_string(),
            recipient.to_string(),
            total_amount,
            start_time,
            end_time,
            escrow.transfer_reference.clone(),
        );
        self.store.put_stream(&stream).await?;
        info!("Opened stream {} on escrow {}", stream.id, escrow_id);
        Ok(stream)
    }

    /// Withdraw a vested amount from a stream to its recipient
    pub async fn withdraw_vested(&self, stream_id: Uuid, amount: u64) -> EscrowResult<Stream> {
        let lock = self.lock_for(stream_id).await;
        let _guard = lock.lock().await;

        let mut stream = self.load_stream(stream_id).await?;
        if !stream.status.can_withdraw() {
            return Err(EscrowError::invalid_transition(
                stream.status.to_string(),
                "withdraw".to_string(),
            ));
        }
        if amount == 0 {
            return Err(EscrowError::validation("amount must be greater than 0"));
        }

        let vested = vesting::vested_amount(&stream, Utc::now().timestamp())?;
        if amount > vested {
            return Err(EscrowError::validation(format!(
                "amount {amount} exceeds vested balance {vested}"
            )));
        }

        let receipt = self
            .release_from_custody(
                &stream.recipient,
                amount,
                IdempotencyKey::new(
                    stream.escrow_id,
                    Transition::Withdraw {
                        sequence: stream.withdrawn_amount,
                    },
                ),
            )
            .await?;

        // A replayed key returns the receipt of the earlier submission; the
        // ledger records what actually moved, not what this call asked for
        if receipt.amount != amount {
            warn!(
                "Stream {} withdrawal of {} replayed transfer {} which moved {}",
                stream_id, amount, receipt.reference, receipt.amount
            );
        }
        stream.withdrawn_amount += receipt.amount;
        if stream.withdrawn_amount >= stream.total_amount {
            stream.status = StreamStatus::Completed;
        }
        stream.updated_at = Utc::now();
        self.store.put_stream(&stream).await?;

        info!(
            "Withdrew {} from stream {} (transfer {})",
            receipt.amount, stream_id, receipt.reference
        );
        Ok(stream)
    }

    /// Cancel an active stream; only the sender may cancel
    pub async fn cancel_stream(&self, stream_id: Uuid, caller: &str) -> EscrowResult<Stream> {
        let lock = self.lock_for(stream_id).await;
        let _guard = lock.lock().await;

        let mut stream = self.load_stream(stream_id).await?;
        if caller != stream.sender {
            return Err(EscrowError::validation(
                "only the stream sender can cancel",
            ));
        }
        if stream.status != StreamStatus::Active {
            return Err(EscrowError::invalid_transition(
                stream.status.to_string(),
                "cancel".to_string(),
            ));
        }

        stream.status = StreamStatus::Cancelled;
        stream.updated_at = Utc::now();
        self.store.put_stream(&stream).await?;

        info!("Cancelled stream {}", stream_id);
        Ok(stream)
    }

    pub async fn get_stream(&self, stream_id: Uuid) -> EscrowResult<Stream> {
        self.load_stream(stream_id).await
    }

    pub async fn list_streams(&self, filter: &StreamFilter) -> EscrowResult<Vec<Stream>> {
        self.store.list_streams(filter).await
    }

    /// A release submitted before this transition may still confirm; a
    /// dispute or refund must not race it. Blocks while the outcome is
    /// unknown, and commits a confirmed release to the record.
    async fn reconcile_pending_release(&self, escrow: &mut Escrow) -> EscrowResult<()> {
        let release_key = IdempotencyKey::new(escrow.id, Transition::Release);
        match self.orchestrator.check_outcome(&release_key).await {
            None => Ok(()),
            Some(TransferOutcome::InFlight { reference }) => {
                warn!(
                    "Escrow {} has release {} awaiting confirmation",
                    escrow.id, reference
                );
                Err(TransferFailure::ConfirmationTimeout { reference }.into())
            }
            Some(TransferOutcome::Confirmed(receipt)) => {
                if escrow.released_at.is_none() {
                    escrow.status = EscrowStatus::Released;
                    escrow.released_at = Some(receipt.confirmed_at);
                    escrow.updated_at = Utc::now();
                    self.store.put_escrow(escrow).await?;
                    info!(
                        "Escrow {} already released by transfer {}",
                        escrow.id, receipt.reference
                    );
                }
                Err(EscrowError::AlreadyReleased(escrow.id))
            }
        }
    }

    /// Debit the custody wallet after a balance preflight
    async fn release_from_custody(
        &self,
        to: &str,
        amount: u64,
        key: IdempotencyKey,
    ) -> EscrowResult<TransferReceipt> {
        balance::preflight(self.rpc.as_ref(), self.custody.address(), amount).await?;
        self.settle_transfer(self.custody.as_ref(), to, amount, key)
            .await
    }

    /// Run a transfer; on a confirmation timeout, re-query the recorded
    /// outcome once before surfacing the unknown result. Never resubmits.
    async fn settle_transfer(
        &self,
        signer: &dyn TransactionSigner,
        to: &str,
        amount: u64,
        key: IdempotencyKey,
    ) -> EscrowResult<TransferReceipt> {
        match self.orchestrator.transfer(signer, to, amount, key).await {
            Ok(receipt) => Ok(receipt),
            Err(TransferFailure::ConfirmationTimeout { reference }) => {
                match self.orchestrator.check_outcome(&key).await {
                    Some(TransferOutcome::Confirmed(receipt)) => Ok(receipt),
                    _ => Err(TransferFailure::ConfirmationTimeout { reference }.into()),
                }
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn load_escrow(&self, escrow_id: Uuid) -> EscrowResult<Escrow> {
        self.store
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("escrow {escrow_id}")))
    }

    async fn load_stream(&self, stream_id: Uuid) -> EscrowResult<Stream> {
        self.store
            .get_stream(stream_id)
            .await?
            .ok_or_else(|| EscrowError::not_found(format!("stream {stream_id}")))
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // Entries nothing else holds belong to finished transitions
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::FEE_RESERVE;
    use crate::chain::mock::{MockRpc, MockSigner};
    use crate::chain::ConfirmationStatus;
    use crate::chain::CustodyWallet;
    use crate::store::MemoryLedger;
    use std::time::Duration;

    const CUSTODY: &str = "custody-wallet";
    const CLIENT: &str = "client-wallet";
    const FREELANCER: &str = "freelancer-wallet";

    struct Harness {
        service: Arc<EscrowService<MemoryLedger>>,
        rpc: Arc<MockRpc>,
        payer: MockSigner,
    }

    fn harness() -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let rpc = Arc::new(MockRpc::new());
        let custody = Arc::new(CustodyWallet::from_keypair_json(CUSTODY, "[1,2,3,4]").unwrap());
        let service = Arc::new(EscrowService::new(
            Arc::new(MemoryLedger::open()),
            rpc.clone(),
            custody,
            TransferConfig {
                max_confirmation_attempts: 3,
                poll_interval: Duration::from_millis(1),
                max_poll_interval: Duration::from_millis(5),
                registry_retention: Duration::from_secs(3600),
            },
        ));
        Harness {
            service,
            rpc,
            payer: MockSigner::new(CLIENT),
        }
    }

    impl Harness {
        async fn pending_escrow(&self, amount: u64) -> Escrow {
            self.service
                .create_escrow("job-1", "app-1", CLIENT, FREELANCER, amount)
                .await
                .unwrap()
        }

        async fn funded_escrow(&self, amount: u64) -> Escrow {
            let escrow = self.pending_escrow(amount).await;
            self.rpc.set_balance(CLIENT, amount + FEE_RESERVE);
            self.rpc.set_balance(CUSTODY, amount + FEE_RESERVE);
            self.service
                .fund_escrow(escrow.id, &self.payer)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn full_lifecycle_releases_exactly_once() {
        let h = harness();
        let escrow = h.funded_escrow(10_000).await;
        assert_eq!(escrow.status, EscrowStatus::Funded);
        assert!(escrow.funded_at.is_some());
        assert_eq!(escrow.transfer_reference.as_deref(), Some("tx-1"));

        let escrow = h
            .service
            .submit_work(escrow.id, "https://repo/pr/1", "ipfs://proof")
            .await
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::WorkSubmitted);

        let escrow = h.service.approve_release(escrow.id, CLIENT).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
        assert!(escrow.released_at.is_some());

        // deposit + release
        assert_eq!(h.rpc.submission_count(), 2);
        let release = &h.rpc.submissions()[1];
        assert_eq!(release.draft.from, CUSTODY);
        assert_eq!(release.draft.to, FREELANCER);
        assert_eq!(release.draft.amount, 10_000);
    }

    #[tokio::test]
    async fn second_approval_is_rejected_without_a_second_transfer() {
        let h = harness();
        let escrow = h.funded_escrow(10_000).await;
        h.service
            .submit_work(escrow.id, "link", "proof")
            .await
            .unwrap();
        h.service.approve_release(escrow.id, CLIENT).await.unwrap();

        let err = h
            .service
            .approve_release(escrow.id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::AlreadyReleased(_)));
        assert_eq!(h.rpc.submission_count(), 2);
    }

    #[tokio::test]
    async fn underfunded_payer_is_rejected_before_any_transfer() {
        let h = harness();
        let escrow = h.pending_escrow(10_000).await;
        h.rpc.set_balance(CLIENT, 10_000); // misses the fee reserve

        let err = h.service.fund_escrow(escrow.id, &h.payer).await.unwrap_err();
        assert!(matches!(err, EscrowError::InsufficientBalance { .. }));
        assert_eq!(h.rpc.submission_count(), 0);
        assert_eq!(
            h.service.get_escrow(escrow.id).await.unwrap().status,
            EscrowStatus::Pending
        );
    }

    #[tokio::test]
    async fn invalid_transition_leaves_the_record_untouched() {
        let h = harness();
        let escrow = h.pending_escrow(10_000).await;
        let before = serde_json::to_vec(&h.service.get_escrow(escrow.id).await.unwrap()).unwrap();

        let err = h
            .service
            .approve_release(escrow.id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidTransition { .. }));

        let err = h
            .service
            .submit_work(escrow.id, "link", "proof")
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidTransition { .. }));

        let after = serde_json::to_vec(&h.service.get_escrow(escrow.id).await.unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn only_the_payer_funds_and_approves() {
        let h = harness();
        let escrow = h.pending_escrow(5_000).await;
        h.rpc.set_balance(FREELANCER, 1_000_000);
        let imposter = MockSigner::new(FREELANCER);

        let err = h.service.fund_escrow(escrow.id, &imposter).await.unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));

        let escrow = h.funded_escrow(5_000).await;
        h.service
            .submit_work(escrow.id, "link", "proof")
            .await
            .unwrap();
        let err = h
            .service
            .approve_release(escrow.id, FREELANCER)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[tokio::test]
    async fn dispute_freezes_and_resolution_refunds_the_payer() {
        let h = harness();
        let escrow = h.funded_escrow(8_000).await;

        let escrow = h
            .service
            .raise_dispute(escrow.id, FREELANCER)
            .await
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::Disputed);

        // frozen: no further lifecycle events accepted
        let err = h
            .service
            .submit_work(escrow.id, "link", "proof")
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidTransition { .. }));

        let escrow = h
            .service
            .resolve_dispute(escrow.id, ResolutionOutcome::RefundToPayer)
            .await
            .unwrap();
        assert_eq!(escrow.status, EscrowStatus::Refunded);
        assert!(escrow.released_at.is_none());

        let refund = &h.rpc.submissions()[1];
        assert_eq!(refund.draft.from, CUSTODY);
        assert_eq!(refund.draft.to, CLIENT);
    }

    #[tokio::test]
    async fn outsiders_cannot_dispute() {
        let h = harness();
        let escrow = h.funded_escrow(8_000).await;
        let err = h
            .service
            .raise_dispute(escrow.id, "rando-wallet")
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[tokio::test]
    async fn concurrent_approve_and_dispute_admit_exactly_one_winner() {
        let h = harness();
        let escrow = h.funded_escrow(10_000).await;
        h.service
            .submit_work(escrow.id, "link", "proof")
            .await
            .unwrap();

        let (approved, disputed) = tokio::join!(
            h.service.approve_release(escrow.id, CLIENT),
            h.service.raise_dispute(escrow.id, FREELANCER),
        );

        assert!(
            approved.is_ok() != disputed.is_ok(),
            "exactly one of the racing transitions must win"
        );
        let status = h.service.get_escrow(escrow.id).await.unwrap().status;
        if approved.is_ok() {
            assert_eq!(status, EscrowStatus::Released);
        } else {
            assert_eq!(status, EscrowStatus::Disputed);
        }
    }

    #[tokio::test]
    async fn fund_retry_after_timeout_reuses_the_submitted_transfer() {
        let h = harness();
        let escrow = h.pending_escrow(10_000).await;
        h.rpc.set_balance(CLIENT, 1_000_000);
        // Outlast the foreground polling bound
        h.rpc
            .script_confirmations(vec![ConfirmationStatus::Pending; 4]);

        let err = h.service.fund_escrow(escrow.id, &h.payer).await.unwrap_err();
        assert!(matches!(
            err,
            EscrowError::Transfer(TransferFailure::ConfirmationTimeout { .. })
        ));
        assert_eq!(
            h.service.get_escrow(escrow.id).await.unwrap().status,
            EscrowStatus::Pending
        );

        // Background polling confirms the original submission; the retry
        // commits the funding without a second on-chain transfer
        tokio::time::sleep(Duration::from_millis(30)).await;
        let escrow = h.service.fund_escrow(escrow.id, &h.payer).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Funded);
        assert_eq!(h.rpc.submission_count(), 1);
    }

    #[tokio::test]
    async fn dispute_cannot_race_an_unconfirmed_release() {
        let h = harness();
        let escrow = h.funded_escrow(10_000).await;
        h.service
            .submit_work(escrow.id, "link", "proof")
            .await
            .unwrap();

        // Release confirmation outlasts the foreground polling bound
        h.rpc
            .script_confirmations(vec![ConfirmationStatus::Pending; 4]);
        let err = h
            .service
            .approve_release(escrow.id, CLIENT)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::Transfer(TransferFailure::ConfirmationTimeout { .. })
        ));

        // While the release outcome is unknown the dispute must not freeze
        // funds that may already have moved
        let err = h
            .service
            .raise_dispute(escrow.id, FREELANCER)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::Transfer(TransferFailure::ConfirmationTimeout { .. })
        ));

        // Background polling confirms the release; the next dispute attempt
        // observes it and the record commits as released
        tokio::time::sleep(Duration::from_millis(30)).await;
        let err = h
            .service
            .raise_dispute(escrow.id, FREELANCER)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::AlreadyReleased(_)));

        let escrow = h.service.get_escrow(escrow.id).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
        assert!(escrow.released_at.is_some());
        // deposit + release; no refund ever leaves custody
        assert_eq!(h.rpc.submission_count(), 2);
    }

    #[tokio::test]
    async fn fund_retry_commits_after_the_deposit_debited_the_payer() {
        let h = harness();
        let escrow = h.pending_escrow(10_000).await;
        h.rpc.set_balance(CLIENT, 10_000 + FEE_RESERVE);
        h.rpc
            .script_confirmations(vec![ConfirmationStatus::Pending; 4]);

        let err = h.service.fund_escrow(escrow.id, &h.payer).await.unwrap_err();
        assert!(matches!(
            err,
            EscrowError::Transfer(TransferFailure::ConfirmationTimeout { .. })
        ));

        // The confirmed deposit drained the payer's wallet; the retry must
        // not preflight against the post-debit balance
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.rpc.set_balance(CLIENT, 0);
        let escrow = h.service.fund_escrow(escrow.id, &h.payer).await.unwrap();
        assert_eq!(escrow.status, EscrowStatus::Funded);
        assert_eq!(h.rpc.submission_count(), 1);
    }

    #[tokio::test]
    async fn empty_work_submission_is_rejected() {
        let h = harness();
        let escrow = h.funded_escrow(5_000).await;
        let err = h
            .service
            .submit_work(escrow.id, "", "proof")
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
        let err = h
            .service
            .submit_work(escrow.id, "link", "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[tokio::test]
    async fn create_escrow_validates_input() {
        let h = harness();
        assert!(h
            .service
            .create_escrow("job", "app", CLIENT, FREELANCER, 0)
            .await
            .is_err());
        assert!(h
            .service
            .create_escrow("job", "app", CLIENT, CLIENT, 100)
            .await
            .is_err());
        assert!(h
            .service
            .create_escrow("", "app", CLIENT, FREELANCER, 100)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_ids_surface_not_found() {
        let h = harness();
        assert!(matches!(
            h.service.get_escrow(Uuid::new_v4()).await.unwrap_err(),
            EscrowError::NotFound(_)
        ));
        assert!(matches!(
            h.service.withdraw_vested(Uuid::new_v4(), 1).await.unwrap_err(),
            EscrowError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn stream_requires_a_funded_escrow_and_is_unique() {
        let h = harness();
        let pending = h.pending_escrow(10_000).await;
        let now = Utc::now().timestamp();
        assert!(h
            .service
            .create_stream(pending.id, CLIENT, FREELANCER, 10_000, now, now + 100)
            .await
            .is_err());

        let funded = h.funded_escrow(10_000).await;
        h.service
            .create_stream(funded.id, CLIENT, FREELANCER, 10_000, now, now + 100)
            .await
            .unwrap();
        let err = h
            .service
            .create_stream(funded.id, CLIENT, FREELANCER, 10_000, now, now + 100)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
    }

    #[tokio::test]
    async fn stream_amount_and_schedule_are_validated() {
        let h = harness();
        let funded = h.funded_escrow(10_000).await;
        let now = Utc::now().timestamp();

        // more than escrowed
        assert!(h
            .service
            .create_stream(funded.id, CLIENT, FREELANCER, 10_001, now, now + 100)
            .await
            .is_err());
        // inverted schedule
        assert!(h
            .service
            .create_stream(funded.id, CLIENT, FREELANCER, 1_000, now + 100, now)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn vested_withdrawal_moves_funds_and_completes_the_stream() {
        let h = harness();
        let funded = h.funded_escrow(10_000).await;
        let now = Utc::now().timestamp();
        // schedule already elapsed: everything is vested
        let stream = h
            .service
            .create_stream(funded.id, CLIENT, FREELANCER, 10_000, now - 200, now - 100)
            .await
            .unwrap();

        let stream = h.service.withdraw_vested(stream.id, 4_000).await.unwrap();
        assert_eq!(stream.withdrawn_amount, 4_000);
        assert_eq!(stream.status, StreamStatus::Active);

        let stream = h.service.withdraw_vested(stream.id, 6_000).await.unwrap();
        assert_eq!(stream.withdrawn_amount, 10_000);
        assert_eq!(stream.status, StreamStatus::Completed);

        // deposit + two withdrawals
        assert_eq!(h.rpc.submission_count(), 3);
        let last = &h.rpc.submissions()[2];
        assert_eq!(last.draft.from, CUSTODY);
        assert_eq!(last.draft.to, FREELANCER);
    }

    #[tokio::test]
    async fn withdrawal_retry_commits_the_confirmed_amount() {
        let h = harness();
        let funded = h.funded_escrow(10_000).await;
        let now = Utc::now().timestamp();
        let stream = h
            .service
            .create_stream(funded.id, CLIENT, FREELANCER, 10_000, now - 200, now - 100)
            .await
            .unwrap();

        h.rpc
            .script_confirmations(vec![ConfirmationStatus::Pending; 4]);
        let err = h
            .service
            .withdraw_vested(stream.id, 4_000)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::Transfer(TransferFailure::ConfirmationTimeout { .. })
        ));
        assert_eq!(
            h.service.get_stream(stream.id).await.unwrap().withdrawn_amount,
            0
        );

        // The 4_000 transfer confirms in the background; a retry asking for
        // 6_000 replays the same key and must record what actually moved
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stream = h.service.withdraw_vested(stream.id, 6_000).await.unwrap();
        assert_eq!(stream.withdrawn_amount, 4_000);
        assert_eq!(stream.status, StreamStatus::Active);
        assert_eq!(h.rpc.submission_count(), 2);

        // The remainder goes out under a fresh key
        let stream = h.service.withdraw_vested(stream.id, 6_000).await.unwrap();
        assert_eq!(stream.withdrawn_amount, 10_000);
        assert_eq!(stream.status, StreamStatus::Completed);
        assert_eq!(h.rpc.submission_count(), 3);
    }

    #[tokio::test]
    async fn finished_transitions_leave_no_lock_entries_behind() {
        let h = harness();
        let first = h.funded_escrow(1_000).await;
        let second = h.funded_escrow(1_000).await;

        let locks = h.service.locks.lock().await;
        assert!(!locks.contains_key(&first.id));
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key(&second.id));
    }

    #[tokio::test]
    async fn withdrawal_beyond_vested_is_rejected() {
        let h = harness();
        let funded = h.funded_escrow(10_000).await;
        let now = Utc::now().timestamp();
        // schedule has not started: nothing vested
        let stream = h
            .service
            .create_stream(funded.id, CLIENT, FREELANCER, 10_000, now + 100, now + 200)
            .await
            .unwrap();

        let err = h.service.withdraw_vested(stream.id, 1).await.unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));
        assert_eq!(h.rpc.submission_count(), 1); // just the deposit
    }

    #[tokio::test]
    async fn cancelled_stream_stops_withdrawals() {
        let h = harness();
        let funded = h.funded_escrow(10_000).await;
        let now = Utc::now().timestamp();
        let stream = h
            .service
            .create_stream(funded.id, CLIENT, FREELANCER, 10_000, now - 200, now - 100)
            .await
            .unwrap();

        // only the sender cancels
        let err = h
            .service
            .cancel_stream(stream.id, FREELANCER)
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::Validation(_)));

        let stream = h.service.cancel_stream(stream.id, CLIENT).await.unwrap();
        assert_eq!(stream.status, StreamStatus::Cancelled);

        let err = h.service.withdraw_vested(stream.id, 1_000).await.unwrap_err();
        assert!(matches!(err, EscrowError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn list_filters_streams_by_party() {
        let h = harness();
        let funded = h.funded_escrow(10_000).await;
        let now = Utc::now().timestamp();
        h.service
            .create_stream(funded.id, CLIENT, FREELANCER, 1_000, now, now + 100)
            .await
            .unwrap();

        let by_recipient = h
            .service
            .list_streams(&StreamFilter {
                recipient: Some(FREELANCER.into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_recipient.len(), 1);

        let by_escrow = h
            .service
            .list_streams(&StreamFilter {
                escrow_id: Some(funded.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_escrow.len(), 1);
    }
}
