//! Core data models for the escrow system
//!
//! Escrow and Stream records, their closed status enums, and the transition
//! predicates the state machine evaluates. Records are owned exclusively by
//! the state machine in [`crate::engine`]; the ledger store only persists
//! them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Escrow lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EscrowStatus {
    /// Created, awaiting deposit from the client
    Pending,
    /// Deposit confirmed and held in the custody wallet
    Funded,
    /// Freelancer submitted proof of work
    WorkSubmitted,
    /// Funds released to the freelancer
    Released,
    /// Funds returned to the client after dispute resolution
    Refunded,
    /// Frozen for external arbitration
    Disputed,
}

impl EscrowStatus {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released | Self::Refunded)
    }

    /// Check if this state allows funding
    pub fn can_fund(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Check if this state allows work submission
    pub fn can_submit_work(&self) -> bool {
        matches!(self, Self::Funded)
    }

    /// Check if this state allows release approval
    pub fn can_approve(&self) -> bool {
        matches!(self, Self::WorkSubmitted)
    }

    /// Check if this state allows raising a dispute
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Funded | Self::WorkSubmitted)
    }

    /// Check if this state allows arbitration resolution
    pub fn can_resolve(&self) -> bool {
        matches!(self, Self::Disputed)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Funded => "funded",
            Self::WorkSubmitted => "work-submitted",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::Disputed => "disputed",
        };
        f.write_str(s)
    }
}

/// Vesting stream states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// Vesting and withdrawable
    Active,
    /// Accrual suspended; no withdrawals
    Paused,
    /// Fully withdrawn
    Completed,
    /// Cancelled by the sender
    Cancelled,
}

impl StreamStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Check if this state allows withdrawals
    pub fn can_withdraw(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Proof of completed work, set exactly once at work submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkProof {
    /// Link to the deliverable
    pub link: String,
    /// Attachment reference or supporting evidence
    pub attachment: String,
}

/// Outcome of external dispute arbitration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    /// Arbitration sided with the freelancer; release custody funds to payee
    ReleaseToPayee,
    /// Arbitration sided with the client; return custody funds to payer
    RefundToPayer,
}

/// Escrow record, one per hired application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub id: Uuid,

    // External references, immutable once set
    pub job_id: String,
    pub application_id: String,

    // Parties, immutable after creation
    pub payer: String,
    pub payee: String,

    /// Amount in smallest currency unit, immutable after creation
    pub amount: u64,
    pub status: EscrowStatus,

    /// Reference of the on-chain transfer that funded the escrow,
    /// set exactly once at funding
    pub transfer_reference: Option<String>,
    /// Set exactly once at work submission
    pub proof: Option<WorkProof>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub funded_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Escrow {
    /// Create a new pending escrow
    pub fn new(
        job_id: String,
        application_id: String,
        payer: String,
        payee: String,
        amount: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            application_id,
            payer,
            payee,
            amount,
            status: EscrowStatus::Pending,
            transfer_reference: None,
            proof: None,
            created_at: now,
            updated_at: now,
            funded_at: None,
            released_at: None,
        }
    }
}

/// Vesting stream attached one-to-one to a funded escrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: Uuid,
    pub escrow_id: Uuid,

    pub sender: String,
    pub recipient: String,

    /// Total amount released over the schedule, smallest currency unit
    pub total_amount: u64,
    /// Schedule bounds, unix seconds; start < end
    pub start_time: i64,
    pub end_time: i64,
    /// Monotonically non-decreasing, never exceeds `total_amount`
    pub withdrawn_amount: u64,

    pub status: StreamStatus,

    /// Reference of the transfer that funded the owning escrow
    pub transaction_reference: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Stream {
    /// Create a new active stream for an escrow
    pub fn new(
        escrow_id: Uuid,
        sender: String,
        recipient: String,
        total_amount: u64,
        start_time: i64,
        end_time: i64,
        transaction_reference: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            escrow_id,
            sender,
            recipient,
            total_amount,
            start_time,
            end_time,
            withdrawn_amount: 0,
            status: StreamStatus::Active,
            transaction_reference,
            created_at: now,
            updated_at: now,
        }
    }
}
