//! Wallet and network seam
//!
//! The chain is an external collaborator: a network RPC exposing balance,
//! submission, and confirmation queries, and signers producing signed
//! transactions. Payer-side signing is supplied by the caller (the client's
//! wallet session); custody-side signing is the [`CustodyWallet`], a
//! conventional keypair-controlled account.

use crate::error::EscrowError;
use crate::EscrowResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// RPC query or submission error
#[derive(Debug, Error)]
#[error("rpc error: {0}")]
pub struct RpcError(pub String);

/// Signer refusal or failure
#[derive(Debug, Error)]
#[error("signer error: {0}")]
pub struct SignerError(pub String);

/// Unsigned native-asset transfer between two wallet addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub from: String,
    pub to: String,
    /// Smallest currency unit
    pub amount: u64,
    /// Latest network fee-basis metadata (blockhash analog); attached by the
    /// orchestrator just before signing
    pub fee_basis: Option<String>,
    pub memo: Option<String>,
}

impl TransactionDraft {
    /// Build a transfer draft with no fee basis attached yet
    pub fn transfer(from: impl Into<String>, to: impl Into<String>, amount: u64) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            amount,
            fee_basis: None,
            memo: None,
        }
    }
}

/// A draft plus the signature that authorizes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub draft: TransactionDraft,
    pub signature: String,
}

/// Network acknowledgment state of a submitted transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfirmationStatus {
    /// Submitted, not yet final
    Pending,
    /// Final; funds moved
    Confirmed,
    /// Final; the transfer reported an on-chain error
    Failed(String),
}

/// Network RPC consumed by the balance guard and transfer orchestrator
#[async_trait]
pub trait NetworkRpc: Send + Sync {
    async fn get_balance(&self, address: &str) -> Result<u64, RpcError>;

    /// Latest fee-basis metadata to attach to a draft before signing
    async fn latest_fee_basis(&self) -> Result<String, RpcError>;

    /// Submit a signed transaction; returns the transfer reference
    async fn submit(&self, tx: &SignedTransaction) -> Result<String, RpcError>;

    async fn get_confirmation(&self, reference: &str) -> Result<ConfirmationStatus, RpcError>;
}

/// Produces signatures for transaction drafts
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Address of the wallet this signer controls
    fn address(&self) -> &str;

    async fn sign(&self, draft: TransactionDraft) -> Result<SignedTransaction, SignerError>;
}

/// Intermediary custody wallet controlled by a local keypair
pub struct CustodyWallet {
    address: String,
    keypair: Vec<u8>,
}

impl CustodyWallet {
    /// Load the custody keypair from its JSON byte-array encoding, as stored
    /// in the deployment secret
    pub fn from_keypair_json(address: impl Into<String>, encoded: &str) -> EscrowResult<Self> {
        let keypair: Vec<u8> = serde_json::from_str(encoded)?;
        if keypair.is_empty() {
            return Err(EscrowError::validation("custody keypair is empty"));
        }
        Ok(Self {
            address: address.into(),
            keypair,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl TransactionSigner for CustodyWallet {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(&self, draft: TransactionDraft) -> Result<SignedTransaction, SignerError> {
        if draft.from != self.address {
            return Err(SignerError(format!(
                "custody wallet {} cannot sign for {}",
                self.address, draft.from
            )));
        }
        if draft.fee_basis.is_none() {
            return Err(SignerError("draft is missing fee basis".into()));
        }
        // Signature scheme is opaque to the escrow core; the keypair length
        // check at load time is the only structural validation done here
        let signature = format!("sig-{}-{}", self.keypair.len(), Uuid::new_v4());
        Ok(SignedTransaction { draft, signature })
    }
}
