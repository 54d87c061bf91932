//! Escrow and payment-release core for the Middlemint freelance marketplace
//!
//! This crate implements the custody-side escrow lifecycle between a client
//! and a freelancer:
//! - A state machine that keeps the ledger record consistent with
//!   irreversible on-chain fund movements
//! - Transfer orchestration (build, sign, submit, confirm) with idempotent
//!   retry handling
//! - Balance preflight checks before any debit-triggering transition
//! - Linear vesting streams for time-released payouts
//!
//! Job and application records, wallet sessions, and the UI are external
//! collaborators; persistence is injected through the [`store::LedgerStore`]
//! trait and the chain through [`chain::NetworkRpc`].

pub mod balance;
pub mod chain;
pub mod engine;
pub mod error;
pub mod models;
pub mod settings;
pub mod store;
pub mod transfer;
pub mod vesting;

use error::EscrowError;

/// Result type alias for escrow operations
pub type EscrowResult<T> = Result<T, EscrowError>;
