//! Vesting calculator
//!
//! Pure linear time-release math for payout streams. No side effects; the
//! state machine applies the results.

use crate::error::EscrowError;
use crate::models::Stream;
use crate::EscrowResult;

/// Maximum stream length: one year
pub const MAX_STREAM_DURATION_SECS: i64 = 365 * 24 * 60 * 60;

/// Amount currently withdrawable from `stream` at unix time `now`.
///
/// Zero before the schedule starts, the full remainder at or past the end,
/// and the floored linear fraction minus what was already withdrawn in
/// between.
pub fn vested_amount(stream: &Stream, now: i64) -> EscrowResult<u64> {
    if stream.end_time <= stream.start_time {
        return Err(EscrowError::validation(
            "stream end time must be after start time",
        ));
    }

    if now < stream.start_time {
        return Ok(0);
    }
    if now >= stream.end_time {
        return Ok(stream.total_amount.saturating_sub(stream.withdrawn_amount));
    }

    let elapsed = (now - stream.start_time) as u128;
    let duration = (stream.end_time - stream.start_time) as u128;
    let vested = (stream.total_amount as u128 * elapsed / duration) as u64;
    Ok(vested.saturating_sub(stream.withdrawn_amount))
}

/// Validate a schedule before a stream is created
pub fn validate_schedule(total_amount: u64, start_time: i64, end_time: i64) -> EscrowResult<()> {
    if total_amount == 0 {
        return Err(EscrowError::validation("stream amount must be greater than 0"));
    }
    if start_time >= end_time {
        return Err(EscrowError::validation(
            "stream start time must be before end time",
        ));
    }
    if end_time - start_time > MAX_STREAM_DURATION_SECS {
        return Err(EscrowError::validation(
            "stream duration cannot exceed 1 year",
        ));
    }
    Ok(())
}
