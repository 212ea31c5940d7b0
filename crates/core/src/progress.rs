//! Transfer speed and ETA math.

use crate::upload::ProgressUpdate;
use std::time::{Duration, Instant};

/// Measures a transfer from the moment it (re)started.
///
/// Speed only counts bytes sent since the meter was created, never bytes
/// acknowledged by an earlier session, so a resumed upload does not report
/// an inflated rate.
#[derive(Clone, Debug)]
pub struct TransferMeter {
    started: Instant,
    base_offset: u64,
    total: u64,
}

impl TransferMeter {
    /// Start measuring at `base_offset` out of `total` bytes.
    pub fn new(base_offset: u64, total: u64) -> Self {
        Self {
            started: Instant::now(),
            base_offset,
            total,
        }
    }

    /// Progress after the server acknowledged `offset` bytes.
    pub fn observe(&self, offset: u64) -> ProgressUpdate {
        compute_progress(
            offset,
            self.total,
            offset.saturating_sub(self.base_offset),
            self.started.elapsed(),
        )
    }
}

/// Compute percentage, speed and ETA.
///
/// `sent` is the number of bytes transferred during `elapsed`.
pub fn compute_progress(offset: u64, total: u64, sent: u64, elapsed: Duration) -> ProgressUpdate {
    let percentage = if total == 0 {
        100.0
    } else {
        (offset as f64 / total as f64 * 100.0).min(100.0)
    };

    let secs = elapsed.as_secs_f64();
    let speed = if secs > 0.0 { sent as f64 / secs } else { 0.0 };

    let remaining = total.saturating_sub(offset);
    let estimated_time_remaining = if remaining == 0 {
        0.0
    } else if speed > 0.0 {
        remaining as f64 / speed
    } else {
        f64::INFINITY
    };

    ProgressUpdate {
        bytes_uploaded: offset,
        bytes_total: total,
        percentage,
        speed,
        estimated_time_remaining,
    }
}
