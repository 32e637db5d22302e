//! Progress percentage shown to pollers.

use crate::sync_job::SyncJobStatus;

/// Reported while running before the number of candidates is known.
pub const INDETERMINATE_PERCENT: u8 = 10;

/// Highest percentage reported before the job is observed `completed`.
pub const MAX_IN_FLIGHT_PERCENT: u8 = 99;

/// Derive a 0..=100 percentage from a job snapshot.
///
/// Only `completed` yields 100; a running job whose counters already reached
/// the total is capped at 99 until the status flips.
pub fn progress_percent(status: SyncJobStatus, processed: u32, total: Option<u32>) -> u8 {
    match status {
        SyncJobStatus::Completed => 100,
        SyncJobStatus::Pending => 0,
        SyncJobStatus::Running | SyncJobStatus::Failed => match total {
            None | Some(0) => INDETERMINATE_PERCENT,
            Some(total) => {
                let ratio = f64::from(processed) / f64::from(total) * 100.0;
                (ratio.round() as u8).min(MAX_IN_FLIGHT_PERCENT)
            }
        },
    }
}
