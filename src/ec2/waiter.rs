//! Generic polling for cloud state transitions.
//!
//! Every wait in the driver goes through [`poll_until`]: a predicate, an
//! interval schedule and a hard cap. The caps differ per target state, so
//! each wait kind gets a named schedule instead of a bespoke loop.

use std::future::Future;

use tokio::time::{sleep, Duration, Instant};

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    /// Delay before the second poll; the first poll fires immediately.
    pub initial: Duration,
    /// Interval growth is doubled up to this bound.
    pub max_interval: Duration,
    /// Hard cap on the whole wait.
    pub timeout: Duration,
}

/// Attach/detach settle within minutes.
pub const ATTACHMENT: PollSchedule = PollSchedule {
    initial: Duration::from_secs(1),
    max_interval: Duration::from_secs(5),
    timeout: Duration::from_secs(180),
};

/// A created volume becomes available quickly.
pub const CREATE: PollSchedule = PollSchedule {
    initial: Duration::from_secs(1),
    max_interval: Duration::from_secs(5),
    timeout: Duration::from_secs(30),
};

/// Snapshots of large volumes take tens of minutes.
pub const SNAPSHOT: PollSchedule = PollSchedule {
    initial: Duration::from_secs(5),
    max_interval: Duration::from_secs(30),
    timeout: Duration::from_secs(30 * 60),
};

/// Modify-volume reaches `optimizing` well before it completes.
pub const MODIFY: PollSchedule = PollSchedule {
    initial: Duration::from_secs(2),
    max_interval: Duration::from_secs(10),
    timeout: Duration::from_secs(5 * 60),
};

/// Block hydration from a snapshot is the slowest wait the driver honors.
pub const INITIALIZATION: PollSchedule = PollSchedule {
    initial: Duration::from_secs(5),
    max_interval: Duration::from_secs(30),
    timeout: Duration::from_secs(30 * 60),
};

/// Fast-snapshot-restore enablement per zone.
pub const FAST_RESTORE: PollSchedule = PollSchedule {
    initial: Duration::from_secs(5),
    max_interval: Duration::from_secs(30),
    timeout: Duration::from_secs(10 * 60),
};

/// Polls "check" until it yields a value, sleeping per the schedule. The
/// enclosing request context cancels the wait by dropping the future;
/// exceeding the cap yields `DeadlineExceeded`.
pub async fn poll_until<T, F, Fut>(
    schedule: PollSchedule,
    what: &str,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    let mut interval = schedule.initial;

    loop {
        if let Some(v) = check().await? {
            return Ok(v);
        }

        let elapsed = start.elapsed();
        if elapsed + interval > schedule.timeout {
            return Err(Error::DeadlineExceeded {
                message: format!("'{}' did not settle within {:?}", what, schedule.timeout),
            });
        }

        log::debug!("poll '{}' pending (elapsed {:?})", what, elapsed);
        sleep(interval).await;
        interval = (interval * 2).min(schedule.max_interval);
    }
}
