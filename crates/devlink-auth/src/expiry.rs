//! Session expiry
//!
//! Expiry is a pure function of `(status, expires_at, now)`. Every read path
//! in [`LinkController`] and the background [`ExpirySweeper`] go through
//! [`evaluate`], so no caller sees a live session past its deadline.

use crate::lifecycle::LinkController;
use chrono::{DateTime, Utc};
use devlink_core::SessionStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Status a session should be observed in at `now`
pub fn evaluate(
    status: SessionStatus,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> SessionStatus {
    if is_due(status, expires_at, now) {
        SessionStatus::Expired
    } else {
        status
    }
}

/// Whether a session must be transitioned to `Expired`
pub fn is_due(status: SessionStatus, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    !status.is_terminal() && now > expires_at
}

/// Periodic proactive expiry
///
/// Not required for correctness (reads expire lazily) but it releases
/// credential records and live connections of abandoned sessions.
pub struct ExpirySweeper {
    controller: Arc<LinkController>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(controller: Arc<LinkController>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    /// Run one sweep, returning how many sessions were expired
    pub async fn run_once(&self) -> usize {
        match self.controller.sweep().await {
            Ok(count) => {
                if count > 0 {
                    info!("Expiry sweep expired {} session(s)", count);
                }
                count
            }
            Err(e) => {
                warn!("Expiry sweep failed: {}", e);
                0
            }
        }
    }

    /// Spawn the sweep loop on the current runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("Running expiry sweep");
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_pending_past_deadline_expires() {
        let now = Utc::now();
        let deadline = now - Duration::seconds(1);
        assert_eq!(
            evaluate(SessionStatus::Pending, deadline, now),
            SessionStatus::Expired
        );
        assert_eq!(
            evaluate(SessionStatus::Scanned, deadline, now),
            SessionStatus::Expired
        );
    }

    #[test]
    fn test_before_deadline_unchanged() {
        let now = Utc::now();
        let deadline = now + Duration::seconds(30);
        assert_eq!(
            evaluate(SessionStatus::Pending, deadline, now),
            SessionStatus::Pending
        );
        assert!(!is_due(SessionStatus::Scanned, deadline, now));
    }

    #[test]
    fn test_deadline_instant_is_not_expired() {
        let now = Utc::now();
        assert!(!is_due(SessionStatus::Pending, now, now));
    }

    #[test]
    fn test_terminal_states_never_expire() {
        let now = Utc::now();
        let deadline = now - Duration::hours(1);
        for status in [
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Expired,
        ] {
            assert_eq!(evaluate(status, deadline, now), status);
        }
    }
}
