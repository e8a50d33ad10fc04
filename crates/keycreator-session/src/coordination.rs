//! Who may talk to the reader right now.
//!
//! The provisioning loop and the maintenance routines share one serial link.
//! A maintenance routine claims the link by switching the shared activity
//! from `Idle` to `Formatting` or `Reading`, gives the loop a grace period to
//! finish its current poll, and hands the link back when its guard drops.
//! The loop checks the activity before every poll and parks while it is not
//! `Idle`.

use keycreator_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Current owner of the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    /// The provisioning loop may poll.
    Idle,
    Formatting,
    Reading,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Formatting => write!(f, "Formatting"),
            Self::Reading => write!(f, "Reading"),
        }
    }
}

/// Shared activity flag with wait/notify.
#[derive(Debug, Clone)]
pub struct Coordination {
    state: Arc<watch::Sender<Activity>>,
}

impl Coordination {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Activity::Idle);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn current(&self) -> Activity {
        *self.state.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.current() == Activity::Idle
    }

    /// Resolve once nobody holds the reader.
    pub async fn wait_idle(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        rx.wait_for(|activity| *activity == Activity::Idle)
            .await
            .map(|_| ())
            .map_err(|_| Error::Cancelled)
    }

    /// Like [`wait_idle`](Self::wait_idle), giving up after `limit`.
    ///
    /// Returns whether the reader became idle.
    pub async fn wait_idle_for(&self, limit: Duration) -> Result<bool> {
        match tokio::time::timeout(limit, self.wait_idle()).await {
            Ok(result) => result.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// Claim the reader for `activity`.
    ///
    /// Waits for a running maintenance routine to finish first, then for
    /// `grace` so the provisioning loop can finish the command it is in.
    pub async fn acquire(&self, activity: Activity, grace: Duration) -> Result<MaintenanceGuard> {
        loop {
            let claimed = self.state.send_if_modified(|current| {
                if *current == Activity::Idle {
                    *current = activity;
                    true
                } else {
                    false
                }
            });
            if claimed {
                break;
            }
            debug!(activity = %activity, holder = %self.current(), "Reader busy, waiting");
            self.wait_idle().await?;
        }

        info!(activity = %activity, "Reader claimed");
        tokio::time::sleep(grace).await;
        Ok(MaintenanceGuard {
            coordination: self.clone(),
            activity,
        })
    }

    fn release(&self, activity: Activity) {
        self.state.send_if_modified(|current| {
            if *current == activity {
                *current = Activity::Idle;
                true
            } else {
                false
            }
        });
        info!(activity = %activity, "Reader released");
    }
}

impl Default for Coordination {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the reader for a maintenance routine. Dropping it releases the
/// reader and wakes the provisioning loop.
#[derive(Debug)]
pub struct MaintenanceGuard {
    coordination: Coordination,
    activity: Activity,
}

impl MaintenanceGuard {
    pub fn activity(&self) -> Activity {
        self.activity
    }
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        self.coordination.release(self.activity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let coordination = Coordination::new();
        let guard = coordination
            .acquire(Activity::Formatting, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(coordination.current(), Activity::Formatting);
        assert_eq!(guard.activity(), Activity::Formatting);

        drop(guard);
        assert!(coordination.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_waits_for_release() {
        let coordination = Coordination::new();
        let guard = coordination
            .acquire(Activity::Reading, Duration::from_millis(300))
            .await
            .unwrap();

        assert!(!coordination.wait_idle_for(Duration::from_millis(50)).await.unwrap());

        let waiter = coordination.clone();
        let (idle, ()) = tokio::join!(waiter.wait_idle(), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(guard);
        });
        idle.unwrap();
        assert!(coordination.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_routine_queues_behind_first() {
        let coordination = Coordination::new();
        let first = coordination
            .acquire(Activity::Formatting, Duration::ZERO)
            .await
            .unwrap();

        let other = coordination.clone();
        let (second, ()) = tokio::join!(
            async move { other.acquire(Activity::Reading, Duration::ZERO).await },
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(first);
            }
        );

        let second = second.unwrap();
        assert_eq!(coordination.current(), Activity::Reading);
        drop(second);
        assert!(coordination.is_idle());
    }
}
