use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::bundle::BundleInfo;
use crate::error::{BundleError, BundleResult};
use crate::lifecycle::RollbackReport;

const FATAL_EXIT_CODE: i32 = 70;

/// What the watchdog drives once a launch is confirmed or times out.
#[async_trait]
pub trait ReadinessTarget: Send + Sync {
    async fn confirm_ready(&self) -> BundleResult<BundleInfo>;
    async fn rollback(&self) -> BundleResult<RollbackReport>;
}

/// Invoked when a timed-out launch cannot be rolled back.
pub type FatalHandler = Arc<dyn Fn(&BundleError) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Armed { bundle_id: String },
    Confirmed { bundle_id: String },
    Expired { bundle_id: String },
}

struct TimerSlot {
    state: WatchdogState,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// One-shot readiness timer per activation. Confirmation and expiry race
/// under a single lock, so exactly one of them wins.
pub struct ReadinessWatchdog {
    target: Arc<dyn ReadinessTarget>,
    timeout: Duration,
    fatal: FatalHandler,
    slot: Arc<Mutex<TimerSlot>>,
}

impl ReadinessWatchdog {
    pub fn new(target: Arc<dyn ReadinessTarget>, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            fatal: Arc::new(exit_on_fatal),
            slot: Arc::new(Mutex::new(TimerSlot {
                state: WatchdogState::Idle,
                generation: 0,
                timer: None,
            })),
        }
    }

    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> WatchdogState {
        self.lock_slot().state.clone()
    }

    /// Starts the timer for a freshly activated bundle, replacing any
    /// outstanding one. Must be called from within a tokio runtime.
    pub fn arm(&self, bundle_id: &str) {
        let deadline = Instant::now() + self.timeout;
        let mut slot = self.lock_slot();
        if let Some(previous) = slot.timer.take() {
            previous.abort();
        }
        slot.generation += 1;
        slot.state = WatchdogState::Armed {
            bundle_id: bundle_id.to_string(),
        };

        let generation = slot.generation;
        let shared = Arc::clone(&self.slot);
        let target = Arc::clone(&self.target);
        let fatal = Arc::clone(&self.fatal);
        let timeout_ms = self.timeout.as_millis() as u64;
        slot.timer = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            let bundle_id = {
                let mut slot = shared.lock().unwrap_or_else(|poison| poison.into_inner());
                if slot.generation != generation {
                    return;
                }
                let WatchdogState::Armed { bundle_id } = slot.state.clone() else {
                    return;
                };
                slot.state = WatchdogState::Expired {
                    bundle_id: bundle_id.clone(),
                };
                slot.timer = None;
                bundle_id
            };

            warn!(bundle_id = %bundle_id, timeout_ms, "bundle never reported ready, rolling back");
            match target.rollback().await {
                Ok(report) => {
                    info!(restored = %report.current.id, rolled_back = report.rolled_back, "readiness rollback finished");
                }
                Err(err) => fatal(&err),
            }
        }));
        info!(bundle_id = %bundle_id, timeout_ms, "readiness watchdog armed");
    }

    /// Reports the running bundle as healthy.
    ///
    /// Returns `None` when the watchdog already expired for this activation;
    /// a late confirmation never resurrects a rolled back bundle.
    pub async fn confirm(&self) -> BundleResult<Option<BundleInfo>> {
        {
            let mut slot = self.lock_slot();
            match slot.state.clone() {
                WatchdogState::Armed { bundle_id } => {
                    if let Some(timer) = slot.timer.take() {
                        timer.abort();
                    }
                    slot.state = WatchdogState::Confirmed { bundle_id };
                }
                WatchdogState::Expired { bundle_id } => {
                    warn!(bundle_id = %bundle_id, "ready signal arrived after rollback, ignoring");
                    return Ok(None);
                }
                WatchdogState::Idle | WatchdogState::Confirmed { .. } => {}
            }
        }
        self.target.confirm_ready().await.map(Some)
    }

    /// Cancels an outstanding timer without rolling back, used on shutdown.
    pub fn disarm(&self) {
        let mut slot = self.lock_slot();
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        slot.generation += 1;
        if matches!(slot.state, WatchdogState::Armed { .. }) {
            slot.state = WatchdogState::Idle;
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, TimerSlot> {
        self.slot.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Drop for ReadinessWatchdog {
    fn drop(&mut self) {
        if let Some(timer) = self.lock_slot().timer.take() {
            timer.abort();
        }
    }
}

fn exit_on_fatal(err: &BundleError) {
    error!(error = %err, kind = err.kind(), "rollback could not be persisted, terminating");
    std::process::exit(FATAL_EXIT_CODE);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{ReadinessTarget, ReadinessWatchdog, WatchdogState};
    use crate::bundle::BundleInfo;
    use crate::error::{BundleError, BundleResult};
    use crate::lifecycle::RollbackReport;

    #[derive(Default)]
    struct CountingTarget {
        confirms: AtomicUsize,
        rollbacks: AtomicUsize,
        fail_rollback: bool,
    }

    #[async_trait]
    impl ReadinessTarget for CountingTarget {
        async fn confirm_ready(&self) -> BundleResult<BundleInfo> {
            self.confirms.fetch_add(1, Ordering::SeqCst);
            Ok(BundleInfo::builtin())
        }

        async fn rollback(&self) -> BundleResult<RollbackReport> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            if self.fail_rollback {
                return Err(BundleError::io(
                    "disk full",
                    std::io::Error::from(std::io::ErrorKind::Other),
                ));
            }
            Ok(RollbackReport {
                rolled_back: true,
                failed: None,
                current: BundleInfo::builtin(),
            })
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_rolls_back_exactly_once_at_deadline() {
        let target = Arc::new(CountingTarget::default());
        let watchdog = ReadinessWatchdog::new(target.clone(), Duration::from_millis(10_000));
        watchdog.arm("abc");

        tokio::time::advance(Duration::from_millis(9_999)).await;
        settle().await;
        assert_eq!(target.rollbacks.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(target.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(
            watchdog.state(),
            WatchdogState::Expired {
                bundle_id: "abc".to_string()
            }
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(target.rollbacks.load(Ordering::SeqCst), 1);

        assert!(watchdog.confirm().await.expect("confirm").is_none());
        assert_eq!(target.confirms.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_before_deadline_cancels_rollback() {
        let target = Arc::new(CountingTarget::default());
        let watchdog = ReadinessWatchdog::new(target.clone(), Duration::from_millis(10_000));
        watchdog.arm("abc");

        tokio::time::advance(Duration::from_millis(5_000)).await;
        assert!(watchdog.confirm().await.expect("confirm").is_some());

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(target.rollbacks.load(Ordering::SeqCst), 0);
        assert_eq!(target.confirms.load(Ordering::SeqCst), 1);
        assert_eq!(
            watchdog.state(),
            WatchdogState::Confirmed {
                bundle_id: "abc".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_outstanding_timer() {
        let target = Arc::new(CountingTarget::default());
        let watchdog = ReadinessWatchdog::new(target.clone(), Duration::from_millis(1_000));
        watchdog.arm("first");
        tokio::time::advance(Duration::from_millis(600)).await;
        watchdog.arm("second");

        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(target.rollbacks.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(400)).await;
        settle().await;
        assert_eq!(target.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(
            watchdog.state(),
            WatchdogState::Expired {
                bundle_id: "second".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rollback_reaches_fatal_handler() {
        let target = Arc::new(CountingTarget {
            fail_rollback: true,
            ..CountingTarget::default()
        });
        let fatal_calls = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fatal_calls);
        let watchdog = ReadinessWatchdog::new(target.clone(), Duration::from_millis(100))
            .with_fatal_handler(Arc::new(move |err: &BundleError| {
                assert_eq!(err.kind(), "io_failure");
                observed.fetch_add(1, Ordering::SeqCst);
            }));
        watchdog.arm("abc");

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(fatal_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_stops_the_timer() {
        let target = Arc::new(CountingTarget::default());
        let watchdog = ReadinessWatchdog::new(target.clone(), Duration::from_millis(100));
        watchdog.arm("abc");
        watchdog.disarm();

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(target.rollbacks.load(Ordering::SeqCst), 0);
        assert_eq!(watchdog.state(), WatchdogState::Idle);
    }
}
