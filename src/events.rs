use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

use crate::bundle::BundleInfo;

/// Events emitted towards the outer transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum UpdaterEvent {
    Download { percent: u8, bundle: BundleInfo },
    UpdateAvailable { bundle: BundleInfo },
    NoNeedUpdate { bundle: BundleInfo },
    DownloadComplete { bundle: BundleInfo },
    DownloadFailed { version: String },
    BreakingAvailable { version: String },
    /// Legacy alias of `BreakingAvailable`, always emitted right after it.
    MajorAvailable { version: String },
    UpdateFailed { bundle: BundleInfo },
    AppReloaded {},
    AppReady { bundle: BundleInfo, status: String },
}

impl UpdaterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Download { .. } => "download",
            Self::UpdateAvailable { .. } => "updateAvailable",
            Self::NoNeedUpdate { .. } => "noNeedUpdate",
            Self::DownloadComplete { .. } => "downloadComplete",
            Self::DownloadFailed { .. } => "downloadFailed",
            Self::BreakingAvailable { .. } => "breakingAvailable",
            Self::MajorAvailable { .. } => "majorAvailable",
            Self::UpdateFailed { .. } => "updateFailed",
            Self::AppReloaded {} => "appReloaded",
            Self::AppReady { .. } => "appReady",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

impl OverflowPolicy {
    pub fn from_env(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "drop_newest" => Self::DropNewest,
            _ => Self::DropOldest,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EventBusStats {
    pub published: u64,
    pub consumed: u64,
    pub dropped: u64,
    pub depth: usize,
}

#[derive(Debug)]
struct EventQueue {
    queue: VecDeque<UpdaterEvent>,
    stats: EventBusStats,
}

/// Bounded queue of pending events, shared between the engine and its host.
#[derive(Debug)]
pub struct EventBus {
    inner: Mutex<EventQueue>,
    capacity: usize,
    overflow: OverflowPolicy,
}

impl EventBus {
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(EventQueue {
                queue: VecDeque::new(),
                stats: EventBusStats::default(),
            }),
            capacity: capacity.max(1),
            overflow,
        }
    }

    pub fn publish(&self, event: UpdaterEvent) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        if inner.queue.len() >= self.capacity {
            match self.overflow {
                OverflowPolicy::DropOldest => {
                    inner.queue.pop_front();
                    inner.stats.dropped += 1;
                }
                OverflowPolicy::DropNewest => {
                    inner.stats.dropped += 1;
                    inner.stats.depth = inner.queue.len();
                    return false;
                }
            }
        }

        tracing::debug!(event = event.name(), "updater event published");
        inner.queue.push_back(event);
        inner.stats.published += 1;
        inner.stats.depth = inner.queue.len();
        true
    }

    /// Publishes `breakingAvailable` followed by its legacy `majorAvailable` alias.
    pub fn publish_breaking(&self, version: &str) {
        self.publish(UpdaterEvent::BreakingAvailable {
            version: version.to_string(),
        });
        self.publish(UpdaterEvent::MajorAvailable {
            version: version.to_string(),
        });
    }

    pub fn consume(&self) -> Option<UpdaterEvent> {
        let mut inner = self.inner.lock().unwrap_or_else(|poison| poison.into_inner());
        let event = inner.queue.pop_front();
        if event.is_some() {
            inner.stats.consumed += 1;
        }
        inner.stats.depth = inner.queue.len();
        event
    }

    pub fn drain(&self) -> Vec<UpdaterEvent> {
        let mut drained = Vec::new();
        while let Some(event) = self.consume() {
            drained.push(event);
        }
        drained
    }

    pub fn stats(&self) -> EventBusStats {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .stats
            .clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100, OverflowPolicy::DropOldest)
    }
}
