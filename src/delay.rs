use std::cmp::Ordering;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

const RUN_MARKER_FILE: &str = "run.marker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DelayConditionKind {
    Background,
    Kill,
    Date,
    NativeVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayCondition {
    pub kind: DelayConditionKind,
    #[serde(default)]
    pub value: Option<String>,
}

impl DelayCondition {
    pub fn new(kind: DelayConditionKind, value: Option<&str>) -> Self {
        Self {
            kind,
            value: value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string),
        }
    }
}

/// Evaluates queued-activation gating against observed host conditions.
#[derive(Debug, Clone)]
pub struct DelayGate {
    host_version: String,
    backgrounded_since: Option<Instant>,
    killed: bool,
}

impl DelayGate {
    /// `killed` only counts when a kill condition was stored at start-up.
    pub fn new(
        host_version: &str,
        startup_conditions: &[DelayCondition],
        previous_run_unclean: bool,
    ) -> Self {
        let kill_armed = startup_conditions
            .iter()
            .any(|condition| condition.kind == DelayConditionKind::Kill);
        Self {
            host_version: host_version.trim().to_string(),
            backgrounded_since: None,
            killed: kill_armed && previous_run_unclean,
        }
    }

    pub fn host_version(&self) -> &str {
        &self.host_version
    }

    pub fn killed(&self) -> bool {
        self.killed
    }

    pub fn backgrounded_since(&self) -> Option<Instant> {
        self.backgrounded_since
    }

    pub fn on_background(&mut self) {
        self.on_background_at(Instant::now());
    }

    pub fn on_background_at(&mut self, at: Instant) {
        if self.backgrounded_since.is_none() {
            self.backgrounded_since = Some(at);
        }
    }

    pub fn on_foreground(&mut self) {
        self.backgrounded_since = None;
    }

    pub fn is_satisfied(&self, conditions: &[DelayCondition]) -> bool {
        self.evaluate_at(conditions, Instant::now(), Utc::now())
    }

    pub fn evaluate_at(
        &self,
        conditions: &[DelayCondition],
        now: Instant,
        wall_clock: DateTime<Utc>,
    ) -> bool {
        conditions
            .iter()
            .all(|condition| self.condition_met(condition, now, wall_clock))
    }

    fn condition_met(
        &self,
        condition: &DelayCondition,
        now: Instant,
        wall_clock: DateTime<Utc>,
    ) -> bool {
        let value = condition.value.as_deref().map(str::trim);
        match condition.kind {
            DelayConditionKind::Background => {
                let Some(since) = self.backgrounded_since else {
                    return false;
                };
                let required = value
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .map(Duration::from_millis)
                    .unwrap_or(Duration::ZERO);
                now.saturating_duration_since(since) >= required
            }
            DelayConditionKind::Kill => self.killed,
            DelayConditionKind::Date => match value.and_then(parse_condition_date) {
                Some(at) => wall_clock >= at,
                None => true,
            },
            DelayConditionKind::NativeVersion => match value.filter(|raw| !raw.is_empty()) {
                Some(required) => {
                    compare_versions(&self.host_version, required) != Ordering::Less
                }
                None => true,
            },
        }
    }
}

/// Dotted numeric comparison; missing or unparsable components count as 0.
pub fn compare_versions(lhs: &str, rhs: &str) -> Ordering {
    let lhs = version_components(lhs);
    let rhs = version_components(rhs);
    let max_len = lhs.len().max(rhs.len());
    for idx in 0..max_len {
        let left = lhs.get(idx).copied().unwrap_or(0);
        let right = rhs.get(idx).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            non_eq => return non_eq,
        }
    }
    Ordering::Equal
}

fn version_components(raw: &str) -> Vec<u64> {
    let trimmed = raw.trim();
    let normalized = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    normalized
        .split('.')
        .map(|segment| segment.trim().parse::<u64>().unwrap_or(0))
        .collect()
}

fn parse_condition_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(parsed.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|date| date.and_utc())
}

/// Marker file present while a process is running; finding one at start-up
/// means the previous process never shut down cleanly.
#[derive(Debug)]
pub struct RunMarker {
    path: PathBuf,
}

impl RunMarker {
    pub fn acquire(data_dir: &Path) -> Result<(Self, bool)> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed creating {}", data_dir.display()))?;
        let path = data_dir.join(RUN_MARKER_FILE);
        let previous_run_unclean = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                write_marker_details(&mut file, &path)?;
                false
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let mut file = fs::File::create(&path)
                    .with_context(|| format!("failed rewriting run marker {}", path.display()))?;
                write_marker_details(&mut file, &path)?;
                true
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed creating run marker {}", path.display()));
            }
        };
        Ok((Self { path }, previous_run_unclean))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_marker_details(file: &mut fs::File, path: &Path) -> Result<()> {
    let details = format!(
        "pid={} started_at={}",
        std::process::id(),
        Utc::now().to_rfc3339()
    );
    file.write_all(details.as_bytes())
        .with_context(|| format!("failed writing run marker {}", path.display()))
}

impl Drop for RunMarker {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(marker = %self.path.display(), error = %err, "failed removing run marker");
            }
        }
    }
}
