// Generic slow-walk scheduler over the fixed prefix partition.
//
// The storage keyspace splits into 1024 two-character prefixes; one slice
// processes one prefix, then control returns to the scheduler. State is
// persisted after every slice so a restart resumes at the next prefix, and
// shutdown is honored at slice boundaries where nothing is in flight.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info};

use holdfast_common::si::all_prefixes;

use crate::clock::Clock;
use crate::crawler::stats::CycleStats;

/// Wait this long after process start before the first slice.
pub const DEFAULT_SLOW_START_SECS: u64 = 300;
/// Longest allowed slow start.
const MAX_SLOW_START_SECS: u64 = 60 * 60;
/// A cycle may not start more often than this.
pub const DEFAULT_MINIMUM_CYCLE_TIME_SECS: u64 = 12 * 60 * 60;
/// Minimum allowed cycle-time floor.
const MIN_MINIMUM_CYCLE_TIME_SECS: u64 = 60;
/// Maximum allowed cycle-time floor.
const MAX_MINIMUM_CYCLE_TIME_SECS: u64 = 30 * 24 * 60 * 60;

const STATEFILE_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub slow_start: Duration,
    pub minimum_cycle_time: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            slow_start: Duration::from_secs(DEFAULT_SLOW_START_SECS),
            minimum_cycle_time: Duration::from_secs(DEFAULT_MINIMUM_CYCLE_TIME_SECS),
        }
    }
}

impl CrawlerConfig {
    /// Create a config from raw seconds, clamping the slow start to
    /// [0, 3600] and the cycle-time floor to [60, 2592000].
    pub fn with_secs(slow_start_secs: u64, minimum_cycle_time_secs: u64) -> Self {
        Self {
            slow_start: Duration::from_secs(slow_start_secs.min(MAX_SLOW_START_SECS)),
            minimum_cycle_time: Duration::from_secs(
                minimum_cycle_time_secs
                    .clamp(MIN_MINIMUM_CYCLE_TIME_SECS, MAX_MINIMUM_CYCLE_TIME_SECS),
            ),
        }
    }
}

/// Hook points a crawler specialization fills in.
pub trait CrawlerDelegate {
    fn started_cycle(&mut self, cycle: u64, state: &mut CrawlerState) -> Result<()>;

    fn process_prefix(
        &mut self,
        cycle: u64,
        prefix: &str,
        start_slice: i64,
        state: &mut CrawlerState,
    ) -> Result<()>;

    fn finished_cycle(&mut self, cycle: u64, state: &mut CrawlerState) -> Result<()>;
}

/// Crawler state persisted to the JSON statefile after every slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerState {
    pub version: u32,
    #[serde(rename = "last-complete-prefix-index")]
    pub last_complete_prefix_index: Option<usize>,
    #[serde(rename = "last-complete-bucket")]
    pub last_complete_bucket: Option<String>,
    #[serde(rename = "current-cycle")]
    pub current_cycle: Option<u64>,
    #[serde(rename = "current-cycle-start-time")]
    pub current_cycle_start_time: Option<i64>,
    #[serde(rename = "last-cycle-finished")]
    pub last_cycle_finished: Option<u64>,
    #[serde(rename = "cycle-to-date")]
    pub cycle_to_date: CycleStats,
}

impl Default for CrawlerState {
    fn default() -> Self {
        Self {
            version: STATEFILE_VERSION,
            last_complete_prefix_index: None,
            last_complete_bucket: None,
            current_cycle: None,
            current_cycle_start_time: None,
            last_cycle_finished: None,
            cycle_to_date: CycleStats::default(),
        }
    }
}

/// How far through the current cycle the crawler is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub cycle_in_progress: bool,
    /// Completed prefixes over total, in [0, 1].
    pub cycle_complete_fraction: f64,
}

pub struct ShareCrawler<D> {
    delegate: D,
    clock: Arc<dyn Clock>,
    config: CrawlerConfig,
    statefile: PathBuf,
    prefixes: Vec<String>,
    state: CrawlerState,
}

impl<D: CrawlerDelegate> ShareCrawler<D> {
    /// Build a crawler, resuming from the statefile when one exists.
    pub fn new(
        delegate: D,
        clock: Arc<dyn Clock>,
        config: CrawlerConfig,
        statefile: impl Into<PathBuf>,
    ) -> Result<Self> {
        let statefile = statefile.into();
        if let Some(parent) = statefile.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create statefile directory `{}`", parent.display())
            })?;
        }

        let state = match fs::read_to_string(&statefile) {
            Ok(contents) => serde_json::from_str(&contents).with_context(|| {
                format!("failed to parse crawler statefile `{}`", statefile.display())
            })?,
            Err(error) if error.kind() == io::ErrorKind::NotFound => CrawlerState::default(),
            Err(error) => {
                return Err(error).with_context(|| {
                    format!("failed to read crawler statefile `{}`", statefile.display())
                })
            }
        };

        Ok(Self { delegate, clock, config, statefile, prefixes: all_prefixes(), state })
    }

    pub fn state(&self) -> &CrawlerState {
        &self.state
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    pub fn progress(&self) -> Progress {
        Progress {
            cycle_in_progress: self.state.current_cycle.is_some(),
            cycle_complete_fraction: self.next_prefix_index() as f64 / self.prefixes.len() as f64,
        }
    }

    fn next_prefix_index(&self) -> usize {
        self.state.last_complete_prefix_index.map(|index| index + 1).unwrap_or(0)
    }

    /// Process the next prefix of the current cycle (starting a cycle if
    /// none is in progress) and persist state. Returns whether more slices
    /// remain before the cycle ends.
    pub fn run_one_slice(&mut self) -> Result<bool> {
        let index = self.next_prefix_index();
        if index >= self.prefixes.len() {
            return Ok(false);
        }

        let start_slice = self.clock.now();
        let cycle = self.ensure_cycle_started(start_slice)?;
        let prefix = self.prefixes[index].clone();
        debug!(cycle, %prefix, "processing prefix");
        self.delegate.process_prefix(cycle, &prefix, start_slice, &mut self.state)?;
        self.state.last_complete_prefix_index = Some(index);
        self.save_state()?;
        Ok(index + 1 < self.prefixes.len())
    }

    /// Run the delegate's cycle-end hook and reset for the next cycle.
    /// No-op when no cycle is in progress.
    pub fn finish_cycle(&mut self) -> Result<()> {
        let Some(cycle) = self.state.current_cycle else {
            return Ok(());
        };

        self.delegate.finished_cycle(cycle, &mut self.state)?;
        info!(cycle, "finished crawler cycle");
        self.state.last_cycle_finished = Some(cycle);
        self.state.current_cycle = None;
        self.state.current_cycle_start_time = None;
        self.state.last_complete_prefix_index = None;
        self.state.last_complete_bucket = None;
        self.save_state()
    }

    /// Every remaining slice of the current cycle, then the cycle-end hook.
    pub fn run_one_cycle(&mut self) -> Result<()> {
        while self.run_one_slice()? {}
        self.finish_cycle()
    }

    /// Scheduler loop: slow start, then cycles separated by the minimum
    /// cycle time, stopping at a slice boundary on shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if !self.config.slow_start.is_zero() {
            debug!(seconds = self.config.slow_start.as_secs(), "slow start before first cycle");
            tokio::select! {
                _ = tokio::time::sleep(self.config.slow_start) => {}
                _ = shutdown.recv() => return Ok(()),
            }
        }

        loop {
            let cycle_started = self.clock.now();
            loop {
                let more = self.run_one_slice()?;
                if shutdown_requested(&mut shutdown) {
                    info!("crawler stopping at slice boundary");
                    return Ok(());
                }
                if !more {
                    break;
                }
                // Hand control back to the scheduler between slices.
                tokio::task::yield_now().await;
            }
            self.finish_cycle()?;

            let elapsed = (self.clock.now() - cycle_started).max(0) as u64;
            let minimum = self.config.minimum_cycle_time.as_secs();
            if elapsed < minimum {
                let wait = Duration::from_secs(minimum - elapsed);
                debug!(wait_secs = wait.as_secs(), "sleeping until minimum cycle time elapses");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.recv() => return Ok(()),
                }
            }
        }
    }

    fn ensure_cycle_started(&mut self, now: i64) -> Result<u64> {
        if let Some(cycle) = self.state.current_cycle {
            return Ok(cycle);
        }

        let cycle = self.state.last_cycle_finished.map(|cycle| cycle + 1).unwrap_or(0);
        self.state.current_cycle = Some(cycle);
        self.state.current_cycle_start_time = Some(now);
        info!(cycle, "starting crawler cycle");
        self.delegate.started_cycle(cycle, &mut self.state)?;
        Ok(cycle)
    }

    fn save_state(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state)
            .context("failed to serialize crawler state")?;
        let tmp = self.statefile.with_extension("tmp");
        fs::write(&tmp, json).with_context(|| {
            format!("failed to write crawler statefile `{}`", tmp.display())
        })?;
        fs::rename(&tmp, &self.statefile).with_context(|| {
            format!("failed to replace crawler statefile `{}`", self.statefile.display())
        })?;
        Ok(())
    }
}

fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}
