//! Regional rotation scheduler.
//!
//! Owns the rotation schedule over the configured region set and decides when
//! the active subscription window changes. The schedule is built once at
//! construction: each region is expanded into `priority` slots, then the slot
//! list is uniformly shuffled so high-priority regions spread through the
//! cycle instead of clustering. The scheduler only emits events; applying a
//! region change to the stream client is the embedding process's job.
//!
//! Timer invariant: at most one rotation timer is armed at any time. Every
//! operation that changes the active region cancels the outstanding timer
//! before arming a new one, so a stale timer can never undo a manual override.

use std::sync::{Arc, Weak};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::models::{Region, SchedulerStatus};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Dwell time per region before auto-rotation advances.
    pub region_duration_ms: u64,
    pub auto_rotate: bool,
    /// Whether focusing on a location restarts the dwell timer from a full
    /// duration (true) or lets the outstanding deadline stand (false).
    pub reset_dwell_on_focus: bool,
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            region_duration_ms: 4 * 3600 * 1000,
            auto_rotate: true,
            reset_dwell_on_focus: true,
            event_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    RegionChange(Region),
    /// Emitted when the index wraps to slot 0, before that slot's
    /// `RegionChange`.
    CycleComplete,
    Stopped,
}

#[derive(Debug)]
struct SchedulerInner {
    current_index: usize,
    regions_completed: u64,
    running: bool,
    next_rotation_at: Option<DateTime<Utc>>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the timer is cancelled or re-armed; a firing timer
    /// whose epoch no longer matches is stale and must not rotate.
    timer_epoch: u64,
}

pub struct RegionalScheduler {
    config: SchedulerConfig,
    /// Unique region set in configured order; overlap ties resolve to the
    /// earliest entry.
    regions: Vec<Region>,
    /// Priority-expanded, shuffled slot list of indices into `regions`.
    schedule: Vec<usize>,
    inner: Mutex<SchedulerInner>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    /// Handed to timer tasks so a dropped scheduler never keeps one alive.
    weak_self: Weak<RegionalScheduler>,
}

/// Expand each region into `priority` slots, then apply a uniform random
/// permutation of the slot multiset.
fn build_schedule(regions: &[Region]) -> Vec<usize> {
    let total: usize = regions.iter().map(|r| usize::from(r.priority)).sum();
    let mut slots = Vec::with_capacity(total);
    for (idx, region) in regions.iter().enumerate() {
        for _ in 0..region.priority {
            slots.push(idx);
        }
    }
    slots.shuffle(&mut rand::thread_rng());
    slots
}

impl RegionalScheduler {
    /// Construct with an explicit region set. Configuration failures (empty
    /// set, invalid bounds, out-of-range priority) are rejected here, never
    /// discovered later during rotation.
    pub fn new(config: SchedulerConfig, regions: Vec<Region>) -> Result<Arc<Self>> {
        if regions.is_empty() {
            bail!("scheduler requires at least one region");
        }
        for r in &regions {
            if !r.bounds.is_valid() {
                bail!("region '{}' has invalid bounds", r.id);
            }
            if !(1..=3).contains(&r.priority) {
                bail!("region '{}' priority must be 1..=3, got {}", r.id, r.priority);
            }
        }

        let schedule = build_schedule(&regions);
        let (event_tx, _) = broadcast::channel(config.event_capacity);

        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            regions,
            schedule,
            inner: Mutex::new(SchedulerInner {
                current_index: 0,
                regions_completed: 0,
                running: false,
                next_rotation_at: None,
                timer: None,
                timer_epoch: 0,
            }),
            event_tx,
            weak_self: weak_self.clone(),
        }))
    }

    pub fn with_default_regions(config: SchedulerConfig) -> Result<Arc<Self>> {
        Self::new(config, super::regions::default_regions())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn current_region(&self) -> Region {
        let inner = self.inner.lock();
        self.regions[self.schedule[inner.current_index]].clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Mark the scheduler running. Unless `skip_initial_emit` is set (used
    /// when the caller already applied the initial region before starting),
    /// emits an immediate `RegionChange` for the current slot.
    pub fn start(&self, skip_initial_emit: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.running {
                return;
            }
            inner.running = true;
        }
        info!(
            regions = self.regions.len(),
            slots = self.schedule.len(),
            auto_rotate = self.config.auto_rotate,
            "rotation scheduler started"
        );

        if !skip_initial_emit {
            let region = self.current_region();
            self.emit(SchedulerEvent::RegionChange(region));
        }
        if self.config.auto_rotate {
            self.arm_timer();
        }
    }

    /// Cancel any pending rotation and mark not-running. Idempotent; emits
    /// `Stopped` only when the scheduler was actually running.
    pub fn stop(&self) {
        let was_running = {
            let mut inner = self.inner.lock();
            let was = inner.running;
            inner.running = false;
            inner.next_rotation_at = None;
            inner.timer_epoch += 1;
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            was
        };
        if was_running {
            info!("rotation scheduler stopped");
            self.emit(SchedulerEvent::Stopped);
        }
    }

    /// Advance to the next schedule slot immediately.
    pub fn rotate_now(&self) {
        self.rotate(None);
    }

    /// Point the scheduler at the first configured region containing the
    /// coordinates. Returns `None` (state untouched) when no region matches.
    pub fn focus_on_location(&self, lat: f64, lon: f64) -> Option<Region> {
        let region_idx = self
            .regions
            .iter()
            .position(|r| r.bounds.contains(lat, lon))?;
        // Every region holds at least one slot, so this lookup always lands.
        let slot = self.schedule.iter().position(|&idx| idx == region_idx)?;

        let (region, rearm) = {
            let mut inner = self.inner.lock();
            if self.config.reset_dwell_on_focus {
                inner.timer_epoch += 1;
                if let Some(timer) = inner.timer.take() {
                    timer.abort();
                }
                inner.next_rotation_at = None;
            }
            inner.current_index = slot;
            let rearm =
                inner.running && self.config.auto_rotate && self.config.reset_dwell_on_focus;
            (self.regions[region_idx].clone(), rearm)
        };

        info!(region = %region.name, lat, lon, "focusing rotation on location");
        self.emit(SchedulerEvent::RegionChange(region.clone()));
        if rearm {
            self.arm_timer();
        }
        Some(region)
    }

    /// Pure read snapshot; no side effects.
    pub fn status(&self) -> SchedulerStatus {
        let inner = self.inner.lock();
        let len = self.schedule.len();
        let progress = ((inner.current_index as f64 / len as f64) * 100.0).round() as u32;
        SchedulerStatus {
            current_region: self.regions[self.schedule[inner.current_index]].clone(),
            next_region: self.regions[self.schedule[(inner.current_index + 1) % len]].clone(),
            next_rotation_at: inner.next_rotation_at,
            cycle_progress_pct: progress,
            regions_completed: inner.regions_completed,
            schedule_length: len,
        }
    }

    fn rotate(&self, expected_epoch: Option<u64>) {
        let (region, wrapped, rearm) = {
            let mut inner = self.inner.lock();
            if let Some(epoch) = expected_epoch {
                // Stale timer: something re-armed or stopped since it fired.
                if !inner.running || inner.timer_epoch != epoch {
                    return;
                }
            }
            inner.timer_epoch += 1;
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.next_rotation_at = None;
            inner.current_index = (inner.current_index + 1) % self.schedule.len();
            let wrapped = inner.current_index == 0;
            // Per-cycle counter: a wrap starts the next cycle at zero.
            inner.regions_completed = if wrapped {
                0
            } else {
                inner.regions_completed + 1
            };
            let rearm = inner.running && self.config.auto_rotate;
            (
                self.regions[self.schedule[inner.current_index]].clone(),
                wrapped,
                rearm,
            )
        };

        if wrapped {
            info!("rotation cycle complete");
            self.emit(SchedulerEvent::CycleComplete);
        }
        info!(region = %region.name, "rotating subscription window");
        self.emit(SchedulerEvent::RegionChange(region));
        if rearm {
            self.arm_timer();
        }
    }

    fn arm_timer(&self) {
        let duration = Duration::from_millis(self.config.region_duration_ms);
        let mut inner = self.inner.lock();
        // A stop() can land between a rotation's critical section and this
        // call; a stopped scheduler must never hold an armed timer.
        if !inner.running {
            return;
        }
        inner.timer_epoch += 1;
        let epoch = inner.timer_epoch;
        if let Some(old) = inner.timer.take() {
            old.abort();
        }
        inner.next_rotation_at =
            Some(Utc::now() + chrono::Duration::milliseconds(self.config.region_duration_ms as i64));

        let scheduler = self.weak_self.clone();
        inner.timer = Some(tokio::spawn(async move {
            sleep(duration).await;
            if let Some(scheduler) = scheduler.upgrade() {
                debug!("rotation timer fired");
                scheduler.rotate(Some(epoch));
            }
        }));
    }
}

impl Drop for RegionalScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
        }
    }
}
