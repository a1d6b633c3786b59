use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::trace;

const MIN_REPEAT_PERIOD: Duration = Duration::from_millis(1);

/// Named one-shot and repeating timers backed by Tokio tasks.
///
/// Starting a timer under an id that is already active replaces the previous
/// timer. A one-shot timer is removed from the table before its callback runs,
/// so the callback observes itself as inactive and may restart the same id.
#[derive(Debug, Clone, Default)]
pub struct TimerPool {
    table: Arc<Mutex<TimerTable>>,
}

#[derive(Debug, Default)]
struct TimerTable {
    next_generation: u64,
    timers: HashMap<String, ActiveTimer>,
}

#[derive(Debug)]
struct ActiveTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl TimerPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a timer. Must be called from within a Tokio runtime.
    pub fn start_timer<F>(&self, id: impl Into<String>, delay: Duration, repeats: bool, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = id.into();
        let mut table = self.table.lock();
        table.next_generation += 1;
        let generation = table.next_generation;
        let weak_table = Arc::downgrade(&self.table);
        let task_id = id.clone();

        trace!(timer = %id, ?delay, repeats, "starting timer");
        let handle = if repeats {
            tokio::spawn(async move {
                let period = delay.max(MIN_REPEAT_PERIOD);
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if !is_current(&weak_table, &task_id, generation) {
                        break;
                    }
                    callback();
                }
            })
        } else {
            tokio::spawn(async move {
                sleep(delay).await;
                if take_if_current(&weak_table, &task_id, generation) {
                    callback();
                }
            })
        };

        if let Some(previous) = table.timers.insert(id, ActiveTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancels a timer. Returns whether a timer was active under `id`.
    pub fn cancel_timer(&self, id: &str) -> bool {
        let removed = self.table.lock().timers.remove(id);
        match removed {
            Some(timer) => {
                trace!(timer = %id, "cancelled timer");
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every timer whose id starts with `prefix`.
    pub fn cancel_timers_with_prefix(&self, prefix: &str) -> usize {
        let mut table = self.table.lock();
        let ids: Vec<String> = table
            .timers
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect();
        for id in &ids {
            if let Some(timer) = table.timers.remove(id) {
                timer.handle.abort();
            }
        }
        ids.len()
    }

    /// Returns whether a timer is active under `id`.
    #[must_use]
    pub fn find_active_timer(&self, id: &str) -> bool {
        self.table.lock().timers.contains_key(id)
    }

    pub fn cancel_all(&self) {
        let timers: Vec<ActiveTimer> = self
            .table
            .lock()
            .timers
            .drain()
            .map(|(_, timer)| timer)
            .collect();
        for timer in timers {
            timer.handle.abort();
        }
    }
}

fn is_current(table: &Weak<Mutex<TimerTable>>, id: &str, generation: u64) -> bool {
    table.upgrade().is_some_and(|table| {
        table
            .lock()
            .timers
            .get(id)
            .is_some_and(|timer| timer.generation == generation)
    })
}

fn take_if_current(table: &Weak<Mutex<TimerTable>>, id: &str, generation: u64) -> bool {
    let Some(table) = table.upgrade() else {
        return false;
    };
    let mut table = table.lock();
    if table
        .timers
        .get(id)
        .is_some_and(|timer| timer.generation == generation)
    {
        table.timers.remove(id);
        true
    } else {
        false
    }
}
