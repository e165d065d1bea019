//! Priority Admission (spec.md §4.7): an in-memory ordered structure used
//! between the Stream Consumer and the Router when priority processing is
//! configured. Higher numeric priority dequeues first; within equal
//! priority, FIFO by enqueue order. Entries that have aged past `max_age`
//! or been passed over at least `starvation_threshold` times are promoted
//! to the head of their next dequeue, so no entry waits forever behind a
//! steady stream of higher-priority arrivals.
//!
//! Admission is optional (spec.md §4.7's closing sentence): when a
//! pipeline doesn't configure it, frames flow directly from the consumer
//! to the router and this crate is unused.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use frame_config::AdmissionConfig;
use frame_metrics::Metrics;
use frame_systemtime::unix_time_as_millis;
use frame_types::FrameEvent;
use parking_lot::Mutex;
use tokio::sync::Notify;

use frame_logger::info_target;

const LOG_TARGET: &str = "frame_admission";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionParams {
    /// Default 60s (spec.md §4.7).
    pub max_age_ms: u64,
    /// Default 10 (spec.md §4.7).
    pub starvation_threshold: u32,
}

impl Default for AdmissionParams {
    fn default() -> Self {
        AdmissionParams {
            max_age_ms: 60_000,
            starvation_threshold: 10,
        }
    }
}

impl From<&AdmissionConfig> for AdmissionParams {
    fn from(cfg: &AdmissionConfig) -> Self {
        AdmissionParams {
            max_age_ms: cfg.max_age_secs * 1_000,
            starvation_threshold: cfg.starvation_threshold,
        }
    }
}

struct Entry {
    frame: FrameEvent,
    priority: u8,
    seq: u64,
    enqueued_at_ms: u64,
    overtaken: u32,
}

/// Size, per-priority distribution, oldest-age (spec.md §4.7 "Metrics").
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdmissionStats {
    pub size: usize,
    pub per_priority: BTreeMap<u8, usize>,
    pub oldest_age_ms: Option<u64>,
}

struct State {
    entries: Vec<Entry>,
}

impl State {
    /// Picks the next entry to dequeue: a starved entry (age or overtake
    /// count past its threshold) if one exists, picking the oldest among
    /// those by `seq`; otherwise the highest-priority entry, FIFO among
    /// ties.
    fn pop_next(&mut self, params: &AdmissionParams, now_ms: u64) -> Option<Entry> {
        if self.entries.is_empty() {
            return None;
        }

        let starved_idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                now_ms.saturating_sub(e.enqueued_at_ms) >= params.max_age_ms
                    || e.overtaken >= params.starvation_threshold
            })
            .min_by_key(|(_, e)| e.seq)
            .map(|(idx, _)| idx);

        let chosen_idx = starved_idx.unwrap_or_else(|| {
            self.entries
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
                .map(|(idx, _)| idx)
                .expect("entries is non-empty")
        });

        let chosen = self.entries.swap_remove(chosen_idx);
        for entry in &mut self.entries {
            entry.overtaken += 1;
        }
        Some(chosen)
    }

    fn stats(&self, now_ms: u64) -> AdmissionStats {
        let mut per_priority = BTreeMap::new();
        let mut oldest_age_ms = None;
        for entry in &self.entries {
            *per_priority.entry(entry.priority).or_insert(0) += 1;
            let age = now_ms.saturating_sub(entry.enqueued_at_ms);
            oldest_age_ms = Some(oldest_age_ms.map_or(age, |o: u64| o.max(age)));
        }
        AdmissionStats {
            size: self.entries.len(),
            per_priority,
            oldest_age_ms,
        }
    }
}

/// The priority admission queue. Cheap to clone (internally `Arc`-backed);
/// every clone shares the same waiting entries and wakes every concurrent
/// dequeuer fairly as entries become available.
#[derive(Clone)]
pub struct PriorityAdmission {
    params: AdmissionParams,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    next_seq: Arc<AtomicU64>,
    metrics: Arc<dyn Metrics>,
}

impl PriorityAdmission {
    pub fn new(params: AdmissionParams, metrics: Arc<dyn Metrics>) -> Self {
        PriorityAdmission {
            params,
            state: Arc::new(Mutex::new(State { entries: Vec::new() })),
            notify: Arc::new(Notify::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
            metrics,
        }
    }

    /// Admits `frame`, ordered by [`FrameEvent::priority`], and wakes one
    /// waiting dequeuer if any is suspended.
    pub fn enqueue(&self, frame: FrameEvent) {
        let priority = frame.priority();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            frame,
            priority,
            seq,
            enqueued_at_ms: unix_time_as_millis(),
            overtaken: 0,
        };
        let size = {
            let mut state = self.state.lock();
            state.entries.push(entry);
            state.entries.len()
        };
        self.metrics.admission_queue_size_set(size as i64);
        self.notify.notify_one();
    }

    /// Suspends until an entry is available, then returns the next one per
    /// the priority/starvation ordering. Multiple concurrent callers each
    /// receive a distinct element.
    pub async fn dequeue(&self) -> FrameEvent {
        loop {
            // Registering interest before checking state is what makes this
            // race-free: a concurrent `enqueue` that calls `notify_one`
            // between our check and the `.await` below still wakes us,
            // because the listener was already registered.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(entry) = state.pop_next(&self.params, unix_time_as_millis()) {
                    let size = state.entries.len();
                    drop(state);
                    self.metrics.admission_queue_size_set(size as i64);
                    if entry.overtaken >= self.params.starvation_threshold {
                        info_target!(
                            LOG_TARGET,
                            "promoted frame {} after being overtaken {} times",
                            entry.frame.frame_id,
                            entry.overtaken
                        );
                    }
                    return entry.frame;
                }
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        self.state.lock().stats(unix_time_as_millis())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use frame_systemtime::faketime;
    use serde_json::Value;
    use std::collections::BTreeMap as Map;
    use std::time::Duration;

    fn frame_with_priority(id: &str, priority: u8) -> FrameEvent {
        let mut metadata = Map::new();
        metadata.insert("detection_type".to_string(), Value::String("face".to_string()));
        metadata.insert("priority".to_string(), Value::from(priority));
        FrameEvent {
            frame_id: id.to_string(),
            camera_id: "cam1".to_string(),
            timestamp: Utc::now(),
            size_bytes: 1024,
            width: 1920,
            height: 1080,
            format: "jpeg".to_string(),
            metadata,
            trace_context: "{}".to_string(),
            retry_count: 0,
        }
    }

    fn admission() -> PriorityAdmission {
        PriorityAdmission::new(AdmissionParams::default(), frame_metrics::noop())
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let q = admission();
        q.enqueue(frame_with_priority("low", 1));
        q.enqueue(frame_with_priority("high", 9));
        assert_eq!(q.dequeue().await.frame_id, "high");
        assert_eq!(q.dequeue().await.frame_id, "low");
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let q = admission();
        q.enqueue(frame_with_priority("a", 5));
        q.enqueue(frame_with_priority("b", 5));
        q.enqueue(frame_with_priority("c", 5));
        assert_eq!(q.dequeue().await.frame_id, "a");
        assert_eq!(q.dequeue().await.frame_id, "b");
        assert_eq!(q.dequeue().await.frame_id, "c");
    }

    #[tokio::test]
    async fn dequeue_suspends_until_an_entry_arrives() {
        let q = admission();
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.dequeue().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        q.enqueue(frame_with_priority("late", 0));
        let frame = handle.await.unwrap();
        assert_eq!(frame.frame_id, "late");
    }

    #[tokio::test]
    async fn starvation_guard_promotes_after_overtake_threshold() {
        let params = AdmissionParams {
            max_age_ms: u64::MAX,
            starvation_threshold: 2,
        };
        let q = PriorityAdmission::new(params, frame_metrics::noop());
        q.enqueue(frame_with_priority("starved", 0));
        // Two higher-priority arrivals overtake "starved" twice, crossing
        // the threshold on the third dequeue.
        q.enqueue(frame_with_priority("h1", 9));
        q.enqueue(frame_with_priority("h2", 9));
        q.enqueue(frame_with_priority("h3", 9));

        assert_eq!(q.dequeue().await.frame_id, "h1");
        assert_eq!(q.dequeue().await.frame_id, "h2");
        // "starved" has now been overtaken twice and is promoted ahead of h3.
        assert_eq!(q.dequeue().await.frame_id, "starved");
        assert_eq!(q.dequeue().await.frame_id, "h3");
    }

    #[tokio::test]
    async fn starvation_guard_promotes_after_max_age() {
        let _faketime = faketime();
        _faketime.set_faketime(1_000_000);
        let params = AdmissionParams {
            max_age_ms: 50,
            starvation_threshold: u32::MAX,
        };
        let q = PriorityAdmission::new(params, frame_metrics::noop());
        q.enqueue(frame_with_priority("old", 0));
        _faketime.set_faketime(1_000_060);
        q.enqueue(frame_with_priority("new", 9));

        assert_eq!(q.dequeue().await.frame_id, "old");
    }

    #[tokio::test]
    async fn stats_report_size_per_priority_and_oldest_age() {
        let _faketime = faketime();
        _faketime.set_faketime(1_000_000);
        let q = admission();
        q.enqueue(frame_with_priority("a", 3));
        _faketime.set_faketime(1_000_500);
        q.enqueue(frame_with_priority("b", 3));
        q.enqueue(frame_with_priority("c", 7));

        let stats = q.stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.per_priority.get(&3), Some(&2));
        assert_eq!(stats.per_priority.get(&7), Some(&1));
        assert_eq!(stats.oldest_age_ms, Some(500));
    }
}
