//! In-process event bus — ordered topics with consumer-group semantics.
//!
//! Records get a monotonic id per topic and are delivered at-least-once per
//! consumer group: a read makes records invisible to other consumers in the
//! same group for a visibility window; unacknowledged records are handed
//! out again after it elapses. Stream length is bounded with oldest-first
//! trimming, so consumers must keep up or lose history.
//!
//! This is the single-process implementation of [`tmi_core::bus::EventBus`].
//! A networked bus (e.g. Redis streams) slots in behind the same trait.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

use tmi_core::bus::{BusRecord, EventBus};
use tmi_core::error::BusError;

/// Bus with bounded per-topic retention.
pub struct InMemoryBus {
    max_len: usize,
    topics: Mutex<HashMap<String, TopicState>>,
    notify: Notify,
}

struct TopicState {
    next_id: u64,
    records: VecDeque<StoredRecord>,
    groups: HashMap<String, GroupState>,
}

struct StoredRecord {
    id: u64,
    record_type: String,
    payload: Value,
    emitted_at_ms: i64,
}

struct GroupState {
    /// Next unread record id for this group.
    cursor: u64,
    /// Delivered-but-unacked records and when they become visible again.
    pending: HashMap<u64, Instant>,
}

impl InMemoryBus {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            topics: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl TopicState {
    fn new() -> Self {
        Self {
            next_id: 1,
            records: VecDeque::new(),
            groups: HashMap::new(),
        }
    }

    fn record(&self, id: u64) -> Option<&StoredRecord> {
        // ids are dense and ordered; binary search by offset
        let first = self.records.front()?.id;
        let idx = id.checked_sub(first)? as usize;
        self.records.get(idx)
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        record_type: &str,
        payload: Value,
    ) -> Result<u64, BusError> {
        let id = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            let state = topics
                .entry(topic.to_string())
                .or_insert_with(TopicState::new);

            let id = state.next_id;
            state.next_id += 1;
            state.records.push_back(StoredRecord {
                id,
                record_type: record_type.to_string(),
                payload,
                emitted_at_ms: chrono::Utc::now().timestamp_millis(),
            });

            // Bounded retention: trim oldest first
            while state.records.len() > self.max_len {
                let dropped = state.records.pop_front();
                if let Some(dropped) = dropped {
                    for (group, gs) in state.groups.iter_mut() {
                        if gs.pending.remove(&dropped.id).is_some() || gs.cursor <= dropped.id {
                            warn!(
                                topic,
                                group,
                                record_id = dropped.id,
                                "Record trimmed before consumption; consumer lost history"
                            );
                        }
                        if gs.cursor <= dropped.id {
                            gs.cursor = dropped.id + 1;
                        }
                    }
                }
            }
            id
        };

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn read(
        &self,
        topic: &str,
        group: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<BusRecord>, BusError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = Instant::now();
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new);

        let oldest = state.records.front().map(|r| r.id).unwrap_or(state.next_id);
        let groups = &mut state.groups;
        let gs = groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState {
                cursor: oldest,
                pending: HashMap::new(),
            });

        let mut out: Vec<u64> = Vec::new();

        // Redeliver expired pending records first, oldest id first
        let mut expired: Vec<u64> = gs
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        for id in expired.into_iter().take(max) {
            gs.pending.insert(id, now + visibility);
            out.push(id);
        }

        // Then fresh records past the cursor
        while out.len() < max {
            let id = gs.cursor;
            if id >= state.next_id {
                break;
            }
            gs.cursor += 1;
            // Skip ids trimmed away before this group read them
            if id < oldest {
                continue;
            }
            gs.pending.insert(id, now + visibility);
            out.push(id);
        }

        let records = out
            .into_iter()
            .filter_map(|id| {
                let r = state.record(id)?;
                Some(BusRecord {
                    id: r.id,
                    record_type: r.record_type.clone(),
                    payload: r.payload.clone(),
                    emitted_at_ms: r.emitted_at_ms,
                })
            })
            .collect();
        Ok(records)
    }

    async fn ack(&self, topic: &str, group: &str, id: u64) -> Result<(), BusError> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let state = topics
            .get_mut(topic)
            .ok_or_else(|| BusError::UnknownGroup(format!("{topic}/{group}")))?;
        let gs = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BusError::UnknownGroup(format!("{topic}/{group}")))?;
        if gs.pending.remove(&id).is_none() {
            debug!(topic, group, id, "Ack for a record that is not pending");
            return Err(BusError::NotPending(id));
        }
        Ok(())
    }

    async fn wait(&self, _topic: &str, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    async fn len(&self, topic: &str) -> usize {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.get(topic).map(|t| t.records.len()).unwrap_or(0)
    }
}
