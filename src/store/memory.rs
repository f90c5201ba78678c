//! In-process fast store.
//!
//! Cache and queue sit behind a single mutex, which makes every operation
//! (including `insert_if_absent`) trivially atomic. Use it for single-process
//! deployments and tests; state is lost when the process exits.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::types::{Admission, AttendanceEvent, ParticipantId};

use super::AttendanceStore;

#[derive(Debug, Default)]
struct Inner {
    cache: HashMap<ParticipantId, AttendanceEvent>,
    queue: VecDeque<AttendanceEvent>,
    lease: Option<(String, Instant)>,
}

/// Fast store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

impl AttendanceStore for MemoryStore {
    fn get(&self, participant_id: &ParticipantId) -> Result<Option<AttendanceEvent>> {
        Ok(self.lock()?.cache.get(participant_id).cloned())
    }

    fn put(&self, event: &AttendanceEvent) -> Result<()> {
        self.lock()?
            .cache
            .insert(event.participant_id.clone(), event.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.lock()?.cache.clear();
        Ok(())
    }

    fn replace_all(&self, events: Vec<AttendanceEvent>) -> Result<()> {
        let fresh: HashMap<_, _> = events
            .into_iter()
            .map(|e| (e.participant_id.clone(), e))
            .collect();
        self.lock()?.cache = fresh;
        Ok(())
    }

    fn cached_count(&self) -> Result<usize> {
        Ok(self.lock()?.cache.len())
    }

    fn entries(&self) -> Result<Vec<AttendanceEvent>> {
        Ok(self.lock()?.cache.values().cloned().collect())
    }

    fn push(&self, event: &AttendanceEvent) -> Result<()> {
        self.lock()?.queue.push_back(event.clone());
        Ok(())
    }

    fn drain_all(&self) -> Result<Vec<AttendanceEvent>> {
        Ok(self.lock()?.queue.drain(..).collect())
    }

    fn pending_len(&self) -> Result<usize> {
        Ok(self.lock()?.queue.len())
    }

    fn pending_entries(&self) -> Result<Vec<AttendanceEvent>> {
        Ok(self.lock()?.queue.iter().cloned().collect())
    }

    fn pending_find(&self, participant_id: &ParticipantId) -> Result<Option<AttendanceEvent>> {
        Ok(self
            .lock()?
            .queue
            .iter()
            .find(|e| &e.participant_id == participant_id)
            .cloned())
    }

    fn pending_remove(&self, participant_id: &ParticipantId) -> Result<bool> {
        let mut inner = self.lock()?;
        let before = inner.queue.len();
        inner.queue.retain(|e| &e.participant_id != participant_id);
        Ok(inner.queue.len() != before)
    }

    fn requeue_front(&self, events: Vec<AttendanceEvent>) -> Result<()> {
        let mut inner = self.lock()?;
        // The older event wins if its participant was queued again meanwhile.
        inner
            .queue
            .retain(|queued| !events.iter().any(|e| e.participant_id == queued.participant_id));
        for event in events.into_iter().rev() {
            inner.queue.push_front(event);
        }
        Ok(())
    }

    fn try_acquire_lease(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.lock()?;
        let now = Instant::now();

        let free = match &inner.lease {
            None => true,
            Some((held_by, until)) => held_by == owner || *until <= now,
        };
        if free {
            inner.lease = Some((owner.to_string(), now + ttl));
        }
        Ok(free)
    }

    fn release_lease(&self, owner: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.lease.as_ref().is_some_and(|(held_by, _)| held_by == owner) {
            inner.lease = None;
        }
        Ok(())
    }

    fn supports_insert_if_absent(&self) -> bool {
        true
    }

    fn insert_if_absent(&self, event: &AttendanceEvent) -> Result<Admission> {
        let mut inner = self.lock()?;

        if let Some(existing) = inner.cache.get(&event.participant_id) {
            return Ok(Admission::AlreadyPresent(existing.clone()));
        }

        let queued = inner
            .queue
            .iter()
            .find(|e| e.participant_id == event.participant_id)
            .cloned();
        if let Some(queued) = queued {
            inner
                .cache
                .insert(queued.participant_id.clone(), queued.clone());
            return Ok(Admission::AlreadyPresent(queued));
        }

        inner.queue.push_back(event.clone());
        inner
            .cache
            .insert(event.participant_id.clone(), event.clone());
        Ok(Admission::Admitted(event.clone()))
    }
}
