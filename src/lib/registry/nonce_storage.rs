use std::{collections::HashMap, sync::Arc};

use tracing::debug;

use super::SessionRegistry;
use crate::{
    job::Job,
    session::{LoginRequest, Session},
};

/// Number of sessions one slot can serve, one per value of the fixed nonce byte.
pub const NONCE_SLOTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Live(u64),
    /// Released during the current job. Its nonce range may still carry shares of the old
    /// session, so it stays unusable until the next job arrives.
    Dead,
}

/// Registry that hands every attached session its own fixed nonce byte.
#[derive(Debug)]
pub struct NonceStorage {
    active: bool,
    job: Job,
    slots: Vec<Slot>,
    sessions: HashMap<u64, Arc<Session>>,
    /// Where the search for the next free slot starts.
    index: usize,
}

impl Default for NonceStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceStorage {
    pub fn new() -> Self {
        Self {
            active: false,
            job: Job::default(),
            slots: vec![Slot::Free; NONCE_SLOTS],
            sessions: HashMap::new(),
            index: 0,
        }
    }

    fn next_free_slot(&self) -> Option<usize> {
        (0..NONCE_SLOTS)
            .map(|offset| (self.index + offset) % NONCE_SLOTS)
            .find(|i| self.slots[*i] == Slot::Free)
    }

    fn free_dead_slots(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot == Slot::Dead {
                *slot = Slot::Free;
            }
        }
    }
}

impl SessionRegistry for NonceStorage {
    fn add(&mut self, session: &Arc<Session>, _request: &LoginRequest) -> bool {
        if self.sessions.contains_key(&session.id()) {
            return false;
        }

        let Some(index) = self.next_free_slot() else {
            debug!("Session {}: no free nonce slot", session.id());
            return false;
        };

        self.slots[index] = Slot::Live(session.id());
        self.index = (index + 1) % NONCE_SLOTS;
        session.set_nonce_slot(Some(index as u8));
        self.sessions.insert(session.id(), session.clone());

        if self.active && self.job.is_valid() {
            session.set_job(&self.job);
        }

        true
    }

    fn remove(&mut self, session: &Session) {
        if self.sessions.remove(&session.id()).is_none() {
            return;
        }

        if let Some(index) = session.nonce_slot() {
            if self.slots[index as usize] == Slot::Live(session.id()) {
                self.slots[index as usize] = Slot::Dead;
            }
        }
        session.set_nonce_slot(None);
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn is_used(&self) -> bool {
        !self.sessions.is_empty()
    }

    fn is_valid_job_id(&self, id: &str) -> bool {
        self.job.is_valid() && self.job.id == id
    }

    fn job(&self) -> &Job {
        &self.job
    }

    fn set_job(&mut self, job: Job) {
        self.free_dead_slots();
        self.job = job;

        for session in self.sessions.values() {
            session.set_job(&self.job);
        }
    }

    fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    fn reset(&mut self) {
        self.active = false;
        self.job = Job::default();
        self.free_dead_slots();
    }

    fn session_by_id(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).cloned()
    }

    fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
