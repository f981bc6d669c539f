//! Session registry consumed by a mapper.
//!
//! The registry tracks which sessions are attached to a slot, holds the slot's current job,
//! and carries the slot's active flag. [`NonceStorage`] is the default implementation.
use std::{fmt, sync::Arc};

use crate::{
    job::Job,
    session::{LoginRequest, Session},
};

mod nonce_storage;

pub use nonce_storage::{NonceStorage, NONCE_SLOTS};

pub trait SessionRegistry: Send + fmt::Debug {
    /// Admits a session. Returns false, with no side effect, when the registry is full.
    fn add(&mut self, session: &Arc<Session>, request: &LoginRequest) -> bool;

    fn remove(&mut self, session: &Session);

    fn is_active(&self) -> bool;

    /// True while at least one session is attached.
    fn is_used(&self) -> bool;

    fn is_valid_job_id(&self, id: &str) -> bool;

    fn job(&self) -> &Job;

    fn set_job(&mut self, job: Job);

    fn set_active(&mut self, active: bool);

    /// Drops the cached job and frees every slot not held by a live session.
    fn reset(&mut self);

    fn session_by_id(&self, id: u64) -> Option<Arc<Session>>;

    fn session_count(&self) -> usize;
}
