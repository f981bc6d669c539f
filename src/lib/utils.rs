//! Shared helpers used across the splitter: the closure-locking [`Mutex`], the id and
//! sequence factories, shutdown signalling, and log formatting for slot lines.
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex as Mutex_, MutexGuard, PoisonError,
};

/// Thin wrapper around [`std::sync::Mutex`] that only hands out access through closures.
///
/// The lock is released as soon as the closure returns, so no guard can be held across an
/// `.await` point or leak out of a mapper callback.
#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized>(Mutex_<T>);

impl<T> Mutex<T> {
    pub fn new(v: T) -> Self {
        Mutex(Mutex_::new(v))
    }

    /// Runs `thunk` with exclusive access to the inner value.
    ///
    /// A poisoned lock is reported as an error instead of panicking. Never unwrap inside the
    /// closure; return the value and handle it outside.
    pub fn safe_lock<F, Ret>(&self, thunk: F) -> Result<Ret, PoisonError<MutexGuard<'_, T>>>
    where
        F: FnOnce(&mut T) -> Ret,
    {
        let mut lock = self.0.lock()?;
        let return_value = thunk(&mut *lock);
        drop(lock);
        Ok(return_value)
    }

    /// Like [`Mutex::safe_lock`] but recovers the inner value of a poisoned lock.
    ///
    /// Mapper state stays consistent between callbacks, so a panic in one callback does not
    /// make the data unusable for the next one.
    pub fn super_safe_lock<F, Ret>(&self, thunk: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret,
    {
        let mut lock = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        thunk(&mut *lock)
    }
}

/// Hands out increasing `u64` identifiers, starting at 1.
///
/// Used for session ids at the splitter level and for strategy ids inside a mapper.
#[derive(Debug, Default)]
pub struct IdFactory {
    state: u64,
}

impl IdFactory {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn next(&mut self) -> u64 {
        self.state += 1;
        self.state
    }
}

/// Lock-free source of upstream submission sequence numbers.
///
/// One factory is shared by every strategy of a mapper, so sequences handed to the ledger
/// are unique across the primary and the donation path.
#[derive(Debug, Default)]
pub struct SequenceFactory {
    next: AtomicU64,
}

impl SequenceFactory {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Messages used for coordinating shutdown across the splitter's tasks.
#[derive(Debug, Clone)]
pub enum ShutdownMessage {
    /// Shutdown every mapper and the scheduler loop.
    ShutdownAll,
}

/// Emphasizes `text` with the given ANSI style when colored output is enabled.
pub fn paint(colors: bool, style: &str, text: &str) -> String {
    if colors {
        format!("\x1B[{style}m{text}\x1B[0m")
    } else {
        text.to_string()
    }
}

pub const BOLD_WHITE: &str = "01;37";
pub const BOLD_CYAN: &str = "01;36";
pub const BOLD_MAGENTA: &str = "01;35";
pub const BOLD_GRAY: &str = "01;30";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_lock_releases_after_closure() {
        let m = Mutex::new(1u32);
        m.safe_lock(|i| *i += 1).unwrap();
        m.super_safe_lock(|i| *i = (*i).checked_add(1).unwrap_or_default());
        assert_eq!(m.super_safe_lock(|i| *i), 3);
    }

    #[test]
    fn test_sequence_factory_is_monotonic() {
        let factory = SequenceFactory::new();
        let first = factory.next();
        let second = factory.next();
        assert_eq!(first, 1);
        assert!(second > first);
    }

    #[test]
    fn test_paint_without_colors_is_plain() {
        assert_eq!(paint(false, BOLD_WHITE, "pool"), "pool");
        assert_eq!(paint(true, BOLD_WHITE, "pool"), "\x1B[01;37mpool\x1B[0m");
    }
}
