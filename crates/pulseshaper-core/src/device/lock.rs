//! One session per device

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared lock guarding a single device
///
/// Clones refer to the same lock. Every session against a device must hold
/// its guard while it may write.
#[derive(Debug, Clone)]
pub struct DeviceLock {
    name: Arc<str>,
    held: Arc<AtomicBool>,
}

impl DeviceLock {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Device this lock guards
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the lock, or `None` if another session holds it
    pub fn try_acquire(&self) -> Option<DeviceLockGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| {
                tracing::debug!(device = %self.name, "Device lock acquired");
                DeviceLockGuard { lock: self.clone() }
            })
    }

    /// Whether a session currently holds the device
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the device lock when dropped
#[derive(Debug)]
pub struct DeviceLockGuard {
    lock: DeviceLock,
}

impl Drop for DeviceLockGuard {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
        tracing::debug!(device = %self.lock.name, "Device lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let lock = DeviceLock::new("AWG");
        let other = lock.clone();

        let guard = lock.try_acquire().unwrap();
        assert!(other.try_acquire().is_none());
        assert!(other.is_held());

        drop(guard);
        assert!(!lock.is_held());
        assert!(other.try_acquire().is_some());
    }
}
