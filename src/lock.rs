//! A scoped reader/writer guard that can change mode in place.
//!
//! The facets guard their transport handles with a lock that is held shared
//! on the hot paths (send, counts) but must become exclusive around handle
//! mutation without being released in between: releasing and re-acquiring
//! would let another thread observe a half-changed handle. parking_lot's
//! upgradable read mode is the intent-to-upgrade token here: plain readers
//! run concurrently with it, a second would-be upgrader waits, and `upgrade`
//! blocks until the plain readers drain.

use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};

enum Mode<'a, T> {
    Shared(RwLockUpgradableReadGuard<'a, T>),
    Exclusive(RwLockWriteGuard<'a, T>),
}

/// Guard over a [`parking_lot::RwLock`] supporting in-place
/// promote/demote. Acquires in shared (upgradable) mode by default and
/// releases on scope exit; [`VariableLock::destroy`] releases early.
pub struct VariableLock<'a, T> {
    mode: Option<Mode<'a, T>>,
}

impl<'a, T> VariableLock<'a, T> {
    pub fn shared(lock: &'a RwLock<T>) -> Self {
        Self {
            mode: Some(Mode::Shared(lock.upgradable_read())),
        }
    }

    pub fn exclusive(lock: &'a RwLock<T>) -> Self {
        Self {
            mode: Some(Mode::Exclusive(lock.write())),
        }
    }

    /// Upgrade a shared guard to exclusive without releasing it. No-op when
    /// already exclusive or destroyed.
    pub fn promote(&mut self) {
        match self.mode.take() {
            Some(Mode::Shared(guard)) => {
                self.mode = Some(Mode::Exclusive(RwLockUpgradableReadGuard::upgrade(guard)));
            }
            other => self.mode = other,
        }
    }

    /// Downgrade an exclusive guard back to shared without releasing it.
    /// No-op when already shared or destroyed.
    pub fn demote(&mut self) {
        match self.mode.take() {
            Some(Mode::Exclusive(guard)) => {
                self.mode = Some(Mode::Shared(RwLockWriteGuard::downgrade_to_upgradable(
                    guard,
                )));
            }
            other => self.mode = other,
        }
    }

    /// Release the guard before scope exit.
    pub fn destroy(&mut self) {
        self.mode = None;
    }

    /// Read access in either mode. Panics after `destroy`: using a
    /// destroyed guard is a programming bug, not a runtime condition.
    pub fn get(&self) -> &T {
        match self.mode.as_ref().expect("lock used after destroy") {
            Mode::Shared(guard) => guard,
            Mode::Exclusive(guard) => guard,
        }
    }

    /// Write access. Panics unless the guard is currently exclusive.
    pub fn get_mut(&mut self) -> &mut T {
        match self.mode.as_mut().expect("lock used after destroy") {
            Mode::Exclusive(guard) => guard,
            Mode::Shared(_) => panic!("write access through a shared guard"),
        }
    }
}
