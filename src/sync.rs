// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error_::{Error, Result};

/// A read-mostly lock: readers check a condition under the shared lock and
/// only one of them gets promoted to run the update when the condition calls
/// for it; everyone else re-reads once the update finished.
///
/// This is what coalesces concurrent routing-table refreshes (and pool-map
/// insertions) into a single in-flight computation whose outcome all callers
/// observe.
#[derive(Debug)]
pub(crate) struct MostlyRLock<T: Debug> {
    inner: RwLock<T>,
    updating: AtomicBool,
}

#[allow(dead_code)] // unused methods for symetry between read and write ops
impl<T: Debug> MostlyRLock<T> {
    pub(crate) fn new(inner: T) -> Self {
        let inner = RwLock::new(inner);
        Self {
            inner,
            updating: AtomicBool::new(false),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<T> {
        self.inner.read()
    }

    pub(crate) fn try_read_until(
        &self,
        deadline: Option<Instant>,
        during: &'static str,
    ) -> Result<RwLockReadGuard<T>> {
        let Some(deadline) = deadline else {
            return Ok(self.read());
        };
        match self.inner.try_read_until(deadline) {
            Some(r_lock) => Ok(r_lock),
            None => Err(Error::connection_acquisition_timeout(during)),
        }
    }

    pub(crate) fn update<'a, UPDATE: FnMut(RwLockWriteGuard<'a, T>) -> Result<()>>(
        &'a self,
        mut updater: UPDATE,
    ) -> Result<RwLockReadGuard<'a, T>> {
        let done = RefCell::new(false);
        self.maybe_write(
            {
                let done = &done;
                |_| !*done.borrow()
            },
            {
                let done = &done;
                |lock| {
                    *done.borrow_mut() = true;
                    updater(lock)
                }
            },
        )
    }

    pub(crate) fn maybe_write<
        'a,
        CHECK: FnMut(&RwLockReadGuard<'a, T>) -> bool,
        UPDATE: FnMut(RwLockWriteGuard<'a, T>) -> Result<()>,
    >(
        &'a self,
        mut needs_update: CHECK,
        mut updater: UPDATE,
    ) -> Result<RwLockReadGuard<'a, T>> {
        loop {
            {
                let r_lock = self.inner.read();
                if !needs_update(&r_lock) {
                    return Ok(r_lock);
                }
                // avoid drowning the writer
                RwLockReadGuard::unlock_fair(r_lock);
            }
            let already_updating = self.updating.swap(true, Ordering::SeqCst);
            if !already_updating {
                let w_lock = self.inner.write();
                self.updating.store(false, Ordering::SeqCst);
                updater(w_lock)?;
                return Ok(self.inner.read());
            }
        }
    }

    pub(crate) fn try_maybe_write_until<
        'a,
        CHECK: FnMut(&RwLockReadGuard<'a, T>) -> bool,
        UPDATE: FnMut(RwLockWriteGuard<'a, T>) -> Result<()>,
    >(
        &'a self,
        deadline: Option<Instant>,
        during: &'static str,
        mut needs_update: CHECK,
        mut updater: UPDATE,
    ) -> Result<RwLockReadGuard<'a, T>> {
        let Some(deadline) = deadline else {
            return self.maybe_write(needs_update, updater);
        };
        loop {
            {
                let Some(r_lock) = self.inner.try_read_until(deadline) else {
                    return Err(Error::connection_acquisition_timeout(during));
                };
                if !needs_update(&r_lock) {
                    return Ok(r_lock);
                }
                // avoid drowning the writer
                RwLockReadGuard::unlock_fair(r_lock);
            }
            let already_updating = self.updating.swap(true, Ordering::SeqCst);
            if !already_updating {
                let maybe_w_lock = self.inner.try_write_until(deadline);
                self.updating.store(false, Ordering::SeqCst);
                let Some(w_lock) = maybe_w_lock else {
                    return Err(Error::connection_acquisition_timeout(during));
                };
                updater(w_lock)?;
                return Ok(self.inner.read());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maybe_write_skips_update_when_fresh() {
        let lock = MostlyRLock::new(1usize);
        let guard = lock
            .maybe_write(
                |v| **v == 0,
                |mut v| {
                    *v += 1;
                    Ok(())
                },
            )
            .expect("updater is infallible");
        assert_eq!(*guard, 1);
    }

    #[test]
    fn test_maybe_write_runs_update_once() {
        let lock = MostlyRLock::new(0usize);
        let guard = lock
            .maybe_write(
                |v| **v == 0,
                |mut v| {
                    *v += 1;
                    Ok(())
                },
            )
            .expect("updater is infallible");
        assert_eq!(*guard, 1);
    }

    #[test]
    fn test_update_always_runs() {
        let lock = MostlyRLock::new(41usize);
        let guard = lock
            .update(|mut v| {
                *v += 1;
                Ok(())
            })
            .expect("updater is infallible");
        assert_eq!(*guard, 42);
    }
}
