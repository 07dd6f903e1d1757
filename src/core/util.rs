// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A value guarded by a [`Mutex`], with a [`Condvar`] to wait for changes.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a status holding the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Replaces the value and wakes up all waiters, unless the mutex is
    /// poisoned.
    pub fn try_notify_all(&self, t: T) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        *self.mutex.lock()? = t;
        self.condvar.notify_all();
        Ok(())
    }

    /// Replaces the value and wakes up all waiters.
    pub fn notify_all(&self, t: T) {
        *self.mutex.lock().unwrap() = t;
        self.condvar.notify_all();
    }

    /// Locks the status, runs `f` on it and notifies all waiting threads.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.mutex.lock().unwrap());
        self.condvar.notify_all();
    }

    /// Locks the status without waiting on the condition variable.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap()
    }

    /// Blocks while the predicate holds, and returns the locked value once it
    /// doesn't.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }
}

/// Names a family of types indexed by a lifetime, through a generic associated
/// type.
pub trait LifetimeParameterized {
    type T<'a>: ?Sized;
}

/// A reference to a `T<'a>` whose lifetime is erased while it is stored, and
/// chosen again by the reader in the `unsafe` function [`get()`](Self::get).
///
/// The controller uses this to hand a scheduler that borrows from the master
/// thread's stack to long-lived worker threads.
pub struct DynLifetimeView<T: LifetimeParameterized> {
    ptr: Option<NonNull<T::T<'static>>>,
}

impl<T: LifetimeParameterized> DynLifetimeView<T> {
    /// Creates a view that holds no reference.
    pub fn empty() -> Self {
        Self { ptr: None }
    }

    /// Stores the given reference. Readers calling [`get()`](Self::get) must not
    /// keep the result beyond the lifetime of `value`.
    // The cast is necessary because the lifetime is coerced to 'static.
    #[allow(clippy::unnecessary_cast)]
    pub fn set(&mut self, value: &T::T<'_>) {
        self.ptr = NonNull::new(NonNull::from(value).as_ptr() as *mut T::T<'static>);
    }

    /// Forgets the stored reference, so that [`get()`](Self::get) returns
    /// [`None`].
    pub fn clear(&mut self) {
        self.ptr = None;
    }

    /// Whether a reference is currently set.
    pub fn is_set(&self) -> bool {
        self.ptr.is_some()
    }

    /// Returns the stored reference with a lifetime chosen by the caller, or
    /// [`None`] if nothing is stored.
    ///
    /// # Safety
    ///
    /// The referenced value must stay alive and unmodified for as long as the
    /// returned reference is used.
    // The cast is necessary because the lifetime is coerced to 'a.
    #[allow(clippy::unnecessary_cast)]
    pub unsafe fn get<'a>(&self) -> Option<&'a T::T<'a>> {
        self.ptr.map(|static_ptr| {
            let ptr = static_ptr.as_ptr() as *mut T::T<'a>;
            // SAFETY: The pointer comes from a reference passed to `set()`, and the
            // caller guarantees that its target is alive and unmodified for 'a.
            unsafe { &*ptr }
        })
    }
}

/// SAFETY: Sending the view to another thread shares the referenced value,
/// which requires `T<'_>: Sync`, as for a plain reference.
unsafe impl<T: LifetimeParameterized> Send for DynLifetimeView<T> where for<'a> T::T<'a>: Sync {}
/// SAFETY: Sharing the view only hands out shared references, which requires
/// `T<'_>: Sync`, as for a plain reference.
unsafe impl<T: LifetimeParameterized> Sync for DynLifetimeView<T> where for<'a> T::T<'a>: Sync {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Barrier, RwLock};

    impl LifetimeParameterized for &str {
        type T<'a> = &'a str;
    }

    #[test]
    fn status_wait_while() {
        let status = Arc::new(Status::new(0usize));
        let handle = std::thread::spawn({
            let status = status.clone();
            move || {
                for i in 1..=3 {
                    status.notify_all(i);
                }
            }
        });
        let guard = status.wait_while(|x| *x < 3);
        assert_eq!(*guard, 3);
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn status_update() {
        let status = Status::new(vec![1, 2]);
        status.update(|v| v.push(3));
        assert_eq!(*status.lock(), vec![1, 2, 3]);
        status.try_notify_all(vec![]).unwrap();
        assert!(status.lock().is_empty());
    }

    #[test]
    fn view_set_and_clear() {
        let mut view = DynLifetimeView::<&str>::empty();
        assert!(!view.is_set());

        let hello = String::from("hello");
        let slice = hello.as_str();
        view.set(&slice);
        assert!(view.is_set());
        let got = unsafe { view.get().unwrap() };
        assert_eq!(*got, "hello");

        view.clear();
        assert!(!view.is_set());
        assert!(unsafe { view.get() }.is_none());
    }

    #[test]
    fn view_shared_across_threads() {
        const NUM_THREADS: usize = 3;

        let view = Arc::new(RwLock::new(DynLifetimeView::<&str>::empty()));
        let steps: Arc<[_; 2]> = Arc::new(std::array::from_fn(|_| Barrier::new(NUM_THREADS + 1)));

        let threads: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                std::thread::spawn({
                    let view = view.clone();
                    let steps = steps.clone();
                    move || {
                        steps[0].wait();
                        let guard = view.read().unwrap();
                        let value = unsafe { guard.get().unwrap() };
                        assert_eq!(*value, "borrowed");
                        drop(guard);
                        steps[1].wait();
                    }
                })
            })
            .collect();

        let owned = String::from("borrowed");
        let slice = owned.as_str();
        view.write().unwrap().set(&slice);
        steps[0].wait();
        steps[1].wait();
        view.write().unwrap().clear();

        for t in threads {
            t.join().unwrap();
        }
    }
}
