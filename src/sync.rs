//! Lock domains.
//!
//! Two locks protect an encoder: a process-context lock for the channel list
//! and resource-control bookkeeping, and an interrupt-safe lock for the busy
//! mask and callbacks. Which context a piece of code runs in is carried in the
//! type system:
//!
//! * [`MayBlock`] is held by process-context code. Every blocking operation in
//!   the crate takes `&mut MayBlock`.
//! * [`IrqContext`] is held by interrupt handlers and timer jobs. It can never
//!   be turned into a `MayBlock`.
//! * Taking the [`IrqLock`] from process context mutably borrows the
//!   `MayBlock` for as long as the guard lives, so blocking while holding the
//!   interrupt-safe lock does not compile.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// Capability token: the holder runs in process context and may block.
#[derive(Debug)]
pub struct MayBlock {
    _private: (),
}

impl MayBlock {
    /// Entry points of the public API are process context by contract.
    pub(crate) fn process_context() -> Self {
        MayBlock { _private: () }
    }
}

/// Proof of interrupt-equivalent context: must not block.
#[derive(Debug)]
pub struct IrqContext<'a> {
    _masked: PhantomData<&'a mut MayBlock>,
}

impl IrqContext<'static> {
    /// Used by interrupt handlers and timer jobs.
    pub(crate) fn enter() -> Self {
        IrqContext { _masked: PhantomData }
    }
}

impl<'a> IrqContext<'a> {
    /// Run interrupt-context code from process context (interrupts "masked").
    /// The blocking capability is unavailable until the context is dropped.
    pub fn mask(_token: &'a mut MayBlock) -> Self {
        IrqContext { _masked: PhantomData }
    }
}

/// Exclusive lock taken only from process context.
pub struct ProcessLock<T> {
    inner: Mutex<T>,
}

pub struct ProcessGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    token: MayBlock,
}

impl<T> ProcessLock<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    pub fn lock(&self, _token: &mut MayBlock) -> ProcessGuard<'_, T> {
        ProcessGuard {
            guard: self.inner.lock(),
            token: MayBlock::process_context(),
        }
    }
}

impl<'a, T> ProcessGuard<'a, T> {
    /// Borrow the protected data and the blocking capability separately.
    pub fn split(&mut self) -> (&mut T, &mut MayBlock) {
        (&mut *self.guard, &mut self.token)
    }
}

impl<T> Deref for ProcessGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ProcessGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Interrupt-safe lock, shared between process and interrupt context.
pub struct IrqLock<T> {
    inner: Mutex<T>,
}

/// Guard returned by [`IrqLock::lock_nested`]. Holds the caller's blocking
/// capability hostage until it is dropped.
pub struct IrqGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _token: PhantomData<&'a mut MayBlock>,
}

impl<T> IrqLock<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Lock from an interrupt handler or timer job.
    pub fn lock_irq<'a>(&'a self, _ctx: &IrqContext<'_>) -> MutexGuard<'a, T> {
        self.inner.lock()
    }

    /// Lock from process context.
    pub fn lock_nested<'a>(&'a self, _token: &'a mut MayBlock) -> IrqGuard<'a, T> {
        IrqGuard {
            guard: self.inner.lock(),
            _token: PhantomData,
        }
    }
}

impl<T> Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Bounded condition wait, woken from any context.
#[derive(Default)]
pub struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `done()` holds or `timeout` elapses. Returns the final
    /// value of `done()`.
    ///
    /// `done` runs with the queue lock held and must only read atomics.
    pub fn wait_until(
        &self,
        _token: &mut MayBlock,
        timeout: Duration,
        mut done: impl FnMut() -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if done() {
                return true;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return done();
            }
        }
    }

    pub fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_times_out_when_never_woken() {
        let queue = WaitQueue::new();
        let mut token = MayBlock::process_context();
        let start = Instant::now();
        assert!(!queue.wait_until(&mut token, Duration::from_millis(20), || false));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wake_from_another_thread() {
        let queue = Arc::new(WaitQueue::new());
        let flag = Arc::new(AtomicBool::new(false));

        let waker = {
            let queue = queue.clone();
            let flag = flag.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                flag.store(true, Ordering::SeqCst);
                queue.wake_all();
            })
        };

        let mut token = MayBlock::process_context();
        assert!(queue.wait_until(&mut token, Duration::from_secs(5), || {
            flag.load(Ordering::SeqCst)
        }));
        waker.join().unwrap();
    }

    #[test]
    fn nested_irq_lock_from_process_guard() {
        let ctl = ProcessLock::new(1u32);
        let irq = IrqLock::new(0u32);
        let mut outer = MayBlock::process_context();

        let mut guard = ctl.lock(&mut outer);
        let (value, token) = guard.split();
        {
            let mut inner = irq.lock_nested(token);
            *inner += *value;
        }
        *irq.lock_irq(&IrqContext::enter()) += 1;
        let ctx = IrqContext::mask(token);
        assert_eq!(*irq.lock_irq(&ctx), 2);
    }
}
