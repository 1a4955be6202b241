/// Bus-wide mutual exclusion for multi-step transactions.
///
/// Every device on a bus shares one lock: two devices' transactions (write command, wait for the
/// settling delay, read the response) must never interleave on the wire.  The
/// [`BusManager`](crate::BusManager) owns the lock and hands it to every
/// [`DeviceScheduler`](crate::DeviceScheduler) it creates.  `i2c-mount` implements this trait for
/// the following lock types:
///
/// | Lock | Feature Name | Notes |
/// | --- | --- | --- |
/// | [`std::sync::Mutex<()>`] | _always available_ | The default. |
/// | [`CriticalSectionLock`] | `critical-section` | For platforms providing a `critical-section` implementation. |
///
/// For other lock types, a custom implementation is needed.  Test doubles are the usual case,
/// e.g. a lock that counts acquisitions:
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct CountingLock {
///     inner: std::sync::Mutex<()>,
///     count: AtomicUsize,
/// }
///
/// impl i2c_mount::BusLock for CountingLock {
///     fn lock<R, F: FnOnce() -> R>(&self, f: F) -> R {
///         let _guard = self.inner.lock().unwrap();
///         self.count.fetch_add(1, Ordering::SeqCst);
///         f()
///     }
/// }
/// ```
pub trait BusLock: Send + Sync {
    /// Hold the lock for the duration of `f`.
    fn lock<R, F: FnOnce() -> R>(&self, f: F) -> R;
}

pub type StdBusLock = std::sync::Mutex<()>;

impl BusLock for std::sync::Mutex<()> {
    fn lock<R, F: FnOnce() -> R>(&self, f: F) -> R {
        // A panic inside another transaction leaves no state behind the lock worth protecting.
        let _guard = self.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f()
    }
}

/// Lock backed by the global `critical-section` implementation.
#[cfg(any(test, feature = "critical-section"))]
#[derive(Debug, Default, Clone, Copy)]
pub struct CriticalSectionLock;

#[cfg(any(test, feature = "critical-section"))]
impl BusLock for CriticalSectionLock {
    fn lock<R, F: FnOnce() -> R>(&self, f: F) -> R {
        critical_section::with(|_| f())
    }
}
