//! Shared peripheral bus with bounded acquisition.
//!
//! The RTC and environmental sensors sit on one I2C bus. Whoever needs it
//! polls the lock in 1 ms steps up to a timeout; failing to get it is a
//! transient I/O failure ([`BusError::Timeout`]), never an unbounded block.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal::delay::DelayNs;

use crate::error::BusError;

/// A bus (or any peripheral) shared between collaborators.
///
/// Usually placed in a `static` and handed out as `&'static SharedBus<_>`.
pub struct SharedBus<T> {
    inner: Mutex<CriticalSectionRawMutex, T>,
}

impl<T> SharedBus<T> {
    pub const fn new(bus: T) -> Self {
        Self {
            inner: Mutex::new(bus),
        }
    }

    /// Run `f` with exclusive access, waiting at most `timeout_ms`.
    pub fn try_with<R>(
        &self,
        timeout_ms: u32,
        delay: &mut impl DelayNs,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, BusError> {
        let mut waited_ms = 0;
        loop {
            if let Ok(mut guard) = self.inner.try_lock() {
                return Ok(f(&mut guard));
            }
            if waited_ms >= timeout_ms {
                log::warn!("Bus busy for {} ms, giving up", waited_ms);
                return Err(BusError::Timeout { waited_ms });
            }
            delay.delay_ms(1);
            waited_ms += 1;
        }
    }

    /// Like [`try_with`](Self::try_with) for closures that talk to a device
    /// and can fail on the wire.
    pub fn transfer<R, E>(
        &self,
        timeout_ms: u32,
        delay: &mut impl DelayNs,
        f: impl FnOnce(&mut T) -> Result<R, E>,
    ) -> Result<R, BusError> {
        self.try_with(timeout_ms, delay, f)?
            .map_err(|_| BusError::Transfer)
    }

    /// Async exclusive access for firmware tasks.
    pub async fn lock(&self) -> embassy_sync::mutex::MutexGuard<'_, CriticalSectionRawMutex, T> {
        self.inner.lock().await
    }
}
