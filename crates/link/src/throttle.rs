//! Per-channel flow control.
//!
//! A [`Throttle`] bounds the bytes a channel has sent but not yet seen
//! acknowledged. Senders reserve before transmitting and the acknowledgment
//! path releases. A window of 0 means unbounded: reservations always succeed
//! but are still accounted, so integrity checks keep working.
//!
//! A bounded window is never exceeded. A single reservation larger than the
//! whole window can never be granted and waits out its deadline.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// Why a blocking reservation gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// The deadline passed before enough window freed up.
    Timeout,
    /// The throttle was closed while waiting.
    Closed,
}

#[derive(Debug)]
pub struct Throttle {
    /// Window size in bytes, 0 = unbounded.
    window: u64,
    in_flight: Mutex<u64>,
    released: Notify,
    closed: AtomicBool,
    integrity_violations: AtomicU64,
}

impl Throttle {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            in_flight: Mutex::new(0),
            released: Notify::new(),
            closed: AtomicBool::new(false),
            integrity_violations: AtomicU64::new(0),
        }
    }

    /// Changes the window. Only possible before the throttle is shared.
    pub fn set_window(&mut self, window: u64) {
        self.window = window;
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn is_unbounded(&self) -> bool {
        self.window == 0
    }

    pub fn in_flight(&self) -> u64 {
        *self.in_flight.lock()
    }

    /// Number of releases that did not match a reservation.
    pub fn integrity_violations(&self) -> u64 {
        self.integrity_violations.load(Ordering::Relaxed)
    }

    /// Reserves `bytes` if the window allows it right now.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let mut in_flight = self.in_flight.lock();
        let fits = self.window == 0 || in_flight.saturating_add(bytes) <= self.window;
        if fits {
            *in_flight = in_flight.saturating_add(bytes);
        }
        fits
    }

    /// Reserves `bytes`, waiting for releases until `deadline`.
    pub async fn reserve(&self, bytes: u64, deadline: Instant) -> Result<(), ReserveError> {
        loop {
            let mut notified = pin!(self.released.notified());
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(ReserveError::Closed);
            }
            if self.try_reserve(bytes) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ReserveError::Timeout);
            }
        }
    }

    /// Returns `bytes` to the window.
    ///
    /// Releasing more than is in flight means a reservation was released
    /// twice or never made; the counter saturates at zero and the violation
    /// is recorded instead of failing the caller.
    pub fn release(&self, bytes: u64) {
        {
            let mut in_flight = self.in_flight.lock();
            if bytes > *in_flight {
                self.integrity_violations.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("link_throttle_integrity_violations_total").increment(1);
                warn!(
                    released = bytes,
                    in_flight = *in_flight,
                    "throttle release without matching reservation"
                );
                *in_flight = 0;
            } else {
                *in_flight -= bytes;
            }
        }
        self.released.notify_waiters();
    }

    /// Wakes every waiter with [`ReserveError::Closed`]; later reservations
    /// fail the same way.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_window_bounds_reservations() {
        let throttle = Throttle::new(100);
        assert!(throttle.try_reserve(60));
        assert!(throttle.try_reserve(40));
        assert!(!throttle.try_reserve(1));
        assert_eq!(throttle.in_flight(), 100);

        throttle.release(1);
        assert!(throttle.try_reserve(1));
    }

    #[test]
    fn test_zero_window_is_unbounded() {
        let throttle = Throttle::new(0);
        assert!(throttle.is_unbounded());
        assert!(throttle.try_reserve(u64::MAX / 2));
        assert!(throttle.try_reserve(u64::MAX / 2));
    }

    #[test]
    fn test_oversized_reservation_is_never_granted() {
        let throttle = Throttle::new(10);
        assert!(!throttle.try_reserve(11));
        assert_eq!(throttle.in_flight(), 0);
        assert!(throttle.try_reserve(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_reserve_times_out_on_idle_window() {
        let throttle = Throttle::new(16);
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(
            throttle.reserve(17, deadline).await,
            Err(ReserveError::Timeout)
        );
        assert_eq!(throttle.in_flight(), 0);
    }

    #[test]
    fn test_double_release_saturates_and_reports() {
        let throttle = Throttle::new(10);
        assert!(throttle.try_reserve(5));
        throttle.release(5);
        throttle.release(5);
        assert_eq!(throttle.in_flight(), 0);
        assert_eq!(throttle.integrity_violations(), 1);
        assert!(throttle.try_reserve(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_times_out_without_release() {
        let throttle = Throttle::new(10);
        assert!(throttle.try_reserve(10));

        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(
            throttle.reserve(1, deadline).await,
            Err(ReserveError::Timeout)
        );
        assert_eq!(throttle.in_flight(), 10);
    }

    #[tokio::test]
    async fn test_reserve_wakes_on_release() {
        let throttle = Arc::new(Throttle::new(10));
        assert!(throttle.try_reserve(10));

        let waiter = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move {
                let deadline = Instant::now() + Duration::from_secs(5);
                throttle.reserve(4, deadline).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        throttle.release(4);

        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert_eq!(throttle.in_flight(), 10);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let throttle = Arc::new(Throttle::new(1));
        assert!(throttle.try_reserve(1));

        let waiter = {
            let throttle = Arc::clone(&throttle);
            tokio::spawn(async move {
                throttle
                    .reserve(1, Instant::now() + Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        throttle.close();

        assert_eq!(waiter.await.unwrap(), Err(ReserveError::Closed));
    }

    proptest! {
        #[test]
        fn prop_in_flight_never_exceeds_window(
            window in 1u64..1000,
            ops in proptest::collection::vec((any::<bool>(), 1u64..200), 1..200),
        ) {
            let throttle = Throttle::new(window);
            let mut held: Vec<u64> = Vec::new();
            for (reserve, bytes) in ops {
                if reserve {
                    if throttle.try_reserve(bytes) {
                        held.push(bytes);
                    }
                } else if let Some(bytes) = held.pop() {
                    throttle.release(bytes);
                }
                let in_flight = throttle.in_flight();
                prop_assert_eq!(in_flight, held.iter().sum::<u64>());
                prop_assert!(in_flight <= window);
            }
            prop_assert_eq!(throttle.integrity_violations(), 0);
        }
    }
}
