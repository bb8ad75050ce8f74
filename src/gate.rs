//! Connection gate.
//!
//! Two independent mechanisms sit in front of the SSH handshake, both
//! guarding against a peer that opens TCP connections but never completes
//! key exchange: a token-bucket rate limiter on accepted connections, and a
//! bounded semaphore capping concurrent unauthenticated handshakes.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

type DefaultRateLimiter =
    RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

pub struct Gate {
    limiter: DefaultRateLimiter,
    pending: Arc<Semaphore>,
}

/// A held handshake slot, owned so it can be stashed inside a connection
/// handler across `.await` points. Dropping it releases the slot back to
/// the gate, which is what happens when the handshake task exits,
/// successfully or not.
pub struct HandshakeSlot(#[allow(dead_code)] OwnedSemaphorePermit);

impl Gate {
    /// `rate_limit` accepted connections per second with a burst capacity of
    /// `rate_limit + 1`; `max_pending` concurrent in-flight handshakes.
    pub fn new(rate_limit: u32, max_pending: usize) -> Self {
        let per_second = NonZeroU32::new(rate_limit.max(1)).unwrap();
        let burst = NonZeroU32::new(rate_limit.saturating_add(1).max(1)).unwrap();
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Self {
            limiter: RateLimiter::direct(quota),
            pending: Arc::new(Semaphore::new(max_pending)),
        }
    }

    /// Returns `true` if this accept is within the rate budget. A `false`
    /// result means the connection must be closed immediately, with no
    /// further logging beyond counters.
    pub fn check_rate(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Try to reserve a handshake slot. `None` means `max_pending` is
    /// already saturated and the connection must be closed immediately.
    pub fn try_acquire_handshake_slot(&self) -> Option<HandshakeSlot> {
        self.pending.clone().try_acquire_owned().ok().map(HandshakeSlot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_burst_then_rejects() {
        let gate = Gate::new(10, 50);
        let mut allowed = 0;
        for _ in 0..20 {
            if gate.check_rate() {
                allowed += 1;
            }
        }
        // burst capacity is rate_limit + 1
        assert_eq!(allowed, 11);
    }

    #[test]
    fn handshake_semaphore_caps_concurrent_slots() {
        let gate = Gate::new(10, 2);
        let first = gate.try_acquire_handshake_slot();
        let second = gate.try_acquire_handshake_slot();
        let third = gate.try_acquire_handshake_slot();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none());
    }

    #[test]
    fn dropping_a_slot_releases_it_back_to_the_gate() {
        let gate = Gate::new(10, 1);
        {
            let _slot = gate.try_acquire_handshake_slot().unwrap();
            assert!(gate.try_acquire_handshake_slot().is_none());
        }
        assert!(gate.try_acquire_handshake_slot().is_some());
    }
}
