//! One-offer-in-flight guard.
//!
//! Offer creation must be exclusive per session or concurrent triggers (a
//! user action racing an automatic negotiation-needed event) produce
//! colliding offers. The guard is a compare-and-swap flag: whoever wins it
//! sends the offer, everyone else backs off.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct NegotiationGuard {
    in_flight: AtomicBool,
}

impl NegotiationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to send an offer. Returns false if one is already in
    /// flight.
    pub fn try_acquire(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release after the offer settled, whether answered or failed.
    pub fn release(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}
