//! ## Find state machine
//!
//! One per requested remote `(service, instance)`. FindService is sent
//! once on entry to SEARCHING and then up to `R_max` more times with
//! doubling delays; after that the machine sits passive until an offer
//! arrives or the request is re-issued. Offers move it to SEEN,
//! StopOffer or TTL expiry moves it back and restarts the search while
//! the service is still requested.

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTimings {
    pub initial_delay_min: Duration,
    pub initial_delay_max: Duration,
    pub repetitions_base_delay: Duration,
    pub repetitions_max: u8,
    /// Subscription TTL requested by this host, seconds.
    pub subscription_ttl: u32,
}

impl Default for ClientTimings {
    fn default() -> Self {
        Self {
            initial_delay_min: Duration::ZERO,
            initial_delay_max: Duration::from_millis(3000),
            repetitions_base_delay: Duration::from_millis(10),
            repetitions_max: 3,
            subscription_ttl: codec::TTL_INFINITE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindPhase {
    /// Not requested, or requested but given up until something changes.
    NotSeen,
    InitialWait,
    Searching,
    Seen,
}

#[derive(Debug)]
pub struct FindFsm {
    timings: ClientTimings,
    phase: FindPhase,
    deadline: Option<Instant>,
    sent_finds: u8,
}

impl FindFsm {
    pub fn new(timings: ClientTimings) -> Self {
        Self {
            timings,
            phase: FindPhase::NotSeen,
            deadline: None,
            sent_finds: 0,
        }
    }

    pub fn phase(&self) -> FindPhase {
        self.phase
    }

    /// The service was requested (or lost while requested): start a
    /// search unless one is already running or the service is in sight.
    pub fn start(&mut self, now: Instant, rng: &mut impl Rng) {
        if self.phase != FindPhase::NotSeen {
            return;
        }

        let min = self.timings.initial_delay_min;
        let max = self.timings.initial_delay_max.max(min);
        let initial_delay = if max > min { rng.random_range(min..=max) } else { min };

        self.phase = FindPhase::InitialWait;
        self.deadline = Some(now + initial_delay);
        self.sent_finds = 0;
    }

    /// The request was released.
    pub fn stop(&mut self) {
        self.phase = FindPhase::NotSeen;
        self.deadline = None;
        self.sent_finds = 0;
    }

    /// An offer for the service arrived.
    pub fn on_offer(&mut self) {
        self.phase = FindPhase::Seen;
        self.deadline = None;
        self.sent_finds = 0;
    }

    /// The offer was withdrawn or lapsed; restart the search.
    pub fn on_lost(&mut self, now: Instant, rng: &mut impl Rng) {
        self.phase = FindPhase::NotSeen;
        self.deadline = None;
        self.start(now, rng);
    }

    /// Advance past due deadlines; `true` asks for one FindService
    /// transmission.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.deadline.is_none_or(|deadline| now < deadline) {
            return false;
        }

        match self.phase {
            FindPhase::InitialWait => {
                self.phase = FindPhase::Searching;
                self.deadline = Some(now + self.timings.repetitions_base_delay);
                true
            }
            FindPhase::Searching => {
                self.sent_finds += 1;

                if self.sent_finds >= self.timings.repetitions_max {
                    // Give up for now; a later offer or request revives us.
                    self.deadline = None;
                } else {
                    let factor = 1u32 << self.sent_finds;
                    self.deadline = Some(now + self.timings.repetitions_base_delay * factor);
                }

                true
            }
            _ => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> ClientTimings {
        ClientTimings {
            initial_delay_min: Duration::from_millis(20),
            initial_delay_max: Duration::from_millis(20),
            repetitions_base_delay: Duration::from_millis(100),
            repetitions_max: 3,
            subscription_ttl: 3,
        }
    }

    #[test]
    fn finds_are_sent_with_doubling_delays_then_stop() {
        let mut fsm = FindFsm::new(timings());
        let t0 = Instant::now();

        fsm.start(t0, &mut rand::rng());

        // One find on entry to SEARCHING, then three repetitions.
        let mut offsets = Vec::new();
        while let Some(deadline) = fsm.next_deadline() {
            assert!(fsm.poll(deadline));
            offsets.push(deadline.duration_since(t0).as_millis());
        }

        assert_eq!(offsets, vec![20, 120, 320, 720]);
        assert_eq!(fsm.phase(), FindPhase::Searching);
        assert!(!fsm.poll(t0 + Duration::from_secs(60)));
    }

    #[test]
    fn an_offer_ends_the_search() {
        let mut fsm = FindFsm::new(timings());
        let t0 = Instant::now();

        fsm.start(t0, &mut rand::rng());
        assert!(fsm.poll(t0 + Duration::from_millis(20)));

        fsm.on_offer();
        assert_eq!(fsm.phase(), FindPhase::Seen);
        assert!(!fsm.poll(t0 + Duration::from_secs(60)));

        // Losing the offer restarts the whole schedule.
        fsm.on_lost(t0 + Duration::from_secs(60), &mut rand::rng());
        assert_eq!(fsm.phase(), FindPhase::InitialWait);
        assert!(fsm.next_deadline().is_some());
    }
}
