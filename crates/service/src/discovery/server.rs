//! ## Offer state machine
//!
//! One per offered `(service, instance)`. The machine is pure: it is
//! advanced by [`OfferFsm::poll`] with an injected clock and answers with
//! the transmissions that are due, which keeps the phase timing testable
//! without a runtime.
//!
//! ```text
//! NOT_READY --ready--> INITIAL_WAIT --T0--> REPETITION --2^r*base-->
//!   ... --r = R_max--> MAIN --cyclic--> MAIN
//! ```
//!
//! Every phase boundary multicasts an OFFER; withdrawal from any
//! announcing phase multicasts a single StopOffer.

use std::time::{Duration, Instant};

use rand::Rng;

/// Timing parameters of a service group's offer phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTimings {
    pub initial_delay_min: Duration,
    pub initial_delay_max: Duration,
    pub repetitions_base_delay: Duration,
    pub repetitions_max: u8,
    pub cyclic_offer_delay: Duration,
    /// TTL announced in offer entries, seconds.
    pub ttl: u32,
}

impl Default for ServerTimings {
    fn default() -> Self {
        Self {
            initial_delay_min: Duration::ZERO,
            initial_delay_max: Duration::from_millis(3000),
            repetitions_base_delay: Duration::from_millis(10),
            repetitions_max: 3,
            cyclic_offer_delay: Duration::from_millis(1000),
            ttl: codec::TTL_INFINITE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferPhase {
    NotReady,
    InitialWait,
    Repetition,
    Main,
}

/// A transmission the machine asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferAction {
    MulticastOffer,
    UnicastOffer,
}

#[derive(Debug)]
pub struct OfferFsm {
    timings: ServerTimings,
    phase: OfferPhase,
    deadline: Option<Instant>,
    completed_repetitions: u8,
    last_multicast: Option<Instant>,
}

impl OfferFsm {
    pub fn new(timings: ServerTimings) -> Self {
        Self {
            timings,
            phase: OfferPhase::NotReady,
            deadline: None,
            completed_repetitions: 0,
            last_multicast: None,
        }
    }

    pub fn phase(&self) -> OfferPhase {
        self.phase
    }

    pub fn ttl(&self) -> u32 {
        self.timings.ttl
    }

    /// Service and network are up: enter INITIAL_WAIT with a uniformly
    /// random T0 so parallel hosts do not announce in lockstep.
    pub fn set_ready(&mut self, now: Instant, rng: &mut impl Rng) {
        if self.phase != OfferPhase::NotReady {
            return;
        }

        let min = self.timings.initial_delay_min;
        let max = self.timings.initial_delay_max.max(min);
        let initial_delay = if max > min { rng.random_range(min..=max) } else { min };

        self.phase = OfferPhase::InitialWait;
        self.deadline = Some(now + initial_delay);
        self.completed_repetitions = 0;
    }

    /// Service withdrawn. Returns whether a StopOffer must go out, which
    /// is the case once the service has been announced.
    pub fn set_not_ready(&mut self) -> bool {
        let announced = !matches!(self.phase, OfferPhase::NotReady | OfferPhase::InitialWait);

        self.phase = OfferPhase::NotReady;
        self.deadline = None;
        self.completed_repetitions = 0;
        self.last_multicast = None;

        announced
    }

    /// Advance past due deadlines. At most one transition per call; the
    /// caller loops while transmissions come out.
    pub fn poll(&mut self, now: Instant) -> Option<OfferAction> {
        if self.deadline.is_none_or(|deadline| now < deadline) {
            return None;
        }

        match self.phase {
            OfferPhase::NotReady => None,
            OfferPhase::InitialWait => {
                self.phase = OfferPhase::Repetition;
                self.deadline = Some(now + self.timings.repetitions_base_delay);
                self.last_multicast = Some(now);

                if self.timings.repetitions_max == 0 {
                    self.enter_main(now);
                }

                Some(OfferAction::MulticastOffer)
            }
            OfferPhase::Repetition => {
                self.completed_repetitions += 1;

                if self.completed_repetitions >= self.timings.repetitions_max {
                    self.enter_main(now);
                } else {
                    let factor = 1u32 << self.completed_repetitions;
                    self.deadline = Some(now + self.timings.repetitions_base_delay * factor);
                }

                self.last_multicast = Some(now);
                Some(OfferAction::MulticastOffer)
            }
            OfferPhase::Main => {
                self.deadline = Some(now + self.timings.cyclic_offer_delay);
                self.last_multicast = Some(now);
                Some(OfferAction::MulticastOffer)
            }
        }
    }

    fn enter_main(&mut self, now: Instant) {
        self.phase = OfferPhase::Main;
        self.deadline = Some(now + self.timings.cyclic_offer_delay);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A FindService for this service arrived.
    ///
    /// During the early phases the reply is always unicast. In the main
    /// phase a recent multicast offer also makes the reply unicast;
    /// otherwise the machine answers with a fresh multicast offer and the
    /// cyclic timer restarts from it.
    pub fn handle_find(&mut self, now: Instant) -> Option<OfferAction> {
        match self.phase {
            OfferPhase::NotReady => None,
            OfferPhase::InitialWait | OfferPhase::Repetition => Some(OfferAction::UnicastOffer),
            OfferPhase::Main => {
                let recently_multicast = self.last_multicast.is_some_and(|last| {
                    now.saturating_duration_since(last) < self.timings.cyclic_offer_delay / 2
                });

                if recently_multicast {
                    Some(OfferAction::UnicastOffer)
                } else {
                    self.deadline = Some(now + self.timings.cyclic_offer_delay);
                    self.last_multicast = Some(now);
                    Some(OfferAction::MulticastOffer)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> ServerTimings {
        ServerTimings {
            initial_delay_min: Duration::from_millis(50),
            initial_delay_max: Duration::from_millis(50),
            repetitions_base_delay: Duration::from_millis(100),
            repetitions_max: 3,
            cyclic_offer_delay: Duration::from_secs(1),
            ttl: 0xFF_FFFF,
        }
    }

    fn drain(fsm: &mut OfferFsm, now: Instant) -> Vec<OfferAction> {
        let mut actions = Vec::new();
        while let Some(action) = fsm.poll(now) {
            actions.push(action);
        }

        actions
    }

    #[test]
    fn phases_progress_on_the_configured_schedule() {
        let mut fsm = OfferFsm::new(timings());
        let t0 = Instant::now();

        fsm.set_ready(t0, &mut rand::rng());
        assert_eq!(fsm.phase(), OfferPhase::InitialWait);
        assert!(fsm.poll(t0 + Duration::from_millis(49)).is_none());

        // Offers at 50ms, 150ms, 350ms, 750ms, then cyclically at
        // 1750ms, 2750ms.
        let mut offsets = Vec::new();
        let mut now = t0;
        for _ in 0..6 {
            now = fsm.next_deadline().unwrap();
            assert_eq!(drain(&mut fsm, now), vec![OfferAction::MulticastOffer]);
            offsets.push(now.duration_since(t0).as_millis());
        }

        assert_eq!(offsets, vec![50, 150, 350, 750, 1750, 2750]);
        assert_eq!(fsm.phase(), OfferPhase::Main);
    }

    #[test]
    fn initial_delay_is_drawn_from_the_configured_window() {
        let windowed = ServerTimings {
            initial_delay_min: Duration::from_millis(10),
            initial_delay_max: Duration::from_millis(100),
            ..timings()
        };

        let t0 = Instant::now();
        for _ in 0..32 {
            let mut fsm = OfferFsm::new(windowed.clone());
            fsm.set_ready(t0, &mut rand::rng());

            let delay = fsm.next_deadline().unwrap().duration_since(t0);
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn find_is_answered_unicast_before_main() {
        let mut fsm = OfferFsm::new(timings());
        let t0 = Instant::now();

        assert_eq!(fsm.handle_find(t0), None);

        fsm.set_ready(t0, &mut rand::rng());
        assert_eq!(fsm.handle_find(t0), Some(OfferAction::UnicastOffer));
        // The pending initial wait deadline is untouched.
        assert_eq!(fsm.next_deadline(), Some(t0 + Duration::from_millis(50)));
    }

    #[test]
    fn find_in_main_multicasts_and_restarts_the_cycle_when_stale() {
        let mut fsm = OfferFsm::new(timings());
        let t0 = Instant::now();

        fsm.set_ready(t0, &mut rand::rng());
        let mut now = t0;
        for _ in 0..4 {
            now = fsm.next_deadline().unwrap();
            drain(&mut fsm, now);
        }

        assert_eq!(fsm.phase(), OfferPhase::Main);

        // Shortly after a multicast offer the reply stays unicast.
        let soon = now + Duration::from_millis(100);
        assert_eq!(fsm.handle_find(soon), Some(OfferAction::UnicastOffer));

        // Past half a cycle the find is answered for everyone and the
        // cyclic timer restarts.
        let late = now + Duration::from_millis(600);
        assert_eq!(fsm.handle_find(late), Some(OfferAction::MulticastOffer));
        assert_eq!(fsm.next_deadline(), Some(late + Duration::from_secs(1)));
    }

    #[test]
    fn withdrawal_stops_the_machine() {
        let mut fsm = OfferFsm::new(timings());
        let t0 = Instant::now();

        fsm.set_ready(t0, &mut rand::rng());
        assert!(!fsm.set_not_ready());

        fsm.set_ready(t0, &mut rand::rng());
        let now = fsm.next_deadline().unwrap();
        drain(&mut fsm, now);

        assert!(fsm.set_not_ready());
        assert_eq!(fsm.phase(), OfferPhase::NotReady);
        assert_eq!(fsm.next_deadline(), None);
    }
}
