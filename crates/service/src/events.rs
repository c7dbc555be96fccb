//! ## Event forwarding filters
//!
//! An event can be configured with a debounce filter. Updates are
//! forwarded either because their value differs from the last forwarded
//! one (`on_change`, with selected bytes or bits masked out of the
//! comparison) or because `interval` has elapsed since the last
//! interval-driven forward. A forward caused by a change may restart the
//! interval or leave it running, per `on_change_resets_interval`.

use std::time::{Duration, Instant};

/// Static filter configuration, from the `debounce` block of an event's
/// configuration entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebounceFilter {
    /// Forward updates whose payload differs from the last one.
    pub on_change: bool,
    /// Byte positions to ignore in the comparison; the mask selects the
    /// bits to ignore within the byte (`0xFF` ignores the whole byte).
    pub ignore: Vec<(usize, u8)>,
    /// Forward an update once this much time has passed since the last
    /// interval forward, even if nothing changed.
    pub interval: Option<Duration>,
    /// Whether a change forward restarts the interval.
    pub on_change_resets_interval: bool,
}

/// Mutable per event state the filter evaluates against.
#[derive(Debug, Default)]
pub struct DebounceState {
    last_payload: Option<Vec<u8>>,
    interval_started: Option<Instant>,
}

impl DebounceFilter {
    /// Decide whether an update is forwarded, updating the state if so.
    pub fn accepts(&self, state: &mut DebounceState, payload: &[u8], now: Instant) -> bool {
        let changed = match &state.last_payload {
            Some(last) => !self.equal_under_mask(last, payload),
            None => true,
        };

        if self.on_change && changed {
            state.last_payload = Some(payload.to_vec());
            if self.on_change_resets_interval || state.interval_started.is_none() {
                state.interval_started = Some(now);
            }

            return true;
        }

        match self.interval {
            Some(interval) => {
                let due = state
                    .interval_started
                    .is_none_or(|started| now.saturating_duration_since(started) >= interval);

                if due {
                    state.last_payload = Some(payload.to_vec());
                    state.interval_started = Some(now);
                }

                due
            }
            // Not change driven and not rate limited: forward everything.
            None if !self.on_change => {
                state.last_payload = Some(payload.to_vec());
                true
            }
            None => false,
        }
    }

    fn equal_under_mask(&self, left: &[u8], right: &[u8]) -> bool {
        if left.len() != right.len() {
            return false;
        }

        left.iter().zip(right.iter()).enumerate().all(|(index, (l, r))| {
            let ignored = self
                .ignore
                .iter()
                .find(|(position, _)| *position == index)
                .map(|(_, mask)| *mask)
                .unwrap_or(0);

            (l | ignored) == (r | ignored)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_payloads_are_suppressed() {
        let filter = DebounceFilter {
            on_change: true,
            ..Default::default()
        };
        let mut state = DebounceState::default();
        let now = Instant::now();

        assert!(filter.accepts(&mut state, &[1, 2, 3], now));
        assert!(!filter.accepts(&mut state, &[1, 2, 3], now));
        assert!(filter.accepts(&mut state, &[1, 2, 4], now));
    }

    #[test]
    fn ignored_bits_do_not_count_as_change() {
        let filter = DebounceFilter {
            on_change: true,
            ignore: vec![(1, 0x0F)],
            ..Default::default()
        };
        let mut state = DebounceState::default();
        let now = Instant::now();

        assert!(filter.accepts(&mut state, &[1, 0x20, 3], now));
        // Only bits under the ignore mask changed.
        assert!(!filter.accepts(&mut state, &[1, 0x2F, 3], now));
        // A bit outside the mask changed.
        assert!(filter.accepts(&mut state, &[1, 0x30, 3], now));
    }

    #[test]
    fn interval_forwards_unchanged_payloads() {
        let filter = DebounceFilter {
            on_change: true,
            interval: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut state = DebounceState::default();
        let start = Instant::now();

        assert!(filter.accepts(&mut state, &[1], start));
        assert!(!filter.accepts(&mut state, &[1], start + Duration::from_millis(50)));
        assert!(filter.accepts(&mut state, &[1], start + Duration::from_millis(150)));
    }

    #[test]
    fn changes_bypass_the_interval() {
        let filter = DebounceFilter {
            on_change: true,
            interval: Some(Duration::from_millis(100)),
            on_change_resets_interval: false,
            ..Default::default()
        };
        let mut state = DebounceState::default();
        let start = Instant::now();

        assert!(filter.accepts(&mut state, &[1], start));
        assert!(filter.accepts(&mut state, &[2], start + Duration::from_millis(10)));
        // The change did not restart the interval, so the unchanged
        // repeat still goes out at the original schedule.
        assert!(filter.accepts(&mut state, &[2], start + Duration::from_millis(100)));
    }

    #[test]
    fn change_forward_can_restart_the_interval() {
        let filter = DebounceFilter {
            on_change: true,
            interval: Some(Duration::from_millis(100)),
            on_change_resets_interval: true,
            ..Default::default()
        };
        let mut state = DebounceState::default();
        let start = Instant::now();

        assert!(filter.accepts(&mut state, &[1], start));
        assert!(filter.accepts(&mut state, &[2], start + Duration::from_millis(90)));
        // The interval restarted at 90ms, so 150ms is still inside it.
        assert!(!filter.accepts(&mut state, &[2], start + Duration::from_millis(150)));
        assert!(filter.accepts(&mut state, &[2], start + Duration::from_millis(190)));
    }
}
