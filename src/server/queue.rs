use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

/// Per peer outbound train buffer.
///
/// Frames queued without an explicit flush ride together until the train
/// would outgrow the MTU or the flush delay expires, which is what keeps
/// small RPC messages from costing one packet each. An MTU of zero
/// disables the size trigger (unlimited, the TCP default). When magic
/// cookies are enabled the direction cookie is put in front of every
/// departing packet.
pub struct TrainBuffer {
    buffer: BytesMut,
    mtu: usize,
    flush_delay: Duration,
    cookie: Option<&'static [u8; 16]>,
    departure: Option<Instant>,
}

impl TrainBuffer {
    pub fn new(mtu: usize, flush_delay: Duration, cookie: Option<&'static [u8; 16]>) -> Self {
        Self {
            buffer: BytesMut::new(),
            mtu,
            flush_delay,
            cookie,
            departure: None,
        }
    }

    fn start_train(&mut self) {
        if let Some(cookie) = self.cookie {
            self.buffer.put(cookie.as_slice());
        }
    }

    /// Append one serialized frame. Returns the packets that must leave
    /// right away: the previous train if the frame would overflow it,
    /// and the current one if `flush` is set.
    pub fn push(&mut self, frame: &[u8], flush: bool, now: Instant) -> Vec<Bytes> {
        let mut departures = Vec::new();

        if self.mtu != 0 && !self.buffer.is_empty() && self.buffer.len() + frame.len() > self.mtu {
            departures.extend(self.take());
        }

        if self.buffer.is_empty() {
            self.start_train();
            self.departure = Some(now + self.flush_delay);
        }

        self.buffer.put(frame);

        if flush {
            departures.extend(self.take());
        }

        departures
    }

    /// The flush timer fired: everything buffered leaves.
    pub fn flush_due(&mut self, now: Instant) -> Option<Bytes> {
        if self.departure.is_some_and(|departure| departure <= now) {
            self.take()
        } else {
            None
        }
    }

    pub fn next_departure(&self) -> Option<Instant> {
        self.departure
    }

    pub fn take(&mut self) -> Option<Bytes> {
        self.departure = None;
        if self.buffer.is_empty() {
            return None;
        }

        Some(self.buffer.split().freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_ride_together_until_flushed() {
        let mut train = TrainBuffer::new(100, Duration::from_millis(5), None);
        let now = Instant::now();

        assert!(train.push(&[1; 10], false, now).is_empty());
        assert!(train.push(&[2; 10], false, now).is_empty());

        let packets = train.push(&[3; 10], true, now);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 30);
    }

    #[test]
    fn overflow_departs_the_previous_train() {
        let mut train = TrainBuffer::new(32, Duration::from_millis(5), None);
        let now = Instant::now();

        assert!(train.push(&[1; 20], false, now).is_empty());

        let packets = train.push(&[2; 20], true, now);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 20);
        assert_eq!(packets[1].len(), 20);
    }

    #[test]
    fn the_flush_timer_moves_the_train() {
        let mut train = TrainBuffer::new(0, Duration::from_millis(5), None);
        let now = Instant::now();

        train.push(&[1; 10], false, now);
        assert_eq!(train.next_departure(), Some(now + Duration::from_millis(5)));

        assert!(train.flush_due(now + Duration::from_millis(4)).is_none());
        let packet = train.flush_due(now + Duration::from_millis(5)).unwrap();
        assert_eq!(packet.len(), 10);
        assert_eq!(train.next_departure(), None);
    }

    #[test]
    fn cookies_lead_every_packet() {
        let mut train =
            TrainBuffer::new(0, Duration::from_millis(5), Some(&codec::SERVICE_COOKIE));
        let now = Instant::now();

        let packets = train.push(&[0xAB; 8], true, now);
        assert_eq!(packets[0].len(), 24);
        assert_eq!(&packets[0][..16], &codec::SERVICE_COOKIE);
        assert_eq!(&packets[0][16..], &[0xAB; 8]);
    }
}
