//! ## Request/response pairing
//!
//! Every relayed Request is recorded under
//! `(service, instance, client, session)` until its Response arrives or
//! its deadline passes; on expiry the host synthesizes an Error response
//! with `E_TIMEOUT` for the original sender. The same module mints the
//! session ids: one 16 bit counter per
//! `(client, service, instance, method)` tuple, wrapping past zero.

use codec::{ClientId, InstanceId, MethodId, ServiceId, SessionId};

use ahash::AHashMap;
use parking_lot::Mutex;

pub type PendingKey = (ServiceId, InstanceId, ClientId, SessionId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub method: MethodId,
    pub deadline: u64,
}

#[derive(Default)]
struct State {
    requests: AHashMap<PendingKey, PendingRequest>,
    sessions: AHashMap<(ClientId, ServiceId, InstanceId, MethodId), SessionId>,
}

#[derive(Default)]
pub struct PendingStore {
    state: Mutex<State>,
}

impl PendingStore {
    /// Next session id for the tuple. Starts at 1 and skips zero on wrap.
    ///
    /// # Test
    ///
    /// ```
    /// use someip_router_service::pending::PendingStore;
    ///
    /// let store = PendingStore::default();
    ///
    /// assert_eq!(store.next_session(0x0101, 0x1234, 0x0001, 0x0001), 1);
    /// assert_eq!(store.next_session(0x0101, 0x1234, 0x0001, 0x0001), 2);
    /// // Independent tuples count independently.
    /// assert_eq!(store.next_session(0x0101, 0x1234, 0x0001, 0x0002), 1);
    /// ```
    pub fn next_session(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
    ) -> SessionId {
        let mut state = self.state.lock();
        let session = state.sessions.entry((client, service, instance, method)).or_insert(0);

        *session = match session.checked_add(1) {
            Some(next) => next,
            None => 1,
        };

        *session
    }

    /// Record a relayed request so its response can be paired later.
    pub fn insert(&self, key: PendingKey, method: MethodId, deadline: u64) {
        self.state.lock().requests.insert(key, PendingRequest { method, deadline });
    }

    /// Pair an arriving response. Returns the request if one was pending;
    /// unmatched responses are the caller's to drop.
    pub fn complete(&self, key: &PendingKey) -> Option<PendingRequest> {
        self.state.lock().requests.remove(key)
    }

    /// Collect requests whose deadline has passed.
    pub fn sweep(&self, now: u64) -> Vec<(PendingKey, PendingRequest)> {
        let mut expired = Vec::new();

        self.state.lock().requests.retain(|key, request| {
            if request.deadline <= now {
                expired.push((*key, *request));
                false
            } else {
                true
            }
        });

        expired
    }

    /// Forget everything a disconnected guest was waiting for.
    pub fn release_client(&self, client: ClientId) {
        self.state.lock().requests.retain(|(_, _, sender, _), _| *sender != client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_wrap_skips_zero() {
        let store = PendingStore::default();

        let mut last = 0;
        for _ in 0..u16::MAX {
            last = store.next_session(1, 2, 3, 4);
        }

        assert_eq!(last, u16::MAX);
        assert_eq!(store.next_session(1, 2, 3, 4), 1);
    }

    #[test]
    fn responses_pair_exactly_once() {
        let store = PendingStore::default();
        let key = (0x1234, 0x0001, 0x0101, 7);

        store.insert(key, 0x0042, 10);

        assert!(store.complete(&key).is_some());
        assert!(store.complete(&key).is_none());
    }

    #[test]
    fn expired_requests_surface_in_the_sweep() {
        let store = PendingStore::default();
        store.insert((1, 1, 1, 1), 0x0042, 5);
        store.insert((1, 1, 1, 2), 0x0042, 10);

        assert!(store.sweep(4).is_empty());

        let expired = store.sweep(5);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, (1, 1, 1, 1));

        assert_eq!(store.sweep(10).len(), 1);
    }
}
