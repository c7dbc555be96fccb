//! ## Client identity registry
//!
//! The routing host mints a `ClientId` for every guest on its first
//! connect. Applications named in the configuration get their configured
//! id whenever it is free; everything else is derived from the name so a
//! restarting guest usually comes back under the same identity, with a
//! linear probe as collision fallback. Released ids sit in quarantine for
//! one discovery round before they can be handed out again, so a peer
//! cannot confuse a fresh guest with the one that just vanished.

use crate::policy::Credentials;

use codec::{ClientId, ILLEGAL_CLIENT};

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub pid: u32,
    pub credentials: Credentials,
}

struct State {
    clients: AHashMap<ClientId, ClientInfo>,
    quarantined: AHashSet<ClientId>,
    /// Front entries expire first; `u64` is the release tick.
    quarantine_queue: VecDeque<(u64, ClientId)>,
}

pub struct ClientRegistry {
    state: RwLock<State>,
    static_ids: AHashMap<String, ClientId>,
    quarantine_ticks: u64,
}

impl ClientRegistry {
    pub fn new(static_ids: AHashMap<String, ClientId>, quarantine_ticks: u64) -> Self {
        Self {
            state: RwLock::new(State {
                clients: AHashMap::with_capacity(64),
                quarantined: AHashSet::new(),
                quarantine_queue: VecDeque::new(),
            }),
            static_ids,
            quarantine_ticks,
        }
    }

    /// Mint an id for a connecting guest.
    ///
    /// Selection is deterministic given the name: a configured id wins,
    /// otherwise the name is hashed into the id space. Taken and
    /// quarantined ids fall through to the next free one. Returns `None`
    /// only when all 65535 ids are in use.
    ///
    /// Invariant: the client to process mapping has no duplicates. A
    /// pid that already holds an id for this application (a second
    /// IPC connection from the same process, or a reconnect racing its
    /// own teardown) gets that id back instead of a second one. A
    /// process hosting several applications holds one id per
    /// application, never two for the same one.
    ///
    /// # Test
    ///
    /// ```
    /// use ahash::AHashMap;
    /// use someip_router_service::clients::ClientRegistry;
    /// use someip_router_service::policy::Credentials;
    ///
    /// let mut hints = AHashMap::new();
    /// hints.insert("radar".to_string(), 0x0101);
    ///
    /// let registry = ClientRegistry::new(hints, 1);
    /// let credentials = Credentials { uid: 1000, gid: 1000 };
    ///
    /// let radar = registry.assign("radar", 100, credentials).unwrap();
    /// assert_eq!(radar, 0x0101);
    ///
    /// // The configured id is taken, the next guest under the same name
    /// // falls back to a probed one.
    /// let clone = registry.assign("radar", 101, credentials).unwrap();
    /// assert_ne!(clone, 0x0101);
    /// ```
    pub fn assign(&self, name: &str, pid: u32, credentials: Credentials) -> Option<ClientId> {
        let mut state = self.state.write();

        if let Some((existing, info)) = state
            .clients
            .iter_mut()
            .find(|(_, info)| info.pid == pid && info.name == name)
        {
            let existing = *existing;
            info.credentials = credentials;
            return Some(existing);
        }

        let preferred = self
            .static_ids
            .get(name)
            .copied()
            .unwrap_or_else(|| fold_name(name));

        let mut candidate = if preferred == ILLEGAL_CLIENT { 1 } else { preferred };
        for _ in 0..u16::MAX {
            if !state.clients.contains_key(&candidate) && !state.quarantined.contains(&candidate) {
                state.clients.insert(
                    candidate,
                    ClientInfo {
                        name: name.to_string(),
                        pid,
                        credentials,
                    },
                );

                return Some(candidate);
            }

            candidate = match candidate.checked_add(1) {
                Some(next) => next,
                None => 1,
            };
        }

        None
    }

    pub fn get(&self, client: ClientId) -> Option<ClientInfo> {
        self.state.read().clients.get(&client).cloned()
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.state.read().clients.contains_key(&client)
    }

    pub fn len(&self) -> usize {
        self.state.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().clients.is_empty()
    }

    /// Release an id on deregistration or connection loss. The id stays
    /// quarantined until [`ClientRegistry::sweep`] passes its release
    /// tick plus the configured quarantine.
    pub fn release(&self, client: ClientId, now: u64) -> Option<ClientInfo> {
        let mut state = self.state.write();
        let info = state.clients.remove(&client)?;

        state.quarantined.insert(client);
        state.quarantine_queue.push_back((now + self.quarantine_ticks, client));

        Some(info)
    }

    /// Free quarantined ids whose hold time has passed.
    pub fn sweep(&self, now: u64) {
        let mut state = self.state.write();

        while let Some((deadline, client)) = state.quarantine_queue.front().copied() {
            if deadline > now {
                break;
            }

            state.quarantine_queue.pop_front();
            state.quarantined.remove(&client);
        }
    }
}

/// FNV-1a folded into the 16 bit id space, zero mapped away from
/// `ILLEGAL_CLIENT`.
fn fold_name(name: &str) -> ClientId {
    let mut hash: u64 = 0xCBF2_9CE4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
    }

    let folded = (hash ^ (hash >> 16) ^ (hash >> 32) ^ (hash >> 48)) as u16;
    if folded == ILLEGAL_CLIENT { 1 } else { folded }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials { uid: 1000, gid: 1000 }
    }

    #[test]
    fn ids_are_unique_per_guest() {
        let registry = ClientRegistry::new(AHashMap::new(), 1);

        let mut seen = AHashSet::new();
        for pid in 0..64 {
            let id = registry.assign("app", pid, credentials()).unwrap();
            assert!(seen.insert(id));
            assert_ne!(id, ILLEGAL_CLIENT);
        }
    }

    #[test]
    fn one_identity_per_process_and_application() {
        let registry = ClientRegistry::new(AHashMap::new(), 1);

        let first = registry.assign("app", 100, credentials()).unwrap();

        // A second connection of the same application from the same
        // process reuses its identity instead of minting a duplicate
        // mapping.
        assert_eq!(registry.assign("app", 100, credentials()), Some(first));
        assert_eq!(registry.len(), 1);

        // A different application hosted by the same process is its own
        // routing identity.
        let sibling = registry.assign("other", 100, credentials()).unwrap();
        assert_ne!(sibling, first);

        let other = registry.assign("app", 101, credentials()).unwrap();
        assert_ne!(other, first);
    }

    #[test]
    fn same_name_reconnects_under_the_same_id() {
        let registry = ClientRegistry::new(AHashMap::new(), 0);

        let first = registry.assign("telemetry", 100, credentials()).unwrap();
        registry.release(first, 0);
        registry.sweep(0);

        assert_eq!(registry.assign("telemetry", 101, credentials()), Some(first));
    }

    #[test]
    fn quarantined_ids_are_not_reused_until_swept() {
        let registry = ClientRegistry::new(AHashMap::new(), 2);

        let first = registry.assign("telemetry", 100, credentials()).unwrap();
        registry.release(first, 10);

        // Still inside the quarantine window.
        registry.sweep(11);
        assert_ne!(registry.assign("telemetry", 101, credentials()), Some(first));

        registry.sweep(12);
        assert_eq!(registry.assign("telemetry", 102, credentials()), Some(first));
    }
}
