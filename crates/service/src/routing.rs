//! ## The routing table
//!
//! Rows are keyed by `(service, instance)` and ordered by version. A row
//! points at its provider: the owning guest for local services, or the
//! remote endpoint pair learned from discovery for remote ones, together
//! with the offer's TTL deadline. Rows also carry the set of guests that
//! requested the service, which is what availability events are derived
//! from.
//!
//! Invariant: at most one local offerer per `(service, instance)`. A
//! remote offer arriving while a local offer exists is rejected, and a
//! second local offer conflicts regardless of version.

use codec::{ANY_MAJOR, ANY_MINOR, ClientId, InstanceId, MajorVersion, MinorVersion, ServiceId};

use std::{collections::BTreeMap, net::SocketAddr};

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

pub type ServiceKey = (ServiceId, InstanceId);
pub type Version = (MajorVersion, MinorVersion);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Local {
        client: ClientId,
    },
    Remote {
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
        /// Tick at which the offer lapses; `None` holds until reboot.
        expires_at: Option<u64>,
    },
}

impl Provider {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

#[derive(Debug, Default)]
struct Row {
    provider: Option<Provider>,
    requesters: AHashSet<ClientId>,
}

/// Outcome of inserting an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Inserted,
    /// The same provider offered again, e.g. a TTL refresh.
    Refreshed,
    /// A conflicting offer exists and the new one was rejected.
    Conflict,
}

#[derive(Default)]
pub struct RoutingTable {
    rows: RwLock<AHashMap<ServiceKey, BTreeMap<Version, Row>>>,
}

impl RoutingTable {
    /// Insert a local offer.
    pub fn offer_local(
        &self,
        client: ClientId,
        key: ServiceKey,
        version: Version,
    ) -> OfferOutcome {
        let mut rows = self.rows.write();
        let versions = rows.entry(key).or_default();

        match local_offerer(versions) {
            Some(existing) if existing != client => return OfferOutcome::Conflict,
            Some(_) => return OfferOutcome::Refreshed,
            None => {}
        }

        let row = versions.entry(version).or_default();
        // A remote provider for the same identity is superseded; the
        // remote side is expected to lose against a local offer.
        row.provider = Some(Provider::Local { client });
        OfferOutcome::Inserted
    }

    /// Insert or refresh a remote offer learned from discovery.
    pub fn offer_remote(
        &self,
        key: ServiceKey,
        version: Version,
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
        expires_at: Option<u64>,
    ) -> OfferOutcome {
        let mut rows = self.rows.write();
        let versions = rows.entry(key).or_default();

        if local_offerer(versions).is_some() {
            return OfferOutcome::Conflict;
        }

        let row = versions.entry(version).or_default();
        let outcome = match row.provider {
            Some(Provider::Remote { .. }) => OfferOutcome::Refreshed,
            _ => OfferOutcome::Inserted,
        };

        row.provider = Some(Provider::Remote {
            reliable,
            unreliable,
            expires_at,
        });

        outcome
    }

    /// Withdraw a local offer. Returns whether `client` was the offerer.
    pub fn stop_offer_local(&self, client: ClientId, key: ServiceKey) -> bool {
        let mut rows = self.rows.write();

        let Some(versions) = rows.get_mut(&key) else {
            return false;
        };

        let mut removed = false;
        for row in versions.values_mut() {
            if row.provider == Some(Provider::Local { client }) {
                row.provider = None;
                removed = true;
            }
        }

        prune(&mut rows, key);
        removed
    }

    /// Withdraw a remote offer, e.g. on StopOffer. Returns whether a
    /// remote provider existed.
    pub fn stop_offer_remote(&self, key: ServiceKey) -> bool {
        let mut rows = self.rows.write();

        let Some(versions) = rows.get_mut(&key) else {
            return false;
        };

        let mut removed = false;
        for row in versions.values_mut() {
            if matches!(row.provider, Some(Provider::Remote { .. })) {
                row.provider = None;
                removed = true;
            }
        }

        prune(&mut rows, key);
        removed
    }

    /// Add a guest to the requester set. Returns whether the service is
    /// currently provided, so an immediate availability event can be
    /// pushed.
    pub fn request(
        &self,
        client: ClientId,
        key: ServiceKey,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> bool {
        let mut rows = self.rows.write();
        let versions = rows.entry(key).or_default();

        // The requester set is version independent; the version filter
        // only matters for resolution.
        versions.entry((major, minor)).or_default().requesters.insert(client);

        versions.values().any(|row| row.provider.is_some())
    }

    pub fn release_request(&self, client: ClientId, key: ServiceKey) {
        let mut rows = self.rows.write();

        if let Some(versions) = rows.get_mut(&key) {
            for row in versions.values_mut() {
                row.requesters.remove(&client);
            }

            prune(&mut rows, key);
        }
    }

    /// Resolve the provider for a send to `key`, honoring the version
    /// filter recorded by the requesters: the highest offered version
    /// compatible with `major`/`minor` wins.
    pub fn resolve(
        &self,
        key: ServiceKey,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Option<Provider> {
        let rows = self.rows.read();
        let versions = rows.get(&key)?;

        versions
            .iter()
            .rev()
            .find(|((offered_major, offered_minor), row)| {
                row.provider.is_some()
                    && (major == ANY_MAJOR || *offered_major == major)
                    && (minor == ANY_MINOR || *offered_minor >= minor)
            })
            .and_then(|(_, row)| row.provider)
    }

    /// Whether any version of `key` currently has a provider.
    pub fn is_available(&self, key: ServiceKey) -> bool {
        self.rows
            .read()
            .get(&key)
            .is_some_and(|versions| versions.values().any(|row| row.provider.is_some()))
    }

    /// Guests that requested `key`, across all versions.
    pub fn requesters(&self, key: ServiceKey) -> Vec<ClientId> {
        let rows = self.rows.read();

        let mut requesters = Vec::new();
        if let Some(versions) = rows.get(&key) {
            for row in versions.values() {
                for client in &row.requesters {
                    if !requesters.contains(client) {
                        requesters.push(*client);
                    }
                }
            }
        }

        requesters
    }

    /// Everything a disconnecting guest leaves behind: its offers are
    /// withdrawn and its requests released. Returns the keys it offered,
    /// so StopOffers can be sent out.
    pub fn release_client(&self, client: ClientId) -> Vec<(ServiceKey, Version)> {
        let mut rows = self.rows.write();
        let mut stopped = Vec::new();

        let keys = rows.keys().copied().collect::<Vec<_>>();
        for key in keys {
            let Some(versions) = rows.get_mut(&key) else {
                continue;
            };

            for (version, row) in versions.iter_mut() {
                row.requesters.remove(&client);
                if row.provider == Some(Provider::Local { client }) {
                    row.provider = None;
                    stopped.push((key, *version));
                }
            }

            prune(&mut rows, key);
        }

        stopped
    }

    /// Drop every remote offer originating from `address`'s host, e.g.
    /// after a reboot was detected. Returns the affected keys.
    pub fn release_peer(&self, address: &SocketAddr) -> Vec<ServiceKey> {
        let mut rows = self.rows.write();
        let mut dropped = Vec::new();

        let keys = rows.keys().copied().collect::<Vec<_>>();
        for key in keys {
            let Some(versions) = rows.get_mut(&key) else {
                continue;
            };

            for row in versions.values_mut() {
                if let Some(Provider::Remote { reliable, unreliable, .. }) = row.provider {
                    let from_peer = [reliable, unreliable]
                        .iter()
                        .flatten()
                        .any(|endpoint| endpoint.ip() == address.ip());

                    if from_peer {
                        row.provider = None;
                        dropped.push(key);
                    }
                }
            }

            prune(&mut rows, key);
        }

        dropped
    }

    /// Remove remote offers whose TTL deadline has passed.
    pub fn sweep(&self, now: u64) -> Vec<ServiceKey> {
        let mut rows = self.rows.write();
        let mut lapsed = Vec::new();

        let keys = rows.keys().copied().collect::<Vec<_>>();
        for key in keys {
            let Some(versions) = rows.get_mut(&key) else {
                continue;
            };

            for row in versions.values_mut() {
                if let Some(Provider::Remote { expires_at: Some(deadline), .. }) = row.provider
                    && deadline <= now
                {
                    row.provider = None;
                    lapsed.push(key);
                }
            }

            prune(&mut rows, key);
        }

        lapsed
    }

    /// The local offers, as fed into the discovery server machines.
    pub fn local_offers(&self) -> Vec<(ServiceKey, Version, ClientId)> {
        let rows = self.rows.read();

        let mut offers = Vec::new();
        for (key, versions) in rows.iter() {
            for (version, row) in versions {
                if let Some(Provider::Local { client }) = row.provider {
                    offers.push((*key, *version, client));
                }
            }
        }

        offers
    }

    /// Snapshot of every provided `(service, instance)` with its best
    /// version, for the RoutingInfo broadcast.
    pub fn provided(&self) -> Vec<(ServiceKey, Version)> {
        let rows = self.rows.read();

        let mut provided = Vec::new();
        for (key, versions) in rows.iter() {
            if let Some((version, _)) =
                versions.iter().rev().find(|(_, row)| row.provider.is_some())
            {
                provided.push((*key, *version));
            }
        }

        provided
    }
}

fn local_offerer(versions: &BTreeMap<Version, Row>) -> Option<ClientId> {
    versions.values().find_map(|row| match row.provider {
        Some(Provider::Local { client }) => Some(client),
        _ => None,
    })
}

/// Drop rows that neither provide nor request anything anymore.
fn prune(rows: &mut AHashMap<ServiceKey, BTreeMap<Version, Row>>, key: ServiceKey) {
    if let Some(versions) = rows.get_mut(&key) {
        versions.retain(|_, row| row.provider.is_some() || !row.requesters.is_empty());
        if versions.is_empty() {
            rows.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: ServiceKey = (0x1234, 0x0001);
    const V1: Version = (1, 0);

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::new("192.168.1.20".parse().unwrap(), port)
    }

    #[test]
    fn one_local_offerer_per_instance() {
        let table = RoutingTable::default();

        assert_eq!(table.offer_local(0x0101, KEY, V1), OfferOutcome::Inserted);
        assert_eq!(table.offer_local(0x0101, KEY, V1), OfferOutcome::Refreshed);
        assert_eq!(table.offer_local(0x0202, KEY, V1), OfferOutcome::Conflict);
        assert_eq!(table.offer_local(0x0202, KEY, (2, 0)), OfferOutcome::Conflict);
    }

    #[test]
    fn remote_offers_lose_against_local_ones() {
        let table = RoutingTable::default();
        table.offer_local(0x0101, KEY, V1);

        assert_eq!(
            table.offer_remote(KEY, V1, None, Some(endpoint(30509)), Some(100)),
            OfferOutcome::Conflict
        );

        assert_eq!(table.resolve(KEY, 1, 0), Some(Provider::Local { client: 0x0101 }));
    }

    #[test]
    fn resolution_prefers_the_highest_compatible_version() {
        let table = RoutingTable::default();
        table.offer_remote(KEY, (1, 0), None, Some(endpoint(30509)), None);
        table.offer_remote(KEY, (1, 3), None, Some(endpoint(30510)), None);
        table.offer_remote(KEY, (2, 0), None, Some(endpoint(30511)), None);

        let resolved = table.resolve(KEY, 1, 0);
        assert_eq!(
            resolved,
            Some(Provider::Remote {
                reliable: None,
                unreliable: Some(endpoint(30510)),
                expires_at: None,
            })
        );

        assert!(table.resolve(KEY, 3, 0).is_none());
        assert!(table.resolve(KEY, ANY_MAJOR, ANY_MINOR).is_some());
    }

    #[test]
    fn ttl_expiry_withdraws_remote_offers() {
        let table = RoutingTable::default();
        table.offer_remote(KEY, V1, None, Some(endpoint(30509)), Some(10));
        table.request(0x0101, KEY, 1, 0);

        assert!(table.sweep(9).is_empty());
        assert_eq!(table.sweep(10), vec![KEY]);
        assert!(!table.is_available(KEY));
        // The requester set survives the provider.
        assert_eq!(table.requesters(KEY), vec![0x0101]);
    }

    #[test]
    fn disconnect_cleanup_returns_the_stopped_offers() {
        let table = RoutingTable::default();
        table.offer_local(0x0101, KEY, V1);
        table.offer_local(0x0101, (0x5678, 1), (1, 2));
        table.request(0x0101, (0x9999, 1), ANY_MAJOR, ANY_MINOR);

        let mut stopped = table.release_client(0x0101);
        stopped.sort();

        assert_eq!(stopped, vec![(KEY, V1), ((0x5678, 1), (1, 2))]);
        assert!(!table.is_available(KEY));
        assert!(table.requesters((0x9999, 1)).is_empty());
    }
}
