//! ## Eventgroup subscription state
//!
//! Subscriptions are tracked per `(service, instance, eventgroup)` with
//! their subscriber, TTL and last refresh time. Remote subscriptions are
//! refreshed by repeated SubscribeEventgroup entries; a subscription whose
//! TTL passes without a refresh expires and its notifications stop. The
//! table is swept once a second by the janitor driving the shared
//! [`Timer`](crate::Timer); TTLs are counted in those second ticks, and
//! `0xFFFFFF` never expires.

use crate::Timer;

use codec::{ClientId, EventgroupId, InstanceId, ServiceId, TTL_INFINITE};

use std::net::SocketAddr;

use ahash::AHashMap;
use parking_lot::RwLock;

pub type EventgroupKey = (ServiceId, InstanceId, EventgroupId);

/// Who receives the notifications of an eventgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscriber {
    /// A guest of this routing host.
    Local(ClientId),
    /// A remote peer, notified at the endpoint it supplied with its
    /// SubscribeEventgroup entry.
    Remote { endpoint: SocketAddr, reliable: bool },
}

#[derive(Debug, Clone)]
struct Subscription {
    subscriber: Subscriber,
    counter: u8,
    ttl: u32,
    refreshed_at: u64,
}

impl Subscription {
    fn expired(&self, now: u64) -> bool {
        self.ttl != TTL_INFINITE && now > self.refreshed_at + self.ttl as u64
    }
}

#[derive(Default)]
pub struct SubscriptionTable {
    table: RwLock<AHashMap<EventgroupKey, Vec<Subscription>>>,
}

impl SubscriptionTable {
    /// Insert or refresh a subscription. Returns whether it is new.
    pub fn subscribe(
        &self,
        key: EventgroupKey,
        subscriber: Subscriber,
        counter: u8,
        ttl: u32,
        now: &Timer,
    ) -> bool {
        let mut table = self.table.write();
        let subscriptions = table.entry(key).or_default();

        match subscriptions
            .iter_mut()
            .find(|it| it.subscriber == subscriber && it.counter == counter)
        {
            Some(existing) => {
                existing.ttl = ttl;
                existing.refreshed_at = now.get();
                false
            }
            None => {
                subscriptions.push(Subscription {
                    subscriber,
                    counter,
                    ttl,
                    refreshed_at: now.get(),
                });
                true
            }
        }
    }

    /// Withdraw one subscriber. Returns whether it was subscribed.
    pub fn unsubscribe(&self, key: &EventgroupKey, subscriber: &Subscriber) -> bool {
        let mut table = self.table.write();

        match table.get_mut(key) {
            Some(subscriptions) => {
                let before = subscriptions.len();
                subscriptions.retain(|it| it.subscriber != *subscriber);

                let removed = subscriptions.len() != before;
                if subscriptions.is_empty() {
                    table.remove(key);
                }

                removed
            }
            None => false,
        }
    }

    /// Current subscribers of an eventgroup, in subscription order.
    pub fn subscribers(&self, key: &EventgroupKey) -> Vec<Subscriber> {
        self.table
            .read()
            .get(key)
            .map(|subscriptions| subscriptions.iter().map(|it| it.subscriber).collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, key: &EventgroupKey, subscriber: &Subscriber) -> bool {
        self.table
            .read()
            .get(key)
            .is_some_and(|subscriptions| subscriptions.iter().any(|it| it.subscriber == *subscriber))
    }

    /// Drop every subscription held by a guest, e.g. on disconnect.
    pub fn release_client(&self, client: ClientId) {
        self.remove_matching(|subscriber| *subscriber == Subscriber::Local(client));
    }

    /// Drop every subscription held by a remote peer, e.g. after its
    /// reboot was detected.
    pub fn release_peer(&self, address: &SocketAddr) {
        self.remove_matching(|subscriber| {
            matches!(subscriber, Subscriber::Remote { endpoint, .. } if endpoint.ip() == address.ip())
        });
    }

    fn remove_matching(&self, predicate: impl Fn(&Subscriber) -> bool) {
        let mut table = self.table.write();
        table.retain(|_, subscriptions| {
            subscriptions.retain(|it| !predicate(&it.subscriber));
            !subscriptions.is_empty()
        });
    }

    /// Remove expired subscriptions and return them so notifications can
    /// be stopped and multicast groups left.
    pub fn sweep(&self, now: u64) -> Vec<(EventgroupKey, Subscriber)> {
        let mut expired = Vec::new();
        let mut table = self.table.write();

        table.retain(|key, subscriptions| {
            subscriptions.retain(|it| {
                if it.expired(now) {
                    expired.push((*key, it.subscriber));
                    false
                } else {
                    true
                }
            });

            !subscriptions.is_empty()
        });

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: EventgroupKey = (0x1234, 0x0001, 0x0005);

    fn remote() -> Subscriber {
        Subscriber::Remote {
            endpoint: "192.168.1.20:30509".parse().unwrap(),
            reliable: false,
        }
    }

    #[test]
    fn refreshing_keeps_a_subscription_alive() {
        let table = SubscriptionTable::default();
        let timer = Timer::default();

        // TTL 3, refreshed every second: never expires.
        assert!(table.subscribe(KEY, remote(), 0, 3, &timer));
        for _ in 0..10 {
            let now = timer.add();
            assert!(table.sweep(now).is_empty());
            assert!(!table.subscribe(KEY, remote(), 0, 3, &timer));
        }

        // Refreshes stop: expiry happens once the TTL has fully passed.
        let now = timer.add();
        assert!(table.sweep(now).is_empty());

        for _ in 0..3 {
            timer.add();
        }

        let expired = table.sweep(timer.get());
        assert_eq!(expired, vec![(KEY, remote())]);
        assert!(table.subscribers(&KEY).is_empty());
    }

    #[test]
    fn infinite_ttl_never_expires() {
        let table = SubscriptionTable::default();
        let timer = Timer::default();

        table.subscribe(KEY, Subscriber::Local(0x0101), 0, TTL_INFINITE, &timer);

        for _ in 0..100_000 {
            timer.add();
        }

        assert!(table.sweep(timer.get()).is_empty());
    }

    #[test]
    fn peer_release_drops_all_its_subscriptions() {
        let table = SubscriptionTable::default();
        let timer = Timer::default();

        table.subscribe(KEY, remote(), 0, 300, &timer);
        table.subscribe((0x5678, 1, 1), remote(), 0, 300, &timer);
        table.subscribe(KEY, Subscriber::Local(0x0101), 0, 300, &timer);

        table.release_peer(&"192.168.1.20:30490".parse().unwrap());

        assert_eq!(table.subscribers(&KEY), vec![Subscriber::Local(0x0101)]);
        assert!(table.subscribers(&(0x5678, 1, 1)).is_empty());
    }
}
