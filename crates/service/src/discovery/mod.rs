//! ## The service discovery engine
//!
//! Composes the per service offer and find machines, detects peer
//! reboots, and runs the eventgroup subscription protocol. The engine is
//! deliberately transport free: received SD payloads are pushed in with
//! [`Engine::handle_payload`], elapsed time with [`Engine::poll`], and
//! both answer with the SD messages to transmit plus the events the
//! routing layer has to act on. One task in the daemon drives it and
//! owns the sockets.

pub mod client;
pub mod server;

pub use client::{ClientTimings, FindFsm, FindPhase};
pub use server::{OfferAction, OfferFsm, OfferPhase, ServerTimings};

use crate::routing::{ServiceKey, Version};

use codec::{
    EventgroupId, MajorVersion, MinorVersion, SessionId,
    sd::{
        Entry, EventgroupEntry, EventgroupEntryType, Flags, SdPayload, ServiceEntry,
        ServiceEntryType,
        options::{EndpointKind, SdOption, TransportProtocol},
    },
};

use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use ahash::AHashMap;

/// Where an SD message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdTarget {
    Multicast,
    Unicast(SocketAddr),
}

/// An SD transmission the engine asks for. `session` goes into the
/// SOME/IP header; the reboot flag is already set on the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SdMessage {
    pub target: SdTarget,
    pub payload: SdPayload,
    pub session: SessionId,
}

/// Service endpoints announced with an offer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OfferedEndpoints {
    pub reliable: Option<SocketAddr>,
    pub unreliable: Option<SocketAddr>,
    /// Where this host publishes the service's notifications; handed to
    /// subscribers inside the SubscribeAck.
    pub multicast: Option<SocketAddr>,
}

/// Local endpoints a subscription asks notifications onto.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberEndpoints {
    pub reliable: Option<SocketAddr>,
    pub unreliable: Option<SocketAddr>,
}

/// What the routing layer must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdEvent {
    /// All offers and subscriptions of this peer are invalid.
    PeerRebooted { from: SocketAddr },
    OfferReceived {
        service: u16,
        instance: u16,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: u32,
        reliable: Option<SocketAddr>,
        unreliable: Option<SocketAddr>,
        from: SocketAddr,
    },
    StopOfferReceived {
        service: u16,
        instance: u16,
        from: SocketAddr,
    },
    SubscribeReceived {
        service: u16,
        instance: u16,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: u32,
        endpoints: SubscriberEndpoints,
        from: SocketAddr,
    },
    StopSubscribeReceived {
        service: u16,
        instance: u16,
        eventgroup: EventgroupId,
        counter: u8,
        endpoints: SubscriberEndpoints,
        from: SocketAddr,
    },
    SubscribeAcked {
        service: u16,
        instance: u16,
        eventgroup: EventgroupId,
        /// Multicast group notifications will arrive on, if the offerer
        /// publishes over multicast.
        multicast: Option<SocketAddr>,
    },
    SubscribeNacked {
        service: u16,
        instance: u16,
        eventgroup: EventgroupId,
    },
}

struct OfferedService {
    fsm: OfferFsm,
    version: Version,
    endpoints: OfferedEndpoints,
}

struct FindRequest {
    fsm: FindFsm,
    major: MajorVersion,
    minor: MinorVersion,
    /// SD source address of the last offerer.
    offerer: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionPhase {
    Pending { attempts: u8, deadline: Instant },
    Active,
    Failed,
}

struct Subscription {
    major: MajorVersion,
    ttl: u32,
    counter: u8,
    endpoints: SubscriberEndpoints,
    phase: SubscriptionPhase,
}

/// Last seen SD session of a peer, tracked separately for the multicast
/// and unicast direction.
struct PeerView {
    session: SessionId,
    reboot: bool,
}

struct OutgoingSession {
    last: SessionId,
    wrapped: bool,
}

pub struct Engine {
    server_timings: ServerTimings,
    client_timings: ClientTimings,
    /// Answer timeout of a SubscribeEventgroup before it is repeated.
    request_response_delay: Duration,
    offers: AHashMap<ServiceKey, OfferedService>,
    finds: AHashMap<ServiceKey, FindRequest>,
    subscriptions: AHashMap<(ServiceKey, EventgroupId), Subscription>,
    peers: AHashMap<(IpAddr, bool), PeerView>,
    sessions: AHashMap<SdTarget, OutgoingSession>,
}

impl Engine {
    pub fn new(
        server_timings: ServerTimings,
        client_timings: ClientTimings,
        request_response_delay: Duration,
    ) -> Self {
        Self {
            server_timings,
            client_timings,
            request_response_delay,
            offers: AHashMap::new(),
            finds: AHashMap::new(),
            subscriptions: AHashMap::new(),
            peers: AHashMap::new(),
            sessions: AHashMap::new(),
        }
    }

    /// A local service became ready: start its offer phases.
    pub fn offer(
        &mut self,
        key: ServiceKey,
        version: Version,
        endpoints: OfferedEndpoints,
        now: Instant,
    ) {
        let offered = self.offers.entry(key).or_insert_with(|| OfferedService {
            fsm: OfferFsm::new(self.server_timings.clone()),
            version,
            endpoints,
        });

        offered.version = version;
        offered.endpoints = endpoints;
        offered.fsm.set_ready(now, &mut rand::rng());
    }

    /// A local service was withdrawn. Returns the StopOffer to multicast
    /// if the service had been announced.
    pub fn stop_offer(&mut self, key: ServiceKey) -> Option<SdMessage> {
        let mut offered = self.offers.remove(&key)?;

        if !offered.fsm.set_not_ready() {
            return None;
        }

        let entry = Entry::Service(ServiceEntry {
            kind: ServiceEntryType::OfferService,
            service: key.0,
            instance: key.1,
            major: offered.version.0,
            ttl: 0,
            minor: offered.version.1,
            runs: Default::default(),
        });

        Some(self.build_message(SdTarget::Multicast, |payload| {
            payload.insert_entry(entry, &[], &[]);
        }))
    }

    /// A guest requested a remote service: start searching.
    pub fn request(&mut self, key: ServiceKey, major: MajorVersion, minor: MinorVersion, now: Instant) {
        let find = self.finds.entry(key).or_insert_with(|| FindRequest {
            fsm: FindFsm::new(self.client_timings.clone()),
            major,
            minor,
            offerer: None,
        });

        find.major = major;
        find.minor = minor;
        find.fsm.start(now, &mut rand::rng());
    }

    /// The last requester released the service.
    pub fn release(&mut self, key: ServiceKey) {
        self.finds.remove(&key);
        self.subscriptions.retain(|(sub_key, _), _| *sub_key != key);
    }

    /// Subscribe an eventgroup of a remote service. The Subscribe entry
    /// goes out as soon as the offerer is known; otherwise it is sent
    /// right after the next offer.
    pub fn subscribe(
        &mut self,
        key: ServiceKey,
        eventgroup: EventgroupId,
        major: MajorVersion,
        endpoints: SubscriberEndpoints,
        now: Instant,
    ) -> Option<SdMessage> {
        let counter = (self.subscriptions.len() & 0xF) as u8;
        let ttl = self.client_timings.subscription_ttl;
        let deadline = now + self.request_response_delay;

        let subscription = self
            .subscriptions
            .entry((key, eventgroup))
            .or_insert_with(|| Subscription {
                major,
                ttl,
                counter,
                endpoints,
                phase: SubscriptionPhase::Pending { attempts: 0, deadline },
            });

        subscription.phase = SubscriptionPhase::Pending { attempts: 0, deadline };

        let offerer = self.finds.get(&key).and_then(|find| find.offerer)?;
        Some(self.build_subscribe(key, eventgroup, offerer, false))
    }

    /// Withdraw a subscription. Returns the StopSubscribe to send if the
    /// offerer is known.
    pub fn unsubscribe(&mut self, key: ServiceKey, eventgroup: EventgroupId) -> Option<SdMessage> {
        self.subscriptions.remove(&(key, eventgroup))?;

        let offerer = self.finds.get(&key).and_then(|find| find.offerer)?;
        Some(self.build_subscribe(key, eventgroup, offerer, true))
    }

    /// Answer a received SubscribeEventgroup after the routing layer
    /// checked policy and ownership.
    pub fn subscribe_response(
        &mut self,
        to: SocketAddr,
        service: u16,
        instance: u16,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: u32,
        accept: bool,
    ) -> SdMessage {
        let entry = Entry::Eventgroup(EventgroupEntry {
            kind: EventgroupEntryType::SubscribeAck,
            service,
            instance,
            major,
            ttl: if accept { ttl } else { 0 },
            counter,
            eventgroup,
            runs: Default::default(),
        });

        let multicast = self
            .offers
            .get(&(service, instance))
            .and_then(|offered| offered.endpoints.multicast)
            .filter(|_| accept);

        self.build_message(SdTarget::Unicast(to), |payload| {
            match multicast {
                Some(group) => payload.insert_entry(
                    entry,
                    &[SdOption::endpoint(group, EndpointKind::Multicast, TransportProtocol::Udp)],
                    &[],
                ),
                None => payload.insert_entry(entry, &[], &[]),
            };
        })
    }

    /// Feed in a received SD payload.
    ///
    /// Returns the events for the routing layer and the immediate
    /// replies (unicast offers for finds, subscription refreshes).
    /// Entries are processed in the order they appear.
    pub fn handle_payload(
        &mut self,
        from: SocketAddr,
        via_multicast: bool,
        payload: &SdPayload,
        session: SessionId,
        now: Instant,
    ) -> (Vec<SdEvent>, Vec<SdMessage>) {
        let mut events = Vec::new();
        let mut output = Vec::new();

        if self.detect_reboot(from, via_multicast, payload.flags, session) {
            events.push(SdEvent::PeerRebooted { from });

            for find in self.finds.values_mut() {
                if find.offerer.is_some_and(|offerer| offerer.ip() == from.ip()) {
                    find.offerer = None;
                    find.fsm.on_lost(now, &mut rand::rng());
                }
            }
        }

        for entry in &payload.entries {
            match entry {
                Entry::Service(service_entry) => match service_entry.kind {
                    ServiceEntryType::FindService => {
                        self.handle_find(service_entry, from, now, &mut output);
                    }
                    ServiceEntryType::OfferService if !entry.is_stop() => {
                        self.handle_offer(service_entry, payload, entry, from, now, &mut events, &mut output);
                    }
                    ServiceEntryType::OfferService => {
                        self.handle_stop_offer(service_entry, from, now, &mut events);
                    }
                },
                Entry::Eventgroup(group_entry) => {
                    self.handle_eventgroup(group_entry, payload, entry, from, &mut events);
                }
            }
        }

        (events, output)
    }

    fn handle_find(
        &mut self,
        entry: &ServiceEntry,
        from: SocketAddr,
        now: Instant,
        output: &mut Vec<SdMessage>,
    ) {
        let key = (entry.service, entry.instance);
        let requested_major = entry.major;

        let Some(offered) = self.offers.get_mut(&key) else {
            return;
        };

        if requested_major != codec::ANY_MAJOR && requested_major != offered.version.0 {
            return;
        }

        let target = match offered.fsm.handle_find(now) {
            Some(OfferAction::UnicastOffer) => SdTarget::Unicast(from),
            Some(OfferAction::MulticastOffer) => SdTarget::Multicast,
            None => return,
        };

        let message = self.build_offer_message(target, &[key]);
        output.extend(message);
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_offer(
        &mut self,
        service_entry: &ServiceEntry,
        payload: &SdPayload,
        entry: &Entry,
        from: SocketAddr,
        now: Instant,
        events: &mut Vec<SdEvent>,
        output: &mut Vec<SdMessage>,
    ) {
        let key = (service_entry.service, service_entry.instance);

        let mut reliable = None;
        let mut unreliable = None;
        for option in payload.entry_options(entry) {
            if let Some(endpoint) = option.as_endpoint()
                && endpoint.kind == EndpointKind::Unicast
            {
                match endpoint.protocol {
                    TransportProtocol::Tcp => reliable = Some(endpoint.socket_addr()),
                    TransportProtocol::Udp => unreliable = Some(endpoint.socket_addr()),
                }
            }
        }

        if let Some(find) = self.finds.get_mut(&key) {
            find.fsm.on_offer();
            find.offerer = Some(from);
        }

        events.push(SdEvent::OfferReceived {
            service: service_entry.service,
            instance: service_entry.instance,
            major: service_entry.major,
            minor: service_entry.minor,
            ttl: service_entry.ttl,
            reliable,
            unreliable,
            from,
        });

        // Offers double as the renewal trigger: re-subscribe every
        // eventgroup we hold on this service.
        let eventgroups = self
            .subscriptions
            .iter()
            .filter(|((sub_key, _), subscription)| {
                *sub_key == key && subscription.phase != SubscriptionPhase::Failed
            })
            .map(|((_, eventgroup), _)| *eventgroup)
            .collect::<Vec<_>>();

        for eventgroup in eventgroups {
            if let Some(subscription) = self.subscriptions.get_mut(&(key, eventgroup))
                && let SubscriptionPhase::Pending { attempts, .. } = subscription.phase
            {
                subscription.phase = SubscriptionPhase::Pending {
                    attempts,
                    deadline: now + self.request_response_delay,
                };
            }

            output.push(self.build_subscribe(key, eventgroup, from, false));
        }
    }

    fn handle_stop_offer(
        &mut self,
        entry: &ServiceEntry,
        from: SocketAddr,
        now: Instant,
        events: &mut Vec<SdEvent>,
    ) {
        let key = (entry.service, entry.instance);

        if let Some(find) = self.finds.get_mut(&key) {
            find.offerer = None;
            find.fsm.on_lost(now, &mut rand::rng());
        }

        for ((sub_key, _), subscription) in self.subscriptions.iter_mut() {
            if *sub_key == key {
                subscription.phase = SubscriptionPhase::Failed;
            }
        }

        events.push(SdEvent::StopOfferReceived {
            service: entry.service,
            instance: entry.instance,
            from,
        });
    }

    fn handle_eventgroup(
        &mut self,
        entry: &EventgroupEntry,
        payload: &SdPayload,
        outer: &Entry,
        from: SocketAddr,
        events: &mut Vec<SdEvent>,
    ) {
        let key = (entry.service, entry.instance);

        match entry.kind {
            EventgroupEntryType::Subscribe => {
                let mut endpoints = SubscriberEndpoints::default();
                for option in payload.entry_options(outer) {
                    if let Some(endpoint) = option.as_endpoint()
                        && endpoint.kind == EndpointKind::Unicast
                    {
                        match endpoint.protocol {
                            TransportProtocol::Tcp => {
                                endpoints.reliable = Some(endpoint.socket_addr())
                            }
                            TransportProtocol::Udp => {
                                endpoints.unreliable = Some(endpoint.socket_addr())
                            }
                        }
                    }
                }

                events.push(if outer.is_stop() {
                    SdEvent::StopSubscribeReceived {
                        service: entry.service,
                        instance: entry.instance,
                        eventgroup: entry.eventgroup,
                        counter: entry.counter,
                        endpoints,
                        from,
                    }
                } else {
                    SdEvent::SubscribeReceived {
                        service: entry.service,
                        instance: entry.instance,
                        eventgroup: entry.eventgroup,
                        major: entry.major,
                        counter: entry.counter,
                        ttl: entry.ttl,
                        endpoints,
                        from,
                    }
                });
            }
            EventgroupEntryType::SubscribeAck => {
                let subscription = self.subscriptions.get_mut(&(key, entry.eventgroup));

                if outer.is_stop() {
                    if let Some(subscription) = subscription {
                        subscription.phase = SubscriptionPhase::Failed;
                    }

                    events.push(SdEvent::SubscribeNacked {
                        service: entry.service,
                        instance: entry.instance,
                        eventgroup: entry.eventgroup,
                    });
                } else {
                    if let Some(subscription) = subscription {
                        subscription.phase = SubscriptionPhase::Active;
                    }

                    let multicast = payload
                        .entry_options(outer)
                        .filter_map(SdOption::as_endpoint)
                        .find(|endpoint| endpoint.kind == EndpointKind::Multicast)
                        .map(|endpoint| endpoint.socket_addr());

                    events.push(SdEvent::SubscribeAcked {
                        service: entry.service,
                        instance: entry.instance,
                        eventgroup: entry.eventgroup,
                        multicast,
                    });
                }
            }
        }
    }

    /// Advance all machines past `now` and collect the due
    /// transmissions. Multicast offers and finds are batched into one
    /// frame each.
    pub fn poll(&mut self, now: Instant) -> Vec<SdMessage> {
        let mut output = Vec::new();

        let mut due_offers = Vec::new();
        for (key, offered) in self.offers.iter_mut() {
            while offered.fsm.poll(now) == Some(OfferAction::MulticastOffer) {
                due_offers.push(*key);
            }
        }

        if !due_offers.is_empty() {
            output.extend(self.build_offer_message(SdTarget::Multicast, &due_offers));
        }

        let mut due_finds = Vec::new();
        for (key, find) in self.finds.iter_mut() {
            while find.fsm.poll(now) {
                due_finds.push((*key, find.major, find.minor));
            }
        }

        if !due_finds.is_empty() {
            let message = self.build_message(SdTarget::Multicast, |payload| {
                for (key, major, minor) in &due_finds {
                    payload.insert_entry(
                        Entry::find_service(key.0, key.1, *major, *minor, codec::TTL_INFINITE),
                        &[],
                        &[],
                    );
                }
            });

            output.push(message);
        }

        // Unanswered subscriptions are repeated up to R_max times, then
        // marked failed.
        let mut retransmissions = Vec::new();
        for ((key, eventgroup), subscription) in self.subscriptions.iter_mut() {
            if let SubscriptionPhase::Pending { attempts, deadline } = subscription.phase
                && deadline <= now
            {
                if attempts >= self.client_timings.repetitions_max {
                    subscription.phase = SubscriptionPhase::Failed;
                    log::warn!(
                        "eventgroup subscription gave up: service={:#06x}, instance={:#06x}, eventgroup={:#06x}",
                        key.0,
                        key.1,
                        eventgroup,
                    );
                } else {
                    subscription.phase = SubscriptionPhase::Pending {
                        attempts: attempts + 1,
                        deadline: now + self.request_response_delay,
                    };
                    retransmissions.push((*key, *eventgroup));
                }
            }
        }

        for (key, eventgroup) in retransmissions {
            if let Some(offerer) = self.finds.get(&key).and_then(|find| find.offerer) {
                output.push(self.build_subscribe(key, eventgroup, offerer, false));
            }
        }

        output
    }

    /// The earliest point in time [`Engine::poll`] has work to do.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let offers = self.offers.values().filter_map(|offered| offered.fsm.next_deadline());
        let finds = self.finds.values().filter_map(|find| find.fsm.next_deadline());
        let subscriptions = self.subscriptions.values().filter_map(|it| match it.phase {
            SubscriptionPhase::Pending { deadline, .. } => Some(deadline),
            _ => None,
        });

        offers.chain(finds).chain(subscriptions).min()
    }

    fn detect_reboot(
        &mut self,
        from: SocketAddr,
        via_multicast: bool,
        flags: Flags,
        session: SessionId,
    ) -> bool {
        let peer = self.peers.entry((from.ip(), via_multicast));

        match peer {
            std::collections::hash_map::Entry::Occupied(mut seen) => {
                let view = seen.get_mut();
                // A reboot shows as the flag coming back while the
                // session counter restarts; a zero session alone is a
                // protocol violation, accepted with a warning.
                let rebooted = (flags.reboot && !view.reboot)
                    || (flags.reboot && view.reboot && session <= view.session);

                if session == 0 {
                    log::warn!("peer uses session id zero: address={from}");
                }

                view.session = session;
                view.reboot = flags.reboot;
                rebooted
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(PeerView {
                    session,
                    reboot: flags.reboot,
                });
                false
            }
        }
    }

    fn build_offer_message(&mut self, target: SdTarget, keys: &[ServiceKey]) -> Option<SdMessage> {
        let mut entries = Vec::new();
        for key in keys {
            let Some(offered) = self.offers.get(key) else {
                continue;
            };

            let entry = Entry::offer_service(
                key.0,
                key.1,
                offered.version.0,
                offered.version.1,
                offered.fsm.ttl(),
            );

            let mut run = Vec::new();
            if let Some(endpoint) = offered.endpoints.unreliable {
                run.push(SdOption::endpoint(endpoint, EndpointKind::Unicast, TransportProtocol::Udp));
            }

            if let Some(endpoint) = offered.endpoints.reliable {
                run.push(SdOption::endpoint(endpoint, EndpointKind::Unicast, TransportProtocol::Tcp));
            }

            entries.push((entry, run));
        }

        if entries.is_empty() {
            return None;
        }

        Some(self.build_message(target, |payload| {
            for (entry, run) in entries {
                payload.insert_entry(entry, &run, &[]);
            }
        }))
    }

    fn build_subscribe(
        &mut self,
        key: ServiceKey,
        eventgroup: EventgroupId,
        offerer: SocketAddr,
        stop: bool,
    ) -> SdMessage {
        let (major, ttl, counter, endpoints) = match self.subscriptions.get(&(key, eventgroup)) {
            Some(subscription) => (
                subscription.major,
                if stop { 0 } else { subscription.ttl },
                subscription.counter,
                subscription.endpoints,
            ),
            None => (codec::ANY_MAJOR, 0, 0, SubscriberEndpoints::default()),
        };

        let entry = Entry::subscribe(key.0, key.1, eventgroup, major, counter, ttl);

        let mut run = Vec::new();
        if let Some(endpoint) = endpoints.unreliable {
            run.push(SdOption::endpoint(endpoint, EndpointKind::Unicast, TransportProtocol::Udp));
        }

        if let Some(endpoint) = endpoints.reliable {
            run.push(SdOption::endpoint(endpoint, EndpointKind::Unicast, TransportProtocol::Tcp));
        }

        self.build_message(SdTarget::Unicast(offerer), |payload| {
            payload.insert_entry(entry, &run, &[]);
        })
    }

    fn build_message(
        &mut self,
        target: SdTarget,
        fill: impl FnOnce(&mut SdPayload),
    ) -> SdMessage {
        let session = self.sessions.entry(target).or_insert(OutgoingSession {
            last: 0,
            wrapped: false,
        });

        session.last = match session.last.checked_add(1) {
            Some(next) => next,
            None => {
                session.wrapped = true;
                1
            }
        };

        let mut payload = SdPayload::new(Flags {
            // The flag stays set from reboot until the counter wraps.
            reboot: !session.wrapped,
            unicast: true,
            explicit_initial_data: false,
        });

        fill(&mut payload);

        SdMessage {
            target,
            payload,
            session: session.last,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(
            ServerTimings {
                initial_delay_min: Duration::from_millis(50),
                initial_delay_max: Duration::from_millis(50),
                repetitions_base_delay: Duration::from_millis(100),
                repetitions_max: 3,
                cyclic_offer_delay: Duration::from_secs(1),
                ttl: 300,
            },
            ClientTimings {
                initial_delay_min: Duration::from_millis(10),
                initial_delay_max: Duration::from_millis(10),
                repetitions_base_delay: Duration::from_millis(100),
                repetitions_max: 2,
                subscription_ttl: 3,
            },
            Duration::from_millis(500),
        )
    }

    fn peer() -> SocketAddr {
        "192.168.1.20:30490".parse().unwrap()
    }

    fn offer_payload(reboot: bool) -> SdPayload {
        let mut payload = SdPayload::new(Flags {
            reboot,
            unicast: true,
            explicit_initial_data: false,
        });
        payload.insert_entry(
            Entry::offer_service(0x1111, 0x0001, 1, 0, 300),
            &[SdOption::ipv4_endpoint("192.168.1.20".parse().unwrap(), TransportProtocol::Udp, 40000)],
            &[],
        );
        payload
    }

    #[test]
    fn find_in_initial_wait_is_answered_unicast_only() {
        let mut engine = engine();
        let now = Instant::now();

        engine.offer(
            (0x1111, 0x0001),
            (1, 0),
            OfferedEndpoints {
                unreliable: Some("192.168.1.5:40000".parse().unwrap()),
                ..Default::default()
            },
            now,
        );

        let mut find = SdPayload::new(Flags::default());
        find.insert_entry(Entry::find_service(0x1111, 0x0001, 1, 0, 300), &[], &[]);

        let (_, output) = engine.handle_payload(peer(), true, &find, 1, now);

        assert_eq!(output.len(), 1);
        assert_eq!(output[0].target, SdTarget::Unicast(peer()));

        // Nothing is multicast until the initial wait elapses.
        assert!(engine.poll(now + Duration::from_millis(49)).is_empty());

        let offers = engine.poll(now + Duration::from_millis(50));
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].target, SdTarget::Multicast);
    }

    #[test]
    fn offers_feed_the_find_machine_and_events() {
        let mut engine = engine();
        let now = Instant::now();

        engine.request((0x1111, 0x0001), 1, 0, now);

        let (events, _) = engine.handle_payload(peer(), true, &offer_payload(true), 1, now);

        assert_eq!(events.len(), 1);
        let SdEvent::OfferReceived { service, unreliable, ttl, .. } = &events[0] else {
            panic!("expected an offer event");
        };

        assert_eq!(*service, 0x1111);
        assert_eq!(*ttl, 300);
        assert_eq!(*unreliable, Some("192.168.1.20:40000".parse().unwrap()));

        // The search is over, no more finds go out.
        assert!(engine.poll(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn session_reset_with_reboot_flag_reports_a_reboot() {
        let mut engine = engine();
        let now = Instant::now();

        let (events, _) = engine.handle_payload(peer(), true, &offer_payload(true), 100, now);
        assert_eq!(events.len(), 1);

        // Same counter direction going backwards with the flag set.
        let (events, _) = engine.handle_payload(peer(), true, &offer_payload(true), 1, now);
        assert!(matches!(events[0], SdEvent::PeerRebooted { .. }));
    }

    #[test]
    fn subscription_is_repeated_then_gives_up() {
        let mut engine = engine();
        let now = Instant::now();

        engine.request((0x1111, 0x0001), 1, 0, now);
        engine.handle_payload(peer(), true, &offer_payload(true), 1, now);

        let message = engine.subscribe(
            (0x1111, 0x0001),
            0x0005,
            1,
            SubscriberEndpoints {
                unreliable: Some("192.168.1.5:40001".parse().unwrap()),
                ..Default::default()
            },
            now,
        );
        assert!(message.is_some());

        // Two repetitions, then the subscription fails.
        assert_eq!(engine.poll(now + Duration::from_millis(500)).len(), 1);
        assert_eq!(engine.poll(now + Duration::from_millis(1000)).len(), 1);
        assert!(engine.poll(now + Duration::from_millis(1500)).is_empty());

        let ack = {
            let mut payload = SdPayload::new(Flags::default());
            payload.insert_entry(Entry::subscribe_ack(0x1111, 0x0001, 0x0005, 1, 0, 3), &[], &[]);
            payload
        };

        // A (late) ack still flips the subscription to active.
        let (events, _) = engine.handle_payload(peer(), false, &ack, 2, now);
        assert!(matches!(events[0], SdEvent::SubscribeAcked { multicast: None, .. }));
    }

    #[test]
    fn outgoing_reboot_flag_clears_after_wrap() {
        let mut engine = engine();

        let first = engine.build_message(SdTarget::Multicast, |_| {});
        assert!(first.payload.flags.reboot);
        assert_eq!(first.session, 1);

        for _ in 0..u16::MAX {
            engine.build_message(SdTarget::Multicast, |_| {});
        }

        let wrapped = engine.build_message(SdTarget::Multicast, |_| {});
        assert!(!wrapped.payload.flags.reboot);
        assert_eq!(wrapped.session, 2);
    }
}
