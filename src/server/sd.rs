//! ## The discovery driver
//!
//! One task owns the SD sockets and the [`Engine`]. Commands from the
//! control side (offers, requests, subscriptions of local guests) come
//! in over a channel; received SD frames and elapsed timers come from
//! the sockets and the engine's own wakeup schedule. Everything the
//! engine decides leaves through here as well.
//!
//! Two sockets split the directions: one bound to the unicast address
//! receives what peers send us directly, one bound to the wildcard
//! address and joined to the discovery group receives the multicast
//! traffic. Reboot detection tracks the two directions separately.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use bytes::BytesMut;
use tokio::{net::UdpSocket, sync::mpsc::UnboundedReceiver, task::JoinHandle, time::sleep_until};

use codec::{
    EventgroupId, MajorVersion, MinorVersion, message::{Header, Message, MessageType},
    sd::SdPayload,
};
use service::{
    discovery::{
        Engine, OfferedEndpoints, SdEvent, SdMessage, SdTarget, SubscriberEndpoints,
    },
    eventgroups::Subscriber,
    routing::{ServiceKey, Version},
};

use crate::server::{Router, transport::udp};

/// Control side input to the discovery driver.
#[derive(Debug, Clone)]
pub enum SdCommand {
    Offer {
        key: ServiceKey,
        version: Version,
        endpoints: OfferedEndpoints,
    },
    StopOffer {
        key: ServiceKey,
    },
    Request {
        key: ServiceKey,
        major: MajorVersion,
        minor: MinorVersion,
    },
    Release {
        key: ServiceKey,
    },
    Subscribe {
        key: ServiceKey,
        eventgroup: EventgroupId,
        major: MajorVersion,
    },
    Unsubscribe {
        key: ServiceKey,
        eventgroup: EventgroupId,
    },
}

fn park() -> tokio::time::Instant {
    tokio::time::Instant::now() + std::time::Duration::from_secs(3600)
}

/// Multicast listeners keyed by group, each alive as long as at least
/// one subscription was acked onto it.
#[derive(Default)]
struct JoinedGroups {
    groups: AHashMap<(Ipv4Addr, u16), (JoinHandle<()>, AHashSet<(ServiceKey, EventgroupId)>)>,
}

impl JoinedGroups {
    /// Join on the first subscription acked onto the group.
    fn join(&mut self, router: &Router, group: Ipv4Addr, port: u16, owner: (ServiceKey, EventgroupId)) {
        let entry = self.groups.entry((group, port)).or_insert_with(|| {
            let router = router.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = udp::multicast_listener(router, group, port).await {
                    log::error!("multicast listener failed: group={group}:{port}, err={e}");
                }
            });

            (handle, AHashSet::new())
        });

        entry.1.insert(owner);
    }

    /// Leave groups nothing subscribes through anymore.
    fn release(&mut self, owner: (ServiceKey, EventgroupId)) {
        self.groups.retain(|(group, port), (handle, owners)| {
            owners.remove(&owner);

            if owners.is_empty() {
                log::info!("leaving notification group: group={group}:{port}");
                handle.abort();
                false
            } else {
                true
            }
        });
    }
}

/// Bind a UDP socket with address reuse, so the wildcard multicast
/// socket can share the discovery port with the unicast one.
fn bind_reusable(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

pub async fn run(
    router: Router,
    mut commands: UnboundedReceiver<SdCommand>,
    notification_endpoint: SocketAddr,
) -> Result<()> {
    let discovery = &router.config.service_discovery;
    let group = discovery.socket_addr();

    let unicast = bind_reusable(SocketAddr::new(router.config.unicast, discovery.port))?;
    let multicast = bind_reusable(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        discovery.port,
    ))?;

    let interface = match router.config.unicast {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };

    if let Err(e) = multicast.join_multicast_v4(discovery.multicast, interface) {
        log::warn!("joining the discovery group failed: group={group}, err={e}");
    }

    log::info!(
        "service discovery up: unicast={}, group={group}",
        unicast.local_addr()?
    );

    let mut engine = Engine::new(
        discovery.server_timings(),
        discovery.client_timings(),
        std::time::Duration::from_millis(discovery.request_response_delay),
    );

    // Notification groups we listen on, with the subscriptions that
    // keep each of them alive.
    let mut joined = JoinedGroups::default();

    let mut unicast_buffer = BytesMut::zeroed(codec::MAX_UDP_MESSAGE_SIZE);
    let mut multicast_buffer = BytesMut::zeroed(codec::MAX_UDP_MESSAGE_SIZE);

    loop {
        let wakeup = engine
            .next_wakeup()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(park);

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };

                let now = std::time::Instant::now();
                match command {
                    SdCommand::Offer { key, version, endpoints } => {
                        engine.offer(key, version, endpoints, now);
                    }
                    SdCommand::StopOffer { key } => {
                        if let Some(message) = engine.stop_offer(key) {
                            transmit(&unicast, group, &message).await;
                        }
                    }
                    SdCommand::Request { key, major, minor } => {
                        engine.request(key, major, minor, now);
                    }
                    SdCommand::Release { key } => {
                        engine.release(key);
                    }
                    SdCommand::Subscribe { key, eventgroup, major } => {
                        let endpoints = SubscriberEndpoints {
                            unreliable: Some(notification_endpoint),
                            reliable: None,
                        };

                        if let Some(message) = engine.subscribe(key, eventgroup, major, endpoints, now) {
                            transmit(&unicast, group, &message).await;
                        }
                    }
                    SdCommand::Unsubscribe { key, eventgroup } => {
                        joined.release((key, eventgroup));

                        if let Some(message) = engine.unsubscribe(key, eventgroup) {
                            transmit(&unicast, group, &message).await;
                        }
                    }
                }
            }
            result = unicast.recv_from(&mut unicast_buffer) => {
                if let Ok((size, from)) = result {
                    receive(&router, &mut engine, &unicast, group, &mut joined, from, false, &unicast_buffer[..size]).await;
                }
            }
            result = multicast.recv_from(&mut multicast_buffer) => {
                if let Ok((size, from)) = result {
                    receive(&router, &mut engine, &unicast, group, &mut joined, from, true, &multicast_buffer[..size]).await;
                }
            }
            _ = sleep_until(wakeup) => {
                for message in engine.poll(std::time::Instant::now()) {
                    transmit(&unicast, group, &message).await;
                }
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn receive(
    router: &Router,
    engine: &mut Engine,
    socket: &UdpSocket,
    group: SocketAddr,
    joined: &mut JoinedGroups,
    from: SocketAddr,
    via_multicast: bool,
    mut datagram: &[u8],
) {
    while !datagram.is_empty() {
        let (message, consumed) = match Message::decode(datagram) {
            Ok(it) => it,
            Err(e) => {
                log::debug!("malformed sd datagram: from={from}, err={e}");
                return;
            }
        };

        datagram = &datagram[consumed..];

        if !message.header.is_sd() {
            continue;
        }

        let payload = match SdPayload::decode(message.payload) {
            Ok(it) => it,
            Err(e) => {
                log::warn!("malformed sd payload: from={from}, err={e}");
                continue;
            }
        };

        let (events, output) = engine.handle_payload(
            from,
            via_multicast,
            &payload,
            message.header.session,
            std::time::Instant::now(),
        );

        for event in events {
            apply_event(router, engine, socket, group, joined, event).await;
        }

        for reply in output {
            transmit(socket, group, &reply).await;
        }
    }
}

async fn apply_event(
    router: &Router,
    engine: &mut Engine,
    socket: &UdpSocket,
    group: SocketAddr,
    joined: &mut JoinedGroups,
    event: SdEvent,
) {
    match event {
        SdEvent::PeerRebooted { from } => {
            log::info!("peer reboot detected: address={from}");
            router.service.apply_peer_reboot(from);
        }
        SdEvent::OfferReceived {
            service,
            instance,
            major,
            minor,
            ttl,
            reliable,
            unreliable,
            ..
        } => {
            router.service.apply_remote_offer(
                (service, instance),
                (major, minor),
                reliable,
                unreliable,
                ttl,
            );
        }
        SdEvent::StopOfferReceived { service, instance, .. } => {
            router.service.apply_remote_stop((service, instance));
        }
        SdEvent::SubscribeReceived {
            service,
            instance,
            eventgroup,
            major,
            counter,
            ttl,
            endpoints,
            from,
        } => {
            let subscriber = endpoints
                .unreliable
                .map(|endpoint| (endpoint, false))
                .or(endpoints.reliable.map(|endpoint| (endpoint, true)));

            let accepted = match subscriber {
                Some((endpoint, reliable)) => router.service.remote_subscribe(
                    (service, instance, eventgroup),
                    endpoint,
                    reliable,
                    counter,
                    ttl,
                ),
                None => false,
            };

            let reply = engine.subscribe_response(
                from, service, instance, eventgroup, major, counter, ttl, accepted,
            );
            transmit(socket, group, &reply).await;
        }
        SdEvent::StopSubscribeReceived {
            service,
            instance,
            eventgroup,
            endpoints,
            ..
        } => {
            if let Some(endpoint) = endpoints.unreliable {
                router
                    .service
                    .remote_unsubscribe((service, instance, eventgroup), endpoint, false);
            }

            if let Some(endpoint) = endpoints.reliable {
                router
                    .service
                    .remote_unsubscribe((service, instance, eventgroup), endpoint, true);
            }
        }
        SdEvent::SubscribeAcked {
            service,
            instance,
            eventgroup,
            multicast,
        } => {
            // Notifications may arrive on a multicast group named in
            // the ack; listen there as long as a subscription needs it.
            if let Some(SocketAddr::V4(addr)) = multicast {
                joined.join(
                    router,
                    *addr.ip(),
                    addr.port(),
                    ((service, instance), eventgroup),
                );
            }

            notify_local_subscribers(router, (service, instance, eventgroup), true);
        }
        SdEvent::SubscribeNacked {
            service,
            instance,
            eventgroup,
        } => {
            log::warn!(
                "eventgroup subscription refused by offerer: service={service:#06x}, instance={instance:#06x}, eventgroup={eventgroup:#06x}"
            );

            joined.release(((service, instance), eventgroup));
            notify_local_subscribers(router, (service, instance, eventgroup), false);
        }
    }
}

/// Relay the outcome of a remote subscription to the guests holding it.
fn notify_local_subscribers(router: &Router, key: (u16, u16, EventgroupId), acked: bool) {
    let command = if acked {
        codec::command::Command::SubscribeAck {
            service: key.0,
            instance: key.1,
            eventgroup: key.2,
            event: codec::ANY_EVENT,
        }
    } else {
        codec::command::Command::SubscribeNack {
            service: key.0,
            instance: key.1,
            eventgroup: key.2,
            event: codec::ANY_EVENT,
        }
    };

    for subscriber in router.service.subscriptions().subscribers(&key) {
        if let Subscriber::Local(client) = subscriber {
            router.guests.send(client, &command);
        }
    }
}

/// Wrap an engine message into a SOME/IP frame and send it.
async fn transmit(socket: &UdpSocket, group: SocketAddr, message: &SdMessage) {
    let mut body = BytesMut::new();
    message.payload.encode(&mut body);

    let mut header = Header::new(codec::sd::SD_SERVICE, codec::sd::SD_METHOD, MessageType::Notification);
    header.session = message.session;
    header.interface_version = 0x01;

    let mut frame = BytesMut::new();
    Message {
        header,
        payload: &body,
    }
    .encode(&mut frame);

    let target = match message.target {
        SdTarget::Multicast => group,
        SdTarget::Unicast(addr) => addr,
    };

    if let Err(e) = socket.send_to(&frame, target).await {
        log::warn!("sd send failed: target={target}, err={e}");
    }
}
