//! ## The local IPC host
//!
//! Guests connect over a Unix domain stream socket, get their client id
//! assigned, and speak the command protocol from the codec crate. The
//! host reads peer credentials off the socket at accept time; they feed
//! the policy engine for everything the guest does later. A watchdog
//! ping rides on the same channel, and a silent guest is torn down the
//! same way a crashed one is.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use anyhow::Result;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::mpsc::{UnboundedSender, unbounded_channel},
    time::{Instant, interval},
};

use codec::{
    ClientId, ILLEGAL_CLIENT,
    command::{Availability, Command, CommandStatus, RoutingEntry},
};
use service::{discovery::OfferedEndpoints, policy::Credentials};

use crate::server::{Router, sd::SdCommand};

/// The connected guests and the senders their commands leave through.
#[derive(Clone, Default)]
pub struct GuestBook(Arc<RwLock<AHashMap<ClientId, UnboundedSender<Bytes>>>>);

impl GuestBook {
    pub fn register(&self, client: ClientId, sender: UnboundedSender<Bytes>) {
        self.0.write().insert(client, sender);
    }

    pub fn remove(&self, client: ClientId) {
        self.0.write().remove(&client);
    }

    /// Whether `sender` is the channel currently registered for the
    /// client. A reconnect re-registers the id; the superseded
    /// connection must not tear the reused identity down on its way
    /// out.
    pub fn owns(&self, client: ClientId, sender: &UnboundedSender<Bytes>) -> bool {
        self.0
            .read()
            .get(&client)
            .is_some_and(|registered| registered.same_channel(sender))
    }

    /// Send one command to one guest. A gone guest is not an error; its
    /// teardown is already on the way.
    pub fn send(&self, client: ClientId, command: &Command) -> bool {
        let mut bytes = BytesMut::new();
        command.encode(ILLEGAL_CLIENT, &mut bytes);

        self.0
            .read()
            .get(&client)
            .is_some_and(|sender| sender.send(bytes.freeze()).is_ok())
    }

    /// Broadcast one command to every guest.
    pub fn broadcast(&self, command: &Command) {
        let mut bytes = BytesMut::new();
        command.encode(ILLEGAL_CLIENT, &mut bytes);
        let bytes = bytes.freeze();

        for sender in self.0.read().values() {
            let _ = sender.send(bytes.clone());
        }
    }
}

/// Accept loop of the routing host's local endpoint.
pub async fn listen(router: Router) -> Result<()> {
    let path = router.config.local_socket_path();

    // A stale socket file from a crashed predecessor would fail the
    // bind; the bind itself is what elects the routing host.
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;

    log::info!("local endpoint up: path={path}");

    loop {
        let (socket, _) = listener.accept().await?;
        tokio::spawn(guest(router.clone(), socket));
    }
}

async fn guest(router: Router, mut socket: UnixStream) {
    let (credentials, pid) = match socket.peer_cred() {
        Ok(cred) => (
            Credentials {
                uid: cred.uid(),
                gid: cred.gid(),
            },
            cred.pid().unwrap_or_default() as u32,
        ),
        Err(e) => {
            log::warn!("guest without credentials rejected: err={e}");
            return;
        }
    };

    let (sender, mut receiver) = unbounded_channel::<Bytes>();

    let watchdog_interval = Duration::from_millis(router.config.watchdog.interval);
    let watchdog_timeout = Duration::from_millis(router.config.watchdog.timeout);
    let mut ping = interval(watchdog_interval);
    let mut last_alive = Instant::now();

    let mut buffer = BytesMut::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let mut client: Option<ClientId> = None;

    'connection: loop {
        tokio::select! {
            read = socket.read(&mut chunk) => {
                let size = match read {
                    Ok(0) | Err(_) => break 'connection,
                    Ok(size) => size,
                };

                last_alive = Instant::now();
                buffer.extend_from_slice(&chunk[..size]);

                loop {
                    match Command::decode(&buffer) {
                        Ok((_, command, consumed)) => {
                            buffer.advance(consumed);

                            if !dispatch(&router, &mut client, &credentials, pid, &sender, command) {
                                break 'connection;
                            }
                        }
                        Err(e) if e.is_incomplete() => break,
                        Err(e) => {
                            log::warn!("guest sent a malformed command: pid={pid}, err={e}");
                            break 'connection;
                        }
                    }
                }
            }
            Some(bytes) = receiver.recv() => {
                if socket.write_all(&bytes).await.is_err() {
                    break 'connection;
                }
            }
            _ = ping.tick() => {
                if last_alive.elapsed() > watchdog_timeout {
                    log::warn!("guest missed the watchdog: client={:#06x?}, pid={pid}", client);
                    break 'connection;
                }

                let mut bytes = BytesMut::new();
                Command::Ping.encode(ILLEGAL_CLIENT, &mut bytes);
                if socket.write_all(&bytes).await.is_err() {
                    break 'connection;
                }
            }
        }
    }

    if let Some(client) = client
        && router.guests.owns(client, &sender)
    {
        teardown(&router, client);
    }
}

/// Remove every trace of a guest, however it left.
pub fn teardown(router: &Router, client: ClientId) {
    router.guests.remove(client);

    for (key, _) in router.service.release_client(client) {
        router.send_sd(SdCommand::StopOffer { key });
    }
}

/// Handle one command from a guest. Returns `false` to drop the
/// connection.
fn dispatch(
    router: &Router,
    client: &mut Option<ClientId>,
    credentials: &Credentials,
    pid: u32,
    sender: &UnboundedSender<Bytes>,
    command: Command,
) -> bool {
    // Everything except the hello requires an assigned identity.
    let assigned = match (&command, *client) {
        (Command::AssignClient { .. }, _) => ILLEGAL_CLIENT,
        (_, Some(assigned)) => assigned,
        (_, None) => {
            log::warn!("command before client assignment: pid={pid}");
            return false;
        }
    };

    match command {
        Command::AssignClient { name } => {
            let minted = router.service.assign_client(&name, pid, *credentials);

            if let Some(minted) = minted {
                router.guests.register(minted, sender.clone());
                *client = Some(minted);
            }

            send_to(sender, &Command::AssignClientAck {
                assigned: minted.unwrap_or(ILLEGAL_CLIENT),
            })
        }
        Command::RegisterApplication => {
            // A fresh guest gets the full availability picture.
            send_to(sender, &Command::RoutingInfo {
                entries: router.routing_snapshot(),
            })
        }
        Command::DeregisterApplication => false,
        Command::OfferService { service, instance, major, minor } => {
            let key = (service, instance);
            let status = router.service.offer(assigned, key, (major, minor));

            if status == CommandStatus::Ok {
                router.send_sd(SdCommand::Offer {
                    key,
                    version: (major, minor),
                    endpoints: router.offered_endpoints(service, instance),
                });
            }

            send_to(sender, &Command::OfferServiceAck { service, instance, status })
        }
        Command::StopOfferService { service, instance, major, minor } => {
            let key = (service, instance);
            if router.service.stop_offer(assigned, key, (major, minor)) {
                router.send_sd(SdCommand::StopOffer { key });
            }

            true
        }
        Command::RequestService { service, instance, major, minor } => {
            let key = (service, instance);

            match router.service.request(assigned, key, (major, minor)) {
                Ok(available) => {
                    if !available {
                        router.send_sd(SdCommand::Request { key, major, minor });
                    }

                    send_to(sender, &Command::RoutingInfo {
                        entries: vec![RoutingEntry {
                            service,
                            instance,
                            major,
                            minor,
                            availability: if available {
                                Availability::Available
                            } else {
                                Availability::Unavailable
                            },
                        }],
                    })
                }
                Err(status) => {
                    log::warn!(
                        "service request refused: client={assigned:#06x}, service={service:#06x}, status={status:?}"
                    );
                    true
                }
            }
        }
        Command::ReleaseService { service, instance } => {
            let key = (service, instance);
            router.service.release_request(assigned, key);

            if router.service.routing().requesters(key).is_empty() {
                router.send_sd(SdCommand::Release { key });
            }

            true
        }
        Command::Subscribe { service, instance, eventgroup, major, event } => {
            let key = (service, instance, eventgroup);
            let ttl = router.config.service_discovery.ttl;

            match router.service.subscribe_local(assigned, key, ttl) {
                CommandStatus::Ok => {
                    let provider = router
                        .service
                        .routing()
                        .resolve((service, instance), codec::ANY_MAJOR, codec::ANY_MINOR);

                    match provider {
                        // A locally provided eventgroup acks right away.
                        Some(service::routing::Provider::Local { .. }) => {
                            send_to(sender, &Command::SubscribeAck {
                                service,
                                instance,
                                eventgroup,
                                event,
                            })
                        }
                        // Remote or not yet seen: the discovery side
                        // answers once the offerer does.
                        _ => {
                            router.send_sd(SdCommand::Subscribe {
                                key: (service, instance),
                                eventgroup,
                                major,
                            });
                            true
                        }
                    }
                }
                _ => send_to(sender, &Command::SubscribeNack {
                    service,
                    instance,
                    eventgroup,
                    event,
                }),
            }
        }
        Command::Unsubscribe { service, instance, eventgroup, .. } => {
            let key = (service, instance, eventgroup);
            router.service.unsubscribe_local(assigned, key);

            if router.service.subscriptions().subscribers(&key).is_empty() {
                router.send_sd(SdCommand::Unsubscribe {
                    key: (service, instance),
                    eventgroup,
                });
            }

            true
        }
        Command::SendMessage { instance, frame, .. } => {
            // The credentials checked against the policy are the ones
            // read from the socket, whatever the guest put in the
            // command.
            router.relay_from_guest(assigned, instance, frame);
            true
        }
        Command::Ping => send_to(sender, &Command::Pong),
        Command::Pong => true,
        Command::AssignClientAck { .. }
        | Command::OfferServiceAck { .. }
        | Command::SubscribeAck { .. }
        | Command::SubscribeNack { .. }
        | Command::RoutingInfo { .. } => {
            log::warn!("unexpected host command from guest: client={assigned:#06x}");
            true
        }
    }
}

fn send_to(sender: &UnboundedSender<Bytes>, command: &Command) -> bool {
    let mut bytes = BytesMut::new();
    command.encode(ILLEGAL_CLIENT, &mut bytes);
    sender.send(bytes.freeze()).is_ok()
}

impl Router {
    /// Availability snapshot for a newly registered guest.
    pub fn routing_snapshot(&self) -> Vec<RoutingEntry> {
        self.service
            .routing()
            .provided()
            .into_iter()
            .map(|((service, instance), (major, minor))| RoutingEntry {
                service,
                instance,
                major,
                minor,
                availability: Availability::Available,
            })
            .collect()
    }

    /// Endpoints announced with an offer of a local service, from the
    /// service's configuration block.
    pub fn offered_endpoints(&self, service: u16, instance: u16) -> OfferedEndpoints {
        let Some(entry) = self.config.find_service(service, instance) else {
            return OfferedEndpoints::default();
        };

        OfferedEndpoints {
            unreliable: entry
                .unreliable
                .map(|port| std::net::SocketAddr::new(self.config.unicast, port)),
            reliable: entry
                .reliable
                .as_ref()
                .map(|reliable| std::net::SocketAddr::new(self.config.unicast, reliable.port)),
            multicast: entry.multicast.as_ref().map(|multicast| {
                std::net::SocketAddr::new(multicast.address.into(), multicast.port)
            }),
        }
    }
}
