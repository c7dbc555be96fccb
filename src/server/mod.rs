pub mod exchanger;
pub mod local;
pub mod queue;
pub mod sd;
pub mod transport;

use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use ahash::AHashMap;
use anyhow::Result;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::mpsc::{UnboundedSender, unbounded_channel}};

use codec::{
    ClientId, EventId, ILLEGAL_CLIENT, InstanceId, ServiceId,
    command::Command,
    message::{Header, Message, MessageType, ReturnCode},
};
use service::{Route, Service, events::DebounceState, eventgroups::Subscriber};

use crate::{
    config::Config,
    observer::Observer,
    server::{
        exchanger::{Exchanger, Outbound, SendError},
        local::GuestBook,
        sd::SdCommand,
        transport::{CLIENT_PORT_KEY, UdpPorts, tcp, udp},
    },
    statistics::Statistics,
};

/// Everything an endpoint or control task needs to route: the shared
/// state plus the handles into the other tasks. Cheap to clone, one per
/// task.
#[derive(Clone)]
pub struct Router {
    pub config: Arc<Config>,
    pub service: Arc<Service<Observer>>,
    pub statistics: Statistics,
    pub exchanger: Exchanger,
    pub guests: GuestBook,
    pub udp: UdpPorts,
    sd: UnboundedSender<SdCommand>,
    debounce: Arc<Mutex<AHashMap<(ServiceId, InstanceId, EventId), DebounceState>>>,
}

/// Bring up every endpoint the configuration names and the discovery
/// driver, and return the router handle they all share.
pub async fn start(
    config: &Arc<Config>,
    statistics: &Statistics,
    service: &Arc<Service<Observer>>,
    guests: &GuestBook,
) -> Result<Router> {
    let (sd_sender, sd_receiver) = unbounded_channel();

    let router = Router {
        config: config.clone(),
        service: service.clone(),
        statistics: statistics.clone(),
        exchanger: Exchanger::default(),
        guests: guests.clone(),
        udp: UdpPorts::default(),
        sd: sd_sender,
        debounce: Arc::new(Mutex::new(AHashMap::new())),
    };

    // The local IPC acceptor elects the routing host: the first binder
    // wins, everybody else stays a guest.
    {
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = local::listen(router).await {
                log::error!("local endpoint failed: err={e}");
            }
        });
    }

    // One endpoint task per configured service port.
    let mut udp_ports = HashSet::new();
    let mut tcp_ports = HashSet::new();
    for entry in &config.services {
        if let Some(port) = entry.unreliable
            && udp_ports.insert(port)
        {
            let router = router.clone();
            let bind = SocketAddr::new(config.unicast, port);
            tokio::spawn(async move {
                if let Err(e) = udp::endpoint(router, bind, port).await {
                    log::error!("udp endpoint failed: bind={bind}, err={e}");
                }
            });
        }

        if let Some(reliable) = &entry.reliable
            && tcp_ports.insert(reliable.port)
        {
            let router = router.clone();
            let port = reliable.port;
            let magic_cookies = reliable.enable_magic_cookies;
            tokio::spawn(async move {
                if let Err(e) = tcp::listener(router, port, magic_cookies).await {
                    log::error!("tcp endpoint failed: port={port}, err={e}");
                }
            });
        }
    }

    // The shared client socket carries requests towards remote services
    // and receives their responses and unicast notifications. Its
    // ephemeral port is what subscriptions announce as notification
    // endpoint, so it is bound here.
    let client_socket = UdpSocket::bind(SocketAddr::new(config.unicast, 0)).await?;
    let notification_endpoint = client_socket.local_addr()?;

    {
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = udp::run(router, client_socket, CLIENT_PORT_KEY).await {
                log::error!("udp client endpoint failed: err={e}");
            }
        });
    }

    if config.service_discovery.enable {
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = sd::run(router, sd_receiver, notification_endpoint).await {
                log::error!("service discovery failed: err={e}");
            }
        });
    } else {
        drop(sd_receiver);
    }

    Ok(router)
}

impl Router {
    pub fn send_sd(&self, command: SdCommand) {
        let _ = self.sd.send(command);
    }

    /// Entry point of every non-discovery frame received from the
    /// network.
    pub fn handle_network_message(
        &self,
        local_port: u16,
        reliable: bool,
        from: SocketAddr,
        message: &Message<'_>,
    ) {
        let header = &message.header;

        if header.is_sd() {
            // Discovery rides its own sockets; an SD frame on a service
            // endpoint is noise.
            return;
        }

        // Frames do not carry the instance; it follows from the port
        // they arrived on, or from the peer's port for messages coming
        // back from a remote service.
        let instance = self
            .config
            .instance_on_port(header.service, local_port, reliable)
            .or_else(|| self.config.instance_on_port(header.service, from.port(), reliable));

        let Some(instance) = instance else {
            log::debug!(
                "no instance for frame: service={:#06x}, port={local_port}, from={from}",
                header.service
            );
            return;
        };

        if header.message_type == MessageType::Notification {
            // A remote offerer notifies our subscribed guests.
            let eventgroups = self.config.eventgroups_of(header.service, instance, header.method);
            let targets = self.service.notification_targets((header.service, instance), &eventgroups);

            if !targets.is_empty() {
                let frame = reencode(message);
                for target in targets {
                    if let Subscriber::Local(client) = target {
                        self.guests.send(client, &Command::SendMessage {
                            instance,
                            frame: frame.clone(),
                            uid: 0,
                            gid: 0,
                        });
                    }
                }
            }

            return;
        }

        match self.service.route_inbound(instance, header, from, reliable) {
            Some(Route::Local { client }) => {
                self.guests.send(client, &Command::SendMessage {
                    instance,
                    frame: reencode(message),
                    uid: 0,
                    gid: 0,
                });
            }
            // With forwarding enabled the host relays between two
            // remote peers without touching the frame.
            Some(Route::Remote { endpoint, reliable }) => {
                let item = Outbound {
                    bytes: reencode(message).into(),
                    flush: true,
                };

                if reliable {
                    self.send_reliable(endpoint, item);
                } else {
                    self.send_unreliable(header, instance, endpoint, item);
                }
            }
            None => {
                log::debug!(
                    "dropping unroutable frame: service={:#06x}, method={:#06x}, from={from}",
                    header.service,
                    header.method
                );
            }
        }
    }

    /// Relay a frame a guest submitted over local IPC. Access is
    /// checked against the credentials the guest connected with.
    pub fn relay_from_guest(&self, sender: ClientId, instance: InstanceId, mut frame: Vec<u8>) {
        let header = match Message::decode(&frame) {
            Ok((message, _)) => message.header,
            Err(e) => {
                log::warn!("guest sent a malformed frame: client={sender:#06x}, err={e}");
                return;
            }
        };

        if header.message_type == MessageType::Notification {
            self.distribute_notification(sender, instance, frame, &header);
            return;
        }

        match self.service.route_from_guest(sender, instance, &header) {
            Ok((route, session)) => {
                if let Some(session) = session {
                    frame[10..12].copy_from_slice(&session.to_be_bytes());
                }

                match route {
                    Route::Local { client } => {
                        self.guests.send(client, &Command::SendMessage {
                            instance,
                            frame,
                            uid: 0,
                            gid: 0,
                        });
                    }
                    Route::Remote { endpoint, reliable } => {
                        let item = Outbound {
                            bytes: frame.into(),
                            flush: true,
                        };

                        let queued = if reliable {
                            self.send_reliable(endpoint, item)
                        } else {
                            self.send_unreliable(&header, instance, endpoint, item)
                        };

                        // Backpressure: an overflowing endpoint queue
                        // bounces requests instead of blocking.
                        if !queued && header.message_type.expects_response() {
                            self.send_error_response(
                                sender,
                                instance,
                                &header,
                                ReturnCode::NotReachable,
                            );
                        }
                    }
                }
            }
            Err(return_code) => {
                if header.message_type.expects_response() {
                    self.send_error_response(sender, instance, &header, return_code);
                } else {
                    log::debug!(
                        "dropping refused frame: client={sender:#06x}, service={:#06x}, code={return_code:?}",
                        header.service
                    );
                }
            }
        }
    }

    /// Distribute a notification published by a local offerer.
    fn distribute_notification(
        &self,
        sender: ClientId,
        instance: InstanceId,
        mut frame: Vec<u8>,
        header: &Header,
    ) {
        let key = (header.service, instance);
        let event = header.method;

        let eventgroups = self.config.eventgroups_of(header.service, instance, event);
        if eventgroups.is_empty() {
            log::debug!(
                "notification without eventgroup: client={sender:#06x}, event={event:#06x}"
            );
            return;
        }

        // Per event debounce filter.
        if let Some(debounce) = self
            .config
            .find_service(header.service, instance)
            .and_then(|entry| entry.events.iter().find(|it| it.event == event))
            .and_then(|it| it.debounce.as_ref())
        {
            let mut states = self.debounce.lock();
            let state = states.entry((header.service, instance, event)).or_default();

            if !debounce.filter().accepts(state, &frame[16..], std::time::Instant::now()) {
                return;
            }
        }

        // Notifications carry no client and a per event session.
        frame[8..10].copy_from_slice(&ILLEGAL_CLIENT.to_be_bytes());
        let session = self
            .service
            .pending()
            .next_session(ILLEGAL_CLIENT, header.service, instance, event);
        frame[10..12].copy_from_slice(&session.to_be_bytes());

        let multicast = self
            .config
            .find_service(header.service, instance)
            .and_then(|entry| entry.multicast.as_ref())
            .map(|it| SocketAddr::new(it.address.into(), it.port));

        let mut multicast_sent = false;
        for target in self.service.notification_targets(key, &eventgroups) {
            match target {
                Subscriber::Local(client) => {
                    self.guests.send(client, &Command::SendMessage {
                        instance,
                        frame: frame.clone(),
                        uid: 0,
                        gid: 0,
                    });
                }
                Subscriber::Remote { endpoint, reliable } => {
                    let item = Outbound {
                        bytes: bytes::Bytes::copy_from_slice(&frame),
                        flush: false,
                    };

                    // Subscribers that were acked a multicast group all
                    // share one copy.
                    if let Some(group) = multicast {
                        if !multicast_sent {
                            multicast_sent = true;
                            self.send_unreliable(header, instance, group, item);
                        }
                    } else if reliable {
                        self.send_reliable(endpoint, item);
                    } else {
                        self.send_unreliable(header, instance, endpoint, item);
                    }
                }
            }
        }
    }

    /// Send over UDP, leaving from the service's configured port when
    /// it has one so the peer sees the expected source. `false` means
    /// the frame was dropped under backpressure.
    fn send_unreliable(
        &self,
        header: &Header,
        instance: InstanceId,
        target: SocketAddr,
        item: Outbound,
    ) -> bool {
        let port = if header.message_type == MessageType::Request
            || header.message_type == MessageType::RequestNoReturn
        {
            CLIENT_PORT_KEY
        } else {
            self.config
                .find_service(header.service, instance)
                .and_then(|entry| entry.unreliable)
                .unwrap_or(CLIENT_PORT_KEY)
        };

        let queued = self.udp.send(port, target, item);
        if !queued {
            log::warn!("udp queue overflow: target={target}");
        }

        queued
    }

    /// Send over TCP, dialing the target when no connection exists yet.
    pub fn send_reliable(&self, target: SocketAddr, item: Outbound) -> bool {
        if let Some(receiver) = self.exchanger.register_if_absent(target) {
            tokio::spawn(tcp::client_connection(self.clone(), target, receiver));
        }

        match self.exchanger.send(&target, item) {
            Ok(()) => true,
            Err(SendError::Overflow) => {
                log::warn!("tcp queue overflow: target={target}");
                false
            }
            Err(SendError::Unroutable) => {
                log::warn!("tcp target gone: target={target}");
                false
            }
        }
    }

    /// Synthesize an error response towards a guest whose send failed
    /// or whose request ran into its deadline.
    pub fn send_error_response(
        &self,
        client: ClientId,
        instance: InstanceId,
        request: &Header,
        return_code: ReturnCode,
    ) {
        let mut bytes = BytesMut::new();
        Message {
            header: request.to_response(return_code),
            payload: &[],
        }
        .encode(&mut bytes);

        self.guests.send(client, &Command::SendMessage {
            instance,
            frame: bytes.to_vec(),
            uid: 0,
            gid: 0,
        });
    }
}

fn reencode(message: &Message<'_>) -> Vec<u8> {
    let mut bytes = BytesMut::new();
    message.encode(&mut bytes);
    bytes.to_vec()
}
