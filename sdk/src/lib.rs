//! # SOME/IP guest application library
//!
//! The guest side of the routing host's local IPC protocol. An
//! [`Application`] connects to the host's Unix domain socket, receives
//! its client identity, and from then on offers, requests, subscribes
//! and sends through the host, which owns all network endpoints.
//!
//! ```no_run
//! use someip_router_sdk::{Application, Event};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut app = Application::connect("radar", "routingmanagerd").await?;
//!
//! app.request_service(0x1234, 0x0001, 1, 0)?;
//!
//! while let Some(event) = app.next_event().await {
//!     match event {
//!         Event::Availability { service, instance, available } => {
//!             println!("{service:#06x}.{instance:#06x} available={available}");
//!             if available {
//!                 app.send_request(0x0001, 0x1234, 0x0042, 1, &[0x01])?;
//!             }
//!         }
//!         Event::Message { message, .. } => {
//!             println!("response: {:?}", message.payload);
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use anyhow::{Context, Result, bail};
use bytes::{Buf, Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};

use codec::{
    ANY_EVENT, ClientId, EventId, EventgroupId, ILLEGAL_CLIENT, InstanceId, MajorVersion,
    MethodId, MinorVersion, ServiceId,
    command::{Availability, Command},
    message::{Header, Message, MessageType, ReturnCode},
};

/// Environment variable naming this application when no name is passed
/// programmatically.
pub const APPLICATION_NAME_ENV: &str = "VSOMEIP_APPLICATION_NAME";

/// A SOME/IP message owned by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMessage {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// What the routing host tells the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Availability {
        service: ServiceId,
        instance: InstanceId,
        available: bool,
    },
    /// A request, response or notification relayed to this guest.
    Message {
        instance: InstanceId,
        message: OwnedMessage,
    },
    Subscribed {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    },
    SubscriptionFailed {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    },
    /// The offer was acknowledged (or refused) by the host.
    Offered {
        service: ServiceId,
        instance: InstanceId,
        accepted: bool,
    },
}

/// A guest application connected to its routing host.
pub struct Application {
    client: ClientId,
    name: String,
    outgoing: UnboundedSender<Bytes>,
    events: UnboundedReceiver<Event>,
}

impl Application {
    /// Connect to the routing host `routing` and register under `name`.
    ///
    /// An empty name falls back to `VSOMEIP_APPLICATION_NAME`. The
    /// connection state machine is dial, hello, assigned: the first
    /// command on the wire is `AssignClient` and nothing else is sent
    /// until the host answers with the minted identity.
    pub async fn connect(name: &str, routing: &str) -> Result<Self> {
        let name = if name.is_empty() {
            std::env::var(APPLICATION_NAME_ENV).unwrap_or_default()
        } else {
            name.to_string()
        };

        let path = format!("/tmp/vsomeip-{routing}-0");
        let mut socket = UnixStream::connect(&path)
            .await
            .with_context(|| format!("routing host not reachable at {path}"))?;

        // Hello: ask for our identity.
        let mut bytes = BytesMut::new();
        Command::AssignClient { name: name.clone() }.encode(ILLEGAL_CLIENT, &mut bytes);
        socket.write_all(&bytes).await?;

        let client = read_assignment(&mut socket).await?;
        if client == ILLEGAL_CLIENT {
            bail!("routing host refused the registration of {name:?}");
        }

        log::info!("registered at routing host: name={name:?}, client={client:#06x}");

        let (outgoing, outgoing_rx) = unbounded_channel::<Bytes>();
        let (events_tx, events) = unbounded_channel::<Event>();

        tokio::spawn(io_task(socket, outgoing_rx, events_tx, outgoing.clone()));

        let application = Self {
            client,
            name,
            outgoing,
            events,
        };

        application.send_command(&Command::RegisterApplication)?;
        Ok(application)
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next event from the host; `None` once the connection is gone.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.send_command(&Command::OfferService {
            service,
            instance,
            major,
            minor,
        })
    }

    pub fn stop_offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.send_command(&Command::StopOfferService {
            service,
            instance,
            major,
            minor,
        })
    }

    pub fn request_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Result<()> {
        self.send_command(&Command::RequestService {
            service,
            instance,
            major,
            minor,
        })
    }

    pub fn release_service(&self, service: ServiceId, instance: InstanceId) -> Result<()> {
        self.send_command(&Command::ReleaseService { service, instance })
    }

    pub fn subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
    ) -> Result<()> {
        self.send_command(&Command::Subscribe {
            service,
            instance,
            eventgroup,
            major,
            event: ANY_EVENT,
        })
    }

    pub fn unsubscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Result<()> {
        self.send_command(&Command::Unsubscribe {
            service,
            instance,
            eventgroup,
            event: ANY_EVENT,
        })
    }

    /// Call a method of a service. The host assigns the session id and
    /// the response comes back as an [`Event::Message`] whose header
    /// carries this client.
    pub fn send_request(
        &self,
        instance: InstanceId,
        service: ServiceId,
        method: MethodId,
        interface_version: u8,
        payload: &[u8],
    ) -> Result<()> {
        let mut header = Header::new(service, method, MessageType::Request);
        header.client = self.client;
        header.interface_version = interface_version;

        self.send_message(instance, header, payload)
    }

    /// Fire and forget call; no response will come back.
    pub fn send_request_no_return(
        &self,
        instance: InstanceId,
        service: ServiceId,
        method: MethodId,
        interface_version: u8,
        payload: &[u8],
    ) -> Result<()> {
        let mut header = Header::new(service, method, MessageType::RequestNoReturn);
        // Fire and forget still names the sender, only notifications
        // travel anonymously.
        header.client = self.client;
        header.interface_version = interface_version;

        self.send_message(instance, header, payload)
    }

    /// Answer a received request, keeping its identifier tuple.
    pub fn respond(
        &self,
        instance: InstanceId,
        request: &Header,
        return_code: ReturnCode,
        payload: &[u8],
    ) -> Result<()> {
        self.send_message(instance, request.to_response(return_code), payload)
    }

    /// Publish an event to its subscribers. The host resolves the
    /// eventgroups, applies debouncing and fans out.
    pub fn notify(
        &self,
        instance: InstanceId,
        service: ServiceId,
        event: EventId,
        payload: &[u8],
    ) -> Result<()> {
        let header = Header::new(service, event, MessageType::Notification);
        self.send_message(instance, header, payload)
    }

    fn send_message(&self, instance: InstanceId, header: Header, payload: &[u8]) -> Result<()> {
        let mut frame = BytesMut::new();
        Message { header, payload }.encode(&mut frame);

        self.send_command(&Command::SendMessage {
            instance,
            frame: frame.to_vec(),
            uid: 0,
            gid: 0,
        })
    }

    fn send_command(&self, command: &Command) -> Result<()> {
        let mut bytes = BytesMut::new();
        command.encode(self.client, &mut bytes);

        self.outgoing
            .send(bytes.freeze())
            .map_err(|_| anyhow::anyhow!("routing host connection lost"))
    }
}

/// Read the `AssignClientAck` that answers the hello.
async fn read_assignment(socket: &mut UnixStream) -> Result<ClientId> {
    let mut buffer = BytesMut::with_capacity(256);
    let mut chunk = [0u8; 256];

    loop {
        match Command::decode(&buffer) {
            Ok((_, Command::AssignClientAck { assigned }, consumed)) => {
                buffer.advance(consumed);
                return Ok(assigned);
            }
            Ok((_, other, consumed)) => {
                // Nothing else is expected before the ack; skip it.
                log::warn!("unexpected command before assignment: {other:?}");
                buffer.advance(consumed);
            }
            Err(e) if e.is_incomplete() => {
                let size = socket.read(&mut chunk).await?;
                if size == 0 {
                    bail!("routing host closed during assignment");
                }

                buffer.extend_from_slice(&chunk[..size]);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Socket pump: commands out, events in, watchdog answered inline.
async fn io_task(
    mut socket: UnixStream,
    mut outgoing: UnboundedReceiver<Bytes>,
    events: UnboundedSender<Event>,
    pong: UnboundedSender<Bytes>,
) {
    let mut buffer = BytesMut::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    let mut queue = VecDeque::new();

    'connection: loop {
        tokio::select! {
            read = socket.read(&mut chunk) => {
                let size = match read {
                    Ok(0) | Err(_) => break 'connection,
                    Ok(size) => size,
                };

                buffer.extend_from_slice(&chunk[..size]);

                loop {
                    match Command::decode(&buffer) {
                        Ok((_, command, consumed)) => {
                            buffer.advance(consumed);
                            queue.push_back(command);
                        }
                        Err(e) if e.is_incomplete() => break,
                        Err(e) => {
                            log::error!("malformed command from routing host: err={e}");
                            break 'connection;
                        }
                    }
                }

                while let Some(command) = queue.pop_front() {
                    if !handle_command(command, &events, &pong) {
                        break 'connection;
                    }
                }
            }
            Some(bytes) = outgoing.recv() => {
                if socket.write_all(&bytes).await.is_err() {
                    break 'connection;
                }
            }
            // The application handle was dropped; hang up so the host
            // can tear us down.
            _ = events.closed() => break 'connection,
        }
    }

    log::warn!("routing host connection closed");
}

fn handle_command(
    command: Command,
    events: &UnboundedSender<Event>,
    pong: &UnboundedSender<Bytes>,
) -> bool {
    let event = match command {
        Command::Ping => {
            let mut bytes = BytesMut::new();
            Command::Pong.encode(ILLEGAL_CLIENT, &mut bytes);
            return pong.send(bytes.freeze()).is_ok();
        }
        Command::RoutingInfo { entries } => {
            for entry in entries {
                let sent = events.send(Event::Availability {
                    service: entry.service,
                    instance: entry.instance,
                    available: entry.availability == Availability::Available,
                });

                if sent.is_err() {
                    return false;
                }
            }

            return true;
        }
        Command::SendMessage { instance, frame, .. } => match Message::decode(&frame) {
            Ok((message, _)) => Event::Message {
                instance,
                message: OwnedMessage {
                    header: message.header,
                    payload: message.payload.to_vec(),
                },
            },
            Err(e) => {
                log::warn!("malformed frame from routing host: err={e}");
                return true;
            }
        },
        Command::SubscribeAck { service, instance, eventgroup, .. } => Event::Subscribed {
            service,
            instance,
            eventgroup,
        },
        Command::SubscribeNack { service, instance, eventgroup, .. } => Event::SubscriptionFailed {
            service,
            instance,
            eventgroup,
        },
        Command::OfferServiceAck { service, instance, status } => Event::Offered {
            service,
            instance,
            accepted: status == codec::command::CommandStatus::Ok,
        },
        Command::Pong => return true,
        other => {
            log::debug!("ignoring host command: {other:?}");
            return true;
        }
    };

    events.send(event).is_ok()
}
