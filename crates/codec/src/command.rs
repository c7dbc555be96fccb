//! ## Local IPC command framing
//!
//! The routing host and its guest applications exchange commands over a
//! local stream socket. Every command starts with a 7 byte header:
//!
//! ```text
//! byte 0      command id
//! bytes 1..3  sender client id (little endian, the host sends 0)
//! bytes 3..7  payload size (little endian)
//! ```
//!
//! followed by a fixed-layout payload. Unlike the network formats all
//! multi byte fields are little endian; the channel never leaves the
//! host, so there is nothing to convert for.

use crate::{
    ClientId, Error, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId,
};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const COMMAND_HEADER_SIZE: usize = 7;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum CommandId {
    AssignClient = 0x00,
    AssignClientAck = 0x01,
    RegisterApplication = 0x02,
    DeregisterApplication = 0x03,
    OfferService = 0x10,
    StopOfferService = 0x11,
    OfferServiceAck = 0x12,
    RequestService = 0x20,
    ReleaseService = 0x21,
    Subscribe = 0x30,
    Unsubscribe = 0x31,
    SubscribeAck = 0x32,
    SubscribeNack = 0x33,
    SendMessage = 0x40,
    RoutingInfo = 0x50,
    Ping = 0x60,
    Pong = 0x61,
}

/// Result of a control operation, carried in acknowledgement commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum CommandStatus {
    Ok = 0x00,
    /// A conflicting local offer already exists.
    Rejected = 0x01,
    /// The policy engine refused the operation.
    Denied = 0x02,
}

/// Availability of a service instance as pushed to guests.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum Availability {
    Unavailable = 0x00,
    /// Seen via discovery but not requested by this guest.
    Offered = 0x01,
    Available = 0x02,
}

/// One row of a `RoutingInfo` broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingEntry {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub minor: MinorVersion,
    pub availability: Availability,
}

const ROUTING_ENTRY_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// First command of a guest, carrying its configured name. Answered
    /// with `AssignClientAck`.
    AssignClient {
        name: String,
    },
    AssignClientAck {
        assigned: ClientId,
    },
    RegisterApplication,
    DeregisterApplication,
    OfferService {
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    },
    StopOfferService {
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    },
    OfferServiceAck {
        service: ServiceId,
        instance: InstanceId,
        status: CommandStatus,
    },
    RequestService {
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    },
    ReleaseService {
        service: ServiceId,
        instance: InstanceId,
    },
    Subscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event: EventId,
    },
    Unsubscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    },
    SubscribeAck {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    },
    SubscribeNack {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    },
    /// A complete SOME/IP frame plus the sender's credentials. The
    /// instance disambiguates services deployed more than once.
    SendMessage {
        instance: InstanceId,
        frame: Vec<u8>,
        uid: u32,
        gid: u32,
    },
    RoutingInfo {
        entries: Vec<RoutingEntry>,
    },
    Ping,
    Pong,
}

impl Command {
    pub fn id(&self) -> CommandId {
        match self {
            Self::AssignClient { .. } => CommandId::AssignClient,
            Self::AssignClientAck { .. } => CommandId::AssignClientAck,
            Self::RegisterApplication => CommandId::RegisterApplication,
            Self::DeregisterApplication => CommandId::DeregisterApplication,
            Self::OfferService { .. } => CommandId::OfferService,
            Self::StopOfferService { .. } => CommandId::StopOfferService,
            Self::OfferServiceAck { .. } => CommandId::OfferServiceAck,
            Self::RequestService { .. } => CommandId::RequestService,
            Self::ReleaseService { .. } => CommandId::ReleaseService,
            Self::Subscribe { .. } => CommandId::Subscribe,
            Self::Unsubscribe { .. } => CommandId::Unsubscribe,
            Self::SubscribeAck { .. } => CommandId::SubscribeAck,
            Self::SubscribeNack { .. } => CommandId::SubscribeNack,
            Self::SendMessage { .. } => CommandId::SendMessage,
            Self::RoutingInfo { .. } => CommandId::RoutingInfo,
            Self::Ping => CommandId::Ping,
            Self::Pong => CommandId::Pong,
        }
    }

    /// Serialize header and payload on behalf of `sender`.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use someip_router_codec::command::Command;
    ///
    /// let command = Command::OfferService {
    ///     service: 0x1234,
    ///     instance: 0x0001,
    ///     major: 1,
    ///     minor: 0,
    /// };
    ///
    /// let mut bytes = BytesMut::new();
    /// command.encode(0x0100, &mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[
    ///         0x10, 0x00, 0x01, 0x09, 0x00, 0x00, 0x00, 0x34, 0x12, 0x01,
    ///         0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
    ///     ]
    /// );
    /// ```
    pub fn encode(&self, sender: ClientId, bytes: &mut BytesMut) {
        bytes.put_u8(self.id().into());
        bytes.put_u16_le(sender);

        // Reserve the size field, it is patched once the payload is known.
        let size_at = bytes.len();
        bytes.put_u32_le(0);

        match self {
            Self::AssignClient { name } => bytes.put(name.as_bytes()),
            Self::AssignClientAck { assigned } => bytes.put_u16_le(*assigned),
            Self::RegisterApplication | Self::DeregisterApplication | Self::Ping | Self::Pong => {}
            Self::OfferService {
                service,
                instance,
                major,
                minor,
            }
            | Self::StopOfferService {
                service,
                instance,
                major,
                minor,
            }
            | Self::RequestService {
                service,
                instance,
                major,
                minor,
            } => {
                bytes.put_u16_le(*service);
                bytes.put_u16_le(*instance);
                bytes.put_u8(*major);
                bytes.put_u32_le(*minor);
            }
            Self::OfferServiceAck {
                service,
                instance,
                status,
            } => {
                bytes.put_u16_le(*service);
                bytes.put_u16_le(*instance);
                bytes.put_u8((*status).into());
            }
            Self::ReleaseService { service, instance } => {
                bytes.put_u16_le(*service);
                bytes.put_u16_le(*instance);
            }
            Self::Subscribe {
                service,
                instance,
                eventgroup,
                major,
                event,
            } => {
                bytes.put_u16_le(*service);
                bytes.put_u16_le(*instance);
                bytes.put_u16_le(*eventgroup);
                bytes.put_u8(*major);
                bytes.put_u16_le(*event);
            }
            Self::Unsubscribe {
                service,
                instance,
                eventgroup,
                event,
            }
            | Self::SubscribeAck {
                service,
                instance,
                eventgroup,
                event,
            }
            | Self::SubscribeNack {
                service,
                instance,
                eventgroup,
                event,
            } => {
                bytes.put_u16_le(*service);
                bytes.put_u16_le(*instance);
                bytes.put_u16_le(*eventgroup);
                bytes.put_u16_le(*event);
            }
            Self::SendMessage {
                instance,
                frame,
                uid,
                gid,
            } => {
                bytes.put_u16_le(*instance);
                bytes.put(frame.as_slice());
                bytes.put_u32_le(*uid);
                bytes.put_u32_le(*gid);
            }
            Self::RoutingInfo { entries } => {
                bytes.put_u32_le(entries.len() as u32);
                for entry in entries {
                    bytes.put_u16_le(entry.service);
                    bytes.put_u16_le(entry.instance);
                    bytes.put_u8(entry.major);
                    bytes.put_u32_le(entry.minor);
                    bytes.put_u8(entry.availability.into());
                }
            }
        }

        let size = (bytes.len() - size_at - 4) as u32;
        bytes[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
    }

    /// Cut one command out of `bytes`, returning the sending client, the
    /// command and the number of bytes consumed. `Error::Incomplete`
    /// while the stream has not delivered the whole payload yet.
    pub fn decode(bytes: &[u8]) -> Result<(ClientId, Self, usize), Error> {
        if bytes.len() < COMMAND_HEADER_SIZE {
            return Err(Error::Incomplete);
        }

        let id = CommandId::try_from(bytes[0]).map_err(|_| Error::UnknownCommand(bytes[0]))?;
        let sender = u16::from_le_bytes(bytes[1..3].try_into()?);
        let size = u32::from_le_bytes(bytes[3..7].try_into()?) as usize;

        let consumed = COMMAND_HEADER_SIZE + size;
        if bytes.len() < consumed {
            return Err(Error::Incomplete);
        }

        let payload = &bytes[COMMAND_HEADER_SIZE..consumed];
        let command = match id {
            CommandId::AssignClient => Self::AssignClient {
                name: std::str::from_utf8(payload)?.to_string(),
            },
            CommandId::AssignClientAck => {
                check_size(payload, 2)?;
                Self::AssignClientAck {
                    assigned: u16::from_le_bytes(payload[0..2].try_into()?),
                }
            }
            CommandId::RegisterApplication => Self::RegisterApplication,
            CommandId::DeregisterApplication => Self::DeregisterApplication,
            CommandId::OfferService | CommandId::StopOfferService | CommandId::RequestService => {
                check_size(payload, 9)?;

                let service = u16::from_le_bytes(payload[0..2].try_into()?);
                let instance = u16::from_le_bytes(payload[2..4].try_into()?);
                let major = payload[4];
                let minor = u32::from_le_bytes(payload[5..9].try_into()?);

                match id {
                    CommandId::OfferService => Self::OfferService {
                        service,
                        instance,
                        major,
                        minor,
                    },
                    CommandId::StopOfferService => Self::StopOfferService {
                        service,
                        instance,
                        major,
                        minor,
                    },
                    _ => Self::RequestService {
                        service,
                        instance,
                        major,
                        minor,
                    },
                }
            }
            CommandId::OfferServiceAck => {
                check_size(payload, 5)?;
                Self::OfferServiceAck {
                    service: u16::from_le_bytes(payload[0..2].try_into()?),
                    instance: u16::from_le_bytes(payload[2..4].try_into()?),
                    status: CommandStatus::try_from(payload[4]).map_err(|_| Error::Malformed)?,
                }
            }
            CommandId::ReleaseService => {
                check_size(payload, 4)?;
                Self::ReleaseService {
                    service: u16::from_le_bytes(payload[0..2].try_into()?),
                    instance: u16::from_le_bytes(payload[2..4].try_into()?),
                }
            }
            CommandId::Subscribe => {
                check_size(payload, 9)?;
                Self::Subscribe {
                    service: u16::from_le_bytes(payload[0..2].try_into()?),
                    instance: u16::from_le_bytes(payload[2..4].try_into()?),
                    eventgroup: u16::from_le_bytes(payload[4..6].try_into()?),
                    major: payload[6],
                    event: u16::from_le_bytes(payload[7..9].try_into()?),
                }
            }
            CommandId::Unsubscribe | CommandId::SubscribeAck | CommandId::SubscribeNack => {
                check_size(payload, 8)?;

                let service = u16::from_le_bytes(payload[0..2].try_into()?);
                let instance = u16::from_le_bytes(payload[2..4].try_into()?);
                let eventgroup = u16::from_le_bytes(payload[4..6].try_into()?);
                let event = u16::from_le_bytes(payload[6..8].try_into()?);

                match id {
                    CommandId::Unsubscribe => Self::Unsubscribe {
                        service,
                        instance,
                        eventgroup,
                        event,
                    },
                    CommandId::SubscribeAck => Self::SubscribeAck {
                        service,
                        instance,
                        eventgroup,
                        event,
                    },
                    _ => Self::SubscribeNack {
                        service,
                        instance,
                        eventgroup,
                        event,
                    },
                }
            }
            CommandId::SendMessage => {
                // Instance in front, credentials behind the frame.
                if payload.len() < 10 {
                    return Err(Error::Malformed);
                }

                let frame_end = payload.len() - 8;
                Self::SendMessage {
                    instance: u16::from_le_bytes(payload[0..2].try_into()?),
                    frame: payload[2..frame_end].to_vec(),
                    uid: u32::from_le_bytes(payload[frame_end..frame_end + 4].try_into()?),
                    gid: u32::from_le_bytes(payload[frame_end + 4..].try_into()?),
                }
            }
            CommandId::RoutingInfo => {
                if payload.len() < 4 {
                    return Err(Error::Malformed);
                }

                let count = u32::from_le_bytes(payload[0..4].try_into()?) as usize;
                check_size(&payload[4..], count * ROUTING_ENTRY_SIZE)?;

                let mut entries = Vec::with_capacity(count);
                for chunk in payload[4..].chunks_exact(ROUTING_ENTRY_SIZE) {
                    entries.push(RoutingEntry {
                        service: u16::from_le_bytes(chunk[0..2].try_into()?),
                        instance: u16::from_le_bytes(chunk[2..4].try_into()?),
                        major: chunk[4],
                        minor: u32::from_le_bytes(chunk[5..9].try_into()?),
                        availability: Availability::try_from(chunk[9])
                            .map_err(|_| Error::Malformed)?,
                    });
                }

                Self::RoutingInfo { entries }
            }
            CommandId::Ping => Self::Ping,
            CommandId::Pong => Self::Pong,
        };

        Ok((sender, command, consumed))
    }
}

fn check_size(payload: &[u8], expected: usize) -> Result<(), Error> {
    if payload.len() != expected {
        return Err(Error::Malformed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip() {
        let commands = [
            (
                0x0000,
                Command::AssignClient {
                    name: "radar_fusion".to_string(),
                },
            ),
            (0x0000, Command::AssignClientAck { assigned: 0x0101 }),
            (0x0101, Command::RegisterApplication),
            (
                0x0101,
                Command::Subscribe {
                    service: 0x1234,
                    instance: 0x0001,
                    eventgroup: 0x0005,
                    major: 1,
                    event: 0x8005,
                },
            ),
            (
                0x0101,
                Command::SendMessage {
                    instance: 0x0001,
                    frame: vec![0xDE, 0xAD, 0xBE, 0xEF],
                    uid: 1000,
                    gid: 1000,
                },
            ),
            (
                0x0000,
                Command::RoutingInfo {
                    entries: vec![RoutingEntry {
                        service: 0x1234,
                        instance: 0x0001,
                        major: 1,
                        minor: 0,
                        availability: Availability::Available,
                    }],
                },
            ),
            (0x0000, Command::Ping),
            (0x0101, Command::Pong),
        ];

        for (sender, command) in commands {
            let mut bytes = BytesMut::new();
            command.encode(sender, &mut bytes);

            let (decoded_sender, decoded, consumed) = Command::decode(&bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(decoded_sender, sender);
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn incomplete_payload_waits_for_more_bytes() {
        let mut bytes = BytesMut::new();
        Command::AssignClient {
            name: "app".to_string(),
        }
        .encode(0, &mut bytes);

        for cut in 0..bytes.len() {
            assert_eq!(Command::decode(&bytes[..cut]), Err(Error::Incomplete));
        }
    }

    #[test]
    fn two_commands_in_one_buffer_are_framed() {
        let mut bytes = BytesMut::new();
        Command::Ping.encode(0, &mut bytes);
        Command::Pong.encode(0x0101, &mut bytes);

        let (_, first, consumed) = Command::decode(&bytes).unwrap();
        assert_eq!(first, Command::Ping);

        let (sender, second, _) = Command::decode(&bytes[consumed..]).unwrap();
        assert_eq!(second, Command::Pong);
        assert_eq!(sender, 0x0101);
    }
}
