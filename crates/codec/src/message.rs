use crate::{
    ClientId, Direction, Error, MethodId, PROTOCOL_VERSION, SOMEIP_FULL_HEADER_SIZE,
    SOMEIP_HEADER_SIZE, ServiceId, SessionId,
};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// SIP_RPC_684
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    RequestAck = 0x40,
    RequestNoReturnAck = 0x41,
    NotificationAck = 0x42,
    Response = 0x80,
    Error = 0x81,
    ResponseAck = 0xC0,
    ErrorAck = 0xC1,
}

impl MessageType {
    /// Whether the sender of this message expects a paired response.
    pub fn expects_response(self) -> bool {
        self == Self::Request
    }

    /// Whether this message travels from a service towards a client.
    pub fn is_response(self) -> bool {
        matches!(self, Self::Response | Self::Error | Self::ResponseAck | Self::ErrorAck)
    }
}

/// SIP_RPC_371
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum ReturnCode {
    Ok = 0x00,
    NotOk = 0x01,
    UnknownService = 0x02,
    UnknownMethod = 0x03,
    NotReady = 0x04,
    NotReachable = 0x05,
    Timeout = 0x06,
    WrongProtocolVersion = 0x07,
    WrongInterfaceVersion = 0x08,
    MalformedMessage = 0x09,
    WrongMessageType = 0x0A,
    Unknown = 0xFF,
}

/// The fixed 16 byte SOME/IP header.
///
/// `length` counts everything after byte 7, so a header with no payload
/// carries `length == 8` and a frame is `8 + length` bytes long in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub service: ServiceId,
    pub method: MethodId,
    pub length: u32,
    pub client: ClientId,
    pub session: SessionId,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
}

impl Header {
    pub fn new(service: ServiceId, method: MethodId, message_type: MessageType) -> Self {
        Self {
            service,
            method,
            length: SOMEIP_HEADER_SIZE as u32,
            client: 0,
            session: 0,
            protocol_version: PROTOCOL_VERSION,
            interface_version: 0,
            message_type,
            return_code: ReturnCode::Ok,
        }
    }

    /// Number of payload bytes announced by the length field.
    pub fn payload_len(&self) -> usize {
        self.length as usize - SOMEIP_HEADER_SIZE
    }

    /// Whether this frame belongs to the service discovery.
    pub fn is_sd(&self) -> bool {
        self.service == crate::sd::SD_SERVICE && self.method == crate::sd::SD_METHOD
    }

    /// Whether this header is the start of a magic cookie of either
    /// direction.
    pub fn is_magic_cookie(&self) -> bool {
        self.service == 0xFFFF
            && (self.method == 0x0000 || self.method == 0x8000)
            && self.length == SOMEIP_HEADER_SIZE as u32
            && self.client == 0xDEAD
            && self.session == 0xBEEF
    }

    /// Build the response header for a request, keeping the identifier
    /// tuple so the sender can pair it (§ request/response pairing).
    pub fn to_response(&self, return_code: ReturnCode) -> Self {
        Self {
            length: SOMEIP_HEADER_SIZE as u32,
            message_type: if return_code == ReturnCode::Ok {
                MessageType::Response
            } else {
                MessageType::Error
            },
            return_code,
            ..*self
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < SOMEIP_FULL_HEADER_SIZE {
            return Err(Error::Incomplete);
        }

        let length = u32::from_be_bytes(bytes[4..8].try_into()?);
        if (length as usize) < SOMEIP_HEADER_SIZE {
            return Err(Error::InvalidLength(length));
        }

        let protocol_version = bytes[12];
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::InvalidProtocolVersion(protocol_version));
        }

        Ok(Self {
            service: u16::from_be_bytes(bytes[0..2].try_into()?),
            method: u16::from_be_bytes(bytes[2..4].try_into()?),
            length,
            client: u16::from_be_bytes(bytes[8..10].try_into()?),
            session: u16::from_be_bytes(bytes[10..12].try_into()?),
            protocol_version,
            interface_version: bytes[13],
            message_type: MessageType::try_from(bytes[14])
                .map_err(|_| Error::UnknownMessageType(bytes[14]))?,
            return_code: ReturnCode::try_from(bytes[15])
                .map_err(|_| Error::UnknownReturnCode(bytes[15]))?,
        })
    }

    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16(self.service);
        bytes.put_u16(self.method);
        bytes.put_u32(self.length);
        bytes.put_u16(self.client);
        bytes.put_u16(self.session);
        bytes.put_u8(self.protocol_version);
        bytes.put_u8(self.interface_version);
        bytes.put_u8(self.message_type.into());
        bytes.put_u8(self.return_code.into());
    }
}

/// A complete SOME/IP message, borrowing its payload from the receive
/// buffer. The payload is opaque to the routing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

impl<'a> Message<'a> {
    /// Cut one message out of `bytes`.
    ///
    /// Returns the message and the number of bytes it occupied, so stream
    /// endpoints can advance their reassembly buffer. `Error::Incomplete`
    /// is returned while fewer than `8 + length` bytes are buffered; any
    /// other error means the buffer does not start with a valid frame.
    ///
    /// # Test
    ///
    /// ```
    /// use someip_router_codec::message::{Message, MessageType, ReturnCode};
    ///
    /// let buffer = [
    ///     0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x0B, 0xAA, 0xBB, 0x00,
    ///     0x01, 0x01, 0x01, 0x00, 0x00, 0x01, 0x02, 0x03,
    /// ];
    ///
    /// let (message, consumed) = Message::decode(&buffer).unwrap();
    ///
    /// assert_eq!(consumed, buffer.len());
    /// assert_eq!(message.header.service, 0x1234);
    /// assert_eq!(message.header.method, 0x5678);
    /// assert_eq!(message.header.client, 0xAABB);
    /// assert_eq!(message.header.session, 0x0001);
    /// assert_eq!(message.header.message_type, MessageType::Request);
    /// assert_eq!(message.header.return_code, ReturnCode::Ok);
    /// assert_eq!(message.payload, &[0x01, 0x02, 0x03]);
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < SOMEIP_HEADER_SIZE {
            return Err(Error::Incomplete);
        }

        // The length field is readable before the full header is, and it
        // decides how many bytes the frame needs in total.
        let length = u32::from_be_bytes(bytes[4..8].try_into()?) as usize;
        if length < SOMEIP_HEADER_SIZE {
            return Err(Error::InvalidLength(length as u32));
        }

        let total = SOMEIP_HEADER_SIZE + length;
        if bytes.len() < total {
            return Err(Error::Incomplete);
        }

        let header = Header::decode(bytes)?;
        Ok((
            Self {
                header,
                payload: &bytes[SOMEIP_FULL_HEADER_SIZE..total],
            },
            total,
        ))
    }

    /// Serialize the message, recomputing the length field from the
    /// payload. Never fails as long as the payload fits the endpoint's
    /// maximum message size, which the endpoint checks before calling.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use someip_router_codec::message::{Header, Message, MessageType};
    ///
    /// let mut header = Header::new(0x1234, 0x5678, MessageType::Request);
    /// header.client = 0xAABB;
    /// header.session = 0x0001;
    /// header.interface_version = 0x01;
    ///
    /// let message = Message {
    ///     header,
    ///     payload: &[0x01, 0x02, 0x03],
    /// };
    ///
    /// let mut bytes = BytesMut::new();
    /// message.encode(&mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[
    ///         0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x0B, 0xAA, 0xBB,
    ///         0x00, 0x01, 0x01, 0x01, 0x00, 0x00, 0x01, 0x02, 0x03,
    ///     ]
    /// );
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        let mut header = self.header;
        header.length = (SOMEIP_HEADER_SIZE + self.payload.len()) as u32;
        header.encode(bytes);
        bytes.put(self.payload);
    }
}

/// Which direction's magic cookie `bytes` starts with, if any.
pub fn cookie_direction(bytes: &[u8]) -> Option<Direction> {
    if bytes.len() < SOMEIP_FULL_HEADER_SIZE {
        return None;
    }

    if bytes[..16] == crate::CLIENT_COOKIE {
        Some(Direction::ClientToService)
    } else if bytes[..16] == crate::SERVICE_COOKIE {
        Some(Direction::ServiceToClient)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_until_length_is_satisfied() {
        let buffer = [
            0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x0B, 0xAA, 0xBB, 0x00, 0x01, 0x01, 0x01,
            0x00, 0x00, 0x01, 0x02, 0x03,
        ];

        for cut in 0..buffer.len() {
            assert_eq!(Message::decode(&buffer[..cut]), Err(Error::Incomplete));
        }

        assert!(Message::decode(&buffer).is_ok());
    }

    #[test]
    fn length_below_header_size_is_rejected() {
        let buffer = [
            0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x07, 0xAA, 0xBB, 0x00, 0x01, 0x01, 0x01,
            0x00, 0x00,
        ];

        assert_eq!(Message::decode(&buffer), Err(Error::InvalidLength(7)));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut buffer = vec![
            0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x08, 0xAA, 0xBB, 0x00, 0x01, 0x01, 0x01,
            0x00, 0x00,
        ];
        buffer[14] = 0x13;

        assert_eq!(Message::decode(&buffer), Err(Error::UnknownMessageType(0x13)));
    }

    #[test]
    fn cookies_decode_as_messages() {
        let (message, consumed) = Message::decode(&crate::CLIENT_COOKIE).unwrap();

        assert_eq!(consumed, 16);
        assert!(message.header.is_magic_cookie());
        assert_eq!(message.header.message_type, MessageType::RequestNoReturn);
        assert_eq!(cookie_direction(&crate::SERVICE_COOKIE), Some(Direction::ServiceToClient));
    }
}
