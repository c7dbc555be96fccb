use crate::Error;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const CONFIGURATION_TYPE: u8 = 0x01;
pub const LOAD_BALANCING_TYPE: u8 = 0x02;
pub const IPV4_ENDPOINT_TYPE: u8 = 0x04;
pub const IPV6_ENDPOINT_TYPE: u8 = 0x06;
pub const IPV4_MULTICAST_TYPE: u8 = 0x14;
pub const IPV6_MULTICAST_TYPE: u8 = 0x16;
pub const IPV4_SD_ENDPOINT_TYPE: u8 = 0x24;
pub const IPV6_SD_ENDPOINT_TYPE: u8 = 0x26;

/// Transport protocol carried inside endpoint options, IANA numbers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum TransportProtocol {
    Tcp = 0x06,
    Udp = 0x11,
}

/// Where an IP option points: a unicast service endpoint, a notification
/// multicast group, or the peer's SD endpoint itself.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Unicast,
    Multicast,
    Discovery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpEndpoint {
    pub kind: EndpointKind,
    pub address: std::net::IpAddr,
    pub protocol: TransportProtocol,
    pub port: u16,
}

impl IpEndpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// A single entry of the SD option table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdOption {
    /// A list of `key=value` items, DNS TXT record style.
    Configuration { items: Vec<String> },
    LoadBalancing { priority: u16, weight: u16 },
    Endpoint(IpEndpoint),
}

impl SdOption {
    pub fn ipv4_endpoint(address: Ipv4Addr, protocol: TransportProtocol, port: u16) -> Self {
        Self::Endpoint(IpEndpoint {
            kind: EndpointKind::Unicast,
            address: address.into(),
            protocol,
            port,
        })
    }

    pub fn ipv6_endpoint(address: Ipv6Addr, protocol: TransportProtocol, port: u16) -> Self {
        Self::Endpoint(IpEndpoint {
            kind: EndpointKind::Unicast,
            address: address.into(),
            protocol,
            port,
        })
    }

    pub fn ipv4_multicast(address: Ipv4Addr, port: u16) -> Self {
        Self::Endpoint(IpEndpoint {
            kind: EndpointKind::Multicast,
            address: address.into(),
            protocol: TransportProtocol::Udp,
            port,
        })
    }

    pub fn endpoint(addr: SocketAddr, kind: EndpointKind, protocol: TransportProtocol) -> Self {
        Self::Endpoint(IpEndpoint {
            kind,
            address: addr.ip(),
            protocol,
            port: addr.port(),
        })
    }

    pub fn as_endpoint(&self) -> Option<&IpEndpoint> {
        match self {
            Self::Endpoint(it) => Some(it),
            _ => None,
        }
    }

    fn type_byte(&self) -> u8 {
        match self {
            Self::Configuration { .. } => CONFIGURATION_TYPE,
            Self::LoadBalancing { .. } => LOAD_BALANCING_TYPE,
            Self::Endpoint(it) => match (it.address, it.kind) {
                (std::net::IpAddr::V4(_), EndpointKind::Unicast) => IPV4_ENDPOINT_TYPE,
                (std::net::IpAddr::V4(_), EndpointKind::Multicast) => IPV4_MULTICAST_TYPE,
                (std::net::IpAddr::V4(_), EndpointKind::Discovery) => IPV4_SD_ENDPOINT_TYPE,
                (std::net::IpAddr::V6(_), EndpointKind::Unicast) => IPV6_ENDPOINT_TYPE,
                (std::net::IpAddr::V6(_), EndpointKind::Multicast) => IPV6_MULTICAST_TYPE,
                (std::net::IpAddr::V6(_), EndpointKind::Discovery) => IPV6_SD_ENDPOINT_TYPE,
            },
        }
    }

    /// Serialize as `length (2) | type (1) | reserved (1) | payload`, the
    /// length covering the reserved byte and the payload.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use someip_router_codec::sd::options::{SdOption, TransportProtocol};
    ///
    /// let option = SdOption::ipv4_endpoint(
    ///     "192.168.1.10".parse().unwrap(),
    ///     TransportProtocol::Udp,
    ///     30509,
    /// );
    ///
    /// let mut bytes = BytesMut::new();
    /// option.encode(&mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[
    ///         0x00, 0x09, 0x04, 0x00, 0xC0, 0xA8, 0x01, 0x0A, 0x00, 0x11,
    ///         0x77, 0x2D,
    ///     ]
    /// );
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16(self.payload_len() as u16);
        bytes.put_u8(self.type_byte());
        bytes.put_u8(0);

        match self {
            Self::Configuration { items } => {
                for item in items {
                    bytes.put_u8(item.len() as u8);
                    bytes.put(item.as_bytes());
                }

                bytes.put_u8(0);
            }
            Self::LoadBalancing { priority, weight } => {
                bytes.put_u16(*priority);
                bytes.put_u16(*weight);
            }
            Self::Endpoint(it) => {
                match it.address {
                    std::net::IpAddr::V4(addr) => bytes.put(&addr.octets()[..]),
                    std::net::IpAddr::V6(addr) => bytes.put(&addr.octets()[..]),
                }

                bytes.put_u8(0);
                bytes.put_u8(it.protocol.into());
                bytes.put_u16(it.port);
            }
        }
    }

    /// The wire length field: one reserved byte plus the payload.
    fn payload_len(&self) -> usize {
        1 + match self {
            Self::Configuration { items } => {
                items.iter().map(|item| 1 + item.len()).sum::<usize>() + 1
            }
            Self::LoadBalancing { .. } => 4,
            Self::Endpoint(it) => match it.address {
                std::net::IpAddr::V4(_) => 8,
                std::net::IpAddr::V6(_) => 20,
            },
        }
    }

    /// Decode one option from the front of `bytes`, returning it together
    /// with the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), Error> {
        if bytes.len() < 4 {
            return Err(Error::Malformed);
        }

        let length = u16::from_be_bytes(bytes[0..2].try_into()?) as usize;
        let consumed = 3 + length;
        if length < 1 || bytes.len() < consumed {
            return Err(Error::Malformed);
        }

        let kind = bytes[2];
        let payload = &bytes[4..consumed];

        let option = match kind {
            CONFIGURATION_TYPE => {
                let mut items = Vec::new();
                let mut offset = 0;

                loop {
                    if offset >= payload.len() {
                        return Err(Error::Malformed);
                    }

                    let item_len = payload[offset] as usize;
                    if item_len == 0 {
                        break;
                    }

                    offset += 1;
                    if offset + item_len > payload.len() {
                        return Err(Error::Malformed);
                    }

                    items.push(std::str::from_utf8(&payload[offset..offset + item_len])?.to_string());
                    offset += item_len;
                }

                Self::Configuration { items }
            }
            LOAD_BALANCING_TYPE => {
                if payload.len() < 4 {
                    return Err(Error::Malformed);
                }

                Self::LoadBalancing {
                    priority: u16::from_be_bytes(payload[0..2].try_into()?),
                    weight: u16::from_be_bytes(payload[2..4].try_into()?),
                }
            }
            IPV4_ENDPOINT_TYPE | IPV4_MULTICAST_TYPE | IPV4_SD_ENDPOINT_TYPE => {
                if payload.len() < 8 {
                    return Err(Error::Malformed);
                }

                let octets: [u8; 4] = payload[0..4].try_into()?;
                Self::Endpoint(IpEndpoint {
                    kind: endpoint_kind(kind),
                    address: Ipv4Addr::from(octets).into(),
                    protocol: TransportProtocol::try_from(payload[5])
                        .map_err(|_| Error::Malformed)?,
                    port: u16::from_be_bytes(payload[6..8].try_into()?),
                })
            }
            IPV6_ENDPOINT_TYPE | IPV6_MULTICAST_TYPE | IPV6_SD_ENDPOINT_TYPE => {
                if payload.len() < 20 {
                    return Err(Error::Malformed);
                }

                let octets: [u8; 16] = payload[0..16].try_into()?;
                Self::Endpoint(IpEndpoint {
                    kind: endpoint_kind(kind),
                    address: Ipv6Addr::from(octets).into(),
                    protocol: TransportProtocol::try_from(payload[17])
                        .map_err(|_| Error::Malformed)?,
                    port: u16::from_be_bytes(payload[18..20].try_into()?),
                })
            }
            other => return Err(Error::UnknownOptionType(other)),
        };

        Ok((option, consumed))
    }
}

fn endpoint_kind(type_byte: u8) -> EndpointKind {
    match type_byte {
        IPV4_MULTICAST_TYPE | IPV6_MULTICAST_TYPE => EndpointKind::Multicast,
        IPV4_SD_ENDPOINT_TYPE | IPV6_SD_ENDPOINT_TYPE => EndpointKind::Discovery,
        _ => EndpointKind::Unicast,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_option_round_trip() {
        for option in [
            SdOption::ipv4_endpoint("10.0.0.1".parse().unwrap(), TransportProtocol::Tcp, 30509),
            SdOption::ipv6_endpoint("fe80::1".parse().unwrap(), TransportProtocol::Udp, 30490),
            SdOption::ipv4_multicast("239.1.2.3".parse().unwrap(), 31000),
            SdOption::LoadBalancing {
                priority: 3,
                weight: 7,
            },
            SdOption::Configuration {
                items: vec!["hostname=ecu1".to_string(), "otherapp".to_string()],
            },
        ] {
            let mut bytes = BytesMut::new();
            option.encode(&mut bytes);

            let (decoded, consumed) = SdOption::decode(&bytes).unwrap();
            assert_eq!(consumed, bytes.len());
            assert_eq!(decoded, option);
        }
    }

    #[test]
    fn unknown_option_type_is_rejected() {
        let bytes = [0x00, 0x02, 0x42, 0x00, 0x00];

        assert_eq!(SdOption::decode(&bytes), Err(Error::UnknownOptionType(0x42)));
    }
}
