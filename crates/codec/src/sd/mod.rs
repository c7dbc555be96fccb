//! ## SOME/IP Service Discovery payload
//!
//! An SD message is an ordinary SOME/IP frame addressed to
//! `0xFFFF/0x8100` whose payload is two length-prefixed arrays: fixed
//! 16 byte entries and variable length options. Entries do not embed
//! their options; they reference up to two runs of consecutive option
//! table slots by `(first index, count)`, which allows several entries
//! to share one endpoint option.

pub mod options;

use crate::{
    Error, EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId, sd::options::SdOption,
};

use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const SD_SERVICE: ServiceId = 0xFFFF;
pub const SD_METHOD: u16 = 0x8100;

/// Entries are 16 bytes on the wire.
pub const ENTRY_SIZE: usize = 16;

/// Flags byte at the start of every SD payload.
///
/// `reboot` toggles from a fresh session counter after a restart and is
/// what peers use to detect a reboot; `unicast` announces that the sender
/// can receive SD messages over unicast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    pub reboot: bool,
    pub unicast: bool,
    pub explicit_initial_data: bool,
}

impl Flags {
    pub const REBOOT: u8 = 0b1000_0000;
    pub const UNICAST: u8 = 0b0100_0000;
    pub const EXPLICIT_INITIAL_DATA: u8 = 0b0010_0000;

    pub fn from_byte(byte: u8) -> Self {
        Self {
            reboot: byte & Self::REBOOT != 0,
            unicast: byte & Self::UNICAST != 0,
            explicit_initial_data: byte & Self::EXPLICIT_INITIAL_DATA != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.reboot {
            byte |= Self::REBOOT;
        }

        if self.unicast {
            byte |= Self::UNICAST;
        }

        if self.explicit_initial_data {
            byte |= Self::EXPLICIT_INITIAL_DATA;
        }

        byte
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum ServiceEntryType {
    /// A stop offer is an offer with TTL zero.
    FindService = 0x00,
    OfferService = 0x01,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum EventgroupEntryType {
    /// A stop subscribe is a subscribe with TTL zero.
    Subscribe = 0x06,
    /// A negative acknowledgement is an ack with TTL zero.
    SubscribeAck = 0x07,
}

/// A run of consecutive option table slots referenced by an entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptionRun {
    pub first: u8,
    pub count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub kind: ServiceEntryType,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub ttl: u32,
    pub minor: MinorVersion,
    pub runs: [OptionRun; 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventgroupEntry {
    pub kind: EventgroupEntryType,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub ttl: u32,
    /// Distinguishes parallel subscriptions of the same eventgroup by one
    /// subscriber, 4 bits on the wire.
    pub counter: u8,
    pub eventgroup: EventgroupId,
    pub runs: [OptionRun; 2],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Service(ServiceEntry),
    Eventgroup(EventgroupEntry),
}

impl Entry {
    pub fn find_service(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: u32,
    ) -> Self {
        Self::Service(ServiceEntry {
            kind: ServiceEntryType::FindService,
            service,
            instance,
            major,
            ttl,
            minor,
            runs: Default::default(),
        })
    }

    pub fn offer_service(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: u32,
    ) -> Self {
        Self::Service(ServiceEntry {
            kind: ServiceEntryType::OfferService,
            service,
            instance,
            major,
            ttl,
            minor,
            runs: Default::default(),
        })
    }

    pub fn stop_offer_service(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Self {
        Self::offer_service(service, instance, major, minor, 0)
    }

    pub fn subscribe(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: u32,
    ) -> Self {
        Self::Eventgroup(EventgroupEntry {
            kind: EventgroupEntryType::Subscribe,
            service,
            instance,
            major,
            ttl,
            counter,
            eventgroup,
            runs: Default::default(),
        })
    }

    pub fn subscribe_ack(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: u32,
    ) -> Self {
        Self::Eventgroup(EventgroupEntry {
            kind: EventgroupEntryType::SubscribeAck,
            service,
            instance,
            major,
            ttl,
            counter,
            eventgroup,
            runs: Default::default(),
        })
    }

    pub fn subscribe_nack(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
    ) -> Self {
        Self::subscribe_ack(service, instance, eventgroup, major, counter, 0)
    }

    pub fn service(&self) -> ServiceId {
        match self {
            Self::Service(it) => it.service,
            Self::Eventgroup(it) => it.service,
        }
    }

    pub fn instance(&self) -> InstanceId {
        match self {
            Self::Service(it) => it.instance,
            Self::Eventgroup(it) => it.instance,
        }
    }

    pub fn ttl(&self) -> u32 {
        match self {
            Self::Service(it) => it.ttl,
            Self::Eventgroup(it) => it.ttl,
        }
    }

    /// TTL zero turns Offer into StopOffer, Subscribe into StopSubscribe
    /// and Ack into Nack.
    pub fn is_stop(&self) -> bool {
        self.ttl() == 0
    }

    pub fn runs(&self) -> &[OptionRun; 2] {
        match self {
            Self::Service(it) => &it.runs,
            Self::Eventgroup(it) => &it.runs,
        }
    }

    fn runs_mut(&mut self) -> &mut [OptionRun; 2] {
        match self {
            Self::Service(it) => &mut it.runs,
            Self::Eventgroup(it) => &mut it.runs,
        }
    }

    fn encode(&self, bytes: &mut BytesMut) {
        let runs = self.runs();
        debug_assert!(runs[0].count <= 0xF && runs[1].count <= 0xF);

        match self {
            Self::Service(it) => {
                bytes.put_u8(it.kind.into());
                bytes.put_u8(runs[0].first);
                bytes.put_u8(runs[1].first);
                bytes.put_u8((runs[0].count << 4) | (runs[1].count & 0xF));
                bytes.put_u16(it.service);
                bytes.put_u16(it.instance);
                bytes.put_u8(it.major);
                put_ttl(bytes, it.ttl);
                bytes.put_u32(it.minor);
            }
            Self::Eventgroup(it) => {
                bytes.put_u8(it.kind.into());
                bytes.put_u8(runs[0].first);
                bytes.put_u8(runs[1].first);
                bytes.put_u8((runs[0].count << 4) | (runs[1].count & 0xF));
                bytes.put_u16(it.service);
                bytes.put_u16(it.instance);
                bytes.put_u8(it.major);
                put_ttl(bytes, it.ttl);
                bytes.put_u16((it.counter & 0xF) as u16);
                bytes.put_u16(it.eventgroup);
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        debug_assert_eq!(bytes.len(), ENTRY_SIZE);

        let runs = [
            OptionRun {
                first: bytes[1],
                count: bytes[3] >> 4,
            },
            OptionRun {
                first: bytes[2],
                count: bytes[3] & 0xF,
            },
        ];

        let service = u16::from_be_bytes(bytes[4..6].try_into()?);
        let instance = u16::from_be_bytes(bytes[6..8].try_into()?);
        let major = bytes[8];
        // The TTL is three bytes on the wire and zero extended here.
        let ttl = u32::from_be_bytes([0, bytes[9], bytes[10], bytes[11]]);

        Ok(match bytes[0] {
            0x00 | 0x01 => Self::Service(ServiceEntry {
                kind: ServiceEntryType::try_from(bytes[0]).unwrap(),
                service,
                instance,
                major,
                ttl,
                minor: u32::from_be_bytes(bytes[12..16].try_into()?),
                runs,
            }),
            0x06 | 0x07 => Self::Eventgroup(EventgroupEntry {
                kind: EventgroupEntryType::try_from(bytes[0]).unwrap(),
                service,
                instance,
                major,
                ttl,
                counter: (u16::from_be_bytes(bytes[12..14].try_into()?) & 0xF) as u8,
                eventgroup: u16::from_be_bytes(bytes[14..16].try_into()?),
                runs,
            }),
            other => return Err(Error::UnknownEntryType(other)),
        })
    }
}

fn put_ttl(bytes: &mut BytesMut, ttl: u32) {
    // Encoding truncates the upper byte.
    bytes.put_u8((ttl >> 16) as u8);
    bytes.put_u16(ttl as u16);
}

/// A decoded or under-construction SD payload.
///
/// Entries reference the shared option table through [`OptionRun`]s;
/// [`SdPayload::insert_entry`] deduplicates options with an identical byte
/// representation and rewrites the entry's runs accordingly.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SdPayload {
    pub flags: Flags,
    pub entries: Vec<Entry>,
    pub options: Vec<SdOption>,
}

impl SdPayload {
    pub fn new(flags: Flags) -> Self {
        Self {
            flags,
            entries: Vec::new(),
            options: Vec::new(),
        }
    }

    /// Append `entry`, attaching up to two runs of options.
    ///
    /// If an identical consecutive run already exists in the option table
    /// it is shared instead of appended, so two offers carrying the same
    /// endpoint option encode it only once.
    pub fn insert_entry(&mut self, mut entry: Entry, run1: &[SdOption], run2: &[SdOption]) {
        let runs = entry.runs_mut();
        runs[0] = self.find_or_append(run1);
        runs[1] = self.find_or_append(run2);
        self.entries.push(entry);
    }

    fn find_or_append(&mut self, run: &[SdOption]) -> OptionRun {
        if run.is_empty() {
            return OptionRun::default();
        }

        debug_assert!(run.len() <= 0xF);

        let count = run.len();
        let existing = (0..self.options.len().saturating_sub(count - 1))
            .find(|i| &self.options[*i..*i + count] == run);

        let first = match existing {
            Some(first) => first,
            None => {
                let first = self.options.len();
                self.options.extend_from_slice(run);
                first
            }
        };

        OptionRun {
            first: first as u8,
            count: count as u8,
        }
    }

    /// Resolve one of an entry's option runs against the option table.
    ///
    /// Decoding has already validated the indices, so this cannot fail for
    /// entries taken out of a decoded payload.
    pub fn run_options(&self, run: &OptionRun) -> &[SdOption] {
        let first = run.first as usize;
        &self.options[first..first + run.count as usize]
    }

    /// All options referenced by `entry`, first run then second run.
    pub fn entry_options<'a>(&'a self, entry: &'a Entry) -> impl Iterator<Item = &'a SdOption> {
        entry
            .runs()
            .iter()
            .filter(|run| run.count > 0)
            .flat_map(|run| self.run_options(run).iter())
    }

    /// Serialize flags, entries array and option array. Entries are
    /// written in insertion order.
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u8(self.flags.to_byte());
        bytes.put_bytes(0, 3);

        bytes.put_u32((self.entries.len() * ENTRY_SIZE) as u32);
        for entry in &self.entries {
            entry.encode(bytes);
        }

        let mut encoded_options = BytesMut::new();
        for option in &self.options {
            option.encode(&mut encoded_options);
        }

        bytes.put_u32(encoded_options.len() as u32);
        bytes.put(encoded_options);
    }

    /// Decode the payload of an SD frame (the bytes after the SOME/IP
    /// header).
    ///
    /// The entries and options array lengths are validated against the
    /// payload size, and every entry's option runs are validated against
    /// the decoded option table; any violation aborts the whole frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 12 {
            return Err(Error::Malformed);
        }

        let flags = Flags::from_byte(bytes[0]);

        let entries_len = u32::from_be_bytes(bytes[4..8].try_into()?) as usize;
        if entries_len % ENTRY_SIZE != 0 || bytes.len() < 12 + entries_len {
            return Err(Error::Malformed);
        }

        let mut entries = Vec::with_capacity(entries_len / ENTRY_SIZE);
        for chunk in bytes[8..8 + entries_len].chunks_exact(ENTRY_SIZE) {
            entries.push(Entry::decode(chunk)?);
        }

        let mut offset = 8 + entries_len;
        let options_len = u32::from_be_bytes(bytes[offset..offset + 4].try_into()?) as usize;
        offset += 4;
        if bytes.len() < offset + options_len {
            return Err(Error::Malformed);
        }

        let mut options = Vec::new();
        let end = offset + options_len;
        while offset < end {
            let (option, consumed) = SdOption::decode(&bytes[offset..end])?;
            options.push(option);
            offset += consumed;
        }

        for entry in &entries {
            for run in entry.runs() {
                if run.count > 0 && run.first as usize + run.count as usize > options.len() {
                    return Err(Error::OptionIndexOutOfRange);
                }
            }
        }

        Ok(Self {
            flags,
            entries,
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TTL_INFINITE, sd::options::TransportProtocol};

    fn endpoint() -> SdOption {
        SdOption::ipv4_endpoint("192.168.1.10".parse().unwrap(), TransportProtocol::Udp, 30509)
    }

    #[test]
    fn identical_options_are_shared() {
        let mut payload = SdPayload::new(Flags::default());
        payload.insert_entry(Entry::offer_service(0x1111, 0x0001, 1, 0, 300), &[endpoint()], &[]);
        payload.insert_entry(Entry::offer_service(0x2222, 0x0001, 1, 0, 300), &[endpoint()], &[]);

        assert_eq!(payload.options.len(), 1);
        assert_eq!(payload.entries[0].runs()[0], OptionRun { first: 0, count: 1 });
        assert_eq!(payload.entries[1].runs()[0], OptionRun { first: 0, count: 1 });
    }

    #[test]
    fn round_trip_preserves_structure() {
        let mut payload = SdPayload::new(Flags {
            reboot: true,
            unicast: true,
            explicit_initial_data: false,
        });
        payload.insert_entry(
            Entry::offer_service(0x1111, 0x2222, 1, 0, TTL_INFINITE),
            &[endpoint()],
            &[],
        );
        payload.insert_entry(Entry::subscribe(0x1111, 0x2222, 0x0005, 1, 0, 3), &[endpoint()], &[]);

        let mut bytes = BytesMut::new();
        payload.encode(&mut bytes);

        assert_eq!(SdPayload::decode(&bytes).unwrap(), payload);
    }

    #[test]
    fn ttl_upper_byte_is_truncated() {
        let mut bytes = BytesMut::new();
        put_ttl(&mut bytes, 0x1234_5678);

        assert_eq!(&bytes[..], &[0x34, 0x56, 0x78]);

        let mut bytes = BytesMut::new();
        put_ttl(&mut bytes, 0x00AB_CDEF);

        assert_eq!(&bytes[..], &[0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn out_of_range_option_index_aborts_the_frame() {
        let mut payload = SdPayload::new(Flags::default());
        payload.insert_entry(Entry::offer_service(0x1111, 0x0001, 1, 0, 300), &[endpoint()], &[]);

        let mut bytes = BytesMut::new();
        payload.encode(&mut bytes);

        // Rewrite the entry's first run to point past the option table.
        bytes[9] = 7;

        assert_eq!(SdPayload::decode(&bytes), Err(Error::OptionIndexOutOfRange));
    }

    #[test]
    fn truncated_arrays_are_rejected() {
        let mut payload = SdPayload::new(Flags::default());
        payload.insert_entry(Entry::find_service(0x1111, 0xFFFF, 0xFF, 0xFFFF_FFFF, 300), &[], &[]);

        let mut bytes = BytesMut::new();
        payload.encode(&mut bytes);

        // Claim a longer entries array than the payload carries.
        bytes[7] = 0x40;

        assert_eq!(SdPayload::decode(&bytes), Err(Error::Malformed));
    }
}
