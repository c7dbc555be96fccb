use anyhow::Result;
use bytes::BytesMut;
use someip_router_codec::{
    CLIENT_COOKIE, Direction, find_cookie,
    message::{Header, Message, MessageType, ReturnCode},
    sd::{Entry, Flags, OptionRun, SdPayload, ServiceEntryType, options::{SdOption, TransportProtocol}},
};

#[rustfmt::skip]
const REQUEST_SAMPLE: &[u8] = &[
    0x12, 0x34, 0x56, 0x78, 0x00, 0x00, 0x00, 0x0B, 0xAA, 0xBB, 0x00, 0x01,
    0x01, 0x01, 0x00, 0x00, 0x01, 0x02, 0x03,
];

#[rustfmt::skip]
const OFFER_SAMPLE: &[u8] = &[
    // SOME/IP header: 0xFFFF/0x8100, length 0x30 covering the SD payload.
    0xFF, 0xFF, 0x81, 0x00, 0x00, 0x00, 0x00, 0x30, 0x00, 0x00, 0x00, 0x01,
    0x01, 0x01, 0x02, 0x00,
    // Flags (reboot | unicast) and reserved.
    0xC0, 0x00, 0x00, 0x00,
    // One 16 byte entry: OfferService 0x1111/0x2222 v1.0, infinite TTL,
    // referencing one option at index 0.
    0x00, 0x00, 0x00, 0x10,
    0x01, 0x00, 0x00, 0x10, 0x11, 0x11, 0x22, 0x22, 0x01, 0xFF, 0xFF, 0xFF,
    0x00, 0x00, 0x00, 0x00,
    // One IPv4 endpoint option: 192.168.1.10, UDP, 30509.
    0x00, 0x00, 0x00, 0x0C,
    0x00, 0x09, 0x04, 0x00, 0xC0, 0xA8, 0x01, 0x0A, 0x00, 0x11, 0x77, 0x2D,
];

#[test]
fn request_header_round_trip() -> Result<()> {
    let (message, consumed) = Message::decode(REQUEST_SAMPLE)?;

    assert_eq!(consumed, REQUEST_SAMPLE.len());
    assert_eq!(message.header.service, 0x1234);
    assert_eq!(message.header.method, 0x5678);
    assert_eq!(message.header.length, 0x0B);
    assert_eq!(message.header.client, 0xAABB);
    assert_eq!(message.header.session, 0x0001);
    assert_eq!(message.header.protocol_version, 0x01);
    assert_eq!(message.header.interface_version, 0x01);
    assert_eq!(message.header.message_type, MessageType::Request);
    assert_eq!(message.header.return_code, ReturnCode::Ok);
    assert_eq!(message.payload, &[0x01, 0x02, 0x03]);

    let mut bytes = BytesMut::new();
    message.encode(&mut bytes);
    assert_eq!(&bytes[..], REQUEST_SAMPLE);

    Ok(())
}

#[test]
fn offer_frame_encodes_to_the_reference_bytes() -> Result<()> {
    let mut payload = SdPayload::new(Flags {
        reboot: true,
        unicast: true,
        explicit_initial_data: false,
    });
    payload.insert_entry(
        Entry::offer_service(0x1111, 0x2222, 1, 0, 0xFF_FFFF),
        &[SdOption::ipv4_endpoint(
            "192.168.1.10".parse()?,
            TransportProtocol::Udp,
            30509,
        )],
        &[],
    );

    let mut body = BytesMut::new();
    payload.encode(&mut body);

    let mut header = Header::new(0xFFFF, 0x8100, MessageType::Notification);
    header.session = 0x0001;
    header.interface_version = 0x01;

    let mut frame = BytesMut::new();
    Message {
        header,
        payload: &body,
    }
    .encode(&mut frame);

    assert_eq!(&frame[..], OFFER_SAMPLE);

    Ok(())
}

#[test]
fn offer_frame_decodes_with_resolved_indices() -> Result<()> {
    let (message, consumed) = Message::decode(OFFER_SAMPLE)?;

    assert_eq!(consumed, OFFER_SAMPLE.len());
    assert!(message.header.is_sd());

    let payload = SdPayload::decode(message.payload)?;
    assert!(payload.flags.reboot);
    assert!(payload.flags.unicast);
    assert_eq!(payload.entries.len(), 1);
    assert_eq!(payload.options.len(), 1);

    let Entry::Service(entry) = &payload.entries[0] else {
        anyhow::bail!("expected a service entry");
    };

    assert_eq!(entry.kind, ServiceEntryType::OfferService);
    assert_eq!(entry.service, 0x1111);
    assert_eq!(entry.instance, 0x2222);
    assert_eq!(entry.major, 1);
    assert_eq!(entry.minor, 0);
    assert_eq!(entry.ttl, 0xFF_FFFF);
    assert_eq!(entry.runs[0], OptionRun { first: 0, count: 1 });

    let endpoint = payload
        .entry_options(&payload.entries[0])
        .next()
        .and_then(SdOption::as_endpoint)
        .unwrap();

    assert_eq!(endpoint.socket_addr(), "192.168.1.10:30509".parse()?);
    assert_eq!(endpoint.protocol, TransportProtocol::Udp);

    Ok(())
}

#[test]
fn garbage_before_a_cookie_is_skippable() -> Result<()> {
    // A stream endpoint that fails to decode at the current offset scans
    // for the next cookie and resumes behind it.
    let mut stream = vec![0xAA, 0xBB];
    stream.extend_from_slice(&CLIENT_COOKIE);
    stream.extend_from_slice(REQUEST_SAMPLE);

    assert!(Message::decode(&stream).is_err());

    let offset = find_cookie(&stream, Direction::ClientToService).unwrap();
    assert_eq!(offset, 2);

    // The cookie itself decodes as a message and is discarded by the
    // endpoint; the real message follows.
    let (cookie, consumed) = Message::decode(&stream[offset..])?;
    assert!(cookie.header.is_magic_cookie());

    let (message, _) = Message::decode(&stream[offset + consumed..])?;
    assert_eq!(message.header.service, 0x1234);
    assert_eq!(message.payload, &[0x01, 0x02, 0x03]);

    Ok(())
}
