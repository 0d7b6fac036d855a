use courier_wire::{
    DeviceToken, FeedbackParser, ResponseStatus, decode_response, encode_notification,
};

#[test]
fn notification_vector_matches_gateway_interface() {
    let token = DeviceToken::from_bytes(&[0x11; 32]).expect("token");
    let payload = b"{\"aps\":{\"alert\":\"hi\"}}";
    let frame =
        encode_notification(&token, payload, 2_000_000_000, 0x0A0B_0C0D, 256).expect("frame");

    let mut expected = hex_to_bytes("010a0b0c0d773594000020");
    expected.extend(std::iter::repeat_n(0x11u8, 32));
    expected.extend(hex_to_bytes("0016"));
    expected.extend_from_slice(payload);
    assert_eq!(frame.as_ref(), expected.as_slice());
}

#[test]
fn response_vector_decodes_invalid_token() {
    let frame = hex_to_bytes("08080a0b0c0d");
    let response = decode_response(&frame).expect("decode");
    assert_eq!(response.status, ResponseStatus::InvalidToken);
    assert_eq!(response.identifier, 0x0A0B_0C0D);
}

#[test]
fn feedback_vector_survives_uneven_chunking() {
    let mut stream = hex_to_bytes("5f5e10000020");
    stream.extend(std::iter::repeat_n(0xAAu8, 32));
    stream.extend(hex_to_bytes("5f5e10010020"));
    stream.extend(std::iter::repeat_n(0xBBu8, 32));

    // The four chunk sizes from the protocol capture: 5, 1, 37, 33.
    let mut parser = FeedbackParser::new();
    let mut records = Vec::new();
    let mut offset = 0;
    for size in [5usize, 1, 37, 33] {
        records.extend(parser.feed(&stream[offset..offset + size]).expect("feed"));
        offset += size;
    }
    assert_eq!(offset, stream.len());

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].timestamp, 1_600_000_000);
    assert_eq!(records[0].token, DeviceToken::from_bytes(&[0xAA; 32]).expect("token"));
    assert_eq!(records[1].timestamp, 1_600_000_001);
    assert_eq!(records[1].token, DeviceToken::from_bytes(&[0xBB; 32]).expect("token"));
    assert_eq!(parser.pending(), 0);
}

#[test]
fn encode_decode_round_trip_recovers_fields() {
    let token = DeviceToken::from_hex(&"f00d".repeat(16)).expect("token");
    for (payload, expiry, identifier) in [
        (&b""[..], 0u32, 0u32),
        (&b"{\"aps\":{}}"[..], 1, u32::MAX),
        (&[0xFFu8; 256][..], u32::MAX, 0x8000_0001),
    ] {
        let frame = encode_notification(&token, payload, expiry, identifier, 256).expect("frame");

        assert_eq!(frame[0], 1);
        assert_eq!(u32::from_be_bytes(frame[1..5].try_into().unwrap()), identifier);
        assert_eq!(u32::from_be_bytes(frame[5..9].try_into().unwrap()), expiry);
        assert_eq!(u16::from_be_bytes(frame[9..11].try_into().unwrap()), 32);
        assert_eq!(&frame[11..43], token.as_bytes());
        let payload_len = u16::from_be_bytes(frame[43..45].try_into().unwrap()) as usize;
        assert_eq!(payload_len, payload.len());
        assert_eq!(&frame[45..45 + payload_len], payload);
        assert_eq!(frame.len(), 45 + payload_len);
    }
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert!(hex.len().is_multiple_of(2), "hex length must be even");
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = from_hex_char(pair[0]) << 4;
            let lo = from_hex_char(pair[1]);
            hi | lo
        })
        .collect()
}

fn from_hex_char(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex char"),
    }
}
