//! MQTT v3.1.1 codec tests
//!
//! Encoding and decoding for all fourteen control packet types, based on
//! the OASIS specification sections 2 and 3, plus malformed-input cases
//! for reserved-flag and remaining-length enforcement.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use crate::codec::{read_remaining_length, write_remaining_length, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PacketType, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, Subscription, UnsubAck,
    Unsubscribe, Will,
};

// ============================================================================
// Helpers
// ============================================================================

fn encode_packet(packet: &Packet) -> BytesMut {
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    let mut decoder = Decoder::new();
    match decoder.decode(buf)? {
        Some((packet, _)) => Ok(packet),
        None => Err(DecodeError::InsufficientData),
    }
}

fn roundtrip(packet: Packet) {
    let encoded = encode_packet(&packet);
    let decoded = decode_packet(&encoded).unwrap();
    assert_eq!(packet, decoded);
}

// ============================================================================
// CONNECT (MQTT-3.1)
// ============================================================================

#[test]
fn connect_minimal() {
    roundtrip(Packet::Connect(Box::new(Connect {
        client_id: String::new(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
        will: None,
    })));
}

#[test]
fn connect_full() {
    roundtrip(Packet::Connect(Box::new(Connect {
        client_id: "test-client-123".to_string(),
        clean_session: false,
        keep_alive: 300,
        username: Some("user".to_string()),
        password: Some(Bytes::from("password")),
        will: Some(Will {
            topic: "last/will/topic".to_string(),
            payload: Bytes::from("goodbye"),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
    })));
}

#[test]
fn connect_password_without_username_is_rejected() {
    // Flags byte 0x42: clean session + password, no username
    // [MQTT-3.1.2-22]
    let buf = [
        0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x42, 0x00, 0x3C, 0x00, 0x02, b'c',
        b'1',
    ];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn connect_reserved_flag_bit_is_rejected() {
    let buf = [
        0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x03, 0x00, 0x3C, 0x00, 0x02, b'c',
        b'1',
    ];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn connect_unknown_protocol_version_is_rejected() {
    let buf = [
        0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x09, 0x02, 0x00, 0x3C, 0x00, 0x02, b'c',
        b'1',
    ];
    assert_eq!(
        decode_packet(&buf),
        Err(DecodeError::InvalidProtocolVersion(9))
    );
}

// ============================================================================
// CONNACK (MQTT-3.2)
// ============================================================================

#[test]
fn connack_accepted() {
    roundtrip(Packet::ConnAck(ConnAck {
        session_present: true,
        return_code: ConnectReturnCode::Accepted,
    }));
}

#[test]
fn connack_refusals() {
    for code in [
        ConnectReturnCode::UnacceptableProtocolVersion,
        ConnectReturnCode::IdentifierRejected,
        ConnectReturnCode::ServerUnavailable,
        ConnectReturnCode::BadUsernameOrPassword,
        ConnectReturnCode::NotAuthorized,
    ] {
        roundtrip(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: code,
        }));
    }
}

#[test]
fn connack_reserved_acknowledge_bits_are_rejected() {
    let buf = [0x20, 0x02, 0x02, 0x00];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn connack_unknown_return_code_is_rejected() {
    let buf = [0x20, 0x02, 0x00, 0x06];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidReturnCode(6)));
}

// ============================================================================
// PUBLISH (MQTT-3.3)
// ============================================================================

#[test]
fn publish_qos0() {
    roundtrip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: "/topic".to_string(),
        packet_id: None,
        payload: Bytes::from("test_data"),
    }));
}

#[test]
fn publish_qos1_with_packet_id() {
    roundtrip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: true,
        topic: "a/b/c".to_string(),
        packet_id: Some(10),
        payload: Bytes::from_static(b"payload"),
    }));
}

#[test]
fn publish_qos2_dup() {
    roundtrip(Packet::Publish(Publish {
        dup: true,
        qos: QoS::ExactlyOnce,
        retain: false,
        topic: "sensors/temperature".to_string(),
        packet_id: Some(65535),
        payload: Bytes::from(vec![0u8; 300]),
    }));
}

#[test]
fn publish_empty_payload() {
    roundtrip(Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: true,
        topic: "retained/clear".to_string(),
        packet_id: None,
        payload: Bytes::new(),
    }));
}

#[test]
fn publish_qos0_carries_no_packet_id_on_the_wire() {
    let encoded = encode_packet(&Packet::Publish(Publish {
        topic: "t".to_string(),
        payload: Bytes::from_static(b"x"),
        ..Default::default()
    }));
    // type+flags, remaining length, topic length prefix, 't', payload
    assert_eq!(&encoded[..], &[0x30, 0x04, 0x00, 0x01, b't', b'x']);
}

#[test]
fn publish_dup_with_qos0_is_rejected() {
    let buf = [0x38, 0x04, 0x00, 0x01, b't', b'x'];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn publish_qos3_is_rejected() {
    let buf = [0x36, 0x06, 0x00, 0x01, b't', 0x00, 0x01, b'x'];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidQoS(3)));
}

#[test]
fn publish_packet_id_zero_is_rejected() {
    let buf = [0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn publish_wildcard_topic_is_rejected() {
    let buf = [0x30, 0x05, 0x00, 0x03, b'a', b'/', b'#'];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn publish_invalid_utf8_topic_is_rejected() {
    let buf = [0x30, 0x05, 0x00, 0x02, 0xC3, 0x28, b'x'];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidUtf8));
}

// ============================================================================
// PUBACK / PUBREC / PUBREL / PUBCOMP (MQTT-3.4 .. 3.7)
// ============================================================================

#[test]
fn acknowledgement_roundtrips() {
    roundtrip(Packet::PubAck(PubAck::new(1)));
    roundtrip(Packet::PubRec(PubRec::new(256)));
    roundtrip(Packet::PubRel(PubRel::new(4660)));
    roundtrip(Packet::PubComp(PubComp::new(65535)));
}

#[test]
fn pubrel_has_reserved_flags_0010() {
    let encoded = encode_packet(&Packet::PubRel(PubRel::new(7)));
    assert_eq!(&encoded[..], &[0x62, 0x02, 0x00, 0x07]);
}

#[test]
fn pubrel_with_wrong_flags_is_rejected() {
    let buf = [0x60, 0x02, 0x00, 0x07];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn puback_with_nonzero_flags_is_rejected() {
    let buf = [0x41, 0x02, 0x00, 0x07];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn puback_with_extra_payload_is_rejected() {
    let buf = [0x40, 0x03, 0x00, 0x07, 0xFF];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

// ============================================================================
// SUBSCRIBE / SUBACK (MQTT-3.8, 3.9)
// ============================================================================

#[test]
fn subscribe_roundtrip() {
    roundtrip(Packet::Subscribe(Subscribe {
        packet_id: 2,
        subscriptions: vec![
            Subscription {
                filter: "a/+/b".to_string(),
                qos: QoS::AtLeastOnce,
            },
            Subscription {
                filter: "c/#".to_string(),
                qos: QoS::ExactlyOnce,
            },
        ],
    }));
}

#[test]
fn subscribe_with_wrong_flags_is_rejected() {
    let buf = [0x80, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x00];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn subscribe_without_filters_is_rejected() {
    let buf = [0x82, 0x02, 0x00, 0x01];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn subscribe_reserved_qos_bits_are_rejected() {
    let buf = [0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'b', 0x44];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

#[test]
fn suback_roundtrip() {
    roundtrip(Packet::SubAck(SubAck {
        packet_id: 2,
        return_codes: vec![
            SubscribeReturnCode::GrantedQoS1,
            SubscribeReturnCode::GrantedQoS2,
            SubscribeReturnCode::Failure,
        ],
    }));
}

#[test]
fn suback_unknown_return_code_is_rejected() {
    let buf = [0x90, 0x03, 0x00, 0x02, 0x03];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidReturnCode(3)));
}

// ============================================================================
// UNSUBSCRIBE / UNSUBACK (MQTT-3.10, 3.11)
// ============================================================================

#[test]
fn unsubscribe_roundtrip() {
    roundtrip(Packet::Unsubscribe(Unsubscribe {
        packet_id: 3,
        filters: vec!["a/b".to_string(), "c/#".to_string()],
    }));
}

#[test]
fn unsubscribe_without_filters_is_rejected() {
    let buf = [0xA2, 0x02, 0x00, 0x03];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn unsuback_roundtrip() {
    roundtrip(Packet::UnsubAck(UnsubAck::new(3)));
}

// ============================================================================
// PINGREQ / PINGRESP / DISCONNECT (MQTT-3.12 .. 3.14)
// ============================================================================

#[test]
fn ping_and_disconnect_wire_bytes() {
    assert_eq!(&encode_packet(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(&encode_packet(&Packet::PingResp)[..], &[0xD0, 0x00]);
    assert_eq!(&encode_packet(&Packet::Disconnect)[..], &[0xE0, 0x00]);
}

#[test]
fn ping_and_disconnect_roundtrip() {
    roundtrip(Packet::PingReq);
    roundtrip(Packet::PingResp);
    roundtrip(Packet::Disconnect);
}

#[test]
fn pingreq_with_payload_is_rejected() {
    let buf = [0xC0, 0x01, 0x00];
    assert!(matches!(
        decode_packet(&buf),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn disconnect_with_flags_is_rejected() {
    let buf = [0xE1, 0x00];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidFlags));
}

// ============================================================================
// Fixed header / remaining length
// ============================================================================

#[test]
fn remaining_length_boundaries() {
    for (value, encoded_len) in [
        (0u32, 1usize),
        (127, 1),
        (128, 2),
        (16_383, 2),
        (16_384, 3),
        (2_097_151, 3),
        (2_097_152, 4),
        (268_435_455, 4),
    ] {
        let mut buf = BytesMut::new();
        assert_eq!(write_remaining_length(&mut buf, value).unwrap(), encoded_len);
        assert_eq!(read_remaining_length(&buf).unwrap(), (value, encoded_len));
    }
}

#[test]
fn remaining_length_fifth_byte_is_rejected() {
    let buf = [0xFF, 0xFF, 0xFF, 0xFF, 0x01];
    assert_eq!(
        read_remaining_length(&buf),
        Err(DecodeError::InvalidRemainingLength)
    );
}

#[test]
fn remaining_length_over_maximum_is_rejected() {
    let mut buf = BytesMut::new();
    assert_eq!(
        write_remaining_length(&mut buf, 268_435_456),
        Err(crate::protocol::EncodeError::PacketTooLarge)
    );
}

#[test]
fn invalid_packet_type_is_rejected() {
    let buf = [0xF0, 0x00];
    assert_eq!(decode_packet(&buf), Err(DecodeError::InvalidPacketType(15)));
}

#[test]
fn packet_type_nibbles_cover_exactly_1_through_14() {
    for v in 1u8..=14 {
        assert_eq!(PacketType::from_u8(v).map(|t| t as u8), Some(v));
    }
    assert_eq!(PacketType::from_u8(0), None);
    assert_eq!(PacketType::from_u8(15), None);
}

#[test]
fn decoder_waits_for_complete_packet() {
    let mut decoder = Decoder::new();
    let full = encode_packet(&Packet::Publish(Publish {
        topic: "a/b".to_string(),
        payload: Bytes::from_static(b"hello"),
        ..Default::default()
    }));

    // Every strict prefix decodes to "not yet"
    for end in 0..full.len() {
        assert_eq!(decoder.decode(&full[..end]).unwrap(), None);
    }
    let (packet, consumed) = decoder.decode(&full).unwrap().unwrap();
    assert_eq!(consumed, full.len());
    assert!(matches!(packet, Packet::Publish(_)));
}

#[test]
fn decoder_enforces_max_packet_size() {
    let mut decoder = Decoder::new().with_max_packet_size(16);
    let big = encode_packet(&Packet::Publish(Publish {
        topic: "t".to_string(),
        payload: Bytes::from(vec![0u8; 64]),
        ..Default::default()
    }));
    assert_eq!(decoder.decode(&big), Err(DecodeError::PacketTooLarge));
}

#[test]
fn decoder_reports_consumed_length_for_back_to_back_packets() {
    let mut buf = BytesMut::new();
    let encoder = Encoder::new();
    encoder.encode(&Packet::PubAck(PubAck::new(1)), &mut buf).unwrap();
    encoder.encode(&Packet::PingReq, &mut buf).unwrap();

    let mut decoder = Decoder::new();
    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PubAck(PubAck::new(1)));
    let (second, _) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, Packet::PingReq);
}

// ============================================================================
// Stream-level operations
// ============================================================================

#[tokio::test]
async fn stream_level_read_write_roundtrip() {
    use crate::codec::{read_packet, write_packet};
    use crate::protocol::HandlerError;
    use crate::transport::NetStream;

    let (near, far) = tokio::io::duplex(256);
    let mut write_side = NetStream::new(near);
    let mut read_side = NetStream::new(far);

    let publish = Packet::Publish(Publish {
        qos: QoS::AtLeastOnce,
        packet_id: Some(7),
        topic: "a/b".to_string(),
        payload: Bytes::from_static(b"hello"),
        ..Default::default()
    });

    write_packet(&mut write_side, &publish).await.unwrap();
    write_packet(&mut write_side, &Packet::PingReq).await.unwrap();

    assert_eq!(read_packet(&mut read_side).await.unwrap(), publish);
    assert_eq!(read_packet(&mut read_side).await.unwrap(), Packet::PingReq);

    drop(write_side);
    assert!(matches!(
        read_packet(&mut read_side).await,
        Err(HandlerError::ConnectionClosed)
    ));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn remaining_length_roundtrips(value in 0u32..=268_435_455) {
        let mut buf = BytesMut::new();
        let written = write_remaining_length(&mut buf, value).unwrap();
        prop_assert_eq!(read_remaining_length(&buf).unwrap(), (value, written));
    }

    #[test]
    fn publish_roundtrips(
        topic in "[a-zA-Z0-9/_-]{1,32}",
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        qos_bits in 0u8..=2,
        retain in any::<bool>(),
        packet_id in 1u16..,
    ) {
        let qos = QoS::from_u8(qos_bits).unwrap();
        let packet = Packet::Publish(Publish {
            dup: qos != QoS::AtMostOnce && packet_id % 2 == 0,
            qos,
            retain,
            topic,
            packet_id: (qos != QoS::AtMostOnce).then_some(packet_id),
            payload: Bytes::from(payload),
        });
        let encoded = encode_packet(&packet);
        prop_assert_eq!(decode_packet(&encoded).unwrap(), packet);
    }

    #[test]
    fn acknowledgements_roundtrip(packet_id in any::<u16>()) {
        for packet in [
            Packet::PubAck(PubAck::new(packet_id)),
            Packet::PubRec(PubRec::new(packet_id)),
            Packet::PubRel(PubRel::new(packet_id)),
            Packet::PubComp(PubComp::new(packet_id)),
            Packet::UnsubAck(UnsubAck::new(packet_id)),
        ] {
            let encoded = encode_packet(&packet);
            prop_assert_eq!(decode_packet(&encoded).unwrap(), packet);
        }
    }
}
