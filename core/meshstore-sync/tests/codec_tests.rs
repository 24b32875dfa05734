use bytes::{BufMut, BytesMut};
use meshstore_sync::p2p::codec::MAX_FRAME_SIZE;
use meshstore_sync::{Checkpoint, Hello, Setup, SyncCodec, SyncError, SyncMessage, Update};
use meshstore_types::{ObjectId, Timestamp};
use pretty_assertions::assert_eq;
use tokio_util::codec::{Decoder, Encoder};

fn update(id: &str, value: &str) -> Update {
    Update {
        object_id: ObjectId::new(id),
        key: "title".into(),
        timestamp: Timestamp::from_secs(1.5),
        values: [value.to_string()].into_iter().collect(),
    }
}

fn decode_all(buf: &mut BytesMut) -> Vec<SyncMessage> {
    let mut codec = SyncCodec;
    let mut out = Vec::new();
    while let Some(message) = codec.decode(buf).unwrap() {
        out.push(message);
    }
    out
}

// ── Framing ──────────────────────────────────────────────────────

#[test]
fn frame_layout_is_tag_length_json() {
    let mut buf = BytesMut::new();
    SyncCodec.encode_message(&Checkpoint { serial: 7 }, &mut buf).unwrap();

    let payload = br#"{"serial":7}"#;
    assert_eq!(buf[0], 4);
    assert_eq!(&buf[1..5], &(payload.len() as u32).to_be_bytes());
    assert_eq!(&buf[5..], payload);
}

#[test]
fn decodes_every_message_type() {
    let messages = vec![
        SyncMessage::Hello(Hello { name: "node-a".into() }),
        SyncMessage::Setup(Setup {
            last_serial_in_db: 10,
            last_serial_received: 4,
        }),
        SyncMessage::Update(update("a", "X")),
        SyncMessage::Checkpoint(Checkpoint { serial: 10 }),
    ];
    let mut buf = BytesMut::new();
    let mut codec = SyncCodec;
    for message in messages.clone() {
        codec.encode(message, &mut buf).unwrap();
    }

    assert_eq!(decode_all(&mut buf), messages);
    assert!(buf.is_empty());
}

#[test]
fn partial_frame_stays_buffered() {
    let mut full = BytesMut::new();
    SyncCodec.encode_message(&Hello { name: "a".into() }, &mut full).unwrap();
    SyncCodec.encode_message(&update("obj", "value"), &mut full).unwrap();
    let split = full.len() - 3;

    let mut buf = BytesMut::from(&full[..split]);
    let first = decode_all(&mut buf);
    assert_eq!(first, vec![SyncMessage::Hello(Hello { name: "a".into() })]);
    assert!(!buf.is_empty());

    buf.extend_from_slice(&full[split..]);
    assert_eq!(decode_all(&mut buf), vec![SyncMessage::Update(update("obj", "value"))]);
    assert!(buf.is_empty());
}

#[test]
fn header_split_across_reads() {
    let mut full = BytesMut::new();
    SyncCodec.encode_message(&Checkpoint { serial: 1 }, &mut full).unwrap();

    let mut buf = BytesMut::new();
    for byte in full.iter() {
        assert!(decode_all(&mut buf).is_empty());
        buf.put_u8(*byte);
    }
    assert_eq!(
        decode_all(&mut buf),
        vec![SyncMessage::Checkpoint(Checkpoint { serial: 1 })]
    );
}

#[test]
fn empty_buffer_yields_nothing() {
    let mut buf = BytesMut::new();
    assert!(SyncCodec.decode(&mut buf).unwrap().is_none());
}

// ── Batches ──────────────────────────────────────────────────────

#[test]
fn encode_batch_returns_count() {
    let updates = vec![update("a", "1"), update("b", "2"), update("c", "3")];
    let mut buf = BytesMut::new();
    assert_eq!(SyncCodec.encode_batch(&updates, &mut buf).unwrap(), 3);
    assert_eq!(decode_all(&mut buf).len(), 3);
}

#[test]
fn encode_empty_batch_writes_nothing() {
    let mut buf = BytesMut::new();
    let none: Vec<Update> = Vec::new();
    assert_eq!(SyncCodec.encode_batch(&none, &mut buf).unwrap(), 0);
    assert!(buf.is_empty());
}

// ── Errors ───────────────────────────────────────────────────────

#[test]
fn unknown_tag_is_protocol_error() {
    let mut buf = BytesMut::new();
    buf.put_u8(99);
    buf.put_u32(2);
    buf.extend_from_slice(b"{}");
    let err = SyncCodec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, SyncError::Protocol(ref msg) if msg.contains("unknown message type")));
}

#[test]
fn oversized_length_is_rejected_before_buffering() {
    let mut buf = BytesMut::new();
    buf.put_u8(1);
    buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
    let err = SyncCodec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, SyncError::Protocol(ref msg) if msg.contains("too large")));
}

#[test]
fn invalid_json_is_serialization_error() {
    let mut buf = BytesMut::new();
    buf.put_u8(1);
    buf.put_u32(8);
    buf.extend_from_slice(b"not json");
    let err = SyncCodec.decode(&mut buf).unwrap_err();
    assert!(matches!(err, SyncError::Serialization(_)));
}

#[test]
fn payload_of_wrong_shape_is_serialization_error() {
    let mut buf = BytesMut::new();
    SyncCodec.encode_message(&Checkpoint { serial: 3 }, &mut buf).unwrap();
    buf[0] = 1; // Hello tag over a Checkpoint payload
    assert!(matches!(
        SyncCodec.decode(&mut buf).unwrap_err(),
        SyncError::Serialization(_)
    ));
}
