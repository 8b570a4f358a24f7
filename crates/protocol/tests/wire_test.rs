//! Wire-level tests: JSON-shaped payloads crossing the frame boundary and
//! interop between the blocking framing and the tokio codec.

use bytes::BytesMut;
use serde_json::{json, Value};
use tokio_util::codec::{Decoder, Encoder};

use workfarm_protocol::frame::{codec, read_frame, write_frame};
use workfarm_protocol::{ChildMessage, ParentMessage, RemoteError};

fn representative_values() -> Vec<Value> {
    vec![
        Value::Null,
        json!(true),
        json!(0),
        json!(-17),
        json!(i64::MIN),
        json!(u64::MAX),
        json!(3.25),
        json!(1.0),
        json!(""),
        json!("unicode ✓ 日本語 \u{0000} tail"),
        json!([]),
        json!({}),
        json!([1, "two", [3, [4, {"five": null}]]]),
        json!({
            "name": "fixture",
            "tags": ["a", "b"],
            "nested": {"depth": {"deeper": {"deepest": [true, false, null]}}},
            "numbers": [0.5, -2, 10000000000u64]
        }),
    ]
}

#[test]
fn json_shapes_survive_call_and_reply() {
    for value in representative_values() {
        let call = ChildMessage::Call {
            method: "echo".into(),
            args: vec![value.clone(), json!([value.clone()])],
            lazy_sequence: false,
        };
        let decoded = ChildMessage::from_bytes(&call.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, call, "call args changed for {value}");

        let reply = ParentMessage::Ok {
            result: value.clone(),
        };
        let decoded = ParentMessage::from_bytes(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, reply, "result changed for {value}");
    }
}

#[test]
fn blocking_frames_decode_with_tokio_codec() {
    let msg = ParentMessage::ClientError(
        RemoteError::new("TypeError", "bad input").with_extra("field", "path"),
    );
    let payload = msg.to_bytes().unwrap();

    let mut raw = Vec::new();
    write_frame(&mut raw, &payload).unwrap();
    write_frame(&mut raw, &ParentMessage::Ok { result: json!(1) }.to_bytes().unwrap()).unwrap();

    let mut buf = BytesMut::from(&raw[..]);
    let mut codec = codec();
    let first = codec.decode(&mut buf).unwrap().expect("first frame");
    assert_eq!(ParentMessage::from_bytes(&first).unwrap(), msg);
    let second = codec.decode(&mut buf).unwrap().expect("second frame");
    assert_eq!(
        ParentMessage::from_bytes(&second).unwrap(),
        ParentMessage::Ok { result: json!(1) }
    );
    assert!(codec.decode(&mut buf).unwrap().is_none());
}

#[test]
fn tokio_codec_frames_read_with_blocking_reader() {
    let msg = ChildMessage::Initialize {
        module_path: "/opt/modules/transform".into(),
        setup_args: vec![json!({"cache": true})],
    };

    let mut buf = BytesMut::new();
    codec()
        .encode(bytes::Bytes::from(msg.to_bytes().unwrap()), &mut buf)
        .unwrap();

    let mut cursor = std::io::Cursor::new(buf.to_vec());
    let frame = read_frame(&mut cursor).unwrap().expect("frame");
    assert_eq!(ChildMessage::from_bytes(&frame).unwrap(), msg);
}
