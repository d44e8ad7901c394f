use std::collections::BTreeMap;
use std::io::Cursor;

use pods_wire::{decode, read_message, write_message, Envelope, EnvelopeError};

fn roundtrip(value: &Envelope) -> Envelope {
    let bytes = value.encode_to_vec();
    let mut cursor = Cursor::new(bytes.as_slice());
    let decoded = decode(&mut cursor).expect("decode");
    assert_eq!(
        cursor.position() as usize,
        bytes.len(),
        "decode must consume exactly one value"
    );
    decoded
}

fn dict(entries: &[(&str, Envelope)]) -> Envelope {
    Envelope::Dict(
        entries
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
    )
}

#[test]
fn scalar_roundtrips() {
    for value in [
        Envelope::Int(0),
        Envelope::Int(42),
        Envelope::Int(-17),
        Envelope::Int(i64::MAX),
        Envelope::Int(i64::MIN),
        Envelope::str(""),
        Envelope::str("describe"),
        Envelope::bytes(vec![0u8, 255, 13, 10]),
    ] {
        assert_eq!(roundtrip(&value), value);
    }
}

#[test]
fn nested_roundtrip() {
    let message = dict(&[
        ("op", Envelope::str("invoke")),
        ("id", Envelope::str("12")),
        ("var", Envelope::str("pod.test-pod/add-one")),
        (
            "args",
            Envelope::List(vec![Envelope::Int(1), Envelope::str("x")]),
        ),
        ("nested", dict(&[("k", Envelope::List(vec![]))])),
    ]);
    assert_eq!(roundtrip(&message), message);
}

#[test]
fn dict_keys_encode_sorted() {
    let message = dict(&[
        ("zebra", Envelope::Int(1)),
        ("alpha", Envelope::Int(2)),
        ("mid", Envelope::Int(3)),
    ]);
    let encoded = message.encode_to_vec();
    assert_eq!(
        String::from_utf8(encoded).expect("utf-8"),
        "d5:alphai2e3:midi3e5:zebrai1ee"
    );
}

#[test]
fn decode_tolerates_unsorted_keys() {
    let raw = b"d1:bi2e1:ai1ee";
    let decoded = decode(&mut Cursor::new(&raw[..])).expect("decode");
    assert_eq!(decoded, dict(&[("a", Envelope::Int(1)), ("b", Envelope::Int(2))]));
}

#[test]
fn decode_leaves_tail_in_stream() {
    let mut bytes = Envelope::Int(7).encode_to_vec();
    bytes.extend_from_slice(&Envelope::str("tail").encode_to_vec());
    let mut cursor = Cursor::new(bytes.as_slice());
    assert_eq!(decode(&mut cursor).expect("first"), Envelope::Int(7));
    assert_eq!(decode(&mut cursor).expect("second"), Envelope::str("tail"));
    assert!(read_message(&mut cursor).expect("end").is_none());
}

#[test]
fn clean_eof_is_none_mid_value_is_truncated() {
    let mut empty = Cursor::new(&b""[..]);
    assert!(read_message(&mut empty).expect("clean eof").is_none());

    for partial in ["i42", "5:abc", "li1e", "d2:op"] {
        let result = read_message(&mut Cursor::new(partial.as_bytes()));
        assert!(
            matches!(result, Err(EnvelopeError::Truncated)),
            "{partial:?} should be truncated, got {result:?}"
        );
    }
}

#[test]
fn malformed_inputs_rejected() {
    for bad in [
        "x",          // unknown type prefix
        "ie",         // empty integer
        "i-e",        // sign only
        "i03e",       // leading zero
        "i-0e",       // negative zero
        "i12x3e",     // junk inside integer
        "i9223372036854775808e", // overflow
        "3x:abc",     // junk inside length
        "di1ei2ee",   // integer dictionary key
    ] {
        let result = read_message(&mut Cursor::new(bad.as_bytes()));
        assert!(
            matches!(result, Err(EnvelopeError::Malformed(_))),
            "{bad:?} should be malformed, got {result:?}"
        );
    }
}

#[test]
fn accessor_type_errors() {
    let value = Envelope::Int(1);
    assert!(matches!(
        value.as_bytes(),
        Err(EnvelopeError::UnexpectedType { expected: "byte string", .. })
    ));
    assert!(matches!(
        Envelope::str("x").as_int(),
        Err(EnvelopeError::UnexpectedType { expected: "integer", .. })
    ));
}

#[test]
fn write_message_flushes_full_frame() {
    let message = dict(&[("op", Envelope::str("shutdown")), ("id", Envelope::str("1"))]);
    let mut out = Vec::new();
    write_message(&mut out, &message).expect("write");
    assert_eq!(out, message.encode_to_vec());
}
