use pylon_tl::deserialize::Error;
use pylon_tl::{Deserializable, RawVec, Serializable};

// ── Primitive round-trips ─────────────────────────────────────────────────────

#[test]
fn roundtrip_i32() {
    for v in [0i32, -1, i32::MAX, i32::MIN, 42] {
        let bytes = v.to_bytes();
        assert_eq!(i32::from_bytes(&bytes).unwrap(), v);
    }
}

#[test]
fn roundtrip_i64() {
    for v in [0i64, -1, i64::MAX, i64::MIN, 1_234_567_890] {
        assert_eq!(i64::from_bytes(&v.to_bytes()).unwrap(), v);
    }
}

#[test]
fn bool_ids() {
    assert_eq!(true.to_bytes(), 0x997275b5u32.to_le_bytes());
    assert_eq!(false.to_bytes(), 0xbc799737u32.to_le_bytes());
    assert_eq!(
        bool::from_bytes(&0x12345678u32.to_le_bytes()),
        Err(Error::UnexpectedConstructor { id: 0x12345678 })
    );
}

// ── String / bytes ────────────────────────────────────────────────────────────

#[test]
fn short_string_is_aligned() {
    let s = "hello world".to_owned();
    let bytes = s.to_bytes();
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(String::from_bytes(&bytes).unwrap(), s);
}

#[test]
fn long_string_uses_wide_header() {
    let s = "x".repeat(300);
    let bytes = s.to_bytes();
    assert_eq!(bytes[0], 0xfe);
    assert_eq!(bytes.len(), 304);
    assert_eq!(String::from_bytes(&bytes).unwrap(), s);
}

#[test]
fn invalid_utf8_string() {
    let bytes = vec![0xffu8, 0xfe].to_bytes();
    assert_eq!(String::from_bytes(&bytes), Err(Error::InvalidUtf8));
}

#[test]
fn empty_bytes_input() {
    assert_eq!(Vec::<u8>::from_bytes(&[]), Err(Error::EmptyInput));
}

#[test]
fn truncated_padding_is_eof() {
    // Length 1 needs two padding bytes; only one is present.
    assert_eq!(Vec::<u8>::from_bytes(&[1, 9, 0]), Err(Error::UnexpectedEof));
}

// ── Vectors ───────────────────────────────────────────────────────────────────

#[test]
fn boxed_vector_layout() {
    let bytes = vec![2i32, 3, 4].to_bytes();
    assert_eq!(&bytes[..4], &0x1cb5c415u32.to_le_bytes());
    assert_eq!(&bytes[4..8], &3i32.to_le_bytes());
    assert_eq!(Vec::<i32>::from_bytes(&bytes).unwrap(), vec![2, 3, 4]);
}

#[test]
fn bad_vector_tag() {
    let bytes = RawVec(vec![1i64]).to_bytes();
    assert!(matches!(Vec::<i64>::from_bytes(&bytes), Err(Error::BadVectorTag { .. })));
    assert_eq!(RawVec::<i64>::from_bytes(&bytes).unwrap(), RawVec(vec![1]));
}

#[test]
fn negative_vector_length() {
    let mut bytes = 0x1cb5c415u32.to_bytes();
    bytes.extend((-1i32).to_bytes());
    assert_eq!(Vec::<i32>::from_bytes(&bytes), Err(Error::InvalidLength { len: -1 }));
}

// ── Fixed-size arrays ─────────────────────────────────────────────────────────

#[test]
fn roundtrip_int256() {
    let v: [u8; 32] = core::array::from_fn(|i| i as u8);
    assert_eq!(<[u8; 32]>::from_bytes(&v.to_bytes()).unwrap(), v);
}

// ── Option passthrough ────────────────────────────────────────────────────────

#[test]
fn option_none_writes_nothing() {
    let v: Option<i32> = None;
    assert_eq!(v.to_bytes(), b"");
    assert_eq!(Some(42i32).to_bytes(), 42i32.to_bytes());
}
