use crate::encoding::{
    Decode, Encode, EncodingError, decode_vec, encode_slice, encode_to_vec,
};

#[test]
fn test_bytes_roundtrip() {
    let value = b"hello world".to_vec();
    let bytes = encode_to_vec(&value).unwrap();
    assert_eq!(&bytes[..4], &11u32.to_le_bytes());

    let (decoded, consumed) = <Vec<u8>>::decode_from(&bytes).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn test_empty_bytes_roundtrip() {
    let value: Vec<u8> = Vec::new();
    let bytes = encode_to_vec(&value).unwrap();
    let (decoded, consumed) = <Vec<u8>>::decode_from(&bytes).unwrap();
    assert!(decoded.is_empty());
    assert_eq!(consumed, 4);
}

#[test]
fn test_string_roundtrip() {
    let value = "żółw-key".to_string();
    let bytes = encode_to_vec(&value).unwrap();
    let (decoded, _) = String::decode_from(&bytes).unwrap();
    assert_eq!(decoded, value);
}

#[test]
fn test_string_rejects_invalid_utf8() {
    let mut bytes = Vec::new();
    vec![0xFFu8, 0xFE].encode_to(&mut bytes).unwrap();
    let err = String::decode_from(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidUtf8(_)));
}

#[test]
fn test_option_roundtrip() {
    for value in [None, Some(42u64)] {
        let bytes = encode_to_vec(&value).unwrap();
        let (decoded, consumed) = <Option<u64>>::decode_from(&bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len());
    }
}

#[test]
fn test_option_rejects_unknown_tag() {
    let err = <Option<u64>>::decode_from(&[0x07]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidTag { tag: 7, .. }));
}

#[test]
fn test_slice_roundtrip() {
    let values = [1u64, 2, 3, u64::MAX];
    let mut bytes = Vec::new();
    encode_slice(&values, &mut bytes).unwrap();

    let (decoded, consumed) = decode_vec::<u64>(&bytes).unwrap();
    assert_eq!(decoded, values);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn test_bytes_length_limit_rejected() {
    // Claim a 4 GiB payload; the decoder must refuse before allocating.
    let bytes = u32::MAX.to_le_bytes().to_vec();
    let err = <Vec<u8>>::decode_from(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}

#[test]
fn test_vec_count_limit_rejected() {
    let bytes = u32::MAX.to_le_bytes().to_vec();
    let err = decode_vec::<u64>(&bytes).unwrap_err();
    assert!(matches!(err, EncodingError::LengthOverflow(_)));
}
