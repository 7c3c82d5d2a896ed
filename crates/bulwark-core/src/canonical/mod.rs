//! Canonical binary encoding.
//!
//! Every value that is hashed or signed anywhere in the cluster goes through
//! this module. The encoding is a non-self-describing serde format with
//! exactly one byte representation per value:
//!
//! | Value                      | Bytes                                        |
//! |----------------------------|----------------------------------------------|
//! | `bool`                     | `0x00` or `0x01`                             |
//! | integers                   | fixed width, little-endian                   |
//! | `f32` / `f64`              | IEEE-754 bits LE, `-0.0` written as `+0.0`   |
//! | `char`                     | `u32` LE scalar value                        |
//! | `str`, bytes               | `u32` LE length, raw bytes                   |
//! | `Option`                   | `0x00`, or `0x01` followed by the value      |
//! | unit, unit struct          | nothing                                      |
//! | enum                       | `u32` LE variant index, then the payload     |
//! | sequence                   | `u32` LE count, then elements                |
//! | tuple, array, struct       | fields in declaration order, no names        |
//! | map                        | `u32` LE count, entries by encoded key bytes |
//!
//! # Canonicalization Rules
//!
//! - **NaN** has many bit patterns and is rejected outright.
//! - **Maps** are sorted by the encoded bytes of their keys, so the iteration
//!   order of a `HashMap` never reaches the output. Duplicate encoded keys
//!   are rejected.
//! - **Sequences** keep their source iteration order. A `HashSet` field
//!   must either be a `BTreeSet` or be annotated with
//!   `#[serde(serialize_with = "sorted_set", deserialize_with = "ascending_set")]`,
//!   which orders elements by their encoded bytes.
//! - **Decoding** is strict: trailing bytes, unsorted map keys, `-0.0`, NaN,
//!   and out-of-range tags are errors, so `encode(decode(b)) == b` for every
//!   accepted `b`.
//!
//! Struct fields are positional. Types that use `#[serde(skip_serializing_if)]`
//! or `#[serde(flatten)]` cannot round-trip through this format.
//!
//! # Example
//!
//! ```
//! use bulwark_core::canonical::{decode, encode};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Record {
//!     id: u64,
//!     name: String,
//! }
//!
//! let bytes = encode(&Record { id: 42, name: "abc".into() }).unwrap();
//! assert_eq!(hex::encode(&bytes), "2a0000000000000003000000616263");
//! let back: Record = decode(&bytes).unwrap();
//! assert_eq!(back.id, 42);
//! ```

mod de;
mod ser;

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum container nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 128;

/// Errors from canonical encoding and decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SerializationError {
    /// NaN floats have no canonical representation.
    #[error("NaN cannot be canonically encoded")]
    NaN,

    /// `-0.0` found in input; encoders always write `+0.0`.
    #[error("negative zero is not a canonical float encoding")]
    NegativeZero,

    /// Two map entries encoded to the same key bytes.
    #[error("duplicate map key")]
    DuplicateMapKey,

    /// Map keys in input are not strictly ascending.
    #[error("map keys are not in canonical order")]
    UnsortedMapKeys,

    /// Two set elements encoded to the same bytes.
    #[error("duplicate set element")]
    DuplicateSetElement,

    /// Set elements in input are not strictly ascending.
    #[error("set elements are not in canonical order")]
    UnsortedSetElements,

    /// A length or count does not fit the `u32` prefix.
    #[error("length {len} exceeds the u32 length prefix")]
    LengthOverflow {
        /// The offending length.
        len: usize,
    },

    /// Input ended before the value was complete.
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes requested.
        needed: usize,
        /// Bytes left in the input.
        remaining: usize,
    },

    /// Input continues after a complete value.
    #[error("{count} trailing bytes after value")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// A tag byte is outside its allowed set.
    #[error("invalid {kind} tag {tag:#04x}")]
    InvalidTag {
        /// What was being decoded.
        kind: &'static str,
        /// The tag found.
        tag: u8,
    },

    /// String payload is not UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// `u32` is not a Unicode scalar value.
    #[error("invalid char scalar {0:#x}")]
    InvalidChar(u32),

    /// The target type asked for self-describing input.
    #[error("canonical encoding is not self-describing")]
    NotSelfDescribing,

    /// Container nesting exceeded [`MAX_DEPTH`].
    #[error("nesting exceeds maximum depth of {max}")]
    DepthExceeded {
        /// The configured limit.
        max: usize,
    },

    /// Error raised by a `Serialize` / `Deserialize` implementation.
    #[error("{0}")]
    Custom(String),
}

impl serde::ser::Error for SerializationError {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}

impl serde::de::Error for SerializationError {
    fn custom<T: Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}

/// Encodes `value` into its canonical byte representation.
///
/// # Errors
///
/// Returns [`SerializationError`] for NaN floats, duplicate map keys, or
/// lengths above `u32::MAX`.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SerializationError> {
    let mut encoder = ser::Encoder::default();
    value.serialize(&mut encoder)?;
    Ok(encoder.into_bytes())
}

/// Decodes a value from canonical bytes, rejecting any non-canonical input.
pub fn decode<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, SerializationError> {
    let mut decoder = de::Decoder::new(bytes);
    let value = T::deserialize(&mut decoder)?;
    decoder.finish()?;
    Ok(value)
}

/// `serialize_with` helper writing a set as a sequence ordered by the
/// encoded bytes of its elements.
pub fn sorted_set<'a, C, T, S>(set: &'a C, serializer: S) -> Result<S::Ok, S::Error>
where
    &'a C: IntoIterator<Item = &'a T>,
    T: Serialize + 'a,
    S: serde::Serializer,
{
    let mut elements = set
        .into_iter()
        .map(|element| encode(element).map(|bytes| (bytes, element)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(serde::ser::Error::custom)?;
    elements.sort_unstable_by(|a, b| a.0.cmp(&b.0));
    if elements.windows(2).any(|pair| pair[0].0 == pair[1].0) {
        return Err(serde::ser::Error::custom(
            SerializationError::DuplicateSetElement,
        ));
    }
    serializer.collect_seq(elements.into_iter().map(|(_, element)| element))
}

/// `deserialize_with` counterpart of [`sorted_set`]: rejects elements that
/// are not strictly ascending by encoded bytes.
pub fn ascending_set<'de, C, T, D>(deserializer: D) -> Result<C, D::Error>
where
    C: IntoIterator<Item = T> + FromIterator<T>,
    T: Serialize + Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    let elements = Vec::<T>::deserialize(deserializer)?;
    let mut previous: Option<Vec<u8>> = None;
    for element in &elements {
        let bytes = encode(element).map_err(serde::de::Error::custom)?;
        if previous.as_ref().is_some_and(|p| *p >= bytes) {
            return Err(serde::de::Error::custom(
                SerializationError::UnsortedSetElements,
            ));
        }
        previous = Some(bytes);
    }
    Ok(elements.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap, HashSet};

    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u64,
        name: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Shape {
        Empty,
        Circle(u32),
        Rect { w: u16, h: u16 },
        Pair(i8, bool),
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Nested {
        tag: Option<char>,
        shapes: Vec<Shape>,
        attrs: BTreeMap<String, i64>,
        raw: [u8; 4],
        ratio: f64,
    }

    #[test]
    fn record_layout_is_fixed() {
        let bytes = encode(&Record {
            id: 42,
            name: "abc".into(),
        })
        .unwrap();
        assert_eq!(
            bytes,
            [
                0x2a, 0, 0, 0, 0, 0, 0, 0, // id
                3, 0, 0, 0, // name length
                b'a', b'b', b'c',
            ]
        );
    }

    #[test]
    fn enum_variants_are_indexed() {
        assert_eq!(encode(&Shape::Empty).unwrap(), [0, 0, 0, 0]);
        assert_eq!(encode(&Shape::Circle(7)).unwrap(), [1, 0, 0, 0, 7, 0, 0, 0]);
        assert_eq!(
            encode(&Shape::Rect { w: 1, h: 2 }).unwrap(),
            [2, 0, 0, 0, 1, 0, 2, 0]
        );
    }

    #[test]
    fn hashmap_order_does_not_leak() {
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        for i in 0..64u32 {
            a.insert(i, i * 3);
        }
        for i in (0..64u32).rev() {
            b.insert(i, i * 3);
        }
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Tags {
        #[serde(
            serialize_with = "super::sorted_set",
            deserialize_with = "super::ascending_set"
        )]
        ids: HashSet<u32>,
    }

    #[test]
    fn hashset_order_does_not_leak() {
        let forward = Tags {
            ids: (0..64u32).collect(),
        };
        let reverse = Tags {
            ids: (0..64u32).rev().collect(),
        };
        let bytes = encode(&forward).unwrap();
        assert_eq!(bytes, encode(&reverse).unwrap());
        assert_eq!(bytes, encode(&(0..64u32).collect::<Vec<_>>()).unwrap());
        assert_eq!(decode::<Tags>(&bytes).unwrap(), forward);
    }

    #[test]
    fn unsorted_set_rejected() {
        for elements in [vec![2u32, 1], vec![1, 1]] {
            let bytes = encode(&elements).unwrap();
            let err = decode::<Tags>(&bytes).unwrap_err();
            assert_eq!(
                err,
                SerializationError::Custom(SerializationError::UnsortedSetElements.to_string())
            );
        }
    }

    #[test]
    fn map_keys_sorted_by_encoded_bytes() {
        let mut map = BTreeMap::new();
        // "b" (len 1) sorts before "aa" (len 2) because the length prefix
        // comes first.
        map.insert("aa".to_string(), 1u8);
        map.insert("b".to_string(), 2u8);
        let bytes = encode(&map).unwrap();
        assert_eq!(
            bytes,
            [2, 0, 0, 0, 1, 0, 0, 0, b'b', 2, 2, 0, 0, 0, b'a', b'a', 1]
        );
        let back: BTreeMap<String, u8> = decode(&bytes).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn nan_rejected() {
        assert_eq!(encode(&f64::NAN), Err(SerializationError::NaN));
        assert_eq!(encode(&f32::NAN), Err(SerializationError::NaN));
    }

    #[test]
    fn negative_zero_normalized() {
        assert_eq!(encode(&-0.0f64).unwrap(), encode(&0.0f64).unwrap());
        let neg = (-0.0f64).to_bits().to_le_bytes();
        assert_eq!(decode::<f64>(&neg), Err(SerializationError::NegativeZero));
    }

    #[test]
    fn nan_bits_rejected_on_decode() {
        let nan = f32::NAN.to_bits().to_le_bytes();
        assert_eq!(decode::<f32>(&nan), Err(SerializationError::NaN));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode(&7u16).unwrap();
        bytes.push(0);
        assert_eq!(
            decode::<u16>(&bytes),
            Err(SerializationError::TrailingBytes { count: 1 })
        );
    }

    #[test]
    fn truncated_input_rejected() {
        let bytes = encode(&Record {
            id: 1,
            name: "hello".into(),
        })
        .unwrap();
        let err = decode::<Record>(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, SerializationError::UnexpectedEof { .. }));
    }

    #[test]
    fn unsorted_map_rejected() {
        // Two u8 keys in descending order.
        let bytes = [2, 0, 0, 0, 5, 0, 3, 0];
        assert_eq!(
            decode::<BTreeMap<u8, u8>>(&bytes),
            Err(SerializationError::UnsortedMapKeys)
        );
    }

    #[test]
    fn duplicate_map_key_rejected_on_decode() {
        let bytes = [2, 0, 0, 0, 5, 0, 5, 1];
        assert_eq!(
            decode::<BTreeMap<u8, u8>>(&bytes),
            Err(SerializationError::DuplicateMapKey)
        );
    }

    #[test]
    fn invalid_bool_and_option_tags() {
        assert_eq!(
            decode::<bool>(&[2]),
            Err(SerializationError::InvalidTag {
                kind: "bool",
                tag: 2
            })
        );
        assert_eq!(
            decode::<Option<u8>>(&[9, 1]),
            Err(SerializationError::InvalidTag {
                kind: "option",
                tag: 9
            })
        );
    }

    #[test]
    fn invalid_utf8_rejected() {
        let bytes = [2, 0, 0, 0, 0xff, 0xfe];
        assert_eq!(
            decode::<String>(&bytes),
            Err(SerializationError::InvalidUtf8)
        );
    }

    #[test]
    fn deep_nesting_rejected() {
        // Option<Option<...>> nested past the limit: every level is tag 0x01.
        let bytes = vec![1u8; MAX_DEPTH + 8];
        let err = decode::<recursive::Deep>(&bytes).unwrap_err();
        assert_eq!(err, SerializationError::DepthExceeded { max: MAX_DEPTH });
    }

    mod recursive {
        use serde::Deserialize;

        /// Recursive type used to drive the depth limit.
        #[derive(Debug, Deserialize)]
        pub struct Deep(#[allow(dead_code)] pub Option<Box<Deep>>);
    }

    fn arb_shape() -> impl Strategy<Value = Shape> {
        prop_oneof![
            Just(Shape::Empty),
            any::<u32>().prop_map(Shape::Circle),
            (any::<u16>(), any::<u16>()).prop_map(|(w, h)| Shape::Rect { w, h }),
            (any::<i8>(), any::<bool>()).prop_map(|(a, b)| Shape::Pair(a, b)),
        ]
    }

    fn arb_nested() -> impl Strategy<Value = Nested> {
        (
            proptest::option::of(any::<char>()),
            proptest::collection::vec(arb_shape(), 0..8),
            proptest::collection::btree_map(".{0,6}", any::<i64>(), 0..6),
            any::<[u8; 4]>(),
            any::<f64>().prop_filter("canonical floats only", |f| {
                !f.is_nan() && !(*f == 0.0 && f.is_sign_negative())
            }),
        )
            .prop_map(|(tag, shapes, attrs, raw, ratio)| Nested {
                tag,
                shapes,
                attrs,
                raw,
                ratio,
            })
    }

    proptest! {
        #[test]
        fn round_trip(value in arb_nested()) {
            let bytes = encode(&value).unwrap();
            let back: Nested = decode(&bytes).unwrap();
            prop_assert_eq!(&back, &value);
            // Re-encoding the decoded value is byte-identical.
            prop_assert_eq!(encode(&back).unwrap(), bytes);
        }

        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode::<Nested>(&bytes);
        }
    }
}
