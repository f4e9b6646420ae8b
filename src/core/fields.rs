//! # Object Codecs
//!
//! Field-list, accessor-list, enum and serde-fallback strategies.
//!
//! Structs describe their encodable members once through a macro. The member
//! table is built on first use, sorted lexicographically by member name and
//! cached, so both peers agree on the order without any names on the wire.
//!
//! ```rust
//! use msgwire::{wire_fields, wire_enum};
//!
//! #[derive(Debug, Default, Clone, PartialEq)]
//! pub struct Position {
//!     pub y: f32,
//!     pub x: f32,
//!     pub label: Option<String>,
//! }
//! wire_fields!(Position { y, x, label });
//!
//! #[derive(Debug, Default, Clone, Copy, PartialEq)]
//! pub enum Team {
//!     #[default]
//!     Red,
//!     Blue,
//! }
//! wire_enum!(Team { Red, Blue });
//! ```

use std::sync::Once;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::core::wire::{WireReader, WireWriter};
use crate::error::Result;

/// One encodable member of an object
pub struct Field<T> {
    pub name: &'static str,
    pub encode: fn(&T, &mut WireWriter<'_>) -> Result<()>,
    pub decode: fn(&mut T, &mut WireReader<'_>) -> Result<()>,
}

/// Types that expose a cached, ordered member table
pub trait FieldTable: Default + Sized + 'static {
    fn field_table() -> &'static [Field<Self>];
}

/// Orders members lexicographically by name
pub fn sorted<T>(mut fields: Vec<Field<T>>) -> Vec<Field<T>> {
    fields.sort_by(|a, b| a.name.cmp(b.name));
    fields
}

pub fn encode_fields<T: FieldTable>(value: &T, w: &mut WireWriter<'_>) -> Result<()> {
    for field in T::field_table() {
        (field.encode)(value, w)?;
    }
    Ok(())
}

/// Decodes into a default-constructed value, member by member
pub fn decode_fields<T: FieldTable>(r: &mut WireReader<'_>) -> Result<T> {
    let mut value = T::default();
    for field in T::field_table() {
        (field.decode)(&mut value, r)?;
    }
    Ok(value)
}

/// Logs the fallback warning at most once per type
pub fn warn_fallback(once: &Once, type_name: &'static str) {
    once.call_once(|| {
        warn!(
            type_name,
            "Encoding with the serde fallback codec, which is larger and slower than a field codec"
        );
    });
}

/// Fallback strategy: bincode bytes behind a variable-width length
pub fn encode_serde<T: Serialize>(value: &T, w: &mut WireWriter<'_>) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    w.put_len(bytes.len())?;
    w.put_slice(&bytes);
    Ok(())
}

pub fn decode_serde<T: DeserializeOwned>(r: &mut WireReader<'_>) -> Result<T> {
    let len = r.get_len()?;
    let bytes = r.get_slice(len)?;
    Ok(bincode::deserialize(bytes)?)
}

/// Implements [`Wire`](crate::core::codec::Wire) for a struct from a list of its fields.
///
/// The struct must implement `Default`; decoding starts from the default value
/// and overwrites each listed field.
#[macro_export]
macro_rules! wire_fields {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::core::fields::FieldTable for $ty {
            fn field_table() -> &'static [$crate::core::fields::Field<Self>] {
                static TABLE: ::std::sync::OnceLock<::std::vec::Vec<$crate::core::fields::Field<$ty>>> =
                    ::std::sync::OnceLock::new();
                TABLE.get_or_init(|| {
                    $crate::core::fields::sorted(::std::vec![
                        $(
                            $crate::core::fields::Field::<$ty> {
                                name: stringify!($field),
                                encode: |value, w| $crate::core::codec::Wire::encode(&value.$field, w),
                                decode: |value, r| {
                                    value.$field = $crate::core::codec::Wire::decode(r)?;
                                    Ok(())
                                },
                            },
                        )*
                    ])
                })
            }
        }

        impl $crate::core::codec::Wire for $ty {
            fn encode(&self, w: &mut $crate::core::wire::WireWriter<'_>) -> $crate::error::Result<()> {
                $crate::core::fields::encode_fields(self, w)
            }

            fn decode(r: &mut $crate::core::wire::WireReader<'_>) -> $crate::error::Result<Self> {
                $crate::core::fields::decode_fields(r)
            }
        }
    };
}

/// Implements [`Wire`](crate::core::codec::Wire) through getter/setter pairs.
///
/// Getters return the member by value; setters take it by value. Members are
/// ordered by the property name given before the colon.
#[macro_export]
macro_rules! wire_accessors {
    ($ty:ty { $($prop:ident : $getter:ident / $setter:ident),* $(,)? }) => {
        impl $crate::core::fields::FieldTable for $ty {
            fn field_table() -> &'static [$crate::core::fields::Field<Self>] {
                static TABLE: ::std::sync::OnceLock<::std::vec::Vec<$crate::core::fields::Field<$ty>>> =
                    ::std::sync::OnceLock::new();
                TABLE.get_or_init(|| {
                    $crate::core::fields::sorted(::std::vec![
                        $(
                            $crate::core::fields::Field::<$ty> {
                                name: stringify!($prop),
                                encode: |value, w| $crate::core::codec::Wire::encode(&value.$getter(), w),
                                decode: |value, r| {
                                    value.$setter($crate::core::codec::Wire::decode(r)?);
                                    Ok(())
                                },
                            },
                        )*
                    ])
                })
            }
        }

        impl $crate::core::codec::Wire for $ty {
            fn encode(&self, w: &mut $crate::core::wire::WireWriter<'_>) -> $crate::error::Result<()> {
                $crate::core::fields::encode_fields(self, w)
            }

            fn decode(r: &mut $crate::core::wire::WireReader<'_>) -> $crate::error::Result<Self> {
                $crate::core::fields::decode_fields(r)
            }
        }
    };
}

/// Implements [`Wire`](crate::core::codec::Wire) for a fieldless enum by ordinal.
///
/// The ordinal is the position in the list given to the macro, so the list must
/// be identical on both peers.
#[macro_export]
macro_rules! wire_enum {
    ($ty:ty { $($variant:ident),+ $(,)? }) => {
        impl $crate::core::codec::Wire for $ty {
            fn encode(&self, w: &mut $crate::core::wire::WireWriter<'_>) -> $crate::error::Result<()> {
                let variants = [$(<$ty>::$variant),+];
                let ordinal = variants
                    .iter()
                    .position(|v| ::std::mem::discriminant(v) == ::std::mem::discriminant(self))
                    .ok_or_else(|| $crate::error::ProtocolError::Malformed(
                        ::std::format!("variant of {} not listed in wire_enum!", stringify!($ty)),
                    ))?;
                w.put_len(ordinal)
            }

            fn decode(r: &mut $crate::core::wire::WireReader<'_>) -> $crate::error::Result<Self> {
                let ordinal = r.get_len()?;
                [$(<$ty>::$variant),+]
                    .into_iter()
                    .nth(ordinal)
                    .ok_or_else(|| $crate::error::ProtocolError::Malformed(
                        ::std::format!("ordinal {} out of range for {}", ordinal, stringify!($ty)),
                    ))
            }
        }
    };
}

/// Implements [`Wire`](crate::core::codec::Wire) through serde and bincode.
///
/// Use this only for types that cannot describe their fields; the encoding is
/// larger and slower and a warning is logged the first time it is used.
#[macro_export]
macro_rules! wire_serde {
    ($ty:ty) => {
        impl $crate::core::codec::Wire for $ty {
            fn encode(&self, w: &mut $crate::core::wire::WireWriter<'_>) -> $crate::error::Result<()> {
                static WARNED: ::std::sync::Once = ::std::sync::Once::new();
                $crate::core::fields::warn_fallback(&WARNED, stringify!($ty));
                $crate::core::fields::encode_serde(self, w)
            }

            fn decode(r: &mut $crate::core::wire::WireReader<'_>) -> $crate::error::Result<Self> {
                $crate::core::fields::decode_serde(r)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    use crate::core::codec::Wire;
    use crate::core::registry::{TypeContext, TypeRegistry};
    use crate::core::wire::{WireReader, WireWriter};
    use crate::error::ProtocolError;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Zebra {
        zeta: u8,
        alpha: u8,
        middle: u8,
    }
    crate::wire_fields!(Zebra { zeta, alpha, middle });

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Account {
        owner: String,
        balance: i64,
    }

    impl Account {
        fn owner(&self) -> String {
            self.owner.clone()
        }
        fn set_owner(&mut self, owner: String) {
            self.owner = owner;
        }
        fn balance(&self) -> i64 {
            self.balance
        }
        fn set_balance(&mut self, balance: i64) {
            self.balance = balance;
        }
    }
    crate::wire_accessors!(Account {
        owner: owner / set_owner,
        balance: balance / set_balance,
    });

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    enum Weather {
        #[default]
        Sun,
        Rain,
        Snow,
    }
    crate::wire_enum!(Weather { Sun, Rain, Snow });

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Legacy {
        tags: HashMap<String, u32>,
        payload: Vec<u8>,
    }
    crate::wire_serde!(Legacy);

    fn encode<T: Wire>(value: &T) -> Vec<u8> {
        let registry = TypeRegistry::new();
        let mut buf = Vec::new();
        value
            .encode(&mut WireWriter::new(&mut buf, TypeContext::local(&registry)))
            .unwrap();
        buf
    }

    fn decode<T: Wire>(buf: &[u8]) -> crate::error::Result<T> {
        let registry = TypeRegistry::new();
        T::decode(&mut WireReader::new(buf, TypeContext::local(&registry)))
    }

    #[test]
    fn test_fields_are_written_in_lexicographic_order() {
        let value = Zebra {
            zeta: 3,
            alpha: 1,
            middle: 2,
        };
        let buf = encode(&value);
        assert_eq!(buf, vec![1, 2, 3]);
        assert_eq!(decode::<Zebra>(&buf).unwrap(), value);
    }

    #[test]
    fn test_accessor_codec_roundtrip() {
        let value = Account {
            owner: "ada".to_string(),
            balance: -42,
        };
        let buf = encode(&value);
        // "balance" sorts before "owner"
        assert_eq!(&buf[..8], &(-42i64).to_be_bytes());
        assert_eq!(decode::<Account>(&buf).unwrap(), value);
    }

    #[test]
    fn test_enum_ordinals() {
        assert_eq!(encode(&Weather::Snow), vec![1, 2]);
        assert_eq!(decode::<Weather>(&[1, 1]).unwrap(), Weather::Rain);
        assert!(matches!(
            decode::<Weather>(&[1, 9]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_serde_fallback_roundtrip() {
        let mut tags = HashMap::new();
        tags.insert("k".to_string(), 9);
        let value = Legacy {
            tags,
            payload: vec![1, 2, 3],
        };
        let buf = encode(&value);
        assert_eq!(decode::<Legacy>(&buf).unwrap(), value);
    }
}
