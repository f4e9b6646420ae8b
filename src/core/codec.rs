//! # Binary Codec
//!
//! The [`Wire`] trait and its strategies.
//!
//! Every encodable Rust type picks its strategy through its `Wire` impl:
//!
//! | Rust type                              | strategy                                       |
//! |----------------------------------------|------------------------------------------------|
//! | `bool`, integers, floats, `char`       | fixed width, no null marker                    |
//! | `Option<T>`                            | 1-byte null marker, then `T`                   |
//! | `String`                               | variable-width length + UTF-8                  |
//! | `Box<[T]>` (nested for more dims)      | array: rank, max extents, per-level lengths    |
//! | `Vec`, `VecDeque`, `HashSet`, `BTreeSet` | collection: length + homogeneity flag        |
//! | `HashMap`, `BTreeMap`                  | map: length + key flag + value flag            |
//! | `Box<dyn Message>`                     | class id (or name) then the concrete body      |
//! | `wire_fields!` / `wire_accessors!`     | fields in lexicographic order, no names        |
//! | `wire_enum!`                           | ordinal                                        |
//! | `wire_serde!`                          | length-prefixed bincode fallback               |
//!
//! Polymorphic values go through [`write_class_and_object`] and
//! [`read_class_and_object`], which resolve type ids against the
//! [`TypeContext`](crate::core::registry::TypeContext) of the connection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;

use crate::core::registry::{RegisteredType, NAME_FOLLOWS_ID, NULL_ID};
use crate::core::wire::{WireReader, WireWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::Message;

/// Homogeneity flag for containers whose elements share one codec
pub const FLAG_HOMOGENEOUS: u8 = 1;
/// Homogeneity flag for containers whose elements each carry a class id
pub const FLAG_HETEROGENEOUS: u8 = 0;

/// Class shared by all elements of a homogeneous container
#[derive(Debug, Clone)]
pub enum SharedClass {
    /// Statically typed element, nothing on the wire
    Static,
    /// Polymorphic element whose class id was written once
    Message(Arc<RegisteredType>),
}

/// A value with a binary wire representation
pub trait Wire: Sized {
    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()>;

    fn decode(r: &mut WireReader<'_>) -> Result<Self>;

    /// Number of array dimensions when `Self` is a (nested) boxed slice
    const ARRAY_RANK: u8 = 0;

    /// Records the largest length seen at every array depth
    fn collect_extents(&self, _depth: usize, _extents: &mut [usize]) {}

    /// Encodes `self` as an element of an enclosing array
    fn encode_array_body(&self, w: &mut WireWriter<'_>) -> Result<()> {
        self.encode(w)
    }

    /// Decodes `Self` as an element of an enclosing array
    fn decode_array_body(
        r: &mut WireReader<'_>,
        _depth: usize,
        _extents: &[usize],
    ) -> Result<Self> {
        Self::decode(r)
    }

    /// Whether every element of `items` can share one codec
    fn is_homogeneous<'i, I>(_items: I) -> bool
    where
        I: Iterator<Item = &'i Self> + Clone,
        Self: 'i,
    {
        true
    }

    /// Writes the class shared by a homogeneous run of elements
    fn write_shared_class<'i, I>(_items: I, _w: &mut WireWriter<'_>) -> Result<()>
    where
        I: Iterator<Item = &'i Self> + Clone,
        Self: 'i,
    {
        Ok(())
    }

    fn encode_shared(&self, w: &mut WireWriter<'_>) -> Result<()> {
        self.encode(w)
    }

    fn read_shared_class(_r: &mut WireReader<'_>) -> Result<SharedClass> {
        Ok(SharedClass::Static)
    }

    fn decode_shared(_class: &SharedClass, r: &mut WireReader<'_>) -> Result<Self> {
        Self::decode(r)
    }
}

macro_rules! wire_primitive {
    ($ty:ty, $put:ident, $get:ident) => {
        impl Wire for $ty {
            fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
                w.$put(*self);
                Ok(())
            }

            fn decode(r: &mut WireReader<'_>) -> Result<Self> {
                r.$get()
            }
        }
    };
}

wire_primitive!(bool, put_bool, get_bool);
wire_primitive!(u8, put_u8, get_u8);
wire_primitive!(i8, put_i8, get_i8);
wire_primitive!(i16, put_i16, get_i16);
wire_primitive!(u16, put_u16, get_u16);
wire_primitive!(i32, put_i32, get_i32);
wire_primitive!(u32, put_u32, get_u32);
wire_primitive!(i64, put_i64, get_i64);
wire_primitive!(u64, put_u64, get_u64);
wire_primitive!(f32, put_f32, get_f32);
wire_primitive!(f64, put_f64, get_f64);

impl Wire for char {
    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_u32(u32::from(*self));
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let raw = r.get_u32()?;
        char::from_u32(raw).ok_or_else(|| {
            ProtocolError::Malformed(format!("{}: {raw:#x}", constants::ERR_INVALID_CHAR))
        })
    }
}

impl Wire for () {
    fn encode(&self, _w: &mut WireWriter<'_>) -> Result<()> {
        Ok(())
    }

    fn decode(_r: &mut WireReader<'_>) -> Result<Self> {
        Ok(())
    }
}

impl Wire for String {
    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_str(self)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        r.get_str().map(str::to_owned)
    }
}

/// Boxed form of a value: a null marker precedes the payload
impl<T: Wire> Wire for Option<T> {
    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        match self {
            None => {
                w.put_u8(0);
                Ok(())
            }
            Some(value) => {
                w.put_u8(1);
                value.encode(w)
            }
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        match r.get_u8()? {
            0 => Ok(None),
            1 => T::decode(r).map(Some),
            marker => Err(ProtocolError::Malformed(format!(
                "{}: {marker}",
                constants::ERR_INVALID_NULL_MARKER
            ))),
        }
    }
}

/// Arrays. The outermost slice writes the rank and the largest length of every
/// dimension, then each level writes its own length before its elements so
/// jagged arrays survive the trip.
impl<T: Wire> Wire for Box<[T]> {
    const ARRAY_RANK: u8 = T::ARRAY_RANK + 1;

    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        let mut extents = vec![0usize; usize::from(Self::ARRAY_RANK)];
        self.collect_extents(0, &mut extents);

        w.put_u8(Self::ARRAY_RANK);
        for extent in &extents {
            w.put_len(*extent)?;
        }
        self.encode_array_body(w)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let rank = r.get_u8()?;
        if rank != Self::ARRAY_RANK {
            return Err(ProtocolError::Malformed(format!(
                "array rank {rank}, expected {}",
                Self::ARRAY_RANK
            )));
        }
        let mut extents = Vec::with_capacity(usize::from(rank));
        for _ in 0..rank {
            extents.push(r.get_len()?);
        }
        Self::decode_array_body(r, 0, &extents)
    }

    fn collect_extents(&self, depth: usize, extents: &mut [usize]) {
        if let Some(extent) = extents.get_mut(depth) {
            *extent = (*extent).max(self.len());
        }
        for item in self.iter() {
            item.collect_extents(depth + 1, extents);
        }
    }

    // Leaf elements go through `encode`, which writes a class id per element only
    // for polymorphic element types.
    fn encode_array_body(&self, w: &mut WireWriter<'_>) -> Result<()> {
        w.put_len(self.len())?;
        for item in self.iter() {
            item.encode_array_body(w)?;
        }
        Ok(())
    }

    fn decode_array_body(r: &mut WireReader<'_>, depth: usize, extents: &[usize]) -> Result<Self> {
        let len = r.get_bounded_len(1)?;
        let max = extents.get(depth).copied().unwrap_or(0);
        if len > max {
            return Err(ProtocolError::Malformed(format!(
                "array length {len} exceeds declared extent {max} at depth {depth}"
            )));
        }
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::decode_array_body(r, depth + 1, extents)?);
        }
        Ok(items.into_boxed_slice())
    }
}

fn encode_elements<'i, T, I>(items: I, w: &mut WireWriter<'_>) -> Result<()>
where
    T: Wire + 'i,
    I: Iterator<Item = &'i T> + Clone,
{
    if T::is_homogeneous(items.clone()) {
        w.put_u8(FLAG_HOMOGENEOUS);
        T::write_shared_class(items.clone(), w)?;
        for item in items {
            item.encode_shared(w)?;
        }
    } else {
        w.put_u8(FLAG_HETEROGENEOUS);
        for item in items {
            item.encode(w)?;
        }
    }
    Ok(())
}

/// Reads the homogeneity flag of one element position
fn read_element_class<T: Wire>(r: &mut WireReader<'_>) -> Result<Option<SharedClass>> {
    match r.get_u8()? {
        FLAG_HOMOGENEOUS => T::read_shared_class(r).map(Some),
        FLAG_HETEROGENEOUS => Ok(None),
        flag => Err(ProtocolError::Malformed(format!(
            "invalid homogeneity flag {flag}"
        ))),
    }
}

fn decode_element<T: Wire>(class: &Option<SharedClass>, r: &mut WireReader<'_>) -> Result<T> {
    match class {
        Some(class) => T::decode_shared(class, r),
        None => T::decode(r),
    }
}

/// Element counts are capped at one element per remaining byte, so a forged
/// count cannot loop over zero-width elements
fn decode_elements<T: Wire>(r: &mut WireReader<'_>, mut sink: impl FnMut(T)) -> Result<usize> {
    let len = r.get_bounded_len(1)?;
    let class = read_element_class::<T>(r)?;
    for _ in 0..len {
        sink(decode_element(&class, r)?);
    }
    Ok(len)
}

macro_rules! wire_collection {
    ($coll:ident < T $(: $bound:ident $(+ $more:ident)*)? >, $new:expr, $insert:ident) => {
        impl<T: Wire $(+ $bound $(+ $more)*)?> Wire for $coll<T> {
            fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
                w.put_len(self.len())?;
                encode_elements(self.iter(), w)
            }

            fn decode(r: &mut WireReader<'_>) -> Result<Self> {
                let mut items = $new;
                decode_elements::<T>(r, |item| {
                    items.$insert(item);
                })?;
                Ok(items)
            }
        }
    };
}

wire_collection!(Vec<T>, Vec::new(), push);
wire_collection!(VecDeque<T>, VecDeque::new(), push_back);
wire_collection!(HashSet<T: Eq + Hash>, HashSet::new(), insert);
wire_collection!(BTreeSet<T: Ord>, BTreeSet::new(), insert);

fn encode_map<'m, K, V, I>(len: usize, entries: I, w: &mut WireWriter<'_>) -> Result<()>
where
    K: Wire + 'm,
    V: Wire + 'm,
    I: Iterator<Item = (&'m K, &'m V)> + Clone,
{
    w.put_len(len)?;
    let keys_shared = K::is_homogeneous(entries.clone().map(|(k, _)| k));
    let values_shared = V::is_homogeneous(entries.clone().map(|(_, v)| v));

    if keys_shared {
        w.put_u8(FLAG_HOMOGENEOUS);
        K::write_shared_class(entries.clone().map(|(k, _)| k), w)?;
    } else {
        w.put_u8(FLAG_HETEROGENEOUS);
    }
    if values_shared {
        w.put_u8(FLAG_HOMOGENEOUS);
        V::write_shared_class(entries.clone().map(|(_, v)| v), w)?;
    } else {
        w.put_u8(FLAG_HETEROGENEOUS);
    }

    for (key, value) in entries {
        if keys_shared {
            key.encode_shared(w)?;
        } else {
            key.encode(w)?;
        }
        if values_shared {
            value.encode_shared(w)?;
        } else {
            value.encode(w)?;
        }
    }
    Ok(())
}

fn decode_map<K: Wire, V: Wire>(r: &mut WireReader<'_>, mut sink: impl FnMut(K, V)) -> Result<()> {
    let len = r.get_bounded_len(1)?;
    let key_class = read_element_class::<K>(r)?;
    let value_class = read_element_class::<V>(r)?;
    for _ in 0..len {
        let key = decode_element(&key_class, r)?;
        let value = decode_element(&value_class, r)?;
        sink(key, value);
    }
    Ok(())
}

impl<K: Wire + Eq + Hash, V: Wire> Wire for HashMap<K, V> {
    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        encode_map(self.len(), self.iter(), w)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let mut map = HashMap::new();
        decode_map(r, |k, v| {
            map.insert(k, v);
        })?;
        Ok(map)
    }
}

impl<K: Wire + Ord, V: Wire> Wire for BTreeMap<K, V> {
    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        encode_map(self.len(), self.iter(), w)
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let mut map = BTreeMap::new();
        decode_map(r, |k, v| {
            map.insert(k, v);
        })?;
        Ok(map)
    }
}

/// Writes the class header of `msg`: the id announced on this connection, or
/// `0` followed by the type name when the peer has not learned the id yet.
pub fn write_class(w: &mut WireWriter<'_>, msg: &dyn Message) -> Result<()> {
    let types = w.types();
    let entry = types
        .registry()
        .by_type_id(msg.as_any().type_id())
        .ok_or_else(|| ProtocolError::UnknownTypeName(msg.type_name().to_string()))?;

    match types.outbound_id(&entry) {
        Some(id) => w.put_i16(id),
        None => {
            debug!(
                type_name = entry.name,
                "Type not negotiated with peer, sending class name (inefficient)"
            );
            w.put_i16(NAME_FOLLOWS_ID);
            w.put_str(entry.name)?;
        }
    }
    Ok(())
}

/// Reads a class header; `None` denotes a null object
pub fn read_class(r: &mut WireReader<'_>) -> Result<Option<Arc<RegisteredType>>> {
    let types = r.types();
    match r.get_i16()? {
        NULL_ID => Ok(None),
        NAME_FOLLOWS_ID => {
            let name = r.get_str()?;
            types
                .registry()
                .by_name(name)
                .map(Some)
                .ok_or_else(|| ProtocolError::UnknownTypeName(name.to_string()))
        }
        id => types.resolve_inbound(id).map(Some),
    }
}

/// Writes a class header followed by the object's body; `None` writes the null id
pub fn write_class_and_object(w: &mut WireWriter<'_>, obj: Option<&dyn Message>) -> Result<()> {
    match obj {
        None => {
            w.put_i16(NULL_ID);
            Ok(())
        }
        Some(msg) => {
            write_class(w, msg)?;
            msg.encode_body(w)
        }
    }
}

/// Reads a class header and decodes the matching object
pub fn read_class_and_object(r: &mut WireReader<'_>) -> Result<Option<Box<dyn Message>>> {
    match read_class(r)? {
        None => Ok(None),
        Some(entry) => entry.decode(r).map(Some),
    }
}

impl Wire for Box<dyn Message> {
    fn encode(&self, w: &mut WireWriter<'_>) -> Result<()> {
        write_class_and_object(w, Some(&**self))
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        read_class_and_object(r)?
            .ok_or_else(|| ProtocolError::Malformed("unexpected null object".to_string()))
    }

    fn is_homogeneous<'i, I>(mut items: I) -> bool
    where
        I: Iterator<Item = &'i Self> + Clone,
        Self: 'i,
    {
        let Some(first) = items.next() else {
            return false;
        };
        let class = first.as_any().type_id();
        items.all(|item| item.as_any().type_id() == class)
    }

    fn write_shared_class<'i, I>(mut items: I, w: &mut WireWriter<'_>) -> Result<()>
    where
        I: Iterator<Item = &'i Self> + Clone,
        Self: 'i,
    {
        match items.next() {
            Some(first) => write_class(w, &**first),
            None => Ok(()),
        }
    }

    fn encode_shared(&self, w: &mut WireWriter<'_>) -> Result<()> {
        self.encode_body(w)
    }

    fn read_shared_class(r: &mut WireReader<'_>) -> Result<SharedClass> {
        read_class(r)?
            .map(SharedClass::Message)
            .ok_or_else(|| ProtocolError::Malformed("null shared class".to_string()))
    }

    fn decode_shared(class: &SharedClass, r: &mut WireReader<'_>) -> Result<Self> {
        match class {
            SharedClass::Message(entry) => entry.decode(r),
            SharedClass::Static => Self::decode(r),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::registry::{TypeContext, TypeRegistry};
    use crate::core::registry::system_ids;
    use crate::protocol::message::{AckMessage, KeepAliveMessage, KickMessage};

    fn roundtrip<T: Wire>(registry: &TypeRegistry, value: &T) -> (T, usize) {
        let mut buf = Vec::new();
        value
            .encode(&mut WireWriter::new(&mut buf, TypeContext::local(registry)))
            .unwrap();
        let mut reader = WireReader::new(&buf, TypeContext::local(registry));
        let decoded = T::decode(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0, "codec left trailing bytes");
        (decoded, buf.len())
    }

    #[test]
    fn test_primitives_are_fixed_width() {
        let registry = TypeRegistry::new();
        assert_eq!(roundtrip(&registry, &-7i32), (-7, 4));
        assert_eq!(roundtrip(&registry, &u64::MAX), (u64::MAX, 8));
        assert_eq!(roundtrip(&registry, &true), (true, 1));
        assert_eq!(roundtrip(&registry, &'λ'), ('λ', 4));
        assert_eq!(roundtrip(&registry, &1.5f64), (1.5, 8));
    }

    #[test]
    fn test_boxed_primitive_null_marker() {
        let registry = TypeRegistry::new();
        assert_eq!(roundtrip(&registry, &Some(3i16)), (Some(3), 3));
        assert_eq!(roundtrip(&registry, &None::<i16>), (None, 1));
    }

    #[test]
    fn test_jagged_array() {
        let registry = TypeRegistry::new();
        let jagged: Box<[Box<[u8]>]> = vec![
            vec![1u8, 2, 3].into_boxed_slice(),
            vec![].into_boxed_slice(),
            vec![9u8].into_boxed_slice(),
        ]
        .into_boxed_slice();
        let (decoded, _) = roundtrip(&registry, &jagged);
        assert_eq!(decoded, jagged);
    }

    #[test]
    fn test_three_dimensional_array() {
        let registry = TypeRegistry::new();
        let cube: Box<[Box<[Box<[i32]>]>]> = (0..2)
            .map(|x| {
                (0..3)
                    .map(|y| (0..4).map(|z| x * 100 + y * 10 + z).collect::<Vec<_>>().into_boxed_slice())
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let (decoded, _) = roundtrip(&registry, &cube);
        assert_eq!(decoded, cube);
    }

    #[test]
    fn test_array_rank_mismatch() {
        let registry = TypeRegistry::new();
        let flat: Box<[u8]> = vec![1u8, 2].into_boxed_slice();
        let mut buf = Vec::new();
        flat.encode(&mut WireWriter::new(&mut buf, TypeContext::local(&registry)))
            .unwrap();
        let mut reader = WireReader::new(&buf, TypeContext::local(&registry));
        assert!(matches!(
            <Box<[Box<[u8]>]>>::decode(&mut reader),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_collections_and_maps() {
        let registry = TypeRegistry::new();
        let list = vec!["a".to_string(), "bb".to_string()];
        assert_eq!(roundtrip(&registry, &list).0, list);

        let mut map = HashMap::new();
        map.insert(1u16, vec![1.0f32, 2.0]);
        map.insert(7u16, vec![]);
        assert_eq!(roundtrip(&registry, &map).0, map);

        let set: BTreeSet<i64> = [5, -1, 3].into_iter().collect();
        assert_eq!(roundtrip(&registry, &set).0, set);
    }

    #[test]
    fn test_polymorphic_homogeneous_writes_class_once() {
        let registry = TypeRegistry::new();
        let same: Vec<Box<dyn Message>> = vec![
            Box::new(AckMessage { unique_id: 1 }),
            Box::new(AckMessage { unique_id: 2 }),
        ];
        let mixed: Vec<Box<dyn Message>> = vec![
            Box::new(AckMessage { unique_id: 1 }),
            Box::new(KickMessage {
                reason: "x".to_string(),
            }),
        ];

        let (decoded_same, same_len) = roundtrip(&registry, &same);
        let (decoded_mixed, _) = roundtrip(&registry, &mixed);
        assert_eq!(decoded_same, same);
        assert_eq!(decoded_mixed, mixed);

        // length(2) + flag(1) + class(2) + 2 * u32
        assert_eq!(same_len, 2 + 1 + 2 + 8);
    }

    #[test]
    fn test_forged_element_count_is_rejected() {
        let registry = TypeRegistry::new();
        let keep_alive: Box<dyn Message> = Box::new(KeepAliveMessage);
        let keep_alives = vec![keep_alive; 3];
        let (decoded, len) = roundtrip(&registry, &keep_alives);
        assert_eq!(decoded.len(), 3);
        // length(2) + flag(1) + class(2); the elements themselves are empty
        assert_eq!(len, 5);

        let mut buf = Vec::new();
        let mut w = WireWriter::new(&mut buf, TypeContext::local(&registry));
        w.put_len(5_000_000).unwrap();
        w.put_u8(FLAG_HOMOGENEOUS);
        w.put_i16(system_ids::KEEP_ALIVE);
        let mut reader = WireReader::new(&buf, TypeContext::local(&registry));
        assert!(matches!(
            <Vec<Box<dyn Message>>>::decode(&mut reader),
            Err(ProtocolError::BufferUnderflow { .. })
        ));

        let mut reader = WireReader::new(&buf, TypeContext::local(&registry));
        assert!(<HashMap<u8, u8>>::decode(&mut reader).is_err());
    }

    #[test]
    fn test_null_object() {
        let registry = TypeRegistry::new();
        let mut buf = Vec::new();
        write_class_and_object(
            &mut WireWriter::new(&mut buf, TypeContext::local(&registry)),
            None,
        )
        .unwrap();
        assert_eq!(buf, NULL_ID.to_be_bytes());
        let mut reader = WireReader::new(&buf, TypeContext::local(&registry));
        assert!(read_class_and_object(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_id_is_codec_error() {
        let registry = TypeRegistry::new();
        let buf = 1234i16.to_be_bytes();
        let mut reader = WireReader::new(&buf, TypeContext::local(&registry));
        let err = read_class_and_object(&mut reader).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTypeId(1234)));
        assert!(err.is_codec_error());
    }
}
