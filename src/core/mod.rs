//! # Core Codec Components
//!
//! Low-level encoding, decoding and type identity.
//!
//! This module provides the foundation every other layer builds on: the byte
//! writer/reader, the [`codec::Wire`] trait with one strategy per family of
//! Rust types, the field-list object codecs, and the process-wide
//! [`registry::TypeRegistry`] that maps message types to compact ids.
//!
//! ## Components
//! - **Wire**: big-endian primitives and variable-width lengths
//! - **Codec**: primitive, optional, array, collection, map and polymorphic strategies
//! - **Fields**: `wire_fields!`, `wire_accessors!`, `wire_enum!` and `wire_serde!`
//! - **Registry**: id allocation, system types and per-connection id tables
//!
//! ## Message Header
//! ```text
//! [TypeId(i16)] [Envelope fields (capability dependent)] [Body(N)]
//! ```
//! A type id of `0` is followed by the type name; `-1` denotes a null object.

pub mod codec;
pub mod fields;
pub mod registry;
pub mod wire;
