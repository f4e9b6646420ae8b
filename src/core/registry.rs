//! # Type Registry
//!
//! Bidirectional mapping between message types and compact `i16` ids.
//!
//! One [`TypeRegistry`] is created at process start and shared (`Arc`) with
//! every reactor. User types receive a random unused positive id the first time
//! they are registered; system messages own fixed negative ids so both peers
//! can decode the handshake before any table has been exchanged.
//!
//! Each connection additionally holds a [`NegotiatedTypes`] table: the ids the
//! *remote* process used for its types, resolved by name to local types, and
//! the set of local ids the remote has already been told about.
//!
//! ## Reserved ids
//! - `0`: class name follows as a string
//! - `-1`: null object
//! - `-2..=-8`: system messages (see [`system_ids`])

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use rand::Rng;
use tracing::{debug, instrument};

use crate::core::wire::WireReader;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{
    AckMessage, Capabilities, DisconnectMessage, KeepAliveMessage, KickMessage, Message,
    MessageType, RegistrationMessage, TimeSyncRequest, TimeSyncResponse,
};

/// Class id announcing that the class name follows
pub const NAME_FOLLOWS_ID: i16 = 0;

/// Class id of a null object
pub const NULL_ID: i16 = -1;

/// Fixed ids of the system messages
pub mod system_ids {
    pub const REGISTRATION: i16 = -2;
    pub const DISCONNECT: i16 = -3;
    pub const KEEP_ALIVE: i16 = -4;
    pub const ACK: i16 = -5;
    pub const KICK: i16 = -6;
    pub const TIME_SYNC_REQUEST: i16 = -7;
    pub const TIME_SYNC_RESPONSE: i16 = -8;
}

type Decoder = fn(&mut WireReader<'_>) -> Result<Box<dyn Message>>;

fn decode_boxed<T: MessageType>(r: &mut WireReader<'_>) -> Result<Box<dyn Message>> {
    Ok(Box::new(T::decode(r)?))
}

/// A type known to the registry
#[derive(Debug)]
pub struct RegisteredType {
    pub id: i16,
    pub name: &'static str,
    pub type_id: TypeId,
    pub capabilities: Capabilities,
    decoder: Decoder,
}

impl RegisteredType {
    fn of<T: MessageType>(id: i16) -> Self {
        Self {
            id,
            name: T::NAME,
            type_id: TypeId::of::<T>(),
            capabilities: T::CAPABILITIES,
            decoder: decode_boxed::<T>,
        }
    }

    /// Decodes a body of this type
    pub fn decode(&self, r: &mut WireReader<'_>) -> Result<Box<dyn Message>> {
        (self.decoder)(r)
    }

    /// System types are known to every peer before negotiation
    pub fn is_system(&self) -> bool {
        self.id < 0
    }
}

#[derive(Default)]
struct Tables {
    by_type: HashMap<TypeId, Arc<RegisteredType>>,
    by_id: HashMap<i16, Arc<RegisteredType>>,
    by_name: HashMap<&'static str, Arc<RegisteredType>>,
}

impl Tables {
    fn insert(&mut self, entry: RegisteredType) -> i16 {
        let id = entry.id;
        let entry = Arc::new(entry);
        self.by_type.insert(entry.type_id, entry.clone());
        self.by_name.insert(entry.name, entry.clone());
        self.by_id.insert(id, entry);
        id
    }
}

/// Process-wide vocabulary of message types
pub struct TypeRegistry {
    tables: RwLock<Tables>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.len())
            .finish()
    }
}

impl TypeRegistry {
    /// Creates a registry with every system message pre-registered
    pub fn new() -> Self {
        let mut tables = Tables::default();
        tables.insert(RegisteredType::of::<RegistrationMessage>(system_ids::REGISTRATION));
        tables.insert(RegisteredType::of::<DisconnectMessage>(system_ids::DISCONNECT));
        tables.insert(RegisteredType::of::<KeepAliveMessage>(system_ids::KEEP_ALIVE));
        tables.insert(RegisteredType::of::<AckMessage>(system_ids::ACK));
        tables.insert(RegisteredType::of::<KickMessage>(system_ids::KICK));
        tables.insert(RegisteredType::of::<TimeSyncRequest>(system_ids::TIME_SYNC_REQUEST));
        tables.insert(RegisteredType::of::<TimeSyncResponse>(system_ids::TIME_SYNC_RESPONSE));
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Registers `T` and returns its id.
    ///
    /// Registering the same type again returns the id it already has. Fails when
    /// the type name is empty, already bound to a different type, or when the
    /// positive id space is exhausted; callers treat this as a fatal setup error.
    #[instrument(skip(self), fields(type_name = T::NAME))]
    pub fn register<T: MessageType>(&self) -> Result<i16> {
        if T::NAME.is_empty() {
            return Err(ProtocolError::Registration(
                constants::ERR_EMPTY_TYPE_NAME.to_string(),
            ));
        }

        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = tables.by_type.get(&TypeId::of::<T>()) {
            return Ok(existing.id);
        }
        if tables.by_name.contains_key(T::NAME) {
            return Err(ProtocolError::Registration(format!(
                "type name '{}' is already registered for another type",
                T::NAME
            )));
        }

        let used = tables.by_id.keys().filter(|id| **id > 0).count();
        if used >= i16::MAX as usize {
            return Err(ProtocolError::Registration(
                constants::ERR_ID_SPACE_EXHAUSTED.to_string(),
            ));
        }

        let mut rng = rand::rng();
        let id = loop {
            let candidate = rng.random_range(1..=i16::MAX);
            if !tables.by_id.contains_key(&candidate) {
                break candidate;
            }
        };

        debug!(id, "Registered message type");
        Ok(tables.insert(RegisteredType::of::<T>(id)))
    }

    pub fn by_type_id(&self, type_id: TypeId) -> Option<Arc<RegisteredType>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.by_type.get(&type_id).cloned()
    }

    pub fn by_id(&self, id: i16) -> Option<Arc<RegisteredType>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.by_id.get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<RegisteredType>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.by_name.get(name).cloned()
    }

    /// Id of a registered type
    pub fn id_of<T: MessageType>(&self) -> Option<i16> {
        self.by_type_id(TypeId::of::<T>()).map(|entry| entry.id)
    }

    /// All non-system types, ordered by id
    pub fn user_types(&self) -> Vec<Arc<RegisteredType>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<_> = tables
            .by_id
            .values()
            .filter(|entry| !entry.is_system())
            .cloned()
            .collect();
        types.sort_by_key(|entry| entry.id);
        types
    }

    pub fn len(&self) -> usize {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Id tables negotiated with one remote peer
#[derive(Debug, Default)]
pub struct NegotiatedTypes {
    remote: HashMap<i16, Arc<RegisteredType>>,
    announced: HashSet<i16>,
}

impl NegotiatedTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an id used by the remote process to a local type
    pub fn bind_remote(&mut self, remote_id: i16, entry: Arc<RegisteredType>) {
        self.remote.insert(remote_id, entry);
    }

    pub fn remote(&self, remote_id: i16) -> Option<&Arc<RegisteredType>> {
        self.remote.get(&remote_id)
    }

    pub fn remote_len(&self) -> usize {
        self.remote.len()
    }

    /// Records local ids the remote now knows about
    pub fn announce(&mut self, ids: impl IntoIterator<Item = i16>) {
        self.announced.extend(ids);
    }

    pub fn is_announced(&self, id: i16) -> bool {
        self.announced.contains(&id)
    }
}

/// Type resolution context carried by wire readers and writers
#[derive(Debug, Clone, Copy)]
pub struct TypeContext<'a> {
    registry: &'a TypeRegistry,
    negotiated: Option<&'a NegotiatedTypes>,
}

impl<'a> TypeContext<'a> {
    /// Context for in-process encoding: every registered id is usable as is
    pub fn local(registry: &'a TypeRegistry) -> Self {
        Self {
            registry,
            negotiated: None,
        }
    }

    /// Context bound to the id tables of one connection
    pub fn negotiated(registry: &'a TypeRegistry, negotiated: &'a NegotiatedTypes) -> Self {
        Self {
            registry,
            negotiated: Some(negotiated),
        }
    }

    pub fn registry(&self) -> &'a TypeRegistry {
        self.registry
    }

    /// Id to write for a local type, or `None` when the name must be sent instead
    pub fn outbound_id(&self, entry: &RegisteredType) -> Option<i16> {
        if entry.is_system() {
            return Some(entry.id);
        }
        match self.negotiated {
            None => Some(entry.id),
            Some(negotiated) => negotiated.is_announced(entry.id).then_some(entry.id),
        }
    }

    /// Resolves an id read from the wire
    pub fn resolve_inbound(&self, id: i16) -> Result<Arc<RegisteredType>> {
        let resolved = if id < 0 {
            self.registry.by_id(id)
        } else {
            match self.negotiated {
                None => self.registry.by_id(id),
                Some(negotiated) => negotiated.remote(id).cloned(),
            }
        };
        resolved.ok_or(ProtocolError::UnknownTypeId(id))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::wire_fields;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Chat {
        text: String,
    }
    wire_fields!(Chat { text });
    impl MessageType for Chat {
        const NAME: &'static str = "test.Chat";
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Impostor;
    wire_fields!(Impostor {});
    impl MessageType for Impostor {
        const NAME: &'static str = "test.Chat";
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Nameless;
    wire_fields!(Nameless {});
    impl MessageType for Nameless {
        const NAME: &'static str = "";
    }

    #[test]
    fn test_system_types_preregistered() {
        let registry = TypeRegistry::new();
        assert_eq!(
            registry.id_of::<RegistrationMessage>(),
            Some(system_ids::REGISTRATION)
        );
        assert_eq!(registry.id_of::<AckMessage>(), Some(system_ids::ACK));
        assert!(registry.user_types().is_empty());
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = TypeRegistry::new();
        let first = registry.register::<Chat>().unwrap();
        let second = registry.register::<Chat>().unwrap();
        assert_eq!(first, second);
        assert!(first > 0);
        assert_eq!(registry.by_id(first).unwrap().name, "test.Chat");
        assert_eq!(registry.by_name("test.Chat").unwrap().id, first);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = TypeRegistry::new();
        registry.register::<Chat>().unwrap();
        assert!(matches!(
            registry.register::<Impostor>(),
            Err(ProtocolError::Registration(_))
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = TypeRegistry::new();
        assert!(matches!(
            registry.register::<Nameless>(),
            Err(ProtocolError::Registration(_))
        ));
    }

    #[test]
    fn test_negotiated_context_resolution() {
        let registry = TypeRegistry::new();
        let local_id = registry.register::<Chat>().unwrap();
        let entry = registry.by_id(local_id).unwrap();

        let mut negotiated = NegotiatedTypes::new();
        let ctx = TypeContext::negotiated(&registry, &negotiated);
        assert_eq!(ctx.outbound_id(&entry), None);
        assert!(matches!(
            ctx.resolve_inbound(77),
            Err(ProtocolError::UnknownTypeId(77))
        ));

        negotiated.announce([local_id]);
        negotiated.bind_remote(77, entry.clone());
        let ctx = TypeContext::negotiated(&registry, &negotiated);
        assert_eq!(ctx.outbound_id(&entry), Some(local_id));
        assert_eq!(ctx.resolve_inbound(77).unwrap().name, "test.Chat");
        assert_eq!(
            ctx.resolve_inbound(system_ids::KICK).unwrap().id,
            system_ids::KICK
        );
    }
}
