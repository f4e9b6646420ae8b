//! # Vocabulary Negotiation
//!
//! Each side announces its registered (non-system) types as parallel arrays of
//! ids and fully qualified names. The receiver resolves every name against its
//! own registry and remembers the mapping under the id the *sender* used.
//!
//! Both the table exchange and the admission decision are pluggable:
//! [`NegotiationStrategy`] builds and resolves registrations, and a
//! [`ConnectionFilter`] may reject a peer once its registration arrived.

use tracing::debug;

use crate::core::registry::{NegotiatedTypes, TypeRegistry};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::RegistrationMessage;
use crate::transport::connection::ConnectionInfo;

/// Builds outgoing registrations and resolves incoming ones
pub trait NegotiationStrategy: Send + Sync {
    /// Registration announcing the local vocabulary
    fn registration(&self, registry: &TypeRegistry, session_id: u32) -> RegistrationMessage;

    /// Binds the remote ids of `registration` into `types`.
    ///
    /// An error rejects the peer; the connection is closed as a bad message.
    fn resolve(
        &self,
        registry: &TypeRegistry,
        registration: &RegistrationMessage,
        types: &mut NegotiatedTypes,
    ) -> Result<()>;
}

/// Exchanges the full type table by name
#[derive(Debug, Default, Clone, Copy)]
pub struct TypeTableNegotiation;

impl NegotiationStrategy for TypeTableNegotiation {
    fn registration(&self, registry: &TypeRegistry, session_id: u32) -> RegistrationMessage {
        let types = registry.user_types();
        RegistrationMessage {
            session_id,
            ids: types.iter().map(|entry| entry.id).collect(),
            names: types.iter().map(|entry| entry.name.to_string()).collect(),
        }
    }

    fn resolve(
        &self,
        registry: &TypeRegistry,
        registration: &RegistrationMessage,
        types: &mut NegotiatedTypes,
    ) -> Result<()> {
        if registration.ids.len() != registration.names.len() {
            return Err(ProtocolError::Malformed(format!(
                "registration carries {} ids but {} names",
                registration.ids.len(),
                registration.names.len()
            )));
        }

        // Resolve everything first so a bad table leaves `types` untouched
        let mut resolved = Vec::with_capacity(registration.ids.len());
        for (&remote_id, name) in registration.ids.iter().zip(&registration.names) {
            if remote_id <= 0 {
                return Err(ProtocolError::Malformed(format!(
                    "registration uses reserved id {remote_id} for '{name}'"
                )));
            }
            let entry = registry
                .by_name(name)
                .ok_or_else(|| ProtocolError::UnknownTypeName(name.clone()))?;
            resolved.push((remote_id, entry));
        }

        debug!(
            session_id = registration.session_id,
            types = resolved.len(),
            "Resolved remote type table"
        );
        for (remote_id, entry) in resolved {
            types.bind_remote(remote_id, entry);
        }
        Ok(())
    }
}

/// Admission check run when a peer's registration arrives
pub trait ConnectionFilter: Send + Sync {
    /// `Some(reason)` rejects the connection; the reason is sent to the peer
    fn filter(&self, connection: &ConnectionInfo) -> Option<String>;
}

impl<F> ConnectionFilter for F
where
    F: Fn(&ConnectionInfo) -> Option<String> + Send + Sync,
{
    fn filter(&self, connection: &ConnectionInfo) -> Option<String> {
        self(connection)
    }
}
