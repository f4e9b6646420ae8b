use crate::error::{constants, ProtocolError, Result};
use crate::protocol::envelope::Envelope;
use crate::protocol::message::MessageType;
use crate::transport::listener::MessageListener;
use crate::transport::reactor::ConnectionHandle;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

type HandlerFn<C> = dyn Fn(&C, &Envelope) -> Result<()> + Send + Sync + 'static;

/// Routes received messages to handlers by fully qualified type name.
/// Keys of typed handlers borrow the type's static name, so registering them
/// allocates no key string.
pub struct Dispatcher<C = ConnectionHandle> {
    handlers: Arc<RwLock<HashMap<Cow<'static, str>, Box<HandlerFn<C>>>>>,
    fallback: Arc<RwLock<Option<Box<HandlerFn<C>>>>>,
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("Dispatcher")
            .field("handlers", &handlers)
            .finish()
    }
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            fallback: Arc::new(RwLock::new(None)),
        }
    }

    /// Registers a typed handler for `T`, replacing any previous one
    pub fn register<T, F>(&self, handler: F) -> Result<()>
    where
        T: MessageType,
        F: Fn(&C, &T) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(
            Cow::Borrowed(T::NAME),
            Box::new(move |conn: &C, envelope: &Envelope| match envelope.payload.downcast_ref::<T>() {
                Some(message) => handler(conn, message),
                None => Err(ProtocolError::UnhandledMessage(
                    envelope.payload.type_name().to_string(),
                )),
            }),
        )
    }

    /// Registers a handler by type name, receiving the whole envelope
    pub fn register_name<F>(&self, type_name: &str, handler: F) -> Result<()>
    where
        F: Fn(&C, &Envelope) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(Cow::Owned(type_name.to_string()), Box::new(handler))
    }

    /// Handler for every type without a registered handler
    pub fn set_fallback<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&C, &Envelope) -> Result<()> + Send + Sync + 'static,
    {
        let mut fallback = self.fallback.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;
        *fallback = Some(Box::new(handler));
        Ok(())
    }

    fn insert(&self, key: Cow<'static, str>, handler: Box<HandlerFn<C>>) -> Result<()> {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        handlers.insert(key, handler);
        Ok(())
    }

    pub fn dispatch(&self, conn: &C, envelope: &Envelope) -> Result<()> {
        let type_name = envelope.payload.type_name();

        let handlers = self.handlers.read().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
        })?;
        if let Some(handler) = handlers.get(type_name) {
            return handler(conn, envelope);
        }
        drop(handlers);

        let fallback = self.fallback.read().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string())
        })?;
        fallback
            .as_ref()
            .ok_or_else(|| ProtocolError::UnhandledMessage(type_name.to_string()))
            .and_then(|handler| handler(conn, envelope))
    }
}

impl MessageListener for Dispatcher<ConnectionHandle> {
    fn on_received(&self, connection: &ConnectionHandle, envelope: &Envelope) {
        if let Err(e) = self.dispatch(connection, envelope) {
            warn!(
                connection = connection.id(),
                type_name = envelope.payload.type_name(),
                error = %e,
                "Dispatch failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::wire_fields;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Ping {
        seq: u32,
    }
    wire_fields!(Ping { seq });
    impl MessageType for Ping {
        const NAME: &'static str = "test.dispatch.Ping";
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Pong {
        seq: u32,
    }
    wire_fields!(Pong { seq });
    impl MessageType for Pong {
        const NAME: &'static str = "test.dispatch.Pong";
    }

    /// Stand-in for a connection: collects what handlers saw
    #[derive(Default)]
    struct Seen {
        total: AtomicU32,
    }

    #[test]
    fn test_typed_handler_receives_concrete_message() {
        let dispatcher = Dispatcher::<Seen>::new();
        dispatcher
            .register::<Ping, _>(|seen, ping| {
                seen.total.fetch_add(ping.seq, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let seen = Seen::default();
        dispatcher.dispatch(&seen, &Envelope::of(Ping { seq: 4 })).unwrap();
        dispatcher.dispatch(&seen, &Envelope::of(Ping { seq: 3 })).unwrap();
        assert_eq!(seen.total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_unhandled_without_fallback() {
        let dispatcher = Dispatcher::<Seen>::new();
        let result = dispatcher.dispatch(&Seen::default(), &Envelope::of(Pong::default()));
        assert!(matches!(result, Err(ProtocolError::UnhandledMessage(name)) if name == Pong::NAME));
    }

    #[test]
    fn test_fallback_and_named_handlers() {
        let dispatcher = Dispatcher::<Seen>::new();
        dispatcher
            .register_name(Pong::NAME, |seen, _| {
                seen.total.fetch_add(100, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        dispatcher
            .set_fallback(|seen, _| {
                seen.total.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let seen = Seen::default();
        dispatcher.dispatch(&seen, &Envelope::of(Pong::default())).unwrap();
        dispatcher.dispatch(&seen, &Envelope::of(Ping::default())).unwrap();
        assert_eq!(seen.total.load(Ordering::SeqCst), 101);
    }
}
