//! The multiplexed message router (§4.1).
//!
//! `Router` is the single owner of the bus transport: it assigns outgoing serials, correlates
//! replies against pending calls, fans signals out to subscribers, and walks the exposed-service
//! registry to dispatch inbound method calls. Everything else in this crate — `Proxy`,
//! `ObjectServer`, the `fdo` wrappers — is built on top of a `Router`, never talks to the
//! transport directly (§5 "Shared resources").

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};

use async_lock::Mutex as AsyncMutex;
use event_listener::Event;
use futures_util::future::{select, Either};
use slotmap::{new_key_type, SlotMap};
use tracing::{debug, trace, warn};
use zvariant::Value;

use crate::error::{Error, Result};
use crate::message::{Message, MessageBuilder, MessageType, SerialGenerator};
use crate::names::{
    InterfaceName, MemberName, ObjectPath, OwnedBusName, OwnedInterfaceName, OwnedMemberName,
    OwnedObjectPath, OwnedUniqueName,
};
use crate::object_server::Service;
use crate::signature::SignatureTree;
use crate::transport::Transport;
use crate::value::{DynamicValue, ValueBridge};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handler registered directly with the router, independent of any object tree (§4.1's
/// `register_method_handler`). Operates purely on marshal-form bodies; callers that want the
/// object-tree dispatch algorithm of §4.2 should use [`Router::register_service`] instead.
pub type MethodHandler =
    Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, Result<(String, Vec<Value<'static>>)>> + Send + Sync>;

/// A signal subscriber callback: receives the raw inbound signal message. Translation to
/// high-level values, if wanted, is the subscriber's job (it alone knows the signal's output
/// signature, e.g. from introspection) — mirrors §4.1 step 3 ("deliver the body (optionally
/// translated)").
pub type SignalCallback = Arc<dyn Fn(Arc<Message>) + Send + Sync>;

/// `(path, interface, member)` — the key signals are fanned out by (§4.1 step 3).
pub type SignalKey = (OwnedObjectPath, OwnedInterfaceName, OwnedMemberName);

new_key_type! {
    struct CallbackKey;
}

/// Handle returned by [`Router::add_match`]; pass to [`Router::remove_match`] to unsubscribe.
#[derive(Debug, Clone)]
pub struct SignalHandlerId {
    key: SignalKey,
    callback: CallbackKey,
}

/// A minimal single-value, multi-waiter-safe async cell: exactly the "one producer, one
/// consumer, awaited once" shape `invoke`'s completion needs. Built on `event-listener` (already
/// a crate dependency) rather than pulling in a channel crate for this one use.
struct Oneshot<T> {
    value: SyncMutex<Option<T>>,
    event: Event,
}

impl<T> Oneshot<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            value: SyncMutex::new(None),
            event: Event::new(),
        })
    }

    fn send(&self, value: T) {
        *self.value.lock().expect("lock poisoned") = Some(value);
        self.event.notify(usize::MAX);
    }

    async fn recv(&self) -> T {
        loop {
            if let Some(v) = self.value.lock().expect("lock poisoned").take() {
                return v;
            }
            let listener = self.event.listen();
            if let Some(v) = self.value.lock().expect("lock poisoned").take() {
                return v;
            }
            listener.await;
        }
    }
}

/// The outcome delivered to a pending call's waiter (§3's `PendingCall` entity).
enum PendingOutcome {
    Reply(Arc<Message>),
    Error(Arc<Message>),
    Cancelled,
}

/// A recorded outstanding call (§3). Removed on reply/error/cancellation — never twice (§3
/// Invariant 1).
struct PendingCall {
    outcome: Arc<Oneshot<PendingOutcome>>,
}

/// What an `invoke` call resolves to: the raw reply message, or — when the caller asked for
/// translation — its body already bridged to high-level values per the method's output
/// signature.
#[derive(Debug)]
pub enum InvokeReply {
    Raw(Arc<Message>),
    Translated(Vec<DynamicValue>),
}

impl InvokeReply {
    pub fn into_raw(self) -> Arc<Message> {
        match self {
            InvokeReply::Raw(m) => m,
            InvokeReply::Translated(_) => {
                panic!("invoke() was not asked to return the raw message")
            }
        }
    }

    pub fn into_translated(self) -> Vec<DynamicValue> {
        match self {
            InvokeReply::Translated(v) => v,
            InvokeReply::Raw(_) => panic!("invoke() was not asked to translate the reply"),
        }
    }
}

/// A handle to cancel a pending call (§5 "Cancellation and timeouts"). Dropping it without
/// calling [`cancel`](Self::cancel) has no effect — the call still completes normally.
pub struct CancelHandle {
    router: std::sync::Weak<Router>,
    serial: u32,
}

impl CancelHandle {
    /// Cancel the call. If it already completed, this is a no-op. A reply that arrives after
    /// cancellation is dropped silently (§5).
    pub async fn cancel(&self) {
        if let Some(router) = self.router.upgrade() {
            let mut pending = router.pending.lock().await;
            if let Some(call) = pending.remove(&self.serial) {
                call.outcome.send(PendingOutcome::Cancelled);
            }
        }
    }
}

struct RuleSubscription {
    rule: String,
    refs: usize,
}

/// The multiplexed message router (§4.1).
pub struct Router {
    transport: Arc<dyn Transport>,
    serials: SerialGenerator,
    unique_name: AsyncMutex<Option<OwnedUniqueName>>,
    pending: AsyncMutex<HashMap<u32, PendingCall>>,
    subscriptions: AsyncMutex<HashMap<SignalKey, SlotMap<CallbackKey, (String, SignalCallback)>>>,
    rules: AsyncMutex<HashMap<String, RuleSubscription>>,
    services: AsyncMutex<HashMap<OwnedBusName, Arc<Service>>>,
    handlers: AsyncMutex<HashMap<SignalKey, MethodHandler>>,
    dispatch_started: AtomicBool,
    /// Background work signal callbacks need to kick off without being able to `.await`
    /// themselves (e.g. `Proxy`'s `NameOwnerChanged`-driven reconnect). Ticked alongside the
    /// transport inside [`Router::run`], mirroring the teacher's own
    /// `self.connection().executor().spawn(...)` pattern.
    executor: async_executor::Executor<'static>,
}

impl Router {
    /// Wrap a connected `Transport`. Does not perform the `Hello` handshake itself — see
    /// [`crate::fdo::hello`] — so that `Router` stays usable against transports that aren't bus
    /// connections at all (e.g. a direct peer-to-peer `ChannelTransport` in tests).
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            serials: SerialGenerator::new(),
            unique_name: AsyncMutex::new(None),
            pending: AsyncMutex::new(HashMap::new()),
            subscriptions: AsyncMutex::new(HashMap::new()),
            rules: AsyncMutex::new(HashMap::new()),
            services: AsyncMutex::new(HashMap::new()),
            handlers: AsyncMutex::new(HashMap::new()),
            dispatch_started: AtomicBool::new(false),
            executor: async_executor::Executor::new(),
        })
    }

    /// The executor background tasks are spawned onto (e.g. by `Proxy`'s signal callbacks, which
    /// cannot themselves be `async`). Ticked by [`Router::run`] alongside the transport.
    pub fn executor(&self) -> &async_executor::Executor<'static> {
        &self.executor
    }

    pub async fn set_unique_name(&self, name: OwnedUniqueName) {
        *self.unique_name.lock().await = Some(name);
    }

    pub async fn unique_name(&self) -> Option<OwnedUniqueName> {
        self.unique_name.lock().await.clone()
    }

    /// Run the inbound dispatch loop (§4.1 "Inbound dispatch"). Intended to be spawned once per
    /// connection onto the host's executor; returns only when the transport closes.
    pub async fn run(self: &Arc<Self>) {
        if self.dispatch_started.swap(true, Ordering::SeqCst) {
            warn!("Router::run called more than once on the same router");
            return;
        }
        loop {
            let receive = Box::pin(self.transport.receive());
            let tick = Box::pin(self.executor.tick());
            match select(receive, tick).await {
                Either::Left((Ok(msg), _)) => self.dispatch_inbound(Arc::new(msg)).await,
                Either::Left((Err(e), _)) => {
                    debug!(error = %e, "transport closed, stopping dispatch loop");
                    return;
                }
                Either::Right(((), _)) => {}
            }
        }
    }

    async fn dispatch_inbound(self: &Arc<Self>, msg: Arc<Message>) {
        trace!(%msg, "dispatching inbound message");
        match msg.message_type() {
            MessageType::MethodReturn | MessageType::Error => {
                self.complete_pending(msg).await;
            }
            MessageType::Signal => {
                self.fan_out_signal(msg).await;
            }
            MessageType::MethodCall => {
                self.dispatch_call(msg).await;
            }
        }
    }

    async fn complete_pending(&self, msg: Arc<Message>) {
        let Some(reply_serial) = msg.reply_serial() else {
            return;
        };
        let call = self.pending.lock().await.remove(&reply_serial);
        match call {
            Some(call) => {
                let outcome = if msg.message_type() == MessageType::Error {
                    PendingOutcome::Error(msg)
                } else {
                    PendingOutcome::Reply(msg)
                };
                call.outcome.send(outcome);
            }
            None => trace!(reply_serial, "no pending call for reply, dropping"),
        }
    }

    async fn fan_out_signal(&self, msg: Arc<Message>) {
        let Some(key) = msg.signal_key() else {
            return;
        };
        let subscriptions = self.subscriptions.lock().await;
        if let Some(callbacks) = subscriptions.get(&key) {
            for (_, callback) in callbacks.values() {
                callback(msg.clone());
            }
        }
    }

    async fn dispatch_call(self: &Arc<Self>, msg: Arc<Message>) {
        if let Some(dest) = msg.destination() {
            let service = self.services.lock().await.get(dest).cloned();
            if let Some(service) = service {
                self.dispatch_to_service(service, msg).await;
                return;
            }
        }

        if let Some(key) = msg.signal_key() {
            let handler = self.handlers.lock().await.get(&key).cloned();
            if let Some(handler) = handler {
                self.run_handler(handler, msg).await;
                return;
            }
        }

        let text = match msg.destination() {
            Some(d) => format!("{} was not provided by any .service files", d),
            None => "no destination specified".to_string(),
        };
        self.reply_with_standard_error(&msg, "org.freedesktop.DBus.Error.UnknownService", &text)
            .await;
    }

    async fn dispatch_to_service(self: &Arc<Self>, service: Arc<Service>, msg: Arc<Message>) {
        use crate::message::MessageFlags;
        use crate::object_server::DispatchOutcome;

        let no_reply = msg.flags().contains(MessageFlags::NoReplyExpected);
        match service.dispatch(&msg).await {
            Ok(DispatchOutcome::Return(signature, body)) => {
                if !no_reply {
                    self.send_reply(&msg, signature, body).await.ok();
                }
            }
            Ok(DispatchOutcome::NoReply) => {}
            Err(e) => {
                if !no_reply {
                    let (name, text) = e.dbus_error_name_and_text();
                    self.reply_with_standard_error(&msg, &name, &text).await;
                }
            }
        }
    }

    async fn run_handler(&self, handler: MethodHandler, msg: Arc<Message>) {
        use crate::message::MessageFlags;

        let no_reply = msg.flags().contains(MessageFlags::NoReplyExpected);
        match handler(msg.clone()).await {
            Ok((signature, body)) => {
                if !no_reply {
                    self.send_reply(&msg, signature, body).await.ok();
                }
            }
            Err(e) => {
                if !no_reply {
                    let (name, text) = e.dbus_error_name_and_text();
                    self.reply_with_standard_error(&msg, &name, &text).await;
                }
            }
        }
    }

    async fn reply_with_standard_error(&self, original: &Message, error_name: &str, text: &str) {
        if let Err(e) = self.send_error(original, error_name, text).await {
            warn!(error = %e, "failed to send error reply");
        }
    }

    /// Assign a serial, send `message`, and await its completion (§4.1 `invoke`). When
    /// `output_trees` is `Some`, a successful reply's body is translated to high-level values
    /// using those trees (one per top-level body element) before resolving.
    pub async fn invoke(
        self: &Arc<Self>,
        mut message: Message,
        output_trees: Option<&[SignatureTree]>,
    ) -> Result<InvokeReply> {
        let serial = self.serials.next();
        message.set_serial(serial);

        let outcome = Oneshot::new();
        self.pending.lock().await.insert(
            serial,
            PendingCall {
                outcome: outcome.clone(),
            },
        );

        if let Err(e) = self.transport.send(message).await {
            self.pending.lock().await.remove(&serial);
            return Err(e);
        }

        match outcome.recv().await {
            PendingOutcome::Reply(msg) => match output_trees {
                Some(trees) => {
                    let values = translate_body(&msg, trees)?;
                    Ok(InvokeReply::Translated(values))
                }
                None => Ok(InvokeReply::Raw(msg)),
            },
            PendingOutcome::Error(msg) => {
                let name = msg
                    .error_name()
                    .map(|n| n.as_str().to_string())
                    .unwrap_or_else(|| "org.freedesktop.DBus.Error.Failed".to_string());
                let text = match msg.body().first() {
                    Some(Value::Str(s)) => s.as_str().to_string(),
                    _ => String::new(),
                };
                Err(Error::User {
                    name: crate::names::OwnedErrorName::try_from(name)
                        .unwrap_or_else(|_| {
                            crate::names::OwnedErrorName::try_from(
                                "org.freedesktop.DBus.Error.Failed".to_string(),
                            )
                            .expect("hardcoded error name is valid")
                        }),
                    text,
                })
            }
            PendingOutcome::Cancelled => Err(Error::Cancelled),
        }
    }

    /// A cancel handle for the call this serial was assigned to (used together with `invoke` by
    /// callers who spawned the invocation and want to cancel it from elsewhere).
    pub fn cancel_handle(self: &Arc<Self>, serial: u32) -> CancelHandle {
        CancelHandle {
            router: Arc::downgrade(self),
            serial,
        }
    }

    /// Send a signal; no pending correlation is recorded (§4.1).
    pub async fn send_signal(
        self: &Arc<Self>,
        path: ObjectPath<'_>,
        interface: InterfaceName<'_>,
        member: MemberName<'_>,
        signature: String,
        body: Vec<Value<'static>>,
    ) -> Result<()> {
        let mut message = MessageBuilder::signal(path, interface, member)?.build(signature, body);
        message.set_serial(self.serials.next());
        self.transport.send(message).await
    }

    /// Reply to `original` with a method return (§4.1).
    pub async fn send_reply(
        &self,
        original: &Message,
        signature: String,
        body: Vec<Value<'static>>,
    ) -> Result<()> {
        let mut reply = MessageBuilder::method_return(original)?.build(signature, body);
        reply.set_serial(self.serials.next());
        self.transport.send(reply).await
    }

    /// Reply to `original` with an error (§4.1).
    pub async fn send_error(&self, original: &Message, error_name: &str, text: &str) -> Result<()> {
        let mut reply = MessageBuilder::error(original, error_name.to_string())?
            .build("s".to_string(), vec![Value::new(text.to_string())]);
        reply.set_serial(self.serials.next());
        self.transport.send(reply).await
    }

    /// Register a low-level handler, independent of any object tree (§4.1).
    pub async fn register_method_handler(
        &self,
        path: OwnedObjectPath,
        interface: OwnedInterfaceName,
        member: OwnedMemberName,
        handler: MethodHandler,
    ) {
        self.handlers
            .lock()
            .await
            .insert((path, interface, member), handler);
    }

    /// Publish a service's object tree under `name` (§4.1).
    pub async fn register_service(&self, name: OwnedBusName, service: Arc<Service>) {
        self.services.lock().await.insert(name, service);
    }

    /// Withdraw a previously published service (§4.1).
    pub async fn unregister_service(&self, name: &OwnedBusName) -> Option<Arc<Service>> {
        self.services.lock().await.remove(name)
    }

    /// Subscribe to signals matching `key`, issuing the daemon's `AddMatch` the first time `rule`
    /// is seen (§5 "Match subscriptions are reference-counted").
    pub async fn add_match(
        self: &Arc<Self>,
        rule: String,
        key: SignalKey,
        callback: SignalCallback,
    ) -> Result<SignalHandlerId> {
        let mut rules = self.rules.lock().await;
        match rules.get_mut(&rule) {
            Some(entry) => entry.refs += 1,
            None => {
                self.call_daemon("AddMatch", rule.clone()).await?;
                rules.insert(
                    rule.clone(),
                    RuleSubscription {
                        rule: rule.clone(),
                        refs: 1,
                    },
                );
            }
        }
        drop(rules);

        let mut subscriptions = self.subscriptions.lock().await;
        let slot = subscriptions
            .entry(key.clone())
            .or_insert_with(SlotMap::with_key)
            .insert((rule, callback));
        Ok(SignalHandlerId {
            key,
            callback: slot,
        })
    }

    /// Unsubscribe; only the last removal of a given rule issues `RemoveMatch` (§5).
    pub async fn remove_match(self: &Arc<Self>, id: SignalHandlerId) -> Result<()> {
        let rule = {
            let mut subscriptions = self.subscriptions.lock().await;
            let Some(callbacks) = subscriptions.get_mut(&id.key) else {
                return Ok(());
            };
            let removed = callbacks.remove(id.callback);
            if callbacks.is_empty() {
                subscriptions.remove(&id.key);
            }
            removed.map(|(rule, _)| rule)
        };

        let Some(rule) = rule else {
            return Ok(());
        };

        let mut rules = self.rules.lock().await;
        if let Some(entry) = rules.get_mut(&rule) {
            entry.refs -= 1;
            if entry.refs == 0 {
                let rule = entry.rule.clone();
                rules.remove(&rule);
                drop(rules);
                self.call_daemon("RemoveMatch", rule).await?;
            }
        }
        Ok(())
    }

    /// Issue a method call to `org.freedesktop.DBus` with a single string argument, used
    /// internally by `add_match`/`remove_match` so they don't depend on the `fdo` convenience
    /// layer (which is itself built atop `Router::invoke`).
    async fn call_daemon(self: &Arc<Self>, member: &str, arg: String) -> Result<()> {
        let message = MessageBuilder::method_call("/org/freedesktop/DBus", member)?
            .destination("org.freedesktop.DBus")?
            .interface("org.freedesktop.DBus")?
            .build("s".to_string(), vec![Value::new(arg)]);
        self.invoke(message, None).await?;
        Ok(())
    }
}

fn translate_body(msg: &Message, trees: &[SignatureTree]) -> Result<Vec<DynamicValue>> {
    if msg.body().len() != trees.len() {
        return Err(Error::Protocol(format!(
            "reply has {} body elements, expected {} per output signature",
            msg.body().len(),
            trees.len()
        )));
    }
    msg.body()
        .iter()
        .zip(trees)
        .map(|(value, tree)| ValueBridge::marshal_to_high(value, tree))
        .collect()
}

impl Error {
    /// Map this error onto the `(error_name, text)` pair sent over the wire for a failed method
    /// call (§4.1 "Error conditions", §7).
    pub fn dbus_error_name_and_text(&self) -> (String, String) {
        match self {
            Error::UnknownObject(path) => (
                "org.freedesktop.DBus.Error.UnknownObject".to_string(),
                format!("Unknown object '{path}'"),
            ),
            Error::UnknownInterface(name) => (
                "org.freedesktop.DBus.Error.UnknownInterface".to_string(),
                format!("Unknown interface '{name}'"),
            ),
            Error::UnknownMethod(name) => (
                "org.freedesktop.DBus.Error.UnknownMethod".to_string(),
                format!("Unknown method '{name}'"),
            ),
            Error::UnknownService(name) => (
                "org.freedesktop.DBus.Error.UnknownService".to_string(),
                format!("Unknown service '{name}'"),
            ),
            Error::PropertyReadOnly(name) => (
                "org.freedesktop.DBus.Error.PropertyReadOnly".to_string(),
                format!("Property '{name}' is read-only"),
            ),
            Error::PropertyWriteOnly(name) => (
                "org.freedesktop.DBus.Error.PropertyWriteOnly".to_string(),
                format!("Property '{name}' is write-only"),
            ),
            Error::User { name, text } => {
                (format!("org.freedesktop.DBus.{}", name.as_str()), text.clone())
            }
            Error::Protocol(msg) => ("org.freedesktop.DBus.Error.Failed".to_string(), msg.clone()),
            other => (
                "org.freedesktop.DBus.Error.Failed".to_string(),
                other.to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use futures_util::future::{select, Either};

    #[test]
    fn invoke_round_trips_through_a_registered_handler() {
        async_io::block_on(async {
            let (client_t, service_t) = ChannelTransport::pair();
            let client = Router::new(client_t);
            let service = Router::new(service_t);

            service
                .register_method_handler(
                    OwnedObjectPath::try_from("/com/example/Foo").unwrap(),
                    OwnedInterfaceName::try_from("com.example.Foo").unwrap(),
                    OwnedMemberName::try_from("Ping").unwrap(),
                    Arc::new(|_msg: Arc<Message>| {
                        Box::pin(async {
                            Ok(("s".to_string(), vec![Value::new("pong".to_string())]))
                        }) as BoxFuture<'static, Result<(String, Vec<Value<'static>>)>>
                    }),
                )
                .await;

            let service_run = Box::pin(service.run());
            let call = Box::pin(async {
                let msg = MessageBuilder::method_call("/com/example/Foo", "Ping")
                    .unwrap()
                    .destination("com.example.Foo")
                    .unwrap()
                    .interface("com.example.Foo")
                    .unwrap()
                    .build(String::new(), vec![]);
                client.invoke(msg, None).await
            });

            match select(service_run, call).await {
                Either::Right((result, _service_run)) => {
                    let reply = result.unwrap().into_raw();
                    assert_eq!(reply.body()[0], Value::new("pong".to_string()));
                }
                Either::Left(_) => panic!("service dispatch loop ended before the call completed"),
            }
        });
    }

    #[test]
    fn unregistered_destination_yields_unknown_service_error() {
        async_io::block_on(async {
            let (client_t, service_t) = ChannelTransport::pair();
            let client = Router::new(client_t);
            let service = Router::new(service_t);

            let service_run = Box::pin(service.run());
            let call = Box::pin(async {
                let msg = MessageBuilder::method_call("/com/example/Foo", "Ping")
                    .unwrap()
                    .destination("com.example.Nobody")
                    .unwrap()
                    .interface("com.example.Foo")
                    .unwrap()
                    .build(String::new(), vec![]);
                client.invoke(msg, None).await
            });

            match select(service_run, call).await {
                Either::Right((result, _service_run)) => {
                    assert!(result.is_err());
                }
                Either::Left(_) => panic!("service dispatch loop ended before the call completed"),
            }
        });
    }
}
