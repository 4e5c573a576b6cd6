//! A tiny in-process stand-in for `org.freedesktop.DBus` itself, shared by both demos.
//!
//! `ChannelTransport` links exactly two peers (§4.0); there is no third "real daemon" process for
//! either end to talk to. Both demos sidestep that by having each peer answer the handful of
//! daemon calls the other peer's [`ConnectionBuilder`]/[`ProxyBuilder`] always issues — `Hello` on
//! connect, `RequestName` when a service publishes, `NameHasOwner`/`AddMatch`/`RemoveMatch` when a
//! proxy connects. Neither demo talks to a real system or session bus.

use std::sync::Arc;

use dbus_core::names::{OwnedInterfaceName, OwnedMemberName, OwnedObjectPath};
use dbus_core::router::Router;
use dbus_core::Message;
use zvariant::Value;

/// Install handlers for the daemon calls a single-peer demo actually exercises. `unique_name` is
/// what this router answers its own `Hello` with.
pub async fn install_stub_daemon(router: &Arc<Router>, unique_name: &'static str) {
    let path = OwnedObjectPath::try_from("/org/freedesktop/DBus").unwrap();
    let iface = OwnedInterfaceName::try_from("org.freedesktop.DBus").unwrap();

    router
        .register_method_handler(
            path.clone(),
            iface.clone(),
            OwnedMemberName::try_from("Hello").unwrap(),
            Arc::new(move |_msg: Arc<Message>| {
                Box::pin(async move { Ok(("s".to_string(), vec![Value::new(unique_name.to_string())])) })
            }),
        )
        .await;

    router
        .register_method_handler(
            path.clone(),
            iface.clone(),
            OwnedMemberName::try_from("RequestName").unwrap(),
            Arc::new(|_msg: Arc<Message>| {
                // Always grants primary ownership (§6 code 1) — there is only one requester.
                Box::pin(async { Ok(("u".to_string(), vec![Value::U32(1)])) })
            }),
        )
        .await;

    router
        .register_method_handler(
            path.clone(),
            iface.clone(),
            OwnedMemberName::try_from("ReleaseName").unwrap(),
            Arc::new(|_msg: Arc<Message>| Box::pin(async { Ok(("u".to_string(), vec![Value::U32(1)])) })),
        )
        .await;

    router
        .register_method_handler(
            path.clone(),
            iface.clone(),
            OwnedMemberName::try_from("NameHasOwner").unwrap(),
            Arc::new(|_msg: Arc<Message>| {
                // The peer always already owns whatever name is being asked about, since these
                // demos never exercise bus activation (§1 Non-goals).
                Box::pin(async { Ok(("b".to_string(), vec![Value::Bool(true)])) })
            }),
        )
        .await;

    router
        .register_method_handler(
            path.clone(),
            iface.clone(),
            OwnedMemberName::try_from("GetNameOwner").unwrap(),
            Arc::new(move |_msg: Arc<Message>| {
                Box::pin(async move { Ok(("s".to_string(), vec![Value::new(unique_name.to_string())])) })
            }),
        )
        .await;

    router
        .register_method_handler(
            path.clone(),
            iface.clone(),
            OwnedMemberName::try_from("AddMatch").unwrap(),
            Arc::new(|_msg: Arc<Message>| Box::pin(async { Ok((String::new(), vec![])) })),
        )
        .await;

    router
        .register_method_handler(
            path,
            iface,
            OwnedMemberName::try_from("RemoveMatch").unwrap(),
            Arc::new(|_msg: Arc<Message>| Box::pin(async { Ok((String::new(), vec![])) })),
        )
        .await;
}
