//! Shared setup for the integration suite: the same in-process stand-in for
//! `org.freedesktop.DBus` the demos use, so these tests exercise the router/object-tree/proxy
//! stack end-to-end against an in-process [`ChannelTransport`] without a real bus daemon.

use std::sync::Arc;

use dbus_core::names::{OwnedInterfaceName, OwnedMemberName, OwnedObjectPath};
use dbus_core::router::Router;
use dbus_core::Message;
use zvariant::Value;

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
            Arc::new(|_msg: Arc<Message>| Box::pin(async { Ok(("u".to_string(), vec![Value::U32(1)])) })),
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
            Arc::new(|_msg: Arc<Message>| Box::pin(async { Ok(("b".to_string(), vec![Value::Bool(true)])) })),
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

/// Links two routers over a [`dbus_core::transport::ChannelTransport`] pair, each answering the
/// other's daemon calls, and spawns both dispatch loops in the background.
pub async fn linked_routers(server_name: &'static str, client_name: &'static str) -> (Arc<Router>, Arc<Router>) {
    let (client_transport, server_transport) = dbus_core::transport::ChannelTransport::pair();

    let server = Router::new(server_transport);
    let client = Router::new(client_transport);
    install_stub_daemon(&server, server_name).await;
    install_stub_daemon(&client, client_name).await;

    let server_run = server.clone();
    async_io::Task::detach(async_io::Task::spawn(async move {
        server_run.run().await;
    }));
    let client_run = client.clone();
    async_io::Task::detach(async_io::Task::spawn(async move {
        client_run.run().await;
    }));

    (server, client)
}
