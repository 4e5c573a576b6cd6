//! Minimal round trip: a one-method service, a proxy that calls it.
//!
//! There is no system/session bus to dial into, so this demo links two [`ChannelTransport`] ends
//! directly and has each side answer the other's `org.freedesktop.DBus` calls — see
//! `demos/common.rs`.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use dbus_core::interface::{Access, InterfaceDescriptor, MethodDescriptor, PropertyDescriptor};
use dbus_core::names::OwnedBusName;
use dbus_core::signature::SignatureTree;
use dbus_core::value::DynamicValue;
use dbus_core::{Error, Interface, ProxyBuilder, Result, Router, Service};

struct Greeter;

impl Greeter {
    fn descriptor() -> Arc<InterfaceDescriptor> {
        Arc::new(
            InterfaceDescriptor::new("com.example.Greeter")
                .with_method(MethodDescriptor {
                    name: "SayHello".to_string(),
                    input_signatures: vec![SignatureTree::parse("s").unwrap()],
                    output_signatures: vec![SignatureTree::parse("s").unwrap()],
                    input_arg_names: vec!["name".to_string()],
                    output_arg_names: vec!["greeting".to_string()],
                })
                .with_property(PropertyDescriptor {
                    name: "Greeted".to_string(),
                    access: Access::Read,
                    signature: SignatureTree::parse("u").unwrap(),
                }),
        )
    }
}

#[async_trait]
impl Interface for Greeter {
    fn descriptor(&self) -> Arc<InterfaceDescriptor> {
        Self::descriptor()
    }

    async fn call(&self, method: &str, args: Vec<DynamicValue>) -> Result<Vec<DynamicValue>> {
        match method {
            "SayHello" => {
                let DynamicValue::Str(name) = &args[0] else {
                    return Err(Error::Protocol("SayHello expects a string".to_string()));
                };
                let who = if name.is_empty() { "world" } else { name };
                Ok(vec![DynamicValue::Str(format!("Hello, {who}!"))])
            }
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }

    async fn get(&self, name: &str) -> Result<DynamicValue> {
        match name {
            "Greeted" => Ok(DynamicValue::U32(0)),
            other => Err(Error::Protocol(format!("no such property: {other}"))),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    async_io::block_on(async {
        let (client_transport, server_transport) = dbus_core::transport::ChannelTransport::pair();

        let server_router = Router::new(server_transport);
        let client_router = Router::new(client_transport);
        common::install_stub_daemon(&server_router, ":1.server").await;
        common::install_stub_daemon(&client_router, ":1.client").await;

        let server_run = server_router.clone();
        async_io::Task::detach(async_io::Task::spawn(async move {
            server_run.run().await;
        }));
        let client_run = client_router.clone();
        async_io::Task::detach(async_io::Task::spawn(async move {
            client_run.run().await;
        }));

        let name = OwnedBusName::try_from("com.example.Greeter".to_string()).unwrap();
        let service = Service::new(name, &server_router);
        service.add_interface(Arc::new(Greeter)).await?;
        service
            .expose(dbus_core::fdo::default_request_name_flags())
            .await?;

        let proxy = ProxyBuilder::new(client_router, "com.example.Greeter")
            .build()
            .await?;
        let root = proxy.root().await;
        let greeter = root
            .interface("com.example.Greeter")
            .await
            .expect("Greeter interface not found on the introspected root");

        let reply = greeter
            .call("SayHello", vec![DynamicValue::Str(String::new())])
            .await?;
        println!("{reply:?}");
        assert_eq!(reply, vec![DynamicValue::Str("Hello, world!".to_string())]);

        let reply = greeter
            .call("SayHello", vec![DynamicValue::Str("Alice".to_string())])
            .await?;
        println!("{reply:?}");
        assert_eq!(reply, vec![DynamicValue::Str("Hello, Alice!".to_string())]);

        Ok(())
    })
}
