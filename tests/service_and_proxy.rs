//! End-to-end coverage of the router/object-tree/proxy stack, each test linking two in-process
//! [`ChannelTransport`] ends the way `demos/common.rs` does, without a real bus daemon.

mod support;

use std::sync::Arc;

use async_trait::async_trait;
use dbus_core::interface::{Access, InterfaceDescriptor, MethodDescriptor, PropertyDescriptor};
use dbus_core::names::OwnedBusName;
use dbus_core::signature::SignatureTree;
use dbus_core::value::DynamicValue;
use dbus_core::{Error, Interface, MessageBuilder, ProxyBuilder, Result, Service};
use ntest::timeout;
use test_log::test;

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

#[test]
#[timeout(5000)]
fn proxy_call_round_trips_through_introspection() {
    async_io::block_on(async {
        let (server_router, client_router) =
            support::linked_routers(":1.server", ":1.client").await;

        let name = OwnedBusName::try_from("com.example.Greeter".to_string()).unwrap();
        let service = Service::new(name, &server_router);
        service.add_interface(Arc::new(Greeter)).await.unwrap();
        service
            .expose(dbus_core::fdo::default_request_name_flags())
            .await
            .unwrap();

        let proxy = ProxyBuilder::new(client_router, "com.example.Greeter")
            .build()
            .await
            .unwrap();
        let root = proxy.root().await;
        let greeter = root
            .interface("com.example.Greeter")
            .await
            .expect("Greeter interface not found on the introspected root");

        let reply = greeter
            .call("SayHello", vec![DynamicValue::Str("Alice".to_string())])
            .await
            .unwrap();
        assert_eq!(reply, vec![DynamicValue::Str("Hello, Alice!".to_string())]);

        let props = greeter.cached_properties().await;
        assert!(props.iter().any(|(name, _)| name == "Greeted"));
    });
}

#[test]
#[timeout(5000)]
fn calling_an_unknown_method_returns_unknown_method() {
    async_io::block_on(async {
        let (server_router, client_router) =
            support::linked_routers(":1.server", ":1.client").await;

        let name = OwnedBusName::try_from("com.example.Greeter".to_string()).unwrap();
        let service = Service::new(name, &server_router);
        service.add_interface(Arc::new(Greeter)).await.unwrap();
        service
            .expose(dbus_core::fdo::default_request_name_flags())
            .await
            .unwrap();

        let proxy = ProxyBuilder::new(client_router, "com.example.Greeter")
            .build()
            .await
            .unwrap();
        let root = proxy.root().await;
        let greeter = root.interface("com.example.Greeter").await.unwrap();

        let err = greeter.call("Nope", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownMethod(member) if member == "Nope"));
    });
}

#[test]
#[timeout(5000)]
fn calling_an_unpublished_path_names_the_full_path_in_the_error() {
    async_io::block_on(async {
        let (server_router, client_router) =
            support::linked_routers(":1.server", ":1.client").await;

        let name = OwnedBusName::try_from("com.example.Greeter".to_string()).unwrap();
        let service = Service::new(name, &server_router);
        service.add_interface(Arc::new(Greeter)).await.unwrap();
        service
            .expose(dbus_core::fdo::default_request_name_flags())
            .await
            .unwrap();

        let msg = MessageBuilder::method_call("/com/example/Missing", "SayHello")
            .unwrap()
            .destination("com.example.Greeter")
            .unwrap()
            .interface("com.example.Greeter")
            .unwrap()
            .build("s".to_string(), vec![zvariant::Value::new("x".to_string())]);

        let err = client_router.invoke(msg, None).await.unwrap_err();
        match err {
            Error::User { text, .. } => {
                assert!(
                    text.contains("/com/example/Missing"),
                    "expected the error text to name the full requested path, got {text:?}"
                );
            }
            other => panic!("expected Error::User carrying the UnknownObject reply, got {other:?}"),
        }
    });
}
