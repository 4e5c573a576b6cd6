//! The four standard interfaces every node carries, implicitly or by opt-in (§4.4, §3 Invariant 6).
//!
//! Grounded on `dbus-crossroads`'s `stdimpl.rs` (Get/Set/GetAll, `GetManagedObjects`, the
//! ancestor-walk used to find the nearest `ObjectManager`), re-expressed as `async fn`s returning
//! [`Interface`] impls with `Weak<ObjectNode>` back-references instead of that crate's
//! continuation-passing callback registry — the callback style predates `async`/`await` in that
//! project and doesn't fit this async-native crate.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use rand::Rng;
use tracing::debug;

use crate::error::{Error, Result};
use crate::interface::{Interface, InterfaceDescriptor, MethodDescriptor, SignalDescriptor};
use crate::names::OwnedObjectPath;
use crate::object_server::node::{ObjectManagerPolicy, ObjectNode};
use crate::signal::SignalEmitter;
use crate::signature::SignatureTree;
use crate::value::{DynamicValue, PropertyMap};

fn sig(s: &str) -> SignatureTree {
    SignatureTree::parse(s).expect("hardcoded standard-interface signature is well-formed")
}

/// `org.freedesktop.DBus.Peer`: `Ping()` and `GetMachineId()`.
pub struct PeerInterface {
    descriptor: Arc<InterfaceDescriptor>,
    machine_id: String,
}

impl PeerInterface {
    pub fn new() -> Self {
        let descriptor = InterfaceDescriptor::new("org.freedesktop.DBus.Peer")
            .with_method(MethodDescriptor {
                name: "Ping".to_string(),
                input_signatures: vec![],
                output_signatures: vec![],
                input_arg_names: vec![],
                output_arg_names: vec![],
            })
            .with_method(MethodDescriptor {
                name: "GetMachineId".to_string(),
                input_signatures: vec![],
                output_signatures: vec![sig("s")],
                input_arg_names: vec![],
                output_arg_names: vec!["machine_uuid".to_string()],
            });
        // Not sourced from the transport (§4.4 says "provided by the transport", but `Transport`
        // doesn't expose one) — generated once per node and stable for the node's lifetime.
        let machine_id: String = (0..32)
            .map(|_| std::char::from_digit(rand::thread_rng().gen_range(0..16), 16).unwrap())
            .collect();
        Self {
            descriptor: Arc::new(descriptor),
            machine_id,
        }
    }
}

impl Default for PeerInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Interface for PeerInterface {
    fn descriptor(&self) -> Arc<InterfaceDescriptor> {
        self.descriptor.clone()
    }

    async fn call(&self, method: &str, _args: Vec<DynamicValue>) -> Result<Vec<DynamicValue>> {
        match method {
            "Ping" => Ok(vec![]),
            "GetMachineId" => Ok(vec![DynamicValue::Str(self.machine_id.clone())]),
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}

/// `org.freedesktop.DBus.Introspectable`: `Introspect() -> s`.
pub struct IntrospectableInterface {
    descriptor: Arc<InterfaceDescriptor>,
    node: Weak<ObjectNode>,
}

impl IntrospectableInterface {
    pub fn new(node: Weak<ObjectNode>) -> Self {
        let descriptor = InterfaceDescriptor::new("org.freedesktop.DBus.Introspectable")
            .with_method(MethodDescriptor {
                name: "Introspect".to_string(),
                input_signatures: vec![],
                output_signatures: vec![sig("s")],
                input_arg_names: vec![],
                output_arg_names: vec!["xml_data".to_string()],
            });
        Self {
            descriptor: Arc::new(descriptor),
            node,
        }
    }
}

#[async_trait]
impl Interface for IntrospectableInterface {
    fn descriptor(&self) -> Arc<InterfaceDescriptor> {
        self.descriptor.clone()
    }

    async fn call(&self, method: &str, _args: Vec<DynamicValue>) -> Result<Vec<DynamicValue>> {
        match method {
            "Introspect" => {
                let node = self
                    .node
                    .upgrade()
                    .ok_or_else(|| Error::Protocol("object node no longer exists".into()))?;
                Ok(vec![DynamicValue::Str(node.introspect().await)])
            }
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }
}

/// `org.freedesktop.DBus.Properties`: `Get`/`Set`/`GetAll`, plus the `PropertiesChanged` emitter
/// every other interface's `PropertyCell` notifications and plain `Set` calls route through.
pub struct PropertiesInterface {
    descriptor: Arc<InterfaceDescriptor>,
    node: Weak<ObjectNode>,
    emitter: OnceCell<SignalEmitter>,
}

impl PropertiesInterface {
    pub fn new(node: Weak<ObjectNode>) -> Self {
        let descriptor = InterfaceDescriptor::new("org.freedesktop.DBus.Properties")
            .with_method(MethodDescriptor {
                name: "Get".to_string(),
                input_signatures: vec![sig("s"), sig("s")],
                output_signatures: vec![sig("v")],
                input_arg_names: vec!["interface_name".to_string(), "property_name".to_string()],
                output_arg_names: vec!["value".to_string()],
            })
            .with_method(MethodDescriptor {
                name: "Set".to_string(),
                input_signatures: vec![sig("s"), sig("s"), sig("v")],
                output_signatures: vec![],
                input_arg_names: vec![
                    "interface_name".to_string(),
                    "property_name".to_string(),
                    "value".to_string(),
                ],
                output_arg_names: vec![],
            })
            .with_method(MethodDescriptor {
                name: "GetAll".to_string(),
                input_signatures: vec![sig("s")],
                output_signatures: vec![sig("a{sv}")],
                input_arg_names: vec!["interface_name".to_string()],
                output_arg_names: vec!["properties".to_string()],
            })
            .with_signal(SignalDescriptor {
                name: "PropertiesChanged".to_string(),
                output_signatures: vec![sig("s"), sig("a{sv}"), sig("as")],
                arg_names: vec![
                    "interface_name".to_string(),
                    "changed_properties".to_string(),
                    "invalidated_properties".to_string(),
                ],
            });
        Self {
            descriptor: Arc::new(descriptor),
            node,
            emitter: OnceCell::new(),
        }
    }

    fn node(&self) -> Result<Arc<ObjectNode>> {
        self.node
            .upgrade()
            .ok_or_else(|| Error::Protocol("object node no longer exists".into()))
    }

    async fn notify_changed(&self, interface_name: &str, name: &str, new_value: DynamicValue) {
        if let Some(emitter) = self.emitter.get() {
            let body = vec![(name.to_string(), new_value)];
            if let Err(e) = emitter
                .properties_changed(interface_name, body, Vec::new())
                .await
            {
                debug!(error = %e, interface_name, name, "failed to emit PropertiesChanged");
            }
        }
    }
}

fn expect_str(value: &DynamicValue) -> Result<String> {
    match value {
        DynamicValue::Str(s) => Ok(s.clone()),
        other => Err(Error::Protocol(format!(
            "expected a string argument, got {other:?}"
        ))),
    }
}

#[async_trait]
impl Interface for PropertiesInterface {
    fn descriptor(&self) -> Arc<InterfaceDescriptor> {
        self.descriptor.clone()
    }

    async fn call(&self, method: &str, mut args: Vec<DynamicValue>) -> Result<Vec<DynamicValue>> {
        let node = self.node()?;
        match method {
            "Get" => {
                if args.len() != 2 {
                    return Err(Error::Protocol("Get expects 2 arguments".into()));
                }
                let property_name = expect_str(&args.pop().unwrap())?;
                let interface_name = expect_str(&args.pop().unwrap())?;
                let iface = node
                    .resolve_interface(&interface_name)
                    .await
                    .ok_or_else(|| Error::UnknownInterface(interface_name.clone()))?;
                let value = iface.get(&property_name).await?;
                let tree = property_signature(&iface, &property_name)?;
                Ok(vec![DynamicValue::variant(value, &tree)])
            }
            "Set" => {
                if args.len() != 3 {
                    return Err(Error::Protocol("Set expects 3 arguments".into()));
                }
                let variant_value = args.pop().unwrap();
                let property_name = expect_str(&args.pop().unwrap())?;
                let interface_name = expect_str(&args.pop().unwrap())?;
                let inner = match variant_value {
                    DynamicValue::Variant(inner, _) => *inner,
                    other => other,
                };
                let iface = node
                    .resolve_interface(&interface_name)
                    .await
                    .ok_or_else(|| Error::UnknownInterface(interface_name.clone()))?;
                // §9 Open Question 2: the *post-setter* value is what PropertiesChanged carries.
                let post = iface.set(&property_name, inner).await?;
                let desc = iface.descriptor();
                if let Some(prop) = desc.properties.get(&property_name) {
                    if prop.access.is_readable() {
                        let tagged = DynamicValue::variant(post, &prop.signature);
                        self.notify_changed(&interface_name, &property_name, tagged)
                            .await;
                    }
                }
                Ok(vec![])
            }
            "GetAll" => {
                if args.len() != 1 {
                    return Err(Error::Protocol("GetAll expects 1 argument".into()));
                }
                let interface_name = expect_str(&args.pop().unwrap())?;
                let iface = node
                    .resolve_interface(&interface_name)
                    .await
                    .ok_or_else(|| Error::UnknownInterface(interface_name.clone()))?;
                let map = iface.get_all().await?;
                let desc = iface.descriptor();
                let mut dict = Vec::with_capacity(map.len());
                for (name, value) in map {
                    let tree = desc
                        .properties
                        .get(&name)
                        .map(|p| p.signature.clone())
                        .ok_or_else(|| {
                            Error::Protocol(format!("property {name} not declared on {interface_name}"))
                        })?;
                    dict.push((DynamicValue::Str(name), DynamicValue::variant(value, &tree)));
                }
                Ok(vec![DynamicValue::Dict(dict)])
            }
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }

    async fn exposed_on_bus(&self, emitter: SignalEmitter) {
        let _ = self.emitter.set(emitter);
    }
}

fn property_signature(iface: &Arc<dyn Interface>, name: &str) -> Result<SignatureTree> {
    iface
        .descriptor()
        .properties
        .get(name)
        .map(|p| p.signature.clone())
        .ok_or_else(|| Error::Protocol(format!("property {name} not declared")))
}

/// `org.freedesktop.DBus.ObjectManager` (opt-in, §4.4).
pub struct ObjectManagerInterface {
    descriptor: Arc<InterfaceDescriptor>,
    node: Weak<ObjectNode>,
    policy: ObjectManagerPolicy,
    emitter: OnceCell<SignalEmitter>,
}

impl ObjectManagerInterface {
    pub fn new(node: Weak<ObjectNode>, policy: ObjectManagerPolicy) -> Self {
        let descriptor = InterfaceDescriptor::new("org.freedesktop.DBus.ObjectManager")
            .with_method(MethodDescriptor {
                name: "GetManagedObjects".to_string(),
                input_signatures: vec![],
                output_signatures: vec![sig("a{oa{sa{sv}}}")],
                input_arg_names: vec![],
                output_arg_names: vec!["objects".to_string()],
            })
            .with_signal(SignalDescriptor {
                name: "InterfacesAdded".to_string(),
                output_signatures: vec![sig("o"), sig("a{sa{sv}}")],
                arg_names: vec!["object_path".to_string(), "interfaces_and_properties".to_string()],
            })
            .with_signal(SignalDescriptor {
                name: "InterfacesRemoved".to_string(),
                output_signatures: vec![sig("o"), sig("as")],
                arg_names: vec!["object_path".to_string(), "interfaces".to_string()],
            });
        Self {
            descriptor: Arc::new(descriptor),
            node,
            policy,
            emitter: OnceCell::new(),
        }
    }

    pub(crate) fn policy(&self) -> ObjectManagerPolicy {
        self.policy
    }

    pub(crate) async fn interfaces_added(
        &self,
        manager_path: &OwnedObjectPath,
        object_path: OwnedObjectPath,
        interfaces: Vec<(String, PropertyMap)>,
    ) -> Result<()> {
        let Some(emitter) = self.emitter.get() else {
            return Ok(());
        };
        debug!(manager = %manager_path, object = %object_path, "emitting InterfacesAdded");
        let dict = DynamicValue::Dict(
            interfaces
                .into_iter()
                .map(|(name, props)| {
                    (
                        DynamicValue::Str(name),
                        DynamicValue::Dict(
                            props
                                .into_iter()
                                .map(|(k, v)| (DynamicValue::Str(k), v))
                                .collect(),
                        ),
                    )
                })
                .collect(),
        );
        emitter
            .emit(
                "InterfacesAdded",
                vec![DynamicValue::ObjectPath(object_path.as_str().to_string()), dict],
            )
            .await
    }

    pub(crate) async fn interfaces_removed(
        &self,
        manager_path: &OwnedObjectPath,
        object_path: OwnedObjectPath,
        names: Vec<String>,
    ) -> Result<()> {
        let Some(emitter) = self.emitter.get() else {
            return Ok(());
        };
        debug!(manager = %manager_path, object = %object_path, "emitting InterfacesRemoved");
        emitter
            .emit(
                "InterfacesRemoved",
                vec![
                    DynamicValue::ObjectPath(object_path.as_str().to_string()),
                    DynamicValue::Array(names.into_iter().map(DynamicValue::Str).collect()),
                ],
            )
            .await
    }
}

#[async_trait]
impl Interface for ObjectManagerInterface {
    fn descriptor(&self) -> Arc<InterfaceDescriptor> {
        self.descriptor.clone()
    }

    async fn call(&self, method: &str, _args: Vec<DynamicValue>) -> Result<Vec<DynamicValue>> {
        match method {
            "GetManagedObjects" => {
                let node = self
                    .node
                    .upgrade()
                    .ok_or_else(|| Error::Protocol("object node no longer exists".into()))?;
                let objects = node.managed_objects_subtree().await?;
                let dict = DynamicValue::Dict(
                    objects
                        .into_iter()
                        .map(|(path, ifaces)| {
                            (
                                DynamicValue::ObjectPath(path),
                                DynamicValue::Dict(
                                    ifaces
                                        .into_iter()
                                        .map(|(name, props)| {
                                            (
                                                DynamicValue::Str(name),
                                                DynamicValue::Dict(
                                                    props
                                                        .into_iter()
                                                        .map(|(k, v)| (DynamicValue::Str(k), v))
                                                        .collect(),
                                                ),
                                            )
                                        })
                                        .collect(),
                                ),
                            )
                        })
                        .collect(),
                );
                Ok(vec![dict])
            }
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }

    async fn exposed_on_bus(&self, emitter: SignalEmitter) {
        let _ = self.emitter.set(emitter);
    }
}
