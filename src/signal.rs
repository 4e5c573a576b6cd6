//! `SignalEmitter` — an interface's handle for originating its own wire signals (§4.6).
//!
//! Built once per `(node, interface)` pair at post-expose time and handed to the interface via
//! [`crate::interface::Interface::exposed_on_bus`]. Carries the interface's own descriptor so
//! `emit` can look up a declared signal's output signature without the caller repeating it.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::interface::InterfaceDescriptor;
use crate::names::{InterfaceName, MemberName, ObjectPath, OwnedInterfaceName, OwnedObjectPath};
use crate::router::Router;
use crate::signature::SignatureTree;
use crate::value::{DynamicValue, PropertyMap, ValueBridge};

/// Handle an exposed interface uses to emit its own declared signals, and (for `Properties`
/// itself, or any interface backing a [`crate::property::PropertyCell`]) `PropertiesChanged`.
#[derive(Clone)]
pub struct SignalEmitter {
    router: Arc<Router>,
    path: OwnedObjectPath,
    interface_name: OwnedInterfaceName,
    descriptor: Arc<InterfaceDescriptor>,
}

impl SignalEmitter {
    pub(crate) fn new(
        router: Arc<Router>,
        path: OwnedObjectPath,
        interface_name: OwnedInterfaceName,
        descriptor: Arc<InterfaceDescriptor>,
    ) -> Self {
        Self {
            router,
            path,
            interface_name,
            descriptor,
        }
    }

    /// The object path this emitter originates signals from.
    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    /// The interface name this emitter originates signals as.
    pub fn interface_name(&self) -> &OwnedInterfaceName {
        &self.interface_name
    }

    /// Emit a signal declared in this interface's own descriptor (§4.6 "install signal emitters
    /// that translate user-land events into wire signals").
    pub async fn emit(&self, signal: &str, args: Vec<DynamicValue>) -> Result<()> {
        let desc = self.descriptor.signals.get(signal).ok_or_else(|| {
            Error::Protocol(format!(
                "{} has no signal named {signal}",
                self.interface_name
            ))
        })?;
        if args.len() != desc.output_signatures.len() {
            return Err(Error::Protocol(format!(
                "signal {signal} expects {} arguments, got {}",
                desc.output_signatures.len(),
                args.len()
            )));
        }
        let body = args
            .iter()
            .zip(&desc.output_signatures)
            .map(|(v, t)| ValueBridge::high_to_marshal(v, t))
            .collect::<Result<Vec<_>>>()?;
        let signature = SignatureTree::concat(&desc.output_signatures);
        self.router
            .send_signal(
                ObjectPath::try_from(self.path.as_str())?,
                InterfaceName::try_from(self.interface_name.as_str())?,
                MemberName::try_from(signal)?,
                signature,
                body,
            )
            .await
    }

    /// Emit `org.freedesktop.DBus.Properties.PropertiesChanged` (§4.4, §4.5). Always targets the
    /// `Properties` standard interface on the wire regardless of `self`'s own interface name, but
    /// names `interface_name` — the interface whose properties actually changed — as the signal's
    /// first argument; callers other than `Properties` itself (whose own interface name would
    /// otherwise leak into the payload) must pass the real owning interface explicitly.
    pub async fn properties_changed(
        &self,
        interface_name: &str,
        changed: PropertyMap,
        invalidated: Vec<String>,
    ) -> Result<()> {
        let changed_dict = DynamicValue::Dict(
            changed
                .into_iter()
                .map(|(name, value)| (DynamicValue::Str(name), value))
                .collect(),
        );
        let invalidated_arr =
            DynamicValue::Array(invalidated.into_iter().map(DynamicValue::Str).collect());

        let body_tree = SignatureTree::parse_many("sa{sv}as")?;
        let args = vec![
            DynamicValue::Str(interface_name.to_string()),
            changed_dict,
            invalidated_arr,
        ];
        let body = args
            .iter()
            .zip(&body_tree)
            .map(|(v, t)| ValueBridge::high_to_marshal(v, t))
            .collect::<Result<Vec<_>>>()?;
        let signature = SignatureTree::concat(&body_tree);

        self.router
            .send_signal(
                ObjectPath::try_from(self.path.as_str())?,
                InterfaceName::try_from("org.freedesktop.DBus.Properties")?,
                MemberName::try_from("PropertiesChanged")?,
                signature,
                body,
            )
            .await
    }
}
