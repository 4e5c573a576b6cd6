//! Interface descriptors and the `Interface` trait (§2, §3).
//!
//! An [`InterfaceDescriptor`] is the static shape of an interface class: its methods' input/output
//! signatures, its properties' access mode and signature, and its signals' output signatures. An
//! [`Interface`] is the live object a user attaches to an [`crate::object_server::ObjectNode`]; it
//! answers method calls and property reads/writes against that static shape.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::signal::SignalEmitter;
use crate::signature::SignatureTree;
use crate::value::{DynamicValue, PropertyMap};

/// Read/write mode of a property, mirroring D-Bus introspection's `access` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn is_readable(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }

    /// The introspection XML `access` attribute value.
    pub fn as_xml_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        }
    }
}

/// The static description of one method: argument and return signatures, split per §4.2's
/// "multi-output signatures produce one body element per output" rule.
#[derive(Debug, Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub input_signatures: Vec<SignatureTree>,
    pub output_signatures: Vec<SignatureTree>,
    pub input_arg_names: Vec<String>,
    pub output_arg_names: Vec<String>,
}

/// The static description of one property: its access mode and its signature.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub access: Access,
    pub signature: SignatureTree,
}

/// The static description of one signal: its output signatures (D-Bus signals never reply, so
/// there is no input side).
#[derive(Debug, Clone)]
pub struct SignalDescriptor {
    pub name: String,
    pub output_signatures: Vec<SignatureTree>,
    pub arg_names: Vec<String>,
}

/// A static description of an interface class (§3's `InterfaceDescriptor` entity): name, plus
/// methods/properties/signals keyed by member name.
#[derive(Debug, Clone, Default)]
pub struct InterfaceDescriptor {
    pub name: String,
    pub methods: BTreeMap<String, MethodDescriptor>,
    pub properties: BTreeMap<String, PropertyDescriptor>,
    pub signals: BTreeMap<String, SignalDescriptor>,
}

impl InterfaceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
            properties: BTreeMap::new(),
            signals: BTreeMap::new(),
        }
    }

    pub fn with_method(mut self, method: MethodDescriptor) -> Self {
        self.methods.insert(method.name.clone(), method);
        self
    }

    pub fn with_property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.insert(property.name.clone(), property);
        self
    }

    pub fn with_signal(mut self, signal: SignalDescriptor) -> Self {
        self.signals.insert(signal.name.clone(), signal);
        self
    }
}

/// The capability set every live interface instance carries (§2): invoke a method, read a
/// property, write a property, and (indirectly, through [`SignalEmitter`]) emit a signal.
///
/// Implementors are the user-supplied objects attached to an `ObjectNode` via `add_interface`.
/// The default `set_property`/`get_property` bodies return [`Error::PropertyReadOnly`] /
/// [`Error::PropertyWriteOnly`] so that implementors only need to override the accessors their
/// descriptor actually declares as readable/writable.
#[async_trait]
pub trait Interface: Send + Sync {
    /// The static shape of this interface. Called once, at `add_interface` time; the descriptor
    /// is expected to be cheap to construct (most implementors build it once via `OnceCell` or
    /// return a `'static` reference wrapped in `Arc`).
    fn descriptor(&self) -> Arc<InterfaceDescriptor>;

    /// Invoke `method` with already-bridged high-level arguments; returns the high-level return
    /// values in declaration order (§4.2: one element per output).
    async fn call(&self, method: &str, args: Vec<DynamicValue>) -> Result<Vec<DynamicValue>>;

    /// Read property `name`. The default implementation rejects every property; interfaces with
    /// readable properties override this.
    async fn get(&self, name: &str) -> Result<DynamicValue> {
        Err(Error::PropertyWriteOnly(name.to_string()))
    }

    /// Write property `name`. The default implementation rejects every property; interfaces with
    /// writable properties override this. Per §9 Open Question 2, the returned value is the
    /// *post-setter* value that `PropertiesChanged` will carry.
    async fn set(&self, name: &str, _value: DynamicValue) -> Result<DynamicValue> {
        Err(Error::PropertyReadOnly(name.to_string()))
    }

    /// All currently-readable properties, name to high-level value, in descriptor order — used by
    /// `GetAll` and by `ObjectManager::GetManagedObjects` (§4.4).
    async fn get_all(&self) -> Result<PropertyMap> {
        let mut out = Vec::new();
        for prop in self.descriptor().properties.values() {
            if prop.access.is_readable() {
                out.push((prop.name.clone(), self.get(&prop.name).await?));
            }
        }
        Ok(out)
    }

    /// Called once, when this interface's node becomes (or already is) live on a bus (§4.6's
    /// "local `ExposedOnBus` event"). `emitter` is this interface's handle for originating its own
    /// signals; implementors that declare signals or container properties typically stash it
    /// (e.g. in a `once_cell::sync::OnceCell`) to use later from outside the dispatch path.
    async fn exposed_on_bus(&self, _emitter: SignalEmitter) {}
}
