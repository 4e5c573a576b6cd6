//! The high-level value model and the bridge to/from `zvariant`'s marshal form.
//!
//! Two value models exist side by side in this crate, per §2/§4.8:
//!
//! - **marshal form** — `zvariant::Value<'static>`, the nested positional encoding the codec
//!   consumes and produces.
//! - **high-level form** — [`DynamicValue`], native containers with variants carrying an
//!   explicit type tag, the shape user method handlers and proxy callers actually see.
//!
//! [`ValueBridge`] is the pair of total functions translating between them, parameterized by a
//! [`SignatureTree`] (§4.8).

use std::collections::BTreeMap;

use zvariant::{ObjectPath, OwnedValue, Signature, Str, Structure, StructureBuilder, Value};

use crate::error::{Error, Result};
use crate::signature::{SignatureTree, TypeNode};

/// The high-level form of a D-Bus value (§3's `Value (high-level)` entity).
///
/// Dict keys are restricted to basic types on the wire, so [`DynamicValue::Dict`] uses an
/// ordered `Vec` of pairs rather than a `HashMap`, preserving delivery order the way §4.3's
/// `ObjectManager` traversal and §8.2.3's `Contacts` property both rely on "insertion order".
#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
    Byte(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    ObjectPath(String),
    Signature(String),
    Unix(u32),
    Array(Vec<DynamicValue>),
    Dict(Vec<(DynamicValue, DynamicValue)>),
    Struct(Vec<DynamicValue>),
    /// A variant: the carried value plus the signature it was tagged with.
    Variant(Box<DynamicValue>, String),
}

impl DynamicValue {
    /// Convenience constructor for a tagged variant, computing the signature from the payload's
    /// own natural type node (used when emitting signals/property values whose static type is
    /// known at the call site, e.g. `PropertiesChanged`'s per-property variant wrapping).
    pub fn variant(value: DynamicValue, tree: &SignatureTree) -> DynamicValue {
        DynamicValue::Variant(Box::new(value), tree.as_str().to_string())
    }
}

/// Bridges [`DynamicValue`] and `zvariant::Value`, both driven by a [`SignatureTree`] (§4.8).
pub struct ValueBridge;

impl ValueBridge {
    /// `marshal_to_high` — basic scalars pass through; arrays become ordered sequences; dicts
    /// become mappings; structs become fixed tuples; variants become tagged pairs after
    /// recursing into the carried type.
    pub fn marshal_to_high(value: &Value<'_>, tree: &SignatureTree) -> Result<DynamicValue> {
        marshal_to_high_node(value, tree.root())
    }

    /// `high_to_marshal` — the inverse. Two wrinkles from §4.8 are implemented here:
    ///
    /// (a) when the expected type is a container and the caller already supplied a container of
    /// the right shape, it is not re-wrapped (handled naturally below, since a `DynamicValue`
    /// container always maps onto exactly one marshal-form container — there is no double
    /// wrapping to begin with in this direction, unlike `Set`'s special case, see (b));
    ///
    /// (b) a single property `Set` wraps the marshalled payload in one extra level of array
    /// nesting iff the payload is itself a container — that wrinkle lives in
    /// [`Self::high_to_marshal_for_set`], not here, since it is specific to the `Properties.Set`
    /// call shape and not a general property of the bridge.
    pub fn high_to_marshal(value: &DynamicValue, tree: &SignatureTree) -> Result<Value<'static>> {
        high_to_marshal_node(value, tree.root())
    }

    /// The `Properties.Set` wrinkle (§4.8b): wrap the marshalled payload in one extra level of
    /// array nesting iff the payload is itself a container, so the transport gets `[value]` for
    /// containers and `value` for scalars.
    pub fn high_to_marshal_for_set(
        value: &DynamicValue,
        tree: &SignatureTree,
    ) -> Result<Value<'static>> {
        let marshalled = Self::high_to_marshal(value, tree)?;
        if tree.root().is_container() {
            Ok(Value::new(vec![marshalled]))
        } else {
            Ok(marshalled)
        }
    }
}

fn marshal_to_high_node(value: &Value<'_>, node: &TypeNode) -> Result<DynamicValue> {
    match (node, value) {
        (TypeNode::Basic('y'), Value::U8(v)) => Ok(DynamicValue::Byte(*v)),
        (TypeNode::Basic('b'), Value::Bool(v)) => Ok(DynamicValue::Bool(*v)),
        (TypeNode::Basic('n'), Value::I16(v)) => Ok(DynamicValue::I16(*v)),
        (TypeNode::Basic('q'), Value::U16(v)) => Ok(DynamicValue::U16(*v)),
        (TypeNode::Basic('i'), Value::I32(v)) => Ok(DynamicValue::I32(*v)),
        (TypeNode::Basic('u'), Value::U32(v)) => Ok(DynamicValue::U32(*v)),
        (TypeNode::Basic('x'), Value::I64(v)) => Ok(DynamicValue::I64(*v)),
        (TypeNode::Basic('t'), Value::U64(v)) => Ok(DynamicValue::U64(*v)),
        (TypeNode::Basic('d'), Value::F64(v)) => Ok(DynamicValue::F64(*v)),
        (TypeNode::Basic('h'), Value::U32(v)) => Ok(DynamicValue::Unix(*v)),
        (TypeNode::Basic('s'), Value::Str(v)) => Ok(DynamicValue::Str(v.to_string())),
        (TypeNode::Basic('o'), Value::ObjectPath(v)) => {
            Ok(DynamicValue::ObjectPath(v.as_str().to_string()))
        }
        (TypeNode::Basic('g'), Value::Signature(v)) => {
            Ok(DynamicValue::Signature(v.as_str().to_string()))
        }
        (TypeNode::Variant, Value::Value(inner)) => {
            let inner_tree = SignatureTree::parse(&inner.value_signature())?;
            let high = marshal_to_high_node(inner, inner_tree.root())?;
            Ok(DynamicValue::Variant(
                Box::new(high),
                inner_tree.as_str().to_string(),
            ))
        }
        (TypeNode::Array(element), Value::Array(arr)) => {
            let mut out = Vec::with_capacity(arr.len());
            for item in arr.iter() {
                out.push(marshal_to_high_node(item, element)?);
            }
            Ok(DynamicValue::Array(out))
        }
        (TypeNode::Dict(key_node, value_node), Value::Dict(dict)) => {
            let mut out = Vec::new();
            for (k, v) in dict.iter() {
                let high_k = marshal_to_high_node(k, key_node)?;
                let high_v = marshal_to_high_node(v, value_node)?;
                out.push((high_k, high_v));
            }
            Ok(DynamicValue::Dict(out))
        }
        (TypeNode::Struct(fields), Value::Structure(st)) => {
            let elements = st.fields();
            if elements.len() != fields.len() {
                return Err(Error::Protocol(format!(
                    "struct arity mismatch: signature has {}, value has {}",
                    fields.len(),
                    elements.len()
                )));
            }
            let mut out = Vec::with_capacity(fields.len());
            for (field_node, field_value) in fields.iter().zip(elements.iter()) {
                out.push(marshal_to_high_node(field_value, field_node)?);
            }
            Ok(DynamicValue::Struct(out))
        }
        (expected, actual) => Err(Error::Protocol(format!(
            "marshal_to_high: signature node {expected:?} does not match value kind {:?}",
            actual.value_signature()
        ))),
    }
}

fn high_to_marshal_node(value: &DynamicValue, node: &TypeNode) -> Result<Value<'static>> {
    match (node, value) {
        (TypeNode::Basic('y'), DynamicValue::Byte(v)) => Ok(Value::U8(*v)),
        (TypeNode::Basic('b'), DynamicValue::Bool(v)) => Ok(Value::Bool(*v)),
        (TypeNode::Basic('n'), DynamicValue::I16(v)) => Ok(Value::I16(*v)),
        (TypeNode::Basic('q'), DynamicValue::U16(v)) => Ok(Value::U16(*v)),
        (TypeNode::Basic('i'), DynamicValue::I32(v)) => Ok(Value::I32(*v)),
        (TypeNode::Basic('u'), DynamicValue::U32(v)) => Ok(Value::U32(*v)),
        (TypeNode::Basic('x'), DynamicValue::I64(v)) => Ok(Value::I64(*v)),
        (TypeNode::Basic('t'), DynamicValue::U64(v)) => Ok(Value::U64(*v)),
        (TypeNode::Basic('d'), DynamicValue::F64(v)) => Ok(Value::F64(*v)),
        (TypeNode::Basic('h'), DynamicValue::Unix(v)) => Ok(Value::U32(*v)),
        (TypeNode::Basic('s'), DynamicValue::Str(v)) => Ok(Value::Str(Str::from(v.clone()).into())),
        (TypeNode::Basic('o'), DynamicValue::ObjectPath(v)) => {
            let path = ObjectPath::try_from(v.clone())?;
            Ok(Value::ObjectPath(path.into()))
        }
        (TypeNode::Basic('g'), DynamicValue::Signature(v)) => {
            let sig = Signature::try_from(v.clone())?;
            Ok(Value::Signature(sig.into()))
        }
        (TypeNode::Variant, DynamicValue::Variant(inner, sig)) => {
            let inner_tree = SignatureTree::parse(sig)?;
            let inner_value = high_to_marshal_node(inner, inner_tree.root())?;
            Ok(Value::Value(Box::new(inner_value.try_to_owned()?.into())))
        }
        (TypeNode::Array(element), DynamicValue::Array(items)) => {
            let mut builder = zvariant::Array::new(signature_of(element));
            for item in items {
                builder.append(high_to_marshal_node(item, element)?)?;
            }
            Ok(Value::Array(builder))
        }
        (TypeNode::Dict(key_node, value_node), DynamicValue::Dict(pairs)) => {
            let mut dict =
                zvariant::Dict::new(signature_of(key_node), signature_of(value_node));
            for (k, v) in pairs {
                let key = high_to_marshal_node(k, key_node)?;
                let val = high_to_marshal_node(v, value_node)?;
                dict.append(key, val)?;
            }
            Ok(Value::Dict(dict))
        }
        (TypeNode::Struct(fields), DynamicValue::Struct(elements)) => {
            if fields.len() != elements.len() {
                return Err(Error::Protocol(format!(
                    "struct arity mismatch: signature has {}, value has {}",
                    fields.len(),
                    elements.len()
                )));
            }
            let mut builder = StructureBuilder::new();
            for (field_node, field_value) in fields.iter().zip(elements.iter()) {
                builder = builder.add_field(high_to_marshal_node(field_value, field_node)?);
            }
            Ok(Value::Structure(Structure::from(builder)))
        }
        (expected, actual) => Err(Error::Protocol(format!(
            "high_to_marshal: signature node {expected:?} does not match value {actual:?}"
        ))),
    }
}

fn signature_of(node: &TypeNode) -> Signature<'static> {
    let s = node_signature_string(node);
    Signature::try_from(s).expect("type node always produces a well-formed signature fragment")
}

fn node_signature_string(node: &TypeNode) -> String {
    match node {
        TypeNode::Basic(c) => c.to_string(),
        TypeNode::Variant => "v".to_string(),
        TypeNode::Array(element) => format!("a{}", node_signature_string(element)),
        TypeNode::Dict(k, v) => format!("a{{{}{}}}", node_signature_string(k), node_signature_string(v)),
        TypeNode::Struct(fields) => {
            let inner: String = fields.iter().map(node_signature_string).collect();
            format!("({inner})")
        }
    }
}

/// Owns a value for storage beyond the lifetime of the message it arrived in (e.g. cached
/// proxy properties, §3's `ProxyInterface.cached property values`).
pub fn to_owned_value(value: &Value<'_>) -> OwnedValue {
    value
        .try_to_owned()
        .expect("marshal-form values produced by this crate are always ownable")
}

/// A `name -> variant` map in deterministic insertion order, the shape `GetAll`/`PropertiesChanged`
/// both use (§4.4); kept distinct from `BTreeMap` (which would silently reorder by name) on
/// purpose.
pub type PropertyMap = Vec<(String, DynamicValue)>;

/// Build an empty [`PropertyMap`]; exists purely so call sites read `PropertyMap::empty()`
/// rather than `Vec::new()` at the handful of places that construct one from scratch.
pub fn empty_property_map() -> PropertyMap {
    Vec::new()
}

/// Helper used by `GetManagedObjects` (§4.4) to assemble the nested
/// `dict<path, dict<iface, dict<name, variant>>>` shape without losing insertion order at any
/// level; kept as a `BTreeMap` at the outer (path) level only, since object paths have no
/// meaningful "delivery order" the way property maps do.
pub type ManagedObjects = BTreeMap<String, Vec<(String, PropertyMap)>>;
