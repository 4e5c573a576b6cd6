//! A native D-Bus stack: a multiplexed message router, a server-side object tree with the
//! standard `Peer`/`Introspectable`/`Properties`/`ObjectManager` interfaces, and a client-side
//! proxy builder that introspects a remote name and keeps a typed mirror of its object tree.
//!
//! The three pieces share one [`Router`], which owns the single bus [`Transport`] and is the
//! only thing in this crate allowed to touch it directly:
//!
//! - [`object_server`] — build [`object_server::Service`]s out of [`interface::Interface`]
//!   implementations attached to an [`object_server::ObjectNode`] tree, then
//!   [`Router::register_service`] them.
//! - [`proxy`] — [`proxy::ProxyBuilder`] introspects a remote well-known name and produces a
//!   [`proxy::Proxy`] whose [`proxy::ProxyObject`] tree mirrors it.
//! - [`value`] and [`signature`] bridge the wire's marshal form and this crate's high-level
//!   [`value::DynamicValue`] form in both directions.
//!
//! Authentication, socket discovery, wire byte layout, and the signature grammar itself are
//! assumed collaborators, not reimplemented here — see [`transport::Transport`] and
//! [`signature::SignatureTree`] for the seams they live at.

pub mod connection;
pub mod error;
pub mod fdo;
pub mod interface;
pub mod message;
pub mod names;
pub mod object_server;
pub mod property;
pub mod proxy;
pub mod router;
pub mod signal;
pub mod signature;
pub mod transport;
pub mod value;

pub use connection::{Connection, ConnectionBuilder};
pub use error::{Error, RequestNameOutcome, Result};
pub use interface::{Access, Interface, InterfaceDescriptor, MethodDescriptor, PropertyDescriptor, SignalDescriptor};
pub use message::{Message, MessageBuilder, MessageFlags, MessageType};
pub use object_server::{DispatchOutcome, ObjectManagerPolicy, ObjectNode, Service};
pub use property::PropertyCell;
pub use proxy::{Proxy, ProxyBuilder, ProxyEvent, ProxyInterface, ProxyObject};
pub use router::Router;
pub use signal::SignalEmitter;
pub use signature::{SignatureTree, TypeNode};
pub use transport::Transport;
pub use value::{DynamicValue, PropertyMap, ValueBridge};
