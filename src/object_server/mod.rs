//! The server-side object tree and the standard interfaces every node carries (§4.3, §4.4).

mod fdo_std;
mod introspect;
mod node;
mod service;

pub use fdo_std::{IntrospectableInterface, ObjectManagerInterface, PeerInterface, PropertiesInterface};
pub use node::{ObjectManagerPolicy, ObjectNode};
pub use service::{DispatchOutcome, Service};
