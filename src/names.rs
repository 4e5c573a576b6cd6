//! Thin re-exports over `zbus_names` and `zvariant`'s string-like types.
//!
//! The core never re-implements D-Bus name validation (bus names, interface names, member
//! names, well-known names); it borrows `zbus_names`'s validated newtypes wholesale so that a
//! `Router` can never hold an un-validated name internally.

pub use zbus_names::{
    BusName, ErrorName, InterfaceName, MemberName, OwnedBusName, OwnedErrorName,
    OwnedInterfaceName, OwnedMemberName, OwnedUniqueName, OwnedWellKnownName, UniqueName,
    WellKnownName,
};
pub use zvariant::ObjectPath;

/// An owned, `'static` object path, used wherever a path must outlive the message that carried
/// it (e.g. as an `ObjectNode` key or a `ProxyObject` key).
pub type OwnedObjectPath = zvariant::OwnedObjectPath;
