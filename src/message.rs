//! Message type and builder.
//!
//! On-wire byte layout (endianness, alignment, the primary header) is explicitly out of scope
//! (§1 Non-goals) and left to the codec; `Message` here only carries the already-decoded fields
//! the rest of the crate operates on (§3's `Message` entity), plus a marshal-form body.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use enumflags2::{bitflags, BitFlags};
use zvariant::Value;

use crate::error::{Error, Result};
use crate::names::{
    BusName, ErrorName, InterfaceName, MemberName, ObjectPath, OwnedBusName, OwnedErrorName,
    OwnedInterfaceName, OwnedMemberName, OwnedObjectPath, OwnedUniqueName,
};

/// The four message kinds defined by the D-Bus wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

/// Pre-defined flags that can be set on an outgoing message.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageFlags {
    /// The caller does not want a reply, even for a method call.
    NoReplyExpected = 0x1,
    /// The bus must not auto-start an owner for the destination name.
    NoAutoStart = 0x2,
    /// The caller is prepared to wait for interactive authorization.
    AllowInteractiveAuth = 0x4,
}

/// A decoded D-Bus message (§3).
#[derive(Debug, Clone)]
pub struct Message {
    message_type: MessageType,
    flags: BitFlags<MessageFlags>,
    serial: u32,
    reply_serial: Option<u32>,
    path: Option<OwnedObjectPath>,
    interface: Option<OwnedInterfaceName>,
    member: Option<OwnedMemberName>,
    destination: Option<OwnedBusName>,
    sender: Option<OwnedUniqueName>,
    signature: String,
    error_name: Option<OwnedErrorName>,
    body: Vec<Value<'static>>,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn flags(&self) -> BitFlags<MessageFlags> {
        self.flags
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn path(&self) -> Option<&OwnedObjectPath> {
        self.path.as_ref()
    }

    pub fn interface(&self) -> Option<&OwnedInterfaceName> {
        self.interface.as_ref()
    }

    pub fn member(&self) -> Option<&OwnedMemberName> {
        self.member.as_ref()
    }

    pub fn destination(&self) -> Option<&OwnedBusName> {
        self.destination.as_ref()
    }

    pub fn sender(&self) -> Option<&OwnedUniqueName> {
        self.sender.as_ref()
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn error_name(&self) -> Option<&OwnedErrorName> {
        self.error_name.as_ref()
    }

    pub fn body(&self) -> &[Value<'static>] {
        &self.body
    }

    pub fn set_sender(&mut self, sender: OwnedUniqueName) {
        self.sender = Some(sender);
    }

    pub fn set_serial(&mut self, serial: u32) {
        self.serial = serial;
    }

    /// The key used to correlate a signal with its subscribers (§4.1 step 3): `(path, iface,
    /// member)`.
    pub fn signal_key(&self) -> Option<(OwnedObjectPath, OwnedInterfaceName, OwnedMemberName)> {
        Some((
            self.path.clone()?,
            self.interface.clone()?,
            self.member.clone()?,
        ))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} #{} path={:?} iface={:?} member={:?}",
            self.message_type,
            self.serial,
            self.path.as_ref().map(|p| p.as_str()),
            self.interface.as_ref().map(|i| i.as_str()),
            self.member.as_ref().map(|m| m.as_str()),
        )
    }
}

/// Assigns serials to outgoing messages. Owned exclusively by the `Router` (§3 Invariant 2).
#[derive(Debug, Default)]
pub struct SerialGenerator(AtomicU32);

impl SerialGenerator {
    pub fn new() -> Self {
        // Serial 0 is reserved/invalid on the wire; start at 1.
        Self(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Builds a `Message` field by field, mirroring the teacher's `MessageBuilder` chaining
/// convention (`MessageBuilder::method_call(path, member)?.destination(...)?.build(body)`).
#[derive(Debug)]
pub struct MessageBuilder {
    message_type: MessageType,
    flags: BitFlags<MessageFlags>,
    reply_serial: Option<u32>,
    path: Option<OwnedObjectPath>,
    interface: Option<OwnedInterfaceName>,
    member: Option<OwnedMemberName>,
    destination: Option<OwnedBusName>,
    error_name: Option<OwnedErrorName>,
}

impl MessageBuilder {
    fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            flags: BitFlags::empty(),
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            destination: None,
            error_name: None,
        }
    }

    pub fn method_call<P, M>(path: P, member: M) -> Result<Self>
    where
        P: TryInto<ObjectPath<'static>>,
        M: TryInto<MemberName<'static>>,
    {
        let path = path
            .try_into()
            .map_err(|_| Error::InvalidName("invalid object path".into()))?;
        let member = member
            .try_into()
            .map_err(|_| Error::InvalidName("invalid member name".into()))?;
        Ok(Self::new(MessageType::MethodCall)
            .path(path)?
            .member(member)?)
    }

    pub fn signal<P, I, M>(path: P, interface: I, member: M) -> Result<Self>
    where
        P: TryInto<ObjectPath<'static>>,
        I: TryInto<InterfaceName<'static>>,
        M: TryInto<MemberName<'static>>,
    {
        let path = path
            .try_into()
            .map_err(|_| Error::InvalidName("invalid object path".into()))?;
        let interface = interface
            .try_into()
            .map_err(|_| Error::InvalidName("invalid interface name".into()))?;
        let member = member
            .try_into()
            .map_err(|_| Error::InvalidName("invalid member name".into()))?;
        Ok(Self::new(MessageType::Signal)
            .path(path)?
            .interface(interface)?
            .member(member)?)
    }

    pub fn method_return(reply_to: &Message) -> Result<Self> {
        let mut builder = Self::new(MessageType::MethodReturn);
        builder.reply_serial = Some(reply_to.serial());
        if let Some(sender) = reply_to.sender() {
            builder.destination = Some(sender.clone().into());
        }
        Ok(builder)
    }

    pub fn error<E>(reply_to: &Message, error_name: E) -> Result<Self>
    where
        E: TryInto<ErrorName<'static>>,
    {
        let mut builder = Self::new(MessageType::Error);
        builder.reply_serial = Some(reply_to.serial());
        builder.error_name = Some(
            error_name
                .try_into()
                .map_err(|_| Error::InvalidName("invalid error name".into()))?
                .into(),
        );
        if let Some(sender) = reply_to.sender() {
            builder.destination = Some(sender.clone().into());
        }
        Ok(builder)
    }

    pub fn path<P>(mut self, path: P) -> Result<Self>
    where
        P: TryInto<ObjectPath<'static>>,
    {
        self.path = Some(
            path.try_into()
                .map_err(|_| Error::InvalidName("invalid object path".into()))?
                .into(),
        );
        Ok(self)
    }

    pub fn interface<I>(mut self, interface: I) -> Result<Self>
    where
        I: TryInto<InterfaceName<'static>>,
    {
        self.interface = Some(
            interface
                .try_into()
                .map_err(|_| Error::InvalidName("invalid interface name".into()))?
                .into(),
        );
        Ok(self)
    }

    pub fn member<M>(mut self, member: M) -> Result<Self>
    where
        M: TryInto<MemberName<'static>>,
    {
        self.member = Some(
            member
                .try_into()
                .map_err(|_| Error::InvalidName("invalid member name".into()))?
                .into(),
        );
        Ok(self)
    }

    pub fn destination<D>(mut self, destination: D) -> Result<Self>
    where
        D: TryInto<BusName<'static>>,
    {
        self.destination = Some(
            destination
                .try_into()
                .map_err(|_| Error::InvalidName("invalid destination".into()))?
                .into(),
        );
        Ok(self)
    }

    pub fn with_flags(mut self, flags: impl Into<BitFlags<MessageFlags>>) -> Result<Self> {
        self.flags = flags.into();
        Ok(self)
    }

    /// Finish building, attaching the marshal-form body. The signature string is derived from
    /// the caller-supplied tree elsewhere (`Router`); here we just record the concatenated
    /// signature the caller computed, since `Message` itself doesn't own a codec.
    pub fn build(self, signature: String, body: Vec<Value<'static>>) -> Message {
        Message {
            message_type: self.message_type,
            flags: self.flags,
            serial: 0,
            reply_serial: self.reply_serial,
            path: self.path,
            interface: self.interface,
            member: self.member,
            destination: self.destination,
            sender: None,
            signature,
            error_name: self.error_name,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_generator_is_monotonic() {
        let gen = SerialGenerator::new();
        let a = gen.next();
        let b = gen.next();
        assert!(b > a);
    }

    #[test]
    fn method_call_builder_sets_path_and_member() {
        let msg = MessageBuilder::method_call("/com/example/Foo", "Bar")
            .unwrap()
            .build("".into(), vec![]);
        assert_eq!(msg.path().unwrap().as_str(), "/com/example/Foo");
        assert_eq!(msg.member().unwrap().as_str(), "Bar");
        assert_eq!(msg.message_type(), MessageType::MethodCall);
    }

    #[test]
    fn method_return_carries_reply_serial() {
        let call = MessageBuilder::method_call("/com/example/Foo", "Bar")
            .unwrap()
            .build("".into(), vec![]);
        let mut call = call;
        call.set_serial(42);
        let reply = MessageBuilder::method_return(&call)
            .unwrap()
            .build("".into(), vec![]);
        assert_eq!(reply.reply_serial(), Some(42));
        assert_eq!(reply.message_type(), MessageType::MethodReturn);
    }
}
