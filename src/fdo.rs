//! Thin wrappers around the bus daemon's own interface, `org.freedesktop.DBus` (§6).
//!
//! The retrieved teacher slice (`zbus/src/proxy.rs`) names this module directly —
//! `fdo::IntrospectableProxy`, `fdo::PropertiesProxy`, `fdo::DBusProxy` — without shipping it;
//! this is that module, built the only way it can be here: as a handful of `Router::invoke`
//! calls with the daemon's well-known hardcoded signatures, since there is no code-generation
//! macro in this crate to derive them from a trait.

use enumflags2::{bitflags, BitFlags};
use zvariant::Value;

use crate::error::{Error, RequestNameOutcome, Result};
use crate::message::MessageBuilder;
use crate::names::OwnedUniqueName;
use crate::router::Router;
use crate::signature::SignatureTree;
use crate::value::{DynamicValue, ValueBridge};
use std::sync::Arc;

const DESTINATION: &str = "org.freedesktop.DBus";
const PATH: &str = "/org/freedesktop/DBus";
const INTERFACE: &str = "org.freedesktop.DBus";

/// Flags accepted by `RequestName` (§6). This crate always ORs in both by default, matching the
/// source's "RequestName flags" convention.
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameFlags {
    AllowReplacement = 0x1,
    ReplaceExisting = 0x2,
    DoNotQueue = 0x4,
}

/// The default flag set this crate requests a name with (§6).
pub fn default_request_name_flags() -> BitFlags<RequestNameFlags> {
    RequestNameFlags::ReplaceExisting | RequestNameFlags::DoNotQueue
}

async fn call(
    router: &Arc<Router>,
    member: &str,
    input_sig: &str,
    args: Vec<DynamicValue>,
    output_sig: &str,
) -> Result<Vec<DynamicValue>> {
    let input_trees = SignatureTree::parse_many(input_sig)?;
    let body = args
        .iter()
        .zip(&input_trees)
        .map(|(v, t)| ValueBridge::high_to_marshal(v, t))
        .collect::<Result<Vec<Value<'static>>>>()?;
    let message = MessageBuilder::method_call(PATH, member)?
        .destination(DESTINATION)?
        .interface(INTERFACE)?
        .build(input_sig.to_string(), body);

    let output_trees = SignatureTree::parse_many(output_sig)?;
    let reply = router.invoke(message, Some(&output_trees)).await?;
    Ok(reply.into_translated())
}

fn expect_string(values: Vec<DynamicValue>) -> Result<String> {
    match values.into_iter().next() {
        Some(DynamicValue::Str(s)) => Ok(s),
        _ => Err(Error::Protocol("expected a single string reply".into())),
    }
}

fn expect_u32(values: Vec<DynamicValue>) -> Result<u32> {
    match values.into_iter().next() {
        Some(DynamicValue::U32(v)) => Ok(v),
        _ => Err(Error::Protocol("expected a single uint32 reply".into())),
    }
}

fn expect_bool(values: Vec<DynamicValue>) -> Result<bool> {
    match values.into_iter().next() {
        Some(DynamicValue::Bool(v)) => Ok(v),
        _ => Err(Error::Protocol("expected a single boolean reply".into())),
    }
}

fn expect_string_array(values: Vec<DynamicValue>) -> Result<Vec<String>> {
    match values.into_iter().next() {
        Some(DynamicValue::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                DynamicValue::Str(s) => Ok(s),
                _ => Err(Error::Protocol("expected an array of strings".into())),
            })
            .collect(),
        _ => Err(Error::Protocol("expected a single string array reply".into())),
    }
}

/// `Hello` — registers the connection and returns the assigned unique name. Also records the
/// name onto `router` so later sends carry the right `sender` (§6).
pub async fn hello(router: &Arc<Router>) -> Result<OwnedUniqueName> {
    let values = call(router, "Hello", "", vec![], "s").await?;
    let name = OwnedUniqueName::try_from(expect_string(values)?)?;
    router.set_unique_name(name.clone()).await;
    Ok(name)
}

/// `RequestName(name, flags) -> u32` (§6). `Ok(())` only on `PRIMARY_OWNER`; every other outcome
/// is a typed [`Error::RequestNameFailed`].
pub async fn request_name(
    router: &Arc<Router>,
    name: &str,
    flags: BitFlags<RequestNameFlags>,
) -> Result<()> {
    let values = call(
        router,
        "RequestName",
        "su",
        vec![
            DynamicValue::Str(name.to_string()),
            DynamicValue::U32(flags.bits()),
        ],
        "u",
    )
    .await?;
    match expect_u32(values)? {
        1 => Ok(()),
        2 => Err(Error::RequestNameFailed(RequestNameOutcome::InQueue)),
        3 => Err(Error::RequestNameFailed(RequestNameOutcome::Exists)),
        4 => Err(Error::RequestNameFailed(RequestNameOutcome::AlreadyOwner)),
        other => Err(Error::Protocol(format!(
            "RequestName returned unknown code {other}"
        ))),
    }
}

/// `ReleaseName(name) -> u32` (§6). Return code is not surfaced further up; the spec only cares
/// whether the call succeeded.
pub async fn release_name(router: &Arc<Router>, name: &str) -> Result<()> {
    call(
        router,
        "ReleaseName",
        "s",
        vec![DynamicValue::Str(name.to_string())],
        "u",
    )
    .await?;
    Ok(())
}

/// `ListNames() -> as` (§6).
pub async fn list_names(router: &Arc<Router>) -> Result<Vec<String>> {
    expect_string_array(call(router, "ListNames", "", vec![], "as").await?)
}

/// `ListActivatableNames() -> as` (§6), used by the proxy's connect routine (§4.7 step 1) to
/// decide whether to `StartServiceByName`.
pub async fn list_activatable_names(router: &Arc<Router>) -> Result<Vec<String>> {
    expect_string_array(call(router, "ListActivatableNames", "", vec![], "as").await?)
}

/// `GetId() -> s` (§6).
pub async fn get_id(router: &Arc<Router>) -> Result<String> {
    expect_string(call(router, "GetId", "", vec![], "s").await?)
}

/// `StartServiceByName(name, flags) -> u32` (§6); `flags` is always `0` per the spec's own call
/// shape (§4.7 step 1: `StartServiceByName(name, 0)`).
pub async fn start_service_by_name(router: &Arc<Router>, name: &str) -> Result<u32> {
    expect_u32(
        call(
            router,
            "StartServiceByName",
            "su",
            vec![DynamicValue::Str(name.to_string()), DynamicValue::U32(0)],
            "u",
        )
        .await?,
    )
}

/// `GetConnectionUnixUser(name) -> u` (§6).
pub async fn get_connection_unix_user(router: &Arc<Router>, name: &str) -> Result<u32> {
    expect_u32(
        call(
            router,
            "GetConnectionUnixUser",
            "s",
            vec![DynamicValue::Str(name.to_string())],
            "u",
        )
        .await?,
    )
}

/// `GetConnectionUnixProcessID(name) -> u` (§6).
pub async fn get_connection_unix_process_id(router: &Arc<Router>, name: &str) -> Result<u32> {
    expect_u32(
        call(
            router,
            "GetConnectionUnixProcessID",
            "s",
            vec![DynamicValue::Str(name.to_string())],
            "u",
        )
        .await?,
    )
}

/// `GetNameOwner(name) -> s` (§6). The daemon errors (`NameHasNoOwner`) when unowned; callers
/// that want a non-erroring check should use [`name_has_owner`] instead.
pub async fn get_name_owner(router: &Arc<Router>, name: &str) -> Result<String> {
    expect_string(
        call(
            router,
            "GetNameOwner",
            "s",
            vec![DynamicValue::Str(name.to_string())],
            "s",
        )
        .await?,
    )
}

/// `NameHasOwner(name) -> b` (§6), the first step of the proxy connect routine (§4.7 step 1).
pub async fn name_has_owner(router: &Arc<Router>, name: &str) -> Result<bool> {
    expect_bool(
        call(
            router,
            "NameHasOwner",
            "s",
            vec![DynamicValue::Str(name.to_string())],
            "b",
        )
        .await?,
    )
}

/// `UpdateActivationEnvironment(dict<s,s>)` (§6).
pub async fn update_activation_environment(
    router: &Arc<Router>,
    env: Vec<(String, String)>,
) -> Result<()> {
    let dict = DynamicValue::Dict(
        env.into_iter()
            .map(|(k, v)| (DynamicValue::Str(k), DynamicValue::Str(v)))
            .collect(),
    );
    call(
        router,
        "UpdateActivationEnvironment",
        "a{ss}",
        vec![dict],
        "",
    )
    .await?;
    Ok(())
}
