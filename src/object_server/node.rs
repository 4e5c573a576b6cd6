//! `ObjectNode` — the server-side path tree (§4.3).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, Weak};

use async_lock::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::interface::Interface;
use crate::names::OwnedObjectPath;
use crate::object_server::fdo_std::{
    IntrospectableInterface, ObjectManagerInterface, PeerInterface, PropertiesInterface,
};
use crate::object_server::service::Service;
use crate::signal::SignalEmitter;
use crate::value::{DynamicValue, ManagedObjects, PropertyMap};

/// Policy for how a whole-subtree removal reports itself through `ObjectManager` (§9 Open
/// Question 1). Set per node at [`ObjectNode::enable_object_manager`] time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectManagerPolicy {
    /// A single `InterfacesRemoved(path, [])` — the source's convention, and this crate's
    /// default, kept to match the §8.2.3 scenario exactly.
    EmptyList,
    /// One `InterfacesRemoved(path, [iface])` per interface actually removed.
    PerInterface,
}

/// A node in the server-side object path tree (§4.3). Owns its children and its interfaces;
/// parent and service links are weak back-references (§9).
pub struct ObjectNode {
    component: String,
    parent: SyncMutex<Option<Weak<ObjectNode>>>,
    pub(crate) service: SyncMutex<Option<Weak<Service>>>,
    children: AsyncMutex<HashMap<String, Arc<ObjectNode>>>,
    interfaces: AsyncMutex<HashMap<String, Arc<dyn Interface>>>,

    pub(crate) peer: Arc<PeerInterface>,
    pub(crate) introspectable: Arc<IntrospectableInterface>,
    pub(crate) properties: Arc<PropertiesInterface>,
    object_manager: AsyncMutex<Option<(Arc<ObjectManagerInterface>, ObjectManagerPolicy)>>,
}

impl ObjectNode {
    /// Build a new, unattached node for path component `component` (empty for the root).
    pub(crate) fn new(component: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<ObjectNode>| ObjectNode {
            component: component.into(),
            parent: SyncMutex::new(None),
            service: SyncMutex::new(None),
            children: AsyncMutex::new(HashMap::new()),
            interfaces: AsyncMutex::new(HashMap::new()),
            peer: Arc::new(PeerInterface::new()),
            introspectable: Arc::new(IntrospectableInterface::new(weak.clone())),
            properties: Arc::new(PropertiesInterface::new(weak.clone())),
            object_manager: AsyncMutex::new(None),
        })
    }

    /// Build the root node, `"/"` (§3 Invariant 5).
    pub fn root() -> Arc<Self> {
        Self::new("")
    }

    /// This node's path component (empty string for the root).
    pub fn component(&self) -> &str {
        &self.component
    }

    /// The full, absolute path of this node, computed by walking parent back-references to the
    /// root (§4.3).
    pub fn path(self: &Arc<Self>) -> OwnedObjectPath {
        let mut parts = Vec::new();
        let mut current = self.clone();
        loop {
            if !current.component.is_empty() {
                parts.push(current.component.clone());
            }
            let parent = current.parent.lock().expect("lock poisoned").clone();
            match parent.and_then(|w| w.upgrade()) {
                Some(p) => current = p,
                None => break,
            }
        }
        parts.reverse();
        let path_str = if parts.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", parts.join("/"))
        };
        OwnedObjectPath::try_from(path_str).expect("node chain always yields a valid path")
    }

    /// Opt in to the `ObjectManager` standard interface on this node (§4.4, §3 Invariant 6).
    pub async fn enable_object_manager(self: &Arc<Self>, policy: ObjectManagerPolicy) {
        let iface = Arc::new(ObjectManagerInterface::new(Arc::downgrade(self), policy));
        *self.object_manager.lock().await = Some((iface.clone(), policy));

        if let Some(router) = self.exposed_router().await {
            let emitter = SignalEmitter::new(
                router,
                self.path(),
                Self::std_iface_name("org.freedesktop.DBus.ObjectManager"),
                iface.descriptor(),
            );
            iface.exposed_on_bus(emitter).await;
        }
    }

    pub(crate) async fn object_manager_policy(&self) -> Option<ObjectManagerPolicy> {
        self.object_manager.lock().await.as_ref().map(|(_, p)| *p)
    }

    fn object_manager_ref_sync(&self) -> Option<Arc<ObjectManagerInterface>> {
        self.object_manager
            .try_lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|(i, _)| i.clone()))
    }

    /// Resolve `name` against this node's implicit standard interfaces, then its user interfaces
    /// (§3 Invariant 6: every node implicitly carries Peer/Introspectable/Properties).
    pub(crate) async fn resolve_interface(&self, name: &str) -> Option<Arc<dyn Interface>> {
        match name {
            "org.freedesktop.DBus.Peer" => Some(self.peer.clone() as Arc<dyn Interface>),
            "org.freedesktop.DBus.Introspectable" => {
                Some(self.introspectable.clone() as Arc<dyn Interface>)
            }
            "org.freedesktop.DBus.Properties" => {
                Some(self.properties.clone() as Arc<dyn Interface>)
            }
            "org.freedesktop.DBus.ObjectManager" => self
                .object_manager
                .lock()
                .await
                .as_ref()
                .map(|(i, _)| i.clone() as Arc<dyn Interface>),
            _ => self.interfaces.lock().await.get(name).cloned(),
        }
    }

    /// All user-declared interface names attached directly to this node (excludes the four
    /// implicit standard interfaces — those are always present and never listed as "user"
    /// interfaces in introspection's ad-hoc enumeration helpers).
    pub(crate) async fn user_interface_names(&self) -> Vec<String> {
        self.interfaces.lock().await.keys().cloned().collect()
    }

    pub(crate) async fn user_interfaces(&self) -> Vec<Arc<dyn Interface>> {
        self.interfaces.lock().await.values().cloned().collect()
    }

    /// Attach a user interface (§4.3 `add_interface`). Rejects a duplicate interface name
    /// (§3 Invariant 4). If the node's service is already exposed on a bus, wires the post-expose
    /// hook for just this interface (§4.6) instead of waiting for the next full traversal.
    pub async fn add_interface(self: &Arc<Self>, iface: Arc<dyn Interface>) -> Result<()> {
        let name = iface.descriptor().name.clone();
        {
            let mut interfaces = self.interfaces.lock().await;
            if interfaces.contains_key(&name) {
                return Err(Error::Protocol(format!(
                    "interface {name} already attached to this node"
                )));
            }
            interfaces.insert(name.clone(), iface.clone());
        }

        if let Some(router) = self.exposed_router().await {
            let emitter = SignalEmitter::new(
                router,
                self.path(),
                crate::names::OwnedInterfaceName::try_from(name)
                    .expect("descriptor name is a valid interface name"),
                iface.descriptor(),
            );
            iface.exposed_on_bus(emitter).await;
        }

        Ok(())
    }

    /// The owning router, but only if this node's service has actually completed the post-expose
    /// traversal (§4.3's "if the node is already live on a bus" gate) — as opposed to merely
    /// having a service/router back-reference, which a tree can carry before it is ever exposed.
    async fn exposed_router(&self) -> Option<Arc<crate::router::Router>> {
        let service = self.service.lock().expect("lock poisoned").clone()?.upgrade()?;
        if !service.is_exposed() {
            return None;
        }
        service.router()
    }

    fn std_iface_name(name: &'static str) -> crate::names::OwnedInterfaceName {
        crate::names::OwnedInterfaceName::try_from(name.to_string())
            .expect("hardcoded interface name is valid")
    }

    /// Arm this node's own four standard interfaces against `router` (but not its children or
    /// user interfaces) — the part of the post-expose hook every node needs regardless of whether
    /// it existed before [`Service::expose`] ran or was grafted on afterwards via [`Self::add_object`].
    async fn arm_standard_interfaces(self: &Arc<Self>, router: &Arc<crate::router::Router>) {
        let path = self.path();

        self.peer
            .exposed_on_bus(SignalEmitter::new(
                router.clone(),
                path.clone(),
                Self::std_iface_name("org.freedesktop.DBus.Peer"),
                self.peer.descriptor(),
            ))
            .await;
        self.introspectable
            .exposed_on_bus(SignalEmitter::new(
                router.clone(),
                path.clone(),
                Self::std_iface_name("org.freedesktop.DBus.Introspectable"),
                self.introspectable.descriptor(),
            ))
            .await;
        self.properties
            .exposed_on_bus(SignalEmitter::new(
                router.clone(),
                path.clone(),
                Self::std_iface_name("org.freedesktop.DBus.Properties"),
                self.properties.descriptor(),
            ))
            .await;
        if let Some((manager, _)) = self.object_manager.lock().await.clone() {
            manager
                .exposed_on_bus(SignalEmitter::new(
                    router.clone(),
                    path.clone(),
                    Self::std_iface_name("org.freedesktop.DBus.ObjectManager"),
                    manager.descriptor(),
                ))
                .await;
        }
    }

    /// The post-expose traversal (§4.6): depth-first, standard interfaces first (so `Properties`
    /// is armed before anything can emit `PropertiesChanged` through it), then this node's user
    /// interfaces, then recurse into children. Invoked once by [`Service::expose`] and safe to
    /// call again (every `exposed_on_bus` hook is idempotent).
    pub(crate) async fn post_expose_traversal(self: &Arc<Self>, router: &Arc<crate::router::Router>) {
        self.arm_standard_interfaces(router).await;
        let path = self.path();

        for iface in self.user_interfaces().await {
            let name = iface.descriptor().name.clone();
            let emitter = SignalEmitter::new(
                router.clone(),
                path.clone(),
                crate::names::OwnedInterfaceName::try_from(name)
                    .expect("descriptor name is a valid interface name"),
                iface.descriptor(),
            );
            iface.exposed_on_bus(emitter).await;
        }

        let children: Vec<Arc<ObjectNode>> = self.children.lock().await.values().cloned().collect();
        for child in children {
            Box::pin(child.post_expose_traversal(router)).await;
        }
    }

    /// Detach interface `name`. If `should_emit`, the nearest `ObjectManager`-bearing ancestor
    /// (including this node) emits `InterfacesRemoved(path, [name])`; with no such ancestor this
    /// silently no-ops (§4.3).
    pub async fn remove_interface(self: &Arc<Self>, name: &str, should_emit: bool) -> Result<()> {
        let removed = self.interfaces.lock().await.remove(name);
        if removed.is_none() {
            return Err(Error::UnknownInterface(name.to_string()));
        }

        if should_emit {
            if let Some((manager, manager_path)) = self.nearest_object_manager() {
                manager
                    .interfaces_removed(&manager_path, self.path(), vec![name.to_string()])
                    .await
                    .ok();
            }
        }
        Ok(())
    }

    /// Find the nearest ancestor (including `self`) that has `ObjectManager` enabled, along with
    /// its path (§4.3 "if any ancestor ... implements ObjectManager").
    fn nearest_object_manager(self: &Arc<Self>) -> Option<(Arc<ObjectManagerInterface>, OwnedObjectPath)> {
        let mut current = self.clone();
        loop {
            if let Some(manager) = current.object_manager_ref_sync() {
                return Some((manager, current.path()));
            }
            let parent = current.parent.lock().expect("lock poisoned").clone();
            match parent.and_then(|w| w.upgrade()) {
                Some(p) => current = p,
                None => return None,
            }
        }
    }

    /// Walk from `self` along `relative_path`'s components, returning the reached node or
    /// `UnknownObject` naming the full path that was actually requested (§4.2 step 1), not
    /// `self`'s own path: from `Service::dispatch`, `self` is always the service root regardless
    /// of how deep in the tree the walk failed.
    pub(crate) async fn walk(self: &Arc<Self>, relative_path: &[&str]) -> Result<Arc<ObjectNode>> {
        let mut current = self.clone();
        for component in relative_path {
            let child = current.children.lock().await.get(*component).cloned();
            match child {
                Some(c) => current = c,
                None => {
                    let base = self.path();
                    let mut requested = if base.as_str() == "/" {
                        String::new()
                    } else {
                        base.to_string()
                    };
                    for c in relative_path {
                        requested.push('/');
                        requested.push_str(c);
                    }
                    return Err(Error::UnknownObject(requested));
                }
            }
        }
        Ok(current)
    }

    pub(crate) async fn child_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.children.lock().await.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Create (or reuse) the subtree down to `relative_path`, attaching `interfaces` at the leaf
    /// (§4.3 `add_object`). Rejects if the leaf already exists. Emits `InterfacesAdded` from the
    /// nearest `ObjectManager` ancestor, enumerating every non-write-only property of every
    /// interface of the new node.
    pub async fn add_object(
        self: &Arc<Self>,
        relative_path: &str,
        interfaces: Vec<Arc<dyn Interface>>,
    ) -> Result<Arc<ObjectNode>> {
        if relative_path.starts_with('/') {
            return Err(Error::Protocol(
                "add_object expects a path relative to this node, not an absolute one".into(),
            ));
        }
        let components: Vec<&str> = relative_path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Err(Error::Protocol("add_object requires a non-empty path".into()));
        }

        let mut current = self.clone();
        for component in &components[..components.len() - 1] {
            let next = {
                let mut children = current.children.lock().await;
                children
                    .entry(component.to_string())
                    .or_insert_with(|| ObjectNode::new(*component))
                    .clone()
            };
            *next.parent.lock().expect("lock poisoned") = Some(Arc::downgrade(&current));
            *next.service.lock().expect("lock poisoned") =
                current.service.lock().expect("lock poisoned").clone();
            if let Some(router) = next.exposed_router().await {
                next.arm_standard_interfaces(&router).await;
            }
            current = next;
        }

        let leaf_name = components[components.len() - 1];
        {
            let children = current.children.lock().await;
            if children.contains_key(leaf_name) {
                return Err(Error::Protocol(format!(
                    "object already exists at this path: {leaf_name}"
                )));
            }
        }

        let leaf = ObjectNode::new(leaf_name);
        *leaf.parent.lock().expect("lock poisoned") = Some(Arc::downgrade(&current));
        let service = current.service.lock().expect("lock poisoned").clone();
        *leaf.service.lock().expect("lock poisoned") = service.clone();

        if let Some(router) = leaf.exposed_router().await {
            leaf.arm_standard_interfaces(&router).await;
        }

        for iface in interfaces {
            leaf.add_interface(iface).await?;
        }

        current.children.lock().await.insert(leaf_name.to_string(), leaf.clone());

        if let Some((manager, manager_path)) = self.nearest_object_manager_from(&current) {
            let added = leaf.managed_interfaces_snapshot().await?;
            manager
                .interfaces_added(&manager_path, leaf.path(), added)
                .await
                .ok();
        }

        Ok(leaf)
    }

    fn nearest_object_manager_from(
        self: &Arc<Self>,
        start: &Arc<ObjectNode>,
    ) -> Option<(Arc<ObjectManagerInterface>, OwnedObjectPath)> {
        start.clone().nearest_object_manager()
    }

    /// Every non-write-only property of every user interface on this node, each value wrapped as
    /// a variant tagged with its declared signature — the shape both `InterfacesAdded` (§4.3) and
    /// `GetManagedObjects` (§4.4) want directly on the wire.
    pub(crate) async fn managed_interfaces_snapshot(&self) -> Result<Vec<(String, PropertyMap)>> {
        let mut out = Vec::new();
        for iface in self.user_interfaces().await {
            let desc = iface.descriptor();
            let mut props = Vec::new();
            for (name, value) in iface.get_all().await? {
                let tree = desc
                    .properties
                    .get(&name)
                    .map(|p| p.signature.clone())
                    .ok_or_else(|| {
                        Error::Protocol(format!("property {name} not declared on {}", desc.name))
                    })?;
                props.push((name, DynamicValue::variant(value, &tree)));
            }
            out.push((desc.name.clone(), props));
        }
        Ok(out)
    }

    /// Depth-first remove every interface of `self` and its descendants, then unlink `self` from
    /// its parent (§4.3 `remove_object`). Must be invoked with `relative_path` resolved already.
    pub async fn remove_object(self: &Arc<Self>, relative_path: &str) -> Result<()> {
        if relative_path.starts_with('/') {
            return Err(Error::Protocol(
                "remove_object expects a path relative to this node, not an absolute one".into(),
            ));
        }
        let components: Vec<&str> = relative_path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Err(Error::Protocol("remove_object requires a non-empty path".into()));
        }

        let parent_components = &components[..components.len() - 1];
        let parent = self.walk(parent_components).await?;
        let leaf_name = components[components.len() - 1];
        let leaf = parent
            .children
            .lock()
            .await
            .get(leaf_name)
            .cloned()
            .ok_or_else(|| Error::UnknownObject(leaf_name.to_string()))?;

        let manager_ancestor = self.nearest_object_manager();
        let removed_path = leaf.path();
        let removed_interfaces = Self::depth_first_remove(&leaf).await;

        parent.children.lock().await.remove(leaf_name);
        *leaf.parent.lock().expect("lock poisoned") = None;
        *leaf.service.lock().expect("lock poisoned") = None;

        if let Some((manager, manager_path)) = manager_ancestor {
            match manager.policy() {
                ObjectManagerPolicy::EmptyList => {
                    manager
                        .interfaces_removed(&manager_path, removed_path, Vec::new())
                        .await
                        .ok();
                }
                ObjectManagerPolicy::PerInterface => {
                    manager
                        .interfaces_removed(&manager_path, removed_path, removed_interfaces)
                        .await
                        .ok();
                }
            }
        }

        Ok(())
    }

    async fn depth_first_remove(node: &Arc<ObjectNode>) -> Vec<String> {
        let children: Vec<Arc<ObjectNode>> = node.children.lock().await.values().cloned().collect();
        let mut names = Vec::new();
        for child in children {
            Box::pin(Self::depth_first_remove(&child)).await;
        }
        node.children.lock().await.clear();
        let mut interfaces = node.interfaces.lock().await;
        for name in interfaces.keys() {
            names.push(name.clone());
        }
        interfaces.clear();
        debug!(path = %node.path(), "removed object node");
        names
    }

    /// Produce the introspection XML for this node (§4.3).
    pub async fn introspect(self: &Arc<Self>) -> String {
        crate::object_server::introspect::render(self).await
    }

    /// Walk the subtree rooted at this node, enumerating every interface on every descendant
    /// (§4.4 `GetManagedObjects`).
    pub(crate) async fn managed_objects_subtree(self: &Arc<Self>) -> Result<ManagedObjects> {
        let mut out = ManagedObjects::new();
        Box::pin(self.collect_managed_objects(&mut out)).await?;
        Ok(out)
    }

    async fn collect_managed_objects(self: &Arc<Self>, out: &mut ManagedObjects) -> Result<()> {
        let children: Vec<Arc<ObjectNode>> = self.children.lock().await.values().cloned().collect();
        for child in &children {
            let snapshot = child.managed_interfaces_snapshot().await?;
            if !snapshot.is_empty() {
                out.insert(child.path().to_string(), snapshot);
            }
            Box::pin(child.collect_managed_objects(out)).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ObjectNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectNode")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}
