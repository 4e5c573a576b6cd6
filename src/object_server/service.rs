//! `Service` — the root of a published object tree (§3, §4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use enumflags2::BitFlags;
use zvariant::Value;

use crate::error::{Error, Result};
use crate::fdo::{self, RequestNameFlags};
use crate::message::Message;
use crate::names::OwnedBusName;
use crate::object_server::node::ObjectNode;
use crate::router::Router;
use crate::value::ValueBridge;

/// What dispatching a single method call against a `Service` resolves to (§4.2).
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Send a method return with this signature and body.
    Return(String, Vec<Value<'static>>),
    /// The call does not get a reply (reserved for dispatch paths that decide this themselves;
    /// the common "caller asked for `NoReplyExpected`" case is handled by the router after a
    /// normal `Return`, not here).
    NoReply,
}

/// The root of an exposed object tree plus the well-known name it is published as (§3).
pub struct Service {
    root: Arc<ObjectNode>,
    name: OwnedBusName,
    router: Weak<Router>,
    exposed: AtomicBool,
}

impl Service {
    pub fn new(name: OwnedBusName, router: &Arc<Router>) -> Arc<Self> {
        let root = ObjectNode::root();
        let service = Arc::new(Self {
            root: root.clone(),
            name,
            router: Arc::downgrade(router),
            exposed: AtomicBool::new(false),
        });
        *root.service.lock().expect("lock poisoned") = Some(Arc::downgrade(&service));
        service
    }

    /// The well-known name this service is published as.
    pub fn name(&self) -> &OwnedBusName {
        &self.name
    }

    /// The root object node (`"/"`, §3 Invariant 5).
    pub fn root(&self) -> &Arc<ObjectNode> {
        &self.root
    }

    /// The router this service is registered with, if it still exists.
    pub fn router(&self) -> Option<Arc<Router>> {
        self.router.upgrade()
    }

    /// Whether [`Service::expose`] has completed its post-expose traversal. Nodes added after
    /// this point wire their post-expose hook immediately (§4.3); nodes built before it wait for
    /// the one-time traversal `expose` runs.
    pub fn is_exposed(&self) -> bool {
        self.exposed.load(Ordering::SeqCst)
    }

    /// Publish this service's well-known name and run the post-expose traversal (§4.6): request
    /// the name from the daemon, register the tree with the router's dispatch table, then walk
    /// the whole tree depth-first arming every node's standard interfaces, then its user
    /// interfaces, before recursing into children.
    pub async fn expose(self: &Arc<Self>, flags: BitFlags<RequestNameFlags>) -> Result<()> {
        let router = self
            .router()
            .ok_or_else(|| Error::Protocol("service's router no longer exists".into()))?;
        fdo::request_name(&router, self.name.as_str(), flags).await?;
        router.register_service(self.name.clone(), self.clone()).await;
        self.exposed.store(true, Ordering::SeqCst);
        self.root.post_expose_traversal(&router).await;
        Ok(())
    }

    /// Release the well-known name and withdraw this service from the router's dispatch table
    /// (the inverse of [`Service::expose`]).
    pub async fn withdraw(self: &Arc<Self>) -> Result<()> {
        let router = self
            .router()
            .ok_or_else(|| Error::Protocol("service's router no longer exists".into()))?;
        router.unregister_service(&self.name).await;
        fdo::release_name(&router, self.name.as_str()).await?;
        self.exposed.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Dispatch an inbound method call against this service's tree (§4.2).
    pub async fn dispatch(&self, msg: &Message) -> Result<DispatchOutcome> {
        let path = msg
            .path()
            .ok_or_else(|| Error::Protocol("method call has no path".into()))?;
        let interface_name = msg
            .interface()
            .ok_or_else(|| Error::Protocol("method call has no interface".into()))?;
        let member = msg
            .member()
            .ok_or_else(|| Error::Protocol("method call has no member".into()))?;

        let components: Vec<&str> = path.as_str().split('/').filter(|c| !c.is_empty()).collect();
        let node = self.root.walk(&components).await?;

        let iface = node
            .resolve_interface(interface_name.as_str())
            .await
            .ok_or_else(|| Error::UnknownInterface(interface_name.as_str().to_string()))?;

        let descriptor = iface.descriptor();
        let method = descriptor
            .methods
            .get(member.as_str())
            .ok_or_else(|| Error::UnknownMethod(member.as_str().to_string()))?;

        if msg.body().len() != method.input_signatures.len() {
            return Err(Error::Protocol(format!(
                "{} expects {} arguments, got {}",
                member,
                method.input_signatures.len(),
                msg.body().len()
            )));
        }
        let args = msg
            .body()
            .iter()
            .zip(&method.input_signatures)
            .map(|(value, tree)| ValueBridge::marshal_to_high(value, tree))
            .collect::<Result<Vec<_>>>()?;

        let returns = iface.call(member.as_str(), args).await?;
        if returns.len() != method.output_signatures.len() {
            return Err(Error::Protocol(format!(
                "{} returned {} values, descriptor declares {}",
                member,
                returns.len(),
                method.output_signatures.len()
            )));
        }
        let body = returns
            .iter()
            .zip(&method.output_signatures)
            .map(|(value, tree)| ValueBridge::high_to_marshal(value, tree))
            .collect::<Result<Vec<_>>>()?;
        let signature = crate::signature::SignatureTree::concat(&method.output_signatures);

        Ok(DispatchOutcome::Return(signature, body))
    }
}
