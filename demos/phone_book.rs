//! `com.example.PhoneBook` — exercises §8.2 scenario 3: a service whose `ObjectManager`-backed
//! object tree grows and shrinks at runtime through contact objects that live under it.
//!
//! Same two-`ChannelTransport`-ends setup as `hello_world.rs` — see `demos/common.rs`.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;

use dbus_core::interface::{Access, InterfaceDescriptor, MethodDescriptor, PropertyDescriptor};
use dbus_core::names::{OwnedBusName, OwnedObjectPath};
use dbus_core::object_server::ObjectManagerPolicy;
use dbus_core::property::PropertyCell;
use dbus_core::signal::SignalEmitter;
use dbus_core::signature::SignatureTree;
use dbus_core::value::DynamicValue;
use dbus_core::{Error, Interface, ObjectNode, ProxyBuilder, Result, Router, Service};

fn sig(s: &str) -> SignatureTree {
    SignatureTree::parse(s).expect("hardcoded demo signature is well-formed")
}

/// `com.example.PhoneBook.Contact` — attached to each child node `AddContact` creates. Plain
/// read-only properties; nothing here mutates after construction.
struct Contact {
    descriptor: Arc<InterfaceDescriptor>,
    name: String,
    phone: String,
    age: u16,
}

impl Contact {
    fn new(name: String, phone: String, age: u16) -> Self {
        let descriptor = InterfaceDescriptor::new("com.example.PhoneBook.Contact")
            .with_property(PropertyDescriptor {
                name: "Name".to_string(),
                access: Access::Read,
                signature: sig("s"),
            })
            .with_property(PropertyDescriptor {
                name: "Phone".to_string(),
                access: Access::Read,
                signature: sig("s"),
            })
            .with_property(PropertyDescriptor {
                name: "Age".to_string(),
                access: Access::Read,
                signature: sig("q"),
            });
        Self {
            descriptor: Arc::new(descriptor),
            name,
            phone,
            age,
        }
    }
}

#[async_trait]
impl Interface for Contact {
    fn descriptor(&self) -> Arc<InterfaceDescriptor> {
        self.descriptor.clone()
    }

    async fn call(&self, method: &str, _args: Vec<DynamicValue>) -> Result<Vec<DynamicValue>> {
        Err(Error::UnknownMethod(method.to_string()))
    }

    async fn get(&self, name: &str) -> Result<DynamicValue> {
        match name {
            "Name" => Ok(DynamicValue::Str(self.name.clone())),
            "Phone" => Ok(DynamicValue::Str(self.phone.clone())),
            "Age" => Ok(DynamicValue::U16(self.age)),
            other => Err(Error::Protocol(format!("no such property: {other}"))),
        }
    }
}

/// `com.example.PhoneBook` itself: `AddContact`/`DeleteContacts`, plus `NbContacts` and
/// `Contacts` as [`PropertyCell`]s (§4.5, §9) so every insertion/removal is observed exactly
/// once. `PropertyCell`'s notifier is synchronous (§9), so it only queues a `(name, value)` pair;
/// `call` drains the queue with one awaited `PropertiesChanged` per entry once its mutations are
/// done, keeping wire emission ordered with the method-return the caller is waiting on.
struct PhoneBook {
    descriptor: Arc<InterfaceDescriptor>,
    node: std::sync::Weak<ObjectNode>,
    next_id: AtomicU64,
    nb_contacts: PropertyCell<u32>,
    contacts: PropertyCell<Vec<(OwnedObjectPath, String)>>,
    pending: std::sync::Mutex<Vec<(&'static str, DynamicValue, SignatureTree)>>,
    emitter: OnceCell<SignalEmitter>,
}

impl PhoneBook {
    fn new(node: std::sync::Weak<ObjectNode>) -> Arc<Self> {
        let descriptor = InterfaceDescriptor::new("com.example.PhoneBook")
            .with_method(MethodDescriptor {
                name: "AddContact".to_string(),
                input_signatures: vec![sig("s"), sig("s"), sig("q")],
                output_signatures: vec![sig("o")],
                input_arg_names: vec!["name".to_string(), "phone".to_string(), "age".to_string()],
                output_arg_names: vec!["path".to_string()],
            })
            .with_method(MethodDescriptor {
                name: "DeleteContacts".to_string(),
                input_signatures: vec![sig("ao")],
                output_signatures: vec![],
                input_arg_names: vec!["paths".to_string()],
                output_arg_names: vec![],
            })
            .with_property(PropertyDescriptor {
                name: "NbContacts".to_string(),
                access: Access::Read,
                signature: sig("u"),
            })
            .with_property(PropertyDescriptor {
                name: "Contacts".to_string(),
                access: Access::Read,
                signature: sig("a(os)"),
            });
        Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let emitter_for_nb: std::sync::Weak<Self> = weak.clone();
            let emitter_for_contacts: std::sync::Weak<Self> = weak.clone();
            Self {
                descriptor: Arc::new(descriptor),
                node,
                next_id: AtomicU64::new(1),
                nb_contacts: PropertyCell::new(
                    0u32,
                    Box::new(move |value: &u32| {
                        if let Some(this) = emitter_for_nb.upgrade() {
                            this.pending
                                .lock()
                                .expect("lock poisoned")
                                .push(("NbContacts", DynamicValue::U32(*value), sig("u")));
                        }
                    }),
                ),
                contacts: PropertyCell::new(
                    Vec::new(),
                    Box::new(move |value: &Vec<(OwnedObjectPath, String)>| {
                        if let Some(this) = emitter_for_contacts.upgrade() {
                            let array = DynamicValue::Array(
                                value
                                    .iter()
                                    .map(|(path, name)| {
                                        DynamicValue::Struct(vec![
                                            DynamicValue::ObjectPath(path.as_str().to_string()),
                                            DynamicValue::Str(name.clone()),
                                        ])
                                    })
                                    .collect(),
                            );
                            this.pending
                                .lock()
                                .expect("lock poisoned")
                                .push(("Contacts", array, sig("a(os)")));
                        }
                    }),
                ),
                pending: std::sync::Mutex::new(Vec::new()),
                emitter: OnceCell::new(),
            }
        })
    }

    fn node(&self) -> Result<Arc<ObjectNode>> {
        self.node
            .upgrade()
            .ok_or_else(|| Error::Protocol("PhoneBook's object node no longer exists".into()))
    }

    /// Emit one `PropertiesChanged` per property queued by `PropertyCell`'s notifier since the
    /// last flush, in the order the mutations happened (§8 invariant 4: one signal per write).
    async fn flush_pending(&self) -> Result<()> {
        let queued: Vec<_> = self.pending.lock().expect("lock poisoned").drain(..).collect();
        let Some(emitter) = self.emitter.get() else {
            return Ok(());
        };
        for (name, value, tree) in queued {
            let tagged = DynamicValue::variant(value, &tree);
            emitter
                .properties_changed("com.example.PhoneBook", vec![(name.to_string(), tagged)], Vec::new())
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Interface for PhoneBook {
    fn descriptor(&self) -> Arc<InterfaceDescriptor> {
        self.descriptor.clone()
    }

    async fn call(&self, method: &str, mut args: Vec<DynamicValue>) -> Result<Vec<DynamicValue>> {
        match method {
            "AddContact" => {
                if args.len() != 3 {
                    return Err(Error::Protocol("AddContact expects 3 arguments".into()));
                }
                let age = match args.remove(2) {
                    DynamicValue::U16(a) => a,
                    other => return Err(Error::Protocol(format!("expected u16 age, got {other:?}"))),
                };
                let phone = match args.remove(1) {
                    DynamicValue::Str(s) => s,
                    other => return Err(Error::Protocol(format!("expected string phone, got {other:?}"))),
                };
                let name = match args.remove(0) {
                    DynamicValue::Str(s) => s,
                    other => return Err(Error::Protocol(format!("expected string name, got {other:?}"))),
                };

                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let node = self.node()?;
                let child = node
                    .add_object(&format!("Contacts/{id}"), vec![Arc::new(Contact::new(name.clone(), phone, age))])
                    .await?;
                let path = child.path();

                self.contacts.mutate(|c| c.push((path.clone(), name)));
                self.nb_contacts.replace(self.contacts.len() as u32);
                self.flush_pending().await?;

                Ok(vec![DynamicValue::ObjectPath(path.as_str().to_string())])
            }
            "DeleteContacts" => {
                if args.len() != 1 {
                    return Err(Error::Protocol("DeleteContacts expects 1 argument".into()));
                }
                let DynamicValue::Array(paths) = args.remove(0) else {
                    return Err(Error::Protocol("expected an array of object paths".into()));
                };
                let node = self.node()?;
                let node_path = node.path();
                let prefix = if node_path.as_str() == "/" {
                    "/".to_string()
                } else {
                    format!("{node_path}/")
                };
                for path in paths {
                    let DynamicValue::ObjectPath(path) = path else {
                        return Err(Error::Protocol("expected an object path element".into()));
                    };
                    let relative = path
                        .strip_prefix(&prefix)
                        .ok_or_else(|| Error::UnknownObject(path.clone()))?;
                    node.remove_object(relative).await?;
                    self.contacts.remove_where(|p, _| p.as_str() == path.as_str());
                }
                self.nb_contacts.replace(self.contacts.len() as u32);
                self.flush_pending().await?;
                Ok(vec![])
            }
            other => Err(Error::UnknownMethod(other.to_string())),
        }
    }

    async fn get(&self, name: &str) -> Result<DynamicValue> {
        match name {
            "NbContacts" => Ok(DynamicValue::U32(self.nb_contacts.get())),
            "Contacts" => Ok(DynamicValue::Array(
                self.contacts
                    .get()
                    .into_iter()
                    .map(|(path, name)| {
                        DynamicValue::Struct(vec![
                            DynamicValue::ObjectPath(path.as_str().to_string()),
                            DynamicValue::Str(name),
                        ])
                    })
                    .collect(),
            )),
            other => Err(Error::Protocol(format!("no such property: {other}"))),
        }
    }

    async fn exposed_on_bus(&self, emitter: SignalEmitter) {
        let _ = self.emitter.set(emitter);
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    async_io::block_on(async {
        let (client_transport, server_transport) = dbus_core::transport::ChannelTransport::pair();

        let server_router = Router::new(server_transport);
        let client_router = Router::new(client_transport);
        common::install_stub_daemon(&server_router, ":1.server").await;
        common::install_stub_daemon(&client_router, ":1.client").await;

        let server_run = server_router.clone();
        async_io::Task::detach(async_io::Task::spawn(async move {
            server_run.run().await;
        }));
        let client_run = client_router.clone();
        async_io::Task::detach(async_io::Task::spawn(async move {
            client_run.run().await;
        }));

        let name = OwnedBusName::try_from("com.example.PhoneBook".to_string()).unwrap();
        let service = Service::new(name, &server_router);
        let root = service.root().clone();
        root.enable_object_manager(ObjectManagerPolicy::EmptyList).await;
        let phone_book = PhoneBook::new(Arc::downgrade(&root));
        root.add_interface(phone_book).await?;
        service
            .expose(dbus_core::fdo::default_request_name_flags())
            .await?;

        let proxy = ProxyBuilder::new(client_router, "com.example.PhoneBook")
            .build()
            .await?;
        let proxy_root = proxy.root().await;
        let book = proxy_root
            .interface("com.example.PhoneBook")
            .await
            .expect("PhoneBook interface not found on the introspected root");

        assert_eq!(book.get_property("NbContacts").await?, DynamicValue::U32(0));

        let alice = book
            .call(
                "AddContact",
                vec![
                    DynamicValue::Str("Alice".to_string()),
                    DynamicValue::Str("555-1234".to_string()),
                    DynamicValue::U16(25),
                ],
            )
            .await?;
        let DynamicValue::ObjectPath(alice_path) = alice.into_iter().next().unwrap() else {
            panic!("AddContact did not return an object path");
        };
        println!("Alice's contact object: {alice_path}");

        let bob = book
            .call(
                "AddContact",
                vec![
                    DynamicValue::Str("Bob".to_string()),
                    DynamicValue::Str("555-7890".to_string()),
                    DynamicValue::U16(56),
                ],
            )
            .await?;
        let DynamicValue::ObjectPath(bob_path) = bob.into_iter().next().unwrap() else {
            panic!("AddContact did not return an object path");
        };
        println!("Bob's contact object: {bob_path}");

        book.call(
            "DeleteContacts",
            vec![DynamicValue::Array(vec![DynamicValue::ObjectPath(bob_path)])],
        )
        .await?;

        // The method-return only acknowledges the call; the proxy's property cache is updated
        // when `PropertiesChanged` itself is delivered and dispatched (§5: "the proxy cache is
        // updated only when the signal arrives"). Give the client router's dispatch loop a turn.
        async_io::Timer::after(std::time::Duration::from_millis(20)).await;

        println!("NbContacts = {:?}", book.get_property("NbContacts").await?);
        println!("Contacts = {:?}", book.get_property("Contacts").await?);

        Ok(())
    })
}
