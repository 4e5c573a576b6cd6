//! Introspection XML rendering (§4.3, §6).
//!
//! `Introspect()` combines every interface attached to a node — implicit standard interfaces
//! first, then user interfaces — with the list of immediate children as bare `<node name="…"/>`
//! entries (the spec does not ask for recursive introspection; a client walks the tree one
//! `Introspect` call per level, per §4.7).

use std::fmt::Write as _;
use std::sync::Arc;

use crate::interface::{Access, Interface, InterfaceDescriptor};
use crate::object_server::node::ObjectNode;

const DOCTYPE: &str = concat!(
    "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n",
    "\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">"
);

pub(crate) async fn render(node: &Arc<ObjectNode>) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(DOCTYPE);
    xml.push('\n');
    xml.push_str("<node>\n");

    write_interface(&mut xml, &node.peer.descriptor());
    write_interface(&mut xml, &node.introspectable.descriptor());
    write_interface(&mut xml, &node.properties.descriptor());
    if let Some(policy) = node.object_manager_policy().await {
        let _ = policy;
        if let Some(manager) = node.resolve_interface("org.freedesktop.DBus.ObjectManager").await {
            write_interface(&mut xml, &manager.descriptor());
        }
    }
    for iface in node.user_interfaces().await {
        write_interface(&mut xml, &iface.descriptor());
    }

    for child in node.child_names().await {
        let _ = writeln!(xml, "  <node name=\"{child}\"/>");
    }

    xml.push_str("</node>\n");
    xml
}

fn write_interface(xml: &mut String, desc: &InterfaceDescriptor) {
    let _ = writeln!(xml, "  <interface name=\"{}\">", desc.name);
    for method in desc.methods.values() {
        let _ = writeln!(xml, "    <method name=\"{}\">", method.name);
        for (name, tree) in method.input_arg_names.iter().zip(&method.input_signatures) {
            let _ = writeln!(
                xml,
                "      <arg name=\"{name}\" type=\"{}\" direction=\"in\"/>",
                tree.as_str()
            );
        }
        for (name, tree) in method.output_arg_names.iter().zip(&method.output_signatures) {
            let _ = writeln!(
                xml,
                "      <arg name=\"{name}\" type=\"{}\" direction=\"out\"/>",
                tree.as_str()
            );
        }
        xml.push_str("    </method>\n");
    }
    for property in desc.properties.values() {
        let access = match property.access {
            Access::Read => "read",
            Access::Write => "write",
            Access::ReadWrite => "readwrite",
        };
        let _ = writeln!(
            xml,
            "    <property name=\"{}\" type=\"{}\" access=\"{access}\"/>",
            property.name,
            property.signature.as_str()
        );
    }
    for signal in desc.signals.values() {
        let _ = writeln!(xml, "    <signal name=\"{}\">", signal.name);
        for (name, tree) in signal.arg_names.iter().zip(&signal.output_signatures) {
            let _ = writeln!(xml, "      <arg name=\"{name}\" type=\"{}\"/>", tree.as_str());
        }
        xml.push_str("    </signal>\n");
    }
    xml.push_str("  </interface>\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{InterfaceDescriptor, MethodDescriptor};
    use crate::object_server::node::ObjectNode;
    use crate::signature::SignatureTree;
    use crate::value::DynamicValue;
    use async_trait::async_trait;

    struct Dummy(Arc<InterfaceDescriptor>);

    #[async_trait]
    impl Interface for Dummy {
        fn descriptor(&self) -> Arc<InterfaceDescriptor> {
            self.0.clone()
        }

        async fn call(&self, _m: &str, _a: Vec<DynamicValue>) -> crate::error::Result<Vec<DynamicValue>> {
            Ok(vec![])
        }
    }

    #[test]
    fn render_includes_children_and_interfaces() {
        async_io::block_on(async {
            let root = ObjectNode::root();
            let desc = InterfaceDescriptor::new("com.example.Foo").with_method(MethodDescriptor {
                name: "Bar".to_string(),
                input_signatures: vec![],
                output_signatures: vec![SignatureTree::parse("s").unwrap()],
                input_arg_names: vec![],
                output_arg_names: vec!["result".to_string()],
            });
            root.add_interface(Arc::new(Dummy(Arc::new(desc)))).await.unwrap();
            root.add_object("child", vec![]).await.unwrap();

            let xml = root.introspect().await;
            assert!(xml.contains("com.example.Foo"));
            assert!(xml.contains("<node name=\"child\"/>"));
            assert!(xml.contains("org.freedesktop.DBus.Peer"));
        });
    }
}
