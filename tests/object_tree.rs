//! Object-tree traversal against a bare [`ObjectNode`] tree, no router or proxy involved. Exercises
//! the path reported by a failed traversal (§4.2 step 1): it must name the object that was
//! actually being looked up, not wherever the traversal started from.

use dbus_core::{Error, ObjectNode};
use ntest::timeout;
use test_log::test;

#[test]
#[timeout(5000)]
fn add_object_nests_intermediate_components() {
    async_io::block_on(async {
        let root = ObjectNode::root();
        let leaf = root
            .add_object("com/example/Contacts/1", vec![])
            .await
            .unwrap();
        assert_eq!(leaf.path().as_str(), "/com/example/Contacts/1");
    });
}

#[test]
#[timeout(5000)]
fn remove_object_on_a_missing_leaf_reports_the_full_requested_path() {
    async_io::block_on(async {
        let root = ObjectNode::root();
        root.add_object("com/example", vec![]).await.unwrap();

        let err = root.remove_object("com/example/Missing").await.unwrap_err();
        assert!(
            matches!(&err, Error::UnknownObject(path) if path == "Missing"),
            "leaf lookup failures name the bare leaf, got {err:?}"
        );
    });
}

#[test]
#[timeout(5000)]
fn remove_object_with_a_missing_intermediate_component_reports_the_full_path_not_self() {
    async_io::block_on(async {
        let root = ObjectNode::root();
        let com = root.add_object("com", vec![]).await.unwrap();

        // `com`'s own path is "/com"; the traversal failure must name the path actually being
        // resolved ("/com/example/Missing/leaf"), not "/com" (a prior bug reported the walk's
        // starting node unconditionally, so nested lookups from any non-root node all surfaced
        // the same wrong path).
        let err = com
            .remove_object("example/Missing/leaf")
            .await
            .unwrap_err();
        assert!(
            matches!(&err, Error::UnknownObject(path) if path == "/com/example/Missing"),
            "expected UnknownObject(\"/com/example/Missing\"), got {err:?}"
        );
    });
}

#[test]
#[timeout(5000)]
fn remove_object_then_readd_succeeds() {
    async_io::block_on(async {
        let root = ObjectNode::root();
        root.add_object("com/example", vec![]).await.unwrap();
        root.remove_object("com/example").await.unwrap();
        root.add_object("com/example", vec![]).await.unwrap();
    });
}
