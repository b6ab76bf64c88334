//! Hosted objects and the path-keyed tree the dispatcher resolves
//! inbound method calls against.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

use crate::error::*;
use crate::message::{Call, MethodError, MethodResult};
use crate::value::Value;

/// An object this process exposes on the bus.
///
/// The engine invokes [`Object::call`] for every inbound method call whose
/// path matches and whose interface is not one of the built-in handlers
/// (Introspectable, Peer, Properties); those are answered from the
/// object's metadata accessors instead.
#[async_trait]
pub trait Object: Send {
    /// The object path this object is registered under.
    fn path(&self) -> &str;

    /// XML fragment describing the object's interfaces, inserted into the
    /// introspection document.
    fn introspect(&self) -> String {
        String::new()
    }

    fn property(&self, interface: &str, name: &str) -> Option<Value> {
        let _ = (interface, name);
        None
    }

    fn properties(&self, interface: &str) -> Vec<(String, Value)> {
        let _ = interface;
        Vec::new()
    }

    fn set_property(&mut self, interface: &str, name: &str, value: Value) -> MethodResult<()> {
        let _ = (interface, value);
        Err(MethodError::unknown_property(name))
    }

    async fn call(&mut self, call: &Call) -> MethodResult<Vec<Value>>;
}

/// The set of hosted objects, keyed by object path.
#[derive(Default)]
pub struct ObjectTree {
    objects: HashMap<String, Box<dyn Object>>,
}

impl ObjectTree {
    pub fn new() -> Self {
        ObjectTree { objects: HashMap::new() }
    }

    /// Register an object under its own path. Registering a second object
    /// at the same path is a usage error.
    pub fn register(&mut self, object: Box<dyn Object>) -> Result<()> {
        let path = object.path().to_owned();
        if self.objects.contains_key(&path) {
            return Err(context!(ErrorKind::ObjectExists(path)));
        }
        self.objects.insert(path, object);
        Ok(())
    }

    pub fn get(&self, path: &str) -> Option<&dyn Object> {
        self.objects.get(path).map(|b| &**b)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Box<dyn Object>> {
        self.objects.get_mut(path)
    }

    /// Names of the direct children of `path`, for introspection.
    pub fn children(&self, path: &str) -> Vec<String> {
        let base = if path == "/" { "/".to_owned() } else { format!("{}/", path) };
        let mut names = BTreeSet::new();
        for registered in self.objects.keys() {
            if let Some(rest) = registered.strip_prefix(&base) {
                if rest.is_empty() {
                    continue;
                }
                let first = rest.split('/').next().unwrap_or(rest);
                names.insert(first.to_owned());
            }
        }
        names.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(&'static str);

    #[async_trait]
    impl Object for Dummy {
        fn path(&self) -> &str {
            self.0
        }

        async fn call(&mut self, _call: &Call) -> MethodResult<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn register_rejects_duplicate_path() {
        let mut tree = ObjectTree::new();
        tree.register(Box::new(Dummy("/a"))).unwrap();
        let err = tree.register(Box::new(Dummy("/a"))).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ObjectExists(p) if p == "/a"));
    }

    #[test]
    fn children_are_direct_and_deduplicated() {
        let mut tree = ObjectTree::new();
        tree.register(Box::new(Dummy("/a/b"))).unwrap();
        tree.register(Box::new(Dummy("/a/b/c"))).unwrap();
        tree.register(Box::new(Dummy("/a/d"))).unwrap();
        assert_eq!(tree.children("/a"), vec!["b".to_owned(), "d".to_owned()]);
        assert_eq!(tree.children("/a/b"), vec!["c".to_owned()]);
        assert_eq!(tree.children("/"), vec!["a".to_owned()]);
        assert!(tree.children("/x").is_empty());
    }
}
