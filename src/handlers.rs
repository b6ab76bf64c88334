//! The three built-in bus interfaces every connection answers for its
//! hosted objects. The dispatcher calls out to these ahead of the object
//! tree; they never touch connection state.

use std::fs;

use crate::message::{MethodError, MethodResult};
use crate::object::ObjectTree;
use crate::value::Value;

pub(crate) const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";
pub(crate) const PEER_IFACE: &str = "org.freedesktop.DBus.Peer";
pub(crate) const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

const INTROSPECT_DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

fn string_arg<'a>(args: &'a [Value], idx: usize) -> MethodResult<&'a str> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| MethodError::invalid_args("expected a string argument"))
}

pub(crate) fn introspectable(
    tree: &ObjectTree,
    path: &str,
    member: &str,
    _args: &[Value],
) -> MethodResult<Vec<Value>> {
    if member != "Introspect" {
        return Err(MethodError::unknown_method(member));
    }

    let mut xml = String::from(INTROSPECT_DOCTYPE);
    xml.push_str("<node>\n");
    if let Some(object) = tree.get(path) {
        xml.push_str(&object.introspect());
    }
    for child in tree.children(path) {
        xml.push_str(&format!("  <node name=\"{}\"/>\n", child));
    }
    xml.push_str("</node>\n");

    Ok(vec![Value::String(xml)])
}

pub(crate) fn peer(_path: &str, member: &str, _args: &[Value]) -> MethodResult<Vec<Value>> {
    match member {
        "Ping" => Ok(Vec::new()),
        "GetMachineId" => machine_id().map(|id| vec![Value::String(id)]),
        _ => Err(MethodError::unknown_method(member)),
    }
}

fn machine_id() -> MethodResult<String> {
    for file in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
        if let Ok(contents) = fs::read_to_string(file) {
            let id = contents.trim();
            if !id.is_empty() {
                return Ok(id.to_owned());
            }
        }
    }
    Err(MethodError::failed("machine id unavailable"))
}

pub(crate) fn properties(
    tree: &mut ObjectTree,
    path: &str,
    member: &str,
    args: &[Value],
) -> MethodResult<Vec<Value>> {
    let object = tree
        .get_mut(path)
        .ok_or_else(|| MethodError::unknown_object(path))?;

    match member {
        "Get" => {
            let interface = string_arg(args, 0)?;
            let name = string_arg(args, 1)?;
            object
                .property(interface, name)
                .map(|v| vec![Value::Variant(Box::new(v))])
                .ok_or_else(|| MethodError::unknown_property(name))
        }
        "GetAll" => {
            let interface = string_arg(args, 0)?;
            let entries = object
                .properties(interface)
                .into_iter()
                .map(|(name, value)| {
                    Value::DictEntry(
                        Box::new(Value::String(name)),
                        Box::new(Value::Variant(Box::new(value))),
                    )
                })
                .collect();
            Ok(vec![Value::array("{sv}", entries)])
        }
        "Set" => {
            let interface = string_arg(args, 0)?.to_owned();
            let name = string_arg(args, 1)?.to_owned();
            let value = match args.get(2) {
                Some(Value::Variant(inner)) => (**inner).clone(),
                Some(other) => other.clone(),
                None => return Err(MethodError::invalid_args("expected a value argument")),
            };
            object.set_property(&interface, &name, value)?;
            Ok(Vec::new())
        }
        _ => Err(MethodError::unknown_method(member)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Call, ERR_UNKNOWN_PROPERTY};
    use crate::object::Object;
    use async_trait::async_trait;

    struct Thermostat {
        target: f64,
    }

    #[async_trait]
    impl Object for Thermostat {
        fn path(&self) -> &str {
            "/com/example/Thermostat"
        }

        fn introspect(&self) -> String {
            "  <interface name=\"com.example.Thermostat\"/>\n".to_owned()
        }

        fn property(&self, interface: &str, name: &str) -> Option<Value> {
            (interface == "com.example.Thermostat" && name == "Target")
                .then(|| Value::Double(self.target))
        }

        fn properties(&self, interface: &str) -> Vec<(String, Value)> {
            if interface == "com.example.Thermostat" {
                vec![("Target".to_owned(), Value::Double(self.target))]
            } else {
                Vec::new()
            }
        }

        async fn call(&mut self, _call: &Call) -> MethodResult<Vec<Value>> {
            Ok(Vec::new())
        }
    }

    fn tree() -> ObjectTree {
        let mut tree = ObjectTree::new();
        tree.register(Box::new(Thermostat { target: 21.5 })).unwrap();
        tree
    }

    #[test]
    fn introspect_lists_children_and_interfaces() {
        let tree = tree();
        let out = introspectable(&tree, "/com/example", "Introspect", &[]).unwrap();
        let xml = out[0].as_str().unwrap();
        assert!(xml.contains("<node name=\"Thermostat\"/>"));

        let out = introspectable(&tree, "/com/example/Thermostat", "Introspect", &[]).unwrap();
        let xml = out[0].as_str().unwrap();
        assert!(xml.contains("com.example.Thermostat"));
    }

    #[test]
    fn peer_ping_is_empty() {
        assert_eq!(peer("/", "Ping", &[]).unwrap(), Vec::new());
        assert!(peer("/", "Pong", &[]).is_err());
    }

    #[test]
    fn properties_get_wraps_in_variant() {
        let mut tree = tree();
        let args = [
            Value::String("com.example.Thermostat".into()),
            Value::String("Target".into()),
        ];
        let out = properties(&mut tree, "/com/example/Thermostat", "Get", &args).unwrap();
        assert_eq!(out, vec![Value::Variant(Box::new(Value::Double(21.5)))]);

        let args = [
            Value::String("com.example.Thermostat".into()),
            Value::String("Missing".into()),
        ];
        let err = properties(&mut tree, "/com/example/Thermostat", "Get", &args).unwrap_err();
        assert_eq!(err.name, ERR_UNKNOWN_PROPERTY);
    }

    #[test]
    fn properties_set_is_rejected_by_default() {
        let mut tree = tree();
        let args = [
            Value::String("com.example.Thermostat".into()),
            Value::String("Target".into()),
            Value::Variant(Box::new(Value::Double(19.0))),
        ];
        assert!(properties(&mut tree, "/com/example/Thermostat", "Set", &args).is_err());
    }
}
