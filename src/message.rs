//! The wire-independent message model.
//!
//! A [`Message`] is one framed unit on the bus connection: a method call,
//! a method return, an error reply or a signal broadcast, together with
//! its serial, its routing headers and its typed body.

use std::fmt;

use crate::error::*;
use crate::value::Value;

/// The bus daemon itself, as a peer.
pub(crate) const BUS_NAME: &str = "org.freedesktop.DBus";
pub(crate) const BUS_PATH: &str = "/org/freedesktop/DBus";
pub(crate) const BUS_IFACE: &str = "org.freedesktop.DBus";

pub const ERR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
pub const ERR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageKind {
    pub(crate) fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }

    pub(crate) fn raw(self) -> u8 {
        match self {
            Self::MethodCall => 1,
            Self::MethodReturn => 2,
            Self::Error => 3,
            Self::Signal => 4,
        }
    }
}

/// One framed message, as handed to and produced by the wire codec.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub kind: MessageKind,
    pub serial: u32,
    pub no_reply: bool,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub body: Vec<Value>,
}

impl Message {
    pub(crate) fn new(kind: MessageKind) -> Self {
        Message {
            kind,
            serial: 0,
            no_reply: false,
            reply_serial: None,
            destination: None,
            sender: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            body: Vec::new(),
        }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
        body: Vec<Value>,
    ) -> Self {
        let mut msg = Message::new(MessageKind::MethodCall);
        msg.destination = destination.map(str::to_owned);
        msg.path = Some(path.to_owned());
        msg.interface = interface.map(str::to_owned);
        msg.member = Some(member.to_owned());
        msg.body = body;
        msg
    }

    pub fn signal(
        destination: Option<&str>,
        path: &str,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Self {
        let mut msg = Message::new(MessageKind::Signal);
        msg.destination = destination.map(str::to_owned);
        msg.path = Some(path.to_owned());
        msg.interface = Some(interface.to_owned());
        msg.member = Some(member.to_owned());
        msg.body = body;
        msg
    }

    pub fn method_return(reply_serial: u32, destination: Option<&str>, body: Vec<Value>) -> Self {
        let mut msg = Message::new(MessageKind::MethodReturn);
        msg.reply_serial = Some(reply_serial);
        msg.destination = destination.map(str::to_owned);
        msg.body = body;
        msg
    }

    pub fn error(
        name: &str,
        reply_serial: u32,
        destination: Option<&str>,
        body: Vec<Value>,
    ) -> Self {
        let mut msg = Message::new(MessageKind::Error);
        msg.error_name = Some(name.to_owned());
        msg.reply_serial = Some(reply_serial);
        msg.destination = destination.map(str::to_owned);
        msg.body = body;
        msg
    }

    fn bus_call(member: &str, body: Vec<Value>) -> Self {
        Message::method_call(Some(BUS_NAME), BUS_PATH, Some(BUS_IFACE), member, body)
    }

    pub(crate) fn hello() -> Self {
        Message::bus_call("Hello", Vec::new())
    }

    pub(crate) fn add_match(rule: &str) -> Self {
        Message::bus_call("AddMatch", vec![rule.into()])
    }

    pub(crate) fn remove_match(rule: &str) -> Self {
        Message::bus_call("RemoveMatch", vec![rule.into()])
    }

    pub(crate) fn request_name(name: &str, flags: u32) -> Self {
        Message::bus_call("RequestName", vec![name.into(), Value::Uint32(flags)])
    }

    pub(crate) fn release_name(name: &str) -> Self {
        Message::bus_call("ReleaseName", vec![name.into()])
    }

    pub(crate) fn get_name_owner(name: &str) -> Self {
        Message::bus_call("GetNameOwner", vec![name.into()])
    }
}

/// The successful result of a method call: the returned values.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodReturn {
    pub values: Vec<Value>,
}

impl MethodReturn {
    fn arg(&self, idx: usize) -> Result<&Value> {
        self.values
            .get(idx)
            .ok_or_else(|| context!(ErrorKind::Protocol(format!("reply argument #{} missing", idx))))
    }

    /// The `idx`-th return value as a string, or a protocol error.
    pub fn string(&self, idx: usize) -> Result<&str> {
        self.arg(idx)?
            .as_str()
            .ok_or_else(|| context!(ErrorKind::Protocol(format!("reply argument #{} is not a string", idx))))
    }

    pub fn u32(&self, idx: usize) -> Result<u32> {
        self.arg(idx)?
            .as_u32()
            .ok_or_else(|| context!(ErrorKind::Protocol(format!("reply argument #{} is not a u32", idx))))
    }

    pub fn bool(&self, idx: usize) -> Result<bool> {
        self.arg(idx)?
            .as_bool()
            .ok_or_else(|| context!(ErrorKind::Protocol(format!("reply argument #{} is not a bool", idx))))
    }

    pub fn string_list(&self, idx: usize) -> Result<Vec<String>> {
        self.arg(idx)?.as_string_list().ok_or_else(|| {
            context!(ErrorKind::Protocol(format!("reply argument #{} is not a string array", idx)))
        })
    }
}

/// A structured error reply from a remote peer: the error name plus any
/// values it carried (conventionally a human-readable message first).
#[derive(Clone, Debug, PartialEq)]
pub struct MethodError {
    pub name: String,
    pub values: Vec<Value>,
}

impl MethodError {
    pub fn new<S1: Into<String>, S2: Into<String>>(name: S1, message: S2) -> Self {
        MethodError {
            name: name.into(),
            values: vec![Value::String(message.into())],
        }
    }

    pub fn unknown_object(path: &str) -> Self {
        MethodError::new(ERR_UNKNOWN_OBJECT, format!("no object at path '{}'", path))
    }

    pub fn unknown_method(member: &str) -> Self {
        MethodError::new(ERR_UNKNOWN_METHOD, format!("unknown method '{}'", member))
    }

    pub fn unknown_interface(interface: &str) -> Self {
        MethodError::new(
            ERR_UNKNOWN_INTERFACE,
            format!("unknown interface '{}'", interface),
        )
    }

    pub fn unknown_property(name: &str) -> Self {
        MethodError::new(ERR_UNKNOWN_PROPERTY, format!("unknown property '{}'", name))
    }

    pub fn invalid_args(what: &str) -> Self {
        MethodError::new(ERR_INVALID_ARGS, what)
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        MethodError::new(ERR_FAILED, message)
    }

    /// The conventional first string argument, if present.
    pub fn message(&self) -> Option<&str> {
        self.values.first().and_then(Value::as_str)
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}: {}", self.name, msg),
            None => f.write_str(&self.name),
        }
    }
}

pub type MethodResult<T> = std::result::Result<T, MethodError>;

/// An inbound method call as handed to a hosted object.
#[derive(Clone, Debug)]
pub struct Call {
    pub sender: Option<String>,
    pub path: String,
    pub interface: Option<String>,
    pub member: String,
    pub values: Vec<Value>,
}

/// An inbound signal broadcast as delivered to subscribers.
#[derive(Clone, Debug)]
pub struct Signal {
    /// Unique name of the emitting connection. Always present on messages
    /// routed through a bus daemon.
    pub sender: Option<String>,
    pub path: String,
    pub interface: String,
    pub member: String,
    pub values: Vec<Value>,
}
