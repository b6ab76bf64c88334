//! Typed values and type signatures for the D-Bus wire format.
//!
//! Every message body is an ordered list of [`Value`]s described by a
//! compact [`Signature`] string, e.g. `s` for a string, `as` for an array
//! of strings or `a{sv}` for a string-keyed map of variants.

use std::fmt;

/// A compact D-Bus type string describing zero or more complete types.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    pub fn new<S: Into<String>>(signature: S) -> Self {
        Signature(signature.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Signature {
    fn from(s: &str) -> Self {
        Signature(s.to_owned())
    }
}

/// A single typed value in a message body.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(Signature),
    /// Homogeneous sequence; the element signature is carried so that
    /// empty arrays still encode.
    Array(Signature, Vec<Value>),
    Struct(Vec<Value>),
    /// Key/value pair, only valid as the element of an array.
    DictEntry(Box<Value>, Box<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// The signature of this single complete value.
    pub fn signature(&self) -> Signature {
        let mut out = String::with_capacity(2);
        self.write_signature(&mut out);
        Signature(out)
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Value::Byte(_) => out.push('y'),
            Value::Bool(_) => out.push('b'),
            Value::Int16(_) => out.push('n'),
            Value::Uint16(_) => out.push('q'),
            Value::Int32(_) => out.push('i'),
            Value::Uint32(_) => out.push('u'),
            Value::Int64(_) => out.push('x'),
            Value::Uint64(_) => out.push('t'),
            Value::Double(_) => out.push('d'),
            Value::String(_) => out.push('s'),
            Value::ObjectPath(_) => out.push('o'),
            Value::Signature(_) => out.push('g'),
            Value::Array(elem, _) => {
                out.push('a');
                out.push_str(elem.as_str());
            }
            Value::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Value::DictEntry(key, val) => {
                out.push('{');
                key.write_signature(out);
                val.write_signature(out);
                out.push('}');
            }
            Value::Variant(_) => out.push('v'),
        }
    }

    /// Build an array value from an element signature and items.
    pub fn array<S: Into<Signature>>(elem: S, items: Vec<Value>) -> Self {
        Value::Array(elem.into(), items)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Interpret an `as` array as a list of owned strings.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            Value::Array(_, items) => items
                .iter()
                .map(|it| it.as_str().map(str::to_owned))
                .collect(),
            _ => None,
        }
    }
}

macro_rules! impl_from_value {
    ($(($variant:ident: $t:ty)),*,) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Value {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_value!(
    (Byte: u8),
    (Bool: bool),
    (Int16: i16),
    (Uint16: u16),
    (Int32: i32),
    (Uint32: u32),
    (Int64: i64),
    (Uint64: u64),
    (Double: f64),
    (String: String),
);

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::String(v.to_owned())
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Value {
        Value::Array(Signature::from("s"), v.into_iter().map(Value::String).collect())
    }
}

/// Alignment of the type starting with `code`, in bytes.
pub(crate) fn alignment(code: u8) -> usize {
    match code {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b's' | b'o' | b'a' | b'h' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => 1,
    }
}

/// Split `sig` into its leading complete type and the remainder.
///
/// Returns `None` when the signature is empty or malformed.
pub(crate) fn split_first_type(sig: &str) -> Option<(&str, &str)> {
    let bytes = sig.as_bytes();
    let first = *bytes.first()?;
    match first {
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b's' | b'o' | b'g'
        | b'h' | b'v' => Some(sig.split_at(1)),
        b'a' => {
            let (elem, _) = split_first_type(&sig[1..])?;
            Some(sig.split_at(1 + elem.len()))
        }
        b'(' | b'{' => {
            let close = if first == b'(' { b')' } else { b'}' };
            let mut depth = 0usize;
            for (idx, &b) in bytes.iter().enumerate() {
                match b {
                    b'(' | b'{' => depth += 1,
                    b')' | b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            if b != close {
                                return None;
                            }
                            return Some(sig.split_at(idx + 1));
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        _ => None,
    }
}

/// Split a signature into all of its complete types.
pub(crate) fn split_types(sig: &str) -> Option<Vec<&str>> {
    let mut rest = sig;
    let mut out = Vec::new();
    while !rest.is_empty() {
        let (first, tail) = split_first_type(rest)?;
        out.push(first);
        rest = tail;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_of_values() {
        assert_eq!(Value::Uint32(7).signature().as_str(), "u");
        assert_eq!(
            Value::Struct(vec![Value::Uint32(1), Value::String("x".into())])
                .signature()
                .as_str(),
            "(us)"
        );
        assert_eq!(
            Value::array("{sv}", vec![]).signature().as_str(),
            "a{sv}"
        );
        assert_eq!(
            Value::Variant(Box::new(Value::Bool(true))).signature().as_str(),
            "v"
        );
    }

    #[test]
    fn split_complete_types() {
        assert_eq!(split_types("sau(ub)"), Some(vec!["s", "au", "(ub)"]));
        assert_eq!(split_types("a{sv}x"), Some(vec!["a{sv}", "x"]));
        assert_eq!(split_types(""), Some(vec![]));
        assert_eq!(split_types("a"), None);
        assert_eq!(split_types("(s"), None);
    }

    #[test]
    fn string_list_roundtrip() {
        let val = Value::from(vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(val.signature().as_str(), "as");
        assert_eq!(val.as_string_list().unwrap(), vec!["a", "b"]);
    }
}
