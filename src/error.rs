pub use chainerror::*;
use std::io;

use crate::message::MethodError;

#[derive(Clone, PartialEq, Debug)]
pub enum ErrorKind {
    Io(::std::io::ErrorKind),
    InvalidAddress(String),
    Handshake(String),
    Protocol(String),
    MethodError(MethodError),
    ObjectExists(String),
    ConnectionClosed,
}

impl ::std::error::Error for ErrorKind {}

impl ::std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        match self {
            ErrorKind::Io(_) => write!(f, "IO error"),
            ErrorKind::InvalidAddress(v) => write!(f, "Invalid bus address: '{}'", v),
            ErrorKind::Handshake(v) => write!(f, "Authentication handshake failed: '{}'", v),
            ErrorKind::Protocol(v) => write!(f, "Protocol violation: {}", v),
            ErrorKind::MethodError(v) => write!(f, "Method call failed: {}", v),
            ErrorKind::ObjectExists(v) => write!(f, "Object already registered at '{}'", v),
            ErrorKind::ConnectionClosed => write!(f, "Connection Closed"),
        }
    }
}

impl ChainErrorFrom<std::io::Error> for ErrorKind {
    fn chain_error_from(e: io::Error, line_filename: Option<String>) -> ChainError<Self> {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => {
                ChainError::<_>::new(ErrorKind::ConnectionClosed, Some(Box::from(e)), line_filename)
            }

            kind => ChainError::<_>::new(ErrorKind::Io(kind), Some(Box::from(e)), line_filename),
        }
    }
}

pub type Result<T> = ChainResult<T, ErrorKind>;
pub type Error = ChainError<ErrorKind>;

pub use crate::{context, map_context};

#[macro_export]
macro_rules! context {
    ($kind:expr) => {
        $crate::error::Error::new($kind, None, Some(format!("{}:{}", file!(), line!())))
    };
}

#[macro_export]
macro_rules! map_context {
    () => {
        |e| {
            <$crate::error::ErrorKind as $crate::error::ChainErrorFrom<_>>::chain_error_from(
                e,
                Some(format!("{}:{}", file!(), line!())),
            )
        }
    };
}
