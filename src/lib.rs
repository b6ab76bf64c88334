//! Client support for the D-Bus message bus.
//!
//! minibus connects to a session or system bus daemon over a local
//! stream socket and multiplexes method calls, signal subscriptions and
//! name ownership over that one connection.
//!
//! # Calling a method
//!
//! ```rust,no_run
//! use minibus::{Connection, Value};
//!
//! # async fn demo() -> minibus::Result<()> {
//! let conn = Connection::session();
//!
//! let reply = conn
//!     .call_method(
//!         Some("org.freedesktop.DBus"),
//!         "/org/freedesktop/DBus",
//!         Some("org.freedesktop.DBus"),
//!         "GetNameOwner",
//!         vec![Value::from("org.freedesktop.Notifications")],
//!     )
//!     .await?;
//! println!("owned by {}", reply.string(0)?);
//! # Ok(())
//! # }
//! ```
//!
//! # Receiving signals
//!
//! ```rust,no_run
//! use minibus::{Connection, SignalFilter};
//!
//! # async fn demo() -> minibus::Result<()> {
//! let conn = Connection::session();
//!
//! let filter = SignalFilter::new()
//!     .sender("org.freedesktop.Notifications")
//!     .interface("org.freedesktop.Notifications")
//!     .member("ActionInvoked");
//! let mut actions = conn.subscribe_signals(filter).await?;
//!
//! while let Some(signal) = actions.next().await {
//!     println!("action: {:?}", signal.values);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Hosting an object
//!
//! ```rust,no_run
//! use minibus::{async_trait, Call, Connection, MethodResult, Object, Value};
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl Object for Ping {
//!     fn path(&self) -> &str {
//!         "/com/example/Ping"
//!     }
//!
//!     async fn call(&mut self, call: &Call) -> MethodResult<Vec<Value>> {
//!         Ok(call.values.clone())
//!     }
//! }
//!
//! # async fn demo() -> minibus::Result<()> {
//! let conn = Connection::session();
//! conn.register_object(Box::new(Ping)).await?;
//! conn.request_name("com.example.Ping", Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub use error::{Error, ErrorKind, Result};

mod address;
mod connection;
mod handlers;
mod message;
mod object;
mod value;
mod wire;
#[cfg(test)]
mod test;

pub use crate::address::{session_address, system_address, BusAddress};
pub use crate::connection::{
    Connection, NameEvents, ReleaseNameReply, RequestNameFlags, RequestNameReply, SignalFilter,
    SignalStream, Transport,
};
pub use crate::message::{
    Call, Message, MessageKind, MethodError, MethodResult, MethodReturn, Signal,
    ERR_FAILED, ERR_INVALID_ARGS, ERR_UNKNOWN_INTERFACE, ERR_UNKNOWN_METHOD, ERR_UNKNOWN_OBJECT,
    ERR_UNKNOWN_PROPERTY,
};
pub use crate::object::{Object, ObjectTree};
pub use crate::value::{Signature, Value};

// the trait macro object implementors need
pub use async_trait::async_trait;
