//! Bus address parsing and well-known bus locations.
//!
//! An address has the shape `transport:key=value[,key=value]*`. Only the
//! `unix` transport with a `path` key is supported; anything else is a
//! configuration error surfaced when the connection is first used.

use std::env;
use std::path::PathBuf;

use crate::error::*;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusAddress {
    pub path: PathBuf,
}

impl BusAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let (transport, rest) = address
            .split_once(':')
            .ok_or_else(|| context!(ErrorKind::InvalidAddress(address.to_owned())))?;

        if transport != "unix" {
            return Err(context!(ErrorKind::InvalidAddress(format!(
                "unsupported transport '{}'",
                transport
            ))));
        }

        for prop in rest.split(',') {
            if let Some(("path", value)) = prop.split_once('=') {
                if value.is_empty() {
                    break;
                }
                return Ok(BusAddress { path: PathBuf::from(value) });
            }
        }

        Err(context!(ErrorKind::InvalidAddress(format!(
            "unix address without a path: '{}'",
            address
        ))))
    }
}

fn uid() -> u32 {
    // getuid can not fail
    unsafe { libc::getuid() }
}

/// The address of the user's session bus.
pub fn session_address() -> String {
    if let Ok(addr) = env::var("DBUS_SESSION_BUS_ADDRESS") {
        return addr;
    }
    match env::var("XDG_RUNTIME_DIR") {
        Ok(dir) => format!("unix:path={}/bus", dir),
        Err(_) => format!("unix:path=/run/user/{}/bus", uid()),
    }
}

/// The address of the system-wide bus.
pub fn system_address() -> String {
    env::var("DBUS_SYSTEM_BUS_ADDRESS")
        .unwrap_or_else(|_| "unix:path=/run/dbus/system_bus_socket".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unix_path() {
        let addr = BusAddress::parse("unix:path=/run/user/1000/bus").unwrap();
        assert_eq!(addr.path, PathBuf::from("/run/user/1000/bus"));
    }

    #[test]
    fn parses_extra_properties() {
        let addr = BusAddress::parse("unix:guid=abcdef,path=/tmp/bus").unwrap();
        assert_eq!(addr.path, PathBuf::from("/tmp/bus"));
    }

    #[test]
    fn rejects_other_transports() {
        let err = BusAddress::parse("tcp:host=localhost,port=1234").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidAddress(_)));
    }

    #[test]
    fn rejects_missing_path() {
        assert!(BusAddress::parse("unix:abstract=/tmp/x").is_err());
        assert!(BusAddress::parse("unix:path=").is_err());
        assert!(BusAddress::parse("garbage").is_err());
    }
}
