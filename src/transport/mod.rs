// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Address parsing shared by both transports. Grounded in scaproust's
//! `SocketImpl::create_connection`, which splits an address on `"://"` the
//! same way.

pub mod inproc;

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// A parsed endpoint address: either a TCP socket address or an in-process
/// registry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp(SocketAddr),
    Inproc(String),
}

pub fn parse(addr: &str) -> Result<Address> {
    if let Some(rest) = addr.strip_prefix("tcp://") {
        let socket_addr = rest.parse::<SocketAddr>().map_err(|_| Error::BadAddress(addr.to_string()))?;
        Ok(Address::Tcp(socket_addr))
    } else if let Some(rest) = addr.strip_prefix("inproc://") {
        if rest.is_empty() {
            return Err(Error::BadAddress(addr.to_string()));
        }
        Ok(Address::Inproc(rest.to_string()))
    } else {
        Err(Error::BadAddress(addr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_address() {
        assert_eq!(parse("tcp://127.0.0.1:5555").unwrap(), Address::Tcp("127.0.0.1:5555".parse().unwrap()));
    }

    #[test]
    fn parses_inproc_address() {
        assert_eq!(parse("inproc://chat").unwrap(), Address::Inproc("chat".to_string()));
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(matches!(parse("udp://127.0.0.1:1"), Err(Error::BadAddress(_))));
    }

    #[test]
    fn rejects_empty_inproc_name() {
        assert!(matches!(parse("inproc://"), Err(Error::BadAddress(_))));
    }
}
