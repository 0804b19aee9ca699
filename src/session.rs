// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Entry point: owns the reactor thread and hands out `Socket`s that share
//! it. `SocketFacade::new` (`socket_facade.rs`) already takes a connected
//! command/event channel pair rather than building one itself, implying a
//! separate owner spawns the event loop and wires those channels up first;
//! `Session` is that owner, reconstructed for this crate's reactor/channel
//! shape.

use std::io;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::options::Options;
use crate::protocol::SocketType;
use crate::reactor::{self, ReactorHandle};
use crate::socket::Socket;

/// Owns the reactor thread for as long as it's alive. Dropping a `Session`
/// signals the reactor to shut down and joins its thread; sockets vended
/// from it remain usable for inproc traffic (which never touches the
/// reactor) but any of their TCP pipes stop being serviced.
pub struct Session {
    reactor: ReactorHandle,
    join: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new() -> io::Result<Session> {
        let (reactor, join) = reactor::spawn()?;
        Ok(Session { reactor, join: Some(join) })
    }

    pub fn socket(&self, socket_type: SocketType) -> Result<Socket> {
        self.socket_with_options(socket_type, Options::default())
    }

    pub fn socket_with_options(&self, socket_type: SocketType, options: Options) -> Result<Socket> {
        Ok(Socket::new(socket_type, options, self.reactor.clone()))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reactor.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
