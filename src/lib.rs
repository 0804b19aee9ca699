// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A brokerless messaging library: sockets exchange length-prefixed,
//! optionally encrypted frames over TCP or in-process links, dispatched by
//! one of three policies (direct, fair round-robin, or prefix-trie
//! publish) layered under a handful of named scalability-protocol
//! personalities (pair, push/pull, req/rep, pub/sub, bus).
//!
//! A [`Session`] owns the background I/O reactor; [`Session::socket`] hands
//! out [`Socket`] handles that `bind`/`connect`/`send`/`recv` against it.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod identity;
pub mod options;
pub mod pipe;
pub mod protocol;
pub mod queue;
pub mod reactor;
pub mod session;
pub mod socket;
pub mod transport;
pub mod trie;

pub use error::{Error, Result};
pub use frame::Frame;
pub use identity::Identity;
pub use options::Options;
pub use protocol::SocketType;
pub use session::Session;
pub use socket::{Flags, Socket};
