// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Named scalability-protocol personalities layered on top of the three raw
//! dispatch policies (direct, fair, pub) a [`crate::socket::Socket`]
//! implements. Grounded in scaproust's `global.rs::SocketType` (peer
//! matching) and `protocol/pbu.rs` (the Pub half of the Pub/Sub pair), and
//! in nitro's socket-type pairing in `original_source/src/socket.h`.

/// The scalability-protocol personality a socket was created with. This
/// governs which dispatch policy `Socket::send`/`Socket::recv` use and
/// which socket type a peer is expected to present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Exactly one peer; send goes to whichever pipe is registered.
    Pair,
    /// Fair (round-robin) dispatch, send-only.
    Push,
    /// Fair dispatch's receiving half.
    Pull,
    /// Fair dispatch on send; remembers the last peer it received from.
    Req,
    /// Direct reply to whichever pipe last delivered a request.
    Rep,
    /// Prefix-trie dispatch on send; cannot receive.
    Pub,
    /// Registers subscriptions; cannot send.
    Sub,
    /// Broadcasts to every registered pipe.
    Bus,
}

impl SocketType {
    /// The socket type a peer must present to interoperate, where the
    /// protocol constrains it (e.g. Push only ever talks to Pull).
    pub fn peer(self) -> SocketType {
        match self {
            SocketType::Pair => SocketType::Pair,
            SocketType::Push => SocketType::Pull,
            SocketType::Pull => SocketType::Push,
            SocketType::Req => SocketType::Rep,
            SocketType::Rep => SocketType::Req,
            SocketType::Pub => SocketType::Sub,
            SocketType::Sub => SocketType::Pub,
            SocketType::Bus => SocketType::Bus,
        }
    }

    pub fn can_send(self) -> bool {
        !matches!(self, SocketType::Sub)
    }

    pub fn can_recv(self) -> bool {
        !matches!(self, SocketType::Pub)
    }

    /// Whether a peer of `other` is an acceptable partner for a socket of
    /// this type.
    pub fn matches(self, other: SocketType) -> bool {
        self.peer() == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pull_are_mutual_peers() {
        assert_eq!(SocketType::Push.peer(), SocketType::Pull);
        assert!(SocketType::Push.matches(SocketType::Pull));
        assert!(!SocketType::Push.matches(SocketType::Push));
    }

    #[test]
    fn pub_cannot_receive_sub_cannot_send() {
        assert!(!SocketType::Pub.can_recv());
        assert!(!SocketType::Sub.can_send());
    }

    #[test]
    fn bus_is_its_own_peer() {
        assert_eq!(SocketType::Bus.peer(), SocketType::Bus);
    }
}
