// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-process transport: sockets bound and connected under an `inproc://`
//! name link directly, with no encryption, no framing, and no reactor
//! involvement at all — a connecting socket's outbound pipe entry simply
//! points at the peer's own receive queue.
//!
//! Grounded in `nitro_inproc_socket_t` (`original_source/src/socket.h`):
//! its `link_lock`/`links`/`current`/`bound`/`registry` fields are exactly
//! this registry-of-bound-peers-plus-links shape, reworked here as a single
//! process-wide table instead of a per-socket linked list. No separate
//! reactor round-trip is needed since there is no OS resource to register.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::socket::{PipeEntry, SocketId, SocketShared};

type Registry = Mutex<HashMap<String, Vec<Arc<SocketShared>>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers `shared` as bound under `name`. Does not retroactively link
/// any socket that already connected to this name before the bind — matching
/// TCP's ordinary listen-then-accept ordering, a connect before any bind
/// simply finds no peers yet.
pub fn bind(name: &str, shared: Arc<SocketShared>) {
    registry().lock().unwrap().entry(name.to_string()).or_default().push(shared);
}

pub fn unbind(name: &str, socket_id: SocketId) {
    let mut registry = registry().lock().unwrap();
    if let Some(bound) = registry.get_mut(name) {
        bound.retain(|s| s.id != socket_id);
        if bound.is_empty() {
            registry.remove(name);
        }
    }
}

/// Links `connector` bidirectionally with every socket currently bound
/// under `name`: each side's pipes table gets an entry whose outbound
/// queue is literally the other side's receive queue.
pub fn connect(name: &str, connector: &Arc<SocketShared>) -> crate::error::Result<()> {
    let registry = registry().lock().unwrap();
    let peers = registry.get(name).cloned().unwrap_or_default();
    drop(registry);

    if peers.is_empty() {
        return Err(crate::error::Error::NoRoute);
    }

    for peer in peers {
        link(connector, &peer);
    }
    Ok(())
}

fn link(a: &Arc<SocketShared>, b: &Arc<SocketShared>) {
    let token_a = a.pipes.lock().next_local_token();
    let token_b = b.pipes.lock().next_local_token();

    // Each side's entry is addressed by the *other* side's configured
    // identity, mirroring what a TCP handshake would have learned.
    a.pipes.lock().insert(token_a, PipeEntry { identity: Some(b.options.ident), send_queue: b.recv_queue.clone() });
    b.pipes.lock().insert(token_b, PipeEntry { identity: Some(a.options.ident), send_queue: a.recv_queue.clone() });
}

/// Removes every inproc link `shared` participates in, on both ends, by
/// walking every bound registry entry. Used by `Socket::close`.
pub fn unlink_all(shared: &Arc<SocketShared>) {
    let registry = registry().lock().unwrap();
    let mut peers: Vec<Arc<SocketShared>> = registry.values().flatten().cloned().collect();
    drop(registry);
    peers.retain(|s| s.id != shared.id);
    peers.sort_by_key(|s| s.id.0);
    peers.dedup_by_key(|s| s.id.0);

    for peer in &peers {
        let stale: Vec<_> = peer
            .pipes
            .lock()
            .by_token
            .iter()
            .filter(|(_, entry)| Arc::ptr_eq(&entry.send_queue, &shared.recv_queue))
            .map(|(token, _)| *token)
            .collect();
        let mut table = peer.pipes.lock();
        for token in stale {
            table.remove(token);
        }
    }

    let stale: Vec<_> = shared
        .pipes
        .lock()
        .by_token
        .iter()
        .filter(|(_, entry)| peers.iter().any(|p| Arc::ptr_eq(&entry.send_queue, &p.recv_queue)))
        .map(|(token, _)| *token)
        .collect();
    let mut table = shared.pipes.lock();
    for token in stale {
        table.remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::protocol::SocketType;
    use std::sync::Arc;

    fn shared(socket_type: SocketType) -> Arc<SocketShared> {
        SocketShared::new(socket_type, Options::default())
    }

    #[test]
    fn connect_links_both_directions() {
        let name = "test-inproc-link";
        let a = shared(SocketType::Pair);
        let b = shared(SocketType::Pair);
        bind(name, a.clone());
        connect(name, &b).unwrap();
        assert_eq!(a.pipes.lock().len(), 1);
        assert_eq!(b.pipes.lock().len(), 1);
        unbind(name, a.id);
    }

    #[test]
    fn connect_with_no_bound_peer_fails_no_route() {
        let c = shared(SocketType::Pair);
        assert!(matches!(connect("nobody-here", &c), Err(crate::error::Error::NoRoute)));
    }
}
