// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-connection TCP pipe state machine: handshake, subscription sync, and
//! the read/write paths between a `mio::net::TcpStream` and the owning
//! socket's shared queues.
//!
//! Grounded in scaproust's `pipe.rs` (`Pipe` wrapping a `Connection` trait
//! object with `Handshake`/`Activate` reactor-driven states) for the
//! state-machine shape, generalized to the handshake and subscription
//! protocol this crate's `codec`/`crypto` modules define.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Token;

use crate::codec::{self, FrameDecoder, PlainBody, WireBody};
use crate::crypto::{Hello, KeyPair, SessionCrypto, HELLO_LEN, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::queue::BoundedQueue;
use crate::socket::{self, PipeEntry, SocketShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Connector: TCP connect is in flight.
    Connecting,
    /// Our hello is queued or sent; waiting for the peer's.
    HelloSent,
    /// Both hellos exchanged, crypto session (if any) established.
    Ready,
    /// Draining `send_queue` during close linger before the socket closes.
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PipeStats {
    pub sent: u64,
    pub recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// One TCP connection, owned exclusively by the reactor thread. Registers
/// into its socket's shared `PipesTable` once the handshake completes,
/// unregisters on teardown.
pub struct TcpPipe {
    pub token: Token,
    stream: TcpStream,
    shared: Arc<SocketShared>,
    state: PipeState,
    is_connector: bool,
    peer_addr: SocketAddr,

    decoder: FrameDecoder,
    crypto: Option<SessionCrypto>,
    local_keypair: Option<KeyPair>,
    identity: Option<Identity>,

    send_queue: Arc<BoundedQueue>,
    out_buf: Vec<u8>,
    hello_out: Vec<u8>,
    hello_in: Vec<u8>,

    sub_state_sent: u64,
    sub_state_recv: Vec<Vec<u8>>,
    last_sub_resend: Instant,

    closing_since: Option<Instant>,

    stats: PipeStats,
    pub born: Instant,
}

impl TcpPipe {
    fn common(token: Token, stream: TcpStream, shared: Arc<SocketShared>, is_connector: bool, peer_addr: SocketAddr) -> TcpPipe {
        let hwm_out = shared.options.hwm_out;
        let max_frame_size = shared.options.max_frame_size;
        let local_keypair = shared.options.crypto.as_ref().map(|c| c.secret_key.clone());
        let hello = Hello {
            identity: *shared.options.ident.as_bytes(),
            public_key: local_keypair.as_ref().map(|k| k.public_bytes()).unwrap_or([0u8; 32]),
            version: PROTOCOL_VERSION,
        };

        TcpPipe {
            token,
            stream,
            shared,
            state: PipeState::Connecting,
            is_connector,
            peer_addr,
            decoder: FrameDecoder::new(max_frame_size),
            crypto: None,
            local_keypair,
            identity: None,
            send_queue: Arc::new(BoundedQueue::new(hwm_out)),
            out_buf: Vec::new(),
            hello_out: hello.encode().to_vec(),
            hello_in: Vec::new(),
            sub_state_sent: 0,
            sub_state_recv: Vec::new(),
            last_sub_resend: Instant::now(),
            closing_since: None,
            stats: PipeStats::default(),
            born: Instant::now(),
        }
    }

    pub fn connector(token: Token, stream: TcpStream, shared: Arc<SocketShared>, peer_addr: SocketAddr) -> TcpPipe {
        TcpPipe::common(token, stream, shared, true, peer_addr)
    }

    pub fn accepted(token: Token, stream: TcpStream, shared: Arc<SocketShared>, peer_addr: SocketAddr) -> TcpPipe {
        TcpPipe::common(token, stream, shared, false, peer_addr)
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn socket_id(&self) -> crate::socket::SocketId {
        self.shared.id
    }

    pub fn shared_socket(&self) -> Arc<SocketShared> {
        self.shared.clone()
    }

    /// Registers this pipe's send queue into its socket's pipes table once
    /// the handshake completes; called right after the state transitions to
    /// `Ready`. A pre-existing entry under the same identity (reconnect from
    /// the same peer) is superseded: its unsent frames are moved onto this
    /// pipe's queue, then the old queue is closed.
    fn register(&mut self) {
        let identity = self.identity;
        self.shared.pipes.lock().insert(self.token, PipeEntry { identity, send_queue: self.send_queue.clone() });
    }

    fn unregister(&mut self) {
        if let Some(entry) = self.shared.pipes.lock().remove(self.token) {
            entry.send_queue.close();
        }
    }

    /// Drives outbound bytes: the handshake hello while connecting, then
    /// drained application frames once `Ready`. Returns `true` if the pipe
    /// still has bytes queued (reactor should keep polling for writable
    /// readiness); `false` if there is nothing left to write right now.
    pub fn writable(&mut self) -> Result<bool> {
        loop {
            if self.out_buf.is_empty() {
                match self.state {
                    PipeState::Connecting | PipeState::HelloSent => {
                        if self.hello_out.is_empty() {
                            return Ok(false);
                        }
                        self.out_buf = std::mem::take(&mut self.hello_out);
                        self.state = PipeState::HelloSent;
                    }
                    // `Closing` still drains whatever is left in the send
                    // queue (close linger, §8 scenario 6) — it only skips
                    // subscription resends, which are pointless once the
                    // socket is on its way out.
                    PipeState::Ready | PipeState::Closing => {
                        if self.state == PipeState::Ready && self.maybe_queue_sub_resend() {
                            continue;
                        }
                        match self.send_queue.try_pull() {
                            Ok(frame) => {
                                self.out_buf = codec::encode(PlainBody::Data(&frame), self.crypto.as_mut(), self.shared.options.max_frame_size)?;
                                self.stats.sent += 1;
                            }
                            Err(Error::WouldBlock) | Err(Error::QueueClosed) => return Ok(false),
                            Err(e) => return Err(e),
                        }
                    }
                    PipeState::Closed => return Ok(false),
                }
            }

            match self.stream.write(&self.out_buf) {
                Ok(0) => return Err(Error::Io(io::Error::new(io::ErrorKind::WriteZero, "peer closed during write"))),
                Ok(n) => {
                    self.stats.bytes_sent += n as u64;
                    self.out_buf.drain(..n);
                    if !self.out_buf.is_empty() {
                        return Ok(true);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Queues a subscription-set resend if the local set has changed since
    /// it was last sent, or the resend interval has elapsed. Returns `true`
    /// if a resend was queued into `out_buf`.
    fn maybe_queue_sub_resend(&mut self) -> bool {
        let local_state = self.shared.sub_keys_state.load(std::sync::atomic::Ordering::SeqCst);
        let due = self.last_sub_resend.elapsed() >= self.shared.options.sub_resend_interval;
        if local_state == self.sub_state_sent && !due {
            return false;
        }
        self.last_sub_resend = Instant::now();
        self.sub_state_sent = local_state;
        let keys = self.shared.local_sub_keys.lock().clone();
        let payload = socket::encode_sub_keys(&keys);
        match codec::encode(PlainBody::SubUpdate(&payload), self.crypto.as_mut(), self.shared.options.max_frame_size) {
            Ok(bytes) => {
                self.out_buf = bytes;
                true
            }
            Err(_) => false,
        }
    }

    /// Reads available bytes, advances the handshake or hands off decoded
    /// frames to the owning socket.
    pub fn readable(&mut self) -> Result<()> {
        let mut buf = [0u8; 8192];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed connection"))),
                Ok(n) => {
                    self.stats.bytes_recv += n as u64;
                    self.feed(&buf[..n])?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        if self.identity.is_none() {
            self.hello_in.extend_from_slice(bytes);
            if self.hello_in.len() < HELLO_LEN {
                return Ok(());
            }
            let remainder = self.hello_in.split_off(HELLO_LEN);
            let hello_bytes: [u8; HELLO_LEN] = self.hello_in[..HELLO_LEN].try_into().unwrap();
            let hello = Hello::decode(&hello_bytes)?;

            if let Some(crypto_opts) = &self.shared.options.crypto {
                if hello.public_key != crypto_opts.peer_public_key {
                    return Err(Error::HandshakeFailed("peer public key does not match configured pin"));
                }
            }
            if let Some(local) = &self.local_keypair {
                self.crypto = Some(SessionCrypto::derive(local, &hello.public_key));
            }
            self.identity = Some(Identity::from(hello.identity));
            self.state = PipeState::Ready;
            log::debug!("pipe {:?} handshook with peer {:?}", self.token, self.identity);
            self.register();

            if !remainder.is_empty() {
                self.decoder.feed(&remainder);
            }
            return self.drain_decoder();
        }

        self.decoder.feed(bytes);
        self.drain_decoder()
    }

    fn drain_decoder(&mut self) -> Result<()> {
        let units = self.decoder.drain_frames(self.crypto.as_mut())?;
        let identity = self.identity.unwrap_or_default();
        for unit in units {
            self.stats.recv += 1;
            socket::deliver(&self.shared, self.token, identity, unit, &mut self.sub_state_recv)?;
        }
        Ok(())
    }

    /// Called on the reactor's fixed tick while in `Closing` state: reports
    /// whether linger has expired or the send queue has fully drained,
    /// either of which means the pipe should be torn down now.
    pub fn close_linger_elapsed(&mut self) -> bool {
        let since = *self.closing_since.get_or_insert_with(Instant::now);
        self.send_queue.count() == 0 || since.elapsed() >= self.shared.options.close_linger
    }

    pub fn begin_closing(&mut self) {
        self.state = PipeState::Closing;
        self.closing_since = Some(Instant::now());
    }

    pub fn finish(&mut self) {
        self.state = PipeState::Closed;
        self.unregister();
    }

    pub fn is_connector(&self) -> bool {
        self.is_connector
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stats(&self) -> PipeStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_state_transitions_are_ordered() {
        assert_ne!(PipeState::Connecting, PipeState::Ready);
        assert_eq!(PipeState::Ready, PipeState::Ready);
    }
}
