// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The single I/O reactor thread: one `mio::Poll`, one `TcpListener` map,
//! one `TcpPipe` map, driven by readiness events plus a fixed tick that
//! re-checks reconnect/sub-resend/close-linger timers.
//!
//! Grounded in scaproust's `EventLoopSignal`/`CmdSignal`/`SocketNotify`
//! (`event_loop_msg.rs`) for the single-thread-owns-all-sockets shape and
//! command channel pattern, adapted to own raw TCP resources directly
//! instead of dispatching through per-protocol objects, and to use a fixed
//! poll timeout instead of per-pipe mio timeouts (a documented
//! simplification, see DESIGN.md) for reconnect/resend/linger bookkeeping.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Result};
use crate::pipe::TcpPipe;
use crate::socket::{SocketId, SocketShared};

const TICK: Duration = Duration::from_millis(100);

enum Command {
    Bind { shared: Arc<SocketShared>, addr: SocketAddr, reply: Sender<Result<()>> },
    Connect { shared: Arc<SocketShared>, addr: SocketAddr, reply: Sender<Result<()>> },
    CloseSocket { socket_id: SocketId },
    Shutdown,
}

/// A cheap, cloneable handle to the reactor thread's command channel.
#[derive(Clone)]
pub struct ReactorHandle {
    tx: Sender<Command>,
}

impl ReactorHandle {
    pub fn bind(&self, shared: Arc<SocketShared>, addr: SocketAddr) -> Result<()> {
        let (reply, rx) = mpsc::channel();
        self.tx.send(Command::Bind { shared, addr, reply }).map_err(|_| reactor_gone())?;
        rx.recv().map_err(|_| reactor_gone())?
    }

    pub fn connect(&self, shared: Arc<SocketShared>, addr: SocketAddr) -> Result<()> {
        let (reply, rx) = mpsc::channel();
        self.tx.send(Command::Connect { shared, addr, reply }).map_err(|_| reactor_gone())?;
        rx.recv().map_err(|_| reactor_gone())?
    }

    pub fn close_socket(&self, socket_id: SocketId) {
        let _ = self.tx.send(Command::CloseSocket { socket_id });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

fn reactor_gone() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "reactor thread is gone"))
}

struct Listener {
    listener: TcpListener,
    shared: Arc<SocketShared>,
}

const TOKEN_BUDGET_LISTENERS: usize = 1 << 24;

struct PendingReconnect {
    at: Instant,
    shared: Arc<SocketShared>,
    addr: SocketAddr,
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    commands: Receiver<Command>,
    listeners: HashMap<Token, Listener>,
    pipes: HashMap<Token, TcpPipe>,
    closing_sockets: std::collections::HashSet<SocketId>,
    pending_reconnects: Vec<PendingReconnect>,
    next_token: usize,
}

impl Reactor {
    fn new(commands: Receiver<Command>) -> io::Result<Reactor> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            commands,
            listeners: HashMap::new(),
            pipes: HashMap::new(),
            closing_sockets: std::collections::HashSet::new(),
            pending_reconnects: Vec::new(),
            next_token: 0,
        })
    }

    fn next_token(&mut self) -> Token {
        self.next_token += 1;
        Token(self.next_token)
    }

    fn next_listener_token(&mut self) -> Token {
        self.next_token += 1;
        Token(TOKEN_BUDGET_LISTENERS + self.next_token)
    }

    fn handle_bind(&mut self, shared: Arc<SocketShared>, addr: SocketAddr) -> Result<()> {
        let mut listener = TcpListener::bind(addr)?;
        let token = self.next_listener_token();
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;
        self.listeners.insert(token, Listener { listener, shared });
        Ok(())
    }

    fn handle_connect(&mut self, shared: Arc<SocketShared>, addr: SocketAddr) -> Result<()> {
        let mut stream = TcpStream::connect(addr)?;
        let token = self.next_token();
        self.poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        let pipe = TcpPipe::connector(token, stream, shared, addr);
        self.pipes.insert(token, pipe);
        Ok(())
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Bind { shared, addr, reply } => {
                let _ = reply.send(self.handle_bind(shared, addr));
            }
            Command::Connect { shared, addr, reply } => {
                let _ = reply.send(self.handle_connect(shared, addr));
            }
            Command::CloseSocket { socket_id } => {
                self.closing_sockets.insert(socket_id);
                for pipe in self.pipes.values_mut() {
                    if pipe.socket_id() == socket_id {
                        pipe.begin_closing();
                    }
                }
                self.listeners.retain(|_, l| l.shared.id != socket_id);
            }
            Command::Shutdown => return true,
        }
        false
    }

    fn accept_all(&mut self, token: Token) -> io::Result<()> {
        let Some(listener) = self.listeners.get(&token) else { return Ok(()) };
        loop {
            match listener.listener.accept() {
                Ok((mut stream, addr)) => {
                    let child_token = self.next_token();
                    self.poll.registry().register(&mut stream, child_token, Interest::READABLE | Interest::WRITABLE)?;
                    let shared = self.listeners[&token].shared.clone();
                    self.pipes.insert(child_token, TcpPipe::accepted(child_token, stream, shared, addr));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn service_readiness(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(pipe) = self.pipes.get_mut(&token) else { return };
        let mut broken = false;

        if writable {
            if let Err(e) = pipe.writable() {
                log::debug!("pipe {:?} write error: {e}", token);
                broken = true;
            }
        }
        if !broken && readable {
            if let Err(e) = pipe.readable() {
                log::debug!("pipe {:?} read error: {e}", token);
                broken = true;
            }
        }

        if broken {
            self.teardown_pipe(token);
        }
    }

    fn teardown_pipe(&mut self, token: Token) {
        if let Some(mut pipe) = self.pipes.remove(&token) {
            let is_connector = pipe.is_connector();
            let addr = pipe.peer_addr();
            let shared = pipe.shared_socket();
            let reconnect_interval = shared.options.reconnect_interval;
            let shared_id = shared.id;
            pipe.finish();

            if is_connector && !self.closing_sockets.contains(&shared_id) {
                log::debug!("scheduling reconnect to {addr}");
                self.pending_reconnects.push(PendingReconnect { at: Instant::now() + reconnect_interval, shared, addr });
            }
        }
    }

    fn tick(&mut self) {
        let mut to_teardown = Vec::new();
        for (token, pipe) in self.pipes.iter_mut() {
            if pipe.state() == crate::pipe::PipeState::Closing && pipe.close_linger_elapsed() {
                to_teardown.push(*token);
            }
        }
        for token in to_teardown {
            if let Some(mut pipe) = self.pipes.remove(&token) {
                pipe.finish();
            }
        }

        let now = Instant::now();
        let due: Vec<PendingReconnect> = {
            let mut due = Vec::new();
            self.pending_reconnects.retain(|r| {
                if now >= r.at {
                    due.push(PendingReconnect { at: r.at, shared: r.shared.clone(), addr: r.addr });
                    false
                } else {
                    true
                }
            });
            due
        };
        for reconnect in due {
            if self.closing_sockets.contains(&reconnect.shared.id) {
                continue;
            }
            if let Err(e) = self.handle_connect(reconnect.shared.clone(), reconnect.addr) {
                log::debug!("reconnect to {} failed: {e}", reconnect.addr);
                let reconnect_interval = reconnect.shared.options.reconnect_interval;
                self.pending_reconnects.push(PendingReconnect {
                    at: Instant::now() + reconnect_interval,
                    shared: reconnect.shared,
                    addr: reconnect.addr,
                });
            }
        }
    }

    fn run(mut self) {
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, Some(TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("reactor poll failed: {e}");
                return;
            }

            let tokens: Vec<(Token, bool, bool)> =
                self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

            for (token, readable, writable) in tokens {
                if self.listeners.contains_key(&token) {
                    if let Err(e) = self.accept_all(token) {
                        log::debug!("accept error: {e}");
                    }
                } else {
                    self.service_readiness(token, readable, writable);
                }
            }

            loop {
                match self.commands.try_recv() {
                    Ok(command) => {
                        if self.handle_command(command) {
                            return;
                        }
                    }
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => return,
                }
            }

            self.tick();
        }
    }
}

/// Spawns the reactor thread and returns a handle to it plus the join
/// handle (kept by `Session` so the thread is joined on drop).
pub fn spawn() -> io::Result<(ReactorHandle, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel();
    let reactor = Reactor::new(rx)?;
    let join = thread::Builder::new()
        .name("nitromq-reactor".into())
        .spawn(move || reactor.run())
        .expect("failed to spawn reactor thread");
    Ok((ReactorHandle { tx }, join))
}
