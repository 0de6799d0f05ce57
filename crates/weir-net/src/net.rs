//! Reactor driver: peer table, accept loop, and command execution
//!
//! `NetCore` is the single owner of every connection and of the peer table
//! that maps canonical names onto them. It runs inside the reactor thread;
//! other threads talk to it exclusively through [`Command`] values, so none
//! of its state needs a lock.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};
use tracing::{debug, info, trace, warn};

use weir_core::{CloseReason, NetConfig, NetworkStats, PeerName, WeirResult};
use weir_reactor::Drive;

use crate::conn::{Connection, Origin};
use crate::delivery::Inbox;
use crate::tcp;

/// Token of the listening socket.
pub(crate) const LISTENER_TOKEN: Token = Token(0);

/// First token handed to a connection; 0 is the listener, 1 the waker.
const CONNECTION_TOKEN_START: usize = 2;

/// Requests executed on the reactor thread on behalf of other threads.
pub(crate) enum Command {
    /// Find or create the peer's connection and enqueue one framed message.
    /// The verdict travels back over the reply channel.
    Send {
        peer: PeerName,
        addr: SocketAddr,
        payload: Bytes,
        reply: Sender<bool>,
    },
    /// The peer's input queue fell back under its cap; unthrottle reads.
    ResumeRead { peer: PeerName },
    /// Snapshot the transport counters.
    Stats { reply: Sender<NetworkStats> },
    /// List the current peer-table entries.
    Peers { reply: Sender<Vec<String>> },
}

/// Outcome of a simultaneous-connect tie-break.
enum RaceOutcome {
    KeepExisting,
    ReplaceExisting,
}

pub(crate) struct NetCore {
    registry: Registry,
    listener: TcpListener,
    /// Listener deregistered because the table is full.
    accept_paused: bool,
    conns: HashMap<Token, Connection>,
    peers: HashMap<PeerName, Token>,
    next_token: usize,
    config: NetConfig,
    inbox: Arc<Inbox>,
    stats: NetworkStats,
}

impl NetCore {
    pub fn new(
        registry: Registry,
        mut listener: TcpListener,
        config: NetConfig,
        inbox: Arc<Inbox>,
    ) -> WeirResult<NetCore> {
        registry.register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        Ok(NetCore {
            registry,
            listener,
            accept_paused: false,
            conns: HashMap::new(),
            peers: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            config,
            inbox,
            stats: NetworkStats::default(),
        })
    }

    /// Next unused connection token, wrapping past the reserved slots.
    fn alloc_token(&mut self) -> Token {
        loop {
            let candidate = Token(self.next_token);
            self.next_token = match self.next_token.checked_add(1) {
                Some(n) => n,
                None => CONNECTION_TOKEN_START,
            };
            if !self.conns.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    // ---- accept path ----

    fn on_acceptable(&mut self) {
        loop {
            if self.peers.len() >= self.config.max_connections {
                self.pause_accept();
                return;
            }
            match self.listener.accept() {
                Ok((stream, remote)) => self.admit(stream, remote),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, remote: SocketAddr) {
        if let Err(e) = tcp::apply_socket_options(&stream, &self.config) {
            debug!(addr = %remote, error = %e, "socket option setup failed");
        }
        let peer = PeerName::from_remote(remote, self.config.default_port);

        // A live entry for the same identity means both sides connected at
        // once; exactly one of the two connections may survive.
        if let Some(&existing) = self.peers.get(&peer) {
            match self.resolve_duplicate(existing, &stream, remote) {
                RaceOutcome::KeepExisting => {
                    info!(peer = %peer, addr = %remote,
                        "inbound connection lost the duplicate tie-break");
                    // Dropped without ever touching the table.
                    return;
                }
                RaceOutcome::ReplaceExisting => {
                    info!(peer = %peer,
                        "existing connection lost the duplicate tie-break");
                    self.close_connection(existing, CloseReason::DuplicateConnection);
                }
            }
        }

        let token = self.alloc_token();
        match Connection::inbound(peer.clone(), token, stream, remote, &self.registry, &self.config)
        {
            Ok(conn) => {
                self.conns.insert(token, conn);
                self.peers.insert(peer.clone(), token);
                self.inbox.open_slot(&peer);
                self.stats.connections_opened += 1;
                info!(peer = %peer, addr = %remote, "inbound connection established");
            }
            Err(e) => warn!(peer = %peer, error = %e, "failed to register accepted stream"),
        }
    }

    /// Decide which of two connections to the same peer survives. Both
    /// endpoints order the two connections by the same canonical descriptor
    /// strings, so they independently pick the same loser.
    fn resolve_duplicate(
        &self,
        existing: Token,
        new_stream: &TcpStream,
        new_remote: SocketAddr,
    ) -> RaceOutcome {
        let Some(existing_conn) = self.conns.get(&existing) else {
            return RaceOutcome::ReplaceExisting;
        };
        if existing_conn.origin == Origin::Inbound {
            // Same origin on both: no symmetric race, the newer one simply
            // supersedes a connection the peer has abandoned.
            return RaceOutcome::ReplaceExisting;
        }
        let addrs = (new_stream.local_addr().ok(), existing_conn.local_addr());
        let (Some(new_local), Some(existing_local)) = addrs else {
            warn!(peer = %existing_conn.peer,
                "could not build tie-break descriptors, keeping existing connection");
            return RaceOutcome::KeepExisting;
        };
        let existing_desc =
            tcp::race_descriptor(Origin::Outbound, existing_local, existing_conn.remote_addr());
        let new_desc = tcp::race_descriptor(Origin::Inbound, new_local, new_remote);
        trace!(existing = %existing_desc, new = %new_desc, "duplicate tie-break");
        if tcp::loses_race(&new_desc, &existing_desc) {
            RaceOutcome::KeepExisting
        } else {
            RaceOutcome::ReplaceExisting
        }
    }

    fn pause_accept(&mut self) {
        if self.accept_paused {
            return;
        }
        if let Err(e) = self.registry.deregister(&mut self.listener) {
            warn!(error = %e, "failed to disable accepting");
            return;
        }
        self.accept_paused = true;
        debug!(
            limit = self.config.max_connections,
            "connection limit reached, accepting disabled"
        );
    }

    fn resume_accept(&mut self) {
        if let Err(e) = self
            .registry
            .register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)
        {
            warn!(error = %e, "failed to re-enable accepting");
            return;
        }
        self.accept_paused = false;
        debug!("accepting re-enabled");
        // Connections may have parked in the backlog meanwhile.
        self.on_acceptable();
    }

    // ---- connection readiness ----

    fn on_conn_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let mut fate: Option<CloseReason> = None;
        let mut drained = false;
        {
            let Some(conn) = self.conns.get_mut(&token) else {
                // Closed earlier in this poll pass.
                return;
            };
            if conn.is_connecting() {
                if !writable {
                    return;
                }
                match conn.complete_connect() {
                    Ok(()) => {
                        info!(peer = %conn.peer, addr = %conn.remote_addr(),
                            "outbound connection established");
                        // Flush whatever queued while the connect was in
                        // flight.
                        match conn.on_writable(&mut self.stats) {
                            Ok(d) => drained = d,
                            Err(reason) => fate = Some(reason),
                        }
                    }
                    Err(reason) => fate = Some(reason),
                }
            } else {
                if readable {
                    if let Err(reason) = conn.on_readable(&self.inbox, &mut self.stats) {
                        fate = Some(reason);
                    }
                }
                if fate.is_none() && writable {
                    match conn.on_writable(&mut self.stats) {
                        Ok(d) => drained = d,
                        Err(reason) => fate = Some(reason),
                    }
                }
            }
            if fate.is_none() {
                if drained {
                    self.inbox.arm_output_empty(&conn.peer);
                }
                if let Err(e) = conn.sync_interest(&self.registry) {
                    fate = Some(CloseReason::Io(e));
                }
            }
        }
        if let Some(reason) = fate {
            self.close_connection(token, reason);
        }
    }

    /// Remove a connection and release everything attached to it. The
    /// delivery slot is closed only when the peer-table entry dies with the
    /// connection; a race loser that was already replaced leaves the slot
    /// to its successor.
    fn close_connection(&mut self, token: Token, reason: CloseReason) {
        let Some(mut conn) = self.conns.remove(&token) else {
            return;
        };
        conn.deregister(&self.registry);
        self.stats.connections_closed += 1;
        let flush_pending = conn.has_pending_output();
        info!(peer = %conn.peer, reason = %reason, "connection closed");

        match self.peers.get(&conn.peer) {
            Some(&t) if t == token => {
                self.peers.remove(&conn.peer);
                self.inbox.close_slot(&conn.peer, flush_pending);
            }
            _ => {
                if flush_pending {
                    self.inbox.arm_output_empty(&conn.peer);
                }
            }
        }
    }

    // ---- command execution ----

    fn exec_send(&mut self, peer: PeerName, addr: SocketAddr, payload: Bytes) -> bool {
        let token = match self.peers.get(&peer) {
            Some(&t) => t,
            None => match self.open_outbound(peer.clone(), addr) {
                Ok(t) => t,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "outbound connect failed");
                    return false;
                }
            },
        };
        let mut sync_err: Option<io::Error> = None;
        let accepted = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return false;
            };
            let accepted = conn.enqueue_output(&payload, self.config.max_output_queue);
            if accepted {
                trace!(peer = %peer, len = payload.len(), "message enqueued");
                if let Err(e) = conn.sync_interest(&self.registry) {
                    sync_err = Some(e);
                }
            } else {
                debug!(peer = %peer, len = payload.len(),
                    "output queue full, message rejected");
            }
            accepted
        };
        if let Some(e) = sync_err {
            // The message was queued; the close below flushes the pending
            // notification so the queued-then-lost case still signals.
            self.close_connection(token, CloseReason::Io(e));
        }
        accepted
    }

    fn open_outbound(&mut self, peer: PeerName, addr: SocketAddr) -> io::Result<Token> {
        if self.peers.len() >= self.config.max_connections {
            return Err(io::Error::other("connection limit reached"));
        }
        let stream = TcpStream::connect(addr)?;
        if let Err(e) = tcp::apply_socket_options(&stream, &self.config) {
            debug!(peer = %peer, error = %e, "socket option setup failed");
        }
        let token = self.alloc_token();
        let conn = Connection::outbound(peer.clone(), token, stream, addr, &self.registry, &self.config)?;
        self.conns.insert(token, conn);
        self.peers.insert(peer.clone(), token);
        self.inbox.open_slot(&peer);
        self.stats.connections_opened += 1;
        debug!(peer = %peer, addr = %addr, "outbound connect started");
        Ok(token)
    }

    fn exec_resume(&mut self, peer: PeerName) {
        let Some(&token) = self.peers.get(&peer) else {
            return;
        };
        self.unthrottle(token);
    }

    /// Clear the read pause and drain immediately. Readiness that fired
    /// while paused was dropped, so waiting for a fresh edge could stall
    /// the connection forever.
    fn unthrottle(&mut self, token: Token) {
        let mut fate: Option<CloseReason> = None;
        {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            if !conn.reads_paused() {
                return;
            }
            conn.resume_reads();
            trace!(peer = %conn.peer, "reads resumed");
            if let Err(reason) = conn.on_readable(&self.inbox, &mut self.stats) {
                fate = Some(reason);
            } else if let Err(e) = conn.sync_interest(&self.registry) {
                fate = Some(CloseReason::Io(e));
            }
        }
        if let Some(reason) = fate {
            self.close_connection(token, reason);
        }
    }
}

impl Drive for NetCore {
    type Command = Command;

    fn on_ready(&mut self, token: Token, readable: bool, writable: bool) {
        match token {
            LISTENER_TOKEN => self.on_acceptable(),
            token => self.on_conn_ready(token, readable, writable),
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send {
                peer,
                addr,
                payload,
                reply,
            } => {
                let accepted = self.exec_send(peer, addr, payload);
                if accepted {
                    self.stats.messages_out += 1;
                } else {
                    self.stats.sends_rejected += 1;
                }
                let _ = reply.send(accepted);
            }
            Command::ResumeRead { peer } => self.exec_resume(peer),
            Command::Stats { reply } => {
                let mut snapshot = self.stats.clone();
                snapshot.active_connections = self.peers.len();
                let _ = reply.send(snapshot);
            }
            Command::Peers { reply } => {
                let mut names: Vec<String> =
                    self.peers.keys().map(|p| p.as_str().to_string()).collect();
                names.sort();
                let _ = reply.send(names);
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        let expired: Vec<(Token, CloseReason)> = self
            .conns
            .iter()
            .filter_map(|(&t, c)| c.timed_out(now, &self.config).map(|r| (t, r)))
            .collect();
        for (token, reason) in expired {
            self.close_connection(token, reason);
        }

        if self.accept_paused && self.peers.len() < self.config.max_connections {
            self.resume_accept();
        }

        // Belt and braces for the read throttle: the delivery thread's
        // resume command is the fast path, this sweep recovers connections
        // whose command raced a close or got lost in shutdown.
        let throttled: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, c)| c.reads_paused())
            .map(|(&t, _)| t)
            .collect();
        for token in throttled {
            let resumable = self
                .conns
                .get(&token)
                .map(|c| !self.inbox.over_cap(&c.peer))
                .unwrap_or(false);
            if resumable {
                self.unthrottle(token);
            }
        }
    }

    fn on_stop(&mut self) {
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.close_connection(token, CloseReason::Shutdown);
        }
        if !self.accept_paused {
            let _ = self.registry.deregister(&mut self.listener);
        }
        debug!("network core shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_reactor::WAKER_TOKEN;

    #[test]
    fn test_token_layout() {
        assert_eq!(LISTENER_TOKEN, Token(0));
        assert_eq!(WAKER_TOKEN, Token(1));
        assert_eq!(CONNECTION_TOKEN_START, 2);
    }
}
