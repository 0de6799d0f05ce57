//! TCP network front end
//!
//! `TcpNetwork` is the application-facing object: lifecycle, the blocking
//! `send` round-trip, and counter snapshots. All real work happens on the
//! two service threads it starts; this type only holds their handles.

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tracing::{debug, info};

use weir_core::{Handler, NetConfig, Network, NetworkStats, PeerName, WeirResult};
use weir_reactor::{Reactor, ReactorHandle};

use crate::conn::Origin;
use crate::delivery::{DeliveryThread, Inbox};
use crate::net::{Command, NetCore};

/// TCP implementation of [`Network`]. One reactor thread owns the sockets,
/// one delivery thread runs the handler; `send` is safe from any thread,
/// including from inside handler callbacks.
pub struct TcpNetwork {
    listen_addr: SocketAddr,
    config: NetConfig,
    state: Mutex<Option<Running>>,
}

struct Running {
    reactor: ReactorHandle<Command>,
    delivery: DeliveryThread,
    local_addr: SocketAddr,
}

impl TcpNetwork {
    /// A network that will listen on `addr` once started. Port 0 requests
    /// an ephemeral port, visible through [`TcpNetwork::local_addr`] after
    /// `start`.
    pub fn bind(addr: SocketAddr, config: NetConfig) -> TcpNetwork {
        TcpNetwork {
            listen_addr: addr,
            config,
            state: Mutex::new(None),
        }
    }

    /// The bound listen address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|r| r.local_addr)
    }

    /// Names of the peers currently in the table, sorted.
    pub fn peers(&self) -> Vec<String> {
        let Some(reactor) = self.reactor() else {
            return Vec::new();
        };
        let (tx, rx) = mpsc::channel();
        if !reactor.send(Command::Peers { reply: tx }) {
            return Vec::new();
        }
        rx.recv().unwrap_or_default()
    }

    fn reactor(&self) -> Option<ReactorHandle<Command>> {
        self.state.lock().as_ref().map(|r| r.reactor.clone())
    }
}

impl Network for TcpNetwork {
    fn start(&self, handler: Arc<dyn Handler>) -> WeirResult<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.listen_addr)?;
        let local_addr = listener.local_addr()?;

        let reactor = Reactor::new(self.config.housekeeping_interval)?;
        let registry = reactor.registry()?;
        let inbox = Inbox::new(self.config.max_input_queue);
        let core = NetCore::new(registry, listener, self.config.clone(), Arc::clone(&inbox))?;
        let reactor = reactor.spawn("weir-reactor", core)?;
        let delivery = match DeliveryThread::spawn(inbox, handler, reactor.clone()) {
            Ok(d) => d,
            Err(e) => {
                reactor.stop();
                return Err(e);
            }
        };

        info!(addr = %local_addr, "network started");
        *state = Some(Running {
            reactor,
            delivery,
            local_addr,
        });
        Ok(())
    }

    fn stop(&self) {
        let taken = self.state.lock().take();
        let Some(running) = taken else {
            return;
        };
        info!(addr = %running.local_addr, "network stopping");
        // Reactor first: its shutdown closes every connection and flushes
        // pending notifications into the inbox before delivery drains out.
        running.reactor.stop();
        running.delivery.stop();
    }

    fn send(&self, peer: &str, message: &[u8]) -> bool {
        let Some(reactor) = self.reactor() else {
            return false;
        };
        let name = match PeerName::normalize(peer, self.config.default_port) {
            Ok(name) => name,
            Err(e) => {
                debug!(peer, error = %e, "unusable peer name");
                return false;
            }
        };
        // Resolution happens here on the caller's thread; the reactor never
        // waits on DNS.
        let addr = match name.resolve() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(peer = %name, error = %e, "peer does not resolve");
                return false;
            }
        };
        let (tx, rx) = mpsc::channel();
        let command = Command::Send {
            peer: name,
            addr,
            payload: Bytes::copy_from_slice(message),
            reply: tx,
        };
        if !reactor.send(command) {
            return false;
        }
        rx.recv().unwrap_or(false)
    }

    fn stats(&self) -> NetworkStats {
        let Some(reactor) = self.reactor() else {
            return NetworkStats::default();
        };
        let (tx, rx) = mpsc::channel();
        if !reactor.send(Command::Stats { reply: tx }) {
            return NetworkStats::default();
        }
        rx.recv().unwrap_or_default()
    }
}

impl Drop for TcpNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Canonical descriptor of one TCP connection for the duplicate tie-break.
/// Initiator address first, so both endpoints of both racing connections
/// derive identical strings and agree on a loser without negotiating.
pub(crate) fn race_descriptor(origin: Origin, local: SocketAddr, remote: SocketAddr) -> String {
    match origin {
        Origin::Outbound => format!("{local}|{remote}"),
        Origin::Inbound => format!("{remote}|{local}"),
    }
}

/// The lexicographically greater descriptor loses.
pub(crate) fn loses_race(candidate: &str, against: &str) -> bool {
    candidate > against
}

/// Socket options from the config, applied to accepted and dialed streams
/// alike. Failures are reported but not fatal.
pub(crate) fn apply_socket_options(stream: &TcpStream, config: &NetConfig) -> io::Result<()> {
    stream.set_nodelay(config.no_delay)?;
    if let Some(period) = config.keep_alive {
        let sock = SockRef::from(stream);
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(period))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl Handler for NullHandler {
        fn on_message(&self, _peer: &str, _message: &[u8]) -> WeirResult<()> {
            Ok(())
        }

        fn on_output_empty(&self, _peer: &str) -> WeirResult<()> {
            Ok(())
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_descriptors_match_across_endpoints() {
        // Connection dialed from a:50001 to b's listener on 9001.
        let a_view = race_descriptor(Origin::Outbound, addr("10.0.0.1:50001"), addr("10.0.0.2:9001"));
        let b_view = race_descriptor(Origin::Inbound, addr("10.0.0.2:9001"), addr("10.0.0.1:50001"));
        assert_eq!(a_view, b_view);
        assert_eq!(a_view, "10.0.0.1:50001|10.0.0.2:9001");
    }

    #[test]
    fn test_exactly_one_connection_loses() {
        // Simultaneous connect: c1 dialed by a, c2 dialed by b.
        let c1 = race_descriptor(Origin::Outbound, addr("10.0.0.1:50001"), addr("10.0.0.2:9001"));
        let c2 = race_descriptor(Origin::Outbound, addr("10.0.0.2:50002"), addr("10.0.0.1:9001"));
        assert_ne!(c1, c2);
        assert_ne!(loses_race(&c1, &c2), loses_race(&c2, &c1));
    }

    #[test]
    fn test_start_stop_idempotent() {
        let net = TcpNetwork::bind(addr("127.0.0.1:0"), NetConfig::small());
        let handler = Arc::new(NullHandler);
        net.start(handler.clone()).unwrap();
        net.start(handler).unwrap();
        let bound = net.local_addr().expect("running network has an address");
        assert_ne!(bound.port(), 0);

        net.stop();
        net.stop();
        assert!(net.local_addr().is_none());
        assert!(!net.send("127.0.0.1:1", b"x"), "stopped network rejects sends");
    }
}
