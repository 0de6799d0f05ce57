//! Peer naming and normalization
//!
//! Peers are addressed by strings of the form `host[:port]`. Before any
//! table lookup the name is normalized: the host is case-folded and a
//! missing port is filled in from the configured default, so distinct
//! spellings of one endpoint collapse onto one peer-table entry.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crate::{WeirError, WeirResult};

/// Normalized peer name: lowercased host plus an explicit port, rendered as
/// `host:port` (IPv6 hosts bracketed).
///
/// Cloning is cheap; one allocation is shared between the peer table, the
/// delivery inbox, and log fields.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerName(Arc<str>);

impl PeerName {
    /// Normalize a raw `host[:port]` name. A missing port is filled from
    /// `default_port`; with `default_port == 0` names must carry their own.
    pub fn normalize(raw: &str, default_port: u16) -> WeirResult<PeerName> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(WeirError::InvalidPeer(raw.into()));
        }
        let (host, port) = split_host_port(raw)?;
        let port = match port {
            Some(p) => p,
            None if default_port != 0 => default_port,
            None => return Err(WeirError::InvalidPeer(raw.into())),
        };
        if host.is_empty() {
            return Err(WeirError::InvalidPeer(raw.into()));
        }
        let host = host.to_ascii_lowercase();
        let name = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Ok(PeerName(name.into()))
    }

    /// Peer identity for an inbound connection: the remote IP joined with
    /// the default port when one is configured, otherwise the remote's own
    /// port. Matches what `normalize` produces for the same endpoint, which
    /// is what makes duplicate-connection detection possible.
    pub fn from_remote(addr: SocketAddr, default_port: u16) -> PeerName {
        let port = if default_port != 0 {
            default_port
        } else {
            addr.port()
        };
        PeerName(SocketAddr::new(addr.ip(), port).to_string().into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve the name to a socket address (first result wins). May block
    /// on DNS; callers invoke this on their own thread, never the reactor's.
    pub fn resolve(&self) -> WeirResult<SocketAddr> {
        self.0
            .as_ref()
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| WeirError::Unresolvable(self.0.to_string()))
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({})", self.0)
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Split `host[:port]`, accepting bracketed and bare IPv6 literals.
fn split_host_port(raw: &str) -> WeirResult<(&str, Option<u16>)> {
    if let Some(rest) = raw.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| WeirError::InvalidPeer(raw.into()))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, None));
        }
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| WeirError::InvalidPeer(raw.into()))?;
        return Ok((host, Some(port)));
    }
    match raw.rfind(':') {
        // More than one colon without brackets: a bare IPv6 address
        Some(_) if raw.matches(':').count() > 1 => Ok((raw, None)),
        Some(idx) => {
            let port = raw[idx + 1..]
                .parse()
                .map_err(|_| WeirError::InvalidPeer(raw.into()))?;
            Ok((&raw[..idx], Some(port)))
        }
        None => Ok((raw, None)),
    }
}
