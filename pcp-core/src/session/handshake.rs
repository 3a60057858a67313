//! HELO/OLEH/QUIT construction and parsing.

use {
    crate::{
        atom::{
            define::{name, quit, PCP_VERSION},
            Atom,
        },
        utils::{BroadcastId, SessionId},
        AGENT,
    },
    std::net::IpAddr,
};

/// How a `HELO` advertises the sender's listen port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeloPort {
    /// Known to be reachable on this port.
    Port(u16),
    /// Reachability unknown; the receiver should probe this port.
    Ping(u16),
    None,
}

#[must_use]
pub fn build_helo(session_id: SessionId, port: HeloPort, broadcast_id: Option<BroadcastId>) -> Atom {
    let mut children = vec![
        Atom::with_string(name::HELO_AGENT, AGENT),
        Atom::with_id(name::HELO_SESSION_ID, session_id),
        Atom::with_u32(name::HELO_VERSION, PCP_VERSION),
    ];
    match port {
        HeloPort::Port(port) => children.push(Atom::with_u16(name::HELO_PORT, port)),
        HeloPort::Ping(port) => children.push(Atom::with_u16(name::HELO_PING, port)),
        HeloPort::None => {}
    }
    if let Some(broadcast_id) = broadcast_id {
        children.push(Atom::with_id(name::HELO_BCID, broadcast_id));
    }
    Atom::with_children(name::HELO, children)
}

/// `OLEH` telling the peer the address we saw it connect from and the port we
/// confirmed it listens on (0 when unconfirmed).
#[must_use]
pub fn build_oleh(session_id: SessionId, remote_ip: Option<IpAddr>, port: u16) -> Atom {
    let mut children = vec![
        Atom::with_string(name::HELO_AGENT, AGENT),
        Atom::with_id(name::HELO_SESSION_ID, session_id),
        Atom::with_u32(name::HELO_VERSION, PCP_VERSION),
    ];
    if let Some(ip) = remote_ip {
        children.push(Atom::with_ip(name::HELO_REMOTE_IP, ip));
    }
    children.push(Atom::with_u16(name::HELO_PORT, port));
    Atom::with_children(name::OLEH, children)
}

#[must_use]
pub fn build_quit(code: u32) -> Atom {
    Atom::with_u32(name::QUIT, code)
}

#[must_use]
pub fn build_connect() -> Atom {
    Atom::with_u32(name::CONNECT, crate::atom::define::PCP_CONNECT_VERSION)
}

/// Fields of a received `HELO` or `OLEH`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Greeting {
    pub agent: Option<String>,
    pub session_id: Option<SessionId>,
    pub version: Option<u32>,
    pub port: Option<u16>,
    pub ping: Option<u16>,
    pub remote_ip: Option<IpAddr>,
    pub broadcast_id: Option<BroadcastId>,
}

impl Greeting {
    #[must_use]
    pub fn parse(atom: &Atom) -> Self {
        Self {
            agent: atom.get_string(name::HELO_AGENT),
            session_id: atom.get_id(name::HELO_SESSION_ID),
            version: atom.get_u32(name::HELO_VERSION),
            port: atom.get_u16(name::HELO_PORT),
            ping: atom.get_u16(name::HELO_PING),
            remote_ip: atom.get_ip(name::HELO_REMOTE_IP),
            broadcast_id: atom.get_id(name::HELO_BCID),
        }
    }
}

/// `QUIT` value for a connection refused because the peer looped back to us.
pub const QUIT_LOOPBACK: u32 = quit::QUIT + quit::LOOPBACK;
/// `QUIT` value for a peer that never identified itself.
pub const QUIT_NOT_IDENTIFIED: u32 = quit::QUIT + quit::NOT_IDENTIFIED;
/// `QUIT` value closing a relay-full response.
pub const QUIT_UNAVAILABLE: u32 = quit::QUIT + quit::UNAVAILABLE;
pub const QUIT_SHUTDOWN: u32 = quit::QUIT + quit::SHUTDOWN;
pub const QUIT_OFF_AIR: u32 = quit::QUIT + quit::OFF_AIR;
