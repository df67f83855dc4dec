//! Socket nodes and endpoint typing.
//!
//! A node owns one protocol control block and counts the open handles that
//! reference it. Protocol-specific behavior lives behind the [`Socket`]
//! variant so every dispatch site is an exhaustive match.

use std::fmt;

use crate::event::Interest;
use crate::tcp::{TcpSocket, TcpState};
use crate::udp::UdpSocket;

/// Namespace protocol directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    pub fn name(self) -> &'static str {
        match self {
            Proto::Tcp => "tcp",
            Proto::Udp => "udp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Proto::Tcp),
            "udp" => Some(Proto::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Socket identifier: the name segment under a protocol directory.
///
/// Chosen by collision-checked random draw so live identifiers do not reveal
/// how many sockets have ever been created. Rendered in decimal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SockId(pub u32);

impl fmt::Display for SockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The operation-specific views of a socket, each a distinct addressable
/// endpoint. Which kinds exist depends on the protocol and, for TCP, the
/// lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    /// Namespace-level allocation endpoint, not a view of one node.
    NewSocket,
    Bind,
    Connect,
    Listen,
    Accept,
    Data,
    Local,
    Remote,
    /// UDP: sender of the next queued datagram, without consuming it.
    From,
    /// UDP: set the default destination.
    To,
}

impl EndpointKind {
    pub fn name(self) -> &'static str {
        match self {
            EndpointKind::NewSocket => "new_socket",
            EndpointKind::Bind => "bind",
            EndpointKind::Connect => "connect",
            EndpointKind::Listen => "listen",
            EndpointKind::Accept => "accept",
            EndpointKind::Data => "data",
            EndpointKind::Local => "local",
            EndpointKind::Remote => "remote",
            EndpointKind::From => "from",
            EndpointKind::To => "to",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "new_socket" => EndpointKind::NewSocket,
            "bind" => EndpointKind::Bind,
            "connect" => EndpointKind::Connect,
            "listen" => EndpointKind::Listen,
            "accept" => EndpointKind::Accept,
            "data" => EndpointKind::Data,
            "local" => EndpointKind::Local,
            "remote" => EndpointKind::Remote,
            "from" => EndpointKind::From,
            "to" => EndpointKind::To,
            _ => return None,
        })
    }

    /// Which progress signals wake a handle of this kind.
    pub fn interest(self) -> Interest {
        match self {
            EndpointKind::Data => Interest::DATA_READ | Interest::DATA_WRITE,
            EndpointKind::Accept => Interest::ACCEPT,
            EndpointKind::Connect => Interest::CONNECT,
            EndpointKind::Local => Interest::ADDR,
            EndpointKind::Remote => Interest::ADDR | Interest::SENDER,
            EndpointKind::From => Interest::SENDER,
            EndpointKind::NewSocket
            | EndpointKind::Bind
            | EndpointKind::Listen
            | EndpointKind::To => Interest::empty(),
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol body of a node.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpSocket),
    Udp(UdpSocket),
}

impl Socket {
    pub fn proto(&self) -> Proto {
        match self {
            Socket::Tcp(_) => Proto::Tcp,
            Socket::Udp(_) => Proto::Udp,
        }
    }

    /// Whether backing resources may be released once unreferenced.
    /// UDP sockets have no terminal state; they are released by unlink.
    pub fn is_terminal(&self) -> bool {
        match self {
            Socket::Tcp(t) => t.state().is_terminal(),
            Socket::Udp(_) => false,
        }
    }

    /// Report a pending engine fault exactly once.
    pub fn take_fault(&mut self) -> bool {
        match self {
            Socket::Tcp(t) => t.take_fault(),
            Socket::Udp(u) => u.take_fault(),
        }
    }
}

/// One live socket in a protocol directory.
#[derive(Debug)]
pub struct SocketNode {
    pub id: SockId,
    /// Open endpoint handles referencing this node.
    pub refs: u32,
    /// Unlinked: the identifier is already invalid, release is deferred
    /// until the last handle closes.
    pub gone: bool,
    pub sock: Socket,
}

impl SocketNode {
    pub fn new(id: SockId, sock: Socket) -> Self {
        SocketNode {
            id,
            refs: 0,
            gone: false,
            sock,
        }
    }

    pub fn proto(&self) -> Proto {
        self.sock.proto()
    }

    pub fn can_release(&self) -> bool {
        self.refs == 0 && (self.gone || self.sock.is_terminal())
    }

    /// Is `kind` openable on this node right now?
    pub fn kind_legal(&self, kind: EndpointKind) -> bool {
        use EndpointKind::*;
        match &self.sock {
            Socket::Tcp(t) => match t.state() {
                TcpState::New => matches!(kind, Bind),
                TcpState::Bound => matches!(kind, Connect | Listen | Local),
                TcpState::Connecting => matches!(kind, Connect | Data | Local | Remote),
                TcpState::Listening => matches!(kind, Accept | Local),
                TcpState::Ready | TcpState::Closing => matches!(kind, Data | Local | Remote),
                TcpState::Closed => matches!(kind, Data),
            },
            Socket::Udp(_) => matches!(kind, Bind | Connect | Data | Local | Remote | From | To),
        }
    }

    /// The endpoint kinds a directory listing of this node shows, in
    /// canonical order.
    pub fn endpoint_kinds(&self) -> Vec<EndpointKind> {
        use EndpointKind::*;
        [Bind, Connect, Listen, Accept, Data, Local, Remote, From, To]
            .into_iter()
            .filter(|&k| self.kind_legal(k))
            .collect()
    }

    /// Can a handle of this kind make progress right now? Used to answer a
    /// registration that raced with the event it was waiting for.
    pub fn kind_ready(&self, kind: EndpointKind) -> bool {
        use EndpointKind::*;
        match &self.sock {
            Socket::Tcp(t) => match kind {
                Data => t.has_rx() || matches!(t.state(), TcpState::Closing | TcpState::Closed),
                Accept => t.has_pending(),
                Connect => matches!(
                    t.state(),
                    TcpState::Ready | TcpState::Closing | TcpState::Closed
                ),
                Local => t.local().is_some(),
                Remote => t.peer().is_some(),
                _ => false,
            },
            Socket::Udp(u) => match kind {
                Data => u.has_queued() || u.is_closed(),
                Remote | From => u.has_queued(),
                Local => u.local().is_some(),
                _ => false,
            },
        }
    }
}
