//! Events reported by the protocol engine, and the interest masks that route
//! them to blocked endpoint handles.

use std::net::SocketAddrV4;

use bitflags::bitflags;
use bytes::Bytes;

use crate::engine::ConnId;

/// One engine-side occurrence, keyed by the control block it concerns.
///
/// Events are applied synchronously, in the order the engine produced them,
/// before whichever namespace call triggered the drain returns.
#[derive(Clone, Debug)]
pub enum Event {
    /// An outbound handshake completed; the connection is up.
    Established {
        conn: ConnId,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    },
    /// A handshake-complete inbound connection arrived on a listener.
    Inbound {
        listener: ConnId,
        conn: ConnId,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    },
    /// Stream bytes arrived on a TCP connection.
    Data { conn: ConnId, payload: Bytes },
    /// A datagram arrived on a UDP socket.
    Datagram {
        conn: ConnId,
        from: SocketAddrV4,
        payload: Bytes,
    },
    /// The transmit buffer drained enough to accept more data.
    SendSpace { conn: ConnId },
    /// The remote side half-closed; no more data will arrive.
    PeerClosed { conn: ConnId },
    /// Reset or fatal failure; the control block is dead.
    Reset { conn: ConnId },
}

impl Event {
    /// The control block this event concerns.
    pub fn conn(&self) -> ConnId {
        match *self {
            Event::Established { conn, .. }
            | Event::Data { conn, .. }
            | Event::Datagram { conn, .. }
            | Event::SendSpace { conn }
            | Event::PeerClosed { conn }
            | Event::Reset { conn } => conn,
            Event::Inbound { listener, .. } => listener,
        }
    }
}

bitflags! {
    /// What kind of progress a state change enables.
    ///
    /// Each endpoint kind listens for a subset of these; each applied event
    /// produces the set it may have unblocked.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interest: u8 {
        #[doc = "Buffered stream data or a queued datagram became readable"]
        const DATA_READ  = 1 << 0;
        #[doc = "Transmit capacity became available"]
        const DATA_WRITE = 1 << 1;
        #[doc = "A pending connection became acceptable"]
        const ACCEPT     = 1 << 2;
        #[doc = "A connect attempt resolved"]
        const CONNECT    = 1 << 3;
        #[doc = "A local or remote address became known"]
        const ADDR       = 1 << 4;
        #[doc = "The sender of the head datagram became visible"]
        const SENDER     = 1 << 5;
    }
}
