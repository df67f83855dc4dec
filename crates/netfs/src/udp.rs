//! UDP socket state: a bounded queue of received datagrams and a remembered
//! default destination. No handshake, no lifecycle beyond bound/unbound.

use std::collections::VecDeque;
use std::net::SocketAddrV4;

use bytes::Bytes;

use crate::engine::ConnId;

/// One received datagram awaiting delivery.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub from: SocketAddrV4,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct UdpSocket {
    /// Engine control block; taken on reset, released on node teardown.
    pub conn: Option<ConnId>,
    local: Option<SocketAddrV4>,
    /// Default destination, set by `connect` or `to`.
    dest: Option<SocketAddrV4>,
    queue: VecDeque<Datagram>,
    limit: usize,
    dropped: u64,
    fault: bool,
}

impl UdpSocket {
    pub fn new(conn: ConnId, limit: usize) -> Self {
        UdpSocket {
            conn: Some(conn),
            local: None,
            dest: None,
            queue: VecDeque::new(),
            limit,
            dropped: 0,
            fault: false,
        }
    }

    pub fn local(&self) -> Option<SocketAddrV4> {
        self.local
    }

    pub fn dest(&self) -> Option<SocketAddrV4> {
        self.dest
    }

    pub fn note_bound(&mut self, local: SocketAddrV4) {
        self.local = Some(local);
    }

    pub fn set_dest(&mut self, dest: SocketAddrV4) {
        self.dest = Some(dest);
    }

    pub fn is_bound(&self) -> bool {
        self.local.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Queue a received datagram. `false` means the queue was full and the
    /// datagram was dropped; UDP makes no delivery promise, so dropping is
    /// acceptable, but callers log it.
    pub fn push(&mut self, datagram: Datagram) -> bool {
        if self.queue.len() >= self.limit {
            self.dropped += 1;
            return false;
        }
        self.queue.push_back(datagram);
        true
    }

    /// Pop the oldest datagram.
    pub fn pop(&mut self) -> Option<Datagram> {
        self.queue.pop_front()
    }

    /// Sender of the oldest datagram, without consuming it.
    pub fn peek_from(&self) -> Option<SocketAddrV4> {
        self.queue.front().map(|d| d.from)
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Datagrams dropped at the queue limit since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Report a pending fault exactly once.
    pub fn take_fault(&mut self) -> bool {
        std::mem::take(&mut self.fault)
    }

    /// The engine declared the control block dead.
    pub fn on_reset(&mut self) {
        self.conn = None;
        self.queue.clear();
        self.fault = true;
    }
}
