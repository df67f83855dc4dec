//! TCP socket lifecycle.
//!
//! A socket moves `New -> Bound -> {Connecting | Listening} -> Ready ->
//! Closing -> Closed`. Reset or fatal failure jumps straight to `Closed`
//! from any state and discards buffers. The methods here are pure state:
//! engine calls and notification routing happen in the dispatch layer, which
//! applies engine events through the `on_*` handlers below and signals the
//! [`Interest`] they return.

use std::collections::VecDeque;
use std::net::SocketAddrV4;

use bytes::{Bytes, BytesMut};

use crate::engine::ConnId;
use crate::event::Interest;
use crate::utils::Progress;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    New,
    Bound,
    Connecting,
    Listening,
    Ready,
    Closing,
    Closed,
}

impl TcpState {
    /// Terminal states allow the node's backing resources to be released
    /// once the last handle closes.
    pub fn is_terminal(self) -> bool {
        matches!(self, TcpState::Closed)
    }
}

#[derive(Debug)]
pub struct TcpSocket {
    /// Engine control block; taken on reset, released on node teardown.
    pub conn: Option<ConnId>,
    state: TcpState,
    local: Option<SocketAddrV4>,
    peer: Option<SocketAddrV4>,
    /// Received stream bytes not yet read.
    rx: BytesMut,
    /// Reset seen but not yet reported to a caller.
    fault: bool,
    /// Pending-connection queue, present only while listening.
    backlog: Option<Backlog>,
}

#[derive(Debug)]
struct Backlog {
    limit: usize,
    queue: VecDeque<TcpSocket>,
}

impl TcpSocket {
    pub fn new(conn: ConnId) -> Self {
        TcpSocket {
            conn: Some(conn),
            state: TcpState::New,
            local: None,
            peer: None,
            rx: BytesMut::new(),
            fault: false,
            backlog: None,
        }
    }

    /// A handshake-complete inbound connection, born `Ready`.
    pub fn accepted(conn: ConnId, local: SocketAddrV4, peer: SocketAddrV4) -> Self {
        TcpSocket {
            conn: Some(conn),
            state: TcpState::Ready,
            local: Some(local),
            peer: Some(peer),
            rx: BytesMut::new(),
            fault: false,
            backlog: None,
        }
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn local(&self) -> Option<SocketAddrV4> {
        self.local
    }

    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.peer
    }

    pub fn has_rx(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.backlog.as_ref().is_some_and(|b| !b.queue.is_empty())
    }

    /// Report a pending fault exactly once.
    pub fn take_fault(&mut self) -> bool {
        std::mem::take(&mut self.fault)
    }

    // Command-side transitions. The dispatch layer validates state before
    // calling the engine, then records the outcome here.

    pub fn note_bound(&mut self, local: SocketAddrV4) {
        debug_assert_eq!(self.state, TcpState::New);
        self.local = Some(local);
        self.state = TcpState::Bound;
    }

    pub fn note_connecting(&mut self) {
        debug_assert_eq!(self.state, TcpState::Bound);
        self.state = TcpState::Connecting;
    }

    pub fn note_listening(&mut self, limit: usize) {
        debug_assert_eq!(self.state, TcpState::Bound);
        self.state = TcpState::Listening;
        self.backlog = Some(Backlog {
            limit,
            queue: VecDeque::new(),
        });
    }

    // Event-side transitions.

    /// The outbound handshake completed.
    pub fn on_established(&mut self, local: SocketAddrV4, peer: SocketAddrV4) -> Interest {
        if self.state != TcpState::Connecting {
            return Interest::empty();
        }
        self.state = TcpState::Ready;
        self.local = Some(local);
        self.peer = Some(peer);
        Interest::CONNECT | Interest::ADDR | Interest::DATA_WRITE
    }

    /// Stream bytes arrived.
    pub fn on_data(&mut self, payload: &[u8]) -> Interest {
        match self.state {
            TcpState::Ready | TcpState::Closing => {
                self.rx.extend_from_slice(payload);
                Interest::DATA_READ
            }
            // Late data for a dead connection is dropped with its buffers.
            _ => Interest::empty(),
        }
    }

    /// The remote side half-closed. Readable until drained.
    pub fn on_peer_closed(&mut self) -> Interest {
        match self.state {
            TcpState::Ready => {
                self.state = if self.rx.is_empty() {
                    TcpState::Closed
                } else {
                    TcpState::Closing
                };
                Interest::DATA_READ
            }
            _ => Interest::empty(),
        }
    }

    /// Reset or fatal failure: straight to `Closed`, buffers discarded.
    /// The control block is dead; the caller owns removing its mapping.
    pub fn on_reset(&mut self) -> Interest {
        self.conn = None;
        self.state = TcpState::Closed;
        self.rx.clear();
        self.fault = true;
        Interest::all()
    }

    /// Serve a `data` read for the current state.
    pub fn read_data(&mut self, max: usize) -> Progress<Bytes> {
        match self.state {
            TcpState::Ready => {
                if self.rx.is_empty() {
                    Progress::Pending
                } else {
                    let n = max.min(self.rx.len());
                    Progress::Ready(self.rx.split_to(n).freeze())
                }
            }
            TcpState::Closing => {
                let n = max.min(self.rx.len());
                let chunk = self.rx.split_to(n).freeze();
                if self.rx.is_empty() {
                    self.state = TcpState::Closed;
                }
                Progress::Ready(chunk)
            }
            // End of stream: an empty success, never an error.
            TcpState::Closed => Progress::Ready(Bytes::new()),
            _ => Progress::Pending,
        }
    }

    /// Queue an inbound connection; hands it back if the queue is full.
    pub fn push_inbound(&mut self, child: TcpSocket) -> std::result::Result<(), TcpSocket> {
        match self.backlog.as_mut() {
            Some(b) if b.queue.len() < b.limit => {
                b.queue.push_back(child);
                Ok(())
            }
            _ => Err(child),
        }
    }

    /// Pop the oldest pending connection.
    pub fn pop_pending(&mut self) -> Option<TcpSocket> {
        self.backlog.as_mut().and_then(|b| b.queue.pop_front())
    }

    /// Find a queued pending connection by control block.
    pub fn pending_mut(&mut self, conn: ConnId) -> Option<&mut TcpSocket> {
        self.backlog
            .as_mut()
            .and_then(|b| b.queue.iter_mut().find(|c| c.conn == Some(conn)))
    }

    /// Remove a queued pending connection by control block.
    pub fn remove_pending(&mut self, conn: ConnId) -> Option<TcpSocket> {
        let b = self.backlog.as_mut()?;
        let at = b.queue.iter().position(|c| c.conn == Some(conn))?;
        b.queue.remove(at)
    }

    /// Drain the whole pending queue (listener teardown).
    pub fn drain_pending(&mut self) -> Vec<TcpSocket> {
        match self.backlog.as_mut() {
            Some(b) => b.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }
}
