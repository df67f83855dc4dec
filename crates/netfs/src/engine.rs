//! The seam between the namespace and the protocol engine.
//!
//! The engine owns everything on the wire side: packet formats, checksums,
//! retransmission, routing. The namespace drives it through the [`Engine`]
//! trait and learns about progress by draining [`Event`]s from
//! [`Engine::poll_event`].
//!
//! Engines are callback-driven at heart: a call into the engine (a send, a
//! connect) may complete other work immediately, and the host's
//! I/O-completion source makes the engine produce events between namespace
//! calls as well. Instead of invoking callbacks, an engine implementation
//! queues an [`Event`] whenever something happens and hands the queue out
//! through `poll_event`. The namespace drains that queue after every call it
//! makes into the engine, so by the time any namespace operation returns,
//! every event the operation caused has already been applied.

use std::net::SocketAddrV4;

use crate::event::Event;
use crate::utils::Result;

/// Correlation key for one protocol control block inside the engine.
///
/// The engine allocates it at `tcp_open`/`udp_open` (or when reporting an
/// inbound connection) and tags every event with it. The namespace never
/// looks inside.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnId(pub u64);

pub trait Engine {
    /// Allocate a TCP control block.
    fn tcp_open(&mut self) -> Result<ConnId>;

    /// Bind the control block to a local address.
    fn tcp_bind(&mut self, conn: ConnId, local: SocketAddrV4) -> Result<()>;

    /// Start the handshake towards `remote`. Completion arrives as
    /// [`Event::Established`] (possibly before this call returns).
    fn tcp_connect(&mut self, conn: ConnId, remote: SocketAddrV4) -> Result<()>;

    /// Enter listening mode with the given backlog hint.
    fn tcp_listen(&mut self, conn: ConnId, backlog: u16) -> Result<()>;

    /// Queue stream data for transmission. Returns how many bytes the engine
    /// accepted; zero means the transmit buffer is full right now and
    /// [`Event::SendSpace`] will follow once it drains.
    fn tcp_send(&mut self, conn: ConnId, data: &[u8]) -> Result<usize>;

    /// Release the control block, closing the connection if one is up.
    /// Must tolerate control blocks the engine has already torn down.
    fn tcp_close(&mut self, conn: ConnId);

    /// Allocate a UDP control block.
    fn udp_open(&mut self) -> Result<ConnId>;

    /// Bind the control block to a local address.
    fn udp_bind(&mut self, conn: ConnId, local: SocketAddrV4) -> Result<()>;

    /// Transmit one datagram.
    fn udp_send(&mut self, conn: ConnId, to: SocketAddrV4, data: &[u8]) -> Result<()>;

    /// Release the control block.
    fn udp_close(&mut self, conn: ConnId);

    /// Pop the next pending event, `None` when the queue is empty.
    fn poll_event(&mut self) -> Option<Event>;
}
