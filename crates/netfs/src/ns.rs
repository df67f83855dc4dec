//! The protocol namespace and its dispatch core.
//!
//! [`Netfs`] owns everything: the per-protocol identifier tables, the socket
//! nodes, the endpoint-handle arena, the control-block correlation map, and
//! the engine itself. Callers walk `/<proto>/<id>/<endpoint>`, open a
//! [`Handle`], and issue reads and writes against it; the engine's events are
//! applied through [`Netfs::pump`].
//!
//! Everything runs on one logical thread: every entry point takes
//! `&mut self`, so the only hazard is re-entrancy, not races. A call into
//! the engine may complete other sockets' work immediately (a loopback
//! connect establishes both ends before returning), so after *every* engine
//! call the dispatch layer drains and applies the engine's event queue before
//! the current operation inspects its own outcome. Nothing is deferred to
//! "after the call returns".

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddrV4;

use bytes::Bytes;
use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use slab::Slab;

use crate::engine::{ConnId, Engine};
use crate::error::Error;
use crate::event::{Event, Interest};
use crate::node::{EndpointKind, Proto, SockId, Socket, SocketNode};
use crate::notify::ReadySet;
use crate::tcp::{TcpSocket, TcpState};
use crate::udp::{Datagram, UdpSocket};
use crate::utils::{parse_addr_bytes, Progress, Result, addr_line};

/// An open endpoint handle.
///
/// Generation-tagged: a handle that was closed (or whose slot was reused)
/// stops resolving instead of reaching another caller's endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle {
    index: usize,
    tag: u64,
}

impl Handle {
    #[cfg(test)]
    pub(crate) fn for_tests(index: usize, tag: u64) -> Self {
        Handle { index, tag }
    }
}

/// Capacity knobs for bounded queues.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Largest accepted `listen` backlog.
    pub max_backlog: usize,
    /// Received datagrams held per UDP socket before dropping.
    pub udp_queue: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_backlog: 32,
            udp_queue: 64,
        }
    }
}

#[derive(Debug)]
struct HandleEntry {
    tag: u64,
    /// Node slot, stable for the node's whole life.
    node: usize,
    kind: EndpointKind,
    /// Read offset for stable-content endpoints (`new_socket`).
    cursor: u64,
    /// Interest registered and not yet signaled.
    registered: bool,
}

/// Where events for a control block land.
#[derive(Clone, Copy, Debug)]
enum ConnTarget {
    /// A live node.
    Node(usize),
    /// A handshake-complete connection still parked on its listener's
    /// pending queue; it has no identifier until accepted.
    Pending { listener: usize },
}

/// The socket namespace over one protocol engine.
pub struct Netfs<E> {
    engine: E,
    limits: Limits,
    /// All live nodes, including unlinked ones awaiting their last close.
    nodes: Slab<SocketNode>,
    /// Identifier tables; ordered so enumeration is stable and restartable.
    tcp_ids: BTreeMap<SockId, usize>,
    udp_ids: BTreeMap<SockId, usize>,
    /// Control-block correlation for the event bridge.
    conns: HashMap<ConnId, ConnTarget>,
    handles: Slab<HandleEntry>,
    ready: ReadySet,
    next_tag: u64,
    rng: SmallRng,
}

impl<E: Engine> Netfs<E> {
    pub fn new(engine: E) -> Self {
        Self::with_limits(engine, Limits::default())
    }

    pub fn with_limits(engine: E, limits: Limits) -> Self {
        Self::build(engine, limits, SmallRng::from_os_rng())
    }

    /// Deterministic identifier sequence, for reproducible hosts and tests.
    pub fn with_seed(engine: E, limits: Limits, seed: u64) -> Self {
        Self::build(engine, limits, SmallRng::seed_from_u64(seed))
    }

    fn build(engine: E, limits: Limits, rng: SmallRng) -> Self {
        Netfs {
            engine,
            limits,
            nodes: Slab::new(),
            tcp_ids: BTreeMap::new(),
            udp_ids: BTreeMap::new(),
            conns: HashMap::new(),
            handles: Slab::new(),
            ready: ReadySet::new(),
            next_tag: 0,
            rng,
        }
    }

    /// The engine, for the host to feed I/O completions into.
    /// Call [`Netfs::pump`] afterwards so resulting events are applied.
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    // ------------------------------------------------------------------
    // Namespace surface
    // ------------------------------------------------------------------

    /// Create an unbound socket and return its identifier.
    pub fn allocate(&mut self, proto: Proto) -> Result<SockId> {
        let id = match proto {
            Proto::Tcp => draw_id(&mut self.rng, &self.tcp_ids)?,
            Proto::Udp => draw_id(&mut self.rng, &self.udp_ids)?,
        };
        let conn = match proto {
            Proto::Tcp => self.engine.tcp_open()?,
            Proto::Udp => self.engine.udp_open()?,
        };
        self.pump();
        let sock = match proto {
            Proto::Tcp => Socket::Tcp(TcpSocket::new(conn)),
            Proto::Udp => Socket::Udp(UdpSocket::new(conn, self.limits.udp_queue)),
        };
        let slot = self.nodes.insert(SocketNode::new(id, sock));
        match proto {
            Proto::Tcp => self.tcp_ids.insert(id, slot),
            Proto::Udp => self.udp_ids.insert(id, slot),
        };
        self.conns.insert(conn, ConnTarget::Node(slot));
        debug!("{proto}/{id}: allocated");
        Ok(id)
    }

    /// Open the well-known allocation endpoint: creates a socket and hands
    /// back a handle whose reads name it as `"<proto>/<id>\n"`.
    pub fn open_new(&mut self, proto: Proto) -> Result<Handle> {
        let id = self.allocate(proto)?;
        let slot = *self.ids(proto).get(&id).ok_or(Error::NotFound)?;
        Ok(self.insert_handle(slot, EndpointKind::NewSocket))
    }

    /// Open an endpoint on an existing socket.
    pub fn open(&mut self, proto: Proto, id: SockId, kind: EndpointKind) -> Result<Handle> {
        if kind == EndpointKind::NewSocket {
            return Err(Error::Invalid("new_socket is opened through open_new"));
        }
        let slot = *self.ids(proto).get(&id).ok_or(Error::NotFound)?;
        {
            let node = self.nodes.get(slot).ok_or(Error::NotFound)?;
            if !node.kind_legal(kind) {
                return Err(Error::Invalid("endpoint not available in this state"));
            }
        }
        Ok(self.insert_handle(slot, kind))
    }

    /// Open by path, e.g. `"tcp/new_socket"` or `"udp/17/data"`.
    pub fn open_path(&mut self, path: &str) -> Result<Handle> {
        let mut parts = path.trim_matches('/').splitn(3, '/');
        let proto = parts
            .next()
            .and_then(Proto::from_name)
            .ok_or(Error::NotFound)?;
        match (parts.next(), parts.next()) {
            (Some("new_socket"), None) => self.open_new(proto),
            (Some(id), Some(kind)) => {
                let id = id.parse::<u32>().map(SockId).map_err(|_| Error::NotFound)?;
                let kind = EndpointKind::from_name(kind).ok_or(Error::NotFound)?;
                self.open(proto, id, kind)
            }
            _ => Err(Error::Invalid("path does not name an endpoint")),
        }
    }

    /// Live identifiers under a protocol directory, in stable order.
    pub fn list(&self, proto: Proto) -> impl Iterator<Item = SockId> + '_ {
        self.ids(proto).keys().copied()
    }

    /// The endpoints a listing of `/<proto>/<id>` shows right now.
    pub fn endpoints(&self, proto: Proto, id: SockId) -> Result<Vec<EndpointKind>> {
        let slot = *self.ids(proto).get(&id).ok_or(Error::NotFound)?;
        Ok(self.nodes.get(slot).ok_or(Error::NotFound)?.endpoint_kinds())
    }

    /// What a handle refers to.
    pub fn stat(&self, h: Handle) -> Result<(Proto, SockId, EndpointKind)> {
        let e = self.entry(h)?;
        let node = self.nodes.get(e.node).ok_or(Error::NotFound)?;
        Ok((node.proto(), node.id, e.kind))
    }

    /// Unlink a socket. The identifier stops resolving immediately; backing
    /// resources go once the last handle closes. Idempotent.
    pub fn remove(&mut self, proto: Proto, id: SockId) -> Result<()> {
        let slot = match self.ids_mut(proto).remove(&id) {
            Some(slot) => slot,
            None => return Ok(()),
        };
        if let Some(node) = self.nodes.get_mut(slot) {
            node.gone = true;
        }
        debug!("{proto}/{id}: unlinked");
        self.maybe_release(slot);
        // Releasing a control block can make the engine report progress on
        // other connections (a loopback close half-closes the peer).
        self.pump();
        Ok(())
    }

    /// Close an endpoint handle. The second close of the same handle is an
    /// error, never a double-decrement.
    pub fn close(&mut self, h: Handle) -> Result<()> {
        let slot = self.entry(h)?.node;
        self.handles.remove(h.index);
        self.ready.discard(h);
        if let Some(node) = self.nodes.get_mut(slot) {
            node.refs = node.refs.saturating_sub(1);
        }
        self.maybe_release(slot);
        self.pump();
        Ok(())
    }

    /// Register interest: when this handle's endpoint may next make
    /// progress, the handle shows up in [`Netfs::take_ready`]. If it can
    /// make progress already, it shows up immediately.
    pub fn register(&mut self, h: Handle) -> Result<()> {
        let (slot, kind) = self.entry_of(h)?;
        if self.nodes.get(slot).is_some_and(|n| n.kind_ready(kind)) {
            self.ready.push(h);
        } else if let Some(e) = self.handles.get_mut(h.index) {
            e.registered = true;
        }
        Ok(())
    }

    /// Drain the coalesced wakeups.
    pub fn take_ready(&mut self) -> Vec<Handle> {
        self.ready.take()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn read(&mut self, h: Handle, max: usize) -> Result<Progress<Bytes>> {
        let (slot, kind) = self.entry_of(h)?;
        self.check_fault(slot)?;
        match kind {
            EndpointKind::NewSocket => self.read_new_socket(h, slot, max),
            EndpointKind::Accept => self.read_accept(slot, max),
            EndpointKind::Data => self.read_data(slot, max),
            EndpointKind::Connect => self.read_connect(slot, max),
            EndpointKind::Local => self.read_local(slot, max),
            EndpointKind::Remote => self.read_remote(slot, max),
            EndpointKind::From => self.read_from(slot, max),
            _ => Err(Error::Invalid("endpoint is not readable")),
        }
    }

    fn read_new_socket(&mut self, h: Handle, slot: usize, max: usize) -> Result<Progress<Bytes>> {
        let text = {
            let node = self.nodes.get(slot).ok_or(Error::NotFound)?;
            format!("{}/{}\n", node.proto(), node.id)
        };
        let entry = self.handles.get_mut(h.index).ok_or(Error::NotFound)?;
        let bytes = text.as_bytes();
        let start = (entry.cursor as usize).min(bytes.len());
        let n = max.min(bytes.len() - start);
        entry.cursor += n as u64;
        Ok(Progress::Ready(Bytes::copy_from_slice(
            &bytes[start..start + n],
        )))
    }

    fn read_accept(&mut self, slot: usize, max: usize) -> Result<Progress<Bytes>> {
        {
            let node = self.nodes.get_mut(slot).ok_or(Error::NotFound)?;
            let Socket::Tcp(t) = &mut node.sock else {
                return Err(Error::Invalid("not a stream socket"));
            };
            if t.state() != TcpState::Listening {
                return Err(Error::Invalid("socket is not listening"));
            }
            if !t.has_pending() {
                return Ok(Progress::Pending);
            }
        }
        // Draw the identifier before popping so the queue entry cannot be
        // lost to an exhausted identifier space.
        let id = draw_id(&mut self.rng, &self.tcp_ids)?;
        let child = {
            let node = self.nodes.get_mut(slot).ok_or(Error::NotFound)?;
            let Socket::Tcp(t) = &mut node.sock else {
                return Err(Error::Invalid("not a stream socket"));
            };
            t.pop_pending().ok_or(Error::NotFound)?
        };
        let conn = child.conn;
        let new_slot = self.nodes.insert(SocketNode::new(id, Socket::Tcp(child)));
        self.tcp_ids.insert(id, new_slot);
        if let Some(c) = conn {
            self.conns.insert(c, ConnTarget::Node(new_slot));
        }
        debug!("tcp/{id}: adopted pending connection");
        Ok(line_read(&format!("tcp/{id}\n"), max))
    }

    fn read_data(&mut self, slot: usize, max: usize) -> Result<Progress<Bytes>> {
        let node = self.nodes.get_mut(slot).ok_or(Error::NotFound)?;
        match &mut node.sock {
            Socket::Tcp(t) => Ok(t.read_data(max)),
            Socket::Udp(u) => match u.pop() {
                Some(d) => {
                    // Datagram boundary: one read, one datagram; the rest of
                    // an oversized payload is discarded.
                    let n = max.min(d.payload.len());
                    Ok(Progress::Ready(d.payload.slice(..n)))
                }
                None if u.is_closed() => Ok(Progress::Ready(Bytes::new())),
                None => Ok(Progress::Pending),
            },
        }
    }

    fn read_connect(&mut self, slot: usize, max: usize) -> Result<Progress<Bytes>> {
        let node = self.nodes.get(slot).ok_or(Error::NotFound)?;
        match &node.sock {
            Socket::Tcp(t) => match t.state() {
                // The connect attempt has resolved; addresses are published
                // by `local` and `remote`.
                TcpState::Ready | TcpState::Closing | TcpState::Closed => {
                    Ok(Progress::Ready(Bytes::new()))
                }
                _ => Ok(Progress::Pending),
            },
            Socket::Udp(u) => match u.dest() {
                Some(dest) => Ok(line_read(&addr_line(dest), max)),
                None => Ok(Progress::Pending),
            },
        }
    }

    fn read_local(&mut self, slot: usize, max: usize) -> Result<Progress<Bytes>> {
        let node = self.nodes.get(slot).ok_or(Error::NotFound)?;
        let local = match &node.sock {
            Socket::Tcp(t) => t.local(),
            Socket::Udp(u) => u.local(),
        };
        match local {
            Some(addr) => Ok(line_read(&addr_line(addr), max)),
            None => Ok(Progress::Pending),
        }
    }

    fn read_remote(&mut self, slot: usize, max: usize) -> Result<Progress<Bytes>> {
        let node = self.nodes.get(slot).ok_or(Error::NotFound)?;
        let remote = match &node.sock {
            Socket::Tcp(t) => t.peer(),
            // A datagram socket's remote is whoever sent the next datagram.
            Socket::Udp(u) => u.peek_from(),
        };
        match remote {
            Some(addr) => Ok(line_read(&addr_line(addr), max)),
            None => Ok(Progress::Pending),
        }
    }

    fn read_from(&mut self, slot: usize, max: usize) -> Result<Progress<Bytes>> {
        let node = self.nodes.get(slot).ok_or(Error::NotFound)?;
        let Socket::Udp(u) = &node.sock else {
            return Err(Error::Invalid("not a datagram socket"));
        };
        match u.peek_from() {
            Some(addr) => Ok(line_read(&addr_line(addr), max)),
            None => Ok(Progress::Pending),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn write(&mut self, h: Handle, data: &[u8]) -> Result<Progress<usize>> {
        let (slot, kind) = self.entry_of(h)?;
        self.check_fault(slot)?;
        match kind {
            EndpointKind::Bind => self.write_bind(slot, data),
            EndpointKind::Connect => self.write_connect(slot, data),
            EndpointKind::Listen => self.write_listen(slot, data),
            EndpointKind::To => self.write_to(slot, data),
            EndpointKind::Data => self.write_data(slot, data),
            _ => Err(Error::Invalid("endpoint is not writable")),
        }
    }

    fn write_bind(&mut self, slot: usize, data: &[u8]) -> Result<Progress<usize>> {
        let addr = parse_addr_bytes(data)?;
        enum Target {
            Tcp(ConnId),
            Udp(ConnId),
        }
        let target = {
            let node = self.nodes.get(slot).ok_or(Error::NotFound)?;
            match &node.sock {
                Socket::Tcp(t) => {
                    if t.state() != TcpState::New {
                        return Err(Error::Invalid("socket is already bound"));
                    }
                    Target::Tcp(t.conn.ok_or(Error::Invalid("socket is closed"))?)
                }
                Socket::Udp(u) => {
                    if u.is_bound() {
                        return Err(Error::Invalid("socket is already bound"));
                    }
                    Target::Udp(u.conn.ok_or(Error::Invalid("socket is closed"))?)
                }
            }
        };
        let res = match target {
            Target::Tcp(c) => self.engine.tcp_bind(c, addr),
            Target::Udp(c) => self.engine.udp_bind(c, addr),
        };
        if let Err(e) = res {
            self.pump();
            return Err(e);
        }
        if let Some(node) = self.nodes.get_mut(slot) {
            match &mut node.sock {
                Socket::Tcp(t) => t.note_bound(addr),
                Socket::Udp(u) => u.note_bound(addr),
            }
        }
        self.pump();
        Ok(Progress::Ready(data.len()))
    }

    fn write_connect(&mut self, slot: usize, data: &[u8]) -> Result<Progress<usize>> {
        let addr = parse_addr_bytes(data)?;
        let tcp_conn = {
            let node = self.nodes.get_mut(slot).ok_or(Error::NotFound)?;
            match &mut node.sock {
                Socket::Tcp(t) => {
                    if t.state() != TcpState::Bound {
                        return Err(Error::Invalid("socket is not bound"));
                    }
                    Some(t.conn.ok_or(Error::Invalid("socket is closed"))?)
                }
                Socket::Udp(u) => {
                    // Datagram connect just remembers the default
                    // destination; nothing can be pending about it.
                    u.set_dest(addr);
                    None
                }
            }
        };
        if let Some(conn) = tcp_conn {
            let res = self.engine.tcp_connect(conn, addr);
            if let Err(e) = res {
                self.pump();
                return Err(e);
            }
            if let Some(node) = self.nodes.get_mut(slot) {
                if let Socket::Tcp(t) = &mut node.sock {
                    t.note_connecting();
                }
            }
            self.pump();
        }
        Ok(Progress::Ready(data.len()))
    }

    fn write_listen(&mut self, slot: usize, data: &[u8]) -> Result<Progress<usize>> {
        let text =
            std::str::from_utf8(data).map_err(|_| Error::Invalid("backlog is not text"))?;
        let backlog: usize = text
            .trim()
            .parse()
            .map_err(|_| Error::Invalid("backlog is not a number"))?;
        let backlog = backlog.clamp(1, self.limits.max_backlog);
        let conn = {
            let node = self.nodes.get(slot).ok_or(Error::NotFound)?;
            let Socket::Tcp(t) = &node.sock else {
                return Err(Error::Invalid("not a stream socket"));
            };
            if t.state() != TcpState::Bound {
                return Err(Error::Invalid("socket is not bound"));
            }
            t.conn.ok_or(Error::Invalid("socket is closed"))?
        };
        let res = self.engine.tcp_listen(conn, backlog.min(u16::MAX as usize) as u16);
        if let Err(e) = res {
            self.pump();
            return Err(e);
        }
        if let Some(node) = self.nodes.get_mut(slot) {
            if let Socket::Tcp(t) = &mut node.sock {
                t.note_listening(backlog);
            }
        }
        self.pump();
        Ok(Progress::Ready(data.len()))
    }

    fn write_to(&mut self, slot: usize, data: &[u8]) -> Result<Progress<usize>> {
        let addr = parse_addr_bytes(data)?;
        let node = self.nodes.get_mut(slot).ok_or(Error::NotFound)?;
        let Socket::Udp(u) = &mut node.sock else {
            return Err(Error::Invalid("not a datagram socket"));
        };
        u.set_dest(addr);
        Ok(Progress::Ready(data.len()))
    }

    fn write_data(&mut self, slot: usize, data: &[u8]) -> Result<Progress<usize>> {
        enum Target {
            Tcp(ConnId),
            Udp(ConnId, SocketAddrV4),
        }
        let target = {
            let node = self.nodes.get(slot).ok_or(Error::NotFound)?;
            match &node.sock {
                Socket::Tcp(t) => {
                    if t.state() != TcpState::Ready {
                        return Err(Error::Invalid("stream is not connected"));
                    }
                    Target::Tcp(t.conn.ok_or(Error::Invalid("socket is closed"))?)
                }
                Socket::Udp(u) => {
                    let conn = u.conn.ok_or(Error::Invalid("socket is closed"))?;
                    let dest = u.dest().ok_or(Error::Invalid("no destination set"))?;
                    Target::Udp(conn, dest)
                }
            }
        };
        match target {
            Target::Tcp(conn) => {
                let res = self.engine.tcp_send(conn, data);
                self.pump();
                let accepted = res?;
                if accepted == 0 {
                    // Transmit buffer full; never dropped silently.
                    Ok(Progress::Pending)
                } else {
                    Ok(Progress::Ready(accepted))
                }
            }
            Target::Udp(conn, dest) => {
                let res = self.engine.udp_send(conn, dest, data);
                self.pump();
                res?;
                Ok(Progress::Ready(data.len()))
            }
        }
    }

    // ------------------------------------------------------------------
    // Event bridge
    // ------------------------------------------------------------------

    /// Drain and apply every event the engine has queued. Called internally
    /// after each engine call; the host calls it after feeding I/O into the
    /// engine.
    pub fn pump(&mut self) {
        while let Some(ev) = self.engine.poll_event() {
            self.apply(ev);
        }
    }

    fn apply(&mut self, ev: Event) {
        match ev {
            Event::Established { conn, local, peer } => {
                let Some(ConnTarget::Node(slot)) = self.conns.get(&conn).copied() else {
                    debug!("establishment for unknown control block {conn:?}");
                    return;
                };
                let interest = match self.nodes.get_mut(slot) {
                    Some(node) => match &mut node.sock {
                        Socket::Tcp(t) => t.on_established(local, peer),
                        Socket::Udp(_) => Interest::empty(),
                    },
                    None => Interest::empty(),
                };
                self.signal(slot, interest);
            }
            Event::Inbound {
                listener,
                conn,
                local,
                peer,
            } => self.apply_inbound(listener, conn, local, peer),
            Event::Data { conn, payload } => self.apply_data(conn, &payload),
            Event::Datagram {
                conn,
                from,
                payload,
            } => self.apply_datagram(conn, from, payload),
            Event::SendSpace { conn } => {
                if let Some(ConnTarget::Node(slot)) = self.conns.get(&conn).copied() {
                    self.signal(slot, Interest::DATA_WRITE);
                }
            }
            Event::PeerClosed { conn } => self.apply_peer_closed(conn),
            Event::Reset { conn } => self.apply_reset(conn),
        }
    }

    fn apply_inbound(
        &mut self,
        listener: ConnId,
        conn: ConnId,
        local: SocketAddrV4,
        peer: SocketAddrV4,
    ) {
        let Some(ConnTarget::Node(slot)) = self.conns.get(&listener).copied() else {
            debug!("inbound connection for unknown listener {listener:?}");
            self.engine.tcp_close(conn);
            return;
        };
        let queued = match self.nodes.get_mut(slot) {
            Some(node) => match &mut node.sock {
                Socket::Tcp(t) if t.state() == TcpState::Listening => t
                    .push_inbound(TcpSocket::accepted(conn, local, peer))
                    .is_ok(),
                _ => false,
            },
            None => false,
        };
        if queued {
            self.conns.insert(conn, ConnTarget::Pending { listener: slot });
            self.signal(slot, Interest::ACCEPT);
        } else {
            if let Some(node) = self.nodes.get(slot) {
                warn!(
                    "tcp/{}: pending-connection queue full, refusing inbound from {peer}",
                    node.id
                );
            }
            self.engine.tcp_close(conn);
        }
    }

    fn apply_data(&mut self, conn: ConnId, payload: &[u8]) {
        match self.conns.get(&conn).copied() {
            Some(ConnTarget::Node(slot)) => {
                let interest = match self.nodes.get_mut(slot) {
                    Some(node) => match &mut node.sock {
                        Socket::Tcp(t) => t.on_data(payload),
                        Socket::Udp(_) => Interest::empty(),
                    },
                    None => Interest::empty(),
                };
                self.signal(slot, interest);
            }
            Some(ConnTarget::Pending { listener }) => {
                // Not yet accepted: buffer into the queued socket. Nobody
                // holds a handle on it, so there is nothing to signal.
                if let Some(node) = self.nodes.get_mut(listener) {
                    if let Socket::Tcp(t) = &mut node.sock {
                        if let Some(child) = t.pending_mut(conn) {
                            child.on_data(payload);
                        }
                    }
                }
            }
            None => debug!("data for unknown control block {conn:?}"),
        }
    }

    fn apply_datagram(&mut self, conn: ConnId, from: SocketAddrV4, payload: Bytes) {
        let Some(ConnTarget::Node(slot)) = self.conns.get(&conn).copied() else {
            debug!("datagram for unknown control block {conn:?}");
            return;
        };
        let (queued, id) = match self.nodes.get_mut(slot) {
            Some(node) => {
                let id = node.id;
                match &mut node.sock {
                    Socket::Udp(u) => (u.push(Datagram { from, payload }), id),
                    Socket::Tcp(_) => return,
                }
            }
            None => return,
        };
        if queued {
            self.signal(slot, Interest::DATA_READ | Interest::SENDER);
        } else {
            warn!("udp/{id}: packet queue full, dropped datagram from {from}");
        }
    }

    fn apply_peer_closed(&mut self, conn: ConnId) {
        match self.conns.get(&conn).copied() {
            Some(ConnTarget::Node(slot)) => {
                let interest = match self.nodes.get_mut(slot) {
                    Some(node) => match &mut node.sock {
                        Socket::Tcp(t) => t.on_peer_closed(),
                        Socket::Udp(_) => Interest::empty(),
                    },
                    None => Interest::empty(),
                };
                self.signal(slot, interest);
                self.maybe_release(slot);
            }
            Some(ConnTarget::Pending { listener }) => {
                if let Some(node) = self.nodes.get_mut(listener) {
                    if let Socket::Tcp(t) = &mut node.sock {
                        if let Some(child) = t.pending_mut(conn) {
                            child.on_peer_closed();
                        }
                    }
                }
            }
            None => debug!("peer close for unknown control block {conn:?}"),
        }
    }

    fn apply_reset(&mut self, conn: ConnId) {
        match self.conns.remove(&conn) {
            Some(ConnTarget::Node(slot)) => {
                // A listener's parked connections die with it; their control
                // blocks are still live in the engine and must be refused.
                let orphans = match self.nodes.get_mut(slot) {
                    Some(node) => match &mut node.sock {
                        Socket::Tcp(t) => t.drain_pending(),
                        Socket::Udp(_) => Vec::new(),
                    },
                    None => Vec::new(),
                };
                for child in orphans {
                    if let Some(c) = child.conn {
                        self.conns.remove(&c);
                        self.engine.tcp_close(c);
                    }
                }
                let interest = match self.nodes.get_mut(slot) {
                    Some(node) => match &mut node.sock {
                        Socket::Tcp(t) => t.on_reset(),
                        Socket::Udp(u) => {
                            u.on_reset();
                            Interest::all()
                        }
                    },
                    None => Interest::empty(),
                };
                self.signal(slot, interest);
                self.maybe_release(slot);
            }
            Some(ConnTarget::Pending { listener }) => {
                if let Some(node) = self.nodes.get_mut(listener) {
                    if let Socket::Tcp(t) = &mut node.sock {
                        if t.remove_pending(conn).is_some() {
                            debug!("tcp/{}: pending connection reset before accept", node.id);
                        }
                    }
                }
            }
            None => debug!("reset for unknown control block {conn:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ids(&self, proto: Proto) -> &BTreeMap<SockId, usize> {
        match proto {
            Proto::Tcp => &self.tcp_ids,
            Proto::Udp => &self.udp_ids,
        }
    }

    fn ids_mut(&mut self, proto: Proto) -> &mut BTreeMap<SockId, usize> {
        match proto {
            Proto::Tcp => &mut self.tcp_ids,
            Proto::Udp => &mut self.udp_ids,
        }
    }

    fn entry(&self, h: Handle) -> Result<&HandleEntry> {
        match self.handles.get(h.index) {
            Some(e) if e.tag == h.tag => Ok(e),
            _ => Err(Error::NotFound),
        }
    }

    fn entry_of(&self, h: Handle) -> Result<(usize, EndpointKind)> {
        let e = self.entry(h)?;
        Ok((e.node, e.kind))
    }

    fn insert_handle(&mut self, slot: usize, kind: EndpointKind) -> Handle {
        if let Some(node) = self.nodes.get_mut(slot) {
            node.refs += 1;
        }
        self.next_tag += 1;
        let tag = self.next_tag;
        let index = self.handles.insert(HandleEntry {
            tag,
            node: slot,
            kind,
            cursor: 0,
            registered: false,
        });
        Handle { index, tag }
    }

    /// Surface an engine fault exactly once, before dispatching an
    /// operation on the node.
    fn check_fault(&mut self, slot: usize) -> Result<()> {
        let node = self.nodes.get_mut(slot).ok_or(Error::NotFound)?;
        if node.sock.take_fault() {
            Err(Error::Protocol("connection reset by peer"))
        } else {
            Ok(())
        }
    }

    /// Wake every registered handle of this node whose endpoint kind can
    /// make progress under `interest`.
    fn signal(&mut self, slot: usize, interest: Interest) {
        if interest.is_empty() {
            return;
        }
        for (index, entry) in self.handles.iter_mut() {
            if entry.node == slot
                && entry.registered
                && entry.kind.interest().intersects(interest)
            {
                entry.registered = false;
                self.ready.push(Handle {
                    index,
                    tag: entry.tag,
                });
            }
        }
    }

    fn maybe_release(&mut self, slot: usize) {
        if self.nodes.get(slot).is_some_and(|n| n.can_release()) {
            self.release(slot);
        }
    }

    /// Tear a node down: identifier out of the table, parked connections
    /// refused, control block returned to the engine. Only reached with no
    /// handle left, so nothing can touch the node afterwards.
    fn release(&mut self, slot: usize) {
        let node = match self.nodes.try_remove(slot) {
            Some(node) => node,
            None => return,
        };
        let id = node.id;
        let proto = node.proto();
        let ids = match proto {
            Proto::Tcp => &mut self.tcp_ids,
            Proto::Udp => &mut self.udp_ids,
        };
        // The table entry is already gone for unlinked nodes, and the
        // identifier may have been reused since; only drop our own mapping.
        if ids.get(&id) == Some(&slot) {
            ids.remove(&id);
        }
        match node.sock {
            Socket::Tcp(mut t) => {
                for child in t.drain_pending() {
                    if let Some(c) = child.conn {
                        self.conns.remove(&c);
                        self.engine.tcp_close(c);
                    }
                }
                if let Some(c) = t.conn {
                    self.conns.remove(&c);
                    self.engine.tcp_close(c);
                }
            }
            Socket::Udp(u) => {
                if let Some(c) = u.conn {
                    self.conns.remove(&c);
                    self.engine.udp_close(c);
                }
            }
        }
        debug!("{proto}/{id}: released");
    }
}

/// Collision-checked random identifier draw.
fn draw_id(rng: &mut SmallRng, ids: &BTreeMap<SockId, usize>) -> Result<SockId> {
    if ids.len() >= (u32::MAX / 2) as usize {
        return Err(Error::Exhausted("socket identifier space"));
    }
    loop {
        let id = SockId(rng.random_range(1..=u32::MAX));
        if !ids.contains_key(&id) {
            return Ok(id);
        }
    }
}

/// A whole-line status read; the line is regenerated per read because the
/// underlying value may change between reads.
fn line_read(text: &str, max: usize) -> Progress<Bytes> {
    let n = max.min(text.len());
    Progress::Ready(Bytes::copy_from_slice(&text.as_bytes()[..n]))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Scripted engine: records calls, lets tests queue events by hand, and
    /// can inject events in the middle of a send the way a real engine
    /// completes unrelated work during transmission.
    #[derive(Default)]
    struct FakeEngine {
        next: u64,
        events: VecDeque<Event>,
        /// Events released into the queue by the next `tcp_send`.
        burst_on_send: VecDeque<Event>,
        /// Bytes accepted per `tcp_send`; `None` accepts everything.
        accept: Option<usize>,
        sent: Vec<(ConnId, Vec<u8>)>,
        sent_datagrams: Vec<(ConnId, SocketAddrV4, Vec<u8>)>,
        tcp_closed: Vec<ConnId>,
        udp_closed: Vec<ConnId>,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self::default()
        }

        fn push(&mut self, ev: Event) {
            self.events.push_back(ev);
        }
    }

    impl Engine for FakeEngine {
        fn tcp_open(&mut self) -> Result<ConnId> {
            self.next += 1;
            Ok(ConnId(self.next))
        }

        fn tcp_bind(&mut self, _conn: ConnId, _local: SocketAddrV4) -> Result<()> {
            Ok(())
        }

        fn tcp_connect(&mut self, _conn: ConnId, _remote: SocketAddrV4) -> Result<()> {
            Ok(())
        }

        fn tcp_listen(&mut self, _conn: ConnId, _backlog: u16) -> Result<()> {
            Ok(())
        }

        fn tcp_send(&mut self, conn: ConnId, data: &[u8]) -> Result<usize> {
            while let Some(ev) = self.burst_on_send.pop_front() {
                self.events.push_back(ev);
            }
            let n = self.accept.map_or(data.len(), |a| a.min(data.len()));
            self.sent.push((conn, data[..n].to_vec()));
            Ok(n)
        }

        fn tcp_close(&mut self, conn: ConnId) {
            self.tcp_closed.push(conn);
        }

        fn udp_open(&mut self) -> Result<ConnId> {
            self.next += 1;
            Ok(ConnId(self.next))
        }

        fn udp_bind(&mut self, _conn: ConnId, _local: SocketAddrV4) -> Result<()> {
            Ok(())
        }

        fn udp_send(&mut self, conn: ConnId, to: SocketAddrV4, data: &[u8]) -> Result<()> {
            self.sent_datagrams.push((conn, to, data.to_vec()));
            Ok(())
        }

        fn udp_close(&mut self, conn: ConnId) {
            self.udp_closed.push(conn);
        }

        fn poll_event(&mut self) -> Option<Event> {
            self.events.pop_front()
        }
    }

    fn fs() -> Netfs<FakeEngine> {
        Netfs::with_seed(FakeEngine::new(), Limits::default(), 42)
    }

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn parse_line(line: &[u8]) -> (Proto, SockId) {
        let text = std::str::from_utf8(line).unwrap();
        let text = text.strip_suffix('\n').unwrap();
        let (proto, id) = text.split_once('/').unwrap();
        (Proto::from_name(proto).unwrap(), SockId(id.parse().unwrap()))
    }

    fn alloc(fs: &mut Netfs<FakeEngine>, proto: Proto) -> SockId {
        let h = fs.open_new(proto).unwrap();
        let line = fs.read(h, 64).unwrap().ready().unwrap();
        fs.close(h).unwrap();
        let (got_proto, id) = parse_line(&line);
        assert_eq!(got_proto, proto);
        id
    }

    fn conn_of(fs: &Netfs<FakeEngine>, proto: Proto, id: SockId) -> ConnId {
        let slot = fs.ids(proto)[&id];
        match &fs.nodes[slot].sock {
            Socket::Tcp(t) => t.conn.unwrap(),
            Socket::Udp(u) => u.conn.unwrap(),
        }
    }

    fn refs_of(fs: &Netfs<FakeEngine>, proto: Proto, id: SockId) -> u32 {
        fs.nodes[fs.ids(proto)[&id]].refs
    }

    /// Allocate, bind, connect, and establish a stream socket.
    fn tcp_ready(fs: &mut Netfs<FakeEngine>) -> (SockId, ConnId) {
        let id = alloc(fs, Proto::Tcp);
        let b = fs.open(Proto::Tcp, id, EndpointKind::Bind).unwrap();
        assert!(fs.write(b, b"10.0.0.1:5000").unwrap().is_ready());
        fs.close(b).unwrap();

        let c = fs.open(Proto::Tcp, id, EndpointKind::Connect).unwrap();
        assert!(fs.write(c, b"10.0.0.2:80").unwrap().is_ready());
        assert_eq!(fs.read(c, 64).unwrap(), Progress::Pending);

        let conn = conn_of(fs, Proto::Tcp, id);
        fs.engine_mut().push(Event::Established {
            conn,
            local: addr("10.0.0.1:5000"),
            peer: addr("10.0.0.2:80"),
        });
        fs.pump();
        assert_eq!(fs.read(c, 64).unwrap(), Progress::Ready(Bytes::new()));
        fs.close(c).unwrap();
        (id, conn)
    }

    /// Allocate, bind, listen; returns the listener and its control block.
    fn tcp_listener(fs: &mut Netfs<FakeEngine>, backlog: &[u8]) -> (SockId, ConnId) {
        let id = alloc(fs, Proto::Tcp);
        let b = fs.open(Proto::Tcp, id, EndpointKind::Bind).unwrap();
        assert!(fs.write(b, b"0.0.0.0:0").unwrap().is_ready());
        fs.close(b).unwrap();
        let l = fs.open(Proto::Tcp, id, EndpointKind::Listen).unwrap();
        assert!(fs.write(l, backlog).unwrap().is_ready());
        fs.close(l).unwrap();
        (id, conn_of(fs, Proto::Tcp, id))
    }

    #[test]
    fn allocation_names_a_fresh_socket() {
        let mut fs = fs();
        let h = fs.open_new(Proto::Tcp).unwrap();
        let line = fs.read(h, 64).unwrap().ready().unwrap();
        let (proto, id) = parse_line(&line);
        assert_eq!(proto, Proto::Tcp);
        assert!(fs.list(Proto::Tcp).any(|x| x == id));
        // The name is stable content; a second read hits end of file.
        assert_eq!(fs.read(h, 64).unwrap(), Progress::Ready(Bytes::new()));
        fs.close(h).unwrap();
        // New sockets are not terminal; the node survives its last handle.
        assert!(fs.list(Proto::Tcp).any(|x| x == id));
    }

    #[test]
    fn identifiers_do_not_collide() {
        let mut fs = fs();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            assert!(seen.insert(alloc(&mut fs, Proto::Udp)));
        }
    }

    #[test]
    fn bind_then_local_roundtrip() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Tcp);
        let b = fs.open(Proto::Tcp, id, EndpointKind::Bind).unwrap();
        assert_eq!(
            fs.write(b, b"10.0.0.5:9000").unwrap(),
            Progress::Ready(13)
        );
        fs.close(b).unwrap();

        let l = fs.open(Proto::Tcp, id, EndpointKind::Local).unwrap();
        let line = fs.read(l, 64).unwrap().ready().unwrap();
        assert_eq!(line.as_ref(), b"10.0.0.5:9000\n");
        fs.close(l).unwrap();
    }

    #[test]
    fn listen_accept_scenario() {
        let mut fs = fs();
        let (id, lconn) = tcp_listener(&mut fs, b"5");

        fs.engine_mut().push(Event::Inbound {
            listener: lconn,
            conn: ConnId(900),
            local: addr("0.0.0.0:0"),
            peer: addr("10.0.0.9:33000"),
        });
        fs.pump();

        let a = fs.open(Proto::Tcp, id, EndpointKind::Accept).unwrap();
        let line = fs.read(a, 64).unwrap().ready().unwrap();
        let (proto, newid) = parse_line(&line);
        assert_eq!(proto, Proto::Tcp);
        assert_ne!(newid, id);
        assert!(fs.list(Proto::Tcp).any(|x| x == newid));
        // The adopted socket is connected and readable/writable.
        assert_eq!(
            fs.endpoints(Proto::Tcp, newid).unwrap(),
            vec![EndpointKind::Data, EndpointKind::Local, EndpointKind::Remote]
        );
        // Queue drained; the next accept pends.
        assert_eq!(fs.read(a, 64).unwrap(), Progress::Pending);
        fs.close(a).unwrap();
    }

    #[test]
    fn accepted_connections_drain_in_arrival_order() {
        let mut fs = fs();
        let (id, lconn) = tcp_listener(&mut fs, b"4");
        for n in [901, 902, 903] {
            fs.engine_mut().push(Event::Inbound {
                listener: lconn,
                conn: ConnId(n),
                local: addr("0.0.0.0:0"),
                peer: addr("10.0.0.9:33000"),
            });
        }
        fs.pump();

        let a = fs.open(Proto::Tcp, id, EndpointKind::Accept).unwrap();
        for expect in [901, 902, 903] {
            let line = fs.read(a, 64).unwrap().ready().unwrap();
            let (_, newid) = parse_line(&line);
            assert_eq!(conn_of(&fs, Proto::Tcp, newid), ConnId(expect));
        }
        fs.close(a).unwrap();
    }

    #[test]
    fn double_close_is_rejected_not_double_counted() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Udp);
        let h = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        let h2 = fs.open(Proto::Udp, id, EndpointKind::From).unwrap();
        assert_eq!(refs_of(&fs, Proto::Udp, id), 2);

        fs.close(h).unwrap();
        assert_eq!(refs_of(&fs, Proto::Udp, id), 1);
        assert!(matches!(fs.close(h), Err(Error::NotFound)));
        assert_eq!(refs_of(&fs, Proto::Udp, id), 1);

        // The surviving handle still works.
        assert_eq!(fs.read(h2, 64).unwrap(), Progress::Pending);
        fs.close(h2).unwrap();
    }

    #[test]
    fn stale_handle_does_not_reach_a_reused_slot() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Udp);
        let old = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        fs.close(old).unwrap();
        // The slab slot is reused, the generation is not.
        let new = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        assert!(matches!(fs.read(old, 64), Err(Error::NotFound)));
        assert!(matches!(fs.close(old), Err(Error::NotFound)));
        assert_eq!(fs.read(new, 64).unwrap(), Progress::Pending);
        fs.close(new).unwrap();
    }

    #[test]
    fn closed_stream_reads_as_end_of_stream() {
        let mut fs = fs();
        let (id, conn) = tcp_ready(&mut fs);
        let d = fs.open(Proto::Tcp, id, EndpointKind::Data).unwrap();

        fs.engine_mut().push(Event::Data {
            conn,
            payload: Bytes::from_static(b"tail"),
        });
        fs.engine_mut().push(Event::PeerClosed { conn });
        fs.pump();

        // Buffered bytes are still readable, then end-of-stream: an empty
        // success, never pending, never an error.
        assert_eq!(fs.read(d, 64).unwrap().ready().unwrap().as_ref(), b"tail");
        assert_eq!(fs.read(d, 64).unwrap(), Progress::Ready(Bytes::new()));
        assert_eq!(fs.read(d, 64).unwrap(), Progress::Ready(Bytes::new()));
        fs.close(d).unwrap();
    }

    #[test]
    fn reset_surfaces_protocol_error_once() {
        let mut fs = fs();
        let (id, conn) = tcp_ready(&mut fs);
        let d = fs.open(Proto::Tcp, id, EndpointKind::Data).unwrap();

        fs.engine_mut().push(Event::Reset { conn });
        fs.pump();

        assert!(matches!(fs.read(d, 64), Err(Error::Protocol(_))));
        // After the one report the socket simply reads as closed.
        assert_eq!(fs.read(d, 64).unwrap(), Progress::Ready(Bytes::new()));
        assert!(matches!(fs.write(d, b"x"), Err(Error::Invalid(_))));
        fs.close(d).unwrap();
    }

    #[test]
    fn udp_drains_fifo_with_matching_senders() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Udp);
        let b = fs.open(Proto::Udp, id, EndpointKind::Bind).unwrap();
        assert!(fs.write(b, b"0.0.0.0:8000").unwrap().is_ready());
        fs.close(b).unwrap();

        let conn = conn_of(&fs, Proto::Udp, id);
        let peers = ["10.0.0.1:1111", "10.0.0.2:2222", "10.0.0.3:3333"];
        let payloads: [&[u8]; 3] = [b"first", b"second", b"third"];
        for (peer, payload) in peers.iter().zip(payloads) {
            fs.engine_mut().push(Event::Datagram {
                conn,
                from: addr(peer),
                payload: Bytes::copy_from_slice(payload),
            });
        }
        fs.pump();

        let d = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        let f = fs.open(Proto::Udp, id, EndpointKind::From).unwrap();
        for (peer, payload) in peers.iter().zip(payloads) {
            let sender = fs.read(f, 64).unwrap().ready().unwrap();
            assert_eq!(sender.as_ref(), format!("{peer}\n").as_bytes());
            let got = fs.read(d, 64).unwrap().ready().unwrap();
            assert_eq!(got.as_ref(), payload);
        }
        assert_eq!(fs.read(d, 64).unwrap(), Progress::Pending);
        assert_eq!(fs.read(f, 64).unwrap(), Progress::Pending);
        fs.close(d).unwrap();
        fs.close(f).unwrap();
    }

    #[test]
    fn udp_write_needs_a_destination() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Udp);
        let d = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        assert!(matches!(fs.write(d, b"lost"), Err(Error::Invalid(_))));

        let t = fs.open(Proto::Udp, id, EndpointKind::To).unwrap();
        assert!(fs.write(t, b"10.0.0.7:53").unwrap().is_ready());
        assert_eq!(fs.write(d, b"query").unwrap(), Progress::Ready(5));

        let conn = conn_of(&fs, Proto::Udp, id);
        assert_eq!(
            fs.engine_mut().sent_datagrams,
            vec![(conn, addr("10.0.0.7:53"), b"query".to_vec())]
        );
        fs.close(d).unwrap();
        fs.close(t).unwrap();
    }

    #[test]
    fn udp_connect_remembers_the_destination() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Udp);
        let c = fs.open(Proto::Udp, id, EndpointKind::Connect).unwrap();
        assert_eq!(fs.read(c, 64).unwrap(), Progress::Pending);
        assert!(fs.write(c, b"10.0.0.8:123").unwrap().is_ready());
        assert_eq!(
            fs.read(c, 64).unwrap().ready().unwrap().as_ref(),
            b"10.0.0.8:123\n"
        );
        let d = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        assert!(fs.write(d, b"tick").unwrap().is_ready());
        fs.close(c).unwrap();
        fs.close(d).unwrap();
    }

    #[test]
    fn udp_queue_overflow_drops_new_datagrams() {
        let mut fs = Netfs::with_seed(
            FakeEngine::new(),
            Limits {
                udp_queue: 2,
                ..Limits::default()
            },
            42,
        );
        let id = alloc(&mut fs, Proto::Udp);
        let conn = conn_of(&fs, Proto::Udp, id);
        for payload in [b"a" as &[u8], b"b", b"c"] {
            fs.engine_mut().push(Event::Datagram {
                conn,
                from: addr("10.0.0.1:1"),
                payload: Bytes::copy_from_slice(payload),
            });
        }
        fs.pump();

        let slot = fs.ids(Proto::Udp)[&id];
        match &fs.nodes[slot].sock {
            Socket::Udp(u) => assert_eq!(u.dropped(), 1),
            _ => unreachable!(),
        }
        let d = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        assert_eq!(fs.read(d, 64).unwrap().ready().unwrap().as_ref(), b"a");
        assert_eq!(fs.read(d, 64).unwrap().ready().unwrap().as_ref(), b"b");
        assert_eq!(fs.read(d, 64).unwrap(), Progress::Pending);
        fs.close(d).unwrap();
    }

    #[test]
    fn short_writes_and_send_pressure() {
        let mut fs = fs();
        let (id, conn) = tcp_ready(&mut fs);
        let d = fs.open(Proto::Tcp, id, EndpointKind::Data).unwrap();

        fs.engine_mut().accept = Some(3);
        assert_eq!(fs.write(d, b"overflow").unwrap(), Progress::Ready(3));

        fs.engine_mut().accept = Some(0);
        assert_eq!(fs.write(d, b"stuck").unwrap(), Progress::Pending);

        fs.register(d).unwrap();
        assert!(fs.take_ready().is_empty());
        fs.engine_mut().push(Event::SendSpace { conn });
        fs.pump();
        assert_eq!(fs.take_ready(), vec![d]);
        fs.close(d).unwrap();
    }

    #[test]
    fn reentrant_establishment_does_not_disturb_the_writer() {
        let mut fs = fs();
        let (a_id, _a_conn) = tcp_ready(&mut fs);

        // A second socket parked mid-handshake.
        let b_id = alloc(&mut fs, Proto::Tcp);
        let bb = fs.open(Proto::Tcp, b_id, EndpointKind::Bind).unwrap();
        fs.write(bb, b"10.0.0.1:6000").unwrap();
        fs.close(bb).unwrap();
        let bc = fs.open(Proto::Tcp, b_id, EndpointKind::Connect).unwrap();
        fs.write(bc, b"10.0.0.3:90").unwrap();
        let b_conn = conn_of(&fs, Proto::Tcp, b_id);

        // Writing on A makes the engine complete B's handshake mid-call.
        fs.engine_mut().burst_on_send.push_back(Event::Established {
            conn: b_conn,
            local: addr("10.0.0.1:6000"),
            peer: addr("10.0.0.3:90"),
        });
        let a_d = fs.open(Proto::Tcp, a_id, EndpointKind::Data).unwrap();
        assert_eq!(fs.write(a_d, b"ping").unwrap(), Progress::Ready(4));

        // B progressed before the write returned...
        assert_eq!(fs.read(bc, 64).unwrap(), Progress::Ready(Bytes::new()));
        // ...and A is exactly as it was: connected, empty receive buffer.
        assert_eq!(
            fs.endpoints(Proto::Tcp, a_id).unwrap(),
            vec![EndpointKind::Data, EndpointKind::Local, EndpointKind::Remote]
        );
        assert_eq!(fs.read(a_d, 64).unwrap(), Progress::Pending);
        fs.close(a_d).unwrap();
        fs.close(bc).unwrap();
    }

    #[test]
    fn events_follow_a_connection_through_adoption() {
        let mut fs = fs();
        let (id, lconn) = tcp_listener(&mut fs, b"4");
        fs.engine_mut().push(Event::Inbound {
            listener: lconn,
            conn: ConnId(900),
            local: addr("0.0.0.0:0"),
            peer: addr("10.0.0.9:33000"),
        });
        // Data races ahead of the accept: it must land in the parked socket.
        fs.engine_mut().push(Event::Data {
            conn: ConnId(900),
            payload: Bytes::from_static(b"early"),
        });
        fs.pump();

        let a = fs.open(Proto::Tcp, id, EndpointKind::Accept).unwrap();
        let line = fs.read(a, 64).unwrap().ready().unwrap();
        let (_, newid) = parse_line(&line);
        fs.close(a).unwrap();

        let d = fs.open(Proto::Tcp, newid, EndpointKind::Data).unwrap();
        assert_eq!(fs.read(d, 64).unwrap().ready().unwrap().as_ref(), b"early");

        // After adoption, new data reaches the adopted node directly.
        fs.engine_mut().push(Event::Data {
            conn: ConnId(900),
            payload: Bytes::from_static(b"late"),
        });
        fs.pump();
        assert_eq!(fs.read(d, 64).unwrap().ready().unwrap().as_ref(), b"late");
        fs.close(d).unwrap();
    }

    #[test]
    fn reset_before_accept_discards_the_pending_entry() {
        let mut fs = fs();
        let (id, lconn) = tcp_listener(&mut fs, b"4");
        fs.engine_mut().push(Event::Inbound {
            listener: lconn,
            conn: ConnId(900),
            local: addr("0.0.0.0:0"),
            peer: addr("10.0.0.9:33000"),
        });
        fs.engine_mut().push(Event::Reset { conn: ConnId(900) });
        fs.pump();

        let a = fs.open(Proto::Tcp, id, EndpointKind::Accept).unwrap();
        assert_eq!(fs.read(a, 64).unwrap(), Progress::Pending);
        assert!(!fs.conns.contains_key(&ConnId(900)));
        fs.close(a).unwrap();
    }

    #[test]
    fn full_backlog_refuses_further_inbound() {
        let mut fs = fs();
        let (_id, lconn) = tcp_listener(&mut fs, b"1");
        for n in [901, 902] {
            fs.engine_mut().push(Event::Inbound {
                listener: lconn,
                conn: ConnId(n),
                local: addr("0.0.0.0:0"),
                peer: addr("10.0.0.9:33000"),
            });
        }
        fs.pump();
        assert_eq!(fs.engine_mut().tcp_closed, vec![ConnId(902)]);
    }

    #[test]
    fn listener_reset_refuses_parked_connections() {
        let mut fs = fs();
        let (id, lconn) = tcp_listener(&mut fs, b"4");
        fs.engine_mut().push(Event::Inbound {
            listener: lconn,
            conn: ConnId(900),
            local: addr("0.0.0.0:0"),
            peer: addr("10.0.0.9:33000"),
        });
        fs.engine_mut().push(Event::Reset { conn: lconn });
        fs.pump();

        // The parked connection was closed back into the engine and its
        // correlation dropped; the listener is terminal and unreferenced,
        // so it has been torn down entirely.
        assert!(fs.engine_mut().tcp_closed.contains(&ConnId(900)));
        assert!(!fs.conns.contains_key(&ConnId(900)));
        assert!(!fs.list(Proto::Tcp).any(|x| x == id));
    }

    #[test]
    fn remove_invalidates_now_and_releases_later() {
        let mut fs = fs();
        let (id, conn) = tcp_ready(&mut fs);
        let d = fs.open(Proto::Tcp, id, EndpointKind::Data).unwrap();

        fs.remove(Proto::Tcp, id).unwrap();
        // The identifier is gone immediately...
        assert!(!fs.list(Proto::Tcp).any(|x| x == id));
        assert!(matches!(
            fs.open(Proto::Tcp, id, EndpointKind::Data),
            Err(Error::NotFound)
        ));
        // ...but the open handle pins the backing resources.
        assert!(fs.engine_mut().tcp_closed.is_empty());
        assert_eq!(fs.read(d, 64).unwrap(), Progress::Pending);

        fs.close(d).unwrap();
        assert_eq!(fs.engine_mut().tcp_closed, vec![conn]);
        assert!(fs.nodes.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Udp);
        let conn = conn_of(&fs, Proto::Udp, id);
        fs.remove(Proto::Udp, id).unwrap();
        fs.remove(Proto::Udp, id).unwrap();
        assert!(fs.remove(Proto::Udp, SockId(12345)).is_ok());
        // No handle was open, so the control block went back right away.
        assert_eq!(fs.engine_mut().udp_closed, vec![conn]);
    }

    #[test]
    fn wrong_endpoint_kinds_are_rejected_at_open() {
        let mut fs = fs();
        let u = alloc(&mut fs, Proto::Udp);
        assert!(matches!(
            fs.open(Proto::Udp, u, EndpointKind::Accept),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            fs.open(Proto::Udp, u, EndpointKind::Listen),
            Err(Error::Invalid(_))
        ));

        let t = alloc(&mut fs, Proto::Tcp);
        assert!(matches!(
            fs.open(Proto::Tcp, t, EndpointKind::Data),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            fs.open(Proto::Tcp, SockId(4242), EndpointKind::Data),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            fs.open(Proto::Tcp, t, EndpointKind::NewSocket),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn ipv6_bind_is_unsupported() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Tcp);
        let b = fs.open(Proto::Tcp, id, EndpointKind::Bind).unwrap();
        assert!(matches!(fs.write(b, b"[::1]:80"), Err(Error::Unsupported(_))));
        fs.close(b).unwrap();
    }

    #[test]
    fn paths_walk_to_endpoints() {
        let mut fs = fs();
        let h = fs.open_path("tcp/new_socket").unwrap();
        let line = fs.read(h, 64).unwrap().ready().unwrap();
        let (_, id) = parse_line(&line);
        fs.close(h).unwrap();

        let b = fs.open_path(&format!("/tcp/{id}/bind")).unwrap();
        assert!(fs.write(b, b"10.0.0.5:9000").unwrap().is_ready());
        fs.close(b).unwrap();

        assert!(matches!(fs.open_path("tcp"), Err(Error::Invalid(_))));
        assert!(matches!(fs.open_path("icmp/new_socket"), Err(Error::NotFound)));
        assert!(matches!(
            fs.open_path("tcp/99999/data"),
            Err(Error::NotFound)
        ));
        assert!(matches!(
            fs.open_path(&format!("tcp/{id}/frob")),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn registration_after_the_fact_still_wakes() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Udp);
        let conn = conn_of(&fs, Proto::Udp, id);
        fs.engine_mut().push(Event::Datagram {
            conn,
            from: addr("10.0.0.1:1"),
            payload: Bytes::from_static(b"x"),
        });
        fs.pump();

        // The datagram is already queued; registering must not lose the
        // wakeup that "happened" before the registration.
        let d = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        fs.register(d).unwrap();
        assert_eq!(fs.take_ready(), vec![d]);
        fs.close(d).unwrap();
    }

    #[test]
    fn wakeups_coalesce_until_polled() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Udp);
        let conn = conn_of(&fs, Proto::Udp, id);
        let d = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        fs.register(d).unwrap();

        for _ in 0..3 {
            fs.engine_mut().push(Event::Datagram {
                conn,
                from: addr("10.0.0.1:1"),
                payload: Bytes::from_static(b"x"),
            });
        }
        fs.pump();
        assert_eq!(fs.take_ready(), vec![d]);
        assert!(fs.take_ready().is_empty());

        // Interest is one-shot: a new event without a new registration
        // wakes nobody.
        fs.engine_mut().push(Event::Datagram {
            conn,
            from: addr("10.0.0.1:1"),
            payload: Bytes::from_static(b"y"),
        });
        fs.pump();
        assert!(fs.take_ready().is_empty());
        fs.close(d).unwrap();
    }

    #[test]
    fn no_wakeup_after_close() {
        let mut fs = fs();
        let id = alloc(&mut fs, Proto::Udp);
        let conn = conn_of(&fs, Proto::Udp, id);
        let d = fs.open(Proto::Udp, id, EndpointKind::Data).unwrap();
        fs.register(d).unwrap();
        fs.close(d).unwrap();

        fs.engine_mut().push(Event::Datagram {
            conn,
            from: addr("10.0.0.1:1"),
            payload: Bytes::from_static(b"x"),
        });
        fs.pump();
        assert!(fs.take_ready().is_empty());
    }

    #[test]
    fn listing_is_ordered_and_restartable() {
        let mut fs = fs();
        for _ in 0..3 {
            alloc(&mut fs, Proto::Udp);
        }
        let first: Vec<_> = fs.list(Proto::Udp).collect();
        let second: Vec<_> = fs.list(Proto::Udp).collect();
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(first, sorted);
        assert_eq!(fs.list(Proto::Tcp).count(), 0);
    }
}
