//! An in-memory protocol engine that loops every connection back into the
//! same process. Connects succeed against local listeners, stream data is
//! delivered to the peer control block, datagrams are routed by port. Good
//! enough to exercise the whole namespace without a network.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};

use log::debug;
use netfs::{ConnId, Engine, Error, Event, Result};

const EPHEMERAL_BASE: u16 = 49152;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Tcp,
    Udp,
}

struct Conn {
    kind: Kind,
    local: Option<SocketAddrV4>,
    /// Established stream peer.
    peer: Option<ConnId>,
    listening: bool,
}

#[derive(Default)]
pub struct LoopEngine {
    next: u64,
    ephemeral: u16,
    conns: HashMap<ConnId, Conn>,
    events: VecDeque<Event>,
}

impl LoopEngine {
    pub fn new() -> Self {
        LoopEngine::default()
    }

    fn open(&mut self, kind: Kind) -> ConnId {
        self.next += 1;
        let conn = ConnId(self.next);
        self.conns.insert(
            conn,
            Conn {
                kind,
                local: None,
                peer: None,
                listening: false,
            },
        );
        conn
    }

    fn ephemeral_addr(&mut self) -> SocketAddrV4 {
        self.ephemeral = self.ephemeral.wrapping_add(1);
        SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            EPHEMERAL_BASE.wrapping_add(self.ephemeral),
        )
    }

    fn conn_mut(&mut self, conn: ConnId) -> Result<&mut Conn> {
        self.conns
            .get_mut(&conn)
            .ok_or(Error::Protocol("unknown control block"))
    }

    /// The listener a connection to `remote` would reach, if any.
    fn listener_for(&self, kind: Kind, remote: SocketAddrV4) -> Option<ConnId> {
        self.conns.iter().find_map(|(&id, c)| {
            let local = c.local?;
            let port_match = local.port() == remote.port();
            let ip_match = *local.ip() == Ipv4Addr::UNSPECIFIED || local.ip() == remote.ip();
            let role_ok = match kind {
                Kind::Tcp => c.listening,
                Kind::Udp => true,
            };
            (c.kind == kind && role_ok && port_match && ip_match).then_some(id)
        })
    }
}

impl Engine for LoopEngine {
    fn tcp_open(&mut self) -> Result<ConnId> {
        Ok(self.open(Kind::Tcp))
    }

    fn tcp_bind(&mut self, conn: ConnId, local: SocketAddrV4) -> Result<()> {
        self.conn_mut(conn)?.local = Some(local);
        Ok(())
    }

    fn tcp_connect(&mut self, conn: ConnId, remote: SocketAddrV4) -> Result<()> {
        let local = match self.conn_mut(conn)?.local {
            Some(addr) => addr,
            None => {
                let addr = self.ephemeral_addr();
                self.conn_mut(conn)?.local = Some(addr);
                addr
            }
        };
        let Some(listener) = self.listener_for(Kind::Tcp, remote) else {
            debug!("connect to {remote}: nobody listening, resetting");
            self.events.push_back(Event::Reset { conn });
            return Ok(());
        };
        // Server side of the new connection.
        let server = self.open(Kind::Tcp);
        {
            let s = self.conn_mut(server)?;
            s.local = Some(remote);
            s.peer = Some(conn);
        }
        self.conn_mut(conn)?.peer = Some(server);
        self.events.push_back(Event::Inbound {
            listener,
            conn: server,
            local: remote,
            peer: local,
        });
        self.events.push_back(Event::Established {
            conn,
            local,
            peer: remote,
        });
        Ok(())
    }

    fn tcp_listen(&mut self, conn: ConnId, _backlog: u16) -> Result<()> {
        self.conn_mut(conn)?.listening = true;
        Ok(())
    }

    fn tcp_send(&mut self, conn: ConnId, data: &[u8]) -> Result<usize> {
        let peer = self
            .conn_mut(conn)?
            .peer
            .ok_or(Error::Protocol("stream has no peer"))?;
        self.events.push_back(Event::Data {
            conn: peer,
            payload: bytes::Bytes::copy_from_slice(data),
        });
        Ok(data.len())
    }

    fn tcp_close(&mut self, conn: ConnId) {
        if let Some(gone) = self.conns.remove(&conn) {
            if let Some(peer) = gone.peer {
                if let Some(p) = self.conns.get_mut(&peer) {
                    p.peer = None;
                    self.events.push_back(Event::PeerClosed { conn: peer });
                }
            }
        }
    }

    fn udp_open(&mut self) -> Result<ConnId> {
        Ok(self.open(Kind::Udp))
    }

    fn udp_bind(&mut self, conn: ConnId, local: SocketAddrV4) -> Result<()> {
        self.conn_mut(conn)?.local = Some(local);
        Ok(())
    }

    fn udp_send(&mut self, conn: ConnId, to: SocketAddrV4, data: &[u8]) -> Result<()> {
        let from = match self.conn_mut(conn)?.local {
            Some(addr) => addr,
            None => {
                let addr = self.ephemeral_addr();
                self.conn_mut(conn)?.local = Some(addr);
                addr
            }
        };
        match self.listener_for(Kind::Udp, to) {
            Some(dest) if dest != conn => self.events.push_back(Event::Datagram {
                conn: dest,
                from,
                payload: bytes::Bytes::copy_from_slice(data),
            }),
            // No delivery promise for datagrams.
            _ => debug!("datagram to {to}: no receiver, dropped"),
        }
        Ok(())
    }

    fn udp_close(&mut self, conn: ConnId) {
        self.conns.remove(&conn);
    }

    fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn connect_reaches_a_listener() {
        let mut eng = LoopEngine::new();
        let server = eng.tcp_open().unwrap();
        eng.tcp_bind(server, addr("0.0.0.0:7777")).unwrap();
        eng.tcp_listen(server, 4).unwrap();

        let client = eng.tcp_open().unwrap();
        eng.tcp_bind(client, addr("127.0.0.1:50000")).unwrap();
        eng.tcp_connect(client, addr("127.0.0.1:7777")).unwrap();

        let Some(Event::Inbound { listener, .. }) = eng.poll_event() else {
            panic!("expected inbound");
        };
        assert_eq!(listener, server);
        let Some(Event::Established { conn, peer, .. }) = eng.poll_event() else {
            panic!("expected establishment");
        };
        assert_eq!(conn, client);
        assert_eq!(peer, addr("127.0.0.1:7777"));
    }

    #[test]
    fn connect_without_listener_resets() {
        let mut eng = LoopEngine::new();
        let client = eng.tcp_open().unwrap();
        eng.tcp_connect(client, addr("127.0.0.1:9")).unwrap();
        assert!(matches!(eng.poll_event(), Some(Event::Reset { conn }) if conn == client));
    }

    #[test]
    fn datagrams_route_by_port() {
        let mut eng = LoopEngine::new();
        let rx = eng.udp_open().unwrap();
        eng.udp_bind(rx, addr("0.0.0.0:5353")).unwrap();
        let tx = eng.udp_open().unwrap();
        eng.udp_send(tx, addr("127.0.0.1:5353"), b"hi").unwrap();

        let Some(Event::Datagram { conn, payload, .. }) = eng.poll_event() else {
            panic!("expected datagram");
        };
        assert_eq!(conn, rx);
        assert_eq!(payload.as_ref(), b"hi");
    }
}
