#![forbid(unsafe_code)]
//! Network sockets as a hierarchical namespace.
//!
//! This crate adapts a single-threaded, callback-driven TCP/UDP protocol
//! engine into a file-like tree of endpoints: every socket is a directory of
//! small read/write files, and every operation either completes immediately
//! or reports "try again" — it never blocks.
//!
//! # Overview
//!
//! Two contracts meet here. Callers speak request/response file operations:
//! open, read, write, enumerate, close. Protocol engines speak callbacks:
//! "connection established", "data arrived", "connection reset", fired during
//! some unrelated call into the engine. The adapter reconciles them by
//! keeping every socket as an explicit state machine, turning engine
//! callbacks into [`Event`] values that are applied synchronously, and
//! waking suspended callers through a notification channel.
//!
//! # Getting Started
//!
//! To put a protocol engine behind a namespace, you need to:
//!
//! 1. Implement the [`Engine`] trait for your engine: the calls the
//!    namespace makes into it, plus [`Engine::poll_event`] for the events it
//!    reports back.
//! 2. Create a [`Netfs`] around it.
//! 3. Whenever your I/O-completion source feeds the engine, call
//!    [`Netfs::pump`] so the resulting events reach the sockets, then drain
//!    [`Netfs::take_ready`] to learn which suspended handles should retry.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::VecDeque;
//! use std::net::SocketAddrV4;
//!
//! use netfs::{ConnId, Engine, Event, Netfs, Progress, Result};
//!
//! /// An engine stub that never completes anything.
//! #[derive(Default)]
//! struct NullEngine {
//!     next: u64,
//!     events: VecDeque<Event>,
//! }
//!
//! impl Engine for NullEngine {
//!     fn tcp_open(&mut self) -> Result<ConnId> {
//!         self.next += 1;
//!         Ok(ConnId(self.next))
//!     }
//!     fn tcp_bind(&mut self, _: ConnId, _: SocketAddrV4) -> Result<()> {
//!         Ok(())
//!     }
//!     fn tcp_connect(&mut self, _: ConnId, _: SocketAddrV4) -> Result<()> {
//!         Ok(())
//!     }
//!     fn tcp_listen(&mut self, _: ConnId, _: u16) -> Result<()> {
//!         Ok(())
//!     }
//!     fn tcp_send(&mut self, _: ConnId, data: &[u8]) -> Result<usize> {
//!         Ok(data.len())
//!     }
//!     fn tcp_close(&mut self, _: ConnId) {}
//!     fn udp_open(&mut self) -> Result<ConnId> {
//!         self.next += 1;
//!         Ok(ConnId(self.next))
//!     }
//!     fn udp_bind(&mut self, _: ConnId, _: SocketAddrV4) -> Result<()> {
//!         Ok(())
//!     }
//!     fn udp_send(&mut self, _: ConnId, _: SocketAddrV4, _: &[u8]) -> Result<()> {
//!         Ok(())
//!     }
//!     fn udp_close(&mut self, _: ConnId) {}
//!     fn poll_event(&mut self) -> Option<Event> {
//!         self.events.pop_front()
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let mut fs = Netfs::new(NullEngine::default());
//!
//!     // Reading the allocation endpoint names a fresh socket.
//!     let alloc = fs.open_path("tcp/new_socket")?;
//!     if let Progress::Ready(name) = fs.read(alloc, 64)? {
//!         println!("allocated {}", String::from_utf8_lossy(&name));
//!     }
//!     fs.close(alloc)?;
//!     Ok(())
//! }
//! ```
//!
//! # The namespace
//!
//! ```text
//! /<proto>/new_socket                        read  -> "<proto>/<id>\n"
//! /<proto>/<id>/bind      write "ip:port"    /<id>/data    read/write payload
//! /<proto>/<id>/connect   write "ip:port"    /<id>/local   read "ip:port\n"
//! /<proto>/<id>/listen    write "<backlog>"  /<id>/remote  read "ip:port\n"
//! /<proto>/<id>/accept    read -> "<proto>/<newid>\n"
//! udp only:               /<id>/from  read "ip:port\n"
//!                         /<id>/to    write "ip:port"
//! ```
//!
//! Enumerating a protocol directory lists the live identifiers; enumerating
//! a socket lists only the endpoints legal for its current state (`accept`
//! appears only while listening).
//!
//! # Error Handling
//!
//! "Not yet" is not an error: reads and writes return
//! [`Progress::Pending`] when they cannot complete, and the caller registers
//! with [`Netfs::register`] to be woken. Genuine failures use
//! [`error::Error`], which maps onto POSIX errno via [`Error::errno`] for
//! embedding under a file server. A closed stream reads as an empty success
//! (end of stream), never as an error.
//!
//! # Concurrency Model
//!
//! Single-threaded and cooperative: every entry point takes `&mut self`, so
//! there is no locking and no true concurrency — only re-entrancy. A write
//! into the engine may complete other sockets' work synchronously; the
//! dispatch layer applies all such events before the write inspects its own
//! result, so state is never mutated "behind" an observed return value.

pub mod engine;
pub mod error;
pub mod event;
pub mod node;
pub mod notify;
pub mod ns;
pub mod tcp;
pub mod udp;
pub mod utils;

pub use crate::engine::{ConnId, Engine};
pub use crate::error::Error;
pub use crate::event::{Event, Interest};
pub use crate::node::{EndpointKind, Proto, SockId};
pub use crate::ns::{Handle, Limits, Netfs};
pub use crate::utils::{Progress, Result};
