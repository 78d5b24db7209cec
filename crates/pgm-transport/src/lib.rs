//! # pgm-transport
//!
//! Pure-Rust PGM (Pragmatic General Multicast, RFC 3208) protocol engine:
//! NAK-based reliable multicast with Reed-Solomon on-demand parity, SPM
//! heartbeats, and token-bucket rate regulation.
//!
//! Socket I/O stays with the host: inbound datagrams are fed to
//! [`transport::Transport::handle_packet`], outbound packets leave through a
//! [`transport::PacketSink`]. Timers run on a dedicated thread
//! ([`transport::Transport::spawn_timer`]) or under a caller-owned reactor
//! via [`transport::Transport::poll_info`] and
//! [`transport::Transport::tick`].
//!
//! ## Crate structure
//!
//! - [`wire`] — RFC 3208 headers, options chain, NLA encoding
//! - [`checksum`] — ones-complement partial/fold/copy checksum paths
//! - [`sqn`] — wrapping sequence numbers, NAK list accumulation
//! - [`tsi`] — GSI/TSI session identity
//! - [`skb`] — transmit/receive packet buffers
//! - [`fec`] — systematic Reed-Solomon over GF(2^8)
//! - [`rate`] — token-bucket rate regulation
//! - [`txw`] — transmit window and retransmit queue
//! - [`rxw`] — receive window, NAK ladder state machine, reassembly
//! - [`source`] — SPM schedule, ODATA/RDATA emission, NAK handling
//! - [`receiver`] — peer lifecycle, NAK scheduling, delivery
//! - [`timer`] — unified next-expiry wake-up
//! - [`transport`] — the session object and its API surface
//! - [`stats`] — counters
//! - [`error`] — error taxonomy and I/O status codes

pub mod checksum;
pub mod error;
pub mod fec;
pub mod rate;
pub mod receiver;
pub mod rxw;
pub mod skb;
pub mod source;
pub mod sqn;
pub mod stats;
pub mod timer;
pub mod transport;
pub mod tsi;
pub mod txw;
pub mod wire;

pub use error::{IoStatus, PgmError};
pub use transport::{PacketSink, PollInfo, Transport, TransportConfig};
pub use tsi::{Gsi, Tsi};
