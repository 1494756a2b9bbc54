//! CHAOS-style transport bridge.
//!
//! Connects modern clients to a legacy packet-switched network spoken by a
//! remote host that is reachable only through a local `chaosd` daemon. The
//! crate is the protocol engine; HTTP handling, listeners, and the daemon
//! itself live elsewhere and see only the [`ChaosStream`] surface.
//!
//! # Architecture
//!
//! ```text
//! gateway                 this crate                            chaosd
//! +---------+   open    +-------------+  framed packets   +------------+
//! | HTTP    | --------> | ChaosStream | <---------------> | rendezvous |
//! | gateway |  write/   |  connection |   (unix socket)   |   daemon   |
//! |         |  read_all |  actor task |                   +------------+
//! +---------+           +-------------+
//! ```
//!
//! Layers, leaves first:
//! - [`packet`] - wire codec: 16-byte header, padded payload, 6-byte trailer.
//! - [`transport`] - rendezvous connect and 4-byte length framing to chaosd.
//! - [`connection`] - handshake, window-1 flow control, reordering, teardown.
//! - [`buffer`] - ordered, sentinel-terminated byte queue feeding the reader.
//! - [`stream`] - the open/write/read_all/close surface gateways consume.
//! - [`text`] - CADR line-ending translation for text payloads.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod packet;
pub mod stream;
pub mod text;
pub mod transport;

pub use config::TransportConfig;
pub use connection::ConnState;
pub use error::{ChaosError, Result};
pub use packet::{Opcode, Packet, MAX_DATA_SIZE};
pub use stream::ChaosStream;
pub use text::{cadr_to_newlines, newlines_to_cadr, CADR_RETURN};
