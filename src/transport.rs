//! Rendezvous connection to the local chaosd daemon.
//!
//! The daemon is an opaque, already-reliable packet carrier reached over a
//! Unix stream socket. Every packet travels inside a 4-byte frame:
//!
//! ```text
//! byte 0: high byte of packet length
//! byte 1: low byte of packet length   (big-endian u16)
//! byte 2: reserved, zero
//! byte 3: reserved, zero
//! ```
//!
//! followed by the encoded packet itself.
//!
//! Before connecting, each connection binds its own uniquely named endpoint
//! in the rendezvous directory (the daemon expects clients to have a name)
//! and unlinks that name as soon as the connection succeeds, so no stale
//! socket files survive the process.
//!
//! The connected transport splits into an owned [`DaemonReader`] /
//! [`DaemonWriter`] pair. The connection actor owns both, so sends are
//! serialized by construction and cannot interleave mid-frame.

use crate::config::TransportConfig;
use crate::error::Result;
use crate::packet::Packet;
use bytes::{BufMut, BytesMut};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::{debug, trace};

/// Length of the frame header prefixed to every packet.
pub const FRAME_HEADER_LEN: usize = 4;

/// Distinguishes concurrent connections within one process; the process id
/// alone is not enough when several streams are open at once.
static RENDEZVOUS_SEQ: AtomicU64 = AtomicU64::new(0);

/// A live channel to the chaosd daemon.
pub struct DaemonTransport {
    stream: UnixStream,
}

/// Receiving half: reads and decodes framed packets.
///
/// Incoming bytes accumulate in an internal buffer, so a cancelled `recv`
/// (timeout, or losing a `select!` race against a foreground command) never
/// loses partial-frame progress or desynchronizes the stream.
pub struct DaemonReader {
    half: OwnedReadHalf,
    acc: BytesMut,
}

/// Sending half: frames and writes packets.
pub struct DaemonWriter {
    half: OwnedWriteHalf,
}

impl DaemonTransport {
    /// Bind a unique local rendezvous name, connect to the daemon, then
    /// unlink the local name.
    pub async fn connect(config: &TransportConfig) -> Result<Self> {
        let seq = RENDEZVOUS_SEQ.fetch_add(1, Ordering::Relaxed);
        let local_name = config
            .rendezvous_dir
            .join(format!("chaosd_{}_{}", std::process::id(), seq));

        // A previous crash may have left the name behind.
        if local_name.exists() {
            std::fs::remove_file(&local_name)?;
        }

        let std_stream = bind_and_connect(&local_name, &config.daemon_path)?;
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;

        // Connected; the name has served its purpose.
        std::fs::remove_file(&local_name)?;

        debug!(daemon = %config.daemon_path.display(), "connected to chaosd");
        Ok(Self { stream })
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (DaemonReader, DaemonWriter) {
        let (read, write) = self.stream.into_split();
        (
            DaemonReader {
                half: read,
                acc: BytesMut::with_capacity(4096),
            },
            DaemonWriter { half: write },
        )
    }
}

impl DaemonWriter {
    /// Frame and send one packet as a single buffered write.
    pub async fn send(&mut self, pkt: &Packet) -> Result<()> {
        let frame = pkt.encode();
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + frame.len());
        buf.put_u16(frame.len() as u16);
        buf.put_u16(0);
        buf.put_slice(&frame);
        self.half.write_all(&buf).await?;
        trace!(op = ?pkt.op, pkt_num = pkt.pkt_num, len = pkt.payload.len(), "sent packet");
        Ok(())
    }
}

impl DaemonReader {
    /// Read the next framed packet, waiting as long as it takes.
    ///
    /// Decode failures surface as [`crate::error::ChaosError::MalformedPacket`];
    /// the frame boundary itself is intact, so the caller may drop the frame
    /// and keep reading. Any I/O failure means the channel is dead.
    pub async fn recv(&mut self) -> Result<Packet> {
        loop {
            if let Some(frame) = self.take_frame() {
                let pkt = Packet::decode(&frame)?;
                trace!(op = ?pkt.op, pkt_num = pkt.pkt_num, len = pkt.payload.len(), "received packet");
                return Ok(pkt);
            }
            let n = self.half.read_buf(&mut self.acc).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "daemon closed the channel",
                )
                .into());
            }
        }
    }

    /// Pop one complete frame off the accumulation buffer, if present.
    fn take_frame(&mut self) -> Option<BytesMut> {
        if self.acc.len() < FRAME_HEADER_LEN {
            return None;
        }
        let len = u16::from_be_bytes([self.acc[0], self.acc[1]]) as usize;
        if self.acc.len() < FRAME_HEADER_LEN + len {
            return None;
        }
        let mut frame = self.acc.split_to(FRAME_HEADER_LEN + len);
        let _ = frame.split_to(FRAME_HEADER_LEN);
        Some(frame)
    }

    /// Read the next framed packet, giving up after `deadline`.
    ///
    /// Returns `Ok(None)` when the deadline passes; any bytes already read
    /// stay buffered for the next call.
    pub async fn recv_timeout(&mut self, deadline: Duration) -> Result<Option<Packet>> {
        match tokio::time::timeout(deadline, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

#[cfg(unix)]
fn bind_and_connect(local: &Path, daemon: &Path) -> std::io::Result<std::os::unix::net::UnixStream> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // Owns the fd from here on; closed on any error below.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };

    let local_addr = sockaddr_un(local)?;
    let rc = unsafe {
        libc::bind(
            fd,
            &local_addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let daemon_addr = sockaddr_un(daemon)?;
    let rc = unsafe {
        libc::connect(
            fd,
            &daemon_addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(stream)
}

#[cfg(unix)]
fn sockaddr_un(path: &Path) -> std::io::Result<libc::sockaddr_un> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // Leave room for the terminating NUL.
    if bytes.len() >= addr.sun_path.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("socket path too long: {}", path.display()),
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(addr)
}
