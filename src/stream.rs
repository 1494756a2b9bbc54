//! The consumer-facing stream surface.
//!
//! An HTTP gateway (or any other embedder) opens a [`ChaosStream`], writes
//! the request bytes, reads the reply to end-of-stream, and closes. All
//! protocol mechanics - handshake, chunking, acknowledgments, reordering -
//! happen behind this surface.
//!
//! ```no_run
//! # async fn demo() -> chaos_stream::Result<()> {
//! use chaos_stream::ChaosStream;
//!
//! let mut stream = ChaosStream::open(0o406, 0o401, "HTTP").await?;
//! stream.write(&b"GET / HTTP/1.1\x8d\x8d"[..]).await?;
//! let reply = stream.read_all().await;
//! stream.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::buffer::{reassembly_buffer, BufferReader};
use crate::config::TransportConfig;
use crate::connection::{self, Command, ConnState, Connection};
use crate::error::{ChaosError, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// One conversation with a service on the remote host.
///
/// Owns exactly one connection and its background receive task. Dropping the
/// stream without calling [`close`](Self::close) still tears the connection
/// down (the actor sends CLS when the command channel goes away), but only
/// `close` joins the background task.
#[derive(Debug)]
pub struct ChaosStream {
    commands: mpsc::Sender<Command>,
    reader: BufferReader,
    state: watch::Receiver<ConnState>,
    task: Option<JoinHandle<()>>,
}

impl ChaosStream {
    /// Open a connection to `service` on the remote host, using the default
    /// daemon rendezvous under /var/tmp.
    ///
    /// Runs the handshake before returning; the background receive loop is
    /// running by the time the caller gets the stream.
    pub async fn open(local_addr: u16, remote_addr: u16, service: &str) -> Result<Self> {
        Self::open_with_config(local_addr, remote_addr, service, &TransportConfig::default()).await
    }

    /// Like [`open`](Self::open), with explicit transport tunables.
    pub async fn open_with_config(
        local_addr: u16,
        remote_addr: u16,
        service: &str,
        config: &TransportConfig,
    ) -> Result<Self> {
        let (buf_writer, buf_reader) = reassembly_buffer();
        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);

        let (conn, reader) = Connection::open(
            local_addr,
            remote_addr,
            service.as_bytes(),
            config,
            buf_writer,
            state_tx,
        )
        .await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let task = tokio::spawn(connection::run(conn, reader, cmd_rx));

        Ok(Self {
            commands: cmd_tx,
            reader: buf_reader,
            state: state_rx,
            task: Some(task),
        })
    }

    /// Send `data` to the peer, chunked and flow-controlled.
    ///
    /// Resolves only after every chunk and the trailing end-of-data packet
    /// have been acknowledged.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Write(data.into(), done_tx))
            .await
            .map_err(|_| ChaosError::ConnectionClosed)?;
        done_rx.await.map_err(|_| ChaosError::ConnectionClosed)?
    }

    /// Read everything the peer sends, up to end-of-stream.
    pub async fn read_all(&mut self) -> Bytes {
        self.reader.read_all().await
    }

    /// Read up to `n` bytes, stopping early at end-of-stream.
    pub async fn read_exactly(&mut self, n: usize) -> Bytes {
        self.reader.read_exactly(n).await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Tear the connection down and join the background task.
    ///
    /// Idempotent: the first call sends the CLS packet, later calls (and
    /// calls racing a peer-initiated close) succeed without sending anything.
    pub async fn close(&mut self) -> Result<()> {
        let result = {
            let (done_tx, done_rx) = oneshot::channel();
            match self.commands.send(Command::Close(done_tx)).await {
                Ok(()) => done_rx.await.unwrap_or(Ok(())),
                // Actor already gone: the connection is closed.
                Err(_) => Ok(()),
            }
        };
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        result
    }
}
