//! Connection state machine: handshake, window-1 data transfer, reordering,
//! and teardown.
//!
//! # Architecture
//!
//! ```text
//!  ChaosStream (foreground)
//!      │ Command::Write / Command::Close (mpsc)
//!      ▼
//!  connection actor ──────────── owns ─────────────┐
//!    ├── Connection   (indices, counters,          │ run() task
//!    │                 pending map, DaemonWriter)  │
//!    ├── DaemonReader (framed packets in)          │
//!    └── BufferWriter (in-order bytes out) ──▶ BufferReader (foreground)
//! ```
//!
//! A single task owns the transport and every piece of mutable connection
//! state, exchanging messages with the foreground instead of sharing locks.
//! While a write waits for its acknowledgment, incoming packets are still
//! routed through the normal dispatch path, so interleaved control traffic
//! is handled correctly.
//!
//! Flow control is window-1: exactly one unacknowledged packet at a time.
//! The receiver never retransmits; only the handshake RFC is ever resent.

use crate::buffer::BufferWriter;
use crate::config::TransportConfig;
use crate::error::{ChaosError, Result};
use crate::packet::{Opcode, Packet, MAX_DATA_SIZE};
use crate::transport::{DaemonReader, DaemonTransport, DaemonWriter};
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Window advertised in every STS acknowledgment.
const STS_WINDOW: u16 = 0x40;

/// Reason text carried by outgoing CLS packets.
const CLOSE_REASON: &[u8] = b"Ending connection.";

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Established,
    Closing,
    Closed,
}

/// Requests from the foreground stream to the connection actor.
pub(crate) enum Command {
    /// Send all bytes (chunked, each chunk acknowledged) followed by EOF.
    Write(Bytes, oneshot::Sender<Result<()>>),
    /// Tear the connection down.
    Close(oneshot::Sender<Result<()>>),
}

/// Protocol state for one conversation with the remote host.
///
/// Exclusively owned by the actor task after the handshake completes.
pub(crate) struct Connection {
    local_addr: u16,
    /// Randomly chosen per connection.
    local_idx: u16,
    remote_addr: u16,
    /// Learned from the peer's OPN during the handshake.
    remote_idx: u16,
    /// Our send sequence counter, wraps modulo 65536.
    my_pkt_num: u16,
    /// Last in-order sequence number accepted from the peer.
    remote_pkt_num: u16,
    /// Out-of-order packets held until contiguity is restored. Never dropped.
    pending: HashMap<u16, Packet>,
    state: ConnState,
    state_tx: watch::Sender<ConnState>,
    writer: DaemonWriter,
    buffer: BufferWriter,
}

impl Connection {
    /// Connect to the daemon and run the handshake.
    ///
    /// Returns the established connection together with the reader half the
    /// actor loop will poll.
    pub(crate) async fn open(
        local_addr: u16,
        remote_addr: u16,
        service: &[u8],
        config: &TransportConfig,
        buffer: BufferWriter,
        state_tx: watch::Sender<ConnState>,
    ) -> Result<(Self, DaemonReader)> {
        let transport = DaemonTransport::connect(config).await?;
        let (mut reader, writer) = transport.split();

        let mut conn = Self {
            local_addr,
            local_idx: rand::rng().random(),
            remote_addr,
            remote_idx: 0,
            my_pkt_num: 0,
            remote_pkt_num: 0,
            pending: HashMap::new(),
            state: ConnState::Connecting,
            state_tx,
            writer,
            buffer,
        };
        conn.handshake(&mut reader, service, config).await?;
        Ok((conn, reader))
    }

    pub(crate) fn state(&self) -> ConnState {
        self.state
    }

    fn set_state(&mut self, state: ConnState) {
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    /// Mark the connection dead after a transport failure and unblock the
    /// reader. The consumer cannot tell this apart from a clean close.
    pub(crate) fn abort(&mut self) {
        self.set_state(ConnState::Closed);
        self.buffer.finish();
    }

    pub(crate) fn finish_buffer(&mut self) {
        self.buffer.finish();
    }

    /// A packet belongs to this conversation when the link-layer destination
    /// is our address and the destination index is our index.
    fn is_for_this_connection(&self, pkt: &Packet) -> bool {
        pkt.hw_dest == self.local_addr && pkt.dest_idx == self.local_idx
    }

    // -----------------------------------------------------------------------
    // Handshake
    // -----------------------------------------------------------------------

    /// Send the RFC and wait for the peer's verdict.
    ///
    /// The RFC is resent after every `resend_after` receive timeouts without
    /// a response. CLS, ANS, or any opcode other than OPN fails the attempt;
    /// there is no retry beyond the resend schedule.
    async fn handshake(
        &mut self,
        reader: &mut DaemonReader,
        service: &[u8],
        config: &TransportConfig,
    ) -> Result<()> {
        self.send_rfc(service).await?;
        let mut idle_ticks = 0u32;

        loop {
            let pkt = match reader.recv_timeout(config.recv_timeout).await {
                Ok(Some(pkt)) => pkt,
                Ok(None) => {
                    idle_ticks += 1;
                    if idle_ticks % config.resend_after.max(1) == 0 {
                        debug!(service = %String::from_utf8_lossy(service), "no OPN yet, resending RFC");
                        self.send_rfc(service).await?;
                    }
                    continue;
                }
                Err(ChaosError::MalformedPacket(e)) => {
                    warn!("dropping malformed frame during handshake: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !self.is_for_this_connection(&pkt) {
                continue;
            }

            match pkt.op {
                Opcode::Opn => {
                    // The OPN payload is the peer's window size; a window-1
                    // sender has no use for it.
                    self.remote_idx = pkt.src_idx;
                    self.remote_pkt_num = pkt.pkt_num;
                    self.send_sts_ack().await?;
                    self.set_state(ConnState::Established);
                    info!(
                        remote_addr = self.remote_addr,
                        remote_idx = self.remote_idx,
                        "connection established"
                    );
                    return Ok(());
                }
                Opcode::Cls => {
                    return Err(ChaosError::Handshake(format!(
                        "peer refused the connection: {}",
                        String::from_utf8_lossy(&pkt.payload)
                    )));
                }
                Opcode::Ans => {
                    return Err(ChaosError::Handshake(
                        "peer sent a simple answer, which this engine cannot carry".to_string(),
                    ));
                }
                other => {
                    return Err(ChaosError::Handshake(format!(
                        "unsupported response {other:?} during handshake"
                    )));
                }
            }
        }
    }

    async fn send_rfc(&mut self, service: &[u8]) -> Result<()> {
        let rfc = Packet::new(
            Opcode::Rfc,
            service.to_vec(),
            self.remote_addr,
            self.remote_idx,
            self.local_addr,
            self.local_idx,
            self.my_pkt_num,
            self.remote_pkt_num,
        )?;
        self.writer.send(&rfc).await
    }

    /// Acknowledge everything up to `remote_pkt_num`: STS with a
    /// `<receipt, window>` payload. Consumes no sequence number.
    async fn send_sts_ack(&mut self) -> Result<()> {
        let mut receipt = BytesMut::with_capacity(4);
        receipt.put_u16_le(self.remote_pkt_num);
        receipt.put_u16_le(STS_WINDOW);
        let sts = Packet::new(
            Opcode::Sts,
            receipt.freeze(),
            self.remote_addr,
            self.remote_idx,
            self.local_addr,
            self.local_idx,
            self.my_pkt_num,
            self.remote_pkt_num,
        )?;
        self.writer.send(&sts).await
    }

    // -----------------------------------------------------------------------
    // Receive dispatch
    // -----------------------------------------------------------------------

    /// Route one incoming packet, then drain any pending successors.
    ///
    /// The drain is an explicit loop: each accepted packet may make the next
    /// sequence number available in the pending map, and long reordering
    /// runs must not grow the stack.
    pub(crate) async fn dispatch(&mut self, pkt: Packet) -> Result<()> {
        if self.state == ConnState::Closed || !self.is_for_this_connection(&pkt) {
            return Ok(());
        }

        let mut current = Some(pkt);
        while let Some(pkt) = current.take() {
            let advanced = self.handle_packet(pkt).await?;
            if advanced {
                let next = self.remote_pkt_num.wrapping_add(1);
                current = self.pending.remove(&next);
            }
        }
        Ok(())
    }

    /// Handle a single packet addressed to this connection.
    ///
    /// Returns true when the in-order sequence advanced (the caller then
    /// checks the pending map for the successor).
    async fn handle_packet(&mut self, pkt: Packet) -> Result<bool> {
        let next = self.remote_pkt_num.wrapping_add(1);

        match pkt.op {
            Opcode::Cls => {
                debug!(
                    reason = %String::from_utf8_lossy(&pkt.payload),
                    "peer closed the connection"
                );
                self.close().await?;
                self.buffer.finish();
                Ok(false)
            }

            Opcode::Eof => {
                if pkt.pkt_num != next {
                    debug!(got = pkt.pkt_num, expected = next, "queuing out-of-order EOF");
                    self.pending.insert(pkt.pkt_num, pkt);
                    return Ok(false);
                }
                self.remote_pkt_num = pkt.pkt_num;
                self.send_sts_ack().await?;
                self.close().await?;
                self.buffer.finish();
                Ok(false)
            }

            Opcode::Sns => {
                // Status request: repeat the last acknowledgment.
                self.send_sts_ack().await?;
                Ok(false)
            }

            op if op.is_data() => {
                if pkt.pkt_num != next {
                    debug!(got = pkt.pkt_num, expected = next, "queuing out-of-order data");
                    self.pending.insert(pkt.pkt_num, pkt);
                    return Ok(false);
                }
                self.remote_pkt_num = pkt.pkt_num;
                self.send_sts_ack().await?;
                self.buffer.push(pkt.payload);
                Ok(true)
            }

            other => {
                debug!(op = ?other, "ignoring unhandled opcode");
                Ok(false)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    /// Send `data` as acknowledged ≤488-byte chunks followed by EOF.
    ///
    /// Each chunk consumes one sequence number and must be acknowledged
    /// before the next is sent (window-1). Total transfer time is therefore
    /// proportional to round-trip latency times chunk count.
    pub(crate) async fn write_all(&mut self, data: Bytes, reader: &mut DaemonReader) -> Result<()> {
        if self.state != ConnState::Established {
            return Err(ChaosError::ConnectionClosed);
        }

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MAX_DATA_SIZE).min(data.len());
            self.send_controlled(Opcode::Dat, data.slice(offset..end), reader)
                .await?;
            offset = end;
        }
        self.send_controlled(Opcode::Eof, Bytes::new(), reader).await
    }

    /// Send one sequence-numbered packet and wait for its acknowledgment.
    async fn send_controlled(
        &mut self,
        op: Opcode,
        payload: Bytes,
        reader: &mut DaemonReader,
    ) -> Result<()> {
        self.my_pkt_num = self.my_pkt_num.wrapping_add(1);
        let pkt = Packet::new(
            op,
            payload,
            self.remote_addr,
            self.remote_idx,
            self.local_addr,
            self.local_idx,
            self.my_pkt_num,
            self.remote_pkt_num,
        )?;
        self.writer.send(&pkt).await?;
        self.wait_for_ack(reader).await
    }

    /// Block until an STS acknowledging the just-sent sequence number
    /// arrives. Any other packet received in the interim goes through the
    /// normal dispatch path.
    async fn wait_for_ack(&mut self, reader: &mut DaemonReader) -> Result<()> {
        let expected = self.my_pkt_num;

        loop {
            let pkt = match reader.recv().await {
                Ok(pkt) => pkt,
                Err(ChaosError::MalformedPacket(e)) => {
                    warn!("dropping malformed frame while awaiting ack: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if self.is_for_this_connection(&pkt) && pkt.op == Opcode::Sts {
                let Some(receipt) = sts_receipt(&pkt) else {
                    warn!("STS with truncated payload, ignoring");
                    continue;
                };
                if receipt == expected {
                    debug!(pkt_num = expected, "chunk acknowledged");
                    return Ok(());
                }
                // Sequence mismatch is logged, never fatal; keep waiting.
                warn!(receipt, expected, "acknowledgment for a different packet");
                continue;
            }

            self.dispatch(pkt).await?;
            if self.state == ConnState::Closed {
                return Err(ChaosError::ConnectionClosed);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Send CLS and transition to `Closed`. Idempotent: once closed, calling
    /// again sends nothing and succeeds.
    pub(crate) async fn close(&mut self) -> Result<()> {
        if self.state == ConnState::Closed {
            return Ok(());
        }
        self.set_state(ConnState::Closing);
        self.my_pkt_num = self.my_pkt_num.wrapping_add(1);
        let cls = Packet::new(
            Opcode::Cls,
            CLOSE_REASON,
            self.remote_addr,
            self.remote_idx,
            self.local_addr,
            self.local_idx,
            self.my_pkt_num,
            self.remote_pkt_num,
        )?;
        let sent = self.writer.send(&cls).await;
        // Closed regardless: a dead channel still ends the connection.
        self.set_state(ConnState::Closed);
        info!("connection closed");
        sent
    }
}

/// Extract the receipt field from an STS payload.
fn sts_receipt(pkt: &Packet) -> Option<u16> {
    if pkt.payload.len() < 2 {
        return None;
    }
    Some(u16::from_le_bytes([pkt.payload[0], pkt.payload[1]]))
}

// ---------------------------------------------------------------------------
// Actor loop
// ---------------------------------------------------------------------------

/// Background task owning the connection for its whole lifetime.
///
/// Multiplexes incoming packets and foreground commands. Exits when the
/// connection reaches `Closed` (by either side) or the command channel
/// closes; the end-of-stream sentinel is pushed on every exit path, and
/// dropping the connection releases the transport.
pub(crate) async fn run(
    mut conn: Connection,
    mut reader: DaemonReader,
    mut commands: mpsc::Receiver<Command>,
) {
    loop {
        tokio::select! {
            frame = reader.recv() => {
                match frame {
                    Ok(pkt) => {
                        if let Err(e) = conn.dispatch(pkt).await {
                            warn!(error = %e, "dispatch failed, tearing down");
                            conn.abort();
                            break;
                        }
                        if conn.state() == ConnState::Closed {
                            break;
                        }
                    }
                    Err(ChaosError::MalformedPacket(e)) => {
                        warn!("dropping malformed frame: {e}");
                    }
                    Err(e) => {
                        warn!(error = %e, "daemon channel failed");
                        conn.abort();
                        break;
                    }
                }
            }

            cmd = commands.recv() => {
                match cmd {
                    Some(Command::Write(data, done)) => {
                        let result = conn.write_all(data, &mut reader).await;
                        let fatal = matches!(result, Err(ChaosError::Transport(_)));
                        let _ = done.send(result);
                        if fatal {
                            conn.abort();
                            break;
                        }
                        if conn.state() == ConnState::Closed {
                            break;
                        }
                    }
                    Some(Command::Close(done)) => {
                        let _ = done.send(conn.close().await);
                        break;
                    }
                    // Stream dropped without an explicit close.
                    None => {
                        let _ = conn.close().await;
                        break;
                    }
                }
            }
        }
    }
    conn.finish_buffer();
}
