//! End-to-end tests against an in-process fake chaosd.
//!
//! The fake daemon plays both the rendezvous socket and the remote host: it
//! accepts the client connection, answers the handshake, acknowledges data
//! packets, and injects replies - including reordered and refused scenarios.

use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use chaos_stream::packet::{Opcode, Packet};
use chaos_stream::{ChaosStream, ConnState, TransportConfig};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const CLIENT_ADDR: u16 = 0o406;
const SERVER_ADDR: u16 = 0o401;
const SERVER_IDX: u16 = 0x22;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config(dir: &Path) -> TransportConfig {
    TransportConfig {
        daemon_path: dir.join("chaosd_server"),
        rendezvous_dir: dir.to_path_buf(),
        recv_timeout: Duration::from_millis(50),
        resend_after: 3,
    }
}

/// The daemon's side of one client connection.
struct DaemonConn {
    stream: UnixStream,
    /// Client connection index, learned from the RFC.
    client_idx: u16,
    /// Sequence counter for packets "from the remote host".
    pkt_num: u16,
}

impl DaemonConn {
    async fn accept(listener: &UnixListener) -> Result<Self> {
        let (stream, _) = listener.accept().await?;
        Ok(Self {
            stream,
            client_idx: 0,
            pkt_num: 0,
        })
    }

    /// Read one framed packet; None when the client hung up.
    async fn read_packet(&mut self) -> Result<Option<Packet>> {
        let mut header = [0u8; 4];
        match self.stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;
        Ok(Some(Packet::decode(&body)?))
    }

    async fn send_packet(&mut self, pkt: &Packet) -> Result<()> {
        let frame = pkt.encode();
        self.send_raw(&frame).await
    }

    /// Write a raw frame body with the daemon length header, bypassing the
    /// codec.
    async fn send_raw(&mut self, body: &[u8]) -> Result<()> {
        let mut wire = BytesMut::with_capacity(4 + body.len());
        wire.put_u16(body.len() as u16);
        wire.put_u16(0);
        wire.put_slice(body);
        self.stream.write_all(&wire).await?;
        Ok(())
    }

    fn to_client(&self, op: Opcode, payload: impl Into<Bytes>, pkt_num: u16, ack: u16) -> Packet {
        Packet::new(
            op,
            payload,
            CLIENT_ADDR,
            self.client_idx,
            SERVER_ADDR,
            SERVER_IDX,
            pkt_num,
            ack,
        )
        .expect("test packet within size limits")
    }

    /// Answer the client's RFC with OPN and consume the completing STS.
    async fn accept_handshake(&mut self, start_pkt_num: u16) -> Result<Packet> {
        let rfc = self.read_packet().await?.expect("expected RFC");
        assert_eq!(rfc.op, Opcode::Rfc);
        assert_eq!(rfc.src_addr, CLIENT_ADDR);
        assert_eq!(rfc.dest_addr, SERVER_ADDR);
        assert_eq!(rfc.pkt_num, 0);
        self.client_idx = rfc.src_idx;
        self.pkt_num = start_pkt_num;

        let mut window = BytesMut::new();
        window.put_u16_le(0x40);
        let opn = self.to_client(Opcode::Opn, window.freeze(), start_pkt_num, rfc.pkt_num);
        self.send_packet(&opn).await?;

        let sts = self.read_packet().await?.expect("expected handshake STS");
        assert_eq!(sts.op, Opcode::Sts);
        assert_eq!(sts_receipt(&sts), start_pkt_num);
        Ok(rfc)
    }

    /// Send one controlled packet and wait for the client's STS receipt.
    async fn send_acknowledged(&mut self, op: Opcode, payload: &[u8]) -> Result<()> {
        self.pkt_num = self.pkt_num.wrapping_add(1);
        let pkt = self.to_client(op, payload.to_vec(), self.pkt_num, 0);
        self.send_packet(&pkt).await?;
        let sts = self.read_packet().await?.expect("expected STS");
        assert_eq!(sts.op, Opcode::Sts);
        assert_eq!(sts_receipt(&sts), self.pkt_num);
        Ok(())
    }

    /// Acknowledge a controlled packet the client just sent.
    async fn ack(&mut self, pkt: &Packet) -> Result<()> {
        let mut receipt = BytesMut::new();
        receipt.put_u16_le(pkt.pkt_num);
        receipt.put_u16_le(0x40);
        let sts = self.to_client(Opcode::Sts, receipt.freeze(), self.pkt_num, pkt.pkt_num);
        self.send_packet(&sts).await
    }
}

fn sts_receipt(pkt: &Packet) -> u16 {
    u16::from_le_bytes([pkt.payload[0], pkt.payload[1]])
}

#[tokio::test]
async fn end_to_end_http_exchange() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let request = Bytes::from_static(b"GET / HTTP/1.0\x8d\x8d\x8d");
    assert_eq!(request.len(), 17);
    let expected = request.clone();

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        conn.accept_handshake(100).await?;

        // The 17-byte request arrives as one data packet, then EOF.
        let dat = conn.read_packet().await?.expect("expected DAT");
        assert_eq!(dat.op, Opcode::Dat);
        assert_eq!(dat.pkt_num, 1);
        assert_eq!(dat.payload, expected);
        conn.ack(&dat).await?;

        let eof = conn.read_packet().await?.expect("expected EOF");
        assert_eq!(eof.op, Opcode::Eof);
        assert_eq!(eof.pkt_num, 2);
        assert!(eof.payload.is_empty());
        conn.ack(&eof).await?;

        // Remote replies "OK" and ends its half of the conversation.
        conn.send_acknowledged(Opcode::Dat, b"OK").await?;
        conn.send_acknowledged(Opcode::Eof, b"").await?;

        // Accepting EOF makes the client tear down with a CLS.
        let cls = conn.read_packet().await?.expect("expected CLS");
        assert_eq!(cls.op, Opcode::Cls);
        anyhow::Ok(())
    });

    let mut stream =
        ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "HTTP", &config).await?;
    assert_eq!(stream.state(), ConnState::Established);

    stream.write(request).await?;
    let reply = stream.read_all().await;
    assert_eq!(reply.as_ref(), b"OK");
    assert_eq!(stream.state(), ConnState::Closed);

    stream.close().await?;
    daemon.await??;
    Ok(())
}

#[tokio::test]
async fn write_chunks_at_488_bytes() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let sent = payload.clone();

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        conn.accept_handshake(500).await?;

        let mut reassembled = Vec::new();
        let mut expected_sizes = vec![488usize, 488, 24].into_iter();
        for pkt_num in 1..=3u16 {
            let dat = conn.read_packet().await?.expect("expected DAT");
            assert_eq!(dat.op, Opcode::Dat);
            assert_eq!(dat.pkt_num, pkt_num);
            assert_eq!(dat.payload.len(), expected_sizes.next().unwrap());
            reassembled.extend_from_slice(&dat.payload);
            conn.ack(&dat).await?;
        }
        assert_eq!(reassembled, sent);

        let eof = conn.read_packet().await?.expect("expected EOF");
        assert_eq!(eof.op, Opcode::Eof);
        assert_eq!(eof.pkt_num, 4);
        conn.ack(&eof).await?;

        let cls = conn.read_packet().await?.expect("expected CLS");
        assert_eq!(cls.op, Opcode::Cls);
        assert_eq!(cls.pkt_num, 5);
        anyhow::Ok(())
    });

    let mut stream =
        ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "HTTP", &config).await?;
    stream.write(payload).await?;
    stream.close().await?;
    daemon.await??;
    Ok(())
}

#[tokio::test]
async fn reordered_packets_are_delivered_in_order() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        conn.accept_handshake(200).await?;

        // Arrival order 201, 203, 202 - the engine must straighten it out.
        let first = conn.to_client(Opcode::Dat, &b"aa"[..], 201, 0);
        let third = conn.to_client(Opcode::Dat, &b"cc"[..], 203, 0);
        let second = conn.to_client(Opcode::Dat, &b"bb"[..], 202, 0);
        conn.send_packet(&first).await?;
        conn.send_packet(&third).await?;
        conn.send_packet(&second).await?;
        let eof = conn.to_client(Opcode::Eof, &b""[..], 204, 0);
        conn.send_packet(&eof).await?;

        // Acks arrive for 201, then 202 and 203 back to back once the
        // pending map drains, then 204 for the EOF, then the CLS.
        let mut receipts = Vec::new();
        while let Some(pkt) = conn.read_packet().await? {
            match pkt.op {
                Opcode::Sts => receipts.push(sts_receipt(&pkt)),
                Opcode::Cls => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(receipts, vec![201, 202, 203, 204]);
        anyhow::Ok(())
    });

    let mut stream =
        ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "HTTP", &config).await?;
    let reply = stream.read_all().await;
    assert_eq!(reply.as_ref(), b"aabbcc");
    stream.close().await?;
    daemon.await??;
    Ok(())
}

#[tokio::test]
async fn handshake_resends_rfc_after_silence() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;

        // Swallow the first RFC and stay silent; after three receive
        // timeouts the client sends exactly one more.
        let first = conn.read_packet().await?.expect("expected RFC");
        assert_eq!(first.op, Opcode::Rfc);
        let second = conn.read_packet().await?.expect("expected resent RFC");
        assert_eq!(second.op, Opcode::Rfc);
        assert_eq!(second.src_idx, first.src_idx);
        assert_eq!(second.pkt_num, 0);

        conn.client_idx = second.src_idx;
        conn.pkt_num = 300;
        let mut window = BytesMut::new();
        window.put_u16_le(0x40);
        let opn = conn.to_client(Opcode::Opn, window.freeze(), 300, 0);
        conn.send_packet(&opn).await?;

        let sts = conn.read_packet().await?.expect("expected handshake STS");
        assert_eq!(sts.op, Opcode::Sts);
        assert_eq!(sts_receipt(&sts), 300);

        let cls = conn.read_packet().await?.expect("expected CLS");
        assert_eq!(cls.op, Opcode::Cls);
        anyhow::Ok(())
    });

    let mut stream =
        ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "HTTP", &config).await?;
    assert_eq!(stream.state(), ConnState::Established);
    stream.close().await?;
    daemon.await??;
    Ok(())
}

#[tokio::test]
async fn handshake_refused_with_cls() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        let rfc = conn.read_packet().await?.expect("expected RFC");
        conn.client_idx = rfc.src_idx;
        let cls = conn.to_client(Opcode::Cls, &b"no such service"[..], 0, 0);
        conn.send_packet(&cls).await?;

        // The failed attempt sends nothing further; the channel just closes.
        assert!(conn.read_packet().await?.is_none());
        anyhow::Ok(())
    });

    let err = ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "NOPE", &config)
        .await
        .expect_err("refused handshake must fail");
    assert!(matches!(err, chaos_stream::ChaosError::Handshake(_)));
    daemon.await??;
    Ok(())
}

#[tokio::test]
async fn handshake_answer_is_unsupported() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        let rfc = conn.read_packet().await?.expect("expected RFC");
        conn.client_idx = rfc.src_idx;
        let ans = conn.to_client(Opcode::Ans, &b"42"[..], 0, 0);
        conn.send_packet(&ans).await?;
        assert!(conn.read_packet().await?.is_none());
        anyhow::Ok(())
    });

    let err = ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "TIME", &config)
        .await
        .expect_err("ANS during handshake must fail");
    assert!(matches!(err, chaos_stream::ChaosError::Handshake(_)));
    daemon.await??;
    Ok(())
}

#[tokio::test]
async fn write_survives_stray_acknowledgment() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        conn.accept_handshake(800).await?;

        let dat = conn.read_packet().await?.expect("expected DAT");
        assert_eq!(dat.op, Opcode::Dat);
        assert_eq!(dat.pkt_num, 1);

        // A receipt for a packet never sent must not complete the write;
        // the sender keeps waiting for its own sequence number.
        let mut bogus = BytesMut::new();
        bogus.put_u16_le(999);
        bogus.put_u16_le(0x40);
        let stray = conn.to_client(Opcode::Sts, bogus.freeze(), conn.pkt_num, 0);
        conn.send_packet(&stray).await?;
        conn.ack(&dat).await?;

        let eof = conn.read_packet().await?.expect("expected EOF");
        assert_eq!(eof.op, Opcode::Eof);
        conn.ack(&eof).await?;

        let cls = conn.read_packet().await?.expect("expected CLS");
        assert_eq!(cls.op, Opcode::Cls);
        anyhow::Ok(())
    });

    let mut stream =
        ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "HTTP", &config).await?;
    stream.write(&b"hi"[..]).await?;
    stream.close().await?;
    daemon.await??;
    Ok(())
}

#[tokio::test]
async fn daemon_death_closes_the_stream() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        conn.accept_handshake(400).await?;
        // Hang up without closing the conversation.
        anyhow::Ok(())
    });

    let mut stream =
        ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "HTTP", &config).await?;
    daemon.await??;

    // The dead channel tears the connection down: the reader unblocks with
    // nothing and the state settles at Closed.
    let reply = stream.read_all().await;
    assert!(reply.is_empty());
    stream.close().await?;
    assert_eq!(stream.state(), ConnState::Closed);
    Ok(())
}

#[tokio::test]
async fn malformed_frame_is_dropped_mid_stream() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        conn.accept_handshake(600).await?;

        // A frame with an opcode the codec does not know must be discarded
        // without killing the receive loop.
        let mut garbage = conn.to_client(Opcode::Dat, &b""[..], 0, 0).encode().to_vec();
        garbage[1] = 0x7f;
        conn.send_raw(&garbage).await?;

        conn.send_acknowledged(Opcode::Dat, b"ok").await?;
        conn.send_acknowledged(Opcode::Eof, b"").await?;
        let cls = conn.read_packet().await?.expect("expected CLS");
        assert_eq!(cls.op, Opcode::Cls);
        anyhow::Ok(())
    });

    let mut stream =
        ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "HTTP", &config).await?;
    let reply = stream.read_all().await;
    assert_eq!(reply.as_ref(), b"ok");
    assert_eq!(stream.state(), ConnState::Closed);
    stream.close().await?;
    daemon.await??;
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        conn.accept_handshake(700).await?;

        // Exactly one CLS, then the channel closes.
        let cls = conn.read_packet().await?.expect("expected CLS");
        assert_eq!(cls.op, Opcode::Cls);
        assert_eq!(cls.pkt_num, 1);
        assert!(conn.read_packet().await?.is_none());
        anyhow::Ok(())
    });

    let mut stream =
        ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "HTTP", &config).await?;
    stream.close().await?;
    stream.close().await?;
    assert_eq!(stream.state(), ConnState::Closed);
    daemon.await??;
    Ok(())
}

#[tokio::test]
async fn sense_repeats_last_acknowledgment() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let config = test_config(dir.path());
    let listener = UnixListener::bind(&config.daemon_path)?;

    let daemon = tokio::spawn(async move {
        let mut conn = DaemonConn::accept(&listener).await?;
        conn.accept_handshake(900).await?;
        conn.send_acknowledged(Opcode::Dat, b"ping").await?;

        // SNS consumes no sequence number and echoes the last receipt.
        let sns = conn.to_client(Opcode::Sns, &b""[..], 0, 0);
        conn.send_packet(&sns).await?;
        let sts = conn.read_packet().await?.expect("expected repeated STS");
        assert_eq!(sts.op, Opcode::Sts);
        assert_eq!(sts_receipt(&sts), 901);

        conn.send_acknowledged(Opcode::Eof, b"").await?;
        let cls = conn.read_packet().await?.expect("expected CLS");
        assert_eq!(cls.op, Opcode::Cls);
        anyhow::Ok(())
    });

    let mut stream =
        ChaosStream::open_with_config(CLIENT_ADDR, SERVER_ADDR, "HTTP", &config).await?;
    let reply = stream.read_all().await;
    assert_eq!(reply.as_ref(), b"ping");
    stream.close().await?;
    daemon.await??;
    Ok(())
}
