use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use bincode::error::{DecodeError, EncodeError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::types::{Message, NodeId};

/// Frames larger than this are refused on read.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
}

/// Wire envelope: wraps a Raft message with the sender's identity and the
/// address it accepts consensus traffic on.
#[derive(Serialize, Deserialize)]
struct Envelope {
    from: NodeId,
    from_addr: SocketAddr,
    message: Message,
}

/// A message received from a peer.
pub struct Incoming {
    pub from: NodeId,
    pub from_addr: SocketAddr,
    pub message: Message,
}

/// TCP transport for Raft RPCs.
///
/// Messages are framed with a 4-byte big-endian length prefix followed by a
/// bincode-encoded `Envelope`. A background thread accepts incoming connections;
/// each is dispatched to its own short-lived thread which reads one message and
/// forwards it into the receive channel. Outbound messages are sent fire-and-forget
/// on ephemeral threads. Failed sends are dropped; Raft's timeouts and retries
/// cover lost messages.
pub struct Transport {
    local_id: NodeId,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Incoming>,
    /// Keeping this Arc alive closes the listener when Transport is dropped,
    /// which causes the accept loop to receive an error and exit.
    _listener: Arc<TcpListener>,
}

impl Transport {
    /// Bind a listener on `addr` and start accepting inbound Raft RPCs.
    pub fn bind(local_id: NodeId, addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)?;
        Self::start(local_id, listener)
    }

    /// Start serving on an already bound listener.
    pub fn start(local_id: NodeId, listener: TcpListener) -> Result<Self, TransportError> {
        let local_addr = listener.local_addr()?;
        let listener = Arc::new(listener);
        let (tx, rx) = mpsc::channel();
        let listener_bg = Arc::clone(&listener);
        thread::spawn(move || accept_loop(listener_bg, tx));
        debug!(node = %local_id, addr = %local_addr, "raft transport listening");
        Ok(Self {
            local_id,
            local_addr,
            rx,
            _listener: listener,
        })
    }

    /// Send a message to `addr`. Returns immediately; delivery happens on a
    /// background thread. Unreachable peers are only traced; a message that
    /// cannot be framed at all is logged as a warning.
    pub fn send(&self, addr: SocketAddr, message: Message) {
        let envelope = Envelope {
            from: self.local_id,
            from_addr: self.local_addr,
            message,
        };
        thread::spawn(move || match dial_and_send(addr, &envelope) {
            Ok(()) => {}
            Err(TransportError::Io(e)) => trace!(peer = %addr, error = %e, "send failed"),
            Err(e) => warn!(peer = %addr, error = %e, "dropping unsendable message"),
        });
    }

    /// Block until a message arrives or `timeout` elapses. Returns `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Incoming> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// The address this transport is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn accept_loop(listener: Arc<TcpListener>, tx: mpsc::Sender<Incoming>) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let tx = tx.clone();
                thread::spawn(move || {
                    // Bound how long we wait for a slow/misbehaving sender.
                    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
                    match read_envelope(&stream) {
                        Ok(env) => {
                            let _ = tx.send(Incoming {
                                from: env.from,
                                from_addr: env.from_addr,
                                message: env.message,
                            });
                        }
                        Err(e) => trace!(error = %e, "dropping malformed frame"),
                    }
                });
            }
            // Listener was closed (Transport dropped) or an unrecoverable error.
            Err(_) => break,
        }
    }
}

fn encode(envelope: &Envelope) -> Result<Vec<u8>, TransportError> {
    let bytes = bincode::serde::encode_to_vec(envelope, bincode::config::standard())?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(bytes.len()));
    }
    Ok(bytes)
}

/// Read one length-prefixed envelope from the stream.
fn read_envelope(mut stream: &TcpStream) -> Result<Envelope, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let (envelope, _) = bincode::serde::decode_from_slice(&buf, bincode::config::standard())?;
    Ok(envelope)
}

/// Connect, send one length-prefixed envelope, and close.
fn dial_and_send(addr: SocketAddr, envelope: &Envelope) -> Result<(), TransportError> {
    let bytes = encode(envelope)?;
    let len = bytes.len() as u32;
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_millis(200))?;
    stream.set_write_timeout(Some(Duration::from_millis(500)))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::SNAPSHOT_CHUNK_SIZE;
    use crate::types::{
        AppendEntries, AppendEntriesResponse, InstallSnapshot, LogIndex, RequestVote, SnapshotMeta,
        Term,
    };

    fn snapshot_chunk(data: Vec<u8>) -> Message {
        Message::InstallSnapshot(InstallSnapshot {
            term: Term::from(2),
            leader_id: NodeId::from(1),
            meta: SnapshotMeta {
                last_index: LogIndex::from(40),
                last_term: Term::from(2),
                config: Default::default(),
            },
            offset: 0,
            data,
            done: false,
        })
    }

    fn make_pair() -> (Transport, Transport) {
        let a = Transport::start(NodeId::from(1), TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
        let b = Transport::start(NodeId::from(2), TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
        (a, b)
    }

    #[test]
    fn request_vote_roundtrip() {
        let (a, b) = make_pair();

        a.send(
            b.local_addr(),
            Message::RequestVote(RequestVote {
                term: Term::from(3),
                candidate_id: NodeId::from(1),
                last_log_index: LogIndex::from(0),
                last_log_term: Term::from(0),
            }),
        );

        let incoming = b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(incoming.from, NodeId::from(1));
        assert_eq!(incoming.from_addr, a.local_addr());
        let Message::RequestVote(rv) = incoming.message else { panic!("wrong variant") };
        assert_eq!(rv.term, Term::from(3));
        assert_eq!(rv.candidate_id, NodeId::from(1));
    }

    #[test]
    fn recv_timeout_returns_none_on_silence() {
        let t = Transport::start(NodeId::from(9), TcpListener::bind("127.0.0.1:0").unwrap()).unwrap();
        assert!(t.recv_timeout(Duration::from_millis(50)).is_none());
    }

    #[test]
    fn reply_reaches_sender_address() {
        let (a, b) = make_pair();

        a.send(
            b.local_addr(),
            Message::AppendEntries(AppendEntries {
                term: Term::from(1),
                leader_id: NodeId::from(1),
                prev_log_index: LogIndex::from(0),
                prev_log_term: Term::from(0),
                entries: vec![],
                leader_commit: LogIndex::from(0),
            }),
        );

        let incoming = b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(incoming.message, Message::AppendEntries(_)));

        // B only learned A's address from the envelope.
        b.send(
            incoming.from_addr,
            Message::AppendEntriesResponse(AppendEntriesResponse {
                term: Term::from(1),
                success: true,
                match_index: LogIndex::from(0),
            }),
        );

        let incoming = a.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(incoming.from, NodeId::from(2));
        let Message::AppendEntriesResponse(resp) = incoming.message else { panic!("wrong variant") };
        assert!(resp.success);
    }

    #[test]
    fn carries_full_snapshot_chunk() {
        let (a, b) = make_pair();
        let data: Vec<u8> = (0..SNAPSHOT_CHUNK_SIZE).map(|i| (i % 256) as u8).collect();

        a.send(b.local_addr(), snapshot_chunk(data.clone()));

        let incoming = b.recv_timeout(Duration::from_secs(5)).unwrap();
        let Message::InstallSnapshot(req) = incoming.message else { panic!("wrong variant") };
        assert_eq!(req.data, data);
        assert_eq!(req.meta.last_index, LogIndex::from(40));
    }

    #[test]
    fn snapshot_bytes_are_framed_compactly() {
        let envelope = Envelope {
            from: NodeId::from(1),
            from_addr: "127.0.0.1:7001".parse().unwrap(),
            message: snapshot_chunk(vec![0xff; SNAPSHOT_CHUNK_SIZE]),
        };

        let frame = encode(&envelope).unwrap();

        assert!(frame.len() < SNAPSHOT_CHUNK_SIZE + 256, "frame of {} bytes", frame.len());
    }

    #[test]
    fn oversized_frame_is_refused() {
        let envelope = Envelope {
            from: NodeId::from(1),
            from_addr: "127.0.0.1:7001".parse().unwrap(),
            message: snapshot_chunk(vec![0; MAX_FRAME_LEN + 1]),
        };

        assert!(matches!(encode(&envelope), Err(TransportError::FrameTooLarge(_))));
    }
}
