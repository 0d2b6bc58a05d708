//! Per-connection interface state: one TCP/TLS socket to a
//! remote server, its header-sync mode, and its in-flight request table.

use crate::server_key::ServerKey;
use crate::wire::{BlockHeaderTip, IncomingEvent, WireMessage};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Where an interface sits in the header-sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Waiting on the checkpoint proof + verification chunk.
    Verification,
    /// Stepping backward by doubling gaps, looking for a height where the
    /// interface's chain and ours agree.
    Backward,
    /// Binary-searching between a known-good and known-bad height to find
    /// the exact fork point.
    Binary,
    /// Fork point found; pulling chunks forward until caught up with the
    /// interface's reported tip.
    CatchUp,
    /// Fully synced; headers are only consumed via single-header notify.
    Default,
}

/// What the supervisor should do once a response to this request arrives.
/// Requests the supervisor issues on its own behalf (the bootstrap pair,
/// verification/sync probes) carry an [`InternalTag`] instead of a reply
/// channel — there is no external caller waiting on them.
pub enum Dispatch {
    External(mpsc::UnboundedSender<Result<Value, crate::error::Error>>),
    Internal(InternalTag),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalTag {
    ServerVersion,
    HeadersSubscribe,
    VerificationChunk,
    SyncHeader,
    CatchUpChunk,
    /// Ambient info refresh (banner, donation address, peers, fee estimates)
    /// dispatched by method name rather than a dedicated tag per call.
    Ambient,
}

/// A request sent but not yet answered, with enough context to route the
/// eventual response and to detect a timeout.
pub struct UnansweredRequest {
    pub method: String,
    pub params: Vec<Value>,
    pub sent_at: Instant,
    pub dispatch: Dispatch,
    /// Whether a successful result should be written into the subscription
    /// cache once it arrives (mirrors `PendingSend::subscribe`).
    pub subscribe: bool,
}

pub struct Interface {
    pub server_key: ServerKey,
    pub mode: Mode,
    writer: BufWriter<WriteHalf<TcpStream>>,
    next_id: u64,
    pub unanswered_requests: HashMap<u64, UnansweredRequest>,
    pub tip: Option<BlockHeaderTip>,
    pub base_height: u64,
    pub good: u64,
    pub bad: Option<u64>,
    pub bad_header: Option<BlockHeaderTip>,
    /// Chunk indices (`height / 2016`) for which a chunk request is
    /// outstanding; `request_chunk` is a no-op while the index is present.
    pub requested_chunks: HashSet<u64>,
    pub connected_at: Instant,
    pub last_ping: Option<Instant>,
    pub last_activity: Instant,
}

impl Interface {
    pub fn new(server_key: ServerKey, writer: WriteHalf<TcpStream>, base_height: u64) -> Self {
        let now = Instant::now();
        Interface {
            server_key,
            mode: Mode::Verification,
            writer: BufWriter::new(writer),
            next_id: 0,
            unanswered_requests: HashMap::new(),
            tip: None,
            base_height,
            good: base_height,
            bad: None,
            bad_header: None,
            requested_chunks: HashSet::new(),
            connected_at: now,
            last_ping: None,
            last_activity: now,
        }
    }

    fn next_message_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Serializes and writes one request line, recording it as unanswered
    /// under `dispatch` so the eventual response is routed back correctly.
    pub async fn send_request(
        &mut self,
        method: &str,
        params: Vec<Value>,
        dispatch: Dispatch,
        subscribe: bool,
    ) -> Result<u64, crate::error::Error> {
        let id = self.next_message_id();
        let request = crate::wire::Request {
            id,
            method: method.to_string(),
            params: params.clone(),
        };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        self.unanswered_requests.insert(
            id,
            UnansweredRequest {
                method: method.to_string(),
                params,
                sent_at: Instant::now(),
                dispatch,
                subscribe,
            },
        );
        Ok(id)
    }

    /// Number of requests still awaiting a reply.
    pub fn num_requests(&self) -> usize {
        self.unanswered_requests.len()
    }

    /// Requests outstanding longer than `timeout`, for the supervisor's
    /// timeout sweep. Does not remove them; the caller decides
    /// whether to disconnect.
    pub fn timed_out_requests(&self, timeout: std::time::Duration) -> Vec<u64> {
        let now = Instant::now();
        self.unanswered_requests
            .iter()
            .filter(|(_, req)| now.duration_since(req.sent_at) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn ping_required(&self, ping_interval: std::time::Duration) -> bool {
        match self.last_ping {
            Some(last) => last.elapsed() > ping_interval,
            None => self.connected_at.elapsed() > ping_interval,
        }
    }

    /// No activity (response, notification, or ping reply) within
    /// `idle_threshold`: the interface is presumed dead.
    pub fn has_timed_out(&self, idle_threshold: std::time::Duration) -> bool {
        self.last_activity.elapsed() > idle_threshold
    }

    pub fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn clear_binary_cursors(&mut self) {
        self.bad = None;
        self.bad_header = None;
    }
}

/// Reads line-delimited JSON off `read_half` until EOF or error, forwarding
/// each decoded message (or the closure) to `tx` tagged with `server_key`.
/// This is the one long-lived task per connection outside the supervisor
/// loop; it never touches interface state directly, only the channel.
pub fn spawn_reader(
    read_half: ReadHalf<TcpStream>,
    server_key: ServerKey,
    tx: mpsc::UnboundedSender<(ServerKey, IncomingEvent)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event = match WireMessage::parse(&line) {
                        Ok(msg) => IncomingEvent::Message(msg),
                        Err(e) => IncomingEvent::ParseError(e.to_string()),
                    };
                    if tx.send((server_key.clone(), event)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = tx.send((server_key.clone(), IncomingEvent::Closed));
                    break;
                }
                Err(e) => {
                    let _ = tx.send((server_key.clone(), IncomingEvent::Error(e.to_string())));
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timed_out_requests_empty_when_fresh() {
        let unanswered: HashMap<u64, UnansweredRequest> = HashMap::new();
        assert!(unanswered.is_empty());
    }

    #[test]
    fn mode_transitions_are_distinct() {
        assert_ne!(Mode::Verification, Mode::Backward);
        assert_ne!(Mode::Binary, Mode::CatchUp);
        assert_ne!(Mode::CatchUp, Mode::Default);
    }

    #[tokio::test]
    async fn has_timed_out_respects_activity_window() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connect_res, accept_res) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let stream = connect_res.unwrap();
        let _accepted = accept_res.unwrap();
        let (_read, write) = tokio::io::split(stream);
        let interface = Interface::new(
            ServerKey::new("h", 1, crate::server_key::Protocol::Tcp),
            write,
            0,
        );
        assert!(!interface.has_timed_out(std::time::Duration::from_secs(100)));
    }
}
