//! Line-delimited JSON-RPC wire protocol spoken with each interface.
//!
//! One JSON object per line. Requests carry an `id`; notifications omit it.
//! Methods this core does not interpret (address/scripthash history, raw
//! transaction broadcast) are passed through as opaque [`serde_json::Value`]
//! since address/transaction synchronization is out of scope here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The subset of methods this core dispatches on. Other method names still
/// round-trip through the wire as plain strings (e.g. in [`Request::method`])
/// but are not matched here; the method table stays open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    ServerVersion,
    HeadersSubscribe,
    PeersSubscribe,
    Banner,
    DonationAddress,
    EstimateFee,
    RelayFee,
    BlockHeaders,
    BlockHeader,
    Other,
}

impl Method {
    pub fn from_name(name: &str) -> Method {
        match name {
            "server.version" => Method::ServerVersion,
            "blockchain.headers.subscribe" => Method::HeadersSubscribe,
            "server.peers.subscribe" => Method::PeersSubscribe,
            "server.banner" => Method::Banner,
            "server.donation_address" => Method::DonationAddress,
            "blockchain.estimatefee" => Method::EstimateFee,
            "blockchain.relayfee" => Method::RelayFee,
            "blockchain.block.headers" => Method::BlockHeaders,
            "blockchain.block.header" => Method::BlockHeader,
            _ => Method::Other,
        }
    }

    pub fn as_name(&self) -> &'static str {
        match self {
            Method::ServerVersion => "server.version",
            Method::HeadersSubscribe => "blockchain.headers.subscribe",
            Method::PeersSubscribe => "server.peers.subscribe",
            Method::Banner => "server.banner",
            Method::DonationAddress => "server.donation_address",
            Method::EstimateFee => "blockchain.estimatefee",
            Method::RelayFee => "blockchain.relayfee",
            Method::BlockHeaders => "blockchain.block.headers",
            Method::BlockHeader => "blockchain.block.header",
            Method::Other => "",
        }
    }
}

/// A JSON-RPC request as sent on the wire, keyed by a per-core monotonic id
/// so responses can be matched back to their originating call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

/// A JSON-RPC response. `error` is set exclusively with `result` absent, and
/// vice versa, mirroring the upstream protocol's loose typing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// An unsolicited server push (`method.subscribe` follow-ups), identified by
/// method name rather than request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Value>,
}

/// One decoded line from an interface's socket.
#[derive(Debug, Clone)]
pub enum WireMessage {
    Response(Response),
    Notification(Notification),
}

impl WireMessage {
    /// A line carries an `id` key for a response, or is missing one (but has
    /// a `method`) for a notification.
    pub fn parse(line: &str) -> Result<WireMessage, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        if value.get("id").is_some() && value.get("method").is_none() {
            let response: Response = serde_json::from_value(value)?;
            Ok(WireMessage::Response(response))
        } else {
            let notification: Notification = serde_json::from_value(value)?;
            Ok(WireMessage::Notification(notification))
        }
    }
}

/// Decodes a single 160-hex-char (80-byte) header.
pub fn parse_header_hex(hex_str: &str) -> Result<bitcoin::block::Header, crate::error::Error> {
    let bytes = hex::decode(hex_str)?;
    Ok(bitcoin::consensus::deserialize(&bytes)?)
}

/// Decodes a concatenated run of 80-byte headers (chunk hex length is always
/// a multiple of 160 hex chars).
pub fn parse_headers_hex(hex_str: &str) -> Result<Vec<bitcoin::block::Header>, crate::error::Error> {
    let bytes = hex::decode(hex_str)?;
    bytes
        .chunks_exact(80)
        .map(|chunk| Ok(bitcoin::consensus::deserialize(chunk)?))
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeaderTip {
    pub height: u64,
    pub hex: String,
}

/// `blockchain.block.headers` result: a run of concatenated 80-byte headers,
/// plus an optional checkpoint proof when `cp_height` was requested.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkResult {
    pub hex: String,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Vec<String>>,
}

/// What a connection's socket reader forwards to the supervisor for each
/// decoded line (or terminal condition).
#[derive(Debug)]
pub enum IncomingEvent {
    Message(WireMessage),
    /// The server closed the connection (clean EOF).
    Closed,
    /// A malformed line that didn't parse as JSON at all.
    ParseError(String),
    /// The socket itself errored (reset, broken pipe, ...).
    Error(String),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_response_line() {
        let line = r#"{"id":7,"result":{"height":100}}"#;
        match WireMessage::parse(line).unwrap() {
            WireMessage::Response(r) => assert_eq!(r.id, 7),
            WireMessage::Notification(_) => panic!("expected response"),
        }
    }

    #[test]
    fn parses_notification_line() {
        let line = r#"{"method":"blockchain.headers.subscribe","params":[{"height":100}]}"#;
        match WireMessage::parse(line).unwrap() {
            WireMessage::Notification(n) => assert_eq!(n.method, "blockchain.headers.subscribe"),
            WireMessage::Response(_) => panic!("expected notification"),
        }
    }

    #[test]
    fn method_name_round_trips() {
        for method in [
            Method::ServerVersion,
            Method::HeadersSubscribe,
            Method::PeersSubscribe,
            Method::Banner,
            Method::DonationAddress,
            Method::EstimateFee,
            Method::RelayFee,
            Method::BlockHeaders,
            Method::BlockHeader,
        ] {
            assert_eq!(Method::from_name(method.as_name()), method);
        }
    }

    #[test]
    fn parses_single_header() {
        let hex_str = "00".repeat(80);
        let header = parse_header_hex(&hex_str).unwrap();
        assert_eq!(header.time, 0);
    }

    #[test]
    fn parses_concatenated_headers() {
        let hex_str = "00".repeat(160);
        let headers = parse_headers_hex(&hex_str).unwrap();
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn rejects_truncated_header() {
        let hex_str = "00".repeat(79);
        assert!(parse_header_hex(&hex_str).is_err());
    }
}
