use crate::server_key::ServerKey;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),

    #[error(transparent)]
    Bitcoin(#[from] bitcoin::consensus::encode::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    #[error("unrecognised network '{0}'")]
    NetworkParseError(String),

    #[error("malformed server key '{0}'")]
    BadServerKey(String),

    #[error("malformed proxy string '{0}'")]
    BadProxyConfig(String),

    #[error("requested {0} headers in one chunk, max is 2016")]
    ChunkTooLarge(usize),

    #[error("server did not answer")]
    Timeout,

    #[error("server returned an error: {0}")]
    Rpc(serde_json::Value),

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("no primary interface available")]
    NoPrimary,

    #[error("no chain rooted at height {0}")]
    NoSuchChain(u64),

    #[error("connection to {0} refused")]
    ConnectionRefused(ServerKey),

    #[error("tls certificate pin mismatch for {0}")]
    CertPinMismatch(ServerKey),

    #[error("protocol violation from {0}: {1}")]
    ProtocolViolation(ServerKey, String),
}
