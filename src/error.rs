use thiserror::Error;

/// The session-layer error taxonomy.
///
/// Every variant collapses to a NACK at the session loop (§7); the taxonomy
/// only matters for logging and for the handful of cases the wire protocol
/// can itself represent (`PEER_GONE` on a swallowed send failure).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("malformed packet")]
    InvalidPacket,

    #[error("peer disconnected")]
    Disconnected,

    #[error("write to peer failed")]
    PeerGone,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("already logged in")]
    AlreadyLoggedIn,

    #[error("username already in use")]
    NameInUse,

    #[error("unknown invitation id")]
    UnknownId,

    #[error("wrong side for this operation")]
    WrongSide,

    #[error("invitation is not in the required state")]
    WrongState,

    #[error("no game in progress")]
    NoGame,

    #[error("move does not parse")]
    InvalidMove,

    #[error("move is illegal")]
    IllegalMove,

    #[error("registry at capacity")]
    Capacity,
}

pub type Result<T> = std::result::Result<T, ServerError>;
