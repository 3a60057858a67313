use {
    crate::atom::{
        define::quit,
        errors::{AtomError, AtomErrorValue},
    },
    serde::Serialize,
    std::{fmt, io},
};

/// Why a connection ended. Drives the source failover policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StopReason {
    None,
    UserShutdown,
    NodeNotFound,
    ConnectionError,
    AccessDenied,
    ChannelNotFound,
    ChannelExit,
    Unavailable,
    OffAir,
    BadAgent,
}

impl StopReason {
    /// Map the value of a received `QUIT`.
    #[must_use]
    pub const fn from_quit_code(code: u32) -> Self {
        match code % 1000 {
            quit::UNAVAILABLE => Self::Unavailable,
            quit::OFF_AIR => Self::OffAir,
            quit::BAD_AGENT => Self::BadAgent,
            _ => Self::ChannelExit,
        }
    }

    /// The `QUIT` value that reports this reason to a peer.
    #[must_use]
    pub const fn quit_code(self) -> u32 {
        quit::QUIT
            + match self {
                Self::Unavailable => quit::UNAVAILABLE,
                Self::OffAir | Self::ChannelExit => quit::OFF_AIR,
                Self::BadAgent => quit::BAD_AGENT,
                Self::ChannelNotFound | Self::NodeNotFound => quit::UNAVAILABLE,
                Self::AccessDenied => quit::BANNED,
                Self::ConnectionError => quit::BAD_RESPONSE,
                Self::UserShutdown | Self::None => quit::SHUTDOWN,
            }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionErrorValue {
    #[error("net io error: {0}")]
    IO(#[source] io::Error),
    #[error("atom error: {0}")]
    AtomError(#[source] AtomError),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("connection closed by peer")]
    Closed,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("bad response: {0}")]
    BadResponse(String),
    #[error("request header exceeds {0} bytes")]
    HeaderTooLarge(usize),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("session stopped: {0}")]
    Stopped(StopReason),
}

#[derive(Debug, thiserror::Error)]
#[error("{value}")]
pub struct SessionError {
    pub value: SessionErrorValue,
}

impl SessionError {
    /// Reason reported when this error ends a connection.
    #[must_use]
    pub fn stop_reason(&self) -> StopReason {
        match self.value {
            SessionErrorValue::Stopped(reason) => reason,
            _ => StopReason::ConnectionError,
        }
    }
}

impl From<SessionErrorValue> for SessionError {
    fn from(val: SessionErrorValue) -> Self {
        Self { value: val }
    }
}

impl From<StopReason> for SessionError {
    fn from(reason: StopReason) -> Self {
        Self {
            value: SessionErrorValue::Stopped(reason),
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(error: io::Error) -> Self {
        Self {
            value: SessionErrorValue::IO(error),
        }
    }
}

impl From<AtomError> for SessionError {
    fn from(error: AtomError) -> Self {
        let value = match error.value {
            AtomErrorValue::IO(error) => SessionErrorValue::IO(error),
            value => SessionErrorValue::AtomError(AtomError { value }),
        };
        Self { value }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
