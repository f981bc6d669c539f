use std::{fmt, sync::PoisonError};

pub type SplitterResult<T> = core::result::Result<T, SplitterError>;

#[derive(Debug)]
pub enum SplitterError {
    /// Errors from the `config` crate while loading settings.
    ConfigError(ext_config::ConfigError),
    /// The configuration was parsed but is not usable.
    InvalidConfig(String),
    /// No pool was configured for a strategy.
    NoPools,
    /// A strategy has no logged in upstream connection to submit through.
    NoActiveUpstream,
    /// Errors opening the log file.
    Io(std::io::Error),
    /// No mapper accepted a session, even a freshly created one.
    MapperFull(usize),
    /// Installing the global tracing subscriber failed.
    Logging(String),
    // Locking Errors
    PoisonLock,
    // Channel Receiver Error
    ChannelErrorReceiver(async_channel::RecvError),
    // Channel Sender Errors
    ChannelErrorSender,
}

impl fmt::Display for SplitterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use SplitterError::*;
        match self {
            ConfigError(e) => write!(f, "Config error: {e:?}"),
            InvalidConfig(e) => write!(f, "Invalid config: {e}"),
            NoPools => write!(f, "No pools configured"),
            NoActiveUpstream => write!(f, "No active upstream connection"),
            Io(e) => write!(f, "I/O error: `{e:?}`"),
            MapperFull(id) => write!(f, "Mapper #{id:03} rejected the session"),
            Logging(e) => write!(f, "Logging setup error: {e}"),
            PoisonLock => write!(f, "Poison Lock error"),
            ChannelErrorReceiver(e) => write!(f, "Channel receive error: `{e:?}`"),
            ChannelErrorSender => write!(f, "Channel send error"),
        }
    }
}

impl std::error::Error for SplitterError {}

impl From<ext_config::ConfigError> for SplitterError {
    fn from(e: ext_config::ConfigError) -> Self {
        SplitterError::ConfigError(e)
    }
}

impl From<std::io::Error> for SplitterError {
    fn from(e: std::io::Error) -> Self {
        SplitterError::Io(e)
    }
}

impl From<async_channel::RecvError> for SplitterError {
    fn from(e: async_channel::RecvError) -> Self {
        SplitterError::ChannelErrorReceiver(e)
    }
}

impl<T> From<async_channel::SendError<T>> for SplitterError {
    fn from(_e: async_channel::SendError<T>) -> Self {
        SplitterError::ChannelErrorSender
    }
}

//*** LOCK ERRORS ***
impl<T> From<PoisonError<T>> for SplitterError {
    fn from(_e: PoisonError<T>) -> Self {
        SplitterError::PoisonLock
    }
}

/// Reasons a submission is turned away before reaching any upstream.
///
/// Both are terminal for the submission; retrying is up to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The slot has no active upstream path.
    BadGateway,
    /// The submission references a job that is no longer current.
    InvalidJobId,
}

impl RejectReason {
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::BadGateway => "Bad gateway",
            RejectReason::InvalidJobId => "Invalid job id",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
