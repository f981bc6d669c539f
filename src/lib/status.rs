//! ## Status Reporting System
//!
//! Components report fatal failures to the splitter's supervision loop by wrapping them in a
//! [`Status`] and sending it over an async channel, tagged with a [`StatusSender`] variant
//! that identifies the source.

use tracing::{debug, error, warn};

use crate::error::SplitterError;

/// Identifies the component that originated a [`Status`] update.
#[derive(Debug, Clone)]
pub enum StatusSender {
    /// The actor loop of one mapper.
    Mapper {
        mapper_id: usize,
        tx: async_channel::Sender<Status>,
    },
    /// The scheduler loop of the splitter.
    Splitter(async_channel::Sender<Status>),
}

impl StatusSender {
    /// Sends a [`Status`] update.
    pub async fn send(&self, status: Status) -> Result<(), async_channel::SendError<Status>> {
        match self {
            Self::Mapper { mapper_id, tx } => {
                debug!("Sending status from Mapper #{mapper_id:03}: {:?}", status.state);
                tx.send(status).await
            }
            Self::Splitter(tx) => {
                debug!("Sending status from Splitter: {:?}", status.state);
                tx.send(status).await
            }
        }
    }
}

/// The type of event or error being reported by a component.
#[derive(Debug)]
pub enum State {
    /// A mapper's actor loop exited on an unrecoverable error.
    MapperShutdown {
        mapper_id: usize,
        reason: SplitterError,
    },
    /// The scheduler loop failed.
    SplitterShutdown(SplitterError),
}

/// A message reporting the current [`State`] of a component.
#[derive(Debug)]
pub struct Status {
    pub state: State,
}

async fn send_status(sender: &StatusSender, error: SplitterError) {
    let state = match sender {
        StatusSender::Mapper { mapper_id, .. } => {
            warn!("Mapper #{mapper_id:03} shutting down due to error: {error:?}");
            State::MapperShutdown {
                mapper_id: *mapper_id,
                reason: error,
            }
        }
        StatusSender::Splitter(_) => {
            warn!("Splitter shutting down due to error: {error:?}");
            State::SplitterShutdown(error)
        }
    };

    if let Err(e) = sender.send(Status { state }).await {
        error!("Failed to send status update from {sender:?}: {e:?}");
    }
}

/// Logs `e` and forwards it to the supervision loop.
pub async fn handle_error(sender: &StatusSender, e: SplitterError) {
    error!("Error in {:?}: {:?}", sender, e);
    send_status(sender, e).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_channel::unbounded;

    #[tokio::test]
    async fn test_mapper_error_is_reported_with_id() {
        let (tx, rx) = unbounded();
        let sender = StatusSender::Mapper { mapper_id: 3, tx };

        handle_error(&sender, SplitterError::ChannelErrorSender).await;

        match rx.recv().await.unwrap().state {
            State::MapperShutdown { mapper_id, reason } => {
                assert_eq!(mapper_id, 3);
                assert!(matches!(reason, SplitterError::ChannelErrorSender));
            }
            other => panic!("Expected MapperShutdown, got {other:?}"),
        }
    }
}
