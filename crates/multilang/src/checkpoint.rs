//! Checkpoint sink and the checkpoint request/acknowledgement exchange.
//!
//! The child may ask the parent to commit progress at any point while a
//! round is pending. The commit goes through a [`Checkpointer`] borrowed for
//! that round; its result travels back to the child as data.

use async_trait::async_trait;

use crate::bridge::protocol::OutboundMessage;

/// Failure of the commit itself, as opposed to a failure to talk to the child.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckpointError {
    /// Checkpointing is not possible in the current state (no checkpointer,
    /// lease table out of sync).
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The processor lost its lease and may no longer checkpoint.
    #[error("processor shut down: {0}")]
    Shutdown(String),
    #[error("checkpoint throttled: {0}")]
    Throttling(String),
    /// A backing store could not be reached.
    #[error("dependency failure: {0}")]
    Dependency(String),
    /// The requested position is malformed or outside the shard.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CheckpointError {
    /// Name reported to the child in the acknowledgement's `error` field.
    ///
    /// Child-side libraries branch on these exact strings.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "InvalidStateException",
            Self::Shutdown(_) => "ShutdownException",
            Self::Throttling(_) => "ThrottlingException",
            Self::Dependency(_) => "KinesisClientLibDependencyException",
            Self::InvalidArgument(_) => "IllegalArgumentException",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::InvalidState(m)
            | Self::Shutdown(m)
            | Self::Throttling(m)
            | Self::Dependency(m)
            | Self::InvalidArgument(m) => m,
        }
    }
}

/// Commits processing progress for one shard.
///
/// Supplied per round by the caller; never retained past that round.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Commit at the latest position the caller has handed out.
    async fn checkpoint(&self) -> Result<(), CheckpointError>;

    async fn checkpoint_at(&self, sequence_number: &str) -> Result<(), CheckpointError>;

    async fn checkpoint_at_sub(
        &self,
        sequence_number: &str,
        sub_sequence_number: i64,
    ) -> Result<(), CheckpointError>;
}

/// A checkpoint the child asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub sequence_number: Option<String>,
    pub sub_sequence_number: Option<i64>,
}

impl CheckpointRequest {
    pub fn new(sequence_number: Option<String>, sub_sequence_number: Option<i64>) -> Self {
        Self {
            sequence_number,
            sub_sequence_number,
        }
    }

    /// Commit through `checkpointer` at the most specific position given.
    ///
    /// A sub-position without a sequence number is ignored and the latest
    /// position is committed.
    pub async fn commit(&self, checkpointer: &dyn Checkpointer) -> Result<(), CheckpointError> {
        match (self.sequence_number.as_deref(), self.sub_sequence_number) {
            (Some(sequence_number), Some(sub_sequence_number)) => {
                checkpointer
                    .checkpoint_at_sub(sequence_number, sub_sequence_number)
                    .await
            }
            (Some(sequence_number), None) => checkpointer.checkpoint_at(sequence_number).await,
            (None, _) => checkpointer.checkpoint().await,
        }
    }

    /// Acknowledgement echoing this request's position with the outcome.
    pub fn into_ack(self, outcome: &CheckpointOutcome) -> OutboundMessage {
        OutboundMessage::Checkpoint {
            checkpoint: self.sequence_number,
            sub_sequence_number: self.sub_sequence_number,
            error: outcome.error().map(|e| e.wire_name().to_string()),
        }
    }

    pub(crate) fn position(&self) -> String {
        match (self.sequence_number.as_deref(), self.sub_sequence_number) {
            (Some(seq), Some(sub)) => format!("{seq}/{sub}"),
            (Some(seq), None) => seq.to_string(),
            (None, _) => "latest".to_string(),
        }
    }
}

/// What happened to one checkpoint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Committed,
    /// The checkpointer rejected the commit.
    Failed(CheckpointError),
    /// No checkpointer was available for the round.
    NoCheckpointer(CheckpointError),
}

impl CheckpointOutcome {
    pub fn error(&self) -> Option<&CheckpointError> {
        match self {
            Self::Committed => None,
            Self::Failed(e) | Self::NoCheckpointer(e) => Some(e),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}
