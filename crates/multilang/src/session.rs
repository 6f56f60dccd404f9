//! Protocol session - drives one child process through a shard's lifecycle.
//!
//! Each round:
//! 1. Submit the triggering message (initialize, process-records, shutdown)
//! 2. Read until a status arrives, servicing checkpoint requests on the way
//! 3. Check the status answers the round's action
//! 4. Await the triggering write
//!
//! The round succeeds only if the write went through, the status matched,
//! and every checkpoint acknowledgement reached the child. A rejected
//! checkpoint is reported to the child and does not fail the round.

use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::protocol::{
    Action, InboundMessage, InitializationInput, OutboundMessage, ProcessRecordsInput,
    ShutdownReason,
};
use crate::bridge::transport::{MessageReader, MessageWriter, PendingWrite, TransportError};
use crate::checkpoint::{CheckpointError, CheckpointOutcome, CheckpointRequest, Checkpointer};

/// Await `future` unless `cancel` fires first.
async fn interruptible<T, F>(cancel: &CancellationToken, future: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(TransportError::Interrupted),
        result = future => result,
    }
}

/// Owns the reader and writer for one child process for the lifetime of a
/// shard. One round at a time.
pub struct ProtocolSession<R, W> {
    reader: R,
    writer: W,
    input: InitializationInput,
    cancel: CancellationToken,
}

impl<R: MessageReader, W: MessageWriter> ProtocolSession<R, W> {
    pub fn new(reader: R, writer: W, input: InitializationInput) -> Self {
        Self {
            reader,
            writer,
            input,
            cancel: CancellationToken::new(),
        }
    }

    /// Fail any round in progress (and every later round) once `cancel` fires.
    ///
    /// Without a token a round waits on the child indefinitely.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn shard_id(&self) -> &str {
        &self.input.shard_id
    }

    pub fn initialization_input(&self) -> &InitializationInput {
        &self.input
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }

    /// Send the shard's initialization and wait for the child to confirm.
    ///
    /// No checkpointer is available: checkpoint requests are answered with
    /// an error.
    pub async fn initialize(&mut self) -> bool {
        let pending = self.writer.write(self.input.to_message());
        self.complete_round(Action::Initialize, None, pending).await
    }

    /// Hand a batch to the child and wait for it to finish processing.
    pub async fn process_records(
        &mut self,
        input: ProcessRecordsInput,
        checkpointer: Option<&dyn Checkpointer>,
    ) -> bool {
        tracing::debug!(
            shard_id = %self.input.shard_id,
            records = input.records.len(),
            "Sending records to child process"
        );
        let pending = self.writer.write(input.into_message());
        self.complete_round(Action::ProcessRecords, checkpointer, pending)
            .await
    }

    /// Tell the child why it is being shut down and wait for it to finish.
    pub async fn shutdown(
        &mut self,
        checkpointer: Option<&dyn Checkpointer>,
        reason: ShutdownReason,
    ) -> bool {
        tracing::debug!(shard_id = %self.input.shard_id, %reason, "Shutting down child process");
        let pending = self.writer.write(OutboundMessage::Shutdown { reason });
        self.complete_round(Action::Shutdown, checkpointer, pending)
            .await
    }

    async fn complete_round(
        &mut self,
        action: Action,
        checkpointer: Option<&dyn Checkpointer>,
        pending: PendingWrite,
    ) -> bool {
        let status_was_correct = self.wait_for_status(action, checkpointer).await;

        match interruptible(&self.cancel, pending).await {
            Ok(true) => status_was_correct,
            Ok(false) => {
                tracing::error!(
                    shard_id = %self.input.shard_id,
                    %action,
                    "Child process stdin closed while writing message"
                );
                false
            }
            Err(TransportError::Interrupted) => {
                tracing::error!(
                    shard_id = %self.input.shard_id,
                    %action,
                    "Interrupted while writing message"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    shard_id = %self.input.shard_id,
                    %action,
                    error = %e,
                    "Failed to write message"
                );
                false
            }
        }
    }

    async fn wait_for_status(
        &mut self,
        action: Action,
        checkpointer: Option<&dyn Checkpointer>,
    ) -> bool {
        let response_for = loop {
            // Lines the codec skips are logged inside this span.
            let span = tracing::info_span!("read", shard_id = %self.input.shard_id, %action);
            let read = self.reader.next_message().instrument(span);
            let message = match interruptible(&self.cancel, read).await {
                Ok(message) => message,
                Err(TransportError::Interrupted) => {
                    tracing::error!(
                        shard_id = %self.input.shard_id,
                        %action,
                        "Interrupted while waiting for status message"
                    );
                    return false;
                }
                Err(e) => {
                    tracing::error!(
                        shard_id = %self.input.shard_id,
                        %action,
                        error = %e,
                        "Failed to get status message"
                    );
                    return false;
                }
            };

            match message {
                InboundMessage::Checkpoint {
                    checkpoint,
                    sub_sequence_number,
                    ..
                } => {
                    let request = CheckpointRequest::new(checkpoint, sub_sequence_number);
                    if !self.checkpoint(action, request, checkpointer).await {
                        return false;
                    }
                }
                InboundMessage::Status { response_for } => break response_for,
                InboundMessage::Unrecognized => {
                    tracing::trace!(
                        shard_id = %self.input.shard_id,
                        %action,
                        "Ignoring unrecognized message"
                    );
                }
            }
        };

        self.validate_status(response_for.as_deref(), action)
    }

    fn validate_status(&self, response_for: Option<&str>, action: Action) -> bool {
        tracing::info!(
            shard_id = %self.input.shard_id,
            response_for = response_for.unwrap_or("<none>"),
            %action,
            "Received status from child process"
        );
        let matched = action.matches(response_for);
        if !matched {
            tracing::warn!(
                shard_id = %self.input.shard_id,
                response_for = response_for.unwrap_or("<none>"),
                %action,
                "Status does not answer the pending action"
            );
        }
        matched
    }

    /// Commit (or refuse) the requested checkpoint and acknowledge it.
    ///
    /// Returns whether the acknowledgement reached the child.
    async fn checkpoint(
        &mut self,
        action: Action,
        request: CheckpointRequest,
        checkpointer: Option<&dyn Checkpointer>,
    ) -> bool {
        let outcome = match checkpointer {
            Some(checkpointer) => {
                tracing::debug!(
                    shard_id = %self.input.shard_id,
                    %action,
                    sequence_number = ?request.sequence_number,
                    sub_sequence_number = ?request.sub_sequence_number,
                    "Attempting to checkpoint"
                );
                match request.commit(checkpointer).await {
                    Ok(()) => CheckpointOutcome::Committed,
                    Err(e) => {
                        tracing::warn!(
                            shard_id = %self.input.shard_id,
                            %action,
                            position = %request.position(),
                            error = e.wire_name(),
                            detail = e.message(),
                            "Checkpoint failed"
                        );
                        CheckpointOutcome::Failed(e)
                    }
                }
            }
            None => {
                let message = format!(
                    "Was asked to checkpoint at {} but no checkpointer was provided for shard {}",
                    request.position(),
                    self.input.shard_id
                );
                tracing::error!(shard_id = %self.input.shard_id, %action, "{}", message);
                CheckpointOutcome::NoCheckpointer(CheckpointError::InvalidState(message))
            }
        };
        if outcome.is_committed() {
            tracing::debug!(
                shard_id = %self.input.shard_id,
                %action,
                position = %request.position(),
                "Checkpoint committed"
            );
        }

        let pending = self.writer.write(request.into_ack(&outcome));
        match interruptible(&self.cancel, pending).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::error!(
                    shard_id = %self.input.shard_id,
                    %action,
                    "Child process stdin closed while acknowledging checkpoint"
                );
                false
            }
            Err(TransportError::Interrupted) => {
                tracing::error!(
                    shard_id = %self.input.shard_id,
                    %action,
                    "Interrupted while acknowledging checkpoint"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    shard_id = %self.input.shard_id,
                    %action,
                    error = %e,
                    "Failed to acknowledge checkpoint"
                );
                false
            }
        }
    }
}
