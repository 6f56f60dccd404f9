//! multilang: drives a child record processor over the multi-language
//! stdin/stdout protocol.

pub mod bridge;
pub mod checkpoint;
pub mod logging;
pub mod session;
pub mod worker;

pub use bridge::protocol::{
    Action, ExtendedSequenceNumber, InboundMessage, InitializationInput, OutboundMessage,
    ProcessRecordsInput, Record, ShutdownReason,
};
pub use bridge::transport::{
    FramedReader, MessageReader, MessageWriter, PendingWrite, QueuedWriter, TransportError,
};
pub use checkpoint::{CheckpointError, CheckpointOutcome, CheckpointRequest, Checkpointer};
pub use logging::{LogFormat, init_tracing};
pub use session::ProtocolSession;
pub use worker::{ChildSession, SpawnError, WorkerConfig, WorkerProcess, spawn_worker};
