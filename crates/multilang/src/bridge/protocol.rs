//! Wire protocol types for parent-child communication.
//!
//! One stream in each direction:
//! - **Child stdin**: Initialize, ProcessRecords, Shutdown, checkpoint acknowledgements
//! - **Child stdout**: Status replies and checkpoint requests
//!
//! Every message is a JSON object whose `action` field names its kind.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The round a status reply answers.
///
/// The string form is the correlation tag: it is the `action` of the outbound
/// message and must come back verbatim in the child's `responseFor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Initialize,
    ProcessRecords,
    Shutdown,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::ProcessRecords => "process-records",
            Self::Shutdown => "shutdown",
        }
    }

    /// Exact, case-sensitive match against a status `responseFor` value.
    /// An absent value never matches.
    pub fn matches(&self, response_for: Option<&str>) -> bool {
        response_for == Some(self.as_str())
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a shard's processor is being shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownReason {
    /// Another worker took the lease; checkpointing is no longer allowed.
    LeaseLost,
    /// The shard has been fully consumed; the child should checkpoint.
    ShardEnd,
    /// The supervising process is shutting down.
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LeaseLost => f.write_str("LEASE_LOST"),
            Self::ShardEnd => f.write_str("SHARD_END"),
            Self::Requested => f.write_str("REQUESTED"),
        }
    }
}

/// A position in the shard: sequence number plus optional sub-position for
/// aggregated records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedSequenceNumber {
    pub sequence_number: String,
    pub sub_sequence_number: Option<i64>,
}

impl ExtendedSequenceNumber {
    pub fn new(sequence_number: impl Into<String>) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            sub_sequence_number: None,
        }
    }

    pub fn with_sub_sequence_number(mut self, sub_sequence_number: i64) -> Self {
        self.sub_sequence_number = Some(sub_sequence_number);
        self
    }
}

/// Identity of the shard a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializationInput {
    pub shard_id: String,
    pub extended_sequence_number: Option<ExtendedSequenceNumber>,
}

impl InitializationInput {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            extended_sequence_number: None,
        }
    }

    pub fn with_extended_sequence_number(mut self, position: ExtendedSequenceNumber) -> Self {
        self.extended_sequence_number = Some(position);
        self
    }

    pub fn to_message(&self) -> OutboundMessage {
        let (sequence_number, sub_sequence_number) = match &self.extended_sequence_number {
            Some(position) => (
                Some(position.sequence_number.clone()),
                position.sub_sequence_number,
            ),
            None => (None, None),
        };
        OutboundMessage::Initialize {
            shard_id: self.shard_id.clone(),
            sequence_number,
            sub_sequence_number,
        }
    }
}

/// One record handed to the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
    pub partition_key: String,
    pub sequence_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_sequence_number: Option<i64>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub approximate_arrival_timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(
        data: impl Into<Vec<u8>>,
        partition_key: impl Into<String>,
        sequence_number: impl Into<String>,
    ) -> Self {
        Self {
            data: data.into(),
            partition_key: partition_key.into(),
            sequence_number: sequence_number.into(),
            sub_sequence_number: None,
            approximate_arrival_timestamp: None,
        }
    }

    pub fn with_sub_sequence_number(mut self, sub_sequence_number: i64) -> Self {
        self.sub_sequence_number = Some(sub_sequence_number);
        self
    }

    pub fn with_arrival_timestamp(mut self, arrived_at: DateTime<Utc>) -> Self {
        self.approximate_arrival_timestamp = Some(arrived_at);
        self
    }
}

/// A batch of records for one process-records round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRecordsInput {
    pub records: Vec<Record>,
    pub millis_behind_latest: Option<i64>,
}

impl ProcessRecordsInput {
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            millis_behind_latest: None,
        }
    }

    pub fn with_millis_behind_latest(mut self, millis: i64) -> Self {
        self.millis_behind_latest = Some(millis);
        self
    }

    pub fn into_message(self) -> OutboundMessage {
        OutboundMessage::ProcessRecords {
            records: self.records,
            millis_behind_latest: self.millis_behind_latest,
        }
    }
}

/// Messages from parent to child (child stdin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum OutboundMessage {
    #[serde(rename = "initialize", rename_all = "camelCase")]
    Initialize {
        shard_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sub_sequence_number: Option<i64>,
    },

    #[serde(rename = "process-records", rename_all = "camelCase")]
    ProcessRecords {
        records: Vec<Record>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        millis_behind_latest: Option<i64>,
    },

    #[serde(rename = "shutdown")]
    Shutdown { reason: ShutdownReason },

    /// Result of a checkpoint the child asked for. Echoes the requested
    /// position; `error` is null when the commit succeeded.
    #[serde(rename = "checkpoint", rename_all = "camelCase")]
    Checkpoint {
        checkpoint: Option<String>,
        sub_sequence_number: Option<i64>,
        error: Option<String>,
    },
}

/// Messages from child to parent (child stdout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum InboundMessage {
    /// The child finished handling the action named by `response_for`.
    #[serde(rename = "status", rename_all = "camelCase")]
    Status { response_for: Option<String> },

    /// The child wants progress committed. No sequence number means
    /// "whatever was last delivered".
    #[serde(rename = "checkpoint", rename_all = "camelCase")]
    Checkpoint {
        checkpoint: Option<String>,
        sub_sequence_number: Option<i64>,
        error: Option<String>,
    },

    /// Any action this parent does not understand.
    #[serde(rename = "unrecognized", other)]
    Unrecognized,
}

mod base64_data {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
