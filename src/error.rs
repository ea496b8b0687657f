// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Error taxonomy for the ingest pipeline
//
// Session errors split into fatal ones (connect failure, rejected
// subscription) and ones that only affect a single request. Codec and
// storage errors are contained where they occur; query errors only carry
// transport/permission failures, never "no data".

use thiserror::Error;

/// Errors raised by the messaging session
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    /// Bad credentials or transport handshake failure on the initial connect
    #[error("connect failed: {0}")]
    Connect(String),

    /// The broker returned no granted QoS for a (re)subscribed topic
    #[error("broker rejected subscription to topic '{topic}'")]
    SubscribeRejected { topic: String },

    /// The connection dropped before the request was acknowledged
    #[error("connection interrupted: {0}")]
    Interrupted(String),

    /// The request could not be handed to the transport
    #[error("transport request failed: {0}")]
    Request(String),

    #[error("invalid session transition: {0}")]
    InvalidState(String),

    #[error("session is closed")]
    Closed,
}

impl SessionError {
    /// Fatal errors terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Connect(_) | SessionError::SubscribeRejected { .. }
        )
    }
}

/// Errors surfaced by a [`crate::session::Transport`] implementation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The broker answered the connect with a refusal code
    #[error("connection refused: {0}")]
    Refused(String),

    /// Network, TLS or protocol level failure
    #[error("connection error: {0}")]
    Connection(String),

    /// The outgoing request queue did not accept the request
    #[error("request rejected by client queue: {0}")]
    Request(String),
}

/// Payload encoding/decoding failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{field} value {value} outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Storage gateway failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize reading: {0}")]
    Codec(#[from] CodecError),

    #[error("corrupt record '{key}': {reason}")]
    Corrupt { key: String, reason: String },

    #[error("record '{0}' already exists")]
    DuplicateId(String),

    #[error("invalid table name '{0}'")]
    InvalidTable(String),

    #[error("storage worker failed: {0}")]
    Worker(String),
}

/// Query failures (transport or permission problems during a scan)
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::Connect("tls".into()).is_fatal());
        assert!(SessionError::SubscribeRejected {
            topic: "sensors/env".into()
        }
        .is_fatal());
        assert!(!SessionError::Interrupted("reset".into()).is_fatal());
        assert!(!SessionError::Closed.is_fatal());
    }
}
