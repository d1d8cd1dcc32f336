//! Client Request Model
//!
//! Already-parsed client requests and their typed results. Protocol adapters
//! translate wire formats into these values and back.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::state::NodeReport;
use crate::version::VersionStamp;

/// A client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub operation: Operation,
    /// Upper bound for the whole operation, in milliseconds
    #[serde(default)]
    pub timeout_hint_ms: Option<u64>,
}

impl Request {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            timeout_hint_ms: None,
        }
    }
}

impl From<Operation> for Request {
    fn from(operation: Operation) -> Self {
        Request::new(operation)
    }
}

/// Client operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Maximum accepted value length
    Init,
    Set {
        key: Vec<u8>,
        tags: Vec<Vec<u8>>,
        transaction: Option<String>,
        value: Vec<u8>,
    },
    Get {
        key: Vec<u8>,
    },
    GetTagKeys {
        tag: Vec<u8>,
        include_missing: bool,
    },
    Remove {
        key: Vec<u8>,
        transaction: Option<String>,
    },
    /// Create-only write
    SetOnce {
        key: Vec<u8>,
        tags: Vec<Vec<u8>>,
        transaction: Option<String>,
        value: Vec<u8>,
    },
    /// Read-only script evaluated by the node owning the key
    GetScript {
        key: Vec<u8>,
        script: String,
    },
    /// Script that may modify the value, run on every replica
    GetScriptForUpdate {
        key: Vec<u8>,
        script: String,
        transaction: Option<String>,
    },
    NodeStatus {
        node: String,
    },
    Ping,
    Increment {
        key: Vec<u8>,
        transaction: Option<String>,
        delta: i64,
    },
    Decrement {
        key: Vec<u8>,
        transaction: Option<String>,
        delta: i64,
    },
    GetWithVersion {
        key: Vec<u8>,
    },
    /// Version-checked write
    SetIfVersion {
        key: Vec<u8>,
        tags: Vec<Vec<u8>>,
        transaction: Option<String>,
        value: Vec<u8>,
        expected: VersionStamp,
    },
    MultiGet {
        keys: Vec<Vec<u8>>,
    },
    GetTagValues {
        tag: Vec<u8>,
    },
    Lock {
        key: Vec<u8>,
        transaction: String,
        hold_secs: u64,
        wait_secs: u64,
    },
    Unlock {
        key: Vec<u8>,
        transaction: String,
    },
    LockOwner {
        key: Vec<u8>,
    },
    StartTransaction,
    RemoveTagFromKey {
        tag: Vec<u8>,
        key: Vec<u8>,
        transaction: Option<String>,
    },

    // Node control
    PauseNode {
        node: String,
    },
    ResumeNode {
        node: String,
    },
    ArriveNode {
        node: String,
    },
    PauseNodes {
        nodes: Vec<String>,
    },
    ResumeNodes {
        nodes: Vec<String>,
    },
    DeadNode {
        node: String,
    },
    StartRecovery {
        node: String,
    },
    EndRecovery {
        node: String,
    },

    Version,
    /// Close the session without a response
    Disconnect,
}

impl Operation {
    /// Numeric operation code used by protocol adapters
    pub fn code(&self) -> u16 {
        match self {
            Operation::Init => 0,
            Operation::Set { .. } => 1,
            Operation::Get { .. } => 2,
            Operation::GetTagKeys { .. } => 3,
            Operation::Remove { .. } => 5,
            Operation::SetOnce { .. } => 6,
            Operation::GetScript { .. } => 8,
            Operation::GetScriptForUpdate { .. } => 9,
            Operation::NodeStatus { .. } => 10,
            Operation::Ping => 12,
            Operation::Increment { .. } => 13,
            Operation::Decrement { .. } => 14,
            Operation::GetWithVersion { .. } => 15,
            Operation::SetIfVersion { .. } => 16,
            Operation::MultiGet { .. } => 22,
            Operation::GetTagValues { .. } => 23,
            Operation::Lock { .. } => 30,
            Operation::Unlock { .. } => 31,
            Operation::LockOwner { .. } => 32,
            Operation::StartTransaction => 37,
            Operation::RemoveTagFromKey { .. } => 40,
            Operation::PauseNode { .. } => 90,
            Operation::ResumeNode { .. } => 91,
            Operation::ArriveNode { .. } => 92,
            Operation::PauseNodes { .. } => 93,
            Operation::ResumeNodes { .. } => 94,
            Operation::DeadNode { .. } => 95,
            Operation::StartRecovery { .. } => 96,
            Operation::EndRecovery { .. } => 97,
            Operation::Version => 999,
            Operation::Disconnect => u16::MAX,
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Init => "Init",
            Operation::Set { .. } => "Set",
            Operation::Get { .. } => "Get",
            Operation::GetTagKeys { .. } => "GetTagKeys",
            Operation::Remove { .. } => "Remove",
            Operation::SetOnce { .. } => "SetOnce",
            Operation::GetScript { .. } => "GetScript",
            Operation::GetScriptForUpdate { .. } => "GetScriptForUpdate",
            Operation::NodeStatus { .. } => "NodeStatus",
            Operation::Ping => "Ping",
            Operation::Increment { .. } => "Increment",
            Operation::Decrement { .. } => "Decrement",
            Operation::GetWithVersion { .. } => "GetWithVersion",
            Operation::SetIfVersion { .. } => "SetIfVersion",
            Operation::MultiGet { .. } => "MultiGet",
            Operation::GetTagValues { .. } => "GetTagValues",
            Operation::Lock { .. } => "Lock",
            Operation::Unlock { .. } => "Unlock",
            Operation::LockOwner { .. } => "LockOwner",
            Operation::StartTransaction => "StartTransaction",
            Operation::RemoveTagFromKey { .. } => "RemoveTagFromKey",
            Operation::PauseNode { .. } => "PauseNode",
            Operation::ResumeNode { .. } => "ResumeNode",
            Operation::ArriveNode { .. } => "ArriveNode",
            Operation::PauseNodes { .. } => "PauseNodes",
            Operation::ResumeNodes { .. } => "ResumeNodes",
            Operation::DeadNode { .. } => "DeadNode",
            Operation::StartRecovery { .. } => "StartRecovery",
            Operation::EndRecovery { .. } => "EndRecovery",
            Operation::Version => "Version",
            Operation::Disconnect => "Disconnect",
        }
    }
}

/// Response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Value(Vec<u8>),
    Keys(Vec<Vec<u8>>),
    /// Key with its value, `None` for missing keys
    Entries(Vec<(Vec<u8>, Option<Vec<u8>>)>),
    Integer(i64),
    Text(String),
    Nodes(Vec<NodeReport>),
}

/// Three-valued status reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    True,
    False,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::True => write!(f, "true"),
            Status::False => write!(f, "false"),
            Status::Error => write!(f, "error"),
        }
    }
}

/// Result of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Success {
        payload: Payload,
        version: Option<VersionStamp>,
    },
    NotFound,
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Response {
    /// Success without a version
    pub fn ok(payload: Payload) -> Self {
        Response::Success { payload, version: None }
    }

    pub fn empty() -> Self {
        Self::ok(Payload::Empty)
    }

    /// Logical failure with a message shown to the client verbatim
    pub fn refused(message: impl Into<String>) -> Self {
        Response::Error {
            kind: ErrorKind::Logical,
            message: message.into(),
        }
    }

    /// `true`, `false` or `error`. Logical refusals and disabled features are
    /// ordinary `false` answers.
    pub fn status(&self) -> Status {
        match self {
            Response::Success { .. } => Status::True,
            Response::NotFound => Status::False,
            Response::Error { kind, .. } => match kind {
                ErrorKind::Logical | ErrorKind::NotPermitted => Status::False,
                _ => Status::Error,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success { .. })
    }
}

impl From<&Error> for Response {
    fn from(error: &Error) -> Self {
        Response::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl From<Error> for Response {
    fn from(error: Error) -> Self {
        Response::from(&error)
    }
}
