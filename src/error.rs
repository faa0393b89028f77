// Copyright (C) 2023-2025 Qubesd Core Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use std::result;

use thiserror::Error;

pub type Result<T> = result::Result<T, QubesError>;

/// All errors the daemon can surface to a management client.
///
/// Every variant maps to a stable wire type name, sent as the
/// `<exc-type-name>` field of a `2`-prefixed response. Clients dispatch on
/// that name, so the mapping in [`QubesError::wire_name`] is part of the
/// protocol.
#[derive(Error, Debug)]
pub enum QubesError {
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Value(String),
    #[error("property {name} not found on {holder}")]
    NoSuchProperty { holder: String, name: String },
    #[error("feature {feature} not set on qube {vm}")]
    FeatureNotFound { vm: String, feature: String },
    #[error("tag {tag} not set on qube {vm}")]
    TagNotFound { vm: String, tag: String },
    #[error("domain {vm} is not halted")]
    NotHalted { vm: String },
    #[error("domain {vm} is not started")]
    NotStarted { vm: String },
    #[error("domain {vm} is not running")]
    NotRunning { vm: String },
    #[error("domain {vm} is not paused")]
    NotPaused { vm: String },
    #[error("domain {vm}: {msg}")]
    Vm { vm: String, msg: String },
    #[error("not enough memory to start domain {vm}")]
    OutOfMemory { vm: String },
    #[error("storage: {0}")]
    Storage(String),
    #[error("someone else modified {path} in the meantime")]
    StoreConflict { path: String },
    #[error("{0}")]
    External(String),
    #[error("{0}")]
    Qubes(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("{filename}:{lineno}: {msg}")]
    PolicySyntax {
        filename: String,
        lineno: usize,
        msg: String,
    },
}

impl QubesError {
    /// Stable exception type name used on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            QubesError::Protocol(_) => "ProtocolError",
            QubesError::PermissionDenied(_) => "PermissionDenied",
            QubesError::Value(_) => "QubesValueError",
            QubesError::NoSuchProperty { .. } => "QubesNoSuchPropertyError",
            QubesError::FeatureNotFound { .. } => "QubesFeatureNotFoundError",
            QubesError::TagNotFound { .. } => "QubesTagNotFoundError",
            QubesError::NotHalted { .. } => "QubesVMNotHaltedError",
            QubesError::NotStarted { .. } => "QubesVMNotStartedError",
            QubesError::NotRunning { .. } => "QubesVMNotRunningError",
            QubesError::NotPaused { .. } => "QubesVMNotPausedError",
            QubesError::Vm { .. } => "QubesVMError",
            QubesError::OutOfMemory { .. } => "QubesMemoryError",
            QubesError::Storage(_) => "StoragePoolException",
            QubesError::StoreConflict { .. } => "QubesStoreConflictError",
            QubesError::External(_) => "QubesException",
            QubesError::Qubes(_) => "QubesException",
            QubesError::AccessDenied(_) => "AccessDenied",
            QubesError::PolicySyntax { .. } => "PolicySyntaxError",
        }
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        QubesError::Protocol(msg.into())
    }

    pub fn value<S: Into<String>>(msg: S) -> Self {
        QubesError::Value(msg.into())
    }

    /// Wrap a hypervisor or pool failure, preserving the original message.
    pub fn external<E: std::fmt::Display>(error: E) -> Self {
        QubesError::External(error.to_string())
    }
}

impl From<std::io::Error> for QubesError {
    fn from(error: std::io::Error) -> Self {
        QubesError::External(error.to_string())
    }
}
