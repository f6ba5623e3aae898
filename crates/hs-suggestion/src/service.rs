//! Algorithm service abstraction.
//!
//! The controllers never talk to a transport directly: they resolve an
//! endpoint through an [`AlgorithmConnector`] and call the returned
//! [`AlgorithmService`]. The production connector speaks JSON over HTTP
//! (see [`crate::http`]); the sandbox connector runs the algorithms in
//! process (see [`crate::local`]).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::wire::{
    GetEarlyStoppingRulesReply, GetEarlyStoppingRulesRequest, GetSuggestionsReply,
    GetSuggestionsRequest, ValidateAlgorithmSettingsRequest, ValidateEarlyStoppingSettingsRequest,
};

/// Status codes carried by a failed call, following the gRPC code names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    ResourceExhausted,
    FailedPrecondition,
    Unimplemented,
    Internal,
    Unavailable,
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
        };
        f.write_str(name)
    }
}

/// A failed call: status code plus a human readable message. Also the JSON
/// error body of the HTTP transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcStatus {
    pub code: RpcCode,
    #[serde(default)]
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcCode::InvalidArgument, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unavailable, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(RpcCode::Unimplemented, message)
    }
}

pub type RpcResult<T> = Result<T, RpcStatus>;

/// The search algorithm and early stopping RPC surface.
#[async_trait]
pub trait AlgorithmService: Send + Sync {
    /// Ask for `current_request_number` new parameter assignments.
    async fn get_suggestions(&self, request: GetSuggestionsRequest) -> RpcResult<GetSuggestionsReply>;

    async fn validate_algorithm_settings(
        &self,
        request: ValidateAlgorithmSettingsRequest,
    ) -> RpcResult<()>;

    async fn validate_early_stopping_settings(
        &self,
        request: ValidateEarlyStoppingSettingsRequest,
    ) -> RpcResult<()>;

    async fn get_early_stopping_rules(
        &self,
        request: GetEarlyStoppingRulesRequest,
    ) -> RpcResult<GetEarlyStoppingRulesReply>;
}

/// Resolves an endpoint (`host:port`) to a service handle.
pub trait AlgorithmConnector: Send + Sync {
    fn connect(&self, endpoint: &str) -> Arc<dyn AlgorithmService>;
}
