//! # hs-suggestion
//!
//! Protocol adapter between the controllers and a search algorithm service.
//!
//! [`SuggestionClient`] fills a Suggestion's assignment backlog and
//! validates algorithm settings over an [`AlgorithmService`]. Services are
//! reached through an [`AlgorithmConnector`]: [`HttpConnector`] for a real
//! deployment, [`LocalConnector`] for the in-process sandbox.

pub mod client;
pub mod convert;
pub mod http;
pub mod local;
pub mod service;
pub mod wire;

pub use client::{ClientConfig, SuggestionClient};
pub use convert::{experiment_to_wire, experiment_with_settings, merge_by_name, trial_to_wire};
pub use http::{HttpAlgorithmService, HttpConnector};
pub use local::{LocalAlgorithmService, LocalConnector, SuggestionCall};
pub use service::{AlgorithmConnector, AlgorithmService, RpcCode, RpcResult, RpcStatus};
pub use wire::*;
