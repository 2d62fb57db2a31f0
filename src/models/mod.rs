//! Data models and DTOs (Data Transfer Objects)
//!
//! Domain records for nodes and policy bundles, workflow reports, and the
//! request/response structures used by the API.

pub mod bundle;
pub mod node;
pub mod outcome;

// Re-export commonly used types
pub use bundle::*;
pub use node::*;
pub use outcome::*;

use crate::db::MAX_BATCH_IDS;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Accepted-operation response carrying a human readable summary
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub info: String,
}

impl InfoResponse {
    pub fn new(info: impl Into<String>) -> Self {
        Self { info: info.into() }
    }
}

/// Request to detach several bundles from a node in one statement
#[derive(Debug, Deserialize, Validate)]
pub struct DetachBatchRequest {
    #[validate(length(min = 1, max = (MAX_BATCH_IDS as u64), message = "Too few or too many bundle ids"))]
    pub ids: Vec<String>,
}
