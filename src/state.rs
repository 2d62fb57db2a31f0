//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::compliance::ComplianceService;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Attachment workflows and purge jobs
    pub compliance: ComplianceService,
}

impl AppState {
    pub fn new(compliance: ComplianceService) -> Self {
        Self { compliance }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
