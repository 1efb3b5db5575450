use serde::{Deserialize, Serialize};

// ============================================================================
// Activity Log
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: String,
    pub event: String,
    pub level: String,
    /// JSON object as stored; `None` when the event carried no context.
    pub context: Option<String>,
    pub created_at: String,
}
