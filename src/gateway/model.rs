use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct SubmitGroupRequest {
    pub recipients: Vec<String>,
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitGroupResponse {
    pub group_id: String,
}

/// Status payload as reported by the provider. `failed_recipients` is only
/// present on plans that expose per-recipient outcomes.
#[derive(Debug, Deserialize)]
pub struct GroupStatusResponse {
    pub total: i64,
    pub success: i64,
    pub fail: i64,
    pub sending: i64,
    #[serde(default)]
    pub failed_recipients: Option<Vec<String>>,
}
