use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const REASON_AVAILABLE: &str = "Available";
pub const REASON_CREATING: &str = "Creating";
pub const REASON_UPDATING: &str = "Updating";
pub const REASON_ADOPTED: &str = "Adopted";
pub const REASON_DEPRECATED: &str = "Deprecated";
pub const REASON_ERROR: &str = "Error";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CanaryReleaseConditionType {
    Available,
    Progressing,
    Archived,
    Failure,
}

/// One entry of the CanaryRelease's append-only condition log
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryReleaseCondition {
    #[serde(rename = "type")]
    pub type_: CanaryReleaseConditionType,
    pub status: String,
    pub last_transition_time: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Build a condition, deriving its type from the reason.
pub fn new_condition(reason: &str, message: &str) -> CanaryReleaseCondition {
    let type_ = match reason {
        REASON_AVAILABLE => CanaryReleaseConditionType::Available,
        REASON_ADOPTED | REASON_DEPRECATED => CanaryReleaseConditionType::Archived,
        REASON_CREATING | REASON_UPDATING => CanaryReleaseConditionType::Progressing,
        _ => CanaryReleaseConditionType::Failure,
    };

    CanaryReleaseCondition {
        type_,
        status: "True".to_string(),
        last_transition_time: Utc::now().to_rfc3339(),
        reason: reason.to_string(),
        message: message.to_string(),
    }
}

/// Build a Failure condition from an error.
pub fn new_error_condition(err: &dyn std::fmt::Display) -> CanaryReleaseCondition {
    new_condition(REASON_ERROR, &err.to_string())
}
