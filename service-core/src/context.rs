//! Explicit "who is acting" context passed through every mutating call.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionSource {
    Api,
    Graphql,
    System,
}

impl ActionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Graphql => "graphql",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub organization_id: Uuid,
    pub source: ActionSource,
    /// Membership or API key that triggered the action, if any.
    pub actor: Option<String>,
    pub request_id: Uuid,
}

impl RequestContext {
    pub fn api(organization_id: Uuid, actor: impl Into<String>) -> Self {
        Self {
            organization_id,
            source: ActionSource::Api,
            actor: Some(actor.into()),
            request_id: Uuid::new_v4(),
        }
    }

    /// Context for work started by the worker rather than a caller.
    pub fn system(organization_id: Uuid) -> Self {
        Self {
            organization_id,
            source: ActionSource::System,
            actor: None,
            request_id: Uuid::new_v4(),
        }
    }
}
