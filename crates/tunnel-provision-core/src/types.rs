use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provisioning steps in their fixed order. The derived `Ord` is the order
/// the orchestrator walks them in.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum SetupStep {
    #[default]
    Start,
    Authenticated,
    CreatingProject,
    LinkingBilling,
    EnablingApis,
    Deploying,
    Complete,
}

impl SetupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupStep::Start => "start",
            SetupStep::Authenticated => "authenticated",
            SetupStep::CreatingProject => "creating_project",
            SetupStep::LinkingBilling => "linking_billing",
            SetupStep::EnablingApis => "enabling_apis",
            SetupStep::Deploying => "deploying",
            SetupStep::Complete => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == SetupStep::Complete
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted progress of one setup run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SetupState {
    #[serde(default)]
    pub step: SetupStep,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default, alias = "password")]
    pub generated_password: Option<String>,
    #[serde(default)]
    pub server_url: Option<String>,
}

impl SetupState {
    /// Moves the step forward. Returns `false` and leaves the state untouched
    /// when `step` is not ahead of the current one.
    pub fn advance_to(&mut self, step: SetupStep) -> bool {
        if step > self.step {
            self.step = step;
            true
        } else {
            false
        }
    }

    /// Whether `step` has already been completed in this run.
    pub fn is_past(&self, step: SetupStep) -> bool {
        self.step > step
    }
}

/// OAuth token as returned by the identity provider. Fields other than the
/// typed ones are kept verbatim in `raw`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub raw: BTreeMap<String, Value>,
}

impl TokenRecord {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expiry: None,
            raw: BTreeMap::new(),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// A record without an expiry never counts as expired.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expiry.is_some_and(|expiry| expiry - skew <= now)
    }
}

/// Snapshot for the status query. Carries only the presence of the
/// generated password, never the value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupStatus {
    pub authenticated: bool,
    pub step: SetupStep,
    pub project_id: Option<String>,
    pub server_url: Option<String>,
    pub has_password: bool,
}

impl SetupStatus {
    pub fn from_parts(token: Option<&TokenRecord>, state: &SetupState) -> Self {
        Self {
            authenticated: token.is_some_and(TokenRecord::is_usable),
            step: state.step,
            project_id: state.project_id.clone(),
            server_url: state.server_url.clone(),
            has_password: state.generated_password.is_some(),
        }
    }
}

/// Non-fatal problems recorded during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SetupWarning {
    ApiEnableFailed { api: String, detail: String },
    ApiNotReady { api: String },
    PublicAccessNotGranted { detail: String },
    ServiceUrlUnavailable { detail: String },
    PublishFailed { detail: String },
}

impl fmt::Display for SetupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupWarning::ApiEnableFailed { api, detail } => {
                write!(f, "enabling {api} failed: {detail}")
            }
            SetupWarning::ApiNotReady { api } => {
                write!(f, "{api} was not reported enabled before deploying")
            }
            SetupWarning::PublicAccessNotGranted { detail } => {
                write!(
                    f,
                    "could not allow unauthenticated invocation, the service may be unreachable: {detail}"
                )
            }
            SetupWarning::ServiceUrlUnavailable { detail } => {
                write!(f, "could not read the service URL: {detail}")
            }
            SetupWarning::PublishFailed { detail } => {
                write!(f, "add-on configuration was not updated: {detail}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisioningResult {
    pub project_id: String,
    pub server_url: Option<String>,
    pub generated_password: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SetupWarning>,
}

/// What the add-on needs to connect to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDetails {
    pub server_url: String,
    pub auth_user: String,
    pub auth_pass: String,
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BillingAccount {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub open: bool,
}
