//! Authenticated calls to the Google Cloud control-plane REST APIs.
//!
//! Every call reads the bearer token from the credential store and returns an
//! [`ApiOutcome`] instead of failing, so callers decide what a conflict or an
//! error means for them. Nothing here retries.

use std::fmt;

use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use crate::store::{CredentialStore, StoreError};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::types::{BillingAccount, TokenRecord};

pub const DEFAULT_REGION: &str = "us-central1";
pub const REQUIRED_APIS: [&str; 2] = ["run.googleapis.com", "cloudbuild.googleapis.com"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEndpoints {
    pub resource_manager: String,
    pub billing: String,
    pub service_usage: String,
    pub run: String,
    /// Knative serving endpoint; `{region}` is replaced with the target region.
    pub run_regional: String,
}

impl CloudEndpoints {
    pub fn google() -> Self {
        Self {
            resource_manager: "https://cloudresourcemanager.googleapis.com".to_string(),
            billing: "https://cloudbilling.googleapis.com".to_string(),
            service_usage: "https://serviceusage.googleapis.com".to_string(),
            run: "https://run.googleapis.com".to_string(),
            run_regional: "https://{region}-run.googleapis.com".to_string(),
        }
    }

    fn knative_services(&self, project_id: &str, region: &str) -> String {
        format!(
            "{}/apis/serving.knative.dev/v1/namespaces/{project_id}/services",
            self.run_regional.replace("{region}", region)
        )
    }

    fn run_service(&self, project_id: &str, region: &str, service: &str) -> String {
        format!(
            "{}/v1/projects/{project_id}/locations/{region}/services/{service}",
            self.run
        )
    }
}

impl Default for CloudEndpoints {
    fn default() -> Self {
        Self::google()
    }
}

/// A non-success response, or a request that never got one (`status: None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFailure {
    pub status: Option<u16>,
    pub body: String,
}

impl ApiFailure {
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status == 408 || status == 429 || status >= 500,
        }
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.body.trim()),
            None => f.write_str(&self.body),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutcome {
    Success(Value),
    /// The resource already exists.
    Conflict(ApiFailure),
    Transient(ApiFailure),
    Fatal(ApiFailure),
}

impl ApiOutcome {
    pub fn from_response(response: HttpResponse) -> Self {
        if response.is_success() {
            let body = response.body.trim();
            let value = if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
            };
            return ApiOutcome::Success(value);
        }

        let failure = ApiFailure {
            status: Some(response.status),
            body: response.body,
        };
        if response.status == 409 {
            ApiOutcome::Conflict(failure)
        } else if failure.is_transient() {
            ApiOutcome::Transient(failure)
        } else {
            ApiOutcome::Fatal(failure)
        }
    }

    pub fn from_transport_error(err: &TransportError) -> Self {
        ApiOutcome::Transient(ApiFailure {
            status: None,
            body: err.to_string(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ApiOutcome::Success(_))
    }

    pub fn failure(&self) -> Option<&ApiFailure> {
        match self {
            ApiOutcome::Success(_) => None,
            ApiOutcome::Conflict(failure)
            | ApiOutcome::Transient(failure)
            | ApiOutcome::Fatal(failure) => Some(failure),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ApiOutcome::Success(_) => "success",
            ApiOutcome::Conflict(_) => "conflict",
            ApiOutcome::Transient(_) => "transient",
            ApiOutcome::Fatal(_) => "fatal",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("cloud API call failed: {0}")]
    Api(ApiFailure),
    #[error("unexpected response from cloud API: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid cloud endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BillingAccountPage {
    #[serde(default)]
    billing_accounts: Vec<BillingAccount>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct CloudApiClient<T, C> {
    transport: T,
    credentials: C,
    endpoints: CloudEndpoints,
}

impl<T, C> CloudApiClient<T, C>
where
    T: HttpTransport,
    C: CredentialStore,
{
    pub fn new(transport: T, credentials: C, endpoints: CloudEndpoints) -> Self {
        Self {
            transport,
            credentials,
            endpoints,
        }
    }

    pub fn credentials(&self) -> &C {
        &self.credentials
    }

    pub fn endpoints(&self) -> &CloudEndpoints {
        &self.endpoints
    }

    /// The stored token, if it is usable and not yet expired.
    pub fn current_token(&self) -> Result<Option<TokenRecord>, StoreError> {
        let now = Utc::now();
        Ok(self
            .credentials
            .load()?
            .filter(|token| token.is_usable() && !token.is_expired(now, TimeDelta::zero())))
    }

    pub fn create_project(
        &self,
        project_id: &str,
        display_name: &str,
    ) -> Result<ApiOutcome, CloudError> {
        let url = format!("{}/v1/projects", self.endpoints.resource_manager);
        self.call(HttpRequest::post(url).json(json!({
            "projectId": project_id,
            "name": display_name,
        })))
    }

    pub fn link_billing(
        &self,
        project_id: &str,
        billing_account: &str,
    ) -> Result<ApiOutcome, CloudError> {
        let url = format!(
            "{}/v1/projects/{project_id}/billingInfo",
            self.endpoints.billing
        );
        self.call(HttpRequest::put(url).json(json!({ "billingAccountName": billing_account })))
    }

    pub fn enable_service(&self, project_id: &str, api: &str) -> Result<ApiOutcome, CloudError> {
        let url = format!(
            "{}/v1/projects/{project_id}/services/{api}:enable",
            self.endpoints.service_usage
        );
        self.call(HttpRequest::post(url).json(json!({})))
    }

    /// Whether service usage reports `api` as `ENABLED`. Any failure to ask
    /// counts as not enabled yet.
    pub fn service_enabled(&self, project_id: &str, api: &str) -> Result<bool, CloudError> {
        let url = format!(
            "{}/v1/projects/{project_id}/services/{api}",
            self.endpoints.service_usage
        );
        let enabled = match self.call(HttpRequest::get(url))? {
            ApiOutcome::Success(service) => service["state"] == "ENABLED",
            _ => false,
        };
        Ok(enabled)
    }

    pub fn create_service(
        &self,
        project_id: &str,
        region: &str,
        descriptor: &Value,
    ) -> Result<ApiOutcome, CloudError> {
        let url = self.endpoints.knative_services(project_id, region);
        self.call(HttpRequest::post(url).json(descriptor.clone()))
    }

    pub fn replace_service(
        &self,
        project_id: &str,
        region: &str,
        service: &str,
        descriptor: &Value,
    ) -> Result<ApiOutcome, CloudError> {
        let url = format!(
            "{}/{service}",
            self.endpoints.knative_services(project_id, region)
        );
        self.call(HttpRequest::put(url).json(descriptor.clone()))
    }

    /// Grants `roles/run.invoker` to `allUsers`.
    pub fn allow_public_invocation(
        &self,
        project_id: &str,
        region: &str,
        service: &str,
    ) -> Result<ApiOutcome, CloudError> {
        let url = format!(
            "{}:setIamPolicy",
            self.endpoints.run_service(project_id, region, service)
        );
        self.call(HttpRequest::post(url).json(json!({
            "policy": {
                "bindings": [{
                    "role": "roles/run.invoker",
                    "members": ["allUsers"]
                }]
            }
        })))
    }

    pub fn get_service(
        &self,
        project_id: &str,
        region: &str,
        service: &str,
    ) -> Result<ApiOutcome, CloudError> {
        let url = self.endpoints.run_service(project_id, region, service);
        self.call(HttpRequest::get(url))
    }

    /// Open billing accounts visible to the user, across all result pages.
    pub fn list_billing_accounts(&self) -> Result<Vec<BillingAccount>, CloudError> {
        let base = format!("{}/v1/billingAccounts", self.endpoints.billing);
        let mut accounts = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = Url::parse(&base)?;
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }
            let page = match self.call(HttpRequest::get(url.as_str()))? {
                ApiOutcome::Success(value) => serde_json::from_value::<BillingAccountPage>(value)?,
                ApiOutcome::Conflict(failure)
                | ApiOutcome::Transient(failure)
                | ApiOutcome::Fatal(failure) => return Err(CloudError::Api(failure)),
            };
            accounts.extend(page.billing_accounts.into_iter().filter(|a| a.open));
            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => return Ok(accounts),
            }
        }
    }

    fn call(&self, request: HttpRequest) -> Result<ApiOutcome, CloudError> {
        let token = self.current_token()?.ok_or(CloudError::NotAuthenticated)?;
        let request = request.bearer(token.access_token);
        let outcome = match self.transport.execute(&request) {
            Ok(response) => ApiOutcome::from_response(response),
            Err(err) => ApiOutcome::from_transport_error(&err),
        };
        debug!(
            method = %request.method,
            url = %request.url,
            outcome = outcome.label(),
            "cloud api call"
        );
        Ok(outcome)
    }
}

/// Public URL from a Cloud Run service resource, if it has one yet.
pub fn service_url(service: &Value) -> Option<String> {
    service["status"]["url"]
        .as_str()
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}
