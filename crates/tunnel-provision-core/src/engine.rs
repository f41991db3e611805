use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cloud::{
    ApiFailure, ApiOutcome, CloudApiClient, CloudError, DEFAULT_REGION, REQUIRED_APIS, service_url,
};
use crate::pkce::random_urlsafe;
use crate::publish::ConfigPublisher;
use crate::service::ServiceSpec;
use crate::store::{CredentialStore, ProgressStore, StoreError, setup_status};
use crate::transport::HttpTransport;
use crate::types::{
    ConnectionDetails, ProvisioningResult, SetupState, SetupStatus, SetupStep, SetupWarning,
};

pub const AUTH_USER: &str = "hauser";
pub const PROJECT_PREFIX: &str = "ha-tunnel-";
pub const PROJECT_DISPLAY_NAME: &str = "HA Tunnel";

#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub region: String,
    pub service: ServiceSpec,
    pub apis: Vec<String>,
    /// Wait before the first enablement check; doubles per attempt up to
    /// `max_settle_delay`.
    pub settle_delay: Duration,
    pub max_settle_delay: Duration,
    pub enable_poll_attempts: u32,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            service: ServiceSpec::default(),
            apis: REQUIRED_APIS.iter().map(|api| api.to_string()).collect(),
            settle_delay: Duration::from_secs(5),
            max_settle_delay: Duration::from_secs(40),
            enable_poll_attempts: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("not authenticated: complete the authorization flow first")]
    NotAuthenticated,
    #[error("failed to create project {project_id}: {failure}")]
    ProjectCreateFailed {
        project_id: String,
        failure: ApiFailure,
    },
    #[error("billing required: failed to link {billing_account}: {failure}")]
    BillingLinkFailed {
        billing_account: String,
        failure: ApiFailure,
    },
    #[error("failed to deploy service {service}: {failure}")]
    DeployFailed {
        service: String,
        failure: ApiFailure,
    },
    #[error("stored setup state is past project creation but has no {0}")]
    IncompleteState(&'static str),
    #[error("failed to persist setup state: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cloud(CloudError),
}

impl SetupError {
    /// The user has to pick (or fix) a billing account before retrying.
    pub fn billing_required(&self) -> bool {
        matches!(self, SetupError::BillingLinkFailed { .. })
    }

    /// Whether re-running the setup unchanged has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            SetupError::ProjectCreateFailed { failure, .. }
            | SetupError::BillingLinkFailed { failure, .. }
            | SetupError::DeployFailed { failure, .. } => failure.is_transient(),
            _ => false,
        }
    }
}

impl From<CloudError> for SetupError {
    fn from(err: CloudError) -> Self {
        match err {
            CloudError::NotAuthenticated => SetupError::NotAuthenticated,
            CloudError::Store(err) => SetupError::Store(err),
            other => SetupError::Cloud(other),
        }
    }
}

/// `ha-tunnel-` followed by 12 hex characters (48 random bits).
pub fn generate_project_id() -> String {
    let suffix: [u8; 6] = rand::random();
    let hex: String = suffix.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{PROJECT_PREFIX}{hex}")
}

/// 24 random bytes, URL-safe: 192 bits.
pub fn generate_password() -> String {
    random_urlsafe(24)
}

/// Drives a setup run through its steps, persisting progress after each one.
///
/// A step whose persisted position is already behind the current step is
/// skipped on later runs. The step being worked on is always re-attempted in
/// full, which is safe because project creation and service deployment both
/// treat "already exists" as success.
pub struct SetupOrchestrator<T, C, P, B> {
    client: CloudApiClient<T, C>,
    progress: P,
    publisher: B,
    options: SetupOptions,
}

impl<T, C, P, B> SetupOrchestrator<T, C, P, B>
where
    T: HttpTransport,
    C: CredentialStore,
    P: ProgressStore,
    B: ConfigPublisher,
{
    pub fn new(
        client: CloudApiClient<T, C>,
        progress: P,
        publisher: B,
        options: SetupOptions,
    ) -> Self {
        Self {
            client,
            progress,
            publisher,
            options,
        }
    }

    pub fn client(&self) -> &CloudApiClient<T, C> {
        &self.client
    }

    pub fn progress(&self) -> &P {
        &self.progress
    }

    pub fn options(&self) -> &SetupOptions {
        &self.options
    }

    pub fn status(&self) -> Result<SetupStatus, StoreError> {
        setup_status(self.client.credentials(), &self.progress)
    }

    pub fn into_parts(self) -> (CloudApiClient<T, C>, P, B) {
        (self.client, self.progress, self.publisher)
    }

    pub fn run_setup(
        &mut self,
        billing_account: Option<&str>,
    ) -> Result<ProvisioningResult, SetupError> {
        if self.client.current_token()?.is_none() {
            return Err(SetupError::NotAuthenticated);
        }

        let mut state = self.progress.load_or_default()?;
        if state.step.is_terminal() {
            return completed_result(&state);
        }
        if state.project_id.is_none() && state.is_past(SetupStep::CreatingProject) {
            return Err(SetupError::IncompleteState("project id"));
        }

        let project_id = match &state.project_id {
            Some(project_id) => project_id.clone(),
            None => {
                let project_id = generate_project_id();
                state.project_id = Some(project_id.clone());
                project_id
            }
        };
        let password = match &state.generated_password {
            Some(password) => password.clone(),
            None => {
                let password = generate_password();
                state.generated_password = Some(password.clone());
                password
            }
        };
        self.advance(&mut state, SetupStep::CreatingProject)?;

        let mut warnings = Vec::new();

        if !state.is_past(SetupStep::CreatingProject) {
            self.create_project(&project_id)?;
            self.advance(&mut state, SetupStep::LinkingBilling)?;
        }

        if !state.is_past(SetupStep::LinkingBilling) {
            match billing_account {
                Some(account) => self.link_billing(&project_id, account)?,
                None => info!(%project_id, "no billing account given; leaving billing as is"),
            }
            self.advance(&mut state, SetupStep::EnablingApis)?;
        }

        if !state.is_past(SetupStep::EnablingApis) {
            self.enable_apis(&project_id, &mut warnings)?;
            self.advance(&mut state, SetupStep::Deploying)?;
        }

        self.deploy(&project_id, &password)?;
        self.grant_public_access(&project_id, &mut warnings)?;
        if let Some(url) = self.fetch_service_url(&project_id, &mut warnings)? {
            state.server_url = Some(url);
        }
        self.advance(&mut state, SetupStep::Complete)?;
        info!(%project_id, server_url = ?state.server_url, "setup complete");

        let details = ConnectionDetails {
            server_url: state.server_url.clone().unwrap_or_default(),
            auth_user: AUTH_USER.to_string(),
            auth_pass: password.clone(),
            project_id: project_id.clone(),
        };
        if let Err(err) = self.publisher.publish(&details) {
            warn!(error = %err, "could not update add-on configuration");
            warnings.push(SetupWarning::PublishFailed {
                detail: err.to_string(),
            });
        }

        Ok(ProvisioningResult {
            project_id,
            server_url: state.server_url,
            generated_password: password,
            warnings,
        })
    }

    fn advance(&mut self, state: &mut SetupState, step: SetupStep) -> Result<(), StoreError> {
        state.advance_to(step);
        self.progress.save(state)?;
        debug!(step = %state.step, "setup state saved");
        Ok(())
    }

    fn create_project(&self, project_id: &str) -> Result<(), SetupError> {
        match self.client.create_project(project_id, PROJECT_DISPLAY_NAME)? {
            ApiOutcome::Success(_) => info!(%project_id, "project created"),
            ApiOutcome::Conflict(_) => info!(%project_id, "project already exists"),
            ApiOutcome::Transient(failure) | ApiOutcome::Fatal(failure) => {
                return Err(SetupError::ProjectCreateFailed {
                    project_id: project_id.to_string(),
                    failure,
                });
            }
        }
        Ok(())
    }

    fn link_billing(&self, project_id: &str, billing_account: &str) -> Result<(), SetupError> {
        match self.client.link_billing(project_id, billing_account)? {
            ApiOutcome::Success(_) => {
                info!(%project_id, billing_account, "billing linked");
                Ok(())
            }
            ApiOutcome::Conflict(failure)
            | ApiOutcome::Transient(failure)
            | ApiOutcome::Fatal(failure) => Err(SetupError::BillingLinkFailed {
                billing_account: billing_account.to_string(),
                failure,
            }),
        }
    }

    fn enable_apis(
        &self,
        project_id: &str,
        warnings: &mut Vec<SetupWarning>,
    ) -> Result<(), SetupError> {
        for api in &self.options.apis {
            match self.client.enable_service(project_id, api)? {
                ApiOutcome::Success(_) => debug!(api = %api, "enablement requested"),
                ApiOutcome::Conflict(failure)
                | ApiOutcome::Transient(failure)
                | ApiOutcome::Fatal(failure) => {
                    warn!(api = %api, %failure, "enabling API failed");
                    warnings.push(SetupWarning::ApiEnableFailed {
                        api: api.clone(),
                        detail: failure.to_string(),
                    });
                }
            }
        }
        self.wait_for_apis(project_id, warnings)
    }

    /// Polls service usage until every API reports enabled or the attempts
    /// run out. Stragglers become warnings; the deploy step reports the real
    /// failure if one of them is actually needed.
    fn wait_for_apis(
        &self,
        project_id: &str,
        warnings: &mut Vec<SetupWarning>,
    ) -> Result<(), SetupError> {
        let mut pending: Vec<&str> = self.options.apis.iter().map(String::as_str).collect();
        let mut delay = self.options.settle_delay;
        for attempt in 1..=self.options.enable_poll_attempts.max(1) {
            if !delay.is_zero() {
                debug!(?delay, attempt, "waiting for API enablement to settle");
                thread::sleep(delay);
            }
            let mut still_pending = Vec::new();
            for api in pending {
                if !self.client.service_enabled(project_id, api)? {
                    still_pending.push(api);
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                return Ok(());
            }
            delay = (delay * 2).min(self.options.max_settle_delay);
        }
        for api in pending {
            warn!(api, "API not reported enabled; continuing");
            warnings.push(SetupWarning::ApiNotReady {
                api: api.to_string(),
            });
        }
        Ok(())
    }

    fn deploy(&self, project_id: &str, password: &str) -> Result<(), SetupError> {
        let region = self.options.region.as_str();
        let spec = &self.options.service;
        let descriptor = spec.descriptor(AUTH_USER, password);

        let outcome = match self.client.create_service(project_id, region, &descriptor)? {
            ApiOutcome::Conflict(_) => {
                info!(service = %spec.name, "service exists; replacing it");
                self.client
                    .replace_service(project_id, region, &spec.name, &descriptor)?
            }
            outcome => outcome,
        };
        match outcome {
            ApiOutcome::Success(_) => {
                info!(service = %spec.name, %region, "service deployed");
                Ok(())
            }
            ApiOutcome::Conflict(failure)
            | ApiOutcome::Transient(failure)
            | ApiOutcome::Fatal(failure) => Err(SetupError::DeployFailed {
                service: spec.name.clone(),
                failure,
            }),
        }
    }

    fn grant_public_access(
        &self,
        project_id: &str,
        warnings: &mut Vec<SetupWarning>,
    ) -> Result<(), SetupError> {
        let outcome = self.client.allow_public_invocation(
            project_id,
            &self.options.region,
            &self.options.service.name,
        )?;
        if let Some(failure) = outcome.failure() {
            warn!(%failure, "could not allow unauthenticated invocation");
            warnings.push(SetupWarning::PublicAccessNotGranted {
                detail: failure.to_string(),
            });
        }
        Ok(())
    }

    fn fetch_service_url(
        &self,
        project_id: &str,
        warnings: &mut Vec<SetupWarning>,
    ) -> Result<Option<String>, SetupError> {
        let outcome =
            self.client
                .get_service(project_id, &self.options.region, &self.options.service.name)?;
        let detail = match outcome {
            ApiOutcome::Success(service) => match service_url(&service) {
                Some(url) => return Ok(Some(url)),
                None => "service has no URL yet".to_string(),
            },
            ApiOutcome::Conflict(failure)
            | ApiOutcome::Transient(failure)
            | ApiOutcome::Fatal(failure) => failure.to_string(),
        };
        warn!(%detail, "service URL unavailable");
        warnings.push(SetupWarning::ServiceUrlUnavailable { detail });
        Ok(None)
    }
}

fn completed_result(state: &SetupState) -> Result<ProvisioningResult, SetupError> {
    let project_id = state
        .project_id
        .clone()
        .ok_or(SetupError::IncompleteState("project id"))?;
    let generated_password = state
        .generated_password
        .clone()
        .ok_or(SetupError::IncompleteState("generated password"))?;
    info!(%project_id, "setup already complete");
    Ok(ProvisioningResult {
        project_id,
        server_url: state.server_url.clone(),
        generated_password,
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudEndpoints;
    use crate::publish::PublishError;
    use crate::store::{InMemoryCredentialStore, InMemoryProgressStore};
    use crate::transport::{HttpMethod, ScriptedTransport};
    use crate::types::TokenRecord;
    use serde_json::json;

    const CREATE_PROJECT: &str = "cloudresourcemanager.googleapis.com/v1/projects";
    const BILLING: &str = "/billingInfo";
    const ENABLE: &str = ":enable";
    const SERVICE_STATE: &str = "serviceusage.googleapis.com/v1/projects";
    const KNATIVE: &str = "/apis/serving.knative.dev/v1/namespaces/";
    const SET_IAM: &str = ":setIamPolicy";
    const GET_SERVICE: &str = "https://run.googleapis.com/v1/projects";
    const SERVICE_URL: &str = "https://ha-tunnel-abc123-uc.a.run.app";

    #[derive(Default)]
    struct RecordingPublisher {
        published: Vec<ConnectionDetails>,
        fail: bool,
    }

    impl ConfigPublisher for RecordingPublisher {
        fn publish(&mut self, details: &ConnectionDetails) -> Result<(), PublishError> {
            self.published.push(details.clone());
            if self.fail {
                return Err(PublishError::OptionsRejected(ApiFailure {
                    status: Some(500),
                    body: "supervisor down".to_string(),
                }));
            }
            Ok(())
        }
    }

    type TestOrchestrator<'a> = SetupOrchestrator<
        &'a ScriptedTransport,
        InMemoryCredentialStore,
        InMemoryProgressStore,
        RecordingPublisher,
    >;

    fn orchestrator(
        transport: &ScriptedTransport,
        state: Option<SetupState>,
    ) -> TestOrchestrator<'_> {
        let client = CloudApiClient::new(
            transport,
            InMemoryCredentialStore::with_record(TokenRecord::new("ya29.token")),
            CloudEndpoints::google(),
        );
        let progress = state
            .map(InMemoryProgressStore::with_state)
            .unwrap_or_default();
        let options = SetupOptions {
            settle_delay: Duration::ZERO,
            max_settle_delay: Duration::ZERO,
            enable_poll_attempts: 2,
            ..SetupOptions::default()
        };
        SetupOrchestrator::new(client, progress, RecordingPublisher::default(), options)
    }

    // Replies queue per route, so tests script their failures before calling
    // these.
    fn script_success(transport: &ScriptedTransport) {
        transport
            .respond_json(
                HttpMethod::Post,
                CREATE_PROJECT,
                200,
                json!({ "name": "operations/cp.1" }),
            )
            .respond(HttpMethod::Put, BILLING, 200, "{}")
            .respond(HttpMethod::Post, ENABLE, 200, "{}")
            .respond_json(HttpMethod::Get, SERVICE_STATE, 200, json!({ "state": "ENABLED" }));
        script_deploy(transport);
    }

    fn script_deploy(transport: &ScriptedTransport) {
        transport
            .respond_json(HttpMethod::Post, KNATIVE, 200, json!({ "kind": "Service" }))
            .respond(HttpMethod::Post, SET_IAM, 200, "{}")
            .respond_json(
                HttpMethod::Get,
                GET_SERVICE,
                200,
                json!({ "status": { "url": SERVICE_URL } }),
            );
    }

    fn state_at(step: SetupStep) -> SetupState {
        SetupState {
            step,
            project_id: Some("ha-tunnel-0a1b2c3d4e5f".to_string()),
            generated_password: Some("persisted-password".to_string()),
            server_url: None,
        }
    }

    #[test]
    fn full_run_walks_every_step_in_order() {
        let transport = ScriptedTransport::new();
        script_success(&transport);
        let mut orchestrator = orchestrator(&transport, None);

        let result = orchestrator
            .run_setup(Some("billingAccounts/ABC123"))
            .expect("setup");

        assert!(result.project_id.starts_with(PROJECT_PREFIX));
        assert_eq!(result.project_id.len(), PROJECT_PREFIX.len() + 12);
        assert!(result.generated_password.len() >= 32);
        assert_eq!(result.server_url.as_deref(), Some(SERVICE_URL));
        assert!(result.warnings.is_empty());

        let (_, progress, publisher) = orchestrator.into_parts();
        let steps: Vec<_> = progress.history().iter().map(|s| s.step).collect();
        assert_eq!(
            steps,
            vec![
                SetupStep::CreatingProject,
                SetupStep::LinkingBilling,
                SetupStep::EnablingApis,
                SetupStep::Deploying,
                SetupStep::Complete,
            ]
        );
        assert!(
            progress
                .history()
                .iter()
                .all(|s| s.project_id.as_deref() == Some(result.project_id.as_str()))
        );

        assert_eq!(publisher.published.len(), 1);
        let details = &publisher.published[0];
        assert_eq!(details.server_url, SERVICE_URL);
        assert_eq!(details.auth_user, AUTH_USER);
        assert_eq!(details.auth_pass, result.generated_password);

        assert_eq!(transport.requests_to(HttpMethod::Post, ENABLE).len(), 2);
        let deploy = &transport.requests_to(HttpMethod::Post, KNATIVE)[0];
        let env = &deploy.json_body().expect("descriptor")["spec"]["template"]["spec"]
            ["containers"][0]["env"][0]["value"];
        assert_eq!(env, &json!(format!("hauser:{}", result.generated_password)));
    }

    #[test]
    fn missing_token_is_not_authenticated() {
        let transport = ScriptedTransport::new();
        let client = CloudApiClient::new(
            &transport,
            InMemoryCredentialStore::default(),
            CloudEndpoints::google(),
        );
        let mut orchestrator = SetupOrchestrator::new(
            client,
            InMemoryProgressStore::default(),
            RecordingPublisher::default(),
            SetupOptions::default(),
        );

        let result = orchestrator.run_setup(None);
        assert!(matches!(result, Err(SetupError::NotAuthenticated)));
        assert!(transport.requests().is_empty());
        assert!(orchestrator.progress().history().is_empty());
    }

    #[test]
    fn expired_token_is_not_authenticated() {
        let transport = ScriptedTransport::new();
        script_success(&transport);
        let mut token = TokenRecord::new("ya29.stale");
        token.expiry = Some(chrono::Utc::now() - chrono::TimeDelta::hours(2));
        let client = CloudApiClient::new(
            &transport,
            InMemoryCredentialStore::with_record(token),
            CloudEndpoints::google(),
        );
        let mut orchestrator = SetupOrchestrator::new(
            client,
            InMemoryProgressStore::default(),
            RecordingPublisher::default(),
            SetupOptions::default(),
        );

        let result = orchestrator.run_setup(None);
        assert!(matches!(result, Err(SetupError::NotAuthenticated)));
        assert!(transport.requests().is_empty());
        assert!(orchestrator.progress().history().is_empty());
    }

    #[test]
    fn state_past_creation_without_project_id_is_rejected() {
        let transport = ScriptedTransport::new();
        script_success(&transport);
        let state = SetupState {
            project_id: None,
            ..state_at(SetupStep::LinkingBilling)
        };
        let mut orchestrator = orchestrator(&transport, Some(state.clone()));

        let result = orchestrator.run_setup(Some("billingAccounts/ABC123"));
        assert!(matches!(result, Err(SetupError::IncompleteState("project id"))));
        assert!(transport.requests().is_empty());
        assert_eq!(orchestrator.progress().history(), [state].as_slice());
    }

    #[test]
    fn project_conflict_keeps_persisted_identifiers() {
        let transport = ScriptedTransport::new();
        transport.respond(HttpMethod::Post, CREATE_PROJECT, 409, "ALREADY_EXISTS");
        script_success(&transport);
        let mut orchestrator = orchestrator(&transport, Some(state_at(SetupStep::CreatingProject)));

        let result = orchestrator.run_setup(None).expect("setup");
        assert_eq!(result.project_id, "ha-tunnel-0a1b2c3d4e5f");
        assert_eq!(result.generated_password, "persisted-password");
        let create = &transport.requests_to(HttpMethod::Post, CREATE_PROJECT)[0];
        assert_eq!(
            create.json_body().expect("body")["projectId"],
            "ha-tunnel-0a1b2c3d4e5f"
        );
    }

    #[test]
    fn failed_project_create_keeps_step_and_identifiers_for_retry() {
        let transport = ScriptedTransport::new();
        transport.respond(HttpMethod::Post, CREATE_PROJECT, 403, "PERMISSION_DENIED");
        let mut orchestrator = orchestrator(&transport, None);

        let err = orchestrator.run_setup(None).expect_err("create should fail");
        assert!(matches!(err, SetupError::ProjectCreateFailed { .. }));
        assert!(!err.is_retryable());
        let first = orchestrator
            .progress()
            .load()
            .expect("load")
            .expect("state persisted");
        assert_eq!(first.step, SetupStep::CreatingProject);

        let err = orchestrator.run_setup(None).expect_err("still failing");
        assert!(err.to_string().contains("PERMISSION_DENIED"));
        let second = orchestrator
            .progress()
            .load()
            .expect("load")
            .expect("state persisted");
        assert_eq!(second, first);

        let ids: Vec<_> = transport
            .requests_to(HttpMethod::Post, CREATE_PROJECT)
            .iter()
            .map(|r| r.json_body().expect("body")["projectId"].clone())
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
    }

    #[test]
    fn billing_after_prior_project_creation_does_not_recreate_project() {
        let transport = ScriptedTransport::new();
        script_success(&transport);
        let mut orchestrator = orchestrator(&transport, Some(state_at(SetupStep::LinkingBilling)));

        orchestrator
            .run_setup(Some("billingAccounts/ABC123"))
            .expect("setup");

        assert!(transport.requests_to(HttpMethod::Post, CREATE_PROJECT).is_empty());
        let billing = transport.requests_to(HttpMethod::Put, BILLING);
        assert_eq!(billing.len(), 1);
        assert_eq!(
            billing[0].json_body().expect("body")["billingAccountName"],
            "billingAccounts/ABC123"
        );
        let state = orchestrator.progress().load().expect("load").expect("state");
        assert!(state.is_past(SetupStep::LinkingBilling));
    }

    #[test]
    fn billing_failure_is_user_actionable_and_does_not_advance() {
        let transport = ScriptedTransport::new();
        transport.respond(HttpMethod::Put, BILLING, 403, "billing account closed");
        script_success(&transport);
        let mut orchestrator = orchestrator(&transport, Some(state_at(SetupStep::LinkingBilling)));

        let err = orchestrator
            .run_setup(Some("billingAccounts/ABC123"))
            .expect_err("billing should fail");
        assert!(err.billing_required());
        let state = orchestrator.progress().load().expect("load").expect("state");
        assert_eq!(state.step, SetupStep::LinkingBilling);
        assert!(transport.requests_to(HttpMethod::Post, ENABLE).is_empty());
    }

    #[test]
    fn deploy_conflict_falls_back_to_identical_update() {
        let transport = ScriptedTransport::new();
        transport
            .respond(HttpMethod::Post, KNATIVE, 409, "ALREADY_EXISTS")
            .respond(HttpMethod::Put, KNATIVE, 200, "{}");
        script_success(&transport);
        let mut orchestrator = orchestrator(&transport, Some(state_at(SetupStep::Deploying)));

        let result = orchestrator.run_setup(None).expect("setup");

        let create = &transport.requests_to(HttpMethod::Post, KNATIVE)[0];
        let update = &transport.requests_to(HttpMethod::Put, KNATIVE)[0];
        assert!(update.url.ends_with("/services/ha-tunnel"));
        assert_eq!(create.json_body(), update.json_body());
        assert_eq!(result.server_url.as_deref(), Some(SERVICE_URL));
        let status = orchestrator.status().expect("status");
        assert_eq!(status.step, SetupStep::Complete);
        assert_eq!(status.server_url.as_deref(), Some(SERVICE_URL));
    }

    #[test]
    fn deploy_failure_is_fatal_and_keeps_deploying_step() {
        let transport = ScriptedTransport::new();
        transport.respond(HttpMethod::Post, KNATIVE, 503, "backend unavailable");
        script_success(&transport);
        let mut orchestrator = orchestrator(&transport, Some(state_at(SetupStep::Deploying)));

        let err = orchestrator.run_setup(None).expect_err("deploy should fail");
        assert!(matches!(err, SetupError::DeployFailed { .. }));
        assert!(err.is_retryable());
        assert!(transport.requests_to(HttpMethod::Put, KNATIVE).is_empty());
        let state = orchestrator.progress().load().expect("load").expect("state");
        assert_eq!(state.step, SetupStep::Deploying);
        assert!(orchestrator.into_parts().2.published.is_empty());
    }

    #[test]
    fn best_effort_failures_become_warnings() {
        let transport = ScriptedTransport::new();
        transport
            .respond(HttpMethod::Post, ENABLE, 403, "SERVICE_DISABLED")
            .respond(HttpMethod::Post, ENABLE, 200, "{}")
            .respond_json(HttpMethod::Get, SERVICE_STATE, 200, json!({ "state": "DISABLED" }))
            .respond(HttpMethod::Post, SET_IAM, 403, "iam denied");
        script_deploy(&transport);
        let mut orchestrator = orchestrator(&transport, Some(state_at(SetupStep::EnablingApis)));

        let result = orchestrator.run_setup(None).expect("setup");

        assert!(result.warnings.iter().any(|w| matches!(
            w,
            SetupWarning::ApiEnableFailed { api, .. } if api == "run.googleapis.com"
        )));
        assert!(
            result
                .warnings
                .iter()
                .any(|w| matches!(w, SetupWarning::ApiNotReady { .. }))
        );
        assert!(
            result
                .warnings
                .iter()
                .any(|w| matches!(w, SetupWarning::PublicAccessNotGranted { .. }))
        );
        assert_eq!(
            orchestrator.status().expect("status").step,
            SetupStep::Complete
        );
        // two APIs, polled twice each
        assert_eq!(transport.requests_to(HttpMethod::Get, SERVICE_STATE).len(), 4);
    }

    #[test]
    fn publisher_failure_does_not_fail_the_run() {
        let transport = ScriptedTransport::new();
        script_success(&transport);
        let mut orchestrator = orchestrator(&transport, Some(state_at(SetupStep::Deploying)));
        orchestrator.publisher.fail = true;

        let result = orchestrator.run_setup(None).expect("setup");
        assert!(matches!(
            result.warnings.as_slice(),
            [SetupWarning::PublishFailed { .. }]
        ));
    }

    #[test]
    fn completed_run_makes_no_calls() {
        let transport = ScriptedTransport::new();
        let mut state = state_at(SetupStep::Complete);
        state.server_url = Some(SERVICE_URL.to_string());
        let mut orchestrator = orchestrator(&transport, Some(state));

        let result = orchestrator.run_setup(None).expect("setup");
        assert_eq!(result.server_url.as_deref(), Some(SERVICE_URL));
        assert_eq!(result.generated_password, "persisted-password");
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn generated_identifiers_have_expected_shape() {
        let project_id = generate_project_id();
        assert!(project_id.len() <= 30);
        assert!(
            project_id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        );
        assert_ne!(generate_project_id(), project_id);
        assert_eq!(generate_password().len(), 32);
    }
}
