use serde_json::{Value, json};
use tracing::{debug, info};

use crate::cloud::ApiFailure;
use crate::transport::{HttpRequest, HttpTransport, TransportError};
use crate::types::ConnectionDetails;

pub const SUPERVISOR_URL: &str = "http://supervisor";
pub const DEFAULT_LOCAL_PORT: u16 = 8123;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("supervisor rejected the options update: {0}")]
    OptionsRejected(ApiFailure),
    #[error("supervisor did not restart the add-on: {0}")]
    RestartFailed(ApiFailure),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Receives the final connection details once provisioning completes.
pub trait ConfigPublisher {
    fn publish(&mut self, details: &ConnectionDetails) -> Result<(), PublishError>;
}

impl<P: ConfigPublisher + ?Sized> ConfigPublisher for &mut P {
    fn publish(&mut self, details: &ConnectionDetails) -> Result<(), PublishError> {
        (**self).publish(details)
    }
}

#[derive(Debug, Default)]
pub struct NoopPublisher;

impl ConfigPublisher for NoopPublisher {
    fn publish(&mut self, _details: &ConnectionDetails) -> Result<(), PublishError> {
        debug!("no supervisor configured; skipping add-on configuration");
        Ok(())
    }
}

/// Add-on options written alongside the connection details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonDefaults {
    pub local_port: u16,
    pub keepalive: String,
    pub log_level: String,
}

impl Default for AddonDefaults {
    fn default() -> Self {
        Self {
            local_port: DEFAULT_LOCAL_PORT,
            keepalive: "25s".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Pushes the add-on options to the Home Assistant supervisor and restarts
/// the add-on so they take effect.
pub struct SupervisorPublisher<T> {
    transport: T,
    base_url: String,
    token: String,
    defaults: AddonDefaults,
}

impl<T: HttpTransport> SupervisorPublisher<T> {
    pub fn new(transport: T, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            token: token.into(),
            defaults: AddonDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: AddonDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn options(&self, details: &ConnectionDetails) -> Value {
        json!({
            "server_url": details.server_url,
            "auth_user": details.auth_user,
            "auth_pass": details.auth_pass,
            "google_project_id": details.project_id,
            "local_port": self.defaults.local_port,
            "keepalive": self.defaults.keepalive,
            "log_level": self.defaults.log_level,
            "google_secure_devices_pin": ""
        })
    }

    fn post(&self, path: &str, body: Option<Value>) -> Result<Option<ApiFailure>, PublishError> {
        let mut request =
            HttpRequest::post(format!("{}{path}", self.base_url)).bearer(self.token.as_str());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.transport.execute(&request)?;
        if response.is_success() {
            Ok(None)
        } else {
            Ok(Some(ApiFailure {
                status: Some(response.status),
                body: response.body,
            }))
        }
    }
}

impl<T: HttpTransport> ConfigPublisher for SupervisorPublisher<T> {
    fn publish(&mut self, details: &ConnectionDetails) -> Result<(), PublishError> {
        let options = json!({ "options": self.options(details) });
        if let Some(failure) = self.post("/addons/self/options", Some(options))? {
            return Err(PublishError::OptionsRejected(failure));
        }
        if let Some(failure) = self.post("/addons/self/restart", None)? {
            return Err(PublishError::RestartFailed(failure));
        }
        info!("add-on configuration updated; restart requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpMethod, ScriptedTransport};

    fn details() -> ConnectionDetails {
        ConnectionDetails {
            server_url: "https://ha-tunnel-xyz.a.run.app".to_string(),
            auth_user: "hauser".to_string(),
            auth_pass: "pw".to_string(),
            project_id: "ha-tunnel-0a1b2c3d4e5f".to_string(),
        }
    }

    #[test]
    fn publishes_options_then_restarts() {
        let transport = ScriptedTransport::new();
        transport
            .respond(HttpMethod::Post, "/addons/self/options", 200, "{}")
            .respond(HttpMethod::Post, "/addons/self/restart", 200, "{}");
        let mut publisher = SupervisorPublisher::new(&transport, SUPERVISOR_URL, "sup-token");
        publisher.publish(&details()).expect("publish");

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url, "http://supervisor/addons/self/options");
        assert_eq!(requests[0].bearer.as_deref(), Some("sup-token"));
        let options = &requests[0].json_body().expect("options body")["options"];
        assert_eq!(options["server_url"], "https://ha-tunnel-xyz.a.run.app");
        assert_eq!(options["auth_user"], "hauser");
        assert_eq!(options["google_project_id"], "ha-tunnel-0a1b2c3d4e5f");
        assert_eq!(options["local_port"], 8123);
        assert_eq!(options["keepalive"], "25s");
        assert_eq!(requests[1].url, "http://supervisor/addons/self/restart");
    }

    #[test]
    fn rejected_options_skip_restart() {
        let transport = ScriptedTransport::new();
        transport.respond(HttpMethod::Post, "/addons/self/options", 400, "invalid");
        let mut publisher = SupervisorPublisher::new(&transport, SUPERVISOR_URL, "sup-token");

        let result = publisher.publish(&details());
        assert!(matches!(result, Err(PublishError::OptionsRejected(_))));
        assert!(
            transport
                .requests_to(HttpMethod::Post, "/addons/self/restart")
                .is_empty()
        );
    }
}
