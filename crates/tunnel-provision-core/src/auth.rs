//! PKCE authorization-code flow against Google's OAuth2 endpoints.
//!
//! The client is a public ("installed app") client: no secret is sent, the
//! code is bound to the verifier generated in [`AuthorizationFlow::begin_authorization`].

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::pkce::{CHALLENGE_METHOD, PkcePair};
use crate::store::{CredentialStore, ProgressStore, StoreError};
use crate::transport::{HttpRequest, HttpTransport};
use crate::types::{SetupStep, TokenRecord};

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_CLIENT_ID: &str =
    "292824132082-7a1h7ae29f4aepk6qng3296kdlnpqhea.apps.googleusercontent.com";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const EMAIL_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";

const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

impl OAuthClientConfig {
    pub fn google(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scopes: vec![CLOUD_PLATFORM_SCOPE.to_string(), EMAIL_SCOPE.to_string()],
        }
    }
}

impl Default for OAuthClientConfig {
    fn default() -> Self {
        Self::google(DEFAULT_CLIENT_ID)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authorization was denied: {0}")]
    AuthorizationDenied(String),
    #[error("no authorization code received")]
    AuthorizationMissingCode,
    #[error("no authorization is in progress")]
    NoPendingAuthorization,
    #[error("token exchange failed: {0}")]
    TokenExchangeFailed(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("stored token has no refresh token")]
    MissingRefreshToken,
    #[error("invalid authorization endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// State of one authorization attempt. Dropped once the exchange finishes.
#[derive(Debug)]
struct PkceExchange {
    code_verifier: String,
    return_address: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl TokenResponse {
    fn into_record(self, received_at: DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expiry: self
                .expires_in
                .and_then(Duration::try_seconds)
                .and_then(|lifetime| received_at.checked_add_signed(lifetime)),
            raw: self.extra,
        }
    }
}

pub struct AuthorizationFlow<T> {
    transport: T,
    config: OAuthClientConfig,
    pending: Option<PkceExchange>,
}

impl<T: HttpTransport> AuthorizationFlow<T> {
    pub fn new(transport: T, config: OAuthClientConfig) -> Self {
        Self {
            transport,
            config,
            pending: None,
        }
    }

    pub fn config(&self) -> &OAuthClientConfig {
        &self.config
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Starts an attempt and returns the URL the user must visit. Any earlier
    /// unfinished attempt is replaced.
    pub fn begin_authorization(&mut self, return_address: &str) -> Result<Url, AuthError> {
        let pkce = PkcePair::generate();
        let scope = self.config.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.config.auth_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", return_address),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", CHALLENGE_METHOD),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )?;
        self.pending = Some(PkceExchange {
            code_verifier: pkce.verifier,
            return_address: return_address.to_string(),
        });
        Ok(url)
    }

    /// Exchanges the code returned to the redirect address for a token,
    /// persists it and moves the setup state from `start` to `authenticated`.
    pub fn complete_authorization<C, P>(
        &mut self,
        code: Option<&str>,
        error: Option<&str>,
        credentials: &mut C,
        progress: &mut P,
    ) -> Result<TokenRecord, AuthError>
    where
        C: CredentialStore + ?Sized,
        P: ProgressStore + ?Sized,
    {
        let pending = self.pending.take();

        if let Some(error) = error {
            warn!(error, "identity provider denied authorization");
            return Err(AuthError::AuthorizationDenied(error.to_string()));
        }
        let code = code
            .filter(|code| !code.is_empty())
            .ok_or(AuthError::AuthorizationMissingCode)?;
        let pending = pending.ok_or(AuthError::NoPendingAuthorization)?;

        let request = HttpRequest::post(&self.config.token_url).form([
            ("client_id", self.config.client_id.as_str()),
            ("code", code),
            ("code_verifier", pending.code_verifier.as_str()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", pending.return_address.as_str()),
        ]);
        let token = self.request_token(&request)?;
        credentials.save(&token)?;

        let mut state = progress.load_or_default()?;
        if state.step == SetupStep::Start {
            state.advance_to(SetupStep::Authenticated);
            progress.save(&state)?;
        }
        info!(
            has_refresh_token = token.refresh_token.is_some(),
            "authorization completed"
        );
        Ok(token)
    }

    /// Trades the stored refresh token for a new access token. The refresh
    /// token is kept when the provider does not rotate it.
    pub fn refresh_access_token<C>(&self, credentials: &mut C) -> Result<TokenRecord, AuthError>
    where
        C: CredentialStore + ?Sized,
    {
        let current = credentials
            .load()?
            .filter(TokenRecord::is_usable)
            .ok_or(AuthError::NotAuthenticated)?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or(AuthError::MissingRefreshToken)?;

        let request = HttpRequest::post(&self.config.token_url).form([
            ("client_id", self.config.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ]);
        let mut refreshed = self.request_token(&request)?;
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        credentials.save(&refreshed)?;
        info!("access token refreshed");
        Ok(refreshed)
    }

    /// Returns the stored token, refreshing it first when it has expired and
    /// a refresh token is available.
    pub fn ensure_fresh_token<C>(
        &self,
        credentials: &mut C,
        now: DateTime<Utc>,
    ) -> Result<TokenRecord, AuthError>
    where
        C: CredentialStore + ?Sized,
    {
        let current = credentials
            .load()?
            .filter(TokenRecord::is_usable)
            .ok_or(AuthError::NotAuthenticated)?;
        if current.is_expired(now, Duration::seconds(EXPIRY_SKEW_SECS))
            && current.refresh_token.is_some()
        {
            return self.refresh_access_token(credentials);
        }
        Ok(current)
    }

    fn request_token(&self, request: &HttpRequest) -> Result<TokenRecord, AuthError> {
        let response = self
            .transport
            .execute(request)
            .map_err(|err| AuthError::TokenExchangeFailed(err.to_string()))?;
        if !response.is_success() {
            return Err(AuthError::TokenExchangeFailed(format!(
                "HTTP {}: {}",
                response.status, response.body
            )));
        }
        let parsed: TokenResponse = serde_json::from_str(&response.body).map_err(|err| {
            AuthError::TokenExchangeFailed(format!("unreadable token response: {err}"))
        })?;
        if parsed.access_token.is_empty() {
            return Err(AuthError::TokenExchangeFailed(
                "response carried no access token".to_string(),
            ));
        }
        Ok(parsed.into_record(Utc::now()))
    }
}

/// `code` and `error` as delivered to the redirect address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
}

/// Accepts a full redirected URL, a bare query string or a bare code.
pub fn parse_callback(input: &str) -> CallbackParams {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return CallbackParams::default();
    }

    let url = Url::parse(trimmed).ok().or_else(|| {
        if !trimmed.contains('=') {
            return None;
        }
        let query = trimmed.trim_start_matches('?');
        Url::parse(&format!("http://localhost/?{query}")).ok()
    });
    let Some(url) = url else {
        return CallbackParams {
            code: Some(trimmed.to_string()),
            error: None,
        };
    };

    let mut params = CallbackParams::default();
    for (key, value) in url.query_pairs() {
        if value.is_empty() {
            continue;
        }
        match key.as_ref() {
            "code" => params.code = Some(value.into_owned()),
            "error" => params.error = Some(value.into_owned()),
            _ => {}
        }
    }
    params
}
