pub mod auth;
pub mod cloud;
pub mod engine;
pub mod pkce;
pub mod publish;
pub mod service;
pub mod store;
pub mod transport;
pub mod types;

pub use auth::{AuthError, AuthorizationFlow, CallbackParams, OAuthClientConfig, parse_callback};
pub use cloud::{ApiFailure, ApiOutcome, CloudApiClient, CloudEndpoints, CloudError};
pub use engine::{SetupError, SetupOptions, SetupOrchestrator};
pub use publish::{ConfigPublisher, NoopPublisher, PublishError, SupervisorPublisher};
pub use service::ServiceSpec;
pub use store::{
    CredentialStore, FileCredentialStore, FileProgressStore, InMemoryCredentialStore,
    InMemoryProgressStore, ProgressStore, StoreError, setup_status,
};
pub use transport::{
    HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, ScriptedTransport,
    TransportError,
};
pub use types::{
    BillingAccount, ConnectionDetails, ProvisioningResult, SetupState, SetupStatus, SetupStep,
    SetupWarning, TokenRecord,
};
