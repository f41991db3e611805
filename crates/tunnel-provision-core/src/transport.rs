use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub bearer: Option<String>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            bearer: None,
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, url)
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = RequestBody::Form(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            RequestBody::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn form_value(&self, key: &str) -> Option<&str> {
        match &self.body {
            RequestBody::Form(fields) => fields
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// One blocking request/response exchange.
pub trait HttpTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for &T {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).execute(request)
    }
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tunnel-provision/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| TransportError::Client(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
        };
        let mut builder = self.client.request(method, &request.url);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let url = request.url.clone();
        let map_error = |err: reqwest::Error| {
            if err.is_timeout() {
                TransportError::Timeout { url: url.clone() }
            } else {
                TransportError::Request {
                    url: url.clone(),
                    message: err.to_string(),
                }
            }
        };
        let response = builder.send().map_err(map_error)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(map_error)?;
        debug!(method = %request.method, url = %request.url, status, "http exchange");
        Ok(HttpResponse { status, body })
    }
}

/// In-memory transport answering from scripted routes and recording every
/// request it receives. A route matches on method plus a URL substring; the
/// longest matching substring wins. A route's last response repeats once its
/// queue is drained. Unmatched requests get a 404.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: RefCell<Vec<ScriptedRoute>>,
    requests: RefCell<Vec<HttpRequest>>,
}

#[derive(Debug)]
struct ScriptedRoute {
    method: HttpMethod,
    fragment: String,
    replies: VecDeque<Result<HttpResponse, TransportError>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(
        &self,
        method: HttpMethod,
        fragment: &str,
        status: u16,
        body: impl Into<String>,
    ) -> &Self {
        self.push(method, fragment, Ok(HttpResponse::new(status, body)))
    }

    pub fn respond_json(
        &self,
        method: HttpMethod,
        fragment: &str,
        status: u16,
        body: Value,
    ) -> &Self {
        self.respond(method, fragment, status, body.to_string())
    }

    pub fn fail(&self, method: HttpMethod, fragment: &str, message: &str) -> &Self {
        let error = TransportError::Request {
            url: fragment.to_string(),
            message: message.to_string(),
        };
        self.push(method, fragment, Err(error))
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.borrow().clone()
    }

    pub fn requests_to(&self, method: HttpMethod, fragment: &str) -> Vec<HttpRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|request| request.method == method && request.url.contains(fragment))
            .cloned()
            .collect()
    }

    fn push(
        &self,
        method: HttpMethod,
        fragment: &str,
        reply: Result<HttpResponse, TransportError>,
    ) -> &Self {
        let mut routes = self.routes.borrow_mut();
        if let Some(route) = routes
            .iter_mut()
            .find(|route| route.method == method && route.fragment == fragment)
        {
            route.replies.push_back(reply);
        } else {
            routes.push(ScriptedRoute {
                method,
                fragment: fragment.to_string(),
                replies: VecDeque::from([reply]),
            });
        }
        self
    }
}

impl HttpTransport for ScriptedTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.borrow_mut().push(request.clone());

        let mut routes = self.routes.borrow_mut();
        let route = routes
            .iter_mut()
            .filter(|route| {
                route.method == request.method && request.url.contains(&route.fragment)
            })
            .max_by_key(|route| route.fragment.len());
        let Some(route) = route else {
            return Ok(HttpResponse::new(404, "no scripted response"));
        };
        if route.replies.len() > 1 {
            route
                .replies
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::new(404, "no scripted response")))
        } else {
            route
                .replies
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(HttpResponse::new(404, "no scripted response")))
        }
    }
}
