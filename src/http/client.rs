use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::USER_AGENT;
use reqwest::Client;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::error::{Error, NetworkError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse, Method};

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
    timeout_duration: Duration,
    user_agent: String,
    default_headers: Vec<(String, String)>,
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl ReqwestClient {
    pub fn new() -> Result<Self> {
        Self::from_config(&ServiceConfig::default())
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let timeout_duration = Duration::from_secs(config.timeout_seconds);
        let client = Client::builder()
            .timeout(timeout_duration)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .gzip(true)
            .build()?;

        let mut default_headers = Vec::new();
        if let Some(token) = &config.auth_token {
            default_headers.push(("Authorization".to_string(), format!("GoogleLogin auth={}", token)));
        }

        Ok(Self {
            client,
            timeout_duration,
            user_agent: config.user_agent.clone(),
            default_headers,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_duration = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, reqwest::Error> {
        let mut builder = self
            .client
            .request(request.method.into(), request.url)
            .header(USER_AGENT, &self.user_agent);
        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse { status, headers, body })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let url = request.url.to_string();
        debug!("{} {}", request.method, url);

        let response = timeout(self.timeout_duration, self.send(request))
            .await
            .map_err(|_| Error::Network {
                url: url.clone(),
                kind: NetworkError::TimedOut,
            })?
            .map_err(|e| {
                let mut err = Error::from(e);
                if let Error::Network { url: missing, .. } = &mut err {
                    if missing.is_empty() {
                        *missing = url.clone();
                    }
                }
                warn!("Request to {} failed: {}", url, err);
                err
            })?;

        debug!("Received HTTP {} ({} bytes) from {}", response.status, response.body.len(), url);
        Ok(response)
    }
}
