use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use flowrun_core::config::HttpClientConfig;
use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::HttpClient;
use flowrun_core::types::{HttpRequest, HttpResponse};

/// `HttpClient` backed by reqwest.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl ReqwestHttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FlowError::Http(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            timeout_secs: config.timeout_secs,
        })
    }

    fn build(&self, request: &HttpRequest) -> Result<reqwest::RequestBuilder> {
        let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| FlowError::Http(format!("invalid HTTP method: {}", request.method)))?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }
}

impl HttpClient for ReqwestHttpClient {
    fn send(&self, request: HttpRequest, cancel: CancellationToken) -> BoxFuture<'_, Result<HttpResponse>> {
        Box::pin(async move {
            let builder = self.build(&request)?;
            debug!(method = %request.method, url = %request.url, "Sending HTTP request");

            let exchange = async {
                let resp = builder.send().await.map_err(|e| {
                    if e.is_timeout() {
                        FlowError::Timeout {
                            what: format!("HTTP {}", request.url),
                            timeout_secs: self.timeout_secs,
                        }
                    } else {
                        FlowError::Http(e.to_string())
                    }
                })?;

                let status = resp.status();
                let headers: BTreeMap<String, String> = resp
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                    .collect();
                let body = resp.text().await.map_err(|e| FlowError::Http(e.to_string()))?;

                Ok::<_, FlowError>(HttpResponse {
                    status: status.as_u16(),
                    reason: status.canonical_reason().unwrap_or("").to_string(),
                    headers,
                    body,
                })
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FlowError::Cancelled),
                result = exchange => result,
            }
        })
    }
}
