use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::Value;

use bookgen_core::{
    collect_stream, CompletionService, EndpointChoice, GenerationError, GenerationRequest,
    NullPresenter, RetryPolicy, SamplingParams, Settings, SharedPresenter, StreamDelta,
};

use crate::base_url::{endpoint_url, normalize_base_url};
use crate::error::{transport_error, AdapterError};
use crate::payload::{extract_text, ChatRequest, ResponsesRequest};
use crate::rate_limit::{classify_failure, RateLimitSnapshot};
use crate::retry::generate_with_retry;

/// Chat model used for the credential probe.
pub const VALIDATION_MODEL: &str = "gpt-4o-mini";

/// Sends completion requests to the endpoint each model requires.
///
/// Calls without a credential fail before touching the network. Every
/// response, successful or not, refreshes the rate-limit snapshot.
pub struct RequestDispatcher {
    pub(crate) client: Client,
    base_url: String,
    credential: Option<String>,
    pub(crate) retry: RetryPolicy,
    pub(crate) presenter: SharedPresenter,
    rate_limit: Mutex<RateLimitSnapshot>,
    pub(crate) image_model: String,
    pub(crate) image_size: String,
}

impl RequestDispatcher {
    pub fn new(
        base_url: &str,
        credential: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            credential: credential
                .map(|secret| secret.trim().to_string())
                .filter(|secret| !secret.is_empty()),
            retry: RetryPolicy::default(),
            presenter: Arc::new(NullPresenter),
            rate_limit: Mutex::new(RateLimitSnapshot::default()),
            image_model: "gpt-image-1".to_string(),
            image_size: "1024x1024".to_string(),
        })
    }

    pub fn from_settings(
        settings: &Settings,
        credential: Option<String>,
    ) -> Result<Self, AdapterError> {
        if settings.model.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "model must not be empty".to_string(),
            ));
        }
        let mut dispatcher = Self::new(&settings.base_url, credential, settings.request_timeout())?
            .with_retry_policy(settings.retry_policy());
        dispatcher.image_model = settings.image_model.trim().to_string();
        dispatcher.image_size = settings.image_size.trim().to_string();
        Ok(dispatcher)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_presenter(mut self, presenter: SharedPresenter) -> Self {
        self.presenter = presenter;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_credential(&self) -> bool {
        self.credential.is_some()
    }

    /// Copy of the most recently observed quota state.
    pub fn rate_limit(&self) -> RateLimitSnapshot {
        self.rate_limit
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Non-streaming completion on the endpoint the model requires.
    pub async fn send(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.send_with(request, request.endpoint()).await
    }

    /// Non-streaming completion on an explicit endpoint, with retries.
    pub async fn send_with(
        &self,
        request: &GenerationRequest,
        endpoint: EndpointChoice,
    ) -> Result<String, GenerationError> {
        generate_with_retry(&self.retry, self.presenter.as_ref(), move |_| {
            self.send_once(request, endpoint)
        })
        .await
    }

    /// Streaming completion with retries.
    ///
    /// Models that never stream get one non-streaming call whose text is
    /// reported as a single token followed by the final delta. A retried
    /// stream reports its tokens again from the start.
    pub async fn send_streaming(
        &self,
        request: &GenerationRequest,
        on_delta: &mut (dyn FnMut(&StreamDelta) + Send),
    ) -> Result<String, GenerationError> {
        if !request.capabilities().streams() {
            let text = self.send(request).await?;
            on_delta(&StreamDelta {
                token: text.clone(),
                aggregate: text.clone(),
                is_final: false,
            });
            on_delta(&StreamDelta {
                token: String::new(),
                aggregate: text.clone(),
                is_final: true,
            });
            return Ok(text);
        }

        let on_delta = futures::lock::Mutex::new(on_delta);
        let on_delta = &on_delta;
        generate_with_retry(&self.retry, self.presenter.as_ref(), move |_| async move {
            let mut callback = on_delta.lock().await;
            self.stream_once(request, &mut **callback).await
        })
        .await
    }

    /// One minimal chat call; no retries.
    pub async fn validate_credential(&self) -> Result<(), GenerationError> {
        let probe = GenerationRequest::new(VALIDATION_MODEL, "", "ping").with_sampling(
            SamplingParams {
                temperature: 0.0,
                max_output_tokens: 1,
                seed: None,
            },
        );
        let body = ChatRequest::new(&probe, false);
        let response = self
            .post(EndpointChoice::ChatStyle.path(), &body)
            .await?;
        self.check_status(response).await.map(|_| ())
    }

    async fn send_once(
        &self,
        request: &GenerationRequest,
        endpoint: EndpointChoice,
    ) -> Result<String, GenerationError> {
        let response = match endpoint {
            EndpointChoice::ChatStyle => {
                self.post(endpoint.path(), &ChatRequest::new(request, false))
                    .await?
            }
            EndpointChoice::ResponseStyle => {
                self.post(endpoint.path(), &ResponsesRequest::new(request))
                    .await?
            }
        };
        let response = self.check_status(response).await?;
        let body = response.text().await.map_err(transport_error)?;
        let value: Value = serde_json::from_str(&body).map_err(|err| {
            GenerationError::MalformedUpstreamResponse(format!("invalid JSON body: {err}"))
        })?;
        extract_text(&value).ok_or_else(|| {
            GenerationError::MalformedUpstreamResponse(format!(
                "no completion text in {endpoint} response"
            ))
        })
    }

    async fn stream_once(
        &self,
        request: &GenerationRequest,
        on_delta: &mut (dyn FnMut(&StreamDelta) + Send),
    ) -> Result<String, GenerationError> {
        let body = ChatRequest::new(request, true);
        let response = self
            .post(EndpointChoice::ChatStyle.path(), &body)
            .await?;
        let response = self.check_status(response).await?;
        let chunks = response.bytes_stream().map_err(transport_error);
        collect_stream(chunks, on_delta).await
    }

    pub(crate) async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, GenerationError> {
        let credential = self
            .credential
            .as_deref()
            .ok_or(GenerationError::CredentialMissing)?;
        let url = endpoint_url(&self.base_url, path);
        debug!("POST {url}");
        let response = self
            .client
            .post(&url)
            .bearer_auth(credential)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        self.observe(response.headers());
        Ok(response)
    }

    /// Pass successful responses through; classify the rest.
    pub(crate) async fn check_status(&self, response: Response) -> Result<Response, GenerationError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        let error = classify_failure(status, &headers, &body);
        warn!("request failed with status {status}: {error}");
        Err(error)
    }

    fn observe(&self, headers: &HeaderMap) {
        if let Ok(mut snapshot) = self.rate_limit.lock() {
            snapshot.update(headers);
            if snapshot.is_exhausted() {
                warn!(
                    "rate limit exhausted; requests reset in {:?}, tokens in {:?}",
                    snapshot.reset_requests, snapshot.reset_tokens
                );
            }
        }
    }
}

#[async_trait]
impl CompletionService for RequestDispatcher {
    async fn complete(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.send(request).await
    }

    async fn complete_streaming(
        &self,
        request: &GenerationRequest,
        on_delta: &mut (dyn for<'d> FnMut(&'d StreamDelta) + Send),
    ) -> Result<String, GenerationError> {
        self.send_streaming(request, on_delta).await
    }
}
