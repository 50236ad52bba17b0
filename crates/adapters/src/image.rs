use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::warn;

use bookgen_core::GenerationError;

use crate::error::transport_error;
use crate::llm::RequestDispatcher;
use crate::payload::{ImageRequest, ImageResponse};
use crate::retry::generate_with_retry;

const IMAGE_PATH: &str = "images/generations";
const BASE64_FORMAT: &str = "b64_json";

impl RequestDispatcher {
    /// Generate one image and return its encoded bytes.
    ///
    /// Asks for base64 output first; when the service rejects that
    /// parameter the request is repeated once without it.
    pub async fn generate_image(&self, prompt: &str) -> Result<Vec<u8>, GenerationError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GenerationError::Other("image prompt is empty".to_string()));
        }
        generate_with_retry(&self.retry, self.presenter.as_ref(), move |_| {
            self.image_once(prompt)
        })
        .await
    }

    async fn image_once(&self, prompt: &str) -> Result<Vec<u8>, GenerationError> {
        let mut request = ImageRequest {
            model: &self.image_model,
            prompt,
            size: &self.image_size,
            n: 1,
            response_format: Some(BASE64_FORMAT),
        };

        let response = self.post(IMAGE_PATH, &request).await?;
        let response = match self.check_status(response).await {
            Ok(response) => response,
            Err(GenerationError::Other(message)) if rejects_response_format(&message) => {
                warn!("image endpoint rejected response_format, retrying without it");
                request.response_format = None;
                let response = self.post(IMAGE_PATH, &request).await?;
                self.check_status(response).await?
            }
            Err(err) => return Err(err),
        };

        let body = response.text().await.map_err(transport_error)?;
        let parsed: ImageResponse = serde_json::from_str(&body).map_err(|err| {
            GenerationError::MalformedUpstreamResponse(format!("invalid image response: {err}"))
        })?;
        let datum = parsed.data.into_iter().next().ok_or_else(|| {
            GenerationError::MalformedUpstreamResponse("image response has no data".to_string())
        })?;

        if let Some(encoded) = datum.b64_json {
            return decode_image(&encoded);
        }
        match datum.url {
            Some(url) => {
                let response = self.client.get(&url).send().await.map_err(transport_error)?;
                let response = self.check_status(response).await?;
                let bytes = response.bytes().await.map_err(transport_error)?;
                Ok(bytes.to_vec())
            }
            None => Err(GenerationError::MalformedUpstreamResponse(
                "image response has neither base64 data nor a url".to_string(),
            )),
        }
    }
}

fn rejects_response_format(message: &str) -> bool {
    message.to_ascii_lowercase().contains("response_format")
}

pub(crate) fn decode_image(encoded: &str) -> Result<Vec<u8>, GenerationError> {
    STANDARD.decode(encoded.trim()).map_err(|err| {
        GenerationError::MalformedUpstreamResponse(format!("image is not valid base64: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{json_reply, CannedServer};
    use bookgen_core::RetryPolicy;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn decodes_base64_payload() {
        assert_eq!(decode_image(" iVBORw0= \n").unwrap(), vec![0x89, 0x50, 0x4e, 0x47, 0x0d]);
        assert!(matches!(
            decode_image("not base64!"),
            Err(GenerationError::MalformedUpstreamResponse(_))
        ));
    }

    #[test]
    fn recognises_rejected_encoding_parameter() {
        assert!(rejects_response_format(
            "Unknown parameter: 'response_format'."
        ));
        assert!(!rejects_response_format("Billing hard limit reached"));
    }

    #[tokio::test]
    async fn rejected_encoding_parameter_is_dropped_once() {
        let server = CannedServer::start(vec![
            json_reply(
                "400 Bad Request",
                &json!({"error": {"message": "Unknown parameter: 'response_format'.", "type": "invalid_request_error"}}),
            ),
            json_reply("200 OK", &json!({"data": [{"b64_json": "aGVsbG8="}]})),
        ])
        .await;
        let dispatcher = RequestDispatcher::new(
            &server.base_url,
            Some("sk-local".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
        .with_retry_policy(RetryPolicy::new(1, Duration::from_millis(1)));

        let bytes = dispatcher.generate_image("a lighthouse at dusk").await.unwrap();
        assert_eq!(bytes, b"hello");

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|request| request.path == "/v1/images/generations"));
        assert_eq!(requests[0].json()["response_format"], "b64_json");
        assert!(requests[1].json().get("response_format").is_none());
        assert_eq!(requests[1].json()["prompt"], "a lighthouse at dusk");
        assert_eq!(requests[1].json()["n"], 1);
    }
}
