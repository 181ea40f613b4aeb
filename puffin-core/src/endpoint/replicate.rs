//! Replicate streaming predictions.
//!
//! A completion is a two-step exchange: create a prediction with
//! `"stream": true`, then read server-sent events from the `urls.stream`
//! address the prediction response carries. `output` events are fragments,
//! `error` ends the stream with a failure, `done` ends it normally.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::sse::{SseDecoder, SseEvent};
use super::{CompletionEndpoint, CompletionRequest, FragmentStream};
use crate::config::EndpointConfig;
use crate::error::DispatchError;

const PROVIDER: &str = "replicate";

/// Replicate-hosted model, e.g. `snowflake/snowflake-arctic-instruct`.
pub struct ReplicateEndpoint {
    client: Client,
    base_url: String,
    model: String,
    api_token: String,
    timeout_secs: u64,
    label: String,
}

impl ReplicateEndpoint {
    pub fn new(config: &EndpointConfig, api_token: String) -> Result<Self, DispatchError> {
        if !config.model.contains('/') {
            return Err(DispatchError::ApiRequest {
                message: format!(
                    "Replicate model must be '<owner>/<name>', got '{}'",
                    config.model
                ),
            });
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DispatchError::ApiRequest {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_token,
            timeout_secs: config.timeout_secs,
            label: format!("{PROVIDER}:{}", config.model),
        })
    }

    fn predictions_url(&self) -> String {
        format!("{}/models/{}/predictions", self.base_url, self.model)
    }

    /// JSON body for the create-prediction call.
    fn request_body(request: &CompletionRequest) -> Value {
        let mut input = json!({
            "prompt": request.prompt,
            "temperature": request.temperature,
            "top_p": request.top_p,
        });
        if let Some(template) = &request.prompt_template {
            input["prompt_template"] = json!(template);
        }
        json!({ "stream": true, "input": input })
    }

    /// Pull `urls.stream` out of a prediction response.
    fn stream_url(body: &Value) -> Result<String, DispatchError> {
        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            return Err(DispatchError::ApiRequest {
                message: format!("Prediction failed: {}", error_text(error)),
            });
        }
        body.get("urls")
            .and_then(|u| u.get("stream"))
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .ok_or_else(|| DispatchError::ResponseParse {
                message: "Prediction response has no urls.stream".to_string(),
            })
    }

    /// Map an HTTP status code to the appropriate DispatchError.
    fn map_http_error(status: reqwest::StatusCode, retry_after: Option<u64>, body: &str) -> DispatchError {
        let detail = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("detail").map(error_text))
            .unwrap_or_else(|| body.to_string());
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Authentication failed ({})", status);
                DispatchError::AuthFailed {
                    provider: PROVIDER.to_string(),
                }
            }
            429 => DispatchError::RateLimited {
                retry_after_secs: retry_after.unwrap_or(5),
            },
            s if s >= 500 => DispatchError::ApiRequest {
                message: format!("Server error ({}): {}", status, detail),
            },
            _ => DispatchError::ApiRequest {
                message: format!("HTTP {}: {}", status, detail),
            },
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> DispatchError {
        if e.is_timeout() {
            DispatchError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else {
            DispatchError::ApiRequest {
                message: format!("Request failed: {}", e),
            }
        }
    }

    async fn create_prediction(&self, request: &CompletionRequest) -> Result<String, DispatchError> {
        let url = self.predictions_url();
        debug!(url = %url, model = %self.model, "Creating Replicate prediction");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&Self::request_body(request))
            .timeout(Duration::from_secs(self.timeout_secs))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.text().await.map_err(|e| DispatchError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;
        if !status.is_success() {
            return Err(Self::map_http_error(status, retry_after, &body));
        }

        let json: Value = serde_json::from_str(&body).map_err(|e| DispatchError::ResponseParse {
            message: format!("Invalid JSON: {}", e),
        })?;
        if let Some(id) = json.get("id").and_then(|i| i.as_str()) {
            info!(prediction_id = id, "Replicate prediction created");
        }
        Self::stream_url(&json)
    }
}

#[async_trait]
impl CompletionEndpoint for ReplicateEndpoint {
    async fn stream(&self, request: CompletionRequest) -> Result<FragmentStream, DispatchError> {
        let stream_url = self.create_prediction(&request).await?;

        let response = self
            .client
            .get(&stream_url)
            .bearer_auth(&self.api_token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_http_error(status, None, &body));
        }

        Ok(fragments_from_sse(Box::pin(response.bytes_stream())))
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// What a single Replicate event means for the fragment stream.
#[derive(Debug)]
enum Step {
    Fragment(String),
    Done,
    Failed(DispatchError),
    Skip,
}

fn interpret(event: SseEvent) -> Step {
    match event.event.as_str() {
        "output" => Step::Fragment(event.data),
        "error" => {
            let message = serde_json::from_str::<Value>(&event.data)
                .map(|v| error_text(&v))
                .unwrap_or(event.data);
            Step::Failed(DispatchError::Streaming { message })
        }
        "done" => {
            let reason = serde_json::from_str::<Value>(&event.data)
                .ok()
                .and_then(|v| v.get("reason").and_then(|r| r.as_str()).map(str::to_string));
            match reason.as_deref() {
                Some("canceled") => Step::Failed(DispatchError::Streaming {
                    message: "Prediction was canceled".to_string(),
                }),
                _ => Step::Done,
            }
        }
        other => {
            debug!(event = other, "Ignoring Replicate event");
            Step::Skip
        }
    }
}

/// Human-readable text for an error payload that may be a string or an object.
fn error_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("detail")
            .or_else(|| map.get("message"))
            .map(error_text)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

struct SseState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    eof: bool,
    finished: bool,
}

/// Turn a raw byte stream of Replicate server-sent events into fragments.
///
/// The stream is lazy: bytes are only pulled when the consumer asks for the
/// next fragment.
pub(crate) fn fragments_from_sse<S, B, E>(bytes: S) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let state = SseState {
        bytes,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        eof: false,
        finished: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }
            if let Some(event) = st.pending.pop_front() {
                match interpret(event) {
                    Step::Fragment(text) => return Some((Ok(text), st)),
                    Step::Done => {
                        st.finished = true;
                        return None;
                    }
                    Step::Failed(err) => {
                        warn!(error = %err, "Replicate stream reported an error");
                        st.finished = true;
                        return Some((Err(err), st));
                    }
                    Step::Skip => continue,
                }
            }
            if st.eof {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.push(chunk.as_ref());
                    st.pending.extend(events);
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((
                        Err(DispatchError::Streaming {
                            message: format!("Failed to read streaming chunk: {}", e),
                        }),
                        st,
                    ));
                }
                None => {
                    st.eof = true;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn config() -> EndpointConfig {
        EndpointConfig::default()
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, String>> + Send + Unpin + 'static {
        let owned: Vec<Result<Vec<u8>, String>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        futures::stream::iter(owned)
    }

    fn collect(stream: FragmentStream) -> Vec<Result<String, String>> {
        block_on(stream.map(|r| r.map_err(|e| e.to_string())).collect())
    }

    #[test]
    fn test_predictions_url() {
        let endpoint = ReplicateEndpoint::new(&config(), "r8_token".into()).unwrap();
        assert_eq!(
            endpoint.predictions_url(),
            "https://api.replicate.com/v1/models/snowflake/snowflake-arctic-instruct/predictions"
        );
        assert_eq!(endpoint.name(), "replicate:snowflake/snowflake-arctic-instruct");
    }

    #[test]
    fn test_model_must_have_owner() {
        let bad = EndpointConfig {
            model: "arctic".into(),
            ..config()
        };
        assert!(ReplicateEndpoint::new(&bad, "t".into()).is_err());
    }

    #[test]
    fn test_request_body() {
        let request = CompletionRequest {
            prompt: "p".into(),
            temperature: 0.3,
            top_p: 0.9,
            prompt_template: Some("{prompt}".into()),
        };
        let body = ReplicateEndpoint::request_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["input"]["prompt"], "p");
        assert_eq!(body["input"]["temperature"], 0.3);
        assert_eq!(body["input"]["top_p"], 0.9);
        assert_eq!(body["input"]["prompt_template"], "{prompt}");
    }

    #[test]
    fn test_stream_url_extraction() {
        let body = json!({"id": "abc", "urls": {"stream": "https://stream.replicate.com/v1/files/abc"}});
        assert_eq!(
            ReplicateEndpoint::stream_url(&body).unwrap(),
            "https://stream.replicate.com/v1/files/abc"
        );
        assert!(matches!(
            ReplicateEndpoint::stream_url(&json!({"urls": {}})).unwrap_err(),
            DispatchError::ResponseParse { .. }
        ));
        assert!(matches!(
            ReplicateEndpoint::stream_url(&json!({"error": "boom", "urls": {"stream": "x"}})).unwrap_err(),
            DispatchError::ApiRequest { .. }
        ));
    }

    #[test]
    fn test_http_error_mapping() {
        let err = ReplicateEndpoint::map_http_error(
            reqwest::StatusCode::UNAUTHORIZED,
            None,
            r#"{"detail": "Invalid token."}"#,
        );
        assert!(matches!(err, DispatchError::AuthFailed { .. }));

        let err = ReplicateEndpoint::map_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, Some(12), "");
        assert!(matches!(err, DispatchError::RateLimited { retry_after_secs: 12 }));

        let err = ReplicateEndpoint::map_http_error(
            reqwest::StatusCode::UNPROCESSABLE_ENTITY,
            None,
            r#"{"detail": "prompt is required"}"#,
        );
        assert_eq!(err.to_string(), "API request failed: HTTP 422 Unprocessable Entity: prompt is required");

        let err = ReplicateEndpoint::map_http_error(reqwest::StatusCode::BAD_GATEWAY, None, "oops");
        assert!(err.to_string().contains("Server error"));
    }

    #[test]
    fn test_fragments_in_order_until_done() {
        let stream = fragments_from_sse(chunks(&[
            "event: output\ndata: Hel\n\n",
            "event: output\nda",
            "ta: lo\n\nevent: done\ndata: {}\n\n",
            "event: output\ndata: ignored\n\n",
        ]));
        assert_eq!(collect(stream), vec![Ok("Hel".to_string()), Ok("lo".to_string())]);
    }

    #[test]
    fn test_error_event_fails_stream() {
        let stream = fragments_from_sse(chunks(&[
            "event: output\ndata: partial\n\n",
            "event: error\ndata: {\"detail\": \"model crashed\"}\n\n",
        ]));
        assert_eq!(
            collect(stream),
            vec![
                Ok("partial".to_string()),
                Err("Streaming error: model crashed".to_string())
            ]
        );
    }

    #[test]
    fn test_canceled_prediction_fails_stream() {
        let stream = fragments_from_sse(chunks(&["event: done\ndata: {\"reason\": \"canceled\"}\n\n"]));
        assert_eq!(
            collect(stream),
            vec![Err("Streaming error: Prediction was canceled".to_string())]
        );
    }

    #[test]
    fn test_stream_close_without_done() {
        let stream = fragments_from_sse(chunks(&["event: output\ndata: tail"]));
        assert_eq!(collect(stream), vec![Ok("tail".to_string())]);
    }

    #[test]
    fn test_transport_error_ends_stream() {
        let items: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"event: output\ndata: a\n\n".to_vec()),
            Err("connection reset".to_string()),
            Ok(b"event: output\ndata: b\n\n".to_vec()),
        ];
        let stream = fragments_from_sse(futures::stream::iter(items));
        assert_eq!(
            collect(stream),
            vec![
                Ok("a".to_string()),
                Err("Streaming error: Failed to read streaming chunk: connection reset".to_string())
            ]
        );
    }
}
