//! `POST /api/chat`: forwards a conversation to an OpenAI-compatible
//! chat-completions API and returns the assistant's reply

use crate::config::ChatConfig;
use crate::error::{full_body, simple_json_error, ProxyBody};
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

pub const CHAT_PATH: &str = "/api/chat";

/// Largest request body accepted on the chat endpoint
pub const MAX_CHAT_BODY_BYTES: usize = 64 * 1024;

const GENERIC_FAILURE: &str = "Failed to get a response from the assistant";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("No API key configured for the completion API")]
    MissingApiKey,
    #[error("Completion request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Completion API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Completion API returned no message")]
    EmptyResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A validated chat request
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Jurisdiction the user is enrolling in, e.g. `CA`
    pub state: Option<String>,
}

impl ChatRequest {
    /// Validate a raw body; the error string is shown to the client
    pub fn parse(body: &[u8]) -> Result<Self, &'static str> {
        let value: Value = serde_json::from_slice(body).map_err(|_| "Invalid JSON body")?;

        let messages = value
            .get("messages")
            .and_then(Value::as_array)
            .ok_or("Messages array is required")?;
        if messages.is_empty() {
            return Err("Messages array is required");
        }

        let messages = messages
            .iter()
            .map(|m| {
                let role = m.get("role").and_then(Value::as_str);
                let content = m.get("content").and_then(Value::as_str);
                match (role, content) {
                    (Some(role), Some(content)) => Ok(ChatMessage::new(role, content)),
                    _ => Err("Each message needs a string role and content"),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let state = value
            .get("state")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        Ok(Self { messages, state })
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: Option<CompletionMessage>,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

pub struct ChatClient {
    config: ChatConfig,
    http_client: reqwest::Client,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, http_client })
    }

    /// System prompt, with the jurisdiction appended when known
    pub fn system_prompt(&self, state: Option<&str>) -> String {
        match state {
            Some(state) => format!(
                "{}\n\nThe user is enrolling in the state of {}. Prefer answers that apply there.",
                self.config.system_prompt, state
            ),
            None => self.config.system_prompt.clone(),
        }
    }

    /// Send the conversation and return the assistant's reply
    pub async fn complete(&self, request: &ChatRequest) -> Result<String, ChatError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(ChatError::MissingApiKey)?;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::new("system", self.system_prompt(request.state.as_deref())));
        messages.extend(request.messages.iter().cloned());

        let payload = CompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .http_client
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let completion: CompletionResponse = response.json().await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or(ChatError::EmptyResponse)
    }

    /// Handle a request on the chat path
    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.method() != Method::POST {
            let mut response = simple_json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
            response
                .headers_mut()
                .insert(hyper::header::ALLOW, hyper::header::HeaderValue::from_static("POST"));
            return response;
        }

        let body = match Limited::new(req.into_body(), MAX_CHAT_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, "Failed to read chat request body");
                return simple_json_error(StatusCode::BAD_REQUEST, "Invalid request body");
            }
        };

        let request = match ChatRequest::parse(&body) {
            Ok(request) => request,
            Err(message) => return simple_json_error(StatusCode::BAD_REQUEST, message),
        };

        debug!(messages = request.messages.len(), state = ?request.state, "Forwarding chat turn");

        match self.complete(&request).await {
            Ok(message) => {
                let body = serde_json::json!({ "message": message }).to_string();
                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "application/json")
                    .body(full_body(body))
                    .expect("valid response with static headers")
            }
            Err(e) => {
                error!(error = %e, "Chat completion failed");
                simple_json_error(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_FAILURE)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Completion API stand-in that records the last request body
    async fn completion_server(status: StatusCode, reply: &'static str) -> (String, Arc<parking_lot::Mutex<Option<Value>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = Arc::clone(&seen);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen_clone);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let seen = Arc::clone(&seen);
                        async move {
                            let auth = req
                                .headers()
                                .get("authorization")
                                .and_then(|v| v.to_str().ok())
                                .map(String::from);
                            let body = req.into_body().collect().await?.to_bytes();
                            let mut value: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
                            value["_auth"] = Value::from(auth);
                            *seen.lock() = Some(value);

                            let json = serde_json::json!({
                                "choices": [{ "message": { "role": "assistant", "content": reply } }]
                            });
                            Ok::<_, hyper::Error>(
                                Response::builder()
                                    .status(status)
                                    .header("Content-Type", "application/json")
                                    .body(Full::new(Bytes::from(json.to_string())))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (format!("http://{}/v1/chat/completions", addr), seen)
    }

    fn client(api_url: String, api_key: Option<&str>) -> ChatClient {
        let config = ChatConfig {
            api_url,
            api_key: api_key.map(String::from),
            system_prompt: "You help with enrollment.".to_string(),
            timeout_secs: 5,
            ..ChatConfig::default()
        };
        ChatClient::new(config).unwrap()
    }

    fn post(body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(CHAT_PATH)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn json_body(response: Response<ProxyBody>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(ChatRequest::parse(b"not json"), Err("Invalid JSON body"));
        assert_eq!(ChatRequest::parse(b"{}"), Err("Messages array is required"));
        assert_eq!(ChatRequest::parse(br#"{"messages": []}"#), Err("Messages array is required"));
        assert_eq!(ChatRequest::parse(br#"{"messages": "hi"}"#), Err("Messages array is required"));
        assert!(ChatRequest::parse(br#"{"messages": [{"role": "user"}]}"#).is_err());
        assert!(ChatRequest::parse(br#"{"messages": [{"role": "user", "content": 3}]}"#).is_err());
    }

    #[test]
    fn test_parse_accepts_state() {
        let request =
            ChatRequest::parse(br#"{"messages": [{"role": "user", "content": "hi"}], "state": "CA"}"#).unwrap();
        assert_eq!(request.messages, vec![ChatMessage::new("user", "hi")]);
        assert_eq!(request.state.as_deref(), Some("CA"));

        let request = ChatRequest::parse(br#"{"messages": [{"role": "user", "content": "hi"}], "state": " "}"#).unwrap();
        assert_eq!(request.state, None);
    }

    #[test]
    fn test_system_prompt_mentions_state() {
        let client = client("http://127.0.0.1:1/".to_string(), None);
        assert_eq!(client.system_prompt(None), "You help with enrollment.");
        assert!(client.system_prompt(Some("TX")).contains("TX"));
    }

    #[tokio::test]
    async fn test_empty_object_is_400() {
        let client = client("http://127.0.0.1:1/".to_string(), Some("key"));
        let response = client.handle(post("{}")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(response).await["error"].is_string());
    }

    #[tokio::test]
    async fn test_get_is_405() {
        let client = client("http://127.0.0.1:1/".to_string(), Some("key"));
        let req = Request::builder().uri(CHAT_PATH).body(Full::new(Bytes::new())).unwrap();
        let response = client.handle(req).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_valid_request_returns_message() {
        let (url, seen) = completion_server(StatusCode::OK, "Happy to help!").await;
        let client = client(url, Some("secret-key"));

        let response = client
            .handle(post(r#"{"messages": [{"role": "user", "content": "What do I need?"}], "state": "CA"}"#))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["message"], "Happy to help!");

        let sent = seen.lock().clone().unwrap();
        assert_eq!(sent["_auth"], "Bearer secret-key");
        assert_eq!(sent["messages"][0]["role"], "system");
        assert!(sent["messages"][0]["content"].as_str().unwrap().contains("CA"));
        assert_eq!(sent["messages"][1]["content"], "What do I need?");
    }

    #[tokio::test]
    async fn test_upstream_failure_is_generic_500() {
        let (url, _seen) = completion_server(StatusCode::UNAUTHORIZED, "unused").await;
        let client = client(url, Some("bad-key"));

        let response = client
            .handle(post(r#"{"messages": [{"role": "user", "content": "hi"}]}"#))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["error"], GENERIC_FAILURE);
    }

    #[tokio::test]
    async fn test_missing_key_is_500() {
        let client = client("http://127.0.0.1:1/".to_string(), None);
        let response = client
            .handle(post(r#"{"messages": [{"role": "user", "content": "hi"}]}"#))
            .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
