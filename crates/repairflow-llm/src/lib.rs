mod error;

pub use error::{LlmError, classify_error};

use anyhow::{Result, anyhow};
use repairflow_core::{ChatMessage, ChatRequest, LlmConfig, LlmResponse, TokenUsage};
use reqwest::blocking::Client;
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

pub trait LlmClient: Send + Sync {
    /// One chat completion. Implementations make a single attempt; retries
    /// belong to the caller.
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse>;

    /// Label used in logs.
    fn name(&self) -> &str {
        "llm"
    }
}

/// Client for any `/chat/completions` endpoint speaking the OpenAI wire format.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenAiCompatibleClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.cfg
    }

    fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.cfg
                    .api_key
                    .as_ref()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }

    fn build_chat_payload(&self, req: &ChatRequest) -> Value {
        let model = if req.model.trim().is_empty() {
            self.cfg.model.as_str()
        } else {
            req.model.as_str()
        };
        let messages: Vec<Value> = req.messages.iter().map(message_json).collect();
        json!({
            "model": model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "temperature": req.temperature.unwrap_or(self.cfg.temperature),
            "stream": false,
        })
    }
}

impl LlmClient for OpenAiCompatibleClient {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        let Some(api_key) = self.resolve_api_key() else {
            return Err(LlmError::Authentication {
                env: self.cfg.api_key_env.clone(),
            }
            .into());
        };
        let payload = self.build_chat_payload(req);
        let response = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .map_err(|e| anyhow::Error::new(format_transport_error(&e, self.cfg.timeout_seconds)))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| anyhow::Error::new(format_transport_error(&e, self.cfg.timeout_seconds)))?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &body, &self.cfg.api_key_env).into());
        }
        parse_chat_payload(&body)
    }

    fn name(&self) -> &str {
        &self.cfg.provider
    }
}

fn message_json(message: &ChatMessage) -> Value {
    json!({ "role": message.role(), "content": message.content() })
}

fn format_transport_error(err: &reqwest::Error, timeout_seconds: u64) -> LlmError {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if err.is_timeout() {
        LlmError::Timeout(timeout_seconds)
    } else if err.is_connect()
        || inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("no such host")
    {
        LlmError::Network(format!("could not reach endpoint: {err}"))
    } else if err.is_decode() || err.is_body() {
        LlmError::MalformedPayload(err.to_string())
    } else {
        LlmError::Network(err.to_string())
    }
}

/// Extract text, finish reason, model and usage from a non-streaming body.
pub fn parse_chat_payload(body: &str) -> Result<LlmResponse> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| LlmError::MalformedPayload(format!("response is not JSON: {e}")))?;
    let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
    else {
        return Err(LlmError::MalformedPayload("missing choices[0]".to_string()).into());
    };
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .unwrap_or("stop")
        .to_string();
    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::MalformedPayload("missing message.content".to_string()))?
        .to_string();
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let usage = value
        .get("usage")
        .map(|u| TokenUsage {
            prompt_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
            completion_tokens: u
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
        .unwrap_or_default();
    Ok(LlmResponse {
        text,
        finish_reason,
        model,
        usage,
    })
}

/// Run one call on a worker thread and stop waiting after `timeout`.
///
/// The worker is detached on timeout; its request keeps running until the
/// transport gives up on its own.
pub fn call_with_timeout(
    client: Arc<dyn LlmClient>,
    req: &ChatRequest,
    timeout: Duration,
) -> Result<LlmResponse> {
    let (tx, rx) = mpsc::channel();
    let req = req.clone();
    thread::Builder::new()
        .name("repairflow-llm-call".to_string())
        .spawn(move || {
            let _ = tx.send(client.complete_chat(&req));
        })?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(LlmError::Timeout(timeout.as_secs()).into()),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(anyhow!("llm worker exited without a response"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            model: String::new(),
            messages: vec![
                ChatMessage::System {
                    content: "fix bugs".to_string(),
                },
                ChatMessage::User {
                    content: text.to_string(),
                },
            ],
            max_tokens: 64,
            temperature: None,
        }
    }

    #[test]
    fn parses_payload_with_usage_and_finish_reason() {
        let body = r#"{"model":"m1","choices":[{"message":{"content":"hi"},"finish_reason":"length"}],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#;
        let out = parse_chat_payload(body).expect("payload");
        assert_eq!(out.text, "hi");
        assert!(out.was_truncated());
        assert_eq!(out.model, "m1");
        assert_eq!(out.usage.total(), 15);
    }

    #[test]
    fn missing_choices_is_malformed() {
        let err = parse_chat_payload(r#"{"choices":[]}"#).expect_err("malformed");
        assert!(matches!(classify_error(&err), LlmError::MalformedPayload(_)));
    }

    #[test]
    fn payload_uses_config_model_and_temperature_by_default() {
        let client = OpenAiCompatibleClient::new(LlmConfig {
            model: "gpt-test".to_string(),
            temperature: 0.3,
            ..LlmConfig::default()
        })
        .expect("client");
        let payload = client.build_chat_payload(&request("hello"));
        assert_eq!(payload["model"], "gpt-test");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "hello");
        assert!((payload["temperature"].as_f64().unwrap_or_default() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn missing_api_key_is_an_authentication_error() {
        let client = OpenAiCompatibleClient::new(LlmConfig {
            api_key_env: "REPAIRFLOW_KEY_MISSING_TEST".to_string(),
            api_key: None,
            ..LlmConfig::default()
        })
        .expect("client");
        let err = client.complete_chat(&request("x")).expect_err("no key");
        assert!(classify_error(&err).is_fatal());
    }

    #[test]
    fn successful_call_against_mock_server() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 200,
            body: r#"{"choices":[{"message":{"content":"%%_Fin_%%"}}],"usage":{"prompt_tokens":5,"completion_tokens":2}}"#.to_string(),
        }]);
        let client = OpenAiCompatibleClient::new(LlmConfig {
            endpoint: server.endpoint.clone(),
            api_key: Some("test-key".to_string()),
            api_key_env: "REPAIRFLOW_KEY_UNSET_OK_TEST".to_string(),
            ..LlmConfig::default()
        })
        .expect("client");
        let out = client.complete_chat(&request("x")).expect("response");
        assert_eq!(out.text, "%%_Fin_%%");
        assert_eq!(out.usage.prompt_tokens, 5);
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn single_attempt_on_server_error() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 503,
            body: r#"{"error":{"message":"overloaded"}}"#.to_string(),
        }]);
        let client = OpenAiCompatibleClient::new(LlmConfig {
            endpoint: server.endpoint.clone(),
            api_key: Some("test-key".to_string()),
            api_key_env: "REPAIRFLOW_KEY_UNSET_OK_TEST".to_string(),
            ..LlmConfig::default()
        })
        .expect("client");
        let err = client.complete_chat(&request("x")).expect_err("503");
        assert_eq!(
            classify_error(&err),
            LlmError::Server {
                status: 503,
                detail: "overloaded".to_string()
            }
        );
        assert_eq!(server.request_count(), 1);
    }

    struct SlowLlm;

    impl LlmClient for SlowLlm {
        fn complete_chat(&self, _req: &ChatRequest) -> Result<LlmResponse> {
            thread::sleep(StdDuration::from_millis(500));
            Ok(LlmResponse {
                text: "late".to_string(),
                finish_reason: "stop".to_string(),
                model: String::new(),
                usage: TokenUsage::default(),
            })
        }
    }

    #[test]
    fn call_with_timeout_gives_up_waiting() {
        let err = call_with_timeout(Arc::new(SlowLlm), &request("x"), StdDuration::from_millis(20))
            .expect_err("timeout");
        assert!(matches!(classify_error(&err), LlmError::Timeout(_)));
    }

    #[test]
    fn call_with_timeout_passes_through_fast_results() {
        let out = call_with_timeout(Arc::new(SlowLlm), &request("x"), StdDuration::from_secs(5))
            .expect("completes");
        assert_eq!(out.text, "late");
    }

    #[derive(Clone)]
    struct MockHttpResponse {
        status: u16,
        body: String,
    }

    struct MockServer {
        endpoint: String,
        request_count: Arc<AtomicUsize>,
        stop_tx: Option<mpsc::Sender<()>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl MockServer {
        fn request_count(&self) -> usize {
            self.request_count.load(Ordering::SeqCst)
        }
    }

    impl Drop for MockServer {
        fn drop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn start_mock_server(responses: Vec<MockHttpResponse>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        listener
            .set_nonblocking(true)
            .expect("set nonblocking listener");
        let addr = listener.local_addr().expect("addr");
        let request_count = Arc::new(AtomicUsize::new(0));
        let request_count_thread = Arc::clone(&request_count);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                if rx.try_recv().is_ok() {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let _ = consume_http_request(&mut stream);
                        let idx = request_count_thread.fetch_add(1, Ordering::SeqCst);
                        let Some(selected) =
                            responses.get(idx).or_else(|| responses.last()).cloned()
                        else {
                            break;
                        };
                        let status_text = match selected.status {
                            200 => "OK",
                            429 => "Too Many Requests",
                            503 => "Service Unavailable",
                            _ => "Error",
                        };
                        let response = format!(
                            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            selected.status,
                            status_text,
                            selected.body.len(),
                            selected.body
                        );
                        let _ = stream.write_all(response.as_bytes());
                        let _ = stream.flush();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(StdDuration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });
        MockServer {
            endpoint: format!("http://{addr}/v1/chat/completions"),
            request_count,
            stop_tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn consume_http_request(stream: &mut std::net::TcpStream) -> std::io::Result<()> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        let mut header_end = None;
        while header_end.is_none() {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            header_end = find_subsequence(&buffer, b"\r\n\r\n").map(|idx| idx + 4);
        }
        let header_len = header_end.unwrap_or(buffer.len());
        let content_length = parse_content_length(&buffer[..header_len]);
        let mut body_len = buffer.len().saturating_sub(header_len);
        while body_len < content_length {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            body_len += read;
        }
        Ok(())
    }

    fn parse_content_length(headers: &[u8]) -> usize {
        let raw = String::from_utf8_lossy(headers);
        for line in raw.lines() {
            let mut parts = line.splitn(2, ':');
            let key = parts.next().unwrap_or_default().trim();
            if key.eq_ignore_ascii_case("content-length")
                && let Some(value) = parts.next()
                && let Ok(parsed) = value.trim().parse::<usize>()
            {
                return parsed;
            }
        }
        0
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || haystack.len() < needle.len() {
            return None;
        }
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }
}
