//! Google Gemini streaming driver.
//!
//! This module implements the [`LlmDriver`] trait for the Gemini
//! `streamGenerateContent` endpoint in server-sent-events mode
//! (`?alt=sse`). Every SSE `data:` payload is a partial
//! `GenerateContentResponse`; text parts are forwarded as [`ModelChunk`]s in
//! arrival order.

use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::{Value, json};

use super::{ChunkStream, LlmDriver, LlmRequest, LlmSettings, Message, MessageRole, ModelChunk};

/// Finish reasons that mark a normal end of generation.
const NORMAL_FINISH_REASONS: &[&str] = &["STOP", "MAX_TOKENS", "FINISH_REASON_UNSPECIFIED"];

/// Driver for the Gemini `streamGenerateContent` API.
#[derive(Clone)]
pub struct GeminiDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for GeminiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

impl GeminiDriver {
    /// Create a new Gemini driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    /// Full URL of the streaming endpoint for the configured model.
    #[must_use]
    pub fn stream_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.model
        )
    }

    /// Build the JSON request body.
    #[must_use]
    pub fn request_body(&self, req: &LlmRequest) -> Value {
        let contents: Vec<Value> = req.messages.iter().map(content_json).collect();

        let mut body = json!({ "contents": contents });
        if let Some(instruction) = self
            .settings
            .system_instruction
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            body["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
        }
        body
    }
}

#[async_trait::async_trait]
impl LlmDriver for GeminiDriver {
    async fn stream(&self, req: LlmRequest) -> anyhow::Result<ChunkStream> {
        let url = self.stream_url();
        let body = self.request_body(&req);

        tracing::debug!(
            model = %self.settings.model,
            turns = req.messages.len(),
            "Opening Gemini stream"
        );

        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.settings.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!(describe_http_error(status, &detail));
        }

        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut frames = SseBuffer::default();
            let mut finished = false;

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                frames.push(&chunk);

                while let Some(data) = frames.next_data() {
                    let event = decode_event(&data)?;
                    finished |= event.finished;
                    if event.text.is_some() {
                        yield ModelChunk { text: event.text };
                    }
                }
            }

            // A final frame may arrive without its blank-line terminator.
            if let Some(data) = frames.finish() {
                let event = decode_event(&data)?;
                finished |= event.finished;
                if event.text.is_some() {
                    yield ModelChunk { text: event.text };
                }
            }

            if !finished {
                Err::<(), _>(anyhow::anyhow!(
                    "upstream stream ended before the response was complete"
                ))?;
            }
        };

        Ok(Box::pin(out))
    }
}

/// Gemini wire form of a conversation turn.
fn content_json(message: &Message) -> Value {
    let role = match message.role {
        MessageRole::User => "user",
        MessageRole::Model => "model",
    };
    json!({ "role": role, "parts": [{ "text": message.content }] })
}

/// Render a non-success HTTP response as an error message.
///
/// Gemini error bodies look like `{"error": {"code": 429, "message": "..."}}`.
fn describe_http_error(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(ToString::to_string));

    match message {
        Some(m) => format!("upstream returned {status}: {m}"),
        None if body.trim().is_empty() => format!("upstream returned {status}"),
        None => format!("upstream returned {status}: {}", body.trim()),
    }
}

/// What one SSE payload contributed to the reply.
#[derive(Debug, Default, PartialEq, Eq)]
struct DecodedEvent {
    text: Option<String>,
    finished: bool,
}

/// Decode one `data:` payload.
fn decode_event(data: &str) -> anyhow::Result<DecodedEvent> {
    let v: Value = serde_json::from_str(data)?;

    if let Some(err) = v.get("error") {
        let message = err["message"].as_str().unwrap_or("unknown upstream error");
        anyhow::bail!("upstream error: {message}");
    }

    if let Some(reason) = v["promptFeedback"]["blockReason"].as_str() {
        anyhow::bail!("prompt blocked: {reason}");
    }

    let candidate = &v["candidates"][0];
    let text: String = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    let text = (!text.is_empty()).then_some(text);

    let finish_reason = candidate.get("finishReason").and_then(Value::as_str);
    if let Some(reason) = finish_reason
        && text.is_none()
        && !NORMAL_FINISH_REASONS.contains(&reason)
    {
        anyhow::bail!("response blocked: {reason}");
    }

    Ok(DecodedEvent {
        text,
        finished: finish_reason.is_some(),
    })
}

/// Incremental SSE frame splitter.
///
/// Accepts bytes in arbitrary chunk boundaries and yields the joined `data:`
/// payload of each complete frame. Frames end with a blank line, using either
/// `\n` or `\r\n` line endings.
#[derive(Debug, Default)]
struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame that carries data.
    fn next_data(&mut self) -> Option<String> {
        while let Some((pos, len)) = find_frame_end(&self.buf) {
            let frame = self.buf.drain(..pos + len).collect::<Vec<_>>();
            if let Some(data) = frame_data(&frame) {
                return Some(data);
            }
        }
        None
    }

    /// Drain whatever is left once the byte stream has ended.
    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        frame_data(&rest)
    }
}

/// Find the end of the first frame: `(start of separator, separator length)`.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Join the `data:` lines of one frame, ignoring comments and other fields.
fn frame_data(frame: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(frame);
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .collect();

    (!data.is_empty()).then(|| data.join("\n"))
}
