use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::{ChatTransport, TokenChunk, TokenStream};
use crate::config::OllamaConfig;
use crate::errors::{AppError, TransportError};
use crate::models::{Message, MessageRole, MessageState, TokenUsage};

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponseLine {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

/// Replays stored messages as Ollama chat messages.
/// Error-marked turns carry no model output and are left out.
fn to_wire_history(history: &[Message]) -> Vec<WireMessage<'_>> {
    history
        .iter()
        .filter(|m| matches!(m.state, MessageState::Complete | MessageState::Truncated))
        .map(|m| WireMessage { role: m.role.wire_name(), content: &m.content })
        .collect()
}

/// Streaming client for the Ollama `/api/chat` endpoint.
#[derive(Clone)]
pub struct OllamaClient {
    config: OllamaConfig,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AppError::Unexpected(format!("Failed to build Ollama client: {e}")))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn unreachable(&self, message: impl Into<String>) -> TransportError {
        TransportError::Unreachable { host: self.config.base_url(), message: message.into() }
    }

    fn send_error(&self, err: reqwest::Error) -> TransportError {
        match err.status() {
            Some(status) => TransportError::ServerError(status.as_u16()),
            None => self.unreachable(err.to_string()),
        }
    }
}

#[async_trait]
impl ChatTransport for OllamaClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn stream(&self, history: &[Message]) -> Result<TokenStream, TransportError> {
        if !matches!(history.last(), Some(m) if m.role == MessageRole::User) {
            return Err(TransportError::ProtocolError(
                "conversation history must end with a user message".to_string(),
            ));
        }

        let body = ChatRequestBody {
            model: &self.config.model,
            messages: to_wire_history(history),
            stream: true,
        };
        debug!(model = %self.config.model, messages = body.messages.len(), "Ollama chat request");

        let request = self.http.post(self.config.chat_url()).json(&body).send();
        let response = tokio::time::timeout(self.config.connect_timeout + self.config.read_timeout, request)
            .await
            .map_err(|_| self.unreachable("timed out waiting for a response"))?
            .map_err(|e| self.send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text = text.chars().take(200).collect::<String>();
            warn!(%status, body = %text, "Ollama rejected chat request");
            return Err(TransportError::ServerError(status.as_u16()));
        }

        let bytes = Box::pin(response.bytes_stream().map_err(io::Error::other));
        Ok(decode_ndjson(
            StreamReader::new(bytes),
            self.config.read_timeout,
            self.config.base_url(),
        ))
    }
}

/// Longest response line accepted before the body is declared malformed.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Turns a newline-delimited JSON body into chunks. Each line read is bounded by
/// `read_timeout`; the stream stops after the final chunk or the first error,
/// dropping the reader (and with it the connection).
fn decode_ndjson<R>(reader: R, read_timeout: Duration, host: String) -> TokenStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    stream::unfold(Some(lines), move |lines| {
        let host = host.clone();
        async move {
            let mut lines = lines?;
            loop {
                let line = match tokio::time::timeout(read_timeout, lines.next()).await {
                    Err(_) => {
                        let message = format!("no data within {} ms", read_timeout.as_millis());
                        return Some((Err(TransportError::Unreachable { host, message }), None));
                    }
                    Ok(Some(Err(e))) => return Some((Err(line_error(e, host)), None)),
                    Ok(None) => {
                        let err = TransportError::ProtocolError(
                            "response ended before the final chunk".to_string(),
                        );
                        return Some((Err(err), None));
                    }
                    Ok(Some(Ok(line))) => line,
                };

                match parse_line(&line) {
                    Ok(None) => continue,
                    Ok(Some(chunk)) => {
                        let rest = if chunk.is_final { None } else { Some(lines) };
                        return Some((Ok(chunk), rest));
                    }
                    Err(e) => return Some((Err(e), None)),
                }
            }
        }
    })
    .boxed()
}

/// Undecodable bytes are the server's fault; anything else is the connection's.
fn line_error(err: LinesCodecError, host: String) -> TransportError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            TransportError::ProtocolError(format!("response line longer than {MAX_LINE_LENGTH} bytes"))
        }
        LinesCodecError::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
            TransportError::ProtocolError(format!("undecodable response line: {e}"))
        }
        LinesCodecError::Io(e) => TransportError::Unreachable { host, message: e.to_string() },
    }
}

/// Parses one response line. Blank lines yield `None`.
fn parse_line(line: &str) -> Result<Option<TokenChunk>, TransportError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let parsed: ChatResponseLine = serde_json::from_str(line).map_err(|e| {
        let excerpt = line.chars().take(80).collect::<String>();
        TransportError::ProtocolError(format!("{e} in line '{excerpt}'"))
    })?;

    if let Some(error) = parsed.error {
        return Err(TransportError::ProtocolError(error));
    }

    if !parsed.done {
        return match parsed.message {
            Some(message) => Ok(Some(TokenChunk::delta(message.content))),
            None => Err(TransportError::ProtocolError(
                "line carries neither a message nor a done flag".to_string(),
            )),
        };
    }

    let usage = match (parsed.prompt_eval_count, parsed.eval_count) {
        (None, None) => None,
        (input, output) => Some(TokenUsage {
            input_tokens: input.unwrap_or(0),
            output_tokens: output.unwrap_or(0),
        }),
    };
    let text = parsed.message.map(|m| m.content).unwrap_or_default();
    Ok(Some(TokenChunk::last(text, usage)))
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::agent::fake_ollama::{fake_ollama, BANG, DONE, HI, THERE};

    fn user(content: &str) -> Message {
        Message::new(0, MessageRole::User, "bjorn", content)
    }

    // ── Line parsing ─────────────────────────────────────────────────────────

    #[test]
    fn parses_delta_and_final_lines() {
        assert_eq!(parse_line(HI).unwrap(), Some(TokenChunk::delta("Hi")));
        let last = parse_line(DONE).unwrap().unwrap();
        assert!(last.is_final);
        assert_eq!(last.text, "");
        assert_eq!(last.usage, Some(TokenUsage { input_tokens: 26, output_tokens: 3 }));
        assert_eq!(parse_line("   ").unwrap(), None);
    }

    #[test]
    fn rejects_malformed_and_error_lines() {
        assert!(matches!(parse_line("{not json"), Err(TransportError::ProtocolError(_))));
        assert!(matches!(parse_line(r#"{"done":false}"#), Err(TransportError::ProtocolError(_))));
        assert_eq!(
            parse_line(r#"{"error":"model 'llama9' not found"}"#),
            Err(TransportError::ProtocolError("model 'llama9' not found".to_string()))
        );
    }

    #[test]
    fn wire_history_skips_failed_turns() {
        let mut failed = Message::new(1, MessageRole::Assistant, "orca-mini", "");
        failed.state = MessageState::Failed { reason: "unreachable".into() };
        let mut truncated = Message::new(3, MessageRole::Assistant, "orca-mini", "Partial");
        truncated.state = MessageState::Truncated;
        let history = vec![
            Message::new(0, MessageRole::System, "System", "Be brief."),
            failed,
            user("Hello"),
            truncated,
            user("Go on"),
        ];

        let body = serde_json::to_value(ChatRequestBody {
            model: "orca-mini",
            messages: to_wire_history(&history),
            stream: true,
        })
        .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "model": "orca-mini",
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "Hello"},
                    {"role": "assistant", "content": "Partial"},
                    {"role": "user", "content": "Go on"},
                ],
                "stream": true,
            })
        );
    }

    // ── Decoding ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn stops_after_the_final_chunk() {
        let body = format!("{HI}\n\n{DONE}\n{BANG}\n");
        let chunks: Vec<_> =
            decode_ndjson(std::io::Cursor::new(body), Duration::from_secs(1), "h".into())
                .collect()
                .await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].as_ref().unwrap().is_final);
    }

    #[tokio::test]
    async fn premature_end_is_a_protocol_error() {
        let body = format!("{HI}\n");
        let chunks: Vec<_> =
            decode_ndjson(std::io::Cursor::new(body), Duration::from_secs(1), "h".into())
                .collect()
                .await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Err(TransportError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn undecodable_bytes_are_a_protocol_error() {
        let mut body = format!("{HI}\n").into_bytes();
        body.extend_from_slice(b"{\"message\":\xff\xfe}\n");
        body.extend_from_slice(format!("{DONE}\n").as_bytes());
        let chunks: Vec<_> =
            decode_ndjson(std::io::Cursor::new(body), Duration::from_secs(1), "h".into())
                .collect()
                .await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], Ok(TokenChunk::delta("Hi")));
        assert!(matches!(chunks[1], Err(TransportError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn oversized_line_is_a_protocol_error() {
        let body = format!("{HI}\n{}\n{DONE}\n", "x".repeat(MAX_LINE_LENGTH + 1));
        let chunks: Vec<_> =
            decode_ndjson(std::io::Cursor::new(body), Duration::from_secs(1), "h".into())
                .collect()
                .await;
        assert_eq!(chunks.len(), 2);
        assert!(matches!(chunks[1], Err(TransportError::ProtocolError(ref m)) if m.contains("longer than")));
    }

    // ── Against a local HTTP server ──────────────────────────────────────────

    fn client(port: u16) -> OllamaClient {
        let config = OllamaConfig::new("orca-mini")
            .with_endpoint("127.0.0.1", port)
            .with_connect_timeout(Duration::from_secs(2))
            .with_read_timeout(Duration::from_millis(300));
        OllamaClient::new(config).unwrap()
    }

    #[tokio::test]
    async fn streams_chunks_in_server_order() {
        let server = fake_ollama("200 OK", vec![HI, THERE, BANG, DONE], true).await;
        let client = client(server.port);

        let chunks: Vec<TokenChunk> = client
            .stream(&[user("Hello")])
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;

        let text: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(text, "Hi there!");
        assert!(chunks.last().unwrap().is_final);
        assert_eq!(chunks.last().unwrap().usage.unwrap().total_tokens(), 29);

        let request = server.request.await.unwrap();
        assert!(request.starts_with("POST /api/chat HTTP/1.1"));
        assert!(request.contains(r#""model":"orca-mini""#));
        assert!(request.contains(r#""messages":[{"role":"user","content":"Hello"}]"#));
        assert!(request.contains(r#""stream":true"#));
    }

    #[tokio::test]
    async fn error_status_is_a_server_error() {
        let server = fake_ollama("500 Internal Server Error", vec![r#"{"error":"boom"}"#], true).await;
        let result = client(server.port).stream(&[user("Hello")]).await;
        assert!(matches!(result, Err(TransportError::ServerError(500))));
    }

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = client(port).stream(&[user("Hello")]).await;
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }

    #[tokio::test]
    async fn history_must_end_with_a_user_turn() {
        let history = [Message::new(0, MessageRole::System, "System", "Be brief.")];
        let result = client(1).stream(&history).await;
        assert!(matches!(result, Err(TransportError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn silence_beyond_read_timeout_is_unreachable() {
        let server = fake_ollama("200 OK", vec![HI], false).await;
        let mut chunks = client(server.port).stream(&[user("Hello")]).await.unwrap();

        assert_eq!(chunks.next().await.unwrap().unwrap(), TokenChunk::delta("Hi"));
        assert!(matches!(chunks.next().await, Some(Err(TransportError::Unreachable { .. }))));
        assert!(chunks.next().await.is_none());

        tokio::time::timeout(Duration::from_secs(2), server.closed).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dropping_the_stream_closes_the_connection() {
        let server = fake_ollama("200 OK", vec![HI, THERE], false).await;
        let mut chunks = client(server.port).stream(&[user("Hello")]).await.unwrap();
        chunks.next().await.unwrap().unwrap();
        chunks.next().await.unwrap().unwrap();
        drop(chunks);

        tokio::time::timeout(Duration::from_secs(2), server.closed).await.unwrap().unwrap();
    }
}
