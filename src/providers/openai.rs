//! OpenAI-compatible chat completions: streamed replies, translation and
//! emotion classification.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;

use super::traits::{
    trim_messages, ChatMessage, Emotion, EmotionClassifier, Role, TokenFragment, TokenSource,
    TokenStream, Translator,
};
use super::ProviderError;
use crate::config::{Config, LlmConfig};

const PROVIDER: &str = "openai";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// ── Endpoint ─────────────────────────────────────────────────────

/// Base URL and credentials shared by every chat-completions caller.
#[derive(Clone)]
struct ChatEndpoint {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ChatEndpoint {
    fn new(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, payload: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or(ProviderError::MissingApiKey { provider: PROVIDER })?;

        let resp = self
            .client
            .post(self.url())
            .bearer_auth(api_key)
            .json(payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(ProviderError::transport(PROVIDER))?;

        ProviderError::check(PROVIDER, resp).await
    }

    /// Non-streaming completion; returns the first choice's content.
    async fn complete(&self, payload: &serde_json::Value) -> Result<String, ProviderError> {
        let resp = self.post(payload).await?;
        let body: CompletionResponse = resp.json().await.map_err(|e| ProviderError::Decode {
            provider: PROVIDER,
            detail: e.to_string(),
        })?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Decode {
                provider: PROVIDER,
                detail: "response has no message content".into(),
            })
    }
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

// ── Streaming decoder ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

/// Incremental decoder for a `text/event-stream` chat completion body.
///
/// Network chunks may split lines (and UTF-8 sequences) anywhere; bytes are
/// buffered until a full line is available. Generation ends at the `[DONE]`
/// sentinel or a `stop` finish reason, whichever comes first.
#[derive(Debug, Default)]
pub struct ChatStreamDecoder {
    buf: Vec<u8>,
    done: bool,
}

impl ChatStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the content deltas completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, ProviderError> {
        let mut deltas = Vec::new();
        if self.done {
            return Ok(deltas);
        }
        self.buf.extend_from_slice(bytes);

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(delta) = self.line(&line[..line.len() - 1])? {
                deltas.push(delta);
            }
            if self.done {
                self.buf.clear();
                break;
            }
        }
        Ok(deltas)
    }

    /// Flush a final line left without a trailing newline.
    pub fn finish(&mut self) -> Result<Vec<String>, ProviderError> {
        let rest = std::mem::take(&mut self.buf);
        if self.done || rest.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.line(&rest)?.into_iter().collect())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn line(&mut self, raw: &[u8]) -> Result<Option<String>, ProviderError> {
        let line = std::str::from_utf8(raw).map_err(|e| ProviderError::Decode {
            provider: PROVIDER,
            detail: e.to_string(),
        })?;
        let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
            // Comments, event names and blank separators.
            return Ok(None);
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| ProviderError::Decode {
            provider: PROVIDER,
            detail: e.to_string(),
        })?;
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };
        if choice.finish_reason.as_deref() == Some("stop") {
            self.done = true;
            return Ok(None);
        }
        Ok(choice.delta.content.filter(|c| !c.is_empty()))
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: ChatStreamDecoder,
    ready: VecDeque<String>,
    text: String,
    finished: bool,
}

fn token_stream(body: BoxStream<'static, reqwest::Result<Vec<u8>>>) -> TokenStream {
    let state = SseState {
        body,
        decoder: ChatStreamDecoder::new(),
        ready: VecDeque::new(),
        text: String::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(delta) = st.ready.pop_front() {
                st.text.push_str(&delta);
                let fragment = TokenFragment {
                    delta,
                    text: st.text.clone(),
                };
                return Some((Ok(fragment), st));
            }
            if st.finished || st.decoder.is_done() {
                return None;
            }

            let decoded = match st.body.next().await {
                Some(Ok(bytes)) => st.decoder.push(&bytes),
                Some(Err(e)) => Err(ProviderError::Transport {
                    provider: PROVIDER,
                    source: e,
                }),
                None => {
                    st.finished = true;
                    st.decoder.finish()
                }
            };
            match decoded {
                Ok(deltas) => st.ready.extend(deltas),
                Err(e) => {
                    st.finished = true;
                    return Some((Err(anyhow::Error::from(e)), st));
                }
            }
        }
    })
    .boxed()
}

// ── Token source ─────────────────────────────────────────────────

/// Streams chat replies from an OpenAI-compatible endpoint.
pub struct OpenAiChat {
    endpoint: ChatEndpoint,
    model: String,
    max_tokens: u32,
    max_context_messages: usize,
    system_prompt: Option<String>,
}

impl OpenAiChat {
    pub fn from_config(client: reqwest::Client, config: &LlmConfig) -> Self {
        Self {
            endpoint: ChatEndpoint::new(client, &config.base_url, config.api_key.clone()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            max_context_messages: config.max_context_messages,
            system_prompt: config.system_prompt.clone(),
        }
    }

    /// Trimmed request context, with the configured persona prepended when
    /// the caller supplied no system message.
    fn context(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut all = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            if !messages.iter().any(|m| m.role == Role::System) {
                all.push(ChatMessage::system(prompt.clone()));
            }
        }
        all.extend_from_slice(messages);
        trim_messages(&all, self.max_context_messages)
    }
}

#[async_trait]
impl TokenSource for OpenAiChat {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn stream(&self, messages: &[ChatMessage]) -> anyhow::Result<TokenStream> {
        let context = self.context(messages);
        tracing::info!(
            model = %self.model,
            original = messages.len(),
            trimmed = context.len(),
            "Requesting streamed completion"
        );

        let payload = serde_json::json!({
            "model": self.model,
            "messages": context,
            "max_tokens": self.max_tokens,
            "stream": true,
        });
        let resp = self.endpoint.post(&payload).await?;
        let body = resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed();
        Ok(token_stream(body))
    }
}

// ── Translation ──────────────────────────────────────────────────

fn language_name(code: &str) -> &str {
    match code {
        "zh" => "Chinese",
        "en" => "English",
        "ja" => "Japanese",
        other => other,
    }
}

pub struct OpenAiTranslator {
    endpoint: ChatEndpoint,
    model: String,
}

impl OpenAiTranslator {
    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        Self {
            endpoint: ChatEndpoint::new(client, &config.llm.base_url, config.llm.api_key.clone()),
            model: config.translation.model.clone(),
        }
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    async fn translate(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> anyhow::Result<String> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }
        let source = language_name(source_language);
        let target = language_name(target_language);

        let payload = serde_json::json!({
            "model": self.model,
            "messages": [
                ChatMessage::system(format!(
                    "You are a professional translator from {source} to {target}. \
                     Reply with the translation only, without explanations."
                )),
                ChatMessage::user(format!(
                    "Translate the following {source} text into {target}:\n\n{text}"
                )),
            ],
            "temperature": 0.3,
        });

        let translated = self.endpoint.complete(&payload).await?;
        Ok(translated.trim().to_string())
    }
}

// ── Emotion ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EmotionReply {
    result: String,
}

pub struct OpenAiEmotionClassifier {
    endpoint: ChatEndpoint,
    model: String,
}

impl OpenAiEmotionClassifier {
    pub fn from_config(client: reqwest::Client, config: &Config) -> Self {
        Self {
            endpoint: ChatEndpoint::new(client, &config.llm.base_url, config.llm.api_key.clone()),
            model: config.emotion.model.clone(),
        }
    }

    fn payload(&self, text: &str) -> serde_json::Value {
        let labels: Vec<&str> = Emotion::all().iter().map(|e| e.as_str()).collect();
        serde_json::json!({
            "model": self.model,
            "messages": [
                ChatMessage::system(
                    "You drive an avatar's expression. Pick the expression that best \
                     fits what the avatar is saying; vary your choices."
                ),
                ChatMessage::user(text),
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "motion_response",
                    "strict": true,
                    "schema": {
                        "type": "object",
                        "properties": {
                            "result": { "type": "string", "enum": labels }
                        },
                        "required": ["result"],
                        "additionalProperties": false
                    }
                }
            }
        })
    }
}

#[async_trait]
impl EmotionClassifier for OpenAiEmotionClassifier {
    async fn classify(&self, text: &str) -> anyhow::Result<Emotion> {
        let content = self.endpoint.complete(&self.payload(text)).await?;
        let reply: EmotionReply =
            serde_json::from_str(&content).map_err(|e| ProviderError::Decode {
                provider: PROVIDER,
                detail: format!("{e}: {content}"),
            })?;
        reply.result.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(deltas: &[&str]) -> String {
        let mut body = String::new();
        for d in deltas {
            let chunk = serde_json::json!({
                "choices": [{"delta": {"content": d}, "finish_reason": null}]
            });
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn llm_config(base_url: &str, api_key: Option<&str>) -> LlmConfig {
        LlmConfig {
            base_url: base_url.to_string(),
            api_key: api_key.map(str::to_string),
            ..LlmConfig::default()
        }
    }

    fn config_for(server: &MockServer) -> Config {
        let mut config = Config::default();
        config.llm = llm_config(&server.uri(), Some("sk-test"));
        config
    }

    #[test]
    fn decoder_handles_split_lines_and_done() {
        let body = sse(&["你好", "，世界"]);
        let bytes = body.as_bytes();
        let mut decoder = ChatStreamDecoder::new();
        let mut deltas = Vec::new();
        // Feed in 7-byte slices to split lines and UTF-8 sequences.
        for piece in bytes.chunks(7) {
            deltas.extend(decoder.push(piece).unwrap());
        }
        deltas.extend(decoder.finish().unwrap());
        assert_eq!(deltas, vec!["你好", "，世界"]);
        assert!(decoder.is_done());
    }

    #[test]
    fn decoder_stops_on_finish_reason() {
        let mut decoder = ChatStreamDecoder::new();
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\r\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\r\n",
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
        );
        let deltas = decoder.push(body.as_bytes()).unwrap();
        assert_eq!(deltas, vec!["Hi"]);
        assert!(decoder.is_done());
    }

    #[test]
    fn decoder_flushes_unterminated_last_line() {
        let mut decoder = ChatStreamDecoder::new();
        let deltas = decoder
            .push(b"data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}")
            .unwrap();
        assert!(deltas.is_empty());
        assert_eq!(decoder.finish().unwrap(), vec!["tail"]);
    }

    #[test]
    fn decoder_rejects_bad_json() {
        let mut decoder = ChatStreamDecoder::new();
        assert!(matches!(
            decoder.push(b"data: {not json}\n"),
            Err(ProviderError::Decode { .. })
        ));
    }

    #[test]
    fn context_prepends_persona_and_trims() {
        let mut config = llm_config("http://localhost", Some("k"));
        config.system_prompt = Some("persona".into());
        config.max_context_messages = 3;
        let chat = OpenAiChat::from_config(reqwest::Client::new(), &config);

        let messages: Vec<ChatMessage> =
            (0..5).map(|i| ChatMessage::user(format!("m{i}"))).collect();
        let context = chat.context(&messages);
        let contents: Vec<&str> = context.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["persona", "m3", "m4"]);
    }

    #[tokio::test]
    async fn streams_fragments_from_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(sse(&["Hello", ", world."]), "text/event-stream"),
            )
            .mount(&server)
            .await;

        let chat = OpenAiChat::from_config(
            reqwest::Client::new(),
            &llm_config(&server.uri(), Some("sk-test")),
        );
        let fragments: Vec<TokenFragment> = chat
            .stream(&[ChatMessage::user("hi")])
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[1].delta, ", world.");
        assert_eq!(fragments[1].text, "Hello, world.");

        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["stream"], true);
        assert_eq!(sent["max_tokens"], 200);
    }

    #[tokio::test]
    async fn missing_key_fails_before_request() {
        let chat = OpenAiChat::from_config(
            reqwest::Client::new(),
            &llm_config("http://127.0.0.1:9", None),
        );
        let err = chat.stream(&[ChatMessage::user("hi")]).await.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::MissingApiKey { .. })
        ));
    }

    #[tokio::test]
    async fn http_error_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let chat =
            OpenAiChat::from_config(reqwest::Client::new(), &llm_config(&server.uri(), Some("k")));
        let err = chat.stream(&[ChatMessage::user("hi")]).await.err().unwrap();
        match err.downcast_ref::<ProviderError>() {
            Some(ProviderError::Http { status, body, .. }) => {
                assert_eq!(status.as_u16(), 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn translator_returns_trimmed_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "  Hello.\n"}}]
            })))
            .mount(&server)
            .await;

        let translator =
            OpenAiTranslator::from_config(reqwest::Client::new(), &config_for(&server));
        let out = translator.translate("你好。", "zh", "en").await.unwrap();
        assert_eq!(out, "Hello.");

        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent["temperature"], 0.3);
        let prompt = sent["messages"][1]["content"].as_str().unwrap();
        assert!(prompt.contains("Chinese") && prompt.contains("English"));
    }

    #[tokio::test]
    async fn translator_skips_blank_text() {
        let translator = OpenAiTranslator::from_config(reqwest::Client::new(), &Config::default());
        assert_eq!(translator.translate("  ", "zh", "en").await.unwrap(), "  ");
    }

    #[tokio::test]
    async fn classifier_parses_schema_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "{\"result\":\"shy2\"}"}}]
            })))
            .mount(&server)
            .await;

        let classifier =
            OpenAiEmotionClassifier::from_config(reqwest::Client::new(), &config_for(&server));
        assert_eq!(classifier.classify("hehe").await.unwrap(), Emotion::Shy2);

        let requests = server.received_requests().await.unwrap();
        let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let schema = &sent["response_format"]["json_schema"]["schema"];
        let labels = &schema["properties"]["result"]["enum"];
        assert_eq!(labels.as_array().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn classifier_rejects_unknown_label() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "{\"result\":\"ecstatic\"}"}}]
            })))
            .mount(&server)
            .await;

        let classifier =
            OpenAiEmotionClassifier::from_config(reqwest::Client::new(), &config_for(&server));
        assert!(classifier.classify("wow").await.is_err());
    }
}
