use super::wire::{
    ConversationSummary, KnowledgeFeedback, MessageFeedback, RemoteConversation, RemoteMessage,
    saved_id,
};
use super::{
    AnswerBody, ApiError, ApiResult, ByteStream, FilePart, QaRequest, RemoteService,
    UploadRequest,
};
use crate::auth::TokenStore;
use crate::config::ClientConfig;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

const CONVERSATIONS_PATH: &str = "/api/chat-history/conversations";
const MESSAGE_FEEDBACK_PATH: &str = "/api/chat-history/feedback";
const QA_PATH: &str = "/api/workflows/knowledge-qa";
const QA_UPLOAD_PATH: &str = "/api/workflows/knowledge-qa/upload";
const KB_FEEDBACK_PATH: &str = "/api/workflows/knowledge-base/feedback";

const ERROR_BODY_MAX_CHARS: usize = 200;
const FALLBACK_MIME: &str = "application/octet-stream";

pub struct ApiClient {
    http: Client,
    base_url: String,
    tokens: TokenStore,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, tokens: TokenStore) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    pub fn from_config(config: &ClientConfig, tokens: TokenStore) -> Self {
        Self::new(config.api_base_url.clone(), tokens)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> ApiResult<RequestBuilder> {
        let token = self.tokens.token().ok_or(ApiError::MissingToken)?;
        Ok(request.bearer_auth(token))
    }

    /// Sends the request and maps non-success statuses.
    async fn send(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = self.authorized(request)?.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.rejection(status, &body))
    }

    /// A 401 drops the stored token before the error is returned.
    fn rejection(&self, status: StatusCode, body: &str) -> ApiError {
        match status {
            StatusCode::UNAUTHORIZED => {
                self.tokens.invalidate();
                ApiError::Unauthorized
            }
            StatusCode::NOT_FOUND => ApiError::NotFound,
            _ => {
                tracing::warn!(status = status.as_u16(), "request rejected by service");
                ApiError::Status {
                    status: status.as_u16(),
                    message: error_message(status, body),
                }
            }
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ApiResult<T> {
        let response = self.send(request).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn answer(&self, response: Response, stream: bool) -> ApiResult<AnswerBody> {
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.contains("text/event-stream")
            || (stream && !content_type.contains("application/json"))
        {
            let body: ByteStream = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ApiError::from))
                .boxed();
            return Ok(AnswerBody::Streaming(body));
        }

        let body = response.text().await?;
        parse_completion(&body).map(AnswerBody::Complete)
    }
}

#[async_trait]
impl RemoteService for ApiClient {
    fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated()
    }

    async fn list_conversations(&self) -> ApiResult<Vec<ConversationSummary>> {
        let value: Value = self
            .send_json(self.http.get(self.url(CONVERSATIONS_PATH)))
            .await?;
        Ok(serde_json::from_value(unwrap_list(value))?)
    }

    async fn conversation_messages(&self, id: &str) -> ApiResult<Vec<RemoteMessage>> {
        let path = format!("{CONVERSATIONS_PATH}/{id}/messages");
        let value: Value = self.send_json(self.http.get(self.url(&path))).await?;
        Ok(serde_json::from_value(unwrap_list(value))?)
    }

    async fn save_conversation(&self, conversation: &RemoteConversation) -> ApiResult<String> {
        let reply: Value = self
            .send_json(self.http.post(self.url(CONVERSATIONS_PATH)).json(conversation))
            .await?;
        if reply.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(ApiError::Server(reply_message(&reply)));
        }
        saved_id(&reply).ok_or_else(|| ApiError::Decode("save reply carried no id".into()))
    }

    async fn delete_conversation(&self, id: &str) -> ApiResult<()> {
        let path = format!("{CONVERSATIONS_PATH}/{id}");
        self.send(
            self.http
                .delete(self.url(&path))
                .header(reqwest::header::ACCEPT, "application/json"),
        )
        .await?;
        Ok(())
    }

    async fn ask(&self, request: &QaRequest) -> ApiResult<AnswerBody> {
        let mut builder = self.http.post(self.url(QA_PATH)).json(request);
        if request.stream {
            builder = builder.header(reqwest::header::ACCEPT, "text/event-stream");
        }
        let response = self.send(builder).await?;
        self.answer(response, request.stream).await
    }

    async fn ask_with_file(&self, request: &UploadRequest) -> ApiResult<AnswerBody> {
        let form = upload_form(request)?;
        let response = self
            .send(self.http.post(self.url(QA_UPLOAD_PATH)).multipart(form))
            .await?;
        self.answer(response, request.settings.stream).await
    }

    async fn send_message_feedback(&self, feedback: &MessageFeedback) -> ApiResult<()> {
        self.send(self.http.post(self.url(MESSAGE_FEEDBACK_PATH)).json(feedback))
            .await?;
        Ok(())
    }

    async fn send_knowledge_feedback(&self, feedback: &KnowledgeFeedback) -> ApiResult<()> {
        self.send(self.http.post(self.url(KB_FEEDBACK_PATH)).json(feedback))
            .await?;
        Ok(())
    }
}

fn upload_form(request: &UploadRequest) -> ApiResult<Form> {
    let settings = &request.settings;
    let mut form = Form::new()
        .text("query", request.query.clone())
        .text("use_kb", settings.use_kb.to_string())
        .text("stream", settings.stream.to_string())
        .text("model", settings.model.clone())
        .text("temperature", settings.temperature.to_string())
        .text("max_tokens", settings.max_tokens.to_string());
    if !settings.kb_name.is_empty() {
        form = form.text("kb_name", settings.kb_name.clone());
    }

    let part = match &request.file {
        FilePart::Bytes {
            name,
            mime_type,
            bytes,
        } => file_part(bytes, name, mime_type)?,
        FilePart::Handle {
            uri,
            name,
            mime_type,
        } => {
            form = form.text("file_uri", uri.clone());
            file_part(&[], name, mime_type)?
        }
    };
    Ok(form.part("file", part))
}

/// An unparseable MIME type degrades to `application/octet-stream`.
fn file_part(bytes: &[u8], name: &str, mime_type: &str) -> ApiResult<Part> {
    let part = || Part::bytes(bytes.to_vec()).file_name(name.to_string());
    match part().mime_str(mime_type) {
        Ok(part) => Ok(part),
        Err(err) => {
            tracing::warn!(error = %err, mime = mime_type, "invalid attachment type; sending as binary");
            Ok(part().mime_str(FALLBACK_MIME)?)
        }
    }
}

/// Lists come back bare or wrapped in `data` / `conversations` / `messages`.
fn unwrap_list(value: Value) -> Value {
    match value {
        Value::Object(mut map) => ["data", "conversations", "messages"]
            .iter()
            .find_map(|key| map.remove(*key).filter(Value::is_array))
            .unwrap_or(Value::Array(Vec::new())),
        other => other,
    }
}

fn reply_message(reply: &Value) -> String {
    reply
        .get("message")
        .or_else(|| reply.get("detail"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

/// JSON `message` / `detail` when present, otherwise the start of the body.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let message = value
            .get("message")
            .or_else(|| value.get("detail"))
            .and_then(Value::as_str);
        if let Some(message) = message {
            return message.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed.chars().take(ERROR_BODY_MAX_CHARS).collect()
    }
}

/// Reduces a non-streamed completion to its answer text.
fn parse_completion(body: &str) -> ApiResult<String> {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return Ok(body.to_string());
    };
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(ApiError::Server(reply_message(&value)));
    }

    let answer = [
        "/choices/0/message/content",
        "/data/answer",
        "/data/content",
        "/answer",
        "/content",
        "/response",
    ]
    .iter()
    .find_map(|pointer| value.pointer(pointer).and_then(Value::as_str));

    match answer {
        Some(answer) => Ok(answer.to_string()),
        None => Err(ApiError::Decode("completion carried no answer text".into())),
    }
}
