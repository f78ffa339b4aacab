use crate::api::{detail_from, ApiRequest, ApiTransport};
use crate::auth::SessionController;
use crate::decode::ReplyAccumulator;
use crate::error::ClientError;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// System and tool messages stay in the transcript but are never shown.
    pub fn is_visible(&self) -> bool {
        matches!(self.role, MessageRole::User | MessageRole::Assistant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn title(&self) -> String {
        self.created_at
            .with_timezone(&Local)
            .format("%d/%m/%Y, %H:%M:%S")
            .to_string()
    }
}

/// Progress of a single send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPhase {
    #[default]
    Idle,
    /// User message appended locally, not yet acknowledged.
    Sending,
    /// Server returned the persisted transcript.
    Committed,
    /// Assistant reply growing in place.
    Streaming,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Transcript(Vec<Message>),
    Phase(SendPhase),
    Conversations(Vec<Conversation>),
    Active(Option<i64>),
    Error(String),
}

#[derive(Deserialize)]
struct ConversationRecord {
    id: i64,
    created_at: String,
}

#[derive(Deserialize)]
struct ConversationWithMessages {
    id: i64,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    messages: Vec<Message>,
}

/// Accepts RFC 3339 and the naive ISO-8601 form the backend emits; naive means UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|stamp| stamp.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Clears the `busy` flag on drop so it is released on every exit path.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, ClientError> {
        if flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(ClientError::Busy);
        }
        Ok(Self { flag })
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct ChatInner {
    conversations: Vec<Conversation>,
    active: Option<i64>,
    transcript: Vec<Message>,
    phase: SendPhase,
    error: Option<String>,
}

/// Conversation list, active transcript and the two-phase send / stream protocol.
///
/// Inert until the session is [`Ready`](crate::auth::AuthPhase::Ready). Operations that
/// change the transcript hold the busy flag for their whole duration, so a second send
/// cannot start while a reply is still streaming. Failures are surfaced through
/// [`ConversationClient::error`] and leave the existing transcript and selection alone.
#[derive(Clone)]
pub struct ConversationClient {
    session: SessionController,
    api: Arc<dyn ApiTransport>,
    inner: Arc<RwLock<ChatInner>>,
    busy: Arc<AtomicBool>,
    listeners: Arc<Mutex<Vec<UnboundedSender<ChatEvent>>>>,
}

impl ConversationClient {
    pub fn new(session: SessionController) -> Self {
        let api = session.api();
        Self {
            session,
            api,
            inner: Arc::new(RwLock::new(ChatInner::default())),
            busy: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<ChatEvent> {
        let (tx, rx) = unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    pub fn transcript(&self) -> Vec<Message> {
        self.inner.read().transcript.clone()
    }

    pub fn visible_transcript(&self) -> Vec<Message> {
        self.inner
            .read()
            .transcript
            .iter()
            .filter(|message| message.is_visible())
            .cloned()
            .collect()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.read().conversations.clone()
    }

    pub fn active_conversation(&self) -> Option<i64> {
        self.inner.read().active
    }

    pub fn send_phase(&self) -> SendPhase {
        self.inner.read().phase
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    pub fn clear_error(&self) {
        self.inner.write().error = None;
    }

    /// Lists `owner`'s conversations, newest first. Only administrators may list someone
    /// else's.
    pub async fn list_conversations(&self, owner: &str) -> Result<Vec<Conversation>, ClientError> {
        let token = self.session.ready_token().map_err(|err| self.fail(err))?;
        if let Some(user) = self.session.user() {
            if user.username != owner && !user.admin {
                return Err(self.fail(ClientError::Auth(
                    "You are not authorised to view these conversations".to_string(),
                )));
            }
        }

        let response = self
            .api
            .send(ApiRequest::get(format!("/conversations/{owner}")).bearer(token))
            .await
            .map_err(|err| self.fail(err.into()))?;
        if !response.is_success() {
            let err = self.server_error(response.status, response.detail());
            return Err(self.fail(err));
        }
        let records: Vec<ConversationRecord> = response
            .json()
            .map_err(|err| self.fail(ClientError::InvalidResponse(err.to_string())))?;
        let conversations: Vec<Conversation> = records
            .into_iter()
            .filter_map(|record| match parse_timestamp(&record.created_at) {
                Some(created_at) => Some(Conversation {
                    id: record.id,
                    created_at,
                }),
                None => {
                    warn!(id = record.id, raw = %record.created_at, "unparseable created_at");
                    None
                }
            })
            .collect();

        self.inner.write().conversations = conversations.clone();
        self.emit(ChatEvent::Conversations(conversations.clone()));
        Ok(conversations)
    }

    /// Lists the logged-in user's own conversations.
    pub async fn list_own_conversations(&self) -> Result<Vec<Conversation>, ClientError> {
        let user = self
            .session
            .ensure_user()
            .await
            .map_err(|err| self.fail(err))?;
        self.list_conversations(&user.username).await
    }

    /// Replaces the transcript with conversation `id`'s messages. `None` is the unsaved
    /// "new chat" and yields an empty transcript without touching the network.
    pub async fn load_messages(&self, id: Option<i64>) -> Result<Vec<Message>, ClientError> {
        let _busy = BusyGuard::acquire(&self.busy).map_err(|err| self.fail(err))?;
        self.fetch_messages(id).await
    }

    /// Loads `id`'s transcript and makes it the active conversation. A failed load keeps the
    /// previous selection.
    pub async fn select_conversation(&self, id: Option<i64>) -> Result<(), ClientError> {
        let _busy = BusyGuard::acquire(&self.busy).map_err(|err| self.fail(err))?;
        self.fetch_messages(id).await?;
        self.inner.write().active = id;
        self.emit(ChatEvent::Active(id));
        Ok(())
    }

    /// Sends `text` to the active conversation (or a new one when none is selected).
    pub async fn send(&self, text: &str) -> Result<(), ClientError> {
        let active = self.active_conversation();
        self.send_message(active, text).await
    }

    /// Posts a user message, then streams the assistant's reply into the transcript.
    ///
    /// The user message shows up locally before the server sees it. Once the server
    /// acknowledges, its transcript replaces the local one; a placeholder assistant
    /// message is then appended and its content replaced with the accumulated reply after
    /// every chunk. A failed post leaves the optimistic user message in place.
    pub async fn send_message(
        &self,
        conversation_id: Option<i64>,
        text: &str,
    ) -> Result<(), ClientError> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let _busy = BusyGuard::acquire(&self.busy).map_err(|err| self.fail(err))?;
        let token = self.session.ready_token().map_err(|err| self.fail(err))?;
        self.clear_error();

        self.update(|inner| {
            inner.transcript.push(Message::new(MessageRole::User, text));
            inner.phase = SendPhase::Sending;
        });

        let conversation = match self.commit(&token, conversation_id, text).await {
            Ok(conversation) => conversation,
            Err(err) => return Err(self.abort(err)),
        };
        let id = conversation.id;
        let created_at = conversation
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);
        self.update(|inner| {
            inner.transcript = conversation.messages;
            inner.active = Some(id);
            if !inner.conversations.iter().any(|existing| existing.id == id) {
                inner.conversations.insert(0, Conversation { id, created_at });
            }
            inner.phase = SendPhase::Committed;
        });
        if conversation_id != Some(id) {
            info!(id, "conversation created");
            self.emit(ChatEvent::Active(Some(id)));
            self.emit(ChatEvent::Conversations(self.conversations()));
        }

        if let Err(err) = self.stream_reply(&token, id).await {
            return Err(self.abort(err));
        }
        self.set_phase(SendPhase::Idle);
        Ok(())
    }

    /// Deletes conversation `id`. When it was the open conversation, the selection and
    /// transcript are cleared too.
    pub async fn delete_conversation(&self, id: i64) -> Result<(), ClientError> {
        let _busy = BusyGuard::acquire(&self.busy).map_err(|err| self.fail(err))?;
        let token = self.session.ready_token().map_err(|err| self.fail(err))?;
        let response = self
            .api
            .send(ApiRequest::delete(format!("/conversation/{id}")).bearer(token))
            .await
            .map_err(|err| self.fail(err.into()))?;
        if !response.is_success() {
            let err = self.server_error(response.status, response.detail());
            return Err(self.fail(err));
        }

        let (conversations, was_active) = {
            let mut inner = self.inner.write();
            inner.conversations.retain(|conversation| conversation.id != id);
            let was_active = inner.active == Some(id);
            if was_active {
                inner.active = None;
                inner.transcript.clear();
            }
            (inner.conversations.clone(), was_active)
        };
        info!(id, was_active, "conversation deleted");
        if was_active {
            self.emit(ChatEvent::Active(None));
            self.emit(ChatEvent::Transcript(Vec::new()));
        }
        self.emit(ChatEvent::Conversations(conversations));
        Ok(())
    }

    async fn fetch_messages(&self, id: Option<i64>) -> Result<Vec<Message>, ClientError> {
        let Some(id) = id else {
            self.update(|inner| inner.transcript.clear());
            return Ok(Vec::new());
        };
        let token = self.session.ready_token().map_err(|err| self.fail(err))?;
        let response = self
            .api
            .send(ApiRequest::get(format!("/conversation/{id}")).bearer(token))
            .await
            .map_err(|err| self.fail(err.into()))?;
        if !response.is_success() {
            let err = self.server_error(response.status, response.detail());
            return Err(self.fail(err));
        }
        let conversation: ConversationWithMessages = response
            .json()
            .map_err(|err| self.fail(ClientError::InvalidResponse(err.to_string())))?;
        let messages = conversation.messages;
        self.update(|inner| inner.transcript = messages.clone());
        Ok(messages)
    }

    async fn commit(
        &self,
        token: &str,
        conversation_id: Option<i64>,
        text: &str,
    ) -> Result<ConversationWithMessages, ClientError> {
        let path = match conversation_id {
            Some(id) => format!("/conversation/{id}"),
            None => "/conversation".to_string(),
        };
        let response = self
            .api
            .send(
                ApiRequest::post(path)
                    .bearer(token)
                    .json(json!({ "message_text": text })),
            )
            .await?;
        if !response.is_success() {
            return Err(self.server_error(response.status, response.detail()));
        }
        response
            .json()
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))
    }

    async fn stream_reply(&self, token: &str, id: i64) -> Result<(), ClientError> {
        self.update(|inner| {
            inner
                .transcript
                .push(Message::new(MessageRole::Assistant, String::new()));
            inner.phase = SendPhase::Streaming;
        });

        let request = ApiRequest::get(format!("/conversation_stream_reply/{id}")).bearer(token);
        let response = match self.api.stream(request).await {
            Ok(response) => response,
            Err(err) => {
                self.drop_empty_placeholder();
                return Err(err.into());
            }
        };
        if !response.is_success() {
            self.drop_empty_placeholder();
            if response.status == StatusCode::GATEWAY_TIMEOUT {
                warn!(id, "assistant reply timed out upstream");
                return Err(ClientError::Timeout);
            }
            let status = response.status;
            let body = response.collect_body().await;
            return Err(self.server_error(status, detail_from(&body)));
        }

        let mut body = response.body;
        let mut reply = ReplyAccumulator::new();
        let mut chunks = 0usize;
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    chunks += 1;
                    let text = reply.push(&bytes).to_string();
                    self.replace_reply(text);
                }
                Err(err) => {
                    warn!(id, chunks, %err, "reply stream broke off");
                    self.drop_empty_placeholder();
                    return Err(err.into());
                }
            }
        }
        let before = reply.text().len();
        let text = reply.finish().to_string();
        if text.len() != before {
            self.replace_reply(text);
        }
        debug!(id, chunks, "reply stream finished");
        Ok(())
    }

    fn replace_reply(&self, text: String) {
        self.update(|inner| {
            if let Some(last) = inner.transcript.last_mut() {
                if last.role == MessageRole::Assistant {
                    last.content = text;
                }
            }
        });
    }

    fn drop_empty_placeholder(&self) {
        self.update(|inner| {
            if inner
                .transcript
                .last()
                .is_some_and(|last| last.role == MessageRole::Assistant && last.content.is_empty())
            {
                inner.transcript.pop();
            }
        });
    }

    /// Applies a transcript mutation and publishes the result.
    fn update(&self, apply: impl FnOnce(&mut ChatInner)) {
        let (transcript, phase) = {
            let mut inner = self.inner.write();
            let before = inner.phase;
            apply(&mut inner);
            let phase = (inner.phase != before).then_some(inner.phase);
            (inner.transcript.clone(), phase)
        };
        self.emit(ChatEvent::Transcript(transcript));
        if let Some(phase) = phase {
            self.emit(ChatEvent::Phase(phase));
        }
    }

    fn set_phase(&self, phase: SendPhase) {
        self.inner.write().phase = phase;
        self.emit(ChatEvent::Phase(phase));
    }

    /// Ends a send with an error: `Errored` is published, then the client returns to idle.
    fn abort(&self, err: ClientError) -> ClientError {
        self.set_phase(SendPhase::Errored);
        let err = self.fail(err);
        self.set_phase(SendPhase::Idle);
        err
    }

    fn fail(&self, err: ClientError) -> ClientError {
        let message = err.user_message(&self.session.config().support_contact);
        warn!(%err, "chat operation failed");
        self.inner.write().error = Some(message.clone());
        self.emit(ChatEvent::Error(message));
        err
    }

    fn server_error(&self, status: StatusCode, detail: Option<String>) -> ClientError {
        ClientError::from_status(status, detail, &self.session.config().support_contact)
    }

    fn emit(&self, event: ChatEvent) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}
