use anyhow::{Context, Result};
use exemi_core::config::ClientConfig;
use exemi_core::{
    AdminClient, ChatEvent, ConversationClient, FileSessionStore, HttpTransport, Message,
    MessageRole, SendPhase, SessionController,
};
use std::sync::Arc;
use tracing::info;

pub fn role_badge(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "System",
        MessageRole::User => "You",
        MessageRole::Assistant => "Exemi",
        MessageRole::Tool => "Tool",
    }
}

/// Session, chat and admin clients wired to the configured backend and the on-disk store.
pub struct ExemiApp {
    pub session: SessionController,
    pub chat: ConversationClient,
    pub admin: AdminClient,
}

impl ExemiApp {
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let store_path = match &config.store_path {
            Some(path) => path.clone(),
            None => FileSessionStore::default_path()
                .context("no data directory available for the session store")?,
        };
        info!(backend = %config.backend_url, store = %store_path.display(), "starting exemi");
        let transport = HttpTransport::new(&config.backend_url);
        let store = FileSessionStore::open(store_path);
        let session = SessionController::new(Arc::new(transport), Arc::new(store), config);
        let chat = ConversationClient::new(session.clone());
        let admin = AdminClient::new(session.clone());
        Ok(Self {
            session,
            chat,
            admin,
        })
    }
}

pub fn format_message(message: &Message) -> String {
    format!("{}: {}", role_badge(message.role), message.content)
}

/// Turns [`ChatEvent`]s into terminal output, printing only what each streamed snapshot
/// added to the assistant reply.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    streaming: bool,
    printed: usize,
}

impl TranscriptPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render(&mut self, event: &ChatEvent) -> Option<String> {
        match event {
            ChatEvent::Phase(SendPhase::Streaming) => {
                self.streaming = true;
                self.printed = 0;
                Some(format!("{}: ", role_badge(MessageRole::Assistant)))
            }
            ChatEvent::Phase(SendPhase::Idle) if self.streaming => {
                self.streaming = false;
                Some("\n".to_string())
            }
            ChatEvent::Transcript(messages) if self.streaming => {
                let last = messages.last().filter(|last| last.role == MessageRole::Assistant)?;
                let added = last.content.get(self.printed..)?;
                if added.is_empty() {
                    return None;
                }
                self.printed = last.content.len();
                Some(added.to_string())
            }
            ChatEvent::Error(message) => Some(format!("\n! {message}\n")),
            _ => None,
        }
    }
}
