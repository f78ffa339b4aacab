pub mod admin;
pub mod api;
pub mod auth;
pub mod config;
pub mod conversation;
pub mod decode;
pub mod error;
pub mod mock;
pub mod store;
pub mod telemetry;

pub use admin::AdminClient;
pub use api::{ApiRequest, ApiResponse, ApiTransport, HttpTransport, Method};
pub use auth::{AuthPhase, MagicFailurePolicy, MagicValidity, Session, SessionController, User};
pub use config::ClientConfig;
pub use conversation::{ChatEvent, Conversation, ConversationClient, Message, MessageRole, SendPhase};
pub use error::ClientError;
pub use mock::{MockReply, MockTransport};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
