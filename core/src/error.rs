use reqwest::StatusCode;

pub const DEFAULT_SUPPORT_CONTACT: &str = "your Exemi study coordinator";

/// Failures surfaced by the session and conversation controllers.
///
/// Every variant carries (or can render) the text a front-end shows to the user; see
/// [`ClientError::user_message`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Bad credentials, or an expired/invalid token.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Magic material rejected by the server.
    #[error("onboarding failed: {0}")]
    Onboarding(String),
    /// Transport or connectivity failure; the string is diagnostic, not user-facing.
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// 504 from the streaming reply endpoint.
    #[error("assistant took too long to respond")]
    Timeout,
    #[error("another request is already in progress")]
    Busy,
    #[error("session is not ready for chat")]
    NotReady,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    pub fn user_message(&self, support_contact: &str) -> String {
        match self {
            Self::Auth(message) | Self::Onboarding(message) => message.clone(),
            Self::Server { message, .. } => message.clone(),
            Self::Network(_) | Self::InvalidResponse(_) => system_error(support_contact),
            Self::Timeout => {
                "The assistant took too long to respond. Please try again.".to_string()
            }
            Self::Busy => "Please wait for the current message to finish.".to_string(),
            Self::NotReady => "Please log in before starting a chat.".to_string(),
        }
    }

    /// Builds a [`ClientError::Server`] from a non-2xx status, preferring the body's `detail`.
    pub fn from_status(status: StatusCode, detail: Option<String>, support_contact: &str) -> Self {
        Self::Server {
            status: status.as_u16(),
            message: detail.unwrap_or_else(|| system_error(support_contact)),
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        Self::Network(err.to_string())
    }
}

/// Failure below the HTTP status line: DNS, connect, TLS, a dropped body stream.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self(err.to_string())
    }
}

pub fn system_error(support_contact: &str) -> String {
    format!("System error! Please contact {support_contact}.")
}

pub fn server_unreachable(support_contact: &str) -> String {
    format!("System error! The Exemi server is not running! Please contact {support_contact}.")
}

pub fn session_expired() -> String {
    "Your session has expired. Please log in again.".to_string()
}
