use crate::api::{ApiRequest, ApiResponse, ApiTransport};
use crate::config::ClientConfig;
use crate::error::{self, ClientError};
use crate::store::{self, SessionStore};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub university_name: Option<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// Locally cached credential. `user_id` and `user` only mean something while `token` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub token: Option<String>,
    pub user_id: Option<i64>,
    pub user: Option<User>,
}

impl Session {
    pub fn is_logged_in(&self) -> bool {
        self.token.is_some()
    }
}

/// Whether the user's magic (linked external credential) has been accepted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MagicValidity {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    LoggedOut,
    Authenticating,
    Onboarding,
    Ready,
}

/// What a failed magic check does to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagicFailurePolicy {
    /// Treat the failure as invalid credential material and log out.
    #[default]
    LogOut,
    /// Keep the session and ask the user for new magic.
    Onboard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Changed(AuthPhase),
    Notice(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Check {
    Credential,
    Magic,
    Profile,
}

#[derive(Default)]
struct SessionInner {
    session: Session,
    magic: MagicValidity,
    /// Token each check is currently running for.
    in_flight: HashMap<Check, String>,
    notice: Option<String>,
}

impl SessionInner {
    fn phase(&self) -> AuthPhase {
        if self.session.token.is_none() {
            return AuthPhase::LoggedOut;
        }
        match self.magic {
            MagicValidity::Unknown => AuthPhase::Authenticating,
            MagicValidity::Invalid => AuthPhase::Onboarding,
            MagicValidity::Valid => AuthPhase::Ready,
        }
    }

    fn is_current(&self, token: &str) -> bool {
        self.session.token.as_deref() == Some(token)
    }
}

/// Clears the in-flight marker for a check when the request finishes or is dropped.
struct Flight {
    inner: Arc<RwLock<SessionInner>>,
    check: Check,
    token: String,
}

impl Drop for Flight {
    fn drop(&mut self) {
        let mut inner = self.inner.write();
        if inner.in_flight.get(&self.check) == Some(&self.token) {
            inner.in_flight.remove(&self.check);
        }
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    user_id: Option<IdField>,
    #[serde(default)]
    user: Option<UserField>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdField {
    Number(i64),
    Text(String),
}

impl IdField {
    fn value(&self) -> Option<i64> {
        match self {
            Self::Number(id) => Some(*id),
            Self::Text(raw) => raw.trim().parse().ok(),
        }
    }
}

/// The login endpoint has returned both the full user and a bare id under `user`.
#[derive(Deserialize)]
#[serde(untagged)]
enum UserField {
    Full(User),
    Id(i64),
}

/// Owns the [`Session`] and drives the login / magic-validation / onboarding state machine.
///
/// The phase is derived from the session and [`MagicValidity`]; nothing else is stored.
/// Every network check is tagged with the token it was issued for: a result that comes
/// back after the token changed is discarded, and a second request for the same check and
/// token is not issued while the first is outstanding.
#[derive(Clone)]
pub struct SessionController {
    api: Arc<dyn ApiTransport>,
    store: Arc<dyn SessionStore>,
    config: Arc<ClientConfig>,
    inner: Arc<RwLock<SessionInner>>,
    listeners: Arc<Mutex<Vec<UnboundedSender<SessionEvent>>>>,
}

impl SessionController {
    /// Seeds the session from `store`.
    pub fn new(
        api: Arc<dyn ApiTransport>,
        store: Arc<dyn SessionStore>,
        config: ClientConfig,
    ) -> Self {
        let session = store::read_session(store.as_ref());
        if session.is_logged_in() {
            info!(user_id = ?session.user_id, "restored saved session");
        }
        Self {
            api,
            store,
            config: Arc::new(config),
            inner: Arc::new(RwLock::new(SessionInner {
                session,
                ..SessionInner::default()
            })),
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        let (tx, rx) = unbounded_channel();
        self.listeners.lock().push(tx);
        rx
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn api(&self) -> Arc<dyn ApiTransport> {
        self.api.clone()
    }

    pub fn session(&self) -> Session {
        self.inner.read().session.clone()
    }

    pub fn user(&self) -> Option<User> {
        self.inner.read().session.user.clone()
    }

    pub fn phase(&self) -> AuthPhase {
        self.inner.read().phase()
    }

    pub fn magic_validity(&self) -> MagicValidity {
        self.inner.read().magic
    }

    /// The last message surfaced to the user, if it has not been cleared.
    pub fn notice(&self) -> Option<String> {
        self.inner.read().notice.clone()
    }

    pub fn clear_notice(&self) {
        self.inner.write().notice = None;
    }

    /// Bearer token for chat operations, only handed out once the session is ready.
    pub fn ready_token(&self) -> Result<String, ClientError> {
        let inner = self.inner.read();
        match (inner.phase(), &inner.session.token) {
            (AuthPhase::Ready, Some(token)) => Ok(token.clone()),
            _ => Err(ClientError::NotReady),
        }
    }

    pub async fn log_in(&self, username: &str, password: &str) -> Result<Session, ClientError> {
        let request =
            ApiRequest::post("/login").form(&[("username", username), ("password", password)]);
        let response = match self.api.send(request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, "login request failed");
                self.surface(error::server_unreachable(&self.config.support_contact));
                return Err(err.into());
            }
        };
        if !response.is_success() {
            let message = self.detail_or_system_error(&response);
            self.surface(message.clone());
            return Err(ClientError::Auth(message));
        }
        let body: LoginResponse = response.json().map_err(|err| {
            warn!(%err, "login response did not parse");
            self.surface(error::system_error(&self.config.support_contact));
            ClientError::InvalidResponse(err.to_string())
        })?;

        let (user_id, user) = match body.user {
            Some(UserField::Full(user)) => (
                body.user_id.and_then(|id| id.value()).or(Some(user.id)),
                Some(user),
            ),
            Some(UserField::Id(id)) => (body.user_id.and_then(|id| id.value()).or(Some(id)), None),
            None => (body.user_id.and_then(|id| id.value()), None),
        };
        let session = Session {
            token: Some(body.access_token),
            user_id,
            user,
        };
        {
            let mut inner = self.inner.write();
            inner.session = session.clone();
            inner.magic = MagicValidity::Unknown;
            inner.in_flight.clear();
            inner.notice = None;
            self.persist(&inner.session);
        }
        info!(user_id = ?session.user_id, "logged in");
        self.emit(SessionEvent::Changed(AuthPhase::Authenticating));
        Ok(session)
    }

    /// Clears the whole session; calling it while logged out does nothing.
    pub fn log_out(&self) {
        self.clear_session(None, None);
    }

    /// Runs whatever the current phase still needs: the credential and magic checks while
    /// authenticating, then the user profile once ready. Idempotent.
    pub async fn reconcile(&self) -> Result<AuthPhase, ClientError> {
        if self.phase() == AuthPhase::Authenticating {
            let (credential, magic) =
                tokio::join!(self.validate_credential(), self.check_magic_validity());
            credential?;
            magic?;
        }
        if self.phase() == AuthPhase::Ready && self.user().is_none() {
            match self.ensure_user().await {
                Ok(_) => {}
                Err(ClientError::NotReady) => debug!("user profile fetch still pending"),
                Err(err) => return Err(err),
            }
        }
        Ok(self.phase())
    }

    /// Asks the server whether the token is still accepted. Anything but a 2xx, including a
    /// transport failure, logs the session out.
    pub async fn validate_credential(&self) -> Result<(), ClientError> {
        let Some(flight) = self.begin(Check::Credential) else {
            return Ok(());
        };
        let token = flight.token.clone();
        let outcome = self
            .api
            .send(ApiRequest::get("/users/self").bearer(&token))
            .await;

        // The in-flight marker is held until the outcome below has been applied.
        let _flight = flight;
        match outcome {
            Ok(response) if response.is_success() => {
                if let Ok(user) = response.json::<User>() {
                    self.adopt_user(&token, user);
                }
                Ok(())
            }
            Ok(response) => {
                warn!(status = %response.status, "credential rejected");
                self.expire(&token)
            }
            Err(err) => {
                warn!(%err, "credential check failed");
                self.expire(&token)
            }
        }
    }

    /// Resolves [`MagicValidity`] for the current token. Only runs while it is unknown.
    pub async fn check_magic_validity(&self) -> Result<MagicValidity, ClientError> {
        let Some(flight) = self.begin(Check::Magic) else {
            return Ok(self.magic_validity());
        };
        let token = flight.token.clone();
        let outcome = self
            .api
            .send(ApiRequest::get("/magic_valid").bearer(&token))
            .await;
        let _flight = flight;

        let detail = match outcome {
            Ok(response) if response.is_success() => {
                if self.set_magic(&token, MagicValidity::Valid) {
                    info!("magic accepted");
                    self.emit(SessionEvent::Changed(AuthPhase::Ready));
                }
                return Ok(self.magic_validity());
            }
            Ok(response) => {
                warn!(status = %response.status, "magic rejected");
                response.detail()
            }
            Err(err) => {
                warn!(%err, "magic check failed");
                None
            }
        };

        if !self.set_magic(&token, MagicValidity::Invalid) {
            return Ok(self.magic_validity());
        }
        match self.config.magic_failure {
            MagicFailurePolicy::LogOut => {
                let message = error::system_error(&self.config.support_contact);
                self.clear_session(Some(&token), Some(message.clone()));
                Err(ClientError::Auth(message))
            }
            MagicFailurePolicy::Onboard => {
                let message = detail.unwrap_or_else(|| {
                    "Please link your university account to continue.".to_string()
                });
                self.surface(message);
                self.emit(SessionEvent::Changed(AuthPhase::Onboarding));
                Ok(MagicValidity::Invalid)
            }
        }
    }

    /// Sends new magic material. On success validity goes back to unknown and is checked
    /// again straight away; the phase after that check is returned.
    pub async fn submit_magic(&self, magic: &str) -> Result<AuthPhase, ClientError> {
        let token = self
            .session()
            .token
            .ok_or_else(|| ClientError::Auth(error::session_expired()))?;
        let body = json!({
            "magic": magic,
            "university_name": self.config.university_name,
        });
        let outcome = self
            .api
            .send(ApiRequest::patch("/users/self").bearer(&token).json(body))
            .await;
        let response = match outcome {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                let message = self.detail_or_system_error(&response);
                self.surface(message.clone());
                return Err(ClientError::Onboarding(message));
            }
            Err(err) => {
                warn!(%err, "magic submission failed");
                let message = error::system_error(&self.config.support_contact);
                self.surface(message.clone());
                return Err(ClientError::Onboarding(message));
            }
        };

        if let Ok(user) = response.json::<User>() {
            self.adopt_user(&token, user);
        }
        if self.set_magic(&token, MagicValidity::Unknown) {
            self.clear_notice();
            self.emit(SessionEvent::Changed(AuthPhase::Authenticating));
            if let Err(err) = self.check_magic_validity().await {
                debug!(%err, "re-validation after onboarding failed");
            }
        }
        Ok(self.phase())
    }

    /// Fetches the user profile when the session has none; a failure logs out.
    ///
    /// `NotReady` means another fetch for the same token is still outstanding, or the token
    /// changed while this one ran.
    pub async fn ensure_user(&self) -> Result<User, ClientError> {
        if let Some(user) = self.user() {
            return Ok(user);
        }
        let Some(flight) = self.begin(Check::Profile) else {
            return Err(ClientError::NotReady);
        };
        let token = flight.token.clone();
        let outcome = self
            .api
            .send(ApiRequest::get("/users/self").bearer(&token))
            .await;
        let _flight = flight;

        let user = match outcome {
            Ok(response) if response.is_success() => response.json::<User>().ok(),
            Ok(response) => {
                warn!(status = %response.status, "user profile rejected");
                None
            }
            Err(err) => {
                warn!(%err, "user profile fetch failed");
                None
            }
        };
        match user {
            Some(user) if self.adopt_user(&token, user.clone()) => Ok(user),
            Some(_) => Err(ClientError::NotReady),
            None => {
                self.expire(&token)?;
                Err(ClientError::NotReady)
            }
        }
    }

    /// Marks `check` as running for the current token. `None` when logged out, when the
    /// same check is already outstanding for this token, or when there is nothing to check.
    fn begin(&self, check: Check) -> Option<Flight> {
        let mut inner = self.inner.write();
        let token = inner.session.token.clone()?;
        if check == Check::Magic && inner.magic != MagicValidity::Unknown {
            return None;
        }
        if inner.in_flight.get(&check) == Some(&token) {
            debug!(?check, "check already in flight");
            return None;
        }
        inner.in_flight.insert(check, token.clone());
        Some(Flight {
            inner: self.inner.clone(),
            check,
            token,
        })
    }

    fn set_magic(&self, token: &str, magic: MagicValidity) -> bool {
        let mut inner = self.inner.write();
        if !inner.is_current(token) {
            debug!(?magic, "discarding stale magic result");
            return false;
        }
        inner.magic = magic;
        true
    }

    fn adopt_user(&self, token: &str, user: User) -> bool {
        let mut inner = self.inner.write();
        if !inner.is_current(token) {
            return false;
        }
        if inner.session.user.as_ref() != Some(&user) {
            inner.session.user_id = Some(user.id);
            inner.session.user = Some(user);
            self.persist(&inner.session);
        }
        true
    }

    fn expire(&self, token: &str) -> Result<(), ClientError> {
        let message = error::session_expired();
        if self.clear_session(Some(token), Some(message.clone())) {
            Err(ClientError::Auth(message))
        } else {
            debug!("discarding stale credential failure");
            Ok(())
        }
    }

    /// Drops token, user id and user together. With `only_for`, nothing happens unless that
    /// token is still the current one. Returns whether a session was cleared.
    fn clear_session(&self, only_for: Option<&str>, notice: Option<String>) -> bool {
        let cleared = {
            let mut inner = self.inner.write();
            if let Some(token) = only_for {
                if !inner.is_current(token) {
                    return false;
                }
            }
            let was_logged_in = inner.session.is_logged_in();
            inner.session = Session::default();
            inner.magic = MagicValidity::Unknown;
            inner.in_flight.clear();
            if notice.is_some() {
                inner.notice = notice.clone();
            }
            if was_logged_in {
                self.persist(&inner.session);
            }
            was_logged_in
        };
        if cleared {
            info!(forced = only_for.is_some(), "logged out");
            self.emit(SessionEvent::Changed(AuthPhase::LoggedOut));
        }
        if let Some(message) = notice {
            self.emit(SessionEvent::Notice(message));
        }
        cleared
    }

    fn surface(&self, message: String) {
        self.inner.write().notice = Some(message.clone());
        self.emit(SessionEvent::Notice(message));
    }

    fn detail_or_system_error(&self, response: &ApiResponse) -> String {
        response
            .detail()
            .unwrap_or_else(|| error::system_error(&self.config.support_contact))
    }

    fn persist(&self, session: &Session) {
        if let Err(err) = store::write_session(self.store.as_ref(), session) {
            warn!(%err, "failed to persist session");
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}
