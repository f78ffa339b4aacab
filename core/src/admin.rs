use crate::api::{ApiRequest, ApiResponse, ApiTransport};
use crate::auth::{SessionController, User};
use crate::error::ClientError;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

const NOT_AUTHORISED: &str = "You are not authorised to manage user accounts";

/// User administration for admin accounts.
#[derive(Clone)]
pub struct AdminClient {
    session: SessionController,
    api: Arc<dyn ApiTransport>,
}

impl AdminClient {
    pub fn new(session: SessionController) -> Self {
        let api = session.api();
        Self { session, api }
    }

    pub async fn list_users(&self) -> Result<Vec<User>, ClientError> {
        let token = self.admin_token().await?;
        let response = self
            .api
            .send(ApiRequest::get("/users").bearer(token))
            .await?;
        if !response.is_success() {
            return Err(self.server_error(&response));
        }
        response
            .json()
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))
    }

    /// Participants only; administrators are filtered out.
    pub async fn non_admin_users(&self) -> Result<Vec<User>, ClientError> {
        let mut users = self.list_users().await?;
        users.retain(|user| !user.admin);
        Ok(users)
    }

    pub async fn create_user(&self, username: &str, password: &str) -> Result<User, ClientError> {
        let token = self.admin_token().await?;
        let body = json!({ "username": username, "password": password });
        let response = self
            .api
            .send(ApiRequest::post("/users").bearer(token).json(body))
            .await?;
        if !response.is_success() {
            return Err(self.server_error(&response));
        }
        let user: User = response
            .json()
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
        info!(user_id = user.id, "user account created");
        Ok(user)
    }

    async fn admin_token(&self) -> Result<String, ClientError> {
        let token = self.session.ready_token()?;
        let user = self.session.ensure_user().await?;
        if !user.admin {
            return Err(ClientError::Auth(NOT_AUTHORISED.to_string()));
        }
        Ok(token)
    }

    fn server_error(&self, response: &ApiResponse) -> ClientError {
        ClientError::from_status(
            response.status,
            response.detail(),
            &self.session.config().support_contact,
        )
    }
}
