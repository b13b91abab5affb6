use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Cleartext password check against the single configured server password.
/// The user name is not consulted.
#[derive(Debug)]
pub struct SessiondAuthSource {
    password: String,
}

impl SessiondAuthSource {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthSource for SessiondAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), "password lookup");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
