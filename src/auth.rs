use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::model::is_email;

/// Connection password check.
///
/// Every session shares one password. The startup `user` names the account each
/// query acts as (an email or a user id), or the email the session is about to
/// register, so anything else is turned away before the password exchange.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// The session login, if it can name an account.
fn session_login(user: Option<&str>) -> Result<&str, String> {
    match user.map(str::trim) {
        None | Some("") => Err("a startup user is required".into()),
        Some(login) if is_email(login) || login.parse::<Ulid>().is_ok() => Ok(login),
        Some(login) => Err(format!("login {login:?} is neither an email nor a user id")),
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let login = session_login(login.user()).map_err(|message| {
            tracing::warn!("rejected session: {message}");
            PgWireError::UserError(Box::new(ErrorInfo::new("FATAL".into(), "28000".into(), message)))
        })?;
        tracing::debug!(login, "password check");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
