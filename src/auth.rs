use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;
use ulid::Ulid;

use crate::engine::Directory;
use crate::model::{Actor, EmployeeKind};
use crate::observability::AUTH_FAILURES_TOTAL;

/// Why a login name could not be turned into a caller.
#[derive(Debug, PartialEq, Eq)]
pub enum IdentityError {
    /// Neither the admin name nor a ULID.
    Malformed(String),
    /// A registered employee that has been deactivated.
    Inactive(Ulid),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Malformed(user) => write!(f, "unknown user {user:?}: expected the admin name or a ULID"),
            IdentityError::Inactive(id) => write!(f, "employee {id} is inactive"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Map the startup `user` to a role. Employees are looked up on every call
/// so activation and promotion take effect without reconnecting.
pub fn resolve_actor(user: &str, admin_user: &str, directory: &Directory) -> Result<Actor, IdentityError> {
    if user == admin_user {
        return Ok(Actor::admin());
    }
    let id = Ulid::from_string(user).map_err(|_| IdentityError::Malformed(user.to_string()))?;
    match directory.employee(&id) {
        None => Ok(Actor::customer(id)),
        Some(e) if !e.active => Err(IdentityError::Inactive(id)),
        Some(e) if e.kind == EmployeeKind::Super => Ok(Actor::supervisor(id)),
        Some(_) => Ok(Actor::employee(id)),
    }
}

fn login_name_valid(user: &str, admin_user: &str) -> bool {
    user == admin_user || Ulid::from_string(user).is_ok()
}

/// Shared-secret password check. Login names that can never resolve to a
/// caller are refused before the password exchange.
#[derive(Debug)]
pub struct SlotbayAuthSource {
    password: String,
    admin_user: String,
}

impl SlotbayAuthSource {
    pub fn new(password: String, admin_user: String) -> Self {
        Self { password, admin_user }
    }
}

#[async_trait]
impl AuthSource for SlotbayAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let login_user = login.user();
        let user = login_user.as_deref().unwrap_or_default();
        if !login_name_valid(user, &self.admin_user) {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            warn!(user, "login refused: unrecognised user name");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                IdentityError::Malformed(user.to_string()).to_string(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
