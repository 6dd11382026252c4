use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::model::Reservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Books, pays for and cancels their own reservations.
    Customer,
    /// Manages courts and may act on any reservation.
    Admin,
}

/// Who is issuing a command: the login user and their role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub principal: String,
    pub role: Role,
}

impl Caller {
    pub fn customer(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            role: Role::Customer,
        }
    }

    pub fn admin(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admins see everything; customers only their own reservations.
    pub fn can_access(&self, reservation: &Reservation) -> bool {
        self.is_admin() || reservation.principal == self.principal
    }
}

/// Cleartext password check. A user listed in `users` must use their own
/// password; anyone else logs in with the shared password. The login user
/// becomes the booking principal.
#[derive(Debug)]
pub struct CourtsideAuthSource {
    shared_password: String,
    users: HashMap<String, String>,
}

impl CourtsideAuthSource {
    pub fn new(shared_password: String, users: HashMap<String, String>) -> Self {
        Self {
            shared_password,
            users,
        }
    }

    fn password_for(&self, user: Option<&str>) -> &str {
        user.and_then(|u| self.users.get(u))
            .map(String::as_str)
            .unwrap_or(&self.shared_password)
    }
}

#[async_trait]
impl AuthSource for CourtsideAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let password = self.password_for(login.user().as_deref());
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}

/// Parse `user:password,user2:password2`. Blank entries are skipped.
pub fn parse_users(list: &str) -> Result<HashMap<String, String>, String> {
    let mut users = HashMap::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (user, password) = entry
            .split_once(':')
            .ok_or_else(|| format!("expected user:password, got {entry:?}"))?;
        if user.is_empty() {
            return Err(format!("empty user name in {entry:?}"));
        }
        users.insert(user.to_string(), password.to_string());
    }
    Ok(users)
}

/// Parse a comma separated list of admin user names.
pub fn parse_admins(list: &str) -> HashSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}
