//! Login sessions. Identity-provider token verification happens upstream; this
//! module receives verified profile claims, applies the allow-list, and hands
//! out opaque bearer tokens.
//!
//! A user holds at most one live token: logging in again revokes the previous
//! one, which keeps the table bounded by the number of users and ties the
//! single per-user study session to a single login.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::{header, HeaderMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{AppError, Result};
use crate::models::{User, UserProfile};

#[derive(Default)]
struct TokenTable {
    by_token: HashMap<String, i64>,
    by_user: HashMap<i64, String>,
}

#[derive(Clone)]
pub struct Auth {
    db: Db,
    allowed_users: Arc<Vec<String>>,
    tokens: Arc<RwLock<TokenTable>>,
}

impl Auth {
    pub fn new(db: Db, allowed_users: Vec<String>) -> Self {
        Self {
            db,
            allowed_users: Arc::new(allowed_users),
            tokens: Arc::new(RwLock::new(TokenTable::default())),
        }
    }

    fn is_allowed(&self, email: &str) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.iter().any(|e| e == email)
    }

    /// Upserts the user behind the profile and issues a new token, revoking
    /// the user's previous one.
    pub async fn login(&self, profile: UserProfile) -> Result<(String, User)> {
        let email = profile
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AppError::BadRequest("cannot create user without email".to_string()))?;

        if !self.is_allowed(email) {
            log::warn!("Login attempt blocked for non-whitelisted user: {}", email);
            return Err(AppError::Forbidden(
                "this email is not authorized to access the closed beta".to_string(),
            ));
        }

        let name = profile.name.as_deref().unwrap_or(email);
        let user = self
            .db
            .upsert_user(email, name, profile.picture.as_deref())
            .await?;

        let token = Uuid::new_v4().to_string();
        let mut tokens = self.tokens.write().await;
        if let Some(previous) = tokens.by_user.insert(user.id, token.clone()) {
            tokens.by_token.remove(&previous);
            log::info!("Replaced previous login token for user {}", user.id);
        }
        tokens.by_token.insert(token.clone(), user.id);
        drop(tokens);

        Ok((token, user))
    }

    /// Resolves the bearer token in `headers` to a user id.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<i64> {
        let token = bearer_token(headers).ok_or(AppError::Unauthorized)?;
        self.tokens
            .read()
            .await
            .by_token
            .get(token)
            .copied()
            .ok_or(AppError::Unauthorized)
    }

    /// Invalidates the token and returns the user it belonged to.
    pub async fn logout(&self, headers: &HeaderMap) -> Result<i64> {
        let token = bearer_token(headers).ok_or(AppError::Unauthorized)?;
        let mut tokens = self.tokens.write().await;
        let user_id = tokens.by_token.remove(token).ok_or(AppError::Unauthorized)?;
        tokens.by_user.remove(&user_id);
        drop(tokens);

        log::info!("User {} logged out", user_id);
        Ok(user_id)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
