//! Session tokens and connection identity.
//!
//! Tokens are opaque random strings handed out once; only their SHA-256
//! digest is stored.

use anyhow::Result;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use coderoom_common::User;
use sha2::{Digest, Sha256};

use super::db::DbHandle;
use super::presence::ConnId;
use crate::errors::CollabError;

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn new_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Create a session for `user_id` and return the plaintext token.
pub async fn issue_session(db: &DbHandle, user_id: &str) -> Result<String> {
    let token = new_token();
    let digest = hash_token(&token);
    let user_id = user_id.to_string();
    db.call(move |db| db.create_session(&user_id, &digest)).await?;
    Ok(token)
}

/// Resolve a token to its user. Missing, empty and unknown tokens all
/// resolve to `None`.
pub async fn authenticate(db: &DbHandle, token: Option<&str>) -> Result<Option<User>> {
    let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    let digest = hash_token(token);
    db.call(move |db| db.user_for_token_hash(&digest)).await
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Identity attached to one live connection for its whole lifetime.
#[derive(Debug, Clone)]
pub struct Session {
    pub conn_id: ConnId,
    pub user: Option<User>,
}

impl Session {
    pub fn require_user(&self) -> Result<&User, CollabError> {
        self.user.as_ref().ok_or(CollabError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::db::RoomDb;
    use axum::http::HeaderValue;

    fn test_db() -> DbHandle {
        DbHandle::new(RoomDb::new_in_memory().unwrap())
    }

    #[test]
    fn test_hash_token_is_hex_sha256() {
        let digest = hash_token("abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_new_tokens_are_unique() {
        let a = new_token();
        let b = new_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_issued_token_authenticates() {
        let db = test_db();
        let user = db
            .lock_sync()
            .unwrap()
            .create_user("ada@example.com", "Ada", None)
            .unwrap()
            .unwrap();
        let token = issue_session(&db, &user.id).await.unwrap();

        let resolved = authenticate(&db, Some(&token)).await.unwrap().unwrap();
        assert_eq!(resolved.id, user.id);
    }

    #[tokio::test]
    async fn test_plaintext_token_is_not_stored() {
        let db = test_db();
        let user = db
            .lock_sync()
            .unwrap()
            .create_user("ada@example.com", "Ada", None)
            .unwrap()
            .unwrap();
        let token = issue_session(&db, &user.id).await.unwrap();
        let by_plain = db.lock_sync().unwrap().user_for_token_hash(&token).unwrap();
        assert!(by_plain.is_none());
    }

    #[tokio::test]
    async fn test_missing_or_unknown_token_is_anonymous() {
        let db = test_db();
        assert!(authenticate(&db, None).await.unwrap().is_none());
        assert!(authenticate(&db, Some("  ")).await.unwrap().is_none());
        assert!(authenticate(&db, Some("nope")).await.unwrap().is_none());
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers), Some("abc123"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_anonymous_session_requires_login() {
        let session = Session {
            conn_id: 1,
            user: None,
        };
        assert!(matches!(session.require_user(), Err(CollabError::Unauthorized)));
    }
}
