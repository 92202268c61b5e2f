//! Credential data model and its persisted layout
//!
//! A session is spread across the store keys in `constants`: the token pair,
//! the serialized user and profile, and the access token expiry. The helpers
//! here are the only code that knows that layout.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::KeyValueStore;
use crate::constants::{
    ACCESS_TOKEN_KEY, PROFILE_KEY, REFRESH_TOKEN_KEY, SESSION_KEYS, TOKEN_EXPIRY_KEY,
    USER_INFO_KEY,
};
use crate::error::{Error, Result};

/// Access + refresh token issued by login or refresh.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &common::fingerprint(&self.access_token))
            .field("refresh_token", &common::fingerprint(&self.refresh_token))
            .finish()
    }
}

/// Signed-in user as returned by login. Opaque to the refresh machinery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    /// Numeric or string id, kept as the server sent it
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default, alias = "account_type")]
    pub account_type: Option<String>,
    #[serde(default, alias = "subscription_flag")]
    pub subscription_flag: Option<bool>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Normalized outcome of a successful login.
#[derive(Debug, Clone)]
pub struct LoginResult {
    pub tokens: TokenPair,
    pub user: Option<UserRecord>,
    pub profile: Option<serde_json::Value>,
}

/// Everything a previous run left in the store.
#[derive(Debug, Clone, Default)]
pub struct StoredSession {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user: Option<UserRecord>,
    pub profile: Option<serde_json::Value>,
    /// Access token expiry, unix milliseconds
    pub expires_at: Option<u64>,
}

impl StoredSession {
    /// Read all session keys. Unparseable user/profile/expiry values are
    /// logged and treated as absent rather than failing the whole restore.
    pub async fn load(store: &dyn KeyValueStore) -> Result<Self> {
        let access_token = store.get(ACCESS_TOKEN_KEY).await?;
        let refresh_token = store.get(REFRESH_TOKEN_KEY).await?;
        let user = match store.get(USER_INFO_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)
                .inspect_err(|e| warn!(error = %e, "discarding unreadable stored user"))
                .ok(),
            None => None,
        };
        let profile = match store.get(PROFILE_KEY).await? {
            Some(raw) => serde_json::from_str(&raw)
                .inspect_err(|e| warn!(error = %e, "discarding unreadable stored profile"))
                .ok(),
            None => None,
        };
        let expires_at = load_expiry(store).await?;

        Ok(Self {
            access_token,
            refresh_token,
            user,
            profile,
            expires_at,
        })
    }
}

/// Persist a freshly issued token pair.
pub async fn persist_tokens(store: &dyn KeyValueStore, tokens: &TokenPair) -> Result<()> {
    store
        .set_many(vec![
            (ACCESS_TOKEN_KEY, tokens.access_token.clone()),
            (REFRESH_TOKEN_KEY, tokens.refresh_token.clone()),
        ])
        .await
}

/// Persist tokens, user, and profile from a login.
pub async fn persist_login(store: &dyn KeyValueStore, login: &LoginResult) -> Result<()> {
    let mut entries = vec![
        (ACCESS_TOKEN_KEY, login.tokens.access_token.clone()),
        (REFRESH_TOKEN_KEY, login.tokens.refresh_token.clone()),
    ];
    if let Some(user) = &login.user {
        let raw = serde_json::to_string(user)
            .map_err(|e| Error::Serialization(format!("serializing user: {e}")))?;
        entries.push((USER_INFO_KEY, raw));
    }
    if let Some(profile) = &login.profile {
        entries.push((PROFILE_KEY, profile.to_string()));
    }
    store.set_many(entries).await
}

/// Persist the access token expiry (unix milliseconds).
pub async fn persist_expiry(store: &dyn KeyValueStore, expires_at: u64) -> Result<()> {
    store.set(TOKEN_EXPIRY_KEY, expires_at.to_string()).await
}

/// Read the persisted expiry. A value that is not an integer is ignored.
pub async fn load_expiry(store: &dyn KeyValueStore) -> Result<Option<u64>> {
    Ok(store.get(TOKEN_EXPIRY_KEY).await?.and_then(|raw| {
        raw.trim()
            .parse::<u64>()
            .inspect_err(|e| warn!(value = %raw, error = %e, "ignoring malformed token expiry"))
            .ok()
    }))
}

/// Remove every session key in one bulk operation.
pub async fn clear_session(store: &dyn KeyValueStore) -> Result<()> {
    store.remove_many(SESSION_KEYS).await
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    fn login_result() -> LoginResult {
        LoginResult {
            tokens: TokenPair::new("at_1", "rt_1"),
            user: Some(UserRecord {
                id: serde_json::json!(42),
                email: Some("ana@example.com".into()),
                name: Some("Ana".into()),
                language: Some("pt".into()),
                account_type: Some("personal".into()),
                subscription_flag: Some(true),
                role: Some("member".into()),
            }),
            profile: Some(serde_json::json!({"avatar": "a.png"})),
        }
    }

    #[tokio::test]
    async fn login_roundtrips_through_store() {
        let store = MemoryStore::new();
        persist_login(&store, &login_result()).await.unwrap();
        persist_expiry(&store, 1_700_000_900_000).await.unwrap();

        let session = StoredSession::load(&store).await.unwrap();
        assert_eq!(session.refresh_token.as_deref(), Some("rt_1"));
        assert_eq!(session.access_token.as_deref(), Some("at_1"));
        assert_eq!(session.user.unwrap().email.as_deref(), Some("ana@example.com"));
        assert_eq!(session.profile.unwrap()["avatar"], "a.png");
        assert_eq!(session.expires_at, Some(1_700_000_900_000));
    }

    #[tokio::test]
    async fn clear_session_removes_every_key() {
        let store = MemoryStore::new();
        persist_login(&store, &login_result()).await.unwrap();
        persist_expiry(&store, 1).await.unwrap();

        clear_session(&store).await.unwrap();
        assert!(store.is_empty());
        let session = StoredSession::load(&store).await.unwrap();
        assert!(session.access_token.is_none());
        assert!(session.refresh_token.is_none());
        assert!(session.expires_at.is_none());
    }

    #[tokio::test]
    async fn malformed_expiry_is_ignored() {
        let store = MemoryStore::new();
        store.set(TOKEN_EXPIRY_KEY, "soon".into()).await.unwrap();
        assert_eq!(load_expiry(&store).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_user_does_not_fail_restore() {
        let store = MemoryStore::new();
        store.set(ACCESS_TOKEN_KEY, "at".into()).await.unwrap();
        store.set(USER_INFO_KEY, "{broken".into()).await.unwrap();

        let session = StoredSession::load(&store).await.unwrap();
        assert_eq!(session.access_token.as_deref(), Some("at"));
        assert!(session.user.is_none());
    }

    #[test]
    fn user_record_accepts_snake_case_fields() {
        let user: UserRecord = serde_json::from_str(
            r#"{"id":"u-1","account_type":"business","subscription_flag":false}"#,
        )
        .unwrap();
        assert_eq!(user.id, "u-1");
        assert_eq!(user.account_type.as_deref(), Some("business"));
        assert_eq!(user.subscription_flag, Some(false));
    }

    #[test]
    fn token_pair_debug_hides_tokens() {
        let debug = format!("{:?}", TokenPair::new("at_secret", "rt_secret"));
        assert!(!debug.contains("at_secret"));
        assert!(!debug.contains("rt_secret"));
    }
}
