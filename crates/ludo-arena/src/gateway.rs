//! Connection authentication and presence.
//!
//! A connecting client presents a bearer token. The gateway verifies
//! its signature and subject, checks the shared deny-list, and then
//! tracks the user's live connection in the store so any process can
//! see who is online.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::store::{keys, DocumentStore, DocumentStoreExt};
use crate::types::UserId;

/// Subject a valid access token must carry.
const AUTH_SUBJECT: &str = "auth";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The authenticated user.
    pub id: String,
    pub sub: String,
    pub exp: usize,
}

/// An authenticated, connected session.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub connection_id: String,
}

pub struct SessionGateway {
    store: Arc<dyn DocumentStore>,
    config: Arc<ArenaConfig>,
}

impl SessionGateway {
    pub fn new(store: Arc<dyn DocumentStore>, config: Arc<ArenaConfig>) -> Self {
        Self { store, config }
    }

    /// Verify a bearer token and resolve the user it belongs to.
    ///
    /// Rejects bad signatures, expired tokens, wrong subjects, and
    /// tokens on the revocation deny-list.
    pub async fn authenticate(&self, token: &str) -> Result<UserId, ArenaError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|err| ArenaError::Auth {
            reason: err.to_string(),
        })?;

        if data.claims.sub != AUTH_SUBJECT {
            return Err(ArenaError::Auth {
                reason: format!("unexpected token subject {:?}", data.claims.sub),
            });
        }
        if self
            .store
            .get_raw(&keys::revoked_token(token))
            .await?
            .is_some()
        {
            return Err(ArenaError::TokenRevoked);
        }
        Ok(UserId::new(data.claims.id))
    }

    /// Record a live connection for the user.
    pub async fn connect(&self, user_id: &UserId, connection_id: &str) -> Result<Session, ArenaError> {
        self.store
            .put_json(&keys::user_socket(user_id), &connection_id, None)
            .await?;
        tracing::debug!(%user_id, connection_id, "session connected");
        Ok(Session {
            user_id: user_id.clone(),
            connection_id: connection_id.to_string(),
        })
    }

    /// Clear the user's presence record, unless a newer connection has
    /// already replaced it.
    pub async fn disconnect(&self, session: &Session) -> Result<(), ArenaError> {
        let key = keys::user_socket(&session.user_id);
        if let Some((current, _)) = self.store.get_json::<String>(&key).await? {
            if current == session.connection_id {
                self.store.delete(&key).await?;
            }
        }
        tracing::debug!(user_id = %session.user_id, connection_id = %session.connection_id, "session disconnected");
        Ok(())
    }

    /// Whether the user has any live connection, on any process.
    pub async fn is_online(&self, user_id: &UserId) -> Result<bool, ArenaError> {
        Ok(self
            .store
            .get_raw(&keys::user_socket(user_id))
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn gateway() -> SessionGateway {
        let config = Arc::new(ArenaConfig {
            jwt_secret: SECRET.to_string(),
            ..ArenaConfig::default()
        });
        SessionGateway::new(Arc::new(MemoryStore::new()), config)
    }

    fn token(id: &str, sub: &str, secret: &str) -> String {
        let claims = Claims {
            id: id.to_string(),
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn valid_token_authenticates() {
        let gateway = gateway();
        let user = gateway
            .authenticate(&token("alice", "auth", SECRET))
            .await
            .unwrap();
        assert_eq!(user, UserId::new("alice"));
    }

    #[tokio::test]
    async fn wrong_signature_rejected() {
        let gateway = gateway();
        let err = gateway
            .authenticate(&token("alice", "auth", "other-secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::Auth { .. }));
    }

    #[tokio::test]
    async fn wrong_subject_rejected() {
        let gateway = gateway();
        let err = gateway
            .authenticate(&token("alice", "refresh", SECRET))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::Auth { .. }));
    }

    #[tokio::test]
    async fn revoked_token_rejected() {
        let gateway = gateway();
        let token = token("alice", "auth", SECRET);
        gateway
            .store
            .put_raw(&keys::revoked_token(&token), b"1".to_vec(), None)
            .await
            .unwrap();
        let err = gateway.authenticate(&token).await.unwrap_err();
        assert!(matches!(err, ArenaError::TokenRevoked));
    }

    #[tokio::test]
    async fn presence_follows_connect_and_disconnect() {
        let gateway = gateway();
        let user = UserId::new("alice");
        assert!(!gateway.is_online(&user).await.unwrap());

        let session = gateway.connect(&user, "conn-1").await.unwrap();
        assert!(gateway.is_online(&user).await.unwrap());

        gateway.disconnect(&session).await.unwrap();
        assert!(!gateway.is_online(&user).await.unwrap());
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_newer_connection() {
        let gateway = gateway();
        let user = UserId::new("alice");
        let old = gateway.connect(&user, "conn-1").await.unwrap();
        gateway.connect(&user, "conn-2").await.unwrap();

        gateway.disconnect(&old).await.unwrap();
        assert!(gateway.is_online(&user).await.unwrap());
    }
}
