//! Agent credential store and token verification. This is the external
//! authentication collaborator the routing core consumes: a token goes in, a
//! verified identity comes out, or nothing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::warn;

use crate::types::{AgentIdentity, AppState, Claims, UserRecord};

const TOKEN_TTL_HOURS: i64 = 24;

pub fn issue_token(secret: &str, email: &str) -> Option<String> {
    let exp = (Utc::now() + Duration::hours(TOKEN_TTL_HOURS)).timestamp() as usize;
    let claims = Claims {
        sub: email.to_string(),
        exp,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .ok()
}

pub fn decode_token(secret: &str, token: &str) -> Option<String> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims.sub)
    .ok()
}

/// Resolve a bearer token to a known agent. Expired, malformed or forged
/// tokens and unknown accounts all come back as `None`.
pub async fn verify_agent_token(state: &Arc<AppState>, token: &str) -> Option<AgentIdentity> {
    let email = decode_token(&state.jwt_secret, token)?;
    let users = state.users.lock().await;
    users.get(&email).map(|u| AgentIdentity {
        email: u.email.clone(),
        name: u.name.clone(),
    })
}

pub fn hash_password(password: &str) -> Option<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).ok()
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Fixture agent accounts, hashed at startup from `SEED_AGENT_PASSWORD`.
pub fn seed_users(password: &str) -> HashMap<String, UserRecord> {
    let mut users = HashMap::new();
    for (email, name) in [
        ("support@example.com", "Joan Support"),
        ("admin@example.com", "Administrator"),
    ] {
        match hash_password(password) {
            Some(hash) => {
                users.insert(
                    email.to_string(),
                    UserRecord {
                        email: email.to_string(),
                        name: name.to_string(),
                        password_hash: hash,
                    },
                );
            }
            None => warn!(email, "failed to hash seed password, account skipped"),
        }
    }
    users
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Mutex;

    use super::*;
    use crate::types::Registry;

    fn state_with_user(email: &str, name: &str) -> Arc<AppState> {
        let mut users = HashMap::new();
        users.insert(
            email.to_string(),
            UserRecord {
                email: email.to_string(),
                name: name.to_string(),
                password_hash: bcrypt::hash("secret", 4).expect("hash"),
            },
        );
        Arc::new(AppState {
            registry: Mutex::new(Registry::default()),
            users: Mutex::new(users),
            next_conn_id: AtomicUsize::new(0),
            jwt_secret: "test-secret".to_string(),
            deploy_secret: "test-secret".to_string(),
        })
    }

    #[test]
    fn token_round_trip() {
        let token = issue_token("test-secret", "a@example.com").expect("token");
        assert_eq!(
            decode_token("test-secret", &token).as_deref(),
            Some("a@example.com")
        );
    }

    #[test]
    fn token_with_wrong_secret_is_rejected() {
        let token = issue_token("test-secret", "a@example.com").expect("token");
        assert!(decode_token("other-secret", &token).is_none());
        assert!(decode_token("test-secret", "not-a-token").is_none());
    }

    #[tokio::test]
    async fn verify_resolves_known_agent_only() {
        let state = state_with_user("a@example.com", "Alice");
        let token = issue_token(&state.jwt_secret, "a@example.com").expect("token");
        let identity = verify_agent_token(&state, &token).await.expect("identity");
        assert_eq!(identity.name, "Alice");

        let stranger = issue_token(&state.jwt_secret, "nobody@example.com").expect("token");
        assert!(verify_agent_token(&state, &stranger).await.is_none());
    }

    #[test]
    fn password_verification() {
        let hash = bcrypt::hash("hunter2", 4).expect("hash");
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "garbage-hash"));
    }
}
