//! Thin REST glue around the routing core: login/registration, the dashboard
//! read-model, static quick templates, the agent directory and the deploy
//! webhook. None of this holds routing state of its own.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Form, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{info, warn};

use crate::types::{
    AgentIdentity, AppState, DirectoryAgent, LoginForm, QuickTemplate, RegisterBody, UserRecord,
};
use crate::{auth, registry};

const DEPLOY_BRANCH: &str = "refs/heads/main";

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn require_agent(state: &Arc<AppState>, headers: &HeaderMap) -> Option<AgentIdentity> {
    let token = bearer_token(headers)?;
    auth::verify_agent_token(state, token).await
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "could not validate credentials" })),
    )
        .into_response()
}

pub async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": registry::now_iso() }))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    Form(form): Form<LoginForm>,
) -> impl IntoResponse {
    let password_hash = {
        let users = state.users.lock().await;
        users.get(&form.username).map(|u| u.password_hash.clone())
    };
    let valid = password_hash
        .map(|hash| auth::verify_password(&form.password, &hash))
        .unwrap_or(false);
    if !valid {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid email or password" })),
        )
            .into_response();
    }
    match auth::issue_token(&state.jwt_secret, &form.username) {
        Some(token) => {
            Json(json!({ "access_token": token, "token_type": "bearer" })).into_response()
        }
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "token issuance failed" })),
        )
            .into_response(),
    }
}

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> impl IntoResponse {
    if body.password.len() < 6 {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "password must be at least 6 characters" })),
        )
            .into_response();
    }
    let mut users = state.users.lock().await;
    if users.contains_key(&body.email) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "email already registered" })),
        )
            .into_response();
    }
    let Some(hash) = auth::hash_password(&body.password) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "unable to hash password" })),
        )
            .into_response();
    };
    users.insert(
        body.email.clone(),
        UserRecord {
            email: body.email.clone(),
            name: body.name.clone(),
            password_hash: hash,
        },
    );
    info!(email = %body.email, "agent account registered");
    (
        StatusCode::CREATED,
        Json(json!({ "email": body.email, "name": body.name })),
    )
        .into_response()
}

pub async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    match require_agent(&state, &headers).await {
        Some(identity) => Json(identity).into_response(),
        None => unauthorized(),
    }
}

/// Full conversation snapshot for the dashboard: active, waiting and closed
/// records alike; the client filters and orders further.
pub async fn get_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if require_agent(&state, &headers).await.is_none() {
        return unauthorized();
    }
    let list = registry::conversations_snapshot(&state).await;
    Json(list).into_response()
}

pub async fn get_templates(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if require_agent(&state, &headers).await.is_none() {
        return unauthorized();
    }
    let templates = vec![
        QuickTemplate {
            id: "greeting".to_string(),
            title: "Greeting".to_string(),
            content: "Hello! How can I help you today?".to_string(),
            icon: "hand-wave".to_string(),
        },
        QuickTemplate {
            id: "quote".to_string(),
            title: "Quote".to_string(),
            content: "To prepare a quote we need a few details about your project."
                .to_string(),
            icon: "dollar-sign".to_string(),
        },
    ];
    Json(templates).into_response()
}

/// Directory of agent accounts with live online/offline status derived from
/// the registry. Department is display-only; matching ignores it.
pub async fn get_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if require_agent(&state, &headers).await.is_none() {
        return unauthorized();
    }
    let online = registry::online_agent_emails(&state).await;
    let users = state.users.lock().await;
    let mut accounts: Vec<&UserRecord> = users.values().collect();
    accounts.sort_by(|a, b| a.email.cmp(&b.email));
    let list: Vec<DirectoryAgent> = accounts
        .iter()
        .enumerate()
        .map(|(index, user)| DirectoryAgent {
            id: index + 1,
            name: user.name.clone(),
            status: if online.contains(&user.email) {
                "online".to_string()
            } else {
                "offline".to_string()
            },
            department: "Support".to_string(),
            avatar: "🧑‍💻".to_string(),
        })
        .collect();
    Json(list).into_response()
}

fn verify_deploy_signature(secret: &str, body: &[u8], signature_header: Option<&str>) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    let Some(hex_sig) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// GitHub push webhook. Validates the event type and the HMAC body signature,
/// ignores pushes to branches other than main, and acknowledges. Actually
/// running a deploy script is host-specific and happens outside this process.
pub async fn deploy_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if event != "push" {
        info!(event, "ignoring webhook event");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unsupported event" })),
        )
            .into_response();
    }

    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    if !verify_deploy_signature(&state.deploy_secret, &body, signature) {
        warn!("deploy webhook signature rejected");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid signature" })),
        )
            .into_response();
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid json" })),
        )
            .into_response();
    };
    let git_ref = payload.get("ref").and_then(Value::as_str).unwrap_or("");
    let pusher = payload
        .pointer("/pusher/name")
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    if git_ref != DEPLOY_BRANCH {
        info!(git_ref, "ignoring push to non-deploy branch");
        return Json(json!({ "status": "ignored", "branch": git_ref })).into_response();
    }

    info!(pusher, git_ref, "deploy webhook accepted");
    Json(json!({ "status": "accepted", "pusher": pusher, "branch": git_ref })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn deploy_signature_accepts_valid_header() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign("hook-secret", body);
        assert!(verify_deploy_signature("hook-secret", body, Some(&header)));
    }

    #[test]
    fn deploy_signature_rejects_bad_input() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let header = sign("hook-secret", body);
        assert!(!verify_deploy_signature("other-secret", body, Some(&header)));
        assert!(!verify_deploy_signature("hook-secret", b"tampered", Some(&header)));
        assert!(!verify_deploy_signature("hook-secret", body, None));
        assert!(!verify_deploy_signature("hook-secret", body, Some("sha1=abcdef")));
        assert!(!verify_deploy_signature("hook-secret", body, Some("sha256=zz")));
    }

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert("authorization", "Bearer abc.def.ghi".parse().expect("value"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
        headers.insert("authorization", "Basic dXNlcg==".parse().expect("value"));
        assert_eq!(bearer_token(&headers), None);
    }
}
