use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use studio_core::{
    CoreError,
    domain::user::{Role, User},
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::application::middleware::{AuthenticatedUser, SessionToken, session_key};
use crate::application::{ApiError, ApiResult, JsonBody};

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

fn hash_password(password: &str) -> Result<String, CoreError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| CoreError::Internal(format!("password hashing failed: {e}")))
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is unreadable: {}", e);
            false
        }
    }
}

/// Open registration. Users start inactive and outside any tenant.
pub async fn handle_register(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    if payload.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::BadRequest(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let role = payload.role.unwrap_or(Role::User);
    let password_hash = hash_password(&payload.password)?;
    let user = User::register(&payload.name, &payload.email, password_hash, role, Utc::now())
        .map_err(CoreError::from)?;

    let directory = state.registry.main().await?;
    let user = directory.insert_user(user).await?;
    info!(user_id = %user.id, role = %user.role.as_str(), "User registered");
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn handle_login(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    if payload.email.trim().is_empty() || payload.password.is_empty() {
        return Err(ApiError::BadRequest("email and password are required".into()));
    }

    let directory = state.registry.main().await?;
    let user = directory.find_user_by_email(&payload.email).await?;
    // Same answer for unknown email and wrong password.
    let user = match user {
        Some(user) if verify_password(&payload.password, &user.password_hash) => user,
        _ => return Err(CoreError::Unauthorized("invalid credentials".into()).into()),
    };

    let token = Uuid::new_v4().to_string();
    let session = AuthenticatedUser {
        user_id: user.id.clone(),
        role: user.role,
    };
    let encoded = serde_json::to_vec(&session)
        .map_err(|e| CoreError::Internal(format!("session encoding failed: {e}")))?;
    state
        .cache
        .set(
            &session_key(&token),
            &encoded,
            Some(state.config.session_ttl_seconds),
        )
        .await?;

    info!(user_id = %user.id, "User logged in");
    Ok(Json(LoginResponse { token, user }))
}

pub async fn handle_logout(
    State(state): State<AppState>,
    Extension(token): Extension<SessionToken>,
) -> ApiResult<StatusCode> {
    state.cache.delete(&session_key(&token.0)).await?;
    Ok(StatusCode::NO_CONTENT)
}
