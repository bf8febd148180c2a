use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::JsonRejection,
        DefaultBodyLimit, FromRef, Multipart, Path, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use tracing::{info, instrument, warn};

use super::{
    avatar::{AvatarUpload, MAX_AVATAR_BYTES},
    dto::{
        EmailRequest, LoginRequest, MessageResponse, PendingUser, ProfileForm, RegisterResponse,
        ResetPasswordRequest, UserResponse, VerifyEmailRequest,
    },
    services::{self, SignedIn},
};
use crate::{
    auth::{
        session::{clear_session_cookie, session_cookie},
        AuthUser, JwtKeys,
    },
    error::AppError,
    state::AppState,
};

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/verify-email", post(verify_email))
        .route("/resend-verification", post(resend_verification))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/forgot-password", post(forgot_password))
        .route("/reset-password/:token", put(reset_password))
        .route("/me", get(me))
}

/// Routes taking a multipart avatar. The body limit leaves room for the text
/// fields; the 5MB file cap itself is checked on the avatar.
pub fn upload_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/edit-profile", put(edit_profile))
        .layer(DefaultBodyLimit::max(MAX_AVATAR_BYTES + 1024 * 1024))
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::bad_request("File size must not exceed 5MB")
    } else {
        warn!(error = %e, "malformed multipart body");
        AppError::bad_request("Invalid form data")
    }
}

/// Empty text fields count as absent. Unknown fields are ignored.
async fn read_profile_form(mut mp: Multipart) -> Result<ProfileForm, AppError> {
    let mut out = ProfileForm::default();
    while let Some(field) = mp.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "avatar" => {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let body = field.bytes().await.map_err(multipart_error)?;
                if file_name.as_deref().map_or(true, str::is_empty) && body.is_empty() {
                    continue;
                }
                out.avatar = Some(AvatarUpload {
                    file_name,
                    content_type,
                    body,
                });
            }
            "name" | "email" | "password" => {
                let value = field.text().await.map_err(multipart_error)?;
                let value = Some(value).filter(|v| !v.is_empty());
                match name.as_str() {
                    "name" => out.name = value,
                    "email" => out.email = value,
                    _ => out.password = value,
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

fn signed_in_cookie(state: &AppState, signed: &SignedIn) -> Result<HeaderValue, AppError> {
    let keys = JwtKeys::from_ref(state);
    Ok(session_cookie(&signed.token, &keys, state.config.cookie_secure)?)
}

#[instrument(skip(state, mp))]
pub async fn register(
    State(state): State<AppState>,
    mp: Result<Multipart, MultipartRejection>,
) -> Result<impl IntoResponse, AppError> {
    let form = read_profile_form(mp?).await?;
    let user = services::register(&state, form).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user: PendingUser {
                email: user.email,
                is_verified: user.is_verified,
            },
            message: "Verification code sent to email.".into(),
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn verify_email(
    State(state): State<AppState>,
    payload: Result<Json<VerifyEmailRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(payload) = payload?;
    let signed = services::verify_email(&state, &payload.email, &payload.code).await?;
    let cookie = signed_in_cookie(&state, &signed)?;
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(MessageResponse::ok("Email verified successfully!")),
    ))
}

#[instrument(skip(state, payload))]
pub async fn resend_verification(
    State(state): State<AppState>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Json(payload) = payload?;
    services::resend_verification(&state, &payload.email).await?;
    Ok(Json(MessageResponse::ok("Verification code sent to email.")))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(payload) = payload?;
    let signed = services::login(&state, &payload.email, &payload.password).await?;
    let cookie = signed_in_cookie(&state, &signed)?;
    let user = services::public_user(&state, &signed.user).await?;
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(UserResponse { user }),
    ))
}

#[instrument(skip(state))]
pub async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    info!("user signed out");
    (
        StatusCode::OK,
        [(header::SET_COOKIE, clear_session_cookie(state.config.cookie_secure))],
        Json(MessageResponse::ok("Successfully signed out")),
    )
}

#[instrument(skip(state))]
pub async fn me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<UserResponse>, AppError> {
    let user = services::current_user(&state, user_id).await?;
    let user = services::public_user(&state, &user).await?;
    Ok(Json(UserResponse { user }))
}

#[instrument(skip(state, mp))]
pub async fn edit_profile(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mp: Result<Multipart, MultipartRejection>,
) -> Result<Json<UserResponse>, AppError> {
    let form = read_profile_form(mp?).await?;
    let user = services::edit_profile(&state, user_id, form).await?;
    let user = services::public_user(&state, &user).await?;
    Ok(Json(UserResponse { user }))
}

#[instrument(skip(state, payload))]
pub async fn forgot_password(
    State(state): State<AppState>,
    payload: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Json(payload) = payload?;
    services::forgot_password(&state, &payload.email).await?;
    Ok(Json(MessageResponse::ok("Email sent")))
}

/// The body is optional so that a missing password is reported after the
/// token check, as `Password is required`.
#[instrument(skip(state, token, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Path(token): Path<String>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let password = payload.and_then(|Json(p)| p.password);
    let signed = services::reset_password(&state, &token, password.as_deref()).await?;
    let cookie = signed_in_cookie(&state, &signed)?;
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(MessageResponse::ok("Password has been reset")),
    ))
}
