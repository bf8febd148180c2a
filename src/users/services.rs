//! Account lifecycle: register, verify email, login, profile edits and the
//! forgot/reset password flow. Handlers stay thin and call into here.

use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{
    avatar::{discard_avatar, store_avatar},
    dto::{ProfileForm, PublicUser},
    repo_types::{NewUser, ProfileUpdate, User},
};
use crate::{
    auth::{
        password::{self, hash_password, verify_password},
        tokens, JwtKeys,
    },
    error::AppError,
    mailer,
    state::AppState,
};

/// A user with a freshly signed session token.
#[derive(Debug)]
pub struct SignedIn {
    pub user: User,
    pub token: String,
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn valid_email(raw: &str) -> Result<String, AppError> {
    let email = normalize_email(raw);
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AppError::bad_request("Invalid email"));
    }
    Ok(email)
}

fn check_password(candidate: &str) -> Result<(), AppError> {
    if !password::meets_policy(candidate) {
        warn!("password too short");
        return Err(AppError::bad_request("Password too short"));
    }
    Ok(())
}

fn sign_in(state: &AppState, user: User) -> Result<SignedIn, AppError> {
    let token = JwtKeys::from_ref(state).sign(user.id)?;
    Ok(SignedIn { user, token })
}

pub async fn public_user(state: &AppState, user: &User) -> Result<PublicUser, AppError> {
    let avatar = match &user.avatar_path {
        Some(key) => Some(state.storage.url_for(key).await?),
        None => None,
    };
    Ok(PublicUser {
        id: user.id,
        name: user.name.clone(),
        email: user.email.clone(),
        avatar,
        is_verified: user.is_verified,
    })
}

/// Creates an unverified account and mails its verification code. Returns the
/// record even though no session is started.
#[instrument(skip(state, form))]
pub async fn register(state: &AppState, form: ProfileForm) -> Result<User, AppError> {
    let name = form
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AppError::bad_request("Name is required"))?;
    let email = valid_email(form.email.as_deref().unwrap_or_default())?;
    let password = form
        .password
        .ok_or_else(|| AppError::bad_request("Password is required"))?;
    check_password(&password)?;

    if state.users.find_by_email(&email).await?.is_some() {
        warn!(email = %email, "email already registered");
        return Err(AppError::Conflict("User already exists".into()));
    }

    let password_hash = hash_password(&password)?;

    let avatar_path = match form.avatar {
        Some(upload) => Some(store_avatar(state.storage.as_ref(), upload).await?),
        None => None,
    };

    let code = tokens::new_verification_code(OffsetDateTime::now_utc());
    let created = state
        .users
        .create(NewUser {
            name,
            email,
            password_hash,
            avatar_path: avatar_path.clone(),
            verification_code_hash: code.hash,
            verification_expire: code.expires_at,
        })
        .await;
    let user = match created {
        Ok(u) => u,
        Err(e) => {
            if let Some(key) = &avatar_path {
                discard_avatar(state.storage.as_ref(), key).await;
            }
            return Err(e.into());
        }
    };
    info!(user_id = %user.id, email = %user.email, "user registered");

    if let Err(e) = state
        .mailer
        .send(mailer::verification_email(&user.email, &code.raw))
        .await
    {
        error!(error = %e, user_id = %user.id, "verification email failed");
        return Err(AppError::EmailDeliveryFailed);
    }

    Ok(user)
}

/// Issues a fresh code for an account that is not verified yet.
#[instrument(skip(state))]
pub async fn resend_verification(state: &AppState, email: &str) -> Result<(), AppError> {
    let email = normalize_email(email);
    let user = state
        .users
        .find_by_email(&email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;
    if user.is_verified {
        return Err(AppError::bad_request("Email already verified"));
    }

    let code = tokens::new_verification_code(OffsetDateTime::now_utc());
    state
        .users
        .set_verification(user.id, &code.hash, code.expires_at)
        .await?;

    state
        .mailer
        .send(mailer::verification_email(&user.email, &code.raw))
        .await
        .map_err(|e| {
            error!(error = %e, user_id = %user.id, "verification email failed");
            AppError::EmailDeliveryFailed
        })?;
    info!(user_id = %user.id, "verification code reissued");
    Ok(())
}

/// Consumes the code and starts a session. An expired code is cleared.
#[instrument(skip(state, code))]
pub async fn verify_email(state: &AppState, email: &str, code: &str) -> Result<SignedIn, AppError> {
    let email = normalize_email(email);
    let user = state
        .users
        .find_by_email(&email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))?;

    let invalid = || AppError::InvalidOrExpired("Invalid or expired verification code".into());
    let now = OffsetDateTime::now_utc();

    match user.verification_expire {
        None => {
            warn!(user_id = %user.id, "no pending verification code");
            return Err(invalid());
        }
        Some(exp) if exp <= now => {
            warn!(user_id = %user.id, "verification code expired");
            state.users.clear_verification(user.id).await?;
            return Err(invalid());
        }
        Some(_) => {}
    }

    if !tokens::matches(
        code,
        user.verification_code_hash.as_deref(),
        user.verification_expire,
        now,
    ) {
        warn!(user_id = %user.id, "verification code mismatch");
        return Err(invalid());
    }

    let user = state
        .users
        .mark_verified(user.id, &tokens::hash_secret(code), now)
        .await?
        .ok_or_else(|| {
            warn!(user_id = %user.id, "verification code replaced concurrently");
            invalid()
        })?;
    info!(user_id = %user.id, "email verified");
    sign_in(state, user)
}

/// Same error for unknown email and wrong password.
#[instrument(skip(state, password))]
pub async fn login(state: &AppState, email: &str, password: &str) -> Result<SignedIn, AppError> {
    let email = normalize_email(email);

    let Some(user) = state.users.find_by_email(&email).await? else {
        warn!(email = %email, "login unknown email");
        return Err(AppError::Unauthorized);
    };

    if !verify_password(password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(AppError::Unauthorized);
    }

    if state.config.require_verified_login && !user.is_verified {
        warn!(user_id = %user.id, "login before email verification");
        return Err(AppError::Forbidden("Email not verified".into()));
    }

    info!(user_id = %user.id, "user logged in");
    sign_in(state, user)
}

#[instrument(skip(state))]
pub async fn current_user(state: &AppState, user_id: Uuid) -> Result<User, AppError> {
    state
        .users
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".into()))
}

/// Applies each supplied field independently. A replaced avatar is removed
/// from storage once the record points at the new one.
#[instrument(skip(state, form))]
pub async fn edit_profile(
    state: &AppState,
    user_id: Uuid,
    form: ProfileForm,
) -> Result<User, AppError> {
    let user = current_user(state, user_id).await?;

    let mut update = ProfileUpdate::default();

    if let Some(raw) = form.email.filter(|e| !e.trim().is_empty()) {
        let email = valid_email(&raw)?;
        if let Some(other) = state.users.find_by_email(&email).await? {
            if other.id != user.id {
                warn!(user_id = %user.id, email = %email, "email already in use");
                return Err(AppError::Conflict("Email already in use".into()));
            }
        }
        update.email = Some(email);
    }
    if let Some(name) = form.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
        update.name = Some(name);
    }
    if let Some(password) = form.password.filter(|p| !p.is_empty()) {
        check_password(&password)?;
        update.password_hash = Some(hash_password(&password)?);
    }
    if let Some(upload) = form.avatar {
        update.avatar_path = Some(store_avatar(state.storage.as_ref(), upload).await?);
    }

    if update.is_empty() {
        return Ok(user);
    }

    let new_avatar = update.avatar_path.clone();
    let updated = match state.users.update_profile(user.id, update).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            if let Some(key) = &new_avatar {
                discard_avatar(state.storage.as_ref(), key).await;
            }
            return Err(AppError::NotFound("User not found".into()));
        }
        Err(e) => {
            if let Some(key) = &new_avatar {
                discard_avatar(state.storage.as_ref(), key).await;
            }
            return Err(match AppError::from(e) {
                AppError::Conflict(_) => AppError::Conflict("Email already in use".into()),
                other => other,
            });
        }
    };

    if let (Some(_), Some(old)) = (&new_avatar, &user.avatar_path) {
        discard_avatar(state.storage.as_ref(), old).await;
    }

    info!(user_id = %updated.id, "profile updated");
    Ok(updated)
}

/// Stores a new reset token digest and mails the raw token. If the mail cannot
/// be sent the token is withdrawn again.
#[instrument(skip(state))]
pub async fn forgot_password(state: &AppState, email: &str) -> Result<(), AppError> {
    let email = normalize_email(email);
    let user = state
        .users
        .find_by_email(&email)
        .await?
        .ok_or_else(|| AppError::NotFound("User with this email does not exist".into()))?;

    let secret = tokens::new_reset_token(OffsetDateTime::now_utc());
    state
        .users
        .set_reset_token(user.id, &secret.hash, secret.expires_at)
        .await?;

    let reset_url = format!(
        "{}/api/users/reset-password/{}",
        state.config.public_base_url.trim_end_matches('/'),
        secret.raw
    );

    if let Err(e) = state
        .mailer
        .send(mailer::reset_email(&user.email, &reset_url))
        .await
    {
        error!(error = %e, user_id = %user.id, "reset email failed; withdrawing token");
        state.users.clear_reset_token(user.id, &secret.hash).await?;
        return Err(AppError::EmailDeliveryFailed);
    }

    info!(user_id = %user.id, "password reset requested");
    Ok(())
}

/// Consumes the reset token, sets the new password and starts a session.
#[instrument(skip(state, raw_token, password))]
pub async fn reset_password(
    state: &AppState,
    raw_token: &str,
    password: Option<&str>,
) -> Result<SignedIn, AppError> {
    let token_hash = tokens::hash_secret(raw_token);
    let now = OffsetDateTime::now_utc();
    let invalid = || AppError::InvalidOrExpired("Invalid or expired token".into());

    if state
        .users
        .find_by_reset_token(&token_hash, now)
        .await?
        .is_none()
    {
        warn!("invalid or expired reset token");
        return Err(invalid());
    }

    let password = password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::bad_request("Password is required"))?;
    check_password(password)?;
    let password_hash = hash_password(password)?;

    let user = state
        .users
        .consume_reset_token(&token_hash, &password_hash, OffsetDateTime::now_utc())
        .await?
        .ok_or_else(|| {
            warn!("reset token consumed concurrently");
            invalid()
        })?;

    info!(user_id = %user.id, "password reset");
    sign_in(state, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::{session::AuthUser, tokens::hash_secret},
        state::fake::test_config,
        users::{avatar::AvatarUpload, repo::UserStore},
    };
    use bytes::Bytes;
    use time::Duration;

    fn form(name: &str, email: &str, password: &str) -> ProfileForm {
        ProfileForm {
            name: Some(name.into()),
            email: Some(email.into()),
            password: Some(password.into()),
            avatar: None,
        }
    }

    fn png(len: usize) -> AvatarUpload {
        AvatarUpload {
            file_name: Some("me.png".into()),
            content_type: Some("image/png".into()),
            body: Bytes::from(vec![7u8; len]),
        }
    }

    async fn mailed_code(app: &crate::state::fake::FakeApp, to: &str) -> String {
        let mail = app.mailer.last_to(to).await.expect("mail sent");
        mail.text
            .split(|c: char| !c.is_ascii_digit())
            .find(|s| s.len() == 6)
            .expect("code in mail")
            .to_string()
    }

    async fn mailed_reset_token(app: &crate::state::fake::FakeApp, to: &str) -> String {
        let mail = app.mailer.last_to(to).await.expect("mail sent");
        let (_, rest) = mail.text.split_once("/reset-password/").expect("link");
        rest.split_whitespace().next().unwrap().to_string()
    }

    async fn verified_user(app: &crate::state::fake::FakeApp, email: &str, pw: &str) -> User {
        register(&app.state, form("Ada", email, pw)).await.unwrap();
        let code = mailed_code(app, email).await;
        verify_email(&app.state, email, &code).await.unwrap().user
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("a@b.io"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a b@c.io"));
        assert_eq!(normalize_email("  Ada@Example.COM "), "ada@example.com");
    }

    #[tokio::test]
    async fn register_then_verify_signs_in() {
        let app = crate::state::AppState::fake();
        let user = register(&app.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap();
        assert!(!user.is_verified);
        assert!(user.verification_code_hash.is_some());
        assert_ne!(user.password_hash, "password123");

        let code = mailed_code(&app, "ada@example.com").await;
        let signed = verify_email(&app.state, "ada@example.com", &code).await.unwrap();
        assert!(signed.user.is_verified);
        assert!(signed.user.verification_code_hash.is_none());
        assert!(signed.user.verification_expire.is_none());

        let claims = JwtKeys::from_ref(&app.state).verify(&signed.token).unwrap();
        assert_eq!(claims.sub, user.id);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let app = crate::state::AppState::fake();
        register(&app.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap();
        let err = register(&app.state, form("Other", "ADA@example.com", "password456"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn register_validates_input() {
        let app = crate::state::AppState::fake();
        let err = register(&app.state, form("", "a@b.io", "password123")).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        let err = register(&app.state, form("Ada", "nope", "password123")).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        let err = register(&app.state, form("Ada", "a@b.io", "short")).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(app.mailer.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn register_stores_avatar() {
        let app = crate::state::AppState::fake();
        let mut f = form("Ada", "ada@example.com", "password123");
        f.avatar = Some(png(16));
        let user = register(&app.state, f).await.unwrap();
        let key = user.avatar_path.clone().unwrap();
        assert!(app.storage.objects.lock().await.contains_key(&key));

        let public = public_user(&app.state, &user).await.unwrap();
        assert_eq!(public.avatar, Some(format!("https://fake.local/{key}")));
    }

    #[tokio::test]
    async fn register_rejects_bad_avatar_before_creating() {
        let app = crate::state::AppState::fake();
        let mut f = form("Ada", "ada@example.com", "password123");
        f.avatar = Some(AvatarUpload {
            file_name: Some("x.gif".into()),
            content_type: Some("image/gif".into()),
            body: Bytes::from_static(b"GIF89a"),
        });
        assert!(matches!(
            register(&app.state, f).await.unwrap_err(),
            AppError::BadRequest(_)
        ));
        assert!(app.users.find_by_email("ada@example.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn register_mail_failure_keeps_account_for_resend() {
        let app = crate::state::AppState::fake();
        app.mailer.set_failing(true);
        let err = register(&app.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EmailDeliveryFailed));

        app.mailer.set_failing(false);
        resend_verification(&app.state, "ada@example.com").await.unwrap();
        let code = mailed_code(&app, "ada@example.com").await;
        assert!(verify_email(&app.state, "ada@example.com", &code).await.is_ok());

        let err = resend_verification(&app.state, "ada@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn verify_email_errors() {
        let app = crate::state::AppState::fake();
        let err = verify_email(&app.state, "ghost@example.com", "123456").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        register(&app.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap();
        let code = mailed_code(&app, "ada@example.com").await;
        let wrong = if code == "999999" { "100000" } else { "999999" };
        let err = verify_email(&app.state, "ada@example.com", wrong).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpired(_)));

        // a mismatch leaves the code usable
        assert!(verify_email(&app.state, "ada@example.com", &code).await.is_ok());
        // and once consumed it is gone
        let err = verify_email(&app.state, "ada@example.com", &code).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpired(_)));
    }

    #[tokio::test]
    async fn expired_code_is_rejected_and_cleared() {
        let app = crate::state::AppState::fake();
        let user = register(&app.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap();
        let code = mailed_code(&app, "ada@example.com").await;
        app.users
            .modify(user.id, |u| {
                u.verification_expire = Some(OffsetDateTime::now_utc() - Duration::minutes(1))
            })
            .await;

        let err = verify_email(&app.state, "ada@example.com", &code).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpired(_)));

        let stored = app.users.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.verification_code_hash.is_none());
        assert!(stored.verification_expire.is_none());
        assert!(!stored.is_verified);
    }

    #[tokio::test]
    async fn code_must_match_exactly() {
        let app = crate::state::AppState::fake();
        register(&app.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap();
        let code = mailed_code(&app, "ada@example.com").await;

        let padded = format!(" {code} ");
        let err = verify_email(&app.state, "ada@example.com", &padded).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpired(_)));
        assert!(verify_email(&app.state, "ada@example.com", &code).await.is_ok());
    }

    #[tokio::test]
    async fn replaced_code_cannot_mark_verified() {
        let app = crate::state::AppState::fake();
        let user = register(&app.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap();
        let old = mailed_code(&app, "ada@example.com").await;
        resend_verification(&app.state, "ada@example.com").await.unwrap();
        let new = mailed_code(&app, "ada@example.com").await;

        // a verify that checked the old code just before the resend landed
        let now = OffsetDateTime::now_utc();
        let stale = app
            .users
            .mark_verified(user.id, &hash_secret(&old), now)
            .await
            .unwrap();
        assert_eq!(stale.is_none(), old != new);

        if old != new {
            let err = verify_email(&app.state, "ada@example.com", &old).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidOrExpired(_)));
            assert!(!app.users.find_by_id(user.id).await.unwrap().unwrap().is_verified);
            assert!(verify_email(&app.state, "ada@example.com", &new).await.is_ok());
        }
    }

    #[tokio::test]
    async fn login_success_and_generic_failures() {
        let app = crate::state::AppState::fake();
        let user = verified_user(&app, "ada@example.com", "password123").await;

        let signed = login(&app.state, " ADA@example.com", "password123").await.unwrap();
        let keys = JwtKeys::from_ref(&app.state);
        assert_eq!(keys.verify(&signed.token).unwrap().sub, user.id);

        let wrong_pw = login(&app.state, "ada@example.com", "password124").await.unwrap_err();
        let unknown = login(&app.state, "bob@example.com", "password123").await.unwrap_err();
        assert!(matches!(wrong_pw, AppError::Unauthorized));
        assert!(matches!(unknown, AppError::Unauthorized));
        assert_eq!(wrong_pw.to_string(), unknown.to_string());
        assert_eq!(wrong_pw.status_code(), unknown.status_code());
    }

    #[tokio::test]
    async fn session_from_login_is_accepted_by_extractor() {
        use axum::extract::FromRequestParts;

        let app = crate::state::AppState::fake();
        let user = verified_user(&app, "ada@example.com", "password123").await;
        let signed = login(&app.state, "ada@example.com", "password123").await.unwrap();

        let mut parts = axum::http::Request::builder()
            .header("cookie", format!("token={}", signed.token))
            .body(())
            .unwrap()
            .into_parts()
            .0;
        let AuthUser(id) = AuthUser::from_request_parts(&mut parts, &app.state).await.unwrap();
        assert_eq!(id, user.id);
    }

    #[tokio::test]
    async fn unverified_login_follows_config() {
        let app = crate::state::AppState::fake();
        register(&app.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap();
        assert!(login(&app.state, "ada@example.com", "password123").await.is_ok());

        let mut cfg = test_config();
        cfg.require_verified_login = true;
        let gated = crate::state::AppState::fake_with(cfg);
        register(&gated.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap();
        let err = login(&gated.state, "ada@example.com", "password123").await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        // wrong password still gets the generic error
        let err = login(&gated.state, "ada@example.com", "nope-nope").await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
    }

    #[tokio::test]
    async fn partial_profile_update_only_touches_supplied_fields() {
        let app = crate::state::AppState::fake();
        let mut f = form("Ada", "ada@example.com", "password123");
        f.avatar = Some(png(8));
        let before = register(&app.state, f).await.unwrap();

        let after = edit_profile(
            &app.state,
            before.id,
            ProfileForm {
                name: Some("Ada Lovelace".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(after.name, "Ada Lovelace");
        assert_eq!(after.email, before.email);
        assert_eq!(after.password_hash, before.password_hash);
        assert_eq!(after.avatar_path, before.avatar_path);
    }

    #[tokio::test]
    async fn edit_profile_password_email_and_avatar() {
        let app = crate::state::AppState::fake();
        let mut f = form("Ada", "ada@example.com", "password123");
        f.avatar = Some(png(8));
        let before = register(&app.state, f).await.unwrap();
        let old_key = before.avatar_path.clone().unwrap();

        let after = edit_profile(
            &app.state,
            before.id,
            ProfileForm {
                email: Some("Lovelace@Example.com".into()),
                password: Some("newpassword1".into()),
                avatar: Some(png(4)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(after.email, "lovelace@example.com");
        assert_eq!(after.name, "Ada");
        let new_key = after.avatar_path.clone().unwrap();
        assert_ne!(new_key, old_key);
        let objects = app.storage.objects.lock().await;
        assert!(objects.contains_key(&new_key));
        assert!(!objects.contains_key(&old_key));
        drop(objects);

        assert!(login(&app.state, "lovelace@example.com", "newpassword1").await.is_ok());
        assert!(login(&app.state, "lovelace@example.com", "password123").await.is_err());
    }

    #[tokio::test]
    async fn edit_profile_email_conflict() {
        let app = crate::state::AppState::fake();
        let ada = register(&app.state, form("Ada", "ada@example.com", "password123"))
            .await
            .unwrap();
        register(&app.state, form("Bob", "bob@example.com", "password123"))
            .await
            .unwrap();

        let err = edit_profile(
            &app.state,
            ada.id,
            ProfileForm {
                email: Some("bob@example.com".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // keeping one's own email is not a conflict
        let same = edit_profile(
            &app.state,
            ada.id,
            ProfileForm {
                email: Some("ada@example.com".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(same.email, "ada@example.com");

        let err = edit_profile(&app.state, Uuid::new_v4(), ProfileForm::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn forgot_then_reset_is_single_use() {
        let app = crate::state::AppState::fake();
        let user = verified_user(&app, "ada@example.com", "password123").await;

        forgot_password(&app.state, "ada@example.com").await.unwrap();
        let token = mailed_reset_token(&app, "ada@example.com").await;
        let stored = app.users.find_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(stored.reset_password_token_hash, Some(hash_secret(&token)));
        assert_ne!(stored.reset_password_token_hash.as_deref(), Some(token.as_str()));

        let signed = reset_password(&app.state, &token, Some("brandnew123")).await.unwrap();
        assert_eq!(signed.user.id, user.id);
        assert!(signed.user.reset_password_token_hash.is_none());
        assert!(signed.user.reset_password_expire.is_none());

        assert!(matches!(
            login(&app.state, "ada@example.com", "password123").await.unwrap_err(),
            AppError::Unauthorized
        ));
        assert!(login(&app.state, "ada@example.com", "brandnew123").await.is_ok());

        let err = reset_password(&app.state, &token, Some("another123")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpired(_)));
    }

    #[tokio::test]
    async fn reset_password_errors() {
        let app = crate::state::AppState::fake();
        let user = verified_user(&app, "ada@example.com", "password123").await;

        let err = forgot_password(&app.state, "ghost@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = reset_password(&app.state, "deadbeef", Some("whatever123")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpired(_)));

        forgot_password(&app.state, "ada@example.com").await.unwrap();
        let token = mailed_reset_token(&app, "ada@example.com").await;
        let err = reset_password(&app.state, &token, None).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        // missing password does not burn the token
        assert!(reset_password(&app.state, &token, Some("brandnew123")).await.is_ok());

        forgot_password(&app.state, "ada@example.com").await.unwrap();
        let token = mailed_reset_token(&app, "ada@example.com").await;
        app.users
            .modify(user.id, |u| {
                u.reset_password_expire = Some(OffsetDateTime::now_utc() - Duration::seconds(1))
            })
            .await;
        let err = reset_password(&app.state, &token, Some("brandnew456")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpired(_)));
    }

    #[tokio::test]
    async fn forgot_password_rolls_back_on_mail_failure() {
        let app = crate::state::AppState::fake();
        let user = verified_user(&app, "ada@example.com", "password123").await;

        app.mailer.set_failing(true);
        let err = forgot_password(&app.state, "ada@example.com").await.unwrap_err();
        assert!(matches!(err, AppError::EmailDeliveryFailed));
        assert_eq!(err.status_code(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);

        let stored = app.users.find_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.reset_password_token_hash.is_none());
        assert!(stored.reset_password_expire.is_none());
    }

    #[tokio::test]
    async fn latest_reset_token_wins() {
        let app = crate::state::AppState::fake();
        verified_user(&app, "ada@example.com", "password123").await;

        forgot_password(&app.state, "ada@example.com").await.unwrap();
        let first = mailed_reset_token(&app, "ada@example.com").await;
        forgot_password(&app.state, "ada@example.com").await.unwrap();
        let second = mailed_reset_token(&app, "ada@example.com").await;
        assert_ne!(first, second);

        let err = reset_password(&app.state, &first, Some("brandnew123")).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOrExpired(_)));
        assert!(reset_password(&app.state, &second, Some("brandnew123")).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_forgot_leaves_exactly_one_valid_token() {
        let app = crate::state::AppState::fake();
        verified_user(&app, "ada@example.com", "password123").await;

        let (a, b) = tokio::join!(
            forgot_password(&app.state, "ada@example.com"),
            forgot_password(&app.state, "ada@example.com"),
        );
        a.unwrap();
        b.unwrap();

        let sent = app.mailer.sent.lock().await.clone();
        let tokens: Vec<String> = sent
            .iter()
            .filter(|m| m.subject == "Password Reset Request")
            .map(|m| {
                let (_, rest) = m.text.split_once("/reset-password/").unwrap();
                rest.split_whitespace().next().unwrap().to_string()
            })
            .collect();
        assert_eq!(tokens.len(), 2);

        let mut ok = 0;
        for t in &tokens {
            if reset_password(&app.state, t, Some("brandnew123")).await.is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }
}
