//! Auth lifecycle controller.
//!
//! Orchestrates the register -> store-pending -> verify -> auto-login ->
//! persist-session -> clear-pending sequence and classifies transport
//! results into the error taxonomy. The controller is the single writer
//! of the session store; overlapping transitions of the same kind are
//! serialized by the caller (the session handle's busy flag).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{AuthTransport, RegisterRequest};
use crate::gateway::{ApiResponse, TransportError};
use crate::store::{PendingUpdate, Session, SessionStore, UserSummary};

/// Backend marker for an account that registered but never activated.
const WAITING_FOR_VALIDATION: &str = "Waiting for validation";

/// How long the backend takes to propagate an activation before a login
/// with the same account succeeds. Observed behavior; tests set zero.
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Where the client currently stands in the auth lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Anonymous,
    AwaitingVerification,
    Authenticated,
}

/// Rejected transitions. Every variant renders as a human-readable
/// message; no variant is fatal, and the state machine stays in a
/// well-defined prior state.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No response received at all.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Non-2xx response with a body.
    #[error("{message}")]
    Server { status: u16, message: String },

    /// A 2xx response missing the fields the transition needs.
    #[error("Invalid response from server")]
    MalformedResponse,

    /// Entered code does not exactly match the stored one.
    #[error("Invalid verification code. Please check the code and try again.")]
    InvalidCode,

    /// No stored code+email pair; the caller routes back to registration.
    #[error("No pending verification found. Please register again.")]
    NoPendingVerification,

    /// Client-side form check failed before any network call.
    #[error("{0}")]
    Validation(String),

    /// Local storage failure, surfaced explicitly rather than swallowed.
    #[error("Local storage error: {0}")]
    Store(#[from] anyhow::Error),
}

impl AuthError {
    fn from_response(response: &ApiResponse) -> Self {
        AuthError::Server {
            status: response.status.as_u16(),
            message: response.error_message(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Authenticated(Session),
    /// The account exists but was never activated. Code and email are
    /// persisted as pending verification when the backend returns a code.
    AwaitingVerification { email: String, code: Option<String> },
}

/// Result of a successful registration call.
#[derive(Debug, Clone)]
pub struct Registered {
    pub user: serde_json::Value,
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    /// Activated and auto-logged-in with the cached password.
    Authenticated(Session),
    /// Activated, but no password was cached: manual login required.
    /// Pending verification is cleared; the session stays empty.
    ActivatedNoAutologin,
    /// Activated, but the cached password was rejected (401). Pending
    /// verification is cleared, since re-verification is pointless once the
    /// server has activated the account. Manual login required.
    ActivatedAutologinRejected,
}

/// The orchestrating state machine for auth transitions.
pub struct AuthLifecycle {
    api: Arc<dyn AuthTransport>,
    store: SessionStore,
    settle_delay: Duration,
}

impl AuthLifecycle {
    pub fn new(api: Arc<dyn AuthTransport>, store: SessionStore) -> Self {
        Self {
            api,
            store,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Override the post-activation settle delay (tests use zero).
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Current phase, derived from persisted state.
    pub async fn phase(&self) -> Result<AuthPhase, AuthError> {
        if self.store.session().await?.is_some() {
            return Ok(AuthPhase::Authenticated);
        }
        if self.store.pending().await?.ready().is_some() {
            return Ok(AuthPhase::AwaitingVerification);
        }
        Ok(AuthPhase::Anonymous)
    }

    /// Log in with credentials.
    ///
    /// An account still waiting for validation never yields a session;
    /// the returned one-time code and the email are persisted as pending
    /// verification instead. On any rejection the session stays cleared.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        let response = self.api.login(email, password).await?;

        if body_status(&response) == Some(WAITING_FOR_VALIDATION) {
            let code = response
                .body
                .get("code")
                .and_then(|c| c.as_str())
                .map(str::to_string);

            if let Some(code) = &code {
                self.store
                    .set_pending(PendingUpdate {
                        code: Some(code.clone()),
                        email: Some(email.to_string()),
                        password: None,
                    })
                    .await?;
            }

            info!(email, "Account awaiting verification");
            return Ok(LoginOutcome::AwaitingVerification {
                email: email.to_string(),
                code,
            });
        }

        if !response.is_success() {
            return Err(AuthError::from_response(&response));
        }

        let session = session_from_login(&response.body, email)
            .ok_or(AuthError::MalformedResponse)?;
        self.store.set_session(&session).await?;

        info!(email, "Logged in");
        Ok(LoginOutcome::Authenticated(session))
    }

    /// Register a new account. Surfaces the created user and the
    /// one-time verification code when the backend returns one; storing
    /// the pending artifacts is the caller's responsibility.
    pub async fn register(
        &self,
        request: &RegisterRequest,
        photo: Option<&Path>,
    ) -> Result<Registered, AuthError> {
        let response = self.api.register(request, photo).await?;

        if !response.is_success() {
            return Err(AuthError::from_response(&response));
        }
        if response.body.is_null() {
            return Err(AuthError::MalformedResponse);
        }

        let user = response
            .body
            .get("user")
            .cloned()
            .unwrap_or_else(|| response.body.clone());
        let code = response
            .body
            .get("code")
            .and_then(|c| c.as_str())
            .map(str::to_string);

        info!(email = request.email, "Registered");
        Ok(Registered { user, code })
    }

    /// Verify the account with a user-entered code.
    ///
    /// The code is compared locally against the stored pending code:
    /// exact string match, digits only, no normalization. A mismatch
    /// performs zero network calls. On match the account is activated
    /// server-side, then auto-login runs with the cached password if one
    /// exists. All exits that leave the account activated clear the
    /// pending verification; it is consumed exactly once.
    pub async fn verify(&self, entered_code: &str) -> Result<VerifyOutcome, AuthError> {
        let pending = self.store.pending().await?;
        let (stored_code, email) = pending.ready().ok_or(AuthError::NoPendingVerification)?;

        if !is_valid_code(entered_code) || entered_code != stored_code {
            debug!("Verification code mismatch");
            return Err(AuthError::InvalidCode);
        }

        let email = email.to_string();
        let password = pending
            .password
            .clone()
            .filter(|p| !p.trim().is_empty());

        let response = self.api.verify_account(&email).await?;
        if !response.is_success() {
            return Err(classify_verify_failure(&response));
        }
        info!(email, "Account activated");

        // Give the backend time to propagate the activation before the
        // follow-up login
        tokio::time::sleep(self.settle_delay).await;

        let password = match password {
            Some(password) => password,
            None => {
                self.store.clear_pending().await?;
                info!("No cached password, manual login required");
                return Ok(VerifyOutcome::ActivatedNoAutologin);
            }
        };

        let response = self.api.login(&email, &password).await?;

        if response.status == reqwest::StatusCode::UNAUTHORIZED {
            // The account is activated server-side even though the
            // cached password was rejected, so the pending artifacts are
            // spent either way
            self.store.clear_pending().await?;
            warn!(email, "Auto-login rejected, manual login required");
            return Ok(VerifyOutcome::ActivatedAutologinRejected);
        }
        if !response.is_success() {
            return Err(AuthError::from_response(&response));
        }

        let session = session_from_login(&response.body, &email)
            .ok_or(AuthError::MalformedResponse)?;
        self.store.set_session(&session).await?;
        self.store.clear_pending().await?;

        info!(email, "Activated and logged in");
        Ok(VerifyOutcome::Authenticated(session))
    }

    /// Clear the persisted session. In-memory state is the session
    /// handle's concern and is already gone by the time this runs.
    pub async fn logout(&self) -> Result<(), AuthError> {
        self.store.clear_session().await?;
        info!("Logged out");
        Ok(())
    }
}

/// A verification code is exactly 6 ASCII digits.
pub fn is_valid_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

fn body_status(response: &ApiResponse) -> Option<&str> {
    response.body.get("status").and_then(|s| s.as_str())
}

/// Build a session from a successful login body. The login response is
/// the authoritative user record; it replaces any prior one wholesale.
fn session_from_login(body: &serde_json::Value, fallback_email: &str) -> Option<Session> {
    let token = body.get("token")?.as_str()?.to_string();
    let user = UserSummary {
        id: body.get("id")?.as_i64()?,
        email: body
            .get("email")
            .and_then(|e| e.as_str())
            .unwrap_or(fallback_email)
            .to_string(),
        token: token.clone(),
        role: body
            .get("role")
            .and_then(|r| r.as_str())
            .unwrap_or("USER")
            .to_string(),
        status: body
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("Activated")
            .to_string(),
        firstname: body
            .get("firstname")
            .and_then(|f| f.as_str())
            .map(str::to_string),
        lastname: body
            .get("lastname")
            .and_then(|l| l.as_str())
            .map(str::to_string),
        cin: body.get("cin").and_then(|c| c.as_i64()),
    };
    Some(Session { token, user })
}

fn classify_verify_failure(response: &ApiResponse) -> AuthError {
    let status = response.status.as_u16();
    let message = match status {
        404 => "User not found. Please check your email.".to_string(),
        400 => response
            .body
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Invalid request.")
            .to_string(),
        _ => response.error_message(),
    };
    AuthError::Server { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::MockTransport;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (AuthLifecycle, Arc<MockTransport>, SessionStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(dir.path()).await.unwrap();
        let api = Arc::new(MockTransport::default());
        let lifecycle = AuthLifecycle::new(api.clone(), store.clone())
            .with_settle_delay(Duration::ZERO);
        (lifecycle, api, store, dir)
    }

    fn login_success_body() -> serde_json::Value {
        json!({
            "token": "eyJhbGciOiJIUzI1NiJ9.payload.sig",
            "id": 1,
            "email": "a@b.com",
            "role": "USER",
            "status": "ACTIVE"
        })
    }

    async fn seed_pending(store: &SessionStore, password: Option<&str>) {
        store
            .set_pending(PendingUpdate {
                code: Some("123456".to_string()),
                email: Some("a@b.com".to_string()),
                password: password.map(str::to_string),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_login_success_authenticates_and_persists() {
        let (lifecycle, api, store, _dir) = setup().await;
        api.queue_login(200, login_success_body());

        let outcome = lifecycle.login("a@b.com", "pw1").await.unwrap();
        let session = match outcome {
            LoginOutcome::Authenticated(session) => session,
            other => panic!("expected Authenticated, got {other:?}"),
        };

        assert_eq!(session.token, "eyJhbGciOiJIUzI1NiJ9.payload.sig");
        assert_eq!(session.user.id, 1);
        assert_eq!(store.session().await.unwrap().unwrap(), session);
        assert_eq!(lifecycle.phase().await.unwrap(), AuthPhase::Authenticated);
    }

    #[tokio::test]
    async fn test_login_waiting_for_validation_never_sets_session() {
        let (lifecycle, api, store, _dir) = setup().await;
        api.queue_login(200, json!({"status": WAITING_FOR_VALIDATION, "code": "654321"}));

        let outcome = lifecycle.login("a@b.com", "pw1").await.unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::AwaitingVerification {
                email: "a@b.com".to_string(),
                code: Some("654321".to_string()),
            }
        );

        assert!(store.session().await.unwrap().is_none());
        let pending = store.pending().await.unwrap();
        assert_eq!(pending.ready(), Some(("654321", "a@b.com")));
        assert!(pending.password.is_none());
        assert_eq!(
            lifecycle.phase().await.unwrap(),
            AuthPhase::AwaitingVerification
        );
    }

    #[tokio::test]
    async fn test_login_waiting_without_code_persists_nothing() {
        let (lifecycle, api, store, _dir) = setup().await;
        api.queue_login(200, json!({"status": WAITING_FOR_VALIDATION}));

        let outcome = lifecycle.login("a@b.com", "pw1").await.unwrap();
        assert!(matches!(
            outcome,
            LoginOutcome::AwaitingVerification { code: None, .. }
        ));
        assert!(store.pending().await.unwrap().ready().is_none());
    }

    #[tokio::test]
    async fn test_login_rejection_leaves_session_cleared() {
        let (lifecycle, api, store, _dir) = setup().await;
        api.queue_login(401, json!({"error": "Bad credentials"}));

        let err = lifecycle.login("a@b.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::Server { status: 401, .. }));
        assert_eq!(err.to_string(), "Bad credentials");
        assert!(store.session().await.unwrap().is_none());
        assert_eq!(lifecycle.phase().await.unwrap(), AuthPhase::Anonymous);
    }

    #[tokio::test]
    async fn test_login_success_without_token_is_malformed() {
        let (lifecycle, api, store, _dir) = setup().await;
        api.queue_login(200, json!({"id": 1}));

        let err = lifecycle.login("a@b.com", "pw1").await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse));
        assert!(store.session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_register_surfaces_user_and_code() {
        let (lifecycle, api, _store, _dir) = setup().await;
        api.queue_register(200, json!({"user": {"id": 7, "email": "a@b.com"}, "code": "123456"}));

        let request = RegisterRequest {
            email: "a@b.com".to_string(),
            password: "pw1".to_string(),
            firstname: None,
            lastname: None,
            cin: None,
        };
        let registered = lifecycle.register(&request, None).await.unwrap();

        assert_eq!(registered.user["id"], 7);
        assert_eq!(registered.code.as_deref(), Some("123456"));
    }

    #[tokio::test]
    async fn test_register_flat_body_is_the_user() {
        let (lifecycle, api, _store, _dir) = setup().await;
        api.queue_register(200, json!({"id": 7, "email": "a@b.com"}));

        let request = RegisterRequest {
            email: "a@b.com".to_string(),
            password: "pw1".to_string(),
            firstname: None,
            lastname: None,
            cin: None,
        };
        let registered = lifecycle.register(&request, None).await.unwrap();

        assert_eq!(registered.user["email"], "a@b.com");
        assert!(registered.code.is_none());
    }

    #[tokio::test]
    async fn test_verify_mismatch_makes_no_network_calls() {
        let (lifecycle, api, store, _dir) = setup().await;
        seed_pending(&store, Some("pw1")).await;

        let err = lifecycle.verify("999999").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_verify_is_exact_match_no_trimming() {
        let (lifecycle, api, store, _dir) = setup().await;
        seed_pending(&store, Some("pw1")).await;

        // Trailing whitespace is not stripped before comparison
        let err = lifecycle.verify("123456 ").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCode));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_verify_without_pending_redirects_to_registration() {
        let (lifecycle, api, _store, _dir) = setup().await;

        let err = lifecycle.verify("123456").await.unwrap_err();
        assert!(matches!(err, AuthError::NoPendingVerification));
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_verify_with_password_activates_and_logs_in() {
        let (lifecycle, api, store, _dir) = setup().await;
        seed_pending(&store, Some("pw1")).await;
        api.queue_verify(200, json!({"message": "Account activated"}));
        api.queue_login(200, login_success_body());

        let outcome = lifecycle.verify("123456").await.unwrap();
        let session = match outcome {
            VerifyOutcome::Authenticated(session) => session,
            other => panic!("expected Authenticated, got {other:?}"),
        };

        // Exactly one activation call and exactly one login call
        assert_eq!(api.calls(), vec!["verify", "login"]);
        assert_eq!(store.session().await.unwrap().unwrap(), session);
        assert!(store.pending().await.unwrap().ready().is_none());
    }

    #[tokio::test]
    async fn test_verify_without_password_skips_login_and_clears_pending() {
        let (lifecycle, api, store, _dir) = setup().await;
        seed_pending(&store, None).await;
        api.queue_verify(200, json!({"message": "Account activated"}));

        let outcome = lifecycle.verify("123456").await.unwrap();
        assert_eq!(outcome, VerifyOutcome::ActivatedNoAutologin);

        assert_eq!(api.calls(), vec!["verify"]);
        assert!(store.session().await.unwrap().is_none());
        let pending = store.pending().await.unwrap();
        assert!(pending.ready().is_none());
        assert!(pending.password.is_none());
    }

    #[tokio::test]
    async fn test_verify_blank_password_degrades_like_missing() {
        let (lifecycle, api, store, _dir) = setup().await;
        seed_pending(&store, Some("   ")).await;
        api.queue_verify(200, json!({"message": "Account activated"}));

        let outcome = lifecycle.verify("123456").await.unwrap();
        assert_eq!(outcome, VerifyOutcome::ActivatedNoAutologin);
        assert_eq!(api.calls(), vec!["verify"]);
        assert!(store.pending().await.unwrap().ready().is_none());
    }

    #[tokio::test]
    async fn test_verify_autologin_rejected_clears_pending() {
        let (lifecycle, api, store, _dir) = setup().await;
        seed_pending(&store, Some("stale-password")).await;
        api.queue_verify(200, json!({"message": "Account activated"}));
        api.queue_login(401, json!({"error": "Bad credentials"}));

        let outcome = lifecycle.verify("123456").await.unwrap();
        assert_eq!(outcome, VerifyOutcome::ActivatedAutologinRejected);

        assert_eq!(api.calls(), vec!["verify", "login"]);
        assert!(store.session().await.unwrap().is_none());
        assert!(store.pending().await.unwrap().ready().is_none());
    }

    #[tokio::test]
    async fn test_verify_activation_404_maps_to_user_not_found() {
        let (lifecycle, api, store, _dir) = setup().await;
        seed_pending(&store, Some("pw1")).await;
        api.queue_verify(404, json!({}));

        let err = lifecycle.verify("123456").await.unwrap_err();
        assert_eq!(err.to_string(), "User not found. Please check your email.");
        // Activation never happened, so the pending artifacts survive
        assert!(store.pending().await.unwrap().ready().is_some());
    }

    #[tokio::test]
    async fn test_logout_clears_persisted_session() {
        let (lifecycle, api, store, _dir) = setup().await;
        api.queue_login(200, login_success_body());
        lifecycle.login("a@b.com", "pw1").await.unwrap();

        lifecycle.logout().await.unwrap();
        assert!(store.session().await.unwrap().is_none());
        assert_eq!(lifecycle.phase().await.unwrap(), AuthPhase::Anonymous);
    }

    #[test]
    fn test_is_valid_code() {
        assert!(is_valid_code("123456"));
        assert!(is_valid_code("000000"));
        assert!(!is_valid_code("12345"));
        assert!(!is_valid_code("1234567"));
        assert!(!is_valid_code("12345a"));
        assert!(!is_valid_code(" 123456"));
        assert!(!is_valid_code("123456 "));
        assert!(!is_valid_code(""));
    }
}
