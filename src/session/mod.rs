//! Session consumers.
//!
//! A cloneable handle exposing a read-only projection of the current
//! auth state plus bound dispatchers for the lifecycle transitions. The
//! snapshot lives behind an `ArcSwap`, so readers get a consistent view
//! without locking while a transition is rewriting it.

use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::auth::lifecycle::{
    AuthError, AuthLifecycle, AuthPhase, LoginOutcome, Registered, VerifyOutcome,
};
use crate::auth::RegisterRequest;
use crate::store::Session;

/// Read-only projection of the auth state.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSnapshot {
    pub phase: AuthPhase,
    pub session: Option<Session>,
    pub error: Option<String>,
    /// A primary auth operation (login, register, verify) is in flight.
    pub loading: bool,
    /// Logout is in flight.
    pub logout_loading: bool,
}

impl AuthSnapshot {
    fn anonymous() -> Self {
        Self {
            phase: AuthPhase::Anonymous,
            session: None,
            error: None,
            loading: false,
            logout_loading: false,
        }
    }
}

/// Shared auth state plus bound lifecycle dispatchers.
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<ArcSwap<AuthSnapshot>>,
    lifecycle: Arc<AuthLifecycle>,
}

impl SessionHandle {
    pub fn new(lifecycle: Arc<AuthLifecycle>) -> Self {
        Self {
            state: Arc::new(ArcSwap::from_pointee(AuthSnapshot::anonymous())),
            lifecycle,
        }
    }

    /// Load persisted state into the snapshot, e.g. on startup.
    pub async fn restore(&self) -> Result<(), AuthError> {
        let phase = self.lifecycle.phase().await?;
        let session = self.lifecycle.store().session().await?;
        self.update(|s| {
            s.phase = phase;
            s.session = session.clone();
        });
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<AuthSnapshot> {
        self.state.load_full()
    }

    /// True while either a primary auth operation or logout is in
    /// flight; callers disable their controls on this flag.
    pub fn is_busy(&self) -> bool {
        let snapshot = self.state.load();
        snapshot.loading || snapshot.logout_loading
    }

    fn update(&self, f: impl FnOnce(&mut AuthSnapshot)) {
        let mut next = AuthSnapshot::clone(&self.state.load());
        f(&mut next);
        self.state.store(Arc::new(next));
    }

    pub fn clear_error(&self) {
        self.update(|s| s.error = None);
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, AuthError> {
        self.update(|s| {
            s.loading = true;
            s.error = None;
        });

        let result = self.lifecycle.login(email, password).await;

        match &result {
            Ok(LoginOutcome::Authenticated(session)) => self.update(|s| {
                s.loading = false;
                s.phase = AuthPhase::Authenticated;
                s.session = Some(session.clone());
            }),
            Ok(LoginOutcome::AwaitingVerification { .. }) => self.update(|s| {
                s.loading = false;
                s.phase = AuthPhase::AwaitingVerification;
                s.session = None;
            }),
            Err(e) => {
                let message = e.to_string();
                self.update(|s| {
                    s.loading = false;
                    s.session = None;
                    s.error = Some(message.clone());
                });
            }
        }

        result
    }

    pub async fn register(
        &self,
        request: &RegisterRequest,
        photo: Option<&Path>,
    ) -> Result<Registered, AuthError> {
        self.update(|s| {
            s.loading = true;
            s.error = None;
        });

        let result = self.lifecycle.register(request, photo).await;

        match &result {
            Ok(_) => self.update(|s| s.loading = false),
            Err(e) => {
                let message = e.to_string();
                self.update(|s| {
                    s.loading = false;
                    s.error = Some(message.clone());
                });
            }
        }

        result
    }

    pub async fn verify(&self, code: &str) -> Result<VerifyOutcome, AuthError> {
        self.update(|s| {
            s.loading = true;
            s.error = None;
        });

        let result = self.lifecycle.verify(code).await;

        match &result {
            Ok(VerifyOutcome::Authenticated(session)) => self.update(|s| {
                s.loading = false;
                s.phase = AuthPhase::Authenticated;
                s.session = Some(session.clone());
            }),
            Ok(_) => self.update(|s| {
                s.loading = false;
                s.phase = AuthPhase::Anonymous;
                s.session = None;
            }),
            Err(e) => {
                let message = e.to_string();
                self.update(|s| {
                    s.loading = false;
                    s.error = Some(message.clone());
                });
            }
        }

        result
    }

    /// Log out. The in-memory session is cleared immediately, before the
    /// persistent clear is attempted, so dependent readers never see a
    /// logged-in state while storage I/O is pending. The storage clear
    /// is best-effort; returns whether it succeeded.
    pub async fn logout(&self) -> bool {
        self.update(|s| {
            s.phase = AuthPhase::Anonymous;
            s.session = None;
            s.error = None;
            s.loading = false;
            s.logout_loading = true;
        });

        let cleared = match self.lifecycle.logout().await {
            Ok(()) => true,
            Err(e) => {
                // State is already anonymous; a storage failure must not
                // make the user appear logged in again
                warn!(error = %e, "Failed to clear persisted session");
                false
            }
        };

        self.update(|s| s.logout_loading = false);
        cleared
    }
}
