//! Authentication flows.
//!
//! Each flow marks itself as processing, calls the [`AuthProvider`], and
//! records either a translated error or completion. Auth state itself
//! (signed-in user) arrives separately through the remote's auth listener.

use std::sync::Arc;

use livebind_core::{AuthField, EventSink, SyncEvent, Value};

use crate::error::{RemoteError, RemoteResult};
use crate::remote::Pending;

/// Callback receiving the outcome of an auth request.
pub type AuthReply = Box<dyn FnOnce(RemoteResult<Value>) + Send>;

/// OAuth interaction style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthFlow {
    /// Sign in through a popup window.
    Popup,
    /// Sign in through a full-page redirect.
    Redirect,
}

impl OAuthFlow {
    /// Name of the flow.
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthFlow::Popup => "popup",
            OAuthFlow::Redirect => "redirect",
        }
    }
}

/// Account operations offered by the remote.
pub trait AuthProvider: Send + Sync {
    /// Signs in with email and password.
    fn sign_in_with_password(&self, email: &str, password: &str, reply: AuthReply);

    /// Signs in through a third-party provider.
    fn sign_in_with_oauth(&self, flow: OAuthFlow, provider: &str, reply: AuthReply);

    /// Registers a new account.
    fn create_user(&self, email: &str, password: &str, reply: AuthReply);

    /// Sends a password reset.
    fn reset_password(&self, email: &str, reply: AuthReply);

    /// Signs the current user out.
    fn sign_out(&self);
}

const CREATE_USER_ERRORS: &[(&str, &str)] = &[
    (
        "EMAIL_TAKEN",
        "The new user account cannot be created because the email is already in use.",
    ),
    ("INVALID_EMAIL", "The specified email is not a valid email."),
];

const RESET_PASSWORD_ERRORS: &[(&str, &str)] =
    &[("INVALID_USER", "The specified user account does not exist.")];

/// User-facing message for a failed flow.
pub fn error_message(field: AuthField, error: &RemoteError) -> String {
    let table = match field {
        AuthField::CreateUser => CREATE_USER_ERRORS,
        AuthField::ResetPassword => RESET_PASSWORD_ERRORS,
        AuthField::Login => &[],
    };
    error
        .code()
        .and_then(|code| table.iter().find(|(known, _)| *known == code))
        .map(|(_, message)| (*message).to_string())
        .unwrap_or_else(|| error.to_string())
}

/// Drives auth flows and records their progress in the store.
#[derive(Clone)]
pub struct AuthFlows {
    provider: Arc<dyn AuthProvider>,
    sink: Arc<dyn EventSink>,
}

impl AuthFlows {
    /// Creates the flows.
    pub fn new(provider: Arc<dyn AuthProvider>, sink: Arc<dyn EventSink>) -> Self {
        Self { provider, sink }
    }

    /// Signs in with email and password.
    pub fn password_login(&self, email: &str, password: &str) -> Pending {
        let reply = self.begin(AuthField::Login);
        self.provider.sign_in_with_password(email, password, reply.0);
        reply.1
    }

    /// Signs in through an OAuth provider.
    pub fn oauth_login(&self, flow: OAuthFlow, provider: &str) -> Pending {
        let reply = self.begin(AuthField::Login);
        self.provider.sign_in_with_oauth(flow, provider, reply.0);
        reply.1
    }

    /// Registers an account.
    pub fn create_user(&self, email: &str, password: &str) -> Pending {
        let reply = self.begin(AuthField::CreateUser);
        self.provider.create_user(email, password, reply.0);
        reply.1
    }

    /// Requests a password reset.
    pub fn reset_password(&self, email: &str) -> Pending {
        let reply = self.begin(AuthField::ResetPassword);
        self.provider.reset_password(email, reply.0);
        reply.1
    }

    /// Signs out. The auth listener reports the change.
    pub fn sign_out(&self) {
        self.provider.sign_out();
    }

    /// Clears the login error.
    pub fn clear_login_error(&self) {
        self.clear(AuthField::Login);
    }

    /// Clears the registration error.
    pub fn clear_registration_error(&self) {
        self.clear(AuthField::CreateUser);
    }

    /// Clears the password reset error.
    pub fn clear_reset_password_error(&self) {
        self.clear(AuthField::ResetPassword);
    }

    fn clear(&self, field: AuthField) {
        self.sink.dispatch(SyncEvent::ErrorUpdated { field, error: None });
    }

    fn begin(&self, field: AuthField) -> (AuthReply, Pending) {
        self.sink.dispatch(SyncEvent::ProcessingUpdated { field, value: true });
        let (pending, complete) = Pending::channel();
        let sink = Arc::clone(&self.sink);
        let reply: AuthReply = Box::new(move |result: RemoteResult<Value>| {
            match &result {
                Ok(_) => {
                    sink.dispatch(SyncEvent::ProcessingUpdated { field, value: false });
                    sink.dispatch(SyncEvent::CompletedUpdated { field, value: true });
                }
                Err(err) => {
                    tracing::debug!(?field, error = %err, "auth flow failed");
                    sink.dispatch(SyncEvent::ErrorUpdated {
                        field,
                        error: Some(error_message(field, err)),
                    });
                    sink.dispatch(SyncEvent::ProcessingUpdated { field, value: false });
                }
            }
            complete(result.map(|_| ()));
        });
        (reply, pending)
    }
}
