//! Identity context: who is acting, and under which display name.
//!
//! Credential verification belongs to an external [`IdentityProvider`]. The
//! [`IdentityContext`] only reads the current principal from it for
//! attribution and like ownership.

use crate::error::{FeedResult, IdentityError};
use crate::types::PrincipalId;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Display name used when the principal has no contact handle.
pub const ANONYMOUS_NAME: &str = "Anonymous";

/// An authenticated user as reported by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: PrincipalId,
    /// Contact handle, usually an email address.
    pub handle: Option<String>,
}

/// Authentication state change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    SignedIn(AuthUser),
    SignedOut,
}

/// External identity provider.
pub trait IdentityProvider: Send + Sync {
    /// Currently authenticated user, if any.
    fn current_user(&self) -> Option<AuthUser>;

    /// Stream of authentication state changes. The current state is sent first.
    fn auth_state_changes(&self) -> Receiver<AuthState>;

    /// End the current session.
    fn sign_out(&self) -> Result<(), IdentityError>;
}

/// A principal acting on the feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub id: PrincipalId,
    pub display_name: String,
}

/// Derive a display name from a contact handle: the part before the first `@`.
pub fn display_name_from_handle(handle: &str) -> String {
    match handle.split_once('@') {
        Some((local, _)) => local.to_string(),
        None => handle.to_string(),
    }
}

/// Read-only view of the current principal for the feed.
#[derive(Clone)]
pub struct IdentityContext {
    provider: Arc<dyn IdentityProvider>,
}

impl IdentityContext {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    /// The current principal, or `None` when unauthenticated.
    ///
    /// A user with an empty id counts as unauthenticated.
    pub fn principal(&self) -> Option<Principal> {
        let user = self.provider.current_user()?;
        if user.id.is_empty() {
            return None;
        }

        let display_name = match user.handle.as_deref() {
            Some(handle) if !handle.is_empty() => display_name_from_handle(handle),
            _ => ANONYMOUS_NAME.to_string(),
        };

        Some(Principal {
            id: user.id,
            display_name,
        })
    }

    /// Current principal id; empty when unauthenticated.
    pub fn current_principal_id(&self) -> String {
        self.principal()
            .map(|p| p.id.0)
            .unwrap_or_default()
    }

    /// Current display name; empty when unauthenticated.
    pub fn current_display_name(&self) -> String {
        self.principal()
            .map(|p| p.display_name)
            .unwrap_or_default()
    }

    /// Authentication state changes from the provider.
    pub fn auth_state_changes(&self) -> Receiver<AuthState> {
        self.provider.auth_state_changes()
    }

    /// End the provider's session. Provider failures surface as
    /// [`FeedError::Identity`](crate::FeedError::Identity).
    pub fn sign_out(&self) -> FeedResult<()> {
        self.provider.sign_out()?;
        Ok(())
    }
}

/// In-process identity provider.
///
/// Accepts whatever identity it is told to sign in; verification is out of
/// its scope. Useful for tests and for embedding behind a real provider's
/// callback.
pub struct LocalIdentityProvider {
    current: RwLock<Option<AuthUser>>,
    listeners: Mutex<Vec<Sender<AuthState>>>,
}

impl LocalIdentityProvider {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Provider already signed in as the given user.
    pub fn signed_in(id: impl Into<String>, handle: impl Into<String>) -> Self {
        let provider = Self::new();
        provider.sign_in(id, handle);
        provider
    }

    /// Record a successful sign-in.
    pub fn sign_in(&self, id: impl Into<String>, handle: impl Into<String>) {
        let user = AuthUser {
            id: PrincipalId::new(id),
            handle: Some(handle.into()),
        };
        info!(principal = %user.id, "signed in");

        *self.current.write() = Some(user.clone());
        self.notify(AuthState::SignedIn(user));
    }

    fn notify(&self, state: AuthState) {
        // Listeners whose receiver is gone are pruned
        self.listeners
            .lock()
            .retain(|listener| listener.send(state.clone()).is_ok());
    }
}

impl Default for LocalIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for LocalIdentityProvider {
    fn current_user(&self) -> Option<AuthUser> {
        self.current.read().clone()
    }

    fn auth_state_changes(&self) -> Receiver<AuthState> {
        let (sender, receiver) = unbounded();
        let initial = match self.current.read().clone() {
            Some(user) => AuthState::SignedIn(user),
            None => AuthState::SignedOut,
        };
        let _ = sender.send(initial);
        self.listeners.lock().push(sender);
        receiver
    }

    fn sign_out(&self) -> Result<(), IdentityError> {
        let previous = self.current.write().take();
        if let Some(user) = previous {
            debug!(principal = %user.id, "signed out");
            self.notify(AuthState::SignedOut);
        }
        Ok(())
    }
}
