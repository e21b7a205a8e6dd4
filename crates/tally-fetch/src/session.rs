//! Boundary to the embedded browser that holds the signed-in session.

use async_trait::async_trait;

use crate::credentials::StoredCookie;

/// The web view the user signs in through.
///
/// The orchestrator never touches the page directly; every interaction
/// goes through this trait so the state machine can run headless.
#[async_trait]
pub trait WebSession: Send + Sync {
    /// Whether the cookie store currently holds a session credential.
    async fn has_session_credential(&self) -> bool;

    /// URL of the page currently shown, if any.
    async fn current_url(&self) -> Option<String>;

    async fn navigate(&self, url: &str);

    /// Reload the sign-in origin after the session was cleared.
    async fn reload_origin(&self, origin: &str);

    /// Snapshot of the cookies for the service's domain.
    async fn cookies(&self) -> Vec<StoredCookie>;

    async fn restore_cookies(&self, cookies: &[StoredCookie]);

    async fn clear_cookies(&self);
}
