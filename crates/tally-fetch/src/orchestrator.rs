//! Fetch orchestrator.
//!
//! One tokio task owns the [`Orchestrator`] and is its only mutator. Every
//! signal (credential changes, page loads, timers, user actions and
//! finished cycles) arrives as an [`OrchestratorEvent`] and goes through
//! [`Orchestrator::handle`]. Each handler is idempotent against the
//! current phase, so racing signals are harmless.
//!
//! ```text
//! SignedOut -> AwaitingSession -> LoggedIn(Idle) <-> LoggedIn(Fetching)
//!     ^                                  |
//!     +------------- sign out -----------+
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tally_core::{TallyConfig, UsageReading};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::cycle::{CycleOutcome, Persistence, Seed};
use crate::display::{DisplayState, FetchState, Phase};
use crate::error::FetchError;
use crate::http::UsageSource;
use crate::session::WebSession;

/// A fetch that did not produce a reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub message: String,
    pub auth: bool,
}

impl From<FetchError> for FetchFailure {
    fn from(e: FetchError) -> Self {
        Self {
            auth: e.is_auth_error(),
            message: e.to_string(),
        }
    }
}

/// Everything that can move the state machine.
#[derive(Debug)]
pub enum OrchestratorEvent {
    /// Restore backed-up credentials and start waiting for a session
    Start,
    /// The cookie store reported a change
    CredentialsChanged,
    LoginPollTick,
    PageLoaded { url: String },
    /// User asked for a refresh; allowed even while auth is degraded
    RefreshRequested,
    AutoRefreshTick,
    /// A read issued right after a page load while awaiting a session
    PageReadFinished {
        generation: u64,
        result: Result<UsageReading, FetchFailure>,
    },
    FetchFinished {
        generation: u64,
        result: Result<Box<CycleOutcome>, FetchFailure>,
    },
    SignOutRequested,
    /// An external sign-in window (SSO, OAuth) opened
    ExternalLoginOpened { id: u64 },
    ExternalLoginClosed { id: u64 },
    SessionRecheck,
    Shutdown,
}

/// Cancellable timers; each is aborted before being replaced.
#[derive(Default)]
struct Timers {
    auto_refresh: Option<JoinHandle<()>>,
    login_poll: Option<JoinHandle<()>>,
    session_recheck: Option<JoinHandle<()>>,
}

impl Timers {
    fn replace(slot: &mut Option<JoinHandle<()>>, task: JoinHandle<()>) {
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    fn cancel(slot: &mut Option<JoinHandle<()>>) {
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        Self::cancel(&mut self.auto_refresh);
        Self::cancel(&mut self.login_poll);
        Self::cancel(&mut self.session_recheck);
    }
}

/// Send `event` every `period`, starting one period from now.
fn spawn_ticker(
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    period: Duration,
    event: fn() -> OrchestratorEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if events.send(event()).is_err() {
                break;
            }
        }
    })
}

/// Collaborators the orchestrator drives.
pub struct OrchestratorDeps {
    pub session: Arc<dyn WebSession>,
    pub source: Arc<dyn UsageSource>,
    pub persistence: Persistence,
    pub credentials: CredentialStore,
}

/// The fetch state machine.
pub struct Orchestrator {
    config: TallyConfig,
    deps: OrchestratorDeps,
    phase: Phase,
    auth_degraded: bool,
    last_redirect: Option<Instant>,
    external_logins: HashSet<u64>,
    timers: Timers,
    /// Identifies the read in flight; results carrying another value are stale
    fetch_generation: u64,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    display: watch::Sender<DisplayState>,
}

/// Cloneable handle used by signal sources and the UI.
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    display: watch::Receiver<DisplayState>,
}

impl OrchestratorHandle {
    /// Queue an event; false once the orchestrator has stopped.
    pub fn send(&self, event: OrchestratorEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn refresh(&self) -> bool {
        self.send(OrchestratorEvent::RefreshRequested)
    }

    pub fn sign_out(&self) -> bool {
        self.send(OrchestratorEvent::SignOutRequested)
    }

    pub fn page_loaded(&self, url: impl Into<String>) -> bool {
        self.send(OrchestratorEvent::PageLoaded { url: url.into() })
    }

    pub fn credentials_changed(&self) -> bool {
        self.send(OrchestratorEvent::CredentialsChanged)
    }

    pub fn shutdown(&self) -> bool {
        self.send(OrchestratorEvent::Shutdown)
    }

    /// Current display state.
    pub fn display(&self) -> DisplayState {
        self.display.borrow().clone()
    }

    /// Receiver notified on every display change.
    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.display.clone()
    }
}

impl Orchestrator {
    /// Build the orchestrator and spawn its owning task.
    pub fn spawn(config: TallyConfig, deps: OrchestratorDeps) -> (OrchestratorHandle, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (display_tx, display_rx) = watch::channel(DisplayState::default());

        let orchestrator = Orchestrator {
            config,
            deps,
            phase: Phase::SignedOut,
            auth_degraded: false,
            last_redirect: None,
            external_logins: HashSet::new(),
            timers: Timers::default(),
            fetch_generation: 0,
            events: events_tx.clone(),
            display: display_tx,
        };

        let task = tokio::spawn(orchestrator.run(events_rx));
        let handle = OrchestratorHandle {
            events: events_tx,
            display: display_rx,
        };
        handle.send(OrchestratorEvent::Start);
        (handle, task)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<OrchestratorEvent>) {
        self.seed().await;

        while let Some(event) = events.recv().await {
            if matches!(event, OrchestratorEvent::Shutdown) {
                break;
            }
            self.handle(event).await;
        }

        self.timers.cancel_all();
        info!("Orchestrator stopped");
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Single entry point for every state change.
    pub async fn handle(&mut self, event: OrchestratorEvent) {
        debug!(?event, phase = ?self.phase, "Orchestrator event");

        match event {
            OrchestratorEvent::Start => self.start().await,
            OrchestratorEvent::CredentialsChanged | OrchestratorEvent::LoginPollTick => {
                if self.phase == Phase::AwaitingSession {
                    self.check_session().await;
                }
            }
            OrchestratorEvent::PageLoaded { url } => self.page_loaded(&url).await,
            OrchestratorEvent::RefreshRequested => {
                if self.phase == Phase::LoggedIn(FetchState::Idle) {
                    self.start_fetch(None).await;
                } else {
                    debug!(phase = ?self.phase, "Refresh dropped");
                }
            }
            OrchestratorEvent::AutoRefreshTick => {
                if self.phase == Phase::LoggedIn(FetchState::Idle) && !self.auth_degraded {
                    self.start_fetch(None).await;
                }
            }
            OrchestratorEvent::PageReadFinished { generation, result } => {
                self.page_read_finished(generation, result).await
            }
            OrchestratorEvent::FetchFinished { generation, result } => {
                self.fetch_finished(generation, result).await
            }
            OrchestratorEvent::SignOutRequested => self.sign_out().await,
            OrchestratorEvent::ExternalLoginOpened { id } => {
                self.external_logins.insert(id);
            }
            OrchestratorEvent::ExternalLoginClosed { id } => {
                if self.external_logins.remove(&id) && !self.phase.is_logged_in() {
                    self.schedule_session_recheck();
                }
            }
            OrchestratorEvent::SessionRecheck => {
                if self.phase == Phase::AwaitingSession {
                    self.check_session().await;
                }
            }
            OrchestratorEvent::Shutdown => {}
        }
    }

    // ============ Session lifecycle ============

    async fn seed(&mut self) {
        let persistence = self.deps.persistence.clone();
        let retention = chrono::Duration::days(i64::from(self.config.snapshot_retention_days));
        let seed = tokio::task::spawn_blocking(move || persistence.seed(Utc::now(), retention))
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Startup load failed");
                Seed::default()
            });

        self.display.send_modify(|display| {
            display.reading = seed.reading;
            display.five_hour_history = seed.five_hour_history;
            display.seven_day_history = seed.seven_day_history;
        });
    }

    async fn start(&mut self) {
        if self.phase != Phase::SignedOut {
            return;
        }

        match self.deps.credentials.load(Utc::now()) {
            Ok(cookies) if !cookies.is_empty() => {
                info!(count = cookies.len(), "Restoring backed-up session");
                self.deps.session.restore_cookies(&cookies).await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to read credential backup"),
        }

        self.enter_awaiting_session().await;
    }

    async fn enter_awaiting_session(&mut self) {
        self.set_phase(Phase::AwaitingSession);
        Timers::replace(
            &mut self.timers.login_poll,
            spawn_ticker(
                self.events.clone(),
                self.config.login_poll_interval(),
                || OrchestratorEvent::LoginPollTick,
            ),
        );
        self.check_session().await;
    }

    async fn page_loaded(&mut self, url: &str) {
        match self.phase {
            Phase::SignedOut if same_origin(url, &self.config.origin_url) => {
                self.enter_awaiting_session().await;
            }
            Phase::AwaitingSession => self.check_session().await,
            _ => return,
        }
        if self.phase == Phase::AwaitingSession {
            self.start_page_read().await;
        }
    }

    /// Try one usage read with whatever cookies the page holds; success
    /// proves a session even when the credential check missed it.
    async fn start_page_read(&mut self) {
        let cookies = self.deps.session.cookies().await;
        if cookies.is_empty() {
            return;
        }

        self.fetch_generation += 1;
        let generation = self.fetch_generation;
        let source = Arc::clone(&self.deps.source);
        let events = self.events.clone();
        debug!(generation, "Reading usage after page load");

        tokio::spawn(async move {
            let result = source.fetch_usage(&cookies).await.map_err(FetchFailure::from);
            let _ = events.send(OrchestratorEvent::PageReadFinished { generation, result });
        });
    }

    async fn page_read_finished(
        &mut self,
        generation: u64,
        result: Result<UsageReading, FetchFailure>,
    ) {
        if generation != self.fetch_generation || self.phase != Phase::AwaitingSession {
            debug!(generation, phase = ?self.phase, "Ignoring page read result");
            return;
        }
        match result {
            Ok(reading) => {
                info!("Usage read succeeded after page load");
                self.enter_logged_in(Some(reading)).await;
            }
            Err(failure) => debug!(error = %failure.message, "Page read found no session"),
        }
    }

    async fn check_session(&mut self) {
        if self.phase.is_logged_in() {
            return;
        }
        if self.deps.session.has_session_credential().await {
            self.enter_logged_in(None).await;
        }
    }

    /// `prefetched` is a reading already obtained while detecting the
    /// session; the first cycle persists it instead of reading again.
    async fn enter_logged_in(&mut self, prefetched: Option<UsageReading>) {
        info!("Session detected");
        Timers::cancel(&mut self.timers.login_poll);
        Timers::cancel(&mut self.timers.session_recheck);
        self.set_phase(Phase::LoggedIn(FetchState::Idle));

        let cookies = self.deps.session.cookies().await;
        if let Err(e) = self.deps.credentials.save(&cookies) {
            warn!(error = %e, "Failed to back up session credentials");
        }

        self.redirect_to_usage_page().await;
        self.start_fetch(prefetched).await;
    }

    async fn redirect_to_usage_page(&mut self) {
        let target = self.config.usage_page_url.clone();
        let current = self.deps.session.current_url().await;
        if current.as_deref().is_some_and(|url| url.starts_with(&target)) {
            return;
        }

        let cooldown = self.config.redirect_cooldown();
        if self
            .last_redirect
            .is_some_and(|last| last.elapsed() < cooldown)
        {
            debug!("Redirect suppressed by cooldown");
            return;
        }

        self.last_redirect = Some(Instant::now());
        info!(url = %target, "Redirecting to usage page");
        self.deps.session.navigate(&target).await;
    }

    async fn sign_out(&mut self) {
        info!("Signing out");
        self.timers.cancel_all();
        self.external_logins.clear();
        self.fetch_generation += 1;

        self.deps.session.clear_cookies().await;
        if let Err(e) = self.deps.credentials.clear() {
            warn!(error = %e, "Failed to remove credential backup");
        }

        let persistence = self.deps.persistence.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || persistence.sign_out()).await {
            warn!(error = %e, "Snapshot sign-out failed");
        }

        let origin = self.config.origin_url.clone();
        self.deps.session.reload_origin(&origin).await;

        self.auth_degraded = false;
        self.phase = Phase::SignedOut;
        self.display.send_modify(|display| {
            display.phase = Phase::SignedOut;
            display.clear_values();
        });
    }

    fn schedule_session_recheck(&mut self) {
        let events = self.events.clone();
        let delay = self.config.session_recheck_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling session re-check");
        Timers::replace(
            &mut self.timers.session_recheck,
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(OrchestratorEvent::SessionRecheck);
            }),
        );
    }

    // ============ Fetch cycle ============

    async fn start_fetch(&mut self, prefetched: Option<UsageReading>) {
        if self.phase != Phase::LoggedIn(FetchState::Idle) {
            return;
        }
        self.set_phase(Phase::LoggedIn(FetchState::Fetching));
        self.fetch_generation += 1;
        let generation = self.fetch_generation;

        let cookies = self.deps.session.cookies().await;
        let source = Arc::clone(&self.deps.source);
        let persistence = self.deps.persistence.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let fetched = match prefetched {
                Some(reading) => Ok(reading),
                None => source.fetch_usage(&cookies).await,
            };
            let result = match fetched {
                Ok(reading) => persist(persistence, reading).await,
                Err(e) => Err(FetchFailure::from(e)),
            };
            let _ = events.send(OrchestratorEvent::FetchFinished { generation, result });
        });
    }

    async fn fetch_finished(
        &mut self,
        generation: u64,
        result: Result<Box<CycleOutcome>, FetchFailure>,
    ) {
        if generation != self.fetch_generation
            || self.phase != Phase::LoggedIn(FetchState::Fetching)
        {
            // A cycle from before a sign-out; its snapshot write must not
            // outlive the sign-out unless a new session has taken over.
            if result.is_ok() && !self.phase.is_logged_in() {
                let persistence = self.deps.persistence.clone();
                let _ = tokio::task::spawn_blocking(move || persistence.sign_out()).await;
            }
            debug!(generation, phase = ?self.phase, "Discarding stale fetch result");
            return;
        }

        self.phase = Phase::LoggedIn(FetchState::Idle);
        match result {
            Ok(outcome) => {
                let outcome = *outcome;
                self.auth_degraded = false;
                if self.timers.auto_refresh.is_none() {
                    self.start_auto_refresh();
                }
                self.display.send_modify(|display| {
                    display.phase = Phase::LoggedIn(FetchState::Idle);
                    display.last_fetch_at = Some(outcome.reading.captured_at);
                    display.reading = Some(outcome.reading);
                    display.five_hour_history = outcome.five_hour_history;
                    display.seven_day_history = outcome.seven_day_history;
                    display.five_hour_cost = outcome.five_hour_cost;
                    display.seven_day_cost = outcome.seven_day_cost;
                    display.auth_degraded = false;
                    display.last_error = None;
                });
            }
            Err(failure) => {
                if failure.auth {
                    warn!(error = %failure.message, "Fetch failed authorization; pausing auto-refresh");
                    self.auth_degraded = true;
                } else {
                    warn!(error = %failure.message, "Fetch failed");
                }
                let degraded = self.auth_degraded;
                self.display.send_modify(|display| {
                    display.phase = Phase::LoggedIn(FetchState::Idle);
                    display.auth_degraded = degraded;
                    display.last_error = Some(failure.message);
                });
            }
        }
    }

    fn start_auto_refresh(&mut self) {
        Timers::replace(
            &mut self.timers.auto_refresh,
            spawn_ticker(
                self.events.clone(),
                self.config.refresh_interval(),
                || OrchestratorEvent::AutoRefreshTick,
            ),
        );
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.display.send_modify(|display| display.phase = phase);
    }
}

async fn persist(
    persistence: Persistence,
    reading: UsageReading,
) -> Result<Box<CycleOutcome>, FetchFailure> {
    tokio::task::spawn_blocking(move || Box::new(persistence.apply(reading, Utc::now())))
        .await
        .map_err(|e| FetchFailure {
            message: format!("persisting reading failed: {e}"),
            auth: false,
        })
}

/// Scheme and host of `url` (everything before the path).
fn origin_of(url: &str) -> &str {
    let after_scheme = url.find("://").map_or(0, |i| i + 3);
    match url[after_scheme..].find('/') {
        Some(i) => &url[..after_scheme + i],
        None => url,
    }
}

fn same_origin(a: &str, b: &str) -> bool {
    origin_of(a).eq_ignore_ascii_case(origin_of(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_of() {
        assert_eq!(origin_of("https://claude.ai/login?next=1"), "https://claude.ai");
        assert_eq!(origin_of("https://claude.ai"), "https://claude.ai");
        assert!(same_origin("https://Claude.ai/new", "https://claude.ai/login"));
        assert!(!same_origin("https://accounts.google.com/o", "https://claude.ai/login"));
    }
}
