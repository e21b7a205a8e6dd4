//! # tally-fetch
//!
//! Remote usage reads and the orchestrator that schedules them.
//!
//! This crate provides:
//! - [`Orchestrator`] - Session state machine driving fetch cycles
//! - [`WebSession`] - Boundary to the embedded browser
//! - [`UsageSource`] / [`HttpUsageClient`] - Remote usage read
//! - [`CredentialStore`] - Cookie backup across restarts
//! - [`payload`] - Parsing of both usage payload shapes
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tally_fetch::{
//!     CredentialStore, HttpUsageClient, Orchestrator, OrchestratorDeps, Persistence, WebSession,
//! };
//!
//! # async fn example(
//! #     session: Arc<dyn WebSession>,
//! #     persistence: Persistence,
//! # ) -> anyhow::Result<()> {
//! let config = tally_core::TallyConfig::default();
//! let deps = OrchestratorDeps {
//!     session,
//!     source: Arc::new(HttpUsageClient::new(&config.api_base_url)?),
//!     persistence,
//!     credentials: CredentialStore::new(config.credentials_path()),
//! };
//! let (handle, _task) = Orchestrator::spawn(config, deps);
//! handle.refresh();
//! # Ok(())
//! # }
//! ```

pub mod credentials;
pub mod cycle;
pub mod display;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod payload;
pub mod session;

pub use credentials::{CredentialStore, StoredCookie};
pub use cycle::{CycleOutcome, Persistence};
pub use display::{DisplayState, FetchState, Phase};
pub use error::{FetchError, Result};
pub use http::{HttpUsageClient, UsageSource};
pub use orchestrator::{
    FetchFailure, Orchestrator, OrchestratorDeps, OrchestratorEvent, OrchestratorHandle,
};
pub use session::WebSession;
