//! custom-tabs-core: Core library for Custom Tabs
//!
//! This crate provides the session and speculative-navigation core that lets
//! a client application hand the browser a URL to warm up and pre-render
//! before the user navigates, under per-client abuse limits and origin checks.
//!
//! # Architecture
//!
//! ```text
//! ClientBinding ──▶ Coordinator (single writer) ──▶ RenderHost / ParallelFetcher
//!                      │
//!                      ├── SessionRegistry ── RequestThrottler
//!                      │        └──────────── OriginVerifier ──▶ AssetLinkVerifier
//!                      ├── SpeculationController (one speculation, one spare)
//!                      └── MessageChannel per session
//! ```
//!
//! # Modules
//!
//! - `connection`: Coordinator task, browser handle and client bindings
//! - `session`: Session registry, warmup and prediction classification
//! - `speculation`: Speculation slot and spare renderer pool
//! - `post_message`: Origin-gated postMessage channel state machine
//! - `throttle`: Per-client backoff with decaying trust
//! - `origin_verifier`: https-only cached origin verification
//! - `host`: Collaborator traits and render resource handles
//! - `extras`: Structured extras and candidate lists
//! - `url_policy`: URL, origin and referrer rules
//! - `simulated`: In-memory collaborators for tests and scenario replay
//! - `config`: Configuration management
//! - `logging`: Tracing subscriber setup
//! - `clock`: Wall and manual clocks
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod extras;
pub mod host;
pub mod logging;
pub mod origin_verifier;
pub mod post_message;
pub mod session;
pub mod simulated;
pub mod speculation;
pub mod throttle;
pub mod url_policy;

pub use connection::{ClientBinding, ClientEvent, Collaborators, ConnectionHandle};
pub use error::{Error, Result};
pub use session::{ClientIdentity, SessionToken};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
