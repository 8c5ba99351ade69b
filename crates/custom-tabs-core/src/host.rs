//! Collaborators outside the core: the rendering engine, the network stack
//! and the network-type monitor.
//!
//! The core never renders or fetches anything itself. It decides *whether*
//! and *when*, then calls these traits. Render resources come back as
//! ownership handles ([`RenderTarget`], [`SpareRenderer`]) that are not
//! `Clone` and must be handed back through [`RenderTarget::release`] /
//! [`SpareRenderer::release`], so every teardown is an explicit call.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::extras::Extras;
use crate::url_policy::Origin;

/// Identifier of a render context (hidden or visible tab contents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderTargetId(pub u64);

impl fmt::Display for RenderTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target-{}", self.0)
    }
}

/// Identifier of a pre-warmed, URL-agnostic renderer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpareRendererId(pub u64);

/// Exclusively owned render context.
#[derive(Debug, PartialEq, Eq)]
pub struct RenderTarget {
    id: RenderTargetId,
}

impl RenderTarget {
    #[must_use]
    pub fn new(id: RenderTargetId) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn id(&self) -> RenderTargetId {
        self.id
    }

    /// Destroy the render context.
    pub fn release(self, host: &dyn RenderHost) {
        host.destroy_target(self.id);
    }

    /// Hand the context over to the visible navigation. The core stops
    /// owning it; the id remains usable for page messaging.
    #[must_use]
    pub fn into_visible(self) -> RenderTargetId {
        self.id
    }
}

/// Exclusively owned spare renderer.
#[derive(Debug, PartialEq, Eq)]
pub struct SpareRenderer {
    id: SpareRendererId,
}

impl SpareRenderer {
    #[must_use]
    pub fn new(id: SpareRendererId) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn id(&self) -> SpareRendererId {
        self.id
    }

    pub fn release(self, host: &dyn RenderHost) {
        host.destroy_spare_renderer(self.id);
    }

    /// Give the renderer to a hidden tab being created.
    #[must_use]
    pub fn into_hidden_tab(self) -> SpareRendererId {
        self.id
    }
}

/// Why a message could not reach page content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessagingError {
    #[error("render target {0} no longer exists")]
    TargetGone(RenderTargetId),
    #[error("page rejected the message: {0}")]
    Rejected(String),
}

/// The rendering engine.
///
/// Calls must return promptly; real implementations post work to their own
/// threads.
pub trait RenderHost: Send + Sync + fmt::Debug {
    fn create_spare_renderer(&self) -> Option<SpareRendererId>;

    fn destroy_spare_renderer(&self, spare: SpareRendererId);

    /// Start loading `url` in a hidden context, reusing `spare` if given.
    /// A passed spare is consumed even when creation fails.
    fn create_hidden_tab(
        &self,
        url: &Url,
        referrer: &str,
        spare: Option<SpareRendererId>,
    ) -> Option<RenderTargetId>;

    fn destroy_target(&self, target: RenderTargetId);

    /// Make a hidden context visible. If `url` differs from what was loaded
    /// (fragment only) the current history entry is replaced.
    fn promote_target(&self, target: RenderTargetId, url: &Url);

    /// Open a visible tab with a fresh navigation.
    fn open_tab(&self, url: &Url, referrer: &str) -> Option<RenderTargetId>;

    /// Warm up a connection (DNS, TCP, TLS) without rendering.
    fn preconnect(&self, url: &Url);

    fn post_message(
        &self,
        target: RenderTargetId,
        source_origin: &Origin,
        message: &str,
    ) -> Result<(), MessagingError>;

    /// Forwarded toolbar/visual updates. Opaque to the core.
    fn update_visuals(&self, visuals: &Extras) -> bool;
}

/// Connection class, read from a cached fast-path value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    Unmetered,
    Cellular,
    Offline,
}

pub trait NetworkMonitor: Send + Sync + fmt::Debug {
    /// Last known connection class. Must not block.
    fn current(&self) -> NetworkClass;
}

/// Classifier verdict on a fetched resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "threat", rename_all = "snake_case")]
pub enum FetchVerdict {
    Clean,
    Blocked(String),
}

/// The network stack used for detached (parallel) requests.
///
/// Cookie policy and threat classification happen inside the implementation.
#[async_trait]
pub trait ParallelFetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, url: &Url, referrer: &Origin) -> FetchVerdict;
}
