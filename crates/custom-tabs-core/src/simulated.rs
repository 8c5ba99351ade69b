//! In-memory collaborators.
//!
//! Used by the test suites and by the `ctabs replay` command. Each one records
//! what the core asked of it so assertions can be made on ordering and
//! resource ownership.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::clock::ManualClock;
use crate::connection::Collaborators;
use crate::extras::Extras;
use crate::host::{
    FetchVerdict, MessagingError, NetworkClass, NetworkMonitor, ParallelFetcher, RenderHost,
    RenderTargetId, SpareRendererId,
};
use crate::origin_verifier::{AssetLinkVerifier, Relation};
use crate::url_policy::Origin;

// =============================================================================
// Render host
// =============================================================================

/// Everything the core asked the render host to do, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    SpareCreated { spare: u64 },
    SpareDestroyed { spare: u64 },
    HiddenTabCreated { target: RenderTargetId, url: String, spare: Option<u64> },
    TargetDestroyed { target: RenderTargetId },
    Promoted { target: RenderTargetId, url: String },
    TabOpened { target: RenderTargetId, url: String },
    Preconnect { url: String },
    MessagePosted { target: RenderTargetId, origin: String, len: usize },
    VisualsUpdated { keys: usize },
}

#[derive(Debug, Default)]
struct HostState {
    events: Vec<HostEvent>,
    // target -> navigation history
    live: HashMap<RenderTargetId, Vec<String>>,
    killed: HashSet<RenderTargetId>,
    spares: HashSet<u64>,
    messages: HashMap<RenderTargetId, Vec<String>>,
    refuse_hidden_tabs: bool,
}

#[derive(Debug, Default)]
pub struct SimulatedRenderHost {
    next_id: AtomicU64,
    state: Mutex<HostState>,
}

impl SimulatedRenderHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[must_use]
    pub fn events(&self) -> Vec<HostEvent> {
        self.lock().events.clone()
    }

    /// Targets created and not yet destroyed.
    #[must_use]
    pub fn live_targets(&self) -> Vec<RenderTargetId> {
        let mut targets: Vec<_> = self.lock().live.keys().copied().collect();
        targets.sort();
        targets
    }

    #[must_use]
    pub fn history(&self, target: RenderTargetId) -> Option<Vec<String>> {
        self.lock().live.get(&target).cloned()
    }

    #[must_use]
    pub fn live_spares(&self) -> usize {
        self.lock().spares.len()
    }

    #[must_use]
    pub fn preconnects(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                HostEvent::Preconnect { url } => Some(url.clone()),
                _ => None,
            })
            .collect()
    }

    /// Messages delivered to page content of `target`.
    #[must_use]
    pub fn messages(&self, target: RenderTargetId) -> Vec<String> {
        self.lock().messages.get(&target).cloned().unwrap_or_default()
    }

    /// Simulate the renderer of `target` dying. The core still has to be told
    /// through its lifecycle signal.
    pub fn kill(&self, target: RenderTargetId) {
        let mut state = self.lock();
        state.live.remove(&target);
        state.killed.insert(target);
    }

    /// Make `create_hidden_tab` fail, as under memory pressure.
    pub fn refuse_hidden_tabs(&self, refuse: bool) {
        self.lock().refuse_hidden_tabs = refuse;
    }
}

impl RenderHost for SimulatedRenderHost {
    fn create_spare_renderer(&self) -> Option<SpareRendererId> {
        let id = self.next();
        let mut state = self.lock();
        state.spares.insert(id);
        state.events.push(HostEvent::SpareCreated { spare: id });
        Some(SpareRendererId(id))
    }

    fn destroy_spare_renderer(&self, spare: SpareRendererId) {
        let mut state = self.lock();
        if state.spares.remove(&spare.0) {
            state.events.push(HostEvent::SpareDestroyed { spare: spare.0 });
        }
    }

    fn create_hidden_tab(
        &self,
        url: &Url,
        _referrer: &str,
        spare: Option<SpareRendererId>,
    ) -> Option<RenderTargetId> {
        let mut state = self.lock();
        if let Some(spare) = spare {
            state.spares.remove(&spare.0);
        }
        if state.refuse_hidden_tabs {
            return None;
        }
        drop(state);
        let target = RenderTargetId(self.next());
        let mut state = self.lock();
        state.live.insert(target, vec![url.to_string()]);
        state.events.push(HostEvent::HiddenTabCreated {
            target,
            url: url.to_string(),
            spare: spare.map(|s| s.0),
        });
        Some(target)
    }

    fn destroy_target(&self, target: RenderTargetId) {
        let mut state = self.lock();
        state.live.remove(&target);
        state.events.push(HostEvent::TargetDestroyed { target });
    }

    fn promote_target(&self, target: RenderTargetId, url: &Url) {
        let mut state = self.lock();
        if let Some(history) = state.live.get_mut(&target) {
            match history.last_mut() {
                Some(last) => *last = url.to_string(),
                None => history.push(url.to_string()),
            }
        }
        state.events.push(HostEvent::Promoted {
            target,
            url: url.to_string(),
        });
    }

    fn open_tab(&self, url: &Url, _referrer: &str) -> Option<RenderTargetId> {
        let target = RenderTargetId(self.next());
        let mut state = self.lock();
        state.live.insert(target, vec![url.to_string()]);
        state.events.push(HostEvent::TabOpened {
            target,
            url: url.to_string(),
        });
        Some(target)
    }

    fn preconnect(&self, url: &Url) {
        self.lock().events.push(HostEvent::Preconnect {
            url: url.to_string(),
        });
    }

    fn post_message(
        &self,
        target: RenderTargetId,
        source_origin: &Origin,
        message: &str,
    ) -> Result<(), MessagingError> {
        let mut state = self.lock();
        if state.killed.contains(&target) || !state.live.contains_key(&target) {
            return Err(MessagingError::TargetGone(target));
        }
        state.messages.entry(target).or_default().push(message.to_string());
        state.events.push(HostEvent::MessagePosted {
            target,
            origin: source_origin.to_string(),
            len: message.len(),
        });
        Ok(())
    }

    fn update_visuals(&self, visuals: &Extras) -> bool {
        self.lock().events.push(HostEvent::VisualsUpdated {
            keys: visuals.len(),
        });
        true
    }
}

// =============================================================================
// Asset links
// =============================================================================

/// Asset-link statements configured up front.
#[derive(Debug, Default)]
pub struct StaticAssetLinks {
    statements: Mutex<HashSet<(String, Origin, Relation)>>,
    calls: AtomicUsize,
}

impl StaticAssetLinks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&self, package_name: &str, origin: &Origin, relation: Relation) {
        self.statements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((package_name.to_string(), origin.clone(), relation));
    }

    /// Number of verifications requested so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AssetLinkVerifier for StaticAssetLinks {
    async fn verify(&self, package_name: &str, origin: &Origin, relation: Relation) -> bool {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.statements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(package_name.to_string(), origin.clone(), relation))
    }
}

// =============================================================================
// Network
// =============================================================================

#[derive(Debug)]
pub struct StaticNetwork {
    class: AtomicU8,
}

impl StaticNetwork {
    #[must_use]
    pub fn new(class: NetworkClass) -> Self {
        Self {
            class: AtomicU8::new(Self::encode(class)),
        }
    }

    pub fn set(&self, class: NetworkClass) {
        self.class.store(Self::encode(class), Ordering::Relaxed);
    }

    fn encode(class: NetworkClass) -> u8 {
        match class {
            NetworkClass::Unmetered => 0,
            NetworkClass::Cellular => 1,
            NetworkClass::Offline => 2,
        }
    }
}

impl Default for StaticNetwork {
    fn default() -> Self {
        Self::new(NetworkClass::Unmetered)
    }
}

impl NetworkMonitor for StaticNetwork {
    fn current(&self) -> NetworkClass {
        match self.class.load(Ordering::Relaxed) {
            1 => NetworkClass::Cellular,
            2 => NetworkClass::Offline,
            _ => NetworkClass::Unmetered,
        }
    }
}

// =============================================================================
// Parallel fetcher
// =============================================================================

#[derive(Debug, Default)]
pub struct SimulatedFetcher {
    blocked: Mutex<HashMap<String, String>>,
    fetched: Mutex<Vec<(String, String)>>,
}

impl SimulatedFetcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Have the classifier flag `url` with `threat`.
    pub fn block(&self, url: &str, threat: &str) {
        self.blocked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), threat.to_string());
    }

    /// `(url, referrer)` pairs fetched so far.
    #[must_use]
    pub fn fetched(&self) -> Vec<(String, String)> {
        self.fetched.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ParallelFetcher for SimulatedFetcher {
    async fn fetch(&self, url: &Url, referrer: &Origin) -> FetchVerdict {
        self.fetched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((url.to_string(), referrer.to_string()));
        match self
            .blocked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(url.as_str())
        {
            Some(threat) => FetchVerdict::Blocked(threat.clone()),
            None => FetchVerdict::Clean,
        }
    }
}

// =============================================================================
// Environment
// =============================================================================

/// One of each simulated collaborator, kept typed so tests can steer them.
#[derive(Debug, Clone)]
pub struct SimulatedEnvironment {
    pub host: Arc<SimulatedRenderHost>,
    pub asset_links: Arc<StaticAssetLinks>,
    pub fetcher: Arc<SimulatedFetcher>,
    pub network: Arc<StaticNetwork>,
    pub clock: Arc<ManualClock>,
}

impl SimulatedEnvironment {
    #[must_use]
    pub fn new() -> Self {
        Self {
            host: Arc::new(SimulatedRenderHost::new()),
            asset_links: Arc::new(StaticAssetLinks::new()),
            fetcher: Arc::new(SimulatedFetcher::new()),
            network: Arc::new(StaticNetwork::default()),
            clock: Arc::new(ManualClock::new(0)),
        }
    }

    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            render_host: self.host.clone(),
            asset_links: self.asset_links.clone(),
            fetcher: self.fetcher.clone(),
            network: self.network.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl Default for SimulatedEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promote_replaces_current_entry() {
        let host = SimulatedRenderHost::new();
        let url = Url::parse("https://x.test/page#a").unwrap();
        let target = host.create_hidden_tab(&url, "", None).unwrap();
        host.promote_target(target, &Url::parse("https://x.test/page#b").unwrap());
        assert_eq!(
            host.history(target).unwrap(),
            vec!["https://x.test/page#b".to_string()]
        );
    }

    #[test]
    fn killed_target_rejects_messages() {
        let host = SimulatedRenderHost::new();
        let origin = Origin::parse("https://app.test").unwrap();
        let target = host
            .open_tab(&Url::parse("https://x.test/").unwrap(), "")
            .unwrap();
        assert!(host.post_message(target, &origin, "hi").is_ok());
        host.kill(target);
        assert_eq!(
            host.post_message(target, &origin, "hi"),
            Err(MessagingError::TargetGone(target))
        );
        assert_eq!(host.messages(target), vec!["hi".to_string()]);
    }

    #[test]
    fn spare_is_consumed_by_hidden_tab() {
        let host = SimulatedRenderHost::new();
        let spare = host.create_spare_renderer().unwrap();
        assert_eq!(host.live_spares(), 1);
        host.create_hidden_tab(&Url::parse("https://x.test/").unwrap(), "", Some(spare));
        assert_eq!(host.live_spares(), 0);
    }

    #[test]
    fn network_class_is_settable() {
        let net = StaticNetwork::default();
        assert_eq!(net.current(), NetworkClass::Unmetered);
        net.set(NetworkClass::Cellular);
        assert_eq!(net.current(), NetworkClass::Cellular);
    }
}
