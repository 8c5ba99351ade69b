//! Speculation controller: the single global speculation slot and the spare
//! renderer pool.
//!
//! ```text
//!            warmup                 may_launch_url (hidden tab)
//!   Idle ───────────▶ SpareReserved ───────────────────────────▶ Speculating
//!    ▲                                                               │
//!    └──── navigate (promote / discard), cancel, renderer gone ──────┘
//! ```
//!
//! The controller owns at most one [`RenderTarget`] and at most one
//! [`SpareRenderer`] at a time; both are `Option` slots and every transition
//! that empties a slot releases the handle through the [`RenderHost`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SpeculationConfig;
use crate::extras::{self, Candidate, Extras};
use crate::host::{
    NetworkClass, NetworkMonitor, RenderHost, RenderTarget, RenderTargetId, SpareRenderer,
};
use crate::session::{LaunchClassification, PredictionOutcome, SessionRegistry, SessionToken};
use crate::url_policy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeculationState {
    #[default]
    Idle,
    SpareReserved,
    Speculating,
}

/// The one live speculation.
#[derive(Debug)]
pub struct Speculation {
    token: SessionToken,
    url: Url,
    target: RenderTarget,
}

impl Speculation {
    #[must_use]
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn target_id(&self) -> RenderTargetId {
        self.target.id()
    }
}

/// Input of [`SpeculationController::may_launch_url`].
#[derive(Debug, Clone, Copy)]
pub struct MayLaunchRequest<'a> {
    pub caller_uid: u32,
    pub token: &'a SessionToken,
    pub url: Option<&'a str>,
    pub extras: &'a Extras,
    pub candidates: &'a [Candidate],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownSession,
    NotSessionOwner,
    InvalidUrl,
    Throttled,
}

/// What an accepted request ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "target", rename_all = "snake_case")]
pub enum SpeculationMode {
    /// No URL and no candidates: the session's speculation was cancelled.
    Cancelled,
    /// Accepted and recorded, but policy suppressed any network activity.
    Suppressed,
    /// Only connections were warmed.
    Preconnect,
    /// A URL-agnostic spare renderer is kept ready and the host preconnected.
    SpareRenderer,
    HiddenTab(RenderTargetId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum MayLaunchOutcome {
    Accepted(SpeculationMode),
    Rejected(RejectReason),
}

impl MayLaunchOutcome {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeculationCounters {
    pub hidden_tabs_created: u64,
    pub spare_renderers_created: u64,
    pub preconnects: u64,
    pub teardowns: u64,
    pub promotions: u64,
    pub discards: u64,
    pub renderer_crashes: u64,
    pub good_predictions: u64,
    pub bad_predictions: u64,
}

#[derive(Debug)]
pub struct SpeculationController {
    host: Arc<dyn RenderHost>,
    network: Arc<dyn NetworkMonitor>,
    spare: Option<SpareRenderer>,
    speculation: Option<Speculation>,
    network_prediction_enabled: bool,
    spare_renderer_on_warmup: bool,
    counters: SpeculationCounters,
}

impl SpeculationController {
    #[must_use]
    pub fn new(
        host: Arc<dyn RenderHost>,
        network: Arc<dyn NetworkMonitor>,
        config: &SpeculationConfig,
    ) -> Self {
        Self {
            host,
            network,
            spare: None,
            speculation: None,
            network_prediction_enabled: config.network_prediction_enabled,
            spare_renderer_on_warmup: config.spare_renderer_on_warmup,
            counters: SpeculationCounters::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SpeculationState {
        match (&self.speculation, &self.spare) {
            (Some(_), _) => SpeculationState::Speculating,
            (None, Some(_)) => SpeculationState::SpareReserved,
            (None, None) => SpeculationState::Idle,
        }
    }

    #[must_use]
    pub fn speculation(&self) -> Option<&Speculation> {
        self.speculation.as_ref()
    }

    #[must_use]
    pub fn has_spare(&self) -> bool {
        self.spare.is_some()
    }

    #[must_use]
    pub fn counters(&self) -> SpeculationCounters {
        self.counters
    }

    #[must_use]
    pub fn network_prediction_enabled(&self) -> bool {
        self.network_prediction_enabled
    }

    pub fn set_network_prediction_enabled(&mut self, enabled: bool) {
        self.network_prediction_enabled = enabled;
        if !enabled {
            self.teardown("network prediction disabled");
        }
    }

    /// Pre-warm a spare renderer. Idempotent.
    pub fn warmup(&mut self) -> bool {
        if self.spare_renderer_on_warmup && self.speculation.is_none() {
            self.ensure_spare();
        }
        true
    }

    /// Remove the spare renderer from the pool. A second taker gets `None`.
    pub fn take_spare(&mut self) -> Option<SpareRenderer> {
        self.spare.take()
    }

    fn ensure_spare(&mut self) {
        if self.spare.is_some() {
            return;
        }
        if let Some(id) = self.host.create_spare_renderer() {
            debug!(spare = id.0, "Spare renderer reserved");
            self.counters.spare_renderers_created += 1;
            self.spare = Some(SpareRenderer::new(id));
        }
    }

    /// Validate, throttle and act on a prediction.
    pub fn may_launch_url(
        &mut self,
        registry: &mut SessionRegistry,
        request: MayLaunchRequest<'_>,
        now_ms: u64,
    ) -> MayLaunchOutcome {
        let token = request.token;
        let Some(session) = registry.get(token) else {
            return MayLaunchOutcome::Rejected(RejectReason::UnknownSession);
        };
        if session.owner().uid != request.caller_uid {
            debug!(session = %token, uid = request.caller_uid, "mayLaunchUrl from non-owner");
            return MayLaunchOutcome::Rejected(RejectReason::NotSessionOwner);
        }
        let can_use_hidden_tab = session.can_use_hidden_tab();
        let speculate_on_cellular = session.should_speculate_on_cellular();

        let url = match request.url {
            Some(raw) => match url_policy::parse_web_url(raw) {
                Some(url) => Some(url),
                None => {
                    debug!(session = %token, "Rejecting non-web speculation URL");
                    return MayLaunchOutcome::Rejected(RejectReason::InvalidUrl);
                }
            },
            None => None,
        };
        let candidates = extras::candidate_urls(request.candidates);

        if url.is_none() && candidates.is_empty() {
            self.cancel(token);
            return MayLaunchOutcome::Accepted(SpeculationMode::Cancelled);
        }

        if !registry.is_request_allowed(token, request.caller_uid, now_ms) {
            debug!(session = %token, uid = request.caller_uid, "mayLaunchUrl throttled");
            return MayLaunchOutcome::Rejected(RejectReason::Throttled);
        }

        self.teardown("superseded");

        let referrer = registry
            .validated_referrer(token, request.extras.uri(extras::EXTRA_REFERRER))
            .unwrap_or_default();
        registry.record_prediction(
            token,
            url.as_ref().map(Url::as_str),
            !candidates.is_empty(),
            now_ms,
        );

        if !self.network_prediction_enabled {
            debug!(session = %token, "Network prediction disabled");
            return MayLaunchOutcome::Accepted(SpeculationMode::Suppressed);
        }
        let network = self.network.current();
        if network == NetworkClass::Offline {
            return MayLaunchOutcome::Accepted(SpeculationMode::Suppressed);
        }

        for candidate in &candidates {
            self.preconnect(candidate);
        }

        let Some(url) = url else {
            return MayLaunchOutcome::Accepted(SpeculationMode::Preconnect);
        };

        let mode = if network == NetworkClass::Cellular && !speculate_on_cellular {
            self.preconnect(&url);
            SpeculationMode::Preconnect
        } else if can_use_hidden_tab {
            self.start_hidden_tab(token, url, &referrer)
        } else {
            self.ensure_spare();
            self.preconnect(&url);
            SpeculationMode::SpareRenderer
        };
        MayLaunchOutcome::Accepted(mode)
    }

    fn preconnect(&mut self, url: &Url) {
        self.host.preconnect(url);
        self.counters.preconnects += 1;
    }

    fn start_hidden_tab(&mut self, token: &SessionToken, url: Url, referrer: &str) -> SpeculationMode {
        debug_assert!(self.speculation.is_none(), "speculation slot must be empty");
        if let Some(stale) = self.speculation.take() {
            warn!(target_id = %stale.target.id(), "Live speculation found while starting a new one");
            stale.target.release(self.host.as_ref());
        }

        let spare = self.take_spare().map(SpareRenderer::into_hidden_tab);
        match self.host.create_hidden_tab(&url, referrer, spare) {
            Some(id) => {
                info!(session = %token, target_id = %id, url = %url, "Speculating in hidden tab");
                self.counters.hidden_tabs_created += 1;
                self.speculation = Some(Speculation {
                    token: token.clone(),
                    url,
                    target: RenderTarget::new(id),
                });
                SpeculationMode::HiddenTab(id)
            }
            None => {
                warn!(session = %token, url = %url, "Hidden tab creation failed, preconnecting");
                self.preconnect(&url);
                SpeculationMode::Preconnect
            }
        }
    }

    /// Tear down the live speculation, whoever owns it.
    fn teardown(&mut self, reason: &'static str) -> bool {
        let Some(speculation) = self.speculation.take() else {
            return false;
        };
        info!(
            session = %speculation.token,
            target_id = %speculation.target.id(),
            reason,
            "Tearing down speculation"
        );
        speculation.target.release(self.host.as_ref());
        self.counters.teardowns += 1;
        true
    }

    /// Cancel the speculation if `token` owns it.
    pub fn cancel(&mut self, token: &SessionToken) -> bool {
        if self.speculation.as_ref().is_some_and(|s| &s.token == token) {
            self.teardown("cancelled")
        } else {
            false
        }
    }

    /// Release the speculation if any of `tokens` owns it.
    pub fn release_for_sessions(&mut self, tokens: &[SessionToken]) -> bool {
        if self
            .speculation
            .as_ref()
            .is_some_and(|s| tokens.contains(&s.token))
        {
            self.teardown("session removed")
        } else {
            false
        }
    }

    /// Classify a real navigation and feed the throttler.
    pub fn register_launch(
        &mut self,
        registry: &mut SessionRegistry,
        token: &SessionToken,
        actual_url: &str,
    ) -> Option<LaunchClassification> {
        let classification = registry.register_launch(token, actual_url)?;
        match classification.outcome {
            PredictionOutcome::GoodPrediction => self.counters.good_predictions += 1,
            PredictionOutcome::BadPrediction => self.counters.bad_predictions += 1,
            PredictionOutcome::NoPrediction => {}
        }
        Some(classification)
    }

    /// Hand the speculation for `token` to a real navigation to `url`.
    ///
    /// A match (under the fragment policy) is promoted and its target id
    /// returned; a mismatch is discarded. Another session's speculation is
    /// left alone.
    pub fn take_for_navigation(
        &mut self,
        token: &SessionToken,
        url: &Url,
        ignore_fragments: bool,
    ) -> Option<RenderTargetId> {
        if !self.speculation.as_ref().is_some_and(|s| &s.token == token) {
            return None;
        }
        let speculation = self.speculation.take()?;
        if url_policy::urls_match(speculation.url.as_str(), url.as_str(), ignore_fragments) {
            let id = speculation.target.into_visible();
            self.host.promote_target(id, url);
            self.counters.promotions += 1;
            info!(session = %token, target_id = %id, url = %url, "Speculation promoted");
            Some(id)
        } else {
            info!(
                session = %token,
                predicted = %speculation.url,
                url = %url,
                "Speculation discarded"
            );
            speculation.target.release(self.host.as_ref());
            self.counters.discards += 1;
            None
        }
    }

    /// The renderer behind `target` died. Returns whether it was the live
    /// speculation.
    pub fn on_render_process_gone(&mut self, target: RenderTargetId) -> bool {
        if !self
            .speculation
            .as_ref()
            .is_some_and(|s| s.target.id() == target)
        {
            return false;
        }
        self.counters.renderer_crashes += 1;
        self.teardown("renderer gone")
    }

    /// Release everything held.
    pub fn shutdown(&mut self) {
        self.teardown("shutdown");
        if let Some(spare) = self.spare.take() {
            spare.release(self.host.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ThrottleConfig, VerificationConfig};
    use crate::extras::ExtraValue;
    use crate::origin_verifier::OriginVerifier;
    use crate::session::{ClientIdentity, ConnectionId};
    use crate::simulated::{HostEvent, SimulatedRenderHost, StaticAssetLinks, StaticNetwork};
    use crate::throttle::RequestThrottler;

    const UID: u32 = 10_001;

    struct Fixture {
        host: Arc<SimulatedRenderHost>,
        network: Arc<StaticNetwork>,
        registry: SessionRegistry,
        controller: SpeculationController,
    }

    fn fixture() -> Fixture {
        let host = Arc::new(SimulatedRenderHost::new());
        let network = Arc::new(StaticNetwork::default());
        let verifier = OriginVerifier::new(
            Arc::new(StaticAssetLinks::new()),
            Arc::new(ManualClock::new(0)),
            &VerificationConfig::default(),
        );
        let registry = SessionRegistry::new(
            RequestThrottler::new(ThrottleConfig::default()),
            Arc::new(verifier),
        );
        let controller =
            SpeculationController::new(host.clone(), network.clone(), &SpeculationConfig::default());
        Fixture {
            host,
            network,
            registry,
            controller,
        }
    }

    fn open(f: &mut Fixture, name: &str, hidden: bool) -> SessionToken {
        let token = SessionToken::new(name);
        f.registry
            .new_session(&token, ClientIdentity::new(UID, "com.example.app"), ConnectionId(1));
        f.registry.set_can_use_hidden_tab(&token, hidden);
        token
    }

    fn launch(f: &mut Fixture, token: &SessionToken, url: &str, now_ms: u64) -> MayLaunchOutcome {
        let extras = Extras::new();
        f.controller.may_launch_url(
            &mut f.registry,
            MayLaunchRequest {
                caller_uid: UID,
                token,
                url: Some(url),
                extras: &extras,
                candidates: &[],
            },
            now_ms,
        )
    }

    #[test]
    fn warmup_reserves_one_spare() {
        let mut f = fixture();
        assert_eq!(f.controller.state(), SpeculationState::Idle);
        assert!(f.controller.warmup());
        assert!(f.controller.warmup());
        assert_eq!(f.controller.state(), SpeculationState::SpareReserved);
        assert_eq!(f.host.live_spares(), 1);
        assert!(f.controller.take_spare().is_some());
        assert!(f.controller.take_spare().is_none());
    }

    #[test]
    fn hidden_tab_consumes_spare() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        f.controller.warmup();
        let outcome = launch(&mut f, &t, "https://x.test/", 0);
        assert!(matches!(
            outcome,
            MayLaunchOutcome::Accepted(SpeculationMode::HiddenTab(_))
        ));
        assert_eq!(f.controller.state(), SpeculationState::Speculating);
        assert!(!f.controller.has_spare());
        assert_eq!(f.host.live_spares(), 0);
    }

    #[test]
    fn new_speculation_tears_down_old_first() {
        let mut f = fixture();
        let a = open(&mut f, "a", true);
        let b = open(&mut f, "b", true);
        let MayLaunchOutcome::Accepted(SpeculationMode::HiddenTab(first)) =
            launch(&mut f, &a, "https://a.test/", 0)
        else {
            panic!("expected hidden tab");
        };
        let MayLaunchOutcome::Accepted(SpeculationMode::HiddenTab(second)) =
            launch(&mut f, &b, "https://b.test/", 1_000)
        else {
            panic!("expected hidden tab");
        };

        assert_eq!(f.host.live_targets(), vec![second]);
        let events = f.host.events();
        let destroyed = events
            .iter()
            .position(|e| *e == HostEvent::TargetDestroyed { target: first })
            .unwrap();
        let created = events
            .iter()
            .position(|e| matches!(e, HostEvent::HiddenTabCreated { target, .. } if *target == second))
            .unwrap();
        assert!(destroyed < created);
    }

    #[test]
    fn non_web_urls_are_rejected() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        assert_eq!(
            launch(&mut f, &t, "android-app://com.evil/x", 0),
            MayLaunchOutcome::Rejected(RejectReason::InvalidUrl)
        );
        assert_eq!(
            launch(&mut f, &SessionToken::new("ghost"), "https://x.test/", 0),
            MayLaunchOutcome::Rejected(RejectReason::UnknownSession)
        );
    }

    #[test]
    fn non_owner_is_rejected() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        let extras = Extras::new();
        let outcome = f.controller.may_launch_url(
            &mut f.registry,
            MayLaunchRequest {
                caller_uid: UID + 1,
                token: &t,
                url: Some("https://x.test/"),
                extras: &extras,
                candidates: &[],
            },
            0,
        );
        assert_eq!(outcome, MayLaunchOutcome::Rejected(RejectReason::NotSessionOwner));
    }

    #[test]
    fn cellular_without_opt_in_only_preconnects() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        f.network.set(NetworkClass::Cellular);
        assert_eq!(
            launch(&mut f, &t, "https://x.test/", 0),
            MayLaunchOutcome::Accepted(SpeculationMode::Preconnect)
        );
        assert!(f.host.live_targets().is_empty());

        f.registry.set_should_speculate_on_cellular(&t, true);
        assert!(matches!(
            launch(&mut f, &t, "https://x.test/", 10_000),
            MayLaunchOutcome::Accepted(SpeculationMode::HiddenTab(_))
        ));
    }

    #[test]
    fn disabled_prediction_suppresses_everything() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        f.registry.set_should_speculate_on_cellular(&t, true);
        f.controller.set_network_prediction_enabled(false);
        assert_eq!(
            launch(&mut f, &t, "https://x.test/", 0),
            MayLaunchOutcome::Accepted(SpeculationMode::Suppressed)
        );
        assert!(f.host.events().is_empty());
    }

    #[test]
    fn without_hidden_tab_a_spare_is_kept() {
        let mut f = fixture();
        let t = open(&mut f, "a", false);
        assert_eq!(
            launch(&mut f, &t, "https://x.test/", 0),
            MayLaunchOutcome::Accepted(SpeculationMode::SpareRenderer)
        );
        assert_eq!(f.controller.state(), SpeculationState::SpareReserved);
        assert_eq!(f.host.preconnects(), vec!["https://x.test/".to_string()]);
    }

    #[test]
    fn low_confidence_candidates_are_preconnected() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        let extras = Extras::new();
        let candidates = vec![
            Candidate::url("https://one.test/"),
            Candidate(ExtraValue::Int(7)),
            Candidate::url("https://two.test/"),
        ];
        let outcome = f.controller.may_launch_url(
            &mut f.registry,
            MayLaunchRequest {
                caller_uid: UID,
                token: &t,
                url: None,
                extras: &extras,
                candidates: &candidates,
            },
            0,
        );
        assert_eq!(outcome, MayLaunchOutcome::Accepted(SpeculationMode::Preconnect));
        assert_eq!(
            f.host.preconnects(),
            vec!["https://one.test/".to_string(), "https://two.test/".to_string()]
        );
        assert!(f.registry.get(&t).unwrap().prediction().low_confidence);
    }

    #[test]
    fn empty_request_cancels() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        launch(&mut f, &t, "https://x.test/", 0);
        let extras = Extras::new();
        let outcome = f.controller.may_launch_url(
            &mut f.registry,
            MayLaunchRequest {
                caller_uid: UID,
                token: &t,
                url: None,
                extras: &extras,
                candidates: &[],
            },
            0,
        );
        assert_eq!(outcome, MayLaunchOutcome::Accepted(SpeculationMode::Cancelled));
        assert_eq!(f.controller.state(), SpeculationState::Idle);
        assert!(f.host.live_targets().is_empty());
    }

    #[test]
    fn navigation_promotes_or_discards() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        launch(&mut f, &t, "https://x.test/page#a", 0);
        let hit = Url::parse("https://x.test/page#b").unwrap();
        let promoted = f.controller.take_for_navigation(&t, &hit, true).unwrap();
        assert_eq!(f.host.history(promoted).unwrap(), vec![hit.to_string()]);
        assert_eq!(f.controller.state(), SpeculationState::Idle);

        launch(&mut f, &t, "https://x.test/page#a", 10_000);
        assert!(f.controller.take_for_navigation(&t, &hit, false).is_none());
        assert_eq!(f.controller.counters().discards, 1);
        assert_eq!(f.host.live_targets(), vec![promoted]);
    }

    #[test]
    fn other_sessions_speculation_is_untouched_by_navigation() {
        let mut f = fixture();
        let a = open(&mut f, "a", true);
        let b = open(&mut f, "b", true);
        launch(&mut f, &a, "https://x.test/", 0);
        let url = Url::parse("https://x.test/").unwrap();
        assert!(f.controller.take_for_navigation(&b, &url, false).is_none());
        assert_eq!(f.controller.state(), SpeculationState::Speculating);
    }

    #[test]
    fn renderer_death_returns_to_idle() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        let MayLaunchOutcome::Accepted(SpeculationMode::HiddenTab(target)) =
            launch(&mut f, &t, "https://x.test/", 0)
        else {
            panic!("expected hidden tab");
        };
        assert!(!f.controller.on_render_process_gone(RenderTargetId(9_999)));
        assert!(f.controller.on_render_process_gone(target));
        assert_eq!(f.controller.state(), SpeculationState::Idle);
        assert_eq!(f.controller.counters().renderer_crashes, 1);
    }

    #[test]
    fn failed_hidden_tab_falls_back_to_preconnect() {
        let mut f = fixture();
        let t = open(&mut f, "a", true);
        f.host.refuse_hidden_tabs(true);
        assert_eq!(
            launch(&mut f, &t, "https://x.test/", 0),
            MayLaunchOutcome::Accepted(SpeculationMode::Preconnect)
        );
        assert_eq!(f.controller.state(), SpeculationState::Idle);
    }

    #[test]
    fn shutdown_releases_everything() {
        let mut f = fixture();
        let t = open(&mut f, "a", false);
        launch(&mut f, &t, "https://x.test/", 0);
        f.controller.shutdown();
        assert_eq!(f.controller.state(), SpeculationState::Idle);
        assert_eq!(f.host.live_spares(), 0);
    }
}
