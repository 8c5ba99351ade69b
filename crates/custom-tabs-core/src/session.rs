//! Session registry: the authoritative map from session token to per-session
//! state.
//!
//! Every accessor and mutator is a no-op (returning `false`/`None`) for an
//! unknown token, so a call racing a client disconnect is harmless.
//!
//! The registry owns the [`RequestThrottler`] and shares the
//! [`OriginVerifier`]; both are consulted through it so that throttling and
//! first-party checks always use the session's recorded owner identity.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::origin_verifier::{OriginVerifier, Relation};
use crate::post_message::MessageChannel;
use crate::throttle::RequestThrottler;
use crate::url_policy::{self, Origin};

/// Opaque client-supplied session identifier.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(Arc<str>);

impl SessionToken {
    #[must_use]
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(Arc::from(raw.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

// Tokens are credentials of a sort; logs only get a prefix.
impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        if prefix.len() < self.0.len() {
            write!(f, "{prefix}…")
        } else {
            write!(f, "{prefix}")
        }
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({self})")
    }
}

/// OS-level identity of a client process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub uid: u32,
    pub package_name: String,
}

impl ClientIdentity {
    #[must_use]
    pub fn new(uid: u32, package_name: impl Into<String>) -> Self {
        Self {
            uid,
            package_name: package_name.into(),
        }
    }
}

/// Identifier of one bound client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Last prediction and how the client has been predicting since the last
/// real navigation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionMetrics {
    pub predicted_url: Option<String>,
    pub last_may_launch_ms: Option<u64>,
    pub low_confidence: bool,
    pub high_confidence: bool,
}

impl PredictionMetrics {
    fn record(&mut self, url: Option<&str>, low_confidence: bool, now_ms: u64) {
        self.last_may_launch_ms = Some(now_ms);
        if let Some(url) = url {
            self.predicted_url = Some(url.to_string());
            self.high_confidence = true;
        }
        if low_confidence {
            self.low_confidence = true;
        }
    }

    fn launch_type(&self) -> MayLaunchUrlType {
        match (self.low_confidence, self.high_confidence) {
            (false, false) => MayLaunchUrlType::NoMayLaunchUrl,
            (true, false) => MayLaunchUrlType::LowConfidence,
            (false, true) => MayLaunchUrlType::HighConfidence,
            (true, true) => MayLaunchUrlType::Both,
        }
    }
}

/// Per-session state.
#[derive(Debug, Clone)]
pub struct Session {
    token: SessionToken,
    owner: ClientIdentity,
    connection: ConnectionId,
    referrer: String,
    prediction: PredictionMetrics,
    pub(crate) channel: MessageChannel,
    ignore_url_fragments: bool,
    allow_parallel_request: bool,
    can_use_hidden_tab: bool,
    should_speculate_on_cellular: bool,
    collect_page_load_metrics: bool,
}

impl Session {
    fn new(token: SessionToken, owner: ClientIdentity, connection: ConnectionId) -> Self {
        let referrer = url_policy::app_referrer(&owner.package_name);
        Self {
            token,
            owner,
            connection,
            referrer,
            prediction: PredictionMetrics::default(),
            channel: MessageChannel::default(),
            ignore_url_fragments: false,
            allow_parallel_request: false,
            can_use_hidden_tab: false,
            should_speculate_on_cellular: false,
            collect_page_load_metrics: false,
        }
    }

    #[must_use]
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    #[must_use]
    pub fn owner(&self) -> &ClientIdentity {
        &self.owner
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    #[must_use]
    pub fn referrer(&self) -> &str {
        &self.referrer
    }

    #[must_use]
    pub fn prediction(&self) -> &PredictionMetrics {
        &self.prediction
    }

    #[must_use]
    pub fn post_message_origin(&self) -> Option<&Origin> {
        self.channel.origin()
    }

    #[must_use]
    pub fn ignore_url_fragments(&self) -> bool {
        self.ignore_url_fragments
    }

    #[must_use]
    pub fn allow_parallel_request(&self) -> bool {
        self.allow_parallel_request
    }

    #[must_use]
    pub fn can_use_hidden_tab(&self) -> bool {
        self.can_use_hidden_tab
    }

    #[must_use]
    pub fn should_speculate_on_cellular(&self) -> bool {
        self.should_speculate_on_cellular
    }

    #[must_use]
    pub fn collect_page_load_metrics(&self) -> bool {
        self.collect_page_load_metrics
    }
}

/// Diagnostic classification of warmup vs. session existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupState {
    NoSessionNoWarmup,
    NoSessionWarmup,
    SessionNoWarmupNotCalled,
    SessionNoWarmupAlreadyCalled,
    SessionWarmup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionOutcome {
    NoPrediction,
    GoodPrediction,
    BadPrediction,
}

/// Which kinds of `mayLaunchUrl` preceded a real navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MayLaunchUrlType {
    NoMayLaunchUrl,
    LowConfidence,
    HighConfidence,
    Both,
}

/// Result of classifying a real navigation against the session's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchClassification {
    pub outcome: PredictionOutcome,
    pub may_launch_type: MayLaunchUrlType,
}

/// Token → session map plus the global warmup bookkeeping.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<SessionToken, Session>,
    throttler: RequestThrottler,
    verifier: Arc<OriginVerifier>,
    uids_called_warmup: HashSet<u32>,
    warmup_called: bool,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(throttler: RequestThrottler, verifier: Arc<OriginVerifier>) -> Self {
        Self {
            sessions: HashMap::new(),
            throttler,
            verifier,
            uids_called_warmup: HashSet::new(),
            warmup_called: false,
        }
    }

    /// Register a session. Fails for an empty or already registered token.
    pub fn new_session(
        &mut self,
        token: &SessionToken,
        owner: ClientIdentity,
        connection: ConnectionId,
    ) -> bool {
        if token.is_empty() {
            debug!("Rejecting empty session token");
            return false;
        }
        if self.sessions.contains_key(token) {
            debug!(session = %token, "Session already registered");
            return false;
        }
        info!(
            session = %token,
            uid = owner.uid,
            package = %owner.package_name,
            connection_id = %connection,
            "New session"
        );
        self.sessions
            .insert(token.clone(), Session::new(token.clone(), owner, connection));
        true
    }

    /// Remove one session and hand it back so owned resources can be released.
    pub fn forget_session(&mut self, token: &SessionToken) -> Option<Session> {
        let removed = self.sessions.remove(token);
        if removed.is_some() {
            info!(session = %token, "Session forgotten");
        }
        removed
    }

    /// Remove every session.
    pub fn cleanup_all(&mut self) -> Vec<Session> {
        let removed: Vec<Session> = self.sessions.drain().map(|(_, s)| s).collect();
        info!(removed = removed.len(), "All sessions cleaned up");
        removed
    }

    /// Remove every session created through `connection`.
    pub fn cleanup_connection(&mut self, connection: ConnectionId) -> Vec<Session> {
        let tokens: Vec<SessionToken> = self
            .sessions
            .values()
            .filter(|s| s.connection == connection)
            .map(|s| s.token.clone())
            .collect();
        tokens
            .iter()
            .filter_map(|t| self.sessions.remove(t))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, token: &SessionToken) -> bool {
        self.sessions.contains_key(token)
    }

    #[must_use]
    pub fn get(&self, token: &SessionToken) -> Option<&Session> {
        self.sessions.get(token)
    }

    pub(crate) fn get_mut(&mut self, token: &SessionToken) -> Option<&mut Session> {
        self.sessions.get_mut(token)
    }

    pub(crate) fn sessions_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[must_use]
    pub fn owner(&self, token: &SessionToken) -> Option<&ClientIdentity> {
        self.sessions.get(token).map(Session::owner)
    }

    #[must_use]
    pub fn referrer(&self, token: &SessionToken) -> Option<&str> {
        self.sessions.get(token).map(Session::referrer)
    }

    pub fn set_referrer(&mut self, token: &SessionToken, referrer: impl Into<String>) -> bool {
        self.update(token, |s| s.referrer = referrer.into())
    }

    pub fn set_ignore_url_fragments(&mut self, token: &SessionToken, value: bool) -> bool {
        self.update(token, |s| s.ignore_url_fragments = value)
    }

    pub fn set_allow_parallel_request(&mut self, token: &SessionToken, value: bool) -> bool {
        self.update(token, |s| s.allow_parallel_request = value)
    }

    pub fn set_can_use_hidden_tab(&mut self, token: &SessionToken, value: bool) -> bool {
        self.update(token, |s| s.can_use_hidden_tab = value)
    }

    pub fn set_should_speculate_on_cellular(&mut self, token: &SessionToken, value: bool) -> bool {
        self.update(token, |s| s.should_speculate_on_cellular = value)
    }

    pub fn set_collect_page_load_metrics(&mut self, token: &SessionToken, value: bool) -> bool {
        self.update(token, |s| s.collect_page_load_metrics = value)
    }

    fn update(&mut self, token: &SessionToken, f: impl FnOnce(&mut Session)) -> bool {
        match self.sessions.get_mut(token) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    /// Note that `uid` triggered a warmup.
    pub fn record_warmup(&mut self, uid: u32) {
        self.warmup_called = true;
        self.uids_called_warmup.insert(uid);
    }

    #[must_use]
    pub fn warmup_called(&self) -> bool {
        self.warmup_called
    }

    #[must_use]
    pub fn warmup_state(&self, token: &SessionToken) -> WarmupState {
        match self.sessions.get(token) {
            None if self.warmup_called => WarmupState::NoSessionWarmup,
            None => WarmupState::NoSessionNoWarmup,
            Some(s) if self.uids_called_warmup.contains(&s.owner.uid) => {
                WarmupState::SessionWarmup
            }
            Some(_) if self.warmup_called => WarmupState::SessionNoWarmupAlreadyCalled,
            Some(_) => WarmupState::SessionNoWarmupNotCalled,
        }
    }

    /// Whether `caller_uid` may issue a speculative request for `token` now:
    /// the session exists, belongs to the caller and is not throttled.
    #[must_use]
    pub fn is_request_allowed(&self, token: &SessionToken, caller_uid: u32, now_ms: u64) -> bool {
        let Some(session) = self.sessions.get(token) else {
            return false;
        };
        if session.owner.uid != caller_uid {
            debug!(session = %token, caller_uid, "Caller does not own session");
            return false;
        }
        self.throttler.is_allowed(caller_uid, now_ms)
    }

    /// Record a prediction in the session metrics.
    ///
    /// Only a high-confidence URL is registered with the throttler. A call
    /// carrying nothing but low-confidence candidates leaves the pending
    /// prediction in place, so it can still be confirmed by navigation.
    pub fn record_prediction(
        &mut self,
        token: &SessionToken,
        url: Option<&str>,
        low_confidence: bool,
        now_ms: u64,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(token) else {
            return false;
        };
        session.prediction.record(url, low_confidence, now_ms);
        if let Some(url) = url {
            let uid = session.owner.uid;
            self.throttler.register_request(uid, url, now_ms);
        }
        true
    }

    /// Compare the session's last prediction with `actual_url`.
    #[must_use]
    pub fn prediction_outcome(&self, token: &SessionToken, actual_url: &str) -> PredictionOutcome {
        let Some(session) = self.sessions.get(token) else {
            return PredictionOutcome::NoPrediction;
        };
        match &session.prediction.predicted_url {
            None => PredictionOutcome::NoPrediction,
            Some(predicted)
                if url_policy::urls_match(predicted, actual_url, session.ignore_url_fragments) =>
            {
                PredictionOutcome::GoodPrediction
            }
            Some(_) => PredictionOutcome::BadPrediction,
        }
    }

    /// Classify a real navigation, reward an accurate prediction and reset
    /// the session's prediction metrics.
    pub fn register_launch(
        &mut self,
        token: &SessionToken,
        actual_url: &str,
    ) -> Option<LaunchClassification> {
        let outcome = self.prediction_outcome(token, actual_url);
        let session = self.sessions.get_mut(token)?;
        if outcome == PredictionOutcome::GoodPrediction {
            if let Some(predicted) = &session.prediction.predicted_url {
                self.throttler.register_success(session.owner.uid, predicted);
            }
        }
        let may_launch_type = session.prediction.launch_type();
        session.prediction = PredictionMetrics::default();
        info!(
            session = %token,
            outcome = ?outcome,
            may_launch_type = ?may_launch_type,
            "Launch registered"
        );
        Some(LaunchClassification {
            outcome,
            may_launch_type,
        })
    }

    /// Whether `origin` is verified (cache-only) as the session owner's own.
    #[must_use]
    pub fn is_first_party_origin(&self, token: &SessionToken, origin: &Origin) -> bool {
        self.sessions.get(token).is_some_and(|s| {
            self.verifier
                .is_verified(&s.owner.package_name, origin, Relation::UseAsOrigin)
        })
    }

    /// The referrer to attach to a request from `token`.
    ///
    /// A client-supplied referrer is used only if it is the app's own
    /// `android-app://` referrer or a first-party verified https origin;
    /// otherwise the session's stored referrer applies.
    #[must_use]
    pub fn validated_referrer(&self, token: &SessionToken, requested: Option<&str>) -> Option<String> {
        let session = self.sessions.get(token)?;
        let Some(requested) = requested else {
            return Some(session.referrer.clone());
        };
        if requested == url_policy::app_referrer(&session.owner.package_name) {
            return Some(requested.to_string());
        }
        match Origin::parse(requested) {
            Some(origin) if self.is_first_party_origin(token, &origin) => {
                Some(requested.to_string())
            }
            _ => {
                debug!(session = %token, "Ignoring unverified referrer");
                Some(session.referrer.clone())
            }
        }
    }

    #[must_use]
    pub fn throttler(&self) -> &RequestThrottler {
        &self.throttler
    }

    pub fn throttler_mut(&mut self) -> &mut RequestThrottler {
        &mut self.throttler
    }

    #[must_use]
    pub fn verifier(&self) -> &Arc<OriginVerifier> {
        &self.verifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{ThrottleConfig, VerificationConfig};
    use crate::simulated::StaticAssetLinks;
    use crate::throttle::PredictionState;

    fn registry() -> SessionRegistry {
        let verifier = OriginVerifier::new(
            Arc::new(StaticAssetLinks::new()),
            Arc::new(ManualClock::new(0)),
            &VerificationConfig::default(),
        );
        SessionRegistry::new(
            RequestThrottler::new(ThrottleConfig::default()),
            Arc::new(verifier),
        )
    }

    fn app() -> ClientIdentity {
        ClientIdentity::new(10_001, "com.example.app")
    }

    #[test]
    fn new_session_rejects_empty_and_duplicates() {
        let mut r = registry();
        assert!(!r.new_session(&SessionToken::new(""), app(), ConnectionId(1)));
        assert!(!r.new_session(&SessionToken::new("   "), app(), ConnectionId(1)));
        let t = SessionToken::new("tok-1");
        assert!(r.new_session(&t, app(), ConnectionId(1)));
        assert!(!r.new_session(&t, app(), ConnectionId(1)));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn setters_are_noops_for_unknown_tokens() {
        let mut r = registry();
        let ghost = SessionToken::new("ghost");
        assert!(!r.set_ignore_url_fragments(&ghost, true));
        assert!(!r.set_can_use_hidden_tab(&ghost, true));
        assert!(!r.set_allow_parallel_request(&ghost, true));
        assert!(!r.set_should_speculate_on_cellular(&ghost, true));
        assert!(!r.set_collect_page_load_metrics(&ghost, true));
        assert!(!r.set_referrer(&ghost, "https://x.test"));
        assert!(r.get(&ghost).is_none());
    }

    #[test]
    fn default_referrer_is_app_referrer() {
        let mut r = registry();
        let t = SessionToken::new("tok");
        r.new_session(&t, app(), ConnectionId(1));
        assert_eq!(r.referrer(&t), Some("android-app://com.example.app"));
    }

    #[test]
    fn warmup_state_matrix() {
        let mut r = registry();
        let t = SessionToken::new("tok");
        assert_eq!(r.warmup_state(&t), WarmupState::NoSessionNoWarmup);

        r.new_session(&t, app(), ConnectionId(1));
        assert_eq!(r.warmup_state(&t), WarmupState::SessionNoWarmupNotCalled);

        r.record_warmup(99);
        assert_eq!(r.warmup_state(&t), WarmupState::SessionNoWarmupAlreadyCalled);
        assert_eq!(
            r.warmup_state(&SessionToken::new("other")),
            WarmupState::NoSessionWarmup
        );

        r.record_warmup(app().uid);
        assert_eq!(r.warmup_state(&t), WarmupState::SessionWarmup);
    }

    #[test]
    fn prediction_outcomes_follow_fragment_policy() {
        let mut r = registry();
        let t = SessionToken::new("tok");
        r.new_session(&t, app(), ConnectionId(1));
        assert_eq!(
            r.prediction_outcome(&t, "https://x.test/page"),
            PredictionOutcome::NoPrediction
        );

        r.record_prediction(&t, Some("https://x.test/page#a"), false, 0);
        assert_eq!(
            r.prediction_outcome(&t, "https://x.test/page#b"),
            PredictionOutcome::BadPrediction
        );
        r.set_ignore_url_fragments(&t, true);
        assert_eq!(
            r.prediction_outcome(&t, "https://x.test/page#b"),
            PredictionOutcome::GoodPrediction
        );
        assert_eq!(
            r.prediction_outcome(&t, "https://x.test/other"),
            PredictionOutcome::BadPrediction
        );
    }

    #[test]
    fn register_launch_rewards_and_resets() {
        let mut r = registry();
        let t = SessionToken::new("tok");
        r.new_session(&t, app(), ConnectionId(1));
        r.record_prediction(&t, Some("https://x.test/"), true, 0);
        r.record_prediction(&t, Some("https://x.test/"), false, 0);
        assert!(!r.throttler().is_allowed(app().uid, 0));

        let c = r.register_launch(&t, "https://x.test/").unwrap();
        assert_eq!(c.outcome, PredictionOutcome::GoodPrediction);
        assert_eq!(c.may_launch_type, MayLaunchUrlType::Both);
        assert!(r.throttler().is_allowed(app().uid, 0));

        let c = r.register_launch(&t, "https://x.test/").unwrap();
        assert_eq!(c.outcome, PredictionOutcome::NoPrediction);
        assert_eq!(c.may_launch_type, MayLaunchUrlType::NoMayLaunchUrl);

        assert!(r.register_launch(&SessionToken::new("ghost"), "https://x.test/").is_none());
    }

    #[test]
    fn low_confidence_hint_keeps_pending_prediction() {
        let mut r = registry();
        let t = SessionToken::new("tok");
        r.new_session(&t, app(), ConnectionId(1));
        r.record_prediction(&t, Some("https://x.test/"), false, 0);
        r.record_prediction(&t, None, true, 0);

        let stats = r.throttler().stats(app().uid).unwrap();
        assert_eq!(stats.consecutive_misses, 0);
        assert_eq!(stats.history.len(), 1);

        let c = r.register_launch(&t, "https://x.test/").unwrap();
        assert_eq!(c.outcome, PredictionOutcome::GoodPrediction);
        assert_eq!(c.may_launch_type, MayLaunchUrlType::Both);
        let stats = r.throttler().stats(app().uid).unwrap();
        assert_eq!(stats.consecutive_misses, 0);
        assert_eq!(stats.history[0].state, PredictionState::Confirmed);
        assert!(r.throttler().is_allowed(app().uid, 0));
    }

    #[test]
    fn low_confidence_only_calls_are_not_throttled() {
        let mut r = registry();
        let t = SessionToken::new("tok");
        r.new_session(&t, app(), ConnectionId(1));
        for _ in 0..5 {
            r.record_prediction(&t, None, true, 0);
        }
        assert!(r.throttler().stats(app().uid).is_none());
        assert!(r.is_request_allowed(&t, app().uid, 0));
    }

    #[test]
    fn tokens_deserialize_from_json() {
        let t: SessionToken = serde_json::from_str("\"tok-1\"").unwrap();
        assert_eq!(t, SessionToken::new("tok-1"));
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"tok-1\"");
    }

    #[test]
    fn request_requires_owner_uid() {
        let mut r = registry();
        let t = SessionToken::new("tok");
        r.new_session(&t, app(), ConnectionId(1));
        assert!(r.is_request_allowed(&t, app().uid, 0));
        assert!(!r.is_request_allowed(&t, 4242, 0));
        assert!(!r.is_request_allowed(&SessionToken::new("ghost"), app().uid, 0));
    }

    #[test]
    fn referrer_validation() {
        let mut r = registry();
        let t = SessionToken::new("tok");
        r.new_session(&t, app(), ConnectionId(1));
        let verified = Origin::parse("https://app.example").unwrap();
        r.verifier()
            .add_verified_origin("com.example.app", &verified, Relation::UseAsOrigin);

        assert_eq!(
            r.validated_referrer(&t, Some("https://app.example")).as_deref(),
            Some("https://app.example")
        );
        assert_eq!(
            r.validated_referrer(&t, Some("https://evil.example")).as_deref(),
            Some("android-app://com.example.app")
        );
        assert_eq!(
            r.validated_referrer(&t, Some("android-app://com.other")).as_deref(),
            Some("android-app://com.example.app")
        );
        assert_eq!(r.validated_referrer(&SessionToken::new("ghost"), None), None);
    }

    #[test]
    fn cleanup_connection_only_removes_its_sessions() {
        let mut r = registry();
        r.new_session(&SessionToken::new("a"), app(), ConnectionId(1));
        r.new_session(&SessionToken::new("b"), app(), ConnectionId(1));
        r.new_session(&SessionToken::new("c"), app(), ConnectionId(2));
        let removed = r.cleanup_connection(ConnectionId(1));
        assert_eq!(removed.len(), 2);
        assert!(r.contains(&SessionToken::new("c")));
        assert_eq!(r.cleanup_all().len(), 1);
        assert!(r.is_empty());
    }

    #[test]
    fn token_display_is_truncated() {
        let t = SessionToken::new("abcdefghijklmnop");
        assert_eq!(t.to_string(), "abcdefgh…");
        assert_eq!(SessionToken::new("short").to_string(), "short");
    }
}
