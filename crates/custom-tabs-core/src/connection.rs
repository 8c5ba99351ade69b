//! Connection facade: the single coordination task that owns every piece of
//! mutable state, plus the handles that talk to it.
//!
//! ```text
//!  ClientBinding ──┐ bounded commands (oneshot reply)
//!  ConnectionHandle┼──────────────────────────────▶ Coordinator ──▶ RenderHost
//!                  │ unbounded signals                 │  SessionRegistry
//!  lifecycle, drop ┴──────────────────────────────▶    │  SpeculationController
//!                                                      ├──▶ ClientEvent (per binding)
//!                                                      └──▶ watch<ConnectionSnapshot>
//! ```
//!
//! Commands arrive from any number of tasks and are applied one at a time.
//! Lifecycle signals (disconnect, renderer death, async verification and
//! fetch results) go through an unbounded channel so they can be raised from
//! synchronous code such as `Drop`, and are always drained before the next
//! command.
//!
//! [`ClientBinding`] is the per-process binding surface. It never returns
//! errors: a coordinator that has gone away reads as a rejection.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, ConnectionConfig};
use crate::error::{Error, Result};
use crate::extras::{self, Candidate, Extras};
use crate::host::{FetchVerdict, MessagingError, NetworkMonitor, ParallelFetcher, RenderHost, RenderTargetId};
use crate::origin_verifier::{AssetLinkVerifier, OriginVerifier, Relation};
use crate::post_message::PostMessageStatus;
use crate::session::{
    ClientIdentity, ConnectionId, LaunchClassification, PredictionOutcome, SessionRegistry,
    SessionToken, WarmupState,
};
use crate::speculation::{
    MayLaunchOutcome, MayLaunchRequest, SpeculationController, SpeculationCounters,
    SpeculationState,
};
use crate::throttle::{RequestThrottler, ThrottleStats};
use crate::url_policy::{self, Origin};

const FLAGGED_URL_CAPACITY: usize = 256;

// =============================================================================
// Public types
// =============================================================================

/// External collaborators the coordinator drives.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub render_host: Arc<dyn RenderHost>,
    pub asset_links: Arc<dyn AssetLinkVerifier>,
    pub fetcher: Arc<dyn ParallelFetcher>,
    pub network: Arc<dyn NetworkMonitor>,
    pub clock: Arc<dyn Clock>,
}

/// Notifications pushed to a bound client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    WarmupCompleted,
    RelationshipValidated {
        token: SessionToken,
        relation: Relation,
        origin: Origin,
        verified: bool,
    },
    MessageChannelReady {
        token: SessionToken,
    },
    PageMessage {
        token: SessionToken,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParallelRequestStatus {
    NoRequest,
    Success,
    FailureNotAuthorized,
    FailureInvalidUrl,
    FailureInvalidReferrer,
    FailureInvalidReferrerForSession,
}

/// What a real navigation turned into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum NavigationDisposition {
    /// The speculation was made visible.
    Promoted { target: RenderTargetId },
    /// A fresh tab was opened.
    Fresh { target: RenderTargetId },
    /// A parallel fetch of this URL was flagged; show an interstitial.
    Interstitial { threat: String },
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationOutcome {
    #[serde(flatten)]
    pub disposition: NavigationDisposition,
    pub classification: Option<LaunchClassification>,
}

/// Immutable view of the coordinator, readable from any thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub sessions: usize,
    pub bound_clients: usize,
    pub speculation_state: SpeculationState,
    pub speculation_url: Option<String>,
    pub warmup_called: bool,
    pub network_prediction_enabled: bool,
    pub tracked_throttle_clients: usize,
    pub flagged_urls: usize,
    pub parallel_requests: u64,
    pub counters: SpeculationCounters,
}

/// Session-scoped boolean capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionFlag {
    IgnoreUrlFragments,
    CanUseHiddenTab,
    SpeculateOnCellular,
    AllowParallelRequest,
    CollectPageLoadMetrics,
}

#[derive(Debug, Clone, Copy)]
enum ThrottleOp {
    Reset(u32),
    Ban(u32),
    PurgeAll,
}

// =============================================================================
// Messages to the coordinator
// =============================================================================

enum Command {
    Bind {
        identity: ClientIdentity,
        events: mpsc::Sender<ClientEvent>,
        reply: oneshot::Sender<ConnectionId>,
    },
    NewSession {
        connection: ConnectionId,
        identity: ClientIdentity,
        token: SessionToken,
        reply: oneshot::Sender<bool>,
    },
    Warmup {
        uid: u32,
        flags: u64,
        reply: oneshot::Sender<bool>,
    },
    MayLaunchUrl {
        uid: u32,
        token: SessionToken,
        url: Option<String>,
        extras: Extras,
        candidates: Vec<Candidate>,
        reply: oneshot::Sender<MayLaunchOutcome>,
    },
    RequestChannel {
        token: SessionToken,
        origin: Option<Origin>,
        reply: oneshot::Sender<bool>,
    },
    PostMessage {
        token: SessionToken,
        message: String,
        reply: oneshot::Sender<PostMessageStatus>,
    },
    ParallelRequest {
        token: SessionToken,
        request: Extras,
        reply: oneshot::Sender<ParallelRequestStatus>,
    },
    UpdateVisuals {
        token: SessionToken,
        visuals: Extras,
        reply: oneshot::Sender<bool>,
    },
    ValidateRelationship {
        token: SessionToken,
        relation: Relation,
        origin: Origin,
        reply: oneshot::Sender<bool>,
    },
    SetFlag {
        token: SessionToken,
        flag: SessionFlag,
        value: bool,
        reply: oneshot::Sender<bool>,
    },
    Navigate {
        token: SessionToken,
        url: String,
        reply: oneshot::Sender<NavigationOutcome>,
    },
    DeliverPageMessage {
        target: RenderTargetId,
        message: String,
        reply: oneshot::Sender<bool>,
    },
    InitializeOriginUnchecked {
        token: SessionToken,
        origin: Option<Origin>,
        reply: oneshot::Sender<bool>,
    },
    VerifyAndInitializeOrigin {
        token: SessionToken,
        origin: Origin,
        relation: Relation,
        reply: oneshot::Sender<bool>,
    },
    PostMessageOrigin {
        token: SessionToken,
        reply: oneshot::Sender<Option<Origin>>,
    },
    Throttle {
        op: ThrottleOp,
        reply: oneshot::Sender<()>,
    },
    ThrottleStats {
        uid: u32,
        reply: oneshot::Sender<Option<ThrottleStats>>,
    },
    Snapshot {
        reply: oneshot::Sender<ConnectionSnapshot>,
    },
    SetNetworkPrediction {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    CleanupAll {
        reply: oneshot::Sender<usize>,
    },
    ForgetSession {
        token: SessionToken,
        reply: oneshot::Sender<bool>,
    },
    WarmupState {
        token: SessionToken,
        reply: oneshot::Sender<WarmupState>,
    },
    PredictionOutcome {
        token: SessionToken,
        url: String,
        reply: oneshot::Sender<PredictionOutcome>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Signal {
    Disconnected(ConnectionId),
    RenderProcessGone(RenderTargetId),
    PageNavigated(RenderTargetId),
    ChannelVerified {
        token: SessionToken,
        generation: u64,
        origin: Origin,
        verified: bool,
        reply: Option<oneshot::Sender<bool>>,
    },
    RelationshipVerified {
        token: SessionToken,
        relation: Relation,
        origin: Origin,
        verified: bool,
    },
    FetchFinished {
        url: url::Url,
        verdict: FetchVerdict,
    },
}

fn coordinator_gone() -> Error {
    Error::Runtime("connection coordinator is not running".to_string())
}

async fn request<T>(
    commands: &mpsc::Sender<Command>,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    commands.send(make(tx)).await.map_err(|_| coordinator_gone())?;
    rx.await.map_err(|_| coordinator_gone())
}

// =============================================================================
// ConnectionHandle (browser side, cheap to clone)
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    signals: mpsc::UnboundedSender<Signal>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    event_buffer: usize,
}

impl ConnectionHandle {
    /// Validate `config` and start the coordinator on the current tokio
    /// runtime.
    pub fn spawn(config: &Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let ConnectionConfig {
            command_buffer,
            event_buffer,
        } = config.connection;

        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::default());

        let verifier = OriginVerifier::new(
            collaborators.asset_links,
            Arc::clone(&collaborators.clock),
            &config.verification,
        );
        let registry = SessionRegistry::new(
            RequestThrottler::new(config.throttle.clone()),
            Arc::new(verifier),
        );
        let speculation = SpeculationController::new(
            Arc::clone(&collaborators.render_host),
            collaborators.network,
            &config.speculation,
        );

        let coordinator = Coordinator {
            registry,
            speculation,
            host: collaborators.render_host,
            fetcher: collaborators.fetcher,
            clock: collaborators.clock,
            clients: HashMap::new(),
            next_connection: 0,
            flagged: LruCache::new(
                NonZeroUsize::new(FLAGGED_URL_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            ),
            parallel_requests: 0,
            signals: signal_tx.clone(),
            snapshot: snapshot_tx,
        };
        tokio::spawn(coordinator.run(command_rx, signal_rx));
        info!(command_buffer, event_buffer, "Connection coordinator started");

        Ok(Self {
            commands: command_tx,
            signals: signal_tx,
            snapshot: snapshot_rx,
            event_buffer: event_buffer.max(1),
        })
    }

    /// Attach a client process. Dropping the returned binding is its
    /// disconnect.
    pub async fn bind(
        &self,
        identity: ClientIdentity,
    ) -> Result<(ClientBinding, mpsc::Receiver<ClientEvent>)> {
        let (events_tx, events_rx) = mpsc::channel(self.event_buffer);
        let connection = request(&self.commands, |reply| Command::Bind {
            identity: identity.clone(),
            events: events_tx,
            reply,
        })
        .await?;
        let binding = ClientBinding {
            identity,
            connection,
            commands: self.commands.clone(),
            signals: self.signals.clone(),
        };
        Ok((binding, events_rx))
    }

    /// Real navigation of `token`'s tab to `url`.
    pub async fn navigate(&self, token: &SessionToken, url: &str) -> Result<NavigationOutcome> {
        request(&self.commands, |reply| Command::Navigate {
            token: token.clone(),
            url: url.to_string(),
            reply,
        })
        .await
    }

    /// The renderer behind `target` died. Callable from any thread.
    pub fn on_render_process_gone(&self, target: RenderTargetId) -> Result<()> {
        self.signal(Signal::RenderProcessGone(target))
    }

    /// `target` moved to a different document. Callable from any thread.
    pub fn on_page_navigated(&self, target: RenderTargetId) -> Result<()> {
        self.signal(Signal::PageNavigated(target))
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.signals.send(signal).map_err(|_| coordinator_gone())
    }

    /// Page content of `target` posted `message` to its client.
    pub async fn deliver_page_message(&self, target: RenderTargetId, message: &str) -> Result<bool> {
        request(&self.commands, |reply| Command::DeliverPageMessage {
            target,
            message: message.to_string(),
            reply,
        })
        .await
    }

    /// Trusted override: bind `origin` without verification, or invalidate
    /// the channel with `None`.
    pub async fn initialize_origin_unchecked(
        &self,
        token: &SessionToken,
        origin: Option<Origin>,
    ) -> Result<bool> {
        request(&self.commands, |reply| Command::InitializeOriginUnchecked {
            token: token.clone(),
            origin,
            reply,
        })
        .await
    }

    /// Verify `origin` for the session owner and activate the channel on
    /// success. Resolves once the verification has been applied.
    pub async fn verify_and_initialize_origin(
        &self,
        token: &SessionToken,
        origin: Origin,
        relation: Relation,
    ) -> Result<bool> {
        request(&self.commands, |reply| Command::VerifyAndInitializeOrigin {
            token: token.clone(),
            origin,
            relation,
            reply,
        })
        .await
    }

    pub async fn post_message_origin(&self, token: &SessionToken) -> Result<Option<Origin>> {
        request(&self.commands, |reply| Command::PostMessageOrigin {
            token: token.clone(),
            reply,
        })
        .await
    }

    pub async fn reset_throttling(&self, uid: u32) -> Result<()> {
        request(&self.commands, |reply| Command::Throttle {
            op: ThrottleOp::Reset(uid),
            reply,
        })
        .await
    }

    pub async fn ban(&self, uid: u32) -> Result<()> {
        request(&self.commands, |reply| Command::Throttle {
            op: ThrottleOp::Ban(uid),
            reply,
        })
        .await
    }

    pub async fn purge_all_throttle_entries(&self) -> Result<()> {
        request(&self.commands, |reply| Command::Throttle {
            op: ThrottleOp::PurgeAll,
            reply,
        })
        .await
    }

    pub async fn throttle_stats(&self, uid: u32) -> Result<Option<ThrottleStats>> {
        request(&self.commands, |reply| Command::ThrottleStats { uid, reply }).await
    }

    pub async fn set_network_prediction_enabled(&self, enabled: bool) -> Result<()> {
        request(&self.commands, |reply| Command::SetNetworkPrediction {
            enabled,
            reply,
        })
        .await
    }

    /// Forget every session. Returns how many were removed.
    pub async fn cleanup_all(&self) -> Result<usize> {
        request(&self.commands, |reply| Command::CleanupAll { reply }).await
    }

    pub async fn forget_session(&self, token: &SessionToken) -> Result<bool> {
        request(&self.commands, |reply| Command::ForgetSession {
            token: token.clone(),
            reply,
        })
        .await
    }

    pub async fn warmup_state(&self, token: &SessionToken) -> Result<WarmupState> {
        request(&self.commands, |reply| Command::WarmupState {
            token: token.clone(),
            reply,
        })
        .await
    }

    pub async fn prediction_outcome(
        &self,
        token: &SessionToken,
        url: &str,
    ) -> Result<PredictionOutcome> {
        request(&self.commands, |reply| Command::PredictionOutcome {
            token: token.clone(),
            url: url.to_string(),
            reply,
        })
        .await
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Snapshot taken by the coordinator after every earlier command.
    pub async fn current_snapshot(&self) -> Result<ConnectionSnapshot> {
        request(&self.commands, |reply| Command::Snapshot { reply }).await
    }

    #[must_use]
    pub fn watch_snapshots(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    /// Release every resource and stop the coordinator.
    pub async fn shutdown(&self) -> Result<()> {
        request(&self.commands, |reply| Command::Shutdown { reply }).await
    }
}

// =============================================================================
// ClientBinding (one per client process)
// =============================================================================

#[derive(Debug)]
pub struct ClientBinding {
    identity: ClientIdentity,
    connection: ConnectionId,
    commands: mpsc::Sender<Command>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl ClientBinding {
    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub async fn new_session(&self, token: &SessionToken) -> bool {
        request(&self.commands, |reply| Command::NewSession {
            connection: self.connection,
            identity: self.identity.clone(),
            token: token.clone(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn warmup(&self, flags: u64) -> bool {
        request(&self.commands, |reply| Command::Warmup {
            uid: self.identity.uid,
            flags,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn may_launch_url(
        &self,
        token: &SessionToken,
        url: Option<&str>,
        extras: &Extras,
        candidates: &[Candidate],
    ) -> bool {
        self.may_launch_url_outcome(token, url, extras, candidates)
            .await
            .is_some_and(|outcome| outcome.is_accepted())
    }

    /// Like [`Self::may_launch_url`] but reports what was done or why not.
    /// `None` if the coordinator is gone.
    pub async fn may_launch_url_outcome(
        &self,
        token: &SessionToken,
        url: Option<&str>,
        extras: &Extras,
        candidates: &[Candidate],
    ) -> Option<MayLaunchOutcome> {
        request(&self.commands, |reply| Command::MayLaunchUrl {
            uid: self.identity.uid,
            token: token.clone(),
            url: url.map(str::to_string),
            extras: extras.clone(),
            candidates: candidates.to_vec(),
            reply,
        })
        .await
        .ok()
    }

    /// Open the postMessage channel. With an origin, it is verified for this
    /// client in the background; without one, a reopened channel re-verifies
    /// the origin it was last verified for.
    pub async fn request_post_message_channel(
        &self,
        token: &SessionToken,
        origin: Option<&str>,
    ) -> bool {
        let origin = match origin {
            Some(raw) => match Origin::parse(raw) {
                Some(origin) => Some(origin),
                None => return false,
            },
            None => None,
        };
        request(&self.commands, |reply| Command::RequestChannel {
            token: token.clone(),
            origin,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn post_message(
        &self,
        token: &SessionToken,
        message: &str,
        _extras: Option<&Extras>,
    ) -> PostMessageStatus {
        request(&self.commands, |reply| Command::PostMessage {
            token: token.clone(),
            message: message.to_string(),
            reply,
        })
        .await
        .unwrap_or(PostMessageStatus::FailureMessagingError)
    }

    pub async fn handle_parallel_request(
        &self,
        token: &SessionToken,
        request_extras: &Extras,
    ) -> ParallelRequestStatus {
        request(&self.commands, |reply| Command::ParallelRequest {
            token: token.clone(),
            request: request_extras.clone(),
            reply,
        })
        .await
        .unwrap_or(ParallelRequestStatus::NoRequest)
    }

    pub async fn update_visuals(&self, token: &SessionToken, visuals: &Extras) -> bool {
        request(&self.commands, |reply| Command::UpdateVisuals {
            token: token.clone(),
            visuals: visuals.clone(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Start verifying `origin`; the result arrives as
    /// [`ClientEvent::RelationshipValidated`].
    pub async fn validate_relationship(
        &self,
        token: &SessionToken,
        relation: Relation,
        origin: &str,
    ) -> bool {
        let Some(origin) = Origin::parse(origin) else {
            return false;
        };
        request(&self.commands, |reply| Command::ValidateRelationship {
            token: token.clone(),
            relation,
            origin,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    async fn set_flag(&self, token: &SessionToken, flag: SessionFlag, value: bool) -> bool {
        request(&self.commands, |reply| Command::SetFlag {
            token: token.clone(),
            flag,
            value,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn set_ignore_url_fragments_for_session(&self, token: &SessionToken, value: bool) -> bool {
        self.set_flag(token, SessionFlag::IgnoreUrlFragments, value).await
    }

    pub async fn set_can_use_hidden_tab_for_session(&self, token: &SessionToken, value: bool) -> bool {
        self.set_flag(token, SessionFlag::CanUseHiddenTab, value).await
    }

    pub async fn set_should_speculate_load_on_cellular_for_session(
        &self,
        token: &SessionToken,
        value: bool,
    ) -> bool {
        self.set_flag(token, SessionFlag::SpeculateOnCellular, value).await
    }

    pub async fn set_allow_parallel_request_for_session(
        &self,
        token: &SessionToken,
        value: bool,
    ) -> bool {
        self.set_flag(token, SessionFlag::AllowParallelRequest, value).await
    }

    pub async fn set_should_get_page_load_metrics_for_session(
        &self,
        token: &SessionToken,
        value: bool,
    ) -> bool {
        self.set_flag(token, SessionFlag::CollectPageLoadMetrics, value).await
    }

    /// Same as dropping the binding.
    pub fn disconnect(self) {}
}

impl Drop for ClientBinding {
    fn drop(&mut self) {
        // Coordinator already gone is fine: nothing left to clean.
        let _ = self.signals.send(Signal::Disconnected(self.connection));
    }
}

// =============================================================================
// Coordinator (single writer)
// =============================================================================

#[derive(Debug)]
struct ClientSink {
    identity: ClientIdentity,
    events: mpsc::Sender<ClientEvent>,
}

struct Coordinator {
    registry: SessionRegistry,
    speculation: SpeculationController,
    host: Arc<dyn RenderHost>,
    fetcher: Arc<dyn ParallelFetcher>,
    clock: Arc<dyn Clock>,
    clients: HashMap<ConnectionId, ClientSink>,
    next_connection: u64,
    // url without fragment -> threat
    flagged: LruCache<String, String>,
    parallel_requests: u64,
    signals: mpsc::UnboundedSender<Signal>,
    snapshot: watch::Sender<ConnectionSnapshot>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        self.publish();
        loop {
            tokio::select! {
                biased;
                Some(signal) = signals.recv() => self.handle_signal(signal),
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All handles dropped, coordinator stopping");
                        self.shutdown();
                        break;
                    }
                },
            }
            self.publish();
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.build_snapshot());
    }

    fn build_snapshot(&self) -> ConnectionSnapshot {
        let speculation = self.speculation.speculation();
        ConnectionSnapshot {
            sessions: self.registry.len(),
            bound_clients: self.clients.len(),
            speculation_state: self.speculation.state(),
            speculation_url: speculation.map(|s| s.url().to_string()),
            warmup_called: self.registry.warmup_called(),
            network_prediction_enabled: self.speculation.network_prediction_enabled(),
            tracked_throttle_clients: self.registry.throttler().tracked_clients(),
            flagged_urls: self.flagged.len(),
            parallel_requests: self.parallel_requests,
            counters: self.speculation.counters(),
        }
    }

    fn shutdown(&mut self) {
        let removed = self.registry.cleanup_all();
        self.speculation.shutdown();
        self.clients.clear();
        info!(sessions = removed.len(), "Connection coordinator stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Bind {
                identity,
                events,
                reply,
            } => {
                self.next_connection += 1;
                let connection = ConnectionId(self.next_connection);
                info!(
                    connection_id = %connection,
                    uid = identity.uid,
                    package = %identity.package_name,
                    "Client bound"
                );
                self.clients
                    .insert(connection, ClientSink { identity, events });
                let _ = reply.send(connection);
            }
            Command::NewSession {
                connection,
                identity,
                token,
                reply,
            } => {
                let created = self.clients.contains_key(&connection)
                    && self.registry.new_session(&token, identity, connection);
                let _ = reply.send(created);
            }
            Command::Warmup { uid, flags, reply } => {
                let _ = reply.send(self.warmup(uid, flags));
            }
            Command::MayLaunchUrl {
                uid,
                token,
                url,
                extras,
                candidates,
                reply,
            } => {
                let now_ms = self.clock.now_ms();
                let outcome = self.speculation.may_launch_url(
                    &mut self.registry,
                    MayLaunchRequest {
                        caller_uid: uid,
                        token: &token,
                        url: url.as_deref(),
                        extras: &extras,
                        candidates: &candidates,
                    },
                    now_ms,
                );
                debug!(session = %token, uid, outcome = ?outcome, "mayLaunchUrl");
                let _ = reply.send(outcome);
            }
            Command::RequestChannel {
                token,
                origin,
                reply,
            } => {
                let _ = reply.send(self.request_channel(&token, origin));
            }
            Command::PostMessage {
                token,
                message,
                reply,
            } => {
                let _ = reply.send(self.post_message(&token, &message));
            }
            Command::ParallelRequest {
                token,
                request,
                reply,
            } => {
                let status = self.parallel_request(&token, &request);
                info!(session = %token, status = ?status, "Parallel request");
                let _ = reply.send(status);
            }
            Command::UpdateVisuals {
                token,
                visuals,
                reply,
            } => {
                let updated = self.registry.contains(&token) && self.host.update_visuals(&visuals);
                let _ = reply.send(updated);
            }
            Command::ValidateRelationship {
                token,
                relation,
                origin,
                reply,
            } => {
                let _ = reply.send(self.validate_relationship(&token, relation, origin));
            }
            Command::SetFlag {
                token,
                flag,
                value,
                reply,
            } => {
                let updated = match flag {
                    SessionFlag::IgnoreUrlFragments => {
                        self.registry.set_ignore_url_fragments(&token, value)
                    }
                    SessionFlag::CanUseHiddenTab => self.registry.set_can_use_hidden_tab(&token, value),
                    SessionFlag::SpeculateOnCellular => {
                        self.registry.set_should_speculate_on_cellular(&token, value)
                    }
                    SessionFlag::AllowParallelRequest => {
                        self.registry.set_allow_parallel_request(&token, value)
                    }
                    SessionFlag::CollectPageLoadMetrics => {
                        self.registry.set_collect_page_load_metrics(&token, value)
                    }
                };
                let _ = reply.send(updated);
            }
            Command::Navigate { token, url, reply } => {
                let _ = reply.send(self.navigate(&token, &url));
            }
            Command::DeliverPageMessage {
                target,
                message,
                reply,
            } => {
                let _ = reply.send(self.deliver_page_message(target, message));
            }
            Command::InitializeOriginUnchecked {
                token,
                origin,
                reply,
            } => {
                let initialized = match self.registry.get_mut(&token) {
                    Some(session) => {
                        session.channel.initialize_unchecked(origin);
                        true
                    }
                    None => false,
                };
                self.notify_channel_ready(&token);
                let _ = reply.send(initialized);
            }
            Command::VerifyAndInitializeOrigin {
                token,
                origin,
                relation,
                reply,
            } => {
                let Some(session) = self.registry.get_mut(&token) else {
                    let _ = reply.send(false);
                    return;
                };
                let generation = session.channel.begin_verification(origin.clone());
                let package = session.owner().package_name.clone();
                self.spawn_channel_verification(token, package, origin, relation, generation, Some(reply));
            }
            Command::PostMessageOrigin { token, reply } => {
                let origin = self
                    .registry
                    .get(&token)
                    .and_then(|s| s.post_message_origin().cloned());
                let _ = reply.send(origin);
            }
            Command::Throttle { op, reply } => {
                let throttler = self.registry.throttler_mut();
                match op {
                    ThrottleOp::Reset(uid) => throttler.reset(uid),
                    ThrottleOp::Ban(uid) => throttler.ban(uid),
                    ThrottleOp::PurgeAll => throttler.purge_all(),
                }
                let _ = reply.send(());
            }
            Command::ThrottleStats { uid, reply } => {
                let _ = reply.send(self.registry.throttler().stats(uid));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.build_snapshot());
            }
            Command::SetNetworkPrediction { enabled, reply } => {
                info!(enabled, "Network prediction preference changed");
                self.speculation.set_network_prediction_enabled(enabled);
                let _ = reply.send(());
            }
            Command::CleanupAll { reply } => {
                let removed = self.registry.cleanup_all();
                let tokens: Vec<SessionToken> = removed.iter().map(|s| s.token().clone()).collect();
                self.speculation.release_for_sessions(&tokens);
                let _ = reply.send(tokens.len());
            }
            Command::ForgetSession { token, reply } => {
                let removed = self.registry.forget_session(&token).is_some();
                if removed {
                    self.speculation.release_for_sessions(std::slice::from_ref(&token));
                }
                let _ = reply.send(removed);
            }
            Command::WarmupState { token, reply } => {
                let state = self.registry.warmup_state(&token);
                debug!(session = %token, state = ?state, "Warmup state");
                let _ = reply.send(state);
            }
            Command::PredictionOutcome { token, url, reply } => {
                let _ = reply.send(self.registry.prediction_outcome(&token, &url));
            }
            Command::Shutdown { reply } => {
                // Handled by the run loop.
                let _ = reply.send(());
            }
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Disconnected(connection) => {
                let removed = self.registry.cleanup_connection(connection);
                let tokens: Vec<SessionToken> = removed.iter().map(|s| s.token().clone()).collect();
                self.speculation.release_for_sessions(&tokens);
                if self.clients.remove(&connection).is_some() {
                    info!(
                        connection_id = %connection,
                        sessions = tokens.len(),
                        "Client disconnected"
                    );
                }
            }
            Signal::RenderProcessGone(target) => {
                let was_speculation = self.speculation.on_render_process_gone(target);
                let channels = self.lose_target(target);
                info!(target_id = %target, was_speculation, channels, "Render process gone");
            }
            Signal::PageNavigated(target) => {
                let channels = self.lose_target(target);
                debug!(target_id = %target, channels, "Page navigated to a new document");
            }
            Signal::ChannelVerified {
                token,
                generation,
                origin,
                verified,
                reply,
            } => {
                let active = match self.registry.get_mut(&token) {
                    Some(session) => {
                        session.channel.apply_verification(generation, origin, verified);
                        session.post_message_origin().is_some()
                    }
                    None => false,
                };
                debug!(session = %token, verified, active, "Channel verification applied");
                self.notify_channel_ready(&token);
                if let Some(reply) = reply {
                    let _ = reply.send(active);
                }
            }
            Signal::RelationshipVerified {
                token,
                relation,
                origin,
                verified,
            } => {
                let Some(connection) = self.registry.get(&token).map(|s| s.connection()) else {
                    return;
                };
                Self::emit(
                    &self.clients,
                    connection,
                    ClientEvent::RelationshipValidated {
                        token,
                        relation,
                        origin,
                        verified,
                    },
                );
            }
            Signal::FetchFinished { url, verdict } => match verdict {
                FetchVerdict::Clean => debug!(url = %url, "Parallel fetch clean"),
                FetchVerdict::Blocked(threat) => {
                    warn!(url = %url, threat = %threat, "Parallel fetch flagged");
                    self.flagged
                        .put(url_policy::without_fragment(&url).to_string(), threat);
                }
            },
        }
    }

    fn emit(clients: &HashMap<ConnectionId, ClientSink>, connection: ConnectionId, event: ClientEvent) {
        let Some(sink) = clients.get(&connection) else {
            return;
        };
        match sink.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    connection_id = %connection,
                    uid = sink.identity.uid,
                    "Client event queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection_id = %connection, "Client event receiver dropped");
            }
        }
    }

    fn warmup(&mut self, uid: u32, flags: u64) -> bool {
        self.registry.record_warmup(uid);
        let warmed = self.speculation.warmup();
        info!(uid, flags, "Warmup");
        for connection in self.clients.keys() {
            Self::emit(&self.clients, *connection, ClientEvent::WarmupCompleted);
        }
        warmed
    }

    fn request_channel(&mut self, token: &SessionToken, origin: Option<Origin>) -> bool {
        let Some(session) = self.registry.get_mut(token) else {
            return false;
        };
        let opened = session.channel.request(origin);
        let package = session.owner().package_name.clone();
        if let Some(origin) = opened.verify {
            debug!(session = %token, origin = %origin, "Verifying channel origin");
            self.spawn_channel_verification(
                token.clone(),
                package,
                origin,
                Relation::UseAsOrigin,
                opened.generation,
                None,
            );
        }
        true
    }

    fn spawn_channel_verification(
        &self,
        token: SessionToken,
        package: String,
        origin: Origin,
        relation: Relation,
        generation: u64,
        reply: Option<oneshot::Sender<bool>>,
    ) {
        let verifier = Arc::clone(self.registry.verifier());
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let verified = verifier.verify(&package, &origin, relation).await;
            let _ = signals.send(Signal::ChannelVerified {
                token,
                generation,
                origin,
                verified,
                reply,
            });
        });
    }

    fn validate_relationship(&mut self, token: &SessionToken, relation: Relation, origin: Origin) -> bool {
        let Some(session) = self.registry.get(token) else {
            return false;
        };
        let package = session.owner().package_name.clone();
        let verifier = Arc::clone(self.registry.verifier());
        let signals = self.signals.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let verified = verifier.verify(&package, &origin, relation).await;
            let _ = signals.send(Signal::RelationshipVerified {
                token,
                relation,
                origin,
                verified,
            });
        });
        true
    }

    fn post_message(&mut self, token: &SessionToken, message: &str) -> PostMessageStatus {
        let Some(session) = self.registry.get_mut(token) else {
            return PostMessageStatus::FailureNoChannel;
        };
        let (target, origin) = match session.channel.route() {
            Ok((target, origin)) => (target, origin.clone()),
            Err(status) => return status,
        };
        match self.host.post_message(target, &origin, message) {
            Ok(()) => {
                debug!(session = %token, target_id = %target, len = message.len(), "Message posted");
                PostMessageStatus::Success
            }
            Err(MessagingError::TargetGone(gone)) => {
                session.channel.on_target_lost(gone);
                PostMessageStatus::FailureMessagingError
            }
            Err(err) => {
                debug!(session = %token, target_id = %target, error = %err, "Message rejected");
                PostMessageStatus::FailureMessagingError
            }
        }
    }

    fn parallel_request(&mut self, token: &SessionToken, request: &Extras) -> ParallelRequestStatus {
        let Some(session) = self.registry.get(token) else {
            return ParallelRequestStatus::NoRequest;
        };
        if !session.allow_parallel_request() {
            return ParallelRequestStatus::FailureNotAuthorized;
        }
        if !request.contains_key(extras::PARALLEL_REQUEST_URL_KEY) {
            return ParallelRequestStatus::NoRequest;
        }
        let Some(referrer) = request
            .uri(extras::PARALLEL_REQUEST_REFERRER_KEY)
            .and_then(Origin::parse)
        else {
            return ParallelRequestStatus::FailureInvalidReferrer;
        };
        let Some(url) = request
            .uri(extras::PARALLEL_REQUEST_URL_KEY)
            .and_then(url_policy::parse_web_url)
        else {
            return ParallelRequestStatus::FailureInvalidUrl;
        };
        if !self.registry.is_first_party_origin(token, &referrer) {
            return ParallelRequestStatus::FailureInvalidReferrerForSession;
        }

        self.parallel_requests += 1;
        let fetcher = Arc::clone(&self.fetcher);
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let verdict = fetcher.fetch(&url, &referrer).await;
            let _ = signals.send(Signal::FetchFinished { url, verdict });
        });
        ParallelRequestStatus::Success
    }

    fn navigate(&mut self, token: &SessionToken, raw_url: &str) -> NavigationOutcome {
        let Some(url) = url_policy::parse_web_url(raw_url) else {
            return NavigationOutcome {
                disposition: NavigationDisposition::Rejected,
                classification: None,
            };
        };
        let classification = self
            .speculation
            .register_launch(&mut self.registry, token, url.as_str());

        let key = url_policy::without_fragment(&url).to_string();
        if let Some(threat) = self.flagged.get(&key).cloned() {
            self.speculation.cancel(token);
            warn!(session = %token, url = %url, threat = %threat, "Navigation to flagged resource");
            return NavigationOutcome {
                disposition: NavigationDisposition::Interstitial { threat },
                classification,
            };
        }

        let ignore_fragments = self
            .registry
            .get(token)
            .is_some_and(|s| s.ignore_url_fragments());
        let disposition = match self
            .speculation
            .take_for_navigation(token, &url, ignore_fragments)
        {
            Some(target) => NavigationDisposition::Promoted { target },
            None => {
                let referrer = self.registry.referrer(token).unwrap_or_default().to_string();
                match self.host.open_tab(&url, &referrer) {
                    Some(target) => NavigationDisposition::Fresh { target },
                    None => NavigationDisposition::Rejected,
                }
            }
        };

        if let NavigationDisposition::Promoted { target } | NavigationDisposition::Fresh { target } =
            &disposition
        {
            let target = *target;
            if let Some(session) = self.registry.get_mut(token) {
                if let Some(previous) = session.channel.target().filter(|t| *t != target) {
                    session.channel.on_target_lost(previous);
                }
                session.channel.bind_target(target);
            }
            self.notify_channel_ready(token);
        }
        info!(session = %token, url = %url, disposition = ?disposition, "Navigation");
        NavigationOutcome {
            disposition,
            classification,
        }
    }

    fn deliver_page_message(&mut self, target: RenderTargetId, message: String) -> bool {
        let Some(session) = self.registry.sessions_mut().find(|s| {
            s.channel.target() == Some(target) && s.post_message_origin().is_some()
        }) else {
            return false;
        };
        let connection = session.connection();
        let token = session.token().clone();
        debug!(session = %token, target_id = %target, len = message.len(), "Page message");
        Self::emit(&self.clients, connection, ClientEvent::PageMessage { token, message });
        true
    }

    /// Invalidate every channel bound to `target`.
    fn lose_target(&mut self, target: RenderTargetId) -> usize {
        self.registry
            .sessions_mut()
            .map(|s| s.channel.on_target_lost(target))
            .filter(|lost| *lost)
            .count()
    }

    fn notify_channel_ready(&mut self, token: &SessionToken) {
        let Some(session) = self.registry.get_mut(token) else {
            return;
        };
        if session.channel.take_ready_notification() {
            let connection = session.connection();
            Self::emit(
                &self.clients,
                connection,
                ClientEvent::MessageChannelReady {
                    token: token.clone(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::SimulatedEnvironment;

    fn app() -> ClientIdentity {
        ClientIdentity::new(10_001, "com.example.app")
    }

    #[tokio::test]
    async fn bind_and_open_session() {
        let env = SimulatedEnvironment::new();
        let handle = ConnectionHandle::spawn(&Config::default(), env.collaborators()).unwrap();
        let (client, _events) = handle.bind(app()).await.unwrap();
        let token = SessionToken::new("tok");
        assert!(client.new_session(&token).await);
        assert!(!client.new_session(&token).await);
        assert_eq!(client.connection_id(), ConnectionId(1));
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let env = SimulatedEnvironment::new();
        let mut config = Config::default();
        config.throttle.min_delay_ms = 50_000;
        assert!(matches!(
            ConnectionHandle::spawn(&config, env.collaborators()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn calls_after_shutdown_are_rejections() {
        let env = SimulatedEnvironment::new();
        let handle = ConnectionHandle::spawn(&Config::default(), env.collaborators()).unwrap();
        let (client, _events) = handle.bind(app()).await.unwrap();
        handle.shutdown().await.unwrap();
        assert!(!client.new_session(&SessionToken::new("tok")).await);
        assert_eq!(
            client
                .post_message(&SessionToken::new("tok"), "hi", None)
                .await,
            PostMessageStatus::FailureMessagingError
        );
        assert!(matches!(handle.cleanup_all().await, Err(Error::Runtime(_))));
    }

    #[tokio::test]
    async fn dropping_binding_cleans_its_sessions() {
        let env = SimulatedEnvironment::new();
        let handle = ConnectionHandle::spawn(&Config::default(), env.collaborators()).unwrap();
        let (client, _events) = handle.bind(app()).await.unwrap();
        let token = SessionToken::new("tok");
        client.new_session(&token).await;
        drop(client);
        assert_eq!(
            handle.warmup_state(&token).await.unwrap(),
            WarmupState::NoSessionNoWarmup
        );
        assert_eq!(handle.snapshot().bound_clients, 0);
    }
}
