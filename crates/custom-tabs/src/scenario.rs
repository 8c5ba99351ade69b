//! Declarative client scenarios replayed against simulated collaborators.
//!
//! A scenario is a JSON document with a list of steps. Each step is applied
//! in order and produces one JSON line on the output.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use custom_tabs_core::config::Config;
use custom_tabs_core::connection::{ClientBinding, ClientEvent, ConnectionHandle};
use custom_tabs_core::extras::{
    Candidate, ExtraValue, Extras, PARALLEL_REQUEST_REFERRER_KEY, PARALLEL_REQUEST_URL_KEY,
};
use custom_tabs_core::host::{NetworkClass, RenderTargetId};
use custom_tabs_core::origin_verifier::Relation;
use custom_tabs_core::session::{ClientIdentity, SessionToken};
use custom_tabs_core::simulated::SimulatedEnvironment;
use custom_tabs_core::url_policy::Origin;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// How long an `events` step waits for background verifications to report.
const EVENT_SETTLE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Initial connection class of the simulated network.
    #[serde(default)]
    pub network: Option<NetworkClass>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("invalid scenario document")
    }
}

/// Session capability flags settable per session.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionFlagName {
    IgnoreUrlFragments,
    CanUseHiddenTab,
    SpeculateOnCellular,
    AllowParallelRequest,
    PageLoadMetrics,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    Bind {
        client: String,
        uid: u32,
        package: String,
    },
    Disconnect {
        client: String,
    },
    NewSession {
        client: String,
        token: String,
    },
    Warmup {
        client: String,
    },
    SetFlag {
        client: String,
        token: String,
        flag: SessionFlagName,
        value: bool,
    },
    MayLaunchUrl {
        client: String,
        token: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        extras: Extras,
        #[serde(default)]
        candidates: Vec<Candidate>,
    },
    Navigate {
        token: String,
        url: String,
    },
    RequestChannel {
        client: String,
        token: String,
        #[serde(default)]
        origin: Option<String>,
    },
    PostMessage {
        client: String,
        token: String,
        message: String,
    },
    ParallelRequest {
        client: String,
        token: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        referrer: Option<String>,
    },
    ValidateRelationship {
        client: String,
        token: String,
        relation: Relation,
        origin: String,
    },
    ForgetSession {
        token: String,
    },
    /// Register an asset-link statement with the simulated verifier.
    AllowAssetLink {
        package: String,
        origin: String,
        relation: Relation,
    },
    /// Make the simulated fetcher flag a URL.
    BlockUrl {
        url: String,
        threat: String,
    },
    KillRenderer {
        target: RenderTargetId,
    },
    SetNetwork {
        class: NetworkClass,
    },
    SetNetworkPrediction {
        enabled: bool,
    },
    AdvanceClock {
        ms: u64,
    },
    ResetThrottling {
        uid: u32,
    },
    ThrottleStats {
        uid: u32,
    },
    /// Drain the notifications delivered to a client so far.
    Events {
        client: String,
    },
    Snapshot,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bind { .. } => "bind",
            Self::Disconnect { .. } => "disconnect",
            Self::NewSession { .. } => "new_session",
            Self::Warmup { .. } => "warmup",
            Self::SetFlag { .. } => "set_flag",
            Self::MayLaunchUrl { .. } => "may_launch_url",
            Self::Navigate { .. } => "navigate",
            Self::RequestChannel { .. } => "request_channel",
            Self::PostMessage { .. } => "post_message",
            Self::ParallelRequest { .. } => "parallel_request",
            Self::ValidateRelationship { .. } => "validate_relationship",
            Self::ForgetSession { .. } => "forget_session",
            Self::AllowAssetLink { .. } => "allow_asset_link",
            Self::BlockUrl { .. } => "block_url",
            Self::KillRenderer { .. } => "kill_renderer",
            Self::SetNetwork { .. } => "set_network",
            Self::SetNetworkPrediction { .. } => "set_network_prediction",
            Self::AdvanceClock { .. } => "advance_clock",
            Self::ResetThrottling { .. } => "reset_throttling",
            Self::ThrottleStats { .. } => "throttle_stats",
            Self::Events { .. } => "events",
            Self::Snapshot => "snapshot",
        }
    }
}

/// One output line.
#[derive(Debug, Serialize)]
pub struct StepRecord<'a> {
    pub step: usize,
    pub op: &'a str,
    pub result: Value,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ReplaySummary {
    pub steps: usize,
    pub clients: usize,
}

struct Client {
    binding: ClientBinding,
    events: mpsc::Receiver<ClientEvent>,
}

/// Live state of a replay: the connection, its simulated collaborators and
/// the bound clients by name.
pub struct Replay {
    env: SimulatedEnvironment,
    handle: ConnectionHandle,
    clients: HashMap<String, Client>,
    bound: usize,
}

impl Replay {
    pub fn start(config: &Config, network: Option<NetworkClass>) -> Result<Self> {
        let env = SimulatedEnvironment::new();
        if let Some(class) = network {
            env.network.set(class);
        }
        let handle = ConnectionHandle::spawn(config, env.collaborators())?;
        Ok(Self {
            env,
            handle,
            clients: HashMap::new(),
            bound: 0,
        })
    }

    fn client(&self, name: &str) -> Result<&ClientBinding> {
        self.clients
            .get(name)
            .map(|client| &client.binding)
            .ok_or_else(|| anyhow!("unknown client '{name}' (bind it first)"))
    }

    pub async fn apply(&mut self, step: &Step) -> Result<Value> {
        let result = match step {
            Step::Bind {
                client,
                uid,
                package,
            } => {
                if self.clients.contains_key(client) {
                    bail!("client '{client}' is already bound");
                }
                let (binding, events) = self
                    .handle
                    .bind(ClientIdentity::new(*uid, package.as_str()))
                    .await?;
                let connection = binding.connection_id().to_string();
                self.clients
                    .insert(client.clone(), Client { binding, events });
                self.bound += 1;
                json!({ "connection": connection })
            }
            Step::Disconnect { client } => {
                let removed = self
                    .clients
                    .remove(client)
                    .ok_or_else(|| anyhow!("unknown client '{client}'"))?;
                removed.binding.disconnect();
                Value::Bool(true)
            }
            Step::NewSession { client, token } => {
                let token = SessionToken::new(token.as_str());
                Value::Bool(self.client(client)?.new_session(&token).await)
            }
            Step::Warmup { client } => Value::Bool(self.client(client)?.warmup(0).await),
            Step::SetFlag {
                client,
                token,
                flag,
                value,
            } => {
                let binding = self.client(client)?;
                let token = SessionToken::new(token.as_str());
                let applied = match flag {
                    SessionFlagName::IgnoreUrlFragments => {
                        binding
                            .set_ignore_url_fragments_for_session(&token, *value)
                            .await
                    }
                    SessionFlagName::CanUseHiddenTab => {
                        binding.set_can_use_hidden_tab_for_session(&token, *value).await
                    }
                    SessionFlagName::SpeculateOnCellular => {
                        binding
                            .set_should_speculate_load_on_cellular_for_session(&token, *value)
                            .await
                    }
                    SessionFlagName::AllowParallelRequest => {
                        binding
                            .set_allow_parallel_request_for_session(&token, *value)
                            .await
                    }
                    SessionFlagName::PageLoadMetrics => {
                        binding
                            .set_should_get_page_load_metrics_for_session(&token, *value)
                            .await
                    }
                };
                Value::Bool(applied)
            }
            Step::MayLaunchUrl {
                client,
                token,
                url,
                extras,
                candidates,
            } => {
                let token = SessionToken::new(token.as_str());
                let outcome = self
                    .client(client)?
                    .may_launch_url_outcome(&token, url.as_deref(), extras, candidates)
                    .await
                    .ok_or_else(|| anyhow!("coordinator stopped"))?;
                json!({ "accepted": outcome.is_accepted(), "outcome": outcome })
            }
            Step::Navigate { token, url } => {
                let token = SessionToken::new(token.as_str());
                serde_json::to_value(self.handle.navigate(&token, url).await?)?
            }
            Step::RequestChannel {
                client,
                token,
                origin,
            } => {
                let token = SessionToken::new(token.as_str());
                Value::Bool(
                    self.client(client)?
                        .request_post_message_channel(&token, origin.as_deref())
                        .await,
                )
            }
            Step::PostMessage {
                client,
                token,
                message,
            } => {
                let token = SessionToken::new(token.as_str());
                let status = self
                    .client(client)?
                    .post_message(&token, message, None)
                    .await;
                serde_json::to_value(status)?
            }
            Step::ParallelRequest {
                client,
                token,
                url,
                referrer,
            } => {
                let mut request = Extras::new();
                if let Some(url) = url {
                    request.insert(PARALLEL_REQUEST_URL_KEY, ExtraValue::Uri(url.clone()));
                }
                if let Some(referrer) = referrer {
                    request.insert(
                        PARALLEL_REQUEST_REFERRER_KEY,
                        ExtraValue::Uri(referrer.clone()),
                    );
                }
                let token = SessionToken::new(token.as_str());
                let status = self
                    .client(client)?
                    .handle_parallel_request(&token, &request)
                    .await;
                serde_json::to_value(status)?
            }
            Step::ValidateRelationship {
                client,
                token,
                relation,
                origin,
            } => {
                let token = SessionToken::new(token.as_str());
                Value::Bool(
                    self.client(client)?
                        .validate_relationship(&token, *relation, origin)
                        .await,
                )
            }
            Step::ForgetSession { token } => {
                let token = SessionToken::new(token.as_str());
                Value::Bool(self.handle.forget_session(&token).await?)
            }
            Step::AllowAssetLink {
                package,
                origin,
                relation,
            } => {
                let origin = Origin::parse(origin)
                    .ok_or_else(|| anyhow!("invalid origin '{origin}'"))?;
                self.env.asset_links.allow(package, &origin, *relation);
                Value::Null
            }
            Step::BlockUrl { url, threat } => {
                self.env.fetcher.block(url, threat);
                Value::Null
            }
            Step::KillRenderer { target } => {
                self.env.host.kill(*target);
                self.handle.on_render_process_gone(*target)?;
                Value::Null
            }
            Step::SetNetwork { class } => {
                self.env.network.set(*class);
                Value::Null
            }
            Step::SetNetworkPrediction { enabled } => {
                self.handle.set_network_prediction_enabled(*enabled).await?;
                Value::Null
            }
            Step::AdvanceClock { ms } => {
                self.env.clock.advance(*ms);
                Value::Null
            }
            Step::ResetThrottling { uid } => {
                self.handle.reset_throttling(*uid).await?;
                Value::Null
            }
            Step::ThrottleStats { uid } => {
                serde_json::to_value(self.handle.throttle_stats(*uid).await?)?
            }
            Step::Events { client } => {
                let client = self
                    .clients
                    .get_mut(client)
                    .ok_or_else(|| anyhow!("unknown client '{client}'"))?;
                let mut drained = Vec::new();
                while let Ok(Some(event)) =
                    tokio::time::timeout(EVENT_SETTLE, client.events.recv()).await
                {
                    drained.push(event);
                }
                serde_json::to_value(drained)?
            }
            Step::Snapshot => serde_json::to_value(self.handle.current_snapshot().await?)?,
        };
        Ok(result)
    }

    /// Disconnect every client and stop the coordinator.
    pub async fn finish(self, steps: usize) -> Result<ReplaySummary> {
        let Self {
            handle,
            clients,
            bound,
            ..
        } = self;
        drop(clients);
        handle.shutdown().await?;
        Ok(ReplaySummary {
            steps,
            clients: bound,
        })
    }
}

/// Replay every step, writing one JSON line per step to `out`.
pub async fn replay(scenario: &Scenario, config: &Config, out: &mut impl Write) -> Result<ReplaySummary> {
    let mut replay = Replay::start(config, scenario.network)?;
    for (index, step) in scenario.steps.iter().enumerate() {
        let step_no = index + 1;
        debug!(step = step_no, op = step.name(), "Applying scenario step");
        let result = replay
            .apply(step)
            .await
            .with_context(|| format!("step {step_no} ({}) failed", step.name()))?;
        let record = StepRecord {
            step: step_no,
            op: step.name(),
            result,
        };
        serde_json::to_writer(&mut *out, &record)?;
        writeln!(out)?;
    }
    let summary = replay.finish(scenario.steps.len()).await?;
    info!(steps = summary.steps, clients = summary.clients, "Scenario replayed");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "steps": [
            {"op": "bind", "client": "app", "uid": 10001, "package": "com.example.app"},
            {"op": "new_session", "client": "app", "token": "s1"},
            {"op": "set_flag", "client": "app", "token": "s1", "flag": "can_use_hidden_tab", "value": true},
            {"op": "may_launch_url", "client": "app", "token": "s1", "url": "https://site.test/a"},
            {"op": "navigate", "token": "s1", "url": "https://site.test/a"},
            {"op": "snapshot"}
        ]
    }"#;

    async fn run(content: &str) -> (Result<ReplaySummary>, Vec<Value>) {
        let scenario = Scenario::from_json(content).unwrap();
        let mut out = Vec::new();
        let summary = replay(&scenario, &Config::default(), &mut out).await;
        let lines = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        (summary, lines)
    }

    #[tokio::test]
    async fn replays_speculate_then_navigate() {
        let (summary, lines) = run(SCENARIO).await;
        let summary = summary.unwrap();
        assert_eq!(summary.steps, 6);
        assert_eq!(summary.clients, 1);
        assert_eq!(lines.len(), 6);

        assert_eq!(lines[3]["op"], "may_launch_url");
        assert_eq!(lines[3]["result"]["accepted"], true);
        assert_eq!(lines[4]["result"]["disposition"], "promoted");
        assert_eq!(lines[4]["result"]["classification"]["outcome"], "good_prediction");
        assert_eq!(lines[5]["result"]["sessions"], 1);
    }

    #[tokio::test]
    async fn unknown_client_fails_with_step_context() {
        let (summary, lines) = run(
            r#"{"steps": [{"op": "new_session", "client": "ghost", "token": "s1"}]}"#,
        )
        .await;
        let err = format!("{:#}", summary.unwrap_err());
        assert!(err.contains("step 1 (new_session)"), "{err}");
        assert!(err.contains("ghost"), "{err}");
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn relationship_events_are_drained() {
        let (summary, lines) = run(
            r#"{"steps": [
                {"op": "allow_asset_link", "package": "com.example.app", "origin": "https://app.example", "relation": "use_as_origin"},
                {"op": "bind", "client": "app", "uid": 10001, "package": "com.example.app"},
                {"op": "new_session", "client": "app", "token": "s1"},
                {"op": "validate_relationship", "client": "app", "token": "s1", "relation": "use_as_origin", "origin": "https://app.example"},
                {"op": "events", "client": "app"}
            ]}"#,
        )
        .await;
        summary.unwrap();
        let events = lines[4]["result"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "relationship_validated");
        assert_eq!(events[0]["verified"], true);
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(Scenario::from_json(r#"{"steps": [{"op": "teleport"}]}"#).is_err());
    }
}
