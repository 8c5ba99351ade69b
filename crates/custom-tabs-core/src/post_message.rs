//! Per-session postMessage channel.
//!
//! ```text
//! NoChannel ──request──▶ PendingVerification ──verified──▶ Active
//!                               ▲                             │
//!                               └──────request──── Invalidated ◀┘ target gone / navigated / null origin
//! ```
//!
//! The channel only carries messages once the client has proven control of
//! its source origin and a page target is bound. Verification itself is
//! asynchronous; each request bumps a generation counter so a verification
//! that completes after the channel was re-requested is discarded.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::host::RenderTargetId;
use crate::url_policy::Origin;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    NoChannel,
    PendingVerification,
    Active,
    Invalidated,
}

/// Result of [`crate::connection::ClientBinding::post_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostMessageStatus {
    Success,
    FailureNoChannel,
    FailureMessagingError,
    FailureDisallowed,
}

/// What the caller must do after [`MessageChannel::request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Generation a later verification result must carry.
    pub generation: u64,
    /// Origin to verify for this round, if one is known.
    pub verify: Option<Origin>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageChannel {
    state: ChannelState,
    origin: Option<Origin>,
    requested_origin: Option<Origin>,
    target: Option<RenderTargetId>,
    generation: u64,
    ready_notified: bool,
}

impl MessageChannel {
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The verified origin. `None` unless the channel is Active.
    #[must_use]
    pub fn origin(&self) -> Option<&Origin> {
        match self.state {
            ChannelState::Active => self.origin.as_ref(),
            _ => None,
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<RenderTargetId> {
        self.target
    }

    /// Open (or reopen) the channel.
    ///
    /// An explicit origin is always verified. Without one, reopening a
    /// channel re-verifies the origin remembered from an earlier round; a
    /// channel that never had an origin stays pending until the client
    /// supplies one through an origin verification call.
    pub fn request(&mut self, requested_origin: Option<Origin>) -> ChannelRequest {
        let reopened = match self.state {
            ChannelState::NoChannel | ChannelState::Invalidated => {
                self.state = ChannelState::PendingVerification;
                self.origin = None;
                self.ready_notified = false;
                self.generation += 1;
                true
            }
            ChannelState::PendingVerification | ChannelState::Active => false,
        };
        let verify = match requested_origin {
            Some(origin) => {
                self.requested_origin = Some(origin.clone());
                Some(origin)
            }
            None if reopened => self.requested_origin.clone(),
            None => None,
        };
        ChannelRequest {
            generation: self.generation,
            verify,
        }
    }

    /// Start a fresh verification round for `origin`, whatever the current
    /// state. Returns the round's generation.
    pub fn begin_verification(&mut self, origin: Origin) -> u64 {
        self.state = ChannelState::PendingVerification;
        self.origin = None;
        self.requested_origin = Some(origin);
        self.ready_notified = false;
        self.generation += 1;
        self.generation
    }

    /// Apply an asynchronous verification result. Stale rounds are ignored.
    pub fn apply_verification(&mut self, generation: u64, origin: Origin, verified: bool) -> bool {
        if generation != self.generation || self.state != ChannelState::PendingVerification {
            debug!(generation, current = self.generation, "Discarding stale verification");
            return false;
        }
        if verified && origin.is_https() {
            self.state = ChannelState::Active;
            self.origin = Some(origin);
            true
        } else {
            false
        }
    }

    /// Set the origin without verification. `None` invalidates the channel.
    pub fn initialize_unchecked(&mut self, origin: Option<Origin>) {
        self.generation += 1;
        self.ready_notified = false;
        match origin {
            Some(origin) => {
                self.state = ChannelState::Active;
                self.requested_origin = Some(origin.clone());
                self.origin = Some(origin);
            }
            None => self.invalidate(),
        }
    }

    /// Attach the page the channel talks to.
    pub fn bind_target(&mut self, target: RenderTargetId) {
        self.target = Some(target);
    }

    /// The bound page went away (renderer death or document change).
    pub fn on_target_lost(&mut self, target: RenderTargetId) -> bool {
        if self.target != Some(target) {
            return false;
        }
        self.target = None;
        if self.state == ChannelState::Active {
            self.invalidate();
        }
        true
    }

    fn invalidate(&mut self) {
        self.state = ChannelState::Invalidated;
        self.origin = None;
        self.ready_notified = false;
    }

    /// Where an outgoing message would go, or why it cannot be sent.
    pub fn route(&self) -> Result<(RenderTargetId, &Origin), PostMessageStatus> {
        match self.state {
            ChannelState::NoChannel => Err(PostMessageStatus::FailureNoChannel),
            ChannelState::PendingVerification => Err(PostMessageStatus::FailureDisallowed),
            ChannelState::Invalidated => Err(PostMessageStatus::FailureMessagingError),
            ChannelState::Active => match (self.target, self.origin.as_ref()) {
                (Some(target), Some(origin)) => Ok((target, origin)),
                (None, Some(_)) => Err(PostMessageStatus::FailureMessagingError),
                (_, None) => Err(PostMessageStatus::FailureDisallowed),
            },
        }
    }

    /// True exactly once after the channel becomes usable.
    pub(crate) fn take_ready_notification(&mut self) -> bool {
        if self.route().is_ok() && !self.ready_notified {
            self.ready_notified = true;
            true
        } else {
            false
        }
    }
}
