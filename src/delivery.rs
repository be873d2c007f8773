//! Delivery confirmation.
//!
//! No server acknowledgment is observable, so send success is inferred
//! from visual side effects only: the status-icon count rising above its
//! pre-send baseline, the composer emptying, or the sent text/filename
//! surfacing in the newest transcript region. Non-confirmation within the
//! timeout is an uncertain outcome, not a failure: false negatives are
//! common and a reflexive re-send risks duplicates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::composer::MessageComposer;
use crate::config::EngineConfig;
use crate::locator::Resolver;
use crate::page::UiElement;
use crate::retry::PollPolicy;
use crate::selector::Strategy;
use crate::session::Session;

/// The sole evidence of send success. `confirmed` is monotonic: once a
/// run has observed delivery, nothing resets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryState {
    baseline: usize,
    confirmed: bool,
}

impl DeliveryState {
    pub fn new(baseline: usize) -> Self {
        Self {
            baseline,
            confirmed: false,
        }
    }

    pub fn baseline(&self) -> usize {
        self.baseline
    }

    pub fn mark_confirmed(&mut self) {
        self.confirmed = true;
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }
}

pub struct DeliveryMonitor {
    config: Arc<EngineConfig>,
    resolver: Resolver,
    composer: MessageComposer,
}

impl DeliveryMonitor {
    pub fn new(session: &Session) -> Self {
        Self {
            config: session.config(),
            resolver: session.resolver(),
            composer: MessageComposer::new(session.resolver(), session.config()),
        }
    }

    /// Count every rendered delivery indicator across the configured
    /// selector set.
    pub async fn indicator_count(&self) -> usize {
        let mut total = 0;
        for selector in &self.config.hints.status_selectors {
            total += self
                .resolver
                .count(None, &Strategy::css(selector.clone()))
                .await;
        }
        total
    }

    async fn latest_message_region(&self) -> Option<UiElement> {
        for selector in [
            "[data-tid='messageBodyContent']",
            "[data-tid*='message']",
            "div[class*='message']",
        ] {
            let matches = self
                .resolver
                .matches(None, &Strategy::css(selector))
                .await;
            if let Some(last) = matches.into_iter().last() {
                return Some(last);
            }
        }
        None
    }

    /// Poll for the indicator count to rise above the baseline.
    pub async fn wait_indicator_increase(&self, state: &mut DeliveryState) -> bool {
        let policy = PollPolicy::new(self.config.delivery_wait, self.config.poll_interval * 2);
        let baseline = state.baseline();
        let observed = policy
            .run_until(|| async { self.indicator_count().await > baseline })
            .await;
        if observed {
            state.mark_confirmed();
        }
        observed
    }

    /// Poll for indirect post evidence: the composer emptying, or the sent
    /// text / attached filename appearing in the latest transcript region.
    pub async fn wait_message_posted(
        &self,
        state: &mut DeliveryState,
        text_hint: Option<&str>,
        file_hint: Option<&str>,
    ) -> bool {
        let policy = PollPolicy::new(self.config.delivery_wait, self.config.poll_interval * 3);
        let observed = policy
            .run_until(|| async { self.probe_posted(text_hint, file_hint).await })
            .await;
        if observed {
            state.mark_confirmed();
        }
        observed
    }

    async fn probe_posted(&self, text_hint: Option<&str>, file_hint: Option<&str>) -> bool {
        if self.composer.is_empty().await {
            debug!("composer empty, treating message as posted");
            return true;
        }
        let Some(region) = self.latest_message_region().await else {
            return false;
        };
        let Some(inner) = region.text().await else {
            return false;
        };
        if let Some(hint) = text_hint {
            let prefix: String = hint.chars().take(8).collect();
            if (!prefix.is_empty() && inner.contains(&prefix)) || inner.contains(hint.trim()) {
                return true;
            }
        }
        if let Some(hint) = file_hint {
            let prefix: String = hint.chars().take(6).collect();
            if !prefix.is_empty() && inner.contains(&prefix) {
                return true;
            }
        }
        false
    }
}
