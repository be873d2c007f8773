//! Send orchestration.
//!
//! Sending is owned here and nowhere else. The send control is clicked
//! with keyboard fallbacks, then the delivery monitor looks for evidence;
//! the click-and-confirm cycle repeats a bounded number of times before
//! the outcome is reported as uncertain. Uncertain is deliberately not an
//! error: a blind retry at a higher level would risk duplicate messages.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::delivery::{DeliveryMonitor, DeliveryState};
use crate::locator::Resolver;
use crate::page::PageEngine;
use crate::selector::{LocatorSpec, Strategy};
use crate::session::Session;

pub fn send_button_spec() -> LocatorSpec {
    vec![
        Strategy::role("button", "送信|Send"),
        Strategy::css("[data-tid='send-message-button'], [data-tid='send-button']"),
        Strategy::css("button[aria-label*='送信'], button[aria-label*='Send']"),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed,
    Uncertain,
}

/// Whether the send control is currently enabled. A missing button counts
/// as disabled.
pub async fn send_control_enabled(resolver: &Resolver) -> bool {
    let Some(button) = resolver.resolve(&send_button_spec()).await else {
        return false;
    };
    let disabled = match button.attribute("disabled").await {
        Some(v) => v == "true" || v == "disabled" || v.is_empty(),
        None => false,
    };
    let aria_disabled = button
        .attribute("aria-disabled")
        .await
        .map(|v| v == "true" || v == "disabled")
        .unwrap_or(false);
    !(disabled || aria_disabled)
}

pub struct SendOrchestrator {
    engine: Arc<dyn PageEngine>,
    config: Arc<EngineConfig>,
    resolver: Resolver,
    monitor: DeliveryMonitor,
}

impl SendOrchestrator {
    pub fn new(session: &Session) -> Self {
        Self {
            engine: session.engine(),
            config: session.config(),
            resolver: session.resolver(),
            monitor: DeliveryMonitor::new(session),
        }
    }

    /// Used by the attachment controller as one of its three readiness
    /// signals.
    pub async fn is_send_enabled(&self) -> bool {
        send_control_enabled(&self.resolver).await
    }

    async fn click_send(&self) -> bool {
        let Some(button) = self.resolver.resolve(&send_button_spec()).await else {
            return false;
        };
        if button.click().await.is_ok() {
            return true;
        }
        button.force_click().await.is_ok()
    }

    /// Click send (with keyboard fallbacks) and poll for confirmation,
    /// repeating up to the configured retry budget.
    #[instrument(level = "debug", skip(self, text_hint, file_hint))]
    pub async fn send_and_confirm(
        &self,
        text_hint: Option<&str>,
        file_hint: Option<&str>,
    ) -> SendOutcome {
        let mut state = DeliveryState::new(self.monitor.indicator_count().await);

        for attempt in 0..=self.config.send_retries {
            if !self.click_send().await {
                debug!(attempt, "send control not clickable, keyboard fallback");
                let _ = self.engine.press_key("Control+Enter").await;
                sleep(Duration::from_millis(150)).await;
                let _ = self.engine.press_key("Enter").await;
            }
            if self.monitor.wait_indicator_increase(&mut state).await {
                debug!(attempt, "delivery indicator increased");
                return SendOutcome::Confirmed;
            }
            if self
                .monitor
                .wait_message_posted(&mut state, text_hint, file_hint)
                .await
            {
                debug!(attempt, "message observed in transcript");
                return SendOutcome::Confirmed;
            }
            sleep(Duration::from_millis(300)).await;
        }

        warn!("send attempted but never confirmed");
        SendOutcome::Uncertain
    }
}
