//! Recipient picker control.
//!
//! A recipient only counts once a visual token (chip) represents it; a
//! keypress is never trusted. The picker field re-renders while suggestions
//! load, so the field is re-resolved on every focus attempt and all reads
//! are single-shot probes inside bounded loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::errors::AutomationError;
use crate::locator::Resolver;
use crate::page::{PageEngine, UiElement};
use crate::retry::{PollPolicy, TwoPhaseWait};
use crate::selector::{LocatorSpec, Strategy};
use crate::session::Session;

pub fn to_field_spec() -> LocatorSpec {
    vec![
        Strategy::role("combobox", "宛先|To"),
        Strategy::role("textbox", "宛先|To|検索|Search"),
        Strategy::css("input[placeholder*='宛先'], input[placeholder*='To']"),
        Strategy::css("input[aria-label*='宛先'], input[aria-label*='To']"),
        Strategy::css(
            "div[role='combobox'][aria-label*='宛先'], div[role='combobox'][aria-label*='To']",
        ),
        Strategy::css(
            "div[contenteditable='true'][aria-label*='宛先'], div[contenteditable='true'][aria-label*='To']",
        ),
        Strategy::css("input[placeholder*='名前'], input[placeholder*='Name']"),
        Strategy::css("[data-tid='people-picker-input'], [data-tid='newChat-peoplePicker']"),
        Strategy::css("div[role='combobox']"),
    ]
}

/// Chip selectors, most specific first; the first one with any match is
/// trusted for the count.
fn chip_strategies() -> Vec<Strategy> {
    vec![
        Strategy::css("[data-tid='people-picker-selected']"),
        Strategy::css("[data-tid='people-picker-selectedItem']"),
        Strategy::css(".people-picker .pill"),
        Strategy::css("[aria-label*='削除'] span.pill, [aria-label*='Remove'] span.pill"),
    ]
}

pub struct RecipientPicker {
    engine: Arc<dyn PageEngine>,
    config: Arc<EngineConfig>,
    resolver: Resolver,
}

impl RecipientPicker {
    pub fn new(session: &Session) -> Self {
        Self {
            engine: session.engine(),
            config: session.config(),
            resolver: session.resolver(),
        }
    }

    pub async fn find_field(&self) -> Option<UiElement> {
        self.resolver.resolve(&to_field_spec()).await
    }

    /// Wait for the picker field to appear after opening a new chat.
    pub async fn wait_field(&self, attempts: u32) -> Result<UiElement, AutomationError> {
        PollPolicy::attempts(attempts, self.config.poll_interval * 2)
            .run(|| async { self.find_field().await })
            .await
            .ok_or_else(|| AutomationError::ElementNotFound("recipient picker field".into()))
    }

    /// Number of confirmed-recipient chips currently rendered.
    pub async fn chip_count(&self) -> usize {
        for strategy in chip_strategies() {
            let n = self.resolver.count(None, &strategy).await;
            if n > 0 {
                return n;
            }
        }
        0
    }

    /// Whether a chip already represents this address. A confirmed address
    /// is never resubmitted.
    pub async fn chip_exists(&self, address: &str) -> bool {
        let needle = address.to_lowercase();
        for strategy in chip_strategies().into_iter().take(3) {
            for chip in self.resolver.matches(None, &strategy).await {
                if let Some(text) = chip.text().await {
                    if text.to_lowercase().contains(&needle) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Add one address and wait for its chip.
    ///
    /// Confirmation evidence is a chip-count increase or a chip carrying
    /// the address text; an invite/confirm prompt for external addresses
    /// is accepted opportunistically along the way. `AdditionFailed` is
    /// declared only after every fallback is exhausted.
    #[instrument(level = "debug", skip(self, field))]
    pub async fn add_recipient(
        &self,
        field: &UiElement,
        address: &str,
    ) -> Result<(), AutomationError> {
        if address.is_empty() {
            return Ok(());
        }
        if self.chip_exists(address).await {
            debug!(address, "chip already present, skipping");
            return Ok(());
        }

        let before = self.chip_count().await;
        let field = self
            .refocus(Some(field.clone()))
            .await
            .ok_or_else(|| AutomationError::ElementNotFound("recipient picker field".into()))?;
        self.light_clear().await;
        field
            .type_text(address, self.config.picker_type_delay)
            .await?;

        if !self.wait_for_suggestions().await {
            debug!(address, "no suggestion panel observed within budget");
        }
        let clicked = self.click_matching_option(address).await;

        if self.wait_confirmed(before, address).await {
            return Ok(());
        }

        if !clicked {
            // Last resort: the first visible suggestion by coordinates.
            if let Some(listbox) = self.latest_listbox().await {
                if let Some(option) = self
                    .resolver
                    .first_visible(Some(&listbox), &Strategy::css("[role='option']"))
                    .await
                {
                    let _ = option.scroll_into_view().await;
                    let _ = option.hover().await;
                    if !option.click_center().await {
                        let _ = option.force_click().await;
                    }
                }
            }
            if self.wait_confirmed(before, address).await {
                return Ok(());
            }
        }

        warn!(address, "recipient never confirmed");
        Err(AutomationError::AdditionFailed(address.to_string()))
    }

    async fn wait_confirmed(&self, before: usize, address: &str) -> bool {
        PollPolicy::attempts(10, self.config.poll_interval * 2)
            .run_until(|| async {
                self.accept_invite_prompt().await;
                self.chip_count().await > before || self.chip_exists(address).await
            })
            .await
    }

    /// Accept any invite/confirm prompt shown for an external address.
    async fn accept_invite_prompt(&self) {
        let prompt = Strategy::role("button", "招待|Invite|参加|Join");
        if let Some(btn) = self.resolver.first_visible(None, &prompt).await {
            if btn.click().await.is_ok() {
                debug!("accepted invite prompt");
                sleep(Duration::from_millis(300)).await;
            }
        }
    }

    /// Focus the field, re-resolving if the handle went stale. Falls back
    /// to clicking the picker container and tabbing into it.
    pub async fn refocus(&self, field: Option<UiElement>) -> Option<UiElement> {
        if let Some(field) = field {
            if field.click().await.is_ok() {
                return Some(field);
            }
        }
        let container = Strategy::css(
            "[data-tid='people-picker'], [data-tid='newChat-peoplePicker'], div[role='combobox']",
        );
        if let Some(container) = self.resolver.first_visible(None, &container).await {
            let _ = container.click().await;
            let _ = self.engine.press_key("Tab").await;
            sleep(Duration::from_millis(100)).await;
        }
        self.find_field().await
    }

    /// Clear stray characters without disturbing existing chips.
    async fn light_clear(&self) {
        let _ = self.engine.press_key(" ").await;
        sleep(Duration::from_millis(20)).await;
        let _ = self.engine.press_key("Backspace").await;
    }

    /// Two-phase wait for the suggestion panel: an unconditional settle
    /// delay, then bounded polling for a visible option.
    async fn wait_for_suggestions(&self) -> bool {
        let wait = TwoPhaseWait::new(
            self.config.suggestion_min_wait,
            self.config.suggestion_max_wait,
            self.config.poll_interval,
        );
        wait.run(|| async {
            let listbox = self.latest_listbox().await?;
            self.resolver
                .first_visible(Some(&listbox), &Strategy::css("[role='option']"))
                .await
                .map(|_| ())
        })
        .await
        .is_some()
    }

    /// The most recently rendered listbox; suggestion panels stack while
    /// the debounce re-renders, and only the newest reflects the typed
    /// text.
    async fn latest_listbox(&self) -> Option<UiElement> {
        let mut boxes = self
            .resolver
            .matches(None, &Strategy::css("[role='listbox']"))
            .await;
        if boxes.is_empty() {
            boxes = self
                .resolver
                .matches(
                    None,
                    &Strategy::css(
                        "[data-tid*='people-picker'] [role='listbox'], [id*='Dropdown'] [role='listbox']",
                    ),
                )
                .await;
        }
        for lb in boxes.iter().rev() {
            if lb.is_visible().await {
                return Some(lb.clone());
            }
        }
        boxes.last().cloned()
    }

    /// Click the option whose text best matches the address, or the first
    /// visible option when none does. The generic single-option invite
    /// row shown for unregistered addresses carries no address text.
    async fn click_matching_option(&self, address: &str) -> bool {
        let Some(listbox) = self.latest_listbox().await else {
            return false;
        };
        let options = self
            .resolver
            .matches(Some(&listbox), &Strategy::css("[role='option']"))
            .await;
        if options.is_empty() {
            return false;
        }

        let needle = address.to_lowercase();
        let mut target: Option<&UiElement> = None;
        for option in &options {
            if !option.is_visible().await {
                continue;
            }
            let text = option.text().await.unwrap_or_default().to_lowercase();
            if text.contains(&needle) {
                target = Some(option);
                break;
            }
        }
        if target.is_none() {
            for option in &options {
                if option.is_visible().await {
                    target = Some(option);
                    break;
                }
            }
        }
        let option = target.unwrap_or(&options[0]);
        option.click_resilient().await
    }
}
