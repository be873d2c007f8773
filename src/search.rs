//! Chat discovery through global search.
//!
//! Pressing Enter in the search box navigates to a full results page and
//! loses the composer, so an existing chat is always opened by clicking a
//! suggestion. The suggestion panel mixes genuine chats with decoys
//! ("press Enter for all results" rows, invite prompts); a genuine entry is
//! recognized by carrying the target name and an avatar-like marker.

use std::sync::Arc;
use std::time::Duration;

use regex::RegexBuilder;
use tokio::time::sleep;
use tracing::{debug, instrument};

use crate::composer::MessageComposer;
use crate::config::EngineConfig;
use crate::errors::AutomationError;
use crate::locator::Resolver;
use crate::page::{PageEngine, UiElement};
use crate::retry::{PollPolicy, TwoPhaseWait};
use crate::selector::{LocatorSpec, Strategy};
use crate::session::Session;

pub fn search_box_spec() -> LocatorSpec {
    vec![
        Strategy::role("textbox", "検索|Search"),
        Strategy::css("input[type='search']"),
        Strategy::css("input[placeholder*='検索'], input[placeholder*='Search']"),
        Strategy::css(
            "input[role='combobox'][type='search'], div[role='combobox'] input[type='search']",
        ),
        Strategy::css("input[aria-label*='検索'], input[aria-label*='Search']"),
    ]
}

pub struct ChatDiscovery {
    engine: Arc<dyn PageEngine>,
    config: Arc<EngineConfig>,
    resolver: Resolver,
    composer: MessageComposer,
}

impl ChatDiscovery {
    pub fn new(session: &Session) -> Self {
        Self {
            engine: session.engine(),
            config: session.config(),
            resolver: session.resolver(),
            composer: MessageComposer::new(session.resolver(), session.config()),
        }
    }

    /// Open an existing chat by display name via search suggestions.
    #[instrument(level = "debug", skip(self))]
    pub async fn open_existing_chat(&self, name: &str) -> Result<(), AutomationError> {
        let search_box = self
            .find_search_box()
            .await
            .ok_or_else(|| AutomationError::ElementNotFound("global search box".into()))?;

        search_box.click().await?;
        let _ = search_box.clear().await;
        search_box.type_text(name, self.config.type_delay).await?;

        if !self.wait_suggestion_and_click(name).await {
            return Err(AutomationError::ElementNotFound(format!(
                "no genuine search suggestion for '{name}'"
            )));
        }

        // The click may silently fail to navigate; only a visible composer
        // counts as an opened chat.
        self.composer.wait_visible(20).await.map_err(|_| {
            AutomationError::ElementNotFound(format!(
                "composer never appeared after opening '{name}'"
            ))
        })?;
        debug!(name, "existing chat opened");
        Ok(())
    }

    /// The search affordance is inconsistently discoverable, so three
    /// redundant strategies are tried, each followed by re-detection:
    /// the keyboard shortcut, a top-bar coordinate click, and the `/` key.
    async fn find_search_box(&self) -> Option<UiElement> {
        let quick = PollPolicy::new(Duration::from_millis(800), self.config.poll_interval);
        for _ in 0..3 {
            let _ = self.engine.press_key("Control+e").await;
            sleep(Duration::from_millis(200)).await;
            if let Some(found) = self.resolver.resolve_with(&search_box_spec(), quick).await {
                debug!("search box found after shortcut");
                return Some(found);
            }
        }

        let _ = self.engine.click_at(400.0, 60.0).await;
        sleep(Duration::from_millis(150)).await;
        if let Some(found) = self.resolver.resolve_with(&search_box_spec(), quick).await {
            debug!("search box found after top-bar click");
            return Some(found);
        }

        let _ = self.engine.press_key("/").await;
        sleep(Duration::from_millis(120)).await;
        if let Some(found) = self.resolver.resolve_with(&search_box_spec(), quick).await {
            debug!("search box found after '/' key");
            return Some(found);
        }
        debug!("search box not found");
        None
    }

    fn is_decoy(&self, text: &str) -> bool {
        let flat = text.replace('\n', " ");
        self.config.hints.decoy_patterns.iter().any(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map(|re| re.is_match(&flat))
                .unwrap_or(false)
        })
    }

    async fn wait_suggestion_and_click(&self, name: &str) -> bool {
        let wait = TwoPhaseWait::new(
            self.config.search_settle_wait,
            self.config.search_suggestion_wait,
            self.config.poll_interval * 2,
        );
        wait.run(|| async { self.try_click_suggestion(name).await })
            .await
            .is_some()
    }

    async fn try_click_suggestion(&self, name: &str) -> Option<()> {
        let panel = self
            .resolver
            .first_visible(
                None,
                &Strategy::css("[role='listbox'], [data-tid*='search-suggestions']"),
            )
            .await?;
        let items = self
            .resolver
            .matches(
                Some(&panel),
                &Strategy::css("[role='option'], li, div[role='menuitem']"),
            )
            .await;

        let mut best: Option<&UiElement> = None;
        let mut first_clean: Option<&UiElement> = None;
        for item in &items {
            if !item.is_visible().await {
                continue;
            }
            let text = item.text().await.unwrap_or_default();
            if self.is_decoy(&text) {
                continue;
            }
            // Entries carrying a search icon are command rows, not chats.
            let search_icon = Strategy::css(
                "[data-icon-name*='Search'], svg[aria-label*='検索']",
            );
            if self.resolver.count(Some(item), &search_icon).await > 0 {
                continue;
            }
            if first_clean.is_none() {
                first_clean = Some(item);
            }
            let avatar = Strategy::css("[data-tid*='avatar'], img, [class*='avatar']");
            let has_avatar = self.resolver.count(Some(item), &avatar).await > 0;
            if text.contains(name) && has_avatar {
                best = Some(item);
                break;
            }
        }

        let target = best.or(first_clean)?;
        let _ = target.scroll_into_view().await;
        let _ = target.hover().await;
        if target.click().await.is_ok() || target.click_center().await {
            return Some(());
        }
        target.force_click().await.ok().map(|_| ())
    }
}
