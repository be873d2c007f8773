//! Ordered-fallback element resolution.
//!
//! [`Resolver`] probes each strategy of a [`LocatorSpec`] with a short
//! bounded wait; the first strategy producing a visible element wins.
//! Exhaustion yields `None`; callers decide whether that is fatal.

use std::sync::Arc;

use regex::RegexBuilder;
use tracing::{debug, instrument};

use crate::errors::AutomationError;
use crate::page::{ElementHandle, PageEngine, Query, UiElement};
use crate::retry::PollPolicy;
use crate::selector::Strategy;

#[derive(Clone)]
pub struct Resolver {
    engine: Arc<dyn PageEngine>,
    probe: PollPolicy,
}

impl Resolver {
    pub fn new(engine: Arc<dyn PageEngine>, probe: PollPolicy) -> Self {
        Self { engine, probe }
    }

    /// Probe the strategies in order; first visible match wins regardless
    /// of later strategies also matching.
    #[instrument(level = "debug", skip(self, spec))]
    pub async fn resolve(&self, spec: &[Strategy]) -> Option<UiElement> {
        self.resolve_with(spec, self.probe).await
    }

    /// Like [`resolve`](Self::resolve) with a caller-supplied probe budget.
    pub async fn resolve_with(&self, spec: &[Strategy], probe: PollPolicy) -> Option<UiElement> {
        for strategy in spec {
            let found = probe
                .run(|| async { self.first_visible(None, strategy).await })
                .await;
            if let Some(el) = found {
                debug!(%strategy, "strategy resolved");
                return Some(el);
            }
        }
        None
    }

    /// Resolve or promote exhaustion to [`AutomationError::ElementNotFound`].
    pub async fn resolve_required(
        &self,
        what: &str,
        spec: &[Strategy],
    ) -> Result<UiElement, AutomationError> {
        self.resolve(spec)
            .await
            .ok_or_else(|| AutomationError::ElementNotFound(what.to_string()))
    }

    /// All current matches for one strategy, without waiting and without a
    /// visibility filter.
    pub async fn matches(&self, scope: Option<&UiElement>, strategy: &Strategy) -> Vec<UiElement> {
        let handles = self.raw_matches(scope, strategy).await;
        handles
            .into_iter()
            .map(|h| UiElement::new(self.engine.clone(), h))
            .collect()
    }

    /// All currently visible matches for one strategy, without waiting.
    pub async fn visible_matches(
        &self,
        scope: Option<&UiElement>,
        strategy: &Strategy,
    ) -> Vec<UiElement> {
        let mut out = Vec::new();
        for el in self.matches(scope, strategy).await {
            if el.is_visible().await {
                out.push(el);
            }
        }
        out
    }

    /// First currently visible match, without waiting.
    pub async fn first_visible(
        &self,
        scope: Option<&UiElement>,
        strategy: &Strategy,
    ) -> Option<UiElement> {
        for el in self.matches(scope, strategy).await {
            if el.is_visible().await {
                return Some(el);
            }
        }
        None
    }

    /// Current match count for a strategy. Probe semantics: faults count
    /// as zero.
    pub async fn count(&self, scope: Option<&UiElement>, strategy: &Strategy) -> usize {
        self.raw_matches(scope, strategy).await.len()
    }

    async fn raw_matches(
        &self,
        scope: Option<&UiElement>,
        strategy: &Strategy,
    ) -> Vec<ElementHandle> {
        let scope_handle = scope.map(|s| s.handle());
        let query = match strategy {
            Strategy::Text(needle) => Query::Text(needle.clone()),
            other => match other.structural_css() {
                Some(css) => Query::Css(css),
                None => return Vec::new(),
            },
        };
        let handles = self
            .engine
            .find_all(scope_handle.as_ref(), &query)
            .await
            .unwrap_or_default();

        match strategy {
            Strategy::Role { name, .. } if !name.is_empty() => {
                let mut out = Vec::new();
                for h in handles {
                    let el = UiElement::new(self.engine.clone(), h);
                    if name_matches(name, &accessible_name(&el).await) {
                        out.push(h);
                    }
                }
                out
            }
            _ => handles,
        }
    }
}

/// Approximate the accessible name the way the target app exposes it:
/// aria-label, then title, then placeholder, then rendered text.
async fn accessible_name(el: &UiElement) -> String {
    if let Some(label) = el.attribute("aria-label").await {
        if !label.is_empty() {
            return label;
        }
    }
    if let Some(title) = el.attribute("title").await {
        if !title.is_empty() {
            return title;
        }
    }
    if let Some(ph) = el.attribute("placeholder").await {
        if !ph.is_empty() {
            return ph;
        }
    }
    el.text().await.unwrap_or_default()
}

/// Case-insensitive regex match, degrading to a substring check when the
/// pattern fails to compile.
fn name_matches(pattern: &str, name: &str) -> bool {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(name),
        Err(_) => name.to_lowercase().contains(&pattern.to_lowercase()),
    }
}
