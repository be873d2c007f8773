//! The page engine seam.
//!
//! Everything the controllers do to the browser goes through [`PageEngine`],
//! a small trait modeled on accessibility-automation SDKs: structural
//! queries, probes, and input primitives. Production uses the CDP backend
//! behind the `cdp` feature; tests drive the same controllers against a
//! scripted in-memory engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::AutomationError;

/// Opaque reference to an element held by the engine. Handles can go stale
/// when the page re-renders; every read through [`UiElement`] tolerates
/// that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub u64);

/// The wire language between the resolver and an engine. Role semantics are
/// lowered to these two forms before reaching a backend, so backends stay
/// identical for CDP and for test fakes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    /// A CSS selector, possibly a comma list.
    Css(String),
    /// Case-insensitive text content search.
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Coarse position key used to drop near-duplicate candidates.
    pub fn position_key(&self) -> (i64, i64) {
        (self.x.round() as i64, self.y.round() as i64)
    }
}

/// The common trait all page backends implement
#[async_trait::async_trait]
pub trait PageEngine: Send + Sync {
    /// Navigate the page to a URL.
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), AutomationError>;

    /// Wait for the page to approximate network-idle readiness.
    async fn wait_until_settled(&self, timeout: Duration) -> Result<(), AutomationError>;

    /// Enumerate elements matching a query, optionally scoped to a subtree.
    /// A miss is an empty vector, not an error.
    async fn find_all(
        &self,
        scope: Option<&ElementHandle>,
        query: &Query,
    ) -> Result<Vec<ElementHandle>, AutomationError>;

    async fn parent(&self, el: &ElementHandle) -> Result<Option<ElementHandle>, AutomationError>;

    async fn tag_name(&self, el: &ElementHandle) -> Result<String, AutomationError>;

    async fn is_visible(&self, el: &ElementHandle) -> Result<bool, AutomationError>;

    async fn text(&self, el: &ElementHandle) -> Result<String, AutomationError>;

    async fn html(&self, el: &ElementHandle) -> Result<String, AutomationError>;

    async fn attribute(
        &self,
        el: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, AutomationError>;

    async fn bounding_box(&self, el: &ElementHandle)
        -> Result<Option<Rect>, AutomationError>;

    async fn click(&self, el: &ElementHandle) -> Result<(), AutomationError>;

    /// Click without hit-testing, for elements covered by overlays.
    async fn force_click(&self, el: &ElementHandle) -> Result<(), AutomationError>;

    async fn click_at(&self, x: f64, y: f64) -> Result<(), AutomationError>;

    async fn hover(&self, el: &ElementHandle) -> Result<(), AutomationError>;

    async fn focus(&self, el: &ElementHandle) -> Result<(), AutomationError>;

    async fn scroll_into_view(&self, el: &ElementHandle) -> Result<(), AutomationError>;

    /// Type text character-by-character into an element. Paste-style input
    /// skips the suggestion debounce in the target app, hence the per-char
    /// delay.
    async fn type_text(
        &self,
        el: &ElementHandle,
        text: &str,
        per_char_delay: Duration,
    ) -> Result<(), AutomationError>;

    /// Press a key chord (e.g. `Enter`, `Shift+Enter`, `Control+e`, `/`)
    /// against the focused element.
    async fn press_key(&self, key: &str) -> Result<(), AutomationError>;

    async fn clear_text(&self, el: &ElementHandle) -> Result<(), AutomationError>;

    /// Inject files into a file input element.
    async fn set_input_files(
        &self,
        el: &ElementHandle,
        paths: &[PathBuf],
    ) -> Result<(), AutomationError>;

    /// Start intercepting the next OS-level file chooser.
    async fn arm_file_chooser(&self) -> Result<(), AutomationError>;

    /// Wait for an intercepted chooser to appear.
    async fn wait_file_chooser(&self, timeout: Duration) -> Result<bool, AutomationError>;

    /// Inject a path into the intercepted chooser.
    async fn fulfill_file_chooser(&self, path: &Path) -> Result<(), AutomationError>;

    /// Tear the page and its browsing context down.
    async fn close(&self) -> Result<(), AutomationError>;
}

/// A live element bound to its engine.
///
/// Reads are probes: they swallow backend faults (stale handles, mid-render
/// races) into neutral values, because every caller sits inside a bounded
/// retry loop that re-resolves on failure. Actions return `Result` so the
/// loop can count the failure against its budget.
#[derive(Clone)]
pub struct UiElement {
    engine: Arc<dyn PageEngine>,
    handle: ElementHandle,
}

impl std::fmt::Debug for UiElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UiElement")
            .field("handle", &self.handle)
            .finish()
    }
}

impl UiElement {
    pub(crate) fn new(engine: Arc<dyn PageEngine>, handle: ElementHandle) -> Self {
        Self { engine, handle }
    }

    pub fn handle(&self) -> ElementHandle {
        self.handle
    }

    pub(crate) fn engine(&self) -> &Arc<dyn PageEngine> {
        &self.engine
    }

    pub async fn is_visible(&self) -> bool {
        self.engine.is_visible(&self.handle).await.unwrap_or(false)
    }

    pub async fn text(&self) -> Option<String> {
        self.engine.text(&self.handle).await.ok()
    }

    pub async fn html(&self) -> Option<String> {
        self.engine.html(&self.handle).await.ok()
    }

    pub async fn attribute(&self, name: &str) -> Option<String> {
        self.engine
            .attribute(&self.handle, name)
            .await
            .ok()
            .flatten()
    }

    pub async fn tag_name(&self) -> Option<String> {
        self.engine.tag_name(&self.handle).await.ok()
    }

    pub async fn parent(&self) -> Option<UiElement> {
        let handle = self.engine.parent(&self.handle).await.ok().flatten()?;
        Some(UiElement::new(self.engine.clone(), handle))
    }

    pub async fn bounding_box(&self) -> Option<Rect> {
        self.engine
            .bounding_box(&self.handle)
            .await
            .ok()
            .flatten()
    }

    pub async fn click(&self) -> Result<(), AutomationError> {
        self.engine.click(&self.handle).await
    }

    pub async fn force_click(&self) -> Result<(), AutomationError> {
        self.engine.force_click(&self.handle).await
    }

    pub async fn hover(&self) -> Result<(), AutomationError> {
        self.engine.hover(&self.handle).await
    }

    pub async fn focus(&self) -> Result<(), AutomationError> {
        self.engine.focus(&self.handle).await
    }

    pub async fn scroll_into_view(&self) -> Result<(), AutomationError> {
        self.engine.scroll_into_view(&self.handle).await
    }

    pub async fn type_text(
        &self,
        text: &str,
        per_char_delay: Duration,
    ) -> Result<(), AutomationError> {
        self.engine
            .type_text(&self.handle, text, per_char_delay)
            .await
    }

    pub async fn clear(&self) -> Result<(), AutomationError> {
        self.engine.clear_text(&self.handle).await
    }

    pub async fn set_input_files(&self, paths: &[PathBuf]) -> Result<(), AutomationError> {
        self.engine.set_input_files(&self.handle, paths).await
    }

    /// Click the element's center by screen coordinates. Last-resort path
    /// for elements whose normal click is swallowed by the app.
    pub async fn click_center(&self) -> bool {
        let Some(rect) = self.bounding_box().await else {
            return false;
        };
        let (x, y) = rect.center();
        self.engine.click_at(x, y).await.is_ok()
    }

    /// The escalating click used on flaky controls: scroll, hover, focus,
    /// normal click, forced click, then coordinate click.
    pub async fn click_resilient(&self) -> bool {
        let _ = self.scroll_into_view().await;
        let _ = self.hover().await;
        let _ = self.focus().await;
        if self.click().await.is_ok() {
            return true;
        }
        if self.force_click().await.is_ok() {
            debug!(handle = ?self.handle, "click fell back to forced dispatch");
            return true;
        }
        let hit = self.click_center().await;
        if hit {
            debug!(handle = ?self.handle, "click fell back to coordinates");
        }
        hit
    }
}
