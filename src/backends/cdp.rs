//! Chrome DevTools Protocol backend.
//!
//! Drives a real Chromium-family browser over CDP via `chromiumoxide`. The
//! profile directory is persistent so interactive sign-in survives between
//! runs. Element handles map to live `chromiumoxide` elements through an
//! internal registry; a handle outliving its DOM node surfaces as a driver
//! error, which the probe layer above converts into a retry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::dom::BackendNodeId;
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventFileChooserOpened, SetInterceptFileChooserDialogParams,
};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{BrowserChannel, EngineConfig};
use crate::errors::AutomationError;
use crate::page::{ElementHandle, PageEngine, Query, Rect};
use crate::retry::PollPolicy;

const VISIBLE_JS: &str = r#"function() {
    const r = this.getBoundingClientRect();
    const s = window.getComputedStyle(this);
    return r.width > 0 && r.height > 0
        && s.visibility !== 'hidden' && s.display !== 'none';
}"#;

pub struct CdpEngine {
    browser: AsyncMutex<Browser>,
    page: Page,
    elements: Mutex<HashMap<u64, Arc<Element>>>,
    next_id: AtomicU64,
    /// Set by the chooser listener task once an intercepted dialog opens.
    chooser_node: Arc<Mutex<Option<Option<BackendNodeId>>>>,
    _handler_task: JoinHandle<()>,
}

impl CdpEngine {
    /// Launch a persistent-profile browser and open the automation page.
    pub async fn launch(
        config: &EngineConfig,
    ) -> Result<Arc<dyn PageEngine>, AutomationError> {
        let mut builder = BrowserConfig::builder()
            .user_data_dir(&config.profile_dir)
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        if !config.headless {
            builder = builder.with_head();
        }
        // Edge and Chrome are found by their conventional binary names; the
        // Chromium channel lets chromiumoxide auto-detect.
        builder = match config.channel {
            BrowserChannel::Msedge => builder.chrome_executable("microsoft-edge"),
            BrowserChannel::Chrome => builder.chrome_executable("google-chrome"),
            BrowserChannel::Chromium => builder,
        };
        let browser_config = builder
            .build()
            .map_err(AutomationError::SessionError)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| AutomationError::SessionError(format!("browser launch failed: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    debug!("CDP handler loop ended");
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AutomationError::SessionError(format!("page open failed: {e}")))?;
        info!(profile = %config.profile_dir.display(), "browser launched");

        Ok(Arc::new(Self {
            browser: AsyncMutex::new(browser),
            page,
            elements: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            chooser_node: Arc::new(Mutex::new(None)),
            _handler_task: handler_task,
        }))
    }

    fn register(&self, el: Element) -> ElementHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.elements.lock().unwrap().insert(id, Arc::new(el));
        ElementHandle(id)
    }

    fn element(&self, handle: &ElementHandle) -> Result<Arc<Element>, AutomationError> {
        self.elements
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| AutomationError::DriverError(format!("stale handle {}", handle.0)))
    }

    async fn js_value(
        &self,
        el: &ElementHandle,
        function: &str,
    ) -> Result<Option<serde_json::Value>, AutomationError> {
        let el = self.element(el)?;
        let ret = el
            .call_js_fn(function, false)
            .await
            .map_err(driver_err)?;
        Ok(ret.result.value)
    }

    /// Tag text-content matches with a marker attribute, then query the
    /// marker. CDP has no text query, and only the deepest element whose
    /// own subtree matches is a useful click target.
    async fn tag_text_matches(
        &self,
        scope: Option<&ElementHandle>,
        needle: &str,
    ) -> Result<(), AutomationError> {
        let needle = js_escape(&needle.to_lowercase());
        let body = format!(
            r#"
            const needle = '{needle}';
            const root = this;
            root.querySelectorAll('[data-cp-hit]')
                .forEach(e => e.removeAttribute('data-cp-hit'));
            for (const el of root.querySelectorAll('*')) {{
                const t = (el.textContent || '').toLowerCase();
                if (!t.includes(needle)) continue;
                let deepest = true;
                for (const c of el.children) {{
                    if ((c.textContent || '').toLowerCase().includes(needle)) {{
                        deepest = false;
                        break;
                    }}
                }}
                if (deepest) el.setAttribute('data-cp-hit', '1');
            }}"#
        );
        match scope {
            Some(scope) => {
                let el = self.element(scope)?;
                el.call_js_fn(format!("function() {{ {body} }}"), false)
                    .await
                    .map_err(driver_err)?;
            }
            None => {
                self.page
                    .evaluate(format!(
                        "(() => {{ const doc = document.body; \
                         (function() {{ {body} }}).call(doc); }})()"
                    ))
                    .await
                    .map_err(driver_err)?;
            }
        }
        Ok(())
    }

    async fn dispatch_mouse(
        &self,
        kind: DispatchMouseEventType,
        x: f64,
        y: f64,
        with_button: bool,
    ) -> Result<(), AutomationError> {
        let mut builder = DispatchMouseEventParams::builder()
            .r#type(kind)
            .x(x)
            .y(y);
        if with_button {
            builder = builder.button(MouseButton::Left).click_count(1);
        }
        let params = builder.build().map_err(AutomationError::DriverError)?;
        self.page.execute(params).await.map_err(driver_err)?;
        Ok(())
    }

    async fn dispatch_key(
        &self,
        kind: DispatchKeyEventType,
        chord: &KeyChord,
    ) -> Result<(), AutomationError> {
        let mut builder = DispatchKeyEventParams::builder()
            .r#type(kind.clone())
            .modifiers(chord.modifiers)
            .key(chord.key.clone())
            .code(chord.code.clone())
            .windows_virtual_key_code(chord.virtual_key);
        if let Some(text) = &chord.text {
            if matches!(kind, DispatchKeyEventType::KeyDown) {
                builder = builder.text(text.clone());
            }
        }
        let params = builder.build().map_err(AutomationError::DriverError)?;
        self.page.execute(params).await.map_err(driver_err)?;
        Ok(())
    }
}

#[async_trait]
impl PageEngine for CdpEngine {
    async fn goto(&self, url: &str, budget: Duration) -> Result<(), AutomationError> {
        timeout(budget, self.page.goto(url))
            .await
            .map_err(|_| AutomationError::Timeout(format!("navigation to {url}")))?
            .map_err(driver_err)?;
        Ok(())
    }

    async fn wait_until_settled(&self, budget: Duration) -> Result<(), AutomationError> {
        // The app keeps background connections open forever, so a settle
        // timeout is expected and not fatal.
        if timeout(budget, self.page.wait_for_navigation())
            .await
            .is_err()
        {
            debug!("settle wait hit its budget, continuing");
        }
        Ok(())
    }

    async fn find_all(
        &self,
        scope: Option<&ElementHandle>,
        query: &Query,
    ) -> Result<Vec<ElementHandle>, AutomationError> {
        let selector = match query {
            Query::Css(sel) => sel.clone(),
            Query::Text(needle) => {
                self.tag_text_matches(scope, needle).await?;
                "[data-cp-hit]".to_string()
            }
        };
        let found = match scope {
            Some(scope) => {
                let el = self.element(scope)?;
                el.find_elements(selector).await.unwrap_or_default()
            }
            None => self.page.find_elements(selector).await.unwrap_or_default(),
        };
        Ok(found.into_iter().map(|el| self.register(el)).collect())
    }

    async fn parent(&self, el: &ElementHandle) -> Result<Option<ElementHandle>, AutomationError> {
        let marker = self
            .js_value(
                el,
                r#"function() {
                    const p = this.parentElement;
                    if (!p) return null;
                    window.__cpSeq = (window.__cpSeq || 0) + 1;
                    p.setAttribute('data-cp-parent', String(window.__cpSeq));
                    return String(window.__cpSeq);
                }"#,
            )
            .await?;
        let Some(serde_json::Value::String(marker)) = marker else {
            return Ok(None);
        };
        let parent = self
            .page
            .find_element(format!("[data-cp-parent='{marker}']"))
            .await
            .map_err(driver_err)?;
        let _ = parent
            .call_js_fn("function() { this.removeAttribute('data-cp-parent'); }", false)
            .await;
        Ok(Some(self.register(parent)))
    }

    async fn tag_name(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        match self
            .js_value(el, "function() { return this.tagName.toLowerCase(); }")
            .await?
        {
            Some(serde_json::Value::String(tag)) => Ok(tag),
            _ => Err(AutomationError::DriverError("no tag name".into())),
        }
    }

    async fn is_visible(&self, el: &ElementHandle) -> Result<bool, AutomationError> {
        Ok(matches!(
            self.js_value(el, VISIBLE_JS).await?,
            Some(serde_json::Value::Bool(true))
        ))
    }

    async fn text(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        match self
            .js_value(
                el,
                "function() { return this.innerText || this.textContent || ''; }",
            )
            .await?
        {
            Some(serde_json::Value::String(text)) => Ok(text),
            _ => Ok(String::new()),
        }
    }

    async fn html(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        match self
            .js_value(el, "function() { return this.innerHTML; }")
            .await?
        {
            Some(serde_json::Value::String(html)) => Ok(html),
            _ => Ok(String::new()),
        }
    }

    async fn attribute(
        &self,
        el: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, AutomationError> {
        let el = self.element(el)?;
        el.attribute(name).await.map_err(driver_err)
    }

    async fn bounding_box(
        &self,
        el: &ElementHandle,
    ) -> Result<Option<Rect>, AutomationError> {
        let value = self
            .js_value(
                el,
                r#"function() {
                    const r = this.getBoundingClientRect();
                    return { x: r.x, y: r.y, width: r.width, height: r.height };
                }"#,
            )
            .await?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    async fn click(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        let el = self.element(el)?;
        el.click().await.map_err(driver_err)?;
        Ok(())
    }

    async fn force_click(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        self.js_value(el, "function() { this.click(); }").await?;
        Ok(())
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<(), AutomationError> {
        self.dispatch_mouse(DispatchMouseEventType::MouseMoved, x, y, false)
            .await?;
        self.dispatch_mouse(DispatchMouseEventType::MousePressed, x, y, true)
            .await?;
        self.dispatch_mouse(DispatchMouseEventType::MouseReleased, x, y, true)
            .await
    }

    async fn hover(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        let Some(rect) = self.bounding_box(el).await? else {
            return Err(AutomationError::DriverError("no box to hover".into()));
        };
        let (x, y) = rect.center();
        self.dispatch_mouse(DispatchMouseEventType::MouseMoved, x, y, false)
            .await
    }

    async fn focus(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        let el = self.element(el)?;
        el.focus().await.map_err(driver_err)?;
        Ok(())
    }

    async fn scroll_into_view(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        let el = self.element(el)?;
        el.scroll_into_view().await.map_err(driver_err)?;
        Ok(())
    }

    async fn type_text(
        &self,
        el: &ElementHandle,
        text: &str,
        per_char_delay: Duration,
    ) -> Result<(), AutomationError> {
        self.focus(el).await?;
        for ch in text.chars() {
            let params = DispatchKeyEventParams::builder()
                .r#type(DispatchKeyEventType::Char)
                .text(ch.to_string())
                .build()
                .map_err(AutomationError::DriverError)?;
            self.page.execute(params).await.map_err(driver_err)?;
            if !per_char_delay.is_zero() {
                sleep(per_char_delay).await;
            }
        }
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), AutomationError> {
        let chord = KeyChord::parse(key)?;
        self.dispatch_key(DispatchKeyEventType::KeyDown, &chord)
            .await?;
        self.dispatch_key(DispatchKeyEventType::KeyUp, &chord).await
    }

    async fn clear_text(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        self.js_value(
            el,
            r#"function() {
                if ('value' in this) {
                    this.value = '';
                    this.dispatchEvent(new Event('input', { bubbles: true }));
                } else {
                    this.textContent = '';
                }
            }"#,
        )
        .await?;
        Ok(())
    }

    async fn set_input_files(
        &self,
        el: &ElementHandle,
        paths: &[PathBuf],
    ) -> Result<(), AutomationError> {
        let el = self.element(el)?;
        let files: Vec<String> = paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let params = SetFileInputFilesParams::builder()
            .files(files)
            .backend_node_id(el.backend_node_id.clone())
            .build()
            .map_err(AutomationError::DriverError)?;
        self.page.execute(params).await.map_err(driver_err)?;
        Ok(())
    }

    async fn arm_file_chooser(&self) -> Result<(), AutomationError> {
        self.page
            .execute(SetInterceptFileChooserDialogParams::new(true))
            .await
            .map_err(driver_err)?;
        *self.chooser_node.lock().unwrap() = None;

        let mut events = self
            .page
            .event_listener::<EventFileChooserOpened>()
            .await
            .map_err(driver_err)?;
        let slot = self.chooser_node.clone();
        tokio::spawn(async move {
            if let Some(event) = events.next().await {
                debug!("file chooser intercepted");
                *slot.lock().unwrap() = Some(event.backend_node_id.clone());
            }
        });
        Ok(())
    }

    async fn wait_file_chooser(&self, budget: Duration) -> Result<bool, AutomationError> {
        let policy = PollPolicy::new(budget, Duration::from_millis(50));
        let seen = policy
            .run_until(|| async { self.chooser_node.lock().unwrap().is_some() })
            .await;
        Ok(seen)
    }

    async fn fulfill_file_chooser(&self, path: &Path) -> Result<(), AutomationError> {
        let node = self.chooser_node.lock().unwrap().clone();
        let Some(node) = node else {
            return Err(AutomationError::DriverError(
                "no intercepted file chooser".into(),
            ));
        };
        let mut builder =
            SetFileInputFilesParams::builder().files(vec![path.display().to_string()]);
        match node {
            Some(backend_node_id) => builder = builder.backend_node_id(backend_node_id),
            None => {
                warn!("chooser event carried no node, falling back to first file input");
                let input = self
                    .page
                    .find_element("input[type='file']")
                    .await
                    .map_err(driver_err)?;
                builder = builder.backend_node_id(input.backend_node_id.clone());
            }
        }
        let params = builder.build().map_err(AutomationError::DriverError)?;
        self.page.execute(params).await.map_err(driver_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AutomationError> {
        let mut browser = self.browser.lock().await;
        browser.close().await.map_err(driver_err)?;
        browser.wait().await.map_err(|e| {
            AutomationError::SessionError(format!("browser did not exit cleanly: {e}"))
        })?;
        info!("browser closed");
        Ok(())
    }
}

fn driver_err(e: impl std::fmt::Display) -> AutomationError {
    AutomationError::DriverError(e.to_string())
}

fn js_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'").replace('\n', "\\n")
}

/// A parsed key chord, e.g. `Control+e`, `Shift+Enter`, `/`.
struct KeyChord {
    modifiers: i64,
    key: String,
    code: String,
    virtual_key: i64,
    text: Option<String>,
}

impl KeyChord {
    fn parse(chord: &str) -> Result<Self, AutomationError> {
        let parts: Vec<&str> = chord.split('+').collect();
        let (mods, key) = match parts.split_last() {
            Some((key, mods)) if !key.is_empty() => (mods, *key),
            // A trailing '+' means the key itself is '+'.
            _ if chord.ends_with('+') => (&parts[..parts.len() - 2], "+"),
            _ => {
                return Err(AutomationError::InvalidArgument(format!(
                    "empty key chord '{chord}'"
                )))
            }
        };

        let mut modifiers = 0i64;
        for m in mods {
            modifiers |= match *m {
                "Alt" => 1,
                "Control" | "Ctrl" => 2,
                "Meta" => 4,
                "Shift" => 8,
                other => {
                    return Err(AutomationError::InvalidArgument(format!(
                        "unknown modifier '{other}'"
                    )))
                }
            };
        }

        let (key_name, code, virtual_key, text) = match key {
            "Enter" => ("Enter".to_string(), "Enter".to_string(), 13, Some("\r")),
            "Tab" => ("Tab".to_string(), "Tab".to_string(), 9, None),
            "Backspace" => ("Backspace".to_string(), "Backspace".to_string(), 8, None),
            "Escape" => ("Escape".to_string(), "Escape".to_string(), 27, None),
            " " | "Space" => (" ".to_string(), "Space".to_string(), 32, Some(" ")),
            "/" => ("/".to_string(), "Slash".to_string(), 191, Some("/")),
            single if single.chars().count() == 1 => {
                let ch = single.chars().next().unwrap();
                let code = if ch.is_ascii_alphabetic() {
                    format!("Key{}", ch.to_ascii_uppercase())
                } else {
                    String::new()
                };
                let vk = ch.to_ascii_uppercase() as i64;
                (single.to_string(), code, vk, Some(single))
            }
            other => (other.to_string(), other.to_string(), 0, None),
        };

        // Command chords must not insert text.
        let inserts = (modifiers & !8) == 0;
        Ok(Self {
            modifiers,
            key: key_name,
            code,
            virtual_key,
            text: text.filter(|_| inserts).map(|t| t.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_modified_chords() {
        let enter = KeyChord::parse("Enter").unwrap();
        assert_eq!(enter.virtual_key, 13);
        assert_eq!(enter.text.as_deref(), Some("\r"));

        let ctrl_e = KeyChord::parse("Control+e").unwrap();
        assert_eq!(ctrl_e.modifiers, 2);
        assert_eq!(ctrl_e.code, "KeyE");
        assert!(ctrl_e.text.is_none());

        let soft_break = KeyChord::parse("Shift+Enter").unwrap();
        assert_eq!(soft_break.modifiers, 8);
        assert_eq!(soft_break.text.as_deref(), Some("\r"));
    }

    #[test]
    fn escapes_needles_for_inline_js() {
        assert_eq!(js_escape("o'reilly"), "o\\'reilly");
        assert_eq!(js_escape("a\\b"), "a\\\\b");
    }
}
