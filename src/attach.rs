//! Attachment upload.
//!
//! Uploading is a per-file state machine driven entirely by visual
//! evidence: Pending → MenuOpened → FileInjected → Uploading → Ready or
//! Failed. Readiness needs three simultaneous signals (a filename chip,
//! no progress indicator, and an enabled send control) because a chip
//! often appears before the transfer completes. The residual false
//! positive (chip visible before the last byte lands) is a known limit of
//! what the UI exposes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::composer::message_box_spec;
use crate::config::{AttachFailurePolicy, EngineConfig};
use crate::errors::AutomationError;
use crate::locator::Resolver;
use crate::page::{PageEngine, UiElement};
use crate::retry::PollPolicy;
use crate::selector::Strategy;
use crate::send::send_control_enabled;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Pending,
    MenuOpened,
    FileInjected,
    Uploading,
    /// Chip visible, no progress indicator, send control enabled.
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentReport {
    pub path: PathBuf,
    pub state: AttachmentState,
    pub attempts: u32,
}

/// Outcome of processing every requested attachment: attached if at least
/// one file reached Ready, with per-file failures reported individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachOutcome {
    pub reports: Vec<AttachmentReport>,
    pub any_attached: bool,
}

/// What the attach affordance produced after a click.
enum MenuSignal {
    /// A menu panel is visible.
    Menu(UiElement),
    /// No menu role, but a device-upload item is already on screen.
    DeviceItemVisible,
    /// The click materialized a bare file input instead of a menu.
    FileInputReady,
}

pub struct AttachmentUploader {
    engine: Arc<dyn PageEngine>,
    config: Arc<EngineConfig>,
    resolver: Resolver,
}

impl AttachmentUploader {
    pub fn new(session: &Session) -> Self {
        Self {
            engine: session.engine(),
            config: session.config(),
            resolver: session.resolver(),
        }
    }

    /// Process all attachments sequentially, each with its own retry
    /// budget. Under the Abort policy a file that exhausts its retries
    /// ends the run before any send click; the per-file reports gathered
    /// so far ride along with the error, with untried files left Pending.
    #[instrument(level = "debug", skip(self, paths))]
    pub async fn attach_all(
        &self,
        paths: &[PathBuf],
    ) -> Result<AttachOutcome, (AutomationError, Vec<AttachmentReport>)> {
        let mut reports = Vec::with_capacity(paths.len());
        for (idx, path) in paths.iter().enumerate() {
            let mut attempts = 1u32;
            let mut state = self.attach_one(path).await;
            while state != AttachmentState::Ready && attempts <= self.config.attach_retries {
                debug!(path = %path.display(), attempts, "attachment retry");
                let _ = self.activate_composer().await;
                state = self.attach_one(path).await;
                attempts += 1;
            }
            let ok = state == AttachmentState::Ready;
            reports.push(AttachmentReport {
                path: path.clone(),
                state,
                attempts,
            });
            if !ok {
                let name = file_name_of(path);
                if self.config.attach_failure_policy == AttachFailurePolicy::Abort {
                    reports.extend(paths[idx + 1..].iter().map(|p| AttachmentReport {
                        path: p.clone(),
                        state: AttachmentState::Pending,
                        attempts: 0,
                    }));
                    return Err((AutomationError::UploadFailed(name), reports));
                }
                warn!(file = %name, "attachment failed, continuing without it");
            }
        }
        let any_attached = reports
            .iter()
            .any(|r| r.state == AttachmentState::Ready);
        Ok(AttachOutcome {
            reports,
            any_attached,
        })
    }

    /// One full pass of the state machine for a single file.
    pub async fn attach_one(&self, path: &Path) -> AttachmentState {
        let file_name = file_name_of(path);

        // Fast path: some renders keep a hidden file input in the composer
        // ancestry and need no menu at all.
        if self.inject_direct(path).await {
            debug!(file = %file_name, "direct file input injection");
            self.accept_replace_prompt().await;
            return self.await_ready(&file_name).await;
        }

        match self.open_menu_and_inject(path).await {
            Ok(true) => {
                self.accept_replace_prompt().await;
                self.await_ready(&file_name).await
            }
            Ok(false) => {
                // The menu path failed but the click may still have
                // generated an input element.
                if self.inject_direct(path).await {
                    debug!(file = %file_name, "fallback direct injection");
                    self.accept_replace_prompt().await;
                    return self.await_ready(&file_name).await;
                }
                debug!(file = %file_name, "could not open device upload");
                AttachmentState::Failed
            }
            Err(e) => {
                debug!(file = %file_name, error = %e, "injection error");
                AttachmentState::Failed
            }
        }
    }

    /// FileInjected → Uploading → Ready | Failed. All three readiness
    /// signals are required; none alone is sufficient.
    async fn await_ready(&self, file_name: &str) -> AttachmentState {
        let policy = PollPolicy::new(
            self.config.attach_upload_timeout,
            self.config.poll_interval * 3,
        );
        let ready = policy
            .run_until(|| async {
                let chip = self.filename_chip_visible(file_name).await;
                let uploading = self.upload_in_progress().await;
                let send_ok = send_control_enabled(&self.resolver).await;
                debug!(chip, uploading, send_ok, "upload readiness probe");
                chip && !uploading && send_ok
            })
            .await;
        if ready {
            AttachmentState::Ready
        } else {
            AttachmentState::Failed
        }
    }

    async fn filename_chip_visible(&self, file_name: &str) -> bool {
        let mut chips = self
            .resolver
            .visible_matches(None, &Strategy::text(file_name))
            .await;
        if chips.is_empty() {
            let prefix: String = file_name.chars().take(8).collect();
            if !prefix.is_empty() {
                chips = self
                    .resolver
                    .visible_matches(None, &Strategy::text(prefix))
                    .await;
            }
        }
        !chips.is_empty()
    }

    async fn upload_in_progress(&self) -> bool {
        for needle in ["アップロード中", "Uploading"] {
            if self.resolver.count(None, &Strategy::text(needle)).await > 0 {
                return true;
            }
        }
        if self
            .resolver
            .count(None, &Strategy::css("[role='progressbar'], progress"))
            .await
            > 0
        {
            return true;
        }
        self.resolver
            .count(
                None,
                &Strategy::css("[data-icon-name*='Progress'], [data-icon-name*='Spinner']"),
            )
            .await
            > 0
    }

    /// A duplicate-filename prompt blocks the upload until answered;
    /// replacing is always the right answer for this workflow.
    async fn accept_replace_prompt(&self) {
        let modal = Strategy::text("このファイルは既に存在します");
        if self.resolver.first_visible(None, &modal).await.is_some() {
            let replace = Strategy::role("button", "置換|Replace");
            if let Some(btn) = self.resolver.first_visible(None, &replace).await {
                if btn.click().await.is_ok() {
                    debug!("accepted replace prompt");
                    sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    async fn message_box(&self) -> Option<UiElement> {
        self.resolver.resolve(&message_box_spec()).await
    }

    /// The composer's container, used to scope file-input scans.
    async fn composer_root(&self) -> Option<UiElement> {
        let spec = Strategy::css("[data-tid='messagePane'], [data-tid='message-composer']");
        if let Some(root) = self.resolver.first_visible(None, &spec).await {
            return Some(root);
        }
        self.message_box().await?.parent().await
    }

    /// Click into the composer and nudge focus so the toolbar renders.
    async fn activate_composer(&self) -> Option<UiElement> {
        let msg = self.message_box().await?;
        let _ = msg.scroll_into_view().await;
        msg.click().await.ok()?;
        sleep(Duration::from_millis(80)).await;
        let _ = self.engine.press_key("Shift+Tab").await;
        sleep(Duration::from_millis(50)).await;
        let _ = self.engine.press_key("Tab").await;
        sleep(Duration::from_millis(120)).await;
        self.composer_root().await
    }

    async fn find_file_input(&self) -> Option<UiElement> {
        let root = self.composer_root().await;
        let inputs = self
            .resolver
            .matches(root.as_ref(), &Strategy::css("input[type='file']"))
            .await;
        inputs.into_iter().next()
    }

    async fn inject_direct(&self, path: &Path) -> bool {
        let Some(input) = self.find_file_input().await else {
            return false;
        };
        input
            .set_input_files(std::slice::from_ref(&path.to_path_buf()))
            .await
            .is_ok()
    }

    /// Open the attach menu and inject the file through the intercepted
    /// chooser. Once a device item has been seen, no further toolbar
    /// candidates are clicked; multi-clicking reopens menus and double
    /// attaches.
    async fn open_menu_and_inject(&self, path: &Path) -> Result<bool, AutomationError> {
        let root = match self.activate_composer().await {
            Some(root) => Some(root),
            None => self.composer_root().await,
        };

        let candidates = self.collect_toolbar_buttons(root.as_ref()).await;
        debug!(candidates = candidates.len(), "attach toolbar candidates");

        for (label, button) in candidates {
            debug!(label, "trying attach control");
            if !button.click_resilient().await {
                continue;
            }
            let signal = self.wait_menu_open(Duration::from_millis(6_000)).await;
            let menu = match signal {
                Some(MenuSignal::Menu(menu)) => Some(menu),
                Some(MenuSignal::DeviceItemVisible) => None,
                Some(MenuSignal::FileInputReady) => {
                    return Ok(self.inject_direct(path).await);
                }
                None => continue,
            };

            let Some(item) = self.pick_device_item(menu.as_ref()).await else {
                continue;
            };

            // Arm the chooser before the click so a single click is
            // guaranteed to be caught.
            self.engine.arm_file_chooser().await?;
            if !self.click_inside(&item, -6.0).await && !item.click_resilient().await {
                debug!("device item refused every click");
            }
            if self
                .engine
                .wait_file_chooser(Duration::from_millis(15_000))
                .await
                .unwrap_or(false)
            {
                self.engine.fulfill_file_chooser(path).await?;
                return Ok(true);
            }
            // No chooser arrived; stop here rather than multi-click.
            sleep(Duration::from_millis(200)).await;
            break;
        }
        Ok(false)
    }

    /// Wait for the attach click to produce something usable: a menu, a
    /// device item without a menu role, or a bare file input.
    async fn wait_menu_open(&self, budget: Duration) -> Option<MenuSignal> {
        sleep(Duration::from_millis(300)).await;
        let policy = PollPolicy::new(budget, Duration::from_millis(140));
        policy
            .run(|| async {
                let panel = Strategy::css("[role='menu'], [data-tid*='menu']");
                if let Some(menu) = self.resolver.first_visible(None, &panel).await {
                    debug!("attach menu opened");
                    return Some(MenuSignal::Menu(menu));
                }
                for hint in &self.config.hints.device_item_hints {
                    if self
                        .resolver
                        .first_visible(None, &Strategy::text(hint.clone()))
                        .await
                        .is_some()
                    {
                        debug!("device item visible without menu role");
                        return Some(MenuSignal::DeviceItemVisible);
                    }
                }
                if self.find_file_input().await.is_some() {
                    debug!("file input appeared instead of menu");
                    return Some(MenuSignal::FileInputReady);
                }
                None
            })
            .await
    }

    /// Pick a "from this device" item, excluding cloud-storage entries.
    async fn pick_device_item(&self, menu: Option<&UiElement>) -> Option<UiElement> {
        let mut candidates: Vec<UiElement> = Vec::new();
        for hint in &self.config.hints.device_item_hints {
            for el in self
                .resolver
                .visible_matches(None, &Strategy::text(hint.clone()))
                .await
                .into_iter()
                .take(8)
            {
                candidates.push(el);
            }
        }

        if let Some(menu) = menu {
            let items = self
                .resolver
                .matches(Some(menu), &Strategy::css("[role='menuitem'], li, button"))
                .await;
            for el in items.into_iter().take(12) {
                if !el.is_visible().await {
                    continue;
                }
                let text = el.text().await.unwrap_or_default();
                if self
                    .config
                    .hints
                    .device_item_hints
                    .iter()
                    .any(|h| contains_ignore_case(&text, h))
                {
                    candidates.push(el);
                }
            }
        }

        let mut filtered = Vec::new();
        let mut seen = Vec::new();
        for el in candidates {
            let text = el.text().await.unwrap_or_default();
            if self
                .config
                .hints
                .cloud_deny_hints
                .iter()
                .any(|ng| contains_ignore_case(&text, ng))
            {
                continue;
            }
            let key = el
                .bounding_box()
                .await
                .map(|r| r.position_key())
                .unwrap_or((0, 0));
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            filtered.push(el);
        }
        filtered.into_iter().next()
    }

    /// Toolbar candidates in preference order: hinted attach buttons,
    /// paperclip icon buttons, attach-tagged nodes, then plus/more
    /// controls. Near-duplicates are dropped by screen position.
    async fn collect_toolbar_buttons(
        &self,
        root: Option<&UiElement>,
    ) -> Vec<(String, UiElement)> {
        let mut found: Vec<(String, UiElement)> = Vec::new();
        let mut hints: Vec<String> = Vec::new();
        if let Some(hint) = &self.config.hints.attach_tooltip_hint {
            hints.push(hint.clone());
        }
        hints.extend(self.config.hints.attach_hints.iter().cloned());

        let areas: Vec<Option<&UiElement>> = match root {
            Some(root) => vec![Some(root), None],
            None => vec![None],
        };

        for area in &areas {
            for hint in &hints {
                let css = format!("button[aria-label*='{hint}'], button[title*='{hint}']");
                for el in self
                    .resolver
                    .matches(*area, &Strategy::css(css))
                    .await
                    .into_iter()
                    .take(6)
                {
                    found.push((hint.clone(), el));
                }
            }

            let icons = Strategy::css(
                "button [data-icon-name*='Attach'], button [data-icon-name*='Paperclip']",
            );
            for el in self
                .resolver
                .matches(*area, &icons)
                .await
                .into_iter()
                .take(6)
            {
                if let Some(button) = ancestor_button(&el).await {
                    found.push(("icon:Attach".to_string(), button));
                }
            }

            for el in self
                .resolver
                .matches(*area, &Strategy::css("[data-tid*='attach']"))
                .await
                .into_iter()
                .take(6)
            {
                found.push(("data-tid:attach".to_string(), el));
            }

            let plus = Strategy::css(
                "button[aria-label*='さらに'], button[title*='さらに'], [data-icon-name*='Add'], [data-icon-name*='Plus']",
            );
            for el in self
                .resolver
                .matches(*area, &plus)
                .await
                .into_iter()
                .take(4)
            {
                if let Some(button) = ancestor_button(&el).await {
                    found.push(("plus".to_string(), button));
                }
            }
        }

        let mut unique: Vec<(String, UiElement)> = Vec::new();
        let mut seen = Vec::new();
        for (label, el) in found {
            let key = el
                .bounding_box()
                .await
                .map(|r| r.position_key())
                .unwrap_or((0, 0));
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            unique.push((label, el));
        }
        unique
    }

    /// Click slightly above the element's center; menu rows in the target
    /// app hide their hit area behind a bottom-aligned tooltip strip.
    async fn click_inside(&self, el: &UiElement, y_offset: f64) -> bool {
        let Some(rect) = el.bounding_box().await else {
            return false;
        };
        let (x, y) = rect.center();
        self.engine.click_at(x, y + y_offset).await.is_ok()
    }
}

async fn ancestor_button(el: &UiElement) -> Option<UiElement> {
    let mut current = el.clone();
    for _ in 0..4 {
        if current.tag_name().await.as_deref() == Some("button")
            || current.attribute("role").await.as_deref() == Some("button")
        {
            return Some(current);
        }
        current = current.parent().await?;
    }
    None
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
