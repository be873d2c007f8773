//! Engine configuration.
//!
//! Every tuning constant lives in one immutable [`EngineConfig`] handed to
//! each component at construction. Defaults mirror what survived months of
//! production use against the target app; the `TPL_*`/`ATTACH_*` environment
//! variables override them for operators who cannot rebuild.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do when an attachment exhausts its retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachFailurePolicy {
    /// Abort the whole run before any send click.
    Abort,
    /// Degrade to a text-only send and report the failure per file.
    SendWithoutFile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserChannel {
    Msedge,
    Chrome,
    Chromium,
}

/// Localized text used to recognize affordances the app never names
/// consistently. Japanese hints come first because that is the deployed
/// locale; English equivalents keep the engine working on untranslated
/// tenants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HintTables {
    /// Operator-supplied aria-label/tooltip for the attach control, tried
    /// before the built-in hints.
    pub attach_tooltip_hint: Option<String>,
    /// Attach-control label fragments.
    pub attach_hints: Vec<String>,
    /// "Upload from this device" menu item fragments.
    pub device_item_hints: Vec<String>,
    /// Cloud-storage items that must never be picked from the attach menu.
    pub cloud_deny_hints: Vec<String>,
    /// Regex denylist for search suggestions that are not genuine chats.
    pub decoy_patterns: Vec<String>,
    /// Selectors for read/delivered status icons next to sent messages.
    pub status_selectors: Vec<String>,
}

impl Default for HintTables {
    fn default() -> Self {
        Self {
            attach_tooltip_hint: None,
            attach_hints: vec![
                "ファイルを添付".into(),
                "添付".into(),
                "ファイル".into(),
                "Attach".into(),
                "Add file".into(),
                "Attach a file".into(),
            ],
            device_item_hints: vec![
                "このデバイスからアップロード".into(),
                "このデバイスから".into(),
                "デバイスから".into(),
                "コンピューターから".into(),
                "Upload from this device".into(),
                "From this device".into(),
                "From computer".into(),
            ],
            cloud_deny_hints: vec![
                "クラウド".into(),
                "OneDrive".into(),
                "SharePoint".into(),
                "Cloud".into(),
                "チーム サイト".into(),
                "Teams サイト".into(),
            ],
            decoy_patterns: vec![
                "Enter.?キー.*結果.*表示".into(),
                "結果.*表示".into(),
                "ユーザー.*招待".into(),
                "Invite.*to.*Teams".into(),
            ],
            status_selectors: vec![
                "[data-icon-name*='CheckMark']".into(),
                "[data-icon-name*='Checkmark']".into(),
                "svg[aria-label*='既読']".into(),
                "svg[aria-label*='送信済み']".into(),
                "svg[aria-label*='配信済み']".into(),
                "svg[aria-label*='Read']".into(),
                "svg[aria-label*='Delivered']".into(),
                "svg[aria-label*='Seen']".into(),
                "[aria-label*='既読']".into(),
                "[aria-label*='送信済み']".into(),
                "[aria-label*='配信済み']".into(),
                "[aria-label*='Read']".into(),
                "[aria-label*='Delivered']".into(),
                "[aria-label*='Seen']".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Application root the session navigates to.
    pub app_url: String,
    /// Persistent browser profile. Exclusively owned for the run's
    /// duration; concurrent runs against the same profile are unsupported.
    pub profile_dir: PathBuf,
    pub channel: BrowserChannel,
    pub headless: bool,

    /// Global ceiling for navigation and load-state waits.
    pub navigation_timeout: Duration,
    /// Per-strategy probe budget inside the resolver.
    pub probe_timeout: Duration,
    /// Base polling step for short probe loops.
    pub poll_interval: Duration,

    /// Unconditional delay before polling the people-picker suggestion
    /// panel.
    pub suggestion_min_wait: Duration,
    /// Polling budget for the suggestion panel after the settle delay.
    pub suggestion_max_wait: Duration,
    pub between_recipients_pause: Duration,
    pub before_chat_name_pause: Duration,

    /// Settle delay before polling global-search suggestions.
    pub search_settle_wait: Duration,
    /// Polling budget for global-search suggestions.
    pub search_suggestion_wait: Duration,

    pub delivery_wait: Duration,
    /// Extra click-and-confirm cycles after the first send attempt.
    pub send_retries: u32,

    pub attach_upload_timeout: Duration,
    pub attach_retries: u32,
    pub attach_failure_policy: AttachFailurePolicy,

    /// Per-character delay when typing an address into the picker.
    pub picker_type_delay: Duration,
    /// Per-character delay for message text and search terms.
    pub type_delay: Duration,

    pub hints: HintTables,
    /// Emit per-poll diagnostics at debug level.
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            app_url: "https://teams.microsoft.com/".into(),
            profile_dir: PathBuf::from("./pw-profile"),
            channel: BrowserChannel::Msedge,
            headless: false,
            navigation_timeout: Duration::from_millis(150_000),
            probe_timeout: Duration::from_millis(2_000),
            poll_interval: Duration::from_millis(100),
            suggestion_min_wait: Duration::from_millis(1_400),
            suggestion_max_wait: Duration::from_millis(6_000),
            between_recipients_pause: Duration::from_millis(250),
            before_chat_name_pause: Duration::from_millis(200),
            search_settle_wait: Duration::from_millis(600),
            search_suggestion_wait: Duration::from_millis(7_000),
            delivery_wait: Duration::from_millis(30_000),
            send_retries: 2,
            attach_upload_timeout: Duration::from_millis(60_000),
            attach_retries: 2,
            attach_failure_policy: AttachFailurePolicy::SendWithoutFile,
            picker_type_delay: Duration::from_millis(16),
            type_delay: Duration::from_millis(10),
            hints: HintTables::default(),
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the operator environment variables.
    pub fn from_env() -> Self {
        Self::default().overlay(&|name| std::env::var(name).ok())
    }

    fn overlay(mut self, var: &dyn Fn(&str) -> Option<String>) -> Self {
        let ms = |v: String| v.parse::<u64>().ok().map(Duration::from_millis);
        let csv = |v: String| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        };

        if let Some(dir) = var("PW_PROFILE_DIR") {
            self.profile_dir = PathBuf::from(dir);
        }
        if let Some(ch) = var("PLAYWRIGHT_CHANNEL") {
            self.channel = match ch.as_str() {
                "chrome" => BrowserChannel::Chrome,
                "msedge" => BrowserChannel::Msedge,
                _ => BrowserChannel::Chromium,
            };
        }
        if let Some(d) = var("TPL_SUGGESTION_MIN_WAIT_MS").and_then(ms) {
            self.suggestion_min_wait = d;
        }
        if let Some(d) = var("TPL_SUGGESTION_MAX_WAIT_MS").and_then(ms) {
            self.suggestion_max_wait = d;
        }
        if let Some(d) = var("TPL_BETWEEN_RECIPIENTS_PAUSE_MS").and_then(ms) {
            self.between_recipients_pause = d;
        }
        if let Some(d) = var("TPL_BEFORE_OPEN_CHATNAME_MS").and_then(ms) {
            self.before_chat_name_pause = d;
        }
        if let Some(d) = var("DELIVERY_WAIT_MS")
            .or_else(|| var("TPL_DELIVERY_WAIT_MS"))
            .and_then(ms)
        {
            self.delivery_wait = d;
        }
        if let Some(n) = var("SEND_RETRIES").and_then(|v| v.parse().ok()) {
            self.send_retries = n;
        }
        if let Some(d) = var("ATTACH_UPLOAD_TIMEOUT_MS").and_then(ms) {
            self.attach_upload_timeout = d;
        }
        if let Some(n) = var("ATTACH_RETRIES").and_then(|v| v.parse().ok()) {
            self.attach_retries = n;
        }
        if let Some(p) = var("ATTACH_FAIL_BEHAVIOR") {
            self.attach_failure_policy = match p.as_str() {
                "abort" => AttachFailurePolicy::Abort,
                _ => AttachFailurePolicy::SendWithoutFile,
            };
        }
        if let Some(h) = var("ATTACH_TOOLTIP_HINT") {
            let h = h.trim().to_string();
            if !h.is_empty() {
                self.hints.attach_tooltip_hint = Some(h);
            }
        }
        if let Some(v) = var("DEVICE_ITEM_HINTS") {
            let items = csv(v);
            if !items.is_empty() {
                self.hints.device_item_hints = items;
            }
        }
        if let Some(v) = var("CLOUD_NG_HINTS") {
            let items = csv(v);
            if !items.is_empty() {
                self.hints.cloud_deny_hints = items;
            }
        }
        if let Some(v) = var("DEBUG_LOG") {
            self.debug = v == "1";
        }
        self
    }
}
