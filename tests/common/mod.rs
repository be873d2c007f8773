//! Scripted in-memory page engine for controller tests.
//!
//! `FakePage` implements `PageEngine` over a flat node table. Nodes carry
//! exact selector markers: a CSS query matches a node when any of the
//! query's comma segments equals one of the node's markers, which keeps
//! fixtures explicit instead of implementing a CSS engine. Text queries
//! match nodes whose own text contains the needle case-insensitively.
//!
//! App behavior is scripted: typing into the picker grows a suggestion
//! listbox, clicking an option grows a chip, clicking send empties the
//! composer and renders a delivery indicator, and so on. Every interaction
//! lands in an event log the tests assert against.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::sleep;

use chatpilot::errors::AutomationError;
use chatpilot::page::{ElementHandle, PageEngine, Query, Rect};
use chatpilot::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpinnerMode {
    /// Uploads complete instantly, no progress indicator ever renders.
    #[default]
    None,
    /// A progress indicator renders and disappears after the duration.
    Clears(Duration),
    /// The progress indicator never goes away.
    Stuck,
}

/// Scripted app behavior.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Typing into the picker field produces a one-option suggestion list.
    pub picker_suggests: bool,
    /// Clicking a suggestion shows an invite prompt instead of a chip; the
    /// chip appears once the invite button is clicked.
    pub invite_required: bool,
    /// Clicking send empties the composer and renders a delivery icon.
    pub send_works: bool,
    pub spinner: SpinnerMode,
    /// Rows materialized in the search panel after typing into the box.
    pub search_rows: Vec<SearchRow>,
}

#[derive(Debug, Clone)]
pub struct SearchRow {
    pub text: String,
    pub avatar: bool,
    /// Clicking this row navigates into a chat (renders the composer).
    pub opens_chat: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub parent: Option<u64>,
    pub markers: Vec<String>,
    pub kind: String,
    pub tag: String,
    pub text: String,
    pub html: String,
    pub attrs: Vec<(String, String)>,
    pub invisible: bool,
    pub rect: Option<Rect>,
    /// Behavior payload, e.g. the address a picker option stands for.
    pub data: String,
    pub expires: Option<Duration>,
}

impl NodeSpec {
    pub fn markers(markers: &[&str]) -> Self {
        Self {
            markers: markers.iter().map(|m| m.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn parent(mut self, id: u64) -> Self {
        self.parent = Some(id);
        self
    }

    pub fn data(mut self, data: &str) -> Self {
        self.data = data.to_string();
        self
    }
}

struct Node {
    id: u64,
    parent: Option<u64>,
    markers: Vec<String>,
    kind: String,
    tag: String,
    text: String,
    html: String,
    attrs: HashMap<String, String>,
    visible: bool,
    rect: Rect,
    data: String,
    expires_at: Option<Instant>,
}

impl Node {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct PageState {
    nodes: HashMap<u64, Node>,
    next_id: u64,
    chooser_armed: bool,
    chooser_open: bool,
}

pub struct FakePage {
    state: Mutex<PageState>,
    script: Script,
    events: Mutex<Vec<String>>,
}

impl FakePage {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PageState::default()),
            script,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn add(&self, spec: NodeSpec) -> u64 {
        let mut state = self.state.lock().unwrap();
        insert(&mut state, spec)
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_events(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn node_kind(&self, id: u64) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.nodes.get(&id).map(|n| n.kind.clone())
    }

    /// Dispatch scripted behavior for a click on a node.
    fn on_click(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        let Some(node) = state.nodes.get(&id) else {
            self.log(format!("click:missing:{id}"));
            return;
        };
        let kind = node.kind.clone();
        let data = node.data.clone();
        self.log(if kind.is_empty() {
            format!("click:#{id}")
        } else {
            format!("click:{kind}")
        });

        match kind.as_str() {
            "picker-option" => {
                if self.script.invite_required && !chip_present(&state, &data) {
                    if !kind_present(&state, "invite-button") {
                        insert(
                            &mut state,
                            NodeSpec::markers(&["button", "[role='button']"])
                                .kind("invite-button")
                                .attr("aria-label", "招待")
                                .data(&data),
                        );
                    }
                } else {
                    add_chip(&mut state, &data);
                }
            }
            "invite-button" => {
                add_chip(&mut state, &data);
                remove_kind(&mut state, "invite-button");
            }
            "send" => {
                if self.script.send_works {
                    for node in state.nodes.values_mut() {
                        if node.kind == "composer" {
                            node.text.clear();
                            node.html = "<div><br></div>".to_string();
                        }
                    }
                    insert(
                        &mut state,
                        NodeSpec::markers(&["[data-icon-name*='CheckMark']"]).kind("indicator"),
                    );
                }
            }
            "search-row" => {
                if data == "open" {
                    remove_kind(&mut state, "search-panel");
                    remove_kind(&mut state, "search-row");
                    if !kind_present(&state, "composer") {
                        insert(
                            &mut state,
                            NodeSpec::markers(&["div[contenteditable='true'][role='textbox']"])
                                .kind("composer"),
                        );
                    }
                }
            }
            "attach-button" => {
                if !kind_present(&state, "attach-menu") {
                    let menu = insert(
                        &mut state,
                        NodeSpec::markers(&["[role='menu']"]).kind("attach-menu"),
                    );
                    insert(
                        &mut state,
                        NodeSpec::markers(&["[role='menuitem']"])
                            .kind("device-item")
                            .text("このデバイスからアップロード")
                            .parent(menu),
                    );
                }
            }
            "device-item" => {
                if state.chooser_armed {
                    state.chooser_open = true;
                }
            }
            _ => {}
        }
    }

    fn on_type(&self, id: u64, text: &str) {
        let mut state = self.state.lock().unwrap();
        let Some(node) = state.nodes.get_mut(&id) else {
            return;
        };
        let kind = node.kind.clone();
        node.text.push_str(text);
        drop_stale_suggestions(&mut state, &kind);

        match kind.as_str() {
            "picker-field" => {
                if self.script.picker_suggests {
                    let listbox = insert(
                        &mut state,
                        NodeSpec::markers(&["[role='listbox']"]).kind("listbox"),
                    );
                    insert(
                        &mut state,
                        NodeSpec::markers(&["[role='option']"])
                            .kind("picker-option")
                            .text(text)
                            .data(text)
                            .parent(listbox),
                    );
                }
            }
            "search-box" => {
                let panel = insert(
                    &mut state,
                    NodeSpec::markers(&["[role='listbox']"]).kind("search-panel"),
                );
                for row in &self.script.search_rows {
                    let row_id = insert(
                        &mut state,
                        NodeSpec::markers(&["[role='option']"])
                            .kind("search-row")
                            .text(&row.text)
                            .data(if row.opens_chat { "open" } else { "" })
                            .parent(panel),
                    );
                    if row.avatar {
                        insert(
                            &mut state,
                            NodeSpec::markers(&["img"]).kind("avatar").parent(row_id),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn start_upload(&self, file_name: &str) {
        let mut state = self.state.lock().unwrap();
        if !state
            .nodes
            .values()
            .any(|n| n.kind == "file-chip" && n.text == file_name)
        {
            insert(
                &mut state,
                NodeSpec::markers(&[]).kind("file-chip").text(file_name),
            );
        }
        match self.script.spinner {
            SpinnerMode::None => {}
            SpinnerMode::Clears(after) => {
                if !kind_present(&state, "spinner") {
                    insert(
                        &mut state,
                        NodeSpec {
                            expires: Some(after),
                            ..NodeSpec::markers(&["[role='progressbar']"]).kind("spinner")
                        },
                    );
                }
            }
            SpinnerMode::Stuck => {
                if !kind_present(&state, "spinner") {
                    insert(
                        &mut state,
                        NodeSpec::markers(&["[role='progressbar']"]).kind("spinner"),
                    );
                }
            }
        }
    }

    fn matching_ids(&self, scope: Option<u64>, query: &Query) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<u64> = state
            .nodes
            .values()
            .filter(|n| !n.expired())
            .filter(|n| scope.map_or(true, |root| is_descendant(&state, n.id, root)))
            .filter(|n| match query {
                Query::Css(sel) => sel
                    .split(',')
                    .map(str::trim)
                    .any(|segment| n.markers.iter().any(|m| m == segment)),
                Query::Text(needle) => n
                    .text
                    .to_lowercase()
                    .contains(&needle.to_lowercase()),
            })
            .map(|n| n.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

fn insert(state: &mut PageState, spec: NodeSpec) -> u64 {
    state.next_id += 1;
    let id = state.next_id;
    let rect = spec.rect.unwrap_or(Rect {
        x: 10.0,
        y: 40.0 * id as f64,
        width: 160.0,
        height: 30.0,
    });
    state.nodes.insert(
        id,
        Node {
            id,
            parent: spec.parent,
            markers: spec.markers,
            kind: spec.kind,
            tag: if spec.tag.is_empty() {
                "div".to_string()
            } else {
                spec.tag
            },
            text: spec.text,
            html: spec.html,
            attrs: spec.attrs.into_iter().collect(),
            visible: !spec.invisible,
            rect,
            data: spec.data,
            expires_at: spec.expires.map(|d| Instant::now() + d),
        },
    );
    id
}

fn chip_present(state: &PageState, address: &str) -> bool {
    state
        .nodes
        .values()
        .any(|n| n.kind == "chip" && n.text == address)
}

fn kind_present(state: &PageState, kind: &str) -> bool {
    state.nodes.values().any(|n| n.kind == kind)
}

fn remove_kind(state: &mut PageState, kind: &str) {
    state.nodes.retain(|_, n| n.kind != kind);
}

fn add_chip(state: &mut PageState, address: &str) {
    if !chip_present(state, address) {
        insert(
            state,
            NodeSpec::markers(&["[data-tid='people-picker-selected']"])
                .kind("chip")
                .text(address),
        );
    }
}

/// Each keystroke burst re-renders the suggestion layer.
fn drop_stale_suggestions(state: &mut PageState, field_kind: &str) {
    match field_kind {
        "picker-field" => {
            remove_kind(state, "listbox");
            remove_kind(state, "picker-option");
        }
        "search-box" => {
            remove_kind(state, "search-panel");
            remove_kind(state, "search-row");
            remove_kind(state, "avatar");
        }
        _ => {}
    }
}

fn is_descendant(state: &PageState, mut id: u64, root: u64) -> bool {
    if id == root {
        return false;
    }
    while let Some(node) = state.nodes.get(&id) {
        match node.parent {
            Some(parent) if parent == root => return true,
            Some(parent) => id = parent,
            None => return false,
        }
    }
    false
}

#[async_trait]
impl PageEngine for FakePage {
    async fn goto(&self, url: &str, _timeout: Duration) -> Result<(), AutomationError> {
        self.log(format!("goto:{url}"));
        Ok(())
    }

    async fn wait_until_settled(&self, _timeout: Duration) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn find_all(
        &self,
        scope: Option<&ElementHandle>,
        query: &Query,
    ) -> Result<Vec<ElementHandle>, AutomationError> {
        Ok(self
            .matching_ids(scope.map(|s| s.0), query)
            .into_iter()
            .map(ElementHandle)
            .collect())
    }

    async fn parent(&self, el: &ElementHandle) -> Result<Option<ElementHandle>, AutomationError> {
        let state = self.state.lock().unwrap();
        let node = state
            .nodes
            .get(&el.0)
            .ok_or_else(|| AutomationError::DriverError("stale handle".into()))?;
        Ok(node.parent.map(ElementHandle))
    }

    async fn tag_name(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(&el.0)
            .map(|n| n.tag.clone())
            .ok_or_else(|| AutomationError::DriverError("stale handle".into()))
    }

    async fn is_visible(&self, el: &ElementHandle) -> Result<bool, AutomationError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .get(&el.0)
            .map(|n| n.visible && !n.expired())
            .unwrap_or(false))
    }

    async fn text(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(&el.0)
            .map(|n| n.text.clone())
            .ok_or_else(|| AutomationError::DriverError("stale handle".into()))
    }

    async fn html(&self, el: &ElementHandle) -> Result<String, AutomationError> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(&el.0)
            .map(|n| n.html.clone())
            .ok_or_else(|| AutomationError::DriverError("stale handle".into()))
    }

    async fn attribute(
        &self,
        el: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, AutomationError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .get(&el.0)
            .and_then(|n| n.attrs.get(name).cloned()))
    }

    async fn bounding_box(
        &self,
        el: &ElementHandle,
    ) -> Result<Option<Rect>, AutomationError> {
        let state = self.state.lock().unwrap();
        Ok(state.nodes.get(&el.0).map(|n| n.rect))
    }

    async fn click(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        self.on_click(el.0);
        Ok(())
    }

    async fn force_click(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        self.on_click(el.0);
        Ok(())
    }

    async fn click_at(&self, x: f64, y: f64) -> Result<(), AutomationError> {
        let target = {
            let state = self.state.lock().unwrap();
            state
                .nodes
                .values()
                .filter(|n| n.visible && !n.expired())
                .find(|n| {
                    x >= n.rect.x
                        && x <= n.rect.x + n.rect.width
                        && y >= n.rect.y
                        && y <= n.rect.y + n.rect.height
                })
                .map(|n| n.id)
        };
        match target {
            Some(id) => self.on_click(id),
            None => self.log(format!("click-at:{x},{y}")),
        }
        Ok(())
    }

    async fn hover(&self, _el: &ElementHandle) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn focus(&self, _el: &ElementHandle) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn scroll_into_view(&self, _el: &ElementHandle) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn type_text(
        &self,
        el: &ElementHandle,
        text: &str,
        _per_char_delay: Duration,
    ) -> Result<(), AutomationError> {
        self.log(format!("type:{text}"));
        self.on_type(el.0, text);
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), AutomationError> {
        self.log(format!("key:{key}"));
        Ok(())
    }

    async fn clear_text(&self, el: &ElementHandle) -> Result<(), AutomationError> {
        let mut state = self.state.lock().unwrap();
        if let Some(node) = state.nodes.get_mut(&el.0) {
            node.text.clear();
        }
        Ok(())
    }

    async fn set_input_files(
        &self,
        el: &ElementHandle,
        paths: &[PathBuf],
    ) -> Result<(), AutomationError> {
        if self.node_kind(el.0).as_deref() != Some("file-input") {
            return Err(AutomationError::DriverError("not a file input".into()));
        }
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.log(format!("files:{name}"));
            self.start_upload(&name);
        }
        Ok(())
    }

    async fn arm_file_chooser(&self) -> Result<(), AutomationError> {
        let mut state = self.state.lock().unwrap();
        state.chooser_armed = true;
        state.chooser_open = false;
        self.log("chooser-armed".to_string());
        Ok(())
    }

    async fn wait_file_chooser(&self, budget: Duration) -> Result<bool, AutomationError> {
        let started = Instant::now();
        loop {
            if self.state.lock().unwrap().chooser_open {
                return Ok(true);
            }
            if started.elapsed() >= budget {
                return Ok(false);
            }
            sleep(Duration::from_millis(2)).await;
        }
    }

    async fn fulfill_file_chooser(&self, path: &Path) -> Result<(), AutomationError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.log(format!("chooser-fulfilled:{name}"));
        self.start_upload(&name);
        {
            let mut state = self.state.lock().unwrap();
            state.chooser_armed = false;
            state.chooser_open = false;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AutomationError> {
        self.log("close".to_string());
        Ok(())
    }
}

/// Millisecond-scale tuning so bounded polls run in real time without
/// slowing the suite down.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        navigation_timeout: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(30),
        poll_interval: Duration::from_millis(3),
        suggestion_min_wait: Duration::from_millis(5),
        suggestion_max_wait: Duration::from_millis(40),
        between_recipients_pause: Duration::from_millis(2),
        before_chat_name_pause: Duration::from_millis(2),
        search_settle_wait: Duration::from_millis(5),
        search_suggestion_wait: Duration::from_millis(60),
        delivery_wait: Duration::from_millis(60),
        send_retries: 1,
        attach_upload_timeout: Duration::from_millis(80),
        attach_retries: 1,
        picker_type_delay: Duration::ZERO,
        type_delay: Duration::ZERO,
        ..EngineConfig::default()
    }
}

/// Standard chat-view fixture: composer, message pane and send button.
pub struct ChatView {
    pub composer: u64,
    pub pane: u64,
    pub send: u64,
}

pub fn add_chat_view(page: &FakePage) -> ChatView {
    let composer = page.add(
        NodeSpec::markers(&["div[contenteditable='true'][role='textbox']"]).kind("composer"),
    );
    let pane = page.add(NodeSpec::markers(&["[data-tid='messagePane']"]).kind("pane"));
    let send = page.add(
        NodeSpec::markers(&["button", "[data-tid='send-message-button']"])
            .kind("send")
            .attr("aria-label", "送信"),
    );
    ChatView {
        composer,
        pane,
        send,
    }
}

/// New-chat entry fixture: chat tab, new-chat button, picker field.
pub fn add_new_chat_entry(page: &FakePage) {
    page.add(
        NodeSpec::markers(&["[role='link']"])
            .kind("chat-tab")
            .attr("aria-label", "チャット"),
    );
    page.add(
        NodeSpec::markers(&["button"])
            .kind("new-chat")
            .attr("aria-label", "新しいチャット"),
    );
    page.add(
        NodeSpec::markers(&["[role='combobox']"])
            .kind("picker-field")
            .attr("aria-label", "宛先"),
    );
}
