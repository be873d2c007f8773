//! Run orchestration.
//!
//! A [`ChatRunner`] drives one complete send against one chat: open the
//! target (new group chat or existing chat), type the message, process
//! attachments, then send and confirm. The public entry point never
//! returns `Err`; every failure is folded into a [`RunReport`] so batch
//! callers always get per-run accounting.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::attach::{AttachOutcome, AttachmentReport, AttachmentState, AttachmentUploader};
use crate::composer::MessageComposer;
use crate::config::EngineConfig;
use crate::errors::AutomationError;
use crate::locator::Resolver;
use crate::page::PageEngine;
use crate::picker::RecipientPicker;
use crate::search::ChatDiscovery;
use crate::selector::Strategy;
use crate::send::{SendOrchestrator, SendOutcome};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    /// Compose a fresh chat from recipient addresses.
    NewChat,
    /// Open an already-existing chat through global search.
    ExistingChat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTarget {
    /// Display name: the search term for existing chats, the group name
    /// for new ones (empty means leave the default name).
    pub display_name: String,
    /// Addresses to add when creating a new chat. Ignored for existing
    /// chats.
    pub recipients: Vec<String>,
    pub mode: ChatMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendJob {
    pub target: ChatTarget,
    pub message: String,
    pub attachments: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    SentConfirmed,
    /// The send was attempted but no delivery evidence appeared. Not
    /// retried here: the message may well have gone out.
    SentUncertain,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub attachments: Vec<AttachmentReport>,
    /// True when at least one attachment failed but the message still went
    /// out under the send-without-file policy.
    pub sent_without_file: bool,
}

pub struct ChatRunner {
    engine: Arc<dyn PageEngine>,
    config: Arc<EngineConfig>,
    resolver: Resolver,
    composer: MessageComposer,
    picker: RecipientPicker,
    discovery: ChatDiscovery,
    uploader: AttachmentUploader,
    sender: SendOrchestrator,
}

impl ChatRunner {
    pub fn new(session: &Session) -> Self {
        Self {
            engine: session.engine(),
            config: session.config(),
            resolver: session.resolver(),
            composer: MessageComposer::new(session.resolver(), session.config()),
            picker: RecipientPicker::new(session),
            discovery: ChatDiscovery::new(session),
            uploader: AttachmentUploader::new(session),
            sender: SendOrchestrator::new(session),
        }
    }

    /// Execute one job end to end. Failures become `RunOutcome::Failed`;
    /// partial attachment results are preserved either way.
    #[instrument(level = "info", skip(self, session, job), fields(mode = ?job.target.mode, name = %job.target.display_name))]
    pub async fn run(&self, session: &Session, job: &SendJob) -> RunReport {
        let report = match self.run_inner(session, job).await {
            Ok(report) => report,
            Err((e, attachments)) => {
                warn!(error = %e, "run failed");
                RunReport {
                    outcome: RunOutcome::Failed(e.to_string()),
                    attachments,
                    sent_without_file: false,
                }
            }
        };
        if self.config.debug {
            debug!(?report, "run report");
        }
        report
    }

    async fn run_inner(
        &self,
        session: &Session,
        job: &SendJob,
    ) -> Result<RunReport, (AutomationError, Vec<AttachmentReport>)> {
        let fail = |e: AutomationError| (e, Vec::new());

        match job.target.mode {
            ChatMode::NewChat => self.open_new_chat(session, &job.target).await.map_err(fail)?,
            ChatMode::ExistingChat => {
                session.ensure_ready().await.map_err(fail)?;
                self.discovery
                    .open_existing_chat(&job.target.display_name)
                    .await
                    .map_err(fail)?;
            }
        }

        let composer = self.composer.wait_visible(15).await.map_err(fail)?;
        if !job.message.is_empty() {
            self.composer
                .type_message(&composer, &job.message)
                .await
                .map_err(fail)?;
        }

        let attach_outcome = if job.attachments.is_empty() {
            AttachOutcome {
                reports: Vec::new(),
                any_attached: false,
            }
        } else {
            match self.uploader.attach_all(&job.attachments).await {
                Ok(outcome) => outcome,
                // Abort policy: the uploader's own per-file accounting is
                // passed through untouched.
                Err((e, reports)) => return Err((e, reports)),
            }
        };

        let sent_without_file = attach_outcome
            .reports
            .iter()
            .any(|r| r.state != AttachmentState::Ready);

        let file_hint = attach_outcome
            .any_attached
            .then(|| {
                attach_outcome
                    .reports
                    .iter()
                    .find(|r| r.state == AttachmentState::Ready)
                    .map(|r| file_name(&r.path))
            })
            .flatten();
        let text_hint = (!job.message.is_empty()).then_some(job.message.as_str());

        let outcome = match self
            .sender
            .send_and_confirm(text_hint, file_hint.as_deref())
            .await
        {
            SendOutcome::Confirmed => RunOutcome::SentConfirmed,
            SendOutcome::Uncertain => RunOutcome::SentUncertain,
        };
        info!(outcome = ?outcome, "run complete");

        Ok(RunReport {
            outcome,
            attachments: attach_outcome.reports,
            sent_without_file,
        })
    }

    /// Create a fresh chat: chat tab, new-chat control, recipients one at
    /// a time, then an optional group name.
    async fn open_new_chat(
        &self,
        session: &Session,
        target: &ChatTarget,
    ) -> Result<(), AutomationError> {
        session.ensure_ready().await?;
        self.go_to_chat_tab().await;

        let new_chat = self
            .resolver
            .resolve_required(
                "new chat control",
                &vec![
                    Strategy::role("button", "新しいチャット|New chat"),
                    Strategy::role("link", "新しいチャット|New chat"),
                    Strategy::css("[data-tid='new-chat-button'], [data-tid='newChatButton']"),
                    Strategy::css(
                        "button[aria-label*='新しいチャット'], button[aria-label*='New chat']",
                    ),
                ],
            )
            .await?;
        new_chat.click().await?;

        let mut field = self.picker.wait_field(10).await?;
        for address in &target.recipients {
            self.picker.add_recipient(&field, address).await?;
            sleep(self.config.between_recipients_pause).await;
            // The picker re-renders after each confirmed chip.
            field = self
                .picker
                .refocus(Some(field))
                .await
                .ok_or_else(|| AutomationError::ElementNotFound("recipient picker field".into()))?;
        }

        if !target.display_name.is_empty() {
            self.set_chat_name_if_available(&target.display_name).await;
        }
        Ok(())
    }

    /// Navigate to the chat tab. Best effort: a run launched straight into
    /// the chat view has nothing to click.
    async fn go_to_chat_tab(&self) {
        let spec = vec![
            Strategy::role("link", "チャット|Chat"),
            Strategy::role("button", "チャット|Chat"),
            Strategy::css("[data-tid='app-bar-2']"),
        ];
        if let Some(tab) = self.resolver.resolve(&spec).await {
            if tab.click().await.is_ok() {
                debug!("chat tab opened");
                sleep(Duration::from_millis(300)).await;
            }
        }
    }

    /// Name the group chat when the UI offers an edit affordance. Naming
    /// is cosmetic, so every step here is best effort.
    async fn set_chat_name_if_available(&self, name: &str) {
        sleep(self.config.before_chat_name_pause).await;

        let open_spec = vec![
            Strategy::role(
                "button",
                "グループ名を追加|チャット名の編集|名前を追加|Add group name|Edit chat name|Add name",
            ),
            Strategy::css("[data-tid='chat-name-edit'], [data-tid='group-name-input-button']"),
        ];
        let Some(open) = self.resolver.resolve(&open_spec).await else {
            debug!("no chat-name affordance, keeping default name");
            return;
        };
        if open.click().await.is_err() {
            return;
        }

        let box_spec = vec![
            Strategy::role("textbox", "グループ名|チャット名|Name"),
            Strategy::css("input[placeholder*='グループ名'], input[placeholder*='Name']"),
        ];
        let Some(name_box) = self.resolver.resolve(&box_spec).await else {
            return;
        };
        if name_box.click().await.is_err() {
            return;
        }
        let _ = name_box.clear().await;
        if name_box.type_text(name, self.config.type_delay).await.is_err() {
            return;
        }

        let save_spec = vec![
            Strategy::role("button", "保存|適用|完了|Save|Apply|Done"),
            Strategy::css("[data-tid='save-button']"),
        ];
        match self.resolver.resolve(&save_spec).await {
            Some(save) => {
                let _ = save.click().await;
            }
            // Some renders commit the name when the input loses focus.
            None => {
                let _ = self.engine.press_key("Tab").await;
            }
        }
        debug!(name, "chat name set");
    }
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
