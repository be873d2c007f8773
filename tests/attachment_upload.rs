//! Attachment state machine: three readiness signals, bounded retries,
//! failure policies.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chatpilot::errors::AutomationError;
use chatpilot::{
    AttachFailurePolicy, AttachmentState, AttachmentUploader, EngineConfig, Session, Strategy,
};
use common::{add_chat_view, test_config, ChatView, FakePage, NodeSpec, Script, SpinnerMode};

fn setup(script: Script, config: EngineConfig) -> (Arc<FakePage>, Session, ChatView) {
    let page = FakePage::new(script);
    let view = add_chat_view(&page);
    let session = Session::attach(page.clone(), config);
    (page, session, view)
}

fn add_file_input(page: &FakePage, pane: u64) {
    page.add(
        NodeSpec::markers(&["input[type='file']"])
            .kind("file-input")
            .parent(pane),
    );
}

#[tokio::test]
async fn ready_requires_the_spinner_to_clear() {
    let (page, session, view) = setup(
        Script {
            spinner: SpinnerMode::Clears(Duration::from_millis(20)),
            ..Script::default()
        },
        test_config(),
    );
    add_file_input(&page, view.pane);
    let uploader = AttachmentUploader::new(&session);

    let outcome = uploader
        .attach_all(&[PathBuf::from("report.xlsx")])
        .await
        .expect("upload should complete");

    assert!(outcome.any_attached);
    assert_eq!(outcome.reports[0].state, AttachmentState::Ready);
    assert_eq!(outcome.reports[0].attempts, 1);
    // Ready was only declared after the progress indicator went away.
    let resolver = session.resolver();
    assert_eq!(
        resolver
            .count(None, &Strategy::css("[role='progressbar']"))
            .await,
        0
    );
}

#[tokio::test]
async fn stuck_spinner_exhausts_retries_under_send_without_file() {
    let (page, session, view) = setup(
        Script {
            spinner: SpinnerMode::Stuck,
            ..Script::default()
        },
        test_config(),
    );
    add_file_input(&page, view.pane);
    let uploader = AttachmentUploader::new(&session);

    let outcome = uploader
        .attach_all(&[PathBuf::from("案内.pdf")])
        .await
        .expect("send-without-file policy keeps the run alive");

    assert!(!outcome.any_attached);
    assert_eq!(outcome.reports[0].state, AttachmentState::Failed);
    assert_eq!(outcome.reports[0].attempts, 2);
    assert!(page.count_events("files:案内.pdf") >= 1);
}

#[tokio::test]
async fn abort_policy_fails_the_batch() {
    // No attach affordance exists at all, so the first file fails fast.
    let mut config = test_config();
    config.attach_failure_policy = AttachFailurePolicy::Abort;
    let (_page, session, _view) = setup(Script::default(), config);
    let uploader = AttachmentUploader::new(&session);

    let (err, reports) = uploader
        .attach_all(&[PathBuf::from("a.txt"), PathBuf::from("b.txt")])
        .await
        .unwrap_err();
    assert!(matches!(err, AutomationError::UploadFailed(_)));
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].state, AttachmentState::Failed);
    // The second file was never reached.
    assert_eq!(reports[1].state, AttachmentState::Pending);
    assert_eq!(reports[1].attempts, 0);
}

#[tokio::test]
async fn abort_report_keeps_the_real_attempt_count() {
    let mut config = test_config();
    config.attach_failure_policy = AttachFailurePolicy::Abort;
    let (page, session, view) = setup(
        Script {
            spinner: SpinnerMode::Stuck,
            ..Script::default()
        },
        config,
    );
    add_file_input(&page, view.pane);
    let uploader = AttachmentUploader::new(&session);

    let (err, reports) = uploader
        .attach_all(&[PathBuf::from("案内.pdf"), PathBuf::from("b.txt")])
        .await
        .unwrap_err();
    assert!(matches!(err, AutomationError::UploadFailed(_)));

    // Every real injection shows up in the report, not a flat zero.
    assert_eq!(reports[0].state, AttachmentState::Failed);
    assert_eq!(reports[0].attempts, 2);
    assert_eq!(
        page.count_events("files:案内.pdf"),
        reports[0].attempts as usize
    );
    assert_eq!(reports[1].state, AttachmentState::Pending);
    assert_eq!(reports[1].attempts, 0);
}

#[tokio::test]
async fn menu_path_injects_through_the_intercepted_chooser() {
    let (page, session, _view) = setup(Script::default(), test_config());
    page.add(
        NodeSpec::markers(&["button[aria-label*='ファイルを添付']"])
            .kind("attach-button")
            .attr("aria-label", "ファイルを添付"),
    );
    let uploader = AttachmentUploader::new(&session);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("報告書.xlsx");
    std::fs::write(&path, b"stub").unwrap();

    let outcome = uploader.attach_all(&[path]).await.unwrap();
    assert!(outcome.any_attached);
    assert_eq!(outcome.reports[0].state, AttachmentState::Ready);
    assert_eq!(page.count_events("chooser-armed"), 1);
    assert_eq!(page.count_events("chooser-fulfilled:報告書.xlsx"), 1);
}
