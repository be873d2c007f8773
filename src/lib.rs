//! Resilient automation engine for a web chat UI.
//!
//! The target application re-renders constantly, localizes its labels and
//! re-shuffles its markup between releases, so nothing here trusts a single
//! selector, a single keypress or a single click. Elements are described as
//! ordered fallback strategies ([`selector::Strategy`]), every action is
//! verified by visual evidence (chips, indicators, an emptied composer),
//! and every wait is a bounded poll.
//!
//! Controllers are organized around one send:
//!
//! - [`session::Session`] owns the page for exactly one run
//! - [`picker::RecipientPicker`] adds recipients and trusts only chips
//! - [`search::ChatDiscovery`] opens existing chats through suggestions
//! - [`composer::MessageComposer`] types text without ever sending
//! - [`attach::AttachmentUploader`] runs the upload state machine
//! - [`send::SendOrchestrator`] clicks send and confirms delivery
//! - [`runner::ChatRunner`] drives a whole job end to end
//!
//! Production runs against a real browser via the `cdp` feature; the
//! controllers themselves only see the [`page::PageEngine`] trait.

pub mod attach;
pub mod backends;
pub mod composer;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod locator;
pub mod page;
pub mod picker;
pub mod retry;
pub mod runner;
pub mod search;
pub mod selector;
pub mod send;
pub mod session;

pub use attach::{AttachOutcome, AttachmentReport, AttachmentState, AttachmentUploader};
pub use composer::MessageComposer;
pub use config::{AttachFailurePolicy, BrowserChannel, EngineConfig, HintTables};
pub use delivery::{DeliveryMonitor, DeliveryState};
pub use errors::AutomationError;
pub use locator::Resolver;
pub use page::{ElementHandle, PageEngine, Query, Rect, UiElement};
pub use picker::RecipientPicker;
pub use retry::{PollPolicy, TwoPhaseWait};
pub use runner::{ChatMode, ChatRunner, ChatTarget, RunOutcome, RunReport, SendJob};
pub use search::ChatDiscovery;
pub use selector::{LocatorSpec, Strategy};
pub use send::{SendOrchestrator, SendOutcome};
pub use session::Session;
