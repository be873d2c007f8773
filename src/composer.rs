//! Message composition.
//!
//! Typing never sends. A plain Enter in the composer would fire a send
//! before attachments are processed, so line breaks go in as Shift+Enter
//! and the send action stays with the orchestrator.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::EngineConfig;
use crate::errors::AutomationError;
use crate::locator::Resolver;
use crate::page::UiElement;
use crate::retry::PollPolicy;
use crate::selector::{LocatorSpec, Strategy};

pub fn message_box_spec() -> LocatorSpec {
    vec![
        Strategy::css("div[contenteditable='true'][role='textbox']"),
        Strategy::css("div[role='textbox'][aria-label*='メッセージ']"),
        Strategy::css("div[role='textbox'][aria-label*='message']"),
        Strategy::css("div[contenteditable='true']"),
        Strategy::css("[contenteditable='true']"),
    ]
}

#[derive(Clone)]
pub struct MessageComposer {
    config: Arc<EngineConfig>,
    resolver: Resolver,
}

impl MessageComposer {
    pub fn new(resolver: Resolver, config: Arc<EngineConfig>) -> Self {
        Self { config, resolver }
    }

    pub async fn find(&self) -> Option<UiElement> {
        self.resolver.resolve(&message_box_spec()).await
    }

    /// Wait for the composer to become visible. Used both after opening a
    /// chat (a click that silently failed to navigate must not count as
    /// success) and at composition time.
    pub async fn wait_visible(&self, attempts: u32) -> Result<UiElement, AutomationError> {
        let policy = PollPolicy::attempts(attempts, self.config.poll_interval * 2);
        policy
            .run(|| async {
                let el = self.find().await?;
                if el.is_visible().await {
                    Some(el)
                } else {
                    None
                }
            })
            .await
            .ok_or_else(|| AutomationError::ElementNotFound("message composer".into()))
    }

    /// Type multi-line text, preserving line breaks with Shift+Enter.
    #[instrument(level = "debug", skip(self, composer, text))]
    pub async fn type_message(
        &self,
        composer: &UiElement,
        text: &str,
    ) -> Result<(), AutomationError> {
        let lines: Vec<&str> = text.split('\n').collect();
        composer.click().await?;
        for (i, line) in lines.iter().enumerate() {
            if !line.is_empty() {
                composer.type_text(line, self.config.type_delay).await?;
            }
            if i + 1 < lines.len() {
                composer.engine().press_key("Shift+Enter").await?;
            }
        }
        debug!(lines = lines.len(), "message typed");
        Ok(())
    }

    /// Whether the composer holds no pending content. Both the rendered
    /// text and the tag-stripped HTML must be blank; the app leaves empty
    /// wrapper markup behind after a successful send.
    pub async fn is_empty(&self) -> bool {
        let Some(composer) = self.find().await else {
            return false;
        };
        let text = composer.text().await.unwrap_or_default();
        if !text.trim().is_empty() {
            return false;
        }
        let html = composer.html().await.unwrap_or_default();
        strip_tags(&html).trim().is_empty()
    }
}

fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_tags_reduces_wrapper_markup_to_nothing() {
        assert_eq!(strip_tags("<div><br></div>").trim(), "");
        assert_eq!(strip_tags("<p>hello</p>"), "hello");
    }
}
