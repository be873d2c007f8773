//! Browser session lifecycle.
//!
//! One session owns one page for exactly one run. All locators are created
//! through the session's resolver and die with it; teardown happens on
//! every exit path because the persistent profile is an exclusively-owned
//! resource.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::errors::AutomationError;
use crate::locator::Resolver;
use crate::page::PageEngine;
use crate::retry::PollPolicy;

pub struct Session {
    engine: Arc<dyn PageEngine>,
    config: Arc<EngineConfig>,
}

impl Session {
    /// Bind a session to an already-running engine. Tests attach their
    /// scripted engine here; production normally goes through
    /// [`Session::launch`].
    pub fn attach(engine: Arc<dyn PageEngine>, config: EngineConfig) -> Self {
        Self {
            engine,
            config: Arc::new(config),
        }
    }

    /// Launch a persistent-profile browser and bind a session to it.
    #[cfg(feature = "cdp")]
    pub async fn launch(config: EngineConfig) -> Result<Self, AutomationError> {
        let engine = crate::backends::cdp::CdpEngine::launch(&config).await?;
        Ok(Self::attach(engine, config))
    }

    pub fn engine(&self) -> Arc<dyn PageEngine> {
        self.engine.clone()
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.clone()
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(
            self.engine.clone(),
            PollPolicy::new(self.config.probe_timeout, self.config.poll_interval),
        )
    }

    /// Navigate to the app root and wait for it to settle.
    #[instrument(level = "debug", skip(self))]
    pub async fn ensure_ready(&self) -> Result<(), AutomationError> {
        self.engine
            .goto(&self.config.app_url, self.config.navigation_timeout)
            .await
            .map_err(|e| AutomationError::SessionError(format!("navigation failed: {e}")))?;
        self.engine
            .wait_until_settled(self.config.navigation_timeout)
            .await
            .map_err(|e| AutomationError::SessionError(format!("page never settled: {e}")))?;
        info!(url = %self.config.app_url, "session ready");
        Ok(())
    }

    /// Open the app so an operator can complete interactive sign-in into
    /// the persistent profile. The caller keeps the session alive until
    /// the operator is done, then closes it to flush the profile.
    pub async fn open_for_login(&self) -> Result<(), AutomationError> {
        self.ensure_ready().await
    }

    /// Tear down the page and browsing context.
    pub async fn close(self) -> Result<(), AutomationError> {
        self.engine.close().await
    }
}
