//! Notification rendering through a worklet.
//!
//! A [`NotificationService`] hands each incoming notification to a worklet
//! as a push, lets a [`NotificationDelegate`] turn the reply into the content
//! that is displayed, and tears the worklet down when the platform's time
//! budget runs out.
//!
//! # Flow
//!
//! ```text
//! did_receive(request)
//!   → push(JSON of request) ──► worklet
//!   ◄── reply bytes
//!   → delegate.on_reply(request, reply) → content_handler(content)
//! ```
//!
//! When the push fails, the original content is delivered unchanged.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::worklet::{Configuration, Engine, ScriptSource, WorkletBuilder, WorkletHost};

// ============================================================================
// Content Types
// ============================================================================

/// Displayable notification content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationContent {
    /// Headline.
    pub title: String,
    /// Secondary headline.
    pub subtitle: String,
    /// Message body.
    pub body: String,
    /// Badge count to show, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<u32>,
    /// Sound name, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
    /// Application payload.
    pub user_info: Value,
}

/// A notification awaiting rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Platform identifier of the notification.
    pub identifier: String,
    /// Content as delivered.
    pub content: NotificationContent,
}

// ============================================================================
// NotificationDelegate
// ============================================================================

/// Turns worklet replies into displayed content.
#[async_trait]
pub trait NotificationDelegate: Send + Sync {
    /// Renders the worklet's reply to `request`.
    async fn on_reply(&self, request: &NotificationRequest, reply: Vec<u8>)
    -> NotificationContent;

    /// Called when the time budget expires, before the worklet is torn down.
    fn on_time_budget_expired(&self) {}
}

/// Default delegate: the reply is the JSON of a [`NotificationContent`].
///
/// A reply that does not parse leaves the original content in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl NotificationDelegate for PassThrough {
    async fn on_reply(
        &self,
        request: &NotificationRequest,
        reply: Vec<u8>,
    ) -> NotificationContent {
        match serde_json::from_slice(&reply) {
            Ok(content) => content,
            Err(e) => {
                warn!(
                    identifier = %request.identifier,
                    error = %e,
                    "Reply is not notification content, keeping original"
                );
                request.content.clone()
            }
        }
    }
}

// ============================================================================
// NotificationService
// ============================================================================

/// Drives one worklet per notification extension.
pub struct NotificationService {
    host: WorkletHost,
    delegate: Arc<dyn NotificationDelegate>,
}

impl fmt::Debug for NotificationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationService")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl NotificationService {
    /// Creates the worklet described by `builder`.
    ///
    /// # Errors
    ///
    /// Any construction error of [`WorkletBuilder::create`].
    pub async fn new(builder: WorkletBuilder) -> Result<Self> {
        Ok(Self::from_host(builder.create().await?))
    }

    /// Creates the worklet from its parts, like [`WorkletHost::create`].
    ///
    /// # Errors
    ///
    /// Any construction error of [`WorkletHost::create`].
    pub async fn create(
        engine: Arc<dyn Engine>,
        source: ScriptSource,
        arguments: Vec<String>,
        configuration: Configuration,
    ) -> Result<Self> {
        let host = WorkletHost::create(engine, source, arguments, configuration).await?;
        Ok(Self::from_host(host))
    }

    /// Wraps an existing worklet.
    #[must_use]
    pub fn from_host(host: WorkletHost) -> Self {
        Self {
            host,
            delegate: Arc::new(PassThrough),
        }
    }

    /// Replaces the delegate.
    #[must_use]
    pub fn with_delegate(mut self, delegate: impl NotificationDelegate + 'static) -> Self {
        self.delegate = Arc::new(delegate);
        self
    }

    /// Sets the delegate; `None` restores [`PassThrough`].
    pub fn set_delegate(&mut self, delegate: Option<Arc<dyn NotificationDelegate>>) {
        self.delegate = delegate.unwrap_or_else(|| Arc::new(PassThrough));
    }

    /// Returns the worklet.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &WorkletHost {
        &self.host
    }

    /// Renders `request` through the worklet and delivers the result.
    ///
    /// `content_handler` is called exactly once.
    pub async fn did_receive<H>(&self, request: NotificationRequest, content_handler: H)
    where
        H: FnOnce(NotificationContent) + Send,
    {
        let reply = match serde_json::to_vec(&request) {
            Ok(payload) => self.host.push(payload).await,
            Err(e) => Err(e.into()),
        };

        let content = match reply {
            Ok(reply) => self.delegate.on_reply(&request, reply).await,
            Err(e) => {
                warn!(
                    identifier = %request.identifier,
                    error = %e,
                    "Worklet did not render notification"
                );
                request.content
            }
        };

        content_handler(content);
    }

    /// Notifies the delegate and terminates the worklet.
    pub async fn time_will_expire(&self) {
        debug!(worklet = %self.host.id(), "Notification time budget expired");
        self.delegate.on_time_budget_expired();
        self.host.terminate().await;
    }
}

// ============================================================================
// Tests
// ============================================================================
