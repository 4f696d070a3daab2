use std::sync::Arc;

use async_trait::async_trait;
use habot_application::{ReplySender, UpdateProcessor};
use habot_core::AppResult;
use habot_domain::Update;
use tracing::debug;

pub(crate) const ACKNOWLEDGEMENT: &str = "Message Accepted";

/// Replies to every chat message with a fixed acknowledgement.
pub(crate) struct AcknowledgeProcessor {
    replies: Arc<dyn ReplySender>,
}

impl AcknowledgeProcessor {
    pub(crate) fn new(replies: Arc<dyn ReplySender>) -> Self {
        Self { replies }
    }
}

#[async_trait]
impl UpdateProcessor for AcknowledgeProcessor {
    async fn process(&self, update: &Update) -> AppResult<()> {
        let Some(chat_id) = update.chat_id() else {
            debug!(update_id = update.update_id(), "update has no chat, ignoring");
            return Ok(());
        };

        self.replies.send_reply(chat_id, ACKNOWLEDGEMENT).await;
        Ok(())
    }
}
