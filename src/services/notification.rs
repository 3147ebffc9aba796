//! Notification Boundary

use std::sync::Mutex;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::workflow::DataMap;

/// Sends templated messages (email, SMS, push) to a recipient.
///
/// `template` is the step's `notificationTemplate` as declared. The
/// dispatcher renders it against the instance scope and passes the result
/// as the `message` entry of `variables`, next to the step input.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send_templated(
        &self,
        recipient: &str,
        template: &str,
        variables: &DataMap,
    ) -> Result<(), DispatchError>;
}

/// One message handed to the notification boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub recipient: String,
    pub template: String,
    pub variables: DataMap,
}

/// Notification service that logs each message and keeps a copy.
#[derive(Debug, Default)]
pub struct LogNotificationService {
    sent: Mutex<Vec<SentNotification>>,
}

impl LogNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl NotificationService for LogNotificationService {
    async fn send_templated(
        &self,
        recipient: &str,
        template: &str,
        variables: &DataMap,
    ) -> Result<(), DispatchError> {
        let message = variables.get("message").and_then(|m| m.as_str()).unwrap_or(template);
        info!("Notify {} [{}]: {}", recipient, template, message);
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentNotification {
                recipient: recipient.to_string(),
                template: template.to_string(),
                variables: variables.clone(),
            });
        Ok(())
    }
}
