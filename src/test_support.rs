//! Shared fakes for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::services::mailer::{EmailMessage, MailError, Mailer};

#[derive(Default)]
struct RecordingState {
    attempts: u32,
    sent: Vec<EmailMessage>,
}

/// Mailer that records sent messages and can be told to fail
#[derive(Clone, Default)]
pub struct RecordingMailer {
    state: Arc<Mutex<RecordingState>>,
    // `None` never fails, `Some(u32::MAX)` always fails
    fail_first: Option<u32>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: u32) -> Self {
        Self {
            fail_first: Some(failures),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(u32::MAX)
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.state.lock().unwrap().sent.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;

        if let Some(failures) = self.fail_first {
            if state.attempts <= failures {
                return Err(MailError::ApiError("simulated outage".to_string()));
            }
        }

        state.sent.push(message.clone());
        Ok(())
    }
}
