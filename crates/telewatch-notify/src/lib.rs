//! Outbound notification plumbing: the [`Transport`] seam, the debouncing
//! and rate-limited [`dispatcher::Dispatcher`], and the interactive control
//! command surface.

pub mod control;
pub mod dispatcher;
pub mod error;
pub mod telegram;
pub mod utils;


pub use error::NotifyError;

use async_trait::async_trait;

/// A chat backend: sends plain-text messages and surfaces inbound command
/// messages. The dispatcher never sees HTTP; anything that can do these
/// two things can carry notifications.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one text message; the implementation handles any length
    /// splitting its platform requires.
    async fn send(&self, text: &str) -> Result<(), NotifyError>;

    /// Drain inbound messages since the last poll. Command handling and
    /// filtering happen in the dispatcher, not here.
    async fn poll_commands(&self) -> Result<Vec<String>, NotifyError>;

    fn name(&self) -> &str;
}
