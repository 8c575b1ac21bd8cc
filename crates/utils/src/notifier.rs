//! Outbound invitations sent by the `invite` command.
//!
//! Notification failures never undo membership changes, the dispatcher
//! only reports them to the operator log.

use std::{future::Future, pin::Pin};

use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;
use tracing::{error, info};

use crate::{GroupKey, COMMAND_MARKER};

/// Length of generated activation codes.
pub const ACTIVATION_CODE_LENGTH: usize = 12;

/// Result type for notifier operations.
pub type NotifyResult<T> = Result<T, NotifyError>;

/// Boxed future type for notifier operations, enabling object safety.
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = NotifyResult<()>> + Send + 'a>>;

/// Errors that can occur while sending a notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// The notification could not be built, e.g. an invalid address.
    #[error("Message error: {0}")]
    Message(String),
    /// The notification could not be delivered.
    #[error("Delivery error: {0}")]
    Delivery(String),
}

/// Trait for notifiers delivering invitations.
pub trait Notifier: Send + Sync {
    /// Sends an invitation for `group` to `target`.
    fn send_invitation<'a>(
        &'a self,
        target: &'a str,
        group: &'a GroupKey,
        activation_code: Option<&'a str>,
    ) -> NotifyFuture<'a>;

    /// Returns the name of this notifier.
    fn name(&self) -> &str;
}

/// Generates a random alphanumeric activation code.
pub fn generate_activation_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ACTIVATION_CODE_LENGTH)
        .map(char::from)
        .collect()
}

/// Address a recipient writes to in order to join the group.
pub fn subscribe_address(group: &GroupKey) -> String {
    format!("{COMMAND_MARKER}+subscribe+{}@{}", group.name, group.domain)
}

/// Renders the plain text invitation body.
pub fn invitation_text(group: &GroupKey, activation_code: Option<&str>) -> String {
    let mut text = format!(
        "You have been invited to join the group {group}.\r\n\r\n\
         To accept, send a DKIM signed email to {}\r\n",
        subscribe_address(group)
    );
    if let Some(code) = activation_code {
        text.push_str(&format!("\r\nYour activation code is {code}\r\n"));
    }
    text
}

/// Notifier that only logs invitations, for deployments delivering
/// them by other means.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_invitation<'a>(
        &'a self,
        target: &'a str,
        group: &'a GroupKey,
        activation_code: Option<&'a str>,
    ) -> NotifyFuture<'a> {
        Box::pin(async move {
            info!(
                target_address = %target,
                group = %group,
                activation_code = activation_code.is_some(),
                "Invitation issued"
            );
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Notifier relaying invitations through an SMTP server.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl SmtpNotifier {
    /// Creates a new [`SmtpNotifier`] relaying in plain text to `relay:port`,
    /// meant for a local MTA that takes care of onward delivery.
    pub fn new(relay: &str, port: u16, from: String) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(relay)
            .port(port)
            .build();
        info!(relay = %relay, port = port, from = %from, "SMTP notifier initialized");
        Self { transport, from }
    }
}

impl Notifier for SmtpNotifier {
    fn send_invitation<'a>(
        &'a self,
        target: &'a str,
        group: &'a GroupKey,
        activation_code: Option<&'a str>,
    ) -> NotifyFuture<'a> {
        Box::pin(async move {
            let email = Message::builder()
                .from(
                    self.from
                        .parse()
                        .map_err(|e| NotifyError::Message(format!("Invalid from address: {e}")))?,
                )
                .to(target
                    .parse()
                    .map_err(|e| NotifyError::Message(format!("Invalid to address: {e}")))?)
                .subject(format!("Invitation to {group}"))
                .body(invitation_text(group, activation_code))
                .map_err(|e| NotifyError::Message(format!("Failed to build email: {e}")))?;

            self.transport.send(email).await.map_err(|e| {
                error!(target_address = %target, error = %e, "SMTP send failed");
                NotifyError::Delivery(e.to_string())
            })?;
            info!(target_address = %target, group = %group, "Invitation sent");
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}
