//! Authenticated command pipeline, one delivered message at a time.
//!
//! Verification and identity binding run once per message. A failure
//! there rejects every recipient and leaves the directory untouched.
//! Each recipient is then parsed and dispatched on its own, so one
//! message may be partially accepted. A recipient is only acted upon
//! when the signed `To:` or `Cc:` header names the same command.

use std::{fmt::Display, sync::Arc};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    bind, BindingError, Command, CommandParser, DispatchError, Dispatcher, IncomingMessage,
    RequiredHeaders, SenderIdentity, SignatureVerifier, SignedHeaderSet, UnrecognizedCommand,
    VerifyError,
};

/// Address headers whose signed mailboxes may carry commands.
const RECIPIENT_HEADERS: [&str; 2] = ["to", "cc"];

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Any failure of the pipeline, for one recipient or the whole message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("Sender error: {0} is not in an administrative domain")]
    ForeignSender(String),
    #[error(transparent)]
    Command(#[from] UnrecognizedCommand),
    #[error("Recipient error: {0} is not covered by the signature")]
    UnsignedRecipient(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl PipelineError {
    /// Maps the failure onto the reply sent back to the transport.
    pub fn rejection(&self) -> Rejection {
        let (code, status) = match self {
            PipelineError::Verify(VerifyError::Resolver(_)) => (451, "4.4.3"),
            PipelineError::Verify(_)
            | PipelineError::Binding(_)
            | PipelineError::ForeignSender(_)
            | PipelineError::UnsignedRecipient(_) => (550, "5.7.1"),
            PipelineError::Command(_) => (550, "5.1.1"),
            PipelineError::Dispatch(error) => match error {
                DispatchError::Refused { .. }
                | DispatchError::NotOwner(_)
                | DispatchError::NotAuthorized(_) => (550, "5.7.1"),
                DispatchError::AliasTaken(_) => (553, "5.1.3"),
                DispatchError::NotSubscribed { .. } => (550, "5.1.1"),
                DispatchError::AliasExhausted(_) | DispatchError::Directory(_) => (451, "4.3.0"),
            },
        };
        Rejection {
            code,
            status,
            reason: self.to_string(),
        }
    }
}

/// Negative reply for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: u16,
    pub status: &'static str,
    pub reason: String,
}

impl Rejection {
    /// Whether the transport may retry the delivery later.
    pub fn is_temporary(&self) -> bool {
        (400..500).contains(&self.code)
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.code, self.status, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Rejected(Rejection),
}

/// Outcome for one envelope recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientOutcome {
    pub recipient: String,
    pub outcome: Outcome,
}

/// What a passing signature vouches for in one message.
struct Authenticated {
    sender: SenderIdentity,
    body: Vec<u8>,
    commands: Vec<Command>,
}

/// Runs delivered messages through verification, binding, parsing and
/// dispatch.
pub struct Pipeline {
    verifier: Arc<dyn SignatureVerifier>,
    required: RequiredHeaders,
    parser: CommandParser,
    dispatcher: Dispatcher,
    require_local_senders: bool,
}

impl Pipeline {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        parser: CommandParser,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            verifier,
            required: RequiredHeaders::default(),
            parser,
            dispatcher,
            require_local_senders: false,
        }
    }

    pub fn with_required_headers(mut self, required: RequiredHeaders) -> Self {
        self.required = required;
        self
    }

    /// Restricts senders to the administrative domains.
    pub fn with_local_senders(mut self, require_local_senders: bool) -> Self {
        self.require_local_senders = require_local_senders;
        self
    }

    pub fn parser(&self) -> &CommandParser {
        &self.parser
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Processes one message, returning an outcome per recipient in
    /// envelope order.
    pub async fn deliver(&self, message: &IncomingMessage) -> Vec<RecipientOutcome> {
        let authenticated = match self.authenticate(message).await {
            Ok(authenticated) => authenticated,
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    from = %message.from,
                    verifier = self.verifier.name(),
                    error = %e,
                    "Message failed authentication"
                );
                let rejection = e.rejection();
                return message
                    .rcpts
                    .iter()
                    .map(|rcpt| RecipientOutcome {
                        recipient: rcpt.clone(),
                        outcome: Outcome::Rejected(rejection.clone()),
                    })
                    .collect();
            }
        };

        let mut outcomes = Vec::with_capacity(message.rcpts.len());
        for rcpt in &message.rcpts {
            let sender = &authenticated.sender;
            let outcome = match self.execute(&authenticated, rcpt).await {
                Ok(()) => Outcome::Accepted,
                Err(e @ PipelineError::Dispatch(DispatchError::Directory(_))) => {
                    error!(
                        message_id = %message.id,
                        sender = %sender.address,
                        rcpt = %rcpt,
                        error = %e,
                        "Directory failure"
                    );
                    Outcome::Rejected(e.rejection())
                }
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        sender = %sender.address,
                        rcpt = %rcpt,
                        error = %e,
                        "Command rejected"
                    );
                    Outcome::Rejected(e.rejection())
                }
            };
            outcomes.push(RecipientOutcome {
                recipient: rcpt.clone(),
                outcome,
            });
        }
        outcomes
    }

    /// Verifies the signature and binds the sender, collecting the
    /// signed body and the commands named in signed recipient headers.
    async fn authenticate(&self, message: &IncomingMessage) -> PipelineResult<Authenticated> {
        let verification = self.verifier.verify(message.raw()).await?;
        let sender = bind(&verification.headers, &self.required)?;
        if self.require_local_senders && !self.parser.is_administrative(&sender.domain) {
            return Err(PipelineError::ForeignSender(sender.address));
        }
        info!(
            message_id = %message.id,
            sender = %sender.address,
            domain = %verification.domain,
            "Sender authenticated"
        );
        Ok(Authenticated {
            sender,
            body: verification.headers.body().to_vec(),
            commands: self.signed_commands(&verification.headers),
        })
    }

    /// Commands addressed in the signed recipient headers, other
    /// mailboxes there are ignored.
    fn signed_commands(&self, headers: &SignedHeaderSet) -> Vec<Command> {
        RECIPIENT_HEADERS
            .iter()
            .flat_map(|name| headers.mailboxes(name))
            .filter_map(|mailbox| self.parser.parse(&mailbox.address).ok())
            .collect()
    }

    async fn execute(&self, authenticated: &Authenticated, rcpt: &str) -> PipelineResult<()> {
        let command = self.parser.parse(rcpt)?;
        if !authenticated.commands.contains(&command) {
            return Err(PipelineError::UnsignedRecipient(rcpt.to_string()));
        }
        self.dispatcher
            .dispatch(&authenticated.sender, &command, &authenticated.body)
            .await?;
        Ok(())
    }
}
