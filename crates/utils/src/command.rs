//! Group commands encoded in recipient addresses.
//!
//! Commands are addressed as `group+<verb>+<group-name>[+<member>]@<domain>`
//! where the domain must be one of the administrative domains served by
//! this instance. Only `subscribe` and `unsubscribe` take a member alias.

use std::{collections::HashSet, fmt::Display};

use thiserror::Error;

use crate::{split_address, strip_angle_brackets};

/// Literal first segment of every command local-part.
pub const COMMAND_MARKER: &str = "group";

/// Result type for command parsing.
pub type CommandResult<T> = Result<T, UnrecognizedCommand>;

/// The recipient address does not encode a known command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unrecognized command: {address} ({reason})")]
pub struct UnrecognizedCommand {
    pub address: String,
    pub reason: &'static str,
}

impl UnrecognizedCommand {
    fn new(address: &str, reason: &'static str) -> Self {
        Self {
            address: address.to_string(),
            reason,
        }
    }
}

/// Verbs of the group command language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Subscribe,
    Unsubscribe,
    Decline,
    Invite,
    Refuse,
    Welcome,
}

impl Verb {
    pub const ALL: [Verb; 6] = [
        Verb::Subscribe,
        Verb::Unsubscribe,
        Verb::Decline,
        Verb::Invite,
        Verb::Refuse,
        Verb::Welcome,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Subscribe => "subscribe",
            Verb::Unsubscribe => "unsubscribe",
            Verb::Decline => "decline",
            Verb::Invite => "invite",
            Verb::Refuse => "refuse",
            Verb::Welcome => "welcome",
        }
    }

    /// Parses a verb keyword, optionally ignoring ASCII case.
    pub fn parse(value: &str, case_sensitive: bool) -> Option<Self> {
        Self::ALL.into_iter().find(|verb| {
            if case_sensitive {
                verb.as_str() == value
            } else {
                verb.as_str().eq_ignore_ascii_case(value)
            }
        })
    }

    /// Whether the verb accepts a trailing member alias segment.
    pub fn takes_member(&self) -> bool {
        matches!(self, Verb::Subscribe | Verb::Unsubscribe)
    }

    /// Whether the verb reads its target addresses from the message body.
    pub fn takes_body(&self) -> bool {
        matches!(self, Verb::Invite | Verb::Refuse | Verb::Welcome)
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed group command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub group: String,
    pub member: Option<String>,
    pub domain: String,
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{COMMAND_MARKER}+{}+{}", self.verb, self.group)?;
        if let Some(member) = &self.member {
            write!(f, "+{member}")?;
        }
        write!(f, "@{}", self.domain)
    }
}

/// Decodes recipient addresses into [`Command`] values.
#[derive(Debug, Clone)]
pub struct CommandParser {
    domains: HashSet<String>,
    case_sensitive_verbs: bool,
    case_sensitive_groups: bool,
}

impl CommandParser {
    /// Creates a parser for the given administrative domains, with
    /// case-insensitive verbs and case-sensitive group names.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|domain| domain.as_ref().trim().to_ascii_lowercase())
                .collect(),
            case_sensitive_verbs: false,
            case_sensitive_groups: true,
        }
    }

    pub fn with_case_sensitivity(mut self, verbs: bool, groups: bool) -> Self {
        self.case_sensitive_verbs = verbs;
        self.case_sensitive_groups = groups;
        self
    }

    /// Returns whether the domain is administered by this parser.
    pub fn is_administrative(&self, domain: &str) -> bool {
        self.domains.contains(&domain.to_ascii_lowercase())
    }

    /// Parses a full recipient address, angle brackets allowed.
    pub fn parse(&self, recipient: &str) -> CommandResult<Command> {
        let address = strip_angle_brackets(recipient);
        let (local_part, domain) = split_address(address)
            .ok_or_else(|| UnrecognizedCommand::new(address, "not an address"))?;
        if !self.is_administrative(domain) {
            return Err(UnrecognizedCommand::new(address, "not an administrative domain"));
        }
        self.parse_local_part(local_part, domain)
            .map_err(|reason| UnrecognizedCommand::new(address, reason))
    }

    fn parse_local_part(&self, local_part: &str, domain: &str) -> Result<Command, &'static str> {
        // `+group+...` is an accepted notation as well
        let local_part = local_part.strip_prefix('+').unwrap_or(local_part);
        let segments: Vec<&str> = local_part.split('+').collect();

        let (marker, verb, group, member) = match segments.as_slice() {
            [marker, verb, group] => (*marker, *verb, *group, None),
            [marker, verb, group, member] => (*marker, *verb, *group, Some(*member)),
            _ => return Err("malformed command"),
        };
        if !marker.eq_ignore_ascii_case(COMMAND_MARKER) {
            return Err("missing group marker");
        }
        if group.is_empty() || member.is_some_and(str::is_empty) {
            return Err("empty segment");
        }

        let verb = Verb::parse(verb, self.case_sensitive_verbs).ok_or("unknown verb")?;
        if member.is_some() && !verb.takes_member() {
            return Err("verb takes no member");
        }

        let group = if self.case_sensitive_groups {
            group.to_string()
        } else {
            group.to_ascii_lowercase()
        };
        Ok(Command {
            verb,
            group,
            member: member.map(str::to_string),
            domain: domain.to_ascii_lowercase(),
        })
    }
}
