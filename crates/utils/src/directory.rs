//! Interface to the group directory holding membership state.
//!
//! The directory owns groups and members, the command pipeline only
//! reads the state of one address at a time and asks for a
//! [`Transition`] to be applied. Every `apply` call must be atomic,
//! concrete backends live in the [`directories`](crate::directories)
//! module.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    future::Future,
    pin::Pin,
};

use thiserror::Error;

/// Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;

/// Boxed future type for directory operations, enabling object safety.
pub type DirectoryFuture<'a, T> = Pin<Box<dyn Future<Output = DirectoryResult<T>> + Send + 'a>>;

/// Errors that can occur during directory operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The backing store failed.
    #[error("Storage error: {0}")]
    Storage(String),
    /// The transition is not valid for the current state.
    #[error("Conflict error: {0}")]
    Conflict(String),
}

/// Identifies a group by its administrative domain and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub domain: String,
    pub name: String,
}

impl GroupKey {
    pub fn new(domain: &str, name: &str) -> Self {
        Self {
            domain: domain.to_string(),
            name: name.to_string(),
        }
    }

    /// Routable address of a member alias, `<group>+<alias>@<domain>`.
    pub fn alias_address(&self, alias: &str) -> String {
        format!("{}+{alias}@{}", self.name, self.domain)
    }
}

impl Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.domain)
    }
}

/// Relationship of one address with one group.
///
/// The variants are exclusive, an address is never both a member and
/// declined or refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipState {
    None,
    Subscribed(String),
    Declined,
    Refused,
}

/// A member alias routed to its underlying mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub alias: String,
    pub mailbox: String,
}

/// State change requested for one (group, address) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Makes the address a member under `alias`, replacing a previous
    /// alias of the same address and clearing a decline.
    Subscribe { alias: String },
    /// Removes the membership and its routing alias, clearing a decline.
    Unsubscribe { alias: String },
    Decline,
    ClearDecline,
    /// Removes any membership and blocks resubscription.
    Refuse,
    /// Lifts a refusal.
    Welcome,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Subscribe { .. } => "subscribe",
            Transition::Unsubscribe { .. } => "unsubscribe",
            Transition::Decline => "decline",
            Transition::ClearDecline => "clear_decline",
            Transition::Refuse => "refuse",
            Transition::Welcome => "welcome",
        }
    }
}

/// Trait for group directories.
///
/// Implementations provide different storage backends, such as memory,
/// SQLite or a remote directory service. Addresses are passed already
/// normalized.
pub trait Directory: Send + Sync {
    /// Returns the state of an address within a group.
    fn get_state<'a>(
        &'a self,
        group: &'a GroupKey,
        address: &'a str,
    ) -> DirectoryFuture<'a, MembershipState>;

    /// Returns the mailbox an alias routes to, if the alias exists.
    fn alias_owner<'a>(
        &'a self,
        group: &'a GroupKey,
        alias: &'a str,
    ) -> DirectoryFuture<'a, Option<String>>;

    /// Lists the members of a group ordered by alias.
    fn members<'a>(&'a self, group: &'a GroupKey) -> DirectoryFuture<'a, Vec<Member>>;

    /// Applies a transition atomically.
    fn apply<'a>(
        &'a self,
        group: &'a GroupKey,
        address: &'a str,
        transition: Transition,
    ) -> DirectoryFuture<'a, ()>;

    /// Applies several transitions of one group as a single unit, either
    /// all of them take effect or none does.
    fn apply_batch<'a>(
        &'a self,
        group: &'a GroupKey,
        changes: Vec<(String, Transition)>,
    ) -> DirectoryFuture<'a, ()>;

    /// Returns the name of this directory.
    fn name(&self) -> &str;
}

/// In-memory image of one group, shared by the bundled backends to
/// keep transition rules in a single place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GroupRecord {
    pub members: BTreeMap<String, String>,
    pub declined: BTreeSet<String>,
    pub refused: BTreeSet<String>,
}

impl GroupRecord {
    pub fn state(&self, address: &str) -> MembershipState {
        if let Some(alias) = self.alias_of(address) {
            MembershipState::Subscribed(alias.to_string())
        } else if self.refused.contains(address) {
            MembershipState::Refused
        } else if self.declined.contains(address) {
            MembershipState::Declined
        } else {
            MembershipState::None
        }
    }

    pub fn alias_of(&self, address: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, mailbox)| mailbox.as_str() == address)
            .map(|(alias, _)| alias.as_str())
    }

    pub fn members(&self) -> Vec<Member> {
        self.members
            .iter()
            .map(|(alias, mailbox)| Member {
                alias: alias.clone(),
                mailbox: mailbox.clone(),
            })
            .collect()
    }

    /// Applies a sequence of transitions, leaving the record untouched
    /// if any of them fails.
    pub fn apply_all(&mut self, changes: &[(String, Transition)]) -> DirectoryResult<()> {
        let mut updated = self.clone();
        for (address, transition) in changes {
            updated.apply(address, transition)?;
        }
        *self = updated;
        Ok(())
    }

    /// Applies a transition, leaving the record untouched on error.
    pub fn apply(&mut self, address: &str, transition: &Transition) -> DirectoryResult<()> {
        match transition {
            Transition::Subscribe { alias } => {
                if self.refused.contains(address) {
                    return Err(DirectoryError::Conflict(format!("{address} is refused")));
                }
                match self.members.get(alias) {
                    Some(owner) if owner != address => {
                        return Err(DirectoryError::Conflict(format!(
                            "alias {alias} is taken"
                        )));
                    }
                    _ => {}
                }
                self.members.retain(|_, mailbox| mailbox != address);
                self.declined.remove(address);
                self.members.insert(alias.clone(), address.to_string());
            }
            Transition::Unsubscribe { alias } => {
                match self.members.get(alias) {
                    Some(owner) if owner != address => {
                        return Err(DirectoryError::Conflict(format!(
                            "alias {alias} belongs to another mailbox"
                        )));
                    }
                    Some(_) => {
                        self.members.remove(alias);
                    }
                    None => {}
                }
                self.declined.remove(address);
            }
            Transition::Decline => {
                if self.alias_of(address).is_some() || self.refused.contains(address) {
                    return Err(DirectoryError::Conflict(format!(
                        "{address} can not be declined in its current state"
                    )));
                }
                self.declined.insert(address.to_string());
            }
            Transition::ClearDecline => {
                self.declined.remove(address);
            }
            Transition::Refuse => {
                self.members.retain(|_, mailbox| mailbox != address);
                self.declined.remove(address);
                self.refused.insert(address.to_string());
            }
            Transition::Welcome => {
                self.refused.remove(address);
            }
        }
        Ok(())
    }
}
