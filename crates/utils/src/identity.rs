//! Binding of the signed `From:` address to the signing domain.
//!
//! A passing signature only proves that the signing domain vouches for
//! the message. Before a command may act on behalf of the `From:`
//! address, that address must belong to the very same domain.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::{normalize_address, split_address, SignedHeaderSet};

/// Result type for identity binding.
pub type BindingResult<T> = Result<T, BindingError>;

/// Errors that can occur while binding the sender identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    /// A header required by policy was not covered by the signature.
    #[error("Missing required signature: header {0} is not signed")]
    MissingRequiredSignature(String),
    /// The signed `From:` does not hold exactly one address.
    #[error("Ambiguous sender: {0} From addresses")]
    AmbiguousSender(usize),
    /// The `From:` address is not in the signing domain.
    #[error("Domain mismatch: {address} is not signed by {domain}")]
    DomainMismatch { address: String, domain: String },
}

/// The authenticated sender of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIdentity {
    pub address: String,
    pub domain: String,
}

/// Set of header names a signature must cover, `from` is always part of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredHeaders(BTreeSet<String>);

impl RequiredHeaders {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set: BTreeSet<String> = names
            .into_iter()
            .map(|name| name.as_ref().trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        set.insert("from".to_string());
        Self(set)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(&name.to_ascii_lowercase())
    }
}

impl Default for RequiredHeaders {
    fn default() -> Self {
        Self::new(["from", "to"])
    }
}

/// Binds the signed `From:` address to the signing domain.
///
/// Fails when a required header is not signed, when `From:` does not
/// hold exactly one address, or when that address belongs to another
/// domain than the one that signed.
pub fn bind(headers: &SignedHeaderSet, required: &RequiredHeaders) -> BindingResult<SenderIdentity> {
    if let Some(missing) = required.iter().find(|name| !headers.contains(name)) {
        return Err(BindingError::MissingRequiredSignature(missing.to_string()));
    }

    let from: Vec<_> = headers.mailboxes("from").collect();
    let [mailbox] = from.as_slice() else {
        return Err(BindingError::AmbiguousSender(from.len()));
    };

    let address = normalize_address(&mailbox.address);
    let domain = headers.domain();
    match split_address(&address) {
        Some((_, address_domain)) if address_domain.eq_ignore_ascii_case(domain) => {
            Ok(SenderIdentity {
                domain: address_domain.to_string(),
                address,
            })
        }
        _ => Err(BindingError::DomainMismatch {
            address,
            domain: domain.to_string(),
        }),
    }
}
