//! DKIM signature verification for incoming commands.
//!
//! A message is only trusted once a DKIM signature over it passes; the
//! outcome of verification is a [`SignedHeaderSet`] holding exclusively
//! the headers covered by that signature. Everything downstream reads
//! headers through it and never through the raw message, so an attacker
//! can not add an unsigned `From:` next to a signed one and have it
//! picked up.

use std::{collections::HashMap, future::Future, pin::Pin};

use mail_auth::{
    common::headers::Writable, dkim::Canonicalization, AuthenticatedMessage, DkimResult,
    MessageAuthenticator,
};
use mail_parser::{Address, HeaderValue, MessageParser};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::message_body;

/// Synthetic entry holding the signing domain (`d=` tag).
pub const DOMAIN_KEY: &str = ":domain";

/// Synthetic entry holding the body bytes covered by the signature.
pub const BODY_KEY: &str = ":body";

/// Result type for verification operations.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Boxed future type for verifier operations, enabling object safety.
pub type VerifyFuture<'a> = Pin<Box<dyn Future<Output = VerifyResult<Verification>> + Send + 'a>>;

/// Errors that can occur while verifying a message signature.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    /// No signature on the message passed verification, carries the
    /// DKIM result of the first signature found (or `none`).
    #[error("Signature invalid: dkim={0}")]
    SignatureInvalid(String),
    /// The DNS resolver backing verification could not be created.
    #[error("Resolver error: {0}")]
    Resolver(String),
}

/// A parsed `(display-name, address)` pair from an address header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: String,
}

impl Mailbox {
    pub fn new(name: Option<&str>, address: &str) -> Self {
        Self {
            name: name.map(|name| name.to_string()),
            address: address.to_string(),
        }
    }
}

/// A single value of a signed header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignedValue {
    Mailbox(Mailbox),
    Text(String),
    Bytes(Vec<u8>),
}

/// Headers covered by a passing signature, keyed by lower-cased name.
///
/// Besides real header names it holds the synthetic [`DOMAIN_KEY`] and
/// [`BODY_KEY`] entries. A header name missing from the set means the
/// signature did not cover it, even if the message carries it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignedHeaderSet {
    headers: HashMap<String, Vec<SignedValue>>,
}

impl SignedHeaderSet {
    /// Creates a set with only the synthetic entries.
    pub fn new(domain: &str, body: &[u8]) -> Self {
        let mut headers = HashMap::new();
        headers.insert(
            DOMAIN_KEY.to_string(),
            vec![SignedValue::Text(domain.to_ascii_lowercase())],
        );
        headers.insert(BODY_KEY.to_string(), vec![SignedValue::Bytes(body.to_vec())]);
        Self { headers }
    }

    /// Builds the set for `raw`, restricted to the `signed` header names.
    ///
    /// DKIM signs header instances from the bottom of the header section
    /// upwards, a name listed `k` times covers the last `k` instances of
    /// that header. The body entry holds the whole raw body, see
    /// [`SignedHeaderSet::with_body`] to narrow it.
    ///
    /// Returns `None` when the message can not be parsed.
    pub fn from_message(raw: &[u8], domain: &str, signed: &[String]) -> Option<Self> {
        let message = MessageParser::default().parse(raw)?;

        let mut remaining: HashMap<String, usize> = HashMap::new();
        for name in signed {
            *remaining.entry(name.trim().to_ascii_lowercase()).or_default() += 1;
        }

        let mut covered = Vec::new();
        for header in message.headers().iter().rev() {
            let name = header.name().to_ascii_lowercase();
            if let Some(count) = remaining.get_mut(&name) {
                if *count > 0 {
                    *count -= 1;
                    covered.push((name, signed_values(header.value())));
                }
            }
        }

        let mut set = Self::new(domain, message_body(raw));
        for (name, values) in covered.into_iter().rev() {
            set.headers.entry(name).or_default().extend(values);
        }
        Some(set)
    }

    /// Replaces the body entry with the bytes a signature actually covers.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.headers
            .insert(BODY_KEY.to_string(), vec![SignedValue::Bytes(body)]);
        self
    }

    /// Adds a value for a header, marking the header as covered.
    pub fn insert(&mut self, name: &str, value: SignedValue) {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value);
    }

    /// Returns whether the signature covered the given header.
    pub fn contains(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    /// Returns the values of a header, empty when it was not covered.
    pub fn get(&self, name: &str) -> &[SignedValue] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Returns the mailboxes of an address header.
    pub fn mailboxes<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Mailbox> + 'a {
        self.get(name).iter().filter_map(|value| match value {
            SignedValue::Mailbox(mailbox) => Some(mailbox),
            _ => None,
        })
    }

    /// Returns the signing domain.
    pub fn domain(&self) -> &str {
        match self.get(DOMAIN_KEY).first() {
            Some(SignedValue::Text(domain)) => domain,
            _ => "",
        }
    }

    /// Returns the body bytes covered by the signature.
    pub fn body(&self) -> &[u8] {
        match self.get(BODY_KEY).first() {
            Some(SignedValue::Bytes(body)) => body,
            _ => &[],
        }
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub domain: String,
    pub headers: SignedHeaderSet,
}

/// Trait for signature verifiers, the first step of the command pipeline.
///
/// Implementations may perform async operations such as DNS key lookups
/// and must not have any other side effect.
pub trait SignatureVerifier: Send + Sync {
    /// Verifies the raw message, untouched as received.
    fn verify<'a>(&'a self, raw: &'a [u8]) -> VerifyFuture<'a>;

    /// Returns the name of this verifier.
    fn name(&self) -> &str;
}

/// Verifier checking DKIM signatures against keys published in DNS.
pub struct DkimVerifier {
    authenticator: MessageAuthenticator,
}

impl DkimVerifier {
    /// Creates a new [`DkimVerifier`].
    ///
    /// Initializes a DNS resolver from the system configuration,
    /// falling back to Cloudflare DNS-over-TLS if system config is unavailable.
    pub fn new() -> VerifyResult<Self> {
        let authenticator = match MessageAuthenticator::new_system_conf() {
            Ok(authenticator) => authenticator,
            Err(_) => {
                warn!("Failed to load system DNS config, falling back to Cloudflare TLS");
                MessageAuthenticator::new_cloudflare_tls()
                    .map_err(|e| VerifyError::Resolver(e.to_string()))?
            }
        };
        info!("DKIM verifier initialized");
        Ok(Self { authenticator })
    }
}

impl SignatureVerifier for DkimVerifier {
    fn verify<'a>(&'a self, raw: &'a [u8]) -> VerifyFuture<'a> {
        Box::pin(async move {
            let message = AuthenticatedMessage::parse(raw).ok_or_else(|| {
                debug!("Failed to parse message for DKIM verification");
                VerifyError::SignatureInvalid(format_dkim_result(&DkimResult::None).to_string())
            })?;

            let outputs = self.authenticator.verify_dkim(&message).await;
            let passed = outputs
                .iter()
                .find(|output| matches!(output.result(), DkimResult::Pass))
                .and_then(|output| output.signature());

            let Some(signature) = passed else {
                let result = outputs
                    .first()
                    .map(|output| format_dkim_result(output.result()))
                    .unwrap_or_else(|| format_dkim_result(&DkimResult::None));
                info!(signatures = outputs.len(), result = %result, "DKIM verification failed");
                return Err(VerifyError::SignatureInvalid(result.to_string()));
            };

            let body = raw.get(message.body_offset as usize..).unwrap_or_default();
            let headers = SignedHeaderSet::from_message(raw, &signature.d, &signature.h)
                .ok_or_else(|| VerifyError::SignatureInvalid("permerror".to_string()))?
                .with_body(canonical_body(body, signature.cb, signature.l));
            info!(
                domain = %signature.d,
                headers = ?signature.h,
                "DKIM verification passed"
            );
            Ok(Verification {
                domain: headers.domain().to_string(),
                headers,
            })
        })
    }

    fn name(&self) -> &str {
        "dkim"
    }
}

/// Verifier with a fixed outcome, for tests and local tooling without DNS.
///
/// When signing, the given header names are treated as covered by a
/// passing signature of `domain`.
pub struct StaticVerifier {
    domain: Option<String>,
    signed: Vec<String>,
}

impl StaticVerifier {
    pub fn signing(domain: &str, signed: &[&str]) -> Self {
        Self {
            domain: Some(domain.to_string()),
            signed: signed.iter().map(|name| name.to_string()).collect(),
        }
    }

    pub fn failing() -> Self {
        Self {
            domain: None,
            signed: Vec::new(),
        }
    }
}

impl SignatureVerifier for StaticVerifier {
    fn verify<'a>(&'a self, raw: &'a [u8]) -> VerifyFuture<'a> {
        Box::pin(async move {
            let domain = self
                .domain
                .as_deref()
                .ok_or_else(|| VerifyError::SignatureInvalid("fail".to_string()))?;
            let headers = SignedHeaderSet::from_message(raw, domain, &self.signed)
                .ok_or_else(|| VerifyError::SignatureInvalid("permerror".to_string()))?;
            Ok(Verification {
                domain: headers.domain().to_string(),
                headers,
            })
        })
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Canonicalizes a body the way its signature hashed it, `length` being
/// the `l=` tag (zero for the whole body).
///
/// The length counts raw body bytes before canonicalization, as the
/// verifier does, so the result is exactly the text the hash covered.
pub fn canonical_body(body: &[u8], canonicalization: Canonicalization, length: u64) -> Vec<u8> {
    let mut canonical = Vec::with_capacity(body.len());
    canonicalization
        .canonical_body(body, length)
        .write(&mut canonical);
    canonical
}

fn signed_values(value: &HeaderValue<'_>) -> Vec<SignedValue> {
    match value {
        HeaderValue::Address(address) => mailboxes(address)
            .into_iter()
            .map(SignedValue::Mailbox)
            .collect(),
        HeaderValue::Text(text) => vec![SignedValue::Text(text.to_string())],
        HeaderValue::TextList(list) => vec![SignedValue::Text(list.join(", "))],
        HeaderValue::DateTime(date) => vec![SignedValue::Text(date.to_rfc3339())],
        _ => Vec::new(),
    }
}

fn mailboxes(address: &Address<'_>) -> Vec<Mailbox> {
    let addrs: Vec<_> = match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|group| group.addresses.iter())
            .collect(),
    };
    addrs
        .into_iter()
        .filter_map(|addr| {
            Some(Mailbox::new(
                addr.name.as_deref(),
                addr.address.as_deref()?,
            ))
        })
        .collect()
}

fn format_dkim_result(result: &DkimResult) -> &'static str {
    match result {
        DkimResult::Pass => "pass",
        DkimResult::Fail(_) => "fail",
        DkimResult::Neutral(_) => "neutral",
        DkimResult::None => "none",
        DkimResult::TempError(_) => "temperror",
        DkimResult::PermError(_) => "permerror",
    }
}
