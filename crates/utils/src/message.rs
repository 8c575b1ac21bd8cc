//! Message types handed over by the transport.
//!
//! This module defines [`IncomingMessage`], the LMTP envelope wrapper
//! holding the untouched raw bytes of one delivery attempt. The bytes are
//! never rewritten, as DKIM verification depends on the exact byte
//! sequence the sender signed.

use std::net::IpAddr;

use uuid::Uuid;

use crate::message_body;

/// An incoming message with its envelope and connection metadata.
///
/// Exists only for the duration of one delivery, recipients keep the
/// order in which they were accepted so that per-recipient replies can
/// be written back in the same order.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Identifier used to correlate log lines of one delivery.
    pub id: String,

    /// Envelope sender address.
    pub from: String,

    /// Ordered envelope recipient addresses.
    pub rcpts: Vec<String>,

    /// Raw message data (headers + body), as received.
    raw: Vec<u8>,

    /// IP address of the connecting LMTP client.
    pub client_ip: Option<IpAddr>,

    /// LHLO domain presented by the connecting client.
    pub helo_domain: Option<String>,
}

impl IncomingMessage {
    pub fn new(from: String, rcpts: Vec<String>, raw: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from,
            rcpts,
            raw,
            client_ip: None,
            helo_domain: None,
        }
    }

    pub fn from_raw(from: &str, rcpts: &[&str], raw: &str) -> Self {
        Self::new(
            from.to_string(),
            rcpts.iter().map(|rcpt| rcpt.to_string()).collect(),
            raw.as_bytes().to_vec(),
        )
    }

    /// Returns the raw message exactly as it was received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Returns the unsigned body section of the message.
    ///
    /// Only meant for diagnostics, commands must read the body covered
    /// by the signature instead.
    pub fn body(&self) -> &[u8] {
        message_body(&self.raw)
    }

    /// Returns the size of the raw message in bytes.
    pub fn size(&self) -> usize {
        self.raw.len()
    }
}
