//! Target addresses of invite, refuse and welcome commands.
//!
//! These commands name their targets in the signed message body, one or
//! more per line, so only text covered by the signature is ever read.

use std::collections::HashSet;

use email_address::EmailAddress;

/// Separator introducing a signature block, content after it is ignored.
const SIGNATURE_SEPARATOR: &str = "-- ";

/// Extracts the target addresses of a body command from the signed body.
///
/// Each line may hold one or more entries separated by `,` or `;`, either
/// as a bare address or in the `Display Name <address>` form. Entries
/// that are not valid addresses are skipped, quoted lines (starting with
/// `>`) are ignored and extraction stops at a signature separator.
/// The result keeps the order of first appearance, with duplicates
/// (compared case-insensitively) removed.
///
/// # Examples
///
/// ```rust
/// let body = b"Please invite:\r\nalice@arpa2.org\r\nBob <bob@arpa2.org>, ALICE@arpa2.org\r\n";
/// assert_eq!(
///     groupie_utils::extract_addresses(body),
///     vec!["alice@arpa2.org".to_string(), "bob@arpa2.org".to_string()]
/// );
/// ```
pub fn extract_addresses(body: &[u8]) -> Vec<String> {
    let body = String::from_utf8_lossy(body);
    let mut seen = HashSet::new();
    let mut addresses = Vec::new();

    for line in body.lines() {
        if line.trim_end() == SIGNATURE_SEPARATOR.trim_end() {
            break;
        }
        if line.trim_start().starts_with('>') {
            continue;
        }
        for entry in line.split([',', ';']) {
            let Some(address) = entry_address(entry) else {
                continue;
            };
            if seen.insert(address.to_ascii_lowercase()) {
                addresses.push(address.to_ascii_lowercase());
            }
        }
    }
    addresses
}

/// Returns the address of a single entry, if it holds a valid one.
fn entry_address(entry: &str) -> Option<&str> {
    let entry = entry.trim();
    let candidate = match (entry.rfind('<'), entry.rfind('>')) {
        (Some(start), Some(end)) if start < end => &entry[start + 1..end],
        (None, None) => entry,
        _ => return None,
    };
    let candidate = candidate.trim().trim_start_matches("mailto:");
    EmailAddress::parse_with_options(candidate, Default::default())
        .is_ok()
        .then_some(candidate)
}
