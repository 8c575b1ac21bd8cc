/// Returns the offset at which the body of a raw RFC 5322 message starts.
///
/// The header section ends at the first empty line, either `CRLF CRLF`
/// or a bare `LF LF` for messages that went through a Unix pipe. When no
/// blank line is present the whole message is considered headers and the
/// returned offset is the message length.
///
/// # Examples
///
/// ```rust
/// let raw = b"Subject: Hi\r\n\r\nBody";
/// assert_eq!(groupie_utils::body_offset(raw), 15);
/// assert_eq!(&raw[groupie_utils::body_offset(raw)..], b"Body");
/// ```
///
/// ```rust
/// assert_eq!(groupie_utils::body_offset(b"Subject: Hi\n\nBody"), 13);
/// assert_eq!(groupie_utils::body_offset(b"Subject: Hi\r\n"), 13);
/// ```
pub fn body_offset(raw: &[u8]) -> usize {
    let mut pos = 0;
    while pos < raw.len() {
        let end = raw[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i + 1)
            .unwrap_or(raw.len());
        let line = &raw[pos..end];
        if line == b"\r\n" || line == b"\n" {
            return end;
        }
        pos = end;
    }
    raw.len()
}

/// Returns the body section of a raw message, see [`body_offset`].
pub fn message_body(raw: &[u8]) -> &[u8] {
    &raw[body_offset(raw)..]
}

/// Removes the surrounding `<` and `>` of an envelope address, if any.
///
/// # Examples
///
/// ```rust
/// assert_eq!(groupie_utils::strip_angle_brackets(" <alice@arpa2.org> "), "alice@arpa2.org");
/// assert_eq!(groupie_utils::strip_angle_brackets("alice@arpa2.org"), "alice@arpa2.org");
/// ```
pub fn strip_angle_brackets(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(value)
        .trim()
}

/// Splits an address into its local-part and domain, using the last `@`.
///
/// Returns `None` when either side is empty.
///
/// # Examples
///
/// ```rust
/// assert_eq!(
///     groupie_utils::split_address("group+subscribe+news@arpa2.org"),
///     Some(("group+subscribe+news", "arpa2.org"))
/// );
/// assert_eq!(groupie_utils::split_address("@arpa2.org"), None);
/// assert_eq!(groupie_utils::split_address("alice"), None);
/// ```
pub fn split_address(address: &str) -> Option<(&str, &str)> {
    let (local, domain) = address.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local, domain))
}

/// Normalizes a mailbox address for comparison and storage.
///
/// Addresses are compared case-insensitively in the whole of the
/// directory, matching how deployed mail systems treat local-parts.
pub fn normalize_address(address: &str) -> String {
    strip_angle_brackets(address).to_ascii_lowercase()
}
