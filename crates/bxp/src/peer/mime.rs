//! MIME entity header sub-layer.
//!
//! BEEP payloads are MIME entities (RFC 2045): optional headers, a blank
//! line, then the body. Frames are exposed to applications with the payload
//! narrowed to the body while the header collection is kept aside; see
//! [`crate::peer::frame::Frame::mime_process`].
//!
//! Header names are matched case-insensitively and the same name may occur
//! any number of times, so the collection is an insertion-ordered multimap.

/// Default Content-Type assumed when a frame carries none.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Default Content-Transfer-Encoding assumed when a frame carries none.
pub const DEFAULT_TRANSFER_ENCODING: &str = "binary";

/// Maximum length accepted for a header field name (RFC 2822 section 2.2).
const MAX_FIELD_NAME: usize = 998;

/// A single MIME entity header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimeHeader {
    name: String,
    content: String,
}

impl MimeHeader {
    /// The header field name as it appeared on the wire.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The header content, trimmed of surrounding whitespace. Folded
    /// continuation lines are preserved inside the content.
    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Insertion-ordered, case-insensitive MIME header collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeHeaders {
    headers: Vec<MimeHeader>,
}

impl MimeHeaders {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of headers stored, counting repeats.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check whether no headers are stored.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// First header content stored under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.content.as_str())
    }

    /// All header contents stored under `name`, in wire order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.content.as_str())
    }

    /// Number of times `name` occurs.
    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).count()
    }

    /// Iterate over every header in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &MimeHeader> {
        self.headers.iter()
    }

    /// Append a header. RFC 2045 allows a header name to be stored several
    /// times, so this never overwrites.
    pub fn set(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.headers.push(MimeHeader {
            name: name.into(),
            content: content.into(),
        });
    }

    /// Remove the first header stored under `name`. Returns whether a
    /// header was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        match self
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(idx) => {
                self.headers.remove(idx);
                true
            }
            None => false,
        }
    }

    /// On-wire size of these headers: each `Name: content\r\n` line plus the
    /// blank line terminator. An empty collection has size zero, because no
    /// terminator is emitted either.
    pub fn wire_size(&self) -> usize {
        if self.headers.is_empty() {
            return 0;
        }
        self.headers
            .iter()
            .map(|h| h.name.len() + 2 + h.content.len() + 2)
            .sum::<usize>()
            + 2
    }

    /// Write the headers and the blank line terminator into `out`.
    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        if self.headers.is_empty() {
            return;
        }
        for h in &self.headers {
            out.extend_from_slice(h.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(h.content.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }
}

/// Outcome of parsing the MIME layer off a received payload.
#[derive(Debug)]
pub(crate) struct MimeParse {
    pub headers: MimeHeaders,
    /// Offset where the body starts; everything before it is header bytes
    /// (including the blank line).
    pub body_offset: usize,
}

/// Parse the MIME headers at the start of `payload`.
///
/// Returns `Err(())` when the header section is malformed: a field name
/// byte outside the printable range 33..=126, a field name longer than 998
/// bytes, or a missing `:` separator. The caller abandons the MIME state in
/// that case; the raw payload is still usable.
pub(crate) fn parse(payload: &[u8]) -> std::result::Result<MimeParse, ()> {
    // Empty body fast path: the payload starts directly with the blank
    // line, so there are no headers to store.
    if payload.starts_with(b"\r\n") {
        return Ok(MimeParse {
            headers: MimeHeaders::new(),
            body_offset: 2,
        });
    }
    if payload.starts_with(b"\n") {
        return Ok(MimeParse {
            headers: MimeHeaders::new(),
            body_offset: 1,
        });
    }

    let mut headers = MimeHeaders::new();
    let mut at = 0;

    loop {
        if at >= payload.len() {
            // Ran out of payload without finding the body separator.
            return Err(());
        }

        // Blank line terminates the header section.
        if payload[at..].starts_with(b"\r\n") {
            return Ok(MimeParse {
                headers,
                body_offset: at + 2,
            });
        }
        if payload[at..].starts_with(b"\n") {
            return Ok(MimeParse {
                headers,
                body_offset: at + 1,
            });
        }

        at = read_header(payload, at, &mut headers)?;
    }
}

/// Read one `Name: content` line starting at `at`, appending to `headers`.
/// Returns the offset just past the terminating CRLF (or LF).
fn read_header(
    payload: &[u8],
    mut at: usize,
    headers: &mut MimeHeaders,
) -> std::result::Result<usize, ()> {
    // Field name: printable US-ASCII 33..=126, stopping at ':' or optional
    // whitespace before it.
    let name_start = at;
    while at < payload.len()
        && payload[at] != b':'
        && payload[at] != b' '
        && payload[at] != b'\t'
        && (33..=126).contains(&payload[at])
        && (at - name_start) < MAX_FIELD_NAME
    {
        at += 1;
    }

    if at >= payload.len() {
        return Err(());
    }
    if !(33..=126).contains(&payload[at]) && payload[at] != b' ' && payload[at] != b'\t' {
        return Err(());
    }
    if at - name_start >= MAX_FIELD_NAME {
        return Err(());
    }

    let name = std::str::from_utf8(&payload[name_start..at]).map_err(|_| ())?;
    if name.is_empty() {
        return Err(());
    }

    // Optional spaces before the separator, then the separator itself.
    while at < payload.len() && payload[at] == b' ' {
        at += 1;
    }
    if at >= payload.len() || payload[at] != b':' {
        return Err(());
    }
    at += 1;

    // Content runs until a CRLF (or bare LF) that is not followed by
    // whitespace; a following SP/HT folds the next line into this value.
    let content_start = at;
    loop {
        if at + 1 < payload.len() && payload[at] == b'\r' && payload[at + 1] == b'\n' {
            let next = payload.get(at + 2);
            if next != Some(&b' ') && next != Some(&b'\t') {
                break;
            }
        }
        if at < payload.len() && payload[at] == b'\n' {
            let next = payload.get(at + 1);
            if next != Some(&b' ') && next != Some(&b'\t') {
                break;
            }
        }
        if at >= payload.len() {
            break;
        }
        at += 1;
    }

    let content = String::from_utf8_lossy(&payload[content_start..at])
        .trim()
        .to_string();
    headers.set(name, content);

    // Skip the line terminator.
    if at < payload.len() && payload[at] == b'\n' {
        at += 1;
    } else {
        at += 2;
    }
    Ok(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_fast_path() {
        let parsed = parse(b"\r\nbody").unwrap();
        assert!(parsed.headers.is_empty());
        assert_eq!(parsed.body_offset, 2);

        let parsed = parse(b"\nbody").unwrap();
        assert!(parsed.headers.is_empty());
        assert_eq!(parsed.body_offset, 1);
    }

    #[test]
    fn test_single_header() {
        let parsed = parse(b"Content-Type: application/beep+xml\r\n\r\n<ok />").unwrap();
        assert_eq!(
            parsed.headers.get("content-type"),
            Some("application/beep+xml")
        );
        assert_eq!(
            parsed.body_offset,
            b"Content-Type: application/beep+xml\r\n\r\n".len()
        );
    }

    #[test]
    fn test_repeated_headers_keep_order() {
        let parsed = parse(b"Received: a\r\nReceived: b\r\n\r\n").unwrap();
        let values: Vec<&str> = parsed.headers.get_all("received").collect();
        assert_eq!(values, ["a", "b"]);
        assert_eq!(parsed.headers.count("Received"), 2);
    }

    #[test]
    fn test_folded_continuation() {
        let parsed = parse(b"Content-Description: a long\r\n value\r\n\r\n").unwrap();
        let content = parsed.headers.get("Content-Description").unwrap();
        assert!(content.starts_with("a long"));
        assert!(content.ends_with("value"));
    }

    #[test]
    fn test_lf_only_termination() {
        let parsed = parse(b"Content-ID: <x@y>\n\nbody").unwrap();
        assert_eq!(parsed.headers.get("Content-ID"), Some("<x@y>"));
        assert_eq!(parsed.body_offset, b"Content-ID: <x@y>\n\n".len());
    }

    #[test]
    fn test_name_outside_printable_range_rejected() {
        assert!(parse(b"Bad\x01Name: v\r\n\r\n").is_err());
    }

    #[test]
    fn test_missing_separator_rejected() {
        assert!(parse(b"NoSeparator v\r\n\r\n").is_err());
    }

    #[test]
    fn test_overlong_name_rejected() {
        let mut raw = vec![b'A'; 1200];
        raw.extend_from_slice(b": v\r\n\r\n");
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn test_wire_size() {
        let mut headers = MimeHeaders::new();
        assert_eq!(headers.wire_size(), 0);

        headers.set("Content-Type", "application/beep+xml");
        // "Content-Type: application/beep+xml\r\n" + "\r\n"
        assert_eq!(headers.wire_size(), 36 + 2);

        headers.remove("content-type");
        assert_eq!(headers.wire_size(), 0);
    }

    #[test]
    fn test_remove_first_occurrence_only() {
        let mut headers = MimeHeaders::new();
        headers.set("X-Tag", "one");
        headers.set("X-Tag", "two");
        assert!(headers.remove("x-tag"));
        assert_eq!(headers.get("X-Tag"), Some("two"));
        assert!(headers.remove("X-Tag"));
        assert!(!headers.remove("X-Tag"));
    }
}
