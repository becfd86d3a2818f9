//! BEEP frame codec.
//!
//! A frame on the wire is a header line terminated by CRLF, a payload of
//! exactly `size` bytes, and the literal trailer `END\r\n`:
//!
//! ```text
//! MSG 1 0 . 0 12\r\nHello, peer!END\r\n
//! ```
//!
//! Data frame headers are `TYPE channel msgno moreChar seqno size[ ansno]`
//! with `ansno` present only on ANS frames. Flow control frames use the
//! shorter `SEQ channel ackno window` grammar and never carry a payload.
//!
//! The payload is a MIME entity; [`Frame::mime_process`] narrows the frame
//! payload to the MIME body while keeping the full content reachable. The
//! `size` field always advertises headers plus body, so
//! `size + mime_headers_size` equals the advertised on-wire length after
//! narrowing.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use winnow::prelude::*;
use winnow::token::{take, take_while};

use super::channel::Channel;
use super::error::{Error, Result};
use super::mime::{self, DEFAULT_CONTENT_TYPE, DEFAULT_TRANSFER_ENCODING, MimeHeaders};

/// Frame trailer closing every BEEP frame.
pub const FRAME_TRAILER: &[u8] = b"END\r\n";

/// BEEP frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Message carrying application data.
    Msg,
    /// Positive reply to a message.
    Rpy,
    /// One answer in a one-to-many exchange.
    Ans,
    /// Terminator of a one-to-many exchange.
    Nul,
    /// Negative reply to a message.
    Err,
    /// Flow control frame.
    Seq,
    /// Unrecognized type tag; decoding one closes the session.
    Unknown,
}

impl FrameType {
    /// Map a 3-byte wire tag to a frame type.
    pub fn from_tag(tag: &[u8]) -> FrameType {
        match tag {
            b"MSG" => FrameType::Msg,
            b"RPY" => FrameType::Rpy,
            b"ANS" => FrameType::Ans,
            b"NUL" => FrameType::Nul,
            b"ERR" => FrameType::Err,
            b"SEQ" => FrameType::Seq,
            _ => FrameType::Unknown,
        }
    }

    /// The 3-byte wire tag for this type.
    pub fn tag(self) -> &'static str {
        match self {
            FrameType::Msg => "MSG",
            FrameType::Rpy => "RPY",
            FrameType::Ans => "ANS",
            FrameType::Nul => "NUL",
            FrameType::Err => "ERR",
            FrameType::Seq => "SEQ",
            FrameType::Unknown => "???",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Parsed header line, before any channel or window validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawHeader {
    pub kind: FrameType,
    pub channel: u32,
    pub msgno: u32,
    /// The literal byte observed in the continuation slot, kept for
    /// diagnostics; `*` and `.` are the only valid values.
    pub more_char: u8,
    pub seqno: u32,
    pub size: usize,
    pub ansno: Option<u32>,
}

/// Decimal field with the character whitelist the wire grammar allows:
/// digits terminated by space or CR. Any other byte poisons the header.
fn decimal_u32(input: &mut &[u8]) -> winnow::ModalResult<u32> {
    let digits: &[u8] = take_while(1..=10, |b: u8| b.is_ascii_digit()).parse_next(input)?;
    let mut value: u64 = 0;
    for d in digits {
        value = value * 10 + u64::from(d - b'0');
    }
    if value > u64::from(u32::MAX) {
        return Err(winnow::error::ErrMode::Cut(
            winnow::error::ContextError::new(),
        ));
    }
    Ok(value as u32)
}

fn space(input: &mut &[u8]) -> winnow::ModalResult<u8> {
    winnow::token::one_of(b' ').parse_next(input)
}

fn crlf(input: &mut &[u8]) -> winnow::ModalResult<()> {
    winnow::token::literal("\r\n").void().parse_next(input)
}

/// Field parser for data frames: `channel msgno moreChar seqno size[ ansno]`.
fn data_fields(kind: FrameType) -> impl FnMut(&mut &[u8]) -> winnow::ModalResult<RawHeader> {
    move |input: &mut &[u8]| {
        let channel = decimal_u32.parse_next(input)?;
        space.parse_next(input)?;
        let msgno = decimal_u32.parse_next(input)?;
        space.parse_next(input)?;
        let more_char: &[u8] = take(1usize).parse_next(input)?;
        let more_char = more_char[0];
        space.parse_next(input)?;
        let seqno = decimal_u32.parse_next(input)?;
        space.parse_next(input)?;
        let size = decimal_u32.parse_next(input)? as usize;
        let ansno = if kind == FrameType::Ans {
            space.parse_next(input)?;
            Some(decimal_u32.parse_next(input)?)
        } else {
            None
        };
        crlf.parse_next(input)?;
        Ok(RawHeader {
            kind,
            channel,
            msgno,
            more_char,
            seqno,
            size,
            ansno,
        })
    }
}

/// Field parser for SEQ frames: `channel ackno window`. The acknowledged
/// sequence number lands in `seqno` and the window in `size`.
fn seq_fields(input: &mut &[u8]) -> winnow::ModalResult<RawHeader> {
    let channel = decimal_u32.parse_next(input)?;
    space.parse_next(input)?;
    let ackno = decimal_u32.parse_next(input)?;
    space.parse_next(input)?;
    let window = decimal_u32.parse_next(input)? as usize;
    crlf.parse_next(input)?;
    Ok(RawHeader {
        kind: FrameType::Seq,
        channel,
        msgno: 0,
        more_char: b'.',
        seqno: ackno,
        size: window,
        ansno: None,
    })
}

/// Parse a complete header line (including the trailing CRLF).
///
/// The type tag is dispatched first: an unknown tag is reported separately
/// from a malformed field so the session can record the right diagnostic.
pub(crate) fn parse_header(line: &[u8]) -> Result<RawHeader> {
    if line.len() < 4 {
        return Err(Error::protocol("poorly-formed frame: header too short"));
    }
    let kind = FrameType::from_tag(&line[..3]);
    if kind == FrameType::Unknown {
        return Err(Error::protocol(
            "poorly-formed frame: message type not defined",
        ));
    }
    if line[3] != b' ' {
        return Err(Error::protocol("poorly-formed frame: missing separator"));
    }

    let mut fields = &line[4..];
    let header = if kind == FrameType::Seq {
        seq_fields.parse_next(&mut fields)
    } else {
        data_fields(kind).parse_next(&mut fields)
    };
    match header {
        Ok(h) if fields.is_empty() => Ok(h),
        _ => Err(Error::protocol(
            "poorly-formed frame: message values are wrong",
        )),
    }
}

/// Push an unsigned decimal without leading zeros.
fn push_uint(out: &mut Vec<u8>, value: u64) {
    let mut scratch = [0u8; 20];
    let mut at = scratch.len();
    let mut v = value;
    loop {
        at -= 1;
        scratch[at] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    out.extend_from_slice(&scratch[at..]);
}

/// MIME processing state of a frame.
#[derive(Debug, Clone, Default)]
enum MimeState {
    /// Headers were never looked at; accessors synthesize the BEEP
    /// defaults.
    #[default]
    Unparsed,
    /// Headers parsed (possibly empty). Shared between copies and joins.
    Parsed(Arc<MimeHeaders>),
    /// The header section was malformed; accessors return nothing, the raw
    /// payload stays usable.
    Failed,
}

/// A BEEP frame.
///
/// Frames are produced by the session decoder or built by application code
/// for the outbound path. Identifiers are assigned per context and only
/// serve diagnostics.
#[derive(Debug, Clone)]
pub struct Frame {
    id: u64,
    kind: FrameType,
    channel: u32,
    msgno: u32,
    more: bool,
    more_char: u8,
    seqno: u32,
    size: usize,
    ansno: Option<u32>,
    /// MIME body once processed, full payload before that.
    payload: Bytes,
    /// Entire on-wire payload, headers included.
    content: Bytes,
    mime: MimeState,
    mime_headers_size: usize,
    channel_ref: Option<Channel>,
}

impl Frame {
    /// Build an outbound frame around a payload.
    pub fn new(
        id: u64,
        kind: FrameType,
        channel: u32,
        msgno: u32,
        more: bool,
        seqno: u32,
        ansno: Option<u32>,
        payload: impl Into<Bytes>,
    ) -> Frame {
        let payload: Bytes = payload.into();
        Frame {
            id,
            kind,
            channel,
            msgno,
            more,
            more_char: if more { b'*' } else { b'.' },
            seqno,
            size: payload.len(),
            ansno,
            content: payload.clone(),
            payload,
            mime: MimeState::Unparsed,
            mime_headers_size: 0,
            channel_ref: None,
        }
    }

    /// Build a SEQ frame object. `seqno` carries the acknowledged sequence
    /// number and `size` the advertised window.
    pub fn seq(id: u64, channel: u32, ackno: u32, window: u32) -> Frame {
        Frame {
            id,
            kind: FrameType::Seq,
            channel,
            msgno: 0,
            more: false,
            more_char: b'.',
            seqno: ackno,
            size: window as usize,
            ansno: None,
            payload: Bytes::new(),
            content: Bytes::new(),
            mime: MimeState::Unparsed,
            mime_headers_size: 0,
            channel_ref: None,
        }
    }

    /// Assemble a decoded frame from its parsed header and payload bytes.
    pub(crate) fn from_wire(id: u64, header: RawHeader, payload: Bytes) -> Frame {
        Frame {
            id,
            kind: header.kind,
            channel: header.channel,
            msgno: header.msgno,
            more: header.more_char == b'*',
            more_char: header.more_char,
            seqno: header.seqno,
            size: payload.len(),
            ansno: header.ansno,
            content: payload.clone(),
            payload,
            mime: MimeState::Unparsed,
            mime_headers_size: 0,
            channel_ref: None,
        }
    }

    /// Decode one complete frame from `buf`, returning it together with the
    /// number of bytes consumed. MIME headers of data frames are processed.
    ///
    /// The session read path decodes incrementally instead (header line
    /// first, then exactly `size + 5` bytes); this entry point serves
    /// buffers that already hold the full frame.
    pub fn decode(id: u64, buf: &[u8]) -> Result<(Frame, usize)> {
        let line_end = buf
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| Error::protocol("no line definition found for frame"))?;
        let header = parse_header(&buf[..line_end + 2])?;

        if header.kind == FrameType::Seq {
            let seq = Frame::seq(id, header.channel, header.seqno, header.size as u32);
            return Ok((seq, line_end + 2));
        }
        if header.more_char != b'*' && header.more_char != b'.' {
            return Err(Error::protocol("poorly-formed frame: more char is wrong"));
        }

        let body_start = line_end + 2;
        let total = header.size + FRAME_TRAILER.len();
        if buf.len() < body_start + total {
            return Err(Error::protocol("frame payload is truncated"));
        }
        let trailer = &buf[body_start + header.size..body_start + total];
        if trailer != FRAME_TRAILER {
            return Err(Error::protocol(
                "poorly formed frame: frame trailer CR LF not found",
            ));
        }

        let payload = Bytes::copy_from_slice(&buf[body_start..body_start + header.size]);
        let mut frame = Frame::from_wire(id, header, payload);
        frame.mime_process();
        Ok((frame, body_start + total))
    }

    /// Frame identifier, unique per context.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Frame type.
    pub fn kind(&self) -> FrameType {
        self.kind
    }

    /// Channel number this frame belongs to.
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Message number.
    pub fn msgno(&self) -> u32 {
        self.msgno
    }

    /// Whether more fragments of the same message follow.
    pub fn more(&self) -> bool {
        self.more
    }

    /// The literal continuation byte observed on the wire (`*` or `.`).
    pub fn more_char(&self) -> u8 {
        self.more_char
    }

    /// Sequence number: cumulative payload octet count on this channel.
    /// For SEQ frames this is the acknowledged sequence number.
    pub fn seqno(&self) -> u32 {
        self.seqno
    }

    /// Payload size. After MIME processing this is the body size; for SEQ
    /// frames it carries the advertised window.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Answer number, present on ANS frames only.
    pub fn ansno(&self) -> Option<u32> {
        self.ansno
    }

    /// The payload: MIME body once processed, raw payload before that.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The entire on-wire payload, MIME headers included.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Size of the full on-wire payload as advertised in the header.
    pub fn content_size(&self) -> usize {
        self.size + self.mime_headers_size
    }

    /// Size of the MIME header section, zero when none was present.
    pub fn mime_headers_size(&self) -> usize {
        self.mime_headers_size
    }

    /// The channel this frame was attached to while decoding.
    pub fn channel_ref(&self) -> Option<&Channel> {
        self.channel_ref.as_ref()
    }

    pub(crate) fn set_channel_ref(&mut self, channel: Channel) {
        self.channel_ref = Some(channel);
    }

    // ------------------------------------------------------------------
    // MIME layer
    // ------------------------------------------------------------------

    /// Parse the MIME headers off the payload, narrowing `payload`/`size`
    /// to the body. Runs once; repeated calls are no-ops. Returns whether a
    /// MIME state is available afterwards.
    ///
    /// SEQ frames carry no MIME layer and are left untouched.
    pub fn mime_process(&mut self) -> bool {
        if self.kind == FrameType::Seq {
            return false;
        }
        match self.mime {
            MimeState::Parsed(_) => return true,
            MimeState::Failed => return false,
            MimeState::Unparsed => {}
        }
        match mime::parse(&self.payload) {
            Ok(parsed) => {
                self.mime_headers_size = parsed.body_offset;
                self.size -= parsed.body_offset;
                self.payload = self.content.slice(parsed.body_offset..);
                self.mime = MimeState::Parsed(Arc::new(parsed.headers));
                true
            }
            Err(()) => {
                self.mime = MimeState::Failed;
                false
            }
        }
    }

    /// Whether a usable MIME state is attached to this frame.
    pub fn mime_available(&self) -> bool {
        matches!(self.mime, MimeState::Parsed(_))
    }

    /// Content-Type of the frame, defaulting to `application/octet-stream`
    /// when none was observed. Returns `None` only when MIME parsing
    /// failed.
    pub fn content_type(&self) -> Option<&str> {
        match &self.mime {
            MimeState::Failed => None,
            MimeState::Unparsed => Some(DEFAULT_CONTENT_TYPE),
            MimeState::Parsed(h) => Some(h.get("Content-Type").unwrap_or(DEFAULT_CONTENT_TYPE)),
        }
    }

    /// Content-Transfer-Encoding of the frame, defaulting to `binary` when
    /// none was observed. Returns `None` only when MIME parsing failed.
    pub fn transfer_encoding(&self) -> Option<&str> {
        match &self.mime {
            MimeState::Failed => None,
            MimeState::Unparsed => Some(DEFAULT_TRANSFER_ENCODING),
            MimeState::Parsed(h) => Some(
                h.get("Content-Transfer-Encoding")
                    .unwrap_or(DEFAULT_TRANSFER_ENCODING),
            ),
        }
    }

    /// First content stored under a MIME header name, case-insensitive.
    pub fn mime_header(&self, name: &str) -> Option<&str> {
        match &self.mime {
            MimeState::Parsed(h) => h.get(name),
            _ => None,
        }
    }

    /// Every content stored under a MIME header name, in wire order.
    pub fn mime_header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        let headers = match &self.mime {
            MimeState::Parsed(h) => Some(h),
            _ => None,
        };
        headers.into_iter().flat_map(move |h| h.get_all(name))
    }

    /// Set a MIME header on an outbound frame. Repeated names accumulate,
    /// as RFC 2045 permits. `mime_headers_size` tracks the header lines
    /// plus the blank line terminator.
    pub fn set_mime_header(&mut self, name: impl Into<String>, content: impl Into<String>) {
        let headers = match &mut self.mime {
            MimeState::Parsed(h) => Arc::make_mut(h),
            state => {
                *state = MimeState::Parsed(Arc::new(MimeHeaders::new()));
                match state {
                    MimeState::Parsed(h) => Arc::make_mut(h),
                    _ => unreachable!(),
                }
            }
        };
        headers.set(name, content);
        self.mime_headers_size = match &self.mime {
            MimeState::Parsed(h) => h.wire_size(),
            _ => 0,
        };
    }

    /// Remove the first occurrence of a MIME header. Removing the last one
    /// resets the header size to zero.
    pub fn remove_mime_header(&mut self, name: &str) -> bool {
        let removed = match &mut self.mime {
            MimeState::Parsed(h) => Arc::make_mut(h).remove(name),
            _ => false,
        };
        if removed {
            self.mime_headers_size = match &self.mime {
                MimeState::Parsed(h) => h.wire_size(),
                _ => 0,
            };
        }
        removed
    }

    // ------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------

    /// Encode the full frame, allocating the output buffer.
    ///
    /// The header `size` field advertises the payload plus any MIME header
    /// lines this frame carries; field order and digit rendering follow the
    /// wire grammar exactly.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.content_size() + 32);
        self.write_header(&mut out);
        if self.kind != FrameType::Seq {
            if let MimeState::Parsed(h) = &self.mime {
                h.write_to(&mut out);
            }
            out.extend_from_slice(&self.payload);
            out.extend_from_slice(FRAME_TRAILER);
        }
        out
    }

    /// Encode into a caller-supplied buffer, returning the encoded length.
    /// A buffer too small for the frame is a hard encoding failure.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let encoded = self.encode();
        if encoded.len() > buf.len() {
            return Err(Error::Encoding(format!(
                "buffer too small: need {} bytes, have {}",
                encoded.len(),
                buf.len()
            )));
        }
        buf[..encoded.len()].copy_from_slice(&encoded);
        Ok(encoded.len())
    }

    fn write_header(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.kind.tag().as_bytes());
        out.push(b' ');
        push_uint(out, u64::from(self.channel));
        out.push(b' ');
        if self.kind == FrameType::Seq {
            // SEQ channel ackno window
            push_uint(out, u64::from(self.seqno));
            out.push(b' ');
            push_uint(out, self.size as u64);
            out.extend_from_slice(b"\r\n");
            return;
        }
        push_uint(out, u64::from(self.msgno));
        out.push(b' ');
        out.push(if self.more { b'*' } else { b'.' });
        out.push(b' ');
        push_uint(out, u64::from(self.seqno));
        out.push(b' ');
        push_uint(out, self.content_size() as u64);
        if let Some(ansno) = self.ansno {
            out.push(b' ');
            push_uint(out, u64::from(ansno));
        }
        out.extend_from_slice(b"\r\n");
    }

    /// Build the raw bytes of a data frame without materializing a
    /// [`Frame`]. Content-Type and Content-Transfer-Encoding lines are
    /// emitted only when they differ from the BEEP defaults.
    pub fn build_data(
        kind: FrameType,
        channel: u32,
        msgno: u32,
        more: bool,
        seqno: u32,
        ansno: Option<u32>,
        content_type: Option<&str>,
        transfer_encoding: Option<&str>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut frame = Frame::new(
            0,
            kind,
            channel,
            msgno,
            more,
            seqno,
            ansno,
            Bytes::copy_from_slice(payload),
        );
        if let Some(ct) = content_type {
            if ct != DEFAULT_CONTENT_TYPE {
                frame.set_mime_header("Content-Type", ct);
            }
        }
        if let Some(enc) = transfer_encoding {
            if enc != DEFAULT_TRANSFER_ENCODING {
                frame.set_mime_header("Content-Transfer-Encoding", enc);
            }
        }
        frame.encode()
    }

    /// Build the raw bytes of a SEQ frame.
    pub fn build_seq(channel: u32, ackno: u32, window: u32) -> Vec<u8> {
        Frame::seq(0, channel, ackno, window).encode()
    }

    // ------------------------------------------------------------------
    // Fragmentation
    // ------------------------------------------------------------------

    /// Check whether `b` is the continuation of `a`: same type, channel,
    /// msgno and ansno, `a` flagged as continued, and `b` starting exactly
    /// where `a` ended. MIME headers sit at the start of the first
    /// fragment, so `a`'s header size counts toward its extent.
    pub fn are_joinable(a: &Frame, b: &Frame) -> bool {
        if a.kind != b.kind {
            return false;
        }
        if !a.more {
            return false;
        }
        if a.channel != b.channel || a.msgno != b.msgno || a.ansno != b.ansno {
            return false;
        }
        let expected = a
            .seqno
            .wrapping_add(a.size as u32)
            .wrapping_add(a.mime_headers_size as u32);
        expected == b.seqno
    }

    /// Join two fragments into a new frame whose payload is the
    /// concatenation of both. The MIME state travels with the first
    /// fragment; the result is final only if `b` was.
    pub fn join(id: u64, a: &Frame, b: &Frame) -> Result<Frame> {
        if !Frame::are_joinable(a, b) {
            return Err(Error::protocol("frames are not joinable"));
        }
        let mut payload = BytesMut::with_capacity(a.size + b.size);
        payload.extend_from_slice(&a.payload);
        payload.extend_from_slice(&b.payload);
        Ok(Frame::joined(id, a, b, payload.freeze(), a.mime.clone()))
    }

    /// Join two fragments, reusing the first fragment's buffer when it is
    /// uniquely owned instead of copying both payloads.
    pub fn join_extending(id: u64, a: Frame, b: &Frame) -> Result<Frame> {
        if !Frame::are_joinable(&a, b) {
            return Err(Error::protocol("frames are not joinable"));
        }
        let header = a_header(&a);
        let mime = a.mime.clone();
        let Frame {
            payload: a_payload,
            content: a_content,
            ..
        } = a;
        // Release the sibling handle so the buffer can be reclaimed when
        // this fragment was its only owner.
        drop(a_content);
        let mut payload = match a_payload.try_into_mut() {
            Ok(owned) => owned,
            Err(shared) => BytesMut::from(&shared[..]),
        };
        payload.extend_from_slice(&b.payload);
        Ok(Frame::joined(id, &header, b, payload.freeze(), mime))
    }

    fn joined(id: u64, a: &Frame, b: &Frame, payload: Bytes, mime: MimeState) -> Frame {
        Frame {
            id,
            kind: a.kind,
            channel: a.channel,
            msgno: a.msgno,
            more: a.more && b.more,
            more_char: if a.more && b.more { b'*' } else { b'.' },
            seqno: a.seqno,
            size: payload.len(),
            ansno: a.ansno,
            content: payload.clone(),
            payload,
            mime,
            mime_headers_size: a.mime_headers_size,
            channel_ref: a.channel_ref.clone(),
        }
    }
}

/// Snapshot of `a`'s header fields for `join_extending`, which consumes the
/// frame before the merged result is assembled.
fn a_header(a: &Frame) -> Frame {
    Frame {
        payload: Bytes::new(),
        content: Bytes::new(),
        mime: MimeState::Unparsed,
        ..a.clone()
    }
}

impl PartialEq for Frame {
    /// Frames compare by header fields and payload; identifiers and channel
    /// attachments are bookkeeping and do not participate.
    fn eq(&self, other: &Frame) -> bool {
        self.kind == other.kind
            && self.channel == other.channel
            && self.msgno == other.msgno
            && self.more == other.more
            && self.seqno == other.seqno
            && self.size == other.size
            && self.ansno == other.ansno
            && self.mime_headers_size == other.mime_headers_size
            && self.payload == other.payload
    }
}
