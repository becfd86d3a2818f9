//! Greetings parsing, validation and the per-context greetings cache.
//!
//! The first frame of every BEEP session carries the channel management
//! greeting:
//!
//! ```text
//! <greeting features='...' localize='...'>
//!    <profile uri='http://example.org/beep/echo' />
//! </greeting>
//! ```
//!
//! Greetings repeat verbatim across sessions talking to the same peer
//! software, so decoded entries are cached context-wide, keyed by the raw
//! XML text, and shared by reference with every session that observes the
//! same bytes. Entries are immutable once inserted and live until the
//! context is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use winnow::prelude::*;
use winnow::token::{one_of, take_while};

use super::error::{Error, Result};

/// The decoded content of one observed greeting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Greeting {
    features: Option<String>,
    localize: Option<String>,
    profiles: Vec<String>,
}

impl Greeting {
    /// Optional feature tokens requested by the peer.
    pub fn features(&self) -> Option<&str> {
        self.features.as_deref()
    }

    /// Optional language preference announced by the peer.
    pub fn localize(&self) -> Option<&str> {
        self.localize.as_deref()
    }

    /// Profile URIs advertised by the peer, in document order.
    pub fn profiles(&self) -> &[String] {
        &self.profiles
    }

    /// Check whether the peer advertised the given profile URI.
    pub fn supports_profile(&self, uri: &str) -> bool {
        self.profiles.iter().any(|p| p == uri)
    }
}

fn ws(input: &mut &str) -> winnow::ModalResult<()> {
    take_while(0.., |c: char| c.is_ascii_whitespace())
        .void()
        .parse_next(input)
}

fn xml_name<'s>(input: &mut &'s str) -> winnow::ModalResult<&'s str> {
    take_while(1.., |c: char| {
        c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':'
    })
    .parse_next(input)
}

fn quoted<'s>(input: &mut &'s str) -> winnow::ModalResult<&'s str> {
    let quote: char = one_of(['"', '\'']).parse_next(input)?;
    let value = take_while(0.., move |c: char| c != quote).parse_next(input)?;
    let _ = one_of(move |c: char| c == quote).parse_next(input)?;
    Ok(value)
}

/// One `name='value'` attribute, with surrounding whitespace consumed.
fn attribute<'s>(input: &mut &'s str) -> winnow::ModalResult<(&'s str, &'s str)> {
    ws.parse_next(input)?;
    let name = xml_name.parse_next(input)?;
    ws.parse_next(input)?;
    let _ = one_of(['=']).parse_next(input)?;
    ws.parse_next(input)?;
    let value = quoted.parse_next(input)?;
    Ok((name, value))
}

fn attributes<'s>(input: &mut &'s str) -> winnow::ModalResult<Vec<(&'s str, &'s str)>> {
    winnow::combinator::repeat(0.., attribute).parse_next(input)
}

/// Parse and validate a greeting document.
///
/// Validation is structural, matching the channel management grammar the
/// engine consumes: the root element must be `greeting` with at most the
/// `features` and `localize` attributes; children must be empty `profile`
/// elements carrying a mandatory `uri` and an optional
/// `encoding` restricted to `none`/`base64`. Anything else is rejected.
pub fn parse_greeting(raw: &[u8]) -> Result<Greeting> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::XmlValidation("greeting is not valid UTF-8".into()))?;
    let mut input = text;

    parse_document(&mut input).map_err(|_| {
        Error::XmlValidation(format!(
            "greeting does not match the channel management grammar: '{}'",
            text.trim()
        ))
    })
}

fn parse_document(input: &mut &str) -> winnow::ModalResult<Greeting> {
    ws.parse_next(input)?;
    // Optional XML declaration.
    if input.starts_with("<?xml") {
        let _ = take_while(0.., |c: char| c != '>').parse_next(input)?;
        let _ = one_of(['>']).parse_next(input)?;
        ws.parse_next(input)?;
    }

    let _ = one_of(['<']).parse_next(input)?;
    let root = xml_name.parse_next(input)?;
    if root != "greeting" {
        return Err(cut());
    }
    let attrs = attributes.parse_next(input)?;

    let mut greeting = Greeting::default();
    for (name, value) in attrs {
        match name {
            "features" => greeting.features = Some(value.to_string()),
            "localize" => greeting.localize = Some(value.to_string()),
            _ => return Err(cut()),
        }
    }

    ws.parse_next(input)?;
    if input.starts_with("/>") {
        *input = &input[2..];
    } else {
        let _ = one_of(['>']).parse_next(input)?;
        loop {
            ws.parse_next(input)?;
            if input.starts_with("</greeting>") {
                *input = &input["</greeting>".len()..];
                break;
            }
            let uri = parse_profile(input)?;
            greeting.profiles.push(uri);
        }
    }

    ws.parse_next(input)?;
    if !input.is_empty() {
        return Err(cut());
    }
    Ok(greeting)
}

/// One empty `<profile uri='...' [encoding='none|base64'] />` element.
fn parse_profile(input: &mut &str) -> winnow::ModalResult<String> {
    let _ = one_of(['<']).parse_next(input)?;
    let name = xml_name.parse_next(input)?;
    if name != "profile" {
        return Err(cut());
    }
    let attrs = attributes.parse_next(input)?;

    let mut uri = None;
    for (name, value) in attrs {
        match name {
            "uri" => uri = Some(value.to_string()),
            "encoding" if value == "none" || value == "base64" => {}
            _ => return Err(cut()),
        }
    }

    ws.parse_next(input)?;
    if input.starts_with("/>") {
        *input = &input[2..];
    } else {
        // Tolerate the explicit empty form.
        if !input.starts_with("></profile>") {
            return Err(cut());
        }
        *input = &input["></profile>".len()..];
    }

    uri.ok_or_else(cut)
}

fn cut() -> winnow::error::ErrMode<winnow::error::ContextError> {
    winnow::error::ErrMode::Cut(winnow::error::ContextError::new())
}

/// Render the local greeting document advertising `profiles`.
pub fn build_greeting(
    profiles: &[String],
    features: Option<&str>,
    localize: Option<&str>,
) -> String {
    let mut out = String::from("<greeting");
    if let Some(features) = features {
        out.push_str(&format!(" features='{features}'"));
    }
    if let Some(localize) = localize {
        out.push_str(&format!(" localize='{localize}'"));
    }
    if profiles.is_empty() {
        out.push_str(" />");
        return out;
    }
    out.push('>');
    for uri in profiles {
        out.push_str(&format!("<profile uri='{uri}' />"));
    }
    out.push_str("</greeting>");
    out
}

/// Context-wide cache of decoded greetings, keyed by raw XML text.
#[derive(Debug, Default)]
pub struct GreetingsCache {
    entries: Mutex<HashMap<Vec<u8>, Arc<Greeting>>>,
}

impl GreetingsCache {
    /// Resolve raw greeting bytes to a shared decoded entry, parsing and
    /// validating on first observation.
    pub fn resolve(&self, raw: &[u8]) -> Result<Arc<Greeting>> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(raw) {
            tracing::trace!(len = raw.len(), "greetings cache hit");
            return Ok(Arc::clone(entry));
        }

        let greeting = Arc::new(parse_greeting(raw)?);
        entries.insert(raw.to_vec(), Arc::clone(&greeting));
        tracing::debug!(
            profiles = greeting.profiles().len(),
            "greetings cache insert"
        );
        Ok(greeting)
    }

    /// Number of distinct greetings observed.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Check whether no greetings were observed yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
