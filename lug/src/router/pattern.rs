//! Route pattern parsing
//!
//! A pattern is `"[host]/seg/{name}/{name:regex}/{name...}"`. A leading
//! slash means no host; otherwise everything up to the first slash is a
//! literal host. Static segments are percent-decoded at parse time so the
//! trie compares them against decoded request paths.

use std::fmt;

use percent_encoding::percent_decode_str;

use crate::error::{Error, ErrorKind, Result};

/// Kind of one path segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Literal text
    Static,
    /// `{name}` or `{name:regex}`: captures one component
    Param,
    /// `{name...}`: captures the remaining path, slashes included
    Wild,
}

/// One parsed path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Literal text (Static) or capture name (Param/Wild)
    pub name: String,
    /// Segment kind
    pub kind: SegmentKind,
    /// Anchored regex source for constrained params
    pub regex: Option<String>,
}

impl Segment {
    fn literal(name: String) -> Self {
        Self {
            name,
            kind: SegmentKind::Static,
            regex: None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SegmentKind::Static => f.write_str(&self.name),
            SegmentKind::Wild => write!(f, "{{{}...}}", self.name),
            SegmentKind::Param => match &self.regex {
                Some(re) => write!(f, "{{{}:{}}}", self.name, re),
                None => write!(f, "{{{}}}", self.name),
            },
        }
    }
}

/// A parsed route pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    /// Bound host, empty when the pattern matches any host
    pub host: String,
    /// Slash-delimited segments, in order
    pub segments: Vec<Segment>,
    /// The raw pattern text as registered
    pub raw: String,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)?;
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        if self.segments.is_empty() {
            f.write_str("/")?;
        }
        Ok(())
    }
}

fn parse_error(pattern: &str, offset: usize, message: &str) -> Error {
    Error::new(
        ErrorKind::ArgumentError,
        format!("invalid pattern {pattern:?} at offset {offset}: {message}"),
    )
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Pattern {
    /// Parse a pattern string
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(parse_error(pattern, 0, "empty pattern"));
        }

        let (host, rest, mut offset) = if let Some(rest) = pattern.strip_prefix('/') {
            (String::new(), rest, 1)
        } else {
            let slash = pattern
                .find('/')
                .ok_or_else(|| parse_error(pattern, pattern.len(), "expected '/' after host"))?;
            let host = &pattern[..slash];
            if host.contains('{') {
                return Err(parse_error(pattern, 0, "host must be a literal"));
            }
            (host.to_string(), &pattern[slash + 1..], slash + 1)
        };

        let mut segments = Vec::new();
        let mut seen_names: Vec<String> = Vec::new();

        for token in rest.split('/') {
            let token_offset = offset;
            offset += token.len() + 1;

            if token.is_empty() {
                continue;
            }

            if let Some(inner) = token.strip_prefix('{') {
                let inner = inner
                    .strip_suffix('}')
                    .ok_or_else(|| parse_error(pattern, token_offset, "unterminated '{'"))?;

                let segment = if let Some(name) = inner.strip_suffix("...") {
                    Segment {
                        name: name.to_string(),
                        kind: SegmentKind::Wild,
                        regex: None,
                    }
                } else if let Some((name, regex)) = inner.split_once(':') {
                    if regex.is_empty() {
                        return Err(parse_error(pattern, token_offset, "empty regex"));
                    }
                    Segment {
                        name: name.to_string(),
                        kind: SegmentKind::Param,
                        regex: Some(regex.to_string()),
                    }
                } else {
                    Segment {
                        name: inner.to_string(),
                        kind: SegmentKind::Param,
                        regex: None,
                    }
                };

                if !valid_name(&segment.name) {
                    return Err(parse_error(pattern, token_offset, "invalid capture name"));
                }
                if seen_names.iter().any(|seen| seen == &segment.name) {
                    return Err(parse_error(pattern, token_offset, "duplicate capture name"));
                }
                if segments.last().is_some_and(|s: &Segment| s.kind == SegmentKind::Wild) {
                    return Err(parse_error(pattern, token_offset, "segment after wildcard"));
                }
                seen_names.push(segment.name.clone());
                segments.push(segment);
            } else {
                if segments.last().is_some_and(|s: &Segment| s.kind == SegmentKind::Wild) {
                    return Err(parse_error(pattern, token_offset, "segment after wildcard"));
                }
                if token.contains('}') {
                    return Err(parse_error(pattern, token_offset, "stray '}'"));
                }
                let decoded = percent_decode_str(token)
                    .decode_utf8()
                    .map_err(|_| parse_error(pattern, token_offset, "invalid percent-encoding"))?
                    .into_owned();
                segments.push(Segment::literal(decoded));
            }
        }

        Ok(Self {
            host,
            segments,
            raw: pattern.to_string(),
        })
    }
}
