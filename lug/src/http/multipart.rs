//! Minimal `multipart/form-data` body parsing
//!
//! Supports the subset the upload surface needs: text fields and file parts
//! with a filename, split on the boundary from the Content-Type header.

use crate::error::{Error, ErrorKind, Result};

/// One decoded part of a multipart body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// `name` from the Content-Disposition header
    pub name: String,
    /// `filename`, present for file parts
    pub filename: Option<String>,
    /// Part content type, when declared
    pub content_type: Option<String>,
    /// Raw part bytes
    pub data: Vec<u8>,
}

/// Extract the boundary token from a Content-Type header value
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let (kind, params) = content_type.split_once(';')?;
    if !kind.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    for param in params.split(';') {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}

fn header_param(header: &str, name: &str) -> Option<String> {
    for piece in header.split(';') {
        let piece = piece.trim();
        if let Some(value) = piece.strip_prefix(name) {
            if let Some(value) = value.strip_prefix('=') {
                return Some(value.trim_matches('"').to_string());
            }
        }
    }
    None
}

/// Parse a multipart body into its parts
pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<Part>> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();

    let mut cursor = find(body, delimiter, 0)
        .ok_or_else(|| Error::new(ErrorKind::ArgumentError, "multipart boundary not found"))?;
    cursor += delimiter.len();

    loop {
        // "--" after the delimiter closes the body
        if body[cursor..].starts_with(b"--") {
            break;
        }
        // skip the CRLF after the delimiter
        if body[cursor..].starts_with(b"\r\n") {
            cursor += 2;
        }

        let header_end = find(body, b"\r\n\r\n", cursor)
            .ok_or_else(|| Error::new(ErrorKind::ArgumentError, "multipart part missing header"))?;
        let headers = String::from_utf8_lossy(&body[cursor..header_end]);

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in headers.lines() {
            let Some((key, value)) = line.split_once(':') else { continue };
            let value = value.trim();
            if key.eq_ignore_ascii_case("content-disposition") {
                name = header_param(value, "name");
                filename = header_param(value, "filename");
            } else if key.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_string());
            }
        }

        let data_start = header_end + 4;
        let data_end = find(body, delimiter, data_start)
            .ok_or_else(|| Error::new(ErrorKind::ArgumentError, "multipart part not terminated"))?;
        // the CRLF preceding the delimiter belongs to the framing
        let data = body[data_start..data_end.saturating_sub(2).max(data_start)].to_vec();

        parts.push(Part {
            name: name.unwrap_or_default(),
            filename,
            content_type,
            data,
        });

        cursor = data_end + delimiter.len();
    }

    Ok(parts)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"--XB\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\r\n\
hello world\r\n\
--XB\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
file bytes\r\n\
--XB--\r\n";

    #[test]
    fn test_boundary_extraction() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=XB"),
            Some("XB".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; charset=utf-8; boundary=\"quoted\""),
            Some("quoted".to_string())
        );
        assert_eq!(boundary_from_content_type("application/json"), None);
    }

    #[test]
    fn test_parse_fields_and_files() {
        let parts = parse(BODY, "XB").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "title");
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[0].data, b"hello world");
        assert_eq!(parts[1].name, "upload");
        assert_eq!(parts[1].filename.as_deref(), Some("a.txt"));
        assert_eq!(parts[1].content_type.as_deref(), Some("text/plain"));
        assert_eq!(parts[1].data, b"file bytes");
    }

    #[test]
    fn test_missing_boundary_is_error() {
        let err = parse(b"no delimiters here", "XB").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentError);
    }
}
