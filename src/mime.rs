use mailparse::{MailHeader, MailHeaderMap, MailParseError};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaTypeError {
    #[error("no media type")]
    Empty,
    #[error("expected slash after first token in '{0}'")]
    MissingSlash(String),
    #[error("invalid character in media type '{0}'")]
    InvalidToken(String),
    #[error("invalid media parameter '{0}'")]
    InvalidParameter(String),
}

/// A parsed `Content-Type` value. The essence is lowercased, parameter
/// names are lowercased and values unquoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
    pub essence: String,
    pub params: BTreeMap<String, String>,
}

impl MediaType {
    pub fn parse(value: &str) -> Result<Self, MediaTypeError> {
        let segments = split_parameters(value);
        let essence = segments.first().map(|s| s.trim()).unwrap_or_default();
        if essence.is_empty() {
            return Err(MediaTypeError::Empty);
        }

        let (main, sub) = essence
            .split_once('/')
            .ok_or_else(|| MediaTypeError::MissingSlash(essence.to_string()))?;
        let (main, sub) = (main.trim(), sub.trim());
        if !is_token(main) || !is_token(sub) {
            return Err(MediaTypeError::InvalidToken(essence.to_string()));
        }

        for segment in segments.iter().skip(1) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((name, _)) if is_token(name.trim()) => {}
                _ => return Err(MediaTypeError::InvalidParameter(segment.to_string())),
            }
        }

        let params = mailparse::parse_content_type(value)
            .params
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        Ok(MediaType {
            essence: format!("{}/{}", main, sub).to_ascii_lowercase(),
            params,
        })
    }

    /// RFC 2045 default for content without a `Content-Type` header.
    pub fn text_plain() -> Self {
        MediaType {
            essence: "text/plain".to_string(),
            params: BTreeMap::new(),
        }
    }

    /// Parse an optional header value, defaulting to `text/plain` when absent.
    pub fn from_header(value: Option<&str>) -> Result<Self, MediaTypeError> {
        match value {
            Some(v) => Self::parse(v),
            None => Ok(Self::text_plain()),
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.essence.starts_with("multipart/")
    }

    pub fn is_message(&self) -> bool {
        self.essence == "message/rfc822"
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn boundary(&self) -> Option<&str> {
        self.param("boundary").filter(|b| !b.is_empty())
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?=".contains(&b)
        })
}

/// Split on `;` outside of quoted strings.
fn split_parameters(value: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                segments.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&value[start..]);
    segments
}

/// File name of a part: Content-Disposition `filename`, then Content-Type
/// `name`. Directory components are dropped.
pub fn part_filename(headers: &[MailHeader], media: &MediaType) -> Option<String> {
    let from_disposition = headers
        .get_first_value("Content-Disposition")
        .and_then(|v| mailparse::parse_content_disposition(&v).params.get("filename").cloned());

    from_disposition
        .or_else(|| media.param("name").map(str::to_string))
        .and_then(|name| {
            name.rsplit(['/', '\\'])
                .next()
                .map(|base| base.trim().to_string())
        })
        .filter(|base| !base.is_empty())
}

/// Content-Type of a part or embedded message, `text/plain` when absent.
pub fn header_media_type(headers: &[MailHeader]) -> Result<MediaType, MediaTypeError> {
    MediaType::from_header(headers.get_first_value("Content-Type").as_deref())
}

pub struct RawPart<'a> {
    pub headers: Vec<MailHeader<'a>>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Preamble,
    InPart,
    Done,
}

/// Lazily yields the sub-parts of one multipart body.
///
/// Text before the first delimiter is skipped. Running out of input before
/// the closing delimiter ends the iteration; a trailing unterminated part is
/// still yielded.
pub struct MultipartReader<'a> {
    body: &'a [u8],
    delimiter: Vec<u8>,
    pos: usize,
    state: ReaderState,
}

struct Delimiter {
    line_start: usize,
    next_line: usize,
    closing: bool,
}

impl<'a> MultipartReader<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut delimiter = b"--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        MultipartReader {
            body,
            delimiter,
            pos: 0,
            state: ReaderState::Preamble,
        }
    }

    fn find_delimiter(&self, from: usize) -> Option<Delimiter> {
        let mut start = from;
        while start < self.body.len() {
            let end = self.body[start..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| start + i)
                .unwrap_or(self.body.len());
            let next_line = (end + 1).min(self.body.len());

            let line = &self.body[start..end];
            if let Some(rest) = line.strip_prefix(self.delimiter.as_slice()) {
                let rest = trim_end_whitespace(rest);
                if rest.is_empty() || rest == b"--" {
                    return Some(Delimiter {
                        line_start: start,
                        next_line,
                        closing: !rest.is_empty(),
                    });
                }
            }
            start = next_line;
        }
        None
    }
}

fn trim_end_whitespace(mut bytes: &[u8]) -> &[u8] {
    while let Some((last, rest)) = bytes.split_last() {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

impl<'a> Iterator for MultipartReader<'a> {
    type Item = Result<RawPart<'a>, MailParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == ReaderState::Preamble {
            match self.find_delimiter(self.pos) {
                Some(delim) if !delim.closing => {
                    self.pos = delim.next_line;
                    self.state = ReaderState::InPart;
                }
                _ => {
                    self.state = ReaderState::Done;
                    return None;
                }
            }
        }
        if self.state == ReaderState::Done {
            return None;
        }

        let part_start = self.pos;
        let content = match self.find_delimiter(part_start) {
            Some(delim) => {
                self.pos = delim.next_line;
                if delim.closing {
                    self.state = ReaderState::Done;
                }
                let raw = &self.body[part_start..delim.line_start];
                let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
                raw.strip_suffix(b"\r").unwrap_or(raw)
            }
            None => {
                self.state = ReaderState::Done;
                if part_start >= self.body.len() {
                    return None;
                }
                &self.body[part_start..]
            }
        };

        Some(mailparse::parse_headers(content).map(|(headers, offset)| RawPart {
            headers,
            body: &content[offset.min(content.len())..],
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_media_type_with_params() {
        let media =
            MediaType::parse("Multipart/Mixed; boundary=\"----=_Part_0_17.42\"; charset=UTF-8").unwrap();
        assert_eq!(media.essence, "multipart/mixed");
        assert!(media.is_multipart());
        assert_eq!(media.boundary(), Some("----=_Part_0_17.42"));
        assert_eq!(media.param("CHARSET"), Some("UTF-8"));
    }

    #[test]
    fn test_parse_media_type_folded_header() {
        let media = MediaType::parse("multipart/alternative;\r\n\tboundary=abc123;").unwrap();
        assert_eq!(media.essence, "multipart/alternative");
        assert_eq!(media.boundary(), Some("abc123"));
    }

    #[test]
    fn test_parse_media_type_errors() {
        assert_eq!(MediaType::parse(""), Err(MediaTypeError::Empty));
        assert_eq!(MediaType::parse("   ; charset=utf-8"), Err(MediaTypeError::Empty));
        assert!(matches!(
            MediaType::parse("text"),
            Err(MediaTypeError::MissingSlash(_))
        ));
        assert!(matches!(
            MediaType::parse("text/pl ain"),
            Err(MediaTypeError::InvalidToken(_))
        ));
        assert!(matches!(
            MediaType::parse("multipart/mixed; boundary"),
            Err(MediaTypeError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_missing_header_defaults_to_text_plain() {
        let media = MediaType::from_header(None).unwrap();
        assert_eq!(media.essence, "text/plain");
        assert!(!media.is_multipart());
    }

    #[test]
    fn test_reader_splits_parts() {
        let body = b"preamble text\r\n--XYZ\r\nContent-Type: text/plain\r\n\r\nhello\r\n--XYZ\r\nContent-Type: text/html\r\n\r\n<p>hi</p>\r\n--XYZ--\r\nepilogue\r\n";
        let parts: Vec<_> = MultipartReader::new(body, "XYZ")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].body, b"hello");
        assert_eq!(
            header_media_type(&parts[1].headers).unwrap().essence,
            "text/html"
        );
        assert_eq!(parts[1].body, b"<p>hi</p>");
    }

    #[test]
    fn test_reader_ignores_boundary_prefix_lines() {
        let body = b"--XYZ\nContent-Type: text/plain\n\n--XYZW is not a delimiter\n--XYZ--\n";
        let parts: Vec<_> = MultipartReader::new(body, "XYZ")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].body, b"--XYZW is not a delimiter");
    }

    #[test]
    fn test_reader_without_delimiter_yields_nothing() {
        let mut reader = MultipartReader::new(b"just some text\r\n", "XYZ");
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_reader_unterminated_last_part() {
        let body = b"--XYZ\r\nContent-Type: text/plain\r\n\r\ntruncated payload";
        let parts: Vec<_> = MultipartReader::new(body, "XYZ")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].body, b"truncated payload");
    }

    #[test]
    fn test_part_filename_sources() {
        let (headers, _) = mailparse::parse_headers(
            b"Content-Type: application/pdf; name=\"fallback.pdf\"\r\nContent-Disposition: attachment; filename=\"C:\\\\temp\\\\invoice.pdf\"\r\n\r\n",
        )
        .unwrap();
        let media = header_media_type(&headers).unwrap();
        assert_eq!(part_filename(&headers, &media).as_deref(), Some("invoice.pdf"));

        let (headers, _) = mailparse::parse_headers(
            b"Content-Type: application/zip; name=\"archive.zip\"\r\n\r\n",
        )
        .unwrap();
        let media = header_media_type(&headers).unwrap();
        assert_eq!(part_filename(&headers, &media).as_deref(), Some("archive.zip"));

        let (headers, _) =
            mailparse::parse_headers(b"Content-Type: text/plain\r\n\r\n").unwrap();
        let media = header_media_type(&headers).unwrap();
        assert_eq!(part_filename(&headers, &media), None);
    }
}
