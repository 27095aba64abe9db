use crate::mime::{self, MediaType, MediaTypeError, MultipartReader};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use mailparse::{MailHeader, MailHeaderMap, MailParseError};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Top-level headers as delivered by the transport: name to ordered values.
pub type HeaderMap = HashMap<String, Vec<String>>;

/// Standard alphabet, lenient about padding and trailing bits the way mail
/// clients produce it.
const MAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Not an error for the pipeline: the raw body was emitted as `body-0`.
    #[error("message is not multipart")]
    NotMultipart,
    #[error("unable to parse media type: {0}")]
    MediaType(#[from] MediaTypeError),
    #[error("multipart content declares no boundary")]
    MissingBoundary,
    #[error("unable to read multipart part: {0}")]
    Multipart(#[source] MailParseError),
    #[error("unable to read message/rfc822 part: {0}")]
    EmbeddedMessage(#[source] MailParseError),
    #[error("unable to base64 decode '{name}': {source}")]
    Base64 {
        name: String,
        source: base64::DecodeError,
    },
    #[error("unable to quoted-printable decode '{name}': {reason}")]
    QuotedPrintable { name: String, reason: String },
    #[error("multipart nesting deeper than {0} levels")]
    NestingTooDeep(usize),
    #[error("message has more than {0} parts")]
    TooManyParts(usize),
}

impl ExtractError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ExtractError::NotMultipart)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUnit {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Units in traversal order with unique names, plus the error that stopped
/// extraction, if any. Units produced before the error are kept.
#[derive(Debug, Default)]
pub struct ExtractionResult {
    pub units: Vec<MessageUnit>,
    pub error: Option<ExtractError>,
}

impl ExtractionResult {
    pub fn fatal_error(&self) -> Option<&ExtractError> {
        self.error.as_ref().filter(|e| e.is_fatal())
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.units
            .iter()
            .find(|u| u.name == name)
            .map(|u| u.bytes.as_slice())
    }

    pub fn names(&self) -> Vec<&str> {
        self.units.iter().map(|u| u.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_depth: usize,
    pub max_parts: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        ExtractLimits {
            max_depth: 32,
            max_parts: 1000,
        }
    }
}

pub struct ContentExtractor<'t> {
    trace_id: &'t str,
    limits: ExtractLimits,
    units: Vec<MessageUnit>,
    names: HashSet<String>,
    body_counter: usize,
    parts_seen: usize,
}

impl<'t> ContentExtractor<'t> {
    pub fn new(trace_id: &'t str, limits: ExtractLimits) -> Self {
        ContentExtractor {
            trace_id,
            limits,
            units: Vec::new(),
            names: HashSet::new(),
            body_counter: 0,
            parts_seen: 0,
        }
    }

    /// Decompose a message body into named, decoded units.
    pub fn extract(mut self, headers: &HeaderMap, body: &[u8]) -> ExtractionResult {
        let content_type = header_value(headers, "Content-Type");
        let media = match MediaType::from_header(content_type) {
            Ok(media) => media,
            Err(e) => return self.finish(Some(e.into())),
        };

        if !media.is_multipart() {
            self.add_unit("body-0".to_string(), body.to_vec());
            return self.finish(Some(ExtractError::NotMultipart));
        }

        let error = self.walk(&media, body).err();
        self.finish(error)
    }

    fn finish(self, error: Option<ExtractError>) -> ExtractionResult {
        ExtractionResult {
            units: self.units,
            error,
        }
    }

    fn open<'a>(
        &self,
        stack: &mut Vec<MultipartReader<'a>>,
        media: &MediaType,
        body: &'a [u8],
    ) -> Result<(), ExtractError> {
        if stack.len() >= self.limits.max_depth {
            return Err(ExtractError::NestingTooDeep(self.limits.max_depth));
        }
        let boundary = media.boundary().ok_or(ExtractError::MissingBoundary)?;
        log::debug!("[{}] boundary: {}", self.trace_id, boundary);
        stack.push(MultipartReader::new(body, boundary));
        Ok(())
    }

    /// Depth-first walk over nested multiparts using an explicit stack of
    /// readers, one per open multipart level.
    fn walk(&mut self, media: &MediaType, body: &[u8]) -> Result<(), ExtractError> {
        let mut stack = Vec::new();
        self.open(&mut stack, media, body)?;

        while let Some(reader) = stack.last_mut() {
            let Some(next) = reader.next() else {
                stack.pop();
                continue;
            };
            let part = next.map_err(ExtractError::Multipart)?;

            self.parts_seen += 1;
            if self.parts_seen > self.limits.max_parts {
                return Err(ExtractError::TooManyParts(self.limits.max_parts));
            }

            let part_media = mime::header_media_type(&part.headers)?;
            log::debug!("[{}] got mime type {}", self.trace_id, part_media.essence);

            if part_media.is_multipart() {
                self.open(&mut stack, &part_media, part.body)?;
            } else if part_media.is_message() {
                let (inner_headers, offset) =
                    mailparse::parse_headers(part.body).map_err(ExtractError::EmbeddedMessage)?;
                let inner_body = &part.body[offset.min(part.body.len())..];
                let inner_media = mime::header_media_type(&inner_headers)?;
                if inner_media.is_multipart() {
                    self.open(&mut stack, &inner_media, inner_body)?;
                } else {
                    self.leaf(&inner_media, &inner_headers, inner_body)?;
                }
            } else {
                self.leaf(&part_media, &part.headers, part.body)?;
            }
        }
        Ok(())
    }

    fn leaf(
        &mut self,
        media: &MediaType,
        headers: &[MailHeader],
        payload: &[u8],
    ) -> Result<(), ExtractError> {
        let filename = mime::part_filename(headers, media);
        log::debug!("[{}] filename: '{}'", self.trace_id, filename.as_deref().unwrap_or(""));

        let encoding = headers
            .get_first_value("Content-Transfer-Encoding")
            .map(|v| v.trim().to_ascii_uppercase())
            .unwrap_or_default();

        let Some(filename) = filename else {
            let prefix = if media.essence.starts_with("text/plain") {
                "text/plain"
            } else if media.essence.starts_with("text/html") {
                "text/html"
            } else {
                log::warn!(
                    "[{}] unknown mime type: {} - scanning raw",
                    self.trace_id,
                    media.essence
                );
                "unknown"
            };
            let name = format!("{}-{}", prefix, self.body_counter);
            self.body_counter += 1;
            // Unnamed parts only lose their quoted-printable layer; base64 stays as sent.
            let bytes = if encoding == "QUOTED-PRINTABLE" {
                decode_quoted_printable(&name, payload)?
            } else {
                payload.to_vec()
            };
            self.add_unit(name, bytes);
            return Ok(());
        };

        let bytes = match encoding.as_str() {
            "BASE64" => decode_base64(payload).map_err(|source| ExtractError::Base64 {
                name: filename.clone(),
                source,
            })?,
            "QUOTED-PRINTABLE" => decode_quoted_printable(&filename, payload)?,
            _ => payload.to_vec(),
        };
        self.add_unit(filename, bytes);
        Ok(())
    }

    /// Never overwrites: a taken name gets a random three character suffix.
    fn add_unit(&mut self, name: String, bytes: Vec<u8>) {
        let mut unique = name.clone();
        while self.names.contains(&unique) {
            unique = format!("{}_{}", name, random_suffix(3));
        }
        self.names.insert(unique.clone());
        self.units.push(MessageUnit {
            name: unique,
            bytes,
        });
    }
}

/// Convenience wrapper around [`ContentExtractor::extract`].
pub fn extract(
    trace_id: &str,
    limits: ExtractLimits,
    headers: &HeaderMap,
    body: &[u8],
) -> ExtractionResult {
    ContentExtractor::new(trace_id, limits).extract(headers, body)
}

/// First value of a header, matching the name case-insensitively.
pub fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

fn decode_base64(payload: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: Vec<u8> = payload
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    MAIL_BASE64.decode(compact)
}

fn decode_quoted_printable(name: &str, payload: &[u8]) -> Result<Vec<u8>, ExtractError> {
    quoted_printable::decode(payload, quoted_printable::ParseMode::Robust).map_err(|e| {
        ExtractError::QuotedPrintable {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
