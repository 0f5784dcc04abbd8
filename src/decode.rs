//! Streaming decoder for feed input.
//!
//! Input is either a single JSON array of document operation objects or
//! newline-delimited JSON (one object per line). The decoder is lazy and
//! forward-only: each call to [`Decoder::decode`] reads exactly one
//! operation from the stream. It is not restartable; create a fresh
//! decoder to re-read.
//!
//! Array input is scanned one element at a time rather than materialized,
//! so array feeds stream with the same memory profile as JSONL.

use std::io::{self, BufRead};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::debug;

use crate::document::{Document, DocumentId, IdParseError, Operation};

/// Errors produced while decoding feed input.
///
/// `MissingId` is its own kind so a caller can attach an id supplied
/// out-of-band (e.g. from a command argument) and resubmit the operation.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to read feed input: {0}")]
    Io(#[from] io::Error),

    #[error("malformed JSON in feed input: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Id(#[from] IdParseError),

    #[error("document operation has none of the keys 'put', 'update' or 'remove'")]
    MissingId {
        /// The captured `{"fields": ...}` payload, if any.
        body: Option<Bytes>,
        condition: Option<String>,
        create: bool,
    },

    #[error("document operation has more than one of 'put', 'update' and 'remove'")]
    ConflictingOperations,

    #[error("feed input starts with '{found}' (expected '[' for an array or '{{' for JSONL)")]
    UnexpectedStart { found: char },

    #[error("unexpected '{found}' between feed array elements (expected ',' or ']')")]
    UnexpectedSeparator { found: char },

    #[error("feed input ended in the middle of a JSON value")]
    UnexpectedEnd,
}

#[derive(Deserialize)]
struct Envelope {
    put: Option<String>,
    update: Option<String>,
    remove: Option<String>,
    #[serde(default)]
    create: bool,
    condition: Option<String>,
    fields: Option<Box<RawValue>>,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// One JSON array; elements separated by ','.
    Array { first: bool },
    /// Newline-delimited objects (any whitespace between them).
    Lines,
}

/// Lazy decoder over a byte stream of document operations.
pub struct Decoder<R> {
    reader: R,
    mode: Option<Mode>,
    done: bool,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            mode: None,
            done: false,
        }
    }

    /// Decode the next document operation.
    ///
    /// Returns `None` at end of input. A returned envelope-level error
    /// (missing id, bad id, type mismatch) leaves the stream positioned
    /// after the offending value, so the caller can log and continue;
    /// stream-level errors (I/O, truncation, bad separators) end decoding.
    pub fn decode(&mut self) -> Option<Result<Document, DecodeError>> {
        if self.done {
            return None;
        }
        let raw = match self.next_value() {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        Some(parse_envelope(&raw))
    }

    /// Position on and read the next raw JSON value, honoring the mode.
    fn next_value(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        let mode = match self.mode {
            Some(mode) => mode,
            None => {
                let Some(first) = self.peek_nonspace()? else {
                    return Ok(None);
                };
                let mode = match first {
                    b'[' => {
                        self.bump();
                        Mode::Array { first: true }
                    }
                    b'{' => Mode::Lines,
                    other => {
                        return Err(DecodeError::UnexpectedStart {
                            found: other as char,
                        })
                    }
                };
                debug!(?mode, "detected feed input mode");
                self.mode = Some(mode);
                mode
            }
        };

        match mode {
            Mode::Lines => match self.peek_nonspace()? {
                None => Ok(None),
                Some(_) => self.read_value().map(Some),
            },
            Mode::Array { first } => {
                match self.peek_nonspace()? {
                    None => return Err(DecodeError::UnexpectedEnd),
                    Some(b']') => {
                        self.bump();
                        return Ok(None);
                    }
                    Some(b',') if !first => {
                        self.bump();
                        if self.peek_nonspace()?.is_none() {
                            return Err(DecodeError::UnexpectedEnd);
                        }
                    }
                    Some(_) if first => {}
                    Some(other) => {
                        return Err(DecodeError::UnexpectedSeparator {
                            found: other as char,
                        })
                    }
                }
                self.mode = Some(Mode::Array { first: false });
                self.read_value().map(Some)
            }
        }
    }

    fn peek(&mut self) -> io::Result<Option<u8>> {
        let buf = self.reader.fill_buf()?;
        Ok(buf.first().copied())
    }

    fn bump(&mut self) {
        self.reader.consume(1);
    }

    fn peek_nonspace(&mut self) -> io::Result<Option<u8>> {
        loop {
            match self.peek()? {
                Some(b) if b.is_ascii_whitespace() => self.bump(),
                other => return Ok(other),
            }
        }
    }

    /// Read one complete JSON value, tracking string and nesting state.
    fn read_value(&mut self) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::new();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        loop {
            let Some(b) = self.peek()? else {
                // A bare scalar may be terminated by end of input.
                if !in_string && depth == 0 && !out.is_empty() {
                    return Ok(out);
                }
                return Err(DecodeError::UnexpectedEnd);
            };
            if in_string {
                out.push(b);
                self.bump();
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                    if depth == 0 {
                        return Ok(out);
                    }
                }
                continue;
            }
            match b {
                b'"' => {
                    in_string = true;
                    out.push(b);
                    self.bump();
                }
                b'{' | b'[' => {
                    depth += 1;
                    out.push(b);
                    self.bump();
                }
                b'}' | b']' => {
                    if depth == 0 {
                        // Scalar terminated by the enclosing array.
                        return Ok(out);
                    }
                    depth -= 1;
                    out.push(b);
                    self.bump();
                    if depth == 0 {
                        return Ok(out);
                    }
                }
                b',' if depth == 0 => return Ok(out),
                b if depth == 0 && b.is_ascii_whitespace() => return Ok(out),
                other => {
                    out.push(other);
                    self.bump();
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for Decoder<R> {
    type Item = Result<Document, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode()
    }
}

fn parse_envelope(raw: &[u8]) -> Result<Document, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(raw)?;
    // Re-serialize the raw fields value verbatim under the envelope the
    // store expects, so the transmitted payload is byte-identical to the
    // input's field data.
    let body = envelope
        .fields
        .as_ref()
        .map(|fields| Bytes::from(format!("{{\"fields\":{}}}", fields.get())));

    let mut present = [
        (Operation::Put, envelope.put.as_deref()),
        (Operation::Update, envelope.update.as_deref()),
        (Operation::Remove, envelope.remove.as_deref()),
    ]
    .into_iter()
    .filter_map(|(op, id)| id.map(|id| (op, id)));

    let Some((operation, id)) = present.next() else {
        return Err(DecodeError::MissingId {
            body,
            condition: envelope.condition,
            create: envelope.create,
        });
    };
    if present.next().is_some() {
        return Err(DecodeError::ConflictingOperations);
    }

    let id = DocumentId::parse(id)?;
    Ok(Document {
        id,
        operation,
        body: if operation.has_body() { body } else { None },
        condition: envelope.condition,
        create: envelope.create,
    })
}
