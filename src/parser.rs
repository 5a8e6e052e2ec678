//! The boundary between the coordinator and record decoders.
//!
//! A parser is built from the persisted `ParserState` and an open file, then
//! drained chunk by chunk. Every chunk carries the state to persist once its
//! records are delivered, so a restart resumes right after the last delivered
//! chunk.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};

use harvest::{RangeError, UnprocessedRanges};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("read failed, {0}")]
    Io(#[from] io::Error),

    #[error("malformed record at offset {offset}, {reason}")]
    Malformed { offset: u64, reason: String },

    #[error(transparent)]
    Range(#[from] RangeError),
}

/// Opaque to the coordinator, except for `unprocessed` which is extended as a
/// growing file grows. Static files never carry it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ParserState {
    /// Offset of the first byte not yet parsed, static files only.
    #[serde(default)]
    pub position: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unprocessed: Option<UnprocessedRanges>,

    /// Whatever else a decoder needs to resume.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ParserState {
    /// Bytes of a growing file not parsed yet.
    pub fn pending(&self) -> u64 {
        self.unprocessed
            .as_ref()
            .map(UnprocessedRanges::pending)
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Chunk<R> {
    pub records: Vec<R>,
    pub state: ParserState,
}

pub trait Parser: Send {
    type Record;

    /// Decode the next batch of records, `None` once nothing is left.
    fn next_chunk(&mut self) -> Result<Option<Chunk<Self::Record>>, ParseError>;

    /// State after the last returned chunk. After an error it also accounts for
    /// the bytes the parser gave up on.
    fn state(&self) -> &ParserState;
}

pub trait ParserFactory: Send + Sync + 'static {
    type Record: Send + 'static;
    type Parser: Parser<Record = Self::Record>;

    fn build(&self, state: ParserState, file: File) -> Self::Parser;
}

/// One newline delimited record.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct Line {
    pub offset: u64,
    pub text: String,
}

#[derive(Clone, Copy, Debug)]
pub struct LineParserFactory {
    chunk_size: usize,
}

impl LineParserFactory {
    pub fn new(chunk_size: usize) -> Self {
        LineParserFactory {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl ParserFactory for LineParserFactory {
    type Record = Line;
    type Parser = LineParser;

    fn build(&self, state: ParserState, file: File) -> LineParser {
        LineParser {
            reader: BufReader::new(file),
            state,
            chunk_size: self.chunk_size,
            seeked: false,
            skipped: 0,
            failure: None,
        }
    }
}

/// Decodes UTF-8 lines, skipping blank ones.
///
/// Static files are read sequentially from `position`, a trailing line without
/// newline is a record. Growing files are read span by span from the
/// unprocessed ranges; only complete lines are consumed, so a line still being
/// written stays unprocessed until its newline arrives.
pub struct LineParser {
    reader: BufReader<File>,
    state: ParserState,
    chunk_size: usize,
    seeked: bool,
    // leading spans holding nothing but an incomplete line
    skipped: usize,
    // raised after the records decoded before it are handed out
    failure: Option<ParseError>,
}

impl LineParser {
    fn next_static(&mut self) -> Result<Option<Chunk<Line>>, ParseError> {
        if !self.seeked {
            self.reader.seek(SeekFrom::Start(self.state.position))?;
            self.seeked = true;
        }

        let mut records = Vec::with_capacity(self.chunk_size);
        let mut buf = Vec::new();
        let start = self.state.position;

        while records.len() < self.chunk_size {
            buf.clear();
            let size = self.reader.read_until(b'\n', &mut buf)?;
            if size == 0 {
                break;
            }

            let offset = self.state.position;
            // skip the bad line, so whoever saves this state does not retry it
            self.state.position += size as u64;

            match decode(offset, &buf) {
                Ok(Some(line)) => records.push(line),
                Ok(None) => {}
                Err(err) => {
                    self.failure = Some(err);
                    break;
                }
            }
        }

        if self.state.position == start {
            return Ok(None);
        }

        self.finish(records)
    }

    fn finish(&mut self, records: Vec<Line>) -> Result<Option<Chunk<Line>>, ParseError> {
        if records.is_empty() {
            if let Some(err) = self.failure.take() {
                return Err(err);
            }
        }

        Ok(Some(Chunk {
            records,
            state: self.state.clone(),
        }))
    }

    fn next_growing(&mut self) -> Result<Option<Chunk<Line>>, ParseError> {
        loop {
            let Some(span) = self
                .state
                .unprocessed
                .as_ref()
                .and_then(|ranges| ranges.spans().get(self.skipped).copied())
            else {
                return Ok(None);
            };

            self.reader.seek(SeekFrom::Start(span.start))?;
            let mut limited = (&mut self.reader).take(span.len());

            let mut records = Vec::with_capacity(self.chunk_size);
            let mut buf = Vec::new();
            let mut offset = span.start;

            while records.len() < self.chunk_size {
                buf.clear();
                let size = limited.read_until(b'\n', &mut buf)?;
                if size == 0 || buf.last() != Some(&b'\n') {
                    break;
                }

                let start = offset;
                offset += size as u64;

                match decode(start, &buf) {
                    Ok(Some(line)) => records.push(line),
                    Ok(None) => {}
                    Err(err) => {
                        self.failure = Some(err);
                        break;
                    }
                }
            }

            if offset == span.start {
                self.skipped += 1;
                continue;
            }

            if let Some(ranges) = self.state.unprocessed.as_mut() {
                ranges.consume(span.start, offset)?;
            }

            return self.finish(records);
        }
    }
}

impl Parser for LineParser {
    type Record = Line;

    fn next_chunk(&mut self) -> Result<Option<Chunk<Line>>, ParseError> {
        if let Some(err) = self.failure.take() {
            return Err(err);
        }

        if self.state.unprocessed.is_some() {
            self.next_growing()
        } else {
            self.next_static()
        }
    }

    fn state(&self) -> &ParserState {
        &self.state
    }
}

fn decode(offset: u64, buf: &[u8]) -> Result<Option<Line>, ParseError> {
    let mut line = buf.strip_suffix(b"\n").unwrap_or(buf);
    line = line.strip_suffix(b"\r").unwrap_or(line);

    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    match std::str::from_utf8(line) {
        Ok(text) => Ok(Some(Line {
            offset,
            text: text.to_string(),
        })),
        Err(err) => Err(ParseError::Malformed {
            offset,
            reason: err.to_string(),
        }),
    }
}
