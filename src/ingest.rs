use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    error::{CacheError, Result},
    models::{CatalogEntry, SystemRecord},
    store::CatalogWriter,
};

const READ_BUFFER_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Start,
    FirstElement,
    AfterElement,
    Done,
}

pub struct SystemStream<R> {
    reader: R,
    position: Position,
    index: u64,
}

impl<R: BufRead> SystemStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            position: Position::Start,
            index: 0,
        }
    }

    fn malformed(&mut self, message: impl Into<String>) -> CacheError {
        self.position = Position::Done;
        CacheError::MalformedRecord {
            index: self.index,
            message: message.into(),
        }
    }

    fn peek_significant(&mut self) -> io::Result<Option<u8>> {
        loop {
            let buf = self.reader.fill_buf()?;
            let Some(&byte) = buf.first() else {
                return Ok(None);
            };
            if byte.is_ascii_whitespace() {
                self.reader.consume(1);
                continue;
            }
            return Ok(Some(byte));
        }
    }

    fn decode_element(&mut self) -> Result<CatalogEntry> {
        let decoded = {
            let mut de = serde_json::Deserializer::from_reader(&mut self.reader);
            SystemRecord::deserialize(&mut de)
        };
        match decoded {
            Ok(record) => {
                self.index += 1;
                Ok(record.into())
            }
            Err(err) => Err(self.malformed(err.to_string())),
        }
    }

    fn advance(&mut self) -> Result<Option<CatalogEntry>> {
        loop {
            let next = match self.peek_significant() {
                Ok(next) => next,
                Err(err) => return Err(self.malformed(format!("read error: {err}"))),
            };

            match (self.position, next) {
                (Position::Done, _) => return Ok(None),
                (Position::Start, Some(b'[')) => {
                    self.reader.consume(1);
                    self.position = Position::FirstElement;
                }
                (Position::Start, Some(other)) => {
                    return Err(self.malformed(format!(
                        "expected top-level array, found '{}'",
                        char::from(other)
                    )));
                }
                (Position::FirstElement, Some(b']')) | (Position::AfterElement, Some(b']')) => {
                    self.reader.consume(1);
                    self.position = Position::Done;
                    return Ok(None);
                }
                (Position::FirstElement, Some(_)) => {
                    self.position = Position::AfterElement;
                    return self.decode_element().map(Some);
                }
                (Position::AfterElement, Some(b',')) => {
                    self.reader.consume(1);
                    if matches!(self.peek_significant(), Ok(Some(b']'))) {
                        return Err(self.malformed("trailing comma before ']'"));
                    }
                    return self.decode_element().map(Some);
                }
                (Position::AfterElement, Some(other)) => {
                    return Err(self.malformed(format!(
                        "expected ',' or ']' after element, found '{}'",
                        char::from(other)
                    )));
                }
                (_, None) => return Err(self.malformed("unexpected end of document")),
            }
        }
    }
}

impl<R: BufRead> Iterator for SystemStream<R> {
    type Item = Result<CatalogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

pub fn ingest_batches<I, W>(records: I, batch_size: usize, writer: &W) -> Result<u64>
where
    I: IntoIterator<Item = Result<CatalogEntry>>,
    W: CatalogWriter + ?Sized,
{
    let batch_size = batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut total = 0u64;

    for record in records {
        batch.push(record?);
        if batch.len() >= batch_size {
            total += writer.upsert_many(&batch)? as u64;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        total += writer.upsert_many(&batch)? as u64;
    }

    Ok(total)
}

pub fn ingest_file<W>(path: &Path, batch_size: usize, writer: &W) -> Result<u64>
where
    W: CatalogWriter + ?Sized,
{
    let file = File::open(path).map_err(|err| {
        CacheError::refresh_failed(format!("cannot open bulk file {}: {err}", path.display()))
    })?;
    let size_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
    debug!(path = %path.display(), size_bytes, "Ingesting bulk systems file");

    let stream = SystemStream::new(BufReader::with_capacity(READ_BUFFER_BYTES, file));
    let rows = ingest_batches(stream, batch_size, writer)?;

    info!(path = %path.display(), rows, "Bulk systems file ingested");
    Ok(rows)
}
