//! Line source.

use std::collections::VecDeque;
use std::io;
use std::io::prelude::*;

use crate::Record;

/// Record delimiter.
pub const DELIMITER: u8 = b'\n';

/// Sequential supply of newline-delimited records drawn from one or more streams.
///
/// Streams are joined byte-wise, one after another, so only the delimiter ends a record: an
/// unterminated last line of one stream continues with the first line of the next one.
/// The delimiter is stripped from every record and the last record of the last stream does
/// not need to be newline-terminated.
pub struct LineSource<R: BufRead> {
    readers: VecDeque<R>,
    // pending record bytes, possibly carried over from a previous stream
    buf: Vec<u8>,
}

impl<R: BufRead> LineSource<R> {
    /// Creates a line source reading records from a single stream.
    pub fn new(reader: R) -> Self {
        Self::concat([reader])
    }

    /// Creates a line source reading records from several streams, logically concatenated.
    pub fn concat<I>(readers: I) -> Self
    where
        I: IntoIterator<Item = R>,
    {
        LineSource {
            readers: VecDeque::from_iter(readers),
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for LineSource<R> {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = match self.readers.front_mut() {
                Some(reader) => reader,
                None if self.buf.is_empty() => return None,
                None => return Some(Ok(std::mem::take(&mut self.buf))),
            };

            match reader.read_until(DELIMITER, &mut self.buf) {
                Ok(0) => {
                    self.readers.pop_front();
                }
                Ok(_) => {
                    if self.buf.last() == Some(&DELIMITER) {
                        self.buf.pop();
                        return Some(Ok(std::mem::take(&mut self.buf)));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
