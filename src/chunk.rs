use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::Path;

use log;
use tempfile;

use crate::source::DELIMITER;
use crate::Record;

/// External chunk interface. Provides methods for creating a chunk stored on file system and reading data from it.
///
/// A chunk is a temporary file holding sorted distinct records. Reading it works as a cursor:
/// the file is opened on the first read and removed once the chunk is exhausted or dropped.
pub trait ExternalChunk: Sized + Iterator<Item = io::Result<Record>> {
    /// Builds an instance of an external chunk.
    fn build(dir: &Path, items: impl IntoIterator<Item = Record>, buf_size: Option<usize>) -> io::Result<Self> {
        let tmp_file = tempfile::Builder::new()
            .prefix("dedup.")
            .suffix(".chunk")
            .tempfile_in(dir)?;

        let mut chunk_writer = match buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, tmp_file.as_file().try_clone()?),
            None => io::BufWriter::new(tmp_file.as_file().try_clone()?),
        };

        Self::dump(&mut chunk_writer, items)?;

        chunk_writer.flush()?;
        drop(chunk_writer);

        // keep only the path until the chunk is read, so idle chunks do not hold file descriptors
        return Ok(Self::new(tmp_file.into_temp_path(), buf_size));
    }

    /// Creates an instance of an external chunk.
    fn new(path: tempfile::TempPath, buf_size: Option<usize>) -> Self;

    /// Dumps items to an external file.
    fn dump(chunk_writer: &mut io::BufWriter<fs::File>, items: impl IntoIterator<Item = Record>) -> io::Result<()>;
}

/// Newline-delimited external chunk, using the same format as the deduplicated output.
pub struct LineChunk {
    path: Option<tempfile::TempPath>,
    reader: Option<io::BufReader<fs::File>>,
    buf_size: Option<usize>,
}

impl LineChunk {
    /// Closes and removes the chunk file. Removal failures are only logged.
    fn release(&mut self) {
        self.reader = None;

        if let Some(path) = self.path.take() {
            let display = path.display().to_string();
            match path.close() {
                Ok(()) => log::trace!("chunk {} removed", display),
                Err(err) => log::warn!("chunk {} removal failed: {}", display, err),
            }
        }
    }
}

impl ExternalChunk for LineChunk {
    fn new(path: tempfile::TempPath, buf_size: Option<usize>) -> Self {
        LineChunk {
            path: Some(path),
            reader: None,
            buf_size,
        }
    }

    fn dump(chunk_writer: &mut io::BufWriter<fs::File>, items: impl IntoIterator<Item = Record>) -> io::Result<()> {
        for item in items.into_iter() {
            chunk_writer.write_all(&item)?;
            chunk_writer.write_all(&[DELIMITER])?;
        }

        return Ok(());
    }
}

impl Iterator for LineChunk {
    type Item = io::Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.path.as_ref()?;

        if self.reader.is_none() {
            let file = match fs::File::open(path) {
                Ok(file) => file,
                Err(err) => return Some(Err(err)),
            };
            self.reader = Some(match self.buf_size {
                Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
                None => io::BufReader::new(file),
            });
        }
        let reader = self.reader.as_mut()?;

        let mut record = Vec::new();
        match reader.read_until(DELIMITER, &mut record) {
            Ok(0) => {
                self.release();
                None
            }
            Ok(_) => {
                if record.last() == Some(&DELIMITER) {
                    record.pop();
                }
                Some(Ok(record))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

impl Drop for LineChunk {
    fn drop(&mut self) {
        self.release();
    }
}
