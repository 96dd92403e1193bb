use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use crate::core::entry::Entry;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::EntryID;
use crate::index::id2entry::ID2Entry;
use crate::storage::tree::{Cursor, ReadableTransaction};

/// Stream of entries fed to an import. Parsing LDIF is left to the caller.
pub trait EntryReader: Send {
    fn next_entry(&mut self) -> Result<Option<Entry>>;

    /// Input consumed so far, for progress reports
    fn bytes_read(&self) -> u64 {
        0
    }
}

/// Entries handed over in memory
#[derive(Debug, Default)]
pub struct VecEntryReader {
    entries: VecDeque<Entry>,
}

impl VecEntryReader {
    pub fn new(entries: Vec<Entry>) -> Self {
        VecEntryReader { entries: entries.into() }
    }
}

impl EntryReader for VecEntryReader {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        Ok(self.entries.pop_front())
    }
}

/// One JSON-encoded entry per line; blank lines are skipped
pub struct JsonLinesReader<R: BufRead + Send> {
    input: R,
    line: String,
    line_number: u64,
    bytes_read: u64,
}

impl JsonLinesReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(JsonLinesReader::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead + Send> JsonLinesReader<R> {
    pub fn new(input: R) -> Self {
        JsonLinesReader { input, line: String::new(), line_number: 0, bytes_read: 0 }
    }
}

impl<R: BufRead + Send> EntryReader for JsonLinesReader<R> {
    fn next_entry(&mut self) -> Result<Option<Entry>> {
        loop {
            self.line.clear();
            let read = self.input.read_line(&mut self.line)?;
            if read == 0 {
                return Ok(None);
            }
            self.line_number += 1;
            self.bytes_read += read as u64;
            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }
            return serde_json::from_str(text).map(Some).map_err(|err| {
                Error::new(ErrorKind::Parse, format!("line {}: {}", self.line_number, err))
            });
        }
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

/// Reads stored entries of an id2entry tree in ID order, in batches
pub struct Id2EntrySource<'a> {
    id2entry: &'a ID2Entry,
    next_key: Option<Vec<u8>>,
    batch_size: usize,
}

impl<'a> Id2EntrySource<'a> {
    pub fn new(id2entry: &'a ID2Entry, batch_size: usize) -> Self {
        Id2EntrySource { id2entry, next_key: Some(Vec::new()), batch_size: batch_size.max(1) }
    }

    /// Next batch, empty once every entry was read
    pub fn next_batch(&mut self, txn: &dyn ReadableTransaction) -> Result<Vec<(EntryID, Entry)>> {
        let Some(start) = self.next_key.take() else {
            return Ok(Vec::new());
        };
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut cursor = Cursor::new(txn, self.id2entry.tree());
        let mut found = cursor.position_to_key_or_next(&start)?;
        while found {
            let (Some(key), Some(value)) = (cursor.key(), cursor.value()) else {
                break;
            };
            if batch.len() == self.batch_size {
                self.next_key = Some(key.to_vec());
                break;
            }
            batch.push((EntryID::from_key(key)?, self.id2entry.codec().decode(value)?));
            found = cursor.next()?;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as IoCursor;
    use crate::codec::entry_codec::EntryCodec;
    use crate::core::dn::Dn;
    use crate::storage::btree::BTreeStorage;
    use crate::storage::tree::Storage;

    #[test]
    fn json_lines_skip_blanks_and_report_errors() {
        let entry = Entry::new(Dn::parse("o=test").unwrap()).with("o", &["test"]);
        let input = format!("{}\n\n{}\nnot json\n", serde_json::to_string(&entry).unwrap(), serde_json::to_string(&entry).unwrap());
        let mut reader = JsonLinesReader::new(IoCursor::new(input.into_bytes()));
        assert_eq!(reader.next_entry().unwrap(), Some(entry.clone()));
        assert_eq!(reader.next_entry().unwrap(), Some(entry));
        let err = reader.next_entry().unwrap_err();
        assert!(err.context.starts_with("line 4"));
    }

    #[test]
    fn id2entry_batches() {
        let storage: Box<dyn Storage> = Box::new(BTreeStorage::in_memory());
        let id2entry = ID2Entry::new("o=test", EntryCodec::default());
        storage
            .write(|txn| {
                txn.open_tree(id2entry.tree(), true)?;
                for id in 1..=5 {
                    let entry = Entry::new(Dn::parse(&format!("cn={},o=test", id)).unwrap());
                    id2entry.put(txn, EntryID(id), &entry)?;
                }
                Ok(())
            })
            .unwrap();

        let txn = storage.begin_read().unwrap();
        let mut source = Id2EntrySource::new(&id2entry, 2);
        let mut sizes = Vec::new();
        loop {
            let batch = source.next_batch(txn.as_ref()).unwrap();
            if batch.is_empty() {
                break;
            }
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
