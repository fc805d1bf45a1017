//! The term dictionary of one segment: a fielded ordered hash file mapping
//! `(field, term)` to a [`FileTermInfo`], and the postings file it points into.

use std::sync::Arc;

use crate::codec::postings::PostingsCursor;
use crate::codec::terminfo::{FileTermInfo, TermInfo};
use crate::error::{Result, WhorlError};
use crate::hashtable::fielded::FieldedOrderedHashReader;
use crate::schema::PostingFormat;
use crate::storage::{FileBytes, Storage};

#[derive(Debug, Clone)]
pub struct TermsReader {
    dictionary: FieldedOrderedHashReader,
    postings: FileBytes,
}

impl TermsReader {
    pub fn open(storage: &dyn Storage, terms_name: &str, postings_name: &str) -> Result<Self> {
        Ok(TermsReader {
            dictionary: FieldedOrderedHashReader::open(storage, terms_name)?,
            postings: storage.open_bytes(postings_name)?,
        })
    }

    pub fn field_names(&self) -> &[String] {
        self.dictionary.field_names()
    }

    pub fn term_count(&self, field: &str) -> usize {
        self.dictionary.term_count(field)
    }

    pub fn contains_term(&self, field: &str, term: &[u8]) -> Result<bool> {
        self.dictionary.contains_term(field, term)
    }

    pub fn file_term_info(&self, field: &str, term: &[u8]) -> Result<Option<FileTermInfo>> {
        match self.dictionary.term_get(field, term)? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn term_info(&self, field: &str, term: &[u8]) -> Result<TermInfo> {
        self.file_term_info(field, term)?
            .map(|fti| fti.info)
            .ok_or_else(|| WhorlError::term_not_found(field, term))
    }

    /// Every `(field, term)` pair in order.
    pub fn iter_all(self: &Arc<Self>) -> TermIter {
        TermIter {
            reader: Arc::clone(self),
            only_field: None,
            fieldnum: 0,
            ordinal: 0,
        }
    }

    /// Terms of `field` from the smallest term `>= start`, in order.
    pub fn iter_field_from(self: &Arc<Self>, field: &str, start: &[u8]) -> Result<TermIter> {
        let (fieldnum, ordinal) = match self.dictionary.seek(field, start)? {
            Some(found) => found,
            None => (self.dictionary.field_names().len(), 0),
        };
        Ok(TermIter {
            reader: Arc::clone(self),
            only_field: Some(fieldnum),
            fieldnum,
            ordinal,
        })
    }

    /// A cursor over the postings of a term, if the term exists.
    pub fn cursor(
        &self,
        field: &str,
        term: &[u8],
        format: PostingFormat,
    ) -> Result<Option<(TermInfo, PostingsCursor)>> {
        let Some(fti) = self.file_term_info(field, term)? else {
            return Ok(None);
        };
        let start = fti.offset as usize;
        let region = self.postings.slice(start..start + fti.length as usize)?;
        let cursor = PostingsCursor::new(region, format, fti.block_count)?;
        Ok(Some((fti.info, cursor)))
    }
}

/// A streaming iterator over owned `(field, term)` pairs of one segment.
#[derive(Debug, Clone)]
pub struct TermIter {
    reader: Arc<TermsReader>,
    only_field: Option<usize>,
    fieldnum: usize,
    ordinal: usize,
}

impl Iterator for TermIter {
    type Item = Result<(String, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let dictionary = &self.reader.dictionary;
        loop {
            let name = dictionary.field_names().get(self.fieldnum)?;
            if self.ordinal < dictionary.field_len(self.fieldnum) {
                let term = dictionary.term_at(self.fieldnum, self.ordinal);
                self.ordinal += 1;
                return Some(term.map(|t| (name.clone(), t.to_vec())));
            }
            if self.only_field.is_some() {
                return None;
            }
            self.fieldnum += 1;
            self.ordinal = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::postings::PostingsWriter;
    use crate::hashtable::HashType;
    use crate::hashtable::fielded::FieldedOrderedHashWriter;
    use crate::storage::memory::MemoryStorage;

    fn build(storage: &MemoryStorage) -> Arc<TermsReader> {
        let mut dictionary = FieldedOrderedHashWriter::create(storage, "s.trm", HashType::Cdb).unwrap();
        let output = storage.create_output("s.pst").unwrap();
        let mut postings = PostingsWriter::new(output, PostingFormat::Existence, 2);

        for (field, terms) in [("body", vec!["apple", "apricot", "banana"]), ("tag", vec!["x"])] {
            dictionary.start_field(field).unwrap();
            for (i, term) in terms.iter().enumerate() {
                postings.start_term().unwrap();
                for id in 0..=(i as u64) {
                    postings.add(id * 2, 1.0, &[], 1).unwrap();
                }
                let fti = postings.finish_term().unwrap();
                dictionary
                    .add(term.as_bytes(), &bincode::serialize(&fti).unwrap())
                    .unwrap();
            }
        }
        dictionary.close().unwrap();
        postings.close().unwrap();
        Arc::new(TermsReader::open(storage, "s.trm", "s.pst").unwrap())
    }

    #[test]
    fn test_term_iteration() {
        let storage = MemoryStorage::new_default();
        let reader = build(&storage);

        let all: Vec<(String, Vec<u8>)> = reader.iter_all().collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[3], ("tag".to_string(), b"x".to_vec()));

        let from: Vec<Vec<u8>> = reader
            .iter_field_from("body", b"apr")
            .unwrap()
            .map(|item| item.unwrap().1)
            .collect();
        assert_eq!(from, vec![b"apricot".to_vec(), b"banana".to_vec()]);

        assert_eq!(reader.iter_field_from("nope", b"").unwrap().count(), 0);
    }

    #[test]
    fn test_cursor_and_info() {
        let storage = MemoryStorage::new_default();
        let reader = build(&storage);

        let (info, mut cursor) = reader
            .cursor("body", b"banana", PostingFormat::Existence)
            .unwrap()
            .unwrap();
        assert_eq!(info.doc_frequency(), 3);
        let mut ids = Vec::new();
        while cursor.is_active() {
            ids.push(cursor.id());
            cursor.next().unwrap();
        }
        assert_eq!(ids, vec![0, 2, 4]);

        assert!(reader.cursor("body", b"cherry", PostingFormat::Existence).unwrap().is_none());
        assert!(matches!(
            reader.term_info("tag", b"y"),
            Err(WhorlError::TermNotFound { .. })
        ));
    }
}
