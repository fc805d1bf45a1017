//! Table of contents: the versioned list of an index's segments.
//!
//! Every commit writes a new generation `_{index}_{generation}.toc`. The file
//! is written under a temporary name and renamed into place without
//! overwriting, so the canonical name only ever refers to a complete file and
//! two writers can never publish the same generation.
//!
//! Layout, written through [`StructWriter`] with a trailing CRC32:
//!
//! ```text
//! varint 4, varint 8, varint 4      sizes of i32, i64, f32
//! i32 -12345                        sentinel
//! i32 TOC_FORMAT                    format version
//! varint * 3                        release version
//! bytes                             bincode Schema
//! u64                               generation
//! i32 0                             reserved
//! bytes                             bincode Vec<Segment>
//! ```

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use regex::Regex;

use crate::error::{Result, WhorlError};
use crate::index::segment::Segment;
use crate::schema::Schema;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

pub const TOC_FORMAT: i32 = -111;
const SENTINEL: i32 = -12345;

/// Name of the TOC file of a generation.
pub fn toc_file_name(index_name: &str, generation: u64) -> String {
    format!("_{index_name}_{generation}.toc")
}

fn toc_pattern(index_name: &str) -> Result<Regex> {
    Regex::new(&format!(r"^_{}_(\d+)\.toc$", regex::escape(index_name)))
        .map_err(|e| WhorlError::other(format!("bad TOC pattern: {e}")))
}

fn segment_pattern(index_name: &str) -> Result<Regex> {
    Regex::new(&format!(r"^_{}_([0-9a-f]{{32}})\.\w+$", regex::escape(index_name)))
        .map_err(|e| WhorlError::other(format!("bad segment pattern: {e}")))
}

fn release() -> [u64; 3] {
    [
        env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
        env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
    ]
}

/// One generation of an index.
#[derive(Debug, Clone, PartialEq)]
pub struct Toc {
    pub schema: Schema,
    pub segments: Vec<Segment>,
    pub generation: u64,
    pub release: [u64; 3],
}

impl Toc {
    pub fn new(schema: Schema, segments: Vec<Segment>, generation: u64) -> Self {
        Toc {
            schema,
            segments,
            generation,
            release: release(),
        }
    }

    /// Start a new index: remove every file of `index_name` and write an
    /// empty generation 0.
    pub fn create(storage: &dyn Storage, schema: Schema, index_name: &str) -> Result<Toc> {
        let prefix = format!("_{index_name}_");
        for name in storage.list_files()? {
            if name.starts_with(&prefix) {
                remove_quietly(storage, &name);
            }
        }
        let toc = Toc::new(schema, Vec::new(), 0);
        toc.write(storage, index_name)?;
        Ok(toc)
    }

    /// Highest generation present in `storage`, if any.
    pub fn latest_generation(storage: &dyn Storage, index_name: &str) -> Result<Option<u64>> {
        let pattern = toc_pattern(index_name)?;
        Ok(storage
            .list_files()?
            .iter()
            .filter_map(|name| pattern.captures(name))
            .filter_map(|caps| caps[1].parse::<u64>().ok())
            .max())
    }

    /// Publish this generation.
    ///
    /// Fails with [`WhorlError::OutOfDate`] when the generation already
    /// exists, which means another writer committed first.
    pub fn write(&self, storage: &dyn Storage, index_name: &str) -> Result<()> {
        let canonical = toc_file_name(index_name, self.generation);
        let (temp_name, output) = storage.create_temp_output(&canonical)?;

        let mut writer = StructWriter::new(output);
        writer.write_varint(size_of::<i32>() as u64)?;
        writer.write_varint(size_of::<i64>() as u64)?;
        writer.write_varint(size_of::<f32>() as u64)?;
        writer.write_i32(SENTINEL)?;
        writer.write_i32(TOC_FORMAT)?;
        for part in self.release {
            writer.write_varint(part)?;
        }
        writer.write_bytes(&bincode::serialize(&self.schema)?)?;
        writer.write_u64(self.generation)?;
        writer.write_i32(0)?;
        writer.write_bytes(&bincode::serialize(&self.segments)?)?;
        writer.close()?;

        if let Err(e) = storage.rename_file(&temp_name, &canonical, false) {
            remove_quietly(storage, &temp_name);
            if storage.file_exists(&canonical) {
                return Err(WhorlError::out_of_date(format!(
                    "generation {} of {index_name} already exists",
                    self.generation
                )));
            }
            return Err(e);
        }
        debug!("wrote {canonical} with {} segments", self.segments.len());
        Ok(())
    }

    /// Read a generation, the latest one when `generation` is `None`.
    ///
    /// A concurrent cleanup can delete files between listing and opening, so
    /// I/O failures are retried `retries` times, `delay` apart.
    pub fn read(
        storage: &dyn Storage,
        index_name: &str,
        generation: Option<u64>,
        retries: usize,
        delay: Duration,
    ) -> Result<Toc> {
        let mut attempt = 0;
        loop {
            let result = match generation {
                Some(generation) => Ok(generation),
                None => Toc::latest_generation(storage, index_name)?.ok_or_else(|| {
                    WhorlError::empty_index(format!("no TOC found for index {index_name}"))
                }),
            }
            .and_then(|generation| Toc::read_generation(storage, index_name, generation));

            match result {
                Err(e) if e.is_transient_io() && attempt < retries => {
                    attempt += 1;
                    debug!("retrying TOC read of {index_name} ({attempt}/{retries}): {e}");
                    thread::sleep(delay);
                }
                other => return other,
            }
        }
    }

    fn read_generation(storage: &dyn Storage, index_name: &str, generation: u64) -> Result<Toc> {
        let name = toc_file_name(index_name, generation);
        let mut reader = StructReader::new(storage.open_input(&name)?)?;

        let sizes = [
            reader.read_varint()?,
            reader.read_varint()?,
            reader.read_varint()?,
        ];
        let expected = [
            size_of::<i32>() as u64,
            size_of::<i64>() as u64,
            size_of::<f32>() as u64,
        ];
        if sizes != expected {
            return Err(WhorlError::format(format!(
                "{name} was written on an incompatible platform"
            )));
        }
        if reader.read_i32()? != SENTINEL {
            return Err(WhorlError::format(format!("{name} has a bad sentinel")));
        }
        let format = reader.read_i32()?;
        if format != TOC_FORMAT {
            return Err(WhorlError::format(format!(
                "{name} has format {format}, expected {TOC_FORMAT}"
            )));
        }
        let release = [
            reader.read_varint()?,
            reader.read_varint()?,
            reader.read_varint()?,
        ];
        let schema: Schema = bincode::deserialize(&reader.read_bytes()?)?;
        let stored_generation = reader.read_u64()?;
        if stored_generation != generation {
            return Err(WhorlError::format(format!(
                "{name} claims generation {stored_generation}"
            )));
        }
        let _reserved = reader.read_i32()?;
        let segments: Vec<Segment> = bincode::deserialize(&reader.read_bytes()?)?;
        if !reader.verify_checksum()? {
            return Err(WhorlError::format(format!("{name} failed its checksum")));
        }
        reader.close()?;

        debug!("read {name}: {} segments", segments.len());
        Ok(Toc {
            schema,
            segments,
            generation,
            release,
        })
    }

    /// Delete TOC files of other generations and files of segments that are
    /// not in `segments`. Failures are logged and ignored; another process may
    /// be cleaning up at the same time. Temporary files are left alone.
    pub fn clean_files(
        storage: &dyn Storage,
        index_name: &str,
        generation: u64,
        segments: &[Segment],
    ) -> Result<()> {
        let tocs = toc_pattern(index_name)?;
        let segment_files = segment_pattern(index_name)?;
        let live: HashSet<&str> = segments.iter().map(Segment::segment_id).collect();

        for name in storage.list_files()? {
            if let Some(caps) = tocs.captures(&name) {
                if caps[1].parse::<u64>().ok() != Some(generation) {
                    remove_quietly(storage, &name);
                }
            } else if let Some(caps) = segment_files.captures(&name)
                && !live.contains(&caps[1])
            {
                remove_quietly(storage, &name);
            }
        }
        Ok(())
    }
}

fn remove_quietly(storage: &dyn Storage, name: &str) {
    match storage.delete_file(name) {
        Ok(()) => debug!("removed {name}"),
        Err(WhorlError::NotFound(_)) => debug!("{name} was already removed"),
        Err(e) => warn!("could not remove {name}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use crate::storage::memory::MemoryStorage;
    use std::io::Write;

    fn schema() -> Schema {
        Schema::builder()
            .add_field("body", FieldType::text())
            .build()
            .unwrap()
    }

    fn read_latest(storage: &dyn Storage) -> Result<Toc> {
        Toc::read(storage, "main", None, 2, Duration::from_millis(1))
    }

    #[test]
    fn test_create_and_read() {
        let storage = MemoryStorage::new_default();
        assert!(matches!(read_latest(&storage), Err(WhorlError::EmptyIndex(_))));

        let toc = Toc::create(&storage, schema(), "main").unwrap();
        assert_eq!(toc.generation, 0);
        assert_eq!(Toc::latest_generation(&storage, "main").unwrap(), Some(0));

        let read = read_latest(&storage).unwrap();
        assert_eq!(read, toc);
    }

    #[test]
    fn test_generation_cannot_be_overwritten() {
        let storage = MemoryStorage::new_default();
        let toc = Toc::create(&storage, schema(), "main").unwrap();

        let next = Toc::new(toc.schema.clone(), vec![Segment::new("main", 2, false)], 1);
        next.write(&storage, "main").unwrap();
        assert!(matches!(
            next.write(&storage, "main"),
            Err(WhorlError::OutOfDate(_))
        ));
        assert_eq!(read_latest(&storage).unwrap().segments.len(), 1);
        assert!(!storage.list_files().unwrap().iter().any(|f| f.ends_with(".tmp")));
    }

    #[test]
    fn test_temp_files_are_invisible() {
        let storage = MemoryStorage::new_default();
        Toc::create(&storage, schema(), "main").unwrap();

        let (_, mut output) = storage.create_temp_output("_main_1.toc").unwrap();
        output.write_all(b"half written").unwrap();
        output.close().unwrap();

        assert_eq!(Toc::latest_generation(&storage, "main").unwrap(), Some(0));
        assert_eq!(read_latest(&storage).unwrap().generation, 0);
    }

    #[test]
    fn test_corruption_is_format_error() {
        let storage = MemoryStorage::new_default();
        Toc::create(&storage, schema(), "main").unwrap();
        let mut bytes = storage.open_bytes("_main_0.toc").unwrap().as_slice().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let mut output = storage.create_output("_main_0.toc").unwrap();
        output.write_all(&bytes).unwrap();
        output.close().unwrap();

        assert!(matches!(read_latest(&storage), Err(WhorlError::Format(_))));
    }

    #[test]
    fn test_missing_generation_is_retried_then_reported() {
        let storage = MemoryStorage::new_default();
        Toc::create(&storage, schema(), "main").unwrap();
        let result = Toc::read(&storage, "main", Some(7), 3, Duration::from_millis(1));
        assert!(matches!(result, Err(WhorlError::NotFound(_))));
    }

    #[test]
    fn test_clean_files() {
        let storage = MemoryStorage::new_default();
        let toc = Toc::create(&storage, schema(), "main").unwrap();
        let live = Segment::new("main", 1, false);
        let dead = Segment::new("main", 1, false);
        for name in [live.file_name("trm"), dead.file_name("trm"), "other.txt".to_string()] {
            let mut output = storage.create_output(&name).unwrap();
            output.write_all(b"x").unwrap();
            output.close().unwrap();
        }
        let next = Toc::new(toc.schema.clone(), vec![live.clone()], 1);
        next.write(&storage, "main").unwrap();

        Toc::clean_files(&storage, "main", 1, &next.segments).unwrap();
        let files = storage.list_files().unwrap();
        assert!(files.contains(&live.file_name("trm")));
        assert!(files.contains(&"other.txt".to_string()));
        assert!(files.contains(&"_main_1.toc".to_string()));
        assert!(!files.contains(&dead.file_name("trm")));
        assert!(!files.contains(&"_main_0.toc".to_string()));
    }
}
