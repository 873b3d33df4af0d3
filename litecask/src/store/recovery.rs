//! Open-time recovery: directory sanitization and KeyDir / tag index
//! reconstruction from hint files, falling back to full data scans.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::datafile::{
    DATA_ENTRY_HEADER_SIZE, DATA_FILE_EXT, DataFile, HINT_FILE_EXT, REMOVE_MARKER_EXT,
    TMP_FILE_EXT, file_sort_index, scan_data_file, scan_hint_file,
};
use crate::error::{Error, Result};
use crate::hash::hash_bytes;
use crate::keydir::{KeyChunk, decode_indexes};
use crate::types::{NO_FILE_ID, NOT_STORED, TOMBSTONE_VALUE_SIZE};

use super::StoreInner;

/// Data files found in a sanitized store directory, oldest first.
pub(super) struct CollectedFiles {
    pub data_paths: Vec<PathBuf>,
    pub max_index: u64,
}

/// Removes the leftovers of interrupted merges and crashes, then lists the
/// data files in replay order. Robustness relies on the atomicity of file
/// creation and renaming.
pub(super) fn sanitize_and_collect(dir: &Path) -> Result<CollectedFiles> {
    // First pass: apply the cleanup instructions encoded in the extensions
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            // Unfinished merge output
            TMP_FILE_EXT => {
                tracing::info!("removing unfinished merge file {}", path.display());
                let _ = std::fs::remove_file(&path);
            }
            // Redundant pre-merge files whose removal was interrupted
            REMOVE_MARKER_EXT => {
                tracing::info!(
                    "removing old data file {}",
                    path.with_extension(DATA_FILE_EXT).display()
                );
                let _ = std::fs::remove_file(path.with_extension(DATA_FILE_EXT));
                let _ = std::fs::remove_file(path.with_extension(HINT_FILE_EXT));
                let _ = std::fs::remove_file(&path);
            }
            _ => {}
        }
    }

    // Second pass: drop orphans and collect the survivors
    let mut ordered: Vec<(PathBuf, f64)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let file_len = |p: &Path| std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
        match ext {
            HINT_FILE_EXT => {
                if file_len(&path.with_extension(DATA_FILE_EXT)) == 0 {
                    let _ = std::fs::remove_file(&path);
                }
            }
            DATA_FILE_EXT => {
                if file_len(&path) == 0 {
                    tracing::info!("removing zero size data file {}", path.display());
                    let _ = std::fs::remove_file(&path);
                } else if let Some(index) = file_sort_index(&path) {
                    ordered.push((path, index));
                }
            }
            _ => {}
        }
    }

    ordered.sort_by(|a, b| a.1.total_cmp(&b.1));
    let max_index = ordered.last().map_or(0, |(_, idx)| *idx as u64);
    Ok(CollectedFiles {
        data_paths: ordered.into_iter().map(|(p, _)| p).collect(),
        max_index,
    })
}

/// One record lifted from a hint or data file during recovery.
struct LoadedRecord {
    exp_time_sec: u32,
    value_size: u32,
    file_offset: u32,
    key: Vec<u8>,
    index_bytes: Vec<u8>,
}

impl StoreInner {
    /// Replays the given data files (oldest first) into the KeyDir, the tag
    /// index and the per-file accounting. Hint files are preferred; a full
    /// data scan also truncates a broken tail in place.
    pub(super) fn load_data_files(&self, data_paths: &[PathBuf]) -> Result<()> {
        for path in data_paths {
            let file_id = self.files.write().alloc_file_id();
            let mut records: Vec<LoadedRecord> = Vec::new();

            let hint_path = path.with_extension(HINT_FILE_EXT);
            self.logger.debug(&format!("loading data file {}", path.display()));
            let hint_usable = match scan_hint_file(&hint_path, |e| {
                records.push(LoadedRecord {
                    exp_time_sec: e.header.exp_time_sec,
                    value_size: e.header.value_size,
                    file_offset: e.header.file_offset,
                    key: e.key.to_vec(),
                    index_bytes: e.index_bytes.to_vec(),
                })
            }) {
                Ok(usable) => usable,
                Err(e) => {
                    self.logger
                        .warn(&format!("hint file {} unreadable: {e}", hint_path.display()));
                    false
                }
            };

            if !hint_usable {
                records.clear();
                self.hint_files_missing.store(true, Ordering::Relaxed);
                let summary = scan_data_file(path, |e| {
                    records.push(LoadedRecord {
                        exp_time_sec: e.header.exp_time_sec,
                        value_size: e.header.value_size,
                        file_offset: e.offset,
                        key: e.key.to_vec(),
                        index_bytes: e.index_bytes.to_vec(),
                    })
                })?;
                let on_disk = std::fs::metadata(path)?.len();
                if summary.valid_bytes < on_disk {
                    self.logger.warn(&format!(
                        "truncating {} from {} to {} bytes (broken tail)",
                        path.display(),
                        on_disk,
                        summary.valid_bytes
                    ));
                    let file = std::fs::OpenOptions::new().write(true).open(path)?;
                    file.set_len(summary.valid_bytes)?;
                }
            }

            let df = Arc::new(DataFile::open_read(path.clone()).map_err(Error::Io)?);
            self.files.write().files[file_id as usize] = Some(Arc::clone(&df));

            for record in records {
                self.apply_loaded_record(file_id, &df, record);
            }
        }
        Ok(())
    }

    fn apply_loaded_record(&self, file_id: u16, df: &DataFile, record: LoadedRecord) {
        let hash64 = hash_bytes(&record.key);
        let now = self.now_sec();
        let base_size = (DATA_ENTRY_HEADER_SIZE + record.key.len()) as u64;

        if record.value_size == TOMBSTONE_VALUE_SIZE {
            df.record_append(base_size, true);
            if let Some(existing) = self.keydir.find(hash64 as u32, &record.key) {
                // A version still precedes this tombstone: keep it to mask
                // that version, and account the masked bytes as dead
                if let Some(old_df) = self.files.read().get(existing.file_id) {
                    let masked = if existing.is_tombstone() {
                        0
                    } else {
                        u64::from(existing.value_size)
                    };
                    old_df.record_dead(base_size + u64::from(existing.index_size) + masked);
                }
                let prior_file_id = if existing.is_tombstone() {
                    existing.prior_file_id
                } else {
                    existing.file_id
                };
                let chunk = KeyChunk {
                    exp_time_sec: 0,
                    value_size: TOMBSTONE_VALUE_SIZE,
                    cache_loc: NOT_STORED,
                    file_offset: record.file_offset,
                    file_id,
                    key_size: record.key.len() as u16,
                    index_size: 0,
                    change_counter: record.file_offset as u8,
                    prior_file_id,
                };
                if let Err(e) = self.keydir.insert_entry(hash64, &record.key, &[], chunk) {
                    self.logger
                        .warn(&format!("recovery: cannot index a tombstone: {e}"));
                }
            } else {
                // Nothing to mask: the tombstone itself is dead weight
                df.record_dead(base_size);
            }
            return;
        }

        let record_size =
            base_size + record.index_bytes.len() as u64 + u64::from(record.value_size);
        df.record_append(record_size, false);

        if record.exp_time_sec > 0 && record.exp_time_sec <= now {
            df.record_dead(record_size);
            return;
        }

        let indexes = decode_indexes(&record.index_bytes);
        let chunk = KeyChunk {
            exp_time_sec: record.exp_time_sec,
            value_size: record.value_size,
            cache_loc: NOT_STORED,
            file_offset: record.file_offset,
            file_id,
            key_size: record.key.len() as u16,
            index_size: record.index_bytes.len() as u8,
            change_counter: record.file_offset as u8,
            prior_file_id: NO_FILE_ID,
        };
        match self.keydir.insert_entry(hash64, &record.key, &indexes, chunk) {
            Ok(old) => {
                if let Some(old) = &old {
                    if let Some(old_df) = self.files.read().get(old.file_id) {
                        old_df.record_dead(
                            base_size
                                + u64::from(old.index_size)
                                + u64::from(old.live_value_size()),
                        );
                    }
                }
                self.publish_tag_diff(&record.key, &indexes, old.as_ref(), hash64 as u32);
            }
            Err(e) => {
                self.logger
                    .warn(&format!("recovery: cannot index an entry: {e}"));
            }
        }
    }
}
