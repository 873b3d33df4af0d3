//! Merge thread: selects fragmented data files, streams their live records
//! into a fresh compacted sequence of data and hint files, and installs the
//! result atomically. A failed merge leaves the store on its pre-merge
//! state; a crash mid-merge is healed by the open-time sanitization.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::datafile::{
    DATA_FILE_EXT, DataEntryHeader, DataFile, HINT_FILE_EXT, HintEntryHeader, REMOVE_MARKER_EXT,
    ScannedEntry, add_extension, create_hint_file, scan_data_file, write_data_entry,
    write_hint_entry,
};
use crate::error::{Error, Result};
use crate::hash::hash_bytes;
use crate::types::NO_FILE_ID;

use super::{StoreInner, Wake};

pub(super) fn merge_thread_main(inner: &Arc<StoreInner>) {
    inner.logger.debug("merge thread started");
    loop {
        let period = Duration::from_millis(u64::from(inner.config.lock().merge_cycle_period_ms));
        match inner.merge.wait_cycle(period) {
            Wake::Exit => break,
            Wake::Run => {
                inner.run_merge_cycle();
                inner.merge.clear_work();
            }
        }
    }
    inner.logger.debug("merge thread stopped");
}

/// KeyDir relocation for one merged record, applied only if the entry still
/// points at the old location.
struct KeyDirPatch {
    key_hash: u32,
    old_file_offset: u32,
    new_file_offset: u32,
    new_file_id: u16,
}

/// A data file selected for merging, with the relocations gathered while
/// its live records were copied.
struct MergeFileInfo {
    file_id: u16,
    path: PathBuf,
    patches: Vec<KeyDirPatch>,
}

/// One compacted output file pair, written under `.tmp` names until the
/// whole merge succeeded.
struct MergeOutput {
    file_id: u16,
    data_tmp: PathBuf,
    data_final: PathBuf,
    hint_tmp: PathBuf,
    hint_final: PathBuf,
}

/// Live writer over the current output pair.
struct OutputWriters {
    data: BufWriter<File>,
    hint: BufWriter<File>,
    offset: u32,
    df: Arc<DataFile>,
}

impl StoreInner {
    pub(super) fn run_merge_cycle(&self) {
        self.counters.merge_cycle_qty.fetch_add(1, Ordering::Relaxed);
        self.update_now();
        let cfg = *self.config.lock();

        let mut selected = Vec::new();
        if self.is_worth_merging(
            cfg.merge_trigger_data_file_fragmentation_percentage,
            cfg.merge_trigger_data_file_dead_byte_threshold,
        ) {
            selected = self.select_files_to_merge(
                cfg.merge_select_data_file_fragmentation_percentage,
                cfg.merge_select_data_file_dead_byte_threshold,
                cfg.merge_select_data_file_small_size_threshold,
            );
        }

        if !selected.is_empty() {
            // Sealing the active file first guarantees every selected file
            // is immutable and gives the compacted outputs a unique name
            let basename = {
                let _guard = self.active_mutex.lock();
                match self.create_new_active_file_locked() {
                    Ok(basename) => basename,
                    Err(e) => {
                        self.logger.error(&format!("merge: cannot switch the active file: {e}"));
                        return;
                    }
                }
            };

            match self.create_merged_files(&mut selected, &basename, cfg.data_file_max_bytes) {
                Ok((outputs, dropped_tombstones)) => {
                    if self.install_merged(&selected, &outputs, &dropped_tombstones) {
                        self.counters
                            .merge_cycle_with_merge_qty
                            .fetch_add(1, Ordering::Relaxed);
                        self.counters.merge_gained_data_file_qty.fetch_add(
                            (selected.len() as u64).saturating_sub(outputs.len() as u64),
                            Ordering::Relaxed,
                        );
                    }
                }
                Err(e) => {
                    self.logger
                        .error(&format!("merge failed, keeping the pre-merge state: {e}"));
                }
            }
        }

        self.backfill_hint_files();
    }

    fn is_worth_merging(&self, fragmentation_percent: u32, dead_byte_threshold: u64) -> bool {
        let files = self.files.read();
        for df in files.files.iter().flatten() {
            if !df.is_open() {
                continue;
            }
            let dead = df.dead_byte_count();
            if dead * 100 > df.live_bytes() * u64::from(fragmentation_percent) {
                self.logger
                    .debug("merge needed: a data file exceeds the dead byte ratio");
                return true;
            }
            if dead > dead_byte_threshold {
                self.logger
                    .debug("merge needed: a data file exceeds the dead byte threshold");
                return true;
            }
        }
        false
    }

    fn select_files_to_merge(
        &self,
        fragmentation_percent: u32,
        dead_byte_threshold: u64,
        small_size_threshold: u64,
    ) -> Vec<MergeFileInfo> {
        let files = self.files.read();
        let mut selected = Vec::new();
        for (id, slot) in files.files.iter().enumerate() {
            let Some(df) = slot else { continue };
            if !df.is_open() {
                continue;
            }
            let dead = df.dead_byte_count();
            let bytes = df.live_bytes();
            let include = dead * 100 > bytes * u64::from(fragmentation_percent)
                || dead > dead_byte_threshold
                || bytes < small_size_threshold;
            self.logger.debug(&format!(
                "merge selection: {} {}",
                df.path.display(),
                if include { "will be merged" } else { "is skipped" }
            ));
            if include {
                selected.push(MergeFileInfo {
                    file_id: id as u16,
                    path: df.path.clone(),
                    patches: Vec::new(),
                });
            }
        }
        selected
    }

    /// Streams the live records of the selected files into `.tmp` compacted
    /// outputs. Returns the outputs and the tombstones that can be dropped
    /// entirely. Any error tears the partial outputs down.
    fn create_merged_files(
        &self,
        selected: &mut [MergeFileInfo],
        basename: &str,
        data_file_max_bytes: u64,
    ) -> Result<(Vec<MergeOutput>, Vec<(u32, Vec<u8>)>)> {
        let selected_ids: HashSet<u16> = selected.iter().map(|info| info.file_id).collect();

        // First pass: keys with a pre-tombstone version inside the
        // selection. A tombstone masking only those versions must survive
        // the merge; one masking nothing anywhere can be dropped.
        let mut value_keys: HashSet<u64> = HashSet::new();
        for info in selected.iter() {
            scan_data_file(&info.path, |entry| {
                if !entry.header.is_tombstone() {
                    value_keys.insert(hash_bytes(entry.key));
                }
            })?;
        }

        let mut outputs: Vec<MergeOutput> = Vec::new();
        let mut writers: Option<OutputWriters> = None;
        let mut out_count: u16 = 0;
        let mut dropped_tombstones: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut read_bytes: u64 = 0;
        let mut written_bytes: u64 = 0;

        let result = (|| -> Result<()> {
            for info in selected.iter_mut() {
                let path = info.path.clone();
                let source_file_id = info.file_id;
                let mut patches = Vec::new();
                let mut io_error: Option<Error> = None;

                scan_data_file(&path, |entry| {
                    if io_error.is_some() {
                        return;
                    }
                    read_bytes += entry.header.record_size() as u64;
                    if let Err(e) = self.merge_one_record(
                        source_file_id,
                        &entry,
                        &selected_ids,
                        &value_keys,
                        basename,
                        data_file_max_bytes,
                        &mut writers,
                        &mut outputs,
                        &mut out_count,
                        &mut patches,
                        &mut dropped_tombstones,
                        &mut written_bytes,
                    ) {
                        io_error = Some(e);
                    }
                })?;
                if let Some(e) = io_error {
                    return Err(e);
                }
                info.patches = patches;
            }
            if let Some(mut w) = writers.take() {
                w.data.flush().map_err(Error::Io)?;
                w.hint.flush().map_err(Error::Io)?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            drop(writers);
            self.teardown_outputs(&outputs);
            return Err(e);
        }

        self.counters
            .merge_gained_bytes
            .fetch_add(read_bytes.saturating_sub(written_bytes), Ordering::Relaxed);
        Ok((outputs, dropped_tombstones))
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_one_record(
        &self,
        source_file_id: u16,
        entry: &ScannedEntry<'_>,
        selected_ids: &HashSet<u16>,
        value_keys: &HashSet<u64>,
        basename: &str,
        data_file_max_bytes: u64,
        writers: &mut Option<OutputWriters>,
        outputs: &mut Vec<MergeOutput>,
        out_count: &mut u16,
        patches: &mut Vec<KeyDirPatch>,
        dropped_tombstones: &mut Vec<(u32, Vec<u8>)>,
        written_bytes: &mut u64,
    ) -> Result<()> {
        let hash64 = hash_bytes(entry.key);
        // The KeyDir is authoritative: only the record it points at is live
        let Some(chunk) = self.keydir.find(hash64 as u32, entry.key) else {
            return Ok(());
        };
        if chunk.file_id != source_file_id || chunk.file_offset != entry.offset {
            return Ok(());
        }

        if entry.header.is_tombstone() {
            let prior_survives = chunk.prior_file_id != NO_FILE_ID
                && !selected_ids.contains(&chunk.prior_file_id)
                && self
                    .files
                    .read()
                    .get(chunk.prior_file_id)
                    .is_some_and(|df| df.is_open());
            if !value_keys.contains(&hash64) && !prior_survives {
                // No version of this key survives the merge anywhere: the
                // tombstone masks nothing and would only resurrect work
                dropped_tombstones.push((hash64 as u32, entry.key.to_vec()));
                return Ok(());
            }
        }

        let record_size = entry.header.record_size();

        // Roll the output once it would exceed the configured file size
        let needs_new = match writers {
            None => true,
            Some(w) => w.offset > 0 && u64::from(w.offset) + record_size as u64 > data_file_max_bytes,
        };
        if needs_new {
            if let Some(mut w) = writers.take() {
                w.data.flush().map_err(Error::Io)?;
                w.hint.flush().map_err(Error::Io)?;
            }
            *out_count += 1;
            let directory = self.files.read().directory.clone();
            let stem = format!("{basename}.{:05}", *out_count);
            let data_final = directory.join(format!("{stem}.{DATA_FILE_EXT}"));
            let hint_final = directory.join(format!("{stem}.{HINT_FILE_EXT}"));
            let data_tmp = add_extension(&data_final, crate::datafile::TMP_FILE_EXT);
            let hint_tmp = add_extension(&hint_final, crate::datafile::TMP_FILE_EXT);

            let data = BufWriter::new(File::create(&data_tmp).map_err(Error::Io)?);
            let hint = BufWriter::new(File::create(&hint_tmp).map_err(Error::Io)?);

            let df = Arc::new(DataFile::unopened(data_final.clone()));
            let file_id = {
                let mut files = self.files.write();
                let id = files.alloc_file_id();
                files.files[id as usize] = Some(Arc::clone(&df));
                id
            };
            outputs.push(MergeOutput {
                file_id,
                data_tmp,
                data_final,
                hint_tmp,
                hint_final,
            });
            *writers = Some(OutputWriters { data, hint, offset: 0, df });
        }

        let w = writers.as_mut().expect("output writer just ensured");
        let header = DataEntryHeader {
            checksum: entry.header.checksum,
            exp_time_sec: entry.header.exp_time_sec,
            value_size: entry.header.value_size,
            key_size: entry.header.key_size,
            index_size: entry.header.index_size,
        };
        write_data_entry(&mut w.data, &header, entry.key, entry.index_bytes, entry.value)
            .map_err(Error::Io)?;
        let hint_header = HintEntryHeader {
            file_offset: w.offset,
            exp_time_sec: entry.header.exp_time_sec,
            value_size: entry.header.value_size,
            key_size: entry.header.key_size,
            index_size: entry.header.index_size,
        };
        write_hint_entry(&mut w.hint, &hint_header, entry.key, entry.index_bytes)
            .map_err(Error::Io)?;

        let out_file_id = outputs.last().expect("output just ensured").file_id;
        patches.push(KeyDirPatch {
            key_hash: hash64 as u32,
            old_file_offset: entry.offset,
            new_file_offset: w.offset,
            new_file_id: out_file_id,
        });
        w.df.record_append(record_size as u64, entry.header.is_tombstone());
        w.offset += record_size as u32;
        *written_bytes += record_size as u64;
        Ok(())
    }

    /// Puts the compacted files in place: rename, marker files, KeyDir
    /// patches, old file unlink. Returns false when the installation had to
    /// be rolled back.
    fn install_merged(
        &self,
        selected: &[MergeFileInfo],
        outputs: &[MergeOutput],
        dropped_tombstones: &[(u32, Vec<u8>)],
    ) -> bool {
        // Make every output live; on any failure the whole merge is undone
        for (done, out) in outputs.iter().enumerate() {
            let renamed = std::fs::rename(&out.data_tmp, &out.data_final)
                .and_then(|()| std::fs::rename(&out.hint_tmp, &out.hint_final))
                .and_then(|()| {
                    self.files
                        .read()
                        .get(out.file_id)
                        .map_or(Ok(()), |df| df.open_handle())
                });
            if let Err(e) = renamed {
                self.logger
                    .error(&format!("merge: cannot install {}: {e}", out.data_final.display()));
                // Remove what was already renamed plus the remaining tmp
                for out in &outputs[..=done] {
                    let _ = std::fs::remove_file(&out.data_final);
                    let _ = std::fs::remove_file(&out.hint_final);
                }
                self.teardown_outputs(outputs);
                return false;
            }
        }

        // Tag the old files for removal: a crash from here on is healed at
        // the next open by the sanitization pass
        for info in selected {
            self.logger.debug(&format!(
                "tagging old data file {} for removal",
                info.path.display()
            ));
            let _ = File::create(info.path.with_extension(REMOVE_MARKER_EXT));
        }

        // Repoint the KeyDir and retire the old files one by one
        for info in selected {
            let mut files = self.files.write();
            for patch in &info.patches {
                self.keydir.update_merged_value_location(
                    patch.key_hash,
                    info.file_id,
                    patch.old_file_offset,
                    patch.new_file_id,
                    patch.new_file_offset,
                );
            }
            if let Some(df) = files.get(info.file_id) {
                df.close_handle();
                // Removal order matters across a hard interruption
                let _ = std::fs::remove_file(&info.path);
                let _ = std::fs::remove_file(info.path.with_extension(HINT_FILE_EXT));
                let _ = std::fs::remove_file(info.path.with_extension(REMOVE_MARKER_EXT));
                files.files[info.file_id as usize] = None;
                files.free_ids.push(info.file_id);
            }
        }

        // Dropped tombstones vanish from the directory as well
        for (hash, key) in dropped_tombstones {
            self.keydir.remove(*hash, key);
        }
        true
    }

    /// Deletes partial `.tmp` outputs and releases their file ids.
    fn teardown_outputs(&self, outputs: &[MergeOutput]) {
        let mut files = self.files.write();
        for out in outputs {
            let _ = std::fs::remove_file(&out.data_tmp);
            let _ = std::fs::remove_file(&out.hint_tmp);
            if let Some(df) = files.get(out.file_id) {
                df.close_handle();
            }
            files.files[out.file_id as usize] = None;
            files.free_ids.push(out.file_id);
        }
    }

    /// One-shot backfill of the hint files skipped at open time; the active
    /// file never gets one.
    fn backfill_hint_files(&self) {
        if !self.hint_files_missing.swap(false, Ordering::Relaxed) {
            return;
        }
        let active_id = self.write_state.read().active_file_id;
        let sealed: Vec<PathBuf> = {
            let files = self.files.read();
            files
                .files
                .iter()
                .enumerate()
                .filter(|(id, slot)| {
                    *id != active_id as usize
                        && slot.as_ref().is_some_and(|df| df.is_open())
                })
                .map(|(_, slot)| slot.as_ref().expect("filtered above").path.clone())
                .collect()
        };
        for data_path in sealed {
            let hint_path = data_path.with_extension(HINT_FILE_EXT);
            if hint_path.exists() {
                continue;
            }
            match create_hint_file(&data_path, &hint_path) {
                Ok(()) => {
                    self.counters
                        .hint_file_created_qty
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.logger.warn(&format!(
                        "cannot create the hint file for {}: {e}",
                        data_path.display()
                    ));
                }
            }
        }
    }
}
