//! Data and hint file codec: record framing, checksums, sequential recovery
//! scan, and the per-file descriptor with its dead-byte accounting.
//!
//! A data file is an append-only sequence of self-delimiting records:
//!
//! ```text
//! checksum     u32   CRC32 of everything after this field
//! exp_time_sec u32   absolute expiry in unix seconds, 0 = no TTL
//! value_size   u32   0xFFFF_FFFF marks a tombstone
//! key_size     u16
//! index_size   u8    bytes of key-index pairs (2 per index)
//! reserved     u8
//! key bytes | index pair bytes | value bytes
//! ```
//!
//! Tombstone records store neither index nor value bytes. A hint file holds
//! one 16-byte entry per data record (`file_offset` replacing the checksum
//! slot) followed by the key and index bytes, enabling KeyDir reconstruction
//! without reading the values.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;

use crate::types::{KEY_INDEX_PAIR_SIZE, MAX_KEY_INDEX_QTY, TOMBSTONE_VALUE_SIZE};

/// Extensions of the on-disk companions of a store.
pub const DATA_FILE_EXT: &str = "data";
pub const HINT_FILE_EXT: &str = "hint";
pub const TMP_FILE_EXT: &str = "tmp";
pub const REMOVE_MARKER_EXT: &str = "to_remove";

/// Serialized size of a data record header.
pub const DATA_ENTRY_HEADER_SIZE: usize = 16;
/// Serialized size of a hint record header.
pub const HINT_ENTRY_HEADER_SIZE: usize = 16;

/// Largest accepted index byte count in a record.
const MAX_INDEX_BYTES: usize = MAX_KEY_INDEX_QTY * KEY_INDEX_PAIR_SIZE;

/// Header of an on-disk data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEntryHeader {
    pub checksum: u32,
    pub exp_time_sec: u32,
    pub value_size: u32,
    pub key_size: u16,
    pub index_size: u8,
}

impl DataEntryHeader {
    pub fn is_tombstone(&self) -> bool {
        self.value_size == TOMBSTONE_VALUE_SIZE
    }

    /// Value bytes actually present on disk (tombstones store none).
    pub fn stored_value_size(&self) -> usize {
        if self.is_tombstone() {
            0
        } else {
            self.value_size as usize
        }
    }

    /// Full on-disk byte count of the record this header starts.
    pub fn record_size(&self) -> usize {
        DATA_ENTRY_HEADER_SIZE
            + self.key_size as usize
            + self.index_size as usize
            + self.stored_value_size()
    }

    pub fn to_bytes(&self) -> [u8; DATA_ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; DATA_ENTRY_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.checksum);
        LittleEndian::write_u32(&mut buf[4..8], self.exp_time_sec);
        LittleEndian::write_u32(&mut buf[8..12], self.value_size);
        LittleEndian::write_u16(&mut buf[12..14], self.key_size);
        buf[14] = self.index_size;
        buf[15] = 0;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            checksum: LittleEndian::read_u32(&buf[0..4]),
            exp_time_sec: LittleEndian::read_u32(&buf[4..8]),
            value_size: LittleEndian::read_u32(&buf[8..12]),
            key_size: LittleEndian::read_u16(&buf[12..14]),
            index_size: buf[14],
        }
    }
}

/// Header of an on-disk hint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintEntryHeader {
    pub file_offset: u32,
    pub exp_time_sec: u32,
    pub value_size: u32,
    pub key_size: u16,
    pub index_size: u8,
}

impl HintEntryHeader {
    pub fn is_tombstone(&self) -> bool {
        self.value_size == TOMBSTONE_VALUE_SIZE
    }

    pub fn to_bytes(&self) -> [u8; HINT_ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; HINT_ENTRY_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.file_offset);
        LittleEndian::write_u32(&mut buf[4..8], self.exp_time_sec);
        LittleEndian::write_u32(&mut buf[8..12], self.value_size);
        LittleEndian::write_u16(&mut buf[12..14], self.key_size);
        buf[14] = self.index_size;
        buf[15] = 0;
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        Self {
            file_offset: LittleEndian::read_u32(&buf[0..4]),
            exp_time_sec: LittleEndian::read_u32(&buf[4..8]),
            value_size: LittleEndian::read_u32(&buf[8..12]),
            key_size: LittleEndian::read_u16(&buf[12..14]),
            index_size: buf[14],
        }
    }
}

/// CRC32 over the record bytes after the checksum field.
pub fn record_checksum(
    exp_time_sec: u32,
    value_size: u32,
    key: &[u8],
    index_bytes: &[u8],
    value: &[u8],
) -> u32 {
    let mut tail = [0u8; DATA_ENTRY_HEADER_SIZE - 4];
    LittleEndian::write_u32(&mut tail[0..4], exp_time_sec);
    LittleEndian::write_u32(&mut tail[4..8], value_size);
    LittleEndian::write_u16(&mut tail[8..10], key.len() as u16);
    tail[10] = index_bytes.len() as u8;
    tail[11] = 0;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&tail);
    hasher.update(key);
    hasher.update(index_bytes);
    hasher.update(value);
    hasher.finalize()
}

/// Writes a full data record. `value` must be empty for tombstones.
pub fn write_data_entry<W: Write>(
    writer: &mut W,
    header: &DataEntryHeader,
    key: &[u8],
    index_bytes: &[u8],
    value: &[u8],
) -> io::Result<()> {
    writer.write_all(&header.to_bytes())?;
    writer.write_all(key)?;
    writer.write_all(index_bytes)?;
    writer.write_all(value)?;
    Ok(())
}

/// Writes a full hint record.
pub fn write_hint_entry<W: Write>(
    writer: &mut W,
    header: &HintEntryHeader,
    key: &[u8],
    index_bytes: &[u8],
) -> io::Result<()> {
    writer.write_all(&header.to_bytes())?;
    writer.write_all(key)?;
    writer.write_all(index_bytes)?;
    Ok(())
}

/// One record surfaced by [`scan_data_file`].
pub struct ScannedEntry<'a> {
    pub header: DataEntryHeader,
    pub offset: u32,
    pub key: &'a [u8],
    pub index_bytes: &'a [u8],
    pub value: &'a [u8],
}

/// Outcome of a sequential data file scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanSummary {
    /// Bytes covered by intact records; anything beyond is a broken tail.
    pub valid_bytes: u64,
    /// False when the scan stopped on a short or corrupted record.
    pub clean: bool,
}

/// Streams the records of a data file in order. The scan stops at the first
/// short or checksum-failing record; the caller decides whether to truncate.
pub fn scan_data_file(
    path: &Path,
    mut sink: impl FnMut(ScannedEntry<'_>),
) -> io::Result<ScanSummary> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut header_buf = [0u8; DATA_ENTRY_HEADER_SIZE];
    let mut body = Vec::new();
    let mut offset = 0u64;

    loop {
        match read_exact_or_eof(&mut reader, &mut header_buf) {
            ReadOutcome::Full => {}
            ReadOutcome::Eof => return Ok(ScanSummary { valid_bytes: offset, clean: true }),
            ReadOutcome::Short => {
                tracing::warn!("data file {} has a truncated header at offset {offset}", path.display());
                return Ok(ScanSummary { valid_bytes: offset, clean: false });
            }
        }
        let header = DataEntryHeader::from_bytes(&header_buf);
        if header.key_size == 0 {
            tracing::warn!(
                "data file {} has a zero key size at offset {offset}, treating the tail as truncated",
                path.display()
            );
            return Ok(ScanSummary { valid_bytes: offset, clean: false });
        }
        if header.index_size as usize > MAX_INDEX_BYTES || header.index_size % 2 != 0 {
            tracing::warn!(
                "data file {} has an invalid index size {} at offset {offset}",
                path.display(),
                header.index_size
            );
            return Ok(ScanSummary { valid_bytes: offset, clean: false });
        }

        let body_size = header.key_size as usize + header.index_size as usize
            + header.stored_value_size();
        body.resize(body_size, 0);
        match read_exact_or_eof(&mut reader, &mut body) {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Short => {
                tracing::warn!(
                    "data file {} ends inside the record at offset {offset}, treating the tail as truncated",
                    path.display()
                );
                return Ok(ScanSummary { valid_bytes: offset, clean: false });
            }
        }

        let key_end = header.key_size as usize;
        let idx_end = key_end + header.index_size as usize;
        let checksum = record_checksum(
            header.exp_time_sec,
            header.value_size,
            &body[..key_end],
            &body[key_end..idx_end],
            &body[idx_end..],
        );
        if checksum != header.checksum {
            tracing::warn!(
                "data file {} has a checksum mismatch at offset {offset}, treating the tail as truncated",
                path.display()
            );
            return Ok(ScanSummary { valid_bytes: offset, clean: false });
        }

        sink(ScannedEntry {
            header,
            offset: offset as u32,
            key: &body[..key_end],
            index_bytes: &body[key_end..idx_end],
            value: &body[idx_end..],
        });
        offset += header.record_size() as u64;
    }
}

/// One record surfaced by [`scan_hint_file`].
pub struct HintScannedEntry<'a> {
    pub header: HintEntryHeader,
    pub key: &'a [u8],
    pub index_bytes: &'a [u8],
}

/// Streams the records of a hint file. Returns false when the file is
/// unusable, in which case the caller falls back to the full data scan.
pub fn scan_hint_file(
    path: &Path,
    mut sink: impl FnMut(HintScannedEntry<'_>),
) -> io::Result<bool> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut reader = BufReader::new(file);
    let mut header_buf = [0u8; HINT_ENTRY_HEADER_SIZE];
    let mut body = Vec::new();

    loop {
        match read_exact_or_eof(&mut reader, &mut header_buf) {
            ReadOutcome::Full => {}
            ReadOutcome::Eof => return Ok(true),
            ReadOutcome::Short => {
                tracing::warn!("hint file {} is truncated", path.display());
                return Ok(false);
            }
        }
        let header = HintEntryHeader::from_bytes(&header_buf);
        if header.key_size == 0
            || header.index_size as usize > MAX_INDEX_BYTES
            || header.index_size % 2 != 0
        {
            tracing::warn!("hint file {} holds a corrupted entry", path.display());
            return Ok(false);
        }
        body.resize(header.key_size as usize + header.index_size as usize, 0);
        match read_exact_or_eof(&mut reader, &mut body) {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Short => {
                tracing::warn!("hint file {} is truncated", path.display());
                return Ok(false);
            }
        }
        sink(HintScannedEntry {
            header,
            key: &body[..header.key_size as usize],
            index_bytes: &body[header.key_size as usize..],
        });
    }
}

/// Builds the hint companion of a sealed data file: written as `.tmp`, then
/// atomically renamed into place.
pub fn create_hint_file(data_path: &Path, hint_path: &Path) -> io::Result<()> {
    tracing::info!("creating hint file for {}", data_path.display());
    let tmp_path = add_extension(hint_path, TMP_FILE_EXT);
    let mut writer = BufWriter::new(File::create(&tmp_path)?);

    let mut write_error = None;
    scan_data_file(data_path, |entry| {
        if write_error.is_some() {
            return;
        }
        let header = HintEntryHeader {
            file_offset: entry.offset,
            exp_time_sec: entry.header.exp_time_sec,
            value_size: entry.header.value_size,
            key_size: entry.header.key_size,
            index_size: entry.header.index_size,
        };
        if let Err(e) = write_hint_entry(&mut writer, &header, entry.key, entry.index_bytes) {
            write_error = Some(e);
        }
    })?;
    if let Some(e) = write_error {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }
    writer.flush()?;
    drop(writer);
    std::fs::rename(&tmp_path, hint_path)?;
    Ok(())
}

/// Appends `ext` to a path that may already carry an extension, e.g.
/// `12.hint` + `tmp` -> `12.hint.tmp`.
pub fn add_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Numeric ordering index of a data file name; merge outputs carry a
/// fractional part so they sort between their source and the next file.
pub fn file_sort_index(path: &Path) -> Option<f64> {
    let stem = path.file_stem()?.to_str()?;
    let index: f64 = stem.parse().ok()?;
    if index > 0.0 { Some(index) } else { None }
}

enum ReadOutcome {
    Full,
    Eof,
    Short,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 { ReadOutcome::Eof } else { ReadOutcome::Short };
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return ReadOutcome::Short,
        }
    }
    ReadOutcome::Full
}

// ----------------------------------------------------------------------
// Per-file descriptor
// ----------------------------------------------------------------------

/// An open data file with its live/dead accounting. The counters mirror the
/// on-disk content and drive the merge selection.
#[derive(Debug)]
pub(crate) struct DataFile {
    pub path: PathBuf,
    handle: RwLock<Option<File>>,
    pub bytes: AtomicU64,
    pub entries: AtomicU64,
    pub tomb_bytes: AtomicU64,
    pub tomb_entries: AtomicU64,
    pub dead_bytes: AtomicU64,
    pub dead_entries: AtomicU64,
}

impl DataFile {
    /// Creates a fresh active file opened for append and random reads.
    pub fn create_active(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self::with_handle(path, Some(file)))
    }

    /// Opens an existing sealed file for reads.
    pub fn open_read(path: PathBuf) -> io::Result<Self> {
        let file = File::open(&path)?;
        Ok(Self::with_handle(path, Some(file)))
    }

    /// Descriptor without a handle yet (merge output being built).
    pub fn unopened(path: PathBuf) -> Self {
        Self::with_handle(path, None)
    }

    fn with_handle(path: PathBuf, handle: Option<File>) -> Self {
        Self {
            path,
            handle: RwLock::new(handle),
            bytes: AtomicU64::new(0),
            entries: AtomicU64::new(0),
            tomb_bytes: AtomicU64::new(0),
            tomb_entries: AtomicU64::new(0),
            dead_bytes: AtomicU64::new(0),
            dead_entries: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Swaps the append handle for a read-only one when the file seals.
    pub fn reopen_read_only(&self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        *self.handle.write() = Some(file);
        Ok(())
    }

    /// Installs a read handle, e.g. after a merge output is renamed in.
    pub fn open_handle(&self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        *self.handle.write() = Some(file);
        Ok(())
    }

    pub fn close_handle(&self) {
        *self.handle.write() = None;
    }

    /// Appends raw bytes; the caller serialises appends.
    pub fn append(&self, data: &[u8]) -> io::Result<()> {
        let guard = self.handle.read();
        let mut file = guard.as_ref().ok_or_else(closed_handle_error)?;
        file.write_all(data)
    }

    pub fn sync(&self) -> io::Result<()> {
        let guard = self.handle.read();
        let file = guard.as_ref().ok_or_else(closed_handle_error)?;
        file.sync_data()
    }

    /// Random read at `offset`, independent of the append cursor.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let guard = self.handle.read();
        let file = guard.as_ref().ok_or_else(closed_handle_error)?;
        read_at(file, buf, offset)
    }

    /// Truncates a broken tail discovered during recovery.
    pub fn truncate_to(&self, len: u64) -> io::Result<()> {
        let guard = self.handle.read();
        let file = guard.as_ref().ok_or_else(closed_handle_error)?;
        file.set_len(len)
    }

    pub fn live_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn dead_byte_count(&self) -> u64 {
        self.dead_bytes.load(Ordering::Relaxed)
    }

    pub fn record_append(&self, record_size: u64, tombstone: bool) {
        self.bytes.fetch_add(record_size, Ordering::Relaxed);
        self.entries.fetch_add(1, Ordering::Relaxed);
        if tombstone {
            self.tomb_bytes.fetch_add(record_size, Ordering::Relaxed);
            self.tomb_entries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dead(&self, record_size: u64) {
        self.dead_bytes.fetch_add(record_size, Ordering::Relaxed);
        self.dead_entries.fetch_add(1, Ordering::Relaxed);
    }
}

fn closed_handle_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "data file handle is closed")
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        }
        filled += n;
    }
    Ok(())
}
