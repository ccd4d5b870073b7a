use crate::{Error, Result, Lsn};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const JOURNAL_HEADER_SIZE: usize = 16;
const JOURNAL_MAGIC: u32 = 0x534C4A00; // "SLJ\0"
const RECORD_HEADER_SIZE: usize = 12; // lsn(8) + len(4)
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Journals with fewer durable records than this are never compacted
pub const COMPACT_MIN_RECORDS: usize = 1024;

/// Append-only checksummed record log
///
/// Format: [magic(4) | version(4) | reserved(8)] [record...]
/// Record: [lsn(8) | len(4) | data | crc(4)]
///
/// Records are bincode-encoded. A record cut short by a crash at the tail
/// is treated as the end of the log; a checksum mismatch is corruption.
pub struct Journal<R> {
    path: PathBuf,
    inner: Mutex<JournalInner>,
    _record: PhantomData<fn(R) -> R>,
}

struct JournalInner {
    file: File,
    next_lsn: Lsn,
    /// Records on disk
    durable: usize,
    /// Encoded payloads awaiting flush
    pending: Vec<Vec<u8>>,
}

impl<R> Journal<R>
where
    R: Serialize + DeserializeOwned,
{
    /// Create a new journal file, failing if it already exists
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        write_header(&mut file)?;
        file.sync_all()?;

        Ok(Self {
            path,
            inner: Mutex::new(JournalInner {
                file,
                next_lsn: 1,
                durable: 0,
                pending: Vec::new(),
            }),
            _record: PhantomData,
        })
    }

    /// Open an existing journal file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        verify_header(&mut file)?;
        let (records, valid_len) = scan::<R>(&mut file)?;
        let max_lsn = records.last().map(|(lsn, _)| *lsn).unwrap_or(0);

        // Drop a torn tail so later appends start on a record boundary
        if file.metadata()?.len() > valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            inner: Mutex::new(JournalInner {
                file,
                next_lsn: max_lsn + 1,
                durable: records.len(),
                pending: Vec::new(),
            }),
            _record: PhantomData,
        })
    }

    /// Open the journal if present, otherwise create it
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Append a record (buffered, not yet durable). Records larger than
    /// `MAX_RECORD_SIZE` once encoded are refused.
    pub fn append(&self, record: R) -> Result<Lsn> {
        let data = encode_payload(&record)?;
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        inner.pending.push(data);
        Ok(lsn)
    }

    /// Flush pending records to disk (group commit)
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pending.is_empty() {
            return Ok(());
        }

        let base_lsn = inner.next_lsn - inner.pending.len() as u64;
        let buf = encode_frames(
            inner
                .pending
                .iter()
                .enumerate()
                .map(|(i, data)| (base_lsn + i as u64, data.as_slice())),
        );

        inner.file.seek(SeekFrom::End(0))?;
        inner.file.write_all(&buf)?;
        inner.file.sync_all()?;
        inner.durable += inner.pending.len();
        inner.pending.clear();

        Ok(())
    }

    /// Append and flush a single record
    pub fn write(&self, record: R) -> Result<Lsn> {
        let lsn = self.append(record)?;
        self.flush()?;
        Ok(lsn)
    }

    /// Read all durable records
    pub fn read_all(&self) -> Result<Vec<(Lsn, R)>> {
        let inner = self.inner.lock();
        let mut file = inner.file.try_clone()?;
        drop(inner);

        scan(&mut file).map(|(records, _)| records)
    }

    /// Atomically replace the journal contents with `records`
    ///
    /// Written to a sibling temp file, synced, then renamed over the journal.
    /// Pending (unflushed) records are discarded.
    pub fn rewrite(&self, records: &[R]) -> Result<()> {
        let payloads = records.iter().map(encode_payload).collect::<Result<Vec<_>>>()?;
        let mut inner = self.inner.lock();
        let tmp_path = self.path.with_extension("rewrite");

        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            write_header(&mut tmp)?;
            let buf = encode_frames(
                payloads
                    .iter()
                    .enumerate()
                    .map(|(i, data)| (i as u64 + 1, data.as_slice())),
            );
            tmp.write_all(&buf)?;
            tmp.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        inner.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        inner.next_lsn = records.len() as u64 + 1;
        inner.durable = records.len();
        inner.pending.clear();

        debug!("Rewrote journal {:?} with {} records", self.path, records.len());
        Ok(())
    }

    /// Number of records on disk
    pub fn record_count(&self) -> usize {
        self.inner.lock().durable
    }

    /// True once the journal holds at least `threshold` records and more
    /// than twice the `live` records a rewrite would keep
    pub fn needs_compaction(&self, live: usize, threshold: usize) -> bool {
        let durable = self.record_count();
        durable >= threshold && durable > live.saturating_mul(2)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(file: &mut File) -> Result<()> {
    let mut header = BytesMut::with_capacity(JOURNAL_HEADER_SIZE);
    header.put_u32(JOURNAL_MAGIC); // big-endian for magic
    header.put_u32_le(1); // version
    header.put_u64_le(0); // reserved
    file.write_all(&header)?;
    Ok(())
}

fn verify_header(file: &mut File) -> Result<()> {
    let mut header = [0u8; JOURNAL_HEADER_SIZE];
    file.read_exact(&mut header)?;
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != JOURNAL_MAGIC {
        return Err(Error::Corruption("Invalid journal magic".to_string()));
    }
    Ok(())
}

fn encode_payload<R: Serialize>(record: &R) -> Result<Vec<u8>> {
    let data = bincode::serialize(record)
        .map_err(|e| Error::Serialization(format!("Serialize error: {}", e)))?;
    if data.len() > MAX_RECORD_SIZE {
        return Err(Error::InvalidArgument(format!(
            "journal record is {} bytes, limit is {}",
            data.len(),
            MAX_RECORD_SIZE
        )));
    }
    Ok(data)
}

/// Frame payloads already bounded by `encode_payload`
fn encode_frames<'a, I>(records: I) -> BytesMut
where
    I: Iterator<Item = (Lsn, &'a [u8])>,
{
    let mut buf = BytesMut::new();
    for (lsn, data) in records {
        buf.put_u64_le(lsn);
        buf.put_u32_le(data.len() as u32);
        buf.put_slice(data);
        buf.put_u32_le(crc32fast::hash(data));
    }
    buf
}

/// Returns the decoded records and the byte offset just past the last whole one
fn scan<R: DeserializeOwned>(file: &mut File) -> Result<(Vec<(Lsn, R)>, u64)> {
    file.seek(SeekFrom::Start(JOURNAL_HEADER_SIZE as u64))?;

    let mut records = Vec::new();
    let mut valid_len = JOURNAL_HEADER_SIZE as u64;
    loop {
        let mut rec_header = [0u8; RECORD_HEADER_SIZE];
        match file.read_exact(&mut rec_header) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }

        let lsn = u64::from_le_bytes([
            rec_header[0], rec_header[1], rec_header[2], rec_header[3],
            rec_header[4], rec_header[5], rec_header[6], rec_header[7],
        ]);
        let len = u32::from_le_bytes([
            rec_header[8], rec_header[9], rec_header[10], rec_header[11],
        ]) as usize;
        if len > MAX_RECORD_SIZE {
            return Err(Error::Corruption(format!("record at lsn {} claims {} bytes", lsn, len)));
        }

        let mut data = vec![0u8; len];
        let mut crc_bytes = [0u8; 4];
        let body = file.read_exact(&mut data).and_then(|_| file.read_exact(&mut crc_bytes));
        match body {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                warn!("Torn journal record at lsn {}, ignoring tail", lsn);
                break;
            }
            Err(e) => return Err(e.into()),
        }

        if u32::from_le_bytes(crc_bytes) != crc32fast::hash(&data) {
            return Err(Error::ChecksumMismatch);
        }

        let record: R = bincode::deserialize(&data)
            .map_err(|e| Error::Corruption(format!("Deserialize error: {}", e)))?;
        records.push((lsn, record));
        valid_len += (RECORD_HEADER_SIZE + len + 4) as u64;
    }

    Ok((records, valid_len))
}
