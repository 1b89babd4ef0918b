/// Append-only segmented event log on disk
///
/// Layout of the log directory:
///
/// ```text
/// 00000000000000000001.evts   header, then length + CRC32 framed records
/// 00000000000000000001.idx    header, then one u64 LE byte offset per record
/// meta.json                   highest trimmed sequence number
/// takedowns.json              repositories hidden from replay
/// ```
///
/// Segments are named by their first sequence number and hold a fixed number
/// of events. Retention removes whole segments; the segment being written
/// is never removed. On open the newest segment is rescanned and a torn tail is cut.
use crate::{
    error::{RelayError, RelayResult},
    metrics,
    sequencer::{
        persist::{EventPersistence, PlaybackPage, TrimStats},
        EventType, RepoEvent, SequencedEvent,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const LOG_MAGIC: &[u8; 4] = b"RLOG";
const INDEX_MAGIC: &[u8; 4] = b"RIDX";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: u64 = 5;

/// len (u32) + crc (u32)
const FRAME_LEN: usize = 8;
/// seq (i64) + time micros (i64) + event tag (u8)
const RECORD_FIXED_LEN: usize = 17;
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

const LOG_EXT: &str = "evts";
const INDEX_EXT: &str = "idx";
const META_FILE: &str = "meta.json";
const TAKEDOWNS_FILE: &str = "takedowns.json";

/// Disk log options
#[derive(Debug, Clone)]
pub struct DiskPersistOptions {
    /// How long events stay replayable
    pub retention: Duration,
    pub events_per_segment: usize,
    /// fsync after this many appends; 0 leaves it to `flush`
    pub sync_every: u64,
}

impl Default for DiskPersistOptions {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(72 * 60 * 60), // 72 hours
            events_per_segment: 10_000,
            sync_every: 100,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogMeta {
    trimmed_through: i64,
}

/// One segment's files and in-memory offset index
struct Segment {
    first_seq: i64,
    log_path: PathBuf,
    index_path: PathBuf,
    offsets: RwLock<Vec<u64>>,
    last_time: RwLock<Option<DateTime<Utc>>>,
}

impl Segment {
    fn new(dir: &Path, first_seq: i64) -> Self {
        Self {
            first_seq,
            log_path: dir.join(format!("{:020}.{}", first_seq, LOG_EXT)),
            index_path: dir.join(format!("{:020}.{}", first_seq, INDEX_EXT)),
            offsets: RwLock::new(Vec::new()),
            last_time: RwLock::new(None),
        }
    }

    fn len(&self) -> usize {
        self.offsets.read().len()
    }

    fn last_seq(&self) -> Option<i64> {
        match self.len() {
            0 => None,
            n => Some(self.first_seq + n as i64 - 1),
        }
    }
}

/// Segment currently receiving appends
struct ActiveSegment {
    segment: Arc<Segment>,
    log: File,
    index: File,
    len: u64,
    /// Set while an append is in progress; still set if it was abandoned
    dirty: bool,
}

impl ActiveSegment {
    /// Cut bytes an abandoned append left past the committed length
    async fn discard_uncommitted(&mut self) -> std::io::Result<()> {
        // Waits for any write still running in the background
        self.log.flush().await?;
        self.index.flush().await?;

        let log_len = self.log.metadata().await?.len();
        if log_len > self.len {
            warn!(
                "Discarding {} uncommitted bytes from event log segment {}",
                log_len - self.len,
                self.segment.first_seq
            );
            self.log.set_len(self.len).await?;
        }
        self.log.seek(SeekFrom::Start(self.len)).await?;

        let index_len = HEADER_LEN + 8 * self.segment.len() as u64;
        if self.index.metadata().await?.len() > index_len {
            self.index.set_len(index_len).await?;
        }
        self.index.seek(SeekFrom::Start(index_len)).await?;

        self.dirty = false;
        Ok(())
    }
}

struct Writer {
    active: Option<ActiveSegment>,
    next_seq: i64,
    unsynced: u64,
}

struct LogState {
    segments: Vec<Arc<Segment>>,
    trimmed_through: i64,
}

/// A decoded record frame
struct RawRecord {
    seq: i64,
    time_micros: i64,
    tag: u8,
    payload: Vec<u8>,
}

impl RawRecord {
    fn frame_len(&self) -> u64 {
        (FRAME_LEN + RECORD_FIXED_LEN + self.payload.len()) as u64
    }

    fn into_event(self) -> RelayResult<SequencedEvent> {
        let time = DateTime::<Utc>::from_timestamp_micros(self.time_micros).ok_or_else(|| {
            RelayError::Encoding(format!("invalid timestamp on event {}", self.seq))
        })?;
        Ok(SequencedEvent {
            seq: self.seq,
            time,
            event: RepoEvent::decode(EventType::from_tag(self.tag)?, &self.payload)?,
        })
    }
}

fn encode_record(seq: i64, time: &DateTime<Utc>, tag: u8, payload: &[u8]) -> Vec<u8> {
    let body_len = RECORD_FIXED_LEN + payload.len();
    let mut buf = Vec::with_capacity(FRAME_LEN + body_len);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&time.timestamp_micros().to_le_bytes());
    buf.push(tag);
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf[FRAME_LEN..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());
    buf
}

async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<RawRecord> {
    let mut frame = [0u8; FRAME_LEN];
    reader.read_exact(&mut frame).await?;
    let body_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);

    if !(RECORD_FIXED_LEN..=MAX_RECORD_LEN).contains(&body_len) {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("record length {} out of range", body_len),
        ));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    if crc32fast::hash(&body) != crc {
        return Err(std::io::Error::new(ErrorKind::InvalidData, "record checksum mismatch"));
    }

    let mut seq = [0u8; 8];
    seq.copy_from_slice(&body[0..8]);
    let mut micros = [0u8; 8];
    micros.copy_from_slice(&body[8..16]);
    Ok(RawRecord {
        seq: i64::from_le_bytes(seq),
        time_micros: i64::from_le_bytes(micros),
        tag: body[16],
        payload: body[RECORD_FIXED_LEN..].to_vec(),
    })
}

fn header(magic: &[u8; 4]) -> [u8; HEADER_LEN as usize] {
    [magic[0], magic[1], magic[2], magic[3], FORMAT_VERSION]
}

async fn check_header<R: AsyncRead + Unpin>(reader: &mut R, magic: &[u8; 4]) -> std::io::Result<()> {
    let mut buf = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut buf).await?;
    if buf != header(magic) {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            "unrecognized segment header or version",
        ));
    }
    Ok(())
}

/// Write `bytes` to `path` via a temporary file and rename
async fn write_atomic(path: &Path, bytes: &[u8]) -> RelayResult<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Segmented on-disk event log
pub struct DiskPersistence {
    dir: PathBuf,
    options: DiskPersistOptions,
    state: RwLock<LogState>,
    writer: Mutex<Writer>,
    head: AtomicI64,
    meta_lock: Mutex<()>,
    takedowns: RwLock<HashSet<String>>,
}

impl DiskPersistence {
    /// Open (or create) the log in `dir`
    pub async fn open(dir: impl Into<PathBuf>, options: DiskPersistOptions) -> RelayResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let meta: LogMeta = match fs::read(dir.join(META_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| RelayError::Encoding(format!("Invalid event log meta: {}", e)))?,
            Err(e) if e.kind() == ErrorKind::NotFound => LogMeta::default(),
            Err(e) => return Err(e.into()),
        };

        let takedowns: HashSet<String> = match fs::read(dir.join(TAKEDOWNS_FILE)).await {
            Ok(bytes) => serde_json::from_slice::<Vec<String>>(&bytes)
                .map_err(|e| RelayError::Encoding(format!("Invalid takedown list: {}", e)))?
                .into_iter()
                .collect(),
            Err(e) if e.kind() == ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e.into()),
        };

        let mut firsts = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXT) {
                continue;
            }
            if let Some(first) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            {
                firsts.push(first);
            }
        }
        firsts.sort_unstable();

        let mut segments: Vec<Arc<Segment>> = Vec::with_capacity(firsts.len());
        for (i, first) in firsts.iter().enumerate() {
            let segment = Segment::new(&dir, *first);
            match firsts.get(i + 1) {
                Some(next) => load_indexed(&segment, (next - first) as usize).await?,
                None => recover_tail(&segment).await?,
            }
            segments.push(Arc::new(segment));
        }

        // Segments left behind by an interrupted trim
        let trimmed_through = meta.trimmed_through;
        while segments.len() > 1
            && segments[0]
                .last_seq()
                .map_or(true, |last| last <= trimmed_through)
        {
            let stale = segments.remove(0);
            remove_if_exists(&stale.log_path).await?;
            remove_if_exists(&stale.index_path).await?;
        }

        let head = segments
            .last()
            .and_then(|s| s.last_seq())
            .unwrap_or(0)
            .max(trimmed_through);

        let mut active = None;
        if let Some(last) = segments.last().cloned() {
            let count = last.len();
            let resumable = if count == 0 {
                last.first_seq == head + 1
            } else {
                count < options.events_per_segment
            };
            if resumable {
                let log = OpenOptions::new().append(true).open(&last.log_path).await?;
                let index = OpenOptions::new().append(true).open(&last.index_path).await?;
                let len = log.metadata().await?.len();
                active = Some(ActiveSegment {
                    segment: last,
                    log,
                    index,
                    len,
                    dirty: false,
                });
            } else if count == 0 {
                // An empty segment that doesn't line up with the head
                segments.pop();
                remove_if_exists(&last.log_path).await?;
                remove_if_exists(&last.index_path).await?;
            }
        }

        info!(
            "Opened disk event log at {} with {} segments, head seq {} (trimmed through {})",
            dir.display(),
            segments.len(),
            head,
            trimmed_through
        );

        Ok(Self {
            dir,
            options,
            state: RwLock::new(LogState {
                segments,
                trimmed_through,
            }),
            writer: Mutex::new(Writer {
                active,
                next_seq: head + 1,
                unsynced: 0,
            }),
            head: AtomicI64::new(head),
            meta_lock: Mutex::new(()),
            takedowns: RwLock::new(takedowns),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }

    /// Start a new segment whose first record will be `first_seq`
    async fn rotate(&self, writer: &mut Writer, first_seq: i64) -> RelayResult<()> {
        if let Some(previous) = writer.active.take() {
            previous.log.sync_all().await?;
            previous.index.sync_all().await?;
        }

        let segment = Arc::new(Segment::new(&self.dir, first_seq));
        let mut log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&segment.log_path)
            .await?;
        log.write_all(&header(LOG_MAGIC)).await?;
        log.flush().await?;

        let mut index = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&segment.index_path)
            .await?;
        index.write_all(&header(INDEX_MAGIC)).await?;
        index.flush().await?;

        {
            // A rotation retried after a failed append reuses the same name
            let mut state = self.state.write();
            state.segments.retain(|s| s.first_seq != first_seq);
            state.segments.push(Arc::clone(&segment));
        }
        debug!("Started event log segment at seq {}", first_seq);

        writer.active = Some(ActiveSegment {
            segment,
            log,
            index,
            len: HEADER_LEN,
            dirty: false,
        });
        Ok(())
    }

    /// Write one record and its index entry
    ///
    /// In-memory state only changes once both files hold the record. If the
    /// caller is dropped midway the segment stays dirty and the next append
    /// cuts the partial record first.
    async fn append(&self, writer: &mut Writer, record: &[u8], time: DateTime<Utc>) -> RelayResult<()> {
        let sync = self.options.sync_every > 0 && writer.unsynced + 1 >= self.options.sync_every;
        let active = writer
            .active
            .as_mut()
            .ok_or_else(|| RelayError::Internal("no active segment".to_string()))?;

        if active.dirty {
            if let Err(e) = active.discard_uncommitted().await {
                writer.active = None;
                return Err(e.into());
            }
        }

        let offset = active.len;
        active.dirty = true;
        let written = async {
            active.log.write_all(record).await?;
            active.log.flush().await?;
            active.index.write_all(&offset.to_le_bytes()).await?;
            active.index.flush().await?;
            if sync {
                active.log.sync_data().await?;
                active.index.sync_data().await?;
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = written {
            // Abandon this segment; the next append starts a fresh one
            if let Err(truncate_err) = active.log.set_len(offset).await {
                warn!("Failed to roll back torn event record: {}", truncate_err);
            }
            writer.active = None;
            return Err(e.into());
        }

        active.dirty = false;
        active.len += record.len() as u64;
        active.segment.offsets.write().push(offset);
        *active.segment.last_time.write() = Some(time);
        writer.unsynced = if sync { 0 } else { writer.unsynced + 1 };
        Ok(())
    }

    async fn read_range(&self, segment: &Segment, first_offset: u64, count: usize) -> std::io::Result<Vec<RawRecord>> {
        let mut file = File::open(&segment.log_path).await?;
        file.seek(SeekFrom::Start(first_offset)).await?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(read_record(&mut reader).await?);
        }
        Ok(records)
    }

    fn expired(&self, since: i64) -> Option<RelayError> {
        let trimmed = self.state.read().trimmed_through;
        (since < trimmed).then(|| RelayError::ExpiredCursor {
            cursor: since,
            oldest: trimmed + 1,
        })
    }

    async fn write_meta(&self, trimmed_through: i64) -> RelayResult<()> {
        let bytes = serde_json::to_vec(&LogMeta { trimmed_through })
            .map_err(|e| RelayError::Encoding(e.to_string()))?;
        write_atomic(&self.dir.join(META_FILE), &bytes).await
    }
}

/// Load a sealed segment from its index
async fn load_indexed(segment: &Segment, expected: usize) -> RelayResult<()> {
    let offsets = match fs::read(&segment.index_path).await {
        Ok(bytes) if bytes.len() >= HEADER_LEN as usize && bytes[..HEADER_LEN as usize] == header(INDEX_MAGIC) => bytes
            [HEADER_LEN as usize..]
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect::<Vec<u64>>(),
        Ok(_) | Err(_) => {
            warn!(
                "Rebuilding index for event log segment {}",
                segment.first_seq
            );
            return recover_tail(segment).await;
        }
    };

    let mut offsets = offsets;
    if offsets.len() > expected {
        offsets.truncate(expected);
    } else if offsets.len() < expected {
        warn!(
            "Event log segment {} holds {} of {} expected events",
            segment.first_seq,
            offsets.len(),
            expected
        );
    }

    if let Some(last) = offsets.last().copied() {
        let mut file = File::open(&segment.log_path).await?;
        file.seek(SeekFrom::Start(last)).await?;
        let record = read_record(&mut BufReader::new(file)).await?;
        *segment.last_time.write() = DateTime::<Utc>::from_timestamp_micros(record.time_micros);
    }
    *segment.offsets.write() = offsets;
    Ok(())
}

/// Scan a segment's log, cut any torn tail, and rewrite its index
async fn recover_tail(segment: &Segment) -> RelayResult<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&segment.log_path)
        .await?;
    let file_len = file.metadata().await?.len();

    let mut reader = BufReader::new(file.try_clone().await?);
    let mut offsets = Vec::new();
    let mut last_time = None;
    let mut good_len = HEADER_LEN;

    if file_len < HEADER_LEN || check_header(&mut reader, LOG_MAGIC).await.is_err() {
        warn!(
            "Event log segment {} has no valid header, resetting it",
            segment.first_seq
        );
        file.set_len(0).await?;
        let mut writer = file;
        writer.seek(SeekFrom::Start(0)).await?;
        writer.write_all(&header(LOG_MAGIC)).await?;
        writer.sync_all().await?;
    } else {
        let mut expected_seq = segment.first_seq;
        while good_len < file_len {
            match read_record(&mut reader).await {
                Ok(record) if record.seq == expected_seq => {
                    offsets.push(good_len);
                    good_len += record.frame_len();
                    last_time = DateTime::<Utc>::from_timestamp_micros(record.time_micros);
                    expected_seq += 1;
                }
                Ok(_) | Err(_) => break,
            }
        }
        if good_len < file_len {
            warn!(
                "Truncating {} bytes of torn data from event log segment {}",
                file_len - good_len,
                segment.first_seq
            );
            file.set_len(good_len).await?;
            file.sync_all().await?;
        }
    }

    let mut index = Vec::with_capacity(HEADER_LEN as usize + offsets.len() * 8);
    index.extend_from_slice(&header(INDEX_MAGIC));
    for offset in &offsets {
        index.extend_from_slice(&offset.to_le_bytes());
    }
    write_atomic(&segment.index_path, &index).await?;

    *segment.offsets.write() = offsets;
    *segment.last_time.write() = last_time;
    Ok(())
}

#[async_trait]
impl EventPersistence for DiskPersistence {
    async fn persist(&self, event: RepoEvent) -> RelayResult<SequencedEvent> {
        let payload = event.encode()?;
        let mut writer = self.writer.lock().await;

        let seq = writer.next_seq;
        let time = Utc::now();

        let full = writer
            .active
            .as_ref()
            .map_or(true, |a| a.segment.len() >= self.options.events_per_segment);
        if full {
            self.rotate(&mut writer, seq).await?;
        }

        let record = encode_record(seq, &time, event.event_type().tag(), &payload);
        self.append(&mut writer, &record, time).await?;

        writer.next_seq += 1;
        self.head.store(seq, Ordering::SeqCst);
        Ok(SequencedEvent { seq, time, event })
    }

    async fn playback(&self, since: i64, limit: usize) -> RelayResult<PlaybackPage> {
        if let Some(err) = self.expired(since) {
            return Err(err);
        }
        let segments: Vec<Arc<Segment>> = self.state.read().segments.clone();

        let mut page = PlaybackPage {
            events: Vec::new(),
            next_cursor: since,
        };
        let mut remaining = limit;

        for segment in segments {
            if remaining == 0 {
                break;
            }

            let offsets: Vec<u64> = {
                let offsets = segment.offsets.read();
                let count = offsets.len() as i64;
                if count == 0 || segment.first_seq + count - 1 <= page.next_cursor {
                    continue;
                }
                let start = (page.next_cursor + 1 - segment.first_seq).max(0) as usize;
                let end = (start + remaining).min(offsets.len());
                offsets[start..end].to_vec()
            };

            let records = match self.read_range(&segment, offsets[0], offsets.len()).await {
                Ok(records) => records,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // Trimmed while we were reading
                    return Err(self.expired(since).unwrap_or(e.into()));
                }
                Err(e) => return Err(e.into()),
            };

            for record in records {
                remaining -= 1;
                page.next_cursor = record.seq;
                let evt = record.into_event()?;
                if !self.takedowns.read().contains(evt.event.did()) {
                    page.events.push(evt);
                }
            }
        }

        if let Some(err) = self.expired(since) {
            return Err(err);
        }
        Ok(page)
    }

    async fn last_seq(&self) -> RelayResult<i64> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn trim(&self, before: DateTime<Utc>) -> RelayResult<TrimStats> {
        let _meta = self.meta_lock.lock().await;

        let (removed, trimmed_through) = {
            let mut state = self.state.write();
            // The newest segment goes only once it is sealed
            let sealed = state
                .segments
                .last()
                .map_or(false, |s| s.len() >= self.options.events_per_segment);
            let removable = if sealed {
                state.segments.len()
            } else {
                state.segments.len().saturating_sub(1)
            };
            let mut n = 0;
            while n < removable {
                match *state.segments[n].last_time.read() {
                    Some(t) if t >= before => break,
                    _ => n += 1,
                }
            }

            let removed: Vec<Arc<Segment>> = state.segments.drain(..n).collect();
            if let Some(through) = removed.iter().filter_map(|s| s.last_seq()).max() {
                state.trimmed_through = state.trimmed_through.max(through);
            }
            (removed, state.trimmed_through)
        };

        if removed.is_empty() {
            return Ok(TrimStats {
                events_removed: 0,
                trimmed_through,
            });
        }

        self.write_meta(trimmed_through).await?;

        let mut events_removed = 0u64;
        for segment in &removed {
            events_removed += segment.len() as u64;
            remove_if_exists(&segment.log_path).await?;
            remove_if_exists(&segment.index_path).await?;
        }

        metrics::EVENT_LOG_TRIMMED_TOTAL.inc_by(events_removed);
        info!(
            "Trimmed {} events in {} segments from disk event log (through seq {})",
            events_removed,
            removed.len(),
            trimmed_through
        );

        Ok(TrimStats {
            events_removed,
            trimmed_through,
        })
    }

    async fn take_down_repo(&self, did: &str) -> RelayResult<()> {
        let _meta = self.meta_lock.lock().await;
        let snapshot: Vec<String> = {
            let mut takedowns = self.takedowns.write();
            if !takedowns.insert(did.to_string()) {
                return Ok(());
            }
            let mut all: Vec<String> = takedowns.iter().cloned().collect();
            all.sort_unstable();
            all
        };

        let bytes =
            serde_json::to_vec(&snapshot).map_err(|e| RelayError::Encoding(e.to_string()))?;
        write_atomic(&self.dir.join(TAKEDOWNS_FILE), &bytes).await
    }

    fn retention(&self) -> Option<Duration> {
        Some(self.options.retention)
    }

    async fn flush(&self) -> RelayResult<()> {
        let mut writer = self.writer.lock().await;
        if let Some(active) = writer.active.as_mut() {
            if active.dirty {
                active.discard_uncommitted().await?;
            }
            active.log.sync_data().await?;
            active.index.sync_data().await?;
        }
        writer.unsynced = 0;
        Ok(())
    }

    async fn shutdown(&self) -> RelayResult<()> {
        self.flush().await
    }
}
