use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 4096;

/// Largest payload a frame may carry. A longer length prefix is a corrupt
/// tail, not an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode one frame: `[u32 len][bincode Event][u32 crc32]`.
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame and its size on disk. `Ok(None)` on clean EOF, a truncated
/// tail, an oversized length, or a CRC / decode mismatch; replay stops there.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        tracing::warn!(len, "journal frame length exceeds limit, treating as end of log");
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    for buf in [&mut payload[..], &mut crc_buf[..]] {
        match reader.read_exact(buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, (len + 8) as u64)))
}

/// Append-only event journal backing the store.
///
/// A truncated or corrupt last frame (crash mid-write) is discarded on
/// replay; everything before it is kept.
///
/// Bytes past `synced_len` belong to a batch that has not been acknowledged.
/// When a flush fails they are cut off again, so an append reported as
/// failed never reaches disk through a later batch.
pub struct Journal {
    writer: BufWriter<File>,
    path: PathBuf,
    synced_len: u64,
    appends_since_compact: u64,
    unsynced_appends: u64,
    /// Set when unsynced bytes could not be discarded. Every later write fails.
    poisoned: bool,
}

impl Journal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            synced_len,
            appends_since_compact: 0,
            unsynced_appends: 0,
            poisoned: false,
        })
    }

    /// Replay `path`, cut off any torn tail so new frames follow the last
    /// valid one, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, valid_len) = Self::replay_with_len(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > valid_len
        {
            tracing::warn!(
                discarded = meta.len() - valid_len,
                "truncating torn journal tail at {}",
                path.display()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok((Self::open(path)?, events))
    }

    fn check_poisoned(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(
                "journal is unusable after a failed write could not be rolled back",
            ));
        }
        Ok(())
    }

    /// Buffer an event without flushing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.check_poisoned()?;
        write_frame(&mut self.writer, event)?;
        self.unsynced_appends += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.check_poisoned()?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.synced_len = self.writer.get_ref().metadata()?.len();
        self.appends_since_compact += self.unsynced_appends;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Drop everything written or buffered since the last successful
    /// `flush_sync`: the buffer is discarded unflushed and the file is cut
    /// back to `synced_len`. Poisons the journal if that fails.
    pub fn discard_unsynced(&mut self) -> io::Result<()> {
        self.unsynced_appends = 0;
        let reopened = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .and_then(|file| {
                file.set_len(self.synced_len)?;
                file.sync_all()?;
                OpenOptions::new().append(true).open(&self.path)
            });
        match reopened {
            Ok(file) => {
                let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
                // into_parts hands back the buffer without writing it
                let _ = stale.into_parts();
                Ok(())
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Rewrite the journal as `events`: temp file, fsync, rename, reopen.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("journal.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                write_frame(&mut writer, event)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.unsynced_appends = 0;
        self.poisoned = false;
        Ok(())
    }

    /// All valid events on disk, oldest first. Missing file → empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::replay_with_len(path).map(|(events, _)| events)
    }

    /// Valid events plus the byte length of the prefix they occupy.
    fn replay_with_len(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0;
        while let Some((event, frame_len)) = read_frame(&mut reader)? {
            events.push(event);
            valid_len += frame_len;
        }
        Ok((events, valid_len))
    }
}

// ── Group-commit writer ──────────────────────────────────

enum JournalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Cloneable handle to the writer task that owns the journal file.
#[derive(Clone)]
pub struct JournalHandle {
    tx: mpsc::Sender<JournalCommand>,
}

impl JournalHandle {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn spawn(journal: Journal) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(writer_loop(journal, rx));
        Self { tx }
    }

    /// Durably append `events` as one unit. Returns once fsynced.
    pub async fn append(&self, events: Vec<Event>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(JournalCommand::Append { events, response })
            .await
            .map_err(|_| io::Error::other("journal writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("journal writer dropped response"))?
    }

    pub async fn compact(&self, events: Vec<Event>) -> io::Result<()> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(JournalCommand::Compact { events, response })
            .await
            .map_err(|_| io::Error::other("journal writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("journal writer dropped response"))?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .tx
            .send(JournalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Owns the journal and batches appends:
/// block for the first append, drain whatever else is already queued,
/// fsync once, answer everyone.
async fn writer_loop(mut journal: Journal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let JournalCommand::Append { events, response } = cmd else {
            handle_other(&mut journal, cmd);
            continue;
        };
        let mut batch: Vec<PendingAppend> = vec![(events, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(JournalCommand::Append { events, response }) => batch.push((events, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break, // nothing queued, flush now
            }
        }
        flush_batch(&mut journal, batch);
        if let Some(other) = deferred {
            handle_other(&mut journal, other);
        }
    }
}

fn flush_batch(journal: &mut Journal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut append_err = None;
    'frames: for (events, _) in &batch {
        for event in events {
            if let Err(e) = journal.append_buffered(event) {
                append_err = Some(e);
                break 'frames;
            }
        }
    }
    let failure = match append_err {
        Some(e) => Some(e),
        None => journal.flush_sync().err(),
    };
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    if let Some(e) = &failure {
        tracing::error!("journal flush failed, discarding batch: {e}");
        if let Err(e) = journal.discard_unsynced() {
            tracing::error!("cannot roll back failed journal batch: {e}");
        }
    }
    for (_, response) in batch {
        let result = match &failure {
            None => Ok(()),
            Some(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(result);
    }
}

fn handle_other(journal: &mut Journal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Compact { events, response } => {
            let _ = response.send(journal.compact(&events));
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(journal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!("appends are batched by writer_loop"),
    }
}
