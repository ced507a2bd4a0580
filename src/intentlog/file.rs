//! Single-file durable implementation of the replicated log.
//!
//! The backing file is a sequence of frames, each an 8-byte length header
//! followed by a MessagePack-encoded `LogFrame`. Updates and invalidations
//! are appended as new frames, so the file is strictly append-only except
//! for compaction, which rewrites live entries into a fresh file and
//! atomically renames it over the old one.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::intentlog::{EntryId, LogRecord, ReplicatedLog};
use crate::utils::CohortError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// On-disk frame.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
enum LogFrame {
    /// A newly appended entry.
    Put { id: EntryId, record: LogRecord },

    /// In-place rewrite of an earlier entry.
    Replace { id: EntryId, record: LogRecord },

    /// Invalidation of an earlier entry.
    Invalidate { id: EntryId },
}

impl LogFrame {
    fn id(&self) -> EntryId {
        match self {
            Self::Put { id, .. }
            | Self::Replace { id, .. }
            | Self::Invalidate { id } => *id,
        }
    }
}

/// Action command to the logger.
#[derive(Debug)]
enum LogAction {
    Append {
        record: LogRecord,
    },
    Update {
        id: EntryId,
        replacement: Option<LogRecord>,
    },
    ReadSince {
        start: EntryId,
    },
    Compact,
}

/// Action result returned by the logger.
#[derive(Debug, PartialEq)]
enum LogResult {
    Append { id: EntryId },
    Update,
    ReadSince { entries: Vec<(EntryId, LogRecord)> },
    Compact { now_size: usize },
}

type LogReply = oneshot::Sender<Result<LogResult, CohortError>>;

/// State owned by the logger thread.
struct LoggerState {
    /// Path to the backing file.
    path: PathBuf,

    /// Backing file, cursor always at EOF between actions.
    backer: File,

    /// Current backing file size.
    file_size: usize,

    /// Live entries indexed by ID.
    live: BTreeMap<EntryId, LogRecord>,

    /// ID to assign to the next append.
    next_id: EntryId,

    /// Whether to call `fdatasync()` after every write.
    sync: bool,
}

/// Durable file-backed log.
pub struct FileLog {
    /// Sender side of the log channel.
    tx_log: mpsc::UnboundedSender<(LogAction, LogReply)>,

    /// Join handle of the logger thread.
    _logger_handle: JoinHandle<()>,
}

// FileLog public API implementation
impl FileLog {
    /// Opens (or creates) the backing file, scans it to rebuild the index
    /// of live entries, drops any torn frame at its tail, and spawns the
    /// logger thread.
    pub async fn new_and_setup(
        path: &Path,
        sync: bool,
    ) -> Result<Self, CohortError> {
        // prepare backing file
        if !fs::try_exists(path).await? {
            File::create(path).await?;
            pf_info!("created backer file '{}'", path.display());
        } else {
            pf_info!("backer file '{}' already exists", path.display());
        }
        let mut backer =
            OpenOptions::new().read(true).write(true).open(path).await?;
        let file_size = backer.metadata().await?.len() as usize;

        let mut live = BTreeMap::new();
        let mut next_id: EntryId = 1;
        let mut offset = 0;
        while let (Some(frame), end_offset) =
            Self::read_frame(&mut backer, file_size, offset).await?
        {
            next_id = next_id.max(frame.id() + 1);
            Self::apply_frame(&mut live, frame);
            offset = end_offset;
        }

        // drop partial frame at the end if any
        if offset < file_size {
            pf_warn!(
                "discarding torn tail of '{}': {} bytes",
                path.display(),
                file_size - offset
            );
            backer.set_len(offset as u64).await?;
            backer.sync_all().await?;
        }
        backer.seek(SeekFrom::End(0)).await?;
        pf_info!(
            "log '{}' opened: {} live entries, next ID {}",
            path.display(),
            live.len(),
            next_id
        );

        let (tx_log, rx_log) = mpsc::unbounded_channel();
        let state = LoggerState {
            path: path.to_path_buf(),
            backer,
            file_size: offset,
            live,
            next_id,
            sync,
        };
        let logger_handle = tokio::spawn(Self::logger_thread(state, rx_log));

        Ok(FileLog {
            tx_log,
            _logger_handle: logger_handle,
        })
    }

    /// Submits an action and waits for its result.
    async fn do_sync_action(
        &self,
        action: LogAction,
    ) -> Result<LogResult, CohortError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_log
            .send((action, tx_reply))
            .map_err(|e| CohortError::msg(e.to_string()))?;
        rx_reply.await?
    }

    /// Rewrites the backing file so that it holds only live entries.
    /// Returns the file size afterwards.
    pub async fn compact(&self) -> Result<usize, CohortError> {
        match self.do_sync_action(LogAction::Compact).await? {
            LogResult::Compact { now_size } => Ok(now_size),
            res => logged_err!("unexpected log result type: {:?}", res),
        }
    }
}

#[async_trait]
impl ReplicatedLog for FileLog {
    async fn append(&self, record: LogRecord) -> Result<EntryId, CohortError> {
        match self.do_sync_action(LogAction::Append { record }).await? {
            LogResult::Append { id } => Ok(id),
            res => logged_err!("unexpected log result type: {:?}", res),
        }
    }

    async fn update_or_invalidate(
        &self,
        entry_id: EntryId,
        replacement: Option<LogRecord>,
    ) -> Result<(), CohortError> {
        match self
            .do_sync_action(LogAction::Update {
                id: entry_id,
                replacement,
            })
            .await?
        {
            LogResult::Update => Ok(()),
            res => logged_err!("unexpected log result type: {:?}", res),
        }
    }

    async fn read_all_since(
        &self,
        start: EntryId,
    ) -> Result<Vec<(EntryId, LogRecord)>, CohortError> {
        match self.do_sync_action(LogAction::ReadSince { start }).await? {
            LogResult::ReadSince { entries } => Ok(entries),
            res => logged_err!("unexpected log result type: {:?}", res),
        }
    }
}

// FileLog logger thread implementation
impl FileLog {
    /// Applies a frame to the index of live entries.
    fn apply_frame(live: &mut BTreeMap<EntryId, LogRecord>, frame: LogFrame) {
        match frame {
            LogFrame::Put { id, record } => {
                live.insert(id, record);
            }
            LogFrame::Replace { id, record } => {
                if let Some(slot) = live.get_mut(&id) {
                    *slot = record;
                }
            }
            LogFrame::Invalidate { id } => {
                live.remove(&id);
            }
        }
    }

    /// Read out frame at given offset. Returns `None` at end of file or on
    /// a torn frame.
    async fn read_frame(
        backer: &mut File,
        file_size: usize,
        offset: usize,
    ) -> Result<(Option<LogFrame>, usize), CohortError> {
        if offset + 8 > file_size {
            if offset < file_size {
                pf_warn!(
                    "read header end offset {} out of file bound {}",
                    offset + 8,
                    file_size
                );
            }
            return Ok((None, offset));
        }

        // read frame length header
        backer.seek(SeekFrom::Start(offset as u64)).await?;
        let frame_len = backer.read_u64().await?;
        let offset_e = match usize::try_from(frame_len)
            .ok()
            .and_then(|len| (offset + 8).checked_add(len))
        {
            Some(offset_e) if offset_e <= file_size => offset_e,
            _ => {
                pf_warn!("read frame invalid length {}", frame_len);
                backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
                return Ok((None, offset));
            }
        };

        // read frame content
        let mut frame_buf: Vec<u8> = vec![0; offset_e - offset - 8];
        backer.read_exact(&mut frame_buf[..]).await?;
        backer.seek(SeekFrom::End(0)).await?; // recover cursor to EOF
        match decode_from_slice(&frame_buf) {
            Ok(frame) => Ok((Some(frame), offset_e)),
            Err(e) => {
                pf_warn!("undecodable frame at offset {}: {}", offset, e);
                Ok((None, offset))
            }
        }
    }

    /// Append given frame to EOF. Returns the file size afterwards.
    async fn append_frame(
        backer: &mut File,
        file_size: usize,
        frame: &LogFrame,
        sync: bool,
    ) -> Result<usize, CohortError> {
        let frame_bytes = encode_to_vec(frame)?;
        let frame_len = frame_bytes.len();

        // write frame length header first
        backer.write_u64(frame_len as u64).await?;

        // then frame content
        backer.write_all(&frame_bytes[..]).await?;

        if sync {
            backer.sync_data().await?;
        }

        Ok(file_size + 8 + frame_len)
    }

    /// Writes all live entries into a fresh file and renames it over the
    /// backing file.
    async fn compact_file(state: &mut LoggerState) -> Result<usize, CohortError> {
        let tmp_path = state.path.with_extension("compact");
        let mut tmp = File::create(&tmp_path).await?;
        let mut now_size = 0;

        // keep the ID high-water mark even if its entry is gone
        let last_id = state.next_id - 1;
        if last_id > 0 && !state.live.contains_key(&last_id) {
            let frame = LogFrame::Invalidate { id: last_id };
            now_size =
                Self::append_frame(&mut tmp, now_size, &frame, false).await?;
        }
        for (&id, record) in state.live.iter() {
            let frame = LogFrame::Put {
                id,
                record: record.clone(),
            };
            now_size =
                Self::append_frame(&mut tmp, now_size, &frame, false).await?;
        }
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &state.path).await?;
        let mut backer = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&state.path)
            .await?;
        backer.seek(SeekFrom::End(0)).await?;
        state.backer = backer;
        state.file_size = now_size;
        Ok(now_size)
    }

    /// Appends a frame to the backing file. On failure, cuts off whatever
    /// part of it reached the file so later frames stay readable.
    async fn write_frame(
        state: &mut LoggerState,
        frame: &LogFrame,
    ) -> Result<(), CohortError> {
        match Self::append_frame(
            &mut state.backer,
            state.file_size,
            frame,
            state.sync,
        )
        .await
        {
            Ok(now_size) => {
                state.file_size = now_size;
                Ok(())
            }
            Err(e) => {
                state.backer.set_len(state.file_size as u64).await?;
                state.backer.seek(SeekFrom::End(0)).await?;
                Err(e)
            }
        }
    }

    /// Carry out the given action on logger.
    async fn do_action(
        state: &mut LoggerState,
        action: LogAction,
    ) -> Result<LogResult, CohortError> {
        match action {
            LogAction::Append { record } => {
                let id = state.next_id;
                let frame = LogFrame::Put { id, record };
                Self::write_frame(state, &frame).await?;
                state.next_id += 1;
                Self::apply_frame(&mut state.live, frame);
                Ok(LogResult::Append { id })
            }

            LogAction::Update { id, replacement } => {
                if id == 0 || id >= state.next_id {
                    return Err(CohortError::msg(format!(
                        "log entry {} was never appended",
                        id
                    )));
                }
                if !state.live.contains_key(&id) {
                    return Ok(LogResult::Update); // already invalidated
                }
                let frame = match replacement {
                    Some(record) => LogFrame::Replace { id, record },
                    None => LogFrame::Invalidate { id },
                };
                Self::write_frame(state, &frame).await?;
                Self::apply_frame(&mut state.live, frame);
                Ok(LogResult::Update)
            }

            LogAction::ReadSince { start } => Ok(LogResult::ReadSince {
                entries: state
                    .live
                    .range(start..)
                    .map(|(&id, rec)| (id, rec.clone()))
                    .collect(),
            }),

            LogAction::Compact => {
                let now_size = Self::compact_file(state).await?;
                Ok(LogResult::Compact { now_size })
            }
        }
    }

    /// Logger thread function.
    async fn logger_thread(
        mut state: LoggerState,
        mut rx_log: mpsc::UnboundedReceiver<(LogAction, LogReply)>,
    ) {
        pf_debug!("logger thread spawned");

        while let Some((action, tx_reply)) = rx_log.recv().await {
            let res = Self::do_action(&mut state, action).await;
            if let Err(ref e) = res {
                pf_error!("error during logging: {}", e);
            }
            if tx_reply.send(res).is_err() {
                pf_warn!("log action requester went away");
            }
        }

        // channel gets closed and no messages remain
        pf_debug!("logger thread exitted");
    }
}
