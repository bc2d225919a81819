//! Channel stored as one append-only file per partition.
//!
//! Every record is framed as `[payload length: u32 BE][crc32 of payload: u32 BE][payload]`.
//! Appends are flushed and `fsync`ed before they are acknowledged. A torn frame left at the end of
//! a file by a crash is truncated the next time a writer opens the partition; readers treat an
//! incomplete trailing frame as "not written yet" and keep polling the file for more data.

use std::{
    collections::BTreeMap,
    io::SeekFrom,
    num::NonZeroU32,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bronze_types::{PartitionId, Position};
use bytes::{Buf, Bytes, BytesMut};
use futures::{StreamExt, stream};
use observability_deps::tracing::{debug, info, warn};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

use crate::{ChannelError, ChannelReading, ChannelRecord, ChannelWriting, RecordMeta, RecordStream};

const HEADER_LEN: usize = 8;

/// Frames claiming to be larger than this are treated as corrupt.
const MAX_RECORD_BYTES: usize = 64 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug)]
enum Frame {
    Complete { len: usize },
    Incomplete,
    Corrupt(String),
}

fn decode_frame(buf: &[u8]) -> Frame {
    if buf.len() < HEADER_LEN {
        return Frame::Incomplete;
    }

    let mut header = &buf[..HEADER_LEN];
    let len = header.get_u32() as usize;
    let expected_crc = header.get_u32();

    if len > MAX_RECORD_BYTES {
        return Frame::Corrupt(format!("record length {len} exceeds {MAX_RECORD_BYTES}"));
    }
    if buf.len() < HEADER_LEN + len {
        return Frame::Incomplete;
    }

    let actual_crc = crc32fast::hash(&buf[HEADER_LEN..HEADER_LEN + len]);
    if actual_crc != expected_crc {
        return Frame::Corrupt(format!(
            "checksum mismatch, expected {expected_crc:#010x} got {actual_crc:#010x}"
        ));
    }

    Frame::Complete {
        len: HEADER_LEN + len,
    }
}

fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
    if payload.len() > MAX_RECORD_BYTES {
        return Err(ChannelError::invalid_data(format!(
            "record of {} bytes exceeds {MAX_RECORD_BYTES}",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Valid prefix of a partition file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Scan {
    valid_len: usize,
    records: u64,
}

fn scan(mut buf: &[u8]) -> Scan {
    let mut scan = Scan::default();
    while let Frame::Complete { len } = decode_frame(buf) {
        scan.valid_len += len;
        scan.records += 1;
        buf = &buf[len..];
    }
    scan
}

#[derive(Debug)]
struct PartitionWriter {
    file: File,
    next: Position,
}

impl PartitionWriter {
    async fn open(path: &Path) -> Result<Self, ChannelError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await?;

        let mut existing = Vec::new();
        file.read_to_end(&mut existing).await?;
        let scan = scan(&existing);

        if scan.valid_len < existing.len() {
            warn!(
                path = %path.display(),
                discarded_bytes = existing.len() - scan.valid_len,
                "truncating torn tail of channel partition"
            );
            file.set_len(scan.valid_len as u64).await?;
        }

        debug!(path = %path.display(), records = scan.records, "opened channel partition for writing");

        Ok(Self {
            file,
            next: Position::new(scan.records),
        })
    }

    async fn write(&mut self, frame: &[u8]) -> Result<Position, ChannelError> {
        self.file.write_all(frame).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;

        let position = self.next;
        self.next = position.next();
        Ok(position)
    }
}

#[derive(Debug, Default)]
struct Watermark {
    scanned_bytes: u64,
    records: u64,
}

#[derive(Debug)]
struct FilePartition {
    path: PathBuf,
    writer: Mutex<Option<PartitionWriter>>,
    watermark: Mutex<Watermark>,
}

/// Partitioned channel persisted under `{root}/{name}/partition-{NNNNN}.log`.
///
/// Several processes may read a channel concurrently, but each partition must only ever have one
/// writing process. Clones share the open partitions.
#[derive(Debug, Clone)]
pub struct FileChannel {
    name: Arc<str>,
    partitions: Arc<BTreeMap<PartitionId, Arc<FilePartition>>>,
    poll_interval: Duration,
}

impl FileChannel {
    pub async fn open(
        root: impl AsRef<Path> + Send,
        name: &str,
        n_partitions: NonZeroU32,
        poll_interval: Duration,
    ) -> Result<Self, ChannelError> {
        let dir = root.as_ref().join(name);
        tokio::fs::create_dir_all(&dir).await?;

        let partitions = (0..n_partitions.get())
            .map(|p| {
                let partition = Arc::new(FilePartition {
                    path: dir.join(format!("partition-{p:05}.log")),
                    writer: Mutex::new(None),
                    watermark: Mutex::new(Watermark::default()),
                });
                (PartitionId::new(p), partition)
            })
            .collect();

        info!(
            channel = name,
            dir = %dir.display(),
            n_partitions = n_partitions.get(),
            "opened file channel"
        );

        Ok(Self {
            name: Arc::from(name),
            partitions: Arc::new(partitions),
            poll_interval,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn partition(&self, partition: PartitionId) -> Result<&Arc<FilePartition>, ChannelError> {
        self.partitions
            .get(&partition)
            .ok_or_else(|| ChannelError::unknown_partition(partition))
    }
}

#[async_trait]
impl ChannelWriting for FileChannel {
    fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    async fn append(
        &self,
        partition: PartitionId,
        payload: Bytes,
    ) -> Result<RecordMeta, ChannelError> {
        let part = self.partition(partition)?;
        let frame = encode_frame(&payload)?;

        let mut guard = part.writer.lock().await;
        let writer = match guard.take() {
            Some(w) => w,
            None => PartitionWriter::open(&part.path).await?,
        };
        let writer = guard.insert(writer);

        match writer.write(&frame).await {
            Ok(position) => Ok(RecordMeta {
                partition,
                position,
            }),
            Err(e) => {
                // reopen on the next append, which truncates whatever part of the frame landed
                *guard = None;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ChannelReading for FileChannel {
    fn partitions(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    async fn stream(
        &self,
        partition: PartitionId,
        from: Position,
    ) -> Result<RecordStream, ChannelError> {
        let part = self.partition(partition)?;

        let tail = Tail {
            partition,
            path: part.path.clone(),
            poll_interval: self.poll_interval,
            file: None,
            buf: BytesMut::new(),
            next: Position::ZERO,
            from,
        };

        let stream = stream::unfold(Some(tail), |tail| async move {
            let mut tail = tail?;
            match tail.next_record().await {
                Ok(record) => Some((Ok(record), Some(tail))),
                // the stream ends after an error, callers reopen it from their last position
                Err(e) => Some((Err(e), None)),
            }
        });

        Ok(stream.boxed())
    }

    async fn high_watermark(&self, partition: PartitionId) -> Result<Position, ChannelError> {
        let part = self.partition(partition)?;
        let mut watermark = part.watermark.lock().await;

        let mut file = match File::open(&part.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Position::new(watermark.records));
            }
            Err(e) => return Err(e.into()),
        };

        file.seek(SeekFrom::Start(watermark.scanned_bytes)).await?;
        let mut unscanned = Vec::new();
        file.read_to_end(&mut unscanned).await?;

        let scan = scan(&unscanned);
        watermark.scanned_bytes += scan.valid_len as u64;
        watermark.records += scan.records;

        Ok(Position::new(watermark.records))
    }
}

/// Follows a partition file, like `tail -f`.
#[derive(Debug)]
struct Tail {
    partition: PartitionId,
    path: PathBuf,
    poll_interval: Duration,
    file: Option<File>,
    buf: BytesMut,
    /// Position of the next frame at the start of `buf`.
    next: Position,
    /// Frames before this position are skipped.
    from: Position,
}

impl Tail {
    async fn next_record(&mut self) -> Result<ChannelRecord, ChannelError> {
        loop {
            match decode_frame(&self.buf) {
                Frame::Complete { len } => {
                    let mut frame = self.buf.split_to(len);
                    let position = self.next;
                    self.next = position.next();

                    if position >= self.from {
                        return Ok(ChannelRecord {
                            partition: self.partition,
                            position,
                            payload: frame.split_off(HEADER_LEN).freeze(),
                        });
                    }
                    continue;
                }
                Frame::Corrupt(reason) => {
                    return Err(ChannelError::invalid_data(format!(
                        "corrupt record at position {} of {}: {reason}",
                        self.next,
                        self.path.display()
                    )));
                }
                Frame::Incomplete => {}
            }

            let file = match self.file.take() {
                Some(f) => f,
                None => match File::open(&self.path).await {
                    Ok(f) => f,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                },
            };
            let file = self.file.insert(file);

            self.buf.reserve(READ_CHUNK_BYTES);
            if file.read_buf(&mut self.buf).await? == 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}
