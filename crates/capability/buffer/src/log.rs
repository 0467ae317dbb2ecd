//! 队列操作日志：每行一条 JSON 记录，只追加。

use crate::{BufferError, QueueEntry};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum LogRecord {
    Put {
        id: u64,
        topic: String,
        qos: u8,
        ts: i64,
        payload: String,
    },
    Ack {
        id: u64,
    },
    Evict {
        id: u64,
    },
}

impl LogRecord {
    pub(crate) fn put(entry: &QueueEntry) -> Self {
        LogRecord::Put {
            id: entry.id,
            topic: entry.topic.clone(),
            qos: entry.qos,
            ts: entry.enqueued_at_ms,
            payload: STANDARD.encode(&entry.payload),
        }
    }
}

pub(crate) struct OpLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl OpLog {
    pub(crate) fn open(path: &Path) -> Result<Self, BufferError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(storage)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(storage)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub(crate) fn append(&mut self, record: &LogRecord) -> Result<(), BufferError> {
        let line = serde_json::to_string(record).map_err(storage)?;
        self.writer.write_all(line.as_bytes()).map_err(storage)?;
        self.writer.write_all(b"\n").map_err(storage)?;
        self.writer.flush().map_err(storage)
    }

    /// 刷盘（停机时调用）。
    pub(crate) fn sync(&mut self) -> Result<(), BufferError> {
        self.writer.flush().map_err(storage)?;
        self.writer.get_ref().sync_data().map_err(storage)
    }

    /// 用存活条目重写日志：先写临时文件再原子替换。
    pub(crate) fn rewrite<'a>(
        &mut self,
        live: impl Iterator<Item = &'a QueueEntry>,
    ) -> Result<(), BufferError> {
        let tmp_path = self.path.with_extension("log.compact");
        {
            let file = File::create(&tmp_path).map_err(storage)?;
            let mut writer = BufWriter::new(file);
            for entry in live {
                let line = serde_json::to_string(&LogRecord::put(entry)).map_err(storage)?;
                writer.write_all(line.as_bytes()).map_err(storage)?;
                writer.write_all(b"\n").map_err(storage)?;
            }
            writer.flush().map_err(storage)?;
            writer.get_ref().sync_all().map_err(storage)?;
        }
        fs::rename(&tmp_path, &self.path).map_err(storage)?;
        *self = OpLog::open(&self.path)?;
        Ok(())
    }
}

/// 回放日志，返回存活条目（按 id 升序）与死记录数。
///
/// 末尾残缺行（写入中断）被跳过。
pub(crate) fn replay(path: &Path) -> Result<(Vec<QueueEntry>, usize), BufferError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(err) => return Err(storage(err)),
    };
    let reader = BufReader::new(file);
    let mut live = std::collections::BTreeMap::new();
    let mut dead = 0usize;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(storage)?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    target: "edge.buffer",
                    line = line_no + 1,
                    error = %err,
                    "queue_log_line_skipped"
                );
                continue;
            }
        };
        match record {
            LogRecord::Put {
                id,
                topic,
                qos,
                ts,
                payload,
            } => {
                let payload = STANDARD
                    .decode(payload.as_bytes())
                    .map_err(|err| BufferError::Storage(format!("corrupt payload {}: {}", id, err)))?;
                live.insert(
                    id,
                    QueueEntry {
                        id,
                        topic,
                        payload,
                        qos,
                        enqueued_at_ms: ts,
                    },
                );
            }
            LogRecord::Ack { id } | LogRecord::Evict { id } => {
                if live.remove(&id).is_some() {
                    dead += 2;
                } else {
                    dead += 1;
                }
            }
        }
    }
    Ok((live.into_values().collect(), dead))
}

fn storage(err: impl std::fmt::Display) -> BufferError {
    BufferError::Storage(err.to_string())
}
