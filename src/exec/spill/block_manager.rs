// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! On-disk layout of one spill file and the manager that allocates them.
//!
//! A spill file holds one sorted run: a fixed binary header, a sequence of
//! Arrow IPC messages (one per chunk), and a trailing fixed-width message
//! index. The format is private to a single query execution; files never
//! outlive the owning operator, so there is no cross-version contract.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::exec::error::{SortError, SortResult};
use crate::exec::spill::dir_manager::DirManager;
use crate::exec::spill::ipc_serde::SpillCodec;

const RUN_MAGIC: [u8; 4] = *b"SRUN";
const RUN_VERSION: u16 = 1;
pub(crate) const RUN_HEADER_LEN: usize = 40;
pub(crate) const MESSAGE_INDEX_ENTRY_LEN: usize = 24;

#[derive(Debug, Clone)]
pub struct RunHeader {
    pub codec: SpillCodec,
    pub num_messages: u32,
    pub schema_hash: u64,
    pub index_offset: u64,
    pub index_length: u64,
}

impl RunHeader {
    pub fn new(codec: SpillCodec, schema_hash: u64) -> Self {
        Self {
            codec,
            num_messages: 0,
            schema_hash,
            index_offset: 0,
            index_length: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; RUN_HEADER_LEN] {
        let mut buf = [0u8; RUN_HEADER_LEN];
        buf[..4].copy_from_slice(&RUN_MAGIC);
        buf[4..6].copy_from_slice(&RUN_VERSION.to_le_bytes());
        buf[6] = self.codec.as_u8();
        buf[7] = 0;
        buf[8..12].copy_from_slice(&self.num_messages.to_le_bytes());
        buf[12..20].copy_from_slice(&self.schema_hash.to_le_bytes());
        buf[20..28].copy_from_slice(&self.index_offset.to_le_bytes());
        buf[28..36].copy_from_slice(&self.index_length.to_le_bytes());
        // buf[36..40] reserved, zero
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> SortResult<Self> {
        if buf.len() < RUN_HEADER_LEN {
            return Err(SortError::corrupt("spill run header is too small"));
        }
        if buf[..4] != RUN_MAGIC {
            return Err(SortError::corrupt("spill run header magic mismatch"));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version != RUN_VERSION {
            return Err(SortError::corrupt(format!(
                "unsupported spill run version: {version}"
            )));
        }
        let codec = SpillCodec::try_from(buf[6])?;
        if buf[7] != 0 || buf[36..40] != [0u8; 4] {
            return Err(SortError::corrupt(
                "spill run header reserved bytes must be zero",
            ));
        }
        Ok(Self {
            codec,
            num_messages: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            schema_hash: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            index_offset: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            index_length: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MessageIndexEntry {
    pub offset: u64,
    pub length: u64,
    pub num_rows: u32,
}

impl MessageIndexEntry {
    pub fn to_bytes(&self) -> [u8; MESSAGE_INDEX_ENTRY_LEN] {
        let mut buf = [0u8; MESSAGE_INDEX_ENTRY_LEN];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf[16..20].copy_from_slice(&self.num_rows.to_le_bytes());
        // buf[20..24] reserved, zero
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> SortResult<Self> {
        if buf.len() < MESSAGE_INDEX_ENTRY_LEN {
            return Err(SortError::corrupt("spill message index entry is too small"));
        }
        if buf[20..24] != [0u8; 4] {
            return Err(SortError::corrupt(
                "spill message index reserved bytes must be zero",
            ));
        }
        Ok(Self {
            offset: u64::from_le_bytes(buf[..8].try_into().unwrap()),
            length: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            num_rows: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RunMeta {
    pub header: RunHeader,
    pub index: Vec<MessageIndexEntry>,
}

pub fn write_run_header<W: Write>(writer: &mut W, header: &RunHeader) -> SortResult<()> {
    writer
        .write_all(&header.to_bytes())
        .map_err(|e| SortError::io("write spill run header failed", e))
}

pub fn read_run_header<R: Read>(reader: &mut R) -> SortResult<RunHeader> {
    let mut buf = [0u8; RUN_HEADER_LEN];
    reader
        .read_exact(&mut buf)
        .map_err(|e| SortError::io("read spill run header failed", e))?;
    RunHeader::from_bytes(&buf)
}

pub fn write_run_index<W: Write>(writer: &mut W, entries: &[MessageIndexEntry]) -> SortResult<()> {
    for entry in entries {
        writer
            .write_all(&entry.to_bytes())
            .map_err(|e| SortError::io("write spill run index failed", e))?;
    }
    Ok(())
}

pub fn read_run_index<R: Read + Seek>(
    reader: &mut R,
    header: &RunHeader,
) -> SortResult<Vec<MessageIndexEntry>> {
    if header.index_length == 0 {
        return Ok(Vec::new());
    }
    if header.index_length % MESSAGE_INDEX_ENTRY_LEN as u64 != 0 {
        return Err(SortError::corrupt("spill run index length is not aligned"));
    }
    reader
        .seek(SeekFrom::Start(header.index_offset))
        .map_err(|e| SortError::io("seek to spill run index failed", e))?;
    let entry_count = (header.index_length / MESSAGE_INDEX_ENTRY_LEN as u64) as usize;
    if entry_count != header.num_messages as usize {
        return Err(SortError::corrupt(format!(
            "spill run index entry count mismatch: header={} index={}",
            header.num_messages, entry_count
        )));
    }
    let mut entries = Vec::with_capacity(entry_count);
    let mut buf = [0u8; MESSAGE_INDEX_ENTRY_LEN];
    for _ in 0..entry_count {
        reader
            .read_exact(&mut buf)
            .map_err(|e| SortError::io("read spill run index entry failed", e))?;
        entries.push(MessageIndexEntry::from_bytes(&buf)?);
    }
    Ok(entries)
}

/// Allocates uniquely named spill files inside the managed directory.
///
/// Names embed the process id and a monotonically increasing id; creation
/// uses `create_new` with a bounded retry so concurrent containers sharing a
/// directory never collide.
#[derive(Debug)]
pub struct BlockManager {
    dir_manager: DirManager,
    next_id: AtomicU64,
    pid: u32,
}

impl BlockManager {
    pub fn new(dir_manager: DirManager) -> Arc<Self> {
        Arc::new(Self {
            dir_manager,
            next_id: AtomicU64::new(0),
            pid: std::process::id(),
        })
    }

    pub fn create_run_file(&self) -> SortResult<(PathBuf, File)> {
        let mut attempts = 0;
        loop {
            self.dir_manager.ensure()?;
            let id = self.next_id.fetch_add(1, Ordering::AcqRel);
            let filename = format!("sort_spill_{:x}_{:x}.ipc", self.pid, id);
            let path = self.dir_manager.dir().join(filename);
            let file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path);
            match file {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                    continue;
                }
                Err(err) => {
                    return Err(SortError::io(
                        format!("create spill file {} failed", path.display()),
                        err,
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn header_roundtrip() {
        let mut header = RunHeader::new(SpillCodec::Lz4, 0xdead_beef);
        header.num_messages = 3;
        header.index_offset = 128;
        header.index_length = 3 * MESSAGE_INDEX_ENTRY_LEN as u64;
        let parsed = RunHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed.num_messages, 3);
        assert_eq!(parsed.schema_hash, 0xdead_beef);
        assert_eq!(parsed.index_offset, 128);
        assert_eq!(parsed.codec, SpillCodec::Lz4);
    }

    #[test]
    fn corrupt_magic_is_rejected() {
        let mut bytes = RunHeader::new(SpillCodec::None, 1).to_bytes();
        bytes[0] = b'X';
        let err = RunHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, SortError::CorruptChunk(_)));
    }

    #[test]
    fn index_roundtrip() {
        let entries = vec![
            MessageIndexEntry {
                offset: RUN_HEADER_LEN as u64,
                length: 100,
                num_rows: 10,
            },
            MessageIndexEntry {
                offset: RUN_HEADER_LEN as u64 + 100,
                length: 50,
                num_rows: 5,
            },
        ];
        let mut buf = Vec::new();
        write_run_index(&mut buf, &entries).unwrap();
        let mut header = RunHeader::new(SpillCodec::None, 0);
        header.num_messages = 2;
        header.index_offset = 0;
        header.index_length = buf.len() as u64;
        let parsed = read_run_index(&mut Cursor::new(buf), &header).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].num_rows, 5);
    }

    #[test]
    fn run_files_are_uniquely_named() {
        let temp = tempdir().unwrap();
        let manager = BlockManager::new(DirManager::new(temp.path().to_path_buf()).unwrap());
        let (path_a, _file_a) = manager.create_run_file().unwrap();
        let (path_b, _file_b) = manager.create_run_file().unwrap();
        assert_ne!(PathBuf::from(&path_a), PathBuf::from(&path_b));
    }
}
