//! # Archive container
//!
//! Layout of a `.bzp` archive:
//!
//! ```text
//! [8 bytes magic "BLZPIPE1"]
//! [chunk payloads, back to back]
//! [zstd-compressed JSON ArchiveIndex]
//! [u64 LE compressed index size][u64 LE JSON size][u32 LE CRC32 of JSON]
//! [8 bytes magic "BPIDX001"]
//! ```
//!
//! Payloads are appended in archive order: files in the order the caller
//! listed them, each file's chunks by sequence. A chunk is stored either as
//! codec output (`packed = true`) or raw when compressing it did not help.

use std::collections::HashSet;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::chunk::FileId;
use crate::error::{PipelineError, Result};
use crate::fsx::File;

pub const MAGIC_BYTES: &[u8; 8] = b"BLZPIPE1";
pub const INDEX_MAGIC: &[u8; 8] = b"BPIDX001";
pub const FORMAT_VERSION: u16 = 1;
const FOOTER_LEN: u64 = 8 + 8 + 4 + 8;
const INDEX_ZSTD_LEVEL: i32 = 3;

/// Location and stored form of one chunk.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Absolute offset of the stored bytes in the archive file.
    pub offset: u64,
    pub stored_size: u64,
    pub raw_size: u64,
    /// `false` when the bytes are stored raw.
    pub packed: bool,
    /// CRC32 over the stored bytes.
    pub crc32: u32,
}

/// Represents a single file in the archive's index.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileIndexEntry {
    /// Relative path, always with forward slashes.
    pub path: String,
    /// Uncompressed size; equals the sum of the chunks' `raw_size`.
    pub size: u64,
    /// The Unix-style permissions of the file, if available.
    pub permissions: Option<u32>,
    pub chunks: Vec<ChunkRecord>,
}

impl FileIndexEntry {
    pub fn stored_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.stored_size).sum()
    }
}

/// Central directory, serialized as JSON and zstd-compressed at the end of the archive.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveIndex {
    pub version: u16,
    /// Unix timestamp of when the archive was created.
    pub created: i64,
    /// Name of the codec used for every `packed` chunk.
    pub codec: String,
    pub chunk_size: u64,
    pub entries: Vec<FileIndexEntry>,
}

/// One step of the sequential extraction plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedChunk {
    pub file_id: FileId,
    pub sequence: u64,
    /// Offset of the chunk's first byte inside the extracted file.
    pub file_offset: u64,
    pub record: ChunkRecord,
}

/// Builds an archive in a temporary file next to `destination`.
///
/// Nothing appears at `destination` until [`ArchiveWriter::finish`]
/// succeeds; dropping the writer deletes the temporary file.
pub struct ArchiveWriter {
    writer: BufWriter<NamedTempFile>,
    destination: PathBuf,
    offset: u64,
    index: ArchiveIndex,
}

impl ArchiveWriter {
    pub fn create(destination: &Path, codec: &str, chunk_size: u64) -> Result<Self> {
        let dir = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let tmp = tempfile::Builder::new()
            .prefix(".blitzpipe-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| PipelineError::io(e, dir))?;
        let mut writer = BufWriter::new(tmp);
        writer
            .write_all(MAGIC_BYTES)
            .map_err(|e| PipelineError::io(e, destination))?;
        Ok(ArchiveWriter {
            writer,
            destination: destination.to_path_buf(),
            offset: MAGIC_BYTES.len() as u64,
            index: ArchiveIndex {
                version: FORMAT_VERSION,
                created: chrono::Utc::now().timestamp(),
                codec: codec.to_string(),
                chunk_size,
                entries: Vec::new(),
            },
        })
    }

    /// Register a file. Entries keep registration order; the returned id is
    /// the entry's position.
    pub fn add_entry(&mut self, path: String, size: u64, permissions: Option<u32>) -> FileId {
        self.index.entries.push(FileIndexEntry {
            path,
            size,
            permissions,
            chunks: Vec::new(),
        });
        (self.index.entries.len() - 1) as FileId
    }

    /// Append the next chunk of `file_id` to the payload area.
    pub fn append_chunk(&mut self, file_id: FileId, data: &[u8], raw_size: u64, packed: bool, crc32: u32) -> Result<()> {
        let entry = self
            .index
            .entries
            .get_mut(file_id as usize)
            .ok_or_else(|| PipelineError::Format(format!("chunk for unknown file id {file_id}")))?;
        self.writer
            .write_all(data)
            .map_err(|e| PipelineError::io(e, &self.destination))?;
        entry.chunks.push(ChunkRecord {
            offset: self.offset,
            stored_size: data.len() as u64,
            raw_size,
            packed,
            crc32,
        });
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Write index and footer, then move the archive into place.
    ///
    /// Files in `omit` are left out of the index; their payload bytes (if
    /// any were appended) become unreferenced.
    pub fn finish(mut self, omit: &HashSet<FileId>) -> Result<ArchiveIndex> {
        let mut index = std::mem::take(&mut self.index);
        index.entries = index
            .entries
            .into_iter()
            .enumerate()
            .filter(|(id, _)| !omit.contains(&(*id as FileId)))
            .map(|(_, entry)| entry)
            .collect();

        let dest = self.destination.clone();
        let io_err = |e: std::io::Error| PipelineError::io(e, &dest);

        let index_json = serde_json::to_vec(&index)?;
        let index_comp = zstd::stream::encode_all(&index_json[..], INDEX_ZSTD_LEVEL).map_err(io_err)?;
        let crc = crc32fast::hash(&index_json);

        let w = &mut self.writer;
        w.write_all(&index_comp).map_err(io_err)?;
        w.write_all(&(index_comp.len() as u64).to_le_bytes()).map_err(io_err)?;
        w.write_all(&(index_json.len() as u64).to_le_bytes()).map_err(io_err)?;
        w.write_all(&crc.to_le_bytes()).map_err(io_err)?;
        w.write_all(INDEX_MAGIC).map_err(io_err)?;

        let tmp = self.writer.into_inner().map_err(|e| io_err(e.into_error()))?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&dest).map_err(|e| io_err(e.error))?;
        tracing::debug!(archive = %dest.display(), entries = index.entries.len(), "archive persisted");
        Ok(index)
    }
}

/// Read side of the container: validates the footer and index on open and
/// then serves chunk payloads sequentially.
pub struct ArchiveReader {
    reader: BufReader<File>,
    path: PathBuf,
    position: u64,
    index: ArchiveIndex,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let io_err = |e: std::io::Error| PipelineError::io(e, path);
        let mut file = File::open(path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        let header_len = MAGIC_BYTES.len() as u64;
        if len < header_len + FOOTER_LEN {
            return Err(PipelineError::Format("file too small to be an archive".into()));
        }

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic).map_err(io_err)?;
        if &magic != MAGIC_BYTES {
            return Err(PipelineError::Format("bad header magic".into()));
        }

        let mut footer = [0u8; FOOTER_LEN as usize];
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64))).map_err(io_err)?;
        file.read_exact(&mut footer).map_err(io_err)?;
        if &footer[20..28] != INDEX_MAGIC {
            return Err(PipelineError::Format("bad index magic".into()));
        }
        let comp_size = u64::from_le_bytes(footer[0..8].try_into().unwrap_or_default());
        let json_size = u64::from_le_bytes(footer[8..16].try_into().unwrap_or_default());
        let expected_crc = u32::from_le_bytes(footer[16..20].try_into().unwrap_or_default());

        let payload_end = (len - FOOTER_LEN)
            .checked_sub(comp_size)
            .filter(|&end| end >= header_len)
            .ok_or_else(|| PipelineError::Format("index size exceeds archive".into()))?;

        let mut comp = vec![0u8; comp_size as usize];
        file.seek(SeekFrom::Start(payload_end)).map_err(io_err)?;
        file.read_exact(&mut comp).map_err(io_err)?;
        let not_decompressed = |e: std::io::Error| PipelineError::Format(format!("index does not decompress: {e}"));
        let mut json = Vec::new();
        zstd::stream::read::Decoder::new(&comp[..])
            .map_err(not_decompressed)?
            .take(json_size.saturating_add(1))
            .read_to_end(&mut json)
            .map_err(not_decompressed)?;
        if json.len() as u64 != json_size {
            return Err(PipelineError::Format(format!(
                "index length {} does not match footer ({json_size})",
                json.len()
            )));
        }
        let actual_crc = crc32fast::hash(&json);
        if actual_crc != expected_crc {
            return Err(PipelineError::Format(format!(
                "index checksum mismatch (expected {expected_crc:#010x}, actual {actual_crc:#010x})"
            )));
        }
        let index: ArchiveIndex = serde_json::from_slice(&json)?;
        validate_index(&index, header_len, payload_end)?;

        file.seek(SeekFrom::Start(header_len)).map_err(io_err)?;
        Ok(ArchiveReader {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            position: header_len,
            index,
        })
    }

    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    /// Every chunk in the order it sits in the archive stream.
    pub fn plan(&self) -> Vec<PlannedChunk> {
        let mut plan: Vec<PlannedChunk> = self
            .index
            .entries
            .iter()
            .enumerate()
            .flat_map(|(id, entry)| {
                let mut file_offset = 0u64;
                entry.chunks.iter().enumerate().map(move |(seq, record)| {
                    let planned = PlannedChunk {
                        file_id: id as FileId,
                        sequence: seq as u64,
                        file_offset,
                        record: *record,
                    };
                    file_offset += record.raw_size;
                    planned
                })
            })
            .collect();
        plan.sort_by_key(|c| c.record.offset);
        plan
    }

    /// Read a chunk's stored bytes into `buf` (replacing its contents).
    /// Seeks only when the chunk does not follow the previous read.
    pub fn read_chunk(&mut self, record: &ChunkRecord, buf: &mut Vec<u8>) -> Result<()> {
        let io_err = |e: std::io::Error| PipelineError::io(e, &self.path);
        if record.offset != self.position {
            self.reader.seek(SeekFrom::Start(record.offset)).map_err(io_err)?;
        }
        buf.clear();
        buf.resize(record.stored_size as usize, 0);
        self.reader.read_exact(buf).map_err(io_err)?;
        self.position = record.offset + record.stored_size;
        Ok(())
    }
}

/// Structural checks on a freshly read index.
///
/// Each file's chunks must sit in the payload area in sequence order without
/// overlapping: extraction reads the archive front to back, and the
/// coordinator can only release a file's chunks in sequence order.
fn validate_index(index: &ArchiveIndex, payload_start: u64, payload_end: u64) -> Result<()> {
    if index.version != FORMAT_VERSION {
        return Err(PipelineError::Format(format!("unsupported version {}", index.version)));
    }
    for entry in &index.entries {
        let mut total = 0u64;
        let mut previous_end = payload_start;
        for (sequence, chunk) in entry.chunks.iter().enumerate() {
            let end = chunk
                .offset
                .checked_add(chunk.stored_size)
                .filter(|&end| chunk.offset >= payload_start && end <= payload_end)
                .ok_or_else(|| {
                    PipelineError::Format(format!("chunk of '{}' lies outside the payload area", entry.path))
                })?;
            if chunk.offset < previous_end {
                return Err(PipelineError::Format(format!(
                    "chunk {sequence} of '{}' starts at {} before the end of its predecessor ({previous_end})",
                    entry.path, chunk.offset
                )));
            }
            previous_end = end;
            total = total.checked_add(chunk.raw_size).ok_or_else(|| {
                PipelineError::Format(format!("chunk sizes of '{}' overflow", entry.path))
            })?;
        }
        if total != entry.size {
            return Err(PipelineError::Format(format!(
                "chunks of '{}' cover {total} bytes, entry says {}",
                entry.path, entry.size
            )));
        }
    }
    Ok(())
}

/// Archive name for a path relative to the input root: forward slashes, no `.`.
pub fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Turn an index path into a relative path that stays inside the output
/// directory. Absolute paths and `..` components are rejected.
pub fn sanitize_entry_path(name: &str) -> Result<PathBuf> {
    let reject = || PipelineError::Format(format!("unsafe entry path '{name}'"));
    if name.is_empty() || name.starts_with('/') || name.starts_with('\\') {
        return Err(reject());
    }
    let mut out = PathBuf::new();
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(reject()),
            p if p.contains(':') => return Err(reject()),
            p => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(reject());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_archive(dir: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dest = dir.join("sample.bzp");
        let mut writer = ArchiveWriter::create(&dest, "store", 4)?;
        let a = writer.add_entry("a.txt".into(), 6, Some(0o644));
        let b = writer.add_entry("dir/b.txt".into(), 3, None);
        writer.append_chunk(a, b"abcd", 4, false, crc32fast::hash(b"abcd"))?;
        writer.append_chunk(a, b"ef", 2, false, crc32fast::hash(b"ef"))?;
        writer.append_chunk(b, b"xyz", 3, false, crc32fast::hash(b"xyz"))?;
        writer.finish(&HashSet::new())?;
        Ok(dest)
    }

    #[test]
    fn write_then_read_back() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let dest = sample_archive(dir.path())?;
        let mut reader = ArchiveReader::open(&dest)?;
        assert_eq!(reader.index().entries.len(), 2);
        assert_eq!(reader.index().entries[1].path, "dir/b.txt");
        assert_eq!(reader.index().entries[0].permissions, Some(0o644));

        let plan = reader.plan();
        assert_eq!(
            plan.iter().map(|c| (c.file_id, c.sequence, c.file_offset)).collect::<Vec<_>>(),
            vec![(0, 0, 0), (0, 1, 4), (1, 0, 0)]
        );
        let mut buf = Vec::new();
        let mut all = Vec::new();
        for chunk in &plan {
            reader.read_chunk(&chunk.record, &mut buf)?;
            all.extend_from_slice(&buf);
        }
        assert_eq!(all, b"abcdefxyz");
        Ok(())
    }

    #[test]
    fn dropped_writer_leaves_nothing_behind() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let dest = dir.path().join("never.bzp");
        let mut writer = ArchiveWriter::create(&dest, "zstd", 1024)?;
        let id = writer.add_entry("x".into(), 1, None);
        writer.append_chunk(id, b"x", 1, false, 0)?;
        drop(writer);
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn omitted_entries_are_not_indexed() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let dest = dir.path().join("omit.bzp");
        let mut writer = ArchiveWriter::create(&dest, "store", 4)?;
        let keep = writer.add_entry("keep".into(), 1, None);
        let skip = writer.add_entry("skip".into(), 0, None);
        writer.append_chunk(keep, b"k", 1, false, crc32fast::hash(b"k"))?;
        let index = writer.finish(&HashSet::from([skip]))?;
        assert_eq!(index.entries.len(), 1);
        assert_eq!(ArchiveReader::open(&dest)?.index().entries[0].path, "keep");
        Ok(())
    }

    #[test]
    fn corrupted_index_is_a_format_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let dest = sample_archive(dir.path())?;
        let mut bytes = std::fs::read(&dest)?;
        let crc_at = bytes.len() - 12;
        bytes[crc_at] ^= 0xff;
        std::fs::write(&dest, &bytes)?;
        assert!(matches!(ArchiveReader::open(&dest), Err(PipelineError::Format(_))));

        std::fs::write(&dest, b"BLZPIPE1 but nothing else")?;
        assert!(matches!(ArchiveReader::open(&dest), Err(PipelineError::Format(_))));
        Ok(())
    }

    #[test]
    fn entry_paths_are_sanitized() {
        assert_eq!(sanitize_entry_path("a/./b").unwrap(), PathBuf::from("a").join("b"));
        assert!(sanitize_entry_path("../etc/passwd").is_err());
        assert!(sanitize_entry_path("/abs").is_err());
        assert!(sanitize_entry_path("a/../../b").is_err());
        assert!(sanitize_entry_path("C:/win").is_err());
        assert_eq!(entry_name(Path::new("./x/y.txt")), "x/y.txt");
    }
}
