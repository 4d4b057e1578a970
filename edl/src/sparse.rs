// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Android Sparse image codec: streaming expansion, composition from raw,
//! chunk-granular split/merge.
//!
//! Expansion never holds more than one payload buffer in memory; the
//! Firehose program path feeds an [`ExpandReader`] straight into the wire.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{EdlError, Result};

pub const SPARSE_MAGIC: u32 = 0xED26FF3A;

const CHUNK_RAW: u16 = 0xCAC1;
const CHUNK_FILL: u16 = 0xCAC2;
const CHUNK_DONT_CARE: u16 = 0xCAC3;
const CHUNK_CRC32: u16 = 0xCAC4;

pub const FILE_HEADER_SIZE: u16 = 28;
pub const CHUNK_HEADER_SIZE: u16 = 12;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SparseHeader {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_sz: u16,
    pub chunk_hdr_sz: u16,
    pub blk_sz: u32,
    pub total_blks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawChunkHeader {
    chunk_type: u16,
    reserved: u16,
    chunk_sz: u32,
    total_sz: u32,
}

/// One chunk, decoded. `total_sz` consistency is checked at parse time:
/// header size plus payload bytes for Raw, 4 for Fill/Crc32, 0 for DontCare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Raw,
    Fill(u32),
    DontCare,
    Crc32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub kind: ChunkKind,
    pub blocks: u32,
}

/// Check the magic at offset 0 and rewind.
pub fn is_sparse_file<R: Read + Seek>(r: &mut R) -> std::io::Result<bool> {
    r.seek(SeekFrom::Start(0))?;
    let mut magic = [0u8; 4];
    let sparse = match r.read_exact(&mut magic) {
        Ok(()) => u32::from_le_bytes(magic) == SPARSE_MAGIC,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e),
    };
    r.seek(SeekFrom::Start(0))?;
    Ok(sparse)
}

pub fn is_sparse_buf(buf: &[u8]) -> bool {
    buf.len() >= 4 && u32::from_le_bytes(buf[..4].try_into().unwrap()) == SPARSE_MAGIC
}

fn read_header(r: &mut dyn Read) -> Result<SparseHeader> {
    let mut buf = [0u8; FILE_HEADER_SIZE as usize];
    r.read_exact(&mut buf)?;
    let hdr: SparseHeader =
        bincode::deserialize(&buf).map_err(|e| EdlError::CorruptMetadata(e.to_string()))?;
    if hdr.magic != SPARSE_MAGIC {
        return Err(EdlError::BadMagic {
            what: "sparse",
            value: hdr.magic as u64,
        });
    }
    if hdr.file_hdr_sz < FILE_HEADER_SIZE || hdr.chunk_hdr_sz < CHUNK_HEADER_SIZE {
        return Err(EdlError::CorruptMetadata("sparse header sizes".into()));
    }
    if hdr.blk_sz == 0 || hdr.blk_sz % 4 != 0 {
        return Err(EdlError::CorruptMetadata(format!("sparse block size {}", hdr.blk_sz)));
    }
    Ok(hdr)
}

/// Streaming expander. Reads chunk-by-chunk from the underlying sparse
/// stream and yields the raw image bytes; memory use is bounded by the
/// caller's read buffer.
pub struct ExpandReader<R: Read> {
    inner: R,
    header: SparseHeader,
    chunks_read: u32,
    kind: ChunkKind,
    chunk_left: u64,
    fill: [u8; 4],
    fill_pos: usize,
}

impl<R: Read> ExpandReader<R> {
    pub fn new(mut inner: R) -> Result<Self> {
        let header = read_header(&mut inner)?;
        // Skip any vendor extension of the file header
        skip(&mut inner, header.file_hdr_sz as u64 - FILE_HEADER_SIZE as u64)?;
        Ok(ExpandReader {
            inner,
            header,
            chunks_read: 0,
            kind: ChunkKind::DontCare,
            chunk_left: 0,
            fill: [0; 4],
            fill_pos: 0,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    pub fn expanded_len(&self) -> u64 {
        self.header.total_blks as u64 * self.header.blk_sz as u64
    }

    fn next_chunk(&mut self) -> std::io::Result<bool> {
        if self.chunks_read == self.header.total_chunks {
            return Ok(false);
        }
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        self.inner.read_exact(&mut buf)?;
        let raw: RawChunkHeader = bincode::deserialize(&buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        skip(
            &mut self.inner,
            self.header.chunk_hdr_sz as u64 - CHUNK_HEADER_SIZE as u64,
        )
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        self.chunks_read += 1;

        let payload = raw.total_sz as u64 - self.header.chunk_hdr_sz as u64;
        let expanded = raw.chunk_sz as u64 * self.header.blk_sz as u64;
        let bad = |what: &str| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("sparse chunk {}: bad {what}", self.chunks_read),
            )
        };

        match raw.chunk_type {
            CHUNK_RAW => {
                if payload != expanded {
                    return Err(bad("raw payload size"));
                }
                self.kind = ChunkKind::Raw;
                self.chunk_left = expanded;
            }
            CHUNK_FILL => {
                if payload != 4 {
                    return Err(bad("fill payload size"));
                }
                self.inner.read_exact(&mut self.fill)?;
                self.fill_pos = 0;
                self.kind = ChunkKind::Fill(u32::from_le_bytes(self.fill));
                self.chunk_left = expanded;
            }
            CHUNK_DONT_CARE => {
                if payload != 0 {
                    return Err(bad("dont-care payload size"));
                }
                self.kind = ChunkKind::DontCare;
                self.chunk_left = expanded;
            }
            CHUNK_CRC32 => {
                if payload != 4 {
                    return Err(bad("crc32 payload size"));
                }
                let mut crc = [0u8; 4];
                self.inner.read_exact(&mut crc)?;
                // Consumed, emits nothing
                self.kind = ChunkKind::Crc32;
                self.chunk_left = 0;
            }
            _ => return Err(bad("chunk type")),
        }
        Ok(true)
    }
}

impl<R: Read> Read for ExpandReader<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.chunk_left == 0 {
                if !self.next_chunk()? {
                    return Ok(0);
                }
                continue;
            }
            let want = std::cmp::min(out.len() as u64, self.chunk_left) as usize;
            let n = match self.kind {
                ChunkKind::Raw => {
                    let n = self.inner.read(&mut out[..want])?;
                    if n == 0 {
                        return Err(std::io::ErrorKind::UnexpectedEof.into());
                    }
                    n
                }
                ChunkKind::Fill(_) => {
                    for b in out[..want].iter_mut() {
                        *b = self.fill[self.fill_pos];
                        self.fill_pos = (self.fill_pos + 1) % 4;
                    }
                    want
                }
                ChunkKind::DontCare => {
                    out[..want].fill(0);
                    want
                }
                ChunkKind::Crc32 => unreachable!("crc chunks expand to nothing"),
            };
            self.chunk_left -= n as u64;
            return Ok(n);
        }
    }
}

fn skip(r: &mut dyn Read, mut n: u64) -> Result<()> {
    let mut buf = [0u8; 256];
    while n > 0 {
        let want = std::cmp::min(n, buf.len() as u64) as usize;
        r.read_exact(&mut buf[..want])?;
        n -= want as u64;
    }
    Ok(())
}

/// Expand a whole sparse stream into `out`; returns the number of raw bytes
/// written.
pub fn expand<R: Read, W: Write>(src: R, out: &mut W) -> Result<u64> {
    let mut reader = ExpandReader::new(src)?;
    let total = reader.expanded_len();
    let mut buf = vec![0u8; 1024 * 1024];
    let mut written = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        written += n as u64;
    }
    if written != total {
        return Err(EdlError::CorruptMetadata(format!(
            "sparse image expanded to {written} bytes, header promised {total}"
        )));
    }
    Ok(written)
}

fn write_file_header<W: Write>(out: &mut W, hdr: &SparseHeader) -> Result<()> {
    let bytes = bincode::serialize(hdr).map_err(|e| EdlError::CorruptMetadata(e.to_string()))?;
    out.write_all(&bytes)?;
    Ok(())
}

fn write_chunk_header<W: Write>(
    out: &mut W,
    chunk_type: u16,
    blocks: u32,
    payload: u32,
) -> Result<()> {
    let hdr = RawChunkHeader {
        chunk_type,
        reserved: 0,
        chunk_sz: blocks,
        total_sz: CHUNK_HEADER_SIZE as u32 + payload,
    };
    let bytes = bincode::serialize(&hdr).map_err(|e| EdlError::CorruptMetadata(e.to_string()))?;
    out.write_all(&bytes)?;
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockClass {
    Zero,
    Fill(u32),
    Raw,
}

fn classify(block: &[u8]) -> BlockClass {
    if block.iter().all(|&b| b == 0) {
        return BlockClass::Zero;
    }
    let word = &block[..4];
    if block.chunks_exact(4).all(|c| c == word) {
        return BlockClass::Fill(u32::from_le_bytes(word.try_into().unwrap()));
    }
    BlockClass::Raw
}

/// Compose a sparse image from a raw stream. Blocks classify as DontCare
/// (all zero), Fill (repeating 32-bit word) or Raw; adjacent blocks of equal
/// classification merge into one chunk. A placeholder header goes out first
/// and the totals are patched in at the end, so the output must be seekable.
pub fn compose<R: Read, W: Write + Seek>(
    mut src: R,
    out: &mut W,
    block_size: u32,
) -> Result<SparseHeader> {
    let mut header = SparseHeader {
        magic: SPARSE_MAGIC,
        major_version: 1,
        minor_version: 0,
        file_hdr_sz: FILE_HEADER_SIZE,
        chunk_hdr_sz: CHUNK_HEADER_SIZE,
        blk_sz: block_size,
        total_blks: 0,
        total_chunks: 0,
        image_checksum: 0,
    };
    write_file_header(out, &header)?;

    let mut block = vec![0u8; block_size as usize];
    let mut run_class: Option<BlockClass> = None;
    let mut run_blocks = 0u32;
    // Raw runs stream through a placeholder chunk header patched afterwards
    let mut raw_hdr_pos: u64 = 0;

    let flush_run = |out: &mut W,
                     class: BlockClass,
                     blocks: u32,
                     raw_hdr_pos: u64|
     -> Result<()> {
        match class {
            BlockClass::Zero => write_chunk_header(out, CHUNK_DONT_CARE, blocks, 0),
            BlockClass::Fill(word) => {
                write_chunk_header(out, CHUNK_FILL, blocks, 4)?;
                out.write_all(&word.to_le_bytes())?;
                Ok(())
            }
            BlockClass::Raw => {
                // Rewind to the placeholder and fix the block count
                let end = out.stream_position().map_err(EdlError::Io)?;
                out.seek(SeekFrom::Start(raw_hdr_pos))?;
                write_chunk_header(out, CHUNK_RAW, blocks, blocks * block_size)?;
                out.seek(SeekFrom::Start(end))?;
                Ok(())
            }
        }
    };

    loop {
        let n = read_full(&mut src, &mut block)?;
        if n == 0 {
            break;
        }
        // Pad a trailing partial block out to block size
        block[n..].fill(0);
        let class = classify(&block);

        match run_class {
            Some(current) if current == class => {}
            Some(current) => {
                flush_run(out, current, run_blocks, raw_hdr_pos)?;
                header.total_chunks += 1;
                run_blocks = 0;
                run_class = Some(class);
                if class == BlockClass::Raw {
                    raw_hdr_pos = out.stream_position()?;
                    write_chunk_header(out, CHUNK_RAW, 0, 0)?;
                }
            }
            None => {
                run_class = Some(class);
                if class == BlockClass::Raw {
                    raw_hdr_pos = out.stream_position()?;
                    write_chunk_header(out, CHUNK_RAW, 0, 0)?;
                }
            }
        }
        if class == BlockClass::Raw {
            out.write_all(&block)?;
        }
        run_blocks += 1;
        header.total_blks += 1;
    }
    if let Some(current) = run_class {
        flush_run(out, current, run_blocks, raw_hdr_pos)?;
        header.total_chunks += 1;
    }

    // Patch the real totals into the placeholder header
    let end = out.stream_position()?;
    out.seek(SeekFrom::Start(0))?;
    write_file_header(out, &header)?;
    out.seek(SeekFrom::Start(end))?;
    debug!(
        "composed sparse: {} blocks in {} chunks",
        header.total_blks, header.total_chunks
    );
    Ok(header)
}

fn read_full(src: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Scan the chunk directory of a sparse file: offsets, kinds, block counts.
fn chunk_directory<R: Read + Seek>(r: &mut R) -> Result<(SparseHeader, Vec<(u64, ChunkDescriptor, u64)>)> {
    r.seek(SeekFrom::Start(0))?;
    let header = read_header(r)?;
    skip(r, header.file_hdr_sz as u64 - FILE_HEADER_SIZE as u64)?;

    let mut chunks = Vec::with_capacity(header.total_chunks as usize);
    for _ in 0..header.total_chunks {
        let pos = r.stream_position()?;
        let mut buf = [0u8; CHUNK_HEADER_SIZE as usize];
        r.read_exact(&mut buf)?;
        let raw: RawChunkHeader =
            bincode::deserialize(&buf).map_err(|e| EdlError::CorruptMetadata(e.to_string()))?;
        let kind = match raw.chunk_type {
            CHUNK_RAW => ChunkKind::Raw,
            CHUNK_FILL => ChunkKind::Fill(0),
            CHUNK_DONT_CARE => ChunkKind::DontCare,
            CHUNK_CRC32 => ChunkKind::Crc32,
            t => {
                return Err(EdlError::CorruptMetadata(format!("sparse chunk type 0x{t:04x}")));
            }
        };
        let total_sz = raw.total_sz as u64;
        chunks.push((
            pos,
            ChunkDescriptor {
                kind,
                blocks: raw.chunk_sz,
            },
            total_sz,
        ));
        r.seek(SeekFrom::Start(pos + total_sz))?;
    }
    Ok((header, chunks))
}

/// Split a sparse image into parts no larger than `max_part_bytes` each.
/// Splitting happens at chunk granularity only; a single chunk larger than
/// the cap becomes its own oversized part. Parts after the first start with
/// a DontCare chunk covering the blocks already emitted, so each part flashes
/// at the right offset on its own.
pub fn split(input: &Path, out_dir: &Path, max_part_bytes: u64) -> Result<Vec<PathBuf>> {
    let mut src = std::fs::File::open(input)?;
    let (header, chunks) = chunk_directory(&mut src)?;
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_owned());

    let mut parts: Vec<PathBuf> = Vec::new();
    let mut i = 0usize;
    let mut blocks_done = 0u64;

    while i < chunks.len() {
        let part_path = out_dir.join(format!("{}.part{:02}.simg", stem, parts.len()));
        let mut out = std::fs::File::create(&part_path)?;

        let mut part_hdr = SparseHeader {
            total_blks: 0,
            total_chunks: 0,
            ..header
        };
        write_file_header(&mut out, &part_hdr)?;

        if blocks_done > 0 {
            write_chunk_header(&mut out, CHUNK_DONT_CARE, blocks_done as u32, 0)?;
            part_hdr.total_chunks += 1;
            part_hdr.total_blks += blocks_done as u32;
        }

        let mut written = FILE_HEADER_SIZE as u64 + CHUNK_HEADER_SIZE as u64;
        let mut any = false;
        while i < chunks.len() {
            let (off, desc, total_sz) = chunks[i];
            if any && written + total_sz > max_part_bytes {
                break;
            }
            copy_range(&mut src, &mut out, off, total_sz)?;
            part_hdr.total_chunks += 1;
            part_hdr.total_blks += desc.blocks;
            blocks_done += desc.blocks as u64;
            written += total_sz;
            any = true;
            i += 1;
        }

        let end = out.stream_position()?;
        out.seek(SeekFrom::Start(0))?;
        write_file_header(&mut out, &part_hdr)?;
        out.seek(SeekFrom::Start(end))?;
        parts.push(part_path);
    }
    Ok(parts)
}

/// Reassemble parts produced by [`split`] into one sparse image.
pub fn merge(parts: &[PathBuf], output: &Path) -> Result<()> {
    let mut out = std::fs::File::create(output)?;
    let mut merged: Option<SparseHeader> = None;
    write_file_header(
        &mut out,
        &SparseHeader {
            magic: SPARSE_MAGIC,
            major_version: 1,
            minor_version: 0,
            file_hdr_sz: FILE_HEADER_SIZE,
            chunk_hdr_sz: CHUNK_HEADER_SIZE,
            blk_sz: 0,
            total_blks: 0,
            total_chunks: 0,
            image_checksum: 0,
        },
    )?;

    for (k, part) in parts.iter().enumerate() {
        let mut src = std::fs::File::open(part)?;
        let (hdr, chunks) = chunk_directory(&mut src)?;
        let mut acc = merged.take().unwrap_or(SparseHeader {
            total_blks: 0,
            total_chunks: 0,
            ..hdr
        });
        if acc.blk_sz != hdr.blk_sz {
            return Err(EdlError::CorruptMetadata("merge: parts disagree on block size".into()));
        }

        for (j, (off, desc, total_sz)) in chunks.iter().enumerate() {
            // The leading pad of every later part duplicates what the
            // earlier parts already cover
            if k > 0 && j == 0 && desc.kind == ChunkKind::DontCare {
                continue;
            }
            copy_range(&mut src, &mut out, *off, *total_sz)?;
            acc.total_chunks += 1;
            acc.total_blks += desc.blocks;
        }
        merged = Some(acc);
    }

    if let Some(hdr) = merged {
        let end = out.stream_position()?;
        out.seek(SeekFrom::Start(0))?;
        write_file_header(&mut out, &hdr)?;
        out.seek(SeekFrom::Start(end))?;
    }
    Ok(())
}

fn copy_range<R: Read + Seek, W: Write>(src: &mut R, out: &mut W, off: u64, len: u64) -> Result<()> {
    src.seek(SeekFrom::Start(off))?;
    let mut left = len;
    let mut buf = vec![0u8; 64 * 1024];
    while left > 0 {
        let want = std::cmp::min(left, buf.len() as u64) as usize;
        src.read_exact(&mut buf[..want])?;
        out.write_all(&buf[..want])?;
        left -= want as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_sparse() -> Vec<u8> {
        // Fill(0) x1, Raw(0xAA) x1, DontCare x1; block size 4096
        let mut img = Vec::new();
        let hdr = SparseHeader {
            magic: SPARSE_MAGIC,
            major_version: 1,
            minor_version: 0,
            file_hdr_sz: FILE_HEADER_SIZE,
            chunk_hdr_sz: CHUNK_HEADER_SIZE,
            blk_sz: 4096,
            total_blks: 3,
            total_chunks: 3,
            image_checksum: 0,
        };
        img.extend(bincode::serialize(&hdr).unwrap());
        write_chunk_header(&mut img, CHUNK_FILL, 1, 4).unwrap();
        img.extend_from_slice(&0u32.to_le_bytes());
        write_chunk_header(&mut img, CHUNK_RAW, 1, 4096).unwrap();
        img.extend(std::iter::repeat_n(0xAAu8, 4096));
        write_chunk_header(&mut img, CHUNK_DONT_CARE, 1, 0).unwrap();
        img
    }

    #[test]
    fn expands_fill_raw_dontcare() {
        let img = sample_sparse();
        let mut out = Vec::new();
        let n = expand(Cursor::new(&img), &mut out).unwrap();
        assert_eq!(n, 3 * 4096);
        assert!(out[..4096].iter().all(|&b| b == 0));
        assert!(out[4096..8192].iter().all(|&b| b == 0xAA));
        assert!(out[8192..].iter().all(|&b| b == 0));
    }

    #[test]
    fn header_matches_file_size_invariant() {
        let img = sample_sparse();
        let hdr: SparseHeader = bincode::deserialize(&img[..28]).unwrap();
        let chunk_total: usize = (CHUNK_HEADER_SIZE as usize + 4)
            + (CHUNK_HEADER_SIZE as usize + 4096)
            + CHUNK_HEADER_SIZE as usize;
        assert_eq!(img.len(), hdr.file_hdr_sz as usize + chunk_total);
    }

    #[test]
    fn compose_then_expand_round_trips() {
        let block = 4096usize;
        let mut raw = Vec::new();
        raw.extend(std::iter::repeat_n(0u8, block * 2)); // DontCare run
        raw.extend((0..block).map(|i| (i % 251) as u8)); // Raw
        raw.extend(std::iter::repeat_n(0xA5u8, block * 3)); // Fill(0xA5A5A5A5)
        raw.extend((0..block).map(|i| (i % 13) as u8)); // Raw again

        let mut sparse = Cursor::new(Vec::new());
        let hdr = compose(Cursor::new(raw.clone()), &mut sparse, block as u32).unwrap();
        assert_eq!(hdr.total_blks, 7);
        assert_eq!(hdr.total_chunks, 4);

        sparse.set_position(0);
        let mut back = Vec::new();
        expand(sparse, &mut back).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn compose_pads_trailing_partial_block() {
        let raw = vec![7u8; 100];
        let mut sparse = Cursor::new(Vec::new());
        let hdr = compose(Cursor::new(raw), &mut sparse, 4096).unwrap();
        assert_eq!(hdr.total_blks, 1);

        sparse.set_position(0);
        let mut back = Vec::new();
        expand(sparse, &mut back).unwrap();
        assert_eq!(back.len(), 4096);
        assert!(back[..100].iter().all(|&b| b == 7));
        assert!(back[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn fill_pattern_survives_unaligned_reads() {
        let mut img = Vec::new();
        let hdr = SparseHeader {
            magic: SPARSE_MAGIC,
            major_version: 1,
            minor_version: 0,
            file_hdr_sz: FILE_HEADER_SIZE,
            chunk_hdr_sz: CHUNK_HEADER_SIZE,
            blk_sz: 4096,
            total_blks: 1,
            total_chunks: 1,
            image_checksum: 0,
        };
        img.extend(bincode::serialize(&hdr).unwrap());
        write_chunk_header(&mut img, CHUNK_FILL, 1, 4).unwrap();
        img.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]);

        let mut rdr = ExpandReader::new(Cursor::new(img)).unwrap();
        let mut out = Vec::new();
        // Deliberately awkward read sizes
        let mut chunk = [0u8; 7];
        loop {
            let n = rdr.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out.len(), 4096);
        for (i, &b) in out.iter().enumerate() {
            assert_eq!(b, [0x11, 0x22, 0x33, 0x44][i % 4]);
        }
    }

    #[test]
    fn crc_chunks_are_consumed_silently() {
        let mut img = Vec::new();
        let hdr = SparseHeader {
            magic: SPARSE_MAGIC,
            major_version: 1,
            minor_version: 0,
            file_hdr_sz: FILE_HEADER_SIZE,
            chunk_hdr_sz: CHUNK_HEADER_SIZE,
            blk_sz: 4096,
            total_blks: 1,
            total_chunks: 2,
            image_checksum: 0,
        };
        img.extend(bincode::serialize(&hdr).unwrap());
        write_chunk_header(&mut img, CHUNK_RAW, 1, 4096).unwrap();
        img.extend(std::iter::repeat_n(9u8, 4096));
        write_chunk_header(&mut img, CHUNK_CRC32, 0, 4).unwrap();
        img.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());

        let mut out = Vec::new();
        let n = expand(Cursor::new(img), &mut out).unwrap();
        assert_eq!(n, 4096);
    }

    #[test]
    fn split_and_merge_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let block = 4096usize;
        let mut raw = Vec::new();
        for run in 0..6 {
            match run % 3 {
                0 => raw.extend(std::iter::repeat_n(0u8, block)),
                1 => raw.extend((0..block).map(|i| (i % 200) as u8)),
                _ => raw.extend(std::iter::repeat_n(0x5Au8, block * 2)),
            }
        }

        let src_path = dir.path().join("img.simg");
        let mut sparse = std::fs::File::create(&src_path).unwrap();
        compose(Cursor::new(raw.clone()), &mut sparse, block as u32).unwrap();
        drop(sparse);

        // Cap small enough to force several parts
        let parts = split(&src_path, dir.path(), 6000).unwrap();
        assert!(parts.len() > 1);

        let merged_path = dir.path().join("merged.simg");
        merge(&parts, &merged_path).unwrap();

        let mut back = Vec::new();
        expand(std::fs::File::open(&merged_path).unwrap(), &mut back).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn magic_probe() {
        let img = sample_sparse();
        let mut cur = Cursor::new(&img);
        assert!(is_sparse_file(&mut cur).unwrap());
        assert_eq!(cur.stream_position().unwrap(), 0);
        assert!(is_sparse_buf(&img));
        assert!(!is_sparse_buf(b"\x7fELF whatever"));
    }
}
