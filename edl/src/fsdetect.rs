// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Filesystem and image-format identification by magic, plus the build.prop
//! content scanner used to fingerprint firmware dumps without a full inode
//! walk.

use std::io::Read;

use crate::sparse::SPARSE_MAGIC;
use crate::types::{FsKind, ImageFormat};

const EROFS_MAGIC: u32 = 0xE0F5E1E2;
const F2FS_MAGIC: u32 = 0xF2F52010;
const EXT4_MAGIC: u16 = 0xEF53;
const SQUASHFS_MAGIC: u32 = 0x73717368;

/// How far the prop scanner will look into an image.
pub const PROP_SCAN_LIMIT: usize = 16 * 1024 * 1024;

/// The anchors worth scanning for. Finding any of them marks the
/// surrounding run of text as a property block.
const PROP_MARKERS: &[&str] = &[
    "ro.build.fingerprint=",
    "ro.product.model=",
    "ro.product.device=",
    "ro.build.display.id=",
    "ro.build.version.release=",
];

fn le32_at(buf: &[u8], off: usize) -> Option<u32> {
    buf.get(off..off + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn le16_at(buf: &[u8], off: usize) -> Option<u16> {
    buf.get(off..off + 2)
        .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
}

/// Identify a filesystem from the first couple KiB of a partition or image.
/// 1084 bytes are enough for every probe here.
pub fn detect_fs(buf: &[u8]) -> FsKind {
    if le32_at(buf, 1024) == Some(EROFS_MAGIC) {
        return FsKind::Erofs;
    }
    if le32_at(buf, 1024) == Some(F2FS_MAGIC) {
        return FsKind::F2fs;
    }
    if le16_at(buf, 1024 + 0x38) == Some(EXT4_MAGIC) {
        return FsKind::Ext4;
    }
    if buf.get(82..87) == Some(b"FAT32".as_slice()) {
        return FsKind::Fat32;
    }
    if buf.get(3..7) == Some(b"NTFS".as_slice()) {
        return FsKind::Ntfs;
    }
    if le32_at(buf, 0) == Some(SQUASHFS_MAGIC) {
        return FsKind::SquashFs;
    }
    if buf.iter().take(4096).all(|&b| b == 0) {
        return FsKind::None;
    }
    FsKind::Unknown
}

pub fn detect_image_format(buf: &[u8]) -> ImageFormat {
    match le32_at(buf, 0) {
        Some(SPARSE_MAGIC) => ImageFormat::Sparse,
        Some(_) => ImageFormat::Raw,
        None => ImageFormat::Unknown,
    }
}

/// Linear content search for build.prop data inside a filesystem image.
///
/// Reads up to [`PROP_SCAN_LIMIT`] bytes, looks for the known `ro.*` markers,
/// then spans each hit backward to the preceding newline and forward until a
/// NUL run ends the text, and parses `key=value` lines out of the span.
/// First value wins on duplicate keys.
pub fn scan_build_props<R: Read>(src: &mut R) -> std::io::Result<Vec<(String, String)>> {
    let mut buf = Vec::with_capacity(1024 * 1024);
    src.take(PROP_SCAN_LIMIT as u64).read_to_end(&mut buf)?;
    Ok(scan_build_props_buf(&buf))
}

pub fn scan_build_props_buf(buf: &[u8]) -> Vec<(String, String)> {
    let mut props: Vec<(String, String)> = Vec::new();
    let mut spans: Vec<(usize, usize)> = Vec::new();

    for marker in PROP_MARKERS {
        let mut from = 0;
        while let Some(rel) = find_subslice(&buf[from..], marker.as_bytes()) {
            let hit = from + rel;
            let span = span_around(buf, hit);
            if !spans.contains(&span) {
                spans.push(span);
            }
            from = hit + marker.len();
        }
    }

    for (start, end) in spans {
        for line in buf[start..end].split(|&b| b == b'\n' || b == b'\0') {
            let Ok(text) = std::str::from_utf8(line) else {
                continue;
            };
            let text = text.trim();
            let Some((key, value)) = text.split_once('=') else {
                continue;
            };
            if !key.starts_with("ro.") || key.contains(char::is_whitespace) {
                continue;
            }
            if !props.iter().any(|(k, _)| k == key) {
                props.push((key.to_owned(), value.to_owned()));
            }
        }
    }
    props
}

/// Back to the previous newline/NUL, forward until a run of NULs ends the
/// readable text.
fn span_around(buf: &[u8], hit: usize) -> (usize, usize) {
    let start = buf[..hit]
        .iter()
        .rposition(|&b| b == b'\n' || b == b'\0')
        .map_or(0, |p| p + 1);

    let mut end = hit;
    let mut nul_run = 0;
    while end < buf.len() {
        if buf[end] == 0 {
            nul_run += 1;
            if nul_run >= 4 {
                end -= nul_run - 1;
                break;
            }
        } else {
            nul_run = 0;
        }
        end += 1;
    }
    (start, end)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_magic(off: usize, magic: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        buf[1] = 1; // keep it from classifying as all-zero
        buf[off..off + magic.len()].copy_from_slice(magic);
        buf
    }

    #[test]
    fn detects_the_usual_suspects() {
        assert_eq!(
            detect_fs(&image_with_magic(1024, &EROFS_MAGIC.to_le_bytes())),
            FsKind::Erofs
        );
        assert_eq!(
            detect_fs(&image_with_magic(1024, &F2FS_MAGIC.to_le_bytes())),
            FsKind::F2fs
        );
        assert_eq!(
            detect_fs(&image_with_magic(1024 + 0x38, &EXT4_MAGIC.to_le_bytes())),
            FsKind::Ext4
        );
        assert_eq!(
            detect_fs(&image_with_magic(0, &SQUASHFS_MAGIC.to_le_bytes())),
            FsKind::SquashFs
        );
        assert_eq!(detect_fs(&image_with_magic(82, b"FAT32")), FsKind::Fat32);
        assert_eq!(detect_fs(&image_with_magic(3, b"NTFS")), FsKind::Ntfs);
        assert_eq!(detect_fs(&vec![0u8; 8192]), FsKind::None);
        assert_eq!(detect_fs(b"garbage"), FsKind::Unknown);
    }

    #[test]
    fn sparse_magic_wins_for_image_format() {
        assert_eq!(
            detect_image_format(&SPARSE_MAGIC.to_le_bytes()),
            ImageFormat::Sparse
        );
        assert_eq!(detect_image_format(&[0x7F, b'E', b'L', b'F']), ImageFormat::Raw);
        assert_eq!(detect_image_format(&[1, 2]), ImageFormat::Unknown);
    }

    #[test]
    fn prop_scan_finds_embedded_blocks() {
        let mut img = vec![0u8; 32768];
        let block =
            b"ro.product.model=Starlight 5G\nro.build.fingerprint=vendor/dev:14/UP1A/1:user\nro.build.version.release=14\n";
        img[9000..9000 + block.len()].copy_from_slice(block);

        let props = scan_build_props_buf(&img);
        let get = |k: &str| {
            props
                .iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("ro.product.model"), Some("Starlight 5G"));
        assert_eq!(get("ro.build.version.release"), Some("14"));
        assert_eq!(
            get("ro.build.fingerprint"),
            Some("vendor/dev:14/UP1A/1:user")
        );
    }

    #[test]
    fn duplicate_keys_keep_the_first_value() {
        let text = b"ro.product.model=A\n\0\0\0\0ro.product.model=B\n\0\0\0\0";
        let mut img = vec![0u8; 4096];
        img[100..100 + text.len()].copy_from_slice(text);
        let props = scan_build_props_buf(&img);
        assert_eq!(props.iter().filter(|(k, _)| k == "ro.product.model").count(), 1);
        assert_eq!(props[0].1, "A");
    }
}
