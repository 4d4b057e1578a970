// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! OPPO/OnePlus firmware package codecs: OFP (paged, AES-CFB), OZIP
//! (AES-ECB head), OPS (fixed-key ECB), plus the MTK byte shuffle and the
//! obfuscated key schedule shared by all of them.
//!
//! Nothing here needs the whole package in memory: profiles are small and
//! entry payloads stream through a bounded buffer.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use aes::Aes128;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use ecb::cipher::block_padding::NoPadding;
use ecb::cipher::{BlockDecryptMut, KeyInit};
use log::{debug, info};
use md5::{Digest, Md5};
use xmltree::{Element, XMLNode};

use crate::error::{EdlError, Result};
use crate::types::ProgressFn;

type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;
#[cfg(test)]
type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes128EcbDec = ecb::Decryptor<Aes128>;

/// Trailing-page marker of an OFP container.
pub const OFP_MAGIC: u32 = 0x7CEF;

pub const OFP_PAGE_SIZES: [u64; 4] = [512, 4096, 8192, 16384];

/// Per-entry decrypt window unless the section dictates otherwise.
pub const OFP_DEFAULT_DECRYPT_SIZE: u64 = 0x40000;

/// Sections whose payload is encrypted end to end.
const FULLY_ENCRYPTED_SECTIONS: &[&str] = &["sahara", "config", "provision"];

/// Sections copied through without touching a single byte.
const RAW_SECTIONS: &[&str] = &["digeststosign", "chainedtableofdigests", "firmware"];

/// Archive password on password-protected realme packages.
pub const REALME_ZIP_PASSWORD: &[u8] =
    b"flash@realme$50E7F7D847732396F1582CD62DD385ED7ABB0897";

/// OnePlus OPS payload key.
pub const OPS_KEY: [u8; 16] = [
    0xd6, 0xec, 0xce, 0xc8, 0xc8, 0x9a, 0x35, 0xd0, 0x34, 0x9a, 0x3f, 0x5c, 0xe0, 0xe4, 0xd0,
    0x7a,
];

/// MTK OFP header key.
pub const MTK_HEADER_KEY: &[u8] = b"geyixue";

const OZIP_MAGIC: &[u8; 12] = b"OPPOENCRYPT!";

// --- key schedule --------------------------------------------------------

/// Nibble swap.
pub fn rot4(x: u8) -> u8 {
    (x >> 4) | ((x & 0x0F) << 4)
}

/// `rot4(data[i] ^ mask[i])`, mask cycling.
pub fn deobfuscate(data: &[u8], mask: &[u8]) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, &d)| rot4(d ^ mask[i % mask.len()]))
        .collect()
}

/// MTK shuffle, variant 1: `D[i] = K[i % |K|] ^ rot4(D[i])`.
pub fn mtk_shuffle(key: &[u8], data: &mut [u8]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b = key[i % key.len()] ^ rot4(*b);
    }
}

/// MTK shuffle, variant 2: `D[i] = rot4(K[i % |K|] ^ D[i])`.
pub fn mtk_shuffle2(key: &[u8], data: &mut [u8]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b = rot4(key[i % key.len()] ^ *b);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AesPair {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

/// First 16 chars of the lowercase-hex MD5, as ASCII bytes.
fn md5_hex16(data: &[u8]) -> [u8; 16] {
    let hexed = hex::encode(Md5::digest(data));
    hexed.as_bytes()[..16].try_into().unwrap()
}

/// Derive the working AES pair from an obfuscated (mc, userkey, ivec)
/// triple.
pub fn derive_pair(mc: &[u8], userkey: &[u8], ivec: &[u8]) -> AesPair {
    AesPair {
        key: md5_hex16(&deobfuscate(userkey, mc)),
        iv: md5_hex16(&deobfuscate(ivec, mc)),
    }
}

/// A known key template. Simple pairs are 16-char ASCII key/iv used as-is;
/// the obfuscated tuples go through [`derive_pair`].
#[derive(Debug, Clone, Copy)]
pub enum KeyTemplate {
    Simple {
        key: &'static str,
        iv: &'static str,
    },
    Mtk {
        mc: &'static str,
        userkey: &'static str,
        ivec: &'static str,
    },
    Qualcomm {
        version: &'static str,
        mc: &'static str,
        userkey: &'static str,
        ivec: &'static str,
    },
}

impl KeyTemplate {
    pub fn derive(&self) -> AesPair {
        match self {
            KeyTemplate::Simple { key, iv } => AesPair {
                key: key.as_bytes().try_into().expect("16-char key"),
                iv: iv.as_bytes().try_into().expect("16-char iv"),
            },
            KeyTemplate::Mtk { mc, userkey, ivec }
            | KeyTemplate::Qualcomm {
                mc, userkey, ivec, ..
            } => {
                let mc = hex::decode(mc).expect("hex mc");
                let userkey = hex::decode(userkey).expect("hex userkey");
                let ivec = hex::decode(ivec).expect("hex ivec");
                derive_pair(&mc, &userkey, &ivec)
            }
        }
    }

    /// The raw obfuscated parts, for searches that mutate them. `None` for
    /// simple pairs.
    pub fn tuple_bytes(&self) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        match self {
            KeyTemplate::Simple { .. } => None,
            KeyTemplate::Mtk { mc, userkey, ivec }
            | KeyTemplate::Qualcomm {
                mc, userkey, ivec, ..
            } => Some((
                hex::decode(mc).expect("hex mc"),
                hex::decode(userkey).expect("hex userkey"),
                hex::decode(ivec).expect("hex ivec"),
            )),
        }
    }
}

/// Known OFP key material, newest first. Versions track the OPPO flash tool
/// release the tuple first shipped in.
pub static KEY_TEMPLATES: &[KeyTemplate] = &[
    KeyTemplate::Qualcomm {
        version: "V2.0.3",
        mc: "E8AE288C0192C54BF10C5707E9C4705B",
        userkey: "D64FC385DCD52A3C9B5FBA8650F92EDA",
        ivec: "79051FD8D8B6297E2E4559E997F63B7F",
    },
    KeyTemplate::Qualcomm {
        version: "V1.7.2",
        mc: "8FB8FB261930260BE945B841AEFA9FD4",
        userkey: "E529E82B28F5A2F8831D860AE39E425D",
        ivec: "8A09DA60ED36F125D64709973372C1CF",
    },
    KeyTemplate::Qualcomm {
        version: "V1.6.6",
        mc: "3C2D518D9BF2E4279DC758CD535147C3",
        userkey: "87C74A29709AC1BF2382276C4E8DF232",
        ivec: "598D92E967265E9BCABE2469FE4A915E",
    },
    KeyTemplate::Qualcomm {
        version: "V1.5.13",
        mc: "67657963787565E837D226B69A495D21",
        userkey: "F6C50203515A2CE7D8C3E1F938B7E94C",
        ivec: "42F2D5399137E2B2813CD8ECDF2F4D72",
    },
    KeyTemplate::Qualcomm {
        version: "V1.4.17",
        mc: "27827963787265EF89D126B69A495A21",
        userkey: "82C50203285A2CE7D8C3E198383CE94C",
        ivec: "422DD5399181E223813CD8ECDF2E4D72",
    },
    KeyTemplate::Mtk {
        mc: "67657963787565E837D226B69A495D21",
        userkey: "F6C50203515A2CE7D8C3E1F938B7E94C",
        ivec: "42F2D5399137E2B2813CD8ECDF2F4D72",
    },
    KeyTemplate::Mtk {
        mc: "9E4F32639D21357D37D226B69A495D21",
        userkey: "A3D8D358E42F5A9E931DD3917D9A3218",
        ivec: "386935399137416B67416BECF22F519A",
    },
    KeyTemplate::Simple {
        key: "d1dd97b69a495d21",
        iv: "6037e2b2813cd8ec",
    },
    KeyTemplate::Simple {
        key: "acaa1e12a71431ce",
        iv: "4729a3bec3a056ab",
    },
];

/// Keys seen on OZIP packages, hex-encoded AES-128 material.
pub static OZIP_KEYS: &[&str] = &[
    "D6EECF0AE5ACD4E0E9FE522DE7CE381E",
    "D6ECCF0AE5ACD4E0E9FE522DE7CE381E",
    "D6DCCF0AD5ACD4E0292E522DB7C1381E",
    "D7DCCE1AD4AFDCE2393E5161CBDC4321",
    "D7DBCE2AD4ADDCE1393E5521CBDC4321",
    "D4D2CD61D4AFDCE13B5E01221BD14D20",
    "261CC7131D7C1481294E532DB752381E",
    "1CA21E12271335AE33AB81B2A7B14622",
    "D4D2CE11D4AFDCE13B3E0121CBD14D20",
    "1C4C1EA3A12531AE491B21BB31613C11",
];

// --- AES primitives ------------------------------------------------------

/// AES-128-CFB, 128-bit feedback, no padding. Length must be 16-aligned;
/// callers round up and truncate afterwards.
pub fn aes_cfb_decrypt(pair: &AesPair, data: &mut [u8]) {
    Aes128CfbDec::new((&pair.key).into(), (&pair.iv).into()).decrypt(data);
}

#[cfg(test)]
fn aes_cfb_encrypt(pair: &AesPair, data: &mut [u8]) {
    Aes128CfbEnc::new((&pair.key).into(), (&pair.iv).into()).encrypt(data);
}

/// AES-128-ECB over a 16-aligned buffer.
pub fn aes_ecb_decrypt(key: &[u8; 16], data: &mut [u8]) -> Result<()> {
    Aes128EcbDec::new(key.into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|_| EdlError::CorruptMetadata("ECB payload not block-aligned".into()))?;
    Ok(())
}

fn round16(n: u64) -> u64 {
    n.div_ceil(16) * 16
}

// --- format selection ----------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareKind {
    Ofp { page_size: u64 },
    Ozip,
    /// A plain `PK` zip: either password-protected or OZIP-in-zip; the
    /// extractor disambiguates.
    PkZip,
    Ops,
}

/// Identify a firmware package by its leading bytes, falling back to the
/// trailing-page OFP magic probe across the known page sizes.
pub fn identify(path: &Path) -> Result<FirmwareKind> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut head = [0u8; 16];
    let n = file.read(&mut head)?;

    if n >= 12 && &head[..12] == OZIP_MAGIC {
        return Ok(FirmwareKind::Ozip);
    }
    if n >= 4 && &head[..4] == b"PK\x03\x04" {
        return Ok(FirmwareKind::PkZip);
    }
    if n >= 3 && &head[..3] == b"OPS" {
        return Ok(FirmwareKind::Ops);
    }

    if let Some(page_size) = probe_ofp_page_size(&mut file, file_len)? {
        return Ok(FirmwareKind::Ofp { page_size });
    }
    Err(EdlError::BadMagic {
        what: "firmware package",
        value: u32::from_le_bytes(head[..4].try_into().unwrap_or([0; 4])) as u64,
    })
}

fn probe_ofp_page_size(file: &mut File, file_len: u64) -> Result<Option<u64>> {
    for page_size in OFP_PAGE_SIZES {
        if file_len < page_size {
            continue;
        }
        let off = file_len + 16 - page_size;
        file.seek(SeekFrom::Start(off))?;
        let mut magic = [0u8; 4];
        if file.read_exact(&mut magic).is_err() {
            continue;
        }
        if u32::from_le_bytes(magic) == OFP_MAGIC {
            return Ok(Some(page_size));
        }
    }
    Ok(None)
}

/// MTK OFP recognition: the header deciphers to `MMM` under shuffle2 with
/// the fixed header key.
pub fn is_mtk_ofp(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let mut head = [0u8; 16];
    if file.read(&mut head)? < 16 {
        return Ok(false);
    }
    mtk_shuffle2(MTK_HEADER_KEY, &mut head);
    Ok(&head[..3] == b"MMM")
}

// --- OFP profile ---------------------------------------------------------

/// The profile ciphertext lifted out of an OFP file, reusable as the
/// try-key oracle for brute-force searches.
pub struct ProfileProbe {
    cipher: Vec<u8>,
    real_len: usize,
    profile_offset: u64,
    file_len: u64,
}

impl ProfileProbe {
    pub fn read(file: &mut File, file_len: u64, page_size: u64) -> Result<ProfileProbe> {
        if file_len < page_size {
            return Err(EdlError::CorruptMetadata("OFP shorter than one page".into()));
        }
        let trailer = file_len - page_size;
        file.seek(SeekFrom::Start(trailer + 20))?;
        let mut counts = [0u8; 8];
        file.read_exact(&mut counts)?;
        let page_count = u32::from_be_bytes(counts[..4].try_into().unwrap()) as u64;
        let real_len = u32::from_be_bytes(counts[4..].try_into().unwrap()) as u64;

        let profile_offset = page_count * page_size;
        let padded = round16(real_len);
        if real_len == 0 || profile_offset + padded > file_len {
            return Err(EdlError::CorruptMetadata(format!(
                "OFP profile points outside the file ({profile_offset}+{padded} of {file_len})"
            )));
        }

        file.seek(SeekFrom::Start(profile_offset))?;
        let mut cipher = vec![0u8; padded as usize];
        file.read_exact(&mut cipher)?;
        Ok(ProfileProbe {
            cipher,
            real_len: real_len as usize,
            profile_offset,
            file_len,
        })
    }

    /// The try-key oracle: decrypt a copy and accept when it reads like the
    /// profile XML.
    pub fn try_pair(&self, pair: &AesPair) -> Option<String> {
        let mut work = self.cipher.clone();
        aes_cfb_decrypt(pair, &mut work);
        work.truncate(self.real_len);
        let text = String::from_utf8_lossy(&work);
        if text.contains("<?xml") || text.contains("<profile") || text.contains("<ProFile") {
            Some(text.into_owned())
        } else {
            None
        }
    }
}

/// One entry of an OFP package, located and sized in source bytes.
#[derive(Debug, Clone)]
pub struct OfpFileInfo {
    pub filename: String,
    pub section: String,
    /// Byte offset in the package, page-aligned.
    pub offset: u64,
    /// Padded (sector-aligned) byte length.
    pub sector_len: u64,
    /// Actual payload bytes.
    pub real_len: u64,
    /// How much of the head is encrypted; 0 means raw copy-through.
    pub decrypt_size: u64,
    pub sha256: Option<String>,
}

pub struct OfpArchive {
    file: File,
    pub page_size: u64,
    pub pair: AesPair,
    pub profile_xml: String,
    pub entries: Vec<OfpFileInfo>,
}

impl OfpArchive {
    /// Open an OFP package: autodetect the page size, walk the key
    /// templates until one decrypts the profile, parse the entry table.
    pub fn open(path: &Path) -> Result<OfpArchive> {
        let FirmwareKind::Ofp { page_size } = identify(path)? else {
            return Err(EdlError::BadMagic {
                what: "OFP",
                value: 0,
            });
        };
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let probe = ProfileProbe::read(&mut file, file_len, page_size)?;

        let (pair, profile_xml) = KEY_TEMPLATES
            .iter()
            .find_map(|t| {
                let pair = t.derive();
                probe.try_pair(&pair).map(|xml| (pair, xml))
            })
            .ok_or(EdlError::UnknownKey)?;

        Self::from_parts(file, page_size, pair, profile_xml, &probe)
    }

    /// Same as [`open`](Self::open) but with a caller-supplied pair, e.g.
    /// one a brute-force search produced.
    pub fn open_with_pair(path: &Path, pair: AesPair) -> Result<OfpArchive> {
        let FirmwareKind::Ofp { page_size } = identify(path)? else {
            return Err(EdlError::BadMagic {
                what: "OFP",
                value: 0,
            });
        };
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let probe = ProfileProbe::read(&mut file, file_len, page_size)?;
        let profile_xml = probe.try_pair(&pair).ok_or(EdlError::UnknownKey)?;
        Self::from_parts(file, page_size, pair, profile_xml, &probe)
    }

    fn from_parts(
        file: File,
        page_size: u64,
        pair: AesPair,
        profile_xml: String,
        probe: &ProfileProbe,
    ) -> Result<OfpArchive> {
        let trimmed = profile_xml.trim_end();
        if !(trimmed.to_ascii_lowercase().contains("</profile>") || trimmed.ends_with("/>")) {
            return Err(EdlError::CorruptMetadata(
                "decrypted profile has no recognized terminator".into(),
            ));
        }
        debug!(
            "OFP profile at 0x{:x}, {} bytes, page size {}",
            probe.profile_offset, probe.real_len, page_size
        );

        let entries = parse_profile_entries(&profile_xml, page_size, probe.file_len)?;
        info!("OFP: {} entries", entries.len());
        Ok(OfpArchive {
            file,
            page_size,
            pair,
            profile_xml,
            entries,
        })
    }

    /// Decrypt one entry into `out`: CFB-decrypt the head window, stream the
    /// plaintext tail.
    pub fn extract_entry(&mut self, entry: &OfpFileInfo, out: &mut dyn Write) -> Result<()> {
        self.file.seek(SeekFrom::Start(entry.offset))?;

        let enc_plain = std::cmp::min(entry.decrypt_size, entry.real_len);
        let enc_padded = round16(enc_plain);
        if enc_padded > 0 {
            let mut head = vec![0u8; enc_padded as usize];
            self.file.read_exact(&mut head)?;
            aes_cfb_decrypt(&self.pair, &mut head);
            out.write_all(&head[..std::cmp::min(enc_plain, entry.real_len) as usize])?;
        }

        let mut left = entry.real_len.saturating_sub(enc_padded);
        let mut buf = vec![0u8; 1024 * 1024];
        while left > 0 {
            let want = std::cmp::min(left, buf.len() as u64) as usize;
            self.file.read_exact(&mut buf[..want])?;
            out.write_all(&buf[..want])?;
            left -= want as u64;
        }
        Ok(())
    }

    /// Extract every entry plus the decoded `profile.xml` into `out_dir`.
    pub fn extract_all(
        &mut self,
        out_dir: &Path,
        mut progress: Option<ProgressFn<'_>>,
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(out_dir)?;
        let mut written = Vec::new();

        let profile_path = out_dir.join("profile.xml");
        std::fs::write(&profile_path, self.profile_xml.as_bytes())?;
        written.push(profile_path);

        let total: u64 = self.entries.iter().map(|e| e.real_len).sum();
        let mut done = 0u64;
        let entries = self.entries.clone();
        for entry in &entries {
            let name = sanitize_filename(&entry.filename);
            if name.is_empty() {
                continue;
            }
            let dest = out_dir.join(name);
            let mut out = File::create(&dest)?;
            self.extract_entry(entry, &mut out)?;
            written.push(dest);
            done += entry.real_len;
            if let Some(cb) = progress.as_mut() {
                cb(done, total);
            }
        }
        Ok(written)
    }
}

fn sanitize_filename(name: &str) -> String {
    name.rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .to_owned()
}

fn parse_profile_entries(
    profile_xml: &str,
    page_size: u64,
    file_len: u64,
) -> Result<Vec<OfpFileInfo>> {
    let root = Element::parse(profile_xml.trim().as_bytes())
        .map_err(|e| EdlError::XmlParse(e.to_string()))?;
    let mut entries = Vec::new();
    walk_profile(&root, "", page_size, file_len, &mut entries)?;
    Ok(entries)
}

fn walk_profile(
    el: &Element,
    section: &str,
    page_size: u64,
    file_len: u64,
    out: &mut Vec<OfpFileInfo>,
) -> Result<()> {
    for node in &el.children {
        let XMLNode::Element(child) = node else { continue };

        let filename = child
            .attributes
            .get("Path")
            .or_else(|| child.attributes.get("filename"))
            .cloned();
        let Some(filename) = filename else {
            // A grouping element names the section for everything below it
            walk_profile(child, &child.name, page_size, file_len, out)?;
            continue;
        };

        let attr_u64 = |key: &str| -> u64 {
            child
                .attributes
                .get(key)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        let offset = attr_u64("FileOffsetInSrc") * page_size;
        let sector_len = attr_u64("SizeInSectorInSrc") * page_size;
        let real_len = attr_u64("SizeInByteInSrc");
        if real_len == 0 {
            continue;
        }
        if offset + real_len > file_len {
            return Err(EdlError::CorruptMetadata(format!(
                "OFP entry {filename} points outside the file"
            )));
        }

        let lower = section.to_ascii_lowercase();
        let decrypt_size = if RAW_SECTIONS.iter().any(|s| lower.contains(s)) {
            0
        } else if FULLY_ENCRYPTED_SECTIONS.iter().any(|s| lower.contains(s)) {
            real_len
        } else {
            OFP_DEFAULT_DECRYPT_SIZE
        };

        out.push(OfpFileInfo {
            filename,
            section: section.to_owned(),
            offset,
            sector_len,
            real_len,
            decrypt_size,
            sha256: child.attributes.get("sha256").cloned(),
        });
    }
    Ok(())
}

// --- OZIP ----------------------------------------------------------------

/// Decrypt an OZIP package: strip the 16-byte header, ECB-decrypt the first
/// 64 KiB, leave the rest as-is, then unzip the result into `out_dir`.
pub fn decrypt_ozip(path: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut payload = std::fs::read(path)?;
    if payload.len() < 16 + 16 || &payload[..12] != OZIP_MAGIC {
        return Err(EdlError::BadMagic {
            what: "OZIP",
            value: 0,
        });
    }
    payload.drain(..16);

    let window = std::cmp::min(payload.len() & !15, 64 * 1024);
    let original_head = payload[..window].to_vec();

    for key_hex in OZIP_KEYS {
        let key: [u8; 16] = hex::decode(key_hex)
            .ok()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| EdlError::CorruptMetadata("bad OZIP key table entry".into()))?;

        payload[..window].copy_from_slice(&original_head);
        aes_ecb_decrypt(&key, &mut payload[..window])?;
        if payload.starts_with(b"PK\x03\x04") {
            debug!("OZIP key {} fits", &key_hex[..8]);
            return extract_zip(std::io::Cursor::new(payload), out_dir, None);
        }
    }
    Err(EdlError::UnknownKey)
}

/// Handle a `PK`-leading package. Three shapes exist in the wild: a plain
/// zip, a password-protected realme zip, and a zip whose entry payloads are
/// themselves OZIP-encrypted (detected by trial-decrypting the first entry's
/// head and finding `PK` again).
pub fn extract_pk_firmware(path: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
    if let Some(key) = pk_ozip_entry_key(path)? {
        return extract_ozip_in_zip(path, out_dir, &key);
    }
    let file = File::open(path)?;
    match extract_zip(file, out_dir, None) {
        Ok(files) => Ok(files),
        Err(_) => {
            let file = File::open(path)?;
            extract_zip(file, out_dir, Some(REALME_ZIP_PASSWORD))
        }
    }
}

/// Trial-decrypt the first entry's head with the OZIP key table. A hit
/// means every entry payload carries its own encrypted zip.
fn pk_ozip_entry_key(path: &Path) -> Result<Option<[u8; 16]>> {
    let Ok(mut archive) = zip::ZipArchive::new(File::open(path)?) else {
        return Ok(None);
    };
    if archive.len() == 0 {
        return Ok(None);
    }
    let Ok(mut first) = archive.by_index(0) else {
        return Ok(None);
    };
    let mut head = [0u8; 16];
    if first.read_exact(&mut head).is_err() {
        return Ok(None);
    }

    for key_hex in OZIP_KEYS {
        let key: [u8; 16] = hex::decode(key_hex)
            .ok()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| EdlError::CorruptMetadata("bad OZIP key table entry".into()))?;
        let mut work = head;
        if aes_ecb_decrypt(&key, &mut work).is_ok() && work.starts_with(b"PK\x03\x04") {
            return Ok(Some(key));
        }
    }
    Ok(None)
}

fn extract_ozip_in_zip(path: &Path, out_dir: &Path, key: &[u8; 16]) -> Result<Vec<PathBuf>> {
    let mut archive =
        zip::ZipArchive::new(File::open(path)?).map_err(|e| EdlError::CorruptMetadata(e.to_string()))?;
    std::fs::create_dir_all(out_dir)?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| EdlError::CorruptMetadata(e.to_string()))?;
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        if entry.is_dir() {
            continue;
        }
        let mut payload = Vec::new();
        entry.read_to_end(&mut payload)?;
        let window = std::cmp::min(payload.len() & !15, 64 * 1024);
        aes_ecb_decrypt(key, &mut payload[..window])?;

        let dest = out_dir.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, &payload)?;
        written.push(dest);
    }
    Ok(written)
}

fn extract_zip<R: Read + Seek>(
    reader: R,
    out_dir: &Path,
    password: Option<&[u8]>,
) -> Result<Vec<PathBuf>> {
    let mut archive =
        zip::ZipArchive::new(reader).map_err(|e| EdlError::CorruptMetadata(e.to_string()))?;
    std::fs::create_dir_all(out_dir)?;

    let mut written = Vec::new();
    for i in 0..archive.len() {
        let mut entry = match password {
            Some(pw) => archive
                .by_index_decrypt(i, pw)
                .map_err(|e| EdlError::CorruptMetadata(e.to_string()))?,
            None => archive
                .by_index(i)
                .map_err(|e| EdlError::CorruptMetadata(e.to_string()))?,
        };
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let dest = out_dir.join(rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
        written.push(dest);
    }
    Ok(written)
}

// --- OPS -----------------------------------------------------------------

/// Decrypt an OnePlus OPS package: skip the 20-byte header, ECB block by
/// block under the fixed key. A zip comes out on current packages and is
/// extracted; anything else lands as `payload.bin`.
pub fn decrypt_ops(path: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut src = File::open(path)?;
    let len = src.metadata()?.len();
    if len <= 20 {
        return Err(EdlError::CorruptMetadata("OPS too short".into()));
    }
    src.seek(SeekFrom::Start(20))?;

    std::fs::create_dir_all(out_dir)?;
    let payload_path = out_dir.join("payload.bin");
    let mut out = File::create(&payload_path)?;

    let mut buf = vec![0u8; 1024 * 1024];
    let mut left = len - 20;
    while left > 0 {
        let want = std::cmp::min(left, buf.len() as u64) as usize;
        src.read_exact(&mut buf[..want])?;
        let aligned = want & !15;
        aes_ecb_decrypt(&OPS_KEY, &mut buf[..aligned])?;
        // Sub-block tail passes through untouched
        out.write_all(&buf[..want])?;
        left -= want as u64;
    }
    drop(out);

    let mut head = [0u8; 4];
    File::open(&payload_path)?.read_exact(&mut head)?;
    if &head == b"PK\x03\x04" {
        let files = extract_zip(File::open(&payload_path)?, out_dir, None)?;
        std::fs::remove_file(&payload_path)?;
        return Ok(files);
    }
    Ok(vec![payload_path])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rot4_swaps_nibbles() {
        assert_eq!(rot4(0xA5), 0x5A);
        assert_eq!(rot4(0x00), 0x00);
        assert_eq!(rot4(0xF0), 0x0F);
        for x in 0..=255u8 {
            assert_eq!(rot4(rot4(x)), x);
        }
    }

    #[test]
    fn shuffles_are_inverses_of_each_other() {
        // shuffle2(k, shuffle1(k, d)) with matching ops: shuffle1 then undo
        let key = b"geyixue";
        let orig: Vec<u8> = (0u8..64).collect();
        let mut data = orig.clone();
        mtk_shuffle(key, &mut data);
        assert_ne!(data, orig);
        // Invert manually: D = rot4(S ^ K)
        for (i, b) in data.iter_mut().enumerate() {
            *b = rot4(*b ^ key[i % key.len()]);
        }
        assert_eq!(data, orig);
    }

    #[test]
    fn derive_pair_is_md5_hex_of_deobfuscation() {
        let mc = hex::decode("67657963787565E837D226B69A495D21").unwrap();
        let userkey = hex::decode("F6C50203515A2CE7D8C3E1F938B7E94C").unwrap();
        let ivec = hex::decode("42F2D5399137E2B2813CD8ECDF2F4D72").unwrap();
        let pair = derive_pair(&mc, &userkey, &ivec);
        // Key/iv are printable lowercase hex prefixes
        assert!(pair.key.iter().all(|b| b.is_ascii_hexdigit()));
        assert!(pair.iv.iter().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(
            pair,
            derive_pair(&mc, &userkey, &ivec),
            "derivation is deterministic"
        );
    }

    #[test]
    fn cfb_round_trips() {
        let pair = KEY_TEMPLATES[0].derive();
        let plain = b"<?xml version=\"1.0\"?><profile/>\n fill fill fill fill fill fill!!";
        let mut work = plain.to_vec();
        aes_cfb_encrypt(&pair, &mut work);
        assert_ne!(&work[..], &plain[..]);
        aes_cfb_decrypt(&pair, &mut work);
        assert_eq!(&work[..], &plain[..]);
    }

    fn build_test_ofp(dir: &Path, pair: &AesPair, profile: &[u8]) -> PathBuf {
        let page = 4096usize;
        // Pages 0,1: entry data; page 2: profile; page 3: trailer
        let mut blob = vec![0u8; page * 4];
        // Entry payload: 100 bytes of 0x33, encrypted head (full length)
        let mut entry = vec![0x33u8; 112]; // round16(100) = 112
        aes_cfb_encrypt(pair, &mut entry);
        blob[..112].copy_from_slice(&entry);

        let mut cipher = profile.to_vec();
        assert_eq!(cipher.len() % 16, 0);
        aes_cfb_encrypt(pair, &mut cipher);
        blob[2 * page..2 * page + cipher.len()].copy_from_slice(&cipher);

        let trailer = 3 * page;
        blob[trailer + 16..trailer + 20].copy_from_slice(&OFP_MAGIC.to_le_bytes());
        blob[trailer + 20..trailer + 24].copy_from_slice(&2u32.to_be_bytes()); // page count
        blob
            [trailer + 24..trailer + 28]
            .copy_from_slice(&(PROFILE_LEN as u32).to_be_bytes());

        let path = dir.join("firmware.ofp");
        std::fs::write(&path, &blob).unwrap();
        path
    }

    const PROFILE_LEN: usize = 173;

    fn test_profile() -> Vec<u8> {
        let mut xml = String::from(
            "<?xml version=\"1.0\"?>\n<ProFile>\n<Sahara>\n<File Path=\"prog.mbn\" \
             FileOffsetInSrc=\"0\" SizeInByteInSrc=\"100\" SizeInSectorInSrc=\"1\"/>\n\
             </Sahara>\n</ProFile>",
        );
        while xml.len() < PROFILE_LEN {
            xml.push('\n');
        }
        assert_eq!(xml.len(), PROFILE_LEN);
        let mut padded = xml.into_bytes();
        padded.resize(round16(PROFILE_LEN as u64) as usize, 0);
        padded
    }

    #[test]
    fn ofp_profile_decrypts_and_extracts() {
        let dir = tempfile::tempdir().unwrap();
        let pair = KEY_TEMPLATES[3].derive();
        let path = build_test_ofp(dir.path(), &pair, &test_profile());

        assert_eq!(
            identify(&path).unwrap(),
            FirmwareKind::Ofp { page_size: 4096 }
        );

        let mut ar = OfpArchive::open(&path).unwrap();
        assert_eq!(ar.pair, pair);
        assert!(ar.profile_xml.starts_with("<?xml"));
        assert_eq!(ar.entries.len(), 1);

        let e = &ar.entries[0];
        assert_eq!(e.filename, "prog.mbn");
        assert_eq!(e.offset, 0);
        assert_eq!(e.real_len, 100);
        assert_eq!(e.sector_len, 4096);
        // Sahara section decrypts end to end
        assert_eq!(e.decrypt_size, 100);

        let out = dir.path().join("out");
        let files = ar.extract_all(&out, None).unwrap();
        let profile = std::fs::read_to_string(&files[0]).unwrap();
        assert!(profile.starts_with("<?xml"));
        let payload = std::fs::read(out.join("prog.mbn")).unwrap();
        assert_eq!(payload.len(), 100);
        assert!(payload.iter().all(|&b| b == 0x33));
    }

    #[test]
    fn wrong_keys_are_rejected_by_the_probe() {
        let dir = tempfile::tempdir().unwrap();
        let pair = KeyTemplate::Simple {
            key: "0123456789abcdef",
            iv: "fedcba9876543210",
        }
        .derive();
        let path = build_test_ofp(dir.path(), &pair, &test_profile());

        let mut file = File::open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        let probe = ProfileProbe::read(&mut file, len, 4096).unwrap();
        assert!(probe.try_pair(&KEY_TEMPLATES[0].derive()).is_none());
        assert!(probe.try_pair(&pair).is_some());
    }

    #[test]
    fn profile_oob_counts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pair = KEY_TEMPLATES[0].derive();
        let path = build_test_ofp(dir.path(), &pair, &test_profile());

        // Corrupt the page count so the profile points past EOF
        let mut blob = std::fs::read(&path).unwrap();
        let trailer = blob.len() - 4096;
        blob[trailer + 20..trailer + 24].copy_from_slice(&9u32.to_be_bytes());
        std::fs::write(&path, &blob).unwrap();

        let mut file = File::open(&path).unwrap();
        let len = file.metadata().unwrap().len();
        assert!(ProfileProbe::read(&mut file, len, 4096).is_err());
    }

    #[test]
    fn ozip_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        // A tiny stored zip with one file
        let mut zip_bytes = Vec::new();
        {
            let mut w = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            let opts = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Stored);
            w.start_file("boot.img", opts).unwrap();
            w.write_all(b"ANDROID!fakeimage").unwrap();
            w.finish().unwrap();
        }

        // Encrypt the head window with the first table key and wrap it
        let key: [u8; 16] = hex::decode(OZIP_KEYS[0]).unwrap().try_into().unwrap();
        let window = std::cmp::min(zip_bytes.len() & !15, 64 * 1024);
        let mut enc = zip_bytes.clone();
        ecb_encrypt_for_test(&key, &mut enc[..window]);

        let mut ozip = Vec::new();
        ozip.extend_from_slice(OZIP_MAGIC);
        ozip.extend_from_slice(&[0u8; 4]);
        ozip.extend_from_slice(&enc);
        let path = dir.path().join("fw.ozip");
        std::fs::write(&path, &ozip).unwrap();

        assert_eq!(identify(&path).unwrap(), FirmwareKind::Ozip);
        let out = dir.path().join("out");
        let files = decrypt_ozip(&path, &out).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), b"ANDROID!fakeimage");
    }

    fn ecb_encrypt_for_test(key: &[u8; 16], data: &mut [u8]) {
        use aes::cipher::generic_array::GenericArray;
        use aes::cipher::{BlockEncrypt, KeyInit};
        let cipher = Aes128::new(key.into());
        for block in data.chunks_exact_mut(16) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
    }

    #[test]
    fn ops_payload_decrypts() {
        let dir = tempfile::tempdir().unwrap();
        let plain = vec![0x44u8; 64];
        let mut enc = plain.clone();
        ecb_encrypt_for_test(&OPS_KEY, &mut enc);

        let mut ops = Vec::new();
        ops.extend_from_slice(b"OPS\0");
        ops.extend_from_slice(&[0u8; 16]); // rest of the 20-byte header
        ops.extend_from_slice(&enc);
        let path = dir.path().join("fw.ops");
        std::fs::write(&path, &ops).unwrap();

        assert_eq!(identify(&path).unwrap(), FirmwareKind::Ops);
        let out = dir.path().join("out");
        let files = decrypt_ops(&path, &out).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(&files[0]).unwrap(), plain);
    }

    #[test]
    fn mtk_recognition_uses_the_header_key() {
        let dir = tempfile::tempdir().unwrap();
        // Build a header that shuffles *to* MMM: apply the inverse of
        // shuffle2, which is shuffle2's own inverse op rot4(x) ^ k
        let mut head = *b"MMM\0\0\0\0\0\0\0\0\0\0\0\0\0";
        for (i, b) in head.iter_mut().enumerate() {
            *b = rot4(*b) ^ MTK_HEADER_KEY[i % MTK_HEADER_KEY.len()];
        }
        let path = dir.path().join("mtk.ofp");
        std::fs::write(&path, head).unwrap();
        assert!(is_mtk_ofp(&path).unwrap());

        let other = dir.path().join("not.ofp");
        std::fs::write(&other, b"definitely not an ofp").unwrap();
        assert!(!is_mtk_ofp(&other).unwrap());
    }
}
