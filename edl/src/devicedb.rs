// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Static device knowledge: MSM hardware ids, per-chip storage defaults,
//! Sahara protocol versions, OEM signing roots, and the loader auto-matcher
//! built on top of them. All tables are immutable process-wide.

use std::path::{Path, PathBuf};

use log::debug;

use crate::types::{AuthKind, DeviceIdentifyResult, MemoryName};

/// MSM-ID (upper 32 bits of the Sahara hardware id) to marketing-ish chip
/// name.
pub static MSM_IDS: &[(u32, &str)] = &[
    (0x000460E1, "MSM8909"),
    (0x000560E1, "MSM8916"),
    (0x000660E1, "MSM8939"),
    (0x000760E1, "MSM8936"),
    (0x0009A0E1, "MSM8917"),
    (0x0004F0E1, "MSM8926"),
    (0x0006B0E1, "MSM8929"),
    (0x000900E1, "MSM8937"),
    (0x000940E1, "MSM8940"),
    (0x000860E1, "MSM8952"),
    (0x000910E1, "MSM8953"),
    (0x0004B0E1, "MSM8956"),
    (0x000400E1, "MSM8976"),
    (0x0005E0E1, "MSM8992"),
    (0x0005F0E1, "MSM8994"),
    (0x009470E1, "MSM8996"),
    (0x0005C0E1, "MSM8998"),
    (0x0008C0E1, "SDM429"),
    (0x0008D0E1, "SDM439"),
    (0x0009B0E1, "SDM450"),
    (0x000CC0E1, "SDM632"),
    (0x000910E2, "SDM625"),
    (0x000920E1, "SDM626"),
    (0x000AC0E1, "SDM630"),
    (0x000BA0E1, "SDM636"),
    (0x0008B0E1, "SDM660"),
    (0x000A60E1, "SDM670"),
    (0x000930E1, "SDM710"),
    (0x000950E1, "SDM712"),
    (0x0008F0E1, "SDM845"),
    (0x000A50E1, "SM8150"),
    (0x000B80E1, "SM8250"),
    (0x001350E1, "SM8350"),
    (0x001870E1, "SM8450"),
    (0x001B80E1, "SM8475"),
    (0x001C90E1, "SM8550"),
    (0x002160E1, "SM8650"),
    (0x000E60E1, "SM6115"),
    (0x000F50E1, "SM6125"),
    (0x000E70E1, "SM6150"),
    (0x001250E1, "SM6225"),
    (0x001590E1, "SM6350"),
    (0x001690E1, "SM6375"),
    (0x000DB0E1, "SM7125"),
    (0x000EB0E1, "SM7150"),
    (0x001050E1, "SM7225"),
    (0x000CF0E1, "SM7250"),
    (0x001360E1, "SM7325"),
    (0x001920E1, "SM7450"),
    (0x001080E1, "SM4250"),
    (0x001450E1, "SM4350"),
    (0x001A40E1, "SM4375"),
    (0x000E80E1, "QCM2150"),
    (0x001440E1, "QCM2290"),
    (0x0004A0E1, "MDM9607"),
    (0x000480E1, "MDM9640"),
    (0x0006A0E1, "MDM9650"),
    (0x000BF0E1, "SDX55"),
    (0x001770E1, "SDX65"),
    (0x000AF0E1, "QCS605"),
    (0x001190E1, "QCS410"),
    (0x0007B0E1, "APQ8053"),
    (0x000550E1, "APQ8016"),
    (0x0009F0E1, "APQ8096"),
];

/// Chips that default to eMMC; NAND is modem-only territory, everything
/// else is UFS.
static EMMC_CHIPS: &[&str] = &[
    "MSM8909", "MSM8916", "MSM8917", "MSM8926", "MSM8929", "MSM8936", "MSM8937", "MSM8939",
    "MSM8940", "MSM8952", "MSM8953", "MSM8956", "MSM8976", "APQ8016", "APQ8053", "SDM429",
    "SDM439", "SDM450", "SDM625", "SDM626", "SDM632", "QCM2150", "SM4250", "SM6115",
];

static NAND_CHIPS: &[&str] = &["MDM9607", "MDM9640", "MDM9650", "SDX55", "SDX65"];

/// Chips whose PBL speaks Sahara V3 (signed-only command mode).
static SAHARA_V3_CHIPS: &[&str] = &["SM8350", "SM8450", "SM8475", "SM8550", "SM8650", "SM7450"];

/// Flagship-tier parts are always UFS; a configure fallback must not demote
/// them to eMMC.
static FLAGSHIP_CHIPS: &[&str] = &[
    "MSM8996", "MSM8998", "SDM845", "SM8150", "SM8250", "SM8350", "SM8450", "SM8475", "SM8550",
    "SM8650",
];

pub struct VendorInfo {
    /// Lowercase hex prefix of the OEM PK hash.
    pub pk_prefix: &'static str,
    pub vendor: &'static str,
    pub model_hint: &'static str,
    pub loader_hint: &'static str,
    pub auth: AuthKind,
}

/// OEM signing roots seen in the field, keyed by PK-hash prefix.
pub static PK_HASH_VENDORS: &[VendorInfo] = &[
    VendorInfo {
        pk_prefix: "d40eee56f3194665",
        vendor: "oppo",
        model_hint: "CPH",
        loader_hint: "oppo",
        auth: AuthKind::OppoVip,
    },
    VendorInfo {
        pk_prefix: "fa3fdf3c23975319",
        vendor: "realme",
        model_hint: "RMX",
        loader_hint: "oppo",
        auth: AuthKind::OppoVip,
    },
    VendorInfo {
        pk_prefix: "57158eaf2814e539",
        vendor: "oneplus",
        model_hint: "GM",
        loader_hint: "op",
        auth: AuthKind::OppoVip,
    },
    VendorInfo {
        pk_prefix: "cc3153a80293939b",
        vendor: "xiaomi",
        model_hint: "M",
        loader_hint: "xiaomi",
        auth: AuthKind::Xiaomi,
    },
    VendorInfo {
        pk_prefix: "7be49b72f9e43379",
        vendor: "xiaomi",
        model_hint: "M",
        loader_hint: "mi",
        auth: AuthKind::Xiaomi,
    },
    VendorInfo {
        pk_prefix: "1bebe3863a6781db",
        vendor: "nothing",
        model_hint: "A0",
        loader_hint: "nothing",
        auth: AuthKind::Nothing,
    },
    VendorInfo {
        pk_prefix: "afca69d4235117e5",
        vendor: "vivo",
        model_hint: "V",
        loader_hint: "vivo",
        auth: AuthKind::Standard,
    },
    VendorInfo {
        pk_prefix: "16b102ba52b54b27",
        vendor: "motorola",
        model_hint: "XT",
        loader_hint: "moto",
        auth: AuthKind::Standard,
    },
];

pub fn chip_name(msm_id: u32) -> Option<&'static str> {
    MSM_IDS.iter().find(|(id, _)| *id == msm_id).map(|(_, n)| *n)
}

pub fn chip_storage(chip: &str) -> MemoryName {
    if EMMC_CHIPS.contains(&chip) {
        MemoryName::Emmc
    } else if NAND_CHIPS.contains(&chip) {
        MemoryName::Nand
    } else {
        MemoryName::Ufs
    }
}

pub fn chip_sahara_version(chip: &str) -> u32 {
    if SAHARA_V3_CHIPS.contains(&chip) { 3 } else { 2 }
}

pub fn is_flagship(chip: &str) -> bool {
    FLAGSHIP_CHIPS.contains(&chip)
}

pub fn vendor_for_pk_hash(pk_hash: &str) -> Option<&'static VendorInfo> {
    let hash = pk_hash.to_ascii_lowercase();
    PK_HASH_VENDORS.iter().find(|v| hash.starts_with(v.pk_prefix))
}

/// Everything the tables can say about a device identified by Sahara.
pub fn identify(msm_id: u32, pk_hash: &str) -> DeviceIdentifyResult {
    let chip = chip_name(msm_id).unwrap_or("unknown").to_owned();
    let vendor = vendor_for_pk_hash(pk_hash);
    let strategy = vendor.map_or(AuthKind::Standard, |v| v.auth);
    DeviceIdentifyResult {
        storage: chip_storage(&chip),
        sahara_version: chip_sahara_version(&chip),
        requires_auth: strategy != AuthKind::Standard,
        strategy,
        vendor: vendor.map_or(String::new(), |v| v.vendor.to_owned()),
        model: vendor.map_or(String::new(), |v| v.model_hint.to_owned()),
        loader_hint: vendor.map_or(String::new(), |v| v.loader_hint.to_owned()),
        chip,
    }
}

/// Search `dir` for the best Firehose programmer for this device, walking a
/// priority list of filename patterns. Within a priority level the newest
/// file wins.
pub fn find_matching_loader(dir: &Path, msm_id: u32, pk_hash: &str) -> Option<PathBuf> {
    let chip = chip_name(msm_id).map(str::to_ascii_lowercase);
    let vendor = vendor_for_pk_hash(pk_hash);
    let vendor_name = vendor.map(|v| v.vendor.to_ascii_lowercase());
    let loader_hint = vendor.map(|v| v.loader_hint.to_ascii_lowercase());

    let candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();

    let name_of = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default()
    };

    let levels: Vec<Box<dyn Fn(&str) -> bool + '_>> = vec![
        // vendor + chip + hint beats everything
        Box::new(|n: &str| {
            let (Some(v), Some(c), Some(h)) = (&vendor_name, &chip, &loader_hint) else {
                return false;
            };
            n.contains(v.as_str()) && n.contains(c.as_str()) && n.contains(h.as_str())
        }),
        Box::new(|n: &str| {
            let (Some(c), Some(h)) = (&chip, &loader_hint) else {
                return false;
            };
            n.contains(c.as_str()) && n.contains(h.as_str())
        }),
        Box::new(|n: &str| vendor_name.as_ref().is_some_and(|v| n.contains(v.as_str()))),
        Box::new(|n: &str| n.contains("prog_firehose_ddr")),
        Box::new(|n: &str| n.contains("xbl_s_devprg_ns")),
        Box::new(|n: &str| n.ends_with(".mbn")),
        Box::new(|n: &str| n.ends_with(".elf")),
    ];

    for level in &levels {
        let mut matched: Vec<&PathBuf> = candidates.iter().filter(|p| level(&name_of(p))).collect();
        if matched.is_empty() {
            continue;
        }
        matched.sort_by_key(|p| {
            p.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });
        let best = matched.last().unwrap().to_path_buf();
        debug!("loader match: {}", best.display());
        return Some(best);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chip_lookup_round_trips() {
        assert_eq!(chip_name(0x0008F0E1), Some("SDM845"));
        assert_eq!(chip_name(0xFFFFFFFF), None);
        assert!(MSM_IDS.len() >= 60);
    }

    #[test]
    fn storage_defaults_follow_the_tier() {
        assert_eq!(chip_storage("SDM845"), MemoryName::Ufs);
        assert_eq!(chip_storage("MSM8916"), MemoryName::Emmc);
        assert_eq!(chip_storage("MDM9607"), MemoryName::Nand);
        assert_eq!(chip_storage("totally-new-chip"), MemoryName::Ufs);
    }

    #[test]
    fn sahara_versions_split_at_sm8350() {
        assert_eq!(chip_sahara_version("SM8250"), 2);
        assert_eq!(chip_sahara_version("SM8350"), 3);
    }

    #[test]
    fn vendor_matching_is_prefix_based() {
        let v = vendor_for_pk_hash("CC3153A80293939B0000111122223333").unwrap();
        assert_eq!(v.vendor, "xiaomi");
        assert_eq!(v.auth, AuthKind::Xiaomi);
        assert!(vendor_for_pk_hash("0000000000000000").is_none());
    }

    #[test]
    fn identify_combines_the_tables() {
        let id = identify(0x0008F0E1, "d40eee56f3194665aa");
        assert_eq!(id.chip, "SDM845");
        assert_eq!(id.vendor, "oppo");
        assert_eq!(id.strategy, AuthKind::OppoVip);
        assert!(id.requires_auth);
        assert_eq!(id.storage, MemoryName::Ufs);
    }

    #[test]
    fn loader_matcher_prefers_specific_over_generic() {
        let dir = tempfile::tempdir().unwrap();
        let touch = |name: &str| std::fs::write(dir.path().join(name), b"mbn").unwrap();
        touch("prog_firehose_ddr.elf");
        touch("xiaomi_sdm845_fastdl.mbn");
        touch("random.bin");

        let best = find_matching_loader(dir.path(), 0x0008F0E1, "cc3153a80293939b00").unwrap();
        assert_eq!(
            best.file_name().unwrap().to_string_lossy(),
            "xiaomi_sdm845_fastdl.mbn"
        );

        // No chip knowledge: falls through to the generic programmer name
        let generic = find_matching_loader(dir.path(), 0x11111111, "00").unwrap();
        assert_eq!(
            generic.file_name().unwrap().to_string_lossy(),
            "prog_firehose_ddr.elf"
        );

        assert!(find_matching_loader(dir.path(), 0, "").is_some());
    }

    #[test]
    fn vendor_match_outranks_a_bare_chip_match() {
        let dir = tempfile::tempdir().unwrap();
        let touch = |name: &str| std::fs::write(dir.path().join(name), b"mbn").unwrap();
        // Chip name only, no vendor and no hint
        touch("sdm845_fastdl.mbn");
        // Vendor name only
        touch("xiaomi_prog.elf");

        // A chip-only filename matches no tier above the generic ones, so
        // the vendor tier decides
        let best = find_matching_loader(dir.path(), 0x0008F0E1, "cc3153a80293939b00").unwrap();
        assert_eq!(
            best.file_name().unwrap().to_string_lossy(),
            "xiaomi_prog.elf"
        );
    }

    #[test]
    fn flagships_never_report_emmc() {
        for chip in FLAGSHIP_CHIPS {
            assert_eq!(chip_storage(chip), MemoryName::Ufs);
            assert!(is_flagship(chip));
        }
    }
}
