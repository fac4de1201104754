//! Spreadtrum/Unisoc chip database: FDL load addresses per chip ID.
//!
//! Consulted when selecting where FDL1/FDL2 must land in SRAM/DRAM for a
//! given chip. Pure data.

/// Default FDL1 load address used for chips not in the table.
pub const DEFAULT_FDL1_ADDR: u32 = 0x0000_5000;

/// Default FDL2 load address used for chips not in the table.
pub const DEFAULT_FDL2_ADDR: u32 = 0x8000_8000;

/// Identification and loader-placement record for one Spreadtrum chip.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SprdChipInfo {
    /// Chip ID as reported by the BootROM/FDL.
    pub chip_id: u16,
    /// Part name, e.g. `SC9863A`.
    pub name: String,
    /// Marketing name, e.g. `T610`.
    pub marketing_name: String,
    /// CPU architecture description.
    pub architecture: String,
    /// Load address for the stage-1 loader.
    pub fdl1_load_addr: u32,
    /// Load address for the stage-2 loader.
    pub fdl2_load_addr: u32,
    /// On-chip SRAM size in bytes.
    pub sram_size: u32,
    /// Whether a known BootROM exploit applies to this chip.
    pub supports_exploit: bool,
}

/// `(chip_id, name, marketing, arch, fdl1, fdl2, sram, exploit)`
type ChipRow = (
    u16,
    &'static str,
    &'static str,
    &'static str,
    u32,
    u32,
    u32,
    bool,
);

static CHIPS: &[ChipRow] = &[
    (0x7715, "SC7715", "SC7715", "Cortex-A7", 0x00003000, 0x80008000, 0x10000, false),
    (0x7727, "SC7727", "SC7727", "Cortex-A7", 0x00003000, 0x80008000, 0x10000, false),
    (0x7730, "SC7730", "SC7730", "Cortex-A7", 0x00003000, 0x80008000, 0x10000, false),
    (0x7731, "SC7731E", "SC7731E", "Cortex-A7", 0x00003000, 0x80008000, 0x10000, true),
    (0x9830, "SC9830", "SC9830", "Cortex-A7", 0x50003000, 0x80008000, 0x20000, false),
    (0x9832, "SC9832E", "SC9832E", "Cortex-A53", 0x50003000, 0x80008000, 0x20000, true),
    (0x9850, "SC9850", "SC9850", "Cortex-A53", 0x50003000, 0x80008000, 0x40000, true),
    (0x9853, "SC9853I", "SC9853I", "Intel x86", 0x50003000, 0x80008000, 0x40000, false),
    (0x9860, "SC9860", "SC9860", "Cortex-A53", 0x50003000, 0x80008000, 0x40000, false),
    (0x9863, "SC9863A", "SC9863A", "Cortex-A55", 0x00005000, 0x80008000, 0x40000, true),
    // Unisoc Tiger series
    (0x2721, "UMS512", "T610", "Cortex-A75+A55", 0x00005000, 0x80008000, 0x40000, false),
    (0x2722, "UMS9230", "T606", "Cortex-A75+A55", 0x00005000, 0x80008000, 0x40000, false),
    (0x2723, "UMS9620", "T618", "Cortex-A75+A55", 0x00005000, 0x80008000, 0x40000, false),
    (0x2730, "UMS9120", "T700", "Cortex-A76+A55", 0x00005000, 0x80008000, 0x40000, false),
    (0x2731, "UMS9230", "T760", "Cortex-A76+A55", 0x00005000, 0x80008000, 0x40000, false),
    (0x2740, "UMS9520", "T820", "Cortex-A78+A55", 0x00005000, 0x80008000, 0x40000, false),
];

fn row_to_info(row: &ChipRow) -> SprdChipInfo {
    SprdChipInfo {
        chip_id: row.0,
        name: row.1.to_string(),
        marketing_name: row.2.to_string(),
        architecture: row.3.to_string(),
        fdl1_load_addr: row.4,
        fdl2_load_addr: row.5,
        sram_size: row.6,
        supports_exploit: row.7,
    }
}

/// Look up a chip by its 16-bit chip ID.
///
/// Unknown IDs return a record carrying the queried key, a formatted
/// `Unknown` name and the default FDL load addresses.
pub fn lookup(chip_id: u16) -> SprdChipInfo {
    match CHIPS.iter().find(|row| row.0 == chip_id) {
        Some(row) => row_to_info(row),
        None => SprdChipInfo {
            chip_id,
            name: format!("Unknown (0x{chip_id:04x})"),
            marketing_name: String::new(),
            architecture: String::new(),
            fdl1_load_addr: DEFAULT_FDL1_ADDR,
            fdl2_load_addr: DEFAULT_FDL2_ADDR,
            sram_size: 0,
            supports_exploit: false,
        },
    }
}

/// True when the chip ID is in the table.
pub fn is_known(chip_id: u16) -> bool {
    CHIPS.iter().any(|row| row.0 == chip_id)
}

/// Part name for a chip ID.
pub fn chip_name(chip_id: u16) -> String {
    lookup(chip_id).name
}

/// Chips with a usable BootROM exploit.
pub fn chips_with_exploit() -> Vec<SprdChipInfo> {
    CHIPS.iter().filter(|row| row.7).map(row_to_info).collect()
}
