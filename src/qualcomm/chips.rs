//! Qualcomm MSM chip identification database.
//!
//! Maps the MSM hardware ID reported over Sahara to a marketing name.
//! Pure data; the table is immutable and consulted by the Sahara engine
//! after an identity read.

/// Identification record for one Qualcomm chipset.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QualcommChipInfo {
    /// MSM hardware ID as read from the device.
    pub msm_id: u32,
    /// Part name, e.g. `SM8150`.
    pub name: String,
    /// Platform code name, e.g. `msmnile`.
    pub code_name: String,
    /// Marketing series, e.g. `Snapdragon 855`.
    pub series: String,
    /// JTAG ID where known, 0 otherwise.
    pub jtag_id: u32,
}

/// `(msm_id, name, code_name, series, jtag_id)`
type ChipRow = (u32, &'static str, &'static str, &'static str, u32);

static CHIPS: &[ChipRow] = &[
    // Snapdragon 8xx series
    (0x009440E1, "SDM845", "sdm845", "Snapdragon 845", 0x000CC0E1),
    (0x009270E1, "SDM835", "msm8998", "Snapdragon 835", 0x000BA0E1),
    (0x007050E1, "MSM8996", "msm8996", "Snapdragon 820", 0x000940E1),
    (0x009900E1, "SM8150", "msmnile", "Snapdragon 855", 0x000E60E1),
    (0x009B00E1, "SM8250", "kona", "Snapdragon 865", 0x000F10E1),
    (0x00B600E1, "SM8350", "lahaina", "Snapdragon 888", 0x001220E1),
    (0x00BD0001, "SM8450", "waipio", "Snapdragon 8 Gen 1", 0),
    (0x00C80001, "SM8550", "kalama", "Snapdragon 8 Gen 2", 0),
    (0x00D50001, "SM8650", "pineapple", "Snapdragon 8 Gen 3", 0),
    // Snapdragon 7xx series
    (0x009D00E1, "SM7150", "sdmmagpie", "Snapdragon 730/G", 0),
    (0x009E00E1, "SM7250", "lito", "Snapdragon 765/G", 0),
    (0x00B300E1, "SM7325", "yupik", "Snapdragon 778G", 0),
    (0x00BB0001, "SM7350", "kodiak", "Snapdragon 7 Gen 1", 0),
    (0x00C50001, "SM7450", "palima", "Snapdragon 7+ Gen 2", 0),
    // Snapdragon 6xx series
    (0x009500E1, "SDM660", "sdm660", "Snapdragon 660", 0),
    (0x009A00E1, "SM6150", "talos", "Snapdragon 675", 0),
    (0x00AC00E1, "SM6250", "atoll", "Snapdragon 690", 0),
    (0x00B000E1, "SM6350", "lagoon", "Snapdragon 690", 0),
    (0x00B500E1, "SM6375", "blair", "Snapdragon 695", 0),
    (0x00C20001, "SM6450", "parrot", "Snapdragon 6 Gen 1", 0),
    // Snapdragon 4xx series
    (0x009600E1, "SDM450", "sdm450", "Snapdragon 450", 0),
    (0x009000E1, "MSM8953", "msm8953", "Snapdragon 625", 0),
    (0x009100E1, "MSM8937", "msm8937", "Snapdragon 430", 0),
    (0x009200E1, "MSM8917", "msm8917", "Snapdragon 425", 0),
    (0x00B100E1, "SM4350", "holi", "Snapdragon 480", 0),
    // Snapdragon 2xx series
    (0x008C00E1, "MSM8909", "msm8909", "Snapdragon 210", 0),
    (0x009300E1, "QM215", "qm215", "Snapdragon 215", 0),
    // Modem / IoT platforms
    (0x000860E1, "MDM9607", "mdm9607", "MDM9607 (IoT)", 0),
    (0x000790E1, "MDM9650", "mdm9650", "MDM9650 (Modem)", 0),
];

fn row_to_info(row: &ChipRow) -> QualcommChipInfo {
    QualcommChipInfo {
        msm_id: row.0,
        name: row.1.to_string(),
        code_name: row.2.to_string(),
        series: row.3.to_string(),
        jtag_id: row.4,
    }
}

/// Look up a chip by MSM ID.
///
/// Falls back to matching the upper 16 bits when the exact key misses
/// (some devices report variant low bits); unknown IDs return a record
/// carrying the queried key and a formatted `Unknown` name.
pub fn lookup(msm_id: u32) -> QualcommChipInfo {
    if let Some(row) = CHIPS.iter().find(|row| row.0 == msm_id) {
        return row_to_info(row);
    }

    let upper = msm_id & 0xFFFF0000;
    if let Some(row) = CHIPS.iter().find(|row| row.0 & 0xFFFF0000 == upper) {
        return row_to_info(row);
    }

    QualcommChipInfo {
        msm_id,
        name: format!("Unknown (0x{msm_id:08x})"),
        code_name: String::new(),
        series: String::new(),
        jtag_id: 0,
    }
}

/// Look up a chip by part or code name, case-insensitive.
pub fn lookup_by_name(name: &str) -> Option<QualcommChipInfo> {
    CHIPS
        .iter()
        .find(|row| row.1.eq_ignore_ascii_case(name) || row.2.eq_ignore_ascii_case(name))
        .map(row_to_info)
}

/// True when the exact MSM ID is in the table.
pub fn is_known(msm_id: u32) -> bool {
    CHIPS.iter().any(|row| row.0 == msm_id)
}

/// Part name for an MSM ID.
pub fn chip_name(msm_id: u32) -> String {
    lookup(msm_id).name
}
