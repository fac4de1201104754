//! Spreadtrum/Unisoc FDL and Diag protocol support.

pub mod chips;
pub mod diag;
pub mod fdl;

pub use chips::SprdChipInfo;
pub use diag::{SprdDiagClient, SprdNvItem, SprdPhaseCheck};
pub use fdl::{FdlClient, FdlStage, PartitionInfo, SprdDeviceInfo};
