//! MediaTek BROM protocol and secure loader authentication.

pub mod brom;
pub mod sla;

pub use brom::{BromClient, MtkDeviceInfo, TargetConfig};
pub use sla::{SlaAuthenticator, SlaChallenge};
