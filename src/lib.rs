//! # triflash
//!
//! A library for host-side flashing and diagnostics of Qualcomm,
//! MediaTek and Spreadtrum/Unisoc chipsets over a serial or USB-serial
//! link.
//!
//! This crate provides the wire-level protocol engines that drive each
//! vendor's boot and diagnostic conversation:
//!
//! - **Qualcomm Sahara** — EDL-mode identity read and programmer upload
//! - **Qualcomm Diag** — HDLC-framed NV/IMEI/EFS2/QCN operations
//! - **MediaTek BROM** — echo-protocol handshake, DA upload, SLA
//!   challenge/response authentication
//! - **Spreadtrum FDL** — BSL loader download chain and partition
//!   operations
//! - **Spreadtrum Diag** — NV/IMEI/phase-check diagnostics
//!
//! plus the byte-exact building blocks they share: the CRC/checksum
//! kit, the HDLC codec with its Spreadtrum envelope variant, a minimal
//! LZ4 decoder and a read-only EROFS walker.
//!
//! ## Transport model
//!
//! Every engine drives the device through the [`Transport`] trait, a
//! plain byte stream with timed reads. Engines are single-threaded and
//! strictly request/response; an engine instance borrows its transport
//! for its lifetime and never outlives it. The `native` feature
//! (default) provides a [`transport::NativeTransport`] backed by the
//! `serialport` crate.
//!
//! ## Example
//!
//! ```rust,no_run
//! use triflash::qualcomm::sahara::{SaharaClient, SaharaMode};
//! use triflash::transport::NativeTransport;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut port = NativeTransport::open("/dev/ttyUSB0", 115200)?;
//!
//!     let mut sahara = SaharaClient::new(&mut port);
//!     sahara.handshake(SaharaMode::ImageTransferPending)?;
//!     println!("chip: {}", sahara.device_info().chip_name);
//!
//!     let programmer = std::fs::read("prog_firehose.mbn")?;
//!     sahara.upload_loader(&programmer)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `native` (default): serial transport via the `serialport` crate
//! - `serde`: serialization support for the identity records

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod image;
pub mod mediatek;
pub mod qualcomm;
pub mod spreadtrum;
pub mod transport;

pub use error::{Error, Result};
pub use transport::Transport;

#[cfg(feature = "native")]
pub use transport::NativeTransport;

pub use {
    image::erofs::ErofsImage,
    mediatek::{BromClient, MtkDeviceInfo, SlaAuthenticator},
    qualcomm::{DiagClient, SaharaClient, SaharaDeviceInfo, SaharaMode},
    spreadtrum::{FdlClient, FdlStage, SprdDiagClient},
};
