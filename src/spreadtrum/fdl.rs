//! Spreadtrum FDL (BSL) download controller.
//!
//! The BootROM and both loader stages speak the BSL command set over
//! the Spreadtrum HDLC envelope. A session walks the stages
//! `None → Fdl1 → Fdl2`: the stage advances after a successful
//! `EXEC_DATA` at that stage's load address, and after FDL2 starts the
//! controller re-handshakes before declaring the device ready.
//!
//! Entry is the autobaud handshake: the host sends a bare `0x7E` until
//! the peer answers with a `REP_VER` frame carrying its version string.
//! Transcoding (HDLC escaping) starts on and is switched off exactly
//! once, before bulk binary transfer.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

use crate::codec::hdlc::{sprd_decode, sprd_encode, SprdFrame};
use crate::error::{Error, Result};
use crate::spreadtrum::chips::{self, SprdChipInfo};
use crate::spreadtrum::diag;
use crate::transport::Transport;

/// BSL command and reply codes.
pub mod cmd {
    /// Autobaud probe byte, sent raw outside any frame.
    pub const CHECK_BAUD: u8 = 0x7E;

    /// Connect after the version handshake.
    pub const CONNECT: u16 = 0x00;
    /// Open a download (address/partition + total length).
    pub const START_DATA: u16 = 0x01;
    /// One chunk of download payload.
    pub const MIDST_DATA: u16 = 0x02;
    /// Close the download.
    pub const END_DATA: u16 = 0x03;
    /// Execute downloaded data.
    pub const EXEC_DATA: u16 = 0x04;
    /// Normal reset.
    pub const NORMAL_RESET: u16 = 0x05;
    /// Raw flash read.
    pub const READ_FLASH: u16 = 0x06;
    /// Query the chip type word.
    pub const READ_CHIP_TYPE: u16 = 0x07;
    /// Change the link baud rate.
    pub const CHANGE_BAUD: u16 = 0x09;
    /// Erase flash or a partition.
    pub const ERASE_FLASH: u16 = 0x0A;
    /// Rewrite the partition table.
    pub const REPARTITION: u16 = 0x0B;
    /// Open a partition read.
    pub const START_READ: u16 = 0x10;
    /// Read a slice of the opened partition.
    pub const READ_MIDST: u16 = 0x11;
    /// Close the partition read.
    pub const END_READ: u16 = 0x12;
    /// Power the device off.
    pub const POWER_OFF: u16 = 0x17;
    /// Switch off HDLC escaping for bulk transfer.
    pub const DISABLE_TRANSCODE: u16 = 0x21;
    /// List the partition table (FDL2).
    pub const READ_PARTITION: u16 = 0x8E;

    /// Positive acknowledgement.
    pub const REP_ACK: u16 = 0x80;
    /// Version string reply to the autobaud probe.
    pub const REP_VER: u16 = 0x81;
    /// Command rejected.
    pub const REP_INVALID_CMD: u16 = 0x82;
    /// Partition-read data reply.
    pub const REP_READ_FLASH: u16 = 0x93;
    /// Chip-type reply.
    pub const REP_READ_CHIP_TYPE: u16 = 0x94;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_HANDSHAKE_ATTEMPTS: usize = 10;
const MAX_FRAME_SIZE: usize = 4096;

/// Maximum payload per `MIDST_DATA` frame accepted by FDL1.
const FDL1_CHUNK_SIZE: usize = 528;

/// Maximum payload per `MIDST_DATA` frame accepted by FDL2.
const FDL2_CHUNK_SIZE: usize = 2112;

/// Read chunk requested per `READ_MIDST`.
const READ_CHUNK_SIZE: u32 = 2048;

/// Fixed UTF-16LE partition-name field length in bytes.
const PARTITION_NAME_LEN: usize = 72;

/// Loader stage the session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FdlStage {
    /// Talking to the BootROM.
    #[default]
    None,
    /// Stage-1 loader running in SRAM.
    Fdl1,
    /// Stage-2 loader running in DRAM.
    Fdl2,
}

/// Device identity learned during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SprdDeviceInfo {
    /// Version string from the `REP_VER` reply.
    pub version: String,
    /// Chip ID from `READ_CHIP_TYPE`.
    pub chip_id: u16,
    /// Database record for the chip.
    pub chip: SprdChipInfo,
}

/// One partition-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PartitionInfo {
    /// Partition name.
    pub name: String,
    /// Partition size in bytes.
    pub size: u64,
}

/// FDL download controller driving one device over a transport.
pub struct FdlClient<'a, T: Transport> {
    transport: &'a mut T,
    transcode: bool,
    stage: FdlStage,
    pending_stage: Option<FdlStage>,
    version: String,
    device_info: Option<SprdDeviceInfo>,
}

impl<'a, T: Transport> FdlClient<'a, T> {
    /// Create a controller over an open transport.
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            transcode: true,
            stage: FdlStage::None,
            pending_stage: None,
            version: String::new(),
            device_info: None,
        }
    }

    /// Current loader stage.
    pub fn current_stage(&self) -> FdlStage {
        self.stage
    }

    /// Version string from the last handshake.
    pub fn get_version(&self) -> &str {
        &self.version
    }

    /// Identity learned via [`Self::query_device_info`], if any.
    pub fn device_info(&self) -> Option<&SprdDeviceInfo> {
        self.device_info.as_ref()
    }

    // ── Framing ────────────────────────────────────────────────────

    fn send(&mut self, command: u16, payload: &[u8]) -> Result<()> {
        let frame = sprd_encode(command, payload, self.transcode);
        self.transport.write_all(&frame)
    }

    fn recv(&mut self, timeout: Duration) -> Result<SprdFrame> {
        let raw = self.transport.read(MAX_FRAME_SIZE, timeout)?;
        if raw.is_empty() {
            return Err(Error::Timeout("FDL response timeout".to_string()));
        }
        sprd_decode(&raw, self.transcode)
    }

    fn command(&mut self, command: u16, payload: &[u8]) -> Result<SprdFrame> {
        self.send(command, payload)?;
        self.recv(DEFAULT_TIMEOUT)
    }

    fn expect_ack(&mut self, command: u16, payload: &[u8]) -> Result<()> {
        let frame = self.command(command, payload)?;
        if frame.frame_type != cmd::REP_ACK {
            return Err(Error::Protocol(format!(
                "command {command:#06x} answered {:#06x}, expected ACK",
                frame.frame_type
            )));
        }
        Ok(())
    }

    // ── Handshake / connect ────────────────────────────────────────

    /// Autobaud handshake: probe with `0x7E` until the peer answers
    /// with its version frame.
    pub fn handshake(&mut self) -> Result<()> {
        info!("Performing FDL handshake...");

        for attempt in 0..MAX_HANDSHAKE_ATTEMPTS {
            self.transport.write_all(&[cmd::CHECK_BAUD])?;

            let raw = self.transport.read(MAX_FRAME_SIZE, HANDSHAKE_TIMEOUT)?;
            if raw.is_empty() {
                continue;
            }

            match sprd_decode(&raw, self.transcode) {
                Ok(frame) if frame.frame_type == cmd::REP_VER => {
                    self.version = String::from_utf8_lossy(&frame.payload)
                        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                        .to_string();
                    info!(
                        "FDL handshake OK (attempt {}): {}",
                        attempt + 1,
                        self.version
                    );
                    return Ok(());
                }
                Ok(frame) => warn!(
                    "Handshake: unexpected frame {:#06x}, retrying",
                    frame.frame_type
                ),
                Err(e) => debug!("Handshake: undecodable response ({e}), retrying"),
            }
        }

        Err(Error::Timeout(format!(
            "no version reply after {MAX_HANDSHAKE_ATTEMPTS} handshake attempts"
        )))
    }

    /// Connect after a successful handshake.
    pub fn connect(&mut self) -> Result<()> {
        self.expect_ack(cmd::CONNECT, &[])
    }

    /// Query the chip type and resolve it against the chip database.
    ///
    /// The chip ID selects the FDL load addresses for this device, so
    /// this should run once after the BootROM handshake.
    pub fn query_device_info(&mut self) -> Result<SprdDeviceInfo> {
        let frame = self.command(cmd::READ_CHIP_TYPE, &[])?;
        if frame.frame_type != cmd::REP_READ_CHIP_TYPE || frame.payload.len() < 4 {
            return Err(Error::Protocol(format!(
                "chip type query answered {:#06x} with {} bytes",
                frame.frame_type,
                frame.payload.len()
            )));
        }

        let chip_type = BigEndian::read_u32(&frame.payload[0..4]);
        let chip_id = chip_type as u16;
        let info = SprdDeviceInfo {
            version: self.version.clone(),
            chip_id,
            chip: chips::lookup(chip_id),
        };
        info!(
            "Chip type {chip_type:#010x} -> {} (FDL1 {:#010x}, FDL2 {:#010x})",
            info.chip.name, info.chip.fdl1_load_addr, info.chip.fdl2_load_addr
        );
        self.device_info = Some(info.clone());
        Ok(info)
    }

    // ── FDL download ───────────────────────────────────────────────

    /// Download a loader image to `addr` for the given target stage.
    ///
    /// The stage only advances once [`Self::exec_data`] succeeds.
    pub fn download_fdl(&mut self, data: &[u8], addr: u32, stage: FdlStage) -> Result<()> {
        self.download_fdl_with_progress(data, addr, stage, &mut |_, _| {})
    }

    /// Download a loader image, reporting `(sent, total)` per chunk.
    pub fn download_fdl_with_progress(
        &mut self,
        data: &[u8],
        addr: u32,
        stage: FdlStage,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        info!(
            "Downloading {stage:?} ({} bytes) to {addr:#010x}",
            data.len()
        );

        let mut start = [0u8; 8];
        BigEndian::write_u32(&mut start[0..4], addr);
        BigEndian::write_u32(&mut start[4..8], data.len() as u32);
        self.expect_ack(cmd::START_DATA, &start)?;

        let chunk_size = match stage {
            FdlStage::Fdl2 => FDL2_CHUNK_SIZE,
            _ => FDL1_CHUNK_SIZE,
        };

        let total = data.len() as u64;
        let mut sent = 0u64;
        for chunk in data.chunks(chunk_size) {
            self.expect_ack(cmd::MIDST_DATA, chunk)?;
            sent += chunk.len() as u64;
            progress(sent, total);
        }

        self.expect_ack(cmd::END_DATA, &[])?;
        self.pending_stage = Some(stage);
        Ok(())
    }

    /// Execute previously downloaded data at `addr`.
    ///
    /// On success the session advances to the stage recorded by the
    /// preceding download; entering FDL2 re-handshakes with the fresh
    /// loader before returning.
    pub fn exec_data(&mut self, addr: u32) -> Result<()> {
        let mut payload = [0u8; 4];
        BigEndian::write_u32(&mut payload, addr);
        self.expect_ack(cmd::EXEC_DATA, &payload)?;

        if let Some(stage) = self.pending_stage.take() {
            self.stage = stage;
            info!("Loader executing, now in stage {stage:?}");

            if stage == FdlStage::Fdl2 {
                // FDL2 greets like a fresh device
                self.handshake()?;
                self.connect()?;
                info!("FDL2 ready");
            }
        }
        Ok(())
    }

    /// Download and execute FDL2 at the address the chip database
    /// assigns to the device found by [`Self::query_device_info`].
    pub fn load_fdl2_auto(&mut self, data: &[u8]) -> Result<()> {
        let addr = self
            .device_info
            .as_ref()
            .map(|info| info.chip.fdl2_load_addr)
            .ok_or_else(|| {
                Error::InvalidInput("device info not queried before FDL2 load".to_string())
            })?;

        self.download_fdl(data, addr, FdlStage::Fdl2)?;
        self.exec_data(addr)
    }

    // ── Link control ───────────────────────────────────────────────

    /// Switch off HDLC escaping for raw binary transfer. Idempotent:
    /// the flag is only ever flipped off once.
    pub fn disable_transcode(&mut self) -> Result<()> {
        if !self.transcode {
            debug!("Transcode already disabled");
            return Ok(());
        }
        self.expect_ack(cmd::DISABLE_TRANSCODE, &[])?;
        self.transcode = false;
        info!("Transcode disabled, link is now raw");
        Ok(())
    }

    /// Change the link baud rate.
    pub fn change_baud_rate(&mut self, baud: u32) -> Result<()> {
        let mut payload = [0u8; 4];
        BigEndian::write_u32(&mut payload, baud);
        self.expect_ack(cmd::CHANGE_BAUD, &payload)?;
        info!("Baud rate changed to {baud}");
        Ok(())
    }

    // ── Partition operations (FDL2) ────────────────────────────────

    /// Read the partition table.
    pub fn read_partitions(&mut self) -> Result<Vec<PartitionInfo>> {
        let frame = self.command(cmd::READ_PARTITION, &[])?;
        if frame.frame_type != cmd::REP_ACK {
            return Err(Error::Protocol(format!(
                "partition list answered {:#06x}",
                frame.frame_type
            )));
        }

        let record = PARTITION_NAME_LEN + 4;
        let mut partitions = Vec::new();
        for entry in frame.payload.chunks_exact(record) {
            let name = utf16le_name(&entry[..PARTITION_NAME_LEN]);
            let size = u64::from(BigEndian::read_u32(&entry[PARTITION_NAME_LEN..]));
            partitions.push(PartitionInfo { name, size });
        }
        Ok(partitions)
    }

    /// Write a partition by name.
    pub fn write_partition(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.write_partition_with_progress(name, data, &mut |_, _| {})
    }

    /// Write a partition, reporting `(sent, total)` per chunk.
    pub fn write_partition_with_progress(
        &mut self,
        name: &str,
        data: &[u8],
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        info!("Writing partition {name} ({} bytes)", data.len());

        let mut start = encode_partition_name(name)?;
        start.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.expect_ack(cmd::START_DATA, &start)?;

        let total = data.len() as u64;
        let mut sent = 0u64;
        for chunk in data.chunks(FDL2_CHUNK_SIZE) {
            self.expect_ack(cmd::MIDST_DATA, chunk)?;
            sent += chunk.len() as u64;
            progress(sent, total);
        }

        self.expect_ack(cmd::END_DATA, &[])
    }

    /// Read `length` bytes of a partition starting at `offset`.
    pub fn read_partition(&mut self, name: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        info!("Reading partition {name}: {length} bytes at offset {offset}");

        let mut start = encode_partition_name(name)?;
        start.extend_from_slice(&(length as u32).to_be_bytes());
        self.expect_ack(cmd::START_READ, &start)?;

        let mut out = Vec::with_capacity(length as usize);
        while (out.len() as u64) < length {
            let chunk = (length - out.len() as u64).min(u64::from(READ_CHUNK_SIZE)) as u32;
            let mut req = [0u8; 8];
            BigEndian::write_u32(&mut req[0..4], chunk);
            BigEndian::write_u32(&mut req[4..8], (offset + out.len() as u64) as u32);

            let frame = self.command(cmd::READ_MIDST, &req)?;
            if frame.frame_type != cmd::REP_READ_FLASH {
                // Close the read before surfacing the failure
                self.send(cmd::END_READ, &[])?;
                let _ = self.recv(DEFAULT_TIMEOUT);
                return Err(Error::Protocol(format!(
                    "partition read answered {:#06x}",
                    frame.frame_type
                )));
            }
            if frame.payload.is_empty() {
                break;
            }
            out.extend_from_slice(&frame.payload);
        }

        self.expect_ack(cmd::END_READ, &[])?;
        Ok(out)
    }

    /// Erase a partition by name.
    pub fn erase_partition(&mut self, name: &str) -> Result<()> {
        info!("Erasing partition {name}");
        let payload = encode_partition_name(name)?;
        self.expect_ack(cmd::ERASE_FLASH, &payload)
    }

    // ── IMEI (FDL2, Diag-style commands over the same link) ────────

    /// Read the IMEI bytes of a SIM slot.
    pub fn read_imei(&mut self, sim_slot: u8) -> Result<Vec<u8>> {
        let frame = self.command(u16::from(diag::cmd::READ_IMEI), &[sim_slot])?;
        let status = (frame.frame_type & 0xFF) as u8;
        if status != diag::cmd::RESP_OK {
            return Err(Error::Protocol(format!(
                "IMEI read failed with status {status:#04x}"
            )));
        }
        Ok(frame.payload)
    }

    /// Write the IMEI bytes of a SIM slot.
    pub fn write_imei(&mut self, sim_slot: u8, imei: &[u8]) -> Result<()> {
        let mut payload = vec![sim_slot];
        payload.extend_from_slice(imei);

        let frame = self.command(u16::from(diag::cmd::WRITE_IMEI), &payload)?;
        let status = (frame.frame_type & 0xFF) as u8;
        if status != diag::cmd::RESP_OK {
            return Err(Error::Protocol(format!(
                "IMEI write failed with status {status:#04x}"
            )));
        }
        Ok(())
    }

    // ── Control ────────────────────────────────────────────────────

    /// Reset the device. A missing reply means the device already
    /// dropped off the bus and counts as success.
    pub fn normal_reset(&mut self) -> Result<()> {
        info!("Sending normal reset");
        self.send(cmd::NORMAL_RESET, &[])?;
        match self.recv(Duration::from_millis(500)) {
            Ok(frame) if frame.frame_type == cmd::REP_ACK => {}
            Ok(frame) => warn!("Reset answered {:#06x}", frame.frame_type),
            Err(_) => debug!("No reset reply (device likely disconnected)"),
        }
        Ok(())
    }

    /// Power the device off. Reply handling as for
    /// [`Self::normal_reset`].
    pub fn power_off(&mut self) -> Result<()> {
        info!("Sending power off");
        self.send(cmd::POWER_OFF, &[])?;
        match self.recv(Duration::from_millis(500)) {
            Ok(frame) if frame.frame_type == cmd::REP_ACK => {}
            Ok(frame) => warn!("Power off answered {:#06x}", frame.frame_type),
            Err(_) => debug!("No power-off reply (device likely disconnected)"),
        }
        Ok(())
    }
}

/// Encode a partition name as the fixed 72-byte UTF-16LE field.
fn encode_partition_name(name: &str) -> Result<Vec<u8>> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() > PARTITION_NAME_LEN / 2 {
        return Err(Error::InvalidInput(format!(
            "partition name too long: {name}"
        )));
    }

    let mut out = Vec::with_capacity(PARTITION_NAME_LEN);
    for i in 0..PARTITION_NAME_LEN / 2 {
        let unit = units.get(i).copied().unwrap_or(0);
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(out)
}

/// Decode a fixed UTF-16LE name field, stopping at the first NUL.
fn utf16le_name(field: &[u8]) -> String {
    let units: Vec<u16> = field
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{ScriptedTransport, Step};

    const VERSION: &[u8] = b"Spreadtrum Boot Block version 1.1";

    fn req(command: u16, payload: &[u8], transcode: bool) -> Vec<u8> {
        sprd_encode(command, payload, transcode)
    }

    fn rep(frame_type: u16, payload: &[u8], transcode: bool) -> Vec<u8> {
        sprd_encode(frame_type, payload, transcode)
    }

    fn ack(transcode: bool) -> Vec<u8> {
        rep(cmd::REP_ACK, &[], transcode)
    }

    fn handshake_steps() -> Vec<Step> {
        vec![
            Step::Expect(vec![cmd::CHECK_BAUD]),
            Step::Respond(rep(cmd::REP_VER, VERSION, true)),
        ]
    }

    #[test]
    fn test_handshake_stores_version() {
        let mut transport = ScriptedTransport::new(handshake_steps());
        let mut fdl = FdlClient::new(&mut transport);
        fdl.handshake().unwrap();
        assert_eq!(fdl.get_version(), "Spreadtrum Boot Block version 1.1");
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_connect_after_handshake() {
        let mut script = handshake_steps();
        script.push(Step::Expect(req(cmd::CONNECT, &[], true)));
        script.push(Step::Respond(ack(true)));
        let mut transport = ScriptedTransport::new(script);

        let mut fdl = FdlClient::new(&mut transport);
        fdl.handshake().unwrap();
        fdl.connect().unwrap();
        assert_eq!(fdl.current_stage(), FdlStage::None);
    }

    #[test]
    fn test_query_device_info_resolves_chip() {
        let script = vec![
            Step::Expect(req(cmd::READ_CHIP_TYPE, &[], true)),
            Step::Respond(rep(
                cmd::REP_READ_CHIP_TYPE,
                &0x00009863u32.to_be_bytes(),
                true,
            )),
        ];
        let mut transport = ScriptedTransport::new(script);

        let mut fdl = FdlClient::new(&mut transport);
        let info = fdl.query_device_info().unwrap();
        assert_eq!(info.chip_id, 0x9863);
        assert_eq!(info.chip.name, "SC9863A");
        assert_eq!(info.chip.fdl2_load_addr, 0x80008000);
    }

    #[test]
    fn test_download_and_exec_fdl1_advances_stage() {
        let payload = [0x42u8; 64];
        let addr = 0x00005000u32;

        let mut start = addr.to_be_bytes().to_vec();
        start.extend_from_slice(&(payload.len() as u32).to_be_bytes());

        let script = vec![
            Step::Expect(req(cmd::START_DATA, &start, true)),
            Step::Respond(ack(true)),
            Step::Expect(req(cmd::MIDST_DATA, &payload, true)),
            Step::Respond(ack(true)),
            Step::Expect(req(cmd::END_DATA, &[], true)),
            Step::Respond(ack(true)),
            Step::Expect(req(cmd::EXEC_DATA, &addr.to_be_bytes(), true)),
            Step::Respond(ack(true)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let mut fdl = FdlClient::new(&mut transport);
        fdl.download_fdl(&payload, addr, FdlStage::Fdl1).unwrap();
        assert_eq!(fdl.current_stage(), FdlStage::None); // Not yet executed
        fdl.exec_data(addr).unwrap();
        assert_eq!(fdl.current_stage(), FdlStage::Fdl1);
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_fdl2_exec_rehandshakes() {
        let payload = [0x33u8; 16];
        let addr = 0x80008000u32;

        let mut start = addr.to_be_bytes().to_vec();
        start.extend_from_slice(&(payload.len() as u32).to_be_bytes());

        let script = vec![
            Step::Expect(req(cmd::START_DATA, &start, true)),
            Step::Respond(ack(true)),
            Step::Expect(req(cmd::MIDST_DATA, &payload, true)),
            Step::Respond(ack(true)),
            Step::Expect(req(cmd::END_DATA, &[], true)),
            Step::Respond(ack(true)),
            Step::Expect(req(cmd::EXEC_DATA, &addr.to_be_bytes(), true)),
            Step::Respond(ack(true)),
            // FDL2 greets like a fresh device: re-handshake + connect
            Step::Expect(vec![cmd::CHECK_BAUD]),
            Step::Respond(rep(cmd::REP_VER, b"FDL2 v2.0", true)),
            Step::Expect(req(cmd::CONNECT, &[], true)),
            Step::Respond(ack(true)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let mut fdl = FdlClient::new(&mut transport);
        fdl.download_fdl(&payload, addr, FdlStage::Fdl2).unwrap();
        fdl.exec_data(addr).unwrap();
        assert_eq!(fdl.current_stage(), FdlStage::Fdl2);
        assert_eq!(fdl.get_version(), "FDL2 v2.0");
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_disable_transcode_switches_framing() {
        let script = vec![
            Step::Expect(req(cmd::DISABLE_TRANSCODE, &[], true)),
            Step::Respond(ack(true)),
            // Subsequent traffic is raw flag-wrapped
            Step::Expect(req(cmd::CONNECT, &[], false)),
            Step::Respond(ack(false)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let mut fdl = FdlClient::new(&mut transport);
        fdl.disable_transcode().unwrap();
        fdl.connect().unwrap();
        // Second call is a no-op
        fdl.disable_transcode().unwrap();
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_write_partition_by_name() {
        let data = [0x55u8; 32];
        let mut start = encode_partition_name("boot").unwrap();
        start.extend_from_slice(&(data.len() as u32).to_be_bytes());

        let script = vec![
            Step::Expect(req(cmd::START_DATA, &start, true)),
            Step::Respond(ack(true)),
            Step::Expect(req(cmd::MIDST_DATA, &data, true)),
            Step::Respond(ack(true)),
            Step::Expect(req(cmd::END_DATA, &[], true)),
            Step::Respond(ack(true)),
        ];
        let mut transport = ScriptedTransport::new(script);

        FdlClient::new(&mut transport)
            .write_partition("boot", &data)
            .unwrap();
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_read_partition_chunks() {
        let part = encode_partition_name("miscdata").unwrap();
        let mut start = part.clone();
        start.extend_from_slice(&4096u32.to_be_bytes());

        let mut req1 = READ_CHUNK_SIZE.to_be_bytes().to_vec();
        req1.extend_from_slice(&0u32.to_be_bytes());
        let mut req2 = READ_CHUNK_SIZE.to_be_bytes().to_vec();
        req2.extend_from_slice(&2048u32.to_be_bytes());

        let script = vec![
            Step::Expect(req(cmd::START_READ, &start, true)),
            Step::Respond(ack(true)),
            Step::Expect(req(cmd::READ_MIDST, &req1, true)),
            Step::Respond(rep(cmd::REP_READ_FLASH, &[0xAA; 2048], true)),
            Step::Expect(req(cmd::READ_MIDST, &req2, true)),
            Step::Respond(rep(cmd::REP_READ_FLASH, &[0xBB; 2048], true)),
            Step::Expect(req(cmd::END_READ, &[], true)),
            Step::Respond(ack(true)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let data = FdlClient::new(&mut transport)
            .read_partition("miscdata", 0, 4096)
            .unwrap();
        assert_eq!(data.len(), 4096);
        assert_eq!(data[0], 0xAA);
        assert_eq!(data[2048], 0xBB);
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_read_partitions_table() {
        let mut table = Vec::new();
        for (name, size) in [("boot", 0x4000u32), ("system", 0x100000)] {
            table.extend(encode_partition_name(name).unwrap());
            table.extend_from_slice(&size.to_be_bytes());
        }

        let script = vec![
            Step::Expect(req(cmd::READ_PARTITION, &[], true)),
            Step::Respond(rep(cmd::REP_ACK, &table, true)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let partitions = FdlClient::new(&mut transport).read_partitions().unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].name, "boot");
        assert_eq!(partitions[0].size, 0x4000);
        assert_eq!(partitions[1].name, "system");
    }

    #[test]
    fn test_erase_partition() {
        let payload = encode_partition_name("cache").unwrap();
        let script = vec![
            Step::Expect(req(cmd::ERASE_FLASH, &payload, true)),
            Step::Respond(ack(true)),
        ];
        let mut transport = ScriptedTransport::new(script);

        FdlClient::new(&mut transport)
            .erase_partition("cache")
            .unwrap();
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_partition_name_too_long() {
        let name = "x".repeat(40);
        assert!(matches!(
            encode_partition_name(&name),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_invalid_command_reply_is_protocol_error() {
        let script = vec![
            Step::Expect(req(cmd::CONNECT, &[], true)),
            Step::Respond(rep(cmd::REP_INVALID_CMD, &[], true)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let err = FdlClient::new(&mut transport).connect().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_normal_reset_tolerates_silence() {
        let script = vec![Step::Expect(req(cmd::NORMAL_RESET, &[], true))];
        let mut transport = ScriptedTransport::new(script);

        FdlClient::new(&mut transport).normal_reset().unwrap();
        assert!(transport.is_exhausted());
    }
}
