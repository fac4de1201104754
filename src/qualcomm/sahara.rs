//! Qualcomm Sahara protocol engine.
//!
//! Sahara is the EDL-mode boot protocol: the device PBL sends `Hello`,
//! the host negotiates a mode and the device then pulls a programmer
//! image from the host in server-pull fashion (`ReadData` requests
//! against a flat byte buffer). Version 2+ devices additionally expose a
//! "Command mode" used here to read chip identity before the image
//! transfer starts.
//!
//! ## Packet format
//!
//! Every packet starts with a little-endian 8-byte header:
//!
//! ```text
//! +-------------+-------------+----------------------+
//! | command u32 | length u32  |   command-specific   |
//! +-------------+-------------+----------------------+
//! ```
//!
//! `length` covers the whole packet including the header. The only
//! unframed bytes on the wire are the raw payload of an Execute response
//! (step 4 of the four-step exchange) and the image chunks the host
//! writes during upload.

use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::qualcomm::chips;
use crate::transport::Transport;

/// Sahara protocol version advertised by this host.
pub const HOST_VERSION: u32 = 2;

/// Minimum protocol version this host accepts.
pub const HOST_VERSION_MIN: u32 = 1;

const HEADER_SIZE: usize = 8;
const HELLO_SIZE: usize = 48;
const MAX_BODY_SIZE: u32 = 64 * 1024;
const MAX_HELLO_RETRIES: usize = 5;

const HELLO_TIMEOUT: Duration = Duration::from_secs(60);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const CMD_TIMEOUT: Duration = Duration::from_secs(5);
const EXEC_TIMEOUT: Duration = Duration::from_secs(5);
const EXEC_BULK_TIMEOUT: Duration = Duration::from_secs(10);

/// Sahara packet command IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaCommand {
    /// Device → host: version negotiation opener.
    Hello = 0x01,
    /// Host → device: negotiation reply.
    HelloResponse = 0x02,
    /// Device → host: 32-bit image chunk request.
    ReadData = 0x03,
    /// Device → host: image transfer finished.
    EndImageTransfer = 0x04,
    /// Host → device: acknowledge end of transfer.
    Done = 0x05,
    /// Device → host: acknowledge `Done`.
    DoneResponse = 0x06,
    /// Host → device: hard reset.
    Reset = 0x07,
    /// Device → host: reset acknowledged.
    ResetResponse = 0x08,
    /// Memory debug offer (unused here).
    MemoryDebug = 0x09,
    /// Memory read request (unused here).
    MemoryRead = 0x0A,
    /// Device → host: Command mode accepted.
    CommandReady = 0x0B,
    /// Host → device: switch protocol mode.
    SwitchMode = 0x0C,
    /// Host → device: run a client command.
    Execute = 0x0D,
    /// Device → host: client command data descriptor.
    ExecuteData = 0x0E,
    /// Host → device: confirm, request the raw data.
    ExecuteResponse = 0x0F,
    /// 64-bit memory debug offer (unused here).
    MemoryDebug64 = 0x10,
    /// 64-bit memory read request (unused here).
    MemoryRead64 = 0x11,
    /// Device → host: 64-bit image chunk request.
    ReadData64 = 0x12,
    /// Host → device: soft reset; device resends `Hello`.
    ResetStateMachine = 0x13,
}

impl SaharaCommand {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0x01 => Self::Hello,
            0x02 => Self::HelloResponse,
            0x03 => Self::ReadData,
            0x04 => Self::EndImageTransfer,
            0x05 => Self::Done,
            0x06 => Self::DoneResponse,
            0x07 => Self::Reset,
            0x08 => Self::ResetResponse,
            0x09 => Self::MemoryDebug,
            0x0A => Self::MemoryRead,
            0x0B => Self::CommandReady,
            0x0C => Self::SwitchMode,
            0x0D => Self::Execute,
            0x0E => Self::ExecuteData,
            0x0F => Self::ExecuteResponse,
            0x10 => Self::MemoryDebug64,
            0x11 => Self::MemoryRead64,
            0x12 => Self::ReadData64,
            0x13 => Self::ResetStateMachine,
            _ => return None,
        })
    }
}

/// Sahara protocol modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum SaharaMode {
    /// Waiting for an image transfer.
    #[default]
    ImageTransferPending = 0x0,
    /// Image transfer finished.
    ImageTransferComplete = 0x1,
    /// Memory debug (crash dump) mode.
    MemoryDebug = 0x2,
    /// Command mode for identity reads.
    Command = 0x3,
}

/// Client commands executable in Command mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaharaExecCommand {
    /// Chip serial number.
    SerialNumRead = 0x01,
    /// 64-bit HWID (v1/v2 only).
    MsmHwIdRead = 0x02,
    /// OEM public key hash.
    OemPkHashRead = 0x03,
    /// SBL info block (v3 only).
    SblInfoRead = 0x06,
    /// SBL software version (v1/v2 only).
    SblSwVersion = 0x07,
    /// PBL software version. Never issued by this engine: several
    /// devices fail the handshake after answering it.
    PblSwVersion = 0x08,
    /// Extended chip info (v3 only, includes HWID).
    ChipIdV3Read = 0x0A,
    /// 64-bit serial number.
    SerialNumRead64 = 0x14,
}

/// Identity gathered from a device during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SaharaDeviceInfo {
    /// Protocol version the device reported.
    pub sahara_version: u32,
    /// Minimum protocol version the device accepts.
    pub sahara_min_version: u32,
    /// Chip serial number.
    pub serial: u32,
    /// Serial formatted as `0x????????`.
    pub serial_hex: String,
    /// OEM public key hash, at most 48 bytes.
    pub pk_hash: Vec<u8>,
    /// Lowercase hex of `pk_hash`.
    pub pk_hash_hex: String,
    /// MSM chip ID.
    pub msm_id: u32,
    /// OEM ID.
    pub oem_id: u16,
    /// Model ID.
    pub model_id: u16,
    /// Composed HWID hex string; the layout differs between protocol
    /// versions (see [`SaharaClient`] docs).
    pub hw_id_hex: String,
    /// SBL software version, 0 when unknown.
    pub sbl_version: u32,
    /// Chip marketing name resolved from the MSM ID.
    pub chip_name: String,
    /// Whether an identity read completed.
    pub chip_info_read: bool,
}

/// Sahara protocol client driving one device over a transport.
///
/// The HWID hex encoding is version dependent: v1/v2 devices report a
/// 64-bit little-endian HWID formatted as `0x` + 16 uppercase hex
/// digits, v3 devices report the fields separately and the string is
/// composed as `0x00` + msm(6) + oem(4) + model(4), uppercased.
pub struct SaharaClient<'a, T: Transport> {
    transport: &'a mut T,
    device_version: u32,
    device_min_version: u32,
    max_cmd_len: u32,
    current_mode: SaharaMode,
    device_info: SaharaDeviceInfo,
    chip_info_attempted: bool,
    skip_command_mode: bool,
    probe_chip_info: bool,
}

impl<'a, T: Transport> SaharaClient<'a, T> {
    /// Create a client over an open transport.
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            device_version: 0,
            device_min_version: 0,
            max_cmd_len: 0,
            current_mode: SaharaMode::ImageTransferPending,
            device_info: SaharaDeviceInfo::default(),
            chip_info_attempted: false,
            skip_command_mode: false,
            probe_chip_info: true,
        }
    }

    /// Enable or disable the Command-mode identity probe performed on
    /// the first `Hello`. Enabled by default.
    #[must_use]
    pub fn with_chip_info_probe(mut self, probe: bool) -> Self {
        self.probe_chip_info = probe;
        self
    }

    /// Identity collected so far.
    pub fn device_info(&self) -> &SaharaDeviceInfo {
        &self.device_info
    }

    /// Protocol version detected on the device (0 before the handshake).
    pub fn device_sahara_version(&self) -> u32 {
        self.device_version
    }

    // ── Packet I/O ─────────────────────────────────────────────────

    fn read_packet(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut pkt = self.transport.read_exact(HEADER_SIZE, timeout)?;
        if pkt.len() < HEADER_SIZE {
            return Err(Error::Transport(format!(
                "short Sahara header: {} bytes",
                pkt.len()
            )));
        }

        let total_len = LittleEndian::read_u32(&pkt[4..8]);
        if total_len < HEADER_SIZE as u32 {
            warn!("Sahara packet length {total_len} < header size");
            return Ok(pkt);
        }

        let remaining = total_len - HEADER_SIZE as u32;
        if remaining == 0 {
            return Ok(pkt);
        }
        if remaining > MAX_BODY_SIZE {
            return Err(Error::MalformedPacket(format!(
                "Sahara packet body too large: {remaining} bytes"
            )));
        }

        let body = self.transport.read_exact(remaining as usize, timeout)?;
        if body.len() < remaining as usize {
            return Err(Error::Transport(format!(
                "short Sahara body: expected {remaining}, got {}",
                body.len()
            )));
        }

        pkt.extend_from_slice(&body);
        Ok(pkt)
    }

    fn packet_command(pkt: &[u8]) -> u32 {
        LittleEndian::read_u32(&pkt[0..4])
    }

    fn send_header_only(&mut self, command: SaharaCommand) -> Result<()> {
        let mut pkt = Vec::with_capacity(HEADER_SIZE);
        pkt.extend_from_slice(&(command as u32).to_le_bytes());
        pkt.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        self.transport.write_all(&pkt)
    }

    fn send_hello_response(&mut self, mode: SaharaMode) -> Result<()> {
        info!("Sending HelloResponse, mode={}", mode as u32);
        let mut pkt = Vec::with_capacity(HELLO_SIZE);
        pkt.extend_from_slice(&(SaharaCommand::HelloResponse as u32).to_le_bytes());
        pkt.extend_from_slice(&(HELLO_SIZE as u32).to_le_bytes());
        pkt.extend_from_slice(&HOST_VERSION.to_le_bytes());
        pkt.extend_from_slice(&HOST_VERSION_MIN.to_le_bytes());
        pkt.extend_from_slice(&0u32.to_le_bytes()); // status = success
        pkt.extend_from_slice(&(mode as u32).to_le_bytes());
        pkt.extend_from_slice(&[0u8; 24]); // reserved
        self.transport.write_all(&pkt)
    }

    fn send_switch_mode(&mut self, mode: SaharaMode) -> Result<()> {
        info!("Sending SwitchMode to mode={}", mode as u32);
        let mut pkt = Vec::with_capacity(12);
        pkt.extend_from_slice(&(SaharaCommand::SwitchMode as u32).to_le_bytes());
        pkt.extend_from_slice(&12u32.to_le_bytes());
        pkt.extend_from_slice(&(mode as u32).to_le_bytes());
        self.transport.write_all(&pkt)
    }

    // ── Handshake ──────────────────────────────────────────────────

    /// Wait for `Hello`, optionally read chip identity via Command
    /// mode, then answer with a `HelloResponse` requesting `mode`.
    pub fn handshake(&mut self, requested_mode: SaharaMode) -> Result<()> {
        info!("Waiting for Sahara Hello...");

        let mut pkt = Vec::new();
        for attempt in 0..MAX_HELLO_RETRIES {
            if attempt > 0 {
                info!("Hello retry {attempt}/{}...", MAX_HELLO_RETRIES - 1);
                let stale = self.transport.read(4096, Duration::from_millis(100))?;
                if !stale.is_empty() {
                    info!("Flushed {} stale bytes", stale.len());
                }
                thread::sleep(Duration::from_millis(500));
            }

            let timeout = if attempt == 0 { HELLO_TIMEOUT } else { READ_TIMEOUT };
            match self.read_packet(timeout) {
                Ok(p) if p.len() >= HELLO_SIZE => {
                    if Self::packet_command(&p) == SaharaCommand::Hello as u32 {
                        pkt = p;
                        break;
                    }
                    warn!(
                        "Expected Hello (0x01), got {:#04x}",
                        Self::packet_command(&p)
                    );
                }
                Ok(p) => warn!("Hello read: got {} bytes (need {HELLO_SIZE})", p.len()),
                Err(e) => warn!("Hello read failed: {e}"),
            }
        }

        if pkt.len() < HELLO_SIZE {
            return Err(Error::Protocol(
                "no Sahara Hello after all retries".to_string(),
            ));
        }

        self.device_version = LittleEndian::read_u32(&pkt[8..12]);
        self.device_min_version = LittleEndian::read_u32(&pkt[12..16]);
        self.max_cmd_len = LittleEndian::read_u32(&pkt[16..20]);
        let mode = LittleEndian::read_u32(&pkt[20..24]);
        self.current_mode = match mode {
            0x1 => SaharaMode::ImageTransferComplete,
            0x2 => SaharaMode::MemoryDebug,
            0x3 => SaharaMode::Command,
            _ => SaharaMode::ImageTransferPending,
        };

        info!(
            "Device Sahara v{} (min {}), mode={mode}, maxCmd={}",
            self.device_version, self.device_min_version, self.max_cmd_len
        );
        self.device_info.sahara_version = self.device_version;
        self.device_info.sahara_min_version = self.device_min_version;

        // Identity is only readable before Image Transfer starts, and
        // only worth trying once per session.
        if self.probe_chip_info
            && !self.chip_info_attempted
            && self.current_mode == SaharaMode::ImageTransferPending
        {
            self.chip_info_attempted = true;

            if self.try_read_chip_info()? {
                // Device sends a fresh Hello after the SwitchMode back
                match self.read_packet(HELLO_TIMEOUT) {
                    Ok(p) if p.len() >= HELLO_SIZE => {
                        if Self::packet_command(&p) != SaharaCommand::Hello as u32 {
                            warn!(
                                "Expected new Hello after SwitchMode, got {:#04x}",
                                Self::packet_command(&p)
                            );
                        }
                        info!(
                            "New Hello received, mode={}",
                            LittleEndian::read_u32(&p[20..24])
                        );
                    }
                    _ => warn!("No new Hello after SwitchMode"),
                }
            }
        }

        self.send_hello_response(requested_mode)?;
        self.current_mode = requested_mode;
        Ok(())
    }

    // ── Command mode identity read ─────────────────────────────────

    /// Request Command mode and read chip identity. Returns `true` when
    /// the device accepted Command mode (and has since been switched
    /// back to Image Transfer).
    fn try_read_chip_info(&mut self) -> Result<bool> {
        if self.skip_command_mode {
            info!("Skipping Command mode (previously failed)");
            return Ok(false);
        }

        info!(
            "Attempting Command mode for chip info (v{})...",
            self.device_version
        );
        self.send_hello_response(SaharaMode::Command)?;

        let resp = match self.read_packet(CMD_TIMEOUT) {
            Ok(p) if p.len() >= HEADER_SIZE => p,
            _ => {
                warn!("No response to Command mode request");
                self.skip_command_mode = true;
                return Ok(false);
            }
        };

        match SaharaCommand::from_u32(Self::packet_command(&resp)) {
            Some(SaharaCommand::CommandReady) => {
                info!("Device accepted Command mode, reading chip info");

                let serial = self.execute(SaharaExecCommand::SerialNumRead)?;
                self.parse_serial(&serial);

                let pk_hash = self.execute(SaharaExecCommand::OemPkHashRead)?;
                if !pk_hash.is_empty() {
                    let hash = &pk_hash[..pk_hash.len().min(48)];
                    self.device_info.pk_hash = hash.to_vec();
                    self.device_info.pk_hash_hex =
                        hash.iter().map(|b| format!("{b:02x}")).collect();
                    info!("- OEM PKHASH : {}", self.device_info.pk_hash_hex);
                }

                if self.device_version < 3 {
                    self.read_chip_info_v1v2()?;
                } else {
                    self.read_chip_info_v3()?;
                }

                self.device_info.chip_info_read = true;
                if self.device_info.msm_id != 0 {
                    self.device_info.chip_name = chips::chip_name(self.device_info.msm_id);
                }

                info!(
                    "Chip info: serial={} msm={:#010x} oem={:#06x} model={:#06x} chip={} hwid={}",
                    self.device_info.serial_hex,
                    self.device_info.msm_id,
                    self.device_info.oem_id,
                    self.device_info.model_id,
                    self.device_info.chip_name,
                    self.device_info.hw_id_hex
                );

                self.send_switch_mode(SaharaMode::ImageTransferPending)?;
                Ok(true)
            }
            Some(SaharaCommand::ReadData | SaharaCommand::ReadData64) => {
                info!(
                    "Device rejected Command mode (v{}), got ReadData",
                    self.device_version
                );
                self.skip_command_mode = true;
                Ok(false)
            }
            Some(SaharaCommand::EndImageTransfer) => {
                warn!("Device abnormal state (EndImageTransfer during Command)");
                self.skip_command_mode = true;
                Ok(false)
            }
            _ => {
                warn!(
                    "Unknown response to Command mode: {:#04x}",
                    Self::packet_command(&resp)
                );
                self.skip_command_mode = true;
                Ok(false)
            }
        }
    }

    /// V1/V2 path: `MsmHwIdRead` (0x02) + `SblSwVersion` (0x07).
    fn read_chip_info_v1v2(&mut self) -> Result<()> {
        debug!("Reading V1/V2 chip info...");

        let hwid = self.execute(SaharaExecCommand::MsmHwIdRead)?;
        if hwid.len() >= 8 {
            self.parse_hwid_v1v2(&hwid);
        }

        let sbl = self.execute(SaharaExecCommand::SblSwVersion)?;
        if sbl.len() >= 4 {
            self.device_info.sbl_version = LittleEndian::read_u32(&sbl[0..4]);
            info!("- SBL SW Version : {:#010x}", self.device_info.sbl_version);
        }
        Ok(())
    }

    /// V3 path: `ChipIdV3Read` (0x0A) + `SblInfoRead` (0x06). V3 devices
    /// answer neither `MsmHwIdRead` nor `SblSwVersion`, and `PblSwVersion`
    /// is never sent at all.
    fn read_chip_info_v3(&mut self) -> Result<()> {
        debug!("Reading V3 chip info...");

        let ext = self.execute(SaharaExecCommand::ChipIdV3Read)?;
        if ext.len() >= 44 {
            self.parse_v3_extended_info(&ext);
        } else {
            warn!("V3 ChipIdV3Read failed or unsupported");
        }

        let sbl = self.execute(SaharaExecCommand::SblInfoRead)?;
        if sbl.len() >= 4 {
            self.parse_sbl_info(&sbl);
        }
        Ok(())
    }

    // ── Execute four-step exchange ─────────────────────────────────

    /// Run one client command through the four-step exchange:
    ///
    /// 1. host sends `Execute` with the client command
    /// 2. device answers `ExecuteData` echoing the command + data length
    /// 3. host confirms with `ExecuteResponse`
    /// 4. device sends exactly `data_length` raw bytes, no header
    ///
    /// Any deviation from the sequence is a protocol error.
    fn execute(&mut self, cmd: SaharaExecCommand) -> Result<Vec<u8>> {
        // Step 1: Execute
        let mut pkt = Vec::with_capacity(12);
        pkt.extend_from_slice(&(SaharaCommand::Execute as u32).to_le_bytes());
        pkt.extend_from_slice(&12u32.to_le_bytes());
        pkt.extend_from_slice(&(cmd as u32).to_le_bytes());
        self.transport.write_all(&pkt)?;

        // Step 2: ExecuteData header + body
        let header = self.transport.read_exact(HEADER_SIZE, EXEC_TIMEOUT)?;
        if header.len() < HEADER_SIZE {
            return Err(Error::Transport(format!(
                "short ExecuteData header: {} bytes",
                header.len()
            )));
        }
        let resp_cmd = LittleEndian::read_u32(&header[0..4]);
        let resp_len = LittleEndian::read_u32(&header[4..8]);

        if resp_cmd != SaharaCommand::ExecuteData as u32 {
            // Drain whatever followed so the stream stays aligned
            if resp_len > HEADER_SIZE as u32 && resp_len <= MAX_BODY_SIZE {
                let _ = self
                    .transport
                    .read_exact((resp_len - HEADER_SIZE as u32) as usize, Duration::from_secs(1));
            }
            return Err(Error::Protocol(format!(
                "expected ExecuteData (0x0E), got {resp_cmd:#04x}"
            )));
        }
        if resp_len <= HEADER_SIZE as u32 {
            return Err(Error::MalformedPacket(format!(
                "ExecuteData too short: {resp_len} bytes"
            )));
        }

        let body = self
            .transport
            .read_exact((resp_len - HEADER_SIZE as u32) as usize, EXEC_TIMEOUT)?;
        if body.len() < 8 {
            return Err(Error::Transport(format!(
                "short ExecuteData body: {} bytes",
                body.len()
            )));
        }
        let data_cmd = LittleEndian::read_u32(&body[0..4]);
        let data_len = LittleEndian::read_u32(&body[4..8]);
        if data_cmd != cmd as u32 || data_len == 0 {
            return Err(Error::Protocol(format!(
                "ExecuteData mismatch: cmd {data_cmd:#04x}, len {data_len}"
            )));
        }
        debug!("ExecuteData: cmd={data_cmd:#04x}, dataLen={data_len}");

        // Step 3: ExecuteResponse
        let mut confirm = Vec::with_capacity(12);
        confirm.extend_from_slice(&(SaharaCommand::ExecuteResponse as u32).to_le_bytes());
        confirm.extend_from_slice(&12u32.to_le_bytes());
        confirm.extend_from_slice(&(cmd as u32).to_le_bytes());
        self.transport.write_all(&confirm)?;

        // Step 4: raw data bytes, no Sahara header
        let timeout = if data_len > 1000 {
            EXEC_BULK_TIMEOUT
        } else {
            EXEC_TIMEOUT
        };
        let result = self.transport.read_exact(data_len as usize, timeout)?;
        if result.len() != data_len as usize {
            warn!(
                "Execute cmd={:#04x}: expected {data_len} bytes, got {}",
                cmd as u32,
                result.len()
            );
        }
        Ok(result)
    }

    /// Run a single exec command and return its raw response. Requires
    /// the device to be in Command mode.
    pub fn read_chip_info(&mut self, cmd: SaharaExecCommand) -> Result<Vec<u8>> {
        self.execute(cmd)
    }

    // ── Identity parsing ───────────────────────────────────────────

    fn parse_serial(&mut self, data: &[u8]) {
        if data.len() >= 4 {
            let serial = LittleEndian::read_u32(&data[0..4]);
            self.device_info.serial = serial;
            self.device_info.serial_hex = format!("0x{serial:08x}");
            info!("- Chip Serial Number : {}", self.device_info.serial_hex);
        }
    }

    /// V1/V2 HWID response: a 64-bit little-endian word packing
    /// MSM (bits 0..31), OEM (32..47) and model (48..63).
    fn parse_hwid_v1v2(&mut self, data: &[u8]) {
        let hwid = LittleEndian::read_u64(&data[0..8]);
        self.device_info.msm_id = (hwid & 0xFFFF_FFFF) as u32;
        self.device_info.oem_id = ((hwid >> 32) & 0xFFFF) as u16;
        self.device_info.model_id = ((hwid >> 48) & 0xFFFF) as u16;
        self.device_info.hw_id_hex = format!("0x{hwid:016X}");

        info!(
            "- MSM HWID : {:#x} | model_id:{:#06x} | oem_id:{:#06x}",
            self.device_info.msm_id, self.device_info.model_id, self.device_info.oem_id
        );
    }

    /// V3 extended info: chip identifier at +0, MSM at +36, OEM at +40,
    /// model at +42, with an alternate OEM at +44 consulted when the
    /// primary is zero.
    fn parse_v3_extended_info(&mut self, data: &[u8]) {
        let chip_id_v3 = LittleEndian::read_u32(&data[0..4]);
        if chip_id_v3 != 0 {
            info!("- Chip Identifier V3 : {chip_id_v3:#010x}");
        }

        let msm = LittleEndian::read_u32(&data[36..40]);
        let mut oem = LittleEndian::read_u16(&data[40..42]);
        let model = LittleEndian::read_u16(&data[42..44]);

        if oem == 0 && data.len() >= 46 {
            let alt = LittleEndian::read_u16(&data[44..46]);
            if alt > 0 && alt < 0x1000 {
                oem = alt;
            }
        }

        if msm != 0 || oem != 0 {
            self.device_info.msm_id = msm;
            self.device_info.oem_id = oem;
            self.device_info.model_id = model;
            self.device_info.hw_id_hex = format!("0x00{msm:06X}{oem:04X}{model:04X}");

            info!(
                "- MSM HWID : {msm:#x} | model_id:{model:#06x} | oem_id:{oem:#06x} | {}",
                self.device_info.hw_id_hex
            );
        }
    }

    /// V3 SBL info: serial at +0, SBL version at +4, OEM data at +8..15.
    fn parse_sbl_info(&mut self, data: &[u8]) {
        if data.len() >= 4 {
            info!("- SBL Serial : {:#010x}", LittleEndian::read_u32(&data[0..4]));
        }
        if data.len() >= 8 {
            let version = LittleEndian::read_u32(&data[4..8]);
            if version != 0 && version != 0xFFFF_FFFF {
                self.device_info.sbl_version = version;
                info!("- SBL Version : {version:#010x}");
            }
        }
        if data.len() >= 16 {
            let oem1 = LittleEndian::read_u32(&data[8..12]);
            let oem2 = LittleEndian::read_u32(&data[12..16]);
            if oem1 != 0 || oem2 != 0 {
                info!("- SBL OEM Data : {oem1:#010x} {oem2:#010x}");
            }
        }
    }

    // ── Image upload ───────────────────────────────────────────────

    /// Serve a programmer image to the device.
    pub fn upload_loader(&mut self, loader: &[u8]) -> Result<()> {
        self.upload_loader_with_progress(loader, &mut |_, _| {})
    }

    /// Serve a programmer image, reporting `(sent, total)` after each
    /// chunk.
    pub fn upload_loader_with_progress(
        &mut self,
        loader: &[u8],
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        info!("Uploading loader ({} bytes)", loader.len());

        let total = loader.len() as u64;
        let mut sent = 0u64;

        loop {
            let pkt = self.read_packet(UPLOAD_TIMEOUT)?;
            match SaharaCommand::from_u32(Self::packet_command(&pkt)) {
                Some(SaharaCommand::ReadData) if pkt.len() >= 20 => {
                    let offset = u64::from(LittleEndian::read_u32(&pkt[12..16]));
                    let length = u64::from(LittleEndian::read_u32(&pkt[16..20]));
                    self.serve_chunk(loader, offset, length)?;
                    sent += length;
                    progress(sent, total);
                }
                Some(SaharaCommand::ReadData64) if pkt.len() >= 32 => {
                    let offset = LittleEndian::read_u64(&pkt[16..24]);
                    let length = LittleEndian::read_u64(&pkt[24..32]);
                    self.serve_chunk(loader, offset, length)?;
                    sent += length;
                    progress(sent, total);
                }
                Some(SaharaCommand::EndImageTransfer) if pkt.len() >= 16 => {
                    let status = LittleEndian::read_u32(&pkt[12..16]);
                    if status != 0 {
                        return Err(Error::Protocol(format!(
                            "image transfer failed with status {status:#04x}"
                        )));
                    }

                    info!("Image transfer complete, sending Done");
                    self.send_header_only(SaharaCommand::Done)?;

                    match self.read_packet(READ_TIMEOUT) {
                        Ok(resp) if resp.len() >= 12 => {
                            if Self::packet_command(&resp) != SaharaCommand::DoneResponse as u32 {
                                warn!(
                                    "Expected DoneResponse, got {:#04x}",
                                    Self::packet_command(&resp)
                                );
                            }
                            info!(
                                "Done response: imageTxStatus={}",
                                LittleEndian::read_u32(&resp[8..12])
                            );
                        }
                        _ => warn!("No valid DoneResponse received"),
                    }
                    return Ok(());
                }
                _ => {
                    return Err(Error::Protocol(format!(
                        "unexpected command during upload: {:#04x}",
                        Self::packet_command(&pkt)
                    )));
                }
            }
        }
    }

    fn serve_chunk(&mut self, loader: &[u8], offset: u64, length: u64) -> Result<()> {
        let total = loader.len() as u64;
        if offset > total || length > total - offset {
            return Err(Error::Protocol(format!(
                "ReadData out of range: off={offset} len={length} total={total}"
            )));
        }
        // Image chunks are written raw, with no Sahara framing
        self.transport
            .write_all(&loader[offset as usize..(offset + length) as usize])
    }

    // ── Reset ──────────────────────────────────────────────────────

    /// Hard reset (0x07). A missing `ResetResponse` is tolerated: the
    /// device usually drops off the bus immediately.
    pub fn reset(&mut self) -> Result<()> {
        info!("Sending Sahara Hard Reset (0x07)");
        self.send_header_only(SaharaCommand::Reset)?;

        match self.read_packet(Duration::from_secs(2)) {
            Ok(resp) if Self::packet_command(&resp) == SaharaCommand::ResetResponse as u32 => {
                info!("Hard Reset acknowledged by device");
            }
            Ok(_) => {}
            Err(_) => debug!("No reset response (device likely disconnected)"),
        }
        Ok(())
    }

    /// Soft reset (0x13): no response expected, the device resends
    /// `Hello` afterwards.
    pub fn reset_state_machine(&mut self) -> Result<()> {
        info!("Sending Sahara ResetStateMachine (0x13)");
        self.send_header_only(SaharaCommand::ResetStateMachine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{ScriptedTransport, Step};

    fn header(cmd: u32, len: u32) -> Vec<u8> {
        let mut pkt = cmd.to_le_bytes().to_vec();
        pkt.extend_from_slice(&len.to_le_bytes());
        pkt
    }

    fn hello(version: u32, mode: u32) -> Vec<u8> {
        let mut pkt = header(0x01, 48);
        pkt.extend_from_slice(&version.to_le_bytes());
        pkt.extend_from_slice(&1u32.to_le_bytes());
        pkt.extend_from_slice(&0x100u32.to_le_bytes());
        pkt.extend_from_slice(&mode.to_le_bytes());
        pkt.extend_from_slice(&[0u8; 24]);
        pkt
    }

    fn hello_response(mode: u32) -> Vec<u8> {
        let mut pkt = header(0x02, 48);
        pkt.extend_from_slice(&2u32.to_le_bytes());
        pkt.extend_from_slice(&1u32.to_le_bytes());
        pkt.extend_from_slice(&0u32.to_le_bytes());
        pkt.extend_from_slice(&mode.to_le_bytes());
        pkt.extend_from_slice(&[0u8; 24]);
        pkt
    }

    fn execute_pkt(client: u32) -> Vec<u8> {
        let mut pkt = header(0x0D, 12);
        pkt.extend_from_slice(&client.to_le_bytes());
        pkt
    }

    fn execute_data(client: u32, data_len: u32) -> Vec<u8> {
        let mut pkt = header(0x0E, 16);
        pkt.extend_from_slice(&client.to_le_bytes());
        pkt.extend_from_slice(&data_len.to_le_bytes());
        pkt
    }

    fn execute_response(client: u32) -> Vec<u8> {
        let mut pkt = header(0x0F, 12);
        pkt.extend_from_slice(&client.to_le_bytes());
        pkt
    }

    fn switch_mode(mode: u32) -> Vec<u8> {
        let mut pkt = header(0x0C, 12);
        pkt.extend_from_slice(&mode.to_le_bytes());
        pkt
    }

    fn read_data(offset: u32, length: u32) -> Vec<u8> {
        let mut pkt = header(0x03, 20);
        pkt.extend_from_slice(&0u32.to_le_bytes()); // image id
        pkt.extend_from_slice(&offset.to_le_bytes());
        pkt.extend_from_slice(&length.to_le_bytes());
        pkt
    }

    fn end_image_transfer(status: u32) -> Vec<u8> {
        let mut pkt = header(0x04, 16);
        pkt.extend_from_slice(&0u32.to_le_bytes());
        pkt.extend_from_slice(&status.to_le_bytes());
        pkt
    }

    fn done_response(status: u32) -> Vec<u8> {
        let mut pkt = header(0x06, 12);
        pkt.extend_from_slice(&status.to_le_bytes());
        pkt
    }

    /// Exec exchange: the four-step transcript around one command.
    fn exec_exchange(client: u32, payload: &[u8]) -> Vec<Step> {
        vec![
            Step::Expect(execute_pkt(client)),
            Step::Respond(execute_data(client, payload.len() as u32)),
            Step::Expect(execute_response(client)),
            Step::Respond(payload.to_vec()),
        ]
    }

    #[test]
    fn test_hello_then_direct_image_transfer() {
        // Hello -> HelloResponse -> ReadData -> chunk -> End -> Done
        let script = vec![
            Step::Respond(hello(2, 0)),
            Step::Expect(hello_response(0)),
            Step::Respond(read_data(0, 4)),
            Step::Expect(vec![0xAA, 0xBB, 0xCC, 0xDD]),
            Step::Respond(end_image_transfer(0)),
            Step::Expect(header(0x05, 8)),
            Step::Respond(done_response(0)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let mut client = SaharaClient::new(&mut transport).with_chip_info_probe(false);
        client.handshake(SaharaMode::ImageTransferPending).unwrap();
        assert_eq!(client.device_sahara_version(), 2);

        client
            .upload_loader(&[0xAA, 0xBB, 0xCC, 0xDD])
            .unwrap();
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_execute_four_step_yields_raw_data() {
        let payload = [0x11, 0x22, 0x33, 0x44];
        let mut transport = ScriptedTransport::new(exec_exchange(0x01, &payload));

        let mut client = SaharaClient::new(&mut transport);
        let data = client.read_chip_info(SaharaExecCommand::SerialNumRead).unwrap();
        assert_eq!(data, payload);
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_execute_rejects_wrong_response_command() {
        // Device answers CommandReady instead of ExecuteData
        let script = vec![
            Step::Expect(execute_pkt(0x01)),
            Step::Respond(header(0x0B, 8)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let mut client = SaharaClient::new(&mut transport);
        let err = client
            .read_chip_info(SaharaExecCommand::SerialNumRead)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_identity_read_v2_command_order() {
        // v2: 0x01, 0x03, then 0x02 and 0x07 -- never 0x0A/0x06
        let hwid: u64 = 0x0007_00C1_009B_00E1;
        let mut script = vec![
            Step::Respond(hello(2, 0)),
            Step::Expect(hello_response(3)), // Command mode request
            Step::Respond(header(0x0B, 8)),  // CommandReady
        ];
        script.extend(exec_exchange(0x01, &0x12345678u32.to_le_bytes()));
        script.extend(exec_exchange(0x03, &[0x5A; 48]));
        script.extend(exec_exchange(0x02, &hwid.to_le_bytes()));
        script.extend(exec_exchange(0x07, &0x00020001u32.to_le_bytes()));
        script.push(Step::Expect(switch_mode(0)));
        script.push(Step::Respond(hello(2, 0)));
        script.push(Step::Expect(hello_response(0)));

        let mut transport = ScriptedTransport::new(script);
        let mut client = SaharaClient::new(&mut transport);
        client.handshake(SaharaMode::ImageTransferPending).unwrap();

        let info = client.device_info();
        assert!(info.chip_info_read);
        assert_eq!(info.serial, 0x12345678);
        assert_eq!(info.serial_hex, "0x12345678");
        assert_eq!(info.pk_hash.len(), 48);
        assert_eq!(info.msm_id, 0x009B00E1);
        assert_eq!(info.oem_id, 0x00C1);
        assert_eq!(info.model_id, 0x0007);
        assert_eq!(info.hw_id_hex, "0x000700C1009B00E1");
        assert_eq!(info.sbl_version, 0x00020001);
        assert_eq!(info.chip_name, "SM8250");
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_identity_read_v3_alternate_oem() {
        // v3: 0x01, 0x03, then 0x0A and 0x06 -- never 0x02/0x07/0x08
        let mut ext = vec![0u8; 46];
        ext[0..4].copy_from_slice(&0x11223344u32.to_le_bytes());
        ext[36..40].copy_from_slice(&0x000BA0E1u32.to_le_bytes());
        // oem at +40 left zero; alternate at +44
        ext[42..44].copy_from_slice(&0x0007u16.to_le_bytes());
        ext[44..46].copy_from_slice(&0x00C1u16.to_le_bytes());

        let mut sbl_info = vec![0u8; 8];
        sbl_info[0..4].copy_from_slice(&0xCAFEBABEu32.to_le_bytes());
        sbl_info[4..8].copy_from_slice(&0x01000200u32.to_le_bytes());

        let mut script = vec![
            Step::Respond(hello(3, 0)),
            Step::Expect(hello_response(3)),
            Step::Respond(header(0x0B, 8)),
        ];
        script.extend(exec_exchange(0x01, &0xAABBCCDDu32.to_le_bytes()));
        script.extend(exec_exchange(0x03, &[0x33; 48]));
        script.extend(exec_exchange(0x0A, &ext));
        script.extend(exec_exchange(0x06, &sbl_info));
        script.push(Step::Expect(switch_mode(0)));
        script.push(Step::Respond(hello(3, 0)));
        script.push(Step::Expect(hello_response(0)));

        let mut transport = ScriptedTransport::new(script);
        let mut client = SaharaClient::new(&mut transport);
        client.handshake(SaharaMode::ImageTransferPending).unwrap();

        let info = client.device_info();
        assert_eq!(info.msm_id, 0x000BA0E1);
        assert_eq!(info.oem_id, 0x00C1);
        assert_eq!(info.model_id, 0x0007);
        assert_eq!(info.hw_id_hex, "0x000BA0E100C10007");
        assert_eq!(info.sbl_version, 0x01000200);
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_command_mode_rejected_falls_back_to_upload() {
        // Device answers the Command request with ReadData: engine must
        // remember the rejection and serve the image
        let script = vec![
            Step::Respond(hello(2, 0)),
            Step::Expect(hello_response(3)),
            Step::Respond(read_data(0, 2)),
            Step::Expect(hello_response(0)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let mut client = SaharaClient::new(&mut transport);
        client.handshake(SaharaMode::ImageTransferPending).unwrap();
        assert!(!client.device_info().chip_info_read);
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_reset_tolerates_missing_response() {
        let script = vec![Step::Expect(header(0x07, 8))];
        let mut transport = ScriptedTransport::new(script);

        let mut client = SaharaClient::new(&mut transport);
        client.reset().unwrap();
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_upload_rejects_out_of_range_request() {
        let script = vec![
            Step::Respond(read_data(8, 100)), // Past the 4-byte loader
        ];
        let mut transport = ScriptedTransport::new(script);

        let mut client = SaharaClient::new(&mut transport);
        let err = client.upload_loader(&[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_oversized_packet_is_malformed() {
        let script = vec![Step::Respond(header(0x03, 0x20000))];
        let mut transport = ScriptedTransport::new(script);

        let mut client = SaharaClient::new(&mut transport);
        let err = client.upload_loader(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, Error::MalformedPacket(_)));
    }
}
