//! Qualcomm Diag protocol engine.
//!
//! Diag commands travel inside HDLC frames with a trailing little-endian
//! CRC-16/CCITT. Responses are collected by a polling accumulator: raw
//! bytes are buffered until a complete frame appears, then the first
//! frame is decoded (with CRC validation) and returned.
//!
//! Covers connectivity, SPC/password unlock, NV item access, BCD IMEI
//! handling per 3GPP TS 23.003, QCN backup and EFS2 file reads via the
//! filesystem subsystem dispatch.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::codec::hdlc;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Diag command bytes.
pub mod cmd {
    /// Version information request.
    pub const VERNO: u8 = 0x00;
    /// Status request.
    pub const STATUS: u8 = 0x0C;
    /// Security freeze.
    pub const SECURITY_FREEZE: u8 = 0x15;
    /// NV item read.
    pub const NV_READ: u8 = 0x26;
    /// NV item write.
    pub const NV_WRITE: u8 = 0x27;
    /// Mode reset (reboot).
    pub const REBOOT: u8 = 0x29;
    /// Switch to download (EDL) mode.
    pub const DLOAD: u8 = 0x3A;
    /// Service Programming Code check.
    pub const SPC: u8 = 0x41;
    /// Security password check.
    pub const PASSWORD: u8 = 0x46;
    /// Subsystem dispatch.
    pub const SUBSYS: u8 = 0x4B;
    /// Log configuration.
    pub const LOG_CONFIG: u8 = 0x73;
    /// Extended NV read.
    pub const NV_READ_EXT: u8 = 0x85;
    /// Extended NV write.
    pub const NV_WRITE_EXT: u8 = 0x86;
}

/// Well-known NV item IDs.
pub mod nv {
    /// Electronic serial number.
    pub const ESN: u16 = 0;
    /// Service programming code.
    pub const SPC: u16 = 85;
    /// Band preference.
    pub const BAND_PREF: u16 = 441;
    /// IMEI, first subscription. Slot 2 is the next item.
    pub const IMEI: u16 = 550;
    /// Mobile equipment identifier.
    pub const MEID: u16 = 4678;
    /// OEM lock state.
    pub const OEM_LOCK: u16 = 7121;
}

/// EFS2 subsystem dispatch constants.
mod efs {
    /// Filesystem subsystem ID under `SUBSYS`.
    pub const SUBSYS_FS: u8 = 0x13;
    /// Open a file.
    pub const OPEN: u16 = 0x0001;
    /// Read from an open file.
    pub const READ: u16 = 0x0003;
    /// Close an open file.
    pub const CLOSE: u16 = 0x0004;
    /// Bytes requested per read.
    pub const READ_CHUNK: u32 = 512;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const NV_DATA_SIZE: usize = 128;
const NV_ITEM_LIMIT: u16 = 7000;

/// NV operation completed successfully.
const NV_STATUS_DONE: u16 = 0;

/// Software identity read over Diag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagDeviceInfo {
    /// Electronic serial number as hex.
    pub esn: String,
    /// Mobile equipment identifier as hex.
    pub meid: String,
    /// Firmware version directory string.
    pub sw_version: String,
    /// Firmware compile date.
    pub comp_date: String,
    /// Firmware compile time.
    pub comp_time: String,
    /// Mobile model number.
    pub model_id: String,
}

/// Qualcomm Diag client driving one device over a transport.
pub struct DiagClient<'a, T: Transport> {
    transport: &'a mut T,
    connected: bool,
    spc_unlocked: bool,
}

impl<'a, T: Transport> DiagClient<'a, T> {
    /// Create a client over an open transport.
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            connected: false,
            spc_unlocked: false,
        }
    }

    /// True after a successful [`Self::connect`].
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    // ── Low-level exchange ─────────────────────────────────────────

    /// Send one HDLC-framed command and collect the first response
    /// frame within `timeout`.
    fn send_command_timeout(&mut self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let frame = hdlc::encode(payload, true);
        self.transport.write_all(&frame)?;

        let mut buffer = Vec::new();
        let mut elapsed = Duration::ZERO;
        while elapsed < timeout {
            let chunk = self.transport.read(4096, POLL_INTERVAL)?;
            if !chunk.is_empty() {
                buffer.extend_from_slice(&chunk);
                let frames = hdlc::extract_frames(&buffer);
                if let Some(first) = frames.first() {
                    return hdlc::decode(first, true);
                }
            }
            elapsed += POLL_INTERVAL;
        }

        Err(Error::Timeout("Diag response timeout".to_string()))
    }

    fn send_command(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send_command_timeout(payload, DEFAULT_TIMEOUT)
    }

    // ── Connection ─────────────────────────────────────────────────

    /// Probe the Diag interface with a version request.
    pub fn connect(&mut self) -> Result<()> {
        info!("Connecting to Diag interface");

        let resp = self.send_command(&[cmd::VERNO])?;
        if resp.first() != Some(&cmd::VERNO) {
            return Err(Error::Protocol(format!(
                "unexpected Diag response {:#04x?}",
                resp.first()
            )));
        }

        self.connected = true;
        info!("Diag connection established");
        Ok(())
    }

    /// Forget the connection state.
    pub fn disconnect(&mut self) {
        self.connected = false;
        self.spc_unlocked = false;
    }

    // ── SPC / security ─────────────────────────────────────────────

    /// Send the 6-digit Service Programming Code, right-padded with
    /// `'0'` when shorter.
    pub fn send_spc(&mut self, code: &str) -> Result<()> {
        info!("Sending SPC");

        if code.len() > 6 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidInput(format!("bad SPC code: {code:?}")));
        }

        let mut payload = vec![cmd::SPC];
        payload.extend_from_slice(code.as_bytes());
        payload.resize(7, b'0');

        let resp = self.send_command(&payload)?;
        if resp.first() != Some(&cmd::SPC) {
            return Err(Error::Protocol("SPC: unexpected command echo".to_string()));
        }
        if resp.get(1) != Some(&1) {
            return Err(Error::Protocol("SPC rejected".to_string()));
        }

        self.spc_unlocked = true;
        info!("SPC accepted");
        Ok(())
    }

    /// Send the 8-byte security password, zero-padded.
    pub fn send_password(&mut self, password: &str) -> Result<()> {
        info!("Sending security password");

        let mut payload = vec![cmd::PASSWORD];
        let mut bytes = password.as_bytes().to_vec();
        bytes.resize(8, 0);
        payload.extend_from_slice(&bytes);

        let resp = self.send_command(&payload)?;
        if resp.get(1) != Some(&1) {
            return Err(Error::Protocol("password rejected".to_string()));
        }

        self.spc_unlocked = true;
        info!("Password accepted");
        Ok(())
    }

    // ── NV items ───────────────────────────────────────────────────

    /// Read an NV item's 128-byte data field.
    pub fn read_nv(&mut self, item: u16) -> Result<Vec<u8>> {
        let mut payload = vec![cmd::NV_READ];
        payload.extend_from_slice(&item.to_le_bytes());
        payload.extend_from_slice(&[0u8; NV_DATA_SIZE]);
        payload.extend_from_slice(&0u16.to_le_bytes());

        let resp = self.send_command(&payload)?;
        self.parse_nv_response(cmd::NV_READ, item, &resp)
    }

    /// Write an NV item, zero-padding `data` to the 128-byte field.
    pub fn write_nv(&mut self, item: u16, data: &[u8]) -> Result<()> {
        if data.len() > NV_DATA_SIZE {
            return Err(Error::InvalidInput(format!(
                "NV data too long: {} bytes",
                data.len()
            )));
        }
        if !self.spc_unlocked {
            warn!("SPC not unlocked, NV write may fail");
        }

        let mut payload = vec![cmd::NV_WRITE];
        payload.extend_from_slice(&item.to_le_bytes());
        payload.extend_from_slice(data);
        payload.resize(1 + 2 + NV_DATA_SIZE, 0);
        payload.extend_from_slice(&0u16.to_le_bytes());

        let resp = self.send_command(&payload)?;
        self.parse_nv_response(cmd::NV_WRITE, item, &resp)?;
        info!("NV item {item} written");
        Ok(())
    }

    /// Validate an NV response and return its 128-byte data field.
    fn parse_nv_response(&self, command: u8, item: u16, resp: &[u8]) -> Result<Vec<u8>> {
        if resp.len() < 1 + 2 + NV_DATA_SIZE {
            return Err(Error::MalformedPacket(format!(
                "NV response too short: {} bytes",
                resp.len()
            )));
        }
        if resp[0] != command {
            return Err(Error::Protocol(format!(
                "NV response echoes {:#04x}, expected {command:#04x}",
                resp[0]
            )));
        }

        let resp_item = LittleEndian::read_u16(&resp[1..3]);
        if resp_item != item {
            warn!("NV item mismatch: requested {item}, got {resp_item}");
        }

        if resp.len() >= 1 + 2 + NV_DATA_SIZE + 2 {
            let status = LittleEndian::read_u16(&resp[1 + 2 + NV_DATA_SIZE..]);
            if status != NV_STATUS_DONE {
                return Err(Error::Protocol(format!(
                    "NV item {item} status {status}"
                )));
            }
        }

        Ok(resp[3..3 + NV_DATA_SIZE].to_vec())
    }

    // ── IMEI ───────────────────────────────────────────────────────

    /// Read and decode the IMEI of subscription slot 1 or 2.
    pub fn read_imei(&mut self, slot: u8) -> Result<String> {
        let data = self.read_nv(imei_item(slot)?)?;
        decode_imei(&data)
    }

    /// Encode and write an IMEI into subscription slot 1 or 2.
    pub fn write_imei(&mut self, slot: u8, imei: &str) -> Result<()> {
        if !self.spc_unlocked {
            warn!("SPC not unlocked, IMEI write may be rejected");
        }
        let encoded = encode_imei(imei)?;
        self.write_nv(imei_item(slot)?, &encoded)
    }

    // ── Device info ────────────────────────────────────────────────

    /// Read software identity: version block plus ESN/MEID NV items.
    pub fn read_device_info(&mut self) -> Result<DiagDeviceInfo> {
        let mut info = DiagDeviceInfo::default();

        let resp = self.send_command(&[cmd::VERNO])?;
        if resp.len() >= 53 {
            info.comp_date = ascii_trimmed(&resp[1..12]);
            info.comp_time = ascii_trimmed(&resp[12..20]);
            info.sw_version = ascii_trimmed(&resp[39..47]);
            info.model_id = resp[48].to_string();
        }

        if let Ok(esn) = self.read_nv(nv::ESN) {
            if esn.len() >= 4 {
                info.esn = format!("0x{:08x}", LittleEndian::read_u32(&esn[0..4]));
            }
        }
        if let Ok(meid) = self.read_nv(nv::MEID) {
            if meid.len() >= 7 {
                info.meid = meid[..7]
                    .iter()
                    .map(|b| format!("{b:02X}"))
                    .collect();
            }
        }

        Ok(info)
    }

    // ── QCN backup ─────────────────────────────────────────────────

    /// Dump every standard NV item (0..7000) as QCN records.
    pub fn read_qcn(&mut self, progress: &mut dyn FnMut(u16, u16)) -> Result<Vec<u8>> {
        self.read_qcn_range(0, NV_ITEM_LIMIT, progress)
    }

    /// Dump an NV item range as QCN records:
    /// `(item_u16_le, data_len_u16_le, data)` concatenated, no header.
    ///
    /// Items the device refuses are skipped; the dump that far is kept.
    pub fn read_qcn_range(
        &mut self,
        start: u16,
        end: u16,
        progress: &mut dyn FnMut(u16, u16),
    ) -> Result<Vec<u8>> {
        info!("Reading QCN backup, items {start}..{end}");

        let mut out = Vec::new();
        let mut success = 0u32;

        for item in start..end {
            if let Ok(data) = self.read_nv(item) {
                out.extend_from_slice(&item.to_le_bytes());
                out.extend_from_slice(&(data.len() as u16).to_le_bytes());
                out.extend_from_slice(&data);
                success += 1;
            }

            if item % 500 == 0 {
                progress(item, end);
                debug!("QCN progress: {item}/{end} ({success} items read)");
            }
        }

        info!("QCN backup complete: {success} NV items");
        Ok(out)
    }

    // ── EFS2 ───────────────────────────────────────────────────────

    /// Read a file from the EFS2 filesystem via the subsystem dispatch
    /// (command `0x4B`, subsystem `0x13`): OPEN, chunked READ, CLOSE.
    ///
    /// Read-loop anomalies terminate the loop and the data collected so
    /// far is returned.
    pub fn efs_read(&mut self, path: &str) -> Result<Vec<u8>> {
        if path.is_empty() {
            return Err(Error::InvalidInput("empty EFS path".to_string()));
        }
        info!("EFS read: {path}");

        // OPEN: oflag=O_RDONLY, mode=0, NUL-terminated path
        let mut open_cmd = vec![cmd::SUBSYS, efs::SUBSYS_FS];
        open_cmd.extend_from_slice(&efs::OPEN.to_le_bytes());
        open_cmd.extend_from_slice(&0u32.to_le_bytes());
        open_cmd.extend_from_slice(&0u32.to_le_bytes());
        open_cmd.extend_from_slice(path.as_bytes());
        open_cmd.push(0);

        // Response: [cmd, subsys, subcmd(2), fd(4), errno(4)]
        let open_resp = self.send_command(&open_cmd)?;
        if open_resp.len() < 12 {
            return Err(Error::MalformedPacket(format!(
                "EFS open response too short: {} bytes",
                open_resp.len()
            )));
        }
        let fd = LittleEndian::read_i32(&open_resp[4..8]);
        let errno = LittleEndian::read_i32(&open_resp[8..12]);
        if fd < 0 || errno != 0 {
            return Err(Error::Protocol(format!(
                "EFS open failed: fd={fd} errno={errno}"
            )));
        }
        debug!("EFS file opened: fd={fd}");

        // READ until a short chunk or an error terminates the loop
        let mut data = Vec::new();
        loop {
            let mut read_cmd = vec![cmd::SUBSYS, efs::SUBSYS_FS];
            read_cmd.extend_from_slice(&efs::READ.to_le_bytes());
            read_cmd.extend_from_slice(&fd.to_le_bytes());
            read_cmd.extend_from_slice(&efs::READ_CHUNK.to_le_bytes());
            read_cmd.extend_from_slice(&(data.len() as u32).to_le_bytes());

            // Response: [cmd, subsys, subcmd(2), fd(4), offset(4),
            //            bytes_read(4), errno(4), data...]
            let Ok(read_resp) = self.send_command(&read_cmd) else {
                break;
            };
            if read_resp.len() < 20 {
                break;
            }

            let bytes_read = LittleEndian::read_i32(&read_resp[12..16]);
            let read_errno = LittleEndian::read_i32(&read_resp[16..20]);
            if bytes_read <= 0 || read_errno != 0 {
                break;
            }

            let available = read_resp.len() - 20;
            let take = (bytes_read as usize).min(available);
            data.extend_from_slice(&read_resp[20..20 + take]);

            if (bytes_read as u32) < efs::READ_CHUNK {
                break;
            }
        }

        // CLOSE: best effort
        let mut close_cmd = vec![cmd::SUBSYS, efs::SUBSYS_FS];
        close_cmd.extend_from_slice(&efs::CLOSE.to_le_bytes());
        close_cmd.extend_from_slice(&fd.to_le_bytes());
        let _ = self.send_command(&close_cmd);

        info!("EFS read complete: {} bytes from {path}", data.len());
        Ok(data)
    }

    // ── Mode switching ─────────────────────────────────────────────

    /// Switch the device into download (EDL) mode. It drops off the
    /// bus and reappears speaking Sahara.
    pub fn switch_to_download_mode(&mut self) -> Result<()> {
        info!("Switching to download mode");
        let resp = self.send_command(&[cmd::DLOAD])?;
        if resp.is_empty() {
            return Err(Error::Protocol("no response to DLOAD".to_string()));
        }
        Ok(())
    }

    /// Reboot the device. Delivery of the command is the success
    /// criterion: the device disconnects without replying.
    pub fn reboot(&mut self) -> Result<()> {
        info!("Sending reboot command");
        match self.send_command(&[cmd::REBOOT, 0x00, 0x00]) {
            Ok(_) | Err(Error::Timeout(_)) => {
                info!("Reboot command sent, device will disconnect");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn imei_item(slot: u8) -> Result<u16> {
    match slot {
        1 => Ok(nv::IMEI),
        2 => Ok(nv::IMEI + 1),
        _ => Err(Error::InvalidInput(format!("IMEI slot {slot} out of range"))),
    }
}

/// Encode an IMEI digit string into the NV BCD layout of
/// 3GPP TS 23.003: length byte `0x08`, then `0x0A | (digit1 << 4)`
/// (type nibble `0xA` marks an IMEI), then packed digit pairs with a
/// final `0xF` pad nibble for even-length input.
pub fn encode_imei(imei: &str) -> Result<Vec<u8>> {
    if imei.len() < 14 || imei.len() > 15 || !imei.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidInput(format!("bad IMEI: {imei:?}")));
    }

    let digits: Vec<u8> = imei.bytes().map(|b| b - b'0').collect();

    let mut out = vec![0x08, 0x0A | (digits[0] << 4)];
    let mut i = 1;
    while i < digits.len() {
        let lo = digits[i];
        let hi = if i + 1 < digits.len() { digits[i + 1] } else { 0xF };
        out.push(lo | (hi << 4));
        i += 2;
    }
    out.resize(9, 0);
    Ok(out)
}

/// Decode a BCD IMEI read from an NV item back into its digit string.
pub fn decode_imei(data: &[u8]) -> Result<String> {
    if data.len() < 9 {
        return Err(Error::MalformedPacket(format!(
            "IMEI record too short: {} bytes",
            data.len()
        )));
    }

    let mut imei = String::new();
    imei.push(char::from(b'0' + ((data[1] >> 4) & 0x0F)));

    for &byte in &data[2..=8] {
        let lo = byte & 0x0F;
        let hi = (byte >> 4) & 0x0F;
        if lo < 10 {
            imei.push(char::from(b'0' + lo));
        }
        if hi < 10 {
            imei.push(char::from(b'0' + hi));
        }
    }

    Ok(imei)
}

fn ascii_trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}
