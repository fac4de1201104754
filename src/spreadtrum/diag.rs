//! Spreadtrum Diag protocol engine.
//!
//! Diag runs over the Spreadtrum HDLC envelope with a single-byte
//! command carried in the frame type. Responses come back as
//! `cmd (u8) | status (u8) | data…` with `status == 0x00` meaning OK;
//! NV operations carry an additional big-endian item ID in the payload.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::info;

use crate::codec::hdlc::{sprd_decode, sprd_encode};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Diag command types.
pub mod cmd {
    /// Connectivity test.
    pub const CONNECT: u8 = 0x00;
    /// Read an NV item.
    pub const READ_NV: u8 = 0x01;
    /// Write an NV item.
    pub const WRITE_NV: u8 = 0x02;
    /// Read an IMEI slot.
    pub const READ_IMEI: u8 = 0x03;
    /// Write an IMEI slot.
    pub const WRITE_IMEI: u8 = 0x04;
    /// Read the firmware version string.
    pub const READ_VERSION: u8 = 0x05;
    /// Read the factory phase-check block.
    pub const READ_PHASE: u8 = 0x06;
    /// Enter calibration mode.
    pub const SET_CALIBRATION: u8 = 0x07;
    /// Normal reset.
    pub const RESET: u8 = 0x0A;
    /// Power the device off.
    pub const POWER_OFF: u8 = 0x0B;
    /// Read the chip ID.
    pub const READ_CHIPID: u8 = 0x0C;
    /// SIM lock operation.
    pub const SIM_LOCK: u8 = 0x0D;
    /// SIM unlock operation.
    pub const SIM_UNLOCK: u8 = 0x0E;
    /// Delete an NV item.
    pub const DELETE_NV: u8 = 0x0F;
    /// Read battery state.
    pub const READ_BATTERY: u8 = 0x10;
    /// Read an ADC channel.
    pub const READ_ADC: u8 = 0x11;

    /// Response status: success.
    pub const RESP_OK: u8 = 0x00;
    /// Response status: failure.
    pub const RESP_ERROR: u8 = 0xFF;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_FRAME_SIZE: usize = 4096;

/// One NV item read from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SprdNvItem {
    /// NV item ID.
    pub id: u16,
    /// Item payload.
    pub data: Vec<u8>,
}

/// Factory phase-check record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SprdPhaseCheck {
    /// Factory serial number.
    pub sn: String,
    /// Test station identifier.
    pub station: String,
    /// Raw flag word.
    pub flags: u32,
    /// Whether the phase check passed.
    pub passed: bool,
}

/// Spreadtrum Diag client driving one device over a transport.
pub struct SprdDiagClient<'a, T: Transport> {
    transport: &'a mut T,
    transcode: bool,
}

impl<'a, T: Transport> SprdDiagClient<'a, T> {
    /// Create a client over an open transport. Transcoding (HDLC
    /// escaping) starts enabled, matching a freshly booted device.
    pub fn new(transport: &'a mut T) -> Self {
        Self {
            transport,
            transcode: true,
        }
    }

    fn send_command(&mut self, command: u8, payload: &[u8]) -> Result<()> {
        let frame = sprd_encode(u16::from(command), payload, self.transcode);
        self.transport.write_all(&frame)
    }

    /// Read one response and flatten it into `cmd | status | data…`.
    ///
    /// The device places the command echo and status in the frame-type
    /// word (high and low byte respectively); the payload follows.
    fn recv_response(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let raw = self.transport.read(MAX_FRAME_SIZE, timeout)?;
        if raw.is_empty() {
            return Err(Error::Timeout("Diag response timeout".to_string()));
        }

        let frame = sprd_decode(&raw, self.transcode)?;
        let mut resp = frame.frame_type.to_be_bytes().to_vec();
        resp.extend_from_slice(&frame.payload);
        Ok(resp)
    }

    fn roundtrip(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        self.send_command(command, payload)?;
        self.recv_response(DEFAULT_TIMEOUT)
    }

    fn check_ok(resp: &[u8]) -> Result<()> {
        if resp.len() < 2 {
            return Err(Error::MalformedPacket(format!(
                "Diag response too short: {} bytes",
                resp.len()
            )));
        }
        if resp[1] != cmd::RESP_OK {
            return Err(Error::Protocol(format!(
                "Diag command {:#04x} failed with status {:#04x}",
                resp[0], resp[1]
            )));
        }
        Ok(())
    }

    // ── Connection ─────────────────────────────────────────────────

    /// Probe the Diag link with a connect command.
    pub fn connect(&mut self) -> Result<()> {
        info!("Connecting via Diag protocol...");
        let resp = self.roundtrip(cmd::CONNECT, &[])?;
        Self::check_ok(&resp)
    }

    // ── NV operations ──────────────────────────────────────────────

    /// Read an NV item.
    pub fn read_nv_item(&mut self, item_id: u16) -> Result<SprdNvItem> {
        let mut payload = [0u8; 2];
        BigEndian::write_u16(&mut payload, item_id);

        let resp = self.roundtrip(cmd::READ_NV, &payload)?;
        Self::check_ok(&resp)?;

        Ok(SprdNvItem {
            id: item_id,
            data: resp[2..].to_vec(),
        })
    }

    /// Write an NV item.
    pub fn write_nv_item(&mut self, item_id: u16, data: &[u8]) -> Result<()> {
        let mut payload = item_id.to_be_bytes().to_vec();
        payload.extend_from_slice(data);

        let resp = self.roundtrip(cmd::WRITE_NV, &payload)?;
        Self::check_ok(&resp)
    }

    /// Delete an NV item via the dedicated delete command.
    pub fn delete_nv_item(&mut self, item_id: u16) -> Result<()> {
        let resp = self.roundtrip(cmd::DELETE_NV, &item_id.to_be_bytes())?;
        Self::check_ok(&resp)
    }

    // ── IMEI ───────────────────────────────────────────────────────

    /// Read the IMEI bytes of a SIM slot.
    pub fn read_imei(&mut self, sim_slot: u8) -> Result<Vec<u8>> {
        let resp = self.roundtrip(cmd::READ_IMEI, &[sim_slot])?;
        Self::check_ok(&resp)?;
        if resp.len() <= 2 {
            return Err(Error::Protocol("empty IMEI response".to_string()));
        }
        Ok(resp[2..].to_vec())
    }

    /// Write the IMEI bytes of a SIM slot.
    pub fn write_imei(&mut self, sim_slot: u8, imei: &[u8]) -> Result<()> {
        let mut payload = vec![sim_slot];
        payload.extend_from_slice(imei);

        let resp = self.roundtrip(cmd::WRITE_IMEI, &payload)?;
        Self::check_ok(&resp)
    }

    // ── Device info ────────────────────────────────────────────────

    /// Read the firmware version string.
    pub fn read_version(&mut self) -> Result<String> {
        let resp = self.roundtrip(cmd::READ_VERSION, &[])?;
        Self::check_ok(&resp)?;
        Ok(String::from_utf8_lossy(&resp[2..]).into_owned())
    }

    /// Read the raw chip ID bytes.
    pub fn read_chip_id(&mut self) -> Result<Vec<u8>> {
        let resp = self.roundtrip(cmd::READ_CHIPID, &[])?;
        Self::check_ok(&resp)?;
        Ok(resp[2..].to_vec())
    }

    /// Read and parse the factory phase-check block:
    /// `sn[24] | station[8] | flags_be32 | passed_u8`.
    pub fn read_phase_check(&mut self) -> Result<SprdPhaseCheck> {
        let resp = self.roundtrip(cmd::READ_PHASE, &[])?;
        Self::check_ok(&resp)?;

        let data = &resp[2..];
        if data.len() < 37 {
            return Err(Error::MalformedPacket(format!(
                "phase check block too short: {} bytes",
                data.len()
            )));
        }

        Ok(SprdPhaseCheck {
            sn: latin1_trimmed(&data[0..24]),
            station: latin1_trimmed(&data[24..32]),
            flags: BigEndian::read_u32(&data[32..36]),
            passed: data[36] != 0,
        })
    }

    // ── Control ────────────────────────────────────────────────────

    /// Reset the device. No response is expected; the device drops off
    /// the bus.
    pub fn reset(&mut self) -> Result<()> {
        info!("Sending Diag reset");
        self.send_command(cmd::RESET, &[])
    }

    /// Power the device off. No response is expected.
    pub fn power_off(&mut self) -> Result<()> {
        info!("Sending Diag power-off");
        self.send_command(cmd::POWER_OFF, &[])
    }

    /// Switch the modem into calibration mode.
    pub fn enter_calibration_mode(&mut self) -> Result<()> {
        info!("Entering calibration mode...");
        let resp = self.roundtrip(cmd::SET_CALIBRATION, &[])?;
        Self::check_ok(&resp)
    }
}

/// Decode Latin-1 bytes, trimming NULs and surrounding whitespace.
fn latin1_trimmed(bytes: &[u8]) -> String {
    let text: String = bytes.iter().map(|&b| b as char).collect();
    text.trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{ScriptedTransport, Step};

    fn request(command: u8, payload: &[u8]) -> Vec<u8> {
        sprd_encode(u16::from(command), payload, true)
    }

    fn response(command: u8, status: u8, data: &[u8]) -> Vec<u8> {
        sprd_encode((u16::from(command) << 8) | u16::from(status), data, true)
    }

    #[test]
    fn test_connect_ok() {
        let script = vec![
            Step::Expect(request(cmd::CONNECT, &[])),
            Step::Respond(response(cmd::CONNECT, cmd::RESP_OK, &[])),
        ];
        let mut transport = ScriptedTransport::new(script);

        SprdDiagClient::new(&mut transport).connect().unwrap();
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_connect_error_status() {
        let script = vec![
            Step::Expect(request(cmd::CONNECT, &[])),
            Step::Respond(response(cmd::CONNECT, cmd::RESP_ERROR, &[])),
        ];
        let mut transport = ScriptedTransport::new(script);

        let err = SprdDiagClient::new(&mut transport).connect().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_read_nv_item() {
        let script = vec![
            Step::Expect(request(cmd::READ_NV, &[0x02, 0x26])),
            Step::Respond(response(cmd::READ_NV, cmd::RESP_OK, &[0xCA, 0xFE])),
        ];
        let mut transport = ScriptedTransport::new(script);

        let item = SprdDiagClient::new(&mut transport)
            .read_nv_item(0x0226)
            .unwrap();
        assert_eq!(item.id, 0x0226);
        assert_eq!(item.data, [0xCA, 0xFE]);
    }

    #[test]
    fn test_write_nv_item_carries_item_and_data() {
        let script = vec![
            Step::Expect(request(cmd::WRITE_NV, &[0x00, 0x05, 0x01, 0x02, 0x03])),
            Step::Respond(response(cmd::WRITE_NV, cmd::RESP_OK, &[])),
        ];
        let mut transport = ScriptedTransport::new(script);

        SprdDiagClient::new(&mut transport)
            .write_nv_item(0x0005, &[0x01, 0x02, 0x03])
            .unwrap();
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_delete_nv_uses_dedicated_command() {
        // Delete must be distinguishable from a write before the
        // device parses the payload: different command byte, payload
        // carrying only the target item ID
        assert_ne!(
            request(cmd::DELETE_NV, &[0x00, 0x05]),
            request(cmd::WRITE_NV, &[0x00, 0x05])
        );

        let script = vec![
            Step::Expect(request(cmd::DELETE_NV, &[0x00, 0x05])),
            Step::Respond(response(cmd::DELETE_NV, cmd::RESP_OK, &[])),
        ];
        let mut transport = ScriptedTransport::new(script);

        SprdDiagClient::new(&mut transport)
            .delete_nv_item(0x0005)
            .unwrap();
        assert!(transport.is_exhausted());
    }

    #[test]
    fn test_read_imei_slot() {
        let imei_bytes = [0x08, 0x1A, 0x32, 0x54, 0x76, 0x98, 0x10, 0x32, 0x54];
        let script = vec![
            Step::Expect(request(cmd::READ_IMEI, &[0])),
            Step::Respond(response(cmd::READ_IMEI, cmd::RESP_OK, &imei_bytes)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let imei = SprdDiagClient::new(&mut transport).read_imei(0).unwrap();
        assert_eq!(imei, imei_bytes);
    }

    #[test]
    fn test_read_version_string() {
        let script = vec![
            Step::Expect(request(cmd::READ_VERSION, &[])),
            Step::Respond(response(cmd::READ_VERSION, cmd::RESP_OK, b"SC9863A-V1.2")),
        ];
        let mut transport = ScriptedTransport::new(script);

        let version = SprdDiagClient::new(&mut transport).read_version().unwrap();
        assert_eq!(version, "SC9863A-V1.2");
    }

    #[test]
    fn test_phase_check_parse() {
        let mut block = Vec::new();
        block.extend_from_slice(b"SN1234567890");
        block.extend_from_slice(&[0u8; 12]); // NUL padding to 24
        block.extend_from_slice(b"ST-07\0\0\0");
        block.extend_from_slice(&0x00010203u32.to_be_bytes());
        block.push(1);

        let script = vec![
            Step::Expect(request(cmd::READ_PHASE, &[])),
            Step::Respond(response(cmd::READ_PHASE, cmd::RESP_OK, &block)),
        ];
        let mut transport = ScriptedTransport::new(script);

        let phase = SprdDiagClient::new(&mut transport)
            .read_phase_check()
            .unwrap();
        assert_eq!(phase.sn, "SN1234567890");
        assert_eq!(phase.station, "ST-07");
        assert_eq!(phase.flags, 0x00010203);
        assert!(phase.passed);
    }

    #[test]
    fn test_reset_expects_no_response() {
        let script = vec![Step::Expect(request(cmd::RESET, &[]))];
        let mut transport = ScriptedTransport::new(script);

        SprdDiagClient::new(&mut transport).reset().unwrap();
        assert!(transport.is_exhausted());
    }
}
