//! MediaTek BROM echo-protocol engine.
//!
//! The BootROM speaks a byte-oriented protocol with full-duplex echo:
//! every command byte and parameter word the host sends is echoed back
//! by the device, and the echo must be consumed before the next write or
//! the link desynchronises permanently. Commands are single bytes,
//! parameters are big-endian 32-bit words, and most operations finish
//! with a big-endian 16-bit status (`0x0000` OK, `0x0069` "continue").
//!
//! Entry is a fixed 4-byte sync: the host sends `A0 0A 50 05` and the
//! device answers each byte with its bitwise complement, `5F F5 AF FA`.

use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

use crate::codec::crc::mtk_checksum;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// BROM command bytes.
pub mod cmd {
    /// Read the 16-bit hardware code.
    pub const GET_HW_CODE: u8 = 0xFD;
    /// Read the bootloader version byte (`0xFE` = BROM).
    pub const GET_BL_VER: u8 = 0xFE;
    /// Read the BROM version word.
    pub const GET_VERSION: u8 = 0xFF;
    /// Read hardware sub-code, hardware and software versions.
    pub const GET_HW_SW_VER: u8 = 0xFC;
    /// Legacy hardware dictionary read.
    pub const GET_HW_DICT: u8 = 0xA1;
    /// Upload a Download Agent image.
    pub const SEND_DA: u8 = 0xD7;
    /// Jump to an uploaded Download Agent.
    pub const JUMP_DA: u8 = 0xD5;
    /// Send an authentication certificate.
    pub const SEND_CERT: u8 = 0xE0;
    /// Read the 16-byte ME identifier.
    pub const GET_ME_ID: u8 = 0xE1;
    /// Read the 32-byte SoC identifier.
    pub const GET_SOC_ID: u8 = 0xE7;
    /// Read the target configuration flag word.
    pub const GET_TARGET_CONFIG: u8 = 0xD8;
    /// Send signed authentication data.
    pub const SEND_AUTH: u8 = 0xE2;
    /// Initialise the I2C block for PMIC access.
    pub const I2C_INIT: u8 = 0xB0;
    /// Initialise PMIC access.
    pub const PWR_INIT: u8 = 0xC4;
    /// De-initialise PMIC access.
    pub const PWR_DEINIT: u8 = 0xC5;
    /// Read a 16-bit PMIC register.
    pub const PWR_READ16: u8 = 0xC6;
    /// Write a 16-bit PMIC register.
    pub const PWR_WRITE16: u8 = 0xC7;
    /// Read 16-bit memory words.
    pub const READ16: u8 = 0xA2;
    /// Read 32-bit memory words.
    pub const READ32: u8 = 0xD1;
    /// Write 16-bit memory words.
    pub const WRITE16: u8 = 0xA4;
    /// Write 32-bit memory words.
    pub const WRITE32: u8 = 0xD4;
}

/// Operation completed.
pub const STATUS_OK: u16 = 0x0000;

/// Device expects more data.
pub const STATUS_CONT: u16 = 0x0069;

/// 4-byte sync sequence; the device echoes each byte complemented.
const SYNC: [u8; 4] = [0xA0, 0x0A, 0x50, 0x05];

const MAX_HANDSHAKE_ATTEMPTS: usize = 100;
const HANDSHAKE_BYTE_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DA_BLOCK_SIZE: usize = 4096;

/// Default watchdog register address.
pub const WDT_ADDR: u32 = 0x1000_7000;

/// Value disabling the watchdog.
pub const WDT_DISABLE: u32 = 0x2200_0000;

/// Decoded target-configuration flag word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TargetConfig {
    /// Raw flag word.
    pub config_flags: u32,
    /// Secure boot fused on.
    pub secure_boot: bool,
    /// Serial link authentication required.
    pub sla_enabled: bool,
    /// Download agent authentication required.
    pub daa_enabled: bool,
    /// Secure boot certificate required.
    pub sbc: bool,
}

impl TargetConfig {
    fn from_flags(flags: u32) -> Self {
        Self {
            config_flags: flags,
            secure_boot: flags & 0x01 != 0,
            sla_enabled: flags & 0x02 != 0,
            daa_enabled: flags & 0x04 != 0,
            sbc: flags & 0x08 != 0,
        }
    }

    /// SLA version from bits 24..27 of the flag word, floored at 1.
    pub fn sla_version(&self) -> u32 {
        let version = (self.config_flags >> 24) & 0x0F;
        version.max(1)
    }
}

/// Identity block gathered from a MediaTek device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MtkDeviceInfo {
    /// 16-bit hardware code, e.g. `0x0707` for MT6768.
    pub hw_code: u16,
    /// Hardware sub-code.
    pub hw_sub_code: u16,
    /// Hardware version.
    pub hw_version: u16,
    /// Software version.
    pub sw_version: u16,
    /// Bootloader version byte; `0xFE` means BROM mode.
    pub bl_ver: u8,
    /// True when the device answered from the BootROM.
    pub is_brom_mode: bool,
    /// 16-byte ME identifier.
    pub me_id: Vec<u8>,
    /// 32-byte SoC identifier.
    pub soc_id: Vec<u8>,
    /// Target configuration flags.
    pub target_config: TargetConfig,
}

/// BROM protocol client driving one device over a transport.
pub struct BromClient<'a, T: Transport> {
    transport: &'a mut T,
}

impl<'a, T: Transport> BromClient<'a, T> {
    /// Create a client over an open transport.
    pub fn new(transport: &'a mut T) -> Self {
        Self { transport }
    }

    // ── Handshake ──────────────────────────────────────────────────

    /// Run the 4-byte sync handshake.
    ///
    /// If the first byte is not answered with its complement the whole
    /// sequence restarts after a flush; a mismatch on a later byte also
    /// restarts the sequence. Capped at 100 attempts.
    pub fn handshake(&mut self) -> Result<()> {
        info!("Starting BROM handshake...");

        for attempt in 0..MAX_HANDSHAKE_ATTEMPTS {
            // Flush stale bytes so the first echo lines up
            let _ = self.transport.read(256, Duration::from_millis(10))?;

            self.transport.write_all(&SYNC[..1])?;
            let resp = self.transport.read_exact(1, HANDSHAKE_BYTE_TIMEOUT)?;
            if resp.first() != Some(&!SYNC[0]) {
                thread::sleep(Duration::from_millis(50));
                continue;
            }

            let mut ok = true;
            for (k, &byte) in SYNC.iter().enumerate().skip(1) {
                self.transport.write_all(&[byte])?;
                let resp = self.transport.read_exact(1, HANDSHAKE_BYTE_TIMEOUT)?;
                if resp.first() != Some(&!byte) {
                    warn!("Handshake byte {k} mismatch (attempt {}), retrying", attempt + 1);
                    ok = false;
                    break;
                }
            }

            if ok {
                info!("BROM 4-byte handshake complete (attempt {})", attempt + 1);
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }

        Err(Error::Protocol(
            "BROM handshake failed after max attempts".to_string(),
        ))
    }

    // ── Low-level echo protocol ────────────────────────────────────

    fn send_command(&mut self, command: u8) -> Result<()> {
        self.transport.write_all(&[command])?;

        let echo = self.transport.read_exact(1, DEFAULT_TIMEOUT)?;
        match echo.first() {
            None => Err(Error::Transport(format!(
                "no echo for command {command:#04x}"
            ))),
            Some(&got) if got != command => Err(Error::EchoMismatch {
                sent: command,
                got,
            }),
            Some(_) => Ok(()),
        }
    }

    fn send_word(&mut self, value: u32) -> Result<()> {
        let bytes = value.to_be_bytes();
        self.transport.write_all(&bytes)?;

        // Word echoes diverge on some preloaders; log but carry on
        let echo = self.transport.read_exact(4, DEFAULT_TIMEOUT)?;
        if echo != bytes {
            warn!(
                "send_word echo mismatch: sent {value:#010x}, got {:02x?}",
                echo
            );
        }
        Ok(())
    }

    fn recv_word(&mut self) -> Result<u32> {
        let bytes = self.transport.read_exact(4, DEFAULT_TIMEOUT)?;
        if bytes.len() < 4 {
            return Err(Error::Transport(format!(
                "short word read: {} bytes",
                bytes.len()
            )));
        }
        Ok(BigEndian::read_u32(&bytes))
    }

    fn read_status(&mut self) -> Result<u16> {
        let bytes = self.transport.read_exact(2, DEFAULT_TIMEOUT)?;
        if bytes.len() < 2 {
            return Err(Error::Transport(format!(
                "short status read: {} bytes",
                bytes.len()
            )));
        }
        Ok(BigEndian::read_u16(&bytes))
    }

    fn expect_status(&mut self, expected: u16) -> Result<()> {
        let status = self.read_status()?;
        if status != expected {
            return Err(Error::Protocol(format!(
                "unexpected status {status:#06x} (expected {expected:#06x})"
            )));
        }
        Ok(())
    }

    fn echo_read(&mut self, len: usize) -> Result<Vec<u8>> {
        let data = self.transport.read_exact(len, DEFAULT_TIMEOUT)?;
        if data.len() < len {
            return Err(Error::Transport(format!(
                "short read: expected {len}, got {}",
                data.len()
            )));
        }
        Ok(data)
    }

    /// Write a payload and consume its byte-for-byte echo. DA bulk data
    /// is the exception and goes through raw writes instead.
    fn echo_write(&mut self, data: &[u8]) -> Result<()> {
        self.transport.write_all(data)?;
        let echo = self.transport.read_exact(data.len(), DEFAULT_TIMEOUT)?;
        if echo.len() != data.len() {
            return Err(Error::Transport(format!(
                "echo_write: expected {} echo bytes, got {}",
                data.len(),
                echo.len()
            )));
        }
        if echo != data {
            warn!("echo_write: device echo diverged from payload");
        }
        Ok(())
    }

    // ── Identity queries ───────────────────────────────────────────

    /// Read the 16-bit hardware code.
    pub fn get_hw_code(&mut self) -> Result<u16> {
        self.send_command(cmd::GET_HW_CODE)?;
        let code = (self.recv_word()? >> 16) as u16;
        self.expect_status(STATUS_OK)?;
        info!("HW code: {code:#06x}");
        Ok(code)
    }

    /// Read the bootloader version byte; `0xFE` means BROM mode.
    pub fn get_bl_ver(&mut self) -> Result<u8> {
        self.send_command(cmd::GET_BL_VER)?;
        let resp = self.transport.read_exact(1, DEFAULT_TIMEOUT)?;
        let ver = *resp
            .first()
            .ok_or_else(|| Error::Transport("no BL version byte".to_string()))?;
        info!(
            "BL version: {ver:#04x} ({})",
            if ver == 0xFE { "BROM mode" } else { "Preloader mode" }
        );
        Ok(ver)
    }

    /// Read the BROM version word.
    pub fn get_brom_version(&mut self) -> Result<u16> {
        self.send_command(cmd::GET_VERSION)?;
        let version = (self.recv_word()? >> 16) as u16;
        self.expect_status(STATUS_OK)?;
        info!("BROM version: {version:#06x}");
        Ok(version)
    }

    /// Read the target configuration flag word.
    pub fn get_target_config(&mut self) -> Result<TargetConfig> {
        self.send_command(cmd::GET_TARGET_CONFIG)?;
        let flags = self.recv_word()?;
        self.expect_status(STATUS_OK)?;

        let config = TargetConfig::from_flags(flags);
        info!(
            "Target config: SBC={} SLA={} DAA={}",
            config.secure_boot, config.sla_enabled, config.daa_enabled
        );
        Ok(config)
    }

    /// Read the ME identifier (16 bytes on every known chip).
    pub fn get_me_id(&mut self) -> Result<Vec<u8>> {
        self.send_command(cmd::GET_ME_ID)?;
        let len = self.recv_word()?;
        if len == 0 || len > 256 {
            return Err(Error::Protocol(format!("invalid ME-ID length: {len}")));
        }
        let me_id = self.echo_read(len as usize)?;
        self.expect_status(STATUS_OK)?;
        Ok(me_id)
    }

    /// Read the SoC identifier (32 bytes on every known chip).
    pub fn get_soc_id(&mut self) -> Result<Vec<u8>> {
        self.send_command(cmd::GET_SOC_ID)?;
        let len = self.recv_word()?;
        if len == 0 || len > 256 {
            return Err(Error::Protocol(format!("invalid SOC-ID length: {len}")));
        }
        let soc_id = self.echo_read(len as usize)?;
        self.expect_status(STATUS_OK)?;
        Ok(soc_id)
    }

    /// Gather the full identity block. Disables the watchdog on the way,
    /// the device would otherwise reset mid-session.
    pub fn get_device_info(&mut self) -> Result<MtkDeviceInfo> {
        let mut info = MtkDeviceInfo {
            hw_code: self.get_hw_code()?,
            bl_ver: self.get_bl_ver()?,
            ..MtkDeviceInfo::default()
        };
        info.is_brom_mode = info.bl_ver == 0xFE;

        self.disable_watchdog(WDT_ADDR, WDT_DISABLE)?;

        info.target_config = self.get_target_config()?;
        info.me_id = self.get_me_id()?;
        info.soc_id = self.get_soc_id()?;

        // TODO: the high-half extraction below matches observed BROM
        // traffic but has not been cross-checked against a preloader
        self.send_command(cmd::GET_HW_SW_VER)?;
        info.hw_sub_code = (self.recv_word()? >> 16) as u16;
        info.hw_version = (self.recv_word()? >> 16) as u16;
        info.sw_version = (self.recv_word()? >> 16) as u16;
        self.expect_status(STATUS_OK)?;

        info!(
            "Device: HW={:#06x} BL={:#04x} mode={}",
            info.hw_code,
            info.bl_ver,
            if info.is_brom_mode { "BROM" } else { "Preloader" }
        );
        Ok(info)
    }

    // ── Watchdog ───────────────────────────────────────────────────

    /// Disable the watchdog via a 32-bit register write.
    pub fn disable_watchdog(&mut self, wdt_addr: u32, wdt_value: u32) -> Result<()> {
        info!("Disabling watchdog at {wdt_addr:#010x}");
        self.write32(wdt_addr, &[wdt_value])
    }

    // ── DA transfer ────────────────────────────────────────────────

    /// Upload a Download Agent image to `load_addr`.
    pub fn send_da(&mut self, data: &[u8], load_addr: u32, sig_len: u32) -> Result<()> {
        self.send_da_with_progress(data, load_addr, sig_len, &mut |_, _| {})
    }

    /// Upload a Download Agent, reporting `(sent, total)` per block.
    ///
    /// The payload is streamed in 4 KiB raw writes with no echo; the
    /// device then reports its 16-bit checksum which must match the
    /// local [`mtk_checksum`].
    pub fn send_da_with_progress(
        &mut self,
        data: &[u8],
        load_addr: u32,
        sig_len: u32,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        info!("Sending DA: {} bytes to {load_addr:#010x}", data.len());

        self.send_command(cmd::SEND_DA)?;
        self.send_word(load_addr)?;
        self.send_word(data.len() as u32)?;
        self.send_word(sig_len)?;
        self.expect_status(STATUS_CONT)?;

        let total = data.len() as u64;
        let mut sent = 0u64;
        for block in data.chunks(DA_BLOCK_SIZE) {
            self.transport.write_all(block)?;
            sent += block.len() as u64;
            progress(sent, total);
        }

        let local = mtk_checksum(data);
        let remote = self.read_status()?;
        if local != remote {
            return Err(Error::ChecksumMismatch {
                expected: local,
                actual: remote,
            });
        }
        debug!("DA checksum OK ({local:#06x})");

        self.expect_status(STATUS_OK)
    }

    /// Jump into an uploaded Download Agent.
    pub fn jump_da(&mut self, addr: u32) -> Result<()> {
        info!("Jump DA to {addr:#010x}");
        self.send_command(cmd::JUMP_DA)?;
        self.send_word(addr)?;
        self.expect_status(STATUS_OK)
    }

    // ── Security ───────────────────────────────────────────────────

    /// Send an authentication certificate.
    pub fn send_cert(&mut self, cert: &[u8]) -> Result<()> {
        info!("Sending certificate ({} bytes)", cert.len());
        self.send_command(cmd::SEND_CERT)?;
        self.send_word(cert.len() as u32)?;
        self.expect_status(STATUS_CONT)?;
        self.echo_write(cert)?;
        self.expect_status(STATUS_OK)
    }

    /// Send signed authentication data.
    pub fn send_auth(&mut self, auth: &[u8]) -> Result<()> {
        info!("Sending auth data ({} bytes)", auth.len());
        self.send_command(cmd::SEND_AUTH)?;
        self.send_word(auth.len() as u32)?;
        self.expect_status(STATUS_CONT)?;
        self.echo_write(auth)?;
        self.expect_status(STATUS_OK)
    }

    // ── Memory access ──────────────────────────────────────────────

    /// Read `count` 32-bit words starting at `addr`, as raw bytes.
    pub fn read32(&mut self, addr: u32, count: u32) -> Result<Vec<u8>> {
        self.send_command(cmd::READ32)?;
        self.send_word(addr)?;
        self.send_word(count)?;
        self.expect_status(STATUS_CONT)?;
        let data = self.echo_read(count as usize * 4)?;
        self.expect_status(STATUS_OK)?;
        Ok(data)
    }

    /// Write 32-bit words starting at `addr`.
    pub fn write32(&mut self, addr: u32, values: &[u32]) -> Result<()> {
        self.send_command(cmd::WRITE32)?;
        self.send_word(addr)?;
        self.send_word(values.len() as u32)?;
        self.expect_status(STATUS_CONT)?;
        for &value in values {
            self.send_word(value)?;
        }
        self.expect_status(STATUS_OK)
    }

    // ── PMIC access ────────────────────────────────────────────────

    /// Initialise the I2C block.
    pub fn i2c_init(&mut self) -> Result<()> {
        self.send_command(cmd::I2C_INIT)?;
        self.expect_status(STATUS_OK)
    }

    /// Initialise PMIC access.
    pub fn pwr_init(&mut self) -> Result<()> {
        self.send_command(cmd::PWR_INIT)?;
        self.expect_status(STATUS_OK)
    }

    /// De-initialise PMIC access.
    pub fn pwr_deinit(&mut self) -> Result<()> {
        self.send_command(cmd::PWR_DEINIT)?;
        self.expect_status(STATUS_OK)
    }

    /// Read a 16-bit PMIC register.
    pub fn pwr_read16(&mut self, addr: u16) -> Result<u16> {
        self.send_command(cmd::PWR_READ16)?;
        self.send_word(u32::from(addr))?;
        let value = self.recv_word()? as u16;
        self.expect_status(STATUS_OK)?;
        Ok(value)
    }

    /// Write a 16-bit PMIC register.
    pub fn pwr_write16(&mut self, addr: u16, value: u16) -> Result<()> {
        self.send_command(cmd::PWR_WRITE16)?;
        self.send_word(u32::from(addr))?;
        self.send_word(u32::from(value))?;
        self.expect_status(STATUS_OK)
    }
}
