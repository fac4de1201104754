//! Error types for triflash.

use std::io;
use thiserror::Error;

/// Result type for triflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for triflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Transport failure: short read, short write, or closed stream.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unexpected command, opcode or status for the current protocol state.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// BROM echo byte did not match the byte sent.
    #[error("Echo mismatch: sent {sent:#04x}, got {got:#04x}")]
    EchoMismatch {
        /// Byte written to the device.
        sent: u8,
        /// Byte echoed back.
        got: u8,
    },

    /// HDLC CRC, Spreadtrum sum or MTK DA checksum disagreement.
    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch {
        /// Checksum computed locally.
        expected: u16,
        /// Checksum received from the peer.
        actual: u16,
    },

    /// Packet length field absurd or contradicting the available bytes.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// SLA authentication failure: missing key material, signing failure
    /// or device rejection.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// PEM parse failure or not an RSA private key.
    #[error("Key load failed: {0}")]
    KeyLoad(String),

    /// Out-of-range item ID, malformed digit sequence or bad path.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
