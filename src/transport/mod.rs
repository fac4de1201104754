//! Transport abstraction for device communication.
//!
//! Every protocol engine in this crate speaks to the device through the
//! [`Transport`] trait: an unframed byte stream with timed reads. The
//! design separates I/O from protocol logic, allowing the engines to be
//! driven by a real serial port or by a scripted transcript in tests.
//!
//! ```text
//! +--------------------------+
//! |  Protocol engines        |
//! |  (sahara, brom, fdl, ..) |
//! +------------+-------------+
//!              |
//!              v
//! +------------+-------------+
//! |      Transport trait     |
//! +------------+-------------+
//!              |
//!              v
//! +------------+-------------+
//! |  NativeTransport         |
//! |  (serialport crate)      |
//! +--------------------------+
//! ```

#[cfg(test)]
pub(crate) mod mock;
#[cfg(feature = "native")]
pub mod native;

use std::time::Duration;

use crate::error::{Error, Result};

/// Byte-stream transport used by all protocol engines.
///
/// Reads never block past their timeout. A read that times out returns
/// fewer bytes than requested (possibly zero); it is the caller's job to
/// decide whether a short read is an error for the current protocol state.
pub trait Transport {
    /// Write `buf` to the device, returning the number of bytes written.
    ///
    /// Partial writes are allowed by the contract but a full write is
    /// expected; engines treat a short write as a transport failure.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Read up to `max_len` bytes, waiting at most `timeout`.
    ///
    /// Returns whatever arrived within the window, which may be empty.
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Read exactly `len` bytes, waiting at most `timeout` in total.
    ///
    /// On timeout the buffer read so far is returned short.
    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Write all of `buf`, failing on a short write.
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let written = self.write(buf)?;
        if written != buf.len() {
            return Err(Error::Transport(format!(
                "short write: {written} of {} bytes",
                buf.len()
            )));
        }
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativeTransport;
