//! Native serial transport using the `serialport` crate.

use std::io::Read;
use std::time::{Duration, Instant};

use log::trace;
use serialport::ClearBuffer;

use crate::error::Result;
use crate::transport::Transport;

/// Serial-port transport for native platforms (Linux, macOS, Windows).
pub struct NativeTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    baud_rate: u32,
}

impl NativeTransport {
    /// Default timeout applied to the underlying port between reads.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Open a serial port with the given parameters (8N1, no flow control).
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Self::DEFAULT_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;

        Ok(Self {
            port,
            name: port_name.to_string(),
            baud_rate,
        })
    }

    /// Port name/path this transport was opened on.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Change the baud rate of the open port.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.port.set_baud_rate(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    /// Discard any pending input/output buffered by the OS driver.
    pub fn clear_buffers(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    /// List available serial ports.
    pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>> {
        Ok(serialport::available_ports()?)
    }
}

impl Transport for NativeTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        std::io::Write::write_all(&mut self.port, buf)?;
        std::io::Write::flush(&mut self.port)?;
        Ok(buf.len())
    }

    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.port.set_timeout(timeout)?;

        let mut buf = vec![0u8; max_len];
        match self.port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_exact(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::with_capacity(len);

        while out.len() < len {
            let now = Instant::now();
            if now >= deadline {
                trace!("read_exact: timeout with {} of {len} bytes", out.len());
                break;
            }
            self.port.set_timeout(deadline - now)?;

            let mut buf = vec![0u8; len - out.len()];
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(out)
    }
}
