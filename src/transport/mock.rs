//! Scripted transport for protocol tests.
//!
//! A script is an ordered list of [`Step`]s replaying a recorded device
//! conversation. `Expect` steps are matched byte-for-byte against host
//! writes; once an `Expect` is fully consumed, the following `Respond`
//! bytes become readable. Reads past the available data return short, the
//! same way a timed-out serial read does.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::Result;
use crate::transport::Transport;

/// One step of a scripted conversation.
#[derive(Debug, Clone)]
pub enum Step {
    /// Bytes the host must write next.
    Expect(Vec<u8>),
    /// Bytes the device offers for reading.
    Respond(Vec<u8>),
}

/// Transport replaying a fixed device transcript.
pub struct ScriptedTransport {
    steps: VecDeque<Step>,
    /// Byte offset into the front `Expect` step.
    expect_cursor: usize,
    inbound: VecDeque<u8>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        let mut t = Self {
            steps: steps.into(),
            expect_cursor: 0,
            inbound: VecDeque::new(),
        };
        t.pump();
        t
    }

    /// True when every step has been consumed and nothing is left to read.
    pub fn is_exhausted(&self) -> bool {
        self.steps.is_empty() && self.inbound.is_empty()
    }

    /// Move leading `Respond` steps into the readable buffer.
    fn pump(&mut self) {
        while matches!(self.steps.front(), Some(Step::Respond(_))) {
            if let Some(Step::Respond(bytes)) = self.steps.pop_front() {
                self.inbound.extend(bytes);
            }
        }
    }

    fn take(&mut self, max_len: usize) -> Vec<u8> {
        let n = max_len.min(self.inbound.len());
        self.inbound.drain(..n).collect()
    }
}

impl Transport for ScriptedTransport {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        for &b in buf {
            let step_done = {
                let Some(Step::Expect(expected)) = self.steps.front() else {
                    panic!(
                        "scripted transport: unexpected write {b:#04x}, next step {:?}",
                        self.steps.front()
                    );
                };
                let want = expected[self.expect_cursor];
                assert_eq!(
                    b, want,
                    "scripted transport: wrote {b:#04x}, expected {want:#04x} \
                     at offset {}",
                    self.expect_cursor
                );
                self.expect_cursor + 1 == expected.len()
            };

            self.expect_cursor += 1;
            if step_done {
                self.steps.pop_front();
                self.expect_cursor = 0;
                self.pump();
            }
        }
        Ok(buf.len())
    }

    fn read(&mut self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        Ok(self.take(max_len))
    }

    fn read_exact(&mut self, len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        Ok(self.take(len))
    }
}
