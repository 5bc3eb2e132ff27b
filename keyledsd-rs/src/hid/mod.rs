/* Raw HID layer: report-descriptor parsing, the request/reply endpoint state
 * machine and the hidraw transport it runs on. Nothing in here understands
 * HID++ framing; that lives in `crate::device`. */

pub mod endpoint;
pub mod parser;
pub mod raw;

pub use endpoint::{Command, CommandError, Endpoint, Transport, TransportError};
pub use parser::{Descriptor, ReportInfo};
pub use raw::HidrawTransport;

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::time::Instant;

    use super::endpoint::{Transport, TransportError};

    /* Scripted transport: records written frames, serves queued replies. */
    pub enum Reply {
        Frame(Vec<u8>),
        Timeout,
        Error(nix::errno::Errno),
    }

    #[derive(Default)]
    pub struct MockTransport {
        pub writes: Vec<Vec<u8>>,
        pub replies: VecDeque<Reply>,
        pub stale: VecDeque<Vec<u8>>,
        pub write_error: Option<nix::errno::Errno>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_reply(&mut self, frame: &[u8]) {
            self.replies.push_back(Reply::Frame(frame.to_vec()));
        }
    }

    impl Transport for MockTransport {
        fn write_report(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            if let Some(errno) = self.write_error.take() {
                return Err(TransportError::Io(errno));
            }
            self.writes.push(frame.to_vec());
            Ok(())
        }

        fn read_report(
            &mut self,
            buf: &mut [u8],
            _deadline: Instant,
        ) -> Result<usize, TransportError> {
            match self.replies.pop_front() {
                Some(Reply::Frame(frame)) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                Some(Reply::Timeout) | None => Err(TransportError::Timeout),
                Some(Reply::Error(errno)) => Err(TransportError::Io(errno)),
            }
        }

        fn drain(&mut self) -> Result<usize, TransportError> {
            let n = self.stale.len();
            self.stale.clear();
            Ok(n)
        }
    }
}
