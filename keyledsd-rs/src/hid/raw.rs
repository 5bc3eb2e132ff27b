/* hidraw transport: blocking reads with a poll-based deadline over a
 * `/dev/hidraw*` node, plus the ioctls fetching the report descriptor. */

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::time::Instant;

use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::trace;

use super::endpoint::{Transport, TransportError};

const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

/* struct hidraw_report_descriptor from linux/hidraw.h */
#[repr(C)]
pub struct HidrawReportDescriptor {
    size: u32,
    value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

nix::ioctl_read!(hidraw_desc_size, b'H', 0x01, libc::c_int);
nix::ioctl_read!(hidraw_descriptor, b'H', 0x02, HidrawReportDescriptor);

pub struct HidrawTransport {
    file: std::fs::File,
    path: PathBuf,
}

impl HidrawTransport {
    /* Open the node read-write and fetch its raw report descriptor. */
    pub fn open(path: &Path) -> std::io::Result<(Self, Vec<u8>)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut size: libc::c_int = 0;
        /* SAFETY: fd is valid for the duration of the call and `size` is a
         * live out-parameter of the type the ioctl expects. */
        unsafe { hidraw_desc_size(file.as_fd().as_raw_fd(), &mut size) }
            .map_err(std::io::Error::from)?;

        let mut descriptor = HidrawReportDescriptor {
            size: (size.clamp(0, HID_MAX_DESCRIPTOR_SIZE as libc::c_int)) as u32,
            value: [0; HID_MAX_DESCRIPTOR_SIZE],
        };
        /* SAFETY: as above; the kernel fills at most `size` bytes. */
        unsafe { hidraw_descriptor(file.as_fd().as_raw_fd(), &mut descriptor) }
            .map_err(std::io::Error::from)?;

        let data = descriptor.value[..descriptor.size as usize].to_vec();
        trace!("read report descriptor ({} bytes) from {}", data.len(), path.display());
        Ok((Self { file, path: path.to_path_buf() }, data))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wait_readable(&self, deadline: Option<Instant>) -> Result<bool, TransportError> {
        let timeout = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(TransportError::Timeout);
                }
                PollTimeout::from(remaining.as_millis().min(u128::from(u16::MAX)) as u16)
            }
            None => PollTimeout::ZERO,
        };
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(errno) => Err(TransportError::Io(errno)),
        }
    }
}

fn io_errno(err: &std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

impl Transport for HidrawTransport {
    fn write_report(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        trace!("tx {} bytes: {:02x?}", frame.len(), frame);
        self.file
            .write_all(frame)
            .map_err(|e| TransportError::Io(io_errno(&e)))
    }

    fn read_report(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize, TransportError> {
        loop {
            if !self.wait_readable(Some(deadline))? {
                continue; /* poll returned early; the deadline check re-runs */
            }
            match self.file.read(buf) {
                Ok(n) => {
                    trace!("rx {} bytes: {:02x?}", n, &buf[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(io_errno(&e))),
            }
        }
    }

    fn drain(&mut self) -> Result<usize, TransportError> {
        let mut buf = [0u8; 256];
        let mut count = 0usize;
        while self.wait_readable(None)? {
            match self.file.read(&mut buf) {
                Ok(_) => count += 1,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(io_errno(&e))),
            }
        }
        if count > 0 {
            trace!("drained {count} stale reports from {}", self.path.display());
        }
        Ok(count)
    }
}
