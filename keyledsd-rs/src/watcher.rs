/* Device discovery: udev enumeration of Logitech hidraw nodes and a monitor
 * thread translating hotplug events into a channel the orchestrator's event
 * loop consumes. */

use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const LOGITECH_VENDOR: &str = "046d";

/* Everything the orchestrator needs to know about a candidate device. */
#[derive(Debug, Clone)]
pub struct DeviceDescription {
    pub sys_path: PathBuf,
    pub dev_node: PathBuf,
    /* USB serial, from the usb_device ancestor */
    pub serial: String,
    pub vendor_id: String,
    pub product_id: String,
    pub product: String,
}

#[derive(Debug)]
pub enum DeviceEvent {
    Added(DeviceDescription),
    Removed(PathBuf),
}

fn describe(device: &udev::Device) -> Option<DeviceDescription> {
    let dev_node = device.devnode()?.to_path_buf();

    /* identity lives on the usb_device ancestor */
    let usb = device.parent_with_subsystem_devtype("usb", "usb_device").ok()??;
    let attr = |name: &str| {
        usb.attribute_value(name)
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    if attr("idVendor") != LOGITECH_VENDOR {
        return None;
    }
    Some(DeviceDescription {
        sys_path: device.syspath().to_path_buf(),
        dev_node,
        serial: attr("serial"),
        vendor_id: attr("idVendor"),
        product_id: attr("idProduct"),
        product: attr("product"),
    })
}

/* List currently connected Logitech hidraw nodes. */
pub fn enumerate() -> Result<Vec<DeviceDescription>> {
    let mut enumerator = udev::Enumerator::new().context("udev enumerator")?;
    enumerator
        .match_subsystem("hidraw")
        .context("hidraw subsystem filter")?;

    let mut devices = Vec::new();
    for device in enumerator.scan_devices().context("udev scan")? {
        if let Some(description) = describe(&device) {
            debug!("found {} at {}", description.product, description.dev_node.display());
            devices.push(description);
        }
    }
    Ok(devices)
}

/* Handle used to stop the monitor thread. */
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/* Watch for hidraw hotplug events. Events are delivered through `tx`; the
 * channel closing is tolerated (daemon shutting down). */
pub fn spawn_monitor(tx: mpsc::UnboundedSender<DeviceEvent>) -> Result<MonitorHandle> {
    let socket = udev::MonitorBuilder::new()
        .context("udev monitor")?
        .match_subsystem("hidraw")
        .context("hidraw subsystem filter")?
        .listen()
        .context("udev monitor listen")?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);

    let thread = std::thread::Builder::new()
        .name("udev-monitor".to_string())
        .spawn(move || {
            let mut socket = socket;
            while !stop_flag.load(Ordering::SeqCst) {
                /* wait for the socket with a bounded poll so the stop flag
                 * is honoured */
                let fd = socket.as_raw_fd();
                /* SAFETY: the socket outlives the borrow within this scope */
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(500u16)) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(errno) => {
                        warn!("udev monitor poll failed: {errno}");
                        break;
                    }
                }

                for event in socket.iter() {
                    let sent = match event.event_type() {
                        udev::EventType::Add => match describe(&event.device()) {
                            Some(description) => tx.send(DeviceEvent::Added(description)),
                            None => Ok(()),
                        },
                        udev::EventType::Remove => {
                            tx.send(DeviceEvent::Removed(event.syspath().to_path_buf()))
                        }
                        _ => Ok(()),
                    };
                    if sent.is_err() {
                        return; /* receiver gone, daemon is shutting down */
                    }
                }
            }
        })
        .context("udev monitor thread")?;

    Ok(MonitorHandle { stop, thread: Some(thread) })
}
