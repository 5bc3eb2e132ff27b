/* HID++ 2.0 protocol client.
 *
 * Frames a feature call as
 *   report_id | target_id | feature_index | (function << 4 | app_id) | payload
 * over the smallest report whose payload fits, resolves feature indices
 * through the Root feature with caching, and recovers protocol state with
 * ping-based resynchronisation. */

pub mod error;
pub mod features;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::hid::endpoint::{Endpoint, Transport};
use crate::hid::parser::{self, Descriptor, ReportInfo};
use crate::hid::raw::HidrawTransport;

use error::{DeviceError, HidppError};
use features::{BlockInfo, KeyColor};

/* Default target for directly attached devices. */
pub const TARGET_DEFAULT: u8 = 0xff;

/* Well-known feature identifiers. */
pub const FEATURE_ROOT: u16 = 0x0000;
pub const FEATURE_FEATURE: u16 = 0x0001;
pub const FEATURE_VERSION: u16 = 0x0003;
pub const FEATURE_NAME: u16 = 0x0005;
pub const FEATURE_GAMEMODE: u16 = 0x4522;
pub const FEATURE_LAYOUT2: u16 = 0x4540;
pub const FEATURE_GKEYS: u16 = 0x8010;
pub const FEATURE_MKEYS: u16 = 0x8020;
pub const FEATURE_MRKEYS: u16 = 0x8030;
pub const FEATURE_REPORTRATE: u16 = 0x8060;
pub const FEATURE_LEDS: u16 = 0x8080;

/* Fixed indices of the two bootstrap features. */
pub const FEATURE_IDX_ROOT: u8 = 0x00;
pub const FEATURE_IDX_FEATURE: u8 = 0x01;

/* Root feature functions. */
const ROOT_FN_GET_FEATURE: u8 = 0;
const ROOT_FN_PING: u8 = 1;

/* Error markers in the feature-index slot of a response. */
const ERROR_IDX_HIDPP2: u8 = 0xff;
const ERROR_IDX_HIDPP1: u8 = 0x8f;

/* One resolved feature with its flag byte. Entries never expire. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureEntry {
    pub target_id: u8,
    pub feature_id: u16,
    pub index: u8,
    pub reserved: bool,
    pub hidden: bool,
    pub obsolete: bool,
}

pub struct Device<T: Transport = HidrawTransport> {
    endpoint: Endpoint<T>,
    path: PathBuf,
    app_id: u8,
    ping_seq: u8,
    reports: Vec<ReportInfo>,
    max_report_size: usize,
    features: Vec<FeatureEntry>,
    cached_name: Option<String>,
    cached_version: Option<features::DeviceVersion>,
}

impl<T: Transport> std::fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl Device<HidrawTransport> {
    /* Open a hidraw node and qualify it as a HID++ 2.0 device. */
    pub fn open(path: &Path, app_id: u8) -> Result<Self, DeviceError> {
        debug!("opening device {}", path.display());
        let (transport, descriptor) =
            HidrawTransport::open(path).map_err(|source| DeviceError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let descriptor = parser::parse(&descriptor)?;

        let mut seq: u8 = rand::thread_rng().gen();
        if seq == 0 {
            seq = 1;
        }
        Self::from_transport(transport, descriptor, path.to_path_buf(), app_id, seq)
    }
}

impl<T: Transport> Device<T> {
    /* Qualify an already-open transport. The ping sequence is seeded to a
     * nonzero value so resynchronisations are unambiguous. */
    pub fn from_transport(
        transport: T,
        descriptor: Descriptor,
        path: PathBuf,
        app_id: u8,
        ping_seed: u8,
    ) -> Result<Self, DeviceError> {
        /* a feature call needs at least the 3 header bytes plus one byte */
        let reports: Vec<ReportInfo> = descriptor
            .reports
            .iter()
            .copied()
            .filter(|r| r.size >= 4)
            .collect();
        if reports.is_empty() {
            return Err(DeviceError::NoReport);
        }

        let mut device = Self {
            endpoint: Endpoint::new(transport, descriptor.max_report_size),
            path,
            app_id: app_id & 0x0f,
            ping_seq: ping_seed.max(1),
            reports,
            max_report_size: descriptor.max_report_size,
            features: Vec::new(),
            cached_name: None,
            cached_version: None,
        };

        let (version, _handler) = device.get_protocol(TARGET_DEFAULT)?;
        if version < 2 {
            return Err(DeviceError::UnsupportedProtocol { version });
        }
        device.ping(TARGET_DEFAULT)?;
        info!("opened device {} protocol version {}", device.path.display(), version);
        Ok(device)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn app_id(&self) -> u8 {
        self.app_id
    }

    pub fn max_report_size(&self) -> usize {
        self.max_report_size
    }

    pub fn reports(&self) -> &[ReportInfo] {
        &self.reports
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.endpoint.set_timeout(timeout);
    }

    pub fn endpoint_mut(&mut self) -> &mut Endpoint<T> {
        &mut self.endpoint
    }

    /* Discard stale inbound reports so the next exchange starts clean. */
    pub fn flush(&mut self) -> Result<(), DeviceError> {
        self.endpoint
            .drain()
            .map(|_| ())
            .map_err(|e| match e {
                crate::hid::endpoint::TransportError::Timeout => DeviceError::Timeout,
                crate::hid::endpoint::TransportError::Io(errno) => DeviceError::Io(errno),
            })
    }

    /* Issue one feature call and return the reply payload. The feature index
     * is resolved (and cached) first; error frames are decoded into the
     * HID++ taxonomy. */
    pub fn call(
        &mut self,
        target_id: u8,
        feature_id: u16,
        function: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        let feature_idx = self.resolve_feature_index(target_id, feature_id)?;
        let frame = self.exchange(target_id, feature_idx, function, payload)?;
        self.decode_reply(frame)
    }

    /* PING with an empty payload: byte 0 of the reply is the protocol
     * version. Legacy devices answer with a HID++ v1 error frame instead,
     * which maps to version 1. */
    pub fn get_protocol(&mut self, target_id: u8) -> Result<(u8, u8), DeviceError> {
        let frame = self.exchange(target_id, FEATURE_IDX_ROOT, ROOT_FN_PING, &[])?;
        if frame[2] == ERROR_IDX_HIDPP1 {
            return Ok((1, 0));
        }
        let data = self.decode_reply(frame)?;
        if data.len() < 2 {
            return Err(DeviceError::BadResponse);
        }
        Ok((data[0], data[1]))
    }

    /* Re-synchronise the exchange stream: send a PING carrying a rolling
     * sequence byte and discard inbound reports until the matching PONG. */
    pub fn ping(&mut self, target_id: u8) -> Result<(), DeviceError> {
        let seq = self.ping_seq;
        self.ping_seq = if seq == u8::MAX { 1 } else { seq + 1 };

        let report = self.report_for(3)?;
        let mut frame = vec![0u8; 1 + report.size];
        frame[0] = report.id;
        frame[1] = target_id;
        frame[2] = FEATURE_IDX_ROOT;
        frame[3] = (ROOT_FN_PING << 4) | self.app_id;
        frame[6] = seq;

        let app_id = self.app_id;
        let reports = self.reports.clone();
        let accept = move |f: &[u8]| {
            if f.len() < 7 || !reports.iter().any(|r| r.id == f[0]) {
                return false;
            }
            if f[1] != target_id {
                return false;
            }
            let error = (f[2] == ERROR_IDX_HIDPP2 && f[3] == FEATURE_IDX_ROOT)
                || (f[2] == ERROR_IDX_HIDPP1 && f[3] == FEATURE_IDX_ROOT);
            let pong =
                f[2] == FEATURE_IDX_ROOT && (f[3] & 0x0f) == app_id && f[6] == seq;
            error || pong
        };

        let frame = self
            .endpoint
            .roundtrip(frame, Box::new(accept))
            .map_err(DeviceError::from)?;
        if frame[2] == ERROR_IDX_HIDPP2 {
            return Err(HidppError::from_code(frame[5]).into());
        }
        if frame[2] == ERROR_IDX_HIDPP1 {
            return Err(DeviceError::UnsupportedProtocol { version: 1 });
        }
        Ok(())
    }

    /* Resolve a feature id to its index via Root function 0, with caching.
     * Indices 0 (root) and 1 (feature table) are preset. */
    pub fn resolve_feature_index(
        &mut self,
        target_id: u8,
        feature_id: u16,
    ) -> Result<u8, DeviceError> {
        if feature_id == FEATURE_ROOT {
            return Ok(FEATURE_IDX_ROOT);
        }
        if feature_id == FEATURE_FEATURE {
            return Ok(FEATURE_IDX_FEATURE);
        }
        if let Some(entry) = self
            .features
            .iter()
            .find(|e| e.target_id == target_id && e.feature_id == feature_id)
        {
            return Ok(entry.index);
        }

        let frame = self.exchange(
            target_id,
            FEATURE_IDX_ROOT,
            ROOT_FN_GET_FEATURE,
            &[(feature_id >> 8) as u8, feature_id as u8],
        )?;
        let data = self.decode_reply(frame)?;
        if data.len() < 2 {
            return Err(DeviceError::BadResponse);
        }

        let index = data[0];
        if index == 0 {
            return Err(DeviceError::FeatureNotFound { feature_id });
        }
        self.insert_feature(target_id, feature_id, index, data[1]);
        Ok(index)
    }

    /* Feature table function 0: number of features on the device. */
    pub fn get_feature_count(&mut self, target_id: u8) -> Result<u8, DeviceError> {
        let data = self.call(target_id, FEATURE_FEATURE, 0, &[])?;
        data.first().copied().ok_or(DeviceError::BadResponse)
    }

    /* Feature table function 1: feature id at a given index. */
    pub fn get_feature_id(&mut self, target_id: u8, index: u8) -> Result<u16, DeviceError> {
        if index == FEATURE_IDX_ROOT {
            return Ok(FEATURE_ROOT);
        }
        if index == FEATURE_IDX_FEATURE {
            return Ok(FEATURE_FEATURE);
        }
        if let Some(entry) = self
            .features
            .iter()
            .find(|e| e.target_id == target_id && e.index == index)
        {
            return Ok(entry.feature_id);
        }

        let data = self.call(target_id, FEATURE_FEATURE, 1, &[index])?;
        if data.len() < 3 {
            return Err(DeviceError::BadResponse);
        }
        let feature_id = u16::from(data[0]) << 8 | u16::from(data[1]);
        self.insert_feature(target_id, feature_id, index, data[2]);
        Ok(feature_id)
    }

    pub fn cached_features(&self) -> &[FeatureEntry] {
        &self.features
    }

    fn insert_feature(&mut self, target_id: u8, feature_id: u16, index: u8, flags: u8) {
        debug!("feature {feature_id:04x} is at {index} [{flags:02x}]");
        self.features.push(FeatureEntry {
            target_id,
            feature_id,
            index,
            reserved: flags & (1 << 5) != 0,
            hidden: flags & (1 << 6) != 0,
            obsolete: flags & (1 << 7) != 0,
        });
    }

    fn report_for(&self, payload_len: usize) -> Result<ReportInfo, DeviceError> {
        self.reports
            .iter()
            .copied()
            .find(|r| r.size >= 3 + payload_len)
            .ok_or(DeviceError::PayloadTooLarge { size: payload_len })
    }

    /* Send one framed call and wait for the frame answering it. Frames not
     * matching the outstanding (target, feature_index, app_id) triple are
     * discarded, except the two error-frame shapes. */
    fn exchange(
        &mut self,
        target_id: u8,
        feature_idx: u8,
        function: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        debug_assert!(function <= 0x0f);
        let report = self.report_for(payload.len())?;

        let mut frame = vec![0u8; 1 + report.size];
        frame[0] = report.id;
        frame[1] = target_id;
        frame[2] = feature_idx;
        frame[3] = (function << 4) | self.app_id;
        frame[4..4 + payload.len()].copy_from_slice(payload);

        let app_id = self.app_id;
        let reports = self.reports.clone();
        let accept = move |f: &[u8]| {
            if f.len() < 5 || !reports.iter().any(|r| r.id == f[0]) {
                return false;
            }
            f[1] == target_id
                && ((f[2] == feature_idx && (f[3] & 0x0f) == app_id)
                    || (f[2] == ERROR_IDX_HIDPP2
                        && f[3] == feature_idx
                        && (f[4] & 0x0f) == app_id)
                    || (f[2] == ERROR_IDX_HIDPP1
                        && f[3] == FEATURE_IDX_ROOT
                        && (f[4] & 0x0f) == app_id))
        };

        self.endpoint
            .roundtrip(frame, Box::new(accept))
            .map_err(DeviceError::from)
    }

    /* Validate a reply frame's length and split off its payload. */
    fn decode_reply(&self, frame: Vec<u8>) -> Result<Vec<u8>, DeviceError> {
        if frame.len() < 6 {
            return Err(DeviceError::BadResponse);
        }
        if frame[2] == ERROR_IDX_HIDPP2 {
            return Err(HidppError::from_code(frame[5]).into());
        }
        if frame[2] == ERROR_IDX_HIDPP1 {
            return Err(DeviceError::UnsupportedProtocol { version: 1 });
        }
        let report = self
            .reports
            .iter()
            .find(|r| r.id == frame[0])
            .ok_or(DeviceError::BadResponse)?;
        if frame.len() != 1 + report.size {
            return Err(DeviceError::BadResponse);
        }
        Ok(frame[4..].to_vec())
    }
}

/* An opened keyboard: the protocol client plus everything enumerated at open
 * time (identity strings, layout id, LED blocks with their key ids). */
pub struct Keyboard<T: Transport = HidrawTransport> {
    pub device: Device<T>,
    pub name: String,
    pub model: String,
    pub serial: String,
    pub layout: Option<u8>,
    pub blocks: Vec<LedBlock>,
}

/* One LED block and the key ids it reported, in device order. */
#[derive(Debug, Clone)]
pub struct LedBlock {
    pub info: BlockInfo,
    pub key_ids: Vec<u8>,
}

impl Keyboard<HidrawTransport> {
    pub fn open(path: &Path, app_id: u8) -> Result<Self, DeviceError> {
        let device = Device::open(path, app_id)?;
        Self::from_device(device)
    }
}

impl<T: Transport> Keyboard<T> {
    pub fn from_device(mut device: Device<T>) -> Result<Self, DeviceError> {
        let version = device.get_device_version(TARGET_DEFAULT)?;
        let name = device.get_device_name(TARGET_DEFAULT)?;
        let serial = version.serial_string();
        let model = version.model_string();
        let layout = device.keyboard_layout(TARGET_DEFAULT).ok();

        let mut blocks = Vec::new();
        for info in device.get_block_info(TARGET_DEFAULT)? {
            let leds = device.get_leds(TARGET_DEFAULT, info.id, 0, info.nb_keys as usize)?;
            blocks.push(LedBlock {
                info,
                key_ids: leds.iter().map(|l| l.id).collect(),
            });
        }

        info!("device {name} ({model}, serial {serial}): {} LED blocks", blocks.len());
        Ok(Self { device, name, model, serial, layout, blocks })
    }

    pub fn blocks(&self) -> &[LedBlock] {
        &self.blocks
    }

    /* Current committed colors of one block, by block position. */
    pub fn read_block(&mut self, block_idx: usize) -> Result<Vec<KeyColor>, DeviceError> {
        let block = self.blocks.get(block_idx).ok_or(DeviceError::BadResponse)?;
        let (id, count) = (block.info.id, block.key_ids.len());
        self.device.get_leds(TARGET_DEFAULT, id, 0, count)
    }

    pub fn write_block(
        &mut self,
        block_idx: usize,
        keys: &[KeyColor],
    ) -> Result<(), DeviceError> {
        let block = self.blocks.get(block_idx).ok_or(DeviceError::BadResponse)?;
        let id = block.info.id;
        self.device.set_leds(TARGET_DEFAULT, id, keys)
    }

    pub fn commit(&mut self) -> Result<(), DeviceError> {
        self.device.commit_leds(TARGET_DEFAULT)
    }

    pub fn flush(&mut self) -> Result<(), DeviceError> {
        self.device.flush()
    }

    pub fn resync(&mut self) -> Result<(), DeviceError> {
        self.device.ping(TARGET_DEFAULT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hid::testing::MockTransport;

    pub(crate) fn test_descriptor() -> Descriptor {
        Descriptor {
            reports: vec![
                ReportInfo { id: 0x10, size: 6 },
                ReportInfo { id: 0x11, size: 19 },
            ],
            max_report_size: 19,
        }
    }

    /* A reply frame for the given request header, long report. */
    pub(crate) fn long_reply(target: u8, feature_idx: u8, fn_app: u8, data: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 20];
        f[0] = 0x11;
        f[1] = target;
        f[2] = feature_idx;
        f[3] = fn_app;
        f[4..4 + data.len()].copy_from_slice(data);
        f
    }

    pub(crate) fn short_reply(target: u8, feature_idx: u8, fn_app: u8, data: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 7];
        f[0] = 0x10;
        f[1] = target;
        f[2] = feature_idx;
        f[3] = fn_app;
        f[4..4 + data.len()].copy_from_slice(data);
        f
    }

    /* Open a mock device: expects the protocol probe and the initial ping. */
    pub(crate) fn open_mock(seed: u8) -> Device<MockTransport> {
        let mut transport = MockTransport::new();
        /* get_protocol reply: version 2 */
        transport.push_reply(&short_reply(TARGET_DEFAULT, 0x00, 0x12, &[2, 0, 0]));
        /* ping echo with the seeded sequence */
        transport.push_reply(&short_reply(TARGET_DEFAULT, 0x00, 0x12, &[0, 0, seed]));
        Device::from_transport(transport, test_descriptor(), PathBuf::from("/dev/mock"), 0x2, seed)
            .expect("open")
    }

    #[test]
    fn open_qualifies_v2_device() {
        let dev = open_mock(0x17);
        assert_eq!(dev.app_id(), 0x2);
        let writes = &dev.endpoint.transport().writes;
        /* probe: empty ping on the short report */
        assert_eq!(writes[0], vec![0x10, 0xff, 0x00, 0x12, 0, 0, 0]);
        /* resync ping: sequence byte in the last payload slot */
        assert_eq!(writes[1], vec![0x10, 0xff, 0x00, 0x12, 0, 0, 0x17]);
    }

    #[test]
    fn open_rejects_v1_device() {
        let mut transport = MockTransport::new();
        /* HID++ v1 error frame at feature 0x8f, root feature */
        transport.push_reply(&short_reply(TARGET_DEFAULT, 0x8f, 0x00, &[0x12, 0, 0]));
        let err = Device::from_transport(
            transport,
            test_descriptor(),
            PathBuf::from("/dev/mock"),
            0x2,
            1,
        )
        .expect_err("v1 must be rejected");
        assert!(matches!(err, DeviceError::UnsupportedProtocol { version: 1 }));
    }

    #[test]
    fn call_picks_smallest_fitting_report_and_pads() {
        let mut dev = open_mock(1);
        /* feature lookup reply, then the call reply */
        dev.endpoint.transport_mut().push_reply(&long_reply(0xff, 0x00, 0x02, &[0x05, 0x00]));
        dev.endpoint.transport_mut().push_reply(&long_reply(0xff, 0x05, 0x32, &[0xaa]));
        dev.call(0xff, FEATURE_NAME, 3, &[1, 2, 3, 4]).expect("call");

        let writes = &dev.endpoint.transport().writes;
        /* lookup uses the short report (2-byte payload fits) */
        assert_eq!(writes[2], vec![0x10, 0xff, 0x00, 0x02, 0x00, 0x05, 0x00]);
        /* the call itself needs the long report; padded with zeros */
        let mut expected = vec![0x11, 0xff, 0x05, 0x32, 1, 2, 3, 4];
        expected.resize(20, 0);
        assert_eq!(writes[3], expected);
    }

    #[test]
    fn call_ignores_unrelated_frames() {
        let mut dev = open_mock(1);
        dev.endpoint.transport_mut().push_reply(&long_reply(0xff, 0x00, 0x02, &[0x05, 0x00]));
        /* wrong app id, wrong feature, wrong target, then the real reply */
        dev.endpoint.transport_mut().push_reply(&long_reply(0xff, 0x05, 0x3f, &[0x01]));
        dev.endpoint.transport_mut().push_reply(&long_reply(0xff, 0x07, 0x32, &[0x02]));
        dev.endpoint.transport_mut().push_reply(&long_reply(0x01, 0x05, 0x32, &[0x03]));
        dev.endpoint.transport_mut().push_reply(&long_reply(0xff, 0x05, 0x32, &[0x04]));
        let data = dev.call(0xff, FEATURE_NAME, 3, &[]).expect("call");
        assert_eq!(data[0], 0x04);
    }

    #[test]
    fn call_decodes_error_frames() {
        let mut dev = open_mock(1);
        dev.endpoint.transport_mut().push_reply(&long_reply(0xff, 0x00, 0x02, &[0x05, 0x00]));
        /* error frame: feature_index slot 0xff, code at byte 5 */
        let mut err_frame = long_reply(0xff, 0xff, 0x05, &[]);
        err_frame[4] = 0x32;
        err_frame[5] = 8; /* busy */
        dev.endpoint.transport_mut().push_reply(&err_frame);
        let err = dev.call(0xff, FEATURE_NAME, 3, &[]).expect_err("error frame");
        assert!(matches!(err, DeviceError::Hidpp(HidppError::Busy)));
    }

    #[test]
    fn feature_index_is_cached() {
        let mut dev = open_mock(1);
        dev.endpoint.transport_mut().push_reply(&long_reply(0xff, 0x00, 0x02, &[0x05, 0x60]));
        let idx = dev.resolve_feature_index(0xff, FEATURE_LEDS).expect("resolve");
        assert_eq!(idx, 0x05);
        let entry = dev.cached_features()[0];
        assert!(entry.hidden);
        assert!(!entry.obsolete);

        /* second resolution: no wire traffic */
        let writes_before = dev.endpoint.transport().writes.len();
        let idx = dev.resolve_feature_index(0xff, FEATURE_LEDS).expect("resolve");
        assert_eq!(idx, 0x05);
        assert_eq!(dev.endpoint.transport().writes.len(), writes_before);
    }

    #[test]
    fn well_known_indices_are_preset() {
        let mut dev = open_mock(1);
        assert_eq!(dev.resolve_feature_index(0xff, FEATURE_ROOT).expect("root"), 0);
        assert_eq!(dev.resolve_feature_index(0xff, FEATURE_FEATURE).expect("table"), 1);
        assert!(dev.endpoint.transport().writes.len() == 2); /* open traffic only */
    }

    #[test]
    fn unresolvable_feature_reports_not_found() {
        let mut dev = open_mock(1);
        dev.endpoint.transport_mut().push_reply(&long_reply(0xff, 0x00, 0x02, &[0x00, 0x00]));
        let err = dev.call(0xff, FEATURE_GAMEMODE, 0, &[]).expect_err("absent feature");
        assert!(matches!(err, DeviceError::FeatureNotFound { feature_id: FEATURE_GAMEMODE }));
    }

    #[test]
    fn ping_skips_unrelated_pongs() {
        let mut dev = open_mock(9);
        /* a stale pong with the wrong sequence, then the right one */
        dev.endpoint.transport_mut().push_reply(&short_reply(0xff, 0x00, 0x12, &[0, 0, 0x08]));
        dev.endpoint.transport_mut().push_reply(&short_reply(0xff, 0x00, 0x12, &[0, 0, 0x0a]));
        dev.ping(0xff).expect("ping");
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut dev = open_mock(1);
        let payload = vec![0u8; 17]; /* long report holds 16 */
        let err = dev
            .call(0xff, FEATURE_ROOT, 0, &payload)
            .expect_err("too large");
        assert!(matches!(err, DeviceError::PayloadTooLarge { size: 17 }));
    }
}
