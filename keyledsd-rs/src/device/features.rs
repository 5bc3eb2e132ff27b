/* Typed HID++ feature operations on top of the protocol client.
 *
 * Each wrapper decodes one feature's functions into plain values or a typed
 * error. Chunked operations size their batches from the report budget and
 * tolerate the device answering with a shorter report than the theoretical
 * maximum; several firmwares do. */

use tracing::debug;

use crate::hid::endpoint::Transport;

use super::error::DeviceError;
use super::{
    Device, FEATURE_GAMEMODE, FEATURE_GKEYS, FEATURE_LAYOUT2, FEATURE_LEDS, FEATURE_MKEYS,
    FEATURE_MRKEYS, FEATURE_NAME, FEATURE_REPORTRATE, FEATURE_VERSION,
};

/* LED block identifiers: the id doubles as its bit in the presence mask. */
pub const BLOCK_KEYS: u16 = 1 << 0;
pub const BLOCK_MULTIMEDIA: u16 = 1 << 1;
pub const BLOCK_GKEYS: u16 = 1 << 2;
pub const BLOCK_LOGO: u16 = 1 << 4;
pub const BLOCK_MODES: u16 = 1 << 6;

pub fn block_name(id: u16) -> Option<&'static str> {
    match id {
        BLOCK_KEYS => Some("keys"),
        BLOCK_MULTIMEDIA => Some("multimedia"),
        BLOCK_GKEYS => Some("gkeys"),
        BLOCK_LOGO => Some("logo"),
        BLOCK_MODES => Some("modes"),
        _ => None,
    }
}

pub fn block_by_name(name: &str) -> Option<u16> {
    match name {
        "keys" => Some(BLOCK_KEYS),
        "multimedia" => Some(BLOCK_MULTIMEDIA),
        "gkeys" => Some(BLOCK_GKEYS),
        "logo" => Some(BLOCK_LOGO),
        "modes" => Some(BLOCK_MODES),
        _ => None,
    }
}

/* version feature (0x0003) functions */
const VERSION_FN_DEVICE_INFO: u8 = 0;
const VERSION_FN_FIRMWARE_INFO: u8 = 1;

/* name feature (0x0005) functions */
const NAME_FN_LENGTH: u8 = 0;
const NAME_FN_NAME: u8 = 1;
const NAME_FN_TYPE: u8 = 2;

/* leds feature (0x8080) functions */
const LEDS_FN_GET_BLOCKS: u8 = 0;
const LEDS_FN_BLOCK_INFO: u8 = 1;
const LEDS_FN_GET_LEDS: u8 = 2;
const LEDS_FN_SET_LEDS: u8 = 3;
const LEDS_FN_SET_BLOCK: u8 = 4;
const LEDS_FN_COMMIT: u8 = 5;

/* gamemode feature (0x4522) functions */
const GAMEMODE_FN_MAX: u8 = 0;
const GAMEMODE_FN_BLOCK: u8 = 1;
const GAMEMODE_FN_UNBLOCK: u8 = 2;
const GAMEMODE_FN_RESET: u8 = 3;
const GAMEMODE_KEYS_PER_CALL: usize = 16;

/* report rate feature (0x8060) functions */
const RATE_FN_LIST: u8 = 0;
const RATE_FN_GET: u8 = 1;
const RATE_FN_SET: u8 = 2;

/* gkeys feature (0x8010) functions */
const GKEYS_FN_COUNT: u8 = 0;
const GKEYS_FN_ENABLE: u8 = 2;

/* mkeys (0x8020) / mrkeys (0x8030) functions */
const MKEYS_FN_SET: u8 = 1;
const MRKEYS_FN_SET: u8 = 0;

/* layout feature (0x4540) functions */
const LAYOUT_FN_GET: u8 = 0;

/* One firmware slot from the version feature. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub protocol_type: u8,
    pub prefix: String,
    pub version_major: u32,
    pub version_minor: u32,
    pub build: u32,
    pub product_id: u16,
    pub is_active: bool,
    pub misc: [u8; 5],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceVersion {
    pub serial: [u8; 4],
    pub transport: u16,
    pub model: [u8; 6],
    pub protocols: Vec<ProtocolInfo>,
}

impl DeviceVersion {
    pub fn serial_string(&self) -> String {
        self.serial.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn model_string(&self) -> String {
        self.model.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Keyboard,
    RemoteControl,
    Numpad,
    Mouse,
    Touchpad,
    Trackball,
    Presenter,
    Receiver,
    Unknown(u8),
}

impl From<u8> for DeviceType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Keyboard,
            1 => Self::RemoteControl,
            2 => Self::Numpad,
            3 => Self::Mouse,
            4 => Self::Touchpad,
            5 => Self::Trackball,
            6 => Self::Presenter,
            7 => Self::Receiver,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Keyboard => "keyboard",
            Self::RemoteControl => "remote control",
            Self::Numpad => "numpad",
            Self::Mouse => "mouse",
            Self::Touchpad => "touchpad",
            Self::Trackball => "trackball",
            Self::Presenter => "presenter",
            Self::Receiver => "receiver",
            Self::Unknown(_) => "unknown",
        };
        f.write_str(name)
    }
}

/* One LED block as reported by the leds feature. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub id: u16,
    pub nb_keys: u16,
    pub max_red: u8,
    pub max_green: u8,
    pub max_blue: u8,
}

/* One LED directive: key id within its block plus the wire color. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyColor {
    pub id: u8,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl<T: Transport> Device<T> {
    /* Device identity: serial, transport, model and firmware slots. */
    pub fn get_device_version(&mut self, target_id: u8) -> Result<DeviceVersion, DeviceError> {
        if let Some(version) = &self.cached_version {
            return Ok(version.clone());
        }

        let data = self.call(target_id, FEATURE_VERSION, VERSION_FN_DEVICE_INFO, &[])?;
        if data.len() < 13 {
            return Err(DeviceError::BadResponse);
        }
        let count = data[0] as usize;
        let mut serial = [0u8; 4];
        serial.copy_from_slice(&data[1..5]);
        let transport = u16::from(data[5]) << 8 | u16::from(data[6]);
        let mut model = [0u8; 6];
        model.copy_from_slice(&data[7..13]);

        let mut protocols = Vec::with_capacity(count);
        for idx in 0..count {
            let data =
                self.call(target_id, FEATURE_VERSION, VERSION_FN_FIRMWARE_INFO, &[idx as u8])?;
            if data.len() < 16 {
                return Err(DeviceError::BadResponse);
            }
            protocols.push(ProtocolInfo {
                protocol_type: data[0],
                prefix: data[1..4]
                    .iter()
                    .map(|&b| if b.is_ascii_graphic() { b as char } else { ' ' })
                    .collect(),
                version_major: 100 + 10 * u32::from(data[4] >> 4) + u32::from(data[4] & 0xf),
                version_minor: 10 * u32::from(data[5] >> 4) + u32::from(data[5] & 0xf),
                build: u32::from(data[6]) << 8 | u32::from(data[7]),
                is_active: data[8] & 1 != 0,
                product_id: u16::from(data[9]) << 8 | u16::from(data[10]),
                misc: [data[11], data[12], data[13], data[14], data[15]],
            });
        }

        let version = DeviceVersion { serial, transport, model, protocols };
        self.cached_version = Some(version.clone());
        Ok(version)
    }

    /* ASCII device name, read chunk by chunk as the report budget allows. */
    pub fn get_device_name(&mut self, target_id: u8) -> Result<String, DeviceError> {
        if let Some(name) = &self.cached_name {
            return Ok(name.clone());
        }

        let data = self.call(target_id, FEATURE_NAME, NAME_FN_LENGTH, &[])?;
        let length = *data.first().ok_or(DeviceError::BadResponse)? as usize;

        let mut raw = Vec::with_capacity(length);
        while raw.len() < length {
            let chunk = self.call(target_id, FEATURE_NAME, NAME_FN_NAME, &[raw.len() as u8])?;
            let wanted = length - raw.len();
            let take = chunk.len().min(wanted);
            if take == 0 {
                return Err(DeviceError::BadResponse);
            }
            raw.extend_from_slice(&chunk[..take]);
        }

        /* device strings are not nul-terminated but may be padded */
        let name: String = raw
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect();
        self.cached_name = Some(name.clone());
        Ok(name)
    }

    pub fn get_device_type(&mut self, target_id: u8) -> Result<DeviceType, DeviceError> {
        let data = self.call(target_id, FEATURE_NAME, NAME_FN_TYPE, &[])?;
        data.first()
            .copied()
            .map(DeviceType::from)
            .ok_or(DeviceError::BadResponse)
    }

    /* Describe all LED blocks present on the device. */
    pub fn get_block_info(&mut self, target_id: u8) -> Result<Vec<BlockInfo>, DeviceError> {
        let data = self.call(target_id, FEATURE_LEDS, LEDS_FN_GET_BLOCKS, &[])?;
        if data.len() < 2 {
            return Err(DeviceError::BadResponse);
        }
        let mask = u16::from(data[0]) << 8 | u16::from(data[1]);

        let mut blocks = Vec::new();
        for bit in 0..16 {
            let block_id = 1u16 << bit;
            if mask & block_id == 0 {
                continue;
            }
            let data = self.call(
                target_id,
                FEATURE_LEDS,
                LEDS_FN_BLOCK_INFO,
                &[(block_id >> 8) as u8, block_id as u8],
            )?;
            if data.len() < 5 {
                return Err(DeviceError::BadResponse);
            }
            blocks.push(BlockInfo {
                id: block_id,
                nb_keys: u16::from(data[0]) << 8 | u16::from(data[1]),
                max_red: data[2],
                max_green: data[3],
                max_blue: data[4],
            });
        }
        Ok(blocks)
    }

    /* Stream current LED colors, 4-byte quads, chunked by report size. The
     * device echoes the requested offset; the echo is validated before a
     * chunk is accepted. */
    pub fn get_leds(
        &mut self,
        target_id: u8,
        block_id: u16,
        offset: u16,
        count: usize,
    ) -> Result<Vec<KeyColor>, DeviceError> {
        let mut keys = Vec::with_capacity(count);
        let mut offset = offset;

        while keys.len() < count {
            let data = self.call(
                target_id,
                FEATURE_LEDS,
                LEDS_FN_GET_LEDS,
                &[
                    (block_id >> 8) as u8,
                    block_id as u8,
                    (offset >> 8) as u8,
                    offset as u8,
                ],
            )?;
            if data.len() < 8 {
                return Err(DeviceError::BadResponse);
            }
            if data[2] != (offset >> 8) as u8 || data[3] != offset as u8 {
                return Err(DeviceError::BadResponse);
            }

            let mut progressed = false;
            for quad in data[4..].chunks_exact(4) {
                keys.push(KeyColor {
                    id: quad[0],
                    red: quad[1],
                    green: quad[2],
                    blue: quad[3],
                });
                offset = offset.wrapping_add(1);
                progressed = true;
                if keys.len() >= count {
                    break;
                }
            }
            if !progressed {
                return Err(DeviceError::BadResponse);
            }
        }
        Ok(keys)
    }

    /* Write colors into the device's pending buffer. Lights change only on
     * commit_leds. */
    pub fn set_leds(
        &mut self,
        target_id: u8,
        block_id: u16,
        keys: &[KeyColor],
    ) -> Result<(), DeviceError> {
        /* 4 bytes per key after the block and count words */
        let per_call = (self.max_report_size - 3 - 4) / 4;
        if per_call == 0 {
            return Err(DeviceError::PayloadTooLarge { size: 8 });
        }

        for batch in keys.chunks(per_call) {
            let mut payload = Vec::with_capacity(4 + batch.len() * 4);
            payload.push((block_id >> 8) as u8);
            payload.push(block_id as u8);
            payload.push((batch.len() >> 8) as u8);
            payload.push(batch.len() as u8);
            for key in batch {
                payload.extend_from_slice(&[key.id, key.red, key.green, key.blue]);
            }
            self.call(target_id, FEATURE_LEDS, LEDS_FN_SET_LEDS, &payload)?;
        }
        Ok(())
    }

    /* Reset a whole block to one color in the pending buffer. */
    pub fn set_led_block(
        &mut self,
        target_id: u8,
        block_id: u16,
        red: u8,
        green: u8,
        blue: u8,
    ) -> Result<(), DeviceError> {
        self.call(
            target_id,
            FEATURE_LEDS,
            LEDS_FN_SET_BLOCK,
            &[(block_id >> 8) as u8, block_id as u8, red, green, blue],
        )
        .map(|_| ())
    }

    /* Apply the pending buffer to the physical lights. Takes tens of
     * milliseconds on the wire; called at most once per render tick. */
    pub fn commit_leds(&mut self, target_id: u8) -> Result<(), DeviceError> {
        self.call(target_id, FEATURE_LEDS, LEDS_FN_COMMIT, &[]).map(|_| ())
    }

    pub fn gamemode_max(&mut self, target_id: u8) -> Result<u8, DeviceError> {
        let data = self.call(target_id, FEATURE_GAMEMODE, GAMEMODE_FN_MAX, &[])?;
        data.first().copied().ok_or(DeviceError::BadResponse)
    }

    pub fn gamemode_set(&mut self, target_id: u8, ids: &[u8]) -> Result<(), DeviceError> {
        self.gamemode_send(target_id, ids, GAMEMODE_FN_BLOCK)
    }

    pub fn gamemode_clear(&mut self, target_id: u8, ids: &[u8]) -> Result<(), DeviceError> {
        self.gamemode_send(target_id, ids, GAMEMODE_FN_UNBLOCK)
    }

    pub fn gamemode_reset(&mut self, target_id: u8) -> Result<(), DeviceError> {
        self.call(target_id, FEATURE_GAMEMODE, GAMEMODE_FN_RESET, &[]).map(|_| ())
    }

    fn gamemode_send(
        &mut self,
        target_id: u8,
        ids: &[u8],
        function: u8,
    ) -> Result<(), DeviceError> {
        for batch in ids.chunks(GAMEMODE_KEYS_PER_CALL) {
            self.call(target_id, FEATURE_GAMEMODE, function, batch)?;
        }
        Ok(())
    }

    /* Supported report rates in milliseconds: bit i of the mask means a rate
     * of i+1 ms is available. */
    pub fn get_report_rates(&mut self, target_id: u8) -> Result<Vec<u8>, DeviceError> {
        let data = self.call(target_id, FEATURE_REPORTRATE, RATE_FN_LIST, &[])?;
        let mask = *data.first().ok_or(DeviceError::BadResponse)?;
        Ok((0..8).filter(|bit| mask & (1 << bit) != 0).map(|bit| bit + 1).collect())
    }

    pub fn get_report_rate(&mut self, target_id: u8) -> Result<u8, DeviceError> {
        let data = self.call(target_id, FEATURE_REPORTRATE, RATE_FN_GET, &[])?;
        data.first().copied().ok_or(DeviceError::BadResponse)
    }

    pub fn set_report_rate(&mut self, target_id: u8, rate_ms: u8) -> Result<(), DeviceError> {
        self.call(target_id, FEATURE_REPORTRATE, RATE_FN_SET, &[rate_ms]).map(|_| ())
    }

    pub fn gkeys_count(&mut self, target_id: u8) -> Result<u8, DeviceError> {
        let data = self.call(target_id, FEATURE_GKEYS, GKEYS_FN_COUNT, &[])?;
        data.first().copied().ok_or(DeviceError::BadResponse)
    }

    /* When disabled, GKeys report as regular F keys. */
    pub fn gkeys_enable(&mut self, target_id: u8, enabled: bool) -> Result<(), DeviceError> {
        self.call(target_id, FEATURE_GKEYS, GKEYS_FN_ENABLE, &[u8::from(enabled)])
            .map(|_| ())
    }

    pub fn mkeys_set(&mut self, target_id: u8, mask: u8) -> Result<(), DeviceError> {
        self.call(target_id, FEATURE_MKEYS, MKEYS_FN_SET, &[mask]).map(|_| ())
    }

    pub fn mrkeys_set(&mut self, target_id: u8, mask: u8) -> Result<(), DeviceError> {
        self.call(target_id, FEATURE_MRKEYS, MRKEYS_FN_SET, &[mask]).map(|_| ())
    }

    /* Layout id used to pick the key-position description file. */
    pub fn keyboard_layout(&mut self, target_id: u8) -> Result<u8, DeviceError> {
        let data = self.call(target_id, FEATURE_LAYOUT2, LAYOUT_FN_GET, &[])?;
        let layout = data.first().copied().ok_or(DeviceError::BadResponse)?;
        debug!("device reports layout {layout:#04x}");
        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{long_reply, open_mock};
    use super::super::FEATURE_LEDS;
    use super::*;

    /* resolve FEATURE_LEDS at index 6 on the mock */
    fn prime_leds_feature(dev: &mut Device<crate::hid::testing::MockTransport>) {
        dev.endpoint_mut()
            .transport_mut()
            .push_reply(&long_reply(0xff, 0x00, 0x02, &[0x06, 0x00]));
        assert_eq!(dev.resolve_feature_index(0xff, FEATURE_LEDS).expect("resolve"), 6);
    }

    #[test]
    fn block_info_walks_mask_bits() {
        let mut dev = open_mock(1);
        prime_leds_feature(&mut dev);
        /* mask: keys + logo */
        dev.endpoint_mut()
            .transport_mut()
            .push_reply(&long_reply(0xff, 0x06, 0x02, &[0x00, 0x11]));
        /* keys block: 120 keys, full brightness */
        dev.endpoint_mut()
            .transport_mut()
            .push_reply(&long_reply(0xff, 0x06, 0x12, &[0x00, 120, 255, 255, 255]));
        /* logo block: 1 key */
        dev.endpoint_mut()
            .transport_mut()
            .push_reply(&long_reply(0xff, 0x06, 0x12, &[0x00, 1, 255, 255, 255]));

        let blocks = dev.get_block_info(0xff).expect("blocks");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], BlockInfo {
            id: BLOCK_KEYS,
            nb_keys: 120,
            max_red: 255,
            max_green: 255,
            max_blue: 255,
        });
        assert_eq!(blocks[1].id, BLOCK_LOGO);
        assert_eq!(blocks[1].nb_keys, 1);

        /* the second info request addressed the logo block */
        let writes = dev.endpoint_mut().transport().writes.clone();
        let last = writes.last().expect("write");
        assert_eq!(&last[4..6], &[0x00, 0x10]);
    }

    #[test]
    fn get_leds_validates_offset_echo_and_chunks() {
        let mut dev = open_mock(1);
        prime_leds_feature(&mut dev);

        /* chunk 1: offset 0, three quads fit in a long report */
        let mut chunk = vec![0x00, 0x01, 0x00, 0x00];
        chunk.extend_from_slice(&[4, 10, 11, 12, 5, 20, 21, 22, 6, 30, 31, 32]);
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x06, 0x22, &chunk));
        /* chunk 2: offset 3, one quad */
        let mut chunk = vec![0x00, 0x01, 0x00, 0x03];
        chunk.extend_from_slice(&[7, 40, 41, 42]);
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x06, 0x22, &chunk));

        let leds = dev.get_leds(0xff, BLOCK_KEYS, 0, 4).expect("leds");
        assert_eq!(leds.len(), 4);
        assert_eq!(leds[0], KeyColor { id: 4, red: 10, green: 11, blue: 12 });
        assert_eq!(leds[3], KeyColor { id: 7, red: 40, green: 41, blue: 42 });
    }

    #[test]
    fn get_leds_rejects_bad_offset_echo() {
        let mut dev = open_mock(1);
        prime_leds_feature(&mut dev);
        let mut chunk = vec![0x00, 0x01, 0x00, 0x09]; /* wrong echo */
        chunk.extend_from_slice(&[4, 1, 2, 3]);
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x06, 0x22, &chunk));
        let err = dev.get_leds(0xff, BLOCK_KEYS, 0, 1).expect_err("bad echo");
        assert!(matches!(err, DeviceError::BadResponse));
    }

    #[test]
    fn set_leds_chunks_by_report_budget() {
        let mut dev = open_mock(1);
        prime_leds_feature(&mut dev);

        /* long report payload is 16 bytes: 3 quads per call after headers */
        let keys: Vec<KeyColor> = (0..7)
            .map(|i| KeyColor { id: i, red: i, green: 0, blue: 0 })
            .collect();
        for _ in 0..3 {
            dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x06, 0x32, &[]));
        }
        dev.set_leds(0xff, BLOCK_KEYS, &keys).expect("set");

        let writes = dev.endpoint_mut().transport().writes.clone();
        let calls: Vec<&Vec<u8>> = writes.iter().filter(|w| w[3] == 0x32).collect();
        assert_eq!(calls.len(), 3);
        /* first batch: block 0x0001, count 3 */
        assert_eq!(&calls[0][4..8], &[0x00, 0x01, 0x00, 3]);
        /* last batch: count 1 */
        assert_eq!(&calls[2][4..8], &[0x00, 0x01, 0x00, 1]);
    }

    #[test]
    fn name_is_read_in_chunks_and_cached() {
        use super::super::tests::short_reply;

        let mut dev = open_mock(1);
        /* resolve name feature at index 2 */
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x00, 0x02, &[0x02, 0x00]));
        /* length: 4 */
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x02, 0x02, &[4]));
        /* the device answers on the short report: 3-byte chunks */
        dev.endpoint_mut().transport_mut().push_reply(&short_reply(0xff, 0x02, 0x12, b"G41"));
        dev.endpoint_mut().transport_mut().push_reply(&short_reply(0xff, 0x02, 0x12, b"0"));

        assert_eq!(dev.get_device_name(0xff).expect("name"), "G410");

        /* cached: no more traffic */
        let writes = dev.endpoint_mut().transport().writes.len();
        assert_eq!(dev.get_device_name(0xff).expect("name"), "G410");
        assert_eq!(dev.endpoint_mut().transport().writes.len(), writes);
    }

    #[test]
    fn version_decodes_bcd_and_slots() {
        let mut dev = open_mock(1);
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x00, 0x02, &[0x03, 0x00]));
        /* device info: 1 slot, serial, transport, model */
        let info = [1u8, 0xde, 0xad, 0xbe, 0xef, 0x40, 0x01, 0xc3, 0x30, 0, 0, 0, 0];
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x03, 0x02, &info));
        /* firmware slot 0 */
        let slot = [
            0u8, b'U', b'1', b'2', 0x12, 0x34, 0x01, 0x02, 0x01, 0xc3, 0x30, 1, 2, 3, 4, 5,
        ];
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x03, 0x12, &slot));

        let version = dev.get_device_version(0xff).expect("version");
        assert_eq!(version.serial_string(), "deadbeef");
        assert_eq!(version.model_string(), "c33000000000");
        assert_eq!(version.protocols.len(), 1);
        let proto = &version.protocols[0];
        assert_eq!(proto.prefix, "U12");
        assert_eq!(proto.version_major, 112); /* 100 + BCD 12 */
        assert_eq!(proto.version_minor, 34);
        assert_eq!(proto.build, 0x0102);
        assert!(proto.is_active);
        assert_eq!(proto.product_id, 0xc330);
    }

    #[test]
    fn report_rates_decode_bitmask() {
        let mut dev = open_mock(1);
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x00, 0x02, &[0x04, 0x00]));
        /* bits 0, 1, 3: rates 1, 2 and 4 ms */
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x04, 0x02, &[0b0000_1011]));
        assert_eq!(dev.get_report_rates(0xff).expect("rates"), vec![1, 2, 4]);
    }

    #[test]
    fn gamemode_chunks_at_sixteen_ids() {
        let mut dev = open_mock(1);
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x00, 0x02, &[0x07, 0x00]));
        let ids: Vec<u8> = (0..20).collect();
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x07, 0x12, &[]));
        dev.endpoint_mut().transport_mut().push_reply(&long_reply(0xff, 0x07, 0x12, &[]));
        dev.gamemode_set(0xff, &ids).expect("gamemode");

        let writes = dev.endpoint_mut().transport().writes.clone();
        let calls: Vec<&Vec<u8>> = writes.iter().filter(|w| w[3] == 0x12 && w[2] == 0x07).collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(&calls[0][4..20], &ids[..16]);
        assert_eq!(&calls[1][4..8], &ids[16..20]);
    }

    #[test]
    fn block_names_roundtrip() {
        for id in [BLOCK_KEYS, BLOCK_MULTIMEDIA, BLOCK_GKEYS, BLOCK_LOGO, BLOCK_MODES] {
            let name = block_name(id).expect("name");
            assert_eq!(block_by_name(name), Some(id));
        }
        assert_eq!(block_name(1 << 9), None);
    }
}
