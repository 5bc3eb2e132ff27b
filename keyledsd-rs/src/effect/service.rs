/* Effect service: the per-effect facade through which plugins see the
 * engine. Read-only device identity and key information, typed access to
 * the plugin's configuration block, pooled render targets and data-file
 * loading. One instance exists per live effect and is owned together with
 * it. */

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::abi::ServiceTable;
use crate::config::{ConfigValue, PluginConf};
use crate::keydb::{KeyDatabase, KeyGroup};
use crate::render::{RGBAColor, RenderTarget};

/* Log levels plugins use, matching the daemon's logging policy. */
pub const LOG_CRITICAL: u32 = 0;
pub const LOG_ERROR: u32 = 1;
pub const LOG_WARNING: u32 = 2;
pub const LOG_INFO: u32 = 3;
pub const LOG_VERBOSE: u32 = 4;
pub const LOG_DEBUG: u32 = 5;

pub struct EffectService {
    effect_name: String,
    device_name: String,
    device_model: String,
    device_serial: String,
    key_db: Arc<KeyDatabase>,
    key_groups: Vec<KeyGroup>,
    config: PluginConf,
    colors: HashMap<String, RGBAColor>,
    data_paths: Vec<PathBuf>,

    /* render-target pool: short-lived effects reuse buffers */
    free_targets: Vec<RenderTarget>,
    active_targets: Vec<RenderTarget>,

    file_buf: Option<Vec<u8>>,
    cstr_cache: HashMap<String, CString>,
}

impl EffectService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        effect_name: impl Into<String>,
        device_name: impl Into<String>,
        device_model: impl Into<String>,
        device_serial: impl Into<String>,
        key_db: Arc<KeyDatabase>,
        key_groups: Vec<KeyGroup>,
        config: PluginConf,
        colors: HashMap<String, RGBAColor>,
        data_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            effect_name: effect_name.into(),
            device_name: device_name.into(),
            device_model: device_model.into(),
            device_serial: device_serial.into(),
            key_db,
            key_groups,
            config,
            colors,
            data_paths,
            free_targets: Vec::new(),
            active_targets: Vec::new(),
            file_buf: None,
            cstr_cache: HashMap::new(),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device_model(&self) -> &str {
        &self.device_model
    }

    pub fn device_serial(&self) -> &str {
        &self.device_serial
    }

    pub fn key_db(&self) -> &KeyDatabase {
        &self.key_db
    }

    pub fn key_groups(&self) -> &[KeyGroup] {
        &self.key_groups
    }

    pub fn configuration(&self) -> &PluginConf {
        &self.config
    }

    pub fn colors(&self) -> &HashMap<String, RGBAColor> {
        &self.colors
    }

    /* --- typed configuration access ---------------------------------- */

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(ConfigValue::as_scalar)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get_string(key)?.trim().parse().ok()
    }

    pub fn get_int_in(&self, key: &str, min: i64, max: i64) -> Option<i64> {
        self.get_int(key).filter(|v| (min..=max).contains(v))
    }

    /* "250", "250ms", "3s" or "2m"; bare numbers are milliseconds. */
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        parse_duration(self.get_string(key)?)
    }

    /* Named palette entries take precedence over literal color syntax. */
    pub fn get_color(&self, key: &str) -> Option<RGBAColor> {
        let text = self.get_string(key)?;
        self.resolve_color(text)
    }

    /* A color sequence under `key`, with the legacy fallback of scalar
     * options `key0`, `key1`, ... treated as one sequence. */
    pub fn get_colors(&self, key: &str) -> Vec<RGBAColor> {
        if let Some(seq) = self.config.get(key).and_then(ConfigValue::as_sequence) {
            return seq.iter().filter_map(|t| self.resolve_color(t)).collect();
        }
        let mut colors = Vec::new();
        for idx in 0usize.. {
            let Some(text) = self.get_string(&format!("{key}{idx}")) else {
                break;
            };
            if let Some(color) = self.resolve_color(text) {
                colors.push(color);
            }
        }
        colors
    }

    pub fn get_key_group(&self, key: &str) -> Option<&KeyGroup> {
        let name = self.get_string(key)?;
        self.key_groups.iter().find(|g| g.name() == name)
    }

    fn resolve_color(&self, text: &str) -> Option<RGBAColor> {
        if let Some(color) = self.colors.get(text) {
            return Some(*color);
        }
        RGBAColor::parse(text)
    }

    /* --- render-target pool ------------------------------------------ */

    pub fn create_render_target(&mut self) -> RenderTarget {
        self.free_targets
            .pop()
            .unwrap_or_else(|| RenderTarget::new(self.key_db.len()))
    }

    pub fn destroy_render_target(&mut self, target: RenderTarget) {
        self.free_targets.push(target);
    }

    /* --- data files --------------------------------------------------- */

    /* Read a file from the effect-data search path. The buffer stays owned
     * by the service until the next call; an empty path just releases it. */
    pub fn get_file(&mut self, relpath: &str) -> &[u8] {
        self.file_buf = None;
        if relpath.is_empty() || relpath.contains("..") {
            return &[];
        }
        for dir in &self.data_paths {
            if let Ok(data) = std::fs::read(dir.join(relpath)) {
                self.file_buf = Some(data);
                break;
            }
        }
        self.file_buf.as_deref().unwrap_or(&[])
    }

    /* --- logging ------------------------------------------------------ */

    pub fn log(&self, level: u32, message: &str) {
        let effect = self.effect_name.as_str();
        match level {
            LOG_CRITICAL | LOG_ERROR => error!(effect, "{message}"),
            LOG_WARNING => warn!(effect, "{message}"),
            LOG_INFO => info!(effect, "{message}"),
            LOG_VERBOSE => debug!(effect, "{message}"),
            _ => trace!(effect, "{message}"),
        }
    }
}

/* Owns an EffectService together with the ABI table pointing at it. Boxed
 * so the ctx pointer stays valid for the effect's whole lifetime. */
pub struct ServiceBox {
    pub table: ServiceTable,
    pub service: EffectService,
}

impl ServiceBox {
    pub fn new(service: EffectService) -> Box<Self> {
        let mut boxed = Box::new(Self {
            table: ServiceTable {
                ctx: std::ptr::null_mut(),
                get_config: svc_get_config,
                log: svc_log,
                target_size: svc_target_size,
                create_render_target: svc_create_render_target,
                destroy_render_target: svc_destroy_render_target,
                get_file: svc_get_file,
            },
            service,
        });
        boxed.table.ctx = &mut boxed.service as *mut EffectService as *mut c_void;
        boxed
    }
}

/* ABI shims. Each recovers the service from the opaque ctx pointer; the
 * pointer is valid as long as the owning ServiceBox is alive, which the
 * effect instance guarantees. */

unsafe fn service_from(ctx: *mut c_void) -> &'static mut EffectService {
    &mut *(ctx as *mut EffectService)
}

unsafe extern "C" fn svc_get_config(ctx: *mut c_void, key: *const c_char) -> *const c_char {
    if ctx.is_null() || key.is_null() {
        return std::ptr::null();
    }
    let service = service_from(ctx);
    let Ok(key) = CStr::from_ptr(key).to_str() else {
        return std::ptr::null();
    };
    let Some(value) = service.get_string(key).map(str::to_string) else {
        return std::ptr::null();
    };
    let entry = service
        .cstr_cache
        .entry(key.to_string())
        .or_insert_with(|| CString::new(value).unwrap_or_default());
    entry.as_ptr()
}

unsafe extern "C" fn svc_log(ctx: *mut c_void, level: u32, message: *const c_char) {
    if ctx.is_null() || message.is_null() {
        return;
    }
    let service = service_from(ctx);
    service.log(level, &CStr::from_ptr(message).to_string_lossy());
}

unsafe extern "C" fn svc_target_size(ctx: *mut c_void) -> usize {
    if ctx.is_null() {
        return 0;
    }
    service_from(ctx).key_db.len()
}

unsafe extern "C" fn svc_create_render_target(ctx: *mut c_void) -> *mut RGBAColor {
    if ctx.is_null() {
        return std::ptr::null_mut();
    }
    let service = service_from(ctx);
    let mut target = service.create_render_target();
    let ptr = target.as_mut_ptr();
    service.active_targets.push(target);
    ptr
}

unsafe extern "C" fn svc_destroy_render_target(ctx: *mut c_void, ptr: *mut RGBAColor) {
    if ctx.is_null() || ptr.is_null() {
        return;
    }
    let service = service_from(ctx);
    if let Some(pos) = service
        .active_targets
        .iter_mut()
        .position(|t| t.as_mut_ptr() == ptr)
    {
        let target = service.active_targets.swap_remove(pos);
        service.destroy_render_target(target);
    }
}

unsafe extern "C" fn svc_get_file(
    ctx: *mut c_void,
    relpath: *const c_char,
    len: *mut usize,
) -> *const u8 {
    if ctx.is_null() || relpath.is_null() || len.is_null() {
        return std::ptr::null();
    }
    let service = service_from(ctx);
    let Ok(relpath) = CStr::from_ptr(relpath).to_str() else {
        *len = 0;
        return std::ptr::null();
    };
    let data = service.get_file(relpath);
    *len = data.len();
    if data.is_empty() {
        std::ptr::null()
    } else {
        data.as_ptr()
    }
}

/* "250" (ms), "250ms", "3s", "2m" */
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if let Some(num) = text.strip_suffix("ms") {
        return num.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(num) = text.strip_suffix('s') {
        return num.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(num) = text.strip_suffix('m') {
        return num.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    text.parse().ok().map(Duration::from_millis)
}
