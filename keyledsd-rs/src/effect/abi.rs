/* Stable C ABI between the daemon and effect plugins.
 *
 * A plugin library exports one `keyledsd_module` symbol: a module definition
 * carrying a fixed 16-byte signature, the ABI revision and the engine
 * version it was built against. Everything behind `initialize` is expressed
 * as function tables so the contract holds for plugins written in any
 * language. */

use std::os::raw::{c_char, c_void};

use crate::render::RGBAColor;

/* First bytes of every valid module; mismatch rejects the library before
 * its initialize entry point is ever called. */
pub const MODULE_SIGNATURE: [u8; 16] = [
    0xa7, 0x96, 0x85, 0xd4, 0xa9, 0x0c, 0x11, 0xe7, 0x98, 0x22, 0x28, 0xb2, 0xbd, 0x4c, 0xbb,
    0xe3,
];

pub const ABI_VERSION: u32 = 2;
pub const ENGINE_MAJOR: u16 = 1;
pub const ENGINE_MINOR: u16 = 0;

/* Exported symbol name, nul-terminated for the loader. */
pub const MODULE_ENTRY: &[u8] = b"keyledsd_module\0";

/* What the engine tells a module at initialisation. `error` lets the module
 * report a failure message before returning null from initialize. */
#[repr(C)]
pub struct HostDefinition {
    pub major: u16,
    pub minor: u16,
    pub error: unsafe extern "C" fn(*const c_char),
}

/* One key/value pair of a context map crossing the ABI. */
#[repr(C)]
pub struct KeyValue {
    pub key: *const c_char,
    pub value: *const c_char,
}

/* The module entry point structure. */
#[repr(C)]
pub struct ModuleDefinition {
    pub signature: [u8; 16],
    pub abi_version: u32,
    pub major: u16,
    pub minor: u16,
    /* returns the plugin table, or null after calling host->error */
    pub initialize: unsafe extern "C" fn(*const HostDefinition) -> *mut PluginTable,
    pub shutdown: unsafe extern "C" fn(*const HostDefinition, *mut PluginTable) -> bool,
}

/* SAFETY: fn pointers and plain bytes; referenced from multiple threads
 * without interior mutability. */
unsafe impl Sync for ModuleDefinition {}

/* Per-plugin function table returned by initialize. `create_effect` returns
 * null when the plugin does not implement the named effect. */
#[repr(C)]
pub struct PluginTable {
    pub userdata: *mut c_void,
    pub create_effect:
        unsafe extern "C" fn(*mut PluginTable, *const c_char, *mut ServiceTable) -> *mut EffectTable,
    pub destroy_effect:
        unsafe extern "C" fn(*mut PluginTable, *mut EffectTable, *mut ServiceTable),
}

/* Per-effect function table. `render` receives the shared color buffer and
 * its logical length; elapsed time is in milliseconds. */
#[repr(C)]
pub struct EffectTable {
    pub userdata: *mut c_void,
    pub handle_context_change: unsafe extern "C" fn(*mut EffectTable, *const KeyValue, usize),
    pub handle_generic_event: unsafe extern "C" fn(*mut EffectTable, *const KeyValue, usize),
    pub handle_key_event: unsafe extern "C" fn(*mut EffectTable, u32, u32, bool),
    pub render: unsafe extern "C" fn(*mut EffectTable, u64, *mut RGBAColor, usize),
}

/* Host services handed to a plugin alongside effect creation. `ctx` is an
 * opaque handle owned by the engine; plugins must pass it back verbatim. */
#[repr(C)]
pub struct ServiceTable {
    pub ctx: *mut c_void,
    /* scalar configuration value for a key, or null */
    pub get_config: unsafe extern "C" fn(*mut c_void, *const c_char) -> *const c_char,
    /* levels: 0 critical .. 5 debug */
    pub log: unsafe extern "C" fn(*mut c_void, u32, *const c_char),
    pub target_size: unsafe extern "C" fn(*mut c_void) -> usize,
    pub create_render_target: unsafe extern "C" fn(*mut c_void) -> *mut RGBAColor,
    pub destroy_render_target: unsafe extern "C" fn(*mut c_void, *mut RGBAColor),
    /* read a file from the effect data path; empty path releases the last
     * buffer so plugins can free memory after parsing */
    pub get_file: unsafe extern "C" fn(*mut c_void, *const c_char, *mut usize) -> *const u8,
}
