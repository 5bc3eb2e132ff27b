/* keyledsd library: HID++ 2.0 protocol client, render engine and effect plugin
 * host for Logitech per-key RGB keyboards. Shared by the `keyledsd` daemon and
 * the `keyledsctl` query tool. */

pub mod config;
pub mod context;
pub mod device;
pub mod effect;
pub mod hid;
pub mod keydb;
pub mod layout;
pub mod manager;
pub mod render;
pub mod scancodes;
pub mod service;
pub mod watcher;

/* Application identifiers: a 4-bit tag embedded in every feature call so
 * concurrent HID++ software can tell responses apart. */
pub const APP_ID_DAEMON: u8 = 0x02;
pub const APP_ID_CTL: u8 = 0x01;
