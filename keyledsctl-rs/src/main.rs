/* keyledsctl: query and control Logitech keyboard LEDs over HID++, talking
 * straight to the hidraw node. */

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use keyledsd::device::features::{block_by_name, block_name, KeyColor, BLOCK_KEYS};
use keyledsd::device::{Device, TARGET_DEFAULT};
use keyledsd::render::RGBAColor;
use keyledsd::scancodes;
use keyledsd::watcher;
use keyledsd::APP_ID_CTL;

/* exit codes */
const EXIT_USAGE: u8 = 1;
const EXIT_NO_DEVICE: u8 = 2;
const EXIT_QUERY_FAILED: u8 = 3;
const EXIT_BAD_BLOCK: u8 = 4;
const EXIT_LED_READ: u8 = 5;

/// keyledsctl: inspect and drive Logitech keyboard lighting.
#[derive(Parser)]
#[command(name = "keyledsctl", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected Logitech HID devices.
    List,

    /// Show device identity, firmware and feature information.
    Info {
        /// Device node (default: first device found).
        #[arg(short = 'd', long = "device", env = "KEYLEDS_DEVICE")]
        device: Option<PathBuf>,
    },

    /// Read current LED colors.
    #[command(name = "get-leds")]
    GetLeds {
        #[arg(short = 'd', long = "device", env = "KEYLEDS_DEVICE")]
        device: Option<PathBuf>,
        /// LED block to read (keys, multimedia, gkeys, logo, modes).
        #[arg(short = 'b', long = "block", default_value = "keys")]
        block: String,
    },

    /// Set LED colors from key=color directives ("all=color" fills a block).
    #[command(name = "set-leds")]
    SetLeds {
        #[arg(short = 'd', long = "device", env = "KEYLEDS_DEVICE")]
        device: Option<PathBuf>,
        #[arg(short = 'b', long = "block", default_value = "keys")]
        block: String,
        /// key=color directives, e.g. "A=#ff0000" or "all=black".
        #[arg(required = true)]
        directives: Vec<String>,
    },

    /// Enable or disable custom GKeys behavior.
    Gkeys {
        #[arg(short = 'd', long = "device", env = "KEYLEDS_DEVICE")]
        device: Option<PathBuf>,
        /// "on" or "off".
        state: String,
    },

    /// Set game-mode blocked keys (empty list clears).
    Gamemode {
        #[arg(short = 'd', long = "device", env = "KEYLEDS_DEVICE")]
        device: Option<PathBuf>,
        /// Key names to block while in game mode.
        keys: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let is_usage_error = err.use_stderr();
            let _ = err.print();
            /* help/version are not usage errors */
            return if is_usage_error {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let code = match cli.command {
        Commands::List => cmd_list(),
        Commands::Info { device } => cmd_info(device),
        Commands::GetLeds { device, block } => cmd_get_leds(device, &block),
        Commands::SetLeds { device, block, directives } => {
            cmd_set_leds(device, &block, &directives)
        }
        Commands::Gkeys { device, state } => cmd_gkeys(device, &state),
        Commands::Gamemode { device, keys } => cmd_gamemode(device, &keys),
    };
    ExitCode::from(code)
}

/* Open the requested device, or the first one discovered. */
fn open_device(path: Option<PathBuf>) -> Result<Device, u8> {
    let path = match path {
        Some(path) => path,
        None => match watcher::enumerate() {
            Ok(devices) if !devices.is_empty() => devices[0].dev_node.clone(),
            _ => {
                eprintln!("no device found");
                return Err(EXIT_NO_DEVICE);
            }
        },
    };
    Device::open(&path, APP_ID_CTL).map_err(|err| {
        eprintln!("cannot open {}: {err}", path.display());
        EXIT_NO_DEVICE
    })
}

fn cmd_list() -> u8 {
    let devices = match watcher::enumerate() {
        Ok(devices) => devices,
        Err(err) => {
            eprintln!("device enumeration failed: {err}");
            return EXIT_NO_DEVICE;
        }
    };
    for dev in devices {
        println!(
            "{}\t{}:{}\t{}\t{}",
            dev.dev_node.display(),
            dev.vendor_id,
            dev.product_id,
            dev.serial,
            dev.product
        );
    }
    0
}

fn cmd_info(path: Option<PathBuf>) -> u8 {
    let mut device = match open_device(path) {
        Ok(device) => device,
        Err(code) => return code,
    };

    let report = (|| -> Result<(), keyledsd::device::error::DeviceError> {
        let name = device.get_device_name(TARGET_DEFAULT)?;
        let kind = device.get_device_type(TARGET_DEFAULT)?;
        println!("Name:           {name}");
        println!("Type:           {kind}");

        let version = device.get_device_version(TARGET_DEFAULT)?;
        println!("Model:          {}", version.model_string());
        println!("Serial:         {}", version.serial_string());
        for proto in &version.protocols {
            println!(
                "Firmware:       {} v{}.{}.{:x}{}",
                proto.prefix,
                proto.version_major,
                proto.version_minor,
                proto.build,
                if proto.is_active { " (active)" } else { "" }
            );
        }

        let count = device.get_feature_count(TARGET_DEFAULT)?;
        let mut features = Vec::new();
        for idx in 0..=count {
            if let Ok(id) = device.get_feature_id(TARGET_DEFAULT, idx) {
                features.push(format!("{id:04x}"));
            }
        }
        println!("Features:       [{}]", features.join(", "));

        if let Ok(count) = device.gkeys_count(TARGET_DEFAULT) {
            println!("GKeys:          {count}");
        }
        if let Ok(rates) = device.get_report_rates(TARGET_DEFAULT) {
            let current = device.get_report_rate(TARGET_DEFAULT).unwrap_or(0);
            let rates: Vec<String> = rates
                .iter()
                .map(|&r| {
                    if r == current {
                        format!("[{r}ms]")
                    } else {
                        format!("{r}ms")
                    }
                })
                .collect();
            println!("Report rates:   {}", rates.join(" "));
        }

        for block in device.get_block_info(TARGET_DEFAULT)? {
            println!(
                "Block 0x{:04x}:   {:12} {:3} keys, max rgb {}/{}/{}",
                block.id,
                block_name(block.id).unwrap_or("unknown"),
                block.nb_keys,
                block.max_red,
                block.max_green,
                block.max_blue
            );
        }
        Ok(())
    })();

    match report {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("device query failed: {err}");
            EXIT_QUERY_FAILED
        }
    }
}

fn resolve_block(name: &str) -> Result<u16, u8> {
    block_by_name(name).ok_or_else(|| {
        eprintln!("invalid block <{name}>");
        EXIT_BAD_BLOCK
    })
}

fn cmd_get_leds(path: Option<PathBuf>, block: &str) -> u8 {
    let block_id = match resolve_block(block) {
        Ok(id) => id,
        Err(code) => return code,
    };
    let mut device = match open_device(path) {
        Ok(device) => device,
        Err(code) => return code,
    };

    let blocks = match device.get_block_info(TARGET_DEFAULT) {
        Ok(blocks) => blocks,
        Err(err) => {
            eprintln!("device query failed: {err}");
            return EXIT_QUERY_FAILED;
        }
    };
    let Some(info) = blocks.iter().find(|b| b.id == block_id) else {
        eprintln!("led block {block} not present on device");
        return EXIT_BAD_BLOCK;
    };

    let leds = match device.get_leds(TARGET_DEFAULT, block_id, 0, info.nb_keys as usize) {
        Ok(leds) => leds,
        Err(err) => {
            eprintln!("led read failed: {err}");
            return EXIT_LED_READ;
        }
    };
    for led in leds {
        let color = RGBAColor::new(led.red, led.green, led.blue, 255);
        println!("{}: {color}", scancodes::key_name(block_id, led.id));
    }
    0
}

/* "A=#ff0000" etc. "all" fills the whole block. */
enum Directive {
    All(RGBAColor),
    Key(u8, RGBAColor),
}

fn parse_directive(text: &str, block_id: u16) -> Option<Directive> {
    let (key, color) = text.split_once('=')?;
    let color = RGBAColor::parse(color)?;
    if key.eq_ignore_ascii_case("all") {
        return Some(Directive::All(color));
    }
    /* key name from the static table, or a raw hexadecimal id */
    let id = match scancodes::key_by_name(key) {
        Some((block, id)) if block == block_id => id,
        Some(_) => return None, /* key belongs to another block */
        None => u8::from_str_radix(key.trim_start_matches("0x"), 16).ok()?,
    };
    Some(Directive::Key(id, color))
}

fn cmd_set_leds(path: Option<PathBuf>, block: &str, directives: &[String]) -> u8 {
    let block_id = match resolve_block(block) {
        Ok(id) => id,
        Err(code) => return code,
    };

    let mut parsed = Vec::with_capacity(directives.len());
    for text in directives {
        match parse_directive(text, block_id) {
            Some(directive) => parsed.push(directive),
            None => {
                eprintln!("cannot parse directive <{text}>");
                return EXIT_USAGE;
            }
        }
    }

    let mut device = match open_device(path) {
        Ok(device) => device,
        Err(code) => return code,
    };

    let mut keys: Vec<KeyColor> = Vec::new();
    let mut result = Ok(());
    for directive in &parsed {
        match *directive {
            Directive::All(color) => {
                /* flush pending per-key updates first to keep ordering */
                if !keys.is_empty() {
                    result = device.set_leds(TARGET_DEFAULT, block_id, &keys);
                    keys.clear();
                    if result.is_err() {
                        break;
                    }
                }
                result = device.set_led_block(
                    TARGET_DEFAULT,
                    block_id,
                    color.red,
                    color.green,
                    color.blue,
                );
                if result.is_err() {
                    break;
                }
            }
            Directive::Key(id, color) => keys.push(KeyColor {
                id,
                red: color.red,
                green: color.green,
                blue: color.blue,
            }),
        }
    }
    if result.is_ok() && !keys.is_empty() {
        result = device.set_leds(TARGET_DEFAULT, block_id, &keys);
    }
    if result.is_ok() {
        result = device.commit_leds(TARGET_DEFAULT);
    }

    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("led update failed: {err}");
            EXIT_QUERY_FAILED
        }
    }
}

fn cmd_gkeys(path: Option<PathBuf>, state: &str) -> u8 {
    let enabled = match state {
        "on" => true,
        "off" => false,
        other => {
            eprintln!("expected on|off, got <{other}>");
            return EXIT_USAGE;
        }
    };
    let mut device = match open_device(path) {
        Ok(device) => device,
        Err(code) => return code,
    };
    match device.gkeys_enable(TARGET_DEFAULT, enabled) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("gkeys update failed: {err}");
            EXIT_QUERY_FAILED
        }
    }
}

fn cmd_gamemode(path: Option<PathBuf>, keys: &[String]) -> u8 {
    let mut ids = Vec::with_capacity(keys.len());
    for name in keys {
        match scancodes::key_by_name(name) {
            Some((BLOCK_KEYS, id)) => ids.push(id),
            _ => {
                eprintln!("unknown key <{name}>");
                return EXIT_USAGE;
            }
        }
    }

    let mut device = match open_device(path) {
        Ok(device) => device,
        Err(code) => return code,
    };
    let result = device.gamemode_reset(TARGET_DEFAULT).and_then(|()| {
        if ids.is_empty() {
            Ok(())
        } else {
            device.gamemode_set(TARGET_DEFAULT, &ids)
        }
    });
    match result {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("gamemode update failed: {err}");
            EXIT_QUERY_FAILED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_parsing() {
        assert!(matches!(
            parse_directive("A=#ff0000", BLOCK_KEYS),
            Some(Directive::Key(0x04, color)) if color == RGBAColor::new(255, 0, 0, 255)
        ));
        assert!(matches!(
            parse_directive("all=black", BLOCK_KEYS),
            Some(Directive::All(_))
        ));
        assert!(matches!(
            parse_directive("0x2c=white", BLOCK_KEYS),
            Some(Directive::Key(0x2c, _))
        ));
        assert!(parse_directive("A", BLOCK_KEYS).is_none());
        assert!(parse_directive("A=notacolor", BLOCK_KEYS).is_none());
        /* G5 belongs to the gkeys block, not keys */
        assert!(parse_directive("G5=red", BLOCK_KEYS).is_none());
    }

    #[test]
    fn gamemode_resolves_main_block_only() {
        assert_eq!(scancodes::key_by_name("W"), Some((BLOCK_KEYS, 0x1a)));
    }
}
