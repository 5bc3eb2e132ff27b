/* Keyboard layout descriptions: per-model XML files mapping device keys to
 * names and physical positions. The file for a device is named
 * `<model>_<layout id in hex>.xml` and searched in the configured layout
 * paths followed by the XDG data directories. */

use std::io::BufRead;
use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::{info, warn};

use crate::keydb::Rect;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("XML error at position {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("invalid attribute {name}: {value}")]
    InvalidAttribute { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutKey {
    pub block: u16,
    pub code: u8,
    pub name: Option<String>,
    pub rect: Rect,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutDescription {
    pub name: String,
    pub keys: Vec<LayoutKey>,
}

impl LayoutDescription {
    /* Parse a layout document. Any element named `key` contributes an entry;
     * the surrounding structure is free-form. */
    pub fn parse(input: impl BufRead) -> Result<Self, LayoutError> {
        let mut reader = Reader::from_reader(input);
        reader.config_mut().trim_text(true);

        let mut description = LayoutDescription::default();
        let mut buf = Vec::new();

        loop {
            let event = reader.read_event_into(&mut buf).map_err(|source| {
                LayoutError::Xml { position: reader.buffer_position(), source }
            })?;
            match event {
                Event::Start(ref element) | Event::Empty(ref element) => {
                    let tag = element.name();
                    match tag.as_ref() {
                        b"keyboard" => {
                            for attr in element.attributes().flatten() {
                                if attr.key.as_ref() == b"name" {
                                    description.name =
                                        String::from_utf8_lossy(&attr.value).into_owned();
                                }
                            }
                        }
                        b"key" => {
                            if let Some(key) = parse_key(element)? {
                                description.keys.push(key);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(description)
    }

    /* Locate and parse the layout file for a device, trying `paths` in
     * order. Returns an empty description when no file matches; the key
     * database then falls back to device-reported names. */
    pub fn load(model: &str, layout_id: u8, paths: &[PathBuf]) -> Self {
        let file_name = format!("{model}_{layout_id:04x}.xml");
        for dir in paths {
            let full = dir.join(&file_name);
            let Ok(file) = std::fs::File::open(&full) else {
                continue;
            };
            match Self::parse(std::io::BufReader::new(file)) {
                Ok(description) => {
                    info!("loaded layout {}", full.display());
                    return description;
                }
                Err(err) => {
                    warn!("layout {}: {err}", full.display());
                }
            }
        }
        Self::default()
    }
}

/* Search path for layout files: configured directories first, then the XDG
 * data directories. */
pub fn layout_paths(configured: &[String]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = configured.iter().map(PathBuf::from).collect();
    if let Ok(home) = std::env::var("XDG_DATA_HOME") {
        paths.push(Path::new(&home).join("keyledsd/layouts"));
    } else if let Ok(home) = std::env::var("HOME") {
        paths.push(Path::new(&home).join(".local/share/keyledsd/layouts"));
    }
    let system = std::env::var("XDG_DATA_DIRS")
        .unwrap_or_else(|_| "/usr/local/share:/usr/share".to_string());
    for dir in system.split(':').filter(|d| !d.is_empty()) {
        paths.push(Path::new(dir).join("keyledsd/layouts"));
    }
    paths
}

fn parse_key(element: &quick_xml::events::BytesStart<'_>) -> Result<Option<LayoutKey>, LayoutError> {
    let mut block = None;
    let mut code = None;
    let mut name = None;
    let mut rect = Rect::default();

    for attr in element.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        let key = attr.key;
        let parse_num = |radix_aware: &str| -> Result<u32, LayoutError> {
            let text = radix_aware.trim();
            let parsed = if let Some(hex) = text.strip_prefix("0x") {
                u32::from_str_radix(hex, 16)
            } else {
                text.parse()
            };
            parsed.map_err(|_| LayoutError::InvalidAttribute {
                name: String::from_utf8_lossy(key.as_ref()).into_owned(),
                value: text.to_string(),
            })
        };

        match key.as_ref() {
            b"block" => block = Some(parse_num(&value)? as u16),
            b"code" => code = Some(parse_num(&value)? as u8),
            b"name" => name = Some(value),
            b"x0" => rect.x0 = parse_num(&value)?,
            b"y0" => rect.y0 = parse_num(&value)?,
            b"x1" => rect.x1 = parse_num(&value)?,
            b"y1" => rect.y1 = parse_num(&value)?,
            _ => {}
        }
    }

    /* entries without an address are decorative, skip them */
    let (Some(block), Some(code)) = (block, code) else {
        return Ok(None);
    };
    Ok(Some(LayoutKey { block, code, name, rect }))
}
