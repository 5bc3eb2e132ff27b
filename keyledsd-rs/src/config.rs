/* Daemon configuration: the YAML document declaring plugins, key groups,
 * effect groups and context-matched profiles.
 *
 * Parsing is two-staged: serde deserialises the raw document, then the raw
 * tree is compiled into the runtime form (anchored regexes, typed plugin
 * options). A profile with an invalid lookup regex is dropped whole, with a
 * log; the rest of the document stays usable. Reload errors keep the
 * previous configuration active (handled by the caller). */

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::context::Context;
use crate::render::RGBAColor;

pub const DEFAULT_FPS: u32 = 16;

/* Profiles with these names match when nothing else does. */
const DEFAULT_PROFILE_NAMES: &[&str] = &["__default__", "default"];
/* This profile's effects are appended to every selection. */
const OVERLAY_PROFILE_NAME: &str = "__overlay__";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        let line = err.location().map(|l| l.line()).unwrap_or(0);
        Self::Parse { line, message: err.to_string() }
    }
}

/* A raw plugin option: scalar or sequence of scalars. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Scalar(String),
    Sequence(Vec<String>),
}

impl ConfigValue {
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            Self::Sequence(_) => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[String]> {
        match self {
            Self::Scalar(_) => None,
            Self::Sequence(seq) => Some(seq),
        }
    }
}

/* One plugin instantiation inside an effect group. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConf {
    pub name: String,
    pub options: Vec<(String, ConfigValue)>,
}

impl PluginConf {
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.options.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/* A named bundle of plugin instantiations with shared key groups. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectGroup {
    pub name: String,
    pub groups: HashMap<String, Vec<String>>,
    pub plugins: Vec<PluginConf>,
}

/* A context-conditional selection of effect groups. */
#[derive(Debug)]
pub struct Profile {
    pub name: String,
    pub devices: Vec<String>,
    lookup: Vec<(String, Regex)>,
    pub effect_groups: Vec<String>,
}

impl Profile {
    /* All lookup entries must match the context value in full; a missing
     * context value matches only patterns accepting the empty string. */
    pub fn matches(&self, context: &Context) -> bool {
        self.lookup
            .iter()
            .all(|(key, regex)| regex.is_match(context.get(key).unwrap_or("")))
    }

    pub fn is_default(&self) -> bool {
        DEFAULT_PROFILE_NAMES.contains(&self.name.as_str())
    }

    pub fn is_overlay(&self) -> bool {
        self.name == OVERLAY_PROFILE_NAME
    }
}

#[derive(Debug)]
pub struct Config {
    pub plugins: Vec<String>,
    pub plugin_paths: Vec<String>,
    pub layout_paths: Vec<String>,
    /* serial to user-facing name */
    pub devices: HashMap<String, String>,
    pub groups: HashMap<String, Vec<String>>,
    pub colors: HashMap<String, RGBAColor>,
    pub effect_groups: Vec<EffectGroup>,
    pub profiles: Vec<Profile>,
    pub auto_quit: bool,
    pub fps: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    plugins: Vec<String>,
    #[serde(default, rename = "plugin-paths")]
    plugin_paths: Vec<String>,
    #[serde(default, rename = "layout-paths")]
    layout_paths: Vec<String>,
    #[serde(default)]
    devices: HashMap<String, String>,
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    colors: HashMap<String, String>,
    #[serde(default)]
    effects: HashMap<String, RawEffectGroup>,
    #[serde(default)]
    profiles: Vec<RawProfile>,
    #[serde(default, rename = "auto-quit")]
    auto_quit: bool,
    #[serde(default)]
    fps: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawEffectGroup {
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    plugins: Vec<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    name: String,
    #[serde(default)]
    devices: Vec<String>,
    #[serde(default)]
    lookup: HashMap<String, String>,
    #[serde(default)]
    effects: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
            plugin_paths: Vec::new(),
            layout_paths: Vec::new(),
            devices: HashMap::new(),
            groups: HashMap::new(),
            colors: HashMap::new(),
            effect_groups: Vec::new(),
            profiles: Vec::new(),
            auto_quit: false,
            fps: DEFAULT_FPS,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;

        let mut colors = HashMap::new();
        for (name, value) in raw.colors {
            match RGBAColor::parse(&value) {
                Some(color) => {
                    colors.insert(name, color);
                }
                None => warn!("color <{name}>: cannot parse value <{value}>"),
            }
        }

        let mut effect_groups = Vec::new();
        for (name, raw_group) in raw.effects {
            let mut plugins = Vec::new();
            for entry in raw_group.plugins {
                match compile_plugin_conf(&entry) {
                    Some(conf) => plugins.push(conf),
                    None => warn!("effect group <{name}>: plugin entry is not usable, skipped"),
                }
            }
            effect_groups.push(EffectGroup { name, groups: raw_group.groups, plugins });
        }
        effect_groups.sort_by(|a, b| a.name.cmp(&b.name));

        let mut profiles = Vec::new();
        for raw_profile in raw.profiles {
            match compile_profile(raw_profile) {
                Ok(profile) => profiles.push(profile),
                Err((name, err)) => {
                    warn!("profile <{name}> dropped: {err}");
                }
            }
        }

        Ok(Self {
            plugins: raw.plugins,
            plugin_paths: raw.plugin_paths,
            layout_paths: raw.layout_paths,
            devices: raw.devices,
            groups: raw.groups,
            colors,
            effect_groups,
            profiles,
            auto_quit: raw.auto_quit,
            fps: raw.fps.unwrap_or(DEFAULT_FPS).max(1),
        })
    }

    /* User-facing name for a device serial; falls back to the serial. */
    pub fn device_name(&self, serial: &str) -> String {
        self.devices.get(serial).cloned().unwrap_or_else(|| serial.to_string())
    }

    pub fn effect_group(&self, name: &str) -> Option<&EffectGroup> {
        self.effect_groups.iter().find(|g| g.name == name)
    }

    /* Resolve the effect groups active for one device under a context.
     *
     * Profiles restricted to other devices are skipped (an empty device
     * list matches every device). The first profile whose lookup matches
     * wins; otherwise the default profile applies. The overlay profile's
     * groups are always appended when present. */
    pub fn effect_groups_for(&self, device_name: &str, context: &Context) -> Vec<&EffectGroup> {
        let mut matched: Option<&Profile> = None;
        let mut default: Option<&Profile> = None;
        let mut overlay: Option<&Profile> = None;

        for profile in &self.profiles {
            if !profile.devices.is_empty()
                && !profile.devices.iter().any(|d| d == device_name)
            {
                continue;
            }
            if profile.is_default() {
                default.get_or_insert(profile);
            } else if profile.is_overlay() {
                overlay.get_or_insert(profile);
            } else if matched.is_none() && profile.matches(context) {
                debug!("profile matches: {}", profile.name);
                matched = Some(profile);
            }
        }

        let selected = matched.or(default);
        let mut names: Vec<&String> = Vec::new();
        if let Some(profile) = selected {
            names.extend(profile.effect_groups.iter());
        }
        if let Some(profile) = overlay {
            names.extend(profile.effect_groups.iter());
        }

        let mut result = Vec::new();
        for name in names {
            match self.effect_group(name) {
                Some(group) => result.push(group),
                None => warn!("reference to unknown effect group <{name}>"),
            }
        }
        result
    }
}

fn compile_plugin_conf(entry: &serde_yaml::Value) -> Option<PluginConf> {
    let mapping = entry.as_mapping()?;
    let mut name = None;
    let mut options = Vec::new();

    for (key, value) in mapping {
        let key = key.as_str()?.to_string();
        if key == "plugin" || key == "effect" {
            name = Some(value.as_str()?.to_string());
            continue;
        }
        match yaml_to_value(value) {
            Some(value) => options.push((key, value)),
            None => return None,
        }
    }
    Some(PluginConf { name: name?, options })
}

fn yaml_to_value(value: &serde_yaml::Value) -> Option<ConfigValue> {
    match value {
        serde_yaml::Value::String(s) => Some(ConfigValue::Scalar(s.clone())),
        serde_yaml::Value::Number(n) => Some(ConfigValue::Scalar(n.to_string())),
        serde_yaml::Value::Bool(b) => Some(ConfigValue::Scalar(b.to_string())),
        serde_yaml::Value::Sequence(seq) => {
            let mut items = Vec::with_capacity(seq.len());
            for item in seq {
                match yaml_to_value(item)? {
                    ConfigValue::Scalar(s) => items.push(s),
                    ConfigValue::Sequence(_) => return None,
                }
            }
            Some(ConfigValue::Sequence(items))
        }
        _ => None,
    }
}

fn compile_profile(raw: RawProfile) -> Result<Profile, (String, regex::Error)> {
    let mut lookup = Vec::with_capacity(raw.lookup.len());
    for (key, pattern) in raw.lookup {
        /* full-string matching, same as the in-process context watchers */
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => lookup.push((key, regex)),
            Err(err) => return Err((raw.name, err)),
        }
    }
    Ok(Profile {
        name: raw.name,
        devices: raw.devices,
        lookup,
        effect_groups: raw.effects,
    })
}

/* Default configuration file locations, first match wins. */
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(Path::new(&dir).join("keyledsd.yaml"));
    } else if let Ok(home) = std::env::var("HOME") {
        paths.push(Path::new(&home).join(".config/keyledsd.yaml"));
    }
    paths.push(PathBuf::from("/etc/keyledsd.yaml"));
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"
plugins: [fill, wave]
plugin-paths: [/usr/lib/keyledsd]
devices:
  "0123456789abcdef": main
groups:
  functions: [F1, F2, F3]
colors:
  accent: "#ff8000"
  broken: "not-a-color"
effects:
  bg:
    plugins:
      - plugin: fill
        color: "#202020"
  typing:
    groups:
      letters: [A, B]
    plugins:
      - effect: feedback
        duration: 600
        colors: [red, blue]
  notif:
    plugins:
      - plugin: stars
        number: 8
profiles:
  - name: default
    effects: [bg]
  - name: coding
    lookup:
      class: "kate"
    effects: [typing]
  - name: other-device
    devices: [secondary]
    lookup:
      class: ".*"
    effects: [typing]
  - name: __overlay__
    effects: [notif]
"##;

    fn context(class: &str) -> Context {
        [("class", class)].into_iter().collect()
    }

    #[test]
    fn parses_top_level_sections() {
        let config = Config::from_str(SAMPLE).expect("parse");
        assert_eq!(config.plugins, vec!["fill", "wave"]);
        assert_eq!(config.plugin_paths, vec!["/usr/lib/keyledsd"]);
        assert_eq!(config.device_name("0123456789abcdef"), "main");
        assert_eq!(config.device_name("ffff"), "ffff");
        assert_eq!(config.groups["functions"], vec!["F1", "F2", "F3"]);
        assert_eq!(config.colors["accent"], RGBAColor::new(255, 128, 0, 255));
        assert!(!config.colors.contains_key("broken"));
        assert_eq!(config.fps, DEFAULT_FPS);
    }

    #[test]
    fn plugin_options_are_typed() {
        let config = Config::from_str(SAMPLE).expect("parse");
        let typing = config.effect_group("typing").expect("group");
        assert_eq!(typing.groups["letters"], vec!["A", "B"]);
        let plugin = &typing.plugins[0];
        assert_eq!(plugin.name, "feedback");
        assert_eq!(plugin.get("duration"), Some(&ConfigValue::Scalar("600".into())));
        assert_eq!(
            plugin.get("colors"),
            Some(&ConfigValue::Sequence(vec!["red".into(), "blue".into()]))
        );
    }

    #[test]
    fn default_profile_applies_when_nothing_matches() {
        let config = Config::from_str(SAMPLE).expect("parse");
        let groups = config.effect_groups_for("main", &context("firefox"));
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["bg", "notif"]);
    }

    #[test]
    fn matching_profile_replaces_default() {
        let config = Config::from_str(SAMPLE).expect("parse");
        let groups = config.effect_groups_for("main", &context("kate"));
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["typing", "notif"]);
    }

    #[test]
    fn device_scoping_excludes_profiles() {
        let config = Config::from_str(SAMPLE).expect("parse");
        /* other-device's catch-all lookup must not apply to main */
        let groups = config.effect_groups_for("main", &context("anything"));
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["bg", "notif"]);

        /* but it does apply to secondary */
        let groups = config.effect_groups_for("secondary", &context("anything"));
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["typing", "notif"]);
    }

    #[test]
    fn lookup_requires_full_match() {
        let config = Config::from_str(SAMPLE).expect("parse");
        let groups = config.effect_groups_for("main", &context("kate-editor"));
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["bg", "notif"]);
    }

    #[test]
    fn invalid_regex_drops_the_profile() {
        let text = r#"
effects:
  bg:
    plugins: [{plugin: fill}]
profiles:
  - name: broken
    lookup:
      class: "["
    effects: [bg]
  - name: default
    effects: [bg]
"#;
        let config = Config::from_str(text).expect("parse");
        assert_eq!(config.profiles.len(), 1);
        assert_eq!(config.profiles[0].name, "default");
    }

    #[test]
    fn unknown_top_level_key_is_an_error() {
        let err = Config::from_str("no-such-option: 1").expect_err("reject");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn parse_error_carries_line() {
        let err = Config::from_str("profiles:\n  - name: [broken\n").expect_err("reject");
        match err {
            ConfigError::Parse { line, .. } => assert!(line > 0),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
