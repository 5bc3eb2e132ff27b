/* Device manager: binds one opened keyboard to its configuration. Owns the
 * key database and the render loop, materialises effect groups on demand
 * and swaps the active effect list whenever the context changes. */

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::{Config, EffectGroup};
use crate::context::Context;
use crate::device::error::DeviceError;
use crate::effect::{service::EffectService, EffectHandle, EffectManager};
use crate::keydb::{KeyDatabase, KeyGroup};
use crate::layout::{self, LayoutDescription};
use crate::render::rloop::{LedDevice, RenderLoop};

pub struct DeviceManager {
    sys_path: PathBuf,
    dev_node: PathBuf,
    serial: String,
    model: String,
    name: String,
    config: Arc<Config>,
    effect_manager: Arc<EffectManager>,
    key_db: Arc<KeyDatabase>,
    /* materialised effect groups, by group name */
    group_cache: HashMap<String, Vec<EffectHandle>>,
    render_loop: RenderLoop,
    context: Context,
}

impl DeviceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sys_path: PathBuf,
        dev_node: PathBuf,
        serial: String,
        model: String,
        device: Box<dyn LedDevice>,
        layout_id: Option<u8>,
        config: Arc<Config>,
        effect_manager: Arc<EffectManager>,
        on_fatal: Box<dyn FnOnce(DeviceError) + Send>,
    ) -> Self {
        let name = config.device_name(&serial);

        let layout = match layout_id {
            Some(id) => {
                LayoutDescription::load(&model, id, &layout::layout_paths(&config.layout_paths))
            }
            None => LayoutDescription::default(),
        };
        let key_db = Arc::new(KeyDatabase::build(device.blocks(), &layout));
        info!(
            "device {name} (serial {serial}): {} keys in {} blocks",
            key_db.len(),
            device.blocks().len()
        );

        let render_loop = RenderLoop::new(device, config.fps, on_fatal);
        let mut manager = Self {
            sys_path,
            dev_node,
            serial,
            model,
            name,
            config,
            effect_manager,
            key_db,
            group_cache: HashMap::new(),
            render_loop,
            context: Context::new(),
        };
        manager.set_context(&Context::new());
        manager.render_loop.set_paused(false);
        manager
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn sys_path(&self) -> &std::path::Path {
        &self.sys_path
    }

    pub fn dev_node(&self) -> &std::path::Path {
        &self.dev_node
    }

    pub fn key_db(&self) -> &Arc<KeyDatabase> {
        &self.key_db
    }

    pub fn set_paused(&self, paused: bool) {
        self.render_loop.set_paused(paused);
    }

    /* Replace the configuration, dropping every materialised effect. The
     * next context change rebuilds from the new tree. */
    pub fn set_configuration(&mut self, config: Arc<Config>) {
        {
            let mut effects = self.render_loop.effects();
            effects.clear();
        }
        self.group_cache.clear();
        self.name = config.device_name(&self.serial);
        self.config = config;
        let context = self.context.clone();
        self.set_context(&context);
        self.render_loop.force_refresh();
    }

    /* Re-evaluate profiles against a new context and swap the active
     * effect list. Newly selected effects are notified of the context
     * while the loop's lock is held, before their first render. */
    pub fn set_context(&mut self, context: &Context) {
        self.context = context.clone();

        let group_names: Vec<String> = self
            .config
            .effect_groups_for(&self.name, context)
            .iter()
            .map(|g| g.name.clone())
            .collect();

        for name in &group_names {
            if !self.group_cache.contains_key(name) {
                if let Some(group) = self.config.effect_group(name) {
                    let effects = self.materialize_group(&group.clone());
                    self.group_cache.insert(name.clone(), effects);
                }
            }
        }

        let active: Vec<EffectHandle> = group_names
            .iter()
            .filter_map(|name| self.group_cache.get(name))
            .flatten()
            .cloned()
            .collect();
        debug!("enabling {} effects for device {}", active.len(), self.name);

        let mut effects = self.render_loop.effects();
        for effect in &active {
            match effect.lock() {
                Ok(mut effect) => effect.handle_context_change(context),
                Err(poisoned) => poisoned.into_inner().handle_context_change(context),
            }
        }
        *effects = active;
    }

    /* Forward a generic event to the active effects. */
    pub fn handle_generic_event(&self, data: &Context) {
        let effects = self.render_loop.effects();
        for effect in effects.iter() {
            match effect.lock() {
                Ok(mut effect) => effect.handle_generic_event(data),
                Err(poisoned) => poisoned.into_inner().handle_generic_event(data),
            }
        }
    }

    /* Route a physical key event to the active effects, resolving the raw
     * code through the key database first. */
    pub fn handle_key_event(&self, key_code: u32, press: bool) {
        let Some(key) = self.key_db.find_key_code(key_code) else {
            debug!("unknown key {key_code} on device {}", self.serial);
            return;
        };

        let effects = self.render_loop.effects();
        for effect in effects.iter() {
            match effect.lock() {
                Ok(mut effect) => effect.handle_key_event(key, press),
                Err(poisoned) => poisoned.into_inner().handle_key_event(key, press),
            }
        }
        debug!(
            "key {} {} on device {}",
            key.name,
            if press { "pressed" } else { "released" },
            self.serial
        );
    }

    pub fn force_refresh(&self) {
        self.render_loop.force_refresh();
    }

    /* Instantiate every plugin of an effect group. A plugin that fails to
     * produce an effect is skipped; the others still run. */
    fn materialize_group(&self, group: &EffectGroup) -> Vec<EffectHandle> {
        let mut key_groups: Vec<KeyGroup> = Vec::new();
        for (name, keys) in &group.groups {
            key_groups.push(self.key_db.make_group(name.clone(), keys.iter().map(String::as_str)));
        }
        for (name, keys) in &self.config.groups {
            key_groups.push(self.key_db.make_group(name.clone(), keys.iter().map(String::as_str)));
        }

        let mut effects = Vec::new();
        for plugin_conf in &group.plugins {
            let service = EffectService::new(
                plugin_conf.name.clone(),
                self.name.clone(),
                self.model.clone(),
                self.serial.clone(),
                Arc::clone(&self.key_db),
                key_groups.clone(),
                plugin_conf.clone(),
                self.config.colors.clone(),
                effect_data_paths(),
            );
            match self.effect_manager.create_effect(&plugin_conf.name, service) {
                Some(instance) => {
                    effects.push(Arc::new(Mutex::new(instance)) as EffectHandle);
                }
                None => {
                    warn!(
                        "effect <{}> in group <{}> could not be created, skipped",
                        plugin_conf.name, group.name
                    );
                }
            }
        }
        effects
    }
}

/* Search path for effect data files (gradients, tables, scripts). */
fn effect_data_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        paths.push(PathBuf::from(dir).join("keyledsd/effects"));
    } else if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join(".local/share/keyledsd/effects"));
    }
    let system = std::env::var("XDG_DATA_DIRS")
        .unwrap_or_else(|_| "/usr/local/share:/usr/share".to_string());
    for dir in system.split(':').filter(|d| !d.is_empty()) {
        paths.push(PathBuf::from(dir).join("keyledsd/effects"));
    }
    paths
}
