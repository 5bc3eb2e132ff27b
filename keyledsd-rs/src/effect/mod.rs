/* Effect plugin host: loads plugin libraries over the stable C ABI,
 * instantiates effects against per-effect services and tracks plugin use
 * counts so libraries are never torn down under a live effect. */

pub mod abi;
pub mod service;

use std::collections::HashSet;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::keydb::Key;
use crate::render::RenderTarget;

use abi::{
    EffectTable, HostDefinition, KeyValue, ModuleDefinition, PluginTable, ABI_VERSION,
    ENGINE_MAJOR, ENGINE_MINOR, MODULE_ENTRY, MODULE_SIGNATURE,
};
use service::{EffectService, ServiceBox};

/* Draws one layer of the keyboard image each tick. */
pub trait Renderer: Send {
    fn render(&mut self, elapsed: Duration, target: &mut RenderTarget);
}

/* Full effect capability set. Event hooks default to no-ops. */
pub trait Effect: Renderer {
    fn handle_context_change(&mut self, _context: &Context) {}
    fn handle_generic_event(&mut self, _context: &Context) {}
    fn handle_key_event(&mut self, _key: &Key, _press: bool) {}
}

/* Shared handle: the device manager's cache and the render loop's active
 * list both reference the same instance. */
pub type EffectHandle = Arc<Mutex<dyn Effect + Send>>;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no module <{0}> in search paths")]
    NotFound(String),
    #[error("failed to load {path}: {message}")]
    LoadFailed { path: String, message: String },
    #[error("module entry point not found")]
    NoEntryPoint,
    #[error("invalid plugin signature")]
    BadSignature,
    #[error("plugin ABI version {found} does not match host version {expected}")]
    AbiMismatch { found: u32, expected: u32 },
    #[error("plugin engine version {found} does not match host version {expected}")]
    VersionMismatch { found: u16, expected: u16 },
    #[error("plugin initialisation failed: {0}")]
    InitFailed(String),
}

/* Failure message channel for initialize: the host passes an error callback,
 * the module may call it before returning null. */
static LAST_ERROR: Mutex<Option<String>> = Mutex::new(None);

unsafe extern "C" fn host_error(message: *const c_char) {
    if message.is_null() {
        return;
    }
    let message = CStr::from_ptr(message).to_string_lossy().into_owned();
    if let Ok(mut guard) = LAST_ERROR.lock() {
        *guard = Some(message);
    }
}

static HOST: HostDefinition = HostDefinition {
    major: ENGINE_MAJOR,
    minor: ENGINE_MINOR,
    error: host_error,
};

fn take_last_error() -> String {
    LAST_ERROR
        .lock()
        .ok()
        .and_then(|mut guard| guard.take())
        .unwrap_or_else(|| "unknown error".to_string())
}

/* Validation shared by dynamic and static registration. The signature is
 * checked before anything else; a mismatched library is rejected without
 * its initialize ever running. */
fn validate_module(definition: &ModuleDefinition) -> Result<(), PluginError> {
    if definition.signature != MODULE_SIGNATURE {
        return Err(PluginError::BadSignature);
    }
    if definition.abi_version != ABI_VERSION {
        return Err(PluginError::AbiMismatch {
            found: definition.abi_version,
            expected: ABI_VERSION,
        });
    }
    if definition.major != ENGINE_MAJOR {
        return Err(PluginError::VersionMismatch {
            found: definition.major,
            expected: ENGINE_MAJOR,
        });
    }
    Ok(())
}

struct PluginTracker {
    name: String,
    /* keeps the definition and plugin table alive for dynamic modules */
    library: Option<libloading::Library>,
    definition: *const ModuleDefinition,
    plugin: *mut PluginTable,
    use_count: Arc<AtomicUsize>,
}

/* SAFETY: plugin tables are only invoked under the manager lock or from the
 * single render thread owning the effect. */
unsafe impl Send for PluginTracker {}

#[derive(Default)]
struct ManagerInner {
    plugins: Vec<PluginTracker>,
    attempted: HashSet<String>,
}

pub struct EffectManager {
    search_paths: Vec<PathBuf>,
    inner: Mutex<ManagerInner>,
}

impl EffectManager {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            inner: Mutex::new(ManagerInner::default()),
        }
    }

    pub fn plugin_names(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(inner) => inner.plugins.iter().map(|p| p.name.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /* Register a module compiled into the host (used by tests and builtin
     * bundles). Same checks as a dynamic load. */
    pub fn add(&self, name: &str, definition: &'static ModuleDefinition) -> Result<(), PluginError> {
        validate_module(definition)?;
        let plugin = unsafe { (definition.initialize)(&HOST) };
        if plugin.is_null() {
            return Err(PluginError::InitFailed(take_last_error()));
        }
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.plugins.push(PluginTracker {
            name: name.to_string(),
            library: None,
            definition,
            plugin,
            use_count: Arc::new(AtomicUsize::new(0)),
        });
        info!("initialized static plugin <{name}>");
        Ok(())
    }

    /* Resolve `fx_<name>.so` in the search paths and initialise it. A name
     * that is already loaded is a no-op. */
    pub fn load(&self, name: &str) -> Result<(), PluginError> {
        {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.attempted.insert(name.to_string());
            if inner.plugins.iter().any(|p| p.name == name) {
                return Ok(());
            }
        }
        let file_name = format!("fx_{name}.so");
        let path = self
            .search_paths
            .iter()
            .map(|dir| dir.join(&file_name))
            .find(|p| p.exists())
            .ok_or_else(|| PluginError::NotFound(file_name.clone()))?;
        debug!("loading {name} from {}", path.display());

        /* SAFETY: loading foreign code; the signature and version checks
         * below gate every call into it. */
        let library = unsafe { libloading::Library::new(&path) }.map_err(|err| {
            PluginError::LoadFailed {
                path: path.display().to_string(),
                message: err.to_string(),
            }
        })?;

        let definition: *const ModuleDefinition = unsafe {
            match library.get::<*const ModuleDefinition>(MODULE_ENTRY) {
                Ok(symbol) => *symbol,
                Err(_) => return Err(PluginError::NoEntryPoint),
            }
        };
        if definition.is_null() {
            return Err(PluginError::NoEntryPoint);
        }
        /* SAFETY: the symbol outlives `library`, held by the tracker. */
        validate_module(unsafe { &*definition })?;

        let plugin = unsafe { ((*definition).initialize)(&HOST) };
        if plugin.is_null() {
            return Err(PluginError::InitFailed(take_last_error()));
        }

        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.plugins.push(PluginTracker {
            name: name.to_string(),
            library: Some(library),
            definition,
            plugin,
            use_count: Arc::new(AtomicUsize::new(0)),
        });
        info!("loaded plugin <{name}>");
        Ok(())
    }

    /* Instantiate an effect. Plugins are tried in load order; the first to
     * return a table wins. When none does and no plugin with that library
     * name was attempted yet, it is auto-loaded and the lookup retried. */
    pub fn create_effect(&self, name: &str, service: EffectService) -> Option<EffectInstance> {
        let service = ServiceBox::new(service);
        let Ok(effect_name) = CString::new(name) else {
            return None;
        };

        match self.try_create(&effect_name, name, service) {
            Ok(instance) => Some(instance),
            Err(service) => {
                let newly_attempted = match self.inner.lock() {
                    Ok(mut inner) => inner.attempted.insert(name.to_string()),
                    Err(_) => false,
                };
                if !newly_attempted {
                    return None;
                }
                if let Err(err) = self.load(name) {
                    warn!("cannot load plugin <{name}>: {err}");
                    return None;
                }
                self.try_create(&effect_name, name, service).ok()
            }
        }
    }

    fn try_create(
        &self,
        effect_name: &CStr,
        name: &str,
        mut service: Box<ServiceBox>,
    ) -> Result<EffectInstance, Box<ServiceBox>> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        for tracker in &mut inner.plugins {
            /* SAFETY: tracker.plugin came from a validated module. */
            let effect = unsafe {
                ((*tracker.plugin).create_effect)(
                    tracker.plugin,
                    effect_name.as_ptr(),
                    &mut service.table,
                )
            };
            if effect.is_null() {
                continue;
            }
            tracker.use_count.fetch_add(1, Ordering::SeqCst);
            debug!("created effect <{name}> from plugin <{}>", tracker.name);
            return Ok(EffectInstance {
                name: name.to_string(),
                effect,
                plugin: tracker.plugin,
                destroy: unsafe { (*tracker.plugin).destroy_effect },
                service,
                use_count: Arc::clone(&tracker.use_count),
            });
        }
        Err(service)
    }
}

impl Drop for EffectManager {
    fn drop(&mut self) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        for tracker in inner.plugins.drain(..) {
            let uses = tracker.use_count.load(Ordering::SeqCst);
            if uses != 0 {
                /* protocol violation; unload proceeds regardless */
                error!(
                    "critical: plugin <{}> still has {uses} live effects at unload",
                    tracker.name
                );
            }
            /* SAFETY: definition outlives the tracker; shutdown is the
             * documented teardown entry point. */
            let ok = unsafe { ((*tracker.definition).shutdown)(&HOST, tracker.plugin) };
            if !ok {
                warn!("plugin <{}> reported shutdown failure: {}", tracker.name, take_last_error());
            }
        }
    }
}

/* A live effect bound to its service, driving the plugin function table.
 * Dropping it destroys the plugin-side object and releases the use count. */
pub struct EffectInstance {
    name: String,
    effect: *mut EffectTable,
    plugin: *mut PluginTable,
    destroy: unsafe extern "C" fn(*mut PluginTable, *mut EffectTable, *mut abi::ServiceTable),
    service: Box<ServiceBox>,
    use_count: Arc<AtomicUsize>,
}

/* SAFETY: the instance is driven from one thread at a time (render loop or
 * event loop under the device manager's lock). */
unsafe impl Send for EffectInstance {}

impl EffectInstance {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &EffectService {
        &self.service.service
    }

    fn with_context_pairs(&mut self, context: &Context, f: impl FnOnce(&mut Self, &[KeyValue])) {
        let owned: Vec<(CString, CString)> = context
            .iter()
            .filter_map(|(k, v)| Some((CString::new(k).ok()?, CString::new(v).ok()?)))
            .collect();
        let pairs: Vec<KeyValue> = owned
            .iter()
            .map(|(k, v)| KeyValue { key: k.as_ptr(), value: v.as_ptr() })
            .collect();
        f(self, &pairs);
    }
}

impl Renderer for EffectInstance {
    fn render(&mut self, elapsed: Duration, target: &mut RenderTarget) {
        let len = target.len();
        /* SAFETY: table pointers are valid while the plugin is loaded; the
         * buffer outlives the call. */
        unsafe {
            ((*self.effect).render)(self.effect, elapsed.as_millis() as u64, target.as_mut_ptr(), len)
        }
    }
}

impl Effect for EffectInstance {
    fn handle_context_change(&mut self, context: &Context) {
        self.with_context_pairs(context, |this, pairs| unsafe {
            ((*this.effect).handle_context_change)(this.effect, pairs.as_ptr(), pairs.len())
        });
    }

    fn handle_generic_event(&mut self, context: &Context) {
        self.with_context_pairs(context, |this, pairs| unsafe {
            ((*this.effect).handle_generic_event)(this.effect, pairs.as_ptr(), pairs.len())
        });
    }

    fn handle_key_event(&mut self, key: &Key, press: bool) {
        /* SAFETY: as in render. */
        unsafe {
            ((*self.effect).handle_key_event)(self.effect, key.index as u32, key.key_code, press)
        }
    }
}

impl Drop for EffectInstance {
    fn drop(&mut self) {
        /* SAFETY: single release path; the deleter owns the decrement. */
        unsafe { (self.destroy)(self.plugin, self.effect, &mut self.service.table) };
        self.use_count.fetch_sub(1, Ordering::SeqCst);
    }
}
