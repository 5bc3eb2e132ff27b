/* Orchestrator: ties discovery, configuration and per-device managers
 * together on the event loop. Opens every discovered keyboard, routes
 * context and key events to the managers, pauses devices whose node
 * becomes inaccessible, reloads configuration on SIGHUP and quits when
 * asked to (or when the last device goes away under --auto-quit). */

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use notify::Watcher as _;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::Context;
use crate::device::error::DeviceError;
use crate::device::Keyboard;
use crate::effect::EffectManager;
use crate::manager::DeviceManager;
use crate::watcher::{self, DeviceEvent};
use crate::APP_ID_DAEMON;

/* Events fed into the daemon by external context sources (desktop watcher,
 * input-device watcher, control surface). */
#[derive(Debug)]
pub enum ControlEvent {
    /* merge into the current context and re-dispatch profiles */
    SetContext(Context),
    /* one-shot notification forwarded to active effects */
    GenericEvent(Context),
    /* physical key event, routed to every device's effects */
    KeyEvent { key_code: u32, press: bool },
    /* re-read the configuration file */
    Reload,
    Quit,
}

/* A source of control events bridged onto the event loop. */
#[async_trait]
pub trait ContextSource: Send {
    async fn run(self: Box<Self>, events: mpsc::UnboundedSender<ControlEvent>) -> Result<()>;
}

pub struct ServiceOptions {
    pub config_path: PathBuf,
    pub auto_quit: bool,
}

pub struct Service {
    options: ServiceOptions,
    config: Arc<Config>,
    effect_manager: Arc<EffectManager>,
    managers: HashMap<PathBuf, DeviceManager>,
    context: Context,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
    control_rx: Option<mpsc::UnboundedReceiver<ControlEvent>>,
}

impl Service {
    pub fn new(options: ServiceOptions, config: Config) -> Self {
        let search_paths = config.plugin_paths.iter().map(PathBuf::from).collect();
        let effect_manager = Arc::new(EffectManager::new(search_paths));

        /* preload the plugins named in the configuration */
        for name in &config.plugins {
            if let Err(err) = effect_manager.load(name) {
                warn!("cannot preload plugin <{name}>: {err}");
            }
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            options,
            config: Arc::new(config),
            effect_manager,
            managers: HashMap::new(),
            context: Context::new(),
            control_tx,
            control_rx: Some(control_rx),
        }
    }

    /* Sender handed to external context sources. */
    pub fn control_sender(&self) -> mpsc::UnboundedSender<ControlEvent> {
        self.control_tx.clone()
    }

    /* Bridge an external watcher (desktop context, input devices, ...) onto
     * the event loop. The source runs until it fails or the daemon exits. */
    pub fn spawn_source(&self, source: Box<dyn ContextSource>) {
        let events = self.control_sender();
        tokio::spawn(async move {
            if let Err(err) = source.run(events).await {
                warn!("context source stopped: {err:#}");
            }
        });
    }

    pub fn device_count(&self) -> usize {
        self.managers.len()
    }

    /* Main event loop. Returns on SIGTERM/SIGINT/SIGQUIT, on Quit, or when
     * the last device disappears under auto-quit. */
    pub async fn run(&mut self) -> Result<()> {
        let mut control_rx = self
            .control_rx
            .take()
            .context("service event loop already running")?;
        let (device_tx, mut device_rx) = mpsc::unbounded_channel();
        let monitor = watcher::spawn_monitor(device_tx.clone())?;

        /* render loops report fatal device errors here */
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<(PathBuf, DeviceError)>();

        /* inotify-style watch on device nodes: pause on attribute change
         * until the node is accessible again (session switches) */
        let (node_tx, mut node_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut node_watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if let Ok(event) = event {
                for path in event.paths {
                    let _ = node_tx.send(path);
                }
            }
        })
        .context("device node watcher")?;

        let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("SIGINT handler")?;
        let mut sigquit = signal(SignalKind::quit()).context("SIGQUIT handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("SIGHUP handler")?;

        /* pick up the devices that were present before the monitor ran */
        for description in watcher::enumerate().unwrap_or_default() {
            let _ = device_tx.send(DeviceEvent::Added(description));
        }

        loop {
            tokio::select! {
                _ = sigterm.recv() => { info!("received SIGTERM, shutting down"); break }
                _ = sigint.recv() => { info!("received SIGINT, shutting down"); break }
                _ = sigquit.recv() => { info!("received SIGQUIT, shutting down"); break }
                _ = sighup.recv() => self.reload_configuration(),

                Some(event) = device_rx.recv() => match event {
                    DeviceEvent::Added(description) => {
                        self.add_device(description, &exit_tx, &mut node_watcher).await;
                    }
                    DeviceEvent::Removed(sys_path) => {
                        if self.remove_device(&sys_path, &mut node_watcher) && self.quit_if_idle() {
                            break;
                        }
                    }
                },

                Some((sys_path, err)) = exit_rx.recv() => {
                    warn!("device {} failed: {err}", sys_path.display());
                    if self.remove_device(&sys_path, &mut node_watcher) && self.quit_if_idle() {
                        break;
                    }
                }

                Some(path) = node_rx.recv() => self.check_node_access(&path),

                Some(event) = control_rx.recv() => match event {
                    ControlEvent::SetContext(update) => {
                        self.context.merge(&update);
                        let context = self.context.clone();
                        for manager in self.managers.values_mut() {
                            manager.set_context(&context);
                        }
                    }
                    ControlEvent::GenericEvent(data) => {
                        for manager in self.managers.values() {
                            manager.handle_generic_event(&data);
                        }
                    }
                    ControlEvent::KeyEvent { key_code, press } => {
                        for manager in self.managers.values() {
                            manager.handle_key_event(key_code, press);
                        }
                    }
                    ControlEvent::Reload => self.reload_configuration(),
                    ControlEvent::Quit => break,
                },
            }
        }

        monitor.stop();
        self.managers.clear();
        Ok(())
    }

    async fn add_device(
        &mut self,
        description: watcher::DeviceDescription,
        exit_tx: &mpsc::UnboundedSender<(PathBuf, DeviceError)>,
        node_watcher: &mut notify::RecommendedWatcher,
    ) {
        if self.managers.contains_key(&description.sys_path) {
            return;
        }

        /* opening involves blocking I/O and a protocol handshake */
        let dev_node = description.dev_node.clone();
        let opened = tokio::task::spawn_blocking(move || Keyboard::open(&dev_node, APP_ID_DAEMON))
            .await;
        let keyboard = match opened {
            Ok(Ok(keyboard)) => keyboard,
            Ok(Err(DeviceError::UnsupportedProtocol { version })) => {
                debug!(
                    "ignoring {}: HID++ version {version}",
                    description.dev_node.display()
                );
                return;
            }
            Ok(Err(err)) => {
                debug!("cannot use {}: {err}", description.dev_node.display());
                return;
            }
            Err(err) => {
                warn!("open task failed: {err}");
                return;
            }
        };

        let serial = if keyboard.serial.is_empty() {
            description.serial.clone()
        } else {
            keyboard.serial.clone()
        };

        let sys_path = description.sys_path.clone();
        let exit_tx = exit_tx.clone();
        let exit_path = sys_path.clone();
        let layout = keyboard.layout;
        let model = keyboard.model.clone();

        let mut manager = DeviceManager::new(
            sys_path.clone(),
            description.dev_node.clone(),
            serial,
            model,
            Box::new(keyboard),
            layout,
            Arc::clone(&self.config),
            Arc::clone(&self.effect_manager),
            Box::new(move |err| {
                let _ = exit_tx.send((exit_path, err));
            }),
        );

        if let Err(err) =
            node_watcher.watch(&description.dev_node, notify::RecursiveMode::NonRecursive)
        {
            debug!("cannot watch {}: {err}", description.dev_node.display());
        }

        let context = self.context.clone();
        manager.set_context(&context);

        info!("added device {} ({})", manager.name(), description.dev_node.display());
        self.managers.insert(sys_path, manager);
    }

    fn remove_device(
        &mut self,
        sys_path: &Path,
        node_watcher: &mut notify::RecommendedWatcher,
    ) -> bool {
        let Some(manager) = self.managers.remove(sys_path) else {
            return false;
        };
        let _ = node_watcher.unwatch(manager.dev_node());
        info!("removed device {}", manager.name());
        /* dropping the manager stops its render loop */
        drop(manager);
        true
    }

    fn quit_if_idle(&self) -> bool {
        if self.options.auto_quit && self.managers.is_empty() {
            info!("last device removed, exiting");
            return true;
        }
        false
    }

    /* Pause managers whose node went away (e.g. session switch revoked
     * access); resume them when it is back. */
    fn check_node_access(&self, path: &Path) {
        use nix::unistd::{access, AccessFlags};
        for manager in self.managers.values() {
            if manager.dev_node() == path {
                let accessible =
                    access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok();
                debug!(
                    "device node {} is {}",
                    path.display(),
                    if accessible { "accessible" } else { "inaccessible" }
                );
                manager.set_paused(!accessible);
                if accessible {
                    manager.force_refresh();
                }
            }
        }
    }

    /* SIGHUP: re-read the configuration; parse failures keep the previous
     * configuration active. */
    fn reload_configuration(&mut self) {
        info!("reloading configuration from {}", self.options.config_path.display());
        let config = match Config::load(&self.options.config_path) {
            Ok(config) => Arc::new(config),
            Err(err) => {
                warn!("configuration reload failed, keeping previous: {err}");
                return;
            }
        };
        self.config = Arc::clone(&config);
        for manager in self.managers.values_mut() {
            manager.set_configuration(Arc::clone(&config));
        }
    }
}
