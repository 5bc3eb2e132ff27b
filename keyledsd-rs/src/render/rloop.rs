/* Per-device render loop: a dedicated worker thread composes the active
 * effects into a color buffer at a fixed rate, diffs against the last
 * committed device state and emits the minimal set of LED updates.
 *
 * Ownership contract: while a loop exists for a device, nothing else may
 * talk to it. Other threads mutate the effect list only through `effects()`,
 * whose lock the worker holds for the compose step of each tick. */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::device::error::DeviceError;
use crate::device::features::KeyColor;
use crate::device::{Keyboard, LedBlock};
use crate::effect::EffectHandle;
use crate::hid::endpoint::Transport;
use crate::render::target::{self, RenderTarget, RGBAColor};

/* Retry-and-resync schedule for recoverable device errors. */
const RECOVERY_ATTEMPTS: u32 = 5;
const RECOVERY_STEP: Duration = Duration::from_millis(100);
/* Timeouts are transient this many times in a row, terminal after. */
const TIMEOUT_TOLERANCE: u32 = 2;

/* What the loop needs from a device. `Keyboard` is the production
 * implementation; tests drive the loop with a scripted one. */
pub trait LedDevice: Send {
    fn blocks(&self) -> &[LedBlock];
    fn flush(&mut self) -> Result<(), DeviceError>;
    fn read_block(&mut self, block_idx: usize) -> Result<Vec<KeyColor>, DeviceError>;
    fn write_block(&mut self, block_idx: usize, keys: &[KeyColor]) -> Result<(), DeviceError>;
    fn commit(&mut self) -> Result<(), DeviceError>;
    fn resync(&mut self) -> Result<(), DeviceError>;
}

impl<T: Transport> LedDevice for Keyboard<T> {
    fn blocks(&self) -> &[LedBlock] {
        Keyboard::blocks(self)
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        Keyboard::flush(self)
    }

    fn read_block(&mut self, block_idx: usize) -> Result<Vec<KeyColor>, DeviceError> {
        Keyboard::read_block(self, block_idx)
    }

    fn write_block(&mut self, block_idx: usize, keys: &[KeyColor]) -> Result<(), DeviceError> {
        Keyboard::write_block(self, block_idx, keys)
    }

    fn commit(&mut self) -> Result<(), DeviceError> {
        Keyboard::commit(self)
    }

    fn resync(&mut self) -> Result<(), DeviceError> {
        Keyboard::resync(self)
    }
}

struct Status {
    paused: bool,
    abort: bool,
}

struct Shared {
    effects: Mutex<Vec<EffectHandle>>,
    status: Mutex<Status>,
    cond: Condvar,
    force_refresh: AtomicBool,
    period: Duration,
}

fn lock_ignoring_poison<'a, T: ?Sized>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/* Compose/diff/emit state, separated from the thread so the tick body is
 * directly testable. */
pub(crate) struct Engine {
    device: Box<dyn LedDevice>,
    blocks: Vec<LedBlock>,
    state: RenderTarget,
    buffer: RenderTarget,
    directives: Vec<KeyColor>,
}

impl Engine {
    pub(crate) fn new(device: Box<dyn LedDevice>) -> Self {
        let blocks = device.blocks().to_vec();
        let total = blocks.iter().map(|b| b.key_ids.len()).sum();
        let largest = blocks.iter().map(|b| b.key_ids.len()).max().unwrap_or(0);
        Self {
            device,
            blocks,
            state: RenderTarget::new(total),
            buffer: RenderTarget::new(total),
            /* sized up front so the tick body does not allocate */
            directives: Vec::with_capacity(largest),
        }
    }

    /* Read the device's committed colors into the state buffer so the
     * first tick diffs against reality. */
    pub(crate) fn seed(&mut self) -> Result<(), DeviceError> {
        for (bidx, block) in self.blocks.iter().enumerate() {
            let offset = self.blocks[..bidx].iter().map(|b| b.key_ids.len()).sum::<usize>();
            let colors = self.device.read_block(bidx)?;
            for (kidx, led) in colors.iter().enumerate().take(block.key_ids.len()) {
                self.state[offset + kidx] =
                    RGBAColor::new(led.red, led.green, led.blue, 255);
            }
        }
        Ok(())
    }

    /* Step 1 of a tick: run every effect over the shared buffer. The first
     * effect fills, later layers blend into it. Returns false when the list
     * is empty, in which case the device is not touched at all. */
    pub(crate) fn compose(&mut self, elapsed: Duration, effects: &[EffectHandle]) -> bool {
        if effects.is_empty() {
            return false;
        }
        for effect in effects {
            lock_ignoring_poison(effect).render(elapsed, &mut self.buffer);
        }
        true
    }

    /* Steps 2-5: drain stale frames, emit at most one LED update per block
     * and at most one commit, then adopt the buffer as committed state. */
    pub(crate) fn emit(&mut self, force: bool) -> Result<(), DeviceError> {
        /* some firmwares buffer notifications; own the wire before writing */
        self.device.flush()?;

        let mut changed = false;
        let mut offset = 0usize;
        for bidx in 0..self.blocks.len() {
            let key_count = self.blocks[bidx].key_ids.len();
            self.directives.clear();
            for kidx in 0..key_count {
                let idx = offset + kidx;
                let new = self.buffer[idx];
                let old = self.state[idx];
                /* alpha is composition state only; the wire carries RGB */
                if force || new.red != old.red || new.green != old.green || new.blue != old.blue
                {
                    self.directives.push(KeyColor {
                        id: self.blocks[bidx].key_ids[kidx],
                        red: new.red,
                        green: new.green,
                        blue: new.blue,
                    });
                }
            }
            if !self.directives.is_empty() {
                let directives = std::mem::take(&mut self.directives);
                let result = self.device.write_block(bidx, &directives);
                self.directives = directives;
                result?;
                changed = true;
            }
            offset += key_count;
        }

        if changed {
            self.device.commit()?;
        }
        target::swap(&mut self.state, &mut self.buffer);
        Ok(())
    }

    /* A whole tick body; the worker interleaves the steps with locking. */
    #[cfg(test)]
    pub(crate) fn tick(
        &mut self,
        elapsed: Duration,
        effects: &[EffectHandle],
        force: bool,
    ) -> Result<(), DeviceError> {
        if !self.compose(elapsed, effects) {
            return Ok(());
        }
        self.emit(force)
    }

    pub(crate) fn resync(&mut self) -> Result<(), DeviceError> {
        self.device.resync()
    }
}

pub struct RenderLoop {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl RenderLoop {
    /* Start the worker, initially paused. `on_fatal` fires exactly once if
     * the loop gives up on the device; a plain `stop()` does not fire it. */
    pub fn new(
        device: Box<dyn LedDevice>,
        fps: u32,
        on_fatal: Box<dyn FnOnce(DeviceError) + Send>,
    ) -> Self {
        let shared = Arc::new(Shared {
            effects: Mutex::new(Vec::new()),
            status: Mutex::new(Status { paused: true, abort: false }),
            cond: Condvar::new(),
            force_refresh: AtomicBool::new(false),
            period: Duration::from_nanos(1_000_000_000 / u64::from(fps.max(1))),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("render-loop".to_string())
            .spawn(move || worker_main(device, worker_shared, on_fatal))
            .ok();

        Self { shared, worker }
    }

    /* The effect-list lock. Held by the worker during the compose step;
     * callers take it to swap effects between ticks. */
    pub fn effects(&self) -> MutexGuard<'_, Vec<EffectHandle>> {
        lock_ignoring_poison(&self.shared.effects)
    }

    pub fn set_paused(&self, paused: bool) {
        let mut status = lock_ignoring_poison(&self.shared.status);
        if status.paused != paused {
            status.paused = paused;
            self.shared.cond.notify_all();
        }
    }

    /* Make the next tick treat the device state as unknown, re-emitting
     * every key. */
    pub fn force_refresh(&self) {
        self.shared.force_refresh.store(true, Ordering::Relaxed);
    }

    pub fn period(&self) -> Duration {
        self.shared.period
    }

    /* Cooperative shutdown; safe from any thread, idempotent. */
    pub fn stop(&mut self) {
        {
            let mut status = lock_ignoring_poison(&self.shared.status);
            status.abort = true;
            self.shared.cond.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/* Wait until `deadline`, returning early (false) on pause or abort. */
fn wait_until(shared: &Shared, deadline: Instant) -> bool {
    let mut status = lock_ignoring_poison(&shared.status);
    loop {
        if status.abort || status.paused {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        let (guard, _) = match shared.cond.wait_timeout(status, deadline - now) {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        status = guard;
    }
}

/* Interruptible sleep used by the recovery schedule. */
fn recovery_sleep(shared: &Shared, duration: Duration) -> bool {
    wait_until(shared, Instant::now() + duration)
}

fn worker_main(
    device: Box<dyn LedDevice>,
    shared: Arc<Shared>,
    on_fatal: Box<dyn FnOnce(DeviceError) + Send>,
) {
    let mut engine = Engine::new(device);
    if let Err(err) = engine.seed() {
        warn!("cannot read device state: {err}");
        on_fatal(err);
        return;
    }

    let mut on_fatal = Some(on_fatal);
    let mut timeout_streak = 0u32;

    'paused: loop {
        {
            let mut status = lock_ignoring_poison(&shared.status);
            while status.paused && !status.abort {
                debug!("render loop paused");
                status = match shared.cond.wait(status) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            if status.abort {
                return;
            }
        }
        debug!("render loop resumed");

        let mut prev_tick: Option<Instant> = None;
        let mut next_tick = Instant::now();

        loop {
            {
                let status = lock_ignoring_poison(&shared.status);
                if status.abort {
                    return;
                }
                if status.paused {
                    continue 'paused;
                }
            }

            let now = Instant::now();
            let elapsed = prev_tick.map(|t| now.duration_since(t)).unwrap_or_default();
            prev_tick = Some(now);

            let force = shared.force_refresh.swap(false, Ordering::Relaxed);
            /* the effect-list lock is held for the compose step only */
            let composed = {
                let effects = lock_ignoring_poison(&shared.effects);
                engine.compose(elapsed, effects.as_slice())
            };
            let result = if composed { engine.emit(force) } else { Ok(()) };

            match result {
                Ok(()) => timeout_streak = 0,
                Err(err) if err.is_protocol() => {
                    /* reported, never takes the device down */
                    warn!("device reported: {err}");
                    timeout_streak = 0;
                }
                Err(err) => {
                    let recoverable = match &err {
                        DeviceError::Timeout => {
                            timeout_streak += 1;
                            timeout_streak <= TIMEOUT_TOLERANCE
                        }
                        other => other.is_recoverable(),
                    };
                    if !recoverable {
                        warn!("device error: {err}");
                        if let Some(on_fatal) = on_fatal.take() {
                            on_fatal(err);
                        }
                        return;
                    }

                    info!("error on device: {err}, re-syncing");
                    let mut recovered = false;
                    for attempt in 1..=RECOVERY_ATTEMPTS {
                        if !recovery_sleep(&shared, RECOVERY_STEP * attempt) {
                            /* paused or aborted mid-recovery */
                            continue 'paused;
                        }
                        if engine.resync().is_ok() {
                            recovered = true;
                            break;
                        }
                    }
                    if !recovered {
                        if let Some(on_fatal) = on_fatal.take() {
                            on_fatal(err);
                        }
                        return;
                    }
                }
            }

            /* fixed-rate schedule without a catch-up spiral */
            next_tick += shared.period;
            let now = Instant::now();
            if now > next_tick {
                next_tick = now + shared.period;
            }
            wait_until(&shared, next_tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::features::BlockInfo;
    use crate::effect::{Effect, Renderer};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockState {
        writes: Vec<(usize, Vec<KeyColor>)>,
        commits: usize,
        resyncs: usize,
        fail_next_write: Option<DeviceError>,
    }

    #[derive(Clone)]
    struct MockDevice {
        blocks: Vec<LedBlock>,
        state: Arc<Mutex<MockState>>,
    }

    impl MockDevice {
        fn new(key_counts: &[usize]) -> Self {
            let blocks = key_counts
                .iter()
                .enumerate()
                .map(|(idx, &count)| LedBlock {
                    info: BlockInfo {
                        id: 1 << idx,
                        nb_keys: count as u16,
                        max_red: 255,
                        max_green: 255,
                        max_blue: 255,
                    },
                    key_ids: (0..count as u8).collect(),
                })
                .collect();
            Self { blocks, state: Arc::new(Mutex::new(MockState::default())) }
        }
    }

    impl LedDevice for MockDevice {
        fn blocks(&self) -> &[LedBlock] {
            &self.blocks
        }

        fn flush(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn read_block(&mut self, block_idx: usize) -> Result<Vec<KeyColor>, DeviceError> {
            Ok(self.blocks[block_idx]
                .key_ids
                .iter()
                .map(|&id| KeyColor { id, red: 0, green: 0, blue: 0 })
                .collect())
        }

        fn write_block(&mut self, block_idx: usize, keys: &[KeyColor]) -> Result<(), DeviceError> {
            let mut state = self.state.lock().expect("mock lock");
            if let Some(err) = state.fail_next_write.take() {
                return Err(err);
            }
            state.writes.push((block_idx, keys.to_vec()));
            Ok(())
        }

        fn commit(&mut self) -> Result<(), DeviceError> {
            self.state.lock().expect("mock lock").commits += 1;
            Ok(())
        }

        fn resync(&mut self) -> Result<(), DeviceError> {
            self.state.lock().expect("mock lock").resyncs += 1;
            Ok(())
        }
    }

    /* paints one pixel a fixed color every tick */
    struct PixelEffect {
        index: usize,
        color: RGBAColor,
        renders: Arc<AtomicUsize>,
    }

    impl Renderer for PixelEffect {
        fn render(&mut self, _elapsed: Duration, target: &mut RenderTarget) {
            target[self.index] = self.color;
            self.renders.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Effect for PixelEffect {}

    fn pixel_effect(index: usize, color: RGBAColor) -> (EffectHandle, Arc<AtomicUsize>) {
        let renders = Arc::new(AtomicUsize::new(0));
        let effect = PixelEffect { index, color, renders: Arc::clone(&renders) };
        (Arc::new(Mutex::new(effect)), renders)
    }

    fn engine(key_counts: &[usize]) -> (Engine, MockDevice) {
        let device = MockDevice::new(key_counts);
        let mut engine = Engine::new(Box::new(device.clone()));
        engine.seed().expect("seed");
        (engine, device)
    }

    #[test]
    fn empty_effect_list_touches_nothing() {
        let (mut engine, device) = engine(&[120]);
        for _ in 0..3 {
            engine.tick(Duration::from_millis(16), &[], false).expect("tick");
        }
        let state = device.state.lock().expect("lock");
        assert!(state.writes.is_empty());
        assert_eq!(state.commits, 0);
    }

    #[test]
    fn first_tick_emits_one_directive_then_goes_quiet() {
        let (mut engine, device) = engine(&[120]);
        let (effect, _) = pixel_effect(7, RGBAColor::new(0xff, 0x80, 0x00, 255));
        let effects = vec![effect];

        engine.tick(Duration::ZERO, &effects, false).expect("tick");
        {
            let state = device.state.lock().expect("lock");
            assert_eq!(state.writes.len(), 1);
            let (block, keys) = &state.writes[0];
            assert_eq!(*block, 0);
            assert_eq!(keys.as_slice(), &[KeyColor { id: 7, red: 0xff, green: 0x80, blue: 0x00 }]);
            assert_eq!(state.commits, 1);
        }

        /* second tick: nothing changed, so no writes and no commit */
        engine.tick(Duration::from_millis(16), &effects, false).expect("tick");
        let state = device.state.lock().expect("lock");
        assert_eq!(state.writes.len(), 1);
        assert_eq!(state.commits, 1);
    }

    #[test]
    fn diff_is_computed_per_block() {
        let (mut engine, device) = engine(&[4, 2]);
        let (first, _) = pixel_effect(1, RGBAColor::new(1, 2, 3, 255));
        let (second, _) = pixel_effect(5, RGBAColor::new(9, 8, 7, 255));
        let effects = vec![first, second];

        engine.tick(Duration::ZERO, &effects, false).expect("tick");
        let state = device.state.lock().expect("lock");
        assert_eq!(state.writes.len(), 2);
        /* index 5 is key 1 of the second block */
        assert_eq!(state.writes[1].0, 1);
        assert_eq!(state.writes[1].1[0].id, 1);
        assert_eq!(state.commits, 1);
    }

    #[test]
    fn force_refresh_re_emits_every_key() {
        let (mut engine, device) = engine(&[8]);
        let (effect, _) = pixel_effect(0, RGBAColor::new(5, 5, 5, 255));
        let effects = vec![effect];

        engine.tick(Duration::ZERO, &effects, false).expect("tick");
        engine.tick(Duration::ZERO, &effects, true).expect("tick");
        let state = device.state.lock().expect("lock");
        /* forced tick writes all eight keys of the block */
        assert_eq!(state.writes[1].1.len(), 8);
        assert_eq!(state.commits, 2);
    }

    #[test]
    fn layers_blend_through_shared_buffer() {
        struct FillEffect(RGBAColor, bool);
        impl Renderer for FillEffect {
            fn render(&mut self, _elapsed: Duration, target: &mut RenderTarget) {
                if self.1 {
                    /* bottom layer fills */
                    target.fill(self.0);
                } else {
                    /* upper layer blends */
                    let mut layer = RenderTarget::new(target.len());
                    layer.fill(self.0);
                    target::blend(target, &layer);
                }
            }
        }
        impl Effect for FillEffect {}

        let (mut engine, device) = engine(&[8]);
        let effects: Vec<EffectHandle> = vec![
            Arc::new(Mutex::new(FillEffect(RGBAColor::new(0, 0, 0, 255), true))),
            Arc::new(Mutex::new(FillEffect(RGBAColor::new(255, 255, 255, 127), false))),
        ];
        engine.tick(Duration::ZERO, &effects, false).expect("tick");

        let state = device.state.lock().expect("lock");
        let keys = &state.writes[0].1;
        assert_eq!(keys.len(), 8);
        for key in keys {
            assert!((126..=128).contains(&key.red));
            assert_eq!(key.red, key.green);
            assert_eq!(key.green, key.blue);
        }
    }

    #[test]
    fn loop_recovers_from_transient_errors() {
        let device = MockDevice::new(&[4]);
        let fatal = Arc::new(AtomicUsize::new(0));
        let fatal_count = Arc::clone(&fatal);
        let mut rloop = RenderLoop::new(
            Box::new(device.clone()),
            100,
            Box::new(move |_| {
                fatal_count.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let (effect, renders) = pixel_effect(0, RGBAColor::new(1, 1, 1, 255));
        rloop.effects().push(effect);
        device.state.lock().expect("lock").fail_next_write =
            Some(DeviceError::Io(nix::errno::Errno::EIO));
        rloop.set_paused(false);

        /* give the loop time to fail, back off 100ms, ping and resume */
        std::thread::sleep(Duration::from_millis(400));
        rloop.stop();

        let state = device.state.lock().expect("lock");
        assert!(state.resyncs >= 1, "no resync happened");
        assert!(state.commits >= 1, "loop did not resume after recovery");
        assert_eq!(fatal.load(Ordering::SeqCst), 0);
        assert!(renders.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn fatal_error_notifies_and_exits() {
        let device = MockDevice::new(&[4]);
        let fatal = Arc::new(Mutex::new(None));
        let fatal_slot = Arc::clone(&fatal);
        let mut rloop = RenderLoop::new(
            Box::new(device.clone()),
            100,
            Box::new(move |err| {
                *fatal_slot.lock().expect("lock") = Some(err);
            }),
        );

        let (effect, _) = pixel_effect(0, RGBAColor::new(1, 1, 1, 255));
        rloop.effects().push(effect);
        device.state.lock().expect("lock").fail_next_write =
            Some(DeviceError::Io(nix::errno::Errno::ENODEV));
        rloop.set_paused(false);

        std::thread::sleep(Duration::from_millis(200));
        let err = fatal.lock().expect("lock").take();
        assert!(matches!(err, Some(DeviceError::Io(nix::errno::Errno::ENODEV))));
        rloop.stop();
    }

    #[test]
    fn stop_joins_quickly_from_any_state() {
        for paused in [true, false] {
            let device = MockDevice::new(&[4]);
            let mut rloop =
                RenderLoop::new(Box::new(device), 20, Box::new(|_| {}));
            rloop.set_paused(paused);
            std::thread::sleep(Duration::from_millis(30));

            let start = Instant::now();
            rloop.stop();
            /* two periods plus margin: 2 * 50ms + 50ms */
            assert!(Instant::now() - start < Duration::from_millis(150));
        }
    }

    #[test]
    fn effect_swap_under_lock_takes_effect_next_tick() {
        let (mut engine, device) = engine(&[4]);
        let (red, _) = pixel_effect(0, RGBAColor::new(255, 0, 0, 255));
        let (blue, _) = pixel_effect(0, RGBAColor::new(0, 0, 255, 255));

        engine.tick(Duration::ZERO, &[red], false).expect("tick");
        engine.tick(Duration::ZERO, &[blue], false).expect("tick");

        let state = device.state.lock().expect("lock");
        assert_eq!(state.writes.len(), 2);
        assert_eq!(state.writes[1].1[0].blue, 255);
    }
}
