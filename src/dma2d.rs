//! DMA2D accelerator
//!
//! Off-screen fill, blit and blend between overlays. The accelerator runs the
//! composition pipeline in loop-back mode: the foreground (and for blends the
//! background) layer is fetched, composed over the smart-panel constant
//! color and written back through the output layer.
//!
//! Every call is synchronous. The engine lock is held for the whole call,
//! including both halves of a split transfer, and the caller blocks on the
//! completion semaphore posted by [`Dma2d::on_interrupt`].
//!
//! # Example
//!
//! ```ignore
//! use bes_display_hal::dma2d::*;
//! use bes_display_hal::overlay::*;
//!
//! let dma2d = Dma2d::new(regs, cache, Dma2dConfig::new(DMA2D_IRQ));
//! dma2d.initialize(&mut nvic)?;
//!
//! // platform vector: fn dma2d_isr() { DMA2D.on_interrupt() }
//!
//! let area = Area::new(0, 0, 120, 120);
//! dma2d.fill(&overlay, &area, 0xff00_ff00)?;
//! ```

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use alloc::vec;
use alloc::vec::Vec;

use crate::cache::{CacheAdapter, DataCache};
use crate::errors::{Error, Result};
use crate::hal::{
    decode_status, Action, Command, IrqEvent, IrqStatus, Layer, LayerSet, RegisterBlock,
};
use crate::interrupt::{self, InterruptController, IrqCell};
use crate::mutex::Mutex;
use crate::overlay::{Area, BlendMode, ColorMap, DitherMap, Overlay, CLUT_SIZE};
use crate::pm::{PmCallback, PmState};
use crate::semaphore::Semaphore;
use crate::split::{self, Step, Target, BURST_PIXELS};

/// DMA2D configuration types
pub mod config {
    use heapless::Vec;

    use crate::interrupt::IrqNumber;

    /// Cached PSRAM window.
    pub const PSRAM_BASE: usize = 0x3400_0000;
    /// Non-cached alias of the PSRAM window.
    pub const PSRAM_NC_BASE: usize = 0x1400_0000;

    /// Address bits selecting a memory region.
    pub const MEMORY_REGION_MASK: usize = !0x00ff_ffff;

    #[derive(Debug, Clone)]
    pub struct Dma2dConfig {
        pub irq: IrqNumber,
        pub irq_priority: u8,
        /// Region bases (masked with [`MEMORY_REGION_MASK`]) of slow memory
        pub slow_memory: Vec<usize, 4>,
    }

    impl Dma2dConfig {
        /// Create a new DMA2D configuration with default values
        ///
        /// # Arguments
        ///
        /// * `irq` - Interrupt line of the accelerator
        pub fn new(irq: IrqNumber) -> Self {
            let mut slow_memory = Vec::new();
            slow_memory.extend_from_slice(&[PSRAM_BASE, PSRAM_NC_BASE]).ok();

            Self {
                irq,
                irq_priority: 3,
                slow_memory,
            }
        }

        #[must_use]
        pub fn irq_priority(mut self, irq_priority: u8) -> Self {
            self.irq_priority = irq_priority;
            self
        }

        /// Replaces the slow memory regions. Extra entries beyond the capacity
        /// are ignored.
        #[must_use]
        pub fn slow_memory(mut self, regions: &[usize]) -> Self {
            self.slow_memory.clear();
            for region in regions.iter().take(self.slow_memory.capacity()) {
                self.slow_memory.push(region & MEMORY_REGION_MASK).ok();
            }
            self
        }

        /// Whether `addr` lies in low-latency memory.
        pub fn is_fast_memory(&self, addr: usize) -> bool {
            let region = addr & MEMORY_REGION_MASK;
            !self.slow_memory.iter().any(|&slow| slow == region)
        }
    }
}

pub use config::*;

const HPORCH: (u32, u32) = (12, 10);
const VPORCH: (u32, u32) = (10, 10);
const OUTPUT_BURST: u8 = 8;

/// Shadow state guarded by the engine lock.
struct Shadow {
    clut: ColorMap,
    dither: DitherMap,
}

/// What a transfer composes.
#[derive(Clone, Copy)]
enum Request<'a> {
    Fill { color: u32 },
    Blit { src: &'a Overlay },
    Blend { fg: &'a Overlay, bg: &'a Overlay },
}

impl<'a> Request<'a> {
    const fn action(&self) -> Action {
        match self {
            Request::Fill { .. } => Action::Fill,
            Request::Blit { .. } => Action::Blit,
            Request::Blend { .. } => Action::Blend,
        }
    }

    fn layers(&self) -> LayerSet {
        let base = Layer::Foreground | Layer::Output | Layer::SmartPanel;
        match self {
            Request::Blend { .. } => base | Layer::Background,
            _ => base,
        }
    }

    fn aligned(&self, dest: &Overlay) -> bool {
        match self {
            Request::Fill { .. } => dest.format.needs_burst_alignment(),
            Request::Blit { src } => src.format.needs_burst_alignment(),
            Request::Blend { fg, bg } => {
                fg.format.needs_burst_alignment() || bg.format.needs_burst_alignment()
            }
        }
    }

    fn sources(&self) -> impl Iterator<Item = &'a Overlay> {
        let (first, second) = match *self {
            Request::Fill { .. } => (None, None),
            Request::Blit { src } => (Some(src), None),
            Request::Blend { fg, bg } => (Some(fg), Some(bg)),
        };

        first.into_iter().chain(second)
    }
}

/// Marks the engine busy for power management while alive.
struct InWork<'a>(&'a AtomicBool);

impl<'a> InWork<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InWork<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// DMA2D driver
pub struct Dma2d<R, C> {
    regs: IrqCell<R>,
    cache: CacheAdapter<C>,
    config: Dma2dConfig,
    lock: Mutex<Shadow>,
    done: Semaphore,
    in_work: AtomicBool,
    pm_state: AtomicU8,
    initialized: AtomicBool,
}

impl<R, C> Dma2d<R, C>
where
    R: RegisterBlock,
    C: DataCache,
{
    pub fn new(regs: R, cache: C, config: Dma2dConfig) -> Self {
        Self {
            regs: IrqCell::new(regs),
            cache: CacheAdapter::new(cache),
            config,
            lock: Mutex::new(Shadow {
                clut: ColorMap::default(),
                dither: DitherMap::default(),
            }),
            done: Semaphore::new(0),
            in_work: AtomicBool::new(false),
            pm_state: AtomicU8::new(PmState::Normal as u8),
            initialized: AtomicBool::new(false),
        }
    }

    /// Resets the accelerator and installs its interrupt vector.
    ///
    /// Calling it again while initialized is a no-op.
    pub fn initialize<I>(&self, irqc: &mut I) -> Result<()>
    where
        I: InterruptController + ?Sized,
    {
        let _guard = self.lock.lock();

        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        log::info!("Initialize DMA2D driver");

        self.write_all(&[
            Command::LayerClock(false),
            Command::IrqDisable,
            Command::ErrorIrqEnable,
        ])?;

        self.done.reset(0);
        interrupt::install(irqc, self.config.irq, self.config.irq_priority);

        self.initialized.store(true, Ordering::SeqCst);

        Ok(())
    }

    pub fn uninitialize<I>(&self, irqc: &mut I) -> Result<()>
    where
        I: InterruptController + ?Sized,
    {
        let _guard = self.lock.lock();

        irqc.disable(self.config.irq);
        self.write(Command::IrqDisable)?;
        self.initialized.store(false, Ordering::SeqCst);

        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Whether a transfer is currently running.
    pub fn is_busy(&self) -> bool {
        self.in_work.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Dma2dConfig {
        &self.config
    }

    /// Fills `area` of `overlay` with the ARGB8888 `argb` color.
    ///
    /// # Errors
    ///
    /// * `NotSupported` - `overlay` uses the CLUT format
    /// * `InvalidArg` - `area` is not inside `overlay`
    /// * `Canceled` - the hardware reported a configuration error
    pub fn fill(&self, overlay: &Overlay, area: &Area, argb: u32) -> Result<()> {
        log::debug!("fill overlay {} {:?} argb={:08x}", overlay.index, area, argb);

        self.check_output(overlay)?;
        overlay.check(area)?;

        self.execute(overlay, *area, Request::Fill { color: argb }, &[])
    }

    /// Copies `src_area` of `src` into `dest_area` of `dest`, scaling when
    /// the two areas differ in size.
    pub fn blit(
        &self,
        dest: &Overlay,
        dest_area: &Area,
        src: &Overlay,
        src_area: &Area,
    ) -> Result<()> {
        log::debug!(
            "blit overlay {} {:?} <- overlay {} {:?}",
            dest.index,
            dest_area,
            src.index,
            src_area
        );

        self.check_output(dest)?;
        dest.check(dest_area)?;
        src.check(src_area)?;

        self.execute(dest, *dest_area, Request::Blit { src }, &[*src_area])
    }

    /// Blends `fg_area` of `fg` over `bg_area` of `bg` into `dest_area` of
    /// `dest`. The blend mode and constant alpha are taken from the
    /// background overlay's transparency.
    pub fn blend(
        &self,
        dest: &Overlay,
        dest_area: &Area,
        fg: &Overlay,
        fg_area: &Area,
        bg: &Overlay,
        bg_area: &Area,
    ) -> Result<()> {
        log::debug!(
            "blend overlay {} {:?} <- fg {} {:?} bg {} {:?}",
            dest.index,
            dest_area,
            fg.index,
            fg_area,
            bg.index,
            bg_area
        );

        self.check_output(dest)?;
        dest.check(dest_area)?;
        fg.check(fg_area)?;
        bg.check(bg_area)?;

        self.execute(
            dest,
            *dest_area,
            Request::Blend { fg, bg },
            &[*fg_area, *bg_area],
        )
    }

    /// Writes entries `cmap.first..cmap.len` of the lookup table.
    pub fn set_clut(&self, cmap: &ColorMap) -> Result<()> {
        let mut shadow = self.lock.lock();

        for n in cmap.range() {
            shadow.clut.set(n, cmap.red[n], cmap.green[n], cmap.blue[n]);
            shadow.clut.transp[n] = cmap.transp[n];
            self.write(Command::ClutEntry(n as u8, cmap.rgb(n)))?;
        }

        Ok(())
    }

    /// Reads entries `cmap.first..cmap.len` back from the shadow table.
    pub fn get_clut(&self, cmap: &mut ColorMap) -> Result<()> {
        if cmap.first as usize >= CLUT_SIZE {
            return Err(Error::InvalidArg);
        }

        let shadow = self.lock.lock();

        for n in cmap.range() {
            cmap.set(n, shadow.clut.red[n], shadow.clut.green[n], shadow.clut.blue[n]);
            cmap.transp[n] = shadow.clut.transp[n];
        }

        Ok(())
    }

    pub fn set_dither_table(&self, map: &DitherMap) -> Result<()> {
        let mut shadow = self.lock.lock();

        for n in map.range() {
            shadow.dither.data[n] = map.data[n];
            self.write(Command::DitherEntry(n as u8, map.data[n]))?;
        }

        Ok(())
    }

    pub fn dither_table(&self) -> DitherMap {
        self.lock.lock().dither
    }

    /// Interrupt handler. Called by the platform vector; never blocks.
    pub fn on_interrupt(&self) {
        let outcome = self.regs.lock(|regs| {
            let raw = regs.irq_status();
            let (status, _) = decode_status(raw);

            if status.contains(IrqEvent::FrameDone) {
                regs.irq_clear(IrqStatus::only(IrqEvent::FrameDone).as_repr());
                Some(Ok(()))
            } else if status.contains(IrqEvent::ConfigError) {
                regs.irq_clear(IrqStatus::only(IrqEvent::ConfigError).as_repr());
                Some(Err(Error::Canceled))
            } else {
                log::warn!("DMA2D: unknown interrupt status {raw:#010x}");
                None
            }
        });

        if let Some(result) = outcome {
            self.done.post(result);
        }
    }

    fn check_output(&self, dest: &Overlay) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::InvalidState);
        }

        if dest.format.is_clut() {
            log::error!("DMA2D: output to a CLUT overlay is not supported");
            return Err(Error::NotSupported);
        }

        Ok(())
    }

    fn execute(&self, dest: &Overlay, area: Area, request: Request<'_>, sources: &[Area]) -> Result<()> {
        let plan = split::plan(area, sources, request.aligned(dest));

        let _guard = self.lock.lock();
        let _work = InWork::enter(&self.in_work);

        for step in &plan {
            match step.target {
                Target::Direct => self.transfer(dest, &step.dest, &step.dest, request, &step.sources)?,
                Target::Scratch => self.transfer_scratch(dest, step, request)?,
            }
        }

        Ok(())
    }

    /// Renders a tail narrower than the burst width into a scratch buffer
    /// four pixels wide, then copies its rows into `dest`.
    fn transfer_scratch(&self, dest: &Overlay, step: &Step, request: Request<'_>) -> Result<()> {
        let rows = step.dest.h as usize;
        let mut scratch = vec![0u32; rows * BURST_PIXELS as usize];

        // SAFETY: `scratch` outlives the transfer and is not touched until
        // the hardware has completed.
        let scratch_overlay = unsafe {
            let mut o = dest.with_memory(
                scratch.as_mut_ptr() as usize,
                scratch.len() * core::mem::size_of::<u32>(),
                BURST_PIXELS,
            );
            o.yres = step.dest.h;
            o
        };

        let out = Area::new(0, 0, BURST_PIXELS, step.dest.h);
        let zoom = Area::new(0, 0, step.dest.w, step.dest.h);

        self.transfer(&scratch_overlay, &out, &zoom, request, &step.sources)?;

        let row_bytes = dest.format.bytes(step.dest.w) as usize;
        for row in 0..step.dest.h {
            let from = scratch_overlay.mem_address(0, row);
            let to = dest.mem_address(step.dest.x, step.dest.y + row);

            // SAFETY: `from` addresses the scratch row, `to` a row inside the
            // validated destination area; both span `row_bytes`.
            unsafe {
                core::ptr::copy_nonoverlapping(from as *const u8, to as *mut u8, row_bytes);
            }
        }

        Ok(())
    }

    /// One hardware transfer writing `out` of `dest`. `zoom` is the logical
    /// size the sources are scaled to.
    fn transfer(
        &self,
        dest: &Overlay,
        out: &Area,
        zoom: &Area,
        request: Request<'_>,
        sources: &[Area],
    ) -> Result<()> {
        let program = self.program(dest, out, zoom, request, sources);

        log::trace!("DMA2D: {} commands for {:?}", program.len(), request.action());

        for overlay in request.sources() {
            self.cache.flush_overlay(overlay);
        }
        self.cache.flush_overlay(dest);

        self.write_all(&program)?;

        let result = self.start();

        self.cache.invalidate_overlay(dest);

        result.map_err(|e| match e {
            Error::Io(_) => e,
            _ => {
                log::error!("DMA2D: transfer canceled");
                Error::Canceled
            }
        })
    }

    fn start(&self) -> Result<()> {
        self.write_all(&[
            Command::LayerClock(true),
            Command::AxiFastMode(true),
            Command::Start,
        ])?;

        let result = self.done.wait();

        // A finished transfer means the system ran at normal power.
        self.pm_state.store(PmState::Normal as u8, Ordering::SeqCst);

        self.write(Command::LayerClock(false))?;

        result
    }

    fn program(
        &self,
        dest: &Overlay,
        out: &Area,
        zoom: &Area,
        request: Request<'_>,
        sources: &[Area],
    ) -> Vec<Command> {
        let action = request.action();
        let layers = request.layers();
        let mut p = Vec::with_capacity(48);

        p.push(Command::Reset);
        if action != Action::Fill {
            p.push(Command::PixelFormatReset);
        }
        p.push(Command::IrqDisable);
        p.push(Command::ErrorIrqEnable);

        for layer in [Layer::Background, Layer::Foreground, Layer::Output, Layer::SmartPanel] {
            p.push(Command::LayerEnable(layer, layers.contains(layer)));
        }

        let out_addr = dest.mem_address(out.x, out.y);

        // (fetch overlay, fetch area, timing area) per source layer
        let (fg, fg_area, timing_area, color) = match request {
            Request::Fill { color } => (dest, Area::new(out.x, out.y, 4, 4), *out, color),
            Request::Blit { src } => (src, sources[0], sources[0], 0),
            Request::Blend { fg, .. } => (fg, sources[0], sources[1], 0),
        };

        let (fg_mode, fg_alpha) = match request {
            Request::Fill { .. } => (BlendMode::Constant, 0),
            Request::Blit { .. } => (BlendMode::PerPixel, 0),
            Request::Blend { bg, .. } => match bg.transp.mode {
                BlendMode::Constant => (BlendMode::Constant, bg.transp.alpha),
                BlendMode::PerPixel => (BlendMode::PerPixel, 0),
            },
        };

        p.push(Command::PixelFormat {
            layer: Layer::Foreground,
            mode: fg_mode,
            alpha: fg_alpha,
            format: fg.format,
        });
        if let Request::Blend { bg, .. } = request {
            p.push(Command::PixelFormat {
                layer: Layer::Background,
                mode: BlendMode::Constant,
                alpha: 0,
                format: bg.format,
            });
        }
        p.push(Command::PixelFormat {
            layer: Layer::Output,
            mode: BlendMode::Constant,
            alpha: 0,
            format: dest.format,
        });

        p.push(Command::Color(Layer::SmartPanel, color));
        p.push(Command::SwapPath(0));
        p.push(Command::SwapPathEnable(true));
        p.push(Command::BlendSource(Layer::Foreground));
        p.push(Command::Size(Layer::SmartPanel, out.w, out.h));

        p.push(Command::StartAddress(
            Layer::Foreground,
            fg.mem_address(fg_area.x, fg_area.y),
        ));
        if let Request::Blend { bg, .. } = request {
            p.push(Command::StartAddress(
                Layer::Background,
                bg.mem_address(sources[1].x, sources[1].y),
            ));
        }
        p.push(Command::StartAddress(Layer::Output, out_addr));

        p.push(Command::Pitch(Layer::Foreground, fg.pitch()));
        if let Request::Blend { bg, .. } = request {
            p.push(Command::Pitch(Layer::Background, bg.pitch()));
        }
        p.push(Command::Pitch(Layer::Output, dest.pitch()));

        if action != Action::Fill {
            p.push(Command::Zoom(Layer::Foreground, zoom.w, zoom.h));
            p.push(Command::Zoom(Layer::Background, zoom.w, zoom.h));
            p.push(Command::OnScreen(Layer::Foreground, 1, 1));
            p.push(Command::OnScreen(Layer::Background, 1, 1));
        }

        let bg_size = match request {
            Request::Blend { .. } => sources[1],
            _ => fg_area,
        };
        p.push(Command::Size(Layer::Foreground, fg_area.w, fg_area.h));
        p.push(Command::Size(Layer::Background, bg_size.w, bg_size.h));
        p.push(Command::Size(Layer::Output, out.w, out.h));

        p.push(Command::FrameDoneIrqEnable(true));
        p.push(Command::SyncTriggerDisable);

        p.push(Command::SmpnMode(dest.format.smpn_mode()));
        p.push(Command::WdmaOneFramePerTrigger);
        p.push(Command::OutputBurstLength(OUTPUT_BURST));
        p.push(Command::SmartPanelBurstMax);
        p.push(Command::DmaTransferTrigger(Layer::Foreground, true));
        p.push(Command::MemEnable(true));

        let total = action.memory_layers();
        let fast = request
            .sources()
            .chain(core::iter::once(dest))
            .filter(|o| self.config.is_fast_memory(o.fbmem))
            .count() as u8;
        let porch_width = match request {
            Request::Fill { .. } => out.w,
            _ => fg_area.w,
        };
        p.push(Command::VsyncPorch {
            action,
            width: porch_width,
            fast,
            slow: total - fast,
        });

        p.push(Command::VhTotal(timing_area.w + 2, timing_area.h + 2));
        p.push(Command::HPorch(HPORCH.0, HPORCH.1));
        p.push(Command::VPorch(VPORCH.0, VPORCH.1));

        p
    }

    fn write(&self, command: Command) -> Result<()> {
        self.regs.lock(|regs| regs.write(command).into_result())
    }

    fn write_all(&self, commands: &[Command]) -> Result<()> {
        self.regs.lock(|regs| {
            commands
                .iter()
                .try_for_each(|command| regs.write(*command).into_result())
        })
    }

    /// Current power state as last notified.
    pub fn pm_state(&self) -> PmState {
        PmState::from_u8(self.pm_state.load(Ordering::SeqCst))
    }
}

impl<R, C> PmCallback for Dma2d<R, C>
where
    R: RegisterBlock,
    C: DataCache,
{
    /// Refuses to go to a lower power state while a transfer is in work.
    /// Going back up is always accepted.
    fn prepare(&self, _domain: u8, state: PmState) -> Result<()> {
        if state > self.pm_state() && self.is_busy() {
            log::warn!("DMA2D: refusing {state:?} while a transfer is in work");
            return Err(Error::Busy);
        }

        Ok(())
    }

    fn notify(&self, _domain: u8, state: PmState) {
        self.pm_state.store(state as u8, Ordering::SeqCst);
    }
}
