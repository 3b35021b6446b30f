//! LCDC panel compositor
//!
//! Drives the panel-facing pipeline: up to two DMA-fed layers and the
//! constant-color smart-panel layer are composed into one frame, optionally
//! captured to memory by the write-back layer. Overlays past the hardware
//! layers are off-screen surfaces only reachable through the DMA2D engine,
//! which the compositor owns and forwards to.
//!
//! # Example
//!
//! ```ignore
//! use bes_display_hal::dma2d::{Dma2d, Dma2dConfig};
//! use bes_display_hal::lcdc::*;
//!
//! let timing = VideoTiming::new(454, 454)
//!     .hsync_back_porch(12)
//!     .hsync_front_porch(10)
//!     .vsync_back_porch(10)
//!     .vsync_front_porch(10);
//!
//! let config = LcdcConfig::new(LCDC_IRQ, timing)
//!     .layer1(LayerConfig::new(PixelFormat::Argb8888))
//!     .double_buffer(true)
//!     .low_power(true);
//!
//! let dma2d = Dma2d::new(dma2d_regs, cache, Dma2dConfig::new(DMA2D_IRQ));
//! let lcdc = Lcdc::new(lcdc_regs, dma2d, cache, config);
//!
//! unsafe { lcdc.initialize(FB_BASE, FB_SIZE, &mut nvic)? };
//!
//! // platform vectors:
//! //   fn lcdc_isr()  { LCDC.on_interrupt() }
//! //   fn dma2d_isr() { LCDC.dma2d().on_interrupt() }
//!
//! lcdc.pan_display(0, 454)?;
//! lcdc.wait_for_vsync()?;
//! ```

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;

use crate::cache::{CacheAdapter, DataCache};
use crate::dma2d::Dma2d;
use crate::errors::{Error, Result};
use crate::hal::{decode_status, ByteOrder, Command, IrqEvent, IrqStatus, Layer, RegisterBlock};
use crate::interrupt::{self, InterruptController, IrqCell};
use crate::mutex::{Mutex, MutexGuard};
use crate::overlay::{
    Area, BlendMode, ColorMap, CurveMap, DitherMap, Overlay, PlaneInfo, Transparency, VideoInfo,
    CLUT_SIZE, DITHER_SIZE,
};
use crate::pm::{PmBridge, PmCallback, PmClient, PmState};
use crate::semaphore::Semaphore;

pub use crate::format::PixelFormat;

/// LCDC configuration types
pub mod config {
    use crate::format::PixelFormat;
    use crate::interrupt::IrqNumber;
    use crate::overlay::{BlendMode, Transparency};

    /// Video timing configuration
    #[derive(Debug, Clone, Copy)]
    pub struct VideoTiming {
        pub xres: u32,
        pub yres: u32,
        pub hsync_back_porch: u32,
        pub hsync_front_porch: u32,
        pub vsync_back_porch: u32,
        pub vsync_front_porch: u32,
    }

    impl VideoTiming {
        /// Create a new video timing configuration
        pub const fn new(xres: u32, yres: u32) -> Self {
            Self {
                xres,
                yres,
                hsync_back_porch: 0,
                hsync_front_porch: 0,
                vsync_back_porch: 0,
                vsync_front_porch: 0,
            }
        }

        #[must_use]
        pub fn hsync_back_porch(mut self, hsync_back_porch: u32) -> Self {
            self.hsync_back_porch = hsync_back_porch;
            self
        }

        #[must_use]
        pub fn hsync_front_porch(mut self, hsync_front_porch: u32) -> Self {
            self.hsync_front_porch = hsync_front_porch;
            self
        }

        #[must_use]
        pub fn vsync_back_porch(mut self, vsync_back_porch: u32) -> Self {
            self.vsync_back_porch = vsync_back_porch;
            self
        }

        #[must_use]
        pub fn vsync_front_porch(mut self, vsync_front_porch: u32) -> Self {
            self.vsync_front_porch = vsync_front_porch;
            self
        }

        /// Total line length and frame height including porches.
        pub const fn total(&self) -> (u32, u32) {
            (
                self.xres + self.hsync_back_porch + self.hsync_front_porch,
                self.yres + self.vsync_back_porch + self.vsync_front_porch,
            )
        }
    }

    /// Hardware layer configuration
    #[derive(Debug, Clone, Copy)]
    pub struct LayerConfig {
        pub format: PixelFormat,
        /// RGB888 color shown where the layer is transparent
        pub default_color: u32,
        pub transparency: Transparency,
        /// RGB888 chroma key programmed at initialization
        pub chroma_key: u32,
        /// Whether the layer supports chroma keying at all
        pub chroma_key_enabled: bool,
    }

    impl LayerConfig {
        pub const fn new(format: PixelFormat) -> Self {
            Self {
                format,
                default_color: 0,
                transparency: Transparency::new(0x7f, BlendMode::Constant),
                chroma_key: 0,
                chroma_key_enabled: false,
            }
        }

        #[must_use]
        pub fn default_color(mut self, default_color: u32) -> Self {
            self.default_color = default_color;
            self
        }

        #[must_use]
        pub fn transparency(mut self, transparency: Transparency) -> Self {
            self.transparency = transparency;
            self
        }

        #[must_use]
        pub fn chroma_key(mut self, chroma_key: u32) -> Self {
            self.chroma_key = chroma_key;
            self.chroma_key_enabled = true;
            self
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DitherConfig {
        pub enable: bool,
        pub level: u8,
        pub red: u8,
        pub green: u8,
        pub blue: u8,
    }

    impl Default for DitherConfig {
        fn default() -> Self {
            Self {
                enable: false,
                level: 0,
                red: 2,
                green: 2,
                blue: 2,
            }
        }
    }

    /// How frames reach the panel
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum RefreshMode {
        /// One frame per `update`, panel with its own memory
        #[default]
        Command,
        /// Continuous streaming, the controller never sleeps
        Video,
        /// Frames are captured to memory by the write-back layer
        WriteBack,
    }

    /// What starts a frame in command mode
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum FrameTrigger {
        /// The panel's tearing-effect signal
        #[default]
        TearingEffect,
        /// A software start
        Software,
    }

    /// Primitive `wait_for_vsync` blocks on
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SyncSource {
        Pan,
        TearingEffect,
        FrameDone,
    }

    /// Off-screen overlays served by the DMA2D engine
    #[derive(Debug, Clone, Copy)]
    pub struct Dma2dOverlays {
        pub count: u8,
        /// Start of the memory shared by the overlays, `len` bytes each
        pub fbmem: usize,
        pub len: usize,
        pub format: PixelFormat,
        pub xres: u32,
        pub yres: u32,
    }

    /// Complete LCDC configuration
    #[derive(Debug, Clone)]
    pub struct LcdcConfig {
        pub irq: IrqNumber,
        pub irq_priority: u8,
        pub timing: VideoTiming,
        pub layer1: LayerConfig,
        pub layer2: Option<LayerConfig>,
        pub background_color: u32,
        pub dither: DitherConfig,
        pub dsi_format: PixelFormat,
        pub refresh: RefreshMode,
        pub trigger: FrameTrigger,
        /// Sleep between frames in command mode
        pub low_power: bool,
        /// Pan-display double buffering
        pub double_buffer: bool,
        /// Tearing-effect interrupt line, when the panel provides one
        pub te_irq: Option<IrqNumber>,
        pub dma2d_overlays: Option<Dma2dOverlays>,
        /// Capture buffer used in write-back refresh mode
        pub write_back_fbmem: usize,
        pub write_back_format: PixelFormat,
    }

    impl LcdcConfig {
        /// Create a new LCDC configuration with default values
        ///
        /// # Arguments
        ///
        /// * `irq` - Interrupt line of the controller
        /// * `timing` - Resolution and porches of the panel
        pub fn new(irq: IrqNumber, timing: VideoTiming) -> Self {
            Self {
                irq,
                irq_priority: 3,
                timing,
                layer1: LayerConfig::new(PixelFormat::Argb8888),
                layer2: None,
                background_color: 0,
                dither: DitherConfig::default(),
                dsi_format: PixelFormat::Rgb888,
                refresh: RefreshMode::Command,
                trigger: FrameTrigger::TearingEffect,
                low_power: false,
                double_buffer: false,
                te_irq: None,
                dma2d_overlays: None,
                write_back_fbmem: 0,
                write_back_format: PixelFormat::Argb8888,
            }
        }

        #[must_use]
        pub fn irq_priority(mut self, irq_priority: u8) -> Self {
            self.irq_priority = irq_priority;
            self
        }

        #[must_use]
        pub fn layer1(mut self, layer1: LayerConfig) -> Self {
            self.layer1 = layer1;
            self
        }

        #[must_use]
        pub fn layer2(mut self, layer2: LayerConfig) -> Self {
            self.layer2 = Some(layer2);
            self
        }

        #[must_use]
        pub fn background_color(mut self, background_color: u32) -> Self {
            self.background_color = background_color;
            self
        }

        #[must_use]
        pub fn dither(mut self, dither: DitherConfig) -> Self {
            self.dither = dither;
            self
        }

        #[must_use]
        pub fn dsi_format(mut self, dsi_format: PixelFormat) -> Self {
            self.dsi_format = dsi_format;
            self
        }

        #[must_use]
        pub fn refresh(mut self, refresh: RefreshMode) -> Self {
            self.refresh = refresh;
            self
        }

        #[must_use]
        pub fn trigger(mut self, trigger: FrameTrigger) -> Self {
            self.trigger = trigger;
            self
        }

        #[must_use]
        pub fn low_power(mut self, low_power: bool) -> Self {
            self.low_power = low_power;
            self
        }

        #[must_use]
        pub fn double_buffer(mut self, double_buffer: bool) -> Self {
            self.double_buffer = double_buffer;
            self
        }

        #[must_use]
        pub fn te_irq(mut self, te_irq: IrqNumber) -> Self {
            self.te_irq = Some(te_irq);
            self
        }

        #[must_use]
        pub fn dma2d_overlays(mut self, overlays: Dma2dOverlays) -> Self {
            self.dma2d_overlays = Some(overlays);
            self
        }

        #[must_use]
        pub fn write_back(mut self, fbmem: usize, format: PixelFormat) -> Self {
            self.refresh = RefreshMode::WriteBack;
            self.write_back_fbmem = fbmem;
            self.write_back_format = format;
            self
        }

        /// Number of hardware layers.
        pub fn layers(&self) -> u8 {
            1 + self.layer2.is_some() as u8
        }

        /// Hardware layers plus DMA2D-only overlays.
        pub fn overlays(&self) -> u8 {
            self.layers() + self.dma2d_overlays.map_or(0, |o| o.count)
        }

        /// Pan completion first, then tearing effect, then frame done.
        pub fn sync_source(&self) -> SyncSource {
            if self.double_buffer {
                SyncSource::Pan
            } else if self.te_irq.is_some() {
                SyncSource::TearingEffect
            } else {
                SyncSource::FrameDone
            }
        }

        pub(crate) fn layer(&self, index: u8) -> Option<&LayerConfig> {
            match index {
                0 => Some(&self.layer1),
                1 => self.layer2.as_ref(),
                _ => None,
            }
        }

        /// Format of the plane shown on the panel.
        pub fn video_format(&self) -> PixelFormat {
            self.layer2.as_ref().unwrap_or(&self.layer1).format
        }
    }
}

pub use config::*;

/// Maximum number of overlays, hardware layers included.
pub const MAX_OVERLAYS: usize = 8;

/// Called from the frame-done interrupt with the outcome of the frame.
pub type IrqCallback = fn(Result<()>);

/// Overlay and area pair addressing one side of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayArea {
    pub overlay: u8,
    pub area: Area,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlitRequest {
    pub dest: OverlayArea,
    pub src: OverlayArea,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendRequest {
    pub dest: OverlayArea,
    pub foreground: OverlayArea,
    pub background: OverlayArea,
}

const SYNC_LINE_PIXELS: u32 = 5;
const SMART_PANEL_BURST: u8 = 0x0f;
const OUTPUT_BURST: u8 = 8;

/// Hardware slot of LCDC overlay `index`.
const fn hw_layer(index: u8) -> Layer {
    match index {
        0 => Layer::Foreground,
        _ => Layer::Background,
    }
}

/// Swaps a RGB888 key into the BGR order of the compare register.
const fn bgr(rgb: u32) -> u32 {
    (rgb & 0xff) << 16 | (rgb & 0xff00) | (rgb >> 16) & 0xff
}

/// State guarded by the engine lock.
struct Shared {
    initialized: bool,
    overlays: heapless::Vec<Overlay, MAX_OVERLAYS>,
    write_back: Option<Overlay>,
    clut: ColorMap,
    curves: CurveMap,
    dither: DitherMap,
}

/// State shared with the interrupt handler.
#[derive(Debug, Clone, Copy, Default)]
struct IsrState {
    /// Pending pan: start address and y offset
    pan: Option<(usize, u32)>,
    yoffset: u32,
    asleep: bool,
    callback: Option<IrqCallback>,
    /// Displayed plane, captured at initialization
    plane: Option<PanPlane>,
}

/// Geometry of the displayed plane needed to pan without the engine lock.
#[derive(Debug, Clone, Copy)]
struct PanPlane {
    layer: Layer,
    fbmem: usize,
    stride: u32,
    xres_virtual: u32,
    yres_virtual: u32,
}

/// LCDC driver
pub struct Lcdc<R, D, C> {
    regs: IrqCell<R>,
    isr: IrqCell<IsrState>,
    cache: CacheAdapter<C>,
    dma2d: Dma2d<D, C>,
    config: LcdcConfig,
    state: Mutex<Shared>,
    done: Semaphore,
    pan: Semaphore,
    te: Semaphore,
    pm: PmBridge,
    initialized: AtomicBool,
}

impl<R, D, C> Lcdc<R, D, C>
where
    R: RegisterBlock,
    D: RegisterBlock,
    C: DataCache + Clone,
{
    pub fn new(regs: R, dma2d: Dma2d<D, C>, cache: C, config: LcdcConfig) -> Self {
        Self {
            regs: IrqCell::new(regs),
            isr: IrqCell::new(IsrState::default()),
            cache: CacheAdapter::new(cache),
            dma2d,
            config,
            state: Mutex::new(Shared {
                initialized: false,
                overlays: heapless::Vec::new(),
                write_back: None,
                clut: ColorMap::default(),
                curves: CurveMap::default(),
                dither: DitherMap::default(),
            }),
            done: Semaphore::new(0),
            pan: Semaphore::new(0),
            te: Semaphore::new(0),
            pm: PmBridge::new(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LcdcConfig {
        &self.config
    }

    /// The owned DMA2D engine. Its interrupt vector calls
    /// `lcdc.dma2d().on_interrupt()`.
    pub fn dma2d(&self) -> &Dma2d<D, C> {
        &self.dma2d
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Resets the controller, binds the layers to `fbmem`, programs the
    /// panel timings, installs the interrupt vectors, initializes the DMA2D
    /// engine and every layer.
    ///
    /// With two layers the region is split in halves, layer 2 being the
    /// displayed plane. Calling it again while initialized is a no-op.
    ///
    /// # Safety
    ///
    /// `fbmem..fbmem + fblen`, the DMA2D overlay memory and the write-back
    /// buffer named by the configuration must be valid, exclusively owned
    /// memory for as long as the driver is initialized.
    pub unsafe fn initialize<I>(&self, fbmem: usize, fblen: usize, irqc: &mut I) -> Result<()>
    where
        I: InterruptController + ?Sized,
    {
        let mut state = self.state.lock();

        if state.initialized {
            return Ok(());
        }

        log::info!("Initialize LCDC driver");

        let overlays = self.setup_overlays(fbmem, fblen)?;

        self.write(Command::Reset)?;

        log::debug!("Configure lcd periphery");
        self.periph_config()?;

        log::debug!("Configure interrupts");
        self.write(Command::IrqDisable)?;
        interrupt::install(irqc, self.config.irq, self.config.irq_priority);
        if let Some(te_irq) = self.config.te_irq {
            interrupt::install(irqc, te_irq, self.config.irq_priority);
        }

        log::debug!("Configure global register");
        self.global_config()?;

        self.dma2d.initialize(irqc)?;

        state.clut = ColorMap::default();
        state.overlays = overlays;

        for index in 0..self.config.layers() {
            self.layer_init(&mut state, index)?;
        }

        state.write_back = if self.config.refresh == RefreshMode::WriteBack {
            let (xres, yres) = (self.config.timing.xres, self.config.timing.yres);
            let format = self.config.write_back_format;

            Some(Overlay::new(
                self.config.overlays(),
                self.config.write_back_fbmem,
                format.bytes(xres) as usize * yres as usize,
                format,
                xres,
                yres,
            ))
        } else {
            None
        };

        let plane = state.overlays[self.plane_index() as usize];
        self.isr.lock(|s| {
            *s = IsrState {
                plane: Some(PanPlane {
                    layer: hw_layer(self.plane_index()),
                    fbmem: plane.fbmem,
                    stride: plane.stride,
                    xres_virtual: plane.xres,
                    yres_virtual: (plane.fblen / plane.stride.max(1) as usize) as u32,
                }),
                callback: s.callback,
                ..IsrState::default()
            }
        });

        self.done.reset(0);
        self.pan.reset(0);
        self.te.reset(0);

        self.write(Command::FrameDoneIrqEnable(true))?;
        self.enter_low_power()?;

        state.initialized = true;
        self.initialized.store(true, Ordering::SeqCst);

        log::info!("LCDC enabled, {} overlays", self.config.overlays());

        Ok(())
    }

    pub fn uninitialize<I>(&self, irqc: &mut I) -> Result<()>
    where
        I: InterruptController + ?Sized,
    {
        let mut state = self.state.lock();

        self.write(Command::IrqDisable)?;
        irqc.clear_pending(self.config.irq);
        irqc.disable(self.config.irq);
        if let Some(te_irq) = self.config.te_irq {
            irqc.disable(te_irq);
        }

        self.dma2d.uninitialize(irqc)?;

        self.isr.lock(|s| {
            s.plane = None;
            s.pan = None;
        });
        state.initialized = false;
        self.initialized.store(false, Ordering::SeqCst);

        Ok(())
    }

    unsafe fn setup_overlays(
        &self,
        fbmem: usize,
        fblen: usize,
    ) -> Result<heapless::Vec<Overlay, MAX_OVERLAYS>> {
        if self.config.overlays() as usize > MAX_OVERLAYS {
            log::error!("LCDC: {} overlays configured", self.config.overlays());
            return Err(Error::InvalidArg);
        }

        let (xres, yres) = (self.config.timing.xres, self.config.timing.yres);
        let layer_len = fblen / self.config.layers() as usize;

        let mut overlays = heapless::Vec::new();

        for index in 0..self.config.layers() {
            let Some(layer) = self.config.layer(index) else {
                continue;
            };
            let addr = fbmem + layer_len * index as usize;

            let overlay = Overlay::new(index, addr, layer_len, layer.format, xres, yres)
                .transparency(layer.transparency);
            let overlay = Overlay {
                chromakey: layer.chroma_key,
                ..overlay
            };

            overlays.push(overlay).map_err(|_| Error::InvalidArg)?;
        }

        if let Some(extra) = self.config.dma2d_overlays {
            for n in 0..extra.count {
                let overlay = Overlay::new(
                    self.config.layers() + n,
                    extra.fbmem + extra.len * n as usize,
                    extra.len,
                    extra.format,
                    extra.xres,
                    extra.yres,
                )
                .transparency(Transparency::new(0xff, BlendMode::Constant));

                overlays.push(overlay).map_err(|_| Error::InvalidArg)?;
            }
        }

        Ok(overlays)
    }

    fn periph_config(&self) -> Result<()> {
        let timing = &self.config.timing;
        let video = self.config.refresh == RefreshMode::Video;
        let (total_w, total_h) = timing.total();

        let mut p = Vec::with_capacity(32);

        p.push(Command::StandbyVsync);
        p.push(Command::PorchVsync(32, 32, 10));
        p.push(Command::PixelVsync(30, 31));
        p.push(Command::OnScreen(Layer::Foreground, 1, 1));
        p.push(Command::OnScreen(Layer::Background, 1, 1));
        p.push(Command::HPorch(timing.hsync_back_porch, timing.hsync_front_porch));
        p.push(Command::VPorch(timing.vsync_back_porch, timing.vsync_front_porch));
        if video {
            p.push(Command::VhTotal(total_w + 4, total_h + 8));
        } else {
            p.push(Command::VhTotal(total_w, total_h));
            p.push(Command::SmartPanelEnable(true));
        }
        p.push(Command::Size(Layer::SmartPanel, timing.xres, timing.yres));
        p.push(Command::SelectTop(Layer::Foreground));

        if self.config.refresh == RefreshMode::WriteBack {
            let format = self.config.write_back_format;

            p.push(Command::LayerEnable(Layer::WriteBack, true));
            p.push(Command::Size(Layer::WriteBack, timing.xres, timing.yres));
            p.push(Command::PixelFormat {
                layer: Layer::WriteBack,
                mode: BlendMode::Constant,
                alpha: 0,
                format,
            });
            p.push(Command::StartAddress(Layer::WriteBack, self.config.write_back_fbmem));
            p.push(Command::Pitch(Layer::WriteBack, format.bytes(timing.xres)));
        }

        let smpn = match self.config.video_format().bits_per_pixel() {
            16 => 5,
            _ => 3,
        };

        p.push(Command::FrameDoneIrqEnable(true));
        p.push(Command::SyncTriggerDisable);
        p.push(Command::SmpnMode(smpn));
        p.push(Command::MemEnable(true));
        p.push(Command::DmaTransferTrigger(Layer::Foreground, true));
        p.push(Command::SyncLinePixels(SYNC_LINE_PIXELS));
        p.push(Command::SmartPanelBurstLength(SMART_PANEL_BURST));
        p.push(Command::OutputBurstLength(OUTPUT_BURST));

        self.write_all(&p)
    }

    fn global_config(&self) -> Result<()> {
        let dither = self.config.dither;

        self.write_all(&[
            Command::Dither {
                enable: dither.enable,
                level: dither.level,
                red: dither.red,
                green: dither.green,
                blue: dither.blue,
            },
            Command::BackgroundColor(self.config.background_color),
            Command::DsiColorFormat(self.config.dsi_format),
            Command::ByteOrder(ByteOrder::Rgb),
            Command::AxiFastMode(true),
        ])
    }

    /// Brings hardware layer `index` to its configured default state.
    fn layer_init(&self, state: &mut Shared, index: u8) -> Result<()> {
        let Some(config) = self.config.layer(index) else {
            return Err(Error::InvalidArg);
        };
        let overlay = state.overlays[index as usize];
        let layer = hw_layer(index);
        let onscreen = if self.config.refresh == RefreshMode::Video { 0 } else { 1 };

        self.write(Command::LayerEnable(layer, false))?;

        overlay.clear();

        let mut p = Vec::with_capacity(16);
        p.push(Command::StartAddress(layer, overlay.fbmem));
        p.push(Command::Size(layer, overlay.xres, overlay.yres));
        p.push(Command::Pitch(layer, overlay.stride));
        p.push(Command::Zoom(layer, overlay.xres, overlay.yres));
        p.push(Command::OnScreen(layer, onscreen, onscreen));
        p.push(Command::PixelFormat {
            layer,
            mode: overlay.transp.mode,
            alpha: overlay.transp.alpha,
            format: overlay.format,
        });
        p.push(Command::Color(Layer::SmartPanel, config.default_color));
        p.push(Command::Transparency {
            layer,
            mode: overlay.transp.mode,
            alpha: overlay.transp.alpha,
        });

        if config.chroma_key_enabled {
            p.push(Command::ChromaKey {
                layer,
                rgb: bgr(config.chroma_key),
                replace: 0,
            });
            p.push(Command::ChromaKeyEnable(layer, true));
        }

        self.write_all(&p)?;

        if overlay.format.is_clut() {
            self.put_layer_clut(&state.clut)?;
            self.write(Command::ClutEnable(layer, true))?;
        }

        self.write(Command::LayerEnable(layer, true))
    }

    fn put_layer_clut(&self, clut: &ColorMap) -> Result<()> {
        self.regs.lock(|regs| {
            clut.range()
                .try_for_each(|n| regs.write(Command::ClutEntry(n as u8, clut.rgb(n))).into_result())
        })
    }

    fn plane_index(&self) -> u8 {
        self.config.layers() - 1
    }

    fn overlay(&self, state: &Shared, index: u8) -> Result<Overlay> {
        state
            .overlays
            .get(index as usize)
            .copied()
            .ok_or_else(|| {
                log::error!("LCDC: no overlay {index}");
                Error::InvalidArg
            })
    }

    fn locked(&self) -> Result<MutexGuard<'_, Shared>> {
        let state = self.state.lock();
        if state.initialized {
            Ok(state)
        } else {
            Err(Error::InvalidState)
        }
    }

    fn sleeps(&self) -> bool {
        self.config.low_power && self.config.refresh != RefreshMode::Video
    }

    fn enter_low_power(&self) -> Result<()> {
        if self.sleeps() {
            self.write(Command::Sleep)?;
            self.isr.lock(|s| s.asleep = true);
        }
        Ok(())
    }

    fn exit_low_power(&self) -> Result<()> {
        if self.isr.lock(|s| core::mem::replace(&mut s.asleep, false)) {
            self.write(Command::Wakeup)?;
        }
        Ok(())
    }

    fn start_command(&self) -> Command {
        match self.config.trigger {
            FrameTrigger::Software => Command::Start,
            FrameTrigger::TearingEffect => Command::StartDsi,
        }
    }

    /// Produces one composited frame.
    ///
    /// In write-back mode the frame is captured into the write-back buffer.
    /// In video mode the controller streams continuously and the call returns
    /// without waiting.
    ///
    /// # Errors
    ///
    /// * `Canceled` - the hardware reported a configuration error
    pub fn update(&self) -> Result<()> {
        let state = self.locked()?;
        self.update_locked(&state)
    }

    fn update_locked(&self, state: &Shared) -> Result<()> {
        log::debug!("LCDC: update");

        self.exit_low_power()?;

        match self.config.refresh {
            RefreshMode::Video => Ok(()),
            RefreshMode::WriteBack => {
                let Some(wb) = state.write_back else {
                    return Err(Error::InvalidState);
                };

                self.cache.flush_overlay(&wb);
                self.done.reset(0);
                self.write_all(&[
                    Command::WriteBackToggle,
                    Command::StartAddress(Layer::WriteBack, wb.fbmem),
                    Command::StartWriteBack,
                ])?;

                let result = self.done.wait();
                self.cache.invalidate_overlay(&wb);

                result
            }
            RefreshMode::Command => {
                self.done.reset(0);
                self.write(self.start_command())?;
                self.done.wait()
            }
        }
    }

    /// Flushes the displayed rows of `area` and updates the panel.
    pub fn update_area(&self, area: &Area) -> Result<()> {
        let state = self.locked()?;

        let plane = self.overlay(&state, self.plane_index())?;
        if area.is_empty() || area.right() > plane.xres || area.bottom() > plane.yres {
            return Err(Error::InvalidArg);
        }

        let isr = self.isr.get();
        if self.config.refresh == RefreshMode::Video && isr.pan.is_some() {
            return Ok(());
        }

        let addr = plane.mem_address(area.x, area.y + isr.yoffset);
        interrupt::free(|| {
            if area.x == 0 && area.w == plane.xres {
                self.cache.flush(addr, plane.stride as usize * area.h as usize);
            } else {
                for row in 0..area.h as usize {
                    self.cache.flush(
                        addr + row * plane.stride as usize,
                        plane.format.bytes(area.w) as usize,
                    );
                }
            }
        });

        log::debug!("LCDC: update area {area:?}");

        self.update_locked(&state)
    }

    /// Schedules the displayed plane to start `yoffset` rows into its
    /// buffer. The swap happens in the next frame-done interrupt.
    ///
    /// # Errors
    ///
    /// * `NotSupported` - double buffering is not configured
    /// * `InvalidArg` - the offsets leave the virtual resolution
    pub fn pan_display(&self, xoffset: u32, yoffset: u32) -> Result<()> {
        if !self.config.double_buffer {
            return Err(Error::NotSupported);
        }

        let (xres, yres) = (self.config.timing.xres, self.config.timing.yres);

        interrupt::free(|| {
            let Some(plane) = self.isr.lock(|s| s.plane) else {
                return Err(Error::InvalidState);
            };

            if yoffset > plane.yres_virtual.saturating_sub(yres)
                || xoffset > plane.xres_virtual.saturating_sub(xres)
            {
                log::warn!("LCDC: pan offset ({xoffset}, {yoffset}) out of range");
                return Err(Error::InvalidArg);
            }

            let addr = plane.fbmem + plane.stride as usize * yoffset as usize;

            self.pan.reset(0);
            self.cache.flush(addr, plane.stride as usize * yres as usize);
            self.isr.lock(|s| s.pan = Some((addr, yoffset)));

            Ok(())
        })
    }

    /// Blocks until the next vertical synchronization: pan completion when
    /// double buffering, else the tearing-effect pulse, else frame done.
    pub fn wait_for_vsync(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::InvalidState);
        }

        match self.config.sync_source() {
            SyncSource::Pan => self.pan.wait(),
            SyncSource::TearingEffect => self.te.wait(),
            SyncSource::FrameDone => self.done.wait(),
        }
    }

    /// Frame-done interrupt handler. Never blocks.
    pub fn on_interrupt(&self) {
        let video = self.config.refresh == RefreshMode::Video;
        let sleeps = self.sleeps();
        let trigger = match self.config.trigger {
            FrameTrigger::Software => Command::Start,
            FrameTrigger::TearingEffect => Command::TeTrigger,
        };

        let outcome = self.regs.lock(|regs| {
            let raw = regs.irq_status();
            let (status, _) = decode_status(raw);

            if status.contains(IrqEvent::FrameDone) {
                regs.irq_clear(
                    (IrqEvent::FrameDone | IrqEvent::Irq0 | IrqEvent::Irq1).as_repr(),
                );

                let result = self.isr.lock(|s| {
                    let mut result = Ok(());

                    if let (Some((addr, yoffset)), Some(plane)) = (s.pan.take(), s.plane) {
                        if s.asleep {
                            result = result.and(regs.write(Command::Wakeup).into_result());
                            s.asleep = false;
                        }
                        result = result
                            .and(regs.write(Command::StartAddress(plane.layer, addr)).into_result());
                        s.yoffset = yoffset;
                        if !video {
                            result = result.and(regs.write(trigger).into_result());
                        }
                    }

                    if sleeps {
                        let slept = regs.write(Command::Sleep).into_result();
                        s.asleep = slept.is_ok();
                        result = result.and(slept);
                    }

                    result
                });

                Some((true, result))
            } else if status.contains(IrqEvent::ConfigError) {
                regs.irq_clear(IrqStatus::only(IrqEvent::ConfigError).as_repr());
                Some((false, Err(Error::Canceled)))
            } else {
                if raw & crate::hal::IRQ_STATUS_MASK != 0 {
                    log::warn!("LCDC: unknown interrupt status {raw:#010x}");
                }
                None
            }
        });

        match outcome {
            Some((true, result)) => {
                if let Err(e) = result {
                    log::warn!("LCDC: register write failed in frame-done handler: {e}");
                }

                self.pan.post_if_below(1, result);

                if let Some(callback) = self.isr.get().callback {
                    callback(result);
                }

                self.done.post_if_below(1, result);
            }
            Some((false, result)) => {
                self.done.post_if_below(1, result);
            }
            None => {}
        }
    }

    /// Tearing-effect interrupt handler.
    pub fn on_te_interrupt(&self) {
        self.te.post_if_below(1, Ok(()));
    }

    /// Installs `callback`, invoked from the frame-done interrupt.
    pub fn irq_callback_register(&self, callback: IrqCallback) {
        self.isr.lock(|s| s.callback = Some(callback));
    }

    pub fn get_video_info(&self) -> Result<VideoInfo> {
        if !self.is_initialized() {
            return Err(Error::InvalidState);
        }

        Ok(VideoInfo {
            format: self.config.video_format(),
            xres: self.config.timing.xres,
            yres: self.config.timing.yres,
            nplanes: 1,
            noverlays: self.config.overlays(),
        })
    }

    pub fn get_plane_info(&self, planeno: u8) -> Result<PlaneInfo> {
        self.plane_info(planeno)
    }

    fn plane_info(&self, planeno: u8) -> Result<PlaneInfo> {
        if planeno != 0 {
            return Err(Error::InvalidArg);
        }

        let state = self.locked()?;
        let plane = self.overlay(&state, self.plane_index())?;

        Ok(PlaneInfo {
            fbmem: plane.fbmem,
            fblen: plane.fblen,
            stride: plane.stride,
            display: 0,
            bpp: plane.bpp,
            xres_virtual: plane.xres,
            yres_virtual: (plane.fblen / plane.stride.max(1) as usize) as u32,
            xoffset: 0,
            yoffset: self.isr.get().yoffset,
        })
    }

    pub fn get_overlay_info(&self, overlay: u8) -> Result<Overlay> {
        let state = self.locked()?;
        self.overlay(&state, overlay)
    }

    /// Write-back capture buffer, in write-back refresh mode.
    pub fn get_write_back(&self) -> Option<Overlay> {
        self.state.lock().write_back
    }

    /// Sets the transparency of `overlay`. `mode` is 0 for a constant alpha,
    /// 1 for per-pixel alpha.
    ///
    /// Hardware layers are reprogrammed immediately, DMA2D-only overlays use
    /// the value on their next transfer.
    ///
    /// # Errors
    ///
    /// * `UnsupportedMode` - `mode` is neither 0 nor 1
    /// * `InvalidArg` - no such overlay
    pub fn set_transparency(&self, overlay: u8, alpha: u8, mode: u8) -> Result<()> {
        let mode = BlendMode::try_from(mode).map_err(|e| {
            log::error!("LCDC: transparency mode {mode} not supported");
            e
        })?;

        let mut state = self.locked()?;
        self.overlay(&state, overlay)?;

        state.overlays[overlay as usize].transp = Transparency::new(alpha, mode);

        if overlay < self.config.layers() {
            self.write(Command::Transparency {
                layer: hw_layer(overlay),
                mode,
                alpha,
            })?;
        }

        Ok(())
    }

    /// Programs the chroma key of a hardware layer. With a CLUT video format
    /// `key` is a table index, otherwise an RGB888 color.
    ///
    /// # Errors
    ///
    /// * `NotSupported` - the layer has no chroma-key support, or the overlay
    ///   is DMA2D-only
    /// * `InvalidArg` - no such overlay, or `key` is past the CLUT entries
    pub fn set_chroma_key(&self, overlay: u8, key: u32) -> Result<()> {
        if overlay >= self.config.overlays() {
            return Err(Error::InvalidArg);
        }

        match self.config.layer(overlay) {
            Some(layer) if layer.chroma_key_enabled => {}
            _ => {
                log::warn!("LCDC: overlay {overlay} has no chroma key support");
                return Err(Error::NotSupported);
            }
        }

        let mut state = self.locked()?;

        let rgb = if self.config.video_format().is_clut() {
            if key >= state.clut.len as u32 || key as usize >= CLUT_SIZE {
                log::error!("LCDC: clut index {key} out of range");
                return Err(Error::InvalidArg);
            }
            state.clut.rgb(key as usize)
        } else {
            bgr(key)
        };

        state.overlays[overlay as usize].chromakey = key;

        let layer = hw_layer(overlay);
        self.write_all(&[
            Command::ChromaKey {
                layer,
                rgb,
                replace: 0,
            },
            Command::ChromaKeyEnable(layer, true),
        ])
    }

    /// Fills the selected area of `overlay` with `argb` using the DMA2D
    /// engine.
    pub fn set_color(&self, overlay: u8, argb: u32) -> Result<()> {
        let mut state = self.locked()?;
        let target = self.overlay(&state, overlay)?;

        state.overlays[overlay as usize].color = argb;

        self.dma2d.fill(&target, &target.sarea, argb)
    }

    /// Hides (`blank`) or shows a hardware layer. DMA2D-only overlays are
    /// never visible and only record the flag.
    pub fn set_blank(&self, overlay: u8, blank: bool) -> Result<()> {
        let mut state = self.locked()?;
        self.overlay(&state, overlay)?;

        state.overlays[overlay as usize].blank = blank;

        if overlay < self.config.layers() {
            self.write(Command::LayerEnable(hw_layer(overlay), !blank))?;
        }

        Ok(())
    }

    /// Selects the area of a DMA2D-only overlay used by `set_color`.
    ///
    /// # Errors
    ///
    /// * `NotSupported` - hardware layers always cover the display
    /// * `InvalidArg` - no such overlay, or `area` outside it
    pub fn set_area(&self, overlay: u8, area: &Area) -> Result<()> {
        if overlay < self.config.layers() {
            return Err(Error::NotSupported);
        }

        let mut state = self.locked()?;
        self.overlay(&state, overlay)?.check(area)?;

        state.overlays[overlay as usize].sarea = *area;

        Ok(())
    }

    /// Mirrors a hardware layer vertically.
    pub fn set_mirror(&self, overlay: u8, enable: bool) -> Result<()> {
        if overlay >= self.config.layers() {
            return Err(Error::InvalidArg);
        }

        let state = self.locked()?;
        let target = self.overlay(&state, overlay)?;
        let sarea = target.sarea;

        let row = if enable { sarea.bottom() - 1 } else { sarea.y };
        let layer = hw_layer(overlay);

        self.write_all(&[
            Command::StartAddress(layer, target.mem_address(sarea.x, row)),
            Command::Mirror(layer, enable),
        ])
    }

    /// Copies between overlays with the DMA2D engine, scaling when the areas
    /// differ in size.
    pub fn blit(&self, request: &BlitRequest) -> Result<()> {
        let state = self.locked()?;

        let dest = self.overlay(&state, request.dest.overlay)?;
        let src = self.overlay(&state, request.src.overlay)?;

        dest.check(&request.dest.area)?;
        src.check(&request.src.area)?;

        self.dma2d
            .blit(&dest, &request.dest.area, &src, &request.src.area)
    }

    /// Blends two overlays into a third with the DMA2D engine.
    pub fn blend(&self, request: &BlendRequest) -> Result<()> {
        let state = self.locked()?;

        let dest = self.overlay(&state, request.dest.overlay)?;
        let fg = self.overlay(&state, request.foreground.overlay)?;
        let bg = self.overlay(&state, request.background.overlay)?;

        dest.check(&request.dest.area)?;
        fg.check(&request.foreground.area)?;
        bg.check(&request.background.area)?;

        self.dma2d.blend(
            &dest,
            &request.dest.area,
            &fg,
            &request.foreground.area,
            &bg,
            &request.background.area,
        )
    }

    fn check_clut(&self, first: u16) -> Result<()> {
        if !self.config.video_format().is_clut() {
            log::error!(
                "LCDC: CLUT is not supported for {:?}",
                self.config.video_format()
            );
            return Err(Error::InvalidArg);
        }

        if first as usize >= CLUT_SIZE {
            log::error!("LCDC: only {CLUT_SIZE} color table entries supported");
            return Err(Error::InvalidArg);
        }

        Ok(())
    }

    pub fn get_clut(&self, cmap: &mut ColorMap) -> Result<()> {
        self.check_clut(cmap.first)?;

        let state = self.locked()?;

        for n in cmap.range() {
            cmap.set(n, state.clut.red[n], state.clut.green[n], state.clut.blue[n]);
            cmap.transp[n] = state.clut.transp[n];
        }

        Ok(())
    }

    /// Writes entries `cmap.first..cmap.len` of the shared lookup table to
    /// every CLUT layer and to the DMA2D engine.
    pub fn put_clut(&self, cmap: &ColorMap) -> Result<()> {
        self.check_clut(cmap.first)?;

        let mut state = self.locked()?;

        for n in cmap.range() {
            state.clut.set(n, cmap.red[n], cmap.green[n], cmap.blue[n]);
            state.clut.transp[n] = cmap.transp[n];
        }
        state.clut.first = cmap.first;
        state.clut.len = cmap.len;

        for index in 0..self.config.layers() {
            if state.overlays[index as usize].format.is_clut() {
                self.put_layer_clut(cmap)?;
            }
        }

        self.dma2d.set_clut(cmap)
    }

    pub fn get_curves(&self, curves: &mut CurveMap) -> Result<()> {
        if curves.first as usize >= CLUT_SIZE {
            return Err(Error::InvalidArg);
        }

        let state = self.locked()?;

        for n in curves.range() {
            curves.red[n] = state.curves.red[n];
            curves.green[n] = state.curves.green[n];
            curves.blue[n] = state.curves.blue[n];
        }

        Ok(())
    }

    /// Writes the color adjustment curves and enables them.
    pub fn put_curves(&self, curves: &CurveMap) -> Result<()> {
        if curves.first as usize >= CLUT_SIZE {
            log::error!("LCDC: only {CLUT_SIZE} curve entries supported");
            return Err(Error::InvalidArg);
        }

        let mut state = self.locked()?;

        for n in curves.range() {
            state.curves.red[n] = curves.red[n];
            state.curves.green[n] = curves.green[n];
            state.curves.blue[n] = curves.blue[n];
        }
        state.curves.first = curves.first;
        state.curves.len = curves.len;

        self.regs.lock(|regs| {
            curves
                .range()
                .try_for_each(|n| regs.write(Command::CurveEntry(n as u8, curves.rgb(n))).into_result())
        })?;

        self.write(Command::CurvesEnable(Layer::Foreground, true))
    }

    pub fn get_dither(&self) -> Result<DitherMap> {
        Ok(self.locked()?.dither)
    }

    /// Writes the dither table to the controller and the DMA2D engine.
    pub fn put_dither(&self, map: &DitherMap) -> Result<()> {
        if map.first as usize >= DITHER_SIZE {
            log::error!("LCDC: only {DITHER_SIZE} dither entries supported");
            return Err(Error::InvalidArg);
        }

        let mut state = self.locked()?;

        for n in map.range() {
            state.dither.data[n] = map.data[n];
        }
        state.dither.first = map.first;
        state.dither.len = map.len;

        self.regs.lock(|regs| {
            map.range()
                .try_for_each(|n| regs.write(Command::DitherEntry(n as u8, map.data[n])).into_result())
        })?;

        self.dma2d.set_dither_table(map)
    }

    /// Registers a client asked before the regular ones when leaving normal
    /// power.
    pub fn pm_early_register(&self, client: PmClient) -> Result<()> {
        self.pm.register_early(client)
    }

    pub fn pm_register(&self, client: PmClient) -> Result<()> {
        self.pm.register(client)
    }

    pub fn pm_unregister(&self, client: &PmClient) {
        self.pm.unregister(client)
    }

    pub fn pm_state(&self) -> PmState {
        self.pm.state()
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
}

impl<R, D, C> PmCallback for Lcdc<R, D, C>
where
    R: RegisterBlock,
    D: RegisterBlock,
    C: DataCache + Clone,
{
    /// Asks the DMA2D engine, then every registrant.
    fn prepare(&self, domain: u8, state: PmState) -> Result<()> {
        let dma2d = self.dma2d.prepare(domain, state);
        let clients = self.pm.prepare(domain, state);

        dma2d.and(clients)
    }

    fn notify(&self, domain: u8, state: PmState) {
        self.dma2d.notify(domain, state);
        self.pm.notify(domain, state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    use crate::cache::align_to_lines;
    use crate::dma2d::Dma2dConfig;
    use crate::testing::{
        spawn_irq_pump, CacheOp, IrqLine, IrqOp, MockCache, MockInterrupts, MockRegisters,
    };

    type TestLcdc = Lcdc<MockRegisters, MockRegisters, MockCache>;

    const XRES: u32 = 16;
    const YRES: u32 = 8;

    struct Display {
        lcdc: Arc<TestLcdc>,
        regs: MockRegisters,
        dma2d_regs: MockRegisters,
        cache: MockCache,
        irqc: MockInterrupts,
        fb: Vec<u32>,
        extra: Vec<u32>,
        wb: Vec<u32>,
        line: Option<IrqLine>,
    }

    impl Display {
        fn new(config: impl FnOnce(LcdcConfig) -> LcdcConfig) -> Self {
            Self::with_buffer(2, config)
        }

        /// `frames` full frames per layer in the framebuffer region.
        fn with_buffer(frames: usize, config: impl FnOnce(LcdcConfig) -> LcdcConfig) -> Self {
            let (regs, line) = MockRegisters::new();
            let (dma2d_regs, dma2d_line) = MockRegisters::new();
            let cache = MockCache::default();

            let mut extra = vec![0u32; 2 * (XRES * YRES) as usize];
            let wb = vec![0u32; (XRES * YRES) as usize];

            let base = LcdcConfig::new(40, VideoTiming::new(XRES, YRES))
                .trigger(FrameTrigger::Software)
                .dma2d_overlays(Dma2dOverlays {
                    count: 2,
                    fbmem: extra.as_mut_ptr() as usize,
                    len: (XRES * YRES * 4) as usize,
                    format: PixelFormat::Argb8888,
                    xres: XRES,
                    yres: YRES,
                });
            let mut config = config(base);
            if config.refresh == RefreshMode::WriteBack {
                config.write_back_fbmem = wb.as_ptr() as usize;
            }

            let layers = config.layers() as usize;
            let fb = vec![0xdead_beefu32; frames * layers * (XRES * YRES) as usize];

            let dma2d = Dma2d::new(dma2d_regs.clone(), cache.clone(), Dma2dConfig::new(41));
            let lcdc = Arc::new(Lcdc::new(regs.clone(), dma2d, cache.clone(), config));

            let engine = lcdc.clone();
            spawn_irq_pump(dma2d_line, move || engine.dma2d().on_interrupt());

            Self {
                lcdc,
                regs,
                dma2d_regs,
                cache,
                irqc: MockInterrupts::default(),
                fb,
                extra,
                wb,
                line: Some(line),
            }
        }

        fn init(&mut self) -> Result<()> {
            let fbmem = self.fb.as_mut_ptr() as usize;
            let fblen = self.fb.len() * 4;
            unsafe { self.lcdc.initialize(fbmem, fblen, &mut self.irqc) }
        }

        /// Delivers controller interrupts from a background thread.
        fn pump(&mut self) {
            if let Some(line) = self.line.take() {
                let engine = self.lcdc.clone();
                spawn_irq_pump(line, move || engine.on_interrupt());
            }
        }

        fn started(mut self) -> Self {
            self.init().unwrap();
            self.regs.clear_log();
            self.dma2d_regs.clear_log();
            self.pump();
            self
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut display = Display::new(|c| c);

        display.init().unwrap();
        let writes = display.regs.log().len();
        let overlays: Vec<Overlay> = (0..4)
            .map(|n| display.lcdc.get_overlay_info(n).unwrap())
            .collect();

        display.init().unwrap();

        assert_eq!(display.regs.log().len(), writes);
        for (n, overlay) in overlays.iter().enumerate() {
            assert_eq!(display.lcdc.get_overlay_info(n as u8).unwrap(), *overlay);
        }

        // The layer buffer was cleared, the second frame left alone.
        let frame = (XRES * YRES) as usize;
        assert!(display.fb[..frame].iter().all(|&p| p == 0));

        assert_eq!(
            display.irqc.ops(),
            [
                IrqOp::Priority(40, 3),
                IrqOp::Clear(40),
                IrqOp::Enable(40),
                IrqOp::Priority(41, 3),
                IrqOp::Clear(41),
                IrqOp::Enable(41),
            ]
        );
        assert!(display.lcdc.dma2d().is_initialized());
    }

    #[test]
    fn layer_init_programs_the_layer() {
        let mut display = Display::new(|c| {
            c.layer1(
                LayerConfig::new(PixelFormat::Argb8888)
                    .default_color(0x00a0_b0c0)
                    .chroma_key(0x0011_2233),
            )
        });
        display.init().unwrap();

        let log = display.regs.log();
        let fbmem = display.fb.as_ptr() as usize;

        let position = |c: Command| log.iter().position(|x| *x == c).unwrap();
        let disable = position(Command::LayerEnable(Layer::Foreground, false));
        let address = position(Command::StartAddress(Layer::Foreground, fbmem));
        let enable = position(Command::LayerEnable(Layer::Foreground, true));

        assert!(disable < address && address < enable);
        assert!(log.contains(&Command::Pitch(Layer::Foreground, XRES * 4)));
        assert!(log.contains(&Command::Color(Layer::SmartPanel, 0x00a0_b0c0)));
        assert!(log.contains(&Command::Transparency {
            layer: Layer::Foreground,
            mode: BlendMode::Constant,
            alpha: 0x7f,
        }));
        assert!(log.contains(&Command::ChromaKey {
            layer: Layer::Foreground,
            rgb: 0x0033_2211,
            replace: 0,
        }));
        assert!(log.contains(&Command::SmpnMode(3)));
    }

    #[test]
    fn dma2d_overlays_follow_hardware_layers() {
        let display = Display::new(|c| c).started();

        let info = display.lcdc.get_video_info().unwrap();
        assert_eq!(info.noverlays, 3);
        assert_eq!(info.nplanes, 1);

        let overlay = display.lcdc.get_overlay_info(1).unwrap();
        assert_eq!(overlay.fbmem, display.extra.as_ptr() as usize);
        assert_eq!(overlay.transp, Transparency::new(0xff, BlendMode::Constant));

        assert_eq!(display.lcdc.get_overlay_info(3), Err(Error::InvalidArg));
        assert_eq!(display.lcdc.get_plane_info(1), Err(Error::InvalidArg));
    }

    #[test]
    fn two_layers_split_the_region() {
        let display = Display::with_buffer(1, |c| c.layer2(LayerConfig::new(PixelFormat::Rgb565)))
            .started();

        let l1 = display.lcdc.get_overlay_info(0).unwrap();
        let l2 = display.lcdc.get_overlay_info(1).unwrap();
        assert_eq!(l2.fbmem, l1.fbmem + l1.fblen);

        // Layer 2 is the displayed plane.
        let plane = display.lcdc.get_plane_info(0).unwrap();
        assert_eq!(plane.fbmem, l2.fbmem);
        assert_eq!(plane.bpp, 16);
        assert_eq!(display.lcdc.get_video_info().unwrap().format, PixelFormat::Rgb565);
    }

    #[test]
    fn chroma_key_without_support_touches_no_registers() {
        let display = Display::new(|c| c).started();

        assert_eq!(display.lcdc.set_chroma_key(0, 0x00ff_0000), Err(Error::NotSupported));
        assert_eq!(display.lcdc.set_chroma_key(1, 0x00ff_0000), Err(Error::NotSupported));
        assert_eq!(display.lcdc.set_chroma_key(7, 0x00ff_0000), Err(Error::InvalidArg));

        assert!(display.regs.log().is_empty());
    }

    #[test]
    fn chroma_key_is_programmed_in_bgr_order() {
        let display = Display::new(|c| {
            c.layer1(LayerConfig::new(PixelFormat::Argb8888).chroma_key(0))
        })
        .started();

        display.lcdc.set_chroma_key(0, 0x0012_3456).unwrap();

        assert_eq!(
            display.regs.log(),
            [
                Command::ChromaKey {
                    layer: Layer::Foreground,
                    rgb: 0x0056_3412,
                    replace: 0,
                },
                Command::ChromaKeyEnable(Layer::Foreground, true),
            ]
        );
        assert_eq!(display.lcdc.get_overlay_info(0).unwrap().chromakey, 0x0012_3456);
    }

    #[test]
    fn transparency_validation() {
        let display = Display::new(|c| c).started();

        assert_eq!(display.lcdc.set_transparency(0, 0x80, 2), Err(Error::UnsupportedMode));
        assert_eq!(display.lcdc.set_transparency(9, 0x80, 2), Err(Error::UnsupportedMode));
        assert_eq!(display.lcdc.set_transparency(9, 0x80, 1), Err(Error::InvalidArg));
        assert!(display.regs.log().is_empty());

        display.lcdc.set_transparency(0, 0x40, 1).unwrap();
        assert_eq!(
            display.regs.log(),
            [Command::Transparency {
                layer: Layer::Foreground,
                mode: BlendMode::PerPixel,
                alpha: 0x40,
            }]
        );

        // DMA2D-only overlays only update their shadow state.
        display.regs.clear_log();
        display.lcdc.set_transparency(2, 0x10, 0).unwrap();
        assert!(display.regs.log().is_empty());
        assert_eq!(
            display.lcdc.get_overlay_info(2).unwrap().transp,
            Transparency::new(0x10, BlendMode::Constant)
        );
    }

    #[test]
    fn update_in_command_mode_waits_for_frame_done() {
        let display = Display::new(|c| c.low_power(true)).started();

        display.lcdc.update().unwrap();

        let log = display.regs.log();
        assert_eq!(log[0], Command::Wakeup);
        assert_eq!(log[1], Command::Start);
        assert!(log.contains(&Command::Sleep));
    }

    #[test]
    fn update_reports_configuration_errors() {
        let display = Display::new(|c| c).started();
        display.regs.fail_next_start();

        assert_eq!(display.lcdc.update(), Err(Error::Canceled));
        assert_eq!(display.lcdc.update(), Ok(()));
    }

    #[test]
    fn update_with_tearing_effect_trigger() {
        let display = Display::new(|c| c.trigger(FrameTrigger::TearingEffect)).started();

        display.lcdc.update().unwrap();

        assert_eq!(display.regs.log(), [Command::StartDsi]);
    }

    #[test]
    fn video_mode_update_does_not_trigger() {
        let display = Display::new(|c| c.refresh(RefreshMode::Video).low_power(true)).started();

        display.lcdc.update().unwrap();

        assert!(display.regs.log().is_empty());
    }

    #[test]
    fn write_back_update_captures_frame() {
        let display = Display::new(|c| c.write_back(0, PixelFormat::Argb8888)).started();
        let wb = display.lcdc.get_write_back().unwrap();
        assert_eq!(wb.fbmem, display.wb.as_ptr() as usize);

        display.lcdc.update().unwrap();

        assert_eq!(
            display.regs.log(),
            [
                Command::WriteBackToggle,
                Command::StartAddress(Layer::WriteBack, wb.fbmem),
                Command::StartWriteBack,
            ]
        );

        let ops = display.cache.ops();
        assert!(matches!(ops[ops.len() - 2], CacheOp::Sync(..)));
        assert!(matches!(ops[ops.len() - 1], CacheOp::Invalidate(..)));
    }

    #[test]
    fn update_area_flushes_rows() {
        let display = Display::new(|c| c).started();
        let plane = display.lcdc.get_plane_info(0).unwrap();
        let before = display.cache.ops().len();

        display.lcdc.update_area(&Area::new(0, 2, XRES, 3)).unwrap();
        let ops = display.cache.ops();
        let (start, len) = align_to_lines(
            plane.fbmem + 2 * plane.stride as usize,
            3 * plane.stride as usize,
        );
        assert_eq!(ops[before], CacheOp::Sync(start, len));

        let before = ops.len();
        display.lcdc.update_area(&Area::new(8, 0, 8, 4)).unwrap();
        assert_eq!(display.cache.ops().len() - before, 4);

        assert_eq!(
            display.lcdc.update_area(&Area::new(8, 0, 9, 4)),
            Err(Error::InvalidArg)
        );
        assert_eq!(
            display.lcdc.update_area(&Area::new(u32::MAX, 0, 2, 1)),
            Err(Error::InvalidArg)
        );
        assert_eq!(display.regs.starts(), 2);
    }

    #[test]
    fn pan_display_swaps_in_the_interrupt() {
        let display = Display::new(|c| c.double_buffer(true)).started();
        let plane = display.lcdc.get_plane_info(0).unwrap();
        assert_eq!(plane.yres_virtual, 2 * YRES);

        assert_eq!(display.lcdc.pan_display(0, YRES + 1), Err(Error::InvalidArg));
        assert_eq!(display.lcdc.pan_display(1, 0), Err(Error::InvalidArg));

        display.lcdc.pan_display(0, YRES).unwrap();
        assert!(display.regs.log().is_empty());

        display.lcdc.update().unwrap();
        display.lcdc.wait_for_vsync().unwrap();

        let addr = plane.fbmem + (plane.stride * YRES) as usize;
        assert!(display
            .regs
            .log()
            .contains(&Command::StartAddress(Layer::Foreground, addr)));
        assert_eq!(display.lcdc.get_plane_info(0).unwrap().yoffset, YRES);
    }

    #[test]
    fn pan_display_does_not_wait_for_a_frame_in_flight() {
        let mut display = Display::new(|c| c.double_buffer(true));
        display.init().unwrap();
        let plane = display.lcdc.get_plane_info(0).unwrap();

        let lcdc = display.lcdc.clone();
        let update = thread::spawn(move || lcdc.update());

        // The frame is triggered, its interrupt is held back.
        display.line.as_ref().unwrap().wait();

        display.lcdc.pan_display(0, YRES).unwrap();
        assert!(!update.is_finished());

        display.lcdc.on_interrupt();
        assert_eq!(update.join().unwrap(), Ok(()));

        let addr = plane.fbmem + (plane.stride * YRES) as usize;
        assert!(display
            .regs
            .log()
            .contains(&Command::StartAddress(Layer::Foreground, addr)));
    }

    #[test]
    fn pan_display_requires_initialization() {
        let display = Display::new(|c| c.double_buffer(true));
        assert_eq!(display.lcdc.pan_display(0, 0), Err(Error::InvalidState));
    }

    #[test]
    fn register_failure_in_interrupt_reaches_the_waiter() {
        let display = Display::new(|c| c.low_power(true)).started();

        // Wakeup and Start succeed, the Sleep issued by the handler fails.
        display.regs.fail_write_after(2, -5);

        assert_eq!(display.lcdc.update(), Err(Error::Io(-5)));
        assert!(!display.regs.log().contains(&Command::Sleep));

        // Still awake, so the next frame needs no wakeup.
        display.regs.clear_log();
        display.lcdc.update().unwrap();
        assert_eq!(display.regs.log()[0], Command::Start);
    }

    #[test]
    fn pan_display_requires_double_buffering() {
        let display = Display::new(|c| c).started();
        assert_eq!(display.lcdc.pan_display(0, 0), Err(Error::NotSupported));
    }

    #[test]
    fn tearing_effect_sync_source() {
        let display = Display::new(|c| c.te_irq(42)).started();
        assert_eq!(display.lcdc.config().sync_source(), SyncSource::TearingEffect);

        display.lcdc.on_te_interrupt();
        display.lcdc.on_te_interrupt();
        display.lcdc.wait_for_vsync().unwrap();
        assert_eq!(display.lcdc.te.value(), 0);
    }

    #[test]
    fn frame_done_runs_the_callback() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn callback(result: Result<()>) {
            assert_eq!(result, Ok(()));
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let display = Display::new(|c| c).started();
        display.lcdc.irq_callback_register(callback);

        display.lcdc.update().unwrap();

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_interrupt_is_ignored() {
        let mut display = Display::new(|c| c);
        display.init().unwrap();

        display.regs.raise_status(1 << 20);
        display.lcdc.on_interrupt();

        assert_eq!(display.lcdc.done.value(), 0);
        assert_eq!(display.regs.status(), 1 << 20);
    }

    #[test]
    fn set_color_fills_through_dma2d() {
        let display = Display::new(|c| c).started();

        display.lcdc.set_color(1, 0xff12_3456).unwrap();

        assert_eq!(display.dma2d_regs.starts(), 1);
        let frame = (XRES * YRES) as usize;
        assert!(display.extra[..frame].iter().all(|&p| p == 0xff12_3456));
        assert!(display.extra[frame..].iter().all(|&p| p == 0));
        assert_eq!(display.lcdc.get_overlay_info(1).unwrap().color, 0xff12_3456);
    }

    #[test]
    fn blank_and_area_rules() {
        let display = Display::new(|c| c).started();

        display.lcdc.set_blank(0, true).unwrap();
        assert_eq!(display.regs.log(), [Command::LayerEnable(Layer::Foreground, false)]);

        display.regs.clear_log();
        display.lcdc.set_blank(2, true).unwrap();
        assert!(display.regs.log().is_empty());
        assert_eq!(display.lcdc.set_blank(3, true), Err(Error::InvalidArg));

        let area = Area::new(2, 2, 4, 4);
        assert_eq!(display.lcdc.set_area(0, &area), Err(Error::NotSupported));
        assert_eq!(
            display.lcdc.set_area(1, &Area::new(0, 0, XRES + 1, 1)),
            Err(Error::InvalidArg)
        );
        display.lcdc.set_area(1, &area).unwrap();
        assert_eq!(display.lcdc.get_overlay_info(1).unwrap().sarea, area);
    }

    #[test]
    fn blit_and_blend_between_overlays() {
        let mut display = Display::new(|c| c).started();

        let frame = (XRES * YRES) as usize;
        display.extra[..frame].fill(0xff00_00ff);

        let full = Area::new(0, 0, XRES, YRES);
        display
            .lcdc
            .blit(&BlitRequest {
                dest: OverlayArea { overlay: 2, area: full },
                src: OverlayArea { overlay: 1, area: full },
            })
            .unwrap();
        assert!(display.extra[frame..].iter().all(|&p| p == 0xff00_00ff));

        display
            .lcdc
            .blend(&BlendRequest {
                dest: OverlayArea { overlay: 0, area: full },
                foreground: OverlayArea { overlay: 1, area: full },
                background: OverlayArea { overlay: 2, area: full },
            })
            .unwrap();
        assert!(display.fb[..frame].iter().all(|&p| p == 0xff00_00ff));

        let outside = Area::new(0, 0, XRES, YRES + 1);
        assert_eq!(
            display.lcdc.blit(&BlitRequest {
                dest: OverlayArea { overlay: 2, area: outside },
                src: OverlayArea { overlay: 1, area: full },
            }),
            Err(Error::InvalidArg)
        );
        assert_eq!(
            display.lcdc.blit(&BlitRequest {
                dest: OverlayArea { overlay: 5, area: full },
                src: OverlayArea { overlay: 1, area: full },
            }),
            Err(Error::InvalidArg)
        );
        assert_eq!(display.dma2d_regs.starts(), 2);
    }

    #[test]
    fn mirror_moves_start_address_to_last_row() {
        let display = Display::new(|c| c).started();
        let overlay = display.lcdc.get_overlay_info(0).unwrap();

        display.lcdc.set_mirror(0, true).unwrap();
        display.lcdc.set_mirror(0, false).unwrap();

        assert_eq!(
            display.regs.log(),
            [
                Command::StartAddress(Layer::Foreground, overlay.mem_address(0, YRES - 1)),
                Command::Mirror(Layer::Foreground, true),
                Command::StartAddress(Layer::Foreground, overlay.fbmem),
                Command::Mirror(Layer::Foreground, false),
            ]
        );
        assert_eq!(display.lcdc.set_mirror(1, true), Err(Error::InvalidArg));
    }

    #[test]
    fn clut_requires_indexed_video_format() {
        let display = Display::new(|c| c).started();

        assert_eq!(display.lcdc.put_clut(&ColorMap::default()), Err(Error::InvalidArg));
        assert_eq!(display.lcdc.get_clut(&mut ColorMap::default()), Err(Error::InvalidArg));
    }

    #[test]
    fn clut_round_trip_reaches_both_engines() {
        let display = Display::with_buffer(1, |c| c.layer1(LayerConfig::new(PixelFormat::Rgb8)))
            .started();

        let mut cmap = ColorMap::new(0, CLUT_SIZE as u16);
        for n in 0..CLUT_SIZE {
            cmap.set(n, n as u8, 0x80, (n as u8) ^ 0xff);
        }
        display.lcdc.put_clut(&cmap).unwrap();

        let mut readback = ColorMap::new(0, CLUT_SIZE as u16);
        display.lcdc.get_clut(&mut readback).unwrap();
        assert_eq!(readback.red, cmap.red);
        assert_eq!(readback.green, cmap.green);
        assert_eq!(readback.blue, cmap.blue);

        assert_eq!(display.regs.count(|c| matches!(c, Command::ClutEntry(..))), CLUT_SIZE);
        assert_eq!(
            display.dma2d_regs.count(|c| matches!(c, Command::ClutEntry(..))),
            CLUT_SIZE
        );

        assert_eq!(display.lcdc.get_clut(&mut ColorMap::new(256, 300)), Err(Error::InvalidArg));

        // Chroma keys are CLUT indices in this format.
        assert_eq!(display.lcdc.set_chroma_key(0, 3), Err(Error::NotSupported));
    }

    #[test]
    fn curves_are_written_and_enabled() {
        let display = Display::new(|c| c).started();

        let curves = CurveMap::linear();
        display.lcdc.put_curves(&curves).unwrap();

        let log = display.regs.log();
        assert_eq!(log.len(), CLUT_SIZE + 1);
        assert_eq!(log[0x10], Command::CurveEntry(0x10, 0x0010_1010));
        assert_eq!(log[CLUT_SIZE], Command::CurvesEnable(Layer::Foreground, true));

        let mut readback = CurveMap::new(0, CLUT_SIZE as u16);
        display.lcdc.get_curves(&mut readback).unwrap();
        assert_eq!(readback, curves);

        assert_eq!(display.lcdc.put_curves(&CurveMap::new(256, 256)), Err(Error::InvalidArg));
    }

    #[test]
    fn dither_table_reaches_both_engines() {
        let display = Display::new(|c| c).started();

        display.lcdc.put_dither(&DitherMap::new([4, 3, 2, 1])).unwrap();

        assert_eq!(display.regs.log()[0], Command::DitherEntry(0, 4));
        assert_eq!(display.dma2d_regs.log()[3], Command::DitherEntry(3, 1));
        assert_eq!(display.lcdc.get_dither().unwrap().data, [4, 3, 2, 1]);

        let bad = DitherMap {
            first: 4,
            len: 4,
            data: [0; 4],
        };
        assert_eq!(display.lcdc.put_dither(&bad), Err(Error::InvalidArg));
    }

    #[test]
    fn operations_require_initialization() {
        let display = Display::new(|c| c);

        assert_eq!(display.lcdc.update(), Err(Error::InvalidState));
        assert_eq!(display.lcdc.get_video_info(), Err(Error::InvalidState));
        assert_eq!(display.lcdc.set_blank(0, true), Err(Error::InvalidState));
    }

    #[test]
    fn uninitialize_disables_both_vectors() {
        let mut display = Display::new(|c| c);
        display.init().unwrap();

        let mut irqc = MockInterrupts::default();
        display.lcdc.uninitialize(&mut irqc).unwrap();

        assert_eq!(
            irqc.ops(),
            [IrqOp::Clear(40), IrqOp::Disable(40), IrqOp::Disable(41)]
        );
        assert!(!display.lcdc.is_initialized());
        assert!(!display.lcdc.dma2d().is_initialized());
    }

    struct Veto;

    impl PmCallback for Veto {
        fn prepare(&self, _domain: u8, state: PmState) -> Result<()> {
            if state > PmState::Normal {
                Err(Error::Busy)
            } else {
                Ok(())
            }
        }

        fn notify(&self, _domain: u8, _state: PmState) {}
    }

    #[test]
    fn pm_calls_are_forwarded_to_registrants() {
        let display = Display::new(|c| c).started();
        let veto: PmClient = Arc::new(Veto);

        display.lcdc.pm_register(veto.clone()).unwrap();
        assert_eq!(display.lcdc.prepare(0, PmState::Standby), Err(Error::Busy));
        assert_eq!(display.lcdc.prepare(0, PmState::Normal), Ok(()));

        display.lcdc.pm_unregister(&veto);
        assert_eq!(display.lcdc.prepare(0, PmState::Standby), Ok(()));
        display.lcdc.notify(0, PmState::Standby);
        assert_eq!(display.lcdc.pm_state(), PmState::Standby);
        assert_eq!(display.lcdc.dma2d().pm_state(), PmState::Standby);
    }
}
