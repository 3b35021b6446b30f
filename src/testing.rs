//! Recording mocks of the platform collaborators for unit tests.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::vec::Vec;

use crate::cache::DataCache;
use crate::errors::HalError;
use crate::format::PixelFormat;
use crate::hal::{Command, IrqEvent, IrqStatus, Layer, LayerSet, RegisterBlock};
use crate::interrupt::{InterruptController, IrqNumber};
use crate::overlay::BlendMode;

/// Receiving end of the simulated interrupt line. One token per raised
/// interrupt.
pub struct IrqLine(Receiver<()>);

impl IrqLine {
    /// Blocks until the hardware raises its interrupt.
    pub fn wait(&self) {
        self.0.recv().unwrap();
    }
}

/// Delivers every interrupt raised on `line` by calling `isr` from a
/// dedicated thread.
pub fn spawn_irq_pump(line: IrqLine, isr: impl Fn() + Send + 'static) {
    thread::spawn(move || {
        while line.0.recv().is_ok() {
            isr();
        }
    });
}

#[derive(Debug, Clone, Copy, Default)]
struct LayerRegs {
    addr: usize,
    pitch: u32,
    size: (u32, u32),
    zoom: Option<(u32, u32)>,
    format: Option<PixelFormat>,
    mode: BlendMode,
    alpha: u8,
}

struct State {
    log: Vec<Command>,
    status: u32,
    fail_start: bool,
    fail_write: Option<(usize, i32)>,
    writes: usize,
    enabled: LayerSet,
    layers: [LayerRegs; 5],
    color: u32,
    irq: Sender<()>,
}

/// Register bank recording every command. On `Start` it performs the
/// programmed composition on real memory, latches the frame-done status and
/// raises the interrupt line.
#[derive(Clone)]
pub struct MockRegisters(Arc<Mutex<State>>);

impl MockRegisters {
    pub fn new() -> (Self, IrqLine) {
        let (tx, rx) = mpsc::channel();

        let state = State {
            log: Vec::new(),
            status: 0,
            fail_start: false,
            fail_write: None,
            writes: 0,
            enabled: LayerSet::empty(),
            layers: Default::default(),
            color: 0,
            irq: tx,
        };

        (Self(Arc::new(Mutex::new(state))), IrqLine(rx))
    }

    pub fn log(&self) -> Vec<Command> {
        self.0.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.0.lock().unwrap().log.clear();
    }

    /// Number of transfers triggered.
    pub fn starts(&self) -> usize {
        self.count(|c| matches!(c, Command::Start))
    }

    pub fn count(&self, f: impl Fn(&Command) -> bool) -> usize {
        self.0.lock().unwrap().log.iter().filter(|c| f(c)).count()
    }

    /// Output window sizes in programming order.
    pub fn output_sizes(&self) -> Vec<(u32, u32)> {
        self.filter_map(|c| match c {
            Command::Size(Layer::Output, w, h) => Some((*w, *h)),
            _ => None,
        })
    }

    /// Foreground zoom targets in programming order.
    pub fn zooms(&self) -> Vec<(u32, u32)> {
        self.filter_map(|c| match c {
            Command::Zoom(Layer::Foreground, w, h) => Some((*w, *h)),
            _ => None,
        })
    }

    pub fn filter_map<T>(&self, f: impl Fn(&Command) -> Option<T>) -> Vec<T> {
        self.0.lock().unwrap().log.iter().filter_map(f).collect()
    }

    /// The next triggered transfer reports a configuration error.
    pub fn fail_next_start(&self) {
        self.0.lock().unwrap().fail_start = true;
    }

    /// The write following `successful` further writes returns `code`.
    pub fn fail_write_after(&self, successful: usize, code: i32) {
        let mut state = self.0.lock().unwrap();
        let at = state.writes + successful;
        state.fail_write = Some((at, code));
    }

    /// Latches raw status bits and raises the interrupt line.
    pub fn raise_status(&self, bits: u32) {
        let state = &mut *self.0.lock().unwrap();
        state.status |= bits;
        let _ = state.irq.send(());
    }

    pub fn status(&self) -> u32 {
        self.0.lock().unwrap().status
    }
}

impl RegisterBlock for MockRegisters {
    fn write(&mut self, command: Command) -> HalError {
        let state = &mut *self.0.lock().unwrap();

        let index = state.writes;
        state.writes += 1;
        if let Some((at, code)) = state.fail_write {
            if at == index {
                state.fail_write = None;
                return HalError(code);
            }
        }

        state.log.push(command);
        state.apply(command);

        HalError::OK
    }

    fn irq_status(&mut self) -> u32 {
        self.0.lock().unwrap().status
    }

    fn irq_clear(&mut self, mask: u32) {
        self.0.lock().unwrap().status &= !mask;
    }
}

impl State {
    fn layer(&mut self, layer: Layer) -> &mut LayerRegs {
        &mut self.layers[layer as usize]
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Reset => {
                self.enabled = LayerSet::empty();
                self.layers = Default::default();
                self.color = 0;
            }
            Command::LayerEnable(layer, enable) => {
                if enable {
                    self.enabled.insert(layer);
                } else {
                    self.enabled.remove(layer);
                }
            }
            Command::PixelFormat {
                layer,
                mode,
                alpha,
                format,
            } => {
                let regs = self.layer(layer);
                regs.format = Some(format);
                regs.mode = mode;
                regs.alpha = alpha;
            }
            Command::Color(Layer::SmartPanel, color) => self.color = color,
            Command::StartAddress(layer, addr) => self.layer(layer).addr = addr,
            Command::Pitch(layer, pitch) => self.layer(layer).pitch = pitch,
            Command::Size(layer, w, h) => self.layer(layer).size = (w, h),
            Command::Zoom(layer, w, h) => self.layer(layer).zoom = Some((w, h)),
            Command::Start => self.trigger(true),
            Command::StartDsi | Command::StartWriteBack | Command::TeTrigger => {
                self.trigger(false)
            }
            _ => {}
        }
    }

    fn trigger(&mut self, compose: bool) {
        let event = if self.fail_start {
            self.fail_start = false;
            IrqEvent::ConfigError
        } else {
            if compose && self.enabled.contains(Layer::Output) {
                self.compose();
            }
            IrqEvent::FrameDone
        };

        self.status |= IrqStatus::only(event).as_repr();
        let _ = self.irq.send(());
    }

    fn compose(&self) {
        let out = self.layers[Layer::Output as usize];
        let fg = self.layers[Layer::Foreground as usize];
        let bg = self.layers[Layer::Background as usize];
        let (ow, oh) = out.size;
        let Some(out_format) = out.format else {
            return;
        };

        let fg_active = self.enabled.contains(Layer::Foreground)
            && !(fg.mode == BlendMode::Constant && fg.alpha == 0);
        let bg_active = self.enabled.contains(Layer::Background);

        for y in 0..oh {
            for x in 0..ow {
                let under = if bg_active {
                    sample(&bg, x, y, out.size)
                } else {
                    self.color
                };

                let pixel = if fg_active {
                    let top = sample(&fg, x, y, out.size);
                    let alpha = match fg.mode {
                        BlendMode::Constant => fg.alpha,
                        BlendMode::PerPixel => (top >> 24) as u8,
                    };
                    blend(top, under, alpha)
                } else {
                    under
                };

                let addr = out.addr + (y * out.pitch) as usize + out_format.bytes(x) as usize;
                // SAFETY: tests program output windows inside their buffers.
                unsafe { store(addr, out_format, pixel) };
            }
        }
    }
}

/// Nearest-neighbour fetch of output pixel (`x`, `y`) from `layer`.
fn sample(layer: &LayerRegs, x: u32, y: u32, out: (u32, u32)) -> u32 {
    let (sw, sh) = layer.size;
    let (zw, zh) = layer.zoom.unwrap_or(out);
    let sx = (x * sw / zw.max(1)).min(sw.saturating_sub(1));
    let sy = (y * sh / zh.max(1)).min(sh.saturating_sub(1));
    let format = layer.format.unwrap_or(PixelFormat::Argb8888);

    let addr = layer.addr + (sy * layer.pitch) as usize + format.bytes(sx) as usize;
    // SAFETY: tests program fetch windows inside their buffers.
    unsafe { load(addr, format) }
}

fn blend(top: u32, under: u32, alpha: u8) -> u32 {
    let a = alpha as u32;
    let mix = |shift: u32| {
        let t = (top >> shift) & 0xff;
        let u = (under >> shift) & 0xff;
        ((t * a + u * (255 - a)) / 255) << shift
    };

    let out_alpha = (a + ((under >> 24) & 0xff) * (255 - a) / 255) << 24;

    out_alpha | mix(16) | mix(8) | mix(0)
}

unsafe fn load(addr: usize, format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Argb8888 => (addr as *const u32).read_unaligned(),
        PixelFormat::Rgb32 => 0xff00_0000 | (addr as *const u32).read_unaligned(),
        PixelFormat::Rgb888 => {
            let p = addr as *const u8;
            0xff00_0000 | (p.add(2).read() as u32) << 16 | (p.add(1).read() as u32) << 8 | p.read() as u32
        }
        PixelFormat::Rgb565 => {
            let v = (addr as *const u16).read_unaligned() as u32;
            let r = (v >> 11) & 0x1f;
            let g = (v >> 5) & 0x3f;
            let b = v & 0x1f;
            0xff00_0000 | (r << 3 | r >> 2) << 16 | (g << 2 | g >> 4) << 8 | (b << 3 | b >> 2)
        }
        _ => 0,
    }
}

unsafe fn store(addr: usize, format: PixelFormat, argb: u32) {
    match format {
        PixelFormat::Argb8888 | PixelFormat::Rgb32 => (addr as *mut u32).write_unaligned(argb),
        PixelFormat::Rgb888 => {
            let p = addr as *mut u8;
            p.write(argb as u8);
            p.add(1).write((argb >> 8) as u8);
            p.add(2).write((argb >> 16) as u8);
        }
        PixelFormat::Rgb565 => {
            let r = (argb >> 19) & 0x1f;
            let g = (argb >> 10) & 0x3f;
            let b = (argb >> 3) & 0x1f;
            (addr as *mut u16).write_unaligned((r << 11 | g << 5 | b) as u16);
        }
        _ => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Sync(usize, usize),
    Invalidate(usize, usize),
}

#[derive(Debug, Clone, Default)]
pub struct MockCache(Arc<Mutex<Vec<CacheOp>>>);

impl MockCache {
    pub fn ops(&self) -> Vec<CacheOp> {
        self.0.lock().unwrap().clone()
    }
}

impl DataCache for MockCache {
    fn sync(&self, addr: usize, len: usize) {
        self.0.lock().unwrap().push(CacheOp::Sync(addr, len));
    }

    fn invalidate(&self, addr: usize, len: usize) {
        self.0.lock().unwrap().push(CacheOp::Invalidate(addr, len));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOp {
    Priority(IrqNumber, u8),
    Clear(IrqNumber),
    Enable(IrqNumber),
    Disable(IrqNumber),
}

#[derive(Debug, Default)]
pub struct MockInterrupts {
    ops: Vec<IrqOp>,
}

impl MockInterrupts {
    pub fn ops(&self) -> Vec<IrqOp> {
        self.ops.clone()
    }
}

impl InterruptController for MockInterrupts {
    fn set_priority(&mut self, irq: IrqNumber, priority: u8) {
        self.ops.push(IrqOp::Priority(irq, priority));
    }

    fn clear_pending(&mut self, irq: IrqNumber) {
        self.ops.push(IrqOp::Clear(irq));
    }

    fn enable(&mut self, irq: IrqNumber) {
        self.ops.push(IrqOp::Enable(irq));
    }

    fn disable(&mut self, irq: IrqNumber) {
        self.ops.push(IrqOp::Disable(irq));
    }
}
