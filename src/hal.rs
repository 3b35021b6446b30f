//! Register interface consumed by the LCDC and DMA2D engines.
//!
//! Both engines drive the same composition pipeline (layer fetch, blend,
//! smart-panel constant layer, timing generator), the DMA2D one running it in
//! loop-back mode. Every primitive register programming step is expressed as
//! one [`Command`]; a platform implements [`RegisterBlock`] once per engine
//! instance.

use enumset::{EnumSet, EnumSetType};

use crate::errors::HalError;
use crate::format::PixelFormat;
use crate::overlay::BlendMode;

/// Hardware pipeline slot.
#[derive(Debug, EnumSetType)]
pub enum Layer {
    /// LCDC layer 1 / DMA2D foreground fetch
    Foreground,
    /// LCDC layer 2 / DMA2D background fetch
    Background,
    /// DMA2D write-back output
    Output,
    /// Constant color smart-panel layer
    SmartPanel,
    /// LCDC write-back capture
    WriteBack,
}

pub type LayerSet = EnumSet<Layer>;

/// Interrupt status bits. The low byte of the status register is reserved.
#[derive(Debug, EnumSetType)]
#[enumset(repr = "u32")]
pub enum IrqEvent {
    /// Panel path interrupt 0 (video mode frame boundary)
    Irq0 = 8,
    /// Panel path interrupt 1
    Irq1 = 9,
    /// Frame done
    FrameDone = 10,
    /// Configuration error detected by the pipeline
    ConfigError = 11,
    /// Panel tearing-effect pulse
    TearingEffect = 12,
}

pub type IrqStatus = EnumSet<IrqEvent>;

/// Mask of status bits the interrupt handlers look at.
pub const IRQ_STATUS_MASK: u32 = 0xffff_ff00;

/// Transfer kind, used by the timing-porch programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Fill = 0,
    Blit = 1,
    Blend = 2,
}

impl Action {
    /// Number of memory layers (sources and destination) feeding the transfer.
    pub const fn memory_layers(&self) -> u8 {
        match self {
            Action::Fill => 1,
            Action::Blit => 2,
            Action::Blend => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Rgb,
    Bgr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Controller
    Reset,
    PixelFormatReset,
    IrqDisable,
    ErrorIrqEnable,
    FrameDoneIrqEnable(bool),
    SyncTriggerDisable,
    LayerClock(bool),
    AxiFastMode(bool),
    MemEnable(bool),
    SmartPanelEnable(bool),

    // Layer geometry and format
    LayerEnable(Layer, bool),
    PixelFormat {
        layer: Layer,
        mode: BlendMode,
        alpha: u8,
        format: PixelFormat,
    },
    Transparency {
        layer: Layer,
        mode: BlendMode,
        alpha: u8,
    },
    Color(Layer, u32),
    StartAddress(Layer, usize),
    Size(Layer, u32, u32),
    Pitch(Layer, u32),
    Zoom(Layer, u32, u32),
    OnScreen(Layer, u32, u32),
    Mirror(Layer, bool),
    BlendSource(Layer),
    SelectTop(Layer),
    SwapPath(u8),
    SwapPathEnable(bool),

    // Chroma key and tables
    ChromaKey {
        layer: Layer,
        rgb: u32,
        replace: u32,
    },
    ChromaKeyEnable(Layer, bool),
    ClutEnable(Layer, bool),
    ClutEntry(u8, u32),
    CurvesEnable(Layer, bool),
    CurveEntry(u8, u32),
    DitherEntry(u8, u32),
    Dither {
        enable: bool,
        level: u8,
        red: u8,
        green: u8,
        blue: u8,
    },
    BackgroundColor(u32),
    ByteOrder(ByteOrder),
    DsiColorFormat(PixelFormat),

    // Write-back and DMA path
    SmpnMode(u8),
    WdmaOneFramePerTrigger,
    OutputBurstLength(u8),
    SmartPanelBurstLength(u8),
    SmartPanelBurstMax,
    DmaTransferTrigger(Layer, bool),

    // Timing generator
    VsyncPorch {
        action: Action,
        width: u32,
        fast: u8,
        slow: u8,
    },
    VhTotal(u32, u32),
    HPorch(u32, u32),
    VPorch(u32, u32),
    StandbyVsync,
    PorchVsync(u32, u32, u32),
    PixelVsync(u32, u32),
    SyncLinePixels(u32),

    // Triggers and power
    Start,
    StartDsi,
    StartWriteBack,
    WriteBackToggle,
    TeTrigger,
    Sleep,
    Wakeup,
}

/// Register access for one engine instance.
pub trait RegisterBlock: Send {
    /// Performs one programming step.
    fn write(&mut self, command: Command) -> HalError;

    /// Raw interrupt status register.
    fn irq_status(&mut self) -> u32;

    /// Clears the given status bits.
    fn irq_clear(&mut self, mask: u32);
}

impl<R> RegisterBlock for &mut R
where
    R: RegisterBlock + ?Sized,
{
    fn write(&mut self, command: Command) -> HalError {
        (**self).write(command)
    }

    fn irq_status(&mut self) -> u32 {
        (**self).irq_status()
    }

    fn irq_clear(&mut self, mask: u32) {
        (**self).irq_clear(mask)
    }
}

#[cfg(feature = "alloc")]
impl<R> RegisterBlock for alloc::boxed::Box<R>
where
    R: RegisterBlock + ?Sized,
{
    fn write(&mut self, command: Command) -> HalError {
        (**self).write(command)
    }

    fn irq_status(&mut self) -> u32 {
        (**self).irq_status()
    }

    fn irq_clear(&mut self, mask: u32) {
        (**self).irq_clear(mask)
    }
}

/// Splits a raw status word into the known events and the leftover bits.
pub fn decode_status(raw: u32) -> (IrqStatus, u32) {
    let known = IrqStatus::from_repr_truncated(raw);
    let unknown = raw & IRQ_STATUS_MASK & !known.as_repr();

    (known, unknown)
}
