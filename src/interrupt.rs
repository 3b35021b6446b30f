use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// Interrupt line number as understood by the platform interrupt controller.
pub type IrqNumber = u16;

/// Interrupt controller primitives needed to install an engine's vector.
///
/// The platform vector itself calls the engine's `on_interrupt`.
pub trait InterruptController: Send {
    fn set_priority(&mut self, irq: IrqNumber, priority: u8);

    fn clear_pending(&mut self, irq: IrqNumber);

    fn enable(&mut self, irq: IrqNumber);

    fn disable(&mut self, irq: IrqNumber);
}

impl<I> InterruptController for &mut I
where
    I: InterruptController + ?Sized,
{
    fn set_priority(&mut self, irq: IrqNumber, priority: u8) {
        (**self).set_priority(irq, priority)
    }

    fn clear_pending(&mut self, irq: IrqNumber) {
        (**self).clear_pending(irq)
    }

    fn enable(&mut self, irq: IrqNumber) {
        (**self).enable(irq)
    }

    fn disable(&mut self, irq: IrqNumber) {
        (**self).disable(irq)
    }
}

/// Installs a vector the way both engines do: priority, clear, enable.
pub fn install<I>(ctrl: &mut I, irq: IrqNumber, priority: u8)
where
    I: InterruptController + ?Sized,
{
    log::debug!("irq {irq}: install with priority {priority}");

    ctrl.set_priority(irq, priority);
    ctrl.clear_pending(irq);
    ctrl.enable(irq);
}

/// Executes closure `f` with interrupts disabled.
#[inline(always)]
pub fn free<R>(f: impl FnOnce() -> R) -> R {
    critical_section::with(|_| f())
}

/// State shared between thread context and an interrupt handler.
///
/// Every access runs inside a critical section, so the handler never observes
/// a half-written value and never blocks.
pub struct IrqCell<T>(Mutex<CriticalSectionRawMutex, RefCell<T>>);

impl<T> IrqCell<T> {
    pub const fn new(data: T) -> Self {
        Self(Mutex::new(RefCell::new(data)))
    }

    /// Runs `f` on the shared value with interrupts disabled. `f` must not
    /// re-enter the same cell.
    #[inline(always)]
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.0.lock(|cell| f(&mut cell.borrow_mut()))
    }
}

impl<T: Copy> IrqCell<T> {
    pub fn get(&self) -> T {
        self.lock(|value| *value)
    }

    pub fn set(&self, value: T) {
        self.lock(|slot| *slot = value)
    }
}

impl<T: Default> Default for IrqCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
