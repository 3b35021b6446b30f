#![cfg_attr(not(feature = "std"), no_std)]
// The `EnumSetType` derive on `hal::Layer` (which has an `Output` variant)
// expands to `Self::Output` paths that trip this deny-by-default lint.
#![allow(ambiguous_associated_items)]

extern crate alloc;

pub mod cache;
pub mod dma2d;
pub mod errors;
pub mod fb;
pub mod format;
pub mod hal;
pub mod interrupt;
pub mod lcdc;
pub mod mutex;
pub mod overlay;
pub mod pm;
pub mod semaphore;
pub mod split;

#[cfg(test)]
mod testing;
