//! A polling driver for the DMA controller found on the BCM2835 family of
//! SoCs, aimed at moving pixel data into a framebuffer.
//!
//! All register access goes through a [`RegisterPort`]. On hardware, that is
//! an [`Mmio`] port; anything else (such as a simulated controller) can
//! stand in for it.
#![cfg_attr(not(test), no_std)]

pub mod dmac;
pub mod mmio;

pub use bcm2835_config as config;

pub use self::dmac::Dmac;
pub use self::mmio::{Mmio, RegisterPort};

#[cfg(test)]
pub(crate) mod test_util;
