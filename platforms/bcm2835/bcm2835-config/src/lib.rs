//! Configuration for the BCM2835-family DMA controller.
//!
//! The defaults describe a BCM2835 (Raspberry Pi 1 / Zero) driving a
//! 1920-pixel wide, 32-bit framebuffer, with unbounded completion polling.
#![no_std]

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaConfig {
    /// Physical address of the DMA controller's register block (channel 0).
    #[serde(default = "DmaConfig::default_base")]
    pub base: u32,
    /// Offset of the global `ENABLE` register from [`DmaConfig::base`].
    #[serde(default = "DmaConfig::default_enable_offset")]
    pub enable_offset: u32,
    /// Value OR-ed onto CPU addresses of control blocks to form the bus
    /// address the DMA engine reads them from.
    #[serde(default)]
    pub bus_alias: u32,
    #[serde(default)]
    pub framebuffer: FramebufferConfig,
    #[serde(default)]
    pub wait: WaitPolicy,
    #[serde(default)]
    pub remainder: RemainderRows,
}

/// Geometry of the destination surface written by image transfers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramebufferConfig {
    /// Row width of the framebuffer, in pixels.
    #[serde(default = "FramebufferConfig::default_row_pixels")]
    pub row_pixels: u32,
    #[serde(default = "FramebufferConfig::default_bytes_per_pixel")]
    pub bytes_per_pixel: u32,
}

/// How long to poll a channel's status register for completion.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitPolicy {
    /// Poll until the controller reports completion, however long it takes.
    #[default]
    Spin,
    /// Give up after `max_polls` status reads that still show the channel
    /// as active.
    Bounded { max_polls: u32 },
}

/// What happens to the rows left over when an image's height is not a
/// multiple of the number of channels it is split across.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemainderRows {
    /// Leftover rows are not transferred.
    #[default]
    Drop,
    /// The last band also carries the leftover rows.
    LastBand,
}

impl DmaConfig {
    /// BCM2835 (Raspberry Pi 1, Zero).
    pub const BCM2835: Self = Self::with_base(0x2000_7000);

    /// BCM2836 and BCM2837 (Raspberry Pi 2, 3, Zero 2).
    pub const BCM2836: Self = Self::with_base(0x3F00_7000);

    const fn with_base(base: u32) -> Self {
        Self {
            base,
            enable_offset: Self::default_enable_offset(),
            bus_alias: 0,
            framebuffer: FramebufferConfig::DEFAULT,
            wait: WaitPolicy::Spin,
            remainder: RemainderRows::Drop,
        }
    }

    const fn default_base() -> u32 {
        0x2000_7000
    }

    const fn default_enable_offset() -> u32 {
        0xFF0
    }

    /// Address of the global `ENABLE` register.
    #[must_use]
    pub const fn enable_register(&self) -> u32 {
        self.base + self.enable_offset
    }
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self::BCM2835
    }
}

impl FramebufferConfig {
    pub const DEFAULT: Self = Self {
        row_pixels: Self::default_row_pixels(),
        bytes_per_pixel: Self::default_bytes_per_pixel(),
    };

    const fn default_row_pixels() -> u32 {
        1920
    }

    const fn default_bytes_per_pixel() -> u32 {
        4
    }

    /// Length of one framebuffer row, in bytes.
    #[must_use]
    pub const fn row_bytes(&self) -> u32 {
        self.row_pixels * self.bytes_per_pixel
    }
}

impl Default for FramebufferConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
