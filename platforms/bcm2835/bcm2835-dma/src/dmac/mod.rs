//! Higher-level APIs for the BCM2835 DMA controller.
#![warn(missing_docs)]
use core::{
    fmt,
    ops::BitOr,
    sync::atomic::{fence, Ordering},
};

use bcm2835_config::{DmaConfig, RemainderRows, WaitPolicy};
use embedded_graphics::geometry::{Point, Size};
use mycelium_bitfield::bitfield;

use crate::mmio::RegisterPort;

use self::{
    control_block::{ControlBlock, ControlBlockBuilder},
    errors::DmaError,
    frame::FrameGeometry,
};

pub mod control_block;
pub mod frame;

/// The number of channels whose register blocks are laid out at
/// `base + index * 0x100`.
pub const CHANNEL_COUNT: u8 = 15;

/// A handle to the DMA controller.
///
/// A `Dmac` performs synchronous transfers: every transfer method publishes
/// its control block(s), starts the channel(s), and polls until the
/// controller reports completion before returning. Control blocks live on
/// the stack of the method that issued them, so nothing outlives a call.
///
/// Channels are not claimed or tracked. Callers must not start a transfer
/// on a channel that another transfer is still using.
pub struct Dmac<P> {
    port: P,
    base: u32,
    enable: u32,
    frame: FrameGeometry,
    wait: WaitPolicy,
    remainder: RemainderRows,
}

/// A DMA channel index, from 0 to 14.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Channel(u8);

/// A set of channel bits for the controller's global `ENABLE` register.
///
/// The mask is written verbatim, so bits beyond channel 14 reach the
/// hardware unchanged.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ChannelMask(u32);

bitfield! {
    /// A channel's `CS` (control and status) register.
    #[derive(PartialEq, Eq)]
    pub struct Cs<u32> {
        /// `ACTIVE`: the channel is running. Cleared by the controller once
        /// it loads a zero `NEXTCONBK` at the end of the last block.
        pub const ACTIVE: bool;

        /// `END`: the current block finished. Write 1 to clear.
        pub const END: bool;

        /// `INT`: interrupt status. Write 1 to clear.
        pub const INT: bool;

        /// `DREQ`: state of the selected DREQ signal.
        pub const DREQ: bool;

        /// `PAUSED`: the channel is paused.
        pub const PAUSED: bool;

        /// `DREQ_STOPS_DMA`: the channel is paused by an inactive DREQ.
        pub const DREQ_STOPS_DMA: bool;

        /// `WAITING_FOR_OUTSTANDING_WRITES`
        pub const WAITING_FOR_OUTSTANDING_WRITES: bool;

        const _RESERVED_0 = 1;

        /// `ERROR`: the channel has an error flag set in its `DEBUG`
        /// register.
        pub const ERROR: bool;

        const _RESERVED_1 = 7;

        /// `PRIORITY`: AXI priority of normal transactions.
        pub const PRIORITY = 4;

        /// `PANIC_PRIORITY`: AXI priority of panicking transactions.
        pub const PANIC_PRIORITY = 4;

        const _RESERVED_2 = 4;

        /// `WAIT_FOR_OUTSTANDING_WRITES`: hold `END` until every write is
        /// acknowledged.
        pub const WAIT_FOR_OUTSTANDING_WRITES: bool;

        /// `DISDEBUG`: ignore the debug pause signal.
        pub const DISDEBUG: bool;

        /// `ABORT`: abort the current block. Self-clearing.
        pub const ABORT: bool;

        /// `RESET`: reset the channel. Self-clearing.
        pub const RESET: bool;
    }
}

/// Offset of a channel's `CS` register within its register block.
const CS: u32 = 0x00;
/// Offset of a channel's `CONBLK_AD` register within its register block.
const CONBLK_AD: u32 = 0x04;
/// Distance between consecutive channels' register blocks.
const CHANNEL_STRIDE: u32 = 0x100;

// === impl Dmac ===

impl<P: RegisterPort> Dmac<P> {
    /// Returns a `Dmac` that accesses the controller described by `config`
    /// through `port`.
    ///
    /// This performs no register access. Channels must be switched on with
    /// [`Dmac::enable_channels`] before use, unless the firmware has already
    /// done so.
    #[must_use]
    pub fn new(port: P, config: &DmaConfig) -> Self {
        Self {
            port,
            base: config.base,
            enable: config.enable_register(),
            frame: FrameGeometry::new(&config.framebuffer),
            wait: config.wait,
            remainder: config.remainder,
        }
    }

    /// Returns the geometry of the framebuffer that image transfers write
    /// to.
    #[must_use]
    pub fn frame(&self) -> &FrameGeometry {
        &self.frame
    }

    /// Writes `mask` to the controller's global `ENABLE` register.
    ///
    /// This affects every channel: channels whose bits are clear are
    /// switched off, even if they were in use.
    pub fn enable_channels(&self, mask: impl Into<ChannelMask>) {
        let mask = mask.into();
        tracing::debug!(mask = ?format_args!("{:#06x}", mask.bits()), "enabling DMA channels");
        self.port.write32(self.enable, mask.bits());
    }

    /// Copies `len` bytes from `source` to `dest` on `channel`, returning
    /// once the transfer has completed.
    ///
    /// # Returns
    ///
    /// - [`Ok`]`(())` once the controller reports the transfer complete.
    /// - [`Err`]`(`[`DmaError::InvalidChannel`]`)` if `channel` is not a
    ///   valid channel index. No registers are touched.
    /// - [`Err`]`(`[`DmaError::ControlBlock`]`)` if `len` is too long for a
    ///   single control block. No registers are touched.
    /// - [`Err`]`(`[`DmaError::Timeout`]`)` or
    ///   [`Err`]`(`[`DmaError::Bus`]`)` if the transfer failed to complete.
    pub fn transfer(&self, source: u32, dest: u32, len: u32, channel: u8) -> Result<(), DmaError> {
        let channel = Channel::try_from(channel)?;
        let block = ControlBlockBuilder::new()
            .src_inc(true)
            .dest_inc(true)
            .source(source)
            .dest(dest)
            .build_linear(len)?;

        tracing::debug!(
            channel = channel.index(),
            source = ?format_args!("{source:#010x}"),
            dest = ?format_args!("{dest:#010x}"),
            len,
            "starting linear DMA transfer",
        );
        self.run(channel, &block)
    }

    /// Copies a tightly packed image of `size` pixels at `source` into the
    /// framebuffer location `dest` with a single 2D transfer on `channel`,
    /// returning once the transfer has completed.
    ///
    /// The image must be no wider than the framebuffer; rows past the
    /// image's width are left untouched.
    pub fn blit_image(&self, source: u32, dest: u32, size: Size, channel: u8) -> Result<(), DmaError> {
        let channel = Channel::try_from(channel)?;
        let block = self.frame.image_block(source, dest, size)?;

        tracing::debug!(
            channel = channel.index(),
            source = ?format_args!("{source:#010x}"),
            dest = ?format_args!("{dest:#010x}"),
            width = size.width,
            height = size.height,
            "starting 2D DMA transfer",
        );
        self.run(channel, &block)
    }

    /// Like [`Dmac::blit_image`], but places the image's top-left corner at
    /// pixel `origin` of the framebuffer that starts at `frame`.
    pub fn blit_image_at(
        &self,
        source: u32,
        frame: u32,
        origin: Point,
        size: Size,
        channel: u8,
    ) -> Result<(), DmaError> {
        let channel = Channel::try_from(channel)?;
        let block = self
            .frame
            .placed_image_block(source, frame, origin, size)?;

        tracing::debug!(
            channel = channel.index(),
            source = ?format_args!("{source:#010x}"),
            dest = ?format_args!("{:#010x}", block.destination_address()),
            x = origin.x,
            y = origin.y,
            width = size.width,
            height = size.height,
            "starting 2D DMA transfer",
        );
        self.run(channel, &block)
    }

    /// Copies an image of `size` pixels into the framebuffer at `dest`,
    /// split into `channels` horizontal bands that are copied in parallel
    /// on channels `0..channels`.
    ///
    /// Every band is started before any is waited on. The bands are then
    /// awaited in channel order; channels may finish in any order.
    ///
    /// Each band is `size.height / channels` rows. Rows left over when the
    /// height is not a multiple of `channels` are handled according to the
    /// configured [`RemainderRows`] policy; by default they are not copied.
    ///
    /// # Returns
    ///
    /// - [`Ok`]`(())` once every band has completed.
    /// - [`Err`]`(`[`DmaError::InvalidChannelCount`]`)` if `channels` is not
    ///   between 1 and [`CHANNEL_COUNT`]. No registers are touched.
    /// - [`Err`]`(`[`DmaError::ControlBlock`]`)` if any band cannot be
    ///   described by a control block. No registers are touched.
    /// - Otherwise, the first error reported by a channel. Every channel is
    ///   still waited on (and reset, if it failed) before returning.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn blit_image_parallel(
        &self,
        source: u32,
        dest: u32,
        size: Size,
        channels: u8,
    ) -> Result<(), DmaError> {
        if !(1..=CHANNEL_COUNT).contains(&channels) {
            return Err(DmaError::InvalidChannelCount(channels));
        }

        let mut blocks = [ControlBlock::ZEROED; CHANNEL_COUNT as usize];
        let blocks = &mut blocks[..usize::from(channels)];
        for band in FrameGeometry::bands(size.height, channels, self.remainder) {
            blocks[usize::from(band.index)] = self.frame.band_block(source, dest, size, band)?;
        }

        // start every band back-to-back, so the channels overlap as much as
        // possible.
        critical_section::with(|_cs| {
            for (idx, block) in (0..channels).zip(blocks.iter()) {
                unsafe {
                    // Safety: `blocks` is not dropped until every channel has
                    // been waited on below.
                    self.start(Channel(idx), block);
                }
            }
        });

        let mut result = Ok(());
        for idx in 0..channels {
            if let Err(error) = self.wait(Channel(idx)) {
                result = result.and(Err(error));
            }
        }
        result
    }

    /// Returns `true` if `channel` is not running a transfer.
    #[must_use]
    pub fn is_complete(&self, channel: Channel) -> bool {
        self.status(channel).is_complete()
    }

    /// Resets `channel`, stopping any transfer in progress on it.
    pub fn reset(&self, channel: Channel) {
        tracing::trace!(channel = channel.index(), "resetting DMA channel");
        self.port
            .write32(self.register(channel, CS), Cs::new().with(Cs::RESET, true).bits());
    }

    fn run(&self, channel: Channel, block: &ControlBlock) -> Result<(), DmaError> {
        unsafe {
            // Safety: `wait` does not return until the controller is done
            // with `block`, or the channel has been reset.
            self.start(channel, block);
        }
        self.wait(channel)
    }

    /// Publishes `block` on `channel` and starts the channel.
    ///
    /// # Safety
    ///
    /// `block` must not be moved or dropped until the transfer has
    /// completed or the channel has been reset.
    unsafe fn start(&self, channel: Channel, block: &ControlBlock) {
        fence(Ordering::SeqCst);

        let addr = self.port.bus_address(block);
        tracing::trace!(
            channel = channel.index(),
            control_block = ?format_args!("{addr:#010x}"),
            "publishing control block",
        );
        self.port.write32(self.register(channel, CONBLK_AD), addr);
        // setting `END` clears any completion flag left over from the
        // previous transfer.
        self.port.write32(self.register(channel, CS), Cs::activate().bits());

        fence(Ordering::SeqCst);
    }

    /// Polls `channel` until it completes, fails, or runs out of polls.
    fn wait(&self, channel: Channel) -> Result<(), DmaError> {
        let mut polls: u32 = 0;
        loop {
            let status = self.status(channel);
            if status.get(Cs::ERROR) {
                tracing::error!(
                    channel = channel.index(),
                    status = ?format_args!("{:#010x}", status.bits()),
                    "DMA channel reported an error",
                );
                self.reset(channel);
                return Err(DmaError::Bus {
                    channel: channel.index(),
                    status: status.bits(),
                });
            }

            if status.is_complete() {
                fence(Ordering::SeqCst);
                return Ok(());
            }

            polls = polls.saturating_add(1);
            if let WaitPolicy::Bounded { max_polls } = self.wait {
                if polls >= max_polls {
                    tracing::warn!(
                        channel = channel.index(),
                        polls,
                        status = ?format_args!("{:#010x}", status.bits()),
                        "DMA transfer timed out",
                    );
                    self.reset(channel);
                    return Err(DmaError::Timeout {
                        channel: channel.index(),
                        status: status.bits(),
                    });
                }
            }
            core::hint::spin_loop();
        }
    }

    #[inline]
    fn status(&self, channel: Channel) -> Cs {
        Cs::from_bits(self.port.read32(self.register(channel, CS)))
    }

    #[inline]
    fn register(&self, channel: Channel, offset: u32) -> u32 {
        self.base + u32::from(channel.0) * CHANNEL_STRIDE + offset
    }
}

impl<P> fmt::Debug for Dmac<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dmac")
            .field("base", &format_args!("{:#010x}", self.base))
            .field("frame", &self.frame)
            .field("wait", &self.wait)
            .field("remainder", &self.remainder)
            .finish_non_exhaustive()
    }
}

// === impl Channel ===

impl Channel {
    /// Returns the channel with index `idx`, if there is one.
    #[must_use]
    pub const fn new(idx: u8) -> Option<Self> {
        if idx < CHANNEL_COUNT {
            Some(Self(idx))
        } else {
            None
        }
    }

    /// Returns the index of this channel, from 0 to 14.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u8 {
        self.0
    }

    /// Returns the `ENABLE` mask containing only this channel.
    #[inline]
    #[must_use]
    pub const fn mask(self) -> ChannelMask {
        ChannelMask(1 << self.0)
    }
}

impl TryFrom<u8> for Channel {
    type Error = DmaError;

    fn try_from(idx: u8) -> Result<Self, DmaError> {
        Self::new(idx).ok_or(DmaError::InvalidChannel(idx))
    }
}

// === impl ChannelMask ===

impl ChannelMask {
    /// Every channel in [`Channel`]'s range.
    pub const ALL: Self = Self::first(CHANNEL_COUNT);

    /// Returns a mask with exactly the bits of `bits` set.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns a mask containing channels `0..count`.
    #[must_use]
    pub const fn first(count: u8) -> Self {
        if count >= 32 {
            Self(u32::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if `channel`'s bit is set.
    #[must_use]
    pub const fn contains(self, channel: Channel) -> bool {
        self.0 & (1 << channel.0) != 0
    }
}

impl From<u32> for ChannelMask {
    fn from(bits: u32) -> Self {
        Self::from_bits(bits)
    }
}

impl From<Channel> for ChannelMask {
    fn from(channel: Channel) -> Self {
        channel.mask()
    }
}

impl<M: Into<ChannelMask>> BitOr<M> for ChannelMask {
    type Output = Self;

    fn bitor(self, rhs: M) -> Self {
        Self(self.0 | rhs.into().0)
    }
}

// === impl Cs ===

impl Cs {
    /// The value written to start a channel: `ACTIVE`, plus `END` to clear
    /// the previous transfer's completion flag.
    #[must_use]
    pub fn activate() -> Self {
        Self::new().with(Self::ACTIVE, true).with(Self::END, true)
    }

    /// Returns `true` if the channel described by this status has finished
    /// its transfer, or was never started.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.get(Self::ACTIVE)
    }
}

pub mod errors {
    //! Errors returned by [`Dmac`](super::Dmac) transfers.
    use core::fmt;

    pub use super::control_block::errors::InvalidControlBlock;

    /// Errors returned by [`Dmac`](super::Dmac) transfers.
    #[derive(Clone, Debug, Eq, PartialEq)]
    #[non_exhaustive]
    pub enum DmaError {
        /// The channel index was not less than
        /// [`CHANNEL_COUNT`](super::CHANNEL_COUNT).
        InvalidChannel(u8),
        /// A parallel transfer asked for zero channels, or more channels than
        /// exist.
        InvalidChannelCount(u8),
        /// The transfer could not be described by a control block.
        ControlBlock(InvalidControlBlock),
        /// The channel was still active after the configured number of
        /// polls. The channel has been reset.
        Timeout {
            /// The channel that timed out.
            channel: u8,
            /// The last value read from the channel's `CS` register.
            status: u32,
        },
        /// The channel reported an error. The channel has been reset.
        Bus {
            /// The channel that failed.
            channel: u8,
            /// The value read from the channel's `CS` register.
            status: u32,
        },
    }

    impl From<InvalidControlBlock> for DmaError {
        fn from(error: InvalidControlBlock) -> Self {
            Self::ControlBlock(error)
        }
    }

    impl fmt::Display for DmaError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::InvalidChannel(idx) => write!(
                    f,
                    "DMA channel {idx} does not exist (there are {} channels)",
                    super::CHANNEL_COUNT
                ),
                Self::InvalidChannelCount(count) => write!(
                    f,
                    "cannot split a transfer across {count} channels (must be 1 to {})",
                    super::CHANNEL_COUNT
                ),
                Self::ControlBlock(error) => fmt::Display::fmt(error, f),
                Self::Timeout { channel, status } => write!(
                    f,
                    "DMA channel {channel} did not complete (CS = {status:#010x})"
                ),
                Self::Bus { channel, status } => {
                    write!(f, "DMA channel {channel} reported an error (CS = {status:#010x})")
                }
            }
        }
    }
}
