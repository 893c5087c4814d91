//! DMA [`ControlBlock`]s describe a single transfer to a DMA channel.
// Unusual groupings are used in binary literals in this file in order to
// separate the bits by which field they represent, rather than by their byte.
#![allow(clippy::unusual_byte_groupings)]

use mycelium_bitfield::bitfield;

use self::errors::*;

/// A DMA control block, laid out exactly as the controller reads it from
/// memory.
///
/// The controller fetches control blocks from 256-byte aligned addresses,
/// which the type's alignment guarantees wherever one is placed.
#[derive(Clone, Debug)]
#[repr(C, align(256))]
pub struct ControlBlock {
    transfer_info: TransferInfo,
    source_address: u32,
    destination_address: u32,
    transfer_length: u32,
    stride: u32,
    next_control_block: u32,
    _reserved: [u32; 2],
}

/// A builder for constructing DMA [`ControlBlock`]s.
#[derive(Copy, Clone, Debug)]
#[must_use = "a `ControlBlockBuilder` does nothing unless one of its `build` methods is called"]
pub struct ControlBlockBuilder {
    ti: TransferInfo,
    source: u32,
    dest: u32,
}

/// The shape of a 2D transfer: `rows` rows of `row_bytes` bytes each.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RowShape {
    row_bytes: u16,
    rows: u16,
}

/// Byte gaps applied after each row of a 2D transfer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stride {
    source: i16,
    dest: i16,
}

bitfield! {
    /// The `TI` (transfer information) word of a control block.
    #[derive(PartialEq, Eq)]
    pub struct TransferInfo<u32> {
        /// `INTEN`: raise an interrupt when this block completes.
        pub const INTEN: bool;

        /// `TDMODE`: treat `TXFR_LEN` as `YLENGTH` rows of `XLENGTH` bytes,
        /// applying `STRIDE` after each row.
        pub const TDMODE: bool;

        const _RESERVED_0 = 1;

        /// `WAIT_RESP`: wait for an AXI write response before the next write.
        pub const WAIT_RESP: bool;

        /// `DEST_INC`: increment the destination address after each write.
        pub const DEST_INC: bool;

        /// `DEST_WIDTH`: use 128-bit destination writes.
        pub const DEST_WIDTH: bool;

        /// `DEST_DREQ`: gate destination writes on the peripheral's DREQ.
        pub const DEST_DREQ: bool;

        /// `DEST_IGNORE`: do not perform destination writes.
        pub const DEST_IGNORE: bool;

        /// `SRC_INC`: increment the source address after each read.
        pub const SRC_INC: bool;

        /// `SRC_WIDTH`: use 128-bit source reads.
        pub const SRC_WIDTH: bool;

        /// `SRC_DREQ`: gate source reads on the peripheral's DREQ.
        pub const SRC_DREQ: bool;

        /// `SRC_IGNORE`: do not perform source reads.
        pub const SRC_IGNORE: bool;

        /// `BURST_LENGTH`: number of words in a burst, minus one.
        pub const BURST_LENGTH = 4;

        /// `PERMAP`: peripheral whose DREQ paces the transfer. Zero is
        /// un-paced.
        pub const PERMAP = 5;

        /// `WAITS`: dummy cycles added after each read or write.
        pub const WAITS = 5;

        /// `NO_WIDE_BURSTS`: prevent two-beat 128-bit bursts.
        pub const NO_WIDE_BURSTS: bool;
    }
}

bitfield! {
    /// The `TXFR_LEN` word of a control block in 2D mode.
    #[derive(PartialEq, Eq)]
    pub struct TransferLength<u32> {
        /// `XLENGTH`: bytes per row.
        pub const XLENGTH = 16;

        /// `YLENGTH`: number of rows.
        pub const YLENGTH = 14;
    }
}

bitfield! {
    /// The `STRIDE` word of a control block. Both halves are signed 16-bit
    /// byte counts.
    #[derive(PartialEq, Eq)]
    pub struct StrideBits<u32> {
        /// `S_STRIDE`: bytes added to the source address after each row.
        pub const S_STRIDE = 16;

        /// `D_STRIDE`: bytes added to the destination address after each row.
        pub const D_STRIDE = 16;
    }
}

// === impl ControlBlock ===

impl ControlBlock {
    /// A control block with every word zeroed.
    pub const ZEROED: Self = Self {
        transfer_info: TransferInfo::new(),
        source_address: 0,
        destination_address: 0,
        transfer_length: 0,
        stride: 0,
        next_control_block: 0,
        _reserved: [0; 2],
    };

    /// Longest linear transfer, in bytes. `TXFR_LEN` is 30 bits wide.
    pub const MAX_LEN: u32 = (1 << 30) - 1;

    /// Widest row of a 2D transfer, in bytes.
    pub const MAX_ROW_BYTES: u32 = 0xFFFF;

    /// Most rows in a 2D transfer.
    pub const MAX_ROWS: u32 = 0x3FFF;

    pub const fn builder() -> ControlBlockBuilder {
        ControlBlockBuilder::new()
    }

    #[must_use]
    pub fn transfer_info(&self) -> TransferInfo {
        self.transfer_info
    }

    #[must_use]
    pub fn source_address(&self) -> u32 {
        self.source_address
    }

    #[must_use]
    pub fn destination_address(&self) -> u32 {
        self.destination_address
    }

    /// The raw `TXFR_LEN` word.
    #[must_use]
    pub fn transfer_length(&self) -> u32 {
        self.transfer_length
    }

    /// The raw `STRIDE` word.
    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Bus address of the next block in a chain. Always zero, since blocks
    /// built here are never chained.
    #[must_use]
    pub fn next_control_block(&self) -> u32 {
        self.next_control_block
    }

    /// Returns `true` if this block describes a 2D transfer.
    #[must_use]
    pub fn is_2d(&self) -> bool {
        self.transfer_info.get(TransferInfo::TDMODE)
    }
}

// === impl ControlBlockBuilder ===

impl Default for ControlBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlBlockBuilder {
    pub const fn new() -> Self {
        Self {
            ti: TransferInfo::new(),
            source: 0,
            dest: 0,
        }
    }

    pub fn src_inc(self, inc: bool) -> Self {
        Self {
            ti: self.ti.with(TransferInfo::SRC_INC, inc),
            ..self
        }
    }

    pub fn dest_inc(self, inc: bool) -> Self {
        Self {
            ti: self.ti.with(TransferInfo::DEST_INC, inc),
            ..self
        }
    }

    /// Sets the bus address bytes are read from.
    pub fn source(self, source: u32) -> Self {
        Self { source, ..self }
    }

    /// Sets the bus address bytes are written to.
    pub fn dest(self, dest: u32) -> Self {
        Self { dest, ..self }
    }

    /// Builds a linear transfer of `len` bytes.
    ///
    /// # Returns
    ///
    /// - [`Ok`]`(`[`ControlBlock`]`)` if `len` fits in `TXFR_LEN`.
    /// - [`Err`]`(`[`InvalidControlBlock::LengthTooLong`]`)` if `len` is
    ///   greater than [`ControlBlock::MAX_LEN`].
    pub fn build_linear(self, len: u32) -> Result<ControlBlock, InvalidControlBlock> {
        if len > ControlBlock::MAX_LEN {
            return Err(InvalidControlBlock::LengthTooLong(len));
        }

        Ok(self.build_inner(self.ti.with(TransferInfo::TDMODE, false), len, 0))
    }

    /// Builds a 2D transfer of `shape`, skipping `stride` bytes after each
    /// row. Both arguments were range-checked when they were constructed, so
    /// this cannot fail.
    pub fn build_2d(self, shape: RowShape, stride: Stride) -> ControlBlock {
        let len = TransferLength::new()
            .with(TransferLength::XLENGTH, u32::from(shape.row_bytes))
            .with(TransferLength::YLENGTH, u32::from(shape.rows));
        let stride = StrideBits::new()
            .with(StrideBits::S_STRIDE, u32::from(stride.source as u16))
            .with(StrideBits::D_STRIDE, u32::from(stride.dest as u16));

        self.build_inner(
            self.ti.with(TransferInfo::TDMODE, true),
            len.bits(),
            stride.bits(),
        )
    }

    #[inline]
    fn build_inner(self, ti: TransferInfo, transfer_length: u32, stride: u32) -> ControlBlock {
        ControlBlock {
            transfer_info: ti,
            source_address: self.source,
            destination_address: self.dest,
            transfer_length,
            stride,
            next_control_block: 0,
            _reserved: [0; 2],
        }
    }
}

// === impl RowShape ===

impl RowShape {
    /// # Returns
    ///
    /// - [`Ok`]`(`[`RowShape`]`)` if both dimensions fit in `TXFR_LEN`.
    /// - [`Err`]`(`[`InvalidControlBlock::RowTooWide`]`)` if `row_bytes` is
    ///   greater than [`ControlBlock::MAX_ROW_BYTES`].
    /// - [`Err`]`(`[`InvalidControlBlock::TooManyRows`]`)` if `rows` is
    ///   greater than [`ControlBlock::MAX_ROWS`].
    pub fn new(row_bytes: u32, rows: u32) -> Result<Self, InvalidControlBlock> {
        if row_bytes > ControlBlock::MAX_ROW_BYTES {
            return Err(InvalidControlBlock::RowTooWide(row_bytes));
        }
        if rows > ControlBlock::MAX_ROWS {
            return Err(InvalidControlBlock::TooManyRows(rows));
        }
        Ok(Self {
            row_bytes: row_bytes as u16,
            rows: rows as u16,
        })
    }

    #[must_use]
    pub fn row_bytes(&self) -> u32 {
        self.row_bytes.into()
    }

    #[must_use]
    pub fn rows(&self) -> u32 {
        self.rows.into()
    }
}

// === impl Stride ===

impl Stride {
    pub fn new(source: i32, dest: i32) -> Result<Self, InvalidControlBlock> {
        let source =
            i16::try_from(source).map_err(|_| InvalidControlBlock::StrideOutOfRange(source))?;
        let dest = i16::try_from(dest).map_err(|_| InvalidControlBlock::StrideOutOfRange(dest))?;
        Ok(Self { source, dest })
    }

    /// A stride which only skips bytes on the destination side.
    pub fn dest(dest: i32) -> Result<Self, InvalidControlBlock> {
        Self::new(0, dest)
    }
}

pub mod errors {
    use core::fmt;

    use super::*;

    /// Errors returned when a transfer cannot be described by a
    /// [`ControlBlock`].
    #[derive(Clone, Debug, Eq, PartialEq)]
    #[non_exhaustive]
    pub enum InvalidControlBlock {
        /// A linear transfer was longer than [`ControlBlock::MAX_LEN`].
        LengthTooLong(u32),
        /// A row was wider than [`ControlBlock::MAX_ROW_BYTES`].
        RowTooWide(u32),
        /// A 2D transfer had more than [`ControlBlock::MAX_ROWS`] rows.
        TooManyRows(u32),
        /// A stride did not fit in a signed 16-bit field.
        StrideOutOfRange(i32),
        /// An image would extend past the right edge of the framebuffer.
        WidthExceedsFrame { width: u32, row_pixels: u32 },
        /// An image was placed at a negative coordinate.
        NegativeOrigin { x: i32, y: i32 },
        /// A computed source or destination address did not fit in 32 bits.
        AddressOverflow,
    }

    impl fmt::Display for InvalidControlBlock {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::LengthTooLong(len) => write!(
                    f,
                    "length {len} is greater than `ControlBlock::MAX_LEN` ({})",
                    ControlBlock::MAX_LEN
                ),
                Self::RowTooWide(bytes) => write!(
                    f,
                    "row of {bytes} bytes is wider than `ControlBlock::MAX_ROW_BYTES` ({})",
                    ControlBlock::MAX_ROW_BYTES
                ),
                Self::TooManyRows(rows) => write!(
                    f,
                    "{rows} rows is more than `ControlBlock::MAX_ROWS` ({})",
                    ControlBlock::MAX_ROWS
                ),
                Self::StrideOutOfRange(stride) => {
                    write!(f, "stride {stride} does not fit in 16 signed bits")
                }
                Self::WidthExceedsFrame { width, row_pixels } => write!(
                    f,
                    "image extends to column {width}, but framebuffer rows are {row_pixels} pixels wide"
                ),
                Self::NegativeOrigin { x, y } => {
                    write!(f, "image origin ({x}, {y}) is outside the framebuffer")
                }
                Self::AddressOverflow => f.write_str("transfer address does not fit in 32 bits"),
            }
        }
    }
}
