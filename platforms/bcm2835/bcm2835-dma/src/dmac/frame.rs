//! Framebuffer geometry, and the control blocks that copy images into a
//! framebuffer.
use bcm2835_config::{FramebufferConfig, RemainderRows};
use embedded_graphics::geometry::{Point, Size};

use super::control_block::{errors::InvalidControlBlock, ControlBlock, RowShape, Stride};

/// The shape of the destination surface that images are copied into.
///
/// Source images are tightly packed, with the same pixel size as the
/// framebuffer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameGeometry {
    row_pixels: u32,
    bytes_per_pixel: u32,
}

/// A horizontal band of an image, copied by one channel of a parallel blit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Band {
    /// Index of the band, which is also the channel that copies it.
    pub index: u8,
    /// First image row in the band.
    pub first_row: u32,
    /// Number of rows in the band. May be zero.
    pub rows: u32,
}

/// Iterator returned by [`FrameGeometry::bands`].
#[derive(Clone, Debug)]
pub struct Bands {
    next: u8,
    count: u8,
    section: u32,
    last_rows: u32,
}

// === impl FrameGeometry ===

impl FrameGeometry {
    #[must_use]
    pub const fn new(config: &FramebufferConfig) -> Self {
        Self {
            row_pixels: config.row_pixels,
            bytes_per_pixel: config.bytes_per_pixel,
        }
    }

    #[must_use]
    pub const fn row_pixels(&self) -> u32 {
        self.row_pixels
    }

    #[must_use]
    pub const fn bytes_per_pixel(&self) -> u32 {
        self.bytes_per_pixel
    }

    /// Length of one framebuffer row, in bytes.
    #[must_use]
    pub const fn row_bytes(&self) -> u32 {
        self.row_pixels * self.bytes_per_pixel
    }

    /// Returns the byte offset of the pixel at `point` from the start of the
    /// framebuffer, or [`None`] if `point` lies outside its rows.
    #[must_use]
    pub fn offset(&self, point: Point) -> Option<u32> {
        let x = u32::try_from(point.x).ok()?;
        let y = u32::try_from(point.y).ok()?;
        if x >= self.row_pixels {
            return None;
        }
        y.checked_mul(self.row_pixels)?
            .checked_add(x)?
            .checked_mul(self.bytes_per_pixel)
    }

    /// Builds a 2D control block copying a tightly packed `size` image at
    /// `source` to the framebuffer location `dest`.
    ///
    /// Each row of the image is `size.width * bytes_per_pixel` bytes. After
    /// each row, the destination skips the rest of the framebuffer row.
    pub fn image_block(
        &self,
        source: u32,
        dest: u32,
        size: Size,
    ) -> Result<ControlBlock, InvalidControlBlock> {
        if size.width > self.row_pixels {
            return Err(InvalidControlBlock::WidthExceedsFrame {
                width: size.width,
                row_pixels: self.row_pixels,
            });
        }

        let row_bytes = size.width.saturating_mul(self.bytes_per_pixel);
        let shape = RowShape::new(row_bytes, size.height)?;
        let gap = (self.row_pixels - size.width).saturating_mul(self.bytes_per_pixel);
        let stride = Stride::dest(i32::try_from(gap).unwrap_or(i32::MAX))?;

        Ok(ControlBlock::builder()
            .src_inc(true)
            .dest_inc(true)
            .source(source)
            .dest(dest)
            .build_2d(shape, stride))
    }

    /// Like [`FrameGeometry::image_block`], but places the image with its
    /// top-left corner at `origin` in the framebuffer starting at `frame`.
    pub fn placed_image_block(
        &self,
        source: u32,
        frame: u32,
        origin: Point,
        size: Size,
    ) -> Result<ControlBlock, InvalidControlBlock> {
        let negative = InvalidControlBlock::NegativeOrigin {
            x: origin.x,
            y: origin.y,
        };
        let x = u32::try_from(origin.x).map_err(|_| negative.clone())?;
        let right = x.saturating_add(size.width);
        if right > self.row_pixels {
            return Err(InvalidControlBlock::WidthExceedsFrame {
                width: right,
                row_pixels: self.row_pixels,
            });
        }

        let offset = self.offset(origin).ok_or(negative)?;
        let dest = frame
            .checked_add(offset)
            .ok_or(InvalidControlBlock::AddressOverflow)?;
        self.image_block(source, dest, size)
    }

    /// Builds the control block for one band of an image of `size` pixels,
    /// split by rows.
    pub fn band_block(
        &self,
        source: u32,
        dest: u32,
        size: Size,
        band: Band,
    ) -> Result<ControlBlock, InvalidControlBlock> {
        let source_offset = band
            .first_row
            .checked_mul(size.width)
            .and_then(|px| px.checked_mul(self.bytes_per_pixel))
            .and_then(|offset| source.checked_add(offset))
            .ok_or(InvalidControlBlock::AddressOverflow)?;
        let dest_offset = band
            .first_row
            .checked_mul(self.row_bytes())
            .and_then(|offset| dest.checked_add(offset))
            .ok_or(InvalidControlBlock::AddressOverflow)?;

        self.image_block(
            source_offset,
            dest_offset,
            Size::new(size.width, band.rows),
        )
    }

    /// Splits `height` rows into `count` horizontal bands of
    /// `height / count` rows each.
    ///
    /// When `height` is not a multiple of `count`, `remainder` decides
    /// whether the leftover rows are dropped or added to the last band.
    ///
    /// # Panics
    ///
    /// If `count` is zero.
    pub fn bands(height: u32, count: u8, remainder: RemainderRows) -> Bands {
        assert!(count > 0, "an image must be split into at least one band");
        let section = height / u32::from(count);
        let last_rows = match remainder {
            RemainderRows::Drop => section,
            RemainderRows::LastBand => section + height % u32::from(count),
        };
        Bands {
            next: 0,
            count,
            section,
            last_rows,
        }
    }
}

impl From<&FramebufferConfig> for FrameGeometry {
    fn from(config: &FramebufferConfig) -> Self {
        Self::new(config)
    }
}

// === impl Bands ===

impl Iterator for Bands {
    type Item = Band;

    fn next(&mut self) -> Option<Band> {
        if self.next >= self.count {
            return None;
        }
        let index = self.next;
        self.next += 1;
        let rows = if self.next == self.count {
            self.last_rows
        } else {
            self.section
        };
        Some(Band {
            index,
            first_row: u32::from(index) * self.section,
            rows,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::from(self.count - self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Bands {}
