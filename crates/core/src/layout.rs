use std::fmt;

/// Shape of one image-like sample: `width x height x channels`.
///
/// A sample is stored as one matrix column. Channels are interleaved and the
/// spatial positions are laid out column-major over `(height, width)`, so the
/// element for pixel `(x, y)` and channel `c` lives at row
/// `(x * height + y) * channels + c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleLayout {
    width: usize,
    height: usize,
    channels: usize,
}

impl SampleLayout {
    pub const fn new(width: usize, height: usize, channels: usize) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Layout assumed for a producer that carries no image information: one
    /// column vector of `rows` elements.
    pub const fn column_vector(rows: usize) -> Self {
        Self::new(1, rows, 1)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Number of spatial positions, `width * height`.
    pub fn spatial_size(&self) -> usize {
        self.width * self.height
    }

    /// Total elements per sample, `width * height * channels`.
    pub fn size(&self) -> usize {
        self.width * self.height * self.channels
    }

    /// Row of element `(x, y, c)` inside a sample column.
    #[inline]
    pub fn offset(&self, x: usize, y: usize, c: usize) -> usize {
        (x * self.height + y) * self.channels + c
    }
}

impl fmt::Display for SampleLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Width:{}, Height:{}, Channels:{}]",
            self.width, self.height, self.channels
        )
    }
}

/// Output extent along one axis for a convolution.
///
/// Without padding the kernel must fit entirely: `(input - kernel) / stride + 1`.
/// With zero padding the kernel is centred on each sampled position, which gives
/// `(input - kernel % 2) / stride + 1`. Callers must ensure `input >= kernel`.
pub fn convolution_output_dim(input: usize, kernel: usize, stride: usize, zero_padding: bool) -> usize {
    if zero_padding {
        (input - kernel % 2) / stride + 1
    } else {
        (input - kernel) / stride + 1
    }
}

/// Output extent along one axis for pooling; windows never leave the input.
pub fn pooling_output_dim(input: usize, window: usize, stride: usize) -> usize {
    (input - window) / stride + 1
}

/// Everything a backend needs to pack, unpack or convolve one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub input: SampleLayout,
    pub output: SampleLayout,
    pub kernel_width: usize,
    pub kernel_height: usize,
    pub horizontal_stride: usize,
    pub vertical_stride: usize,
    pub zero_padding: bool,
}

impl ConvGeometry {
    /// Rows of the packed matrix, which is also the weight matrix column count.
    pub fn packed_rows(&self) -> usize {
        self.kernel_width * self.kernel_height * self.input.channels()
    }

    /// Packed columns contributed by each sample (one per output position).
    pub fn packed_cols_per_sample(&self) -> usize {
        self.output.spatial_size()
    }

    /// Row inside a packed column for kernel offset `(kx, ky)` and channel `c`.
    #[inline]
    pub fn packed_row(&self, kx: usize, ky: usize, c: usize) -> usize {
        (kx * self.kernel_height + ky) * self.input.channels() + c
    }

    /// Top-left input coordinate read by output position `(ox, oy)`; may be
    /// negative when zero padding is enabled.
    #[inline]
    pub fn receptive_origin(&self, ox: usize, oy: usize) -> (isize, isize) {
        let (pad_x, pad_y) = if self.zero_padding {
            (self.kernel_width / 2, self.kernel_height / 2)
        } else {
            (0, 0)
        };
        (
            (ox * self.horizontal_stride) as isize - pad_x as isize,
            (oy * self.vertical_stride) as isize - pad_y as isize,
        )
    }

    /// Input coordinate for kernel offset `(kx, ky)` at output `(ox, oy)`, or
    /// `None` when it falls into the zero-padded border.
    #[inline]
    pub fn input_position(&self, ox: usize, oy: usize, kx: usize, ky: usize) -> Option<(usize, usize)> {
        let (x0, y0) = self.receptive_origin(ox, oy);
        let x = x0 + kx as isize;
        let y = y0 + ky as isize;
        if x < 0 || y < 0 || x >= self.input.width() as isize || y >= self.input.height() as isize {
            None
        } else {
            Some((x as usize, y as usize))
        }
    }
}

/// Parameters of a pooling reduction over one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolGeometry {
    pub input: SampleLayout,
    pub output: SampleLayout,
    pub window_width: usize,
    pub window_height: usize,
    pub horizontal_stride: usize,
    pub vertical_stride: usize,
}

impl PoolGeometry {
    pub fn window_size(&self) -> usize {
        self.window_width * self.window_height
    }

    pub fn input_size_per_sample(&self) -> usize {
        self.input.size()
    }

    pub fn output_size_per_sample(&self) -> usize {
        self.output.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_channel_interleaved() {
        let layout = SampleLayout::new(3, 2, 4);
        assert_eq!(layout.size(), 24);
        assert_eq!(layout.offset(0, 0, 0), 0);
        assert_eq!(layout.offset(0, 0, 3), 3);
        assert_eq!(layout.offset(0, 1, 0), 4);
        assert_eq!(layout.offset(1, 0, 0), 8);
        assert_eq!(layout.offset(2, 1, 3), 23);
    }

    #[test]
    fn output_dims_match_hand_computed_values() {
        // no padding, stride 1
        assert_eq!(convolution_output_dim(28, 5, 1, false), 24);
        // padding with odd kernel keeps the extent
        assert_eq!(convolution_output_dim(28, 5, 1, true), 28);
        // padding with even kernel adds one position
        assert_eq!(convolution_output_dim(4, 2, 1, true), 5);
        // stride > 1
        assert_eq!(convolution_output_dim(7, 3, 2, false), 3);
        assert_eq!(convolution_output_dim(7, 3, 2, true), 4);
        assert_eq!(pooling_output_dim(4, 2, 2), 2);
        assert_eq!(pooling_output_dim(5, 3, 1), 3);
    }

    #[test]
    fn padded_receptive_field_is_centred() {
        let geometry = ConvGeometry {
            input: SampleLayout::new(4, 4, 1),
            output: SampleLayout::new(4, 4, 1),
            kernel_width: 3,
            kernel_height: 3,
            horizontal_stride: 1,
            vertical_stride: 1,
            zero_padding: true,
        };
        assert_eq!(geometry.receptive_origin(0, 0), (-1, -1));
        assert_eq!(geometry.input_position(0, 0, 0, 0), None);
        assert_eq!(geometry.input_position(0, 0, 1, 1), Some((0, 0)));
        assert_eq!(geometry.input_position(3, 3, 2, 2), None);
    }
}
