use crate::layout::ConvGeometry;

/// Unroll every receptive field of `batch` samples into one column of `packed`.
///
/// `input` holds `batch` sample columns of `geometry.input.size()` rows.
/// `packed` is column-major `packed_rows x (packed_cols_per_sample * batch)`;
/// column `s * S + ox * out_h + oy` receives the field read by output position
/// `(ox, oy)` of sample `s`. Positions in the padded border are written as zero.
pub fn pack_convolution_input(input: &[f32], packed: &mut [f32], geometry: &ConvGeometry, batch: usize) {
    let in_layout = geometry.input;
    let out_layout = geometry.output;
    let channels = in_layout.channels();
    let in_size = in_layout.size();
    let rows = geometry.packed_rows();
    let cols_per_sample = geometry.packed_cols_per_sample();

    debug_assert!(input.len() >= in_size * batch);
    debug_assert!(packed.len() >= rows * cols_per_sample * batch);

    for s in 0..batch {
        let sample = &input[s * in_size..(s + 1) * in_size];
        for ox in 0..out_layout.width() {
            for oy in 0..out_layout.height() {
                let col = s * cols_per_sample + ox * out_layout.height() + oy;
                let column = &mut packed[col * rows..(col + 1) * rows];
                for kx in 0..geometry.kernel_width {
                    for ky in 0..geometry.kernel_height {
                        let row = geometry.packed_row(kx, ky, 0);
                        let dst = &mut column[row..row + channels];
                        match geometry.input_position(ox, oy, kx, ky) {
                            Some((x, y)) => {
                                let src = in_layout.offset(x, y, 0);
                                dst.copy_from_slice(&sample[src..src + channels]);
                            }
                            None => dst.fill(0.0),
                        }
                    }
                }
            }
        }
    }
}

/// Scatter packed columns back onto their receptive fields, adding into
/// `input_grad`.
///
/// This is the adjoint of [`pack_convolution_input`]: overlapping fields (stride
/// smaller than the kernel) accumulate, and padded positions are dropped.
pub fn unpack_convolution_input(packed: &[f32], input_grad: &mut [f32], geometry: &ConvGeometry, batch: usize) {
    let in_layout = geometry.input;
    let out_layout = geometry.output;
    let channels = in_layout.channels();
    let in_size = in_layout.size();
    let rows = geometry.packed_rows();
    let cols_per_sample = geometry.packed_cols_per_sample();

    debug_assert!(input_grad.len() >= in_size * batch);
    debug_assert!(packed.len() >= rows * cols_per_sample * batch);

    for s in 0..batch {
        let sample = &mut input_grad[s * in_size..(s + 1) * in_size];
        for ox in 0..out_layout.width() {
            for oy in 0..out_layout.height() {
                let col = s * cols_per_sample + ox * out_layout.height() + oy;
                let column = &packed[col * rows..(col + 1) * rows];
                for kx in 0..geometry.kernel_width {
                    for ky in 0..geometry.kernel_height {
                        if let Some((x, y)) = geometry.input_position(ox, oy, kx, ky) {
                            let row = geometry.packed_row(kx, ky, 0);
                            let dst = in_layout.offset(x, y, 0);
                            for (d, &v) in sample[dst..dst + channels]
                                .iter_mut()
                                .zip(&column[row..row + channels])
                            {
                                *d += v;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SampleLayout;

    fn geometry(input: SampleLayout, output: SampleLayout, kernel: usize, stride: usize, pad: bool) -> ConvGeometry {
        ConvGeometry {
            input,
            output,
            kernel_width: kernel,
            kernel_height: kernel,
            horizontal_stride: stride,
            vertical_stride: stride,
            zero_padding: pad,
        }
    }

    #[test]
    fn packs_3x3_with_2x2_kernel() {
        // one channel, 3x3 image, value = row index in the sample column
        let g = geometry(SampleLayout::new(3, 3, 1), SampleLayout::new(2, 2, 1), 2, 1, false);
        let input: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let mut packed = vec![-1.0; 4 * 4];
        pack_convolution_input(&input, &mut packed, &g, 1);

        // column for output (ox=0, oy=0): rows ordered (kx, ky) -> x*3+y
        assert_eq!(&packed[0..4], &[0.0, 1.0, 3.0, 4.0]);
        // column for output (ox=0, oy=1)
        assert_eq!(&packed[4..8], &[1.0, 2.0, 4.0, 5.0]);
        // column for output (ox=1, oy=0)
        assert_eq!(&packed[8..12], &[3.0, 4.0, 6.0, 7.0]);
        assert_eq!(&packed[12..16], &[4.0, 5.0, 7.0, 8.0]);
    }

    #[test]
    fn padding_writes_zeros() {
        let g = geometry(SampleLayout::new(2, 2, 1), SampleLayout::new(2, 2, 1), 3, 1, true);
        let input = vec![1.0; 4];
        let mut packed = vec![-1.0; 9 * 4];
        pack_convolution_input(&input, &mut packed, &g, 1);
        // every field sees exactly the four real pixels
        for col in 0..4 {
            let sum: f32 = packed[col * 9..(col + 1) * 9].iter().sum();
            assert_eq!(sum, 4.0);
            assert!(packed[col * 9..(col + 1) * 9].iter().all(|&v| v == 0.0 || v == 1.0));
        }
    }

    #[test]
    fn channels_stay_interleaved() {
        let g = geometry(SampleLayout::new(2, 1, 2), SampleLayout::new(2, 1, 2), 1, 1, false);
        let input = vec![10.0, 11.0, 20.0, 21.0];
        let mut packed = vec![0.0; 2 * 2];
        pack_convolution_input(&input, &mut packed, &g, 1);
        assert_eq!(packed, vec![10.0, 11.0, 20.0, 21.0]);
    }

    #[test]
    fn unpack_accumulates_overlaps() {
        let g = geometry(SampleLayout::new(3, 3, 1), SampleLayout::new(2, 2, 1), 2, 1, false);
        let packed = vec![1.0; 4 * 4];
        let mut grad = vec![0.0; 9];
        unpack_convolution_input(&packed, &mut grad, &g, 1);
        // corners are covered once, edges twice, centre four times
        assert_eq!(grad, vec![1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]);
    }
}
