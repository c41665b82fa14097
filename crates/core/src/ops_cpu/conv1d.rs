use crate::layout::ConvGeometry;
use crate::matrix::SparseColumns;

/// Direct convolution of sparse one-row samples, skipping the packing step.
///
/// Computes `output = alpha * conv(weights, input) + beta * output` for inputs of
/// height one. `weights` is the column-major `out_channels x (kernel_width *
/// channels)` matrix and `output` holds `batch` dense columns of
/// `geometry.output.size()` rows. Only stored non-zeros are visited, so the cost
/// scales with the number of active features rather than the vocabulary size.
#[allow(clippy::too_many_arguments)]
pub fn convolve_and_weighted_add(
    alpha: f32,
    weights: &[f32],
    input: &SparseColumns,
    geometry: &ConvGeometry,
    beta: f32,
    output: &mut [f32],
    batch: usize,
) {
    let channels = geometry.input.channels();
    let out_layout = geometry.output;
    let out_channels = out_layout.channels();
    let out_size = out_layout.size();
    let stride = geometry.horizontal_stride as isize;
    let pad = if geometry.zero_padding {
        (geometry.kernel_width / 2) as isize
    } else {
        0
    };

    debug_assert_eq!(geometry.input.height(), 1);
    debug_assert!(output.len() >= out_size * batch);

    for s in 0..batch {
        let column = &mut output[s * out_size..(s + 1) * out_size];
        if beta == 0.0 {
            column.fill(0.0);
        } else if beta != 1.0 {
            column.iter_mut().for_each(|v| *v *= beta);
        }

        for (row, value) in input.column(s) {
            let x = (row / channels) as isize;
            let c = row % channels;
            for kx in 0..geometry.kernel_width {
                // output position whose field starts at x - kx
                let start = x + pad - kx as isize;
                if start < 0 || start % stride != 0 {
                    continue;
                }
                let ox = (start / stride) as usize;
                if ox >= out_layout.width() {
                    continue;
                }
                let weight_col = geometry.packed_row(kx, 0, c);
                let w = &weights[weight_col * out_channels..(weight_col + 1) * out_channels];
                let out = out_layout.offset(ox, 0, 0);
                for (o, &wv) in column[out..out + out_channels].iter_mut().zip(w) {
                    *o += alpha * wv * value;
                }
            }
        }
    }
}
