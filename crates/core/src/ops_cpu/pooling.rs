use crate::layout::PoolGeometry;

#[inline]
fn window_origin(geometry: &PoolGeometry, ox: usize, oy: usize) -> (usize, usize) {
    (ox * geometry.horizontal_stride, oy * geometry.vertical_stride)
}

pub fn max_pooling_forward(input: &[f32], output: &mut [f32], geometry: &PoolGeometry, batch: usize) {
    let in_layout = geometry.input;
    let out_layout = geometry.output;
    let in_size = in_layout.size();
    let out_size = out_layout.size();

    for s in 0..batch {
        let sample = &input[s * in_size..(s + 1) * in_size];
        let result = &mut output[s * out_size..(s + 1) * out_size];
        for ox in 0..out_layout.width() {
            for oy in 0..out_layout.height() {
                let (x0, y0) = window_origin(geometry, ox, oy);
                for c in 0..in_layout.channels() {
                    let mut max_val = f32::NEG_INFINITY;
                    for wx in 0..geometry.window_width {
                        for wy in 0..geometry.window_height {
                            let v = sample[in_layout.offset(x0 + wx, y0 + wy, c)];
                            if v > max_val {
                                max_val = v;
                            }
                        }
                    }
                    result[out_layout.offset(ox, oy, c)] = max_val;
                }
            }
        }
    }
}

/// Route each output gradient to the window positions equal to the pooled
/// maximum, adding into `input_grad`.
///
/// Every position that ties with the maximum receives the full gradient.
pub fn add_max_pooling_gradient(
    output_grad: &[f32],
    input: &[f32],
    output: &[f32],
    input_grad: &mut [f32],
    geometry: &PoolGeometry,
    batch: usize,
) {
    let in_layout = geometry.input;
    let out_layout = geometry.output;
    let in_size = in_layout.size();
    let out_size = out_layout.size();

    for s in 0..batch {
        let sample = &input[s * in_size..(s + 1) * in_size];
        let grad = &mut input_grad[s * in_size..(s + 1) * in_size];
        let pooled = &output[s * out_size..(s + 1) * out_size];
        let incoming = &output_grad[s * out_size..(s + 1) * out_size];
        for ox in 0..out_layout.width() {
            for oy in 0..out_layout.height() {
                let (x0, y0) = window_origin(geometry, ox, oy);
                for c in 0..in_layout.channels() {
                    let out_idx = out_layout.offset(ox, oy, c);
                    let max_val = pooled[out_idx];
                    let g = incoming[out_idx];
                    for wx in 0..geometry.window_width {
                        for wy in 0..geometry.window_height {
                            let idx = in_layout.offset(x0 + wx, y0 + wy, c);
                            if sample[idx] == max_val {
                                grad[idx] += g;
                            }
                        }
                    }
                }
            }
        }
    }
}

pub fn average_pooling_forward(input: &[f32], output: &mut [f32], geometry: &PoolGeometry, batch: usize) {
    let in_layout = geometry.input;
    let out_layout = geometry.output;
    let in_size = in_layout.size();
    let out_size = out_layout.size();
    let window_size = geometry.window_size() as f32;

    for s in 0..batch {
        let sample = &input[s * in_size..(s + 1) * in_size];
        let result = &mut output[s * out_size..(s + 1) * out_size];
        for ox in 0..out_layout.width() {
            for oy in 0..out_layout.height() {
                let (x0, y0) = window_origin(geometry, ox, oy);
                for c in 0..in_layout.channels() {
                    let mut sum = 0.0f32;
                    for wx in 0..geometry.window_width {
                        for wy in 0..geometry.window_height {
                            sum += sample[in_layout.offset(x0 + wx, y0 + wy, c)];
                        }
                    }
                    result[out_layout.offset(ox, oy, c)] = sum / window_size;
                }
            }
        }
    }
}

/// Spread each output gradient evenly over its window, adding into `input_grad`.
pub fn add_average_pooling_gradient(
    output_grad: &[f32],
    input_grad: &mut [f32],
    geometry: &PoolGeometry,
    batch: usize,
) {
    let in_layout = geometry.input;
    let out_layout = geometry.output;
    let in_size = in_layout.size();
    let out_size = out_layout.size();
    let window_size = geometry.window_size() as f32;

    for s in 0..batch {
        let grad = &mut input_grad[s * in_size..(s + 1) * in_size];
        let incoming = &output_grad[s * out_size..(s + 1) * out_size];
        for ox in 0..out_layout.width() {
            for oy in 0..out_layout.height() {
                let (x0, y0) = window_origin(geometry, ox, oy);
                for c in 0..in_layout.channels() {
                    let share = incoming[out_layout.offset(ox, oy, c)] / window_size;
                    for wx in 0..geometry.window_width {
                        for wy in 0..geometry.window_height {
                            grad[in_layout.offset(x0 + wx, y0 + wy, c)] += share;
                        }
                    }
                }
            }
        }
    }
}
