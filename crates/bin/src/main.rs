use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use convnet_core::{
    backend::{Backend, CpuBackend},
    config::{ConvolutionConfig, LayerConfig, PoolingConfig},
    layout::SampleLayout,
    matrix::{Matrix, SparseColumns},
    nn::{AveragePoolingLayer, ComputationNode, ConvolutionLayer, FrameRange, MaxPoolingLayer, NodeShape},
    ops_cpu,
    pool::MatrixPool,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a layer against an input layout and print its node info
    Shapes {
        /// JSON layer config; overrides the kernel flags
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 28)]
        width: usize,
        #[arg(long, default_value_t = 28)]
        height: usize,
        #[arg(long, default_value_t = 1)]
        channels: usize,
        #[arg(long, default_value_t = 5)]
        kernel: usize,
        #[arg(long, default_value_t = 1)]
        stride: usize,
        #[arg(long, default_value_t = 16)]
        out_channels: usize,
        #[arg(long)]
        zero_padding: bool,
    },
    /// Sub-batch, packing and sparse-path parity checks
    Parity {
        #[arg(long, default_value_t = 13)]
        batch: usize,
        #[arg(long, default_value_t = 4)]
        max_temp: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Finite-difference gradient checks for convolution and pooling
    Gradcheck {
        #[arg(long, default_value_t = 3)]
        batch: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Time forward and backward passes for several sub-batch limits
    Bench {
        #[arg(long, default_value_t = 64)]
        batch: usize,
        #[arg(long, default_value_t = 5)]
        iters: usize,
        #[arg(long, value_delimiter = ',', default_value = "0,32,8")]
        max_temp: Vec<usize>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Commands::Shapes { config, width, height, channels, kernel, stride, out_channels, zero_padding } => {
            let layer_config = match config {
                Some(path) => LayerConfig::from_file(&path)
                    .with_context(|| format!("loading layer config {}", path.display()))?,
                None => LayerConfig::Convolution(ConvolutionConfig {
                    kernel_width: kernel,
                    kernel_height: kernel,
                    output_channels: out_channels,
                    horizontal_stride: stride,
                    vertical_stride: stride,
                    zero_padding,
                    max_temp_batch_size: 0,
                }),
            };
            run_shapes(layer_config, SampleLayout::new(width, height, channels))?;
        }
        Commands::Parity { batch, max_temp, seed } => {
            run_parity(batch, max_temp, seed)?;
        }
        Commands::Gradcheck { batch, seed } => {
            run_gradcheck(batch, seed)?;
        }
        Commands::Bench { batch, iters, max_temp } => {
            run_bench(batch, iters, &max_temp)?;
        }
    }
    Ok(())
}

fn run_shapes(config: LayerConfig, input: SampleLayout) -> Result<()> {
    let mut input_shape = NodeShape::image(input, 1);
    match config {
        LayerConfig::Convolution(c) => {
            let mut layer = ConvolutionLayer::new(CpuBackend, "conv", c)?;
            let mut weight = NodeShape::new(0, 0);
            let out = layer.validate(&mut weight, &mut input_shape, true)?;
            print!("{}", layer);
            println!("Weight: [{}, {}]", weight.rows, weight.cols);
            println!("Output rows per sample: {}", out.rows);
        }
        LayerConfig::MaxPooling(p) => {
            let mut layer = MaxPoolingLayer::new(CpuBackend, "pool", p)?;
            layer.validate(&mut input_shape, true)?;
            print!("{}", layer);
        }
        LayerConfig::AveragePooling(p) => {
            let mut layer = AveragePoolingLayer::new(CpuBackend, "pool", p)?;
            layer.validate(&mut input_shape, true)?;
            print!("{}", layer);
        }
    }
    Ok(())
}

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Matrix<CpuBackend> {
    let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
    Matrix::from_host(&CpuBackend, &data, (rows, cols))
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0f32, f32::max)
}

fn report(name: &str, ok: bool, detail: String) -> bool {
    println!("{:<28} {}  {}", name, if ok { "PASS" } else { "FAIL" }, detail);
    ok
}

/// A convolution layer validated for `input` and holding its scratch matrix.
fn conv_layer(
    config: ConvolutionConfig,
    input: SampleLayout,
    batch: usize,
    pool: &mut MatrixPool<CpuBackend>,
) -> Result<(ConvolutionLayer<CpuBackend>, (usize, usize))> {
    let mut layer = ConvolutionLayer::new(CpuBackend, "conv", config)?;
    let mut weight = NodeShape::new(0, 0);
    layer.validate(&mut weight, &mut NodeShape::image(input, batch), true)?;
    layer.request_matrices_before_forward(pool);
    Ok((layer, (weight.rows, weight.cols)))
}

fn run_parity(batch: usize, max_temp: usize, seed: u64) -> Result<()> {
    println!("Running parity checks: batch={}, max_temp={}...", batch, max_temp);
    let b = CpuBackend;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pool = MatrixPool::new();
    let mut all_ok = true;

    // sub-batched vs whole batch
    let input = SampleLayout::new(9, 7, 3);
    let config = ConvolutionConfig {
        kernel_width: 3,
        kernel_height: 3,
        output_channels: 8,
        horizontal_stride: 2,
        vertical_stride: 1,
        zero_padding: true,
        max_temp_batch_size: 0,
    };
    let (mut whole, weight_shape) = conv_layer(config, input, batch, &mut pool)?;
    let (mut split, _) =
        conv_layer(ConvolutionConfig { max_temp_batch_size: max_temp, ..config }, input, batch, &mut pool)?;
    let w = random_matrix(&mut rng, weight_shape.0, weight_shape.1);
    let x = random_matrix(&mut rng, input.size(), batch);

    let mut y_whole = Matrix::empty(&b);
    let mut y_split = Matrix::empty(&b);
    whole.forward(&w, &x, &mut y_whole)?;
    split.forward(&w, &x, &mut y_split)?;
    all_ok &= report(
        "forward sub-batching",
        y_whole.to_host(&b) == y_split.to_host(&b),
        "bit-identical required".to_string(),
    );

    let dy = random_matrix(&mut rng, y_whole.rows(), batch);
    let mut dx_whole = Matrix::zeros(&b, input.size(), batch);
    let mut dx_split = Matrix::zeros(&b, input.size(), batch);
    whole.backprop_to_input(&dy, &mut dx_whole, &w, &x)?;
    split.backprop_to_input(&dy, &mut dx_split, &w, &x)?;
    all_ok &= report(
        "input gradient sub-batching",
        dx_whole.to_host(&b) == dx_split.to_host(&b),
        "bit-identical required".to_string(),
    );

    let mut dw_whole = Matrix::zeros(&b, weight_shape.0, weight_shape.1);
    let mut dw_split = Matrix::zeros(&b, weight_shape.0, weight_shape.1);
    whole.backprop_to_weight(&dy, &mut dw_whole, &x, FrameRange::AllFrames)?;
    split.backprop_to_weight(&dy, &mut dw_split, &x, FrameRange::AllFrames)?;
    let diff = max_abs_diff(&dw_whole.to_host(&b), &dw_split.to_host(&b));
    all_ok &= report("weight gradient sub-batching", diff < 1e-4, format!("max|∆|={:.2e}", diff));

    // pack/unpack with stride equal to kernel
    let tiled = ConvolutionConfig { horizontal_stride: 3, vertical_stride: 3, zero_padding: false, ..config };
    let tiled_input = SampleLayout::new(9, 6, 2);
    let (tiled_layer, _) = conv_layer(tiled, tiled_input, batch, &mut pool)?;
    let geometry = tiled_layer.geometry().context("tiled layer is validated")?;
    let x_tiled = random_matrix(&mut rng, tiled_input.size(), batch).to_host(&b);
    let mut packed = b.alloc(geometry.packed_rows() * geometry.packed_cols_per_sample() * batch);
    b.pack_convolution_input(&x_tiled, &mut packed, &geometry, batch);
    let mut restored = b.alloc(x_tiled.len());
    b.unpack_convolution_input(&packed, &mut restored, &geometry, batch);
    all_ok &= report("pack/unpack round trip", restored == x_tiled, format!("{} elements", x_tiled.len()));

    // direct sparse 1-D convolution vs packing
    let text = SampleLayout::new(16, 1, 10);
    let text_config = ConvolutionConfig {
        kernel_width: 3,
        kernel_height: 1,
        output_channels: 5,
        horizontal_stride: 1,
        vertical_stride: 1,
        zero_padding: true,
        max_temp_batch_size: 0,
    };
    let (mut text_layer, text_weight) = conv_layer(text_config, text, batch, &mut pool)?;
    let columns: Vec<Vec<(usize, f32)>> = (0..batch)
        .map(|_| {
            (0..text.width())
                .map(|x| (x * text.channels() + rng.gen_range(0..text.channels()), 1.0))
                .collect()
        })
        .collect();
    let sparse = SparseColumns::from_columns(&columns);
    let w_text = random_matrix(&mut rng, text_weight.0, text_weight.1);
    let x_text = Matrix::from_host(&b, &sparse.to_dense(text.size()), (text.size(), batch));
    let mut y_packed = Matrix::empty(&b);
    text_layer.forward(&w_text, &x_text, &mut y_packed)?;
    let text_geometry = text_layer.geometry().context("text layer is validated")?;
    let mut y_direct = vec![0.0f32; text_geometry.output.size() * batch];
    ops_cpu::convolve_and_weighted_add(1.0, &w_text.to_host(&b), &sparse, &text_geometry, 0.0, &mut y_direct, batch);
    let diff = max_abs_diff(&y_packed.to_host(&b), &y_direct);
    all_ok &= report("sparse 1-D vs packed", diff < 1e-5, format!("max|∆|={:.2e}", diff));

    for layer in [&mut whole, &mut split, &mut text_layer] {
        layer.release_matrices_after_backprop(&mut pool);
    }
    info!(stats = ?pool.stats(), "scratch pool after parity run");

    println!("Parity: {}", if all_ok { "PASS" } else { "FAIL" });
    if !all_ok {
        bail!("parity checks failed");
    }
    Ok(())
}

/// Central differences of `sum(dy .* f(v))` with respect to a few entries of `v`.
fn numeric_gradient(
    values: &[f32],
    indices: &[usize],
    eps: f32,
    mut objective: impl FnMut(&[f32]) -> Result<f32>,
) -> Result<Vec<f32>> {
    indices
        .iter()
        .map(|&i| {
            let mut plus = values.to_vec();
            let mut minus = values.to_vec();
            plus[i] += eps;
            minus[i] -= eps;
            Ok((objective(&plus)? - objective(&minus)?) / (2.0 * eps))
        })
        .collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn run_gradcheck(batch: usize, seed: u64) -> Result<()> {
    println!("Running gradient checks: batch={}...", batch);
    let b = CpuBackend;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pool = MatrixPool::new();
    let mut all_ok = true;
    let tolerance = 1e-2f32;

    let input = SampleLayout::new(6, 5, 2);
    let config = ConvolutionConfig {
        kernel_width: 3,
        kernel_height: 2,
        output_channels: 3,
        horizontal_stride: 2,
        vertical_stride: 1,
        zero_padding: true,
        max_temp_batch_size: 2,
    };
    let (mut conv, weight_shape) = conv_layer(config, input, batch, &mut pool)?;
    let w = random_matrix(&mut rng, weight_shape.0, weight_shape.1);
    let x = random_matrix(&mut rng, input.size(), batch);
    let out_rows = conv.output_layout().context("validated")?.size();
    let dy = random_matrix(&mut rng, out_rows, batch);
    let dy_host = dy.to_host(&b);

    let mut y = Matrix::empty(&b);
    conv.forward(&w, &x, &mut y)?;
    let mut dw = Matrix::zeros(&b, weight_shape.0, weight_shape.1);
    let mut dx = Matrix::zeros(&b, input.size(), batch);
    conv.backprop_to_weight(&dy, &mut dw, &x, FrameRange::AllFrames)?;
    conv.backprop_to_input(&dy, &mut dx, &w, &x)?;

    let w_host = w.to_host(&b);
    let x_host = x.to_host(&b);
    let w_idx: Vec<usize> = (0..6).map(|_| rng.gen_range(0..w_host.len())).collect();
    let x_idx: Vec<usize> = (0..6).map(|_| rng.gen_range(0..x_host.len())).collect();

    let numeric_w = numeric_gradient(&w_host, &w_idx, 1e-2, |wv| {
        let mut out = Matrix::empty(&b);
        conv.forward(&Matrix::from_host(&b, wv, weight_shape), &x, &mut out)?;
        Ok(dot(&out.to_host(&b), &dy_host))
    })?;
    let analytic_w: Vec<f32> = w_idx.iter().map(|&i| dw.to_host(&b)[i]).collect();
    let diff = max_abs_diff(&numeric_w, &analytic_w);
    all_ok &= report("convolution weights", diff < tolerance, format!("max|∆|={:.2e}", diff));

    let numeric_x = numeric_gradient(&x_host, &x_idx, 1e-2, |xv| {
        let mut out = Matrix::empty(&b);
        conv.forward(&w, &Matrix::from_host(&b, xv, (input.size(), batch)), &mut out)?;
        Ok(dot(&out.to_host(&b), &dy_host))
    })?;
    let analytic_x: Vec<f32> = x_idx.iter().map(|&i| dx.to_host(&b)[i]).collect();
    let diff = max_abs_diff(&numeric_x, &analytic_x);
    all_ok &= report("convolution input", diff < tolerance, format!("max|∆|={:.2e}", diff));
    conv.release_matrices_after_backprop(&mut pool);

    let pool_config = PoolingConfig {
        window_width: 2,
        window_height: 2,
        horizontal_stride: 1,
        vertical_stride: 2,
    };
    let mut avg = AveragePoolingLayer::new(b, "avg", pool_config)?;
    let mut max = MaxPoolingLayer::new(b, "max", pool_config)?;
    avg.validate(&mut NodeShape::image(input, batch), true)?;
    max.validate(&mut NodeShape::image(input, batch), true)?;
    let pooled_rows = avg.output_size_per_sample().context("validated")?;
    let dy_pool = random_matrix(&mut rng, pooled_rows, batch);
    let dy_pool_host = dy_pool.to_host(&b);

    for (name, is_max) in [("average pooling", false), ("max pooling", true)] {
        let forward = |xv: &[f32]| -> Result<Vec<f32>> {
            let xm = Matrix::from_host(&b, xv, (input.size(), batch));
            let mut out = Matrix::empty(&b);
            if is_max {
                max.forward(&xm, &mut out)?;
            } else {
                avg.forward(&xm, &mut out)?;
            }
            Ok(out.to_host(&b))
        };
        let y_pool = Matrix::from_host(&b, &forward(&x_host)?, (pooled_rows, batch));
        let mut dx_pool = Matrix::zeros(&b, input.size(), batch);
        if is_max {
            max.backward(&dy_pool, &mut dx_pool, &x, &y_pool)?;
        } else {
            avg.backward(&dy_pool, &mut dx_pool, &x, &y_pool)?;
        }
        // small steps keep the max pooling argmax stable
        let numeric = numeric_gradient(&x_host, &x_idx, 1e-3, |xv| Ok(dot(&forward(xv)?, &dy_pool_host)))?;
        let analytic: Vec<f32> = x_idx.iter().map(|&i| dx_pool.to_host(&b)[i]).collect();
        let diff = max_abs_diff(&numeric, &analytic);
        all_ok &= report(name, diff < tolerance, format!("max|∆|={:.2e}", diff));
    }

    println!("Gradcheck: {}", if all_ok { "PASS" } else { "FAIL" });
    if !all_ok {
        bail!("gradient checks failed");
    }
    Ok(())
}

fn run_bench(batch: usize, iters: usize, max_temp: &[usize]) -> Result<()> {
    let b = CpuBackend;
    let mut rng = StdRng::seed_from_u64(0);
    let input = SampleLayout::new(28, 28, 8);
    println!("Benchmark: input {}, batch={}, iters={}", input, batch, iters);
    println!("max_temp,forward_ms,backward_ms,images_per_sec,peak_scratch_elems");

    for &limit in max_temp {
        let mut pool = MatrixPool::new();
        let config = ConvolutionConfig {
            kernel_width: 5,
            kernel_height: 5,
            output_channels: 16,
            horizontal_stride: 1,
            vertical_stride: 1,
            zero_padding: true,
            max_temp_batch_size: limit,
        };
        let (mut layer, weight_shape) = conv_layer(config, input, batch, &mut pool)?;
        let w = layer.init_weights(&mut rng)?;
        let x = random_matrix(&mut rng, input.size(), batch);
        let mut y = Matrix::empty(&b);
        let mut dw = Matrix::zeros(&b, weight_shape.0, weight_shape.1);
        let mut dx = Matrix::zeros(&b, input.size(), batch);

        let mut forward_ms = 0.0f64;
        let mut backward_ms = 0.0f64;
        for _ in 0..iters {
            layer.request_matrices_before_forward(&mut pool);
            let start = Instant::now();
            layer.forward(&w, &x, &mut y)?;
            forward_ms += start.elapsed().as_secs_f64() * 1e3;

            let start = Instant::now();
            layer.backprop_to_weight(&y, &mut dw, &x, FrameRange::AllFrames)?;
            layer.backprop_to_input(&y, &mut dx, &w, &x)?;
            backward_ms += start.elapsed().as_secs_f64() * 1e3;
            layer.release_matrices_after_backprop(&mut pool);
        }

        let per_iter = (forward_ms + backward_ms) / iters.max(1) as f64;
        let throughput = if per_iter > 0.0 { batch as f64 / (per_iter / 1e3) } else { 0.0 };
        println!(
            "{},{:.2},{:.2},{:.1},{}",
            limit,
            forward_ms / iters.max(1) as f64,
            backward_ms / iters.max(1) as f64,
            throughput,
            pool.stats().peak_capacity
        );
    }
    Ok(())
}
