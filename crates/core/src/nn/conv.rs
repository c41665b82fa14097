use crate::backend::{Backend, DataLocation};
use crate::config::ConvolutionConfig;
use crate::error::{ConvError, Result};
use crate::layout::{convolution_output_dim, ConvGeometry, SampleLayout};
use crate::matrix::Matrix;
use crate::nn::node::{ComputationNode, FrameRange, NodeShape};
use crate::persist;
use crate::pool::MatrixPool;
use rand::Rng;
use std::fmt;
use std::io::{Read, Write};
use tracing::{debug, info, trace, warn};

pub const CONVOLUTION_TYPE_NAME: &str = "Convolution";

/// Splits a batch into contiguous sub-batches so the packed representation of
/// one sub-batch stays bounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubBatchPlan {
    batch_size: usize,
    sub_batch_size: usize,
}

impl SubBatchPlan {
    /// `max_temp_batch_size == 0` means the whole batch is packed at once.
    pub fn new(batch_size: usize, max_temp_batch_size: usize) -> Self {
        let limit = if max_temp_batch_size == 0 { batch_size } else { max_temp_batch_size };
        Self {
            batch_size,
            sub_batch_size: batch_size.min(limit),
        }
    }

    pub fn sub_batch_size(&self) -> usize {
        self.sub_batch_size
    }

    pub fn num_sub_batches(&self) -> usize {
        if self.sub_batch_size == 0 {
            0
        } else {
            (self.batch_size + self.sub_batch_size - 1) / self.sub_batch_size
        }
    }

    /// `(first sample, sample count)` of each sub-batch, in increasing order.
    pub fn ranges(&self) -> impl Iterator<Item = (usize, usize)> {
        let Self { batch_size, sub_batch_size } = *self;
        (0..self.num_sub_batches()).map(move |i| {
            let start = i * sub_batch_size;
            (start, sub_batch_size.min(batch_size - start))
        })
    }
}

/// Identifies the input a scratch matrix was packed from, and the geometry
/// it was packed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PackToken {
    generation: u64,
    rows: usize,
    cols: usize,
    geometry: ConvGeometry,
}

impl PackToken {
    fn of<B: Backend>(matrix: &Matrix<B>, geometry: ConvGeometry) -> Self {
        Self {
            generation: matrix.generation(),
            rows: matrix.rows(),
            cols: matrix.cols(),
            geometry,
        }
    }
}

/// Packed-input scratch space borrowed from a [`MatrixPool`].
struct PackedScratch<B: Backend> {
    matrix: Matrix<B>,
    /// Set only while `matrix` holds the packing of a whole batch.
    packed_for: Option<PackToken>,
}

/// Convolution over image samples, computed as packing plus matrix multiply.
///
/// Inputs are a weight matrix `[output_channels, kernel_width * kernel_height *
/// input_channels]` and a feature batch with one sample per column. The output
/// has one `output_layout` sample per column.
pub struct ConvolutionLayer<B: Backend> {
    backend: B,
    name: String,
    kernel_width: usize,
    kernel_height: usize,
    horizontal_stride: usize,
    vertical_stride: usize,
    output_channels: usize,
    zero_padding: bool,
    max_temp_batch_size: usize,
    input_layout: Option<SampleLayout>,
    output_layout: Option<SampleLayout>,
    scratch: Option<PackedScratch<B>>,
    used_sparse_1d: bool,
}

impl<B: Backend> ConvolutionLayer<B> {
    pub fn new(backend: B, name: impl Into<String>, config: ConvolutionConfig) -> Result<Self> {
        config.check()?;
        Ok(Self {
            backend,
            name: name.into(),
            kernel_width: config.kernel_width,
            kernel_height: config.kernel_height,
            horizontal_stride: config.horizontal_stride,
            vertical_stride: config.vertical_stride,
            output_channels: config.output_channels,
            zero_padding: config.zero_padding,
            max_temp_batch_size: config.max_temp_batch_size,
            input_layout: None,
            output_layout: None,
            scratch: None,
            used_sparse_1d: false,
        })
    }

    pub fn config(&self) -> ConvolutionConfig {
        ConvolutionConfig {
            kernel_width: self.kernel_width,
            kernel_height: self.kernel_height,
            output_channels: self.output_channels,
            horizontal_stride: self.horizontal_stride,
            vertical_stride: self.vertical_stride,
            zero_padding: self.zero_padding,
            max_temp_batch_size: self.max_temp_batch_size,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn max_temp_batch_size(&self) -> usize {
        self.max_temp_batch_size
    }

    /// May change between evaluation rounds; 0 packs the whole batch.
    pub fn set_max_temp_batch_size(&mut self, max_temp_batch_size: usize) {
        self.max_temp_batch_size = max_temp_batch_size;
    }

    /// Whether the last forward call took the sparse one-row path.
    pub fn used_sparse_1d(&self) -> bool {
        self.used_sparse_1d
    }

    /// Shape the weight matrix must have once the input layout is known.
    pub fn weight_shape(&self) -> Option<(usize, usize)> {
        self.input_layout
            .map(|l| (self.output_channels, self.kernel_width * self.kernel_height * l.channels()))
    }

    pub fn geometry(&self) -> Option<ConvGeometry> {
        Some(ConvGeometry {
            input: self.input_layout?,
            output: self.output_layout?,
            kernel_width: self.kernel_width,
            kernel_height: self.kernel_height,
            horizontal_stride: self.horizontal_stride,
            vertical_stride: self.vertical_stride,
            zero_padding: self.zero_padding,
        })
    }

    fn validated_geometry(&self, operation: &str) -> Result<ConvGeometry> {
        self.geometry().ok_or_else(|| {
            ConvError::logic(operation, format!("{} has not been validated; sample layouts are unknown", self.name))
        })
    }

    /// Infer both sample layouts and check every dimension against them.
    ///
    /// Producers without elements get their dimensions back-inferred. On the
    /// final pass any remaining mismatch is a logic error. Returns the shape
    /// this node produces.
    pub fn validate(&mut self, weight: &mut NodeShape, input: &mut NodeShape, is_final_pass: bool) -> Result<NodeShape> {
        const OP: &str = "Convolution::validate";

        if self.horizontal_stride > self.kernel_width || self.vertical_stride > self.kernel_height {
            return Err(ConvError::invalid_argument(
                OP,
                format!(
                    "{}: horizontal stride must be <= kernel width and vertical stride must be <= kernel height",
                    self.name
                ),
            ));
        }

        let (input_layout, output_layout) = self.infer_image_dims_from_input(input)?;
        if let Some(scratch) = self.scratch.as_mut() {
            scratch.packed_for = None;
        }

        let weight_cols = self.kernel_width * self.kernel_height * input_layout.channels();
        if weight.has_no_elements() {
            debug!(node = %self.name, rows = self.output_channels, cols = weight_cols, "inferring weight dimensions");
            weight.rows = self.output_channels;
            weight.cols = weight_cols;
        }
        if is_final_pass && (weight.cols != weight_cols || weight.rows != self.output_channels) {
            return Err(ConvError::logic(
                OP,
                format!(
                    "convolution weight matrix of {} should have dimension [{}, {}] which is [outputChannels, kernelWidth * kernelHeight * inputChannels], got [{}, {}]",
                    self.name, self.output_channels, weight_cols, weight.rows, weight.cols
                ),
            ));
        }

        let input_dim = input_layout.size();
        if input.rows == 0 {
            input.rows = input_dim;
        }
        if is_final_pass && input.rows != input_dim {
            return Err(ConvError::logic(
                OP,
                format!(
                    "each column of input to {} is a sample and should have dimension {}, which is inputWidth * inputHeight * inputChannels, got {}",
                    self.name, input_dim, input.rows
                ),
            ));
        }

        if is_final_pass {
            info!(node = %self.name, input = %input_layout, output = %output_layout, "convolution shapes inferred");
        }
        Ok(NodeShape::image(output_layout, input.cols))
    }

    fn infer_image_dims_from_input(&mut self, input: &NodeShape) -> Result<(SampleLayout, SampleLayout)> {
        let in_layout = input.sample_layout();
        if in_layout.width() < self.kernel_width || in_layout.height() < self.kernel_height {
            return Err(ConvError::invalid_argument(
                "Convolution::infer_image_dims",
                format!(
                    "{}: input width {} must be >= kernel width {} and input height {} must be >= kernel height {}",
                    self.name,
                    in_layout.width(),
                    self.kernel_width,
                    in_layout.height(),
                    self.kernel_height
                ),
            ));
        }

        let output_layout = SampleLayout::new(
            convolution_output_dim(in_layout.width(), self.kernel_width, self.horizontal_stride, self.zero_padding),
            convolution_output_dim(in_layout.height(), self.kernel_height, self.vertical_stride, self.zero_padding),
            self.output_channels,
        );
        self.input_layout = Some(in_layout);
        self.output_layout = Some(output_layout);
        Ok((in_layout, output_layout))
    }

    /// Uniform Xavier initialisation for a weight matrix of [`Self::weight_shape`].
    pub fn init_weights<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Matrix<B>> {
        let (rows, cols) = self
            .weight_shape()
            .ok_or_else(|| ConvError::logic("Convolution::init_weights", format!("{} has not been validated", self.name)))?;
        let fan_in = cols as f32;
        let fan_out = (self.output_channels * self.kernel_width * self.kernel_height) as f32;
        let limit = (6.0 / (fan_in + fan_out)).sqrt();
        let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-limit..=limit)).collect();
        Ok(Matrix::from_host(&self.backend, &data, (rows, cols)))
    }

    /// `output = weight * pack(input)`, one sub-batch at a time.
    ///
    /// Sparse inputs of height one that live on the device are convolved
    /// directly without packing.
    pub fn forward(&mut self, weight: &Matrix<B>, input: &Matrix<B>, output: &mut Matrix<B>) -> Result<()> {
        const OP: &str = "Convolution::forward";
        let geometry = self.validated_geometry(OP)?;
        let out_channels = geometry.output.channels();
        let packed_rows = geometry.packed_rows();
        let cols_per_sample = geometry.packed_cols_per_sample();

        if weight.shape() != (out_channels, packed_rows) {
            return Err(ConvError::logic(
                OP,
                format!(
                    "weight matrix of {} is [{}, {}], expected [{}, {}]",
                    self.name,
                    weight.rows(),
                    weight.cols(),
                    out_channels,
                    packed_rows
                ),
            ));
        }
        check_rows(OP, &self.name, "input", input, geometry.input.size())?;

        let batch = input.cols();
        let plan = SubBatchPlan::new(batch, self.max_temp_batch_size);
        self.used_sparse_1d =
            geometry.input.height() == 1 && input.location() == DataLocation::Device && input.is_sparse();
        debug!(
            node = %self.name,
            batch,
            sub_batch = plan.sub_batch_size(),
            sub_batches = plan.num_sub_batches(),
            sparse_1d = self.used_sparse_1d,
            "convolution forward"
        );

        let backend = &self.backend;
        output.resize(backend, geometry.output.size(), batch);
        let weight_buf = weight.dense_buf()?;

        if self.used_sparse_1d {
            if geometry.kernel_width * geometry.input.channels() != weight.cols() {
                return Err(ConvError::logic(OP, "kernel width and weight matrix dimensions don't match"));
            }
            for (start, len) in plan.ranges() {
                trace!(start, len, "sparse 1-D sub-batch");
                let input_sub = input.column_slice(backend, start, len)?;
                let sparse = input_sub
                    .sparse_columns()
                    .ok_or_else(|| ConvError::logic(OP, "sparse input slice lost its sparse storage"))?;
                let mut output_sub = Matrix::zeros(backend, geometry.output.size(), len);
                backend.convolve_and_weighted_add(1.0, weight_buf, sparse, &geometry, 0.0, output_sub.dense_buf_mut()?, len);
                output.set_column_slice(backend, start, &output_sub)?;
            }
            if let Some(scratch) = self.scratch.as_mut() {
                scratch.packed_for = None;
            }
            return Ok(());
        }

        let scratch = self.scratch.as_mut().ok_or_else(|| scratch_missing(OP, &self.name))?;
        for (start, len) in plan.ranges() {
            trace!(start, len, "packing sub-batch");
            let mut input_sub = input.column_slice(backend, start, len)?;
            input_sub.switch_to_dense(backend);
            scratch.matrix.resize(backend, packed_rows, cols_per_sample * len);
            backend.pack_convolution_input(input_sub.dense_buf()?, scratch.matrix.dense_buf_mut()?, &geometry, len);

            // [channels, len * spatial] is already [channels * spatial, len] in column-major order
            let mut output_sub = Matrix::zeros(backend, out_channels, cols_per_sample * len);
            backend.gemm(
                weight_buf, false,
                scratch.matrix.dense_buf()?, false,
                output_sub.dense_buf_mut()?,
                out_channels, cols_per_sample * len, packed_rows,
                1.0, 0.0,
            );
            output_sub.reshape(out_channels * cols_per_sample, len)?;
            output.set_column_slice(backend, start, &output_sub)?;
        }
        scratch.packed_for = (plan.num_sub_batches() == 1).then(|| PackToken::of(input, geometry));
        Ok(())
    }

    /// Accumulate `output_grad * pack(input)^T` into `weight_grad`.
    ///
    /// The packing left by forward is reused when it covers this exact input as
    /// one sub-batch, the call spans all frames and the sparse path was not used.
    pub fn backprop_to_weight(
        &mut self,
        output_grad: &Matrix<B>,
        weight_grad: &mut Matrix<B>,
        input: &Matrix<B>,
        frame: FrameRange,
    ) -> Result<()> {
        const OP: &str = "Convolution::backprop_to_weight";
        let geometry = self.validated_geometry(OP)?;
        let out_channels = geometry.output.channels();
        let packed_rows = geometry.packed_rows();
        let cols_per_sample = geometry.packed_cols_per_sample();
        let batch = input.cols();

        check_rows(OP, &self.name, "input", input, geometry.input.size())?;
        check_shape(OP, &self.name, "output gradient", output_grad, (geometry.output.size(), batch))?;
        check_shape(OP, &self.name, "weight gradient", weight_grad, (out_channels, packed_rows))?;

        let plan = SubBatchPlan::new(batch, self.max_temp_batch_size);
        let backend = &self.backend;
        let scratch = self.scratch.as_mut().ok_or_else(|| scratch_missing(OP, &self.name))?;
        let token = PackToken::of(input, geometry);
        let grad_buf = weight_grad.dense_buf_mut()?;

        let whole_batch = plan.num_sub_batches() == 1 && frame.is_all_frames() && !self.used_sparse_1d;
        if whole_batch && scratch.packed_for == Some(token) {
            debug!(node = %self.name, "reusing packed input from forward");
            let output_grad = output_grad.as_dense(backend);
            backend.gemm(
                output_grad.dense_buf()?, false,
                scratch.matrix.dense_buf()?, true,
                grad_buf,
                out_channels, packed_rows, cols_per_sample * batch,
                1.0, 1.0,
            );
            return Ok(());
        }

        if whole_batch && scratch.packed_for.is_some() {
            warn!(node = %self.name, "packed input belongs to another batch; repacking");
        }
        for (start, len) in plan.ranges() {
            trace!(start, len, "repacking sub-batch for weight gradient");
            let mut grad_sub = output_grad.column_slice(backend, start, len)?;
            grad_sub.switch_to_dense(backend);
            let mut input_sub = input.column_slice(backend, start, len)?;
            input_sub.switch_to_dense(backend);
            scratch.matrix.resize(backend, packed_rows, cols_per_sample * len);
            backend.pack_convolution_input(input_sub.dense_buf()?, scratch.matrix.dense_buf_mut()?, &geometry, len);
            backend.gemm(
                grad_sub.dense_buf()?, false,
                scratch.matrix.dense_buf()?, true,
                grad_buf,
                out_channels, packed_rows, cols_per_sample * len,
                1.0, 1.0,
            );
        }
        scratch.packed_for = (plan.num_sub_batches() == 1).then_some(token);
        Ok(())
    }

    /// Accumulate the input gradient: `unpack(weight^T * output_grad)` per sub-batch.
    pub fn backprop_to_input(
        &mut self,
        output_grad: &Matrix<B>,
        input_grad: &mut Matrix<B>,
        weight: &Matrix<B>,
        input: &Matrix<B>,
    ) -> Result<()> {
        const OP: &str = "Convolution::backprop_to_input";
        let geometry = self.validated_geometry(OP)?;
        let out_channels = geometry.output.channels();
        let packed_rows = geometry.packed_rows();
        let cols_per_sample = geometry.packed_cols_per_sample();
        let batch = input.cols();

        check_shape(OP, &self.name, "weight", weight, (out_channels, packed_rows))?;
        check_shape(OP, &self.name, "output gradient", output_grad, (geometry.output.size(), batch))?;
        check_shape(OP, &self.name, "input gradient", input_grad, (geometry.input.size(), batch))?;

        let plan = SubBatchPlan::new(batch, self.max_temp_batch_size);
        let backend = &self.backend;
        let scratch = self.scratch.as_mut().ok_or_else(|| scratch_missing(OP, &self.name))?;
        let weight_buf = weight.dense_buf()?;

        for (start, len) in plan.ranges() {
            trace!(start, len, "input gradient sub-batch");
            let mut grad_sub = output_grad.column_slice(backend, start, len)?;
            grad_sub.switch_to_dense(backend);
            scratch.matrix.resize(backend, packed_rows, cols_per_sample * len);
            backend.gemm(
                weight_buf, true,
                grad_sub.dense_buf()?, false,
                scratch.matrix.dense_buf_mut()?,
                packed_rows, cols_per_sample * len, out_channels,
                1.0, 0.0,
            );

            let mut input_grad_sub = input_grad.column_slice(backend, start, len)?;
            backend.unpack_convolution_input(
                scratch.matrix.dense_buf()?,
                input_grad_sub.dense_buf_mut()?,
                &geometry,
                len,
            );
            input_grad.set_column_slice(backend, start, &input_grad_sub)?;
        }
        scratch.packed_for = None;
        Ok(())
    }

    /// Gradient for input `0` (weights) or `1` (features).
    #[allow(clippy::too_many_arguments)]
    pub fn backprop_to(
        &mut self,
        input_index: usize,
        output_grad: &Matrix<B>,
        weight: &Matrix<B>,
        input: &Matrix<B>,
        input_gradient: &mut Matrix<B>,
        frame: FrameRange,
    ) -> Result<()> {
        match input_index {
            0 => self.backprop_to_weight(output_grad, input_gradient, input, frame),
            1 => self.backprop_to_input(output_grad, input_gradient, weight, input),
            other => Err(ConvError::logic(
                "Convolution::backprop_to",
                format!("{} has two inputs, got index {}", self.name, other),
            )),
        }
    }

    /// Copy the configuration into `target`; with `copy_value` also the
    /// inferred layouts and the scratch contents.
    pub fn copy_to(&self, target: &mut Self, copy_value: bool) {
        if !copy_value {
            return;
        }
        target.kernel_width = self.kernel_width;
        target.kernel_height = self.kernel_height;
        target.horizontal_stride = self.horizontal_stride;
        target.vertical_stride = self.vertical_stride;
        target.output_channels = self.output_channels;
        target.zero_padding = self.zero_padding;
        target.max_temp_batch_size = self.max_temp_batch_size;
        target.input_layout = self.input_layout;
        target.output_layout = self.output_layout;
        if let Some(src) = self.scratch.as_ref() {
            match target.scratch.as_mut() {
                Some(dst) => {
                    dst.matrix = src.matrix.clone();
                    dst.packed_for = src.packed_for;
                }
                None => {
                    target.scratch = Some(PackedScratch {
                        matrix: src.matrix.clone(),
                        packed_for: src.packed_for,
                    });
                }
            }
        }
    }

    /// Restore a layer written by [`ComputationNode::save`]. Layouts are not
    /// persisted and are re-inferred by the next validation pass.
    pub fn load(backend: B, name: impl Into<String>, reader: &mut dyn Read) -> Result<Self> {
        let version = persist::read_header(reader, CONVOLUTION_TYPE_NAME)?;
        let name = name.into();
        debug!(node = %name, version, "loading convolution record");
        let kernel_width = persist::read_usize(reader)?;
        let kernel_height = persist::read_usize(reader)?;
        let horizontal_stride = persist::read_usize(reader)?;
        let vertical_stride = persist::read_usize(reader)?;
        let output_channels = persist::read_usize(reader)?;
        let zero_padding = persist::read_bool(reader)?;
        let max_temp_batch_size = persist::read_usize(reader)?;
        let config = ConvolutionConfig {
            kernel_width,
            kernel_height,
            output_channels,
            horizontal_stride,
            vertical_stride,
            zero_padding,
            max_temp_batch_size,
        };
        Self::new(backend, name, config)
    }
}

impl<B: Backend> ComputationNode<B> for ConvolutionLayer<B> {
    fn type_name(&self) -> &'static str {
        CONVOLUTION_TYPE_NAME
    }

    fn node_name(&self) -> &str {
        &self.name
    }

    fn input_layout(&self) -> Option<SampleLayout> {
        self.input_layout
    }

    fn output_layout(&self) -> Option<SampleLayout> {
        self.output_layout
    }

    fn request_matrices_before_forward(&mut self, pool: &mut MatrixPool<B>) {
        if self.scratch.is_none() {
            self.scratch = Some(PackedScratch {
                matrix: pool.request(&self.backend),
                packed_for: None,
            });
        }
    }

    fn release_matrices_after_backprop(&mut self, pool: &mut MatrixPool<B>) {
        if let Some(scratch) = self.scratch.take() {
            pool.release(scratch.matrix);
        }
    }

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        persist::write_header(writer, CONVOLUTION_TYPE_NAME)?;
        persist::write_usize(writer, self.kernel_width)?;
        persist::write_usize(writer, self.kernel_height)?;
        persist::write_usize(writer, self.horizontal_stride)?;
        persist::write_usize(writer, self.vertical_stride)?;
        persist::write_usize(writer, self.output_channels)?;
        persist::write_bool(writer, self.zero_padding)?;
        persist::write_usize(writer, self.max_temp_batch_size)
    }
}

impl<B: Backend> fmt::Display for ConvolutionLayer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} : {}", self.name, CONVOLUTION_TYPE_NAME)?;
        writeln!(f, "Input{}", LayoutInfo(self.input_layout))?;
        writeln!(
            f,
            "Kernel[Width:{}, Height:{}]  Stride[Horizontal:{}, Vertical:{}]",
            self.kernel_width, self.kernel_height, self.horizontal_stride, self.vertical_stride
        )?;
        writeln!(f, "Output{}", LayoutInfo(self.output_layout))?;
        writeln!(f, "ZeroPadding={}  MaxTempBatchSize={}", self.zero_padding, self.max_temp_batch_size)
    }
}

/// Renders an optional layout the way node dumps expect.
pub(crate) struct LayoutInfo(pub Option<SampleLayout>);

impl fmt::Display for LayoutInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(layout) => write!(f, "{}", layout),
            None => write!(f, "[not inferred]"),
        }
    }
}

fn scratch_missing(operation: &str, name: &str) -> ConvError {
    ConvError::logic(
        operation,
        format!("{}: scratch matrix not acquired; call request_matrices_before_forward first", name),
    )
}

pub(crate) fn check_rows<B: Backend>(operation: &str, node: &str, what: &str, m: &Matrix<B>, rows: usize) -> Result<()> {
    if m.rows() != rows {
        return Err(ConvError::logic(
            operation,
            format!("{} of {} has {} rows, expected {}", what, node, m.rows(), rows),
        ));
    }
    Ok(())
}

pub(crate) fn check_shape<B: Backend>(
    operation: &str,
    node: &str,
    what: &str,
    m: &Matrix<B>,
    shape: (usize, usize),
) -> Result<()> {
    if m.shape() != shape {
        return Err(ConvError::logic(
            operation,
            format!(
                "{} of {} is [{}, {}], expected [{}, {}]",
                what,
                node,
                m.rows(),
                m.cols(),
                shape.0,
                shape.1
            ),
        ));
    }
    Ok(())
}
