use crate::backend::Backend;
use crate::config::PoolingConfig;
use crate::error::{ConvError, Result};
use crate::layout::{pooling_output_dim, PoolGeometry, SampleLayout};
use crate::matrix::Matrix;
use crate::nn::conv::{check_shape, LayoutInfo};
use crate::nn::node::{ComputationNode, NodeShape};
use crate::persist;
use std::fmt;
use std::io::{Read, Write};
use std::marker::PhantomData;
use tracing::{debug, info};

/// The reduction a pooling layer applies to each window.
pub trait PoolingReduction: Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    fn forward<B: Backend>(
        backend: &B,
        input: &B::Buf,
        output: &mut B::Buf,
        geometry: &PoolGeometry,
        batch: usize,
    );

    /// Add the gradient of the reduction into `input_grad`.
    #[allow(clippy::too_many_arguments)]
    fn backward<B: Backend>(
        backend: &B,
        output_grad: &B::Buf,
        input: &B::Buf,
        output: &B::Buf,
        input_grad: &mut B::Buf,
        geometry: &PoolGeometry,
        batch: usize,
    );
}

/// Window maximum. The gradient reaches at least one position that attains
/// the maximum; the host kernels route it to every tied position.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxPooling;

impl PoolingReduction for MaxPooling {
    const TYPE_NAME: &'static str = "MaxPooling";

    fn forward<B: Backend>(backend: &B, input: &B::Buf, output: &mut B::Buf, geometry: &PoolGeometry, batch: usize) {
        backend.max_pooling_forward(input, output, geometry, batch);
    }

    fn backward<B: Backend>(
        backend: &B,
        output_grad: &B::Buf,
        input: &B::Buf,
        output: &B::Buf,
        input_grad: &mut B::Buf,
        geometry: &PoolGeometry,
        batch: usize,
    ) {
        backend.add_max_pooling_gradient(output_grad, input, output, input_grad, geometry, batch);
    }
}

/// Arithmetic mean over the window.
#[derive(Debug, Clone, Copy, Default)]
pub struct AveragePooling;

impl PoolingReduction for AveragePooling {
    const TYPE_NAME: &'static str = "AveragePooling";

    fn forward<B: Backend>(backend: &B, input: &B::Buf, output: &mut B::Buf, geometry: &PoolGeometry, batch: usize) {
        backend.average_pooling_forward(input, output, geometry, batch);
    }

    fn backward<B: Backend>(
        backend: &B,
        output_grad: &B::Buf,
        _input: &B::Buf,
        _output: &B::Buf,
        input_grad: &mut B::Buf,
        geometry: &PoolGeometry,
        batch: usize,
    ) {
        backend.add_average_pooling_gradient(output_grad, input_grad, geometry, batch);
    }
}

/// Non-overlapping or overlapping window pooling over image samples.
///
/// Windows always lie inside the input; channels pass through unchanged.
pub struct PoolingLayer<B: Backend, R: PoolingReduction> {
    backend: B,
    name: String,
    window_width: usize,
    window_height: usize,
    horizontal_stride: usize,
    vertical_stride: usize,
    input_layout: Option<SampleLayout>,
    output_layout: Option<SampleLayout>,
    _reduction: PhantomData<R>,
}

pub type MaxPoolingLayer<B> = PoolingLayer<B, MaxPooling>;
pub type AveragePoolingLayer<B> = PoolingLayer<B, AveragePooling>;

impl<B: Backend, R: PoolingReduction> PoolingLayer<B, R> {
    pub fn new(backend: B, name: impl Into<String>, config: PoolingConfig) -> Result<Self> {
        config.check()?;
        Ok(Self {
            backend,
            name: name.into(),
            window_width: config.window_width,
            window_height: config.window_height,
            horizontal_stride: config.horizontal_stride,
            vertical_stride: config.vertical_stride,
            input_layout: None,
            output_layout: None,
            _reduction: PhantomData,
        })
    }

    pub fn config(&self) -> PoolingConfig {
        PoolingConfig {
            window_width: self.window_width,
            window_height: self.window_height,
            horizontal_stride: self.horizontal_stride,
            vertical_stride: self.vertical_stride,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn geometry(&self) -> Option<PoolGeometry> {
        Some(PoolGeometry {
            input: self.input_layout?,
            output: self.output_layout?,
            window_width: self.window_width,
            window_height: self.window_height,
            horizontal_stride: self.horizontal_stride,
            vertical_stride: self.vertical_stride,
        })
    }

    pub fn input_size_per_sample(&self) -> Option<usize> {
        self.input_layout.map(|l| l.size())
    }

    pub fn output_size_per_sample(&self) -> Option<usize> {
        self.output_layout.map(|l| l.size())
    }

    fn validated_geometry(&self, operation: &str) -> Result<PoolGeometry> {
        self.geometry().ok_or_else(|| {
            ConvError::logic(operation, format!("{} has not been validated; sample layouts are unknown", self.name))
        })
    }

    /// Infer the output layout from `input`, back-filling its row count when
    /// unset. Returns the shape this node produces.
    pub fn validate(&mut self, input: &mut NodeShape, is_final_pass: bool) -> Result<NodeShape> {
        let operation = format!("{}::validate", R::TYPE_NAME);

        if self.horizontal_stride > self.window_width || self.vertical_stride > self.window_height {
            return Err(ConvError::invalid_argument(
                &operation,
                format!(
                    "{}: horizontal stride must be <= window width and vertical stride must be <= window height",
                    self.name
                ),
            ));
        }

        let in_layout = input.sample_layout();
        if in_layout.width() < self.window_width || in_layout.height() < self.window_height {
            return Err(ConvError::invalid_argument(
                &operation,
                format!(
                    "{}: input width {} must be >= window width {} and input height {} must be >= window height {}",
                    self.name,
                    in_layout.width(),
                    self.window_width,
                    in_layout.height(),
                    self.window_height
                ),
            ));
        }

        let out_layout = SampleLayout::new(
            pooling_output_dim(in_layout.width(), self.window_width, self.horizontal_stride),
            pooling_output_dim(in_layout.height(), self.window_height, self.vertical_stride),
            in_layout.channels(),
        );
        self.input_layout = Some(in_layout);
        self.output_layout = Some(out_layout);

        if input.rows == 0 {
            debug!(node = %self.name, rows = in_layout.size(), "inferring input rows");
            input.rows = in_layout.size();
        }
        if is_final_pass && input.rows != in_layout.size() {
            return Err(ConvError::logic(
                &operation,
                format!(
                    "each column of input to {} is a sample and should have dimension {}, which is inputWidth * inputHeight * inputChannels, got {}",
                    self.name,
                    in_layout.size(),
                    input.rows
                ),
            ));
        }

        if is_final_pass {
            info!(node = %self.name, kind = R::TYPE_NAME, input = %in_layout, output = %out_layout, "pooling shapes inferred");
        }
        Ok(NodeShape::image(out_layout, input.cols))
    }

    pub fn forward(&self, input: &Matrix<B>, output: &mut Matrix<B>) -> Result<()> {
        let operation = format!("{}::forward", R::TYPE_NAME);
        let geometry = self.validated_geometry(&operation)?;
        let batch = input.cols();
        check_shape(&operation, &self.name, "input", input, (geometry.input_size_per_sample(), batch))?;

        let input = input.as_dense(&self.backend);
        output.resize(&self.backend, geometry.output_size_per_sample(), batch);
        R::forward(&self.backend, input.dense_buf()?, output.dense_buf_mut()?, &geometry, batch);
        Ok(())
    }

    /// Accumulate the input gradient. `input` and `output` are the values of
    /// the matching forward call.
    pub fn backward(
        &self,
        output_grad: &Matrix<B>,
        input_grad: &mut Matrix<B>,
        input: &Matrix<B>,
        output: &Matrix<B>,
    ) -> Result<()> {
        let operation = format!("{}::backward", R::TYPE_NAME);
        let geometry = self.validated_geometry(&operation)?;
        let batch = input.cols();
        let in_shape = (geometry.input_size_per_sample(), batch);
        let out_shape = (geometry.output_size_per_sample(), batch);
        check_shape(&operation, &self.name, "input", input, in_shape)?;
        check_shape(&operation, &self.name, "input gradient", input_grad, in_shape)?;
        check_shape(&operation, &self.name, "output", output, out_shape)?;
        check_shape(&operation, &self.name, "output gradient", output_grad, out_shape)?;

        let backend = &self.backend;
        let output_grad = output_grad.as_dense(backend);
        let input = input.as_dense(backend);
        R::backward(
            backend,
            output_grad.dense_buf()?,
            input.dense_buf()?,
            output.dense_buf()?,
            input_grad.dense_buf_mut()?,
            &geometry,
            batch,
        );
        Ok(())
    }

    /// Copy window configuration and inferred layouts when `copy_value` is set.
    pub fn copy_to(&self, target: &mut Self, copy_value: bool) {
        if copy_value {
            target.window_width = self.window_width;
            target.window_height = self.window_height;
            target.horizontal_stride = self.horizontal_stride;
            target.vertical_stride = self.vertical_stride;
            target.input_layout = self.input_layout;
            target.output_layout = self.output_layout;
        }
    }

    pub fn load(backend: B, name: impl Into<String>, reader: &mut dyn Read) -> Result<Self> {
        persist::read_header(reader, R::TYPE_NAME)?;
        let window_width = persist::read_usize(reader)?;
        let window_height = persist::read_usize(reader)?;
        let horizontal_stride = persist::read_usize(reader)?;
        let vertical_stride = persist::read_usize(reader)?;
        Self::new(
            backend,
            name,
            PoolingConfig {
                window_width,
                window_height,
                horizontal_stride,
                vertical_stride,
            },
        )
    }
}

impl<B: Backend, R: PoolingReduction> ComputationNode<B> for PoolingLayer<B, R> {
    fn type_name(&self) -> &'static str {
        R::TYPE_NAME
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

    fn save(&self, writer: &mut dyn Write) -> Result<()> {
        persist::write_header(writer, R::TYPE_NAME)?;
        persist::write_usize(writer, self.window_width)?;
        persist::write_usize(writer, self.window_height)?;
        persist::write_usize(writer, self.horizontal_stride)?;
        persist::write_usize(writer, self.vertical_stride)
    }
}

impl<B: Backend, R: PoolingReduction> fmt::Display for PoolingLayer<B, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} : {}", self.name, R::TYPE_NAME)?;
        writeln!(f, "Input{}", LayoutInfo(self.input_layout))?;
        writeln!(
            f,
            "PoolingWindow[Width:{}, Height:{}]  Stride[Horizontal:{}, Vertical:{}]",
            self.window_width, self.window_height, self.horizontal_stride, self.vertical_stride
        )?;
        writeln!(f, "Output{}", LayoutInfo(self.output_layout))?;
        match (self.input_size_per_sample(), self.output_size_per_sample()) {
            (Some(input), Some(output)) => {
                writeln!(f, "TotalSizePerSample[Input:{}, Output:{}]", input, output)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn config(window: usize, stride: usize) -> PoolingConfig {
        PoolingConfig {
            window_width: window,
            window_height: window,
            horizontal_stride: stride,
            vertical_stride: stride,
        }
    }

    #[test]
    fn validate_keeps_channels() {
        let mut layer = MaxPoolingLayer::new(CpuBackend, "pool", config(3, 2)).unwrap();
        let mut input = NodeShape::image(SampleLayout::new(7, 9, 4), 2);
        let out = layer.validate(&mut input, true).unwrap();
        assert_eq!(out.layout, Some(SampleLayout::new(3, 4, 4)));
        assert_eq!(layer.input_size_per_sample(), Some(252));
        assert_eq!(layer.output_size_per_sample(), Some(48));
    }

    #[test]
    fn stride_equal_to_window_is_accepted_but_larger_is_not() {
        let mut ok = AveragePoolingLayer::new(CpuBackend, "avg", config(2, 2)).unwrap();
        ok.validate(&mut NodeShape::image(SampleLayout::new(4, 4, 1), 1), true).unwrap();

        let horizontal = PoolingConfig { horizontal_stride: 3, ..config(2, 1) };
        let vertical = PoolingConfig { vertical_stride: 3, ..config(2, 1) };
        for too_wide in [config(2, 3), horizontal, vertical] {
            let mut bad = AveragePoolingLayer::new(CpuBackend, "avg", too_wide).unwrap();
            let err = bad
                .validate(&mut NodeShape::image(SampleLayout::new(6, 6, 1), 1), true)
                .unwrap_err();
            assert!(err.is_invalid_argument(), "{:?}", too_wide);
        }
    }

    #[test]
    fn unset_input_rows_are_back_inferred() {
        let mut layer = MaxPoolingLayer::new(CpuBackend, "pool", config(2, 2)).unwrap();
        let mut input = NodeShape::unsized_with_layout(SampleLayout::new(4, 6, 3), 5);
        layer.validate(&mut input, false).unwrap();
        assert_eq!(input.rows, 72);

        let mut wrong = NodeShape { rows: 70, cols: 5, layout: Some(SampleLayout::new(4, 6, 3)) };
        assert!(layer.validate(&mut wrong, true).unwrap_err().is_logic_error());
    }

    #[test]
    fn column_vector_input_is_treated_as_one_wide_image() {
        let mut layer = MaxPoolingLayer::new(CpuBackend, "pool", config(1, 1)).unwrap();
        let out = layer.validate(&mut NodeShape::new(10, 1), true).unwrap();
        assert_eq!(out.layout, Some(SampleLayout::new(1, 10, 1)));
    }

    #[test]
    fn average_forward_and_backward_on_one_window() {
        let b = CpuBackend;
        let mut layer = AveragePoolingLayer::new(b, "avg", config(2, 2)).unwrap();
        layer.validate(&mut NodeShape::image(SampleLayout::new(2, 2, 1), 1), true).unwrap();

        let x = Matrix::from_host(&b, &[1.0, 2.0, 3.0, 6.0], (4, 1));
        let mut y = Matrix::empty(&b);
        layer.forward(&x, &mut y).unwrap();
        assert_eq!(y.to_host(&b), vec![3.0]);

        let dy = Matrix::from_host(&b, &[4.0], (1, 1));
        let mut dx = Matrix::from_host(&b, &[1.0; 4], (4, 1));
        layer.backward(&dy, &mut dx, &x, &y).unwrap();
        assert_eq!(dx.to_host(&b), vec![2.0; 4]);
    }

    #[test]
    fn display_reports_sizes_after_validation() {
        let mut layer = MaxPoolingLayer::new(CpuBackend, "pool1", config(2, 2)).unwrap();
        assert!(!layer.to_string().contains("TotalSizePerSample"));
        layer.validate(&mut NodeShape::image(SampleLayout::new(4, 4, 2), 1), true).unwrap();
        let info = layer.to_string();
        assert!(info.contains("pool1 : MaxPooling"));
        assert!(info.contains("TotalSizePerSample[Input:32, Output:8]"));
    }
}
