use crate::layout::{ConvGeometry, PoolGeometry};
use crate::matrix::SparseColumns;
use crate::ops_cpu;

/// Where a matrix's storage currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataLocation {
    #[default]
    Host,
    Device,
}

/// Matrix backend consumed by the layers.
///
/// Buffers are flat column-major `f32` storage. Every primitive that takes a
/// batch operates on `batch` consecutive sample columns. Implementations may
/// parallelise internally but must stay deterministic, since sub-batched and
/// whole-batch evaluation are expected to agree bit for bit.
pub trait Backend: Send + Sync + 'static {
    type Buf: Send + Sync + Clone;

    fn location(&self) -> DataLocation {
        DataLocation::Host
    }

    fn alloc(&self, len: usize) -> Self::Buf;
    fn upload(&self, host: &[f32]) -> Self::Buf;
    fn download(&self, buf: &Self::Buf, out: &mut [f32]);

    /// Copy `len` elements from `src[src_offset..]` into `dst[dst_offset..]`.
    fn copy_range(&self, src: &Self::Buf, src_offset: usize, dst: &mut Self::Buf, dst_offset: usize, len: usize);

    /// Materialise a sparse matrix with `rows` rows as dense storage.
    fn densify(&self, sparse: &SparseColumns, rows: usize) -> Self::Buf {
        self.upload(&sparse.to_dense(rows))
    }

    /// `C = alpha * op(A) * op(B) + beta * C`, column-major, `op(A)` is `m x k`.
    #[allow(clippy::too_many_arguments)]
    fn gemm(&self, a: &Self::Buf, trans_a: bool, b: &Self::Buf, trans_b: bool, c: &mut Self::Buf,
            m: usize, n: usize, k: usize, alpha: f32, beta: f32);

    /// Unroll receptive fields into `packed`, see [`ops_cpu::pack_convolution_input`].
    fn pack_convolution_input(&self, input: &Self::Buf, packed: &mut Self::Buf,
                              geometry: &ConvGeometry, batch: usize);

    /// Scatter-add packed columns into `input_grad`; the adjoint of packing.
    fn unpack_convolution_input(&self, packed: &Self::Buf, input_grad: &mut Self::Buf,
                                geometry: &ConvGeometry, batch: usize);

    /// Sparse one-row convolution without packing,
    /// `output = alpha * conv(weights, input) + beta * output`.
    #[allow(clippy::too_many_arguments)]
    fn convolve_and_weighted_add(&self, alpha: f32, weights: &Self::Buf, input: &SparseColumns,
                                 geometry: &ConvGeometry, beta: f32, output: &mut Self::Buf, batch: usize);

    fn max_pooling_forward(&self, input: &Self::Buf, output: &mut Self::Buf,
                           geometry: &PoolGeometry, batch: usize);

    #[allow(clippy::too_many_arguments)]
    fn add_max_pooling_gradient(&self, output_grad: &Self::Buf, input: &Self::Buf, output: &Self::Buf,
                                input_grad: &mut Self::Buf, geometry: &PoolGeometry, batch: usize);

    fn average_pooling_forward(&self, input: &Self::Buf, output: &mut Self::Buf,
                               geometry: &PoolGeometry, batch: usize);

    fn add_average_pooling_gradient(&self, output_grad: &Self::Buf, input_grad: &mut Self::Buf,
                                    geometry: &PoolGeometry, batch: usize);
}

/// Reference backend running the host kernels in [`ops_cpu`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Buf = Vec<f32>;

    fn alloc(&self, len: usize) -> Self::Buf {
        vec![0.0; len]
    }

    fn upload(&self, host: &[f32]) -> Self::Buf {
        host.to_vec()
    }

    fn download(&self, buf: &Self::Buf, out: &mut [f32]) {
        out.copy_from_slice(&buf[..out.len()]);
    }

    fn copy_range(&self, src: &Self::Buf, src_offset: usize, dst: &mut Self::Buf, dst_offset: usize, len: usize) {
        dst[dst_offset..dst_offset + len].copy_from_slice(&src[src_offset..src_offset + len]);
    }

    fn gemm(&self, a: &Self::Buf, trans_a: bool, b: &Self::Buf, trans_b: bool, c: &mut Self::Buf,
            m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
        ops_cpu::gemm(a, trans_a, b, trans_b, c, m, n, k, alpha, beta);
    }

    fn pack_convolution_input(&self, input: &Self::Buf, packed: &mut Self::Buf,
                              geometry: &ConvGeometry, batch: usize) {
        ops_cpu::pack_convolution_input(input, packed, geometry, batch);
    }

    fn unpack_convolution_input(&self, packed: &Self::Buf, input_grad: &mut Self::Buf,
                                geometry: &ConvGeometry, batch: usize) {
        ops_cpu::unpack_convolution_input(packed, input_grad, geometry, batch);
    }

    fn convolve_and_weighted_add(&self, alpha: f32, weights: &Self::Buf, input: &SparseColumns,
                                 geometry: &ConvGeometry, beta: f32, output: &mut Self::Buf, batch: usize) {
        ops_cpu::convolve_and_weighted_add(alpha, weights, input, geometry, beta, output, batch);
    }

    fn max_pooling_forward(&self, input: &Self::Buf, output: &mut Self::Buf,
                           geometry: &PoolGeometry, batch: usize) {
        ops_cpu::max_pooling_forward(input, output, geometry, batch);
    }

    fn add_max_pooling_gradient(&self, output_grad: &Self::Buf, input: &Self::Buf, output: &Self::Buf,
                                input_grad: &mut Self::Buf, geometry: &PoolGeometry, batch: usize) {
        ops_cpu::add_max_pooling_gradient(output_grad, input, output, input_grad, geometry, batch);
    }

    fn average_pooling_forward(&self, input: &Self::Buf, output: &mut Self::Buf,
                               geometry: &PoolGeometry, batch: usize) {
        ops_cpu::average_pooling_forward(input, output, geometry, batch);
    }

    fn add_average_pooling_gradient(&self, output_grad: &Self::Buf, input_grad: &mut Self::Buf,
                                    geometry: &PoolGeometry, batch: usize) {
        ops_cpu::add_average_pooling_gradient(output_grad, input_grad, geometry, batch);
    }
}
