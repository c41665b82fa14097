#![allow(dead_code)]

use convnet_core::backend::{Backend, CpuBackend, DataLocation};
use convnet_core::layout::{ConvGeometry, PoolGeometry};
use convnet_core::matrix::{Matrix, SparseColumns};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Host kernels behind a backend that reports its data as device resident,
/// which is what routes sparse one-row inputs onto the direct path.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceBackend;

impl Backend for DeviceBackend {
    type Buf = Vec<f32>;

    fn location(&self) -> DataLocation {
        DataLocation::Device
    }

    fn alloc(&self, len: usize) -> Self::Buf {
        CpuBackend.alloc(len)
    }

    fn upload(&self, host: &[f32]) -> Self::Buf {
        CpuBackend.upload(host)
    }

    fn download(&self, buf: &Self::Buf, out: &mut [f32]) {
        CpuBackend.download(buf, out)
    }

    fn copy_range(&self, src: &Self::Buf, src_offset: usize, dst: &mut Self::Buf, dst_offset: usize, len: usize) {
        CpuBackend.copy_range(src, src_offset, dst, dst_offset, len)
    }

    fn gemm(&self, a: &Self::Buf, trans_a: bool, b: &Self::Buf, trans_b: bool, c: &mut Self::Buf,
            m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
        CpuBackend.gemm(a, trans_a, b, trans_b, c, m, n, k, alpha, beta)
    }

    fn pack_convolution_input(&self, input: &Self::Buf, packed: &mut Self::Buf,
                              geometry: &ConvGeometry, batch: usize) {
        CpuBackend.pack_convolution_input(input, packed, geometry, batch)
    }

    fn unpack_convolution_input(&self, packed: &Self::Buf, input_grad: &mut Self::Buf,
                                geometry: &ConvGeometry, batch: usize) {
        CpuBackend.unpack_convolution_input(packed, input_grad, geometry, batch)
    }

    fn convolve_and_weighted_add(&self, alpha: f32, weights: &Self::Buf, input: &SparseColumns,
                                 geometry: &ConvGeometry, beta: f32, output: &mut Self::Buf, batch: usize) {
        CpuBackend.convolve_and_weighted_add(alpha, weights, input, geometry, beta, output, batch)
    }

    fn max_pooling_forward(&self, input: &Self::Buf, output: &mut Self::Buf,
                           geometry: &PoolGeometry, batch: usize) {
        CpuBackend.max_pooling_forward(input, output, geometry, batch)
    }

    fn add_max_pooling_gradient(&self, output_grad: &Self::Buf, input: &Self::Buf, output: &Self::Buf,
                                input_grad: &mut Self::Buf, geometry: &PoolGeometry, batch: usize) {
        CpuBackend.add_max_pooling_gradient(output_grad, input, output, input_grad, geometry, batch)
    }

    fn average_pooling_forward(&self, input: &Self::Buf, output: &mut Self::Buf,
                               geometry: &PoolGeometry, batch: usize) {
        CpuBackend.average_pooling_forward(input, output, geometry, batch)
    }

    fn add_average_pooling_gradient(&self, output_grad: &Self::Buf, input_grad: &mut Self::Buf,
                                    geometry: &PoolGeometry, batch: usize) {
        CpuBackend.add_average_pooling_gradient(output_grad, input_grad, geometry, batch)
    }
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_values(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

pub fn random_matrix<B: Backend>(backend: &B, rng: &mut StdRng, rows: usize, cols: usize) -> Matrix<B> {
    Matrix::from_host(backend, &random_values(rng, rows * cols), (rows, cols))
}
