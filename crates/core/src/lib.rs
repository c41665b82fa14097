pub mod backend;
pub mod config;
pub mod error;
pub mod layout;
pub mod matrix;
pub mod nn;
pub mod ops_cpu;
pub mod persist;
pub mod pool;

pub use backend::{Backend, CpuBackend, DataLocation};
pub use config::{ConvolutionConfig, LayerConfig, PoolingConfig};
pub use error::{ConvError, Result};
pub use layout::{ConvGeometry, PoolGeometry, SampleLayout};
pub use matrix::{Matrix, MatrixType, SparseColumns};
pub use pool::{MatrixPool, MatrixPoolStats};
