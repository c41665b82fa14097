pub mod matmul;
pub mod pack;
pub mod conv1d;
pub mod pooling;

pub use matmul::*;
pub use pack::*;
pub use conv1d::*;
pub use pooling::*;
