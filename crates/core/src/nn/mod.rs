pub mod conv;
pub mod node;
pub mod pooling;

pub use conv::*;
pub use node::*;
pub use pooling::*;
