use crate::backend::Backend;
use crate::error::Result;
use crate::layout::SampleLayout;
use crate::pool::MatrixPool;
use std::fmt;
use std::io::Write;

/// Dimensions of a neighbouring node as seen during validation.
///
/// Inputs are passed mutably so a layer can back-infer the dimensions of a
/// producer that has not been sized yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeShape {
    pub rows: usize,
    pub cols: usize,
    pub layout: Option<SampleLayout>,
}

impl NodeShape {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols, layout: None }
    }

    /// A producer of image samples; rows follow from the layout.
    pub fn image(layout: SampleLayout, cols: usize) -> Self {
        Self {
            rows: layout.size(),
            cols,
            layout: Some(layout),
        }
    }

    /// A producer whose dimensions are not known yet.
    pub fn unsized_with_layout(layout: SampleLayout, cols: usize) -> Self {
        Self {
            rows: 0,
            cols,
            layout: Some(layout),
        }
    }

    pub fn has_no_elements(&self) -> bool {
        self.rows * self.cols == 0
    }

    /// Image layout of the producer, or a plain column vector when it has none.
    pub fn sample_layout(&self) -> SampleLayout {
        self.layout.unwrap_or(SampleLayout::column_vector(self.rows))
    }
}

/// Which frames of a sequence a backward call covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameRange {
    /// The whole minibatch in one call.
    #[default]
    AllFrames,
    /// One time step of a recurrent loop.
    Step(usize),
}

impl FrameRange {
    pub fn is_all_frames(&self) -> bool {
        matches!(self, FrameRange::AllFrames)
    }
}

/// Behaviour shared by the image layers at the graph boundary.
pub trait ComputationNode<B: Backend>: fmt::Display {
    fn type_name(&self) -> &'static str;
    fn node_name(&self) -> &str;
    fn input_layout(&self) -> Option<SampleLayout>;
    fn output_layout(&self) -> Option<SampleLayout>;

    /// Acquire temporaries needed by forward evaluation.
    fn request_matrices_before_forward(&mut self, _pool: &mut MatrixPool<B>) {}

    /// Return temporaries once every input gradient has been computed.
    fn release_matrices_after_backprop(&mut self, _pool: &mut MatrixPool<B>) {}

    fn save(&self, writer: &mut dyn Write) -> Result<()>;
}
