use crate::backend::Backend;
use crate::matrix::Matrix;

/// Recycles temporary matrices between evaluation rounds.
///
/// Layers request their scratch matrices before forward evaluation and hand
/// them back after the matching backward pass. Returned matrices keep their
/// storage, so a later request can resize without reallocating.
pub struct MatrixPool<B: Backend> {
    free: Vec<Matrix<B>>,
    allocated_count: usize,
    outstanding: usize,
    peak_capacity: usize,
}

impl<B: Backend> MatrixPool<B> {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            allocated_count: 0,
            outstanding: 0,
            peak_capacity: 0,
        }
    }

    /// Hand out the cached matrix with the largest storage, or a fresh empty one.
    pub fn request(&mut self, backend: &B) -> Matrix<B> {
        self.outstanding += 1;
        let largest = self
            .free
            .iter()
            .enumerate()
            .max_by_key(|(_, m)| m.capacity())
            .map(|(i, _)| i);
        match largest {
            Some(i) => self.free.swap_remove(i),
            None => {
                self.allocated_count += 1;
                Matrix::empty(backend)
            }
        }
    }

    pub fn release(&mut self, matrix: Matrix<B>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.peak_capacity = self.peak_capacity.max(matrix.capacity());
        self.free.push(matrix);
    }

    pub fn stats(&self) -> MatrixPoolStats {
        MatrixPoolStats {
            allocated_count: self.allocated_count,
            cached_count: self.free.len(),
            outstanding_count: self.outstanding,
            peak_capacity: self.peak_capacity,
        }
    }
}

impl<B: Backend> Default for MatrixPool<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixPoolStats {
    pub allocated_count: usize,
    pub cached_count: usize,
    pub outstanding_count: usize,
    /// Largest element capacity seen on release.
    pub peak_capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    #[test]
    fn released_matrices_are_recycled() {
        let b = CpuBackend;
        let mut pool = MatrixPool::new();
        let mut m = pool.request(&b);
        m.resize(&b, 8, 8);
        assert_eq!(pool.stats().outstanding_count, 1);
        pool.release(m);

        let again = pool.request(&b);
        assert_eq!(again.capacity(), 64);
        let stats = pool.stats();
        assert_eq!(stats.allocated_count, 1);
        assert_eq!(stats.cached_count, 0);
        assert_eq!(stats.peak_capacity, 64);
    }
}
