use crate::backend::{Backend, DataLocation};
use crate::error::{ConvError, Result};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Compressed-column sparse storage; one column per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseColumns {
    col_starts: Vec<usize>,
    row_indices: Vec<usize>,
    values: Vec<f32>,
}

impl SparseColumns {
    pub fn empty(cols: usize) -> Self {
        Self {
            col_starts: vec![0; cols + 1],
            row_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Build from column-major dense data, keeping only non-zero entries.
    pub fn from_dense(data: &[f32], rows: usize, cols: usize) -> Self {
        let mut col_starts = Vec::with_capacity(cols + 1);
        let mut row_indices = Vec::new();
        let mut values = Vec::new();
        col_starts.push(0);
        for c in 0..cols {
            for (row, &v) in data[c * rows..(c + 1) * rows].iter().enumerate() {
                if v != 0.0 {
                    row_indices.push(row);
                    values.push(v);
                }
            }
            col_starts.push(values.len());
        }
        Self {
            col_starts,
            row_indices,
            values,
        }
    }

    /// Build from per-column `(row, value)` entries.
    pub fn from_columns(columns: &[Vec<(usize, f32)>]) -> Self {
        let mut sparse = Self::empty(0);
        for column in columns {
            for &(row, value) in column {
                sparse.row_indices.push(row);
                sparse.values.push(value);
            }
            sparse.col_starts.push(sparse.values.len());
        }
        sparse
    }

    pub fn num_cols(&self) -> usize {
        self.col_starts.len() - 1
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Stored `(row, value)` pairs of one column.
    pub fn column(&self, col: usize) -> impl Iterator<Item = (usize, f32)> + '_ {
        let range = self.col_starts[col]..self.col_starts[col + 1];
        self.row_indices[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    pub fn column_slice(&self, start: usize, num_cols: usize) -> Self {
        let first = self.col_starts[start];
        let last = self.col_starts[start + num_cols];
        Self {
            col_starts: self.col_starts[start..=start + num_cols]
                .iter()
                .map(|&p| p - first)
                .collect(),
            row_indices: self.row_indices[first..last].to_vec(),
            values: self.values[first..last].to_vec(),
        }
    }

    pub fn to_dense(&self, rows: usize) -> Vec<f32> {
        let mut dense = vec![0.0; rows * self.num_cols()];
        for col in 0..self.num_cols() {
            for (row, v) in self.column(col) {
                dense[col * rows + row] = v;
            }
        }
        dense
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixType {
    Dense,
    Sparse,
}

enum Storage<B: Backend> {
    Dense(B::Buf),
    Sparse(SparseColumns),
}

/// Column-major matrix whose dense storage is owned by a [`Backend`].
///
/// Samples are columns. The generation number changes whenever the contents
/// may have changed, which lets layers tell whether a cached derivative of
/// this matrix is still current.
pub struct Matrix<B: Backend> {
    storage: Storage<B>,
    rows: usize,
    cols: usize,
    capacity: usize,
    location: DataLocation,
    generation: u64,
}

impl<B: Backend> Matrix<B> {
    pub fn zeros(backend: &B, rows: usize, cols: usize) -> Self {
        let len = rows * cols;
        Self {
            storage: Storage::Dense(backend.alloc(len)),
            rows,
            cols,
            capacity: len,
            location: backend.location(),
            generation: next_generation(),
        }
    }

    /// A 0 x 0 dense matrix, the state of a freshly pooled buffer.
    pub fn empty(backend: &B) -> Self {
        Self::zeros(backend, 0, 0)
    }

    /// Upload column-major `data` of the given `(rows, cols)` shape.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != rows * cols`.
    pub fn from_host(backend: &B, data: &[f32], shape: (usize, usize)) -> Self {
        let (rows, cols) = shape;
        assert_eq!(data.len(), rows * cols, "Data length must match matrix shape");
        Self {
            storage: Storage::Dense(backend.upload(data)),
            rows,
            cols,
            capacity: data.len(),
            location: backend.location(),
            generation: next_generation(),
        }
    }

    /// Wrap compressed columns as a `rows`-row matrix. Every stored row index
    /// must be below `rows`.
    pub fn from_sparse(backend: &B, sparse: SparseColumns, rows: usize) -> Result<Self> {
        if let Some(row) = sparse.row_indices.iter().copied().find(|&r| r >= rows) {
            return Err(ConvError::logic(
                "Matrix::from_sparse",
                format!("sparse row index {} is out of range for {} rows", row, rows),
            ));
        }
        let cols = sparse.num_cols();
        Ok(Self {
            storage: Storage::Sparse(sparse),
            rows,
            cols,
            capacity: 0,
            location: backend.location(),
            generation: next_generation(),
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements the dense storage can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn location(&self) -> DataLocation {
        self.location
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn matrix_type(&self) -> MatrixType {
        match self.storage {
            Storage::Dense(_) => MatrixType::Dense,
            Storage::Sparse(_) => MatrixType::Sparse,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.matrix_type() == MatrixType::Sparse
    }

    pub fn sparse_columns(&self) -> Option<&SparseColumns> {
        match &self.storage {
            Storage::Sparse(sparse) => Some(sparse),
            Storage::Dense(_) => None,
        }
    }

    pub fn dense_buf(&self) -> Result<&B::Buf> {
        match &self.storage {
            Storage::Dense(buf) => Ok(buf),
            Storage::Sparse(_) => Err(ConvError::logic("Matrix::dense_buf", "matrix holds sparse storage")),
        }
    }

    /// Mutable dense storage; counts as a modification.
    pub fn dense_buf_mut(&mut self) -> Result<&mut B::Buf> {
        self.generation = next_generation();
        match &mut self.storage {
            Storage::Dense(buf) => Ok(buf),
            Storage::Sparse(_) => Err(ConvError::logic("Matrix::dense_buf_mut", "matrix holds sparse storage")),
        }
    }

    pub fn to_host(&self, backend: &B) -> Vec<f32> {
        match &self.storage {
            Storage::Dense(buf) => {
                let mut host = vec![0.0; self.len()];
                backend.download(buf, &mut host);
                host
            }
            Storage::Sparse(sparse) => sparse.to_dense(self.rows),
        }
    }

    /// Reinterpret the same column-major elements under a new shape.
    pub fn reshape(&mut self, rows: usize, cols: usize) -> Result<()> {
        if rows * cols != self.len() {
            return Err(ConvError::logic(
                "Matrix::reshape",
                format!("cannot reshape [{}, {}] into [{}, {}]", self.rows, self.cols, rows, cols),
            ));
        }
        if self.is_sparse() && rows != self.rows {
            return Err(ConvError::logic("Matrix::reshape", "sparse matrices keep their row count"));
        }
        self.rows = rows;
        self.cols = cols;
        Ok(())
    }

    /// Resize to dense `rows x cols`. The storage is reused when it is large
    /// enough; contents are unspecified afterwards.
    pub fn resize(&mut self, backend: &B, rows: usize, cols: usize) {
        let len = rows * cols;
        let reuse = matches!(self.storage, Storage::Dense(_)) && len <= self.capacity;
        if !reuse {
            self.storage = Storage::Dense(backend.alloc(len));
            self.capacity = len;
        }
        self.rows = rows;
        self.cols = cols;
        self.generation = next_generation();
    }

    /// Copy of columns `start..start + num_cols`, keeping the storage type.
    pub fn column_slice(&self, backend: &B, start: usize, num_cols: usize) -> Result<Self> {
        if start + num_cols > self.cols {
            return Err(ConvError::logic(
                "Matrix::column_slice",
                format!("columns {}..{} out of range for {} columns", start, start + num_cols, self.cols),
            ));
        }
        let storage = match &self.storage {
            Storage::Dense(buf) => {
                let len = self.rows * num_cols;
                let mut slice = backend.alloc(len);
                backend.copy_range(buf, start * self.rows, &mut slice, 0, len);
                Storage::Dense(slice)
            }
            Storage::Sparse(sparse) => Storage::Sparse(sparse.column_slice(start, num_cols)),
        };
        let capacity = match storage {
            Storage::Dense(_) => self.rows * num_cols,
            Storage::Sparse(_) => 0,
        };
        Ok(Self {
            storage,
            rows: self.rows,
            cols: num_cols,
            capacity,
            location: self.location,
            generation: next_generation(),
        })
    }

    /// Overwrite columns `start..start + src.cols()` with the dense `src`.
    pub fn set_column_slice(&mut self, backend: &B, start: usize, src: &Self) -> Result<()> {
        if src.rows != self.rows || start + src.cols > self.cols {
            return Err(ConvError::logic(
                "Matrix::set_column_slice",
                format!(
                    "[{}, {}] at column {} does not fit into [{}, {}]",
                    src.rows, src.cols, start, self.rows, self.cols
                ),
            ));
        }
        let rows = self.rows;
        let src_buf = src.dense_buf()?;
        let dst_buf = self.dense_buf_mut()?;
        backend.copy_range(src_buf, 0, dst_buf, start * rows, src.len());
        Ok(())
    }

    /// Convert sparse storage to dense in place; dense matrices are untouched.
    pub fn switch_to_dense(&mut self, backend: &B) {
        if let Storage::Sparse(sparse) = &self.storage {
            let buf = backend.densify(sparse, self.rows);
            self.storage = Storage::Dense(buf);
            self.capacity = self.len();
        }
    }

    /// Borrow when already dense, otherwise return a densified copy.
    pub fn as_dense(&self, backend: &B) -> Cow<'_, Self> {
        if self.is_sparse() {
            let mut dense = self.clone();
            dense.switch_to_dense(backend);
            Cow::Owned(dense)
        } else {
            Cow::Borrowed(self)
        }
    }
}

impl<B: Backend> Clone for Matrix<B> {
    fn clone(&self) -> Self {
        let storage = match &self.storage {
            Storage::Dense(buf) => Storage::Dense(buf.clone()),
            Storage::Sparse(sparse) => Storage::Sparse(sparse.clone()),
        };
        Self {
            storage,
            rows: self.rows,
            cols: self.cols,
            capacity: self.capacity,
            location: self.location,
            generation: self.generation,
        }
    }
}

impl<B: Backend> fmt::Debug for Matrix<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("type", &self.matrix_type())
            .field("location", &self.location)
            .finish()
    }
}
