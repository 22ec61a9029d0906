use crate::error::CombineError;

/// Dense row-major `nrows x ncols` accumulator.
#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    nrows: usize,
    ncols: usize,
    cells: Vec<f32>,
}

impl Matrix {
    /// Allocates a zeroed matrix, reporting failure instead of aborting when the
    /// buffer cannot be obtained.
    pub fn zeros(nrows: usize, ncols: usize) -> Result<Self, CombineError> {
        let len = nrows
            .checked_mul(ncols)
            .ok_or(CombineError::Allocation { nrows, ncols })?;
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(len)
            .map_err(|_| CombineError::Allocation { nrows, ncols })?;
        cells.resize(len, 0.0);
        Ok(Self {
            nrows,
            ncols,
            cells,
        })
    }

    /// Bytes needed for a matrix of the given shape, saturating on overflow.
    pub fn required_bytes(nrows: usize, ncols: usize) -> u64 {
        (nrows as u64)
            .saturating_mul(ncols as u64)
            .saturating_mul(std::mem::size_of::<f32>() as u64)
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.cells[row * self.ncols..(row + 1) * self.ncols]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [f32] {
        &mut self.cells[row * self.ncols..(row + 1) * self.ncols]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.cells
    }

    /// Elementwise `self += other`. Both matrices must share a shape.
    pub fn add_assign(&mut self, other: &Matrix) {
        debug_assert_eq!((self.nrows, self.ncols), (other.nrows, other.ncols));
        for (total, partial) in self.cells.iter_mut().zip(&other.cells) {
            *total += *partial;
        }
    }

    /// Resets every cell to zero, keeping the allocation.
    pub fn clear(&mut self) {
        self.cells.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_has_requested_shape() {
        let m = Matrix::zeros(2, 3).unwrap();
        assert_eq!(m.nrows(), 2);
        assert_eq!(m.ncols(), 3);
        assert!(m.as_slice().iter().all(|&v| v == 0.0));
        assert_eq!(m.row(1).len(), 3);
    }

    #[test]
    fn overflowing_dimensions_report_allocation_error() {
        let err = Matrix::zeros(usize::MAX, 2).unwrap_err();
        assert!(matches!(
            err,
            CombineError::Allocation {
                nrows: usize::MAX,
                ncols: 2
            }
        ));
        assert_eq!(Matrix::required_bytes(usize::MAX, 2), u64::MAX);
    }

    #[test]
    fn add_assign_and_clear() {
        let mut total = Matrix::zeros(2, 2).unwrap();
        let mut partial = Matrix::zeros(2, 2).unwrap();
        partial.row_mut(0).copy_from_slice(&[1.0, 2.0]);
        partial.row_mut(1).copy_from_slice(&[3.0, 4.0]);
        total.add_assign(&partial);
        total.add_assign(&partial);
        assert_eq!(total.as_slice(), &[2.0, 4.0, 6.0, 8.0]);
        assert_eq!(total.row(1), &[6.0, 8.0]);

        partial.clear();
        assert!(partial.as_slice().iter().all(|&v| v == 0.0));
    }
}
