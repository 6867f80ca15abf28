//! Lock compatibility matrices.
//!
//! A compatibility matrix describes which lock modes can be held at the same time.
//! The relation is symmetric, so only the lower triangle (including the diagonal) is stored:
//!
//! ```text
//!        M0  M1  M2  M3
//!   M0 [ 0 ]
//!   M1 [ 1 ][ 2 ]
//!   M2 [ 3 ][ 4 ][ 5 ]
//!   M3 [ 6 ][ 7 ][ 8 ][ 9 ]
//! ```
//!
//! The entry for a pair `(i, j)` lives at `min(i, j) + triangular_base(max(i, j))`.

use core::fmt;
use once_cell::sync::Lazy;

use crate::error::MatrixError;

/// Index of the first entry of row `row` in the lower-triangle storage.
///
/// This is also the number of entries needed to store `row` modes.
#[inline]
pub const fn triangular_base(row: usize) -> usize {
    row * (row + 1) / 2
}

/// Index of the pair `(m1, m2)` in the lower-triangle storage.
#[inline]
pub const fn triangular_index(m1: usize, m2: usize) -> usize {
    let (lo, hi) = if m1 < m2 { (m1, m2) } else { (m2, m1) };
    lo + triangular_base(hi)
}

/// Modes of [`CompatibilityMatrix::reader_writer`].
pub mod rw_modes {
    pub const READ  : usize = 0;
    pub const WRITE : usize = 1;
}

/// Modes of [`CompatibilityMatrix::hierarchical`], the multi-granularity modes used by database lock managers.
pub mod hierarchical_modes {
    /// Intention shared.
    pub const IS  : usize = 0;
    /// Intention exclusive.
    pub const IX  : usize = 1;
    /// Shared.
    pub const S   : usize = 2;
    /// Shared + intention exclusive.
    pub const SIX : usize = 3;
    /// Exclusive.
    pub const X   : usize = 4;
}

/// Single mode, incompatible with itself: behaves like a mutex.
pub static EXCLUSIVE_MATRIX : Lazy<CompatibilityMatrix> = Lazy::new(CompatibilityMatrix::exclusive);

/// Reader/writer modes, see [`rw_modes`].
pub static READER_WRITER_MATRIX : Lazy<CompatibilityMatrix> = Lazy::new(CompatibilityMatrix::reader_writer);

/// Multi-granularity modes, see [`hierarchical_modes`].
pub static HIERARCHICAL_MATRIX : Lazy<CompatibilityMatrix> = Lazy::new(CompatibilityMatrix::hierarchical);

/// Immutable, symmetric relation telling which lock modes can be held concurrently.
#[derive(Clone, PartialEq, Eq)]
pub struct CompatibilityMatrix {
    mode_count : usize,
    table      : Box<[bool]>,
}

impl CompatibilityMatrix {
    /// Create a matrix from its lower triangle, in row order (see the [module docs](self)).
    ///
    /// `table` must contain exactly `mode_count * (mode_count + 1) / 2` entries.
    pub fn new(mode_count: usize, table: Vec<bool>) -> Result<Self, MatrixError> {
        if mode_count == 0 {
            return Err(MatrixError::NoModes);
        }
        let expected = triangular_base(mode_count);
        if table.len() != expected {
            return Err(MatrixError::TableSize { expected, found: table.len() });
        }
        Ok(Self { mode_count, table: table.into_boxed_slice() })
    }

    /// Create a matrix by evaluating `f(i, j)` for every canonical pair `j <= i`.
    pub fn from_fn<F>(mode_count: usize, mut f: F) -> Result<Self, MatrixError>
    where
        F : FnMut(usize, usize) -> bool
    {
        let table = (0..mode_count)
            .flat_map(|row| (0..=row).map(move |col| (row, col)))
            .map(|(row, col)| f(row, col))
            .collect();
        Self::new(mode_count, table)
    }

    /// Create a matrix where only the listed pairs are compatible.
    ///
    /// The order within a pair doesn't matter, `(a, b)` also makes `(b, a)` compatible.
    pub fn from_pairs(mode_count: usize, pairs: &[(usize, usize)]) -> Result<Self, MatrixError> {
        if mode_count == 0 {
            return Err(MatrixError::NoModes);
        }

        let mut table = vec![false; triangular_base(mode_count)];
        for &(a, b) in pairs {
            let out_of_range = if a >= mode_count { Some(a) } else if b >= mode_count { Some(b) } else { None };
            if let Some(mode) = out_of_range {
                return Err(MatrixError::ModeOutOfRange { mode, mode_count });
            }
            table[triangular_index(a, b)] = true;
        }
        Self::new(mode_count, table)
    }

    /// A single mode that is incompatible with itself.
    pub fn exclusive() -> Self {
        Self { mode_count: 1, table: Box::new([false]) }
    }

    /// Readers are compatible with each other, a writer is compatible with nothing.
    pub fn reader_writer() -> Self {
        use rw_modes::*;
        let mut table = vec![false; triangular_base(2)];
        table[triangular_index(READ, READ)] = true;
        Self { mode_count: 2, table: table.into_boxed_slice() }
    }

    /// The classic multi-granularity matrix over [`hierarchical_modes`].
    ///
    /// |     | IS | IX | S | SIX | X |
    /// |-----|----|----|---|-----|---|
    /// | IS  | ✓  | ✓  | ✓ | ✓   |   |
    /// | IX  | ✓  | ✓  |   |     |   |
    /// | S   | ✓  |    | ✓ |     |   |
    /// | SIX | ✓  |    |   |     |   |
    /// | X   |    |    |   |     |   |
    pub fn hierarchical() -> Self {
        use hierarchical_modes::*;
        let pairs = [(IS, IS), (IS, IX), (IS, S), (IS, SIX), (IX, IX), (S, S)];

        let mut table = vec![false; triangular_base(5)];
        for (a, b) in pairs {
            table[triangular_index(a, b)] = true;
        }
        Self { mode_count: 5, table: table.into_boxed_slice() }
    }

    /// Number of modes this matrix describes.
    #[inline]
    pub fn mode_count(&self) -> usize {
        self.mode_count
    }

    /// Check whether the modes `m1` and `m2` can be held concurrently.
    ///
    /// Modes outside of `0..mode_count` are never compatible with anything.
    #[inline]
    pub fn compatible(&self, m1: usize, m2: usize) -> bool {
        if m1 >= self.mode_count || m2 >= self.mode_count {
            return false;
        }
        self.compatible_unchecked(m1, m2)
    }

    /// Both modes must be in range.
    #[inline]
    pub(crate) fn compatible_unchecked(&self, m1: usize, m2: usize) -> bool {
        self.table[triangular_index(m1, m2)]
    }
}

impl fmt::Debug for CompatibilityMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Row<'a>(&'a [bool]);
        impl fmt::Debug for Row<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_list().entries(self.0.iter().map(|&b| b as u8)).finish()
            }
        }

        let mut list = f.debug_list();
        for row in 0..self.mode_count {
            let start = triangular_base(row);
            list.entry(&Row(&self.table[start..start + row + 1]));
        }
        list.finish()
    }
}
