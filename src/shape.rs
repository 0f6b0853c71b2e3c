use std::fmt;

/// Element type of a tensor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    I32,
}

impl fmt::Debug for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::I32 => write!(f, "i32"),
        }
    }
}

/// Tensor shape: an element type, per-axis lengths and per-axis strides.
///
/// Strides describe how the logical axes map onto a flat buffer. A shape is
/// *standard* when its strides are the packed row-major strides of its
/// lengths, and a *view* otherwise (permuted, sliced or broadcast).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dtype: DType,
    lens: Vec<usize>,
    strides: Vec<usize>,
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:?}", self.dtype, self.lens)?;
        if !self.is_standard() {
            write!(f, "/{:?}", self.strides)?;
        }
        Ok(())
    }
}

impl Shape {
    /// A packed row-major shape.
    pub fn standard(dtype: DType, lens: impl Into<Vec<usize>>) -> Self {
        let lens = lens.into();
        let strides = packed_strides(&lens);
        Self { dtype, lens, strides }
    }

    /// A shape with explicit strides. `lens` and `strides` must have equal rank.
    pub fn with_strides(dtype: DType, lens: impl Into<Vec<usize>>, strides: impl Into<Vec<usize>>) -> Self {
        let lens = lens.into();
        let strides = strides.into();
        assert_eq!(lens.len(), strides.len(), "rank mismatch between lens and strides");
        Self { dtype, lens, strides }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn lens(&self) -> &[usize] {
        &self.lens
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.lens.len()
    }

    /// Number of logical elements.
    pub fn elements(&self) -> usize {
        self.lens.iter().product()
    }

    /// Number of buffer slots needed to back this shape.
    pub fn element_space(&self) -> usize {
        if self.elements() == 0 {
            return 0;
        }

        1 + self.lens.iter().zip(&self.strides).map(|(l, s)| (l - 1) * s).sum::<usize>()
    }

    pub fn is_standard(&self) -> bool {
        self.strides == packed_strides(&self.lens)
    }

    /// True if the shape is a pure axis permutation of a packed shape,
    /// i.e. non-standard but with no broadcast or sliced axes.
    pub fn is_transposed(&self) -> bool {
        if self.is_standard() {
            return false;
        }

        let perm = find_permutation(self);
        let lens = reorder(&perm, &self.lens);
        let strides = reorder(&perm, &self.strides);
        strides == packed_strides(&lens)
    }

    /// True if `axis` is a stride-0 axis replicating a single element.
    pub fn is_broadcasted(&self, axis: usize) -> bool {
        self.lens[axis] > 1 && self.strides[axis] == 0
    }

    pub fn is_any_broadcasted(&self) -> bool {
        (0..self.rank()).any(|axis| self.is_broadcasted(axis))
    }

    /// Buffer offset of a multi-index, following the strides.
    pub fn index(&self, multi: &[usize]) -> usize {
        assert_eq!(multi.len(), self.rank(), "multi-index rank mismatch");
        multi.iter().zip(&self.strides).map(|(i, s)| i * s).sum()
    }

    /// Multi-index of the `flat`-th logical element, in row-major order over
    /// the lengths. Inverse of [`Shape::index`] for standard shapes.
    pub fn multi(&self, flat: usize) -> Vec<usize> {
        row_major_multi(&self.lens, flat)
    }
}

/// Packed row-major strides for the given lengths.
pub fn packed_strides(lens: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; lens.len()];
    for i in (0..lens.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * lens[i + 1];
    }
    strides
}

/// Row-major multi-index of the `flat`-th element of a tensor with the given lengths.
pub fn row_major_multi(lens: &[usize], flat: usize) -> Vec<usize> {
    let mut multi = vec![0; lens.len()];
    let mut rem = flat;
    for i in (0..lens.len()).rev() {
        multi[i] = rem % lens[i];
        rem /= lens[i];
    }
    multi
}

/// Row-major flat index of a multi-index for the given lengths.
pub fn row_major_index(lens: &[usize], multi: &[usize]) -> usize {
    assert_eq!(lens.len(), multi.len(), "multi-index rank mismatch");
    multi.iter().zip(lens).fold(0, |acc, (&i, &l)| acc * l + i)
}

/// The permutation that sorts the shape's axes into descending stride order,
/// breaking stride ties by descending length. For a standard shape this is the
/// identity; for a transposed view it recovers the permutation that was applied.
pub fn find_permutation(shape: &Shape) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..shape.rank()).collect();
    perm.sort_by(|&a, &b| {
        (shape.strides[b], shape.lens[b]).cmp(&(shape.strides[a], shape.lens[a]))
    });
    perm
}

/// Inverse permutation: `invert_permutation(p)[p[i]] == i`.
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inverse[p] = i;
    }
    inverse
}

/// Applies a permutation: `reorder(p, v)[i] == v[p[i]]`.
pub fn reorder<T: Copy>(perm: &[usize], values: &[T]) -> Vec<T> {
    assert_eq!(perm.len(), values.len(), "permutation rank mismatch");
    perm.iter().map(|&i| values[i]).collect()
}

pub fn is_identity_permutation(perm: &[usize]) -> bool {
    perm.iter().enumerate().all(|(i, &p)| i == p)
}

/// Checks that `perm` visits every axis below its rank exactly once.
pub fn is_valid_permutation(perm: &[usize]) -> bool {
    let mut seen = vec![false; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return false;
        }
        seen[p] = true;
    }
    true
}
