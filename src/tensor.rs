use crate::shape::DType;

/// A flat buffer of tensor elements, laid out row-major over the logical
/// lengths of the shape it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub enum Values {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl Values {
    pub fn dtype(&self) -> DType {
        match self {
            Self::F32(_) => DType::F32,
            Self::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Self::F32(vec![0.0; len]),
            DType::I32 => Self::I32(vec![0; len]),
        }
    }

    /// Builds a buffer of `n` elements where the `k`-th element is copied
    /// from `self` at `map(k)`.
    pub fn select(&self, n: usize, map: impl Fn(usize) -> usize) -> Self {
        match self {
            Self::F32(v) => Self::F32((0..n).map(|k| v[map(k)]).collect()),
            Self::I32(v) => Self::I32((0..n).map(|k| v[map(k)]).collect()),
        }
    }

    /// Element-wise type conversion.
    pub fn convert(&self, dtype: DType) -> Self {
        match (self, dtype) {
            (Self::F32(v), DType::I32) => Self::I32(v.iter().map(|&x| x as i32).collect()),
            (Self::I32(v), DType::F32) => Self::F32(v.iter().map(|&x| x as f32).collect()),
            (v, _) => v.clone(),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Self::F32(v) => Some(v),
            Self::I32(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            Self::I32(v) => Some(v),
            Self::F32(_) => None,
        }
    }
}
