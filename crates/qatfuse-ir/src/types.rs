//! Element and tensor type descriptors for the qatfuse IR.

/// Width of a scalar type in bytes.
pub type Bytes = u8;

/// The kind of a scalar type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ScalarKind {
    /// Boolean.
    Bool,
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
}

/// A scalar type: kind + byte width.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: Bytes,
}

impl Scalar {
    pub const BOOL: Self = Self {
        kind: ScalarKind::Bool,
        width: 1,
    };
    pub const I8: Self = Self {
        kind: ScalarKind::Sint,
        width: 1,
    };
    pub const U8: Self = Self {
        kind: ScalarKind::Uint,
        width: 1,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        width: 4,
    };
    pub const I64: Self = Self {
        kind: ScalarKind::Sint,
        width: 8,
    };
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        width: 4,
    };

    /// Inclusive integer range representable by this scalar, if it is an integer.
    pub fn integer_range(self) -> Option<(i64, i64)> {
        let bits = u32::from(self.width) * 8;
        match self.kind {
            ScalarKind::Sint if bits < 64 => {
                Some((-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1))
            }
            ScalarKind::Sint => Some((i64::MIN, i64::MAX)),
            ScalarKind::Uint if bits < 64 => Some((0, (1i64 << bits) - 1)),
            ScalarKind::Uint => Some((0, i64::MAX)),
            ScalarKind::Bool | ScalarKind::Float => None,
        }
    }
}

/// Shape and element type of a tensor value, as observed while tracing.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct TensorMeta {
    /// Concrete dimensions.
    pub shape: Vec<usize>,
    /// Element type.
    pub scalar: Scalar,
}

impl TensorMeta {
    /// Creates tensor metadata from a shape and element type.
    pub fn new(shape: impl Into<Vec<usize>>, scalar: Scalar) -> Self {
        Self {
            shape: shape.into(),
            scalar,
        }
    }

    /// Shorthand for an `f32` tensor of the given shape.
    pub fn f32(shape: impl Into<Vec<usize>>) -> Self {
        Self::new(shape, Scalar::F32)
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total element count.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}
