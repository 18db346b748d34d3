use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, GraphResult};

// ---------------------------------------------------------------------------
// Shape: concrete tensor extents
// ---------------------------------------------------------------------------

/// Concrete tensor extents. Displays like a numpy shape: `(3, 4, 5)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements. A rank-0 shape holds one element.
    ///
    /// Only for shapes already known to be bounded (profile-checked or
    /// reported by an engine); use `checked_volume` for caller input.
    pub fn volume(&self) -> usize {
        self.0.iter().product()
    }

    /// `None` when the element count overflows `usize`.
    pub fn checked_volume(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Size in bytes of a tensor of this shape holding `dtype` elements.
    pub fn byte_len(&self, dtype: DataType) -> GraphResult<usize> {
        self.checked_volume()
            .and_then(|n| n.checked_mul(dtype.size()))
            .ok_or_else(|| GraphError::ShapeTooLarge {
                shape: self.clone(),
            })
    }

    pub fn to_i64(&self) -> Vec<i64> {
        self.0.iter().map(|&d| d as i64).collect()
    }

    /// Convert vendor dims back into a shape. Negative extents mean the
    /// shape is not yet resolved.
    pub fn from_i64(dims: &[i64]) -> Option<Self> {
        dims.iter()
            .map(|&d| usize::try_from(d).ok())
            .collect::<Option<Vec<_>>>()
            .map(Self)
    }
}

impl From<[usize; 3]> for Shape {
    fn from(dims: [usize; 3]) -> Self {
        Self(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

// ---------------------------------------------------------------------------
// Dims: declared extents, -1 marks a dynamic dimension
// ---------------------------------------------------------------------------

pub const DYNAMIC: i64 = -1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dims(pub Vec<i64>);

impl Dims {
    /// All-dynamic dims of the given rank.
    pub fn dynamic(rank: usize) -> Self {
        Self(vec![DYNAMIC; rank])
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_dynamic(&self) -> bool {
        self.0.iter().any(|&d| d == DYNAMIC)
    }

    /// Whether a concrete shape is compatible with the declared dims.
    pub fn admits(&self, shape: &Shape) -> bool {
        self.rank() == shape.rank()
            && self
                .0
                .iter()
                .zip(shape.dims())
                .all(|(&d, &s)| d == DYNAMIC || d as usize == s)
    }
}

// ---------------------------------------------------------------------------
// DataType: TensorRT element types
// ---------------------------------------------------------------------------

/// Element types, numbered as TensorRT's `nvinfer1::DataType`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Half,
    Int8,
    Int32,
    Bool,
    Uint8,
    Fp8,
    Bf16,
    Int64,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            DataType::Float | DataType::Int32 => 4,
            DataType::Half | DataType::Bf16 => 2,
            DataType::Int8 | DataType::Bool | DataType::Uint8 | DataType::Fp8 => 1,
            DataType::Int64 => 8,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            DataType::Float => 0,
            DataType::Half => 1,
            DataType::Int8 => 2,
            DataType::Int32 => 3,
            DataType::Bool => 4,
            DataType::Uint8 => 5,
            DataType::Fp8 => 6,
            DataType::Bf16 => 7,
            DataType::Int64 => 8,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => DataType::Float,
            1 => DataType::Half,
            2 => DataType::Int8,
            3 => DataType::Int32,
            4 => DataType::Bool,
            5 => DataType::Uint8,
            6 => DataType::Fp8,
            7 => DataType::Bf16,
            8 => DataType::Int64,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// OptimizationProfile
// ---------------------------------------------------------------------------

/// min/opt/max shape bounds for one dynamic input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationProfile {
    pub input: String,
    pub min: Shape,
    pub opt: Shape,
    pub max: Shape,
}

impl OptimizationProfile {
    pub fn new(
        input: impl Into<String>,
        min: impl Into<Shape>,
        opt: impl Into<Shape>,
        max: impl Into<Shape>,
    ) -> Self {
        Self {
            input: input.into(),
            min: min.into(),
            opt: opt.into(),
            max: max.into(),
        }
    }

    /// Check rank agreement with `declared` and `min <= opt <= max` per dim.
    pub fn validate(&self, declared: &Dims) -> GraphResult<()> {
        let invalid = |reason: String| GraphError::InvalidProfile {
            tensor: self.input.clone(),
            reason,
        };
        for (label, shape) in [("min", &self.min), ("opt", &self.opt), ("max", &self.max)] {
            if shape.rank() != declared.rank() {
                return Err(invalid(format!(
                    "{label} shape {shape} has rank {}, input is rank {}",
                    shape.rank(),
                    declared.rank()
                )));
            }
            if !declared.admits(shape) {
                return Err(invalid(format!(
                    "{label} shape {shape} disagrees with static dims {:?}",
                    declared.0
                )));
            }
        }
        let ordered = (0..declared.rank()).all(|i| {
            self.min.dims()[i] <= self.opt.dims()[i] && self.opt.dims()[i] <= self.max.dims()[i]
        });
        if !ordered {
            return Err(invalid(format!(
                "expected min <= opt <= max, got {} / {} / {}",
                self.min, self.opt, self.max
            )));
        }
        Ok(())
    }

    /// Bounds check for a concrete shape, reported the way a bind fails.
    pub fn check(&self, shape: &Shape) -> GraphResult<()> {
        if shape.rank() != self.min.rank() {
            return Err(GraphError::RankMismatch {
                tensor: self.input.clone(),
                expected: self.min.rank(),
                actual: shape.rank(),
            });
        }
        let inside = shape
            .dims()
            .iter()
            .zip(self.min.dims().iter().zip(self.max.dims()))
            .all(|(&s, (&lo, &hi))| lo <= s && s <= hi);
        if inside {
            Ok(())
        } else {
            Err(GraphError::ShapeOutOfProfile {
                tensor: self.input.clone(),
                shape: shape.clone(),
                min: self.min.clone(),
                max: self.max.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_profile() -> OptimizationProfile {
        OptimizationProfile::new("inputT0", [1, 1, 1], [3, 4, 5], [6, 8, 10])
    }

    #[test]
    fn shape_display_matches_numpy() {
        assert_eq!(Shape::new([3, 4, 5]).to_string(), "(3, 4, 5)");
        assert_eq!(Shape::new([7]).to_string(), "(7,)");
        assert_eq!(Shape::new(Vec::new()).to_string(), "()");
    }

    #[test]
    fn volume_and_vendor_dims() {
        let s = Shape::new([2, 3, 4]);
        assert_eq!(s.volume(), 24);
        assert_eq!(Shape::from_i64(&s.to_i64()), Some(s));
        assert_eq!(Shape::from_i64(&[-1, 3]), None);
    }

    #[test]
    fn oversized_shapes_do_not_overflow() {
        let huge = Shape::new([usize::MAX, 2, 1]);
        assert_eq!(huge.checked_volume(), None);
        assert!(matches!(
            huge.byte_len(DataType::Float),
            Err(GraphError::ShapeTooLarge { .. })
        ));
        assert_eq!(Shape::new([2, 3, 4]).byte_len(DataType::Float).unwrap(), 96);
        assert_eq!(Shape::new(Vec::new()).checked_volume(), Some(1));
    }

    #[test]
    fn profile_bounds_are_inclusive() {
        let p = demo_profile();
        assert!(p.check(&Shape::new([1, 1, 1])).is_ok());
        assert!(p.check(&Shape::new([6, 8, 10])).is_ok());
        assert!(matches!(
            p.check(&Shape::new([6, 8, 11])),
            Err(GraphError::ShapeOutOfProfile { .. })
        ));
        assert!(matches!(
            p.check(&Shape::new([0, 4, 5])),
            Err(GraphError::ShapeOutOfProfile { .. })
        ));
        assert!(matches!(
            p.check(&Shape::new([3, 4])),
            Err(GraphError::RankMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn profile_validation() {
        let declared = Dims::dynamic(3);
        assert!(demo_profile().validate(&declared).is_ok());

        let unordered = OptimizationProfile::new("inputT0", [1, 1, 1], [7, 4, 5], [6, 8, 10]);
        assert!(unordered.validate(&declared).is_err());

        let wrong_rank = demo_profile();
        assert!(wrong_rank.validate(&Dims::dynamic(2)).is_err());

        let static_dim = Dims(vec![DYNAMIC, 4, DYNAMIC]);
        assert!(demo_profile().validate(&static_dim).is_err());
        let fixed = OptimizationProfile::new("inputT0", [1, 4, 1], [3, 4, 5], [6, 4, 10]);
        assert!(fixed.validate(&static_dim).is_ok());
    }

    #[test]
    fn dtype_codes_round_trip() {
        for code in 0..9 {
            let dtype = DataType::from_code(code).unwrap();
            assert_eq!(dtype.code(), code);
        }
        assert_eq!(DataType::from_code(42), None);
        assert_eq!(DataType::Float.size(), 4);
        assert_eq!(DataType::Half.size(), 2);
    }
}
