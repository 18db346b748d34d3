use std::fmt;

use crate::shape::Shape;

/// Row-major `f32` tensor in host memory.
#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    pub shape: Shape,
    pub data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: Shape, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.volume(), data.len());
        Self { shape, data }
    }

    /// `0, 1, 2, ...` laid out in `shape`.
    pub fn arange(shape: Shape) -> Self {
        let data = (0..shape.volume()).map(|i| i as f32).collect();
        Self { shape, data }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    /// Inverse of `to_bytes`; trailing bytes past `shape.volume()` elements
    /// are ignored.
    pub fn from_bytes(shape: Shape, bytes: &[u8]) -> Self {
        let data = bytes
            .chunks_exact(4)
            .take(shape.volume())
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self { shape, data }
    }
}

fn element(v: f32) -> String {
    if v.is_finite() && v.fract() == 0.0 {
        format!("{v:.0}.")
    } else {
        format!("{v}")
    }
}

fn write_block(
    f: &mut fmt::Formatter<'_>,
    cells: &[String],
    dims: &[usize],
    depth: usize,
    width: usize,
) -> fmt::Result {
    write!(f, "[")?;
    if dims.len() == 1 {
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{cell:>width$}")?;
        }
    } else {
        let stride: usize = dims[1..].iter().product();
        for i in 0..dims[0] {
            if i > 0 {
                write!(f, "{}", "\n".repeat(dims.len() - 1))?;
                write!(f, "{}", " ".repeat(depth + 1))?;
            }
            let block = &cells[i * stride..(i + 1) * stride];
            write_block(f, block, &dims[1..], depth + 1, width)?;
        }
    }
    write!(f, "]")
}

/// numpy-style nested rendering: rows on their own lines, a blank line
/// between 2-D slabs, right-aligned cells.
impl fmt::Display for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells: Vec<String> = self.data.iter().map(|&v| element(v)).collect();
        if self.shape.rank() == 0 {
            return write!(f, "{}", cells.first().map(String::as_str).unwrap_or(""));
        }
        let width = cells.iter().map(String::len).max().unwrap_or(0);
        write_block(f, &cells, self.shape.dims(), 0, width)
    }
}
