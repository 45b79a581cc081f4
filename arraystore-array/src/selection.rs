use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{ArrayError, ArrayResult};

/// A boolean mask with the shape of the array it selects from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BooleanMask {
    pub shape: Vec<u64>,
    /// C-order flags, one per element.
    pub values: Vec<bool>,
}

/// Which elements of an array a read or write touches.
///
/// Every selection resolves to a list of points; values are read and written in that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selection {
    /// Explicit points, one index per dimension each.
    Coordinates { points: Vec<Vec<u64>> },
    /// A hyper-rectangle, one half-open range per dimension, traversed in C order.
    Range { ranges: Vec<Range<u64>> },
    /// Every element whose mask flag is set, in C order.
    Mask { mask: BooleanMask },
}

impl Selection {
    pub fn points(points: Vec<Vec<u64>>) -> Self {
        Selection::Coordinates { points }
    }

    pub fn range(ranges: Vec<Range<u64>>) -> Self {
        Selection::Range { ranges }
    }

    pub fn mask(shape: Vec<u64>, values: Vec<bool>) -> Self {
        Selection::Mask {
            mask: BooleanMask { shape, values },
        }
    }

    /// Resolves the selection against `shape`, checking every index.
    pub fn resolve(&self, shape: &[u64]) -> ArrayResult<Vec<Vec<u64>>> {
        match self {
            Selection::Coordinates { points } => {
                for point in points {
                    check_point(point, shape)?;
                }
                Ok(points.clone())
            }
            Selection::Range { ranges } => {
                check_ndim(shape, ranges.len())?;
                for (range, &len) in ranges.iter().zip(shape) {
                    if range.start > range.end || range.end > len {
                        return Err(ArrayError::IndexOutOfBounds {
                            index: ranges.iter().map(|r| r.end).collect(),
                            shape: shape.to_vec(),
                        });
                    }
                }
                Ok(c_order(ranges))
            }
            Selection::Mask { mask } => {
                check_ndim(shape, mask.shape.len())?;
                if mask.shape != shape {
                    return Err(ArrayError::IndexOutOfBounds {
                        index: mask.shape.clone(),
                        shape: shape.to_vec(),
                    });
                }
                let full: Vec<Range<u64>> = shape.iter().map(|&len| 0..len).collect();
                let all = c_order(&full);
                if all.len() != mask.values.len() {
                    return Err(ArrayError::ValueCountMismatch {
                        expected: all.len(),
                        actual: mask.values.len(),
                    });
                }
                Ok(all
                    .into_iter()
                    .zip(&mask.values)
                    .filter_map(|(point, &keep)| keep.then_some(point))
                    .collect())
            }
        }
    }
}

fn check_ndim(shape: &[u64], actual: usize) -> ArrayResult<()> {
    if shape.len() != actual {
        return Err(ArrayError::DimensionMismatch {
            expected: shape.len(),
            actual,
        });
    }
    Ok(())
}

fn check_point(point: &[u64], shape: &[u64]) -> ArrayResult<()> {
    check_ndim(shape, point.len())?;
    if point.iter().zip(shape).any(|(&p, &len)| p >= len) {
        return Err(ArrayError::IndexOutOfBounds {
            index: point.to_vec(),
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

/// Every point of the hyper-rectangle, last dimension varying fastest.
fn c_order(ranges: &[Range<u64>]) -> Vec<Vec<u64>> {
    if ranges.iter().any(|r| r.is_empty()) {
        return Vec::new();
    }
    let mut points = Vec::new();
    let mut current: Vec<u64> = ranges.iter().map(|r| r.start).collect();
    loop {
        points.push(current.clone());
        let mut dim = ranges.len();
        loop {
            if dim == 0 {
                return points;
            }
            dim -= 1;
            current[dim] += 1;
            if current[dim] < ranges[dim].end {
                break;
            }
            current[dim] = ranges[dim].start;
        }
    }
}
