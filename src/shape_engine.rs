use crate::core::types::{DataType, Dim, Shape, TensorValue, ValueData, element_count};
use crate::error::ShapeError;
use crate::tensor_util::MAX_MATERIALIZED_ELEMENTS;

pub struct ShapeEngine;

/// Resolved slice of one dense input axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSlice {
    Range { begin: i64, stride: i64, size: usize },
    /// Extent depends on an unknown input dimension.
    Unknown,
    /// Single element at `index`; the axis is dropped from the output.
    Shrink { index: i64 },
}

/// Output axis of a strided slice, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputAxis {
    NewAxis,
    Dense(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePlan {
    pub axes: Vec<AxisSlice>,
    pub output: Vec<OutputAxis>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SliceMasks {
    pub begin: i64,
    pub end: i64,
    pub ellipsis: i64,
    pub new_axis: i64,
    pub shrink_axis: i64,
}

impl SlicePlan {
    pub fn output_shape(&self) -> Shape {
        let dims = self
            .output
            .iter()
            .filter_map(|axis| match axis {
                OutputAxis::NewAxis => Some(Dim::Static(1)),
                OutputAxis::Dense(i) => match self.axes[*i] {
                    AxisSlice::Range { size, .. } => Some(Dim::Static(size)),
                    AxisSlice::Unknown => Some(Dim::Unknown),
                    AxisSlice::Shrink { .. } => None,
                },
            })
            .collect();
        Shape { dims: Some(dims) }
    }
}

impl ShapeEngine {
    /// Numpy-style broadcast of two shapes, aligned from the right.
    pub fn broadcast(s1: &Shape, s2: &Shape) -> Result<Shape, ShapeError> {
        let (d1, d2) = match (&s1.dims, &s2.dims) {
            (Some(a), Some(b)) => (a, b),
            _ => return Ok(Shape::unknown()),
        };
        let mut res = Vec::with_capacity(d1.len().max(d2.len()));
        let (mut i, mut j) = (d1.len() as isize - 1, d2.len() as isize - 1);
        while i >= 0 || j >= 0 {
            let a = if i >= 0 { Some(d1[i as usize]) } else { None };
            let b = if j >= 0 { Some(d2[j as usize]) } else { None };
            res.push(match (a, b) {
                (Some(a), Some(b)) => Self::broadcast_dims(a, b)
                    .ok_or_else(|| ShapeError::Broadcast(s1.to_string(), s2.to_string()))?,
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => break,
            });
            i -= 1;
            j -= 1;
        }
        res.reverse();
        Ok(Shape { dims: Some(res) })
    }

    fn broadcast_dims(a: Dim, b: Dim) -> Option<Dim> {
        match (a, b) {
            (Dim::Static(1), other) | (other, Dim::Static(1)) => Some(other),
            (Dim::Unknown, other) | (other, Dim::Unknown) => Some(other),
            (Dim::Static(x), Dim::Static(y)) if x == y => Some(Dim::Static(x)),
            _ => None,
        }
    }

    pub fn normalize_axis(axis: i64, rank: usize, op: &str) -> Result<usize, ShapeError> {
        let r = rank as i64;
        let a = if axis < 0 { axis + r } else { axis };
        if a < 0 || a >= r {
            return Err(ShapeError::invalid(op, format!("axis {} out of range for rank {}", axis, rank)));
        }
        Ok(a as usize)
    }

    pub fn reduce(shape: &Shape, axes: &[i64], keep_dims: bool) -> Result<Shape, ShapeError> {
        let Some(dims) = &shape.dims else {
            return Ok(Shape::unknown());
        };
        let mut reduced = vec![false; dims.len()];
        for &axis in axes {
            reduced[Self::normalize_axis(axis, dims.len(), "reduce")?] = true;
        }
        let out = dims
            .iter()
            .zip(&reduced)
            .filter_map(|(d, r)| match (r, keep_dims) {
                (true, true) => Some(Dim::Static(1)),
                (true, false) => None,
                (false, _) => Some(*d),
            })
            .collect();
        Ok(Shape { dims: Some(out) })
    }

    /// Target of a reshape; a single `-1` is resolved when the element
    /// count is known.
    pub fn reshape(input: &Shape, target: &[i64]) -> Result<Shape, ShapeError> {
        let wildcard: Vec<usize> = target.iter().enumerate().filter(|(_, d)| **d < 0).map(|(i, _)| i).collect();
        if wildcard.len() > 1 {
            return Err(ShapeError::invalid("Reshape", "more than one unknown dimension"));
        }
        let mut out = Shape::from_i64s(target);
        let known = target.iter().filter(|d| **d >= 0).try_fold(1i64, |acc, &d| acc.checked_mul(d));
        let total = input.num_elements().and_then(|n| i64::try_from(n).ok());
        if let (Some(&at), Some(total), Some(known)) = (wildcard.first(), total, known) {
            if known == 0 || total % known != 0 {
                return Err(ShapeError::invalid("Reshape", format!("cannot reshape {} into {:?}", input, target)));
            }
            if let Some(dims) = out.dims.as_mut() {
                dims[at] = Dim::Static((total / known) as usize);
            }
        }
        Ok(out)
    }

    /// Batched matrix product; batch dimensions broadcast. The result rank
    /// is unknown when either operand rank is.
    pub fn matmul(a: &Shape, b: &Shape, transpose_a: bool, transpose_b: bool) -> Result<Shape, ShapeError> {
        let (Some(da), Some(db)) = (&a.dims, &b.dims) else {
            return Ok(Shape::unknown());
        };
        if da.len() < 2 || db.len() < 2 {
            return Err(ShapeError::invalid("MatMul", "operands must have rank >= 2"));
        }
        let (ra, ca) = (da[da.len() - 2], da[da.len() - 1]);
        let (rb, cb) = (db[db.len() - 2], db[db.len() - 1]);
        let (m, ka) = if transpose_a { (ca, ra) } else { (ra, ca) };
        let (kb, n) = if transpose_b { (cb, rb) } else { (rb, cb) };
        if let (Dim::Static(x), Dim::Static(y)) = (ka, kb) {
            if x != y {
                return Err(ShapeError::invalid("MatMul", format!("inner dimensions differ: {} vs {}", x, y)));
            }
        }
        let batch_a = Shape { dims: Some(da[..da.len() - 2].to_vec()) };
        let batch_b = Shape { dims: Some(db[..db.len() - 2].to_vec()) };
        let mut dims = Self::broadcast(&batch_a, &batch_b)?.dims.unwrap_or_default();
        dims.push(m);
        dims.push(n);
        Ok(Shape { dims: Some(dims) })
    }

    pub fn concat(shapes: &[Shape], axis: i64) -> Result<Shape, ShapeError> {
        let Some(rank) = shapes.iter().find_map(Shape::rank) else {
            return Ok(Shape::unknown());
        };
        let axis = Self::normalize_axis(axis, rank, "ConcatV2")?;
        let mut merged = Shape::of_rank(rank);
        let mut total = Some(0usize);
        for shape in shapes {
            let Some(dims) = &shape.dims else {
                total = None;
                continue;
            };
            if dims.len() != rank {
                return Err(ShapeError::RankMismatch(rank, dims.len()));
            }
            let mut without_axis = dims.clone();
            without_axis[axis] = Dim::Unknown;
            merged = merged.merge(&Shape { dims: Some(without_axis) })?;
            total = total.zip(dims[axis].value()).map(|(t, d)| t + d);
        }
        if let Some(dims) = merged.dims.as_mut() {
            dims[axis] = total.map_or(Dim::Unknown, Dim::Static);
        }
        Ok(merged)
    }

    pub fn transpose(shape: &Shape, perm: &[i64]) -> Result<Shape, ShapeError> {
        let Some(dims) = &shape.dims else {
            return Ok(Shape::of_rank(perm.len()));
        };
        if perm.len() != dims.len() {
            return Err(ShapeError::RankMismatch(dims.len(), perm.len()));
        }
        let out = perm
            .iter()
            .map(|&p| Self::normalize_axis(p, dims.len(), "Transpose").map(|a| dims[a]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Shape { dims: Some(out) })
    }

    pub fn expand_dims(shape: &Shape, axis: i64) -> Result<Shape, ShapeError> {
        let Some(dims) = &shape.dims else {
            return Ok(Shape::unknown());
        };
        let at = Self::normalize_axis(axis, dims.len() + 1, "ExpandDims")?;
        let mut out = dims.clone();
        out.insert(at, Dim::Static(1));
        Ok(Shape { dims: Some(out) })
    }

    pub fn squeeze(shape: &Shape, axes: &[i64]) -> Result<Shape, ShapeError> {
        let Some(dims) = &shape.dims else {
            return Ok(Shape::unknown());
        };
        if axes.is_empty() {
            if dims.iter().any(|d| *d == Dim::Unknown) {
                return Ok(Shape::unknown());
            }
            return Ok(Shape { dims: Some(dims.iter().copied().filter(|d| *d != Dim::Static(1)).collect()) });
        }
        let mut drop = vec![false; dims.len()];
        for &axis in axes {
            let a = Self::normalize_axis(axis, dims.len(), "Squeeze")?;
            if let Dim::Static(d) = dims[a] {
                if d != 1 {
                    return Err(ShapeError::invalid("Squeeze", format!("cannot squeeze dimension {} of size {}", a, d)));
                }
            }
            drop[a] = true;
        }
        Ok(Shape { dims: Some(dims.iter().zip(&drop).filter(|(_, d)| !**d).map(|(x, _)| *x).collect()) })
    }

    /// Resolves a strided slice against the input dimensions. Mask bit `i`
    /// refers to entry `i` of `begin`/`end`/`strides`.
    pub fn slice_plan(
        input: &[Dim],
        begin: &[i64],
        end: &[i64],
        strides: &[i64],
        masks: SliceMasks,
    ) -> Result<SlicePlan, ShapeError> {
        const OP: &str = "StridedSlice";
        let sparse = begin.len();
        if end.len() != sparse || strides.len() != sparse {
            return Err(ShapeError::invalid(OP, "begin, end and strides must have equal length"));
        }
        if masks.ellipsis.count_ones() > 1 {
            return Err(ShapeError::invalid(OP, "multiple ellipses"));
        }
        let bit = |mask: i64, i: usize| 1i64.checked_shl(i as u32).is_some_and(|b| mask & b != 0);
        let dense_rank = input.len();
        let ellipsis_at = (0..sparse).find(|&i| bit(masks.ellipsis, i));

        // (sparse index or None for a full axis, dense axis)
        let mut dense: Vec<Option<usize>> = Vec::with_capacity(dense_rank);
        let mut output = Vec::new();
        let mut full_index = 0usize;
        for i in 0..sparse {
            if Some(i) == ellipsis_at {
                let after = sparse - i - 1;
                let new_after = (i + 1..sparse).filter(|&j| bit(masks.new_axis, j)).count();
                let next = (dense_rank + new_after).saturating_sub(after).min(dense_rank);
                while full_index < next {
                    dense.push(None);
                    output.push(OutputAxis::Dense(full_index));
                    full_index += 1;
                }
            } else if bit(masks.new_axis, i) {
                output.push(OutputAxis::NewAxis);
            } else {
                if full_index >= dense_rank {
                    return Err(ShapeError::invalid(OP, "slice index exceeds input rank"));
                }
                dense.push(Some(i));
                output.push(OutputAxis::Dense(full_index));
                full_index += 1;
            }
        }
        if ellipsis_at.is_none() {
            while full_index < dense_rank {
                dense.push(None);
                output.push(OutputAxis::Dense(full_index));
                full_index += 1;
            }
        }

        let mut axes = Vec::with_capacity(dense_rank);
        for (axis, entry) in dense.iter().enumerate() {
            let dim = input[axis];
            let Some(i) = *entry else {
                axes.push(match dim {
                    Dim::Static(d) => AxisSlice::Range { begin: 0, stride: 1, size: d },
                    Dim::Unknown => AxisSlice::Unknown,
                });
                continue;
            };
            let stride = strides[i];
            if stride == 0 {
                return Err(ShapeError::invalid(OP, "stride must be non-zero"));
            }
            if bit(masks.shrink_axis, i) {
                let index = match dim {
                    Dim::Static(d) => {
                        let d = d as i64;
                        let x = if begin[i] < 0 { begin[i] + d } else { begin[i] };
                        if x < 0 || x >= d {
                            return Err(ShapeError::invalid(OP, format!("shrink index {} out of bounds for {}", begin[i], d)));
                        }
                        x
                    }
                    Dim::Unknown => begin[i],
                };
                axes.push(AxisSlice::Shrink { index });
                continue;
            }
            let Dim::Static(d) = dim else {
                axes.push(AxisSlice::Unknown);
                continue;
            };
            let d = d as i64;
            let (lo, hi) = if stride > 0 { (0, d) } else { (-1, d - 1) };
            let canonical = |x: i64, masked: bool, is_end: bool| -> i64 {
                if masked {
                    return match (stride > 0, is_end) {
                        (true, false) => 0,
                        (true, true) => d,
                        (false, false) => d - 1,
                        (false, true) => -1,
                    };
                }
                let x = if x < 0 { x + d } else { x };
                x.clamp(lo, hi)
            };
            let b = canonical(begin[i], bit(masks.begin, i), false);
            let e = canonical(end[i], bit(masks.end, i), true);
            let interval = e - b;
            let size = if interval == 0 || (interval < 0) != (stride < 0) {
                0
            } else {
                (interval / stride + i64::from(interval % stride != 0)) as usize
            };
            axes.push(AxisSlice::Range { begin: b, stride, size });
        }

        let output = output
            .into_iter()
            .filter(|axis| match axis {
                OutputAxis::Dense(i) => !matches!(axes[*i], AxisSlice::Shrink { .. }),
                OutputAxis::NewAxis => true,
            })
            .collect();
        Ok(SlicePlan { axes, output })
    }

    /// Evaluates a slice plan on a materialized value.
    pub fn slice_value(value: &TensorValue, plan: &SlicePlan) -> Option<TensorValue> {
        let mut picks: Vec<Vec<usize>> = Vec::with_capacity(plan.axes.len());
        for axis in &plan.axes {
            picks.push(match *axis {
                AxisSlice::Range { begin, stride, size } => {
                    (0..size as i64).map(|k| (begin + k * stride) as usize).collect()
                }
                AxisSlice::Shrink { index } => vec![index as usize],
                AxisSlice::Unknown => return None,
            });
        }
        let strides = Self::row_major_strides(&value.shape);
        let offsets = Self::gather_offsets(&picks, &strides);
        let shape = plan.output_shape().as_static()?;
        Some(TensorValue { dtype: value.dtype, shape, data: Self::take(&value.data, &offsets) })
    }

    pub fn range_values(start: &TensorValue, limit: &TensorValue, delta: &TensorValue, dtype: DataType) -> Result<TensorValue, ShapeError> {
        if dtype.is_float() {
            let (s, l, d) = (start.as_f64s(), limit.as_f64s(), delta.as_f64s());
            let (Some(&s), Some(&l), Some(&d)) = (s.first(), l.first(), d.first()) else {
                return Err(ShapeError::invalid("Range", "expected scalar operands"));
            };
            if d == 0.0 {
                return Err(ShapeError::invalid("Range", "delta must be non-zero"));
            }
            let n = ((l - s) / d).ceil().max(0.0);
            let n = Self::within_limit("Range", n.is_finite().then_some(n as usize))?;
            let data = (0..n).map(|k| s + k as f64 * d).collect();
            return Ok(TensorValue::floats(dtype, vec![n], data));
        }
        let (Some(s), Some(l), Some(d)) = (start.scalar_i64(), limit.scalar_i64(), delta.scalar_i64()) else {
            return Err(ShapeError::invalid("Range", "expected scalar operands"));
        };
        if d == 0 {
            return Err(ShapeError::invalid("Range", "delta must be non-zero"));
        }
        let span = (l as i128) - (s as i128);
        let (d_abs, span_abs) = ((d as i128).abs(), span.abs());
        let n = if (span > 0) != (d > 0) || span == 0 { 0 } else { (span_abs + d_abs - 1) / d_abs };
        let n = Self::within_limit("Range", usize::try_from(n).ok())?;
        Ok(TensorValue::ints(dtype, vec![n], (0..n as i64).map(|k| s + k * d).collect()))
    }

    pub fn pack_values(values: &[TensorValue], axis: i64) -> Result<TensorValue, ShapeError> {
        let Some(first) = values.first() else {
            return Err(ShapeError::invalid("Pack", "no operands"));
        };
        if values.iter().any(|v| v.shape != first.shape) {
            return Err(ShapeError::invalid("Pack", "operands differ in shape"));
        }
        let axis = Self::normalize_axis(axis, first.shape.len() + 1, "Pack")?;
        let outer: usize = first.shape[..axis].iter().product();
        let inner: usize = first.shape[axis..].iter().product();
        let mut offsets = Vec::with_capacity(outer * inner * values.len());
        for o in 0..outer {
            for k in 0..values.len() {
                for i in 0..inner {
                    offsets.push((k, o * inner + i));
                }
            }
        }
        let float = values.iter().any(|v| matches!(v.data, ValueData::Float(_)));
        let data = if float {
            let all: Vec<Vec<f64>> = values.iter().map(TensorValue::as_f64s).collect();
            ValueData::Float(offsets.iter().map(|&(k, i)| all[k][i]).collect())
        } else {
            let all: Vec<Vec<i64>> = values.iter().map(TensorValue::as_i64s).collect();
            ValueData::Int(offsets.iter().map(|&(k, i)| all[k][i]).collect())
        };
        let mut shape = first.shape.clone();
        shape.insert(axis, values.len());
        Ok(TensorValue { dtype: first.dtype, shape, data })
    }

    pub fn prod_values(value: &TensorValue, axes: &[i64], keep_dims: bool) -> Result<TensorValue, ShapeError> {
        let rank = value.shape.len();
        let mut reduced = vec![false; rank];
        for &axis in axes {
            reduced[Self::normalize_axis(axis, rank, "Prod")?] = true;
        }
        let out_full: Vec<usize> = value.shape.iter().zip(&reduced).map(|(d, r)| if *r { 1 } else { *d }).collect();
        let out_len: usize = out_full.iter().product();
        let out_strides = Self::row_major_strides(&out_full);
        let target = |flat: usize| -> usize {
            let mut rem = flat;
            let mut at = 0;
            for (axis, dim) in value.shape.iter().enumerate().rev() {
                let coord = rem % dim;
                rem /= dim;
                if !reduced[axis] {
                    at += coord * out_strides[axis];
                }
            }
            at
        };
        let data = match &value.data {
            ValueData::Int(v) => {
                let mut out = vec![1i64; out_len];
                for (flat, x) in v.iter().enumerate() {
                    out[target(flat)] *= x;
                }
                ValueData::Int(out)
            }
            ValueData::Float(v) => {
                let mut out = vec![1f64; out_len];
                for (flat, x) in v.iter().enumerate() {
                    out[target(flat)] *= x;
                }
                ValueData::Float(out)
            }
        };
        let shape = if keep_dims {
            out_full
        } else {
            value.shape.iter().zip(&reduced).filter(|(_, r)| !**r).map(|(d, _)| *d).collect()
        };
        Ok(TensorValue { dtype: value.dtype, shape, data })
    }

    pub fn mul_values(a: &TensorValue, b: &TensorValue) -> Result<TensorValue, ShapeError> {
        let shape = Self::broadcast(&a.shape(), &b.shape())?
            .as_static()
            .ok_or_else(|| ShapeError::invalid("Mul", "operands are not fully defined"))?;
        let ia = Self::broadcast_offsets(&a.shape, &shape);
        let ib = Self::broadcast_offsets(&b.shape, &shape);
        let data = match (&a.data, &b.data) {
            (ValueData::Int(x), ValueData::Int(y)) => {
                ValueData::Int(ia.iter().zip(&ib).map(|(&i, &j)| x[i].wrapping_mul(y[j])).collect())
            }
            _ => {
                let (x, y) = (a.as_f64s(), b.as_f64s());
                ValueData::Float(ia.iter().zip(&ib).map(|(&i, &j)| x[i] * y[j]).collect())
            }
        };
        Ok(TensorValue { dtype: a.dtype, shape, data })
    }

    pub fn fill_values(dims: &TensorValue, value: &TensorValue) -> Result<TensorValue, ShapeError> {
        if dims.as_i64s().iter().any(|d| *d < 0) {
            return Err(ShapeError::invalid("Fill", "negative dimension"));
        }
        let shape: Vec<usize> = dims.as_i64s().iter().map(|d| *d as usize).collect();
        let n = Self::within_limit("Fill", element_count(&shape))?;
        let data = match &value.data {
            ValueData::Int(v) => ValueData::Int(vec![*v.first().ok_or_else(|| ShapeError::invalid("Fill", "empty value"))?; n]),
            ValueData::Float(v) => ValueData::Float(vec![*v.first().ok_or_else(|| ShapeError::invalid("Fill", "empty value"))?; n]),
        };
        Ok(TensorValue { dtype: value.dtype, shape, data })
    }

    fn within_limit(op: &str, elements: Option<usize>) -> Result<usize, ShapeError> {
        match elements {
            Some(n) if n <= MAX_MATERIALIZED_ELEMENTS => Ok(n),
            _ => Err(ShapeError::invalid(op, "result is too large to evaluate")),
        }
    }

    fn row_major_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    fn gather_offsets(picks: &[Vec<usize>], strides: &[usize]) -> Vec<usize> {
        let mut offsets = vec![0usize];
        for (pick, stride) in picks.iter().zip(strides) {
            offsets = offsets.iter().flat_map(|base| pick.iter().map(move |p| base + p * stride)).collect();
        }
        offsets
    }

    /// Source offset in `from` for every element of the broadcast `to`.
    fn broadcast_offsets(from: &[usize], to: &[usize]) -> Vec<usize> {
        let pad = to.len() - from.len();
        let strides = Self::row_major_strides(from);
        let picks: Vec<Vec<usize>> = to
            .iter()
            .enumerate()
            .map(|(axis, &d)| {
                if axis < pad || from[axis - pad] == 1 { vec![0; d] } else { (0..d).collect() }
            })
            .collect();
        let mut padded = vec![0; pad];
        padded.extend(strides);
        Self::gather_offsets(&picks, &padded)
    }

    fn take(data: &ValueData, offsets: &[usize]) -> ValueData {
        match data {
            ValueData::Int(v) => ValueData::Int(offsets.iter().map(|&o| v[o]).collect()),
            ValueData::Float(v) => ValueData::Float(offsets.iter().map(|&o| v[o]).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(shape: &[usize], data: &[i64]) -> TensorValue {
        TensorValue::ints(DataType::I32, shape.to_vec(), data.to_vec())
    }

    #[test]
    fn broadcast_aligns_from_the_right() {
        let a = Shape::from_i64s(&[-1, 1, 3]);
        let b = Shape::from_dims(&[4, 3]);
        assert_eq!(ShapeEngine::broadcast(&a, &b).unwrap(), Shape::from_i64s(&[-1, 4, 3]));
        assert!(ShapeEngine::broadcast(&Shape::from_dims(&[2]), &Shape::from_dims(&[3])).is_err());
    }

    #[test]
    fn strided_slice_honors_shrink_and_masks() {
        let input = Shape::from_dims(&[4, 8]).dims.unwrap();
        // x[1]
        let plan = ShapeEngine::slice_plan(&input, &[1], &[2], &[1], SliceMasks { shrink_axis: 1, ..Default::default() }).unwrap();
        assert_eq!(plan.output_shape(), Shape::from_dims(&[8]));
        // x[:, ::-2]
        let plan = ShapeEngine::slice_plan(
            &input,
            &[0, 0],
            &[0, 0],
            &[1, -2],
            SliceMasks { begin: 0b11, end: 0b11, ..Default::default() },
        )
        .unwrap();
        assert_eq!(plan.output_shape(), Shape::from_dims(&[4, 4]));
        // x[..., tf.newaxis, 2:5]
        let plan = ShapeEngine::slice_plan(
            &input,
            &[0, 0, 2],
            &[0, 0, 5],
            &[1, 1, 1],
            SliceMasks { ellipsis: 0b001, new_axis: 0b010, ..Default::default() },
        )
        .unwrap();
        assert_eq!(plan.output_shape(), Shape::from_dims(&[4, 1, 3]));
    }

    #[test]
    fn slice_value_picks_elements() {
        let shape = ints(&[3], &[4, 8, 16]);
        let plan = ShapeEngine::slice_plan(
            &shape.shape().dims.unwrap(),
            &[-1],
            &[0],
            &[1],
            SliceMasks { shrink_axis: 1, ..Default::default() },
        )
        .unwrap();
        let v = ShapeEngine::slice_value(&shape, &plan).unwrap();
        assert_eq!(v.as_i64s(), vec![16]);
        assert!(v.shape.is_empty());

        let plan = ShapeEngine::slice_plan(&shape.shape().dims.unwrap(), &[2], &[0], &[-1], SliceMasks::default()).unwrap();
        assert_eq!(ShapeEngine::slice_value(&shape, &plan).unwrap().as_i64s(), vec![16, 8]);
    }

    #[test]
    fn prod_reduces_with_keep_dims() {
        let v = ints(&[2, 3], &[1, 2, 3, 4, 5, 6]);
        let r = ShapeEngine::prod_values(&v, &[1], false).unwrap();
        assert_eq!((r.shape.clone(), r.as_i64s()), (vec![2], vec![6, 120]));
        let r = ShapeEngine::prod_values(&v, &[0], true).unwrap();
        assert_eq!((r.shape.clone(), r.as_i64s()), (vec![1, 3], vec![4, 10, 18]));
    }

    #[test]
    fn range_pack_mul_fill() {
        let r = ShapeEngine::range_values(&ints(&[], &[0]), &ints(&[], &[7]), &ints(&[], &[3]), DataType::I32).unwrap();
        assert_eq!(r.as_i64s(), vec![0, 3, 6]);
        let down = ShapeEngine::range_values(&ints(&[], &[5]), &ints(&[], &[0]), &ints(&[], &[-2]), DataType::I32).unwrap();
        assert_eq!(down.as_i64s(), vec![5, 3, 1]);

        let p = ShapeEngine::pack_values(&[ints(&[], &[2]), ints(&[], &[5])], 0).unwrap();
        assert_eq!((p.shape.clone(), p.as_i64s()), (vec![2], vec![2, 5]));
        let p = ShapeEngine::pack_values(&[ints(&[2], &[1, 2]), ints(&[2], &[3, 4])], 1).unwrap();
        assert_eq!((p.shape.clone(), p.as_i64s()), (vec![2, 2], vec![1, 3, 2, 4]));

        let m = ShapeEngine::mul_values(&ints(&[2], &[3, 4]), &ints(&[], &[2])).unwrap();
        assert_eq!(m.as_i64s(), vec![6, 8]);

        let f = ShapeEngine::fill_values(&ints(&[2], &[2, 2]), &ints(&[], &[7])).unwrap();
        assert_eq!((f.shape.clone(), f.as_i64s()), (vec![2, 2], vec![7; 4]));
    }

    #[test]
    fn oversized_fill_and_range_are_refused() {
        assert!(ShapeEngine::fill_values(&ints(&[2], &[1 << 20, 1 << 20]), &ints(&[], &[0])).is_err());
        assert!(ShapeEngine::fill_values(&ints(&[3], &[1 << 40, 1 << 40, 1 << 40]), &ints(&[], &[0])).is_err());
        let r = ShapeEngine::range_values(&ints(&[], &[i64::MIN]), &ints(&[], &[i64::MAX]), &ints(&[], &[1]), DataType::I64);
        assert!(r.is_err());
    }

    #[test]
    fn matmul_rank_follows_operands() {
        let x = Shape::unknown();
        let y = Shape::from_dims(&[2, 3, 4]);
        assert_eq!(ShapeEngine::matmul(&x, &y, false, false).unwrap(), Shape::unknown());
        let a = Shape::from_i64s(&[-1, 5, 3]);
        assert_eq!(ShapeEngine::matmul(&a, &y, false, false).unwrap(), Shape::from_i64s(&[2, 5, 4]));
        assert!(ShapeEngine::matmul(&Shape::from_dims(&[2, 3]), &Shape::from_dims(&[4, 5]), false, false).is_err());
    }

    #[test]
    fn slice_masks_ignore_entries_past_bit_width() {
        let input = vec![Dim::Static(1); 70];
        let zeros = vec![0i64; 70];
        let ones = vec![1i64; 70];
        let masks = SliceMasks { begin: -1, end: -1, ..Default::default() };
        let plan = ShapeEngine::slice_plan(&input, &zeros, &ones, &ones, masks).unwrap();
        assert_eq!(plan.output_shape().rank(), Some(70));
    }

    #[test]
    fn reshape_resolves_single_wildcard() {
        let input = Shape::from_dims(&[4, 6]);
        assert_eq!(ShapeEngine::reshape(&input, &[-1, 3]).unwrap(), Shape::from_dims(&[8, 3]));
        assert!(ShapeEngine::reshape(&input, &[-1, -1]).is_err());
        assert!(ShapeEngine::reshape(&input, &[-1, 5]).is_err());
    }
}
