use crate::core::types::{DataType, Dim, Shape, TensorValue, ValueData, element_count};
use crate::wire::{tensor_shape_proto, TensorProto, TensorShapeProto};
use prost::Message;

/// Constants above this encoded size are never evaluated symbolically.
pub const LARGE_CONST_BYTES: usize = 1024;

/// Upper bound on the elements of any value materialized for symbolic
/// evaluation. Splat constants and `Fill` can describe far larger tensors
/// than their encoding suggests.
pub const MAX_MATERIALIZED_ELEMENTS: usize = 1 << 16;

pub fn shape_from_proto(proto: &TensorShapeProto) -> Shape {
    if proto.unknown_rank {
        return Shape::unknown();
    }
    Shape { dims: Some(proto.dim.iter().map(|d| Dim::from_i64(d.size)).collect()) }
}

pub fn shape_to_proto(shape: &Shape) -> TensorShapeProto {
    match &shape.dims {
        None => TensorShapeProto { dim: Vec::new(), unknown_rank: true },
        Some(dims) => TensorShapeProto {
            dim: dims
                .iter()
                .map(|d| tensor_shape_proto::Dim { size: d.to_i64(), name: String::new() })
                .collect(),
            unknown_rank: false,
        },
    }
}

fn decode_content(dtype: DataType, bytes: &[u8]) -> Option<ValueData> {
    macro_rules! le {
        ($ty:ty, $conv:expr, $variant:ident) => {{
            let width = std::mem::size_of::<$ty>();
            if bytes.len() % width != 0 {
                return None;
            }
            ValueData::$variant(
                bytes
                    .chunks_exact(width)
                    .map(|c| {
                        let mut buf = [0u8; std::mem::size_of::<$ty>()];
                        buf.copy_from_slice(c);
                        $conv(<$ty>::from_le_bytes(buf))
                    })
                    .collect(),
            )
        }};
    }
    Some(match dtype {
        DataType::F32 => le!(f32, |v: f32| v as f64, Float),
        DataType::F64 => le!(f64, |v: f64| v, Float),
        DataType::I32 | DataType::QI32 => le!(i32, |v: i32| v as i64, Int),
        DataType::I64 => le!(i64, |v: i64| v, Int),
        DataType::I16 | DataType::QI16 => le!(i16, |v: i16| v as i64, Int),
        DataType::U16 | DataType::QU16 => le!(u16, |v: u16| v as i64, Int),
        DataType::U32 => le!(u32, |v: u32| v as i64, Int),
        DataType::U64 => le!(u64, |v: u64| v as i64, Int),
        DataType::I8 | DataType::QI8 => le!(i8, |v: i8| v as i64, Int),
        DataType::U8 | DataType::QU8 | DataType::Bool => le!(u8, |v: u8| v as i64, Int),
        _ => return None,
    })
}

fn typed_vals(proto: &TensorProto, dtype: DataType) -> Option<ValueData> {
    Some(match dtype {
        DataType::F32 => ValueData::Float(proto.float_val.iter().map(|v| *v as f64).collect()),
        DataType::F64 => ValueData::Float(proto.double_val.clone()),
        DataType::I32 | DataType::I16 | DataType::I8 | DataType::U8 | DataType::U16 | DataType::QI32 => {
            ValueData::Int(proto.int_val.iter().map(|v| *v as i64).collect())
        }
        DataType::I64 => ValueData::Int(proto.int64_val.clone()),
        DataType::Bool => ValueData::Int(proto.bool_val.iter().map(|b| *b as i64).collect()),
        DataType::U32 => ValueData::Int(proto.uint32_val.iter().map(|v| *v as i64).collect()),
        DataType::U64 => ValueData::Int(proto.uint64_val.iter().map(|v| *v as i64).collect()),
        _ => return None,
    })
}

/// Materializes a `Const` payload. Returns `None` for unsupported dtypes,
/// partially defined shapes, inconsistent element counts and tensors above
/// [`MAX_MATERIALIZED_ELEMENTS`].
pub fn value_from_proto(proto: &TensorProto) -> Option<TensorValue> {
    let dtype = DataType::from_enum(proto.dtype)?;
    let shape = proto.tensor_shape.as_ref().map(shape_from_proto).unwrap_or_else(Shape::scalar);
    let dims = shape.as_static()?;
    let count = element_count(&dims).filter(|n| *n <= MAX_MATERIALIZED_ELEMENTS)?;
    let data = if !proto.tensor_content.is_empty() {
        decode_content(dtype, &proto.tensor_content)?
    } else {
        typed_vals(proto, dtype)?
    };
    let data = match data {
        ValueData::Int(v) => ValueData::Int(broadcast_fill(v, count)?),
        ValueData::Float(v) => ValueData::Float(broadcast_fill(v, count)?),
    };
    Some(TensorValue { dtype, shape: dims, data })
}

fn broadcast_fill<T: Copy>(values: Vec<T>, count: usize) -> Option<Vec<T>> {
    if values.len() == count {
        Some(values)
    } else if values.len() == 1 {
        Some(vec![values[0]; count])
    } else {
        None
    }
}

pub fn value_to_proto(value: &TensorValue) -> TensorProto {
    let mut proto = TensorProto {
        dtype: value.dtype.to_enum(),
        tensor_shape: Some(shape_to_proto(&value.shape())),
        ..Default::default()
    };
    match value.dtype {
        DataType::F32 => proto.float_val = value.as_f64s().iter().map(|v| *v as f32).collect(),
        DataType::F64 => proto.double_val = value.as_f64s(),
        DataType::I64 => proto.int64_val = value.as_i64s(),
        DataType::Bool => proto.bool_val = value.as_i64s().iter().map(|v| *v != 0).collect(),
        _ => proto.int_val = value.as_i64s().iter().map(|v| *v as i32).collect(),
    }
    proto
}

pub fn is_small(proto: &TensorProto) -> bool {
    proto.encoded_len() <= LARGE_CONST_BYTES
}
