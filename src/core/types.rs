use crate::error::{GraphError, ShapeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element types, numbered as in the framework's `DataType` enum.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    #[serde(rename = "invalid")]
    Invalid,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "string")]
    Str,
    #[serde(rename = "complex64")]
    C64,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "bool")]
    Bool,
    #[serde(rename = "qint8")]
    QI8,
    #[serde(rename = "quint8")]
    QU8,
    #[serde(rename = "qint32")]
    QI32,
    #[serde(rename = "bfloat16")]
    BF16,
    #[serde(rename = "qint16")]
    QI16,
    #[serde(rename = "quint16")]
    QU16,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "complex128")]
    C128,
    #[serde(rename = "float16")]
    F16,
    #[serde(rename = "resource")]
    Resource,
    #[serde(rename = "variant")]
    Variant,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "uint64")]
    U64,
}

impl DataType {
    const TABLE: [DataType; 24] = [
        DataType::Invalid,
        DataType::F32,
        DataType::F64,
        DataType::I32,
        DataType::U8,
        DataType::I16,
        DataType::I8,
        DataType::Str,
        DataType::C64,
        DataType::I64,
        DataType::Bool,
        DataType::QI8,
        DataType::QU8,
        DataType::QI32,
        DataType::BF16,
        DataType::QI16,
        DataType::QU16,
        DataType::U16,
        DataType::C128,
        DataType::F16,
        DataType::Resource,
        DataType::Variant,
        DataType::U32,
        DataType::U64,
    ];

    pub fn from_enum(value: i32) -> Option<Self> {
        usize::try_from(value).ok().and_then(|i| Self::TABLE.get(i).copied())
    }

    pub fn to_enum(self) -> i32 {
        Self::TABLE.iter().position(|d| *d == self).unwrap_or(0) as i32
    }

    /// Byte width of one element; `None` for variable-size types.
    pub fn size(self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::U8 | DataType::I8 | DataType::QI8 | DataType::QU8 => Some(1),
            DataType::I16 | DataType::U16 | DataType::QI16 | DataType::QU16 | DataType::F16 | DataType::BF16 => Some(2),
            DataType::F32 | DataType::I32 | DataType::U32 | DataType::QI32 => Some(4),
            DataType::F64 | DataType::I64 | DataType::U64 | DataType::C64 => Some(8),
            DataType::C128 => Some(16),
            DataType::Invalid | DataType::Str | DataType::Resource | DataType::Variant => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::F16 | DataType::BF16 | DataType::F32 | DataType::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Invalid => "invalid",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
            DataType::I32 => "int32",
            DataType::U8 => "uint8",
            DataType::I16 => "int16",
            DataType::I8 => "int8",
            DataType::Str => "string",
            DataType::C64 => "complex64",
            DataType::I64 => "int64",
            DataType::Bool => "bool",
            DataType::QI8 => "qint8",
            DataType::QU8 => "quint8",
            DataType::QI32 => "qint32",
            DataType::BF16 => "bfloat16",
            DataType::QI16 => "qint16",
            DataType::QU16 => "quint16",
            DataType::U16 => "uint16",
            DataType::C128 => "complex128",
            DataType::F16 => "float16",
            DataType::Resource => "resource",
            DataType::Variant => "variant",
            DataType::U32 => "uint32",
            DataType::U64 => "uint64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dim {
    Static(usize),
    Unknown,
}

impl Dim {
    pub fn from_i64(v: i64) -> Self {
        if v < 0 { Dim::Unknown } else { Dim::Static(v as usize) }
    }

    pub fn to_i64(self) -> i64 {
        match self {
            Dim::Static(v) => v as i64,
            Dim::Unknown => -1,
        }
    }

    pub fn value(self) -> Option<usize> {
        match self {
            Dim::Static(v) => Some(v),
            Dim::Unknown => None,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Static(v) => write!(f, "{}", v),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

/// Tensor shape. `dims == None` means the rank itself is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    pub dims: Option<Vec<Dim>>,
}

impl Shape {
    pub fn unknown() -> Self {
        Self { dims: None }
    }

    pub fn scalar() -> Self {
        Self { dims: Some(Vec::new()) }
    }

    pub fn of_rank(rank: usize) -> Self {
        Self { dims: Some(vec![Dim::Unknown; rank]) }
    }

    pub fn from_dims(dims: &[usize]) -> Self {
        Self { dims: Some(dims.iter().map(|&d| Dim::Static(d)).collect()) }
    }

    pub fn from_i64s(dims: &[i64]) -> Self {
        Self { dims: Some(dims.iter().map(|&d| Dim::from_i64(d)).collect()) }
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(|d| d.len())
    }

    pub fn is_fully_defined(&self) -> bool {
        self.dims.as_ref().is_some_and(|d| d.iter().all(|x| matches!(x, Dim::Static(_))))
    }

    pub fn as_static(&self) -> Option<Vec<usize>> {
        self.dims.as_ref()?.iter().map(|d| d.value()).collect()
    }

    /// `None` when a dimension is unknown or the count overflows `usize`.
    pub fn num_elements(&self) -> Option<usize> {
        element_count(&self.as_static()?)
    }

    /// Combines two partial descriptions of the same tensor. Unknown rank or
    /// unknown dimensions accept anything; two known values must agree.
    pub fn merge(&self, other: &Shape) -> Result<Shape, ShapeError> {
        let (a, b) = match (&self.dims, &other.dims) {
            (None, _) => return Ok(other.clone()),
            (_, None) => return Ok(self.clone()),
            (Some(a), Some(b)) => (a, b),
        };
        if a.len() != b.len() {
            return Err(ShapeError::RankMismatch(a.len(), b.len()));
        }
        let mut dims = Vec::with_capacity(a.len());
        for (axis, (x, y)) in a.iter().zip(b).enumerate() {
            dims.push(match (x, y) {
                (Dim::Unknown, d) | (d, Dim::Unknown) => *d,
                (Dim::Static(l), Dim::Static(r)) if l == r => Dim::Static(*l),
                (Dim::Static(l), Dim::Static(r)) => {
                    return Err(ShapeError::DimConflict { axis, left: *l, right: *r });
                }
            });
        }
        Ok(Shape { dims: Some(dims) })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dims {
            None => write!(f, "<unknown>"),
            Some(dims) => {
                let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

/// `(node, port)` address of one produced tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorRef {
    pub node: String,
    pub port: usize,
}

impl TensorRef {
    pub fn new(node: impl Into<String>, port: usize) -> Self {
        Self { node: node.into(), port }
    }

    pub fn parse(name: &str) -> Result<Self, GraphError> {
        if name.is_empty() || name.starts_with('^') {
            return Err(GraphError::MalformedTensorName(name.to_string()));
        }
        match name.rsplit_once(':') {
            Some((node, port)) => {
                let port: i64 = port.parse().map_err(|_| GraphError::MalformedTensorName(name.to_string()))?;
                if node.is_empty() {
                    return Err(GraphError::MalformedTensorName(name.to_string()));
                }
                Ok(Self::new(node, if port < 0 { 0 } else { port as usize }))
            }
            None => Ok(Self::new(name, 0)),
        }
    }

    /// Always carries the port, as in `node:0`.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.node, self.port)
    }
}

impl fmt::Display for TensorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 { write!(f, "{}", self.node) } else { write!(f, "{}:{}", self.node, self.port) }
    }
}

/// One entry of a node's input list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Input {
    Data(TensorRef),
    Control(String),
}

impl Input {
    pub fn parse(name: &str) -> Result<Self, GraphError> {
        match name.strip_prefix('^') {
            Some("") => Err(GraphError::MalformedTensorName(name.to_string())),
            Some(node) => Ok(Input::Control(node.to_string())),
            None => TensorRef::parse(name).map(Input::Data),
        }
    }

    pub fn node_name(&self) -> &str {
        match self {
            Input::Data(t) => &t.node,
            Input::Control(n) => n,
        }
    }

    pub fn as_data(&self) -> Option<&TensorRef> {
        match self {
            Input::Data(t) => Some(t),
            Input::Control(_) => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Input::Control(_))
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::Data(t) => write!(f, "{}", t),
            Input::Control(n) => write!(f, "^{}", n),
        }
    }
}

pub fn element_count(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

/// A small, fully materialized tensor used for symbolic evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    pub data: ValueData,
}

impl TensorValue {
    pub fn ints(dtype: DataType, shape: Vec<usize>, data: Vec<i64>) -> Self {
        Self { dtype, shape, data: ValueData::Int(data) }
    }

    pub fn floats(dtype: DataType, shape: Vec<usize>, data: Vec<f64>) -> Self {
        Self { dtype, shape, data: ValueData::Float(data) }
    }

    pub fn len(&self) -> usize {
        match &self.data {
            ValueData::Int(v) => v.len(),
            ValueData::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> Shape {
        Shape::from_dims(&self.shape)
    }

    pub fn as_i64s(&self) -> Vec<i64> {
        match &self.data {
            ValueData::Int(v) => v.clone(),
            ValueData::Float(v) => v.iter().map(|x| *x as i64).collect(),
        }
    }

    pub fn as_f64s(&self) -> Vec<f64> {
        match &self.data {
            ValueData::Int(v) => v.iter().map(|x| *x as f64).collect(),
            ValueData::Float(v) => v.clone(),
        }
    }

    /// Re-stores the data in the representation `dtype` calls for.
    pub fn cast(self, dtype: DataType) -> Self {
        let data = if dtype.is_float() {
            ValueData::Float(self.as_f64s())
        } else {
            ValueData::Int(self.as_i64s())
        };
        Self { dtype, shape: self.shape, data }
    }

    pub fn scalar_i64(&self) -> Option<i64> {
        if self.len() == 1 { self.as_i64s().first().copied() } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_names_parse_with_default_port() {
        assert_eq!(TensorRef::parse("a").unwrap(), TensorRef::new("a", 0));
        assert_eq!(TensorRef::parse("scope/a:2").unwrap(), TensorRef::new("scope/a", 2));
        assert_eq!(TensorRef::parse("a:-1").unwrap(), TensorRef::new("a", 0));
        assert_eq!(TensorRef::new("a", 0).to_string(), "a");
        assert_eq!(TensorRef::new("a", 3).to_string(), "a:3");
        assert!(TensorRef::parse("a:x").is_err());
        assert!(TensorRef::parse("^a").is_err());
    }

    #[test]
    fn control_inputs_are_not_data() {
        let input = Input::parse("^init").unwrap();
        assert_eq!(input, Input::Control("init".into()));
        assert!(input.as_data().is_none());
        assert_eq!(input.to_string(), "^init");
        assert!(Input::parse("^").is_err());
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let s1 = Shape { dims: Some(vec![Dim::Static(4), Dim::Unknown, Dim::Unknown]) };
        let s2 = Shape { dims: Some(vec![Dim::Unknown, Dim::Static(8), Dim::Unknown]) };
        let s3 = Shape { dims: Some(vec![Dim::Unknown, Dim::Unknown, Dim::Static(2)]) };
        assert_eq!(s1.merge(&s2).unwrap(), s2.merge(&s1).unwrap());
        let left = s1.merge(&s2).unwrap().merge(&s3).unwrap();
        let right = s1.merge(&s2.merge(&s3).unwrap()).unwrap();
        assert_eq!(left, right);
        assert_eq!(left, Shape::from_dims(&[4, 8, 2]));
        assert_eq!(Shape::unknown().merge(&s1).unwrap(), s1);
    }

    #[test]
    fn merge_conflicts_fail_in_both_orders() {
        let a = Shape::from_dims(&[4, 8]);
        let b = Shape::from_dims(&[4, 9]);
        assert_eq!(a.merge(&b), Err(ShapeError::DimConflict { axis: 1, left: 8, right: 9 }));
        assert_eq!(b.merge(&a), Err(ShapeError::DimConflict { axis: 1, left: 9, right: 8 }));
        assert_eq!(a.merge(&Shape::from_dims(&[4])), Err(ShapeError::RankMismatch(2, 1)));
    }

    #[test]
    fn element_count_overflow_is_none() {
        assert_eq!(Shape::from_dims(&[3, 4]).num_elements(), Some(12));
        assert_eq!(Shape::scalar().num_elements(), Some(1));
        let huge = Shape::from_dims(&[1 << 32, 1 << 32, 1 << 32]);
        assert_eq!(huge.num_elements(), None);
    }

    #[test]
    fn dtype_enum_roundtrips_through_table() {
        assert_eq!(DataType::from_enum(1), Some(DataType::F32));
        assert_eq!(DataType::from_enum(9), Some(DataType::I64));
        assert_eq!(DataType::I64.to_enum(), 9);
        assert_eq!(DataType::from_enum(101), None);
        assert_eq!(DataType::F16.size(), Some(2));
    }
}
