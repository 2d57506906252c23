use std::fmt;

macro_rules! op_kinds {
    ($($variant:ident => $name:literal,)*) => {
        /// Operator kinds with dedicated handling. Everything else is carried
        /// verbatim in `Other`.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum OpKind {
            $($variant,)*
            Other(String),
        }

        impl OpKind {
            pub fn parse(name: &str) -> Self {
                match name {
                    $($name => OpKind::$variant,)*
                    _ => OpKind::Other(name.to_string()),
                }
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $(OpKind::$variant => $name,)*
                    OpKind::Other(name) => name,
                }
            }
        }
    };
}

op_kinds! {
    Placeholder => "Placeholder",
    Const => "Const",
    Identity => "Identity",
    StopGradient => "StopGradient",
    // shape-producing
    Shape => "Shape",
    Size => "Size",
    Rank => "Rank",
    Range => "Range",
    Pack => "Pack",
    Fill => "Fill",
    Reshape => "Reshape",
    StridedSlice => "StridedSlice",
    Transpose => "Transpose",
    ExpandDims => "ExpandDims",
    Squeeze => "Squeeze",
    ConcatV2 => "ConcatV2",
    // reductions
    Prod => "Prod",
    Sum => "Sum",
    Mean => "Mean",
    Max => "Max",
    Min => "Min",
    // elementwise binary
    Add => "Add",
    AddV2 => "AddV2",
    Sub => "Sub",
    Mul => "Mul",
    RealDiv => "RealDiv",
    Maximum => "Maximum",
    Minimum => "Minimum",
    SquaredDifference => "SquaredDifference",
    BiasAdd => "BiasAdd",
    // elementwise unary
    Relu => "Relu",
    Relu6 => "Relu6",
    Sigmoid => "Sigmoid",
    Tanh => "Tanh",
    Exp => "Exp",
    Log => "Log",
    Neg => "Neg",
    Sqrt => "Sqrt",
    Rsqrt => "Rsqrt",
    Square => "Square",
    Abs => "Abs",
    Softmax => "Softmax",
    Cast => "Cast",
    // linear algebra / normalization
    MatMul => "MatMul",
    BatchMatMul => "BatchMatMul",
    BatchMatMulV2 => "BatchMatMulV2",
    FusedBatchNorm => "FusedBatchNorm",
    FusedBatchNormV3 => "FusedBatchNormV3",
    // control flow
    Enter => "Enter",
    Exit => "Exit",
    Switch => "Switch",
    NextIteration => "NextIteration",
    TensorArrayV3 => "TensorArrayV3",
    TensorArraySizeV3 => "TensorArraySizeV3",
    TensorArrayGatherV3 => "TensorArrayGatherV3",
    // synthetic
    FusedSegment => "FusedSegment",
}

impl OpKind {
    pub fn is_unary_elementwise(&self) -> bool {
        matches!(
            self,
            OpKind::Identity
                | OpKind::StopGradient
                | OpKind::Relu
                | OpKind::Relu6
                | OpKind::Sigmoid
                | OpKind::Tanh
                | OpKind::Exp
                | OpKind::Log
                | OpKind::Neg
                | OpKind::Sqrt
                | OpKind::Rsqrt
                | OpKind::Square
                | OpKind::Abs
                | OpKind::Softmax
                | OpKind::Cast
                | OpKind::Enter
                | OpKind::Exit
                | OpKind::NextIteration
        )
    }

    pub fn is_binary_broadcast(&self) -> bool {
        matches!(
            self,
            OpKind::Add
                | OpKind::AddV2
                | OpKind::Sub
                | OpKind::Mul
                | OpKind::RealDiv
                | OpKind::Maximum
                | OpKind::Minimum
                | OpKind::SquaredDifference
        )
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self, OpKind::Prod | OpKind::Sum | OpKind::Mean | OpKind::Max | OpKind::Min)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
