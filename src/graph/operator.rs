use crate::{
    graph::GraphError,
    shape::{is_valid_permutation, reorder, row_major_index, row_major_multi, DType, Shape},
    tensor::Values,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Relu,
}

impl UnaryOp {
    pub fn evaluate_f32(&self, x: f32) -> f32 {
        match self {
            Self::Neg => -x,
            Self::Abs => x.abs(),
            Self::Relu => x.max(0.0),
        }
    }

    pub fn evaluate_i32(&self, x: i32) -> i32 {
        match self {
            Self::Neg => -x,
            Self::Abs => x.abs(),
            Self::Relu => x.max(0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl BinaryOp {
    pub fn is_commutative(&self) -> bool {
        matches!(self, Self::Add | Self::Mul | Self::Min | Self::Max)
    }

    pub fn evaluate_f32(&self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }

    pub fn evaluate_i32(&self, a: i32, b: i32) -> i32 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Min => a.min(b),
            Self::Max => a.max(b),
        }
    }
}

/// The operator of an instruction. Every operator's output shape is a pure
/// function of its payload and its input shapes, see [`Op::infer_shape`].
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Named graph input.
    Param { name: String, shape: Shape },
    /// Compile-time constant.
    Literal { lens: Vec<usize>, data: Values },
    /// Reinterpret a packed tensor with new lengths of equal element count.
    Reshape { dims: Vec<usize> },
    /// Collapse to 2-D around `axis`.
    Flatten { axis: usize },
    /// Drop the listed length-1 axes.
    Squeeze { axes: Vec<usize> },
    /// Insert axes. A step `s > 1` at axis `a` splits the following axis
    /// into `s` outer chunks.
    Unsqueeze { axes: Vec<usize>, steps: Vec<usize> },
    /// Materialise a view into a packed tensor.
    Contiguous,
    Transpose { perm: Vec<usize> },
    /// Sub-range view along the listed axes, keeping parent strides.
    Slice { axes: Vec<usize>, starts: Vec<usize>, ends: Vec<usize> },
    Concat { axis: usize },
    /// Stride-0 broadcast to `out_lens`, trailing-aligned.
    MultiBroadcast { out_lens: Vec<usize> },
    Convert { dtype: DType },
    /// Index `data` along `axis` with an integer tensor.
    Gather { axis: usize },
    Unary(UnaryOp),
    Binary(BinaryOp),
}

/// Operator tag without payload, for matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Param,
    Literal,
    Reshape,
    Flatten,
    Squeeze,
    Unsqueeze,
    Contiguous,
    Transpose,
    Slice,
    Concat,
    MultiBroadcast,
    Convert,
    Gather,
    Unary,
    Binary,
}

/// Operators that only reinterpret the layout of a packed input.
pub const RESHAPERS: &[OpKind] =
    &[OpKind::Reshape, OpKind::Flatten, OpKind::Squeeze, OpKind::Unsqueeze, OpKind::Contiguous];

fn infer_error(msg: String) -> GraphError {
    GraphError::ShapeInference(msg)
}

fn expect_args(op: &str, want: usize, got: usize) -> Result<(), GraphError> {
    if want == got {
        Ok(())
    } else {
        Err(infer_error(format!("{op} expects {want} argument(s), got {got}")))
    }
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Self::Param { .. } => OpKind::Param,
            Self::Literal { .. } => OpKind::Literal,
            Self::Reshape { .. } => OpKind::Reshape,
            Self::Flatten { .. } => OpKind::Flatten,
            Self::Squeeze { .. } => OpKind::Squeeze,
            Self::Unsqueeze { .. } => OpKind::Unsqueeze,
            Self::Contiguous => OpKind::Contiguous,
            Self::Transpose { .. } => OpKind::Transpose,
            Self::Slice { .. } => OpKind::Slice,
            Self::Concat { .. } => OpKind::Concat,
            Self::MultiBroadcast { .. } => OpKind::MultiBroadcast,
            Self::Convert { .. } => OpKind::Convert,
            Self::Gather { .. } => OpKind::Gather,
            Self::Unary(_) => OpKind::Unary,
            Self::Binary(_) => OpKind::Binary,
        }
    }

    pub fn opname(&self) -> &'static str {
        match self.kind() {
            OpKind::Param => "param",
            OpKind::Literal => "literal",
            OpKind::Reshape => "reshape",
            OpKind::Flatten => "flatten",
            OpKind::Squeeze => "squeeze",
            OpKind::Unsqueeze => "unsqueeze",
            OpKind::Contiguous => "contiguous",
            OpKind::Transpose => "transpose",
            OpKind::Slice => "slice",
            OpKind::Concat => "concat",
            OpKind::MultiBroadcast => "multibroadcast",
            OpKind::Convert => "convert",
            OpKind::Gather => "gather",
            OpKind::Unary => "unary",
            OpKind::Binary => "binary",
        }
    }

    pub fn is_pointwise(&self) -> bool {
        matches!(self, Self::Unary(_) | Self::Binary(_))
    }

    pub fn is_reshaper(&self) -> bool {
        RESHAPERS.contains(&self.kind())
    }

    /// Computes the output shape from the input shapes, validating every
    /// operator precondition along the way.
    pub fn infer_shape(&self, inputs: &[&Shape]) -> Result<Shape, GraphError> {
        match self {
            Self::Param { shape, .. } => {
                expect_args("param", 0, inputs.len())?;
                Ok(shape.clone())
            }
            Self::Literal { lens, data } => {
                expect_args("literal", 0, inputs.len())?;
                let elements: usize = lens.iter().product();
                if data.len() != elements {
                    return Err(infer_error(format!(
                        "literal has {} element(s) for lens {lens:?}",
                        data.len()
                    )));
                }
                Ok(Shape::standard(data.dtype(), lens.clone()))
            }
            Self::Reshape { dims } => {
                expect_args("reshape", 1, inputs.len())?;
                let input = inputs[0];
                if !input.is_standard() {
                    return Err(infer_error("reshape requires a standard input".to_string()));
                }
                if dims.iter().product::<usize>() != input.elements() {
                    return Err(infer_error(format!(
                        "reshape to {dims:?} changes element count from {}",
                        input.elements()
                    )));
                }
                Ok(Shape::standard(input.dtype(), dims.clone()))
            }
            Self::Flatten { axis } => {
                expect_args("flatten", 1, inputs.len())?;
                let input = inputs[0];
                if !input.is_standard() {
                    return Err(infer_error("flatten requires a standard input".to_string()));
                }
                if *axis > input.rank() {
                    return Err(infer_error(format!("flatten axis {axis} out of range")));
                }
                let outer: usize = input.lens()[..*axis].iter().product();
                let inner: usize = input.lens()[*axis..].iter().product();
                Ok(Shape::standard(input.dtype(), [outer, inner]))
            }
            Self::Squeeze { axes } => {
                expect_args("squeeze", 1, inputs.len())?;
                let input = inputs[0];
                for &axis in axes {
                    if axis >= input.rank() {
                        return Err(infer_error(format!("squeeze axis {axis} out of range")));
                    }
                    if input.lens()[axis] != 1 {
                        return Err(infer_error(format!(
                            "squeeze axis {axis} has length {}",
                            input.lens()[axis]
                        )));
                    }
                }
                let mut lens = Vec::new();
                let mut strides = Vec::new();
                for i in 0..input.rank() {
                    if !axes.contains(&i) {
                        lens.push(input.lens()[i]);
                        strides.push(input.strides()[i]);
                    }
                }
                Ok(Shape::with_strides(input.dtype(), lens, strides))
            }
            Self::Unsqueeze { axes, steps } => {
                expect_args("unsqueeze", 1, inputs.len())?;
                let input = inputs[0];
                if !input.is_standard() {
                    return Err(infer_error("unsqueeze requires a standard input".to_string()));
                }
                if axes.len() != steps.len() {
                    return Err(infer_error("unsqueeze axes/steps length mismatch".to_string()));
                }
                let mut pairs: Vec<(usize, usize)> =
                    axes.iter().copied().zip(steps.iter().copied()).collect();
                pairs.sort_by_key(|&(a, _)| a);
                let mut lens = input.lens().to_vec();
                for (axis, step) in pairs {
                    if axis > lens.len() || step == 0 {
                        return Err(infer_error(format!("unsqueeze axis {axis} out of range")));
                    }
                    lens.insert(axis, step);
                    if step != 1 {
                        let next = axis + 1;
                        if next >= lens.len() || lens[next] % step != 0 {
                            return Err(infer_error(format!(
                                "unsqueeze step {step} does not divide axis {axis}"
                            )));
                        }
                        lens[next] /= step;
                    }
                }
                Ok(Shape::standard(input.dtype(), lens))
            }
            Self::Contiguous => {
                expect_args("contiguous", 1, inputs.len())?;
                let input = inputs[0];
                Ok(Shape::standard(input.dtype(), input.lens().to_vec()))
            }
            Self::Transpose { perm } => {
                expect_args("transpose", 1, inputs.len())?;
                let input = inputs[0];
                if perm.len() != input.rank() || !is_valid_permutation(perm) {
                    return Err(infer_error(format!(
                        "transpose permutation {perm:?} invalid for rank {}",
                        input.rank()
                    )));
                }
                let lens = reorder(perm, input.lens());
                let strides = reorder(perm, input.strides());
                Ok(Shape::with_strides(input.dtype(), lens, strides))
            }
            Self::Slice { axes, starts, ends } => {
                expect_args("slice", 1, inputs.len())?;
                let input = inputs[0];
                if axes.len() != starts.len() || axes.len() != ends.len() {
                    return Err(infer_error("slice axes/starts/ends length mismatch".to_string()));
                }
                let mut lens = input.lens().to_vec();
                for ((&axis, &start), &end) in axes.iter().zip(starts).zip(ends) {
                    if axis >= input.rank() {
                        return Err(infer_error(format!("slice axis {axis} out of range")));
                    }
                    if start > end || end > input.lens()[axis] {
                        return Err(infer_error(format!(
                            "slice range {start}..{end} invalid for axis {axis} of length {}",
                            input.lens()[axis]
                        )));
                    }
                    lens[axis] = end - start;
                }
                Ok(Shape::with_strides(input.dtype(), lens, input.strides().to_vec()))
            }
            Self::Concat { axis } => {
                if inputs.is_empty() {
                    return Err(infer_error("concat requires at least one argument".to_string()));
                }
                let first = inputs[0];
                if *axis >= first.rank() {
                    return Err(infer_error(format!("concat axis {axis} out of range")));
                }
                let mut lens = first.lens().to_vec();
                for input in &inputs[1..] {
                    if input.dtype() != first.dtype() || input.rank() != first.rank() {
                        return Err(infer_error("concat arguments disagree on type or rank".to_string()));
                    }
                    for i in 0..first.rank() {
                        if i == *axis {
                            continue;
                        }
                        if input.lens()[i] != first.lens()[i] {
                            return Err(infer_error(format!(
                                "concat arguments disagree on axis {i}"
                            )));
                        }
                    }
                    lens[*axis] += input.lens()[*axis];
                }
                Ok(Shape::standard(first.dtype(), lens))
            }
            Self::MultiBroadcast { out_lens } => {
                expect_args("multibroadcast", 1, inputs.len())?;
                let input = inputs[0];
                if input.rank() > out_lens.len() {
                    return Err(infer_error(format!(
                        "multibroadcast cannot reduce rank {} to {}",
                        input.rank(),
                        out_lens.len()
                    )));
                }
                let offset = out_lens.len() - input.rank();
                let mut strides = vec![0; offset];
                for i in 0..input.rank() {
                    let len = input.lens()[i];
                    let out = out_lens[i + offset];
                    if len == out {
                        strides.push(input.strides()[i]);
                    } else if len == 1 {
                        strides.push(0);
                    } else {
                        return Err(infer_error(format!(
                            "multibroadcast axis {i} of length {len} to {out}"
                        )));
                    }
                }
                Ok(Shape::with_strides(input.dtype(), out_lens.clone(), strides))
            }
            Self::Convert { dtype } => {
                expect_args("convert", 1, inputs.len())?;
                let input = inputs[0];
                Ok(Shape::standard(*dtype, input.lens().to_vec()))
            }
            Self::Gather { axis } => {
                expect_args("gather", 2, inputs.len())?;
                let (data, indices) = (inputs[0], inputs[1]);
                if indices.dtype() != DType::I32 {
                    return Err(infer_error("gather indices must be i32".to_string()));
                }
                if *axis >= data.rank() {
                    return Err(infer_error(format!("gather axis {axis} out of range")));
                }
                let mut lens = data.lens()[..*axis].to_vec();
                lens.extend_from_slice(indices.lens());
                lens.extend_from_slice(&data.lens()[axis + 1..]);
                Ok(Shape::standard(data.dtype(), lens))
            }
            Self::Unary(_) => {
                expect_args("unary", 1, inputs.len())?;
                let input = inputs[0];
                Ok(Shape::standard(input.dtype(), input.lens().to_vec()))
            }
            Self::Binary(_) => {
                expect_args("binary", 2, inputs.len())?;
                let (a, b) = (inputs[0], inputs[1]);
                if a.dtype() != b.dtype() || a.lens() != b.lens() {
                    return Err(infer_error("binary arguments disagree on type or lengths".to_string()));
                }
                Ok(Shape::standard(a.dtype(), a.lens().to_vec()))
            }
        }
    }

    /// Computes output values from input values. Buffers are logical: element
    /// `k` of a buffer is the `k`-th element of the tensor in row-major order
    /// over its lengths, so layout-only operators are identities here.
    pub fn evaluate(&self, inputs: &[(&Shape, &Values)], out: &Shape) -> Result<Values, GraphError> {
        match self {
            Self::Param { .. } => Err(GraphError::Message("cannot evaluate an unseeded parameter".to_string())),
            Self::Literal { data, .. } => Ok(data.clone()),
            Self::Reshape { .. }
            | Self::Flatten { .. }
            | Self::Squeeze { .. }
            | Self::Unsqueeze { .. }
            | Self::Contiguous => Ok(inputs[0].1.clone()),
            Self::Transpose { perm } => {
                let (in_shape, values) = inputs[0];
                Ok(values.select(out.elements(), |k| {
                    let om = out.multi(k);
                    let mut im = vec![0; in_shape.rank()];
                    for (i, &p) in perm.iter().enumerate() {
                        im[p] = om[i];
                    }
                    row_major_index(in_shape.lens(), &im)
                }))
            }
            Self::Slice { axes, starts, .. } => {
                let (in_shape, values) = inputs[0];
                Ok(values.select(out.elements(), |k| {
                    let mut im = out.multi(k);
                    for (&axis, &start) in axes.iter().zip(starts) {
                        im[axis] += start;
                    }
                    row_major_index(in_shape.lens(), &im)
                }))
            }
            Self::Concat { axis } => {
                let axis = *axis;
                let mut axis_offsets = Vec::with_capacity(inputs.len());
                let mut total = 0;
                for (in_shape, _) in inputs {
                    axis_offsets.push(total);
                    total += in_shape.lens()[axis];
                }
                let pick = |k: usize| -> (usize, usize) {
                    let om = out.multi(k);
                    let mut which = inputs.len() - 1;
                    for (i, &off) in axis_offsets.iter().enumerate().rev() {
                        if om[axis] >= off {
                            which = i;
                            break;
                        }
                    }
                    let mut im = om;
                    im[axis] -= axis_offsets[which];
                    (which, row_major_index(inputs[which].0.lens(), &im))
                };
                match out.dtype() {
                    DType::F32 => {
                        let mut v = Vec::with_capacity(out.elements());
                        for k in 0..out.elements() {
                            let (which, idx) = pick(k);
                            match inputs[which].1 {
                                Values::F32(data) => v.push(data[idx]),
                                Values::I32(_) => {
                                    return Err(GraphError::Message("concat dtype mismatch".to_string()))
                                }
                            }
                        }
                        Ok(Values::F32(v))
                    }
                    DType::I32 => {
                        let mut v = Vec::with_capacity(out.elements());
                        for k in 0..out.elements() {
                            let (which, idx) = pick(k);
                            match inputs[which].1 {
                                Values::I32(data) => v.push(data[idx]),
                                Values::F32(_) => {
                                    return Err(GraphError::Message("concat dtype mismatch".to_string()))
                                }
                            }
                        }
                        Ok(Values::I32(v))
                    }
                }
            }
            Self::MultiBroadcast { out_lens } => {
                let (in_shape, values) = inputs[0];
                let offset = out_lens.len() - in_shape.rank();
                Ok(values.select(out.elements(), |k| {
                    let om = out.multi(k);
                    let im: Vec<usize> = (0..in_shape.rank())
                        .map(|i| if in_shape.lens()[i] == 1 { 0 } else { om[i + offset] })
                        .collect();
                    row_major_index(in_shape.lens(), &im)
                }))
            }
            Self::Convert { dtype } => Ok(inputs[0].1.convert(*dtype)),
            Self::Gather { axis } => {
                let (data_shape, data) = inputs[0];
                let (ind_shape, indices) = inputs[1];
                let indices = indices
                    .as_i32()
                    .ok_or_else(|| GraphError::Message("gather indices must be i32".to_string()))?;
                let axis = *axis;
                let axis_len = data_shape.lens()[axis] as i32;
                let ind_rank = ind_shape.rank();
                let mut mapped = Vec::with_capacity(out.elements());
                for k in 0..out.elements() {
                    let om = out.multi(k);
                    let mid = &om[axis..axis + ind_rank];
                    let raw = indices[row_major_index(ind_shape.lens(), mid)];
                    let picked = if raw < 0 { raw + axis_len } else { raw };
                    if picked < 0 || picked >= axis_len {
                        return Err(GraphError::Message(format!("gather index {raw} out of range")));
                    }
                    let mut im = om[..axis].to_vec();
                    im.push(picked as usize);
                    im.extend_from_slice(&om[axis + ind_rank..]);
                    mapped.push(row_major_index(data_shape.lens(), &im));
                }
                Ok(data.select(out.elements(), |k| mapped[k]))
            }
            Self::Unary(op) => {
                let values = inputs[0].1;
                Ok(match values {
                    Values::F32(v) => Values::F32(v.iter().map(|&x| op.evaluate_f32(x)).collect()),
                    Values::I32(v) => Values::I32(v.iter().map(|&x| op.evaluate_i32(x)).collect()),
                })
            }
            Self::Binary(op) => {
                let (a, b) = (inputs[0].1, inputs[1].1);
                match (a, b) {
                    (Values::F32(a), Values::F32(b)) => {
                        Ok(Values::F32(a.iter().zip(b).map(|(&x, &y)| op.evaluate_f32(x, y)).collect()))
                    }
                    (Values::I32(a), Values::I32(b)) => {
                        Ok(Values::I32(a.iter().zip(b).map(|(&x, &y)| op.evaluate_i32(x, y)).collect()))
                    }
                    _ => Err(GraphError::Message("binary dtype mismatch".to_string())),
                }
            }
        }
    }
}
