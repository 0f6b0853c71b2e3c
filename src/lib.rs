//! Graph-level tensor IR with a combinator pattern matcher and a set of
//! rewrite passes over the reshape/transpose/slice/concat/broadcast algebra.

pub mod graph;
pub mod jit;
pub mod matcher;
pub mod passes;
pub mod rules;
pub mod shape;
pub mod tensor;

pub use graph::{GraphError, Module};
pub use passes::{Pass, SimplifyShapes};
pub use shape::{DType, Shape};
pub use tensor::Values;
