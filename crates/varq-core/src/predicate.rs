//! Compiled filter expressions.
//!
//! [`build_predicate`] folds the wire-level [`Expression`] tree into a
//! [`PredicateExpr`] once per query. The fold is pure: no I/O, no shared
//! state, and every malformed node is a deterministic invalid-argument.
//! Function names pass through verbatim; resolving them is the registry's
//! job at evaluation time.

use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array, RecordBatch,
    Scalar, StringArray,
};
use arrow_schema::DataType;

use crate::error::QueryError;
use crate::expr::{Expression, Literal};
use crate::registry::{ColumnarValue, FunctionRegistry, SetLookupOptions};

/// A typed scalar constant in a compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Utf8(String),
}

impl ScalarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float32(_) => DataType::Float32,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Utf8(_) => DataType::Utf8,
        }
    }

    /// Materialize as a one-element array.
    pub fn to_array(&self) -> ArrayRef {
        match self {
            ScalarValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v])),
            ScalarValue::Int32(v) => Arc::new(Int32Array::from(vec![*v])),
            ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v])),
            ScalarValue::Float32(v) => Arc::new(Float32Array::from(vec![*v])),
            ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v])),
            ScalarValue::Utf8(v) => Arc::new(StringArray::from(vec![v.clone()])),
        }
    }

    /// Wrap as an Arrow scalar datum for the compute kernels.
    pub fn to_scalar(&self) -> Scalar<ArrayRef> {
        Scalar::new(self.to_array())
    }
}

/// An executable expression bound against the compute-function registry.
#[derive(Debug, Clone)]
pub enum PredicateExpr {
    /// A field reference by column name.
    Field(String),
    Literal(ScalarValue),
    Call {
        function: String,
        args: Vec<PredicateExpr>,
        options: Option<Arc<SetLookupOptions>>,
    },
}

impl PredicateExpr {
    /// Evaluate against one record batch. Field references bind to the
    /// batch's schema; calls dispatch through the registry.
    pub fn evaluate(
        &self,
        batch: &RecordBatch,
        registry: &FunctionRegistry,
    ) -> Result<ColumnarValue, QueryError> {
        match self {
            PredicateExpr::Field(name) => batch
                .column_by_name(name)
                .cloned()
                .map(ColumnarValue::Array)
                .ok_or_else(|| QueryError::InvalidArgument(format!("column not found: {name}"))),
            PredicateExpr::Literal(value) => Ok(ColumnarValue::Scalar(value.clone())),
            PredicateExpr::Call {
                function,
                args,
                options,
            } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.evaluate(batch, registry)?);
                }
                registry.call(function, &values, options.as_deref(), batch.num_rows())
            }
        }
    }
}

/// Translate a wire expression tree into an executable one.
pub fn build_predicate(expression: &Expression) -> Result<PredicateExpr, QueryError> {
    match (&expression.column, &expression.literal, &expression.call) {
        (Some(name), None, None) => Ok(PredicateExpr::Field(name.clone())),
        (None, Some(literal), None) => Ok(PredicateExpr::Literal(build_literal(literal)?)),
        (None, None, Some(call)) => {
            let mut args = Vec::with_capacity(call.arguments.len());
            for argument in &call.arguments {
                args.push(build_predicate(argument)?);
            }

            let options = match &call.set_lookup_options {
                Some(lookup) => {
                    let values =
                        StringArray::from_iter_values(lookup.values.iter().map(String::as_str));
                    Some(Arc::new(SetLookupOptions::new(values, true)))
                }
                None => None,
            };

            Ok(PredicateExpr::Call {
                function: call.function_name.clone(),
                args,
                options,
            })
        }
        (None, None, None) => Err(QueryError::InvalidArgument(
            "expression type not set".to_string(),
        )),
        _ => Err(QueryError::InvalidArgument(
            "expression sets more than one variant".to_string(),
        )),
    }
}

fn build_literal(literal: &Literal) -> Result<ScalarValue, QueryError> {
    let mut values = Vec::new();
    if let Some(v) = literal.bool_value {
        values.push(ScalarValue::Boolean(v));
    }
    if let Some(v) = literal.int32_value {
        values.push(ScalarValue::Int32(v));
    }
    if let Some(v) = literal.int64_value {
        values.push(ScalarValue::Int64(v));
    }
    if let Some(v) = literal.float_value {
        values.push(ScalarValue::Float32(v));
    }
    if let Some(v) = literal.double_value {
        values.push(ScalarValue::Float64(v));
    }
    if let Some(v) = &literal.string_value {
        values.push(ScalarValue::Utf8(v.clone()));
    }

    match values.len() {
        0 => Err(QueryError::InvalidArgument(
            "literal type not set".to_string(),
        )),
        1 => Ok(values.pop().unwrap()),
        _ => Err(QueryError::InvalidArgument(
            "literal sets more than one value".to_string(),
        )),
    }
}
