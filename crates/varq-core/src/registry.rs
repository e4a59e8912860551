//! The compute-function registry and its builtin functions.
//!
//! The registry maps function names, taken verbatim from the wire, onto
//! scalar-function implementations. It is populated once at startup and
//! read-only afterwards; unknown names fail at call time, not at build
//! time. Comparison and boolean builtins wrap the Arrow compute kernels;
//! set membership and the list kernel are implemented here because the
//! Arrow crate does not ship them.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use arrow::compute::kernels::boolean::{and_kleene, is_not_null, not, or_kleene};
use arrow::compute::kernels::cmp;
use arrow_array::{Array, ArrayRef, BooleanArray, Datum, Scalar, StringArray};
use arrow_schema::DataType;

use crate::error::QueryError;
use crate::kernel::{self, SetLookupState, STRING_LIST_CONTAINS_ANY};
use crate::predicate::ScalarValue;

/// A value produced while evaluating an expression against a batch:
/// either a column of the batch's length or a scalar constant.
#[derive(Debug, Clone)]
pub enum ColumnarValue {
    Array(ArrayRef),
    Scalar(ScalarValue),
}

impl ColumnarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnarValue::Array(array) => array.data_type().clone(),
            ColumnarValue::Scalar(value) => value.data_type(),
        }
    }

    /// Coerce into a boolean column of `num_rows` rows, broadcasting a
    /// scalar. The filter mask and the boolean builtins both funnel
    /// through here.
    pub fn into_boolean_mask(self, num_rows: usize) -> Result<BooleanArray, QueryError> {
        match self {
            ColumnarValue::Array(array) => array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .cloned()
                .ok_or_else(|| {
                    QueryError::InvalidArgument(format!(
                        "expected a boolean column, got {}",
                        array.data_type()
                    ))
                }),
            ColumnarValue::Scalar(ScalarValue::Boolean(value)) => {
                Ok(BooleanArray::from(vec![value; num_rows]))
            }
            ColumnarValue::Scalar(value) => Err(QueryError::InvalidArgument(format!(
                "expected a boolean value, got {}",
                value.data_type()
            ))),
        }
    }
}

/// Options for the set-membership functions: the lookup values as a
/// retained string array, plus the null-skip flag. The hashed kernel
/// state is built lazily on first execution and shared for the rest of
/// the query.
#[derive(Debug)]
pub struct SetLookupOptions {
    pub values: StringArray,
    pub skip_nulls: bool,
    state: OnceLock<Arc<SetLookupState>>,
}

impl SetLookupOptions {
    pub fn new(values: StringArray, skip_nulls: bool) -> Self {
        SetLookupOptions {
            values,
            skip_nulls,
            state: OnceLock::new(),
        }
    }

    /// The per-query kernel state. Validation errors surface on first
    /// execution; a successful init is reused across batches and workers.
    pub fn state(&self) -> Result<Arc<SetLookupState>, QueryError> {
        if let Some(state) = self.state.get() {
            return Ok(state.clone());
        }
        let state = Arc::new(SetLookupState::try_new(&self.values)?);
        Ok(self.state.get_or_init(|| state).clone())
    }
}

type ScalarFunctionImpl =
    fn(&[ColumnarValue], Option<&SetLookupOptions>, usize) -> Result<ColumnarValue, QueryError>;

/// Name-to-function table. Written once at startup, read-only thereafter;
/// shared by reference among all workers.
pub struct FunctionRegistry {
    functions: HashMap<&'static str, ScalarFunctionImpl>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry {
            functions: HashMap::new(),
        }
    }

    /// Registry with the builtin comparison/boolean/set functions and the
    /// custom list kernel. Call once at startup, before serving traffic.
    pub fn with_builtins() -> Result<Self, QueryError> {
        let mut registry = FunctionRegistry::new();
        registry.add_function("equal", fn_equal)?;
        registry.add_function("not_equal", fn_not_equal)?;
        registry.add_function("less", fn_less)?;
        registry.add_function("less_equal", fn_less_equal)?;
        registry.add_function("greater", fn_greater)?;
        registry.add_function("greater_equal", fn_greater_equal)?;
        registry.add_function("and_kleene", fn_and_kleene)?;
        registry.add_function("or_kleene", fn_or_kleene)?;
        registry.add_function("invert", fn_invert)?;
        registry.add_function("is_valid", fn_is_valid)?;
        registry.add_function("is_in", fn_is_in)?;
        registry.add_function(STRING_LIST_CONTAINS_ANY, fn_string_list_contains_any)?;
        Ok(registry)
    }

    pub fn add_function(
        &mut self,
        name: &'static str,
        function: ScalarFunctionImpl,
    ) -> Result<(), QueryError> {
        if self.functions.insert(name, function).is_some() {
            return Err(QueryError::Internal(format!(
                "function already registered: {name}"
            )));
        }
        Ok(())
    }

    pub fn call(
        &self,
        name: &str,
        args: &[ColumnarValue],
        options: Option<&SetLookupOptions>,
        num_rows: usize,
    ) -> Result<ColumnarValue, QueryError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| QueryError::InvalidArgument(format!("unknown function: {name}")))?;
        function(args, options, num_rows)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.functions.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        FunctionRegistry::new()
    }
}

// ---------------------------------------------------------------------------
// Comparison builtins
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn name(self) -> &'static str {
        match self {
            CmpOp::Eq => "equal",
            CmpOp::Ne => "not_equal",
            CmpOp::Lt => "less",
            CmpOp::Le => "less_equal",
            CmpOp::Gt => "greater",
            CmpOp::Ge => "greater_equal",
        }
    }
}

/// One side of a comparison, ready to hand to the Arrow `cmp` kernels.
enum CmpArg {
    Array(ArrayRef),
    Scalar(Scalar<ArrayRef>),
}

impl CmpArg {
    fn datum(&self) -> &dyn Datum {
        match self {
            CmpArg::Array(array) => array,
            CmpArg::Scalar(scalar) => scalar,
        }
    }
}

/// Prepare one comparison operand, casting a numeric scalar to the other
/// side's numeric type when the widths differ. The Arrow kernels do not
/// coerce, and wire literals pick their width by magnitude, so an int32
/// literal against an int64 column is the normal case. Non-numeric
/// mismatches pass through uncast and fail in the kernel.
fn cmp_arg(value: &ColumnarValue, other_type: &DataType) -> Result<CmpArg, QueryError> {
    match value {
        ColumnarValue::Array(array) => Ok(CmpArg::Array(array.clone())),
        ColumnarValue::Scalar(scalar) => {
            let array = scalar.to_array();
            if array.data_type() == other_type
                || !(array.data_type().is_numeric() && other_type.is_numeric())
            {
                return Ok(CmpArg::Scalar(Scalar::new(array)));
            }
            let cast = arrow::compute::cast(&array, other_type).map_err(|e| {
                QueryError::InvalidArgument(format!(
                    "cannot compare {} literal against {} column: {e}",
                    scalar.data_type(),
                    other_type
                ))
            })?;
            Ok(CmpArg::Scalar(Scalar::new(cast)))
        }
    }
}

fn fn_cmp(
    op: CmpOp,
    args: &[ColumnarValue],
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    if args.len() != 2 {
        return Err(QueryError::InvalidArgument(format!(
            "{} expects 2 arguments, got {}",
            op.name(),
            args.len()
        )));
    }

    let lhs = cmp_arg(&args[0], &args[1].data_type())?;
    let rhs = cmp_arg(&args[1], &args[0].data_type())?;

    let result = match op {
        CmpOp::Eq => cmp::eq(lhs.datum(), rhs.datum()),
        CmpOp::Ne => cmp::neq(lhs.datum(), rhs.datum()),
        CmpOp::Lt => cmp::lt(lhs.datum(), rhs.datum()),
        CmpOp::Le => cmp::lt_eq(lhs.datum(), rhs.datum()),
        CmpOp::Gt => cmp::gt(lhs.datum(), rhs.datum()),
        CmpOp::Ge => cmp::gt_eq(lhs.datum(), rhs.datum()),
    }
    .map_err(|e| QueryError::InvalidArgument(format!("{} failed: {e}", op.name())))?;

    // Two scalar operands produce a one-row result; fold it back into a
    // scalar so downstream broadcasting works against any batch length.
    if matches!((&lhs, &rhs), (CmpArg::Scalar(_), CmpArg::Scalar(_))) && num_rows != result.len() {
        let value = result.value(0);
        return Ok(ColumnarValue::Scalar(ScalarValue::Boolean(value)));
    }

    Ok(ColumnarValue::Array(Arc::new(result)))
}

fn fn_equal(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    fn_cmp(CmpOp::Eq, args, num_rows)
}

fn fn_not_equal(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    fn_cmp(CmpOp::Ne, args, num_rows)
}

fn fn_less(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    fn_cmp(CmpOp::Lt, args, num_rows)
}

fn fn_less_equal(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    fn_cmp(CmpOp::Le, args, num_rows)
}

fn fn_greater(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    fn_cmp(CmpOp::Gt, args, num_rows)
}

fn fn_greater_equal(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    fn_cmp(CmpOp::Ge, args, num_rows)
}

// ---------------------------------------------------------------------------
// Boolean builtins
// ---------------------------------------------------------------------------

fn boolean_pair(
    name: &str,
    args: &[ColumnarValue],
    num_rows: usize,
) -> Result<(BooleanArray, BooleanArray), QueryError> {
    if args.len() != 2 {
        return Err(QueryError::InvalidArgument(format!(
            "{name} expects 2 arguments, got {}",
            args.len()
        )));
    }
    let left = args[0].clone().into_boolean_mask(num_rows)?;
    let right = args[1].clone().into_boolean_mask(num_rows)?;
    Ok((left, right))
}

fn fn_and_kleene(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    let (left, right) = boolean_pair("and_kleene", args, num_rows)?;
    let result = and_kleene(&left, &right)
        .map_err(|e| QueryError::InvalidArgument(format!("and_kleene failed: {e}")))?;
    Ok(ColumnarValue::Array(Arc::new(result)))
}

fn fn_or_kleene(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    let (left, right) = boolean_pair("or_kleene", args, num_rows)?;
    let result = or_kleene(&left, &right)
        .map_err(|e| QueryError::InvalidArgument(format!("or_kleene failed: {e}")))?;
    Ok(ColumnarValue::Array(Arc::new(result)))
}

fn fn_invert(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    if args.len() != 1 {
        return Err(QueryError::InvalidArgument(format!(
            "invert expects 1 argument, got {}",
            args.len()
        )));
    }
    let mask = args[0].clone().into_boolean_mask(num_rows)?;
    let result =
        not(&mask).map_err(|e| QueryError::InvalidArgument(format!("invert failed: {e}")))?;
    Ok(ColumnarValue::Array(Arc::new(result)))
}

fn fn_is_valid(
    args: &[ColumnarValue],
    _options: Option<&SetLookupOptions>,
    _num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    if args.len() != 1 {
        return Err(QueryError::InvalidArgument(format!(
            "is_valid expects 1 argument, got {}",
            args.len()
        )));
    }
    match &args[0] {
        ColumnarValue::Array(array) => {
            let result = is_not_null(array.as_ref())
                .map_err(|e| QueryError::InvalidArgument(format!("is_valid failed: {e}")))?;
            Ok(ColumnarValue::Array(Arc::new(result)))
        }
        // A materialized literal is never null.
        ColumnarValue::Scalar(_) => Ok(ColumnarValue::Scalar(ScalarValue::Boolean(true))),
    }
}

// ---------------------------------------------------------------------------
// Set membership
// ---------------------------------------------------------------------------

/// Membership of a flat string column in the options' value set. Null
/// inputs never match when null-skip is on (the only mode the expression
/// builder produces). The output carries no null slots.
fn fn_is_in(
    args: &[ColumnarValue],
    options: Option<&SetLookupOptions>,
    _num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    let options = options.ok_or_else(|| {
        QueryError::InvalidArgument("is_in requires set lookup options".to_string())
    })?;
    if args.len() != 1 {
        return Err(QueryError::InvalidArgument(format!(
            "is_in expects 1 argument, got {}",
            args.len()
        )));
    }
    let state = options.state()?;

    match &args[0] {
        ColumnarValue::Array(array) => {
            let strings = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| {
                    QueryError::InvalidArgument(format!(
                        "is_in expects a string column, got {}",
                        array.data_type()
                    ))
                })?;
            let mut out = Vec::with_capacity(strings.len());
            for i in 0..strings.len() {
                out.push(strings.is_valid(i) && state.contains(strings.value(i)));
            }
            Ok(ColumnarValue::Array(Arc::new(BooleanArray::from(out))))
        }
        ColumnarValue::Scalar(ScalarValue::Utf8(value)) => Ok(ColumnarValue::Scalar(
            ScalarValue::Boolean(state.contains(value)),
        )),
        ColumnarValue::Scalar(value) => Err(QueryError::InvalidArgument(format!(
            "is_in expects a string value, got {}",
            value.data_type()
        ))),
    }
}

fn fn_string_list_contains_any(
    args: &[ColumnarValue],
    options: Option<&SetLookupOptions>,
    _num_rows: usize,
) -> Result<ColumnarValue, QueryError> {
    let options = options.ok_or_else(|| {
        QueryError::InvalidArgument(format!(
            "{STRING_LIST_CONTAINS_ANY} requires set lookup options"
        ))
    })?;
    if args.len() != 1 {
        return Err(QueryError::InvalidArgument(format!(
            "{STRING_LIST_CONTAINS_ANY} expects 1 argument, got {}",
            args.len()
        )));
    }
    match &args[0] {
        ColumnarValue::Array(array) => {
            let state = options.state()?;
            let result = kernel::string_list_contains_any(array, &state)?;
            Ok(ColumnarValue::Array(Arc::new(result)))
        }
        ColumnarValue::Scalar(_) => Err(QueryError::InvalidArgument(format!(
            "{STRING_LIST_CONTAINS_ANY} expects a list column"
        ))),
    }
}
