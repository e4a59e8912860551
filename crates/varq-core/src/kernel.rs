//! The `string_list_contains_any` predicate kernel.
//!
//! Answers, per row, whether any non-null element of a list-of-strings
//! column appears in a fixed lookup set. The generic set-membership
//! function covers flat string columns only; this kernel exists for the
//! list-valued case.
//!
//! Output contract: a boolean column of the input's length with no null
//! slots. A null list yields false, and null elements never match: per
//! the columnar format, a null slot may occupy non-empty space in the data
//! buffer whose content is undefined, so its bytes must not be compared.

use arrow_array::{Array, ArrayRef, BooleanArray, GenericListArray, OffsetSizeTrait, StringArray};
use arrow_schema::DataType;
use rustc_hash::FxHashSet;

use crate::error::QueryError;

/// The name the kernel is registered under; clients call it verbatim.
pub const STRING_LIST_CONTAINS_ANY: &str = "string_list_contains_any";

/// Per-query kernel state: the hashed lookup set, plus the values array it
/// was built from. The strings are copied into the set (borrowed views
/// would tie the state's lifetime to the options), but the array is
/// retained alongside so the state mirrors what the options carried.
#[derive(Debug)]
pub struct SetLookupState {
    values: StringArray,
    set: FxHashSet<String>,
}

impl SetLookupState {
    /// Build the hashed set from the options' value array. Null entries
    /// are skipped; an effectively empty set is rejected.
    pub fn try_new(values: &StringArray) -> Result<Self, QueryError> {
        let mut set = FxHashSet::default();
        for i in 0..values.len() {
            if !values.is_null(i) {
                set.insert(values.value(i).to_string());
            }
        }
        if set.is_empty() {
            return Err(QueryError::InvalidArgument(
                "set lookup value set is empty".to_string(),
            ));
        }
        Ok(SetLookupState {
            values: values.clone(),
            set,
        })
    }

    pub fn contains(&self, value: &str) -> bool {
        self.set.contains(value)
    }

    /// The sole member when the set has exactly one element.
    fn single_value(&self) -> Option<&str> {
        if self.set.len() == 1 {
            self.set.iter().next().map(String::as_str)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn values(&self) -> &StringArray {
        &self.values
    }
}

/// Execute the kernel over one column.
///
/// Accepts `List<Utf8>` and `LargeList<Utf8>` regardless of the element
/// field's name: both `item` (Arrow convention) and `element` (Parquet
/// convention) match, since dispatch here is structural.
pub fn string_list_contains_any(
    column: &ArrayRef,
    state: &SetLookupState,
) -> Result<BooleanArray, QueryError> {
    match column.data_type() {
        DataType::List(field) if field.data_type() == &DataType::Utf8 => {
            let lists = column
                .as_any()
                .downcast_ref::<GenericListArray<i32>>()
                .ok_or_else(|| {
                    QueryError::Internal("list column failed to downcast".to_string())
                })?;
            exec_lists(lists, state)
        }
        DataType::LargeList(field) if field.data_type() == &DataType::Utf8 => {
            let lists = column
                .as_any()
                .downcast_ref::<GenericListArray<i64>>()
                .ok_or_else(|| {
                    QueryError::Internal("large list column failed to downcast".to_string())
                })?;
            exec_lists(lists, state)
        }
        other => Err(QueryError::InvalidArgument(format!(
            "{STRING_LIST_CONTAINS_ANY} expects a list of strings, got {other}"
        ))),
    }
}

fn exec_lists<O: OffsetSizeTrait>(
    lists: &GenericListArray<O>,
    state: &SetLookupState,
) -> Result<BooleanArray, QueryError> {
    let strings = lists
        .values()
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| {
            QueryError::Internal("list elements failed to downcast to strings".to_string())
        })?;

    // Fast path for a single lookup value: direct equality beats the
    // hashed probe.
    if let Some(single) = state.single_value() {
        exec_with_comparator(lists, strings, |value| value == single)
    } else {
        exec_with_comparator(lists, strings, |value| state.contains(value))
    }
}

fn exec_with_comparator<O: OffsetSizeTrait>(
    lists: &GenericListArray<O>,
    strings: &StringArray,
    matches: impl Fn(&str) -> bool,
) -> Result<BooleanArray, QueryError> {
    let offsets = lists.value_offsets();
    let mut out = Vec::with_capacity(lists.len());
    for i in 0..lists.len() {
        if lists.is_null(i) {
            out.push(false);
            continue;
        }
        let start = offsets[i].as_usize();
        let end = offsets[i + 1].as_usize();
        let mut matched = false;
        for j in start..end {
            if strings.is_valid(j) && matches(strings.value(j)) {
                matched = true;
                break;
            }
        }
        out.push(matched);
    }
    // Built from plain bools, so the output carries no null buffer.
    Ok(BooleanArray::from(out))
}
