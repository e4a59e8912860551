//! Wire-level filter expression tree.
//!
//! Mirrors the request schema's oneof layout: an `Expression` carries at
//! most one of `column`, `literal`, or `call`, and the expression builder
//! rejects anything else. Keeping the unset case representable here is what
//! lets the builder return a deterministic invalid-argument instead of a
//! parse error.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expression {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<Literal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<Call>,
}

/// A typed scalar literal. Exactly one of the value fields must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Literal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int32_value: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int64_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub float_value: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub double_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
}

/// A named function call over argument expressions. The function name is
/// resolved by the compute-function registry at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub function_name: String,
    #[serde(default)]
    pub arguments: Vec<Expression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_lookup_options: Option<SetLookupValues>,
}

/// The only options variant defined: a set of string values for
/// set-membership functions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetLookupValues {
    pub values: Vec<String>,
}

impl Expression {
    pub fn column(name: impl Into<String>) -> Self {
        Expression {
            column: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn literal(literal: Literal) -> Self {
        Expression {
            literal: Some(literal),
            ..Default::default()
        }
    }

    pub fn call(function_name: impl Into<String>, arguments: Vec<Expression>) -> Self {
        Expression {
            call: Some(Call {
                function_name: function_name.into(),
                arguments,
                set_lookup_options: None,
            }),
            ..Default::default()
        }
    }

    pub fn call_with_set_lookup(
        function_name: impl Into<String>,
        arguments: Vec<Expression>,
        values: Vec<String>,
    ) -> Self {
        Expression {
            call: Some(Call {
                function_name: function_name.into(),
                arguments,
                set_lookup_options: Some(SetLookupValues { values }),
            }),
            ..Default::default()
        }
    }
}

impl Literal {
    pub fn bool(v: bool) -> Self {
        Literal {
            bool_value: Some(v),
            ..Default::default()
        }
    }

    pub fn int32(v: i32) -> Self {
        Literal {
            int32_value: Some(v),
            ..Default::default()
        }
    }

    pub fn int64(v: i64) -> Self {
        Literal {
            int64_value: Some(v),
            ..Default::default()
        }
    }

    pub fn float(v: f32) -> Self {
        Literal {
            float_value: Some(v),
            ..Default::default()
        }
    }

    pub fn double(v: f64) -> Self {
        Literal {
            double_value: Some(v),
            ..Default::default()
        }
    }

    pub fn string(v: impl Into<String>) -> Self {
        Literal {
            string_value: Some(v.into()),
            ..Default::default()
        }
    }
}
