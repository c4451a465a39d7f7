// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Expression AST nodes

use super::operator::{BinaryOperator, UnaryOperator};
use smallvec::SmallVec;

/// Function and method arguments; almost every FHIRPath call takes four or fewer
pub type Arguments = SmallVec<[ExpressionNode; 4]>;

/// Literal values as written in the expression text
///
/// Numeric and temporal literals keep their source text and are converted by the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    /// Boolean literal
    Boolean(bool),
    /// String literal with escapes already processed
    String(String),
    /// Integer literal
    Integer(i64),
    /// Decimal literal source text
    Decimal(String),
    /// Date literal without the leading `@`
    Date(String),
    /// DateTime literal without the leading `@`
    DateTime(String),
    /// Time literal without the leading `@T`
    Time(String),
    /// Quantity literal (value and unit)
    Quantity {
        /// Numeric value source text
        value: String,
        /// UCUM unit or calendar duration keyword
        unit: String,
    },
    /// The empty collection `{}`
    Null,
}

/// `$this`, `$index` and `$total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialVariable {
    /// Current item of an iteration
    This,
    /// Position of the current item
    Index,
    /// Running total of `aggregate()`
    Total,
}

/// The main expression node
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionNode {
    /// Literal value
    Literal(LiteralValue),
    /// Property name or resource type at the start of a path
    Identifier(String),
    /// Environment variable (`%resource`, `%patient`, `%'vs-name'`)
    Variable(String),
    /// Iteration variable
    Special(SpecialVariable),
    /// Member navigation (`base.path`)
    Path {
        /// Base expression
        base: Box<ExpressionNode>,
        /// Member name
        path: String,
    },
    /// Indexer (`base[index]`)
    Index {
        /// Base expression
        base: Box<ExpressionNode>,
        /// Index expression
        index: Box<ExpressionNode>,
    },
    /// Binary operation
    BinaryOp(Box<BinaryOpData>),
    /// Unary operation
    UnaryOp {
        /// Operator
        op: UnaryOperator,
        /// Operand
        operand: Box<ExpressionNode>,
    },
    /// Function called on the current focus (`where(...)` at the start of a path)
    FunctionCall(Box<FunctionCallData>),
    /// Function invoked on an explicit base (`answer.value.memberOf(...)`)
    MethodCall(Box<MethodCallData>),
    /// `expression is Type`
    TypeCheck {
        /// Checked expression
        expression: Box<ExpressionNode>,
        /// Type name without namespace
        type_name: String,
    },
    /// `expression as Type`
    TypeCast {
        /// Cast expression
        expression: Box<ExpressionNode>,
        /// Type name without namespace
        type_name: String,
    },
}

/// Binary operation data
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryOpData {
    /// Operator
    pub op: BinaryOperator,
    /// Left operand
    pub left: ExpressionNode,
    /// Right operand
    pub right: ExpressionNode,
}

/// Function call data
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallData {
    /// Function name
    pub name: String,
    /// Arguments, unevaluated
    pub args: Arguments,
}

/// Method call data
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCallData {
    /// Receiver expression
    pub base: ExpressionNode,
    /// Function name
    pub method: String,
    /// Arguments, unevaluated
    pub args: Arguments,
}

impl ExpressionNode {
    /// Create a literal node
    pub fn literal(value: LiteralValue) -> Self {
        Self::Literal(value)
    }

    /// Create an identifier node
    pub fn identifier(name: impl Into<String>) -> Self {
        Self::Identifier(name.into())
    }

    /// Create an environment variable node
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    /// Create a member navigation node
    pub fn path(base: ExpressionNode, path: impl Into<String>) -> Self {
        Self::Path {
            base: Box::new(base),
            path: path.into(),
        }
    }

    /// Create an indexer node
    pub fn index(base: ExpressionNode, index: ExpressionNode) -> Self {
        Self::Index {
            base: Box::new(base),
            index: Box::new(index),
        }
    }

    /// Create a binary operation node
    pub fn binary_op(op: BinaryOperator, left: ExpressionNode, right: ExpressionNode) -> Self {
        Self::BinaryOp(Box::new(BinaryOpData { op, left, right }))
    }

    /// Create a unary operation node
    pub fn unary_op(op: UnaryOperator, operand: ExpressionNode) -> Self {
        Self::UnaryOp {
            op,
            operand: Box::new(operand),
        }
    }

    /// Create a function call node
    pub fn function_call(name: impl Into<String>, args: Arguments) -> Self {
        Self::FunctionCall(Box::new(FunctionCallData {
            name: name.into(),
            args,
        }))
    }

    /// Create a method call node
    pub fn method_call(base: ExpressionNode, method: impl Into<String>, args: Arguments) -> Self {
        Self::MethodCall(Box::new(MethodCallData {
            base,
            method: method.into(),
            args,
        }))
    }

    /// Create a type check node
    pub fn type_check(expression: ExpressionNode, type_name: impl Into<String>) -> Self {
        Self::TypeCheck {
            expression: Box::new(expression),
            type_name: type_name.into(),
        }
    }

    /// Create a type cast node
    pub fn type_cast(expression: ExpressionNode, type_name: impl Into<String>) -> Self {
        Self::TypeCast {
            expression: Box::new(expression),
            type_name: type_name.into(),
        }
    }

    /// Name of the type referenced by a type-specifier argument (`ofType(Coding)`)
    pub fn as_type_name(&self) -> Option<&str> {
        match self {
            ExpressionNode::Identifier(name) => Some(name),
            ExpressionNode::Path { path, .. } => Some(path),
            ExpressionNode::Literal(LiteralValue::String(name)) => Some(name),
            _ => None,
        }
    }

    /// True when any node in the tree calls one of `names`
    pub fn calls_any(&self, names: &[&str]) -> bool {
        match self {
            ExpressionNode::Literal(_)
            | ExpressionNode::Identifier(_)
            | ExpressionNode::Variable(_)
            | ExpressionNode::Special(_) => false,
            ExpressionNode::Path { base, .. } => base.calls_any(names),
            ExpressionNode::Index { base, index } => base.calls_any(names) || index.calls_any(names),
            ExpressionNode::BinaryOp(data) => {
                data.left.calls_any(names) || data.right.calls_any(names)
            }
            ExpressionNode::UnaryOp { operand, .. } => operand.calls_any(names),
            ExpressionNode::FunctionCall(data) => {
                names.contains(&data.name.as_str()) || data.args.iter().any(|a| a.calls_any(names))
            }
            ExpressionNode::MethodCall(data) => {
                names.contains(&data.method.as_str())
                    || data.base.calls_any(names)
                    || data.args.iter().any(|a| a.calls_any(names))
            }
            ExpressionNode::TypeCheck { expression, .. }
            | ExpressionNode::TypeCast { expression, .. } => expression.calls_any(names),
        }
    }
}
