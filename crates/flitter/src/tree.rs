//! The immutable expression tree produced by the parser.
//!
//! Expressions form a closed algebraic family with two operations defined
//! over the whole of it: partial evaluation (`simplify`) and evaluation
//! proper (`evaluate`). Structural sharing through `Arc` is allowed; nothing
//! ever observes mutation of a constructed expression.

use std::sync::Arc;

use ahash::AHashSet;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::{nodes::NodeQuery, symbols::Symbol, values::Vector};

/// Unary operators over the numeric vector algebra, plus logical `Not`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOperator {
    Positive,
    Negative,
    Ceil,
    Floor,
    Fract,
    Not,
}

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MathOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Power,
}

/// Comparison operators; these always produce true or false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOperator {
    EqualTo,
    NotEqualTo,
    LessThan,
    GreaterThan,
    LessThanOrEqualTo,
    GreaterThanOrEqualTo,
}

/// Value-preserving logical operators: `And` and `Or` return one of their
/// operands, `Xor` returns the single truthy operand or false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicOperator {
    And,
    Or,
    Xor,
}

/// A single-name binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub name: Symbol,
    pub expr: Expression,
}

impl Binding {
    #[must_use]
    pub fn new(name: impl Into<Symbol>, expr: Expression) -> Self {
        Self { name: name.into(), expr }
    }
}

/// A multi-name binding: the right-hand vector is unpacked positionally,
/// wrapping when it is shorter than the name list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolyBinding {
    pub names: Vec<Symbol>,
    pub expr: Expression,
}

impl PolyBinding {
    #[must_use]
    pub fn new(names: impl IntoIterator<Item = impl Into<Symbol>>, expr: Expression) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            expr,
        }
    }
}

/// One arm of an `IfElse` chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfCondition {
    pub condition: Expression,
    pub then: Expression,
}

impl IfCondition {
    #[must_use]
    pub fn new(condition: Expression, then: Expression) -> Self {
        Self { condition, then }
    }
}

/// A user function definition.
///
/// `captures` is filled by the simplifier: the free names of the simplified
/// body that are not parameters. A function whose only free name is itself
/// is `recursive`. `None` means the analysis has not run yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: Symbol,
    pub parameters: Vec<Binding>,
    pub body: Expression,
    pub captures: Option<Vec<Symbol>>,
    pub recursive: bool,
}

impl FunctionDef {
    #[must_use]
    pub fn new(name: impl Into<Symbol>, parameters: Vec<Binding>, body: Expression) -> Self {
        Self {
            name: name.into(),
            parameters,
            body,
            captures: None,
            recursive: false,
        }
    }
}

/// An expression in the program tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal(Vector),
    Name(Symbol),
    /// Reads the state dictionary at the evaluated key.
    Lookup(Box<Expression>),
    /// Selects nodes from the graph built so far this frame.
    Search(NodeQuery),
    Unary {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    Math {
        op: MathOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Compare {
        op: CompareOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Logic {
        op: LogicOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Range {
        start: Box<Expression>,
        stop: Box<Expression>,
        step: Box<Expression>,
    },
    Slice {
        expr: Box<Expression>,
        index: Box<Expression>,
    },
    Sequence(Vec<Expression>),
    /// Constructs a fresh node of the given kind and tags.
    Node { kind: Symbol, tags: Vec<Symbol> },
    /// Adds a tag to every node in the target value.
    Tag {
        expr: Box<Expression>,
        tag: Symbol,
    },
    /// Sets attributes, in order, on every node in the target value.
    Attributes {
        expr: Box<Expression>,
        bindings: Vec<Binding>,
    },
    /// Appends the child nodes to every node in the target value.
    Append {
        expr: Box<Expression>,
        children: Box<Expression>,
    },
    /// A binding form whose names join the enclosing scope.
    Let { bindings: Vec<PolyBinding> },
    /// A binding form scoped to its body.
    InlineLet {
        body: Box<Expression>,
        bindings: Vec<PolyBinding>,
    },
    For {
        names: Vec<Symbol>,
        source: Box<Expression>,
        body: Box<Expression>,
    },
    IfElse {
        conditions: Vec<IfCondition>,
        else_: Option<Box<Expression>>,
    },
    Call {
        function: Box<Expression>,
        args: Vec<Expression>,
        kwargs: Vec<Binding>,
    },
    Function(Arc<FunctionDef>),
    /// A side channel from program to engine (`tempo`, `quantum`, ...).
    Pragma {
        name: Symbol,
        expr: Box<Expression>,
    },
    /// Binds names exported by another program file.
    Import {
        names: Vec<Symbol>,
        path: Box<Expression>,
    },
    /// Writes folded top-level bindings into the state dictionary.
    StoreGlobal { bindings: Vec<Binding> },
}

/// The root of a program: a sequence of top-level items.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Top {
    pub items: Vec<Expression>,
}

impl Top {
    #[must_use]
    pub fn new(items: Vec<Expression>) -> Self {
        Self { items }
    }

    /// Total expression count, for load-time diagnostics.
    #[must_use]
    pub fn count_expressions(&self) -> usize {
        self.items
            .iter()
            .map(|item| item.reduce(&|_, child_counts: Vec<usize>| child_counts.iter().sum::<usize>() + 1))
            .sum()
    }

    /// The literal paths named by `Import` items, for preloading.
    #[must_use]
    pub fn imported_paths(&self) -> Vec<String> {
        fn walk(expr: &Expression, paths: &mut Vec<String>) {
            if let Expression::Import { path, .. } = expr
                && let Expression::Literal(value) = path.as_ref()
                && let Some(path) = value.as_string()
            {
                paths.push(path);
            }
            for child in expr.children() {
                walk(child, paths);
            }
        }
        let mut paths = Vec::new();
        for item in &self.items {
            walk(item, &mut paths);
        }
        paths.sort();
        paths.dedup();
        paths
    }
}

impl Expression {
    #[must_use]
    pub fn literal(value: impl Into<Vector>) -> Self {
        Self::Literal(value.into())
    }

    #[must_use]
    pub fn name(name: impl Into<Symbol>) -> Self {
        Self::Name(name.into())
    }

    #[must_use]
    pub fn unary(op: UnaryOperator, expr: Self) -> Self {
        Self::Unary { op, expr: Box::new(expr) }
    }

    #[must_use]
    pub fn math(op: MathOperator, left: Self, right: Self) -> Self {
        Self::Math {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn compare(op: CompareOperator, left: Self, right: Self) -> Self {
        Self::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn logic(op: LogicOperator, left: Self, right: Self) -> Self {
        Self::Logic {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    #[must_use]
    pub fn range(start: Self, stop: Self, step: Self) -> Self {
        Self::Range {
            start: Box::new(start),
            stop: Box::new(stop),
            step: Box::new(step),
        }
    }

    #[must_use]
    pub fn slice(expr: Self, index: Self) -> Self {
        Self::Slice {
            expr: Box::new(expr),
            index: Box::new(index),
        }
    }

    #[must_use]
    pub fn lookup(key: Self) -> Self {
        Self::Lookup(Box::new(key))
    }

    #[must_use]
    pub fn node(kind: impl Into<Symbol>) -> Self {
        Self::Node {
            kind: kind.into(),
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn tag(expr: Self, tag: impl Into<Symbol>) -> Self {
        Self::Tag {
            expr: Box::new(expr),
            tag: tag.into(),
        }
    }

    #[must_use]
    pub fn attributes(expr: Self, bindings: Vec<Binding>) -> Self {
        Self::Attributes {
            expr: Box::new(expr),
            bindings,
        }
    }

    #[must_use]
    pub fn append(expr: Self, children: Self) -> Self {
        Self::Append {
            expr: Box::new(expr),
            children: Box::new(children),
        }
    }

    #[must_use]
    pub fn inline_let(body: Self, bindings: Vec<PolyBinding>) -> Self {
        Self::InlineLet {
            body: Box::new(body),
            bindings,
        }
    }

    #[must_use]
    pub fn for_loop(names: impl IntoIterator<Item = impl Into<Symbol>>, source: Self, body: Self) -> Self {
        Self::For {
            names: names.into_iter().map(Into::into).collect(),
            source: Box::new(source),
            body: Box::new(body),
        }
    }

    #[must_use]
    pub fn if_else(conditions: Vec<IfCondition>, else_: Option<Self>) -> Self {
        Self::IfElse {
            conditions,
            else_: else_.map(Box::new),
        }
    }

    #[must_use]
    pub fn call(function: Self, args: Vec<Self>) -> Self {
        Self::Call {
            function: Box::new(function),
            args,
            kwargs: Vec::new(),
        }
    }

    #[must_use]
    pub fn call_with_kwargs(function: Self, args: Vec<Self>, kwargs: Vec<Binding>) -> Self {
        Self::Call {
            function: Box::new(function),
            args,
            kwargs,
        }
    }

    #[must_use]
    pub fn pragma(name: impl Into<Symbol>, expr: Self) -> Self {
        Self::Pragma {
            name: name.into(),
            expr: Box::new(expr),
        }
    }

    #[must_use]
    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    #[must_use]
    pub fn as_literal(&self) -> Option<&Vector> {
        match self {
            Self::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// The direct sub-expressions, in source order.
    #[must_use]
    pub fn children(&self) -> Vec<&Self> {
        match self {
            Self::Literal(_) | Self::Name(_) | Self::Search(_) | Self::Node { .. } => Vec::new(),
            Self::Lookup(key) => vec![key],
            Self::Unary { expr, .. } | Self::Tag { expr, .. } => vec![expr],
            Self::Math { left, right, .. } | Self::Compare { left, right, .. } | Self::Logic { left, right, .. } => {
                vec![left, right]
            }
            Self::Range { start, stop, step } => vec![start, stop, step],
            Self::Slice { expr, index } => vec![expr, index],
            Self::Sequence(items) => items.iter().collect(),
            Self::Attributes { expr, bindings } => {
                let mut children = vec![expr.as_ref()];
                children.extend(bindings.iter().map(|b| &b.expr));
                children
            }
            Self::Append { expr, children } => vec![expr, children],
            Self::Let { bindings } => bindings.iter().map(|b| &b.expr).collect(),
            Self::InlineLet { body, bindings } => {
                let mut children: Vec<&Self> = bindings.iter().map(|b| &b.expr).collect();
                children.push(body);
                children
            }
            Self::For { source, body, .. } => vec![source, body],
            Self::IfElse { conditions, else_ } => {
                let mut children = Vec::new();
                for arm in conditions {
                    children.push(&arm.condition);
                    children.push(&arm.then);
                }
                if let Some(else_) = else_ {
                    children.push(else_);
                }
                children
            }
            Self::Call { function, args, kwargs } => {
                let mut children = vec![function.as_ref()];
                children.extend(args.iter());
                children.extend(kwargs.iter().map(|b| &b.expr));
                children
            }
            Self::Function(def) => {
                let mut children: Vec<&Self> = def.parameters.iter().map(|b| &b.expr).collect();
                children.push(&def.body);
                children
            }
            Self::Pragma { expr, .. } => vec![expr],
            Self::Import { path, .. } => vec![path],
            Self::StoreGlobal { bindings } => bindings.iter().map(|b| &b.expr).collect(),
        }
    }

    /// Bottom-up catamorphism: `f` receives each expression and the results
    /// from its children. Used only by diagnostics.
    pub fn reduce<T>(&self, f: &impl Fn(&Self, Vec<T>) -> T) -> T {
        let results = self.children().into_iter().map(|child| child.reduce(f)).collect();
        f(self, results)
    }

    /// The free names of the expression, in first-occurrence order,
    /// respecting every binder (`Let`, `InlineLet`, `For`, function
    /// parameters and definitions).
    #[must_use]
    pub fn free_names(&self) -> IndexSet<Symbol> {
        let mut free = IndexSet::new();
        let mut bound = AHashSet::new();
        self.collect_free(&mut bound, &mut free);
        free
    }

    fn collect_free(&self, bound: &mut AHashSet<Symbol>, free: &mut IndexSet<Symbol>) {
        match self {
            Self::Name(name) => {
                if !bound.contains(name) {
                    free.insert(*name);
                }
            }
            Self::Sequence(items) => {
                // Lets and function definitions bind the rest of the sequence.
                let mut added = Vec::new();
                for item in items {
                    item.collect_free(bound, free);
                    match item {
                        Self::Let { bindings } => {
                            for binding in bindings {
                                for name in &binding.names {
                                    if bound.insert(*name) {
                                        added.push(*name);
                                    }
                                }
                            }
                        }
                        Self::Function(def) => {
                            if bound.insert(def.name) {
                                added.push(def.name);
                            }
                        }
                        _ => {}
                    }
                }
                for name in added {
                    bound.remove(&name);
                }
            }
            Self::InlineLet { body, bindings } => {
                let mut added = Vec::new();
                for binding in bindings {
                    binding.expr.collect_free(bound, free);
                    for name in &binding.names {
                        if bound.insert(*name) {
                            added.push(*name);
                        }
                    }
                }
                body.collect_free(bound, free);
                for name in added {
                    bound.remove(&name);
                }
            }
            Self::Let { bindings } => {
                // A bare Let contributes to the enclosing sequence; here only
                // the right-hand sides can reference names.
                for binding in bindings {
                    binding.expr.collect_free(bound, free);
                }
            }
            Self::For { names, source, body } => {
                source.collect_free(bound, free);
                let added: Vec<Symbol> = names.iter().copied().filter(|name| bound.insert(*name)).collect();
                body.collect_free(bound, free);
                for name in added {
                    bound.remove(&name);
                }
            }
            Self::Function(def) => {
                let mut added = Vec::new();
                for parameter in &def.parameters {
                    parameter.expr.collect_free(bound, free);
                }
                for parameter in &def.parameters {
                    if bound.insert(parameter.name) {
                        added.push(parameter.name);
                    }
                }
                def.body.collect_free(bound, free);
                for name in added {
                    bound.remove(&name);
                }
            }
            _ => {
                for child in self.children() {
                    child.collect_free(bound, free);
                }
            }
        }
    }
}
