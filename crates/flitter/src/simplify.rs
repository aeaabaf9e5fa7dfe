//! The partial evaluator: a confluent, terminating rewriter over the
//! expression tree.
//!
//! `simplify` reduces every closed subtree to a literal under a partial
//! environment of static values, renames and function definitions. The
//! contract is soundness — evaluating the simplified tree under any
//! consistent extension of the environment yields the same result as
//! evaluating the original — and idempotence: a pass that returns its input
//! unchanged is a fixed point.
//!
//! The driver re-runs single passes from the original environment until the
//! tree stops changing or the pass bound is hit. Errors are accumulated
//! conservatively across passes: an unbound name reported from a branch a
//! later pass proves dead is still reported.

use std::{collections::BTreeSet, sync::Arc};

use indexmap::IndexMap;

use crate::{
    functions::{StaticName, resolve_static},
    nodes::Node,
    state::StateDict,
    symbols::Symbol,
    tree::{
        Binding, Expression, FunctionDef, IfCondition, LogicOperator, MathOperator, PolyBinding, Top, UnaryOperator,
    },
    values::{Vector, apply_compare, apply_math, apply_unary, range_of, xor_values},
};

/// What a name means during simplification.
#[derive(Debug, Clone, PartialEq)]
pub enum NameBinding {
    /// A static value: occurrences fold to a literal.
    Value(Vector),
    /// A rename onto an outer dynamic name; substituted verbatim, without
    /// chaining through the target's current binding.
    Alias(Symbol),
    /// An inlineable user function.
    Func(Arc<FunctionDef>),
    /// Known but unknowable: occurrences are left in place.
    Dynamic,
}

/// The static environment, in insertion order.
pub type Names = IndexMap<Symbol, NameBinding>;

/// The residue of a simplification: errors accumulated across every pass
/// and the environment of the first pass — the bindings as the program text
/// declared them, before folding erased the constant ones.
#[derive(Debug, Default)]
pub struct Simplification {
    pub errors: BTreeSet<String>,
    pub names: Names,
    pub passes: usize,
}

const MAX_PASSES: usize = 16;
const RECURSIVE_INLINE_LIMIT: usize = 256;

struct SimplifyCtx<'a> {
    names: Names,
    errors: BTreeSet<String>,
    state: Option<&'a StateDict>,
    top_stores: IndexMap<Symbol, Vector>,
    at_top: bool,
    inline_depth: usize,
}

impl<'a> SimplifyCtx<'a> {
    fn new(names: Names, state: Option<&'a StateDict>) -> Self {
        Self {
            names,
            errors: BTreeSet::new(),
            state,
            top_stores: IndexMap::new(),
            at_top: false,
            inline_depth: 0,
        }
    }
}

impl Top {
    /// Simplifies the whole program to a fixed point.
    #[must_use]
    pub fn simplify(&self, names: &Names, state: Option<&StateDict>) -> (Self, Simplification) {
        let mut current = self.clone();
        let mut result = Simplification::default();
        for pass in 1..=MAX_PASSES {
            let mut ctx = SimplifyCtx::new(names.clone(), state);
            let next = simplify_top_pass(&current, &mut ctx);
            result.errors.extend(ctx.errors);
            if pass == 1 {
                result.names = ctx.names;
            }
            result.passes = pass;
            if next == current {
                break;
            }
            current = next;
        }
        (current, result)
    }
}

impl Expression {
    /// Simplifies a bare expression to a fixed point.
    #[must_use]
    pub fn simplified(&self, names: &Names, state: Option<&StateDict>) -> (Self, Simplification) {
        let mut current = self.clone();
        let mut result = Simplification::default();
        for pass in 1..=MAX_PASSES {
            let mut ctx = SimplifyCtx::new(names.clone(), state);
            let next = simplify_expr(&current, &mut ctx);
            result.errors.extend(ctx.errors);
            if pass == 1 {
                result.names = ctx.names;
            }
            result.passes = pass;
            if next == current {
                break;
            }
            current = next;
        }
        (current, result)
    }
}

fn simplify_top_pass(top: &Top, ctx: &mut SimplifyCtx) -> Top {
    let mut items = Vec::with_capacity(top.items.len());
    for item in &top.items {
        ctx.at_top = true;
        let simplified = simplify_expr(item, ctx);
        if let Expression::Literal(value) = &simplified
            && value.is_null()
        {
            continue;
        }
        items.push(simplified);
    }
    ctx.at_top = false;
    if !ctx.top_stores.is_empty() {
        let bindings = ctx
            .top_stores
            .drain(..)
            .map(|(name, value)| Binding::new(name, Expression::Literal(value)))
            .collect();
        items.push(Expression::StoreGlobal { bindings });
    }
    Top::new(items)
}

fn simplify_expr(expr: &Expression, ctx: &mut SimplifyCtx) -> Expression {
    let at_top = std::mem::take(&mut ctx.at_top);
    match expr {
        Expression::Literal(_) | Expression::Search(_) => expr.clone(),

        Expression::Name(name) => match ctx.names.get(name) {
            Some(NameBinding::Value(value)) => Expression::Literal(value.clone()),
            Some(NameBinding::Alias(target)) => Expression::Name(*target),
            Some(NameBinding::Func(_) | NameBinding::Dynamic) => expr.clone(),
            None => match resolve_static(*name) {
                Some(StaticName::Constant(value)) => Expression::Literal(value),
                Some(StaticName::Pure(function)) => Expression::Literal(Vector::Builtin(function)),
                Some(StaticName::Impure(_)) => expr.clone(),
                None => {
                    ctx.errors.insert(format!("Unbound name '{name}'"));
                    Expression::Literal(Vector::null())
                }
            },
        },

        Expression::Lookup(key) => {
            let key = simplify_expr(key, ctx);
            if let Expression::Literal(value) = &key
                && let Some(state) = ctx.state
                && state.contains(value)
            {
                return Expression::Literal(state.get(value));
            }
            Expression::Lookup(Box::new(key))
        }

        Expression::Unary { op, expr } => {
            let inner = simplify_expr(expr, ctx);
            if let Expression::Literal(value) = &inner {
                return Expression::Literal(apply_unary(*op, value));
            }
            match op {
                UnaryOperator::Positive => positive_of(inner),
                UnaryOperator::Negative => negative_of(inner),
                _ => Expression::unary(*op, inner),
            }
        }

        Expression::Math { op, left, right } => {
            let left = simplify_expr(left, ctx);
            let right = simplify_expr(right, ctx);
            make_math(*op, left, right)
        }

        Expression::Compare { op, left, right } => {
            let left = simplify_expr(left, ctx);
            let right = simplify_expr(right, ctx);
            if let (Expression::Literal(a), Expression::Literal(b)) = (&left, &right) {
                return Expression::Literal(apply_compare(*op, a, b));
            }
            Expression::compare(*op, left, right)
        }

        Expression::Logic { op, left, right } => {
            let left = simplify_expr(left, ctx);
            let right = simplify_expr(right, ctx);
            match op {
                LogicOperator::And => match left.as_literal().map(Vector::truthy) {
                    Some(true) => right,
                    Some(false) => left,
                    None => Expression::logic(*op, left, right),
                },
                LogicOperator::Or => match left.as_literal().map(Vector::truthy) {
                    Some(true) => left,
                    Some(false) => right,
                    None => Expression::logic(*op, left, right),
                },
                LogicOperator::Xor => {
                    if let (Some(a), Some(b)) = (left.as_literal(), right.as_literal()) {
                        return Expression::Literal(xor_values(a, b));
                    }
                    if left.as_literal().is_some_and(|a| !a.truthy()) {
                        return right;
                    }
                    if right.as_literal().is_some_and(|b| !b.truthy()) {
                        return left;
                    }
                    Expression::logic(*op, left, right)
                }
            }
        }

        Expression::Range { start, stop, step } => {
            let start = simplify_expr(start, ctx);
            let stop = simplify_expr(stop, ctx);
            let step = simplify_expr(step, ctx);
            if let (Expression::Literal(a), Expression::Literal(b), Expression::Literal(c)) = (&start, &stop, &step) {
                return Expression::Literal(range_of(a, b, c));
            }
            Expression::range(start, stop, step)
        }

        Expression::Slice { expr, index } => {
            let target = simplify_expr(expr, ctx);
            let index = simplify_expr(index, ctx);
            if let (Expression::Literal(value), Expression::Literal(picks)) = (&target, &index) {
                return Expression::Literal(value.slice(picks));
            }
            Expression::slice(target, index)
        }

        Expression::Sequence(items) => {
            let parts = items.iter().map(|item| simplify_expr(item, ctx)).collect();
            pack_sequence(parts)
        }

        Expression::Node { kind, tags } => {
            Expression::Literal(Vector::from(Node::with_tags(*kind, tags.iter().copied())))
        }

        Expression::Tag { expr, tag } => {
            let target = simplify_expr(expr, ctx);
            if let Expression::Literal(Vector::Nodes(nodes)) = &target {
                let tagged = nodes.iter().map(|node| Arc::new(node.tagged(*tag))).collect();
                return Expression::Literal(Vector::Nodes(tagged));
            }
            Expression::tag(target, *tag)
        }

        Expression::Attributes { expr, bindings } => {
            let target = simplify_expr(expr, ctx);
            let mut bindings: Vec<Binding> = bindings
                .iter()
                .map(|binding| Binding::new(binding.name, simplify_expr(&binding.expr, ctx)))
                .collect();
            // Nested attribute updates merge into a single operation.
            let mut target = match target {
                Expression::Attributes {
                    expr: inner,
                    bindings: mut inner_bindings,
                } => {
                    inner_bindings.append(&mut bindings);
                    bindings = inner_bindings;
                    *inner
                }
                other => other,
            };
            // Leading literal bindings fold straight into a literal target.
            if let Expression::Literal(Vector::Nodes(nodes)) = &target {
                let mut nodes = nodes.clone();
                let mut applied = 0;
                for binding in &bindings {
                    let Expression::Literal(value) = &binding.expr else {
                        break;
                    };
                    for node in &mut nodes {
                        let mut updated = node.as_ref().clone();
                        updated.set_attribute(binding.name, value.clone());
                        *node = Arc::new(updated);
                    }
                    applied += 1;
                }
                if applied > 0 {
                    bindings.drain(..applied);
                    target = Expression::Literal(Vector::Nodes(nodes));
                }
                if bindings.is_empty() {
                    return target;
                }
            }
            Expression::attributes(target, bindings)
        }

        Expression::Append { expr, children } => {
            let target = simplify_expr(expr, ctx);
            let children = simplify_expr(children, ctx);
            make_append(target, children)
        }

        Expression::Let { bindings } => {
            let mut residual: Vec<PolyBinding> = Vec::new();
            for binding in bindings {
                let rhs = simplify_expr(&binding.expr, ctx);
                // The bound names persist for the rest of the scope, so any
                // earlier rename onto them must be pinned down explicitly.
                restore_renames(ctx, &binding.names, &mut residual);
                process_binding(ctx, binding, rhs, &mut residual, at_top);
            }
            if residual.is_empty() {
                Expression::Literal(Vector::null())
            } else {
                Expression::Let { bindings: residual }
            }
        }

        Expression::InlineLet { body, bindings } => {
            let saved = ctx.names.clone();
            let mut residual: Vec<PolyBinding> = Vec::new();
            for binding in bindings {
                let rhs = simplify_expr(&binding.expr, ctx);
                if !rhs.is_literal() && !is_rename(ctx, &rhs) {
                    // Only a residual rebind shadows in the output; a folded
                    // one vanishes and cannot capture earlier renames.
                    restore_renames(ctx, &binding.names, &mut residual);
                }
                process_binding(ctx, binding, rhs, &mut residual, false);
            }
            let body = simplify_expr(body, ctx);
            ctx.names = saved;
            if residual.is_empty() {
                body
            } else {
                Expression::inline_let(body, residual)
            }
        }

        Expression::For { names, source, body } => {
            let source = simplify_expr(source, ctx);
            if let Expression::Literal(value) = &source {
                let chunk = names.len().max(1);
                let len = value.len();
                let saved = ctx.names.clone();
                let mut parts = Vec::new();
                let mut index = 0;
                while index < len {
                    for (offset, name) in names.iter().enumerate() {
                        let item = if index + offset < len {
                            value.item(index + offset)
                        } else {
                            Vector::null()
                        };
                        ctx.names.insert(*name, NameBinding::Value(item));
                    }
                    parts.push(simplify_expr(body, ctx));
                    index += chunk;
                }
                ctx.names = saved;
                return pack_sequence(parts);
            }
            let saved = ctx.names.clone();
            for name in names {
                ctx.names.insert(*name, NameBinding::Dynamic);
            }
            let body = simplify_expr(body, ctx);
            ctx.names = saved;
            Expression::For {
                names: names.clone(),
                source: Box::new(source),
                body: Box::new(body),
            }
        }

        Expression::IfElse { conditions, else_ } => {
            let mut kept: Vec<IfCondition> = Vec::new();
            for arm in conditions {
                let condition = simplify_expr(&arm.condition, ctx);
                if let Expression::Literal(value) = &condition {
                    if value.truthy() {
                        // A true condition ends the chain: its branch becomes
                        // the else of whatever dynamic conditions precede it.
                        let then = simplify_expr(&arm.then, ctx);
                        if kept.is_empty() {
                            return then;
                        }
                        return Expression::if_else(kept, Some(then));
                    }
                    continue;
                }
                kept.push(IfCondition::new(condition, simplify_expr(&arm.then, ctx)));
            }
            let else_ = else_.as_ref().map(|expr| simplify_expr(expr, ctx));
            if kept.is_empty() {
                return else_.unwrap_or_else(|| Expression::Literal(Vector::null()));
            }
            Expression::if_else(kept, else_)
        }

        Expression::Call { function, args, kwargs } => {
            let function = simplify_expr(function, ctx);
            let args: Vec<Expression> = args.iter().map(|arg| simplify_expr(arg, ctx)).collect();
            let kwargs: Vec<Binding> = kwargs
                .iter()
                .map(|binding| Binding::new(binding.name, simplify_expr(&binding.expr, ctx)))
                .collect();
            let all_literal =
                args.iter().all(Expression::is_literal) && kwargs.iter().all(|binding| binding.expr.is_literal());

            if let Expression::Literal(Vector::Builtin(builtin)) = &function
                && builtin.is_pure()
                && all_literal
            {
                let argv: Vec<Vector> = args.iter().filter_map(|a| a.as_literal().cloned()).collect();
                let kwargv: Vec<(Symbol, Vector)> = kwargs
                    .iter()
                    .filter_map(|b| b.expr.as_literal().map(|v| (b.name, v.clone())))
                    .collect();
                return match builtin.invoke(&argv, &kwargv) {
                    Ok(value) => Expression::Literal(value),
                    Err(message) => {
                        ctx.errors.insert(message);
                        Expression::Literal(Vector::null())
                    }
                };
            }

            let known_function = match &function {
                Expression::Name(name) => match ctx.names.get(name) {
                    Some(NameBinding::Func(func)) => Some(func.clone()),
                    _ => None,
                },
                _ => None,
            };
            if let Some(func) = known_function {
                let arity_fits = args.len() <= func.parameters.len()
                    && kwargs
                        .iter()
                        .all(|b| func.parameters.iter().any(|p| p.name == b.name));
                if arity_fits && (!func.recursive || all_literal) {
                    if func.recursive {
                        if ctx.inline_depth < RECURSIVE_INLINE_LIMIT {
                            ctx.inline_depth += 1;
                            let inlined = inline_call(&func, &args, &kwargs, ctx);
                            ctx.inline_depth -= 1;
                            return inlined;
                        }
                        // Specialization budget exhausted: leave the call for
                        // the runtime to dispatch.
                    } else {
                        return inline_call(&func, &args, &kwargs, ctx);
                    }
                }
            }

            Expression::Call {
                function: Box::new(function),
                args,
                kwargs,
            }
        }

        Expression::Function(def) => simplify_function(def, ctx),

        Expression::Pragma { name, expr } => Expression::pragma(*name, simplify_expr(expr, ctx)),

        Expression::Import { names, path } => {
            let path = simplify_expr(path, ctx);
            for name in names {
                ctx.names.insert(*name, NameBinding::Dynamic);
            }
            Expression::Import {
                names: names.clone(),
                path: Box::new(path),
            }
        }

        // Store bindings already carry folded values; re-simplifying them
        // would re-resolve names against the wrong scope.
        Expression::StoreGlobal { .. } => expr.clone(),
    }
}

/// Applies a processed binding to the environment, or emits it as residual.
fn process_binding(
    ctx: &mut SimplifyCtx,
    binding: &PolyBinding,
    rhs: Expression,
    residual: &mut Vec<PolyBinding>,
    at_top: bool,
) {
    match rhs {
        Expression::Literal(value) => {
            if binding.names.len() == 1 {
                if at_top {
                    ctx.top_stores.insert(binding.names[0], value.clone());
                }
                ctx.names.insert(binding.names[0], NameBinding::Value(value));
            } else {
                for (index, name) in binding.names.iter().enumerate() {
                    let item = value.item_wrapped(index);
                    if at_top {
                        ctx.top_stores.insert(*name, item.clone());
                    }
                    ctx.names.insert(*name, NameBinding::Value(item));
                }
            }
        }
        Expression::Name(target) if dynamic_target(ctx, target) => {
            for name in &binding.names {
                ctx.names.insert(*name, NameBinding::Alias(target));
            }
        }
        other => {
            residual.push(PolyBinding {
                names: binding.names.clone(),
                expr: other,
            });
            for name in &binding.names {
                ctx.names.insert(*name, NameBinding::Dynamic);
            }
        }
    }
}

/// Whether a simplified right-hand side is a rename onto a dynamic name.
fn is_rename(ctx: &SimplifyCtx, rhs: &Expression) -> bool {
    matches!(rhs, Expression::Name(target) if dynamic_target(ctx, *target))
}

fn dynamic_target(ctx: &SimplifyCtx, target: Symbol) -> bool {
    match ctx.names.get(&target) {
        Some(NameBinding::Dynamic) | None => true,
        Some(_) => false,
    }
}

/// Pins down every rename pointing at a name that is about to be shadowed:
/// the old value is re-bound explicitly in the residual and the renamed name
/// turns dynamic so the body keeps referring to it by its own name.
fn restore_renames(ctx: &mut SimplifyCtx, rebound: &[Symbol], residual: &mut Vec<PolyBinding>) {
    let restored: Vec<(Symbol, Symbol)> = ctx
        .names
        .iter()
        .filter_map(|(name, binding)| match binding {
            NameBinding::Alias(target) if rebound.contains(target) => Some((*name, *target)),
            _ => None,
        })
        .collect();
    for (name, target) in restored {
        residual.push(PolyBinding {
            names: vec![name],
            expr: Expression::Name(target),
        });
        ctx.names.insert(name, NameBinding::Dynamic);
    }
}

/// Flattens, merges adjacent literals (null is the identity) and collapses
/// trivial sequences. Parts must already be simplified.
fn pack_sequence(parts: Vec<Expression>) -> Expression {
    fn push_part(packed: &mut Vec<Expression>, part: Expression) {
        if let Expression::Literal(value) = &part {
            if value.is_null() {
                return;
            }
            if let Some(Expression::Literal(previous)) = packed.last_mut() {
                *previous = Vector::compose(vec![previous.clone(), value.clone()]);
                return;
            }
        }
        packed.push(part);
    }

    let mut packed = Vec::with_capacity(parts.len());
    for part in parts {
        if let Expression::Sequence(sub) = part {
            for item in sub {
                push_part(&mut packed, item);
            }
        } else {
            push_part(&mut packed, part);
        }
    }
    match packed.len() {
        0 => Expression::Literal(Vector::null()),
        1 => packed.pop().expect("one part"),
        _ => Expression::Sequence(packed),
    }
}

fn is_scalar(value: &Vector, scalar: f64) -> bool {
    matches!(value.numbers(), Some([x]) if *x == scalar)
}

/// Unwraps a `Negative(inner)` expression, or hands the input back.
fn into_negated(expr: Expression) -> Result<Expression, Expression> {
    match expr {
        Expression::Unary {
            op: UnaryOperator::Negative,
            expr,
        } => Ok(*expr),
        other => Err(other),
    }
}

/// Wraps a simplified expression in `Positive`, collapsing where the operand
/// is already numeric by construction.
fn positive_of(expr: Expression) -> Expression {
    match expr {
        Expression::Literal(value) => Expression::Literal(value.pos()),
        Expression::Unary { .. } | Expression::Math { .. } => expr,
        other => Expression::unary(UnaryOperator::Positive, other),
    }
}

/// Wraps a simplified expression in `Negative`, pushing the negation into
/// half-literal arithmetic where that strictly reduces the tree.
fn negative_of(expr: Expression) -> Expression {
    match expr {
        Expression::Literal(value) => Expression::Literal(value.neg()),
        Expression::Unary {
            op: UnaryOperator::Negative,
            expr,
        } => positive_of(*expr),
        Expression::Unary {
            op: UnaryOperator::Positive,
            expr,
        } => negative_of(*expr),
        Expression::Math { op, left, right } => match (op, *left, *right) {
            (MathOperator::Multiply, Expression::Literal(k), dynamic) => {
                Expression::math(MathOperator::Multiply, Expression::Literal(k.neg()), dynamic)
            }
            (MathOperator::Multiply, dynamic, Expression::Literal(k)) => {
                Expression::math(MathOperator::Multiply, dynamic, Expression::Literal(k.neg()))
            }
            (MathOperator::Divide, Expression::Literal(k), dynamic) => {
                Expression::math(MathOperator::Divide, Expression::Literal(k.neg()), dynamic)
            }
            (MathOperator::Add, Expression::Literal(k), dynamic) => {
                Expression::math(MathOperator::Subtract, Expression::Literal(k.neg()), dynamic)
            }
            (MathOperator::Add, dynamic, Expression::Literal(k)) => {
                Expression::math(MathOperator::Subtract, Expression::Literal(k.neg()), dynamic)
            }
            (MathOperator::Subtract, Expression::Literal(k), dynamic) => {
                Expression::math(MathOperator::Add, Expression::Literal(k.neg()), dynamic)
            }
            (MathOperator::Subtract, dynamic, Expression::Literal(k)) => {
                Expression::math(MathOperator::Subtract, Expression::Literal(k), dynamic)
            }
            (op, left, right) => Expression::unary(UnaryOperator::Negative, Expression::math(op, left, right)),
        },
        other => Expression::unary(UnaryOperator::Negative, other),
    }
}

/// Builds a binary arithmetic expression over simplified operands, folding
/// literals and applying the algebraic identities.
fn make_math(op: MathOperator, left: Expression, right: Expression) -> Expression {
    if let (Expression::Literal(a), Expression::Literal(b)) = (&left, &right) {
        return Expression::Literal(apply_math(op, a, b));
    }
    match op {
        MathOperator::Add => {
            if let Expression::Literal(k) = &left
                && is_scalar(k, 0.0)
            {
                return positive_of(right);
            }
            if let Expression::Literal(k) = &right
                && is_scalar(k, 0.0)
            {
                return positive_of(left);
            }
            let right = match into_negated(right) {
                Ok(negated) => return make_math(MathOperator::Subtract, left, negated),
                Err(right) => right,
            };
            match into_negated(left) {
                Ok(negated) => make_math(MathOperator::Subtract, right, negated),
                Err(left) => Expression::math(op, left, right),
            }
        }
        MathOperator::Subtract => {
            if let Expression::Literal(k) = &right
                && is_scalar(k, 0.0)
            {
                return positive_of(left);
            }
            if let Expression::Literal(k) = &left
                && is_scalar(k, 0.0)
            {
                return negative_of(right);
            }
            match into_negated(right) {
                Ok(negated) => make_math(MathOperator::Add, left, negated),
                Err(right) => Expression::math(op, left, right),
            }
        }
        MathOperator::Multiply => {
            if let Expression::Literal(k) = &left {
                return multiply_literal(k.clone(), right, true);
            }
            if let Expression::Literal(k) = &right {
                return multiply_literal(k.clone(), left, false);
            }
            Expression::math(op, left, right)
        }
        MathOperator::Divide => {
            if let Expression::Literal(k) = &right {
                if is_scalar(k, 1.0) {
                    return positive_of(left);
                }
                let inverse = Vector::from(1.0).div(k);
                return make_math(MathOperator::Multiply, Expression::Literal(inverse), left);
            }
            Expression::math(op, left, right)
        }
        MathOperator::FloorDivide => {
            if let Expression::Literal(k) = &right
                && is_scalar(k, 1.0)
            {
                return Expression::unary(UnaryOperator::Floor, left);
            }
            Expression::math(op, left, right)
        }
        MathOperator::Modulo => {
            if let Expression::Literal(k) = &right
                && is_scalar(k, 1.0)
            {
                return Expression::unary(UnaryOperator::Fract, left);
            }
            Expression::math(op, left, right)
        }
        MathOperator::Power => {
            if let Expression::Literal(k) = &right
                && is_scalar(k, 1.0)
            {
                return positive_of(left);
            }
            Expression::math(op, left, right)
        }
    }
}

/// Multiplication by a literal: unit eliminations and constant propagation
/// through half-literal arithmetic. `literal_first` preserves the original
/// operand order when no rewrite applies.
fn multiply_literal(k: Vector, dynamic: Expression, literal_first: bool) -> Expression {
    if is_scalar(&k, 1.0) {
        return positive_of(dynamic);
    }
    if is_scalar(&k, -1.0) {
        return negative_of(dynamic);
    }
    match dynamic {
        Expression::Math { op: MathOperator::Add, left, right } => match (*left, *right) {
            (Expression::Literal(c), other) | (other, Expression::Literal(c)) => Expression::math(
                MathOperator::Add,
                Expression::math(MathOperator::Multiply, Expression::Literal(k.clone()), other),
                Expression::Literal(k.mul(&c)),
            ),
            (left, right) => rebuild_multiply(k, Expression::math(MathOperator::Add, left, right), literal_first),
        },
        Expression::Math {
            op: MathOperator::Subtract,
            left,
            right,
        } => match (*left, *right) {
            (Expression::Literal(c), other) => Expression::math(
                MathOperator::Subtract,
                Expression::Literal(k.mul(&c)),
                Expression::math(MathOperator::Multiply, Expression::Literal(k), other),
            ),
            (other, Expression::Literal(c)) => Expression::math(
                MathOperator::Subtract,
                Expression::math(MathOperator::Multiply, Expression::Literal(k.clone()), other),
                Expression::Literal(k.mul(&c)),
            ),
            (left, right) => rebuild_multiply(k, Expression::math(MathOperator::Subtract, left, right), literal_first),
        },
        Expression::Math {
            op: MathOperator::Multiply,
            left,
            right,
        } => match (*left, *right) {
            (Expression::Literal(c), other) | (other, Expression::Literal(c)) => {
                make_math(MathOperator::Multiply, Expression::Literal(k.mul(&c)), other)
            }
            (left, right) => rebuild_multiply(k, Expression::math(MathOperator::Multiply, left, right), literal_first),
        },
        Expression::Math {
            op: MathOperator::Divide,
            left,
            right,
        } => match (*left, *right) {
            (Expression::Literal(c), other) => {
                Expression::math(MathOperator::Divide, Expression::Literal(k.mul(&c)), other)
            }
            (other, Expression::Literal(c)) => {
                make_math(MathOperator::Multiply, Expression::Literal(k.div(&c)), other)
            }
            (left, right) => rebuild_multiply(k, Expression::math(MathOperator::Divide, left, right), literal_first),
        },
        Expression::Unary {
            op: UnaryOperator::Negative,
            expr,
        } => make_math(MathOperator::Multiply, Expression::Literal(k.neg()), *expr),
        other => rebuild_multiply(k, other, literal_first),
    }
}

fn rebuild_multiply(k: Vector, dynamic: Expression, literal_first: bool) -> Expression {
    if literal_first {
        Expression::math(MathOperator::Multiply, Expression::Literal(k), dynamic)
    } else {
        Expression::math(MathOperator::Multiply, dynamic, Expression::Literal(k))
    }
}

fn make_append(target: Expression, children: Expression) -> Expression {
    if let Expression::Literal(value) = &children {
        if value.is_null() {
            return target;
        }
        let child_nodes: Vec<Arc<Node>> = value.nodes().map(<[Arc<Node>]>::to_vec).unwrap_or_default();
        return match target {
            Expression::Literal(Vector::Nodes(nodes)) => Expression::Literal(append_to_all(&nodes, &child_nodes)),
            // A literal append passes through an attribute operation onto a
            // literal root.
            Expression::Attributes { expr, bindings } => {
                if let Expression::Literal(Vector::Nodes(nodes)) = expr.as_ref() {
                    Expression::attributes(Expression::Literal(append_to_all(nodes, &child_nodes)), bindings)
                } else {
                    Expression::append(Expression::Attributes { expr, bindings }, children)
                }
            }
            other => Expression::append(other, children),
        };
    }
    // A literal at the head of an appended sequence folds into a literal
    // target ahead of the dynamic remainder.
    if let (Expression::Literal(Vector::Nodes(nodes)), Expression::Sequence(items)) = (&target, &children)
        && let Some(Expression::Literal(value)) = items.first()
    {
        let child_nodes: Vec<Arc<Node>> = value.nodes().map(<[Arc<Node>]>::to_vec).unwrap_or_default();
        let appended = Expression::Literal(append_to_all(nodes, &child_nodes));
        let rest = pack_sequence(items[1..].to_vec());
        return make_append(appended, rest);
    }
    Expression::append(target, children)
}

fn append_to_all(nodes: &[Arc<Node>], children: &[Arc<Node>]) -> Vector {
    let appended = nodes
        .iter()
        .map(|node| {
            let mut updated = node.as_ref().clone();
            updated.extend(children.iter().cloned());
            Arc::new(updated)
        })
        .collect();
    Vector::Nodes(appended)
}

fn simplify_function(def: &Arc<FunctionDef>, ctx: &mut SimplifyCtx) -> Expression {
    let parameters: Vec<Binding> = def
        .parameters
        .iter()
        .map(|parameter| Binding::new(parameter.name, simplify_expr(&parameter.expr, ctx)))
        .collect();

    // The body simplifies with the parameters, the function's own name and
    // any name unknown to this scope left dynamic; unbound references inside
    // a function body are a runtime concern, not a definition-time error.
    let saved = ctx.names.clone();
    ctx.names.insert(def.name, NameBinding::Dynamic);
    for parameter in &parameters {
        ctx.names.insert(parameter.name, NameBinding::Dynamic);
    }
    for free in def.body.free_names() {
        if !ctx.names.contains_key(&free) && resolve_static(free).is_none() {
            ctx.names.insert(free, NameBinding::Dynamic);
        }
    }
    let body = simplify_expr(&def.body, ctx);
    ctx.names = saved;

    let mut free = body.free_names();
    for parameter in &parameters {
        free.shift_remove(&parameter.name);
    }
    let recursive = free.shift_remove(&def.name);
    let captures: Vec<Symbol> = free.into_iter().collect();

    let simplified = Arc::new(FunctionDef {
        name: def.name,
        parameters,
        body,
        captures: Some(captures.clone()),
        recursive,
    });
    if captures.is_empty() {
        ctx.names.insert(def.name, NameBinding::Func(simplified.clone()));
    } else {
        ctx.names.insert(def.name, NameBinding::Dynamic);
    }
    Expression::Function(simplified)
}

/// Expands a call to an inlineable function into an `InlineLet` binding each
/// parameter, then simplifies the result in place.
fn inline_call(func: &Arc<FunctionDef>, args: &[Expression], kwargs: &[Binding], ctx: &mut SimplifyCtx) -> Expression {
    let mut bindings = Vec::with_capacity(func.parameters.len());
    for (index, parameter) in func.parameters.iter().enumerate() {
        let expr = args
            .get(index)
            .cloned()
            .or_else(|| {
                kwargs
                    .iter()
                    .find(|binding| binding.name == parameter.name)
                    .map(|binding| binding.expr.clone())
            })
            .unwrap_or_else(|| parameter.expr.clone());
        bindings.push(PolyBinding {
            names: vec![parameter.name],
            expr,
        });
    }
    let inline = Expression::inline_let(func.body.clone(), bindings);
    simplify_expr(&inline, ctx)
}
