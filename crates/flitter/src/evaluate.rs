//! The evaluator: one deterministic walk of the simplified tree per frame.
//!
//! Evaluation threads a `Context` carrying the frame variables, the page
//! state, the scene graph being accumulated and the error/log side channels.
//! Nothing raises: a failing subexpression records a message and yields
//! null, so one bad branch never takes a frame down.

use std::{collections::BTreeSet, sync::Arc};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    functions::{BuiltinFunction, StaticName, resolve_static},
    nodes::Node,
    simplify::{NameBinding, Names},
    state::StateDict,
    symbols::Symbol,
    tree::{Binding, Expression, FunctionDef, LogicOperator, PolyBinding, Top},
    values::{Closure, Vector, apply_compare, apply_math, apply_unary, range_of, xor_values},
};

/// Closure calls deeper than this collect an error and yield null.
const MAX_CALL_DEPTH: usize = 500;

/// The names a program file exports to importers: its top-level constant
/// bindings and its capture-free functions.
#[derive(Debug, Clone, Default)]
pub struct ModuleExports {
    pub names: IndexMap<Symbol, Vector>,
}

impl ModuleExports {
    /// Collects exports by simplifying the module under `names` and reading
    /// its top-level environment: constant `Let` bindings (whether still in
    /// scope or already folded into a `StoreGlobal`) and capture-free
    /// functions.
    #[must_use]
    pub fn collect(top: &Top, names: &Names) -> Self {
        let (simplified, simplification) = top.simplify(names, None);
        let mut exports = IndexMap::new();
        for (name, binding) in &simplification.names {
            match binding {
                NameBinding::Value(value) => {
                    exports.insert(*name, value.clone());
                }
                NameBinding::Func(function) => {
                    exports.insert(
                        *name,
                        Vector::Closure(Arc::new(Closure {
                            function: function.clone(),
                            captured: Vec::new(),
                        })),
                    );
                }
                _ => {}
            }
        }
        for item in &simplified.items {
            if let Expression::StoreGlobal { bindings } = item {
                for binding in bindings {
                    if let Expression::Literal(value) = &binding.expr {
                        exports.insert(binding.name, value.clone());
                    }
                }
            }
        }
        Self { names: exports }
    }
}

/// Everything one evaluation reads and produces.
#[derive(Debug)]
pub struct Context {
    /// Frame variables and program bindings; binders save and restore whole
    /// scopes around their bodies.
    pub names: IndexMap<Symbol, Vector>,
    pub errors: BTreeSet<String>,
    pub logs: BTreeSet<String>,
    pub pragmas: IndexMap<Symbol, Vector>,
    pub state: StateDict,
    /// The scene graph accumulated so far; top-level node values become
    /// children of this root.
    pub root: Node,
    /// Preloaded modules for `Import`, keyed by the literal path text.
    pub modules: AHashMap<String, ModuleExports>,
    depth: usize,
}

impl Context {
    #[must_use]
    pub fn new(names: IndexMap<Symbol, Vector>, state: StateDict) -> Self {
        Self {
            names,
            errors: BTreeSet::new(),
            logs: BTreeSet::new(),
            pragmas: IndexMap::new(),
            state,
            root: Node::new(Symbol::new("root")),
            modules: AHashMap::new(),
            depth: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(IndexMap::new(), StateDict::new())
    }
}

impl Top {
    /// Evaluates the program: top-level items run in source order, node
    /// values are appended to the graph root, everything else is an effect
    /// on the context.
    pub fn run(&self, ctx: &mut Context) {
        for item in &self.items {
            let value = evaluate(item, ctx);
            if let Vector::Nodes(nodes) = value {
                ctx.root.extend(nodes);
            }
        }
    }
}

/// Evaluates one expression to a vector.
pub fn evaluate(expr: &Expression, ctx: &mut Context) -> Vector {
    match expr {
        Expression::Literal(value) => value.clone(),

        Expression::Name(name) => {
            if let Some(value) = ctx.names.get(name) {
                return value.clone();
            }
            match resolve_static(*name) {
                Some(StaticName::Constant(value)) => value,
                Some(StaticName::Pure(function) | StaticName::Impure(function)) => Vector::Builtin(function),
                None => {
                    ctx.errors.insert(format!("Unbound name '{name}'"));
                    Vector::null()
                }
            }
        }

        Expression::Lookup(key) => {
            let key = evaluate(key, ctx);
            ctx.state.get(&key)
        }

        Expression::Search(query) => Vector::Nodes(ctx.root.select_below(query)),

        Expression::Unary { op, expr } => {
            let value = evaluate(expr, ctx);
            apply_unary(*op, &value)
        }

        Expression::Math { op, left, right } => {
            let a = evaluate(left, ctx);
            let b = evaluate(right, ctx);
            apply_math(*op, &a, &b)
        }

        Expression::Compare { op, left, right } => {
            let a = evaluate(left, ctx);
            let b = evaluate(right, ctx);
            apply_compare(*op, &a, &b)
        }

        Expression::Logic { op, left, right } => match op {
            LogicOperator::And => {
                let a = evaluate(left, ctx);
                if a.truthy() { evaluate(right, ctx) } else { a }
            }
            LogicOperator::Or => {
                let a = evaluate(left, ctx);
                if a.truthy() { a } else { evaluate(right, ctx) }
            }
            LogicOperator::Xor => {
                let a = evaluate(left, ctx);
                let b = evaluate(right, ctx);
                xor_values(&a, &b)
            }
        },

        Expression::Range { start, stop, step } => {
            let start = evaluate(start, ctx);
            let stop = evaluate(stop, ctx);
            let step = evaluate(step, ctx);
            range_of(&start, &stop, &step)
        }

        Expression::Slice { expr, index } => {
            let value = evaluate(expr, ctx);
            let picks = evaluate(index, ctx);
            value.slice(&picks)
        }

        Expression::Sequence(items) => {
            let parts = items.iter().map(|item| evaluate(item, ctx)).collect();
            Vector::compose(parts)
        }

        Expression::Node { kind, tags } => Vector::from(Node::with_tags(*kind, tags.iter().copied())),

        Expression::Tag { expr, tag } => {
            let value = evaluate(expr, ctx);
            match value {
                Vector::Nodes(nodes) => {
                    Vector::Nodes(nodes.iter().map(|node| Arc::new(node.tagged(*tag))).collect())
                }
                other => other,
            }
        }

        Expression::Attributes { expr, bindings } => {
            let value = evaluate(expr, ctx);
            match value {
                Vector::Nodes(mut nodes) => {
                    for binding in bindings {
                        let attribute = evaluate(&binding.expr, ctx);
                        for node in &mut nodes {
                            let mut updated = node.as_ref().clone();
                            updated.set_attribute(binding.name, attribute.clone());
                            *node = Arc::new(updated);
                        }
                    }
                    Vector::Nodes(nodes)
                }
                other => other,
            }
        }

        Expression::Append { expr, children } => {
            let value = evaluate(expr, ctx);
            let appended = evaluate(children, ctx);
            match value {
                Vector::Nodes(mut nodes) => {
                    if let Vector::Nodes(children) = appended {
                        for node in &mut nodes {
                            let mut updated = node.as_ref().clone();
                            updated.extend(children.iter().cloned());
                            *node = Arc::new(updated);
                        }
                    }
                    Vector::Nodes(nodes)
                }
                other => other,
            }
        }

        Expression::Let { bindings } => {
            for binding in bindings {
                let value = evaluate(&binding.expr, ctx);
                bind_names(ctx, binding, value);
            }
            Vector::null()
        }

        Expression::InlineLet { body, bindings } => {
            let saved = ctx.names.clone();
            for binding in bindings {
                let value = evaluate(&binding.expr, ctx);
                bind_names(ctx, binding, value);
            }
            let result = evaluate(body, ctx);
            ctx.names = saved;
            result
        }

        Expression::For { names, source, body } => {
            let source = evaluate(source, ctx);
            let chunk = names.len().max(1);
            let len = source.len();
            let saved = ctx.names.clone();
            let mut parts = Vec::new();
            let mut index = 0;
            while index < len {
                for (offset, name) in names.iter().enumerate() {
                    let item = if index + offset < len {
                        source.item(index + offset)
                    } else {
                        Vector::null()
                    };
                    ctx.names.insert(*name, item);
                }
                parts.push(evaluate(body, ctx));
                index += chunk;
            }
            ctx.names = saved;
            Vector::compose(parts)
        }

        Expression::IfElse { conditions, else_ } => {
            for arm in conditions {
                if evaluate(&arm.condition, ctx).truthy() {
                    return evaluate(&arm.then, ctx);
                }
            }
            match else_ {
                Some(else_) => evaluate(else_, ctx),
                None => Vector::null(),
            }
        }

        Expression::Call { function, args, kwargs } => {
            let function = evaluate(function, ctx);
            let argv: Vec<Vector> = args.iter().map(|arg| evaluate(arg, ctx)).collect();
            let kwargv: Vec<(Symbol, Vector)> = kwargs
                .iter()
                .map(|binding| (binding.name, evaluate(&binding.expr, ctx)))
                .collect();
            call_value(&function, &argv, &kwargv, ctx)
        }

        Expression::Function(def) => {
            let closure = make_closure(def, ctx);
            ctx.names.insert(def.name, Vector::Closure(Arc::new(closure)));
            Vector::null()
        }

        Expression::Pragma { name, expr } => {
            let value = evaluate(expr, ctx);
            ctx.pragmas.insert(*name, value);
            Vector::null()
        }

        Expression::Import { names, path } => {
            let path = evaluate(path, ctx);
            let path_text = path.as_string().unwrap_or_default();
            let exports = ctx.modules.get(&path_text).cloned();
            match exports {
                Some(exports) => {
                    for name in names {
                        match exports.names.get(name) {
                            Some(value) => {
                                ctx.names.insert(*name, value.clone());
                            }
                            None => {
                                ctx.errors.insert(format!("Module '{path_text}' does not define '{name}'"));
                                ctx.names.insert(*name, Vector::null());
                            }
                        }
                    }
                }
                None => {
                    ctx.errors.insert(format!("Unable to import from '{path_text}'"));
                    for name in names {
                        ctx.names.insert(*name, Vector::null());
                    }
                }
            }
            Vector::null()
        }

        Expression::StoreGlobal { bindings } => {
            for binding in bindings {
                let value = evaluate(&binding.expr, ctx);
                ctx.state.set(Vector::Symbols(vec![binding.name]), value);
            }
            Vector::null()
        }
    }
}

/// Unpacks a binding's value over its names: a single name takes the whole
/// vector, several names take successive elements, wrapping when short.
fn bind_names(ctx: &mut Context, binding: &PolyBinding, value: Vector) {
    if binding.names.len() == 1 {
        ctx.names.insert(binding.names[0], value);
    } else {
        for (index, name) in binding.names.iter().enumerate() {
            ctx.names.insert(*name, value.item_wrapped(index));
        }
    }
}

fn call_value(function: &Vector, args: &[Vector], kwargs: &[(Symbol, Vector)], ctx: &mut Context) -> Vector {
    match function {
        Vector::Builtin(BuiltinFunction::Debug) => {
            let value = args.first().cloned().unwrap_or_else(Vector::null);
            ctx.logs.insert(value.to_string());
            value
        }
        Vector::Builtin(builtin) => match builtin.invoke(args, kwargs) {
            Ok(value) => value,
            Err(message) => {
                ctx.errors.insert(message);
                Vector::null()
            }
        },
        Vector::Closure(closure) => call_closure(closure, args, kwargs, ctx),
        other => {
            ctx.errors.insert(format!("{other} is not callable"));
            Vector::null()
        }
    }
}

fn call_closure(closure: &Arc<Closure>, args: &[Vector], kwargs: &[(Symbol, Vector)], ctx: &mut Context) -> Vector {
    let function = &closure.function;
    if ctx.depth >= MAX_CALL_DEPTH {
        ctx.errors
            .insert(format!("Recursion limit exceeded calling '{}'", function.name));
        return Vector::null();
    }
    if args.len() > function.parameters.len() {
        ctx.errors.insert(format!(
            "{}() takes at most {} arguments, got {}",
            function.name,
            function.parameters.len(),
            args.len()
        ));
        return Vector::null();
    }
    for (name, _) in kwargs {
        if !function.parameters.iter().any(|parameter| parameter.name == *name) {
            ctx.errors.insert(format!("{}() has no argument '{}'", function.name, name));
            return Vector::null();
        }
    }

    // Parameter values and defaults are computed in the caller's scope, then
    // the body runs in an overlay of captures, self and parameters.
    let mut parameters: Vec<(Symbol, Vector)> = Vec::with_capacity(function.parameters.len());
    for (index, parameter) in function.parameters.iter().enumerate() {
        let value = args.get(index).cloned().or_else(|| {
            kwargs
                .iter()
                .find(|(name, _)| *name == parameter.name)
                .map(|(_, value)| value.clone())
        });
        let value = value.unwrap_or_else(|| evaluate(&parameter.expr, ctx));
        parameters.push((parameter.name, value));
    }

    let saved = ctx.names.clone();
    for (name, value) in &closure.captured {
        ctx.names.insert(*name, value.clone());
    }
    ctx.names.insert(function.name, Vector::Closure(closure.clone()));
    for (name, value) in parameters {
        ctx.names.insert(name, value);
    }
    ctx.depth += 1;
    let result = evaluate(&function.body, ctx);
    ctx.depth -= 1;
    ctx.names = saved;
    result
}

/// Builds a closure value, snapshotting the captured names from the current
/// scope. Uncomputed capture sets (an unsimplified tree) fall back to the
/// body's free names.
fn make_closure(def: &Arc<FunctionDef>, ctx: &Context) -> Closure {
    let captures: Vec<Symbol> = match &def.captures {
        Some(captures) => captures.clone(),
        None => {
            let parameters: Vec<Symbol> = def.parameters.iter().map(|parameter: &Binding| parameter.name).collect();
            def.body
                .free_names()
                .into_iter()
                .filter(|name| !parameters.contains(name) && *name != def.name)
                .collect()
        }
    };
    let captured = captures
        .iter()
        .map(|name| {
            let value = ctx.names.get(name).cloned().unwrap_or_else(Vector::null);
            (*name, value)
        })
        .collect();
    Closure {
        function: def.clone(),
        captured,
    }
}
