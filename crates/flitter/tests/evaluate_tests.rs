//! Evaluator behavior: graph building, side channels, closures, and the
//! soundness of partial evaluation against direct evaluation.

use std::sync::Arc;

use indexmap::IndexMap;
use pretty_assertions::assert_eq;

use flitter::{
    Binding, CompareOperator as Cmp, Context, Expression, FunctionDef, IfCondition, LogicOperator as Logic,
    MathOperator as Math, ModuleExports, NameBinding, Names, NodeQuery, PolyBinding, StateDict, Symbol, Top,
    UnaryOperator as Unary, Vector, evaluate,
};

fn name(n: &str) -> Expression {
    Expression::name(n)
}

fn num(x: f64) -> Expression {
    Expression::literal(x)
}

fn add(l: Expression, r: Expression) -> Expression {
    Expression::math(Math::Add, l, r)
}

fn context() -> Context {
    Context::new(IndexMap::new(), StateDict::new())
}

fn context_with(names: &[(&str, Vector)]) -> Context {
    let mut variables = IndexMap::new();
    for (n, v) in names {
        variables.insert(Symbol::new(n), v.clone());
    }
    Context::new(variables, StateDict::new())
}

fn eval(expr: &Expression, ctx: &mut Context) -> Vector {
    evaluate(expr, ctx)
}

#[test]
fn arithmetic_logic_and_comparison() {
    let mut ctx = context();
    assert_eq!(eval(&add(num(5.0), num(10.0)), &mut ctx), Vector::from(15.0));
    assert_eq!(
        eval(&Expression::unary(Unary::Negative, num(3.0)), &mut ctx),
        Vector::from(-3.0)
    );
    assert_eq!(
        eval(&Expression::compare(Cmp::LessThan, num(4.0), num(5.0)), &mut ctx),
        Vector::from(1.0)
    );
    // And/Or return operands; Xor returns the single truthy one.
    assert_eq!(
        eval(&Expression::logic(Logic::And, num(2.0), num(3.0)), &mut ctx),
        Vector::from(3.0)
    );
    assert_eq!(
        eval(&Expression::logic(Logic::Or, num(0.0), num(3.0)), &mut ctx),
        Vector::from(3.0)
    );
    assert_eq!(
        eval(&Expression::logic(Logic::Xor, num(2.0), num(0.0)), &mut ctx),
        Vector::from(2.0)
    );
    assert_eq!(
        eval(&Expression::logic(Logic::Xor, num(2.0), num(3.0)), &mut ctx),
        Vector::from(0.0)
    );
}

#[test]
fn unbound_names_collect_errors_and_yield_null() {
    let mut ctx = context();
    assert_eq!(eval(&name("mystery"), &mut ctx), Vector::null());
    assert!(ctx.errors.contains("Unbound name 'mystery'"));
}

#[test]
fn lookup_reads_state_and_misses_are_null() {
    let mut ctx = context();
    ctx.state.set(Vector::symbol("foo"), Vector::from(5.0));
    let hit = Expression::lookup(Expression::literal(Vector::symbol("foo")));
    assert_eq!(eval(&hit, &mut ctx), Vector::from(5.0));
    let miss = Expression::lookup(Expression::literal(Vector::symbol("bar")));
    assert_eq!(eval(&miss, &mut ctx), Vector::null());
}

#[test]
fn sequences_compose_and_for_loops_iterate() {
    let mut ctx = context();
    let expr = Expression::for_loop(
        ["x"],
        Expression::range(num(0.0), num(4.0), num(1.0)),
        Expression::math(Math::Multiply, name("x"), num(2.0)),
    );
    assert_eq!(eval(&expr, &mut ctx), Vector::from(vec![0.0, 2.0, 4.0, 6.0]));
}

#[test]
fn inline_let_scopes_are_restored() {
    let mut ctx = context_with(&[("x", Vector::from(1.0))]);
    let expr = Expression::inline_let(name("x"), vec![PolyBinding::new(["x"], num(9.0))]);
    assert_eq!(eval(&expr, &mut ctx), Vector::from(9.0));
    assert_eq!(eval(&name("x"), &mut ctx), Vector::from(1.0));
}

#[test]
fn if_chains_pick_the_first_truthy_branch() {
    let mut ctx = context();
    let expr = Expression::if_else(
        vec![
            IfCondition::new(num(0.0), num(1.0)),
            IfCondition::new(num(7.0), num(2.0)),
        ],
        Some(num(3.0)),
    );
    assert_eq!(eval(&expr, &mut ctx), Vector::from(2.0));
}

#[test]
fn node_expressions_build_graphs() {
    let top = Top::new(vec![Expression::append(
        Expression::tag(Expression::node("window"), "main"),
        Expression::attributes(
            Expression::node("canvas"),
            vec![Binding::new("size", Expression::literal(vec![512.0, 256.0]))],
        ),
    )]);
    let mut ctx = context();
    top.run(&mut ctx);
    assert_eq!(ctx.root.children.len(), 1);
    let window = &ctx.root.children[0];
    assert_eq!(window.kind, Symbol::new("window"));
    assert!(window.tags.contains(&Symbol::new("main")));
    assert_eq!(window.children.len(), 1);
    assert_eq!(
        window.children[0].get(Symbol::new("size")),
        Some(&Vector::from(vec![512.0, 256.0]))
    );
}

#[test]
fn search_queries_the_graph_built_so_far() {
    let top = Top::new(vec![
        Expression::tag(Expression::node("lamp"), "left"),
        Expression::Sequence(vec![Expression::Search(NodeQuery::parse("lamp.left."))]),
    ]);
    let mut ctx = context();
    top.run(&mut ctx);
    // The search re-appends the node it found.
    assert_eq!(ctx.root.children.len(), 2);
    assert_eq!(ctx.root.children[1].kind, Symbol::new("lamp"));
}

#[test]
fn store_global_writes_state_under_symbol_keys() {
    let top = Top::new(vec![Expression::StoreGlobal {
        bindings: vec![Binding::new("x", num(5.0))],
    }]);
    let mut ctx = context();
    top.run(&mut ctx);
    assert_eq!(ctx.state.get(&Vector::symbol("x")), Vector::from(5.0));
}

#[test]
fn pragmas_are_recorded() {
    let top = Top::new(vec![Expression::pragma("tempo", num(150.0))]);
    let mut ctx = context();
    top.run(&mut ctx);
    assert_eq!(ctx.pragmas.get(&Symbol::new("tempo")), Some(&Vector::from(150.0)));
}

#[test]
fn debug_forwards_to_the_log_channel_and_passes_through() {
    let mut ctx = context();
    let expr = Expression::call(name("debug"), vec![Expression::literal(vec![1.0, 2.0])]);
    assert_eq!(eval(&expr, &mut ctx), Vector::from(vec![1.0, 2.0]));
    assert!(ctx.logs.contains("1;2"));
}

#[test]
fn user_functions_are_callable_with_defaults_and_kwargs() {
    let def = FunctionDef::new(
        "scale",
        vec![
            Binding::new("x", Expression::Literal(Vector::null())),
            Binding::new("factor", num(2.0)),
        ],
        Expression::math(Math::Multiply, name("x"), name("factor")),
    );
    let top = Top::new(vec![Expression::Function(Arc::new(def))]);
    let mut ctx = context();
    top.run(&mut ctx);
    let default_call = Expression::call(name("scale"), vec![num(3.0)]);
    assert_eq!(eval(&default_call, &mut ctx), Vector::from(6.0));
    let kwarg_call = Expression::call_with_kwargs(name("scale"), vec![num(3.0)], vec![Binding::new("factor", num(10.0))]);
    assert_eq!(eval(&kwarg_call, &mut ctx), Vector::from(30.0));
}

#[test]
fn runaway_recursion_collects_an_error_instead_of_overflowing() {
    // loop(x) = loop(x + 1), unsimplified so nothing folds it away.
    let def = FunctionDef::new(
        "loop",
        vec![Binding::new("x", num(0.0))],
        Expression::call(name("loop"), vec![add(name("x"), num(1.0))]),
    );
    let top = Top::new(vec![Expression::Function(Arc::new(def))]);
    let mut ctx = context();
    top.run(&mut ctx);
    let result = eval(&Expression::call(name("loop"), vec![]), &mut ctx);
    assert_eq!(result, Vector::null());
    assert!(ctx.errors.iter().any(|message| message.contains("Recursion limit")));
}

#[test]
fn calling_a_non_function_is_an_error() {
    let mut ctx = context();
    let result = eval(&Expression::call(num(5.0), vec![]), &mut ctx);
    assert_eq!(result, Vector::null());
    assert!(!ctx.errors.is_empty());
}

#[test]
fn imports_bind_module_exports() {
    let module = Top::new(vec![Expression::Let {
        bindings: vec![PolyBinding::new(["shade"], num(0.5))],
    }]);
    let exports = ModuleExports::collect(&module, &Names::new());
    let top = Top::new(vec![
        Expression::Import {
            names: vec![Symbol::new("shade"), Symbol::new("missing")],
            path: Box::new(Expression::literal("colors.fl")),
        },
        Expression::Sequence(vec![name("shade")]),
    ]);
    let mut ctx = context();
    ctx.modules.insert("colors.fl".to_owned(), exports);
    top.run(&mut ctx);
    assert_eq!(ctx.names.get(&Symbol::new("shade")), Some(&Vector::from(0.5)));
    assert_eq!(ctx.names.get(&Symbol::new("missing")), Some(&Vector::null()));
    assert!(ctx.errors.iter().any(|message| message.contains("missing")));
}

mod soundness {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Simplifying under an environment and evaluating must agree with
    /// evaluating the original expression directly.
    fn assert_sound(expr: &Expression, dynamic: &[(&str, Vector)]) {
        let mut env = Names::new();
        for (n, _) in dynamic {
            env.insert(Symbol::new(n), NameBinding::Dynamic);
        }
        let (simplified, _) = expr.simplified(&env, None);
        let direct = eval(expr, &mut context_with(dynamic));
        let via_simplifier = eval(&simplified, &mut context_with(dynamic));
        assert_eq!(direct, via_simplifier, "diverged on {expr:?} -> {simplified:?}");
    }

    #[test]
    fn arithmetic_identities_preserve_results() {
        let vars = [
            ("x", Vector::from(vec![2.0, 3.0])),
            ("y", Vector::from(7.5)),
        ];
        let cases = [
            add(num(0.0), name("x")),
            Expression::math(Math::Subtract, num(0.0), name("x")),
            Expression::math(Math::Multiply, name("x"), num(-1.0)),
            Expression::math(Math::Divide, name("x"), num(10.0)),
            Expression::math(Math::Multiply, add(name("x"), num(5.0)), num(10.0)),
            Expression::math(Math::Multiply, Expression::math(Math::Subtract, num(5.0), name("x")), num(10.0)),
            Expression::math(Math::Multiply, Expression::math(Math::Divide, name("x"), num(5.0)), num(10.0)),
            Expression::math(Math::FloorDivide, name("y"), num(1.0)),
            Expression::math(Math::Modulo, name("y"), num(1.0)),
            Expression::math(Math::Power, name("y"), num(1.0)),
            Expression::unary(Unary::Negative, add(name("x"), num(5.0))),
            Expression::unary(Unary::Negative, Expression::math(Math::Subtract, name("x"), num(5.0))),
            add(name("x"), Expression::unary(Unary::Negative, name("y"))),
        ];
        for expr in &cases {
            assert_sound(expr, &vars);
        }
    }

    #[test]
    fn logic_shortcuts_preserve_results() {
        let vars = [("x", Vector::from(2.0)), ("z", Vector::null())];
        let t = Expression::literal(flitter::true_vector());
        let f = Expression::literal(flitter::false_vector());
        let cases = [
            Expression::logic(Logic::And, t.clone(), name("x")),
            Expression::logic(Logic::And, f.clone(), name("x")),
            Expression::logic(Logic::Or, t.clone(), name("x")),
            Expression::logic(Logic::Or, f.clone(), name("x")),
            Expression::logic(Logic::Xor, f.clone(), name("x")),
            Expression::logic(Logic::Xor, name("x"), f),
            Expression::logic(Logic::And, name("z"), t),
        ];
        for expr in &cases {
            assert_sound(expr, &vars);
        }
    }

    #[test]
    fn unrolling_and_inlining_preserve_results() {
        let vars = [("z", Vector::from(100.0))];
        let unroll = Expression::for_loop(
            ["x"],
            Expression::literal(vec![1.0, 2.0]),
            add(name("x"), name("z")),
        );
        assert_sound(&unroll, &vars);

        let inline = Expression::inline_let(
            add(name("a"), name("b")),
            vec![PolyBinding::new(["a", "b"], Expression::literal(vec![5.0, 10.0]))],
        );
        assert_sound(&inline, &vars);

        let chain = Expression::if_else(
            vec![
                IfCondition::new(Expression::literal(flitter::false_vector()), num(1.0)),
                IfCondition::new(Expression::literal(flitter::true_vector()), num(2.0)),
            ],
            Some(num(3.0)),
        );
        assert_sound(&chain, &vars);
    }
}
