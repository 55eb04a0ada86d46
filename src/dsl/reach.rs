//! Dead-code elimination by reachability.
//!
//! Roots are the top-level entry routines plus the top-level statements that
//! run when the script loads. A definition becomes reachable the first time a
//! reference to it resolves while walking reachable code; it is flipped
//! *before* its body is queued, so recursive and mutually recursive routines
//! are expanded exactly once.

use std::collections::VecDeque;
use std::rc::Rc;

use super::ast::*;
use super::env::{self, Binding, Env};

/// Outcome of one analysis, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReachStats {
    pub reachable: usize,
    pub eliminated: usize,
}

/// Mark every definition in `script` reachable or unreachable.
///
/// Safe to run more than once on the same tree: the flags are reset first.
pub fn analyze(script: &Script) -> ReachStats {
    let root = Env::root(env::scan_block(&script.body));
    let mut analyzer = Analyzer { pending: VecDeque::new() };

    script.body.for_each_definition(&mut |def| def.unreachable.set(true));
    for def in script.root_entries() {
        analyzer.mark(def, &root);
    }

    for stmt in &script.body.stmts {
        analyzer.walk_stmt(stmt, &root);
    }
    analyzer.drain();

    let mut stats = ReachStats::default();
    script.body.for_each_definition(&mut |def| {
        if def.is_reachable() {
            stats.reachable += 1;
        } else {
            stats.eliminated += 1;
        }
    });
    tracing::debug!(
        reachable = stats.reachable,
        eliminated = stats.eliminated,
        "reachability analysis finished"
    );
    stats
}

/// Definitions proven reachable whose bodies have not been walked yet, each
/// with the frame it was declared in.
struct Analyzer<'a> {
    pending: VecDeque<(&'a Definition, Rc<Env<'a>>)>,
}

impl<'a> Analyzer<'a> {
    /// Flip `def` to reachable and queue its body. Already-reachable
    /// definitions are ignored, which is what stops recursion.
    fn mark(&mut self, def: &'a Definition, declared_in: &Rc<Env<'a>>) {
        if def.unreachable.replace(false) {
            self.pending.push_back((def, Rc::clone(declared_in)));
        }
    }

    fn drain(&mut self) {
        while let Some((def, declared_in)) = self.pending.pop_front() {
            let body_env = Env::push(env::scan_routine(def), &declared_in);
            for stmt in &def.body.stmts {
                self.walk_stmt(stmt, &body_env);
            }
        }
    }

    fn reference(&mut self, name: &str, env: &Rc<Env<'a>>) {
        if let Some((Binding::Routine(def), frame)) = env.resolve(name) {
            if def.unreachable.get() {
                self.mark(def, &frame);
            }
        }
    }

    fn walk_block(&mut self, block: &'a Block, parent: &Rc<Env<'a>>) {
        let env = Env::push(env::scan_block(block), parent);
        for stmt in &block.stmts {
            self.walk_stmt(stmt, &env);
        }
    }

    fn walk_stmt(&mut self, stmt: &'a Stmt, env: &Rc<Env<'a>>) {
        match &stmt.kind {
            // Bodies are only walked once something reaches them.
            StmtKind::Def(_) => {}
            StmtKind::Let { init, .. } => {
                if let Some(init) = init {
                    self.walk_expr(init, env);
                }
            }
            StmtKind::Assign { target, value, .. } => {
                for index in &target.indices {
                    self.walk_expr(index, env);
                }
                self.walk_expr(value, env);
            }
            StmtKind::IncDec { target, .. } => {
                for index in &target.indices {
                    self.walk_expr(index, env);
                }
            }
            StmtKind::Expr(expr) => self.walk_expr(expr, env),
            StmtKind::If { cond, then_block, else_block } => {
                self.walk_expr(cond, env);
                self.walk_block(then_block, env);
                if let Some(else_block) = else_block {
                    self.walk_block(else_block, env);
                }
            }
            StmtKind::Alternative { scrutinee, cases, others } => {
                self.walk_expr(scrutinee, env);
                for case in cases {
                    for value in &case.values {
                        self.walk_expr(value, env);
                    }
                    self.walk_block(&case.body, env);
                }
                if let Some(others) = others {
                    self.walk_block(others, env);
                }
            }
            StmtKind::Loop { count, body } => {
                if let Some(count) = count {
                    self.walk_expr(count, env);
                }
                self.walk_block(body, env);
            }
            StmtKind::While { cond, body } => {
                self.walk_expr(cond, env);
                self.walk_block(body, env);
            }
            StmtKind::Ascent { var, from, to, body, .. } => {
                self.walk_expr(from, env);
                self.walk_expr(to, env);
                let body_env = Env::push(env::scan_counted(var, stmt.pos, body), env);
                for inner in &body.stmts {
                    self.walk_stmt(inner, &body_env);
                }
            }
            StmtKind::Return(value) => {
                if let Some(value) = value {
                    self.walk_expr(value, env);
                }
            }
            StmtKind::Break | StmtKind::Continue | StmtKind::Yield => {}
            StmtKind::Block(block) => self.walk_block(block, env),
        }
    }

    fn walk_expr(&mut self, expr: &'a Expr, env: &Rc<Env<'a>>) {
        match &expr.kind {
            ExprKind::Number(_) | ExprKind::Char(_) | ExprKind::Str(_) | ExprKind::Bool(_) => {}
            ExprKind::Ident(name) => self.reference(name, env),
            ExprKind::Call { name, args } => {
                self.reference(name, env);
                for arg in args {
                    self.walk_expr(arg, env);
                }
            }
            ExprKind::Array(items) => {
                for item in items {
                    self.walk_expr(item, env);
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk_expr(lhs, env);
                self.walk_expr(rhs, env);
            }
            ExprKind::Unary { operand, .. } => self.walk_expr(operand, env),
            ExprKind::Index { base, index } => {
                self.walk_expr(base, env);
                self.walk_expr(index, env);
            }
            ExprKind::Slice { base, start, end } => {
                self.walk_expr(base, env);
                self.walk_expr(start, env);
                self.walk_expr(end, env);
            }
            ExprKind::Conditional { cond, then_expr, else_expr } => {
                self.walk_expr(cond, env);
                self.walk_expr(then_expr, env);
                self.walk_expr(else_expr, env);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::build::*;

    fn reachable_names(script: &Script) -> Vec<String> {
        let mut names = Vec::new();
        script.body.for_each_definition(&mut |def| {
            if def.is_reachable() {
                names.push(def.name.clone());
            }
        });
        names.sort();
        names
    }

    #[test]
    fn built_tree_starts_with_only_root_entries_reachable() {
        let s = script(vec![
            sub("Spread", vec![entry("MainLoop", vec![])]),
            entry("Custom", vec![]),
            entry("Initialize", vec![]),
        ]);
        assert_eq!(reachable_names(&s), vec!["Initialize"]);
    }

    #[test]
    fn entry_calls_propagate_transitively() {
        let s = script(vec![
            function("A", &[], vec![ret(call("B", vec![]))]),
            function("B", &[], vec![ret(num(1.0))]),
            entry("Initialize", vec![call_stmt("A", vec![])]),
        ]);
        let stats = analyze(&s);
        assert_eq!(reachable_names(&s), vec!["A", "B", "Initialize"]);
        assert_eq!(stats, ReachStats { reachable: 3, eliminated: 0 });
    }

    #[test]
    fn unreferenced_definition_stays_unreachable() {
        let s = script(vec![
            function("Unused", &[], vec![ret(num(1.0))]),
            entry("MainLoop", vec![yield_()]),
        ]);
        let stats = analyze(&s);
        assert_eq!(reachable_names(&s), vec!["MainLoop"]);
        assert_eq!(stats.eliminated, 1);
    }

    #[test]
    fn mutual_recursion_terminates() {
        let s = script(vec![
            function("Ping", &["n"], vec![ret(call("Pong", vec![ident("n")]))]),
            function("Pong", &["n"], vec![ret(call("Ping", vec![ident("n")]))]),
            function("Self", &[], vec![ret(call("Self", vec![]))]),
            entry("Initialize", vec![call_stmt("Ping", vec![num(3.0)])]),
        ]);
        analyze(&s);
        assert_eq!(reachable_names(&s), vec!["Initialize", "Ping", "Pong"]);
    }

    #[test]
    fn top_level_initializers_are_roots() {
        let s = script(vec![
            function("Seed", &[], vec![ret(num(7.0))]),
            let_("seed", call("Seed", vec![])),
        ]);
        analyze(&s);
        assert_eq!(reachable_names(&s), vec!["Seed"]);
    }

    #[test]
    fn nested_definitions_follow_their_owner() {
        let s = script(vec![
            function("Outer", &[], vec![
                function("Helper", &[], vec![ret(num(1.0))]),
                function("Dead", &[], vec![ret(num(2.0))]),
                ret(call("Helper", vec![])),
            ]),
            function("Orphan", &[], vec![
                function("Helper", &[], vec![ret(num(3.0))]),
                ret(call("Helper", vec![])),
            ]),
            entry("MainLoop", vec![call_stmt("Outer", vec![])]),
        ]);
        let stats = analyze(&s);
        assert_eq!(reachable_names(&s), vec!["Helper", "MainLoop", "Outer"]);
        assert_eq!(stats.eliminated, 3);
    }

    #[test]
    fn shadowing_variable_hides_routine() {
        let s = script(vec![
            function("Speed", &[], vec![ret(num(1.0))]),
            entry("MainLoop", vec![local(vec![
                let_("Speed", num(2.0)),
                call_stmt("Print", vec![ident("Speed")]),
            ])]),
        ]);
        analyze(&s);
        assert_eq!(reachable_names(&s), vec!["MainLoop"]);
    }

    #[test]
    fn reanalysis_resets_flags() {
        let mut s = script(vec![
            function("Gone", &[], vec![]),
            entry("MainLoop", vec![call_stmt("Gone", vec![])]),
        ]);
        analyze(&s);
        assert_eq!(reachable_names(&s), vec!["Gone", "MainLoop"]);
        if let StmtKind::Def(main) = &mut s.body.stmts[1].kind {
            main.body.stmts.clear();
        }
        analyze(&s);
        assert_eq!(reachable_names(&s), vec!["MainLoop"]);
    }

    #[test]
    fn long_call_chain_does_not_recurse() {
        let depth = 5_000;
        let mut stmts: Vec<Stmt> = (0..depth)
            .map(|i| function(&format!("F{i}"), &[], vec![call_stmt(&format!("F{}", i + 1), vec![])]))
            .collect();
        stmts.push(function(&format!("F{depth}"), &[], vec![]));
        stmts.push(entry("Initialize", vec![call_stmt("F0", vec![])]));
        let s = script(stmts);
        let stats = analyze(&s);
        assert_eq!(stats.reachable, depth + 2);
    }
}
