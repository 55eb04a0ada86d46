use std::rc::Rc;

use super::ast::*;
use super::env::{self, Binding, Env, NameTable};
use super::error::CompileError;

/// Statically validate a script.
///
/// The walk never stops at the first problem: every violation in the script is
/// collected and returned together, in traversal order.
pub fn check(script: &Script) -> Result<(), Vec<CompileError>> {
    let mut checker = Checker::new();
    let root = Env::root(checker.frame(env::scan_block(&script.body)));
    for stmt in &script.body.stmts {
        checker.check_stmt(stmt, &root);
    }
    tracing::debug!(errors = checker.errors.len(), "semantic check finished");
    if checker.errors.is_empty() {
        Ok(())
    } else {
        Err(checker.errors)
    }
}

struct Checker {
    /// `true` while the innermost enclosing construct is a loop body. A routine
    /// boundary pushes `false` so loops outside a definition do not leak in.
    loops: Vec<bool>,
    /// Kinds of the enclosing definitions, innermost last.
    routines: Vec<DefKind>,
    errors: Vec<CompileError>,
}

impl Checker {
    fn new() -> Self {
        Self {
            loops: Vec::new(),
            routines: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn error(&mut self, message: impl Into<String>, pos: SourcePos) {
        self.errors.push(CompileError::semantic(message, pos));
    }

    /// Report duplicate declarations in a freshly scanned frame and hand it back.
    fn frame<'a>(&mut self, table: NameTable<'a>) -> NameTable<'a> {
        for (name, pos) in table.duplicates() {
            self.error(format!("'{name}' is already declared in this block"), *pos);
        }
        table
    }

    fn in_loop(&self) -> bool {
        self.loops.last().copied().unwrap_or(false)
    }

    fn check_block<'a>(&mut self, block: &'a Block, parent: &Rc<Env<'a>>) {
        let table = self.frame(env::scan_block(block));
        let env = Env::push(table, parent);
        for stmt in &block.stmts {
            self.check_stmt(stmt, &env);
        }
    }

    fn check_loop_body<'a>(&mut self, block: &'a Block, parent: &Rc<Env<'a>>) {
        self.loops.push(true);
        self.check_block(block, parent);
        self.loops.pop();
    }

    fn check_definition<'a>(&mut self, def: &'a Definition, env: &Rc<Env<'a>>) {
        if def.kind == DefKind::Entry {
            if !is_entry_routine(&def.name) {
                self.error(format!("'@{}' is not a known entry routine", def.name), def.pos);
            }
            if !env.is_root() {
                self.error(
                    format!("'@{}' may only be defined at the top level", def.name),
                    def.pos,
                );
            }
        }
        if matches!(def.kind, DefKind::Sub | DefKind::Entry) && !def.params.is_empty() {
            self.error(
                format!("'{}' is a {} and cannot take parameters", def.name, def.kind.keyword()),
                def.pos,
            );
        }

        let table = self.frame(env::scan_routine(def));
        let body_env = Env::push(table, env);
        self.loops.push(false);
        self.routines.push(def.kind);
        for stmt in &def.body.stmts {
            self.check_stmt(stmt, &body_env);
        }
        self.routines.pop();
        self.loops.pop();
    }

    fn check_stmt<'a>(&mut self, stmt: &'a Stmt, env: &Rc<Env<'a>>) {
        match &stmt.kind {
            StmtKind::Def(def) => self.check_definition(def, env),
            StmtKind::Let { init, .. } => {
                if let Some(init) = init {
                    self.check_expr(init, env, true);
                }
            }
            StmtKind::Assign { target, value, .. } => {
                self.check_place(target, env);
                self.check_expr(value, env, true);
            }
            StmtKind::IncDec { target, .. } => self.check_place(target, env),
            StmtKind::Expr(expr) => self.check_expr(expr, env, false),
            StmtKind::If { cond, then_block, else_block } => {
                self.check_expr(cond, env, true);
                self.check_block(then_block, env);
                if let Some(else_block) = else_block {
                    self.check_block(else_block, env);
                }
            }
            StmtKind::Alternative { scrutinee, cases, others } => {
                self.check_expr(scrutinee, env, true);
                for case in cases {
                    for value in &case.values {
                        self.check_expr(value, env, true);
                    }
                    self.check_block(&case.body, env);
                }
                if let Some(others) = others {
                    self.check_block(others, env);
                }
            }
            StmtKind::Loop { count, body } => {
                if let Some(count) = count {
                    self.check_expr(count, env, true);
                }
                self.check_loop_body(body, env);
            }
            StmtKind::While { cond, body } => {
                self.check_expr(cond, env, true);
                self.check_loop_body(body, env);
            }
            StmtKind::Ascent { var, from, to, body, .. } => {
                self.check_expr(from, env, true);
                self.check_expr(to, env, true);
                let table = self.frame(env::scan_counted(var, stmt.pos, body));
                let body_env = Env::push(table, env);
                self.loops.push(true);
                for inner in &body.stmts {
                    self.check_stmt(inner, &body_env);
                }
                self.loops.pop();
            }
            StmtKind::Break | StmtKind::Continue => {
                if !self.in_loop() {
                    let word = if matches!(stmt.kind, StmtKind::Break) { "break" } else { "continue" };
                    self.error(format!("'{word}' outside of a loop"), stmt.pos);
                }
            }
            StmtKind::Return(value) => match self.routines.last().copied() {
                None => self.error("'return' outside of a routine", stmt.pos),
                Some(kind @ (DefKind::Sub | DefKind::Entry)) if value.is_some() => {
                    self.error(
                        format!("a {} cannot return a value", kind.keyword()),
                        stmt.pos,
                    );
                }
                Some(_) => {
                    if let Some(value) = value {
                        self.check_expr(value, env, true);
                    }
                }
            },
            StmtKind::Yield => {
                if self.routines.is_empty() {
                    self.error("'yield' outside of a routine", stmt.pos);
                }
            }
            StmtKind::Block(block) => self.check_block(block, env),
        }
    }

    fn check_place<'a>(&mut self, place: &'a Place, env: &Rc<Env<'a>>) {
        match env.find(&place.name) {
            None => self.error(format!("cannot assign to undeclared '{}'", place.name), place.pos),
            Some(binding) if !binding.is_mutable() => self.error(
                format!("cannot assign to {} '{}'", binding.describe(), place.name),
                place.pos,
            ),
            Some(_) => {}
        }
        for index in &place.indices {
            self.check_expr(index, env, true);
        }
    }

    /// Validate a reference to a routine, either called with `args` or named
    /// bare (which calls it with no arguments).
    fn check_routine_use(&mut self, def: &Definition, argc: usize, value_used: bool, pos: SourcePos) {
        if def.params.len() != argc {
            self.error(
                format!("'{}' expects {} args, got {argc}", def.name, def.params.len()),
                pos,
            );
        }
        if value_used && def.kind != DefKind::Function {
            self.error(
                format!("'{}' is a {} and has no value", def.name, def.kind.keyword()),
                pos,
            );
        }
    }

    fn check_expr<'a>(&mut self, expr: &'a Expr, env: &Rc<Env<'a>>, value_used: bool) {
        match &expr.kind {
            ExprKind::Number(_) | ExprKind::Char(_) | ExprKind::Str(_) | ExprKind::Bool(_) => {}
            ExprKind::Array(items) => {
                for item in items {
                    self.check_expr(item, env, true);
                }
            }
            ExprKind::Ident(name) => {
                if let Some(def) = env.find_def(name) {
                    self.check_routine_use(def, 0, value_used, expr.pos);
                }
            }
            ExprKind::Call { name, args } => {
                match env.find(name) {
                    Some(Binding::Routine(def)) => {
                        self.check_routine_use(def, args.len(), value_used, expr.pos);
                    }
                    Some(other) => self.error(
                        format!("'{name}' is a {}, not a routine", other.describe()),
                        expr.pos,
                    ),
                    // Host library function; resolved by the runtime.
                    None => {}
                }
                for arg in args {
                    self.check_expr(arg, env, true);
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.check_expr(lhs, env, true);
                self.check_expr(rhs, env, true);
            }
            ExprKind::Unary { operand, .. } => self.check_expr(operand, env, true),
            ExprKind::Index { base, index } => {
                self.check_expr(base, env, true);
                self.check_expr(index, env, true);
            }
            ExprKind::Slice { base, start, end } => {
                self.check_expr(base, env, true);
                self.check_expr(start, env, true);
                self.check_expr(end, env, true);
            }
            ExprKind::Conditional { cond, then_expr, else_expr } => {
                self.check_expr(cond, env, true);
                self.check_expr(then_expr, env, true);
                self.check_expr(else_expr, env, true);
            }
        }
    }
}
