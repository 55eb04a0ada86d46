//! Terse constructors for building ASTs in code.
//!
//! Front ends normally hand the compiler a deserialized tree; these helpers
//! exist for hosts that synthesize scripts and for tests. Every node starts at
//! the default position; use [`Positioned::at`] to place it.

use super::ast::*;

pub trait Positioned: Sized {
    fn pos_mut(&mut self) -> &mut SourcePos;

    /// Place the node at `line` (column 1) of the main file.
    fn at(mut self, line: u32) -> Self {
        *self.pos_mut() = SourcePos::new(line, 1);
        self
    }
}

impl Positioned for Stmt {
    fn pos_mut(&mut self) -> &mut SourcePos {
        &mut self.pos
    }

    fn at(mut self, line: u32) -> Self {
        let pos = SourcePos::new(line, 1);
        if let StmtKind::Def(def) = &mut self.kind {
            def.pos = pos;
        }
        self.pos = pos;
        self
    }
}

impl Positioned for Expr {
    fn pos_mut(&mut self) -> &mut SourcePos {
        &mut self.pos
    }
}

pub fn script(stmts: Vec<Stmt>) -> Script {
    let script = Script {
        files: vec!["main.dnh".to_string()],
        headers: Vec::new(),
        body: block(stmts),
    };
    script.mark_root_entries();
    script
}

pub fn block(stmts: Vec<Stmt>) -> Block {
    Block::new(stmts, SourcePos::default())
}

fn stmt(kind: StmtKind) -> Stmt {
    Stmt { kind, pos: SourcePos::default() }
}

fn expr(kind: ExprKind) -> Expr {
    Expr { kind, pos: SourcePos::default() }
}

// ── Definitions ─────────────────────────────────────────────────

fn def(name: &str, kind: DefKind, params: &[&str], body: Vec<Stmt>) -> Stmt {
    let params = params
        .iter()
        .map(|p| Param { name: (*p).to_string(), pos: SourcePos::default() })
        .collect();
    stmt(StmtKind::Def(Definition::new(
        name,
        kind,
        params,
        block(body),
        SourcePos::default(),
    )))
}

pub fn entry(name: &str, body: Vec<Stmt>) -> Stmt {
    def(name, DefKind::Entry, &[], body)
}

pub fn sub(name: &str, body: Vec<Stmt>) -> Stmt {
    def(name, DefKind::Sub, &[], body)
}

pub fn function(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    def(name, DefKind::Function, params, body)
}

pub fn task(name: &str, params: &[&str], body: Vec<Stmt>) -> Stmt {
    def(name, DefKind::Task, params, body)
}

// ── Statements ──────────────────────────────────────────────────

pub fn let_(name: &str, init: Expr) -> Stmt {
    stmt(StmtKind::Let { name: name.to_string(), mutable: true, init: Some(init) })
}

pub fn declare(name: &str) -> Stmt {
    stmt(StmtKind::Let { name: name.to_string(), mutable: true, init: None })
}

pub fn const_(name: &str, init: Expr) -> Stmt {
    stmt(StmtKind::Let { name: name.to_string(), mutable: false, init: Some(init) })
}

pub fn place(name: &str) -> Place {
    Place { name: name.to_string(), indices: Vec::new(), pos: SourcePos::default() }
}

pub fn assign(name: &str, value: Expr) -> Stmt {
    assign_op(place(name), AssignOp::Set, value)
}

pub fn assign_op(target: Place, op: AssignOp, value: Expr) -> Stmt {
    stmt(StmtKind::Assign { target, op, value })
}

pub fn incr(name: &str) -> Stmt {
    stmt(StmtKind::IncDec { target: place(name), increment: true })
}

pub fn call_stmt(name: &str, args: Vec<Expr>) -> Stmt {
    expr_stmt(call(name, args))
}

pub fn expr_stmt(e: Expr) -> Stmt {
    stmt(StmtKind::Expr(e))
}

pub fn ret(value: Expr) -> Stmt {
    stmt(StmtKind::Return(Some(value)))
}

pub fn ret_void() -> Stmt {
    stmt(StmtKind::Return(None))
}

pub fn brk() -> Stmt {
    stmt(StmtKind::Break)
}

pub fn cont() -> Stmt {
    stmt(StmtKind::Continue)
}

pub fn yield_() -> Stmt {
    stmt(StmtKind::Yield)
}

pub fn if_(cond: Expr, then_body: Vec<Stmt>, else_body: Option<Vec<Stmt>>) -> Stmt {
    stmt(StmtKind::If {
        cond,
        then_block: block(then_body),
        else_block: else_body.map(block),
    })
}

pub fn loop_(count: Option<Expr>, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::Loop { count, body: block(body) })
}

pub fn while_(cond: Expr, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::While { cond, body: block(body) })
}

pub fn ascent(var: &str, from: Expr, to: Expr, body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::Ascent {
        var: var.to_string(),
        from,
        to,
        descending: false,
        body: block(body),
    })
}

pub fn alternative(scrutinee: Expr, cases: Vec<(Vec<Expr>, Vec<Stmt>)>, others: Option<Vec<Stmt>>) -> Stmt {
    stmt(StmtKind::Alternative {
        scrutinee,
        cases: cases
            .into_iter()
            .map(|(values, body)| Case { values, body: block(body) })
            .collect(),
        others: others.map(block),
    })
}

pub fn local(body: Vec<Stmt>) -> Stmt {
    stmt(StmtKind::Block(block(body)))
}

// ── Expressions ─────────────────────────────────────────────────

pub fn num(value: f64) -> Expr {
    expr(ExprKind::Number(value))
}

pub fn string(value: &str) -> Expr {
    expr(ExprKind::Str(value.to_string()))
}

pub fn boolean(value: bool) -> Expr {
    expr(ExprKind::Bool(value))
}

pub fn ident(name: &str) -> Expr {
    expr(ExprKind::Ident(name.to_string()))
}

pub fn array(items: Vec<Expr>) -> Expr {
    expr(ExprKind::Array(items))
}

pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    expr(ExprKind::Call { name: name.to_string(), args })
}

pub fn bin(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    expr(ExprKind::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) })
}

pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
    expr(ExprKind::Unary { op, operand: Box::new(operand) })
}

pub fn index(base: Expr, idx: Expr) -> Expr {
    expr(ExprKind::Index { base: Box::new(base), index: Box::new(idx) })
}
