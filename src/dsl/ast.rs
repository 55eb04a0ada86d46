//! AST node types for the danmaku scripting language.
//!
//! The tree is produced by an external front end (see [`crate::parser`]) and is
//! immutable after parsing, with one exception: the per-definition
//! `unreachable` flag, which only the reachability pass flips.

use std::cell::Cell;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Index into [`Script::files`]. File 0 is the main script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u32);

/// Source position for error reporting and the generated source map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SourcePos {
    #[serde(default)]
    pub file: FileId,
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl SourcePos {
    pub fn new(line: u32, column: u32) -> Self {
        Self { file: FileId(0), line, column }
    }

    pub fn in_file(file: FileId, line: u32, column: u32) -> Self {
        Self { file, line, column }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A complete script: its file table, `#Header[...]` lines and top-level block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    /// Main file first, then every included file in inclusion order.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub body: Block,
}

impl Script {
    /// Top-level `@Entry` blocks the host calls by name.
    pub fn root_entries(&self) -> impl Iterator<Item = &Definition> {
        self.body
            .definitions()
            .filter(|def| def.kind == DefKind::Entry && is_entry_routine(&def.name))
    }

    /// Clear the `unreachable` flag on the root entries. A freshly built tree
    /// starts with only these reachable.
    pub fn mark_root_entries(&self) {
        for def in self.root_entries() {
            def.unreachable.set(false);
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }
}

/// Path of the file a position points into, if the file table knows it.
pub fn file_name(files: &[String], file: FileId) -> Option<&str> {
    files.get(file.0 as usize).map(String::as_str)
}

/// `#Title[Stage 1 boss]` → `Header { key: "Title", value: "Stage 1 boss" }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub pos: SourcePos,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    #[serde(default)]
    pub pos: SourcePos,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>, pos: SourcePos) -> Self {
        Self { stmts, pos }
    }

    /// Definitions declared directly in this block (not in nested blocks).
    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        self.stmts.iter().filter_map(|s| match &s.kind {
            StmtKind::Def(def) => Some(def),
            _ => None,
        })
    }

    /// Blocks nested directly under this block's statements, not counting
    /// definition bodies.
    pub fn child_blocks(&self) -> impl Iterator<Item = &Block> {
        self.stmts.iter().flat_map(|s| s.kind.blocks())
    }

    /// Call `f` on every definition in this block and, recursively, in every
    /// nested block and definition body.
    pub fn for_each_definition<'a>(&'a self, f: &mut impl FnMut(&'a Definition)) {
        for stmt in &self.stmts {
            if let StmtKind::Def(def) = &stmt.kind {
                f(def);
                def.body.for_each_definition(f);
            }
        }
        for child in self.child_blocks() {
            child.for_each_definition(f);
        }
    }
}

/// Entry routines the host calls directly. These are the reachability roots.
pub const ENTRY_ROUTINES: &[&str] = &[
    "Initialize",
    "MainLoop",
    "Finalize",
    "Event",
    "Loading",
    "BackGround",
];

pub fn is_entry_routine(name: &str) -> bool {
    ENTRY_ROUTINES.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefKind {
    /// `sub name { ... }`: no params, no value.
    Sub,
    /// `function name(a, b) { ... }`: may return a value.
    Function,
    /// `task name(a) { ... }`: runs as a coroutine, may `yield`.
    Task,
    /// `@MainLoop { ... }`: reserved entry routine.
    Entry,
}

impl DefKind {
    pub fn keyword(self) -> &'static str {
        match self {
            DefKind::Sub => "sub",
            DefKind::Function => "function",
            DefKind::Task => "task",
            DefKind::Entry => "@",
        }
    }
}

fn parsed_unreachable() -> Cell<bool> {
    Cell::new(true)
}

/// A named routine: `sub`, `function`, `task` or an `@Entry` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub name: String,
    pub kind: DefKind,
    #[serde(default)]
    pub params: Vec<Param>,
    pub body: Block,
    #[serde(default)]
    pub pos: SourcePos,
    /// Set for every definition except the root entries until the
    /// reachability pass proves otherwise.
    #[serde(skip, default = "parsed_unreachable")]
    pub unreachable: Cell<bool>,
}

impl Definition {
    pub fn new(
        name: impl Into<String>,
        kind: DefKind,
        params: Vec<Param>,
        body: Block,
        pos: SourcePos,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            params,
            body,
            pos,
            unreachable: parsed_unreachable(),
        }
    }

    pub fn is_reachable(&self) -> bool {
        !self.unreachable.get()
    }

    /// Routines that run as coroutines and are started rather than called.
    pub fn is_task(&self) -> bool {
        self.kind == DefKind::Task
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub pos: SourcePos,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stmt {
    pub kind: StmtKind,
    #[serde(default)]
    pub pos: SourcePos,
}

/// Statements.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StmtKind {
    /// Routine definition.
    Def(Definition),
    /// `let x = 1;` (`mutable`) or `const x = 1;`
    Let {
        name: String,
        #[serde(default = "default_true")]
        mutable: bool,
        #[serde(default)]
        init: Option<Expr>,
    },
    /// `x = e;`, `a[i] += e;`
    Assign {
        target: Place,
        #[serde(default)]
        op: AssignOp,
        value: Expr,
    },
    /// `x++;` / `x--;`
    IncDec { target: Place, increment: bool },
    /// Expression statement, usually a call.
    Expr(Expr),
    If {
        cond: Expr,
        then_block: Block,
        #[serde(default)]
        else_block: Option<Block>,
    },
    /// `alternative(x) case(1, 2) { ... } others { ... }`
    Alternative {
        scrutinee: Expr,
        cases: Vec<Case>,
        #[serde(default)]
        others: Option<Block>,
    },
    /// `loop { ... }` (forever) or `loop(n) { ... }`
    Loop {
        #[serde(default)]
        count: Option<Expr>,
        body: Block,
    },
    While { cond: Expr, body: Block },
    /// `ascent(i in a..b) { ... }` / `descent(i in a..b) { ... }`
    Ascent {
        var: String,
        from: Expr,
        to: Expr,
        #[serde(default)]
        descending: bool,
        body: Block,
    },
    Break,
    Continue,
    Return(Option<Expr>),
    Yield,
    /// `local { ... }`
    Block(Block),
}

impl StmtKind {
    /// Statement-level child blocks (branch, case and loop bodies).
    pub fn blocks(&self) -> Vec<&Block> {
        match self {
            StmtKind::If { then_block, else_block, .. } => {
                let mut blocks = vec![then_block];
                blocks.extend(else_block.iter());
                blocks
            }
            StmtKind::Alternative { cases, others, .. } => {
                let mut blocks: Vec<&Block> = cases.iter().map(|c| &c.body).collect();
                blocks.extend(others.iter());
                blocks
            }
            StmtKind::Loop { body, .. }
            | StmtKind::While { body, .. }
            | StmtKind::Ascent { body, .. }
            | StmtKind::Block(body) => vec![body],
            _ => Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub values: Vec<Expr>,
    pub body: Block,
}

/// Assignment target: a variable with zero or more index steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Place {
    pub name: String,
    #[serde(default)]
    pub indices: Vec<Expr>,
    #[serde(default)]
    pub pos: SourcePos,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignOp {
    #[default]
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Concat,
}

impl AssignOp {
    /// The binary operator a compound assignment expands to.
    pub fn binary(self) -> Option<BinOp> {
        match self {
            AssignOp::Set => None,
            AssignOp::Add => Some(BinOp::Add),
            AssignOp::Sub => Some(BinOp::Sub),
            AssignOp::Mul => Some(BinOp::Mul),
            AssignOp::Div => Some(BinOp::Div),
            AssignOp::Rem => Some(BinOp::Rem),
            AssignOp::Pow => Some(BinOp::Pow),
            AssignOp::Concat => Some(BinOp::Concat),
        }
    }
}

/// Expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    #[serde(default)]
    pub pos: SourcePos,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExprKind {
    /// Numeric literal: `1`, `0.5`
    Number(f64),
    /// Character literal: `'a'`
    Char(char),
    /// String literal: `"text"`
    Str(String),
    /// `true` / `false`
    Bool(bool),
    /// Array literal: `[1, 2, 3]`
    Array(Vec<Expr>),
    /// Variable or routine reference: `x`, `GetPlayerX`
    Ident(String),
    /// Call: `Fire(angle)`
    Call { name: String, args: Vec<Expr> },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// `a[i]`
    Index { base: Box<Expr>, index: Box<Expr> },
    /// `a[i..j]`
    Slice {
        base: Box<Expr>,
        start: Box<Expr>,
        end: Box<Expr>,
    },
    /// `c ? a : b`
    Conditional {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    /// `~` array/string concatenation
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
    /// `|x|`
    Abs,
}
