//! Lowering of a checked, analyzed AST into source text for the embedded
//! runtime, plus the line → source position map.
//!
//! Layout of the generated chunk:
//!
//! ```text
//! -- #TouhouDanmakufu[Single]           header comments
//! local rt = ...                        runtime-support namespace
//! local rt_lib = rt.lib                 host library namespace
//! local v_x, dm3_0_Fire                 hoisted block declarations
//! dm3_0_Fire = function(v_angle) ... end
//! function dm3_1_MainLoop() ... end     entry routines are globals
//! v_x = 0                               top-level statements
//! ```
//!
//! Every operator becomes a call into the runtime namespace so the script
//! language's coercion rules hold whatever the target's own operators do.
//! The target dialect needs `goto` (used for `continue`).

use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use super::ast::*;
use super::builtins;
use super::env::{self, Binding, Env};
use super::error::CompileError;
use super::source_map::SourceMap;
use super::writer::CodeWriter;

/// Per-compile knobs. `script_id` must be unique among scripts sharing one
/// runtime so mangled names never collide.
#[derive(Debug, Clone)]
pub struct CodegenOptions {
    pub script_id: u64,
    pub runtime_namespace: String,
    pub mangle_prefix: String,
    pub indent_width: usize,
    /// Append `-- file:line` to every tagged line.
    pub position_comments: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            script_id: 0,
            runtime_namespace: "rt".to_string(),
            mangle_prefix: "dm".to_string(),
            indent_width: 2,
            position_comments: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedScript {
    pub source: String,
    pub source_map: SourceMap,
    /// Entry routine name → mangled global, in definition order.
    pub entry_points: IndexMap<String, String>,
}

/// Generate target source for `script`. The reachability pass must have run.
pub fn generate(script: &Script, options: &CodegenOptions) -> Result<GeneratedScript, CompileError> {
    Generator::new(options, &script.files).generate(script)
}

enum LoopFrame {
    /// A routine boundary: `break`/`continue` never cross it.
    Routine,
    /// A loop, with its continue label when the body uses `continue`.
    Loop(Option<String>),
}

/// One-shot generator: [`Generator::generate`] consumes it.
pub struct Generator<'o> {
    options: &'o CodegenOptions,
    out: CodeWriter,
    files: Vec<String>,
    lib: String,
    /// Mangled name of every reachable definition, keyed by node identity.
    names: FxHashMap<*const Definition, String>,
    entry_points: IndexMap<String, String>,
    loops: Vec<LoopFrame>,
    next_label: u32,
}

impl<'o> Generator<'o> {
    pub fn new(options: &'o CodegenOptions, files: &[String]) -> Self {
        Self {
            options,
            out: CodeWriter::new(options.indent_width, files.to_vec()),
            files: files.to_vec(),
            lib: format!("{}_lib", options.runtime_namespace),
            names: FxHashMap::default(),
            entry_points: IndexMap::new(),
            loops: Vec::new(),
            next_label: 0,
        }
    }

    pub fn generate(mut self, script: &Script) -> Result<GeneratedScript, CompileError> {
        self.assign_names(&script.body);

        for header in &script.headers {
            // One comment line per header whatever the front end put in it.
            let key = header.key.replace(['\r', '\n'], " ");
            let value = header.value.replace(['\r', '\n'], " ");
            self.out.line(&format!("-- #{key}[{value}]"));
        }
        let rt = &self.options.runtime_namespace;
        self.out.line(&format!("local {rt} = ..."));
        self.out.line(&format!("local {} = {rt}.lib", self.lib));

        let root = Env::root(env::scan_block(&script.body));
        self.emit_block_body(&script.body, &root)?;

        let (source, source_map) = self.out.finish();
        tracing::debug!(
            script_id = self.options.script_id,
            routines = self.names.len(),
            lines = source.lines().count(),
            "code generated"
        );
        Ok(GeneratedScript {
            source,
            source_map,
            entry_points: self.entry_points,
        })
    }

    /// Number every reachable definition in tree order.
    fn assign_names(&mut self, body: &Block) {
        let prefix = &self.options.mangle_prefix;
        let id = self.options.script_id;
        let names = &mut self.names;
        let mut serial = 0usize;
        body.for_each_definition(&mut |def| {
            if def.is_reachable() {
                names.insert(
                    std::ptr::from_ref(def),
                    format!("{prefix}{id}_{serial}_{}", sanitize(&def.name)),
                );
                serial += 1;
            }
        });
    }

    fn mangled(&self, def: &Definition, pos: SourcePos) -> Result<String, CompileError> {
        self.names
            .get(&std::ptr::from_ref(def))
            .cloned()
            .ok_or_else(|| {
                CompileError::codegen(format!("reference to eliminated routine '{}'", def.name), pos)
            })
    }

    /// Write a statement's first line, tagged with its source position.
    fn open(&mut self, text: &str, pos: SourcePos) {
        self.out.tagged_line(text, pos);
        if self.options.position_comments {
            let file = file_name(&self.files, pos.file).unwrap_or("?");
            self.out.write(&format!(" -- {file}:{}", pos.line));
        }
    }

    // ── Blocks ──────────────────────────────────────────────────────

    fn emit_block<'a>(&mut self, block: &'a Block, parent: &Rc<Env<'a>>) -> Result<(), CompileError> {
        let frame = Env::push(env::scan_block(block), parent);
        self.emit_block_body(block, &frame)
    }

    /// Emit a block whose frame is already built: hoisted declarations first,
    /// then reachable routines, then the remaining statements in order.
    fn emit_block_body<'a>(&mut self, block: &'a Block, frame: &Rc<Env<'a>>) -> Result<(), CompileError> {
        let mut locals = Vec::new();
        let mut first_decl = None;
        for stmt in &block.stmts {
            match &stmt.kind {
                StmtKind::Let { name, .. } => locals.push(local_name(name)),
                StmtKind::Def(def) if def.is_reachable() && !is_global(def, frame) => {
                    locals.push(self.mangled(def, def.pos)?);
                }
                _ => continue,
            }
            first_decl.get_or_insert(stmt.pos);
        }
        if let Some(pos) = first_decl {
            // Runtime local-count limits are reported on this line.
            self.open(&format!("local {}", locals.join(", ")), pos);
        }

        for def in block.definitions().filter(|d| d.is_reachable()) {
            self.emit_definition(def, frame)?;
        }
        for stmt in &block.stmts {
            self.emit_stmt(stmt, frame)?;
        }
        Ok(())
    }

    fn emit_definition<'a>(&mut self, def: &'a Definition, declared_in: &Rc<Env<'a>>) -> Result<(), CompileError> {
        let name = self.mangled(def, def.pos)?;
        let params: Vec<String> = def.params.iter().map(|p| local_name(&p.name)).collect();
        let params = params.join(", ");
        if is_global(def, declared_in) {
            self.entry_points.insert(def.name.clone(), name.clone());
            self.open(&format!("function {name}({params})"), def.pos);
        } else {
            self.open(&format!("{name} = function({params})"), def.pos);
        }

        let frame = Env::push(env::scan_routine(def), declared_in);
        self.out.indent();
        self.loops.push(LoopFrame::Routine);
        let body = self.emit_block_body(&def.body, &frame);
        self.loops.pop();
        self.out.dedent();
        body?;
        self.out.line("end");
        Ok(())
    }

    fn emit_loop_body<'a>(&mut self, body: &'a Block, frame: &Rc<Env<'a>>) -> Result<(), CompileError> {
        let label = contains_continue(body).then(|| {
            let label = format!("continue_{}", self.next_label);
            self.next_label += 1;
            label
        });
        self.loops.push(LoopFrame::Loop(label.clone()));
        self.out.indent();
        let result = match &label {
            Some(label) => {
                self.out.line("do");
                self.out.indent();
                let inner = self.emit_block_body(body, frame);
                self.out.dedent();
                self.out.line("end");
                self.out.line(&format!("::{label}::"));
                inner
            }
            None => self.emit_block_body(body, frame),
        };
        self.out.dedent();
        self.loops.pop();
        result?;
        self.out.line("end");
        Ok(())
    }

    // ── Statements ──────────────────────────────────────────────────

    fn emit_stmt<'a>(&mut self, stmt: &'a Stmt, env: &Rc<Env<'a>>) -> Result<(), CompileError> {
        let pos = stmt.pos;
        let rt = self.options.runtime_namespace.clone();
        match &stmt.kind {
            // Hoisted by emit_block_body.
            StmtKind::Def(_) => {}
            StmtKind::Let { name, init, .. } => {
                if let Some(init) = init {
                    let value = self.value(init, env)?;
                    self.open(&format!("{} = {value}", local_name(name)), pos);
                }
            }
            StmtKind::Assign { target, op, value } => match op.binary() {
                None if target.indices.is_empty() => {
                    let var = self.place(target, env)?;
                    let value = self.value(value, env)?;
                    self.open(&format!("{var} = {value}"), pos);
                }
                None => {
                    let var = self.place(target, env)?;
                    let indices = self.list(&target.indices, env)?;
                    let value = self.value(value, env)?;
                    self.open(
                        &format!("{var} = {rt}.assign_index({var}, {{{indices}}}, {value})"),
                        pos,
                    );
                }
                Some(bin) => {
                    let rhs = self.expr(value, env)?;
                    self.emit_update(target, env, pos, |g, current| g.binary(bin, &current, &rhs))?;
                }
            },
            StmtKind::IncDec { target, increment } => {
                let f = if *increment { "inc" } else { "dec" };
                self.emit_update(target, env, pos, |_, current| format!("{rt}.{f}({current})"))?;
            }
            StmtKind::Expr(expr) => {
                let code = self.expr(expr, env)?;
                if lowers_to_call(expr, env) {
                    self.open(&code, pos);
                } else if matches!(&expr.kind, ExprKind::Ident(name) if env.find(name).is_none()) {
                    // A bare library name in statement position is a call.
                    self.open(&format!("{code}()"), pos);
                } else {
                    self.open(&format!("local _ = {code}"), pos);
                }
            }
            StmtKind::If { cond, then_block, else_block } => {
                let cond = self.expr(cond, env)?;
                self.open(&format!("if {rt}.truthy({cond}) then"), pos);
                self.out.indent();
                self.emit_block(then_block, env)?;
                self.out.dedent();
                if let Some(else_block) = else_block {
                    self.out.line("else");
                    self.out.indent();
                    self.emit_block(else_block, env)?;
                    self.out.dedent();
                }
                self.out.line("end");
            }
            StmtKind::Alternative { scrutinee, cases, others } => {
                let scrutinee = self.expr(scrutinee, env)?;
                self.open("do", pos);
                self.out.indent();
                self.out.line(&format!("local sw = {scrutinee}"));
                for (i, case) in cases.iter().enumerate() {
                    let mut tests = Vec::with_capacity(case.values.len());
                    for value in &case.values {
                        tests.push(format!("{rt}.case_eq(sw, {})", self.expr(value, env)?));
                    }
                    let test = if tests.is_empty() { "false".to_string() } else { tests.join(" or ") };
                    let keyword = if i == 0 { "if" } else { "elseif" };
                    let case_pos = case.values.first().map_or(case.body.pos, |v| v.pos);
                    self.open(&format!("{keyword} {test} then"), case_pos);
                    self.out.indent();
                    self.emit_block(&case.body, env)?;
                    self.out.dedent();
                }
                if let Some(others) = others {
                    if cases.is_empty() {
                        self.emit_block(others, env)?;
                    } else {
                        self.out.line("else");
                        self.out.indent();
                        self.emit_block(others, env)?;
                        self.out.dedent();
                    }
                }
                if !cases.is_empty() {
                    self.out.line("end");
                }
                self.out.dedent();
                self.out.line("end");
            }
            StmtKind::Loop { count, body } => {
                match count {
                    Some(count) => {
                        let count = self.expr(count, env)?;
                        self.open(&format!("for _ = 1, {rt}.count({count}) do"), pos);
                    }
                    None => self.open("while true do", pos),
                }
                let frame = Env::push(env::scan_block(body), env);
                self.emit_loop_body(body, &frame)?;
            }
            StmtKind::While { cond, body } => {
                let cond = self.expr(cond, env)?;
                self.open(&format!("while {rt}.truthy({cond}) do"), pos);
                let frame = Env::push(env::scan_block(body), env);
                self.emit_loop_body(body, &frame)?;
            }
            StmtKind::Ascent { var, from, to, descending, body } => {
                let from = self.expr(from, env)?;
                let to = self.expr(to, env)?;
                let iter = if *descending { "descent" } else { "ascent" };
                self.open(
                    &format!("for {} in {rt}.{iter}({from}, {to}) do", local_name(var)),
                    pos,
                );
                let frame = Env::push(env::scan_counted(var, pos, body), env);
                self.emit_loop_body(body, &frame)?;
            }
            StmtKind::Break => {
                self.innermost_loop("break", pos)?;
                self.open("break", pos);
            }
            StmtKind::Continue => {
                let label = self.innermost_loop("continue", pos)?.ok_or_else(|| {
                    CompileError::codegen("continue in a loop without a continue label", pos)
                })?;
                self.open(&format!("goto {label}"), pos);
            }
            StmtKind::Return(value) => match value {
                Some(value) => {
                    let value = self.expr(value, env)?;
                    self.open(&format!("do return {value} end"), pos);
                }
                None => self.open("do return end", pos),
            },
            StmtKind::Yield => self.open(&format!("{rt}.yield()"), pos),
            StmtKind::Block(block) => {
                self.open("do", pos);
                self.out.indent();
                self.emit_block(block, env)?;
                self.out.dedent();
                self.out.line("end");
            }
        }
        Ok(())
    }

    fn innermost_loop(&self, what: &str, pos: SourcePos) -> Result<Option<String>, CompileError> {
        match self.loops.last() {
            Some(LoopFrame::Loop(label)) => Ok(label.clone()),
            _ => Err(CompileError::codegen(format!("{what} outside of a loop"), pos)),
        }
    }

    /// Read-modify-write of `target`. Index expressions are evaluated once.
    fn emit_update<'a>(
        &mut self,
        target: &'a Place,
        env: &Rc<Env<'a>>,
        pos: SourcePos,
        update: impl FnOnce(&Self, String) -> String,
    ) -> Result<(), CompileError> {
        let var = self.place(target, env)?;
        if target.indices.is_empty() {
            let value = update(self, var.clone());
            self.open(&format!("{var} = {value}"), pos);
            return Ok(());
        }

        let rt = self.options.runtime_namespace.clone();
        let indices = self.list(&target.indices, env)?;
        let keys: Vec<String> = (1..=target.indices.len()).map(|i| format!("k{i}")).collect();
        let keys = keys.join(", ");
        let value = update(self, format!("{rt}.index_path({var}, {{{keys}}})"));
        self.open("do", pos);
        self.out.indent();
        self.out.line(&format!("local {keys} = {indices}"));
        self.out
            .line(&format!("{var} = {rt}.assign_index({var}, {{{keys}}}, {value})"));
        self.out.dedent();
        self.out.line("end");
        Ok(())
    }

    /// Local name of an assignment target.
    fn place<'a>(&self, target: &'a Place, env: &Rc<Env<'a>>) -> Result<String, CompileError> {
        match env.find(&target.name) {
            Some(Binding::Variable { .. } | Binding::Param { .. }) => Ok(local_name(&target.name)),
            Some(other) => Err(CompileError::codegen(
                format!("assignment to {} '{}'", other.describe(), target.name),
                target.pos,
            )),
            None => Err(CompileError::codegen(
                format!("assignment to undeclared '{}'", target.name),
                target.pos,
            )),
        }
    }

    // ── Expressions ─────────────────────────────────────────────────

    /// An expression about to be stored: copied unless it is a fresh value.
    fn value<'a>(&self, expr: &'a Expr, env: &Rc<Env<'a>>) -> Result<String, CompileError> {
        let code = self.expr(expr, env)?;
        if needs_copy(expr, env) {
            Ok(format!("{}.copy({code})", self.options.runtime_namespace))
        } else {
            Ok(code)
        }
    }

    fn list<'a>(&self, exprs: &'a [Expr], env: &Rc<Env<'a>>) -> Result<String, CompileError> {
        let mut parts = Vec::with_capacity(exprs.len());
        for expr in exprs {
            parts.push(self.expr(expr, env)?);
        }
        Ok(parts.join(", "))
    }

    fn binary(&self, op: BinOp, lhs: &str, rhs: &str) -> String {
        let rt = &self.options.runtime_namespace;
        let f = builtins::binary_fn(op);
        match op {
            BinOp::And | BinOp::Or => format!("{rt}.{f}({lhs}, function() return {rhs} end)"),
            _ => format!("{rt}.{f}({lhs}, {rhs})"),
        }
    }

    fn expr<'a>(&self, expr: &'a Expr, env: &Rc<Env<'a>>) -> Result<String, CompileError> {
        let rt = &self.options.runtime_namespace;
        Ok(match &expr.kind {
            ExprKind::Number(n) => number_literal(*n),
            ExprKind::Char(c) => format!("{rt}.char({})", u32::from(*c)),
            ExprKind::Str(s) => string_literal(s),
            ExprKind::Bool(b) => b.to_string(),
            ExprKind::Array(items) => format!("{rt}.array({{{}}})", self.list(items, env)?),
            ExprKind::Ident(name) => self.reference(name, None, env, expr.pos)?,
            ExprKind::Call { name, args } => self.reference(name, Some(args.as_slice()), env, expr.pos)?,
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.expr(lhs, env)?;
                let rhs = self.expr(rhs, env)?;
                self.binary(*op, &lhs, &rhs)
            }
            ExprKind::Unary { op, operand } => {
                format!("{rt}.{}({})", builtins::unary_fn(*op), self.expr(operand, env)?)
            }
            ExprKind::Index { base, index } => {
                format!("{rt}.index({}, {})", self.expr(base, env)?, self.expr(index, env)?)
            }
            ExprKind::Slice { base, start, end } => format!(
                "{rt}.slice({}, {}, {})",
                self.expr(base, env)?,
                self.expr(start, env)?,
                self.expr(end, env)?
            ),
            ExprKind::Conditional { cond, then_expr, else_expr } => format!(
                "{rt}.cond({}, function() return {} end, function() return {} end)",
                self.expr(cond, env)?,
                self.expr(then_expr, env)?,
                self.expr(else_expr, env)?
            ),
        })
    }

    /// A name in expression position. `args` is `None` for a bare identifier;
    /// a bare routine name is a call with no arguments.
    fn reference<'a>(
        &self,
        name: &str,
        args: Option<&'a [Expr]>,
        env: &Rc<Env<'a>>,
        pos: SourcePos,
    ) -> Result<String, CompileError> {
        let rt = &self.options.runtime_namespace;
        match env.find(name) {
            Some(Binding::Routine(def)) => {
                let mangled = self.mangled(def, pos)?;
                let args = self.list(args.unwrap_or_default(), env)?;
                Ok(match (def.is_task(), args.is_empty()) {
                    (true, true) => format!("{rt}.spawn({mangled})"),
                    (true, false) => format!("{rt}.spawn({mangled}, {args})"),
                    (false, _) => format!("{mangled}({args})"),
                })
            }
            Some(binding) => match args {
                None => Ok(local_name(name)),
                Some(_) => Err(CompileError::codegen(
                    format!("call to {} '{name}'", binding.describe()),
                    pos,
                )),
            },
            None => {
                let member = lib_member(&self.lib, name);
                match args {
                    None => Ok(member),
                    Some(args) => Ok(format!("{member}({})", self.list(args, env)?)),
                }
            }
        }
    }
}

/// Root-level entry routines are emitted as globals the host can dispatch to.
fn is_global(def: &Definition, declared_in: &Env<'_>) -> bool {
    def.kind == DefKind::Entry && declared_in.is_root()
}

/// Whether storing the value of `expr` must deep-copy it to keep value
/// semantics. Literals, operator results and slices are fresh; anything that
/// may alias a live variable is not.
pub fn needs_copy(expr: &Expr, env: &Env<'_>) -> bool {
    match &expr.kind {
        ExprKind::Number(_) | ExprKind::Char(_) | ExprKind::Str(_) | ExprKind::Bool(_) => false,
        ExprKind::Array(items) => items.iter().any(|item| needs_copy(item, env)),
        ExprKind::Binary { .. } | ExprKind::Unary { .. } | ExprKind::Slice { .. } => false,
        ExprKind::Conditional { then_expr, else_expr, .. } => {
            needs_copy(then_expr, env) || needs_copy(else_expr, env)
        }
        ExprKind::Index { .. } => true,
        ExprKind::Ident(name) => match env.find(name) {
            Some(Binding::Variable { .. } | Binding::Param { .. }) => true,
            Some(Binding::Routine(def)) => def.kind == DefKind::Function,
            Some(Binding::Counter { .. }) | None => false,
        },
        // Host library results are always fresh.
        ExprKind::Call { name, .. } => {
            matches!(env.find(name), Some(Binding::Routine(def)) if def.kind == DefKind::Function)
        }
    }
}

/// Whether `expr` lowers to a call, which the target accepts as a statement.
fn lowers_to_call(expr: &Expr, env: &Env<'_>) -> bool {
    match &expr.kind {
        ExprKind::Number(_) | ExprKind::Char(_) | ExprKind::Str(_) | ExprKind::Bool(_) => false,
        ExprKind::Ident(name) => matches!(env.find(name), Some(Binding::Routine(_))),
        _ => true,
    }
}

/// `continue` statements that target the loop owning `block`.
fn contains_continue(block: &Block) -> bool {
    block.stmts.iter().any(|stmt| match &stmt.kind {
        StmtKind::Continue => true,
        StmtKind::If { .. } | StmtKind::Alternative { .. } | StmtKind::Block(_) => {
            stmt.kind.blocks().into_iter().any(contains_continue)
        }
        _ => false,
    })
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn local_name(name: &str) -> String {
    format!("v_{}", sanitize(name))
}

const TARGET_KEYWORDS: &[&str] = &[
    "and", "break", "do", "else", "elseif", "end", "false", "for", "function", "goto", "if",
    "in", "local", "nil", "not", "or", "repeat", "return", "then", "true", "until", "while",
];

fn lib_member(lib: &str, name: &str) -> String {
    let plain = name.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !TARGET_KEYWORDS.contains(&name);
    if plain {
        format!("{lib}.{name}")
    } else {
        format!("{lib}[{}]", string_literal(name))
    }
}

fn number_literal(n: f64) -> String {
    if n.is_nan() {
        "(0/0)".to_string()
    } else if n.is_infinite() && n.is_sign_positive() {
        "math.huge".to_string()
    } else if n.is_infinite() {
        "(-math.huge)".to_string()
    } else {
        format!("{n}")
    }
}

fn string_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\{byte:03}"));
                }
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::build::*;
    use crate::dsl::error::ErrorKind;
    use crate::dsl::reach;

    fn compile(s: &Script) -> GeneratedScript {
        reach::analyze(s);
        generate(s, &CodegenOptions::default()).unwrap()
    }

    /// Number of routine definitions named `name` in the output.
    fn definitions_of(source: &str, name: &str) -> usize {
        let assigned = format!("_{name} = function(");
        let global = format!("_{name}(");
        source
            .lines()
            .map(str::trim_start)
            .filter(|l| l.contains(&assigned) || (l.starts_with("function ") && l.contains(&global)))
            .count()
    }

    fn line_of(source: &str, needle: &str) -> u32 {
        let idx = source.lines().position(|l| l.contains(needle)).unwrap();
        u32::try_from(idx).unwrap() + 1
    }

    #[test]
    fn small_script_lowers_as_expected() {
        let s = script(vec![
            let_("count", num(0.0)).at(1),
            function("Next", &["n"], vec![ret(bin(BinOp::Add, ident("n"), num(1.0))).at(3)]).at(2),
            entry("MainLoop", vec![
                assign("count", call("Next", vec![ident("count")])).at(6),
                yield_().at(7),
            ])
            .at(5),
        ]);
        let out = compile(&s);
        let expected = "\
local rt = ...
local rt_lib = rt.lib
local v_count, dm0_0_Next
dm0_0_Next = function(v_n)
  do return rt.add(v_n, 1) end
end
function dm0_1_MainLoop()
  v_count = rt.copy(dm0_0_Next(v_count))
  rt.yield()
end
v_count = 0
";
        assert_eq!(out.source, expected);
        assert_eq!(out.entry_points.get("MainLoop").map(String::as_str), Some("dm0_1_MainLoop"));
        assert_eq!(out.source_map.tagged(3), Some(SourcePos::new(1, 1)), "hoist line maps to the first declaration");
        assert_eq!(out.source_map.tagged(4), Some(SourcePos::new(2, 1)));
        assert_eq!(out.source_map.tagged(8), Some(SourcePos::new(6, 1)));
        assert_eq!(out.source_map.tagged(11), Some(SourcePos::new(1, 1)));
        assert_eq!(out.source_map.tagged(6), None, "structural 'end' is untagged");
    }

    #[test]
    fn called_routines_are_emitted() {
        let s = script(vec![
            function("A", &[], vec![ret(call("B", vec![]))]),
            function("B", &[], vec![ret(num(1.0))]),
            entry("Initialize", vec![call_stmt("A", vec![])]),
        ]);
        let out = compile(&s);
        assert_eq!(definitions_of(&out.source, "A"), 1);
        assert_eq!(definitions_of(&out.source, "B"), 1);
        assert_eq!(definitions_of(&out.source, "Initialize"), 1);
    }

    #[test]
    fn unreferenced_routine_is_absent() {
        let s = script(vec![
            function("Unused", &[], vec![ret(num(1.0))]),
            entry("MainLoop", vec![yield_()]),
        ]);
        let out = compile(&s);
        assert!(!out.source.contains("Unused"), "{}", out.source);
    }

    #[test]
    fn recursive_routines_are_emitted_once() {
        let s = script(vec![
            function("Ping", &["n"], vec![ret(call("Pong", vec![ident("n")]))]),
            function("Pong", &["n"], vec![ret(call("Ping", vec![ident("n")]))]),
            entry("Initialize", vec![call_stmt("Ping", vec![num(3.0)])]),
        ]);
        let out = compile(&s);
        assert_eq!(definitions_of(&out.source, "Ping"), 1);
        assert_eq!(definitions_of(&out.source, "Pong"), 1);
    }

    #[test]
    fn same_name_in_different_scopes_gets_distinct_mangled_names() {
        let s = script(vec![
            function("Left", &[], vec![function("Step", &[], vec![]), call_stmt("Step", vec![])]),
            function("Right", &[], vec![function("Step", &[], vec![]), call_stmt("Step", vec![])]),
            entry("MainLoop", vec![call_stmt("Left", vec![]), call_stmt("Right", vec![])]),
        ]);
        let out = compile(&s);
        assert!(out.source.contains("dm0_1_Step = function()"), "{}", out.source);
        assert!(out.source.contains("dm0_3_Step = function()"), "{}", out.source);
    }

    #[test]
    fn operators_go_through_the_runtime() {
        let s = script(vec![entry("MainLoop", vec![
            let_("a", num(1.0)),
            let_("b", bin(BinOp::Mul, bin(BinOp::Sub, ident("a"), num(2.0)), unary(UnaryOp::Neg, ident("a")))),
            let_("c", bin(BinOp::And, ident("a"), ident("b"))),
        ])]);
        let out = compile(&s);
        assert!(out.source.contains("v_b = rt.mul(rt.sub(v_a, 2), rt.neg(v_a))"), "{}", out.source);
        assert!(out.source.contains("v_c = rt.land(v_a, function() return v_b end)"), "{}", out.source);
        for native in [" + ", " - ", " * ", " and ", " or "] {
            assert!(!out.source.contains(native), "native operator {native:?} in {}", out.source);
        }
    }

    #[test]
    fn aliasing_values_are_copied() {
        let s = script(vec![entry("MainLoop", vec![
            let_("a", array(vec![num(1.0), num(2.0)])),
            let_("b", ident("a")),
            let_("c", array(vec![ident("a")])),
            let_("d", index(ident("a"), num(0.0))),
        ])]);
        let out = compile(&s);
        assert!(out.source.contains("v_a = rt.array({1, 2})"), "{}", out.source);
        assert!(out.source.contains("v_b = rt.copy(v_a)"), "{}", out.source);
        assert!(out.source.contains("v_c = rt.copy(rt.array({v_a}))"), "{}", out.source);
        assert!(out.source.contains("v_d = rt.copy(rt.index(v_a, 0))"), "{}", out.source);
    }

    #[test]
    fn needs_copy_predicate() {
        let s = script(vec![
            let_("x", num(0.0)),
            function("F", &[], vec![ret(num(1.0))]),
            task("T", &[], vec![]),
        ]);
        let root = Env::root(env::scan_block(&s.body));
        assert!(!needs_copy(&num(1.0), &root));
        assert!(!needs_copy(&string("s"), &root));
        assert!(!needs_copy(&array(vec![num(1.0)]), &root));
        assert!(!needs_copy(&bin(BinOp::Concat, ident("x"), ident("x")), &root));
        assert!(needs_copy(&ident("x"), &root));
        assert!(needs_copy(&call("F", vec![]), &root));
        assert!(!needs_copy(&call("GetPlayerX", vec![]), &root));
        assert!(!needs_copy(&call("T", vec![]), &root));
    }

    #[test]
    fn tasks_are_spawned_and_library_names_resolve_late() {
        let s = script(vec![
            task("Fan", &["n"], vec![loop_(Some(ident("n")), vec![
                call_stmt("CreateShot", vec![num(0.0)]),
                yield_(),
            ])]),
            entry("Initialize", vec![call_stmt("Fan", vec![num(5.0)])]),
        ]);
        let out = compile(&s);
        assert!(out.source.contains("rt.spawn(dm0_0_Fan, 5)"), "{}", out.source);
        assert!(out.source.contains("for _ = 1, rt.count(v_n) do"), "{}", out.source);
        assert!(out.source.contains("rt_lib.CreateShot(0)"), "{}", out.source);
    }

    #[test]
    fn continue_uses_a_label_at_the_end_of_the_body() {
        let s = script(vec![entry("MainLoop", vec![ascent("i", num(0.0), num(10.0), vec![
            if_(ident("skip"), vec![cont()], None),
            call_stmt("Fire", vec![ident("i")]),
        ])])]);
        let out = compile(&s);
        assert!(out.source.contains("for v_i in rt.ascent(0, 10) do"), "{}", out.source);
        assert!(out.source.contains("goto continue_0"), "{}", out.source);
        assert!(line_of(&out.source, "::continue_0::") > line_of(&out.source, "rt_lib.Fire(v_i)"));
    }

    #[test]
    fn routines_are_hoisted_above_top_level_statements() {
        let s = script(vec![
            let_("seed", call("Seed", vec![])),
            function("Seed", &[], vec![ret(num(7.0))]),
        ]);
        let out = compile(&s);
        assert!(line_of(&out.source, "dm0_0_Seed = function()") < line_of(&out.source, "v_seed = "));
    }

    #[test]
    fn compound_index_update_evaluates_indices_once() {
        let s = script(vec![entry("MainLoop", vec![
            let_("grid", array(vec![array(vec![num(0.0)])])),
            assign_op(
                Place { indices: vec![call("Row", vec![]), num(0.0)], ..place("grid") },
                AssignOp::Add,
                num(1.0),
            ),
        ])]);
        let out = compile(&s);
        assert!(out.source.contains("local k1, k2 = rt_lib.Row(), 0"), "{}", out.source);
        assert!(
            out.source.contains("v_grid = rt.assign_index(v_grid, {k1, k2}, rt.add(rt.index_path(v_grid, {k1, k2}), 1))"),
            "{}",
            out.source
        );
    }

    #[test]
    fn alternative_lowers_to_if_chain() {
        let s = script(vec![entry("MainLoop", vec![alternative(
            ident("mode"),
            vec![
                (vec![num(1.0), num(2.0)], vec![call_stmt("A", vec![])]),
                (vec![num(3.0)], vec![call_stmt("B", vec![])]),
            ],
            Some(vec![call_stmt("C", vec![])]),
        )])]);
        let out = compile(&s);
        assert!(out.source.contains("local sw = rt_lib.mode"), "{}", out.source);
        assert!(out.source.contains("if rt.case_eq(sw, 1) or rt.case_eq(sw, 2) then"), "{}", out.source);
        assert!(out.source.contains("elseif rt.case_eq(sw, 3) then"), "{}", out.source);
        assert!(out.source.contains("else\n"), "{}", out.source);
    }

    #[test]
    fn nested_blocks_indent_by_depth() {
        let s = script(vec![entry("MainLoop", vec![if_(
            boolean(true),
            vec![while_(boolean(false), vec![brk()])],
            None,
        )])]);
        let options = CodegenOptions { indent_width: 4, ..CodegenOptions::default() };
        reach::analyze(&s);
        let out = generate(&s, &options).unwrap();
        assert!(out.source.contains("\n    if rt.truthy(true) then\n        while rt.truthy(false) do\n            break\n"), "{}", out.source);
    }

    #[test]
    fn custom_namespace_and_prefix() {
        let s = script(vec![
            function("Aim", &[], vec![ret(num(1.0))]),
            entry("Initialize", vec![call_stmt("Aim", vec![])]),
        ]);
        reach::analyze(&s);
        let options = CodegenOptions {
            script_id: 42,
            runtime_namespace: "dnh".to_string(),
            mangle_prefix: "s".to_string(),
            ..CodegenOptions::default()
        };
        let out = generate(&s, &options).unwrap();
        assert!(out.source.starts_with("local dnh = ...\nlocal dnh_lib = dnh.lib\n"));
        assert!(out.source.contains("s42_0_Aim = function()"), "{}", out.source);
        assert_eq!(out.entry_points["Initialize"], "s42_1_Initialize");
    }

    #[test]
    fn headers_become_comments() {
        let mut s = script(vec![entry("MainLoop", vec![])]);
        s.headers.push(Header {
            key: "Title".to_string(),
            value: "Stage 1\nboss".to_string(),
            pos: SourcePos::new(1, 1),
        });
        s.headers.push(Header {
            key: "Bad\r\nerror()".to_string(),
            value: "x".to_string(),
            pos: SourcePos::new(2, 1),
        });
        let out = compile(&s);
        assert!(out.source.starts_with("-- #Title[Stage 1 boss]\n-- #Bad  error()[x]\n"), "{}", out.source);
        assert!(!out.source.lines().any(|l| l.starts_with("error()")), "{}", out.source);
    }

    #[test]
    fn position_comments_name_the_file() {
        let s = script(vec![entry("MainLoop", vec![yield_().at(3)]).at(2)]);
        reach::analyze(&s);
        let options = CodegenOptions { position_comments: true, ..CodegenOptions::default() };
        let out = generate(&s, &options).unwrap();
        assert!(out.source.contains("rt.yield() -- main.dnh:3"), "{}", out.source);
    }

    #[test]
    fn reference_to_eliminated_routine_is_a_codegen_error() {
        // Analysis skipped: only the entry routine is reachable.
        let s = script(vec![
            function("Helper", &[], vec![]),
            entry("MainLoop", vec![let_("x", call("Helper", vec![]).at(4))]),
        ]);
        let err = generate(&s, &CodegenOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Codegen);
        assert_eq!(err.pos.line, 4);
    }

    #[test]
    fn bare_identifier_statements() {
        let s = script(vec![entry("MainLoop", vec![
            let_("speed", num(1.0)),
            expr_stmt(ident("speed")),
            expr_stmt(ident("ClearShots")),
        ])]);
        let out = compile(&s);
        assert!(out.source.contains("  local _ = v_speed\n"), "{}", out.source);
        assert!(!out.source.contains("v_speed()"), "{}", out.source);
        assert!(out.source.contains("  rt_lib.ClearShots()\n"), "{}", out.source);
    }

    #[test]
    fn loop_exit_outside_a_loop_is_a_codegen_error() {
        // Analysis skipped: the checker would have rejected these first.
        for stmt in [brk(), cont()] {
            let s = script(vec![entry("MainLoop", vec![stmt.at(3)])]);
            let err = generate(&s, &CodegenOptions::default()).unwrap_err();
            assert_eq!(err.kind, ErrorKind::Codegen);
            assert!(err.message.contains("outside of a loop"), "{}", err.message);
            assert_eq!(err.pos.line, 3);
        }
    }

    #[test]
    fn assignment_to_a_non_variable_is_a_codegen_error() {
        let s = script(vec![
            sub("Fire", vec![]),
            entry("MainLoop", vec![assign("Fire", num(1.0)), assign("ghost", num(2.0))]),
        ]);
        let err = generate(&s, &CodegenOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Codegen);
        assert_eq!(err.message, "assignment to routine 'Fire'");

        let s = script(vec![entry("MainLoop", vec![assign("ghost", num(2.0))])]);
        let err = generate(&s, &CodegenOptions::default()).unwrap_err();
        assert_eq!(err.message, "assignment to undeclared 'ghost'");
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(string_literal("a\"b\\c\n"), "\"a\\\"b\\\\c\\n\"");
        assert_eq!(string_literal("\u{1}"), "\"\\001\"");
        assert_eq!(number_literal(0.5), "0.5");
        assert_eq!(number_literal(3.0), "3");
        assert_eq!(number_literal(f64::INFINITY), "math.huge");
        assert_eq!(lib_member("rt_lib", "end"), "rt_lib[\"end\"]");
    }
}
