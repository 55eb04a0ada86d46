use serde::Serialize;

use super::ast::{BinOp, UnaryOp};

/// Runtime-support function: single source of truth for the name the generator
/// emits and the contract the host runtime has to provide.
/// Adding an operator lowering means adding ONE entry here.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeFn {
    pub name: &'static str,
    pub arity: u8,
    pub category: &'static str,
    pub description: &'static str,
}

/// Every function the generated code may call on the runtime namespace.
pub static RUNTIME_FNS: &[RuntimeFn] = &[
    // ── Arithmetic ──────────────────────────────────────────────
    RuntimeFn { name: "add", arity: 2, category: "arith", description: "a + b with numeric coercion; element-wise on arrays" },
    RuntimeFn { name: "sub", arity: 2, category: "arith", description: "a - b" },
    RuntimeFn { name: "mul", arity: 2, category: "arith", description: "a * b" },
    RuntimeFn { name: "div", arity: 2, category: "arith", description: "a / b" },
    RuntimeFn { name: "rem", arity: 2, category: "arith", description: "a % b (sign follows the dividend)" },
    RuntimeFn { name: "pow", arity: 2, category: "arith", description: "a ^ b" },
    RuntimeFn { name: "neg", arity: 1, category: "arith", description: "-a" },
    RuntimeFn { name: "abs", arity: 1, category: "arith", description: "|a|" },
    RuntimeFn { name: "inc", arity: 1, category: "arith", description: "successor (numbers, chars)" },
    RuntimeFn { name: "dec", arity: 1, category: "arith", description: "predecessor (numbers, chars)" },
    // ── Comparison ──────────────────────────────────────────────
    RuntimeFn { name: "eq", arity: 2, category: "compare", description: "structural equality" },
    RuntimeFn { name: "ne", arity: 2, category: "compare", description: "structural inequality" },
    RuntimeFn { name: "lt", arity: 2, category: "compare", description: "a < b" },
    RuntimeFn { name: "le", arity: 2, category: "compare", description: "a <= b" },
    RuntimeFn { name: "gt", arity: 2, category: "compare", description: "a > b" },
    RuntimeFn { name: "ge", arity: 2, category: "compare", description: "a >= b" },
    RuntimeFn { name: "case_eq", arity: 2, category: "compare", description: "alternative/case match, returns a host boolean" },
    // ── Logic ───────────────────────────────────────────────────
    RuntimeFn { name: "land", arity: 2, category: "logic", description: "a && b, b passed as a thunk" },
    RuntimeFn { name: "lor", arity: 2, category: "logic", description: "a || b, b passed as a thunk" },
    RuntimeFn { name: "lnot", arity: 1, category: "logic", description: "!a" },
    RuntimeFn { name: "truthy", arity: 1, category: "logic", description: "script value → host boolean for branches" },
    RuntimeFn { name: "cond", arity: 3, category: "logic", description: "c ? a : b, both arms passed as thunks" },
    // ── Arrays ──────────────────────────────────────────────────
    RuntimeFn { name: "array", arity: 1, category: "array", description: "build a script array from a host table" },
    RuntimeFn { name: "concat", arity: 2, category: "array", description: "a ~ b" },
    RuntimeFn { name: "index", arity: 2, category: "array", description: "a[i]" },
    RuntimeFn { name: "index_path", arity: 2, category: "array", description: "a[i][j]... for a host table of indices" },
    RuntimeFn { name: "assign_index", arity: 3, category: "array", description: "store through an index path, returns the updated container" },
    RuntimeFn { name: "slice", arity: 3, category: "array", description: "a[i..j]" },
    RuntimeFn { name: "copy", arity: 1, category: "array", description: "deep copy of arrays, identity on scalars" },
    RuntimeFn { name: "char", arity: 1, category: "array", description: "character value from a code point" },
    // ── Control ─────────────────────────────────────────────────
    RuntimeFn { name: "count", arity: 1, category: "control", description: "loop(n) iteration count, clamped at 0" },
    RuntimeFn { name: "ascent", arity: 2, category: "control", description: "iterator over [a, b)" },
    RuntimeFn { name: "descent", arity: 2, category: "control", description: "iterator over [a, b) in reverse" },
    RuntimeFn { name: "spawn", arity: 1, category: "control", description: "start a task coroutine with the remaining args" },
    RuntimeFn { name: "yield", arity: 0, category: "control", description: "suspend the current task for one frame" },
];

/// Runtime function a binary operator lowers to.
pub fn binary_fn(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::Div => "div",
        BinOp::Rem => "rem",
        BinOp::Pow => "pow",
        BinOp::Concat => "concat",
        BinOp::Eq => "eq",
        BinOp::Ne => "ne",
        BinOp::Lt => "lt",
        BinOp::Le => "le",
        BinOp::Gt => "gt",
        BinOp::Ge => "ge",
        BinOp::And => "land",
        BinOp::Or => "lor",
    }
}

pub fn unary_fn(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Neg => "neg",
        UnaryOp::Not => "lnot",
        UnaryOp::Abs => "abs",
    }
}
