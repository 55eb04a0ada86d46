//! Lexical environment: a chain of per-block name tables.
//!
//! Every pass builds its own chain while it walks the tree. A frame is built
//! once when its block is entered (all declarations directly inside the block
//! are hoisted into it) and never changes afterwards.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use super::ast::{Block, Definition, SourcePos, StmtKind};

/// What a name in scope refers to.
#[derive(Debug, Clone, Copy)]
pub enum Binding<'a> {
    Routine(&'a Definition),
    /// `let` (mutable) or `const` declaration.
    Variable { mutable: bool, pos: SourcePos },
    Param { pos: SourcePos },
    /// `ascent`/`descent` loop variable.
    Counter { pos: SourcePos },
}

impl<'a> Binding<'a> {
    pub fn is_mutable(&self) -> bool {
        match self {
            Binding::Variable { mutable, .. } => *mutable,
            Binding::Param { .. } => true,
            Binding::Routine(_) | Binding::Counter { .. } => false,
        }
    }

    pub fn pos(&self) -> SourcePos {
        match self {
            Binding::Routine(def) => def.pos,
            Binding::Variable { pos, .. } | Binding::Param { pos } | Binding::Counter { pos } => *pos,
        }
    }

    pub fn as_routine(&self) -> Option<&'a Definition> {
        match self {
            Binding::Routine(def) => Some(*def),
            _ => None,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Binding::Routine(_) => "routine",
            Binding::Variable { mutable: true, .. } => "variable",
            Binding::Variable { mutable: false, .. } => "constant",
            Binding::Param { .. } => "parameter",
            Binding::Counter { .. } => "loop counter",
        }
    }
}

/// Names declared in one frame.
#[derive(Debug, Default)]
pub struct NameTable<'a> {
    names: FxHashMap<&'a str, Binding<'a>>,
    /// Names declared more than once in this frame, with the later position.
    duplicates: Vec<(&'a str, SourcePos)>,
}

impl<'a> NameTable<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `name`. The first declaration wins; later ones are recorded
    /// as duplicates.
    pub fn declare(&mut self, name: &'a str, binding: Binding<'a>) {
        if self.names.contains_key(name) {
            self.duplicates.push((name, binding.pos()));
        } else {
            self.names.insert(name, binding);
        }
    }

    pub fn get(&self, name: &str) -> Option<Binding<'a>> {
        self.names.get(name).copied()
    }

    pub fn duplicates(&self) -> &[(&'a str, SourcePos)] {
        &self.duplicates
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Collect the declarations directly inside `block` into `table`.
pub fn scan_into<'a>(table: &mut NameTable<'a>, block: &'a Block) {
    for stmt in &block.stmts {
        match &stmt.kind {
            StmtKind::Def(def) => table.declare(&def.name, Binding::Routine(def)),
            StmtKind::Let { name, mutable, .. } => table.declare(
                name,
                Binding::Variable { mutable: *mutable, pos: stmt.pos },
            ),
            _ => {}
        }
    }
}

pub fn scan_block(block: &Block) -> NameTable<'_> {
    let mut table = NameTable::new();
    scan_into(&mut table, block);
    table
}

/// Frame for a routine body: its parameters plus the body's declarations.
pub fn scan_routine(def: &Definition) -> NameTable<'_> {
    let mut table = NameTable::new();
    for p in &def.params {
        table.declare(&p.name, Binding::Param { pos: p.pos });
    }
    scan_into(&mut table, &def.body);
    table
}

/// Frame for an `ascent`/`descent` body: the counter plus the body's declarations.
pub fn scan_counted<'a>(var: &'a str, pos: SourcePos, body: &'a Block) -> NameTable<'a> {
    let mut table = NameTable::new();
    table.declare(var, Binding::Counter { pos });
    scan_into(&mut table, body);
    table
}

/// One scope frame. Frames are shared (`Rc`) so a pass can hold on to the
/// chain a definition was declared in after the walk has left that block.
#[derive(Debug)]
pub struct Env<'a> {
    table: NameTable<'a>,
    parent: Option<Rc<Env<'a>>>,
}

impl<'a> Env<'a> {
    pub fn root(table: NameTable<'a>) -> Rc<Self> {
        Rc::new(Self { table, parent: None })
    }

    pub fn push(table: NameTable<'a>, parent: &Rc<Env<'a>>) -> Rc<Self> {
        Rc::new(Self {
            table,
            parent: Some(Rc::clone(parent)),
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn table(&self) -> &NameTable<'a> {
        &self.table
    }

    /// Nearest enclosing binding for `name`.
    pub fn find(&self, name: &str) -> Option<Binding<'a>> {
        let mut frame = Some(self);
        while let Some(env) = frame {
            if let Some(binding) = env.table.get(name) {
                return Some(binding);
            }
            frame = env.parent.as_deref();
        }
        None
    }

    /// Like [`Env::find`], also returning the frame that holds the binding.
    pub fn resolve(self: &Rc<Self>, name: &str) -> Option<(Binding<'a>, Rc<Env<'a>>)> {
        let mut frame = Some(self);
        while let Some(env) = frame {
            if let Some(binding) = env.table.get(name) {
                return Some((binding, Rc::clone(env)));
            }
            frame = env.parent.as_ref();
        }
        None
    }

    /// Nearest enclosing binding for `name` if it is a routine. A closer
    /// variable of the same name hides an outer routine.
    pub fn find_def(&self, name: &str) -> Option<&'a Definition> {
        self.find(name).and_then(|b| b.as_routine())
    }
}
