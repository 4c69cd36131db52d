//! Mock VM for testing
//!
//! A deterministic stand-in for the embedded expression-language runtime.
//! It executes a tiny statement language (numeric assignments and host
//! function calls), which is enough to exercise slider aliasing, section
//! dispatch, serialization and the host opcode surface without the real VM.
//!
//! Identifiers are case-insensitive, unknown identifiers go through the
//! installed variable resolver before being auto-registered, matching the
//! collaborator this mock replaces.

use crate::types::Real;
use crate::vm::{CodeId, HostArg, HostFn, VarRef, VarResolver, Vm, VmAccess};
use std::collections::HashMap;

#[derive(Clone, Debug)]
enum Expr {
    Const(Real),
    Var(VarRef),
    Call(String, Vec<HostArg>),
}

#[derive(Clone, Debug)]
enum Stmt {
    Assign(VarRef, Expr),
    Expr(Expr),
}

/// Variable cells and script RAM, separated from the interpreter so host
/// functions can borrow them while a section executes.
#[derive(Default)]
struct MockStore {
    cells: Vec<Real>,
    ram: HashMap<u32, Real>,
}

impl VmAccess for MockStore {
    fn get_var(&self, var: VarRef) -> Real {
        self.cells.get(var.0 as usize).copied().unwrap_or(0.0)
    }

    fn set_var(&mut self, var: VarRef, value: Real) {
        if let Some(cell) = self.cells.get_mut(var.0 as usize) {
            *cell = value;
        }
    }

    fn read_ram(&mut self, addr: u32, dest: &mut [Real]) {
        for (i, slot) in dest.iter_mut().enumerate() {
            *slot = self.ram.get(&(addr + i as u32)).copied().unwrap_or(0.0);
        }
    }

    fn write_ram(&mut self, addr: u32, values: &[Real]) {
        for (i, value) in values.iter().enumerate() {
            self.ram.insert(addr + i as u32, *value);
        }
    }
}

/// Observable side effects of engine calls, shared out of the VM so tests
/// keep a handle after the effect takes ownership.
#[derive(Default)]
pub struct MockVmStats {
    pub mem_limit: std::sync::atomic::AtomicU32,
    pub preallocated: std::sync::atomic::AtomicI64,
}

/// Scripted VM used by the test suite.
#[derive(Default)]
pub struct MockVm {
    store: MockStore,
    names: HashMap<String, VarRef>,
    resolver: Option<VarResolver>,
    functions: HashMap<String, HostFn>,
    code: Vec<Vec<Stmt>>,
    stats: std::sync::Arc<MockVmStats>,
}

impl MockVm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the configuration values the engine pushed into the VM.
    pub fn stats(&self) -> std::sync::Arc<MockVmStats> {
        self.stats.clone()
    }

    /// Look up a variable cell by name without registering it.
    pub fn find_var(&self, name: &str) -> Option<VarRef> {
        self.names.get(&name.to_ascii_lowercase()).copied()
    }

    fn eval(&mut self, expr: &Expr) -> Real {
        match expr {
            Expr::Const(v) => *v,
            Expr::Var(v) => self.store.get_var(*v),
            Expr::Call(name, args) => match self.functions.get(name).cloned() {
                Some(func) => func(&mut self.store, args),
                None => 0.0,
            },
        }
    }

    fn bind(&mut self, name: &str) -> VarRef {
        let lower = name.to_ascii_lowercase();
        if let Some(&var) = self.names.get(&lower) {
            return var;
        }
        if let Some(resolver) = &self.resolver {
            if let Some(var) = resolver(name) {
                return var;
            }
        }
        self.register_var(&lower)
    }

    fn parse_operand(&mut self, text: &str) -> Result<Expr, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty operand".to_string());
        }
        if let Ok(value) = text.parse::<Real>() {
            return Ok(Expr::Const(value));
        }
        if is_identifier(text) {
            return Ok(Expr::Var(self.bind(text)));
        }
        Err(format!("bad operand: `{}`", text))
    }

    fn parse_expr(&mut self, text: &str) -> Result<Expr, String> {
        let text = text.trim();
        if let Some(open) = text.find('(') {
            let close = text
                .rfind(')')
                .ok_or_else(|| format!("unterminated call: `{}`", text))?;
            let name = text[..open].trim().to_ascii_lowercase();
            if !is_identifier(&name) {
                return Err(format!("bad function name: `{}`", name));
            }
            if !self.functions.contains_key(&name) {
                return Err(format!("unknown function: `{}`", name));
            }
            let mut args = Vec::new();
            let inner = &text[open + 1..close];
            if !inner.trim().is_empty() {
                for piece in inner.split(',') {
                    args.push(match self.parse_operand(piece)? {
                        Expr::Const(v) => HostArg::Value(v),
                        Expr::Var(v) => HostArg::Var(v),
                        Expr::Call(..) => return Err("nested calls unsupported".to_string()),
                    });
                }
            }
            return Ok(Expr::Call(name, args));
        }
        self.parse_operand(text)
    }

    fn parse_statement(&mut self, stmt: &str) -> Result<Stmt, String> {
        // assignment when `=` comes before any call parenthesis
        if let Some(eq) = stmt.find('=') {
            if stmt.find('(').map_or(true, |open| eq < open) {
                let lhs = stmt[..eq].trim();
                if !is_identifier(lhs) {
                    return Err(format!("bad assignment target: `{}`", lhs));
                }
                let target = self.bind(lhs);
                let rhs = self.parse_expr(&stmt[eq + 1..])?;
                return Ok(Stmt::Assign(target, rhs));
            }
        }
        self.parse_expr(stmt).map(Stmt::Expr)
    }
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !text.starts_with(|c: char| c.is_ascii_digit())
}

impl VmAccess for MockVm {
    fn get_var(&self, var: VarRef) -> Real {
        self.store.get_var(var)
    }

    fn set_var(&mut self, var: VarRef, value: Real) {
        self.store.set_var(var, value);
    }

    fn read_ram(&mut self, addr: u32, dest: &mut [Real]) {
        self.store.read_ram(addr, dest);
    }

    fn write_ram(&mut self, addr: u32, values: &[Real]) {
        self.store.write_ram(addr, values);
    }
}

impl Vm for MockVm {
    fn register_var(&mut self, name: &str) -> VarRef {
        let lower = name.to_ascii_lowercase();
        if let Some(&var) = self.names.get(&lower) {
            return var;
        }
        let var = VarRef(self.store.cells.len() as u32);
        self.store.cells.push(0.0);
        self.names.insert(lower, var);
        var
    }

    fn set_var_resolver(&mut self, resolver: Option<VarResolver>) {
        self.resolver = resolver;
    }

    fn register_function(&mut self, name: &str, func: HostFn) {
        self.functions.insert(name.to_ascii_lowercase(), func);
    }

    fn compile(&mut self, text: &str, _line_offset: u32) -> Result<CodeId, String> {
        let mut stmts = Vec::new();
        for piece in text.split(';') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            stmts.push(self.parse_statement(piece)?);
        }
        let id = CodeId(self.code.len() as u32);
        self.code.push(stmts);
        Ok(id)
    }

    fn execute(&mut self, code: CodeId) {
        let Some(stmts) = self.code.get(code.0 as usize).cloned() else {
            return;
        };
        for stmt in stmts {
            match stmt {
                Stmt::Assign(target, expr) => {
                    let value = self.eval(&expr);
                    self.store.set_var(target, value);
                }
                Stmt::Expr(expr) => {
                    self.eval(&expr);
                }
            }
        }
    }

    fn for_each_var(&mut self, visit: &mut dyn FnMut(&str, VarRef) -> bool) {
        for (name, &var) in &self.names {
            if !visit(name, var) {
                break;
            }
        }
    }

    fn set_mem_limit(&mut self, bytes: u32) {
        self.stats
            .mem_limit
            .store(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    fn prealloc_mem(&mut self, bytes: i64) {
        self.stats
            .preallocated
            .store(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    fn drop_code(&mut self) {
        self.code.clear();
    }

    fn remove_unused_vars(&mut self) {}

    fn free_ram(&mut self) {
        self.store.ram.clear();
    }
}
