//! Semantic analysis: builds the scope chain and classifies every local as
//! captured or not, per §4.3.1.
//!
//! Generalizes `axiom/src/compiler.rs`'s `RegAlloc`/`GlobalTable` local
//! bookkeeping to a scope chain distinguishing literal/global, instance, and
//! temporal bindings, as `Lodtalk/vm/Compiler.cpp` resolves them.

use std::collections::{HashMap, HashSet};

use crate::ast::{Expr, MethodDef, Stmt};
use crate::compiler::optimize;
use crate::errors::{CompileError, Span};

pub type FunctionId = u32;

#[derive(Default, Clone, Debug)]
pub struct FunctionInfo {
    pub parent: Option<FunctionId>,
    /// Declaration order: params first, then temps — mirrors the compiler's
    /// "arguments first, then vector slot, then ordinary temporaries" rule.
    pub params: Vec<String>,
    pub temps: Vec<String>,
    pub captured: HashSet<String>,
}

impl FunctionInfo {
    pub fn declares(&self, name: &str) -> bool {
        self.params.iter().any(|p| p == name) || self.temps.iter().any(|t| t == name)
    }

    pub fn local_index(&self, name: &str) -> Option<u32> {
        self.params
            .iter()
            .position(|p| p == name)
            .or_else(|| self.temps.iter().position(|t| t == name).map(|i| i + self.params.len()))
            .map(|i| i as u32)
    }

    /// Declaration-order position of `name` among this function's captured
    /// locals only — its slot index within the function's temp vector.
    pub fn captured_index(&self, name: &str) -> Option<u32> {
        let all_names: Vec<&String> = self.params.iter().chain(self.temps.iter()).collect();
        all_names
            .iter()
            .filter(|n| self.captured.contains(n.as_str()))
            .position(|n| n.as_str() == name)
            .map(|i| i as u32)
    }

    pub fn has_vector(&self) -> bool {
        !self.captured.is_empty()
    }
}

#[derive(Debug)]
pub struct SemanticInfo {
    pub functions: Vec<FunctionInfo>,
    /// Maps each escaping (non-inlined) block's span to the `FunctionId`
    /// analysis assigned it, so the emission pass can find the right scope
    /// for a `Expr::Block` node without re-walking the tree.
    pub block_functions: HashMap<Span, FunctionId>,
}

impl SemanticInfo {
    pub fn get(&self, id: FunctionId) -> &FunctionInfo {
        &self.functions[id as usize]
    }
}

/// Where an identifier occurrence resolves to, consumed by the emission pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    InstanceVariable(u32),
    Global(String),
    LocalDirect(u32),
    /// Captured by some inner function and read from this function's own
    /// temp vector (this function owns the vector).
    LocalInVector(u32),
    /// Captured by some inner function but declared in an ancestor. `depth`
    /// is the ancestor's rank within the referencing function's own
    /// `outerVectors` array — the flat, nearest-vector-first list of
    /// vector-owning ancestors a `BlockClosure` is handed at creation time
    /// (see `compiler/mod.rs`'s closure-creation emission) — not a raw
    /// function-nesting count. `vector_index` is the slot within that
    /// ancestor's own vector.
    OuterInVector { depth: u32, vector_index: u32 },
}

/// Nearest-vector-first list of ancestor functions (starting at `start`,
/// inclusive) that own a temp vector — the shape a `BlockClosure`'s
/// `outerVectors` array takes at runtime.
fn vector_chain(info: &SemanticInfo, start: Option<FunctionId>) -> Vec<FunctionId> {
    let mut out = Vec::new();
    let mut probe = start;
    while let Some(fid) = probe {
        let f = info.get(fid);
        if f.has_vector() {
            out.push(fid);
        }
        probe = f.parent;
    }
    out
}

pub struct SemanticAnalyzer<'a> {
    functions: Vec<FunctionInfo>,
    block_functions: HashMap<Span, FunctionId>,
    /// Names resolvable as instance variables on the method's receiver class.
    instance_variables: &'a [String],
    known_globals: &'a dyn Fn(&str) -> bool,
}

impl<'a> SemanticAnalyzer<'a> {
    pub fn analyze(
        method: &MethodDef,
        instance_variables: &'a [String],
        known_globals: &'a dyn Fn(&str) -> bool,
    ) -> Result<SemanticInfo, CompileError> {
        let mut analyzer = SemanticAnalyzer {
            functions: Vec::new(),
            block_functions: HashMap::new(),
            instance_variables,
            known_globals,
        };
        let root = analyzer.push_function(None, method.params.clone(), method.temps.clone(), Span::default())?;
        analyzer.walk_stmts(&method.body, root)?;
        Ok(SemanticInfo { functions: analyzer.functions, block_functions: analyzer.block_functions })
    }

    /// Reports `CompileError::DuplicateArgument` if `params` repeats a name —
    /// a method or block with a shadowed parameter has no sensible local
    /// slot to assign the repeated name, so this is caught here rather than
    /// left to produce a confusing later binding.
    fn push_function(
        &mut self,
        parent: Option<FunctionId>,
        params: Vec<String>,
        temps: Vec<String>,
        span: Span,
    ) -> Result<FunctionId, CompileError> {
        let mut seen = HashSet::new();
        for name in &params {
            if !seen.insert(name.as_str()) {
                return Err(CompileError::DuplicateArgument { name: name.clone(), span });
            }
        }
        let id = self.functions.len() as FunctionId;
        self.functions.push(FunctionInfo { parent, params, temps, captured: HashSet::new() });
        Ok(id)
    }

    fn walk_stmts(&mut self, stmts: &[Stmt], current: FunctionId) -> Result<(), CompileError> {
        for stmt in stmts {
            match stmt {
                Stmt::Expr(e) | Stmt::Return(e) => self.walk_expr(e, current)?,
            }
        }
        Ok(())
    }

    fn walk_expr(&mut self, expr: &Expr, current: FunctionId) -> Result<(), CompileError> {
        match expr {
            Expr::Identifier { name, span } => {
                self.note_reference(name, current, *span)?;
            }
            Expr::Assignment { name, value, span } => {
                self.note_reference(name, current, *span)?;
                self.walk_expr(value, current)?;
            }
            Expr::MessageSend { receiver, selector, args, .. } => {
                if let Some(form) = optimize::detect(receiver, selector, args) {
                    return self.walk_inlined(form, current);
                }
                if let Some((expected, actual, span)) = optimize::detect_arity_mismatch(receiver, selector, args) {
                    return Err(CompileError::BlockArityMismatch { expected, actual, span });
                }
                self.walk_expr(receiver, current)?;
                for a in args {
                    self.walk_expr(a, current)?;
                }
            }
            Expr::Block { params, temps, body, span } => {
                let child = self.push_function(Some(current), params.clone(), temps.clone(), *span)?;
                self.block_functions.insert(*span, child);
                self.walk_stmts(body, child)?;
            }
            Expr::LiteralInt { .. }
            | Expr::LiteralChar { .. }
            | Expr::LiteralBool { .. }
            | Expr::LiteralNil { .. }
            | Expr::SelfExpr { .. }
            | Expr::SuperExpr { .. } => {}
        }
        Ok(())
    }

    /// An inlined control-flow selector's block arguments never spawn a new
    /// function scope — their parameters and temporaries are merged into the
    /// surrounding function's own locals, and their bodies walked under the
    /// same `current` id, per §4.3.1's "compiler-inlined selectors never
    /// create real BlockClosures" rule.
    fn walk_inlined(&mut self, form: optimize::InlinedForm, current: FunctionId) -> Result<(), CompileError> {
        for name in optimize::merged_locals(&form) {
            if !self.functions[current as usize].declares(&name) {
                self.functions[current as usize].temps.push(name);
            }
        }
        use optimize::InlinedForm::*;
        match form {
            IfTrue { cond, then_body } => {
                self.walk_expr(cond, current)?;
                self.walk_stmts(then_body, current)?;
            }
            IfFalse { cond, else_body } => {
                self.walk_expr(cond, current)?;
                self.walk_stmts(else_body, current)?;
            }
            IfTrueIfFalse { cond, then_body, else_body } => {
                self.walk_expr(cond, current)?;
                self.walk_stmts(then_body, current)?;
                self.walk_stmts(else_body, current)?;
            }
            IfNil { receiver, nil_body } => {
                self.walk_expr(receiver, current)?;
                self.walk_stmts(nil_body, current)?;
            }
            IfNotNil { receiver, not_nil_body } => {
                self.walk_expr(receiver, current)?;
                self.walk_stmts(not_nil_body, current)?;
            }
            WhileTrue { cond_body, body } | WhileFalse { cond_body, body } => {
                self.walk_stmts(cond_body, current)?;
                self.walk_stmts(body, current)?;
            }
            ToDo { start, stop, body, .. } => {
                self.walk_expr(start, current)?;
                self.walk_expr(stop, current)?;
                self.walk_stmts(body, current)?;
            }
            ToByDo { start, stop, step, body, .. } => {
                self.walk_expr(start, current)?;
                self.walk_expr(stop, current)?;
                self.walk_expr(step, current)?;
                self.walk_stmts(body, current)?;
            }
        }
        Ok(())
    }

    /// Record that `name` is referenced from `current`; if it resolves to
    /// an ancestor function strictly above `current`, mark it captured
    /// there. Unresolved names are checked against instance variables and
    /// the known-globals predicate before being reported as undeclared.
    fn note_reference(&mut self, name: &str, current: FunctionId, span: crate::errors::Span) -> Result<(), CompileError> {
        let mut probe = Some(current);
        let mut depth = 0;
        while let Some(fid) = probe {
            if self.functions[fid as usize].declares(name) {
                if depth > 0 {
                    self.functions[fid as usize].captured.insert(name.to_string());
                }
                return Ok(());
            }
            probe = self.functions[fid as usize].parent;
            depth += 1;
        }
        if self.instance_variables.iter().any(|v| v == name) {
            return Ok(());
        }
        if (self.known_globals)(name) {
            return Ok(());
        }
        Err(CompileError::UndeclaredIdentifier { name: name.to_string(), span })
    }
}

/// Resolve `name` referenced from `current` into a `Binding`, for use by the
/// emission pass. Instance-variable/global fallthrough mirrors
/// `note_reference`'s resolution order.
pub fn resolve_binding(
    info: &SemanticInfo,
    current: FunctionId,
    name: &str,
    instance_variables: &[String],
) -> Binding {
    let cur = info.get(current);
    if cur.declares(name) {
        return if cur.captured.contains(name) {
            Binding::LocalInVector(cur.captured_index(name).expect("captured name must have a vector index"))
        } else {
            Binding::LocalDirect(cur.local_index(name).expect("declared name must have a local index"))
        };
    }
    let mut probe = cur.parent;
    while let Some(fid) = probe {
        let func = info.get(fid);
        if func.declares(name) {
            let vector_index = func.captured_index(name).expect("captured name must have a vector index");
            let chain = vector_chain(info, cur.parent);
            let depth = chain.iter().position(|f| *f == fid).expect("declaring ancestor must be visible in the chain") as u32;
            return Binding::OuterInVector { depth, vector_index };
        }
        probe = func.parent;
    }
    if let Some(pos) = instance_variables.iter().position(|v| v == name) {
        return Binding::InstanceVariable(pos as u32);
    }
    Binding::Global(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Stmt};
    use crate::errors::Span;

    fn ident(name: &str) -> Expr {
        Expr::Identifier { name: name.to_string(), span: Span::default() }
    }

    #[test]
    fn uncaptured_local_resolves_direct() {
        let method = MethodDef {
            selector: "foo".into(),
            params: vec![],
            temps: vec!["x".into()],
            body: vec![Stmt::Return(ident("x"))],
        };
        let info = SemanticAnalyzer::analyze(&method, &[], &|_| false).unwrap();
        let binding = resolve_binding(&info, 0, "x", &[]);
        assert_eq!(binding, Binding::LocalDirect(0));
        assert!(!info.get(0).captured.contains("x"));
    }

    #[test]
    fn variable_referenced_from_nested_block_is_captured() {
        let method = MethodDef {
            selector: "foo".into(),
            params: vec![],
            temps: vec!["x".into()],
            body: vec![Stmt::Expr(Expr::MessageSend {
                receiver: Box::new(Expr::Block {
                    params: vec![],
                    temps: vec![],
                    body: vec![Stmt::Expr(ident("x"))],
                    span: Span::default(),
                }),
                selector: "value".into(),
                args: vec![],
                span: Span::default(),
            })],
        };
        let info = SemanticAnalyzer::analyze(&method, &[], &|_| false).unwrap();
        assert!(info.get(0).captured.contains("x"));
        // Depth 0: the referencing block's immediate enclosing function (the
        // method itself) is rank 0 in its received outerVectors array.
        let binding = resolve_binding(&info, 1, "x", &[]);
        assert_eq!(binding, Binding::OuterInVector { depth: 0, vector_index: 0 });
    }

    #[test]
    fn undeclared_identifier_is_an_error() {
        let method = MethodDef { selector: "foo".into(), params: vec![], temps: vec![], body: vec![Stmt::Return(ident("zzz"))] };
        let err = SemanticAnalyzer::analyze(&method, &[], &|_| false).unwrap_err();
        assert!(matches!(err, CompileError::UndeclaredIdentifier { .. }));
    }

    #[test]
    fn duplicate_method_argument_is_an_error() {
        let method = MethodDef {
            selector: "foo:foo:".into(),
            params: vec!["x".into(), "x".into()],
            temps: vec![],
            body: vec![Stmt::Return(ident("x"))],
        };
        let err = SemanticAnalyzer::analyze(&method, &[], &|_| false).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateArgument { name, .. } if name == "x"));
    }

    #[test]
    fn duplicate_block_argument_is_an_error() {
        let method = MethodDef {
            selector: "foo".into(),
            params: vec![],
            temps: vec![],
            body: vec![Stmt::Expr(Expr::MessageSend {
                receiver: Box::new(Expr::Block {
                    params: vec!["a".into(), "a".into()],
                    temps: vec![],
                    body: vec![],
                    span: Span::default(),
                }),
                selector: "value:value:".into(),
                args: vec![ident("a"), ident("a")],
                span: Span::default(),
            })],
        };
        let err = SemanticAnalyzer::analyze(&method, &[], &|_| false).unwrap_err();
        assert!(matches!(err, CompileError::DuplicateArgument { name, .. } if name == "a"));
    }

    #[test]
    fn to_do_block_with_wrong_arity_is_a_compile_error() {
        let method = MethodDef {
            selector: "foo".into(),
            params: vec![],
            temps: vec![],
            body: vec![Stmt::Expr(Expr::MessageSend {
                receiver: Box::new(Expr::LiteralInt { value: 1, span: Span::default() }),
                selector: "to:do:".into(),
                args: vec![
                    Expr::LiteralInt { value: 3, span: Span::default() },
                    Expr::Block { params: vec!["a".into(), "b".into()], temps: vec![], body: vec![], span: Span::default() },
                ],
                span: Span::default(),
            })],
        };
        let err = SemanticAnalyzer::analyze(&method, &[], &|_| false).unwrap_err();
        assert!(matches!(err, CompileError::BlockArityMismatch { expected: 1, actual: 2, .. }));
    }
}
