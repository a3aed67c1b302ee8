//! Detection of the optimized (inlined, not sent) control-flow selectors,
//! shared between the semantic-analysis pass (scope.rs, which must merge an
//! inlined block's locals into the surrounding function) and the emission
//! pass (mod.rs, which emits conditional jumps instead of a send).
//!
//! Table grounded on `Lodtalk/vm/MethodBuilder.cpp`'s inlining of
//! `ifTrue:`/`whileTrue:`/`to:do:`.

use crate::ast::Expr;

pub enum InlinedForm<'a> {
    IfTrue { cond: &'a Expr, then_body: &'a [crate::ast::Stmt] },
    IfFalse { cond: &'a Expr, else_body: &'a [crate::ast::Stmt] },
    IfTrueIfFalse { cond: &'a Expr, then_body: &'a [crate::ast::Stmt], else_body: &'a [crate::ast::Stmt] },
    IfNil { receiver: &'a Expr, nil_body: &'a [crate::ast::Stmt] },
    IfNotNil { receiver: &'a Expr, not_nil_body: &'a [crate::ast::Stmt] },
    WhileTrue { cond_body: &'a [crate::ast::Stmt], body: &'a [crate::ast::Stmt] },
    WhileFalse { cond_body: &'a [crate::ast::Stmt], body: &'a [crate::ast::Stmt] },
    ToDo { start: &'a Expr, stop: &'a Expr, loop_var: &'a str, body: &'a [crate::ast::Stmt] },
    ToByDo { start: &'a Expr, stop: &'a Expr, step: &'a Expr, loop_var: &'a str, body: &'a [crate::ast::Stmt] },
}

fn as_zero_arg_block(e: &Expr) -> Option<&[crate::ast::Stmt]> {
    match e {
        Expr::Block { params, body, .. } if params.is_empty() => Some(body),
        _ => None,
    }
}

fn as_one_arg_block(e: &Expr) -> Option<(&str, &[crate::ast::Stmt])> {
    match e {
        Expr::Block { params, body, .. } if params.len() == 1 => Some((params[0].as_str(), body)),
        _ => None,
    }
}

/// A literal block argument whose parameter count doesn't match `expected`,
/// reported as `(expected, actual, span)`. Only literal `Expr::Block`
/// arguments are checked — a non-block argument (e.g. a block held in a
/// variable) can't be inlined at all and is left to fall through to an
/// ordinary send, the same as today.
fn block_arity_mismatch(e: &Expr, expected: usize) -> Option<(usize, usize, crate::errors::Span)> {
    match e {
        Expr::Block { params, span, .. } if params.len() != expected => Some((expected, params.len(), *span)),
        _ => None,
    }
}

/// Detects a selector/argument shape that matches one of the optimized
/// selectors' calling convention, but whose literal block argument has the
/// wrong arity — the case `detect` itself can't report, since it just
/// returns `None` and leaves the caller to fall back to an ordinary send.
/// A mismatch here is not a valid ordinary send either (the parser has
/// already fixed a literal block's arity at compile time), so callers raise
/// `CompileError::BlockArityMismatch` instead of silently falling through.
pub fn detect_arity_mismatch(receiver: &Expr, selector: &str, args: &[Expr]) -> Option<(usize, usize, crate::errors::Span)> {
    match (selector, args) {
        ("ifTrue:", [blk]) | ("ifFalse:", [blk]) | ("ifNil:", [blk]) | ("ifNotNil:", [blk]) => {
            block_arity_mismatch(blk, 0)
        }
        ("ifTrue:ifFalse:", [t, f]) | ("ifFalse:ifTrue:", [f, t]) => {
            block_arity_mismatch(t, 0).or_else(|| block_arity_mismatch(f, 0))
        }
        ("whileTrue:", [body]) | ("whileFalse:", [body]) => {
            block_arity_mismatch(receiver, 0).or_else(|| block_arity_mismatch(body, 0))
        }
        ("to:do:", [_, blk]) => block_arity_mismatch(blk, 1),
        ("to:by:do:", [_, _, blk]) => block_arity_mismatch(blk, 1),
        _ => None,
    }
}

/// Recognize an optimized-selector shape. Only triggers when every block
/// argument involved is a literal block of the right arity — anything else
/// (non-super, non-cascade is assumed by the caller) falls back to an
/// ordinary send.
pub fn detect<'a>(receiver: &'a Expr, selector: &str, args: &'a [Expr]) -> Option<InlinedForm<'a>> {
    match (selector, args) {
        ("ifTrue:", [blk]) => as_zero_arg_block(blk).map(|b| InlinedForm::IfTrue { cond: receiver, then_body: b }),
        ("ifFalse:", [blk]) => as_zero_arg_block(blk).map(|b| InlinedForm::IfFalse { cond: receiver, else_body: b }),
        ("ifTrue:ifFalse:", [t, f]) => {
            let t = as_zero_arg_block(t)?;
            let f = as_zero_arg_block(f)?;
            Some(InlinedForm::IfTrueIfFalse { cond: receiver, then_body: t, else_body: f })
        }
        ("ifFalse:ifTrue:", [f, t]) => {
            let t = as_zero_arg_block(t)?;
            let f = as_zero_arg_block(f)?;
            Some(InlinedForm::IfTrueIfFalse { cond: receiver, then_body: t, else_body: f })
        }
        ("ifNil:", [blk]) => as_zero_arg_block(blk).map(|b| InlinedForm::IfNil { receiver, nil_body: b }),
        ("ifNotNil:", [blk]) => as_zero_arg_block(blk).map(|b| InlinedForm::IfNotNil { receiver, not_nil_body: b }),
        ("whileTrue:", [body]) => {
            let cond_body = as_zero_arg_block(receiver)?;
            let body = as_zero_arg_block(body)?;
            Some(InlinedForm::WhileTrue { cond_body, body })
        }
        ("whileFalse:", [body]) => {
            let cond_body = as_zero_arg_block(receiver)?;
            let body = as_zero_arg_block(body)?;
            Some(InlinedForm::WhileFalse { cond_body, body })
        }
        ("to:do:", [stop, blk]) => {
            let (loop_var, body) = as_one_arg_block(blk)?;
            Some(InlinedForm::ToDo { start: receiver, stop, loop_var, body })
        }
        ("to:by:do:", [stop, step, blk]) => {
            let (loop_var, body) = as_one_arg_block(blk)?;
            Some(InlinedForm::ToByDo { start: receiver, stop, step, loop_var, body })
        }
        _ => None,
    }
}

/// Every local name an inlined form's block bodies introduce, to be merged
/// into the surrounding function's temporaries rather than spawning a new
/// function scope (the "argument lists are merged into the surrounding
/// function's local variables" rule of the semantic-analysis pass).
pub fn merged_locals(form: &InlinedForm) -> Vec<String> {
    match form {
        InlinedForm::ToDo { loop_var, .. } => vec![loop_var.to_string()],
        InlinedForm::ToByDo { loop_var, .. } => vec![loop_var.to_string()],
        _ => Vec::new(),
    }
}
