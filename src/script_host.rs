//! Loads a `.tlk` source file: walks its top-level class declarations,
//! method definitions and do-it statements, compiling each into the class
//! table / running it against the interpreter's global context.
//!
//! Generalizes `axiom/src/runtime.rs`'s `Runtime::load`/`Env` wiring (parse
//! the whole file, then fold each top-level item into the running
//! environment) to this language's three item kinds, cross-checked against
//! `Lodtalk/apps/Runner.cpp` for the "declare classes before installing any
//! of their methods" ordering a single-pass file expects.

use thiserror::Error;

use crate::ast::Item;
use crate::errors::{CompileError, InterpError, ParseError};
use crate::interpreter::Interpreter;
use crate::parser::Parser;

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Interp(#[from] InterpError),
    #[error("unknown superclass {0:?}")]
    UnknownSuperclass(String),
    #[error("unknown class {0:?}")]
    UnknownClass(String),
}

fn run_item(interp: &mut Interpreter, item: &Item) -> Result<(), ScriptError> {
    match item {
        Item::Class(def) => {
            if interp.classes().lookup_by_name(&def.name).is_some() {
                return Ok(());
            }
            let superclass = interp
                .classes()
                .lookup_by_name(&def.superclass)
                .ok_or_else(|| ScriptError::UnknownSuperclass(def.superclass.clone()))?;
            interp.classes().declare_class(&def.name, superclass, def.instance_variables.clone());
            Ok(())
        }
        Item::Method { class_name, method } => {
            let class_index = interp
                .classes()
                .lookup_by_name(class_name)
                .ok_or_else(|| ScriptError::UnknownClass(class_name.clone()))?;
            interp.compile_and_install_method(class_index, method)?;
            Ok(())
        }
        Item::TopLevel(stmt) => {
            interp.run_top_level_statement(stmt).map_err(|e| match e {
                crate::errors::TalonError::Compile(c) => ScriptError::Compile(c),
                crate::errors::TalonError::Interp(i) => ScriptError::Interp(i),
                other => unreachable!("run_top_level_statement cannot produce {other:?}"),
            })?;
            Ok(())
        }
    }
}

/// Parse and run a whole script file: every `classDef`/`methodDef` item
/// folds into the class table before any top-level statement after it runs,
/// the way a single top-to-bottom pass over a file naturally gives.
pub fn run_source(interp: &mut Interpreter, source: &str) -> Result<(), ScriptError> {
    let mut parser = Parser::from_source(source)?;
    let items = parser.parse_file()?;
    for item in &items {
        run_item(interp, item)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::value::Value;

    fn make_interp() -> Interpreter {
        Interpreter::new(&Config { heap_words: 1 << 16, ..Config::default() })
    }

    #[test]
    fn declares_class_and_runs_accessor_method() {
        let mut interp = make_interp();
        let source = "classDef A Object (x).\nmethodDef A x [ ^ x ]\n";
        run_source(&mut interp, source).unwrap();
        let class_index = interp.classes().lookup_by_name("A").unwrap();
        let instance = interp.basic_new(class_index).unwrap();
        let v = interp.send_message_with_selector(instance, "x", &[]).unwrap();
        assert_eq!(v, Value::NIL);
    }

    #[test]
    fn top_level_do_it_runs_immediately() {
        let mut interp = make_interp();
        run_source(&mut interp, "Transcript show: 1 + 2.\n").unwrap();
    }

    #[test]
    fn unknown_superclass_is_reported() {
        let mut interp = make_interp();
        let err = run_source(&mut interp, "classDef A Ghost ().\n").unwrap_err();
        assert!(matches!(err, ScriptError::UnknownSuperclass(name) if name == "Ghost"));
    }
}
