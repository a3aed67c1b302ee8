//! Native primitive table and its bootstrap-time installation onto the
//! class table.
//!
//! Generalizes `axiom/src/intrinsics.rs`'s `fn(&mut Vm, &[Value]) -> Value`
//! native-table idiom (flat id-indexed dispatch installed onto a method
//! dictionary as a distinguished `Callee` kind, rather than a separate
//! lookup table) to the handful of natives this VM core needs: materializing
//! fresh instances and writing to `Transcript`.

use crate::classes::{Callee, CLASS_CLASS_INDEX, OBJECT_CLASS_INDEX};
use crate::errors::InterpError;
use crate::interpreter::Interpreter;
use crate::value::Value;

const TRANSCRIPT_SHOW: u32 = 0;
const TRANSCRIPT_SHOW_CR: u32 = 1;
const CLASS_NEW: u32 = 2;
const CLASS_NEW_WITH: u32 = 3;
const CLASS_BASIC_NEW: u32 = 4;
const CLASS_BASIC_NEW_WITH: u32 = 5;

/// Wire the class-instantiation natives onto `Class` (reached by every
/// class value's superclass chain, since a user class's metaclass's
/// superclass eventually bottoms out at `Class` itself), then declare and
/// install the `TranscriptStream` singleton the way `Lodtalk/apps/Runner.cpp`
/// seeds its global `Transcript`.
pub fn install(interp: &mut Interpreter) {
    interp.classes().with_mut(CLASS_CLASS_INDEX, |b| {
        b.method_dict.insert("new".to_string(), Callee::Native(CLASS_NEW));
        b.method_dict.insert("new:".to_string(), Callee::Native(CLASS_NEW_WITH));
        b.method_dict.insert("basicNew".to_string(), Callee::Native(CLASS_BASIC_NEW));
        b.method_dict.insert("basicNew:".to_string(), Callee::Native(CLASS_BASIC_NEW_WITH));
    });

    let transcript_class = interp.classes().declare_class("TranscriptStream", OBJECT_CLASS_INDEX, vec![]);
    interp.classes().with_mut(transcript_class, |b| {
        b.method_dict.insert("show:".to_string(), Callee::Native(TRANSCRIPT_SHOW));
        b.method_dict.insert("showCr:".to_string(), Callee::Native(TRANSCRIPT_SHOW_CR));
    });
    let transcript = interp.basic_new(transcript_class).expect("heap exhausted during bootstrap");
    interp.set_transcript(transcript);
}

pub fn invoke(id: u32, interp: &mut Interpreter, receiver: Value, args: &[Value]) -> Result<Value, InterpError> {
    match id {
        TRANSCRIPT_SHOW | TRANSCRIPT_SHOW_CR => {
            let text = interp.display_string(args[0]);
            print!("{text}");
            if id == TRANSCRIPT_SHOW_CR {
                println!();
            }
            Ok(receiver)
        }
        CLASS_NEW | CLASS_BASIC_NEW => {
            let class_index = interp.class_index_from_class_value(receiver);
            interp.basic_new(class_index)
        }
        CLASS_NEW_WITH | CLASS_BASIC_NEW_WITH => {
            let class_index = interp.class_index_from_class_value(receiver);
            let size = args[0].as_small_int().unwrap_or(0).max(0) as usize;
            interp.basic_new_with_size(class_index, size)
        }
        _ => unreachable!("unknown primitive id {id}"),
    }
}
