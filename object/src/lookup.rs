use crate::layout::{class, method_dict};
use crate::{ObjectMemory, Oop, Value};

/// Upper bound on superclass links walked before assuming a cycle.
const MAX_HIERARCHY_DEPTH: usize = 4096;

/// The result of a method lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult {
    /// No class in the chain defines the selector.
    NotFound,
    /// Selector was found.
    Found {
        method: Oop,
        /// The class whose method dictionary holds `method`. Super sends
        /// issued from `method` resume above the method's own class.
        holder: Oop,
    },
}

/// The superclass of `class`, or `None` at the root.
pub fn superclass_of(memory: &ObjectMemory, class: Oop) -> Option<Oop> {
    memory
        .fetch(class, class::SUPERCLASS)
        .ok()
        .and_then(Value::as_oop)
        .filter(|oop| Value::Object(*oop) != memory.nil())
}

/// Search a single method dictionary for `selector`.
///
/// Keys are unique, so the first identical key is the only one.
pub fn find_in_dictionary(memory: &ObjectMemory, dict: Value, selector: Value) -> Option<Value> {
    let dict = memory.heap_object(dict).ok()?;
    let nil = memory.nil();
    let index = (0..dict.storage.len())
        .find(|&i| dict.storage.fetch(i, nil) == Some(selector))?;
    let values = dict.named.get(method_dict::VALUES)?.as_oop()?;
    memory.fetch_indexed(values, index).ok()
}

/// Walk from `class` up the superclass chain looking for `selector`.
pub fn lookup(memory: &ObjectMemory, class: Oop, selector: Value) -> LookupResult {
    let mut current = Some(class);
    let mut depth = 0;
    while let Some(cls) = current {
        if depth == MAX_HIERARCHY_DEPTH {
            log::warn!("superclass chain of {class:?} exceeds {MAX_HIERARCHY_DEPTH} links");
            break;
        }
        depth += 1;
        if let Ok(dict) = memory.fetch(cls, class::METHOD_DICT) {
            if let Some(Value::Object(method)) = find_in_dictionary(memory, dict, selector) {
                return LookupResult::Found { method, holder: cls };
            }
        }
        current = superclass_of(memory, cls);
    }
    LookupResult::NotFound
}

/// Whether `class` is `ancestor` or inherits from it.
pub fn inherits_from(memory: &ObjectMemory, class: Oop, ancestor: Oop) -> bool {
    let mut current = Some(class);
    let mut depth = 0;
    while let Some(cls) = current {
        if cls == ancestor {
            return true;
        }
        depth += 1;
        if depth > MAX_HIERARCHY_DEPTH {
            return false;
        }
        current = superclass_of(memory, cls);
    }
    false
}
