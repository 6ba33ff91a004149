mod error;
mod format;
mod gc;
pub mod layout;
mod lookup;
mod memory;
mod method;
mod special;
mod storage;
mod value;

pub use error::MemoryError;
pub use format::{ClassShape, Family, ObjectFormat};
pub use gc::{GcStats, RootProvider};
pub use lookup::{find_in_dictionary, inherits_from, lookup, superclass_of, LookupResult};
pub use memory::{HeapObject, ObjectMemory};
pub use method::{MethodHeader, LARGE_FRAME, SMALL_FRAME};
pub use special::{index as special_index, SpecialObjects};
pub use storage::{Storage, StrategyKind};
pub use value::{Oop, Value, SMALL_INT_MAX, SMALL_INT_MIN};
