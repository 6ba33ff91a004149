//! Named-slot indices of the objects the VM reads and writes directly.

pub mod class {
    pub const SUPERCLASS: usize = 0;
    pub const METHOD_DICT: usize = 1;
    pub const FORMAT: usize = 2;
    pub const INSTANCE_VARIABLES: usize = 3;
    pub const ORGANIZATION: usize = 4;
    pub const SUBCLASSES: usize = 5;
    pub const NAME: usize = 6;
    /// Metaclasses keep their sole instance here.
    pub const THIS_CLASS: usize = 5;
    /// Fixed field count of a Class in the bootstrap image.
    pub const SIZE: usize = 7;
}

/// MethodDictionary: selectors in the indexable region, methods in the
/// array at the same index.
pub mod method_dict {
    pub const TALLY: usize = 0;
    pub const VALUES: usize = 1;
    pub const SIZE: usize = 2;
}

pub mod association {
    pub const KEY: usize = 0;
    pub const VALUE: usize = 1;
    pub const SIZE: usize = 2;
}

pub mod message {
    pub const SELECTOR: usize = 0;
    pub const ARGUMENTS: usize = 1;
    pub const SIZE: usize = 2;
}

pub mod context {
    pub const SENDER: usize = 0;
    pub const PC: usize = 1;
    pub const STACKP: usize = 2;
    pub const METHOD: usize = 3;
    pub const CLOSURE: usize = 4;
    pub const RECEIVER: usize = 5;
    pub const SIZE: usize = 6;

    pub const CALLER: usize = 0;
    pub const BLOCK_ARGC: usize = 3;
    pub const INITIAL_PC: usize = 4;
    pub const HOME: usize = 5;
}

pub mod closure {
    pub const OUTER_CONTEXT: usize = 0;
    pub const START_PC: usize = 1;
    pub const NUM_ARGS: usize = 2;
    pub const SIZE: usize = 3;
}

pub mod process {
    pub const NEXT_LINK: usize = 0;
    pub const SUSPENDED_CONTEXT: usize = 1;
    pub const PRIORITY: usize = 2;
    pub const MY_LIST: usize = 3;
    pub const SIZE: usize = 4;
}

pub mod linked_list {
    pub const FIRST_LINK: usize = 0;
    pub const LAST_LINK: usize = 1;
    pub const SIZE: usize = 2;
}

pub mod semaphore {
    pub const EXCESS_SIGNALS: usize = 2;
    pub const SIZE: usize = 3;
}

pub mod scheduler {
    pub const PROCESS_LISTS: usize = 0;
    pub const ACTIVE_PROCESS: usize = 1;
    pub const SIZE: usize = 2;
}

pub mod point {
    pub const X: usize = 0;
    pub const Y: usize = 1;
    pub const SIZE: usize = 2;
}

pub mod form {
    pub const BITS: usize = 0;
    pub const WIDTH: usize = 1;
    pub const HEIGHT: usize = 2;
    pub const DEPTH: usize = 3;
    pub const SIZE: usize = 4;
}

pub mod character {
    pub const VALUE: usize = 0;
    pub const SIZE: usize = 1;
}
