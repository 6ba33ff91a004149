use object::{Oop, Value};

use crate::{PrimitiveError, VM};

pub mod arith;
pub mod control;
pub mod display;
pub mod float;
pub mod identity;
pub mod plugin;
pub mod process;
pub mod storage;
pub mod system;

pub use plugin::PluginRegistry;

/// What a successful primitive did with the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveSuccess {
    /// Pop the receiver and arguments, push this value.
    Return(Value),
    /// The primitive arranged the stack and active context itself.
    Handled,
}

pub type PrimitiveResult = Result<PrimitiveSuccess, PrimitiveError>;

pub type PrimitiveFn = fn(&mut VM, Value, &[Value]) -> PrimitiveResult;

#[derive(Clone, Copy)]
pub struct PrimitiveDesc {
    pub index: u16,
    pub name: &'static str,
    /// Argument count, `None` when the primitive serves several arities.
    pub arity: Option<u8>,
    pub func: PrimitiveFn,
}

impl PrimitiveDesc {
    pub const fn new(index: u16, name: &'static str, arity: u8, func: PrimitiveFn) -> Self {
        Self { index, name, arity: Some(arity), func }
    }

    pub const fn variadic(index: u16, name: &'static str, func: PrimitiveFn) -> Self {
        Self { index, name, arity: None, func }
    }
}

impl std::fmt::Debug for PrimitiveDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveDesc")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

pub fn default_primitives() -> Vec<PrimitiveDesc> {
    vec![
        PrimitiveDesc::new(1, "add", 1, arith::add),
        PrimitiveDesc::new(2, "subtract", 1, arith::subtract),
        PrimitiveDesc::new(3, "less_than", 1, arith::less_than),
        PrimitiveDesc::new(4, "greater_than", 1, arith::greater_than),
        PrimitiveDesc::new(5, "less_or_equal", 1, arith::less_or_equal),
        PrimitiveDesc::new(6, "greater_or_equal", 1, arith::greater_or_equal),
        PrimitiveDesc::new(7, "equal", 1, arith::equal),
        PrimitiveDesc::new(8, "not_equal", 1, arith::not_equal),
        PrimitiveDesc::new(9, "multiply", 1, arith::multiply),
        PrimitiveDesc::new(10, "divide", 1, arith::divide),
        PrimitiveDesc::new(11, "modulo", 1, arith::modulo),
        PrimitiveDesc::new(12, "div", 1, arith::div),
        PrimitiveDesc::new(13, "quo", 1, arith::quo),
        PrimitiveDesc::new(14, "bit_and", 1, arith::bit_and),
        PrimitiveDesc::new(15, "bit_or", 1, arith::bit_or),
        PrimitiveDesc::new(16, "bit_xor", 1, arith::bit_xor),
        PrimitiveDesc::new(17, "bit_shift", 1, arith::bit_shift),
        PrimitiveDesc::new(18, "make_point", 1, arith::make_point),
        PrimitiveDesc::new(40, "as_float", 0, float::as_float),
        PrimitiveDesc::new(41, "float_add", 1, float::float_add),
        PrimitiveDesc::new(42, "float_subtract", 1, float::float_subtract),
        PrimitiveDesc::new(43, "float_less_than", 1, float::float_less_than),
        PrimitiveDesc::new(44, "float_greater_than", 1, float::float_greater_than),
        PrimitiveDesc::new(45, "float_less_or_equal", 1, float::float_less_or_equal),
        PrimitiveDesc::new(46, "float_greater_or_equal", 1, float::float_greater_or_equal),
        PrimitiveDesc::new(47, "float_equal", 1, float::float_equal),
        PrimitiveDesc::new(48, "float_not_equal", 1, float::float_not_equal),
        PrimitiveDesc::new(49, "float_multiply", 1, float::float_multiply),
        PrimitiveDesc::new(50, "float_divide", 1, float::float_divide),
        PrimitiveDesc::new(51, "float_truncated", 0, float::float_truncated),
        PrimitiveDesc::new(52, "float_fraction_part", 0, float::float_fraction_part),
        PrimitiveDesc::new(55, "float_sqrt", 0, float::float_sqrt),
        PrimitiveDesc::new(56, "float_sin", 0, float::float_sin),
        PrimitiveDesc::new(57, "float_arc_tan", 0, float::float_arc_tan),
        PrimitiveDesc::new(58, "float_ln", 0, float::float_ln),
        PrimitiveDesc::new(59, "float_exp", 0, float::float_exp),
        PrimitiveDesc::new(60, "at", 1, storage::at),
        PrimitiveDesc::new(61, "at_put", 2, storage::at_put),
        PrimitiveDesc::new(62, "size", 0, storage::size),
        PrimitiveDesc::new(63, "string_at", 1, storage::string_at),
        PrimitiveDesc::new(64, "string_at_put", 2, storage::string_at_put),
        PrimitiveDesc::new(68, "object_at", 1, storage::object_at),
        PrimitiveDesc::new(69, "object_at_put", 2, storage::object_at_put),
        PrimitiveDesc::new(70, "basic_new", 0, storage::basic_new),
        PrimitiveDesc::new(71, "basic_new_size", 1, storage::basic_new_size),
        PrimitiveDesc::new(72, "become", 1, identity::two_way_become),
        PrimitiveDesc::new(73, "inst_var_at", 1, storage::inst_var_at),
        PrimitiveDesc::new(74, "inst_var_at_put", 2, storage::inst_var_at_put),
        PrimitiveDesc::new(75, "identity_hash", 0, identity::identity_hash),
        PrimitiveDesc::new(77, "some_instance", 0, identity::some_instance),
        PrimitiveDesc::new(78, "next_instance", 0, identity::next_instance),
        PrimitiveDesc::new(79, "new_method", 2, storage::new_method),
        PrimitiveDesc::variadic(80, "block_copy", control::block_copy),
        PrimitiveDesc::variadic(81, "block_value", control::block_value),
        PrimitiveDesc::new(82, "block_value_with_arguments", 1, control::block_value_with_arguments),
        PrimitiveDesc::variadic(83, "perform", control::perform),
        PrimitiveDesc::new(84, "perform_with_arguments", 2, control::perform_with_arguments),
        PrimitiveDesc::new(85, "signal", 0, process::signal),
        PrimitiveDesc::new(86, "wait", 0, process::wait),
        PrimitiveDesc::new(87, "resume", 0, process::resume),
        PrimitiveDesc::new(88, "suspend", 0, process::suspend),
        PrimitiveDesc::new(89, "flush_cache", 0, system::flush_cache),
        PrimitiveDesc::new(93, "input_semaphore", 1, display::input_semaphore),
        PrimitiveDesc::new(94, "next_event", 1, display::next_event),
        PrimitiveDesc::variadic(97, "snapshot", system::snapshot),
        PrimitiveDesc::new(
            100,
            "perform_in_superclass",
            3,
            control::perform_with_arguments_in_superclass,
        ),
        PrimitiveDesc::variadic(101, "be_cursor", display::be_cursor),
        PrimitiveDesc::new(102, "be_display", 0, display::be_display),
        PrimitiveDesc::new(105, "replace_from_to_with", 4, storage::replace_from_to_with),
        PrimitiveDesc::new(106, "screen_size", 0, display::screen_size),
        PrimitiveDesc::new(110, "identical", 1, identity::identical),
        PrimitiveDesc::new(111, "class", 0, identity::class),
        PrimitiveDesc::new(112, "bytes_left", 0, system::bytes_left),
        PrimitiveDesc::new(113, "quit", 0, system::quit),
        PrimitiveDesc::new(115, "change_class_to", 1, identity::change_class_to),
        PrimitiveDesc::new(116, "flush_cache_by_method", 0, system::flush_cache),
        PrimitiveDesc::variadic(117, "named_primitive", system::named_primitive),
        PrimitiveDesc::new(119, "flush_cache_by_selector", 0, system::flush_cache),
        PrimitiveDesc::new(126, "defer_updates", 1, display::defer_updates),
        PrimitiveDesc::new(127, "show_display_rect", 4, display::show_display_rect),
        PrimitiveDesc::new(128, "exchange_identity", 1, identity::elements_exchange_identity),
        PrimitiveDesc::new(129, "special_objects_array", 0, system::special_objects_array),
        PrimitiveDesc::new(130, "full_gc", 0, system::garbage_collect),
        PrimitiveDesc::new(131, "incremental_gc", 0, system::garbage_collect),
        PrimitiveDesc::new(135, "millisecond_clock", 0, system::millisecond_clock),
        PrimitiveDesc::new(136, "signal_at_milliseconds", 2, system::signal_at_milliseconds),
        PrimitiveDesc::new(137, "seconds_clock", 0, system::seconds_clock),
        PrimitiveDesc::new(145, "at_all_put", 1, storage::at_all_put),
        PrimitiveDesc::new(148, "shallow_copy", 0, identity::shallow_copy),
        PrimitiveDesc::new(167, "yield", 0, process::yield_processor),
        PrimitiveDesc::new(169, "not_identical", 1, identity::not_identical),
        PrimitiveDesc::variadic(198, "unwind_marker", control::marker),
        PrimitiveDesc::variadic(199, "handler_marker", control::marker),
        PrimitiveDesc::variadic(201, "closure_value", control::closure_value),
        PrimitiveDesc::variadic(202, "closure_value_1", control::closure_value),
        PrimitiveDesc::variadic(203, "closure_value_2", control::closure_value),
        PrimitiveDesc::variadic(204, "closure_value_3", control::closure_value),
        PrimitiveDesc::variadic(205, "closure_value_4", control::closure_value),
        PrimitiveDesc::new(206, "closure_value_with_arguments", 1, control::closure_value_with_arguments),
    ]
}

// ── Operand helpers ────────────────────────────────────────────────

pub(crate) fn arg(args: &[Value], index: usize) -> Result<Value, PrimitiveError> {
    args.get(index).copied().ok_or(PrimitiveError::Failed)
}

pub(crate) fn expect_small_int(value: Value) -> Result<i64, PrimitiveError> {
    value.as_small_int().ok_or(PrimitiveError::Failed)
}

pub(crate) fn expect_float(value: Value) -> Result<f64, PrimitiveError> {
    value.as_float().ok_or(PrimitiveError::Failed)
}

pub(crate) fn expect_object(value: Value) -> Result<Oop, PrimitiveError> {
    value.as_oop().ok_or(PrimitiveError::Failed)
}

/// A 1-based Smalltalk index as a 0-based offset.
pub(crate) fn expect_index(value: Value) -> Result<usize, PrimitiveError> {
    let index = expect_small_int(value)?;
    if index < 1 {
        return Err(PrimitiveError::Failed);
    }
    Ok(index as usize - 1)
}

pub(crate) fn small_int_result(n: i64) -> PrimitiveResult {
    Value::small_int(n)
        .map(PrimitiveSuccess::Return)
        .ok_or(PrimitiveError::Failed)
}

pub(crate) fn bool_result(vm: &VM, b: bool) -> PrimitiveResult {
    Ok(PrimitiveSuccess::Return(vm.special.bool_value(b)))
}
