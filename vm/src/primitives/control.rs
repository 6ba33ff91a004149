use object::layout::{closure, context};
use object::{LookupResult, Oop, Value};

use crate::primitives::{PrimitiveResult, PrimitiveSuccess, arg, expect_object, expect_small_int};
use crate::{PrimitiveError, VM};

/// Bytes of the long jump the compiler places after `blockCopy:`.
const BLOCK_JUMP_LENGTH: usize = 2;

fn is_context(vm: &VM, value: Value) -> bool {
    vm.class_of_value(value).is_ok_and(|class| {
        class == vm.special.class_method_context || class == vm.special.class_block_context
    })
}

/// Contents of an Array argument.
fn array_elements(vm: &VM, value: Value) -> Result<Vec<Value>, PrimitiveError> {
    let oop = expect_object(value)?;
    let object = vm.memory.object(oop)?;
    if object.class != vm.special.class_array {
        return Err(PrimitiveError::Failed);
    }
    Ok(object.storage.values(vm.nil()))
}

/// Replace the receiver and `argc` arguments on the stack with the
/// receiver and `args`, then switch to `ctx` with the values stored from
/// slot 0.
fn enter(vm: &mut VM, ctx: Oop, argc: usize, slots: Vec<Value>) -> PrimitiveResult {
    for (i, value) in slots.into_iter().enumerate() {
        vm.memory.store_indexed(ctx, i, value)?;
    }
    vm.pop_n(argc + 1)?;
    vm.activate_context(ctx)?;
    Ok(PrimitiveSuccess::Handled)
}

// ── BlockContext ───────────────────────────────────────────────────

/// `thisContext blockCopy: argCount`: a BlockContext whose body starts
/// after the jump that skips it.
pub fn block_copy(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let argc = expect_small_int(arg(args, 0)?)?;
    if !is_context(vm, receiver) || args.len() != 1 || argc < 0 {
        return Err(PrimitiveError::Failed);
    }
    let ctx = expect_object(receiver)?;
    let home = if vm.is_block_context(ctx) {
        vm.memory.fetch(ctx, context::HOME)?
    } else {
        receiver
    };
    let home_oop = expect_object(home)?;
    let size = vm.memory.indexable_len(home_oop)?;
    let initial_pc = Value::from_i64((vm.state.pc + BLOCK_JUMP_LENGTH) as i64);

    let block = vm.memory.instantiate(vm.special.class_block_context, size)?;
    let nil = vm.nil();
    let fields = [
        (context::CALLER, nil),
        (context::PC, initial_pc),
        (context::STACKP, Value::from_i64(0)),
        (context::BLOCK_ARGC, Value::from_i64(argc)),
        (context::INITIAL_PC, initial_pc),
        (context::HOME, home),
    ];
    for (index, value) in fields {
        vm.memory.store(block, index, value)?;
    }
    Ok(PrimitiveSuccess::Return(Value::Object(block)))
}

fn start_block(vm: &mut VM, block: Oop, argc: usize, values: Vec<Value>) -> PrimitiveResult {
    let expected = vm.memory.fetch(block, context::BLOCK_ARGC)?.as_small_int();
    let initial_pc = vm.memory.fetch(block, context::INITIAL_PC)?;
    if expected != Some(values.len() as i64) || !initial_pc.is_small_int() {
        return Err(PrimitiveError::Failed);
    }
    if values.len() > vm.memory.indexable_len(block)? {
        return Err(PrimitiveError::Failed);
    }
    let caller = Value::Object(vm.active_context()?);
    vm.memory.store(block, context::CALLER, caller)?;
    vm.memory.store(block, context::PC, initial_pc)?;
    vm.memory
        .store(block, context::STACKP, Value::from_i64(values.len() as i64))?;
    enter(vm, block, argc, values)
}

/// `value`, `value:` ... on a BlockContext.
pub fn block_value(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let block = expect_object(receiver)?;
    if !vm.is_block_context(block) {
        return Err(PrimitiveError::Failed);
    }
    start_block(vm, block, args.len(), args.to_vec())
}

pub fn block_value_with_arguments(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let block = expect_object(receiver)?;
    if !vm.is_block_context(block) {
        return Err(PrimitiveError::Failed);
    }
    let values = array_elements(vm, arg(args, 0)?)?;
    start_block(vm, block, 1, values)
}

// ── BlockClosure ───────────────────────────────────────────────────

fn start_closure(vm: &mut VM, receiver: Value, argc: usize, values: Vec<Value>) -> PrimitiveResult {
    let block = expect_object(receiver)?;
    let class = vm.memory.class_of(block)?;
    if Some(class) != vm.special.class_block_closure {
        return Err(PrimitiveError::Failed);
    }
    let num_args = vm.memory.fetch(block, closure::NUM_ARGS)?.as_small_int();
    if num_args != Some(values.len() as i64) {
        return Err(PrimitiveError::Failed);
    }
    let start_pc = vm
        .memory
        .fetch(block, closure::START_PC)?
        .as_small_int()
        .ok_or(PrimitiveError::Failed)?;
    let outer = expect_object(vm.memory.fetch(block, closure::OUTER_CONTEXT)?)?;
    let method = vm
        .memory
        .fetch(outer, context::METHOD)?
        .as_oop()
        .ok_or(PrimitiveError::Failed)?;
    let outer_receiver = vm.memory.fetch(outer, context::RECEIVER)?;

    let nil = vm.nil();
    let copied = vm.memory.object(block)?.storage.values(nil);
    let mut slots = values;
    slots.extend(copied);
    let sender = Value::Object(vm.active_context()?);
    let ctx = vm.new_context(
        method,
        outer_receiver,
        sender,
        receiver,
        start_pc as usize,
        slots.len(),
    )?;
    enter(vm, ctx, argc, slots)
}

/// `value` ... `value:value:value:value:` on a BlockClosure.
pub fn closure_value(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    start_closure(vm, receiver, args.len(), args.to_vec())
}

pub fn closure_value_with_arguments(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let values = array_elements(vm, arg(args, 0)?)?;
    start_closure(vm, receiver, 1, values)
}

// ── Perform ────────────────────────────────────────────────────────

/// Rebuild the stack as receiver and `values`, then send `selector`
/// starting the lookup at `class`. Fails if the method found takes a
/// different number of arguments.
fn resend(
    vm: &mut VM,
    receiver: Value,
    selector: Value,
    class: Oop,
    argc: usize,
    values: Vec<Value>,
) -> PrimitiveResult {
    if !selector.is_object() {
        return Err(PrimitiveError::Failed);
    }
    if let LookupResult::Found { method, .. } = vm.lookup_cached(class, selector) {
        if vm.method_header(method)?.args != values.len() {
            return Err(PrimitiveError::Failed);
        }
    }
    let count = values.len();
    vm.pop_n(argc + 1)?;
    vm.push(receiver)?;
    for value in values {
        vm.push(value)?;
    }
    vm.send_to_class(selector, count, class)?;
    Ok(PrimitiveSuccess::Handled)
}

/// `perform: aSymbol` with up to three `with:` arguments.
pub fn perform(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let selector = arg(args, 0)?;
    let class = vm.class_of_value(receiver)?;
    resend(vm, receiver, selector, class, args.len(), args[1..].to_vec())
}

pub fn perform_with_arguments(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let selector = arg(args, 0)?;
    let values = array_elements(vm, arg(args, 1)?)?;
    let class = vm.class_of_value(receiver)?;
    resend(vm, receiver, selector, class, 2, values)
}

pub fn perform_with_arguments_in_superclass(
    vm: &mut VM,
    receiver: Value,
    args: &[Value],
) -> PrimitiveResult {
    let selector = arg(args, 0)?;
    let values = array_elements(vm, arg(args, 1)?)?;
    let class = expect_object(arg(args, 2)?)?;
    if !vm.is_kind_of(receiver, class) {
        return Err(PrimitiveError::Failed);
    }
    resend(vm, receiver, selector, class, 3, values)
}

/// Marks `ensure:`/`ifCurtailed:` and exception handler activations.
/// Always fails so the method body runs.
pub fn marker(_vm: &mut VM, _receiver: Value, _args: &[Value]) -> PrimitiveResult {
    Err(PrimitiveError::Failed)
}
