use object::Value;
use object::layout::process;

use crate::primitives::{PrimitiveResult, PrimitiveSuccess, expect_object};
use crate::{PrimitiveError, VM};

// Every primitive here may switch processes, so each one leaves its answer
// on the stack before the switch and reports `Handled`.

pub fn signal(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    if !vm.is_semaphore(receiver) {
        return Err(PrimitiveError::Failed);
    }
    let sem = expect_object(receiver)?;
    vm.pop_then_push(1, receiver)?;
    vm.synchronous_signal(sem)?;
    Ok(PrimitiveSuccess::Handled)
}

pub fn wait(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    if !vm.is_semaphore(receiver) {
        return Err(PrimitiveError::Failed);
    }
    let sem = expect_object(receiver)?;
    vm.pop_then_push(1, receiver)?;
    vm.wait(sem)?;
    Ok(PrimitiveSuccess::Handled)
}

/// Make a suspended process runnable. Fails for a process that is still
/// on some list or has nothing to run.
pub fn resume(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let target = expect_object(receiver)?;
    if vm.memory.class_of(target)? != vm.special.class_process {
        return Err(PrimitiveError::Failed);
    }
    let nil = vm.nil();
    let suspended = vm.memory.fetch(target, process::SUSPENDED_CONTEXT)?;
    let list = vm.memory.fetch(target, process::MY_LIST)?;
    let priority = vm.memory.fetch(target, process::PRIORITY)?;
    if suspended == nil || list != nil || !priority.is_small_int() {
        return Err(PrimitiveError::Failed);
    }
    vm.pop_then_push(1, receiver)?;
    vm.resume(target)?;
    Ok(PrimitiveSuccess::Handled)
}

/// Suspend the active process, or take a waiting one off its list and
/// answer that list.
pub fn suspend(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let target = expect_object(receiver)?;
    if vm.memory.class_of(target)? != vm.special.class_process {
        return Err(PrimitiveError::Failed);
    }
    if target == vm.active_process()? {
        let nil = vm.nil();
        vm.pop_then_push(1, nil)?;
        vm.switch_to_next()?;
        return Ok(PrimitiveSuccess::Handled);
    }
    let list = vm.suspend_waiting(target)?;
    if list == vm.nil() {
        return Err(PrimitiveError::Failed);
    }
    Ok(PrimitiveSuccess::Return(list))
}

pub fn yield_processor(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    vm.pop_then_push(1, receiver)?;
    vm.yield_active()?;
    Ok(PrimitiveSuccess::Handled)
}
