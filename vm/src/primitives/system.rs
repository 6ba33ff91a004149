use object::{Value, special_index};

use crate::host::{SMALLTALK_EPOCH_OFFSET, monotonic_millis, unix_time_seconds};
use crate::primitives::{PrimitiveResult, PrimitiveSuccess, arg, expect_object, expect_small_int};
use crate::{Exit, PrimitiveError, VM};

/// Millisecond clock values handed to the image wrap at 30 bits.
const MILLISECOND_MASK: u64 = 0x3FFF_FFFF;

pub fn flush_cache(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    vm.flush_method_cache();
    Ok(PrimitiveSuccess::Return(receiver))
}

/// Write the image to the configured snapshot path. The saved process
/// resumes with `true`, the running one continues with `false`.
pub fn snapshot(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let Some(path) = vm.config.snapshot_path.clone() else {
        log::warn!("snapshot requested but no snapshot path is configured");
        return Err(PrimitiveError::Failed);
    };
    let resumed = vm.special.true_obj;
    vm.pop_then_push(args.len() + 1, resumed)?;
    let saved = vm.save_image(&path);
    let running = vm.special.false_obj;
    vm.pop_then_push(1, running)?;
    match saved {
        Ok(()) => Ok(PrimitiveSuccess::Handled),
        Err(err) => {
            log::warn!("snapshot to {} failed: {err}", path.display());
            // Put the operands back so the fallback code sees them.
            vm.pop_n(1)?;
            vm.push(receiver)?;
            for value in args {
                vm.push(*value)?;
            }
            Err(PrimitiveError::Failed)
        }
    }
}

pub fn bytes_left(vm: &mut VM, _receiver: Value, _args: &[Value]) -> PrimitiveResult {
    Ok(PrimitiveSuccess::Return(vm.bytes_left()))
}

pub fn quit(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    log::info!("image requested quit");
    vm.exit = Some(Exit::Quit);
    Ok(PrimitiveSuccess::Return(receiver))
}

/// Dispatch through the plugin registry using the `#(module function)`
/// Array in the method's first literal.
pub fn named_primitive(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let method = vm.state.new_method.ok_or(PrimitiveError::Failed)?;
    let spec = expect_object(vm.literal(method, 0)?)?;
    let nil = vm.nil();
    let names = vm.memory.object(spec)?.storage.values(nil);
    let name = |index: usize| names.get(index).and_then(|v| vm.memory.string_of(*v));
    let (Some(module), Some(function)) = (name(0), name(1)) else {
        return Err(PrimitiveError::Failed);
    };
    match vm.plugins.lookup(&module, &function) {
        Some(func) => func(vm, receiver, args),
        None => {
            log::warn!("named primitive {module}>>{function} is not available");
            Err(PrimitiveError::Failed)
        }
    }
}

pub fn special_objects_array(vm: &mut VM, _receiver: Value, _args: &[Value]) -> PrimitiveResult {
    Ok(PrimitiveSuccess::Return(Value::Object(vm.special.array)))
}

pub fn garbage_collect(vm: &mut VM, _receiver: Value, _args: &[Value]) -> PrimitiveResult {
    vm.flush_registers()?;
    let stats = vm.collect_garbage();
    log::debug!(
        "collected on request: {} live, {} freed, {} weak slots cleared",
        stats.live,
        stats.freed,
        stats.weak_cleared
    );
    Ok(PrimitiveSuccess::Return(vm.bytes_left()))
}

pub fn millisecond_clock(_vm: &mut VM, _receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let millis = monotonic_millis() & MILLISECOND_MASK;
    Ok(PrimitiveSuccess::Return(Value::from_i64(millis as i64)))
}

/// `signal: aSemaphore atMilliseconds: millis`, or cancel the timer when
/// the semaphore is nil.
pub fn signal_at_milliseconds(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let sem = arg(args, 0)?;
    let millis = expect_small_int(arg(args, 1)?)?;
    if millis < 0 {
        return Err(PrimitiveError::Failed);
    }
    if sem == vm.nil() {
        vm.next_wakeup = None;
    } else if vm.is_semaphore(sem) {
        let base = monotonic_millis() & !MILLISECOND_MASK;
        vm.next_wakeup = Some(base + millis as u64);
    } else {
        return Err(PrimitiveError::Failed);
    }
    let array = vm.special.array;
    vm.memory
        .store_indexed(array, special_index::TIMER_SEMAPHORE, sem)?;
    Ok(PrimitiveSuccess::Return(receiver))
}

/// Seconds since 1901-01-01, modulo 2^32.
pub fn seconds_clock(vm: &mut VM, _receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let seconds = (unix_time_seconds() + SMALLTALK_EPOCH_OFFSET) as u32;
    Ok(PrimitiveSuccess::Return(vm.positive_32bit_value(seconds)?))
}
