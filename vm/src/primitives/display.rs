use object::layout::form;
use object::{Value, special_index};

use crate::display::DamageRect;
use crate::host::{EVENT_WORDS, InputEvent};
use crate::primitives::{PrimitiveResult, PrimitiveSuccess, arg, expect_object, expect_small_int};
use crate::{PrimitiveError, VM};

/// Register the ExternalObjects index signalled when input arrives; 0
/// unregisters.
pub fn input_semaphore(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let index = expect_small_int(arg(args, 0)?)?;
    vm.input_semaphore = match usize::try_from(index) {
        Ok(0) => None,
        Ok(index) => Some(index),
        Err(_) => return Err(PrimitiveError::Failed),
    };
    Ok(PrimitiveSuccess::Return(receiver))
}

/// Fill the argument, an Array of at least eight slots, with the next
/// queued event or a none event.
pub fn next_event(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let buffer = expect_object(arg(args, 0)?)?;
    if vm.memory.class_of(buffer)? != vm.special.class_array
        || vm.memory.indexable_len(buffer)? < EVENT_WORDS
    {
        return Err(PrimitiveError::Failed);
    }
    let event = vm.host().next_event().unwrap_or_else(InputEvent::none);
    for (i, word) in event.0.into_iter().enumerate() {
        vm.memory.store_indexed(buffer, i, Value::from_i64(word))?;
    }
    Ok(PrimitiveSuccess::Return(receiver))
}

/// Cursor shapes are not shown; the request is accepted.
pub fn be_cursor(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    Ok(PrimitiveSuccess::Return(receiver))
}

/// Install the receiver, a Form, as the Display.
pub fn be_display(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    if vm.memory.object(oop)?.named.len() <= form::DEPTH {
        return Err(PrimitiveError::Failed);
    }
    let array = vm.special.array;
    vm.memory
        .store_indexed(array, special_index::DISPLAY, receiver)?;
    if let Some(view) = vm.display_buffer() {
        log::debug!("display is {}x{}x{}", view.width, view.height, view.depth);
    }
    Ok(PrimitiveSuccess::Return(receiver))
}

pub fn screen_size(vm: &mut VM, _receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let (width, height) = vm.config.screen_size;
    let point = vm.new_point(Value::from_i64(width as i64), Value::from_i64(height as i64))?;
    Ok(PrimitiveSuccess::Return(Value::Object(point)))
}

pub fn defer_updates(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let flag = arg(args, 0)?;
    if flag != vm.special.true_obj && flag != vm.special.false_obj {
        return Err(PrimitiveError::Failed);
    }
    Ok(PrimitiveSuccess::Return(receiver))
}

/// `showDisplayRect: left right: right top: top bottom: bottom`.
pub fn show_display_rect(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let left = expect_small_int(arg(args, 0)?)?;
    let right = expect_small_int(arg(args, 1)?)?;
    let top = expect_small_int(arg(args, 2)?)?;
    let bottom = expect_small_int(arg(args, 3)?)?;
    let rect = DamageRect { left, top, right, bottom };
    if !rect.is_empty() {
        vm.report_damage(rect);
    }
    Ok(PrimitiveSuccess::Return(receiver))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::VmConfig;
    use crate::special::bootstrap;

    #[test]
    fn next_event_drains_the_host_queue() {
        let mut vm = bootstrap(VmConfig::default());
        vm.host().post_event(InputEvent::key(97, 0, 0));
        let nil = vm.nil();
        let buffer = Value::Object(vm.new_array(vec![nil; EVENT_WORDS]));
        assert!(next_event(&mut vm, nil, &[buffer]).is_ok());
        let oop = buffer.as_oop().unwrap();
        assert_eq!(vm.memory.fetch_indexed(oop, 0).unwrap(), Value::from_i64(2));
        assert_eq!(vm.memory.fetch_indexed(oop, 2).unwrap(), Value::from_i64(97));

        assert!(next_event(&mut vm, nil, &[buffer]).is_ok());
        assert_eq!(vm.memory.fetch_indexed(oop, 0).unwrap(), Value::from_i64(0));

        let short = Value::Object(vm.new_array(vec![nil; 3]));
        assert!(matches!(next_event(&mut vm, nil, &[short]), Err(PrimitiveError::Failed)));
    }

    #[test]
    fn be_display_exposes_the_buffer() {
        let mut vm = bootstrap(VmConfig::default());
        let form_class = vm.global("Form").unwrap();
        let bitmap = vm.special.get(&vm.memory, special_index::CLASS_BITMAP);
        let bits = vm
            .memory
            .instantiate(bitmap.as_oop().unwrap(), 2)
            .unwrap();
        let form = vm.memory.instantiate(form_class, 0).unwrap();
        let fields = [
            (form::BITS, Value::Object(bits)),
            (form::WIDTH, Value::from_i64(32)),
            (form::HEIGHT, Value::from_i64(2)),
            (form::DEPTH, Value::from_i64(1)),
        ];
        for (index, value) in fields {
            vm.memory.store(form, index, value).unwrap();
        }

        assert!(be_display(&mut vm, Value::Object(form), &[]).is_ok());
        let view = vm.display_buffer().unwrap();
        assert_eq!((view.width, view.height, view.depth), (32, 2, 1));
        assert_eq!(view.pitch(), 1);
        assert_eq!(view.bits.len(), 2);
    }

    #[test]
    fn damage_reaches_the_listener() {
        let mut vm = bootstrap(VmConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        vm.set_damage_listener(Box::new(move |rect| sink.lock().push(rect)));
        let nil = vm.nil();
        let args = [10, 20, 5, 8].map(Value::from_i64);
        assert!(show_display_rect(&mut vm, nil, &args).is_ok());
        let empty = [10, 10, 5, 8].map(Value::from_i64);
        assert!(show_display_rect(&mut vm, nil, &empty).is_ok());
        assert_eq!(
            *seen.lock(),
            vec![DamageRect { left: 10, top: 5, right: 20, bottom: 8 }]
        );
    }

    #[test]
    fn screen_size_answers_a_point() {
        let mut vm = bootstrap(VmConfig { screen_size: (800, 600), ..VmConfig::default() });
        let nil = vm.nil();
        let PrimitiveSuccess::Return(point) = screen_size(&mut vm, nil, &[]).unwrap() else {
            panic!("no point");
        };
        let point = point.as_oop().unwrap();
        assert_eq!(vm.memory.fetch(point, object::layout::point::X).unwrap(), Value::from_i64(800));
        assert_eq!(vm.memory.fetch(point, object::layout::point::Y).unwrap(), Value::from_i64(600));
    }
}
