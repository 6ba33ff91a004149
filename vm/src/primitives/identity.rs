use std::collections::HashSet;

use object::{Oop, Value};

use crate::primitives::{PrimitiveResult, PrimitiveSuccess, arg, bool_result, expect_object};
use crate::{PrimitiveError, VM};

/// Two-way `become:`.
pub fn two_way_become(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let a = expect_object(receiver)?;
    let b = expect_object(arg(args, 0)?)?;
    vm.memory.exchange_identity(a, b)?;
    vm.flush_method_cache();
    Ok(PrimitiveSuccess::Return(receiver))
}

/// `elementsExchangeIdentityWith:` over two Arrays of equal size. Every
/// pair is checked before any identity changes.
pub fn elements_exchange_identity(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let nil = vm.nil();
    let elements = |vm: &VM, value: Value| -> Result<Vec<Value>, PrimitiveError> {
        let object = vm.memory.heap_object(value)?;
        if object.class != vm.special.class_array {
            return Err(PrimitiveError::Failed);
        }
        Ok(object.storage.values(nil))
    };
    let left = elements(vm, receiver)?;
    let right = elements(vm, arg(args, 0)?)?;
    if left.len() != right.len() {
        return Err(PrimitiveError::Failed);
    }

    let mut seen = HashSet::new();
    let mut pairs: Vec<(Oop, Oop)> = Vec::with_capacity(left.len());
    for (a, b) in left.into_iter().zip(right) {
        let (a, b) = (expect_object(a)?, expect_object(b)?);
        let family_a = vm.memory.object(a)?.format.family();
        let family_b = vm.memory.object(b)?.format.family();
        if a == b || family_a != family_b || !seen.insert(a) || !seen.insert(b) {
            return Err(PrimitiveError::Failed);
        }
        pairs.push((a, b));
    }
    for (a, b) in pairs {
        vm.memory.exchange_identity(a, b)?;
    }
    vm.flush_method_cache();
    Ok(PrimitiveSuccess::Return(receiver))
}

pub fn identity_hash(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let hash = vm.memory.heap_object(receiver)?.hash;
    Ok(PrimitiveSuccess::Return(Value::from_i64(hash as i64)))
}

/// First instance of the receiver class, failing when there is none.
pub fn some_instance(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let class = expect_object(receiver)?;
    vm.memory
        .next_instance_of(class, None)
        .map(|oop| PrimitiveSuccess::Return(Value::Object(oop)))
        .ok_or(PrimitiveError::Failed)
}

/// The instance of the receiver's class after the receiver, failing at
/// the end of the enumeration.
pub fn next_instance(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let class = vm.memory.class_of(oop)?;
    vm.memory
        .next_instance_of(class, Some(oop))
        .map(|next| PrimitiveSuccess::Return(Value::Object(next)))
        .ok_or(PrimitiveError::Failed)
}

pub fn identical(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    bool_result(vm, receiver == arg(args, 0)?)
}

pub fn not_identical(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    bool_result(vm, receiver != arg(args, 0)?)
}

pub fn class(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let class = vm.class_of_value(receiver)?;
    Ok(PrimitiveSuccess::Return(Value::Object(class)))
}

/// Adopt the class of the argument, keeping the receiver's contents.
pub fn change_class_to(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let model = expect_object(arg(args, 0)?)?;
    let class = vm.memory.class_of(model)?;
    vm.memory.change_class(oop, class)?;
    vm.flush_method_cache();
    Ok(PrimitiveSuccess::Return(receiver))
}

pub fn shallow_copy(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    match receiver {
        Value::Object(oop) => {
            let copy = vm.memory.shallow_copy(oop)?;
            Ok(PrimitiveSuccess::Return(Value::Object(copy)))
        }
        immediate => Ok(PrimitiveSuccess::Return(immediate)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmConfig;
    use crate::special::bootstrap;

    fn answer(result: PrimitiveResult) -> Value {
        match result {
            Ok(PrimitiveSuccess::Return(value)) => value,
            other => panic!("expected an answer, got {other:?}"),
        }
    }

    #[test]
    fn become_swaps_references() {
        let mut vm = bootstrap(VmConfig::default());
        let a = vm.new_array(vec![Value::from_i64(1)]);
        let b = vm.new_array(vec![Value::from_i64(2), Value::from_i64(3)]);
        let holder = vm.new_array(vec![Value::Object(a)]);
        answer(two_way_become(&mut vm, Value::Object(a), &[Value::Object(b)]));
        let held = vm.memory.fetch_indexed(holder, 0).unwrap().as_oop().unwrap();
        assert_eq!(vm.memory.indexable_len(held).unwrap(), 2);
        assert_eq!(vm.memory.indexable_len(b).unwrap(), 1);

        let text = Value::Object(vm.new_string("abc"));
        assert!(matches!(
            two_way_become(&mut vm, Value::Object(a), &[text]),
            Err(PrimitiveError::Failed)
        ));
    }

    #[test]
    fn exchange_validates_every_pair_first() {
        let mut vm = bootstrap(VmConfig::default());
        let x = vm.new_array(Vec::new());
        let y = vm.new_array(vec![Value::from_i64(9)]);
        let s = vm.new_string("s");
        let left = Value::Object(vm.new_array(vec![Value::Object(x), Value::Object(x)]));
        let right = Value::Object(vm.new_array(vec![Value::Object(y), Value::Object(s)]));
        assert!(matches!(
            elements_exchange_identity(&mut vm, left, &[right]),
            Err(PrimitiveError::Failed)
        ));
        // Nothing was exchanged.
        assert_eq!(vm.memory.indexable_len(x).unwrap(), 0);

        let left = Value::Object(vm.new_array(vec![Value::Object(x)]));
        let right = Value::Object(vm.new_array(vec![Value::Object(y)]));
        answer(elements_exchange_identity(&mut vm, left, &[right]));
        assert_eq!(vm.memory.indexable_len(x).unwrap(), 1);
    }

    #[test]
    fn instance_enumeration_ends_in_failure() {
        let mut vm = bootstrap(VmConfig::default());
        let class = vm.define_class("Lonely", None, 1);
        assert!(matches!(
            some_instance(&mut vm, Value::Object(class), &[]),
            Err(PrimitiveError::Failed)
        ));
        let first = vm.memory.instantiate(class, 0).unwrap();
        let second = vm.memory.instantiate(class, 0).unwrap();
        let found = answer(some_instance(&mut vm, Value::Object(class), &[]));
        assert_eq!(found, Value::Object(first));
        let next = answer(next_instance(&mut vm, found, &[]));
        assert_eq!(next, Value::Object(second));
        assert!(matches!(next_instance(&mut vm, next, &[]), Err(PrimitiveError::Failed)));
    }

    #[test]
    fn change_class_requires_a_compatible_shape() {
        let mut vm = bootstrap(VmConfig::default());
        let one = vm.define_class("OneField", None, 1);
        let other = vm.define_class("OtherField", None, 1);
        let two = vm.define_class("TwoFields", None, 2);
        let subject = Value::Object(vm.memory.instantiate(one, 0).unwrap());
        let model = Value::Object(vm.memory.instantiate(other, 0).unwrap());
        let wide = Value::Object(vm.memory.instantiate(two, 0).unwrap());

        answer(change_class_to(&mut vm, subject, &[model]));
        assert_eq!(vm.class_of_value(subject).unwrap(), other);
        assert!(matches!(
            change_class_to(&mut vm, subject, &[wide]),
            Err(PrimitiveError::Failed)
        ));
    }

    #[test]
    fn copies_and_identity() {
        let mut vm = bootstrap(VmConfig::default());
        let original = Value::Object(vm.new_array(vec![Value::from_i64(4)]));
        let copy = answer(shallow_copy(&mut vm, original, &[]));
        assert_ne!(copy, original);
        assert_eq!(
            vm.memory.fetch_indexed(copy.as_oop().unwrap(), 0).unwrap(),
            Value::from_i64(4)
        );
        assert_eq!(answer(shallow_copy(&mut vm, Value::from_i64(3), &[])), Value::from_i64(3));

        let t = vm.special.true_obj;
        assert_eq!(answer(identical(&mut vm, original, &[original])), t);
        assert_eq!(answer(not_identical(&mut vm, original, &[copy])), t);
        assert_eq!(
            answer(identical(&mut vm, Value::Float(0.5), &[Value::Float(0.5)])),
            t
        );
        let class = answer(class(&mut vm, Value::Float(0.5), &[]));
        assert_eq!(class, Value::Object(vm.special.class_float));
        assert!(identity_hash(&mut vm, original, &[]).is_ok());
        assert!(matches!(
            identity_hash(&mut vm, Value::from_i64(1), &[]),
            Err(PrimitiveError::Failed)
        ));
    }
}
