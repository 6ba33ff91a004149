use object::{MethodHeader, ObjectFormat, Oop, Storage, StrategyKind, Value};

use crate::primitives::{
    PrimitiveResult, PrimitiveSuccess, arg, expect_index, expect_object, expect_small_int,
};
use crate::{PrimitiveError, VM};

/// Largest indexable size `basicNew:` and `newMethod:header:` accept.
const MAX_NEW_SIZE: i64 = 1 << 26;

/// Bytes of header and literals preceding the bytecodes of a method.
fn method_prefix(vm: &VM, oop: Oop) -> Result<Option<usize>, PrimitiveError> {
    let object = vm.memory.object(oop)?;
    Ok(match object.format {
        ObjectFormat::CompiledMethod { .. } => Some(object.named.len() * 4),
        _ => None,
    })
}

/// Element `index` (0-based) of the indexable region. Words answer
/// positive integers, bytes answer SmallIntegers.
pub(crate) fn element_at(vm: &mut VM, oop: Oop, index: usize) -> Result<Value, PrimitiveError> {
    let index = match method_prefix(vm, oop)? {
        Some(prefix) => index.checked_sub(prefix).ok_or(PrimitiveError::Failed)?,
        None => index,
    };
    let object = vm.memory.object(oop)?;
    if !object.format.is_indexable() {
        return Err(PrimitiveError::Failed);
    }
    if object.storage.kind() == StrategyKind::Words {
        let word = object.words().and_then(|w| w.get(index).copied());
        let word = word.ok_or(PrimitiveError::Failed)?;
        return Ok(vm.positive_32bit_value(word)?);
    }
    Ok(vm.memory.fetch_indexed(oop, index)?)
}

/// Store into element `index` (0-based) of the indexable region, failing
/// without mutation when the region cannot hold `value`.
pub(crate) fn element_at_put(
    vm: &mut VM,
    oop: Oop,
    index: usize,
    value: Value,
) -> Result<(), PrimitiveError> {
    let index = match method_prefix(vm, oop)? {
        Some(prefix) => index.checked_sub(prefix).ok_or(PrimitiveError::Failed)?,
        None => index,
    };
    let object = vm.memory.object(oop)?;
    if !object.format.is_indexable() {
        return Err(PrimitiveError::Failed);
    }
    let value = if object.storage.kind() == StrategyKind::Words {
        let word = vm.positive_32bit_integer_of(value).ok_or(PrimitiveError::Failed)?;
        Value::SmallInteger(word as i64)
    } else {
        value
    };
    vm.memory.store_indexed(oop, index, value)?;
    Ok(())
}

fn indexable_size(vm: &VM, oop: Oop) -> Result<usize, PrimitiveError> {
    let object = vm.memory.object(oop)?;
    if !object.format.is_indexable() {
        return Ok(0);
    }
    let prefix = method_prefix(vm, oop)?.unwrap_or(0);
    Ok(prefix + object.indexable_len())
}

/// Word `index` (0-based) of an immediate Float: the high word first,
/// as in the two-word Float objects of a snapshot.
fn float_word(f: f64, index: usize) -> Option<u32> {
    let bits = f.to_bits();
    match index {
        0 => Some((bits >> 32) as u32),
        1 => Some(bits as u32),
        _ => None,
    }
}

pub fn at(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let index = expect_index(arg(args, 0)?)?;
    if let Value::Float(f) = receiver {
        let word = float_word(f, index).ok_or(PrimitiveError::Failed)?;
        return Ok(PrimitiveSuccess::Return(vm.positive_32bit_value(word)?));
    }
    let oop = expect_object(receiver)?;
    Ok(PrimitiveSuccess::Return(element_at(vm, oop, index)?))
}

/// Floats are immediate and cannot be changed in place, so storing into
/// one fails like any other unrepresentable store.
pub fn at_put(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let index = expect_index(arg(args, 0)?)?;
    let value = arg(args, 1)?;
    element_at_put(vm, oop, index, value)?;
    Ok(PrimitiveSuccess::Return(value))
}

pub fn size(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    if receiver.is_float() {
        return Ok(PrimitiveSuccess::Return(Value::from_i64(2)));
    }
    let oop = expect_object(receiver)?;
    let size = indexable_size(vm, oop)?;
    Ok(PrimitiveSuccess::Return(Value::from_i64(size as i64)))
}

/// `at:` on byte strings, answering Characters.
pub fn string_at(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let index = expect_index(arg(args, 0)?)?;
    let byte = vm
        .memory
        .bytes_of(oop)
        .and_then(|bytes| bytes.get(index).copied())
        .ok_or(PrimitiveError::Failed)?;
    Ok(PrimitiveSuccess::Return(vm.character_for(byte)?))
}

pub fn string_at_put(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let index = expect_index(arg(args, 0)?)?;
    let character = arg(args, 1)?;
    let code = vm
        .character_value(character)
        .and_then(|c| u8::try_from(c).ok())
        .ok_or(PrimitiveError::Failed)?;
    let object = vm.memory.object_mut(oop)?;
    if !object.format.is_bytes() {
        return Err(PrimitiveError::Failed);
    }
    let slot = object
        .storage
        .as_bytes_mut()
        .and_then(|bytes| bytes.get_mut(index))
        .ok_or(PrimitiveError::Failed)?;
    *slot = code;
    Ok(PrimitiveSuccess::Return(character))
}

/// Header (index 1) and literals of a CompiledMethod.
pub fn object_at(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let index = expect_index(arg(args, 0)?)?;
    if method_prefix(vm, oop)?.is_none() {
        return Err(PrimitiveError::Failed);
    }
    Ok(PrimitiveSuccess::Return(vm.memory.fetch(oop, index)?))
}

/// Store into the header or a literal. A new header must keep the
/// literal count, since the literal frame is not resized.
pub fn object_at_put(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let index = expect_index(arg(args, 0)?)?;
    let value = arg(args, 1)?;
    if method_prefix(vm, oop)?.is_none() {
        return Err(PrimitiveError::Failed);
    }
    if index == 0 {
        let header = MethodHeader::decode(expect_small_int(value)?);
        if header.literals + 1 != vm.memory.object(oop)?.named.len() {
            return Err(PrimitiveError::Failed);
        }
    }
    vm.memory.store(oop, index, value)?;
    vm.flush_method_cache();
    Ok(PrimitiveSuccess::Return(value))
}

/// Floats are immediates, so a new Float is `0.0` rather than a heap
/// object of the Float class.
fn new_float(vm: &VM, class: Oop, size: i64) -> Option<PrimitiveResult> {
    if class != vm.special.class_float {
        return None;
    }
    Some(match size {
        0 | 2 => Ok(PrimitiveSuccess::Return(Value::Float(0.0))),
        _ => Err(PrimitiveError::Failed),
    })
}

pub fn basic_new(vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let class = expect_object(receiver)?;
    if let Some(result) = new_float(vm, class, 0) {
        return result;
    }
    let instance = vm.memory.instantiate(class, 0)?;
    Ok(PrimitiveSuccess::Return(Value::Object(instance)))
}

pub fn basic_new_size(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let class = expect_object(receiver)?;
    let size = expect_small_int(arg(args, 0)?)?;
    if !(0..=MAX_NEW_SIZE).contains(&size) {
        return Err(PrimitiveError::Failed);
    }
    if let Some(result) = new_float(vm, class, size) {
        return result;
    }
    let instance = vm.memory.instantiate(class, size as usize)?;
    Ok(PrimitiveSuccess::Return(Value::Object(instance)))
}

/// Fixed fields first, then the indexable region, 1-based.
pub fn inst_var_at(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let index = expect_index(arg(args, 0)?)?;
    let value = vm.fetch_pointer(oop, index).map_err(|_| PrimitiveError::Failed)?;
    Ok(PrimitiveSuccess::Return(value))
}

pub fn inst_var_at_put(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let index = expect_index(arg(args, 0)?)?;
    let value = arg(args, 1)?;
    vm.store_pointer(oop, index, value)
        .map_err(|_| PrimitiveError::Failed)?;
    Ok(PrimitiveSuccess::Return(value))
}

/// `CompiledMethod newMethod: byteCount header: headerWord`.
pub fn new_method(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let class = expect_object(receiver)?;
    let bytes = expect_small_int(arg(args, 0)?)?;
    let header_word = expect_small_int(arg(args, 1)?)?;
    if !(0..=MAX_NEW_SIZE).contains(&bytes) {
        return Err(PrimitiveError::Failed);
    }
    let shape = vm.memory.class_shape(class)?;
    if !matches!(shape.inst_spec, ObjectFormat::CompiledMethod { .. }) {
        return Err(PrimitiveError::Failed);
    }
    let header = MethodHeader::decode(header_word);
    let nil = vm.nil();
    let mut named = vec![nil; header.literals + 1];
    named[0] = Value::from_i64(header_word);
    let method = vm.memory.allocate_with(
        class,
        ObjectFormat::CompiledMethod { unused: 0 },
        named,
        Storage::Bytes(vec![0; bytes as usize]),
    );
    Ok(PrimitiveSuccess::Return(Value::Object(method)))
}

/// `replaceFrom: start to: stop with: replacement startingAt: repStart`
/// between regions of the same representation.
pub fn replace_from_to_with(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let dest = expect_object(receiver)?;
    let start = expect_small_int(arg(args, 0)?)?;
    let stop = expect_small_int(arg(args, 1)?)?;
    let source = expect_object(arg(args, 2)?)?;
    let source_start = expect_small_int(arg(args, 3)?)?;

    let count = stop - start + 1;
    if start < 1 || source_start < 1 || count < 0 {
        return Err(PrimitiveError::Failed);
    }
    if method_prefix(vm, dest)?.is_some() || method_prefix(vm, source)?.is_some() {
        return Err(PrimitiveError::Failed);
    }
    let dest_len = vm.memory.indexable_len(dest)? as i64;
    let source_len = vm.memory.indexable_len(source)? as i64;
    if stop > dest_len || source_start + count - 1 > source_len {
        return Err(PrimitiveError::Failed);
    }
    let (start, source_start, count) = (
        (start - 1) as usize,
        (source_start - 1) as usize,
        count as usize,
    );

    let nil = vm.nil();
    let source_storage = &vm.memory.object(source)?.storage;
    let dest_kind = vm.memory.strategy(dest)?;
    match (source_storage, dest_kind) {
        (Storage::Bytes(bytes), StrategyKind::Bytes) => {
            let chunk = bytes[source_start..source_start + count].to_vec();
            if let Some(target) = vm.memory.object_mut(dest)?.storage.as_bytes_mut() {
                target[start..start + count].copy_from_slice(&chunk);
            }
        }
        (Storage::Words(words), StrategyKind::Words) => {
            let chunk = words[source_start..source_start + count].to_vec();
            if let Some(target) = vm.memory.object_mut(dest)?.storage.as_words_mut() {
                target[start..start + count].copy_from_slice(&chunk);
            }
        }
        (source_storage, dest_kind)
            if source_storage.holds_pointers()
                && !matches!(dest_kind, StrategyKind::Bytes | StrategyKind::Words) =>
        {
            let values: Vec<Value> = (source_start..source_start + count)
                .filter_map(|i| source_storage.fetch(i, nil))
                .collect();
            for (offset, value) in values.into_iter().enumerate() {
                vm.memory.store_indexed(dest, start + offset, value)?;
            }
        }
        _ => return Err(PrimitiveError::Failed),
    }
    Ok(PrimitiveSuccess::Return(receiver))
}

pub fn at_all_put(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let oop = expect_object(receiver)?;
    let value = arg(args, 0)?;
    if method_prefix(vm, oop)?.is_some() {
        return Err(PrimitiveError::Failed);
    }
    let value = if vm.memory.strategy(oop)? == StrategyKind::Words {
        let word = vm.positive_32bit_integer_of(value).ok_or(PrimitiveError::Failed)?;
        Value::SmallInteger(word as i64)
    } else {
        value
    };
    let nil = vm.nil();
    vm.memory.object_mut(oop)?.storage.fill(value, nil)?;
    Ok(PrimitiveSuccess::Return(receiver))
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

    fn failed(result: PrimitiveResult) -> bool {
        matches!(result, Err(PrimitiveError::Failed))
    }

    #[test]
    fn pointer_regions_widen_on_store() {
        let mut vm = bootstrap(VmConfig::default());
        let class = Value::Object(vm.special.class_array);
        let array = answer(basic_new_size(&mut vm, class, &[Value::from_i64(3)]));
        let oop = array.as_oop().unwrap();
        assert_eq!(vm.memory.strategy(oop).unwrap(), StrategyKind::AllNil);

        answer(at_put(&mut vm, array, &[Value::from_i64(1), Value::from_i64(5)]));
        assert_eq!(vm.memory.strategy(oop).unwrap(), StrategyKind::SmallIntegerOrNil);
        answer(at_put(&mut vm, array, &[Value::from_i64(2), class]));
        assert_eq!(vm.memory.strategy(oop).unwrap(), StrategyKind::Pointers);

        assert_eq!(answer(at(&mut vm, array, &[Value::from_i64(1)])), Value::from_i64(5));
        assert_eq!(answer(at(&mut vm, array, &[Value::from_i64(3)])), vm.nil());
        assert_eq!(answer(size(&mut vm, array, &[])), Value::from_i64(3));
        assert!(failed(at(&mut vm, array, &[Value::from_i64(4)])));
        assert!(failed(at(&mut vm, array, &[Value::from_i64(0)])));
    }

    #[test]
    fn byte_stores_reject_without_mutation() {
        let mut vm = bootstrap(VmConfig::default());
        let bytes = Value::Object(vm.new_string("abc"));
        assert!(failed(at_put(&mut vm, bytes, &[Value::from_i64(1), Value::from_i64(256)])));
        assert!(failed(at_put(&mut vm, bytes, &[Value::from_i64(1), Value::Float(1.0)])));
        assert_eq!(vm.memory.bytes_of(bytes.as_oop().unwrap()), Some(&b"abc"[..]));

        let a = answer(string_at(&mut vm, bytes, &[Value::from_i64(1)]));
        assert_eq!(vm.character_value(a), Some(97));
        let z = vm.character_for(b'z').unwrap();
        answer(string_at_put(&mut vm, bytes, &[Value::from_i64(3), z]));
        assert_eq!(vm.memory.bytes_of(bytes.as_oop().unwrap()), Some(&b"abz"[..]));
        assert_eq!(answer(at(&mut vm, bytes, &[Value::from_i64(2)])), Value::from_i64(98));
    }

    #[test]
    fn word_elements_box_large_values() {
        let mut vm = bootstrap(VmConfig::default());
        let bitmap = vm.special.get(&vm.memory, object::special_index::CLASS_BITMAP);
        let words = answer(basic_new_size(&mut vm, bitmap, &[Value::from_i64(2)]));
        let big = vm.positive_32bit_value(0xDEAD_BEEF).unwrap();
        answer(at_put(&mut vm, words, &[Value::from_i64(2), big]));
        let read = answer(at(&mut vm, words, &[Value::from_i64(2)]));
        assert_eq!(vm.positive_32bit_integer_of(read), Some(0xDEAD_BEEF));
        assert!(failed(at_put(&mut vm, words, &[Value::from_i64(1), Value::from_i64(-1)])));
    }

    #[test]
    fn method_indices_include_the_literal_frame() {
        let mut vm = bootstrap(VmConfig::default());
        let header = MethodHeader { primitive: 0, literals: 2, large_frame: false, temps: 0, args: 0 };
        let lits = vec![Value::from_i64(7), Value::from_i64(8)];
        let method = Value::Object(vm.new_method(header, lits, vec![112, 124]));
        assert_eq!(answer(size(&mut vm, method, &[])), Value::from_i64(14));
        assert_eq!(answer(at(&mut vm, method, &[Value::from_i64(13)])), Value::from_i64(112));
        assert!(failed(at(&mut vm, method, &[Value::from_i64(12)])));
        assert_eq!(answer(object_at(&mut vm, method, &[Value::from_i64(3)])), Value::from_i64(8));
        let nil = vm.nil();
        assert!(failed(object_at_put(&mut vm, method, &[Value::from_i64(1), nil])));
    }

    #[test]
    fn new_method_allocates_literal_frame() {
        let mut vm = bootstrap(VmConfig::default());
        let class = Value::Object(vm.special.class_compiled_method);
        let header = MethodHeader { primitive: 0, literals: 3, large_frame: false, temps: 1, args: 1 };
        let word = Value::from_i64(header.encode());
        let method = answer(new_method(&mut vm, class, &[Value::from_i64(5), word]));
        let oop = method.as_oop().unwrap();
        assert_eq!(vm.memory.object(oop).unwrap().named.len(), 4);
        assert_eq!(vm.method_header(oop).unwrap(), header);
        assert_eq!(answer(size(&mut vm, method, &[])), Value::from_i64(21));
        let array = Value::Object(vm.special.class_array);
        assert!(failed(new_method(&mut vm, array, &[Value::from_i64(5), word])));
    }

    #[test]
    fn replace_copies_overlapping_ranges() {
        let mut vm = bootstrap(VmConfig::default());
        let values = (1..=5).map(Value::from_i64).collect();
        let array = Value::Object(vm.new_array(values));
        answer(replace_from_to_with(
            &mut vm,
            array,
            &[Value::from_i64(2), Value::from_i64(4), array, Value::from_i64(1)],
        ));
        let oop = array.as_oop().unwrap();
        let nil = vm.nil();
        let contents = vm.memory.object(oop).unwrap().storage.values(nil);
        assert_eq!(contents, [1, 1, 2, 3, 5].map(Value::from_i64).to_vec());

        let text = Value::Object(vm.new_string("hello"));
        assert!(failed(replace_from_to_with(
            &mut vm,
            text,
            &[Value::from_i64(1), Value::from_i64(2), array, Value::from_i64(1)],
        )));
        assert!(failed(replace_from_to_with(
            &mut vm,
            array,
            &[Value::from_i64(4), Value::from_i64(6), array, Value::from_i64(1)],
        )));
    }

    #[test]
    fn fill_and_instance_variables() {
        let mut vm = bootstrap(VmConfig::default());
        let bytes = Value::Object(vm.new_string("xyz"));
        answer(at_all_put(&mut vm, bytes, &[Value::from_i64(65)]));
        assert_eq!(vm.memory.bytes_of(bytes.as_oop().unwrap()), Some(&b"AAA"[..]));
        let nil = vm.nil();
        assert!(failed(at_all_put(&mut vm, bytes, &[nil])));

        let point = Value::Object(vm.new_point(Value::from_i64(1), Value::from_i64(2)).unwrap());
        assert_eq!(answer(inst_var_at(&mut vm, point, &[Value::from_i64(2)])), Value::from_i64(2));
        answer(inst_var_at_put(&mut vm, point, &[Value::from_i64(1), Value::from_i64(9)]));
        assert_eq!(answer(inst_var_at(&mut vm, point, &[Value::from_i64(1)])), Value::from_i64(9));
        assert!(failed(inst_var_at(&mut vm, point, &[Value::from_i64(3)])));

        let point_class = Value::Object(vm.special.class_point);
        let instance = answer(basic_new(&mut vm, point_class, &[]));
        assert!(instance.is_object());
        assert!(failed(basic_new(&mut vm, Value::from_i64(3), &[])));
    }

    #[test]
    fn floats_answer_their_words() {
        let mut vm = bootstrap(VmConfig::default());
        let value = Value::Float(1.5);
        let bits = 1.5f64.to_bits();
        let high = answer(at(&mut vm, value, &[Value::from_i64(1)]));
        let low = answer(at(&mut vm, value, &[Value::from_i64(2)]));
        assert_eq!(vm.positive_32bit_integer_of(high), Some((bits >> 32) as u32));
        assert_eq!(vm.positive_32bit_integer_of(low), Some(bits as u32));
        assert_eq!(answer(size(&mut vm, value, &[])), Value::from_i64(2));
        assert!(failed(at(&mut vm, value, &[Value::from_i64(3)])));
        assert!(failed(at_put(&mut vm, value, &[Value::from_i64(1), Value::from_i64(0)])));

        let negative = answer(at(&mut vm, Value::Float(-2.0), &[Value::from_i64(1)]));
        assert_eq!(vm.positive_32bit_integer_of(negative), Some(0xC000_0000));
    }

    #[test]
    fn new_floats_are_immediate() {
        let mut vm = bootstrap(VmConfig::default());
        let float = Value::Object(vm.special.class_float);
        assert_eq!(answer(basic_new(&mut vm, float, &[])), Value::Float(0.0));
        assert_eq!(answer(basic_new_size(&mut vm, float, &[Value::from_i64(2)])), Value::Float(0.0));
        assert!(failed(basic_new_size(&mut vm, float, &[Value::from_i64(3)])));
    }

    #[test]
    fn method_header_keeps_its_literal_count() {
        let mut vm = bootstrap(VmConfig::default());
        let header = MethodHeader { primitive: 0, literals: 1, large_frame: false, temps: 0, args: 0 };
        let method = Value::Object(vm.new_method(header, vec![Value::from_i64(7)], vec![112, 124]));

        let wider = MethodHeader { literals: 2, ..header };
        let wider = Value::from_i64(wider.encode());
        assert!(failed(object_at_put(&mut vm, method, &[Value::from_i64(1), wider])));

        let with_temps = MethodHeader { temps: 2, ..header };
        let with_temps = Value::from_i64(with_temps.encode());
        answer(object_at_put(&mut vm, method, &[Value::from_i64(1), with_temps]));
        assert_eq!(vm.method_header(method.as_oop().unwrap()).unwrap().temps, 2);
    }

    #[test]
    fn instance_variables_of_words_are_positive_integers() {
        let mut vm = bootstrap(VmConfig::default());
        let bitmap = vm.special.get(&vm.memory, object::special_index::CLASS_BITMAP);
        let words = answer(basic_new_size(&mut vm, bitmap, &[Value::from_i64(1)]));
        let big = vm.positive_32bit_value(0xFFFF_0000).unwrap();
        answer(inst_var_at_put(&mut vm, words, &[Value::from_i64(1), big]));
        let read = answer(inst_var_at(&mut vm, words, &[Value::from_i64(1)]));
        assert!(read.is_object());
        assert_eq!(vm.positive_32bit_integer_of(read), Some(0xFFFF_0000));
        assert!(failed(inst_var_at_put(&mut vm, words, &[Value::from_i64(1), Value::from_i64(-5)])));
    }
}
