use object::{SMALL_INT_MAX, SMALL_INT_MIN, Value};

use crate::primitives::arith::{ArithOp, float_op};
use crate::primitives::{PrimitiveResult, PrimitiveSuccess, expect_float, expect_small_int};
use crate::{PrimitiveError, VM};

fn float_result(f: f64) -> PrimitiveResult {
    Ok(PrimitiveSuccess::Return(Value::Float(f)))
}

fn unary(receiver: Value, f: impl FnOnce(f64) -> f64) -> PrimitiveResult {
    float_result(f(expect_float(receiver)?))
}

pub fn as_float(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    float_result(expect_small_int(receiver)? as f64)
}

pub fn float_add(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Add, receiver, args)
}

pub fn float_subtract(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Sub, receiver, args)
}

pub fn float_less_than(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Lt, receiver, args)
}

pub fn float_greater_than(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Gt, receiver, args)
}

pub fn float_less_or_equal(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Le, receiver, args)
}

pub fn float_greater_or_equal(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Ge, receiver, args)
}

pub fn float_equal(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Eq, receiver, args)
}

pub fn float_not_equal(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Ne, receiver, args)
}

pub fn float_multiply(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Mul, receiver, args)
}

pub fn float_divide(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    float_op(vm, ArithOp::Div, receiver, args)
}

/// Truncation towards zero; fails outside the SmallInteger range.
pub fn float_truncated(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    let f = expect_float(receiver)?.trunc();
    if !f.is_finite() || f < SMALL_INT_MIN as f64 || f > SMALL_INT_MAX as f64 {
        return Err(PrimitiveError::Failed);
    }
    Ok(PrimitiveSuccess::Return(Value::from_i64(f as i64)))
}

pub fn float_fraction_part(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::fract)
}

pub fn float_sqrt(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::sqrt)
}

pub fn float_sin(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::sin)
}

pub fn float_arc_tan(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::atan)
}

pub fn float_ln(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::ln)
}

pub fn float_exp(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::exp)
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
    fn mixed_operands_promote() {
        let mut vm = bootstrap(VmConfig::default());
        let sum = answer(float_add(&mut vm, Value::Float(1.5), &[Value::from_i64(2)]));
        assert_eq!(sum, Value::Float(3.5));
        let lt = answer(float_less_than(&mut vm, Value::Float(1.5), &[Value::Float(2.0)]));
        assert_eq!(lt, vm.special.true_obj);
        assert!(matches!(
            float_divide(&mut vm, Value::Float(1.0), &[Value::Float(0.0)]),
            Err(PrimitiveError::Failed)
        ));
        assert!(matches!(
            float_add(&mut vm, Value::from_i64(1), &[Value::Float(1.0)]),
            Err(PrimitiveError::Failed)
        ));
    }

    #[test]
    fn truncation_stays_in_range() {
        let mut vm = bootstrap(VmConfig::default());
        let t = answer(float_truncated(&mut vm, Value::Float(-3.7), &[]));
        assert_eq!(t, Value::from_i64(-3));
        assert!(matches!(
            float_truncated(&mut vm, Value::Float(1e12), &[]),
            Err(PrimitiveError::Failed)
        ));
        assert!(matches!(
            float_truncated(&mut vm, Value::Float(f64::NAN), &[]),
            Err(PrimitiveError::Failed)
        ));
        let f = answer(as_float(&mut vm, Value::from_i64(7), &[]));
        assert_eq!(f, Value::Float(7.0));
    }
}
