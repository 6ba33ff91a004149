use bytecode::SpecialSelector;
use object::Value;

use crate::primitives::{
    PrimitiveResult, PrimitiveSuccess, arg, bool_result, expect_small_int, small_int_result,
};
use crate::{PrimitiveError, VM};

/// Arithmetic and comparison shared by the SmallInteger primitives, the
/// Float primitives and the inlined special sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    Mul,
    Div,
    Mod,
    IntDiv,
    Quo,
    BitAnd,
    BitOr,
    BitXor,
    BitShift,
}

/// The answer of an [`ArithOp`] before it is boxed into a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Numeric {
    fn into_result(self, vm: &VM) -> PrimitiveResult {
        match self {
            Numeric::Int(n) => small_int_result(n),
            Numeric::Float(f) => Ok(PrimitiveSuccess::Return(Value::Float(f))),
            Numeric::Bool(b) => bool_result(vm, b),
        }
    }
}

impl ArithOp {
    /// The operation a special-selector send performs inline, if any.
    pub fn from_special(selector: SpecialSelector) -> Option<Self> {
        use SpecialSelector as S;
        Some(match selector {
            S::Add => ArithOp::Add,
            S::Sub => ArithOp::Sub,
            S::Lt => ArithOp::Lt,
            S::Gt => ArithOp::Gt,
            S::Le => ArithOp::Le,
            S::Ge => ArithOp::Ge,
            S::Eq => ArithOp::Eq,
            S::Ne => ArithOp::Ne,
            S::Mul => ArithOp::Mul,
            S::Div => ArithOp::Div,
            S::Mod => ArithOp::Mod,
            S::BitShift => ArithOp::BitShift,
            S::IntDiv => ArithOp::IntDiv,
            S::BitAnd => ArithOp::BitAnd,
            S::BitOr => ArithOp::BitOr,
            _ => return None,
        })
    }

    /// SmallInteger semantics. `None` when the operation fails (division
    /// by zero, inexact `/`, shift overflow). Range checks of the result
    /// are left to the caller.
    pub fn integer(self, a: i64, b: i64) -> Option<Numeric> {
        use Numeric::{Bool, Int};
        Some(match self {
            ArithOp::Add => Int(a + b),
            ArithOp::Sub => Int(a - b),
            ArithOp::Mul => Int(a.checked_mul(b)?),
            ArithOp::Lt => Bool(a < b),
            ArithOp::Gt => Bool(a > b),
            ArithOp::Le => Bool(a <= b),
            ArithOp::Ge => Bool(a >= b),
            ArithOp::Eq => Bool(a == b),
            ArithOp::Ne => Bool(a != b),
            ArithOp::Div => {
                if b == 0 || a % b != 0 {
                    return None;
                }
                Int(a / b)
            }
            ArithOp::Mod => Int(floored_modulo(a, b)?),
            ArithOp::IntDiv => Int(floored_division(a, b)?),
            ArithOp::Quo => Int(a.checked_div(b)?),
            ArithOp::BitAnd => Int(a & b),
            ArithOp::BitOr => Int(a | b),
            ArithOp::BitXor => Int(a ^ b),
            ArithOp::BitShift => Int(shift(a, b)?),
        })
    }

    /// Float semantics; only arithmetic and comparisons apply.
    pub fn float(self, a: f64, b: f64) -> Option<Numeric> {
        use Numeric::{Bool, Float};
        Some(match self {
            ArithOp::Add => Float(a + b),
            ArithOp::Sub => Float(a - b),
            ArithOp::Mul => Float(a * b),
            ArithOp::Div => {
                if b == 0.0 {
                    return None;
                }
                Float(a / b)
            }
            ArithOp::Lt => Bool(a < b),
            ArithOp::Gt => Bool(a > b),
            ArithOp::Le => Bool(a <= b),
            ArithOp::Ge => Bool(a >= b),
            ArithOp::Eq => Bool(a == b),
            ArithOp::Ne => Bool(a != b),
            _ => return None,
        })
    }
}

/// `//`: quotient rounded towards negative infinity.
fn floored_division(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && (a < 0) != (b < 0) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

/// `\\`: remainder with the sign of the divisor.
fn floored_modulo(a: i64, b: i64) -> Option<i64> {
    let r = a.checked_rem(b)?;
    if r != 0 && (r < 0) != (b < 0) {
        Some(r + b)
    } else {
        Some(r)
    }
}

fn shift(a: i64, by: i64) -> Option<i64> {
    if by >= 0 {
        if by >= 63 {
            return (a == 0).then_some(0);
        }
        let shifted = a << by;
        (shifted >> by == a).then_some(shifted)
    } else {
        Some(a >> (-by).min(63))
    }
}

fn integer_op(vm: &VM, op: ArithOp, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let a = expect_small_int(receiver)?;
    let b = expect_small_int(arg(args, 0)?)?;
    op.integer(a, b)
        .ok_or(PrimitiveError::Failed)?
        .into_result(vm)
}

/// Float operation with a Float receiver and a Float or SmallInteger
/// argument.
pub(crate) fn float_op(vm: &VM, op: ArithOp, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let a = receiver.as_float().ok_or(PrimitiveError::Failed)?;
    let b = match arg(args, 0)? {
        Value::Float(f) => f,
        Value::SmallInteger(n) => n as f64,
        Value::Object(_) => return Err(PrimitiveError::Failed),
    };
    op.float(a, b).ok_or(PrimitiveError::Failed)?.into_result(vm)
}

pub fn add(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Add, receiver, args)
}

pub fn subtract(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Sub, receiver, args)
}

pub fn less_than(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Lt, receiver, args)
}

pub fn greater_than(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Gt, receiver, args)
}

pub fn less_or_equal(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Le, receiver, args)
}

pub fn greater_or_equal(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Ge, receiver, args)
}

pub fn equal(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Eq, receiver, args)
}

pub fn not_equal(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Ne, receiver, args)
}

pub fn multiply(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Mul, receiver, args)
}

pub fn divide(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Div, receiver, args)
}

pub fn modulo(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Mod, receiver, args)
}

pub fn div(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::IntDiv, receiver, args)
}

pub fn quo(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::Quo, receiver, args)
}

pub fn bit_and(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::BitAnd, receiver, args)
}

pub fn bit_or(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::BitOr, receiver, args)
}

pub fn bit_xor(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::BitXor, receiver, args)
}

pub fn bit_shift(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    integer_op(vm, ArithOp::BitShift, receiver, args)
}

/// `x @ y` for numeric coordinates.
pub fn make_point(vm: &mut VM, receiver: Value, args: &[Value]) -> PrimitiveResult {
    let y = arg(args, 0)?;
    if receiver.is_object() || y.is_object() {
        return Err(PrimitiveError::Failed);
    }
    let point = vm.new_point(receiver, y)?;
    Ok(PrimitiveSuccess::Return(Value::Object(point)))
}

#[cfg(test)]
mod tests {
    use object::layout::point;

    use super::*;
    use crate::VmConfig;
    use crate::special::bootstrap;

    #[test]
    fn floored_division_and_modulo() {
        assert_eq!(ArithOp::IntDiv.integer(-7, 2), Some(Numeric::Int(-4)));
        assert_eq!(ArithOp::Mod.integer(-7, 2), Some(Numeric::Int(1)));
        assert_eq!(ArithOp::Quo.integer(-7, 2), Some(Numeric::Int(-3)));
        assert_eq!(ArithOp::Mod.integer(7, -2), Some(Numeric::Int(-1)));
        assert_eq!(ArithOp::IntDiv.integer(7, 0), None);
        assert_eq!(ArithOp::Div.integer(7, 2), None);
        assert_eq!(ArithOp::Div.integer(8, 2), Some(Numeric::Int(4)));
    }

    #[test]
    fn shifts_fail_on_lost_bits() {
        assert_eq!(ArithOp::BitShift.integer(1, 10), Some(Numeric::Int(1024)));
        assert_eq!(ArithOp::BitShift.integer(-1024, -3), Some(Numeric::Int(-128)));
        assert_eq!(ArithOp::BitShift.integer(3, 63), None);
        assert_eq!(ArithOp::BitShift.integer(0, 100), Some(Numeric::Int(0)));
    }

    #[test]
    fn special_selectors_that_inline() {
        assert_eq!(ArithOp::from_special(SpecialSelector::Mod), Some(ArithOp::Mod));
        assert_eq!(ArithOp::from_special(SpecialSelector::MakePoint), None);
        assert_eq!(ArithOp::from_special(SpecialSelector::At), None);
        assert_eq!(ArithOp::BitAnd.float(1.0, 2.0), None);
    }

    #[test]
    fn primitives_box_results() {
        let mut vm = bootstrap(VmConfig::default());
        let max = Value::from_i64(object::SMALL_INT_MAX);
        assert!(matches!(
            add(&mut vm, max, &[Value::from_i64(1)]),
            Err(PrimitiveError::Failed)
        ));
        assert!(matches!(
            less_than(&mut vm, Value::from_i64(1), &[Value::from_i64(2)]),
            Ok(PrimitiveSuccess::Return(v)) if v == vm.special.true_obj
        ));
        assert!(matches!(
            add(&mut vm, Value::from_i64(1), &[Value::Float(2.0)]),
            Err(PrimitiveError::Failed)
        ));

        let Ok(PrimitiveSuccess::Return(p)) =
            make_point(&mut vm, Value::from_i64(3), &[Value::from_i64(4)])
        else {
            panic!("expected a point");
        };
        let p = p.as_oop().unwrap();
        assert_eq!(vm.memory.fetch(p, point::X).unwrap(), Value::from_i64(3));
        assert_eq!(vm.memory.fetch(p, point::Y).unwrap(), Value::from_i64(4));
    }
}
