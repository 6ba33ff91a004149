use std::collections::HashMap;

use object::Value;

use crate::VM;
use crate::primitives::{PrimitiveFn, PrimitiveResult, PrimitiveSuccess, expect_float};

/// Native handlers reachable from named primitives, keyed by module and
/// function name.
pub struct PluginRegistry {
    functions: HashMap<(String, String), PrimitiveFn>,
}

impl PluginRegistry {
    /// A registry with nothing installed.
    pub fn new() -> Self {
        Self { functions: HashMap::new() }
    }

    /// Install `func` as `module>>function`, replacing any previous one.
    pub fn register(&mut self, module: &str, function: &str, func: PrimitiveFn) {
        let key = (module.to_owned(), function.to_owned());
        if self.functions.insert(key, func).is_some() {
            log::debug!("replaced named primitive {module}>>{function}");
        }
    }

    pub fn lookup(&self, module: &str, function: &str) -> Option<PrimitiveFn> {
        self.functions
            .get(&(module.to_owned(), function.to_owned()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl Default for PluginRegistry {
    /// The built-in float math module.
    fn default() -> Self {
        let mut registry = Self::new();
        let float_math: [(&str, PrimitiveFn); 7] = [
            ("primitiveSin", float_sin),
            ("primitiveCos", float_cos),
            ("primitiveTan", float_tan),
            ("primitiveArcTan", float_arc_tan),
            ("primitiveLogN", float_ln),
            ("primitiveExp", float_exp),
            ("primitiveSqrt", float_sqrt),
        ];
        for (name, func) in float_math {
            registry.register("FloatMathPlugin", name, func);
        }
        registry
    }
}

fn unary(receiver: Value, f: fn(f64) -> f64) -> PrimitiveResult {
    Ok(PrimitiveSuccess::Return(Value::Float(f(expect_float(receiver)?))))
}

fn float_sin(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::sin)
}

fn float_cos(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::cos)
}

fn float_tan(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::tan)
}

fn float_arc_tan(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::atan)
}

fn float_ln(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::ln)
}

fn float_exp(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::exp)
}

fn float_sqrt(_vm: &mut VM, receiver: Value, _args: &[Value]) -> PrimitiveResult {
    unary(receiver, f64::sqrt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PrimitiveError;
    use crate::VmConfig;
    use crate::special::bootstrap;

    fn answer_seven(_vm: &mut VM, _receiver: Value, _args: &[Value]) -> PrimitiveResult {
        Ok(PrimitiveSuccess::Return(Value::from_i64(7)))
    }

    #[test]
    fn registered_functions_are_found_by_name() {
        let mut registry = PluginRegistry::new();
        assert!(registry.is_empty());
        registry.register("TestPlugin", "primitiveSeven", answer_seven);
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("TestPlugin", "primitiveEight").is_none());
        assert!(registry.lookup("OtherPlugin", "primitiveSeven").is_none());

        let mut vm = bootstrap(VmConfig::default());
        let func = registry.lookup("TestPlugin", "primitiveSeven").unwrap();
        let nil = vm.nil();
        assert_eq!(func(&mut vm, nil, &[]).unwrap(), PrimitiveSuccess::Return(Value::from_i64(7)));
    }

    #[test]
    fn float_math_is_installed_by_default() {
        let registry = PluginRegistry::default();
        let mut vm = bootstrap(VmConfig::default());
        let cos = registry.lookup("FloatMathPlugin", "primitiveCos").unwrap();
        assert_eq!(
            cos(&mut vm, Value::Float(0.0), &[]).unwrap(),
            PrimitiveSuccess::Return(Value::Float(1.0))
        );
        assert!(matches!(
            cos(&mut vm, Value::from_i64(0), &[]),
            Err(PrimitiveError::Failed)
        ));
    }
}
