use glim_core::value::{NativeFn, Value};

use crate::vm::VM;

/// Install the standard native functions into a VM's globals.
pub fn install(vm: &mut VM) {
    let started = std::time::Instant::now();
    vm.define_native(NativeFn::new("clock", move |_args| {
        Ok(Value::Number(started.elapsed().as_secs_f64()))
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    #[test]
    fn clock_is_monotonic() {
        let mut vm = VM::new();
        install(&mut vm);
        let mut out = Vec::new();
        let program = compile("var a = clock(); var b = clock(); print b >= a;").unwrap();
        vm.interpret(program, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "true\n");
    }
}
