//! Structural printing of values.

use std::io::{Read, Write};

use crate::{Interpreter, Value, VmError};

/// Nesting depth past which array contents render as `...`. Arrays can
/// reference themselves through element stores, so the printer must
/// not rely on the structure being finite.
pub const MAX_PRINT_DEPTH: usize = 64;

impl<R: Read, W: Write> Interpreter<R, W> {
    /// Renders a value to the output stream: booleans as
    /// `true`/`false`, integral numbers without a fractional part,
    /// arrays as bracketed comma-space-separated lists, recursively.
    pub fn print_value(&mut self, value: Value) -> Result<(), VmError> {
        self.print_value_at_depth(value, 0)
    }

    fn print_value_at_depth(&mut self, value: Value, depth: usize) -> Result<(), VmError> {
        if depth > MAX_PRINT_DEPTH {
            self.output.write_all(b"...")?;
            return Ok(());
        }

        match value {
            Value::Boolean(true) => self.output.write_all(b"true")?,
            Value::Boolean(false) => self.output.write_all(b"false")?,
            Value::Number(num) => {
                if num.is_finite() && num.fract() == 0.0 && num.abs() <= i64::MAX as f64 {
                    write!(self.output, "{}", num as i64)?;
                } else {
                    write!(self.output, "{num}")?;
                }
            }
            Value::Function(entry) => write!(self.output, "fn@{entry}")?,
            Value::Array(handle) => {
                self.output.write_all(b"[")?;
                let size = self.heap.size(handle)?;
                for index in 0..size {
                    if index != 0 {
                        self.output.write_all(b", ")?;
                    }
                    let item = self.heap.get(handle, index)?;
                    self.print_value_at_depth(item, depth + 1)?;
                }
                self.output.write_all(b"]")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod format_tests {
    use super::*;
    use crate::{BytecodeBuilder, InterpreterCreateInfo, Op};

    fn printer_of(value: Value) -> String {
        let mut b = BytecodeBuilder::new();
        b.op(Op::Exit);
        let mut vm: Interpreter<&[u8], Vec<u8>> = Interpreter::new(
            b.into_words(),
            &b""[..],
            Vec::new(),
            InterpreterCreateInfo::default(),
        )
        .expect("interpreter construction");
        vm.print_value(value).expect("printing");
        String::from_utf8(vm.output).expect("utf-8 output")
    }

    #[test]
    fn booleans_render_as_words() {
        assert_eq!(printer_of(Value::Boolean(true)), "true");
        assert_eq!(printer_of(Value::Boolean(false)), "false");
    }

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(printer_of(Value::Number(42.0)), "42");
        assert_eq!(printer_of(Value::Number(-3.0)), "-3");
        assert_eq!(printer_of(Value::Number(0.0)), "0");
    }

    #[test]
    fn fractional_and_non_finite_numbers_render_in_display_form() {
        assert_eq!(printer_of(Value::Number(1.5)), "1.5");
        assert_eq!(printer_of(Value::Number(f64::INFINITY)), "inf");
        assert_eq!(printer_of(Value::Number(f64::NAN)), "NaN");
    }

    #[test]
    fn functions_render_with_their_entry_offset() {
        assert_eq!(printer_of(Value::Function(17)), "fn@17");
    }

    #[test]
    fn cyclic_arrays_hit_the_depth_cap_instead_of_recursing_forever() {
        let mut b = BytecodeBuilder::new();
        b.op(Op::StoreNum).reg(1).num(0);
        b.op(Op::Array).reg(2).count(1).reg(1);
        b.op(Op::StoreNum).reg(3).num(0);
        b.op(Op::SetIndex).reg(2).reg(3).reg(2);
        b.op(Op::Println).reg(2);
        b.op(Op::Exit);

        let mut vm: Interpreter<&[u8], Vec<u8>> = Interpreter::new(
            b.into_words(),
            &b""[..],
            Vec::new(),
            InterpreterCreateInfo::default(),
        )
        .expect("interpreter construction");
        vm.run().expect("program should run to exit");

        let text = String::from_utf8(vm.output).expect("utf-8 output");
        assert!(
            text.contains("..."),
            "self-referencing array must be truncated, got {text:?}"
        );
        assert_eq!(text.matches('[').count(), MAX_PRINT_DEPTH + 1);
    }
}
