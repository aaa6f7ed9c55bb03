//! The dispatch core: fetch, decode, execute.
//!
//! One interpreter context runs one instruction stream end to end. All
//! opcodes are synchronous; the only normal termination is `Exit`, and
//! any detected error aborts the run. Dispatch is a total match over
//! [`Op`]: a word with no mapping is a decode error, never an
//! undefined jump.

use std::io::{ErrorKind, Read, Write};

use log::{debug, trace};
use thiserror::Error;

use crate::{
    DEFAULT_FRAME_CAPACITY, DEFAULT_GLOBAL_SLOTS, DEFAULT_LOCALS_CAPACITY, Frame, FrameStack,
    Heap, HeapCreateInfo, HeapError, HeapHandle, LocalsArena, Op, Value,
};

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unknown opcode {opcode} at offset {offset}")]
    UnknownOpcode { offset: usize, opcode: u32 },

    #[error("instruction stream ends mid-instruction at offset {offset}")]
    TruncatedStream { offset: usize },

    #[error("register {register} outside the {nlocals}-slot window at offset {offset}")]
    RegisterOutOfRange {
        offset: usize,
        register: usize,
        nlocals: usize,
    },

    #[error("boolean literal must be 0 or 1, found {found} at offset {offset}")]
    InvalidBoolLiteral { offset: usize, found: u32 },

    #[error("frame stack overflow at depth {depth}")]
    FrameOverflow { depth: usize },

    #[error("return with no caller frame at offset {offset}")]
    FrameUnderflow { offset: usize },

    #[error(
        "locals arena exhausted: window of {nlocals} slots at base {base} exceeds capacity {capacity}"
    )]
    LocalsOverflow {
        base: usize,
        nlocals: usize,
        capacity: usize,
    },

    #[error("expected {expected} but found {found} at offset {offset}")]
    TypeMismatch {
        offset: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error(transparent)]
    Heap(#[from] HeapError),

    #[error("i/o failure during execution")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct InterpreterCreateInfo {
    pub frame_capacity: Option<usize>,
    pub locals_capacity: Option<usize>,
    pub global_slots: Option<usize>,
    pub heap: HeapCreateInfo,
}

pub struct Interpreter<R, W> {
    pub code: Box<[u32]>,
    pub ip: usize,
    pub frames: FrameStack,
    pub locals: LocalsArena,
    pub heap: Heap,
    pub input: R,
    pub output: W,
    /// Offset of the opcode currently executing, for diagnostics.
    at: usize,
}

impl<R: Read, W: Write> Interpreter<R, W> {
    /// Builds an interpreter with the root frame already pushed; its
    /// window is the globals table.
    pub fn new(
        code: Box<[u32]>,
        input: R,
        output: W,
        info: InterpreterCreateInfo,
    ) -> Result<Self, VmError> {
        let frame_capacity = info.frame_capacity.unwrap_or(DEFAULT_FRAME_CAPACITY);
        let locals_capacity = info.locals_capacity.unwrap_or(DEFAULT_LOCALS_CAPACITY);
        let global_slots = info.global_slots.unwrap_or(DEFAULT_GLOBAL_SLOTS);

        if global_slots > locals_capacity {
            return Err(VmError::LocalsOverflow {
                base: 0,
                nlocals: global_slots,
                capacity: locals_capacity,
            });
        }

        let mut frames = FrameStack::new(frame_capacity);
        frames
            .try_push(Frame {
                return_index: 0,
                function: 0,
                out_register: 0,
                nlocals: global_slots,
            })
            .ok_or(VmError::FrameOverflow { depth: 0 })?;

        Ok(Self {
            code,
            ip: 0,
            frames,
            locals: LocalsArena::new(locals_capacity),
            heap: Heap::new(info.heap),
            input,
            output,
            at: 0,
        })
    }

    /// Executes from offset 0 until `Exit` or a fatal error.
    pub fn run(&mut self) -> Result<(), VmError> {
        debug!("executing {} instruction words", self.code.len());
        loop {
            self.at = self.ip;
            let word = self.fetch_word()?;
            let op = Op::try_from(word).map_err(|opcode| VmError::UnknownOpcode {
                offset: self.at,
                opcode,
            })?;

            match op {
                Op::Exit => {
                    debug!(
                        "exit at offset {} after {} collections",
                        self.at, self.heap.stats.collections
                    );
                    return Ok(());
                }

                Op::StoreReg => {
                    let to = self.read_reg()?;
                    let from = self.read_reg()?;
                    let value = self.locals.get(from);
                    self.locals.set(to, value);
                }
                Op::StoreBool => {
                    let to = self.read_reg()?;
                    let literal = self.read_bool()?;
                    self.locals.set(to, Value::Boolean(literal));
                }
                Op::StoreNum => {
                    let to = self.read_reg()?;
                    let literal = self.read_num()?;
                    self.locals.set(to, Value::Number(literal));
                }
                Op::StoreFun => {
                    let to = self.read_reg()?;
                    let end = self.read_loc()?;
                    let entry = self.ip;
                    self.locals.set(to, Value::Function(entry));
                    self.ip = end;
                }

                Op::Equal => self.compare_reg(|a, b| a == b)?,
                Op::EqualNum => self.compare_imm(|a, b| a == b)?,
                Op::NotEqual => self.compare_reg(|a, b| a != b)?,
                Op::NotEqualNum => self.compare_imm(|a, b| a != b)?,
                Op::Less => self.compare_reg(|a, b| a < b)?,
                Op::LessNum => self.compare_imm(|a, b| a < b)?,
                Op::Greater => self.compare_reg(|a, b| a > b)?,
                Op::GreaterNum => self.compare_imm(|a, b| a > b)?,
                Op::LessEqual => self.compare_reg(|a, b| a <= b)?,
                Op::LessEqualNum => self.compare_imm(|a, b| a <= b)?,
                Op::GreaterEqual => self.compare_reg(|a, b| a >= b)?,
                Op::GreaterEqualNum => self.compare_imm(|a, b| a >= b)?,

                Op::JumpAlways => {
                    let to = self.read_loc()?;
                    self.ip = to;
                }
                Op::JumpIfFalse => self.jump_if_bool(false)?,
                Op::JumpIfTrue => self.jump_if_bool(true)?,
                Op::JumpIfEqual => self.jump_compare_reg(|a, b| a == b)?,
                Op::JumpIfEqualNum => self.jump_compare_imm(|a, b| a == b)?,
                Op::JumpIfNotEqual => self.jump_compare_reg(|a, b| a != b)?,
                Op::JumpIfNotEqualNum => self.jump_compare_imm(|a, b| a != b)?,
                Op::JumpIfLess => self.jump_compare_reg(|a, b| a < b)?,
                Op::JumpIfLessNum => self.jump_compare_imm(|a, b| a < b)?,
                Op::JumpIfGreater => self.jump_compare_reg(|a, b| a > b)?,
                Op::JumpIfGreaterNum => self.jump_compare_imm(|a, b| a > b)?,
                Op::JumpIfLessEqual => self.jump_compare_reg(|a, b| a <= b)?,
                Op::JumpIfLessEqualNum => self.jump_compare_imm(|a, b| a <= b)?,
                Op::JumpIfGreaterEqual => self.jump_compare_reg(|a, b| a >= b)?,
                Op::JumpIfGreaterEqualNum => self.jump_compare_imm(|a, b| a >= b)?,

                Op::Inc => self.accumulate_reg(|a, b| a + b)?,
                Op::IncNum => self.accumulate_imm(|a, b| a + b)?,
                Op::Dec => self.accumulate_reg(|a, b| a - b)?,
                Op::DecNum => self.accumulate_imm(|a, b| a - b)?,

                Op::Add => self.arith_reg(|a, b| a + b)?,
                Op::AddNum => self.arith_imm(|a, b| a + b)?,
                Op::Sub => self.arith_reg(|a, b| a - b)?,
                Op::SubNum => self.arith_imm(|a, b| a - b)?,
                Op::Mul => self.arith_reg(|a, b| a * b)?,
                Op::MulNum => self.arith_imm(|a, b| a * b)?,
                Op::Div => self.arith_reg(|a, b| a / b)?,
                Op::DivNum => self.arith_imm(|a, b| a / b)?,
                Op::Mod => self.arith_reg(|a, b| a % b)?,
                Op::ModNum => self.arith_imm(|a, b| a % b)?,

                Op::Call => {
                    let out = self.read_reg()?;
                    let func = self.read_reg()?;
                    let target = self.function(self.locals.get(func))?;
                    let count = self.read_count()?;
                    let next_base = self.marshal_args(count)?;
                    self.enter_function(out, target, next_base)?;
                }
                Op::StaticCall => {
                    let out = self.read_reg()?;
                    let target = self.read_loc()?;
                    let count = self.read_count()?;
                    let next_base = self.marshal_args(count)?;
                    self.enter_function(out, target, next_base)?;
                }
                Op::Rec => {
                    let out = self.read_reg()?;
                    let target = self.frames.current().function;
                    let count = self.read_count()?;
                    let next_base = self.marshal_args(count)?;
                    self.enter_function(out, target, next_base)?;
                }
                Op::Return => {
                    let from = self.read_reg()?;
                    let value = self.locals.get(from);
                    self.frames.pop();
                    if self.frames.depth() == 0 {
                        return Err(VmError::FrameUnderflow { offset: self.at });
                    }
                    let caller = *self.frames.current();
                    self.locals.base -= caller.nlocals;
                    self.ip = caller.return_index;
                    self.locals.set(caller.out_register, value);
                    trace!("return to {} at depth {}", self.ip, self.frames.depth());
                }

                Op::Println => {
                    let from = self.read_reg()?;
                    let value = self.locals.get(from);
                    self.print_value(value)?;
                    self.output.write_all(b"\n")?;
                }
                Op::Putchar => {
                    let from = self.read_reg()?;
                    let num = self.number(self.locals.get(from))?;
                    self.output.write_all(&[num as u8])?;
                }
                Op::Getchar => {
                    let out = self.read_reg()?;
                    let mut byte = [0u8; 1];
                    let value = loop {
                        match self.input.read(&mut byte) {
                            Ok(0) => break -1.0,
                            Ok(_) => break f64::from(byte[0]),
                            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                            Err(err) => return Err(err.into()),
                        }
                    };
                    self.locals.set(out, Value::Number(value));
                }

                Op::Array => {
                    if self.heap.needs_collect() {
                        let boundary = self.locals.base + self.frames.current().nlocals;
                        self.heap.collect(self.locals.live_prefix(boundary));
                        let threshold = 2 + self.heap.live_count() * 8;
                        self.heap.set_collect_threshold(threshold);
                    }
                    let out = self.read_reg()?;
                    let count = self.read_count()?;
                    let handle = self.heap.allocate(count);
                    for index in 0..count {
                        let register = self.read_reg()?;
                        let value = self.locals.get(register);
                        self.heap.set(handle, index, value)?;
                    }
                    self.locals.set(out, Value::Array(handle));
                }
                Op::Length => {
                    let out = self.read_reg()?;
                    let array = self.read_reg()?;
                    let handle = self.array(self.locals.get(array))?;
                    let size = self.heap.size(handle)?;
                    self.locals.set(out, Value::Number(size as f64));
                }
                Op::Index => {
                    let out = self.read_reg()?;
                    let array = self.read_reg()?;
                    let index = self.read_reg()?;
                    let handle = self.array(self.locals.get(array))?;
                    let raw = self.number(self.locals.get(index))?;
                    let index = self.element_index(handle, raw)?;
                    let value = self.heap.get(handle, index)?;
                    self.locals.set(out, value);
                }
                Op::IndexNum => {
                    let out = self.read_reg()?;
                    let array = self.read_reg()?;
                    let raw = self.read_num()?;
                    let handle = self.array(self.locals.get(array))?;
                    let index = self.element_index(handle, raw)?;
                    let value = self.heap.get(handle, index)?;
                    self.locals.set(out, value);
                }
                Op::SetIndex => {
                    let array = self.read_reg()?;
                    let index = self.read_reg()?;
                    let from = self.read_reg()?;
                    let handle = self.array(self.locals.get(array))?;
                    let raw = self.number(self.locals.get(index))?;
                    let index = self.element_index(handle, raw)?;
                    let value = self.locals.get(from);
                    self.heap.set(handle, index, value)?;
                }
                Op::SetIndexNum => {
                    let array = self.read_reg()?;
                    let raw = self.read_num()?;
                    let from = self.read_reg()?;
                    let handle = self.array(self.locals.get(array))?;
                    let index = self.element_index(handle, raw)?;
                    let value = self.locals.get(from);
                    self.heap.set(handle, index, value)?;
                }

                Op::Type => {
                    let out = self.read_reg()?;
                    let from = self.read_reg()?;
                    let tag = self.locals.get(from).kind_tag();
                    self.locals.set(out, Value::Number(tag));
                }

                Op::BitOr => self.bitwise_reg(|a, b| a | b)?,
                Op::BitAnd => self.bitwise_reg(|a, b| a & b)?,
                Op::BitXor => self.bitwise_reg(|a, b| a ^ b)?,
                Op::ShiftLeft => self.bitwise_reg(|a, b| a << (b & 63))?,
                Op::ShiftRight => self.bitwise_reg(|a, b| a >> (b & 63))?,
            }
        }
    }

    // ── operand readers ────────────────────────────────────────────

    fn fetch_word(&mut self) -> Result<u32, VmError> {
        let Some(&word) = self.code.get(self.ip) else {
            return Err(VmError::TruncatedStream { offset: self.ip });
        };
        self.ip += 1;
        Ok(word)
    }

    fn read_reg(&mut self) -> Result<usize, VmError> {
        let offset = self.ip;
        let register = self.fetch_word()? as usize;
        let nlocals = self.frames.current().nlocals;
        if register >= nlocals {
            return Err(VmError::RegisterOutOfRange {
                offset,
                register,
                nlocals,
            });
        }
        Ok(register)
    }

    fn read_count(&mut self) -> Result<usize, VmError> {
        Ok(self.fetch_word()? as usize)
    }

    fn read_num(&mut self) -> Result<f64, VmError> {
        Ok(f64::from(self.fetch_word()? as i32))
    }

    fn read_bool(&mut self) -> Result<bool, VmError> {
        let offset = self.ip;
        match self.fetch_word()? {
            0 => Ok(false),
            1 => Ok(true),
            found => Err(VmError::InvalidBoolLiteral { offset, found }),
        }
    }

    fn read_loc(&mut self) -> Result<usize, VmError> {
        Ok(self.fetch_word()? as usize)
    }

    // ── value decoding ─────────────────────────────────────────────

    fn number(&self, value: Value) -> Result<f64, VmError> {
        value.as_number().ok_or(VmError::TypeMismatch {
            offset: self.at,
            expected: "number",
            found: value.kind_name(),
        })
    }

    fn boolean(&self, value: Value) -> Result<bool, VmError> {
        value.as_boolean().ok_or(VmError::TypeMismatch {
            offset: self.at,
            expected: "boolean",
            found: value.kind_name(),
        })
    }

    fn function(&self, value: Value) -> Result<usize, VmError> {
        value.as_function().ok_or(VmError::TypeMismatch {
            offset: self.at,
            expected: "function",
            found: value.kind_name(),
        })
    }

    fn array(&self, value: Value) -> Result<HeapHandle, VmError> {
        value.as_array().ok_or(VmError::TypeMismatch {
            offset: self.at,
            expected: "array",
            found: value.kind_name(),
        })
    }

    fn element_index(&self, handle: HeapHandle, raw: f64) -> Result<usize, VmError> {
        if raw.is_finite() && raw >= 0.0 {
            Ok(raw as usize)
        } else {
            Err(HeapError::IndexOutOfBounds {
                handle,
                index: raw as i64,
                size: self.heap.size(handle)?,
            }
            .into())
        }
    }

    // ── shared opcode bodies ───────────────────────────────────────
    //
    // The register and immediate form of each opcode pass the same
    // closure, so the two encodings cannot drift apart.

    fn arith_reg(&mut self, apply: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let to = self.read_reg()?;
        let lhs = self.read_reg()?;
        let rhs = self.read_reg()?;
        let a = self.number(self.locals.get(lhs))?;
        let b = self.number(self.locals.get(rhs))?;
        self.locals.set(to, Value::Number(apply(a, b)));
        Ok(())
    }

    fn arith_imm(&mut self, apply: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let to = self.read_reg()?;
        let lhs = self.read_reg()?;
        let b = self.read_num()?;
        let a = self.number(self.locals.get(lhs))?;
        self.locals.set(to, Value::Number(apply(a, b)));
        Ok(())
    }

    fn compare_reg(&mut self, apply: impl Fn(f64, f64) -> bool) -> Result<(), VmError> {
        let to = self.read_reg()?;
        let lhs = self.read_reg()?;
        let rhs = self.read_reg()?;
        let a = self.number(self.locals.get(lhs))?;
        let b = self.number(self.locals.get(rhs))?;
        self.locals.set(to, Value::Boolean(apply(a, b)));
        Ok(())
    }

    fn compare_imm(&mut self, apply: impl Fn(f64, f64) -> bool) -> Result<(), VmError> {
        let to = self.read_reg()?;
        let lhs = self.read_reg()?;
        let b = self.read_num()?;
        let a = self.number(self.locals.get(lhs))?;
        self.locals.set(to, Value::Boolean(apply(a, b)));
        Ok(())
    }

    /// `target = apply(target, rhs)`
    fn accumulate_reg(&mut self, apply: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let target = self.read_reg()?;
        let rhs = self.read_reg()?;
        let a = self.number(self.locals.get(target))?;
        let b = self.number(self.locals.get(rhs))?;
        self.locals.set(target, Value::Number(apply(a, b)));
        Ok(())
    }

    fn accumulate_imm(&mut self, apply: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let target = self.read_reg()?;
        let b = self.read_num()?;
        let a = self.number(self.locals.get(target))?;
        self.locals.set(target, Value::Number(apply(a, b)));
        Ok(())
    }

    fn jump_if_bool(&mut self, want: bool) -> Result<(), VmError> {
        let to = self.read_loc()?;
        let register = self.read_reg()?;
        if self.boolean(self.locals.get(register))? == want {
            self.ip = to;
        }
        Ok(())
    }

    fn jump_compare_reg(&mut self, apply: impl Fn(f64, f64) -> bool) -> Result<(), VmError> {
        let to = self.read_loc()?;
        let lhs = self.read_reg()?;
        let rhs = self.read_reg()?;
        let a = self.number(self.locals.get(lhs))?;
        let b = self.number(self.locals.get(rhs))?;
        if apply(a, b) {
            self.ip = to;
        }
        Ok(())
    }

    fn jump_compare_imm(&mut self, apply: impl Fn(f64, f64) -> bool) -> Result<(), VmError> {
        let to = self.read_loc()?;
        let lhs = self.read_reg()?;
        let b = self.read_num()?;
        let a = self.number(self.locals.get(lhs))?;
        if apply(a, b) {
            self.ip = to;
        }
        Ok(())
    }

    fn bitwise_reg(&mut self, apply: impl Fn(i64, i64) -> i64) -> Result<(), VmError> {
        let to = self.read_reg()?;
        let lhs = self.read_reg()?;
        let rhs = self.read_reg()?;
        let a = self.number(self.locals.get(lhs))? as i64;
        let b = self.number(self.locals.get(rhs))? as i64;
        self.locals.set(to, Value::Number(apply(a, b) as f64));
        Ok(())
    }

    // ── call protocol ──────────────────────────────────────────────

    /// Copies the counted argument registers into the window right past
    /// the caller's. Returns the callee's window base.
    fn marshal_args(&mut self, count: usize) -> Result<usize, VmError> {
        let next_base = self.locals.base + self.frames.current().nlocals;
        if next_base + count > self.locals.capacity() {
            return Err(VmError::LocalsOverflow {
                base: next_base,
                nlocals: count,
                capacity: self.locals.capacity(),
            });
        }
        for argno in 0..count {
            let register = self.read_reg()?;
            let value = self.locals.get(register);
            self.locals.slots[next_base + argno] = value;
        }
        Ok(next_base)
    }

    /// Suspends the caller and enters the callee at `target`, whose
    /// first word is its window length.
    fn enter_function(
        &mut self,
        out_register: usize,
        target: usize,
        next_base: usize,
    ) -> Result<(), VmError> {
        {
            let caller = self.frames.current_mut();
            caller.return_index = self.ip;
            caller.out_register = out_register;
        }
        self.ip = target;
        let nlocals = self.read_count()?;
        if next_base + nlocals > self.locals.capacity() {
            return Err(VmError::LocalsOverflow {
                base: next_base,
                nlocals,
                capacity: self.locals.capacity(),
            });
        }
        let frame = Frame {
            return_index: 0,
            function: target,
            out_register: 0,
            nlocals,
        };
        if self.frames.try_push(frame).is_none() {
            return Err(VmError::FrameOverflow {
                depth: self.frames.depth(),
            });
        }
        self.locals.base = next_base;
        trace!("enter {} at depth {}", target, self.frames.depth());
        Ok(())
    }
}
