//! The interpreter core: a tree-walking executor over structured bodies.
//!
//! Control flow (blocks, branches, calls) is driven here; every plain
//! operator dispatches through the [`OpInterpreter`] seam, whose default
//! implementation is one large match over opcodes delegating to
//! [`crate::runtime::ops`]. An alternative backend (e.g. a compiler) can
//! implement the same trait.

use super::control::Label;
use super::instance::ModuleInstance;
use super::ops;
use super::stack::Stack;
use super::structure::{BlockNode, StructuredBody};
use super::{RuntimeError, SharedGlobal, SharedMemory, Trap, TrapKind, Value};
use crate::parser::instruction::Instruction;
use crate::parser::module::{FunctionType, ValueType};

/// Everything a plain operator may touch.
pub struct OpContext<'a> {
    pub stack: &'a mut Stack,
    pub locals: &'a mut Vec<Value>,
    /// Memory 0, when the instance has one.
    pub memory: Option<&'a SharedMemory>,
    pub globals: &'a [SharedGlobal],
}

/// Pluggable execution of plain (non-control) operators.
pub trait OpInterpreter {
    fn interpret(&self, instruction: &Instruction, ctx: &mut OpContext<'_>) -> Result<(), RuntimeError>;
}

/// Why a block's instruction sequence stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockEnd {
    /// Ran to the end of the sequence.
    Normal,
    /// A branch is unwinding; 0 targets the current construct.
    Branch(u32),
    /// `return` is unwinding to the function boundary.
    Return,
}

/// One executing function activation.
struct Frame<'i, 'm> {
    instance: &'i ModuleInstance<'m>,
    stack: Stack,
    locals: Vec<Value>,
    /// Control stack of entered constructs, innermost last.
    labels: Vec<Label>,
}

/// Runs a translated function body to completion, returning its results.
pub(crate) fn execute_function(
    instance: &ModuleInstance<'_>,
    body: &StructuredBody,
    locals: Vec<Value>,
    return_types: &[ValueType],
) -> Result<Vec<Value>, RuntimeError> {
    let mut frame = Frame {
        instance,
        stack: Stack::new(),
        locals,
        labels: Vec::new(),
    };

    // The function boundary is itself a branch target: any escape
    // (fallthrough, return, or a branch past the outermost block) delivers
    // the result values.
    frame.run(&body.body)?;

    let results = frame.stack.pop_n(return_types.len())?;
    for (value, expected) in results.iter().zip(return_types) {
        if value.typ() != *expected {
            return Err(RuntimeError::TypeMismatch {
                expected: expected.to_string(),
                actual: value.typ().to_string(),
            });
        }
    }
    Ok(results)
}

impl<'i, 'm> Frame<'i, 'm> {
    fn run(&mut self, nodes: &[BlockNode]) -> Result<BlockEnd, RuntimeError> {
        for node in nodes {
            match node {
                BlockNode::Plain(instruction) => {
                    if let Some(end) = self.execute_plain(instruction)? {
                        return Ok(end);
                    }
                }
                BlockNode::Block { block_type, body } => {
                    let label = Label::block(block_type.arity(), self.stack.depth());
                    self.labels.push(label);
                    let end = self.run(body)?;
                    self.labels.pop();
                    match end {
                        BlockEnd::Normal => {}
                        BlockEnd::Branch(0) => self.unwind_to(&label)?,
                        BlockEnd::Branch(depth) => return Ok(BlockEnd::Branch(depth - 1)),
                        BlockEnd::Return => return Ok(BlockEnd::Return),
                    }
                }
                BlockNode::Loop { body, .. } => {
                    let label = Label::loop_start(self.stack.depth());
                    loop {
                        self.labels.push(label);
                        let end = self.run(body)?;
                        self.labels.pop();
                        match end {
                            BlockEnd::Normal => break,
                            BlockEnd::Branch(0) => {
                                // Branch to a loop re-enters it from the
                                // top with the entry stack height.
                                self.stack.truncate(label.stack_height);
                                continue;
                            }
                            BlockEnd::Branch(depth) => return Ok(BlockEnd::Branch(depth - 1)),
                            BlockEnd::Return => return Ok(BlockEnd::Return),
                        }
                    }
                }
                BlockNode::If {
                    block_type,
                    then_body,
                    else_body,
                } => {
                    let condition = self.stack.pop_i32()?;
                    let label = Label::block(block_type.arity(), self.stack.depth());
                    self.labels.push(label);
                    let end = self.run(if condition != 0 { then_body } else { else_body })?;
                    self.labels.pop();
                    match end {
                        BlockEnd::Normal => {}
                        BlockEnd::Branch(0) => self.unwind_to(&label)?,
                        BlockEnd::Branch(depth) => return Ok(BlockEnd::Branch(depth - 1)),
                        BlockEnd::Return => return Ok(BlockEnd::Return),
                    }
                }
            }
        }
        Ok(BlockEnd::Normal)
    }

    /// A branch arrived at its target: truncate the value stack to the
    /// label's height, keeping the delivered values.
    fn unwind_to(&mut self, label: &Label) -> Result<(), RuntimeError> {
        let delivered = self.stack.pop_n(label.arity)?;
        self.stack.truncate(label.stack_height);
        self.stack.push_all(delivered);
        Ok(())
    }

    /// Executes one plain instruction; `Some` means control is unwinding.
    fn execute_plain(&mut self, instruction: &Instruction) -> Result<Option<BlockEnd>, RuntimeError> {
        match instruction {
            Instruction::Unreachable => Err(Trap::new(TrapKind::Unreachable, "").into()),
            Instruction::Nop => Ok(None),
            Instruction::Br { label_idx } => Ok(Some(BlockEnd::Branch(*label_idx))),
            Instruction::BrIf { label_idx } => {
                let condition = self.stack.pop_i32()?;
                Ok(if condition != 0 {
                    Some(BlockEnd::Branch(*label_idx))
                } else {
                    None
                })
            }
            Instruction::BrTable { labels, default } => {
                let index = self.stack.pop_i32()? as u32;
                // An index at or past the table length takes the default.
                let depth = labels.get(index as usize).copied().unwrap_or(*default);
                Ok(Some(BlockEnd::Branch(depth)))
            }
            Instruction::Return => Ok(Some(BlockEnd::Return)),
            Instruction::Call { func_idx } => {
                self.call(*func_idx)?;
                Ok(None)
            }
            Instruction::CallIndirect { type_idx } => {
                self.call_indirect(*type_idx)?;
                Ok(None)
            }
            Instruction::Block { .. }
            | Instruction::Loop { .. }
            | Instruction::If { .. }
            | Instruction::Else
            | Instruction::End => Err(RuntimeError::MalformedBody(
                "structured control instruction escaped translation".to_string(),
            )),
            plain => {
                let memory = self.instance.memory();
                let mut ctx = OpContext {
                    stack: &mut self.stack,
                    locals: &mut self.locals,
                    memory: memory.as_ref(),
                    globals: self.instance.globals(),
                };
                self.instance.interpreter().interpret(plain, &mut ctx)?;
                Ok(None)
            }
        }
    }

    fn pop_arguments(&mut self, func_type: &FunctionType) -> Result<Vec<Value>, RuntimeError> {
        let mut args = Vec::with_capacity(func_type.parameters.len());
        for param in func_type.parameters.iter().rev() {
            args.push(self.stack.pop_typed(*param)?);
        }
        args.reverse();
        Ok(args)
    }

    fn call(&mut self, func_idx: u32) -> Result<(), RuntimeError> {
        let func_type = self
            .instance
            .function_type(func_idx)
            .ok_or(RuntimeError::FunctionIndexOutOfBounds(func_idx))?
            .clone();
        let args = self.pop_arguments(&func_type)?;
        let results = self.instance.invoke_index(func_idx, args)?;
        self.stack.push_all(results);
        Ok(())
    }

    /// Runtime-type-checked call through the table: traps on an
    /// out-of-bounds index, a null slot, or a signature mismatch against
    /// the nominal type.
    fn call_indirect(&mut self, type_idx: u32) -> Result<(), RuntimeError> {
        let expected = self
            .instance
            .module()
            .types
            .get(type_idx)
            .ok_or_else(|| RuntimeError::MalformedBody(format!("call_indirect type {type_idx} out of range")))?
            .clone();

        let index = self.stack.pop_i32()? as u32;
        let table = self.instance.table().ok_or(RuntimeError::NoTable)?;
        let slot = table.borrow().get(index)?;
        let func_idx = slot.ok_or_else(|| Trap::new(TrapKind::UninitializedElement, format!("table slot {index}")))?;

        let actual = self
            .instance
            .function_type(func_idx)
            .ok_or(RuntimeError::FunctionIndexOutOfBounds(func_idx))?;
        if *actual != expected {
            return Err(Trap::new(
                TrapKind::IndirectCallTypeMismatch,
                format!("expected {expected}, slot {index} has {actual}"),
            )
            .into());
        }

        let args = self.pop_arguments(&expected)?;
        let results = self.instance.invoke_index(func_idx, args)?;
        self.stack.push_all(results);
        Ok(())
    }
}

/// The default interpreter: one match over every plain operator.
#[derive(Debug, Default)]
pub struct DefaultInterpreter;

impl OpInterpreter for DefaultInterpreter {
    fn interpret(&self, instruction: &Instruction, ctx: &mut OpContext<'_>) -> Result<(), RuntimeError> {
        use Instruction::*;

        let stack = &mut *ctx.stack;
        let memory = |mem: &Option<&SharedMemory>| -> Result<SharedMemory, RuntimeError> {
            mem.map(Clone::clone).ok_or(RuntimeError::NoMemory)
        };

        match instruction {
            // Parametric
            Drop => {
                stack.pop()?;
            }
            Select => {
                let condition = stack.pop_i32()?;
                let on_false = stack.pop()?;
                let on_true = stack.pop()?;
                stack.push(if condition != 0 { on_true } else { on_false });
            }

            // Variable access
            LocalGet { local_idx } => {
                let value = ctx
                    .locals
                    .get(*local_idx as usize)
                    .copied()
                    .ok_or(RuntimeError::LocalIndexOutOfBounds(*local_idx))?;
                stack.push(value);
            }
            LocalSet { local_idx } => {
                let value = stack.pop()?;
                let slot = ctx
                    .locals
                    .get_mut(*local_idx as usize)
                    .ok_or(RuntimeError::LocalIndexOutOfBounds(*local_idx))?;
                *slot = value;
            }
            LocalTee { local_idx } => {
                let value = *stack.peek().ok_or(RuntimeError::StackUnderflow)?;
                let slot = ctx
                    .locals
                    .get_mut(*local_idx as usize)
                    .ok_or(RuntimeError::LocalIndexOutOfBounds(*local_idx))?;
                *slot = value;
            }
            GlobalGet { global_idx } => {
                let global = ctx
                    .globals
                    .get(*global_idx as usize)
                    .ok_or(RuntimeError::GlobalIndexOutOfBounds(*global_idx))?;
                let value = global.borrow().value;
                stack.push(value);
            }
            GlobalSet { global_idx } => {
                let value = stack.pop()?;
                let global = ctx
                    .globals
                    .get(*global_idx as usize)
                    .ok_or(RuntimeError::GlobalIndexOutOfBounds(*global_idx))?;
                let mut global = global.borrow_mut();
                if !global.mutable {
                    return Err(RuntimeError::ImmutableGlobal(*global_idx));
                }
                global.value = value;
            }

            // Constants
            I32Const { value } => ops::numeric::i32_const(stack, *value)?,
            I64Const { value } => ops::numeric::i64_const(stack, *value)?,
            F32Const { value } => ops::numeric::f32_const(stack, *value)?,
            F64Const { value } => ops::numeric::f64_const(stack, *value)?,

            // Memory
            I32Load { memarg } => ops::memory::i32_load(stack, &memory(&ctx.memory)?, memarg)?,
            I64Load { memarg } => ops::memory::i64_load(stack, &memory(&ctx.memory)?, memarg)?,
            F32Load { memarg } => ops::memory::f32_load(stack, &memory(&ctx.memory)?, memarg)?,
            F64Load { memarg } => ops::memory::f64_load(stack, &memory(&ctx.memory)?, memarg)?,
            I32Load8S { memarg } => ops::memory::i32_load8_s(stack, &memory(&ctx.memory)?, memarg)?,
            I32Load8U { memarg } => ops::memory::i32_load8_u(stack, &memory(&ctx.memory)?, memarg)?,
            I32Load16S { memarg } => ops::memory::i32_load16_s(stack, &memory(&ctx.memory)?, memarg)?,
            I32Load16U { memarg } => ops::memory::i32_load16_u(stack, &memory(&ctx.memory)?, memarg)?,
            I64Load8S { memarg } => ops::memory::i64_load8_s(stack, &memory(&ctx.memory)?, memarg)?,
            I64Load8U { memarg } => ops::memory::i64_load8_u(stack, &memory(&ctx.memory)?, memarg)?,
            I64Load16S { memarg } => ops::memory::i64_load16_s(stack, &memory(&ctx.memory)?, memarg)?,
            I64Load16U { memarg } => ops::memory::i64_load16_u(stack, &memory(&ctx.memory)?, memarg)?,
            I64Load32S { memarg } => ops::memory::i64_load32_s(stack, &memory(&ctx.memory)?, memarg)?,
            I64Load32U { memarg } => ops::memory::i64_load32_u(stack, &memory(&ctx.memory)?, memarg)?,
            I32Store { memarg } => ops::memory::i32_store(stack, &memory(&ctx.memory)?, memarg)?,
            I64Store { memarg } => ops::memory::i64_store(stack, &memory(&ctx.memory)?, memarg)?,
            F32Store { memarg } => ops::memory::f32_store(stack, &memory(&ctx.memory)?, memarg)?,
            F64Store { memarg } => ops::memory::f64_store(stack, &memory(&ctx.memory)?, memarg)?,
            I32Store8 { memarg } => ops::memory::i32_store8(stack, &memory(&ctx.memory)?, memarg)?,
            I32Store16 { memarg } => ops::memory::i32_store16(stack, &memory(&ctx.memory)?, memarg)?,
            I64Store8 { memarg } => ops::memory::i64_store8(stack, &memory(&ctx.memory)?, memarg)?,
            I64Store16 { memarg } => ops::memory::i64_store16(stack, &memory(&ctx.memory)?, memarg)?,
            I64Store32 { memarg } => ops::memory::i64_store32(stack, &memory(&ctx.memory)?, memarg)?,
            MemorySize => ops::memory::memory_size(stack, &memory(&ctx.memory)?)?,
            MemoryGrow => ops::memory::memory_grow(stack, &memory(&ctx.memory)?)?,

            // i32 comparison
            I32Eqz => ops::comparison::i32_eqz(stack)?,
            I32Eq => ops::comparison::i32_eq(stack)?,
            I32Ne => ops::comparison::i32_ne(stack)?,
            I32LtS => ops::comparison::i32_lt_s(stack)?,
            I32LtU => ops::comparison::i32_lt_u(stack)?,
            I32GtS => ops::comparison::i32_gt_s(stack)?,
            I32GtU => ops::comparison::i32_gt_u(stack)?,
            I32LeS => ops::comparison::i32_le_s(stack)?,
            I32LeU => ops::comparison::i32_le_u(stack)?,
            I32GeS => ops::comparison::i32_ge_s(stack)?,
            I32GeU => ops::comparison::i32_ge_u(stack)?,

            // i64 comparison
            I64Eqz => ops::comparison::i64_eqz(stack)?,
            I64Eq => ops::comparison::i64_eq(stack)?,
            I64Ne => ops::comparison::i64_ne(stack)?,
            I64LtS => ops::comparison::i64_lt_s(stack)?,
            I64LtU => ops::comparison::i64_lt_u(stack)?,
            I64GtS => ops::comparison::i64_gt_s(stack)?,
            I64GtU => ops::comparison::i64_gt_u(stack)?,
            I64LeS => ops::comparison::i64_le_s(stack)?,
            I64LeU => ops::comparison::i64_le_u(stack)?,
            I64GeS => ops::comparison::i64_ge_s(stack)?,
            I64GeU => ops::comparison::i64_ge_u(stack)?,

            // f32 comparison
            F32Eq => ops::comparison::f32_eq(stack)?,
            F32Ne => ops::comparison::f32_ne(stack)?,
            F32Lt => ops::comparison::f32_lt(stack)?,
            F32Gt => ops::comparison::f32_gt(stack)?,
            F32Le => ops::comparison::f32_le(stack)?,
            F32Ge => ops::comparison::f32_ge(stack)?,

            // f64 comparison
            F64Eq => ops::comparison::f64_eq(stack)?,
            F64Ne => ops::comparison::f64_ne(stack)?,
            F64Lt => ops::comparison::f64_lt(stack)?,
            F64Gt => ops::comparison::f64_gt(stack)?,
            F64Le => ops::comparison::f64_le(stack)?,
            F64Ge => ops::comparison::f64_ge(stack)?,

            // i32 arithmetic
            I32Clz => ops::bitwise::i32_clz(stack)?,
            I32Ctz => ops::bitwise::i32_ctz(stack)?,
            I32Popcnt => ops::bitwise::i32_popcnt(stack)?,
            I32Add => ops::numeric::i32_add(stack)?,
            I32Sub => ops::numeric::i32_sub(stack)?,
            I32Mul => ops::numeric::i32_mul(stack)?,
            I32DivS => ops::numeric::i32_div_s(stack)?,
            I32DivU => ops::numeric::i32_div_u(stack)?,
            I32RemS => ops::numeric::i32_rem_s(stack)?,
            I32RemU => ops::numeric::i32_rem_u(stack)?,
            I32And => ops::bitwise::i32_and(stack)?,
            I32Or => ops::bitwise::i32_or(stack)?,
            I32Xor => ops::bitwise::i32_xor(stack)?,
            I32Shl => ops::bitwise::i32_shl(stack)?,
            I32ShrS => ops::bitwise::i32_shr_s(stack)?,
            I32ShrU => ops::bitwise::i32_shr_u(stack)?,
            I32Rotl => ops::bitwise::i32_rotl(stack)?,
            I32Rotr => ops::bitwise::i32_rotr(stack)?,

            // i64 arithmetic
            I64Clz => ops::bitwise::i64_clz(stack)?,
            I64Ctz => ops::bitwise::i64_ctz(stack)?,
            I64Popcnt => ops::bitwise::i64_popcnt(stack)?,
            I64Add => ops::numeric::i64_add(stack)?,
            I64Sub => ops::numeric::i64_sub(stack)?,
            I64Mul => ops::numeric::i64_mul(stack)?,
            I64DivS => ops::numeric::i64_div_s(stack)?,
            I64DivU => ops::numeric::i64_div_u(stack)?,
            I64RemS => ops::numeric::i64_rem_s(stack)?,
            I64RemU => ops::numeric::i64_rem_u(stack)?,
            I64And => ops::bitwise::i64_and(stack)?,
            I64Or => ops::bitwise::i64_or(stack)?,
            I64Xor => ops::bitwise::i64_xor(stack)?,
            I64Shl => ops::bitwise::i64_shl(stack)?,
            I64ShrS => ops::bitwise::i64_shr_s(stack)?,
            I64ShrU => ops::bitwise::i64_shr_u(stack)?,
            I64Rotl => ops::bitwise::i64_rotl(stack)?,
            I64Rotr => ops::bitwise::i64_rotr(stack)?,

            // f32 arithmetic
            F32Abs => ops::float::f32_abs(stack)?,
            F32Neg => ops::float::f32_neg(stack)?,
            F32Ceil => ops::float::f32_ceil(stack)?,
            F32Floor => ops::float::f32_floor(stack)?,
            F32Trunc => ops::float::f32_trunc(stack)?,
            F32Nearest => ops::float::f32_nearest(stack)?,
            F32Sqrt => ops::float::f32_sqrt(stack)?,
            F32Add => ops::float::f32_add(stack)?,
            F32Sub => ops::float::f32_sub(stack)?,
            F32Mul => ops::float::f32_mul(stack)?,
            F32Div => ops::float::f32_div(stack)?,
            F32Min => ops::float::f32_min(stack)?,
            F32Max => ops::float::f32_max(stack)?,
            F32Copysign => ops::float::f32_copysign(stack)?,

            // f64 arithmetic
            F64Abs => ops::float::f64_abs(stack)?,
            F64Neg => ops::float::f64_neg(stack)?,
            F64Ceil => ops::float::f64_ceil(stack)?,
            F64Floor => ops::float::f64_floor(stack)?,
            F64Trunc => ops::float::f64_trunc(stack)?,
            F64Nearest => ops::float::f64_nearest(stack)?,
            F64Sqrt => ops::float::f64_sqrt(stack)?,
            F64Add => ops::float::f64_add(stack)?,
            F64Sub => ops::float::f64_sub(stack)?,
            F64Mul => ops::float::f64_mul(stack)?,
            F64Div => ops::float::f64_div(stack)?,
            F64Min => ops::float::f64_min(stack)?,
            F64Max => ops::float::f64_max(stack)?,
            F64Copysign => ops::float::f64_copysign(stack)?,

            // Conversions
            I32WrapI64 => ops::conversion::i32_wrap_i64(stack)?,
            I32TruncF32S => ops::conversion::i32_trunc_f32_s(stack)?,
            I32TruncF32U => ops::conversion::i32_trunc_f32_u(stack)?,
            I32TruncF64S => ops::conversion::i32_trunc_f64_s(stack)?,
            I32TruncF64U => ops::conversion::i32_trunc_f64_u(stack)?,
            I64ExtendI32S => ops::conversion::i64_extend_i32_s(stack)?,
            I64ExtendI32U => ops::conversion::i64_extend_i32_u(stack)?,
            I64TruncF32S => ops::conversion::i64_trunc_f32_s(stack)?,
            I64TruncF32U => ops::conversion::i64_trunc_f32_u(stack)?,
            I64TruncF64S => ops::conversion::i64_trunc_f64_s(stack)?,
            I64TruncF64U => ops::conversion::i64_trunc_f64_u(stack)?,
            F32ConvertI32S => ops::conversion::f32_convert_i32_s(stack)?,
            F32ConvertI32U => ops::conversion::f32_convert_i32_u(stack)?,
            F32ConvertI64S => ops::conversion::f32_convert_i64_s(stack)?,
            F32ConvertI64U => ops::conversion::f32_convert_i64_u(stack)?,
            F32DemoteF64 => ops::conversion::f32_demote_f64(stack)?,
            F64ConvertI32S => ops::conversion::f64_convert_i32_s(stack)?,
            F64ConvertI32U => ops::conversion::f64_convert_i32_u(stack)?,
            F64ConvertI64S => ops::conversion::f64_convert_i64_s(stack)?,
            F64ConvertI64U => ops::conversion::f64_convert_i64_u(stack)?,
            F64PromoteF32 => ops::conversion::f64_promote_f32(stack)?,
            I32ReinterpretF32 => ops::conversion::i32_reinterpret_f32(stack)?,
            I64ReinterpretF64 => ops::conversion::i64_reinterpret_f64(stack)?,
            F32ReinterpretI32 => ops::conversion::f32_reinterpret_i32(stack)?,
            F64ReinterpretI64 => ops::conversion::f64_reinterpret_i64(stack)?,

            // Control instructions are the executor's responsibility.
            other => {
                return Err(RuntimeError::MalformedBody(format!(
                    "control instruction {} reached the operator interpreter",
                    other.mnemonic()
                )))
            }
        }
        Ok(())
    }
}
