//! Conversions between the value types.
//!
//! Float-to-int truncations trap on NaN and on values outside the
//! destination range; reinterprets preserve bit patterns exactly.

use super::{RuntimeError, Stack, Trap, TrapKind, Value};

pub fn i32_wrap_i64(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    stack.push(Value::I32(c1 as i32));
    Ok(())
}

pub fn i64_extend_i32_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::I64(c1 as i64));
    Ok(())
}

pub fn i64_extend_i32_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::I64(c1 as u32 as i64));
    Ok(())
}

/// Checks a truncated float against the destination's open interval,
/// trapping on NaN and range overflow.
fn trunc_checked(value: f64, mnemonic: &str, min_excl: f64, max_excl: f64) -> Result<f64, RuntimeError> {
    if value.is_nan() {
        return Err(Trap::new(TrapKind::InvalidConversionToInteger, mnemonic).into());
    }
    let truncated = value.trunc();
    if truncated <= min_excl || truncated >= max_excl {
        return Err(Trap::new(TrapKind::IntegerOverflow, mnemonic).into());
    }
    Ok(truncated)
}

pub fn i32_trunc_f32_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f32()? as f64;
    let t = trunc_checked(c1, "i32.trunc_f32_s", -2147483649.0, 2147483648.0)?;
    stack.push(Value::I32(t as i32));
    Ok(())
}

pub fn i32_trunc_f32_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f32()? as f64;
    let t = trunc_checked(c1, "i32.trunc_f32_u", -1.0, 4294967296.0)?;
    stack.push(Value::I32(t as u32 as i32));
    Ok(())
}

pub fn i32_trunc_f64_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f64()?;
    let t = trunc_checked(c1, "i32.trunc_f64_s", -2147483649.0, 2147483648.0)?;
    stack.push(Value::I32(t as i32));
    Ok(())
}

pub fn i32_trunc_f64_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f64()?;
    let t = trunc_checked(c1, "i32.trunc_f64_u", -1.0, 4294967296.0)?;
    stack.push(Value::I32(t as u32 as i32));
    Ok(())
}

pub fn i64_trunc_f32_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f32()? as f64;
    let t = trunc_checked(c1, "i64.trunc_f32_s", -9223372036854777856.0, 9223372036854775808.0)?;
    stack.push(Value::I64(t as i64));
    Ok(())
}

pub fn i64_trunc_f32_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f32()? as f64;
    let t = trunc_checked(c1, "i64.trunc_f32_u", -1.0, 18446744073709551616.0)?;
    stack.push(Value::I64(t as u64 as i64));
    Ok(())
}

pub fn i64_trunc_f64_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f64()?;
    let t = trunc_checked(c1, "i64.trunc_f64_s", -9223372036854777856.0, 9223372036854775808.0)?;
    stack.push(Value::I64(t as i64));
    Ok(())
}

pub fn i64_trunc_f64_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f64()?;
    let t = trunc_checked(c1, "i64.trunc_f64_u", -1.0, 18446744073709551616.0)?;
    stack.push(Value::I64(t as u64 as i64));
    Ok(())
}

pub fn f32_convert_i32_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::F32(c1 as f32));
    Ok(())
}

pub fn f32_convert_i32_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::F32(c1 as u32 as f32));
    Ok(())
}

pub fn f32_convert_i64_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    stack.push(Value::F32(c1 as f32));
    Ok(())
}

pub fn f32_convert_i64_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    stack.push(Value::F32(c1 as u64 as f32));
    Ok(())
}

pub fn f32_demote_f64(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f64()?;
    stack.push(Value::F32(c1 as f32));
    Ok(())
}

pub fn f64_convert_i32_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::F64(c1 as f64));
    Ok(())
}

pub fn f64_convert_i32_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::F64(c1 as u32 as f64));
    Ok(())
}

pub fn f64_convert_i64_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    stack.push(Value::F64(c1 as f64));
    Ok(())
}

pub fn f64_convert_i64_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    stack.push(Value::F64(c1 as u64 as f64));
    Ok(())
}

pub fn f64_promote_f32(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f32()?;
    stack.push(Value::F64(c1 as f64));
    Ok(())
}

pub fn i32_reinterpret_f32(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f32()?;
    stack.push(Value::I32(c1.to_bits() as i32));
    Ok(())
}

pub fn i64_reinterpret_f64(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_f64()?;
    stack.push(Value::I64(c1.to_bits() as i64));
    Ok(())
}

pub fn f32_reinterpret_i32(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::F32(f32::from_bits(c1 as u32)));
    Ok(())
}

pub fn f64_reinterpret_i64(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    stack.push(Value::F64(f64::from_bits(c1 as u64)));
    Ok(())
}
