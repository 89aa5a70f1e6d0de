//! Integer arithmetic: constants, add/sub/mul wrapping modulo 2^N, and the
//! trapping division family.

use super::{RuntimeError, Stack, Trap, TrapKind, Value};

pub fn i32_const(stack: &mut Stack, value: i32) -> Result<(), RuntimeError> {
    stack.push(Value::I32(value));
    Ok(())
}

pub fn i64_const(stack: &mut Stack, value: i64) -> Result<(), RuntimeError> {
    stack.push(Value::I64(value));
    Ok(())
}

pub fn f32_const(stack: &mut Stack, value: f32) -> Result<(), RuntimeError> {
    stack.push(Value::F32(value));
    Ok(())
}

pub fn f64_const(stack: &mut Stack, value: f64) -> Result<(), RuntimeError> {
    stack.push(Value::F64(value));
    Ok(())
}

pub fn i32_add(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.wrapping_add(c2)));
    Ok(())
}

pub fn i32_sub(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.wrapping_sub(c2)));
    Ok(())
}

pub fn i32_mul(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.wrapping_mul(c2)));
    Ok(())
}

/// Traps on division by zero and on `INT32_MIN / -1` (the quotient 2^31 is
/// unrepresentable).
pub fn i32_div_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    if c2 == 0 {
        return Err(Trap::new(TrapKind::IntegerDivideByZero, "i32.div_s").into());
    }
    if c1 == i32::MIN && c2 == -1 {
        return Err(Trap::new(TrapKind::IntegerOverflow, "i32.div_s INT32_MIN / -1").into());
    }
    stack.push(Value::I32(c1.wrapping_div(c2)));
    Ok(())
}

pub fn i32_div_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()? as u32;
    let c1 = stack.pop_i32()? as u32;
    if c2 == 0 {
        return Err(Trap::new(TrapKind::IntegerDivideByZero, "i32.div_u").into());
    }
    stack.push(Value::I32((c1 / c2) as i32));
    Ok(())
}

/// Traps on zero divisor; `INT32_MIN rem -1` is 0, not an overflow.
pub fn i32_rem_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    if c2 == 0 {
        return Err(Trap::new(TrapKind::IntegerDivideByZero, "i32.rem_s").into());
    }
    stack.push(Value::I32(c1.wrapping_rem(c2)));
    Ok(())
}

pub fn i32_rem_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()? as u32;
    let c1 = stack.pop_i32()? as u32;
    if c2 == 0 {
        return Err(Trap::new(TrapKind::IntegerDivideByZero, "i32.rem_u").into());
    }
    stack.push(Value::I32((c1 % c2) as i32));
    Ok(())
}

pub fn i64_add(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.wrapping_add(c2)));
    Ok(())
}

pub fn i64_sub(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.wrapping_sub(c2)));
    Ok(())
}

pub fn i64_mul(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.wrapping_mul(c2)));
    Ok(())
}

pub fn i64_div_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    if c2 == 0 {
        return Err(Trap::new(TrapKind::IntegerDivideByZero, "i64.div_s").into());
    }
    if c1 == i64::MIN && c2 == -1 {
        return Err(Trap::new(TrapKind::IntegerOverflow, "i64.div_s INT64_MIN / -1").into());
    }
    stack.push(Value::I64(c1.wrapping_div(c2)));
    Ok(())
}

pub fn i64_div_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()? as u64;
    let c1 = stack.pop_i64()? as u64;
    if c2 == 0 {
        return Err(Trap::new(TrapKind::IntegerDivideByZero, "i64.div_u").into());
    }
    stack.push(Value::I64((c1 / c2) as i64));
    Ok(())
}

pub fn i64_rem_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    if c2 == 0 {
        return Err(Trap::new(TrapKind::IntegerDivideByZero, "i64.rem_s").into());
    }
    stack.push(Value::I64(c1.wrapping_rem(c2)));
    Ok(())
}

pub fn i64_rem_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()? as u64;
    let c1 = stack.pop_i64()? as u64;
    if c2 == 0 {
        return Err(Trap::new(TrapKind::IntegerDivideByZero, "i64.rem_u").into());
    }
    stack.push(Value::I64((c1 % c2) as i64));
    Ok(())
}
