//! Bit operations: logic, shifts (count taken modulo the bit width),
//! rotates, and bit counting.

use super::{RuntimeError, Stack, Value};

pub fn i32_and(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1 & c2));
    Ok(())
}

pub fn i32_or(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1 | c2));
    Ok(())
}

pub fn i32_xor(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1 ^ c2));
    Ok(())
}

pub fn i32_shl(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.wrapping_shl(c2 as u32)));
    Ok(())
}

pub fn i32_shr_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.wrapping_shr(c2 as u32)));
    Ok(())
}

pub fn i32_shr_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()? as u32;
    stack.push(Value::I32(c1.wrapping_shr(c2 as u32) as i32));
    Ok(())
}

pub fn i32_rotl(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.rotate_left(c2 as u32 % 32)));
    Ok(())
}

pub fn i32_rotr(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i32()?;
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.rotate_right(c2 as u32 % 32)));
    Ok(())
}

pub fn i32_clz(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.leading_zeros() as i32));
    Ok(())
}

pub fn i32_ctz(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.trailing_zeros() as i32));
    Ok(())
}

pub fn i32_popcnt(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    stack.push(Value::I32(c1.count_ones() as i32));
    Ok(())
}

pub fn i64_and(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1 & c2));
    Ok(())
}

pub fn i64_or(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1 | c2));
    Ok(())
}

pub fn i64_xor(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1 ^ c2));
    Ok(())
}

pub fn i64_shl(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.wrapping_shl(c2 as u32)));
    Ok(())
}

pub fn i64_shr_s(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.wrapping_shr(c2 as u32)));
    Ok(())
}

pub fn i64_shr_u(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()? as u64;
    stack.push(Value::I64(c1.wrapping_shr(c2 as u32) as i64));
    Ok(())
}

pub fn i64_rotl(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.rotate_left((c2 % 64) as u32)));
    Ok(())
}

pub fn i64_rotr(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c2 = stack.pop_i64()?;
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.rotate_right((c2 % 64) as u32)));
    Ok(())
}

pub fn i64_clz(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.leading_zeros() as i64));
    Ok(())
}

pub fn i64_ctz(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.trailing_zeros() as i64));
    Ok(())
}

pub fn i64_popcnt(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    stack.push(Value::I64(c1.count_ones() as i64));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binop(f: fn(&mut Stack) -> Result<(), RuntimeError>, a: i32, b: i32) -> i32 {
        let mut stack = Stack::new();
        stack.push(Value::I32(a));
        stack.push(Value::I32(b));
        f(&mut stack).unwrap();
        stack.pop_i32().unwrap()
    }

    fn unop(f: fn(&mut Stack) -> Result<(), RuntimeError>, a: i32) -> i32 {
        let mut stack = Stack::new();
        stack.push(Value::I32(a));
        f(&mut stack).unwrap();
        stack.pop_i32().unwrap()
    }

    #[test]
    fn logic() {
        assert_eq!(binop(i32_and, 0b1100, 0b1010), 0b1000);
        assert_eq!(binop(i32_or, 0b1100, 0b1010), 0b1110);
        assert_eq!(binop(i32_xor, 0b1100, 0b1010), 0b0110);
    }

    #[test]
    fn shift_counts_take_modulo() {
        assert_eq!(binop(i32_shl, 1, 1), 2);
        assert_eq!(binop(i32_shl, 1, 32), 1);
        assert_eq!(binop(i32_shl, 1, 33), 2);
        assert_eq!(binop(i32_shr_s, i32::MIN, 31), -1);
        assert_eq!(binop(i32_shr_u, i32::MIN, 31), 1);
        assert_eq!(binop(i32_shr_u, -1, 0), -1);
    }

    #[test]
    fn rotates() {
        assert_eq!(binop(i32_rotl, 0x8000_0000u32 as i32, 1), 1);
        assert_eq!(binop(i32_rotr, 1, 1), 0x8000_0000u32 as i32);
        assert_eq!(binop(i32_rotl, 0x1234_5678, 32), 0x1234_5678);
    }

    #[test]
    fn bit_counts() {
        assert_eq!(unop(i32_clz, 0), 32);
        assert_eq!(unop(i32_clz, 1), 31);
        assert_eq!(unop(i32_clz, -1), 0);
        assert_eq!(unop(i32_ctz, 0), 32);
        assert_eq!(unop(i32_ctz, 0x8000_0000u32 as i32), 31);
        assert_eq!(unop(i32_popcnt, -1), 32);
        assert_eq!(unop(i32_popcnt, 0b1011), 3);
    }

    #[test]
    fn i64_widths() {
        let mut stack = Stack::new();
        stack.push(Value::I64(0));
        i64_clz(&mut stack).unwrap();
        assert_eq!(stack.pop_i64().unwrap(), 64);

        stack.push(Value::I64(1));
        stack.push(Value::I64(64));
        i64_shl(&mut stack).unwrap();
        assert_eq!(stack.pop_i64().unwrap(), 1);
    }
}
