//! Test and comparison operators. All push an i32 boolean (0 or 1).
//!
//! Float comparisons follow IEEE-754: any NaN operand makes ordered
//! comparisons false and `ne` true; zeros compare equal regardless of
//! sign.

use super::{RuntimeError, Stack, Value};

fn push_bool(stack: &mut Stack, value: bool) {
    stack.push(Value::I32(if value { 1 } else { 0 }));
}

pub fn i32_eqz(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i32()?;
    push_bool(stack, c1 == 0);
    Ok(())
}

pub fn i64_eqz(stack: &mut Stack) -> Result<(), RuntimeError> {
    let c1 = stack.pop_i64()?;
    push_bool(stack, c1 == 0);
    Ok(())
}

macro_rules! int_relop {
    ($name:ident, $pop:ident, $unsigned:ty, signed $op:tt) => {
        pub fn $name(stack: &mut Stack) -> Result<(), RuntimeError> {
            let c2 = stack.$pop()?;
            let c1 = stack.$pop()?;
            push_bool(stack, c1 $op c2);
            Ok(())
        }
    };
    ($name:ident, $pop:ident, $unsigned:ty, unsigned $op:tt) => {
        pub fn $name(stack: &mut Stack) -> Result<(), RuntimeError> {
            let c2 = stack.$pop()? as $unsigned;
            let c1 = stack.$pop()? as $unsigned;
            push_bool(stack, c1 $op c2);
            Ok(())
        }
    };
}

int_relop!(i32_eq, pop_i32, u32, signed ==);
int_relop!(i32_ne, pop_i32, u32, signed !=);
int_relop!(i32_lt_s, pop_i32, u32, signed <);
int_relop!(i32_lt_u, pop_i32, u32, unsigned <);
int_relop!(i32_gt_s, pop_i32, u32, signed >);
int_relop!(i32_gt_u, pop_i32, u32, unsigned >);
int_relop!(i32_le_s, pop_i32, u32, signed <=);
int_relop!(i32_le_u, pop_i32, u32, unsigned <=);
int_relop!(i32_ge_s, pop_i32, u32, signed >=);
int_relop!(i32_ge_u, pop_i32, u32, unsigned >=);

int_relop!(i64_eq, pop_i64, u64, signed ==);
int_relop!(i64_ne, pop_i64, u64, signed !=);
int_relop!(i64_lt_s, pop_i64, u64, signed <);
int_relop!(i64_lt_u, pop_i64, u64, unsigned <);
int_relop!(i64_gt_s, pop_i64, u64, signed >);
int_relop!(i64_gt_u, pop_i64, u64, unsigned >);
int_relop!(i64_le_s, pop_i64, u64, signed <=);
int_relop!(i64_le_u, pop_i64, u64, unsigned <=);
int_relop!(i64_ge_s, pop_i64, u64, signed >=);
int_relop!(i64_ge_u, pop_i64, u64, unsigned >=);

macro_rules! float_relop {
    ($name:ident, $pop:ident, $op:tt) => {
        pub fn $name(stack: &mut Stack) -> Result<(), RuntimeError> {
            let c2 = stack.$pop()?;
            let c1 = stack.$pop()?;
            push_bool(stack, c1 $op c2);
            Ok(())
        }
    };
}

float_relop!(f32_eq, pop_f32, ==);
float_relop!(f32_ne, pop_f32, !=);
float_relop!(f32_lt, pop_f32, <);
float_relop!(f32_gt, pop_f32, >);
float_relop!(f32_le, pop_f32, <=);
float_relop!(f32_ge, pop_f32, >=);

float_relop!(f64_eq, pop_f64, ==);
float_relop!(f64_ne, pop_f64, !=);
float_relop!(f64_lt, pop_f64, <);
float_relop!(f64_gt, pop_f64, >);
float_relop!(f64_le, pop_f64, <=);
float_relop!(f64_ge, pop_f64, >=);
