//! Scalar semantics of the IR operations.
//!
//! These functions define what every arithmetic [`Expr`](crate::Expr)
//! means. The simulator uses them directly; the PTX printer selects
//! instructions that agree with them.

use crate::ir::{BinOp, CmpOp, UnOp};
use crate::{KirError, KirResult, Scalar, ScalarType};

fn check_same(op: &str, a: Scalar, b: Scalar) -> KirResult<ScalarType> {
    if a.ty() == b.ty() {
        Ok(a.ty())
    } else {
        Err(KirError::TypeMismatch {
            op: op.to_string(),
            lhs: a.ty(),
            rhs: b.ty(),
        })
    }
}

fn unsupported(op: &str, ty: ScalarType) -> KirError {
    KirError::UnsupportedType {
        op: op.to_string(),
        ty,
    }
}

fn nan_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

fn nan_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn float_binary(op: BinOp, ty: ScalarType, a: Scalar, b: Scalar) -> KirResult<Scalar> {
    if ty == ScalarType::F32 {
        let (x, y) = (a.as_f32_bits(), b.as_f32_bits());
        let r = match op {
            BinOp::Add => x + y,
            BinOp::Sub => x - y,
            BinOp::Mul => x * y,
            BinOp::Div => x / y,
            BinOp::Rem => x % y,
            BinOp::Min => nan_min(f64::from(x), f64::from(y)) as f32,
            BinOp::Max => nan_max(f64::from(x), f64::from(y)) as f32,
            BinOp::Pow => x.powf(y),
            BinOp::Atan2 => x.atan2(y),
            _ => return Err(unsupported(&format!("{op:?}"), ty)),
        };
        return Ok(Scalar::f32(r));
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    let r = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => x / y,
        BinOp::Rem => x % y,
        BinOp::Min => nan_min(x, y),
        BinOp::Max => nan_max(x, y),
        BinOp::Pow => x.powf(y),
        BinOp::Atan2 => x.atan2(y),
        _ => return Err(unsupported(&format!("{op:?}"), ty)),
    };
    Ok(Scalar::f64(r))
}

fn int_binary(op: BinOp, ty: ScalarType, a: Scalar, b: Scalar) -> KirResult<Scalar> {
    let signed = ty.is_signed();
    let (x, y) = (a.as_i64(), b.as_i64());
    let (ux, uy) = (a.bits(), b.bits());
    let width = ty.bit_width();
    let bits = match op {
        BinOp::Add => ux.wrapping_add(uy),
        BinOp::Sub => ux.wrapping_sub(uy),
        BinOp::Mul => ux.wrapping_mul(uy),
        BinOp::Div => match (signed, uy) {
            (_, 0) => u64::MAX,
            (true, _) => x.wrapping_div(y) as u64,
            (false, _) => ux / uy,
        },
        BinOp::Rem => match (signed, uy) {
            (_, 0) => ux,
            (true, _) => x.wrapping_rem(y) as u64,
            (false, _) => ux % uy,
        },
        BinOp::Min if signed => x.min(y) as u64,
        BinOp::Max if signed => x.max(y) as u64,
        BinOp::Min => ux.min(uy),
        BinOp::Max => ux.max(uy),
        BinOp::And => ux & uy,
        BinOp::Or => ux | uy,
        BinOp::Xor => ux ^ uy,
        BinOp::Shl => {
            if uy >= u64::from(width) {
                0
            } else {
                ux << uy
            }
        }
        BinOp::Shr => {
            let shift = uy.min(u64::from(width) - 1);
            if signed {
                (x >> shift) as u64
            } else if uy >= u64::from(width) {
                0
            } else {
                ux >> uy
            }
        }
        BinOp::Pow | BinOp::Atan2 => return Err(unsupported(&format!("{op:?}"), ty)),
    };
    Ok(Scalar::from_bits(ty, bits))
}

/// Evaluate `a op b`.
pub fn eval_binary(op: BinOp, a: Scalar, b: Scalar) -> KirResult<Scalar> {
    let ty = check_same(&format!("{op:?}"), a, b)?;
    match ty {
        ScalarType::Pred => {
            let (x, y) = (a.as_bool(), b.as_bool());
            let r = match op {
                BinOp::And | BinOp::Min => x && y,
                BinOp::Or | BinOp::Max => x || y,
                BinOp::Xor | BinOp::Add | BinOp::Sub => x ^ y,
                _ => return Err(unsupported(&format!("{op:?}"), ty)),
            };
            Ok(Scalar::pred(r))
        }
        t if t.is_float() => float_binary(op, t, a, b),
        t => int_binary(op, t, a, b),
    }
}

/// Evaluate `op a`.
pub fn eval_unary(op: UnOp, a: Scalar) -> KirResult<Scalar> {
    let ty = a.ty();
    if ty == ScalarType::Pred {
        return match op {
            UnOp::Not => Ok(Scalar::pred(!a.as_bool())),
            UnOp::Abs => Ok(a),
            _ => Err(unsupported(&format!("{op:?}"), ty)),
        };
    }
    if ty.is_float() {
        let wide = a.as_f64();
        let narrow = a.as_f32_bits();
        let single = ty == ScalarType::F32;
        let r = match op {
            UnOp::Abs => wide.abs(),
            UnOp::Neg => -wide,
            UnOp::Floor => wide.floor(),
            UnOp::Ceil => wide.ceil(),
            UnOp::Sign => {
                if wide.is_nan() {
                    wide
                } else if wide > 0.0 {
                    1.0
                } else if wide < 0.0 {
                    -1.0
                } else {
                    wide
                }
            }
            UnOp::Exp if single => return Ok(Scalar::f32(narrow.exp())),
            UnOp::Log if single => return Ok(Scalar::f32(narrow.ln())),
            UnOp::Sqrt if single => return Ok(Scalar::f32(narrow.sqrt())),
            UnOp::Rsqrt if single => return Ok(Scalar::f32(1.0 / narrow.sqrt())),
            UnOp::Tanh if single => return Ok(Scalar::f32(narrow.tanh())),
            UnOp::Sin if single => return Ok(Scalar::f32(narrow.sin())),
            UnOp::Cos if single => return Ok(Scalar::f32(narrow.cos())),
            UnOp::Exp => wide.exp(),
            UnOp::Log => wide.ln(),
            UnOp::Sqrt => wide.sqrt(),
            UnOp::Rsqrt => 1.0 / wide.sqrt(),
            UnOp::Tanh => wide.tanh(),
            UnOp::Sin => wide.sin(),
            UnOp::Cos => wide.cos(),
            UnOp::Not => return Err(unsupported("Not", ty)),
        };
        return Ok(Scalar::from_f64(ty, r));
    }
    let x = a.as_i64();
    let bits = match op {
        UnOp::Abs if ty.is_signed() => x.wrapping_abs() as u64,
        UnOp::Abs => a.bits(),
        UnOp::Neg => (x as u64).wrapping_neg(),
        UnOp::Not => !a.bits(),
        UnOp::Sign if ty.is_signed() => x.signum() as u64,
        UnOp::Sign => u64::from(a.bits() != 0),
        UnOp::Floor | UnOp::Ceil => a.bits(),
        _ => return Err(unsupported(&format!("{op:?}"), ty)),
    };
    Ok(Scalar::from_bits(ty, bits))
}

/// Evaluate `a op b` to a predicate.
pub fn eval_cmp(op: CmpOp, a: Scalar, b: Scalar) -> KirResult<Scalar> {
    let ty = check_same(&format!("{op:?}"), a, b)?;
    let ordering = if ty.is_float() {
        a.as_f64().partial_cmp(&b.as_f64())
    } else if ty.is_signed() {
        Some(a.as_i64().cmp(&b.as_i64()))
    } else {
        Some(a.bits().cmp(&b.bits()))
    };
    let result = match ordering {
        None => op == CmpOp::Ne,
        Some(ord) => match op {
            CmpOp::Eq => ord.is_eq(),
            CmpOp::Ne => ord.is_ne(),
            CmpOp::Lt => ord.is_lt(),
            CmpOp::Le => ord.is_le(),
            CmpOp::Gt => ord.is_gt(),
            CmpOp::Ge => ord.is_ge(),
        },
    };
    Ok(Scalar::pred(result))
}
