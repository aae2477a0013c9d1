use std::cmp::Ordering;
use std::ops::{Add, Div, Mul, Neg, Rem, Sub};

use anyhow::{Result, anyhow, bail};

use super::{Val, ValKind};

/// Both operands as floats when at least one is a Float and the other is numeric.
#[inline]
fn promote(a: &Val, b: &Val) -> Option<(f64, f64)> {
    let as_f = |v: &Val| match v.kind {
        ValKind::Int(i) => Some(i as f64),
        ValKind::Float(f) => Some(f),
        _ => None,
    };
    if matches!(a.kind, ValKind::Float(_)) || matches!(b.kind, ValKind::Float(_)) {
        Some((as_f(a)?, as_f(b)?))
    } else {
        None
    }
}

impl Add for &Val {
    type Output = Result<Val>;

    #[inline]
    fn add(self, other: Self) -> Self::Output {
        match (&self.kind, &other.kind) {
            (ValKind::Int(a), ValKind::Int(b)) => Ok(Val::int(a.wrapping_add(*b))),
            (ValKind::Str(a), ValKind::Str(b)) => {
                let mut out = String::with_capacity(a.len() + b.len());
                out.push_str(a);
                out.push_str(b);
                Ok(Val::str(out))
            }
            _ => match promote(self, other) {
                Some((a, b)) => Ok(Val::float(a + b)),
                None => bail!("cannot add {} and {}", self.type_name(), other.type_name()),
            },
        }
    }
}

impl Sub for &Val {
    type Output = Result<Val>;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        match (&self.kind, &other.kind) {
            (ValKind::Int(a), ValKind::Int(b)) => Ok(Val::int(a.wrapping_sub(*b))),
            _ => match promote(self, other) {
                Some((a, b)) => Ok(Val::float(a - b)),
                None => bail!("cannot subtract {} from {}", other.type_name(), self.type_name()),
            },
        }
    }
}

impl Mul for &Val {
    type Output = Result<Val>;

    #[inline]
    fn mul(self, other: Self) -> Self::Output {
        match (&self.kind, &other.kind) {
            (ValKind::Int(a), ValKind::Int(b)) => Ok(Val::int(a.wrapping_mul(*b))),
            _ => match promote(self, other) {
                Some((a, b)) => Ok(Val::float(a * b)),
                None => bail!("cannot multiply {} and {}", self.type_name(), other.type_name()),
            },
        }
    }
}

impl Div for &Val {
    type Output = Result<Val>;

    #[inline]
    fn div(self, other: Self) -> Self::Output {
        match (&self.kind, &other.kind) {
            (ValKind::Int(_), ValKind::Int(0)) => bail!("division by zero"),
            (ValKind::Int(a), ValKind::Int(b)) => Ok(Val::int(a.wrapping_div(*b))),
            // Float division by zero yields inf/nan.
            _ => match promote(self, other) {
                Some((a, b)) => Ok(Val::float(a / b)),
                None => bail!("cannot divide {} by {}", self.type_name(), other.type_name()),
            },
        }
    }
}

impl Rem for &Val {
    type Output = Result<Val>;

    #[inline]
    fn rem(self, other: Self) -> Self::Output {
        match (&self.kind, &other.kind) {
            (ValKind::Int(_), ValKind::Int(0)) => bail!("modulo by zero"),
            (ValKind::Int(a), ValKind::Int(b)) => Ok(Val::int(a.wrapping_rem(*b))),
            _ => match promote(self, other) {
                Some((_, b)) if b == 0.0 => bail!("modulo by zero"),
                Some((a, b)) => Ok(Val::float(a % b)),
                None => bail!("cannot modulo {} by {}", self.type_name(), other.type_name()),
            },
        }
    }
}

impl Neg for &Val {
    type Output = Result<Val>;

    fn neg(self) -> Self::Output {
        match self.kind {
            ValKind::Int(i) => Ok(Val::int(i.wrapping_neg())),
            ValKind::Float(f) => Ok(Val::float(-f)),
            _ => bail!("cannot negate {}", self.type_name()),
        }
    }
}

/// Comparison operator, used for error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
        }
    }
}

impl Val {
    /// Ordered comparison with numeric promotion; strings compare lexically.
    pub fn compare(&self, other: &Val, op: CmpOp) -> Result<bool> {
        let ordering = match (&self.kind, &other.kind) {
            (ValKind::Int(a), ValKind::Int(b)) => Some(a.cmp(b)),
            (ValKind::Str(a), ValKind::Str(b)) => Some(a.cmp(b)),
            _ => match promote(self, other) {
                Some((a, b)) => a.partial_cmp(&b),
                None => bail!(
                    "cannot compare {} {} {}",
                    self.type_name(),
                    op.symbol(),
                    other.type_name()
                ),
            },
        };
        // NaN compares false with everything.
        let Some(ord) = ordering else {
            return Ok(false);
        };
        Ok(match op {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::LtEq => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::GtEq => ord != Ordering::Less,
        })
    }

    fn int_pair(&self, other: &Val, what: &str) -> Result<(i64, i64)> {
        match (&self.kind, &other.kind) {
            (ValKind::Int(a), ValKind::Int(b)) => Ok((*a, *b)),
            _ => Err(anyhow!("{what} requires integers")),
        }
    }

    pub fn bit_and(&self, other: &Val) -> Result<Val> {
        let (a, b) = self.int_pair(other, "bitwise AND")?;
        Ok(Val::int(a & b))
    }

    pub fn bit_or(&self, other: &Val) -> Result<Val> {
        let (a, b) = self.int_pair(other, "bitwise OR")?;
        Ok(Val::int(a | b))
    }

    pub fn bit_xor(&self, other: &Val) -> Result<Val> {
        let (a, b) = self.int_pair(other, "bitwise XOR")?;
        Ok(Val::int(a ^ b))
    }

    pub fn bit_not(&self) -> Result<Val> {
        match self.kind {
            ValKind::Int(a) => Ok(Val::int(!a)),
            _ => bail!("bitwise NOT requires integer"),
        }
    }

    pub fn shl(&self, other: &Val) -> Result<Val> {
        let (a, b) = self.int_pair(other, "left shift")?;
        if !(0..=63).contains(&b) {
            bail!("shift amount out of range (0..63)");
        }
        Ok(Val::int(a << b))
    }

    pub fn shr(&self, other: &Val) -> Result<Val> {
        let (a, b) = self.int_pair(other, "right shift")?;
        if !(0..=63).contains(&b) {
            bail!("shift amount out of range (0..63)");
        }
        Ok(Val::int(a >> b))
    }

    /// Concatenate display forms.
    pub fn concat(&self, other: &Val) -> Val {
        Val::str(format!("{self}{other}"))
    }
}
