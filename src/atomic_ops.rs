//! The `{atom_op} x {atom_type}` validity matrix and elementwise application
//! (spec §4.6), enforced at submission and applied by the target state
//! machine's `ATOMIC_DATA_IN`/`SWAP_DATA_IN` states (spec §4.5).

use crate::error::{PtlError, PtlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float,
    Double,
    FloatComplex,
    DoubleComplex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeClass {
    Integer,
    FloatDouble,
    Complex,
}

impl AtomType {
    /// Element size in bytes.
    pub fn size(self) -> usize {
        match self {
            AtomType::Int8 | AtomType::Uint8 => 1,
            AtomType::Int16 | AtomType::Uint16 => 2,
            AtomType::Int32 | AtomType::Uint32 | AtomType::Float => 4,
            AtomType::Int64 | AtomType::Uint64 | AtomType::Double | AtomType::FloatComplex => 8,
            AtomType::DoubleComplex => 16,
        }
    }

    fn class(self) -> TypeClass {
        match self {
            AtomType::Float | AtomType::Double => TypeClass::FloatDouble,
            AtomType::FloatComplex | AtomType::DoubleComplex => TypeClass::Complex,
            _ => TypeClass::Integer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomOp {
    Min,
    Max,
    Sum,
    Prod,
    Lor,
    Land,
    Bor,
    Band,
    Lxor,
    Bxor,
    Swap,
    Cswap,
    CswapNe,
    CswapLe,
    CswapLt,
    CswapGe,
    CswapGt,
    Mswap,
}

struct Family {
    float_double: bool,
    complex: bool,
    /// Usable with Atomic()/FetchAtomic().
    atomic_usage: bool,
    /// Usable with Swap().
    swap_usage: bool,
    uses_operand: bool,
}

impl AtomOp {
    fn family(self) -> Family {
        use AtomOp::*;
        match self {
            Min | Max => Family { float_double: true, complex: false, atomic_usage: true, swap_usage: false, uses_operand: false },
            Sum | Prod => Family { float_double: true, complex: true, atomic_usage: true, swap_usage: false, uses_operand: false },
            Lor | Land | Bor | Band | Lxor | Bxor => Family { float_double: false, complex: false, atomic_usage: true, swap_usage: false, uses_operand: false },
            Swap => Family { float_double: true, complex: true, atomic_usage: false, swap_usage: true, uses_operand: false },
            Cswap | CswapNe => Family { float_double: true, complex: true, atomic_usage: false, swap_usage: true, uses_operand: true },
            CswapLe | CswapLt | CswapGe | CswapGt => Family { float_double: true, complex: false, atomic_usage: false, swap_usage: true, uses_operand: true },
            Mswap => Family { float_double: false, complex: false, atomic_usage: false, swap_usage: true, uses_operand: true },
        }
    }

    pub fn uses_operand(self) -> bool {
        self.family().uses_operand
    }

    pub fn is_swap_family(self) -> bool {
        self.family().swap_usage
    }

    /// Validate `self x ty` under the given usage (spec §4.6 matrix).
    pub fn validate(self, ty: AtomType, usage: Usage) -> PtlResult<()> {
        let fam = self.family();
        let usage_ok = match usage {
            Usage::Atomic => fam.atomic_usage,
            Usage::Swap => fam.swap_usage,
        };
        if !usage_ok {
            return Err(PtlError::ArgInvalid);
        }

        let type_ok = match ty.class() {
            TypeClass::Integer => true,
            TypeClass::FloatDouble => fam.float_double,
            TypeClass::Complex => fam.complex,
        };
        if !type_ok {
            return Err(PtlError::ArgInvalid);
        }

        Ok(())
    }

    /// `remote[i] = f(remote[i], local[i])` for the non-swap atomic family.
    /// Operates on raw little-endian element bytes.
    pub fn apply(self, ty: AtomType, dst: &mut [u8], src: &[u8]) {
        macro_rules! num_op {
            ($t:ty, $f:expr) => {{
                let a = <$t>::from_le_bytes(dst.try_into().unwrap());
                let b = <$t>::from_le_bytes(src.try_into().unwrap());
                let r: $t = $f(a, b);
                dst.copy_from_slice(&r.to_le_bytes());
            }};
        }
        macro_rules! complex_op {
            ($t:ty, $f:expr) => {{
                let w = core::mem::size_of::<$t>();
                let ar = <$t>::from_le_bytes(dst[..w].try_into().unwrap());
                let ai = <$t>::from_le_bytes(dst[w..2 * w].try_into().unwrap());
                let br = <$t>::from_le_bytes(src[..w].try_into().unwrap());
                let bi = <$t>::from_le_bytes(src[w..2 * w].try_into().unwrap());
                let (rr, ri): ($t, $t) = $f(ar, ai, br, bi);
                dst[..w].copy_from_slice(&rr.to_le_bytes());
                dst[w..2 * w].copy_from_slice(&ri.to_le_bytes());
            }};
        }

        // Integer ops are signedness-independent bit-pattern arithmetic: two's
        // complement add/multiply/bitwise results don't depend on whether the
        // operands are read as signed, and min/max needs the sign only to
        // pick the comparison, not to compute the result.
        if ty.class() == TypeClass::Integer {
            let signed = matches!(ty, AtomType::Int8 | AtomType::Int16 | AtomType::Int32 | AtomType::Int64);
            let width = dst.len();
            let a = read_bits(dst);
            let b = read_bits(src);
            let result = match self {
                AtomOp::Sum => a.wrapping_add(b),
                AtomOp::Prod => a.wrapping_mul(b),
                AtomOp::Bor => a | b,
                AtomOp::Band => a & b,
                AtomOp::Bxor => a ^ b,
                AtomOp::Lor => ((a != 0) || (b != 0)) as u128,
                AtomOp::Land => ((a != 0) && (b != 0)) as u128,
                AtomOp::Lxor => ((a != 0) ^ (b != 0)) as u128,
                AtomOp::Min | AtomOp::Max => {
                    let ord = if signed { to_signed(a, width).cmp(&to_signed(b, width)) } else { a.cmp(&b) };
                    let pick_a = if self == AtomOp::Min { ord.is_le() } else { ord.is_ge() };
                    if pick_a {
                        a
                    } else {
                        b
                    }
                }
                _ => unreachable!("validate() already rejected {:?} from the atomic family", self),
            };
            write_bits(dst, result);
            return;
        }

        match (self, ty) {
            (AtomOp::Sum, AtomType::Float) => num_op!(f32, |a: f32, b: f32| a + b),
            (AtomOp::Sum, AtomType::Double) => num_op!(f64, |a: f64, b: f64| a + b),
            (AtomOp::Prod, AtomType::Float) => num_op!(f32, |a: f32, b: f32| a * b),
            (AtomOp::Prod, AtomType::Double) => num_op!(f64, |a: f64, b: f64| a * b),
            (AtomOp::Min, AtomType::Float) => num_op!(f32, f32::min),
            (AtomOp::Min, AtomType::Double) => num_op!(f64, f64::min),
            (AtomOp::Max, AtomType::Float) => num_op!(f32, f32::max),
            (AtomOp::Max, AtomType::Double) => num_op!(f64, f64::max),
            (AtomOp::Sum, AtomType::FloatComplex) => complex_op!(f32, |ar: f32, ai: f32, br: f32, bi: f32| (ar + br, ai + bi)),
            (AtomOp::Sum, AtomType::DoubleComplex) => complex_op!(f64, |ar: f64, ai: f64, br: f64, bi: f64| (ar + br, ai + bi)),
            (AtomOp::Prod, AtomType::FloatComplex) => {
                complex_op!(f32, |ar: f32, ai: f32, br: f32, bi: f32| (ar * br - ai * bi, ar * bi + ai * br))
            }
            (AtomOp::Prod, AtomType::DoubleComplex) => {
                complex_op!(f64, |ar: f64, ai: f64, br: f64, bi: f64| (ar * br - ai * bi, ar * bi + ai * br))
            }
            _ => unreachable!("validate() already rejected {:?} x {:?}", self, ty),
        }
    }

    /// Swap-family element evaluation (spec §4.6 + example 4 CSWAP_LT):
    /// returns the previous remote bytes (always, for the Fetch-style
    /// reply) and writes the new remote value into `remote` in place.
    pub fn swap_elem(self, ty: AtomType, remote: &mut [u8], local: &[u8], operand: Option<&[u8]>, previous_out: &mut [u8]) {
        previous_out.copy_from_slice(remote);

        if self == AtomOp::Swap {
            remote.copy_from_slice(local);
            return;
        }

        if ty.class() == TypeClass::Integer {
            let signed = matches!(ty, AtomType::Int8 | AtomType::Int16 | AtomType::Int32 | AtomType::Int64);
            let width = remote.len();
            let r = read_bits(remote);
            let o = operand.map(read_bits);
            let take = match self {
                AtomOp::Cswap => o.map_or(true, |o| r == o),
                AtomOp::CswapNe => o.map_or(true, |o| r != o),
                AtomOp::CswapLt | AtomOp::CswapLe | AtomOp::CswapGt | AtomOp::CswapGe => match o {
                    Some(o) => {
                        let ord = if signed { to_signed(r, width).cmp(&to_signed(o, width)) } else { r.cmp(&o) };
                        match self {
                            AtomOp::CswapLt => ord.is_lt(),
                            AtomOp::CswapLe => ord.is_le(),
                            AtomOp::CswapGt => ord.is_gt(),
                            AtomOp::CswapGe => ord.is_ge(),
                            _ => unreachable!(),
                        }
                    }
                    None => true,
                },
                AtomOp::Mswap => {
                    let l = read_bits(local);
                    let mask = o.unwrap_or(0);
                    write_bits(remote, (l & mask) | (r & !mask));
                    return;
                }
                _ => unreachable!("validate() already rejected {:?} from the swap family", self),
            };
            if take {
                remote.copy_from_slice(local);
            }
            return;
        }

        macro_rules! float_cswap {
            ($t:ty, $cond:expr) => {{
                let r = <$t>::from_le_bytes(remote.try_into().unwrap());
                let take = match operand {
                    Some(o) => $cond(r, <$t>::from_le_bytes(o.try_into().unwrap())),
                    None => true,
                };
                if take {
                    remote.copy_from_slice(local);
                }
            }};
        }
        macro_rules! complex_cswap {
            ($t:ty, $cond:expr) => {{
                let w = core::mem::size_of::<$t>();
                let rr = <$t>::from_le_bytes(remote[..w].try_into().unwrap());
                let ri = <$t>::from_le_bytes(remote[w..2 * w].try_into().unwrap());
                let take = match operand {
                    Some(o) => {
                        let or = <$t>::from_le_bytes(o[..w].try_into().unwrap());
                        let oi = <$t>::from_le_bytes(o[w..2 * w].try_into().unwrap());
                        $cond(rr, ri, or, oi)
                    }
                    None => true,
                };
                if take {
                    remote.copy_from_slice(local);
                }
            }};
        }

        match (self, ty) {
            (AtomOp::Cswap, AtomType::Float) => float_cswap!(f32, |r: f32, o: f32| r == o),
            (AtomOp::Cswap, AtomType::Double) => float_cswap!(f64, |r: f64, o: f64| r == o),
            (AtomOp::CswapNe, AtomType::Float) => float_cswap!(f32, |r: f32, o: f32| r != o),
            (AtomOp::CswapNe, AtomType::Double) => float_cswap!(f64, |r: f64, o: f64| r != o),
            (AtomOp::CswapLt, AtomType::Float) => float_cswap!(f32, |r: f32, o: f32| r < o),
            (AtomOp::CswapLt, AtomType::Double) => float_cswap!(f64, |r: f64, o: f64| r < o),
            (AtomOp::CswapLe, AtomType::Float) => float_cswap!(f32, |r: f32, o: f32| r <= o),
            (AtomOp::CswapLe, AtomType::Double) => float_cswap!(f64, |r: f64, o: f64| r <= o),
            (AtomOp::CswapGt, AtomType::Float) => float_cswap!(f32, |r: f32, o: f32| r > o),
            (AtomOp::CswapGt, AtomType::Double) => float_cswap!(f64, |r: f64, o: f64| r > o),
            (AtomOp::CswapGe, AtomType::Float) => float_cswap!(f32, |r: f32, o: f32| r >= o),
            (AtomOp::CswapGe, AtomType::Double) => float_cswap!(f64, |r: f64, o: f64| r >= o),
            (AtomOp::Cswap, AtomType::FloatComplex) => complex_cswap!(f32, |ar: f32, ai: f32, br: f32, bi: f32| ar == br && ai == bi),
            (AtomOp::Cswap, AtomType::DoubleComplex) => complex_cswap!(f64, |ar: f64, ai: f64, br: f64, bi: f64| ar == br && ai == bi),
            (AtomOp::CswapNe, AtomType::FloatComplex) => {
                complex_cswap!(f32, |ar: f32, ai: f32, br: f32, bi: f32| !(ar == br && ai == bi))
            }
            (AtomOp::CswapNe, AtomType::DoubleComplex) => {
                complex_cswap!(f64, |ar: f64, ai: f64, br: f64, bi: f64| !(ar == br && ai == bi))
            }
            _ => unreachable!("validate() already rejected {:?} x {:?}", self, ty),
        }
    }
}

/// Read up to 16 little-endian bytes as a zero-extended `u128` bit pattern —
/// enough to hold any atomic element without caring about its signedness.
fn read_bits(bytes: &[u8]) -> u128 {
    let mut buf = [0u8; 16];
    buf[..bytes.len()].copy_from_slice(bytes);
    u128::from_le_bytes(buf)
}

/// Write the low `bytes.len()` bytes of `value`'s bit pattern back out.
fn write_bits(bytes: &mut [u8], value: u128) {
    bytes.copy_from_slice(&value.to_le_bytes()[..bytes.len()]);
}

/// Reinterpret an `width`-byte-wide zero-extended bit pattern as a
/// sign-extended `i128`, for ordered comparisons over signed integer types.
fn to_signed(bits: u128, width: usize) -> i128 {
    let shift = 128 - width * 8;
    ((bits << shift) as i128) >> shift
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Atomic,
    Swap,
}

/// Swap operations carrying an `operand` require `length <= sizeof(atom_type)`
/// (spec §4.6) — a single element per operation.
pub fn check_swap_length(op: AtomOp, ty: AtomType, length: u64) -> PtlResult<()> {
    if op.uses_operand() && length > ty.size() as u64 {
        return Err(PtlError::ArgInvalid);
    }
    Ok(())
}
