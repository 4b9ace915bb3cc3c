//! Iovec primitives (spec §4.2).
//!
//! Gather/scatter copies and the elementwise atomic/compare-swap
//! evaluation used by the target state machine's `*_DATA_IN` states.

use crate::atomic_ops::{AtomOp, AtomType};
use crate::error::{PtlError, PtlResult};

/// A single scatter/gather segment: base address and length, as the
/// reference's `ptl_iovec_t` is (`{void *iov_base; size_t iov_len;}`).
#[derive(Debug, Clone, Copy)]
pub struct IoSlice<'a> {
    pub base: &'a [u8],
}

#[derive(Debug)]
pub struct IoSliceMut<'a> {
    pub base: &'a mut [u8],
}

fn total_len(iov: &[IoSlice<'_>]) -> u64 {
    iov.iter().map(|s| s.base.len() as u64).sum()
}

fn total_len_mut(iov: &[IoSliceMut<'_>]) -> u64 {
    iov.iter().map(|s| s.base.len() as u64).sum()
}

/// Locate the iov slot containing `offset`, and the byte offset within it
/// where `offset` begins (spec §4.2 `count_elem`).
pub fn count_elem_mut(
    iov: &[IoSliceMut<'_>],
    offset: u64,
) -> PtlResult<(usize, u64)> {
    let mut remaining = offset;
    for (index, slot) in iov.iter().enumerate() {
        let len = slot.base.len() as u64;
        if remaining < len {
            return Ok((index, remaining));
        }
        remaining -= len;
    }
    Err(PtlError::ArgInvalid)
}

/// Gather from `iov[offset..offset+length]` into `dst` (spec §4.2 `copy_out`).
pub fn copy_out(dst: &mut [u8], iov: &[IoSlice<'_>], offset: u64, length: u64) -> PtlResult<()> {
    if offset + length > total_len(iov) || dst.len() as u64 != length {
        return Err(PtlError::ArgInvalid);
    }

    let mut remaining_skip = offset;
    let mut written = 0usize;
    for slot in iov {
        let len = slot.base.len() as u64;
        if remaining_skip >= len {
            remaining_skip -= len;
            continue;
        }

        let start = remaining_skip as usize;
        let avail = slot.base.len() - start;
        let want = (length as usize - written).min(avail);
        dst[written..written + want].copy_from_slice(&slot.base[start..start + want]);
        written += want;
        remaining_skip = 0;

        if written as u64 == length {
            break;
        }
    }

    Ok(())
}

/// Scatter `src` into `iov[offset..offset+length]` (spec §4.2 `copy_in`).
pub fn copy_in(src: &[u8], iov: &mut [IoSliceMut<'_>], offset: u64, length: u64) -> PtlResult<()> {
    if offset + length > total_len_mut(iov) || src.len() as u64 != length {
        return Err(PtlError::ArgInvalid);
    }

    let mut remaining_skip = offset;
    let mut read = 0usize;
    for slot in iov.iter_mut() {
        let len = slot.base.len() as u64;
        if remaining_skip >= len {
            remaining_skip -= len;
            continue;
        }

        let start = remaining_skip as usize;
        let avail = slot.base.len() - start;
        let want = (length as usize - read).min(avail);
        slot.base[start..start + want].copy_from_slice(&src[read..read + want]);
        read += want;
        remaining_skip = 0;

        if read as u64 == length {
            break;
        }
    }

    Ok(())
}

/// Apply an atomic op elementwise over `iov[offset..offset+length]`, reading
/// operands from `src` (spec §4.2 `atomic_in`). Each element is updated
/// under the per-element atomicity guarantee of §5: this call holds the
/// exclusive borrow of `iov` for its whole duration, so concurrent target
/// operations against the same ME serialize at the caller (the target
/// state machine locks the PT entry across `ATOMIC_DATA_IN`, spec §4.5).
pub fn atomic_in(
    op: AtomOp,
    ty: AtomType,
    src: &[u8],
    iov: &mut [IoSliceMut<'_>],
    offset: u64,
    length: u64,
) -> PtlResult<()> {
    if offset + length > total_len_mut(iov) {
        return Err(PtlError::ArgInvalid);
    }

    let elem = ty.size();
    if length % elem as u64 != 0 || src.len() as u64 != length {
        return Err(PtlError::ArgInvalid);
    }

    // A scatter/gather ME is not guaranteed to carve its slots on element
    // boundaries (a `[[a:4],[b:8],[c:4]]` ME can straddle an 8-byte element
    // across the a/b split), so each element is gathered into a scratch
    // buffer, updated in place, and scattered back along the same path
    // rather than sliced directly out of one slot.
    let mut slot = 0usize;
    let mut slot_off = offset;
    while slot < iov.len() {
        let len = iov[slot].base.len() as u64;
        if slot_off < len {
            break;
        }
        slot_off -= len;
        slot += 1;
    }

    let mut buf = [0u8; 16];
    let mut read = 0usize;
    while read < length as usize {
        let start_slot = slot;
        let start_off = slot_off;

        let mut filled = 0usize;
        while filled < elem {
            let avail = iov[slot].base.len() - slot_off as usize;
            let want = (elem - filled).min(avail);
            let off = slot_off as usize;
            buf[filled..filled + want].copy_from_slice(&iov[slot].base[off..off + want]);
            filled += want;
            slot_off += want as u64;
            if slot_off == iov[slot].base.len() as u64 && filled < elem {
                slot += 1;
                slot_off = 0;
            }
        }

        op.apply(ty, &mut buf[..elem], &src[read..read + elem]);

        let mut written = 0usize;
        let (mut w_slot, mut w_off) = (start_slot, start_off);
        while written < elem {
            let avail = iov[w_slot].base.len() - w_off as usize;
            let want = (elem - written).min(avail);
            let off = w_off as usize;
            iov[w_slot].base[off..off + want].copy_from_slice(&buf[written..written + want]);
            written += want;
            w_off += want as u64;
            if w_off == iov[w_slot].base.len() as u64 && written < elem {
                w_slot += 1;
                w_off = 0;
            }
        }

        read += elem;
        if slot_off == iov[slot].base.len() as u64 && read < length as usize {
            slot += 1;
            slot_off = 0;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_out_gathers_across_slots() {
        let a = [1u8, 2, 3, 4];
        let b = [5u8, 6, 7, 8];
        let iov = [IoSlice { base: &a }, IoSlice { base: &b }];
        let mut dst = [0u8; 4];
        copy_out(&mut dst, &iov, 2, 4).unwrap();
        assert_eq!(dst, [3, 4, 5, 6]);
    }

    #[test]
    fn copy_out_rejects_oob() {
        let a = [1u8, 2, 3, 4];
        let iov = [IoSlice { base: &a }];
        let mut dst = [0u8; 2];
        assert!(copy_out(&mut dst, &iov, 3, 2).is_err());
    }

    #[test]
    fn copy_in_scatters_across_slots() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        let src = [9u8, 8, 7, 6];
        {
            let mut iov = [IoSliceMut { base: &mut a }, IoSliceMut { base: &mut b }];
            copy_in(&src, &mut iov, 0, 4).unwrap();
        }
        assert_eq!(a, [9, 8]);
        assert_eq!(b, [7, 6]);
    }

    #[test]
    fn atomic_in_handles_element_straddling_slots() {
        // `[[a:4],[b:8],[c:4]]` with 8-byte (Int64) elements: the first
        // element spans all of `a` plus the first 4 bytes of `b`.
        let mut a = 1i64.to_le_bytes()[..4].to_vec();
        let mut b = [1i64.to_le_bytes()[4..].to_vec(), 2i64.to_le_bytes()[..4].to_vec()].concat();
        let mut c = 2i64.to_le_bytes()[4..].to_vec();
        let src = [10i64.to_le_bytes(), 20i64.to_le_bytes()].concat();
        {
            let mut iov = [
                IoSliceMut { base: &mut a },
                IoSliceMut { base: &mut b },
                IoSliceMut { base: &mut c },
            ];
            atomic_in(AtomOp::Sum, AtomType::Int64, &src, &mut iov, 0, 16).unwrap();
        }
        let first = i64::from_le_bytes([a.as_slice(), &b[..4]].concat().try_into().unwrap());
        let second = i64::from_le_bytes([&b[4..], c.as_slice()].concat().try_into().unwrap());
        assert_eq!(first, 11);
        assert_eq!(second, 22);
    }

    #[test]
    fn count_elem_locates_slot() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let iov = [IoSliceMut { base: &mut a }, IoSliceMut { base: &mut b }];
        let (idx, base) = count_elem_mut(&iov, 5).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(base, 1);
    }
}
