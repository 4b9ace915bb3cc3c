//! Matching engine (spec §4.4, C4): resolves one inbound request against a
//! PT's priority and overflow lists under strict Portals ordering.

use crate::entry::{options as entry_opts, Entry};
use crate::handle::{Handle, Pool};
use crate::error::{PtlError, PtlResult};
use crate::identifiers::ProcessId;
use crate::pt::{PtEntry, PtStatus};

#[derive(Debug, Clone, Copy)]
pub struct MatchResult {
    pub handle: Handle,
    pub effective_offset: u64,
    pub from_overflow: bool,
    /// Bytes actually transferable against the matched entry: `length`
    /// unless the entry has fewer bytes left past `effective_offset`, in
    /// which case the request is truncated (spec §4.4's matching table —
    /// `NO_TRUNCATE` callers never see a truncated `mlength` since the
    /// length check above already rejected the match).
    pub mlength: u64,
}

fn op_permitted(options: u32, op_flag: u32) -> bool {
    options & op_flag != 0
}

fn entry_matches(
    entries: &Pool<Entry>,
    handle: Handle,
    initiator: ProcessId,
    match_bits: u64,
    remote_offset: u64,
    length: u64,
    op_flag: u32,
) -> PtlResult<bool> {
    entries.with(handle, |entry| {
        let common = entry.common();
        if common.unlinked {
            return false;
        }
        if !op_permitted(common.options, op_flag) {
            return false;
        }
        if !entry.matches_bits(match_bits) {
            return false;
        }
        if !entry.matches_id(initiator) {
            return false;
        }

        let effective_offset = if common.has(entry_opts::MANAGE_LOCAL) {
            common.local_offset
        } else {
            remote_offset
        };

        if common.has(entry_opts::NO_TRUNCATE) && effective_offset + length > common.len() {
            return false;
        }

        true
    })
}

/// Resolve a match (spec §4.4 steps 1-4). Does not perform auto-unlink or
/// permission checks — callers (`target.rs`) apply those once the matched
/// entry is bound to the in-flight request, per §4.4's tie-break note that
/// "auto-unlink happens after the current operation is bound to the entry".
pub fn find_match(
    pt: &PtEntry,
    entries: &Pool<Entry>,
    initiator: ProcessId,
    match_bits: u64,
    remote_offset: u64,
    length: u64,
    op_flag: u32,
) -> PtlResult<MatchResult> {
    if pt.status != PtStatus::Enabled {
        return Err(PtlError::NiPtDisabled);
    }

    let lists = pt.lists.lock().unwrap();

    for &handle in &lists.priority {
        if entry_matches(entries, handle, initiator, match_bits, remote_offset, length, op_flag)? {
            let (effective_offset, mlength) = entries.with(handle, |e| {
                let common = e.common();
                let eff = if common.has(entry_opts::MANAGE_LOCAL) {
                    common.local_offset
                } else {
                    remote_offset
                };
                let available = common.len().saturating_sub(eff);
                (eff, length.min(available))
            })?;
            return Ok(MatchResult { handle, effective_offset, from_overflow: false, mlength });
        }
    }

    for &handle in &lists.overflow {
        if entry_matches(entries, handle, initiator, match_bits, remote_offset, length, op_flag)? {
            let (effective_offset, mlength) = entries.with(handle, |e| {
                let common = e.common();
                let eff = if common.has(entry_opts::MANAGE_LOCAL) {
                    common.local_offset
                } else {
                    remote_offset
                };
                let available = common.len().saturating_sub(eff);
                (eff, length.min(available))
            })?;
            return Ok(MatchResult { handle, effective_offset, from_overflow: true, mlength });
        }
    }

    Err(PtlError::NiDropped)
}

/// `LESearch`/`MESearch` (spec §6): same scan `find_match` runs, but never
/// binds a request to the winner — just reports which entry (if any) would
/// have matched. Distinct from `find_match` in that an empty result is not
/// an error: nothing matching is a valid search outcome.
pub fn search(
    pt: &PtEntry,
    entries: &Pool<Entry>,
    initiator: ProcessId,
    match_bits: u64,
    remote_offset: u64,
    length: u64,
    op_flag: u32,
) -> PtlResult<Option<Handle>> {
    match find_match(pt, entries, initiator, match_bits, remote_offset, length, op_flag) {
        Ok(m) => Ok(Some(m.handle)),
        Err(PtlError::NiDropped) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Permission check (spec §4.4 step 6): the incoming request's job/user id
/// against the matched entry's `ac_id`. A wildcard `ac_id` of `u32::MAX`
/// accepts anyone, mirroring `AUTH_USE_JID` disabled.
pub fn check_permission(entries: &Pool<Entry>, handle: Handle, requester_ac_id: u32) -> PtlResult<()> {
    let ac_id = entries.with(handle, |e| e.common().ac_id)?;
    if ac_id == u32::MAX || ac_id == requester_ac_id {
        Ok(())
    } else {
        Err(PtlError::NiPermViolation)
    }
}

/// Whether the matched entry should be auto-unlinked now that the current
/// operation is bound to it (spec §4.4 step 5): `USE_ONCE`, or an ME whose
/// remaining free space just dropped below `min_free`.
pub fn should_auto_unlink(entries: &Pool<Entry>, handle: Handle, consumed_offset: u64, length: u64) -> PtlResult<bool> {
    entries.with(handle, |entry| {
        let common = entry.common();
        if common.has(entry_opts::USE_ONCE) {
            return true;
        }
        if let Entry::Matching(me) = entry {
            if me.min_free > 0 {
                let remaining = common.len().saturating_sub(consumed_offset + length);
                return remaining < me.min_free;
            }
        }
        false
    })
}

/// Remove `handle` from whichever of `pt`'s lists it's in (priority first,
/// since a priority-list entry can never also be in overflow).
pub fn unlink(pt: &PtEntry, handle: Handle) {
    let mut lists = pt.lists.lock().unwrap();
    if let Some(pos) = lists.priority.iter().position(|&h| h == handle) {
        lists.priority.remove(pos);
        return;
    }
    if let Some(pos) = lists.overflow.iter().position(|&h| h == handle) {
        lists.overflow.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{NID_ANY, PID_ANY};

    fn requester() -> ProcessId {
        ProcessId::new(7, 3)
    }

    #[test]
    fn priority_beats_overflow_and_earliest_wins() {
        let entries: Pool<Entry> = Pool::new(16);
        let pt = PtEntry::new(None, 0);

        let h1 = entries
            .insert(Entry::new_me(vec![0; 8], None, entry_opts::OP_PUT, u32::MAX, 0, 0, 0, ProcessId::new(NID_ANY, PID_ANY)))
            .unwrap();
        let h2 = entries
            .insert(Entry::new_me(vec![0; 8], None, entry_opts::OP_PUT, u32::MAX, 0, 0, 0, ProcessId::new(NID_ANY, PID_ANY)))
            .unwrap();
        {
            let mut lists = pt.lists.lock().unwrap();
            lists.priority.push(h1);
            lists.priority.push(h2);
        }

        let m = find_match(&pt, &entries, requester(), 0, 0, 4, entry_opts::OP_PUT).unwrap();
        assert_eq!(m.handle, h1);
        assert!(!m.from_overflow);
    }

    #[test]
    fn falls_back_to_overflow() {
        let entries: Pool<Entry> = Pool::new(16);
        let pt = PtEntry::new(None, 0);
        let h = entries
            .insert(Entry::new_le(vec![0; 8], None, entry_opts::OP_PUT, u32::MAX))
            .unwrap();
        pt.lists.lock().unwrap().overflow.push(h);

        let m = find_match(&pt, &entries, requester(), 0, 0, 4, entry_opts::OP_PUT).unwrap();
        assert!(m.from_overflow);
    }

    #[test]
    fn no_truncate_rejects_oversized_request() {
        let entries: Pool<Entry> = Pool::new(16);
        let pt = PtEntry::new(None, 0);
        let h = entries
            .insert(Entry::new_le(vec![0; 8], None, entry_opts::OP_PUT | entry_opts::NO_TRUNCATE, u32::MAX))
            .unwrap();
        pt.lists.lock().unwrap().priority.push(h);

        assert!(find_match(&pt, &entries, requester(), 0, 0, 40, entry_opts::OP_PUT).is_err());
    }

    #[test]
    fn disabled_pt_errors() {
        let entries: Pool<Entry> = Pool::new(16);
        let mut pt = PtEntry::new(None, 0);
        pt.status = PtStatus::Disabled;
        assert!(matches!(
            find_match(&pt, &entries, requester(), 0, 0, 4, entry_opts::OP_PUT),
            Err(PtlError::NiPtDisabled)
        ));
    }
}
