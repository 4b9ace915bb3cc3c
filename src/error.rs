//! Error types.
//!
//! [`PtlError`] is the richer error surfaced from the public API (§6 of the
//! spec); it doubles as the `ni_fail` class carried by an asynchronously
//! delivered event (§7).

/// The public error surface (spec §6).
///
/// `ARG_INVALID` / `NO_SPACE` / `NO_INIT` / `PID_IN_USE` / `IN_USE` /
/// `INTERRUPTED` / `EQ_EMPTY` / `EQ_DROPPED` / `CT_NONE_REACHED` are
/// submission-time or local-wait errors returned synchronously. The
/// `NI_*` variants are also constructible so that the same enum can tag an
/// asynchronously delivered event's `ni_fail` field (spec §7).
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum PtlError {
    #[error("not initialized")]
    NoInit,
    #[error("no space")]
    NoSpace,
    #[error("pid already in use")]
    PidInUse,
    #[error("invalid argument")]
    ArgInvalid,
    #[error("operation failed")]
    Fail,
    #[error("object in use")]
    InUse,
    #[error("interrupted")]
    Interrupted,
    #[error("event queue empty")]
    EqEmpty,
    #[error("event queue dropped events")]
    EqDropped,
    #[error("counting event threshold not reached")]
    CtNoneReached,
    #[error("message undeliverable")]
    NiUndeliverable,
    #[error("permission violation")]
    NiPermViolation,
    #[error("message dropped")]
    NiDropped,
    #[error("segmentation violation on remote access")]
    NiSegv,
    #[error("portal table entry disabled")]
    NiPtDisabled,
    #[error("operation not permitted by list entry options")]
    NiOpViolation,
}

pub type PtlResult<T> = Result<T, PtlError>;

/// `ni_fail` carried by an event: `None` is success, `Some(code)` a failure
/// class from §7's taxonomy.
pub type NiFail = Option<PtlError>;
