//! Wire header encode/decode (spec §6 "Wire header").
//!
//! Little-endian, fixed layout. Kept as explicit per-field `encode`/`decode`
//! helpers rather than a derive, the way `ptl_loc.h` keeps explicit
//! `cpu_to_le64`/`le64_to_cpu` pairs per field width — a truncated or
//! version-mismatched header must be a checked, observable drop (spec §7
//! "Protocol errors"), not an implicit transmute.

use crate::error::{PtlError, PtlResult};

/// Current (only supported) wire version. Peers with a mismatched version
/// drop the packet (spec §6).
pub const VERSION: u8 = 1;

/// Length of the fixed header in bytes. Data descriptors follow.
pub const HEADER_LEN: usize = 64;

/// The `operation` byte's request/response boundary (spec §4.8): values
/// `<= OP_SWAP` are inbound new requests, values `>= OP_REPLY` are responses
/// to one of our own outstanding initiator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireOp {
    Put = 0,
    Get = 1,
    Atomic = 2,
    FetchAtomic = 3,
    Swap = 4,
    Reply = 5,
    Ack = 6,
}

impl WireOp {
    pub const OP_SWAP: u8 = WireOp::Swap as u8;
    pub const OP_REPLY: u8 = WireOp::Reply as u8;

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => WireOp::Put,
            1 => WireOp::Get,
            2 => WireOp::Atomic,
            3 => WireOp::FetchAtomic,
            4 => WireOp::Swap,
            5 => WireOp::Reply,
            6 => WireOp::Ack,
            _ => return None,
        })
    }

    pub fn is_request(self) -> bool {
        (self as u8) <= Self::OP_SWAP
    }

    pub fn is_response(self) -> bool {
        (self as u8) >= Self::OP_REPLY
    }
}

/// `ack_req` on the wire (spec §3 XI fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckReq {
    NoAck = 0,
    CtAck = 1,
    OcAck = 2,
    Ack = 3,
}

impl AckReq {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => AckReq::NoAck,
            1 => AckReq::CtAck,
            2 => AckReq::OcAck,
            3 => AckReq::Ack,
            _ => return None,
        })
    }
}

/// `flags` byte bits: `data_in`, `data_out`, `ack_req` presence.
pub mod hdr_flags {
    pub const DATA_IN: u8 = 1 << 0;
    pub const DATA_OUT: u8 = 1 << 1;
    pub const ACK_REQ: u8 = 1 << 2;
}

/// The fixed request/response header (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub operation: u8,
    pub ni_type: u8,
    pub pkt_fmt: u8,
    pub flags: u8,
    pub hdr_handle: u32,
    pub src_nid: u32,
    pub src_pid: u32,
    pub length: u64,
    pub pt_index: u32,
    pub match_bits: u64,
    pub remote_offset: u64,
    pub hdr_data: u64,
    pub atom_op: u8,
    pub atom_type: u8,
    pub ack_req: u8,
    /// Target-side failure code carried back on a reply/ack (spec §7
    /// "Target-side errors... reported... back to the initiator via NACK").
    /// `0` means no failure.
    pub nack: u8,
}

/// Map a target-side [`PtlError`] onto the wire's single-byte NACK code.
/// Only the `NI_*` failure classes travel this way (spec §7); anything else
/// collapses to `NI_DROPPED`, the general-purpose target-side failure.
pub fn ni_fail_to_wire(e: PtlError) -> u8 {
    match e {
        PtlError::NiUndeliverable => 1,
        PtlError::NiPermViolation => 2,
        PtlError::NiDropped => 3,
        PtlError::NiSegv => 4,
        PtlError::NiPtDisabled => 5,
        PtlError::NiOpViolation => 6,
        _ => 3,
    }
}

pub fn wire_to_ni_fail(v: u8) -> Option<PtlError> {
    Some(match v {
        1 => PtlError::NiUndeliverable,
        2 => PtlError::NiPermViolation,
        3 => PtlError::NiDropped,
        4 => PtlError::NiSegv,
        5 => PtlError::NiPtDisabled,
        6 => PtlError::NiOpViolation,
        _ => return None,
    })
}

impl Header {
    /// Serialize into `out[..HEADER_LEN]`. Panics if `out` is too short —
    /// a programmer bug, not a recoverable error.
    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= HEADER_LEN);
        out[0] = self.version;
        out[1] = self.operation;
        out[2] = self.ni_type;
        out[3] = self.pkt_fmt;
        out[4] = self.flags;
        out[5..9].copy_from_slice(&self.hdr_handle.to_le_bytes());
        out[9..13].copy_from_slice(&self.src_nid.to_le_bytes());
        out[13..17].copy_from_slice(&self.src_pid.to_le_bytes());
        out[17..25].copy_from_slice(&self.length.to_le_bytes());
        out[25..29].copy_from_slice(&self.pt_index.to_le_bytes());
        out[29..37].copy_from_slice(&self.match_bits.to_le_bytes());
        out[37..45].copy_from_slice(&self.remote_offset.to_le_bytes());
        out[45..53].copy_from_slice(&self.hdr_data.to_le_bytes());
        out[53] = self.atom_op;
        out[54] = self.atom_type;
        out[55] = self.ack_req;
        out[56] = self.nack;
        for b in &mut out[57..HEADER_LEN] {
            *b = 0;
        }
    }

    /// Parse a header out of `buf`. Returns `ArgInvalid` on a truncated
    /// buffer or version mismatch — both are "Protocol errors" (spec §7),
    /// silently dropped by the caller with `num_recv_drops` incremented.
    pub fn decode(buf: &[u8]) -> PtlResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(PtlError::ArgInvalid);
        }

        let h = Header {
            version: buf[0],
            operation: buf[1],
            ni_type: buf[2],
            pkt_fmt: buf[3],
            flags: buf[4],
            hdr_handle: u32::from_le_bytes(buf[5..9].try_into().unwrap()),
            src_nid: u32::from_le_bytes(buf[9..13].try_into().unwrap()),
            src_pid: u32::from_le_bytes(buf[13..17].try_into().unwrap()),
            length: u64::from_le_bytes(buf[17..25].try_into().unwrap()),
            pt_index: u32::from_le_bytes(buf[25..29].try_into().unwrap()),
            match_bits: u64::from_le_bytes(buf[29..37].try_into().unwrap()),
            remote_offset: u64::from_le_bytes(buf[37..45].try_into().unwrap()),
            hdr_data: u64::from_le_bytes(buf[45..53].try_into().unwrap()),
            atom_op: buf[53],
            atom_type: buf[54],
            ack_req: buf[55],
            nack: buf[56],
        };

        if h.version != VERSION {
            return Err(PtlError::ArgInvalid);
        }

        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let h = Header {
            version: VERSION,
            operation: WireOp::Put as u8,
            ni_type: 0,
            pkt_fmt: 0,
            flags: hdr_flags::DATA_IN,
            hdr_handle: 0xdead_beef,
            src_nid: 42,
            src_pid: 7,
            length: 16,
            pt_index: 3,
            match_bits: 0x1234,
            remote_offset: 8,
            hdr_data: 0,
            atom_op: 0,
            atom_type: 0,
            ack_req: AckReq::Ack as u8,
            nack: 0,
        };
        let mut buf = [0u8; HEADER_LEN];
        h.encode(&mut buf);
        let back = Header::decode(&buf).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn rejects_bad_version() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = VERSION + 1;
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn rejects_truncated() {
        let buf = [0u8; HEADER_LEN - 1];
        assert!(Header::decode(&buf).is_err());
    }
}
