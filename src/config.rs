//! Environment-derived tunables (spec §6).
//!
//! Read once at `Ni` construction: each knob is an env var with a typed
//! const fallback.

use std::env;

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => !matches!(v.as_str(), "0" | "false" | "no"),
        Err(_) => default,
    }
}

/// Per-process tunables, not per-NI state — these mirror compile/runtime
/// knobs of the reference implementation rather than protocol parameters.
#[derive(Debug, Clone, Copy)]
pub struct NiConfig {
    /// Completions harvested per `poll()` call (C8).
    pub wc_count: u32,
    /// Shared-receive-queue repost batch size.
    pub srq_repost_size: u32,
    /// RDMA connection-establishment timeout, milliseconds.
    pub rdma_timeout_ms: u32,
    /// Max outstanding send work requests per queue pair.
    pub max_qp_send_wr: u32,
    /// Max bytes eligible for an inlined send.
    pub max_inline_data: u32,
    /// Whether submission-time argument checks (§3 invariants) run.
    ///
    /// Defaults to `true`; the reference implementation's `CHECK_BUILD`
    /// likewise defaults to a checked build.
    pub check_build: bool,
}

impl Default for NiConfig {
    fn default() -> Self {
        NiConfig {
            wc_count: env_u32("WC_COUNT", 16),
            srq_repost_size: env_u32("SRQ_REPOST_SIZE", 64),
            rdma_timeout_ms: env_u32("RDMA_TIMEOUT", 2_000),
            max_qp_send_wr: env_u32("MAX_QP_SEND_WR", 64),
            max_inline_data: env_u32("MAX_INLINE_DATA", 72),
            check_build: env_bool("CHECK_BUILD", true),
        }
    }
}

impl NiConfig {
    /// Build from the process environment (spec §6 tunables).
    pub fn from_env() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        env::remove_var("WC_COUNT");
        let cfg = NiConfig::from_env();
        assert_eq!(cfg.wc_count, 16);
        assert!(cfg.check_build);
    }
}
