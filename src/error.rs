use std::net::Ipv4Addr;

/// Errors the engine surfaces to a caller.
///
/// Everything else in the error taxonomy described in `SPEC_FULL.md` §7
/// (parse rejects, stale ACKs, resource exhaustion, peer RST, deadline RST,
/// double-free detection) is handled locally by the event-dispatch loop and
/// logged through the `log` facade; it never reaches this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The synchronous startup ARP resolve for the gateway exhausted its
    /// retry budget without a matching reply.
    #[error("gateway {gateway} did not answer ARP after {attempts} attempts")]
    GatewayUnreachable { gateway: Ipv4Addr, attempts: u32 },

    /// A `Config` was constructed with an invalid combination of settings.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An internal invariant (see `SPEC_FULL.md` §8) was violated.
    ///
    /// In debug builds this is raised via `debug_assert!`-style checks; in
    /// release builds the condition is logged at `error!` and the offending
    /// operation is skipped rather than performed, so this variant is
    /// constructed but not necessarily `panic!`-propagated.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
