use std::net::IpAddr;

/// Sink for a finished banner (`SPEC_FULL.md` §6 `report()`).
///
/// The engine's only obligation is to call this exactly once per TCB, at
/// destruction, with whatever was accumulated in `tcb.banner`
/// (`SPEC_FULL.md` §3 invariant 7) — what happens to the bytes afterwards
/// (file, socket, stdout) is out of scope.
pub trait Reporter: Send {
    #[allow(clippy::too_many_arguments)]
    fn report(
        &mut self,
        now_secs: u64,
        ip: IpAddr,
        port: u16,
        subproto: &str,
        ttl: u8,
        banner: &[u8],
    );
}

/// A `Reporter` that appends formatted lines to an in-memory buffer; used by
/// tests and as a trivial default for a host binary that just wants stdout.
#[derive(Debug, Default)]
pub struct BufferReporter {
    pub lines: Vec<String>,
}

impl Reporter for BufferReporter {
    fn report(&mut self, now_secs: u64, ip: IpAddr, port: u16, subproto: &str, ttl: u8, banner: &[u8]) {
        self.lines.push(format!(
            "{now_secs} {ip}:{port} proto=tcp/{subproto} ttl={ttl} banner={:?}",
            String::from_utf8_lossy(banner)
        ));
    }
}
