use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// Forces a specific application-layer hello onto every connection,
/// overriding whatever the assigned parser stream would otherwise send.
///
/// Grounded on `SPEC_FULL.md` §6's `hello=ssl|http|smbv1` option and §4.I.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HelloOverride {
    #[default]
    None,
    Ssl,
    Http,
    Smbv1,
}

/// Per-field HTTP request template mutations (`SPEC_FULL.md` §6 `http-*` options).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpTemplate {
    pub method: String,
    pub url: String,
    pub version: String,
    pub host: String,
    pub user_agent: String,
    pub payload: Vec<u8>,
}

impl Default for HttpTemplate {
    fn default() -> Self {
        HttpTemplate {
            method: "GET".to_string(),
            url: "/".to_string(),
            version: "HTTP/1.0".to_string(),
            host: String::new(),
            user_agent: "masscan/1.0".to_string(),
            payload: Vec::new(),
        }
    }
}

impl HttpTemplate {
    /// Render the request line, headers, and body, recomputing
    /// `Content-Length` from the current `payload` every time.
    pub fn render(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.method, self.url, self.version).as_bytes(),
        );
        if !self.host.is_empty() {
            out.extend_from_slice(format!("Host: {}\r\n", self.host).as_bytes());
        }
        out.extend_from_slice(format!("User-Agent: {}\r\n", self.user_agent).as_bytes());
        if !self.payload.is_empty() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.payload.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Selects one of the vulnerability-probing TLS hellos (`SPEC_FULL.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsProbe {
    #[default]
    None,
    Heartbleed,
    Ticketbleed,
    Poodle,
}

/// The engine's resolved, typed configuration.
///
/// This is the destination an external flag/file parser (out of scope, see
/// `SPEC_FULL.md` §1 and §9 "global protocol configuration") resolves option
/// strings into; the engine itself never parses argv or config files.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection table bucket-array size, before the [2^10, 2^24] clamp
    /// described in `SPEC_FULL.md` §4.D is applied by `Table::new`.
    pub capacity: usize,
    /// Seed mixed into every SYN cookie computation (`SPEC_FULL.md` §4.C).
    pub entropy: u64,
    /// Connection-wide deadline, after which the engine sends RST and
    /// destroys the TCB regardless of state (`SPEC_FULL.md` §4.F).
    pub conn_timeout: Duration,
    /// Delay before the application bridge decides the peer is staying
    /// silent and should be sent a hello (`SPEC_FULL.md` §4.G).
    pub hello_timeout: Duration,
    pub hello: HelloOverride,
    pub hello_strings: HashMap<u16, Vec<u8>>,
    pub http: HttpTemplate,
    pub tls_probe: TlsProbe,
    /// Set automatically when `tls_probe == Heartbleed` (`SPEC_FULL.md` §4.I);
    /// also settable directly for tests.
    pub small_window: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            capacity: 1 << 20,
            entropy: 0,
            conn_timeout: Duration::from_secs(30),
            hello_timeout: Duration::from_secs(2),
            hello: HelloOverride::None,
            hello_strings: HashMap::new(),
            http: HttpTemplate::default(),
            tls_probe: TlsProbe::None,
            small_window: false,
        }
    }
}

impl Config {
    /// Construct and validate a `Config`. Rejects (rather than silently
    /// clamping) combinations that can never make sense; the single
    /// intentional clamp — connection table capacity — lives in
    /// `crate::table::Table::new`, as `SPEC_FULL.md` §4.D specifies.
    pub fn new(entropy: u64, capacity: usize) -> Result<Config> {
        if capacity == 0 {
            return Err(Error::InvalidConfig(
                "connection table capacity must be nonzero".to_string(),
            ));
        }
        Ok(Config {
            capacity,
            entropy,
            ..Config::default()
        })
    }

    /// Apply a `heartbleed`/`ticketbleed`/`poodle` selection, which (per
    /// `SPEC_FULL.md` §4.I) forces the TLS stream on every port and, for
    /// heartbleed specifically, also sets `small_window`.
    pub fn set_tls_probe(&mut self, probe: TlsProbe) {
        self.tls_probe = probe;
        self.small_window = probe == TlsProbe::Heartbleed;
    }

    pub fn hello_for_port(&self, port: u16) -> Option<&[u8]> {
        self.hello_strings.get(&port).map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(Config::new(1, 0).is_err());
    }

    #[test]
    fn heartbleed_forces_small_window() {
        let mut cfg = Config::default();
        cfg.set_tls_probe(TlsProbe::Heartbleed);
        assert!(cfg.small_window);

        cfg.set_tls_probe(TlsProbe::Ticketbleed);
        assert!(!cfg.small_window);
    }

    #[test]
    fn http_template_recomputes_content_length() {
        let mut tmpl = HttpTemplate::default();
        tmpl.payload = b"a=1".to_vec();
        let rendered = tmpl.render();
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.contains("Content-Length: 3"));
        assert!(text.ends_with("a=1"));
    }
}
