use crate::config::{Config, HelloOverride, HttpTemplate, TlsProbe};
use crate::tcb::Tcb;

/// What a parser stream hands back after seeing a chunk of banner data
/// (`SPEC_FULL.md` §6 "parser dispatch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParseOutcome {
    /// The parser wants the connection closed (e.g. it recognized a
    /// definitive end-of-banner marker).
    pub done: bool,
}

/// A handle a parser stream's callbacks use to talk back to the engine
/// (`SPEC_FULL.md` §6 "Interfaces exposed").
pub trait NetApi {
    /// Queue `buf` for transmission on the calling TCB.
    fn send(&mut self, tcb: &mut Tcb, buf: &[u8], is_fin: bool);
}

/// The capability set a protocol parser may implement (`SPEC_FULL.md` §9
/// "polymorphic dispatch over parsers": modeled as a trait instead of a
/// C-style table of optional function pointers, since Rust's vtable dispatch
/// already gives the bridge in `crate::app` exactly that shape).
///
/// Every method has a default no-op/`false` implementation, so a parser that
/// only wants to implement `parse` (passive banner grab) doesn't have to
/// stub out `transmit_hello`.
pub trait ParserStream: Send {
    /// Human-readable name used in reports (`SPEC_FULL.md` §6 `report()`).
    fn name(&self) -> &'static str;

    /// A static hello to send if the peer stays silent past `hello_timeout`
    /// and `transmit_hello` is not implemented. `None` means "send nothing,
    /// just keep waiting" (passive banner grabs, e.g. plain TCP banners).
    fn hello(&self) -> Option<&'static [u8]> {
        None
    }

    /// An active hello constructed per-connection (e.g. an HTTP request
    /// built from `crate::config::HttpTemplate`). Takes precedence over
    /// `hello()` when present.
    fn transmit_hello(&self, _tcb: &mut Tcb, _net: &mut dyn NetApi) -> bool {
        false
    }

    /// Feed a chunk of the peer's reply through the parser's own state
    /// machine, appending to `tcb.banner` as it recognizes fields.
    fn parse(&mut self, tcb: &mut Tcb, data: &[u8]) -> ParseOutcome;
}

/// A trivial parser that never sends a probe and copies raw bytes into the
/// banner verbatim, capped at a reasonable size. Useful as a default/test
/// stream and as the terminal case of a reconnect chain.
#[derive(Debug, Default)]
pub struct RawBannerParser {
    pub max_len: usize,
}

impl RawBannerParser {
    pub fn new(max_len: usize) -> RawBannerParser {
        RawBannerParser { max_len }
    }
}

impl ParserStream for RawBannerParser {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn parse(&mut self, tcb: &mut Tcb, data: &[u8]) -> ParseOutcome {
        let room = self.max_len.saturating_sub(tcb.banner.len());
        let take = room.min(data.len());
        tcb.banner.extend_from_slice(&data[..take]);
        ParseOutcome {
            done: tcb.banner.len() >= self.max_len,
        }
    }
}

/// A bare TLS 1.0 `ClientHello` offering only the cipher suites needed to
/// reach a server's certificate/heartbeat handling, matching what
/// `stack-tcp-core.c`'s `ssl_hello(ssl_hello_default_template)` builds for
/// the plain `hello=ssl` case.
const CLIENT_HELLO_DEFAULT: &[u8] = &[
    0x16, 0x03, 0x01, 0x00, 0x31, // TLS record: handshake, TLS 1.0, length
    0x01, 0x00, 0x00, 0x2d, // ClientHello, length
    0x03, 0x01, // client_version: TLS 1.0
    0x00, 0x00, 0x00, 0x00, // gmt_unix_time (zeroed, not the real clock)
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // random
    0x00, // session_id length
    0x00, 0x02, 0x00, 0x2f, // one cipher suite: TLS_RSA_WITH_AES_128_CBC_SHA
    0x01, 0x00, // one compression method: null
];

/// `ssl_hello(ssl_hello_heartbeat_template)`: the default hello plus a
/// `heartbeat` extension, which is what actually provokes a heartbleed
/// response out of a vulnerable server.
const CLIENT_HELLO_HEARTBEAT: &[u8] = &[
    0x16, 0x03, 0x01, 0x00, 0x36,
    0x01, 0x00, 0x00, 0x32,
    0x03, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
    0x00, 0x02, 0x00, 0x2f,
    0x01, 0x00,
    0x00, 0x05, // extensions length
    0x00, 0x0f, 0x00, 0x01, 0x01, // heartbeat extension, peer_not_allowed_to_send
];

/// `ssl_hello(ssl_hello_ticketbleed_template)`: the default hello plus a
/// non-empty `SessionTicket TLS` extension, which is what triggers
/// ticketbleed's out-of-bounds echo.
const CLIENT_HELLO_TICKETBLEED: &[u8] = &[
    0x16, 0x03, 0x01, 0x00, 0x3a,
    0x01, 0x00, 0x00, 0x36,
    0x03, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
    0x00, 0x02, 0x00, 0x2f,
    0x01, 0x00,
    0x00, 0x09,
    0x00, 0x23, 0x00, 0x05, 0xde, 0xad, 0xbe, 0xef, 0x00, // SessionTicket TLS, 4 bytes of garbage
];

/// `ssl_hello(ssl_hello_sslv3_template)` plus `ssl_add_cipherspec(px,
/// 0x5600, 1)`: an SSLv3 hello offering the export-grade `TLS_RSA_EXPORT...`
/// suite the POODLE downgrade attack depends on.
const CLIENT_HELLO_POODLE: &[u8] = &[
    0x16, 0x03, 0x00, 0x00, 0x31,
    0x01, 0x00, 0x00, 0x2d,
    0x03, 0x00, // client_version: SSL 3.0
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
    0x00, 0x02, 0x00, 0x56, // TLS_RSA_EXPORT1024_WITH_RC4_56_SHA (0x0056)
    0x01, 0x00,
];

/// `smb_set_hello_v1`: a raw SMBv1 `Negotiate Protocol Request` offering only
/// the legacy dialect, used to force the downgrade `hello=smbv1` asks for.
const SMBV1_NEGOTIATE: &[u8] = &[
    0x00, 0x00, 0x00, 0x2f, // NetBIOS session: length
    0xff, 0x53, 0x4d, 0x42, 0x72, // \xffSMBr
    0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x53, 0xc8, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xff, 0xfe, 0x00, 0x00, 0x00, 0x00, 0x0c, 0x00, 0x02, 0x4e,
    0x54, 0x20, 0x4c, 0x4d, 0x20, 0x30, 0x2e, 0x31, 0x32, 0x00,
];

/// Forced TLS hello (`SPEC_FULL.md` §6 `hello=ssl`, and `heartbleed` /
/// `ticketbleed` / `poodle`, which select a vulnerability-probing template
/// and imply `hello=ssl` even without it being set explicitly).
///
/// Grounded on `stack-tcp-core.c`'s `banner_ssl` assignment, which
/// overwrites `banner1->payloads.tcp[i]` for every port regardless of
/// whatever stream would otherwise have been registered there.
#[derive(Debug)]
pub struct SslHelloParser {
    pub probe: TlsProbe,
}

impl ParserStream for SslHelloParser {
    fn name(&self) -> &'static str {
        match self.probe {
            TlsProbe::None => "ssl",
            TlsProbe::Heartbleed => "heartbleed",
            TlsProbe::Ticketbleed => "ticketbleed",
            TlsProbe::Poodle => "poodle",
        }
    }

    fn hello(&self) -> Option<&'static [u8]> {
        Some(match self.probe {
            TlsProbe::None => CLIENT_HELLO_DEFAULT,
            TlsProbe::Heartbleed => CLIENT_HELLO_HEARTBEAT,
            TlsProbe::Ticketbleed => CLIENT_HELLO_TICKETBLEED,
            TlsProbe::Poodle => CLIENT_HELLO_POODLE,
        })
    }

    fn parse(&mut self, tcb: &mut Tcb, data: &[u8]) -> ParseOutcome {
        tcb.banner.extend_from_slice(data);
        ParseOutcome::default()
    }
}

/// Forced HTTP hello (`SPEC_FULL.md` §6 `hello=http` and the `http-*`
/// template options), rendered fresh per connection from
/// `crate::config::HttpTemplate` rather than a static byte buffer, since the
/// template can be mutated by `http-*` options at configuration time.
#[derive(Debug)]
pub struct HttpParser {
    pub template: HttpTemplate,
}

impl ParserStream for HttpParser {
    fn name(&self) -> &'static str {
        "http"
    }

    fn transmit_hello(&self, tcb: &mut Tcb, net: &mut dyn NetApi) -> bool {
        net.send(tcb, &self.template.render(), false);
        true
    }

    fn parse(&mut self, tcb: &mut Tcb, data: &[u8]) -> ParseOutcome {
        tcb.banner.extend_from_slice(data);
        ParseOutcome::default()
    }
}

/// Forced SMBv1 downgrade hello (`SPEC_FULL.md` §6 `hello=smbv1`), grounded
/// on `stack-tcp-core.c`'s `smb_set_hello_v1`.
#[derive(Debug, Default)]
pub struct Smbv1Parser;

impl ParserStream for Smbv1Parser {
    fn name(&self) -> &'static str {
        "smbv1"
    }

    fn hello(&self) -> Option<&'static [u8]> {
        Some(SMBV1_NEGOTIATE)
    }

    fn parse(&mut self, tcb: &mut Tcb, data: &[u8]) -> ParseOutcome {
        tcb.banner.extend_from_slice(data);
        ParseOutcome::default()
    }
}

/// Resolve `config.hello`/`config.tls_probe` into a single parser stream
/// that should override every port's registered stream (`SPEC_FULL.md` §4.I,
/// §6). Mirrors `stack-tcp-core.c`'s `configuration_init`, where
/// `hello=ssl|http|smbv1` and the `heartbleed`/`ticketbleed`/`poodle`
/// options each overwrite `banner1->payloads.tcp[]` for every port rather
/// than leaving the per-port table in place. Returns `None` when neither
/// option is set, meaning the caller's own per-port `parsers` apply as-is.
pub fn forced_parser(config: &Config) -> Option<Box<dyn ParserStream>> {
    if config.tls_probe != TlsProbe::None {
        return Some(Box::new(SslHelloParser { probe: config.tls_probe }));
    }
    match config.hello {
        HelloOverride::None => None,
        HelloOverride::Ssl => Some(Box::new(SslHelloParser { probe: TlsProbe::None })),
        HelloOverride::Http => Some(Box::new(HttpParser { template: config.http.clone() })),
        HelloOverride::Smbv1 => Some(Box::new(Smbv1Parser)),
    }
}
