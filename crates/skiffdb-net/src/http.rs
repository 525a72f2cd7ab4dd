use std::fmt::Write as _;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use sha1::{Digest, Sha1};
use tracing::debug;

use skiffdb_core::error::{Error, NetworkError};

use crate::address::{Address, ProxySpec, ProxyType};
use crate::headers::Headers;

/// WebSocket close code for protocol errors.
pub const WS_CLOSE_PROTOCOL_ERROR: u16 = 1002;

const MAX_REDIRECTS: u32 = 10;
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// HTTP status codes the upgrade logic dispatches on.
pub mod status {
    pub const SWITCHING_PROTOCOLS: u16 = 101;
    pub const MOVED_PERMANENTLY: u16 = 301;
    pub const FOUND: u16 = 302;
    pub const USE_PROXY: u16 = 305;
    pub const TEMPORARY_REDIRECT: u16 = 307;
    pub const UNAUTHORIZED: u16 = 401;
    pub const PROXY_AUTH_REQUIRED: u16 = 407;

    pub fn is_success(code: u16) -> bool {
        (200..300).contains(&code)
    }
}

/// What to do after a response has been classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Give up and check [`HttpLogic::error`].
    Failure,
    /// Try again with a new socket and a fresh request.
    Retry,
    /// Add credentials and retry, or give up.
    Authenticate,
    /// Send the next request on the *same* socket (CONNECT tunnel opened).
    Continue,
    /// Done; for WebSocket requests the connection is upgraded.
    Success,
}

/// An authentication challenge from the server or a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub address: Address,
    pub for_proxy: bool,
    /// Auth scheme, e.g. "Basic".
    pub auth_type: String,
    /// Challenge parameter name, e.g. "realm".
    pub key: String,
    pub value: String,
}

/// Cookie storage attached to the request logic.
pub trait CookieProvider: Send + Sync {
    fn cookies_for_request(&self, address: &Address) -> Option<String>;
    fn set_cookie(&self, address: &Address, header_value: &str);
}

/// Resolves an auth challenge to `(username, password)` credentials, or
/// `None` to give up.
pub type AuthChallengeResolver =
    Arc<dyn Fn(&AuthChallenge) -> Option<(String, String)> + Send + Sync>;

/// Implements the request/response logic of the HTTP layer — redirects,
/// auth challenges, proxy tunnelling, the WebSocket handshake — without
/// doing any networking. Callers send the bytes of [`request_to_send`],
/// feed the response head to [`received_response`], and branch on the
/// returned [`Disposition`].
pub struct HttpLogic {
    address: Address,
    handle_redirects: bool,
    is_websocket: bool,
    request_headers: Headers,
    user_agent: Option<String>,
    content_length: Option<u64>,
    auth_header: Option<String>,
    auth_resolver: Option<AuthChallengeResolver>,
    cookie_provider: Option<Arc<dyn CookieProvider>>,
    proxy: Option<ProxySpec>,

    error: Option<Error>,
    http_status: u16,
    status_message: String,
    response_headers: Headers,
    redirect_count: u32,
    auth_challenged: bool,
    auth_challenge: Option<AuthChallenge>,
    last_disposition: Disposition,

    ws_protocol: Option<String>,
    ws_nonce: Option<String>,
}

impl HttpLogic {
    pub fn new(address: Address, request_headers: Headers) -> Self {
        let is_websocket = address.is_websocket();
        HttpLogic {
            address,
            handle_redirects: true,
            is_websocket,
            request_headers,
            user_agent: None,
            content_length: None,
            auth_header: None,
            auth_resolver: None,
            cookie_provider: None,
            proxy: None,
            error: None,
            http_status: 0,
            status_message: String::new(),
            response_headers: Headers::new(),
            redirect_count: 0,
            auth_challenged: false,
            auth_challenge: None,
            last_disposition: Disposition::Success,

            ws_protocol: None,
            ws_nonce: None,
        }
    }

    // ---- Setup ------------------------------------------------------------

    pub fn set_handle_redirects(&mut self, handle: bool) {
        self.handle_redirects = handle;
    }

    pub fn set_user_agent(&mut self, ua: impl Into<String>) {
        self.user_agent = Some(ua.into());
    }

    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = Some(length);
    }

    /// The WebSocket subprotocol offer for the `Sec-WebSocket-Protocol`
    /// header; also forces WebSocket handshake mode.
    pub fn set_web_socket_protocol(&mut self, protocol: impl Into<String>) {
        self.ws_protocol = Some(protocol.into());
        self.is_websocket = true;
    }

    pub fn set_auth_header(&mut self, header: Option<String>) {
        self.auth_header = header;
    }

    pub fn auth_header(&self) -> Option<&str> {
        self.auth_header.as_deref()
    }

    /// Installs a credentials callback. With one set, an `Authenticate`
    /// disposition is handled internally: the resolver's credentials become
    /// the next request's auth header and the caller just sees `Retry`.
    pub fn set_auth_resolver(&mut self, resolver: AuthChallengeResolver) {
        self.auth_resolver = Some(resolver);
    }

    pub fn set_cookie_provider(&mut self, provider: Arc<dyn CookieProvider>) {
        self.cookie_provider = Some(provider);
    }

    pub fn set_proxy(&mut self, proxy: Option<ProxySpec>) {
        self.proxy = proxy;
    }

    pub fn proxy(&self) -> Option<&ProxySpec> {
        self.proxy.as_ref()
    }

    /// Generates a Basic `Authorization` header value.
    pub fn basic_auth(username: &str, password: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
    }

    // ---- Request ----------------------------------------------------------

    /// The logical target (changes on redirect). Not what you open a TCP
    /// connection to; see [`direct_address`](Self::direct_address).
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The host to actually connect to, proxy included.
    pub fn direct_address(&self) -> Address {
        match &self.proxy {
            Some(p) => p.address(),
            None => self.address.clone(),
        }
    }

    fn connecting_to_proxy(&self) -> bool {
        self.proxy.is_some()
            && self.is_websocket
            && self.last_disposition != Disposition::Continue
    }

    /// Encodes the next HTTP request head (no body). For WebSocket requests
    /// this mints the `Sec-WebSocket-Key` nonce the accept check validates.
    pub fn request_to_send(&mut self) -> String {
        let mut rq = String::new();
        if self.connecting_to_proxy() {
            // CONNECT tunnel; the proxy never sees the real request.
            let _ = write!(
                rq,
                "CONNECT {}:{} HTTP/1.1\r\n",
                self.address.hostname, self.address.port
            );
        } else if self.proxy.as_ref().is_some_and(|p| p.proxy_type == ProxyType::Http)
            && !self.is_websocket
        {
            let _ = write!(rq, "GET {} HTTP/1.1\r\n", self.address.url());
        } else {
            let _ = write!(rq, "GET {} HTTP/1.1\r\n", self.address.path);
        }
        let _ = write!(rq, "Host: {}:{}\r\n", self.address.hostname, self.address.port);
        if let Some(ua) = &self.user_agent {
            let _ = write!(rq, "User-Agent: {ua}\r\n");
        }
        if let Some(proxy) = &self.proxy
            && let (Some(user), Some(pass)) = (&proxy.username, &proxy.password)
        {
            let _ = write!(rq, "Proxy-Authorization: {}\r\n", Self::basic_auth(user, pass));
        }
        if !self.connecting_to_proxy() {
            // Don't volunteer credentials until challenged.
            if self.auth_challenged
                && let Some(auth) = &self.auth_header
            {
                let _ = write!(rq, "Authorization: {auth}\r\n");
            }
            if let Some(provider) = &self.cookie_provider
                && let Some(cookies) = provider.cookies_for_request(&self.address)
                && !cookies.is_empty()
            {
                let _ = write!(rq, "Cookie: {cookies}\r\n");
            }
            if let Some(len) = self.content_length {
                let _ = write!(rq, "Content-Length: {len}\r\n");
            }
            for (name, value) in self.request_headers.iter() {
                let _ = write!(rq, "{name}: {value}\r\n");
            }
            if self.is_websocket {
                let nonce = STANDARD.encode(rand::random::<[u8; 16]>());
                let _ = write!(
                    rq,
                    "Connection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {nonce}\r\n"
                );
                if let Some(protocol) = &self.ws_protocol {
                    let _ = write!(rq, "Sec-WebSocket-Protocol: {protocol}\r\n");
                }
                self.ws_nonce = Some(nonce);
            }
        }
        rq.push_str("\r\n");
        rq
    }

    // ---- Response ---------------------------------------------------------

    pub fn status(&self) -> u16 {
        self.http_status
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    /// The fatal error of the last response, when the disposition was
    /// `Failure`.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Details of the challenge when the disposition is `Authenticate`.
    pub fn auth_challenge(&self) -> Option<&AuthChallenge> {
        self.auth_challenge.as_ref()
    }

    /// Classifies a received response head (everything through the blank
    /// line) and decides what to do next.
    pub fn received_response(&mut self, response: &[u8]) -> Disposition {
        self.http_status = 0;
        self.status_message.clear();
        self.response_headers.clear();
        self.error = None;
        self.auth_challenge = None;

        let text = match std::str::from_utf8(response) {
            Ok(t) => t,
            Err(_) => {
                return self.fail_ws(400, "received invalid HTTP");
            }
        };
        let mut lines = text.split("\r\n");
        if !self.parse_status_line(lines.next().unwrap_or("")) {
            return self.fail_ws(400, "received invalid HTTP");
        }
        if !Self::parse_header_lines(lines, &mut self.response_headers) {
            return self.fail_ws(400, "received invalid HTTP");
        }
        self.last_disposition = self.handle_response();
        self.last_disposition
    }

    fn parse_status_line(&mut self, line: &str) -> bool {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        let status = parts.next().and_then(|s| s.parse::<u16>().ok());
        if !version.starts_with("HTTP/") {
            return false;
        }
        match status {
            Some(code) if code >= 100 => {
                self.http_status = code;
                self.status_message = parts.next().unwrap_or("").to_string();
                true
            }
            _ => false,
        }
    }

    fn parse_header_lines<'a>(
        lines: impl Iterator<Item = &'a str>,
        headers: &mut Headers,
    ) -> bool {
        for line in lines {
            if line.is_empty() {
                return true;
            }
            let Some((name, value)) = line.split_once(':') else {
                return false;
            };
            headers.add(name.trim(), value.trim_start());
        }
        true
    }

    fn handle_response(&mut self) -> Disposition {
        if let Some(provider) = &self.cookie_provider
            && !self.connecting_to_proxy()
        {
            for cookie in self.response_headers.get_all("Set-Cookie") {
                provider.set_cookie(&self.address, cookie);
            }
        }

        match self.http_status {
            status::MOVED_PERMANENTLY
            | status::FOUND
            | status::TEMPORARY_REDIRECT
            | status::USE_PROXY => self.handle_redirect(),
            status::UNAUTHORIZED => {
                if self.auth_challenged {
                    // Our credentials were refused; clear them and surface
                    // the challenge again.
                    self.auth_header = None;
                } else {
                    self.auth_challenged = true;
                }
                self.handle_auth_challenge("Www-Authenticate", false)
            }
            status::PROXY_AUTH_REQUIRED => {
                if let Some(proxy) = &mut self.proxy {
                    proxy.username = None;
                    proxy.password = None;
                    self.handle_auth_challenge("Proxy-Authenticate", true)
                } else {
                    self.fail_status()
                }
            }
            status::SWITCHING_PROTOCOLS => self.handle_upgrade(),
            code => {
                if !status::is_success(code) {
                    self.fail_status()
                } else if self.connecting_to_proxy() {
                    // Tunnel open: wrap TLS if needed and send the real
                    // request on this same socket.
                    Disposition::Continue
                } else if self.is_websocket {
                    self.fail_ws(
                        WS_CLOSE_PROTOCOL_ERROR,
                        "server failed to upgrade connection",
                    )
                } else {
                    Disposition::Success
                }
            }
        }
    }

    fn handle_redirect(&mut self) -> Disposition {
        if !self.handle_redirects {
            return self.fail_status();
        }
        self.redirect_count += 1;
        if self.redirect_count > MAX_REDIRECTS {
            return self.fail_net(NetworkError::TooManyRedirects, "too many redirects");
        }

        let location = self.response_headers.get("Location").unwrap_or("").to_string();
        let new_address = if location.starts_with('/') {
            Address::new(
                self.address.scheme.clone(),
                self.address.hostname.clone(),
                self.address.port,
                location,
            )
        } else {
            match Address::from_url(&location) {
                Ok(a) => a,
                Err(_) => {
                    return self.fail_net(NetworkError::InvalidRedirect, "invalid redirect");
                }
            }
        };

        if self.http_status == status::USE_PROXY {
            if self.proxy.is_some() {
                return self.fail_status();
            }
            self.proxy = Some(ProxySpec::from_address(ProxyType::Http, &new_address));
        } else {
            if new_address.hostname != self.address.hostname {
                // Never replay credentials to a different host.
                self.auth_header = None;
            }
            debug!(from = %self.address, to = %new_address, "following redirect");
            // Redirects from http(s) keep the original ws(s) scheme.
            let scheme = if self.is_websocket && !new_address.is_websocket() {
                if new_address.is_secure() { "wss" } else { "ws" }.to_string()
            } else {
                new_address.scheme.clone()
            };
            self.address = Address::new(
                scheme,
                new_address.hostname,
                new_address.port,
                new_address.path,
            );
        }
        Disposition::Retry
    }

    fn handle_auth_challenge(&mut self, header: &str, for_proxy: bool) -> Disposition {
        let value = self.response_headers.get(header).unwrap_or("").to_string();
        // e.g. `Basic realm="Sync"`.
        let re = Regex::new(r#"(\w+)\s+(\w+)=(?:(\w+)|"([^"]+)")"#).expect("valid regex");
        let Some(caps) = re.captures(&value) else {
            return self.fail_status();
        };
        let address = if for_proxy {
            self.proxy
                .as_ref()
                .map(|p| p.address())
                .unwrap_or_else(|| self.address.clone())
        } else {
            self.address.clone()
        };
        let challenge = AuthChallenge {
            address,
            for_proxy,
            auth_type: caps[1].to_string(),
            key: caps[2].to_string(),
            value: caps
                .get(3)
                .or(caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        };
        if !for_proxy {
            self.auth_challenged = true;
        }
        if let Some(resolver) = &self.auth_resolver
            && let Some((username, password)) = resolver(&challenge)
        {
            if for_proxy {
                if let Some(proxy) = &mut self.proxy {
                    proxy.username = Some(username);
                    proxy.password = Some(password);
                }
            } else {
                self.auth_header = Some(Self::basic_auth(&username, &password));
            }
            return Disposition::Retry;
        }
        self.auth_challenge = Some(challenge);
        Disposition::Authenticate
    }

    fn handle_upgrade(&mut self) -> Disposition {
        if !self.is_websocket {
            return self.fail_ws(WS_CLOSE_PROTOCOL_ERROR, "unexpected upgrade");
        }
        let connection_ok = self
            .response_headers
            .get("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("upgrade"));
        let upgrade_ok = self
            .response_headers
            .get("Upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if !connection_ok || !upgrade_ok {
            return self.fail_ws(
                WS_CLOSE_PROTOCOL_ERROR,
                "server failed to upgrade connection",
            );
        }
        if let Some(offered) = &self.ws_protocol {
            let accepted = self.response_headers.get("Sec-WebSocket-Protocol");
            let acceptable = accepted
                .is_some_and(|a| offered.split(',').map(str::trim).any(|p| p == a));
            if !acceptable {
                return self.fail_ws(403, "server did not accept protocol");
            }
        }
        let nonce = self.ws_nonce.clone().unwrap_or_default();
        if self.response_headers.get("Sec-WebSocket-Accept")
            != Some(web_socket_key_response(&nonce).as_str())
        {
            return self.fail_ws(WS_CLOSE_PROTOCOL_ERROR, "server returned invalid nonce");
        }
        Disposition::Success
    }

    /// The subprotocol the server accepted, after a successful upgrade.
    pub fn accepted_protocol(&self) -> Option<&str> {
        self.response_headers.get("Sec-WebSocket-Protocol")
    }

    fn fail_ws(&mut self, code: u16, message: &str) -> Disposition {
        self.error = Some(Error::WebSocket {
            code,
            message: message.to_string(),
        });
        Disposition::Failure
    }

    fn fail_net(&mut self, code: NetworkError, message: &str) -> Disposition {
        self.error = Some(Error::Network {
            code,
            message: message.to_string(),
        });
        Disposition::Failure
    }

    fn fail_status(&mut self) -> Disposition {
        self.error = Some(Error::WebSocket {
            code: self.http_status,
            message: self.status_message.clone(),
        });
        Disposition::Failure
    }
}

/// Computes the `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn web_socket_key_response(nonce: &str) -> String {
    let digest = Sha1::digest(format!("{nonce}{WS_GUID}").as_bytes());
    STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws_logic(url: &str) -> HttpLogic {
        let mut logic = HttpLogic::new(Address::from_url(url).unwrap(), Headers::new());
        logic.set_web_socket_protocol("BLIP_3+CBMobile_3,BLIP_3+CBMobile_2");
        logic
    }

    fn extract_nonce(request: &str) -> String {
        request
            .lines()
            .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
            .expect("request has a WS key")
            .to_string()
    }

    fn upgrade_response(nonce: &str, protocol: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {}\r\nSec-WebSocket-Protocol: {}\r\n\r\n",
            web_socket_key_response(nonce),
            protocol
        )
        .into_bytes()
    }

    #[test]
    fn websocket_handshake_succeeds() {
        let mut logic = ws_logic("wss://h/db");
        let request = logic.request_to_send();
        assert!(request.starts_with("GET /db HTTP/1.1\r\n"));
        assert!(request.contains("Upgrade: websocket\r\n"));
        let nonce = extract_nonce(&request);

        let d = logic.received_response(&upgrade_response(&nonce, "BLIP_3+CBMobile_3"));
        assert_eq!(d, Disposition::Success);
        assert_eq!(logic.accepted_protocol(), Some("BLIP_3+CBMobile_3"));
    }

    #[test]
    fn tampered_accept_key_is_protocol_error() {
        let mut logic = ws_logic("wss://h/db");
        let request = logic.request_to_send();
        let _ = extract_nonce(&request);

        let d = logic.received_response(&upgrade_response("bogusnonce", "BLIP_3+CBMobile_3"));
        assert_eq!(d, Disposition::Failure);
        match logic.take_error() {
            Some(Error::WebSocket { code, .. }) => assert_eq!(code, WS_CLOSE_PROTOCOL_ERROR),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unknown_protocol_echo_is_refused() {
        let mut logic = ws_logic("wss://h/db");
        let request = logic.request_to_send();
        let nonce = extract_nonce(&request);
        let d = logic.received_response(&upgrade_response(&nonce, "BLIP_9+Other"));
        assert_eq!(d, Disposition::Failure);
    }

    #[test]
    fn redirect_then_auth_then_success() {
        // Scenario: 301 to another host, then 401 Basic, then upgrade.
        let mut logic = ws_logic("wss://h1/db");
        let _ = logic.request_to_send();
        let d = logic.received_response(
            b"HTTP/1.1 301 Moved Permanently\r\nLocation: wss://h2/db\r\n\r\n",
        );
        assert_eq!(d, Disposition::Retry);
        assert_eq!(logic.address().hostname, "h2");

        let _ = logic.request_to_send();
        let d = logic.received_response(
            b"HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: Basic realm=\"r\"\r\n\r\n",
        );
        assert_eq!(d, Disposition::Authenticate);
        let challenge = logic.auth_challenge().unwrap().clone();
        assert_eq!(challenge.auth_type, "Basic");
        assert_eq!(challenge.key, "realm");
        assert_eq!(challenge.value, "r");
        assert!(!challenge.for_proxy);

        logic.set_auth_header(Some(HttpLogic::basic_auth("user", "pass")));
        let request = logic.request_to_send();
        assert!(request.contains(&format!(
            "Authorization: {}\r\n",
            HttpLogic::basic_auth("user", "pass")
        )));
        let nonce = extract_nonce(&request);
        let d = logic.received_response(&upgrade_response(&nonce, "BLIP_3+CBMobile_3"));
        assert_eq!(d, Disposition::Success);
    }

    #[test]
    fn auth_resolver_supplies_credentials_inline() {
        let mut logic = ws_logic("wss://h/db");
        logic.set_auth_resolver(Arc::new(|challenge: &AuthChallenge| {
            assert_eq!(challenge.auth_type, "Basic");
            Some(("user".to_string(), "pass".to_string()))
        }));
        let _ = logic.request_to_send();
        let d = logic.received_response(
            b"HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: Basic realm=\"r\"\r\n\r\n",
        );
        // The challenge was resolved internally; just retry.
        assert_eq!(d, Disposition::Retry);
        let request = logic.request_to_send();
        assert!(request.contains(&format!(
            "Authorization: {}\r\n",
            HttpLogic::basic_auth("user", "pass")
        )));
    }

    #[test]
    fn redirect_to_new_host_drops_credentials() {
        let mut logic = ws_logic("wss://h1/db");
        let _ = logic.request_to_send();
        logic.received_response(
            b"HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: Basic realm=\"r\"\r\n\r\n",
        );
        logic.set_auth_header(Some(HttpLogic::basic_auth("u", "p")));
        let request = logic.request_to_send();
        assert!(request.contains("Authorization: "));

        logic.received_response(b"HTTP/1.1 302 Found\r\nLocation: wss://other/db\r\n\r\n");
        let request = logic.request_to_send();
        assert!(!request.contains("Authorization: "));
    }

    #[test]
    fn redirect_loop_fails_after_ten() {
        let mut logic = ws_logic("wss://h/db");
        for i in 0..10 {
            let _ = logic.request_to_send();
            let d = logic
                .received_response(b"HTTP/1.1 302 Found\r\nLocation: wss://h/db\r\n\r\n");
            assert_eq!(d, Disposition::Retry, "redirect {i} should retry");
        }
        let _ = logic.request_to_send();
        let d = logic.received_response(b"HTTP/1.1 302 Found\r\nLocation: wss://h/db\r\n\r\n");
        assert_eq!(d, Disposition::Failure);
        match logic.take_error() {
            Some(Error::Network { code, .. }) => {
                assert_eq!(code, NetworkError::TooManyRedirects)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn proxy_connect_tunnel() {
        // Scenario: CONNECT through http://p:3128 to wss://x/db.
        let mut logic = ws_logic("wss://x/db");
        logic.set_proxy(Some(ProxySpec::new(ProxyType::Http, "p", 3128)));
        assert_eq!(logic.direct_address().hostname, "p");

        let request = logic.request_to_send();
        assert!(request.starts_with("CONNECT x:443 HTTP/1.1\r\n"));
        // The proxy must never see the WebSocket key.
        assert!(!request.contains("Sec-WebSocket-Key"));

        let d = logic.received_response(b"HTTP/1.1 200 Connection established\r\n\r\n");
        assert_eq!(d, Disposition::Continue);

        // Now the real upgrade goes through the tunnel.
        let request = logic.request_to_send();
        assert!(request.starts_with("GET /db HTTP/1.1\r\n"));
        assert!(request.contains("Sec-WebSocket-Key"));
        let nonce = extract_nonce(&request);
        let d = logic.received_response(&upgrade_response(&nonce, "BLIP_3+CBMobile_3"));
        assert_eq!(d, Disposition::Success);
    }

    #[test]
    fn proxy_auth_challenge() {
        let mut logic = ws_logic("wss://x/db");
        let mut proxy = ProxySpec::new(ProxyType::Http, "p", 3128);
        proxy.username = Some("u".into());
        proxy.password = Some("wrong".into());
        logic.set_proxy(Some(proxy));

        let request = logic.request_to_send();
        assert!(request.contains("Proxy-Authorization: "));
        let d = logic.received_response(
            b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"p\"\r\n\r\n",
        );
        assert_eq!(d, Disposition::Authenticate);
        let challenge = logic.auth_challenge().unwrap();
        assert!(challenge.for_proxy);
        // Bad proxy credentials were discarded.
        assert!(logic.proxy().unwrap().username.is_none());
    }

    #[test]
    fn second_unauthorized_clears_credentials() {
        let mut logic = ws_logic("wss://h/db");
        let _ = logic.request_to_send();
        logic.received_response(
            b"HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: Basic realm=\"r\"\r\n\r\n",
        );
        logic.set_auth_header(Some(HttpLogic::basic_auth("u", "bad")));
        let _ = logic.request_to_send();
        let d = logic.received_response(
            b"HTTP/1.1 401 Unauthorized\r\nWww-Authenticate: Basic realm=\"r\"\r\n\r\n",
        );
        assert_eq!(d, Disposition::Authenticate);
        assert!(logic.auth_header().is_none());
    }

    #[test]
    fn plain_failure_statuses() {
        let mut logic = ws_logic("wss://h/db");
        let _ = logic.request_to_send();
        let d = logic.received_response(b"HTTP/1.1 404 Not Found\r\n\r\n");
        assert_eq!(d, Disposition::Failure);
        match logic.take_error() {
            Some(Error::WebSocket { code, .. }) => assert_eq!(code, 404),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn garbage_response_is_invalid_http() {
        let mut logic = ws_logic("wss://h/db");
        let d = logic.received_response(b"SPEAK FRIEND AND ENTER\r\n\r\n");
        assert_eq!(d, Disposition::Failure);
    }

    #[test]
    fn accept_key_computation_matches_rfc() {
        // The RFC 6455 §1.3 worked example.
        assert_eq!(
            web_socket_key_response("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
