//! Networking model for SkiffDB.
//!
//! Everything here is I/O-free or in-process: the HTTP/WebSocket upgrade
//! logic is a pure state machine that yields request bytes and classifies
//! response bytes, the BLIP-style message layer is an abstract transport
//! trait, and the loopback transport wires two replicators together inside
//! one process. Real sockets and TLS live with the embedding application.

pub mod address;
pub mod blip;
pub mod cookies;
pub mod headers;
pub mod http;
pub mod loopback;

pub use address::{Address, ProxySpec, ProxyType};
pub use blip::{IncomingRequest, Message, Response, Transport};
pub use cookies::CookieJar;
pub use headers::Headers;
pub use http::{AuthChallenge, AuthChallengeResolver, CookieProvider, Disposition, HttpLogic};
pub use loopback::{LoopbackTransport, loopback_pair};
