use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use skiffdb_core::error::Result;
use skiffdb_core::record::{DocumentFlags, RecordUpdate, keyspace};
use skiffdb_core::store::RecordStore;

use crate::address::Address;
use crate::http::CookieProvider;

const COOKIES_RECORD_ID: &str = "cookies";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Cookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires: Option<u64>,
    secure: bool,
    /// Session cookies stay in memory and are never persisted.
    #[serde(skip, default)]
    session: bool,
}

impl Cookie {
    fn expired(&self, now: u64) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }

    fn matches(&self, address: &Address, now: u64) -> bool {
        if self.expired(now) {
            return false;
        }
        if self.secure && !address.is_secure() {
            return false;
        }
        let host = address.hostname.to_ascii_lowercase();
        let domain_ok = host == self.domain
            || host
                .strip_suffix(&self.domain)
                .is_some_and(|prefix| prefix.ends_with('.'));
        if !domain_ok {
            return false;
        }
        address.path.starts_with(&self.path)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An HTTP cookie jar: collects `Set-Cookie` values from every hop of the
/// handshake, attaches matching cookies to outgoing requests, and can
/// persist its non-session cookies as a reserved record.
#[derive(Default)]
pub struct CookieJar {
    cookies: Mutex<Vec<Cookie>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and stores one `Set-Cookie` header value. Unless
    /// `accept_parent_domain` is set, a `Domain` attribute naming a parent
    /// of the request host is rejected.
    pub fn set_cookie_checked(
        &self,
        address: &Address,
        header_value: &str,
        accept_parent_domain: bool,
    ) {
        let Some(mut cookie) = parse_set_cookie(header_value) else {
            debug!(value = header_value, "ignoring unparseable Set-Cookie");
            return;
        };
        let host = address.hostname.to_ascii_lowercase();
        if cookie.domain.is_empty() {
            cookie.domain = host.clone();
        } else if cookie.domain != host {
            let is_parent = host
                .strip_suffix(&cookie.domain)
                .is_some_and(|prefix| prefix.ends_with('.'));
            if !is_parent || !accept_parent_domain {
                debug!(
                    domain = cookie.domain,
                    host, "rejecting cookie for foreign domain"
                );
                return;
            }
        }
        if cookie.path.is_empty() {
            cookie.path = "/".into();
        }
        let mut cookies = self.cookies.lock().expect("cookie jar lock");
        cookies.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });
        if !cookie.expired(now_secs()) {
            cookies.push(cookie);
        }
    }

    /// Serializes the persistent (non-session, unexpired) cookies.
    fn persistent_cookies(&self) -> Vec<Cookie> {
        let now = now_secs();
        self.cookies
            .lock()
            .expect("cookie jar lock")
            .iter()
            .filter(|c| !c.session && !c.expired(now))
            .cloned()
            .collect()
    }

    /// Saves persistent cookies to the reserved cookies keyspace.
    pub async fn save(&self, store: &dyn RecordStore) -> Result<()> {
        let body = serde_json::to_vec(&self.persistent_cookies())?;
        store
            .set(
                keyspace::COOKIES,
                RecordUpdate {
                    doc_id: COOKIES_RECORD_ID.into(),
                    version: vec![1],
                    body,
                    extras: Vec::new(),
                    flags: DocumentFlags::NONE,
                    new_sequence: true,
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Loads previously persisted cookies, merging them into the jar.
    pub async fn load(&self, store: &dyn RecordStore) -> Result<()> {
        let Some(record) = store
            .get(
                keyspace::COOKIES,
                COOKIES_RECORD_ID,
                skiffdb_core::record::ContentLevel::EntireBody,
            )
            .await?
        else {
            return Ok(());
        };
        let loaded: Vec<Cookie> = serde_json::from_slice(&record.body)?;
        let mut cookies = self.cookies.lock().expect("cookie jar lock");
        for cookie in loaded {
            if !cookies
                .iter()
                .any(|c| c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
            {
                cookies.push(cookie);
            }
        }
        Ok(())
    }
}

impl CookieProvider for CookieJar {
    fn cookies_for_request(&self, address: &Address) -> Option<String> {
        let now = now_secs();
        let cookies = self.cookies.lock().expect("cookie jar lock");
        let header = cookies
            .iter()
            .filter(|c| c.matches(address, now))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ");
        (!header.is_empty()).then_some(header)
    }

    fn set_cookie(&self, address: &Address, header_value: &str) {
        self.set_cookie_checked(address, header_value, false);
    }
}

fn parse_set_cookie(value: &str) -> Option<Cookie> {
    let mut parts = value.split(';');
    let (name, val) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let mut cookie = Cookie {
        name: name.to_string(),
        value: val.trim().to_string(),
        domain: String::new(),
        path: String::new(),
        expires: None,
        secure: false,
        session: true,
    };
    for attr in parts {
        let (key, attr_value) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attr.trim(), ""),
        };
        if key.eq_ignore_ascii_case("domain") {
            cookie.domain = attr_value.trim_start_matches('.').to_ascii_lowercase();
        } else if key.eq_ignore_ascii_case("path") {
            cookie.path = attr_value.to_string();
        } else if key.eq_ignore_ascii_case("max-age") {
            if let Ok(secs) = attr_value.parse::<i64>() {
                cookie.session = false;
                cookie.expires = Some(if secs <= 0 {
                    0
                } else {
                    now_secs() + secs as u64
                });
            }
        } else if key.eq_ignore_ascii_case("secure") {
            cookie.secure = true;
        }
    }
    Some(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(url: &str) -> Address {
        Address::from_url(url).unwrap()
    }

    #[test]
    fn basic_set_and_get() {
        let jar = CookieJar::new();
        let a = addr("wss://db.example.com/mydb");
        jar.set_cookie(&a, "SyncGatewaySession=abc123; Path=/");
        assert_eq!(
            jar.cookies_for_request(&a),
            Some("SyncGatewaySession=abc123".into())
        );
    }

    #[test]
    fn domain_scoping() {
        let jar = CookieJar::new();
        let a = addr("wss://db.example.com/mydb");
        jar.set_cookie(&a, "s=1; Domain=example.com");
        // Parent-domain cookies need explicit permission.
        assert_eq!(jar.cookies_for_request(&a), None);

        jar.set_cookie_checked(&a, "s=1; Domain=example.com", true);
        assert_eq!(jar.cookies_for_request(&a), Some("s=1".into()));
        // ...and match sibling hosts under the parent domain.
        assert_eq!(
            jar.cookies_for_request(&addr("wss://other.example.com/db")),
            Some("s=1".into())
        );
        // But not unrelated hosts.
        assert_eq!(jar.cookies_for_request(&addr("wss://example.org/db")), None);
    }

    #[test]
    fn foreign_domain_rejected() {
        let jar = CookieJar::new();
        let a = addr("wss://db.example.com/mydb");
        jar.set_cookie_checked(&a, "evil=1; Domain=attacker.com", true);
        assert_eq!(jar.cookies_for_request(&addr("wss://attacker.com/")), None);
    }

    #[test]
    fn secure_cookies_need_tls() {
        let jar = CookieJar::new();
        let secure = addr("wss://h/db");
        jar.set_cookie(&secure, "s=1; Secure");
        assert_eq!(jar.cookies_for_request(&secure), Some("s=1".into()));
        assert_eq!(jar.cookies_for_request(&addr("ws://h/db")), None);
    }

    #[test]
    fn max_age_expiry_and_overwrite() {
        let jar = CookieJar::new();
        let a = addr("wss://h/db");
        jar.set_cookie(&a, "s=1");
        jar.set_cookie(&a, "s=2");
        assert_eq!(jar.cookies_for_request(&a), Some("s=2".into()));
        // Max-Age=0 deletes.
        jar.set_cookie(&a, "s=gone; Max-Age=0");
        assert_eq!(jar.cookies_for_request(&a), None);
    }

    #[test]
    fn path_scoping() {
        let jar = CookieJar::new();
        let a = addr("wss://h/db/sub");
        jar.set_cookie(&a, "p=1; Path=/db");
        assert_eq!(jar.cookies_for_request(&addr("wss://h/db/other")), Some("p=1".into()));
        assert_eq!(jar.cookies_for_request(&addr("wss://h/elsewhere")), None);
    }

    #[tokio::test]
    async fn persistence_skips_session_cookies() {
        use skiffdb_store_memory_shim::MemoryStoreShim;

        let jar = CookieJar::new();
        let a = addr("wss://h/db");
        jar.set_cookie(&a, "session=x");
        jar.set_cookie(&a, "durable=y; Max-Age=3600");

        let store = MemoryStoreShim::new();
        jar.save(&store).await.unwrap();

        let restored = CookieJar::new();
        restored.load(&store).await.unwrap();
        assert_eq!(restored.cookies_for_request(&a), Some("durable=y".into()));
    }

    /// A tiny single-record store; the real memory store lives in a crate
    /// that depends on this one, so tests can't use it here.
    mod skiffdb_store_memory_shim {
        use async_trait::async_trait;
        use std::sync::Mutex;
        use uuid::Uuid;

        use skiffdb_core::changes::{ChangeNotifier, ChangeReceiver};
        use skiffdb_core::error::Result;
        use skiffdb_core::record::{ContentLevel, Record, RecordUpdate, SetResult};
        use skiffdb_core::store::RecordStore;

        pub struct MemoryStoreShim {
            uuid: Uuid,
            record: Mutex<Option<Record>>,
            notifier: ChangeNotifier,
        }

        impl MemoryStoreShim {
            pub fn new() -> Self {
                MemoryStoreShim {
                    uuid: Uuid::new_v4(),
                    record: Mutex::new(None),
                    notifier: ChangeNotifier::default(),
                }
            }
        }

        #[async_trait]
        impl RecordStore for MemoryStoreShim {
            fn uuid(&self) -> Uuid {
                self.uuid
            }

            async fn get(
                &self,
                _keyspace: &str,
                doc_id: &str,
                _content: ContentLevel,
            ) -> Result<Option<Record>> {
                Ok(self
                    .record
                    .lock()
                    .unwrap()
                    .clone()
                    .filter(|r| r.doc_id == doc_id))
            }

            async fn get_by_sequence(&self, _k: &str, _s: u64) -> Result<Option<Record>> {
                Ok(None)
            }

            async fn set(
                &self,
                _keyspace: &str,
                update: RecordUpdate,
                _expecting: Option<(u64, u64)>,
            ) -> Result<SetResult> {
                let mut record = Record::new(update.doc_id);
                record.version = update.version;
                record.body = update.body;
                record.sequence = 1;
                *self.record.lock().unwrap() = Some(record);
                Ok(SetResult::Stored { sequence: 1, subsequence: 0 })
            }

            async fn enumerate(&self, _k: &str, _s: u64, _l: usize) -> Result<Vec<Record>> {
                Ok(Vec::new())
            }

            async fn last_sequence(&self, _k: &str) -> Result<u64> {
                Ok(1)
            }

            async fn purge(&self, _k: &str, _d: &str) -> Result<bool> {
                Ok(false)
            }

            async fn begin_transaction(&self) -> Result<()> {
                Ok(())
            }

            async fn commit(&self) -> Result<()> {
                Ok(())
            }

            async fn abort(&self) -> Result<()> {
                Ok(())
            }

            fn subscribe_changes(&self) -> ChangeReceiver {
                self.notifier.subscribe()
            }
        }
    }
}
