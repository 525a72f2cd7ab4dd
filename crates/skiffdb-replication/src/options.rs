use std::time::Duration;

use serde_json::Value;

use skiffdb_net::address::ProxySpec;
use skiffdb_net::headers::Headers;

use crate::encryption::{PropertyDecryptor, PropertyEncryptor};
use crate::events::ReplicationFilter;

/// What a replicator does in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationMode {
    #[default]
    Disabled,
    OneShot,
    Continuous,
    /// Answer the peer's requests only; never originate.
    Passive,
}

impl ReplicationMode {
    pub fn is_active(self) -> bool {
        matches!(self, ReplicationMode::OneShot | ReplicationMode::Continuous)
    }

    pub fn is_continuous(self) -> bool {
        self == ReplicationMode::Continuous
    }
}

/// How pulled conflicts are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Store both sides, flag the document, surface a conflict event for
    /// the application to resolve.
    #[default]
    Manual,
    /// Vector mode only: pick a winner deterministically (higher time at
    /// the local source, then larger source ID) and keep the loser as
    /// remote state.
    AutoTieBreak,
}

/// Authentication credentials from the `auth` options dict.
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    pub auth_type: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub client_cert: Option<Vec<u8>>,
    pub client_cert_key: Option<Vec<u8>>,
}

/// Replicator configuration. The JSON option keys of the public API map
/// onto these fields verbatim; callbacks are attached programmatically.
#[derive(Clone)]
pub struct ReplicatorOptions {
    pub push: ReplicationMode,
    pub pull: ReplicationMode,

    pub doc_ids: Option<Vec<String>>,
    pub channels: Option<Vec<String>>,
    pub filter: Option<String>,
    pub filter_params: Option<Value>,
    pub skip_deleted: bool,
    pub no_incoming_conflicts: bool,
    pub checkpoint_interval: Duration,
    pub remote_db_unique_id: Option<String>,
    pub no_deltas: bool,
    pub no_decryption: bool,
    pub max_retries: u32,
    pub max_retry_interval: Duration,
    pub auto_purge: bool,
    /// PEM/DER anchor certificates handed to the TLS layer.
    pub root_certs: Option<Vec<u8>>,
    /// A specific server certificate the TLS layer must find in the chain.
    pub pinned_cert: Option<Vec<u8>>,
    pub only_self_signed_server: bool,
    pub headers: Headers,
    pub cookies: Option<String>,
    pub auth: Option<AuthOptions>,
    pub proxy: Option<ProxySpec>,
    pub heartbeat: Duration,
    pub ws_protocols: Option<String>,
    pub network_interface: Option<String>,
    pub compression_level: i8,
    pub conflict_policy: ConflictPolicy,
    /// Branch-depth cap applied to tree-mode documents after pulls.
    pub prune_depth: usize,

    pub push_filter: Option<ReplicationFilter>,
    pub pull_filter: Option<ReplicationFilter>,
    pub property_encryptor: Option<PropertyEncryptor>,
    pub property_decryptor: Option<PropertyDecryptor>,
}

impl Default for ReplicatorOptions {
    fn default() -> Self {
        ReplicatorOptions {
            push: ReplicationMode::Disabled,
            pull: ReplicationMode::Disabled,
            doc_ids: None,
            channels: None,
            filter: None,
            filter_params: None,
            skip_deleted: false,
            no_incoming_conflicts: false,
            checkpoint_interval: Duration::from_millis(500),
            remote_db_unique_id: None,
            no_deltas: false,
            no_decryption: false,
            max_retries: 9,
            max_retry_interval: Duration::from_secs(300),
            auto_purge: true,
            root_certs: None,
            pinned_cert: None,
            only_self_signed_server: false,
            headers: Headers::new(),
            cookies: None,
            auth: None,
            proxy: None,
            heartbeat: Duration::from_secs(300),
            ws_protocols: None,
            network_interface: None,
            compression_level: -1,
            conflict_policy: ConflictPolicy::default(),
            prune_depth: skiffdb_core::rev_tree::DEFAULT_MAX_DEPTH,
            push_filter: None,
            pull_filter: None,
            property_encryptor: None,
            property_decryptor: None,
        }
    }
}

impl ReplicatorOptions {
    pub fn push(mode: ReplicationMode) -> Self {
        ReplicatorOptions {
            push: mode,
            ..Default::default()
        }
    }

    pub fn pull(mode: ReplicationMode) -> Self {
        ReplicatorOptions {
            pull: mode,
            ..Default::default()
        }
    }

    pub fn push_and_pull(push: ReplicationMode, pull: ReplicationMode) -> Self {
        ReplicatorOptions {
            push,
            pull,
            ..Default::default()
        }
    }

    pub fn passive() -> Self {
        ReplicatorOptions {
            push: ReplicationMode::Passive,
            pull: ReplicationMode::Passive,
            ..Default::default()
        }
    }

    pub fn is_continuous(&self) -> bool {
        self.push.is_continuous() || self.pull.is_continuous()
    }

    pub fn is_active(&self) -> bool {
        self.push.is_active() || self.pull.is_active()
    }

    /// Applies an options dict using the public option keys.
    pub fn apply_json(&mut self, dict: &Value) {
        let Some(map) = dict.as_object() else { return };
        for (key, value) in map {
            match key.as_str() {
                "docIDs" => {
                    self.doc_ids = value.as_array().map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    });
                }
                "channels" => {
                    self.channels = value.as_array().map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    });
                }
                "filter" => self.filter = value.as_str().map(str::to_string),
                "filterParams" => self.filter_params = Some(value.clone()),
                "skipDeleted" => self.skip_deleted = value.as_bool().unwrap_or(false),
                "noIncomingConflicts" => {
                    self.no_incoming_conflicts = value.as_bool().unwrap_or(false)
                }
                "checkpointInterval" => {
                    if let Some(secs) = value.as_f64() {
                        self.checkpoint_interval = Duration::from_secs_f64(secs.max(0.0));
                    }
                }
                "remoteDBUniqueID" => {
                    self.remote_db_unique_id = value.as_str().map(str::to_string)
                }
                "noDeltas" => self.no_deltas = value.as_bool().unwrap_or(false),
                "noDecryption" => self.no_decryption = value.as_bool().unwrap_or(false),
                "maxRetries" => {
                    if let Some(n) = value.as_u64() {
                        self.max_retries = n as u32;
                    }
                }
                "maxRetryInterval" => {
                    if let Some(secs) = value.as_u64() {
                        self.max_retry_interval = Duration::from_secs(secs);
                    }
                }
                "autoPurge" => self.auto_purge = value.as_bool().unwrap_or(true),
                "rootCerts" => {
                    self.root_certs = value.as_str().map(|s| s.as_bytes().to_vec());
                }
                "pinnedCert" => {
                    self.pinned_cert = value.as_str().map(|s| s.as_bytes().to_vec());
                }
                "onlySelfSignedServer" => {
                    self.only_self_signed_server = value.as_bool().unwrap_or(false);
                }
                "headers" => {
                    if let Some(map) = value.as_object() {
                        for (name, v) in map {
                            if let Some(v) = v.as_str() {
                                self.headers.set(name, v);
                            }
                        }
                    }
                }
                "cookies" => self.cookies = value.as_str().map(str::to_string),
                "auth" => {
                    let mut auth = AuthOptions::default();
                    if let Some(map) = value.as_object() {
                        auth.auth_type =
                            map.get("type").and_then(Value::as_str).map(str::to_string);
                        auth.username = map
                            .get("username")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        auth.password = map
                            .get("password")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        auth.token =
                            map.get("token").and_then(Value::as_str).map(str::to_string);
                    }
                    self.auth = Some(auth);
                }
                "heartbeat" => {
                    if let Some(secs) = value.as_u64() {
                        self.heartbeat = Duration::from_secs(secs);
                    }
                }
                "WS-Protocols" => self.ws_protocols = value.as_str().map(str::to_string),
                "networkInterface" => {
                    self.network_interface = value.as_str().map(str::to_string)
                }
                "BLIPCompressionLevel" => {
                    if let Some(n) = value.as_i64() {
                        self.compression_level = n as i8;
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_keys_map_verbatim() {
        let mut opts = ReplicatorOptions::push(ReplicationMode::OneShot);
        opts.apply_json(&json!({
            "docIDs": ["a", "b"],
            "channels": ["ch1"],
            "skipDeleted": true,
            "noIncomingConflicts": true,
            "checkpointInterval": 2.5,
            "maxRetries": 3,
            "maxRetryInterval": 60,
            "noDeltas": true,
            "autoPurge": false,
            "heartbeat": 20,
            "headers": {"X-Client": "test"},
            "auth": {"type": "Basic", "username": "u", "password": "p"},
            "unknownKeyIsIgnored": 1,
        }));
        assert_eq!(opts.doc_ids.as_deref(), Some(&["a".to_string(), "b".into()][..]));
        assert_eq!(opts.channels.as_deref().unwrap().len(), 1);
        assert!(opts.skip_deleted);
        assert!(opts.no_incoming_conflicts);
        assert_eq!(opts.checkpoint_interval, Duration::from_secs_f64(2.5));
        assert_eq!(opts.max_retries, 3);
        assert_eq!(opts.max_retry_interval, Duration::from_secs(60));
        assert!(opts.no_deltas);
        assert!(!opts.auto_purge);
        assert_eq!(opts.heartbeat, Duration::from_secs(20));
        assert_eq!(opts.headers.get("x-client"), Some("test"));
        let auth = opts.auth.unwrap();
        assert_eq!(auth.username.as_deref(), Some("u"));
    }

    #[test]
    fn modes() {
        assert!(ReplicationMode::Continuous.is_active());
        assert!(ReplicationMode::Continuous.is_continuous());
        assert!(!ReplicationMode::Passive.is_active());
        let opts = ReplicatorOptions::push_and_pull(
            ReplicationMode::OneShot,
            ReplicationMode::Continuous,
        );
        assert!(opts.is_continuous());
        assert!(opts.is_active());
    }
}
