//! Property-level encryption of outgoing revisions.
//!
//! A document marks sensitive values as
//! `{"SSN": {"@type": "encryptable", "value": "123-45-6789"}}`. Before a
//! `rev` goes out, each such entry is run through the application's
//! encryption callback and rewritten as
//! `{"encrypted$SSN": {"alg": "...", "ciphertext": "...", "kid": "..."}}`.
//! Receiving mirrors the transformation back.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};

use skiffdb_core::error::{Error, Result};

/// `@type` marker of an encryptable property value.
pub const OBJECT_TYPE_ENCRYPTABLE: &str = "encryptable";
/// Key prefix tagging an encrypted property in its containing dict.
pub const ENCRYPTED_KEY_PREFIX: &str = "encrypted$";

/// Output of the application's encryption callback.
#[derive(Debug, Clone)]
pub struct EncryptedValue {
    pub alg: String,
    pub ciphertext: Vec<u8>,
    pub key_id: Option<String>,
}

/// Encrypts one property: `(doc_id, key_path, cleartext) → EncryptedValue`.
pub type PropertyEncryptor =
    Arc<dyn Fn(&str, &str, &Value) -> Result<EncryptedValue> + Send + Sync>;

/// Decrypts one property: `(doc_id, key_path, encrypted) → cleartext`.
pub type PropertyDecryptor =
    Arc<dyn Fn(&str, &str, &EncryptedValue) -> Result<Value> + Send + Sync>;

fn is_encryptable(value: &Value) -> bool {
    value
        .get("@type")
        .and_then(Value::as_str)
        .is_some_and(|t| t == OBJECT_TYPE_ENCRYPTABLE)
}

/// Quick scan deciding whether a body needs the (more expensive) encrypt
/// walk at all.
pub fn may_contain_encryptables(body: &Value) -> bool {
    match body {
        Value::Object(map) => {
            is_encryptable(body) || map.values().any(may_contain_encryptables)
        }
        Value::Array(items) => items.iter().any(may_contain_encryptables),
        _ => false,
    }
}

pub fn may_contain_encrypted(body: &Value) -> bool {
    match body {
        Value::Object(map) => map.iter().any(|(k, v)| {
            k.starts_with(ENCRYPTED_KEY_PREFIX) || may_contain_encrypted(v)
        }),
        Value::Array(items) => items.iter().any(may_contain_encrypted),
        _ => false,
    }
}

/// Replaces every encryptable property with its encrypted form. Returns
/// `None` when nothing changed. Encryptable markers with no callback
/// configured are a protocol error.
pub fn encrypt_properties(
    doc_id: &str,
    body: &Value,
    encryptor: Option<&PropertyEncryptor>,
) -> Result<Option<Value>> {
    if !may_contain_encryptables(body) {
        return Ok(None);
    }
    let Some(encryptor) = encryptor else {
        return Err(Error::Crypto(format!(
            "document '{doc_id}' has encryptable properties but no encryption callback"
        )));
    };
    let mut changed = false;
    let out = walk_encrypt(doc_id, body, "", encryptor, &mut changed)?;
    Ok(changed.then_some(out))
}

fn walk_encrypt(
    doc_id: &str,
    value: &Value,
    path: &str,
    encryptor: &PropertyEncryptor,
    changed: &mut bool,
) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                if is_encryptable(child) {
                    let cleartext = child.get("value").unwrap_or(&Value::Null);
                    let encrypted = encryptor(doc_id, &child_path, cleartext)?;
                    let mut enc = Map::new();
                    enc.insert("alg".into(), json!(encrypted.alg));
                    enc.insert(
                        "ciphertext".into(),
                        json!(STANDARD.encode(&encrypted.ciphertext)),
                    );
                    if let Some(kid) = &encrypted.key_id {
                        enc.insert("kid".into(), json!(kid));
                    }
                    out.insert(
                        format!("{ENCRYPTED_KEY_PREFIX}{key}"),
                        Value::Object(enc),
                    );
                    *changed = true;
                } else {
                    out.insert(
                        key.clone(),
                        walk_encrypt(doc_id, child, &child_path, encryptor, changed)?,
                    );
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, child) in items.iter().enumerate() {
                out.push(walk_encrypt(
                    doc_id,
                    child,
                    &format!("{path}[{i}]"),
                    encryptor,
                    changed,
                )?);
            }
            Ok(Value::Array(out))
        }
        _ => Ok(value.clone()),
    }
}

/// Reinstates every `encrypted$` property as a cleartext encryptable value.
/// Returns `None` when nothing changed. Encrypted properties with no
/// callback configured are a protocol error, unless decryption was opted
/// out (the caller then skips this pass entirely).
pub fn decrypt_properties(
    doc_id: &str,
    body: &Value,
    decryptor: Option<&PropertyDecryptor>,
) -> Result<Option<Value>> {
    if !may_contain_encrypted(body) {
        return Ok(None);
    }
    let Some(decryptor) = decryptor else {
        return Err(Error::Crypto(format!(
            "document '{doc_id}' has encrypted properties but no decryption callback"
        )));
    };
    let mut changed = false;
    let out = walk_decrypt(doc_id, body, "", decryptor, &mut changed)?;
    Ok(changed.then_some(out))
}

fn walk_decrypt(
    doc_id: &str,
    value: &Value,
    path: &str,
    decryptor: &PropertyDecryptor,
    changed: &mut bool,
) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                if let Some(clear_key) = key.strip_prefix(ENCRYPTED_KEY_PREFIX) {
                    let child_path = if path.is_empty() {
                        clear_key.to_string()
                    } else {
                        format!("{path}.{clear_key}")
                    };
                    let encrypted = EncryptedValue {
                        alg: child
                            .get("alg")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        ciphertext: child
                            .get("ciphertext")
                            .and_then(Value::as_str)
                            .and_then(|c| STANDARD.decode(c).ok())
                            .ok_or_else(|| {
                                Error::Crypto(format!("bad ciphertext at '{path}'"))
                            })?,
                        key_id: child
                            .get("kid")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    };
                    let cleartext = decryptor(doc_id, &child_path, &encrypted)?;
                    out.insert(
                        clear_key.to_string(),
                        json!({"@type": OBJECT_TYPE_ENCRYPTABLE, "value": cleartext}),
                    );
                    *changed = true;
                } else {
                    let child_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    out.insert(
                        key.clone(),
                        walk_decrypt(doc_id, child, &child_path, decryptor, changed)?,
                    );
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, child) in items.iter().enumerate() {
                out.push(walk_decrypt(
                    doc_id,
                    child,
                    &format!("{path}[{i}]"),
                    decryptor,
                    changed,
                )?);
            }
            Ok(Value::Array(out))
        }
        _ => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_encryptor() -> PropertyEncryptor {
        Arc::new(|_doc, _path, value| {
            let bytes: Vec<u8> = serde_json::to_vec(value)
                .unwrap()
                .iter()
                .map(|b| b ^ 0x5a)
                .collect();
            Ok(EncryptedValue {
                alg: "XOR".into(),
                ciphertext: bytes,
                key_id: Some("k1".into()),
            })
        })
    }

    fn xor_decryptor() -> PropertyDecryptor {
        Arc::new(|_doc, _path, encrypted| {
            assert_eq!(encrypted.alg, "XOR");
            let bytes: Vec<u8> = encrypted.ciphertext.iter().map(|b| b ^ 0x5a).collect();
            Ok(serde_json::from_slice(&bytes).unwrap())
        })
    }

    #[test]
    fn round_trip() {
        let body = json!({
            "name": "alice",
            "ssn": {"@type": "encryptable", "value": "123-45-6789"},
            "nested": {"pin": {"@type": "encryptable", "value": 1234}}
        });
        let enc = xor_encryptor();
        let encrypted = encrypt_properties("doc1", &body, Some(&enc))
            .unwrap()
            .expect("something changed");

        assert!(encrypted.get("ssn").is_none());
        let enc_ssn = encrypted.get("encrypted$ssn").unwrap();
        assert_eq!(enc_ssn["alg"], "XOR");
        assert_eq!(enc_ssn["kid"], "k1");
        assert!(encrypted["nested"].get("encrypted$pin").is_some());

        let dec = xor_decryptor();
        let decrypted = decrypt_properties("doc1", &encrypted, Some(&dec))
            .unwrap()
            .expect("something changed");
        assert_eq!(decrypted, body);
    }

    #[test]
    fn no_markers_is_a_noop() {
        let body = json!({"plain": 1});
        assert!(encrypt_properties("d", &body, None).unwrap().is_none());
        assert!(decrypt_properties("d", &body, None).unwrap().is_none());
    }

    #[test]
    fn missing_callback_is_an_error() {
        let body = json!({"ssn": {"@type": "encryptable", "value": "x"}});
        assert!(matches!(
            encrypt_properties("d", &body, None),
            Err(Error::Crypto(_))
        ));
        let encrypted = json!({"encrypted$ssn": {"alg": "X", "ciphertext": "AAAA"}});
        assert!(matches!(
            decrypt_properties("d", &encrypted, None),
            Err(Error::Crypto(_))
        ));
    }
}
