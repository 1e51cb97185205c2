//! Shared key file handling
//!
//! A shared key lives in a single-line file, `"<hex expire> <hex key>"`,
//! owner-readable only. Keys are minted on demand with a configurable
//! lifetime; the challenge response is an HMAC-SHA256 of the peer's
//! challenge under the key.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::debug;

use crate::error::{AuthError, Result};
use crate::proto::{CHALLENGE_LEN, RESPONSE_LEN, SHARED_KEY_LEN};

pub const KEY_FILE_BASENAME: &str = ".meshfs_shared_key";
pub const DEFAULT_KEY_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// How the caller wants the key file treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAccess {
    /// Use the stored key; fail if it is missing or expired.
    Get,
    /// Use the stored key if still valid, otherwise mint a new one.
    Create,
    /// Mint a new key regardless of what is stored.
    CreateForce,
}

#[derive(Clone)]
pub struct SharedKey {
    pub key: [u8; SHARED_KEY_LEN],
    /// Expiry as seconds since the epoch.
    pub expire: u64,
}

impl SharedKey {
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expire
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parse(content: &str) -> Option<SharedKey> {
    let mut fields = content.split_whitespace();
    let expire = u64::from_str_radix(fields.next()?, 16).ok()?;
    let bytes = hex::decode(fields.next()?).ok()?;
    let key: [u8; SHARED_KEY_LEN] = bytes.try_into().ok()?;
    Some(SharedKey { key, expire })
}

/// Read a stored key without regard to expiry. Server-side lookups decide
/// about expiry themselves.
pub fn read(path: &Path) -> Result<SharedKey> {
    let content = fs::read_to_string(path)
        .map_err(|e| AuthError::Credential(format!("{}: {e}", path.display())))?;
    parse(&content)
        .ok_or_else(|| AuthError::Credential(format!("{}: malformed key file", path.display())))
}

fn store(path: &Path, key: &SharedKey) -> Result<()> {
    let line = format!("{:08x} {}\n", key.expire, hex::encode(key.key));
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| AuthError::Credential(format!("{}: {e}", path.display())))?;
    f.write_all(line.as_bytes())
        .map_err(|e| AuthError::Credential(format!("{}: {e}", path.display())))?;
    Ok(())
}

/// Fetch or mint the shared key at `path` according to `access`.
pub fn shared_key_get(path: &Path, access: KeyAccess, period: Duration) -> Result<SharedKey> {
    let now = now_secs();
    let existing = fs::read_to_string(path).ok().and_then(|c| parse(&c));
    match access {
        KeyAccess::Get => match existing {
            Some(k) if !k.is_expired_at(now) => Ok(k),
            Some(_) => Err(AuthError::Expired),
            None => Err(AuthError::Credential(format!(
                "{}: no shared key",
                path.display()
            ))),
        },
        KeyAccess::Create | KeyAccess::CreateForce => {
            if access == KeyAccess::Create {
                if let Some(k) = existing {
                    if !k.is_expired_at(now) {
                        return Ok(k);
                    }
                }
            }
            let mut key = [0u8; SHARED_KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            let fresh = SharedKey {
                key,
                expire: now + period.as_secs(),
            };
            store(path, &fresh)?;
            debug!(path = %path.display(), "shared key created");
            Ok(fresh)
        }
    }
}

/// Keyed digest of a challenge.
pub fn challenge_response(key: &SharedKey, challenge: &[u8]) -> Result<[u8; RESPONSE_LEN]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(&key.key)
        .map_err(|e| AuthError::Credential(format!("unusable shared key: {e}")))?;
    mac.update(challenge);
    let digest = mac.finalize().into_bytes();
    let mut response = [0u8; RESPONSE_LEN];
    response.copy_from_slice(&digest);
    Ok(response)
}

pub fn new_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_BASENAME);
        let created = shared_key_get(&path, KeyAccess::Create, DEFAULT_KEY_PERIOD).unwrap();
        let read_back = shared_key_get(&path, KeyAccess::Get, DEFAULT_KEY_PERIOD).unwrap();
        assert_eq!(created.key, read_back.key);
        assert_eq!(created.expire, read_back.expire);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn create_reuses_valid_key_and_force_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_BASENAME);
        let first = shared_key_get(&path, KeyAccess::Create, DEFAULT_KEY_PERIOD).unwrap();
        let second = shared_key_get(&path, KeyAccess::Create, DEFAULT_KEY_PERIOD).unwrap();
        assert_eq!(first.key, second.key);
        let forced = shared_key_get(&path, KeyAccess::CreateForce, DEFAULT_KEY_PERIOD).unwrap();
        assert_ne!(first.key, forced.key);
    }

    #[test]
    fn get_fails_on_missing_or_expired_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(KEY_FILE_BASENAME);
        assert!(matches!(
            shared_key_get(&path, KeyAccess::Get, DEFAULT_KEY_PERIOD),
            Err(AuthError::Credential(_))
        ));
        // A zero-lifetime key is expired as soon as it is minted.
        shared_key_get(&path, KeyAccess::CreateForce, Duration::ZERO).unwrap();
        assert!(matches!(
            shared_key_get(&path, KeyAccess::Get, DEFAULT_KEY_PERIOD),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn responses_differ_across_keys() {
        let challenge = new_challenge();
        let a = SharedKey { key: [1; SHARED_KEY_LEN], expire: 0 };
        let b = SharedKey { key: [2; SHARED_KEY_LEN], expire: 0 };
        assert_ne!(
            challenge_response(&a, &challenge).unwrap(),
            challenge_response(&b, &challenge).unwrap()
        );
        assert_eq!(
            challenge_response(&a, &challenge).unwrap(),
            challenge_response(&a, &challenge).unwrap()
        );
    }
}
