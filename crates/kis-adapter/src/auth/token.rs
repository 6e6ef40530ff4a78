/*
[INPUT]:  Token issuance responses and the local cache directory
[OUTPUT]: Access tokens with expiry checks, persisted between runs
[POS]:    Auth layer - token value type and advisory on-disk cache
[UPDATE]: When token fields, expiry margin or cache naming change
*/

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::AppKey;
use crate::types::{Domain, TokenResponse};

/// Tokens are treated as expired this long before their real expiry.
pub const EXPIRY_MARGIN_SECONDS: i64 = 60;

/// Bearer token for one domain.
#[derive(Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub token_type: String,
    pub domain: Domain,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
}

impl AccessToken {
    pub fn from_response(domain: Domain, response: TokenResponse) -> Self {
        Self {
            token: response.access_token,
            token_type: response.token_type,
            domain,
            expires_at: Utc::now() + Duration::seconds(response.expires_in),
            expires_in: response.expires_in,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::seconds(EXPIRY_MARGIN_SECONDS) >= self.expires_at
    }

    /// `authorization` header value.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("domain", &self.domain)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// On-disk token format.
#[derive(Debug, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    token_type: String,
    expires_at: DateTime<Utc>,
    expires_in: i64,
    #[serde(default)]
    domain: Option<Domain>,
}

/// Advisory token cache: a missing or unreadable file only means a reissue.
#[derive(Debug, Clone)]
pub struct TokenCache {
    dir: PathBuf,
}

impl TokenCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache file for a domain + credential pair.
    pub fn path_for(&self, domain: Domain, key: &AppKey) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(domain.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(key.appkey.as_bytes());
        hasher.update(b"|");
        hasher.update(key.secretkey.as_bytes());
        let digest = hex::encode(hasher.finalize());
        self.dir.join(format!("token_{}.json", &digest[..32]))
    }

    /// Load a still-valid token, if any.
    pub fn load(&self, domain: Domain, key: &AppKey) -> Option<AccessToken> {
        let path = self.path_for(domain, key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "token cache unreadable");
                return None;
            }
        };

        let cached: CachedToken = match serde_json::from_str(&content) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "token cache corrupt, ignoring");
                return None;
            }
        };

        if cached.domain.is_some_and(|cached_domain| cached_domain != domain) {
            debug!(%domain, "token cache belongs to another domain");
            return None;
        }

        let token = AccessToken {
            token: cached.access_token,
            token_type: cached.token_type,
            domain,
            expires_at: cached.expires_at,
            expires_in: cached.expires_in,
        };

        if token.is_expired() {
            debug!(%domain, expires_at = %token.expires_at, "cached token expired");
            return None;
        }

        Some(token)
    }

    /// Persist a token, replacing the previous file atomically.
    pub fn store(&self, token: &AccessToken, key: &AppKey) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let cached = CachedToken {
            access_token: token.token.clone(),
            token_type: token.token_type.clone(),
            expires_at: token.expires_at,
            expires_in: token.expires_in,
            domain: Some(token.domain),
        };
        let encoded = serde_json::to_vec(&cached).map_err(io::Error::other)?;

        let path = self.path_for(token.domain, key);
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, encoded)?;
        restrict_permissions(&tmp)?;
        fs::rename(&tmp, &path)
    }

    pub fn remove(&self, domain: Domain, key: &AppKey) {
        let path = self.path_for(domain, key);
        if let Err(err) = fs::remove_file(&path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %err, "failed to remove token cache");
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("kis-test-{}", Uuid::new_v4()));
        fs::create_dir_all(&path).unwrap();
        path
    }

    fn token(domain: Domain, expires_in: i64) -> AccessToken {
        AccessToken::from_response(
            domain,
            TokenResponse {
                access_token: "cached-token".to_string(),
                token_type: "Bearer".to_string(),
                expires_in,
                access_token_token_expired: None,
            },
        )
    }

    #[test]
    fn test_token_expiry_margin() {
        assert!(!token(Domain::Real, 3600).is_expired());
        assert!(token(Domain::Real, 30).is_expired());
        assert_eq!(token(Domain::Real, 3600).authorization(), "Bearer cached-token");
    }

    #[test]
    fn test_debug_redacts_token() {
        assert!(!format!("{:?}", token(Domain::Real, 3600)).contains("cached-token"));
    }

    #[test]
    fn test_cache_roundtrip_and_isolation() {
        let dir = temp_dir();
        let cache = TokenCache::new(&dir);
        let key = AppKey::new("PSkey", "secret");
        let other = AppKey::new("PSother", "secret");

        cache.store(&token(Domain::Real, 3600), &key).unwrap();

        let loaded = cache.load(Domain::Real, &key).expect("cached token");
        assert_eq!(loaded.token, "cached-token");
        assert!(cache.load(Domain::Virtual, &key).is_none());
        assert!(cache.load(Domain::Real, &other).is_none());
        assert_ne!(
            cache.path_for(Domain::Real, &key),
            cache.path_for(Domain::Virtual, &key)
        );

        cache.remove(Domain::Real, &key);
        assert!(cache.load(Domain::Real, &key).is_none());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_cache_ignores_expired_and_corrupt_files() {
        let dir = temp_dir();
        let cache = TokenCache::new(&dir);
        let key = AppKey::new("PSkey", "secret");

        cache.store(&token(Domain::Real, 10), &key).unwrap();
        assert!(cache.load(Domain::Real, &key).is_none());

        fs::write(cache.path_for(Domain::Real, &key), "{not json").unwrap();
        assert!(cache.load(Domain::Real, &key).is_none());

        fs::remove_dir_all(dir).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = temp_dir();
        let cache = TokenCache::new(&dir);
        let key = AppKey::new("PSkey", "secret");
        cache.store(&token(Domain::Real, 3600), &key).unwrap();

        let metadata = fs::metadata(cache.path_for(Domain::Real, &key)).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);

        fs::remove_dir_all(dir).unwrap();
    }
}
