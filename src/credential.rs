use crate::error::Result;
use oauth2::basic::{BasicTokenResponse, BasicTokenType};
use oauth2::TokenResponse;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// The result of a successful token exchange: the access token, the
/// optional refresh token, the token type and when the access token expires.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<SystemTime>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &format_args!("[redacted]"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    pub(crate) fn from_response(response: &BasicTokenResponse, received_at: SystemTime) -> Self {
        let token_type = match response.token_type() {
            BasicTokenType::Bearer => "Bearer".to_string(),
            BasicTokenType::Mac => "MAC".to_string(),
            BasicTokenType::Extension(other) => other.clone(),
        };

        Credential {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|token| token.secret().clone()),
            token_type,
            expires_at: response
                .expires_in()
                .and_then(|expires_in| received_at.checked_add(expires_in)),
        }
    }

    /// A credential without a known expiry is treated as still valid.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// Expiry relative to `now` instead of the wall clock.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(false, |expires_at| now >= expires_at)
    }
}

/// Where credentials survive between runs. Nothing is persisted unless one
/// is supplied.
pub trait CredentialStore {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<Credential>>;
    /// Replaces whatever was stored before.
    fn save(&self, credential: &Credential) -> Result<()>;
}

/// Keeps a single credential as a JSON document on disk.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    /// The file and its parent directories are created on first save.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCredentialStore { path: path.into() }
    }

    /// Location of the JSON document.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&contents)?))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_vec_pretty(credential)?;
        std::fs::write(&self.path, contents)?;
        tracing::debug!(path = %self.path.display(), "credential saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn response(json: &str) -> BasicTokenResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn from_response_computes_expiry() {
        let received_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let credential = Credential::from_response(
            &response(
                r#"{"access_token":"T1","token_type":"bearer","expires_in":3600,"refresh_token":"R1"}"#,
            ),
            received_at,
        );

        assert_eq!(credential.access_token, "T1");
        assert_eq!(credential.refresh_token.as_deref(), Some("R1"));
        assert_eq!(credential.token_type, "Bearer");
        assert_eq!(
            credential.expires_at,
            Some(received_at + Duration::from_secs(3600))
        );
        assert!(!credential.is_expired_at(received_at));
        assert!(credential.is_expired_at(received_at + Duration::from_secs(3600)));
    }

    #[test]
    fn no_expiry_never_expires() {
        let credential = Credential::from_response(
            &response(r#"{"access_token":"T1","token_type":"Bearer"}"#),
            SystemTime::now(),
        );
        assert_eq!(credential.expires_at, None);
        assert_eq!(credential.refresh_token, None);
        assert!(!credential.is_expired());
    }

    #[test]
    fn debug_redacts_tokens() {
        let credential = Credential {
            access_token: "secret-access".into(),
            refresh_token: Some("secret-refresh".into()),
            token_type: "Bearer".into(),
            expires_at: None,
        };
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[redacted]"));
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested").join("credential.json"));
        assert_eq!(store.load().unwrap(), None);

        let credential = Credential {
            access_token: "T1".into(),
            refresh_token: None,
            token_type: "Bearer".into(),
            expires_at: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(42)),
        };
        store.save(&credential).unwrap();
        assert_eq!(store.load().unwrap(), Some(credential));
    }

    #[test]
    fn file_store_rejects_garbage() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"not json").unwrap();

        let store = FileCredentialStore::new(file.path());
        assert!(matches!(store.load(), Err(crate::Error::Json(_))));
    }
}
