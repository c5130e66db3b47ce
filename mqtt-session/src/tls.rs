//! TLS material loading
//!
//! Certificates are read from the configured paths once per connect and
//! handed to the protocol library as raw PEM bytes.

use std::path::Path;

use crate::config::ClientConfig;
use crate::error::ConfigError;

/// PEM contents of the configured TLS files
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca_root: Option<Vec<u8>>,
    /// (certificate, private key)
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterial {
    /// Read every configured TLS file
    ///
    /// Returns `None` when the config names no TLS files at all.
    pub fn load(config: &ClientConfig) -> Result<Option<Self>, ConfigError> {
        let ca_root = config.ca_root_path.as_deref().map(read_pem).transpose()?;

        let client_auth = match (&config.client_cert_path, &config.client_cert_key_path) {
            (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteClientCertificate),
        };

        if ca_root.is_none() && client_auth.is_none() {
            return Ok(None);
        }
        Ok(Some(Self {
            ca_root,
            client_auth,
        }))
    }
}

// Key material stays out of logs
impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_root", &self.ca_root.as_ref().map(Vec::len))
            .field("client_auth", &self.client_auth.is_some())
            .finish()
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::TlsMaterial {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "mqtt-session-tls-{}-{}",
            std::process::id(),
            name
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_no_material() {
        assert!(TlsMaterial::load(&ClientConfig::local()).unwrap().is_none());
    }

    #[test]
    fn test_load_material() {
        let ca = temp_file("ca.pem", b"ca");
        let cert = temp_file("cert.pem", b"cert");
        let key = temp_file("key.pem", b"key");

        let config = ClientConfig::local()
            .with_ca_root(&ca)
            .with_client_certificate(&cert, &key);
        let material = TlsMaterial::load(&config).unwrap().unwrap();

        assert_eq!(material.ca_root.as_deref(), Some(&b"ca"[..]));
        assert_eq!(
            material.client_auth,
            Some((b"cert".to_vec(), b"key".to_vec()))
        );
        assert!(!format!("{:?}", material).contains("key"));

        for path in [ca, cert, key] {
            let _ = std::fs::remove_file(path);
        }
    }

    #[test]
    fn test_missing_file() {
        let config = ClientConfig::local().with_ca_root("/nonexistent/mqtt-session/ca.pem");
        assert!(matches!(
            TlsMaterial::load(&config),
            Err(ConfigError::TlsMaterial { .. })
        ));
    }
}
