//! Configuration: listener specs, environment config, credentials.
//!
//! Listeners come from two additive sources: repeated
//! `-L <local addr>:<local port>:<remote addr>:<remote port>` flags, and the
//! optional `CONFIG` environment variable holding JSON of the form
//! `{"LocalTransfers": {"<port>": {"Target": "host:port"}}}`.
//!
//! Credentials are either three PEM files (certificate, key, CA bundle) or a
//! zip bundle with the entries `url`, `server-name`, `client.crt`,
//! `client.key` and `ca.crt`.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Configuration errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid local transfer spec {0:?}: expected <local addr>:<local port>:<remote addr>:<remote port>")]
    InvalidListenerSpec(String),

    #[error("failed to parse CONFIG env: {0}")]
    InvalidEnv(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid credentials bundle: {0}")]
    Bundle(String),

    #[error("no {0} in credentials bundle")]
    BundleMissing(&'static str),
}

/// One local transfer: a TCP bind address and the remote target every
/// accepted connection is proxied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    /// Local bind address, `addr:port`. A bare `:port` binds all interfaces.
    pub listen: String,
    /// Remote target, `host:port`, dialed by the peer.
    pub target: String,
}

impl ListenerSpec {
    /// Parse a `-L` flag value. Exactly four colon-separated fields.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = spec.split(':').collect();
        if parts.len() != 4 {
            return Err(ConfigError::InvalidListenerSpec(spec.to_string()));
        }
        Ok(ListenerSpec {
            listen: format!("{}:{}", parts[0], parts[1]),
            target: format!("{}:{}", parts[2], parts[3]),
        })
    }
}

/// Shape of the `CONFIG` environment variable.
#[derive(Debug, Deserialize)]
struct EnvConfig {
    #[serde(rename = "LocalTransfers", default)]
    local_transfers: HashMap<u16, TransferTarget>,
}

#[derive(Debug, Deserialize)]
struct TransferTarget {
    #[serde(rename = "Target")]
    target: String,
}

/// Collect listener specs from the flags and the `CONFIG` env value.
/// Both sources combine additively; order between them is irrelevant.
pub fn collect_listeners(
    specs: &[String],
    env: Option<&str>,
) -> Result<Vec<ListenerSpec>, ConfigError> {
    let mut listeners = Vec::new();

    if let Some(raw) = env.filter(|s| !s.is_empty()) {
        let cfg: EnvConfig = serde_json::from_str(raw)?;
        for (port, transfer) in cfg.local_transfers {
            listeners.push(ListenerSpec {
                listen: format!(":{port}"),
                target: transfer.target,
            });
        }
    }

    for spec in specs {
        listeners.push(ListenerSpec::parse(spec)?);
    }

    Ok(listeners)
}

/// TLS identity plus the CA bundle both peers are verified against.
/// Lives for the whole process.
pub struct Credentials {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub ca: Vec<CertificateDer<'static>>,
}

/// Load credentials from three PEM files.
pub fn load_credentials(crt: &Path, key: &Path, ca: &Path) -> Result<Credentials, ConfigError> {
    Ok(Credentials {
        certs: load_certs(crt)?,
        key: load_private_key(key)?,
        ca: load_certs(ca)?,
    })
}

/// Load a certificate chain from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ConfigError::NoCertificates(display));
    }
    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?
        .ok_or(ConfigError::NoPrivateKey(display))
}

/// A client credentials bundle: gateway URL, safe-tunnel server name and the
/// TLS material, packed as named entries in a zip archive.
pub struct ClientBundle {
    pub url: String,
    pub server_name: String,
    pub credentials: Credentials,
}

/// Load a credentials bundle. Every entry is required.
pub fn load_bundle(path: &Path) -> Result<ClientBundle, ConfigError> {
    let display = path.display().to_string();
    let file = File::open(path).map_err(|source| ConfigError::Read {
        path: display,
        source,
    })?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ConfigError::Bundle(e.to_string()))?;

    let mut url = None;
    let mut server_name = None;
    let mut crt_pem = None;
    let mut key_pem = None;
    let mut ca_pem = None;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ConfigError::Bundle(e.to_string()))?;
        let name = entry.name().to_string();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| ConfigError::Bundle(e.to_string()))?;

        match name.as_str() {
            "url" => url = Some(text_entry(data)?),
            "server-name" => server_name = Some(text_entry(data)?),
            "client.crt" => crt_pem = Some(data),
            "client.key" => key_pem = Some(data),
            "ca.crt" => ca_pem = Some(data),
            _ => {}
        }
    }

    let url = url.ok_or(ConfigError::BundleMissing("url"))?;
    let server_name = server_name.ok_or(ConfigError::BundleMissing("server-name"))?;
    let crt_pem = crt_pem.ok_or(ConfigError::BundleMissing("client.crt"))?;
    let key_pem = key_pem.ok_or(ConfigError::BundleMissing("client.key"))?;
    let ca_pem = ca_pem.ok_or(ConfigError::BundleMissing("ca.crt"))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &crt_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Bundle(e.to_string()))?;
    if certs.is_empty() {
        return Err(ConfigError::BundleMissing("client.crt"));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ConfigError::Bundle(e.to_string()))?
        .ok_or(ConfigError::BundleMissing("client.key"))?;
    let ca: Vec<_> = rustls_pemfile::certs(&mut &ca_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Bundle(e.to_string()))?;
    if ca.is_empty() {
        return Err(ConfigError::BundleMissing("ca.crt"));
    }

    Ok(ClientBundle {
        url,
        server_name,
        credentials: Credentials { certs, key, ca },
    })
}

fn text_entry(data: Vec<u8>) -> Result<String, ConfigError> {
    let text =
        String::from_utf8(data).map_err(|e| ConfigError::Bundle(format!("bad text entry: {e}")))?;
    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_listener_spec() {
        let spec = ListenerSpec::parse("127.0.0.1:7000:10.0.0.5:80").unwrap();
        assert_eq!(spec.listen, "127.0.0.1:7000");
        assert_eq!(spec.target, "10.0.0.5:80");

        // empty bind address binds all interfaces
        let spec = ListenerSpec::parse(":9001:h:2").unwrap();
        assert_eq!(spec.listen, ":9001");
        assert_eq!(spec.target, "h:2");
    }

    #[test]
    fn reject_wrong_arity() {
        assert!(ListenerSpec::parse("127.0.0.1:7000:target").is_err());
        assert!(ListenerSpec::parse("a:1:b:2:c").is_err());
        assert!(ListenerSpec::parse("").is_err());
    }

    #[test]
    fn env_and_flags_merge() {
        let env = r#"{"LocalTransfers":{"9000":{"Target":"h:1"}}}"#;
        let flags = vec![":9001:h:2".to_string()];

        let listeners = collect_listeners(&flags, Some(env)).unwrap();
        assert_eq!(listeners.len(), 2);
        assert!(listeners.contains(&ListenerSpec {
            listen: ":9000".into(),
            target: "h:1".into(),
        }));
        assert!(listeners.contains(&ListenerSpec {
            listen: ":9001".into(),
            target: "h:2".into(),
        }));
    }

    #[test]
    fn env_absent_or_empty() {
        assert!(collect_listeners(&[], None).unwrap().is_empty());
        assert!(collect_listeners(&[], Some("")).unwrap().is_empty());
    }

    #[test]
    fn bad_env_is_an_error() {
        assert!(collect_listeners(&[], Some("not json")).is_err());
    }

    #[test]
    fn flag_order_is_irrelevant() {
        let a = vec!["a:1:b:2".to_string(), "c:3:d:4".to_string()];
        let b = vec!["c:3:d:4".to_string(), "a:1:b:2".to_string()];

        let mut la = collect_listeners(&a, None).unwrap();
        let mut lb = collect_listeners(&b, None).unwrap();
        la.sort_by(|x, y| x.listen.cmp(&y.listen));
        lb.sort_by(|x, y| x.listen.cmp(&y.listen));
        assert_eq!(la, lb);
    }
}
