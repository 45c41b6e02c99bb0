//! Where a domain's (protection tag, cookie) pair comes from.
use thiserror::Error;

use fabric_api::{Credentials, EpName};

pub const PTAG_ENV: &str = "PMI_GNI_PTAG";
pub const COOKIE_ENV: &str = "PMI_GNI_COOKIE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("Cannot parse {var}={value}")]
    Parse { var: &'static str, value: String },
}

impl From<CredentialError> for crate::Error {
    fn from(other: CredentialError) -> Self {
        crate::Error::InvalidArgument(other.to_string())
    }
}

/// Resolves the credentials of a domain. With a `peer` name, the cookie
/// is taken from the peer so both sides of a handshake agree on it.
pub trait CredentialSource: Send + Sync {
    fn resolve(&self, peer: Option<&EpName>) -> Result<Credentials, CredentialError>;
}

/// Reads the launcher-provided environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

/// Credentials fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct StaticCredentials(pub Credentials);

/// Parses a decimal or `0x`-prefixed hexadecimal number. Launchers may pass
/// a colon-separated list, of which the first element is used.
fn parse_first<T>(var: &'static str, value: &str) -> Result<T, CredentialError>
where
    T: TryFrom<u64>,
{
    let first = value.split(':').next().unwrap_or_default().trim();
    let parsed = match first.strip_prefix("0x").or_else(|| first.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => first.parse::<u64>(),
    };
    parsed
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| CredentialError::Parse {
            var,
            value: value.to_owned(),
        })
}

fn read_env<T: TryFrom<u64>>(var: &'static str) -> Result<T, CredentialError> {
    let value = std::env::var(var).map_err(|_| CredentialError::Missing(var))?;
    parse_first(var, &value)
}

impl CredentialSource for EnvCredentials {
    fn resolve(&self, peer: Option<&EpName>) -> Result<Credentials, CredentialError> {
        let ptag = read_env::<u8>(PTAG_ENV)?;
        let cookie = match peer {
            Some(name) => name.cookie,
            None => read_env::<u32>(COOKIE_ENV)?,
        };
        Ok(Credentials { ptag, cookie })
    }
}

impl CredentialSource for StaticCredentials {
    fn resolve(&self, peer: Option<&EpName>) -> Result<Credentials, CredentialError> {
        Ok(Credentials {
            ptag: self.0.ptag,
            cookie: peer.map_or(self.0.cookie, |name| name.cookie),
        })
    }
}
