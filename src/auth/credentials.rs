//! Static hospital credential store.
//!
//! Loaded once at startup from the config file; `<CODE>_TOKEN` environment
//! variables override file tokens so secrets need not live on disk.

use std::collections::HashMap;

use subtle::ConstantTimeEq;

use crate::config::HospitalEntry;

/// Registration-time rejections, surfaced to the edge as `ERROR <reason>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    RateLimited,
    UnknownHospital,
    SubdomainMismatch,
    InvalidToken,
    AlreadyRegistered,
    AtCapacity,
    MalformedRegister,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited => write!(f, "rate-limited"),
            Self::UnknownHospital => write!(f, "unknown hospital code"),
            Self::SubdomainMismatch => write!(f, "subdomain mismatch"),
            Self::InvalidToken => write!(f, "invalid token"),
            Self::AlreadyRegistered => write!(f, "already-registered"),
            Self::AtCapacity => write!(f, "relay at capacity"),
            Self::MalformedRegister => write!(f, "malformed REGISTER"),
        }
    }
}

impl std::error::Error for AuthError {}

/// One configured hospital.
#[derive(Debug, Clone)]
pub struct HospitalCredential {
    pub code: String,
    pub subdomain: String,
    token: String,
}

impl HospitalCredential {
    /// The shared secret, also the key source for download tokens.
    pub fn secret(&self) -> &str {
        &self.token
    }
}

/// Read-only credential set, case-sensitive on `code`.
pub struct CredentialStore {
    by_code: HashMap<String, HospitalCredential>,
}

impl CredentialStore {
    /// Build the store from config entries, applying `<CODE>_TOKEN`
    /// environment overrides and validating the subdomain invariant
    /// (`subdomain == code + "." + domain`, case-insensitive).
    pub fn load(entries: &[HospitalEntry], domain: &str) -> anyhow::Result<Self> {
        let mut by_code = HashMap::with_capacity(entries.len());
        for entry in entries {
            if entry.code.is_empty() {
                anyhow::bail!("hospital entry with empty code");
            }
            let expected = format!("{}.{}", entry.code, domain);
            if !entry.subdomain.eq_ignore_ascii_case(&expected) {
                anyhow::bail!(
                    "hospital {}: subdomain {:?} does not match expected {:?}",
                    entry.code,
                    entry.subdomain,
                    expected
                );
            }

            let env_key = format!("{}_TOKEN", entry.code.to_uppercase().replace('-', "_"));
            let token = match std::env::var(&env_key) {
                Ok(v) if !v.is_empty() => v,
                _ => entry.token.clone(),
            };
            if token.is_empty() {
                anyhow::bail!(
                    "hospital {}: no token in config and {} is unset",
                    entry.code,
                    env_key
                );
            }

            let previous = by_code.insert(
                entry.code.clone(),
                HospitalCredential {
                    code: entry.code.clone(),
                    subdomain: entry.subdomain.to_lowercase(),
                    token,
                },
            );
            if previous.is_some() {
                anyhow::bail!("duplicate hospital code {}", entry.code);
            }
        }
        Ok(Self { by_code })
    }

    /// Check a REGISTER attempt against the configured set.
    ///
    /// Token comparison is constant-time; the subdomain check is
    /// case-insensitive while the code lookup is not.
    pub fn verify(
        &self,
        code: &str,
        claimed_subdomain: &str,
        token: &str,
    ) -> Result<&HospitalCredential, AuthError> {
        let cred = self.by_code.get(code).ok_or(AuthError::UnknownHospital)?;
        if !claimed_subdomain.eq_ignore_ascii_case(&cred.subdomain) {
            return Err(AuthError::SubdomainMismatch);
        }
        let supplied = token.as_bytes();
        let expected = cred.token.as_bytes();
        if supplied.len() != expected.len() || supplied.ct_eq(expected).unwrap_u8() != 1 {
            return Err(AuthError::InvalidToken);
        }
        Ok(cred)
    }

    pub fn get(&self, code: &str) -> Option<&HospitalCredential> {
        self.by_code.get(code)
    }

    /// Configured subdomains, used for the ACME issuance set.
    pub fn subdomains(&self) -> impl Iterator<Item = &str> {
        self.by_code.values().map(|c| c.subdomain.as_str())
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<HospitalEntry> {
        vec![HospitalEntry {
            code: "a".into(),
            subdomain: "a.example.test".into(),
            token: "t1".into(),
        }]
    }

    #[test]
    fn verify_happy_path() {
        let store = CredentialStore::load(&entries(), "example.test").unwrap();
        let cred = store.verify("a", "a.example.test", "t1").unwrap();
        assert_eq!(cred.code, "a");
    }

    #[test]
    fn code_lookup_is_case_sensitive() {
        let store = CredentialStore::load(&entries(), "example.test").unwrap();
        assert_eq!(
            store.verify("A", "a.example.test", "t1").unwrap_err(),
            AuthError::UnknownHospital
        );
    }

    #[test]
    fn subdomain_check_is_case_insensitive() {
        let store = CredentialStore::load(&entries(), "example.test").unwrap();
        assert!(store.verify("a", "A.Example.TEST", "t1").is_ok());
        assert_eq!(
            store.verify("a", "b.example.test", "t1").unwrap_err(),
            AuthError::SubdomainMismatch
        );
    }

    #[test]
    fn wrong_token_is_rejected() {
        let store = CredentialStore::load(&entries(), "example.test").unwrap();
        assert_eq!(
            store.verify("a", "a.example.test", "wrong").unwrap_err(),
            AuthError::InvalidToken
        );
        assert_eq!(
            store.verify("a", "a.example.test", "t1longer").unwrap_err(),
            AuthError::InvalidToken
        );
    }

    #[test]
    fn env_token_overrides_file_token() {
        std::env::set_var("OVERRIDE_H_TOKEN", "from-env");
        let entries = vec![HospitalEntry {
            code: "override-h".into(),
            subdomain: "override-h.example.test".into(),
            token: "from-file".into(),
        }];
        let store = CredentialStore::load(&entries, "example.test").unwrap();
        assert!(store
            .verify("override-h", "override-h.example.test", "from-env")
            .is_ok());
        assert_eq!(
            store
                .verify("override-h", "override-h.example.test", "from-file")
                .unwrap_err(),
            AuthError::InvalidToken
        );
        std::env::remove_var("OVERRIDE_H_TOKEN");
    }

    #[test]
    fn subdomain_invariant_is_enforced_at_load() {
        let bad = vec![HospitalEntry {
            code: "a".into(),
            subdomain: "b.example.test".into(),
            token: "t1".into(),
        }];
        assert!(CredentialStore::load(&bad, "example.test").is_err());
    }

    #[test]
    fn missing_token_everywhere_is_fatal() {
        let bad = vec![HospitalEntry {
            code: "zq".into(),
            subdomain: "zq.example.test".into(),
            token: String::new(),
        }];
        assert!(CredentialStore::load(&bad, "example.test").is_err());
    }
}
