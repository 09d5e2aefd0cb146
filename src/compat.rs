//! Server version compatibility checks before a full sync.
//!
//! A manual sync against a server newer than anything tested asks the user
//! first; the caller re-invokes with the accepted version string to proceed.
//! Automatic syncs never ask: anything other than `Allowed` is skipped.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{MemoError, MemoResult};
use crate::gateway::RemoteGateway;

/// Oldest server release with the paginated v1 API
pub const DEFAULT_MINIMUM_VERSION: &str = "0.22.0";

/// Newest server release this client has been verified against
pub const DEFAULT_HIGHEST_TESTED_VERSION: &str = "0.25.3";

/// Outcome of a compatibility check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCompatibility {
    Allowed,
    Blocked { message: Option<String> },
    RequiresConfirmation { version: String, message: String },
}

/// Decides whether a full sync may run against the current server
#[async_trait]
pub trait CompatibilityCheck: Send + Sync {
    /// `allow_higher_version` names a version the user explicitly accepted.
    async fn check(&self, is_automatic: bool, allow_higher_version: Option<&str>)
        -> SyncCompatibility;

    /// Called after a sync that ran under an explicit override succeeded.
    async fn remember_accepted_version(&self, version: &str) -> MemoResult<()>;
}

/// A dotted `major.minor.patch` server version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ServerVersion {
    /// Parse "0.25.1", "v0.25" or "0.25.1-rc1"
    pub fn parse(value: &str) -> MemoResult<Self> {
        let trimmed = value.trim().trim_start_matches('v');
        let core = trimmed.split(['-', '+']).next().unwrap_or_default();
        let mut parts = core.split('.').map(|p| p.parse::<u32>());

        let mut next = |name: &str, required: bool| -> MemoResult<u32> {
            match parts.next() {
                Some(Ok(n)) => Ok(n),
                None if !required => Ok(0),
                _ => Err(MemoError::VersionIncompatible {
                    version: value.to_string(),
                    message: format!("invalid {} component", name),
                }),
            }
        };

        let major = next("major", true)?;
        let minor = next("minor", true)?;
        let patch = next("patch", false)?;
        Ok(Self { major, minor, patch })
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Stores an accepted version beyond the life of the gate
type PersistAccepted = Box<dyn Fn(&str) -> MemoResult<()> + Send + Sync>;

/// Compatibility check driven by the version the server reports
pub struct VersionGate {
    gateway: Arc<dyn RemoteGateway>,
    minimum: ServerVersion,
    highest_tested: ServerVersion,
    accepted: Mutex<Option<String>>,
    persist: Option<PersistAccepted>,
}

impl VersionGate {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        minimum: ServerVersion,
        highest_tested: ServerVersion,
    ) -> Self {
        Self {
            gateway,
            minimum,
            highest_tested,
            accepted: Mutex::new(None),
            persist: None,
        }
    }

    /// Gate with the built-in version range
    pub fn with_defaults(gateway: Arc<dyn RemoteGateway>) -> MemoResult<Self> {
        Ok(Self::new(
            gateway,
            ServerVersion::parse(DEFAULT_MINIMUM_VERSION)?,
            ServerVersion::parse(DEFAULT_HIGHEST_TESTED_VERSION)?,
        ))
    }

    /// Seed a version the user accepted in an earlier session
    pub fn with_accepted(self, version: Option<String>) -> Self {
        if let Ok(mut accepted) = self.accepted.lock() {
            *accepted = version;
        }
        self
    }

    /// Run `persist` whenever a newly accepted version is remembered
    pub fn with_persistence(
        mut self,
        persist: impl Fn(&str) -> MemoResult<()> + Send + Sync + 'static,
    ) -> Self {
        self.persist = Some(Box::new(persist));
        self
    }

    /// Seed the accepted version from an account's configuration and save
    /// later acceptances back to it.
    pub fn with_config(self, config: Arc<Mutex<Config>>, account_key: &str) -> MemoResult<Self> {
        let accepted = config
            .lock()?
            .get_account(account_key)
            .and_then(|a| a.accepted_sync_version.clone());
        let account_key = account_key.to_string();

        Ok(self.with_accepted(accepted).with_persistence(move |version| {
            if !config.lock()?.set_accepted_sync_version(&account_key, version)? {
                tracing::warn!(account = %account_key, "No configured account to remember version for");
            }
            Ok(())
        }))
    }

    /// Version the user has accepted, if any
    pub fn accepted_version(&self) -> Option<String> {
        self.accepted.lock().ok().and_then(|a| a.clone())
    }

    /// Pure decision for a reported version string
    pub fn evaluate(
        &self,
        reported: &str,
        is_automatic: bool,
        allow_higher_version: Option<&str>,
    ) -> SyncCompatibility {
        let version = match ServerVersion::parse(reported) {
            Ok(v) => v,
            Err(e) => {
                return SyncCompatibility::Blocked {
                    message: Some(e.to_string()),
                }
            }
        };

        if version < self.minimum {
            let err = MemoError::VersionIncompatible {
                version: version.to_string(),
                message: format!("Memos {} or later is required", self.minimum),
            };
            return SyncCompatibility::Blocked {
                message: Some(err.to_string()),
            };
        }

        if version.cmp(&self.highest_tested) != Ordering::Greater {
            return SyncCompatibility::Allowed;
        }

        let reported = reported.trim().to_string();
        let previously_accepted = self.accepted_version().as_deref() == Some(reported.as_str());
        if previously_accepted || (!is_automatic && allow_higher_version == Some(reported.as_str()))
        {
            return SyncCompatibility::Allowed;
        }

        SyncCompatibility::RequiresConfirmation {
            message: format!(
                "Server version {} is newer than {}, the latest version tested with this app",
                version, self.highest_tested
            ),
            version: reported,
        }
    }
}

#[async_trait]
impl CompatibilityCheck for VersionGate {
    async fn check(
        &self,
        is_automatic: bool,
        allow_higher_version: Option<&str>,
    ) -> SyncCompatibility {
        match self.gateway.server_version().await {
            Ok(reported) => self.evaluate(&reported, is_automatic, allow_higher_version),
            Err(e) => {
                tracing::warn!("Could not read server version: {}", e);
                SyncCompatibility::Blocked {
                    message: Some(e.to_string()),
                }
            }
        }
    }

    async fn remember_accepted_version(&self, version: &str) -> MemoResult<()> {
        let version = version.trim();
        *self.accepted.lock()? = Some(version.to_string());
        if let Some(persist) = &self.persist {
            persist(version)?;
        }
        Ok(())
    }
}
