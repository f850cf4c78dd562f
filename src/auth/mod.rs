mod authority;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use crate::config::AuthConfig;
use crate::logging::{LogLevel, Logger};
use crate::utils::timing::sleep_unless_stopped;

pub use authority::{AuthAuthority, AuthorityError, HttpAuthority, OpenAuthority};

const REVALIDATE_CONTEXT: &str = "auth::revalidate";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ApiKeyEntry {
    pub api_key: String,
    pub device_id: String,
}

impl ApiKeyEntry {
    pub fn new(api_key: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            device_id: device_id.into(),
        }
    }
}

#[derive(Default)]
struct AuthSets {
    authenticated: HashSet<ApiKeyEntry>,
    unauthenticated: HashSet<ApiKeyEntry>,
}

impl AuthSets {
    fn record(&mut self, entry: ApiKeyEntry, accepted: bool) {
        if accepted {
            self.unauthenticated.remove(&entry);
            self.authenticated.insert(entry);
        } else {
            self.authenticated.remove(&entry);
            self.unauthenticated.insert(entry);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuthStats {
    pub authenticated: usize,
    pub unauthenticated: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RevalidationReport {
    pub checked: usize,
    pub promoted: usize,
    pub demoted: usize,
}

/// Gate in front of the ingestion queue.
///
/// Every known pair lives in exactly one of two sets. The lock only guards
/// set lookups and snapshots; authority calls always run outside it.
pub struct AuthCache {
    authority: Arc<dyn AuthAuthority>,
    sets: Mutex<AuthSets>,
    logger: Arc<Logger>,
}

impl AuthCache {
    pub fn new(authority: Arc<dyn AuthAuthority>, logger: Arc<Logger>) -> Self {
        Self {
            authority,
            sets: Mutex::new(AuthSets::default()),
            logger,
        }
    }

    /// Builds the authority named by `auth.authority_url`, falling back to
    /// [`OpenAuthority`] when the URL is empty.
    pub fn from_config(config: &AuthConfig, logger: Arc<Logger>) -> Result<Self, AuthorityError> {
        let url = config.authority_url.trim();
        let authority: Arc<dyn AuthAuthority> = if url.is_empty() {
            logger.warn(
                Some("auth::init"),
                "auth.authority_url is empty; every api key is accepted",
            );
            Arc::new(OpenAuthority)
        } else {
            logger.log(
                LogLevel::Info,
                Some("auth::init"),
                "Using HTTP authentication authority",
                Some(json!({
                    "url": url,
                    "request_timeout_ms": config.request_timeout_ms,
                    "revalidate_interval_ms": config.revalidate_interval_ms
                })),
            );
            Arc::new(HttpAuthority::new(
                url,
                Duration::from_millis(config.request_timeout_ms),
            )?)
        };
        Ok(Self::new(authority, logger))
    }

    fn sets(&self) -> MutexGuard<'_, AuthSets> {
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn validate(&self, api_key: &str, device_id: &str) -> bool {
        let entry = ApiKeyEntry::new(api_key, device_id);
        {
            let sets = self.sets();
            if sets.authenticated.contains(&entry) {
                return true;
            }
            if sets.unauthenticated.contains(&entry) {
                return false;
            }
        }

        let accepted = self.consult(&entry);
        self.sets().record(entry, accepted);
        accepted
    }

    /// Re-checks every known pair against the authority, moving entries whose
    /// verdict changed. Pairs that changed set while the check ran are left alone.
    pub fn revalidate_once(&self) -> RevalidationReport {
        let (authenticated, unauthenticated): (Vec<ApiKeyEntry>, Vec<ApiKeyEntry>) = {
            let sets = self.sets();
            (
                sets.authenticated.iter().cloned().collect(),
                sets.unauthenticated.iter().cloned().collect(),
            )
        };

        let mut report = RevalidationReport {
            checked: authenticated.len() + unauthenticated.len(),
            ..RevalidationReport::default()
        };

        let demoted: Vec<ApiKeyEntry> = authenticated
            .into_iter()
            .filter(|entry| !self.consult(entry))
            .collect();
        let promoted: Vec<ApiKeyEntry> = unauthenticated
            .into_iter()
            .filter(|entry| self.consult(entry))
            .collect();

        let mut sets = self.sets();
        for entry in demoted {
            if sets.authenticated.remove(&entry) {
                sets.unauthenticated.insert(entry);
                report.demoted += 1;
            }
        }
        for entry in promoted {
            if sets.unauthenticated.remove(&entry) {
                sets.authenticated.insert(entry);
                report.promoted += 1;
            }
        }

        report
    }

    pub fn stats(&self) -> AuthStats {
        let sets = self.sets();
        AuthStats {
            authenticated: sets.authenticated.len(),
            unauthenticated: sets.unauthenticated.len(),
        }
    }

    fn consult(&self, entry: &ApiKeyEntry) -> bool {
        match self.authority.authorize(&entry.api_key, &entry.device_id) {
            Ok(accepted) => accepted,
            Err(error) => {
                self.logger.log(
                    LogLevel::Warn,
                    Some("auth::authority"),
                    "Authentication authority call failed; treating pair as unauthenticated",
                    Some(json!({
                        "device_id": entry.device_id,
                        "error": error.to_string()
                    })),
                );
                false
            }
        }
    }
}

impl fmt::Debug for AuthCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCache")
            .field("stats", &self.stats())
            .finish()
    }
}

#[derive(Debug)]
pub enum RevalidatorError {
    AlreadyRunning,
    JoinFailed,
}

impl fmt::Display for RevalidatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "auth revalidator is already running"),
            Self::JoinFailed => write!(f, "auth revalidator thread join failed"),
        }
    }
}

impl std::error::Error for RevalidatorError {}

/// Background thread running [`AuthCache::revalidate_once`] on a fixed interval.
pub struct AuthRevalidator {
    cache: Arc<AuthCache>,
    interval: Duration,
    logger: Arc<Logger>,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AuthRevalidator {
    pub fn new(cache: Arc<AuthCache>, interval: Duration, logger: Arc<Logger>) -> Self {
        Self {
            cache,
            interval,
            logger,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn start(&mut self) -> Result<(), RevalidatorError> {
        if self.worker.is_some() {
            return Err(RevalidatorError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let cache = Arc::clone(&self.cache);
        let logger = Arc::clone(&self.logger);
        let interval = self.interval;

        self.worker = Some(thread::spawn(move || {
            while sleep_unless_stopped(&stop_signal, interval) {
                let report = cache.revalidate_once();
                logger.log(
                    LogLevel::Debug,
                    Some(REVALIDATE_CONTEXT),
                    "Authentication cache revalidated",
                    Some(json!({
                        "report": report,
                        "stats": cache.stats()
                    })),
                );
            }
        }));

        self.logger.log(
            LogLevel::Info,
            Some(REVALIDATE_CONTEXT),
            "Auth revalidator started",
            Some(json!({ "interval_ms": self.interval.as_millis() as u64 })),
        );
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), RevalidatorError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| RevalidatorError::JoinFailed);
        }

        Ok(())
    }
}

impl Drop for AuthRevalidator {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
