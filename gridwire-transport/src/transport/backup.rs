//! Cross-site backups.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::error::TransportError;
use crate::request::ReplyHandle;
use crate::response::Response;

/// One remote site a command is replicated to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XSiteBackup {
    /// Site name, as known to the substrate's relay.
    pub site: String,
    /// Whether the caller waits for the site to answer.
    pub sync: bool,
    /// How long a synchronous backup may take.
    pub timeout: Duration,
}

impl XSiteBackup {
    /// A backup the caller waits for.
    pub fn synchronous(site: impl Into<String>, timeout: Duration) -> Self {
        Self {
            site: site.into(),
            sync: true,
            timeout,
        }
    }

    /// A fire-and-forget backup.
    pub fn asynchronous(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            sync: false,
            timeout: Duration::ZERO,
        }
    }
}

/// Synchronous backups still in flight.
pub struct BackupResponse<V> {
    pending: Vec<(String, ReplyHandle<Response<V>>)>,
}

impl<V> BackupResponse<V> {
    pub(crate) fn new(pending: Vec<(String, ReplyHandle<Response<V>>)>) -> Self {
        Self { pending }
    }

    /// Whether no synchronous backup was sent.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Sites with a synchronous backup in flight.
    pub fn sites(&self) -> Vec<&str> {
        self.pending.iter().map(|(site, _)| site.as_str()).collect()
    }

    /// Wait for every site to answer, fail or time out.
    ///
    /// A failing site never hides the outcome of the others.
    pub async fn wait_for_backup_to_finish(self) -> BackupOutcome<V> {
        let mut outcome = BackupOutcome {
            succeeded: BTreeMap::new(),
            failed: BTreeMap::new(),
        };
        for (site, handle) in self.pending {
            match handle.await {
                Ok(response) => {
                    outcome.succeeded.insert(site, response);
                }
                Err(err) => {
                    debug!(site = %site, error = %err, "backup failed");
                    outcome.failed.insert(site, err);
                }
            }
        }
        outcome
    }
}

/// Per-site result of a backup.
#[derive(Debug)]
pub struct BackupOutcome<V> {
    /// Sites that answered, with their response.
    pub succeeded: BTreeMap<String, Response<V>>,
    /// Sites that failed, timed out or became unreachable.
    pub failed: BTreeMap<String, TransportError>,
}

impl<V> BackupOutcome<V> {
    /// Whether every site answered.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outcome_separates_sites() {
        let response = BackupResponse::new(vec![
            ("lon".to_string(), ReplyHandle::ready(Ok(Response::success(1u32)))),
            (
                "nyc".to_string(),
                ReplyHandle::ready(Err(TransportError::SiteUnreachable {
                    site: "nyc".to_string(),
                })),
            ),
        ]);
        assert_eq!(response.sites(), vec!["lon", "nyc"]);

        let outcome = response.wait_for_backup_to_finish().await;
        assert!(!outcome.is_success());
        assert_eq!(outcome.succeeded["lon"], Response::success(1));
        assert!(matches!(
            outcome.failed["nyc"],
            TransportError::SiteUnreachable { .. }
        ));
    }

    #[test]
    fn test_backup_constructors() {
        let sync = XSiteBackup::synchronous("lon", Duration::from_secs(2));
        assert!(sync.sync);
        assert!(!XSiteBackup::asynchronous("nyc").sync);
    }
}
