use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;

use crate::broker::VoteLog;
use crate::error::SubmitError;
use crate::models::{VoteRecord, VoteRequest};
use crate::store::{DedupStore, PollCatalog, dedup_key};
use crate::telemetry::{Dependency, PipelineEvents};

const MAX_ID_LEN: usize = 128;
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(3600);

lazy_static! {
    // ':' is the dedup key separator and must never appear inside an id
    static ref ID_PATTERN: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Validates and deduplicates submissions, then appends them to the vote
/// log keyed by poll id.
pub struct VoteGateway {
    dedup: Arc<dyn DedupStore>,
    log: Arc<dyn VoteLog>,
    catalog: Option<Arc<dyn PollCatalog>>,
    events: Arc<dyn PipelineEvents>,
    dedup_ttl: Duration,
}

impl VoteGateway {
    pub fn new(
        dedup: Arc<dyn DedupStore>,
        log: Arc<dyn VoteLog>,
        events: Arc<dyn PipelineEvents>,
    ) -> Self {
        Self {
            dedup,
            log,
            catalog: None,
            events,
            dedup_ttl: DEFAULT_DEDUP_TTL,
        }
    }

    /// Reject options that do not belong to the submitted poll. Without a
    /// catalog that check is left to the counter store, which reports
    /// unknown options as not found at flush time.
    pub fn with_catalog(mut self, catalog: Arc<dyn PollCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub async fn submit(&self, request: VoteRequest) -> Result<VoteRecord, SubmitError> {
        let result = self.try_submit(&request).await;

        match &result {
            Ok(record) => {
                self.events
                    .vote_accepted(&record.poll_id, &record.option_id, &record.voter_id)
            }
            Err(reason) => self.events.vote_rejected(
                request.poll_id.as_deref().unwrap_or_default(),
                request.voter_id.as_deref().unwrap_or_default(),
                reason,
            ),
        }

        result
    }

    async fn try_submit(&self, request: &VoteRequest) -> Result<VoteRecord, SubmitError> {
        let poll_id = required("pollId", &request.poll_id)?;
        let option_id = required("optionId", &request.option_id)?;
        let voter_id = required("voterId", &request.voter_id)?;

        if let Some(catalog) = &self.catalog {
            match catalog.option_in_poll(poll_id, option_id).await {
                Ok(true) => self.events.dependency_ok(Dependency::PollCatalog),
                Ok(false) => {
                    self.events.dependency_ok(Dependency::PollCatalog);
                    return Err(SubmitError::InvalidRequest(format!(
                        "option {} does not belong to poll {}",
                        option_id, poll_id
                    )));
                }
                Err(e) => {
                    self.events
                        .dependency_failed(Dependency::PollCatalog, &e.to_string());
                    return Err(SubmitError::Unavailable(e.to_string()));
                }
            }
        }

        // Claim first: the set-if-absent is the dedup check, so two racing
        // submissions cannot both pass it.
        let key = dedup_key(poll_id, voter_id);
        match self.dedup.try_claim(&key, self.dedup_ttl).await {
            Ok(true) => self.events.dependency_ok(Dependency::DedupStore),
            Ok(false) => {
                self.events.dependency_ok(Dependency::DedupStore);
                return Err(SubmitError::AlreadyVoted);
            }
            Err(e) => {
                self.events
                    .dependency_failed(Dependency::DedupStore, &e.to_string());
                return Err(SubmitError::Unavailable(e.to_string()));
            }
        }

        let record = VoteRecord {
            poll_id: poll_id.to_string(),
            option_id: option_id.to_string(),
            voter_id: voter_id.to_string(),
            timestamp: Utc::now(),
        };

        if let Err(e) = self.log.append(poll_id, &record).await {
            self.events.dependency_failed(Dependency::VoteLog, &e.to_string());
            // The vote was never recorded, so the voter must not stay blocked
            if let Err(release_err) = self.dedup.release(&key).await {
                self.events.dedup_release_failed(&key, &release_err);
            }
            return Err(SubmitError::Unavailable(e.to_string()));
        }
        self.events.dependency_ok(Dependency::VoteLog);

        Ok(record)
    }
}

fn required<'a>(field: &str, value: &'a Option<String>) -> Result<&'a str, SubmitError> {
    let value = value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SubmitError::InvalidRequest(format!("{} is required", field)))?;

    if value.len() > MAX_ID_LEN || !ID_PATTERN.is_match(value) {
        return Err(SubmitError::InvalidRequest(format!("{} is malformed", field)));
    }

    Ok(value)
}
