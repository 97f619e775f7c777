use std::collections::HashMap;
use std::sync::Arc;

use relay_contracts::{ConduitEnvelope, PhidRecord};
use relay_kernel::{dig, render_fragments, DigError, ERROR_CATEGORY};
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::activity::ActivityLog;
use crate::cache::LookupCache;

const API_TOKEN_FIELD: &str = "api.token";

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("tracker answered HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("conduit error {code}: {info}")]
    Conduit { code: String, info: String },
    #[error("expected exactly one paste, found {0}")]
    PasteCount(usize),
    #[error(transparent)]
    Path(#[from] DigError),
}

/// Conduit client for the two calls the relay makes.
pub struct TrackerClient {
    client: Client,
    api_token: String,
    phid_query_url: String,
    paste_search_url: String,
}

impl TrackerClient {
    pub fn new(cfg: &relay_config::Tracker) -> Result<Self, String> {
        let client = Client::builder().build().map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            api_token: cfg.api_token.clone(),
            phid_query_url: cfg.phid_query_url(),
            paste_search_url: cfg.paste_search_url(),
        })
    }

    async fn call(&self, url: &str, params: Vec<(String, String)>) -> Result<Value, TrackerError> {
        let mut form = vec![(API_TOKEN_FIELD.to_string(), self.api_token.clone())];
        form.extend(params);

        let response = self.client.post(url).form(&form).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(TrackerError::Status(status.as_u16()));
        }
        let envelope: ConduitEnvelope =
            serde_json::from_slice(&body).map_err(|e| TrackerError::Malformed(e.to_string()))?;
        if let Some(code) = envelope.error_code {
            let info = envelope.error_info.unwrap_or_default();
            if envelope.result.is_null() {
                return Err(TrackerError::Conduit { code, info });
            }
            warn!(%code, %info, "conduit returned an error code alongside a result");
        }
        Ok(envelope.result)
    }

    /// One batched `phid.query`. Entries that do not decode are logged and
    /// left out.
    pub async fn query_phids(&self, phids: &[String]) -> Result<Vec<PhidRecord>, TrackerError> {
        let params = phids
            .iter()
            .enumerate()
            .map(|(i, phid)| (format!("phids[{i}]"), phid.clone()))
            .collect();
        let result = self.call(&self.phid_query_url, params).await?;
        let entries = match result {
            Value::Object(entries) => entries,
            // PHP encodes an empty map as a list.
            Value::Array(items) if items.is_empty() => return Ok(Vec::new()),
            other => {
                return Err(TrackerError::Malformed(format!(
                    "phid.query result is not an object: {other}"
                )))
            }
        };

        let mut records = Vec::with_capacity(entries.len());
        for (key, entry) in entries {
            match serde_json::from_value::<PhidRecord>(entry) {
                Ok(rec) => records.push(rec),
                Err(e) => warn!(%key, error = %e, "skipping malformed phid.query entry"),
            }
        }
        Ok(records)
    }

    /// `paste.search` for a single paste, returning the parsed JSON object
    /// stored in its content.
    pub async fn fetch_alias_table(&self, paste_phid: &str) -> Result<AliasTable, TrackerError> {
        let params = vec![
            ("queryKey".to_string(), "active".to_string()),
            ("attachments[content]".to_string(), "1".to_string()),
            ("constraints[phids][0]".to_string(), paste_phid.to_string()),
        ];
        let result = self.call(&self.paste_search_url, params).await?;
        let data = dig(&result, &["data"])?
            .as_array()
            .ok_or_else(|| TrackerError::Malformed("paste.search data is not a list".into()))?;
        if data.len() != 1 {
            return Err(TrackerError::PasteCount(data.len()));
        }
        let content = dig(&data[0], &["attachments", "content", "content"])?
            .as_str()
            .ok_or_else(|| TrackerError::Malformed("paste content is not a string".into()))?;
        let entries: HashMap<String, String> = serde_json::from_str(content)
            .map_err(|e| TrackerError::Malformed(format!("invalid paste json: {e}")))?;
        Ok(AliasTable::new(entries))
    }
}

/// Display name to alias, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    entries: HashMap<String, String>,
}

impl AliasTable {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Best effort: any failure leaves the relay running with no aliases.
pub async fn load_aliases(
    tracker: &TrackerClient,
    paste_phid: &str,
    activity: &ActivityLog,
) -> AliasTable {
    match tracker.fetch_alias_table(paste_phid).await {
        Ok(table) => {
            debug!(count = table.len(), "lookups resolved");
            table
        }
        Err(e) => {
            error!(paste = %paste_phid, error = %e, "unable to load lookups");
            activity.record(ERROR_CATEGORY, format!("lookups {paste_phid}: {e}"));
            AliasTable::default()
        }
    }
}

pub struct Resolver {
    tracker: Arc<TrackerClient>,
    cache: Arc<LookupCache>,
    aliases: Arc<AliasTable>,
    activity: ActivityLog,
}

impl Resolver {
    pub fn new(
        tracker: Arc<TrackerClient>,
        cache: Arc<LookupCache>,
        aliases: Arc<AliasTable>,
        activity: ActivityLog,
    ) -> Self {
        Self {
            tracker,
            cache,
            aliases,
            activity,
        }
    }

    /// Fragments for every resolvable id in `phids`, sorted by text.
    ///
    /// Cache misses are fetched in one batched call; ids another request is
    /// already fetching are waited on instead. Every input id gets an
    /// activity line, empty when it could not be resolved.
    pub async fn resolve(&self, phids: &[String]) -> Vec<String> {
        let mut claim = self.cache.claim(phids);
        if !claim.owned().is_empty() {
            debug!(count = claim.owned().len(), "calling to resolve phids");
            match self.tracker.query_phids(claim.owned()).await {
                Ok(records) => {
                    for rec in records {
                        let fragments = render_fragments(&rec, self.aliases.get(&rec.name));
                        self.cache.put(rec.phid, fragments);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "phid.query failed");
                    self.activity
                        .record(ERROR_CATEGORY, format!("phid.query: {e}"));
                }
            }
            self.cache.release(&mut claim);
        }
        claim.wait_pending().await;

        let mut results = Vec::new();
        for phid in phids {
            let fragments = self.cache.get(phid);
            let refs = fragments
                .as_deref()
                .map(|f| f.join(" "))
                .unwrap_or_default();
            if let Some(fragments) = fragments {
                results.extend(fragments.iter().cloned());
            }
            self.activity.record(phid.as_str(), refs);
        }
        results.sort();
        results
    }
}
