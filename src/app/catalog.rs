use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::app::config::CatalogSettings;
use crate::app::error::AppError;
use crate::app::models::CatalogEntry;

/// Remote list of downloadable applications.
pub trait CatalogSource: Send + Sync {
    fn fetch(&self) -> Result<Vec<CatalogEntry>, AppError>;
}

pub struct HttpCatalogClient {
    url: String,
    agent: ureq::Agent,
    trace_id: String,
}

impl HttpCatalogClient {
    pub fn new(settings: &CatalogSettings, trace_id: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(&settings.user_agent)
            .build();
        Self {
            url: settings.url.clone(),
            agent,
            trace_id: trace_id.to_string(),
        }
    }
}

impl CatalogSource for HttpCatalogClient {
    fn fetch(&self) -> Result<Vec<CatalogEntry>, AppError> {
        debug!(trace_id = %self.trace_id, url = %self.url, "fetching catalog");
        let response = self
            .agent
            .get(&self.url)
            .set("Accept", "application/json")
            .call()
            .map_err(|err| match err {
                ureq::Error::Status(code, _) => AppError::network(
                    format!("Catalog request failed with HTTP {code}"),
                    &self.trace_id,
                ),
                ureq::Error::Transport(transport) => AppError::network(
                    format!("Catalog request failed: {transport}"),
                    &self.trace_id,
                ),
            })?;
        let body = response.into_string().map_err(|err| {
            AppError::network(format!("Failed to read catalog: {err}"), &self.trace_id)
        })?;
        parse_catalog(&body, &self.trace_id)
    }
}

/// One bad element never spoils the rest of the list.
pub fn parse_catalog(body: &str, trace_id: &str) -> Result<Vec<CatalogEntry>, AppError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| AppError::system(format!("Failed to parse catalog: {err}"), trace_id))?;
    let Value::Array(items) = value else {
        return Err(AppError::system("Catalog is not a JSON array", trace_id));
    };

    let total = items.len();
    let mut entries = Vec::with_capacity(total);
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<CatalogEntry>(item) {
            Ok(entry) if entry.is_complete() => entries.push(entry),
            Ok(entry) => debug!(
                trace_id = %trace_id,
                index,
                app_name = %entry.app_name,
                "skipping incomplete catalog entry"
            ),
            Err(err) => warn!(
                trace_id = %trace_id,
                index,
                error = %err,
                "skipping malformed catalog entry"
            ),
        }
    }
    info!(trace_id = %trace_id, total, kept = entries.len(), "catalog parsed");
    Ok(entries)
}

/// Degraded mode: an unreachable catalog behaves like an empty one.
pub fn fetch_catalog_or_empty(source: &dyn CatalogSource, trace_id: &str) -> Vec<CatalogEntry> {
    match source.fetch() {
        Ok(entries) => entries,
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err, "catalog unavailable, continuing without it");
            Vec::new()
        }
    }
}
