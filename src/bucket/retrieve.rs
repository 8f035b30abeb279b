//! Reconciled retrieval across the Datasources matching a query

use super::{resolve_members, Bucket};
use crate::backend::payload;
use crate::daterange::{self, DateRange};
use crate::metadata::Filters;
use crate::ranking::{GroupKey, RankEntry, Resolution, ResolvedSpan};
use crate::{Error, Result};

use arrow_array::RecordBatch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of [`Bucket::get`].
#[derive(Debug, Clone)]
pub struct RetrievedData {
    /// Rows of every resolved span in time order, with a `source` column
    pub data: Option<RecordBatch>,
    /// Full partition of the requested range
    pub spans: Vec<ResolvedSpan>,
    /// Spans several Datasources could supply and no rank decides
    pub unresolved: Vec<ResolvedSpan>,
    /// Windows with no data from the chosen Datasource
    pub gaps: Vec<DateRange>,
}

impl RetrievedData {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty() && self.gaps.is_empty()
    }
}

impl Bucket {
    /// Data matching `filters` over `range`, one Datasource per span.
    ///
    /// A single match supplies everything it has. Several matches are a
    /// ranking group: the filters, which must name one value per key, form
    /// the group key and stored ranks pick the Datasource of each span.
    pub async fn get(&self, filters: &Filters, range: &DateRange) -> Result<RetrievedData> {
        let catalog = self.catalog.snapshot().await?;
        let members = catalog.search_datasources(filters);

        let entries: Vec<RankEntry> = match members.as_slice() {
            [] => {
                return Err(Error::DatasourceLookup(format!(
                    "no datasource in bucket '{}' matches the filters",
                    self.name
                )))
            }
            [_] => Vec::new(),
            several => {
                let group = GroupKey::from_filters(filters).map_err(|e| {
                    Error::DatasourceLookup(format!(
                        "filters match {} datasources and cannot name a ranking group: {}",
                        several.len(),
                        e
                    ))
                })?;
                self.ranks.get_ranks(&group).await?
            }
        };

        let spans = resolve_members(&members, &entries, range);
        let coverage = |uuid: Uuid| {
            members
                .iter()
                .find(|datasource| datasource.uuid() == uuid)
                .map(|datasource| datasource.coverage())
                .unwrap_or_default()
        };

        let mut batches = Vec::new();
        let mut unresolved = Vec::new();
        let mut gaps = Vec::new();
        for span in &spans {
            match &span.resolution {
                Resolution::Ranked { datasource, .. } | Resolution::Fallback { datasource } => {
                    gaps.extend(daterange::gaps(&coverage(*datasource), &span.range));
                    if let Some(rows) = self.get_payload(datasource, Some(&span.range)).await? {
                        batches.push(payload::with_source(&rows, &datasource.to_string())?);
                    }
                }
                Resolution::Unresolved { candidates } => {
                    warn!(
                        bucket = %self.name,
                        range = %span.range,
                        candidates = candidates.len(),
                        "No rank decides between datasources"
                    );
                    unresolved.push(span.clone());
                }
                Resolution::NoData => gaps.push(span.range),
            }
        }

        let data = payload::concat(&batches)?;
        debug!(
            bucket = %self.name,
            range = %range,
            spans = spans.len(),
            rows = data.as_ref().map_or(0, |batch| batch.num_rows()),
            "Retrieved data"
        );
        Ok(RetrievedData {
            data,
            spans,
            unresolved,
            gaps: daterange::merge_adjacent(gaps),
        })
    }
}
