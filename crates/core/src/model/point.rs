use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{ChunkKey, RestoringChunk, RestoringData, RestoringHealth};
use crate::util::{point_token, utc_now};

/// A point under construction, exclusively owned by the assembly pipeline.
#[derive(Debug)]
pub struct PointDraft {
    inner: RestoringPoint,
}

impl PointDraft {
    /// Allocates a new point id of the form `<YmdHis>-<token>` from the current time.
    #[must_use]
    pub fn new(nc_version: impl Into<String>, complete: bool) -> Self {
        Self::at(utc_now(), nc_version, complete)
    }

    #[must_use]
    pub fn at(date: DateTime<Utc>, nc_version: impl Into<String>, complete: bool) -> Self {
        let id = format!("{}-{}", date.format("%Y%m%d%H%M%S"), point_token());
        Self::with_id(id, date.timestamp(), nc_version, complete)
    }

    #[must_use]
    pub fn with_id(
        id: impl Into<String>,
        date: i64,
        nc_version: impl Into<String>,
        complete: bool,
    ) -> Self {
        Self {
            inner: RestoringPoint {
                id: id.into(),
                date,
                nc_version: nc_version.into(),
                complete,
                restoring_data: Vec::new(),
                chunks: BTreeMap::new(),
                health: None,
            },
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn date(&self) -> i64 {
        self.inner.date
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.complete
    }

    #[must_use]
    pub fn nc_version(&self) -> &str {
        &self.inner.nc_version
    }

    #[must_use]
    pub fn restoring_data(&self) -> &[RestoringData] {
        &self.inner.restoring_data
    }

    pub fn add_data(&mut self, data: RestoringData) {
        self.inner.restoring_data.push(data);
    }

    /// Appends chunks to a dataset, keeping insertion order.
    pub fn add_chunks(&mut self, data_name: &str, chunks: impl IntoIterator<Item = RestoringChunk>) {
        self.inner
            .chunks
            .entry(data_name.to_string())
            .or_default()
            .extend(chunks);
    }

    #[must_use]
    pub fn chunks(&self) -> &BTreeMap<String, Vec<RestoringChunk>> {
        &self.inner.chunks
    }

    /// Freezes the point. After this only health can be attached.
    #[must_use]
    pub fn seal(self) -> RestoringPoint {
        self.inner
    }
}

/// A sealed restoring point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoringPoint {
    id: String,
    date: i64,
    nc_version: String,
    #[serde(default)]
    complete: bool,
    restoring_data: Vec<RestoringData>,
    chunks: BTreeMap<String, Vec<RestoringChunk>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    health: Option<RestoringHealth>,
}

impl RestoringPoint {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn date(&self) -> i64 {
        self.date
    }

    #[must_use]
    pub fn date_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.date, 0).single()
    }

    #[must_use]
    pub fn nc_version(&self) -> &str {
        &self.nc_version
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    #[must_use]
    pub fn restoring_data(&self) -> &[RestoringData] {
        &self.restoring_data
    }

    #[must_use]
    pub fn data(&self, name: &str) -> Option<&RestoringData> {
        self.restoring_data.iter().find(|data| data.name() == name)
    }

    #[must_use]
    pub fn chunks(&self) -> &BTreeMap<String, Vec<RestoringChunk>> {
        &self.chunks
    }

    #[must_use]
    pub fn chunks_of(&self, data_name: &str) -> &[RestoringChunk] {
        self.chunks
            .get(data_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn find_chunk(&self, key: &ChunkKey) -> Option<&RestoringChunk> {
        self.chunks_of(&key.data)
            .iter()
            .find(|chunk| chunk.name() == key.chunk)
    }

    /// Every chunk with its key: datasets in declaration order, then any
    /// chunk groups without a declared dataset, chunks in recorded order.
    #[must_use]
    pub fn chunk_entries(&self) -> Vec<(ChunkKey, &RestoringChunk)> {
        let mut names: Vec<&str> = Vec::with_capacity(self.chunks.len());
        for data in &self.restoring_data {
            if !names.contains(&data.name()) {
                names.push(data.name());
            }
        }
        for name in self.chunks.keys() {
            if !names.contains(&name.as_str()) {
                names.push(name.as_str());
            }
        }

        names
            .into_iter()
            .flat_map(|name| {
                self.chunks_of(name)
                    .iter()
                    .map(move |chunk| (ChunkKey::new(name, chunk.name()), chunk))
            })
            .collect()
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.values().map(Vec::len).sum()
    }

    /// Whether a verification pass has attached health. Absence means unknown.
    #[must_use]
    pub fn has_health(&self) -> bool {
        self.health.is_some()
    }

    #[must_use]
    pub fn health(&self) -> Option<&RestoringHealth> {
        self.health.as_ref()
    }

    pub fn set_health(&mut self, health: RestoringHealth) {
        self.health = Some(health);
    }

    pub fn clear_health(&mut self) {
        self.health = None;
    }

    #[must_use]
    pub fn with_health(mut self, health: RestoringHealth) -> Self {
        self.set_health(health);
        self
    }

    #[must_use]
    pub fn without_health(mut self) -> Self {
        self.clear_health();
        self
    }
}
