//! Per-worker shift counts bucketed by month or ISO week.

use std::collections::{BTreeSet, HashMap};

use clap::ValueEnum;
use serde::Serialize;

use crate::types::{WorkerStats, WorkerStatsEntry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Division {
    #[default]
    Month,
    Week,
}

impl Division {
    /// `YYYY-MM` for months, `{isoyear}w{WW}` for weeks.
    pub fn key(self, entry: &WorkerStatsEntry) -> String {
        match self {
            Division::Month => format!("{}-{:02}", entry.year, entry.month),
            Division::Week => format!("{}w{:02}", entry.isoyear, entry.isoweek),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bucket {
    pub key: String,
    pub count: u32,
}

/// Sums counts per bucket, keeping buckets in the order they first appear.
pub fn aggregate(division: Division, entries: &[WorkerStatsEntry]) -> Vec<Bucket> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut buckets: Vec<Bucket> = Vec::new();
    for entry in entries {
        let key = division.key(entry);
        match positions.get(&key) {
            Some(&at) => buckets[at].count += entry.count,
            None => {
                positions.insert(key.clone(), buckets.len());
                buckets.push(Bucket {
                    key,
                    count: entry.count,
                });
            }
        }
    }
    buckets
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsRow {
    pub id: u64,
    pub name: String,
    /// One cell per column; `None` where the worker has no shifts.
    pub counts: Vec<Option<u32>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsTable {
    pub division: Division,
    pub columns: Vec<String>,
    pub rows: Vec<StatsRow>,
}

impl StatsTable {
    /// Table over active workers only, with the sorted union of bucket keys as
    /// columns.
    pub fn build(division: Division, workers: &[WorkerStats]) -> Self {
        let aggregated = workers
            .iter()
            .filter(|worker| worker.active)
            .map(|worker| (worker, aggregate(division, &worker.stats)))
            .collect::<Vec<_>>();

        let columns = aggregated
            .iter()
            .flat_map(|(_, buckets)| buckets.iter().map(|bucket| bucket.key.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let rows = aggregated
            .into_iter()
            .map(|(worker, buckets)| StatsRow {
                id: worker.id,
                name: worker.name.clone(),
                counts: columns
                    .iter()
                    .map(|column| {
                        buckets
                            .iter()
                            .find(|bucket| bucket.key == *column)
                            .map(|bucket| bucket.count)
                    })
                    .collect(),
            })
            .collect();

        Self {
            division,
            columns,
            rows,
        }
    }
}
