//! Query Jobs
//!
//! Background fan-out queries addressed by a UUID. A job is removed once its
//! finished result has been fetched, or when it outlives the TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AggregateResult;
use crate::changelog::Value;
use crate::partition::MonthKey;

/// A submitted query and, once finished, its aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryJob {
    pub query_id: Uuid,
    pub sql: String,
    pub params: Vec<Value>,
    pub month: MonthKey,
    pub result: Option<AggregateResult>,
    pub error: Option<String>,
    pub completed: bool,
    /// Seconds, set on completion
    pub execution_time: Option<f64>,
    pub submitted_at: DateTime<Utc>,
}

struct Slot {
    job: QueryJob,
    created: Instant,
}

/// In-memory job table
pub struct QueryJobStore {
    jobs: Mutex<HashMap<Uuid, Slot>>,
    ttl: Duration,
}

impl QueryJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Register a pending job and return its id
    pub fn insert_pending(&self, sql: &str, params: Vec<Value>, month: MonthKey) -> Uuid {
        self.purge_expired();

        let query_id = Uuid::new_v4();
        let job = QueryJob {
            query_id,
            sql: sql.to_string(),
            params,
            month,
            result: None,
            error: None,
            completed: false,
            execution_time: None,
            submitted_at: Utc::now(),
        };
        self.jobs.lock().insert(
            query_id,
            Slot {
                job,
                created: Instant::now(),
            },
        );
        query_id
    }

    /// Store the outcome of a job; unknown (expired) ids are ignored
    pub fn complete(&self, query_id: Uuid, outcome: crate::Result<AggregateResult>) {
        let mut jobs = self.jobs.lock();
        let Some(slot) = jobs.get_mut(&query_id) else {
            tracing::debug!(%query_id, "Dropping result of expired query job");
            return;
        };
        slot.job.completed = true;
        slot.job.execution_time = Some(slot.created.elapsed().as_secs_f64());
        match outcome {
            Ok(result) => slot.job.result = Some(result),
            Err(e) => slot.job.error = Some(e.to_string()),
        }
    }

    /// Fetch a job; completed jobs are removed by this call
    pub fn take(&self, query_id: &Uuid) -> Option<QueryJob> {
        self.purge_expired();

        let mut jobs = self.jobs.lock();
        let completed = jobs.get(query_id)?.job.completed;
        if completed {
            jobs.remove(query_id).map(|slot| slot.job)
        } else {
            jobs.get(query_id).map(|slot| slot.job.clone())
        }
    }

    /// Drop jobs older than the TTL, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, slot| slot.created.elapsed() < self.ttl);
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
