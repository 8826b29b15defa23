//! Queue message types shared by every transport.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};
use crate::work_item::{DatasetRef, WorkItem, WorkItemId};

/// Reference to one work item, as carried on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub job_id: JobId,
    pub item_id: WorkItemId,
    pub dataset: DatasetRef,
    pub tool: String,
    pub query: String,
}

impl WorkMessage {
    /// Build the message for an item of the given job.
    pub fn for_item(job: &Job, item: &WorkItem) -> Self {
        Self {
            job_id: job.id,
            item_id: item.id,
            dataset: item.dataset.clone(),
            tool: job.tool.clone(),
            query: job.query.clone(),
        }
    }
}

/// Acknowledgement handle for one delivery.
///
/// `delivery` names the message inside its transport; `lease`, when present,
/// identifies this particular delivery of it so a stale consumer cannot
/// finalize a message that has since been redelivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle {
    pub delivery: String,
    pub lease: Option<String>,
}

impl AckHandle {
    pub fn new(delivery: impl Into<String>) -> Self {
        Self {
            delivery: delivery.into(),
            lease: None,
        }
    }

    pub fn leased(delivery: impl Into<String>, lease: impl Into<String>) -> Self {
        Self {
            delivery: delivery.into(),
            lease: Some(lease.into()),
        }
    }
}

impl std::fmt::Display for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.lease {
            Some(lease) => write!(f, "{}#{}", self.delivery, lease),
            None => f.write_str(&self.delivery),
        }
    }
}

/// A dequeued message plus the handle needed to finalize it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: WorkMessage,
    pub handle: AckHandle,
    /// How many times this message has been handed out, this one included.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
