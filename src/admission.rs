//! Per-project admission control.
//!
//! Each project has its own critical section guarding a running set and a
//! FIFO queue, so `running <= limit` holds under any interleaving of
//! [`AdmissionController::try_admit`] and [`AdmissionController::release`]
//! for that project while other projects proceed independently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::AdmissionConfig;
use crate::error::{Error, Result};
use crate::model::{AgentId, ProjectId, TaskId};

/// A (task, agent) pair waiting for or holding a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRun {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingRun {
    pub fn new(task_id: TaskId, agent_id: AgentId) -> Self {
        Self {
            task_id,
            agent_id,
            enqueued_at: Utc::now(),
        }
    }
}

/// Outcome of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Admission {
    Admitted,
    /// 1-based position in the project's queue.
    Queued { position: usize },
}

#[derive(Debug)]
struct ProjectSlots {
    limit: usize,
    running: HashSet<TaskId>,
    queue: VecDeque<PendingRun>,
}

impl ProjectSlots {
    fn queue_position(&self, task_id: &TaskId) -> Option<usize> {
        self.queue
            .iter()
            .position(|p| &p.task_id == task_id)
            .map(|i| i + 1)
    }

    /// Promotes queued runs while capacity allows, oldest first.
    fn promote(&mut self) -> Vec<PendingRun> {
        let mut promoted = Vec::new();
        while self.running.len() < self.limit {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            self.running.insert(next.task_id.clone());
            promoted.push(next);
        }
        promoted
    }
}

/// Bounds concurrently running agents per project.
pub struct AdmissionController {
    default_limit: usize,
    queue_capacity: Option<usize>,
    overrides: HashMap<String, usize>,
    projects: RwLock<HashMap<ProjectId, Arc<Mutex<ProjectSlots>>>>,
}

impl AdmissionController {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            default_limit: config.default_max_concurrent,
            queue_capacity: config.queue_capacity,
            overrides: config.projects.clone(),
            projects: RwLock::new(HashMap::new()),
        }
    }

    /// Controller with one limit for every project and an unbounded queue.
    pub fn with_limit(limit: usize) -> Self {
        Self::new(&AdmissionConfig {
            default_max_concurrent: limit,
            ..AdmissionConfig::default()
        })
    }

    fn configured_limit(&self, project_id: &ProjectId) -> usize {
        self.overrides
            .get(project_id.as_str())
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Slots of a project that has been admitted into before.
    fn existing(&self, project_id: &ProjectId) -> Option<Arc<Mutex<ProjectSlots>>> {
        self.projects.read().get(project_id).cloned()
    }

    fn slots(&self, project_id: &ProjectId) -> Arc<Mutex<ProjectSlots>> {
        if let Some(slots) = self.existing(project_id) {
            return slots;
        }
        let limit = self.configured_limit(project_id);
        self.projects
            .write()
            .entry(project_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ProjectSlots {
                    limit,
                    running: HashSet::new(),
                    queue: VecDeque::new(),
                }))
            })
            .clone()
    }

    /// Admits the run if the project has capacity and nobody is waiting ahead
    /// of it; otherwise queues it.
    ///
    /// Re-requesting for a task that already holds a slot or is already queued
    /// reports its current state without counting it twice.
    pub fn try_admit(&self, project_id: &ProjectId, run: PendingRun) -> Result<Admission> {
        let slots = self.slots(project_id);
        let mut slots = slots.lock();

        if slots.limit == 0 {
            return Err(Error::LimitExceeded {
                project_id: project_id.to_string(),
                limit: 0,
            });
        }
        if slots.running.contains(&run.task_id) {
            return Ok(Admission::Admitted);
        }
        if let Some(position) = slots.queue_position(&run.task_id) {
            return Ok(Admission::Queued { position });
        }

        if slots.running.len() < slots.limit && slots.queue.is_empty() {
            slots.running.insert(run.task_id.clone());
            tracing::debug!(
                project_id = %project_id,
                task_id = %run.task_id,
                running = slots.running.len(),
                limit = slots.limit,
                "admitted"
            );
            return Ok(Admission::Admitted);
        }

        if let Some(capacity) = self.queue_capacity {
            if slots.queue.len() >= capacity {
                return Err(Error::QueueFull {
                    project_id: project_id.to_string(),
                    capacity,
                });
            }
        }

        let task_id = run.task_id.clone();
        slots.queue.push_back(run);
        let position = slots.queue.len();
        tracing::debug!(
            project_id = %project_id,
            task_id = %task_id,
            position,
            "queued"
        );
        Ok(Admission::Queued { position })
    }

    /// Frees the slot held by `task_id` and promotes the oldest queued run if
    /// capacity allows. Releasing a task that holds no slot is a no-op.
    pub fn release(&self, project_id: &ProjectId, task_id: &TaskId) -> Option<PendingRun> {
        let slots = self.existing(project_id)?;
        let mut slots = slots.lock();
        if !slots.running.remove(task_id) {
            return None;
        }
        let promoted = slots.promote().into_iter().next();
        tracing::debug!(
            project_id = %project_id,
            task_id = %task_id,
            promoted = ?promoted.as_ref().map(|p| p.task_id.as_str()),
            "released"
        );
        promoted
    }

    /// Removes a waiting run. Returns false if it was not queued.
    pub fn cancel_queued(&self, project_id: &ProjectId, task_id: &TaskId) -> bool {
        let Some(slots) = self.existing(project_id) else {
            return false;
        };
        let mut slots = slots.lock();
        let before = slots.queue.len();
        slots.queue.retain(|p| &p.task_id != task_id);
        before != slots.queue.len()
    }

    /// Changes a project's limit. Raising it promotes queued runs immediately.
    ///
    /// A limit below the number of runs already holding slots is refused
    /// with `LimitExceeded`; running agents are never preempted.
    pub fn set_limit(&self, project_id: &ProjectId, limit: usize) -> Result<Vec<PendingRun>> {
        let slots = self.slots(project_id);
        let mut slots = slots.lock();
        if limit < slots.running.len() {
            return Err(Error::LimitExceeded {
                project_id: project_id.to_string(),
                limit,
            });
        }
        slots.limit = limit;
        Ok(slots.promote())
    }

    pub fn limit(&self, project_id: &ProjectId) -> usize {
        match self.existing(project_id) {
            Some(slots) => slots.lock().limit,
            None => self.configured_limit(project_id),
        }
    }

    pub fn running_count(&self, project_id: &ProjectId) -> usize {
        self.existing(project_id)
            .map_or(0, |slots| slots.lock().running.len())
    }

    pub fn is_running(&self, project_id: &ProjectId, task_id: &TaskId) -> bool {
        self.existing(project_id)
            .is_some_and(|slots| slots.lock().running.contains(task_id))
    }

    /// Snapshot of the queue, oldest first.
    pub fn queued(&self, project_id: &ProjectId) -> Vec<PendingRun> {
        self.existing(project_id)
            .map(|slots| slots.lock().queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_position(&self, project_id: &ProjectId, task_id: &TaskId) -> Option<usize> {
        let slots = self.existing(project_id)?;
        let slots = slots.lock();
        slots.queue_position(task_id)
    }

    /// Number of projects with admission state.
    pub fn tracked_projects(&self) -> usize {
        self.projects.read().len()
    }
}
