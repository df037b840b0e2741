//! Persistent store port and the in-memory arena implementation.
//!
//! Entities reference each other by id only. Removing one never cascades
//! implicitly; callers clean up dependents first.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::model::{
    Agent, AgentId, Project, ProjectId, Stage, Task, TaskId, Worktree, WorktreeId, WorktreeStatus,
};

/// CRUD and filtered listing for orchestrator entities.
///
/// Implementations must give read-committed isolation or stronger: a `get`
/// after a completed `put` observes that write.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>>;
    async fn put_project(&self, project: &Project) -> Result<()>;
    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;
    async fn put_task(&self, task: &Task) -> Result<()>;
    /// Tasks of a project, optionally restricted to one stage, ordered by position.
    async fn list_tasks(&self, project_id: &ProjectId, stage: Option<Stage>) -> Result<Vec<Task>>;
    /// Removes a task. Fails while it still owns a worktree or an agent.
    async fn delete_task(&self, id: &TaskId) -> Result<()>;

    async fn get_agent(&self, id: &AgentId) -> Result<Option<Agent>>;
    async fn put_agent(&self, agent: &Agent) -> Result<()>;
    async fn list_agents(&self, project_id: &ProjectId) -> Result<Vec<Agent>>;

    async fn get_worktree(&self, id: &WorktreeId) -> Result<Option<Worktree>>;
    async fn put_worktree(&self, worktree: &Worktree) -> Result<()>;
    /// Worktrees of a project, optionally restricted to one status.
    async fn list_worktrees(
        &self,
        project_id: &ProjectId,
        status: Option<WorktreeStatus>,
    ) -> Result<Vec<Worktree>>;
}

/// Fetches an entity or fails with `NotFound`.
#[async_trait]
pub trait StoreExt: Store {
    async fn project(&self, id: &ProjectId) -> Result<Project> {
        self.get_project(id)
            .await?
            .ok_or_else(|| Error::not_found("project", id))
    }

    async fn task(&self, id: &TaskId) -> Result<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| Error::not_found("task", id))
    }

    async fn agent(&self, id: &AgentId) -> Result<Agent> {
        self.get_agent(id)
            .await?
            .ok_or_else(|| Error::not_found("agent", id))
    }

    async fn worktree(&self, id: &WorktreeId) -> Result<Worktree> {
        self.get_worktree(id)
            .await?
            .ok_or_else(|| Error::not_found("worktree", id))
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

#[derive(Default)]
struct Arena {
    projects: HashMap<ProjectId, Project>,
    tasks: HashMap<TaskId, Task>,
    agents: HashMap<AgentId, Agent>,
    worktrees: HashMap<WorktreeId, Worktree>,
}

/// Process-local store keyed by id.
#[derive(Default)]
pub struct InMemoryStore {
    arena: RwLock<Arena>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        Ok(self.arena.read().projects.get(id).cloned())
    }

    async fn put_project(&self, project: &Project) -> Result<()> {
        self.arena
            .write()
            .projects
            .insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = self.arena.read().projects.values().cloned().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.arena.read().tasks.get(id).cloned())
    }

    async fn put_task(&self, task: &Task) -> Result<()> {
        self.arena.write().tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn list_tasks(&self, project_id: &ProjectId, stage: Option<Stage>) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .arena
            .read()
            .tasks
            .values()
            .filter(|t| &t.project_id == project_id)
            .filter(|t| stage.map_or(true, |s| t.stage == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn delete_task(&self, id: &TaskId) -> Result<()> {
        let mut arena = self.arena.write();
        let Some(task) = arena.tasks.get(id) else {
            return Err(Error::not_found("task", id));
        };
        if task.worktree_id.is_some() || task.agent_id.is_some() {
            return Err(Error::Validation(format!(
                "task {} still has a worktree or agent attached",
                id
            )));
        }
        let bound = arena
            .agents
            .values()
            .any(|a| a.current_task_id.as_ref() == Some(id));
        if bound {
            return Err(Error::Validation(format!(
                "task {} is still bound to an agent",
                id
            )));
        }
        arena.tasks.remove(id);
        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Option<Agent>> {
        Ok(self.arena.read().agents.get(id).cloned())
    }

    async fn put_agent(&self, agent: &Agent) -> Result<()> {
        self.arena
            .write()
            .agents
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn list_agents(&self, project_id: &ProjectId) -> Result<Vec<Agent>> {
        Ok(self
            .arena
            .read()
            .agents
            .values()
            .filter(|a| &a.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_worktree(&self, id: &WorktreeId) -> Result<Option<Worktree>> {
        Ok(self.arena.read().worktrees.get(id).cloned())
    }

    async fn put_worktree(&self, worktree: &Worktree) -> Result<()> {
        self.arena
            .write()
            .worktrees
            .insert(worktree.id.clone(), worktree.clone());
        Ok(())
    }

    async fn list_worktrees(
        &self,
        project_id: &ProjectId,
        status: Option<WorktreeStatus>,
    ) -> Result<Vec<Worktree>> {
        let mut worktrees: Vec<Worktree> = self
            .arena
            .read()
            .worktrees
            .values()
            .filter(|w| &w.project_id == project_id)
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        worktrees.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(worktrees)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ToolSet;

    #[tokio::test]
    async fn tasks_are_filtered_and_ordered() {
        let store = InMemoryStore::new();
        let project = ProjectId::from("p1");

        let mut second = Task::new(project.clone(), "second");
        second.position = 1;
        let first = Task::new(project.clone(), "first");
        let mut other = Task::new(ProjectId::from("p2"), "other");
        other.stage = Stage::Verified;

        store.put_task(&second).await.unwrap();
        store.put_task(&first).await.unwrap();
        store.put_task(&other).await.unwrap();

        let tasks = store.list_tasks(&project, None).await.unwrap();
        let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second"]);

        let verified = store
            .list_tasks(&ProjectId::from("p2"), Some(Stage::Verified))
            .await
            .unwrap();
        assert_eq!(verified.len(), 1);
    }

    #[tokio::test]
    async fn delete_task_refuses_live_dependents() {
        let store = InMemoryStore::new();
        let mut task = Task::new(ProjectId::from("p"), "busy");
        task.worktree_id = Some(WorktreeId::from("w"));
        store.put_task(&task).await.unwrap();

        assert!(matches!(
            store.delete_task(&task.id).await,
            Err(Error::Validation(_))
        ));

        task.worktree_id = None;
        store.put_task(&task).await.unwrap();
        let mut agent = Agent::new(ProjectId::from("p"), 10, ToolSet::empty());
        agent.current_task_id = Some(task.id.clone());
        store.put_agent(&agent).await.unwrap();
        assert!(store.delete_task(&task.id).await.is_err());

        agent.current_task_id = None;
        store.put_agent(&agent).await.unwrap();
        store.delete_task(&task.id).await.unwrap();
        assert!(store.get_task(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ext_lookups_report_not_found() {
        let store = InMemoryStore::new();
        let err = store.task(&TaskId::from("missing")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "task", .. }));
    }
}
