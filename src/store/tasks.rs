use super::Store;
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
            ScheduleType::Once => "once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cron" => Some(ScheduleType::Cron),
            "interval" => Some(ScheduleType::Interval),
            "once" => Some(ScheduleType::Once),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// Reuse the group's session so the task continues the conversation.
    Group,
    /// Fresh session every run.
    Isolated,
}

impl ContextMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextMode::Group => "group",
            ContextMode::Isolated => "isolated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "group" => Some(ContextMode::Group),
            "isolated" => Some(ContextMode::Isolated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Paused => "paused",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "paused" => Some(TaskStatus::Paused),
            "done" => Some(TaskStatus::Done),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// A scheduled agent run. `active` tasks keep a future `next_run` except
/// `once` tasks already past their fire time, which are due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<String>,
    pub status: TaskStatus,
    pub created_at: String,
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let schedule_type: String = row.get(4)?;
    let context_mode: String = row.get(6)?;
    let status: String = row.get(8)?;
    Ok(Task {
        id: row.get(0)?,
        group_folder: row.get(1)?,
        chat_jid: row.get(2)?,
        prompt: row.get(3)?,
        schedule_type: ScheduleType::parse(&schedule_type).unwrap_or(ScheduleType::Once),
        schedule_value: row.get(5)?,
        context_mode: ContextMode::parse(&context_mode).unwrap_or(ContextMode::Group),
        next_run: row.get(7)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        created_at: row.get(9)?,
    })
}

const TASK_COLUMNS: &str = "id, group_folder, chat_jid, prompt, schedule_type, \
                            schedule_value, context_mode, next_run, status, created_at";

impl Store {
    pub fn create_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO tasks
                 (id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                  context_mode, next_run, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_type.as_str(),
                task.schedule_value,
                task.context_mode.as_str(),
                task.next_run,
                task.status.as_str(),
                task.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"),
            [id],
            row_to_task,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at"))?;
        let rows: Result<Vec<_>, _> = stmt.query_map([], row_to_task)?.collect();
        rows.map_err(Into::into)
    }

    pub fn tasks_for_group(&self, group_folder: &str) -> Result<Vec<Task>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE group_folder = ? ORDER BY created_at"
        ))?;
        let rows: Result<Vec<_>, _> = stmt.query_map([group_folder], row_to_task)?.collect();
        rows.map_err(Into::into)
    }

    /// Active tasks whose `next_run` is at or before `now`.
    pub fn due_tasks(&self, now: &str) -> Result<Vec<Task>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?
             ORDER BY next_run ASC"
        ))?;
        let rows: Result<Vec<_>, _> = stmt.query_map([now], row_to_task)?.collect();
        rows.map_err(Into::into)
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ? WHERE id = ?",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn set_next_run(&self, id: &str, next_run: Option<&str>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE tasks SET next_run = ? WHERE id = ?",
            params![next_run, id],
        )?;
        Ok(())
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute("DELETE FROM tasks WHERE id = ?", [id])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(id: &str, next_run: &str) -> Task {
        Task {
            id: id.to_string(),
            group_folder: "family".to_string(),
            chat_jid: "123@g.us".to_string(),
            prompt: "daily summary".to_string(),
            schedule_type: ScheduleType::Cron,
            schedule_value: "0 9 * * *".to_string(),
            context_mode: ContextMode::Group,
            next_run: Some(next_run.to_string()),
            status: TaskStatus::Active,
            created_at: "2026-02-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn task_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let task = sample_task("t1", "2026-02-02T03:30:00Z");
        store.create_task(&task).unwrap();
        let got = store.get_task("t1").unwrap().unwrap();
        assert_eq!(got.group_folder, "family");
        assert_eq!(got.schedule_type, ScheduleType::Cron);
        assert_eq!(got.context_mode, ContextMode::Group);
        assert_eq!(got.status, TaskStatus::Active);
    }

    #[test]
    fn due_tasks_respects_boundary() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&sample_task("t-past", "2026-02-01T08:00:00Z"))
            .unwrap();
        store
            .create_task(&sample_task("t-future", "2026-03-01T08:00:00Z"))
            .unwrap();

        let due = store.due_tasks("2026-02-01T09:00:00Z").unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "t-past");
    }

    #[test]
    fn paused_tasks_never_due() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&sample_task("t1", "2026-02-01T08:00:00Z"))
            .unwrap();
        store.update_task_status("t1", TaskStatus::Paused).unwrap();
        assert!(store.due_tasks("2026-12-31T00:00:00Z").unwrap().is_empty());
    }

    #[test]
    fn pause_resume_preserves_next_run() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&sample_task("t1", "2026-02-02T03:30:00Z"))
            .unwrap();
        store.update_task_status("t1", TaskStatus::Paused).unwrap();
        store.update_task_status("t1", TaskStatus::Active).unwrap();
        let got = store.get_task("t1").unwrap().unwrap();
        assert_eq!(got.next_run.as_deref(), Some("2026-02-02T03:30:00Z"));
    }

    #[test]
    fn tasks_scoped_by_group() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_task(&sample_task("t1", "2026-02-02T03:30:00Z"))
            .unwrap();
        let mut other = sample_task("t2", "2026-02-02T03:30:00Z");
        other.group_folder = "work".to_string();
        store.create_task(&other).unwrap();

        assert_eq!(store.tasks_for_group("family").unwrap().len(), 1);
        assert_eq!(store.tasks_for_group("work").unwrap().len(), 1);
        assert_eq!(store.list_tasks().unwrap().len(), 2);
    }
}
