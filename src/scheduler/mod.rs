use crate::container::ContainerRunner;
use crate::errors::{OxiclawError, OxiclawResult};
use crate::groups::GroupRegistry;
use crate::store::{call_blocking, ContextMode, ScheduleType, Store, Task, TaskStatus};
use crate::transport::TransportAdapter;
use crate::utils::task_tracker::TaskTracker;
use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::sync::Arc;
use tracing::{error, info, warn};

const TICK_SECS: u64 = 60;
/// Transient task failures push next_run back by this much.
const RETRY_BACKOFF_SECS: i64 = 300;

/// The `cron` crate expects six or seven fields with seconds first, while
/// chat-facing schedules use the classic five-field form. Prepend a zero
/// seconds column where needed, then confirm the result parses.
pub fn validate_cron_expr(expr: &str) -> OxiclawResult<String> {
    let full = match expr.split_whitespace().count() {
        5 => format!("0 {expr}"),
        _ => expr.to_owned(),
    };
    match full.parse::<Schedule>() {
        Ok(_) => Ok(full),
        Err(e) => Err(OxiclawError::ScheduleParse(format!(
            "cron expression '{expr}' does not parse: {e}"
        ))),
    }
}

/// Host timezone as an IANA name, when the platform exposes one.
pub fn detect_system_timezone() -> Option<String> {
    iana_time_zone::get_timezone().ok()
}

/// Validate a schedule without creating anything.
pub fn validate_schedule(
    schedule_type: ScheduleType,
    value: &str,
    tz: &Tz,
) -> OxiclawResult<()> {
    compute_next_run(schedule_type, value, tz, Utc::now()).map(|_| ())
}

/// Compute the next fire time in ISO UTC form.
///
/// `once` schedules return their own timestamp even when it is already in
/// the past — a past `once` task is simply due.
pub fn compute_next_run(
    schedule_type: ScheduleType,
    value: &str,
    tz: &Tz,
    now: DateTime<Utc>,
) -> OxiclawResult<String> {
    match schedule_type {
        ScheduleType::Cron => {
            let normalized = validate_cron_expr(value)?;
            let schedule = normalized
                .parse::<Schedule>()
                .map_err(|e| OxiclawError::ScheduleParse(e.to_string()))?;
            let local_now = now.with_timezone(tz);
            schedule
                .after(&local_now)
                .next()
                .map(|next| to_iso(next.with_timezone(&Utc)))
                .ok_or_else(|| {
                    OxiclawError::ScheduleParse(format!("cron '{}' has no future run", value))
                })
        }
        ScheduleType::Interval => {
            let ms: i64 = value.parse().map_err(|_| {
                OxiclawError::ScheduleParse(format!("interval '{}' is not milliseconds", value))
            })?;
            if ms <= 0 {
                return Err(OxiclawError::ScheduleParse(
                    "interval must be positive".to_string(),
                ));
            }
            Ok(to_iso(now + chrono::Duration::milliseconds(ms)))
        }
        ScheduleType::Once => {
            let at = DateTime::parse_from_rfc3339(value).map_err(|e| {
                OxiclawError::ScheduleParse(format!("bad timestamp '{}': {}", value, e))
            })?;
            Ok(to_iso(at.with_timezone(&Utc)))
        }
    }
}

fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Materializes due tasks from the store and fires agent runs for them.
pub struct Scheduler {
    store: Arc<Store>,
    registry: Arc<GroupRegistry>,
    runner: Arc<ContainerRunner>,
    adapter: Arc<TransportAdapter>,
    assistant_name: String,
    timezone: Tz,
    tracker: Arc<TaskTracker>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<GroupRegistry>,
        runner: Arc<ContainerRunner>,
        adapter: Arc<TransportAdapter>,
        assistant_name: String,
        timezone: Tz,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        Self {
            store,
            registry,
            runner,
            adapter,
            assistant_name,
            timezone,
            tracker,
        }
    }

    /// Start the 60 s tick. Duplicate starts replace the previous loop.
    pub async fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        self.tracker
            .spawn_auto_cleanup("scheduler".to_string(), async move {
                let mut interval =
                    tokio::time::interval(std::time::Duration::from_secs(TICK_SECS));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if let Err(e) = scheduler.run_due_tasks().await {
                        error!("scheduler tick failed: {}", e);
                    }
                }
            })
            .await;
        info!("scheduler started");
    }

    pub async fn run_due_tasks(&self) -> Result<()> {
        let now = Utc::now();
        let due = {
            let store = self.store.clone();
            let now_iso = to_iso(now);
            call_blocking(store, move |s| s.due_tasks(&now_iso)).await?
        };

        for task in due {
            self.run_task(task, now).await;
        }
        Ok(())
    }

    async fn run_task(&self, task: Task, now: DateTime<Utc>) {
        info!("firing task {} for group '{}'", task.id, task.group_folder);

        let Some(group) = self.registry.by_folder(&task.group_folder).await else {
            warn!(
                "task {} references unregistered group '{}', marking failed",
                task.id, task.group_folder
            );
            self.set_status(&task.id, TaskStatus::Failed).await;
            return;
        };

        let use_group_session = task.context_mode == ContextMode::Group;
        let outcome = self
            .runner
            .run(&group, &task.prompt, &task.chat_jid, use_group_session)
            .await;

        match outcome {
            Ok(run) => {
                if !run.result.trim().is_empty() {
                    let reply = format!("{}: {}", self.assistant_name, run.result);
                    if let Err(e) = self.adapter.send_as_assistant(&task.chat_jid, &reply).await
                    {
                        // The run already happened; delivery failure is
                        // transient, retry the whole task later.
                        warn!("task {} reply delivery failed: {}", task.id, e);
                        self.push_back(&task, now).await;
                        return;
                    }
                }
                self.advance_schedule(&task, now).await;
            }
            Err(e) if e.is_transient() => {
                warn!("task {} failed transiently: {}", task.id, e);
                self.push_back(&task, now).await;
            }
            Err(e) => match e {
                OxiclawError::ScheduleParse(_) => {
                    error!("task {} has an unusable schedule: {}", task.id, e);
                    self.set_status(&task.id, TaskStatus::Failed).await;
                }
                other => {
                    // Container-level errors: retry recurring tasks with
                    // backoff; a one-shot stays due until cancelled.
                    warn!("task {} run failed: {}", task.id, other);
                    self.push_back(&task, now).await;
                }
            },
        }
    }

    /// Compute and persist the schedule's next fire time after a success.
    async fn advance_schedule(&self, task: &Task, now: DateTime<Utc>) {
        match task.schedule_type {
            ScheduleType::Once => {
                self.set_status(&task.id, TaskStatus::Done).await;
                self.set_next_run(&task.id, None).await;
            }
            schedule_type => {
                match compute_next_run(schedule_type, &task.schedule_value, &self.timezone, now)
                {
                    Ok(next) => self.set_next_run(&task.id, Some(next)).await,
                    Err(e) => {
                        error!("task {} schedule recompute failed: {}", task.id, e);
                        self.set_status(&task.id, TaskStatus::Failed).await;
                    }
                }
            }
        }
    }

    async fn push_back(&self, task: &Task, now: DateTime<Utc>) {
        let next = to_iso(now + chrono::Duration::seconds(RETRY_BACKOFF_SECS));
        self.set_next_run(&task.id, Some(next)).await;
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) {
        let store = self.store.clone();
        let id = task_id.to_string();
        if let Err(e) = call_blocking(store, move |s| {
            s.update_task_status(&id, status).map(|_| ())
        })
        .await
        {
            error!("failed to update task {} status: {}", task_id, e);
        }
    }

    async fn set_next_run(&self, task_id: &str, next: Option<String>) {
        let store = self.store.clone();
        let id = task_id.to_string();
        if let Err(e) =
            call_blocking(store, move |s| s.set_next_run(&id, next.as_deref())).await
        {
            error!("failed to update task {} next_run: {}", task_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_is_normalized() {
        assert_eq!(validate_cron_expr("0 9 * * *").unwrap(), "0 0 9 * * *");
        assert_eq!(validate_cron_expr("0 30 8 * * *").unwrap(), "0 30 8 * * *");
        assert!(validate_cron_expr("not a cron").is_err());
    }

    #[test]
    fn cron_next_run_respects_timezone() {
        // 09:00 IST is 03:30 UTC
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let now = DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = compute_next_run(ScheduleType::Cron, "0 9 * * *", &tz, now).unwrap();
        assert_eq!(next, "2026-02-01T03:30:00Z");
    }

    #[test]
    fn cron_next_run_rolls_to_next_day() {
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        // 04:00 UTC = 09:30 IST, past today's 09:00 IST fire
        let now = DateTime::parse_from_rfc3339("2026-02-01T04:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = compute_next_run(ScheduleType::Cron, "0 9 * * *", &tz, now).unwrap();
        assert_eq!(next, "2026-02-02T03:30:00Z");
    }

    #[test]
    fn interval_adds_milliseconds() {
        let tz: Tz = "UTC".parse().unwrap();
        let now = DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = compute_next_run(ScheduleType::Interval, "90000", &tz, now).unwrap();
        assert_eq!(next, "2026-02-01T00:01:30Z");

        assert!(compute_next_run(ScheduleType::Interval, "-5", &tz, now).is_err());
        assert!(compute_next_run(ScheduleType::Interval, "soon", &tz, now).is_err());
    }

    #[test]
    fn once_keeps_past_timestamps_due() {
        let tz: Tz = "UTC".parse().unwrap();
        let now = DateTime::parse_from_rfc3339("2026-02-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next =
            compute_next_run(ScheduleType::Once, "2025-12-31T10:00:00Z", &tz, now).unwrap();
        assert_eq!(next, "2025-12-31T10:00:00Z");

        assert!(compute_next_run(ScheduleType::Once, "tomorrow", &tz, now).is_err());
    }

    #[test]
    fn validate_schedule_surfaces_parse_errors() {
        let tz: Tz = "UTC".parse().unwrap();
        assert!(validate_schedule(ScheduleType::Cron, "0 9 * * *", &tz).is_ok());
        let err = validate_schedule(ScheduleType::Cron, "61 99 * * *", &tz).unwrap_err();
        assert!(matches!(err, OxiclawError::ScheduleParse(_)));
    }
}
