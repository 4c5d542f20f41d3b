use std::{fs, path::Path};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    engine::{AppointmentStore, AuditEvent, AuditSink},
    error::{EngineError, StoreError},
    models::{
        parse_stamp, stamp, validate_window, ActivityRow, Appointment, AppointmentRow,
        AppointmentStatus, ChangeBatch, NewAppointment, ScheduleChangeRow, ScheduleUpdate,
    },
    sync::ChangeFeed,
    transitions::TransitionVerb,
};

const APPOINTMENT_COLUMNS: &str = "id, salon_id, status, scheduled_start, scheduled_end, \
     staff_id, customer_id, notes, internal_notes, payment_status, submitted_at, confirmed_at, \
     checked_in_at, started_at, completed_at, no_show_at, rescheduled_at, cancelled_at, \
     cancellation_reason";

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub fn ensure_sqlite_dir(db_url: &str) -> std::io::Result<()> {
    let path = if let Some(path) = db_url.strip_prefix("sqlite://") {
        Some(path)
    } else {
        db_url.strip_prefix("sqlite:")
    };

    let Some(path) = path else {
        return Ok(());
    };

    let path = path.split('?').next().unwrap_or(path);
    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }

    let path = path.strip_prefix("file:").unwrap_or(path);
    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub async fn log_activity(
    pool: &SqlitePool,
    kind: &str,
    message: &str,
    user_id: Option<&str>,
    appointment_id: Option<&str>,
) {
    let result = sqlx::query(
        r#"INSERT INTO activities (id, kind, message, created_at, user_id, appointment_id)
           VALUES (?, ?, ?, ?, ?, ?)"#,
    )
    .bind(new_id())
    .bind(kind)
    .bind(message)
    .bind(stamp(Utc::now()))
    .bind(user_id)
    .bind(appointment_id)
    .execute(pool)
    .await;
    if let Err(err) = result {
        log::warn!("Failed to record {kind} activity: {err}");
    }
}

pub async fn fetch_activities(
    pool: &SqlitePool,
    appointment_id: &str,
) -> Result<Vec<ActivityRow>, sqlx::Error> {
    sqlx::query_as::<_, ActivityRow>(
        r#"SELECT kind, message, created_at FROM activities
           WHERE appointment_id = ?
           ORDER BY created_at"#,
    )
    .bind(appointment_id)
    .fetch_all(pool)
    .await
}

pub async fn fetch_appointment(
    pool: &SqlitePool,
    id: &str,
) -> Result<Option<Appointment>, StoreError> {
    let row = sqlx::query_as::<_, AppointmentRow>(&format!(
        "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ? LIMIT 1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.map(Appointment::try_from).transpose()
}

pub async fn insert_appointment(
    pool: &SqlitePool,
    new: NewAppointment,
) -> Result<Appointment, EngineError> {
    validate_window(new.scheduled_start, new.scheduled_end).map_err(EngineError::InvalidRequest)?;
    if new.salon_id.trim().is_empty() || new.customer_id.trim().is_empty() {
        return Err(EngineError::InvalidRequest(
            "salon_id and customer_id are required".to_string(),
        ));
    }

    let appointment = new.into_appointment(new_id());
    let now = stamp(Utc::now());
    sqlx::query(
        r#"INSERT INTO appointments
           (id, salon_id, customer_id, staff_id, status, scheduled_start, scheduled_end,
            notes, payment_status, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&appointment.id)
    .bind(&appointment.salon_id)
    .bind(&appointment.customer_id)
    .bind(&appointment.staff_id)
    .bind(appointment.status.as_str())
    .bind(stamp(appointment.scheduled_start))
    .bind(stamp(appointment.scheduled_end))
    .bind(&appointment.notes)
    .bind(appointment.payment_status.as_str())
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await
    .map_err(StoreError::from)?;

    Ok(appointment)
}

const RECORD_ATTEMPTS: usize = 5;

/// Appends a change to the salon's feed, stamped with the server clock.
pub async fn record_change(
    pool: &SqlitePool,
    update: &ScheduleUpdate,
) -> Result<ScheduleUpdate, StoreError> {
    record_change_at(pool, update, Utc::now()).await
}

/// Appends a change stamped no earlier than `now`. Stamps are strictly
/// increasing in commit order across the whole feed, so a reader that has
/// seen every row up to some stamp never misses a row committed later.
pub async fn record_change_at(
    pool: &SqlitePool,
    update: &ScheduleUpdate,
    now: DateTime<Utc>,
) -> Result<ScheduleUpdate, StoreError> {
    let changes = serde_json::to_string(&update.changes)
        .map_err(|err| StoreError::Malformed(format!("unserializable changes: {err}")))?;

    for _ in 0..RECORD_ATTEMPTS {
        let recorded_at = match latest_change_stamp(pool).await? {
            Some(last) => now.max(last + Duration::microseconds(1)),
            None => now,
        };
        let recorded = stamp(recorded_at);
        let result = sqlx::query(
            r#"INSERT INTO schedule_changes
               (salon_id, update_type, entity_id, entity_type, changes, origin_user,
                client_timestamp, created_at)
               SELECT ?, ?, ?, ?, ?, ?, ?, ?
               WHERE ? > COALESCE((SELECT MAX(created_at) FROM schedule_changes), '')"#,
        )
        .bind(&update.salon_id)
        .bind(update.update_type.as_str())
        .bind(&update.entity_id)
        .bind(update.entity_type.as_str())
        .bind(&changes)
        .bind(&update.origin_user)
        .bind(stamp(update.timestamp))
        .bind(&recorded)
        .bind(&recorded)
        .execute(pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(ScheduleUpdate {
                timestamp: parse_stamp(&recorded)?,
                ..update.clone()
            });
        }
        log::debug!("Change stamp {recorded} was overtaken; restamping");
    }
    Err(StoreError::Remote(format!(
        "could not stamp change for {} after {RECORD_ATTEMPTS} attempts",
        update.entity_id
    )))
}

async fn latest_change_stamp(pool: &SqlitePool) -> Result<Option<DateTime<Utc>>, StoreError> {
    let latest =
        sqlx::query_scalar::<_, Option<String>>("SELECT MAX(created_at) FROM schedule_changes")
            .fetch_one(pool)
            .await?;
    latest.as_deref().map(parse_stamp).transpose()
}

/// One page of changes recorded after `since`. Reads are bounded by the
/// newest stamp at read time; the returned cursor is that stamp, or the last
/// row's stamp when more rows are waiting.
pub async fn changes_since(
    pool: &SqlitePool,
    salon_id: &str,
    since: Option<DateTime<Utc>>,
    page_size: i64,
) -> Result<ChangeBatch, StoreError> {
    let limit = page_size.max(1);
    let Some(newest) = latest_change_stamp(pool).await? else {
        return Ok(ChangeBatch {
            changes: Vec::new(),
            timestamp: since.unwrap_or(DateTime::UNIX_EPOCH),
            has_more: false,
        });
    };

    let mut rows = sqlx::query_as::<_, ScheduleChangeRow>(
        r#"SELECT update_type, entity_id, entity_type, changes, created_at, origin_user, salon_id
           FROM schedule_changes
           WHERE salon_id = ? AND created_at > ? AND created_at <= ?
           ORDER BY created_at
           LIMIT ?"#,
    )
    .bind(salon_id)
    .bind(since.map(stamp).unwrap_or_default())
    .bind(stamp(newest))
    .bind(limit + 1)
    .fetch_all(pool)
    .await?;

    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    let changes = rows
        .into_iter()
        .map(ScheduleUpdate::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let timestamp = match changes.last() {
        Some(last) if has_more => last.timestamp,
        _ => since.map_or(newest, |since| since.max(newest)),
    };

    Ok(ChangeBatch {
        changes,
        timestamp,
        has_more,
    })
}

/// SQLite-backed collaborator for the engine and the sync service.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    page_size: i64,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, page_size: i64) -> Self {
        Self { pool, page_size }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl AppointmentStore for SqliteStore {
    async fn load(&self, id: &str) -> Result<Option<Appointment>, StoreError> {
        fetch_appointment(&self.pool, id).await
    }

    async fn persist_transition(
        &self,
        verb: TransitionVerb,
        expected: AppointmentStatus,
        next: &Appointment,
    ) -> Result<Option<Appointment>, StoreError> {
        let guard_slot = verb == TransitionVerb::Reschedule && next.staff_id.is_some();
        let mut sql = String::from(
            r#"UPDATE appointments
               SET status = ?, scheduled_start = ?, scheduled_end = ?, staff_id = ?, notes = ?,
                   submitted_at = ?, confirmed_at = ?, checked_in_at = ?, started_at = ?,
                   completed_at = ?, no_show_at = ?, rescheduled_at = ?, cancelled_at = ?,
                   cancellation_reason = ?, updated_at = ?
               WHERE id = ? AND status = ?"#,
        );
        if guard_slot {
            sql.push_str(
                r#" AND NOT EXISTS (
                   SELECT 1 FROM appointments other
                   WHERE other.salon_id = ? AND other.staff_id = ? AND other.id != ?
                     AND other.status NOT IN ('completed', 'cancelled', 'no_show')
                     AND other.scheduled_start < ? AND other.scheduled_end > ?)"#,
            );
        }

        let mut query = sqlx::query(&sql)
            .bind(next.status.as_str())
            .bind(stamp(next.scheduled_start))
            .bind(stamp(next.scheduled_end))
            .bind(&next.staff_id)
            .bind(&next.notes)
            .bind(next.submitted_at.map(stamp))
            .bind(next.confirmed_at.map(stamp))
            .bind(next.checked_in_at.map(stamp))
            .bind(next.started_at.map(stamp))
            .bind(next.completed_at.map(stamp))
            .bind(next.no_show_at.map(stamp))
            .bind(next.rescheduled_at.map(stamp))
            .bind(next.cancelled_at.map(stamp))
            .bind(&next.cancellation_reason)
            .bind(stamp(Utc::now()))
            .bind(&next.id)
            .bind(expected.as_str());
        if guard_slot {
            query = query
                .bind(&next.salon_id)
                .bind(&next.staff_id)
                .bind(&next.id)
                .bind(stamp(next.scheduled_end))
                .bind(stamp(next.scheduled_start));
        }
        let result = query.execute(&self.pool).await?;

        if result.rows_affected() == 0 {
            log::debug!("{verb} on {} lost the race against another update", next.id);
            return Ok(None);
        }
        fetch_appointment(&self.pool, &next.id).await
    }

    async fn persist_details(&self, next: &Appointment) -> Result<Appointment, StoreError> {
        sqlx::query(
            r#"UPDATE appointments
               SET notes = ?, internal_notes = ?, payment_status = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&next.notes)
        .bind(&next.internal_notes)
        .bind(next.payment_status.as_str())
        .bind(stamp(Utc::now()))
        .bind(&next.id)
        .execute(&self.pool)
        .await?;

        fetch_appointment(&self.pool, &next.id)
            .await?
            .ok_or_else(|| StoreError::Remote(format!("appointment {} vanished", next.id)))
    }

    async fn find_overlap(
        &self,
        salon_id: &str,
        staff_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let id = sqlx::query_scalar::<_, String>(
            r#"SELECT id FROM appointments
               WHERE salon_id = ? AND staff_id = ? AND id != ?
                 AND status NOT IN ('completed', 'cancelled', 'no_show')
                 AND scheduled_start < ? AND scheduled_end > ?
               ORDER BY scheduled_start
               LIMIT 1"#,
        )
        .bind(salon_id)
        .bind(staff_id)
        .bind(exclude_id)
        .bind(stamp(end))
        .bind(stamp(start))
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

impl AuditSink for SqliteStore {
    fn emit(&self, event: AuditEvent) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime to record audit event {}", event.action);
            return;
        };
        let pool = self.pool.clone();
        handle.spawn(async move {
            let message = format!("{} {}", event.action, event.details);
            log_activity(
                &pool,
                &event.action,
                &message,
                event.actor.as_deref(),
                Some(&event.appointment_id),
            )
            .await;
        });
    }
}

#[async_trait]
impl ChangeFeed for SqliteStore {
    async fn fetch_changes_since(
        &self,
        cursor: Option<DateTime<Utc>>,
        scope: &str,
    ) -> Result<ChangeBatch, StoreError> {
        changes_since(&self.pool, scope, cursor, self.page_size).await
    }

    async fn publish_change(&self, update: &ScheduleUpdate) -> Result<(), StoreError> {
        record_change(&self.pool, update).await.map(|_| ())
    }
}
