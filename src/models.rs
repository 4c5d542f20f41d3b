use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::optimistic::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Draft,
    Pending,
    Confirmed,
    CheckedIn,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 9] = [
        AppointmentStatus::Draft,
        AppointmentStatus::Pending,
        AppointmentStatus::Confirmed,
        AppointmentStatus::CheckedIn,
        AppointmentStatus::InProgress,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::NoShow,
        AppointmentStatus::Rescheduled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Draft => "draft",
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::CheckedIn => "checked_in",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
            AppointmentStatus::Rescheduled => "rescheduled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }

    /// Whether an appointment in this status still occupies its staff slot.
    pub fn holds_slot(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AppointmentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| StoreError::Malformed(format!("unknown appointment status '{value}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    Paid,
    PartiallyPaid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::PartiallyPaid => "partially_paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unpaid" => Ok(PaymentStatus::Unpaid),
            "paid" => Ok(PaymentStatus::Paid),
            "partially_paid" => Ok(PaymentStatus::PartiallyPaid),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(StoreError::Malformed(format!("unknown payment status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub salon_id: String,
    pub status: AppointmentStatus,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    pub staff_id: Option<String>,
    pub customer_id: String,
    pub notes: Option<String>,
    pub internal_notes: Option<String>,
    pub payment_status: PaymentStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub no_show_at: Option<DateTime<Utc>>,
    pub rescheduled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
}

impl Appointment {
    pub fn duration(&self) -> Duration {
        self.scheduled_end - self.scheduled_start
    }
}

/// Validates the `end > start` window every appointment must satisfy.
pub fn validate_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), String> {
    if end <= start {
        return Err(format!(
            "scheduled end {} must be after start {}",
            stamp(end),
            stamp(start)
        ));
    }
    Ok(())
}

/// Fixed-width RFC 3339 so stored timestamps compare lexically.
pub fn stamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_stamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| StoreError::Malformed(format!("bad timestamp '{value}': {err}")))
}

fn parse_optional_stamp(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_stamp).transpose()
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppointmentRow {
    pub id: String,
    pub salon_id: String,
    pub status: String,
    pub scheduled_start: String,
    pub scheduled_end: String,
    pub staff_id: Option<String>,
    pub customer_id: String,
    pub notes: Option<String>,
    pub internal_notes: Option<String>,
    pub payment_status: String,
    pub submitted_at: Option<String>,
    pub confirmed_at: Option<String>,
    pub checked_in_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub no_show_at: Option<String>,
    pub rescheduled_at: Option<String>,
    pub cancelled_at: Option<String>,
    pub cancellation_reason: Option<String>,
}

impl TryFrom<AppointmentRow> for Appointment {
    type Error = StoreError;

    fn try_from(row: AppointmentRow) -> Result<Self, Self::Error> {
        Ok(Appointment {
            status: row.status.parse()?,
            scheduled_start: parse_stamp(&row.scheduled_start)?,
            scheduled_end: parse_stamp(&row.scheduled_end)?,
            payment_status: row.payment_status.parse()?,
            submitted_at: parse_optional_stamp(row.submitted_at)?,
            confirmed_at: parse_optional_stamp(row.confirmed_at)?,
            checked_in_at: parse_optional_stamp(row.checked_in_at)?,
            started_at: parse_optional_stamp(row.started_at)?,
            completed_at: parse_optional_stamp(row.completed_at)?,
            no_show_at: parse_optional_stamp(row.no_show_at)?,
            rescheduled_at: parse_optional_stamp(row.rescheduled_at)?,
            cancelled_at: parse_optional_stamp(row.cancelled_at)?,
            id: row.id,
            salon_id: row.salon_id,
            staff_id: row.staff_id,
            customer_id: row.customer_id,
            notes: row.notes,
            internal_notes: row.internal_notes,
            cancellation_reason: row.cancellation_reason,
        })
    }
}

/// Booking payload before the store has assigned an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub salon_id: String,
    pub customer_id: String,
    pub staff_id: Option<String>,
    pub scheduled_start: DateTime<Utc>,
    pub scheduled_end: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub draft: bool,
}

impl NewAppointment {
    pub fn into_appointment(self, id: String) -> Appointment {
        Appointment {
            id,
            salon_id: self.salon_id,
            status: if self.draft {
                AppointmentStatus::Draft
            } else {
                AppointmentStatus::Pending
            },
            scheduled_start: self.scheduled_start,
            scheduled_end: self.scheduled_end,
            staff_id: self.staff_id,
            customer_id: self.customer_id,
            notes: self.notes,
            internal_notes: None,
            payment_status: PaymentStatus::Unpaid,
            submitted_at: None,
            confirmed_at: None,
            checked_in_at: None,
            started_at: None,
            completed_at: None,
            no_show_at: None,
            rescheduled_at: None,
            cancelled_at: None,
            cancellation_reason: None,
        }
    }
}

/// Field edits that bypass the status engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppointmentPatch {
    pub notes: Option<String>,
    pub internal_notes: Option<String>,
    pub payment_status: Option<PaymentStatus>,
}

impl Record for Appointment {
    type Draft = NewAppointment;
    type Patch = AppointmentPatch;

    fn id(&self) -> &str {
        &self.id
    }

    fn speculative(id: String, draft: &Self::Draft) -> Self {
        draft.clone().into_appointment(id)
    }

    fn apply(&mut self, patch: &Self::Patch) {
        if let Some(notes) = &patch.notes {
            self.notes = Some(notes.clone());
        }
        if let Some(notes) = &patch.internal_notes {
            self.internal_notes = Some(notes.clone());
        }
        if let Some(payment_status) = patch.payment_status {
            self.payment_status = payment_status;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Create,
    Update,
    Delete,
    ConflictDetected,
    ConflictResolved,
}

impl UpdateType {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateType::Create => "create",
            UpdateType::Update => "update",
            UpdateType::Delete => "delete",
            UpdateType::ConflictDetected => "conflict_detected",
            UpdateType::ConflictResolved => "conflict_resolved",
        }
    }
}

impl FromStr for UpdateType {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "create" => Ok(UpdateType::Create),
            "update" => Ok(UpdateType::Update),
            "delete" => Ok(UpdateType::Delete),
            "conflict_detected" => Ok(UpdateType::ConflictDetected),
            "conflict_resolved" => Ok(UpdateType::ConflictResolved),
            other => Err(StoreError::Malformed(format!("unknown update type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Appointment,
    Schedule,
    BlockedTime,
    TimeOff,
    StaffAvailability,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Appointment => "appointment",
            EntityType::Schedule => "schedule",
            EntityType::BlockedTime => "blocked_time",
            EntityType::TimeOff => "time_off",
            EntityType::StaffAvailability => "staff_availability",
        }
    }
}

impl FromStr for EntityType {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "appointment" => Ok(EntityType::Appointment),
            "schedule" => Ok(EntityType::Schedule),
            "blocked_time" => Ok(EntityType::BlockedTime),
            "time_off" => Ok(EntityType::TimeOff),
            "staff_availability" => Ok(EntityType::StaffAvailability),
            other => Err(StoreError::Malformed(format!("unknown entity type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleUpdate {
    #[serde(rename = "type")]
    pub update_type: UpdateType,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub changes: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub origin_user: String,
    pub salon_id: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduleChangeRow {
    pub update_type: String,
    pub entity_id: String,
    pub entity_type: String,
    pub changes: String,
    pub created_at: String,
    pub origin_user: String,
    pub salon_id: String,
}

impl TryFrom<ScheduleChangeRow> for ScheduleUpdate {
    type Error = StoreError;

    fn try_from(row: ScheduleChangeRow) -> Result<Self, Self::Error> {
        let changes = serde_json::from_str::<Map<String, Value>>(&row.changes)
            .map_err(|err| StoreError::Malformed(format!("bad change payload: {err}")))?;
        Ok(ScheduleUpdate {
            update_type: row.update_type.parse()?,
            entity_id: row.entity_id,
            entity_type: row.entity_type.parse()?,
            changes,
            timestamp: parse_stamp(&row.created_at)?,
            origin_user: row.origin_user,
            salon_id: row.salon_id,
        })
    }
}

/// One page of a "changes since cursor" pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub changes: Vec<ScheduleUpdate>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActivityRow {
    pub kind: String,
    pub message: String,
    pub created_at: String,
}
