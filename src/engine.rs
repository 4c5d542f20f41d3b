use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{EngineError, StoreError};
use crate::models::{validate_window, Appointment, AppointmentStatus, PaymentStatus};
use crate::transitions::{self, TransitionVerb};

/// Data-access collaborator the engine reads and writes appointments through.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Appointment>, StoreError>;

    /// Writes status and audit fields together, only if the stored status is
    /// still `expected`. A reschedule with a staff member is also refused
    /// when the new slot overlaps a live booking at write time. `None` means
    /// one of those guards failed.
    async fn persist_transition(
        &self,
        verb: TransitionVerb,
        expected: AppointmentStatus,
        next: &Appointment,
    ) -> Result<Option<Appointment>, StoreError>;

    /// Writes notes and payment fields; never touches status.
    async fn persist_details(&self, next: &Appointment) -> Result<Appointment, StoreError>;

    /// Id of an appointment holding an overlapping slot for the staff member.
    async fn find_overlap(
        &self,
        salon_id: &str,
        staff_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_id: &str,
    ) -> Result<Option<String>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub action: String,
    pub appointment_id: String,
    pub actor: Option<String>,
    pub details: Value,
}

/// Fire-and-forget audit notification; failures stay inside the sink.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn emit(&self, event: AuditEvent) {
        log::info!(
            "audit {} on {} by {}: {}",
            event.action,
            event.appointment_id,
            event.actor.as_deref().unwrap_or("system"),
            event.details
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reschedule {
    pub new_start: DateTime<Utc>,
    #[serde(default)]
    pub new_staff_id: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum Transition {
    Submit,
    Confirm,
    CheckIn,
    Start,
    Complete { notes: Option<String> },
    MarkNoShow,
    Cancel { reason: String },
    Reschedule(Reschedule),
}

impl Transition {
    pub fn verb(&self) -> TransitionVerb {
        match self {
            Transition::Submit => TransitionVerb::Submit,
            Transition::Confirm => TransitionVerb::Confirm,
            Transition::CheckIn => TransitionVerb::CheckIn,
            Transition::Start => TransitionVerb::Start,
            Transition::Complete { .. } => TransitionVerb::Complete,
            Transition::MarkNoShow => TransitionVerb::MarkNoShow,
            Transition::Cancel { .. } => TransitionVerb::Cancel,
            Transition::Reschedule(_) => TransitionVerb::Reschedule,
        }
    }

    /// Maps a requested status onto its verb. `rescheduled` needs a new time
    /// and cannot be requested by status alone.
    pub fn for_status(
        requested: AppointmentStatus,
        reason: Option<String>,
        notes: Option<String>,
    ) -> Result<Transition, EngineError> {
        let verb = TransitionVerb::for_target(requested).ok_or_else(|| {
            EngineError::InvalidRequest(format!("no transition leads to {requested}"))
        })?;
        Ok(match verb {
            TransitionVerb::Submit => Transition::Submit,
            TransitionVerb::Confirm => Transition::Confirm,
            TransitionVerb::CheckIn => Transition::CheckIn,
            TransitionVerb::Start => Transition::Start,
            TransitionVerb::Complete => Transition::Complete { notes },
            TransitionVerb::MarkNoShow => Transition::MarkNoShow,
            TransitionVerb::Cancel => Transition::Cancel {
                reason: reason.unwrap_or_default(),
            },
            TransitionVerb::Reschedule => {
                return Err(EngineError::InvalidRequest(
                    "rescheduling needs a new start time".to_string(),
                ))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub appointment_id: String,
    pub transition: Transition,
    #[serde(default)]
    pub actor: Option<String>,
}

impl TransitionRequest {
    pub fn new(appointment_id: impl Into<String>, transition: Transition) -> Self {
        Self {
            appointment_id: appointment_id.into(),
            transition,
            actor: None,
        }
    }

    pub fn to_status(
        appointment_id: impl Into<String>,
        requested: AppointmentStatus,
        reason: Option<String>,
        actor: Option<String>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            appointment_id: appointment_id.into(),
            transition: Transition::for_status(requested, reason, None)?,
            actor,
        })
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

pub struct StatusEngine<S, A> {
    store: S,
    audit: A,
}

impl<S, A> StatusEngine<S, A>
where
    S: AppointmentStore,
    A: AuditSink,
{
    pub fn new(store: S, audit: A) -> Self {
        Self { store, audit }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn submit(&self, id: &str, actor: Option<&str>) -> Result<Appointment, EngineError> {
        self.apply(request(id, Transition::Submit, actor)).await
    }

    pub async fn confirm(&self, id: &str, actor: Option<&str>) -> Result<Appointment, EngineError> {
        self.apply(request(id, Transition::Confirm, actor)).await
    }

    pub async fn check_in(&self, id: &str, actor: Option<&str>) -> Result<Appointment, EngineError> {
        self.apply(request(id, Transition::CheckIn, actor)).await
    }

    pub async fn start(&self, id: &str, actor: Option<&str>) -> Result<Appointment, EngineError> {
        self.apply(request(id, Transition::Start, actor)).await
    }

    pub async fn complete(
        &self,
        id: &str,
        notes: Option<String>,
        actor: Option<&str>,
    ) -> Result<Appointment, EngineError> {
        self.apply(request(id, Transition::Complete { notes }, actor))
            .await
    }

    pub async fn mark_no_show(
        &self,
        id: &str,
        actor: Option<&str>,
    ) -> Result<Appointment, EngineError> {
        self.apply(request(id, Transition::MarkNoShow, actor)).await
    }

    pub async fn cancel(
        &self,
        id: &str,
        reason: &str,
        actor: Option<&str>,
    ) -> Result<Appointment, EngineError> {
        let transition = Transition::Cancel {
            reason: reason.to_string(),
        };
        self.apply(request(id, transition, actor)).await
    }

    pub async fn reschedule(
        &self,
        id: &str,
        reschedule: Reschedule,
        actor: Option<&str>,
    ) -> Result<Appointment, EngineError> {
        self.apply(request(id, Transition::Reschedule(reschedule), actor))
            .await
    }

    pub async fn apply(&self, request: TransitionRequest) -> Result<Appointment, EngineError> {
        let TransitionRequest {
            appointment_id,
            transition,
            actor,
        } = request;
        let verb = transition.verb();
        let current = self.load(&appointment_id).await?;

        if let Err(rejection) = transitions::check(current.status, verb) {
            log::info!("Rejected {verb} on appointment {appointment_id}: {rejection}");
            return Err(EngineError::InvalidTransition {
                current: current.status,
                verb,
            });
        }

        let now = Utc::now();
        let mut next = current.clone();
        next.status = verb.target();
        let mut details = json!({
            "from": current.status,
            "to": next.status,
        });

        match transition {
            Transition::Submit => next.submitted_at = Some(now),
            Transition::Confirm => next.confirmed_at = Some(now),
            Transition::CheckIn => next.checked_in_at = Some(now),
            Transition::Start => next.started_at = Some(now),
            Transition::MarkNoShow => next.no_show_at = Some(now),
            Transition::Complete { notes } => {
                next.completed_at = Some(now);
                if let Some(notes) = notes.filter(|notes| !notes.trim().is_empty()) {
                    next.notes = Some(notes);
                }
            }
            Transition::Cancel { reason } => {
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(EngineError::InvalidRequest(
                        "a cancellation reason is required".to_string(),
                    ));
                }
                next.cancelled_at = Some(now);
                next.cancellation_reason = Some(reason.to_string());
                details["reason"] = json!(reason);
            }
            Transition::Reschedule(reschedule) => {
                self.apply_reschedule(&mut next, &reschedule).await?;
                next.rescheduled_at = Some(now);
                details["previous_start"] = json!(current.scheduled_start);
                details["new_start"] = json!(next.scheduled_start);
                details["staff_id"] = json!(next.staff_id);
                if let Some(reason) = reschedule.reason {
                    details["reason"] = json!(reason);
                }
            }
        }

        let persisted = match self
            .store
            .persist_transition(verb, current.status, &next)
            .await?
        {
            Some(persisted) => persisted,
            None => {
                return Err(self.refused(&appointment_id, verb, current.status, &next).await)
            }
        };

        log::info!(
            "Appointment {appointment_id} {} -> {}",
            current.status,
            persisted.status
        );
        self.audit.emit(AuditEvent {
            action: format!("appointment_{verb}"),
            appointment_id,
            actor,
            details,
        });

        Ok(persisted)
    }

    /// Works out why a guarded write was refused.
    async fn refused(
        &self,
        appointment_id: &str,
        verb: TransitionVerb,
        expected: AppointmentStatus,
        next: &Appointment,
    ) -> EngineError {
        let latest = match self.load(appointment_id).await {
            Ok(latest) => latest,
            Err(err) => return err,
        };
        if latest.status == expected && verb == TransitionVerb::Reschedule {
            if let Some(staff_id) = next.staff_id.as_deref() {
                match self
                    .store
                    .find_overlap(
                        &next.salon_id,
                        staff_id,
                        next.scheduled_start,
                        next.scheduled_end,
                        &next.id,
                    )
                    .await
                {
                    Ok(Some(conflicting_id)) => {
                        log::info!(
                            "Slot for {appointment_id} was taken by {conflicting_id} before the write"
                        );
                        return EngineError::ScheduleConflict { conflicting_id };
                    }
                    Ok(None) => {}
                    Err(err) => return err.into(),
                }
            }
        }
        log::info!(
            "Appointment {appointment_id} moved to {} before {verb} could apply",
            latest.status
        );
        EngineError::InvalidTransition {
            current: latest.status,
            verb,
        }
    }

    async fn apply_reschedule(
        &self,
        next: &mut Appointment,
        reschedule: &Reschedule,
    ) -> Result<(), EngineError> {
        let duration = match reschedule.duration_minutes {
            Some(minutes) if minutes <= 0 => {
                return Err(EngineError::InvalidRequest(format!(
                    "duration_minutes must be positive, got {minutes}"
                )))
            }
            Some(minutes) => Duration::try_minutes(minutes).ok_or_else(|| {
                EngineError::InvalidRequest(format!("duration_minutes {minutes} is out of range"))
            })?,
            None => next.duration(),
        };
        let start = reschedule.new_start;
        let end = start.checked_add_signed(duration).ok_or_else(|| {
            EngineError::InvalidRequest("rescheduled end is out of range".to_string())
        })?;
        validate_window(start, end).map_err(EngineError::InvalidRequest)?;

        if let Some(staff_id) = &reschedule.new_staff_id {
            next.staff_id = Some(staff_id.clone());
        }
        if let Some(staff_id) = next.staff_id.as_deref() {
            let overlap = self
                .store
                .find_overlap(&next.salon_id, staff_id, start, end, &next.id)
                .await?;
            if let Some(conflicting_id) = overlap {
                log::info!(
                    "Reschedule of {} overlaps appointment {conflicting_id} for staff {staff_id}",
                    next.id
                );
                return Err(EngineError::ScheduleConflict { conflicting_id });
            }
        }

        next.scheduled_start = start;
        next.scheduled_end = end;
        Ok(())
    }

    /// Replaces customer-facing or internal notes.
    pub async fn set_notes(
        &self,
        id: &str,
        notes: &str,
        internal: bool,
        actor: Option<&str>,
    ) -> Result<Appointment, EngineError> {
        let mut next = self.load(id).await?;
        if internal {
            next.internal_notes = Some(notes.to_string());
        } else {
            next.notes = Some(notes.to_string());
        }
        let persisted = self.store.persist_details(&next).await?;
        self.audit.emit(AuditEvent {
            action: "appointment_notes".to_string(),
            appointment_id: id.to_string(),
            actor: actor.map(str::to_string),
            details: json!({ "internal": internal }),
        });
        Ok(persisted)
    }

    pub async fn set_payment_status(
        &self,
        id: &str,
        payment_status: PaymentStatus,
        actor: Option<&str>,
    ) -> Result<Appointment, EngineError> {
        let mut next = self.load(id).await?;
        let previous = next.payment_status;
        next.payment_status = payment_status;
        let persisted = self.store.persist_details(&next).await?;
        self.audit.emit(AuditEvent {
            action: "appointment_payment".to_string(),
            appointment_id: id.to_string(),
            actor: actor.map(str::to_string),
            details: json!({ "from": previous, "to": payment_status }),
        });
        Ok(persisted)
    }

    async fn load(&self, id: &str) -> Result<Appointment, EngineError> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }
}

fn request(id: &str, transition: Transition, actor: Option<&str>) -> TransitionRequest {
    TransitionRequest {
        appointment_id: id.to_string(),
        transition,
        actor: actor.map(str::to_string),
    }
}
