use actix_web::{web, HttpResponse, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    db::{fetch_appointment, insert_appointment, log_activity},
    engine::{Reschedule, Transition, TransitionRequest},
    error::EngineError,
    models::{Appointment, AppointmentStatus, EntityType, NewAppointment, PaymentStatus, ScheduleUpdate, UpdateType},
    routes::schedule::publish,
    state::AppState,
    transitions::{available_verbs, TransitionVerb},
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/appointments")
            .service(web::resource("").route(web::post().to(create_appointment)))
            .service(web::resource("/{id}").route(web::get().to(get_appointment)))
            .service(web::resource("/{id}/status").route(web::post().to(update_status)))
            .service(web::resource("/{id}/reschedule").route(web::post().to(reschedule)))
            .service(web::resource("/{id}/notes").route(web::post().to(update_notes)))
            .service(web::resource("/{id}/payment").route(web::post().to(update_payment))),
    );
}

#[derive(Serialize)]
struct AppointmentView {
    #[serde(flatten)]
    appointment: Appointment,
    available_transitions: Vec<TransitionVerb>,
}

impl From<Appointment> for AppointmentView {
    fn from(appointment: Appointment) -> Self {
        Self {
            available_transitions: available_verbs(appointment.status),
            appointment,
        }
    }
}

#[derive(Deserialize)]
struct CreateAppointment {
    #[serde(flatten)]
    appointment: NewAppointment,
    actor: Option<String>,
}

#[derive(Deserialize)]
struct StatusForm {
    status: AppointmentStatus,
    reason: Option<String>,
    notes: Option<String>,
    actor: Option<String>,
}

#[derive(Deserialize)]
struct RescheduleForm {
    start: DateTime<Utc>,
    staff_id: Option<String>,
    duration_minutes: Option<i64>,
    reason: Option<String>,
    actor: Option<String>,
}

#[derive(Deserialize)]
struct NotesForm {
    notes: String,
    #[serde(default)]
    internal: bool,
    actor: Option<String>,
}

#[derive(Deserialize)]
struct PaymentForm {
    payment_status: PaymentStatus,
    actor: Option<String>,
}

async fn create_appointment(
    state: web::Data<AppState>,
    body: web::Json<CreateAppointment>,
) -> Result<HttpResponse> {
    let CreateAppointment { appointment, actor } = body.into_inner();
    let appointment = insert_appointment(&state.db, appointment).await?;

    log_activity(
        &state.db,
        "appointment_created",
        &format!("Appointment {} booked as {}.", appointment.id, appointment.status),
        actor.as_deref(),
        Some(&appointment.id),
    )
    .await;
    announce(&state, UpdateType::Create, &appointment, actor.as_deref()).await;

    Ok(HttpResponse::Created().json(AppointmentView::from(appointment)))
}

async fn get_appointment(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let appointment_id = path.into_inner();
    let appointment = fetch_appointment(&state.db, &appointment_id)
        .await?
        .ok_or(EngineError::NotFound(appointment_id))?;
    Ok(HttpResponse::Ok().json(AppointmentView::from(appointment)))
}

async fn update_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<StatusForm>,
) -> Result<HttpResponse> {
    let appointment_id = path.into_inner();
    let form = form.into_inner();
    let transition = Transition::for_status(form.status, form.reason, form.notes)?;
    let request = TransitionRequest {
        appointment_id,
        transition,
        actor: form.actor.clone(),
    };

    let appointment = state.engine.apply(request).await?;
    announce(&state, UpdateType::Update, &appointment, form.actor.as_deref()).await;
    Ok(HttpResponse::Ok().json(AppointmentView::from(appointment)))
}

async fn reschedule(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<RescheduleForm>,
) -> Result<HttpResponse> {
    let appointment_id = path.into_inner();
    let form = form.into_inner();
    let reschedule = Reschedule {
        new_start: form.start,
        new_staff_id: form.staff_id,
        duration_minutes: form.duration_minutes,
        reason: form.reason,
    };

    let appointment = state
        .engine
        .reschedule(&appointment_id, reschedule, form.actor.as_deref())
        .await?;
    announce(&state, UpdateType::Update, &appointment, form.actor.as_deref()).await;
    Ok(HttpResponse::Ok().json(AppointmentView::from(appointment)))
}

async fn update_notes(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<NotesForm>,
) -> Result<HttpResponse> {
    let appointment_id = path.into_inner();
    let form = form.into_inner();
    let appointment = state
        .engine
        .set_notes(&appointment_id, &form.notes, form.internal, form.actor.as_deref())
        .await?;
    announce(&state, UpdateType::Update, &appointment, form.actor.as_deref()).await;
    Ok(HttpResponse::Ok().json(AppointmentView::from(appointment)))
}

async fn update_payment(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<PaymentForm>,
) -> Result<HttpResponse> {
    let appointment_id = path.into_inner();
    let form = form.into_inner();
    let appointment = state
        .engine
        .set_payment_status(&appointment_id, form.payment_status, form.actor.as_deref())
        .await?;
    announce(&state, UpdateType::Update, &appointment, form.actor.as_deref()).await;
    Ok(HttpResponse::Ok().json(AppointmentView::from(appointment)))
}

async fn announce(
    state: &AppState,
    update_type: UpdateType,
    appointment: &Appointment,
    actor: Option<&str>,
) {
    let update = ScheduleUpdate {
        update_type,
        entity_id: appointment.id.clone(),
        entity_type: EntityType::Appointment,
        changes: appointment_changes(appointment),
        timestamp: Utc::now(),
        origin_user: actor.unwrap_or("system").to_string(),
        salon_id: appointment.salon_id.clone(),
    };
    if let Err(err) = publish(state, &update).await {
        log::warn!(
            "Failed to announce {} of appointment {}: {err}",
            update_type.as_str(),
            appointment.id
        );
    }
}

fn appointment_changes(appointment: &Appointment) -> Map<String, Value> {
    let value = json!({
        "status": appointment.status,
        "scheduled_start": appointment.scheduled_start,
        "scheduled_end": appointment.scheduled_end,
        "staff_id": appointment.staff_id,
        "payment_status": appointment.payment_status,
        "notes": appointment.notes,
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
