use actix_web::{http::header, web, HttpResponse, Result};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::{
    db::{changes_since, record_change},
    error::StoreError,
    models::{parse_stamp, ScheduleUpdate},
    retry::execute_with_retry,
    state::AppState,
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/schedule/{scope}")
            .service(
                web::resource("/changes")
                    .route(web::get().to(list_changes))
                    .route(web::post().to(publish_change)),
            )
            .service(web::resource("/events").route(web::get().to(stream_events))),
    );
}

/// Records a change, retrying with the configured policy, and fans it out
/// to live subscribers.
pub async fn publish(
    state: &AppState,
    update: &ScheduleUpdate,
) -> Result<ScheduleUpdate, StoreError> {
    let recorded =
        execute_with_retry(|| record_change(&state.db, update), state.config.retry).await?;
    let _ = state.events.send(recorded.clone());
    Ok(recorded)
}

#[derive(Deserialize)]
struct ChangesQuery {
    since: Option<String>,
}

async fn list_changes(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ChangesQuery>,
) -> Result<HttpResponse> {
    let scope = path.into_inner();
    let since = match query.into_inner().since.filter(|since| !since.is_empty()) {
        Some(raw) => match parse_stamp(&raw) {
            Ok(since) => Some(since),
            Err(err) => return Ok(HttpResponse::BadRequest().body(err.to_string())),
        },
        None => None,
    };

    let batch = changes_since(&state.db, &scope, since, state.config.change_page_size).await?;
    Ok(HttpResponse::Ok().json(batch))
}

async fn publish_change(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<ScheduleUpdate>,
) -> Result<HttpResponse> {
    let scope = path.into_inner();
    let update = body.into_inner();
    if update.salon_id != scope {
        return Ok(HttpResponse::BadRequest().body("Change belongs to another salon"));
    }

    let recorded = publish(&state, &update).await?;
    Ok(HttpResponse::Created().json(recorded))
}

async fn stream_events(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let scope = path.into_inner();
    let rx = state.events.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(update) if update.salon_id == scope => {
            Some(Ok::<web::Bytes, actix_web::Error>(event_to_bytes(&update)))
        }
        Ok(_) => None,
        Err(err) => {
            log::debug!("Event subscriber lagged: {err}");
            None
        }
    });

    HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream)
}

fn event_to_bytes(update: &ScheduleUpdate) -> web::Bytes {
    let payload = serde_json::to_string(update).unwrap_or_else(|_| "{}".to_string());
    web::Bytes::from(format!("event: update\ndata: {payload}\n\n"))
}
