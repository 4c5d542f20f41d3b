use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::broadcast;

use crate::{config::Config, db::SqliteStore, engine::StatusEngine, models::ScheduleUpdate};

pub type Engine = StatusEngine<SqliteStore, SqliteStore>;

const EVENT_BUFFER: usize = 256;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub store: SqliteStore,
    pub engine: Arc<Engine>,
    pub events: broadcast::Sender<ScheduleUpdate>,
    pub config: Config,
}

impl AppState {
    pub fn new(db: SqlitePool, config: Config) -> Self {
        let store = SqliteStore::new(db.clone(), config.change_page_size);
        let engine = Arc::new(StatusEngine::new(store.clone(), store.clone()));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            db,
            store,
            engine,
            events,
            config,
        }
    }
}
