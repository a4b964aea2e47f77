use std::sync::Arc;

use sqlx::AnyPool;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: AnyPool,
}

impl AppState {
    pub fn new(config: Config, db: AnyPool) -> Self {
        Self {
            config: Arc::new(config),
            db,
        }
    }
}
