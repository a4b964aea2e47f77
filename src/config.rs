use clap::Parser;
use tracing::warn;

#[derive(Clone, Debug, Parser)]
#[command(name = "taskflow")]
pub struct Config {
    #[arg(long, env = "TASKFLOW_PORT", default_value_t = 7500)]
    pub port: u16,

    #[arg(long, env = "TASKFLOW_DB_URL", default_value = "sqlite://./taskflow.db")]
    pub db_url: String,

    #[arg(long, env = "TASKFLOW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "TASKFLOW_MAX_REQUEST_BODY_BYTES", default_value_t = 2 * 1024 * 1024)]
    pub max_request_body_bytes: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let config = <Self as Parser>::parse();
        config.validate();
        config
    }

    pub fn log_startup_warnings(&self) {
        if self.db_url.starts_with("sqlite://") {
            warn!("using sqlite backend, single-writer only; point TASKFLOW_DB_URL at postgres for multi-instance deployments");
        }
    }

    fn validate(&self) {
        assert!(
            self.max_request_body_bytes > 0,
            "TASKFLOW_MAX_REQUEST_BODY_BYTES must be greater than 0"
        );
    }
}
