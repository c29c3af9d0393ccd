use std::env;

/// Engine configuration from the environment (optionally seeded from a
/// `.env` file by the CLI).
#[derive(Clone, Debug)]
pub struct Config {
    pub chain_name: String,
    pub rpc_url: String,
    pub rpc_ws_url: String,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub db_host: String,
    pub db_port: String,
    pub db_reader_host: String,
    pub db_secret: String,
    pub webhook_url: Option<String>,
}

fn required(key: &str) -> eyre::Result<String> {
    env::var(key).map_err(|_| eyre::eyre!("missing required environment variable {key}"))
}

impl Config {
    pub fn from_env() -> eyre::Result<Self> {
        Ok(Self {
            chain_name: required("CHAIN_NAME")?,
            rpc_url: required("RPC_URL")?,
            rpc_ws_url: required("RPC_WS_URL")?,
            db_user: required("DB_USER")?,
            db_password: required("DB_PASSWORD")?,
            db_name: required("DB_NAME")?,
            db_host: required("DB_HOST")?,
            db_port: required("DB_PORT")?,
            db_reader_host: required("DB_READER_HOST")?,
            db_secret: required("DB_SECRET")?,
            webhook_url: env::var("WEBHOOK_URL").ok(),
        })
    }

    pub fn writer_dsn(&self) -> String {
        self.dsn(&self.db_host)
    }

    pub fn reader_dsn(&self) -> String {
        let host =
            if self.db_reader_host.is_empty() { &self.db_host } else { &self.db_reader_host };
        self.dsn(host)
    }

    fn dsn(&self, host: &str) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_user, self.db_password, host, self.db_port, self.db_name
        )
    }
}
