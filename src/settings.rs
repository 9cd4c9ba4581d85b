//! Settings of the server. Configuration is read from `settings.toml` (if
//! present) and from `TRIPSPLIT__*` environment variables, e.g.
//! `TRIPSPLIT__SERVER__PORT=9090`.
//!
//! See `settings.toml` for an example.
use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tripsplit::{Member, DEFAULT_EPSILON};

#[derive(Debug, Deserialize)]
pub struct App {
    #[serde(default = "default_level")]
    pub level: String,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origin; any origin when unset.
    pub cors_origin: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Store {
    Memory,
    Mongo {
        uri: String,
        database: String,
        #[serde(default = "default_collection")]
        collection: String,
    },
}

#[derive(Debug, Deserialize)]
pub struct Trip {
    pub id: String,
    pub common_currency: String,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    pub members: Vec<Member>,
    /// Units of the common currency per unit of each foreign currency.
    #[serde(default)]
    pub rates: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub app: App,
    pub server: Server,
    pub store: Store,
    pub trip: Trip,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .set_default("app.level", default_level())?
            .set_default("server.bind", default_bind())?
            .set_default("server.port", i64::from(default_port()))?
            .set_default("store.kind", "memory")?
            .add_source(File::with_name("settings").required(false))
            .add_source(
                Environment::with_prefix("TRIPSPLIT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }
}

fn default_level() -> String {
    String::from("info")
}

fn default_bind() -> String {
    String::from("0.0.0.0")
}

fn default_port() -> u16 {
    8080
}

fn default_collection() -> String {
    String::from("Trips")
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}
