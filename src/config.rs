use std::path::PathBuf;

use anyhow::{anyhow, Result};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_WORKER_COUNT: usize = 1;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub database_path: PathBuf,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub pubsub_topic: Option<String>,
    pub worker_count: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_port = match env_string("MAILSYNC_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| anyhow!("MAILSYNC_PORT must be a port number, got '{raw}'"))?,
            None => DEFAULT_PORT,
        };

        let database_path = match env_string("MAILSYNC_DB") {
            Some(raw) => PathBuf::from(raw),
            None => Self::default_db_path()?,
        };

        let worker_count = match env_string("MAILSYNC_WORKERS") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|count| *count > 0)
                .ok_or_else(|| anyhow!("MAILSYNC_WORKERS must be a positive integer"))?,
            None => DEFAULT_WORKER_COUNT,
        };

        Ok(Self {
            listen_port,
            database_path,
            google_client_id: env_string("MAILSYNC_GOOGLE_CLIENT_ID"),
            google_client_secret: env_string("MAILSYNC_GOOGLE_CLIENT_SECRET"),
            pubsub_topic: env_string("MAILSYNC_PUBSUB_TOPIC"),
            worker_count,
        })
    }

    pub fn default_db_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow!("failed to determine home directory for default db path"))?;
        Ok(home.join(".mailsync").join("mailsync.db"))
    }

    /// Serving requires provider credentials and the push topic; `migrate`
    /// and `status` run without them.
    pub fn validate_for_serve(&self) -> Result<()> {
        if self.google_client_id.is_none() {
            return Err(anyhow!("MAILSYNC_GOOGLE_CLIENT_ID is required to serve"));
        }
        if self.google_client_secret.is_none() {
            return Err(anyhow!("MAILSYNC_GOOGLE_CLIENT_SECRET is required to serve"));
        }
        if self.pubsub_topic.is_none() {
            return Err(anyhow!("MAILSYNC_PUBSUB_TOPIC is required to serve"));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn serve_validation_requires_provider_credentials() {
        let config = Config {
            listen_port: 8080,
            database_path: std::env::temp_dir().join("mailsync-test.db"),
            google_client_id: None,
            google_client_secret: None,
            pubsub_topic: None,
            worker_count: 1,
        };
        assert!(config.validate_for_serve().is_err());

        let config = Config {
            google_client_id: Some("client".into()),
            google_client_secret: Some("secret".into()),
            pubsub_topic: Some("projects/x/topics/mail".into()),
            ..config
        };
        assert!(config.validate_for_serve().is_ok());
    }
}
