//! API server configuration

use std::net::SocketAddr;

use anyhow::Context;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    /// Bearer token for the billing and admin routes. When unset those
    /// routes reject every request.
    pub admin_api_token: Option<String>,
    /// Apply embedded migrations on startup
    pub run_migrations: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_addr", &self.bind_addr)
            .field("admin_api_token_configured", &self.admin_api_token.is_some())
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let bind_addr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("BIND_ADDR must be a socket address")?;

        let admin_api_token = std::env::var("ADMIN_API_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(true);

        Ok(Self {
            database_url,
            bind_addr,
            admin_api_token,
            run_migrations,
        })
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn clear() {
        for key in ["DATABASE_URL", "BIND_ADDR", "ADMIN_API_TOKEN", "RUN_MIGRATIONS"] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        std::env::set_var("DATABASE_URL", "postgres://localhost/crm");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_addr, DEFAULT_BIND_ADDR.parse().unwrap());
        assert!(config.admin_api_token.is_none());
        assert!(config.run_migrations);
        clear();
    }

    #[test]
    #[serial]
    fn test_blank_token_is_unset() {
        clear();
        std::env::set_var("DATABASE_URL", "postgres://localhost/crm");
        std::env::set_var("ADMIN_API_TOKEN", "   ");
        std::env::set_var("RUN_MIGRATIONS", "false");

        let config = Config::from_env().unwrap();
        assert!(config.admin_api_token.is_none());
        assert!(!config.run_migrations);
        clear();
    }

    #[test]
    #[serial]
    fn test_missing_database_url_fails() {
        clear();
        assert!(Config::from_env().is_err());

        std::env::set_var("DATABASE_URL", "postgres://localhost/crm");
        std::env::set_var("BIND_ADDR", "not an address");
        assert!(Config::from_env().is_err());
        clear();
    }
}
