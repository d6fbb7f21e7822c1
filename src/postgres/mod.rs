// ABOUTME: PostgreSQL connection helpers shared by the source and target adapters
// ABOUTME: TLS-aware connect, retrying connect and connection error classification

pub mod privileges;

pub use privileges::{check_source_readiness, SourceReadiness};

use crate::config::ConnectionParams;
use crate::error::SyncError;
use crate::utils::Backoff;
use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::Client;

fn pg_config(params: &ConnectionParams) -> Result<tokio_postgres::Config> {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&params.host)
        .port(params.port)
        .dbname(&params.database)
        .user(&params.user)
        .application_name("database-mirror")
        .connect_timeout(Duration::from_secs(30))
        .keepalives(true)
        .keepalives_idle(Duration::from_secs(60));
    if let Some(password) = &params.password {
        config.password(password);
    }
    let ssl_mode = match params.sslmode.as_deref() {
        None | Some("prefer") => SslMode::Prefer,
        Some("disable") => SslMode::Disable,
        Some("require") | Some("verify-ca") | Some("verify-full") => SslMode::Require,
        Some(other) => anyhow::bail!("Unsupported sslmode '{}'", other),
    };
    config.ssl_mode(ssl_mode);
    Ok(config)
}

/// Open a connection and drive it on a background task.
pub async fn connect(params: &ConnectionParams) -> Result<Client> {
    let config = pg_config(params)?;
    let connector = TlsConnector::builder()
        .build()
        .context("Failed to build TLS connector")?;
    let tls = MakeTlsConnector::new(connector);

    let (client, connection) = config.connect(tls).await.with_context(|| {
        format!(
            "Failed to connect to PostgreSQL at {}:{}/{}",
            params.host, params.port, params.database
        )
    })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!("PostgreSQL connection closed: {}", e);
        }
    });

    Ok(client)
}

/// Connect, retrying a few times while the server cannot be reached.
pub async fn connect_with_retry(params: &ConnectionParams) -> crate::error::Result<Client> {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
    backoff
        .retry(
            3,
            || async move { connect(params).await.map_err(connect_error) },
            SyncError::is_transient,
        )
        .await
}

/// Classify a failed [`connect`]. Only an unreachable server is transient;
/// bad settings and rejected credentials are not.
pub fn connect_error(err: anyhow::Error) -> SyncError {
    let unreachable = err
        .downcast_ref::<tokio_postgres::Error>()
        .map(is_connection_error)
        .unwrap_or(false);
    if unreachable {
        SyncError::SourceUnavailable(format!("{:#}", err))
    } else {
        SyncError::invalid(format!("{:#}", err))
    }
}

/// Whether an error means the connection itself is gone (as opposed to a failed statement).
pub fn is_connection_error(err: &tokio_postgres::Error) -> bool {
    err.is_closed() || err.code().is_none()
}

/// Undefined-table SQLSTATE.
pub fn is_undefined_table(err: &tokio_postgres::Error) -> bool {
    err.code() == Some(&tokio_postgres::error::SqlState::UNDEFINED_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(sslmode: Option<&str>) -> ConnectionParams {
        ConnectionParams {
            host: "localhost".into(),
            port: 5433,
            database: "shop".into(),
            user: "alice".into(),
            password: Some("secret".into()),
            sslmode: sslmode.map(str::to_string),
        }
    }

    #[test]
    fn test_pg_config_ssl_modes() {
        assert_eq!(pg_config(&params(None)).unwrap().get_ssl_mode(), SslMode::Prefer);
        assert_eq!(
            pg_config(&params(Some("disable"))).unwrap().get_ssl_mode(),
            SslMode::Disable
        );
        assert_eq!(
            pg_config(&params(Some("require"))).unwrap().get_ssl_mode(),
            SslMode::Require
        );
        assert!(pg_config(&params(Some("sometimes"))).is_err());
    }

    #[test]
    fn test_connect_error_keeps_bad_settings_fatal() {
        let err = connect_error(anyhow::anyhow!("Unsupported sslmode 'sometimes'"));
        assert!(matches!(err, SyncError::InvalidConfiguration(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_connect_with_retry_does_not_retry_bad_settings() {
        let started = std::time::Instant::now();
        let err = connect_with_retry(&params(Some("sometimes"))).await.unwrap_err();
        assert!(err.to_string().contains("sslmode"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_pg_config_fields() {
        let config = pg_config(&params(None)).unwrap();
        assert_eq!(config.get_ports(), &[5433]);
        assert_eq!(config.get_dbname(), Some("shop"));
        assert_eq!(config.get_user(), Some("alice"));
        assert_eq!(config.get_password(), Some(&b"secret"[..]));
    }
}
