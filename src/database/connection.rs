use log::error;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use tokio::time::Duration;
use tokio_postgres::{Client, NoTls};
use url::Url;

use crate::error::StoreError;

/// Connection string split into what tokio-postgres understands and the
/// CA file it does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub url: String,
    pub sslrootcert: Option<String>,
}

pub fn create_ssl_connector(sslrootcert_path: &str) -> Result<MakeTlsConnector, StoreError> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_ca_file(sslrootcert_path)?;
    builder.set_verify(SslVerifyMode::PEER);

    Ok(MakeTlsConnector::new(builder.build()))
}

/// Strip `sslrootcert` from the query and set `connect_timeout`.
pub fn prepare_target(database_url: &str, connect_timeout: Duration) -> Result<ConnectTarget, StoreError> {
    let url = Url::parse(database_url)?;

    let mut sslrootcert = None;
    let mut clean_params = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslrootcert" {
            sslrootcert = Some(value.into_owned());
        } else if key != "connect_timeout" {
            clean_params.push((key.into_owned(), value.into_owned()));
        }
    }
    clean_params.push((
        "connect_timeout".to_string(),
        connect_timeout.as_secs().max(1).to_string(),
    ));

    let mut clean_url = url.clone();
    let query = clean_params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    clean_url.set_query(Some(&query));

    Ok(ConnectTarget {
        url: clean_url.to_string(),
        sslrootcert,
    })
}

/// Open a client, driving the connection on a background task.
pub async fn connect(target: &ConnectTarget) -> Result<Client, StoreError> {
    match &target.sslrootcert {
        Some(path) => {
            let connector = create_ssl_connector(path)?;
            let (client, connection) = tokio_postgres::connect(&target.url, connector).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            Ok(client)
        }
        None => {
            let (client, connection) = tokio_postgres::connect(&target.url, NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            Ok(client)
        }
    }
}
