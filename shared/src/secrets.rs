//! AWS Secrets Manager integration.

use aws_sdk_secretsmanager::Client as SecretsClient;
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{Error, Result};

/// Database credentials from Secrets Manager.
#[derive(Debug, Deserialize)]
pub struct DatabaseCredentials {
    pub username: String,
    pub password: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dbname: Option<String>,
}

/// Secrets Manager client with a per-instance cache.
///
/// One instance lives in each Lambda's state, so warm invocations reuse
/// fetched values without a process-wide static.
pub struct SecretsCache {
    client: SecretsClient,
    cache: RwLock<HashMap<String, String>>,
}

impl SecretsCache {
    pub fn new(client: SecretsClient) -> Self {
        Self {
            client,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Get a secret value, fetching it on first use.
    pub async fn get_secret(&self, secret_arn: &str) -> Result<String> {
        {
            let cache = self.cache.read().await;
            if let Some(value) = cache.get(secret_arn) {
                return Ok(value.clone());
            }
        }

        let response = self
            .client
            .get_secret_value()
            .secret_id(secret_arn)
            .send()
            .await
            .map_err(|e| Error::Aws(format!("Failed to get secret: {}", e)))?;

        let secret_string = response
            .secret_string()
            .ok_or_else(|| Error::Aws("Secret has no string value".to_string()))?
            .to_string();

        {
            let mut cache = self.cache.write().await;
            cache.insert(secret_arn.to_string(), secret_string.clone());
        }

        Ok(secret_string)
    }

    /// Get database credentials from Secrets Manager.
    pub async fn database_credentials(&self, secret_arn: &str) -> Result<DatabaseCredentials> {
        let secret_string = self.get_secret(secret_arn).await?;
        parse_database_credentials(&secret_string)
    }
}

fn parse_database_credentials(secret: &str) -> Result<DatabaseCredentials> {
    serde_json::from_str(secret)
        .map_err(|e| Error::Aws(format!("Failed to parse database credentials: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credentials() {
        let json = r#"{"username":"admin","password":"secret123","host":"db.example.com","port":5432,"dbname":"research"}"#;
        let creds = parse_database_credentials(json).unwrap();
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password, "secret123");
        assert_eq!(creds.host, Some("db.example.com".to_string()));
        assert_eq!(creds.dbname.as_deref(), Some("research"));
    }

    #[test]
    fn test_parse_credentials_rejects_garbage() {
        assert!(matches!(parse_database_credentials("not json"), Err(Error::Aws(_))));
    }
}
