use std::fs::File;
use std::io::Read;

use anyhow::anyhow;
use tracing::instrument;
use url::Url;

use crate::conventions::Conventions;

use super::request_executor_handle::RequestExecutor;
use super::RequestExecutorError;

/// Everything [`RequestExecutor::new`] needs, assembled and validated by the
/// builder.
pub(crate) struct ExecutorInitialConfiguration {
    pub(crate) urls: Vec<Url>,
    pub(crate) database: String,
    pub(crate) conventions: Conventions,
    pub(crate) client: reqwest::Client,
}

/// Builds a [`RequestExecutor`].
///
/// The HTTP transport is an explicit dependency: inject a preconfigured
/// [`reqwest::Client`] with [`set_client`](Self::set_client) to share one
/// connection pool across executors, or let the builder construct one from
/// the conventions (compression mode, optional client certificate). The
/// builder can be reused as a template; every [`build`](Self::build) call
/// creates an independent executor with its own background actor.
#[derive(Debug, Default)]
pub struct RequestExecutorBuilder {
    urls: Vec<String>,
    database: Option<String>,
    conventions: Conventions,
    client: Option<reqwest::Client>,
    client_certificate_path: Option<String>,
}

impl RequestExecutorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_urls<T>(mut self, urls: &[T]) -> Self
    where
        T: AsRef<str>,
    {
        for url in urls {
            self.urls.push(url.as_ref().to_string());
        }
        self
    }

    pub fn set_database(mut self, database: &str) -> Self {
        self.database = Some(database.to_string());
        self
    }

    pub fn set_conventions(mut self, conventions: Conventions) -> Self {
        self.conventions = conventions;
        self
    }

    /// Injects the HTTP transport instead of letting the builder create one.
    pub fn set_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn set_client_certificate(mut self, certificate_path: &str) -> Self {
        self.client_certificate_path = Some(certificate_path.to_string());
        self
    }

    #[instrument(level = "debug", name = "Build RequestExecutor", skip(self))]
    pub fn build(&self) -> Result<RequestExecutor, RequestExecutorError> {
        if self.urls.is_empty() {
            tracing::error!(
                "No URLs were supplied and a request executor can't exist without at least one"
            );
            return Err(RequestExecutorError::MissingUrls);
        }
        let urls = validate_urls(&self.urls, self.client_certificate_path.is_some())?;

        let database = self
            .database
            .clone()
            .ok_or(RequestExecutorError::MissingDatabase)?;

        let client = match &self.client {
            Some(client) => client.clone(),
            None => build_client(&self.conventions, self.client_certificate_path.as_deref())?,
        };

        Ok(RequestExecutor::new(ExecutorInitialConfiguration {
            urls,
            database,
            conventions: self.conventions.clone(),
            client,
        }))
    }
}

fn validate_urls(urls: &[String], require_https: bool) -> Result<Vec<Url>, RequestExecutorError> {
    let mut parsed = Vec::with_capacity(urls.len());
    for raw in urls {
        let url = Url::parse(raw).map_err(|error| RequestExecutorError::InvalidSeedUrl {
            url: raw.clone(),
            reason: error.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => parsed.push(url),
            other => {
                return Err(RequestExecutorError::InvalidSeedUrl {
                    url: raw.clone(),
                    reason: format!("unsupported scheme `{}`", other),
                })
            }
        }
    }

    let first_scheme = parsed[0].scheme();
    if let Some(mixed) = parsed.iter().find(|url| url.scheme() != first_scheme) {
        return Err(RequestExecutorError::InvalidSeedUrl {
            url: mixed.to_string(),
            reason: "seed URLs must not mix http and https".to_string(),
        });
    }
    if require_https && first_scheme != "https" {
        return Err(RequestExecutorError::InvalidSeedUrl {
            url: parsed[0].to_string(),
            reason: "a client certificate requires https URLs".to_string(),
        });
    }

    Ok(parsed)
}

fn build_client(
    conventions: &Conventions,
    certificate_path: Option<&str>,
) -> Result<reqwest::Client, RequestExecutorError> {
    let mut builder = reqwest::Client::builder().gzip(conventions.use_compression());

    if let Some(path) = certificate_path {
        let mut buf = Vec::new();
        File::open(path)
            .map_err(|error| anyhow!("Failed to open certificate file. Caused by: {}", error))?
            .read_to_end(&mut buf)
            .map_err(|error| anyhow!("File was opened but unable to read. Caused by: {}", error))?;
        let identity = reqwest::Identity::from_pem(&buf)
            .map_err(|error| anyhow!("Invalid pem file. Caused by: {}", error))?;
        builder = builder.identity(identity).use_rustls_tls();
    }

    builder
        .build()
        .map_err(|error| anyhow!("Failed to build the HTTP client. Caused by: {}", error).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_an_empty_url_list() {
        let result = RequestExecutorBuilder::new().set_database("orders").build();
        assert!(matches!(result, Err(RequestExecutorError::MissingUrls)));
    }

    #[test]
    fn rejects_a_missing_database() {
        let result = RequestExecutorBuilder::new()
            .set_urls(&["http://db1.example.com"])
            .build();
        assert!(matches!(result, Err(RequestExecutorError::MissingDatabase)));
    }

    #[test]
    fn rejects_unparseable_urls() {
        let result = validate_urls(&["not a url".to_string()], false);
        assert!(matches!(
            result,
            Err(RequestExecutorError::InvalidSeedUrl { .. })
        ));
    }

    #[test]
    fn rejects_mixed_schemes() {
        let urls = vec![
            "http://db1.example.com".to_string(),
            "https://db2.example.com".to_string(),
        ];
        let result = validate_urls(&urls, false);
        assert!(matches!(
            result,
            Err(RequestExecutorError::InvalidSeedUrl { reason, .. }) if reason.contains("mix")
        ));
    }

    #[test]
    fn requires_https_with_a_certificate() {
        let urls = vec!["http://db1.example.com".to_string()];
        let result = validate_urls(&urls, true);
        assert!(matches!(
            result,
            Err(RequestExecutorError::InvalidSeedUrl { reason, .. }) if reason.contains("https")
        ));
    }
}
