#![allow(dead_code)]

use std::time::Duration;

use reqwest::Method;
use serde::Deserialize;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use meridian_client::{
    ClusterCommand, CommandRequest, Conventions, RequestExecutor, RequestExecutorError, ServerNode,
};

/// The document-ish payload the test endpoints serve.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ValuePayload {
    pub value: String,
}

/// A minimal command against the `/value` endpoint, with knobs for every
/// routing/caching combination the executor distinguishes.
pub struct ValueCommand {
    write: bool,
    cacheable: bool,
    aggressive: bool,
    pub result: Option<ValuePayload>,
    pub parsed_from_cache: Option<bool>,
}

impl ValueCommand {
    pub fn read() -> Self {
        Self {
            write: false,
            cacheable: false,
            aggressive: false,
            result: None,
            parsed_from_cache: None,
        }
    }

    pub fn cacheable() -> Self {
        Self {
            cacheable: true,
            ..Self::read()
        }
    }

    pub fn aggressively_cacheable() -> Self {
        Self {
            cacheable: true,
            aggressive: true,
            ..Self::read()
        }
    }

    pub fn write() -> Self {
        Self {
            write: true,
            ..Self::read()
        }
    }
}

impl ClusterCommand for ValueCommand {
    fn is_read_request(&self) -> bool {
        !self.write
    }

    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn is_aggressively_cacheable(&self) -> bool {
        self.aggressive
    }

    fn build_request(&self, node: &ServerNode) -> Result<CommandRequest, RequestExecutorError> {
        let url = node
            .url
            .join("value")
            .map_err(|error| RequestExecutorError::UnexpectedError(error.into()))?;
        let method = if self.write { Method::PUT } else { Method::GET };
        Ok(CommandRequest::new(method, url))
    }

    fn parse_response(
        &mut self,
        body: &str,
        from_cache: bool,
    ) -> Result<(), RequestExecutorError> {
        self.parsed_from_cache = Some(from_cache);
        self.result = Some(
            serde_json::from_str(body)
                .map_err(|source| RequestExecutorError::MalformedResponse { source })?,
        );
        Ok(())
    }
}

/// Conventions for tests that pin the executor to the seed URLs.
pub fn pinned_conventions() -> Conventions {
    Conventions::default()
        .with_disable_topology_updates(true)
        .with_request_timeout(Duration::from_secs(5))
}

/// An executor running on the seed URLs directly, without topology discovery.
pub fn pinned_executor(urls: &[String]) -> RequestExecutor {
    RequestExecutor::builder()
        .set_urls(urls)
        .set_database("orders")
        .set_conventions(pinned_conventions())
        .build()
        .expect("failed to build executor")
}

pub fn value_body(value: &str) -> String {
    format!(r#"{{"Value":"{}"}}"#, value)
}

/// The wire shape of a database topology listing `urls` as members A, B, …
pub fn topology_body(etag: i64, urls: &[String]) -> String {
    let nodes = urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            format!(
                r#"{{"Url":"{}","Database":"orders","ClusterTag":"{}","ServerRole":"Member"}}"#,
                url,
                char::from(b'A' + i as u8)
            )
        })
        .collect::<Vec<_>>()
        .join(",");
    format!(r#"{{"Etag":{},"Nodes":[{}]}}"#, etag, nodes)
}

pub async fn mount_topology(server: &MockServer, etag: i64, urls: &[String]) {
    Mock::given(method("GET"))
        .and(path("/topology"))
        .respond_with(ResponseTemplate::new(200).set_body_string(topology_body(etag, urls)))
        .mount(server)
        .await;
}

/// Polls until `predicate` holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(predicate: F) -> bool {
    for _ in 0..40 {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
