//! Minimal Apify REST API client.
//!
//! Supports starting and aborting actor runs, polling for completion,
//! reading and pushing dataset items, and charging pay-per-event usage.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{Result, SleuthError};

/// Wrapper for Apify API responses.
#[derive(Debug, Clone, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

/// Apify actor run metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct RunData {
    pub id: String,
    pub status: String,
    #[serde(rename = "defaultDatasetId")]
    pub default_dataset_id: String,
}

#[derive(Clone)]
pub struct ApifyClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApifyClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Actor ids of the form `user/name` are addressed as `user~name` in API paths.
    fn actor_path(actor_id: &str) -> String {
        actor_id.replace('/', "~")
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(SleuthError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.client.get(url).bearer_auth(&self.token).send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Start an actor run. Returns immediately with run metadata.
    pub async fn start_run(&self, actor_id: &str, input: &Value) -> Result<RunData> {
        let url = format!("{}/acts/{}/runs", self.base_url, Self::actor_path(actor_id));
        let api_resp: ApiResponse<RunData> = self.post_json(&url, input).await?;
        Ok(api_resp.data)
    }

    /// Abort a run that is still in progress.
    pub async fn abort_run(&self, run_id: &str) -> Result<()> {
        let url = format!("{}/actor-runs/{}/abort", self.base_url, run_id);
        let resp = self.client.post(&url).bearer_auth(&self.token).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Poll until a run completes, long-polling up to `wait_secs` per request.
    pub async fn wait_for_run(&self, run_id: &str, wait_secs: u64) -> Result<RunData> {
        loop {
            let url = format!(
                "{}/actor-runs/{}?waitForFinish={}",
                self.base_url, run_id, wait_secs
            );
            let api_resp: ApiResponse<RunData> = self.get_json(&url).await?;

            match api_resp.data.status.as_str() {
                "SUCCEEDED" => return Ok(api_resp.data),
                "FAILED" | "ABORTED" | "TIMED-OUT" | "TIMED_OUT" => {
                    return Err(SleuthError::RunFailed {
                        run_id: run_id.to_string(),
                        status: api_resp.data.status,
                    });
                }
                _ => {
                    debug!(run_id, status = %api_resp.data.status, "Run still in progress");
                    continue;
                }
            }
        }
    }

    /// Fetch up to `limit` dataset items.
    pub async fn get_dataset_items(&self, dataset_id: &str, limit: usize) -> Result<Vec<Value>> {
        let url = format!(
            "{}/datasets/{}/items?format=json&clean=true&limit={}",
            self.base_url, dataset_id, limit
        );
        self.get_json(&url).await
    }

    /// Append items to a dataset.
    pub async fn push_dataset_items<T: Serialize>(&self, dataset_id: &str, items: &[T]) -> Result<()> {
        let url = format!("{}/datasets/{}/items", self.base_url, dataset_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(items)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Charge `count` occurrences of a pay-per-event usage event to a run.
    pub async fn charge(&self, run_id: &str, event_name: &str, count: u32) -> Result<()> {
        let url = format!("{}/actor-runs/{}/charge", self.base_url, run_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "eventName": event_name, "count": count }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Run an actor end-to-end: start the run, wait for it, read its dataset.
    ///
    /// If the returned future is dropped or polling fails before the run
    /// reaches a final status, the run is aborted in the background.
    pub async fn run_actor(
        &self,
        actor_id: &str,
        input: &Value,
        limit: usize,
        wait_secs: u64,
    ) -> Result<Vec<Value>> {
        info!(actor_id, "Starting actor run");

        let run = self.start_run(actor_id, input).await?;
        info!(run_id = %run.id, "Actor run started, polling for completion");

        let mut abort = AbortOnDrop::new(self.clone(), run.id.clone());
        let completed = match self.wait_for_run(&run.id, wait_secs).await {
            Ok(completed) => completed,
            Err(e @ SleuthError::RunFailed { .. }) => {
                abort.disarm();
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        abort.disarm();
        info!(
            run_id = %completed.id,
            dataset_id = %completed.default_dataset_id,
            "Run completed, fetching results"
        );

        let items = self
            .get_dataset_items(&completed.default_dataset_id, limit)
            .await?;
        info!(actor_id, count = items.len(), "Fetched dataset items");

        Ok(items)
    }
}

/// Aborts an actor run on drop unless disarmed.
struct AbortOnDrop {
    client: ApifyClient,
    run_id: Option<String>,
}

impl AbortOnDrop {
    fn new(client: ApifyClient, run_id: String) -> Self {
        Self {
            client,
            run_id: Some(run_id),
        }
    }

    fn disarm(&mut self) {
        self.run_id = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(run_id) = self.run_id.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%run_id, "No runtime left to abort actor run");
            return;
        };

        let client = self.client.clone();
        runtime.spawn(async move {
            match client.abort_run(&run_id).await {
                Ok(()) => info!(%run_id, "Aborted unfinished actor run"),
                Err(e) => warn!(%run_id, error = %e, "Failed to abort actor run"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn run_body(status: &str) -> String {
        json!({"data": {"id": "run1", "status": status, "defaultDatasetId": "ds1"}}).to_string()
    }

    #[tokio::test]
    async fn test_run_actor_end_to_end() {
        let mut server = mockito::Server::new_async().await;

        let start = server
            .mock("POST", "/acts/epctex~realtor-scraper/runs")
            .match_header("authorization", "Bearer token-1")
            .match_body(Matcher::PartialJson(json!({"maxItems": 5})))
            .with_status(201)
            .with_body(run_body("READY"))
            .create_async()
            .await;
        let poll = server
            .mock("GET", "/actor-runs/run1")
            .match_query(Matcher::UrlEncoded("waitForFinish".into(), "1".into()))
            .with_body(run_body("SUCCEEDED"))
            .create_async()
            .await;
        let items = server
            .mock("GET", "/datasets/ds1/items")
            .match_query(Matcher::UrlEncoded("limit".into(), "5".into()))
            .with_body(r#"[{"id": "a"}, {"id": "b"}]"#)
            .create_async()
            .await;

        let client = ApifyClient::new(server.url(), "token-1");
        let records = client
            .run_actor("epctex/realtor-scraper", &json!({"maxItems": 5}), 5, 1)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], "a");
        start.assert_async().await;
        poll.assert_async().await;
        items.assert_async().await;
    }

    #[tokio::test]
    async fn test_failed_run() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/actor-runs/run1")
            .match_query(Matcher::Any)
            .with_body(run_body("FAILED"))
            .create_async()
            .await;

        let client = ApifyClient::new(server.url(), "t");
        let result = client.wait_for_run("run1", 1).await;

        assert!(matches!(result, Err(SleuthError::RunFailed { status, .. }) if status == "FAILED"));
    }

    #[tokio::test]
    async fn test_api_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/acts/a~b/runs")
            .with_status(402)
            .with_body("insufficient credit")
            .create_async()
            .await;

        let client = ApifyClient::new(server.url(), "t");
        let result = client.start_run("a/b", &json!({})).await;

        assert!(matches!(
            result,
            Err(SleuthError::Api { status: 402, ref message }) if message == "insufficient credit"
        ));
    }

    #[tokio::test]
    async fn test_abandoned_run_is_aborted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/acts/a~b/runs")
            .with_status(201)
            .with_body(run_body("READY"))
            .create_async()
            .await;
        server
            .mock("GET", "/actor-runs/run1")
            .match_query(Matcher::Any)
            .with_body(run_body("RUNNING"))
            .expect_at_least(1)
            .create_async()
            .await;
        let abort = server
            .mock("POST", "/actor-runs/run1/abort")
            .with_body(run_body("ABORTING"))
            .create_async()
            .await;

        let client = ApifyClient::new(server.url(), "t");
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(300),
            client.run_actor("a/b", &json!({}), 5, 1),
        )
        .await;
        assert!(result.is_err());

        for _ in 0..50 {
            if abort.matched_async().await {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        abort.assert_async().await;
    }

    #[tokio::test]
    async fn test_finished_run_is_not_aborted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/acts/a~b/runs")
            .with_status(201)
            .with_body(run_body("READY"))
            .create_async()
            .await;
        server
            .mock("GET", "/actor-runs/run1")
            .match_query(Matcher::Any)
            .with_body(run_body("FAILED"))
            .create_async()
            .await;
        let abort = server
            .mock("POST", "/actor-runs/run1/abort")
            .expect(0)
            .create_async()
            .await;

        let client = ApifyClient::new(server.url(), "t");
        let result = client.run_actor("a/b", &json!({}), 5, 1).await;
        assert!(matches!(result, Err(SleuthError::RunFailed { .. })));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        abort.assert_async().await;
    }

    #[tokio::test]
    async fn test_charge_event() {
        let mut server = mockito::Server::new_async().await;
        let charge = server
            .mock("POST", "/actor-runs/run9/charge")
            .match_body(Matcher::Json(json!({"eventName": "property-found", "count": 3})))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;

        let client = ApifyClient::new(server.url(), "t");
        client.charge("run9", "property-found", 3).await.unwrap();
        charge.assert_async().await;
    }
}
