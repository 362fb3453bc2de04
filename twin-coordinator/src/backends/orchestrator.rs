// Lab orchestrator power and link backend (GNS3-style REST API)

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;
use twin_common::config::OrchestratorConf;
use twin_common::enforcement::{LinkBackend, LinkInfo, NodeState, PowerBackend};
use twin_common::error::SyncError;

#[derive(Clone)]
pub struct OrchestratorClient {
    http: Client,
    base: String,
    project: String,
    user: String,
    password: String,
}

impl OrchestratorClient {
    pub fn new(conf: &OrchestratorConf) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(Duration::from_secs(conf.timeout_seconds.max(1))).build()?;
        Ok(Self {
            http,
            base: conf.url.trim_end_matches('/').to_string(),
            project: conf.project_id.clone(),
            user: conf.user.clone(),
            password: conf.password.clone(),
        })
    }

    pub fn node_url(&self, node: &str) -> String {
        format!("{}/projects/{}/nodes/{node}", self.base, self.project)
    }

    pub fn links_url(&self) -> String {
        format!("{}/projects/{}/links", self.base, self.project)
    }

    async fn call(&self, method: Method, url: String, body: Option<Value>) -> Result<String, SyncError> {
        let label = if method == Method::GET {
            "GET"
        } else if method == Method::PATCH {
            "PATCH"
        } else {
            "POST"
        };
        let api_err = |status: String, body: String| SyncError::OrchestratorApi {
            method: label,
            url: url.clone(),
            status,
            body,
        };

        let mut req = self.http.request(method.clone(), &url).basic_auth(&self.user, Some(&self.password));
        if method != Method::GET {
            let body = body.unwrap_or_else(|| json!({}));
            req = req.header("content-type", "application/json").body(body.to_string());
        }
        let resp = req.send().await.map_err(|e| api_err("unreachable".into(), e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| api_err(status.to_string(), e.to_string()))?;
        if !status.is_success() {
            return Err(api_err(status.to_string(), body.chars().take(300).collect()));
        }
        Ok(body)
    }
}

#[async_trait]
impl PowerBackend for OrchestratorClient {
    async fn start(&mut self, node: &str) -> Result<(), SyncError> {
        self.call(Method::POST, format!("{}/start", self.node_url(node)), None).await?;
        info!(node, "node start requested");
        Ok(())
    }

    async fn stop(&mut self, node: &str) -> Result<(), SyncError> {
        self.call(Method::POST, format!("{}/stop", self.node_url(node)), None).await?;
        info!(node, "node stop requested");
        Ok(())
    }

    async fn get_state(&mut self, node: &str) -> Result<NodeState, SyncError> {
        let url = self.node_url(node);
        let body = self.call(Method::GET, url.clone(), None).await?;
        let status = parse_node_status(&body).ok_or_else(|| SyncError::OrchestratorApi {
            method: "GET",
            url,
            status: "200".into(),
            body: "response carries no status field".into(),
        })?;
        Ok(NodeState { node: node.to_string(), status })
    }
}

#[async_trait]
impl LinkBackend for OrchestratorClient {
    async fn links_between(&mut self, a: &str, b: &str) -> Result<Vec<LinkInfo>, SyncError> {
        let url = self.links_url();
        let body = self.call(Method::GET, url.clone(), None).await?;
        parse_links(&body, a, b).ok_or_else(|| SyncError::OrchestratorApi {
            method: "GET",
            url,
            status: "200".into(),
            body: "response is not a link list".into(),
        })
    }

    async fn set_suspended(&mut self, link: &str, suspend: bool) -> Result<(), SyncError> {
        let url = format!("{}/{link}", self.links_url());
        self.call(Method::PATCH, url, Some(json!({ "suspend": suspend }))).await?;
        info!(link, suspend, "link suspension changed");
        Ok(())
    }
}

fn parse_node_status(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value.get("status")?.as_str().map(str::to_string)
}

/// Links joining nodes `a` and `b`. Older servers name the id `id` instead of `link_id`.
fn parse_links(body: &str, a: &str, b: &str) -> Option<Vec<LinkInfo>> {
    let value: Value = serde_json::from_str(body).ok()?;
    let found = value
        .as_array()?
        .iter()
        .filter(|link| {
            let ends: Vec<&str> = link
                .get("nodes")
                .and_then(Value::as_array)
                .map(|nodes| nodes.iter().filter_map(|n| n.get("node_id")?.as_str()).collect())
                .unwrap_or_default();
            ends.contains(&a) && ends.contains(&b)
        })
        .filter_map(|link| {
            let id = link.get("link_id").or_else(|| link.get("id"))?.as_str()?;
            let suspended = link.get("suspend").and_then(Value::as_bool).unwrap_or(false);
            Some(LinkInfo { id: id.to_string(), suspended })
        })
        .collect();
    Some(found)
}
