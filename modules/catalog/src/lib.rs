//! Instance-wide resources that are not tied to a job: tags, plugin and
//! playbook configuration, and plugin health.

use owl_core::{ApiRequest, Method, PluginKind, Result, Tag, Transport};
use serde_json::{json, Value};

async fn fetch<T, R>(transport: &T, req: ApiRequest) -> Result<R>
where
    T: Transport + ?Sized,
    R: serde::de::DeserializeOwned,
{
    let ctx = req.context();
    let resp = transport.execute(req).await?.error_for_status(&ctx)?;
    resp.json(&ctx)
}

pub async fn list_tags<T: Transport + ?Sized>(transport: &T) -> Result<Vec<Tag>> {
    fetch(transport, ApiRequest::get("list_tags", "api/tags").target("tags")).await
}

pub async fn get_tag<T: Transport + ?Sized>(transport: &T, tag_id: u64) -> Result<Tag> {
    let req = ApiRequest::get("get_tag", format!("api/tags/{tag_id}"))
        .target(format!("tag #{tag_id}"));
    fetch(transport, req).await
}

pub async fn create_tag<T: Transport + ?Sized>(
    transport: &T,
    label: &str,
    color: &str,
) -> Result<Tag> {
    let req = ApiRequest::post("create_tag", "api/tags")
        .target(format!("tag '{label}'"))
        .json(json!({"label": label, "color": color}));
    let tag: Tag = fetch(transport, req).await?;
    tracing::info!(id = tag.id, label = %tag.label, "tag created");
    Ok(tag)
}

pub async fn edit_tag<T: Transport + ?Sized>(
    transport: &T,
    tag_id: u64,
    label: &str,
    color: &str,
) -> Result<Tag> {
    let req = ApiRequest::new("edit_tag", Method::Put, format!("api/tags/{tag_id}"))
        .target(format!("tag #{tag_id}"))
        .json(json!({"label": label, "color": color}));
    fetch(transport, req).await
}

/// `Ok(true)` only when the server answers 204.
pub async fn delete_tag<T: Transport + ?Sized>(transport: &T, tag_id: u64) -> Result<bool> {
    let req = ApiRequest::new("delete_tag", Method::Delete, format!("api/tags/{tag_id}"))
        .target(format!("tag #{tag_id}"));
    let ctx = req.context();
    let resp = transport.execute(req).await?.error_for_status(&ctx)?;
    Ok(resp.status == 204)
}

/// The raw configuration document for every analyzer or connector.
pub async fn plugin_configs<T: Transport + ?Sized>(
    transport: &T,
    kind: PluginKind,
) -> Result<Value> {
    let (operation, path) = match kind {
        PluginKind::Analyzer => ("analyzer_configs", "api/get_analyzer_configs"),
        PluginKind::Connector => ("connector_configs", "api/get_connector_configs"),
    };
    fetch(transport, ApiRequest::get(operation, path).target(format!("{kind}s"))).await
}

pub async fn playbook_configs<T: Transport + ?Sized>(transport: &T) -> Result<Value> {
    let req = ApiRequest::get("playbook_configs", "api/get_playbook_configs").target("playbooks");
    fetch(transport, req).await
}

/// Asks the instance to health-check one plugin. `None` when the answer
/// carries no boolean status.
pub async fn plugin_health<T: Transport + ?Sized>(
    transport: &T,
    kind: PluginKind,
    name: &str,
) -> Result<Option<bool>> {
    let req = ApiRequest::get("plugin_health", format!("api/{kind}/{name}/healthcheck"))
        .target(format!("{kind} {name}"));
    let answer: Value = fetch(transport, req).await?;
    Ok(answer.get("status").and_then(Value::as_bool))
}
