use crate::{
    CreateVmRequest, ErrorKind, IpAddress, Label, ModifyVmRequest, ProviderError, ServerState,
    VmDetails, VmProvider,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_API_URL: &str = "https://api.upcloud.com/1.3";

/// API credentials; supplied by configuration, never read from the
/// environment here.
#[derive(Clone)]
pub struct UpCloudCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for UpCloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpCloudCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub struct UpCloudProvider {
    client: Client,
    base_url: String,
    credentials: UpCloudCredentials,
    poll_interval: Duration,
}

impl UpCloudProvider {
    pub fn new(base_url: &str, credentials: UpCloudCredentials) -> Result<Self, ProviderError> {
        // Default reqwest client has no overall timeout. If the API stalls, a reconcile can hang forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            credentials: UpCloudCredentials {
                username: credentials.username.trim().to_string(),
                password: credentials.password.trim().to_string(),
            },
            poll_interval: Duration::from_secs(5),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Sends the request and returns the JSON body (`Value::Null` for empty
    /// bodies). Non-2xx responses become classified `ProviderError::Api`.
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Value, ProviderError> {
        let resp = self.authed(request).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            let err = api_error(status.as_u16(), &text);
            warn!(operation = what, status = status.as_u16(), error = %err, "[UpCloud API] request failed");
            return Err(err);
        }

        debug!(operation = what, status = status.as_u16(), "[UpCloud API] request succeeded");
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Malformed(format!("{} response is not JSON: {}", what, e)))
    }
}

#[async_trait]
impl VmProvider for UpCloudProvider {
    async fn verify_credentials(&self) -> Result<(), ProviderError> {
        let body = self
            .send(self.client.get(self.url("account")), "get_account")
            .await?;
        let username = body["account"]["username"].as_str().unwrap_or("unknown");
        info!(account = username, "[UpCloud API] credentials verified");
        Ok(())
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmDetails, ProviderError> {
        let body = create_body(request);
        info!(
            title = %request.title,
            zone = %request.zone,
            plan = %request.plan,
            "[UpCloud API] POST /server"
        );
        let resp = self
            .send(self.client.post(self.url("server")).json(&body), "create_server")
            .await?;
        let details = parse_server(&resp["server"])?;
        info!(uuid = %details.uuid, state = %details.state, "[UpCloud API] server created");
        Ok(details)
    }

    async fn get_vm(&self, uuid: &str) -> Result<VmDetails, ProviderError> {
        let resp = self
            .send(
                self.client.get(self.url(&format!("server/{}", uuid))),
                "get_server_details",
            )
            .await?;
        parse_server(&resp["server"])
    }

    async fn modify_vm(
        &self,
        uuid: &str,
        request: &ModifyVmRequest,
    ) -> Result<VmDetails, ProviderError> {
        info!(uuid, title = %request.title, plan = %request.plan, "[UpCloud API] PUT /server");
        let resp = self
            .send(
                self.client
                    .put(self.url(&format!("server/{}", uuid)))
                    .json(&modify_body(request)),
                "modify_server",
            )
            .await?;
        parse_server(&resp["server"])
    }

    async fn delete_vm_and_storage(&self, uuid: &str) -> Result<(), ProviderError> {
        info!(uuid, "[UpCloud API] DELETE /server (with storages)");
        self.send(
            self.client
                .delete(self.url(&format!("server/{}", uuid)))
                .query(&[("storages", "1")]),
            "delete_server_and_storages",
        )
        .await?;
        Ok(())
    }

    async fn find_vm_by_label(&self, label: &Label) -> Result<Option<VmDetails>, ProviderError> {
        let filter = format!("{}={}", label.key, label.value);
        let resp = self
            .send(
                self.client
                    .get(self.url("server"))
                    .query(&[("label", filter.as_str())]),
                "list_servers",
            )
            .await?;
        // The listing only carries summaries; fetch full details of the first match.
        let first_uuid = resp["servers"]["server"]
            .as_array()
            .and_then(|servers| servers.first())
            .and_then(|s| s["uuid"].as_str())
            .map(|s| s.to_string());
        match first_uuid {
            Some(uuid) => self.get_vm(&uuid).await.map(Some),
            None => Ok(None),
        }
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

fn api_error(status: u16, body: &str) -> ProviderError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    // Legacy envelope: {"error": {"error_code": .., "error_message": ..}}
    // Problem JSON:    {"type": "...#ERROR_CODE", "title": .., "status": ..}
    let (code, message) = if let Some(code) = parsed["error"]["error_code"].as_str() {
        (
            code.to_string(),
            parsed["error"]["error_message"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        )
    } else if let Some(kind) = parsed["type"].as_str() {
        let code = kind
            .rsplit('#')
            .next()
            .unwrap_or_default()
            .trim_start_matches("ERROR_")
            .to_string();
        (code, parsed["title"].as_str().unwrap_or_default().to_string())
    } else {
        (String::new(), body.trim().to_string())
    };
    ProviderError::Api {
        kind: ErrorKind::classify(status, &code),
        status,
        code,
        message,
    }
}

fn create_body(request: &CreateVmRequest) -> Value {
    let storage_devices: Vec<Value> = request
        .storage_devices
        .iter()
        .map(|d| {
            json!({
                "action": "clone",
                "storage": d.template,
                "title": d.title,
                "size": d.size_gb,
                "tier": d.tier,
            })
        })
        .collect();
    let interfaces: Vec<Value> = request
        .interfaces
        .iter()
        .map(|iface| {
            let addresses: Vec<Value> = iface
                .ip_families
                .iter()
                .map(|f| json!({ "family": f.as_str() }))
                .collect();
            json!({
                "ip_addresses": { "ip_address": addresses },
                "type": iface.network_type.as_str(),
            })
        })
        .collect();

    let mut server = json!({
        "zone": request.zone,
        "title": request.title,
        "hostname": request.hostname,
        "plan": request.plan,
        "core_number": request.core_number,
        "memory_amount": request.memory_amount,
        "storage_devices": { "storage_device": storage_devices },
        "networking": { "interfaces": { "interface": interfaces } },
    });
    if let Some(tz) = request.timezone.as_deref().filter(|s| !s.is_empty()) {
        server["timezone"] = json!(tz);
    }
    if let Some(user) = &request.login_user {
        let mut login = json!({});
        if let Some(username) = &user.username {
            login["username"] = json!(username);
        }
        if let Some(create_password) = user.create_password {
            login["create_password"] = json!(if create_password { "yes" } else { "no" });
        }
        if !user.ssh_keys.is_empty() {
            login["ssh_keys"] = json!({ "ssh_key": user.ssh_keys });
        }
        server["login_user"] = login;
    }
    if let Some(user_data) = request.user_data.as_deref().filter(|s| !s.is_empty()) {
        server["user_data"] = json!(user_data);
    }
    if !request.labels.is_empty() {
        server["labels"] = labels_value(&request.labels);
    }
    json!({ "server": server })
}

fn modify_body(request: &ModifyVmRequest) -> Value {
    let mut server = json!({
        "title": request.title,
        "plan": request.plan,
        "zone": request.zone,
        "core_number": request.core_number,
        "memory_amount": request.memory_amount,
    });
    if let Some(tz) = request.timezone.as_deref().filter(|s| !s.is_empty()) {
        server["timezone"] = json!(tz);
    }
    if let Some(labels) = &request.labels {
        server["labels"] = labels_value(labels);
    }
    json!({ "server": server })
}

fn labels_value(labels: &[Label]) -> Value {
    let items: Vec<Value> = labels
        .iter()
        .map(|l| json!({ "key": l.key, "value": l.value }))
        .collect();
    json!({ "label": items })
}

/// The API renders most numbers as strings ("2"); accept both.
fn lenient_u32(v: &Value) -> u32 {
    match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn parse_server(v: &Value) -> Result<VmDetails, ProviderError> {
    let uuid = v["uuid"]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProviderError::Malformed("no server uuid in response".to_string()))?
        .to_string();
    let str_field = |name: &str| v[name].as_str().unwrap_or_default().to_string();

    let labels = v["labels"]["label"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|l| {
                    Some(Label::new(l["key"].as_str()?, l["value"].as_str().unwrap_or_default()))
                })
                .collect()
        })
        .unwrap_or_default();
    let ip_addresses = v["ip_addresses"]["ip_address"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|ip| {
                    Some(IpAddress {
                        address: ip["address"].as_str()?.to_string(),
                        family: ip["family"].as_str().unwrap_or_default().to_string(),
                        access: ip["access"].as_str().unwrap_or_default().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(VmDetails {
        uuid,
        title: str_field("title"),
        hostname: str_field("hostname"),
        zone: str_field("zone"),
        plan: str_field("plan"),
        state: ServerState::parse(v["state"].as_str().unwrap_or_default()),
        core_number: lenient_u32(&v["core_number"]),
        memory_amount: lenient_u32(&v["memory_amount"]),
        timezone: v["timezone"].as_str().map(|s| s.to_string()),
        labels,
        ip_addresses,
    })
}
