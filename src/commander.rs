use std::{future::Future, time::Duration};

use anyhow::Context;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const EDSM_POSITION_URL: &str = "https://www.edsm.net/api-logs-v1/get-position";
pub const EDSM_CREDITS_URL: &str = "https://www.edsm.net/api-commander-v1/get-credits";
pub const INARA_API_URL: &str = "https://inara.cz/inapi/v1/";

const INARA_APP_NAME: &str = "EdSystemsCache";
const EDSM_SUCCESS: i64 = 100;

pub trait CommanderLocator: Send + Sync {
    fn current_system(&self) -> impl Future<Output = Option<String>> + Send;

    fn current_power(&self) -> impl Future<Output = Option<String>> + Send;
}

#[derive(Debug, Clone)]
pub struct CommanderClient {
    client: reqwest::Client,
    cmdr_name: String,
    edsm_api_key: Option<String>,
    inara_api_key: Option<String>,
}

impl CommanderClient {
    pub fn new(
        cmdr_name: impl Into<String>,
        edsm_api_key: Option<String>,
        inara_api_key: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ed-systems-cache/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed building HTTP client for commander lookups")?;
        Ok(Self {
            client,
            cmdr_name: cmdr_name.into(),
            edsm_api_key: non_empty(edsm_api_key),
            inara_api_key: non_empty(inara_api_key),
        })
    }

    pub fn cmdr_name(&self) -> &str {
        &self.cmdr_name
    }

    pub async fn credit_balance(&self) -> Option<i64> {
        let Some(api_key) = self.edsm_api_key.as_deref() else {
            debug!("No EDSM API key configured, skipping credit lookup");
            return None;
        };
        let body = self
            .get_json(
                EDSM_CREDITS_URL,
                &[("commanderName", self.cmdr_name.as_str()), ("apiKey", api_key)],
            )
            .await?;
        parse_credits_response(&body)
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Option<Value> {
        let response = match self.client.get(url).query(query).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(url, "Commander lookup request failed: {err}");
                return None;
            }
        };
        match response.json::<Value>().await {
            Ok(body) => Some(body),
            Err(err) => {
                warn!(url, "Commander lookup returned unreadable body: {err}");
                None
            }
        }
    }
}

impl CommanderLocator for CommanderClient {
    async fn current_system(&self) -> Option<String> {
        let mut query = vec![("commanderName", self.cmdr_name.as_str())];
        if let Some(api_key) = self.edsm_api_key.as_deref() {
            query.push(("apiKey", api_key));
        }
        let body = self.get_json(EDSM_POSITION_URL, &query).await?;
        let system = parse_position_response(&body);
        debug!(system = ?system, "Resolved commander position");
        system
    }

    async fn current_power(&self) -> Option<String> {
        let Some(api_key) = self.inara_api_key.as_deref() else {
            debug!("No Inara API key configured, commander power unknown");
            return None;
        };
        let payload = inara_profile_request(api_key, &self.cmdr_name);
        let response = match self.client.post(INARA_API_URL).json(&payload).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!("Inara profile request failed: {err}");
                return None;
            }
        };
        match response.json::<Value>().await {
            Ok(body) => parse_power_response(&body),
            Err(err) => {
                warn!("Inara returned unreadable body: {err}");
                None
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn edsm_event_message(msgnum: i64) -> Option<&'static str> {
    match msgnum {
        201 => Some("Commander name not found"),
        203 => Some("Invalid API key or commander name"),
        208 => Some("No credit-data available"),
        _ => None,
    }
}

fn edsm_succeeded(body: &Value) -> bool {
    let Some(msgnum) = body.get("msgnum").and_then(Value::as_i64) else {
        warn!("EDSM response without msgnum");
        return false;
    };
    if msgnum == EDSM_SUCCESS {
        return true;
    }
    match edsm_event_message(msgnum) {
        Some(message) => warn!(msgnum, "Unsuccessful EDSM request: {message}"),
        None => {
            let message = body.get("msg").and_then(Value::as_str).unwrap_or("unknown");
            warn!(msgnum, "Unsuccessful EDSM request, undefined event code: {message}");
        }
    }
    false
}

pub fn parse_position_response(body: &Value) -> Option<String> {
    if !edsm_succeeded(body) {
        return None;
    }
    body.get("system")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

pub fn parse_credits_response(body: &Value) -> Option<i64> {
    if !edsm_succeeded(body) {
        return None;
    }
    let credits = body.get("credits")?.get(0)?;
    let balance = credits.get("balance")?.as_i64()?;
    let loan = credits.get("loan").and_then(Value::as_i64).unwrap_or(0);
    Some(balance - loan)
}

pub fn parse_power_response(body: &Value) -> Option<String> {
    let header = body.get("header")?;
    let status = header.get("eventStatus").and_then(Value::as_i64);
    if status != Some(200) {
        let text = header
            .get("eventStatusText")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        warn!(status = ?status, "Inara API error: {text}");
        return None;
    }
    body.get("events")?
        .get(0)?
        .get("eventData")?
        .get("preferredPowerName")?
        .as_str()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

fn inara_profile_request(api_key: &str, cmdr_name: &str) -> Value {
    json!({
        "header": {
            "appName": INARA_APP_NAME,
            "appVersion": env!("CARGO_PKG_VERSION"),
            "isDeveloped": false,
            "APIkey": api_key,
            "commanderName": cmdr_name,
        },
        "events": [{
            "eventName": "getCommanderProfile",
            "eventTimestamp": Utc::now().to_rfc3339(),
            "eventData": { "searchName": cmdr_name },
        }],
    })
}
