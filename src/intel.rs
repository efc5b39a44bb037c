//! Tools for querying the Falcon threat intelligence service.
//!
//! Every handler resolves to a `String`: a 2-space-indented JSON payload on
//! success, a per-tool "not found" sentence for empty result sets, or an
//! error message. Nothing here panics or propagates an error to the caller.

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::error;

use crate::falcon::IntelQueries;
use crate::filter::{exact, IndicatorFilter};
use crate::format::normalize;

pub const ACTORS_READ_SCOPE: &str = "ACTORS (FALCON INTELLIGENCE) READ";
pub const IOC_READ_SCOPE: &str = "INDICATORS (FALCON INTELLIGENCE) READ";

/// List threat actors tracked by CrowdStrike.
pub async fn list_threat_actors(intel: &dyn IntelQueries, limit: i64) -> String {
    match intel.query_actor_entities(None, Some(limit)).await {
        Ok(response) => {
            if response.status_code != 200 {
                return normalize(&response, Some(ACTORS_READ_SCOPE)).into_text();
            }

            let actors = resources(&response.body);
            if actors.is_empty() {
                return "No threat actors found".to_string();
            }

            pretty(json!({ "actors": actors }))
        }
        Err(err) => {
            error!(error = %err, "Error listing threat actors");
            format!("Error: {err}")
        }
    }
}

/// Look up one actor by exact name; the first match wins.
pub async fn get_actor_details(intel: &dyn IntelQueries, actor_name: &str) -> String {
    let filter = exact("name", actor_name);
    match intel.query_actor_entities(Some(&filter), None).await {
        Ok(response) => {
            if response.status_code != 200 {
                return normalize(&response, Some(ACTORS_READ_SCOPE)).into_text();
            }

            let actors = resources(&response.body);
            let Some(actor) = actors.first() else {
                return "No actor details found".to_string();
            };

            pretty(json!({ "actor": actor }))
        }
        Err(err) => {
            error!(error = %err, actor_name, "Error getting actor details");
            format!("Error: {err}")
        }
    }
}

/// Search indicators with any combination of the optional criteria.
pub async fn search_iocs(
    intel: &dyn IntelQueries,
    criteria: &IndicatorFilter,
    limit: i64,
) -> String {
    let filter = criteria.build();
    match intel
        .query_indicator_entities(filter.as_deref(), Some(limit), None)
        .await
    {
        Ok(response) => {
            if response.status_code != 200 {
                return normalize(&response, Some(IOC_READ_SCOPE)).into_text();
            }

            let iocs = resources(&response.body);
            if iocs.is_empty() {
                return "No IOCs found matching the criteria".to_string();
            }

            pretty(json!({ "iocs": iocs }))
        }
        Err(err) => {
            error!(error = %err, "Error searching IOCs");
            format!("Error: {err}")
        }
    }
}

/// Full detail for one indicator, reduced to a fixed field subset.
pub async fn get_ioc_details(intel: &dyn IntelQueries, indicator_value: &str) -> String {
    let filter = exact("indicator", indicator_value);
    match intel
        .query_indicator_entities(Some(&filter), None, None)
        .await
    {
        Ok(response) => {
            if response.status_code != 200 {
                return normalize(&response, Some(IOC_READ_SCOPE)).into_text();
            }

            let iocs = resources(&response.body);
            let Some(ioc) = iocs.first() else {
                return format!("No IOC found for indicator: {indicator_value}");
            };

            pretty(json!({ "ioc_details": ioc_details(ioc) }))
        }
        Err(err) => {
            error!(error = %err, indicator_value, "Error getting IOC details");
            format!("Error: {err}")
        }
    }
}

/// Indicators associated with one actor, grouped by indicator type.
pub async fn get_actor_iocs(intel: &dyn IntelQueries, actor_name: &str, limit: i64) -> String {
    let filter = exact("actors", actor_name);
    match intel
        .query_indicator_entities(Some(&filter), Some(limit), None)
        .await
    {
        Ok(response) => {
            if response.status_code != 200 {
                return normalize(&response, Some(IOC_READ_SCOPE)).into_text();
            }

            let iocs = resources(&response.body);
            if iocs.is_empty() {
                return format!("No IOCs found for threat actor: {actor_name}");
            }

            let mut by_type: Map<String, Value> = Map::new();
            for ioc in &iocs {
                let ioc_type = ioc
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let entry = by_type.entry(ioc_type).or_insert_with(|| json!([]));
                if let Some(list) = entry.as_array_mut() {
                    list.push(json!({
                        "indicator": ioc.get("indicator"),
                        "malicious_confidence": ioc.get("malicious_confidence"),
                        "malware_families": list_field(ioc, "malware_families"),
                    }));
                }
            }

            pretty(json!({
                "actor": actor_name,
                "total_iocs": iocs.len(),
                "iocs_by_type": by_type,
            }))
        }
        Err(err) => {
            error!(error = %err, actor_name, "Error getting actor IOCs");
            format!("Error: {err}")
        }
    }
}

/// Indicators published in the last `days` days, newest first.
pub async fn get_recent_iocs(intel: &dyn IntelQueries, days: i64, limit: i64) -> String {
    let threshold = Duration::try_days(days)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or_else(Utc::now);
    let criteria = IndicatorFilter {
        published_after: Some(threshold.format("%Y-%m-%d").to_string()),
        ..IndicatorFilter::default()
    };
    let filter = criteria.build();

    match intel
        .query_indicator_entities(filter.as_deref(), Some(limit), Some("published_date.desc"))
        .await
    {
        Ok(response) => {
            if response.status_code != 200 {
                return normalize(&response, Some(IOC_READ_SCOPE)).into_text();
            }

            let iocs = resources(&response.body);
            if iocs.is_empty() {
                return format!("No IOCs published in the last {days} days");
            }

            let recent: Vec<Value> = iocs
                .iter()
                .map(|ioc| {
                    json!({
                        "indicator": ioc.get("indicator"),
                        "type": ioc.get("type"),
                        "published_date": ioc.get("published_date"),
                        "malicious_confidence": ioc.get("malicious_confidence"),
                        "malware_families": list_field(ioc, "malware_families"),
                        "threat_types": list_field(ioc, "threat_types"),
                    })
                })
                .collect();

            pretty(json!({
                "time_period": format!("Last {days} days"),
                "total_found": recent.len(),
                "recent_iocs": recent,
            }))
        }
        Err(err) => {
            error!(error = %err, days, "Error getting recent IOCs");
            format!("Error: {err}")
        }
    }
}

fn resources(body: &Value) -> Vec<Value> {
    body.get("resources")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn pretty(payload: Value) -> String {
    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string())
}

/// Fixed field subset for one indicator. Label names under the `MitreATTCK/`
/// namespace are copied verbatim, prefix included.
fn ioc_details(ioc: &Value) -> Value {
    json!({
        "indicator": ioc.get("indicator"),
        "type": ioc.get("type"),
        "malicious_confidence": ioc.get("malicious_confidence"),
        "published_date": ioc.get("published_date"),
        "last_updated": ioc.get("last_updated"),
        "malware_families": list_field(ioc, "malware_families"),
        "threat_types": list_field(ioc, "threat_types"),
        "actors": list_field(ioc, "actors"),
        "mitre_techniques": mitre_techniques(ioc),
        "reports": list_field(ioc, "reports"),
        "relations": list_field(ioc, "relations"),
    })
}

fn list_field(record: &Value, field: &str) -> Value {
    record.get(field).cloned().unwrap_or_else(|| json!([]))
}

fn mitre_techniques(ioc: &Value) -> Vec<String> {
    ioc.get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|label| label.get("name").and_then(Value::as_str))
                .filter(|name| name.starts_with("MitreATTCK/"))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::falcon::{ApiResponse, FalconError, IntelQueries};

    #[derive(Debug)]
    struct RecordedQuery {
        filter: Option<String>,
        limit: Option<i64>,
        sort: Option<String>,
    }

    struct StubIntel {
        reply: Option<ApiResponse>,
        calls: Mutex<Vec<RecordedQuery>>,
    }

    impl StubIntel {
        fn replying(status_code: u16, body: Value) -> Self {
            Self {
                reply: Some(ApiResponse { status_code, body }),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(
            &self,
            filter: Option<&str>,
            limit: Option<i64>,
            sort: Option<&str>,
        ) -> Result<ApiResponse, FalconError> {
            self.calls.lock().unwrap().push(RecordedQuery {
                filter: filter.map(ToString::to_string),
                limit,
                sort: sort.map(ToString::to_string),
            });
            match &self.reply {
                Some(response) => Ok(response.clone()),
                None => Err(FalconError::Transport("connection refused".to_string())),
            }
        }

        fn last_call(&self) -> RecordedQuery {
            self.calls.lock().unwrap().pop().expect("no query recorded")
        }
    }

    #[async_trait]
    impl IntelQueries for StubIntel {
        async fn query_actor_entities(
            &self,
            filter: Option<&str>,
            limit: Option<i64>,
        ) -> Result<ApiResponse, FalconError> {
            self.record(filter, limit, None)
        }

        async fn query_indicator_entities(
            &self,
            filter: Option<&str>,
            limit: Option<i64>,
            sort: Option<&str>,
        ) -> Result<ApiResponse, FalconError> {
            self.record(filter, limit, sort)
        }
    }

    fn with_resources(resources: Value) -> Value {
        json!({ "resources": resources, "errors": [] })
    }

    #[tokio::test]
    async fn list_threat_actors_shapes_payload() {
        let stub = StubIntel::replying(
            200,
            with_resources(json!([
                {"id": "actor-1", "name": "FANCY BEAR"},
                {"id": "actor-2", "name": "COZY BEAR"},
            ])),
        );

        let text = list_threat_actors(&stub, 3).await;
        let payload: Value = serde_json::from_str(&text).expect("json payload");
        assert_eq!(payload["actors"].as_array().unwrap().len(), 2);
        assert_eq!(stub.last_call().limit, Some(3));
    }

    #[tokio::test]
    async fn list_threat_actors_empty_reads_as_sentence() {
        let stub = StubIntel::replying(200, with_resources(json!([])));
        assert_eq!(list_threat_actors(&stub, 10).await, "No threat actors found");
    }

    #[tokio::test]
    async fn actor_details_filters_by_exact_name_and_takes_first_match() {
        let stub = StubIntel::replying(
            200,
            with_resources(json!([
                {"id": "actor-1", "name": "FANCY BEAR"},
                {"id": "actor-9", "name": "FANCY BEAR"},
            ])),
        );

        let text = get_actor_details(&stub, "FANCY BEAR").await;
        let payload: Value = serde_json::from_str(&text).expect("json payload");
        assert_eq!(payload["actor"]["id"], "actor-1");
        assert_eq!(stub.last_call().filter.as_deref(), Some("name:'FANCY BEAR'"));
    }

    #[tokio::test]
    async fn actor_details_not_found() {
        let stub = StubIntel::replying(200, with_resources(json!([])));
        assert_eq!(
            get_actor_details(&stub, "NO_SUCH_ACTOR").await,
            "No actor details found"
        );
    }

    #[tokio::test]
    async fn search_iocs_passes_filter_and_limit() {
        let stub = StubIntel::replying(
            200,
            with_resources(json!([
                {"indicator": "aaa", "type": "hash_sha256"},
                {"indicator": "bbb", "type": "hash_sha256"},
            ])),
        );
        let criteria = IndicatorFilter {
            indicator_type: Some("hash_sha256".to_string()),
            ..IndicatorFilter::default()
        };

        let text = search_iocs(&stub, &criteria, 5).await;
        let payload: Value = serde_json::from_str(&text).expect("json payload");
        assert_eq!(payload["iocs"].as_array().unwrap().len(), 2);

        let call = stub.last_call();
        assert_eq!(call.filter.as_deref(), Some("type:'hash_sha256'"));
        assert_eq!(call.limit, Some(5));
    }

    #[tokio::test]
    async fn search_iocs_without_criteria_sends_no_filter() {
        let stub = StubIntel::replying(200, with_resources(json!([])));
        let text = search_iocs(&stub, &IndicatorFilter::default(), 10).await;
        assert_eq!(text, "No IOCs found matching the criteria");
        assert_eq!(stub.last_call().filter, None);
    }

    #[tokio::test]
    async fn ioc_details_not_found_names_the_indicator() {
        let stub = StubIntel::replying(200, with_resources(json!([])));
        assert_eq!(
            get_ioc_details(&stub, "1.2.3.4").await,
            "No IOC found for indicator: 1.2.3.4"
        );
    }

    #[tokio::test]
    async fn ioc_details_extracts_mitre_labels_verbatim() {
        let stub = StubIntel::replying(
            200,
            with_resources(json!([{
                "indicator": "evil.example.com",
                "type": "domain",
                "malicious_confidence": "high",
                "labels": [
                    {"name": "MitreATTCK/T1566"},
                    {"name": "Malware/njRAT"},
                    {"name": "MitreATTCK/T1059"},
                    {"created_on": 1700000000}
                ]
            }])),
        );

        let text = get_ioc_details(&stub, "evil.example.com").await;
        let payload: Value = serde_json::from_str(&text).expect("json payload");
        let details = &payload["ioc_details"];
        assert_eq!(
            details["mitre_techniques"],
            json!(["MitreATTCK/T1566", "MitreATTCK/T1059"])
        );
        // absent list fields default to empty, absent scalars to null
        assert_eq!(details["malware_families"], json!([]));
        assert_eq!(details["published_date"], Value::Null);
    }

    #[tokio::test]
    async fn actor_iocs_group_by_indicator_type() {
        let stub = StubIntel::replying(
            200,
            with_resources(json!([
                {"indicator": "bad.example.com", "type": "domain", "malicious_confidence": "high"},
                {"indicator": "d41d8cd98f00b204e9800998ecf8427e", "type": "hash_md5"},
                {"indicator": "worse.example.com", "type": "domain"},
            ])),
        );

        let text = get_actor_iocs(&stub, "FANCYBEAR", 20).await;
        let payload: Value = serde_json::from_str(&text).expect("json payload");
        assert_eq!(payload["actor"], "FANCYBEAR");
        assert_eq!(payload["total_iocs"], 3);

        let by_type = payload["iocs_by_type"].as_object().unwrap();
        let mut keys: Vec<&str> = by_type.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["domain", "hash_md5"]);
        assert_eq!(by_type["domain"].as_array().unwrap().len(), 2);
        assert_eq!(
            stub.last_call().filter.as_deref(),
            Some("actors:'FANCYBEAR'")
        );
    }

    #[tokio::test]
    async fn actor_iocs_empty_names_the_actor() {
        let stub = StubIntel::replying(200, with_resources(json!([])));
        assert_eq!(
            get_actor_iocs(&stub, "GHOST", 20).await,
            "No IOCs found for threat actor: GHOST"
        );
    }

    #[tokio::test]
    async fn recent_iocs_filter_sorts_newest_first() {
        let stub = StubIntel::replying(
            200,
            with_resources(json!([{
                "indicator": "fresh.example.com",
                "type": "domain",
                "published_date": 1700000000,
            }])),
        );

        let text = get_recent_iocs(&stub, 7, 20).await;
        let payload: Value = serde_json::from_str(&text).expect("json payload");
        assert_eq!(payload["time_period"], "Last 7 days");
        assert_eq!(payload["total_found"], 1);
        assert_eq!(
            payload["recent_iocs"][0]["indicator"],
            "fresh.example.com"
        );

        let call = stub.last_call();
        assert_eq!(call.sort.as_deref(), Some("published_date.desc"));
        assert!(call.filter.unwrap().starts_with("published_date:>'"));
    }

    #[tokio::test]
    async fn recent_iocs_empty_names_the_window() {
        let stub = StubIntel::replying(200, with_resources(json!([])));
        assert_eq!(
            get_recent_iocs(&stub, 3, 20).await,
            "No IOCs published in the last 3 days"
        );
    }

    #[tokio::test]
    async fn client_failure_becomes_error_string() {
        let stub = StubIntel::failing();
        assert!(list_threat_actors(&stub, 10).await.starts_with("Error: "));
        assert!(get_actor_details(&stub, "FANCY BEAR")
            .await
            .starts_with("Error: "));
        assert!(search_iocs(&stub, &IndicatorFilter::default(), 10)
            .await
            .starts_with("Error: "));
        assert!(get_recent_iocs(&stub, 7, 20).await.starts_with("Error: "));
    }

    #[tokio::test]
    async fn scope_guidance_passes_through_from_the_normalizer() {
        let stub = StubIntel::replying(
            403,
            json!({"errors": [{"message": "access denied: insufficient scope"}]}),
        );

        let text = search_iocs(&stub, &IndicatorFilter::default(), 10).await;
        assert!(text.contains("API Access Denied (403)"));
        assert!(text.contains(IOC_READ_SCOPE));
    }

    #[tokio::test]
    async fn upstream_error_passes_through_as_api_error() {
        let stub = StubIntel::replying(400, json!({"errors": [{"message": "invalid limit"}]}));
        let text = list_threat_actors(&stub, -999).await;
        assert!(text.starts_with("API Error: 400"));
    }
}
