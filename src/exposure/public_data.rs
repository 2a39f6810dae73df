//! Station flow lookups: cache, then the data.go.kr API, then mock data.

use std::{sync::Arc, time::Duration};

use chrono::{Days, Utc};
use clap::Args;

use crate::{
    capture::kst,
    prelude::*,
    retry::{
        IsKnownTransient as _, UpstreamRetryResult, default_jitter, resolved_into_result,
        retry_result_fatal, retry_result_ok, retry_result_transient, try_fatal,
        try_potentially_transient,
    },
};

use super::{
    cache::FlowCache,
    flow::{
        StationFlowData, aggregate, cache_key, line_label, mock_flow, normalize_station_name,
    },
};

/// Options for looking up station foot traffic.
#[derive(Args, Clone, Debug)]
pub struct FlowOpts {
    /// Service key for the data.go.kr station ridership API. Without it, we
    /// use built-in estimates.
    #[clap(long, env = "DATA_GO_KR_SERVICE_KEY", hide_env_values = true)]
    pub data_go_kr_service_key: Option<String>,

    /// The data.go.kr station ridership endpoint.
    #[clap(long, env = "DATA_GO_KR_STATION_FLOW_ENDPOINT")]
    pub data_go_kr_endpoint: Option<String>,

    /// How long to cache station flow data, in seconds.
    #[clap(long, default_value = "3600")]
    pub flow_cache_ttl: u64,
}

impl FlowOpts {
    /// Build a [`StationFlowService`] from these options.
    pub fn into_service(self) -> StationFlowService {
        let source = match (self.data_go_kr_service_key, self.data_go_kr_endpoint) {
            (Some(key), Some(endpoint)) if !key.trim().is_empty() && !endpoint.trim().is_empty() => {
                Some(Arc::new(DataGoKrClient::new(endpoint, key)) as Arc<dyn FlowSource>)
            }
            _ => {
                info!("data.go.kr is not configured, using estimated station flow");
                None
            }
        };
        StationFlowService::new(source, FlowCache::new(Duration::from_secs(self.flow_cache_ttl)))
    }
}

/// An upstream source of real station flow data.
#[async_trait]
pub trait FlowSource: Send + Sync + 'static {
    /// Fetch flow data. `Ok(None)` means the source had no usable records.
    async fn fetch(&self, station: &str, line: &str) -> Result<Option<StationFlowData>>;
}

/// Client for the data.go.kr per-station ridership API.
pub struct DataGoKrClient {
    client: reqwest::Client,
    endpoint: String,
    service_key: String,
}

impl DataGoKrClient {
    /// Create a new client.
    pub fn new(endpoint: String, service_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('?').to_owned(),
            service_key,
        }
    }

    /// A single attempt.
    async fn fetch_once(&self, station: &str, travel_date: &str) -> UpstreamRetryResult<Value> {
        let station = normalize_station_name(station);
        let response = try_potentially_transient!(
            self.client
                .get(&self.endpoint)
                .query(&[
                    ("serviceKey", self.service_key.as_str()),
                    ("type", "json"),
                    ("pageNo", "1"),
                    ("numOfRows", "500"),
                    ("통행일자", travel_date),
                    ("역명", station.as_str()),
                ])
                .timeout(Duration::from_secs(15))
                .send()
                .await
        );
        let status = response.status();
        if !status.is_success() {
            let err = anyhow!("data.go.kr returned {status}");
            return if status.is_known_transient() {
                retry_result_transient(err)
            } else {
                retry_result_fatal(err)
            };
        }
        let body = try_fatal!(
            response
                .json::<Value>()
                .await
                .context("Could not parse data.go.kr response")
        );
        retry_result_ok(body)
    }
}

/// Extract the records from a data.go.kr response body.
///
/// Returns `None` for error result codes and empty responses. The item field
/// may hold a single object or an array.
pub fn parse_items(body: &Value) -> Option<Vec<Value>> {
    let response = body.get("response")?;
    match response.pointer("/header/resultCode").and_then(Value::as_str) {
        None | Some("00") => {}
        Some(code) => {
            warn!(%code, "data.go.kr returned an error result code");
            return None;
        }
    }
    let items = match response.pointer("/body/items/item")? {
        Value::Array(items) => items.clone(),
        Value::Null => vec![],
        item => vec![item.clone()],
    };
    (!items.is_empty()).then_some(items)
}

#[async_trait]
impl FlowSource for DataGoKrClient {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, station: &str, line: &str) -> Result<Option<StationFlowData>> {
        let yesterday = Utc::now()
            .with_timezone(&kst())
            .date_naive()
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| anyhow!("date out of range"))?;
        let travel_date = yesterday.format("%Y%m%d").to_string();

        let resolved = self
            .fetch_once(station, &travel_date)
            .await
            .retry_with_async(|_| async { self.fetch_once(station, &travel_date).await })
            .with_exponential_jitter(default_jitter)
            .await;
        let body = resolved_into_result("data.go.kr station flow", resolved)?;

        Ok(parse_items(&body).map(|items| {
            aggregate(
                &items,
                station,
                &line_label(line),
                &yesterday.format("%Y-%m-%d").to_string(),
            )
        }))
    }
}

/// Cached station flow lookups that never fail.
pub struct StationFlowService {
    source: Option<Arc<dyn FlowSource>>,
    cache: FlowCache,
}

impl StationFlowService {
    /// Create a service. With no source, every lookup uses mock data.
    pub fn new(source: Option<Arc<dyn FlowSource>>, cache: FlowCache) -> Self {
        Self { source, cache }
    }

    /// Look up flow data for a station: cache, then upstream, then mock.
    #[instrument(level = "debug", skip(self))]
    pub async fn fetch_station_flow(&self, station: &str, line: &str) -> StationFlowData {
        let key = cache_key(station, line);
        if let Some(data) = self.cache.get(&key) {
            trace!(%key, "Station flow cache hit");
            return data;
        }

        let upstream = match &self.source {
            Some(source) => match source.fetch(station, line).await {
                Ok(Some(data)) => Some(data),
                Ok(None) => {
                    warn!(%key, "No station flow records, using estimate");
                    None
                }
                Err(err) => {
                    warn!(%key, "Station flow lookup failed, using estimate: {err:#}");
                    None
                }
            },
            None => None,
        };
        let data = upstream.unwrap_or_else(|| mock_flow(station, line));
        self.cache.insert(key, data.clone());
        data
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::exposure::flow::FlowSourceKind;

    struct CountingSource {
        result: fn() -> Result<Option<StationFlowData>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FlowSource for CountingSource {
        async fn fetch(&self, _station: &str, _line: &str) -> Result<Option<StationFlowData>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn counting_service(result: fn() -> Result<Option<StationFlowData>>) -> (StationFlowService, Arc<CountingSource>) {
        let source = Arc::new(CountingSource {
            result,
            calls: AtomicUsize::new(0),
        });
        let service = StationFlowService::new(Some(source.clone()), FlowCache::default());
        (service, source)
    }

    #[test]
    fn test_parse_items() {
        let single = json!({
            "response": {
                "header": { "resultCode": "00" },
                "body": { "items": { "item": { "역명": "공덕", "승차인원": 10 } } }
            }
        });
        assert_eq!(parse_items(&single).unwrap().len(), 1);

        let array = json!({
            "response": { "body": { "items": { "item": [{}, {}] } } }
        });
        assert_eq!(parse_items(&array).unwrap().len(), 2);

        let error = json!({
            "response": {
                "header": { "resultCode": "30" },
                "body": { "items": { "item": [{}] } }
            }
        });
        assert!(parse_items(&error).is_none());

        let empty = json!({ "response": { "body": { "items": { "item": [] } } } });
        assert!(parse_items(&empty).is_none());
        assert!(parse_items(&json!({})).is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_uses_mock() {
        let service = StationFlowService::new(None, FlowCache::default());
        let data = service.fetch_station_flow("공덕", "5호선").await;
        assert_eq!(data.source, FlowSourceKind::Mock);
        assert_eq!(data.daily_total, 90_000);
    }

    #[tokio::test]
    async fn test_upstream_error_falls_back_and_caches() {
        let (service, source) = counting_service(|| Err(anyhow!("boom")));
        let first = service.fetch_station_flow("공덕 (마포)", "5호선").await;
        let second = service.fetch_station_flow("공덕", "5").await;
        assert_eq!(first.source, FlowSourceKind::Mock);
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upstream_data_is_used() {
        let (service, _source) = counting_service(|| {
            Ok(Some(aggregate(
                &[json!({ "통행시간": "08", "승하차인원": 1234 })],
                "공덕",
                "5호선",
                "2024-03-04",
            )))
        });
        let data = service.fetch_station_flow("공덕", "5호선").await;
        assert_eq!(data.source, FlowSourceKind::Api);
        assert_eq!(data.daily_total, 1234);

        let (service, _source) = counting_service(|| Ok(None));
        let data = service.fetch_station_flow("공덕", "5호선").await;
        assert_eq!(data.source, FlowSourceKind::Mock);
    }
}
