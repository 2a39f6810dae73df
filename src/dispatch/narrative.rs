//! Performance narratives for the analysis document.
//!
//! With an LLM configured we ask it for an [`AiAnalysis`] under a strict
//! schema. Without one we derive the same structure from the flow data.

use std::sync::Arc;

use clap::Args;

use crate::{
    drivers::{Driver, LlmOpts, openai::OpenAiDriver},
    exposure::{ExposureResult, StationFlowData, flow::FlowSourceKind},
    io::JsonObject,
    llm_client::create_llm_client,
    prelude::*,
    prompt::ChatPrompt,
    report::{AiAnalysis, AnalysisMetrics, ChartPoint, format_count},
    retry::{
        UpstreamRetryResult, default_jitter, resolved_into_result, retry_result_ok,
        try_fatal, try_retry_result, try_transient,
    },
    schema::strict_json_schema,
};

/// Options for generating narratives.
#[derive(Args, Clone, Debug)]
pub struct NarrativeOpts {
    /// Give up on the AI narrative after this many seconds. The caller can
    /// then retry or send without it.
    #[clap(long, default_value = "180")]
    pub narrative_timeout: u64,

    /// A prompt file (TOML or JSON) to use instead of the built-in one.
    #[clap(long)]
    pub narrative_prompt: Option<PathBuf>,

    #[command(flatten)]
    pub llm_opts: LlmOpts,
}

impl NarrativeOpts {
    /// Pick a generator: the LLM when an API key is configured, otherwise
    /// the offline one.
    pub async fn create_generator(&self) -> Result<Arc<dyn NarrativeGenerator>> {
        let Some(client) = create_llm_client() else {
            info!("No LLM configured, using offline narratives");
            return Ok(Arc::new(OfflineNarrative));
        };
        let prompt = ChatPrompt::load_or_default(self.narrative_prompt.as_deref()).await?;
        let generator = LlmNarrative::new(
            Box::new(OpenAiDriver::new(client)),
            prompt,
            self.llm_opts.clone(),
        )?;
        info!(model = %self.llm_opts.model, "Using LLM narratives");
        Ok(Arc::new(generator))
    }
}

/// What a narrative is about.
#[derive(Clone, Debug)]
pub struct NarrativeRequest {
    pub advertiser_name: String,
    pub station: String,
    pub line: String,
    pub date_str: String,
    pub flow: StationFlowData,
    pub exposure: ExposureResult,
}

impl NarrativeRequest {
    /// Template bindings for prompts.
    fn bindings(&self) -> JsonObject {
        let mut bindings = JsonObject::new();
        bindings.insert("advertiser_name".to_owned(), json!(self.advertiser_name));
        bindings.insert("station".to_owned(), json!(self.station));
        bindings.insert("line".to_owned(), json!(self.line));
        bindings.insert("date_str".to_owned(), json!(self.date_str));
        bindings.insert("daily_total".to_owned(), json!(self.flow.daily_total));
        bindings.insert(
            "flow_source".to_owned(),
            json!(match self.flow.source {
                FlowSourceKind::Api => "공공데이터",
                FlowSourceKind::Mock => "추정치",
            }),
        );
        bindings.insert(
            "data_date".to_owned(),
            json!(self.flow.data_date.as_deref().unwrap_or("-")),
        );
        bindings.insert("display_days".to_owned(), json!(self.exposure.display_days));
        bindings.insert(
            "total_exposure".to_owned(),
            json!(self.exposure.total_exposure),
        );
        bindings.insert("time_bands".to_owned(), json!(self.flow.time_bands));
        bindings
    }
}

/// Something that can write an analysis.
#[async_trait]
pub trait NarrativeGenerator: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Write an analysis. May take a long time.
    async fn generate(&self, request: &NarrativeRequest) -> Result<AiAnalysis>;
}

/// `06-09` → `06:00 - 09:00`.
fn band_to_time_range(band: &str) -> String {
    match band.split_once('-') {
        Some((start, end)) => format!("{start}:00 - {end}:00"),
        None => band.to_owned(),
    }
}

/// Does this band start during the morning or evening rush?
fn is_commute_band(band: &str) -> bool {
    let start = band.split('-').next().and_then(|h| h.parse::<u32>().ok());
    matches!(start, Some(6..=9 | 17..=19))
}

/// Derives an analysis from flow data alone.
#[derive(Debug, Default)]
pub struct OfflineNarrative;

impl OfflineNarrative {
    /// Build the analysis. Deterministic for a given request.
    pub fn analyze(request: &NarrativeRequest) -> AiAnalysis {
        let daily = request.flow.daily_total;
        let score = 60 + (daily / 5_000).min(39) as u32;
        let peak = request.exposure.peak_band();
        let peak_time = peak.map_or_else(
            || "정보 없음".to_owned(),
            |peak| band_to_time_range(&peak.band),
        );
        let commuter_peak = peak.is_some_and(|p| is_commute_band(&p.band));
        let demographic = if commuter_peak {
            "출퇴근 직장인"
        } else {
            "일반 유동인구"
        };
        let chart_data = request
            .flow
            .time_bands
            .iter()
            .map(|band| ChartPoint {
                label: format!("{}시", band.band.split('-').next().unwrap_or(&band.band)),
                value: band.flow as f64,
            })
            .collect::<Vec<_>>();

        let source_note = match request.flow.source {
            FlowSourceKind::Api => "공공데이터포털 역별 승하차 실적",
            FlowSourceKind::Mock => "노선별 평균 유동인구 추정치",
        };
        let mut paragraphs = vec![
            format!(
                "{station}역({line})은 하루 평균 약 {daily}명이 이용하는 역으로, \
                 {advertiser} 광고는 {days}일간 약 {total}회 노출될 것으로 예상됩니다.",
                station = request.station,
                line = request.line,
                daily = format_count(daily),
                advertiser = request.advertiser_name,
                days = request.exposure.display_days,
                total = format_count(request.exposure.total_exposure),
            ),
        ];
        if let Some(peak) = peak {
            paragraphs.push(format!(
                "유동인구는 {time} 시간대에 가장 많으며, 이 시간대에만 약 {exposure}회의 \
                 노출이 예상됩니다. 주요 이용층은 {demographic}입니다.",
                time = band_to_time_range(&peak.band),
                exposure = format_count(peak.exposure),
            ));
        }
        paragraphs.push(format!(
            "본 분석은 {source_note}를 기준으로 산출되었으며, 종합 점수는 {score}점입니다."
        ));

        AiAnalysis {
            analysis_text: paragraphs.join("\n\n"),
            metrics: AnalysisMetrics {
                daily_traffic: daily,
                total_exposure: request.exposure.total_exposure,
                demographic: demographic.to_owned(),
                peak_time,
                score,
            },
            chart_data,
        }
    }
}

#[async_trait]
impl NarrativeGenerator for OfflineNarrative {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn generate(&self, request: &NarrativeRequest) -> Result<AiAnalysis> {
        Ok(Self::analyze(request))
    }
}

/// Asks an LLM for the analysis.
pub struct LlmNarrative {
    driver: Box<dyn Driver>,
    prompt: ChatPrompt,
    llm_opts: LlmOpts,
    /// Strict schema for [`AiAnalysis`].
    schema: Value,
    /// Our JSON Schema validator.
    validator: jsonschema::Validator,
}

impl LlmNarrative {
    /// Create a new LLM narrative generator.
    pub fn new(driver: Box<dyn Driver>, prompt: ChatPrompt, llm_opts: LlmOpts) -> Result<Self> {
        let schema = strict_json_schema::<AiAnalysis>()?;
        let validator = jsonschema::validator_for(&schema)?;
        Ok(Self {
            driver,
            prompt,
            llm_opts,
            schema,
            validator,
        })
    }

    /// A single attempt.
    async fn attempt(&self, messages: &Value) -> UpstreamRetryResult<AiAnalysis> {
        let completion = try_retry_result!(
            self.driver
                .chat_completion(messages, &self.schema, &self.llm_opts)
                .await
        );
        if let Some(usage) = &completion.token_usage {
            debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "LLM token usage"
            );
        }
        let response = completion.response;

        // Schema validation failure is treated as transient, because it may
        // be caused by a dodgy `response_format` implementation.
        try_transient!(
            self.validator
                .validate(&response)
                .map_err(|err| err.to_owned())
                .with_context(|| format!("Failed to validate {}:", response))
        );
        let analysis = try_fatal!(
            serde_json::from_value::<AiAnalysis>(response)
                .context("Failed to parse analysis")
        );
        retry_result_ok(analysis)
    }
}

#[async_trait]
impl NarrativeGenerator for LlmNarrative {
    fn name(&self) -> &'static str {
        "llm"
    }

    #[instrument(level = "debug", skip_all, fields(station = %request.station))]
    async fn generate(&self, request: &NarrativeRequest) -> Result<AiAnalysis> {
        let messages = self.prompt.render_prompt(&request.bindings())?;
        let resolved = self
            .attempt(&messages)
            .await
            .retry_with_async(|_| async { self.attempt(&messages).await })
            .with_exponential_jitter(default_jitter)
            .await;
        resolved_into_result("AI narrative", resolved)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        drivers::{ChatCompletionResponse, LlmRetryResult, TokenUsage},
        exposure::{estimate, flow::mock_flow},
        retry::{retry_result_fatal, retry_result_transient},
    };

    pub(crate) fn request() -> NarrativeRequest {
        let flow = mock_flow("공덕", "5호선");
        let exposure = estimate(&flow, 7, 1.0);
        NarrativeRequest {
            advertiser_name: "SSG".to_owned(),
            station: "공덕".to_owned(),
            line: "5호선".to_owned(),
            date_str: "20240305".to_owned(),
            flow,
            exposure,
        }
    }

    /// A driver that replays canned responses.
    struct ScriptedDriver {
        responses: Mutex<Vec<LlmRetryResult<ChatCompletionResponse>>>,
        calls: AtomicUsize,
    }

    impl std::fmt::Debug for ScriptedDriver {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ScriptedDriver")
                .field("calls", &self.calls)
                .finish_non_exhaustive()
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        async fn chat_completion(
            &self,
            _messages: &Value,
            _schema: &Value,
            _llm_opts: &LlmOpts,
        ) -> LlmRetryResult<ChatCompletionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn completion(response: Value) -> LlmRetryResult<ChatCompletionResponse> {
        retry_result_ok(ChatCompletionResponse {
            response,
            token_usage: Some(TokenUsage::default()),
        })
    }

    fn llm(responses: Vec<LlmRetryResult<ChatCompletionResponse>>) -> LlmNarrative {
        LlmNarrative::new(
            Box::new(ScriptedDriver {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }),
            ChatPrompt::default_narrative().unwrap(),
            LlmOpts {
                model: "test".to_owned(),
                max_completion_tokens: None,
                temperature: None,
                top_p: None,
                llm_request_timeout: None,
            },
        )
        .unwrap()
    }

    fn valid_response() -> Value {
        json!({
            "analysisText": "좋은 위치입니다.",
            "metrics": {
                "dailyTraffic": 90000,
                "totalExposure": 630000,
                "demographic": "직장인",
                "peakTime": "07:00 - 09:00",
                "score": 90
            },
            "chartData": [{ "label": "08시", "value": 25.0 }]
        })
    }

    #[test]
    fn test_offline_narrative() {
        let analysis = OfflineNarrative::analyze(&request());
        // 90,000 / 5,000 = 18.
        assert_eq!(analysis.metrics.score, 78);
        assert_eq!(analysis.metrics.daily_traffic, 90_000);
        assert_eq!(analysis.metrics.total_exposure, 630_000);
        assert_eq!(analysis.metrics.peak_time, "07:00 - 09:00");
        assert_eq!(analysis.metrics.demographic, "출퇴근 직장인");
        assert_eq!(analysis.chart_data.len(), 6);
        assert_eq!(analysis.chart_data[0].label, "07시");
        assert!(analysis.analysis_text.contains("공덕역(5호선)"));
        assert!(analysis.analysis_text.contains("9.0만"));
    }

    #[test]
    fn test_offline_score_is_capped() {
        let mut request = request();
        request.flow.daily_total = 10_000_000;
        assert_eq!(OfflineNarrative::analyze(&request).metrics.score, 99);
    }

    #[test]
    fn test_band_helpers() {
        assert_eq!(band_to_time_range("18-21"), "18:00 - 21:00");
        assert_eq!(band_to_time_range("all"), "all");
        assert!(is_commute_band("06-09"));
        assert!(is_commute_band("17-20"));
        assert!(!is_commute_band("12-14"));
        assert!(!is_commute_band("00-24"));
    }

    #[tokio::test]
    async fn test_llm_narrative_parses_valid_response() {
        let generator = llm(vec![completion(valid_response())]);
        let analysis = generator.generate(&request()).await.unwrap();
        assert_eq!(analysis.metrics.score, 90);
        assert_eq!(analysis.chart_data[0].label, "08시");
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_narrative_retries_invalid_and_transient() {
        let generator = llm(vec![
            completion(json!({ "analysisText": "missing metrics" })),
            retry_result_transient(anyhow!("overloaded")),
            completion(valid_response()),
        ]);
        let analysis = generator.generate(&request()).await.unwrap();
        assert_eq!(analysis.metrics.peak_time, "07:00 - 09:00");
    }

    #[tokio::test]
    async fn test_llm_narrative_fatal_error() {
        let generator = llm(vec![retry_result_fatal(anyhow!("bad key"))]);
        assert!(generator.generate(&request()).await.is_err());
    }
}
