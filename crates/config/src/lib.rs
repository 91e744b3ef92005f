//! Configuration loading, validation, and management for AgentPilot.
//!
//! Loads configuration from `~/.agentpilot/config.toml` with environment
//! variable overrides. Every load is validated; invalid values are rejected,
//! never silently corrected. A run reads the configuration once at start and
//! treats it as immutable until it finishes.

use agentpilot_core::{StepType, Tier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Tolerance for "sums to 1.0" checks on weight tables.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Upper bound for run deadlines, step timeouts and schedule intervals (one year).
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// The root configuration structure.
///
/// Maps directly to `~/.agentpilot/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// API key for the model provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model provider connection
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Tier → model id mapping
    #[serde(default)]
    pub models: ModelsConfig,

    /// Tier boundaries and strategy weights
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Complexity factor thresholds and weight tables
    #[serde(default)]
    pub complexity: ComplexityConfig,

    /// Token budgets
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Step/time limits, loop detection, retry and circuit breaking
    #[serde(default)]
    pub guardrails: GuardrailsConfig,

    /// Learning loop parameters
    #[serde(default)]
    pub learning: LearningConfig,

    /// Memory/persistence backend
    #[serde(default)]
    pub memory: MemoryConfig,

    /// External operations available to `api_call` steps
    #[serde(default)]
    pub api: ApiConfig,

    /// Custom model pricing overrides (model name → pricing)
    #[serde(default)]
    pub pricing: HashMap<String, PricingOverrideConfig>,

    /// Interval-triggered workflow runs
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("api_key", &redact(&self.api_key))
            .field("provider", &self.provider)
            .field("models", &self.models)
            .field("routing", &self.routing)
            .field("complexity", &self.complexity)
            .field("budget", &self.budget)
            .field("guardrails", &self.guardrails)
            .field("learning", &self.learning)
            .field("memory", &self.memory)
            .field("api", &self.api)
            .field("pricing", &self.pricing)
            .field("schedules", &self.schedules)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

// ── Provider ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider name, used in logs and traces
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// OpenAI-compatible base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// HTTP timeout for one model call
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_provider_name() -> String {
    "openai".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_provider_timeout() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.2
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_base_url(),
            timeout_secs: default_provider_timeout(),
            temperature: default_temperature(),
        }
    }
}

// ── Models ──────────────────────────────────────────────────────────────────

/// One indirection between tier and model, so model choice can change
/// without touching routing logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_fast_model")]
    pub fast: String,

    #[serde(default = "default_balanced_model")]
    pub balanced: String,

    #[serde(default = "default_powerful_model")]
    pub powerful: String,
}

fn default_fast_model() -> String {
    "gpt-4o-mini".into()
}
fn default_balanced_model() -> String {
    "gpt-4o".into()
}
fn default_powerful_model() -> String {
    "o1".into()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            fast: default_fast_model(),
            balanced: default_balanced_model(),
            powerful: default_powerful_model(),
        }
    }
}

impl ModelsConfig {
    pub fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Balanced => &self.balanced,
            Tier::Powerful => &self.powerful,
        }
    }
}

// ── Routing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// `effective < fast_max` → fast
    #[serde(default = "default_fast_max")]
    pub fast_max: f64,

    /// `effective > balanced_max` → powerful
    #[serde(default = "default_balanced_max")]
    pub balanced_max: f64,

    /// Weight of the agent intensity score in the effective complexity
    #[serde(default = "default_ais_weight")]
    pub ais_weight: f64,

    /// Weight of the per-step TCA score in the effective complexity
    #[serde(default = "default_step_weight")]
    pub step_weight: f64,

    /// A pattern needs at least this many observations to override
    #[serde(default = "default_memory_min_executions")]
    pub memory_min_executions: u64,

    /// ...and a success rate strictly above this
    #[serde(default = "default_memory_min_success_rate")]
    pub memory_min_success_rate: f64,

    /// Agent score used when a workflow declares none
    #[serde(default = "default_agent_score")]
    pub default_agent_score: f64,
}

fn default_fast_max() -> f64 {
    3.0
}
fn default_balanced_max() -> f64 {
    6.5
}
fn default_ais_weight() -> f64 {
    0.6
}
fn default_step_weight() -> f64 {
    0.4
}
fn default_memory_min_executions() -> u64 {
    10
}
fn default_memory_min_success_rate() -> f64 {
    0.7
}
fn default_agent_score() -> f64 {
    5.0
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fast_max: default_fast_max(),
            balanced_max: default_balanced_max(),
            ais_weight: default_ais_weight(),
            step_weight: default_step_weight(),
            memory_min_executions: default_memory_min_executions(),
            memory_min_success_rate: default_memory_min_success_rate(),
            default_agent_score: default_agent_score(),
        }
    }
}

// ── Complexity ──────────────────────────────────────────────────────────────

/// Low/medium/high breakpoints for one factor's raw measure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Thresholds {
    pub const fn new(low: f64, medium: f64, high: f64) -> Self {
        Self { low, medium, high }
    }

    fn is_increasing(&self) -> bool {
        0.0 < self.low && self.low < self.medium && self.medium < self.high
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorThresholds {
    /// Estimated tokens of prompt/instruction/expression text
    #[serde(default = "default_prompt_thresholds")]
    pub prompt_length: Thresholds,

    /// Bytes of serialized resolved inputs
    #[serde(default = "default_data_thresholds")]
    pub data_size: Thresholds,

    /// Reasoning keyword hits
    #[serde(default = "default_reasoning_thresholds")]
    pub reasoning_depth: Thresholds,

    #[serde(default = "default_small_count_thresholds")]
    pub condition_count: Thresholds,

    #[serde(default = "default_small_count_thresholds")]
    pub context_depth: Thresholds,

    #[serde(default = "default_small_count_thresholds")]
    pub output_complexity: Thresholds,
}

fn default_prompt_thresholds() -> Thresholds {
    Thresholds::new(200.0, 500.0, 1000.0)
}
fn default_data_thresholds() -> Thresholds {
    Thresholds::new(1024.0, 10_240.0, 102_400.0)
}
fn default_reasoning_thresholds() -> Thresholds {
    Thresholds::new(1.0, 3.0, 5.0)
}
fn default_small_count_thresholds() -> Thresholds {
    Thresholds::new(1.0, 3.0, 6.0)
}

impl Default for FactorThresholds {
    fn default() -> Self {
        Self {
            prompt_length: default_prompt_thresholds(),
            data_size: default_data_thresholds(),
            reasoning_depth: default_reasoning_thresholds(),
            condition_count: default_small_count_thresholds(),
            context_depth: default_small_count_thresholds(),
            output_complexity: default_small_count_thresholds(),
        }
    }
}

impl FactorThresholds {
    fn named(&self) -> [(&'static str, &Thresholds); 6] {
        [
            ("prompt_length", &self.prompt_length),
            ("data_size", &self.data_size),
            ("reasoning_depth", &self.reasoning_depth),
            ("condition_count", &self.condition_count),
            ("context_depth", &self.context_depth),
            ("output_complexity", &self.output_complexity),
        ]
    }
}

/// Per-factor weights; must sum to 1.0 ± 0.01.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightTable {
    pub prompt_length: f64,
    pub data_size: f64,
    pub reasoning_depth: f64,
    pub condition_count: f64,
    pub context_depth: f64,
    pub output_complexity: f64,
}

impl WeightTable {
    /// Weights in canonical factor order.
    pub fn as_array(&self) -> [f64; 6] {
        [
            self.prompt_length,
            self.data_size,
            self.reasoning_depth,
            self.condition_count,
            self.context_depth,
            self.output_complexity,
        ]
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }
}

fn default_weights() -> WeightTable {
    WeightTable {
        prompt_length: 0.20,
        data_size: 0.15,
        reasoning_depth: 0.25,
        condition_count: 0.15,
        context_depth: 0.15,
        output_complexity: 0.10,
    }
}
fn default_llm_weights() -> WeightTable {
    WeightTable {
        prompt_length: 0.25,
        data_size: 0.10,
        reasoning_depth: 0.30,
        condition_count: 0.10,
        context_depth: 0.15,
        output_complexity: 0.10,
    }
}
fn default_transform_weights() -> WeightTable {
    WeightTable {
        prompt_length: 0.15,
        data_size: 0.30,
        reasoning_depth: 0.10,
        condition_count: 0.05,
        context_depth: 0.20,
        output_complexity: 0.20,
    }
}
fn default_conditional_weights() -> WeightTable {
    WeightTable {
        prompt_length: 0.10,
        data_size: 0.10,
        reasoning_depth: 0.10,
        condition_count: 0.50,
        context_depth: 0.15,
        output_complexity: 0.05,
    }
}
fn default_api_weights() -> WeightTable {
    WeightTable {
        prompt_length: 0.05,
        data_size: 0.35,
        reasoning_depth: 0.05,
        condition_count: 0.05,
        context_depth: 0.25,
        output_complexity: 0.25,
    }
}

/// Distinct weight tables per step type plus a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightTables {
    #[serde(default = "default_weights")]
    pub default: WeightTable,

    #[serde(default = "default_llm_weights")]
    pub llm_decision: WeightTable,

    #[serde(default = "default_transform_weights")]
    pub transform: WeightTable,

    #[serde(default = "default_conditional_weights")]
    pub conditional: WeightTable,

    #[serde(default = "default_api_weights")]
    pub api_call: WeightTable,
}

impl Default for WeightTables {
    fn default() -> Self {
        Self {
            default: default_weights(),
            llm_decision: default_llm_weights(),
            transform: default_transform_weights(),
            conditional: default_conditional_weights(),
            api_call: default_api_weights(),
        }
    }
}

impl WeightTables {
    pub fn for_step(&self, step_type: StepType) -> &WeightTable {
        match step_type {
            StepType::LlmDecision => &self.llm_decision,
            StepType::Transform => &self.transform,
            StepType::Conditional => &self.conditional,
            StepType::ApiCall => &self.api_call,
        }
    }

    fn named(&self) -> [(&'static str, &WeightTable); 5] {
        [
            ("default", &self.default),
            ("llm_decision", &self.llm_decision),
            ("transform", &self.transform),
            ("conditional", &self.conditional),
            ("api_call", &self.api_call),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityConfig {
    #[serde(default)]
    pub thresholds: FactorThresholds,

    #[serde(default)]
    pub weights: WeightTables,

    /// Words that signal multi-step reasoning in a prompt
    #[serde(default = "default_reasoning_keywords")]
    pub reasoning_keywords: Vec<String>,
}

fn default_reasoning_keywords() -> Vec<String> {
    [
        "analyze", "analyse", "compare", "evaluate", "explain", "why", "reason", "infer", "deduce",
        "plan", "decide", "justify", "assess", "step by step", "trade-off", "prioritize",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            thresholds: FactorThresholds::default(),
            weights: WeightTables::default(),
            reasoning_keywords: default_reasoning_keywords(),
        }
    }
}

// ── Budget ──────────────────────────────────────────────────────────────────

/// How per-step token allotments are derived.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Every step gets the same share
    Equal,
    /// Critical steps get `critical_step_multiplier` times the base allotment
    #[default]
    Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_max_tokens_per_iteration")]
    pub max_tokens_per_iteration: u64,

    #[serde(default = "default_max_total_execution_tokens")]
    pub max_total_execution_tokens: u64,

    #[serde(default = "default_true")]
    pub budget_overage_allowed: bool,

    /// 1.2 means a step may use up to 120% of its allotment
    #[serde(default = "default_overage_threshold")]
    pub overage_threshold: f64,

    #[serde(default = "default_critical_step_multiplier")]
    pub critical_step_multiplier: f64,

    #[serde(default)]
    pub allocation_strategy: AllocationStrategy,

    /// Total-token caps per workflow intent (e.g. "finance" = 20000)
    #[serde(default)]
    pub intent_budgets: HashMap<String, u64>,

    /// Output tokens requested from the model when a step sets none
    #[serde(default = "default_max_output_tokens")]
    pub default_max_output_tokens: u32,
}

fn default_max_tokens_per_iteration() -> u64 {
    4000
}
fn default_max_total_execution_tokens() -> u64 {
    100_000
}
fn default_overage_threshold() -> f64 {
    1.2
}
fn default_critical_step_multiplier() -> f64 {
    1.5
}
fn default_max_output_tokens() -> u32 {
    1024
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_iteration: default_max_tokens_per_iteration(),
            max_total_execution_tokens: default_max_total_execution_tokens(),
            budget_overage_allowed: true,
            overage_threshold: default_overage_threshold(),
            critical_step_multiplier: default_critical_step_multiplier(),
            allocation_strategy: AllocationStrategy::default(),
            intent_budgets: HashMap::new(),
            default_max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl BudgetConfig {
    /// The total-token cap for a run with the given intent.
    pub fn total_budget_for(&self, intent: Option<&str>) -> u64 {
        intent
            .and_then(|i| self.intent_budgets.get(i))
            .map(|cap| (*cap).min(self.max_total_execution_tokens))
            .unwrap_or(self.max_total_execution_tokens)
    }
}

// ── Guardrails ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Maximum step executions per run (branch revisits count)
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    #[serde(default = "default_max_execution_time")]
    pub max_execution_time_secs: u64,

    /// Timeout for one model/API invocation
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,

    #[serde(default = "default_loop_window")]
    pub loop_detection_window: usize,

    #[serde(default = "default_max_same_tool_repeats")]
    pub max_same_tool_repeats: usize,

    #[serde(default = "default_true")]
    pub retry_enabled: bool,

    #[serde(default = "default_retry_count")]
    pub default_retry_count: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Consecutive failed steps before the run stops
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default)]
    pub continue_on_error: bool,

    /// 1 = strictly sequential
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
}

fn default_max_steps() -> usize {
    50
}
fn default_max_execution_time() -> u64 {
    300
}
fn default_step_timeout() -> u64 {
    60
}
fn default_loop_window() -> usize {
    3
}
fn default_max_same_tool_repeats() -> usize {
    3
}
fn default_retry_count() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    500
}
fn default_retry_max_delay() -> u64 {
    30_000
}
fn default_circuit_breaker_threshold() -> u32 {
    5
}
fn default_max_parallel_steps() -> usize {
    1
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_execution_time_secs: default_max_execution_time(),
            step_timeout_secs: default_step_timeout(),
            loop_detection_window: default_loop_window(),
            max_same_tool_repeats: default_max_same_tool_repeats(),
            retry_enabled: true,
            default_retry_count: default_retry_count(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            continue_on_error: false,
            max_parallel_steps: default_max_parallel_steps(),
        }
    }
}

// ── Learning ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// EMA smoothing factor α, in (0, 1]
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,

    /// Observations needed for full confidence
    #[serde(default = "default_confidence_volume")]
    pub confidence_volume: u64,

    /// Ignore an observation id that was already applied
    #[serde(default = "default_true")]
    pub replay_protection: bool,

    #[serde(default = "default_sweep_min_importance")]
    pub sweep_min_importance: f64,

    #[serde(default = "default_sweep_max_idle_days")]
    pub sweep_max_idle_days: u32,
}

fn default_smoothing_factor() -> f64 {
    0.3
}
fn default_confidence_volume() -> u64 {
    10
}
fn default_sweep_min_importance() -> f64 {
    3.0
}
fn default_sweep_max_idle_days() -> u32 {
    90
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            smoothing_factor: default_smoothing_factor(),
            confidence_volume: default_confidence_volume(),
            replay_protection: true,
            sweep_min_importance: default_sweep_min_importance(),
            sweep_max_idle_days: default_sweep_max_idle_days(),
        }
    }
}

// ── Memory ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "sqlite" or "in_memory"
    #[serde(default = "default_memory_backend")]
    pub backend: String,

    /// SQLite database path; defaults to `~/.agentpilot/agentpilot.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_memory_backend() -> String {
    "sqlite".into()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            path: None,
        }
    }
}

impl MemoryConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| EngineConfig::config_dir().join("agentpilot.db"))
    }
}

// ── API operations ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Operation name → HTTP endpoint
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,

    /// Messages served by `email.fetch`; a small sample inbox when empty
    #[serde(default)]
    pub inbox: Vec<InboxMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub from: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_endpoint_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_method() -> String {
    "POST".into()
}
fn default_endpoint_timeout() -> u64 {
    30
}

// ── Pricing ─────────────────────────────────────────────────────────────────

/// Custom per-million-token pricing for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    /// Price per 1M input tokens in USD
    pub input_per_m: f64,

    /// Price per 1M output tokens in USD
    pub output_per_m: f64,
}

// ── Schedules ───────────────────────────────────────────────────────────────

/// A workflow run triggered on a fixed interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Unique name for this schedule
    pub name: String,

    /// Path to the workflow definition (JSON or TOML)
    pub workflow: String,

    pub interval_secs: u64,

    /// Invocation input passed to every run
    #[serde(default = "default_schedule_input")]
    pub input: serde_json::Value,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_schedule_input() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

// ── Loading ─────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load configuration from the default path (~/.agentpilot/config.toml).
    ///
    /// Also checks environment variables:
    /// - `AGENTPILOT_API_KEY` (highest priority), then `OPENAI_API_KEY`, `OPENROUTER_API_KEY`
    /// - `AGENTPILOT_BASE_URL`
    /// - `AGENTPILOT_MEMORY_PATH`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path)
    }

    /// Load from an explicit path, then apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("AGENTPILOT_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok());
        }

        if let Ok(url) = std::env::var("AGENTPILOT_BASE_URL") {
            self.provider.base_url = url;
        }

        if let Ok(path) = std::env::var("AGENTPILOT_MEMORY_PATH") {
            self.memory.path = Some(path);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".agentpilot")
    }

    /// Validate the configuration. Rejects, never corrects.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, table) in self.complexity.weights.named() {
            let sum = table.sum();
            if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                return Err(ConfigError::ValidationError(format!(
                    "complexity weight table '{name}' sums to {sum:.4}, expected 1.0 ± {WEIGHT_SUM_TOLERANCE}"
                )));
            }
            if table.as_array().iter().any(|w| *w < 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "complexity weight table '{name}' contains a negative weight"
                )));
            }
        }

        for (name, t) in self.complexity.thresholds.named() {
            if !t.is_increasing() {
                return Err(ConfigError::ValidationError(format!(
                    "thresholds for '{name}' must satisfy 0 < low < medium < high"
                )));
            }
        }

        let r = &self.routing;
        if !(0.0 <= r.fast_max && r.fast_max < r.balanced_max && r.balanced_max <= 10.0) {
            return Err(ConfigError::ValidationError(format!(
                "tier boundaries must satisfy 0 <= fast_max < balanced_max <= 10 (got {} / {})",
                r.fast_max, r.balanced_max
            )));
        }
        if ((r.ais_weight + r.step_weight) - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::ValidationError(
                "routing.ais_weight + routing.step_weight must equal 1.0".into(),
            ));
        }
        if !(0.0..=10.0).contains(&r.default_agent_score) {
            return Err(ConfigError::ValidationError(
                "routing.default_agent_score must be between 0 and 10".into(),
            ));
        }
        if !(0.0..=1.0).contains(&r.memory_min_success_rate) {
            return Err(ConfigError::ValidationError(
                "routing.memory_min_success_rate must be between 0 and 1".into(),
            ));
        }

        let alpha = self.learning.smoothing_factor;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(ConfigError::ValidationError(
                "learning.smoothing_factor must be in (0, 1]".into(),
            ));
        }
        if self.learning.confidence_volume == 0 {
            return Err(ConfigError::ValidationError(
                "learning.confidence_volume must be > 0".into(),
            ));
        }

        let b = &self.budget;
        if b.overage_threshold < 1.0 {
            return Err(ConfigError::ValidationError(
                "budget.overage_threshold must be >= 1.0".into(),
            ));
        }
        if b.critical_step_multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "budget.critical_step_multiplier must be >= 1.0".into(),
            ));
        }
        if b.max_tokens_per_iteration == 0 || b.max_total_execution_tokens == 0 {
            return Err(ConfigError::ValidationError("token budgets must be > 0".into()));
        }

        let g = &self.guardrails;
        if g.max_steps == 0 {
            return Err(ConfigError::ValidationError("guardrails.max_steps must be > 0".into()));
        }
        if g.max_parallel_steps == 0 {
            return Err(ConfigError::ValidationError(
                "guardrails.max_parallel_steps must be > 0".into(),
            ));
        }
        if g.max_same_tool_repeats == 0 || g.loop_detection_window < g.max_same_tool_repeats {
            return Err(ConfigError::ValidationError(
                "guardrails.loop_detection_window must be >= max_same_tool_repeats > 0".into(),
            ));
        }
        if g.circuit_breaker_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "guardrails.circuit_breaker_threshold must be > 0".into(),
            ));
        }
        for (name, secs) in [
            ("max_execution_time_secs", g.max_execution_time_secs),
            ("step_timeout_secs", g.step_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_DURATION_SECS {
                return Err(ConfigError::ValidationError(format!(
                    "guardrails.{name} must be between 1 and {MAX_DURATION_SECS}"
                )));
            }
        }

        for schedule in &self.schedules {
            if schedule.interval_secs == 0 || schedule.interval_secs > MAX_DURATION_SECS {
                return Err(ConfigError::ValidationError(format!(
                    "schedule '{}' must have interval_secs between 1 and {MAX_DURATION_SECS}",
                    schedule.name
                )));
            }
        }

        if !matches!(self.memory.backend.as_str(), "sqlite" | "in_memory" | "none") {
            return Err(ConfigError::ValidationError(format!(
                "unknown memory backend '{}'",
                self.memory.backend
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider: ProviderSettings::default(),
            models: ModelsConfig::default(),
            routing: RoutingConfig::default(),
            complexity: ComplexityConfig::default(),
            budget: BudgetConfig::default(),
            guardrails: GuardrailsConfig::default(),
            learning: LearningConfig::default(),
            memory: MemoryConfig::default(),
            api: ApiConfig::default(),
            pricing: HashMap::new(),
            schedules: vec![],
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing.fast_max, 3.0);
        assert_eq!(config.routing.balanced_max, 6.5);
        assert_eq!(config.guardrails.default_retry_count, 3);
        assert_eq!(config.budget.allocation_strategy, AllocationStrategy::Priority);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = EngineConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed.models.balanced, config.models.balanced);
        assert_eq!(parsed.learning.smoothing_factor, config.learning.smoothing_factor);
    }

    #[test]
    fn weight_table_not_summing_to_one_is_rejected() {
        let toml_str = r#"
[complexity.weights.transform]
prompt_length = 0.5
data_size = 0.5
reasoning_depth = 0.1
condition_count = 0.0
context_depth = 0.0
output_complexity = 0.0
"#;
        let err = EngineConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("transform"));
    }

    #[test]
    fn weight_table_within_tolerance_is_accepted() {
        let toml_str = r#"
[complexity.weights.api_call]
prompt_length = 0.2
data_size = 0.2
reasoning_depth = 0.2
condition_count = 0.2
context_depth = 0.1
output_complexity = 0.105
"#;
        assert!(EngineConfig::from_toml_str(toml_str).is_ok());
    }

    #[test]
    fn inverted_tier_boundaries_rejected() {
        let mut config = EngineConfig::default();
        config.routing.fast_max = 7.0;
        config.routing.balanced_max = 6.5;
        assert!(config.validate().is_err());

        config.routing.fast_max = 3.0;
        config.routing.balanced_max = 11.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn strategy_weights_must_sum_to_one() {
        let mut config = EngineConfig::default();
        config.routing.ais_weight = 0.7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn smoothing_factor_bounds() {
        let mut config = EngineConfig::default();
        config.learning.smoothing_factor = 0.0;
        assert!(config.validate().is_err());
        config.learning.smoothing_factor = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loop_window_smaller_than_repeats_rejected() {
        let mut config = EngineConfig::default();
        config.guardrails.loop_detection_window = 2;
        config.guardrails.max_same_tool_repeats = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = EngineConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.models.fast, "gpt-4o-mini");
    }

    #[test]
    fn load_from_file_reports_path_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "routing = 5").unwrap();
        let err = EngineConfig::load_from(file.path()).unwrap_err();
        match err {
            ConfigError::ParseError { path, .. } => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn api_key_is_redacted_in_debug() {
        let config = EngineConfig {
            api_key: Some("sk-secret-123".into()),
            ..EngineConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret-123"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn intent_budget_caps_total() {
        let mut budget = BudgetConfig::default();
        budget.intent_budgets.insert("finance".into(), 20_000);
        assert_eq!(budget.total_budget_for(Some("finance")), 20_000);
        assert_eq!(budget.total_budget_for(Some("other")), 100_000);
        assert_eq!(budget.total_budget_for(None), 100_000);
    }

    #[test]
    fn schedule_and_endpoint_parsing() {
        let toml_str = r#"
[api.endpoints."crm.lookup"]
url = "https://crm.example.com/lookup"
timeout_secs = 5

[[api.inbox]]
from = "billing@acme.test"
subject = "Invoice 1042"

[[schedules]]
name = "hourly_triage"
workflow = "workflows/triage.json"
interval_secs = 3600
[schedules.input]
mailbox = "ap@example.com"
"#;
        let config = EngineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.api.inbox.len(), 1);
        assert_eq!(config.api.inbox[0].subject, "Invoice 1042");
        assert!(config.api.inbox[0].body.is_empty());
        let endpoint = &config.api.endpoints["crm.lookup"];
        assert_eq!(endpoint.method, "POST");
        assert_eq!(endpoint.timeout_secs, 5);
        assert_eq!(config.schedules.len(), 1);
        assert!(config.schedules[0].enabled);
        assert_eq!(config.schedules[0].input["mailbox"], "ap@example.com");
    }

    #[test]
    fn zero_interval_schedule_rejected() {
        let toml_str = r#"
[[schedules]]
name = "broken"
workflow = "wf.json"
interval_secs = 0
"#;
        assert!(EngineConfig::from_toml_str(toml_str).is_err());

        let huge = toml_str.replace("interval_secs = 0", &format!("interval_secs = {}", i64::MAX));
        assert!(EngineConfig::from_toml_str(&huge).is_err());
    }

    #[test]
    fn run_deadline_and_step_timeout_are_bounded() {
        let mut config = EngineConfig::default();
        config.guardrails.max_execution_time_secs = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.guardrails.step_timeout_secs = MAX_DURATION_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.guardrails.max_execution_time_secs = MAX_DURATION_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn models_map_tiers() {
        let models = ModelsConfig::default();
        assert_eq!(models.model_for(Tier::Fast), "gpt-4o-mini");
        assert_eq!(models.model_for(Tier::Powerful), "o1");
    }
}
