//! Provider dispatch layer.
//!
//! Dialect adapters translate provider-neutral chat requests, the transport
//! performs HTTP I/O under a deadline, and the [`Dispatcher`] wraps every call
//! in per-provider circuit breaking, admission control, quota backoff and
//! latency tracking.

pub mod adapter;
mod dispatcher;
pub mod error;
mod health;
pub mod messages;
mod quota;
pub mod resilience;
mod router;
pub mod transport;

pub use adapter::{AnthropicAdapter, DialectAdapter, OpenAiAdapter, adapter_for};
pub use dispatcher::{DispatchConfig, Dispatcher, ProviderSnapshot};
pub use health::{HealthConfig, HealthProber};
pub use messages::{
    ChatMessage, ChatRequest, ChatResponse, ChatRole, DiscoveredModel, TokenUsage, ToolCall,
    ToolChoice, ToolDefinition,
};
pub use quota::{ModelQuotaPolicy, ProviderQuotaPolicy, QuotaPolicy};
pub use resilience::{
    CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState, ExponentialBackoff,
    RollingStats, StatsSnapshot,
};
pub use router::{Candidate, LatencyRouter, RouterConfig, TieBreak};
pub use transport::{
    CallContext, HttpMethod, HttpRequest, HttpResponse, PoolConfig, ReqwestTransport, Transport,
};
