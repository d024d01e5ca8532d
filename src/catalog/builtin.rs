//! Static catalog used when live discovery and configuration both come up empty.

use crate::types::{CatalogSource, ModelCapabilities, ModelRecord};

struct BuiltinModel {
    provider: &'static str,
    id: &'static str,
    display_name: &'static str,
    context_window: u64,
    tool_calling: bool,
    vision: bool,
}

const fn model(
    provider: &'static str,
    id: &'static str,
    display_name: &'static str,
    context_window: u64,
    tool_calling: bool,
    vision: bool,
) -> BuiltinModel {
    BuiltinModel {
        provider,
        id,
        display_name,
        context_window,
        tool_calling,
        vision,
    }
}

const BUILTIN: &[BuiltinModel] = &[
    model("openai", "gpt-4o", "GPT-4o", 128_000, true, true),
    model("openai", "gpt-4o-mini", "GPT-4o mini", 128_000, true, true),
    model("openai", "gpt-4-turbo", "GPT-4 Turbo", 128_000, true, true),
    model("openai", "gpt-4", "GPT-4", 8_192, true, false),
    model("openai", "gpt-3.5-turbo", "GPT-3.5 Turbo", 16_385, true, false),
    model("anthropic", "claude-3-5-sonnet-20241022", "Claude 3.5 Sonnet", 200_000, true, true),
    model("anthropic", "claude-3-5-haiku-20241022", "Claude 3.5 Haiku", 200_000, true, false),
    model("anthropic", "claude-3-opus-20240229", "Claude 3 Opus", 200_000, true, true),
    model("groq", "llama-3.1-8b-instant", "Llama 3.1 8B Instant", 131_072, true, false),
    model("groq", "llama-3.3-70b-versatile", "Llama 3.3 70B Versatile", 131_072, true, false),
    model("gemini", "gemini-pro", "Gemini Pro", 30_720, true, false),
    model("google", "gemini-pro", "Gemini Pro", 30_720, true, false),
    model("deepseek", "deepseek-chat", "DeepSeek Chat", 64_000, true, false),
    model("mistral", "mistral-small", "Mistral Small", 32_000, true, false),
    model("mistral", "mistral-tiny", "Mistral Tiny", 32_000, false, false),
    model("togetherai", "llama-2-70b-chat", "Llama 2 70B Chat", 4_096, false, false),
    model("together", "llama-2-70b-chat", "Llama 2 70B Chat", 4_096, false, false),
    model("fireworks", "llama-v2-7b-chat", "Llama v2 7B Chat", 4_096, false, false),
    model("nvidia", "llama2-70b", "Llama 2 70B", 4_096, false, false),
    model("perplexity", "pplx-70b-online", "pplx 70B Online", 4_096, false, false),
    model("openrouter", "openai/gpt-4o", "GPT-4o (OpenRouter)", 128_000, true, true),
];

impl BuiltinModel {
    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities {
            context_window: Some(self.context_window),
            streaming: true,
            tool_calling: self.tool_calling,
            vision: self.vision,
        }
    }
}

/// Builtin records for `provider`, stamped with the current time.
pub fn builtin_models(provider: &str) -> Vec<ModelRecord> {
    BUILTIN
        .iter()
        .filter(|m| m.provider == provider)
        .map(|m| {
            ModelRecord::new(provider, m.id, CatalogSource::StaticFallback)
                .with_display_name(m.display_name)
                .with_capabilities(m.capabilities())
        })
        .collect()
}

/// Known capabilities for a model id served by `provider`.
pub fn builtin_capabilities(provider: &str, model_id: &str) -> Option<ModelCapabilities> {
    BUILTIN
        .iter()
        .find(|m| m.provider == provider && m.id == model_id)
        .map(BuiltinModel::capabilities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_for_known_provider() {
        let models = builtin_models("openai");
        assert!(models.iter().any(|m| m.model_id == "gpt-4"));
        assert!(models.iter().all(|m| m.source == CatalogSource::StaticFallback));
        assert!(models.iter().all(|m| m.capabilities.context_window.is_some()));
    }

    #[test]
    fn test_unknown_provider_is_empty() {
        assert!(builtin_models("unknown-provider").is_empty());
        assert!(builtin_capabilities("openai", "nope").is_none());
        assert_eq!(
            builtin_capabilities("mistral", "mistral-small")
                .unwrap()
                .context_window,
            Some(32_000)
        );
    }
}
