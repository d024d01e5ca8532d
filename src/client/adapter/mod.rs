//! Dialect adapters for the supported provider wire formats.

mod anthropic;
mod openai;
mod sse;
mod traits;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;
pub use traits::DialectAdapter;

use std::sync::Arc;

use crate::types::Dialect;

pub fn adapter_for(dialect: Dialect) -> Arc<dyn DialectAdapter> {
    match dialect {
        Dialect::OpenAi => Arc::new(OpenAiAdapter::new()),
        Dialect::Anthropic => Arc::new(AnthropicAdapter::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_for_dialect() {
        assert_eq!(adapter_for(Dialect::OpenAi).dialect(), Dialect::OpenAi);
        assert_eq!(adapter_for(Dialect::Anthropic).dialect(), Dialect::Anthropic);
    }
}
