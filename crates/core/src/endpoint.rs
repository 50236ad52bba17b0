use std::fmt;

/// Remote protocol shape used for a model.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EndpointChoice {
    /// `/chat/completions`: `messages` array, optional SSE streaming, no structured output.
    ChatStyle,
    /// `/responses`: flattened `input` array, optional JSON-object output, never streams.
    ResponseStyle,
}

impl EndpointChoice {
    pub fn path(&self) -> &'static str {
        match self {
            Self::ChatStyle => "chat/completions",
            Self::ResponseStyle => "responses",
        }
    }

    pub fn supports_structured_output(&self) -> bool {
        matches!(self, Self::ResponseStyle)
    }
}

impl fmt::Display for EndpointChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChatStyle => f.write_str("chat"),
            Self::ResponseStyle => f.write_str("responses"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ModelCapabilities {
    pub endpoint: EndpointChoice,
    pub supports_streaming: bool,
    pub supports_temperature: bool,
}

impl ModelCapabilities {
    const fn chat() -> Self {
        Self {
            endpoint: EndpointChoice::ChatStyle,
            supports_streaming: true,
            supports_temperature: true,
        }
    }

    const fn reasoning() -> Self {
        Self {
            endpoint: EndpointChoice::ResponseStyle,
            supports_streaming: false,
            supports_temperature: false,
        }
    }

    /// Streaming is only ever used on the chat endpoint.
    pub fn streams(&self) -> bool {
        self.supports_streaming && self.endpoint == EndpointChoice::ChatStyle
    }
}

const MODEL_TABLE: &[(&str, ModelCapabilities)] = &[
    ("gpt-3.5-turbo", ModelCapabilities::chat()),
    ("gpt-4", ModelCapabilities::chat()),
    ("gpt-4-turbo", ModelCapabilities::chat()),
    ("gpt-4o", ModelCapabilities::chat()),
    ("gpt-4o-mini", ModelCapabilities::chat()),
    ("gpt-4.1", ModelCapabilities::chat()),
    ("gpt-4.1-mini", ModelCapabilities::chat()),
    ("gpt-4.1-nano", ModelCapabilities::chat()),
    ("o1", ModelCapabilities::reasoning()),
    ("o1-mini", ModelCapabilities::reasoning()),
    ("o3", ModelCapabilities::reasoning()),
    ("o3-mini", ModelCapabilities::reasoning()),
    ("o4-mini", ModelCapabilities::reasoning()),
    ("gpt-5", ModelCapabilities::reasoning()),
    ("gpt-5-mini", ModelCapabilities::reasoning()),
    ("gpt-5-nano", ModelCapabilities::reasoning()),
];

pub fn supported_models() -> impl Iterator<Item = &'static str> {
    MODEL_TABLE.iter().map(|(name, _)| *name)
}

pub fn is_supported_model(model: &str) -> bool {
    lookup(model).is_some()
}

/// Capabilities for `model`; unknown identifiers get chat-endpoint defaults.
pub fn capabilities(model: &str) -> ModelCapabilities {
    lookup(model).unwrap_or_else(ModelCapabilities::chat)
}

pub fn endpoint_choice(model: &str) -> EndpointChoice {
    capabilities(model).endpoint
}

fn lookup(model: &str) -> Option<ModelCapabilities> {
    let normalized = model.trim().to_ascii_lowercase();
    MODEL_TABLE
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, caps)| *caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_model_maps_to_one_stable_endpoint() {
        for model in supported_models() {
            let first = endpoint_choice(model);
            for _ in 0..3 {
                assert_eq!(endpoint_choice(model), first, "unstable choice for {model}");
            }
        }
    }

    #[test]
    fn reasoning_models_use_response_endpoint_and_never_stream() {
        for model in ["o1", "o3-mini", "gpt-5"] {
            let caps = capabilities(model);
            assert_eq!(caps.endpoint, EndpointChoice::ResponseStyle);
            assert!(!caps.streams());
            assert!(!caps.supports_temperature);
        }
    }

    #[test]
    fn unknown_models_default_to_chat() {
        assert_eq!(endpoint_choice("my-local-llama"), EndpointChoice::ChatStyle);
        assert!(capabilities("my-local-llama").streams());
        assert!(!is_supported_model("my-local-llama"));
    }

    #[test]
    fn lookup_ignores_case_and_padding() {
        assert_eq!(endpoint_choice("  O3-Mini "), EndpointChoice::ResponseStyle);
        assert!(is_supported_model("GPT-4o"));
    }

    #[test]
    fn only_response_endpoint_accepts_structured_output() {
        assert!(EndpointChoice::ResponseStyle.supports_structured_output());
        assert!(!EndpointChoice::ChatStyle.supports_structured_output());
    }
}
