use crate::endpoint::{capabilities, EndpointChoice, ModelCapabilities};

#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_output_tokens: 4096,
            seed: None,
        }
    }
}

/// One completion call. Built fresh per call and never mutated once sent.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub model: String,
    pub sampling: SamplingParams,
    pub structured_output: bool,
    pub stream: bool,
}

impl GenerationRequest {
    pub fn new(
        model: impl Into<String>,
        system: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            model: model.into(),
            sampling: SamplingParams::default(),
            structured_output: false,
            stream: false,
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn structured(mut self) -> Self {
        self.structured_output = true;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        capabilities(&self.model)
    }

    pub fn endpoint(&self) -> EndpointChoice {
        self.capabilities().endpoint
    }

    /// Structured output is honoured only where the endpoint accepts it.
    pub fn wants_structured_output(&self) -> bool {
        self.structured_output && self.endpoint().supports_structured_output()
    }
}
