use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

use crate::agent::ChunkMetrics;

/// Summary attached to the terminal `complete` event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct RunMetrics {
    /// Seconds.
    pub duration: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_per_second: f64,
    pub cost: f64,
    pub estimated: bool,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct Price {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriceTable {
    providers: HashMap<String, HashMap<String, Price>>,
}

impl PriceTable {
    pub fn insert(&mut self, provider: &str, model: &str, price: Price) {
        self.providers
            .entry(provider.to_string())
            .or_default()
            .insert(model.to_string(), price);
    }

    /// Unknown pairs cost nothing.
    pub fn price(&self, provider: &str, model: &str) -> Price {
        self.providers
            .get(provider)
            .and_then(|models| models.get(model))
            .copied()
            .unwrap_or_default()
    }

    pub fn load_or_empty(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let parsed = std::fs::read_to_string(path)
            .map_err(|err| err.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|err| err.to_string()));
        match parsed {
            Ok(table) => table,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "pricing unavailable, costs will be zero");
                Self::default()
            }
        }
    }
}

pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> Result<u64, String>;
}

/// Provider-independent `cl100k_base` encoding.
pub struct Cl100kTokenizer {
    bpe: CoreBPE,
}

impl Cl100kTokenizer {
    pub fn new() -> Result<Self, String> {
        tiktoken_rs::cl100k_base()
            .map(|bpe| Self { bpe })
            .map_err(|err| err.to_string())
    }
}

impl Tokenizer for Cl100kTokenizer {
    fn count(&self, text: &str) -> Result<u64, String> {
        Ok(self.bpe.encode_with_special_tokens(text).len() as u64)
    }
}

/// Running totals for one stream. Token counts keep the maximum seen because some
/// providers re-report cumulative totals on every chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageAccumulator {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub text: String,
}

impl UsageAccumulator {
    pub fn observe(&mut self, content: Option<&str>, metrics: Option<&ChunkMetrics>) {
        if let Some(content) = content {
            self.text.push_str(content);
        }
        if let Some(metrics) = metrics {
            self.input_tokens = self.input_tokens.max(metrics.input_tokens.unwrap_or(0));
            self.output_tokens = self.output_tokens.max(metrics.output_tokens.unwrap_or(0));
        }
    }
}

#[derive(Clone)]
pub struct MetricsEstimator {
    prices: Arc<PriceTable>,
    tokenizer: Option<Arc<dyn Tokenizer>>,
}

impl MetricsEstimator {
    pub fn new(prices: PriceTable, tokenizer: Option<Arc<dyn Tokenizer>>) -> Self {
        Self {
            prices: Arc::new(prices),
            tokenizer,
        }
    }

    /// Uses `cl100k_base`; if it cannot be built the fallback reports zero counts.
    pub fn with_default_tokenizer(prices: PriceTable) -> Self {
        let tokenizer = match Cl100kTokenizer::new() {
            Ok(tok) => Some(Arc::new(tok) as Arc<dyn Tokenizer>),
            Err(err) => {
                tracing::warn!(error = %err, "tokenizer unavailable, estimates will be zero");
                None
            }
        };
        Self::new(prices, tokenizer)
    }

    pub fn start_run(&self, provider: &str, model: &str, input: &str) -> RunGuard {
        RunGuard {
            start: Instant::now(),
            usage: UsageAccumulator::default(),
            estimator: self.clone(),
            provider: provider.to_string(),
            model: model.to_string(),
            input: input.to_string(),
        }
    }

    pub fn finalize(
        &self,
        usage: &UsageAccumulator,
        provider: &str,
        model: &str,
        input: &str,
        duration: Duration,
    ) -> RunMetrics {
        let mut input_tokens = usage.input_tokens;
        let mut output_tokens = usage.output_tokens;
        let mut estimated = false;

        if output_tokens == 0 && !usage.text.is_empty() {
            estimated = true;
            let counted = self.tokenizer.as_ref().map(|tok| {
                let output = tok.count(&usage.text)?;
                let input = tok.count(input)?;
                Ok::<_, String>((input, output))
            });
            match counted {
                Some(Ok((input, output))) => {
                    input_tokens = input;
                    output_tokens = output;
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "token estimation failed");
                    input_tokens = 0;
                    output_tokens = 0;
                }
                None => {
                    input_tokens = 0;
                    output_tokens = 0;
                }
            }
        }

        let price = self.prices.price(provider, model);
        let cost = (input_tokens as f64 * price.input + output_tokens as f64 * price.output) / 1_000_000.0;
        let secs = duration.as_secs_f64();
        let tokens_per_second = if secs > 0.0 {
            output_tokens as f64 / secs
        } else {
            0.0
        };

        RunMetrics {
            duration: secs,
            input_tokens,
            output_tokens,
            tokens_per_second,
            cost,
            estimated,
        }
    }
}

/// Per-run accounting, owned by a single execution.
pub struct RunGuard {
    start: Instant,
    usage: UsageAccumulator,
    estimator: MetricsEstimator,
    provider: String,
    model: String,
    input: String,
}

impl RunGuard {
    pub fn observe(&mut self, content: Option<&str>, metrics: Option<&ChunkMetrics>) {
        self.usage.observe(content, metrics);
    }

    pub fn finish(self) -> (String, RunMetrics) {
        let metrics = self.estimator.finalize(
            &self.usage,
            &self.provider,
            &self.model,
            &self.input,
            self.start.elapsed(),
        );
        (self.usage.text, metrics)
    }
}
