//! Qwen3-4B decode loop over per-layer NPU sessions
//!
//! Every token, prompt or generated, is pushed through all layers one
//! position at a time. Each layer sees the cache window, the position
//! index and an inclusive attention mask, and hands back the K/V row for
//! that position plus the next hidden state. Only the last prompt token
//! and generated tokens go through the post head.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use half::bf16;
use tracing::{info, warn};

use super::{
    EngineKind, GenerationOutput, GenerationRequest, GenerationTimings, InferenceEngine,
    LayerInputs, LayerSession, LoadReport, PostSession, SessionFactory, StopReason,
};
use crate::embedding::{EmbeddingTable, QWEN3_HIDDEN};
use crate::error::{BridgeError, Result};
use crate::kv_cache::{attention_mask, KvCache, KvCacheConfig};
use crate::model_layout::{ModelKind, ModelLayout, DEFAULT_NUM_LAYERS};
use crate::sampling::Sampler;
use crate::tokenizer::{DeltaDecoder, HfTokenizer, TextTokenizer};

/// Geometry of the layered model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeConfig {
    /// Hidden size
    pub hidden: usize,
    /// Layer count probed on disk
    pub num_layers: usize,
    /// K/V row width
    pub kv_dim: usize,
    /// Cache rows including the slot past the window
    pub max_seq_len: usize,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        let kv = KvCacheConfig::default();
        Self {
            hidden: QWEN3_HIDDEN,
            num_layers: DEFAULT_NUM_LAYERS,
            kv_dim: kv.kv_dim,
            max_seq_len: kv.max_seq_len,
        }
    }
}

/// Everything a loaded model needs to decode
pub struct DecodeModel {
    /// Per-layer sessions in order
    pub layers: Vec<Box<dyn LayerSession>>,
    /// Post head session
    pub post: Box<dyn PostSession>,
    /// Token embeddings
    pub embeddings: EmbeddingTable,
    /// Tokenizer
    pub tokenizer: Box<dyn TextTokenizer>,
    /// K/V buffers, one pair per layer
    pub cache: KvCache,
    /// Directory the model came from
    pub source: String,
}

impl std::fmt::Debug for DecodeModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeModel")
            .field("layers", &self.layers.len())
            .field("vocab", &self.embeddings.vocab_size())
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Layered decode engine
pub struct DecodeEngine {
    factory: Arc<dyn SessionFactory>,
    config: DecodeConfig,
    model: Mutex<Option<DecodeModel>>,
}

impl std::fmt::Debug for DecodeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeEngine")
            .field("config", &self.config)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

impl DecodeEngine {
    /// Engine with no model loaded
    #[must_use]
    pub fn new(factory: Arc<dyn SessionFactory>, config: DecodeConfig) -> Self {
        Self {
            factory,
            config,
            model: Mutex::new(None),
        }
    }

    /// Engine around an already assembled model
    #[must_use]
    pub fn with_model(factory: Arc<dyn SessionFactory>, config: DecodeConfig, model: DecodeModel) -> Self {
        Self {
            factory,
            config,
            model: Mutex::new(Some(model)),
        }
    }

    /// Run `f` against the loaded model, if any
    pub fn with_loaded<R>(&self, f: impl FnOnce(&DecodeModel) -> R) -> Option<R> {
        self.model.lock().ok().and_then(|m| m.as_ref().map(f))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<DecodeModel>>> {
        self.model
            .lock()
            .map_err(|_| BridgeError::InferenceError("decode engine lock poisoned".to_string()))
    }

    fn open(&self, path: &Path) -> Result<DecodeModel> {
        let layout = ModelLayout::detect(path, self.config.num_layers)?;
        if layout.kind != ModelKind::Layered {
            return Err(BridgeError::FormatError {
                reason: format!(
                    "{} holds a prefill/decode model; the decode engine needs per-layer axmodels",
                    path.display()
                ),
            });
        }
        let post_path = layout.post.as_deref().ok_or_else(|| BridgeError::FormatError {
            reason: "post model missing".to_string(),
        })?;
        let embed_path = layout.embeddings.as_deref().ok_or_else(|| BridgeError::FormatError {
            reason: format!("embedding table missing in {}", path.display()),
        })?;
        let tokenizer_path = layout.tokenizer.as_deref().ok_or_else(|| {
            BridgeError::TokenizerError(format!("tokenizer.json missing in {}", path.display()))
        })?;

        let embeddings = EmbeddingTable::load(embed_path, self.config.hidden)?;
        info!(
            "Loaded bf16 embeddings: {} x {}",
            embeddings.vocab_size(),
            embeddings.hidden()
        );

        let mut layers = Vec::with_capacity(layout.layers.len());
        for (i, layer_path) in layout.layers.iter().enumerate() {
            info!("Loading layer {i} from {}", layer_path.display());
            layers.push(self.factory.open_layer(layer_path)?);
        }
        info!("Loading post-process model from {}", post_path.display());
        let post = self.factory.open_post(post_path)?;
        let tokenizer = HfTokenizer::from_file(tokenizer_path)?;

        let cache = KvCache::new(KvCacheConfig {
            num_layers: layers.len(),
            kv_dim: self.config.kv_dim,
            max_seq_len: self.config.max_seq_len,
        });
        info!(
            "Initialized KV caches: {} layers, {} seq len, {} dims",
            layers.len(),
            self.config.max_seq_len,
            self.config.kv_dim
        );

        Ok(DecodeModel {
            layers,
            post,
            embeddings,
            tokenizer: Box::new(tokenizer),
            cache,
            source: path.display().to_string(),
        })
    }
}

impl InferenceEngine for DecodeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Layered
    }

    fn is_loaded(&self) -> bool {
        self.model.lock().map(|m| m.is_some()).unwrap_or(false)
    }

    fn load(&self, path: &Path) -> Result<LoadReport> {
        if !path.exists() {
            return Err(BridgeError::ModelNotFound(path.display().to_string()));
        }
        let mut slot = self.lock()?;
        if slot.is_some() {
            info!("Resetting device before model load...");
            *slot = None;
            self.factory.reset_device(0)?;
        }
        let model = self.open(path)?;
        let layers = model.layers.len();
        *slot = Some(model);
        Ok(LoadReport {
            status: "loaded".to_string(),
            model: path.display().to_string(),
            kind: EngineKind::Layered,
            layers,
        })
    }

    fn reset(&self) -> Result<()> {
        let mut slot = self.lock()?;
        if let Some(model) = slot.as_mut() {
            model.cache.clear();
        }
        Ok(())
    }

    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &AtomicBool,
        sink: &mut dyn FnMut(&str),
    ) -> Result<GenerationOutput> {
        let mut slot = self.lock()?;
        let model = slot.as_mut().ok_or(BridgeError::ModelNotLoaded)?;
        run_decode(model, request, cancel, sink)
    }
}

struct StepClock {
    start: Instant,
    timings: GenerationTimings,
}

/// Run one generation against a loaded model
///
/// # Errors
///
/// Returns an error for an empty or over-long prompt, or when a session,
/// the tokenizer or the sampler fails.
pub fn run_decode(
    model: &mut DecodeModel,
    request: &GenerationRequest,
    cancel: &AtomicBool,
    sink: &mut dyn FnMut(&str),
) -> Result<GenerationOutput> {
    let id = request.request_id.as_str();
    let mut clock = StepClock {
        start: Instant::now(),
        timings: GenerationTimings::default(),
    };
    info!("REQ {id}: generate start, prompt_len={}", request.prompt.len());

    let t0 = Instant::now();
    let input_ids = model.tokenizer.encode(&request.prompt)?;
    clock.timings.tokenize = t0.elapsed().as_secs_f64();
    if input_ids.is_empty() {
        return Err(BridgeError::InvalidShape {
            reason: "Prompt cannot be empty".to_string(),
        });
    }

    let window = model.cache.config().window();
    if input_ids.len() > window {
        return Err(BridgeError::ContextLimitExceeded {
            position: input_ids.len(),
            window,
        });
    }

    model.cache.clear();
    let mut sampler = Sampler::new(request.sampling)?;
    let mut decoder = DeltaDecoder::new();

    info!("REQ {id}: Prefilling {} tokens...", input_ids.len());
    let mut pos = 0usize;
    let mut logits = Vec::new();
    for (i, &token) in input_ids.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            return finish(model, &decoder, &input_ids, StopReason::Cancelled, clock);
        }
        let with_logits = i + 1 == input_ids.len();
        if let Some(l) = forward(model, token, pos, with_logits, id, &mut clock)? {
            logits = l;
        }
        pos += 1;
    }

    let mut stop = StopReason::MaxTokens;
    let mut generated = 0usize;
    while generated < request.max_tokens {
        if cancel.load(Ordering::Relaxed) {
            stop = StopReason::Cancelled;
            break;
        }

        let t_sample = Instant::now();
        let next = sampler.sample(&logits)?;
        clock.timings.sampling += t_sample.elapsed().as_secs_f64();

        if model.tokenizer.is_eos(next) {
            info!("REQ {id}: EOS token generated");
            stop = StopReason::Eos;
            break;
        }

        generated += 1;
        let t_detok = Instant::now();
        let delta = decoder.push(model.tokenizer.as_ref(), next)?;
        clock.timings.detokenize += t_detok.elapsed().as_secs_f64();
        if let Some(delta) = delta {
            sink(&delta);
        }

        if generated == request.max_tokens {
            break;
        }
        if pos >= window {
            warn!("REQ {id}: Context length limit reached");
            stop = StopReason::ContextLimit;
            break;
        }
        if let Some(l) = forward(model, next, pos, true, id, &mut clock)? {
            logits = l;
        }
        pos += 1;
    }

    finish(model, &decoder, &input_ids, stop, clock)
}

/// Push one token through every layer at `pos`, optionally through the post head
fn forward(
    model: &mut DecodeModel,
    token: u32,
    pos: usize,
    with_logits: bool,
    request_id: &str,
    clock: &mut StepClock,
) -> Result<Option<Vec<f32>>> {
    let DecodeModel {
        layers,
        post,
        embeddings,
        cache,
        ..
    } = model;
    let hidden_size = embeddings.hidden();

    let t_embed = Instant::now();
    let mut hidden: Vec<bf16> = embeddings.lookup(token)?.to_vec();
    clock.timings.embedding += t_embed.elapsed().as_secs_f64();

    let mask = attention_mask(cache.config().max_seq_len, pos);
    let index = u32::try_from(pos).map_err(|_| BridgeError::ContextLimitExceeded {
        position: pos,
        window: cache.config().window(),
    })?;

    let t_layers = Instant::now();
    for (i, layer) in layers.iter_mut().enumerate() {
        let outputs = {
            let inputs = LayerInputs {
                input: &hidden,
                k_cache: cache.k_window(i),
                v_cache: cache.v_window(i),
                index,
                mask: &mask,
            };
            layer.run(&inputs)?
        };
        clock.timings.npu_calls += 1;
        cache.write(i, pos, &outputs.k_out, &outputs.v_out)?;
        if outputs.output.len() != hidden_size {
            return Err(BridgeError::InvalidShape {
                reason: format!(
                    "layer {i} returned hidden of {} (expected {hidden_size})",
                    outputs.output.len()
                ),
            });
        }
        hidden = outputs.output;
    }
    let step_layer_time = t_layers.elapsed().as_secs_f64();
    clock.timings.layer_runs += step_layer_time;

    let logits = if with_logits {
        let t_post = Instant::now();
        let logits = post.run(&hidden)?;
        clock.timings.post += t_post.elapsed().as_secs_f64();
        clock.timings.npu_calls += 1;
        Some(logits)
    } else {
        None
    };

    let step = clock.timings.steps;
    clock.timings.steps += 1;
    info!(
        "REQ {request_id}: step={step} elapsed={:.6}s step_layer_time={step_layer_time:.6}s npu_calls={}",
        clock.start.elapsed().as_secs_f64(),
        clock.timings.npu_calls
    );
    Ok(logits)
}

fn finish(
    model: &DecodeModel,
    decoder: &DeltaDecoder,
    input_ids: &[u32],
    stop: StopReason,
    mut clock: StepClock,
) -> Result<GenerationOutput> {
    let t_detok = Instant::now();
    let text = decoder.finish(model.tokenizer.as_ref())?;
    clock.timings.detokenize += t_detok.elapsed().as_secs_f64();
    clock.timings.total = clock.start.elapsed().as_secs_f64();

    let t = &clock.timings;
    info!(
        "Generation timing summary: total={:.3}s, tokenize={:.4}s, embedding={:.4}s, layer_runs={:.4}s, post={:.4}s, sampling={:.4}s, detokenize={:.4}s, npu_calls={}, steps={}",
        t.total, t.tokenize, t.embedding, t.layer_runs, t.post, t.sampling, t.detokenize, t.npu_calls, t.steps
    );

    Ok(GenerationOutput {
        text,
        prompt_tokens: input_ids.len(),
        generated_tokens: decoder.ids().len(),
        stop_reason: stop,
        timings: clock.timings,
    })
}
