use anyhow::{anyhow, bail, Context, Result};
use candle::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2::{Config as Qwen2Config, ModelForCausalLM as Qwen2};
use candle_transformers::utils::apply_repeat_penalty;
use std::fs;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::device::{build_device, weight_dtype};
use super::loader::ModelFiles;
use super::pool::ModelPool;
use super::sampling::{
    banned_ngram_tokens, build_logits_processor, mask_tokens, new_token_budget, stop_token_ids,
    STOP_TOKEN_CANDIDATES,
};
use super::TextGenerator;
use crate::config::{GenerationParams, ModelConfig};
use crate::prompts::PromptStyle;

// ---------------------------------------------------------
// PUBLIC SERVICE
// ---------------------------------------------------------
pub struct DialogueService {
    model_id: String,
    pool: ModelPool<Qwen2>,
    tokenizer: Tokenizer,
    device: Device,
    prompt_style: PromptStyle,
    stop_tokens: Vec<u32>,
    eos_text: Option<String>,
}

impl DialogueService {
    /// Resolve the model files (local snapshot or hub) and build every replica.
    pub fn load(cfg: &ModelConfig) -> Result<Self> {
        let device = build_device(&cfg.device)?;
        let files = ModelFiles::resolve(cfg)?;
        Self::from_files(cfg, &files, device)
    }

    pub fn from_files(cfg: &ModelConfig, files: &ModelFiles, device: Device) -> Result<Self> {
        info!("using device {device:?} for {}", cfg.model_id);

        // ---- Load tokenizer ----
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("tokenizer error ({}): {e}", files.tokenizer.display()))?;
        check_emoji_round_trip(&tokenizer);

        let stop_tokens = stop_token_ids(|t| tokenizer.token_to_id(t));
        if stop_tokens.is_empty() {
            warn!("no stop token found in vocabulary; replies run to the length limit");
        }
        let eos_text = STOP_TOKEN_CANDIDATES
            .iter()
            .find(|t| tokenizer.token_to_id(t).is_some())
            .map(|t| t.to_string());

        // ---- Load config ----
        let model_cfg: Qwen2Config = serde_json::from_slice(
            &fs::read(&files.config)
                .with_context(|| format!("failed to read {}", files.config.display()))?,
        )
        .context("failed to parse model config")?;

        // ---- mmap the weights, one model per replica ----
        info!("found {} safetensors shard(s)", files.weights.len());
        let dtype = weight_dtype(&device);
        let mut replicas = Vec::with_capacity(cfg.pool_size);
        for _ in 0..cfg.pool_size {
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
            replicas.push(Qwen2::new(&model_cfg, vb)?);
        }
        let pool = ModelPool::new(replicas)?;

        info!(
            "🚀 {} loaded with {} replica(s), prompt style {}",
            cfg.model_id,
            pool.size(),
            cfg.prompt_style.as_str()
        );

        Ok(Self {
            model_id: cfg.model_id.clone(),
            pool,
            tokenizer,
            device,
            prompt_style: cfg.prompt_style,
            stop_tokens,
            eos_text,
        })
    }

    fn run(&self, model: &mut Qwen2, message: &str, params: &GenerationParams) -> Result<String> {
        model.clear_kv_cache();

        let prompt = self.prompt_style.render(message, self.eos_text.as_deref());
        let enc = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("tokenizer encode error: {e}"))?;
        let prompt_tokens = enc.get_ids();
        if prompt_tokens.is_empty() {
            bail!("prompt encoded to zero tokens");
        }

        let reply = sample_reply(prompt_tokens, params, &self.stop_tokens, |ctx, pos| {
            let input = Tensor::new(ctx, &self.device)?.unsqueeze(0)?;
            let out = model.forward(&input, pos)?;
            let seq_len = out.dim(1)?;
            Ok(out.i((0, seq_len - 1))?.to_dtype(DType::F32)?)
        })?;

        decode_reply(&self.tokenizer, &reply)
    }
}

impl TextGenerator for DialogueService {
    fn generate(&self, text: &str, params: &GenerationParams) -> Result<String> {
        let mut lease = self.pool.checkout()?;
        self.run(&mut lease, text, params)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Sampling loop over `step`, which maps (context tokens, position) to the
/// logits of the last position. Returns the reply tokens, stop tokens removed.
fn sample_reply(
    prompt: &[u32],
    params: &GenerationParams,
    stop_tokens: &[u32],
    mut step: impl FnMut(&[u32], usize) -> Result<Tensor>,
) -> Result<Vec<u32>> {
    let mut tokens = prompt.to_vec();
    let prompt_len = tokens.len();
    let budget = new_token_budget(prompt_len, params);
    let seed = params.seed.unwrap_or_else(rand::random);
    let mut lp = build_logits_processor(params, seed);
    let mut pos = 0usize;

    for _ in 0..budget {
        // first step: whole prompt; later: last token only
        let ctx: &[u32] = if pos == 0 {
            &tokens
        } else {
            &tokens[tokens.len() - 1..]
        };

        let mut logits = step(ctx, pos)?;
        pos += ctx.len();

        if (params.repeat_penalty - 1.0).abs() > f32::EPSILON {
            let start = tokens.len().saturating_sub(params.repeat_last_n);
            logits = apply_repeat_penalty(&logits, params.repeat_penalty, &tokens[start..])?;
        }
        // The prompt takes part in the ban as well, so a stop token that follows
        // the message's last token in the template is banned after that token.
        let banned = banned_ngram_tokens(&tokens, params.no_repeat_ngram_size);
        logits = mask_tokens(&logits, &banned)?;

        let next = lp.sample(&logits)?;
        tokens.push(next);

        if stop_tokens.contains(&next) {
            break;
        }
    }

    debug!(
        prompt_tokens = prompt_len,
        new_tokens = tokens.len() - prompt_len,
        "generation finished"
    );

    Ok(tokens[prompt_len..]
        .iter()
        .copied()
        .filter(|t| !stop_tokens.contains(t))
        .collect())
}

fn decode_reply(tokenizer: &Tokenizer, reply: &[u32]) -> Result<String> {
    if reply.is_empty() {
        return Ok(String::new());
    }

    let text = tokenizer
        .decode(reply, true)
        .map_err(|e| anyhow!("tokenizer decode error: {e}"))?;
    Ok(text.trim().to_string())
}

/// Byte-level vocabularies sometimes ship without the byte fallback decoder.
fn check_emoji_round_trip(tokenizer: &Tokenizer) {
    let decoded = tokenizer
        .encode("😊", false)
        .and_then(|enc| tokenizer.decode(enc.get_ids(), false));
    match decoded {
        Ok(text) if text.contains('\u{FFFD}') => {
            warn!("tokenizer emits replacement characters for emoji")
        }
        Ok(text) => debug!("tokenizer emoji test OK: {text}"),
        Err(e) => warn!("tokenizer emoji test failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOCAB: usize = 5;
    const IM_END: u32 = 3;

    const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 3, "content": "<|im_end|>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"hello": 0, "world": 1, "again": 2, "<|im_end|>": 3, "[UNK]": 4},
            "unk_token": "[UNK]"
        }
    }"#;

    fn tokenizer() -> Tokenizer {
        Tokenizer::from_bytes(TOKENIZER_JSON.as_bytes()).unwrap()
    }

    fn greedy() -> GenerationParams {
        GenerationParams {
            do_sample: false,
            no_repeat_ngram_size: 0,
            ..GenerationParams::default()
        }
    }

    fn logits(scores: &[(u32, f32)]) -> Result<Tensor> {
        let mut values = vec![0f32; VOCAB];
        for &(id, score) in scores {
            values[id as usize] = score;
        }
        Ok(Tensor::new(values.as_slice(), &Device::Cpu)?)
    }

    #[test]
    fn stop_after_tokens_decodes_only_the_reply() {
        let script = [1u32, 2, IM_END];
        let mut calls: Vec<(Vec<u32>, usize)> = Vec::new();

        let reply = sample_reply(&[0], &greedy(), &[IM_END], |ctx, pos| {
            calls.push((ctx.to_vec(), pos));
            logits(&[(script[calls.len() - 1], 1.0)])
        })
        .unwrap();

        assert_eq!(reply, vec![1, 2]);
        assert_eq!(
            calls,
            vec![(vec![0], 0), (vec![1], 1), (vec![2], 2)]
        );
        assert_eq!(decode_reply(&tokenizer(), &reply).unwrap(), "world again");
    }

    #[test]
    fn immediate_stop_gives_empty_reply() {
        let reply = sample_reply(&[0, 1], &greedy(), &[IM_END], |_, _| logits(&[(IM_END, 1.0)]))
            .unwrap();

        assert!(reply.is_empty());
        assert_eq!(decode_reply(&tokenizer(), &reply).unwrap(), "");
    }

    #[test]
    fn zero_budget_never_runs_the_model() {
        let params = GenerationParams {
            max_length: 2,
            ..greedy()
        };
        let mut steps = 0;

        let reply = sample_reply(&[0, 1], &params, &[IM_END], |_, _| {
            steps += 1;
            logits(&[(1, 1.0)])
        })
        .unwrap();

        assert_eq!(steps, 0);
        assert!(reply.is_empty());
    }

    #[test]
    fn new_token_cap_ends_reply_without_stop() {
        let params = GenerationParams {
            max_new_tokens: Some(2),
            ..greedy()
        };

        let reply = sample_reply(&[0], &params, &[IM_END], |_, _| logits(&[(1, 1.0)])).unwrap();

        assert_eq!(reply, vec![1, 1]);
    }

    #[test]
    fn ngram_ban_covers_prompt_and_can_block_stop() {
        // prompt "hello <|im_end|>": after the reply emits "hello" again, the
        // bigram (hello, <|im_end|>) is already taken and the stop is banned
        let params = GenerationParams {
            no_repeat_ngram_size: 2,
            ..greedy()
        };
        let script = [
            vec![(0, 10.0)],
            vec![(IM_END, 10.0), (2, 5.0)],
            vec![(IM_END, 10.0)],
        ];
        let mut step = 0;

        let reply = sample_reply(&[0, IM_END], &params, &[IM_END], |_, _| {
            step += 1;
            logits(&script[step - 1])
        })
        .unwrap();

        assert_eq!(reply, vec![0, 2]);
        assert_eq!(step, 3);
    }

    #[test]
    fn decode_skips_special_tokens() {
        assert_eq!(decode_reply(&tokenizer(), &[0, IM_END]).unwrap(), "hello");
    }
}
