use candle::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};

use crate::config::GenerationParams;

/// End-of-turn markers across the chat vocabularies we load.
pub const STOP_TOKEN_CANDIDATES: &[&str] = &["<|im_end|>", "<|endoftext|>", "</s>", "<eos>"];

pub fn stop_token_ids(lookup: impl Fn(&str) -> Option<u32>) -> Vec<u32> {
    let mut ids = Vec::new();
    for token in STOP_TOKEN_CANDIDATES {
        if let Some(id) = lookup(token) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

pub fn build_logits_processor(params: &GenerationParams, seed: u64) -> LogitsProcessor {
    let sampling = if params.do_sample {
        Sampling::TopKThenTopP {
            k: params.top_k,
            p: params.top_p,
            temperature: params.temperature,
        }
    } else {
        Sampling::ArgMax
    };
    LogitsProcessor::from_sampling(seed, sampling)
}

/// How many tokens may still be generated after a prompt of `prompt_len`.
pub fn new_token_budget(prompt_len: usize, params: &GenerationParams) -> usize {
    let by_length = params.max_length.saturating_sub(prompt_len);
    match params.max_new_tokens {
        Some(cap) => by_length.min(cap),
        None => by_length,
    }
}

/// Tokens that would complete an n-gram of size `n` already present in `tokens`.
pub fn banned_ngram_tokens(tokens: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || tokens.len() < n {
        return Vec::new();
    }

    let prefix = &tokens[tokens.len() + 1 - n..];
    let mut banned = Vec::new();
    for window in tokens.windows(n) {
        let (head, last) = window.split_at(n - 1);
        if head == prefix && !banned.contains(&last[0]) {
            banned.push(last[0]);
        }
    }
    banned
}

/// Push banned token logits to -inf.
pub fn mask_tokens(logits: &Tensor, banned: &[u32]) -> candle::Result<Tensor> {
    if banned.is_empty() {
        return Ok(logits.clone());
    }

    let mut values = logits.to_vec1::<f32>()?;
    for &id in banned {
        if let Some(v) = values.get_mut(id as usize) {
            *v = f32::NEG_INFINITY;
        }
    }
    Tensor::new(values.as_slice(), logits.device())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;
    use std::collections::HashMap;

    #[test]
    fn bigram_ban_blocks_repeat_of_last_token_pair() {
        // "a b c a" -> the bigram (a, b) exists, so b is banned after a
        let tokens = [1, 2, 3, 1];
        assert_eq!(banned_ngram_tokens(&tokens, 2), vec![2]);
    }

    #[test]
    fn trigram_ban_requires_matching_prefix() {
        let tokens = [1, 2, 3, 4, 1, 2];
        assert_eq!(banned_ngram_tokens(&tokens, 3), vec![3]);
        assert!(banned_ngram_tokens(&[1, 2, 3, 4, 2, 1], 3).is_empty());
    }

    #[test]
    fn unigram_ban_blocks_every_seen_token() {
        assert_eq!(banned_ngram_tokens(&[5, 6, 5, 7], 1), vec![5, 6, 7]);
    }

    #[test]
    fn short_sequences_and_zero_size_ban_nothing() {
        assert!(banned_ngram_tokens(&[1], 2).is_empty());
        assert!(banned_ngram_tokens(&[1, 1, 1], 0).is_empty());
        assert!(banned_ngram_tokens(&[], 2).is_empty());
    }

    #[test]
    fn mask_sets_banned_logits_to_negative_infinity() {
        let logits = Tensor::new(&[0.5f32, 1.5, 2.5, 3.5], &Device::Cpu).unwrap();
        let masked = mask_tokens(&logits, &[1, 3, 99]).unwrap();
        let values = masked.to_vec1::<f32>().unwrap();
        assert_eq!(values[0], 0.5);
        assert_eq!(values[1], f32::NEG_INFINITY);
        assert_eq!(values[2], 2.5);
        assert_eq!(values[3], f32::NEG_INFINITY);
    }

    #[test]
    fn greedy_sampler_picks_argmax_after_mask() {
        let params = GenerationParams {
            do_sample: false,
            ..GenerationParams::default()
        };
        let mut lp = build_logits_processor(&params, 7);
        let logits = Tensor::new(&[0.1f32, 9.0, 3.0], &Device::Cpu).unwrap();
        let masked = mask_tokens(&logits, &[1]).unwrap();
        assert_eq!(lp.sample(&masked).unwrap(), 2);
    }

    #[test]
    fn budget_respects_total_length_and_new_token_cap() {
        let mut params = GenerationParams::default();
        assert_eq!(new_token_budget(10, &params), 990);
        assert_eq!(new_token_budget(1200, &params), 0);
        params.max_new_tokens = Some(64);
        assert_eq!(new_token_budget(10, &params), 64);
    }

    #[test]
    fn stop_tokens_come_from_vocabulary() {
        let vocab: HashMap<&str, u32> = [("<|im_end|>", 151645), ("<|endoftext|>", 151643)]
            .into_iter()
            .collect();
        let ids = stop_token_ids(|t| vocab.get(t).copied());
        assert_eq!(ids, vec![151645, 151643]);
        assert!(stop_token_ids(|_| None).is_empty());
    }
}
