use anyhow::{anyhow, Context, Result};
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ModelConfig;

const TOKENIZER_FILE: &str = "tokenizer.json";
const CONFIG_FILE: &str = "config.json";
const INDEX_FILE: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";

/// On-disk locations of everything needed to build the model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub tokenizer: PathBuf,
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    pub fn resolve(cfg: &ModelConfig) -> Result<Self> {
        match &cfg.model_dir {
            Some(dir) => Self::from_snapshot(dir),
            None => Self::from_hub(&cfg.model_id, &cfg.revision, cfg.hf_token.clone()),
        }
    }

    /// A local snapshot laid out the way the hub stores it.
    pub fn from_snapshot(snapshot_dir: &Path) -> Result<Self> {
        info!("loading model snapshot from {}", snapshot_dir.display());

        let tokenizer = require(snapshot_dir.join(TOKENIZER_FILE))?;
        let config = require(snapshot_dir.join(CONFIG_FILE))?;

        let index_path = snapshot_dir.join(INDEX_FILE);
        let weights = if index_path.exists() {
            shard_names(&read_json(&index_path)?)?
                .into_iter()
                .map(|name| require(snapshot_dir.join(name)))
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![require(snapshot_dir.join(SINGLE_WEIGHTS_FILE))?]
        };

        Ok(Self {
            tokenizer,
            config,
            weights,
        })
    }

    pub fn from_hub(model_id: &str, revision: &str, token: Option<String>) -> Result<Self> {
        info!("fetching {model_id}@{revision} from the Hugging Face hub");

        let api = ApiBuilder::new()
            .with_token(token)
            .with_progress(false)
            .build()
            .context("failed to build hub client")?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));

        let tokenizer = fetch(&repo, model_id, TOKENIZER_FILE)?;
        let config = fetch(&repo, model_id, CONFIG_FILE)?;
        let weights = match repo.get(INDEX_FILE) {
            Ok(index_path) => shard_names(&read_json(&index_path)?)?
                .iter()
                .map(|name| fetch(&repo, model_id, name))
                .collect::<Result<Vec<_>>>()?,
            Err(_) => vec![fetch(&repo, model_id, SINGLE_WEIGHTS_FILE)?],
        };

        Ok(Self {
            tokenizer,
            config,
            weights,
        })
    }
}

/// Distinct shard file names referenced by a safetensors index, in stable order.
pub fn shard_names(index_json: &serde_json::Value) -> Result<Vec<String>> {
    let map = index_json["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("{INDEX_FILE}: weight_map is not an object"))?;

    let names = map
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("invalid shard entry in {INDEX_FILE}"))
        })
        .collect::<Result<BTreeSet<_>>>()?;

    if names.is_empty() {
        return Err(anyhow!("{INDEX_FILE} lists no shards"));
    }
    Ok(names.into_iter().collect())
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

fn require(path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(anyhow!("{} not found", path.display()))
    }
}

fn fetch(repo: &ApiRepo, model_id: &str, file: &str) -> Result<PathBuf> {
    repo.get(file)
        .with_context(|| format!("failed to fetch {file} for {model_id}"))
}
