use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{Args, CaatError};

/// One identity to protect, with the class it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub instance_prompt: String,
    #[serde(default)]
    pub class_prompt: Option<String>,
    pub instance_data_dir: PathBuf,
    #[serde(default)]
    pub class_data_dir: Option<PathBuf>,
}

pub fn load_concepts<P: AsRef<Path>>(path: P) -> Result<Vec<Concept>> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading concepts list {}", path.display()))?;
    let concepts: Vec<Concept> = serde_json::from_str(&data)
        .with_context(|| format!("parsing concepts list {}", path.display()))?;
    if concepts.is_empty() {
        anyhow::bail!(CaatError::Config(format!(
            "concepts list {} is empty",
            path.display()
        )))
    }
    Ok(concepts)
}

/// The concepts list file when given, otherwise the single concept described
/// by the instance/class flags.
pub fn concepts_from_args(args: &Args) -> Result<Vec<Concept>> {
    if let Some(path) = &args.concepts_list {
        return load_concepts(path);
    }
    let instance_prompt = args
        .instance_prompt
        .clone()
        .ok_or(CaatError::String("missing instance prompt"))?;
    let instance_data_dir = args
        .instance_data_dir
        .clone()
        .ok_or(CaatError::String("missing instance data directory"))?;
    Ok(vec![Concept {
        instance_prompt,
        class_prompt: args.class_prompt.clone(),
        instance_data_dir,
        class_data_dir: args.class_data_dir.clone(),
    }])
}
