//! Architecture configuration for mesh-partitioned transformer checkpoints.
//!
//! Every tensor's logical shape is a pure function of this config plus its
//! layer index, so the config must be fully determined before any shard is
//! read or written. The `compat` tag selects among the structurally
//! different layer graphs of the model families the checkpoint format has
//! been used with; each variant is data (which tensors and biases exist),
//! not a separate code path.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Model family the checkpoint layout is compatible with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compat {
    /// GPT-J style: combined-free QKV, single layer norm, untied output head
    J,
    /// GPT-Neo style: alternating global/local attention, tied embeddings
    Neo,
    /// Fairseq language models (sinusoidal positions, shifted ids)
    Fairseq,
    /// GPT-NeoX style: combined QKV, untied output head
    Neox,
    /// OPT style: learned-position family, tied embeddings
    Opt,
    /// BLOOM style: ALiBi positions, post-embedding layer norm
    Bloom,
}

/// Positional-embedding scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionalEncoding {
    Sinusoidal,
    FairseqSinusoidal,
    Rotary,
    NeoxRotary,
    Alibi,
}

/// Attention pattern for one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionKind {
    Global,
    Local,
}

/// Activation function used in the MLP blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Gelu,
    GeluNew,
    Relu,
    Silu,
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Gelu
    }
}

/// Immutable description of a transformer architecture.
///
/// Loaded from JSON; never mutated after a checkpoint operation begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchConfig {
    /// Model family compatibility tag
    pub compat: Compat,

    /// Number of transformer layers
    pub n_layers: usize,

    /// Model (residual stream) dimension
    pub d_model: usize,

    /// Number of attention heads
    pub n_heads: usize,

    /// Dimension per attention head
    pub d_head: usize,

    /// Vocabulary size before padding
    pub n_vocab: usize,

    /// Extra vocabulary rows added so the embedding splits evenly
    #[serde(default)]
    pub n_vocab_padding: usize,

    /// Per-layer attention kind; defaults per `compat` when absent
    #[serde(default)]
    pub attention_layers: Option<Vec<AttentionKind>>,

    /// Window size for local-attention layers
    #[serde(default = "default_local_attention_window")]
    pub local_attention_window: usize,

    /// Positional-embedding scheme
    pub pe: PositionalEncoding,

    /// Number of rotary dimensions per head (defaults to the full head)
    #[serde(default)]
    pub pe_rotary_dims: Option<usize>,

    /// Fraction of the head dimension that is rotary; overrides
    /// `pe_rotary_dims` when set
    #[serde(default)]
    pub pe_rotary_pct: Option<f32>,

    /// Position-id shift; defaults to 2 for fairseq models, 0 otherwise
    #[serde(default)]
    pub pe_shift: Option<usize>,

    /// MLP activation function
    #[serde(default)]
    pub activation: Activation,

    /// Store Q/K/V as one strided tensor; defaults per `compat` when absent
    #[serde(default)]
    pub combined_qkv: Option<bool>,

    /// NeoX variant that keeps the GPT-J parallel residual
    #[serde(default)]
    pub neox_gpt_j_residual: bool,

    /// Layer norm before attention (pre-LN) rather than after
    #[serde(default = "default_do_layer_norm_before")]
    pub do_layer_norm_before: bool,

    /// Parameter dtype as stored on disk
    #[serde(default = "default_dtype")]
    pub dtype: String,
}

fn default_local_attention_window() -> usize {
    256
}

fn default_do_layer_norm_before() -> bool {
    true
}

fn default_dtype() -> String {
    "f32".to_string()
}

impl ArchConfig {
    /// Load an architecture config from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ArchConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a JSON string (used when the config is embedded in a
    /// checkpoint manifest)
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let config: ArchConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Vocabulary size including padding rows
    pub fn padded_vocab(&self) -> usize {
        self.n_vocab + self.n_vocab_padding
    }

    /// MLP hidden dimension (fixed 4x expansion)
    pub fn d_ffn(&self) -> usize {
        self.d_model * 4
    }

    /// Number of rotary dimensions per head; `pe_rotary_pct` wins over
    /// `pe_rotary_dims` when both are present
    pub fn rotary_dims(&self) -> usize {
        match self.pe_rotary_pct {
            Some(pct) if (0.0..=1.0).contains(&pct) => (pct * self.d_head as f32) as usize,
            _ => self.pe_rotary_dims.unwrap_or(self.d_head),
        }
    }

    /// Position-id shift applied before positional encoding
    pub fn pe_shift(&self) -> usize {
        self.pe_shift
            .unwrap_or(match self.compat {
                Compat::Fairseq => 2,
                _ => 0,
            })
    }

    /// Whether Q/K/V projections are stored as one strided tensor
    pub fn combined_qkv(&self) -> bool {
        self.combined_qkv
            .unwrap_or(matches!(self.compat, Compat::Neox | Compat::Bloom))
    }

    /// Attention kind per layer, falling back to the family default:
    /// GPT-Neo alternates global/local, everything else is all-global
    pub fn attention_layers(&self) -> Vec<AttentionKind> {
        match &self.attention_layers {
            Some(layers) => layers.clone(),
            None => (0..self.n_layers)
                .map(|i| {
                    if self.compat == Compat::Neo && i % 2 == 1 {
                        AttentionKind::Local
                    } else {
                        AttentionKind::Global
                    }
                })
                .collect(),
        }
    }

    /// Whether the QKV projections carry a bias term
    pub fn qkv_bias(&self) -> bool {
        matches!(
            self.compat,
            Compat::Fairseq | Compat::Neox | Compat::Opt | Compat::Bloom
        )
    }

    /// Whether the attention output projection carries a bias term
    pub fn out_proj_bias(&self) -> bool {
        self.compat != Compat::J
    }

    /// Whether the token embedding carries a bias term
    pub fn embed_bias(&self) -> bool {
        self.compat == Compat::J
    }

    /// Whether a second (post-attention) layer norm exists per layer
    pub fn has_mlp_norm(&self) -> bool {
        self.compat != Compat::J
    }

    /// Whether a layer norm follows the token embedding
    pub fn has_embed_norm(&self) -> bool {
        self.compat == Compat::Bloom
    }

    /// Whether a final layer norm precedes the output head
    pub fn has_final_norm(&self) -> bool {
        self.do_layer_norm_before || self.compat != Compat::Opt
    }

    /// Whether a separate (untied) output projection exists; the other
    /// families reuse the embedding table
    pub fn has_lm_head(&self) -> bool {
        matches!(self.compat, Compat::J | Compat::Neox)
    }

    /// Whether the output projection carries a bias term
    pub fn lm_head_bias(&self) -> bool {
        self.compat == Compat::J
    }

    /// Check internal consistency; every checkpoint operation calls this
    /// before touching storage
    pub fn validate(&self) -> crate::Result<()> {
        if self.n_layers == 0 {
            return Err(crate::MeshCkptError::ConfigError(
                "n_layers must be positive".to_string(),
            ));
        }
        if self.d_model != self.n_heads * self.d_head {
            return Err(crate::MeshCkptError::ConfigError(format!(
                "d_model ({}) must equal n_heads * d_head ({} * {})",
                self.d_model, self.n_heads, self.d_head
            )));
        }
        if let Some(layers) = &self.attention_layers {
            if layers.len() != self.n_layers {
                return Err(crate::MeshCkptError::ConfigError(format!(
                    "attention_layers has {} entries for {} layers",
                    layers.len(),
                    self.n_layers
                )));
            }
        }
        if let Some(pct) = self.pe_rotary_pct {
            if !(0.0..=1.0).contains(&pct) {
                return Err(crate::MeshCkptError::ConfigError(format!(
                    "pe_rotary_pct {} outside [0, 1]",
                    pct
                )));
            }
        }
        if self.local_attention_window == 0 {
            return Err(crate::MeshCkptError::ConfigError(
                "local_attention_window must be positive".to_string(),
            ));
        }
        if self.rotary_dims() > self.d_head {
            return Err(crate::MeshCkptError::ConfigError(format!(
                "pe_rotary_dims {} exceeds d_head {}",
                self.rotary_dims(),
                self.d_head
            )));
        }
        Ok(())
    }

    /// Parameter dtype parsed to a candle dtype
    pub fn parsed_dtype(&self) -> candle_core::DType {
        crate::utils::parse_dtype(&self.dtype)
    }
}
