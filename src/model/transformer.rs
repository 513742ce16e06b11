//! Transformer model: embedding prefix, ordered blocks, output head

use crate::calib::{BlockArgs, CalibSample};
use crate::error::{Error, Result};
use crate::model::{Block, Linear};
use crate::tensor::Tensor;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Dimensions of a [`Transformer`]
#[derive(Clone, Copy, Debug)]
pub struct TransformerConfig {
    /// Vocabulary size
    pub vocab: usize,
    /// Hidden dimension
    pub hidden: usize,
    /// MLP inner dimension
    pub mlp_hidden: usize,
    /// Number of blocks
    pub num_blocks: usize,
    /// Maximum sequence length (position table size)
    pub max_seq_len: usize,
}

impl TransformerConfig {
    /// Small configuration for tests and examples
    pub fn tiny(num_blocks: usize) -> Self {
        Self {
            vocab: 32,
            hidden: 8,
            mlp_hidden: 16,
            num_blocks,
            max_seq_len: 16,
        }
    }
}

/// The model: a non-block prefix (embeddings), an ordered block sequence,
/// and an output head
///
/// Block order is fixed and defines the calibration replay order.
#[derive(Clone, Debug)]
pub struct Transformer {
    config: TransformerConfig,
    embed: Tensor,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    head: Linear,
}

impl Transformer {
    /// Random-initialized model from a seed
    pub fn new_seeded(config: TransformerConfig, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);

        let embed: Vec<f32> = (0..config.vocab * config.hidden)
            .map(|_| rng.random_range(-0.5..0.5))
            .collect();
        let pos_embed: Vec<f32> = (0..config.max_seq_len * config.hidden)
            .map(|_| rng.random_range(-0.1..0.1))
            .collect();

        let blocks = (0..config.num_blocks)
            .map(|_| Block::new_seeded(config.hidden, config.mlp_hidden, &mut rng))
            .collect::<Result<Vec<_>>>()?;

        let head_scale = 1.0 / (config.hidden as f32).sqrt();
        let head: Vec<f32> = (0..config.vocab * config.hidden)
            .map(|_| rng.random_range(-head_scale..head_scale))
            .collect();

        Ok(Self {
            config,
            embed: Tensor::from_vec(embed, false),
            pos_embed: Tensor::from_vec(pos_embed, false),
            blocks,
            head: Linear::new(head, config.vocab, config.hidden)?,
        })
    }

    /// Model dimensions
    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Number of blocks
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Block by index
    pub fn block(&self, index: usize) -> &Block {
        &self.blocks[index]
    }

    /// Mutable block by index
    pub fn block_mut(&mut self, index: usize) -> &mut Block {
        &mut self.blocks[index]
    }

    /// All blocks in order
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Run the prefix only, producing the arguments block zero would receive
    ///
    /// This is the capture point: execution stops before the first block, so
    /// no control-flow signal is needed to interrupt a full forward pass.
    pub fn prefix_forward(&self, sample: &CalibSample, sample_idx: usize) -> Result<BlockArgs> {
        let hidden = match sample {
            CalibSample::Tokens(tokens) => self.embed_tokens(tokens, 0, sample_idx)?,
            CalibSample::VisionText { patches, tokens } => {
                if patches.ncols() != self.config.hidden {
                    return Err(Error::Capture {
                        sample: sample_idx,
                        reason: format!(
                            "patch features have dim {}, model hidden is {}",
                            patches.ncols(),
                            self.config.hidden
                        ),
                    });
                }
                let text = self.embed_tokens(tokens, patches.nrows(), sample_idx)?;
                let mut fused =
                    Array2::zeros((patches.nrows() + text.nrows(), self.config.hidden));
                fused
                    .slice_mut(ndarray::s![..patches.nrows(), ..])
                    .assign(patches);
                fused
                    .slice_mut(ndarray::s![patches.nrows().., ..])
                    .assign(&text);
                fused
            }
        };

        if hidden.nrows() == 0 {
            return Err(Error::Capture {
                sample: sample_idx,
                reason: "empty sample".into(),
            });
        }
        if hidden.nrows() > self.config.max_seq_len {
            return Err(Error::Capture {
                sample: sample_idx,
                reason: format!(
                    "sequence length {} exceeds maximum {}",
                    hidden.nrows(),
                    self.config.max_seq_len
                ),
            });
        }

        Ok(BlockArgs::causal(hidden))
    }

    /// Full forward pass: prefix, every block, output head
    ///
    /// Returns logits, seq_len × vocab.
    pub fn forward_sample(&self, sample: &CalibSample) -> Result<Array2<f32>> {
        let mut args = self.prefix_forward(sample, 0)?;
        for block in &self.blocks {
            let out = block.forward(&args)?;
            args = args.with_hidden(out);
        }
        self.head.forward(&args.hidden.view())
    }

    /// Every weight tensor with its name and shape, in a stable order
    ///
    /// Packed sub-modules are dequantized to f32 here; the on-disk metadata
    /// records the deployment mode they were saved under.
    pub fn named_tensors(&self) -> Vec<(String, Vec<f32>, Vec<usize>)> {
        let c = &self.config;
        let mut out = vec![
            (
                "embed.weight".to_string(),
                self.embed.data().to_vec(),
                vec![c.vocab, c.hidden],
            ),
            (
                "pos_embed.weight".to_string(),
                self.pos_embed.data().to_vec(),
                vec![c.max_seq_len, c.hidden],
            ),
        ];
        for (i, block) in self.blocks.iter().enumerate() {
            for (name, module) in block.sub_modules() {
                let (rows, cols) = module.shape();
                out.push((
                    format!("blocks.{i}.{name}.weight"),
                    module.weight_values(),
                    vec![rows, cols],
                ));
            }
        }
        out.push((
            "head.weight".to_string(),
            self.head.weight_values(),
            vec![c.vocab, c.hidden],
        ));
        out
    }

    fn embed_tokens(
        &self,
        tokens: &[u32],
        pos_offset: usize,
        sample_idx: usize,
    ) -> Result<Array2<f32>> {
        let d = self.config.hidden;
        let mut out = Array2::zeros((tokens.len(), d));
        for (i, &tok) in tokens.iter().enumerate() {
            let tok = tok as usize;
            if tok >= self.config.vocab {
                return Err(Error::Capture {
                    sample: sample_idx,
                    reason: format!(
                        "token id {tok} out of vocabulary (size {})",
                        self.config.vocab
                    ),
                });
            }
            let pos = pos_offset + i;
            if pos >= self.config.max_seq_len {
                return Err(Error::Capture {
                    sample: sample_idx,
                    reason: format!(
                        "position {pos} exceeds maximum sequence length {}",
                        self.config.max_seq_len
                    ),
                });
            }
            for j in 0..d {
                out[[i, j]] =
                    self.embed.data()[tok * d + j] + self.pos_embed.data()[pos * d + j];
            }
        }
        Ok(out)
    }
}
