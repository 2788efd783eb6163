//! Cache configuration and pool sizing.

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type stored in the K/V block tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheDtype {
    /// 16-bit IEEE float (typical for GPU inference).
    #[default]
    F16,
    /// bfloat16.
    Bf16,
    /// 32-bit float (CPU fallback).
    F32,
}

impl CacheDtype {
    pub fn as_dtype(&self) -> DType {
        match self {
            CacheDtype::F16 => DType::F16,
            CacheDtype::Bf16 => DType::BF16,
            CacheDtype::F32 => DType::F32,
        }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.as_dtype().size_in_bytes()
    }
}

/// Configuration for the paged KV cache.
///
/// All fields are immutable for the manager's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Number of transformer layers holding K/V state.
    pub num_layers: usize,

    /// Tokens stored per block.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Number of KV heads (for GQA this is the smaller head count).
    pub num_kv_heads: usize,

    /// Dimension of each attention head.
    pub head_size: usize,

    /// Element type of the K/V tensors.
    #[serde(default)]
    pub dtype: CacheDtype,

    /// Explicit pool size in blocks. When unset, the count is derived
    /// from available device memory and `gpu_utilization`.
    #[serde(default)]
    pub num_blocks: Option<usize>,

    /// Fraction of available device memory granted to the pool.
    #[serde(default = "default_gpu_utilization")]
    pub gpu_utilization: f32,
}

fn default_block_size() -> usize {
    16
}
fn default_gpu_utilization() -> f32 {
    0.3
}

impl CacheOptions {
    /// Options with default block size, dtype, and utilization factor.
    pub fn new(num_layers: usize, num_kv_heads: usize, head_size: usize) -> Self {
        Self {
            num_layers,
            block_size: default_block_size(),
            num_kv_heads,
            head_size,
            dtype: CacheDtype::default(),
            num_blocks: None,
            gpu_utilization: default_gpu_utilization(),
        }
    }

    /// Elements stored per slot: one token's K (or V) vectors at one layer.
    pub fn slot_width(&self) -> usize {
        self.num_kv_heads * self.head_size
    }

    /// Bytes one block occupies across all layers, K and V included.
    pub fn bytes_per_block(&self) -> Result<usize> {
        let slot_bytes = self
            .num_kv_heads
            .checked_mul(self.head_size)
            .and_then(|w| w.checked_mul(self.dtype.size_in_bytes()))
            .ok_or_else(|| {
                Error::Configuration("slot footprint overflows device addressing".to_string())
            })?;
        slot_bytes
            .checked_mul(self.block_size)
            .and_then(|b| b.checked_mul(self.num_layers))
            .and_then(|b| b.checked_mul(2))
            .ok_or_else(|| {
                Error::Configuration("block footprint overflows device addressing".to_string())
            })
    }

    /// Blocks needed to hold `num_tokens` tokens.
    pub fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        (num_tokens + self.block_size - 1) / self.block_size
    }

    /// Total K/V storage for a pool of `num_blocks` blocks.
    pub fn total_memory_bytes(&self, num_blocks: usize) -> Result<usize> {
        self.bytes_per_block()?.checked_mul(num_blocks).ok_or_else(|| {
            Error::Configuration("pool footprint overflows device addressing".to_string())
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(Error::Configuration(
                "num_layers must be greater than zero".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(Error::Configuration(
                "block_size must be greater than zero".to_string(),
            ));
        }
        if self.num_kv_heads == 0 || self.head_size == 0 {
            return Err(Error::Configuration(
                "num_kv_heads and head_size must be greater than zero".to_string(),
            ));
        }
        if !(self.gpu_utilization > 0.0 && self.gpu_utilization <= 1.0) {
            return Err(Error::Configuration(format!(
                "gpu_utilization must be in (0, 1], got {}",
                self.gpu_utilization
            )));
        }
        if self.num_blocks == Some(0) {
            return Err(Error::Configuration(
                "num_blocks must be greater than zero".to_string(),
            ));
        }
        self.bytes_per_block()?;
        Ok(())
    }

    /// Resolve the pool size: an explicit `num_blocks` wins, otherwise
    /// the utilization share of `available_bytes` divided by the
    /// per-block footprint.
    pub fn resolve_num_blocks(&self, available_bytes: Option<u64>) -> Result<usize> {
        self.validate()?;
        if let Some(num_blocks) = self.num_blocks {
            return Ok(num_blocks);
        }
        let available = available_bytes.ok_or_else(|| {
            Error::Configuration(
                "available device memory is unknown; set num_blocks explicitly".to_string(),
            )
        })?;
        let budget = (available as f64 * self.gpu_utilization as f64) as u64;
        let per_block = self.bytes_per_block()? as u64;
        let derived = (budget / per_block) as usize;
        if derived == 0 {
            return Err(Error::Configuration(format!(
                "memory budget of {} bytes cannot hold a single {}-byte block",
                budget, per_block
            )));
        }
        Ok(derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CacheOptions {
        CacheOptions {
            num_layers: 24,
            block_size: 16,
            num_kv_heads: 8,
            head_size: 128,
            dtype: CacheDtype::F16,
            num_blocks: None,
            gpu_utilization: 0.3,
        }
    }

    #[test]
    fn test_bytes_per_block() {
        // 2 * 24 layers * 16 slots * 8 heads * 128 dim * 2 bytes
        assert_eq!(options().bytes_per_block().unwrap(), 2 * 24 * 16 * 8 * 128 * 2);
    }

    #[test]
    fn test_blocks_for_tokens_rounds_up() {
        let opts = options();
        assert_eq!(opts.blocks_for_tokens(0), 0);
        assert_eq!(opts.blocks_for_tokens(1), 1);
        assert_eq!(opts.blocks_for_tokens(16), 1);
        assert_eq!(opts.blocks_for_tokens(17), 2);
    }

    #[test]
    fn test_resolve_prefers_explicit_count() {
        let mut opts = options();
        opts.num_blocks = Some(42);
        assert_eq!(opts.resolve_num_blocks(None).unwrap(), 42);
    }

    #[test]
    fn test_resolve_derives_from_budget() {
        let mut opts = options();
        opts.gpu_utilization = 0.5;
        let per_block = opts.bytes_per_block().unwrap() as u64;
        // Budget for exactly 10.5 blocks floors to 10.
        let available = per_block * 21;
        assert_eq!(opts.resolve_num_blocks(Some(available)).unwrap(), 10);
    }

    #[test]
    fn test_resolve_rejects_zero_capacity() {
        let opts = options();
        let err = opts.resolve_num_blocks(Some(1)).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_resolve_requires_memory_probe_or_explicit_count() {
        let opts = options();
        assert!(matches!(
            opts.resolve_num_blocks(None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_utilization() {
        let mut opts = options();
        opts.gpu_utilization = 0.0;
        assert!(opts.validate().is_err());
        opts.gpu_utilization = 1.5;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_dims() {
        for field in 0..4 {
            let mut opts = options();
            match field {
                0 => opts.num_layers = 0,
                1 => opts.block_size = 0,
                2 => opts.num_kv_heads = 0,
                _ => opts.head_size = 0,
            }
            assert!(opts.validate().is_err());
        }
    }

    #[test]
    fn test_validate_rejects_overflowing_footprint() {
        let mut opts = options();
        opts.num_kv_heads = usize::MAX / 2;
        opts.head_size = 4;
        assert!(matches!(opts.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_serde_fills_defaults() {
        let opts: CacheOptions =
            serde_json::from_str(r#"{"num_layers": 12, "num_kv_heads": 4, "head_size": 64}"#)
                .unwrap();
        assert_eq!(opts.block_size, 16);
        assert_eq!(opts.dtype, CacheDtype::F16);
        assert_eq!(opts.num_blocks, None);
        assert!((opts.gpu_utilization - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(CacheDtype::F16.size_in_bytes(), 2);
        assert_eq!(CacheDtype::Bf16.size_in_bytes(), 2);
        assert_eq!(CacheDtype::F32.size_in_bytes(), 4);
    }
}
