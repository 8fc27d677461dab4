//! Numeric kernels shared by the reference simulator and the fused kernel
//!
//! ## Modules
//!
//! - `simd` - dot products, matmul, activations, softmax
//! - `norm` - layer normalization
//! - `attention` - scaled dot-product attention, row and tensor level
//! - `kv_cache` - packed per-layer key/value cache

mod attention;
mod kv_cache;
mod norm;
mod simd;

pub use attention::{
    attention_scale, attention_weights, scaled_dot_product_attention, weighted_values,
    AttentionDropout,
};
pub use kv_cache::{max_seq_len_for, CacheMode, KvCache, CACHE_BLOCK};
pub use norm::{layer_norm_rows, simd_layer_norm};
pub use simd::{simd_dot, simd_gelu, simd_gelu_tanh, simd_relu, simd_softmax};
