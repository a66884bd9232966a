//! Synthetic token and KV tensor generation for benchmarks and tests.
//!
//! Every generator takes its RNG explicitly so runs are reproducible from a
//! seed and nothing touches global random state.

use half::f16;
use rand::Rng;

use crate::cache::codec::{CodecError, DType, KvLayout, LayerTensorPair, Tensor};
use crate::cache::hashing::TokenId;
use crate::config::ModelConfig;

/// Exclusive upper bound of synthetic token ids.
pub const VOCAB_SIZE: TokenId = 10_000;

/// `num_tokens` token ids drawn uniformly from `[0, VOCAB_SIZE)`.
pub fn generate_tokens<R: Rng + ?Sized>(rng: &mut R, num_tokens: usize) -> Vec<TokenId> {
    (0..num_tokens).map(|_| rng.gen_range(0..VOCAB_SIZE)).collect()
}

/// Random K/V tensors for every layer of `model`, values uniform in `[0, 1)`.
///
/// The dtype follows the layout: f16 for vllm, f32 for huggingface.
pub fn generate_kv_cache<R: Rng + ?Sized>(
    rng: &mut R,
    num_tokens: usize,
    model: &ModelConfig,
    layout: KvLayout,
) -> Result<Vec<LayerTensorPair>, CodecError> {
    let shape = layout.layer_shape(num_tokens, model.num_kv_heads, model.head_size);
    let dtype = layout.default_dtype();
    (0..model.num_layers)
        .map(|_| {
            Ok(LayerTensorPair {
                key: random_tensor(rng, &shape, dtype)?,
                value: random_tensor(rng, &shape, dtype)?,
            })
        })
        .collect()
}

fn random_tensor<R: Rng + ?Sized>(rng: &mut R, shape: &[usize], dtype: DType) -> Result<Tensor, CodecError> {
    let n: usize = shape.iter().product();
    match dtype {
        DType::F16 => {
            let values: Vec<f16> = (0..n).map(|_| f16::from_f32(rng.gen::<f32>())).collect();
            Tensor::from_f16(shape.to_vec(), &values)
        }
        DType::F32 => {
            let values: Vec<f32> = (0..n).map(|_| rng.gen::<f32>()).collect();
            Tensor::from_f32(shape.to_vec(), &values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_model() -> ModelConfig {
        ModelConfig {
            num_layers: 3,
            num_kv_heads: 2,
            head_size: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_tokens_in_vocab_range() {
        let mut rng = StdRng::seed_from_u64(1);
        let tokens = generate_tokens(&mut rng, 1000);
        assert_eq!(tokens.len(), 1000);
        assert!(tokens.iter().all(|&t| (0..VOCAB_SIZE).contains(&t)));
    }

    #[test]
    fn test_same_seed_same_data() {
        let model = small_model();
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        assert_eq!(generate_tokens(&mut a, 64), generate_tokens(&mut b, 64));
        assert_eq!(
            generate_kv_cache(&mut a, 5, &model, KvLayout::Vllm).unwrap(),
            generate_kv_cache(&mut b, 5, &model, KvLayout::Vllm).unwrap()
        );
    }

    #[test]
    fn test_kv_shapes_follow_layout() {
        let model = small_model();
        let mut rng = StdRng::seed_from_u64(3);

        let vllm = generate_kv_cache(&mut rng, 5, &model, KvLayout::Vllm).unwrap();
        assert_eq!(vllm.len(), 3);
        assert_eq!(vllm[0].key.shape(), &[5, 2, 4]);
        assert_eq!(vllm[0].key.dtype(), DType::F16);

        let hf = generate_kv_cache(&mut rng, 5, &model, KvLayout::HuggingFace).unwrap();
        assert_eq!(hf[2].value.shape(), &[2, 5, 4]);
        assert_eq!(hf[2].value.dtype(), DType::F32);
    }
}
