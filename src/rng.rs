use rten_tensor::prelude::*;
use rten_tensor::rng::XorShiftRng;
use rten_tensor::Tensor;

/// Seeded source of untrained weights and example token IDs.
pub struct WeightRng {
    rng: XorShiftRng,
}

impl WeightRng {
    pub fn new(seed: u64) -> WeightRng {
        // A zero state would only ever produce zeros.
        WeightRng {
            rng: XorShiftRng::new(seed.max(1)),
        }
    }

    /// Create a tensor filled with values in `[-scale, scale]`.
    pub fn tensor(&mut self, shape: &[usize], scale: f32) -> Tensor<f32> {
        Tensor::<f32>::rand(shape, &mut self.rng).map(|x| (x * 2. - 1.) * scale)
    }

    /// Create a tensor of token IDs in `[0, vocab_size)`.
    pub fn ids(&mut self, shape: &[usize], vocab_size: usize) -> Tensor<i32> {
        let len = shape.iter().product();
        let high = vocab_size.clamp(1, i32::MAX as usize) as u64;
        let data: Vec<i32> = (0..len)
            .map(|_| (self.rng.next_u64() % high) as i32)
            .collect();
        Tensor::from_data(shape, data)
    }
}
