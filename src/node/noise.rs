//! Gaussian noise node (spec.md §4.6: "Gaussian noise on distance/angle").
//!
//! WGSL has no RNG primitive in this stack, so noise is sampled host-side
//! with `rand_distr::Normal` after a blocking readback, then written back to
//! a fresh device array — the same `read_to_vec`/`write_from_slice` round
//! trip `transform.rs` uses, just with a sampled perturbation instead of a
//! fixed multiply.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

use crate::array::Array;
use crate::error::{NodeError, SimError};
use crate::field::Field;
use crate::node::{
    find_predecessor, require_input, Capabilities, EnqueueEnv, FieldBuffer, NodeId, NodeKind,
    OutputStore, PredecessorView,
};

#[derive(Clone, Copy, Debug)]
pub struct GaussianNoiseParams {
    pub distance_stddev: f32,
    pub azimuth_stddev: f32,
    pub elevation_stddev: f32,
    pub seed: u64,
}

impl Default for GaussianNoiseParams {
    fn default() -> Self {
        Self { distance_stddev: 0.0, azimuth_stddev: 0.0, elevation_stddev: 0.0, seed: 0 }
    }
}

/// Adds independent Gaussian noise to `Distance`/`Azimuth`/`Elevation`,
/// passing every other field it receives through unchanged. A stddev of
/// `0.0` for a field is a no-op pass-through for that field, so one node
/// covers "noise on distance only", "noise on angle only", or both.
pub struct GaussianNoiseNode {
    input: NodeId,
    params: GaussianNoiseParams,
    outputs: OutputStore,
    width: usize,
}

impl GaussianNoiseNode {
    pub fn new(input: NodeId, params: GaussianNoiseParams) -> Self {
        Self { input, params, outputs: OutputStore::default(), width: 0 }
    }

    pub fn set_params(&mut self, params: GaussianNoiseParams) {
        self.params = params;
    }

    fn perturb(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        buf: &Arc<FieldBuffer>,
        field: Field,
        stddev: f32,
        rng: &mut StdRng,
    ) -> Result<FieldBuffer, NodeError> {
        let arr = buf.as_scalar().ok_or(NodeError::FieldTypeMismatch {
            node: "gaussian_noise".to_string(),
            field,
        })?;
        let mut values = arr.read_to_vec(device, queue);
        if stddev > 0.0 {
            if let Ok(dist) = Normal::new(0.0f32, stddev) {
                for v in values.iter_mut() {
                    *v += dist.sample(rng);
                }
            }
        }
        let mut out = Array::new_device(device, field, values.len());
        out.write_from_slice(queue, &values);
        Ok(FieldBuffer::Scalar(out))
    }
}

impl NodeKind for GaussianNoiseNode {
    fn name(&self) -> &str {
        "gaussian_noise"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { accepts_points: true, produces_points: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[Field::Distance]
    }

    fn produced_fields(&self) -> Vec<Field> {
        Field::POINT_FIELDS.to_vec()
    }

    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        let pred = find_predecessor(predecessors, self.input)
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        if !pred.produced_fields.contains(&Field::Distance) {
            return Err(NodeError::FieldTypeMismatch { node: self.name().to_string(), field: Field::Distance });
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        self.outputs.clear();
        let mut rng = StdRng::seed_from_u64(self.params.seed);

        let distance_buf = require_input(env.inputs, self.input, Field::Distance, self.name())?.clone();
        self.width = distance_buf.count();
        let noisy_distance = Self::perturb(
            env.device,
            env.queue,
            &distance_buf,
            Field::Distance,
            self.params.distance_stddev,
            &mut rng,
        )?;
        self.outputs.set(Field::Distance, noisy_distance);

        for (field, stddev) in [
            (Field::Azimuth, self.params.azimuth_stddev),
            (Field::Elevation, self.params.elevation_stddev),
        ] {
            if let Some(buf) = env.inputs.get(&self.input).and_then(|m| m.get(&field)) {
                let noisy = Self::perturb(env.device, env.queue, buf, field, stddev, &mut rng)?;
                self.outputs.set(field, noisy);
            }
        }

        if let Some(inputs) = env.inputs.get(&self.input) {
            for (&field, buf) in inputs.iter() {
                if matches!(field, Field::Distance | Field::Azimuth | Field::Elevation) {
                    continue;
                }
                self.outputs.set_arc(field, buf.clone());
            }
        }
        Ok(())
    }

    fn width(&self) -> usize {
        self.width
    }

    fn output_fields(&self) -> Vec<Field> {
        self.outputs.fields()
    }

    fn output(&self, field: Field) -> Option<Arc<FieldBuffer>> {
        self.outputs.get(field)
    }

    fn get_field_data(
        &mut self,
        field: Field,
        _device: &wgpu::Device,
        _queue: &wgpu::Queue,
    ) -> Result<Arc<FieldBuffer>, NodeError> {
        self.outputs.get(field).ok_or_else(|| NodeError::MissingInput(self.name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_stddev_params_are_the_default() {
        let params = GaussianNoiseParams::default();
        assert_eq!(params.distance_stddev, 0.0);
        assert_eq!(params.azimuth_stddev, 0.0);
        assert_eq!(params.elevation_stddev, 0.0);
    }

    #[test]
    fn validate_requires_distance_from_predecessor() {
        let mut node = GaussianNoiseNode::new(NodeId(0), GaussianNoiseParams::default());
        let preds = vec![PredecessorView {
            id: NodeId(0),
            capabilities: Capabilities::default(),
            produced_fields: &[Field::Xyz],
            width: 0,
        }];
        assert!(node.validate(&preds).is_err());
    }
}
