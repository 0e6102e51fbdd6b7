//! Noise prediction with the denoising `UNet`.

use ndarray::{Array1, Ix4};
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{Tensor, ValueType};

use crate::error::{Error, Result};

use super::onnx::{extract_array, missing_output};
use super::text::Embedding;
use super::vae::LatentTensor;

/// Predicts the noise in a latent sample at a timestep under a text conditioning.
pub trait NoisePredictor {
    /// Predict noise for `sample` (NCHW) at `timestep`.
    ///
    /// The output always has 4 latent channels, whatever the input channel count.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn predict_noise(
        &mut self,
        sample: &LatentTensor,
        timestep: f64,
        embedding: &Embedding,
    ) -> Result<LatentTensor>;
}

/// `UNet` running as an ONNX session.
///
/// Works for both the 4-channel text-to-image `UNet` and the 9-channel
/// inpainting `UNet`; the graph decides what it accepts.
pub struct OnnxUnet {
    session: Session,
    float_timestep: bool,
}

impl OnnxUnet {
    /// Wrap a loaded session, detecting the timestep input type.
    #[must_use]
    pub fn new(session: Session) -> Self {
        let float_timestep = session
            .inputs
            .iter()
            .find(|input| input.name == "timestep")
            .is_some_and(|input| {
                matches!(
                    input.input_type,
                    ValueType::Tensor {
                        ty: TensorElementType::Float32,
                        ..
                    }
                )
            });

        tracing::debug!(
            "UNet timestep input is {}",
            if float_timestep { "float32" } else { "int64" }
        );

        Self {
            session,
            float_timestep,
        }
    }
}

impl NoisePredictor for OnnxUnet {
    #[allow(clippy::cast_possible_truncation)]
    fn predict_noise(
        &mut self,
        sample: &LatentTensor,
        timestep: f64,
        embedding: &Embedding,
    ) -> Result<LatentTensor> {
        let sample_value =
            Tensor::from_array(sample.clone()).map_err(|source| Error::Inference { source })?;
        let hidden_value =
            Tensor::from_array(embedding.clone()).map_err(|source| Error::Inference { source })?;

        let outputs = if self.float_timestep {
            let timestep_value = Tensor::from_array(Array1::from_vec(vec![timestep as f32]))
                .map_err(|source| Error::Inference { source })?;
            self.session.run(ort::inputs![
                "sample" => sample_value,
                "timestep" => timestep_value,
                "encoder_hidden_states" => hidden_value,
            ])
        } else {
            let timestep_value = Tensor::from_array(Array1::from_vec(vec![timestep.round() as i64]))
                .map_err(|source| Error::Inference { source })?;
            self.session.run(ort::inputs![
                "sample" => sample_value,
                "timestep" => timestep_value,
                "encoder_hidden_states" => hidden_value,
            ])
        }
        .map_err(|source| Error::Inference { source })?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| missing_output("noise prediction"))?;

        extract_array::<Ix4>(&output)
    }
}
