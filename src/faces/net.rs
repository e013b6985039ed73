//! Face embedding network.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;

use super::embedding::{Embedding, Embeddings};
use super::engine::onnx::load_session;
use crate::config::EmbeddingConfig;

/// Turns a face crop into embeddings.
pub trait FaceEmbedder: Send + Sync {
    /// Edge length of the square crop the model expects.
    fn input_size(&self) -> u32;

    fn embed(&self, crop: &DynamicImage) -> Result<Embeddings>;
}

/// Computes embeddings for face crops with an ONNX model.
pub struct EmbeddingModel {
    model_path: PathBuf,
    input_size: u32,
    channels_last: bool,
    mirror: bool,
    threads: usize,
    session: Mutex<Option<Session>>,
}

impl EmbeddingModel {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model_path: config.model_path.clone(),
            input_size: config.input_size,
            channels_last: config.channels_last,
            mirror: config.mirror,
            threads: config.threads,
            session: Mutex::new(None),
        }
    }

    /// Run the model on a batch of crops, loading it on first use.
    fn infer(&self, crops: &[RgbImage]) -> Result<Vec<f32>> {
        // Concurrent callers wait here while the first one loads the model.
        let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(load_session(&self.model_path, self.threads)?);
        }
        let session = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Embedding model not initialized"))?;

        let input = to_tensor(crops, self.channels_last);
        let shape = input.shape().to_vec();
        let (data, _) = input.into_raw_vec_and_offset();
        let tensor = Tensor::from_array(([shape[0], shape[1], shape[2], shape[3]], data.into_boxed_slice()))?;

        let outputs = session.run(ort::inputs![tensor])?;
        if outputs.len() == 0 {
            return Err(anyhow!("No embedding output"));
        }
        let (_, values) = outputs[0].try_extract_tensor::<f32>()?;

        Ok(values.to_vec())
    }
}

impl FaceEmbedder for EmbeddingModel {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Embed a face crop. Each returned embedding is L2-normalized.
    fn embed(&self, crop: &DynamicImage) -> Result<Embeddings> {
        let size = self.input_size;
        let mut crops = vec![crop.resize_exact(size, size, FilterType::Triangle).to_rgb8()];
        if self.mirror {
            crops.push(image::imageops::flip_horizontal(&crops[0]));
        }

        let values = self.infer(&crops)?;
        split_output(&values, crops.len())
    }
}

/// Per-image standardization: zero mean, unit variance, with the
/// deviation floored at `1 / sqrt(n)`.
fn prewhiten(pixels: &[u8]) -> Vec<f32> {
    let n = pixels.len().max(1) as f32;
    let mean = pixels.iter().map(|&p| p as f32).sum::<f32>() / n;
    let var = pixels
        .iter()
        .map(|&p| (p as f32 - mean).powi(2))
        .sum::<f32>()
        / n;
    let std = var.sqrt().max(1.0 / n.sqrt());

    pixels.iter().map(|&p| (p as f32 - mean) / std).collect()
}

/// Batch tensor of prewhitened crops, NHWC or NCHW.
fn to_tensor(crops: &[RgbImage], channels_last: bool) -> Array4<f32> {
    let (w, h) = crops
        .first()
        .map(|c| (c.width() as usize, c.height() as usize))
        .unwrap_or((0, 0));

    let mut tensor = if channels_last {
        Array4::<f32>::zeros((crops.len(), h, w, 3))
    } else {
        Array4::<f32>::zeros((crops.len(), 3, h, w))
    };

    for (n, crop) in crops.iter().enumerate() {
        let values = prewhiten(crop.as_raw());
        for (i, v) in values.into_iter().enumerate() {
            let c = i % 3;
            let x = (i / 3) % w;
            let y = i / 3 / w;
            if channels_last {
                tensor[[n, y, x, c]] = v;
            } else {
                tensor[[n, c, y, x]] = v;
            }
        }
    }

    tensor
}

/// Split a flat `[batch, dim]` output into normalized embeddings.
fn split_output(values: &[f32], batch: usize) -> Result<Embeddings> {
    if batch == 0 || values.is_empty() || values.len() % batch != 0 {
        return Err(anyhow!(
            "Unexpected embedding output size {} for batch {}",
            values.len(),
            batch
        ));
    }

    let dim = values.len() / batch;
    Ok(values.chunks(dim).map(Embedding::from_output).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FacesError;

    #[test]
    fn test_prewhiten_standardizes() {
        let out = prewhiten(&[0, 50, 100, 150, 200, 250]);
        let mean: f32 = out.iter().sum::<f32>() / out.len() as f32;
        let var: f32 = out.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / out.len() as f32;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_prewhiten_flat_image() {
        let out = prewhiten(&[7; 12]);
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_to_tensor_layouts() {
        let mut crop = RgbImage::new(2, 2);
        crop.put_pixel(1, 0, image::Rgb([255, 0, 0]));

        let nhwc = to_tensor(&[crop.clone()], true);
        assert_eq!(nhwc.shape(), &[1, 2, 2, 3]);
        let nchw = to_tensor(&[crop], false);
        assert_eq!(nchw.shape(), &[1, 3, 2, 2]);

        assert_eq!(nhwc[[0, 0, 1, 0]], nchw[[0, 0, 0, 1]]);
        assert!(nhwc[[0, 0, 1, 0]] > 0.0);
    }

    #[test]
    fn test_split_output() {
        let embeddings = split_output(&[3.0, 4.0, 0.0, 2.0], 2).unwrap();
        assert_eq!(embeddings.len(), 2);
        assert!(embeddings.iter().all(|e| e.is_normalized()));
        assert_eq!(embeddings[1].values(), &[0.0, 1.0]);

        assert!(split_output(&[1.0, 2.0, 3.0], 2).is_err());
        assert!(split_output(&[], 1).is_err());
    }

    #[test]
    fn test_embed_without_model_fails() {
        let config = EmbeddingConfig {
            model_path: PathBuf::from("/nonexistent/facenet.onnx"),
            ..Default::default()
        };
        let model = EmbeddingModel::new(&config);
        let crop = DynamicImage::new_rgb8(64, 64);
        let err = model.embed(&crop).unwrap_err();
        assert!(matches!(err.downcast_ref::<FacesError>(), Some(FacesError::ModelNotFound(_))));

        // Nothing was cached, so the next call fails the same way.
        assert!(model.embed(&crop).is_err());
        assert!(model.session.lock().unwrap().is_none());
    }
}
