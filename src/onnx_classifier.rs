// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::Path;

use canonical_error::{CanonicalError, failed_precondition_error, internal_error};
use log::info;
use tract_onnx::prelude::*;

use crate::classifier_trait::ClassifierModel;
use crate::preprocess::ImageTensor;

/// ClassifierModel backed by an ONNX file (e.g. a Teachable Machine Keras
/// model converted with tf2onnx), executed with tract.
pub struct OnnxClassifier {
    plan: TypedRunnableModel<TypedModel>,
}

impl OnnxClassifier {
    /// Loads and optimizes the model for a fixed [1, size, size, 3] input.
    pub fn load(model_path: &Path, size: u32) -> Result<Self, CanonicalError> {
        if !model_path.exists() {
            return Err(failed_precondition_error(
                format!("Model file not found: {:?}", model_path).as_str()));
        }
        info!("Loading ONNX model {:?}", model_path);
        let size = size as usize;
        let plan = tract_onnx::onnx()
            .model_for_path(model_path)
            .and_then(|model| model.with_input_fact(
                0, f32::fact([1, size, size, 3]).into()))
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| failed_precondition_error(
                format!("Cannot load model {:?}: {:?}", model_path, e).as_str()))?;
        info!("Model loaded");
        Ok(OnnxClassifier{plan})
    }
}

impl ClassifierModel for OnnxClassifier {
    fn forward(&self, input: &ImageTensor) -> Result<Vec<f32>, CanonicalError> {
        let [n, h, w, c] = input.shape;
        let array = tract_ndarray::Array4::from_shape_vec((n, h, w, c), input.data.clone())
            .map_err(|e| internal_error(
                format!("Bad input tensor shape {:?}: {:?}", input.shape, e).as_str()))?;
        let tensor: Tensor = array.into();
        let outputs = self.plan.run(tvec!(tensor.into()))
            .map_err(|e| internal_error(format!("Inference failed: {:?}", e).as_str()))?;
        let scores = outputs[0].to_array_view::<f32>()
            .map_err(|e| internal_error(format!("Unexpected model output: {:?}", e).as_str()))?;
        // Output is [1, num_classes]; flatten the batch dimension.
        Ok(scores.iter().copied().collect())
    }
}

// mod tests.
