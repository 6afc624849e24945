// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, failed_precondition_error, internal_error};
use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::classifier_trait::ClassifierModel;
use crate::config::ModelConfig;
use crate::onnx_classifier::OnnxClassifier;
use crate::preprocess::load_image_tensor;

/// Outcome of classifying one allsky frame.
#[derive(Clone, Debug)]
pub struct DetectionResult {
    pub is_cloudy: bool,

    // Label of the winning class, as written in the labels file.
    pub class_name: String,

    // Raw score of the winning class.
    pub confidence: f32,

    pub image_path: PathBuf,

    // When the classification completed.
    pub timestamp: DateTime<Utc>,

    // Decode + preprocess + forward pass.
    pub processing_duration: Duration,
}

/// Classifies allsky images as cloudy or clear. The model and labels are
/// loaded once and are not modified afterwards.
pub struct DetectEngine {
    model: Box<dyn ClassifierModel + Send + Sync>,
    labels: Vec<String>,
    image_size: u32,
    cloudy_marker: String,
}

impl DetectEngine {
    /// Loads the ONNX model and labels file named in `model_config`. Any
    /// problem with either file is FailedPrecondition.
    pub fn load(model_config: &ModelConfig) -> Result<Self, CanonicalError> {
        let labels = load_labels(&model_config.labels_path)?;
        info!("Loaded {} labels: {:?}", labels.len(), labels);
        let model = OnnxClassifier::load(&model_config.model_path,
                                         model_config.image_size)?;
        Ok(Self::with_model(Box::new(model), labels,
                            model_config.image_size, &model_config.cloudy_marker))
    }

    pub fn with_model(model: Box<dyn ClassifierModel + Send + Sync>,
                      labels: Vec<String>, image_size: u32, cloudy_marker: &str)
                      -> Self {
        DetectEngine{model, labels, image_size,
                     cloudy_marker: cloudy_marker.to_lowercase()}
    }

    /// Runs the classifier on the image at `image_path`.
    /// Errors:
    ///   DataLoss: the image could not be read or decoded.
    ///   Internal: the model failed or produced no scores.
    pub fn classify(&self, image_path: &Path) -> Result<DetectionResult, CanonicalError> {
        let start = Instant::now();
        let input = load_image_tensor(image_path, self.image_size)?;
        let scores = self.model.forward(&input)?;
        let (index, confidence) = match argmax(&scores) {
            Some(best) => best,
            None => {
                return Err(internal_error("Model returned no usable class scores"));
            }
        };
        let class_name = self.label_for(index);
        let is_cloudy = class_name.to_lowercase().contains(&self.cloudy_marker);
        let processing_duration = start.elapsed();
        debug!("Scores {:?}; winner {} ({}) in {:?}",
               scores, index, class_name, processing_duration);

        Ok(DetectionResult{
            is_cloudy,
            class_name,
            confidence,
            image_path: image_path.to_path_buf(),
            timestamp: Utc::now(),
            processing_duration,
        })
    }

    fn label_for(&self, index: usize) -> String {
        match self.labels.get(index) {
            Some(label) => label.clone(),
            None => format!("Unknown_{}", index),
        }
    }
}

// Returns index and value of the largest score. Ties go to the lowest index.
// NaN scores never win; all-NaN output is treated as no scores.
fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, best_score)) if *score <= best_score => (),
            _ => best = Some((index, *score)),
        }
    }
    best
}

// Parses a labels file. Each non-blank line is a label, optionally preceded
// by its integer class index ("0 Clear").
fn parse_labels(content: &str) -> Vec<String> {
    let mut labels = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let label = match line.split_once(char::is_whitespace) {
            Some((prefix, rest)) if prefix.parse::<usize>().is_ok() => rest.trim(),
            _ => line,
        };
        labels.push(label.to_string());
    }
    labels
}

fn load_labels(labels_path: &Path) -> Result<Vec<String>, CanonicalError> {
    let content = fs::read_to_string(labels_path).map_err(|e| failed_precondition_error(
        format!("Cannot read labels file {:?}: {:?}", labels_path, e).as_str()))?;
    let labels = parse_labels(&content);
    if labels.is_empty() {
        return Err(failed_precondition_error(
            format!("Labels file {:?} has no labels", labels_path).as_str()));
    }
    Ok(labels)
}

// mod tests.
