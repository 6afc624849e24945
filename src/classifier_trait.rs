// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::CanonicalError;

use crate::preprocess::ImageTensor;

// A loaded image classification network. The model is immutable once loaded
// and is shared across detection cycles without locking.
// If scores are not returned, an error is returned:
//   Internal: the forward pass failed.
pub trait ClassifierModel {
    /// Runs the network on `input`; returns one raw score per class, in the
    /// model's class index order.
    fn forward(&self, input: &ImageTensor) -> Result<Vec<f32>, CanonicalError>;
}
