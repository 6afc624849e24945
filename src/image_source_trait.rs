// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;

use async_trait::async_trait;
use canonical_error::CanonicalError;

// Locates the most recent allsky camera frame. Implementations re-resolve on
// every call and never cache. If no path is returned, an error is returned:
//   Unavailable: there is no image to classify right now (missing file,
//     empty or unreachable catalog, timeout).
//   InvalidArgument: the configuration names something that does not exist
//     (e.g. an unknown camera id). This is not retried.
#[async_trait]
pub trait ImageSource {
    async fn latest_image(&self) -> Result<PathBuf, CanonicalError>;

    /// Short description for log messages.
    fn describe(&self) -> String;
}
