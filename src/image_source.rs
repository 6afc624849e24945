// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use canonical_error::{CanonicalError, invalid_argument_error, unavailable_error};
use log::{debug, info};
use sqlx::{Connection, SqliteConnection};
use sqlx::sqlite::SqliteConnectOptions;

use crate::config::CameraConfig;
use crate::image_source_trait::ImageSource;

// Returns the camera row's id together with its newest image filename, if
// any. A missing row means the camera id is unknown.
const LATEST_IMAGE_QUERY: &str = "\
    SELECT camera.id, \
           (SELECT image.filename FROM image \
            WHERE image.camera_id = camera.id \
            ORDER BY image.createDate DESC LIMIT 1) \
    FROM camera WHERE camera.id = ?";

/// Builds the ImageSource named by `camera.type`.
pub fn select_image_source(camera: &CameraConfig)
                           -> Result<Box<dyn ImageSource + Send + Sync>, CanonicalError> {
    match camera.camera_type.to_lowercase().as_str() {
        "file" => {
            if camera.image_file.is_empty() {
                return Err(invalid_argument_error(
                    "No image_file configured for file-based camera"));
            }
            Ok(Box::new(FileImageSource::new(&camera.image_file, camera.timeout())))
        },
        "indi-allsky" => Ok(Box::new(CatalogImageSource::new(
            &camera.database_path, camera.camera_id,
            &camera.image_base_path, camera.timeout()))),
        other => Err(invalid_argument_error(
            format!("Unknown camera type: {}", other).as_str())),
    }
}

/// A fixed path that the camera software keeps overwriting.
pub struct FileImageSource {
    path: PathBuf,
    timeout: Duration,
}

impl FileImageSource {
    pub fn new(path: impl AsRef<Path>, timeout: Duration) -> Self {
        FileImageSource{path: path.as_ref().to_path_buf(), timeout}
    }
}

#[async_trait]
impl ImageSource for FileImageSource {
    async fn latest_image(&self) -> Result<PathBuf, CanonicalError> {
        // Opening the file proves it both exists and is readable.
        match tokio::time::timeout(self.timeout, tokio::fs::File::open(&self.path)).await {
            Ok(Ok(_file)) => {
                debug!("Using image file {:?}", self.path);
                Ok(self.path.clone())
            },
            Ok(Err(e)) => Err(unavailable_error(
                format!("Image file {:?} not readable: {:?}", self.path, e).as_str())),
            Err(_) => Err(unavailable_error(
                format!("Timed out opening image file {:?}", self.path).as_str())),
        }
    }

    fn describe(&self) -> String {
        format!("file {:?}", self.path)
    }
}

/// The indi-allsky image catalog, an SQLite database recording each frame
/// the camera has saved.
pub struct CatalogImageSource {
    database_path: PathBuf,
    camera_id: i64,
    image_base_path: PathBuf,
    timeout: Duration,
}

impl CatalogImageSource {
    pub fn new(database_path: impl AsRef<Path>, camera_id: i64,
               image_base_path: impl AsRef<Path>, timeout: Duration) -> Self {
        CatalogImageSource{
            database_path: database_path.as_ref().to_path_buf(),
            camera_id,
            image_base_path: image_base_path.as_ref().to_path_buf(),
            timeout,
        }
    }

    async fn query_latest(&self) -> Result<PathBuf, CanonicalError> {
        if !self.database_path.exists() {
            return Err(unavailable_error(
                format!("Image catalog {:?} not found", self.database_path).as_str()));
        }
        let options = SqliteConnectOptions::new()
            .filename(&self.database_path)
            .read_only(true)
            .create_if_missing(false)
            .busy_timeout(self.timeout);
        let mut conn = SqliteConnection::connect_with(&options).await.map_err(|e| {
            unavailable_error(format!("Cannot open image catalog {:?}: {:?}",
                                      self.database_path, e).as_str())
        })?;
        let row = sqlx::query_as::<_, (i64, Option<String>)>(LATEST_IMAGE_QUERY)
            .bind(self.camera_id)
            .fetch_optional(&mut conn)
            .await;
        // Best effort; the query outcome is what matters.
        let _ = conn.close().await;

        let row = row.map_err(|e| unavailable_error(
            format!("Image catalog query failed: {:?}", e).as_str()))?;
        match row {
            None => Err(invalid_argument_error(
                format!("Camera id {} not found in image catalog", self.camera_id).as_str())),
            Some((_, None)) => Err(unavailable_error(
                format!("No images found for camera id {}", self.camera_id).as_str())),
            Some((_, Some(filename))) => {
                let path = self.image_base_path.join(filename);
                info!("Latest image: {:?}", path);
                Ok(path)
            },
        }
    }
}

#[async_trait]
impl ImageSource for CatalogImageSource {
    async fn latest_image(&self) -> Result<PathBuf, CanonicalError> {
        match tokio::time::timeout(self.timeout, self.query_latest()).await {
            Ok(result) => result,
            Err(_) => Err(unavailable_error(
                format!("Timed out querying image catalog {:?}",
                        self.database_path).as_str())),
        }
    }

    fn describe(&self) -> String {
        format!("indi-allsky catalog {:?} camera {}", self.database_path, self.camera_id)
    }
}

#[cfg(test)]
mod tests {
    use canonical_error::CanonicalErrorCode;
    use super::*;

    async fn make_catalog(path: &Path) {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
        for statement in [
            "CREATE TABLE camera (id INTEGER PRIMARY KEY, name TEXT)",
            "CREATE TABLE image (id INTEGER PRIMARY KEY, camera_id INTEGER, \
             filename TEXT, createDate TIMESTAMP)",
            "INSERT INTO camera (id, name) VALUES (1, 'allsky'), (2, 'spare')",
            "INSERT INTO image (camera_id, filename, createDate) VALUES \
             (1, 'ccd1/old.jpg', '2024-05-01 03:00:00'), \
             (1, 'ccd1/new.jpg', '2024-05-01 03:05:00'), \
             (1, 'ccd1/middle.jpg', '2024-05-01 03:02:00')",
        ] {
            sqlx::query(statement).execute(&mut conn).await.unwrap();
        }
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_catalog_returns_newest_image() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("indi-allsky.sqlite");
        make_catalog(&db).await;

        let source = CatalogImageSource::new(&db, 1, "/var/www/images",
                                             Duration::from_secs(5));
        assert_eq!(source.latest_image().await.unwrap(),
                   PathBuf::from("/var/www/images/ccd1/new.jpg"));
    }

    #[tokio::test]
    async fn test_catalog_camera_without_images() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("indi-allsky.sqlite");
        make_catalog(&db).await;

        let source = CatalogImageSource::new(&db, 2, "/images", Duration::from_secs(5));
        let err = source.latest_image().await.unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn test_catalog_unknown_camera() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("indi-allsky.sqlite");
        make_catalog(&db).await;

        let source = CatalogImageSource::new(&db, 7, "/images", Duration::from_secs(5));
        let err = source.latest_image().await.unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_catalog_missing_database() {
        let dir = tempfile::tempdir().unwrap();
        let source = CatalogImageSource::new(dir.path().join("nope.sqlite"), 1,
                                             "/images", Duration::from_secs(5));
        let err = source.latest_image().await.unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latest.jpg");
        let source = FileImageSource::new(&path, Duration::from_secs(5));
        let err = source.latest_image().await.unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::Unavailable);

        std::fs::write(&path, b"jpeg bytes").unwrap();
        assert_eq!(source.latest_image().await.unwrap(), path);
    }

    #[test]
    fn test_select_image_source() {
        let file_camera = CameraConfig{camera_type: "FILE".to_string(),
                                       image_file: "/tmp/latest.jpg".to_string(),
                                       ..Default::default()};
        assert!(select_image_source(&file_camera).unwrap().describe().starts_with("file"));

        let unconfigured = CameraConfig{camera_type: "file".to_string(),
                                        ..Default::default()};
        assert_eq!(select_image_source(&unconfigured).err().unwrap().code,
                   CanonicalErrorCode::InvalidArgument);

        let unknown = CameraConfig{camera_type: "webcam".to_string(),
                                   ..Default::default()};
        assert_eq!(select_image_source(&unknown).err().unwrap().code,
                   CanonicalErrorCode::InvalidArgument);

        assert!(select_image_source(&CameraConfig::default()).is_ok());
    }

}  // mod tests.
