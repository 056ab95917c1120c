use crate::error::{ProblemError, Result};
use crate::models::{FileUpload, Problem, StoredObject};
use crate::object_store::ObjectStore;
use crate::record_store::ProblemStore;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Request-handling logic shared by every HTTP handler
pub struct ProblemService {
    records: Arc<dyn ProblemStore>,
    objects: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ProblemService {
    pub fn new(
        records: Arc<dyn ProblemStore>,
        objects: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            records,
            objects,
            bucket: bucket.into(),
        }
    }

    /// Upload attachments in order, then persist the record.
    ///
    /// A failed upload aborts the rest. Objects written before the failure
    /// are left in the bucket.
    #[instrument(skip(self, description, uploads), fields(file_count = uploads.len()))]
    pub async fn create(
        &self,
        title: &str,
        description: &str,
        uploads: Vec<FileUpload>,
    ) -> Result<Problem> {
        if title.is_empty() || description.is_empty() {
            return Err(ProblemError::Validation(
                "Title and description are required".to_string(),
            ));
        }

        let mut files = Vec::with_capacity(uploads.len());
        for upload in uploads {
            if let Err(e) = self.objects.put(&self.bucket, &upload.name, upload.data).await {
                if !files.is_empty() {
                    warn!(uploaded = ?files, "Aborting problem creation, earlier uploads remain in the bucket");
                }
                metrics::counter!("problems.create_failed").increment(1);
                return Err(e);
            }
            metrics::counter!("files.uploaded").increment(1);
            files.push(upload.name);
        }

        let problem = Problem::new(title, description, files);

        if let Err(e) = self.records.insert(&problem).await {
            metrics::counter!("problems.create_failed").increment(1);
            return Err(e);
        }

        metrics::counter!("problems.created").increment(1);
        info!(problem_id = %problem.id, files = problem.files.len(), "Problem created");

        Ok(problem)
    }

    pub async fn list(&self) -> Result<Vec<Problem>> {
        self.records.select_all().await
    }

    /// Store a single standalone file under its own name
    #[instrument(skip(self, file))]
    pub async fn upload(&self, file: Option<FileUpload>) -> Result<String> {
        let file = file
            .filter(|f| !f.name.is_empty())
            .ok_or_else(|| ProblemError::Validation("File is required".to_string()))?;

        self.objects.put(&self.bucket, &file.name, file.data).await?;
        metrics::counter!("files.uploaded").increment(1);

        info!(key = %file.name, "File uploaded");
        Ok(file.name)
    }

    pub async fn list_files(&self) -> Result<Vec<String>> {
        self.objects.list(&self.bucket).await
    }

    #[instrument(skip(self))]
    pub async fn download(&self, filename: &str) -> Result<StoredObject> {
        let object = self.objects.get(&self.bucket, filename).await?;
        metrics::counter!("files.downloaded").increment(1);
        Ok(object)
    }

    /// Ping both stores, returning each failure separately
    pub async fn readiness(&self) -> (Result<()>, Result<()>) {
        tokio::join!(self.records.ping(), self.objects.ping(&self.bucket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{MemoryObjectStore, MockObjectStore};
    use crate::record_store::MemoryProblemStore;
    use bytes::Bytes;
    use mockall::predicate::eq;
    use std::collections::HashSet;
    use tokio_test::{assert_err, assert_ok};

    const BUCKET: &str = "problem-files";

    fn memory_service() -> (ProblemService, Arc<MemoryProblemStore>, Arc<MemoryObjectStore>) {
        let records = Arc::new(MemoryProblemStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let service = ProblemService::new(records.clone(), objects.clone(), BUCKET);
        (service, records, objects)
    }

    #[tokio::test]
    async fn test_create_without_files() {
        let (service, records, _) = memory_service();

        let problem = assert_ok!(service.create("Leak in roof", "Water damage", vec![]).await);

        assert_eq!(problem.title, "Leak in roof");
        assert_eq!(problem.description, "Water damage");
        assert!(problem.files.is_empty());
        assert_eq!(records.select_all().await.unwrap(), vec![problem]);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_fields_without_side_effects() {
        let (service, records, objects) = memory_service();
        let upload = || vec![FileUpload::new("evidence.jpg", Bytes::from_static(b"jpeg"))];

        for (title, description) in [("", "desc"), ("title", ""), ("", "")] {
            let err = assert_err!(service.create(title, description, upload()).await);
            assert!(matches!(err, ProblemError::Validation(_)));
        }

        assert!(records.is_empty());
        assert!(objects.list(BUCKET).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_uploads_files_under_their_names() {
        let (service, _, objects) = memory_service();
        let uploads = vec![
            FileUpload::new("photo.png", Bytes::from_static(b"png")),
            FileUpload::new("notes.txt", Bytes::from_static(b"notes")),
        ];

        let problem = service.create("Broken step", "Loose board", uploads).await.unwrap();

        assert_eq!(problem.files, vec!["photo.png", "notes.txt"]);
        let keys: HashSet<_> = service.list_files().await.unwrap().into_iter().collect();
        assert!(keys.contains("photo.png"));
        assert!(keys.contains("notes.txt"));

        let body = objects.get(BUCKET, "notes.txt").await.unwrap().collect().await.unwrap();
        assert_eq!(body, Bytes::from_static(b"notes"));
    }

    #[tokio::test]
    async fn test_create_ids_are_unique() {
        let (service, _, _) = memory_service();

        let mut ids = HashSet::new();
        for i in 0..50 {
            let problem = service.create(&format!("t{i}"), "d", vec![]).await.unwrap();
            assert!(ids.insert(problem.id));
        }
    }

    #[tokio::test]
    async fn test_list_returns_every_creation_in_order() {
        let (service, _, _) = memory_service();

        let mut created = Vec::new();
        for i in 0..5 {
            created.push(
                service
                    .create(&format!("title {i}"), &format!("description {i}"), vec![])
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(service.list().await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_failed_upload_aborts_remaining_and_skips_insert() {
        let records = Arc::new(MemoryProblemStore::new());
        let mut objects = MockObjectStore::new();

        objects
            .expect_put()
            .withf(|bucket, key, _| bucket == BUCKET && key == "first.txt")
            .times(1)
            .returning(|_, _, _| Ok(()));
        objects
            .expect_put()
            .withf(|_, key, _| key == "second.txt")
            .times(1)
            .returning(|_, _, _| Err(ProblemError::storage("upload second.txt", anyhow::anyhow!("timeout"))));
        // third.txt must never be attempted
        objects
            .expect_put()
            .withf(|_, key, _| key == "third.txt")
            .never();

        let service = ProblemService::new(records.clone(), Arc::new(objects), BUCKET);
        let uploads = vec![
            FileUpload::new("first.txt", Bytes::from_static(b"1")),
            FileUpload::new("second.txt", Bytes::from_static(b"2")),
            FileUpload::new("third.txt", Bytes::from_static(b"3")),
        ];

        let err = service.create("t", "d", uploads).await.unwrap_err();

        assert!(matches!(err, ProblemError::Storage { .. }));
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_upload_requires_named_file() {
        let (service, _, objects) = memory_service();

        let err = service.upload(None).await.unwrap_err();
        assert_eq!(err.user_message(), "File is required");

        let err = service
            .upload(Some(FileUpload::new("", Bytes::from_static(b"x"))))
            .await
            .unwrap_err();
        assert!(matches!(err, ProblemError::Validation(_)));

        assert!(objects.list(BUCKET).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let (service, _, _) = memory_service();
        let payload = Bytes::from(vec![7u8; 4096]);

        let key = service
            .upload(Some(FileUpload::new("blob.bin", payload.clone())))
            .await
            .unwrap();
        assert_eq!(key, "blob.bin");

        let object = service.download("blob.bin").await.unwrap();
        assert_eq!(object.collect().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let (service, _, _) = memory_service();

        let err = service.download("never-uploaded.pdf").await.unwrap_err();
        assert!(matches!(err, ProblemError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_download_storage_failure_passes_through() {
        let mut objects = MockObjectStore::new();
        objects
            .expect_get()
            .with(eq(BUCKET), eq("report.pdf"))
            .returning(|_, _| Err(ProblemError::storage("download report.pdf", anyhow::anyhow!("503"))));

        let service = ProblemService::new(Arc::new(MemoryProblemStore::new()), Arc::new(objects), BUCKET);

        let err = service.download("report.pdf").await.unwrap_err();
        assert!(matches!(err, ProblemError::Storage { .. }));
    }

    #[tokio::test]
    async fn test_readiness_reports_object_store_failure() {
        let mut objects = MockObjectStore::new();
        objects
            .expect_ping()
            .returning(|_| Err(ProblemError::storage("reach object store", anyhow::anyhow!("dns"))));

        let service = ProblemService::new(Arc::new(MemoryProblemStore::new()), Arc::new(objects), BUCKET);

        let (records, objects) = service.readiness().await;
        assert!(records.is_ok());
        assert!(objects.is_err());
    }
}
