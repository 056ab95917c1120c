use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A posted problem and the object keys of its attachments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// Server-generated identifier
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Object keys (upload filenames), in upload order
    #[serde(default)]
    pub files: Vec<String>,
}

impl Problem {
    /// Build a problem with a fresh random id
    pub fn new(title: impl Into<String>, description: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            files,
        }
    }
}

/// A file part received from a client
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub data: Bytes,
}

impl FileUpload {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Chunked object body, released when consumed or dropped
pub type ObjectStream = BoxStream<'static, std::io::Result<Bytes>>;

/// An object fetched from the store, ready to stream back to a client
pub struct StoredObject {
    pub key: String,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub body: ObjectStream,
}

impl std::fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredObject")
            .field("key", &self.key)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl StoredObject {
    /// Drain the body into memory
    pub async fn collect(self) -> std::io::Result<Bytes> {
        use futures::TryStreamExt;

        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }
}

/// Content type for an object key, inferred from its extension
pub fn content_type_for(key: &str) -> &'static str {
    let extension = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_problem_serializes_empty_files_as_array() {
        let problem = Problem::new("Leak in roof", "Water damage", vec![]);
        let json = serde_json::to_value(&problem).unwrap();

        assert_eq!(json["title"], "Leak in roof");
        assert_eq!(json["description"], "Water damage");
        assert_eq!(json["files"], serde_json::json!([]));
        assert_eq!(json["id"], problem.id.to_string());
    }

    #[test]
    fn test_problem_ids_unique() {
        let a = Problem::new("a", "b", vec![]);
        let b = Problem::new("a", "b", vec![]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("scan.png"), "image/png");
        assert_eq!(content_type_for("report.pdf"), "application/pdf");
        assert_eq!(content_type_for("archive.tar.gz"), "application/octet-stream");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_stored_object_collect() {
        let chunks = vec![Ok(Bytes::from_static(b"hello ")), Ok(Bytes::from_static(b"world"))];
        let object = StoredObject {
            key: "greeting.txt".to_string(),
            content_type: "text/plain".to_string(),
            content_length: Some(11),
            body: Box::pin(futures::stream::iter(chunks)),
        };

        assert_eq!(object.collect().await.unwrap(), Bytes::from_static(b"hello world"));
    }
}
