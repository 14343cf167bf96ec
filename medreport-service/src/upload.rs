use medreport_core::{DocumentRef, ReviewError};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Strip any directory part from a client-supplied name and require a PDF.
pub fn validate_file_name(raw: &str) -> Result<String, ReviewError> {
    let name = Path::new(raw.trim())
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ReviewError::Validation("file name is required".to_string()))?;

    if !name.to_lowercase().ends_with(".pdf") {
        return Err(ReviewError::Validation(
            "only PDF files are allowed".to_string(),
        ));
    }
    Ok(name)
}

fn stored_name(file_name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("report_{}_{}", nanos, file_name)
}

/// Write the uploaded bytes under `upload_dir` as `report_<nanos>_<name>`.
pub async fn store_document(
    upload_dir: &Path,
    file_name: &str,
    bytes: &[u8],
) -> Result<DocumentRef, ReviewError> {
    tokio::fs::create_dir_all(upload_dir)
        .await
        .map_err(|e| ReviewError::Persistence(format!("failed to create upload dir: {}", e)))?;

    let path: PathBuf = upload_dir.join(stored_name(file_name));
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| ReviewError::Persistence(format!("failed to save file: {}", e)))?;

    info!(path = %path.display(), bytes = bytes.len(), "Stored uploaded document");
    Ok(DocumentRef {
        path: path.to_string_lossy().into_owned(),
        file_name: file_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdf_extension_case_insensitive() {
        assert_eq!(validate_file_name("Blood-Work.PDF").unwrap(), "Blood-Work.PDF");
        assert!(validate_file_name("scan.png").is_err());
        assert!(validate_file_name("").is_err());
    }

    #[test]
    fn test_directory_components_dropped() {
        assert_eq!(validate_file_name("../../etc/cbc.pdf").unwrap(), "cbc.pdf");
    }

    #[tokio::test]
    async fn test_store_document_writes_prefixed_file() {
        let dir = std::env::temp_dir().join(format!("medreport-upload-{}", uuid::Uuid::new_v4()));
        let doc = store_document(&dir, "cbc.pdf", b"%PDF-1.4").await.unwrap();

        assert_eq!(doc.file_name, "cbc.pdf");
        let stored = PathBuf::from(&doc.path);
        let name = stored.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("report_"));
        assert!(name.ends_with("_cbc.pdf"));
        assert_eq!(tokio::fs::read(&stored).await.unwrap(), b"%PDF-1.4");

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
