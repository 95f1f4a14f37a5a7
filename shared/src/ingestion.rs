//! Context file uploads.
//!
//! An upload is validated in full before anything is written. Once the record
//! exists, extraction problems are stored on it instead of failing the upload.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mime_guess::MimeGuess;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{FileType, NewResearchFile, ResearchFile};
use crate::store::SessionStore;
use crate::validation::{UploadFileRequest, MAX_FILENAME_LENGTH};
use crate::{Error, Result};

/// Characters of extracted text kept in the summary.
pub const SUMMARY_CHARS: usize = 500;

const FORBIDDEN_FILENAME_CHARS: [char; 10] = ['<', '>', ':', '"', '|', '?', '*', '\0', '/', '\\'];

const PDF_UNREADABLE: &str = "The PDF could not be read";

const PDF_MAGIC: &[u8] = b"%PDF-";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Bytes inspected for NUL when checking that a TXT upload is really text.
const TEXT_SNIFF_BYTES: usize = 8192;

/// A decoded upload.
#[derive(Debug, Clone)]
pub struct RawUpload {
    pub filename: String,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
}

impl TryFrom<UploadFileRequest> for RawUpload {
    type Error = Error;

    fn try_from(request: UploadFileRequest) -> Result<Self> {
        let content = STANDARD
            .decode(request.content_base64.trim())
            .map_err(|_| Error::validation("contentBase64", "File content must be valid base64"))?;
        Ok(Self {
            filename: request.filename,
            content,
            content_type: request.content_type,
        })
    }
}

/// Reject names that are blank, too long, or could escape a directory.
pub fn validate_filename(filename: &str) -> Result<String> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(Error::validation("filename", "Filename is required"));
    }
    if filename.chars().count() > MAX_FILENAME_LENGTH {
        return Err(Error::validation(
            "filename",
            format!("Filename must not exceed {} characters", MAX_FILENAME_LENGTH),
        ));
    }
    if filename.contains(FORBIDDEN_FILENAME_CHARS) || filename.contains("..") {
        return Err(Error::validation("filename", "Filename contains invalid characters"));
    }
    Ok(filename.to_string())
}

/// File type from the extension, cross-checked with the declared content type.
pub fn detect_type(filename: &str, content_type: Option<&str>) -> Result<FileType> {
    let unsupported = || {
        Error::validation(
            "filename",
            "Unsupported file type. Allowed types: PDF, TXT, DOC, DOCX",
        )
    };

    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .ok_or_else(unsupported)?;
    if !FileType::ALL.iter().any(|t| t.extension() == extension) {
        return Err(unsupported());
    }

    let file_type = MimeGuess::from_ext(&extension)
        .iter()
        .find_map(|mime| FileType::from_mime(mime.essence_str()))
        .ok_or_else(unsupported)?;

    if let Some(declared) = content_type.and_then(FileType::from_mime) {
        if declared != file_type {
            return Err(Error::validation(
                "contentType",
                format!(
                    "Content type does not match a .{} file",
                    file_type.extension()
                ),
            ));
        }
    }
    Ok(file_type)
}

/// Check the leading bytes agree with the claimed type.
pub fn sniff_content(file_type: FileType, content: &[u8]) -> Result<()> {
    let matches = match file_type {
        FileType::Pdf => content.starts_with(PDF_MAGIC),
        FileType::Docx => content.starts_with(ZIP_MAGIC),
        FileType::Doc => content.starts_with(OLE_MAGIC),
        FileType::Txt => {
            let head = &content[..content.len().min(TEXT_SNIFF_BYTES)];
            !head.contains(&0)
                && ![PDF_MAGIC, ZIP_MAGIC, OLE_MAGIC]
                    .iter()
                    .any(|magic| content.starts_with(magic))
        }
    };

    if matches {
        Ok(())
    } else {
        Err(Error::validation(
            "file",
            format!("File content does not match the {} file type", file_type),
        ))
    }
}

fn check_size(size: usize, max_size: u64) -> Result<()> {
    if size == 0 {
        return Err(Error::validation("file", "Cannot upload empty file"));
    }
    if size as u64 > max_size {
        return Err(Error::validation(
            "file",
            format!(
                "File size ({} bytes) exceeds maximum allowed size ({} bytes)",
                size, max_size
            ),
        ));
    }
    Ok(())
}

/// Pull plain text out of a validated upload.
pub async fn extract_text(file_type: FileType, content: Vec<u8>) -> Result<String> {
    let text = match file_type {
        FileType::Txt => String::from_utf8_lossy(&content).into_owned(),
        FileType::Pdf => {
            let extracted =
                tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&content)).await;
            match extracted {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    warn!(error = %e, "PDF text extraction failed");
                    return Err(Error::Execution(PDF_UNREADABLE.to_string()));
                }
                // The parser panics on some malformed documents.
                Err(e) => {
                    warn!(error = %e, "PDF extraction task aborted");
                    return Err(Error::Execution(PDF_UNREADABLE.to_string()));
                }
            }
        }
        FileType::Doc | FileType::Docx => {
            return Err(Error::Execution(format!(
                "Text extraction is not supported for {} files",
                file_type
            )))
        }
    };

    if text.trim().is_empty() {
        return Err(Error::Execution("No text could be extracted from the file".to_string()));
    }
    Ok(text)
}

/// Leading excerpt plus word, character and line counts.
pub fn summarize(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return "Empty file or no extractable content.".to_string();
    }

    let char_count = text.chars().count();
    let word_count = text.split_whitespace().count();
    let line_count = text.split('\n').count();

    let mut summary: String = text.chars().take(SUMMARY_CHARS).collect();
    if char_count > SUMMARY_CHARS {
        summary.push_str("...");
    }
    format!(
        "{}\n\n[File Statistics: {} words, {} characters, {} lines]",
        summary, word_count, char_count, line_count
    )
}

/// Upload, list, fetch and delete of session files.
pub struct FileIngestion {
    store: Arc<dyn SessionStore>,
    max_file_size: u64,
}

impl FileIngestion {
    pub fn new(store: Arc<dyn SessionStore>, max_file_size: u64) -> Self {
        Self {
            store,
            max_file_size,
        }
    }

    /// Validate, record and process one upload.
    pub async fn upload(&self, session_id: Uuid, user_id: &str, upload: RawUpload) -> Result<ResearchFile> {
        self.store.get(session_id, user_id).await?;

        let filename = validate_filename(&upload.filename)?;
        let file_type = detect_type(&filename, upload.content_type.as_deref())?;
        check_size(upload.content.len(), self.max_file_size)?;
        sniff_content(file_type, &upload.content)?;

        let record = self
            .store
            .insert_file(
                session_id,
                user_id,
                NewResearchFile {
                    filename,
                    file_type,
                    file_size: upload.content.len() as i64,
                },
            )
            .await?;

        let processed = match extract_text(file_type, upload.content).await {
            Ok(text) => {
                self.store
                    .mark_file_processed(record.id, &summarize(&text))
                    .await?
            }
            Err(e) => {
                warn!(file_id = %record.id, %session_id, error = %e, "File processing failed");
                let reason = match &e {
                    Error::Execution(message) => message.clone(),
                    other => other.user_message(),
                };
                self.store.mark_file_failed(record.id, &reason).await?
            }
        };

        info!(
            file_id = %processed.id,
            %session_id,
            file_type = %processed.file_type,
            is_processed = processed.is_processed,
            "File uploaded"
        );
        Ok(processed)
    }

    pub async fn list(&self, session_id: Uuid, user_id: &str) -> Result<Vec<ResearchFile>> {
        self.store.list_files(session_id, user_id).await
    }

    pub async fn get(&self, session_id: Uuid, file_id: Uuid, user_id: &str) -> Result<ResearchFile> {
        self.store.get_file(session_id, file_id, user_id).await
    }

    pub async fn delete(&self, session_id: Uuid, file_id: Uuid, user_id: &str) -> Result<()> {
        self.store.delete_file(session_id, file_id, user_id).await?;
        info!(%file_id, %session_id, "File deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_FILE_SIZE;
    use crate::store::MemorySessionStore;

    fn txt(name: &str, body: &str) -> RawUpload {
        RawUpload {
            filename: name.to_string(),
            content: body.as_bytes().to_vec(),
            content_type: Some("text/plain".to_string()),
        }
    }

    async fn setup() -> (Arc<MemorySessionStore>, FileIngestion, Uuid) {
        let store = Arc::new(MemorySessionStore::new());
        let session = store.create("alice", "What is climate change?", None).await.unwrap();
        let ingestion = FileIngestion::new(store.clone(), DEFAULT_MAX_FILE_SIZE);
        (store, ingestion, session.id)
    }

    #[test]
    fn test_filename_rules() {
        assert_eq!(validate_filename(" notes.txt ").unwrap(), "notes.txt");
        assert!(validate_filename("").is_err());
        assert!(validate_filename("../etc/passwd.txt").is_err());
        assert!(validate_filename("bad|name.txt").is_err());
        assert!(validate_filename("nul\0.txt").is_err());
        assert!(validate_filename(&format!("{}.txt", "a".repeat(260))).is_err());
    }

    #[test]
    fn test_detect_type() {
        assert_eq!(detect_type("Report.PDF", None).unwrap(), FileType::Pdf);
        assert_eq!(detect_type("memo.docx", None).unwrap(), FileType::Docx);
        assert_eq!(
            detect_type("notes.txt", Some("application/octet-stream")).unwrap(),
            FileType::Txt
        );
        assert!(detect_type("script.exe", None).is_err());
        assert!(detect_type("README", None).is_err());
        assert!(detect_type("notes.txt", Some("application/pdf")).is_err());
    }

    #[test]
    fn test_sniff_content() {
        assert!(sniff_content(FileType::Pdf, b"%PDF-1.7 ...").is_ok());
        assert!(sniff_content(FileType::Pdf, b"MZ\x90\x00").is_err());
        assert!(sniff_content(FileType::Docx, b"PK\x03\x04rest").is_ok());
        assert!(sniff_content(FileType::Txt, b"plain words").is_ok());
        assert!(sniff_content(FileType::Txt, b"%PDF-1.4").is_err());
        assert!(sniff_content(FileType::Txt, b"bin\0ary").is_err());
    }

    #[test]
    fn test_summary_format() {
        let summary = summarize("one two\nthree");
        assert_eq!(
            summary,
            "one two\nthree\n\n[File Statistics: 3 words, 13 characters, 2 lines]"
        );

        let long = "word ".repeat(200);
        let summary = summarize(&long);
        assert!(summary.starts_with(&long[..SUMMARY_CHARS]));
        assert!(summary.contains("...\n\n[File Statistics: 200 words"));
    }

    #[tokio::test]
    async fn test_upload_txt_is_processed() {
        let (_, ingestion, session_id) = setup().await;
        let file = ingestion
            .upload(session_id, "alice", txt("notes.txt", "Sea levels are rising."))
            .await
            .unwrap();

        assert!(file.is_processed);
        assert_eq!(file.file_type, FileType::Txt);
        assert!(file.content_summary.unwrap().starts_with("Sea levels are rising."));
    }

    #[tokio::test]
    async fn test_oversized_upload_persists_nothing() {
        let (store, ingestion, session_id) = setup().await;
        let upload = RawUpload {
            filename: "huge.txt".to_string(),
            content: vec![b'a'; DEFAULT_MAX_FILE_SIZE as usize + 1],
            content_type: None,
        };

        let err = ingestion.upload(session_id, "alice", upload).await.unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "file"));
        assert_eq!(store.file_count().await, 0);
    }

    #[tokio::test]
    async fn test_disallowed_type_persists_nothing() {
        let (store, ingestion, session_id) = setup().await;
        let err = ingestion
            .upload(session_id, "alice", txt("payload.exe", "MZ"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(store.file_count().await, 0);
    }

    #[tokio::test]
    async fn test_docx_kept_with_processing_error() {
        let (_, ingestion, session_id) = setup().await;
        let upload = RawUpload {
            filename: "memo.docx".to_string(),
            content: b"PK\x03\x04word/document.xml".to_vec(),
            content_type: None,
        };

        let file = ingestion.upload(session_id, "alice", upload).await.unwrap();
        assert!(!file.is_processed);
        assert!(file.processing_error.as_deref().unwrap().contains("not supported"));
        assert!(!file.is_usable_context());
    }

    #[tokio::test]
    async fn test_unreadable_pdf_error_is_generic() {
        let err = extract_text(FileType::Pdf, b"%PDF-1.4\nnot really a pdf".to_vec())
            .await
            .unwrap_err();
        match err {
            Error::Execution(message) => assert_eq!(message, PDF_UNREADABLE),
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_users_session_is_not_found() {
        let (store, ingestion, session_id) = setup().await;
        let err = ingestion
            .upload(session_id, "mallory", txt("notes.txt", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(store.file_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let (_, ingestion, session_id) = setup().await;
        let file = ingestion
            .upload(session_id, "alice", txt("notes.txt", "content"))
            .await
            .unwrap();

        assert!(ingestion.delete(session_id, file.id, "bob").await.is_err());
        ingestion.delete(session_id, file.id, "alice").await.unwrap();
        assert!(ingestion.list(session_id, "alice").await.unwrap().is_empty());
        assert!(matches!(
            ingestion.get(session_id, file.id, "alice").await,
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_base64_request_decoding() {
        let request = UploadFileRequest {
            filename: "notes.txt".to_string(),
            content_base64: STANDARD.encode("hello"),
            content_type: None,
        };
        assert_eq!(RawUpload::try_from(request).unwrap().content, b"hello");

        let bad = UploadFileRequest {
            filename: "notes.txt".to_string(),
            content_base64: "***".to_string(),
            content_type: None,
        };
        assert!(RawUpload::try_from(bad).is_err());
    }
}
