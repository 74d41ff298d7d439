//! File-backed media store for wish-page photos, videos, audio and
//! downloadable documents.
//!
//! Files live on disk at `{data_dir}/media/{owner}/{kind}/{sha256}.{ext}`.
//! Uploading the same bytes twice returns the first reference. Metadata is
//! indexed through [`MediaIndex`] (the SQLite database in production).
//!
//! A video may point at one of its owner's photos as its poster image. A
//! document's caption doubles as the label of its download link.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Max photo size (10 MiB).
pub const MAX_PHOTO_SIZE: usize = 10 * 1024 * 1024;

/// Max video size (200 MiB).
pub const MAX_VIDEO_SIZE: usize = 200 * 1024 * 1024;

/// Max audio size (50 MiB).
pub const MAX_AUDIO_SIZE: usize = 50 * 1024 * 1024;

/// Max document size (20 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 20 * 1024 * 1024;

/// Max caption length, in characters.
pub const MAX_CAPTION_CHARS: usize = 200;

/// Kind of uploaded media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    /// Downloadable file, such as a letter
    Document,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }

    /// Parse a kind; plural forms ("photos") are accepted for route segments
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "photo" | "photos" => Some(MediaKind::Photo),
            "video" | "videos" => Some(MediaKind::Video),
            "audio" | "audios" => Some(MediaKind::Audio),
            "document" | "documents" | "download" | "downloads" => Some(MediaKind::Document),
            _ => None,
        }
    }

    pub fn max_size(&self) -> usize {
        match self {
            MediaKind::Photo => MAX_PHOTO_SIZE,
            MediaKind::Video => MAX_VIDEO_SIZE,
            MediaKind::Audio => MAX_AUDIO_SIZE,
            MediaKind::Document => MAX_DOCUMENT_SIZE,
        }
    }

    /// File extension for an accepted content type, `None` if not accepted
    pub fn extension_for(&self, content_type: &str) -> Option<&'static str> {
        match (self, content_type) {
            (MediaKind::Photo, "image/jpeg") => Some("jpg"),
            (MediaKind::Photo, "image/png") => Some("png"),
            (MediaKind::Photo, "image/gif") => Some("gif"),
            (MediaKind::Photo, "image/webp") => Some("webp"),
            (MediaKind::Video, "video/mp4") => Some("mp4"),
            (MediaKind::Video, "video/webm") => Some("webm"),
            (MediaKind::Video, "video/quicktime") => Some("mov"),
            (MediaKind::Audio, "audio/mpeg") => Some("mp3"),
            (MediaKind::Audio, "audio/ogg") => Some("ogg"),
            (MediaKind::Audio, "audio/wav") => Some("wav"),
            (MediaKind::Audio, "audio/mp4") => Some("m4a"),
            (MediaKind::Document, "application/pdf") => Some("pdf"),
            _ => None,
        }
    }
}

/// Metadata about a stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaReference {
    pub id: String,
    pub owner: Identity,
    pub kind: MediaKind,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub caption: Option<String>,
    /// Id of the photo shown before a video plays
    pub poster: Option<String>,
    /// Unix milliseconds
    pub created_at: i64,
}

/// Metadata index behind [`FsMediaStore`]
pub trait MediaIndex: Send + Sync {
    /// Record a file; if `(owner, kind, filename)` is already indexed the
    /// existing reference is returned unchanged
    fn insert_media(&self, reference: &MediaReference) -> Result<MediaReference>;

    fn media_for(&self, owner: &Identity, kind: MediaKind) -> Result<Vec<MediaReference>>;

    fn media_by_id(&self, id: &str) -> Result<Option<MediaReference>>;

    fn media_by_filename(&self, owner: &Identity, filename: &str) -> Result<Option<MediaReference>>;

    /// Set or clear a reference's poster. Returns `false` if `id` is unknown.
    fn set_media_poster(&self, id: &str, poster: Option<&str>) -> Result<bool>;
}

/// Per-identity media persistence
pub trait MediaStore: Send + Sync {
    fn store(
        &self,
        owner: &Identity,
        kind: MediaKind,
        content_type: &str,
        bytes: &[u8],
        caption: Option<String>,
    ) -> Result<MediaReference>;

    /// An owner's media of one kind, oldest first
    fn list(&self, owner: &Identity, kind: MediaKind) -> Result<Vec<MediaReference>>;

    fn get(&self, id: &str) -> Result<Option<MediaReference>>;

    /// File contents and content type
    fn read(&self, owner: &Identity, filename: &str) -> Result<(Vec<u8>, String)>;

    /// Point one of `owner`'s videos at one of their photos, or clear it
    /// with `None`.
    fn set_poster(
        &self,
        owner: &Identity,
        video_id: &str,
        photo_id: Option<&str>,
    ) -> Result<MediaReference>;
}

/// [`MediaStore`] on the local filesystem
pub struct FsMediaStore {
    root: PathBuf,
    index: Arc<dyn MediaIndex>,
}

impl FsMediaStore {
    /// Files go under `{data_dir}/media`
    pub fn new(data_dir: impl AsRef<Path>, index: Arc<dyn MediaIndex>) -> Self {
        Self {
            root: data_dir.as_ref().join("media"),
            index,
        }
    }

    fn path_for(&self, owner: &Identity, kind: MediaKind, filename: &str) -> PathBuf {
        self.root.join(owner.as_str()).join(kind.as_str()).join(filename)
    }

    /// Write `bytes` to `file_path` through a temp file of its own.
    ///
    /// Concurrent writers of the same content race only on the final rename;
    /// whoever loses finds the file already in place.
    fn write_file(&self, file_path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(dir) = file_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                tracing::error!(error = %e, dir = %dir.display(), "Failed to create media directory");
                Error::StorageFailure(format!("Failed to create media directory: {}", e))
            })?;
        }

        let mut tmp_name = file_path.as_os_str().to_owned();
        tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        let tmp_path = PathBuf::from(tmp_name);

        if let Err(e) = std::fs::write(&tmp_path, bytes) {
            tracing::error!(error = %e, path = %tmp_path.display(), "Failed to write media file");
            let _ = std::fs::remove_file(&tmp_path);
            return Err(Error::StorageFailure(format!("Failed to write media file: {}", e)));
        }
        if let Err(e) = std::fs::rename(&tmp_path, file_path) {
            let _ = std::fs::remove_file(&tmp_path);
            if file_path.is_file() {
                tracing::debug!(path = %file_path.display(), "Media file written concurrently");
                return Ok(());
            }
            tracing::error!(error = %e, "Failed to rename temp media file");
            return Err(Error::StorageFailure(format!("Failed to finalize media file: {}", e)));
        }
        Ok(())
    }

    /// Look up `id` and check it is `owner`'s media of `kind`
    fn owned(&self, owner: &Identity, id: &str, kind: MediaKind) -> Result<MediaReference> {
        let reference = self
            .index
            .media_by_id(id)?
            .ok_or_else(|| Error::NotFound(format!("media {}", id)))?;
        if &reference.owner != owner {
            return Err(Error::AuthorizationDenied(format!(
                "media {} does not belong to {}",
                id, owner
            )));
        }
        if reference.kind != kind {
            return Err(Error::InvalidOperation(format!(
                "media {} is a {}, not a {}",
                id,
                reference.kind.as_str(),
                kind.as_str()
            )));
        }
        Ok(reference)
    }
}

impl MediaStore for FsMediaStore {
    fn store(
        &self,
        owner: &Identity,
        kind: MediaKind,
        content_type: &str,
        bytes: &[u8],
        caption: Option<String>,
    ) -> Result<MediaReference> {
        let ext = kind.extension_for(content_type).ok_or_else(|| {
            Error::InvalidOperation(format!(
                "content type {} is not accepted for {}",
                content_type,
                kind.as_str()
            ))
        })?;
        if bytes.is_empty() {
            return Err(Error::InvalidOperation("file is empty".into()));
        }
        if bytes.len() > kind.max_size() {
            return Err(Error::InvalidOperation(format!(
                "{} exceeds {} bytes",
                kind.as_str(),
                kind.max_size()
            )));
        }
        let caption = caption
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if let Some(c) = &caption {
            if c.chars().count() > MAX_CAPTION_CHARS {
                return Err(Error::InvalidOperation(format!(
                    "caption exceeds {} characters",
                    MAX_CAPTION_CHARS
                )));
            }
        }

        let hash = hex::encode(Sha256::digest(bytes));
        let filename = format!("{}.{}", hash, ext);
        let file_path = self.path_for(owner, kind, &filename);

        if !file_path.is_file() {
            self.write_file(&file_path, bytes)?;
        }

        let reference = self.index.insert_media(&MediaReference {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.clone(),
            kind,
            filename,
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
            caption,
            poster: None,
            created_at: crate::time::now_timestamp_millis(),
        })?;

        tracing::info!(
            owner = %owner,
            kind = kind.as_str(),
            filename = %reference.filename,
            size = reference.size,
            "Media stored"
        );
        Ok(reference)
    }

    fn list(&self, owner: &Identity, kind: MediaKind) -> Result<Vec<MediaReference>> {
        self.index.media_for(owner, kind)
    }

    fn get(&self, id: &str) -> Result<Option<MediaReference>> {
        self.index.media_by_id(id)
    }

    fn read(&self, owner: &Identity, filename: &str) -> Result<(Vec<u8>, String)> {
        // Only indexed names are ever joined onto the root
        let reference = self
            .index
            .media_by_filename(owner, filename)?
            .ok_or_else(|| Error::NotFound(format!("media {}/{}", owner, filename)))?;

        let path = self.path_for(owner, reference.kind, &reference.filename);
        match std::fs::read(&path) {
            Ok(data) => Ok((data, reference.content_type)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Indexed media file is missing");
                Err(Error::NotFound(format!("media {}/{}", owner, filename)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_poster(
        &self,
        owner: &Identity,
        video_id: &str,
        photo_id: Option<&str>,
    ) -> Result<MediaReference> {
        self.owned(owner, video_id, MediaKind::Video)?;
        if let Some(photo_id) = photo_id {
            self.owned(owner, photo_id, MediaKind::Photo)?;
        }

        if !self.index.set_media_poster(video_id, photo_id)? {
            return Err(Error::NotFound(format!("media {}", video_id)));
        }
        tracing::info!(owner = %owner, video = video_id, poster = ?photo_id, "Video poster set");

        self.index
            .media_by_id(video_id)?
            .ok_or_else(|| Error::NotFound(format!("media {}", video_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn setup() -> (tempfile::TempDir, FsMediaStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(None).unwrap());
        let store = FsMediaStore::new(dir.path(), db);
        (dir, store)
    }

    fn alice() -> Identity {
        Identity::parse("alice").unwrap()
    }

    #[test]
    fn test_kind_parse_and_extensions() {
        assert_eq!(MediaKind::parse("photos"), Some(MediaKind::Photo));
        assert_eq!(MediaKind::parse("audio"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::parse("downloads"), Some(MediaKind::Document));
        assert_eq!(MediaKind::parse("docs"), None);
        assert_eq!(MediaKind::Photo.extension_for("image/jpeg"), Some("jpg"));
        assert_eq!(MediaKind::Photo.extension_for("video/mp4"), None);
        assert_eq!(MediaKind::Document.extension_for("application/pdf"), Some("pdf"));
        assert_eq!(MediaKind::Document.extension_for("text/html"), None);
    }

    #[test]
    fn test_store_writes_content_addressed_file() {
        let (dir, store) = setup();

        let reference = store
            .store(&alice(), MediaKind::Photo, "image/png", b"png-bytes", Some(" Our selfie ".into()))
            .unwrap();

        assert!(reference.filename.ends_with(".png"));
        assert_eq!(reference.filename.len(), 64 + 4);
        assert_eq!(reference.caption.as_deref(), Some("Our selfie"));
        assert!(dir
            .path()
            .join("media/alice/photo")
            .join(&reference.filename)
            .is_file());

        let (data, content_type) = store.read(&alice(), &reference.filename).unwrap();
        assert_eq!(data, b"png-bytes");
        assert_eq!(content_type, "image/png");
        assert_eq!(store.get(&reference.id).unwrap(), Some(reference));
    }

    #[test]
    fn test_duplicate_upload_returns_existing() {
        let (_dir, store) = setup();

        let first = store
            .store(&alice(), MediaKind::Audio, "audio/mpeg", b"song", Some("Birthday song".into()))
            .unwrap();
        let second = store
            .store(&alice(), MediaKind::Audio, "audio/mpeg", b"song", None)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list(&alice(), MediaKind::Audio).unwrap().len(), 1);
    }

    #[test]
    fn test_store_rejects_bad_input() {
        let (_dir, store) = setup();

        assert!(matches!(
            store.store(&alice(), MediaKind::Video, "image/png", b"x", None),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            store.store(&alice(), MediaKind::Photo, "image/png", b"", None),
            Err(Error::InvalidOperation(_))
        ));
        let oversized = vec![0u8; MAX_PHOTO_SIZE + 1];
        assert!(matches!(
            store.store(&alice(), MediaKind::Photo, "image/jpeg", &oversized, None),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_read_unknown_file() {
        let (_dir, store) = setup();
        assert!(matches!(
            store.read(&alice(), "../../etc/passwd"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_list_is_per_owner_and_kind() {
        let (_dir, store) = setup();
        let bob = Identity::parse("bob").unwrap();

        store.store(&alice(), MediaKind::Photo, "image/jpeg", b"a1", None).unwrap();
        store.store(&alice(), MediaKind::Photo, "image/jpeg", b"a2", None).unwrap();
        store.store(&alice(), MediaKind::Video, "video/mp4", b"v1", None).unwrap();
        store.store(&bob, MediaKind::Photo, "image/jpeg", b"a1", None).unwrap();

        assert_eq!(store.list(&alice(), MediaKind::Photo).unwrap().len(), 2);
        assert_eq!(store.list(&alice(), MediaKind::Video).unwrap().len(), 1);
        assert_eq!(store.list(&bob, MediaKind::Photo).unwrap().len(), 1);
        assert!(store.list(&bob, MediaKind::Audio).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_identical_uploads() {
        let (dir, store) = setup();
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.resize(1024 * 1024, 7);
        let writers = 8;

        for round in 0..10u8 {
            bytes[8] = round;
            let barrier = std::sync::Barrier::new(writers);
            let results: Vec<Result<MediaReference>> = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..writers)
                    .map(|_| {
                        scope.spawn(|| {
                            barrier.wait();
                            store.store(&alice(), MediaKind::Photo, "image/png", &bytes, None)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let references: Vec<MediaReference> =
                results.into_iter().map(|r| r.unwrap()).collect();
            assert!(references.iter().all(|r| r == &references[0]));

            let (data, _) = store.read(&alice(), &references[0].filename).unwrap();
            assert_eq!(data, bytes);
        }

        assert_eq!(store.list(&alice(), MediaKind::Photo).unwrap().len(), 10);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("media/alice/photo"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {:?}", leftovers);
    }

    #[test]
    fn test_store_document_with_link_label() {
        let (_dir, store) = setup();

        let letter = store
            .store(
                &alice(),
                MediaKind::Document,
                "application/pdf",
                b"%PDF-1.4 letter",
                Some("Read my letter".into()),
            )
            .unwrap();

        assert!(letter.filename.ends_with(".pdf"));
        assert_eq!(letter.caption.as_deref(), Some("Read my letter"));
        assert_eq!(store.list(&alice(), MediaKind::Document).unwrap(), vec![letter]);
        assert!(matches!(
            store.store(&alice(), MediaKind::Document, "image/png", b"x", None),
            Err(Error::InvalidOperation(_))
        ));
        let oversized = vec![0u8; MAX_DOCUMENT_SIZE + 1];
        assert!(matches!(
            store.store(&alice(), MediaKind::Document, "application/pdf", &oversized, None),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_set_and_clear_video_poster() {
        let (_dir, store) = setup();
        let video = store
            .store(&alice(), MediaKind::Video, "video/mp4", b"clip", None)
            .unwrap();
        let photo = store
            .store(&alice(), MediaKind::Photo, "image/jpeg", b"still", None)
            .unwrap();
        assert_eq!(video.poster, None);

        let updated = store.set_poster(&alice(), &video.id, Some(&photo.id)).unwrap();
        assert_eq!(updated.poster.as_deref(), Some(photo.id.as_str()));
        assert_eq!(store.list(&alice(), MediaKind::Video).unwrap(), vec![updated]);

        let cleared = store.set_poster(&alice(), &video.id, None).unwrap();
        assert_eq!(cleared.poster, None);
    }

    #[test]
    fn test_set_poster_checks_owner_and_kinds() {
        let (_dir, store) = setup();
        let bob = Identity::parse("bob").unwrap();
        let video = store
            .store(&alice(), MediaKind::Video, "video/mp4", b"clip", None)
            .unwrap();
        let photo = store
            .store(&alice(), MediaKind::Photo, "image/jpeg", b"still", None)
            .unwrap();
        let bobs_photo = store
            .store(&bob, MediaKind::Photo, "image/jpeg", b"bob", None)
            .unwrap();

        assert!(matches!(
            store.set_poster(&bob, &video.id, Some(&bobs_photo.id)),
            Err(Error::AuthorizationDenied(_))
        ));
        assert!(matches!(
            store.set_poster(&alice(), &video.id, Some(&bobs_photo.id)),
            Err(Error::AuthorizationDenied(_))
        ));
        assert!(matches!(
            store.set_poster(&alice(), &photo.id, Some(&photo.id)),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            store.set_poster(&alice(), &video.id, Some(&video.id)),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            store.set_poster(&alice(), "missing", None),
            Err(Error::NotFound(_))
        ));
        assert_eq!(store.get(&video.id).unwrap().unwrap().poster, None);
    }
}
