//! Public wish pages: an owner's note plus everything they uploaded.

use serde::Serialize;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityDirectory};
use crate::media::{MediaKind, MediaReference, MediaStore};

/// Max note length, in characters.
pub const MAX_NOTE_CHARS: usize = 4000;

/// Stored note for a wish page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WishNote {
    pub note: String,
    /// Unix milliseconds
    pub updated_at: i64,
}

/// Persistence for wish notes
pub trait WishRepository: Send + Sync {
    fn wish_note(&self, owner: &Identity) -> Result<Option<WishNote>>;

    fn put_wish_note(&self, owner: &Identity, note: &WishNote) -> Result<()>;
}

/// A wish page as served to visitors
#[derive(Debug, Clone, Serialize)]
pub struct WishPage {
    pub owner: Identity,
    pub note: String,
    pub updated_at: Option<i64>,
    pub photos: Vec<MediaReference>,
    pub videos: Vec<MediaReference>,
    pub audios: Vec<MediaReference>,
    /// Documents offered as download links, labelled by their captions
    pub downloads: Vec<MediaReference>,
}

pub struct WishService {
    repo: Arc<dyn WishRepository>,
    directory: Arc<dyn IdentityDirectory>,
    media: Arc<dyn MediaStore>,
}

impl WishService {
    pub fn new(
        repo: Arc<dyn WishRepository>,
        directory: Arc<dyn IdentityDirectory>,
        media: Arc<dyn MediaStore>,
    ) -> Self {
        Self { repo, directory, media }
    }

    /// Replace the owner's note. An empty note clears the page text.
    pub fn set_note(&self, owner: &Identity, note: &str) -> Result<WishNote> {
        let note = note.trim();
        if note.chars().count() > MAX_NOTE_CHARS {
            return Err(Error::InvalidOperation(format!(
                "note exceeds {} characters",
                MAX_NOTE_CHARS
            )));
        }
        let stored = WishNote {
            note: note.to_string(),
            updated_at: crate::time::now_timestamp_millis(),
        };
        self.repo.put_wish_note(owner, &stored)?;
        tracing::debug!(owner = %owner, len = stored.note.len(), "Wish note updated");
        Ok(stored)
    }

    /// Assemble the public page for `owner`
    pub fn page(&self, owner: &Identity) -> Result<WishPage> {
        if !self.directory.exists(owner)? {
            return Err(Error::NotFound(format!("identity {}", owner)));
        }
        let note = self.repo.wish_note(owner)?;
        Ok(WishPage {
            owner: owner.clone(),
            updated_at: note.as_ref().map(|n| n.updated_at),
            note: note.map(|n| n.note).unwrap_or_default(),
            photos: self.media.list(owner, MediaKind::Photo)?,
            videos: self.media.list(owner, MediaKind::Video)?,
            audios: self.media.list(owner, MediaKind::Audio)?,
            downloads: self.media.list(owner, MediaKind::Document)?,
        })
    }
}
