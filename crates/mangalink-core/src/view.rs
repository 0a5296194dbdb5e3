use crate::command::{ContentType, EpisodeDescriptor, MetaPayload};
use crate::error::ShareError;
use async_trait::async_trait;

/// Shape of shared content, as both peers see it.
pub trait Shelf {
    fn content_type(&self) -> ContentType;
    fn title(&self) -> &str;
    fn episode_count(&self) -> usize;
    fn episode_name(&self, scope: u32) -> Option<&str>;

    /// Map a requested scope onto an episode of this shelf.
    fn resolve_scope(&self, scope: u32) -> Result<u32, ShareError>;
}

/// A manga: an ordered list of episodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MangaView {
    pub title: String,
    pub episodes: Vec<String>,
}

impl Shelf for MangaView {
    fn content_type(&self) -> ContentType {
        ContentType::Manga
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn episode_count(&self) -> usize {
        self.episodes.len()
    }

    fn episode_name(&self, scope: u32) -> Option<&str> {
        self.episodes.get(scope as usize).map(String::as_str)
    }

    fn resolve_scope(&self, scope: u32) -> Result<u32, ShareError> {
        if (scope as usize) < self.episodes.len() {
            Ok(scope)
        } else {
            Err(ShareError::ScopeOutOfRange {
                scope,
                count: self.episodes.len() as u32,
            })
        }
    }
}

/// A single flat collection of files; every scope names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionView {
    pub title: String,
}

impl Shelf for CollectionView {
    fn content_type(&self) -> ContentType {
        ContentType::Episode
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn episode_count(&self) -> usize {
        1
    }

    fn episode_name(&self, _scope: u32) -> Option<&str> {
        Some(&self.title)
    }

    fn resolve_scope(&self, _scope: u32) -> Result<u32, ShareError> {
        Ok(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentView {
    Manga(MangaView),
    SingleCollection(CollectionView),
}

impl ContentView {
    /// Rebuild the Host's view from a meta push. `None` for undefined content.
    pub fn from_meta(meta: &MetaPayload) -> Option<Self> {
        match meta.content_type {
            ContentType::Manga => Some(ContentView::Manga(MangaView {
                title: meta.manga.clone(),
                episodes: meta.episode_names.clone().unwrap_or_default(),
            })),
            ContentType::Episode => Some(ContentView::SingleCollection(CollectionView {
                title: meta.episode.clone(),
            })),
            ContentType::Undefined => None,
        }
    }

    pub fn to_meta(&self, scope: u32) -> MetaPayload {
        match self {
            ContentView::Manga(manga) => MetaPayload {
                manga: manga.title.clone(),
                episode: manga.episode_name(scope).unwrap_or_default().to_string(),
                content_type: ContentType::Manga,
                episode_names: Some(manga.episodes.clone()),
            },
            ContentView::SingleCollection(collection) => MetaPayload {
                manga: String::new(),
                episode: collection.title.clone(),
                content_type: ContentType::Episode,
                episode_names: None,
            },
        }
    }

    fn shelf(&self) -> &dyn Shelf {
        match self {
            ContentView::Manga(manga) => manga,
            ContentView::SingleCollection(collection) => collection,
        }
    }
}

impl Shelf for ContentView {
    fn content_type(&self) -> ContentType {
        self.shelf().content_type()
    }

    fn title(&self) -> &str {
        self.shelf().title()
    }

    fn episode_count(&self) -> usize {
        self.shelf().episode_count()
    }

    fn episode_name(&self, scope: u32) -> Option<&str> {
        self.shelf().episode_name(scope)
    }

    fn resolve_scope(&self, scope: u32) -> Result<u32, ShareError> {
        self.shelf().resolve_scope(scope)
    }
}

/// Uniform access to shared content, local on the Host or remote on the Client.
#[async_trait]
pub trait Library: Send + Sync {
    async fn list_episode(&self, scope: u32) -> Result<EpisodeDescriptor, ShareError>;
    async fn fetch(&self, scope: u32, index: u32) -> Result<Vec<u8>, ShareError>;
    fn view(&self) -> Option<ContentView>;
}
