//! Host-side content service: answers episode listings, file fetches and
//! abstracts from a content tree, and owns the shared Scope.

use crate::command::{EpisodeDescriptor, MetaPayload};
use crate::config::SessionConfig;
use crate::error::ShareError;
use crate::view::{CollectionView, ContentView, Library, MangaView, Shelf};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use storage::{ContentTree, Entry};
use tracing::{debug, info};

/// What a content root holds.
#[derive(Debug, Clone)]
pub enum HostContent {
    /// Root whose subdirectories are episodes
    Manga { title: String, episodes: Vec<Entry> },
    /// Root holding files directly
    SingleCollection { title: String, dir: PathBuf },
}

impl HostContent {
    /// A root with subdirectories is a manga, otherwise a single collection.
    pub async fn open(tree: &dyn ContentTree) -> anyhow::Result<Self> {
        let root = tree.root();
        let title = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let episodes = tree.list_directories(root).await?;
        if episodes.is_empty() {
            Ok(HostContent::SingleCollection {
                title,
                dir: root.to_path_buf(),
            })
        } else {
            Ok(HostContent::Manga { title, episodes })
        }
    }

    pub fn view(&self) -> ContentView {
        match self {
            HostContent::Manga { title, episodes } => ContentView::Manga(MangaView {
                title: title.clone(),
                episodes: episodes.iter().map(|e| e.name.clone()).collect(),
            }),
            HostContent::SingleCollection { title, .. } => {
                ContentView::SingleCollection(CollectionView {
                    title: title.clone(),
                })
            }
        }
    }
}

pub struct ContentService {
    tree: Arc<dyn ContentTree>,
    content: HostContent,
    view: ContentView,
    scope: AtomicU32,
    abstract_prefix_len: usize,
}

impl ContentService {
    pub async fn open(tree: Arc<dyn ContentTree>, config: &SessionConfig) -> Result<Self, ShareError> {
        let content = HostContent::open(tree.as_ref()).await?;
        Ok(Self::new(tree, content, config))
    }

    pub fn new(tree: Arc<dyn ContentTree>, content: HostContent, config: &SessionConfig) -> Self {
        let view = content.view();
        info!(
            "Sharing {:?} \"{}\" with {} episode(s)",
            view.content_type(),
            view.title(),
            view.episode_count()
        );
        Self {
            tree,
            content,
            view,
            scope: AtomicU32::new(0),
            abstract_prefix_len: config.abstract_prefix_len,
        }
    }

    /// Episode last committed by a successful listing.
    pub fn scope(&self) -> u32 {
        self.scope.load(Ordering::SeqCst)
    }

    pub fn content_view(&self) -> &ContentView {
        &self.view
    }

    pub fn meta(&self) -> MetaPayload {
        self.view.to_meta(self.scope())
    }

    async fn episode_files(&self, scope: u32) -> Result<(String, Vec<Entry>), ShareError> {
        let resolved = self.view.resolve_scope(scope)?;
        let (name, dir) = match &self.content {
            HostContent::Manga { episodes, .. } => {
                let episode = &episodes[resolved as usize];
                (episode.name.clone(), episode.path.clone())
            }
            HostContent::SingleCollection { title, dir } => (title.clone(), dir.clone()),
        };
        let files = self.tree.list_files(&dir).await?;
        Ok((name, files))
    }

    /// List the files of an episode and make it the shared scope.
    pub async fn list_episode(&self, scope: u32) -> Result<EpisodeDescriptor, ShareError> {
        let (name, files) = self.episode_files(scope).await?;
        self.scope.store(scope, Ordering::SeqCst);
        debug!(scope, files = files.len(), "episode listed");
        Ok(EpisodeDescriptor {
            name,
            length: files.len() as u32,
        })
    }

    /// Bytes of the `index`-th file of an episode, in natural order.
    pub async fn fetch_file(&self, scope: u32, index: u32) -> Result<Vec<u8>, ShareError> {
        let (_, files) = self.episode_files(scope).await?;
        let entry = files.get(index as usize).ok_or(ShareError::IndexOutOfRange {
            index,
            length: files.len() as u32,
        })?;
        Ok(self.tree.read_file(entry).await?)
    }

    /// Concatenated leading bytes of every file of an episode.
    pub async fn file_abstract(&self, scope: u32) -> Result<Vec<u8>, ShareError> {
        let (_, files) = self.episode_files(scope).await?;
        let mut out = Vec::with_capacity(files.len() * self.abstract_prefix_len);
        for entry in &files {
            out.extend(self.tree.read_prefix(entry, self.abstract_prefix_len).await?);
        }
        debug!(scope, files = files.len(), bytes = out.len(), "abstract built");
        Ok(out)
    }
}

#[async_trait]
impl Library for ContentService {
    async fn list_episode(&self, scope: u32) -> Result<EpisodeDescriptor, ShareError> {
        ContentService::list_episode(self, scope).await
    }

    async fn fetch(&self, scope: u32, index: u32) -> Result<Vec<u8>, ShareError> {
        self.fetch_file(scope, index).await
    }

    fn view(&self) -> Option<ContentView> {
        Some(self.view.clone())
    }
}
