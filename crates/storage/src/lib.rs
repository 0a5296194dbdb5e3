use anyhow::{Context, Result};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// A named node of the content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
}

/// Read access to a content tree. Listings come back in natural order.
#[async_trait]
pub trait ContentTree: Send + Sync {
    fn root(&self) -> &Path;
    async fn list_directories(&self, dir: &Path) -> Result<Vec<Entry>>;
    async fn list_files(&self, dir: &Path) -> Result<Vec<Entry>>;
    async fn read_file(&self, entry: &Entry) -> Result<Vec<u8>>;

    /// At most `len` leading bytes of the file.
    async fn read_prefix(&self, entry: &Entry, len: usize) -> Result<Vec<u8>> {
        let mut data = self.read_file(entry).await?;
        data.truncate(len);
        Ok(data)
    }
}

/// Numeric-aware, case-insensitive name ordering ("2.jpg" < "10.jpg").
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut x = a.chars().peekable();
    let mut y = b.chars().peekable();
    loop {
        let (c, d) = match (x.peek().copied(), y.peek().copied()) {
            (None, None) => break,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(c), Some(d)) => (c, d),
        };
        if c.is_ascii_digit() && d.is_ascii_digit() {
            let m = take_digits(&mut x);
            let n = take_digits(&mut y);
            let ord = cmp_digit_runs(&m, &n);
            if ord != Ordering::Equal {
                return ord;
            }
            continue;
        }
        let ord = c.to_lowercase().cmp(d.to_lowercase());
        if ord != Ordering::Equal {
            return ord;
        }
        x.next();
        y.next();
    }
    // Equal under folding; fall back to a total order.
    a.cmp(b)
}

fn take_digits(it: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = it.peek().copied().filter(char::is_ascii_digit) {
        run.push(c);
        it.next();
    }
    run
}

fn cmp_digit_runs(m: &str, n: &str) -> Ordering {
    let m = m.trim_start_matches('0');
    let n = n.trim_start_matches('0');
    m.len().cmp(&n.len()).then_with(|| m.cmp(n))
}

/// Local filesystem content tree.
#[derive(Clone)]
pub struct LocalContentTree {
    root: PathBuf,
}

impl LocalContentTree {
    pub fn new(root: PathBuf) -> Result<Self> {
        let meta = std::fs::metadata(&root)
            .with_context(|| format!("Failed to open content root {}", root.display()))?;
        if !meta.is_dir() {
            anyhow::bail!("Content root {} is not a directory", root.display());
        }
        Ok(Self { root })
    }

    async fn entries(&self, dir: &Path, kind: EntryKind) -> Result<Vec<Entry>> {
        let mut rd = fs::read_dir(dir)
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?;

        let mut out = Vec::new();
        while let Some(item) = rd.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            // Skip hidden files (.DS_Store and friends)
            if name.starts_with('.') {
                continue;
            }
            let file_type = item.file_type().await?;
            let item_kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                continue;
            };
            if item_kind == kind {
                out.push(Entry {
                    name,
                    path: item.path(),
                    kind,
                });
            }
        }
        out.sort_by(|a, b| natural_cmp(&a.name, &b.name));

        tracing::debug!("Listed {} {:?} entries in {}", out.len(), kind, dir.display());
        Ok(out)
    }
}

#[async_trait]
impl ContentTree for LocalContentTree {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn list_directories(&self, dir: &Path) -> Result<Vec<Entry>> {
        self.entries(dir, EntryKind::Directory).await
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<Entry>> {
        self.entries(dir, EntryKind::File).await
    }

    async fn read_file(&self, entry: &Entry) -> Result<Vec<u8>> {
        let data = fs::read(&entry.path)
            .await
            .with_context(|| format!("Failed to read {}", entry.path.display()))?;

        tracing::debug!("Read {} ({} bytes)", entry.name, data.len());
        Ok(data)
    }

    async fn read_prefix(&self, entry: &Entry, len: usize) -> Result<Vec<u8>> {
        let file = fs::File::open(&entry.path)
            .await
            .with_context(|| format!("Failed to open {}", entry.path.display()))?;

        let mut data = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut data).await?;
        Ok(data)
    }
}
