use std::sync::Arc;

use panrelay_core::RemoteFile;

use crate::provider::{CloudProvider, ProviderError};

/// Outcome of walking a slash-separated folder path below an owner's root.
/// When a segment is missing the walk stops there: `anchor_id` is the last
/// folder that did exist and `resolved_depth` counts the matched segments.
#[derive(Debug, Clone)]
pub struct FolderResolution {
    pub folder_exists: bool,
    pub folder_id: Option<i64>,
    pub anchor_id: i64,
    pub resolved_depth: usize,
    pub files: Vec<RemoteFile>,
}

/// Resolves folder paths against the remote tree, one listing per segment.
pub struct FolderResolver {
    provider: Arc<dyn CloudProvider>,
}

impl FolderResolver {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    pub async fn resolve(
        &self,
        owner_id: &str,
        root_id: i64,
        path: &str,
    ) -> Result<FolderResolution, ProviderError> {
        let segments = split_path(path);
        let mut current = root_id;
        let mut depth = 0;

        for segment in &segments {
            let children = self.provider.list_folder(owner_id, current).await?;
            let found = children.iter().find(|child| {
                child.is_dir() && !child.is_trashed() && child.filename == *segment
            });
            match found {
                Some(dir) => {
                    current = dir.file_id;
                    depth += 1;
                }
                None => {
                    return Ok(FolderResolution {
                        folder_exists: false,
                        folder_id: None,
                        anchor_id: current,
                        resolved_depth: depth,
                        files: Vec::new(),
                    });
                }
            }
        }

        let files = self
            .provider
            .list_folder(owner_id, current)
            .await?
            .into_iter()
            .filter(|file| !file.is_trashed())
            .collect();

        Ok(FolderResolution {
            folder_exists: true,
            folder_id: Some(current),
            anchor_id: current,
            resolved_depth: depth,
            files,
        })
    }

    /// Resolves the path, creating any missing tail segments. Returns the
    /// leaf folder id.
    pub async fn resolve_or_create(
        &self,
        owner_id: &str,
        root_id: i64,
        path: &str,
    ) -> Result<i64, ProviderError> {
        let resolution = self.resolve(owner_id, root_id, path).await?;
        self.create_remaining(owner_id, &resolution, path).await
    }

    /// Creates the segments a previous `resolve` found missing, continuing
    /// from its anchor. A fully resolved path is returned as-is.
    pub async fn create_remaining(
        &self,
        owner_id: &str,
        resolution: &FolderResolution,
        path: &str,
    ) -> Result<i64, ProviderError> {
        if let Some(folder_id) = resolution.folder_id {
            return Ok(folder_id);
        }
        let segments = split_path(path);
        let mut current = resolution.anchor_id;
        for segment in &segments[resolution.resolved_depth..] {
            current = self
                .provider
                .create_folder(owner_id, segment, current)
                .await?;
        }
        Ok(current)
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Two-tier duplicate check over a folder listing. The exact tier compares
/// extension-stripped names case-insensitively; the fuzzy tier reduces both
/// sides to lowercase alphanumeric code points and also catches raw
/// provider names that still start with the video id.
pub fn find_duplicate(
    files: &[RemoteFile],
    rename_target: &str,
    video_id: &str,
) -> Option<String> {
    let target_stem = strip_extension(rename_target).to_lowercase();
    let target_fuzzy = normalize(&target_stem);
    let video_fuzzy = normalize(video_id);

    for file in files {
        if file.is_dir() || file.is_trashed() {
            continue;
        }
        let stem = strip_extension(&file.filename).to_lowercase();
        if !target_stem.is_empty() && stem == target_stem {
            return Some(file.filename.clone());
        }
        let fuzzy = normalize(&stem);
        if !target_fuzzy.is_empty() && fuzzy == target_fuzzy {
            return Some(file.filename.clone());
        }
        if !video_fuzzy.is_empty() && fuzzy.starts_with(&video_fuzzy) {
            return Some(file.filename.clone());
        }
    }
    None
}

fn strip_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && ext.len() <= 5 => stem,
        _ => name,
    }
}

// Keeps every alphanumeric code point, so CJK titles survive intact.
fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}
