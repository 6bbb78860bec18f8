//! Visual assets shown behind each segment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use showrunner_shared::{Result, ShowrunnerError, VisualAsset};

/// Extensions probed for per-segment visuals, in priority order.
const EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "mp4"];

/// Supplies the visual for a segment.
pub trait VisualAssetProvider: Send + Sync {
    fn asset_for(&self, segment_index: usize) -> Option<VisualAsset>;
}

/// Looks for `segment_{i}.{png,jpg,jpeg,mp4}` in a directory, falling back
/// to a single background image when one is configured.
pub struct DirectoryAssetProvider {
    dir: PathBuf,
    background: Option<PathBuf>,
}

impl DirectoryAssetProvider {
    pub fn new(dir: impl Into<PathBuf>, background: Option<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            background,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl VisualAssetProvider for DirectoryAssetProvider {
    fn asset_for(&self, segment_index: usize) -> Option<VisualAsset> {
        let found = EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("segment_{segment_index}.{ext}")))
            .find(|p| p.is_file());

        match found {
            Some(path) => Some(VisualAsset::from_path(path)),
            None => self
                .background
                .as_ref()
                .filter(|p| p.is_file())
                .map(|p| {
                    debug!(segment = segment_index, background = %p.display(), "using background visual");
                    VisualAsset::from_path(p)
                }),
        }
    }
}

/// Resolve a visual for every segment in `0..count`.
///
/// A segment without a visual is a hard failure; nothing is rendered with
/// a gap.
pub fn resolve_visuals(
    provider: &dyn VisualAssetProvider,
    count: usize,
) -> Result<BTreeMap<usize, VisualAsset>> {
    let mut visuals = BTreeMap::new();
    let mut missing = Vec::new();
    for index in 0..count {
        match provider.asset_for(index) {
            Some(asset) => {
                visuals.insert(index, asset);
            }
            None => missing.push(index.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(ShowrunnerError::assembly(format!(
            "no visual asset for segment(s) {}",
            missing.join(", ")
        )));
    }
    Ok(visuals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use showrunner_shared::VisualKind;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("showrunner-visuals-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn prefers_segment_files_then_background() {
        let dir = temp_dir();
        std::fs::write(dir.join("segment_0.jpg"), b"img").unwrap();
        std::fs::write(dir.join("segment_1.mp4"), b"vid").unwrap();
        let bg = dir.join("background.png");
        std::fs::write(&bg, b"bg").unwrap();

        let provider = DirectoryAssetProvider::new(&dir, Some(bg.clone()));
        assert_eq!(provider.asset_for(0).unwrap().kind, VisualKind::Image);
        assert_eq!(provider.asset_for(1).unwrap().kind, VisualKind::Video);
        assert_eq!(provider.asset_for(2).unwrap().path, bg);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_visual_names_the_segment() {
        let dir = temp_dir();
        std::fs::write(dir.join("segment_0.png"), b"img").unwrap();
        std::fs::write(dir.join("segment_1.png"), b"img").unwrap();

        let provider = DirectoryAssetProvider::new(&dir, None);
        let err = resolve_visuals(&provider, 3).unwrap_err();
        assert!(matches!(err, ShowrunnerError::Assembly { .. }));
        assert!(err.to_string().contains("segment(s) 2"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
