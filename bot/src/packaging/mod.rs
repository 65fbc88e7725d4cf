/// Post-processing of fetched content into an uploadable artifact.
///
/// Everything here is blocking file I/O; callers run it on the blocking pool.
pub mod archive;
pub mod document;

use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

/// File extensions treated as fetched images (compared lowercase).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "gif", "bmp", "tiff", "tif", "heic", "heif",
];

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// All image files under `dir`, recursively, in lexicographic path order.
pub fn find_images(dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry under {:?}: {}", dir, e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    images.sort();
    images
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_images_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("b")).unwrap();
        std::fs::create_dir_all(root.join("a/nested")).unwrap();
        std::fs::write(root.join("b/00002.webp"), b"x").unwrap();
        std::fs::write(root.join("a/nested/00001.JPG"), b"x").unwrap();
        std::fs::write(root.join("a/00003.png"), b"x").unwrap();
        std::fs::write(root.join("a/info.txt"), b"x").unwrap();

        let found: Vec<String> = find_images(root)
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(found, vec!["a/00003.png", "a/nested/00001.JPG", "b/00002.webp"]);
    }

    #[test]
    fn test_find_images_empty_or_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_images(dir.path()).is_empty());
        assert!(find_images(&dir.path().join("missing")).is_empty());
    }
}
