/// Archive mode: inner archive of the fetched tree, wrapped in a
/// single-entry AES-encrypted outer archive and verified by extraction.
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

use jm_shared::errors::JobError;

/// Files produced while packaging one job.
#[derive(Debug, Clone)]
pub struct ArchivePaths {
    pub inner: PathBuf,
    pub outer: PathBuf,
    /// Verification extracts here and removes it afterwards.
    pub scratch: PathBuf,
}

impl ArchivePaths {
    pub fn for_job(archive_dir: &Path, job_id: &str) -> Self {
        Self {
            inner: archive_dir.join(format!("{}-inner.zip", job_id)),
            outer: archive_dir.join(format!("{}.zip", job_id)),
            scratch: archive_dir.join(format!("{}-verify", job_id)),
        }
    }

    /// Every path this job may leave behind.
    pub fn all(&self) -> [&Path; 3] {
        [&self.inner, &self.outer, &self.scratch]
    }
}

fn archive_err(step: &str, e: impl std::fmt::Display) -> JobError {
    JobError::Archive(format!("{}: {}", step, e))
}

fn verify_err(step: &str, e: impl std::fmt::Display) -> JobError {
    JobError::VerificationFailed(format!("{}: {}", step, e))
}

/// Build the encrypted archive for `src_dir` and verify it. The inner archive
/// is removed once wrapped; the returned path is the outer archive.
pub fn package(
    src_dir: &Path,
    paths: &ArchivePaths,
    entry_name: &str,
    password: &str,
) -> Result<PathBuf, JobError> {
    if let Some(parent) = paths.outer.parent() {
        fs::create_dir_all(parent)?;
    }

    let count = build_inner(src_dir, &paths.inner)?;
    info!("Packed {} file(s) from {:?}", count, src_dir);

    let wrapped = encrypt(&paths.inner, &paths.outer, entry_name, password);
    if let Err(e) = fs::remove_file(&paths.inner) {
        warn!("Failed to remove inner archive {:?}: {}", paths.inner, e);
    }
    wrapped?;

    verify(&paths.outer, entry_name, password, &paths.scratch)?;
    Ok(paths.outer.clone())
}

/// Deflated archive of every file under `src_dir`, keyed by relative path.
pub fn build_inner(src_dir: &Path, inner: &Path) -> Result<usize, JobError> {
    let mut files: Vec<PathBuf> = WalkDir::new(src_dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();

    let out = File::create(inner).map_err(|e| archive_err("create inner", e))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in &files {
        let rel = path
            .strip_prefix(src_dir)
            .map_err(|e| archive_err("relative path", e))?;
        let name = rel.to_string_lossy().replace('\\', "/");
        zip.start_file(name, options)
            .map_err(|e| archive_err("start entry", e))?;
        let mut input = File::open(path)?;
        io::copy(&mut input, &mut zip)?;
    }
    zip.finish().map_err(|e| archive_err("finish inner", e))?;
    Ok(files.len())
}

/// Wrap `inner` as the single AES-256 entry `entry_name` of `outer`.
pub fn encrypt(inner: &Path, outer: &Path, entry_name: &str, password: &str) -> Result<(), JobError> {
    let out = File::create(outer).map_err(|e| archive_err("create outer", e))?;
    let mut zip = ZipWriter::new(BufWriter::new(out));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .with_aes_encryption(AesMode::Aes256, password);

    zip.start_file(entry_name, options)
        .map_err(|e| archive_err("start encrypted entry", e))?;
    let mut input = File::open(inner)?;
    io::copy(&mut input, &mut zip).map_err(|e| archive_err("encrypt", e))?;
    zip.finish().map_err(|e| archive_err("finish outer", e))?;
    debug!("Encrypted {:?} into {:?}", inner, outer);
    Ok(())
}

/// Decrypt `outer` with `password`, extract into `scratch` and check the
/// extracted entry is itself a readable archive. `scratch` is removed on
/// every path.
pub fn verify(outer: &Path, entry_name: &str, password: &str, scratch: &Path) -> Result<(), JobError> {
    let result = extract_and_check(outer, entry_name, password, scratch);
    if scratch.exists() {
        if let Err(e) = fs::remove_dir_all(scratch) {
            warn!("Failed to remove verification scratch {:?}: {}", scratch, e);
        }
    }
    match &result {
        Ok(()) => info!("Archive {:?} verified", outer),
        Err(e) => warn!("Archive {:?} failed verification: {}", outer, e),
    }
    result
}

fn extract_and_check(outer: &Path, entry_name: &str, password: &str, scratch: &Path) -> Result<(), JobError> {
    let file = File::open(outer).map_err(|e| verify_err("open", e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| verify_err("read", e))?;
    if archive.len() != 1 {
        return Err(verify_err("entries", format!("expected 1, found {}", archive.len())));
    }

    fs::create_dir_all(scratch).map_err(|e| verify_err("scratch", e))?;
    let extracted = scratch.join(entry_name);
    {
        let mut entry = archive
            .by_index_decrypt(0, password.as_bytes())
            .map_err(|e| match e {
                ZipError::InvalidPassword => verify_err("decrypt", "wrong password"),
                other => verify_err("decrypt", other),
            })?;
        if entry.name() != entry_name {
            return Err(verify_err("entry name", entry.name().to_string()));
        }
        let mut out = File::create(&extracted).map_err(|e| verify_err("extract", e))?;
        io::copy(&mut entry, &mut out).map_err(|e| verify_err("extract", e))?;
    }

    let inner = File::open(&extracted).map_err(|e| verify_err("reopen", e))?;
    let inner = ZipArchive::new(inner).map_err(|e| verify_err("inner archive", e))?;
    debug!("Verified inner archive with {} entries", inner.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sample_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
        let files = vec![
            ("ch1/00001.jpg".to_string(), vec![0xFFu8, 0xD8, 1, 2, 3]),
            ("ch1/00002.jpg".to_string(), vec![9u8; 4096]),
            ("ch2/00001.png".to_string(), b"\x89PNG fake".to_vec()),
        ];
        for (rel, bytes) in &files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, bytes).unwrap();
        }
        files
    }

    fn decrypt_entry(outer: &Path, password: &str) -> Result<Vec<u8>, String> {
        let mut archive = ZipArchive::new(File::open(outer).unwrap()).unwrap();
        let mut entry = archive
            .by_index_decrypt(0, password.as_bytes())
            .map_err(|e| e.to_string())?;
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).map_err(|e| e.to_string())?;
        Ok(buf)
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let expected = sample_tree(&src);
        let paths = ArchivePaths::for_job(&dir.path().join("zips"), "350234-1-abcd1234");

        let outer = package(&src, &paths, "350234.zip", "123456").unwrap();
        assert!(outer.is_file());
        assert!(!paths.inner.exists());
        assert!(!paths.scratch.exists());

        let inner_bytes = decrypt_entry(&outer, "123456").unwrap();
        let mut inner = ZipArchive::new(io::Cursor::new(inner_bytes)).unwrap();
        assert_eq!(inner.len(), expected.len());
        for (rel, bytes) in &expected {
            let mut entry = inner.by_name(rel).unwrap();
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf).unwrap();
            assert_eq!(&buf, bytes, "mismatch in {}", rel);
        }
    }

    #[test]
    fn test_wrong_password_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        sample_tree(&src);
        let paths = ArchivePaths::for_job(dir.path(), "job");
        let outer = package(&src, &paths, "1.zip", "123456").unwrap();

        assert!(decrypt_entry(&outer, "654321").is_err());
        let err = verify(&outer, "1.zip", "654321", &paths.scratch).unwrap_err();
        assert!(matches!(err, JobError::VerificationFailed(_)));
        assert!(!paths.scratch.exists());
    }

    #[test]
    fn test_corrupt_outer_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let outer = dir.path().join("broken.zip");
        fs::write(&outer, b"definitely not a zip").unwrap();
        let err = verify(&outer, "1.zip", "123456", &dir.path().join("scratch")).unwrap_err();
        assert!(matches!(err, JobError::VerificationFailed(_)));
    }

    #[test]
    fn test_paths_are_job_scoped() {
        let a = ArchivePaths::for_job(Path::new("/data/zips"), "1-2-aaaa");
        let b = ArchivePaths::for_job(Path::new("/data/zips"), "1-2-bbbb");
        assert_ne!(a.outer, b.outer);
        assert_eq!(a.outer, PathBuf::from("/data/zips/1-2-aaaa.zip"));
        assert_eq!(a.all().len(), 3);
    }
}
