use super::CacheError;
use crate::utils::{collect_files, relative_display};

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Computes cache keys of the form `<discriminator>-<sha256 hex>`.
///
/// The digest covers every input file's path (relative to the workspace,
/// `/`-separated, sorted) and content digest, so the key depends only on file
/// contents and the discriminator. Inputs that match nothing contribute nothing.
pub struct CacheKeyResolver;

impl CacheKeyResolver {
    /// Resolve a key for `inputs` (paths or glob patterns relative to `workspace`)
    pub fn resolve(
        discriminator: &str,
        inputs: &[String],
        workspace: &Path,
    ) -> Result<String, CacheError> {
        let mut hashes = BTreeMap::new();

        for file in Self::input_files(inputs, workspace)? {
            let digest = hash_file(&file)?;
            hashes.insert(relative_display(&file, workspace), digest);
        }

        Ok(Self::key_from_hashes(discriminator, &hashes))
    }

    /// Key from already computed `(relative path, content digest)` pairs
    pub fn key_from_hashes(discriminator: &str, hashes: &BTreeMap<String, String>) -> String {
        let mut hasher = Sha256::new();
        for (path, digest) in hashes {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(digest.as_bytes());
            hasher.update(b"\n");
        }
        format!("{}-{:x}", discriminator, hasher.finalize())
    }

    /// Expand inputs into the sorted set of existing files
    pub fn input_files(inputs: &[String], workspace: &Path) -> Result<Vec<PathBuf>, CacheError> {
        let mut files = Vec::new();

        for input in inputs {
            let pattern = format!(
                "{}/{}",
                glob::Pattern::escape(&workspace.to_string_lossy()),
                input.trim_start_matches("./")
            );

            let entries = glob::glob(&pattern).map_err(|e| CacheError::Pattern {
                pattern: input.clone(),
                message: e.to_string(),
            })?;

            for entry in entries {
                match entry {
                    Ok(path) => files.extend(
                        collect_files(&path).map_err(|e| CacheError::io(&path, e))?,
                    ),
                    Err(e) => {
                        log::debug!("skipping unreadable cache input: {}", e);
                    }
                }
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// Compute SHA256 hash of a file.
fn hash_file(path: &Path) -> Result<String, CacheError> {
    let file = File::open(path).map_err(|e| CacheError::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .map_err(|e| CacheError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
