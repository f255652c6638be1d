use std::{
    ffi::OsString,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{FieldMatcher, GenesisError, NormalizationEvent, Normalized, Normalizer};

/// Genesis files a node directory usually carries, in the order they get fixed.
pub const KNOWN_GENESIS_FILES: [&str; 7] = [
    "genesis_mainnet.json",
    "genesis_testnet.json",
    "genesis_local.json",
    "genesis_test.json",
    "genesis_96369_migrated.json",
    "cchain_genesis_mainnet.json",
    "cchain_genesis_final.json",
];

pub fn known_genesis_files(dir: &Path) -> Vec<PathBuf> {
    KNOWN_GENESIS_FILES
        .iter()
        .map(|file_name| dir.join(file_name))
        .collect()
}

#[derive(Debug)]
pub struct GenesisFixOutcome {
    pub path: PathBuf,
    pub backup_path: PathBuf,
    /// False when a backup from an earlier run was already in place.
    pub backup_created: bool,
    /// False when the document was already normalized and the file was not rewritten.
    pub changed: bool,
    pub events: Vec<NormalizationEvent>,
}

impl GenesisFixOutcome {
    pub fn correction_count(&self) -> usize {
        self.events.iter().filter(|event| event.is_correction()).count()
    }

    pub fn warning_count(&self) -> usize {
        self.events.iter().filter(|event| event.is_warning()).count()
    }
}

pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut backup: OsString = path.as_os_str().to_owned();
    backup.push(".backup");
    PathBuf::from(backup)
}

/// Copies the original bytes next to the file, but only if no backup exists yet so reruns never
/// overwrite the first pristine copy.
fn write_backup_once(backup_path: &Path, original: &[u8]) -> io::Result<bool> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(backup_path)
    {
        Ok(mut file) => {
            file.write_all(original)?;
            file.sync_all()?;
            Ok(true)
        }
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(error) => Err(error),
    }
}

/// Writes to a temporary file in the same directory and renames it over the target, readers see
/// either the old or the new document.
fn write_json_atomically(path: &Path, value: &Value) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.as_file().sync_all()?;

    let permissions = fs::metadata(path)?.permissions();
    fs::set_permissions(file.path(), permissions)?;

    file.persist(path).map_err(|error| error.error)?;
    Ok(())
}

fn log_event(event: &NormalizationEvent) {
    if event.is_correction() {
        info!(%event, "genesis fix");
    } else {
        warn!(%event, "genesis fix needs attention");
    }
}

#[instrument(skip(normalizer), fields(path = %path.display()))]
pub fn fix_genesis_file<M: FieldMatcher>(
    path: &Path,
    normalizer: &Normalizer<M>,
) -> Result<GenesisFixOutcome, GenesisError> {
    let original = fs::read(path).map_err(|source| GenesisError::io(path, source))?;
    let document =
        serde_json::from_slice::<Value>(&original).map_err(|source| GenesisError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    let backup_path = backup_path_for(path);
    let backup_created = write_backup_once(&backup_path, &original)
        .map_err(|source| GenesisError::io(&backup_path, source))?;
    if backup_created {
        info!(backup = %backup_path.display(), "created backup");
    } else {
        debug!(backup = %backup_path.display(), "backup already present");
    }

    let Normalized { value, events } = normalizer.normalize(&document);
    events.iter().for_each(log_event);

    let changed = value != document;
    if changed {
        write_json_atomically(path, &value).map_err(|source| GenesisError::io(path, source))?;
        info!("saved fixed genesis");
    } else {
        debug!("genesis already normalized, leaving file untouched");
    }

    Ok(GenesisFixOutcome {
        path: path.to_path_buf(),
        backup_path,
        backup_created,
        changed,
        events,
    })
}

/// Fixes every file in turn, a failure on one file is reported and the rest still get fixed.
pub fn fix_genesis_files<M: FieldMatcher>(
    paths: &[PathBuf],
    normalizer: &Normalizer<M>,
) -> Vec<(PathBuf, Result<GenesisFixOutcome, GenesisError>)> {
    paths
        .iter()
        .map(|path| {
            let outcome = fix_genesis_file(path, normalizer);
            if let Err(error) = &outcome {
                warn!(%error, "failed to fix genesis file");
            }
            (path.clone(), outcome)
        })
        .collect()
}
