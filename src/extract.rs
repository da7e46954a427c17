use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::InstallerError;
use crate::progress::{ProgressFn, ProgressRange};
use crate::task_control::{ensure_not_cancelled, TaskControl};

/// Sanitize an archive entry path. Returns `None` for anything that could
/// escape the extraction root (absolute paths, `..` components).
pub fn sanitize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::CurDir => {}
            Component::ParentDir => return None,
            Component::Prefix(_) | Component::RootDir => return None,
        }
    }
    if result.as_os_str().is_empty() {
        None
    } else {
        Some(result)
    }
}

/// Extract a zip archive into `target`, reporting entry-count progress
/// mapped into `range`.
///
/// The blocking zip iteration runs on the blocking pool so progress
/// callbacks never stall a responsive caller. Directory-only entries
/// establish structure without a content write. A zero-entry archive
/// completes the stage immediately at `range.end`.
pub async fn extract_archive(
    archive: &Path,
    target: &Path,
    range: ProgressRange,
    on_progress: ProgressFn,
    control: TaskControl,
) -> Result<(), InstallerError> {
    let archive = archive.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || {
        extract_blocking(&archive, &target, range, on_progress, control)
    })
    .await
    .map_err(|err| InstallerError::Unknown(format!("extraction task failed: {err}")))?
}

fn extract_blocking(
    archive_path: &Path,
    target: &Path,
    range: ProgressRange,
    on_progress: ProgressFn,
    control: TaskControl,
) -> Result<(), InstallerError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let total_entries = archive.len();
    if total_entries == 0 {
        on_progress(range.end, "Extraction finished".to_string());
        return Ok(());
    }

    let mut last_emitted: i32 = -1;
    for index in 0..total_entries {
        ensure_not_cancelled(&control, "extract")?;

        let mut entry = archive.by_index(index)?;
        let Some(raw_path) = entry.enclosed_name() else {
            debug!(entry = entry.name(), "skipping entry with unsafe path");
            continue;
        };
        let Some(relative) = sanitize_entry_path(&raw_path) else {
            debug!(entry = entry.name(), "skipping entry with unsafe path");
            continue;
        };

        let destination = target.join(&relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&destination)?;
            std::io::copy(&mut entry, &mut out)?;
        }

        let processed = index + 1;
        let inner = ((processed * 100) / total_entries) as u8;
        let mapped = range.map(inner);
        if i32::from(mapped) != last_emitted {
            last_emitted = i32::from(mapped);
            on_progress(mapped, format!("Extracting files... {inner}%"));
        }
    }

    Ok(())
}
