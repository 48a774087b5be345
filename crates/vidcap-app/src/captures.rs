//! Capture notifications for the command-line front end.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use vidcap_core::{CaptureRegistry, CapturedAsset};

/// Streams every asset that appears in `registry` from now on.
///
/// The registry reports whole snapshots; this turns them into one message per
/// newly seen record. An asset that is removed and later captured again is
/// reported again.
pub fn watch_new_assets(registry: &CaptureRegistry) -> mpsc::UnboundedReceiver<CapturedAsset> {
    let (tx, rx) = mpsc::unbounded_channel();
    let known: Arc<Mutex<HashSet<String>>> = Arc::default();

    // Held until seeded so an early callback waits for the starting list.
    let seen = known.clone();
    let mut seeded = known.lock();
    let existing = registry.subscribe(move |assets| {
        let mut known = seen.lock();
        let current: HashSet<String> = assets.iter().map(|a| a.id.clone()).collect();

        // Snapshots arrive newest first.
        for asset in assets.iter().rev() {
            if !known.contains(&asset.id) {
                let _ = tx.send(asset.clone());
            }
        }
        *known = current;
    });
    *seeded = existing.into_iter().map(|a| a.id).collect();
    drop(seeded);

    rx
}

/// Picks a path in `dir` for `asset` that does not overwrite another file.
pub fn destination_for(dir: &Path, asset: &CapturedAsset) -> PathBuf {
    let candidate = dir.join(asset.file_name());
    if !candidate.exists() {
        return candidate;
    }

    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match candidate.extension() {
        Some(ext) => format!("{}-{}.{}", stem, asset.id, ext.to_string_lossy()),
        None => format!("{}-{}", stem, asset.id),
    };
    dir.join(name)
}
