//! Cache command - inspect and maintain the archive cache

use anyhow::{bail, Context, Result};
use initramfs_builder::artifact_store::{short, CacheEntry, CacheStore};
use initramfs_builder::BuildSettings;
use time::OffsetDateTime;

use crate::{CacheAction, CacheArgs};

/// Execute the cache command
pub(crate) fn execute(args: CacheArgs, settings: &BuildSettings) -> Result<()> {
    if let CacheAction::Path = args.action {
        println!("{}", settings.cache_dir.display());
        return Ok(());
    }

    let store = CacheStore::open(&settings.cache_dir)?.with_lock_timeout(settings.lock_timeout);
    match args.action {
        CacheAction::Path => Ok(()),
        CacheAction::List { json } => list(&store, json),
        CacheAction::Status => status(&store),
        CacheAction::Show { fingerprint } => show(&store, &fingerprint),
        CacheAction::Prune { keep_last } => {
            let removed = store.prune_keep_last(keep_last)?;
            println!("removed {removed} entr{}", if removed == 1 { "y" } else { "ies" });
            Ok(())
        }
        CacheAction::Gc => {
            let report = store.gc()?;
            println!(
                "removed {} orphaned archive(s), {} stale temp file(s)",
                report.orphan_archives, report.stale_tmp_files
            );
            Ok(())
        }
    }
}

fn list(store: &CacheStore, json: bool) -> Result<()> {
    let entries = store.list()?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&entries).context("serializing cache entries")?
        );
        return Ok(());
    }
    if entries.is_empty() {
        println!("No cached archives.");
        return Ok(());
    }

    println!(
        "{:<14} {:>10} {:<6} {:>7}  {:<20}",
        "FINGERPRINT", "SIZE", "COMP", "MODULES", "STORED"
    );
    for entry in &entries {
        println!(
            "{:<14} {:>10} {:<6} {:>7}  {:<20}",
            short(&entry.fingerprint),
            format_size(entry.size_bytes),
            entry.compression,
            module_count(entry),
            format_timestamp(entry.stored_at_unix)
        );
    }
    Ok(())
}

fn status(store: &CacheStore) -> Result<()> {
    let status = store.status()?;
    println!("root:      {}", status.root.display());
    println!("entries:   {}", status.entries);
    println!("archives:  {}", status.archives);
    println!("size:      {}", format_size(status.archive_bytes));
    if status.archives > status.entries {
        println!(
            "{} archive(s) have no entry; `initramfs-builder cache gc` removes them",
            status.archives - status.entries
        );
    }
    Ok(())
}

fn show(store: &CacheStore, fingerprint: &str) -> Result<()> {
    let Some(entry) = store.find(fingerprint)? else {
        bail!("no cache entry matches '{fingerprint}'");
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&entry)
            .with_context(|| format!("serializing entry {}", short(&entry.fingerprint)))?
    );
    Ok(())
}

fn module_count(entry: &CacheEntry) -> usize {
    entry.manifest["modules"]
        .as_array()
        .map(Vec::len)
        .unwrap_or(0)
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_timestamp(unix: u64) -> String {
    match OffsetDateTime::from_unix_timestamp(unix as i64) {
        Ok(t) => format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            t.year(),
            t.month() as u8,
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        ),
        Err(_) => unix.to_string(),
    }
}
