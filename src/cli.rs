//! CLI subcommand implementations.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::{bail, Context, Result};

use lv_catalog::{clean_path, CatalogStore, Config, Db, Library, MediaType, Outcome};

fn resolve_file(root: &Path, file: &Path) -> PathBuf {
    let joined = if file.is_absolute() {
        file.to_path_buf()
    } else {
        root.join(file)
    };
    joined
        .canonicalize()
        .map(|p| clean_path(&p))
        .unwrap_or(joined)
}

fn print_outcome(outcome: &Outcome) {
    println!("{}", outcome.summary());
    for e in &outcome.errors {
        println!("  failed: {}: {}", e.path.display(), e.error);
    }
    if outcome.skipped > 0 {
        println!("  {} new files not processed (cancelled)", outcome.skipped);
    }
}

fn open_library(config: Config, root: &Path) -> Result<Library> {
    let mut lib = Library::new(config).without_watcher();
    lib.open(root)
        .with_context(|| format!("opening {}", root.display()))?;
    Ok(lib)
}

pub fn scan(config: Config, root: &Path) -> Result<()> {
    println!("Scanning {}...", root.display());
    let mut lib = Library::new(config).without_watcher();
    let outcome = lib
        .open(root)
        .with_context(|| format!("scanning {}", root.display()))?;
    print_outcome(&outcome);
    Ok(())
}

pub fn watch(config: Config, root: &Path) -> Result<()> {
    let mut lib = Library::new(config);
    match lib.open(root) {
        Ok(outcome) => print_outcome(&outcome),
        // Keep going: `r` retries.
        Err(e) if lib.root().is_some() => eprintln!("lv-catalog: {}", e),
        Err(e) => return Err(e).with_context(|| format!("opening {}", root.display())),
    }
    if !lib.is_watching() {
        eprintln!("lv-catalog: live updates unavailable; use `r` to refresh");
    }
    println!("Watching {} (r = refresh, s = status, q = quit)", root.display());

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        match line.trim() {
            "r" => match lib.refresh() {
                Ok(outcome) => print_outcome(&outcome),
                Err(e) => eprintln!("lv-catalog: {}", e),
            },
            "s" => {
                println!("{} [{}]", lib.status_text(), lib.state());
                println!("entries: {}", lib.snapshot().len());
                if let Some(stats) = lib.extraction_stats() {
                    println!(
                        "extracted: {} ok, {} failed, {} active",
                        stats.done.load(Ordering::Relaxed),
                        stats.failed.load(Ordering::Relaxed),
                        stats.active.load(Ordering::Relaxed)
                    );
                    let last = stats.last_error();
                    if !last.is_empty() {
                        println!("last error: {}", last);
                    }
                }
            }
            "q" => break,
            "" => {}
            other => eprintln!("unknown command {:?} (r, s, q)", other),
        }
    }
    lib.close();
    Ok(())
}

/// Open an existing catalog file without running a pass.
fn existing_catalog(config: &Config, root: &Path) -> Result<Db> {
    let root = root
        .canonicalize()
        .with_context(|| format!("resolving {}", root.display()))?;
    let path = config.catalog_path(&clean_path(&root));
    if !path.exists() {
        bail!(
            "no catalog at {}; run `lv-catalog scan {}` first",
            path.display(),
            root.display()
        );
    }
    Ok(Db::open(&path)?)
}

pub fn list(config: &Config, root: &Path) -> Result<()> {
    let db = existing_catalog(config, root)?;
    for entry in db.load_all()? {
        let mut line = format!("{:5}  {}", entry.media_type.name(), entry.path.display());
        if let Some(d) = entry.duration_seconds {
            line.push_str(&format!("  [{:.1}s]", d));
        }
        if !entry.tags.is_empty() {
            let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
            line.push_str(&format!("  #{}", tags.join(" #")));
        }
        if !entry.bookmarks.is_empty() {
            line.push_str(&format!("  ({} bookmarks)", entry.bookmarks.len()));
        }
        println!("{}", line);
    }
    Ok(())
}

pub fn status(config: &Config, root: &Path) -> Result<()> {
    let db = existing_catalog(config, root)?;
    let entries = db.load_all()?;
    let images = entries
        .iter()
        .filter(|e| e.media_type == MediaType::Image)
        .count();
    let videos = entries.len() - images;
    let tagged = entries.iter().filter(|e| !e.tags.is_empty()).count();
    let bookmarked = entries.iter().filter(|e| !e.bookmarks.is_empty()).count();
    let with_thumb = entries.iter().filter(|e| e.thumbnail_ref.is_some()).count();

    println!("lv-catalog status");
    println!("=================");
    println!("root:       {}", root.display());
    println!("entries:    {} ({} images, {} videos)", entries.len(), images, videos);
    println!("thumbnails: {}/{}", with_thumb, entries.len());
    println!("tagged:     {}", tagged);
    println!("bookmarked: {}", bookmarked);
    Ok(())
}

pub fn tag(config: Config, root: &Path, file: &Path, tags: Vec<String>) -> Result<()> {
    let lib = open_library(config, root)?;
    let path = resolve_file(lib.root().unwrap_or(root), file);
    let entry = lib.set_tags(&path, tags)?;
    let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
    println!("{}: [{}]", entry.path.display(), tags.join(", "));
    Ok(())
}

pub fn bookmark(config: Config, root: &Path, file: &Path, at: f64, desc: &str) -> Result<()> {
    let lib = open_library(config, root)?;
    let path = resolve_file(lib.root().unwrap_or(root), file);
    let entry = lib.add_bookmark(&path, desc, at)?;
    println!("{}: {} bookmarks", entry.path.display(), entry.bookmarks.len());
    Ok(())
}

pub fn unbookmark(config: Config, root: &Path, file: &Path, at: f64) -> Result<()> {
    let lib = open_library(config, root)?;
    let path = resolve_file(lib.root().unwrap_or(root), file);
    let entry = lib.remove_bookmark(&path, at)?;
    println!("{}: {} bookmarks", entry.path.display(), entry.bookmarks.len());
    Ok(())
}
