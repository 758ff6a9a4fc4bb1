//! StudyBox tape utility.
//!
//! Unpacks `.studybox` images into per-page listings, payload blobs, script
//! disassemblies, and a JSON manifest, or repacks a manifest back into a
//! tape image. Exits non-zero if any page fails to decode; pages that do
//! decode are still exported.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use format_studybox::export::Manifest;
use format_studybox::import::import_manifest;
use format_studybox::{StudyBox, export};

struct CliArgs {
    /// Manifest to repack; unpack mode when absent.
    pack: Option<PathBuf>,
    /// Output path for the repacked tape.
    out: Option<PathBuf>,
    files: Vec<PathBuf>,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        pack: None,
        out: None,
        files: Vec::new(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--pack" => {
                i += 1;
                cli.pack = args.get(i).map(PathBuf::from);
            }
            "--out" => {
                i += 1;
                cli.out = args.get(i).map(PathBuf::from);
            }
            "--help" | "-h" => {
                eprintln!("Usage: sbutil [OPTIONS] [FILES...]");
                eprintln!();
                eprintln!("Unpacks each .studybox file into a directory named after it,");
                eprintln!("plus a JSON manifest. With no files, unpacks *.studybox in the");
                eprintln!("current directory.");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --pack <manifest>  Rebuild a .studybox from a JSON manifest");
                eprintln!("  --out <file>       Output path for --pack");
                process::exit(0);
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown argument: {other}");
                process::exit(1);
            }
            file => {
                cli.files.push(PathBuf::from(file));
            }
        }
        i += 1;
    }

    cli
}

fn main() {
    let cli = parse_args();

    if let Some(ref manifest_path) = cli.pack {
        if let Err(e) = pack(manifest_path, cli.out.as_deref()) {
            eprintln!("{e}");
            process::exit(1);
        }
        return;
    }

    let files = if cli.files.is_empty() {
        find_tapes()
    } else {
        cli.files.clone()
    };

    let mut failed = false;
    for file in &files {
        if !unpack(file) {
            failed = true;
        }
    }
    if failed {
        process::exit(1);
    }
}

/// All `.studybox` files in the current directory.
fn find_tapes() -> Vec<PathBuf> {
    let paths = match glob::glob("*.studybox") {
        Ok(paths) => paths.filter_map(Result::ok).collect::<Vec<_>>(),
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };
    if paths.is_empty() {
        eprintln!("No .studybox files found");
        process::exit(1);
    }
    paths
}

/// Unpacks one tape into a directory named after the file. Returns false
/// if anything failed, including a per-page decode error.
fn unpack(file: &Path) -> bool {
    let raw = match fs::read(file) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("{}: {e}", file.display());
            return false;
        }
    };

    let sb = match StudyBox::from_bytes(&raw) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("{}: {e}", file.display());
            return false;
        }
    };

    // Per-page errors were already reported during the read.
    let pages_ok = sb.pages.iter().all(|p| p.decode_error.is_none());

    let out_dir = PathBuf::from(file.file_stem().unwrap_or(file.as_os_str()));
    if let Err(e) = export(&sb, &out_dir) {
        eprintln!("{}: {e}", file.display());
        return false;
    }

    pages_ok
}

fn pack(manifest_path: &Path, out: Option<&Path>) -> Result<(), String> {
    let raw = fs::read(manifest_path)
        .map_err(|e| format!("{}: {e}", manifest_path.display()))?;
    let manifest: Manifest =
        serde_json::from_slice(&raw).map_err(|e| format!("{}: {e}", manifest_path.display()))?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new(""));

    let sb = import_manifest(&manifest, base).map_err(|e| e.to_string())?;

    let out_path = match out {
        Some(path) => path.to_path_buf(),
        None if !manifest.filename.is_empty() => base.join(&manifest.filename),
        None => manifest_path.with_extension("studybox"),
    };

    fs::write(&out_path, sb.to_bytes()).map_err(|e| format!("{}: {e}", out_path.display()))?;
    eprintln!("Wrote {}", out_path.display());
    Ok(())
}
