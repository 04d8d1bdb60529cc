//! Fichiers d'entrée / sortie

pub mod cityjson;

pub use cityjson::{CityJsonSeqReader, CityJsonSeqWriter, Transform};

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

fn is_sequence_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "jsonl")
}

/// Collecte les fichiers à importer
///
/// `input` peut être un fichier, un répertoire (parcouru récursivement,
/// fichiers `*.jsonl`) ou un motif glob. Le résultat est trié.
pub fn collect_inputs(input: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(input);
    let mut files = Vec::new();

    if path.is_file() {
        files.push(path.to_path_buf());
    } else if path.is_dir() {
        collect_directory(path, &mut files)?;
    } else {
        for entry in glob::glob(input).with_context(|| format!("Invalid input pattern: {}", input))? {
            let entry = entry.context("Failed to read glob entry")?;
            if entry.is_file() {
                files.push(entry);
            }
        }
    }

    files.sort();
    Ok(files)
}

fn collect_directory(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("Cannot read {}", dir.display()))? {
        let entry_path = entry?.path();
        if entry_path.is_dir() {
            collect_directory(&entry_path, files)?;
        } else if is_sequence_file(&entry_path) {
            files.push(entry_path);
        }
    }
    Ok(())
}

/// Racine d'une entrée de [`collect_inputs`]
///
/// Répertoire parent pour un fichier, le répertoire lui-même, ou la partie
/// fixe d'un motif glob (composants avant le premier joker).
pub fn input_root(input: &str) -> PathBuf {
    let path = Path::new(input);
    if path.is_file() {
        return path.parent().map(Path::to_path_buf).unwrap_or_default();
    }
    if path.is_dir() {
        return path.to_path_buf();
    }
    path.components()
        .take_while(|c| !c.as_os_str().to_string_lossy().contains(['*', '?', '[']))
        .collect()
}

/// Clé de suivi d'un fichier: chemin relatif à la racine d'entrée
///
/// Deux fichiers de même nom dans des sous-répertoires différents ont des
/// clés distinctes. Séparateur `/` quel que soit le système.
pub fn file_key(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if key.is_empty() {
        file_label(path)
    } else {
        key
    }
}

/// Nom court d'un fichier
pub fn file_label(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Calcule le checksum blake3 d'un fichier
pub fn compute_file_checksum(path: &Path) -> Result<String> {
    use std::fs::File;
    use std::io::Read;

    let mut file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 65536]; // 64KB buffer

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize().as_bytes()))
}
