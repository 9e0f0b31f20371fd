//! Archive codec: gzip-compressed POSIX tar.
//!
//! `create` archives a directory tree with forward-slash relative paths;
//! `extract` unpacks with a strict path-safety contract: every cleaned entry
//! name must stay under the destination, and hardlink/symlink targets are
//! re-resolved against the link's parent directory and checked the same way.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported file type '{kind}' for {path}")]
    UnsupportedFileType { path: PathBuf, kind: String },

    #[error("archive entry '{0}' escapes the extraction root")]
    PathEscape(PathBuf),

    #[error("link '{path}' has invalid target '{target}'")]
    InvalidSymlinkTarget { path: PathBuf, target: PathBuf },
}

/// Archive extensions recognized for import.
pub const RECOGNIZED_EXTENSIONS: [&str; 3] = [".gotya", ".tar.gz", ".tgz"];

/// Whether the file name carries a recognized archive extension.
pub fn is_supported_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    RECOGNIZED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Fail with `UnsupportedFormat` unless the extension is recognized.
pub fn ensure_supported(path: &Path) -> Result<(), ArchiveError> {
    if is_supported_archive(path) {
        Ok(())
    } else {
        Err(ArchiveError::UnsupportedFormat(
            path.to_string_lossy().to_string(),
        ))
    }
}

/// Archive every entry under `source_dir` into a gzip tar at `output_path`.
///
/// Entry names are forward-slash paths relative to `source_dir`; file mode
/// and mtime are preserved, symlinks are stored as-is, and any other entry
/// type fails with `UnsupportedFileType`.
pub fn create(source_dir: &Path, output_path: &Path) -> Result<(), ArchiveError> {
    let file = File::create(output_path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(source_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(io::Error::other)?;
        let name = slash_name(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(&name, entry.path())?;
        } else if file_type.is_file() {
            builder.append_path_with_name(entry.path(), &name)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            let meta = fs::symlink_metadata(entry.path())?;
            let mut header = tar::Header::new_gnu();
            header.set_metadata(&meta);
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder.append_link(&mut header, &name, &target)?;
        } else {
            return Err(ArchiveError::UnsupportedFileType {
                path: rel.to_path_buf(),
                kind: format!("{file_type:?}"),
            });
        }
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(())
}

/// Extract a gzip tar to `dest_dir`, creating missing parents.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive_path)?;
    let decoder = GzDecoder::new(BufReader::new(file));
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);

    fs::create_dir_all(dest_dir)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let rel = clean_entry_name(&raw)?;
        let dest = dest_dir.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&dest)?;
            }
            EntryType::Regular => {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&dest)?;
            }
            EntryType::Symlink => {
                let target = link_target(&entry, &rel)?;
                check_link_target(&rel, &target)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(&dest)?;
            }
            EntryType::Link => {
                let target = link_target(&entry, &rel)?;
                let resolved = check_link_target(&rel, &target)?;
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::hard_link(dest_dir.join(resolved), &dest)?;
            }
            other => {
                return Err(ArchiveError::UnsupportedFileType {
                    path: rel,
                    kind: format!("{other:?}"),
                });
            }
        }
    }

    Ok(())
}

fn link_target<R: io::Read>(
    entry: &tar::Entry<'_, R>,
    rel: &Path,
) -> Result<PathBuf, ArchiveError> {
    entry
        .link_name()?
        .map(|t| t.into_owned())
        .ok_or_else(|| ArchiveError::InvalidSymlinkTarget {
            path: rel.to_path_buf(),
            target: PathBuf::new(),
        })
}

/// Lexically clean an entry name and require it to stay below the root.
///
/// Rejects absolute names, names that clean to nothing, and names whose
/// `..` components would climb above the extraction root.
fn clean_entry_name(name: &Path) -> Result<PathBuf, ArchiveError> {
    let mut stack: Vec<&std::ffi::OsStr> = Vec::new();
    for component in name.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(ArchiveError::PathEscape(name.to_path_buf()));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(ArchiveError::PathEscape(name.to_path_buf()));
                }
            }
            Component::Normal(part) => stack.push(part),
        }
    }
    if stack.is_empty() {
        return Err(ArchiveError::PathEscape(name.to_path_buf()));
    }
    Ok(stack.iter().collect())
}

/// Re-resolve a link target against the link's parent directory and require
/// the result to stay below the extraction root. Absolute targets are
/// rejected outright. Returns the root-relative resolved path.
pub(crate) fn check_link_target(link_rel: &Path, target: &Path) -> Result<PathBuf, ArchiveError> {
    let escape = || ArchiveError::InvalidSymlinkTarget {
        path: link_rel.to_path_buf(),
        target: target.to_path_buf(),
    };

    if target.as_os_str().is_empty() || target.is_absolute() {
        return Err(escape());
    }

    let parent = link_rel.parent().unwrap_or_else(|| Path::new(""));
    let mut stack: Vec<&std::ffi::OsStr> = parent.iter().collect();
    for component in target.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return Err(escape()),
            Component::CurDir => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(escape());
                }
            }
            Component::Normal(part) => stack.push(part),
        }
    }
    Ok(stack.iter().collect())
}

/// Join path components with forward slashes regardless of host separator.
pub(crate) fn slash_name(rel: &Path) -> String {
    rel.iter()
        .map(|c| c.to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Hand-build a gzip tar with one raw header so tests can smuggle in
    /// entry names the `tar` crate's builder refuses to write.
    fn raw_archive(name: &str, typeflag: u8, linkname: &str, data: &[u8]) -> Vec<u8> {
        let mut header = [0u8; 512];
        header[..name.len()].copy_from_slice(name.as_bytes());
        header[100..107].copy_from_slice(b"0000644");
        header[108..115].copy_from_slice(b"0000000");
        header[116..123].copy_from_slice(b"0000000");
        let size = format!("{:011o}", data.len());
        header[124..135].copy_from_slice(size.as_bytes());
        header[136..147].copy_from_slice(b"00000000000");
        header[156] = typeflag;
        header[157..157 + linkname.len()].copy_from_slice(linkname.as_bytes());

        // Checksum is computed with the checksum field set to spaces.
        header[148..156].copy_from_slice(b"        ");
        let sum: u64 = header.iter().map(|b| u64::from(*b)).sum();
        let chksum = format!("{sum:06o}\0 ");
        header[148..156].copy_from_slice(chksum.as_bytes());

        let mut tar = header.to_vec();
        tar.extend_from_slice(data);
        if !data.is_empty() {
            tar.resize(tar.len() + (512 - data.len() % 512) % 512, 0);
        }
        tar.extend_from_slice(&[0u8; 1024]);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("data").join("nested")).unwrap();
        fs::write(src.join("data").join("hello.txt"), "hi\n").unwrap();
        fs::write(src.join("data").join("nested").join("a.bin"), [0u8, 1, 2]).unwrap();

        let archive = dir.path().join("out.gotya");
        create(&src, &archive).unwrap();

        let dest = dir.path().join("dest");
        extract(&archive, &dest).unwrap();

        assert_eq!(fs::read_to_string(dest.join("data/hello.txt")).unwrap(), "hi\n");
        assert_eq!(fs::read(dest.join("data/nested/a.bin")).unwrap(), vec![0u8, 1, 2]);
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_preserved() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let script = src.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let archive = dir.path().join("out.tar.gz");
        create(&src, &archive).unwrap();
        let dest = dir.path().join("dest");
        extract(&archive, &dest).unwrap();

        let mode = fs::metadata(dest.join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_roundtrip() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("real.txt"), "content").unwrap();
        std::os::unix::fs::symlink("real.txt", src.join("link.txt")).unwrap();

        let archive = dir.path().join("out.gotya");
        create(&src, &archive).unwrap();
        let dest = dir.path().join("dest");
        extract(&archive, &dest).unwrap();

        let link = dest.join("link.txt");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(&link).unwrap(), "content");
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.gotya");
        fs::write(&archive, raw_archive("../evil", b'0', "", b"boom")).unwrap();

        let dest = dir.path().join("dest");
        let err = extract(&archive, &dest).unwrap_err();
        assert!(matches!(err, ArchiveError::PathEscape(_)));
        assert!(!dir.path().join("evil").exists());
    }

    #[test]
    fn test_rejects_absolute_entry() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.gotya");
        fs::write(&archive, raw_archive("/abs", b'0', "", b"boom")).unwrap();

        let err = extract(&archive, &dir.path().join("dest")).unwrap_err();
        assert!(matches!(err, ArchiveError::PathEscape(_)));
    }

    #[test]
    fn test_rejects_escaping_symlink() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.gotya");
        fs::write(
            &archive,
            raw_archive("link", b'2', "../../etc/passwd", b""),
        )
        .unwrap();

        let err = extract(&archive, &dir.path().join("dest")).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidSymlinkTarget { .. }));
    }

    #[test]
    fn test_rejects_absolute_symlink() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.gotya");
        fs::write(&archive, raw_archive("link", b'2', "/etc/passwd", b"")).unwrap();

        let err = extract(&archive, &dir.path().join("dest")).unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidSymlinkTarget { .. }));
    }

    #[test]
    fn test_rejects_unsupported_entry_type() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("odd.gotya");
        // typeflag '6' is a FIFO
        fs::write(&archive, raw_archive("fifo", b'6', "", b"")).unwrap();

        let err = extract(&archive, &dir.path().join("dest")).unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedFileType { .. }));
    }

    #[test]
    fn test_internal_dotdot_stays_inside() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("ok.gotya");
        fs::write(&archive, raw_archive("a/../b.txt", b'0', "", b"fine")).unwrap();

        let dest = dir.path().join("dest");
        extract(&archive, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("b.txt")).unwrap(), "fine");
    }

    #[test]
    fn test_extension_recognition() {
        assert!(is_supported_archive(Path::new("x_1.0.0_linux_amd64.gotya")));
        assert!(is_supported_archive(Path::new("x.tar.gz")));
        assert!(is_supported_archive(Path::new("x.TGZ")));
        assert!(!is_supported_archive(Path::new("x.zip")));
        assert!(matches!(
            ensure_supported(Path::new("x.zip")),
            Err(ArchiveError::UnsupportedFormat(_))
        ));
    }
}
