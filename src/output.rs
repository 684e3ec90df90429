//! Writing the final files of a run to the output directory.

use std::fs;
use std::time::Instant;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::File;
use crate::error::OutputError;
use crate::utils::as_overhead;

/// Path of `file` relative to the output directory.
///
/// `.` and `..` are resolved lexically, and the result never escapes the
/// output directory.
pub(crate) fn output_path(file: &File) -> Utf8PathBuf {
    let mut ret = Utf8PathBuf::new();

    for component in file.relative().components() {
        match component {
            Utf8Component::Normal(c) => ret.push(c),
            Utf8Component::ParentDir => {
                ret.pop();
            }
            Utf8Component::Prefix(..) | Utf8Component::RootDir | Utf8Component::CurDir => {}
        }
    }

    ret
}

/// Copies the contents of every file to `<dir>/<dirname>/<basename>`.
pub fn save_to_dist(files: &[File], dir: &Utf8Path) -> Result<(), OutputError> {
    let s = Instant::now();

    fs::create_dir_all(dir).map_err(|source| OutputError::Write {
        path: dir.to_path_buf(),
        source,
    })?;

    files.par_iter().try_for_each(|file| {
        let path = dir.join(output_path(file));

        let result = match path.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        };

        result
            .and_then(|_| fs::copy(&file.content, &path))
            .map(|_| ())
            .map_err(|source| OutputError::Write { path, source })
    })?;

    tracing::info!("wrote {} files to {dir} {}", files.len(), as_overhead(s));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path() {
        assert_eq!(output_path(&File::new("css", "main.css", "/x")), "css/main.css");
        assert_eq!(output_path(&File::new("", "a.txt", "/x")), "a.txt");
        assert_eq!(output_path(&File::new("/abs/./dir", "a.txt", "/x")), "abs/dir/a.txt");
        assert_eq!(output_path(&File::new("../../up", "a.txt", "/x")), "up/a.txt");
    }

    #[test]
    fn test_save_to_dist() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        std::fs::write(root.join("source.txt"), "hello").unwrap();

        let files = vec![
            File::new("nested/deeper", "copy.txt", root.join("source.txt")),
            File::new("", "top.txt", root.join("source.txt")),
        ];

        save_to_dist(&files, &root.join("dist")).unwrap();

        assert_eq!(std::fs::read_to_string(root.join("dist/nested/deeper/copy.txt")).unwrap(), "hello");
        assert_eq!(std::fs::read_to_string(root.join("dist/top.txt")).unwrap(), "hello");
    }

    #[test]
    fn test_save_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let files = vec![File::new("", "gone.txt", root.join("missing.txt"))];

        match save_to_dist(&files, &root.join("dist")) {
            Err(OutputError::Write { path, .. }) => assert_eq!(path, root.join("dist/gone.txt")),
            other => panic!("expected write error, got {other:?}"),
        }
    }
}
