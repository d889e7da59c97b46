//! Resolution of opaque command arguments.
//!
//! An argument is taken verbatim unless it starts with a sigil:
//! - `@path` reads the file at `path`
//! - a lone `-` reads standard input to the end
//!
//! `-` followed by more characters is a literal, so values such as
//! `-----BEGIN` pass through untouched.
//!
//! File and stdin contents are read as raw bytes; invalid UTF-8 sequences
//! become U+FFFD instead of failing the read.

use std::fs;
use std::io::{self, Read};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("Failed to read file: {0}")]
    ReadFile(io::Error),

    #[error("Failed to read stdin: {0}")]
    ReadStdin(io::Error),

    #[error("Missing LICENSE argument")]
    MissingArgument,

    #[error("Too many arguments, expected 1, got {0}")]
    TooManyArguments(usize),
}

/// Resolve one argument, reading `stdin` only for a lone `-`.
pub fn load_data_source<R: Read>(data: &str, stdin: R) -> Result<String, DataSourceError> {
    // Empty quoted shell parameters
    if data.is_empty() {
        return Ok(String::new());
    }
    if let Some(path) = data.strip_prefix('@') {
        let bytes = fs::read(path).map_err(DataSourceError::ReadFile)?;
        return Ok(String::from_utf8_lossy(&bytes).into_owned());
    }
    if data == "-" {
        return read_all(stdin);
    }
    Ok(data.to_string())
}

/// Resolve the single positional argument of a command.
pub fn data_from_args<R: Read>(args: &[String], stdin: R) -> Result<String, DataSourceError> {
    match args {
        [] => Err(DataSourceError::MissingArgument),
        [data] => load_data_source(data, stdin),
        _ => Err(DataSourceError::TooManyArguments(args.len())),
    }
}

fn read_all<R: Read>(mut stdin: R) -> Result<String, DataSourceError> {
    let mut buf = Vec::new();
    stdin
        .read_to_end(&mut buf)
        .map_err(DataSourceError::ReadStdin)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use super::*;

    const BLOB: &str = "02MV4UU43BK5HGYYTOJZWFQMTMNNEWU33JJVVGC2KUGJ5G4VSJNBGVMMTDJ5GWU";

    fn no_stdin() -> Cursor<Vec<u8>> {
        Cursor::new(Vec::new())
    }

    #[test]
    fn reads_file_after_at_sign() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{BLOB}").unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(load_data_source(&arg, no_stdin()).unwrap(), BLOB);
    }

    #[test]
    fn non_utf8_file_is_decoded_lossily() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[b'a', 0xff, b'b']).unwrap();
        let arg = format!("@{}", file.path().display());
        assert_eq!(load_data_source(&arg, no_stdin()).unwrap(), "a\u{fffd}b");
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_data_source("@/nonexistent/rk8s.license", no_stdin()).unwrap_err();
        assert!(matches!(err, DataSourceError::ReadFile(_)));
        assert!(err.to_string().starts_with("Failed to read file: "));
    }

    #[test]
    fn lone_dash_reads_stdin() {
        let stdin = Cursor::new(format!("{BLOB}\n").into_bytes());
        assert_eq!(load_data_source("-", stdin).unwrap(), format!("{BLOB}\n"));
    }

    struct ClosedStdin;

    impl Read for ClosedStdin {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("stdin closed"))
        }
    }

    #[test]
    fn stdin_failure_is_reported() {
        let err = load_data_source("-", ClosedStdin).unwrap_err();
        assert_eq!(err.to_string(), "Failed to read stdin: stdin closed");

        let stdin = Cursor::new(vec![0xff, b'x']);
        assert_eq!(load_data_source("-", stdin).unwrap(), "\u{fffd}x");
    }

    #[test]
    fn other_values_are_literal() {
        let stdin = Cursor::new(b"unused".to_vec());
        assert_eq!(load_data_source("-x", stdin.clone()).unwrap(), "-x");
        assert_eq!(load_data_source("", stdin.clone()).unwrap(), "");
        assert_eq!(load_data_source(BLOB, stdin).unwrap(), BLOB);
    }

    #[test]
    fn argument_count() {
        let err = data_from_args(&[], no_stdin()).unwrap_err();
        assert_eq!(err.to_string(), "Missing LICENSE argument");

        let args = vec!["a".to_string(), "b".to_string()];
        let err = data_from_args(&args, no_stdin()).unwrap_err();
        assert_eq!(err.to_string(), "Too many arguments, expected 1, got 2");

        let args = vec![BLOB.to_string()];
        assert_eq!(data_from_args(&args, no_stdin()).unwrap(), BLOB);
    }
}
