//! small filesystem helpers used on startup paths

use std::fs;
use std::io;
use std::io::Read;
use std::path;

use log::debug;

/// Namespace for the file helpers.
pub struct FileHelper {}

impl FileHelper {
    /// Returns true if the file exists
    pub fn file_exists(file_path: &str) -> bool {
        path::Path::new(file_path).exists()
    }

    /// Reads the content of a file and returns a String (using String::from_utf8())
    pub fn read_file_to_string(file_path: &str) -> Result<String, io::Error> {
        debug!("Reading content of {}", file_path);
        let mut content: Vec<u8> = Vec::new();
        let mut file = fs::OpenOptions::new().read(true).open(file_path)?;
        let _ = file.read_to_end(&mut content)?;
        match String::from_utf8(content) {
            Ok(s) => Ok(s),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "UTF 8 conversion failed",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FileHelper;
    use std::env;
    use std::fs;

    #[test]
    /// Written content comes back line by line
    fn read_back() {
        let path = env::temp_dir().join("chain_utils_filehelper_test");
        let path = path.to_str().unwrap().to_string();
        fs::write(&path, "one\ntwo\n").unwrap();
        assert!(FileHelper::file_exists(&path));
        let content = FileHelper::read_file_to_string(&path).unwrap();
        assert_eq!(content.lines().collect::<Vec<_>>(), vec!["one", "two"]);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    /// A missing file is an error, not a panic
    fn missing_file() {
        assert!(FileHelper::read_file_to_string("/definitely/not/there").is_err());
        assert!(!FileHelper::file_exists("/definitely/not/there"));
    }
}
