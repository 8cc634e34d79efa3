//! Size-capped log file
//!
//! When the active file would exceed its cap it is renamed with a timestamp
//! suffix and a fresh file is opened in its place.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open(path: impl AsRef<Path>, max_bytes: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            file,
            written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotated_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", stamp));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let mut target = self.rotated_path();
        let mut n = 1;
        while target.exists() {
            let mut name = self.rotated_path().into_os_string();
            name.push(format!(".{}", n));
            target = PathBuf::from(name);
            n += 1;
        }
        std::fs::rename(&self.path, &target)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0
            && self.written > 0
            && self.written + buf.len() as u64 > self.max_bytes
        {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotates_when_cap_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trader.log");
        let mut log = RotatingFile::open(&path, 32).unwrap();

        log.write_all(b"first line of twenty chars\n").unwrap();
        log.write_all(b"second line spills over\n").unwrap();
        log.flush().unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second line spills over\n");
    }

    #[test]
    fn test_reopen_counts_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trader.log");
        std::fs::write(&path, vec![b'x'; 30]).unwrap();

        let mut log = RotatingFile::open(&path, 32).unwrap();
        log.write_all(b"0123456789").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0123456789");
    }
}
