//! Output file management.
//!
//! Every output-producing stage writes to files named
//! `<prefix>-<start time>-<index><postfix>` beneath a common output
//! directory. The manager owns the shared rolling index; stages reopen
//! their files through it whenever the engine rolls over (size target hit
//! or periodic tick). Before a rollover the remaining disk space is
//! checked: running out of space stops the engine instead of corrupting
//! output.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use nix::sys::statvfs::statvfs;

/// Default minimum free space required to open new files (1 MiB).
pub const DEFAULT_MIN_FREE_SPACE: u64 = 1 << 20;

pub struct FileManager {
    output_directory: PathBuf,
    split_files: bool,
    min_free_space: u64,
    start_stamp: String,
    file_index: u32,
}

impl FileManager {
    pub fn new(output_directory: &str, split_files: bool, min_free_space: u64) -> Self {
        FileManager {
            output_directory: PathBuf::from(output_directory),
            split_files,
            min_free_space,
            start_stamp: Local::now().format("%Y%m%d%H%M%S").to_string(),
            file_index: 0,
        }
    }

    /// The path a stage's next file will use.
    pub fn file_path(&self, prefix: &str, postfix: &str) -> PathBuf {
        let name = if self.split_files {
            format!(
                "{}-{}-{:06}{}",
                prefix, self.start_stamp, self.file_index, postfix
            )
        } else {
            format!("{}{}", prefix, postfix)
        };
        self.output_directory.join(name)
    }

    /// Opens the current file for a prefix/postfix pair, creating the output
    /// directory if needed.
    pub fn open(&self, prefix: &str, postfix: &str) -> Result<BufWriter<File>> {
        if !self.output_directory.as_os_str().is_empty() {
            fs::create_dir_all(&self.output_directory).with_context(|| {
                format!("creating output directory {:?}", self.output_directory)
            })?;
        }
        let path = self.file_path(prefix, postfix);
        let file =
            File::create(&path).with_context(|| format!("opening output file {:?}", path))?;
        Ok(BufWriter::new(file))
    }

    /// Advances the rolling index. No-op when file splitting is disabled.
    pub fn advance(&mut self) {
        if self.split_files {
            self.file_index += 1;
        }
    }

    /// True while the output volume has at least the configured headroom.
    pub fn has_free_space(&self) -> bool {
        let dir: &Path = if self.output_directory.as_os_str().is_empty() {
            Path::new(".")
        } else {
            &self.output_directory
        };
        match statvfs(dir) {
            Ok(stats) => {
                let free = stats.blocks_available() as u64 * stats.fragment_size() as u64;
                free >= self.min_free_space
            }
            // A directory that cannot be inspected will also fail to open
            // files; report it through the open path instead.
            Err(_) => true,
        }
    }

    pub fn split_files(&self) -> bool {
        self.split_files
    }

    /// Runtime reconfiguration: output directory and split toggle.
    pub fn configure(&mut self, settings: &toml::value::Table) {
        if let Some(dir) = settings.get("outputDirectory").and_then(|v| v.as_str()) {
            match fs::create_dir_all(dir) {
                Ok(()) => {
                    self.output_directory = PathBuf::from(dir);
                    log::info!("file manager: using output path \"{}\"", dir);
                }
                Err(e) => {
                    log::error!(
                        "file manager: output directory \"{}\" is unusable ({}); not changed",
                        dir,
                        e
                    );
                }
            }
        }
        if let Some(split) = settings.get("splitFiles").and_then(|v| v.as_bool()) {
            self.split_files = split;
            log::info!(
                "file manager: {}splitting output files",
                if split { "" } else { "not " }
            );
        }
    }
}
