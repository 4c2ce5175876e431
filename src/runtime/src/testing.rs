//! In-process fakes for the external-tool seams.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::write::GzEncoder;

use firebox_core::error::{BoxError, Result};

use crate::oci::{ImageConfig, ImageSource, LayerDescriptor, LayerStream};
use crate::launch::HostCommand;
use crate::tools::{Ext4Tools, FsckReport, LayerExtractor, ResizeTarget};

/// Image whose layers are gzip tarballs held in memory.
pub struct MemoryImage {
    pub config: ImageConfig,
    pub blobs: Vec<Vec<u8>>,
    layers: Vec<LayerDescriptor>,
    pub fail_at: Option<usize>,
    /// Opening this layer never completes
    pub stall_at: Option<usize>,
}

impl MemoryImage {
    pub fn new(blobs: Vec<Vec<u8>>) -> Self {
        let layers = (0..blobs.len())
            .map(|i| LayerDescriptor {
                id: format!("mem-layer-{}", i),
                digest: None,
                size: Some(blobs[i].len() as u64),
            })
            .collect();
        Self {
            config: ImageConfig::default(),
            blobs,
            layers,
            fail_at: None,
            stall_at: None,
        }
    }

    /// Gzip tarball with regular files.
    pub fn layer(files: &[(&str, &[u8])]) -> Vec<u8> {
        let entries: Vec<(&str, Option<&[u8]>, u32)> =
            files.iter().map(|(p, d)| (*p, Some(*d), 0o644)).collect();
        Self::layer_with_modes(&entries)
    }

    /// Gzip tarball; `None` content means a directory.
    pub fn layer_with_modes(entries: &[(&str, Option<&[u8]>, u32)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), flate2::Compression::fast()));
        for (path, data, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(*mode);
            match data {
                Some(data) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    header.set_cksum();
                    builder.append_data(&mut header, path, *data).unwrap();
                }
                None => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    header.set_cksum();
                    builder.append_data(&mut header, path, std::io::empty()).unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap()
    }
}

#[async_trait]
impl ImageSource for MemoryImage {
    fn reference(&self) -> String {
        "memory/test:latest".to_string()
    }

    fn artifact_name(&self) -> String {
        "memory_test_latest".to_string()
    }

    fn config(&self) -> &ImageConfig {
        &self.config
    }

    fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    async fn open_layer(&mut self, index: usize) -> Result<LayerStream> {
        if self.stall_at == Some(index) {
            std::future::pending::<()>().await;
        }
        if self.fail_at == Some(index) {
            return Err(BoxError::FetchError {
                url: format!("memory://layer/{}", index),
                message: "HTTP 500 Internal Server Error".to_string(),
            });
        }
        Ok(LayerStream::from_reader(
            self.layers[index].id.clone(),
            Cursor::new(self.blobs[index].clone()),
            None,
        ))
    }
}

/// Unpacks layers with the `tar` crate instead of the host binary.
pub struct TarballExtractor;

#[async_trait]
impl LayerExtractor for TarballExtractor {
    async fn extract(&self, stream: &mut LayerStream, dest: &Path) -> Result<()> {
        let mut data = Vec::new();
        while let Some(chunk) = stream.next_chunk().await? {
            data.extend_from_slice(&chunk);
        }
        let reader: Box<dyn Read> = if data.starts_with(&[0x1f, 0x8b]) {
            Box::new(flate2::read::GzDecoder::new(Cursor::new(data)))
        } else {
            Box::new(Cursor::new(data))
        };
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);
        archive
            .unpack(dest)
            .map_err(|e| BoxError::ExtractionError(e.to_string()))
    }
}

/// Recorded call on [`FakeExt4Tools`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ext4Call {
    Mkfs { image: PathBuf, size: u64 },
    Check,
    Resize(ResizeTarget),
    BlockSize,
    Exists(String),
    Write { guest_path: String, contents: String },
}

/// Scriptable ext4 tooling.
pub struct FakeExt4Tools {
    pub block_size: u64,
    pub used_blocks: u64,
    pub total_blocks: Mutex<u64>,
    pub fail_resize_to_blocks: bool,
    pub fail_check: bool,
    pub existing: Mutex<HashSet<String>>,
    pub written: Mutex<HashMap<String, String>>,
    pub calls: Mutex<Vec<Ext4Call>>,
}

impl FakeExt4Tools {
    pub fn new(used_blocks: u64) -> Self {
        Self {
            block_size: 4096,
            used_blocks,
            total_blocks: Mutex::new(0),
            fail_resize_to_blocks: false,
            fail_check: false,
            existing: Mutex::new(HashSet::new()),
            written: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_existing(self, paths: &[&str]) -> Self {
        self.existing
            .lock()
            .unwrap()
            .extend(paths.iter().map(|p| p.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<Ext4Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Ext4Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Ext4Tools for FakeExt4Tools {
    fn mkfs(&self, image: &Path, _source: &Path) -> Result<()> {
        let size = std::fs::metadata(image)?.len();
        *self.total_blocks.lock().unwrap() = size / self.block_size;
        self.record(Ext4Call::Mkfs {
            image: image.to_path_buf(),
            size,
        });
        Ok(())
    }

    fn check(&self, _image: &Path) -> Result<FsckReport> {
        self.record(Ext4Call::Check);
        if self.fail_check {
            return Err(BoxError::PackagingError("e2fsck exited with 8".to_string()));
        }
        Ok(FsckReport {
            used_blocks: self.used_blocks,
            total_blocks: *self.total_blocks.lock().unwrap(),
        })
    }

    fn resize(&self, image: &Path, target: ResizeTarget) -> Result<()> {
        self.record(Ext4Call::Resize(target));
        let blocks = match target {
            ResizeTarget::Blocks(_) if self.fail_resize_to_blocks => {
                return Err(BoxError::PackagingError(
                    "resize2fs: New size smaller than minimum".to_string(),
                ));
            }
            ResizeTarget::Blocks(n) => n,
            ResizeTarget::Bytes(n) => n / self.block_size,
            ResizeTarget::Minimum => self.used_blocks + 16,
        };
        let file = std::fs::OpenOptions::new().write(true).open(image)?;
        if file.metadata()?.len() < blocks * self.block_size {
            file.set_len(blocks * self.block_size)?;
        }
        *self.total_blocks.lock().unwrap() = blocks;
        Ok(())
    }

    fn block_size(&self, _image: &Path) -> Result<u64> {
        self.record(Ext4Call::BlockSize);
        Ok(self.block_size)
    }

    fn exists_in_image(&self, _image: &Path, guest_path: &str) -> Result<bool> {
        self.record(Ext4Call::Exists(guest_path.to_string()));
        Ok(self.existing.lock().unwrap().contains(guest_path))
    }

    fn write_into_image(&self, _image: &Path, host_file: &Path, guest_path: &str) -> Result<()> {
        let contents = std::fs::read_to_string(host_file)?;
        self.record(Ext4Call::Write {
            guest_path: guest_path.to_string(),
            contents: contents.clone(),
        });
        self.written
            .lock()
            .unwrap()
            .insert(guest_path.to_string(), contents);
        self.existing.lock().unwrap().insert(guest_path.to_string());
        Ok(())
    }
}

/// Write an executable stub at `root/<guest_path>`.
pub fn write_executable(root: &Path, guest_path: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = root.join(guest_path.trim_start_matches('/'));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"#!/bin/sh\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Records host tool invocations; fails any call whose command line
/// contains `fail_on`.
#[derive(Default)]
pub struct RecordingHost {
    pub calls: Mutex<Vec<String>>,
    pub fail_on: Option<String>,
    /// Stdout returned by every successful call
    pub route: String,
}

impl RecordingHost {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl HostCommand for RecordingHost {
    fn run(&self, program: &str, args: &[String]) -> std::result::Result<String, String> {
        let line = format!("{} {}", program, args.join(" "));
        self.calls.lock().unwrap().push(line.clone());
        if let Some(needle) = &self.fail_on {
            if line.contains(needle.as_str()) {
                return Err("Operation not permitted".to_string());
            }
        }
        Ok(self.route.clone())
    }
}
