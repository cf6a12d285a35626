//! MNIST loading: IDX parsing, download cache and batch iterators.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail, ensure};
use cadence_core::BatchSize;
use candle_core::{Device, Tensor};
use flate2::read::GzDecoder;
use tracing::{debug, info};

/// Mirror serving the gzipped IDX files.
pub const MNIST_MIRROR: &str = "https://ossci-datasets.s3.amazonaws.com/mnist";

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

pub const NUM_CLASSES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn file_stems(self) -> (&'static str, &'static str) {
        match self {
            Self::Train => ("train-images-idx3-ubyte", "train-labels-idx1-ubyte"),
            Self::Test => ("t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte"),
        }
    }
}

/// Default location of the downloaded files.
pub fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cadence")
        .join("mnist")
}

/// Fetches any of the four MNIST files missing from `dir`.
pub fn download_mnist<P: AsRef<Path>>(dir: P) -> anyhow::Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    for split in [Split::Train, Split::Test] {
        let (images, labels) = split.file_stems();
        for stem in [images, labels] {
            if find_file(dir, stem).is_some() {
                debug!(file = stem, "already cached");
                continue;
            }
            let url = format!("{MNIST_MIRROR}/{stem}.gz");
            info!(%url, "downloading");
            let bytes = reqwest::blocking::get(&url)
                .and_then(|response| response.error_for_status())
                .and_then(|response| response.bytes())
                .with_context(|| format!("failed to download {url}"))?;
            fs::write(dir.join(format!("{stem}.gz")), &bytes)?;
        }
    }
    Ok(())
}

/// Looks for `stem.gz` first, then the uncompressed `stem`.
fn find_file(dir: &Path, stem: &str) -> Option<PathBuf> {
    [format!("{stem}.gz"), stem.to_string()]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
}

/// Reads a file, gunzipping it when it starts with the gzip magic.
fn read_maybe_gz(path: &Path) -> anyhow::Result<Vec<u8>> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .with_context(|| format!("failed to gunzip {}", path.display()))?;
        Ok(out)
    } else {
        Ok(raw)
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> anyhow::Result<u32> {
    let chunk = bytes
        .get(offset..offset + 4)
        .context("IDX header truncated")?;
    Ok(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

/// Parses an IDX buffer with unsigned-byte payload. Returns dims and data.
pub fn parse_idx(bytes: &[u8], expected_magic: u32) -> anyhow::Result<(Vec<usize>, Vec<u8>)> {
    let magic = read_u32(bytes, 0)?;
    ensure!(
        magic == expected_magic,
        "bad IDX magic {magic:#010x}, expected {expected_magic:#010x}"
    );

    let ndims = (magic & 0xff) as usize;
    let dims = (0..ndims)
        .map(|i| read_u32(bytes, 4 + 4 * i).map(|d| d as usize))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let header = 4 + 4 * ndims;
    let expected_len: usize = dims.iter().product();
    let payload = &bytes[header..];
    ensure!(
        payload.len() == expected_len,
        "IDX payload has {} bytes, dims {:?} need {}",
        payload.len(),
        dims,
        expected_len
    );
    Ok((dims, payload.to_vec()))
}

/// One MNIST split held in memory as raw bytes.
#[derive(Debug, Clone)]
pub struct MnistSplit {
    pub images: Vec<u8>,
    pub labels: Vec<u8>,
    pub rows: usize,
    pub cols: usize,
}

impl MnistSplit {
    /// Builds a split from raw pixels, checking that the shapes agree.
    pub fn new(images: Vec<u8>, labels: Vec<u8>, rows: usize, cols: usize) -> anyhow::Result<Self> {
        ensure!(rows * cols > 0, "image size must be positive");
        ensure!(
            images.len() == labels.len() * rows * cols,
            "{} pixels for {} labels of {rows}x{cols}",
            images.len(),
            labels.len()
        );
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= NUM_CLASSES) {
            bail!("label {bad} out of range");
        }
        Ok(Self {
            images,
            labels,
            rows,
            cols,
        })
    }

    /// Loads `split` from `dir`, accepting gzipped or plain IDX files.
    pub fn load<P: AsRef<Path>>(dir: P, split: Split) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let (image_stem, label_stem) = split.file_stems();
        let image_path = find_file(dir, image_stem)
            .with_context(|| format!("{image_stem} not found in {}", dir.display()))?;
        let label_path = find_file(dir, label_stem)
            .with_context(|| format!("{label_stem} not found in {}", dir.display()))?;

        let (image_dims, images) = parse_idx(&read_maybe_gz(&image_path)?, IMAGES_MAGIC)?;
        let (label_dims, labels) = parse_idx(&read_maybe_gz(&label_path)?, LABELS_MAGIC)?;
        ensure!(image_dims.len() == 3, "images must be 3-d, got {image_dims:?}");
        ensure!(
            label_dims[0] == image_dims[0],
            "{} labels for {} images",
            label_dims[0],
            image_dims[0]
        );

        let split_data = Self::new(images, labels, image_dims[1], image_dims[2])?;
        info!(?split, examples = split_data.len(), "loaded MNIST split");
        Ok(split_data)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn image_len(&self) -> usize {
        self.rows * self.cols
    }

    /// Gathers the examples at `indices` into one batch. Every index must be
    /// below [`MnistSplit::len`]; the batch iterators only produce such
    /// indices.
    #[must_use]
    pub(crate) fn batch(&self, indices: &[usize]) -> Batch {
        let size = self.image_len();
        let mut images = Vec::with_capacity(indices.len() * size);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            images.extend_from_slice(&self.images[i * size..(i + 1) * size]);
            labels.push(u32::from(self.labels[i]));
        }
        Batch {
            images,
            labels,
            rows: self.rows,
            cols: self.cols,
        }
    }

    /// Endless training batches: the split repeated, streamed through a
    /// shuffle buffer of `buffer` examples, then batched.
    pub fn train_batches(
        &self,
        batch_size: usize,
        buffer: usize,
        seed: u64,
    ) -> impl Iterator<Item = Batch> + '_ {
        let n = self.len();
        let indices = ShuffleBuffer::new((0..n).cycle(), buffer, seed);
        Batches {
            split: self,
            indices,
            batch_size,
            drop_remainder: true,
        }
    }

    /// One ordered pass in batches, dropping the incomplete last batch.
    pub fn eval_batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        Batches {
            split: self,
            indices: 0..self.len(),
            batch_size,
            drop_remainder: true,
        }
    }
}

struct Batches<'a, I> {
    split: &'a MnistSplit,
    indices: I,
    batch_size: usize,
    drop_remainder: bool,
}

impl<I: Iterator<Item = usize>> Iterator for Batches<'_, I> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let chunk: Vec<usize> = self.indices.by_ref().take(self.batch_size).collect();
        if chunk.is_empty() || (self.drop_remainder && chunk.len() < self.batch_size) {
            return None;
        }
        Some(self.split.batch(&chunk))
    }
}

/// Streaming shuffle: keeps `capacity` items and emits a random one each
/// time a new item arrives, so order is only randomized within the window.
pub struct ShuffleBuffer<I: Iterator> {
    source: I,
    buffer: Vec<I::Item>,
    capacity: usize,
    rng: oorandom::Rand32,
}

impl<I: Iterator> ShuffleBuffer<I> {
    pub fn new(source: I, capacity: usize, seed: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            source,
            buffer: Vec::with_capacity(capacity),
            capacity,
            rng: oorandom::Rand32::new(seed),
        }
    }
}

impl<I: Iterator> Iterator for ShuffleBuffer<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        while self.buffer.len() < self.capacity {
            match self.source.next() {
                Some(item) => self.buffer.push(item),
                None => break,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }
        let j = self.rng.rand_range(0..self.buffer.len() as u32) as usize;
        Some(self.buffer.swap_remove(j))
    }
}

/// A batch of images `[B, rows, cols, 1]` and integer labels `[B]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub images: Vec<u8>,
    pub labels: Vec<u32>,
    pub rows: usize,
    pub cols: usize,
}

impl Batch {
    /// Moves the batch to `device` as a `u8` image tensor and `u32` labels.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let images =
            Tensor::from_slice(&self.images, (self.labels.len(), self.rows, self.cols, 1), device)?;
        let labels = Tensor::from_slice(&self.labels, self.labels.len(), device)?;
        Ok((images, labels))
    }
}

impl BatchSize for Batch {
    fn batch_size(&self) -> usize {
        self.labels.len()
    }
}
