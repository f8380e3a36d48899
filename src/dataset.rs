//! Labeled video clips read lazily from a class-per-directory tree.
//!
//! ```text
//! <data>/
//! ├── ucfTrainTestlist/classInd.txt   "1 ApplyEyeMakeup" per line
//! └── videos/                          root_dir
//!     ├── ApplyEyeMakeup/**/*.gif
//!     └── ...
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use glob::{glob, Pattern};
use log::{debug, info};
use tch::Tensor;

use crate::config::DatasetConfig;
use crate::error::{Error, Result};
use crate::video::{self, ClipTransform, GifReader, VideoReader};

const CLASS_INDEX_DIR: &str = "ucfTrainTestlist";
const CLASS_INDEX_FILE: &str = "classInd.txt";

/// Source of `(clip, label)` pairs consumed by the discriminators.
pub trait LabeledVideoSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the clip `[3, T, 96, 96]` and its class index.
    fn get(&self, index: usize) -> Result<(Tensor, i64)>;
}

/// Parses lines of the form `<index> <ClassName>`.
pub fn load_class_index<P: AsRef<Path>>(path: P) -> Result<HashMap<String, i64>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let mut class_to_idx = HashMap::new();
    for (line_no, line) in text.lines().enumerate() {
        let mut fields = line.split_whitespace();
        let (index, name) = match (fields.next(), fields.next()) {
            (None, _) => continue,
            (Some(index), Some(name)) => (index, name),
            (Some(_), None) => {
                return Err(Error::Dataset(format!(
                    "{}:{}: expected \"<index> <class>\"",
                    path.display(),
                    line_no + 1
                )))
            }
        };
        let index = index.parse::<i64>().map_err(|err| {
            Error::Dataset(format!("{}:{}: {}", path.display(), line_no + 1, err))
        })?;
        class_to_idx.insert(name.to_string(), index);
    }
    Ok(class_to_idx)
}

pub fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    let name = path.to_string_lossy().to_lowercase();
    extensions.iter().any(|ext| name.ends_with(&ext.to_lowercase()))
}

/// Collects `(path, label)` for every file under `root/<class>` whose name
/// ends with one of `extensions`, classes and files in sorted order. An empty
/// extension list accepts every file.
pub fn make_dataset(
    root: &Path,
    class_to_idx: &HashMap<String, i64>,
    extensions: &[String],
) -> Result<Vec<(PathBuf, i64)>> {
    let mut classes = class_to_idx.iter().collect::<Vec<_>>();
    classes.sort();

    let mut samples = vec![];
    for (class, &index) in classes {
        let dir = root.join(class);
        if !dir.is_dir() {
            debug!("skipping missing class directory {}", dir.display());
            continue;
        }
        let pattern = PathBuf::from(Pattern::escape(&dir.to_string_lossy())).join("**").join("*");
        let mut paths = glob(&pattern.to_string_lossy())?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .filter(|path| extensions.is_empty() || has_allowed_extension(path, extensions))
            .collect::<Vec<_>>();
        paths.sort();
        samples.extend(paths.into_iter().map(|path| (path, index)));
    }
    Ok(samples)
}

pub struct LabeledVideoDataset {
    root_dir: PathBuf,
    class_to_idx: HashMap<String, i64>,
    samples: Vec<(PathBuf, i64)>,
    reader: Box<dyn VideoReader>,
    transform: Option<ClipTransform>,
    frame_counts: Mutex<HashMap<PathBuf, usize>>,
}

impl LabeledVideoDataset {
    /// Scans `config.root_dir` using the GIF reader.
    pub fn open(config: &DatasetConfig, transform: Option<ClipTransform>) -> Result<Self> {
        let class_index = match &config.class_index {
            Some(path) => path.clone(),
            None => default_class_index(&config.root_dir)?,
        };
        Self::new(
            &config.root_dir,
            &class_index,
            &config.extensions,
            Box::new(GifReader),
            transform,
        )
    }

    pub fn new(
        root_dir: &Path,
        class_index: &Path,
        extensions: &[String],
        reader: Box<dyn VideoReader>,
        transform: Option<ClipTransform>,
    ) -> Result<Self> {
        let class_to_idx = load_class_index(class_index)?;
        let samples = make_dataset(root_dir, &class_to_idx, extensions)?;
        info!(
            "found {} videos in {} classes under {}",
            samples.len(),
            class_to_idx.len(),
            root_dir.display()
        );
        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            class_to_idx,
            samples,
            reader,
            transform,
            frame_counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn class_to_idx(&self) -> &HashMap<String, i64> {
        &self.class_to_idx
    }

    pub fn samples(&self) -> &[(PathBuf, i64)] {
        &self.samples
    }

    /// Frame count of the video at `index`, read once and cached.
    pub fn frame_count(&self, index: usize) -> Result<usize> {
        let (path, _) = self.sample(index)?;
        if let Some(count) = self.cached_frame_count(path) {
            return Ok(count);
        }
        let count = self.reader.frame_count(path)?;
        self.record_frame_count(path, count);
        Ok(count)
    }

    /// Frame counts known so far.
    pub fn cached_frame_counts(&self) -> HashMap<PathBuf, usize> {
        self.lock_counts().clone()
    }

    fn sample(&self, index: usize) -> Result<&(PathBuf, i64)> {
        self.samples.get(index).ok_or_else(|| {
            Error::contract(format!(
                "index {index} out of range for {} samples",
                self.samples.len()
            ))
        })
    }

    fn cached_frame_count(&self, path: &Path) -> Option<usize> {
        self.lock_counts().get(path).copied()
    }

    fn record_frame_count(&self, path: &Path, count: usize) {
        self.lock_counts().insert(path.to_path_buf(), count);
    }

    fn lock_counts(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, usize>> {
        self.frame_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LabeledVideoSource for LabeledVideoDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<(Tensor, i64)> {
        let (path, label) = self.sample(index)?;
        let frames = self.reader.read(path)?;
        self.record_frame_count(path, frames.len());

        let clip = match &self.transform {
            Some(transform) => transform.apply(&frames)?,
            None => video::frames_to_clip(&frames)?,
        };
        Ok((clip, *label))
    }
}

fn default_class_index(root_dir: &Path) -> Result<PathBuf> {
    let parent = root_dir.parent().ok_or_else(|| {
        Error::Dataset(format!("{} has no parent directory", root_dir.display()))
    })?;
    Ok(parent.join(CLASS_INDEX_DIR).join(CLASS_INDEX_FILE))
}
