//! COCO-format dataset registration and loading.
//!
//! - [`DatasetCatalog`]: explicit `name -> (annotation json, image root)` registry, filled
//!   by the entry point instead of at load time
//! - [`register_custom_datasets`]: the custom datasets used for training
//! - [`DatasetCatalog::load`]: parse the annotation file into per-image records with
//!   contiguous category ids

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("dataset '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("dataset '{0}' is not registered")]
    NotRegistered(String),

    #[error("annotation {annotation} refers to unknown category {category}")]
    UnknownCategory { annotation: i64, category: i64 },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// COCO annotation format for ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub id: i64,
    pub image_id: i64,
    pub category_id: i64,
    /// Bbox in [x, y, width, height] format (xywh)
    pub bbox: [f32; 4],
    #[serde(default)]
    pub area: f32,
    #[serde(default)]
    pub iscrowd: i32,
}

/// COCO image info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: i64,
    pub width: u32,
    pub height: u32,
    pub file_name: String,
}

/// COCO category info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub supercategory: Option<String>,
}

/// COCO annotation file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoDataset {
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    pub categories: Vec<CocoCategory>,
}

impl CocoDataset {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_reader(std::io::BufReader::new(file)).map_err(|source| {
            DatasetError::Json {
                path: path.to_path_buf(),
                source,
            }
        })
    }
}

/// Object annotation of a record
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectAnnotation {
    /// Absolute `[x, y, width, height]`
    pub bbox: [f32; 4],
    /// Contiguous class index in `0..num_classes`
    pub category_id: usize,
    pub iscrowd: bool,
}

/// One image with its annotations
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRecord {
    /// Image path joined with the image root
    pub file_name: PathBuf,
    pub height: u32,
    pub width: u32,
    pub image_id: i64,
    pub annotations: Vec<ObjectAnnotation>,
}

/// Records of a dataset and its class metadata
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub records: Vec<DatasetRecord>,
    /// Class names in contiguous id order
    pub thing_classes: Vec<String>,
    /// Dataset category id of every contiguous id
    pub category_ids: Vec<i64>,
}

impl LoadedDataset {
    pub fn num_annotations(&self) -> usize {
        self.records.iter().map(|r| r.annotations.len()).sum()
    }
}

impl CocoDataset {
    /// Convert to per-image records, sorted by image id.
    ///
    /// Category ids are remapped to `0..K` in ascending order of the dataset ids.
    /// Annotations pointing at an unknown image are dropped with a warning.
    pub fn into_records(self, image_root: &Path) -> Result<LoadedDataset, DatasetError> {
        let mut categories = self.categories;
        categories.sort_by_key(|c| c.id);
        let contiguous: HashMap<i64, usize> = categories
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.id, idx))
            .collect();

        let mut images = self.images;
        images.sort_by_key(|img| img.id);
        let index: HashMap<i64, usize> = images
            .iter()
            .enumerate()
            .map(|(idx, img)| (img.id, idx))
            .collect();

        let mut records: Vec<DatasetRecord> = images
            .into_iter()
            .map(|img| DatasetRecord {
                file_name: image_root.join(&img.file_name),
                height: img.height,
                width: img.width,
                image_id: img.id,
                annotations: Vec::new(),
            })
            .collect();

        let mut dropped = 0usize;
        for ann in self.annotations {
            let category_id = match contiguous.get(&ann.category_id) {
                Some(&id) => id,
                None => {
                    return Err(DatasetError::UnknownCategory {
                        annotation: ann.id,
                        category: ann.category_id,
                    })
                }
            };
            match index.get(&ann.image_id) {
                Some(&idx) => records[idx].annotations.push(ObjectAnnotation {
                    bbox: ann.bbox,
                    category_id,
                    iscrowd: ann.iscrowd != 0,
                }),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            log::warn!("dropped {} annotations without a matching image", dropped);
        }

        Ok(LoadedDataset {
            records,
            thing_classes: categories.iter().map(|c| c.name.clone()).collect(),
            category_ids: categories.iter().map(|c| c.id).collect(),
        })
    }
}

/// Location of a COCO-format dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CocoInstances {
    pub json_file: PathBuf,
    pub image_root: PathBuf,
}

/// Registry of named datasets
#[derive(Debug, Default)]
pub struct DatasetCatalog {
    datasets: BTreeMap<String, CocoInstances>,
}

impl DatasetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a COCO-format dataset. Names must be unique.
    pub fn register_coco_instances(
        &mut self,
        name: &str,
        json_file: impl Into<PathBuf>,
        image_root: impl Into<PathBuf>,
    ) -> Result<(), DatasetError> {
        if self.datasets.contains_key(name) {
            return Err(DatasetError::AlreadyRegistered(name.to_string()));
        }
        let instances = CocoInstances {
            json_file: json_file.into(),
            image_root: image_root.into(),
        };
        log::debug!(
            "registered {} ({}, {})",
            name,
            instances.json_file.display(),
            instances.image_root.display()
        );
        self.datasets.insert(name.to_string(), instances);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&CocoInstances, DatasetError> {
        self.datasets
            .get(name)
            .ok_or_else(|| DatasetError::NotRegistered(name.to_string()))
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// Read the annotation file of `name` and build its records
    pub fn load(&self, name: &str) -> Result<LoadedDataset, DatasetError> {
        let instances = self.get(name)?;
        let coco = CocoDataset::from_json_file(&instances.json_file)?;
        let loaded = coco.into_records(&instances.image_root)?;
        log::info!(
            "loaded {}: {} images, {} annotations, {} categories",
            name,
            loaded.records.len(),
            loaded.num_annotations(),
            loaded.thing_classes.len()
        );
        Ok(loaded)
    }
}

/// Register the custom training datasets found under `root`.
///
/// | name | annotations | images |
/// |------|-------------|--------|
/// | `facemask_{train,val}` | `facemask/annotations/instances_{train,val}2017.json` | `facemask/{train,val}` |
/// | `tl_{train,val}` | `tl/annotations/annotations_coco_tls_{train,val_val}.json` | `tl/JPEGImages` |
/// | `visdrone_{train,val}` | `visdrone/visdrone_coco_anno/VisDrone2019-DET_{train,val}_coco.json` | `visdrone/VisDrone2019-DET-{train,val}/images` |
/// | `mask_{train,val}` | `wearmask/annotations/{train,val}.json` | `wearmask/images/{train,val}2017` |
/// | `voc_{train,val}` | `voc/annotations_coco_{train,val}_2012.json` | `voc/JPEGImages` |
pub fn register_custom_datasets(
    catalog: &mut DatasetCatalog,
    root: &Path,
) -> Result<(), DatasetError> {
    let facemask = root.join("facemask");
    let ann = facemask.join("annotations");
    catalog.register_coco_instances(
        "facemask_train",
        ann.join("instances_train2017.json"),
        facemask.join("train"),
    )?;
    catalog.register_coco_instances(
        "facemask_val",
        ann.join("instances_val2017.json"),
        facemask.join("val"),
    )?;

    let tl = root.join("tl");
    let ann = tl.join("annotations");
    catalog.register_coco_instances(
        "tl_train",
        ann.join("annotations_coco_tls_train.json"),
        tl.join("JPEGImages"),
    )?;
    catalog.register_coco_instances(
        "tl_val",
        ann.join("annotations_coco_tls_val_val.json"),
        tl.join("JPEGImages"),
    )?;

    let visdrone = root.join("visdrone");
    let ann = visdrone.join("visdrone_coco_anno");
    catalog.register_coco_instances(
        "visdrone_train",
        ann.join("VisDrone2019-DET_train_coco.json"),
        visdrone.join("VisDrone2019-DET-train/images"),
    )?;
    catalog.register_coco_instances(
        "visdrone_val",
        ann.join("VisDrone2019-DET_val_coco.json"),
        visdrone.join("VisDrone2019-DET-val/images"),
    )?;

    let wearmask = root.join("wearmask");
    let ann = wearmask.join("annotations");
    catalog.register_coco_instances(
        "mask_train",
        ann.join("train.json"),
        wearmask.join("images/train2017"),
    )?;
    catalog.register_coco_instances(
        "mask_val",
        ann.join("val.json"),
        wearmask.join("images/val2017"),
    )?;

    // VOC in COCO format keeps its annotation files at the dataset root
    let voc = root.join("voc");
    catalog.register_coco_instances(
        "voc_train",
        voc.join("annotations_coco_train_2012.json"),
        voc.join("JPEGImages"),
    )?;
    catalog.register_coco_instances(
        "voc_val",
        voc.join("annotations_coco_val_2012.json"),
        voc.join("JPEGImages"),
    )?;

    log::info!("registered custom datasets under {}", root.display());
    Ok(())
}
