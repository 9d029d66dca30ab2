use crate::config::{LabelsConfig, Validatable};
use serde::Serialize;
use std::{collections::HashMap, fs, path::Path};

pub const DEFAULT_LABELS: [&str; 3] = ["CLL", "FL", "MCL"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassInfo {
    pub full_name: &'static str,
    pub description: &'static str,
    pub characteristics: &'static str,
}

const UNKNOWN_CLASS: ClassInfo = ClassInfo {
    full_name: "Unknown",
    description: "No information available for this class.",
    characteristics: "Not specified.",
};

/// Reference information shown next to a prediction.
pub fn class_info(label: &str) -> ClassInfo {
    match label {
        "CLL" => ClassInfo {
            full_name: "Chronic Lymphocytic Leukemia",
            description: "CLL is a type of cancer that affects the blood and bone marrow. \
                It is the most common type of leukemia in adults.",
            characteristics: "Small, mature-appearing lymphocytes in the peripheral blood, \
                bone marrow, and lymphoid tissues.",
        },
        "FL" => ClassInfo {
            full_name: "Follicular Lymphoma",
            description: "FL is a type of non-Hodgkin lymphoma that begins in the lymphatic \
                system. It is typically a slow-growing or indolent form of lymphoma.",
            characteristics: "Abnormal growth of B cells in lymph nodes, resembling the \
                normal structure of follicles.",
        },
        "MCL" => ClassInfo {
            full_name: "Mantle Cell Lymphoma",
            description: "MCL is a rare type of B-cell non-Hodgkin lymphoma that affects \
                the lymph nodes and other tissues. It is typically aggressive.",
            characteristics: "Malignant B cells from the mantle zone of the lymph node \
                follicle.",
        },
        _ => UNKNOWN_CLASS,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelEntry {
    pub index: usize,
    pub label: String,
    pub info: ClassInfo,
}

#[derive(Debug, Clone)]
pub struct ServiceState {
    class_labels: Vec<String>,
}

impl ServiceState {
    pub fn new(labels_cfg: &LabelsConfig) -> Self {
        let path = labels_cfg.get_path();
        match load_class_labels(&path) {
            Some(labels) => {
                tracing::info!("Loaded {} class labels from {:?}", labels.len(), path);
                Self::from_labels(labels)
            }
            None => {
                tracing::warn!(
                    "Could not load class labels from {:?}, using defaults {:?}",
                    path,
                    DEFAULT_LABELS
                );
                Self::default()
            }
        }
    }

    pub fn from_labels(class_labels: Vec<String>) -> Self {
        Self { class_labels }
    }

    pub fn get_labels(&self) -> &Vec<String> {
        &self.class_labels
    }

    pub fn label_entries(&self) -> Vec<LabelEntry> {
        self.class_labels
            .iter()
            .enumerate()
            .map(|(index, label)| LabelEntry {
                index,
                label: label.clone(),
                info: class_info(label),
            })
            .collect()
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::from_labels(DEFAULT_LABELS.iter().map(|l| l.to_string()).collect())
    }
}

/// Reads a `{"label": index}` mapping and returns the labels ordered by index.
pub fn load_class_labels(filepath: &Path) -> Option<Vec<String>> {
    let contents = fs::read_to_string(filepath).ok()?;
    let class_indices: HashMap<String, usize> = serde_json::from_str(&contents).ok()?;

    let mut labels: Vec<Option<String>> = vec![None; class_indices.len()];
    for (label, index) in class_indices {
        let slot = labels.get_mut(index)?;
        if slot.is_some() {
            return None;
        }
        *slot = Some(label);
    }

    labels.into_iter().collect()
}
