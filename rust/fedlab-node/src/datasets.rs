use fedlab_core::DatasetDescriptor;

/// The datasets a node shares with researchers.
#[derive(Clone, Debug, Default)]
pub struct DatasetRegistry {
    datasets: Vec<DatasetDescriptor>,
}

impl DatasetRegistry {
    pub fn new(datasets: Vec<DatasetDescriptor>) -> Self {
        Self { datasets }
    }

    pub fn get(&self, dataset_id: &str) -> Option<&DatasetDescriptor> {
        self.datasets
            .iter()
            .find(|dataset| dataset.dataset_id == dataset_id)
    }

    /// Finds the datasets carrying every one of `tags`.
    pub fn search(&self, tags: &[String]) -> Vec<DatasetDescriptor> {
        self.datasets
            .iter()
            .filter(|dataset| dataset.has_tags(tags))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use fedlab_core::DataType;

    use super::*;

    fn dataset(id: &str, tags: &[&str]) -> DatasetDescriptor {
        DatasetDescriptor {
            dataset_id: id.into(),
            name: id.into(),
            tags: tags.iter().map(|tag| tag.to_string()).collect(),
            path: format!("/data/{}.csv", id).into(),
            data_type: DataType::Csv,
            shape: vec![10, 3],
            dtypes: vec!["float64".into(); 3],
            description: String::new(),
        }
    }

    #[test]
    fn test_search_requires_all_tags() {
        let registry = DatasetRegistry::new(vec![
            dataset("d1", &["heart", "csv"]),
            dataset("d2", &["heart"]),
            dataset("d3", &["mnist"]),
        ]);
        let found = registry.search(&["heart".into(), "csv".into()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].dataset_id, "d1");
        assert_eq!(registry.search(&["heart".into()]).len(), 2);
        assert!(registry.search(&["ecg".into()]).is_empty());
        assert_eq!(registry.get("d3").unwrap().tags, vec!["mnist".to_string()]);
        assert!(registry.get("d4").is_none());
    }
}
