//! Resolution of the datasets used by an experiment.
//!
//! A [`FederatedDataset`] maps every participating node to the one dataset it trains on. It is
//! resolved from a [`Catalog`] by tags, or given explicitly, and it is never mutated afterwards:
//! changing the training data of an experiment replaces the dataset as a whole.

use std::collections::{BTreeMap, BTreeSet};

use displaydoc::Display;
use thiserror::Error;

use fedround_core::NodeId;

/// Errors of a catalog.
pub type CatalogError = anyhow::Error;

/// Errors which can occur during the resolution of a federated dataset.
#[derive(Debug, Display, Error)]
pub enum DatasetError {
    /// {node} holds several datasets matching the query: {datasets:?}.
    Ambiguity { node: NodeId, datasets: Vec<String> },
    /// No node holds a dataset matching the query.
    NoMatch,
    /// The query has no tags.
    UndefinedQuery,
    /// The datasets are inconsistent: {0}.
    DataQuality(String),
    /// The catalog failed: {0}.
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The description of a dataset held by a node.
pub struct DatasetMetadata {
    pub dataset_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// The number of samples.
    pub sample_count: u64,
    /// The kind of data, e.g. `csv` or `images`.
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub shape: Vec<usize>,
    /// The column types of tabular data.
    #[serde(default)]
    pub dtypes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The dataset a node trains on.
pub struct NodeRecord {
    pub node_id: NodeId,
    pub dataset_id: String,
    pub sample_count: u64,
    /// Whether the node is currently available for training.
    pub available: bool,
    pub metadata: DatasetMetadata,
}

impl NodeRecord {
    fn new(node_id: NodeId, metadata: DatasetMetadata) -> Self {
        Self {
            node_id,
            dataset_id: metadata.dataset_id.clone(),
            sample_count: metadata.sample_count,
            available: true,
            metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// A query for the datasets of an experiment.
pub enum DatasetQuery {
    /// Every dataset carrying all of the tags.
    Tags(BTreeSet<String>),
    /// An explicit mapping from nodes to their datasets.
    Explicit(BTreeMap<NodeId, DatasetMetadata>),
}

#[derive(Debug, Clone, PartialEq)]
/// A query sent to a catalog.
pub struct CatalogQuery {
    /// The tags a dataset must carry.
    pub tags: BTreeSet<String>,
    /// The nodes to consult. Every known node is consulted if absent.
    pub nodes: Option<BTreeSet<NodeId>>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
/// The catalog of the datasets held by the nodes.
pub trait Catalog: Send + Sync + 'static {
    /// Lists the datasets matching the `query`, per node.
    ///
    /// # Behavior
    ///
    /// - Nodes without a matching dataset may be absent or map to an empty list.
    /// - A node holding several matching datasets lists all of them.
    async fn list_datasets(
        &self,
        query: &CatalogQuery,
    ) -> Result<BTreeMap<NodeId, Vec<DatasetMetadata>>, CatalogError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
/// The datasets of the nodes participating in an experiment.
pub struct FederatedDataset {
    records: BTreeMap<NodeId, NodeRecord>,
}

impl FederatedDataset {
    /// Resolves the datasets matching the `query`, restricted to the `nodes` filter if any.
    ///
    /// Nodes without a matching dataset are left out.
    ///
    /// # Errors
    /// Fails if a node holds more than one matching dataset, if no node holds a matching
    /// dataset at all, or if the catalog fails.
    pub async fn resolve(
        catalog: &dyn Catalog,
        query: &DatasetQuery,
        nodes: Option<&BTreeSet<NodeId>>,
    ) -> Result<Self, DatasetError> {
        let listing = match query {
            DatasetQuery::Tags(tags) => {
                if tags.is_empty() {
                    return Err(DatasetError::UndefinedQuery);
                }
                let catalog_query = CatalogQuery {
                    tags: tags.clone(),
                    nodes: nodes.cloned(),
                };
                catalog.list_datasets(&catalog_query).await?
            }
            DatasetQuery::Explicit(mapping) => mapping
                .iter()
                .map(|(node_id, metadata)| (node_id.clone(), vec![metadata.clone()]))
                .collect(),
        };
        Self::from_listing(listing, nodes)
    }

    fn from_listing(
        listing: BTreeMap<NodeId, Vec<DatasetMetadata>>,
        nodes: Option<&BTreeSet<NodeId>>,
    ) -> Result<Self, DatasetError> {
        let mut records = BTreeMap::new();
        for (node_id, mut datasets) in listing {
            if nodes.map_or(false, |nodes| !nodes.contains(&node_id)) {
                continue;
            }
            match datasets.len() {
                0 => debug!("{} holds no matching dataset", node_id),
                1 => {
                    let metadata = datasets.remove(0);
                    records.insert(node_id.clone(), NodeRecord::new(node_id, metadata));
                }
                _ => {
                    return Err(DatasetError::Ambiguity {
                        node: node_id,
                        datasets: datasets.into_iter().map(|d| d.dataset_id).collect(),
                    })
                }
            }
        }
        if records.is_empty() {
            return Err(DatasetError::NoMatch);
        }
        Ok(Self { records })
    }

    /// Gets the record of a node.
    pub fn get(&self, node_id: &NodeId) -> Option<&NodeRecord> {
        self.records.get(node_id)
    }

    /// Checks whether the node is part of the dataset.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.records.contains_key(node_id)
    }

    /// Iterates over the node ids in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.records.keys()
    }

    /// Iterates over the records in ascending node order.
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.values()
    }

    /// Gets the number of nodes.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Checks whether there are no nodes.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Creates a copy of the dataset in which the availability of `node_id` is changed.
    pub fn with_availability(&self, node_id: &NodeId, available: bool) -> Self {
        let mut records = self.records.clone();
        if let Some(record) = records.get_mut(node_id) {
            record.available = available;
        }
        Self { records }
    }

    /// Checks that the datasets of all nodes are of the same kind.
    ///
    /// Tabular (`csv`) datasets must also agree on their number of columns and on the column
    /// types. Image datasets of different shapes are accepted with a warning.
    pub fn check_data_quality(&self) -> Result<(), DatasetError> {
        let mut records = self.records.values();
        let first = match records.next() {
            Some(first) => &first.metadata,
            None => return Ok(()),
        };
        for record in records {
            let other = &record.metadata;
            if other.data_type != first.data_type {
                return Err(DatasetError::DataQuality(format!(
                    "{} holds {} data, expected {}",
                    record.node_id, other.data_type, first.data_type
                )));
            }
            match first.data_type.as_str() {
                "csv" => {
                    if other.shape.get(1) != first.shape.get(1) {
                        return Err(DatasetError::DataQuality(format!(
                            "{} holds a table of {:?} columns, expected {:?}",
                            record.node_id,
                            other.shape.get(1),
                            first.shape.get(1)
                        )));
                    }
                    if other.dtypes != first.dtypes {
                        return Err(DatasetError::DataQuality(format!(
                            "{} holds columns of types {:?}, expected {:?}",
                            record.node_id, other.dtypes, first.dtypes
                        )));
                    }
                }
                "images" if other.shape != first.shape => warn!(
                    "{} holds images of shape {:?}, other nodes hold {:?}",
                    record.node_id, other.shape, first.shape
                ),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn metadata(dataset_id: &str, sample_count: u64) -> DatasetMetadata {
        DatasetMetadata {
            dataset_id: dataset_id.into(),
            tags: vec!["mnist".into()],
            sample_count,
            data_type: "images".into(),
            shape: vec![sample_count as usize, 28, 28],
            dtypes: vec![],
        }
    }

    pub fn tags(tags: &[&str]) -> DatasetQuery {
        DatasetQuery::Tags(tags.iter().map(|t| t.to_string()).collect())
    }

    pub fn catalog(listing: Vec<(&str, Vec<DatasetMetadata>)>) -> MockCatalog {
        let listing: BTreeMap<NodeId, Vec<DatasetMetadata>> = listing
            .into_iter()
            .map(|(node_id, datasets)| (NodeId::from(node_id), datasets))
            .collect();
        let mut catalog = MockCatalog::new();
        catalog
            .expect_list_datasets()
            .returning(move |query| {
                Ok(listing
                    .iter()
                    .filter(|(node_id, _)| {
                        query.nodes.as_ref().map_or(true, |nodes| nodes.contains(node_id))
                    })
                    .map(|(node_id, datasets)| (node_id.clone(), datasets.clone()))
                    .collect())
            });
        catalog
    }

    #[tokio::test]
    async fn test_resolve_by_tags() {
        let catalog = catalog(vec![
            ("node-1", vec![metadata("d1", 100)]),
            ("node-2", vec![]),
            ("node-3", vec![metadata("d3", 50)]),
        ]);
        let dataset = FederatedDataset::resolve(&catalog, &tags(&["mnist"]), None)
            .await
            .unwrap();
        assert_eq!(
            dataset.node_ids().map(NodeId::as_str).collect::<Vec<_>>(),
            vec!["node-1", "node-3"]
        );
        let record = dataset.get(&NodeId::from("node-3")).unwrap();
        assert_eq!(record.dataset_id, "d3");
        assert_eq!(record.sample_count, 50);
        assert!(record.available);
    }

    #[tokio::test]
    async fn test_resolve_ambiguity() {
        let catalog = catalog(vec![
            ("node-1", vec![metadata("d1", 100)]),
            ("node-2", vec![metadata("d2", 10), metadata("d2-bis", 20)]),
        ]);
        match FederatedDataset::resolve(&catalog, &tags(&["mnist"]), None).await {
            Err(DatasetError::Ambiguity { node, datasets }) => {
                assert_eq!(node, NodeId::from("node-2"));
                assert_eq!(datasets, vec!["d2".to_string(), "d2-bis".to_string()]);
            }
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_no_match() {
        let catalog = catalog(vec![("node-1", vec![])]);
        assert!(matches!(
            FederatedDataset::resolve(&catalog, &tags(&["mnist"]), None).await,
            Err(DatasetError::NoMatch)
        ));
    }

    #[tokio::test]
    async fn test_resolve_without_tags() {
        let catalog = MockCatalog::new();
        assert!(matches!(
            FederatedDataset::resolve(&catalog, &tags(&[]), None).await,
            Err(DatasetError::UndefinedQuery)
        ));
    }

    #[tokio::test]
    async fn test_resolve_with_nodes_filter() {
        let catalog = catalog(vec![
            ("node-1", vec![metadata("d1", 100)]),
            ("node-2", vec![metadata("d2", 10), metadata("d2-bis", 20)]),
        ]);
        let nodes: BTreeSet<NodeId> = vec![NodeId::from("node-1")].into_iter().collect();
        let dataset = FederatedDataset::resolve(&catalog, &tags(&["mnist"]), Some(&nodes))
            .await
            .unwrap();
        assert_eq!(dataset.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_explicit() {
        let catalog = MockCatalog::new();
        let mapping = vec![(NodeId::from("node-7"), metadata("d7", 7))]
            .into_iter()
            .collect();
        let dataset =
            FederatedDataset::resolve(&catalog, &DatasetQuery::Explicit(mapping), None)
                .await
                .unwrap();
        assert_eq!(dataset.get(&NodeId::from("node-7")).unwrap().sample_count, 7);
    }

    #[test]
    fn test_with_availability_leaves_the_original_untouched() {
        let dataset = FederatedDataset::from_listing(
            vec![(NodeId::from("node-1"), vec![metadata("d1", 1)])]
                .into_iter()
                .collect(),
            None,
        )
        .unwrap();
        let node = NodeId::from("node-1");
        let unavailable = dataset.with_availability(&node, false);
        assert!(dataset.get(&node).unwrap().available);
        assert!(!unavailable.get(&node).unwrap().available);
    }

    #[test]
    fn test_data_quality() {
        let csv = |id: &str, columns: usize, dtypes: &[&str]| DatasetMetadata {
            dataset_id: id.into(),
            tags: vec![],
            sample_count: 10,
            data_type: "csv".into(),
            shape: vec![10, columns],
            dtypes: dtypes.iter().map(|d| d.to_string()).collect(),
        };
        let dataset = |datasets: Vec<DatasetMetadata>| {
            FederatedDataset::from_listing(
                datasets
                    .into_iter()
                    .enumerate()
                    .map(|(i, d)| (NodeId::new(format!("node-{}", i)), vec![d]))
                    .collect(),
                None,
            )
            .unwrap()
        };

        assert!(dataset(vec![csv("a", 2, &["int", "float"]), csv("b", 2, &["int", "float"])])
            .check_data_quality()
            .is_ok());
        assert!(dataset(vec![csv("a", 2, &["int", "float"]), csv("b", 3, &["int", "float"])])
            .check_data_quality()
            .is_err());
        assert!(dataset(vec![csv("a", 2, &["int", "float"]), csv("b", 2, &["int", "int"])])
            .check_data_quality()
            .is_err());
        assert!(dataset(vec![csv("a", 2, &["int", "float"]), metadata("b", 10)])
            .check_data_quality()
            .is_err());
        // images of different shapes only warn
        assert!(dataset(vec![metadata("a", 10), metadata("b", 20)])
            .check_data_quality()
            .is_ok());
    }
}
