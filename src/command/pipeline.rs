use std::fmt;

use bson::{Bson, Document};

use crate::error::{AggError, Result};

/// Database and collection an aggregation runs against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse a `db.collection` string as reported in cursor replies
    pub fn parse(full_name: &str) -> Option<Self> {
        let (database, collection) = full_name.split_once('.')?;
        if database.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(database, collection))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Terminal stage that writes results to a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStage {
    Out,
    Merge,
}

impl OutputStage {
    fn from_operator(op: &str) -> Option<Self> {
        match op {
            "$out" => Some(OutputStage::Out),
            "$merge" => Some(OutputStage::Merge),
            _ => None,
        }
    }
}

/// Ordered, non-empty sequence of aggregation stages
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    stages: Vec<Document>,
}

impl Pipeline {
    /// Create a pipeline
    ///
    /// # Returns
    /// * `Result<Self>` - `InvalidArgument` if `stages` is empty
    pub fn new(stages: Vec<Document>) -> Result<Self> {
        if stages.is_empty() {
            return Err(AggError::InvalidArgument(
                "pipeline must contain at least one stage".to_string(),
            ));
        }
        Ok(Self { stages })
    }

    pub fn into_stages(self) -> Vec<Document> {
        self.stages
    }

    pub fn stages(&self) -> &[Document] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the pipeline has no stages; never true for a constructed pipeline
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The terminal output stage, if the pipeline ends with one
    pub fn output_stage(&self) -> Option<OutputStage> {
        self.stages
            .last()
            .and_then(|stage| stage.keys().next())
            .and_then(|op| OutputStage::from_operator(op))
    }

    pub fn has_output_stage(&self) -> bool {
        self.output_stage().is_some()
    }

    /// Encode the stages as the command's `pipeline` array
    pub fn to_bson(&self) -> Bson {
        Bson::Array(self.stages.iter().cloned().map(Bson::Document).collect())
    }
}

impl TryFrom<Vec<Document>> for Pipeline {
    type Error = AggError;

    fn try_from(stages: Vec<Document>) -> Result<Self> {
        Pipeline::new(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_empty_pipeline_rejected() {
        assert!(matches!(
            Pipeline::new(vec![]),
            Err(AggError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_constructed_pipeline_is_never_empty() {
        let p = Pipeline::new(vec![doc! { "$limit": 1 }]).unwrap();
        assert_eq!(p.len(), 1);
        assert!(!p.is_empty());
        assert_eq!(p.into_stages(), vec![doc! { "$limit": 1 }]);
    }

    #[test]
    fn test_output_stage_detection() {
        let p = Pipeline::new(vec![doc! { "$match": { "a": 1 } }]).unwrap();
        assert_eq!(p.output_stage(), None);

        let p = Pipeline::new(vec![
            doc! { "$match": { "a": 1 } },
            doc! { "$out": "target" },
        ])
        .unwrap();
        assert_eq!(p.output_stage(), Some(OutputStage::Out));

        let p = Pipeline::new(vec![doc! { "$merge": { "into": "target" } }]).unwrap();
        assert_eq!(p.output_stage(), Some(OutputStage::Merge));

        // Only the last stage counts
        let p = Pipeline::new(vec![
            doc! { "$out": "target" },
            doc! { "$match": { "a": 1 } },
        ])
        .unwrap();
        assert!(!p.has_output_stage());
    }

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("shop.orders.archive").unwrap();
        assert_eq!(ns.database, "shop");
        assert_eq!(ns.collection, "orders.archive");
        assert_eq!(ns.to_string(), "shop.orders.archive");
        assert!(Namespace::parse("nodot").is_none());
        assert!(Namespace::parse(".coll").is_none());
    }
}
