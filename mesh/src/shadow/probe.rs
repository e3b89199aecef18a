//! Probes
//!
//! A probe reads an external data source and describes the objects a shadow
//! mesh base should contain. `ProbeDirectory` picks the probe for a source:
//! - API probes are matched by the longest identifier prefix
//! - otherwise the source is fetched as a `Document` and a document probe is
//!   matched by content type

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::{
    identifier::{MeshBaseIdentifier, MeshObjectIdentifier},
    model::{EntityTypeId, PropertyTypeId, PropertyValue, RoleTypeId},
};

pub type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no probe for data source {0}")]
    NoProbe(String),
    #[error("data source {0} is empty")]
    EmptyDataSource(String),
    #[error("probe failed on {data_source}: {reason}")]
    Failed { data_source: String, reason: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProbeError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeError::NoProbe(_) => "no_probe",
            ProbeError::EmptyDataSource(_) => "empty_data_source",
            ProbeError::Failed { .. } => "failed",
            ProbeError::Other(_) => "other",
        }
    }
}

/// One relationship as seen from the describing object
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRelationship {
    /// Local id of the neighbor within the shadow
    pub neighbor: String,
    pub roles: Vec<RoleTypeId>,
}

/// One object described by a probe, named by its local id within the shadow
///
/// The empty local id is the shadow's home object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeObject {
    pub local_id: String,
    pub types: Vec<EntityTypeId>,
    pub properties: BTreeMap<PropertyTypeId, PropertyValue>,
    pub relationships: Vec<ProbeRelationship>,
}

impl ProbeObject {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            ..Default::default()
        }
    }

    pub fn home() -> Self {
        Self::default()
    }

    pub fn blessed(mut self, entity_type: impl Into<EntityTypeId>) -> Self {
        self.types.push(entity_type.into());
        self
    }

    pub fn with_property(mut self, property: impl Into<PropertyTypeId>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(property.into(), value.into());
        self
    }

    pub fn related_to(mut self, neighbor: impl Into<String>, roles: Vec<RoleTypeId>) -> Self {
        self.relationships.push(ProbeRelationship {
            neighbor: neighbor.into(),
            roles,
        });
        self
    }

    pub fn identifier_in(&self, shadow: &MeshBaseIdentifier) -> MeshObjectIdentifier {
        MeshObjectIdentifier::new(shadow.clone(), self.local_id.clone())
    }
}

/// What one probe run produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeOutput {
    pub objects: Vec<ProbeObject>,
    /// The probe's own wish for when to run it again
    pub next_run: Option<Duration>,
}

impl ProbeOutput {
    pub fn new(objects: Vec<ProbeObject>) -> Self {
        Self {
            objects,
            next_run: None,
        }
    }
}

/// Raw content of a data source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Document {
    /// Content type without parameters, lower case
    pub fn media_type(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }
}

/// Reads a data source through its API
#[async_trait]
pub trait ApiProbe: Send + Sync {
    async fn read_from_api(&self, source: &MeshBaseIdentifier) -> ProbeResult<ProbeOutput>;
}

/// Interprets a fetched document
pub trait DocumentProbe: Send + Sync {
    fn parse_document(&self, source: &MeshBaseIdentifier, document: &Document) -> ProbeResult<ProbeOutput>;
}

/// Retrieves raw documents for sources without an API probe
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, source: &MeshBaseIdentifier) -> ProbeResult<Document>;
}

#[derive(Default)]
pub struct ProbeDirectory {
    api_probes: Vec<(String, Arc<dyn ApiProbe>)>,
    document_probes: HashMap<String, Arc<dyn DocumentProbe>>,
    fetcher: Option<Arc<dyn DocumentFetcher>>,
}

impl ProbeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_probe(mut self, prefix: impl Into<String>, probe: Arc<dyn ApiProbe>) -> Self {
        self.api_probes.push((prefix.into(), probe));
        self
    }

    pub fn with_document_probe(mut self, content_type: impl Into<String>, probe: Arc<dyn DocumentProbe>) -> Self {
        self.document_probes
            .insert(content_type.into().to_ascii_lowercase(), probe);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    fn api_probe_for(&self, source: &MeshBaseIdentifier) -> Option<&Arc<dyn ApiProbe>> {
        self.api_probes
            .iter()
            .filter(|(prefix, _)| source.as_str().starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, probe)| probe)
    }

    /// Whether some probe could handle `source`
    pub fn handles(&self, source: &MeshBaseIdentifier) -> bool {
        self.api_probe_for(source).is_some() || self.fetcher.is_some()
    }

    /// Runs the probe responsible for `source`
    pub async fn run(&self, source: &MeshBaseIdentifier) -> ProbeResult<ProbeOutput> {
        if let Some(probe) = self.api_probe_for(source) {
            debug!(%source, "Running API probe");
            return probe.read_from_api(source).await;
        }
        let Some(fetcher) = &self.fetcher else {
            return Err(ProbeError::NoProbe(source.to_string()));
        };
        let document = fetcher.fetch(source).await?;
        if document.bytes.is_empty() {
            return Err(ProbeError::EmptyDataSource(source.to_string()));
        }
        let media_type = document.media_type();
        let Some(probe) = self.document_probes.get(&media_type) else {
            return Err(ProbeError::NoProbe(format!("{source} ({media_type})")));
        };
        debug!(%source, %media_type, "Running document probe");
        probe.parse_document(source, &document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl ApiProbe for Named {
        async fn read_from_api(&self, _source: &MeshBaseIdentifier) -> ProbeResult<ProbeOutput> {
            Ok(ProbeOutput::new(vec![ProbeObject::new(self.0)]))
        }
    }

    struct Lines;

    impl DocumentProbe for Lines {
        fn parse_document(&self, _source: &MeshBaseIdentifier, document: &Document) -> ProbeResult<ProbeOutput> {
            let text = String::from_utf8(document.bytes.clone()).map_err(anyhow::Error::from)?;
            Ok(ProbeOutput::new(text.lines().map(ProbeObject::new).collect()))
        }
    }

    struct Fixed(Vec<u8>);

    #[async_trait]
    impl DocumentFetcher for Fixed {
        async fn fetch(&self, _source: &MeshBaseIdentifier) -> ProbeResult<Document> {
            Ok(Document {
                content_type: "Text/Plain; charset=utf-8".to_string(),
                bytes: self.0.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_longest_api_prefix_wins() {
        let directory = ProbeDirectory::new()
            .with_api_probe("api://", Arc::new(Named("short")))
            .with_api_probe("api://people/", Arc::new(Named("long")));
        let output = directory.run(&"api://people/1".into()).await.unwrap();
        assert_eq!(output.objects[0].local_id, "long");
        let output = directory.run(&"api://things/1".into()).await.unwrap();
        assert_eq!(output.objects[0].local_id, "short");
        assert!(matches!(
            directory.run(&"file://x".into()).await,
            Err(ProbeError::NoProbe(_))
        ));
    }

    #[tokio::test]
    async fn test_document_probe_by_media_type() {
        let directory = ProbeDirectory::new()
            .with_fetcher(Arc::new(Fixed(b"a\nb".to_vec())))
            .with_document_probe("text/plain", Arc::new(Lines));
        let output = directory.run(&"file://x".into()).await.unwrap();
        assert_eq!(output.objects.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_document() {
        let directory = ProbeDirectory::new()
            .with_fetcher(Arc::new(Fixed(Vec::new())))
            .with_document_probe("text/plain", Arc::new(Lines));
        let error = directory.run(&"file://x".into()).await.unwrap_err();
        assert_eq!(error.as_str(), "empty_data_source");
    }
}
