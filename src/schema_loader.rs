use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::debug;

use crate::cache::{CachedSchema, SchemaCache};
use crate::compiler::{CompiledSchema, compile};
use crate::error::{Result, ValidationError};
use crate::http_client::AsyncHttpClient;
use crate::parser::parse_schema;
use crate::schema::{ISO_NAMESPACE, SCHEMATRON_15_NAMESPACE};

static XML_MODEL_REGEX: OnceLock<Regex> = OnceLock::new();
static PSEUDO_ATTRIBUTE_REGEX: OnceLock<Regex> = OnceLock::new();

fn xml_model_regex() -> &'static Regex {
    XML_MODEL_REGEX.get_or_init(|| {
        Regex::new(r"<\?xml-model\s+((?s:.)*?)\?>").expect("xml-model regex is valid")
    })
}

fn pseudo_attribute_regex() -> &'static Regex {
    PSEUDO_ATTRIBUTE_REGEX.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
            .expect("pseudo-attribute regex is valid")
    })
}

/// Where an instance says its schema lives
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaReference {
    pub href: String,
    pub source: SchemaSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaSource {
    Local(PathBuf),
    Remote(String),
}

impl SchemaReference {
    /// Reference a schema given directly, e.g. on the command line.
    pub fn explicit(location: &str) -> Self {
        Self {
            href: location.to_string(),
            source: SchemaSource::resolve(location, Path::new(".")),
        }
    }

    /// Cache key for the resolved location.
    pub fn cache_key(&self) -> String {
        match &self.source {
            SchemaSource::Local(path) => format!("local:{}", path.display()),
            SchemaSource::Remote(url) => url.clone(),
        }
    }
}

impl SchemaSource {
    /// Resolve `href` relative to `base_dir` unless it is absolute or a URL.
    pub fn resolve(href: &str, base_dir: &Path) -> Self {
        if href.starts_with("http://") || href.starts_with("https://") {
            return SchemaSource::Remote(href.to_string());
        }
        let href = href.strip_prefix("file://").unwrap_or(href);
        let path = Path::new(href);
        if path.is_absolute() {
            SchemaSource::Local(normalize(path))
        } else {
            SchemaSource::Local(normalize(&base_dir.join(path)))
        }
    }
}

/// Drop `.` steps and fold `..` into the preceding step, without touching
/// the file system, so one schema gets one cache key however it is reached.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(normalized.components().next_back(), Some(Component::Normal(_))) {
                    normalized.pop();
                } else {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Text before the root element start tag.
fn prolog(text: &str) -> &str {
    let bytes = text.as_bytes();
    let mut search = 0;
    while let Some(offset) = text[search..].find('<') {
        let at = search + offset;
        match bytes.get(at + 1) {
            Some(b'?') | Some(b'!') => search = at + 1,
            _ => return &text[..at],
        }
    }
    text
}

/// Schematron `xml-model` processing instructions in an instance prolog.
///
/// A processing instruction counts when its `schematypens` is a Schematron
/// namespace, or when it has no `schematypens` and its `href` ends in
/// `.sch`.
pub fn extract_schema_references(text: &str, instance: &Path) -> Vec<SchemaReference> {
    let base_dir = instance.parent().unwrap_or(Path::new("."));
    let mut references = Vec::new();

    for pi in xml_model_regex().captures_iter(prolog(text)) {
        let mut href = None;
        let mut schematypens = None;
        for attr in pseudo_attribute_regex().captures_iter(&pi[1]) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .map(|m| m.as_str().to_string());
            match &attr[1] {
                "href" => href = value,
                "schematypens" => schematypens = value,
                _ => {}
            }
        }

        let Some(href) = href else { continue };
        let is_schematron = match schematypens.as_deref() {
            Some(ns) => ns == ISO_NAMESPACE || ns == SCHEMATRON_15_NAMESPACE,
            None => href.ends_with(".sch"),
        };
        if is_schematron {
            references.push(SchemaReference {
                source: SchemaSource::resolve(&href, base_dir),
                href,
            });
        }
    }

    references
}

/// Parse and compile schema text on the blocking pool.
async fn compile_text(text: String) -> Result<CompiledSchema> {
    tokio::task::spawn_blocking(move || -> Result<CompiledSchema> {
        let document = parse_schema(&text)?;
        Ok(compile(&document)?)
    })
    .await
    .map_err(|e| ValidationError::Concurrency {
        details: e.to_string(),
    })?
}

/// Loads, compiles and caches the schemas instances refer to.
pub struct SchemaLoader {
    cache: Arc<SchemaCache>,
    http_client: AsyncHttpClient,
}

impl SchemaLoader {
    pub fn new(cache: Arc<SchemaCache>, http_client: AsyncHttpClient) -> Self {
        Self { cache, http_client }
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    /// The first Schematron reference declared by an instance.
    pub fn reference_for(&self, text: &str, instance: &Path) -> Result<SchemaReference> {
        extract_schema_references(text, instance)
            .into_iter()
            .next()
            .ok_or_else(|| ValidationError::SchemaReferenceNotFound {
                file: instance.to_path_buf(),
            })
    }

    /// Compiled schema for a reference, loading it on a cache miss.
    pub async fn load(&self, reference: &SchemaReference) -> Result<Arc<CachedSchema>> {
        let key = reference.cache_key();
        self.cache
            .get_or_load(&key, || async {
                let text = self.read(&reference.source).await?;
                debug!(schema = %reference.href, bytes = text.len(), "compiling schema");
                compile_text(text).await
            })
            .await
    }

    async fn read(&self, source: &SchemaSource) -> Result<String> {
        match source {
            SchemaSource::Remote(url) => self.http_client.fetch_schema(url).await,
            SchemaSource::Local(path) => {
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::NotFound => ValidationError::SchemaNotFound {
                            url: path.display().to_string(),
                        },
                        _ => ValidationError::Io(e),
                    })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::http_client::HttpClientConfig;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const SCHEMA: &str = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
      <pattern><rule context="doc"><assert test="@id">id required</assert></rule></pattern>
    </schema>"#;

    fn loader() -> SchemaLoader {
        let cache = Arc::new(SchemaCache::new(CacheConfig::default()));
        let client = AsyncHttpClient::new(HttpClientConfig::default()).unwrap();
        SchemaLoader::new(cache, client)
    }

    #[test]
    fn test_extract_iso_reference() {
        let text = r#"<?xml version="1.0"?>
<?xml-model href="rules/doc.sch" type="application/xml"
            schematypens="http://purl.oclc.org/dsdl/schematron"?>
<doc/>"#;
        let refs = extract_schema_references(text, Path::new("/data/in/a.xml"));
        assert_eq!(
            refs,
            vec![SchemaReference {
                href: "rules/doc.sch".to_string(),
                source: SchemaSource::Local(PathBuf::from("/data/in/rules/doc.sch")),
            }]
        );
    }

    #[test]
    fn test_extract_skips_other_schema_languages() {
        let text = r#"<?xml-model href="doc.rng" schematypens="http://relaxng.org/ns/structure/1.0"?>
<?xml-model href='http://example.com/doc.sch'?>
<doc/>"#;
        let refs = extract_schema_references(text, Path::new("a.xml"));
        assert_eq!(refs.len(), 1);
        assert_eq!(
            refs[0].source,
            SchemaSource::Remote("http://example.com/doc.sch".to_string())
        );
    }

    #[test]
    fn test_relative_steps_are_folded() {
        assert_eq!(
            SchemaSource::resolve("../rules/./doc.sch", Path::new("/data/in")),
            SchemaSource::Local(PathBuf::from("/data/rules/doc.sch"))
        );
        assert_eq!(
            SchemaSource::resolve("../../doc.sch", Path::new("in")),
            SchemaSource::Local(PathBuf::from("../doc.sch"))
        );
    }

    #[test]
    fn test_processing_instructions_after_root_are_ignored() {
        let text = r#"<!-- prolog --><doc><?xml-model href="late.sch"?></doc>"#;
        assert!(extract_schema_references(text, Path::new("a.xml")).is_empty());
    }

    #[test]
    fn test_missing_reference() {
        let err = loader().reference_for("<doc/>", Path::new("a.xml")).unwrap_err();
        assert!(matches!(err, ValidationError::SchemaReferenceNotFound { .. }));
    }

    #[tokio::test]
    async fn test_load_local_schema_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.sch");
        std::fs::write(&path, SCHEMA).unwrap();

        let loader = loader();
        let reference = SchemaReference::explicit(path.to_str().unwrap());
        let first = loader.load(&reference).await.unwrap();
        let second = loader.load(&reference).await.unwrap();

        assert!(Arc::ptr_eq(&first.schema, &second.schema));
        assert_eq!(first.schema.patterns().len(), 1);
        assert_eq!(loader.cache().stats().await.hits, 1);
    }

    #[tokio::test]
    async fn test_missing_local_schema() {
        let dir = TempDir::new().unwrap();
        let reference = SchemaReference::explicit(dir.path().join("nope.sch").to_str().unwrap());
        let err = loader().load(&reference).await.unwrap_err();
        assert!(err.to_string().contains("Schema not found"));
    }

    #[tokio::test]
    async fn test_malformed_schema_is_a_schema_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.sch");
        std::fs::write(&path, "<schema xmlns='http://purl.oclc.org/dsdl/schematron'><pattern>").unwrap();
        let err = loader()
            .load(&SchemaReference::explicit(path.to_str().unwrap()))
            .await
            .unwrap_err();
        assert!(err.is_schema_error());
    }
}
