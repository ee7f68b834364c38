#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use schematron::{
    AsyncHttpClient, CacheConfig, CompiledSchema, EngineConfig, HttpClientConfig, SchemaCache,
    SchemaLoader, ValidationEngine, compile_schema,
};
use tempfile::TempDir;

pub const ISO_NS: &str = "http://purl.oclc.org/dsdl/schematron";

/// Order checks: an abstract pattern instantiated for two element kinds, a
/// rule inheritance chain, diagnostics and two phases.
pub const ORDERS_SCHEMA: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<schema xmlns="http://purl.oclc.org/dsdl/schematron" queryBinding="xslt2" defaultPhase="structure">
  <title>Order checks</title>
  <ns prefix="o" uri="urn:example:orders"/>
  <let name="max-lines" value="3"/>

  <phase id="structure">
    <active pattern="order-ids"/>
    <active pattern="lines"/>
  </phase>
  <phase id="pricing">
    <active pattern="prices"/>
  </phase>

  <pattern abstract="true" id="identified">
    <rule context="$element">
      <assert id="has-id" test="exists(@$key)"><value-of select="local-name()"/> is not identified</assert>
    </rule>
  </pattern>

  <pattern id="order-ids" is-a="identified">
    <param name="element" value="o:order"/>
    <param name="key" value="number"/>
  </pattern>

  <pattern id="customer-ids" is-a="identified">
    <param name="element" value="o:customer"/>
    <param name="key" value="ref"/>
  </pattern>

  <pattern id="lines">
    <rule abstract="true" id="counted">
      <assert test="count(o:line) &gt; 0">order <value-of select="@number"/> has no lines</assert>
    </rule>
    <rule abstract="true" id="bounded">
      <extends rule="counted"/>
      <assert test="count(o:line) &lt;= $max-lines" diagnostics="too-many">order <value-of select="@number"/> has too many lines</assert>
    </rule>
    <rule context="o:order">
      <extends rule="bounded"/>
      <report test="count(distinct-values(o:line/@sku)) != count(o:line)">order <value-of select="@number"/> repeats a sku</report>
    </rule>
  </pattern>

  <pattern id="prices">
    <rule context="o:line">
      <let name="floor" value="../@min-price"/>
      <assert test="@price &gt;= $floor" role="warning">line <value-of select="@sku"/> is below the order floor</assert>
      <report test="lower-case(@currency) != @currency">currency <value-of select="@currency"/> should be lower case</report>
    </rule>
  </pattern>

  <diagnostics>
    <diagnostic id="too-many">Found <value-of select="count(o:line)"/> lines, the limit is <value-of select="$max-lines"/></diagnostic>
  </diagnostics>
</schema>"#;

pub const ORDERS_INSTANCE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<o:orders xmlns:o="urn:example:orders">
  <o:customer ref="c1"/>
  <o:customer/>
  <o:order number="1001" min-price="5">
    <o:line sku="a" price="10" currency="eur"/>
    <o:line sku="b" price="4" currency="EUR"/>
  </o:order>
  <o:order>
  </o:order>
  <o:order number="1003" min-price="1">
    <o:line sku="a" price="1" currency="usd"/>
    <o:line sku="a" price="1" currency="usd"/>
    <o:line sku="c" price="1" currency="usd"/>
    <o:line sku="d" price="1" currency="usd"/>
  </o:order>
</o:orders>"#;

/// Two single-assertion patterns, used by the file based tests.
pub const ITEMS_SCHEMA: &str = r#"<schema xmlns="http://purl.oclc.org/dsdl/schematron">
  <phase id="ids-only"><active pattern="ids"/></phase>
  <pattern id="ids">
    <rule context="item"><assert test="@id">item needs an id</assert></rule>
  </pattern>
  <pattern id="names">
    <rule context="item"><assert test="string-length(@name) &gt; 0">item needs a name</assert></rule>
  </pattern>
</schema>"#;

pub fn compiled(text: &str) -> Arc<CompiledSchema> {
    Arc::new(compile_schema(text).expect("schema should compile"))
}

/// Instance text referring to `href` through an xml-model instruction.
pub fn with_xml_model(href: &str, body: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<?xml-model href=\"{}\" schematypens=\"{}\"?>\n<doc>{}</doc>",
        href, ISO_NS, body
    )
}

pub fn write_file(dir: &Path, relative: &str, content: &str) -> PathBuf {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

/// Temporary tree with `rules.sch` at the top and a mix of instances:
///
/// ```text
/// rules.sch
/// valid.xml           references rules.sch, valid
/// invalid.xml         references rules.sch, two diagnostics
/// nested/deep.xml     references ../rules.sch, one diagnostic
/// unreferenced.xml    no xml-model instruction
/// notes.txt           not XML
/// ```
pub fn items_workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write_file(root, "rules.sch", ITEMS_SCHEMA);
    write_file(
        root,
        "valid.xml",
        &with_xml_model("rules.sch", "<item id='1' name='a'/>"),
    );
    write_file(
        root,
        "invalid.xml",
        &with_xml_model("rules.sch", "<item name='a'/><item id='2'/>"),
    );
    write_file(
        root,
        "nested/deep.xml",
        &with_xml_model("../rules.sch", "<item id='3'/>"),
    );
    write_file(root, "unreferenced.xml", "<doc><item/></doc>");
    write_file(root, "notes.txt", "not xml");
    dir
}

pub fn engine(config: EngineConfig) -> ValidationEngine {
    let cache = Arc::new(SchemaCache::new(CacheConfig::default()));
    let client = AsyncHttpClient::new(HttpClientConfig::default()).unwrap();
    ValidationEngine::new(Arc::new(SchemaLoader::new(cache, client)), config)
}
